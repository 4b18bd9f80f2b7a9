mod cli;
mod config;
mod launcher;
mod model;
mod orchestrator;
mod results;
mod summary;
#[cfg(feature = "tui")]
mod tui;
mod web;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Default log location while the TUI owns the terminal.
fn default_log_file() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("chameleon-panel")
        .join("panel.log")
}

/// Install the tracing subscriber. The returned guard flushes file logs on drop.
fn init_tracing(args: &cli::Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if args.is_tui() || args.log_file.is_some() {
        let path = args.log_file.clone().unwrap_or_else(default_log_file);
        let dir = path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "panel.log".into());
        let _ = std::fs::create_dir_all(&dir);
        let appender = tracing_appender::rolling::never(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .try_init()
            .ok();
        return Some(guard);
    }

    // Headless modes keep stdout for results; logs stay quiet unless asked for.
    let filter = if args.is_headless() && std::env::var_os("RUST_LOG").is_none() {
        EnvFilter::new("warn")
    } else {
        filter
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_silent = args.silent;
    let is_non_tui = args.is_headless();
    let log_guard = init_tracing(&args);

    let res = cli::run(args).await;
    drop(log_guard);

    match res {
        Ok(()) => {
            // Explicitly exit with code 0 on success, especially for non-TUI modes
            if is_non_tui {
                std::process::exit(0);
            }
            Ok(())
        }
        Err(e) => {
            if e.downcast_ref::<cli::RunFailed>().is_some() {
                std::process::exit(1);
            }
            if is_silent {
                println!("{:#}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
