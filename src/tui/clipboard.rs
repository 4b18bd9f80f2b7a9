use anyhow::Result;
use std::sync::mpsc as std_mpsc;
use std::sync::OnceLock;
use std::time::Duration;

/// How long each clipboard owner stays alive so clipboard managers can pick up the text.
const HOLD_FOR: Duration = Duration::from_secs(2);

static CLIPBOARD_TX: OnceLock<std_mpsc::Sender<String>> = OnceLock::new();

/// Sender to the thread that serializes clipboard writes, started on first use.
fn clipboard_worker() -> &'static std_mpsc::Sender<String> {
    CLIPBOARD_TX.get_or_init(|| {
        let (tx, rx) = std_mpsc::channel::<String>();
        std::thread::spawn(move || {
            for text in rx {
                // On X11/Wayland the selection disappears with its owner.
                match arboard::Clipboard::new() {
                    Ok(mut clipboard) => {
                        if let Err(e) = clipboard.set_text(&text) {
                            tracing::warn!(error = %e, "clipboard write failed");
                            continue;
                        }
                        std::thread::sleep(HOLD_FOR);
                    }
                    Err(e) => tracing::warn!(error = %e, "clipboard unavailable"),
                }
            }
        });
        tx
    })
}

/// Queue `text` for the clipboard without blocking the UI thread.
pub fn copy_to_clipboard(text: &str) -> Result<()> {
    clipboard_worker()
        .send(text.to_string())
        .map_err(|_| anyhow::anyhow!("clipboard worker stopped"))
}

/// Shorten long paths for the status line, keeping the file name end.
pub fn shorten_for_status(path: &str, max: usize) -> String {
    let count = path.chars().count();
    if count <= max || max < 4 {
        return path.to_string();
    }
    let tail: String = path.chars().skip(count - (max - 1)).collect();
    format!("…{tail}")
}
