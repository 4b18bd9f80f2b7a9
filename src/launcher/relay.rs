use crate::model::{OutputStream, RunEvent};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// Read one child pipe to EOF, forwarding each line as it arrives.
///
/// Returns the captured text. Lines are split on `\n` with a trailing `\r`
/// stripped, and invalid UTF-8 is replaced rather than ending the stream.
pub(crate) async fn relay_lines<R>(
    pipe: R,
    stream: OutputStream,
    event_tx: mpsc::UnboundedSender<RunEvent>,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut captured = String::new();
    let mut raw = Vec::with_capacity(256);

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                if raw.last() == Some(&b'\n') {
                    raw.pop();
                }
                if raw.last() == Some(&b'\r') {
                    raw.pop();
                }
                let text = String::from_utf8_lossy(&raw).into_owned();
                captured.push_str(&text);
                captured.push('\n');
                // A closed receiver only means nobody is watching; keep draining the pipe.
                let _ = event_tx.send(RunEvent::Line { stream, text });
            }
            Err(e) => {
                tracing::warn!(?stream, error = %e, "read from child pipe failed");
                break;
            }
        }
    }

    captured
}
