//! NDJSON plumbing between the process stdio and a running session.

use chanmux_core::ndjson::{encode_line, parse_command};
use chanmux_core::{Command, Notification};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Read command lines from `input` and forward them to the session.
///
/// Malformed lines are logged and skipped. Returns the number of commands
/// forwarded once `input` hits EOF or the session stops accepting commands.
pub async fn forward_commands<R>(
    input: R,
    commands: mpsc::Sender<Command>,
) -> chanmux_core::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut forwarded = 0;
    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Skipping malformed command line");
                continue;
            }
        };
        if commands.send(command).await.is_err() {
            debug!("Session stopped accepting commands");
            break;
        }
        forwarded += 1;
    }
    Ok(forwarded)
}

/// Write one notification as a line and flush.
pub async fn write_notification<W>(
    out: &mut W,
    notification: &Notification,
) -> chanmux_core::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = encode_line(notification)?;
    line.push('\n');
    out.write_all(line.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}
