use anyhow::{Context, Result};
use futures_util::Stream;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 256;

/// Lines from a followed container log.
///
/// Ends when the log process closes its output. Dropping the stream kills the
/// underlying process.
pub struct LogStream {
    rx: mpsc::Receiver<String>,
}

impl LogStream {
    /// Spawn `cmd` and stream its stdout and stderr line by line.
    pub fn spawn(mut cmd: Command, label: &str) -> Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn log follower for {}", label))?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx.clone()));
        }

        let label = label.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {
                    let _ = child.kill().await;
                    tracing::debug!("log consumer for {} went away, follower killed", label);
                }
                status = child.wait() => {
                    tracing::debug!("log follower for {} exited: {:?}", label, status);
                }
            }
        });

        Ok(Self { rx })
    }

    /// A finished stream over fixed lines.
    #[cfg(test)]
    pub fn from_lines(lines: Vec<String>) -> Self {
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            let _ = tx.try_send(line);
        }
        Self { rx }
    }

    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Stream for LogStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<String>> {
        self.rx.poll_recv(cx)
    }
}

/// Forward lines until EOF or until the receiver is gone. Undecodable bytes
/// become U+FFFD.
async fn pump<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("log pipe read failed: {}", e);
                break;
            }
        }
    }
}
