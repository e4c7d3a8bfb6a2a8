//! Background tasks moving bytes into and diagnostics out of child processes.

use std::io::ErrorKind;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::source::ByteStream;

/// Log level for a child's stderr lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrLevel {
    Warn,
    Debug,
}

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
pub struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self(handle)
    }

    /// Aborts the task now.
    pub fn abort(&self) {
        self.0.abort();
    }

    /// Whether the task has finished.
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    /// Waits for the task, yielding `None` if it panicked or was aborted.
    pub async fn join(mut self) -> Option<T> {
        (&mut self.0).await.ok()
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawns the input pump that feeds `source` into a child's stdin.
///
/// Reads and writes one chunk at a time, so the child's read rate bounds how
/// fast the source is consumed. Stdin is closed when the source ends, which
/// signals EOF to the child. A broken pipe means the child stopped reading;
/// it is logged at debug level and the pump finishes successfully with the
/// number of bytes written so far. Aborting the task drops the source reader.
pub fn spawn_input_pump(
    mut source: ByteStream,
    mut stdin: ChildStdin,
    chunk_size: usize,
    label: String,
) -> JoinHandle<std::io::Result<u64>> {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; chunk_size.max(1)];
        let mut written = 0u64;

        loop {
            let n = match source.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("{} input pump failed reading source: {}", label, e);
                    return Err(e);
                }
            };

            match stdin.write_all(&buffer[..n]).await {
                Ok(()) => written += n as u64,
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!(
                        "{} closed its input after {} bytes (broken pipe)",
                        label, written
                    );
                    return Ok(written);
                }
                Err(e) => {
                    warn!("{} input pump failed writing: {}", label, e);
                    return Err(e);
                }
            }
        }

        // Closing stdin signals EOF to the child
        if let Err(e) = stdin.shutdown().await
            && e.kind() != ErrorKind::BrokenPipe
        {
            debug!("{} stdin shutdown failed: {}", label, e);
        }
        drop(stdin);
        trace!("{} input pump finished after {} bytes", label, written);
        Ok(written)
    })
}

/// Spawns a reader that logs every non-empty stderr line of a child.
///
/// Draining stderr keeps the child from blocking on a full pipe.
pub fn spawn_stderr_logger(
    stderr: ChildStderr,
    label: String,
    level: StderrLevel,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match level {
                        StderrLevel::Warn => warn!("{} stderr: {}", label, line),
                        StderrLevel::Debug => debug!("{} stderr: {}", label, line),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("{} stderr unreadable: {}", label, e);
                    break;
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Cursor;
    use std::process::Stdio;

    use tokio::process::Command;

    use super::*;

    #[tokio::test]
    async fn test_pump_feeds_all_bytes() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("wc -c")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();

        let stdin = child.stdin.take().unwrap();
        let source: ByteStream = Box::pin(Cursor::new(vec![7u8; 300_000]));
        let pump = spawn_input_pump(source, stdin, 4096, "wc".to_string());

        assert_eq!(pump.await.unwrap().unwrap(), 300_000);
        let output = child.wait_with_output().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "300000");
    }

    #[tokio::test]
    async fn test_pump_tolerates_broken_pipe() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("exit 0")
            .stdin(Stdio::piped())
            .spawn()
            .unwrap();

        let stdin = child.stdin.take().unwrap();
        child.wait().await.unwrap();

        let source: ByteStream = Box::pin(Cursor::new(vec![0u8; 4 * 1024 * 1024]));
        let pump = spawn_input_pump(source, stdin, 64 * 1024, "exited".to_string());
        let written = pump.await.unwrap().unwrap();
        assert!(written < 4 * 1024 * 1024);
    }
}
