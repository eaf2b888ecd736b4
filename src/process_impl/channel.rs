use super::{Channel, ChannelEvent, Error};

use async_trait::async_trait;

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;

/// Counts a channel as open for as long as it is alive.
#[derive(Debug)]
struct OpenGuard(Arc<AtomicUsize>);

impl OpenGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

type Event = Result<ChannelEvent, Error>;

/// A channel backed by one local `ssh` process talking through the control socket.
#[derive(Debug)]
pub(crate) struct ProcessChannel {
    stdin: Option<ChildStdin>,
    events: mpsc::UnboundedReceiver<Event>,
    pid: Option<u32>,
    pty: bool,
    closed: bool,
    _open: OpenGuard,
}

impl ProcessChannel {
    /// `pty` is whether the channel asked for a pseudo-terminal; only then is a refusal
    /// reported as [`Error::NoPty`].
    pub(crate) fn spawn(
        mut child: Child,
        pty: bool,
        ctl_path: Box<Path>,
        counter: Arc<AtomicUsize>,
    ) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let pid = child.id();
        let stdin = child.stdin.take();

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(pump(out, tx.clone(), ChannelEvent::Stdout)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(pump(err, tx.clone(), ChannelEvent::Stderr)));

        tokio::spawn(async move {
            for reader in [stdout, stderr].into_iter().flatten() {
                let _ = reader.await;
            }
            let _ = tx.send(Ok(ChannelEvent::Eof));

            let event = match child.wait().await {
                Err(e) => Err(Error::ChildIo(e)),
                // 255 is also what ssh exits with when the master is gone.
                Ok(status) if status.code() == Some(255) && !ctl_path.exists() => {
                    Err(Error::Disconnected)
                }
                Ok(status) => match status.code() {
                    Some(code) => Ok(ChannelEvent::ExitStatus(code)),
                    None => Ok(ChannelEvent::ExitSignal(signal_of(&status))),
                },
            };
            let _ = tx.send(event);
            let _ = tx.send(Ok(ChannelEvent::Closed));
        });

        Self {
            stdin,
            events,
            pid,
            pty,
            closed: false,
            _open: OpenGuard::new(counter),
        }
    }
}

async fn pump<R>(
    mut reader: R,
    tx: mpsc::UnboundedSender<Event>,
    wrap: fn(Vec<u8>) -> ChannelEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => {
                if tx.send(Ok(wrap(buf[..n].to_vec()))).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(Error::ChildIo(e)));
                return;
            }
        }
    }
}

#[cfg(unix)]
fn signal_of(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .and_then(crate::rap::signal_name)
        .unwrap_or("UNKNOWN")
        .to_owned()
}

#[cfg(not(unix))]
fn signal_of(_status: &std::process::ExitStatus) -> String {
    String::from("UNKNOWN")
}

#[async_trait]
impl Channel for ProcessChannel {
    async fn next_event(&mut self, wait: Duration) -> Result<Option<ChannelEvent>, Error> {
        if self.closed {
            return Ok(Some(ChannelEvent::Closed));
        }

        let event = match tokio::time::timeout(wait, self.events.recv()).await {
            Err(_elapsed) => return Ok(None),
            Ok(None) => ChannelEvent::Closed,
            Ok(Some(event)) => event?,
        };

        match event {
            ChannelEvent::Closed => self.closed = true,
            ChannelEvent::Stderr(ref data) if self.pty && refused_pty(data) => {
                return Err(Error::NoPty)
            }
            _ => {}
        }
        Ok(Some(event))
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            Error::ChildIo(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stdin already closed",
            ))
        })?;
        stdin.write_all(data).await.map_err(Error::ChildIo)?;
        stdin.flush().await.map_err(Error::ChildIo)
    }

    async fn eof(&mut self) -> Result<(), Error> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await.map_err(Error::ChildIo)?;
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

fn refused_pty(stderr: &[u8]) -> bool {
    String::from_utf8_lossy(stderr).contains("PTY allocation request failed")
}
