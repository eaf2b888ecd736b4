use super::channel::ProcessChannel;
use super::{Channel, ChannelRequest, Error, LocalForward, Transport};

use async_trait::async_trait;

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio::process;
use tracing::{debug, trace};

/// A ControlMaster session to one host, run by the system `ssh` client.
///
/// Every channel is a separate `ssh` process multiplexed over the master's control socket.
#[derive(Debug)]
pub struct Session {
    ctl: Mutex<Option<TempDir>>,
    ctl_path: Box<Path>,
    addr: Box<str>,
    master_log: Box<Path>,
    open_channels: Arc<AtomicUsize>,
}

impl Session {
    pub(crate) fn new(ctl: TempDir, addr: &str) -> Self {
        let log = ctl.path().join("log").into_boxed_path();
        let ctl_path = ctl.path().join("master").into_boxed_path();

        Self {
            ctl: Mutex::new(Some(ctl)),
            ctl_path,
            addr: addr.into(),
            master_log: log,
            open_channels: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn new_std_cmd(&self, args: &[impl AsRef<OsStr>]) -> std::process::Command {
        let mut cmd = std::process::Command::new("ssh");
        cmd.stdin(Stdio::null())
            .arg("-S")
            .arg(&*self.ctl_path)
            .arg("-o")
            .arg("BatchMode=yes")
            .args(args)
            .arg(&*self.addr);
        cmd
    }

    fn new_cmd(&self, args: &[impl AsRef<OsStr>]) -> process::Command {
        self.new_std_cmd(args).into()
    }

    /// Ask the master whether it is still alive (`ssh -O check`).
    pub async fn check(&self) -> Result<(), Error> {
        let check = self
            .new_cmd(&["-O", "check"])
            .output()
            .await
            .map_err(Error::Ssh)?;

        if let Some(255) = check.status.code() {
            Err(self.discover_master_error().unwrap_or(Error::Disconnected))
        } else {
            Ok(())
        }
    }

    async fn control(&self, op: &str, forward: &LocalForward) -> Result<(), Error> {
        let spec = forward.to_string();
        let out = self
            .new_cmd(&["-O", op, "-L", spec.as_str()])
            .output()
            .await
            .map_err(Error::Ssh)?;

        if out.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&out.stderr);
        let err = stderr.trim();
        if err.is_empty() {
            if let Some(master_error) = self.discover_master_error() {
                return Err(master_error);
            }
        }
        Err(Error::Ssh(io::Error::new(io::ErrorKind::Other, err)))
    }

    fn discover_master_error(&self) -> Option<Error> {
        let err = match fs::read_to_string(&self.master_log) {
            Ok(err) => err,
            Err(e) => return Some(Error::Master(e)),
        };
        let stderr = crate::error::strip_noise(&err);

        if stderr.is_empty() {
            return None;
        }

        let kind = if stderr.contains("Connection to") && stderr.contains("closed by remote host") {
            io::ErrorKind::ConnectionAborted
        } else {
            io::ErrorKind::Other
        };

        Some(Error::Master(io::Error::new(kind, stderr)))
    }

    fn take_ctl(&self) -> Option<TempDir> {
        self.ctl
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn is_closed(&self) -> bool {
        self.ctl
            .lock()
            .map(|ctl| ctl.is_none())
            .unwrap_or(true)
    }
}

#[async_trait]
impl Transport for Session {
    async fn open_channel(&self, request: ChannelRequest) -> Result<Box<dyn Channel>, Error> {
        if self.is_closed() {
            return Err(Error::Disconnected);
        }

        // -p 9 (the "discard" port) makes sure ssh does not quietly open a _new_ connection
        // if the master has gone away.
        let tty = if request.pty { "-tt" } else { "-T" };
        let mut cmd = self.new_cmd(&[tty, "-p", "9"]);
        if let Some(ref command) = request.command {
            cmd.arg("--").arg(command);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        trace!(addr = &*self.addr, command = ?request.command, pty = request.pty, "opening channel");
        let child = cmd.spawn().map_err(Error::Ssh)?;
        Ok(Box::new(ProcessChannel::spawn(
            child,
            request.pty,
            self.ctl_path.clone(),
            Arc::clone(&self.open_channels),
        )))
    }

    async fn forward_local(&self, forward: &LocalForward) -> Result<(), Error> {
        debug!(addr = &*self.addr, %forward, "requesting local forward");
        self.control("forward", forward).await
    }

    async fn cancel_forward(&self, forward: &LocalForward) -> Result<(), Error> {
        debug!(addr = &*self.addr, %forward, "cancelling local forward");
        self.control("cancel", forward).await
    }

    async fn process(&self) -> Result<(), Error> {
        // the master services forwards on its own; all that is left is noticing its death.
        if self.is_closed() {
            return Err(Error::Disconnected);
        }
        if self.ctl_path.exists() {
            Ok(())
        } else {
            Err(self.discover_master_error().unwrap_or(Error::Disconnected))
        }
    }

    fn busy(&self) -> bool {
        self.open_channels.load(Ordering::SeqCst) > 0
    }

    async fn close(&self) -> Result<(), Error> {
        // taking ctl makes drop a no-op
        let ctl = match self.take_ctl() {
            Some(ctl) => ctl,
            None => return Ok(()),
        };

        let exit = self
            .new_cmd(&["-O", "exit"])
            .output()
            .await
            .map_err(Error::Ssh)?;

        if let Some(master_error) = self.discover_master_error() {
            if !matches!(master_error, Error::Master(ref e) if e.kind() == io::ErrorKind::ConnectionAborted)
            {
                return Err(master_error);
            }
        }

        // -O exit can fail when the remote end already closed the connection cleanly.
        // we were asked to close it, so that is not an error.
        if !exit.status.success() {
            let exit_err = String::from_utf8_lossy(&exit.stderr);
            debug!(addr = &*self.addr, error = exit_err.trim(), "ssh -O exit failed");
        }

        ctl.close().map_err(Error::Cleanup)?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // keep the tempdir alive until the master has been told to exit
        let _ctl = match self.take_ctl() {
            Some(ctl) => ctl,
            None => return,
        };

        let _res = self
            .new_std_cmd(&["-O", "exit"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}
