//! The seam between this crate and whatever actually speaks to remote hosts.
//!
//! Everything above this module (runners, transfers, hops, targets) only sees these traits.
//! The default implementation lives in the `process-mux` backend and drives the system
//! OpenSSH client.

use super::{Error, KnownHosts, LocalForward};

use async_trait::async_trait;
use secrecy::SecretString;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// One event read from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes written to the remote process' standard output.
    Stdout(Vec<u8>),
    /// Bytes written to the remote process' standard error.
    Stderr(Vec<u8>),
    /// The remote process exited with this status.
    ExitStatus(i32),
    /// The remote process was killed by this signal (name without `SIG`).
    ExitSignal(String),
    /// The remote side will send no more data.
    Eof,
    /// The channel is gone. No more events will follow.
    Closed,
}

/// What to open a channel for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Command to execute. `None` asks for a login shell.
    pub command: Option<String>,
    /// Ask the remote side for a pseudo-terminal.
    pub pty: bool,
}

impl ChannelRequest {
    /// Execute `command` without a pty.
    pub fn exec(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            pty: false,
        }
    }

    /// A login shell on a pty.
    pub fn shell() -> Self {
        Self {
            command: None,
            pty: true,
        }
    }

    /// A login shell fed from stdin without a pty, so input is not echoed back and stdout
    /// and stderr stay apart.
    pub fn script() -> Self {
        Self {
            command: None,
            pty: false,
        }
    }
}

/// One multiplexed stream within a connection.
#[async_trait]
pub trait Channel: Send + fmt::Debug {
    /// Wait up to `wait` for the next event.
    ///
    /// `Ok(None)` means nothing arrived in time. After [`ChannelEvent::Closed`] has been
    /// returned, every further call returns `Ok(Some(ChannelEvent::Closed))`.
    async fn next_event(&mut self, wait: Duration) -> Result<Option<ChannelEvent>, Error>;

    /// Write to the remote process' standard input.
    async fn write(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Close the remote process' standard input.
    async fn eof(&mut self) -> Result<(), Error>;

    /// Local process id backing this channel, if there is one.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// An established, authenticated session to one host.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Open a new channel.
    async fn open_channel(&self, request: ChannelRequest) -> Result<Box<dyn Channel>, Error>;

    /// Listen on `127.0.0.1:<forward.local_port>` and forward every connection to
    /// `forward.host:forward.port` as seen from the remote host.
    async fn forward_local(&self, forward: &LocalForward) -> Result<(), Error>;

    /// Undo [`Transport::forward_local`].
    async fn cancel_forward(&self, forward: &LocalForward) -> Result<(), Error>;

    /// Service pending protocol work, and report whether the session is still alive.
    async fn process(&self) -> Result<(), Error>;

    /// `true` while any channel is open.
    fn busy(&self) -> bool;

    /// Tear the session down.
    async fn close(&self) -> Result<(), Error>;
}

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Host name or address to connect to.
    pub host: String,
    /// Remote port; `None` defers to ssh configuration.
    pub port: Option<u16>,
    /// Login user; `None` defers to ssh configuration.
    pub user: Option<String>,
    /// Private keys to offer.
    pub keys: Vec<PathBuf>,
    /// Password to try, if key authentication is not enough.
    pub password: Option<SecretString>,
    /// Host key policy.
    pub known_hosts: KnownHosts,
    /// Give up connecting after this long.
    pub connect_timeout: Option<Duration>,
    /// Name to check the host key against, when `host` is a forwarded local port.
    pub host_key_alias: Option<String>,
}

impl ConnectParams {
    /// Connect to `host` with every other setting at its default.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            user: None,
            keys: Vec::new(),
            password: None,
            known_hosts: KnownHosts::Add,
            connect_timeout: None,
            host_key_alias: None,
        }
    }
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Establish a session described by `params`.
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Transport>, Error>;
}
