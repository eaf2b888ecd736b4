use super::Rap;

use std::fmt;
use std::io;

/// Errors that occur when connecting to, or running commands on, a target.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// No destination host was configured.
    NoHost,

    /// An operation was dispatched to a [`Set`](crate::Set) with no targets.
    NoTargets,

    /// A command was attempted without a live connection, and reconnecting failed.
    NotConnected(String),

    /// The command is not in the whitelist, or the remote side could not find it.
    CommandNotFound(String),

    /// A pseudo-terminal was requested and the remote side refused it.
    NoPty,

    /// A password prompt was seen but no secret could be obtained.
    NoPassword,

    /// The remote command completed with a failing exit status.
    ///
    /// The boxed [`Rap`] carries the full output of the failed command.
    Command(Box<Rap>),

    /// The host presented a key that does not match the known hosts file.
    HostKeyMismatch(String),

    /// The remote host rejected every offered credential.
    AuthenticationFailed(String),

    /// The master connection failed.
    Master(io::Error),

    /// Failed to establish initial connection to the remote host.
    Connect(io::Error),

    /// Failed to run the `ssh` command locally.
    #[cfg(feature = "process-mux")]
    #[cfg_attr(docsrs, doc(cfg(feature = "process-mux")))]
    Ssh(io::Error),

    /// The connection to the remote host was severed.
    ///
    /// Note that for the OpenSSH backend, this is a best-effort error, and it _may_ instead
    /// signify that the remote process exited with an error code of 255.
    Disconnected,

    /// Failed to remove temporary dir where ssh socket and output is stored.
    Cleanup(io::Error),

    /// IO error while reading from or writing to a channel.
    ChildIo(io::Error),

    /// IO error on the local side of a file transfer.
    LocalIo(io::Error),

    /// A transfer request was rejected before any data was moved.
    InvalidTransfer(String),

    /// An environment variable name that the remote shell would not accept.
    InvalidEnvName(String),

    /// Every local port between the lease bounds is in use.
    PortsExhausted,

    /// A parallel worker panicked or was cancelled.
    Worker(String),
}

/// Coarse classification of an [`Error`], used as the key for exception hooks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// See [`Error::NoHost`].
    NoHost,
    /// See [`Error::NoTargets`].
    NoTargets,
    /// See [`Error::NotConnected`].
    NotConnected,
    /// See [`Error::CommandNotFound`].
    CommandNotFound,
    /// See [`Error::NoPty`].
    NoPty,
    /// See [`Error::NoPassword`].
    NoPassword,
    /// See [`Error::Command`].
    Command,
    /// See [`Error::HostKeyMismatch`].
    HostKeyMismatch,
    /// See [`Error::AuthenticationFailed`].
    AuthenticationFailed,
    /// Failures of the transport itself: master, connect, ssh, disconnect, cleanup, channel io.
    Transport,
    /// See [`Error::LocalIo`].
    LocalIo,
    /// Rejected input: [`Error::InvalidTransfer`] and [`Error::InvalidEnvName`].
    InvalidInput,
    /// See [`Error::PortsExhausted`].
    PortsExhausted,
    /// See [`Error::Worker`].
    Worker,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::NoHost => write!(f, "no host was specified"),
            Error::NoTargets => write!(f, "the set has no targets"),
            Error::NotConnected(ref host) => write!(f, "not connected to {}", host),
            Error::CommandNotFound(ref name) => write!(f, "command not found: {}", name),
            Error::NoPty => write!(f, "the remote host refused to allocate a pty"),
            Error::NoPassword => write!(f, "a password was requested but none is available"),
            Error::Command(ref rap) => {
                write!(f, "{} (code: {})", rap.stderr().join("\n"), rap.exit_status())
            }
            Error::HostKeyMismatch(ref msg) => write!(f, "host key mismatch: {}", msg),
            Error::AuthenticationFailed(ref msg) => write!(f, "authentication failed: {}", msg),
            Error::Master(_) => write!(f, "the master connection failed"),
            Error::Connect(_) => write!(f, "failed to connect to the remote host"),

            #[cfg(feature = "process-mux")]
            Error::Ssh(_) => write!(f, "the local ssh command could not be executed"),

            Error::Disconnected => write!(f, "the connection was terminated"),
            Error::Cleanup(_) => write!(f, "failed to remove temporary ssh session directory"),
            Error::ChildIo(_) => write!(f, "failure while accessing a channel's standard I/O"),
            Error::LocalIo(_) => write!(f, "failure while accessing a local file"),
            Error::InvalidTransfer(ref msg) => write!(f, "invalid transfer: {}", msg),
            Error::InvalidEnvName(ref name) => {
                write!(f, "invalid environment variable name: {:?}", name)
            }
            Error::PortsExhausted => write!(f, "no free local port left to lease"),
            Error::Worker(ref msg) => write!(f, "worker failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Master(ref e)
            | Error::Connect(ref e)
            | Error::Cleanup(ref e)
            | Error::ChildIo(ref e)
            | Error::LocalIo(ref e) => Some(e),

            #[cfg(feature = "process-mux")]
            Error::Ssh(ref e) => Some(e),

            _ => None,
        }
    }
}

impl Error {
    /// Classify this error for hook lookup.
    pub fn kind(&self) -> ErrorKind {
        match *self {
            Error::NoHost => ErrorKind::NoHost,
            Error::NoTargets => ErrorKind::NoTargets,
            Error::NotConnected(_) => ErrorKind::NotConnected,
            Error::CommandNotFound(_) => ErrorKind::CommandNotFound,
            Error::NoPty => ErrorKind::NoPty,
            Error::NoPassword => ErrorKind::NoPassword,
            Error::Command(_) => ErrorKind::Command,
            Error::HostKeyMismatch(_) => ErrorKind::HostKeyMismatch,
            Error::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            Error::Master(_)
            | Error::Connect(_)
            | Error::Disconnected
            | Error::Cleanup(_)
            | Error::ChildIo(_) => ErrorKind::Transport,

            #[cfg(feature = "process-mux")]
            Error::Ssh(_) => ErrorKind::Transport,

            Error::LocalIo(_) => ErrorKind::LocalIo,
            Error::InvalidTransfer(_) | Error::InvalidEnvName(_) => ErrorKind::InvalidInput,
            Error::PortsExhausted => ErrorKind::PortsExhausted,
            Error::Worker(_) => ErrorKind::Worker,
        }
    }

    /// The completed result carried by [`Error::Command`], if any.
    pub fn rap(&self) -> Option<&Rap> {
        match *self {
            Error::Command(ref rap) => Some(rap),
            _ => None,
        }
    }

    /// Returns `true` if the transport went away underneath the caller.
    pub(crate) fn is_disconnect(&self) -> bool {
        matches!(*self, Error::Disconnected | Error::Master(_))
    }

    /// Turn the free-form output of a failed `ssh` connect into something a caller can match on.
    ///
    /// Host key and authentication failures get their own variants, since the connection
    /// layer reacts to them; everything else becomes an [`Error::Connect`] with the closest
    /// [`io::ErrorKind`].
    pub(crate) fn interpret_ssh_error(stderr: &str) -> Self {
        let stderr = strip_noise(stderr);

        if stderr.contains("REMOTE HOST IDENTIFICATION HAS CHANGED")
            || stderr.contains("Host key verification failed")
        {
            return Error::HostKeyMismatch(last_line(stderr).to_owned());
        }

        let (ssh_error, io_error) = match stderr.split_once(": ") {
            Some((ssh_error, io_error)) => (ssh_error, Some(io_error)),
            None => (stderr, None),
        };

        if io_error.map_or(false, |e| e.contains("Permission denied (")) {
            return Error::AuthenticationFailed(stderr.to_owned());
        }

        let connecting = ssh_error.starts_with("connect to host");
        let kind = match io_error {
            _ if ssh_error.starts_with("Could not resolve") => io::ErrorKind::Other,
            Some("Network is unreachable") => io::ErrorKind::Other,
            Some("Connection refused") => io::ErrorKind::ConnectionRefused,
            // the second spelling is what macOS reports
            Some("Connection timed out") | Some("Operation timed out") if connecting => {
                io::ErrorKind::TimedOut
            }
            // macOS reports an unreachable network this way
            Some("Permission denied") if connecting => io::ErrorKind::Other,
            _ => io::ErrorKind::ConnectionAborted,
        };

        Error::Connect(io::Error::new(kind, stderr))
    }
}

/// Drop the `ssh: ` prefix and the known-hosts chatter that precedes real errors.
pub(crate) fn strip_noise(stderr: &str) -> &str {
    let mut stderr = stderr.trim();
    stderr = stderr.strip_prefix("ssh: ").unwrap_or(stderr);
    while stderr.starts_with("Warning: Permanently added ") {
        stderr = stderr.split_once('\n').map(|x| x.1.trim()).unwrap_or("");
    }
    stderr
}

fn last_line(s: &str) -> &str {
    s.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or(s).trim()
}
