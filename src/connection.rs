use super::prompt;
use super::{Channel, ChannelRequest, ConnectParams, Context, Error, KnownHosts, LocalForward, Transport};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// How long [`Connection::disconnect`] waits for open channels to finish.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How often [`Connection::disconnect`] re-checks whether the session went idle.
const BUSY_POLL: Duration = Duration::from_millis(300);

/// Password prompts allowed before an authentication failure is final.
pub const MAX_PASSWORD_ATTEMPTS: usize = 3;

/// One live, authenticated session to one host.
#[derive(Debug)]
pub struct Connection {
    host: String,
    transport: Box<dyn Transport>,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap an already-established transport.
    pub fn new(host: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            host: host.into(),
            transport,
            closed: AtomicBool::new(false),
        }
    }

    /// Open a session using the connector in `ctx`.
    ///
    /// A host key mismatch is put to the prompter once; if accepted the connection is retried
    /// without key checking. An authentication failure asks for a password, up to
    /// [`MAX_PASSWORD_ATTEMPTS`] times, when `password_prompt` is set and the prompter is
    /// interactive. Anything else is returned as is.
    pub async fn establish(
        ctx: &Context,
        mut params: ConnectParams,
        password_prompt: bool,
    ) -> Result<Self, Error> {
        let label = params
            .host_key_alias
            .clone()
            .unwrap_or_else(|| params.host.clone());
        let mut confirmed = false;
        let mut attempts = 0;

        loop {
            debug!(host = %label, port = ?params.port, user = ?params.user, "connecting");
            let err = match ctx.connector().connect(&params).await {
                Ok(transport) => return Ok(Self::new(label, transport)),
                Err(err) => err,
            };

            match err {
                Error::HostKeyMismatch(ref msg) if !confirmed => {
                    let prompter = match ctx.interactive_prompter() {
                        Some(p) => p,
                        None => return Err(err),
                    };
                    warn!(host = %label, "{}", msg);
                    let question = format!("{}: {} Continue?", label, msg);
                    if !prompt::confirm(prompter, question).await {
                        return Err(err);
                    }
                    confirmed = true;
                    params.known_hosts = KnownHosts::Accept;
                }
                Error::AuthenticationFailed(_)
                    if password_prompt && attempts < MAX_PASSWORD_ATTEMPTS =>
                {
                    let prompter = match ctx.interactive_prompter() {
                        Some(p) => p,
                        None => return Err(err),
                    };
                    attempts += 1;
                    let who = match params.user {
                        Some(ref user) => format!("{}@{}", user, label),
                        None => label.clone(),
                    };
                    match prompt::read_secret(prompter, format!("{}'s password: ", who)).await {
                        Some(password) => params.password = Some(password),
                        None => return Err(err),
                    }
                }
                err => return Err(err),
            }
        }
    }

    /// The host this connection leads to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The underlying transport.
    pub fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    /// Open a channel.
    pub async fn open_channel(&self, request: ChannelRequest) -> Result<Box<dyn Channel>, Error> {
        if self.is_closed() {
            return Err(Error::NotConnected(self.host.clone()));
        }
        self.transport.open_channel(request).await
    }

    /// Register a local port forward.
    pub async fn forward_local(&self, forward: &LocalForward) -> Result<(), Error> {
        self.transport.forward_local(forward).await
    }

    /// Cancel a local port forward.
    pub async fn cancel_forward(&self, forward: &LocalForward) -> Result<(), Error> {
        self.transport.cancel_forward(forward).await
    }

    /// Service the session once.
    pub async fn process(&self) -> Result<(), Error> {
        self.transport.process().await
    }

    /// `true` while any channel is open.
    pub fn is_busy(&self) -> bool {
        self.transport.busy()
    }

    /// `true` once [`Connection::disconnect`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait (up to [`DISCONNECT_TIMEOUT`]) for open channels to finish, then close.
    ///
    /// Never fails; problems are logged. Calling it again does nothing.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let deadline = Instant::now() + DISCONNECT_TIMEOUT;
        while self.transport.busy() {
            if Instant::now() >= deadline {
                warn!(host = %self.host, "session still busy, closing anyway");
                break;
            }
            tokio::time::sleep(BUSY_POLL).await;
        }

        match self.transport.close().await {
            Ok(()) => debug!(host = %self.host, "disconnected"),
            Err(e) => warn!(host = %self.host, error = %e, "error while disconnecting"),
        }
    }
}
