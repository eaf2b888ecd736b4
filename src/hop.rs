//! Relay hosts that exist only to forward ports.
//!
//! A [`Hop`] owns one [`Connection`] and hands out local ports forwarded through it. A
//! [`Target`](crate::Target) routed through a hop connects to `127.0.0.1:<leased port>`
//! instead of its real address. Hops can themselves be routed through other hops, to any
//! depth; the chain is walked on first connect.

use super::{Connection, Context, Error, LocalForward, Options};

use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

/// Highest port handed out, and where leasing starts.
pub const MAX_PORT: u16 = 65535;

/// Leasing wraps back to [`MAX_PORT`] below this.
pub const MIN_PORT: u16 = 1024;

/// How often a connected hop services its session.
pub const PUMP_INTERVAL: Duration = Duration::from_millis(100);

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Forward registrations to attempt before giving up on a lease.
const MAX_FORWARD_ATTEMPTS: usize = 16;

/// What a [`Target`](crate::Target) or [`Hop`] is routed through.
#[derive(Debug, Clone)]
pub enum Via {
    /// An existing hop, possibly shared with other targets.
    Hop(Arc<Hop>),
    /// Relay host names, outermost first. A hop is built for each.
    Hosts(Vec<String>),
}

impl Via {
    /// The innermost hop of this route, building the chain if needed.
    ///
    /// Hops built from host names inherit `opts` minus its port and route.
    pub(crate) fn resolve(&self, ctx: &Arc<Context>, opts: &Options) -> Result<Arc<Hop>, Error> {
        match *self {
            Via::Hop(ref hop) => Ok(Arc::clone(hop)),
            Via::Hosts(ref hosts) => {
                let mut parent: Option<Arc<Hop>> = None;
                for host in hosts {
                    let mut hop_opts = opts.clone();
                    hop_opts.port = None;
                    hop_opts.via = parent.take().map(Via::Hop);
                    parent = Some(Arc::new(Hop::new(Arc::clone(ctx), host.as_str(), hop_opts)?));
                }
                parent.ok_or(Error::NoHost)
            }
        }
    }
}

#[derive(Debug)]
struct PortCounter {
    next: u16,
    min: u16,
    max: u16,
}

impl PortCounter {
    fn new(min: u16, max: u16) -> Self {
        Self {
            next: max,
            min,
            max,
        }
    }

    fn take(&mut self) -> u16 {
        let port = self.next;
        self.next = if port <= self.min { self.max } else { port - 1 };
        port
    }

    fn span(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }
}

struct Active {
    conn: Arc<Connection>,
    forwards: Vec<LocalForward>,
    pump: JoinHandle<()>,
    shutdown: Option<oneshot::Sender<()>>,
    parent_port: Option<u16>,
}

/// A relay host. See the module docs.
///
/// Share one between targets with an [`Arc`] and [`Via::Hop`].
pub struct Hop {
    host: String,
    opts: Options,
    ctx: Arc<Context>,
    parent: Option<Arc<Hop>>,
    ports: std::sync::Mutex<PortCounter>,
    state: Mutex<Option<Active>>,
}

impl fmt::Debug for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hop")
            .field("host", &self.host)
            .field("via", &self.parent.as_ref().map(|p| p.host()))
            .finish_non_exhaustive()
    }
}

impl Hop {
    /// A hop to `host`, not yet connected. If `opts` has a route, it is resolved now.
    pub fn new(ctx: Arc<Context>, host: impl Into<String>, opts: Options) -> Result<Self, Error> {
        let host = host.into();
        if host.is_empty() {
            return Err(Error::NoHost);
        }
        let parent = match opts.via {
            Some(ref via) => Some(via.resolve(&ctx, &opts)?),
            None => None,
        };
        Ok(Self {
            host,
            opts,
            ctx,
            parent,
            ports: std::sync::Mutex::new(PortCounter::new(MIN_PORT, MAX_PORT)),
            state: Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub(crate) fn port_range(self, min: u16, max: u16) -> Self {
        *self.ports.lock().unwrap() = PortCounter::new(min, max);
        self
    }

    /// The relay's host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The hop this one is routed through.
    pub fn parent(&self) -> Option<&Arc<Hop>> {
        self.parent.as_ref()
    }

    /// `true` while the relay session is up.
    pub async fn is_connected(&self) -> bool {
        match *self.state.lock().await {
            Some(ref active) => !active.conn.is_closed(),
            None => false,
        }
    }

    /// Local ports currently forwarded through this hop.
    pub async fn leased_ports(&self) -> Vec<u16> {
        match *self.state.lock().await {
            Some(ref active) => active.forwards.iter().map(|f| f.local_port).collect(),
            None => Vec::new(),
        }
    }

    /// Connect if needed. Otherwise does nothing.
    pub async fn connect(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        self.ensure_connected(&mut state).await.map(drop)
    }

    /// Forward a free local port to `host:port` as seen from the relay, and return it.
    ///
    /// Connects first if needed.
    pub fn lease_port<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Result<u16, Error>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let conn = self.ensure_connected(&mut state).await?;

            let mut last_err = None;
            for _ in 0..MAX_FORWARD_ATTEMPTS {
                let local_port = self.next_free_port().await?;
                let forward = LocalForward::new(local_port, host, port);
                match conn.forward_local(&forward).await {
                    Ok(()) => {
                        debug!(hop = %self.host, %forward, "port leased");
                        if let Some(ref mut active) = *state {
                            active.forwards.push(forward);
                        }
                        return Ok(local_port);
                    }
                    Err(e) => {
                        trace!(hop = %self.host, local_port, error = %e, "forward refused");
                        last_err = Some(e);
                    }
                }
            }
            Err(last_err.unwrap_or(Error::PortsExhausted))
        })
    }

    /// Stop forwarding `port`. Problems are logged.
    pub async fn release_port(&self, port: u16) {
        let mut state = self.state.lock().await;
        let active = match *state {
            Some(ref mut active) => active,
            None => return,
        };
        let idx = match active.forwards.iter().position(|f| f.local_port == port) {
            Some(idx) => idx,
            None => return,
        };
        let forward = active.forwards.remove(idx);
        match active.conn.cancel_forward(&forward).await {
            Ok(()) => debug!(hop = %self.host, %forward, "port released"),
            Err(e) => warn!(hop = %self.host, %forward, error = %e, "failed to cancel forward"),
        }
    }

    /// Tear the relay down.
    ///
    /// Stops the background task, cancels every forward, closes the session, and gives back
    /// the port this hop leased on its parent. The parent itself stays up, since other hops
    /// or targets may share it. Never fails, and calling it again does nothing.
    pub async fn disconnect(&self) {
        let active = match self.state.lock().await.take() {
            Some(active) => active,
            None => return,
        };
        let Active {
            conn,
            forwards,
            pump,
            shutdown,
            parent_port,
        } = active;

        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
        if let Err(e) = pump.await {
            if !e.is_cancelled() {
                warn!(hop = %self.host, error = %e, "forwarding task failed");
            }
        }

        for forward in &forwards {
            if let Err(e) = conn.cancel_forward(forward).await {
                warn!(hop = %self.host, %forward, error = %e, "failed to cancel forward");
            }
        }
        conn.disconnect().await;

        if let (Some(parent), Some(port)) = (self.parent.as_ref(), parent_port) {
            debug!(hop = %self.host, via = %parent.host(), port, "releasing parent port");
            parent.release_port(port).await;
        }
    }

    async fn ensure_connected(&self, state: &mut Option<Active>) -> Result<Arc<Connection>, Error> {
        if let Some(ref active) = *state {
            if !active.conn.is_closed() {
                return Ok(Arc::clone(&active.conn));
            }
        }
        if let Some(stale) = state.take() {
            stale.pump.abort();
        }

        let (params, parent_port) = match self.parent {
            Some(ref parent) => {
                debug!(hop = %self.host, via = %parent.host(), "routing hop");
                let port = parent
                    .lease_port(&self.host, self.opts.port.unwrap_or(22))
                    .await?;
                let mut params = self.opts.connect_params("127.0.0.1");
                params.port = Some(port);
                params.host_key_alias = Some(self.host.clone());
                (params, Some(port))
            }
            None => (self.opts.connect_params(&self.host), None),
        };

        let conn = match Connection::establish(&self.ctx, params, self.opts.password_prompt).await {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                if let (Some(parent), Some(port)) = (self.parent.as_ref(), parent_port) {
                    parent.release_port(port).await;
                }
                return Err(e);
            }
        };

        let (tx, rx) = oneshot::channel();
        let pump = tokio::spawn(pump(Arc::clone(&conn), rx, self.host.clone()));
        *state = Some(Active {
            conn: Arc::clone(&conn),
            forwards: Vec::new(),
            pump,
            shutdown: Some(tx),
            parent_port,
        });
        Ok(conn)
    }

    async fn next_free_port(&self) -> Result<u16, Error> {
        let span = self.lock_ports().span();
        for _ in 0..span {
            let port = self.lock_ports().take();
            if port_is_free(port).await {
                return Ok(port);
            }
            trace!(hop = %self.host, port, "port in use");
        }
        Err(Error::PortsExhausted)
    }

    fn lock_ports(&self) -> std::sync::MutexGuard<'_, PortCounter> {
        self.ports.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for Hop {
    fn drop(&mut self) {
        if let Some(ref active) = *self.state.get_mut() {
            active.pump.abort();
        }
    }
}

/// Nothing is listening on `127.0.0.1:port`.
async fn port_is_free(port: u16) -> bool {
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Err(e)) => e.kind() == io::ErrorKind::ConnectionRefused,
        Ok(Ok(_)) | Err(_) => false,
    }
}

async fn pump(conn: Arc<Connection>, mut shutdown: oneshot::Receiver<()>, host: String) {
    let mut ticker = tokio::time::interval(PUMP_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                if let Err(e) = conn.process().await {
                    warn!(hop = %host, error = %e, "relay session lost");
                    break;
                }
            }
        }
    }
    trace!(hop = %host, "forwarding task stopped");
}
