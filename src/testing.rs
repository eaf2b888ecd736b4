//! Scripted in-memory transport for unit tests.

use super::{
    Channel, ChannelEvent, ChannelRequest, ConnectParams, Connector, Context, Error, KnownHosts,
    LocalForward, Transport,
};

use async_trait::async_trait;
use secrecy::ExposeSecret;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type WriteFn = Box<dyn FnMut(&[u8]) -> Vec<ChannelEvent> + Send>;
type EofFn = Box<dyn FnOnce() -> Vec<ChannelEvent> + Send>;
type FailFn = Box<dyn FnOnce() -> Error + Send>;

pub(crate) struct MockChannel {
    events: VecDeque<ChannelEvent>,
    on_write: Option<WriteFn>,
    on_eof: Option<EofFn>,
    fail: Option<FailFn>,
    written: Arc<Mutex<Vec<u8>>>,
    refuse_writes: bool,
    eof_sent: bool,
    closed: bool,
    _open: Option<OpenGuard>,
}

impl fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockChannel")
            .field("events", &self.events)
            .field("eof_sent", &self.eof_sent)
            .field("closed", &self.closed)
            .finish()
    }
}

impl MockChannel {
    pub(crate) fn new() -> Self {
        Self {
            events: VecDeque::new(),
            on_write: None,
            on_eof: None,
            fail: None,
            written: Arc::new(Mutex::new(Vec::new())),
            refuse_writes: false,
            eof_sent: false,
            closed: false,
            _open: None,
        }
    }

    pub(crate) fn event(mut self, event: ChannelEvent) -> Self {
        self.events.push_back(event);
        self
    }

    pub(crate) fn stdout(self, s: &str) -> Self {
        self.event(ChannelEvent::Stdout(s.as_bytes().to_vec()))
    }

    pub(crate) fn stderr(self, s: &str) -> Self {
        self.event(ChannelEvent::Stderr(s.as_bytes().to_vec()))
    }

    /// Finish with `status`: exit status, eof, close.
    pub(crate) fn exit(self, status: i32) -> Self {
        self.event(ChannelEvent::ExitStatus(status))
            .event(ChannelEvent::Eof)
            .event(ChannelEvent::Closed)
    }

    pub(crate) fn on_write<F>(mut self, f: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<ChannelEvent> + Send + 'static,
    {
        self.on_write = Some(Box::new(f));
        self
    }

    pub(crate) fn on_eof<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Vec<ChannelEvent> + Send + 'static,
    {
        self.on_eof = Some(Box::new(f));
        self
    }

    /// Make the first poll fail.
    pub(crate) fn fail_with<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Error + Send + 'static,
    {
        self.fail = Some(Box::new(f));
        self
    }

    /// Fail every write, as if the remote end had stopped reading.
    pub(crate) fn refuse_writes(mut self) -> Self {
        self.refuse_writes = true;
        self
    }

    pub(crate) fn written(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.written)
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn next_event(&mut self, wait: Duration) -> Result<Option<ChannelEvent>, Error> {
        if let Some(fail) = self.fail.take() {
            return Err(fail());
        }
        if self.closed {
            return Ok(Some(ChannelEvent::Closed));
        }
        match self.events.pop_front() {
            Some(event) => {
                if event == ChannelEvent::Closed {
                    self.closed = true;
                    self._open = None;
                }
                Ok(Some(event))
            }
            None => {
                tokio::time::sleep(wait.min(Duration::from_millis(1))).await;
                Ok(None)
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.refuse_writes || self.eof_sent || self.closed {
            return Err(Error::ChildIo(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stdin closed",
            )));
        }
        self.written
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(data);
        if let Some(ref mut f) = self.on_write {
            let events = f(data);
            self.events.extend(events);
        }
        Ok(())
    }

    async fn eof(&mut self) -> Result<(), Error> {
        self.eof_sent = true;
        if let Some(f) = self.on_eof.take() {
            self.events.extend(f());
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }
}

#[derive(Debug)]
struct OpenGuard(Arc<AtomicUsize>);

impl OpenGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything the mock saw, plus the fake remote filesystems.
#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub(crate) connects: Vec<ConnectParams>,
    pub(crate) forwards: Vec<(String, LocalForward)>,
    pub(crate) cancelled: Vec<(String, LocalForward)>,
    pub(crate) closed: Vec<String>,
    pub(crate) commands: Vec<(String, ChannelRequest)>,
    pub(crate) processed: usize,

    pub(crate) files: BTreeMap<(String, String), Vec<u8>>,
    pub(crate) dirs: BTreeSet<(String, String)>,

    pub(crate) unresolvable: BTreeSet<String>,
    pub(crate) mismatched: BTreeSet<String>,
    pub(crate) passwords: BTreeMap<String, String>,
}

pub(crate) type Shared = Arc<Mutex<MockState>>;

pub(crate) fn lock(state: &Shared) -> std::sync::MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}

type Responder = Arc<dyn Fn(&str, &ChannelRequest, &Shared) -> MockChannel + Send + Sync>;

#[derive(Clone)]
pub(crate) struct MockConnector {
    pub(crate) state: Shared,
    responder: Responder,
}

impl fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnector").finish_non_exhaustive()
    }
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::default(),
            responder: Arc::new(default_responder),
        }
    }

    pub(crate) fn with_responder<F>(f: F) -> Self
    where
        F: Fn(&str, &ChannelRequest, &Shared) -> MockChannel + Send + Sync + 'static,
    {
        Self {
            state: Arc::default(),
            responder: Arc::new(f),
        }
    }

    pub(crate) fn unresolvable(self, host: &str) -> Self {
        lock(&self.state).unresolvable.insert(host.to_owned());
        self
    }

    pub(crate) fn mismatched(self, host: &str) -> Self {
        lock(&self.state).mismatched.insert(host.to_owned());
        self
    }

    pub(crate) fn password(self, host: &str, password: &str) -> Self {
        lock(&self.state)
            .passwords
            .insert(host.to_owned(), password.to_owned());
        self
    }

    pub(crate) fn file(self, host: &str, path: &str, data: &[u8]) -> Self {
        lock(&self.state)
            .files
            .insert((host.to_owned(), path.to_owned()), data.to_vec());
        self
    }

    pub(crate) fn context(&self) -> Context {
        Context::with_connector(Arc::new(self.clone()))
    }

    /// Commands run on `host`, in order.
    pub(crate) fn commands(&self, host: &str) -> Vec<String> {
        lock(&self.state)
            .commands
            .iter()
            .filter(|(h, _)| h == host)
            .filter_map(|(_, r)| r.command.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Transport>, Error> {
        let label = params
            .host_key_alias
            .clone()
            .unwrap_or_else(|| params.host.clone());

        let mut state = lock(&self.state);
        state.connects.push(params.clone());

        if state.unresolvable.contains(&label) {
            return Err(Error::interpret_ssh_error(&format!(
                "ssh: Could not resolve hostname {}: Name or service not known",
                label
            )));
        }
        if state.mismatched.contains(&label) && params.known_hosts != KnownHosts::Accept {
            return Err(Error::HostKeyMismatch(String::from(
                "Host key verification failed.",
            )));
        }
        if let Some(required) = state.passwords.get(&label) {
            let given = params.password.as_ref().map(|p| p.expose_secret().to_owned());
            if given.as_deref() != Some(required.as_str()) {
                return Err(Error::AuthenticationFailed(format!(
                    "{}: Permission denied (publickey,password).",
                    label
                )));
            }
        }
        drop(state);

        Ok(Box::new(MockTransport {
            label,
            state: Arc::clone(&self.state),
            responder: Arc::clone(&self.responder),
            open: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }))
    }
}

pub(crate) struct MockTransport {
    label: String,
    state: Shared,
    responder: Responder,
    open: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_channel(&self, request: ChannelRequest) -> Result<Box<dyn Channel>, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        lock(&self.state)
            .commands
            .push((self.label.clone(), request.clone()));
        let mut channel = (self.responder)(&self.label, &request, &self.state);
        channel._open = Some(OpenGuard::new(&self.open));
        Ok(Box::new(channel))
    }

    async fn forward_local(&self, forward: &LocalForward) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if state
            .forwards
            .iter()
            .any(|(_, f)| f.local_port == forward.local_port)
        {
            return Err(Error::Connect(io::Error::new(
                io::ErrorKind::AddrInUse,
                "port already forwarded",
            )));
        }
        state.forwards.push((self.label.clone(), forward.clone()));
        Ok(())
    }

    async fn cancel_forward(&self, forward: &LocalForward) -> Result<(), Error> {
        let mut state = lock(&self.state);
        state.forwards.retain(|(_, f)| f != forward);
        state.cancelled.push((self.label.clone(), forward.clone()));
        Ok(())
    }

    async fn process(&self) -> Result<(), Error> {
        lock(&self.state).processed += 1;
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Disconnected)
        } else {
            Ok(())
        }
    }

    fn busy(&self) -> bool {
        self.open.load(Ordering::SeqCst) > 0
    }

    async fn close(&self) -> Result<(), Error> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            lock(&self.state).closed.push(self.label.clone());
        }
        Ok(())
    }
}

fn unquote(word: &str) -> String {
    word.trim_matches('\'').to_owned()
}

/// A tiny remote shell: enough of `cat`, `mkdir`, `find`, `ls`, `echo` and friends for the
/// command assembly and transfer code to be exercised end to end.
pub(crate) fn default_responder(host: &str, request: &ChannelRequest, state: &Shared) -> MockChannel {
    let command = match request.command {
        Some(ref c) => c.clone(),
        None => return shell(request.pty),
    };

    // only the last stage of `umask ... && cd ... && cmd` matters here
    let stage = command.rsplit(" && ").next().unwrap_or(&command);
    let stage = stage.rsplit("; ").next().unwrap_or(stage);
    let stage = stage.strip_prefix("sudo -S ").unwrap_or(stage);
    let words: Vec<&str> = stage.split_whitespace().collect();
    let host = host.to_owned();

    match words.as_slice() {
        ["cat", ">", path] | ["cat", ">>", path] => {
            let append = words[1] == ">>";
            let key = (host, unquote(path));
            let buf = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&buf);
            let state = Arc::clone(state);
            MockChannel::new()
                .on_write(move |data| {
                    sink.lock().unwrap().extend_from_slice(data);
                    Vec::new()
                })
                .on_eof(move || {
                    let data = std::mem::take(&mut *buf.lock().unwrap());
                    let mut state = lock(&state);
                    let file = state.files.entry(key).or_default();
                    if !append {
                        file.clear();
                    }
                    file.extend(data);
                    vec![ChannelEvent::ExitStatus(0), ChannelEvent::Eof, ChannelEvent::Closed]
                })
        }
        ["cat", path] => {
            let path = unquote(path);
            match lock(state).files.get(&(host, path.clone())) {
                Some(data) => MockChannel::new()
                    .event(ChannelEvent::Stdout(data.clone()))
                    .exit(0),
                None => MockChannel::new()
                    .stderr(&format!("cat: {}: No such file or directory\n", path))
                    .exit(1),
            }
        }
        ["mkdir", "-p", path] => {
            lock(state).dirs.insert((host, unquote(path)));
            MockChannel::new().exit(0)
        }
        ["find", dir, "-type", "f"] => {
            let prefix = format!("{}/", unquote(dir).trim_end_matches('/'));
            let listing: String = lock(state)
                .files
                .keys()
                .filter(|(h, p)| *h == host && p.starts_with(&prefix))
                .map(|(_, p)| format!("{}\n", p))
                .collect();
            MockChannel::new().stdout(&listing).exit(0)
        }
        ["ls", path] => {
            let path = unquote(path);
            let state = lock(state);
            let key = (host, path.clone());
            if state.files.contains_key(&key) || state.dirs.contains(&key) {
                MockChannel::new().stdout(&format!("{}\n", path)).exit(0)
            } else {
                MockChannel::new()
                    .stderr(&format!(
                        "ls: cannot access '{}': No such file or directory\n",
                        path
                    ))
                    .exit(2)
            }
        }
        ["echo", rest @ ..] => {
            let text: Vec<String> = rest.iter().map(|w| unquote(w)).collect();
            MockChannel::new()
                .stdout(&format!("{}\n", text.join(" ")))
                .exit(0)
        }
        ["env"] => MockChannel::new()
            .stdout("HOME=/home/mock\nPATH=/usr/bin:/bin\nLANG=C.UTF-8\n")
            .exit(0),
        ["uptime"] => MockChannel::new()
            .stdout(" 10:00:00 up 1 day,  1 user,  load average: 0.00, 0.00, 0.00\n")
            .exit(0),
        ["hostname"] => MockChannel::new().stdout(&format!("{}\n", host)).exit(0),
        ["false"] | ["test", ..] => MockChannel::new().exit(1),
        ["true"] | ["pwd"] | ["sleep", _] => MockChannel::new().stdout("").exit(0),
        [name, ..] => MockChannel::new()
            .stderr(&format!("sh: 1: {}: not found\n", unquote(name)))
            .exit(127),
        [] => MockChannel::new().exit(0),
    }
}

/// A shell that understands `echo` (with an optional trailing `>&2`) and `exit`.
///
/// On a pty it behaves like a terminal: input lines are echoed back and stderr comes out on
/// stdout.
fn shell(pty: bool) -> MockChannel {
    MockChannel::new().on_write(move |data| {
        let line = String::from_utf8_lossy(data);
        let line = line.trim_end();
        let mut events = Vec::new();
        if pty {
            events.push(ChannelEvent::Stdout(format!("{}\n", line).into_bytes()));
        }
        if line == "exit" {
            events.extend([ChannelEvent::ExitStatus(0), ChannelEvent::Eof, ChannelEvent::Closed]);
        } else if let Some(rest) = line.strip_prefix("echo ") {
            let (text, to_stderr) = match rest.strip_suffix(" >&2") {
                Some(text) => (text, true),
                None => (rest, false),
            };
            let out = format!("{}\n", text).into_bytes();
            events.push(if to_stderr && !pty {
                ChannelEvent::Stderr(out)
            } else {
                ChannelEvent::Stdout(out)
            });
        }
        events
    })
}
