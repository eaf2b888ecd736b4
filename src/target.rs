use super::builder::default_keys;
use super::command::{validate_env_name, CommandLine};
use super::hooks::{HookAction, HookContext, Hooks};
use super::runner::{ChannelRunner, Mode, StdoutHook};
use super::transfer::{Direction, Endpoint, ProgressFn, TransferManager};
use super::{
    ChannelRequest, ConnectParams, Connection, Context, Error, Hop, KnownHosts, Operation, Rap,
    Via,
};

use secrecy::SecretString;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

/// Connection and behaviour settings for a [`Target`] (or a [`Hop`], or the hosts a
/// [`Set`](crate::Set) creates by name).
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) user: Option<String>,
    pub(crate) port: Option<u16>,
    pub(crate) keys: Vec<PathBuf>,
    pub(crate) via: Option<Via>,
    pub(crate) safe: bool,
    pub(crate) sudo: bool,
    pub(crate) getenv: bool,
    pub(crate) password_prompt: bool,
    pub(crate) quiet: bool,
    pub(crate) known_hosts: KnownHosts,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) password: Option<SecretString>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            user: None,
            port: None,
            keys: Vec::new(),
            via: None,
            safe: true,
            sudo: false,
            getenv: true,
            password_prompt: true,
            quiet: false,
            known_hosts: KnownHosts::Add,
            connect_timeout: None,
            password: None,
        }
    }
}

impl Options {
    /// Log in as `user`.
    ///
    /// Defaults to whatever ssh configuration says, usually the local user.
    pub fn user(&mut self, user: impl Into<String>) -> &mut Self {
        self.user = Some(user.into());
        self
    }

    /// Connect to `port`.
    ///
    /// Defaults to ssh configuration, usually 22.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.port = Some(port);
        self
    }

    /// Offer this private key. May be called more than once.
    pub fn key(&mut self, key: impl AsRef<Path>) -> &mut Self {
        let key = key.as_ref().to_path_buf();
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
        self
    }

    /// Offer each of these private keys.
    pub fn keys<I, P>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for key in keys {
            self.key(key);
        }
        self
    }

    /// Offer the usual `~/.ssh/id_*` keys that exist.
    pub fn default_keys(&mut self) -> &mut Self {
        self.keys(default_keys())
    }

    /// Route through `via`.
    pub fn via(&mut self, via: Via) -> &mut Self {
        self.via = Some(via);
        self
    }

    /// Route through these relay hosts, outermost first.
    pub fn via_hosts<I, S>(&mut self, hosts: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.via(Via::Hosts(hosts.into_iter().map(Into::into).collect()))
    }

    /// Only run whitelisted commands, with every argument quoted.
    ///
    /// Default `true`.
    pub fn safe(&mut self, safe: bool) -> &mut Self {
        self.safe = safe;
        self
    }

    /// Run every command through `sudo -S`.
    ///
    /// Default `false`.
    pub fn sudo(&mut self, sudo: bool) -> &mut Self {
        self.sudo = sudo;
        self
    }

    /// Fetch the remote environment the first time it is asked for.
    ///
    /// Default `true`. When off, [`Target::getenv`] only returns local overrides.
    pub fn getenv(&mut self, getenv: bool) -> &mut Self {
        self.getenv = getenv;
        self
    }

    /// Ask for a password when key authentication fails.
    ///
    /// Default `true`. Needs an interactive [`Prompter`](crate::prompt::Prompter).
    pub fn password_prompt(&mut self, prompt: bool) -> &mut Self {
        self.password_prompt = prompt;
        self
    }

    /// Silence the pre, post and stdout hooks, and return failed results instead of errors.
    ///
    /// Default `false`.
    pub fn quiet(&mut self, quiet: bool) -> &mut Self {
        self.quiet = quiet;
        self
    }

    /// See [`KnownHosts`].
    ///
    /// Default `KnownHosts::Add`.
    pub fn known_hosts(&mut self, k: KnownHosts) -> &mut Self {
        self.known_hosts = k;
        self
    }

    /// Give up connecting after `d`.
    pub fn connect_timeout(&mut self, d: Duration) -> &mut Self {
        self.connect_timeout = Some(d);
        self
    }

    /// Try this password when key authentication fails.
    pub fn password(&mut self, password: SecretString) -> &mut Self {
        self.password = Some(password);
        self
    }

    pub(crate) fn connect_params(&self, host: &str) -> ConnectParams {
        let mut params = ConnectParams::new(host);
        params.port = self.port;
        params.user = self.user.clone();
        params.keys = self.keys.clone();
        params.password = self.password.clone();
        params.known_hosts = self.known_hosts;
        params.connect_timeout = self.connect_timeout;
        params
    }
}

#[derive(Debug, Clone)]
enum Job {
    Exec(String),
    Block(Vec<String>),
    Shell,
}

impl Job {
    fn label(&self) -> String {
        match *self {
            Job::Exec(ref command) => command.clone(),
            Job::Block(ref lines) => lines.join("; "),
            Job::Shell => String::new(),
        }
    }
}

/// One host you run commands on.
///
/// Connects lazily on the first command and keeps the connection until
/// [`Target::disconnect`]. Keeps a working directory, umask and environment overrides that
/// are applied to every command.
///
/// ```no_run
/// # async fn run() -> Result<(), sshbox::Error> {
/// use std::sync::Arc;
/// use sshbox::{Context, Options, Target};
///
/// let mut opts = Options::default();
/// opts.user("deploy");
/// let mut web = Target::new(Arc::new(Context::new()), "web1.example.com", opts)?;
/// web.cd("/srv/app");
/// let rap = web.execute("ls", &["-l"]).await?;
/// println!("{}", rap);
/// web.disconnect().await;
/// # Ok(()) }
/// ```
pub struct Target {
    host: String,
    nickname: Option<String>,
    opts: Options,
    ctx: Arc<Context>,

    hop: Option<Arc<Hop>>,
    leased_port: Option<u16>,
    connection: Option<Connection>,

    cwd: Option<String>,
    umask: Option<u32>,
    env: BTreeMap<String, String>,
    remote_env: Option<BTreeMap<String, String>>,

    hooks: Hooks,
    progress: Option<ProgressFn>,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("host", &self.host)
            .field("nickname", &self.nickname)
            .field("user", &self.opts.user)
            .field("via", &self.hop.as_ref().map(|h| h.host()))
            .field("cwd", &self.cwd)
            .field("umask", &self.umask)
            .field("env", &self.env)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Target {
    /// A target for `host`, not yet connected. Fails with [`Error::NoHost`] if `host` is
    /// empty.
    pub fn new(ctx: Arc<Context>, host: impl Into<String>, opts: Options) -> Result<Self, Error> {
        let host = host.into();
        if host.is_empty() {
            return Err(Error::NoHost);
        }
        let hop = match opts.via {
            Some(ref via) => Some(via.resolve(&ctx, &opts)?),
            None => None,
        };
        Ok(Self {
            host,
            nickname: None,
            opts,
            ctx,
            hop,
            leased_port: None,
            connection: None,
            cwd: None,
            umask: None,
            env: BTreeMap::new(),
            remote_env: None,
            hooks: Hooks::default(),
            progress: None,
        })
    }

    /// The host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// A display name, if one was set.
    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    /// Set a display name.
    pub fn set_nickname(&mut self, name: impl Into<String>) -> &mut Self {
        self.nickname = Some(name.into());
        self
    }

    /// The login user, if one was set.
    pub fn user(&self) -> Option<&str> {
        self.opts.user.as_deref()
    }

    /// Current options.
    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// The shared context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// The hop this target is routed through.
    pub fn hop(&self) -> Option<&Arc<Hop>> {
        self.hop.as_ref()
    }

    /// The port leased on the hop while connected through one.
    pub fn leased_port(&self) -> Option<u16> {
        self.leased_port
    }

    /// `user@host`, or just the host when no user was set. Labels every [`Rap`].
    pub fn origin(&self) -> String {
        match self.opts.user {
            Some(ref user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// `true` while a live connection is held.
    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().map_or(false, |c| !c.is_closed())
    }

    /// Pre, post, stdout and exception hooks.
    pub fn hooks(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    /// Report transfer progress to `f`.
    pub fn on_progress(&mut self, f: Option<ProgressFn>) -> &mut Self {
        self.progress = f;
        self
    }

    /// Connect, through the hop if there is one. Does nothing when already connected.
    pub async fn connect(&mut self) -> Result<(), Error> {
        if self.is_connected() {
            return Ok(());
        }
        self.drop_connection().await;

        let params = match self.hop.clone() {
            Some(hop) => {
                debug!(host = %self.host, via = %hop.host(), "connecting through hop");
                let port = hop
                    .lease_port(&self.host, self.opts.port.unwrap_or(22))
                    .await?;
                self.leased_port = Some(port);
                let mut params = self.opts.connect_params("127.0.0.1");
                params.port = Some(port);
                params.host_key_alias = Some(self.host.clone());
                params
            }
            None => self.opts.connect_params(&self.host),
        };

        match Connection::establish(&self.ctx, params, self.opts.password_prompt).await {
            Ok(conn) => {
                self.connection = Some(conn);
                Ok(())
            }
            Err(e) => {
                self.release_lease().await;
                Err(e)
            }
        }
    }

    /// Drop the current connection, if any, and connect again.
    pub async fn reconnect(&mut self) -> Result<(), Error> {
        self.disconnect().await;
        self.connect().await
    }

    /// Close the connection and give back the hop port. Never fails.
    pub async fn disconnect(&mut self) {
        self.drop_connection().await;
        self.remote_env = None;
    }

    /// Log in as `user` from the next command on. Drops the current connection.
    pub async fn switch_user(&mut self, user: impl Into<String>) {
        let user = user.into();
        if self.opts.user.as_deref() == Some(user.as_str()) {
            return;
        }
        debug!(host = %self.host, %user, "switching user");
        self.opts.user = Some(user);
        self.disconnect().await;
    }

    /// Offer these keys from the next connection on.
    pub fn add_keys<I, P>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.opts.keys(keys);
        self
    }

    /// Stop offering these keys from the next connection on.
    pub fn remove_keys<I, P>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let gone: Vec<PathBuf> = keys.into_iter().map(|k| k.as_ref().to_path_buf()).collect();
        self.opts.keys.retain(|k| !gone.contains(k));
        self
    }

    /// Change directory for later commands. Absolute paths replace the current directory,
    /// relative ones are appended to it.
    pub fn cd(&mut self, dir: &str) -> &mut Self {
        self.cwd = match self.cwd.take() {
            Some(cwd) if !dir.starts_with('/') => {
                Some(format!("{}/{}", cwd.trim_end_matches('/'), dir))
            }
            _ => Some(dir.to_owned()),
        };
        self
    }

    /// Go back to the login directory.
    pub fn cd_home(&mut self) -> &mut Self {
        self.cwd = None;
        self
    }

    /// The directory commands run in, if one was set.
    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    /// Set the umask for later commands. `None` leaves the remote default alone.
    pub fn set_umask(&mut self, umask: Option<u32>) -> &mut Self {
        self.umask = umask;
        self
    }

    /// The umask commands run with, if one was set.
    pub fn umask(&self) -> Option<u32> {
        self.umask
    }

    /// Export `name=value` to later commands.
    pub fn setenv(&mut self, name: &str, value: impl Into<String>) -> Result<&mut Self, Error> {
        validate_env_name(name)?;
        self.env.insert(name.to_owned(), value.into());
        Ok(self)
    }

    /// Stop exporting `name`.
    pub fn unsetenv(&mut self, name: &str) -> &mut Self {
        self.env.remove(name);
        self
    }

    /// Locally set environment overrides.
    pub fn env_overrides(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Toggle safe mode.
    pub fn set_safe(&mut self, safe: bool) -> &mut Self {
        self.opts.safe = safe;
        self
    }

    /// Toggle `sudo -S`.
    pub fn set_sudo(&mut self, sudo: bool) -> &mut Self {
        self.opts.sudo = sudo;
        self
    }

    /// Toggle quiet mode.
    pub fn set_quiet(&mut self, quiet: bool) -> &mut Self {
        self.opts.quiet = quiet;
        self
    }

    /// See [`Options::safe`].
    pub fn is_safe(&self) -> bool {
        self.opts.safe
    }

    /// See [`Options::sudo`].
    pub fn is_sudo(&self) -> bool {
        self.opts.sudo
    }

    /// See [`Options::quiet`].
    pub fn is_quiet(&self) -> bool {
        self.opts.quiet
    }

    /// Run `name` with `args`.
    ///
    /// In safe mode `name` must be in the context's whitelist and every argument is quoted.
    /// Otherwise a whitelisted name still maps to its path, any other name is used as is,
    /// and arguments are passed to the shell verbatim.
    ///
    /// A non-zero exit is an [`Error::Command`] unless the target is quiet. Errors go through
    /// the exception hooks first.
    pub async fn execute<S: AsRef<str>>(&mut self, name: &str, args: &[S]) -> Result<Rap, Error> {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_owned()).collect();
        let command = self.prepare(name, &args)?;
        self.dispatch(Job::Exec(command)).await
    }

    /// Run `lines` one after another in a single shell session, then leave it.
    ///
    /// The working directory, umask and environment are set up first.
    ///
    /// In safe mode each line is split on whitespace into a command name and its arguments.
    /// The name must be whitelisted and every word is quoted, so shell syntax in a line is
    /// inert. Nothing runs if any line is rejected. Outside safe mode lines reach the shell
    /// verbatim.
    pub async fn batch<I, S>(&mut self, lines: I) -> Result<Rap, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        let mut block = Vec::with_capacity(lines.len() + 1);
        block.extend(self.preamble());
        block.extend(self.steps(&lines)?);
        self.dispatch(Job::Block(block)).await
    }

    /// Open a login shell fed line by line from the prompter, until it runs dry.
    pub async fn interactive_shell(&mut self) -> Result<Rap, Error> {
        self.run_once(&Job::Shell).await
    }

    /// Run one [`Operation`].
    pub async fn apply(&mut self, op: &Operation) -> Result<Rap, Error> {
        match *op {
            Operation::Execute { ref name, ref args } => self.execute(name, args).await,
            Operation::Batch(ref lines) => self.batch(lines.clone()).await,
            Operation::Upload {
                ref sources,
                ref target,
                recursive,
            } => {
                let sources = sources.iter().map(|p| Endpoint::from(p.as_path())).collect();
                self.transfer(Direction::Upload, recursive, sources, target.as_path().into())
                    .await?;
                Ok(self.done(op))
            }
            Operation::Download {
                ref sources,
                ref target,
                recursive,
            } => {
                let sources = sources.iter().map(|p| Endpoint::from(p.as_path())).collect();
                self.transfer(Direction::Download, recursive, sources, target.as_path().into())
                    .await?;
                Ok(self.done(op))
            }
        }
    }

    /// The remote environment with local overrides applied on top.
    ///
    /// The remote part is fetched once with `env` and cached until disconnect.
    pub async fn getenv(&mut self) -> Result<BTreeMap<String, String>, Error> {
        if self.opts.getenv && self.remote_env.is_none() {
            let rap = self.run_once(&Job::Exec(String::from("env"))).await?;
            if rap.is_failure() {
                return Err(Error::Command(Box::new(rap)));
            }
            self.remote_env = Some(parse_env(rap.stdout()));
        }
        let mut env = self.remote_env.clone().unwrap_or_default();
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(env)
    }

    /// Copy files between here and the target. See [`TransferManager::transfer`].
    ///
    /// Remote relative paths are relative to the login directory; [`Target::cd`] does not
    /// apply.
    pub async fn transfer(
        &mut self,
        direction: Direction,
        recursive: bool,
        sources: Vec<Endpoint>,
        target: Endpoint,
    ) -> Result<Option<Vec<u8>>, Error> {
        let result = self.transfer_inner(direction, recursive, sources, target).await;
        self.check_link(result).await
    }

    /// Upload local files (or a buffer) to `target`.
    pub async fn file_upload<I, E>(&mut self, sources: I, target: impl Into<Endpoint>) -> Result<(), Error>
    where
        I: IntoIterator<Item = E>,
        E: Into<Endpoint>,
    {
        let sources = sources.into_iter().map(Into::into).collect();
        self.transfer(Direction::Upload, false, sources, target.into())
            .await
            .map(drop)
    }

    /// Download remote files to `target`. A buffer target gets its bytes returned.
    pub async fn file_download<I, E>(
        &mut self,
        sources: I,
        target: impl Into<Endpoint>,
    ) -> Result<Option<Vec<u8>>, Error>
    where
        I: IntoIterator<Item = E>,
        E: Into<Endpoint>,
    {
        let sources = sources.into_iter().map(Into::into).collect();
        self.transfer(Direction::Download, false, sources, target.into())
            .await
    }

    /// Upload local directory trees.
    pub async fn dir_upload<I, E>(&mut self, sources: I, target: impl Into<Endpoint>) -> Result<(), Error>
    where
        I: IntoIterator<Item = E>,
        E: Into<Endpoint>,
    {
        let sources = sources.into_iter().map(Into::into).collect();
        self.transfer(Direction::Upload, true, sources, target.into())
            .await
            .map(drop)
    }

    /// Download remote directory trees.
    pub async fn dir_download<I, E>(&mut self, sources: I, target: impl Into<Endpoint>) -> Result<(), Error>
    where
        I: IntoIterator<Item = E>,
        E: Into<Endpoint>,
    {
        let sources = sources.into_iter().map(Into::into).collect();
        self.transfer(Direction::Download, true, sources, target.into())
            .await
            .map(drop)
    }

    /// Write `content` to the remote file `remote`.
    pub async fn string_upload(&mut self, content: &str, remote: &str) -> Result<(), Error> {
        self.file_upload([content.as_bytes().to_vec()], remote).await
    }

    /// Read the remote file `remote`.
    pub async fn string_download(&mut self, remote: &str) -> Result<String, Error> {
        let data = self
            .file_download([remote], Vec::<u8>::new())
            .await?
            .unwrap_or_default();
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Replace the remote file `remote` with `content`.
    pub async fn file_write(&mut self, remote: &str, content: &str) -> Result<(), Error> {
        self.string_upload(content, remote).await
    }

    /// Add `content` to the end of the remote file `remote`.
    pub async fn file_append(&mut self, remote: &str, content: &str) -> Result<(), Error> {
        let result = self.append_inner(remote, content.as_bytes()).await;
        self.check_link(result).await
    }

    /// `true` if `ls` finds `remote`.
    pub async fn file_exists(&mut self, remote: &str) -> Result<bool, Error> {
        let command = self.prepare("ls", &[remote.to_owned()])?;
        let rap = self.run_once(&Job::Exec(command)).await?;
        Ok(rap.stderr().is_empty())
    }

    /// Check that `op` may run here, without running it.
    pub(crate) fn check(&self, op: &Operation) -> Result<(), Error> {
        match *op {
            Operation::Execute { ref name, ref args } => self.resolve(name, args).map(drop),
            Operation::Batch(ref lines) => self.steps(lines).map(drop),
            Operation::Upload { .. } | Operation::Download { .. } => Ok(()),
        }
    }

    /// The program and arguments `name` stands for in the current mode.
    fn resolve(&self, name: &str, args: &[String]) -> Result<(String, Vec<String>), Error> {
        let registry = self.ctx.commands();
        let spec = if self.opts.safe {
            Some(registry.require(name)?)
        } else {
            registry.get(name)
        };
        Ok(match spec {
            Some(spec) => (spec.path().to_owned(), spec.resolve_args(args)?),
            None => (name.to_owned(), args.to_vec()),
        })
    }

    fn prepare(&self, name: &str, args: &[String]) -> Result<String, Error> {
        let (program, args) = self.resolve(name, args)?;
        Ok(CommandLine::new(&program, &args)
            .env(&self.env)
            .umask(self.umask)
            .cwd(self.cwd.as_deref())
            .sudo(self.opts.sudo)
            .safe(self.opts.safe)
            .render())
    }

    /// Block lines as they are sent to the shell. The preamble sets env, umask and cwd.
    fn steps(&self, lines: &[String]) -> Result<Vec<String>, Error> {
        if !self.opts.safe {
            return Ok(lines.to_vec());
        }
        let mut steps = Vec::with_capacity(lines.len());
        for line in lines {
            let mut words = line.split_whitespace().map(str::to_owned);
            let name = match words.next() {
                Some(name) => name,
                None => continue,
            };
            let args: Vec<String> = words.collect();
            let (program, args) = self.resolve(&name, &args)?;
            steps.push(
                CommandLine::new(&program, &args)
                    .sudo(self.opts.sudo)
                    .safe(true)
                    .render(),
            );
        }
        Ok(steps)
    }

    fn preamble(&self) -> Option<String> {
        if self.env.is_empty() && self.umask.is_none() && self.cwd.is_none() {
            return None;
        }
        Some(
            CommandLine::new("true", &[])
                .env(&self.env)
                .umask(self.umask)
                .cwd(self.cwd.as_deref())
                .render(),
        )
    }

    async fn dispatch(&mut self, job: Job) -> Result<Rap, Error> {
        let label = job.label();
        let quiet = self.opts.quiet;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if !quiet {
                if let Some(pre) = self.hooks.pre.as_mut() {
                    pre(&label, self.opts.user.as_deref(), &self.host);
                }
            }

            let err = match self.run_once(&job).await {
                Ok(rap) if rap.is_failure() && !quiet => Error::Command(Box::new(rap)),
                Ok(rap) => {
                    self.post(&rap);
                    return Ok(rap);
                }
                Err(e) => e,
            };

            let ctx = HookContext {
                command: &label,
                user: self.opts.user.as_deref(),
                host: &self.host,
                attempt,
            };
            match self.hooks.decide(&err, &ctx) {
                HookAction::Retry => {
                    debug!(host = %self.host, attempt, error = %err, "retrying");
                }
                HookAction::Skip => {
                    debug!(host = %self.host, error = %err, "skipping");
                    let rap = match err {
                        Error::Command(rap) => *rap,
                        other => Rap::from_error(self.origin(), label, &other),
                    };
                    self.post(&rap);
                    return Ok(rap);
                }
                HookAction::Interactive => {
                    warn!(host = %self.host, error = %err, "dropping into a shell");
                    self.interactive_shell().await?;
                }
                HookAction::Raise => return Err(err),
            }
        }
    }

    fn post(&mut self, rap: &Rap) {
        if self.opts.quiet {
            return;
        }
        if let Some(post) = self.hooks.post.as_mut() {
            post(rap);
        }
    }

    async fn run_once(&mut self, job: &Job) -> Result<Rap, Error> {
        let result = self.run_channel(job).await;
        self.check_link(result).await
    }

    async fn run_channel(&mut self, job: &Job) -> Result<Rap, Error> {
        self.connect().await?;
        let rap = Rap::new(self.origin(), job.label());
        let prompter = self.ctx.interactive_prompter();
        let conn = match self.connection {
            Some(ref conn) => conn,
            None => return Err(Error::NotConnected(self.host.clone())),
        };

        let (request, mode) = match *job {
            Job::Exec(ref command) => (ChannelRequest::exec(command.as_str()), Mode::Batch),
            Job::Block(_) => (ChannelRequest::script(), Mode::Shell),
            Job::Shell => (ChannelRequest::shell(), Mode::Shell),
        };
        let channel = conn.open_channel(request).await?;

        let stdout_hook = self
            .hooks
            .stdout
            .as_mut()
            .map(|hook| &mut **hook as StdoutHook<'_>);
        let mut runner = ChannelRunner::new(channel, mode, rap)
            .prompter(prompter)
            .stdout_hook(stdout_hook)
            .quiet(self.opts.quiet)
            .hold_stdin(self.opts.sudo);
        if let Job::Block(ref lines) = *job {
            runner = runner.block(lines.clone());
        }
        runner.run().await
    }

    async fn transfer_inner(
        &mut self,
        direction: Direction,
        recursive: bool,
        sources: Vec<Endpoint>,
        target: Endpoint,
    ) -> Result<Option<Vec<u8>>, Error> {
        self.connect().await?;
        let origin = self.origin();
        let conn = match self.connection {
            Some(ref conn) => conn,
            None => return Err(Error::NotConnected(self.host.clone())),
        };
        TransferManager::new(conn, origin)
            .progress(self.progress.clone())
            .transfer(direction, recursive, sources, target)
            .await
    }

    async fn append_inner(&mut self, remote: &str, data: &[u8]) -> Result<(), Error> {
        self.connect().await?;
        let origin = self.origin();
        let conn = match self.connection {
            Some(ref conn) => conn,
            None => return Err(Error::NotConnected(self.host.clone())),
        };
        TransferManager::new(conn, origin).append(remote, data).await
    }

    /// A lost session is reported as [`Error::NotConnected`] and forgotten, so the next
    /// command reconnects.
    async fn check_link<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        match result {
            Err(e) if e.is_disconnect() => {
                warn!(host = %self.host, error = %e, "connection lost");
                self.drop_connection().await;
                Err(Error::NotConnected(self.host.clone()))
            }
            other => other,
        }
    }

    async fn drop_connection(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.disconnect().await;
        }
        self.release_lease().await;
    }

    async fn release_lease(&mut self) {
        if let (Some(hop), Some(port)) = (self.hop.as_ref(), self.leased_port.take()) {
            hop.release_port(port).await;
        }
    }

    fn done(&self, op: &Operation) -> Rap {
        let mut rap = Rap::new(self.origin(), op.to_string());
        rap.finalize(Some(0));
        rap
    }
}

fn parse_env(lines: &[String]) -> BTreeMap<String, String> {
    lines
        .iter()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}
