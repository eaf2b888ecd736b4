use super::escape::quote_command;
use super::{Context, Error, HostError, Options, SetRap, Target};

use futures::future::join_all;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

/// One thing to do on every target of a [`Set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Run a whitelisted command. See [`Target::execute`].
    Execute {
        /// Whitelist name.
        name: String,
        /// Arguments, quoted in safe mode.
        args: Vec<String>,
    },
    /// Run lines in one shell session. See [`Target::batch`].
    Batch(Vec<String>),
    /// Copy local paths to the target.
    Upload {
        /// Local files or directories.
        sources: Vec<PathBuf>,
        /// Remote destination.
        target: PathBuf,
        /// Walk directories.
        recursive: bool,
    },
    /// Copy remote paths here.
    ///
    /// When run on a [`Set`], each host's download lands at `target/<host>`.
    Download {
        /// Remote files or directories.
        sources: Vec<PathBuf>,
        /// Local destination.
        target: PathBuf,
        /// Walk directories.
        recursive: bool,
    },
}

impl Operation {
    /// [`Operation::Execute`] from anything string-like.
    pub fn execute<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Operation::Execute {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn for_host(&self, host: &str) -> Operation {
        match *self {
            Operation::Download {
                ref sources,
                ref target,
                recursive,
            } => Operation::Download {
                sources: sources.clone(),
                target: target.join(host),
                recursive,
            },
            ref other => other.clone(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn paths(p: &[PathBuf]) -> String {
            p.iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" ")
        }
        match *self {
            Operation::Execute { ref name, ref args } => f.write_str(&quote_command(name, args)),
            Operation::Batch(ref lines) => f.write_str(&lines.join("; ")),
            Operation::Upload {
                ref sources,
                ref target,
                ..
            } => write!(f, "upload {} -> {}", paths(sources), target.display()),
            Operation::Download {
                ref sources,
                ref target,
                ..
            } => write!(f, "download {} -> {}", paths(sources), target.display()),
        }
    }
}

/// An ordered group of targets that take the same operations.
///
/// Results come back in the order targets were added, whether they ran one at a time or all
/// at once.
#[derive(Debug)]
pub struct Set {
    name: String,
    targets: Vec<Target>,
    parallel: bool,
    opts: Options,
    ctx: Arc<Context>,
}

impl Set {
    /// An empty set. Hosts added by name get `opts`.
    pub fn new(ctx: Arc<Context>, name: impl Into<String>, opts: Options) -> Self {
        Self {
            name: name.into(),
            targets: Vec::new(),
            parallel: false,
            opts,
            ctx,
        }
    }

    /// Run on every target at once, one task each.
    ///
    /// Default `false`.
    pub fn parallel(&mut self, parallel: bool) -> &mut Self {
        self.parallel = parallel;
        self
    }

    /// The set's name. Labels every [`SetRap`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options given to hosts added by name.
    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// The targets, in order.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// The targets, in order, for per-target tweaks.
    pub fn targets_mut(&mut self) -> &mut [Target] {
        &mut self.targets
    }

    /// Number of targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// `true` if there are no targets.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Add a prepared target. It also gets the set's extra keys.
    pub fn add_target(&mut self, mut target: Target) -> &mut Self {
        target.add_keys(&self.opts.keys);
        self.targets.push(target);
        self
    }

    /// Add `host` with the set's options.
    pub fn add_host(&mut self, host: impl Into<String>) -> Result<&mut Self, Error> {
        let target = Target::new(Arc::clone(&self.ctx), host, self.opts.clone())?;
        self.targets.push(target);
        Ok(self)
    }

    /// Add each of `hosts` with the set's options.
    pub fn add_hosts<I, S>(&mut self, hosts: I) -> Result<&mut Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for host in hosts {
            self.add_host(host)?;
        }
        Ok(self)
    }

    /// Offer these keys on every target, including ones added later.
    pub fn add_keys<I, P>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let keys: Vec<PathBuf> = keys.into_iter().map(|k| k.as_ref().to_path_buf()).collect();
        self.opts.keys(&keys);
        for target in &mut self.targets {
            target.add_keys(&keys);
        }
        self
    }

    /// Stop offering these keys anywhere.
    pub fn remove_keys<I, P>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let keys: Vec<PathBuf> = keys.into_iter().map(|k| k.as_ref().to_path_buf()).collect();
        self.opts.keys.retain(|k| !keys.contains(k));
        for target in &mut self.targets {
            target.remove_keys(&keys);
        }
        self
    }

    /// Export `name=value` on every target.
    pub fn setenv(&mut self, name: &str, value: &str) -> Result<&mut Self, Error> {
        for target in &mut self.targets {
            target.setenv(name, value)?;
        }
        Ok(self)
    }

    /// Change directory on every target. See [`Target::cd`].
    pub fn cd(&mut self, dir: &str) -> &mut Self {
        for target in &mut self.targets {
            target.cd(dir);
        }
        self
    }

    /// Disconnect every target. Never fails.
    pub async fn disconnect(&mut self) {
        join_all(self.targets.iter_mut().map(Target::disconnect)).await;
    }

    /// Run `name` with `args` everywhere. See [`Set::apply`].
    pub async fn execute<S: AsRef<str>>(&mut self, name: &str, args: &[S]) -> Result<SetRap, Error> {
        let op = Operation::execute(name, args.iter().map(|a| a.as_ref().to_owned()));
        self.apply(op).await
    }

    /// Run `op` on every target.
    ///
    /// Each target checks `op` against the whitelist in its own mode first, and a rejection
    /// stops everything before anything runs. Serially, the first error is returned. In
    /// parallel, each host's error is kept as a [`HostError`] in its place and the others
    /// carry on.
    pub async fn apply(&mut self, op: Operation) -> Result<SetRap, Error> {
        if self.targets.is_empty() {
            return Err(Error::NoTargets);
        }
        self.check_whitelist(&op)?;
        debug!(set = %self.name, %op, targets = self.targets.len(), parallel = self.parallel, "applying");

        if self.parallel {
            Ok(self.apply_parallel(op).await)
        } else {
            self.apply_serial(op).await
        }
    }

    /// Every target checks `op` in its own mode, so one unsafe target does not open up the
    /// others and one safe target is not skipped.
    fn check_whitelist(&self, op: &Operation) -> Result<(), Error> {
        self.targets.iter().try_for_each(|target| target.check(op))
    }

    async fn apply_serial(&mut self, op: Operation) -> Result<SetRap, Error> {
        let mut out = SetRap::new(self.name.clone());
        for target in &mut self.targets {
            let rap = target.apply(&op.for_host(target.host())).await?;
            out.push(Ok(rap));
        }
        Ok(out)
    }

    async fn apply_parallel(&mut self, op: Operation) -> SetRap {
        let targets = std::mem::take(&mut self.targets);
        let mut workers = Vec::with_capacity(targets.len());
        for mut target in targets {
            let host = target.host().to_owned();
            let op = op.for_host(&host);
            let handle = tokio::spawn(async move {
                let result = target.apply(&op).await;
                (target, result)
            });
            workers.push((host, handle));
        }

        let mut out = SetRap::new(self.name.clone());
        for (host, handle) in workers {
            match handle.await {
                Ok((target, result)) => {
                    self.targets.push(target);
                    out.push(result.map_err(|e| HostError::new(host, e)));
                }
                Err(e) => {
                    warn!(set = %self.name, %host, error = %e, "worker died");
                    // the target went down with its task; put a fresh one in its place
                    if let Ok(target) = Target::new(Arc::clone(&self.ctx), host.as_str(), self.opts.clone()) {
                        self.targets.push(target);
                    }
                    out.push(Err(HostError::new(host, Error::Worker(e.to_string()))));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{lock, MockConnector};
    use crate::{ErrorKind, Rap};
    use pretty_assertions::assert_eq;

    fn set(mock: &MockConnector, hosts: &[&str]) -> Set {
        let mut opts = Options::default();
        opts.user("deploy");
        let mut set = Set::new(Arc::new(mock.context()), "web", opts);
        set.add_hosts(hosts.iter().copied()).unwrap();
        set
    }

    #[tokio::test]
    async fn empty_set() {
        let mock = MockConnector::new();
        let mut s = Set::new(Arc::new(mock.context()), "none", Options::default());
        assert!(s.is_empty());
        assert!(matches!(
            s.execute("uptime", &[] as &[&str]).await,
            Err(Error::NoTargets)
        ));
    }

    #[tokio::test]
    async fn parallel_keeps_order_and_errors() {
        let mock = MockConnector::new().unresolvable("b");
        let mut s = set(&mock, &["a", "b", "c"]);
        s.parallel(true);

        let out = s.execute("hostname", &[] as &[&str]).await.unwrap();
        assert_eq!(out.origin(), "web");
        assert_eq!(out.len(), 3);
        let shape: Vec<_> = out
            .iter()
            .map(|r| match *r {
                Ok(ref rap) => format!("ok {}", rap.stdout().join(",")),
                Err(ref e) => format!("err {} {:?}", e.host(), e.error().kind()),
            })
            .collect();
        assert_eq!(shape, vec!["ok a", "err b Transport", "ok c"]);
        assert!(!out.is_success());

        // targets come back in order
        let hosts: Vec<_> = s.targets().iter().map(Target::host).collect();
        assert_eq!(hosts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn serial_fails_fast() {
        let mock = MockConnector::new().unresolvable("b");
        let mut s = set(&mock, &["a", "b", "c"]);

        let err = s.execute("hostname", &[] as &[&str]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(mock.commands("a"), vec!["hostname"]);
        assert!(mock.commands("c").is_empty());
    }

    #[tokio::test]
    async fn whitelist_checked_before_fan_out() {
        let mock = MockConnector::new();
        let mut s = set(&mock, &["a", "b"]);
        s.parallel(true);
        let err = s.execute("reboot", &[] as &[&str]).await.unwrap_err();
        assert!(matches!(err, Error::CommandNotFound(ref n) if n == "reboot"));
        assert!(lock(&mock.state).connects.is_empty());
    }

    #[tokio::test]
    async fn batch_lines_checked_before_fan_out() {
        let mock = MockConnector::new();
        let mut s = set(&mock, &["a", "b"]);
        s.parallel(true);
        let err = s
            .apply(Operation::Batch(vec!["echo hi".into(), "reboot now".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandNotFound(ref n) if n == "reboot"));
        assert!(lock(&mock.state).connects.is_empty());

        let out = s
            .apply(Operation::Batch(vec!["echo $HOME".into()]))
            .await
            .unwrap();
        assert!(out.successes().all(|rap| rap.command() == "echo '$HOME'"));
    }

    #[tokio::test]
    async fn each_target_keeps_its_own_mode() {
        let mock = MockConnector::new();

        // one unsafe target does not open up the others
        let mut s = set(&mock, &["a", "b"]);
        s.targets_mut()[1].set_safe(false);
        let err = s.execute("reboot", &[] as &[&str]).await.unwrap_err();
        assert!(matches!(err, Error::CommandNotFound(ref n) if n == "reboot"));
        assert!(lock(&mock.state).connects.is_empty());

        let out = s.apply(Operation::Batch(vec!["echo $HOME".into()])).await.unwrap();
        let commands: Vec<_> = out.successes().map(Rap::command).collect();
        assert_eq!(commands, vec!["echo '$HOME'", "echo $HOME"]);

        // and one safe target in an unsafe set still refuses
        let mut opts = Options::default();
        opts.safe(false);
        let mut s = Set::new(Arc::new(mock.context()), "loose", opts);
        s.add_hosts(["c", "d"]).unwrap();
        s.targets_mut()[0].set_safe(true);
        let err = s.execute("reboot", &[] as &[&str]).await.unwrap_err();
        assert!(matches!(err, Error::CommandNotFound(ref n) if n == "reboot"));
        assert!(mock.commands("d").is_empty());
    }

    #[tokio::test]
    async fn shared_state_changes() {
        let mock = MockConnector::new();
        let mut s = set(&mock, &["a", "b"]);
        s.cd("/srv").setenv("STAGE", "prod").unwrap();
        s.add_keys(["/keys/deploy"]);
        s.add_host("c").unwrap();

        s.execute("uptime", &[] as &[&str]).await.unwrap();
        assert_eq!(mock.commands("a"), vec!["export STAGE=prod; cd /srv && uptime"]);
        assert_eq!(mock.commands("c"), vec!["uptime"]);
        let state = lock(&mock.state);
        assert!(state
            .connects
            .iter()
            .all(|p| p.keys == vec![PathBuf::from("/keys/deploy")]));
        drop(state);

        s.remove_keys(["/keys/deploy"]);
        assert!(s.targets().iter().all(|t| t.options().keys.is_empty()));
        s.disconnect().await;
        assert_eq!(lock(&mock.state).closed.len(), 3);
    }

    #[tokio::test]
    async fn downloads_split_by_host() {
        let mock = MockConnector::new()
            .file("a", "/etc/hostname", b"a\n")
            .file("b", "/etc/hostname", b"b\n");
        let mut s = set(&mock, &["a", "b"]);
        s.parallel(true);
        let dir = tempfile::tempdir().unwrap();

        let out = s
            .apply(Operation::Download {
                sources: vec!["/etc/hostname".into()],
                target: dir.path().to_path_buf(),
                recursive: false,
            })
            .await
            .unwrap();
        assert!(out.is_success());
        assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), b"a\n");
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), b"b\n");
    }
}
