use super::Error;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A hand-written command body.
///
/// Receives the caller's arguments and returns the argument list that is actually sent to
/// the remote executable, or an error to refuse the call.
pub type NativeFn = Arc<dyn Fn(&[String]) -> Result<Vec<String>, Error> + Send + Sync>;

/// How a whitelisted operation name maps onto a remote executable.
#[derive(Clone)]
pub struct CommandSpec {
    path: String,
    fixed_args: Vec<String>,
    native: Option<NativeFn>,
}

impl CommandSpec {
    /// A command that runs `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            fixed_args: Vec::new(),
            native: None,
        }
    }

    /// Arguments always passed before the caller's own.
    pub fn fixed_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fixed_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Run the caller's arguments through `f` before sending the command.
    pub fn native<F>(mut self, f: F) -> Self
    where
        F: Fn(&[String]) -> Result<Vec<String>, Error> + Send + Sync + 'static,
    {
        self.native = Some(Arc::new(f));
        self
    }

    /// Remote executable path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Leading arguments.
    pub fn args(&self) -> &[String] {
        &self.fixed_args
    }

    /// Resolve the full argument list for a call with `args`.
    pub fn resolve_args(&self, args: &[String]) -> Result<Vec<String>, Error> {
        let tail = match self.native {
            Some(ref f) => f(args)?,
            None => args.to_vec(),
        };
        let mut all = self.fixed_args.clone();
        all.extend(tail);
        Ok(all)
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("path", &self.path)
            .field("fixed_args", &self.fixed_args)
            .field("native", &self.native.is_some())
            .finish()
    }
}

/// The safe-mode whitelist: every operation name a target may run, and what it runs.
///
/// Names not present here are rejected with [`Error::CommandNotFound`] while safe mode is on.
/// The registry is only ever changed through [`Registry::register`],
/// [`Registry::register_native`] and [`Registry::remove`].
#[derive(Debug, Clone)]
pub struct Registry {
    commands: BTreeMap<String, CommandSpec>,
}

const STOCK: &[&str] = &[
    "wc", "cp", "mv", "ls", "ps", "sh", "df", "du", "su", "ln", "ab", "hg", "xz", "env", "pwd",
    "svn", "cvs", "git", "sed", "awk", "cat", "tar", "rake", "grep", "date", "ruby", "perl",
    "bash", "echo", "test", "mkfs", "gzip", "make", "wget", "curl", "dpkg", "unxz", "mount",
    "sleep", "mkdir", "touch", "uname", "chmod", "chown", "unzip", "bzip2", "which", "siege",
    "umount", "uptime", "python", "gunzip", "useradd", "bunzip2", "getconf", "history",
    "aptitude", "printenv", "hostname", "ldconfig", "id", "whoami", "rm", "rmdir", "find",
    "head", "tail", "stat",
];

impl Default for Registry {
    /// The stock whitelist of common, well-understood utilities.
    fn default() -> Self {
        let mut registry = Self::empty();
        for name in STOCK {
            registry.register(*name, CommandSpec::new(*name));
        }
        registry.register("configure", CommandSpec::new("./configure"));
        registry
    }
}

impl Registry {
    /// A registry that allows nothing.
    pub fn empty() -> Self {
        Self {
            commands: BTreeMap::new(),
        }
    }

    /// Add or replace `name`.
    pub fn register(&mut self, name: impl Into<String>, spec: CommandSpec) -> &mut Self {
        self.commands.insert(name.into(), spec);
        self
    }

    /// Shorthand for registering `name` with a hand-written argument transformer.
    pub fn register_native<F>(
        &mut self,
        name: impl Into<String>,
        path: impl Into<String>,
        f: F,
    ) -> &mut Self
    where
        F: Fn(&[String]) -> Result<Vec<String>, Error> + Send + Sync + 'static,
    {
        self.register(name, CommandSpec::new(path).native(f))
    }

    /// Remove `name`, returning its previous mapping.
    pub fn remove(&mut self, name: &str) -> Option<CommandSpec> {
        self.commands.remove(name)
    }

    /// Look up `name`.
    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    /// `true` if `name` is whitelisted.
    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Every whitelisted name, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Look up `name`, failing with [`Error::CommandNotFound`].
    pub(crate) fn require(&self, name: &str) -> Result<&CommandSpec, Error> {
        self.get(name)
            .ok_or_else(|| Error::CommandNotFound(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_whitelist() {
        let r = Registry::default();
        assert!(r.contains("uptime"));
        assert!(r.contains("git"));
        assert!(!r.contains("reboot"));
        assert_eq!(r.get("configure").map(CommandSpec::path), Some("./configure"));
        assert!(matches!(r.require("reboot"), Err(Error::CommandNotFound(n)) if n == "reboot"));
    }

    #[test]
    fn register_and_remove() {
        let mut r = Registry::empty();
        assert_eq!(r.names().count(), 0);

        r.register(
            "svc",
            CommandSpec::new("/usr/sbin/service").fixed_args(["--no-pager"]),
        );
        let spec = r.require("svc").unwrap();
        assert_eq!(
            spec.resolve_args(&["nginx".into(), "reload".into()]).unwrap(),
            vec!["--no-pager", "nginx", "reload"]
        );

        assert!(r.remove("svc").is_some());
        assert!(!r.contains("svc"));
        assert!(r.remove("svc").is_none());
    }

    #[test]
    fn native_transformer() {
        let mut r = Registry::empty();
        r.register_native("tailn", "tail", |args| match args {
            [n, file] => Ok(vec!["-n".into(), n.clone(), file.clone()]),
            _ => Err(Error::CommandNotFound("tailn".into())),
        });
        let spec = r.get("tailn").unwrap();
        assert_eq!(
            spec.resolve_args(&["5".into(), "/var/log/syslog".into()]).unwrap(),
            vec!["-n", "5", "/var/log/syslog"]
        );
        assert!(spec.resolve_args(&[]).is_err());
        assert!(format!("{:?}", spec).contains("native: true"));
    }
}
