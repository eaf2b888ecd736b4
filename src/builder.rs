use super::ConnectParams;
#[cfg(feature = "process-mux")]
use super::{process_impl, Error};

use secrecy::SecretString;

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Build an OpenSSH session with options.
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    pub(crate) user: Option<String>,
    pub(crate) port: Option<String>,
    pub(crate) keyfiles: Vec<PathBuf>,
    pub(crate) connect_timeout: Option<String>,
    pub(crate) server_alive_interval: Option<u64>,
    pub(crate) known_hosts_check: KnownHosts,
    pub(crate) control_dir: Option<PathBuf>,
    pub(crate) config_file: Option<PathBuf>,
    pub(crate) host_key_alias: Option<String>,
    pub(crate) password: Option<SecretString>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            user: None,
            port: None,
            keyfiles: Vec::new(),
            connect_timeout: None,
            server_alive_interval: None,
            known_hosts_check: KnownHosts::Add,
            control_dir: None,
            config_file: None,
            host_key_alias: None,
            password: None,
        }
    }
}

impl SessionBuilder {
    /// Set the ssh user (`ssh -l`).
    ///
    /// Defaults to `None`.
    pub fn user(&mut self, user: String) -> &mut Self {
        self.user = Some(user);
        self
    }

    /// Set the port to connect on (`ssh -p`).
    ///
    /// Defaults to `None`.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.port = Some(format!("{}", port));
        self
    }

    /// Add a keyfile to offer (`ssh -i`). May be called more than once.
    ///
    /// Once any keyfile is given, _only_ the given keyfiles are offered.
    pub fn keyfile(&mut self, p: impl AsRef<Path>) -> &mut Self {
        self.keyfiles.push(p.as_ref().to_path_buf());
        self
    }

    /// See [`KnownHosts`].
    ///
    /// Default `KnownHosts::Add`.
    pub fn known_hosts_check(&mut self, k: KnownHosts) -> &mut Self {
        self.known_hosts_check = k;
        self
    }

    /// Set the connection timeout (`ssh -o ConnectTimeout`).
    ///
    /// This value is specified in seconds. Any sub-second duration remainder will be ignored.
    /// Defaults to `None`.
    pub fn connect_timeout(&mut self, d: Duration) -> &mut Self {
        self.connect_timeout = Some(d.as_secs().to_string());
        self
    }

    /// Set the timeout interval after which if no data has been received from the server, ssh
    /// will request a response from the server (`ssh -o ServerAliveInterval`).
    ///
    /// Defaults to `None`.
    pub fn server_alive_interval(&mut self, d: Duration) -> &mut Self {
        self.server_alive_interval = Some(d.as_secs());
        self
    }

    /// Set the directory in which the temporary directory containing the control socket will
    /// be created.
    ///
    /// If not set, the system temporary directory is used.
    pub fn control_directory(&mut self, p: impl AsRef<Path>) -> &mut Self {
        self.control_dir = Some(p.as_ref().to_path_buf());
        self
    }

    /// Set an alternative per-user configuration file (`ssh -F`).
    ///
    /// Defaults to `None`.
    pub fn config_file(&mut self, p: impl AsRef<Path>) -> &mut Self {
        self.config_file = Some(p.as_ref().to_path_buf());
        self
    }

    /// Check the host key against `alias` instead of the destination (`ssh -o HostKeyAlias`).
    ///
    /// Needed when the destination is a forwarded port on `127.0.0.1`.
    pub fn host_key_alias(&mut self, alias: impl Into<String>) -> &mut Self {
        self.host_key_alias = Some(alias.into());
        self
    }

    /// Answer ssh's password prompt with `password`.
    ///
    /// The password is handed to ssh through a private askpass helper, never on the command
    /// line.
    pub fn password(&mut self, password: SecretString) -> &mut Self {
        self.password = Some(password);
        self
    }

    /// Copy the per-connection settings of `params` over this builder.
    pub(crate) fn apply(&mut self, params: &ConnectParams) -> &mut Self {
        if let Some(ref user) = params.user {
            self.user(user.clone());
        }
        if let Some(port) = params.port {
            self.port(port);
        }
        for key in &params.keys {
            self.keyfile(key);
        }
        if let Some(timeout) = params.connect_timeout {
            self.connect_timeout(timeout);
        }
        if let Some(ref alias) = params.host_key_alias {
            self.host_key_alias(alias.clone());
        }
        self.known_hosts_check = params.known_hosts;
        self.password = params.password.clone();
        self
    }

    /// Connect to the host at the given `destination` over SSH.
    ///
    /// The format of `destination` is the same as the `destination` argument to `ssh`. It may be
    /// specified as either `[user@]hostname` or a URI of the form `ssh://[user@]hostname[:port]`.
    /// A username or port that is specified in the connection string overrides the one set in the
    /// builder (but does not change the builder).
    #[cfg(feature = "process-mux")]
    #[cfg_attr(docsrs, doc(cfg(feature = "process-mux")))]
    pub async fn connect<S: AsRef<str>>(
        &self,
        destination: S,
    ) -> Result<process_impl::Session, Error> {
        let (builder, destination) = self.resolve(destination.as_ref());
        process_impl::builder::just_connect(&builder, destination).await
    }

    pub(crate) fn resolve<'a, 'b>(&'a self, mut destination: &'b str) -> (Cow<'a, Self>, &'b str) {
        // the ssh://user@host:port form is not understood by every ssh, so it is always
        // translated into options.
        let mut user = None;
        let mut port = None;
        if let Some(rest) = destination.strip_prefix("ssh://") {
            destination = rest;
            if let Some((u, rest)) = destination.split_once('@') {
                user = Some(u);
                destination = rest;
            }
            if let Some((host, p)) = destination.rsplit_once(':') {
                if let Ok(p) = p.parse() {
                    port = Some(p);
                    destination = host;
                }
            }
        }

        if user.is_none() && port.is_none() {
            return (Cow::Borrowed(self), destination);
        }

        let mut with_overrides = self.clone();
        if let Some(user) = user {
            with_overrides.user(user.to_owned());
        }
        if let Some(port) = port {
            with_overrides.port(port);
        }
        (Cow::Owned(with_overrides), destination)
    }
}

/// Specifies how the host's key fingerprint should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownHosts {
    /// The host's fingerprint must match what is in the known hosts file.
    ///
    /// If the host is not in the known hosts file, the connection is rejected.
    ///
    /// This corresponds to `ssh -o StrictHostKeyChecking=yes`.
    Strict,
    /// Strict, but if the host is not already in the known hosts file, it will be added.
    ///
    /// This corresponds to `ssh -o StrictHostKeyChecking=accept-new`.
    Add,
    /// Accept whatever key the server provides.
    ///
    /// This corresponds to `ssh -o StrictHostKeyChecking=no`, plus a throwaway known hosts
    /// file so that a changed key does not abort the connection.
    Accept,
}

impl KnownHosts {
    pub(crate) fn as_option(&self) -> &'static str {
        match *self {
            KnownHosts::Strict => "StrictHostKeyChecking=yes",
            KnownHosts::Add => "StrictHostKeyChecking=accept-new",
            KnownHosts::Accept => "StrictHostKeyChecking=no",
        }
    }
}

/// Private keys found under `~/.ssh` with the usual OpenSSH names.
pub fn default_keys() -> Vec<PathBuf> {
    let dir = match dirs::home_dir() {
        Some(home) => home.join(".ssh"),
        None => return Vec::new(),
    };
    ["id_ed25519", "id_ecdsa", "id_rsa", "id_dsa"]
        .iter()
        .map(|name| dir.join(name))
        .filter(|p| p.is_file())
        .collect()
}
