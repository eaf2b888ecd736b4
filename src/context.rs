use super::prompt::Prompter;
use super::registry::{CommandSpec, Registry};
use super::Connector;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared configuration for every [`Target`](crate::Target), [`Hop`](crate::Hop) and
/// [`Set`](crate::Set) built from it.
///
/// Holds the connector used to open transports, the safe-mode [`Registry`], and the
/// [`Prompter`] used for passwords and confirmations. Build one, wrap it in an [`Arc`], and
/// hand it to everything that needs it.
#[derive(Debug)]
pub struct Context {
    connector: Arc<dyn Connector>,
    registry: RwLock<Registry>,
    prompter: Option<Arc<dyn Prompter>>,
}

impl Context {
    /// A context using the system OpenSSH client, the stock whitelist, and the terminal for
    /// prompts when stdin is one.
    #[cfg(feature = "process-mux")]
    #[cfg_attr(docsrs, doc(cfg(feature = "process-mux")))]
    pub fn new() -> Self {
        use super::prompt::TerminalPrompter;

        let ctx = Self::with_connector(Arc::new(super::OpenSsh::new()));
        if TerminalPrompter.is_interactive() {
            ctx.prompter(Arc::new(TerminalPrompter))
        } else {
            ctx
        }
    }

    /// A context that opens transports with `connector`, without a prompter.
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            registry: RwLock::new(Registry::default()),
            prompter: None,
        }
    }

    /// Use `prompter` for passwords, confirmations and interactive input.
    pub fn prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// Start from `registry` instead of the stock whitelist.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = RwLock::new(registry);
        self
    }

    /// The connector.
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// The prompter, if any.
    pub fn get_prompter(&self) -> Option<Arc<dyn Prompter>> {
        self.prompter.clone()
    }

    /// The prompter, if one is configured and a human is behind it.
    pub(crate) fn interactive_prompter(&self) -> Option<Arc<dyn Prompter>> {
        self.prompter.clone().filter(|p| p.is_interactive())
    }

    /// Read access to the whitelist.
    pub fn commands(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write access to the whitelist.
    pub fn commands_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whitelist `name`.
    pub fn add_command(&self, name: impl Into<String>, spec: CommandSpec) {
        self.commands_mut().register(name, spec);
    }

    /// Remove `name` from the whitelist.
    pub fn remove_command(&self, name: &str) -> Option<CommandSpec> {
        self.commands_mut().remove(name)
    }
}

#[cfg(feature = "process-mux")]
impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
