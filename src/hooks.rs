use super::{Error, ErrorKind, Rap};

use std::collections::HashMap;
use std::fmt;

/// What to do about an error raised while running a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Run the same command again.
    Retry,
    /// Swallow the error and return a failed [`Rap`] instead.
    Skip,
    /// Open an interactive shell on the target for manual repair, then carry on.
    Interactive,
    /// Return the error to the caller.
    Raise,
}

/// What an exception hook gets to see.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    /// The command line that failed.
    pub command: &'a str,
    /// Login user, if known.
    pub user: Option<&'a str>,
    /// Target host.
    pub host: &'a str,
    /// 1 for the first failure, 2 after one retry, and so on.
    pub attempt: u32,
}

type PreHook = Box<dyn FnMut(&str, Option<&str>, &str) + Send>;
type PostHook = Box<dyn FnMut(&Rap) + Send>;
type LineHook = Box<dyn FnMut(&str) + Send>;
type ExceptionHook = Box<dyn FnMut(&Error, &HookContext<'_>) -> HookAction + Send>;

/// Per-target callbacks. All but the exception hooks are silenced in quiet mode.
#[derive(Default)]
pub struct Hooks {
    pub(crate) pre: Option<PreHook>,
    pub(crate) post: Option<PostHook>,
    pub(crate) stdout: Option<LineHook>,
    pub(crate) exception: HashMap<ErrorKind, ExceptionHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.exception.keys().collect();
        kinds.sort_by_key(|k| format!("{:?}", k));
        f.debug_struct("Hooks")
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("exception", &kinds)
            .finish()
    }
}

impl Hooks {
    /// Called before every command with the command line, user and host.
    pub fn pre<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut(&str, Option<&str>, &str) + Send + 'static,
    {
        self.pre = Some(Box::new(f));
        self
    }

    /// Called with every completed result.
    pub fn post<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut(&Rap) + Send + 'static,
    {
        self.post = Some(Box::new(f));
        self
    }

    /// Called with each stdout line as it arrives.
    pub fn stdout<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.stdout = Some(Box::new(f));
        self
    }

    /// Decide what happens when an error of `kind` is raised.
    pub fn on_error<F>(&mut self, kind: ErrorKind, f: F) -> &mut Self
    where
        F: FnMut(&Error, &HookContext<'_>) -> HookAction + Send + 'static,
    {
        self.exception.insert(kind, Box::new(f));
        self
    }

    /// Forget the handler for `kind`.
    pub fn clear_error(&mut self, kind: ErrorKind) -> &mut Self {
        self.exception.remove(&kind);
        self
    }

    /// Consult the handler for `err`. No handler means [`HookAction::Raise`].
    pub(crate) fn decide(&mut self, err: &Error, ctx: &HookContext<'_>) -> HookAction {
        match self.exception.get_mut(&err.kind()) {
            Some(hook) => hook(err, ctx),
            None => HookAction::Raise,
        }
    }
}
