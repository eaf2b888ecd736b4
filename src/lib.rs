//! Safe, scriptable remote command execution over SSH.
//!
//! This crate runs shell commands on remote hosts through the OpenSSH remote login client
//! (`ssh` on most machines). Since all commands go through `ssh`, your existing configuration
//! (e.g., in `.ssh/config`) should continue to work as expected.
//!
//! The main type is [`Target`]: one host, connected lazily on first use, that remembers a
//! working directory, a umask and environment overrides and applies them to every command.
//! Commands are named rather than written as shell text. In safe mode (the default) only names
//! in the [`Registry`] whitelist may run, and every argument is quoted so that the remote shell
//! sees it as a single word. With safe mode off, arguments reach the shell verbatim, so globs
//! and `$VARS` work, along with everything else that makes shell text dangerous.
//!
//! Every command yields a [`Rap`]: the lines written to stdout and stderr, the exit status and
//! signal, and the command line that ran. A non-zero exit is an [`Error::Command`] carrying its
//! `Rap`, unless the target is quiet, in which case the `Rap` is simply returned. Per-target
//! [`Hooks`] see each command before and after it runs, and can decide to retry, skip or drop
//! into an interactive shell when one fails.
//!
//! A [`Set`] groups targets and runs the same [`Operation`] on all of them, one at a time or
//! with one task per host. Results come back in a [`SetRap`] in the order targets were added,
//! and in parallel mode a failing host does not stop the others.
//!
//! A target can be routed through one or more relay [`Hop`]s. A hop forwards a local port to
//! the next host and services its session on a background task; hops can be chained to any
//! depth.
//!
//! # Connections
//!
//! Behind the scenes, each connection is an `ssh` [`ControlMaster`] living in a private
//! temporary directory. Every command is its own `ssh` process multiplexed over that master, so
//! authentication happens once per host. Everything above the connection only sees the
//! [`Connector`], [`Transport`] and [`Channel`] traits, and the OpenSSH backend is gated behind
//! the default `process-mux` feature.
//!
//! Host key mismatches and failed logins are put to the [`Prompter`](prompt::Prompter) of the
//! [`Context`], if there is an interactive one: a changed key can be accepted once, and a
//! password can be asked for up to three times.
//!
//! # Errors
//!
//! Since we are wrapping `ssh`, which in turn runs a remote command that we do not control, we
//! do not have a reliable way to tell the difference between what is a failure of the SSH
//! connection itself, and what is a program error from the remote host. We do our best with some
//! heuristics (like `ssh` exiting with status code 255 while the master is gone), but the
//! errors from this crate will almost necessarily be worse than those of a native SSH
//! implementation.
//!
//! # Examples
//!
//! ```rust,no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), sshbox::Error> {
//! use std::sync::Arc;
//! use sshbox::{Context, Options, Set, Target};
//!
//! let ctx = Arc::new(Context::new());
//! let mut opts = Options::default();
//! opts.user("deploy");
//!
//! let mut web = Target::new(Arc::clone(&ctx), "web1.example.com", opts.clone())?;
//! web.cd("/srv/app").setenv("RAILS_ENV", "production")?;
//! let ls = web.execute("ls", &["-l", "config"]).await?;
//! for line in ls.stdout() {
//!     println!("{}", line);
//! }
//! web.disconnect().await;
//!
//! let mut all = Set::new(ctx, "web", opts);
//! all.add_hosts(["web1.example.com", "web2.example.com"])?.parallel(true);
//! let uptimes = all.execute("uptime", &[] as &[&str]).await?;
//! println!("{}", uptimes);
//! all.disconnect().await;
//! # Ok(()) }
//! ```
//!
//!   [`ControlMaster`]: https://en.wikibooks.org/wiki/OpenSSH/Cookbook/Multiplexing

#![warn(
    missing_docs,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links,
    rust_2018_idioms,
    unreachable_pub
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod error;
pub use error::{Error, ErrorKind};

pub mod escape;

mod rap;
pub use rap::{signal_name, signal_number, HostError, Rap, SetRap};

pub mod registry;
pub use registry::{CommandSpec, Registry};

pub mod prompt;

mod transport;
pub use transport::{Channel, ChannelEvent, ChannelRequest, ConnectParams, Connector, Transport};

mod port_forwarding;
pub use port_forwarding::LocalForward;

mod builder;
pub use builder::{default_keys, KnownHosts, SessionBuilder};

#[cfg(feature = "process-mux")]
mod process_impl;
#[cfg(feature = "process-mux")]
#[cfg_attr(docsrs, doc(cfg(feature = "process-mux")))]
pub use process_impl::{OpenSsh, Session};

mod context;
pub use context::Context;

mod connection;
pub use connection::{Connection, DISCONNECT_TIMEOUT, MAX_PASSWORD_ATTEMPTS};

pub mod runner;

pub mod transfer;
pub use transfer::{Direction, Endpoint, TransferManager};

mod command;
pub use command::CommandLine;

mod hooks;
pub use hooks::{HookAction, HookContext, Hooks};

pub mod hop;
pub use hop::{Hop, Via};

mod target;
pub use target::{Options, Target};

mod set;
pub use set::{Operation, Set};

mod executor;
pub use executor::CommandExecutor;

#[cfg(test)]
mod testing;
