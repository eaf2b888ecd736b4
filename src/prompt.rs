//! Out-of-band input: lines for interactive sessions, secrets for password prompts, and
//! yes/no confirmations for the connection layer.

use secrecy::SecretString;

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::{Arc, Mutex};

/// Password prompt fragments, matched case-insensitively against the last unterminated line
/// of output.
pub const PASSWORD_PROMPT_PATTERNS: &[&str] = &[
    "[sudo] password for ",
    "password for ",
    "password:",
    "'s password:",
    "passphrase:",
    "passphrase for ",
    "enter password",
];

/// Returns `true` if `tail` looks like a prompt waiting for a password.
///
/// Only the text after the last newline is considered, since a prompt never ends in one.
pub fn is_password_prompt(tail: &str) -> bool {
    let line = tail.rsplit('\n').next().unwrap_or(tail).trim();
    if line.is_empty() {
        return false;
    }
    let lower = line.to_lowercase();
    PASSWORD_PROMPT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Source of input that does not come from the remote side.
///
/// Every method may block; async callers go through `spawn_blocking`.
pub trait Prompter: Send + Sync + fmt::Debug {
    /// Ask for one line of input. `None` means there is no more.
    fn read_line(&self, prompt: &str) -> Option<String>;

    /// Ask for a secret without echoing it. `None` means the user declined.
    fn read_secret(&self, prompt: &str) -> Option<SecretString>;

    /// Ask a yes/no question.
    fn confirm(&self, question: &str) -> bool;

    /// `true` if a human is on the other end.
    fn is_interactive(&self) -> bool;
}

/// Prompts on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn read_line(&self, prompt: &str) -> Option<String> {
        let mut stderr = io::stderr();
        let _ = write!(stderr, "{}", prompt);
        let _ = stderr.flush();

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_owned()),
        }
    }

    fn read_secret(&self, prompt: &str) -> Option<SecretString> {
        rpassword::prompt_password(prompt)
            .ok()
            .map(|p| SecretString::new(p.into_boxed_str()))
    }

    fn confirm(&self, question: &str) -> bool {
        self.read_line(&format!("{} [y/N] ", question))
            .map_or(false, |a| a.trim().eq_ignore_ascii_case("y") || a.trim().eq_ignore_ascii_case("yes"))
    }

    fn is_interactive(&self) -> bool {
        io::stdin().is_terminal()
    }
}

/// Replays canned answers. Useful for automation and tests.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    lines: Mutex<VecDeque<String>>,
    secrets: Mutex<VecDeque<String>>,
    confirm: bool,
}

impl ScriptedPrompter {
    /// A prompter with no answers queued that declines every confirmation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a line for [`Prompter::read_line`].
    pub fn line(self, line: impl Into<String>) -> Self {
        lock(&self.lines).push_back(line.into());
        self
    }

    /// Queue a secret for [`Prompter::read_secret`].
    pub fn secret(self, secret: impl Into<String>) -> Self {
        lock(&self.secrets).push_back(secret.into());
        self
    }

    /// Answer every confirmation with `yes`.
    pub fn confirm_all(mut self, yes: bool) -> Self {
        self.confirm = yes;
        self
    }

    /// Number of secrets not yet handed out.
    pub fn secrets_left(&self) -> usize {
        lock(&self.secrets).len()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Prompter for ScriptedPrompter {
    fn read_line(&self, _prompt: &str) -> Option<String> {
        lock(&self.lines).pop_front()
    }

    fn read_secret(&self, _prompt: &str) -> Option<SecretString> {
        lock(&self.secrets)
            .pop_front()
            .map(|s| SecretString::new(s.into_boxed_str()))
    }

    fn confirm(&self, _question: &str) -> bool {
        self.confirm
    }

    fn is_interactive(&self) -> bool {
        true
    }
}

pub(crate) async fn read_line(prompter: Arc<dyn Prompter>, prompt: String) -> Option<String> {
    tokio::task::spawn_blocking(move || prompter.read_line(&prompt))
        .await
        .ok()
        .flatten()
}

pub(crate) async fn read_secret(
    prompter: Arc<dyn Prompter>,
    prompt: String,
) -> Option<SecretString> {
    tokio::task::spawn_blocking(move || prompter.read_secret(&prompt))
        .await
        .ok()
        .flatten()
}

pub(crate) async fn confirm(prompter: Arc<dyn Prompter>, question: String) -> bool {
    tokio::task::spawn_blocking(move || prompter.confirm(&question))
        .await
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn detects_prompts() {
        assert!(is_password_prompt("[sudo] password for deploy: "));
        assert!(is_password_prompt("deploy@web1's password:"));
        assert!(is_password_prompt("some output\nPassword:"));
        assert!(is_password_prompt("Enter passphrase for key '/root/.ssh/id_rsa': "));
        assert!(!is_password_prompt("Password: accepted\n"));
        assert!(!is_password_prompt("total 0\n"));
        assert!(!is_password_prompt(""));
    }

    #[tokio::test]
    async fn scripted_answers() {
        let p: Arc<dyn Prompter> = Arc::new(
            ScriptedPrompter::new()
                .line("ls")
                .secret("hunter2")
                .confirm_all(true),
        );
        assert_eq!(read_line(p.clone(), "> ".into()).await.as_deref(), Some("ls"));
        assert_eq!(read_line(p.clone(), "> ".into()).await, None);
        let s = read_secret(p.clone(), "Password: ".into()).await.unwrap();
        assert_eq!(s.expose_secret(), "hunter2");
        assert!(read_secret(p.clone(), "Password: ".into()).await.is_none());
        assert!(confirm(p, "Continue?".into()).await);
    }
}
