use super::Error;

use std::fmt;

/// The result of one command run on one target.
///
/// A `Rap` is created when the command starts and filled in as output arrives. By the time a
/// caller sees it the exit status has been settled: it is never the internal `-1` placeholder
/// unless the remote side itself reported `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rap {
    origin: String,
    command: String,
    stdout: Vec<String>,
    stderr: Vec<String>,
    exit_status: i32,
    exit_signal: Option<String>,
    pid: Option<u32>,
}

impl Rap {
    /// Create an empty, not-yet-completed result for `command` run by `origin`.
    pub fn new(origin: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            command: command.into(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_status: -1,
            exit_signal: None,
            pid: None,
        }
    }

    /// A completed result standing in for an error that was skipped by an exception hook.
    pub(crate) fn from_error(
        origin: impl Into<String>,
        command: impl Into<String>,
        err: &Error,
    ) -> Self {
        let mut rap = Self::new(origin, command);
        rap.add_stderr(&err.to_string());
        rap.exit_status = 1;
        rap
    }

    /// `user@host` of the target (or the name of the set) that produced this result.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The literal command line that was sent to the remote shell.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Standard output, split into lines without their terminators.
    pub fn stdout(&self) -> &[String] {
        &self.stdout
    }

    /// Standard error, split into lines without their terminators.
    pub fn stderr(&self) -> &[String] {
        &self.stderr
    }

    /// Exit status reported by the remote process.
    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    /// Name of the signal that terminated the remote process, if any (e.g. `TERM`).
    pub fn exit_signal(&self) -> Option<&str> {
        self.exit_signal.as_deref()
    }

    /// Process id of the channel, when the transport can report one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Only a status strictly greater than zero, or a delivered signal, counts as a failure.
    ///
    /// Some remote utilities report `-1` for advisory conditions; that is not a failure.
    pub fn is_success(&self) -> bool {
        self.exit_status <= 0 && self.exit_signal.is_none()
    }

    /// Opposite of [`Rap::is_success`].
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// Consume the result and return its stdout lines.
    pub fn into_stdout(self) -> Vec<String> {
        self.stdout
    }

    pub(crate) fn add_stdout(&mut self, text: &str) {
        push_lines(&mut self.stdout, text);
    }

    pub(crate) fn add_stderr(&mut self, text: &str) {
        push_lines(&mut self.stderr, text);
    }

    pub(crate) fn push_stdout_line(&mut self, line: String) {
        self.stdout.push(line);
    }

    pub(crate) fn push_stderr_line(&mut self, line: String) {
        self.stderr.push(line);
    }

    pub(crate) fn set_exit_status(&mut self, status: i32) {
        self.exit_status = status;
    }

    pub(crate) fn set_exit_signal(&mut self, signal: impl Into<String>) {
        self.exit_signal = Some(signal.into());
    }

    pub(crate) fn set_pid(&mut self, pid: Option<u32>) {
        self.pid = pid;
    }

    pub(crate) fn set_origin(&mut self, origin: impl Into<String>) {
        self.origin = origin.into();
    }

    /// Settle the placeholder status once the channel has closed.
    pub(crate) fn finalize(&mut self, status: Option<i32>) {
        self.exit_status = match (status, self.exit_signal.as_deref()) {
            (Some(status), _) => status,
            (None, Some(sig)) => 128 + signal_number(sig).unwrap_or(127),
            (None, None) => 0,
        };
    }
}

impl fmt::Display for Rap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stdout.join("\n"))
    }
}

fn push_lines(into: &mut Vec<String>, text: &str) {
    into.extend(
        text.lines()
            .map(|line| line.strip_suffix('\r').unwrap_or(line).to_owned()),
    );
}

const SIGNALS: &[(&str, i32)] = &[
    ("HUP", 1),
    ("INT", 2),
    ("QUIT", 3),
    ("ILL", 4),
    ("TRAP", 5),
    ("ABRT", 6),
    ("BUS", 7),
    ("FPE", 8),
    ("KILL", 9),
    ("USR1", 10),
    ("SEGV", 11),
    ("USR2", 12),
    ("PIPE", 13),
    ("ALRM", 14),
    ("TERM", 15),
];

/// Number of a POSIX signal given its name, with or without the `SIG` prefix.
pub fn signal_number(name: &str) -> Option<i32> {
    let name = name.strip_prefix("SIG").unwrap_or(name);
    SIGNALS.iter().find(|(n, _)| *n == name).map(|(_, num)| *num)
}

/// Name (without `SIG`) of a POSIX signal given its number.
pub fn signal_name(num: i32) -> Option<&'static str> {
    SIGNALS.iter().find(|(_, n)| *n == num).map(|(name, _)| *name)
}

/// A failure on one host of a [`Set`](crate::Set).
#[derive(Debug)]
pub struct HostError {
    host: String,
    error: Error,
}

impl HostError {
    pub(crate) fn new(host: impl Into<String>, error: Error) -> Self {
        Self {
            host: host.into(),
            error,
        }
    }

    /// The host the error came from.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The error itself.
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// Unwrap into the underlying error.
    pub fn into_error(self) -> Error {
        self.error
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.host, self.error)
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Aggregate result of running one operation across a [`Set`](crate::Set).
///
/// Entries are always in the order the targets were added to the set, regardless of the
/// order they finished in.
#[derive(Debug)]
pub struct SetRap {
    origin: String,
    results: Vec<Result<Rap, HostError>>,
}

impl SetRap {
    pub(crate) fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            results: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, result: Result<Rap, HostError>) {
        self.results.push(result);
    }

    /// Name of the set that produced this result.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// One entry per target, in insertion order.
    pub fn results(&self) -> &[Result<Rap, HostError>] {
        &self.results
    }

    /// Iterate over the per-target entries.
    pub fn iter(&self) -> std::slice::Iter<'_, Result<Rap, HostError>> {
        self.results.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// The successful per-target results.
    pub fn successes(&self) -> impl Iterator<Item = &Rap> {
        self.results.iter().filter_map(|r| r.as_ref().ok())
    }

    /// The captured per-target errors.
    pub fn errors(&self) -> impl Iterator<Item = &HostError> {
        self.results.iter().filter_map(|r| r.as_ref().err())
    }

    /// `true` if every target produced a successful result.
    pub fn is_success(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.as_ref().map_or(false, Rap::is_success))
    }

    /// Unwrap into the per-target entries.
    pub fn into_results(self) -> Vec<Result<Rap, HostError>> {
        self.results
    }
}

impl IntoIterator for SetRap {
    type Item = Result<Rap, HostError>;
    type IntoIter = std::vec::IntoIter<Result<Rap, HostError>>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl fmt::Display for SetRap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, result) in self.results.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match result {
                Ok(rap) => write!(f, "{}", rap)?,
                Err(e) => write!(f, "{}", e)?,
            }
        }
        Ok(())
    }
}
