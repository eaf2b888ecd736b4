//! The per-command state machine that drives one channel to completion.
//!
//! A [`ChannelRunner`] owns a single [`Channel`] and is polled by one task. It demultiplexes
//! stdout and stderr into a [`Rap`], answers password prompts through a [`Prompter`], feeds
//! queued input lines in interactive sessions, and settles the exit status once the channel
//! closes.

use super::prompt::{self, is_password_prompt, Prompter};
use super::{Channel, ChannelEvent, Error, Rap};

use secrecy::{ExposeSecret, SecretString};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

/// How long a single poll waits for the next channel event.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Consecutive empty polls after which the remote side is considered idle.
pub const MAX_IDLE_POLLS: u32 = 3;

/// What the runner is driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One command, sent when the channel was opened. Input is closed once the remote side
    /// goes quiet and is not waiting for a password.
    Batch,
    /// A shell. Lines come from a pre-supplied block or from the [`Prompter`], one at a time.
    Shell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    AwaitResponse,
    ReadResponse,
    SendData,
    AwaitInput,
    RunBlock,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

enum Input {
    Line(String),
    Secret(SecretString),
}

impl Input {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = match *self {
            Input::Line(ref line) => line.as_bytes().to_vec(),
            Input::Secret(ref secret) => secret.expose_secret().as_bytes().to_vec(),
        };
        bytes.push(b'\n');
        bytes
    }
}

/// A callback that sees every complete line of standard output as it arrives.
pub type StdoutHook<'h> = &'h mut (dyn FnMut(&str) + Send);

/// Drives one channel from open to close. See the module docs.
pub struct ChannelRunner<'h> {
    channel: Box<dyn Channel>,
    mode: Mode,
    state: State,
    rap: Rap,

    queue: VecDeque<Input>,
    block: Option<Vec<String>>,
    finish_when_drained: bool,

    prompter: Option<Arc<dyn Prompter>>,
    stdout_hook: Option<StdoutHook<'h>>,
    quiet: bool,
    hold_stdin: bool,

    buffered: VecDeque<(Stream, Vec<u8>)>,
    partial_out: String,
    partial_err: String,
    prompt_pending: Option<Stream>,

    idle_polls: u32,
    remote_eof: bool,
    stdin_closed: bool,
    closed: bool,
    status: Option<i32>,
}

impl fmt::Debug for ChannelRunner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRunner")
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("command", &self.rap.command())
            .field("queued", &self.queue.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl<'h> ChannelRunner<'h> {
    /// Drive `channel`, recording into `rap`.
    pub fn new(channel: Box<dyn Channel>, mode: Mode, rap: Rap) -> Self {
        Self {
            channel,
            mode,
            state: State::Start,
            rap,
            queue: VecDeque::new(),
            block: None,
            finish_when_drained: false,
            prompter: None,
            stdout_hook: None,
            quiet: false,
            hold_stdin: false,
            buffered: VecDeque::new(),
            partial_out: String::new(),
            partial_err: String::new(),
            prompt_pending: None,
            idle_polls: 0,
            remote_eof: false,
            stdin_closed: false,
            closed: false,
            status: None,
        }
    }

    /// Send these lines, in order, then leave the shell.
    pub fn block(mut self, lines: Vec<String>) -> Self {
        self.block = Some(lines);
        self
    }

    /// Where secrets and interactive lines come from.
    pub fn prompter(mut self, prompter: Option<Arc<dyn Prompter>>) -> Self {
        self.prompter = prompter;
        self
    }

    /// Called with every complete stdout line, unless [`ChannelRunner::quiet`] is set.
    pub fn stdout_hook(mut self, hook: Option<StdoutHook<'h>>) -> Self {
        self.stdout_hook = hook;
        self
    }

    /// Suppress the stdout hook.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// In batch mode, keep stdin open until a password prompt has been answered.
    ///
    /// Used for `sudo -S`, which reads the password from stdin and may be slow to ask.
    pub fn hold_stdin(mut self, hold: bool) -> Self {
        self.hold_stdin = hold;
        self
    }

    /// Run the state machine to completion.
    pub async fn run(mut self) -> Result<Rap, Error> {
        self.rap.set_pid(self.channel.pid());
        loop {
            trace!(state = ?self.state, command = self.rap.command(), "runner step");
            self.state = match self.state {
                State::Start => self.start(),
                State::AwaitResponse => self.await_response().await?,
                State::ReadResponse => self.read_response(),
                State::SendData => self.send_data().await?,
                State::AwaitInput => self.await_input().await?,
                State::RunBlock => self.run_block(),
                State::Exit => return self.exit().await,
            };
        }
    }

    fn start(&mut self) -> State {
        if self.block.is_some() {
            State::RunBlock
        } else {
            State::AwaitResponse
        }
    }

    async fn await_response(&mut self) -> Result<State, Error> {
        if self.closed {
            return Ok(State::Exit);
        }

        match self.channel.next_event(POLL_INTERVAL).await? {
            None => {
                self.idle_polls += 1;
                if self.idle_polls >= MAX_IDLE_POLLS {
                    self.idle_polls = 0;
                    Ok(State::AwaitInput)
                } else {
                    Ok(State::AwaitResponse)
                }
            }
            Some(event) => {
                self.idle_polls = 0;
                self.record(event);
                if !self.buffered.is_empty() {
                    Ok(State::ReadResponse)
                } else if self.closed {
                    Ok(State::Exit)
                } else {
                    Ok(State::AwaitResponse)
                }
            }
        }
    }

    fn read_response(&mut self) -> State {
        self.drain_buffered();
        if self.prompt_pending.is_some() {
            State::AwaitInput
        } else if !self.queue.is_empty() {
            State::SendData
        } else {
            State::AwaitResponse
        }
    }

    async fn send_data(&mut self) -> Result<State, Error> {
        if let Some(input) = self.queue.pop_front() {
            if !self.remote_eof && !self.closed && !self.stdin_closed {
                self.channel.write(&input.to_bytes()).await?;
            }
        }
        Ok(State::AwaitResponse)
    }

    async fn await_input(&mut self) -> Result<State, Error> {
        if let Some(stream) = self.prompt_pending.take() {
            let secret = self.solicit_secret(stream).await?;
            self.queue.push_back(Input::Secret(secret));
            self.hold_stdin = false;
            return Ok(State::SendData);
        }

        if !self.queue.is_empty() {
            return Ok(State::SendData);
        }
        if self.closed {
            return Ok(State::Exit);
        }

        match self.mode {
            Mode::Batch => {
                if !self.stdin_closed && !self.hold_stdin {
                    self.channel.eof().await?;
                    self.stdin_closed = true;
                }
                Ok(State::AwaitResponse)
            }
            Mode::Shell if self.finish_when_drained => Ok(State::Exit),
            Mode::Shell => {
                let prompter = match self.prompter {
                    Some(ref p) => Arc::clone(p),
                    None => return Ok(State::Exit),
                };
                match prompt::read_line(prompter, String::new()).await {
                    Some(line) => {
                        self.queue.push_back(Input::Line(line));
                        Ok(State::SendData)
                    }
                    None => Ok(State::Exit),
                }
            }
        }
    }

    fn run_block(&mut self) -> State {
        let lines = self.block.take().unwrap_or_default();
        self.queue.extend(lines.into_iter().map(Input::Line));
        self.finish_when_drained = true;
        if self.queue.is_empty() {
            State::Exit
        } else {
            State::SendData
        }
    }

    async fn exit(mut self) -> Result<Rap, Error> {
        if !self.closed {
            if self.mode == Mode::Shell && !self.remote_eof && !self.stdin_closed {
                // the shell may already be gone; the drain below settles the outcome
                if let Err(e) = self.channel.write(b"exit\n").await {
                    debug!(error = %e, "could not send exit");
                }
            }
            if !self.stdin_closed {
                if let Err(e) = self.channel.eof().await {
                    debug!(error = %e, "could not close stdin");
                }
                self.stdin_closed = true;
            }
            while !self.closed {
                if let Some(event) = self.channel.next_event(POLL_INTERVAL).await? {
                    self.record(event);
                }
                self.drain_buffered();
            }
        }

        self.drain_buffered();
        self.flush_partial(Stream::Stdout);
        self.flush_partial(Stream::Stderr);
        self.rap.finalize(self.status);
        Ok(self.rap)
    }

    async fn solicit_secret(&mut self, stream: Stream) -> Result<SecretString, Error> {
        let prompt_text = self.partial(stream).trim().to_owned();
        let prompter = self.prompter.as_ref().map(Arc::clone).ok_or(Error::NoPassword)?;

        // the prompt line is complete as far as the caller is concerned
        self.flush_partial(stream);

        let secret = prompt::read_secret(prompter, format!("{} ", prompt_text))
            .await
            .ok_or(Error::NoPassword)?;
        Ok(secret)
    }

    fn record(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Stdout(data) => self.buffered.push_back((Stream::Stdout, data)),
            ChannelEvent::Stderr(data) => self.buffered.push_back((Stream::Stderr, data)),
            ChannelEvent::ExitStatus(status) => self.status = Some(status),
            ChannelEvent::ExitSignal(signal) => self.rap.set_exit_signal(signal),
            ChannelEvent::Eof => self.remote_eof = true,
            ChannelEvent::Closed => self.closed = true,
        }
    }

    fn drain_buffered(&mut self) {
        while let Some((stream, data)) = self.buffered.pop_front() {
            self.consume(stream, &data);
        }
    }

    fn consume(&mut self, stream: Stream, data: &[u8]) {
        self.partial_mut(stream)
            .push_str(&String::from_utf8_lossy(data));

        while let Some(pos) = self.partial(stream).find('\n') {
            let rest = self.partial_mut(stream).split_off(pos + 1);
            let mut line = std::mem::replace(self.partial_mut(stream), rest);
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            self.emit(stream, line);
        }

        if is_password_prompt(self.partial(stream)) {
            self.prompt_pending = Some(stream);
        }
    }

    fn flush_partial(&mut self, stream: Stream) {
        let line = std::mem::take(self.partial_mut(stream));
        let line = line.trim_end();
        if !line.is_empty() {
            self.emit(stream, line.to_owned());
        }
    }

    fn emit(&mut self, stream: Stream, line: String) {
        match stream {
            Stream::Stdout => {
                if !self.quiet {
                    if let Some(hook) = self.stdout_hook.as_mut() {
                        (*hook)(&line);
                    }
                }
                self.rap.push_stdout_line(line);
            }
            Stream::Stderr => self.rap.push_stderr_line(line),
        }
    }

    fn partial(&self, stream: Stream) -> &str {
        match stream {
            Stream::Stdout => &self.partial_out,
            Stream::Stderr => &self.partial_err,
        }
    }

    fn partial_mut(&mut self, stream: Stream) -> &mut String {
        match stream {
            Stream::Stdout => &mut self.partial_out,
            Stream::Stderr => &mut self.partial_err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::ScriptedPrompter;
    use crate::testing::MockChannel;
    use pretty_assertions::assert_eq;

    fn rap(cmd: &str) -> Rap {
        Rap::new("tester@mock", cmd)
    }

    #[tokio::test]
    async fn batch_collects_both_streams() {
        let ch = MockChannel::new()
            .stdout("line one\nline ")
            .stderr("warn\n")
            .stdout("two\n")
            .exit(0);
        let mut seen = Vec::new();
        let mut hook = |l: &str| seen.push(l.to_owned());
        let rap = ChannelRunner::new(Box::new(ch), Mode::Batch, rap("x"))
            .stdout_hook(Some(&mut hook))
            .run()
            .await
            .unwrap();
        assert_eq!(rap.stdout(), &["line one", "line two"]);
        assert_eq!(rap.stderr(), &["warn"]);
        assert_eq!(rap.exit_status(), 0);
        assert_eq!(seen, vec!["line one", "line two"]);
    }

    #[tokio::test]
    async fn quiet_suppresses_hook() {
        let ch = MockChannel::new().stdout("a\n").exit(0);
        let mut calls = 0;
        let mut hook = |_: &str| calls += 1;
        let rap = ChannelRunner::new(Box::new(ch), Mode::Batch, rap("x"))
            .stdout_hook(Some(&mut hook))
            .quiet(true)
            .run()
            .await
            .unwrap();
        assert_eq!(rap.stdout(), &["a"]);
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn status_defaults_to_zero() {
        let ch = MockChannel::new()
            .stdout("partial line without newline")
            .event(ChannelEvent::Eof)
            .event(ChannelEvent::Closed);
        let rap = ChannelRunner::new(Box::new(ch), Mode::Batch, rap("x"))
            .run()
            .await
            .unwrap();
        assert_eq!(rap.exit_status(), 0);
        assert_eq!(rap.stdout(), &["partial line without newline"]);
    }

    #[tokio::test]
    async fn signal_is_a_failure() {
        let ch = MockChannel::new()
            .event(ChannelEvent::ExitSignal("KILL".into()))
            .event(ChannelEvent::Eof)
            .event(ChannelEvent::Closed);
        let rap = ChannelRunner::new(Box::new(ch), Mode::Batch, rap("sleep 100"))
            .run()
            .await
            .unwrap();
        assert_eq!(rap.exit_signal(), Some("KILL"));
        assert_eq!(rap.exit_status(), 137);
        assert!(rap.is_failure());
    }

    #[tokio::test]
    async fn batch_closes_stdin_when_idle() {
        // behaves like `cat`: exits only once its input is closed
        let ch = MockChannel::new()
            .on_eof(|| vec![ChannelEvent::ExitStatus(0), ChannelEvent::Eof, ChannelEvent::Closed]);
        let rap = ChannelRunner::new(Box::new(ch), Mode::Batch, rap("cat"))
            .run()
            .await
            .unwrap();
        assert_eq!(rap.exit_status(), 0);
    }

    #[tokio::test]
    async fn answers_password_prompt() {
        let ch = MockChannel::new()
            .stderr("[sudo] password for deploy: ")
            .on_write(|data| {
                if data == b"s3cret\n" {
                    vec![
                        ChannelEvent::Stdout(b"root\n".to_vec()),
                        ChannelEvent::ExitStatus(0),
                        ChannelEvent::Eof,
                        ChannelEvent::Closed,
                    ]
                } else {
                    vec![
                        ChannelEvent::Stderr(b"Sorry, try again.\n".to_vec()),
                        ChannelEvent::ExitStatus(1),
                        ChannelEvent::Eof,
                        ChannelEvent::Closed,
                    ]
                }
            });
        let written = ch.written();
        let prompter: Arc<dyn Prompter> = Arc::new(ScriptedPrompter::new().secret("s3cret"));
        let rap = ChannelRunner::new(Box::new(ch), Mode::Batch, rap("sudo -S whoami"))
            .prompter(Some(prompter))
            .hold_stdin(true)
            .run()
            .await
            .unwrap();
        assert_eq!(rap.stdout(), &["root"]);
        assert_eq!(rap.stderr(), &["[sudo] password for deploy:"]);
        assert_eq!(rap.exit_status(), 0);
        assert_eq!(&*written.lock().unwrap(), b"s3cret\n");
    }

    #[tokio::test]
    async fn prompt_without_prompter() {
        let ch = MockChannel::new().stdout("Password:");
        let err = ChannelRunner::new(Box::new(ch), Mode::Batch, rap("su"))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoPassword), "{:?}", err);
    }

    #[tokio::test]
    async fn prompt_declined() {
        let ch = MockChannel::new().stdout("Password:");
        let prompter: Arc<dyn Prompter> = Arc::new(ScriptedPrompter::new());
        let err = ChannelRunner::new(Box::new(ch), Mode::Batch, rap("su"))
            .prompter(Some(prompter))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoPassword), "{:?}", err);
    }

    #[tokio::test]
    async fn pty_refused() {
        let ch = MockChannel::new().fail_with(|| Error::NoPty);
        let err = ChannelRunner::new(Box::new(ch), Mode::Shell, rap("shell"))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoPty), "{:?}", err);
    }

    fn echo_shell() -> MockChannel {
        MockChannel::new().on_write(|data| {
            let line = String::from_utf8_lossy(data);
            let line = line.trim_end();
            if line == "exit" {
                vec![ChannelEvent::ExitStatus(0), ChannelEvent::Eof, ChannelEvent::Closed]
            } else if let Some(rest) = line.strip_prefix("echo ") {
                vec![ChannelEvent::Stdout(format!("{}\n", rest).into_bytes())]
            } else {
                Vec::new()
            }
        })
    }

    #[tokio::test]
    async fn shell_reads_lines_from_prompter() {
        let ch = echo_shell();
        let written = ch.written();
        let prompter: Arc<dyn Prompter> = Arc::new(
            ScriptedPrompter::new().line("echo one").line("cd /tmp").line("echo two"),
        );
        let rap = ChannelRunner::new(Box::new(ch), Mode::Shell, rap("shell"))
            .prompter(Some(prompter))
            .run()
            .await
            .unwrap();
        assert_eq!(rap.stdout(), &["one", "two"]);
        assert_eq!(rap.exit_status(), 0);
        assert_eq!(
            String::from_utf8_lossy(&written.lock().unwrap()),
            "echo one\ncd /tmp\necho two\nexit\n"
        );
    }

    #[tokio::test]
    async fn lost_stdin_on_exit_still_finishes() {
        let ch = MockChannel::new()
            .refuse_writes()
            .on_eof(|| vec![ChannelEvent::ExitStatus(2), ChannelEvent::Eof, ChannelEvent::Closed]);
        let rap = ChannelRunner::new(Box::new(ch), Mode::Shell, rap("shell"))
            .run()
            .await
            .unwrap();
        assert_eq!(rap.exit_status(), 2);
    }

    #[tokio::test]
    async fn shell_without_prompter_exits() {
        let ch = echo_shell();
        let written = ch.written();
        let rap = ChannelRunner::new(Box::new(ch), Mode::Shell, rap("shell"))
            .run()
            .await
            .unwrap();
        assert_eq!(rap.exit_status(), 0);
        assert_eq!(&*written.lock().unwrap(), b"exit\n");
    }

    #[tokio::test]
    async fn block_runs_in_order_then_exits() {
        let ch = echo_shell();
        let written = ch.written();
        let rap = ChannelRunner::new(Box::new(ch), Mode::Shell, rap("block"))
            .block(vec!["echo a".into(), "echo b".into(), "echo c".into()])
            .run()
            .await
            .unwrap();
        assert_eq!(rap.stdout(), &["a", "b", "c"]);
        assert_eq!(
            String::from_utf8_lossy(&written.lock().unwrap()),
            "echo a\necho b\necho c\nexit\n"
        );
    }
}
