use super::{Error, Operation, Rap, Set, SetRap, Target};

use async_trait::async_trait;

/// Something that runs whitelisted commands: a single [`Target`], or every target of a
/// [`Set`] at once.
///
/// Only [`CommandExecutor::run_command`] needs implementing. The rest are shorthands for
/// common stock commands, each going through the same whitelist and quoting.
#[async_trait]
pub trait CommandExecutor: Send {
    /// What one command produces.
    type Output: Send;

    /// Run the whitelisted command `name` with `args`.
    async fn run_command(&mut self, name: &str, args: &[String]) -> Result<Self::Output, Error>;

    /// `uptime`
    async fn uptime(&mut self) -> Result<Self::Output, Error> {
        self.run_command("uptime", &[]).await
    }

    /// `hostname`
    async fn hostname(&mut self) -> Result<Self::Output, Error> {
        self.run_command("hostname", &[]).await
    }

    /// `pwd`
    async fn pwd(&mut self) -> Result<Self::Output, Error> {
        self.run_command("pwd", &[]).await
    }

    /// `uname` with `args`.
    async fn uname(&mut self, args: &[String]) -> Result<Self::Output, Error> {
        self.run_command("uname", args).await
    }

    /// `ls` with `args`.
    async fn ls(&mut self, args: &[String]) -> Result<Self::Output, Error> {
        self.run_command("ls", args).await
    }

    /// `cat path`
    async fn cat(&mut self, path: &str) -> Result<Self::Output, Error> {
        self.run_command("cat", &[path.to_owned()]).await
    }

    /// `echo` with `words`.
    async fn echo(&mut self, words: &[String]) -> Result<Self::Output, Error> {
        self.run_command("echo", words).await
    }

    /// `mkdir -p path`
    async fn mkdir_p(&mut self, path: &str) -> Result<Self::Output, Error> {
        self.run_command("mkdir", &[String::from("-p"), path.to_owned()]).await
    }

    /// `touch path`
    async fn touch(&mut self, path: &str) -> Result<Self::Output, Error> {
        self.run_command("touch", &[path.to_owned()]).await
    }

    /// `which name`
    async fn which(&mut self, name: &str) -> Result<Self::Output, Error> {
        self.run_command("which", &[name.to_owned()]).await
    }

    /// `./configure` with `args`.
    async fn configure(&mut self, args: &[String]) -> Result<Self::Output, Error> {
        self.run_command("configure", args).await
    }
}

#[async_trait]
impl CommandExecutor for Target {
    type Output = Rap;

    async fn run_command(&mut self, name: &str, args: &[String]) -> Result<Rap, Error> {
        self.execute(name, args).await
    }
}

#[async_trait]
impl CommandExecutor for Set {
    type Output = SetRap;

    async fn run_command(&mut self, name: &str, args: &[String]) -> Result<SetRap, Error> {
        self.apply(Operation::execute(name, args.iter().cloned())).await
    }
}
