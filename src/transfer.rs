//! Bulk file and buffer copies over their own exec channels.
//!
//! Every file moves on a separate channel of the target's connection: `cat > path` to
//! upload, `cat path` to download. With more than one source the copies run concurrently.

use super::escape::quote_word;
use super::runner::{ChannelRunner, Mode};
use super::{ChannelEvent, ChannelRequest, Connection, Error, Rap};

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;

use std::collections::BTreeSet;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, trace};

const CHUNK: usize = 32 * 1024;

/// Which way the bytes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local to remote.
    Upload,
    /// Remote to local.
    Download,
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" | "up" => Ok(Direction::Upload),
            "download" | "down" => Ok(Direction::Download),
            other => Err(Error::InvalidTransfer(format!("unknown direction {:?}", other))),
        }
    }
}

/// One end of a transfer.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// A file or directory. Local or remote depending on the side and direction.
    Path(PathBuf),
    /// An in-memory buffer. Uploads read from its current position.
    Buffer(Cursor<Vec<u8>>),
}

impl From<&str> for Endpoint {
    fn from(p: &str) -> Self {
        Endpoint::Path(PathBuf::from(p))
    }
}

impl From<String> for Endpoint {
    fn from(p: String) -> Self {
        Endpoint::Path(PathBuf::from(p))
    }
}

impl From<&Path> for Endpoint {
    fn from(p: &Path) -> Self {
        Endpoint::Path(p.to_path_buf())
    }
}

impl From<PathBuf> for Endpoint {
    fn from(p: PathBuf) -> Self {
        Endpoint::Path(p)
    }
}

impl From<Vec<u8>> for Endpoint {
    fn from(data: Vec<u8>) -> Self {
        Endpoint::Buffer(Cursor::new(data))
    }
}

impl From<Cursor<Vec<u8>>> for Endpoint {
    fn from(cursor: Cursor<Vec<u8>>) -> Self {
        Endpoint::Buffer(cursor)
    }
}

/// Called as `(name, bytes so far, total bytes)`. `total` is 0 when unknown.
pub type ProgressFn = Arc<dyn Fn(&str, u64, u64) + Send + Sync>;

#[derive(Debug, PartialEq, Eq)]
enum Source {
    File(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug, PartialEq, Eq)]
enum Job {
    Upload { source: Source, remote: String },
    Download { remote: String, local: Option<PathBuf> },
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Plan {
    remote_dirs: BTreeSet<String>,
    local_dirs: BTreeSet<PathBuf>,
    jobs: Vec<Job>,
}

/// Moves files between this machine and one connection.
pub struct TransferManager<'c> {
    conn: &'c Connection,
    origin: String,
    progress: Option<ProgressFn>,
}

impl fmt::Debug for TransferManager<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferManager")
            .field("host", &self.conn.host())
            .field("origin", &self.origin)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl<'c> TransferManager<'c> {
    /// Transfer over `conn`. `origin` labels the [`Rap`] of a failed copy.
    pub fn new(conn: &'c Connection, origin: impl Into<String>) -> Self {
        Self {
            conn,
            origin: origin.into(),
            progress: None,
        }
    }

    /// Report per-file progress to `f`.
    pub fn progress(mut self, f: Option<ProgressFn>) -> Self {
        self.progress = f;
        self
    }

    /// Copy `sources` to `target` in `direction`.
    ///
    /// Everything that can be checked locally is checked before any byte moves. With more
    /// than one source, `target` is a directory and is created if missing. A download whose
    /// sole target is a buffer returns the downloaded bytes.
    pub async fn transfer(
        &self,
        direction: Direction,
        recursive: bool,
        sources: Vec<Endpoint>,
        target: Endpoint,
    ) -> Result<Option<Vec<u8>>, Error> {
        if sources.is_empty() {
            return Err(Error::InvalidTransfer(String::from("no sources given")));
        }

        let plan = match direction {
            Direction::Upload => plan_upload(recursive, sources, target).await?,
            Direction::Download => self.plan_download(recursive, sources, target).await?,
        };
        debug!(
            host = self.conn.host(),
            ?direction,
            files = plan.jobs.len(),
            "starting transfer"
        );

        for dir in &plan.local_dirs {
            fs::create_dir_all(dir).await.map_err(Error::LocalIo)?;
        }
        if !plan.remote_dirs.is_empty() {
            let dirs: Vec<String> = plan.remote_dirs.iter().map(|d| quote_word(d)).collect();
            self.run(format!("mkdir -p {}", dirs.join(" "))).await?;
        }

        let copies = plan.jobs.into_iter().map(|job| self.copy(job));
        let buffers = try_join_all(copies).await?;
        Ok(buffers.into_iter().flatten().next())
    }

    async fn plan_download(
        &self,
        recursive: bool,
        sources: Vec<Endpoint>,
        target: Endpoint,
    ) -> Result<Plan, Error> {
        let mut remotes = Vec::with_capacity(sources.len());
        for source in sources {
            match source {
                Endpoint::Path(p) => remotes.push(p.to_string_lossy().into_owned()),
                Endpoint::Buffer(_) => {
                    return Err(Error::InvalidTransfer(String::from(
                        "a download source must be a remote path",
                    )))
                }
            }
        }

        let mut plan = Plan::default();
        let local = match target {
            Endpoint::Buffer(_) if remotes.len() > 1 || recursive => {
                return Err(Error::InvalidTransfer(String::from(
                    "a buffer can only receive a single file",
                )))
            }
            Endpoint::Buffer(_) => {
                plan.jobs.push(Job::Download {
                    remote: remotes.remove(0),
                    local: None,
                });
                return Ok(plan);
            }
            Endpoint::Path(p) => p,
        };

        let is_dir = fs::metadata(&local).await.map_or(false, |m| m.is_dir());
        let into_dir = remotes.len() > 1 || recursive || is_dir;
        if into_dir {
            plan.local_dirs.insert(local.clone());
        }

        for remote in remotes {
            let name = basename(&remote).to_owned();
            if recursive {
                let listing = self.run(format!("find {} -type f", quote_word(&remote))).await?;
                let root = remote.trim_end_matches('/');
                for file in listing.stdout() {
                    let rel = file
                        .strip_prefix(root)
                        .map(|r| r.trim_start_matches('/'))
                        .unwrap_or(file);
                    let dest = local.join(&name).join(rel);
                    if let Some(parent) = dest.parent() {
                        plan.local_dirs.insert(parent.to_path_buf());
                    }
                    plan.jobs.push(Job::Download {
                        remote: file.clone(),
                        local: Some(dest),
                    });
                }
            } else {
                let dest = if into_dir { local.join(&name) } else { local.clone() };
                plan.jobs.push(Job::Download {
                    remote,
                    local: Some(dest),
                });
            }
        }
        Ok(plan)
    }

    async fn copy(&self, job: Job) -> Result<Option<Vec<u8>>, Error> {
        match job {
            Job::Upload { source, remote } => {
                let data = match source {
                    Source::Bytes(data) => data,
                    Source::File(path) => fs::read(&path).await.map_err(Error::LocalIo)?,
                };
                self.upload(&remote, &data).await?;
                Ok(None)
            }
            Job::Download { remote, local } => {
                let data = self.download(&remote).await?;
                match local {
                    Some(path) => {
                        fs::write(&path, &data).await.map_err(Error::LocalIo)?;
                        Ok(None)
                    }
                    None => Ok(Some(data)),
                }
            }
        }
    }

    /// Append `data` to the remote file `remote`, creating it if missing.
    pub async fn append(&self, remote: &str, data: &[u8]) -> Result<(), Error> {
        self.write_remote(">>", remote, data).await
    }

    async fn upload(&self, remote: &str, data: &[u8]) -> Result<(), Error> {
        self.write_remote(">", remote, data).await
    }

    async fn write_remote(&self, redirect: &str, remote: &str, data: &[u8]) -> Result<(), Error> {
        let command = format!("cat {} {}", redirect, quote_word(remote));
        let mut channel = self.conn.open_channel(ChannelRequest::exec(&command)).await?;

        let total = data.len() as u64;
        let mut sent = 0;
        for chunk in data.chunks(CHUNK) {
            channel.write(chunk).await?;
            sent += chunk.len() as u64;
            self.report(remote, sent, total);
        }
        channel.eof().await?;

        let rap = ChannelRunner::new(channel, Mode::Batch, Rap::new(self.origin.clone(), command))
            .run()
            .await?;
        check(rap)
    }

    async fn download(&self, remote: &str) -> Result<Vec<u8>, Error> {
        let command = format!("cat {}", quote_word(remote));
        let mut channel = self.conn.open_channel(ChannelRequest::exec(&command)).await?;
        channel.eof().await?;

        let mut rap = Rap::new(self.origin.clone(), command);
        let mut data = Vec::new();
        let mut status = None;
        loop {
            match channel.next_event(super::runner::POLL_INTERVAL).await? {
                None => continue,
                Some(ChannelEvent::Stdout(chunk)) => {
                    data.extend_from_slice(&chunk);
                    self.report(remote, data.len() as u64, 0);
                }
                Some(ChannelEvent::Stderr(chunk)) => rap.add_stderr(&String::from_utf8_lossy(&chunk)),
                Some(ChannelEvent::ExitStatus(s)) => status = Some(s),
                Some(ChannelEvent::ExitSignal(sig)) => rap.set_exit_signal(sig),
                Some(ChannelEvent::Eof) => {}
                Some(ChannelEvent::Closed) => break,
            }
        }
        rap.finalize(status);
        check(rap)?;
        Ok(data)
    }

    async fn run(&self, command: String) -> Result<Rap, Error> {
        let channel = self.conn.open_channel(ChannelRequest::exec(&command)).await?;
        let rap = ChannelRunner::new(channel, Mode::Batch, Rap::new(self.origin.clone(), command))
            .run()
            .await?;
        if rap.is_failure() {
            return Err(Error::Command(Box::new(rap)));
        }
        Ok(rap)
    }

    fn report(&self, name: &str, done: u64, total: u64) {
        trace!(file = name, bytes = done, total, "transfer progress");
        if let Some(ref f) = self.progress {
            f(name, done, total);
        }
    }
}

fn check(rap: Rap) -> Result<(), Error> {
    if rap.is_failure() {
        Err(Error::Command(Box::new(rap)))
    } else {
        Ok(())
    }
}

fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

fn remote_join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

async fn plan_upload(
    recursive: bool,
    sources: Vec<Endpoint>,
    target: Endpoint,
) -> Result<Plan, Error> {
    let target = match target {
        Endpoint::Path(p) => p.to_string_lossy().into_owned(),
        Endpoint::Buffer(_) => {
            return Err(Error::InvalidTransfer(String::from(
                "an upload target must be a remote path",
            )))
        }
    };
    let multi = sources.len() > 1;

    let mut plan = Plan::default();
    if multi {
        plan.remote_dirs.insert(target.clone());
    }

    for source in sources {
        match source {
            Endpoint::Buffer(cursor) => {
                if multi {
                    return Err(Error::InvalidTransfer(String::from(
                        "an unnamed buffer cannot be one of several sources",
                    )));
                }
                let pos = cursor.position() as usize;
                let data = cursor.into_inner();
                if pos > data.len() || (pos == data.len() && !data.is_empty()) {
                    return Err(Error::InvalidTransfer(String::from(
                        "buffer is not positioned for reading",
                    )));
                }
                plan.jobs.push(Job::Upload {
                    source: Source::Bytes(data[pos..].to_vec()),
                    remote: target.clone(),
                });
            }
            Endpoint::Path(local) => {
                let meta = fs::metadata(&local).await.map_err(|e| {
                    Error::InvalidTransfer(format!("{}: {}", local.display(), e))
                })?;
                let name = local
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();

                if meta.is_dir() {
                    if !recursive {
                        return Err(Error::InvalidTransfer(format!(
                            "{} is a directory (not copied without recursion)",
                            local.display()
                        )));
                    }
                    let root = if multi {
                        remote_join(&target, &name)
                    } else {
                        target.clone()
                    };
                    plan.remote_dirs.insert(root.clone());
                    walk(&local, local.clone(), &root, &mut plan).await?;
                } else {
                    let remote = if multi {
                        remote_join(&target, &name)
                    } else {
                        target.clone()
                    };
                    plan.jobs.push(Job::Upload {
                        source: Source::File(local),
                        remote,
                    });
                }
            }
        }
    }
    Ok(plan)
}

/// Queue every file under `dir` in name order, directories first as they are met.
fn walk<'a>(
    root: &'a Path,
    dir: PathBuf,
    remote_root: &'a str,
    plan: &'a mut Plan,
) -> BoxFuture<'a, Result<(), Error>> {
    async move {
        let mut entries = Vec::new();
        let mut read = fs::read_dir(&dir).await.map_err(Error::LocalIo)?;
        while let Some(entry) = read.next_entry().await.map_err(Error::LocalIo)? {
            entries.push(entry);
        }
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let rel = path
                .strip_prefix(root)
                .map(|r| r.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            let remote = remote_join(remote_root, &rel);
            if entry.file_type().await.map_err(Error::LocalIo)?.is_dir() {
                plan.remote_dirs.insert(remote);
                walk(root, path, remote_root, plan).await?;
            } else {
                plan.jobs.push(Job::Upload {
                    source: Source::File(path),
                    remote,
                });
            }
        }
        Ok(())
    }
    .boxed()
}
