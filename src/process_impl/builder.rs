use super::super::SessionBuilder;
use super::{Error, Session};

use secrecy::ExposeSecret;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tempfile::{Builder, TempDir};
use tokio::io::AsyncReadExt;
use tokio::process;
use tracing::debug;

/// Hands out the password file next to it once, deleting it as it goes.
const ASKPASS_SCRIPT: &str =
    "#!/bin/sh\nsecret=\"$(dirname \"$0\")/password\"\ncat \"$secret\" && rm -f \"$secret\"\n";

pub(crate) async fn just_connect(builder: &SessionBuilder, host: &str) -> Result<Session, Error> {
    let dir = build_tempdir(builder)?;
    let log = dir.path().join("log");

    let mut init = process::Command::new("ssh");

    init.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .arg("-E")
        .arg(&log)
        .arg("-S")
        .arg(dir.path().join("master"))
        .arg("-M")
        .arg("-f")
        .arg("-N")
        .arg("-o")
        .arg("ControlPersist=yes")
        .arg("-o")
        .arg(builder.known_hosts_check.as_option());

    if let super::super::KnownHosts::Accept = builder.known_hosts_check {
        // a changed key is only ignored if it is not compared against anything
        init.arg("-o").arg("UserKnownHostsFile=/dev/null");
    }

    // removed again once the master is up, whether or not ssh asked for it
    let askpass = match builder.password {
        Some(ref password) => {
            let files = write_askpass(dir.path(), password.expose_secret())?;
            init.arg("-o")
                .arg("BatchMode=no")
                .arg("-o")
                .arg("NumberOfPasswordPrompts=1")
                .env("SSH_ASKPASS", &files.script)
                .env("SSH_ASKPASS_REQUIRE", "force");
            if std::env::var_os("DISPLAY").is_none() {
                // older clients only consult SSH_ASKPASS when DISPLAY is set
                init.env("DISPLAY", ":0");
            }
            Some(files)
        }
        None => {
            init.arg("-o").arg("BatchMode=yes");
            None
        }
    };

    if let Some(ref timeout) = builder.connect_timeout {
        init.arg("-o").arg(format!("ConnectTimeout={}", timeout));
    }

    if let Some(ref interval) = builder.server_alive_interval {
        init.arg("-o")
            .arg(format!("ServerAliveInterval={}", interval));
    }

    if let Some(ref port) = builder.port {
        init.arg("-p").arg(port);
    }

    if let Some(ref user) = builder.user {
        init.arg("-l").arg(user);
    }

    if !builder.keyfiles.is_empty() {
        // if the caller gives keyfiles, _only_ use those
        init.arg("-o").arg("IdentitiesOnly=yes");
        for k in &builder.keyfiles {
            init.arg("-i").arg(k);
        }
    }

    if let Some(ref config_file) = builder.config_file {
        init.arg("-F").arg(config_file);
    }

    if let Some(ref alias) = builder.host_key_alias {
        init.arg("-o").arg(format!("HostKeyAlias={}", alias));
    }

    init.arg(host);

    debug!(host, port = ?builder.port, user = ?builder.user, "starting ssh master");

    // we spawn and immediately wait, because the process is supposed to fork.
    // .output() cannot be used: the backgrounded master keeps the pipe open.
    let mut child = init.spawn().map_err(Error::Connect)?;
    let stderr = child.stderr.take();
    let status = child.wait().await.map_err(Error::Connect)?;
    drop(askpass);

    if !status.success() {
        let mut err = String::new();
        if let Some(mut stderr) = stderr {
            stderr
                .read_to_string(&mut err)
                .await
                .map_err(Error::Connect)?;
        }
        if err.trim().is_empty() {
            err = fs::read_to_string(&log).unwrap_or_default();
        }
        return Err(Error::interpret_ssh_error(&err));
    }

    Ok(Session::new(dir, host))
}

fn build_tempdir(builder: &SessionBuilder) -> Result<TempDir, Error> {
    let mut b = Builder::new();
    b.prefix(".sshbox-connection");
    match builder.control_dir {
        Some(ref dir) => b.tempdir_in(dir),
        None => b.tempdir(),
    }
    .map_err(Error::Master)
}

/// The askpass helper and the one-shot password file it reads. Both go away on drop.
#[derive(Debug)]
struct Askpass {
    script: PathBuf,
    secret: PathBuf,
}

impl Drop for Askpass {
    fn drop(&mut self) {
        for path in [&self.secret, &self.script] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "could not remove askpass file");
                }
            }
        }
    }
}

fn write_askpass(dir: &Path, password: &str) -> Result<Askpass, Error> {
    let askpass = Askpass {
        script: dir.join("askpass"),
        secret: dir.join("password"),
    };

    let mut secret = private_file(&askpass.secret).map_err(Error::Master)?;
    secret
        .write_all(password.as_bytes())
        .and_then(|()| secret.write_all(b"\n"))
        .map_err(Error::Master)?;

    fs::write(&askpass.script, ASKPASS_SCRIPT).map_err(Error::Master)?;
    set_executable(&askpass.script).map_err(Error::Master)?;
    Ok(askpass)
}

#[cfg(unix)]
fn private_file(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn private_file(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
