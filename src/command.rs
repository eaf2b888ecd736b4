use super::escape::{join_raw, quote_command, quote_word};
use super::Error;

use std::collections::BTreeMap;

/// The command line sent to the remote shell for one invocation.
///
/// Rendered fresh every time from the target's current state:
///
/// ```text
/// export A='x'; export B=y; umask 0022 && cd /srv && sudo -S ls -l
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine<'a> {
    program: &'a str,
    args: &'a [String],
    env: Option<&'a BTreeMap<String, String>>,
    umask: Option<u32>,
    cwd: Option<&'a str>,
    sudo: bool,
    safe: bool,
}

impl<'a> CommandLine<'a> {
    /// `program` with `args`, escaped.
    pub fn new(program: &'a str, args: &'a [String]) -> Self {
        Self {
            program,
            args,
            env: None,
            umask: None,
            cwd: None,
            sudo: false,
            safe: true,
        }
    }

    /// Export these variables first.
    pub fn env(mut self, env: &'a BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Set this umask first.
    pub fn umask(mut self, umask: Option<u32>) -> Self {
        self.umask = umask;
        self
    }

    /// Change to this directory first.
    pub fn cwd(mut self, cwd: Option<&'a str>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Run the command through `sudo -S`.
    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    /// Quote the program and its arguments. When off, they are joined verbatim.
    pub fn safe(mut self, safe: bool) -> Self {
        self.safe = safe;
        self
    }

    /// Produce the final command line.
    pub fn render(&self) -> String {
        let mut command = if self.safe {
            quote_command(self.program, self.args)
        } else {
            join_raw(self.program, self.args)
        };
        if self.sudo {
            command = format!("sudo -S {}", command);
        }

        let mut stages = Vec::with_capacity(3);
        if let Some(umask) = self.umask {
            stages.push(format!("umask {:04o}", umask));
        }
        if let Some(cwd) = self.cwd {
            stages.push(format!("cd {}", quote_word(cwd)));
        }
        stages.push(command);
        let stages = stages.join(" && ");

        match self.env {
            Some(env) if !env.is_empty() => format!("{} {}", exports(env), stages),
            _ => stages,
        }
    }
}

/// `export NAME=value;` for each entry, values quoted, names in sorted order.
pub(crate) fn exports(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(name, value)| format!("export {}={};", name, quote_word(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Names the remote shell accepts on the left of `=`.
pub(crate) fn validate_env_name(name: &str) -> Result<(), Error> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {
            chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidEnvName(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bare() {
        let a = args(&["*"]);
        assert_eq!(CommandLine::new("echo", &a).render(), "echo '*'");
    }

    #[test]
    fn full_assembly_order() {
        let a = args(&["-l", "my dir"]);
        let mut env = BTreeMap::new();
        env.insert("RAILS_ENV".to_owned(), "production".to_owned());
        env.insert("GREETING".to_owned(), "it's me".to_owned());
        let cmd = CommandLine::new("ls", &a)
            .env(&env)
            .umask(Some(0o022))
            .cwd(Some("/srv/app"))
            .sudo(true)
            .render();
        assert_eq!(
            cmd,
            r"export GREETING='it'\''s me'; export RAILS_ENV=production; umask 0022 && cd /srv/app && sudo -S ls -l 'my dir'"
        );
    }

    #[test]
    fn unsafe_mode_is_literal() {
        let a = args(&["*.log", "$HOME"]);
        let cmd = CommandLine::new("ls", &a)
            .cwd(Some("/var/log"))
            .safe(false)
            .render();
        assert_eq!(cmd, "cd /var/log && ls *.log $HOME");
    }

    #[test]
    fn empty_env_adds_nothing() {
        let env = BTreeMap::new();
        let a = args(&[]);
        assert_eq!(CommandLine::new("uptime", &a).env(&env).render(), "uptime");
    }

    #[test]
    fn env_names() {
        assert!(validate_env_name("PATH").is_ok());
        assert!(validate_env_name("_x1").is_ok());
        assert!(validate_env_name("1X").is_err());
        assert!(validate_env_name("A;rm").is_err());
        assert!(validate_env_name("").is_err());
    }
}
