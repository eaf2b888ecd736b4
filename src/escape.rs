//! Turn argument lists into text a POSIX shell reads back as exactly those arguments.
//!
//! Safe mode runs every word through [`quote_word`]. Unsafe mode uses [`join_raw`] instead,
//! which leaves globs, `~` and `$VAR` for the remote shell to expand.

fn unreserved(ch: char) -> bool {
    matches!(ch,
        'a'..='z' | 'A'..='Z' | '0'..='9'
        | '+' | ',' | '.' | '/' | ':' | '=' | '@' | '_' | '-')
}

/// Quote `s` so that a POSIX shell interprets it as a single word equal to `s`.
///
/// The empty string becomes `''`. Strings made up only of `[0-9A-Za-z+,./:=@_-]` are
/// returned unchanged. Anything else is split into runs of single quotes, each of which
/// becomes the same number of `\'`, and runs of other characters, each wrapped in `'...'`.
///
/// ```
/// use sshbox::escape::quote_word;
///
/// assert_eq!(quote_word(""), "''");
/// assert_eq!(quote_word("foo-1.2_3"), "foo-1.2_3");
/// assert_eq!(quote_word("*"), "'*'");
/// assert_eq!(quote_word("it's"), r"'it'\''s'");
/// ```
pub fn quote_word(s: &str) -> String {
    if s.is_empty() {
        return String::from("''");
    }
    if s.chars().all(unreserved) {
        return s.to_owned();
    }

    let mut quoted = String::with_capacity(s.len() + 2);
    let mut rest = s;
    while !rest.is_empty() {
        let quotes = rest.len() - rest.trim_start_matches('\'').len();
        if quotes > 0 {
            for _ in 0..quotes {
                quoted.push_str("\\'");
            }
            rest = &rest[quotes..];
            continue;
        }

        let end = rest.find('\'').unwrap_or(rest.len());
        quoted.push('\'');
        quoted.push_str(&rest[..end]);
        quoted.push('\'');
        rest = &rest[end..];
    }
    quoted
}

/// Quote the command name and every argument, then join them with single spaces.
pub fn quote_command<S: AsRef<str>>(name: &str, args: &[S]) -> String {
    let mut cmd = quote_word(name);
    for arg in args {
        cmd.push(' ');
        cmd.push_str(&quote_word(arg.as_ref()));
    }
    cmd
}

/// Join the command name and arguments with spaces, without any quoting.
///
/// Only used when safe mode is off. The remote shell will expand whatever it finds.
pub fn join_raw<S: AsRef<str>>(name: &str, args: &[S]) -> String {
    let mut cmd = String::from(name);
    for arg in args {
        cmd.push(' ');
        cmd.push_str(arg.as_ref());
    }
    cmd
}
