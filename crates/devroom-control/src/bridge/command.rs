//! Command line parsing and the allow-list.

use crate::error::{ControlError, Result};

/// Characters that would mean something to a shell. Commands never reach a
/// shell, but a command containing them was written for one and is refused.
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '$', '>', '<', '`', '\n', '\r'];

/// Split a command line into arguments.
///
/// Whitespace separates arguments; single or double quotes group text
/// containing spaces. There is no escaping and no expansion.
///
/// # Errors
///
/// Returns `ControlError::Validation` for empty commands, shell
/// metacharacters or unterminated quotes.
pub fn tokenize(command: &str) -> Result<Vec<String>> {
    if let Some(c) = command.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(ControlError::Validation(format!(
            "command contains forbidden character {c:?}"
        )));
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_token = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quote.is_some() {
        return Err(ControlError::Validation("unterminated quote".to_string()));
    }
    if in_token {
        args.push(current);
    }
    if args.is_empty() {
        return Err(ControlError::Validation("empty command".to_string()));
    }
    Ok(args)
}

/// Allow-list of command prefixes, matched token by token.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed: Vec<Vec<String>>,
}

impl CommandPolicy {
    /// Build a policy from prefixes such as `"npm run build"`.
    #[must_use]
    pub fn new<I, T>(allowed: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let allowed = allowed
            .into_iter()
            .map(|prefix| {
                prefix
                    .as_ref()
                    .split_whitespace()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|tokens| !tokens.is_empty())
            .collect();
        Self { allowed }
    }

    /// Validate a command and return its argument vector.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Validation` if the command can't be tokenized,
    /// matches no allowed prefix, or names a path outside the working
    /// directory.
    pub fn check(&self, command: &str) -> Result<Vec<String>> {
        let argv = tokenize(command)?;

        let allowed = self
            .allowed
            .iter()
            .any(|prefix| argv.len() >= prefix.len() && argv[..prefix.len()] == prefix[..]);
        if !allowed {
            return Err(ControlError::Validation(format!(
                "command not allowed: {}",
                argv[0]
            )));
        }

        if let Some(arg) = argv[1..].iter().find(|arg| escapes_workspace(arg)) {
            return Err(ControlError::Validation(format!(
                "argument leaves the workspace: {arg}"
            )));
        }

        Ok(argv)
    }
}

/// Absolute, home-relative or parent-relative path arguments.
fn escapes_workspace(arg: &str) -> bool {
    // `--flag=/abs/path` style arguments are checked on their value.
    let value = arg.split_once('=').map_or(arg, |(_, v)| v);
    value.starts_with('/')
        || value.starts_with('~')
        || value.split(['/', '\\']).any(|segment| segment == "..")
}
