//! Git operations relayed to a bridge workspace.

use serde::Deserialize;

use crate::error::{ControlError, Result};

/// Optional parameters of a `git-operation` message.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitParams {
    /// Paths for `add`.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Message for `commit`.
    #[serde(default)]
    pub message: Option<String>,
    /// Remote for `push`/`pull`.
    #[serde(default)]
    pub remote: Option<String>,
    /// Branch for `push`/`pull`.
    #[serde(default)]
    pub branch: Option<String>,
    /// Branch to create for `branch`.
    #[serde(default)]
    pub name: Option<String>,
}

/// A supported git invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitOperation {
    /// `git status`.
    Status,
    /// `git add -- <paths>`.
    Add {
        /// Pathspecs; the whole tree when empty.
        paths: Vec<String>,
    },
    /// `git commit -m <message>`.
    Commit {
        /// Commit message.
        message: String,
    },
    /// `git push [remote [branch]]`.
    Push {
        /// Remote name.
        remote: Option<String>,
        /// Branch name.
        branch: Option<String>,
    },
    /// `git pull [remote [branch]]`.
    Pull {
        /// Remote name.
        remote: Option<String>,
        /// Branch name.
        branch: Option<String>,
    },
    /// `git branch --list` or `git branch <name>`.
    Branch {
        /// Branch to create.
        name: Option<String>,
    },
}

impl GitOperation {
    /// Build an operation from its wire name and parameters.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Validation` for unknown operations, a missing
    /// commit message, or invalid ref names and paths.
    pub fn parse(operation: &str, params: GitParams) -> Result<Self> {
        let op = match operation {
            "status" => Self::Status,
            "add" => {
                for path in &params.paths {
                    devroom_core::normalize_path(path)?;
                }
                Self::Add {
                    paths: params.paths,
                }
            }
            "commit" => {
                let message = params
                    .message
                    .filter(|m| !m.trim().is_empty())
                    .ok_or_else(|| {
                        ControlError::Validation("commit requires a message".to_string())
                    })?;
                Self::Commit { message }
            }
            "push" | "pull" => {
                let remote = params.remote.map(validate_ref).transpose()?;
                let branch = params.branch.map(validate_ref).transpose()?;
                if operation == "push" {
                    Self::Push { remote, branch }
                } else {
                    Self::Pull { remote, branch }
                }
            }
            "branch" => Self::Branch {
                name: params.name.map(validate_ref).transpose()?,
            },
            other => {
                return Err(ControlError::Validation(format!(
                    "unsupported git operation: {other}"
                )))
            }
        };
        Ok(op)
    }

    /// Wire name, used in audit records and events.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Add { .. } => "add",
            Self::Commit { .. } => "commit",
            Self::Push { .. } => "push",
            Self::Pull { .. } => "pull",
            Self::Branch { .. } => "branch",
        }
    }

    /// The argument vector, starting with `git`.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec!["git".to_string()];
        match self {
            Self::Status => argv.push("status".into()),
            Self::Add { paths } => {
                argv.extend(["add".into(), "--".into()]);
                if paths.is_empty() {
                    argv.push(".".into());
                } else {
                    argv.extend(paths.iter().cloned());
                }
            }
            Self::Commit { message } => {
                argv.extend(["commit".into(), "-m".into(), message.clone()]);
            }
            Self::Push { remote, branch } | Self::Pull { remote, branch } => {
                argv.push(self.name().into());
                match (remote, branch) {
                    (Some(remote), branch) => {
                        argv.push(remote.clone());
                        argv.extend(branch.iter().cloned());
                    }
                    (None, Some(branch)) => {
                        argv.extend(["origin".into(), branch.clone()]);
                    }
                    (None, None) => {}
                }
            }
            Self::Branch { name: None } => argv.extend(["branch".into(), "--list".into()]),
            Self::Branch { name: Some(name) } => argv.extend(["branch".into(), name.clone()]),
        }
        argv
    }
}

fn validate_ref(name: String) -> Result<String> {
    let valid = !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
    if valid {
        Ok(name)
    } else {
        Err(ControlError::Validation(format!("invalid ref name: {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(op: &str, params: GitParams) -> Vec<String> {
        GitOperation::parse(op, params).unwrap().argv()
    }

    #[test]
    fn maps_operations_to_argv() {
        assert_eq!(argv("status", GitParams::default()), ["git", "status"]);
        assert_eq!(argv("add", GitParams::default()), ["git", "add", "--", "."]);
        assert_eq!(
            argv(
                "add",
                GitParams {
                    paths: vec!["src/lib.rs".into(), "README.md".into()],
                    ..GitParams::default()
                }
            ),
            ["git", "add", "--", "src/lib.rs", "README.md"]
        );
        assert_eq!(
            argv(
                "commit",
                GitParams {
                    message: Some("fix: handle empty rooms; really".into()),
                    ..GitParams::default()
                }
            ),
            ["git", "commit", "-m", "fix: handle empty rooms; really"]
        );
        assert_eq!(argv("branch", GitParams::default()), ["git", "branch", "--list"]);
    }

    #[test]
    fn push_defaults_remote_when_branch_given() {
        let params = GitParams {
            branch: Some("feature/x".into()),
            ..GitParams::default()
        };
        assert_eq!(argv("push", params), ["git", "push", "origin", "feature/x"]);

        let params = GitParams {
            remote: Some("upstream".into()),
            ..GitParams::default()
        };
        assert_eq!(argv("pull", params), ["git", "pull", "upstream"]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(GitOperation::parse("rebase", GitParams::default()).is_err());
        assert!(GitOperation::parse("commit", GitParams::default()).is_err());

        for bad in ["--force", "-f", "main;rm", "a b", ""] {
            let params = GitParams {
                branch: Some(bad.into()),
                ..GitParams::default()
            };
            assert!(GitOperation::parse("push", params).is_err(), "{bad}");
        }

        let params = GitParams {
            paths: vec!["../outside".into()],
            ..GitParams::default()
        };
        assert!(GitOperation::parse("add", params).is_err());
    }
}
