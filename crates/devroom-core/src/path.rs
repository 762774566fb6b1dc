//! Project-relative file paths.
//!
//! Paths arrive from browsers and external editors in several spellings
//! (`./src/a.rs`, `src\\a.rs`, `/src/a.rs`). They are normalized to a single
//! forward-slash form before they reach the store so that the `project || path`
//! uniqueness index sees one key per file.

use crate::error::{CoreError, Result};

/// Normalize a project-relative path.
///
/// Backslashes become forward slashes, empty and `.` segments are dropped and
/// a leading `/` is ignored.
///
/// # Errors
///
/// Returns `CoreError::InvalidPath` if the path is empty after normalization,
/// contains a `..` segment, or contains a NUL byte.
pub fn normalize_path(raw: &str) -> Result<String> {
    if raw.contains('\0') {
        return Err(CoreError::InvalidPath(raw.escape_debug().to_string()));
    }

    let replaced = raw.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in replaced.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(CoreError::InvalidPath(raw.to_string())),
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return Err(CoreError::InvalidPath(raw.to_string()));
    }

    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_common_spellings() {
        assert_eq!(normalize_path("src/main.rs").unwrap(), "src/main.rs");
        assert_eq!(normalize_path("./src/main.rs").unwrap(), "src/main.rs");
        assert_eq!(normalize_path("/src//main.rs").unwrap(), "src/main.rs");
        assert_eq!(normalize_path("src\\main.rs").unwrap(), "src/main.rs");
    }

    #[test]
    fn rejects_traversal_and_empty() {
        assert!(normalize_path("../etc/passwd").is_err());
        assert!(normalize_path("src/../../x").is_err());
        assert!(normalize_path("").is_err());
        assert!(normalize_path("/").is_err());
        assert!(normalize_path("a\0b").is_err());
    }
}
