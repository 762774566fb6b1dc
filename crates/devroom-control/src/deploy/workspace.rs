//! Deployment working directories.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use devroom_core::normalize_path;
use devroom_store::FileRecord;
use serde::Serialize;

use crate::error::{ControlError, Result};

/// Manifest files and the command that installs their dependencies, in
/// detection order.
const INSTALLERS: &[(&str, &[&str])] = &[
    ("package.json", &["npm", "install"]),
    ("requirements.txt", &["pip", "install", "-r", "requirements.txt"]),
    ("Cargo.toml", &["cargo", "fetch"]),
    ("go.mod", &["go", "mod", "download"]),
];

/// One published file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Forward-slash path relative to the output directory.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Hex blake3 digest.
    pub hash: String,
}

fn io_error(what: &str, path: &Path, e: &io::Error) -> ControlError {
    ControlError::Execution(format!("{what} {}: {e}", path.display()))
}

/// Write every file snapshot under `dir`.
///
/// # Errors
///
/// Returns `Validation` for a stored path that doesn't normalize, or
/// `Execution` on I/O failure.
pub fn materialize(dir: &Path, files: &[FileRecord]) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| io_error("failed to create", dir, &e))?;
    for file in files {
        let target = dir.join(normalize_path(&file.path)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error("failed to create", parent, &e))?;
        }
        fs::write(&target, &file.content).map_err(|e| io_error("failed to write", &target, &e))?;
    }
    Ok(())
}

/// The dependency install command for the first manifest found in `dir`.
#[must_use]
pub fn detect_install(dir: &Path) -> Option<Vec<String>> {
    INSTALLERS
        .iter()
        .find(|(manifest, _)| dir.join(manifest).is_file())
        .map(|(_, argv)| argv.iter().map(ToString::to_string).collect())
}

/// The build output directory inside `dir`.
///
/// # Errors
///
/// Returns `Validation` if `output_dir` escapes `dir`.
pub fn output_dir(dir: &Path, output_dir: Option<&str>) -> Result<PathBuf> {
    match output_dir.map(str::trim).filter(|o| !o.is_empty() && *o != ".") {
        Some(relative) => Ok(dir.join(normalize_path(relative)?)),
        None => Ok(dir.to_path_buf()),
    }
}

/// Recursively copy `src` into `dst`, returning the number of files copied.
///
/// # Errors
///
/// Returns any I/O error.
pub fn copy_dir(src: &Path, dst: &Path) -> io::Result<usize> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copied += copy_dir(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Every regular file under `dir`, sorted by path.
///
/// # Errors
///
/// Returns any I/O error.
pub fn manifest(dir: &Path) -> io::Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    collect(dir, dir, &mut entries)?;
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn collect(root: &Path, dir: &Path, entries: &mut Vec<ManifestEntry>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect(root, &path, entries)?;
        } else if file_type.is_file() {
            let bytes = fs::read(&path)?;
            let relative = path.strip_prefix(root).unwrap_or(&path);
            entries.push(ManifestEntry {
                path: relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
                size: bytes.len() as u64,
                hash: hex::encode(blake3::hash(&bytes).as_bytes()),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use devroom_core::{FileId, ProjectId};
    use tempfile::TempDir;

    fn record(path: &str, content: &str) -> FileRecord {
        FileRecord {
            file_id: FileId::generate(),
            project_id: ProjectId::generate(),
            path: path.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn materialize_and_manifest() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        materialize(
            &work,
            &[record("index.html", "<h1>hi</h1>"), record("css/site.css", "h1{}")],
        )
        .unwrap();

        let entries = manifest(&work).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["css/site.css", "index.html"]);
        assert_eq!(entries[1].size, 11);
        assert_eq!(
            entries[1].hash,
            devroom_core::ContentHash::of("<h1>hi</h1>").to_hex()
        );
    }

    #[test]
    fn detects_installers_in_order() {
        let dir = TempDir::new().unwrap();
        assert_eq!(detect_install(dir.path()), None);

        fs::write(dir.path().join("go.mod"), "module x").unwrap();
        assert_eq!(detect_install(dir.path()).unwrap(), ["go", "mod", "download"]);

        fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(detect_install(dir.path()).unwrap(), ["npm", "install"]);
    }

    #[test]
    fn copy_dir_is_recursive() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        materialize(&src, &[record("a.txt", "a"), record("nested/b.txt", "b")]).unwrap();

        let dst = dir.path().join("dst");
        assert_eq!(copy_dir(&src, &dst).unwrap(), 2);
        assert_eq!(fs::read_to_string(dst.join("nested/b.txt")).unwrap(), "b");
    }

    #[test]
    fn output_dir_stays_inside() {
        let root = Path::new("/work/d1");
        assert_eq!(output_dir(root, None).unwrap(), root);
        assert_eq!(output_dir(root, Some("dist")).unwrap(), root.join("dist"));
        assert!(output_dir(root, Some("../../etc")).is_err());
    }
}
