//! Sandbox path resolution and whole-file access.
//!
//! Every path that reaches the filesystem on behalf of a client goes through
//! [`resolve`], which confines it to a root directory. Resolution is
//! stateless: the same `(root, relative)` pair always yields the same answer
//! for the same filesystem contents.

use crate::error::{Result, ServiceError};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Resolve `relative` against `root`, rejecting anything that would land
/// outside of it.
///
/// `..` is applied lexically and may not climb above the root. A leading
/// `/` is treated as the sandbox root. The deepest existing ancestor of the
/// result is canonicalized so symlinks pointing out of the root are caught
/// too. The returned path need not exist.
pub fn resolve(root: &Path, relative: impl AsRef<Path>) -> Result<PathBuf> {
    let relative = relative.as_ref();
    let canonical_root = fs::canonicalize(root)
        .map_err(|e| ServiceError::io(format!("sandbox root {}", root.display()), e))?;

    let mut joined = canonical_root.clone();
    for component in relative.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if joined == canonical_root {
                    return Err(escape(relative));
                }
                joined.pop();
            }
        }
    }

    // Walk up to the deepest ancestor present on disk (a dangling symlink
    // counts as present) and canonicalize it.
    let mut existing = joined.as_path();
    let mut tail = Vec::new();
    while fs::symlink_metadata(existing).is_err() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return Err(escape(relative)),
        }
    }
    let mut resolved = match fs::canonicalize(existing) {
        Ok(resolved) => resolved,
        // Only a symlink whose target is missing gets here.
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %relative.display(), "rejected dangling symlink");
            return Err(escape(relative));
        }
        Err(e) => {
            return Err(ServiceError::io(
                format!("resolve {}", relative.display()),
                e,
            ))
        }
    };
    if !resolved.starts_with(&canonical_root) {
        debug!(
            path = %relative.display(),
            resolved = %resolved.display(),
            "rejected sandbox escape"
        );
        return Err(escape(relative));
    }
    resolved.extend(tail.into_iter().rev());
    Ok(resolved)
}

/// Display form of `path` relative to `root`, using `/` separators and `.`
/// for the root itself.
pub fn relative_display(root: &Path, path: &Path) -> String {
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => fs::canonicalize(root)
            .ok()
            .and_then(|canonical| path.strip_prefix(canonical).ok().map(Path::to_path_buf))
            .unwrap_or_else(|| path.to_path_buf()),
    };
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Read a whole UTF-8 file from inside the sandbox.
pub fn read_file_in_sandbox(root: &Path, path: &str) -> Result<String> {
    let full_path = resolve(root, path)?;
    if !full_path.is_file() {
        return Err(ServiceError::FileNotFound(path.to_string()));
    }
    fs::read_to_string(&full_path).map_err(|e| ServiceError::io(format!("read file {path}"), e))
}

/// Overwrite (or create) a file inside the sandbox with `content`.
pub fn write_file_in_sandbox(root: &Path, path: &str, content: &[u8]) -> Result<()> {
    let full_path = resolve(root, path)?;
    if full_path.is_dir() {
        return Err(ServiceError::validation(format!("{path} is a directory")));
    }

    // Ensure parent directory exists
    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent).map_err(|e| ServiceError::io("mkdir parent", e))?;
    }

    fs::write(&full_path, content).map_err(|e| ServiceError::io(format!("write file {path}"), e))
}

fn escape(relative: &Path) -> ServiceError {
    ServiceError::SandboxEscape(relative.display().to_string())
}
