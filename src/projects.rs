//! Project discovery and sandboxed file access.
//!
//! Projects are the sibling directories of the workspace whose names carry
//! a project prefix (`Module.`, `Web.`). They are found once at startup and
//! the set never changes afterwards.

use crate::config::{ARTIFACT_MARKERS, PROJECT_PREFIXES};
use crate::error::{Result, ServiceError};
use crate::sandbox;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Kind of entry in a project listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dir => "Dir",
            Self::File => "File",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProjectRegistry {
    projects: BTreeMap<String, PathBuf>,
}

impl ProjectRegistry {
    /// Scan `parent` for project directories.
    pub fn discover(parent: &Path) -> Result<Self> {
        let entries = fs::read_dir(parent)
            .map_err(|e| ServiceError::io(format!("scan {}", parent.display()), e))?;
        let mut projects = BTreeMap::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("skipping unreadable entry in {}: {}", parent.display(), e);
                    continue;
                }
            };
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if entry.path().is_dir() && PROJECT_PREFIXES.iter().any(|p| name.starts_with(p)) {
                projects.insert(name, entry.path());
            }
        }
        info!(
            count = projects.len(),
            names = ?projects.keys().collect::<Vec<_>>(),
            "Discovered projects"
        );
        Ok(Self { projects })
    }

    /// Every project name with its root path.
    pub fn projects(&self) -> &BTreeMap<String, PathBuf> {
        &self.projects
    }

    pub fn root(&self, project: &str) -> Result<&Path> {
        self.projects
            .get(project)
            .map(PathBuf::as_path)
            .ok_or_else(|| ServiceError::ProjectNotFound(project.to_string()))
    }

    /// All entries below the project root, keyed by `/`-separated relative
    /// path. Anything under a `build` or `obj` directory is left out.
    pub fn list_files(&self, project: &str) -> Result<BTreeMap<String, EntryKind>> {
        let root = self.root(project)?;
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                !is_artifact(entry.path().strip_prefix(root).unwrap_or(entry.path()))
            });
        for entry in walker {
            let entry = entry.map_err(|e| {
                let message = e.to_string();
                ServiceError::io(
                    format!("list {project}"),
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other(message)),
                )
            })?;
            let rel = sandbox::relative_display(root, entry.path());
            let kind = if entry.file_type().is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            files.insert(rel, kind);
        }
        Ok(files)
    }

    pub fn read_file(&self, project: &str, path: &str) -> Result<String> {
        let root = self.root(project)?;
        sandbox::read_file_in_sandbox(root, path)
    }

    pub fn write_file(&self, project: &str, path: &str, content: &str) -> Result<()> {
        let root = self.root(project)?;
        if path.trim().is_empty() {
            return Err(ServiceError::validation("missing path"));
        }
        sandbox::write_file_in_sandbox(root, path, content.as_bytes())?;
        info!(project, path, bytes = content.len(), "File written");
        Ok(())
    }
}

fn is_artifact(relative: &Path) -> bool {
    relative.components().any(|c| match c {
        Component::Normal(part) => part
            .to_str()
            .map(|part| ARTIFACT_MARKERS.contains(&part))
            .unwrap_or(false),
        _ => false,
    })
}
