//! Per-request scratch directories.
//!
//! A [`Workspace`] owns a uniquely named directory with two subtrees:
//!
//! ```text
//! sfm-XXXXXX/
//! ├── images/            uploaded inputs
//! ├── outputs/           every stage artifact
//! │   ├── pairs.txt
//! │   └── sfm_colmap/    reconstruction (archived)
//! └── sfm_output.zip
//! ```
//!
//! The directory is removed exactly once: by [`Workspace::close`] on the
//! normal path, or by `Drop` when the owning future is dropped or unwinds.

use crate::config::WorkspaceConfig;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const IMAGES_DIR: &str = "images";
pub const OUTPUTS_DIR: &str = "outputs";
pub const PAIRS_FILE: &str = "pairs.txt";
pub const SFM_DIR: &str = "sfm_colmap";
pub const ARCHIVE_NAME: &str = "sfm_output.zip";

/// Allocates request workspaces under a common parent directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    prefix: String,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &WorkspaceConfig) -> Self {
        Self::new(config.root_dir(), config.prefix.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Create a fresh workspace with `images/` and `outputs/` in place.
    pub fn create(&self) -> io::Result<Workspace> {
        std::fs::create_dir_all(&self.root)?;
        let dir = tempfile::Builder::new()
            .prefix(&self.prefix)
            .tempdir_in(&self.root)?;

        // On failure here `dir` is dropped and takes the partial tree with it
        std::fs::create_dir(dir.path().join(IMAGES_DIR))?;
        std::fs::create_dir(dir.path().join(OUTPUTS_DIR))?;

        tracing::debug!("Created workspace {}", dir.path().display());
        Ok(Workspace { dir })
    }

    /// Workspaces currently present under the root (used by tests and
    /// diagnostics to check nothing leaked).
    pub fn live_workspaces(&self) -> io::Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&self.prefix) && entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

/// Exclusively owned scratch directory of one request.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn images_dir(&self) -> PathBuf {
        self.path().join(IMAGES_DIR)
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.path().join(OUTPUTS_DIR)
    }

    pub fn pairs_path(&self) -> PathBuf {
        self.outputs_dir().join(PAIRS_FILE)
    }

    pub fn sfm_dir(&self) -> PathBuf {
        self.outputs_dir().join(SFM_DIR)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.path().join(ARCHIVE_NAME)
    }

    /// Remove the workspace and everything in it.
    pub fn close(self) -> io::Result<()> {
        let path = self.dir.path().to_path_buf();
        let result = self.dir.close();
        match &result {
            Ok(()) => tracing::debug!("Removed workspace {}", path.display()),
            Err(e) => tracing::warn!("Failed to remove workspace {}: {}", path.display(), e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(root: &Path) -> WorkspaceManager {
        WorkspaceManager::new(root.join("workspaces"), "sfm-test-")
    }

    #[test]
    fn test_create_lays_out_subtrees() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path());

        let ws = manager.create().unwrap();
        assert!(ws.images_dir().is_dir());
        assert!(ws.outputs_dir().is_dir());
        assert!(ws.path().starts_with(manager.root()));
        assert!(ws
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("sfm-test-"));
        assert_eq!(ws.sfm_dir().parent().unwrap(), ws.outputs_dir());
        assert_eq!(ws.archive_path().parent().unwrap(), ws.path());

        ws.close().unwrap();
    }

    #[test]
    fn test_workspaces_are_unique() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path());

        let a = manager.create().unwrap();
        let b = manager.create().unwrap();
        assert_ne!(a.path(), b.path());
        assert_eq!(manager.live_workspaces().unwrap().len(), 2);

        a.close().unwrap();
        b.close().unwrap();
        assert!(manager.live_workspaces().unwrap().is_empty());
    }

    #[test]
    fn test_close_removes_contents() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path());

        let ws = manager.create().unwrap();
        std::fs::create_dir_all(ws.sfm_dir().join("models/0")).unwrap();
        std::fs::write(ws.sfm_dir().join("models/0/points3D.bin"), b"data").unwrap();
        std::fs::write(ws.images_dir().join("a.jpg"), b"jpeg").unwrap();
        let path = ws.path().to_path_buf();

        ws.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_workspace() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path());

        let path = {
            let ws = manager.create().unwrap();
            std::fs::write(ws.images_dir().join("a.jpg"), b"jpeg").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_live_workspaces_missing_root() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path().join("absent"), "sfm-");
        assert!(manager.live_workspaces().unwrap().is_empty());
    }
}
