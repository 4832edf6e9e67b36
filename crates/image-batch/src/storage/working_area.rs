//! Per-job working directories
//!
//! Each batch gets a private directory under the storage root holding its
//! uploaded inputs, converted outputs and the final archive. The directory is
//! removed as a whole when the job is downloaded or expires.

use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Error, Result};

const INPUT_DIR: &str = "input";
const OUTPUT_DIR: &str = "output";
const ARCHIVE_NAME: &str = "converted-images.zip";

/// Handle to one job's scratch directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingArea {
    root: PathBuf,
}

impl WorkingArea {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding uploaded source files
    pub fn input_dir(&self) -> PathBuf {
        self.root.join(INPUT_DIR)
    }

    /// Directory converters write into
    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    /// Location of the packaged archive
    pub fn archive_path(&self) -> PathBuf {
        self.root.join(ARCHIVE_NAME)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(root: PathBuf) -> Self {
        Self { root }
    }
}

/// Allocates and reclaims working areas under a single root
#[derive(Debug, Clone)]
pub struct WorkingAreaManager {
    root: PathBuf,
}

impl WorkingAreaManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the storage root if it does not exist
    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            Error::storage(format!(
                "Failed to create storage root {}: {}",
                self.root.display(),
                e
            ))
        })
    }

    /// Create a fresh working area with empty input and output directories
    pub async fn allocate(&self) -> Result<WorkingArea> {
        let area = WorkingArea {
            root: self.root.join(Uuid::new_v4().to_string()),
        };

        for dir in [area.input_dir(), area.output_dir()] {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                Error::storage(format!(
                    "Failed to allocate working area {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        tracing::debug!("Allocated working area {}", area.root.display());
        Ok(area)
    }

    /// Write an uploaded file into the area's input directory.
    ///
    /// The stored name is prefixed with `index` so identical client names
    /// never collide.
    pub async fn store_input(
        &self,
        area: &WorkingArea,
        index: usize,
        file_name: &str,
        data: &[u8],
    ) -> Result<PathBuf> {
        let path = area
            .input_dir()
            .join(format!("{:04}_{}", index, sanitize_file_name(file_name)));

        tokio::fs::write(&path, data).await.map_err(|e| {
            Error::storage(format!("Failed to store upload {}: {}", path.display(), e))
        })?;

        Ok(path)
    }

    /// Remove an area and everything in it. Missing areas are not an error.
    pub async fn reclaim(&self, area: &WorkingArea) -> Result<()> {
        match tokio::fs::remove_dir_all(area.root()).await {
            Ok(()) => {
                tracing::debug!("Reclaimed working area {}", area.root().display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(format!(
                "Failed to reclaim working area {}: {}",
                area.root().display(),
                e
            ))),
        }
    }

    /// Remove every area left behind by a previous process.
    ///
    /// Job state is not persisted, so anything under the root at startup is
    /// unreachable.
    pub async fn purge_all(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                match tokio::fs::remove_dir_all(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!(
                        "Failed to remove stale area {}: {}",
                        entry.path().display(),
                        e
                    ),
                }
            }
        }

        Ok(removed)
    }
}

/// Strip directory components and characters unsafe in file names
pub fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("upload");

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_allocate_and_reclaim() {
        let tmp = TempDir::new().unwrap();
        let manager = WorkingAreaManager::new(tmp.path());

        let area = manager.allocate().await.unwrap();
        assert!(area.input_dir().is_dir());
        assert!(area.output_dir().is_dir());
        assert!(area.root().starts_with(tmp.path()));

        let stored = manager
            .store_input(&area, 3, "../../etc/photo one.png", b"data")
            .await
            .unwrap();
        assert_eq!(stored.file_name().unwrap(), "0003_photo_one.png");
        assert!(stored.starts_with(area.input_dir()));

        manager.reclaim(&area).await.unwrap();
        assert!(!area.root().exists());

        // Second reclaim is a no-op
        manager.reclaim(&area).await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_all() {
        let tmp = TempDir::new().unwrap();
        let manager = WorkingAreaManager::new(tmp.path().join("areas"));
        assert_eq!(manager.purge_all().await.unwrap(), 0);

        manager.ensure_root().await.unwrap();
        manager.allocate().await.unwrap();
        manager.allocate().await.unwrap();
        assert_eq!(manager.purge_all().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_allocate_fails_under_file_root() {
        let tmp = TempDir::new().unwrap();
        let file_root = tmp.path().join("not-a-dir");
        std::fs::write(&file_root, b"x").unwrap();

        let manager = WorkingAreaManager::new(&file_root);
        assert!(matches!(manager.allocate().await, Err(Error::Storage(_))));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("cat.jpg"), "cat.jpg");
        assert_eq!(sanitize_file_name("a b/c d.png"), "c_d.png");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name(""), "upload");
    }
}
