//! Bundles a finished job's outputs into a single zip archive

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{Error, Result};
use crate::storage::sanitize_file_name;
use crate::types::{Job, JobId, JobStatus};

use super::registry::JobRegistry;

/// One file to place in the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Name inside the archive
    pub name: String,
    /// Converted file on disk
    pub path: PathBuf,
}

/// Result packager
pub struct Packager {
    registry: Arc<JobRegistry>,
    runs: AtomicUsize,
}

impl Packager {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self {
            registry,
            runs: AtomicUsize::new(0),
        }
    }

    /// Number of packaging runs started since creation
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Package a job whose last task just finished and record the result.
    ///
    /// Must be called once per [`super::UpdateOutcome::ReadyToPackage`].
    pub async fn run(&self, job_id: JobId) -> Option<JobStatus> {
        self.runs.fetch_add(1, Ordering::SeqCst);

        let Some(job) = self.registry.get_job(&job_id) else {
            tracing::warn!("Job {} vanished before packaging", job_id);
            return None;
        };

        let result = match Self::package(&job).await {
            Ok(Some(path)) => {
                tracing::info!(
                    "[{}] Packaged {} files into {}",
                    job_id,
                    job.succeeded_tasks().count(),
                    path.display()
                );
                Ok(Some(path))
            }
            Ok(None) => {
                tracing::info!("[{}] No successful outputs, skipping archive", job_id);
                Ok(None)
            }
            Err(e) => {
                tracing::error!("[{}] Packaging failed: {}", job_id, e);
                Err(e.to_string())
            }
        };

        let status = self.registry.finish_packaging(job_id, result);
        if let Some(status) = status {
            tracing::info!("Job {} finished: {}", job_id, status);
        }
        status
    }

    /// Write the archive for `job`, or return `None` when no task succeeded
    pub async fn package(job: &Job) -> Result<Option<PathBuf>> {
        let entries = archive_entries(job);
        if entries.is_empty() {
            return Ok(None);
        }

        let archive_path = job.working_area.archive_path();
        let target = archive_path.clone();
        tokio::task::spawn_blocking(move || write_archive(&target, &entries))
            .await
            .map_err(|e| Error::internal(format!("packaging task aborted: {}", e)))??;

        Ok(Some(archive_path))
    }
}

/// Archive entries for the job's succeeded tasks, in task order.
///
/// Entries are named after the client's original file name with the target
/// extension; duplicate names get a numeric suffix.
pub fn archive_entries(job: &Job) -> Vec<ArchiveEntry> {
    let mut used = HashSet::new();

    job.succeeded_tasks()
        .filter_map(|task| {
            let path = task.output_path.clone()?;
            let original = sanitize_file_name(&task.original_name);
            let stem = Path::new(&original)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("image")
                .to_string();
            let ext = task.options.format.extension();

            let mut name = format!("{}.{}", stem, ext);
            let mut n = 1;
            while !used.insert(name.clone()) {
                name = format!("{}-{}.{}", stem, n, ext);
                n += 1;
            }

            Some(ArchiveEntry { name, path })
        })
        .collect()
}

fn write_archive(target: &Path, entries: &[ArchiveEntry]) -> Result<()> {
    let file = File::create(target).map_err(|e| {
        Error::storage(format!("Failed to create archive {}: {}", target.display(), e))
    })?;
    let mut zip = ZipWriter::new(BufWriter::new(file));

    // Converted images are already compressed
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    for entry in entries {
        zip.start_file(entry.name.as_str(), options)
            .map_err(|e| Error::storage(format!("Failed to add {}: {}", entry.name, e)))?;
        let mut source = File::open(&entry.path).map_err(|e| {
            Error::storage(format!("Failed to read {}: {}", entry.path.display(), e))
        })?;
        std::io::copy(&mut source, &mut zip)?;
    }

    let mut writer = zip
        .finish()
        .map_err(|e| Error::storage(format!("Failed to finish archive: {}", e)))?;
    writer.flush()?;
    Ok(())
}
