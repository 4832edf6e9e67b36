//! Pipeline facade
//!
//! Wires the working-area manager, registry, scheduler and packager together
//! and exposes the operations the upload, status and download surfaces use.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::BatchConfig;
use crate::conversion::{Converter, ImageConverter};
use crate::error::{Error, Result};
use crate::processing::{JobRegistry, Packager, RegistryStats, Scheduler, SchedulerStats};
use crate::storage::{WorkingArea, WorkingAreaManager};
use crate::types::{ConversionOptions, JobId, JobStatus, JobStatusView, Task, TaskId};

/// An uploaded file already stored in a working area
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// File name as sent by the client
    pub original_name: String,
    /// Stored location inside the area's input directory
    pub path: PathBuf,
}

impl SourceFile {
    pub fn new(original_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            original_name: original_name.into(),
            path: path.into(),
        }
    }
}

/// Answer to a download request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveLookup {
    /// Archive ready at this path
    Ready(PathBuf),
    /// Job still running
    NotReady,
    /// Job finished without anything to download
    NoContent,
    /// Unknown or expired job
    NotFound,
}

/// What one maintenance pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub timed_out: Vec<JobId>,
    pub expired: Vec<JobId>,
}

/// Combined pipeline statistics
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub jobs: RegistryStats,
    pub scheduler: SchedulerStats,
    pub max_active_jobs: Option<usize>,
}

struct PipelineInner {
    config: BatchConfig,
    storage: WorkingAreaManager,
    registry: Arc<JobRegistry>,
    packager: Arc<Packager>,
    scheduler: Scheduler,
}

/// Batch conversion pipeline
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Build the pipeline around a converter. Must be called from within a
    /// Tokio runtime; the scheduler's dispatcher starts immediately.
    pub fn new(config: BatchConfig, converter: Arc<dyn Converter>) -> Self {
        let storage = WorkingAreaManager::new(&config.storage.root_dir);
        let registry = Arc::new(JobRegistry::new(config.storage.retention()));
        let packager = Arc::new(Packager::new(Arc::clone(&registry)));
        let scheduler = Scheduler::start(
            Arc::clone(&registry),
            converter,
            Arc::clone(&packager),
            config.processing.concurrency(),
            config.processing.task_timeout(),
        );

        Self {
            inner: Arc::new(PipelineInner {
                config,
                storage,
                registry,
                packager,
                scheduler,
            }),
        }
    }

    /// Pipeline using [`ImageConverter`] configured from `config.conversion`
    pub fn with_image_converter(config: BatchConfig) -> Self {
        let converter = Arc::new(ImageConverter::from_config(&config.conversion));
        Self::new(config, converter)
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &WorkingAreaManager {
        &self.inner.storage
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn packager(&self) -> &Arc<Packager> {
        &self.inner.packager
    }

    /// Create a working area for an incoming upload
    pub async fn allocate_working_area(&self) -> Result<WorkingArea> {
        self.inner.storage.allocate().await
    }

    /// Register a batch and queue one task per file.
    ///
    /// `options` is either one entry applied to every file or one entry per
    /// file. Nothing is scheduled when this returns an error; reclaiming the
    /// area is then up to the caller.
    pub fn create_batch(
        &self,
        area: WorkingArea,
        files: Vec<SourceFile>,
        options: Vec<ConversionOptions>,
    ) -> Result<JobId> {
        if files.is_empty() {
            return Err(Error::validation("batch contains no files"));
        }
        let max_files = self.inner.config.upload.max_files;
        if files.len() > max_files {
            return Err(Error::validation(format!(
                "batch has {} files, limit is {}",
                files.len(),
                max_files
            )));
        }

        let options = match options.len() {
            1 => vec![options[0].clone(); files.len()],
            n if n == files.len() => options,
            n => {
                return Err(Error::validation(format!(
                    "{} option sets for {} files",
                    n,
                    files.len()
                )))
            }
        };
        for opts in &options {
            opts.validate()?;
        }

        for file in &files {
            if !file.path.starts_with(area.root()) {
                return Err(Error::validation(format!(
                    "{} is outside the job's working area",
                    file.original_name
                )));
            }
        }

        if let Some(limit) = self.inner.config.admission.max_active_jobs {
            let active = self.inner.registry.active_jobs();
            if active >= limit {
                tracing::warn!("Rejecting batch: {} active jobs (limit {})", active, limit);
                return Err(Error::Capacity { limit });
            }
        }

        let tasks: Vec<Task> = files
            .into_iter()
            .zip(options)
            .enumerate()
            .map(|(id, (file, opts))| Task::new(id, file.original_name, file.path, opts))
            .collect();
        let task_count = tasks.len();

        let job_id = self.inner.registry.create_job(area, tasks);
        self.inner.scheduler.submit(job_id, 0..task_count);

        tracing::info!("Created job {} with {} files", job_id, task_count);
        Ok(job_id)
    }

    /// Current status of a job.
    ///
    /// A finished job past its retention deadline is expired on the spot and
    /// reported as not found.
    pub async fn get_status(&self, job_id: JobId) -> Result<JobStatusView> {
        self.expire_if_due(&job_id, Utc::now()).await;
        self.inner
            .registry
            .view(&job_id)
            .ok_or(Error::JobNotFound(job_id))
    }

    /// Resolve a download request
    pub async fn get_archive(&self, job_id: JobId) -> ArchiveLookup {
        self.expire_if_due(&job_id, Utc::now()).await;
        let Some(job) = self.inner.registry.get_job(&job_id) else {
            return ArchiveLookup::NotFound;
        };

        match job.status {
            JobStatus::Expired => ArchiveLookup::NotFound,
            status if !status.is_terminal() => ArchiveLookup::NotReady,
            _ => match job.result_location {
                Some(path) => ArchiveLookup::Ready(path),
                None => ArchiveLookup::NoContent,
            },
        }
    }

    /// Delete a finished job after its archive was delivered
    pub async fn acknowledge_download(&self, job_id: JobId) -> Result<()> {
        let status = self
            .inner
            .registry
            .get_job(&job_id)
            .map(|j| j.status)
            .ok_or(Error::JobNotFound(job_id))?;
        if !status.is_terminal() {
            return Err(Error::invalid_state(format!(
                "job {} is still {}",
                job_id, status
            )));
        }

        if let Some(job) = self.inner.registry.delete_job(&job_id)? {
            self.inner.storage.reclaim(&job.working_area).await?;
            tracing::info!("Job {} downloaded and removed", job_id);
        }
        Ok(())
    }

    /// Re-dispatch a failed task of a job that is still running
    pub fn retry_task(&self, job_id: JobId, task_id: TaskId) -> Result<()> {
        if self.inner.scheduler.is_overrunning(job_id, task_id) {
            return Err(Error::invalid_state(format!(
                "previous attempt of task {} is still running",
                task_id
            )));
        }
        self.inner.registry.reset_task_for_retry(job_id, task_id)?;
        self.inner.scheduler.submit(job_id, [task_id]);
        tracing::info!("Retrying task {} of job {}", task_id, job_id);
        Ok(())
    }

    /// Fail jobs past their maximum age and remove jobs past retention
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let timed_out = self
            .inner
            .registry
            .fail_timed_out(now, self.inner.config.processing.job_max_age());
        for job_id in &timed_out {
            self.inner.scheduler.cancel(job_id);
        }

        let mut expired = Vec::new();
        for job_id in self.inner.registry.list_expired(now) {
            if self.expire_if_due(&job_id, now).await {
                expired.push(job_id);
            }
        }

        if !timed_out.is_empty() || !expired.is_empty() {
            tracing::info!(
                "Sweep: {} jobs timed out, {} jobs expired",
                timed_out.len(),
                expired.len()
            );
        }
        SweepReport { timed_out, expired }
    }

    async fn expire_if_due(&self, job_id: &JobId, now: DateTime<Utc>) -> bool {
        let Some(area) = self.inner.registry.expire_job(job_id, now) else {
            return false;
        };
        if let Err(e) = self.inner.storage.reclaim(&area).await {
            tracing::warn!("Failed to reclaim area of expired job {}: {}", job_id, e);
        }
        true
    }

    /// Run [`Pipeline::sweep`] every `interval` until the handle is aborted
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pipeline.sweep(Utc::now()).await;
            }
        })
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            jobs: self.inner.registry.stats(),
            scheduler: self.inner.scheduler.stats(),
            max_active_jobs: self.inner.config.admission.max_active_jobs,
        }
    }

    /// Stop dispatching new tasks
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::ConversionError;
    use crate::types::OutputFormat;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    /// Copies the source into the output directory unchanged
    struct CopyConverter;

    #[async_trait]
    impl Converter for CopyConverter {
        async fn convert(
            &self,
            source: &Path,
            options: &ConversionOptions,
            output_dir: &Path,
        ) -> std::result::Result<PathBuf, ConversionError> {
            let out = crate::conversion::output_path_for(source, options, output_dir);
            tokio::fs::copy(source, &out).await?;
            Ok(out)
        }

        fn name(&self) -> &str {
            "copy"
        }
    }

    fn config(tmp: &TempDir) -> BatchConfig {
        let mut config = BatchConfig::default();
        config.storage.root_dir = tmp.path().to_path_buf();
        config.processing.max_concurrency = Some(2);
        config
    }

    async fn upload(pipeline: &Pipeline, names: &[&str]) -> (WorkingArea, Vec<SourceFile>) {
        let area = pipeline.allocate_working_area().await.unwrap();
        let mut files = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let path = pipeline
                .storage()
                .store_input(&area, i, name, name.as_bytes())
                .await
                .unwrap();
            files.push(SourceFile::new(*name, path));
        }
        (area, files)
    }

    async fn wait_terminal(pipeline: &Pipeline, id: JobId) -> JobStatusView {
        for _ in 0..500 {
            let view = pipeline.get_status(id).await.unwrap();
            if view.status.is_terminal() {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", id);
    }

    #[tokio::test]
    async fn test_batch_to_download() {
        let tmp = TempDir::new().unwrap();
        let pipeline = Pipeline::new(config(&tmp), Arc::new(CopyConverter));
        let (area, files) = upload(&pipeline, &["a.png", "b.png"]).await;
        let area_root = area.root().to_path_buf();

        let id = pipeline
            .create_batch(area, files, vec![ConversionOptions::new(OutputFormat::Webp)])
            .unwrap();
        assert_eq!(wait_terminal(&pipeline, id).await.status, JobStatus::Completed);

        let ArchiveLookup::Ready(path) = pipeline.get_archive(id).await else {
            panic!("archive not ready");
        };
        assert!(path.exists());

        pipeline.acknowledge_download(id).await.unwrap();
        assert!(!area_root.exists());
        assert_eq!(pipeline.get_archive(id).await, ArchiveLookup::NotFound);
        assert!(matches!(
            pipeline.get_status(id).await,
            Err(Error::JobNotFound(_))
        ));
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn test_create_batch_validation() {
        let tmp = TempDir::new().unwrap();
        let pipeline = Pipeline::new(config(&tmp), Arc::new(CopyConverter));
        let (area, files) = upload(&pipeline, &["a.png", "b.png", "c.png"]).await;

        let two = vec![ConversionOptions::new(OutputFormat::Png); 2];
        assert!(matches!(
            pipeline.create_batch(area.clone(), files.clone(), two),
            Err(Error::Validation(_))
        ));

        let huge = vec![ConversionOptions::new(OutputFormat::Png).with_size(Some(0), None)];
        assert!(pipeline.create_batch(area.clone(), files.clone(), huge).is_err());

        assert!(matches!(
            pipeline.create_batch(area.clone(), Vec::new(), vec![ConversionOptions::new(OutputFormat::Png)]),
            Err(Error::Validation(_))
        ));

        let outside = vec![SourceFile::new("x.png", "/etc/passwd")];
        assert!(matches!(
            pipeline.create_batch(area, outside, vec![ConversionOptions::new(OutputFormat::Png)]),
            Err(Error::Validation(_))
        ));

        assert!(pipeline.registry().is_empty());
        assert_eq!(pipeline.scheduler().queued(), 0);
        pipeline.shutdown();
    }

    /// [`CopyConverter`] that takes its time
    struct DelayedCopyConverter(Duration);

    #[async_trait]
    impl Converter for DelayedCopyConverter {
        async fn convert(
            &self,
            source: &Path,
            options: &ConversionOptions,
            output_dir: &Path,
        ) -> std::result::Result<PathBuf, ConversionError> {
            tokio::time::sleep(self.0).await;
            CopyConverter.convert(source, options, output_dir).await
        }

        fn name(&self) -> &str {
            "delayed-copy"
        }
    }

    #[tokio::test]
    async fn test_admission_ceiling() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(&tmp);
        config.admission.max_active_jobs = Some(1);
        let pipeline = Pipeline::new(
            config,
            Arc::new(DelayedCopyConverter(Duration::from_millis(300))),
        );

        let (area, files) = upload(&pipeline, &["a.png"]).await;
        let first = pipeline
            .create_batch(area, files, vec![ConversionOptions::new(OutputFormat::Png)])
            .unwrap();

        let (area, files) = upload(&pipeline, &["b.png"]).await;
        let result = pipeline.create_batch(
            area.clone(),
            files.clone(),
            vec![ConversionOptions::new(OutputFormat::Png)],
        );
        assert!(matches!(result, Err(Error::Capacity { limit: 1 })));
        assert_eq!(pipeline.registry().len(), 1);
        assert_eq!(pipeline.scheduler().queued(), 0);

        // Room again once the first job has finished
        wait_terminal(&pipeline, first).await;
        pipeline
            .create_batch(area, files, vec![ConversionOptions::new(OutputFormat::Png)])
            .unwrap();
        assert_eq!(pipeline.registry().len(), 2);
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn test_sweep_expires_finished_jobs() {
        let tmp = TempDir::new().unwrap();
        let pipeline = Pipeline::new(config(&tmp), Arc::new(CopyConverter));
        let (area, files) = upload(&pipeline, &["a.png"]).await;
        let area_root = area.root().to_path_buf();
        let id = pipeline
            .create_batch(area, files, vec![ConversionOptions::new(OutputFormat::Png)])
            .unwrap();
        wait_terminal(&pipeline, id).await;

        let report = pipeline.sweep(Utc::now()).await;
        assert!(report.expired.is_empty());

        let later = Utc::now() + chrono::Duration::hours(2);
        let report = pipeline.sweep(later).await;
        assert_eq!(report.expired, vec![id]);
        assert!(!area_root.exists());
        assert_eq!(pipeline.get_archive(id).await, ArchiveLookup::NotFound);
        pipeline.shutdown();
    }
}
