//! Authoritative in-memory store of jobs and their tasks
//!
//! Every job record sits behind its own mutex inside a sharded map, so
//! mutations of one job are serialized while different jobs proceed in
//! parallel. The scheduler, the packager and the status/download paths all go
//! through this store; nobody keeps a private copy of a job.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::WorkingArea;
use crate::types::{
    ConversionOptions, ErrorSummary, FailureKind, Job, JobId, JobStatus, JobStatusView, Task,
    TaskFailure, TaskId, TaskOutcome, TaskStatus,
};

/// Result of applying a task outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Outcome applied, job still has unfinished tasks
    Recorded(JobStatus),
    /// Outcome applied and it was the last unfinished task. Returned exactly
    /// once per job; the caller must run the packager.
    ReadyToPackage,
    /// Job deleted, already terminal, or task not running. Nothing changed.
    Stale,
}

/// What the scheduler needs to run one task
#[derive(Debug, Clone)]
pub struct DispatchTicket {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub file_name: String,
    pub source_path: PathBuf,
    pub options: ConversionOptions,
    pub output_dir: PathBuf,
}

/// Registry statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total_jobs: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub partially_completed: usize,
    pub failed: usize,
    pub packaging: usize,
}

struct JobEntry {
    job: Job,
    /// Packager invocation outstanding
    packaging: bool,
}

impl JobEntry {
    fn is_settled(&self) -> bool {
        self.job.status.is_terminal() || self.packaging
    }
}

/// Job registry
pub struct JobRegistry {
    jobs: DashMap<JobId, Arc<Mutex<JobEntry>>>,
    retention: ChronoDuration,
}

impl JobRegistry {
    /// Create a registry that keeps finished jobs for `retention`
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            retention: ChronoDuration::from_std(retention)
                .unwrap_or_else(|_| ChronoDuration::days(365)),
        }
    }

    fn entry(&self, job_id: &JobId) -> Option<Arc<Mutex<JobEntry>>> {
        self.jobs.get(job_id).map(|e| Arc::clone(e.value()))
    }

    fn entries(&self) -> Vec<(JobId, Arc<Mutex<JobEntry>>)> {
        self.jobs
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect()
    }

    /// Insert a new `Queued` job and return its id.
    ///
    /// The job is visible to status queries as soon as this returns.
    pub fn create_job(&self, working_area: WorkingArea, tasks: Vec<Task>) -> JobId {
        let job_id = Uuid::new_v4();
        let job = Job::new(job_id, working_area, tasks);
        tracing::debug!("Registered job {} with {} tasks", job_id, job.tasks.len());
        self.jobs.insert(
            job_id,
            Arc::new(Mutex::new(JobEntry {
                job,
                packaging: false,
            })),
        );
        job_id
    }

    /// Snapshot of a job
    pub fn get_job(&self, job_id: &JobId) -> Option<Job> {
        self.entry(job_id).map(|entry| {
            let guard = entry.lock();
            guard.job.clone()
        })
    }

    /// Status view of a job
    pub fn view(&self, job_id: &JobId) -> Option<JobStatusView> {
        self.entry(job_id).map(|entry| {
            let guard = entry.lock();
            JobStatusView::from_job(&guard.job)
        })
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Number of jobs that are not yet terminal
    pub fn active_jobs(&self) -> usize {
        self.entries()
            .iter()
            .filter(|(_, e)| !e.lock().job.status.is_terminal())
            .count()
    }

    /// Move a pending task to `Running` and hand out what is needed to run it.
    ///
    /// Returns `None` when the job is gone or settled, or the task is not
    /// pending; such queue entries are simply dropped by the scheduler.
    pub fn mark_running(&self, job_id: JobId, task_id: TaskId) -> Option<DispatchTicket> {
        let entry = self.entry(&job_id)?;
        let mut guard = entry.lock();
        if guard.is_settled() {
            return None;
        }

        let output_dir = guard.job.working_area.output_dir();
        let task = guard.job.task_mut(task_id)?;
        if task.status != TaskStatus::Pending {
            return None;
        }

        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.finished_at = None;
        task.attempts += 1;

        let ticket = DispatchTicket {
            job_id,
            task_id,
            file_name: task.original_name.clone(),
            source_path: task.source_path.clone(),
            options: task.options.clone(),
            output_dir,
        };

        guard.job.status = guard.job.aggregate_status();
        Some(ticket)
    }

    /// Apply a task outcome and recompute the job status.
    ///
    /// This is the single mutation point while a job is processing. The
    /// transition into "all tasks finished" is detected here, under the job
    /// lock, and reported as [`UpdateOutcome::ReadyToPackage`] exactly once.
    pub fn update_task_status(
        &self,
        job_id: JobId,
        task_id: TaskId,
        outcome: TaskOutcome,
    ) -> UpdateOutcome {
        let Some(entry) = self.entry(&job_id) else {
            tracing::debug!("Discarding outcome for deleted job {} task {}", job_id, task_id);
            return UpdateOutcome::Stale;
        };
        let mut guard = entry.lock();
        if guard.is_settled() {
            tracing::debug!(
                "Discarding outcome for settled job {} task {} (status {})",
                job_id,
                task_id,
                guard.job.status
            );
            return UpdateOutcome::Stale;
        }

        let Some(task) = guard.job.task_mut(task_id) else {
            tracing::warn!("Outcome for unknown task {} in job {}", task_id, job_id);
            return UpdateOutcome::Stale;
        };
        if task.status != TaskStatus::Running {
            return UpdateOutcome::Stale;
        }

        task.finished_at = Some(Utc::now());
        match outcome {
            TaskOutcome::Succeeded(path) => {
                task.status = TaskStatus::Succeeded;
                task.output_path = Some(path);
                task.failure = None;
            }
            TaskOutcome::Failed(failure) => {
                task.status = TaskStatus::Failed;
                task.output_path = None;
                task.failure = Some(failure);
            }
        }

        let aggregate = guard.job.aggregate_status();
        if aggregate.is_terminal() {
            // Stays `Processing` until the packager reports back
            guard.packaging = true;
            guard.job.status = JobStatus::Processing;
            UpdateOutcome::ReadyToPackage
        } else {
            guard.job.status = aggregate;
            UpdateOutcome::Recorded(aggregate)
        }
    }

    /// Record the packager's result and move the job to its terminal status.
    ///
    /// `result` is the archive location (`None` when nothing succeeded) or
    /// the packaging fault, which forces the job to `Failed`.
    pub fn finish_packaging(
        &self,
        job_id: JobId,
        result: std::result::Result<Option<PathBuf>, String>,
    ) -> Option<JobStatus> {
        let entry = self.entry(&job_id)?;
        let mut guard = entry.lock();
        if !guard.packaging {
            tracing::warn!("Packaging result for job {} without outstanding packaging", job_id);
            return None;
        }
        guard.packaging = false;

        let job = &mut guard.job;
        let failures = job.collect_failures();
        match result {
            Ok(location) => {
                job.status = job.aggregate_status();
                job.result_location = location;
                if matches!(job.status, JobStatus::Failed | JobStatus::PartiallyCompleted) {
                    job.error_summary = Some(ErrorSummary {
                        reason: None,
                        failures,
                    });
                }
            }
            Err(reason) => {
                job.status = JobStatus::Failed;
                job.result_location = None;
                job.error_summary = Some(ErrorSummary {
                    reason: Some(format!("packaging failed: {}", reason)),
                    failures,
                });
            }
        }

        if job.completed_at.is_none() {
            job.completed_at = Some(Utc::now());
        }
        Some(job.status)
    }

    /// Force jobs older than `max_age` that are still running to `Failed`.
    ///
    /// Unfinished tasks are abandoned: marked failed here, and their late
    /// outcomes are discarded as [`UpdateOutcome::Stale`].
    pub fn fail_timed_out(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<JobId> {
        let max_age = ChronoDuration::from_std(max_age).unwrap_or_else(|_| ChronoDuration::days(365));
        let mut timed_out = Vec::new();

        for (job_id, entry) in self.entries() {
            let mut guard = entry.lock();
            if guard.is_settled() || now - guard.job.created_at <= max_age {
                continue;
            }

            let job = &mut guard.job;
            for task in job.tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
                task.status = TaskStatus::Failed;
                task.finished_at = Some(now);
                task.failure = Some(TaskFailure::new(
                    FailureKind::ResourceExceeded,
                    "abandoned: job exceeded its maximum age",
                ));
            }

            job.status = JobStatus::Failed;
            job.error_summary = Some(ErrorSummary {
                reason: Some("timeout".to_string()),
                failures: job.collect_failures(),
            });
            if job.completed_at.is_none() {
                job.completed_at = Some(now);
            }

            tracing::warn!("Job {} timed out after {}s", job_id, (now - job.created_at).num_seconds());
            timed_out.push(job_id);
        }

        timed_out
    }

    /// Reset a failed task to `Pending` so it can be dispatched again.
    ///
    /// Only allowed while the job is still running; a finished job is
    /// immutable.
    pub fn reset_task_for_retry(&self, job_id: JobId, task_id: TaskId) -> Result<()> {
        let entry = self.entry(&job_id).ok_or(Error::JobNotFound(job_id))?;
        let mut guard = entry.lock();
        if guard.is_settled() {
            return Err(Error::invalid_state(format!(
                "job {} has already finished ({})",
                job_id, guard.job.status
            )));
        }

        let task = guard
            .job
            .task_mut(task_id)
            .ok_or(Error::TaskNotFound { job_id, task_id })?;
        if task.status != TaskStatus::Failed {
            return Err(Error::invalid_state(format!(
                "task {} is {:?}, only failed tasks can be retried",
                task_id, task.status
            )));
        }

        task.status = TaskStatus::Pending;
        task.failure = None;
        task.output_path = None;
        task.finished_at = None;

        guard.job.status = guard.job.aggregate_status();
        Ok(())
    }

    fn is_expired(&self, entry: &JobEntry, now: DateTime<Utc>) -> bool {
        !entry.packaging
            && entry.job.status.is_terminal()
            && entry
                .job
                .completed_at
                .map(|done| now - done >= self.retention)
                .unwrap_or(false)
    }

    /// Finished jobs whose retention deadline has passed
    pub fn list_expired(&self, now: DateTime<Utc>) -> Vec<JobId> {
        self.entries()
            .into_iter()
            .filter(|(_, e)| self.is_expired(&e.lock(), now))
            .map(|(id, _)| id)
            .collect()
    }

    /// Mark an expired job `Expired` and remove it, returning its working area
    pub fn expire_job(&self, job_id: &JobId, now: DateTime<Utc>) -> Option<WorkingArea> {
        let (_, entry) = self
            .jobs
            .remove_if(job_id, |_, e| self.is_expired(&e.lock(), now))?;
        let mut guard = entry.lock();
        guard.job.status = JobStatus::Expired;
        tracing::info!("Job {} expired", job_id);
        Some(guard.job.working_area.clone())
    }

    /// Remove a job record.
    ///
    /// Refused while the job's packaging is outstanding. Returns `Ok(None)`
    /// for unknown ids.
    pub fn delete_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        let Some(entry) = self.entry(job_id) else {
            return Ok(None);
        };
        if entry.lock().packaging {
            return Err(Error::invalid_state(format!(
                "job {} is being packaged",
                job_id
            )));
        }

        Ok(self
            .jobs
            .remove_if(job_id, |_, e| !e.lock().packaging)
            .map(|(_, entry)| {
                let guard = entry.lock();
                guard.job.clone()
            }))
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for (_, entry) in self.entries() {
            let guard = entry.lock();
            stats.total_jobs += 1;
            if guard.packaging {
                stats.packaging += 1;
            }
            match guard.job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::PartiallyCompleted => stats.partially_completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Expired => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutputFormat, TaskFailure};

    fn area(name: &str) -> WorkingArea {
        crate::storage::WorkingArea::for_tests(PathBuf::from("/tmp/areas").join(name))
    }

    fn tasks(n: usize) -> Vec<Task> {
        (0..n)
            .map(|i| {
                Task::new(
                    i,
                    format!("img{}.png", i),
                    PathBuf::from(format!("/tmp/in/{}.png", i)),
                    ConversionOptions::new(OutputFormat::Jpeg),
                )
            })
            .collect()
    }

    fn ok(i: usize) -> TaskOutcome {
        TaskOutcome::Succeeded(PathBuf::from(format!("/tmp/out/{}.jpg", i)))
    }

    fn corrupt() -> TaskOutcome {
        TaskOutcome::Failed(TaskFailure::new(FailureKind::CorruptInput, "bad data"))
    }

    #[test]
    fn test_create_job_is_queued() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let id = registry.create_job(area("a"), tasks(3));

        let job = registry.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.tasks.iter().all(|t| t.status == TaskStatus::Pending));
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_lifecycle_partial() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let id = registry.create_job(area("a"), tasks(3));

        for i in 0..3 {
            assert!(registry.mark_running(id, i).is_some());
        }
        assert_eq!(registry.get_job(&id).unwrap().status, JobStatus::Processing);

        assert_eq!(
            registry.update_task_status(id, 0, ok(0)),
            UpdateOutcome::Recorded(JobStatus::Processing)
        );
        assert_eq!(
            registry.update_task_status(id, 2, corrupt()),
            UpdateOutcome::Recorded(JobStatus::Processing)
        );
        assert_eq!(registry.update_task_status(id, 1, ok(1)), UpdateOutcome::ReadyToPackage);

        // Not terminal until the packager reports back
        let job = registry.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.completed_at.is_none());

        let status = registry
            .finish_packaging(id, Ok(Some(PathBuf::from("/tmp/areas/a/out.zip"))))
            .unwrap();
        assert_eq!(status, JobStatus::PartiallyCompleted);

        let job = registry.get_job(&id).unwrap();
        assert!(job.completed_at.is_some());
        let summary = job.error_summary.unwrap();
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].kind, FailureKind::CorruptInput);
        assert_eq!(summary.failures[0].task_id, 2);
    }

    #[test]
    fn test_duplicate_completion_triggers_packaging_once() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let id = registry.create_job(area("a"), tasks(1));
        registry.mark_running(id, 0).unwrap();

        assert_eq!(registry.update_task_status(id, 0, ok(0)), UpdateOutcome::ReadyToPackage);
        assert_eq!(registry.update_task_status(id, 0, ok(0)), UpdateOutcome::Stale);
        assert_eq!(registry.update_task_status(id, 0, corrupt()), UpdateOutcome::Stale);
    }

    #[test]
    fn test_concurrent_completions_trigger_packaging_once() {
        let registry = Arc::new(JobRegistry::new(Duration::from_secs(60)));
        let n = 64;
        let id = registry.create_job(area("a"), tasks(n));
        for i in 0..n {
            registry.mark_running(id, i).unwrap();
        }

        let handles: Vec<_> = (0..n)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let outcome = if i % 5 == 0 { corrupt() } else { ok(i) };
                    registry.update_task_status(id, i, outcome)
                })
            })
            .collect();

        let triggers = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == UpdateOutcome::ReadyToPackage)
            .count();
        assert_eq!(triggers, 1);
    }

    #[test]
    fn test_completed_at_set_once() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let id = registry.create_job(area("a"), tasks(1));
        registry.mark_running(id, 0).unwrap();
        registry.update_task_status(id, 0, ok(0));
        registry.finish_packaging(id, Ok(None)).unwrap();

        let first = registry.get_job(&id).unwrap().completed_at.unwrap();
        // A second packaging report is rejected and nothing changes
        assert!(registry.finish_packaging(id, Err("late".into())).is_none());
        let job = registry.get_job(&id).unwrap();
        assert_eq!(job.completed_at, Some(first));
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_packaging_failure_forces_failed() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let id = registry.create_job(area("a"), tasks(2));
        for i in 0..2 {
            registry.mark_running(id, i).unwrap();
            registry.update_task_status(id, i, ok(i));
        }

        let status = registry.finish_packaging(id, Err("disk full".into())).unwrap();
        assert_eq!(status, JobStatus::Failed);
        let job = registry.get_job(&id).unwrap();
        assert!(job.result_location.is_none());
        assert!(job.error_summary.unwrap().reason.unwrap().contains("disk full"));
    }

    #[test]
    fn test_timeout_discards_late_outcome() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let id = registry.create_job(area("a"), tasks(2));
        registry.mark_running(id, 0).unwrap();
        registry.mark_running(id, 1).unwrap();
        registry.update_task_status(id, 0, ok(0));

        let later = Utc::now() + ChronoDuration::seconds(120);
        assert_eq!(registry.fail_timed_out(later, Duration::from_secs(60)), vec![id]);

        let job = registry.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_summary.as_ref().unwrap().reason.as_deref(), Some("timeout"));
        let completed_at = job.completed_at;

        assert_eq!(registry.update_task_status(id, 1, ok(1)), UpdateOutcome::Stale);
        let job = registry.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.completed_at, completed_at);

        // Already terminal, not timed out twice
        assert!(registry.fail_timed_out(later, Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_timeout_skips_packaging_jobs() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let id = registry.create_job(area("a"), tasks(1));
        registry.mark_running(id, 0).unwrap();
        assert_eq!(registry.update_task_status(id, 0, ok(0)), UpdateOutcome::ReadyToPackage);

        let later = Utc::now() + ChronoDuration::hours(1);
        assert!(registry.fail_timed_out(later, Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_retry_reuses_task() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let id = registry.create_job(area("a"), tasks(2));
        registry.mark_running(id, 0).unwrap();
        registry.update_task_status(id, 0, corrupt());

        // Task 1 still pending, so the job is running and retry is allowed
        registry.reset_task_for_retry(id, 0).unwrap();
        let job = registry.get_job(&id).unwrap();
        assert_eq!(job.tasks.len(), 2);
        assert_eq!(job.tasks[0].status, TaskStatus::Pending);
        assert!(job.tasks[0].failure.is_none());

        let ticket = registry.mark_running(id, 0).unwrap();
        assert_eq!(ticket.task_id, 0);
        assert_eq!(registry.get_job(&id).unwrap().tasks[0].attempts, 2);

        assert!(matches!(
            registry.reset_task_for_retry(id, 1),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            registry.reset_task_for_retry(id, 9),
            Err(Error::TaskNotFound { .. })
        ));
    }

    #[test]
    fn test_expiry_and_deletion() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let id = registry.create_job(area("a"), tasks(1));
        registry.mark_running(id, 0).unwrap();
        registry.update_task_status(id, 0, corrupt());

        // Packaging outstanding: neither expired nor deletable
        let far = Utc::now() + ChronoDuration::hours(2);
        assert!(registry.list_expired(far).is_empty());
        assert!(matches!(registry.delete_job(&id), Err(Error::InvalidState(_))));

        registry.finish_packaging(id, Ok(None)).unwrap();
        assert!(registry.list_expired(Utc::now()).is_empty());
        assert_eq!(registry.list_expired(far), vec![id]);

        let area = registry.expire_job(&id, far).unwrap();
        assert_eq!(area.root(), PathBuf::from("/tmp/areas/a"));
        assert!(registry.get_job(&id).is_none());
        assert_eq!(registry.update_task_status(id, 0, ok(0)), UpdateOutcome::Stale);
        assert!(registry.delete_job(&id).unwrap().is_none());
    }

    #[test]
    fn test_mark_running_skips_non_pending() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let id = registry.create_job(area("a"), tasks(1));
        assert!(registry.mark_running(id, 0).is_some());
        assert!(registry.mark_running(id, 0).is_none());
        assert!(registry.mark_running(id, 5).is_none());
        assert!(registry.mark_running(Uuid::new_v4(), 0).is_none());
    }

    #[test]
    fn test_stats() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let a = registry.create_job(area("a"), tasks(1));
        registry.create_job(area("b"), tasks(1));
        registry.mark_running(a, 0).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(registry.active_jobs(), 2);
    }
}
