//! Job and task records owned by the registry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::ConversionOptions;
use crate::storage::WorkingArea;

/// External handle for a batch job
pub type JobId = Uuid;

/// Task identifier, unique within its job (upload index)
pub type TaskId = usize;

/// Aggregate status of a job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    PartiallyCompleted,
    Failed,
    Expired,
}

impl JobStatus {
    /// No transition leaves a terminal status (except into `Expired`)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyCompleted | Self::Failed | Self::Expired
        )
    }

    /// Derive the job status from its task statuses.
    ///
    /// Depends only on the multiset of statuses, never on their order.
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        let counts = TaskCounts::from_statuses(statuses);

        if counts.total == 0 {
            return Self::Failed;
        }
        if counts.pending + counts.running > 0 {
            return if counts.pending == counts.total {
                Self::Queued
            } else {
                Self::Processing
            };
        }
        if counts.succeeded == counts.total {
            Self::Completed
        } else if counts.succeeded == 0 {
            Self::Failed
        } else {
            Self::PartiallyCompleted
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        })
    }
}

/// Status of a single task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Classification of a task failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FailureKind {
    UnsupportedFormat,
    CorruptInput,
    ResourceExceeded,
    IoFailure,
    /// Unexpected fault outside the converter's typed failures
    Internal,
}

/// Why a task failed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Generic failure recorded for faults the converter did not classify
    pub fn internal() -> Self {
        Self::new(FailureKind::Internal, "unexpected error during conversion")
    }
}

/// Final result of one task dispatch, reported to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded(PathBuf),
    Failed(TaskFailure),
}

/// One file's unit of work within a job
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// File name as uploaded by the client
    pub original_name: String,
    pub source_path: PathBuf,
    pub options: ConversionOptions,
    pub status: TaskStatus,
    pub output_path: Option<PathBuf>,
    pub failure: Option<TaskFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of times this task has been dispatched
    pub attempts: u32,
}

impl Task {
    pub fn new(
        id: TaskId,
        original_name: impl Into<String>,
        source_path: PathBuf,
        options: ConversionOptions,
    ) -> Self {
        Self {
            id,
            original_name: original_name.into(),
            source_path,
            options,
            status: TaskStatus::Pending,
            output_path: None,
            failure: None,
            started_at: None,
            finished_at: None,
            attempts: 0,
        }
    }

    /// Duration of the last dispatch in milliseconds, if it finished
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// Per-status task counts
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        let mut counts = Self::default();
        for status in statuses {
            counts.total += 1;
            match status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn finished(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// A task failure as listed in a job's error summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedTaskEntry {
    pub task_id: TaskId,
    pub file_name: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Aggregate of failures, present only on failed or partially completed jobs
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorSummary {
    /// Job-level reason (timeout, packaging fault)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub failures: Vec<FailedTaskEntry>,
}

/// One batch conversion request
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_location: Option<PathBuf>,
    pub error_summary: Option<ErrorSummary>,
    pub working_area: WorkingArea,
}

impl Job {
    /// New job in `Queued` status; all tasks must be `Pending`
    pub fn new(id: JobId, working_area: WorkingArea, tasks: Vec<Task>) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            tasks,
            created_at: Utc::now(),
            completed_at: None,
            result_location: None,
            error_summary: None,
            working_area,
        }
    }

    pub fn counts(&self) -> TaskCounts {
        TaskCounts::from_statuses(self.tasks.iter().map(|t| t.status))
    }

    pub fn aggregate_status(&self) -> JobStatus {
        JobStatus::aggregate(self.tasks.iter().map(|t| t.status))
    }

    pub fn task_mut(&mut self, task_id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(task_id)
    }

    /// Succeeded tasks in task order
    pub fn succeeded_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Succeeded)
    }

    /// Collect task failures in task order
    pub fn collect_failures(&self) -> Vec<FailedTaskEntry> {
        self.tasks
            .iter()
            .filter_map(|t| {
                t.failure.as_ref().map(|f| FailedTaskEntry {
                    task_id: t.id,
                    file_name: t.original_name.clone(),
                    kind: f.kind,
                    message: f.message.clone(),
                })
            })
            .collect()
    }
}

/// Status of one task as reported to polling clients
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub file_name: String,
    pub status: TaskStatus,
    pub format: super::OutputFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Snapshot returned by status queries
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub total_tasks: usize,
    pub succeeded_tasks: usize,
    pub failed_tasks: usize,
    pub percent_complete: f32,
    pub tasks: Vec<TaskStatusView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<ErrorSummary>,
    /// True once an archive can be downloaded
    pub download_ready: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobStatusView {
    pub fn from_job(job: &Job) -> Self {
        let counts = job.counts();
        let percent_complete = if counts.total == 0 {
            0.0
        } else {
            counts.finished() as f32 / counts.total as f32 * 100.0
        };

        let tasks = job
            .tasks
            .iter()
            .map(|t| TaskStatusView {
                task_id: t.id,
                file_name: t.original_name.clone(),
                status: t.status,
                format: t.options.format,
                error: t.failure.clone(),
                duration_ms: t.duration_ms(),
            })
            .collect();

        Self {
            job_id: job.id,
            status: job.status,
            total_tasks: counts.total,
            succeeded_tasks: counts.succeeded,
            failed_tasks: counts.failed,
            percent_complete,
            tasks,
            error_summary: job.error_summary.clone(),
            download_ready: job.status.is_terminal() && job.result_location.is_some(),
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use TaskStatus::*;

    #[test]
    fn test_aggregate_rules() {
        assert_eq!(JobStatus::aggregate([Pending, Pending]), JobStatus::Queued);
        assert_eq!(JobStatus::aggregate([Running, Pending]), JobStatus::Processing);
        assert_eq!(JobStatus::aggregate([Succeeded, Pending]), JobStatus::Processing);
        assert_eq!(JobStatus::aggregate([Succeeded, Succeeded]), JobStatus::Completed);
        assert_eq!(JobStatus::aggregate([Failed, Failed]), JobStatus::Failed);
        assert_eq!(
            JobStatus::aggregate([Succeeded, Failed, Succeeded]),
            JobStatus::PartiallyCompleted
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::PartiallyCompleted.is_terminal());
        assert!(JobStatus::Expired.is_terminal());
    }

    fn task_status() -> impl Strategy<Value = TaskStatus> {
        prop_oneof![Just(Pending), Just(Running), Just(Succeeded), Just(Failed)]
    }

    proptest! {
        #[test]
        fn aggregate_is_order_independent(
            statuses in proptest::collection::vec(task_status(), 1..24),
            seed in any::<u64>(),
        ) {
            let expected = JobStatus::aggregate(statuses.clone());

            let mut shuffled = statuses.clone();
            // Deterministic Fisher-Yates driven by the seed
            let mut state = seed;
            for i in (1..shuffled.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state >> 33) as usize % (i + 1);
                shuffled.swap(i, j);
            }

            prop_assert_eq!(JobStatus::aggregate(shuffled), expected);
        }

        #[test]
        fn terminal_aggregate_matches_counts(
            statuses in proptest::collection::vec(prop_oneof![Just(Succeeded), Just(Failed)], 1..24),
        ) {
            let succeeded = statuses.iter().filter(|s| **s == Succeeded).count();
            let status = JobStatus::aggregate(statuses.clone());
            let expected = if succeeded == statuses.len() {
                JobStatus::Completed
            } else if succeeded == 0 {
                JobStatus::Failed
            } else {
                JobStatus::PartiallyCompleted
            };
            prop_assert_eq!(status, expected);
        }
    }
}
