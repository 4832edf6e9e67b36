//! Core types for the batch pipeline

pub mod job;
pub mod options;

pub use job::{
    ErrorSummary, FailedTaskEntry, FailureKind, Job, JobId, JobStatus, JobStatusView, Task,
    TaskCounts, TaskFailure, TaskId, TaskOutcome, TaskStatus, TaskStatusView,
};
pub use options::{ConversionOptions, OptionsRequest, OutputFormat, ResizeFit};
