//! image-batch: batch image conversion with bounded concurrent processing
//!
//! Uploaded images become a tracked job with one task per file. Tasks share a
//! global pool of conversion slots, every outcome is recorded in a single job
//! registry, and once the last task of a job finishes the successful outputs
//! are packaged into a zip archive for download.

pub mod config;
pub mod conversion;
pub mod error;
pub mod pipeline;
pub mod processing;
pub mod server;
pub mod storage;
pub mod types;

pub use config::BatchConfig;
pub use conversion::{ConversionError, Converter, ImageConverter};
pub use error::{Error, Result};
pub use pipeline::{ArchiveLookup, Pipeline, SourceFile, SweepReport};
pub use types::{
    ConversionOptions, FailureKind, Job, JobId, JobStatus, JobStatusView, OutputFormat,
    ResizeFit, TaskStatus,
};
