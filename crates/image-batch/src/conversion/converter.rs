//! Converter trait and its typed failures

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::{ConversionOptions, FailureKind, TaskFailure};

/// Typed failure from a single conversion
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversionError {
    /// Input or target format cannot be handled
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Input could not be decoded
    #[error("Corrupt input: {0}")]
    CorruptInput(String),

    /// Input exceeds a safety ceiling (dimensions, memory, time)
    #[error("Resource limit exceeded: {0}")]
    ResourceExceeded(String),

    /// Reading the source or writing the output failed
    #[error("I/O failure: {0}")]
    IoFailure(String),
}

impl ConversionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::UnsupportedFormat(_) => FailureKind::UnsupportedFormat,
            Self::CorruptInput(_) => FailureKind::CorruptInput,
            Self::ResourceExceeded(_) => FailureKind::ResourceExceeded,
            Self::IoFailure(_) => FailureKind::IoFailure,
        }
    }
}

impl From<ConversionError> for TaskFailure {
    fn from(err: ConversionError) -> Self {
        TaskFailure::new(err.kind(), err.to_string())
    }
}

impl From<std::io::Error> for ConversionError {
    fn from(err: std::io::Error) -> Self {
        Self::IoFailure(err.to_string())
    }
}

/// Converts one source file into one output file
///
/// Implementations:
/// - `ImageConverter`: decodes and re-encodes with the `image` crate
///
/// A converter has no knowledge of jobs or tasks. It reads exactly one input
/// and writes exactly one file into `output_dir`, returning its path.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(
        &self,
        source: &Path,
        options: &ConversionOptions,
        output_dir: &Path,
    ) -> Result<PathBuf, ConversionError>;

    /// Converter name for logging
    fn name(&self) -> &str;
}

/// Output path for `source` converted to the target format
pub fn output_path_for(source: &Path, options: &ConversionOptions, output_dir: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    output_dir.join(format!("{}.{}", stem, options.format.extension()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OutputFormat;

    #[test]
    fn test_output_path_for() {
        let options = ConversionOptions::new(OutputFormat::Webp);
        let path = output_path_for(Path::new("/in/0001_cat.png"), &options, Path::new("/out"));
        assert_eq!(path, PathBuf::from("/out/0001_cat.webp"));
    }

    #[test]
    fn test_error_into_failure() {
        let failure: TaskFailure = ConversionError::CorruptInput("bad header".into()).into();
        assert_eq!(failure.kind, FailureKind::CorruptInput);
        assert!(failure.message.contains("bad header"));
    }
}
