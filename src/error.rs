//! Error taxonomy shared by every pipeline stage.

use std::path::Path;

use thiserror::Error;

/// Convenience alias used across the library.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Failures raised by the pipeline components.
///
/// Components never catch these themselves; the driver decides whether a failure costs the
/// current chunk only or the whole run (see [`PipelineError::is_chunk_local`]).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The row source could not be opened or reached.
    #[error("row source unavailable ({source_name}): {reason}")]
    SourceUnavailable {
        /// Human-readable name of the source (path or redacted URL).
        source_name: String,
        /// Underlying failure.
        reason: String,
    },
    /// A row could not be read or decoded after the source was opened.
    #[error("failed to read row {row} from source: {reason}")]
    Source {
        /// One-based position of the row in the stream.
        row: u64,
        /// Underlying failure.
        reason: String,
    },
    /// Invalid configuration, detected before any processing starts.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A unit's text or metadata does not have the expected shape.
    #[error("malformed unit for page `{page_id}`: {reason}")]
    MalformedUnit {
        /// Correlation key of the offending unit (may be empty when unknown).
        page_id: String,
        /// What was wrong with it.
        reason: String,
    },
    /// The entity model could not be loaded; raised before any chunk is processed.
    #[error("failed to load entity model from {location}: {reason}")]
    ModelLoad {
        /// Model location as given in the configuration.
        location: String,
        /// Underlying failure.
        reason: String,
    },
    /// The entity model failed or returned output that breaks its contract.
    #[error("entity model failed: {0}")]
    Model(String),
    /// A worker thread stopped answering.
    #[error("inference worker pool failure: {0}")]
    WorkerPool(String),
    /// Writing the output destination failed partway.
    #[error("failed to write {destination}: {reason}")]
    SinkWrite {
        /// Destination name (path or object URL).
        destination: String,
        /// Underlying failure.
        reason: String,
    },
}

impl PipelineError {
    /// Returns true when the failure only invalidates the chunk being processed.
    pub fn is_chunk_local(&self) -> bool {
        !matches!(
            self,
            PipelineError::SourceUnavailable { .. }
                | PipelineError::Configuration(_)
                | PipelineError::ModelLoad { .. }
        )
    }

    /// Shorthand for [`PipelineError::Configuration`].
    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Configuration(message.into())
    }

    /// Shorthand for [`PipelineError::MalformedUnit`].
    pub fn malformed(page_id: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::MalformedUnit {
            page_id: page_id.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unavailable(source_name: impl Into<String>, reason: impl ToString) -> Self {
        PipelineError::SourceUnavailable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn model_load(location: impl Into<String>, reason: impl ToString) -> Self {
        PipelineError::ModelLoad {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn sink(destination: impl Into<String>, reason: impl ToString) -> Self {
        PipelineError::SinkWrite {
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn file_unavailable(path: &Path, err: std::io::Error) -> Self {
        Self::unavailable(path.display().to_string(), err)
    }
}
