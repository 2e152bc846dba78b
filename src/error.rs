// ⚠️ Error Taxonomy
// Validation, not-found, chain invariant and I/O failures stay distinct so
// callers can render an actionable message for each.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

// ============================================================================
// CHAIN INVARIANTS
// ============================================================================

/// Misuse of the version chain API (one child per version).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainViolation {
    #[error("version {parent} already has a sub-version ({existing_child}); each version can only have one sub-version")]
    AlreadyHasChild {
        parent: String,
        existing_child: String,
    },

    #[error("version {version} has {children} children; cannot keep the chain linear")]
    MultipleChildren { version: String, children: usize },
}

// ============================================================================
// PIPELINE ERROR
// ============================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed input, rejected before any file is touched
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Chain(#[from] ChainViolation),

    /// Calculated column would be numeric while the rule set asks for a boolean
    #[error(
        "invalid rule configuration for column '{column}': mathematical operations produce numeric \
         values but a boolean output is expected; add a condition (e.g. greater than, equal to) \
         to turn the numeric result into a boolean"
    )]
    BooleanExpected { column: String },

    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV failure on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("metadata store failure: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        PipelineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors raised before any mutation happened
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Validation(_)
                | PipelineError::NotFound { .. }
                | PipelineError::BooleanExpected { .. }
        )
    }
}
