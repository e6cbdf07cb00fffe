//! Error types emitted by the attention module.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The configuration is missing values or combines incompatible options.
    #[error("invalid attention configuration: {0}")]
    InvalidConfig(String),
    /// A configuration document could not be parsed.
    #[error("failed to parse attention config: {0}")]
    ConfigFormat(String),
    /// A configuration file could not be read.
    #[error("failed to read attention config: {0}")]
    Io(#[from] std::io::Error),
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// The call requested something the selected attention path cannot provide.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),
    /// A zero-length sequence reached a path that needs at least one position.
    #[error("sequence dimension of {context} is empty")]
    EmptySequence { context: &'static str },
    /// A backend failure propagated from Candle.
    #[error("backend error: {0}")]
    Backend(#[from] candle_core::Error),
}

/// Convenience alias used throughout the crate.
pub type AttentionResult<T> = Result<T, AttentionError>;

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}
