//! Error types for the LazyImage engine

use crate::types::NodeId;
use thiserror::Error;

/// Main error type for reveal operations
#[derive(Error, Debug)]
pub enum RevealError {
    /// Selector is empty, too long, or cannot be parsed
    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    /// Markup could not be parsed into a document
    #[error("Markup parse error: {0}")]
    MarkupError(#[from] roxmltree::Error),

    /// Markup exceeds the accepted size
    #[error("Markup exceeds maximum size ({size} > {max} bytes)")]
    MarkupTooLarge { size: usize, max: usize },

    /// Node handle does not belong to the document
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// Operation requires an element but the node is text
    #[error("Node {0} is not an element")]
    NotAnElement(NodeId),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Exception raised by the host DOM (browser)
    #[error("Host DOM error: {0}")]
    Host(String),
}

impl RevealError {
    /// Build an `InvalidSelector` error.
    pub fn invalid_selector(selector: &str, reason: impl Into<String>) -> Self {
        RevealError::InvalidSelector {
            selector: selector.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for reveal operations
pub type Result<T> = std::result::Result<T, RevealError>;
