//! Core types for the LazyImage engine

use crate::config;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle to a node owned by a [`Dom`](crate::dom::Dom) backend.
///
/// Handles are only meaningful for the backend that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    /// Create a handle from a raw arena index.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Raw arena index of this handle.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shape of a revealable element, derived purely from its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementShape {
    /// A single media element (`img`) carrying its own placeholders
    Simple,
    /// A container (`picture`) whose direct children carry placeholders
    Composite,
    /// Anything else; never touched by a reveal
    Unrecognized,
}

impl ElementShape {
    /// Classify a tag name. Comparison is ASCII case-insensitive, so both
    /// `IMG` (browser `tagName`) and `img` (markup) are recognized.
    pub fn from_tag(tag: &str) -> Self {
        if tag.eq_ignore_ascii_case(config::SIMPLE_TAG) {
            ElementShape::Simple
        } else if tag.eq_ignore_ascii_case(config::COMPOSITE_TAG) {
            ElementShape::Composite
        } else {
            ElementShape::Unrecognized
        }
    }

    /// Whether a direct child with this tag may carry placeholders inside a
    /// composite container.
    pub fn is_composite_child(tag: &str) -> bool {
        config::COMPOSITE_CHILD_TAGS
            .iter()
            .any(|t| tag.eq_ignore_ascii_case(t))
    }
}

/// State of the sequential walk.
///
/// A pass moves `Idle -> Advancing { cursor: 0 } -> ... -> Idle`; the only
/// transition out of `Advancing { cursor }` is the load signal of the element
/// at `cursor` (or an explicit skip).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RevealState {
    /// No pass in flight
    #[default]
    Idle,
    /// Waiting for the load signal of the element at `cursor`
    Advancing { cursor: usize },
}

impl RevealState {
    /// Cursor of the element currently awaited, if any.
    pub fn cursor(&self) -> Option<usize> {
        match self {
            RevealState::Idle => None,
            RevealState::Advancing { cursor } => Some(*cursor),
        }
    }

    /// Check if no pass is in flight
    pub fn is_idle(&self) -> bool {
        matches!(self, RevealState::Idle)
    }
}
