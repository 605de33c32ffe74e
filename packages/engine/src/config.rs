//! Configuration for the LazyImage engine
//!
//! Two kinds of configuration live here:
//! - Compile-time constants: the DOM attribute contract (placeholder and real
//!   attribute names, marker class, recognized tags) and input limits.
//! - Runtime options: [`LoaderOptions`], the explicit replacement for a
//!   variadic constructor, and the [`StallPolicy`] of a sequential pass.

use crate::error::{RevealError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker class denoting an element that has not been revealed yet.
pub const MARKER_CLASS: &str = "lazy-image";

/// Selector used when the caller supplies none.
pub const DEFAULT_SELECTOR: &str = ".lazy-image";

/// Placeholder attribute holding the real source URL.
pub const DATA_SRC: &str = "data-src";

/// Real source attribute; assigning it starts the fetch.
pub const SRC: &str = "src";

/// Placeholder attribute holding the real source set.
pub const DATA_SRCSET: &str = "data-srcset";

/// Real source-set attribute.
pub const SRCSET: &str = "srcset";

/// Tag of the simple (single media element) shape.
pub const SIMPLE_TAG: &str = "img";

/// Tag of the composite (responsive source group) shape.
pub const COMPOSITE_TAG: &str = "picture";

/// Tags of the direct children of a composite container that may carry
/// placeholders.
pub const COMPOSITE_CHILD_TAGS: &[&str] = &["source", "img"];

/// Global property name under which the browser factory is installed.
pub const GLOBAL_FACTORY_NAME: &str = "lazyImage";

/// Maximum selector length in bytes.
///
/// Selectors are written by page authors; anything longer is almost
/// certainly generated garbage.
pub const MAX_SELECTOR_LENGTH: usize = 1_024;

/// Maximum number of compound selectors in one complex selector
/// (`a > b c` has three).
pub const MAX_SELECTOR_DEPTH: usize = 32;

/// Maximum markup size in bytes accepted by the in-memory document (4 MB).
pub const MAX_MARKUP_SIZE: usize = 4_000_000;

/// Callback invoked once at construction with the new loader.
pub type InitCallback<D> = Box<dyn FnOnce(&mut crate::loader::LazyLoader<D>)>;

/// What a sequential pass does when the awaited load signal never arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallPolicy {
    /// Stay on the stalled element until `refresh` (browser behavior)
    #[default]
    Wait,
    /// Step past the stalled element once the host reports it stalled
    Skip,
}

/// Construction options for a [`LazyLoader`](crate::loader::LazyLoader).
///
/// Builder calls may be made in any order; the resulting loader is the same.
///
/// # Example
///
/// ```ignore
/// use lazyimage_engine::{LoaderOptions, LazyLoader};
///
/// let options = LoaderOptions::new()
///     .with_selector("img.lazy-image")
///     .with_init(|loader| tracing::info!(selector = loader.selector(), "ready"));
/// let loader = LazyLoader::new(&mut document, options)?;
/// ```
pub struct LoaderOptions<D> {
    /// Selector to snapshot; `None` means [`DEFAULT_SELECTOR`]
    pub selector: Option<String>,
    /// Callback invoked once at construction
    pub on_init: Option<InitCallback<D>>,
    /// Behavior when a load signal never arrives
    pub stall_policy: StallPolicy,
}

impl<D> Default for LoaderOptions<D> {
    fn default() -> Self {
        Self {
            selector: None,
            on_init: None,
            stall_policy: StallPolicy::default(),
        }
    }
}

impl<D> fmt::Debug for LoaderOptions<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderOptions")
            .field("selector", &self.selector)
            .field("on_init", &self.on_init.is_some())
            .field("stall_policy", &self.stall_policy)
            .finish()
    }
}

impl<D> LoaderOptions<D> {
    /// Create options with every field at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the selector.
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Set the construction callback.
    pub fn with_init(
        mut self,
        on_init: impl FnOnce(&mut crate::loader::LazyLoader<D>) + 'static,
    ) -> Self {
        self.on_init = Some(Box::new(on_init));
        self
    }

    /// Set the stall policy.
    pub fn with_stall_policy(mut self, policy: StallPolicy) -> Self {
        self.stall_policy = policy;
        self
    }

    /// Resolve and validate the selector.
    ///
    /// Syntax is checked later by the DOM backend; this only rejects values
    /// no backend could accept.
    pub fn resolved_selector(&self) -> Result<String> {
        let selector = self.selector.as_deref().unwrap_or(DEFAULT_SELECTOR);
        if selector.trim().is_empty() {
            return Err(RevealError::invalid_selector(selector, "selector is empty"));
        }
        if selector.len() > MAX_SELECTOR_LENGTH {
            let prefix: String = selector.chars().take(64).collect();
            return Err(RevealError::invalid_selector(
                &prefix,
                format!("selector exceeds {MAX_SELECTOR_LENGTH} bytes"),
            ));
        }
        Ok(selector.to_string())
    }
}
