//! LazyImage Engine
//!
//! Deferred, sequential loading of full-resolution images.
//! This library provides functionality for:
//! - Selecting placeholder elements (`.lazy-image` by default) into a snapshot
//! - Swapping `data-src` / `data-srcset` for `src` / `srcset`, per element
//! - Revealing the snapshot one element at a time, chained on load signals
//!
//! The engine is written against the [`Dom`] trait. [`Document`] is an
//! in-memory implementation (parsed from markup, with simulated fetches);
//! the `wasm` feature adds a browser implementation.
//!
//! # Example
//!
//! ```ignore
//! use lazyimage_engine::{Document, EventLoop, LazyLoader, LoaderOptions, Settled};
//!
//! let mut doc = Document::parse(r#"<body>
//!     <img class="lazy-image" src="a-thumb.png" data-src="a.png"/>
//!     <img class="lazy-image" src="b-thumb.png" data-src="b.png"/>
//! </body>"#)?;
//!
//! let mut loader = LazyLoader::new(&mut doc, LoaderOptions::new())?;
//! loader.start(&mut doc, None)?;
//!
//! let settled = EventLoop::new().run(&mut doc, &mut loader)?;
//! assert_eq!(settled, Settled::Idle);
//! ```

pub mod config;
pub mod dom;
pub mod error;
pub mod event_loop;
pub mod loader;
pub mod reveal;
pub mod selector;
pub mod trace;
pub mod types;

#[cfg(feature = "wasm")]
pub mod wasm;

// Re-export commonly used items
pub use config::{LoaderOptions, StallPolicy};
pub use dom::{Document, Dom, NodeSlots};
pub use error::{Result, RevealError};
pub use event_loop::{Delivery, EventLoop, Settled};
pub use loader::{DeferredElements, ElementCallback, LazyLoader};
pub use reveal::Reveal;
pub use selector::SelectorList;
pub use trace::{RevealEvent, RevealTrace};
pub use types::{ElementShape, NodeId, RevealState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
