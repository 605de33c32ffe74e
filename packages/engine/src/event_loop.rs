//! Event loop for passes over the in-memory document
//!
//! In a browser the network completes fetches and the event loop delivers
//! `load` events. [`EventLoop`] plays both parts for a [`Document`]: it
//! completes in-flight fetches oldest first, fails the ones whose URL it was
//! told to fail, and delivers each load signal to the loader.
//!
//! Once no fetch is left in flight the pass either finished or stalled on an
//! element whose load signal will never come. The loader's [`StallPolicy`]
//! decides what happens next.

use crate::config::{self, StallPolicy};
use crate::dom::{Document, Dom};
use crate::error::Result;
use crate::loader::LazyLoader;
use crate::types::NodeId;
use serde::Serialize;
use std::collections::HashSet;

/// How a run of the event loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Settled {
    /// Nothing in flight and no pass waiting
    Idle,
    /// Nothing in flight, but the pass waits for a load that will never come
    Stalled { cursor: usize, element: NodeId },
}

/// What happened to one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Completed; the load signal was delivered
    Loaded { node: NodeId, handled: bool },
    /// Failed; no load signal
    Failed { node: NodeId },
}

/// Drives fetch completion and load delivery for an in-memory document.
#[derive(Debug, Clone, Default)]
pub struct EventLoop {
    failing: HashSet<String>,
    delivered: usize,
}

impl EventLoop {
    /// Create an event loop where every fetch succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make fetches of `url` fail.
    pub fn fail_url(mut self, url: impl Into<String>) -> Self {
        self.failing.insert(url.into());
        self
    }

    /// Number of load signals delivered so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Settle the oldest in-flight fetch.
    ///
    /// Returns `None` when nothing is in flight.
    pub fn step(
        &mut self,
        doc: &mut Document,
        loader: &mut LazyLoader<Document>,
    ) -> Result<Option<Delivery>> {
        let Some(node) = doc.next_in_flight() else {
            return Ok(None);
        };
        let failing = doc
            .attribute(node, config::SRC)
            .is_some_and(|url| self.failing.contains(&url));
        if failing {
            doc.fail_load(node);
            tracing::warn!(node = %node, "Fetch failed, no load signal");
            return Ok(Some(Delivery::Failed { node }));
        }
        doc.complete_load(node);
        self.delivered += 1;
        let handled = loader.dispatch_load(doc, node)?;
        Ok(Some(Delivery::Loaded { node, handled }))
    }

    /// Run until nothing is in flight, applying the loader's stall policy.
    pub fn run(
        &mut self,
        doc: &mut Document,
        loader: &mut LazyLoader<Document>,
    ) -> Result<Settled> {
        loop {
            while self.step(doc, loader)?.is_some() {}

            let (Some(cursor), Some(element)) = (loader.state().cursor(), loader.current_element())
            else {
                return Ok(Settled::Idle);
            };
            match loader.stall_policy() {
                StallPolicy::Wait => {
                    tracing::warn!(index = cursor, element = %element, "Reveal stalled");
                    return Ok(Settled::Stalled { cursor, element });
                }
                StallPolicy::Skip => {
                    loader.skip_stalled(doc)?;
                }
            }
        }
    }
}
