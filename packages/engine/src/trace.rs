//! Reveal tracing for debugging and test assertions
//!
//! Every loader records what it did as an ordered list of [`RevealEvent`]s.
//! The trace answers the questions that matter when a page "stops loading
//! images": which elements were initiated, in what order, which load signals
//! arrived, and where a pass stalled or was skipped.
//!
//! # Example
//!
//! ```ignore
//! loader.start(&mut doc, None)?;
//! EventLoop::new().run(&mut doc, &mut loader)?;
//! println!("{}", loader.trace().render());
//! ```
//!
//! Produces output like:
//!
//! ```text
//! snapshot .lazy-image (2 elements)
//! start (2 elements)
//! +-- [0] #2 simple initiated
//! |   `-- #2 loaded, marker cleared on #2
//! +-- [1] #3 composite initiated
//! |   `-- #4 loaded, marker cleared on #3
//! `-- complete (2 revealed)
//! ```

use crate::types::{ElementShape, NodeId};
use serde::Serialize;
use std::fmt::Write;

/// A single step of a loader's life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RevealEvent {
    /// Elements were (re)selected
    Snapshot { selector: String, count: usize },
    /// A sequential pass began
    Started { count: usize },
    /// The reveal of the element at `index` was initiated
    Initiated {
        index: usize,
        element: NodeId,
        shape: ElementShape,
    },
    /// The element at `index` started no fetch and was stepped over
    SteppedOver { index: usize, element: NodeId },
    /// The awaited load signal of the element at `index` arrived on `node`
    Loaded { index: usize, node: NodeId },
    /// A marker handler removed the marker class from `element`
    MarkerCleared { node: NodeId, element: NodeId },
    /// The stalled element at `index` was skipped
    Skipped { index: usize, element: NodeId },
    /// The pass walked off the end of the snapshot
    Completed { revealed: usize },
}

/// Ordered journal of [`RevealEvent`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RevealTrace {
    events: Vec<RevealEvent>,
}

impl RevealTrace {
    /// Create an empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn record(&mut self, event: RevealEvent) {
        self.events.push(event);
    }

    /// Drop every recorded event.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// All events, oldest first.
    pub fn events(&self) -> &[RevealEvent] {
        &self.events
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Elements in the order their reveal was initiated.
    pub fn initiated(&self) -> Vec<NodeId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                RevealEvent::Initiated { element, .. } => Some(*element),
                _ => None,
            })
            .collect()
    }

    /// Render the trace as a human-readable tree.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut pending_marker: Vec<(NodeId, NodeId)> = Vec::new();
        for (position, event) in self.events.iter().enumerate() {
            let last_in_pass = self.events[position + 1..].iter().all(|e| {
                matches!(
                    e,
                    RevealEvent::MarkerCleared { .. } | RevealEvent::Loaded { .. }
                )
            });
            let branch = if last_in_pass { "`--" } else { "+--" };
            // Writing to a String cannot fail.
            let _ = match event {
                RevealEvent::Snapshot { selector, count } => {
                    writeln!(out, "snapshot {selector} ({count} elements)")
                }
                RevealEvent::Started { count } => writeln!(out, "start ({count} elements)"),
                RevealEvent::Initiated {
                    index,
                    element,
                    shape,
                } => writeln!(
                    out,
                    "{branch} [{index}] {element} {} initiated",
                    shape_name(*shape)
                ),
                RevealEvent::SteppedOver { index, element } => {
                    writeln!(out, "{branch} [{index}] {element} stepped over (no fetch)")
                }
                RevealEvent::MarkerCleared { node, element } => {
                    pending_marker.push((*node, *element));
                    Ok(())
                }
                RevealEvent::Loaded { node, .. } => {
                    let cleared = pending_marker
                        .iter()
                        .find(|(n, _)| n == node)
                        .map(|(_, element)| format!(", marker cleared on {element}"))
                        .unwrap_or_default();
                    pending_marker.clear();
                    writeln!(out, "|   `-- {node} loaded{cleared}")
                }
                RevealEvent::Skipped { index, element } => {
                    writeln!(out, "{branch} [{index}] {element} skipped (stalled)")
                }
                RevealEvent::Completed { revealed } => {
                    writeln!(out, "{branch} complete ({revealed} revealed)")
                }
            };
        }
        out
    }
}

fn shape_name(shape: ElementShape) -> &'static str {
    match shape {
        ElementShape::Simple => "simple",
        ElementShape::Composite => "composite",
        ElementShape::Unrecognized => "unrecognized",
    }
}
