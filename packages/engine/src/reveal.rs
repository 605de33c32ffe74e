//! Single-element reveal: the placeholder-to-real attribute swap
//!
//! Revealing an element copies `data-src` into `src` (which starts the fetch)
//! and `data-srcset` into `srcset`. Before `src` is assigned, a one-time
//! *marker* handler is registered so a load that resolves immediately is not
//! missed. When that handler fires, the marker class is removed from the
//! element (simple shape) or from its container (composite shape).
//!
//! | Shape       | Listener on                           | Marker cleared on |
//! |-------------|---------------------------------------|-------------------|
//! | `img`       | the element, if it has `data-src`     | the element       |
//! | `picture`   | each `source`/`img` child with `data-src` | the container |
//!
//! Elements without placeholders are left untouched; unrecognized tags are a
//! no-op.

use crate::config;
use crate::dom::Dom;
use crate::error::Result;
use crate::types::{ElementShape, NodeId};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// Outcome of revealing one element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reveal {
    /// The element passed in
    pub element: NodeId,
    /// Its shape
    pub shape: ElementShape,
    /// Nodes whose `src` was assigned, in child order. These are the nodes
    /// whose load signal completes the reveal.
    pub load_targets: Vec<NodeId>,
}

impl Reveal {
    /// Check if the reveal started at least one fetch.
    pub fn started_fetch(&self) -> bool {
        !self.load_targets.is_empty()
    }
}

/// One-time load handlers registered by a loader.
///
/// Two roles exist: the *marker* handler (clears the marker class) and the
/// *advance* handler (moves the sequential walk forward). A node holds at
/// most one handler per role; every registration is mirrored on the backend
/// with [`Dom::listen_load`].
#[derive(Debug, Default)]
pub(crate) struct LoadListeners {
    /// Node -> element whose marker class the handler clears
    marker: HashMap<NodeId, NodeId>,
    advance: BTreeSet<NodeId>,
}

impl LoadListeners {
    pub(crate) fn add_marker<D: Dom>(
        &mut self,
        dom: &mut D,
        node: NodeId,
        marked: NodeId,
    ) -> Result<()> {
        if !self.marker.contains_key(&node) {
            dom.listen_load(node)?;
            self.marker.insert(node, marked);
        }
        Ok(())
    }

    /// Remove the marker handler of `node`, returning the element to unmark.
    pub(crate) fn take_marker<D: Dom>(&mut self, dom: &mut D, node: NodeId) -> Option<NodeId> {
        let marked = self.marker.remove(&node)?;
        dom.unlisten_load(node);
        Some(marked)
    }

    pub(crate) fn add_advance<D: Dom>(&mut self, dom: &mut D, node: NodeId) -> Result<()> {
        if !self.advance.contains(&node) {
            dom.listen_load(node)?;
            self.advance.insert(node);
        }
        Ok(())
    }

    pub(crate) fn is_advance(&self, node: NodeId) -> bool {
        self.advance.contains(&node)
    }

    /// Detach every advance handler; returns how many were detached.
    pub(crate) fn clear_advance<D: Dom>(&mut self, dom: &mut D) -> usize {
        let detached = std::mem::take(&mut self.advance);
        for node in &detached {
            dom.unlisten_load(*node);
        }
        detached.len()
    }

    /// Every node a handler is registered on or clears the marker of.
    pub(crate) fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.marker
            .iter()
            .flat_map(|(node, marked)| [*node, *marked])
            .chain(self.advance.iter().copied())
    }

    pub(crate) fn marker_count(&self) -> usize {
        self.marker.len()
    }

    pub(crate) fn advance_count(&self) -> usize {
        self.advance.len()
    }
}

/// Reveal one element of either shape.
pub(crate) fn reveal_element<D: Dom>(
    dom: &mut D,
    listeners: &mut LoadListeners,
    element: NodeId,
) -> Result<Reveal> {
    let shape = dom
        .tag_name(element)
        .map(|tag| ElementShape::from_tag(&tag))
        .unwrap_or(ElementShape::Unrecognized);

    let mut load_targets = Vec::new();
    match shape {
        ElementShape::Simple => {
            if swap_source(dom, listeners, element, element)? {
                load_targets.push(element);
            }
            swap(dom, element, config::DATA_SRCSET, config::SRCSET)?;
        }
        ElementShape::Composite => {
            for child in dom.element_children(element) {
                let qualifies = dom
                    .tag_name(child)
                    .is_some_and(|tag| ElementShape::is_composite_child(&tag));
                if !qualifies {
                    continue;
                }
                if swap_source(dom, listeners, child, element)? {
                    load_targets.push(child);
                }
                swap(dom, child, config::DATA_SRCSET, config::SRCSET)?;
            }
        }
        ElementShape::Unrecognized => {
            tracing::trace!(element = %element, "Skipping unrecognized element");
        }
    }

    Ok(Reveal {
        element,
        shape,
        load_targets,
    })
}

/// Register the marker handler on `node`, then assign `src` from `data-src`.
/// Returns `false` (and registers nothing) when `data-src` is absent.
fn swap_source<D: Dom>(
    dom: &mut D,
    listeners: &mut LoadListeners,
    node: NodeId,
    marked: NodeId,
) -> Result<bool> {
    let Some(source) = dom.attribute(node, config::DATA_SRC) else {
        return Ok(false);
    };
    listeners.add_marker(dom, node, marked)?;
    dom.set_attribute(node, config::SRC, &source)?;
    Ok(true)
}

fn swap<D: Dom>(dom: &mut D, node: NodeId, from: &str, to: &str) -> Result<bool> {
    match dom.attribute(node, from) {
        Some(value) => {
            dom.set_attribute(node, to, &value)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Run the marker handler for `node`, if one is registered.
///
/// Returns the element whose marker class was removed.
pub(crate) fn clear_marker<D: Dom>(
    dom: &mut D,
    listeners: &mut LoadListeners,
    node: NodeId,
) -> Result<Option<NodeId>> {
    let Some(marked) = listeners.take_marker(dom, node) else {
        return Ok(None);
    };
    dom.remove_class(marked, config::MARKER_CLASS)?;
    Ok(Some(marked))
}
