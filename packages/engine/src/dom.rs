//! DOM abstraction and in-memory document
//!
//! The reveal engine never touches a concrete DOM. It talks to the [`Dom`]
//! trait, which has two implementations:
//!
//! - [`Document`]: an arena-backed in-memory tree, parsed from well-formed
//!   (X)HTML markup. It models the network side of the contract: assigning
//!   `src` on an element starts a fetch, and the host completes (or fails)
//!   fetches explicitly. Used by the `reveal` binary, the event loop and the
//!   tests.
//! - `WebDom` (feature `wasm`): the browser document through `web-sys`.
//!
//! # Load listeners
//!
//! Listener bookkeeping (which handler does what) belongs to the loader. The
//! backend only needs to know that *someone* listens for `load` on a node, so
//! [`Dom::listen_load`] / [`Dom::unlisten_load`] are reference counted.

use crate::config;
use crate::error::{RevealError, Result};
use crate::selector::{SelectorList, SelectorTree};
use crate::types::NodeId;
use std::collections::{HashMap, VecDeque};

/// Operations the reveal engine needs from a document.
pub trait Dom {
    /// Evaluate a selector against the whole document, in document order.
    fn query_selector_all(&mut self, selector: &str) -> Result<Vec<NodeId>>;

    /// Tag name of an element; `None` for unknown or non-element nodes.
    fn tag_name(&self, node: NodeId) -> Option<String>;

    /// Attribute value of an element.
    fn attribute(&self, node: NodeId, name: &str) -> Option<String>;

    /// Set an attribute. Setting `src` starts the element's fetch.
    fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> Result<()>;

    /// Check class list membership.
    fn has_class(&self, node: NodeId, class: &str) -> bool;

    /// Remove a class from the class list; no-op when absent.
    fn remove_class(&mut self, node: NodeId, class: &str) -> Result<()>;

    /// Direct element children, in order.
    fn element_children(&self, node: NodeId) -> Vec<NodeId>;

    /// Register interest in the node's load signal.
    fn listen_load(&mut self, node: NodeId) -> Result<()>;

    /// Drop one registration made with [`Dom::listen_load`].
    fn unlisten_load(&mut self, node: NodeId);
}

// =============================================================================
// Node slots
// =============================================================================

/// Arena of backend-owned node objects addressed by [`NodeId`].
///
/// Released slots are reused, so a handle must not outlive its release.
#[derive(Debug, Clone)]
pub struct NodeSlots<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Default for NodeSlots<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> NodeSlots<T> {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, reusing a released slot when one is available.
    pub fn insert(&mut self, value: T) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(value);
                NodeId::new(index)
            }
            None => {
                self.slots.push(Some(value));
                NodeId::new(self.slots.len() - 1)
            }
        }
    }

    /// The value behind a live handle.
    pub fn get(&self, node: NodeId) -> Option<&T> {
        self.slots.get(node.index())?.as_ref()
    }

    /// Release every slot whose handle `keep` rejects; returns the released
    /// values.
    pub fn retain(&mut self, mut keep: impl FnMut(NodeId) -> bool) -> Vec<T> {
        let mut released = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() || keep(NodeId::new(index)) {
                continue;
            }
            if let Some(value) = slot.take() {
                released.push(value);
                self.free.push(index);
            }
        }
        released
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Check if no value is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// In-memory document
// =============================================================================

#[derive(Debug, Clone)]
enum NodeKind {
    Document,
    Element {
        tag: String,
        attributes: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Arena-backed in-memory document.
///
/// # Example
///
/// ```ignore
/// use lazyimage_engine::dom::{Dom, Document};
///
/// let mut doc = Document::parse(r#"<body><img class="lazy-image" data-src="a.png"/></body>"#)?;
/// let images = doc.query_selector_all(".lazy-image")?;
/// doc.set_attribute(images[0], "src", "a.png")?;
/// assert_eq!(doc.next_in_flight(), Some(images[0]));
/// ```
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<NodeData>,
    /// Elements whose fetch started and has neither completed nor failed
    in_flight: VecDeque<NodeId>,
    /// Elements whose fetch failed; they never fire a load signal
    failed: Vec<NodeId>,
    /// Load listener registrations per node
    listeners: HashMap<NodeId, usize>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Create an empty document (only the document node).
    pub fn new() -> Self {
        Self {
            nodes: vec![NodeData {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
            }],
            in_flight: VecDeque::new(),
            failed: Vec::new(),
            listeners: HashMap::new(),
        }
    }

    /// Parse well-formed markup into a document.
    ///
    /// Markup must be XML-well-formed (`<img/>`, quoted attributes).
    /// Comments and processing instructions are dropped.
    pub fn parse(markup: &str) -> Result<Self> {
        if markup.len() > config::MAX_MARKUP_SIZE {
            return Err(RevealError::MarkupTooLarge {
                size: markup.len(),
                max: config::MAX_MARKUP_SIZE,
            });
        }
        let source = roxmltree::Document::parse(markup)?;
        let mut document = Self::new();
        let root = document.root();
        document.import(source.root_element(), root);
        tracing::debug!(nodes = document.nodes.len(), "Parsed document");
        Ok(document)
    }

    fn import(&mut self, source: roxmltree::Node<'_, '_>, parent: NodeId) {
        let kind = if source.is_element() {
            NodeKind::Element {
                tag: source.tag_name().name().to_string(),
                attributes: source
                    .attributes()
                    .map(|a| (a.name().to_string(), a.value().to_string()))
                    .collect(),
            }
        } else if let Some(text) = source.text().filter(|_| source.is_text()) {
            NodeKind::Text(text.to_string())
        } else {
            return;
        };
        let id = self.push(kind);
        self.attach(parent, id);
        for child in source.children() {
            self.import(child, id);
        }
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(NodeData {
            kind,
            parent: None,
            children: Vec::new(),
        });
        NodeId::new(self.nodes.len() - 1)
    }

    fn attach(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[child.index()].parent = Some(parent);
        self.nodes[parent.index()].children.push(child);
    }

    fn data(&self, node: NodeId) -> Result<&NodeData> {
        self.nodes
            .get(node.index())
            .ok_or(RevealError::UnknownNode(node))
    }

    fn attributes_mut(&mut self, node: NodeId) -> Result<&mut Vec<(String, String)>> {
        match self.nodes.get_mut(node.index()) {
            Some(NodeData {
                kind: NodeKind::Element { attributes, .. },
                ..
            }) => Ok(attributes),
            Some(_) => Err(RevealError::NotAnElement(node)),
            None => Err(RevealError::UnknownNode(node)),
        }
    }

    /// The document node.
    pub fn root(&self) -> NodeId {
        NodeId::new(0)
    }

    /// The first element under the document node.
    pub fn document_element(&self) -> Option<NodeId> {
        self.nodes[0]
            .children
            .iter()
            .copied()
            .find(|c| self.tag(*c).is_some())
    }

    /// Create a detached element.
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(NodeKind::Element {
            tag: tag.to_string(),
            attributes: Vec::new(),
        })
    }

    /// Create a detached text node.
    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeKind::Text(text.to_string()))
    }

    /// Append `child` to `parent`, detaching it from its current parent first.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if matches!(self.data(parent)?.kind, NodeKind::Text(_)) {
            return Err(RevealError::NotAnElement(parent));
        }
        self.data(child)?;
        if child == parent || self.ancestors(parent).any(|a| a == child) {
            return Err(RevealError::Host(format!(
                "cannot append {child} inside its own subtree"
            )));
        }
        self.detach(child);
        self.attach(parent, child);
        Ok(())
    }

    /// Remove a node (and its subtree) from the tree.
    ///
    /// Fetches in flight inside the subtree are abandoned, so their load
    /// signals never fire.
    pub fn remove(&mut self, node: NodeId) -> Result<()> {
        self.data(node)?;
        self.detach(node);
        let subtree: Vec<NodeId> = std::iter::once(node).chain(self.descendants(node)).collect();
        self.in_flight.retain(|n| !subtree.contains(n));
        Ok(())
    }

    fn detach(&mut self, node: NodeId) {
        if let Some(parent) = self.nodes[node.index()].parent.take() {
            self.nodes[parent.index()].children.retain(|c| *c != node);
        }
    }

    /// Parent element, if the node is attached under one.
    pub fn parent_element(&self, node: NodeId) -> Option<NodeId> {
        self.parent_of(node)
    }

    /// Ancestors of a node, nearest first (including the document node).
    pub fn ancestors(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.nodes.get(node.index()).and_then(|d| d.parent), |n| {
            self.nodes[n.index()].parent
        })
    }

    /// Descendants of a node in document (pre-)order, excluding the node.
    pub fn descendants(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let mut stack: Vec<NodeId> = self
            .nodes
            .get(node.index())
            .map(|d| d.children.iter().rev().copied().collect())
            .unwrap_or_default();
        std::iter::from_fn(move || {
            let next = stack.pop()?;
            stack.extend(self.nodes[next.index()].children.iter().rev().copied());
            Some(next)
        })
    }

    /// Check if a node is attached to the document.
    pub fn is_connected(&self, node: NodeId) -> bool {
        node == self.root() || self.ancestors(node).any(|a| a == self.root())
    }

    /// First element with the given `id` attribute.
    pub fn get_element_by_id(&self, id: &str) -> Option<NodeId> {
        self.descendants(self.root())
            .find(|n| self.attr(*n, "id") == Some(id))
    }

    /// Oldest fetch still in flight.
    pub fn next_in_flight(&self) -> Option<NodeId> {
        self.in_flight.front().copied()
    }

    /// All fetches in flight, oldest first.
    pub fn in_flight(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.in_flight.iter().copied()
    }

    /// Check if the node's fetch is in flight.
    pub fn is_in_flight(&self, node: NodeId) -> bool {
        self.in_flight.contains(&node)
    }

    /// Finish the node's fetch successfully.
    ///
    /// Returns `false` when no fetch was in flight. The caller delivers the
    /// resulting load signal to whoever listens (see [`EventLoop`]).
    ///
    /// [`EventLoop`]: crate::event_loop::EventLoop
    pub fn complete_load(&mut self, node: NodeId) -> bool {
        self.take_in_flight(node)
    }

    /// Fail the node's fetch; its load signal will never fire.
    pub fn fail_load(&mut self, node: NodeId) -> bool {
        let was_in_flight = self.take_in_flight(node);
        if was_in_flight {
            self.failed.push(node);
        }
        was_in_flight
    }

    fn take_in_flight(&mut self, node: NodeId) -> bool {
        match self.in_flight.iter().position(|n| *n == node) {
            Some(index) => {
                self.in_flight.remove(index);
                true
            }
            None => false,
        }
    }

    /// Elements whose fetch failed, in failure order.
    pub fn failed(&self) -> &[NodeId] {
        &self.failed
    }

    /// Number of load listener registrations on a node.
    pub fn load_listener_count(&self, node: NodeId) -> usize {
        self.listeners.get(&node).copied().unwrap_or(0)
    }

    /// Total load listener registrations in the document.
    pub fn total_load_listeners(&self) -> usize {
        self.listeners.values().sum()
    }

    /// Serialize the document back to markup.
    pub fn to_markup(&self) -> String {
        let mut out = String::new();
        for child in &self.nodes[0].children {
            self.write_node(*child, &mut out);
        }
        out
    }

    fn write_node(&self, node: NodeId, out: &mut String) {
        let data = &self.nodes[node.index()];
        match &data.kind {
            NodeKind::Document => {}
            NodeKind::Text(text) => out.push_str(&escape(text, false)),
            NodeKind::Element { tag, attributes } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attributes {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&escape(value, true));
                    out.push('"');
                }
                if data.children.is_empty() {
                    out.push_str("/>");
                    return;
                }
                out.push('>');
                for child in &data.children {
                    self.write_node(*child, out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }
}

fn escape(value: &str, attribute: bool) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' if attribute => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

impl SelectorTree for Document {
    fn tag(&self, node: NodeId) -> Option<&str> {
        match &self.nodes.get(node.index())?.kind {
            NodeKind::Element { tag, .. } => Some(tag),
            _ => None,
        }
    }

    fn attr(&self, node: NodeId, name: &str) -> Option<&str> {
        match &self.nodes.get(node.index())?.kind {
            NodeKind::Element { attributes, .. } => attributes
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.nodes
            .get(node.index())?
            .parent
            .filter(|p| self.tag(*p).is_some())
    }
}

impl Dom for Document {
    fn query_selector_all(&mut self, selector: &str) -> Result<Vec<NodeId>> {
        let list = SelectorList::parse(selector)?;
        let document: &Document = self;
        Ok(document
            .descendants(document.root())
            .filter(|n| list.matches(document, *n))
            .collect())
    }

    fn tag_name(&self, node: NodeId) -> Option<String> {
        self.tag(node).map(str::to_string)
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.attr(node, name).map(str::to_string)
    }

    fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> Result<()> {
        let attributes = self.attributes_mut(node)?;
        match attributes
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value.to_string(),
            None => attributes.push((name.to_ascii_lowercase(), value.to_string())),
        }
        if name.eq_ignore_ascii_case(config::SRC) {
            self.take_in_flight(node);
            self.in_flight.push_back(node);
        }
        Ok(())
    }

    fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.attr(node, "class")
            .is_some_and(|c| c.split_ascii_whitespace().any(|token| token == class))
    }

    fn remove_class(&mut self, node: NodeId, class: &str) -> Result<()> {
        let attributes = self.attributes_mut(node)?;
        if let Some((_, value)) = attributes.iter_mut().find(|(n, _)| n == "class") {
            let remaining: Vec<&str> = value
                .split_ascii_whitespace()
                .filter(|token| *token != class)
                .collect();
            *value = remaining.join(" ");
        }
        Ok(())
    }

    fn element_children(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(node.index())
            .map(|d| {
                d.children
                    .iter()
                    .copied()
                    .filter(|c| self.tag(*c).is_some())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn listen_load(&mut self, node: NodeId) -> Result<()> {
        self.data(node)?;
        *self.listeners.entry(node).or_insert(0) += 1;
        Ok(())
    }

    fn unlisten_load(&mut self, node: NodeId) {
        if let Some(count) = self.listeners.get_mut(&node) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.listeners.remove(&node);
            }
        }
    }
}
