//! Selector registry and sequential revealer
//!
//! A [`LazyLoader`] snapshots the elements matching its selector and reveals
//! them strictly one at a time: element *i+1* is only initiated after the
//! load signal of element *i* has been delivered. This bounds the number of
//! full-resolution fetches in flight to one.
//!
//! # State machine
//!
//! ```text
//!            start()                 load signal of cursor element
//!   Idle ──────────────► Advancing{0} ──────────────► Advancing{1} ─ ... ─► Idle
//!     ▲                        │
//!     └────── refresh() ───────┘
//! ```
//!
//! Suspension is modelled by returning to the caller after registering the
//! advance handlers; the host resumes the walk by calling
//! [`LazyLoader::dispatch_load`] when a load signal arrives.
//!
//! # One-shot guard
//!
//! `has_run` becomes true as soon as a pass starts and stays true until
//! [`LazyLoader::refresh`]. A second `start` in between is a silent no-op.
//!
//! # Example
//!
//! ```ignore
//! use lazyimage_engine::{Document, EventLoop, LazyLoader, LoaderOptions};
//!
//! let mut doc = Document::parse(markup)?;
//! let mut loader = LazyLoader::new(&mut doc, LoaderOptions::new())?;
//! loader.start(&mut doc, None)?;
//! EventLoop::new().run(&mut doc, &mut loader)?;
//! ```

use crate::config::{self, LoaderOptions, StallPolicy};
use crate::dom::Dom;
use crate::error::Result;
use crate::reveal::{self, LoadListeners, Reveal};
use crate::trace::{RevealEvent, RevealTrace};
use crate::types::{NodeId, RevealState};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// Callback invoked with each element at the moment its reveal is initiated.
pub type ElementCallback<D> = Box<dyn FnMut(&mut D, NodeId)>;

/// Queue of initiated elements whose callback runs later.
///
/// A host that keeps the loader behind a `RefCell` cannot hand control to
/// user code while the walk holds the borrow. It passes
/// [`DeferredElements::callback`] to [`LazyLoader::start`] instead, releases
/// the borrow, then runs its own callback for every element from
/// [`DeferredElements::take`]. Clones share one queue.
#[derive(Debug, Clone, Default)]
pub struct DeferredElements {
    queue: Rc<RefCell<VecDeque<NodeId>>>,
}

impl DeferredElements {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Element callback that appends to this queue.
    pub fn callback<D: 'static>(&self) -> ElementCallback<D> {
        let queue = Rc::clone(&self.queue);
        Box::new(move |_: &mut D, element| queue.borrow_mut().push_back(element))
    }

    /// Remove and return every queued element, oldest first.
    pub fn take(&self) -> Vec<NodeId> {
        self.queue.borrow_mut().drain(..).collect()
    }

    /// Drop every queued element.
    pub fn clear(&self) {
        self.queue.borrow_mut().clear();
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

/// Selector registry plus sequential revealer over one document.
pub struct LazyLoader<D> {
    selector: String,
    elements: Vec<NodeId>,
    has_run: bool,
    state: RevealState,
    stall_policy: StallPolicy,
    on_element: Option<ElementCallback<D>>,
    listeners: LoadListeners,
    trace: RevealTrace,
}

impl<D> fmt::Debug for LazyLoader<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyLoader")
            .field("selector", &self.selector)
            .field("elements", &self.elements)
            .field("has_run", &self.has_run)
            .field("state", &self.state)
            .field("stall_policy", &self.stall_policy)
            .finish_non_exhaustive()
    }
}

impl<D> LazyLoader<D> {
    /// The active selector.
    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// The element snapshot, in document order at the time of selection.
    pub fn elements(&self) -> &[NodeId] {
        &self.elements
    }

    /// One-shot guard: true once a pass has started, until `refresh`.
    pub fn has_run(&self) -> bool {
        self.has_run
    }

    /// Current walk state.
    pub fn state(&self) -> RevealState {
        self.state
    }

    /// Stall policy this loader was built with.
    pub fn stall_policy(&self) -> StallPolicy {
        self.stall_policy
    }

    /// Element whose load signal the walk is waiting for.
    pub fn current_element(&self) -> Option<NodeId> {
        self.state
            .cursor()
            .and_then(|cursor| self.elements.get(cursor).copied())
    }

    /// Check if a load signal on `node` would advance the walk.
    pub fn is_awaiting(&self, node: NodeId) -> bool {
        self.listeners.is_advance(node)
    }

    /// Everything this loader has done since the last snapshot.
    pub fn trace(&self) -> &RevealTrace {
        &self.trace
    }

    /// Nodes this loader still refers to: the snapshot, plus the nodes its
    /// load handlers are registered on and the elements they unmark.
    ///
    /// A backend that recycles node handles must keep these alive.
    pub fn referenced_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .elements
            .iter()
            .copied()
            .chain(self.listeners.nodes())
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }
}

impl<D: Dom> LazyLoader<D> {
    /// Build a loader and take the first snapshot.
    ///
    /// The init callback runs before the snapshot, with the loader already
    /// carrying its selector.
    pub fn new(dom: &mut D, options: LoaderOptions<D>) -> Result<Self> {
        let selector = options.resolved_selector()?;
        let mut loader = Self {
            selector,
            elements: Vec::new(),
            has_run: false,
            state: RevealState::Idle,
            stall_policy: options.stall_policy,
            on_element: None,
            listeners: LoadListeners::default(),
            trace: RevealTrace::new(),
        };
        if let Some(on_init) = options.on_init {
            on_init(&mut loader);
        }
        loader.elements = dom.query_selector_all(&loader.selector)?;
        loader.record_snapshot();
        Ok(loader)
    }

    /// Re-select elements and reset the one-shot guard.
    ///
    /// Advance handlers of an interrupted pass are detached so a late load
    /// signal cannot move a walk that no longer exists. Marker handlers stay:
    /// an element still loading gets its marker cleared when it finishes.
    ///
    /// The trace restarts with the new snapshot.
    pub fn refresh(&mut self, dom: &mut D) -> Result<()> {
        let elements = dom.query_selector_all(&self.selector)?;
        let detached = self.listeners.clear_advance(dom);
        if detached > 0 {
            tracing::debug!(detached, "Detached advance listeners of interrupted pass");
        }
        self.elements = elements;
        self.has_run = false;
        self.state = RevealState::Idle;
        self.on_element = None;
        self.trace.clear();
        self.record_snapshot();
        Ok(())
    }

    fn record_snapshot(&mut self) {
        tracing::debug!(
            selector = %self.selector,
            count = self.elements.len(),
            "Selected elements"
        );
        self.trace.record(RevealEvent::Snapshot {
            selector: self.selector.clone(),
            count: self.elements.len(),
        });
    }

    /// Reveal a single element directly, outside any sequential pass.
    pub fn reveal_one(&mut self, dom: &mut D, element: NodeId) -> Result<Reveal> {
        reveal::reveal_element(dom, &mut self.listeners, element)
    }

    /// Start the sequential pass.
    ///
    /// No-op when the snapshot is empty or a pass already started since the
    /// last refresh. `callback` runs once per element when its reveal is
    /// initiated.
    pub fn start(&mut self, dom: &mut D, callback: Option<ElementCallback<D>>) -> Result<()> {
        if self.elements.is_empty() || self.has_run {
            tracing::debug!(
                elements = self.elements.len(),
                has_run = self.has_run,
                "Start ignored"
            );
            return Ok(());
        }
        self.has_run = true;
        self.on_element = callback;
        self.trace.record(RevealEvent::Started {
            count: self.elements.len(),
        });
        tracing::debug!(count = self.elements.len(), "Starting sequential reveal");
        self.walk(dom, 0)
    }

    /// Reveal from `cursor` until the walk has to wait (then suspend) or the
    /// snapshot is exhausted.
    ///
    /// An element that starts no fetch never fires a load signal. Under
    /// [`StallPolicy::Wait`] the walk suspends on it like on any other
    /// element, so the pass stalls there; under [`StallPolicy::Skip`] it is
    /// stepped over.
    fn walk(&mut self, dom: &mut D, mut cursor: usize) -> Result<()> {
        loop {
            let Some(&element) = self.elements.get(cursor) else {
                self.state = RevealState::Idle;
                self.on_element = None;
                let revealed = self.elements.len();
                self.trace.record(RevealEvent::Completed { revealed });
                tracing::debug!(revealed, "Sequential reveal complete");
                return Ok(());
            };

            let reveal = self.reveal_one(dom, element)?;
            self.trace.record(RevealEvent::Initiated {
                index: cursor,
                element,
                shape: reveal.shape,
            });
            if let Some(callback) = self.on_element.as_mut() {
                callback(dom, element);
            }

            if !reveal.started_fetch() && self.stall_policy == StallPolicy::Skip {
                tracing::debug!(index = cursor, element = %element, "No fetch started, stepping over");
                self.trace
                    .record(RevealEvent::SteppedOver { index: cursor, element });
                cursor += 1;
                continue;
            }
            if !reveal.started_fetch() {
                tracing::warn!(index = cursor, element = %element, "No fetch started, reveal stalls");
            }

            for target in &reveal.load_targets {
                self.listeners.add_advance(dom, *target)?;
            }
            self.state = RevealState::Advancing { cursor };
            tracing::trace!(index = cursor, element = %element, "Awaiting load signal");
            return Ok(());
        }
    }

    /// Deliver a load signal fired by `node`.
    ///
    /// The marker handler runs first, then the advance handler. Returns
    /// whether any handler of this loader consumed the signal.
    pub fn dispatch_load(&mut self, dom: &mut D, node: NodeId) -> Result<bool> {
        let mut handled = false;

        if let Some(marked) = reveal::clear_marker(dom, &mut self.listeners, node)? {
            self.trace.record(RevealEvent::MarkerCleared {
                node,
                element: marked,
            });
            handled = true;
        }

        let awaited = match self.state {
            RevealState::Advancing { cursor } if self.listeners.is_advance(node) => Some(cursor),
            _ => None,
        };
        if let Some(cursor) = awaited {
            // Every qualifying child of a composite element carries an advance
            // handler; the first signal detaches all of them.
            self.listeners.clear_advance(dom);
            self.trace.record(RevealEvent::Loaded {
                index: cursor,
                node,
            });
            self.walk(dom, cursor + 1)?;
            handled = true;
        }

        Ok(handled)
    }

    /// Step past the element the walk is waiting for.
    ///
    /// Returns the skipped element, or `None` when no pass is in flight.
    /// The skipped element keeps its marker handler, so a load that arrives
    /// later still clears its marker.
    pub fn skip_stalled(&mut self, dom: &mut D) -> Result<Option<NodeId>> {
        let RevealState::Advancing { cursor } = self.state else {
            return Ok(None);
        };
        let Some(&element) = self.elements.get(cursor) else {
            return Ok(None);
        };
        self.listeners.clear_advance(dom);
        tracing::warn!(index = cursor, element = %element, "Skipping stalled element");
        self.trace
            .record(RevealEvent::Skipped { index: cursor, element });
        self.walk(dom, cursor + 1)?;
        Ok(Some(element))
    }

    /// Number of load handlers (marker and advance) this loader holds.
    pub fn pending_listeners(&self) -> usize {
        self.listeners.marker_count() + self.listeners.advance_count()
    }

    /// Check if the marker class is still present on `element`.
    pub fn is_marked(&self, dom: &D, element: NodeId) -> bool {
        dom.has_class(element, config::MARKER_CLASS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Document;

    const TWO_IMAGES: &str = r#"<body>
        <img id="a" class="lazy-image" data-src="a.png"/>
        <img id="b" class="lazy-image" data-src="b.png"/>
    </body>"#;

    fn loader(doc: &mut Document) -> LazyLoader<Document> {
        LazyLoader::new(doc, LoaderOptions::new()).unwrap()
    }

    fn id(doc: &Document, id: &str) -> NodeId {
        doc.get_element_by_id(id).unwrap()
    }

    #[test]
    fn test_new_uses_default_selector() {
        let mut doc = Document::parse(TWO_IMAGES).unwrap();
        let loader = loader(&mut doc);
        assert_eq!(loader.selector(), ".lazy-image");
        assert_eq!(loader.elements(), &[id(&doc, "a"), id(&doc, "b")]);
        assert!(!loader.has_run());
        assert!(loader.state().is_idle());
    }

    #[test]
    fn test_init_callback_runs_before_snapshot() {
        let mut doc = Document::parse(TWO_IMAGES).unwrap();
        let seen = Rc::new(RefCell::new(None));
        let seen_in_init = Rc::clone(&seen);
        let loader = LazyLoader::new(
            &mut doc,
            LoaderOptions::new().with_init(move |l: &mut LazyLoader<Document>| {
                *seen_in_init.borrow_mut() = Some((l.selector().to_string(), l.elements().len()));
            }),
        )
        .unwrap();
        assert_eq!(*seen.borrow(), Some((".lazy-image".to_string(), 0)));
        assert_eq!(loader.elements().len(), 2);
    }

    #[test]
    fn test_invalid_selector_fails_construction() {
        let mut doc = Document::parse(TWO_IMAGES).unwrap();
        let result = LazyLoader::new(&mut doc, LoaderOptions::new().with_selector("img:hover"));
        assert!(result.is_err());
    }

    #[test]
    fn test_start_suspends_on_first_element() {
        let mut doc = Document::parse(TWO_IMAGES).unwrap();
        let mut loader = loader(&mut doc);
        let (a, b) = (id(&doc, "a"), id(&doc, "b"));

        loader.start(&mut doc, None).unwrap();
        assert!(loader.has_run());
        assert_eq!(loader.state(), RevealState::Advancing { cursor: 0 });
        assert_eq!(loader.current_element(), Some(a));
        assert_eq!(doc.attribute(a, "src").as_deref(), Some("a.png"));
        assert_eq!(doc.attribute(b, "src"), None);
        // marker + advance handler on the same element
        assert_eq!(doc.load_listener_count(a), 2);
    }

    #[test]
    fn test_dispatch_load_advances_and_clears_marker() {
        let mut doc = Document::parse(TWO_IMAGES).unwrap();
        let mut loader = loader(&mut doc);
        let (a, b) = (id(&doc, "a"), id(&doc, "b"));
        loader.start(&mut doc, None).unwrap();

        assert!(doc.complete_load(a));
        assert!(loader.dispatch_load(&mut doc, a).unwrap());
        assert!(!doc.has_class(a, "lazy-image"));
        assert_eq!(loader.current_element(), Some(b));
        assert_eq!(doc.attribute(b, "src").as_deref(), Some("b.png"));

        assert!(loader.dispatch_load(&mut doc, b).unwrap());
        assert!(loader.state().is_idle());
        assert!(loader.has_run());
        assert_eq!(loader.pending_listeners(), 0);
        assert_eq!(doc.total_load_listeners(), 0);
    }

    #[test]
    fn test_dispatch_load_ignores_foreign_nodes() {
        let mut doc = Document::parse(TWO_IMAGES).unwrap();
        let mut loader = loader(&mut doc);
        loader.start(&mut doc, None).unwrap();
        let b = id(&doc, "b");
        assert!(!loader.dispatch_load(&mut doc, b).unwrap());
        assert_eq!(loader.state(), RevealState::Advancing { cursor: 0 });
    }

    #[test]
    fn test_callback_runs_at_initiation() {
        let mut doc = Document::parse(TWO_IMAGES).unwrap();
        let mut loader = loader(&mut doc);
        let (a, b) = (id(&doc, "a"), id(&doc, "b"));
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&calls);
        loader
            .start(
                &mut doc,
                Some(Box::new(move |dom: &mut Document, element| {
                    // the swap already happened when the callback runs
                    sink.borrow_mut().push((element, dom.attribute(element, "src")));
                })),
            )
            .unwrap();
        assert_eq!(*calls.borrow(), vec![(a, Some("a.png".to_string()))]);

        loader.dispatch_load(&mut doc, a).unwrap();
        assert_eq!(calls.borrow().len(), 2);
        assert_eq!(calls.borrow()[1].0, b);
    }

    #[test]
    fn test_second_start_is_noop() {
        let mut doc = Document::parse(TWO_IMAGES).unwrap();
        let mut loader = loader(&mut doc);
        loader.start(&mut doc, None).unwrap();
        let events = loader.trace().len();
        loader.start(&mut doc, None).unwrap();
        assert_eq!(loader.trace().len(), events);
        assert_eq!(doc.in_flight().count(), 1);
    }

    const WITHOUT_FETCH: &str = r#"<body>
        <div id="d" class="lazy-image"/>
        <img id="bare" class="lazy-image"/>
        <img id="c" class="lazy-image" data-src="c.png"/>
    </body>"#;

    #[test]
    fn test_element_without_fetch_stalls_by_default() {
        let mut doc = Document::parse(WITHOUT_FETCH).unwrap();
        let mut loader = loader(&mut doc);
        let (d, bare, c) = (id(&doc, "d"), id(&doc, "bare"), id(&doc, "c"));

        loader.start(&mut doc, None).unwrap();
        assert_eq!(loader.state(), RevealState::Advancing { cursor: 0 });
        assert_eq!(loader.current_element(), Some(d));
        assert_eq!(doc.attribute(c, "src"), None);
        assert_eq!(loader.trace().initiated(), vec![d]);

        // explicit skips walk on one element at a time
        assert_eq!(loader.skip_stalled(&mut doc).unwrap(), Some(d));
        assert_eq!(loader.current_element(), Some(bare));
        assert_eq!(doc.attribute(c, "src"), None);
        assert_eq!(loader.skip_stalled(&mut doc).unwrap(), Some(bare));
        assert_eq!(loader.current_element(), Some(c));
        assert_eq!(doc.attribute(c, "src").as_deref(), Some("c.png"));
    }

    #[test]
    fn test_elements_without_fetch_are_stepped_over_when_skipping() {
        let mut doc = Document::parse(WITHOUT_FETCH).unwrap();
        let options = LoaderOptions::new().with_stall_policy(StallPolicy::Skip);
        let mut loader = LazyLoader::new(&mut doc, options).unwrap();
        loader.start(&mut doc, None).unwrap();
        assert_eq!(loader.state(), RevealState::Advancing { cursor: 2 });
        assert_eq!(loader.current_element(), Some(id(&doc, "c")));
    }

    #[test]
    fn test_refresh_detaches_stale_advance_listeners() {
        let mut doc = Document::parse(TWO_IMAGES).unwrap();
        let mut loader = loader(&mut doc);
        let a = id(&doc, "a");
        loader.start(&mut doc, None).unwrap();

        loader.refresh(&mut doc).unwrap();
        assert!(!loader.has_run());
        assert!(loader.state().is_idle());
        assert!(!loader.is_awaiting(a));
        // marker handler survives
        assert_eq!(doc.load_listener_count(a), 1);

        // the late load clears the marker but cannot advance anything
        loader.dispatch_load(&mut doc, a).unwrap();
        assert!(!doc.has_class(a, "lazy-image"));
        assert!(loader.state().is_idle());
        assert_eq!(doc.total_load_listeners(), 0);
    }

    #[test]
    fn test_deferred_callbacks_run_after_borrow_is_released() {
        let mut doc = Document::parse(TWO_IMAGES).unwrap();
        let loader = loader(&mut doc);
        let (a, b) = (id(&doc, "a"), id(&doc, "b"));
        let shared = RefCell::new((doc, loader));
        let deferred = DeferredElements::new();

        {
            let mut guard = shared.borrow_mut();
            let (doc, loader) = &mut *guard;
            loader.start(doc, Some(deferred.callback())).unwrap();
        }
        assert_eq!(deferred.len(), 1);
        for element in deferred.take() {
            // user code may read loader state while it runs
            let guard = shared.try_borrow().unwrap();
            assert_eq!(element, a);
            assert!(guard.1.has_run());
            assert_eq!(guard.1.elements().len(), 2);
        }
        assert!(deferred.is_empty());

        {
            let mut guard = shared.borrow_mut();
            let (doc, loader) = &mut *guard;
            doc.complete_load(a);
            loader.dispatch_load(doc, a).unwrap();
        }
        assert_eq!(deferred.take(), vec![b]);
    }

    #[test]
    fn test_referenced_nodes_cover_in_flight_composites() {
        let mut doc = Document::parse(
            r#"<body>
                <picture id="p" class="lazy-image">
                    <source id="s" data-src="s.webp"/>
                    <img id="i" data-src="i.png"/>
                </picture>
            </body>"#,
        )
        .unwrap();
        let mut loader = LazyLoader::new(&mut doc, LoaderOptions::new().with_selector("picture"))
            .unwrap();
        let (p, s, i) = (id(&doc, "p"), id(&doc, "s"), id(&doc, "i"));
        loader.start(&mut doc, None).unwrap();

        let body = doc.document_element().unwrap();
        doc.remove(p).unwrap();
        loader.refresh(&mut doc).unwrap();
        assert!(loader.elements().is_empty());
        // marker handlers on both children still point at the container
        let mut expected = vec![p, s, i];
        expected.sort_unstable();
        assert_eq!(loader.referenced_nodes(), expected);
        assert_eq!(doc.element_children(body), Vec::<NodeId>::new());
    }

    #[test]
    fn test_refresh_restarts_trace() {
        let mut doc = Document::parse(TWO_IMAGES).unwrap();
        let mut loader = loader(&mut doc);
        loader.start(&mut doc, None).unwrap();
        for _ in 0..10_000 {
            loader.refresh(&mut doc).unwrap();
        }
        assert_eq!(
            loader.trace().events(),
            &[RevealEvent::Snapshot {
                selector: ".lazy-image".to_string(),
                count: 2,
            }]
        );
    }

    #[test]
    fn test_skip_stalled() {
        let mut doc = Document::parse(TWO_IMAGES).unwrap();
        let mut loader = loader(&mut doc);
        let (a, b) = (id(&doc, "a"), id(&doc, "b"));
        assert_eq!(loader.skip_stalled(&mut doc).unwrap(), None);

        loader.start(&mut doc, None).unwrap();
        doc.fail_load(a);
        assert_eq!(loader.skip_stalled(&mut doc).unwrap(), Some(a));
        assert_eq!(loader.current_element(), Some(b));
        assert!(doc.has_class(a, "lazy-image"));
    }

    #[test]
    fn test_reveal_one_outside_pass() {
        let mut doc = Document::parse(TWO_IMAGES).unwrap();
        let mut loader = loader(&mut doc);
        let b = id(&doc, "b");
        let reveal = loader.reveal_one(&mut doc, b).unwrap();
        assert_eq!(reveal.load_targets, vec![b]);
        assert!(!loader.has_run());
        assert!(loader.dispatch_load(&mut doc, b).unwrap());
        assert!(!loader.is_marked(&doc, b));
        assert!(loader.state().is_idle());
    }
}
