//! WASM bindings for the LazyImage engine
//!
//! This module provides a browser backend for the [`Dom`] trait and a
//! JavaScript-facing loader class. It is feature-gated behind the `wasm`
//! feature flag.
//!
//! # Key Constraints
//!
//! - **Real load events**: advance and marker handlers are attached with
//!   `addEventListener("load", ...)`; the walk resumes inside the event
//!   handler, never synchronously.
//! - **No global side effects**: nothing is installed on `window` unless the
//!   page calls `installGlobal()`.
//!
//! # Example (JavaScript)
//!
//! ```javascript
//! import init, { WasmLazyImage, installGlobal } from 'lazyimage-engine';
//!
//! await init();
//! const loader = new WasmLazyImage('.lazy-image');
//! loader.start(function () { console.log('revealing', this); });
//!
//! // after inserting more images
//! loader.refresh();
//! loader.start();
//!
//! // opt-in: window.lazyImage(selector?, onInit?)
//! installGlobal();
//! ```

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;

use crate::config::{self, LoaderOptions};
use crate::dom::{Dom, NodeSlots};
use crate::error::{self, RevealError};
use crate::loader::{DeferredElements, LazyLoader};
use crate::types::NodeId;

/// Helper to create consistent error JsValues
fn wasm_error(msg: &str) -> JsValue {
    JsValue::from_str(msg)
}

fn host_error(err: JsValue) -> RevealError {
    RevealError::Host(err.as_string().unwrap_or_else(|| format!("{err:?}")))
}

/// Loader and document shared between the JS object and its event handlers.
struct Shared {
    dom: WebDom,
    loader: LazyLoader<WebDom>,
}

type Owner = Rc<RefCell<Weak<RefCell<Shared>>>>;

/// JS element callback of the running pass and the elements waiting for it.
///
/// Lives outside [`Shared`] so user code runs with the loader unborrowed and
/// may read its state or call back into it.
#[derive(Default)]
struct Pending {
    callback: RefCell<Option<js_sys::Function>>,
    elements: DeferredElements,
}

impl Pending {
    fn reset(&self) {
        self.callback.replace(None);
        self.elements.clear();
    }
}

/// Call the JS callback for every queued element. Must run with `shared`
/// unborrowed.
fn run_callbacks(shared: &RefCell<Shared>, pending: &Pending) {
    let nodes = pending.elements.take();
    let Some(callback) = pending.callback.borrow().clone() else {
        return;
    };
    for node in nodes {
        let element = shared.try_borrow().ok().and_then(|s| s.dom.element(node));
        let Some(element) = element else {
            continue;
        };
        if let Err(e) = callback.call0(&element) {
            tracing::warn!(node = %node, error = ?e, "Element callback threw");
        }
    }
}

/// Browser document behind the [`Dom`] trait.
///
/// Elements are interned into slots the first time they are seen; a
/// `WeakMap` from element to slot index makes the lookup constant time.
/// [`WebDom::prune`] releases the slots nothing refers to any more.
pub struct WebDom {
    document: web_sys::Document,
    nodes: RefCell<NodeSlots<web_sys::Element>>,
    /// Element -> slot index
    index: js_sys::WeakMap,
    listeners: HashMap<NodeId, (usize, Closure<dyn FnMut()>)>,
    /// Handlers removed while possibly running; dropped on refresh
    retired: Vec<Closure<dyn FnMut()>>,
    owner: Owner,
    pending: Rc<Pending>,
}

impl WebDom {
    fn new(document: web_sys::Document) -> Self {
        Self {
            document,
            nodes: RefCell::new(NodeSlots::new()),
            index: js_sys::WeakMap::new(),
            listeners: HashMap::new(),
            retired: Vec::new(),
            owner: Rc::new(RefCell::new(Weak::new())),
            pending: Rc::new(Pending::default()),
        }
    }

    fn intern(&self, element: web_sys::Element) -> NodeId {
        if let Some(index) = self.index.get(&element).as_f64() {
            return NodeId::new(index as usize);
        }
        let node = self.nodes.borrow_mut().insert(element.clone());
        self.index.set(&element, &JsValue::from_f64(node.index() as f64));
        node
    }

    /// The browser element behind a handle.
    pub fn element(&self, node: NodeId) -> Option<web_sys::Element> {
        self.nodes.borrow().get(node).cloned()
    }

    /// Number of elements currently interned.
    pub fn interned(&self) -> usize {
        self.nodes.borrow().len()
    }

    /// Release every element outside `keep` that no load handler is
    /// registered on; returns how many were released.
    fn prune(&mut self, keep: &[NodeId]) -> usize {
        let keep: HashSet<NodeId> = keep
            .iter()
            .copied()
            .chain(self.listeners.keys().copied())
            .collect();
        let released = self.nodes.get_mut().retain(|node| keep.contains(&node));
        for element in &released {
            self.index.delete(element);
        }
        released.len()
    }

    fn require(&self, node: NodeId) -> error::Result<web_sys::Element> {
        self.element(node).ok_or(RevealError::UnknownNode(node))
    }
}

impl Dom for WebDom {
    fn query_selector_all(&mut self, selector: &str) -> error::Result<Vec<NodeId>> {
        let list = self
            .document
            .query_selector_all(selector)
            .map_err(|e| RevealError::invalid_selector(selector, format!("{e:?}")))?;
        Ok((0..list.length())
            .filter_map(|i| list.get(i))
            .filter_map(|node| node.dyn_into::<web_sys::Element>().ok())
            .map(|element| self.intern(element))
            .collect())
    }

    fn tag_name(&self, node: NodeId) -> Option<String> {
        self.element(node).map(|e| e.tag_name())
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.element(node)?.get_attribute(name)
    }

    fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> error::Result<()> {
        self.require(node)?
            .set_attribute(name, value)
            .map_err(host_error)
    }

    fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.element(node)
            .is_some_and(|e| e.class_list().contains(class))
    }

    fn remove_class(&mut self, node: NodeId, class: &str) -> error::Result<()> {
        self.require(node)?
            .class_list()
            .remove_1(class)
            .map_err(host_error)
    }

    fn element_children(&self, node: NodeId) -> Vec<NodeId> {
        let Some(element) = self.element(node) else {
            return Vec::new();
        };
        let children = element.children();
        (0..children.length())
            .filter_map(|i| children.item(i))
            .map(|child| self.intern(child))
            .collect()
    }

    fn listen_load(&mut self, node: NodeId) -> error::Result<()> {
        if let Some((count, _)) = self.listeners.get_mut(&node) {
            *count += 1;
            return Ok(());
        }
        let element = self.require(node)?;
        let owner = Rc::clone(&self.owner);
        let pending = Rc::clone(&self.pending);
        let handler = Closure::<dyn FnMut()>::new(move || {
            let Some(shared) = owner.borrow().upgrade() else {
                return;
            };
            {
                // A load fired while the loader is busy cannot be delivered
                // re-entrantly.
                let Ok(mut guard) = shared.try_borrow_mut() else {
                    tracing::warn!(node = %node, "Load signal dropped, loader busy");
                    return;
                };
                let Shared { dom, loader } = &mut *guard;
                if let Err(e) = loader.dispatch_load(dom, node) {
                    tracing::warn!(node = %node, error = %e, "Load dispatch failed");
                }
            }
            run_callbacks(&shared, &pending);
        });
        element
            .add_event_listener_with_callback("load", handler.as_ref().unchecked_ref())
            .map_err(host_error)?;
        self.listeners.insert(node, (1, handler));
        Ok(())
    }

    fn unlisten_load(&mut self, node: NodeId) {
        let Some((count, _)) = self.listeners.get_mut(&node) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        if let Some((_, handler)) = self.listeners.remove(&node) {
            if let Some(element) = self.element(node) {
                let _ = element
                    .remove_event_listener_with_callback("load", handler.as_ref().unchecked_ref());
            }
            // The handler may be the one currently executing.
            self.retired.push(handler);
        }
    }
}

/// WASM-compatible lazy image loader.
///
/// Mirrors [`LazyLoader`] for JavaScript callers; load events are wired to
/// the walk automatically.
#[wasm_bindgen]
pub struct WasmLazyImage {
    shared: Rc<RefCell<Shared>>,
    pending: Rc<Pending>,
}

#[wasm_bindgen]
impl WasmLazyImage {
    /// Select elements matching `selector` (default `.lazy-image`).
    #[wasm_bindgen(constructor)]
    pub fn new(selector: Option<String>) -> Result<WasmLazyImage, JsValue> {
        let document = web_sys::window()
            .and_then(|w| w.document())
            .ok_or_else(|| wasm_error("No document available"))?;
        let mut dom = WebDom::new(document);
        let mut options = LoaderOptions::new();
        if let Some(selector) = selector {
            options = options.with_selector(selector);
        }
        let loader =
            LazyLoader::new(&mut dom, options).map_err(|e| wasm_error(&e.to_string()))?;

        let owner = Rc::clone(&dom.owner);
        let pending = Rc::clone(&dom.pending);
        let shared = Rc::new(RefCell::new(Shared { dom, loader }));
        *owner.borrow_mut() = Rc::downgrade(&shared);
        Ok(WasmLazyImage { shared, pending })
    }

    /// The active selector.
    #[wasm_bindgen(getter)]
    pub fn selector(&self) -> String {
        self.shared.borrow().loader.selector().to_string()
    }

    /// Number of elements in the snapshot.
    #[wasm_bindgen(getter, js_name = elementCount)]
    pub fn element_count(&self) -> usize {
        self.shared.borrow().loader.elements().len()
    }

    /// The element snapshot.
    #[wasm_bindgen(getter)]
    pub fn elements(&self) -> js_sys::Array {
        let shared = self.shared.borrow();
        shared
            .loader
            .elements()
            .iter()
            .filter_map(|n| shared.dom.element(*n))
            .collect()
    }

    /// One-shot guard.
    #[wasm_bindgen(getter, js_name = hasRun)]
    pub fn has_run(&self) -> bool {
        self.shared.borrow().loader.has_run()
    }

    /// Begin the sequential reveal. `callback` is called with `this` bound
    /// to each element when its reveal is initiated.
    ///
    /// The callback runs after the loader is released, so it may read the
    /// loader's properties or call its methods.
    pub fn start(&self, callback: Option<js_sys::Function>) -> Result<(), JsValue> {
        {
            let mut guard = self
                .shared
                .try_borrow_mut()
                .map_err(|_| wasm_error("Loader is busy"))?;
            let Shared { dom, loader } = &mut *guard;
            let starting = !loader.has_run() && !loader.elements().is_empty();
            let deferred = match (&callback, starting) {
                (Some(_), true) => Some(self.pending.elements.callback()),
                _ => None,
            };
            if starting {
                self.pending.callback.replace(callback);
            }
            loader
                .start(dom, deferred)
                .map_err(|e| wasm_error(&e.to_string()))?;
        }
        run_callbacks(&self.shared, &self.pending);
        Ok(())
    }

    /// Re-select elements and reset the one-shot guard.
    pub fn refresh(&self) -> Result<(), JsValue> {
        let mut guard = self
            .shared
            .try_borrow_mut()
            .map_err(|_| wasm_error("Loader is busy"))?;
        let Shared { dom, loader } = &mut *guard;
        loader.refresh(dom).map_err(|e| wasm_error(&e.to_string()))?;
        self.pending.reset();
        dom.retired.clear();
        let released = dom.prune(&loader.referenced_nodes());
        tracing::debug!(released, interned = dom.interned(), "Pruned element handles");
        Ok(())
    }

    /// Reveal a single element outside the sequential pass.
    #[wasm_bindgen(js_name = revealOne)]
    pub fn reveal_one(&self, element: web_sys::Element) -> Result<(), JsValue> {
        let mut guard = self
            .shared
            .try_borrow_mut()
            .map_err(|_| wasm_error("Loader is busy"))?;
        let Shared { dom, loader } = &mut *guard;
        let node = dom.intern(element);
        loader
            .reveal_one(dom, node)
            .map(|_| ())
            .map_err(|e| wasm_error(&e.to_string()))
    }

    /// The reveal trace as an array of event objects.
    pub fn trace(&self) -> Result<JsValue, JsValue> {
        serde_wasm_bindgen::to_value(self.shared.borrow().loader.trace())
            .map_err(|e| wasm_error(&format!("Failed to serialize trace: {}", e)))
    }
}

/// Install `window.lazyImage(selector?, onInit?)` unless the name is taken.
///
/// Returns whether the factory was installed.
#[wasm_bindgen(js_name = installGlobal)]
pub fn install_global() -> Result<bool, JsValue> {
    let window = web_sys::window().ok_or_else(|| wasm_error("No window available"))?;
    let key = JsValue::from_str(config::GLOBAL_FACTORY_NAME);
    let existing = js_sys::Reflect::get(&window, &key)?;
    if !existing.is_undefined() && !existing.is_null() {
        return Ok(false);
    }

    let factory = Closure::<dyn Fn(JsValue, JsValue) -> JsValue>::new(
        |first: JsValue, second: JsValue| match lazy_image_factory(first, second) {
            Ok(instance) => instance,
            Err(e) => wasm_bindgen::throw_val(e),
        },
    );
    js_sys::Reflect::set(&window, &key, &factory.into_js_value())?;
    Ok(true)
}

/// `window.lazyImage` body: the selector and init callback may come in
/// either order.
fn lazy_image_factory(first: JsValue, second: JsValue) -> Result<JsValue, JsValue> {
    let selector = first.as_string().or_else(|| second.as_string());
    let on_init = first
        .dyn_ref::<js_sys::Function>()
        .or_else(|| second.dyn_ref::<js_sys::Function>())
        .cloned();
    let instance = JsValue::from(WasmLazyImage::new(selector)?);
    if let Some(on_init) = on_init {
        on_init.call0(&instance)?;
    }
    Ok(instance)
}
