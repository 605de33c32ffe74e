//! Integration tests for the sequential reveal.
//!
//! Each test drives a full pass over an in-memory document, completing
//! fetches by hand or through the event loop, and checks the resulting DOM.

use lazyimage_engine::{
    Document, Dom, EventLoop, LazyLoader, LoaderOptions, NodeId, RevealEvent, RevealState,
    Settled, StallPolicy,
};
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::rc::Rc;

const GALLERY: &str = r#"<body>
    <main>
        <img id="one" class="lazy-image" src="one-thumb.png" data-src="one.png"/>
        <picture id="two" class="lazy-image">
            <source id="two-webp" srcset="two-thumb.webp" data-srcset="two.webp 1x, two@2x.webp 2x" data-src="two.webp"/>
            <img id="two-img" src="two-thumb.png" data-src="two.png"/>
        </picture>
        <img id="three" class="lazy-image" data-src="three.png" data-srcset="three.png 1x, three@2x.png 2x"/>
    </main>
</body>"#;

fn node(doc: &Document, id: &str) -> NodeId {
    doc.get_element_by_id(id)
        .unwrap_or_else(|| panic!("no element with id {id}"))
}

fn default_loader(doc: &mut Document) -> LazyLoader<Document> {
    LazyLoader::new(doc, LoaderOptions::new()).expect("loader should build")
}

#[test]
fn full_pass_reveals_everything_and_clears_markers() {
    let mut doc = Document::parse(GALLERY).unwrap();
    let mut loader = default_loader(&mut doc);
    loader.start(&mut doc, None).unwrap();

    let settled = EventLoop::new().run(&mut doc, &mut loader).unwrap();
    assert_eq!(settled, Settled::Idle);

    assert_eq!(doc.attribute(node(&doc, "one"), "src").as_deref(), Some("one.png"));
    assert_eq!(doc.attribute(node(&doc, "two-img"), "src").as_deref(), Some("two.png"));
    assert_eq!(
        doc.attribute(node(&doc, "three"), "srcset").as_deref(),
        Some("three.png 1x, three@2x.png 2x")
    );
    for id in ["one", "two", "three"] {
        assert!(!doc.has_class(node(&doc, id), "lazy-image"), "{id} still marked");
    }
    assert_eq!(doc.total_load_listeners(), 0);
    assert_eq!(loader.pending_listeners(), 0);
}

#[test]
fn element_is_never_initiated_before_previous_load() {
    let mut doc = Document::parse(GALLERY).unwrap();
    let mut loader = default_loader(&mut doc);
    let elements = loader.elements().to_vec();
    loader.start(&mut doc, None).unwrap();

    let mut loads = 0;
    while let Some(in_flight) = doc.next_in_flight() {
        let cursor = loader.state().cursor().unwrap_or(elements.len());
        // nothing after the cursor has been touched
        for later in &elements[(cursor + 1).min(elements.len())..] {
            assert_eq!(doc.attribute(*later, "src"), None);
            for child in doc.element_children(*later) {
                assert_ne!(doc.attribute(child, "src"), doc.attribute(child, "data-src"));
            }
        }
        doc.complete_load(in_flight);
        loader.dispatch_load(&mut doc, in_flight).unwrap();
        loads += 1;
    }
    // one, two-webp, two-img, three
    assert_eq!(loads, 4);
    assert_eq!(loader.trace().initiated(), elements);
}

#[test]
fn start_twice_matches_start_once() {
    let mut once = Document::parse(GALLERY).unwrap();
    let mut loader_once = default_loader(&mut once);
    loader_once.start(&mut once, None).unwrap();
    EventLoop::new().run(&mut once, &mut loader_once).unwrap();

    let mut twice = Document::parse(GALLERY).unwrap();
    let mut loader_twice = default_loader(&mut twice);
    loader_twice.start(&mut twice, None).unwrap();
    loader_twice.start(&mut twice, None).unwrap();
    EventLoop::new().run(&mut twice, &mut loader_twice).unwrap();
    loader_twice.start(&mut twice, None).unwrap();

    assert_eq!(once.to_markup(), twice.to_markup());
    assert!(loader_twice.has_run());
}

#[test]
fn simple_swap_leaves_srcset_alone() {
    let mut doc =
        Document::parse(r#"<body><img id="a" class="lazy-image" data-src="a.png"/></body>"#)
            .unwrap();
    let mut loader = default_loader(&mut doc);
    loader.start(&mut doc, None).unwrap();
    EventLoop::new().run(&mut doc, &mut loader).unwrap();

    let a = node(&doc, "a");
    assert_eq!(doc.attribute(a, "src").as_deref(), Some("a.png"));
    assert!(!doc.has_class(a, "lazy-image"));
    assert_eq!(doc.attribute(a, "srcset"), None);
}

#[test]
fn composite_clears_container_marker_on_first_child_load() {
    let mut doc = Document::parse(GALLERY).unwrap();
    let mut loader = default_loader(&mut doc);
    loader.start(&mut doc, None).unwrap();
    let (one, two, webp, img, three) = (
        node(&doc, "one"),
        node(&doc, "two"),
        node(&doc, "two-webp"),
        node(&doc, "two-img"),
        node(&doc, "three"),
    );

    doc.complete_load(one);
    loader.dispatch_load(&mut doc, one).unwrap();

    assert_eq!(doc.attribute(webp, "src").as_deref(), Some("two.webp"));
    assert_eq!(
        doc.attribute(webp, "srcset").as_deref(),
        Some("two.webp 1x, two@2x.webp 2x")
    );
    assert_eq!(doc.attribute(img, "src").as_deref(), Some("two.png"));
    assert!(doc.has_class(two, "lazy-image"));

    // the second child fires first; the walk advances exactly once
    doc.complete_load(img);
    loader.dispatch_load(&mut doc, img).unwrap();
    assert!(!doc.has_class(two, "lazy-image"));
    assert_eq!(loader.state(), RevealState::Advancing { cursor: 2 });
    assert_eq!(loader.current_element(), Some(three));

    doc.complete_load(webp);
    loader.dispatch_load(&mut doc, webp).unwrap();
    assert_eq!(loader.state(), RevealState::Advancing { cursor: 2 });
    let loaded: Vec<_> = loader
        .trace()
        .events()
        .iter()
        .filter(|e| matches!(e, RevealEvent::Loaded { .. }))
        .collect();
    assert_eq!(loaded.len(), 2);
}

#[test]
fn refresh_resets_guard_and_picks_up_new_elements() {
    let mut doc = Document::parse(GALLERY).unwrap();
    let mut loader = default_loader(&mut doc);
    loader.start(&mut doc, None).unwrap();
    EventLoop::new().run(&mut doc, &mut loader).unwrap();
    assert!(loader.has_run());

    let main = doc.get_element_by_id("one").and_then(|n| doc.parent_element(n)).unwrap();
    let late = doc.create_element("img");
    doc.set_attribute(late, "class", "lazy-image").unwrap();
    doc.set_attribute(late, "data-src", "late.png").unwrap();
    doc.append_child(main, late).unwrap();

    // the snapshot does not follow the document
    assert!(!loader.elements().contains(&late));

    loader.refresh(&mut doc).unwrap();
    assert!(!loader.has_run());
    assert_eq!(loader.elements(), &[late]);

    loader.start(&mut doc, None).unwrap();
    assert!(loader.has_run());
    EventLoop::new().run(&mut doc, &mut loader).unwrap();
    assert_eq!(doc.attribute(late, "src").as_deref(), Some("late.png"));
    assert!(!doc.has_class(late, "lazy-image"));
}

#[test]
fn empty_selection_start_is_inert() {
    let markup = r#"<body><img id="a" data-src="a.png"/></body>"#;
    let mut doc = Document::parse(markup).unwrap();
    let mut loader = default_loader(&mut doc);
    assert!(loader.elements().is_empty());

    loader.start(&mut doc, None).unwrap();
    assert!(!loader.has_run());
    assert_eq!(doc.to_markup(), markup);
    assert_eq!(doc.next_in_flight(), None);
}

#[test]
fn builder_order_does_not_matter() {
    let init_calls = Rc::new(RefCell::new(0));

    let mut doc_a = Document::parse(GALLERY).unwrap();
    let calls = Rc::clone(&init_calls);
    let a = LazyLoader::new(
        &mut doc_a,
        LoaderOptions::new()
            .with_selector("main > img")
            .with_init(move |_| *calls.borrow_mut() += 1),
    )
    .unwrap();

    let mut doc_b = Document::parse(GALLERY).unwrap();
    let calls = Rc::clone(&init_calls);
    let b = LazyLoader::new(
        &mut doc_b,
        LoaderOptions::new()
            .with_init(move |_| *calls.borrow_mut() += 1)
            .with_selector("main > img"),
    )
    .unwrap();

    assert_eq!(*init_calls.borrow(), 2);
    assert_eq!(a.selector(), b.selector());
    assert_eq!(a.elements(), b.elements());
    assert_eq!(a.has_run(), b.has_run());
    assert_eq!(a.elements().len(), 2);
}

#[test]
fn removed_element_stalls_until_refresh() {
    let mut doc = Document::parse(GALLERY).unwrap();
    let mut loader = default_loader(&mut doc);
    let one = node(&doc, "one");
    loader.start(&mut doc, None).unwrap();

    doc.remove(one).unwrap();
    let settled = EventLoop::new().run(&mut doc, &mut loader).unwrap();
    assert_eq!(settled, Settled::Stalled { cursor: 0, element: one });
    assert_eq!(doc.attribute(node(&doc, "three"), "src"), None);

    loader.refresh(&mut doc).unwrap();
    assert_eq!(loader.elements().len(), 2);
    loader.start(&mut doc, None).unwrap();
    assert_eq!(EventLoop::new().run(&mut doc, &mut loader).unwrap(), Settled::Idle);
    assert_eq!(
        doc.attribute(node(&doc, "three"), "src").as_deref(),
        Some("three.png")
    );
}

#[test]
fn skip_policy_finishes_despite_failures() {
    let mut doc = Document::parse(GALLERY).unwrap();
    let options = LoaderOptions::new().with_stall_policy(StallPolicy::Skip);
    let mut loader = LazyLoader::new(&mut doc, options).unwrap();
    loader.start(&mut doc, None).unwrap();

    let settled = EventLoop::new()
        .fail_url("one.png")
        .run(&mut doc, &mut loader)
        .unwrap();
    assert_eq!(settled, Settled::Idle);
    assert!(doc.has_class(node(&doc, "one"), "lazy-image"));
    assert!(!doc.has_class(node(&doc, "three"), "lazy-image"));
    assert!(loader
        .trace()
        .events()
        .iter()
        .any(|e| matches!(e, RevealEvent::Skipped { index: 0, .. })));
}

#[test]
fn per_element_callback_sees_each_element_once_in_order() {
    let mut doc = Document::parse(GALLERY).unwrap();
    let mut loader = default_loader(&mut doc);
    let expected = loader.elements().to_vec();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    loader
        .start(
            &mut doc,
            Some(Box::new(move |_: &mut Document, element: NodeId| {
                sink.borrow_mut().push(element)
            })),
        )
        .unwrap();
    EventLoop::new().run(&mut doc, &mut loader).unwrap();
    assert_eq!(*seen.borrow(), expected);
}

#[test]
fn element_without_fetch_stalls_the_walk_until_skipped() {
    let markup = r#"<body><div id="d" class="lazy-image"/><img id="i" class="lazy-image" data-src="i.png"/></body>"#;

    let mut doc = Document::parse(markup).unwrap();
    let mut loader = default_loader(&mut doc);
    loader.start(&mut doc, None).unwrap();
    let d = node(&doc, "d");
    let settled = EventLoop::new().run(&mut doc, &mut loader).unwrap();
    assert_eq!(settled, Settled::Stalled { cursor: 0, element: d });
    assert_eq!(doc.attribute(node(&doc, "i"), "src"), None);

    let mut doc = Document::parse(markup).unwrap();
    let options = LoaderOptions::new().with_stall_policy(StallPolicy::Skip);
    let mut loader = LazyLoader::new(&mut doc, options).unwrap();
    loader.start(&mut doc, None).unwrap();
    assert_eq!(EventLoop::new().run(&mut doc, &mut loader).unwrap(), Settled::Idle);
    assert_eq!(doc.attribute(node(&doc, "i"), "src").as_deref(), Some("i.png"));
}
