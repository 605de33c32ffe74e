//! CLI binary for running a sequential reveal over markup via stdin.
//!
//! Usage:
//!   echo '{"markup": "<body>...</body>"}' | cargo run --bin reveal
//!
//! Input (JSON on stdin):
//!   - markup: String: well-formed (X)HTML markup
//!   - selector: Optional<String>: selector to snapshot (default ".lazy-image")
//!   - fail: Optional<Vec<String>>: URLs whose fetch never completes
//!   - stall_policy: Optional<"wait" | "skip">: what to do on a stalled fetch
//!
//! Output (JSON on stdout):
//!   - markup: String: the document after the pass settled
//!   - revealed: Vec<String>: `data-src` of each element, in reveal order
//!   - has_run: bool: the one-shot guard after the pass
//!   - settled: Object: `{"outcome": "idle"}` or `{"outcome": "stalled", ...}`
//!   - trace: Array: reveal events
//!   - error: Optional<String>: error message if the pass failed

use lazyimage_engine::{
    config, Document, Dom, EventLoop, LazyLoader, LoaderOptions, RevealTrace, Settled,
    StallPolicy,
};
use std::io::Read;
use tracing_subscriber::EnvFilter;

#[derive(serde::Deserialize)]
struct RevealRequest {
    markup: String,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    fail: Vec<String>,
    #[serde(default)]
    stall_policy: StallPolicy,
}

#[derive(serde::Serialize)]
struct RevealResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    markup: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    revealed: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    has_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    settled: Option<Settled>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<RevealTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn error_response(msg: String) -> RevealResponse {
    RevealResponse {
        markup: None,
        revealed: None,
        has_run: None,
        settled: None,
        trace: None,
        error: Some(msg),
    }
}

fn fail(msg: String) -> ! {
    let resp = error_response(msg);
    println!("{}", serde_json::to_string(&resp).unwrap_or_default());
    std::process::exit(1);
}

fn run(input: &str) -> lazyimage_engine::Result<RevealResponse> {
    let request: RevealRequest = serde_json::from_str(input)?;
    let mut doc = Document::parse(&request.markup)?;

    let mut options = LoaderOptions::new().with_stall_policy(request.stall_policy);
    if let Some(selector) = request.selector {
        options = options.with_selector(selector);
    }
    let mut loader = LazyLoader::new(&mut doc, options)?;
    loader.start(&mut doc, None)?;

    let mut event_loop = EventLoop::new();
    for url in request.fail {
        event_loop = event_loop.fail_url(url);
    }
    let settled = event_loop.run(&mut doc, &mut loader)?;

    let revealed = loader
        .trace()
        .initiated()
        .into_iter()
        .map(|element| placeholder_source(&doc, element))
        .collect();

    Ok(RevealResponse {
        markup: Some(doc.to_markup()),
        revealed: Some(revealed),
        has_run: Some(loader.has_run()),
        settled: Some(settled),
        trace: Some(loader.trace().clone()),
        error: None,
    })
}

/// `data-src` of an element, or of the first composite child carrying one.
fn placeholder_source(doc: &Document, element: lazyimage_engine::NodeId) -> String {
    doc.attribute(element, config::DATA_SRC)
        .or_else(|| {
            doc.element_children(element)
                .into_iter()
                .find_map(|child| doc.attribute(child, config::DATA_SRC))
        })
        .unwrap_or_default()
}

fn main() {
    // Initialize tracing with WARN level by default, respecting RUST_LOG
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        fail(format!("Failed to read stdin: {e}"));
    }

    match run(&input) {
        Ok(resp) => println!("{}", serde_json::to_string(&resp).unwrap_or_default()),
        Err(e) => fail(format!("{e}")),
    }
}
