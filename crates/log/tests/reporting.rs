//! Integration tests for rendering templates into sinks

use std::sync::Arc;

use bulwark_log::{Entry, Level, LogSink, MemorySink, Template};
use pretty_assertions::assert_eq;

/// A producer holding the sink behind `Arc<dyn LogSink>` reports into the
/// caller's handle.
#[test]
fn rendered_messages_reach_shared_sink() {
    let sink = MemorySink::new();
    let shared: Arc<dyn LogSink> = Arc::new(sink.clone());
    let success = Template::parse("{name} ran in under {cutoff}").expect("valid");
    let failure = Template::parse("{name} exceeded {cutoff}").expect("valid");

    if shared.enabled(Level::Debug) {
        shared.emit(
            Level::Debug,
            &success.render(&[("name", &"render"), ("cutoff", &"50ms")]),
        );
    }
    shared.emit(
        Level::Warn,
        &failure.render(&[("name", &"upload"), ("cutoff", &"2s")]),
    );

    assert_eq!(
        sink.entries(),
        vec![
            Entry {
                level: Level::Debug,
                message: "render ran in under 50ms".into()
            },
            Entry {
                level: Level::Warn,
                message: "upload exceeded 2s".into()
            },
        ]
    );
}

/// Templates survive a config round-trip as plain strings.
#[test]
fn template_parses_from_str() {
    let template: Template = "{{{name}}}".parse().expect("valid");
    assert_eq!(template.render(&[("name", &"x")]), "{x}");
    assert_eq!(template.to_string(), "{{{name}}}");
}
