//! Integration tests for tracing through a context
//!
//! These tests drive the public API the way instrumented applications do:
//! a trace is injected once, then fetched at every call boundary.

use calltrace::clock::ManualClock;
use calltrace::{demo, fetch, inject, Context, Trace};
use regex::Regex;
use std::time::Duration;

const MS: Duration = Duration::from_millis(1);

/// Names of the rendered calls, in report order
fn call_names(report: &str) -> Vec<String> {
    let line = Regex::new(r"(?m)^\tcall (\S+?)(?: \[[^\]]*\])?: ").unwrap();
    line.captures_iter(report)
        .map(|captures| captures[1].to_string())
        .collect()
}

/// Replace every rendered duration with a fixed marker
fn stabilize(report: &str) -> String {
    let duration = Regex::new(r"\d+(\.\d+)?(ns|µs|ms|s)").unwrap();
    duration.replace_all(report, "<d>").into_owned()
}

#[inline(never)]
fn trace_root(ctx: &Context) {
    let call = fetch(ctx).start().mark("root");

    call.checkpoint_with(["checkpointA"]);
    trace_a(ctx);

    call.checkpoint_with(["checkpointB"]);
    trace_b(ctx);

    call.stop();
}

#[inline(never)]
fn trace_a(ctx: &Context) {
    let call = fetch(ctx).start().mark("A").stop_on_drop();

    call.checkpoint_with(["checkpointA1"]);
    trace_a1(ctx);

    call.checkpoint_with(["checkpointA2"]);
    trace_a2(ctx);
}

// Each function labels its call differently. Optimized builds merge
// functions with identical machine code, and merged functions share a name.
#[inline(never)]
fn trace_a1(ctx: &Context) {
    let _call = fetch(ctx).start_with(["a1"]).stop_on_drop();
    (|ctx: &Context| {
        let _call = fetch(ctx).start_with(["a1 inner"]).stop_on_drop();
    })(ctx);
}

#[inline(never)]
fn trace_a2(ctx: &Context) {
    let _call = fetch(ctx).start_with(["a2"]).stop_on_drop();
}

#[inline(never)]
fn trace_b(ctx: &Context) {
    let call = fetch(ctx).start().mark("B").stop_on_drop();

    call.checkpoint_with(["checkpointB1"]);
    trace_b1(ctx);

    call.checkpoint_with(["checkpointB2"]);
    (|ctx: &Context| {
        let _call = fetch(ctx).start_with(["b inner"]).stop_on_drop();
    })(ctx);
}

#[inline(never)]
fn trace_b1(ctx: &Context) {
    let _call = fetch(ctx).start_with(["b1"]).stop_on_drop();
    (|ctx: &Context| {
        let _call = fetch(ctx).start_with(["b1 inner"]).stop_on_drop();
    })(ctx);
}

#[inline(always)]
fn trace_inlined(ctx: &Context) {
    let _call = fetch(ctx).start_with(["inlined"]).stop_on_drop();
}

#[test]
fn test_nested_calls_render_in_start_order() {
    let ctx = inject(&Context::background(), 9);
    trace_root(&ctx);

    let trace = fetch(&ctx);
    assert_eq!(trace.len(), 9);
    assert_eq!(trace.allocates(), 0);

    let report = trace.to_string();
    assert_eq!(
        call_names(&report),
        [
            "trace_root",
            "trace_a",
            "trace_a1",
            "trace_a1::{{closure}}",
            "trace_a2",
            "trace_b",
            "trace_b1",
            "trace_b1::{{closure}}",
            "trace_b::{{closure}}",
        ],
        "{}",
        report
    );
    assert!(report.contains("\tcall trace_root [root]: "));
    assert!(report.contains("\tcall trace_a [A]: "));
    assert!(report.contains("\tcall trace_b [B]: "));
    for checkpoint in ["checkpointA", "checkpointB", "checkpointA1", "checkpointB2"] {
        assert!(report.contains(&format!("\t\tcheckpoint [{}]: ", checkpoint)));
    }
}

#[test]
fn test_inlined_functions_keep_their_names() {
    let ctx = inject(&Context::background(), 2);
    trace_inlined(&ctx);
    (|ctx: &Context| {
        let _call = fetch(ctx).start_with(["closure"]).stop_on_drop();
    })(&ctx);

    let report = fetch(&ctx).to_string();
    assert_eq!(
        call_names(&report),
        [
            "trace_inlined",
            "test_inlined_functions_keep_their_names::{{closure}}"
        ],
        "{}",
        report
    );
}

#[test]
fn test_nested_calls_overflow_reserved_capacity() {
    let ctx = inject(&Context::background(), 4);
    trace_root(&ctx);

    let trace = fetch(&ctx);
    assert_eq!(trace.len(), 9);
    assert!(trace.allocates() >= 1);
    assert!(trace
        .to_string()
        .starts_with(&format!("allocates at call stack: {},", trace.allocates())));
}

#[test]
fn test_untraced_context_runs_silently() {
    let ctx = Context::background();
    trace_root(&ctx);
    assert!(fetch(&ctx).is_inert());
    assert_eq!(fetch(&ctx).to_string(), "");
}

#[test]
fn test_end_to_end_with_reserved_capacity() {
    let clock = ManualClock::new();
    let trace = Trace::with_capacity(2).with_clock(clock.clone());

    let root = trace.start_with(["root"]);
    clock.advance(MS);
    root.checkpoint_with(["c1"]);

    let child = trace.start_with(["child"]);
    clock.advance(MS);
    child.stop();

    root.checkpoint_with(["c2"]);
    root.stop();

    let report = trace.to_string();
    assert!(report.starts_with("allocates at call stack: 0, detailed call stack:"));
    assert!(report.contains("[root]: 2ms, allocates: 1"), "{}", report);
    assert!(report.contains("[child]: 1ms, allocates: 0"), "{}", report);
    assert!(report.contains("\t\tcheckpoint [c1]: 1ms"), "{}", report);
    assert!(report.contains("\t\tcheckpoint [c2]: 1ms"), "{}", report);
    assert_eq!(report, trace.to_string());
}

#[test]
fn test_request_pipeline_report() {
    let ctx = inject(&Context::background(), 10);
    demo::handle(
        &ctx,
        "ca7a87c4-58d0-4fdf-857c-ef49fc3bf271",
        demo::SAMPLE_BODY,
        MS,
    )
    .unwrap();

    assert_eq!(
        stabilize(&fetch(&ctx).to_string()),
        "allocates at call stack: 0, detailed call stack:\
         \n\tcall handle [ca7a87c4-58d0-4fdf-857c-ef49fc3bf271]: <d>, allocates: 1\
         \n\t\tcheckpoint [serialize]: <d>\
         \n\t\tcheckpoint [store]: <d>\
         \n\tcall fetch_data: <d>, allocates: 0\
         \n\tcall store: <d>, allocates: 0"
    );
}

#[test]
fn test_request_pipeline_durations_add_up() {
    let ctx = inject(&Context::background(), 3);
    demo::handle(&ctx, "req", demo::SAMPLE_BODY, MS).unwrap();

    let report = fetch(&ctx).to_string();
    // handle sleeps 1ms, fetch_data 1ms, then 1ms, then store 10ms
    let handle = Regex::new(r"call handle \[req\]: (\d+(?:\.\d+)?)ms").unwrap();
    let millis: f64 = handle.captures(&report).expect("handle in ms")[1]
        .parse()
        .unwrap();
    assert!(millis >= 13.0, "{}", report);
}

#[test]
fn test_one_trace_per_request() {
    let first = inject(&Context::background(), 3);
    let second = inject(&Context::background(), 3);

    demo::handle(&first, "first", demo::SAMPLE_BODY, Duration::ZERO).unwrap();
    demo::handle(&second, "second", demo::SAMPLE_BODY, Duration::ZERO).unwrap();

    let first = fetch(&first).to_string();
    let second = fetch(&second).to_string();
    assert!(first.contains("[first]") && !first.contains("[second]"));
    assert!(second.contains("[second]") && !second.contains("[first]"));
}

#[test]
fn test_threads_trace_independently() {
    let handles: Vec<_> = (0..4)
        .map(|n| {
            std::thread::spawn(move || {
                let ctx = inject(&Context::background(), 3);
                let id = format!("thread-{}", n);
                demo::handle(&ctx, &id, demo::SAMPLE_BODY, Duration::ZERO).unwrap();
                fetch(&ctx).to_string()
            })
        })
        .collect();

    for (n, handle) in handles.into_iter().enumerate() {
        let report = handle.join().unwrap();
        assert!(report.contains(&format!("[thread-{}]", n)));
        assert_eq!(call_names(&report), ["handle", "fetch_data", "store"]);
    }
}
