//! Property-based tests for the call recorder, the extractor and the graph
//!
//! Designed to run under 30 seconds as a pre-commit quality gate.
//!
//! Core properties:
//! 1. Recorded call trees mirror the nesting that produced them
//! 2. Abandoned calls never reach the latency accumulator
//! 3. The extractor never panics and numbers sites 0..n in text order
//! 4. Balanced generated calls get the arity they were generated with
//! 5. Building the graph twice from the same revisions gives the same graph

use chrono::{TimeZone, Utc};
use fansy_tracer::call_record::CallId;
use fansy_tracer::call_store::CallStore;
use fansy_tracer::clock::ManualClock;
use fansy_tracer::dependency_graph::DependencyGraph;
use fansy_tracer::extractor::{extract, Arity};
use fansy_tracer::function_def::{FunctionDefinition, FunctionId, Parameter};
use fansy_tracer::recorder::{CallRecorder, Completion, ExecutionContext};
use proptest::prelude::*;
use std::sync::Arc;

/// Nested call shape: a function index and its children
#[derive(Debug, Clone)]
struct CallShape {
    function: u8,
    children: Vec<CallShape>,
}

fn call_shape() -> impl Strategy<Value = CallShape> {
    let leaf = (0u8..6).prop_map(|function| CallShape {
        function,
        children: vec![],
    });
    leaf.prop_recursive(4, 32, 4, |inner| {
        ((0u8..6), prop::collection::vec(inner, 0..4))
            .prop_map(|(function, children)| CallShape { function, children })
    })
}

fn play(
    recorder: &CallRecorder,
    clock: &ManualClock,
    ctx: &mut ExecutionContext,
    shape: &CallShape,
) -> CallId {
    let id = recorder
        .start_call(ctx, FunctionId::new("M", format!("F{}", shape.function)), None, vec![])
        .unwrap();
    clock.advance(1);
    for child in &shape.children {
        play(recorder, clock, ctx, child);
    }
    clock.advance(1);
    recorder.end_call(ctx, id, Completion::success()).unwrap();
    id
}

fn flatten(shape: &CallShape, depth: usize, out: &mut Vec<(usize, String)>) {
    out.push((depth, format!("F{}", shape.function)));
    for child in &shape.children {
        flatten(child, depth + 1, out);
    }
}

fn count(shape: &CallShape) -> usize {
    1 + shape.children.iter().map(count).sum::<usize>()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_call_tree_mirrors_nesting(shape in call_shape()) {
        let store = Arc::new(CallStore::with_limits(10_000, 10_000));
        let clock = Arc::new(ManualClock::new(0));
        let recorder = CallRecorder::new(store.clone(), clock.clone());
        let mut ctx = ExecutionContext::new("doc");

        let root = play(&recorder, &clock, &mut ctx, &shape);

        let mut expected = Vec::new();
        flatten(&shape, 0, &mut expected);
        let walked: Vec<(usize, String)> = store
            .subtree(root)
            .map(|e| (e.depth, e.record.function.name))
            .collect();
        prop_assert_eq!(walked, expected);

        // Children lie inside their parent's interval
        for entry in store.subtree(root) {
            if let Some(parent) = entry.record.parent {
                let parent = store.get(parent).unwrap();
                prop_assert!(entry.record.start >= parent.start);
                prop_assert!(entry.record.end.unwrap() <= parent.end.unwrap());
            }
        }

        let totals = store.snapshot_stats().totals();
        prop_assert_eq!(totals.total_calls as usize, count(&shape));
        prop_assert_eq!(ctx.depth(), 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_abandoned_calls_excluded_from_latency(depth in 1usize..10, abort_at in 0usize..10) {
        let store = Arc::new(CallStore::with_limits(1_000, 1_000));
        let clock = Arc::new(ManualClock::new(0));
        let recorder = CallRecorder::new(store.clone(), clock.clone());
        let mut ctx = ExecutionContext::new("doc");

        let ids: Vec<_> = (0..depth)
            .map(|i| {
                clock.advance(10);
                recorder
                    .start_call(&mut ctx, FunctionId::new("M", format!("F{}", i)), None, vec![])
                    .unwrap()
            })
            .collect();
        let target = abort_at.min(depth - 1);
        let unwound = recorder
            .end_call(&mut ctx, ids[target], Completion::failed("error"))
            .unwrap();
        prop_assert_eq!(unwound.len(), depth - 1 - target);

        let stats = store.snapshot_stats();
        let totals = stats.totals();
        prop_assert_eq!(totals.total_abandoned as usize, depth - 1 - target);
        for (function, s) in stats.entries() {
            prop_assert_eq!(s.latency.count, s.total_calls - s.abandoned_calls, "{}", function);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_extractor_never_panics(body in "\\PC{0,200}") {
        let sites: Vec<_> = extract(&body).collect();
        for (i, site) in sites.iter().enumerate() {
            prop_assert_eq!(site.ordinal, i);
            prop_assert!(site.line >= 1);
            prop_assert!(site.offset <= body.len());
        }
    }

    #[test]
    fn prop_extractor_handles_delimiter_soup(body in "[A-Za-z_(),;'\"/* \n]{0,120}") {
        let sites: Vec<_> = extract(&body).collect();
        // Offsets increase with ordinals
        for pair in sites.windows(2) {
            prop_assert!(pair[0].offset < pair[1].offset);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_generated_call_arity(
        name in "Fn_[A-Za-z0-9_]{0,12}",
        arg_count in 1usize..12,
        nested_at in 0usize..12,
    ) {
        let args: Vec<String> = (0..arg_count)
            .map(|i| if i == nested_at { "Inner(x, y)".to_string() } else { format!("%a{}", i) })
            .collect();
        let body = format!("res := {}({});", name, args.join(", "));
        let sites: Vec<_> = extract(&body).collect();

        prop_assert_eq!(&sites[0].callee, &name);
        prop_assert_eq!(sites[0].arity, Arity::Resolved(arg_count));
        if nested_at < arg_count {
            prop_assert_eq!(sites.len(), 2);
            prop_assert_eq!(sites[1].arity, Arity::Resolved(2));
        } else {
            prop_assert_eq!(sites.len(), 1);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_graph_rebuild_is_idempotent(
        calls in prop::collection::vec(prop::collection::vec((0usize..6, 0usize..4), 0..5), 6),
    ) {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let defs: Vec<FunctionDefinition> = calls
            .iter()
            .enumerate()
            .map(|(i, body_calls)| {
                let body: String = body_calls
                    .iter()
                    .map(|(callee, argc)| {
                        let args = vec!["x"; *argc].join(", ");
                        format!("F{}({});\n", callee, args)
                    })
                    .collect();
                FunctionDefinition::new(
                    FunctionId::new(if i % 2 == 0 { "A" } else { "B" }, format!("F{}", i)),
                    vec![Parameter::required("x")],
                    body,
                    at,
                )
            })
            .collect();

        let first = DependencyGraph::build(&defs, at);
        let second = DependencyGraph::build(&defs, at);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.find_cycles(4, 100), second.find_cycles(4, 100));

        // Every extracted site is either an edge or an external call
        let total_sites: usize = calls.iter().map(Vec::len).sum();
        let stats = first.stats();
        prop_assert_eq!(stats.call_sites + stats.external_calls, total_sites);
    }
}
