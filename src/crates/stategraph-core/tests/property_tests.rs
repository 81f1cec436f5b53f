//! Property tests for merge semantics
//!
//! Parallel writes are never lost and land in task order whatever the
//! completion order, and accumulating reducers give the same result no
//! matter how the writes are grouped into supersteps.

use proptest::prelude::*;
use serde_json::{json, Value};
use stategraph_core::{
    ConditionalEdgeResult, InMemoryCheckpointSaver, Reducer, RunConfig, Send, StateGraph, START,
};
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// split fans out one `worker` task per item; each sleeps its own delay
fn fan_out() -> StateGraph {
    let mut graph = StateGraph::new();
    graph.add_channel("items", Reducer::LastValue);
    graph.add_channel("seen", Reducer::Append);
    graph.add_channel_with_default("total", Reducer::Sum, json!(0));
    graph.add_passthrough("split");
    graph.add_node("worker", |input: Value, _| async move {
        let delay = input["delay"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(json!({"seen": [input["value"].clone()], "total": input["value"].clone()}))
    });
    graph.add_edge(START, "split");
    graph.add_conditional_edges(
        "split",
        |state: &Value| {
            let items = state["items"].as_array().cloned().unwrap_or_default();
            ConditionalEdgeResult::Send(items.into_iter().map(|item| Send::new("worker", item)).collect())
        },
        ["worker"],
    );
    graph
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_parallel_writes_are_kept_in_task_order(
        items in prop::collection::vec((-1000i64..1000, 0u64..4), 0..10)
    ) {
        let compiled = fan_out().compile().unwrap();
        let input: Vec<Value> = items
            .iter()
            .map(|(value, delay)| json!({"value": value, "delay": delay}))
            .collect();

        let outcome = runtime()
            .block_on(compiled.invoke(json!({"items": input}), RunConfig::default()))
            .unwrap();

        let expected: Vec<i64> = items.iter().map(|(value, _)| *value).collect();
        let seen: Vec<i64> = outcome.state["seen"]
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        prop_assert_eq!(seen, expected.clone());
        prop_assert_eq!(outcome.state["total"].as_i64(), Some(expected.iter().sum::<i64>()));
    }

    #[test]
    fn prop_accumulation_ignores_grouping(
        batches in prop::collection::vec(prop::collection::vec(-50i64..50, 0..5), 1..6)
    ) {
        let build = || {
            let mut graph = StateGraph::new();
            graph.add_channel("seen", Reducer::Append);
            graph.add_channel_with_default("total", Reducer::Sum, json!(0));
            graph.add_passthrough("noop");
            graph.add_edge(START, "noop");
            graph
                .compile()
                .unwrap()
                .with_checkpointer(Arc::new(InMemoryCheckpointSaver::new()))
        };
        let rt = runtime();

        let grouped = build();
        for batch in &batches {
            let total: i64 = batch.iter().sum();
            rt.block_on(grouped.invoke(json!({"seen": batch, "total": total}), RunConfig::new("grouped")))
                .unwrap();
        }
        let grouped = rt
            .block_on(grouped.get_state(&RunConfig::new("grouped")))
            .unwrap()
            .unwrap()
            .values;

        let flat: Vec<i64> = batches.iter().flatten().copied().collect();
        let once = rt
            .block_on(build().invoke(
                json!({"seen": flat, "total": flat.iter().sum::<i64>()}),
                RunConfig::new("once"),
            ))
            .unwrap()
            .state;

        prop_assert_eq!(&grouped["seen"], &once["seen"]);
        prop_assert_eq!(&grouped["total"], &once["total"]);
    }
}
