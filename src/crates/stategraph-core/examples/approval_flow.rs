//! Approval flow example
//!
//! This example demonstrates a human-in-the-loop workflow: a draft is
//! written, a reviewer is asked for approval through an interrupt, and the
//! run is resumed from a file-backed checkpoint, as a second process would.
//!
//! Run with `RUST_LOG=stategraph_core=debug` to see the scheduler trace.

use futures::StreamExt;
use serde_json::{json, Value};
use stategraph_core::{
    FileCheckpointSaver, Reducer, RunConfig, StateGraph, StreamEvent, StreamMode, END, START,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn build_graph() -> StateGraph {
    let mut graph = StateGraph::new();
    graph.add_channel("topic", Reducer::LastValue);
    graph.add_channel("draft", Reducer::LastValue);
    graph.add_channel("log", Reducer::Append);

    graph.add_node("write", |state: Value, ctx| async move {
        let topic = state["topic"].as_str().unwrap_or("nothing").to_string();
        for word in ["Notes", "on", topic.as_str()] {
            ctx.emit_token(format!("{} ", word));
        }
        Ok(json!({"draft": format!("Notes on {}", topic), "log": ["write"]}))
    });

    graph.add_node("review", |state: Value, ctx| async move {
        let verdict = ctx.interrupt(json!({"q": "approve?", "draft": state["draft"]}))?;
        Ok(json!({"log": [format!("review:{}", verdict.as_str().unwrap_or("?"))]}))
    });

    graph.add_node("publish", |_, _| async { Ok(json!({"log": ["publish"]})) });

    graph
        .add_edge(START, "write")
        .add_edge("write", "review")
        .add_edge("review", "publish")
        .add_edge("publish", END);
    graph
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Approval Flow Example ===\n");

    let dir = tempfile::tempdir()?;
    let config = RunConfig::new("article-7");

    // First process: run until the reviewer is asked
    {
        let saver = Arc::new(FileCheckpointSaver::open(dir.path()).await?);
        let compiled = build_graph().compile()?.with_checkpointer(saver);

        let mut stream = compiled
            .stream(json!({"topic": "supersteps"}), config.clone(), &[StreamMode::Messages, StreamMode::Updates])
            .await?;
        while let Some(chunk) = stream.next().await {
            match chunk?.event {
                StreamEvent::Token { text, .. } => print!("{}", text),
                StreamEvent::Updates { node, update, .. } => println!("\n[{}] {}", node, update),
                StreamEvent::Interrupt { interrupts, .. } => {
                    for slot in interrupts {
                        println!("Waiting on {} ({}): {}", slot.node, slot.id, slot.value);
                    }
                }
                _ => {}
            }
        }
    }

    // Second process: inspect the suspended thread and approve
    let saver = Arc::new(FileCheckpointSaver::open(dir.path()).await?);
    let compiled = build_graph().compile()?.with_checkpointer(saver);

    if let Some(snapshot) = compiled.get_state(&config).await? {
        println!("\nSuspended at step {}, next: {:?}", snapshot.step, snapshot.next);
    }

    let outcome = compiled.resume("yes", config.clone()).await?;
    println!("Status: {:?}", outcome.status);
    println!("Final state: {}", outcome.state);

    println!("\nHistory (newest first):");
    let mut history = compiled.get_state_history(&config, None, None).await?;
    while let Some(snapshot) = history.next().await {
        let snapshot = snapshot?;
        println!("  step {:>2}  next {:?}", snapshot.step, snapshot.next);
    }

    Ok(())
}
