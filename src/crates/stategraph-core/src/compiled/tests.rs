//! Tests for CompiledGraph
//!
//! Entry-point behaviour: configuration errors, access hooks, snapshots and
//! state edits. Scheduling properties live in the crate's integration tests.

#[cfg(test)]
mod tests {
    use crate::auth::{AccessAction, AccessRequest};
    use crate::error::GraphError;
    use crate::stream::{StreamEvent, StreamMode};
    use crate::{CompiledGraph, Reducer, RunConfig, StateGraph, END, START};
    use futures::StreamExt;
    use serde_json::json;
    use stategraph_checkpoint::{CheckpointSaver, CheckpointSource, InMemoryCheckpointSaver};
    use std::sync::Arc;

    fn pipeline() -> StateGraph {
        let mut graph = StateGraph::new();
        graph
            .add_channel("log", Reducer::Append)
            .add_node("a", |_, _| async { Ok(json!({"log": ["A"]})) })
            .add_node("b", |_, _| async { Ok(json!({"log": ["B"]})) })
            .add_node("c", |_, _| async { Ok(json!({"log": ["C"]})) })
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", "c")
            .add_edge("c", END);
        graph
    }

    fn with_saver(graph: StateGraph) -> (CompiledGraph, Arc<InMemoryCheckpointSaver>) {
        let saver = Arc::new(InMemoryCheckpointSaver::new());
        let compiled = graph.compile().unwrap().with_checkpointer(saver.clone());
        (compiled, saver)
    }

    #[tokio::test]
    async fn test_invoke_without_checkpointer() {
        let compiled = pipeline().compile().unwrap();
        let outcome = compiled.invoke(json!({}), RunConfig::default()).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(outcome.state["log"], json!(["A", "B", "C"]));
        assert!(outcome.checkpoint.is_none());
    }

    #[tokio::test]
    async fn test_resume_requires_thread_id() {
        let (compiled, _) = with_saver(pipeline());
        let err = compiled.resume("yes", RunConfig::default()).await.unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_update_state_requires_checkpointer() {
        let compiled = pipeline().compile().unwrap();
        let err = compiled
            .update_state(&RunConfig::new("t"), json!({"log": ["X"]}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_get_state_without_checkpointer_is_none() {
        let compiled = pipeline().compile().unwrap();
        assert!(compiled.get_state(&RunConfig::new("t")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_access_hook_denies_every_entry_point() {
        let (compiled, saver) = with_saver(pipeline());
        let compiled = compiled.with_access_hook(|request: &AccessRequest| {
            if request.configurable.get("user") == Some(&json!("owner")) {
                Ok(())
            } else {
                Err(format!("{} needs the owner", request.action))
            }
        });

        let owner = RunConfig::new("t-auth").with_configurable("user", json!("owner"));
        let guest = RunConfig::new("t-auth").with_configurable("user", json!("guest"));
        compiled.invoke(json!({}), owner.clone()).await.unwrap();

        let denied = [
            compiled.invoke(json!({}), guest.clone()).await.err(),
            compiled.resume("yes", guest.clone()).await.err(),
            compiled.stream(json!({}), guest.clone(), &[]).await.err(),
            compiled.get_state(&guest).await.err(),
            compiled.get_state_history(&guest, None, None).await.err(),
            compiled.update_state(&guest, json!({"log": ["X"]}), None).await.err(),
        ];
        let actions: Vec<String> = denied
            .into_iter()
            .map(|err| match err {
                Some(GraphError::AccessDenied { action, thread_id, reason }) => {
                    assert_eq!(thread_id, "t-auth");
                    assert!(reason.ends_with("needs the owner"));
                    action
                }
                other => panic!("expected AccessDenied, got {:?}", other),
            })
            .collect();
        assert_eq!(
            actions,
            vec!["invoke", "resume", "stream", "get_state", "get_state_history", "update_state"]
        );

        // Denied calls left the thread alone
        assert_eq!(saver.history("t-auth").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_hook_sees_generated_thread_id() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = seen.clone();
        let compiled = pipeline().compile().unwrap().with_access_hook(move |request: &AccessRequest| {
            record.lock().push((request.action, request.thread_id.clone()));
            Ok(())
        });

        compiled.invoke(json!({}), RunConfig::default()).await.unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, AccessAction::Invoke);
        assert!(uuid::Uuid::parse_str(&seen[0].1).is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_lists_next_nodes() {
        let mut graph = pipeline();
        graph.interrupt_before(["b"]);
        let (compiled, _) = with_saver(graph);
        let config = RunConfig::new("t-next");

        let outcome = compiled.invoke(json!({}), config.clone()).await.unwrap();
        assert!(outcome.is_interrupted());

        let snapshot = compiled.get_state(&config).await.unwrap().unwrap();
        assert_eq!(snapshot.next, vec!["b".to_string()]);
        assert_eq!(snapshot.values["log"], json!(["A"]));
        assert_eq!(snapshot.interrupts.len(), 1);
        assert_eq!(snapshot.step, 1);

        compiled.resume(json!(null), config.clone()).await.unwrap();
        let done = compiled.get_state(&config).await.unwrap().unwrap();
        assert!(done.next.is_empty());
        assert_eq!(done.values["log"], json!(["A", "B", "C"]));
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let (compiled, _) = with_saver(pipeline());
        let config = RunConfig::new("t-hist");
        compiled.invoke(json!({}), config.clone()).await.unwrap();

        let history: Vec<_> = compiled
            .get_state_history(&config, None, None)
            .await
            .unwrap()
            .collect()
            .await;
        let steps: Vec<i64> = history.into_iter().map(|s| s.unwrap().step).collect();
        assert_eq!(steps, vec![2, 1, 0]);

        let limited: Vec<_> = compiled
            .get_state_history(&config, None, Some(1))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_update_state_merges_through_reducers() {
        let (compiled, saver) = with_saver(pipeline());
        let config = RunConfig::new("t-edit");
        compiled.invoke(json!({}), config.clone()).await.unwrap();

        compiled
            .update_state(&config, json!({"log": ["edit"]}), None)
            .await
            .unwrap();
        let latest = saver
            .get_tuple(&stategraph_checkpoint::CheckpointConfig::for_thread("t-edit"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.metadata.source, Some(CheckpointSource::Update));
        assert_eq!(latest.checkpoint.seq, 4);
        assert_eq!(
            latest.checkpoint.channel_values.get("log"),
            Some(&json!(["A", "B", "C", "edit"]))
        );
    }

    #[tokio::test]
    async fn test_update_state_as_unknown_node() {
        let (compiled, _) = with_saver(pipeline());
        let err = compiled
            .update_state(&RunConfig::new("t"), json!({}), Some("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Configuration(ref m) if m.contains("ghost")));
    }

    #[tokio::test]
    async fn test_stream_ends_with_run_error() {
        let mut graph = StateGraph::new();
        graph
            .add_channel("status", Reducer::LastValue)
            .add_node("left", |_, _| async { Ok(json!({"status": "l"})) })
            .add_node("right", |_, _| async { Ok(json!({"status": "r"})) })
            .add_edge(START, "left")
            .add_edge(START, "right");
        let compiled = graph.compile().unwrap();

        let items: Vec<_> = compiled
            .stream(json!({}), RunConfig::default(), &[StreamMode::Tasks])
            .await
            .unwrap()
            .collect()
            .await;
        let (last, chunks) = items.split_last().unwrap();
        assert!(matches!(last, Err(GraphError::ConcurrentUpdate { channel, step: 0 }) if channel == "status"));
        assert!(chunks
            .iter()
            .all(|c| matches!(c.as_ref().unwrap().event, StreamEvent::TaskStart { .. } | StreamEvent::TaskResult { .. })));
    }

    #[tokio::test]
    async fn test_dropped_stream_leaves_run_going() {
        let (compiled, saver) = with_saver(pipeline());
        let stream = compiled
            .stream(json!({}), RunConfig::new("detached"), &[StreamMode::Values])
            .await
            .unwrap();
        drop(stream);

        let mut saved = 0;
        for _ in 0..200 {
            saved = saver.history("detached").await.unwrap().len();
            if saved == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(saved, 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_a_streamed_run() {
        let mut graph = StateGraph::new();
        graph
            .add_channel("log", Reducer::Append)
            .add_node("slow", |_, _| async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Ok(json!({"log": ["slow"]}))
            })
            .add_edge(START, "slow")
            .add_edge("slow", END);
        let (compiled, saver) = with_saver(graph);

        let token = crate::CancellationToken::new();
        let stream = compiled
            .stream(
                json!({}),
                RunConfig::new("stopped").with_cancellation(token.clone()),
                &[StreamMode::Values],
            )
            .await
            .unwrap();
        drop(stream);
        token.cancel();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(saver.history("stopped").await.unwrap().is_empty());
    }
}
