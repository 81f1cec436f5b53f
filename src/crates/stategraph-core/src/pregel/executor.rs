//! Task executor for Pregel tasks.
//!
//! Runs the tasks of one superstep concurrently, up to the configured
//! limit, and hands their outcomes back in task order. Each task gets its
//! own retry loop, per-attempt deadline and interrupt scratchpad; none of
//! them touches the channel store.

use super::io;
use super::plan::ExecutionPlan;
use super::types::{PlannedTask, TaskOutcome, TaskResult};
use crate::command::NodeOutput;
use crate::error::{GraphError, Result};
use crate::graph::NodeKind;
use crate::retry::RetryPolicy;
use crate::runtime::{ContextParts, NodeContext, Scratchpad, SharedScratchpad};
use crate::stream::{StreamEvent, StreamMultiplexer};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use stategraph_checkpoint::{CheckpointConfig, CheckpointSaver, PendingWrite};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Channel name under which completed task output is journaled
pub(crate) const OUTPUT_WRITE: &str = "__output__";

/// Output of tasks that completed before a crash, keyed by task id
pub(crate) fn recovered_outputs(writes: &[PendingWrite]) -> HashMap<String, NodeOutput> {
    writes
        .iter()
        .filter(|(_, channel, _)| channel == OUTPUT_WRITE)
        .filter_map(|(task_id, _, value)| match serde_json::from_value(value.clone()) {
            Ok(output) => Some((task_id.clone(), output)),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Unreadable journaled task output, task will re-run");
                None
            }
        })
        .collect()
}

/// Executor for the tasks of a superstep, with retry logic.
pub(crate) struct TaskExecutor {
    pub(crate) plan: Arc<ExecutionPlan>,
    pub(crate) thread_id: String,
    pub(crate) configurable: Arc<HashMap<String, Value>>,
    pub(crate) stream: Option<Arc<StreamMultiplexer>>,
    /// Applies to nodes without their own policy
    pub(crate) retry: RetryPolicy,
    /// Applies to nodes without their own timeout
    pub(crate) task_timeout: Option<Duration>,
    pub(crate) max_concurrency: Option<usize>,
    pub(crate) cancel: CancellationToken,
    pub(crate) saver: Option<Arc<dyn CheckpointSaver>>,
}

impl TaskExecutor {
    /// Run `tasks` and return their results in task order.
    ///
    /// A fatal task error is returned after every started task finished;
    /// when several tasks fail the first one in task order wins.
    /// `journal_to` names the checkpoint completed outputs are recorded
    /// against.
    pub(crate) async fn execute(
        &self,
        tasks: Vec<PlannedTask>,
        recovered: &HashMap<String, NodeOutput>,
        journal_to: Option<&CheckpointConfig>,
    ) -> Result<Vec<TaskResult>> {
        let limit = self.max_concurrency.unwrap_or(tasks.len()).max(1);
        let results: Vec<Result<TaskResult>> = stream::iter(
            tasks
                .into_iter()
                .map(|task| self.run_task(task, recovered, journal_to)),
        )
        .buffered(limit)
        .collect()
        .await;
        results.into_iter().collect()
    }

    async fn run_task(
        &self,
        task: PlannedTask,
        recovered: &HashMap<String, NodeOutput>,
        journal_to: Option<&CheckpointConfig>,
    ) -> Result<TaskResult> {
        if self.cancel.is_cancelled() {
            debug!(task_id = %task.id, "Run cancelled, task not started");
            return Ok(TaskResult {
                task,
                outcome: TaskOutcome::Skipped,
            });
        }

        if let Some(output) = recovered.get(&task.id) {
            info!(task_id = %task.id, node = %task.node, "Reusing output journaled before restart");
            self.emit_result(&task, output.update().clone(), false);
            return Ok(TaskResult {
                task,
                outcome: TaskOutcome::Completed(output.clone()),
            });
        }

        let node = self
            .plan
            .node(&task.node)
            .ok_or_else(|| GraphError::Execution(format!("unknown node '{}'", task.node)))?;

        self.emit(StreamEvent::TaskStart {
            step: task.step,
            task_id: task.id.clone(),
            node: task.node.clone(),
            input: task.input.clone(),
            triggers: task.triggers.clone(),
        });

        let func = match &node.kind {
            NodeKind::Passthrough => {
                self.emit_result(&task, Value::Null, false);
                return Ok(TaskResult {
                    task,
                    outcome: TaskOutcome::Completed(NodeOutput::default()),
                });
            }
            NodeKind::Function(func) => func.clone(),
        };

        let policy = node.retry.as_ref().unwrap_or(&self.retry);
        let timeout = node.timeout.or(self.task_timeout);
        let scratch: SharedScratchpad = Arc::new(Mutex::new(Scratchpad::new(
            task.resume.clone(),
            task.journal.clone(),
        )));

        let mut attempt = 0;
        loop {
            attempt += 1;
            scratch.lock().begin_attempt();
            let ctx = NodeContext::new(ContextParts {
                node: task.node.clone(),
                task_id: task.id.clone(),
                step: task.step,
                thread_id: self.thread_id.clone(),
                attempt,
                configurable: self.configurable.clone(),
                failure: task.failure.clone(),
                stream: self.stream.clone(),
                scratch: scratch.clone(),
            });

            debug!(task_id = %task.id, node = %task.node, attempt, "Executing task");
            let future = func(task.input.clone(), ctx);
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, future).await {
                    Ok(result) => result,
                    Err(_) => Err(GraphError::Timeout {
                        operation: format!("node '{}'", task.node),
                        duration_ms: limit.as_millis() as u64,
                    }),
                },
                None => future.await,
            };

            let error = match result {
                Ok(output) => {
                    // An interrupt the body swallowed still suspends the task
                    let swallowed = scratch.lock().pending_interrupt.take();
                    if let Some(interrupt) = swallowed {
                        return Ok(self.suspended(task, interrupt, &scratch));
                    }
                    io::update_writes(node, task.step, output.update())?;
                    if attempt > 1 {
                        info!(task_id = %task.id, attempts = attempt, "Task succeeded after retry");
                    }
                    self.journal(journal_to, &task, &output).await;
                    self.emit_result(&task, output.update().clone(), false);
                    return Ok(TaskResult {
                        task,
                        outcome: TaskOutcome::Completed(output),
                    });
                }
                Err(GraphError::Interrupt(interrupt)) => {
                    return Ok(self.suspended(task, interrupt, &scratch));
                }
                Err(error) => error,
            };

            let will_retry = policy.allows_retry(attempt, &error);
            self.emit(StreamEvent::TaskError {
                step: task.step,
                task_id: task.id.clone(),
                node: task.node.clone(),
                error: error.to_string(),
                attempt,
                will_retry,
            });

            if will_retry {
                let delay = policy.calculate_delay(attempt - 1);
                warn!(
                    task_id = %task.id,
                    node = %task.node,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Task failed, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if node.fallback.is_some() {
                warn!(task_id = %task.id, node = %task.node, attempts = attempt, error = %error, "Task failed, taking fallback edge");
                return Ok(TaskResult {
                    task,
                    outcome: TaskOutcome::Failed {
                        error: error.to_string(),
                    },
                });
            }

            return Err(GraphError::NodeExecution {
                node: task.node.clone(),
                step: task.step,
                attempts: attempt,
                error: error.to_string(),
            });
        }
    }

    fn suspended(
        &self,
        task: PlannedTask,
        interrupt: stategraph_checkpoint::InterruptRecord,
        scratch: &SharedScratchpad,
    ) -> TaskResult {
        debug!(task_id = %task.id, interrupt_id = %interrupt.id, "Task suspended");
        self.emit_result(&task, Value::Null, true);
        let journal = scratch.lock().journal.clone();
        TaskResult {
            task,
            outcome: TaskOutcome::Suspended { interrupt, journal },
        }
    }

    async fn journal(&self, config: Option<&CheckpointConfig>, task: &PlannedTask, output: &NodeOutput) {
        let (Some(saver), Some(config)) = (&self.saver, config) else {
            return;
        };
        let value = match serde_json::to_value(output) {
            Ok(value) => value,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Could not serialize task output for the write journal");
                return;
            }
        };
        if let Err(e) = saver
            .put_writes(config, vec![(OUTPUT_WRITE.to_string(), value)], task.id.clone())
            .await
        {
            warn!(task_id = %task.id, error = %e, "Could not journal task output");
        }
    }

    fn emit_result(&self, task: &PlannedTask, update: Value, interrupted: bool) {
        self.emit(StreamEvent::TaskResult {
            step: task.step,
            task_id: task.id.clone(),
            node: task.node.clone(),
            update,
            interrupted,
        });
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(stream) = &self.stream {
            stream.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, Graph, NodeFn, NodeOptions, NodeSpec, START};
    use crate::state::{ChannelSpec, Reducer};
    use futures::FutureExt;
    use serde_json::json;
    use stategraph_checkpoint::TaskSource;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plan_with(func: NodeFn, options: NodeOptions) -> Arc<ExecutionPlan> {
        let mut graph = Graph::new();
        graph.channels.push(ChannelSpec::new("out", Reducer::Append));
        graph.nodes.push(NodeSpec {
            name: "work".into(),
            kind: NodeKind::Function(func),
            options,
        });
        graph.edges.push(Edge::Direct {
            from: START.into(),
            to: "work".into(),
        });
        Arc::new(ExecutionPlan::compile(&graph).unwrap())
    }

    fn executor(plan: Arc<ExecutionPlan>) -> TaskExecutor {
        TaskExecutor {
            plan,
            thread_id: "t".into(),
            configurable: Arc::new(HashMap::new()),
            stream: None,
            retry: RetryPolicy::none(),
            task_timeout: None,
            max_concurrency: None,
            cancel: CancellationToken::new(),
            saver: None,
        }
    }

    fn task(id: &str) -> PlannedTask {
        PlannedTask {
            id: id.into(),
            node: "work".into(),
            step: 0,
            source: TaskSource::Edge,
            triggers: vec!["branch:to:work".into()],
            input: json!({}),
            failure: None,
            resume: Vec::new(),
            journal: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let func: NodeFn = Arc::new(move |_, _| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GraphError::transient("flaky"))
                } else {
                    Ok(NodeOutput::Update(json!({"out": "done"})))
                }
            }
            .boxed()
        });
        let retry = RetryPolicy::new(3).with_initial_interval(0.001).with_jitter(false);
        let exec = executor(plan_with(func, NodeOptions::new().retry(retry)));

        let results = exec.execute(vec![task("0:work")], &HashMap::new(), None).await.unwrap();
        assert!(matches!(results[0].outcome, TaskOutcome::Completed(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let func: NodeFn = Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(GraphError::node("bad input")) }.boxed()
        });
        let exec = executor(plan_with(func, NodeOptions::new().retry(RetryPolicy::new(5))));

        let err = exec.execute(vec![task("0:work")], &HashMap::new(), None).await.unwrap_err();
        assert!(matches!(err, GraphError::NodeExecution { attempts: 1, ref node, .. } if node == "work"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let func: NodeFn = Arc::new(|_, _| {
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(NodeOutput::default())
            }
            .boxed()
        });
        let exec = executor(plan_with(func, NodeOptions::new().timeout(Duration::from_millis(10))));

        let err = exec.execute(vec![task("0:work")], &HashMap::new(), None).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_bad_update_is_fatal() {
        let func: NodeFn = Arc::new(|_, _| async { Ok(NodeOutput::Update(json!({"missing": 1}))) }.boxed());
        let exec = executor(plan_with(func, NodeOptions::new()));

        let err = exec.execute(vec![task("0:work")], &HashMap::new(), None).await.unwrap_err();
        assert!(matches!(err, GraphError::NodeReturnShape { .. }));
    }

    #[tokio::test]
    async fn test_results_keep_task_order() {
        let func: NodeFn = Arc::new(|input: Value, _| {
            async move {
                let delay = input["delay"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(NodeOutput::Update(json!({"out": delay})))
            }
            .boxed()
        });
        let exec = executor(plan_with(func, NodeOptions::new()));
        let mut slow = task("0:slow");
        slow.input = json!({"delay": 30});
        let mut fast = task("0:fast");
        fast.input = json!({"delay": 1});

        let results = exec.execute(vec![slow, fast], &HashMap::new(), None).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.task.id.as_str()).collect();
        assert_eq!(ids, vec!["0:slow", "0:fast"]);
    }

    #[tokio::test]
    async fn test_swallowed_interrupt_still_suspends() {
        let func: NodeFn = Arc::new(|_, ctx: NodeContext| {
            async move {
                let _ = ctx.interrupt(json!("ignored?"));
                Ok(NodeOutput::default())
            }
            .boxed()
        });
        let exec = executor(plan_with(func, NodeOptions::new()));

        let results = exec.execute(vec![task("0:work")], &HashMap::new(), None).await.unwrap();
        assert!(results[0].outcome.is_suspended());
    }

    #[tokio::test]
    async fn test_cancelled_tasks_are_skipped() {
        let func: NodeFn = Arc::new(|_, _| async { Ok(NodeOutput::default()) }.boxed());
        let exec = executor(plan_with(func, NodeOptions::new()));
        exec.cancel.cancel();

        let results = exec.execute(vec![task("0:work")], &HashMap::new(), None).await.unwrap();
        assert!(matches!(results[0].outcome, TaskOutcome::Skipped));
    }

    #[test]
    fn test_recovered_outputs_filter_journal() {
        let output = serde_json::to_value(NodeOutput::Update(json!({"out": 1}))).unwrap();
        let writes = vec![
            ("1:a".to_string(), OUTPUT_WRITE.to_string(), output),
            ("1:b".to_string(), "other".to_string(), json!(1)),
        ];
        let recovered = recovered_outputs(&writes);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered["1:a"].update(), &json!({"out": 1}));
    }
}
