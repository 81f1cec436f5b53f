//! Graph compiler: validation and the immutable execution plan
//!
//! Compilation turns the edge list of a [`Graph`] into channels. Each node
//! gets a trigger channel; direct and conditional edges write to it, join
//! edges write to a named barrier, fallback edges write the failure to a
//! dedicated channel. Planning a superstep then only needs to ask which
//! trigger channels changed since a node last ran.
//!
//! | Channel | Name | Kind |
//! |---------|------|------|
//! | trigger | `branch:to:{node}` | ephemeral, several writers |
//! | join barrier | `join:{a}+{b}:to:{node}` | named barrier |
//! | fallback | `fallback:{from}:to:{node}` | ephemeral, several writers |
//! | fan-out | `__tasks__` | per-superstep topic |
//!
//! Checks run in a fixed order and stop at the first problem, so the same
//! definition always yields the same error.

use crate::error::CompileError;
use crate::graph::{Branch, Edge, Graph, NodeKind, END, START, TASKS};
use crate::interrupt::InterruptConfig;
use crate::retry::RetryPolicy;
use crate::state::ChannelSpec;
use stategraph_checkpoint::{Channel, EphemeralValueChannel, NamedBarrierValueChannel, TopicChannel};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

/// Trigger channel of `node`
pub(crate) fn trigger_channel(node: &str) -> String {
    format!("branch:to:{}", node)
}

fn join_channel(sources: &[String], target: &str) -> String {
    format!("join:{}:to:{}", sources.join("+"), target)
}

fn fallback_channel(from: &str, to: &str) -> String {
    format!("fallback:{}:to:{}", from, to)
}

/// Whether a user supplied node or channel name collides with engine names
fn is_reserved(name: &str) -> bool {
    name == START || name == END || name.starts_with("__") || name.contains(':') || name.contains('+')
}

/// Write performed when a node completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Successor {
    /// Write the source name to a trigger channel
    Trigger { channel: String },
    /// Mark `member` as arrived at a join barrier
    Barrier { channel: String, member: String },
}

/// Outgoing routing of a node or of START
#[derive(Debug, Clone, Default)]
pub(crate) struct Routing {
    pub(crate) successors: Vec<Successor>,
    pub(crate) branches: Vec<Branch>,
}

/// Channels the compiler adds next to the user's state
#[derive(Debug, Clone)]
pub(crate) enum InternalChannel {
    Trigger,
    Barrier(Vec<String>),
    Fallback,
    Tasks,
}

impl InternalChannel {
    pub(crate) fn build(&self) -> Box<dyn Channel> {
        match self {
            InternalChannel::Trigger | InternalChannel::Fallback => {
                Box::new(EphemeralValueChannel::new_unguarded())
            }
            InternalChannel::Barrier(names) => Box::new(NamedBarrierValueChannel::new(names.clone())),
            InternalChannel::Tasks => Box::new(TopicChannel::per_step()),
        }
    }

    /// Whether the channel forgets its value at the next superstep
    pub(crate) fn expires(&self) -> bool {
        !matches!(self, InternalChannel::Barrier(_))
    }
}

/// Compiled form of a node
#[derive(Debug, Clone)]
pub(crate) struct PlanNode {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    /// Channels whose update schedules the node
    pub(crate) triggers: Vec<String>,
    /// Fallback channels among the triggers
    pub(crate) fallback_triggers: Vec<String>,
    pub(crate) reads: Option<Vec<String>>,
    pub(crate) writes: BTreeSet<String>,
    pub(crate) destinations: BTreeSet<String>,
    pub(crate) routing: Routing,
    /// Channel written when the node exhausts its retries
    pub(crate) fallback: Option<String>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) timeout: Option<Duration>,
}

/// Immutable result of compiling a graph
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub(crate) channels: Vec<ChannelSpec>,
    pub(crate) internal: Vec<(String, InternalChannel)>,
    pub(crate) nodes: Vec<PlanNode>,
    index: HashMap<String, usize>,
    pub(crate) start: Routing,
    pub(crate) interrupts: InterruptConfig,
}

impl ExecutionPlan {
    /// Validate `graph` and build its plan
    pub fn compile(graph: &Graph) -> Result<Self, CompileError> {
        let node_names: HashSet<&str> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
        let channel_names: HashSet<&str> = graph.channels.iter().map(|c| c.name.as_str()).collect();
        let is_node = |name: &str| node_names.contains(name);

        for node in &graph.nodes {
            if is_reserved(&node.name) {
                return Err(CompileError::ReservedName(node.name.clone()));
            }
        }
        for channel in &graph.channels {
            if is_reserved(&channel.name) {
                return Err(CompileError::ReservedName(channel.name.clone()));
            }
        }

        // Edges
        for edge in &graph.edges {
            match edge {
                Edge::Direct { from, to } => {
                    if from == END {
                        return Err(CompileError::EdgeFromEnd { to: to.clone() });
                    }
                    if to == START {
                        return Err(CompileError::EdgeToStart { from: from.clone() });
                    }
                    for endpoint in [from, to] {
                        if endpoint != START && endpoint != END && !is_node(endpoint.as_str()) {
                            return Err(CompileError::UnknownNode {
                                from: from.clone(),
                                to: to.clone(),
                                node: endpoint.clone(),
                            });
                        }
                    }
                }
                Edge::Join { sources, target } => {
                    if sources.is_empty() {
                        return Err(CompileError::EmptyJoin { target: target.clone() });
                    }
                    if target == START {
                        return Err(CompileError::EdgeToStart { from: sources.join("+") });
                    }
                    for source in sources {
                        if source == END {
                            return Err(CompileError::EdgeFromEnd { to: target.clone() });
                        }
                        if source != START && !is_node(source.as_str()) {
                            return Err(CompileError::UnknownNode {
                                from: source.clone(),
                                to: target.clone(),
                                node: source.clone(),
                            });
                        }
                    }
                    if !is_node(target.as_str()) {
                        return Err(CompileError::UnknownNode {
                            from: sources.join("+"),
                            to: target.clone(),
                            node: target.clone(),
                        });
                    }
                }
                Edge::Conditional { from, branch } => {
                    if from == END {
                        return Err(CompileError::EdgeFromEnd { to: branch.destinations.join(",") });
                    }
                    if from != START && !is_node(from.as_str()) {
                        return Err(CompileError::UnknownNode {
                            from: from.clone(),
                            to: branch.destinations.join(","),
                            node: from.clone(),
                        });
                    }
                    if branch.destinations.is_empty() {
                        return Err(CompileError::EmptyBranch { node: from.clone() });
                    }
                    for target in &branch.destinations {
                        if target != END && !is_node(target.as_str()) {
                            return Err(CompileError::UnknownBranchTarget {
                                node: from.clone(),
                                target: target.clone(),
                            });
                        }
                    }
                }
                Edge::Fallback { .. } => {}
            }
        }

        // Channels each node touches
        for node in &graph.nodes {
            let declared = node
                .options
                .reads
                .iter()
                .flatten()
                .chain(node.options.writes.iter().flatten());
            for channel in declared {
                if !channel_names.contains(channel.as_str()) {
                    return Err(CompileError::UnknownChannel {
                        node: node.name.clone(),
                        channel: channel.clone(),
                    });
                }
            }
            for target in &node.options.destinations {
                if target != END && !is_node(target.as_str()) {
                    return Err(CompileError::UnknownDestination {
                        node: node.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        // Fallbacks
        let mut fallback_of: HashMap<&str, &str> = HashMap::new();
        for edge in &graph.edges {
            if let Edge::Fallback { from, to } = edge {
                if !is_node(from.as_str()) || !is_node(to.as_str()) {
                    return Err(CompileError::UnknownFallback {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
                if fallback_of.insert(from.as_str(), to.as_str()).is_some() {
                    return Err(CompileError::DuplicateFallback { node: from.clone() });
                }
            }
        }

        for node in graph.interrupts.named_nodes() {
            if !is_node(node.as_str()) {
                return Err(CompileError::UnknownInterruptNode(node.clone()));
            }
        }

        let has_entry = graph.edges.iter().any(|edge| match edge {
            Edge::Direct { from, .. } | Edge::Conditional { from, .. } => from == START,
            Edge::Join { sources, .. } => sources.iter().any(|s| s == START),
            Edge::Fallback { .. } => false,
        });
        if !has_entry {
            return Err(CompileError::NoEntryPoint);
        }

        Self::check_reachability(graph)?;
        Ok(Self::build(graph, &fallback_of))
    }

    fn check_reachability(graph: &Graph) -> Result<(), CompileError> {
        let mut reached: HashSet<&str> = HashSet::from([START]);
        let mut queue: VecDeque<&str> = VecDeque::from([START]);

        while let Some(current) = queue.pop_front() {
            let mut next: Vec<&str> = Vec::new();
            for edge in &graph.edges {
                match edge {
                    Edge::Direct { from, to } if from == current => next.push(to),
                    Edge::Conditional { from, branch } if from == current => {
                        next.extend(branch.destinations.iter().map(String::as_str))
                    }
                    Edge::Fallback { from, to } if from == current => next.push(to),
                    Edge::Join { sources, target } if sources.iter().any(|s| s == current) => {
                        if sources.iter().all(|s| reached.contains(s.as_str())) {
                            next.push(target);
                        }
                    }
                    _ => {}
                }
            }
            if let Some(node) = graph.node(current) {
                next.extend(node.options.destinations.iter().map(String::as_str));
            }
            for target in next {
                if reached.insert(target) {
                    queue.push_back(target);
                }
            }
        }

        match graph.nodes.iter().find(|n| !reached.contains(n.name.as_str())) {
            Some(orphan) => Err(CompileError::Unreachable {
                node: orphan.name.clone(),
            }),
            None => Ok(()),
        }
    }

    fn build(graph: &Graph, fallback_of: &HashMap<&str, &str>) -> Self {
        let all_channels: Vec<String> = graph.channels.iter().map(|c| c.name.clone()).collect();
        let mut internal: Vec<(String, InternalChannel)> = Vec::new();
        let mut routing: HashMap<String, Routing> = HashMap::new();
        let mut triggers: HashMap<String, Vec<String>> = HashMap::new();
        let mut fallback_triggers: HashMap<String, Vec<String>> = HashMap::new();

        for node in &graph.nodes {
            let channel = trigger_channel(&node.name);
            internal.push((channel.clone(), InternalChannel::Trigger));
            triggers.entry(node.name.clone()).or_default().push(channel);
        }

        for edge in &graph.edges {
            match edge {
                Edge::Direct { from, to } => {
                    if to == END {
                        continue;
                    }
                    routing
                        .entry(from.clone())
                        .or_default()
                        .successors
                        .push(Successor::Trigger {
                            channel: trigger_channel(to),
                        });
                }
                Edge::Join { sources, target } => {
                    let channel = join_channel(sources, target);
                    internal.push((channel.clone(), InternalChannel::Barrier(sources.clone())));
                    triggers.entry(target.clone()).or_default().push(channel.clone());
                    for source in sources {
                        routing
                            .entry(source.clone())
                            .or_default()
                            .successors
                            .push(Successor::Barrier {
                                channel: channel.clone(),
                                member: source.clone(),
                            });
                    }
                }
                Edge::Conditional { from, branch } => {
                    routing.entry(from.clone()).or_default().branches.push(branch.clone());
                }
                Edge::Fallback { from, to } => {
                    let channel = fallback_channel(from, to);
                    internal.push((channel.clone(), InternalChannel::Fallback));
                    triggers.entry(to.clone()).or_default().push(channel.clone());
                    fallback_triggers.entry(to.clone()).or_default().push(channel);
                }
            }
        }
        internal.push((TASKS.to_string(), InternalChannel::Tasks));

        let nodes: Vec<PlanNode> = graph
            .nodes
            .iter()
            .map(|spec| PlanNode {
                name: spec.name.clone(),
                kind: spec.kind.clone(),
                triggers: triggers.remove(&spec.name).unwrap_or_default(),
                fallback_triggers: fallback_triggers.remove(&spec.name).unwrap_or_default(),
                reads: spec.options.reads.clone(),
                writes: spec
                    .options
                    .writes
                    .clone()
                    .unwrap_or_else(|| all_channels.clone())
                    .into_iter()
                    .collect(),
                destinations: spec.options.destinations.iter().cloned().collect(),
                routing: routing.remove(&spec.name).unwrap_or_default(),
                fallback: fallback_of
                    .get(spec.name.as_str())
                    .map(|to| fallback_channel(&spec.name, to)),
                retry: spec.options.retry.clone(),
                timeout: spec.options.timeout,
            })
            .collect();

        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();

        Self {
            channels: graph.channels.clone(),
            internal,
            nodes,
            index,
            start: routing.remove(START).unwrap_or_default(),
            interrupts: graph.interrupts.clone(),
        }
    }

    pub(crate) fn node(&self, name: &str) -> Option<&PlanNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Node names in registration order
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    /// Names of the state channels
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.name.as_str())
    }

    pub(crate) fn is_state_channel(&self, name: &str) -> bool {
        self.channels.iter().any(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeOptions, NodeSpec};
    use crate::send::ConditionalEdgeResult;
    use crate::state::Reducer;
    use std::sync::Arc;

    fn node(name: &str) -> NodeSpec {
        NodeSpec {
            name: name.into(),
            kind: NodeKind::Passthrough,
            options: NodeOptions::new(),
        }
    }

    fn direct(from: &str, to: &str) -> Edge {
        Edge::Direct {
            from: from.into(),
            to: to.into(),
        }
    }

    fn graph(nodes: &[&str], edges: Vec<Edge>) -> Graph {
        let mut graph = Graph::new();
        graph.nodes = nodes.iter().map(|n| node(n)).collect();
        graph.channels.push(ChannelSpec::new("log", Reducer::Append));
        graph.edges = edges;
        graph
    }

    #[test]
    fn test_linear_plan() {
        let g = graph(&["a", "b"], vec![direct(START, "a"), direct("a", "b"), direct("b", END)]);
        let plan = ExecutionPlan::compile(&g).unwrap();

        assert_eq!(plan.node_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(
            plan.start.successors,
            vec![Successor::Trigger {
                channel: "branch:to:a".into()
            }]
        );
        let a = plan.node("a").unwrap();
        assert_eq!(a.triggers, vec!["branch:to:a".to_string()]);
        assert!(a.writes.contains("log"));
        assert!(plan.node("b").unwrap().routing.successors.is_empty());
    }

    #[test]
    fn test_join_builds_barrier() {
        let g = graph(
            &["a", "b", "c"],
            vec![
                direct(START, "a"),
                direct(START, "b"),
                Edge::Join {
                    sources: vec!["a".into(), "b".into()],
                    target: "c".into(),
                },
            ],
        );
        let plan = ExecutionPlan::compile(&g).unwrap();
        let c = plan.node("c").unwrap();
        assert!(c.triggers.contains(&"join:a+b:to:c".to_string()));
        assert!(plan
            .internal
            .iter()
            .any(|(name, kind)| name == "join:a+b:to:c" && matches!(kind, InternalChannel::Barrier(_))));
    }

    #[test]
    fn test_errors_name_offender() {
        let g = graph(&["a"], vec![direct(START, "a"), direct("a", "ghost")]);
        assert_eq!(
            ExecutionPlan::compile(&g).unwrap_err(),
            CompileError::UnknownNode {
                from: "a".into(),
                to: "ghost".into(),
                node: "ghost".into()
            }
        );

        let g = graph(&["a", "orphan"], vec![direct(START, "a")]);
        assert_eq!(
            ExecutionPlan::compile(&g).unwrap_err(),
            CompileError::Unreachable { node: "orphan".into() }
        );

        let g = graph(&["a"], vec![direct("a", END)]);
        assert_eq!(ExecutionPlan::compile(&g).unwrap_err(), CompileError::NoEntryPoint);

        let g = graph(&["a:b"], vec![direct(START, "a:b")]);
        assert_eq!(
            ExecutionPlan::compile(&g).unwrap_err(),
            CompileError::ReservedName("a:b".into())
        );
    }

    #[test]
    fn test_branch_targets_checked() {
        let branch = Branch {
            router: Arc::new(|_| ConditionalEdgeResult::End),
            destinations: vec!["a".into(), "nowhere".into()],
        };
        let g = graph(
            &["a"],
            vec![
                direct(START, "a"),
                Edge::Conditional {
                    from: "a".into(),
                    branch,
                },
            ],
        );
        assert_eq!(
            ExecutionPlan::compile(&g).unwrap_err(),
            CompileError::UnknownBranchTarget {
                node: "a".into(),
                target: "nowhere".into()
            }
        );
    }

    #[test]
    fn test_unknown_write_channel() {
        let mut g = graph(&["a"], vec![direct(START, "a")]);
        g.nodes[0].options = NodeOptions::new().writes(["missing"]);
        assert_eq!(
            ExecutionPlan::compile(&g).unwrap_err(),
            CompileError::UnknownChannel {
                node: "a".into(),
                channel: "missing".into()
            }
        );
    }

    #[test]
    fn test_fallback_reachable_and_unique() {
        let g = graph(
            &["a", "rescue"],
            vec![
                direct(START, "a"),
                Edge::Fallback {
                    from: "a".into(),
                    to: "rescue".into(),
                },
            ],
        );
        let plan = ExecutionPlan::compile(&g).unwrap();
        assert_eq!(plan.node("a").unwrap().fallback.as_deref(), Some("fallback:a:to:rescue"));
        assert_eq!(
            plan.node("rescue").unwrap().fallback_triggers,
            vec!["fallback:a:to:rescue".to_string()]
        );

        let mut twice = g.clone();
        twice.edges.push(Edge::Fallback {
            from: "a".into(),
            to: "rescue".into(),
        });
        assert_eq!(
            ExecutionPlan::compile(&twice).unwrap_err(),
            CompileError::DuplicateFallback { node: "a".into() }
        );
    }

    #[test]
    fn test_command_destinations_count_for_reachability() {
        let mut g = graph(&["a", "b"], vec![direct(START, "a")]);
        g.nodes[0].options = NodeOptions::new().destinations(["b"]);
        assert!(ExecutionPlan::compile(&g).is_ok());
    }

    #[test]
    fn test_compile_is_deterministic() {
        let g = graph(&["a", "b"], vec![direct(START, "a"), direct(START, "b")]);
        let first = ExecutionPlan::compile(&g).unwrap();
        let second = ExecutionPlan::compile(&g).unwrap();
        let names = |p: &ExecutionPlan| p.internal.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>();
        assert_eq!(names(&first), names(&second));
    }
}
