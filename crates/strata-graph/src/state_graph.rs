use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde_json::Value;
use strata_core::error::{GraphError, Result};

use crate::channel::{AggregateOp, ChannelSpec};
use crate::compiled::CompiledStateGraph;
use crate::constants::{END, START};
use crate::edge::{ConditionalEdge, Edge};
use crate::node::NodeFn;

/// Builder for constructing a state graph.
///
/// Use `add_node`, `add_edge`, `add_conditional_edges`, etc. to define
/// the graph topology, then call `compile()` to validate and produce
/// a `CompiledStateGraph`.
pub struct StateGraph {
    channel_specs: BTreeMap<String, ChannelSpec>,
    /// Registration order is the order in which same-superstep writes reduce.
    nodes: Vec<NodeFn>,
    edges: Vec<Edge>,
    conditional_edges: Vec<ConditionalEdge>,
}

impl StateGraph {
    pub fn new() -> Self {
        Self {
            channel_specs: BTreeMap::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            conditional_edges: Vec::new(),
        }
    }

    /// Add a channel spec for a state key.
    pub fn add_channel(&mut self, name: impl Into<String>, spec: ChannelSpec) -> &mut Self {
        self.channel_specs.insert(name.into(), spec);
        self
    }

    /// Convenience: add a `LastValue` channel with the given default.
    pub fn add_last_value_channel(&mut self, name: impl Into<String>, default: Value) -> &mut Self {
        self.add_channel(name, ChannelSpec::LastValue { default })
    }

    /// Convenience: add an `AppendChannel`.
    pub fn add_append_channel(&mut self, name: impl Into<String>) -> &mut Self {
        self.add_channel(name, ChannelSpec::Append)
    }

    /// Convenience: add a `BinaryOperatorAggregate` channel.
    pub fn add_binary_operator_channel(
        &mut self,
        name: impl Into<String>,
        default: Value,
        op: AggregateOp,
    ) -> &mut Self {
        self.add_channel(name, ChannelSpec::BinaryOperator { default, op })
    }

    /// Convenience: add an `EphemeralValue` channel.
    pub fn add_ephemeral_channel(&mut self, name: impl Into<String>) -> &mut Self {
        self.add_channel(name, ChannelSpec::Ephemeral)
    }

    /// Convenience: add a `TopicChannel`.
    pub fn add_topic_channel(&mut self, name: impl Into<String>, accumulate: bool) -> &mut Self {
        self.add_channel(name, ChannelSpec::Topic { accumulate })
    }

    /// Add a node to the graph.
    ///
    /// Returns an error if a node with the same name already exists
    /// or if the name is a reserved sentinel (`__start__` / `__end__`).
    pub fn add_node(&mut self, node: NodeFn) -> Result<&mut Self> {
        let name = node.name();

        if name == START || name == END {
            return Err(GraphError::InvalidGraph(format!(
                "Cannot add node with reserved name '{name}'"
            ))
            .into());
        }

        if name.is_empty() {
            return Err(GraphError::InvalidGraph("Node name cannot be empty".into()).into());
        }

        if self.nodes.iter().any(|n| n.name() == name) {
            return Err(GraphError::InvalidGraph(format!("Duplicate node name: '{name}'")).into());
        }

        self.nodes.push(node);
        Ok(self)
    }

    /// Add a static edge between two nodes.
    ///
    /// Both `from` and `to` can be node names or sentinels (`START` / `END`).
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    /// Add a conditional edge from a source node.
    pub fn add_conditional_edges(&mut self, edge: ConditionalEdge) -> &mut Self {
        self.conditional_edges.push(edge);
        self
    }

    /// Shorthand for `add_edge(START, node)`.
    pub fn set_entry_point(&mut self, node: impl Into<String>) -> &mut Self {
        self.add_edge(START, node)
    }

    /// Shorthand for `add_edge(node, END)`.
    pub fn set_finish_point(&mut self, node: impl Into<String>) -> &mut Self {
        self.add_edge(node, END)
    }

    /// Validate the graph and produce a `CompiledStateGraph`.
    pub fn compile(self) -> Result<CompiledStateGraph> {
        self.validate()?;

        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &self.edges {
            let targets = successors.entry(edge.from.clone()).or_default();
            if !targets.contains(&edge.to) {
                targets.push(edge.to.clone());
            }
        }

        let mut routers: HashMap<String, Vec<ConditionalEdge>> = HashMap::new();
        for ce in self.conditional_edges.iter().cloned() {
            routers.entry(ce.from.clone()).or_default().push(ce);
        }

        let predecessors = self.barrier_predecessors();
        tracing::debug!(
            nodes = self.nodes.len(),
            edges = self.edges.len(),
            conditional_edges = self.conditional_edges.len(),
            "compiled graph"
        );

        Ok(CompiledStateGraph::new(
            self.nodes,
            successors,
            routers,
            self.channel_specs,
            predecessors,
        ))
    }

    fn node(&self, name: &str) -> Option<&NodeFn> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Validate the graph structure.
    fn validate(&self) -> Result<()> {
        // 1. Exactly one edge set leaves START
        let start_static = self.edges.iter().filter(|e| e.from == START).count();
        let start_conditional = self
            .conditional_edges
            .iter()
            .filter(|ce| ce.from == START)
            .count();
        match (start_static, start_conditional) {
            (0, 0) => {
                return Err(GraphError::InvalidGraph(
                    "Entry point not set: add an edge from START".into(),
                )
                .into());
            }
            (0, 1) | (_, 0) => {}
            _ => {
                return Err(GraphError::InvalidGraph(
                    "Exactly one edge set may originate from START; found both static and conditional edges".into(),
                )
                .into());
            }
        }

        // 2. All edges must reference existing nodes (or sentinels)
        for edge in &self.edges {
            if edge.from == END {
                return Err(GraphError::InvalidGraph("END cannot have outgoing edges".into()).into());
            }
            if edge.to == START {
                return Err(GraphError::InvalidGraph("START cannot be an edge target".into()).into());
            }
            self.validate_node_ref(&edge.from, "edge source")?;
            self.validate_node_ref(&edge.to, "edge target")?;
        }

        // 3. Conditional edges: known source, known path_map targets
        for ce in &self.conditional_edges {
            if ce.from == END {
                return Err(GraphError::InvalidGraph("END cannot have outgoing edges".into()).into());
            }
            self.validate_node_ref(&ce.from, "conditional edge source")?;
            if let Some(pm) = ce.path_map() {
                for target in pm.values() {
                    if target == START {
                        return Err(GraphError::InvalidGraph(
                            "START cannot be a routing target".into(),
                        )
                        .into());
                    }
                    self.validate_node_ref(target, "conditional edge target")?;
                }
            }
        }

        // 4. Declared command destinations
        for node in &self.nodes {
            for dest in node.destinations() {
                self.validate_node_ref(dest, &format!("destination of '{}'", node.name()))?;
            }
        }

        // 5. BFS reachability from START (cycles are allowed)
        self.validate_reachability()
    }

    /// Check that a node reference is valid (exists as a node or is a sentinel).
    fn validate_node_ref(&self, name: &str, context: &str) -> Result<()> {
        if name == START || name == END || self.node(name).is_some() {
            return Ok(());
        }
        Err(GraphError::InvalidGraph(format!("Unknown node '{name}' referenced as {context}")).into())
    }

    /// Every node that may run next after `name`, as far as static analysis can tell.
    fn possible_successors(&self, name: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .edges
            .iter()
            .filter(|e| e.from == name)
            .map(|e| e.to.as_str())
            .collect();

        for ce in self.conditional_edges.iter().filter(|ce| ce.from == name) {
            match ce.path_map() {
                Some(pm) => out.extend(pm.values().map(|s| s.as_str())),
                // Without a path_map the router may return any node.
                None => out.extend(self.nodes.iter().map(|n| n.name())),
            }
        }

        if let Some(node) = self.node(name) {
            out.extend(node.destinations().iter().map(|s| s.as_str()));
        }
        out
    }

    fn validate_reachability(&self) -> Result<()> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(START);
        visited.insert(START);

        while let Some(current) = queue.pop_front() {
            for next in self.possible_successors(current) {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        for node in &self.nodes {
            if !visited.contains(node.name()) {
                return Err(GraphError::InvalidGraph(format!(
                    "Node '{}' is not reachable from START",
                    node.name()
                ))
                .into());
            }
        }
        Ok(())
    }

    /// For each deferred node, the sources whose completion it waits for.
    fn barrier_predecessors(&self) -> HashMap<String, BTreeSet<String>> {
        let mut preds: HashMap<String, BTreeSet<String>> = HashMap::new();
        for node in self.nodes.iter().filter(|n| n.is_deferred()) {
            let target = node.name();
            let mut sources = BTreeSet::new();
            for edge in self.edges.iter().filter(|e| e.to == target) {
                sources.insert(edge.from.clone());
            }
            // A router without a path_map may route to any node.
            for ce in &self.conditional_edges {
                if ce
                    .path_map()
                    .is_none_or(|pm| pm.values().any(|t| t == target))
                {
                    sources.insert(ce.from.clone());
                }
            }
            for other in &self.nodes {
                if other.destinations().iter().any(|d| d == target) {
                    sources.insert(other.name().to_string());
                }
            }
            preds.insert(target.to_string(), sources);
        }
        preds
    }
}

impl Default for StateGraph {
    fn default() -> Self {
        Self::new()
    }
}
