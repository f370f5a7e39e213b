use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures::stream::BoxStream;
use serde_json::Value;
use tracing::Instrument;

use strata_checkpoint::checkpointer::Checkpointer;
use strata_checkpoint::command::{Command, Goto};
use strata_checkpoint::config_ext::CheckpointConfigExt;
use strata_checkpoint::send::SendDirective;
use strata_checkpoint::types::{Checkpoint, GraphOutput, PendingWrite};
use strata_core::config::RunnableConfig;
use strata_core::error::{GraphError, Result, StrataError};
use strata_store::base::BaseStore;

use crate::channel::{ChannelSpec, Channels};
use crate::constants::END;
use crate::edge::ConditionalEdge;
use crate::node::{NodeContext, NodeFn};
use crate::run_loop::{Outcome, RunLoop, Tick};
use crate::stream::{StreamEvent, StreamMode};

/// Nodes scheduled for the next superstep, plus deferred nodes still
/// waiting on their barrier.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Frontier {
    pub nodes: Vec<String>,
    pub sends: Vec<SendDirective>,
    pub barriers: BTreeMap<String, BTreeSet<String>>,
}

impl Frontier {
    pub fn from_checkpoint(cp: &Checkpoint) -> Self {
        Self {
            nodes: cp.next_nodes.clone(),
            sends: cp.pending_sends.clone(),
            barriers: cp.barriers.clone(),
        }
    }

    /// No task is runnable right now.
    pub fn is_idle(&self) -> bool {
        self.nodes.is_empty() && self.sends.is_empty()
    }

    /// Node names of every scheduled task, sends included.
    pub fn task_nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .map(|n| n.as_str())
            .chain(self.sends.iter().map(|s| s.node.as_str()))
    }
}

/// The result of running a graph as a node of another graph.
#[derive(Debug, Clone, PartialEq)]
pub enum NestedOutput {
    /// The subgraph ran to completion with this final state.
    State(Value),
    /// A node inside the subgraph addressed a command to the calling graph.
    Parent(Command),
}

/// A compiled state graph ready for execution.
///
/// Created by `StateGraph::compile()`. Execution follows the superstep
/// model: every scheduled node of a round runs concurrently against the
/// state committed by the previous round, and the round's writes are
/// reduced and checkpointed as one batch.
pub struct CompiledStateGraph {
    nodes: Vec<NodeFn>,
    node_index: HashMap<String, usize>,
    successors: HashMap<String, Vec<String>>,
    routers: HashMap<String, Vec<ConditionalEdge>>,
    pub(crate) channel_specs: BTreeMap<String, ChannelSpec>,
    predecessors: HashMap<String, BTreeSet<String>>,
    pub(crate) checkpointer: Option<Arc<dyn Checkpointer>>,
    pub(crate) store: Option<Arc<dyn BaseStore>>,
    pub(crate) interrupt_before: HashSet<String>,
    pub(crate) interrupt_after: HashSet<String>,
}

impl CompiledStateGraph {
    pub(crate) fn new(
        nodes: Vec<NodeFn>,
        successors: HashMap<String, Vec<String>>,
        routers: HashMap<String, Vec<ConditionalEdge>>,
        channel_specs: BTreeMap<String, ChannelSpec>,
        predecessors: HashMap<String, BTreeSet<String>>,
    ) -> Self {
        let node_index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name().to_string(), i))
            .collect();
        Self {
            nodes,
            node_index,
            successors,
            routers,
            channel_specs,
            predecessors,
            checkpointer: None,
            store: None,
            interrupt_before: HashSet::new(),
            interrupt_after: HashSet::new(),
        }
    }

    /// Persist a checkpoint after every superstep of runs that carry a `thread_id`.
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Cross-thread store handed to every node through its `NodeContext`.
    pub fn with_store(mut self, store: Arc<dyn BaseStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Suspend the run before any of these nodes executes.
    pub fn with_interrupt_before<I, S>(mut self, nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes = self.known_nodes(nodes)?;
        self.interrupt_before.extend(nodes);
        Ok(self)
    }

    /// Suspend the run after any of these nodes has executed and committed.
    pub fn with_interrupt_after<I, S>(mut self, nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes = self.known_nodes(nodes)?;
        self.interrupt_after.extend(nodes);
        Ok(self)
    }

    fn known_nodes<I, S>(&self, nodes: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        nodes
            .into_iter()
            .map(Into::into)
            .map(|name: String| {
                if self.node_index.contains_key(&name) {
                    Ok(name)
                } else {
                    Err(GraphError::InvalidGraph(format!(
                        "Cannot interrupt at unknown node '{name}'"
                    ))
                    .into())
                }
            })
            .collect()
    }

    /// Names of all nodes, in registration order.
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name()).collect()
    }

    /// Get the static edges from a given node.
    pub fn edges_from(&self, node: &str) -> &[String] {
        self.successors
            .get(node)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn node(&self, name: &str) -> Option<&NodeFn> {
        self.node_index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channel_specs.contains_key(name)
    }

    /// Sources a deferred node waits for, or `None` if the node is not deferred.
    pub fn barrier_predecessors(&self, node: &str) -> Option<&BTreeSet<String>> {
        self.predecessors.get(node)
    }

    pub fn checkpointer(&self) -> Option<&Arc<dyn Checkpointer>> {
        self.checkpointer.as_ref()
    }

    /// Execute the graph until it completes or suspends.
    ///
    /// A `Null` input resumes the thread named in `config` from its latest
    /// checkpoint (or from `checkpoint_id` when set).
    pub async fn invoke(&self, input: Value, config: &RunnableConfig) -> Result<GraphOutput> {
        let thread_id = config.thread_id().unwrap_or_default();
        let span = tracing::info_span!("graph_run", thread_id = %thread_id, run_id = %config.run_id);
        self.run_to_end(input, config).instrument(span).await
    }

    async fn run_to_end(&self, input: Value, config: &RunnableConfig) -> Result<GraphOutput> {
        let mut run = RunLoop::prepare(self, input, config.clone(), None).await?;
        loop {
            if let Tick::Done(outcome) = run.tick().await? {
                return match outcome {
                    Outcome::Complete(state) => Ok(GraphOutput::Complete(state)),
                    Outcome::Interrupted {
                        checkpoint_id,
                        interrupt_value,
                        state,
                    } => Ok(GraphOutput::Interrupted {
                        checkpoint_id,
                        interrupt_value,
                        state,
                    }),
                    Outcome::Parent(_) => Err(GraphError::InvalidCommand(
                        "parent command escaped the top-level graph".into(),
                    )
                    .into()),
                };
            }
        }
    }

    /// Run this graph inside a node of another graph.
    ///
    /// The nested run shares the caller's step counter, configuration and
    /// cancellation, and falls back to the caller's store. It is not
    /// checkpointed and ignores static interrupts.
    pub async fn invoke_nested(&self, input: Value, ctx: &NodeContext) -> Result<NestedOutput> {
        let mut run = RunLoop::prepare(self, input, ctx.config().clone(), Some(ctx)).await?;
        loop {
            if let Tick::Done(outcome) = run.tick().await? {
                return match outcome {
                    Outcome::Complete(state) => Ok(NestedOutput::State(state)),
                    Outcome::Parent(cmd) => Ok(NestedOutput::Parent(cmd)),
                    Outcome::Interrupted { .. } => Err(GraphError::InvalidCommand(
                        "nested graphs cannot suspend".into(),
                    )
                    .into()),
                };
            }
        }
    }

    /// Stream one event per superstep.
    ///
    /// The stream is lazy: nothing runs until it is polled, and dropping it
    /// cancels the in-flight superstep without committing it.
    pub fn stream(
        &self,
        input: Value,
        config: &RunnableConfig,
        mode: StreamMode,
    ) -> BoxStream<'_, Result<StreamEvent>> {
        let config = config.clone();
        Box::pin(async_stream::stream! {
            let mut run = match RunLoop::prepare(self, input, config, None).await {
                Ok(run) => run,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            loop {
                match run.tick().await {
                    Ok(Tick::Step(report)) => {
                        yield Ok(StreamEvent::from_report(report, mode));
                    }
                    Ok(Tick::Done(Outcome::Interrupted { checkpoint_id, interrupt_value, state })) => {
                        yield Ok(StreamEvent::Interrupted { checkpoint_id, interrupt_value, state });
                        break;
                    }
                    Ok(Tick::Done(_)) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Reduction and routing, shared by the run loop and state editing
    // -----------------------------------------------------------------------

    /// Split a node's update into per-channel writes.
    pub(crate) fn collect_writes(
        &self,
        task_id: &str,
        node: &str,
        update: Option<&Value>,
        writes: &mut Vec<PendingWrite>,
    ) -> Result<()> {
        match update {
            None | Some(Value::Null) => Ok(()),
            Some(Value::Object(map)) => {
                for (channel, value) in map {
                    if !self.channel_specs.contains_key(channel) {
                        tracing::warn!(node, channel = %channel, "write to undeclared channel dropped");
                        continue;
                    }
                    writes.push(PendingWrite {
                        task_id: task_id.to_string(),
                        node: node.to_string(),
                        channel: channel.clone(),
                        value: value.clone(),
                    });
                }
                Ok(())
            }
            Some(other) => Err(GraphError::InvalidUpdate {
                node: node.to_string(),
                message: format!("expected an object or null, got {other}"),
            }
            .into()),
        }
    }

    /// Reduce a round's writes into `channels`, in order.
    pub(crate) fn apply_writes(&self, channels: &mut Channels, writes: &[PendingWrite]) -> Result<()> {
        for ch in channels.values_mut() {
            ch.on_step_end();
        }

        let mut last_writer: HashMap<&str, &str> = HashMap::new();
        for write in writes {
            let is_last_value = self
                .channel_specs
                .get(&write.channel)
                .is_some_and(ChannelSpec::is_last_value);
            if is_last_value {
                if let Some(prev) = last_writer.insert(&write.channel, &write.task_id) {
                    if prev != write.task_id {
                        tracing::warn!(
                            channel = %write.channel,
                            node = %write.node,
                            "several tasks wrote a last-value channel in one superstep; the last in task order wins"
                        );
                    }
                }
            }

            let ch = channels.get_mut(&write.channel).ok_or_else(|| {
                GraphError::Channel(format!("channel '{}' missing at commit", write.channel))
            })?;
            ch.update(vec![write.value.clone()]).map_err(|e| GraphError::StateReduction {
                channel: write.channel.clone(),
                node: write.node.clone(),
                message: match e {
                    StrataError::Graph(GraphError::Channel(msg)) => msg,
                    other => other.to_string(),
                },
            })?;
        }
        Ok(())
    }

    /// Add the successors of `source` to `frontier`.
    ///
    /// A non-empty `goto` replaces both static edges and routers.
    pub(crate) fn route(
        &self,
        source: &str,
        goto: Option<&[Goto]>,
        state: &Value,
        frontier: &mut Frontier,
    ) -> Result<()> {
        let targets: Vec<Goto> = match goto {
            Some(goto) if !goto.is_empty() => goto.to_vec(),
            _ => {
                let mut targets: Vec<Goto> = self
                    .edges_from(source)
                    .iter()
                    .cloned()
                    .map(Goto::Node)
                    .collect();
                for router in self.routers.get(source).into_iter().flatten() {
                    let resolved = router.resolve(state);
                    tracing::debug!(from = source, targets = ?resolved, "conditional edge routed");
                    targets.extend(resolved);
                }
                targets
            }
        };

        for target in targets {
            match target {
                Goto::Node(name) if name == END => {}
                Goto::Node(name) => {
                    let node = self.node(&name).ok_or_else(|| GraphError::Routing {
                        node: source.to_string(),
                        target: name.clone(),
                    })?;
                    if node.is_deferred() {
                        frontier
                            .barriers
                            .entry(name)
                            .or_default()
                            .insert(source.to_string());
                    } else if !frontier.nodes.contains(&name) {
                        frontier.nodes.push(name);
                    }
                }
                Goto::Send(send) => {
                    if self.node(&send.node).is_none() {
                        return Err(GraphError::Routing {
                            node: source.to_string(),
                            target: send.node,
                        }
                        .into());
                    }
                    frontier.sends.push(send);
                }
            }
        }
        Ok(())
    }

    /// Release deferred nodes whose barrier is complete and order the frontier.
    ///
    /// When nothing else is runnable, every waiting deferred node is released.
    pub(crate) fn settle(&self, frontier: &mut Frontier) {
        let mut ready: Vec<String> = frontier
            .barriers
            .iter()
            .filter(|(node, arrived)| {
                self.predecessors
                    .get(node.as_str())
                    .is_none_or(|preds| preds.is_subset(arrived))
            })
            .map(|(node, _)| node.clone())
            .collect();

        if ready.is_empty() && frontier.is_idle() && !frontier.barriers.is_empty() {
            tracing::debug!(
                waiting = ?frontier.barriers.keys().collect::<Vec<_>>(),
                "no other work remains; releasing deferred nodes"
            );
            ready = frontier.barriers.keys().cloned().collect();
        }

        for node in ready {
            frontier.barriers.remove(&node);
            tracing::debug!(node = %node, "barrier satisfied");
            if !frontier.nodes.contains(&node) {
                frontier.nodes.push(node);
            }
        }

        frontier
            .nodes
            .sort_by_key(|n| self.node_index.get(n).copied().unwrap_or(usize::MAX));
    }
}
