use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::Instrument;

use strata_checkpoint::checkpointer::Checkpointer;
use strata_checkpoint::command::{Command, Goto};
use strata_checkpoint::config_ext::CheckpointConfigExt;
use strata_checkpoint::types::{
    Checkpoint, CheckpointMetadata, CheckpointSource, PendingWrite,
};
use strata_core::config::RunnableConfig;
use strata_core::error::{GraphError, Result, StrataError};
use strata_store::base::BaseStore;

use crate::channel::{
    checkpoint_values, clone_channels, create_channels, restore_channels, snapshot, Channels,
};
use crate::compiled::{CompiledStateGraph, Frontier};
use crate::constants::START;
use crate::node::{NodeContext, NodeOutput};
use crate::stream::TaskUpdate;

/// How a run ended.
pub(crate) enum Outcome {
    Complete(Value),
    Interrupted {
        checkpoint_id: String,
        interrupt_value: Value,
        state: Value,
    },
    Parent(Command),
}

/// What one committed superstep produced.
pub(crate) struct StepReport {
    pub step: usize,
    pub checkpoint_id: Option<String>,
    pub tasks: Vec<String>,
    pub updates: Vec<TaskUpdate>,
    pub next: Vec<String>,
    pub state: Value,
}

pub(crate) enum Tick {
    Step(StepReport),
    Done(Outcome),
}

struct Task {
    id: String,
    node: String,
    input: Arc<Value>,
}

/// Assemble a checkpoint from committed channels and the next frontier.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_checkpoint(
    thread_id: &str,
    parent_id: Option<String>,
    step: usize,
    channels: &Channels,
    frontier: &Frontier,
    writes: Vec<PendingWrite>,
    source: CheckpointSource,
    writers: Vec<String>,
) -> Checkpoint {
    Checkpoint {
        id: uuid::Uuid::new_v4().to_string(),
        thread_id: thread_id.to_string(),
        parent_id,
        step,
        channel_values: checkpoint_values(channels),
        pending_writes: writes,
        next_nodes: frontier.nodes.clone(),
        pending_sends: frontier.sends.clone(),
        barriers: frontier.barriers.clone(),
        metadata: CheckpointMetadata {
            source,
            step,
            writers,
        },
        created_at: chrono::Utc::now(),
    }
}

/// Errors raised by a node are wrapped with its name, except those that
/// describe the run as a whole.
fn node_error(node: &str, err: StrataError) -> StrataError {
    match err {
        StrataError::Graph(
            GraphError::RecursionLimit { .. } | GraphError::Cancelled | GraphError::RunTimeout { .. },
        ) => err,
        other => GraphError::NodeExecution {
            node: node.to_string(),
            source: Box::new(other),
        }
        .into(),
    }
}

/// Drives one graph run superstep by superstep.
///
/// Each `tick` either commits one round or reports how the run ended. Channel
/// state and the frontier only change after a round has fully succeeded and
/// its checkpoint (if any) has been saved.
pub(crate) struct RunLoop<'g> {
    graph: &'g CompiledStateGraph,
    config: RunnableConfig,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    thread_id: Option<String>,
    store: Option<Arc<dyn BaseStore>>,
    channels: Channels,
    frontier: Frontier,
    step: usize,
    parent_id: Option<String>,
    steps: Arc<AtomicUsize>,
    deadline: Option<Instant>,
    nested: bool,
    skip_interrupt_before: bool,
    pending_interrupt: Option<(String, Value)>,
}

impl<'g> RunLoop<'g> {
    pub async fn prepare(
        graph: &'g CompiledStateGraph,
        input: Value,
        config: RunnableConfig,
        parent: Option<&NodeContext>,
    ) -> Result<RunLoop<'g>> {
        let nested = parent.is_some();
        let thread_id = config.thread_id();
        let checkpointer = if nested {
            None
        } else {
            graph.checkpointer.clone()
        };
        let store = graph
            .store
            .clone()
            .or_else(|| parent.and_then(|ctx| ctx.store().cloned()));
        let steps = parent
            .map(|ctx| Arc::clone(&ctx.steps))
            .unwrap_or_else(|| Arc::new(AtomicUsize::new(0)));
        let deadline = config.run_timeout.map(|t| Instant::now() + t);

        let mut run = RunLoop {
            graph,
            channels: create_channels(&graph.channel_specs),
            config,
            checkpointer,
            thread_id,
            store,
            frontier: Frontier::default(),
            step: 0,
            parent_id: None,
            steps,
            deadline,
            nested,
            skip_interrupt_before: false,
            pending_interrupt: None,
        };

        match input {
            Value::Null if nested => run.begin(json!({})).await?,
            Value::Null => run.resume().await?,
            input => run.begin(input).await?,
        }
        Ok(run)
    }

    /// Whether checkpoints are written for this run.
    fn persistent(&self) -> Option<(&Arc<dyn Checkpointer>, &str)> {
        match (&self.checkpointer, &self.thread_id) {
            (Some(cp), Some(thread)) => Some((cp, thread.as_str())),
            _ => None,
        }
    }

    async fn load_selected(&self) -> Result<Option<Checkpoint>> {
        let Some((checkpointer, thread_id)) = self.persistent() else {
            return Ok(None);
        };
        let checkpoint_id = self.config.checkpoint_id();
        let loaded = checkpointer.load(thread_id, checkpoint_id.as_deref()).await?;
        match (loaded, checkpoint_id) {
            (None, Some(checkpoint_id)) => Err(GraphError::CheckpointNotFound {
                thread_id: thread_id.to_string(),
                checkpoint_id,
            }
            .into()),
            (loaded, _) => Ok(loaded),
        }
    }

    fn restore(&mut self, cp: &Checkpoint) {
        restore_channels(&mut self.channels, &cp.channel_values);
        self.step = cp.step;
        self.parent_id = Some(cp.id.clone());
    }

    async fn resume(&mut self) -> Result<()> {
        let Some((_, thread_id)) = self.persistent() else {
            return Err(GraphError::Checkpoint(
                "resuming with a null input requires a checkpointer and a thread_id".into(),
            )
            .into());
        };
        let thread_id = thread_id.to_string();
        let cp = self
            .load_selected()
            .await?
            .ok_or_else(|| GraphError::ThreadNotFound(thread_id.clone()))?;

        tracing::info!(thread_id = %thread_id, checkpoint_id = %cp.id, step = cp.step, "resuming from checkpoint");
        self.restore(&cp);
        self.frontier = Frontier::from_checkpoint(&cp);
        // Resuming a paused or edited thread passes its pending breakpoint once.
        self.skip_interrupt_before = matches!(
            cp.metadata.source,
            CheckpointSource::Interrupt | CheckpointSource::Update
        );
        Ok(())
    }

    /// Commit the run input as if written by `START` and schedule its successors.
    async fn begin(&mut self, input: Value) -> Result<()> {
        if let Some(cp) = self.load_selected().await? {
            self.restore(&cp);
            self.step = cp.step + 1;
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let mut writes = Vec::new();
        self.graph
            .collect_writes(&task_id, START, Some(&input), &mut writes)?;
        let mut staged = clone_channels(&self.channels);
        self.graph.apply_writes(&mut staged, &writes)?;

        let mut frontier = Frontier::default();
        self.graph.route(START, None, &snapshot(&staged), &mut frontier)?;
        self.graph.settle(&mut frontier);

        let checkpoint_id = self
            .save(self.step, &staged, &frontier, writes, CheckpointSource::Input, vec![START.to_string()])
            .await?;
        self.commit(self.step, staged, frontier, checkpoint_id);
        Ok(())
    }

    async fn save(
        &self,
        step: usize,
        channels: &Channels,
        frontier: &Frontier,
        writes: Vec<PendingWrite>,
        source: CheckpointSource,
        writers: Vec<String>,
    ) -> Result<Option<String>> {
        let Some((checkpointer, thread_id)) = self.persistent() else {
            return Ok(None);
        };
        let cp = build_checkpoint(
            thread_id,
            self.parent_id.clone(),
            step,
            channels,
            frontier,
            writes,
            source,
            writers,
        );
        let id = cp.id.clone();
        checkpointer.save(cp).await?;
        Ok(Some(id))
    }

    fn commit(
        &mut self,
        step: usize,
        channels: Channels,
        frontier: Frontier,
        checkpoint_id: Option<String>,
    ) {
        self.step = step;
        self.channels = channels;
        self.frontier = frontier;
        if checkpoint_id.is_some() {
            self.parent_id = checkpoint_id;
        }
    }

    pub async fn tick(&mut self) -> Result<Tick> {
        if let Some((checkpoint_id, interrupt_value)) = self.pending_interrupt.take() {
            return Ok(Tick::Done(Outcome::Interrupted {
                checkpoint_id,
                interrupt_value,
                state: snapshot(&self.channels),
            }));
        }
        if self.frontier.is_idle() {
            return Ok(Tick::Done(Outcome::Complete(snapshot(&self.channels))));
        }

        if self.config.is_cancelled() {
            return Err(GraphError::Cancelled.into());
        }
        if let (Some(deadline), Some(timeout)) = (self.deadline, self.config.run_timeout) {
            if Instant::now() >= deadline {
                return Err(GraphError::RunTimeout { timeout }.into());
            }
        }

        if !self.nested && !self.skip_interrupt_before {
            let hit = self
                .frontier
                .task_nodes()
                .find(|n| self.graph.interrupt_before.contains(*n))
                .map(str::to_string);
            if let Some(node) = hit {
                return self.interrupt_before(node).await;
            }
        }
        self.skip_interrupt_before = false;

        let used = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
        if used > self.config.recursion_limit {
            tracing::error!(limit = self.config.recursion_limit, "recursion limit reached");
            return Err(GraphError::RecursionLimit {
                limit: self.config.recursion_limit,
            }
            .into());
        }

        let step = self.step + 1;
        let span = tracing::info_span!("superstep", step);
        match self.superstep(step).instrument(span).await {
            Ok(tick) => Ok(tick),
            Err(e) => {
                tracing::error!(step, error = %e, "superstep failed");
                Err(e)
            }
        }
    }

    async fn interrupt_before(&mut self, node: String) -> Result<Tick> {
        if self.persistent().is_none() {
            return Err(GraphError::Checkpoint(
                "static interrupts require a checkpointer and a thread_id".into(),
            )
            .into());
        }
        let checkpoint_id = self
            .save(
                self.step,
                &self.channels,
                &self.frontier,
                Vec::new(),
                CheckpointSource::Interrupt,
                Vec::new(),
            )
            .await?
            .unwrap_or_default();
        tracing::info!(node = %node, checkpoint_id = %checkpoint_id, "interrupted before node");
        self.parent_id = Some(checkpoint_id.clone());
        Ok(Tick::Done(Outcome::Interrupted {
            checkpoint_id,
            interrupt_value: json!({"when": "before", "node": node}),
            state: snapshot(&self.channels),
        }))
    }

    fn plan_tasks(&self) -> Result<Vec<Task>> {
        let state = Arc::new(snapshot(&self.channels));
        let node_tasks = self.frontier.nodes.iter().map(|node| (node, Arc::clone(&state)));
        let send_tasks = self
            .frontier
            .sends
            .iter()
            .map(|send| (&send.node, Arc::new(send.arg.clone())));

        node_tasks
            .chain(send_tasks)
            .map(|(node, input)| {
                if self.graph.node(node).is_none() {
                    return Err(GraphError::InvalidGraph(format!(
                        "Scheduled node '{node}' does not exist in this graph"
                    ))
                    .into());
                }
                Ok(Task {
                    id: uuid::Uuid::new_v4().to_string(),
                    node: node.clone(),
                    input,
                })
            })
            .collect()
    }

    fn run_task(&self, task: &Task, step: usize) -> impl Future<Output = Result<NodeOutput>> + Send {
        let node = self.graph.node(&task.node).cloned();
        let name = task.node.clone();
        let timeout = node
            .as_ref()
            .and_then(|n| n.timeout())
            .or(self.config.node_timeout);
        let input = (*task.input).clone();
        let ctx = NodeContext::for_task(
            self.config.clone(),
            self.store.clone(),
            task.id.clone(),
            Arc::clone(&task.input),
            step,
            Arc::clone(&self.steps),
        );

        async move {
            let node = node.ok_or_else(|| GraphError::InvalidGraph(format!("Unknown node '{name}'")))?;
            let fut = node.invoke(input, ctx);
            let result = match timeout {
                Some(timeout) => tokio::time::timeout(timeout, fut).await.map_err(|_| {
                    tracing::warn!(node = %name, ?timeout, "node timed out");
                    GraphError::NodeTimeout {
                        node: name.clone(),
                        timeout,
                    }
                })?,
                None => fut.await,
            };
            result.map_err(|e| node_error(&name, e))
        }
    }

    /// Await `fut` unless the run deadline passes or the run is cancelled first.
    async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let bounded = async {
            match (self.deadline, self.config.run_timeout) {
                (Some(deadline), Some(timeout)) => {
                    match tokio::time::timeout_at(deadline, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(GraphError::RunTimeout { timeout }.into()),
                    }
                }
                _ => fut.await,
            }
        };
        match &self.config.cancellation {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(GraphError::Cancelled.into()),
                result = bounded => result,
            },
            None => bounded.await,
        }
    }

    async fn superstep(&mut self, step: usize) -> Result<Tick> {
        let tasks = self.plan_tasks()?;
        tracing::debug!(tasks = ?tasks.iter().map(|t| t.node.as_str()).collect::<Vec<_>>(), "dispatching tasks");

        let running = futures::future::try_join_all(tasks.iter().map(|t| self.run_task(t, step)));
        let outputs = self.guard(running).await?;

        let mut writes = Vec::new();
        let mut updates = Vec::with_capacity(tasks.len());
        for (task, output) in tasks.iter().zip(&outputs) {
            if let NodeOutput::Command(cmd) = output {
                if cmd.is_parent() {
                    if self.nested {
                        tracing::debug!(node = %task.node, "command bubbles up to the parent graph");
                        return Ok(Tick::Done(Outcome::Parent(cmd.clone())));
                    }
                    return Err(GraphError::InvalidCommand(format!(
                        "node '{}' addressed the parent graph, but the graph is not running as a subgraph",
                        task.node
                    ))
                    .into());
                }
            }
            self.graph
                .collect_writes(&task.id, &task.node, output.update(), &mut writes)?;
            updates.push(TaskUpdate {
                node: task.node.clone(),
                update: output.update().cloned().unwrap_or(Value::Null),
            });
        }

        let mut staged = clone_channels(&self.channels);
        self.graph.apply_writes(&mut staged, &writes)?;
        let state = snapshot(&staged);

        let mut frontier = Frontier {
            barriers: self.frontier.barriers.clone(),
            ..Frontier::default()
        };
        for (task, output) in tasks.iter().zip(&outputs) {
            let goto: Option<&[Goto]> = match output {
                NodeOutput::Command(cmd) if cmd.has_goto() => Some(cmd.goto.as_slice()),
                _ => None,
            };
            self.graph.route(&task.node, goto, &state, &mut frontier)?;
        }
        self.graph.settle(&mut frontier);

        let mut writers: Vec<String> = Vec::new();
        for task in &tasks {
            if !writers.contains(&task.node) {
                writers.push(task.node.clone());
            }
        }

        let checkpoint_id = self
            .save(step, &staged, &frontier, writes, CheckpointSource::Loop, writers.clone())
            .await?;
        self.commit(step, staged, frontier, checkpoint_id.clone());
        tracing::debug!(next = ?self.frontier.nodes, "superstep committed");

        if !self.nested && !self.frontier.is_idle() {
            if let Some(node) = writers.iter().find(|n| self.graph.interrupt_after.contains(*n)) {
                let Some(id) = checkpoint_id.clone() else {
                    return Err(GraphError::Checkpoint(
                        "static interrupts require a checkpointer and a thread_id".into(),
                    )
                    .into());
                };
                tracing::info!(node = %node, checkpoint_id = %id, "interrupted after node");
                self.pending_interrupt = Some((id, json!({"when": "after", "node": node})));
            }
        }

        Ok(Tick::Step(StepReport {
            step,
            checkpoint_id,
            tasks: tasks.into_iter().map(|t| t.node).collect(),
            updates,
            next: self.frontier.task_nodes().map(str::to_string).collect(),
            state,
        }))
    }
}
