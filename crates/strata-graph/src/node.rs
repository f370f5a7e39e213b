use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use strata_checkpoint::command::Command;
use strata_core::config::RunnableConfig;
use strata_core::error::Result;
use strata_store::base::BaseStore;

/// What a node hands back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    /// A partial state object reduced into the channels.
    Update(Value),
    /// A state update combined with explicit routing.
    Command(Command),
}

impl NodeOutput {
    /// The state update carried by this output, if any.
    pub fn update(&self) -> Option<&Value> {
        match self {
            NodeOutput::Update(v) => Some(v),
            NodeOutput::Command(cmd) => cmd.update.as_ref(),
        }
    }
}

impl From<Value> for NodeOutput {
    fn from(v: Value) -> Self {
        NodeOutput::Update(v)
    }
}

impl From<Command> for NodeOutput {
    fn from(cmd: Command) -> Self {
        NodeOutput::Command(cmd)
    }
}

/// Per-task runtime context handed to every node invocation.
///
/// Helpers called from inside a node receive this by reference to reach the
/// run configuration, the cross-thread store, and the input of the task that
/// is currently executing.
#[derive(Clone)]
pub struct NodeContext {
    config: RunnableConfig,
    store: Option<Arc<dyn BaseStore>>,
    task_id: String,
    task_input: Arc<Value>,
    step: usize,
    pub(crate) steps: Arc<AtomicUsize>,
}

impl NodeContext {
    /// A standalone context, for calling nodes outside a graph run.
    pub fn new(config: RunnableConfig) -> Self {
        Self {
            config,
            store: None,
            task_id: uuid::Uuid::new_v4().to_string(),
            task_input: Arc::new(Value::Null),
            step: 0,
            steps: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn BaseStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub(crate) fn for_task(
        config: RunnableConfig,
        store: Option<Arc<dyn BaseStore>>,
        task_id: String,
        task_input: Arc<Value>,
        step: usize,
        steps: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            config,
            store,
            task_id,
            task_input,
            step,
            steps,
        }
    }

    pub fn config(&self) -> &RunnableConfig {
        &self.config
    }

    /// Look up a value in the run's `configurable` bag.
    pub fn configurable(&self, key: &str) -> Option<&Value> {
        self.config.configurable_value(key)
    }

    pub fn store(&self) -> Option<&Arc<dyn BaseStore>> {
        self.store.as_ref()
    }

    /// Identifier of the task this context belongs to.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The input the current task was started with.
    pub fn task_input(&self) -> &Value {
        &self.task_input
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Supersteps consumed so far by this run, nested graphs included.
    pub fn steps_taken(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.config.is_cancelled()
    }
}

type AsyncNodeFn = dyn Fn(Value, NodeContext) -> Pin<Box<dyn Future<Output = Result<NodeOutput>> + Send>>
    + Send
    + Sync;

/// A graph node that wraps an async function operating on JSON state.
///
/// The handler returns anything convertible into [`NodeOutput`]: a plain
/// `Value` (partial state) or a [`Command`].
#[derive(Clone)]
pub struct NodeFn {
    name: String,
    func: Arc<AsyncNodeFn>,
    defer: bool,
    destinations: Vec<String>,
    timeout: Option<Duration>,
}

impl NodeFn {
    /// Create a new node with the given name and async function.
    pub fn new<F, Fut, O>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: Into<NodeOutput> + Send + 'static,
    {
        let func = Arc::new(func);
        Self {
            name: name.into(),
            func: Arc::new(move |input, ctx| {
                let func = Arc::clone(&func);
                Box::pin(async move { func(input, ctx).await.map(Into::into) })
            }),
            defer: false,
            destinations: Vec::new(),
            timeout: None,
        }
    }

    /// Mark this node as a join barrier: it runs only after every
    /// predecessor branch converging on it has delivered.
    pub fn with_defer(mut self) -> Self {
        self.defer = true;
        self
    }

    /// Declare the nodes this node may route to through `Command::goto`.
    pub fn with_destinations<I, S>(mut self, destinations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.destinations = destinations.into_iter().map(Into::into).collect();
        self
    }

    /// Per-node timeout, overriding the run's `node_timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_deferred(&self) -> bool {
        self.defer
    }

    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Invoke this node with the given state and context.
    pub async fn invoke(&self, state: Value, ctx: NodeContext) -> Result<NodeOutput> {
        (self.func)(state, ctx).await
    }
}

impl std::fmt::Debug for NodeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeFn")
            .field("name", &self.name)
            .field("defer", &self.defer)
            .field("destinations", &self.destinations)
            .field("timeout", &self.timeout)
            .finish()
    }
}
