use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use strata_core::error::{GraphError, Result};

type ReducerFn = dyn Fn(&Value, &Value) -> std::result::Result<Value, String> + Send + Sync;

/// Built-in aggregation operators for `BinaryOperatorAggregate`.
#[derive(Clone)]
pub enum AggregateOp {
    /// Add numbers. Integer inputs stay integers.
    Sum,
    /// Keep the maximum number.
    Max,
    /// Keep the minimum number.
    Min,
    /// A user reducer `(accumulated, incoming) -> merged`. An `Err` aborts the superstep.
    Custom(Arc<ReducerFn>),
}

impl AggregateOp {
    /// Wrap a fallible reducer function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Value, &Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        AggregateOp::Custom(Arc::new(f))
    }

    fn apply(&self, current: &Value, incoming: &Value) -> std::result::Result<Value, String> {
        match self {
            AggregateOp::Sum => numeric(current, incoming, |a, b| a.checked_add(b), |a, b| a + b),
            AggregateOp::Max => pick(current, incoming, |a, b| b > a),
            AggregateOp::Min => pick(current, incoming, |a, b| b < a),
            AggregateOp::Custom(f) => f(current, incoming),
        }
    }
}

impl std::fmt::Debug for AggregateOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateOp::Sum => write!(f, "Sum"),
            AggregateOp::Max => write!(f, "Max"),
            AggregateOp::Min => write!(f, "Min"),
            AggregateOp::Custom(_) => write!(f, "Custom(...)"),
        }
    }
}

fn expect_number(v: &Value) -> std::result::Result<f64, String> {
    v.as_f64()
        .ok_or_else(|| format!("expected a number, got {v}"))
}

fn numeric(
    current: &Value,
    incoming: &Value,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> std::result::Result<Value, String> {
    let b = expect_number(incoming)?;
    if current.is_null() {
        return Ok(incoming.clone());
    }
    if let (Some(x), Some(y)) = (current.as_i64(), incoming.as_i64()) {
        if let Some(r) = int_op(x, y) {
            return Ok(Value::from(r));
        }
    }
    let a = expect_number(current)?;
    Ok(Value::from(float_op(a, b)))
}

fn pick(
    current: &Value,
    incoming: &Value,
    replaces: impl Fn(f64, f64) -> bool,
) -> std::result::Result<Value, String> {
    let b = expect_number(incoming)?;
    if current.is_null() {
        return Ok(incoming.clone());
    }
    let a = expect_number(current)?;
    Ok(if replaces(a, b) {
        incoming.clone()
    } else {
        current.clone()
    })
}

/// Specification for creating a channel. Used by `CompiledStateGraph` to
/// create fresh channel instances for each run.
#[derive(Clone, Debug)]
pub enum ChannelSpec {
    /// A `LastValue` channel with the given default.
    LastValue { default: Value },
    /// An `AppendChannel`.
    Append,
    /// A `BinaryOperatorAggregate` channel with a default value and operator.
    BinaryOperator { default: Value, op: AggregateOp },
    /// An `EphemeralValue` channel, cleared at every commit.
    Ephemeral,
    /// A `TopicChannel` (message-queue style).
    Topic { accumulate: bool },
}

impl ChannelSpec {
    /// Create a fresh `Channel` instance from this spec.
    pub fn create(&self) -> Box<dyn Channel> {
        match self {
            ChannelSpec::LastValue { default } => Box::new(LastValue::new(default.clone())),
            ChannelSpec::Append => Box::new(AppendChannel::new()),
            ChannelSpec::BinaryOperator { default, op } => {
                Box::new(BinaryOperatorAggregate::new(default.clone(), op.clone()))
            }
            ChannelSpec::Ephemeral => Box::new(EphemeralValue::new()),
            ChannelSpec::Topic { accumulate } => Box::new(TopicChannel::new(*accumulate)),
        }
    }

    /// Whether concurrent writes overwrite each other instead of merging.
    pub fn is_last_value(&self) -> bool {
        matches!(self, ChannelSpec::LastValue { .. })
    }
}

/// A channel manages a single key in the graph state.
///
/// Channels control how values written during a superstep are merged into
/// the state that the next superstep observes.
pub trait Channel: Send + Sync {
    /// Fold values into the channel, left to right.
    ///
    /// Returns `Ok(true)` if the value changed, `Ok(false)` if unchanged.
    fn update(&mut self, values: Vec<Value>) -> Result<bool>;

    /// Get the current value of the channel.
    fn get(&self) -> &Value;

    /// Serialized form stored in checkpoints.
    fn checkpoint(&self) -> Value;

    /// Restore state from a checkpoint.
    fn restore(&mut self, data: Value);

    /// Reset the channel to its initial state.
    fn reset(&mut self);

    /// Called once per commit, before the round's writes are applied.
    ///
    /// Default: no-op. `EphemeralValue` and non-accumulating `TopicChannel`
    /// clear here.
    fn on_step_end(&mut self) {}

    fn clone_box(&self) -> Box<dyn Channel>;
}

/// A channel that keeps only the last value written.
#[derive(Clone)]
pub struct LastValue {
    value: Value,
    default: Value,
}

impl LastValue {
    pub fn new(default: Value) -> Self {
        Self {
            value: default.clone(),
            default,
        }
    }
}

impl Channel for LastValue {
    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        let Some(new_val) = values.into_iter().last() else {
            return Ok(false);
        };
        if self.value == new_val {
            Ok(false)
        } else {
            self.value = new_val;
            Ok(true)
        }
    }

    fn get(&self) -> &Value {
        &self.value
    }

    fn checkpoint(&self) -> Value {
        self.value.clone()
    }

    fn restore(&mut self, data: Value) {
        self.value = data;
    }

    fn reset(&mut self) {
        self.value = self.default.clone();
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// A channel that appends values to a JSON array.
///
/// Array writes are flattened: writing `[a, b]` appends `a` and `b`.
#[derive(Clone)]
pub struct AppendChannel {
    /// Kept as a JSON array so `get()` can return `&Value`.
    items: Value,
}

impl AppendChannel {
    pub fn new() -> Self {
        Self {
            items: Value::Array(Vec::new()),
        }
    }
}

impl Default for AppendChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for AppendChannel {
    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        let Value::Array(items) = &mut self.items else {
            return Err(GraphError::Channel("append channel holds a non-array value".into()).into());
        };
        for value in values {
            match value {
                Value::Array(arr) => items.extend(arr),
                other => items.push(other),
            }
        }
        Ok(true)
    }

    fn get(&self) -> &Value {
        &self.items
    }

    fn checkpoint(&self) -> Value {
        self.items.clone()
    }

    fn restore(&mut self, data: Value) {
        self.items = match data {
            Value::Array(arr) => Value::Array(arr),
            Value::Null => Value::Array(Vec::new()),
            other => Value::Array(vec![other]),
        };
    }

    fn reset(&mut self) {
        self.items = Value::Array(Vec::new());
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// BinaryOperatorAggregate
// ---------------------------------------------------------------------------

/// A channel that folds every write into an accumulator with an `AggregateOp`.
#[derive(Clone)]
pub struct BinaryOperatorAggregate {
    value: Value,
    default: Value,
    op: AggregateOp,
}

impl BinaryOperatorAggregate {
    pub fn new(default: Value, op: AggregateOp) -> Self {
        Self {
            value: default.clone(),
            default,
            op,
        }
    }
}

impl Channel for BinaryOperatorAggregate {
    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        let mut acc = self.value.clone();
        for v in &values {
            acc = self.op.apply(&acc, v).map_err(GraphError::Channel)?;
        }
        let changed = acc != self.value;
        self.value = acc;
        Ok(changed)
    }

    fn get(&self) -> &Value {
        &self.value
    }

    fn checkpoint(&self) -> Value {
        self.value.clone()
    }

    fn restore(&mut self, data: Value) {
        self.value = data;
    }

    fn reset(&mut self) {
        self.value = self.default.clone();
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// EphemeralValue
// ---------------------------------------------------------------------------

/// A value visible for exactly one superstep and never persisted.
#[derive(Clone, Default)]
pub struct EphemeralValue {
    value: Value,
}

impl EphemeralValue {
    pub fn new() -> Self {
        Self { value: Value::Null }
    }
}

impl Channel for EphemeralValue {
    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        let Some(new_val) = values.into_iter().last() else {
            return Ok(false);
        };
        if self.value == new_val {
            Ok(false)
        } else {
            self.value = new_val;
            Ok(true)
        }
    }

    fn get(&self) -> &Value {
        &self.value
    }

    fn checkpoint(&self) -> Value {
        Value::Null
    }

    fn restore(&mut self, _data: Value) {
        self.value = Value::Null;
    }

    fn reset(&mut self) {
        self.value = Value::Null;
    }

    fn on_step_end(&mut self) {
        self.value = Value::Null;
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// TopicChannel
// ---------------------------------------------------------------------------

/// A message-queue style channel with optional accumulation.
///
/// When `accumulate` is `false`, values are consumed at the next commit.
/// When `true`, values persist across supersteps.
#[derive(Clone)]
pub struct TopicChannel {
    values: Value,
    accumulate: bool,
}

impl TopicChannel {
    pub fn new(accumulate: bool) -> Self {
        Self {
            values: Value::Array(Vec::new()),
            accumulate,
        }
    }
}

impl Channel for TopicChannel {
    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        if let Value::Array(arr) = &mut self.values {
            arr.extend(values);
        } else {
            self.values = Value::Array(values);
        }
        Ok(true)
    }

    fn get(&self) -> &Value {
        &self.values
    }

    fn checkpoint(&self) -> Value {
        self.values.clone()
    }

    fn restore(&mut self, data: Value) {
        self.values = match data {
            Value::Array(arr) => Value::Array(arr),
            Value::Null => Value::Array(Vec::new()),
            other => Value::Array(vec![other]),
        };
    }

    fn reset(&mut self) {
        self.values = Value::Array(Vec::new());
    }

    fn on_step_end(&mut self) {
        if !self.accumulate {
            self.reset();
        }
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// The live channels of one run, keyed by state key.
pub(crate) type Channels = BTreeMap<String, Box<dyn Channel>>;

pub(crate) fn create_channels(specs: &BTreeMap<String, ChannelSpec>) -> Channels {
    specs.iter().map(|(k, spec)| (k.clone(), spec.create())).collect()
}

pub(crate) fn clone_channels(channels: &Channels) -> Channels {
    channels
        .iter()
        .map(|(k, ch)| (k.clone(), ch.clone_box()))
        .collect()
}

/// The state object nodes and routers observe.
pub(crate) fn snapshot(channels: &Channels) -> Value {
    Value::Object(
        channels
            .iter()
            .map(|(k, ch)| (k.clone(), ch.get().clone()))
            .collect(),
    )
}

pub(crate) fn checkpoint_values(channels: &Channels) -> HashMap<String, Value> {
    channels
        .iter()
        .map(|(k, ch)| (k.clone(), ch.checkpoint()))
        .collect()
}

pub(crate) fn restore_channels(channels: &mut Channels, values: &HashMap<String, Value>) {
    for (key, value) in values {
        match channels.get_mut(key) {
            Some(ch) => ch.restore(value.clone()),
            None => tracing::warn!(channel = %key, "checkpoint holds an undeclared channel; ignored"),
        }
    }
}
