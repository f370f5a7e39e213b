use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::run_loop::StepReport;

/// Which event a stream yields for each committed superstep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// The full state after the superstep.
    #[default]
    Values,
    /// Only the per-node updates of the superstep.
    Updates,
    /// Task names, the next frontier, checkpoint id and full state.
    Debug,
}

/// The update a single task contributed to a superstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub node: String,
    pub update: Value,
}

/// Events emitted during graph execution streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Values {
        step: usize,
        state: Value,
    },
    /// One entry per task, in task order.
    Updates {
        step: usize,
        updates: Vec<TaskUpdate>,
    },
    Debug {
        step: usize,
        /// `None` when the run is not checkpointed.
        checkpoint_id: Option<String>,
        tasks: Vec<String>,
        next: Vec<String>,
        state: Value,
    },
    /// The run suspended at a static interrupt. Always the last event.
    Interrupted {
        checkpoint_id: String,
        interrupt_value: Value,
        state: Value,
    },
}

impl StreamEvent {
    pub(crate) fn from_report(report: StepReport, mode: StreamMode) -> Self {
        match mode {
            StreamMode::Values => StreamEvent::Values {
                step: report.step,
                state: report.state,
            },
            StreamMode::Updates => StreamEvent::Updates {
                step: report.step,
                updates: report.updates,
            },
            StreamMode::Debug => StreamEvent::Debug {
                step: report.step,
                checkpoint_id: report.checkpoint_id,
                tasks: report.tasks,
                next: report.next,
                state: report.state,
            },
        }
    }

    /// The superstep this event belongs to, if it describes one.
    pub fn step(&self) -> Option<usize> {
        match self {
            StreamEvent::Values { step, .. }
            | StreamEvent::Updates { step, .. }
            | StreamEvent::Debug { step, .. } => Some(*step),
            StreamEvent::Interrupted { .. } => None,
        }
    }
}
