use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use strata_checkpoint::command::Goto;

/// A static edge connecting two nodes.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

type RouteFn = dyn Fn(&Value) -> Vec<Goto> + Send + Sync;

/// A conditional edge that routes to different targets based on state.
///
/// The routing function inspects the state committed by the superstep that
/// ran the source node and returns one or more keys. If a `path_map` is
/// provided, each key is looked up in the map to determine the actual target
/// node; keys missing from the map are used verbatim. Targets that name no
/// node fail the superstep with a routing error.
#[derive(Clone)]
pub struct ConditionalEdge {
    pub from: String,
    route_fn: Arc<RouteFn>,
    path_map: Option<HashMap<String, String>>,
}

impl ConditionalEdge {
    /// Create a conditional edge whose router picks a single key.
    pub fn new<F>(
        from: impl Into<String>,
        route_fn: F,
        path_map: Option<HashMap<String, String>>,
    ) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        Self::fan_out(from, move |state| vec![Goto::Node(route_fn(state))], path_map)
    }

    /// Create a conditional edge whose router may activate several nodes.
    pub fn multi<F>(
        from: impl Into<String>,
        route_fn: F,
        path_map: Option<HashMap<String, String>>,
    ) -> Self
    where
        F: Fn(&Value) -> Vec<String> + Send + Sync + 'static,
    {
        Self::fan_out(
            from,
            move |state| route_fn(state).into_iter().map(Goto::Node).collect(),
            path_map,
        )
    }

    /// Create a conditional edge whose router may also emit `Send` tasks.
    pub fn fan_out<F>(
        from: impl Into<String>,
        route_fn: F,
        path_map: Option<HashMap<String, String>>,
    ) -> Self
    where
        F: Fn(&Value) -> Vec<Goto> + Send + Sync + 'static,
    {
        Self {
            from: from.into(),
            route_fn: Arc::new(route_fn),
            path_map,
        }
    }

    /// Get the path map, if any.
    pub fn path_map(&self) -> Option<&HashMap<String, String>> {
        self.path_map.as_ref()
    }

    /// Resolve the routing targets for the given state.
    pub fn resolve(&self, state: &Value) -> Vec<Goto> {
        (self.route_fn)(state)
            .into_iter()
            .map(|goto| match (goto, &self.path_map) {
                (Goto::Node(key), Some(map)) => {
                    Goto::Node(map.get(&key).cloned().unwrap_or(key))
                }
                (goto, _) => goto,
            })
            .collect()
    }
}

impl std::fmt::Debug for ConditionalEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("from", &self.from)
            .field("path_map", &self.path_map)
            .finish()
    }
}
