use serde_json::json;
use strata_core::config::RunnableConfig;

/// Config key constants for checkpoint-related configuration.
pub mod config_keys {
    pub const THREAD_ID: &str = "thread_id";
    pub const CHECKPOINT_ID: &str = "checkpoint_id";
}

/// Extension trait for RunnableConfig to easily set checkpoint-related values.
pub trait CheckpointConfigExt {
    fn with_thread_id(self, thread_id: impl Into<String>) -> Self;
    fn with_checkpoint_id(self, checkpoint_id: impl Into<String>) -> Self;
    fn without_checkpoint_id(self) -> Self;
    fn thread_id(&self) -> Option<String>;
    fn checkpoint_id(&self) -> Option<String>;
}

impl CheckpointConfigExt for RunnableConfig {
    fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.configurable
            .insert(config_keys::THREAD_ID.into(), json!(thread_id.into()));
        self
    }

    fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.configurable
            .insert(config_keys::CHECKPOINT_ID.into(), json!(checkpoint_id.into()));
        self
    }

    fn without_checkpoint_id(mut self) -> Self {
        self.configurable.remove(config_keys::CHECKPOINT_ID);
        self
    }

    fn thread_id(&self) -> Option<String> {
        self.configurable
            .get(config_keys::THREAD_ID)
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    fn checkpoint_id(&self) -> Option<String> {
        self.configurable
            .get(config_keys::CHECKPOINT_ID)
            .and_then(|v| v.as_str())
            .map(String::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_thread_id() {
        let config = RunnableConfig::default().with_thread_id("thread-1");
        assert_eq!(config.thread_id(), Some("thread-1".to_string()));
    }

    #[test]
    fn set_and_get_checkpoint_id() {
        let config = RunnableConfig::default().with_checkpoint_id("cp-42");
        assert_eq!(config.checkpoint_id(), Some("cp-42".to_string()));
    }

    #[test]
    fn missing_values_return_none() {
        let config = RunnableConfig::default();
        assert_eq!(config.thread_id(), None);
        assert_eq!(config.checkpoint_id(), None);
    }

    #[test]
    fn clearing_checkpoint_id_keeps_thread() {
        let config = RunnableConfig::default()
            .with_thread_id("t-1")
            .with_checkpoint_id("cp-1")
            .without_checkpoint_id();
        assert_eq!(config.thread_id(), Some("t-1".to_string()));
        assert_eq!(config.checkpoint_id(), None);
    }

    #[test]
    fn chaining_preserves_other_config() {
        let config = RunnableConfig::default()
            .with_tag("test")
            .with_thread_id("t-1")
            .with_checkpoint_id("cp-1");

        assert_eq!(config.tags, vec!["test"]);
        assert_eq!(config.thread_id(), Some("t-1".to_string()));
        assert_eq!(config.checkpoint_id(), Some("cp-1".to_string()));
    }

    #[test]
    fn overwrite_thread_id() {
        let config = RunnableConfig::default()
            .with_thread_id("old")
            .with_thread_id("new");
        assert_eq!(config.thread_id(), Some("new".to_string()));
    }

    #[test]
    fn non_string_thread_id_is_ignored() {
        let config = RunnableConfig::default().with_configurable(config_keys::THREAD_ID, json!(7));
        assert_eq!(config.thread_id(), None);
    }
}
