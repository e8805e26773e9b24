//! Test data builders for pipeline configurations

use msgbridge_rs::config::{ConnectorConfig, PipelineConfig, StageConfig};

pub fn queue(name: &str) -> ConnectorConfig {
    ConnectorConfig::new("queue").param("name", name)
}

pub fn null() -> ConnectorConfig {
    ConnectorConfig::new("null")
}

/// Builder for creating test pipeline configurations
pub struct PipelineBuilder {
    connector_in: ConnectorConfig,
    connector_out: ConnectorConfig,
    stages: Vec<StageConfig>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            connector_in: null(),
            connector_out: null(),
            stages: Vec::new(),
        }
    }

    pub fn input(mut self, connector: ConnectorConfig) -> Self {
        self.connector_in = connector;
        self
    }

    pub fn output(mut self, connector: ConnectorConfig) -> Self {
        self.connector_out = connector;
        self
    }

    pub fn stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.connector_in, self.connector_out);
        config.stages = self.stages;
        config
    }
}

/// The comparator/builder chain that switches a cooler on above 30 degrees.
pub fn cooler_stages() -> Vec<StageConfig> {
    let mut comparator = StageConfig::new("comparator")
        .param("key", "temp")
        .param("operator", ">")
        .param("value", 30);
    comparator.common.goto_passed = Some("cooler_on".to_string());
    comparator.common.goto_rejected = Some("cooler_off".to_string());

    let mut on = StageConfig::new("builder")
        .named("cooler_on")
        .param("template", serde_json::json!({"cooling": true}));
    on.common.goto = Some("out".to_string());

    let off = StageConfig::new("builder")
        .named("cooler_off")
        .param("template", serde_json::json!({"cooling": false}));

    vec![comparator, on, off]
}

/// Stage config with a redirect to each of `queues`.
pub fn redirecting(stage: StageConfig, queues: &[&str]) -> StageConfig {
    let mut stage = stage;
    stage.common.redirect = queues.iter().map(|q| q.to_string()).collect();
    stage
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_builder() {
        let config = PipelineBuilder::new()
            .input(queue("in"))
            .stage(StageConfig::new("noop"))
            .build();
        assert_eq!(config.connector_in.connector_type, "queue");
        assert_eq!(config.connector_out.connector_type, "null");
        assert_eq!(config.stages.len(), 1);
    }
}
