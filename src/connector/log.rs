//! Outbound connector that writes each message to the tracing log.

use super::{parse_params, Connector, ConnectorError, NoopStopper, StopHandle};
use crate::config::ConnectorConfig;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::message::{Message, MessageWrapper, Payload};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogParams {
    #[serde(default)]
    prefix: String,
}

#[derive(Debug, Default)]
pub struct LogConnector {
    prefix: String,
}

impl LogConnector {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &ConnectorConfig) -> PipelineResult<Self> {
        let params: LogParams = parse_params(config)?;
        Ok(Self::new(params.prefix))
    }
}

/// One-line rendering of a payload for logs.
pub fn render_payload(message: &Message) -> String {
    match message.payload() {
        Payload::Document(doc) => doc.to_string(),
        Payload::Raw(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => format!("<{} bytes>", bytes.len()),
        },
        Payload::BinaryMap(map) => {
            let fields: Vec<String> = map
                .iter()
                .map(|(name, bytes)| format!("{}: <{} bytes>", name, bytes.len()))
                .collect();
            format!("{{{}}}", fields.join(", "))
        }
    }
}

impl Connector for LogConnector {
    fn type_name(&self) -> &'static str {
        "log"
    }

    fn connect(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn stopper(&self) -> StopHandle {
        Arc::new(NoopStopper)
    }

    fn receive(&mut self) -> Result<Message, ConnectorError> {
        Err(ConnectorError::Transport(
            "log connector is outbound only".to_string(),
        ))
    }

    fn send(&mut self, wrapper: &MessageWrapper) -> Result<(), ConnectorError> {
        tracing::info!(
            topic = wrapper.working.topic(),
            kind = %wrapper.working.kind(),
            "{}{}",
            self.prefix,
            render_payload(&wrapper.working)
        );
        Ok(())
    }
}
