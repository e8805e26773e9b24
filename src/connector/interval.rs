//! Inbound connector that emits a fixed message on a timer.

use super::{parse_params, Connector, ConnectorError, StopHandle, StopLatch};
use crate::config::ConnectorConfig;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::message::{Message, MessageWrapper, Payload};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

fn default_period_ms() -> u64 {
    1000
}

fn default_topic() -> String {
    "interval".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IntervalParams {
    /// String payloads are sent raw, anything else as a document.
    payload: Value,
    #[serde(default = "default_period_ms")]
    period_ms: u64,
    #[serde(default = "default_topic")]
    topic: String,
}

#[derive(Debug)]
pub struct IntervalConnector {
    template: Message,
    period: Duration,
    latch: Arc<StopLatch>,
}

impl IntervalConnector {
    pub fn new(template: Message, period: Duration) -> Self {
        Self {
            template,
            period,
            latch: StopLatch::new(),
        }
    }

    pub fn from_config(config: &ConnectorConfig) -> PipelineResult<Self> {
        let params: IntervalParams = parse_params(config)?;
        if params.period_ms == 0 {
            return Err(PipelineError::Config(
                "interval period_ms must be positive".to_string(),
            ));
        }
        let template = match params.payload {
            Value::String(text) => Message::raw(params.topic, text.into_bytes()),
            doc => Message::document(params.topic, doc),
        };
        Ok(Self::new(template, Duration::from_millis(params.period_ms)))
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Connector for IntervalConnector {
    fn type_name(&self) -> &'static str {
        "interval"
    }

    fn connect(&mut self) -> Result<(), ConnectorError> {
        self.latch.reset();
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn stopper(&self) -> StopHandle {
        self.latch.clone()
    }

    fn receive(&mut self) -> Result<Message, ConnectorError> {
        if self.latch.wait_timeout(self.period) {
            return Err(ConnectorError::Stopped);
        }
        // Fresh envelope per tick so each message gets its own timestamp.
        Ok(match self.template.payload() {
            Payload::Document(doc) => {
                Message::document(self.template.topic(), doc.clone())
            }
            _ => Message::raw(
                self.template.topic(),
                self.template
                    .as_bytes()
                    .map_err(ConnectorError::transport)?
                    .to_vec(),
            ),
        })
    }

    fn send(&mut self, _wrapper: &MessageWrapper) -> Result<(), ConnectorError> {
        Err(ConnectorError::Transport(
            "interval connector is inbound only".to_string(),
        ))
    }
}
