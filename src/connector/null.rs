//! Connector that never produces and discards everything it is given.

use super::{parse_params, Connector, ConnectorError, StopHandle, StopLatch};
use crate::config::ConnectorConfig;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::message::{Message, MessageWrapper};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NullParams {}

#[derive(Debug)]
pub struct NullConnector {
    latch: Arc<StopLatch>,
}

impl NullConnector {
    pub fn new() -> Self {
        Self {
            latch: StopLatch::new(),
        }
    }

    pub fn from_config(config: &ConnectorConfig) -> PipelineResult<Self> {
        let _: NullParams = parse_params(config)?;
        Ok(Self::new())
    }
}

impl Default for NullConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for NullConnector {
    fn type_name(&self) -> &'static str {
        "null"
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
        self.latch.wait();
        Err(ConnectorError::Stopped)
    }

    fn send(&mut self, _wrapper: &MessageWrapper) -> Result<(), ConnectorError> {
        Ok(())
    }
}
