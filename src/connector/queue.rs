//! Connector backed by a named fan-out queue.
//!
//! Inbound, the connector subscribes on `connect` and reads from its own
//! buffer. Outbound, it publishes every message to all subscribers.

use super::{parse_params, Connector, ConnectorError, Direction, NoopStopper, StopHandle, Stopper};
use crate::config::ConnectorConfig;
use crate::context::AppContext;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fanout::{FanoutRegistry, QueueHandle, Subscription};
use crate::pipeline::message::{Message, MessageWrapper};
use crate::pipeline::queue::BoundedQueue;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueueParams {
    name: String,
    #[serde(default)]
    capacity: Option<usize>,
}

struct BufferStopper(Arc<BoundedQueue<MessageWrapper>>);

impl Stopper for BufferStopper {
    fn stop(&self) {
        self.0.shutdown();
    }
}

pub struct QueueConnector {
    direction: Direction,
    fanout: Arc<FanoutRegistry>,
    handle: QueueHandle,
    capacity: usize,
    subscription: Option<Subscription>,
}

impl QueueConnector {
    pub fn new(
        fanout: Arc<FanoutRegistry>,
        name: &str,
        direction: Direction,
        capacity: usize,
    ) -> Self {
        let handle = fanout.get_or_create(name);
        Self {
            direction,
            fanout,
            handle,
            capacity,
            subscription: None,
        }
    }

    pub fn from_config(
        config: &ConnectorConfig,
        direction: Direction,
        ctx: &AppContext,
    ) -> PipelineResult<Self> {
        let params: QueueParams = parse_params(config)?;
        if params.name.is_empty() {
            return Err(PipelineError::Config("queue name must not be empty".to_string()));
        }
        let capacity = params.capacity.unwrap_or(ctx.settings.fanout_capacity);
        Ok(Self::new(ctx.fanout.clone(), &params.name, direction, capacity))
    }

    pub fn queue_name(&self) -> &str {
        self.handle.name()
    }
}

impl Connector for QueueConnector {
    fn type_name(&self) -> &'static str {
        "queue"
    }

    fn connect(&mut self) -> Result<(), ConnectorError> {
        if self.direction == Direction::Outbound || self.subscription.is_some() {
            return Ok(());
        }
        let subscription = self
            .fanout
            .subscribe(&self.handle, self.capacity)
            .map_err(ConnectorError::transport)?;
        self.subscription = Some(subscription);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(sub) = self.subscription.take() {
            self.fanout.unsubscribe(&self.handle, sub.id);
        }
    }

    fn stopper(&self) -> StopHandle {
        match &self.subscription {
            Some(sub) => Arc::new(BufferStopper(sub.buffer.clone())),
            None => Arc::new(NoopStopper),
        }
    }

    fn receive(&mut self) -> Result<Message, ConnectorError> {
        let sub = self
            .subscription
            .as_ref()
            .ok_or_else(|| ConnectorError::Transport("queue connector not connected".into()))?;
        match sub.buffer.pop() {
            Some(wrapper) => Ok(wrapper.working),
            None => Err(ConnectorError::Stopped),
        }
    }

    fn send(&mut self, wrapper: &MessageWrapper) -> Result<(), ConnectorError> {
        let report = self.fanout.publish(&self.handle, wrapper);
        if report.failed > 0 {
            tracing::debug!(
                "Queue '{}': {} of {} subscribers missed a message",
                self.handle.name(),
                report.failed,
                report.failed + report.delivered
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for QueueConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConnector")
            .field("queue", &self.handle.name())
            .field("direction", &self.direction)
            .field("connected", &self.subscription.is_some())
            .finish()
    }
}
