//! Inbound and outbound transports.
//!
//! A pipeline owns exactly one inbound and one outbound [`Connector`]. The
//! receive thread blocks in [`Connector::receive`]; the control thread
//! unblocks it through the connector's [`Stopper`], which is taken after
//! each successful `connect` so it always refers to the live session.
//!
//! # Built-in connectors
//!
//! | type       | in | out |
//! |------------|----|-----|
//! | `queue`    | ✓  | ✓   |
//! | `null`     | ✓  | ✓   |
//! | `log`      |    | ✓   |
//! | `file`     | ✓  | ✓   |
//! | `interval` | ✓  |     |
//!
//! [`ChannelConnector`] is available programmatically.

pub mod channel;
pub mod file;
pub mod interval;
pub mod log;
pub mod null;
pub mod queue;

pub use channel::{ChannelConnector, ChannelPair};
pub use file::{FileInbound, FileOutbound};
pub use interval::IntervalConnector;
pub use log::LogConnector;
pub use null::NullConnector;
pub use queue::QueueConnector;

use crate::config::ConnectorConfig;
use crate::context::AppContext;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::message::{Message, MessageWrapper};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a connector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Nothing arrived; the caller should simply try again.
    #[error("no data")]
    NoData,

    /// The connector was stopped while waiting.
    #[error("connector stopped")]
    Stopped,

    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectorError {
    pub fn transport(e: impl std::fmt::Display) -> Self {
        ConnectorError::Transport(e.to_string())
    }
}

/// Handle that unblocks a pending `receive` from another thread.
pub trait Stopper: Send + Sync {
    fn stop(&self);
}

pub type StopHandle = Arc<dyn Stopper>;

/// Stopper for connectors that never block.
#[derive(Debug, Default)]
pub struct NoopStopper;

impl Stopper for NoopStopper {
    fn stop(&self) {}
}

/// A message transport.
#[cfg_attr(test, mockall::automock)]
pub trait Connector: Send {
    /// Connector type discriminator.
    fn type_name(&self) -> &'static str;

    /// Open the transport. Called by `start`, possibly again after a stop.
    fn connect(&mut self) -> Result<(), ConnectorError>;

    /// Release the transport.
    fn disconnect(&mut self);

    /// Stop handle for the current session.
    fn stopper(&self) -> StopHandle;

    /// Block until a message arrives, the connector is stopped or fails.
    fn receive(&mut self) -> Result<Message, ConnectorError>;

    /// Deliver one message.
    fn send(&mut self, wrapper: &MessageWrapper) -> Result<(), ConnectorError>;
}

/// Which side of a pipeline a connector serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Message counter plus last-seen timestamp for one direction.
#[derive(Debug, Default)]
pub struct ConnectorStats {
    count: AtomicU64,
    last: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of [`ConnectorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub count: u64,
    pub last: Option<DateTime<Utc>>,
}

impl ConnectorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            count: self.count.load(Ordering::Relaxed),
            last: *self.last.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Resettable stop flag that blocked readers can wait on.
#[derive(Debug, Default)]
pub struct StopLatch {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Clear the flag for a new session.
    pub fn reset(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until stopped.
    pub fn wait(&self) {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .cond
            .wait_while(guard, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Wait up to `timeout`. Returns true if stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

impl Stopper for StopLatch {
    fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }
}

pub(crate) fn parse_params<T: DeserializeOwned>(config: &ConnectorConfig) -> PipelineResult<T> {
    serde_json::from_value(Value::Object(config.params.clone())).map_err(|e| {
        PipelineError::Config(format!("connector '{}': {}", config.connector_type, e))
    })
}

fn unsupported(config: &ConnectorConfig, direction: Direction) -> PipelineError {
    PipelineError::Config(format!(
        "connector '{}' cannot be used as {}",
        config.connector_type, direction
    ))
}

/// Factory for connectors selected by their `type` string.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectorFactory;

impl ConnectorFactory {
    pub fn new() -> Self {
        Self
    }

    /// Names of all configurable connector types.
    pub fn types() -> &'static [&'static str] {
        &["queue", "null", "log", "file", "interval"]
    }

    pub fn create(
        &self,
        config: &ConnectorConfig,
        direction: Direction,
        ctx: &AppContext,
    ) -> PipelineResult<Box<dyn Connector>> {
        let connector: Box<dyn Connector> = match (config.connector_type.as_str(), direction) {
            ("queue", _) => Box::new(QueueConnector::from_config(config, direction, ctx)?),
            ("null", _) => Box::new(NullConnector::from_config(config)?),
            ("log", Direction::Outbound) => Box::new(LogConnector::from_config(config)?),
            ("file", Direction::Inbound) => Box::new(FileInbound::from_config(config)?),
            ("file", Direction::Outbound) => Box::new(FileOutbound::from_config(config)?),
            ("interval", Direction::Inbound) => Box::new(IntervalConnector::from_config(config)?),
            ("log", _) | ("interval", _) => return Err(unsupported(config, direction)),
            (other, _) => return Err(PipelineError::UnknownConnectorType(other.to_string())),
        };
        Ok(connector)
    }
}
