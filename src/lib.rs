//! # msgbridge-rs: Message-to-everything bridge
//!
//! Messages are ingested from one transport, run through a configurable chain
//! of filter/transform stages and emitted to another transport. Many
//! independently configured pipelines run concurrently in one process.
//!
//! ## Architecture
//!
//! - **Pipeline engine**: receive / process / send threads per pipeline joined
//!   by bounded queues, plus a control thread owning the state machine
//! - **Stage chain**: accept/reject branching, goto-style control transfer and
//!   one-to-many generator stages
//! - **Fan-out**: named broadcast queues connecting pipelines
//! - **Scripting**: Rhai-based `script` stage
//! - **Communication**: Crossbeam channels for control requests
//!
//! ## Configuration
//!
//! Settings (`msgbridge.toml`) and the pipeline document (`pipelines.json`)
//! are stored in the platform config directory under `msgbridge-rs`:
//!
//! - **Linux**: `~/.config/msgbridge-rs/`
//! - **macOS**: `~/Library/Application Support/msgbridge-rs/`
//! - **Windows**: `%APPDATA%\msgbridge-rs\`
//!
//! ## Example
//!
//! ```ignore
//! use msgbridge_rs::{
//!     config::{BridgeConfig, PipelinesDocument},
//!     context::AppContext,
//!     pipeline::PipelineRegistry,
//! };
//!
//! let config = BridgeConfig::load_or_default(None);
//! let ctx = AppContext::shared(config.runtime.clone());
//! let mut registry = PipelineRegistry::new(ctx);
//! registry.load(&PipelinesDocument::load_or_default(config.pipelines_path()));
//! registry.start_all();
//! ```

pub mod config;
pub mod connector;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod scripting;

// Re-export commonly used types
pub use config::{BridgeConfig, PipelineConfig, PipelinesDocument};
pub use connector::{Connector, ConnectorError};
pub use context::AppContext;
pub use error::{BridgeError, Result};
pub use pipeline::{Message, MessageWrapper, PipelineRegistry, PipelineState};
pub use scripting::{ExecutionContext, ScriptEngine};
