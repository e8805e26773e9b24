//! Message pipeline engine.
//!
//! A pipeline moves messages from an inbound connector through a chain of
//! stages to an outbound connector. Many pipelines run side by side; any
//! stage can mirror a message into a named fan-out queue that other
//! pipelines consume.
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────── PipelineRuntime ──────────────┐
//! [inbound] ─► receive ─► [raw] ─► process ─► [wrapped] ─► send ─► [outbound]
//!                                    │
//!                               StageChain ──redirect──► FanoutRegistry ──► other pipelines
//! ```
//!
//! # Design
//!
//! - **Trait objects at the seams**: stages and connectors are `Box<dyn _>`
//!   built once by a factory keyed by the `type` string.
//! - **Precompiled routing**: goto labels are resolved to indices when the
//!   chain is built.
//! - **Generators**: a one-to-many stage returns a producer; the chain owns
//!   the generation state and drains it before taking new input.
//! - **Explicit context**: the fan-out directory lives in [`AppContext`],
//!   not in a global.
//!
//! [`AppContext`]: crate::context::AppContext

pub mod chain;
pub mod error;
pub mod event;
pub mod fanout;
pub mod message;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod stage;
pub mod stage_type;
pub mod stages;

pub use chain::{ChainOutput, RoutePlan, StageChain, DEFAULT_MAX_HOPS};
pub use error::{PipelineError, PipelineResult};
pub use event::{EventScheduler, StageEvent};
pub use fanout::{FanoutRegistry, PublishReport, QueueHandle, Subscription, SubscriptionId};
pub use message::{ChunkTag, Message, MessageType, MessageWrapper, Payload};
pub use queue::{BoundedQueue, WakeSignal};
pub use registry::PipelineRegistry;
pub use runtime::{PipelineRuntime, PipelineState, PipelineStatus};
pub use stage::{ConfiguredStage, Producer, Stage, StageCommon, StageContext, StageOutcome};
pub use stage_type::{StageFactory, StageType};
