//! Stage abstraction for the processing chain.
//!
//! A stage consumes one in-flight [`MessageWrapper`], decides accept/reject
//! and may rewrite the working message. Stages that expand one message into
//! many return [`StageOutcome::Generate`] with a finite [`Producer`]; the
//! chain, not the stage, owns the generation and polls the producer dry.
//! A stage that keeps a message back for a timed release returns
//! [`StageOutcome::Hold`].
//!
//! Everything that controls routing (name, goto targets, redirects, negation,
//! metadata) lives in [`StageCommon`] and is applied by the chain, so
//! individual stages only implement their own decision.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::event::{EventScheduler, StageEvent};
use crate::pipeline::message::{Message, MessageType, MessageWrapper};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Literal goto target naming the end of the chain.
pub const OUT_TARGET: &str = "out";

/// Representation a stage expects its input in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    #[default]
    Any,
    Raw,
    Document,
    BinaryMap,
}

impl Expect {
    pub fn message_type(self) -> Option<MessageType> {
        match self {
            Expect::Any => None,
            Expect::Raw => Some(MessageType::Raw),
            Expect::Document => Some(MessageType::Document),
            Expect::BinaryMap => Some(MessageType::BinaryMap),
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Routing configuration shared by every stage type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageCommon {
    /// Label used as a goto target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Representation the stage needs; conversion failure is a stage error.
    #[serde(default, skip_serializing_if = "is_any")]
    pub expect: Expect,

    /// Invert the stage's accept/reject decision.
    #[serde(default, rename = "not", skip_serializing_if = "is_false")]
    pub negate: bool,

    /// Fan-out queues that receive a copy on every visit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect: Vec<String>,

    /// Metadata merged into the wrapper before the stage runs.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,

    /// Unconditional next stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,

    /// Next stage when accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto_passed: Option<String>,

    /// Next stage when rejected. Without it a rejected message is dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto_rejected: Option<String>,
}

fn is_any(e: &Expect) -> bool {
    *e == Expect::Any
}

fn non_empty(target: &Option<String>) -> Option<&str> {
    target.as_deref().filter(|t| !t.is_empty())
}

impl StageCommon {
    pub fn goto(&self) -> Option<&str> {
        non_empty(&self.goto)
    }

    pub fn goto_passed(&self) -> Option<&str> {
        non_empty(&self.goto_passed)
    }

    pub fn goto_rejected(&self) -> Option<&str> {
        non_empty(&self.goto_rejected)
    }

    pub fn label(&self) -> Option<&str> {
        non_empty(&self.name)
    }
}

/// Finite, single-pass sequence of messages emitted by a generating stage.
pub struct Producer {
    inner: Box<dyn Iterator<Item = Message> + Send>,
}

impl Producer {
    pub fn new(iter: impl Iterator<Item = Message> + Send + 'static) -> Self {
        Self {
            inner: Box::new(iter),
        }
    }

    pub fn from_vec(messages: Vec<Message>) -> Self {
        Self::new(messages.into_iter())
    }

    /// Next generated message, or `None` once exhausted.
    pub fn next_message(&mut self) -> Option<Message> {
        self.inner.next()
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("size_hint", &self.inner.size_hint())
            .finish()
    }
}

/// What a stage did with the message it was given.
#[derive(Debug)]
pub enum StageOutcome {
    /// The stage set accept/reject and possibly rewrote the working message.
    Done,
    /// The stage captured the message and emits it in pieces.
    Generate(Producer),
    /// The stage kept the message and will release it from `on_timer`.
    /// The current walk ends here without branching.
    Hold,
}

/// Per-invocation context handed to a stage.
pub struct StageContext<'a> {
    /// Id of the pipeline the chain belongs to.
    pub pipeline_id: &'a str,
    /// Index of the stage in the chain.
    pub stage_index: usize,
    /// One-shot timer facility of the running pipeline.
    pub scheduler: &'a EventScheduler,
}

impl StageContext<'_> {
    /// Ask the process loop to call this stage's `on_timer` after `delay`.
    pub fn schedule(&self, delay: Duration, token: u64) {
        self.scheduler.schedule(
            delay,
            StageEvent {
                stage_index: self.stage_index,
                token,
            },
        );
    }
}

/// A single processing step of a chain.
pub trait Stage: Send {
    /// Discriminator of this stage's type (`"comparator"`, `"splitter"`, ...).
    fn type_name(&self) -> &'static str;

    /// Process the wrapper in place.
    fn process(
        &mut self,
        wrapper: &mut MessageWrapper,
        ctx: &mut StageContext,
    ) -> PipelineResult<StageOutcome>;

    /// Called when an event scheduled by this stage fires. A returned message
    /// continues down the chain as accepted from this stage.
    fn on_timer(&mut self, _token: u64, _ctx: &mut StageContext) -> PipelineResult<Option<Message>> {
        Ok(None)
    }

    /// Called when the pipeline starts running.
    fn on_start(&mut self) {}

    /// Called after the pipeline stopped.
    fn on_stop(&mut self) {}
}

/// A stage together with its routing configuration.
pub struct ConfiguredStage {
    pub common: StageCommon,
    pub stage: Box<dyn Stage>,
}

impl ConfiguredStage {
    pub fn new(common: StageCommon, stage: Box<dyn Stage>) -> Self {
        Self { common, stage }
    }

    /// Name used in logs and errors: the label, or the type name.
    pub fn display_name(&self) -> &str {
        self.common.label().unwrap_or_else(|| self.stage.type_name())
    }
}

impl std::fmt::Debug for ConfiguredStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredStage")
            .field("type", &self.stage.type_name())
            .field("common", &self.common)
            .finish()
    }
}

/// Value kind of a configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

/// Self-describing schema entry for one configuration field.
#[derive(Debug, Clone, Serialize)]
pub struct FieldSchema {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub default: Option<&'static str>,
    pub allowed: &'static [&'static str],
}

impl FieldSchema {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            default: None,
            allowed: &[],
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind, default: Option<&'static str>) -> Self {
        Self {
            name,
            kind,
            required: false,
            default,
            allowed: &[],
        }
    }

    pub const fn one_of(mut self, allowed: &'static [&'static str]) -> Self {
        self.allowed = allowed;
        self
    }
}

/// Fields every stage accepts in addition to its own.
pub static COMMON_FIELDS: &[FieldSchema] = &[
    FieldSchema::required("type", FieldKind::String),
    FieldSchema::optional("name", FieldKind::String, None),
    FieldSchema::optional("expect", FieldKind::String, Some("any"))
        .one_of(&["any", "raw", "document", "binary_map"]),
    FieldSchema::optional("not", FieldKind::Boolean, Some("false")),
    FieldSchema::optional("redirect", FieldKind::Array, None),
    FieldSchema::optional("metadata", FieldKind::Object, None),
    FieldSchema::optional("goto", FieldKind::String, None),
    FieldSchema::optional("goto_passed", FieldKind::String, None),
    FieldSchema::optional("goto_rejected", FieldKind::String, None),
];
