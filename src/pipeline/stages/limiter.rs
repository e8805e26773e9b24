//! LimiterStage: payload size gate.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::message::MessageWrapper;
use crate::pipeline::stage::{FieldKind, FieldSchema, Stage, StageContext, StageOutcome};
use crate::pipeline::stages::parse_params;
use serde::Deserialize;
use serde_json::{Map, Value};

pub static FIELDS: &[FieldSchema] = &[FieldSchema::required("size", FieldKind::Integer)];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LimiterConfig {
    size: usize,
}

/// Accepts a message iff its raw payload is at most `size` bytes.
#[derive(Debug)]
pub struct LimiterStage {
    size: usize,
}

impl LimiterStage {
    pub fn new(size: usize) -> Self {
        Self { size }
    }

    pub fn from_params(params: &Map<String, Value>) -> PipelineResult<Self> {
        let cfg: LimiterConfig = parse_params(params)?;
        Ok(Self::new(cfg.size))
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Stage for LimiterStage {
    fn type_name(&self) -> &'static str {
        "limiter"
    }

    fn process(
        &mut self,
        wrapper: &mut MessageWrapper,
        _ctx: &mut StageContext,
    ) -> PipelineResult<StageOutcome> {
        let len = wrapper.working.payload_len()?;
        wrapper.set_accepted(len <= self.size);
        Ok(StageOutcome::Done)
    }
}
