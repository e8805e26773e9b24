//! NoopStage: accepts everything.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::message::MessageWrapper;
use crate::pipeline::stage::{Stage, StageContext, StageOutcome};
use crate::pipeline::stages::parse_params;
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoopConfig {}

/// Pass-through stage, mostly used as a named goto target.
#[derive(Debug, Default)]
pub struct NoopStage;

impl NoopStage {
    pub fn new() -> Self {
        Self
    }

    pub fn from_params(params: &Map<String, Value>) -> PipelineResult<Self> {
        let _: NoopConfig = parse_params(params)?;
        Ok(Self)
    }
}

impl Stage for NoopStage {
    fn type_name(&self) -> &'static str {
        "noop"
    }

    fn process(
        &mut self,
        wrapper: &mut MessageWrapper,
        _ctx: &mut StageContext,
    ) -> PipelineResult<StageOutcome> {
        wrapper.accept();
        Ok(StageOutcome::Done)
    }
}
