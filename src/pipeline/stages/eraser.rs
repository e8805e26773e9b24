//! EraserStage: drops fields from the working document.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::message::{remove_path, MessageWrapper};
use crate::pipeline::stage::{FieldKind, FieldSchema, Stage, StageContext, StageOutcome};
use crate::pipeline::stages::parse_params;
use serde::Deserialize;
use serde_json::{Map, Value};

pub static FIELDS: &[FieldSchema] = &[FieldSchema::required("keys", FieldKind::Array)];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EraserConfig {
    keys: Vec<String>,
}

#[derive(Debug)]
pub struct EraserStage {
    keys: Vec<String>,
}

impl EraserStage {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }

    pub fn from_params(params: &Map<String, Value>) -> PipelineResult<Self> {
        let cfg: EraserConfig = parse_params(params)?;
        Ok(Self::new(cfg.keys))
    }
}

impl Stage for EraserStage {
    fn type_name(&self) -> &'static str {
        "eraser"
    }

    fn process(
        &mut self,
        wrapper: &mut MessageWrapper,
        _ctx: &mut StageContext,
    ) -> PipelineResult<StageOutcome> {
        let mut doc = wrapper.working.as_document()?.clone();
        let mut removed = 0;
        for key in &self.keys {
            if remove_path(&mut doc, key) {
                removed += 1;
            }
        }
        if removed > 0 {
            wrapper.working = wrapper.working.with_document(doc);
        }
        wrapper.accept();
        Ok(StageOutcome::Done)
    }
}
