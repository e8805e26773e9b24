//! SearchStage: text, key or topic lookup.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::message::{lookup_path, MessageWrapper};
use crate::pipeline::stage::{FieldKind, FieldSchema, Stage, StageContext, StageOutcome};
use crate::pipeline::stages::parse_params;
use serde::Deserialize;
use serde_json::{Map, Value};

pub static FIELDS: &[FieldSchema] = &[
    FieldSchema::optional("mode", FieldKind::String, Some("text")).one_of(&["text", "key", "topic"]),
    FieldSchema::required("value", FieldKind::String),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Payload bytes contain `value`.
    #[default]
    Text,
    /// Document has a field at path `value`.
    Key,
    /// Topic contains `value`.
    Topic,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchConfig {
    #[serde(default)]
    mode: SearchMode,
    value: String,
}

#[derive(Debug)]
pub struct SearchStage {
    mode: SearchMode,
    needle: String,
}

impl SearchStage {
    pub fn new(mode: SearchMode, needle: impl Into<String>) -> Self {
        Self {
            mode,
            needle: needle.into(),
        }
    }

    pub fn from_params(params: &Map<String, Value>) -> PipelineResult<Self> {
        let cfg: SearchConfig = parse_params(params)?;
        Ok(Self::new(cfg.mode, cfg.value))
    }

    fn matches(&self, wrapper: &MessageWrapper) -> PipelineResult<bool> {
        Ok(match self.mode {
            SearchMode::Text => {
                let hay = wrapper.working.as_bytes()?;
                let needle = self.needle.as_bytes();
                needle.is_empty() || hay.windows(needle.len()).any(|w| w == needle)
            }
            // A payload that is not a document has no keys.
            SearchMode::Key => match wrapper.working.as_document() {
                Ok(doc) => lookup_path(doc, &self.needle).is_some(),
                Err(_) => false,
            },
            SearchMode::Topic => wrapper.working.topic().contains(&self.needle),
        })
    }
}

impl Stage for SearchStage {
    fn type_name(&self) -> &'static str {
        "search"
    }

    fn process(
        &mut self,
        wrapper: &mut MessageWrapper,
        _ctx: &mut StageContext,
    ) -> PipelineResult<StageOutcome> {
        let found = self.matches(wrapper)?;
        wrapper.set_accepted(found);
        Ok(StageOutcome::Done)
    }
}
