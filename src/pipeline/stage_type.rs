//! Stage type enumeration and the construction-time factory.
//!
//! A stage's `type` string selects a [`StageType`]; [`StageFactory`] parses
//! the variant parameters and returns a ready [`ConfiguredStage`]. Anything
//! wrong with the configuration is reported here, never at run time.

use crate::config::StageConfig;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::stage::{ConfiguredStage, FieldSchema, Stage};
use crate::pipeline::stages::{
    builder, comparator, eraser, image, limiter, noop, script, search, splitter, throttle,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Types of stages that can be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    Comparator,
    Search,
    Eraser,
    Builder,
    Limiter,
    Throttle,
    Splitter,
    Noop,
    Script,
    Image,
}

impl StageType {
    /// Parse the `type` discriminator of a stage entry.
    pub fn parse(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.as_str() == name)
    }

    /// The discriminator string used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageType::Comparator => "comparator",
            StageType::Search => "search",
            StageType::Eraser => "eraser",
            StageType::Builder => "builder",
            StageType::Limiter => "limiter",
            StageType::Throttle => "throttle",
            StageType::Splitter => "splitter",
            StageType::Noop => "noop",
            StageType::Script => "script",
            StageType::Image => "image",
        }
    }

    /// Get the display name for this stage type.
    pub fn display_name(&self) -> &'static str {
        match self {
            StageType::Comparator => "Comparator",
            StageType::Search => "Search",
            StageType::Eraser => "Field Eraser",
            StageType::Builder => "Template Builder",
            StageType::Limiter => "Size Limiter",
            StageType::Throttle => "Rate Throttle",
            StageType::Splitter => "Chunk Splitter",
            StageType::Noop => "No-op",
            StageType::Script => "Rhai Script",
            StageType::Image => "Image Transform",
        }
    }

    /// Get all available stage types.
    pub fn all() -> &'static [StageType] {
        &[
            StageType::Comparator,
            StageType::Search,
            StageType::Eraser,
            StageType::Builder,
            StageType::Limiter,
            StageType::Throttle,
            StageType::Splitter,
            StageType::Noop,
            StageType::Script,
            StageType::Image,
        ]
    }

    /// Whether this stage emits several messages per input.
    pub fn is_generator(&self) -> bool {
        matches!(self, StageType::Splitter)
    }

    /// Variant-specific fields, in addition to [`COMMON_FIELDS`](crate::pipeline::stage::COMMON_FIELDS).
    pub fn schema(&self) -> &'static [FieldSchema] {
        match self {
            StageType::Comparator => comparator::FIELDS,
            StageType::Search => search::FIELDS,
            StageType::Eraser => eraser::FIELDS,
            StageType::Builder => builder::FIELDS,
            StageType::Limiter => limiter::FIELDS,
            StageType::Throttle => throttle::FIELDS,
            StageType::Splitter => splitter::FIELDS,
            StageType::Noop => &[],
            StageType::Script => script::FIELDS,
            StageType::Image => image::FIELDS,
        }
    }

    /// Get a detailed description of what this stage does.
    pub fn description(&self) -> &'static str {
        match self {
            StageType::Comparator =>
                "Compares a document field against a value.\n\
                 Accepts when the comparison holds.\n\
                 A missing field rejects.",

            StageType::Search =>
                "Looks for text in the payload, a key in the document\n\
                 or a substring of the topic.",

            StageType::Eraser => "Removes fields from the document and accepts.",

            StageType::Builder =>
                "Builds a new document from a template.\n\
                 ${path} and ${meta.path} are substituted.\n\
                 Optionally merges into the existing document.",

            StageType::Limiter => "Accepts payloads no larger than `size` bytes.",

            StageType::Throttle =>
                "Passes at most `rate` messages per period.\n\
                 Excess messages are dropped, or in delay mode\n\
                 the latest is held until the window reopens.",

            StageType::Splitter =>
                "Splits a payload into chunks (bytes) or an array\n\
                 into groups. Every piece shares one message id.",

            StageType::Noop => "Accepts everything. Useful as a goto label.",

            StageType::Script =>
                "Runs a Rhai script with payload, topic,\n\
                 metadata and accept in scope.",

            StageType::Image =>
                "Decodes an image payload, applies a transform\n\
                 and re-encodes it as PNG or JPEG.",
        }
    }
}

impl std::fmt::Display for StageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

fn build(stage_type: StageType, params: &Map<String, Value>) -> PipelineResult<Box<dyn Stage>> {
    Ok(match stage_type {
        StageType::Comparator => Box::new(comparator::ComparatorStage::from_params(params)?),
        StageType::Search => Box::new(search::SearchStage::from_params(params)?),
        StageType::Eraser => Box::new(eraser::EraserStage::from_params(params)?),
        StageType::Builder => Box::new(builder::BuilderStage::from_params(params)?),
        StageType::Limiter => Box::new(limiter::LimiterStage::from_params(params)?),
        StageType::Throttle => Box::new(throttle::ThrottleStage::from_params(params)?),
        StageType::Splitter => Box::new(splitter::SplitterStage::from_params(params)?),
        StageType::Noop => Box::new(noop::NoopStage::from_params(params)?),
        StageType::Script => Box::new(script::ScriptStage::from_params(params)?),
        StageType::Image => Box::new(image::ImageStage::from_params(params)?),
    })
}

/// Factory for creating stages from configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct StageFactory;

impl StageFactory {
    pub fn new() -> Self {
        Self
    }

    /// Build the stage at position `index` of a chain.
    pub fn create(&self, index: usize, config: &StageConfig) -> PipelineResult<ConfiguredStage> {
        let stage_type = StageType::parse(&config.stage_type)
            .ok_or_else(|| PipelineError::UnknownStageType(config.stage_type.clone()))?;

        let stage = build(stage_type, &config.params).map_err(|e| PipelineError::InvalidStage {
            index,
            message: format!("{}: {}", stage_type.as_str(), e),
        })?;

        tracing::trace!("Built stage {} ({})", index, stage_type.as_str());
        Ok(ConfiguredStage::new(config.common.clone(), stage))
    }

    /// Build every stage of a chain, failing on the first invalid entry.
    pub fn create_all(&self, configs: &[StageConfig]) -> PipelineResult<Vec<ConfiguredStage>> {
        configs
            .iter()
            .enumerate()
            .map(|(i, cfg)| self.create(i, cfg))
            .collect()
    }
}
