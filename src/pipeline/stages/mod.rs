//! Built-in stage implementations.

pub mod builder;
pub mod comparator;
pub mod eraser;
pub mod image;
pub mod limiter;
pub mod noop;
pub mod script;
pub mod search;
pub mod splitter;
pub mod throttle;

pub use builder::BuilderStage;
pub use comparator::ComparatorStage;
pub use eraser::EraserStage;
pub use image::ImageStage;
pub use limiter::LimiterStage;
pub use noop::NoopStage;
pub use script::ScriptStage;
pub use search::SearchStage;
pub use splitter::SplitterStage;
pub use throttle::ThrottleStage;

use crate::pipeline::error::{PipelineError, PipelineResult};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Deserialize a stage's variant parameters into its typed configuration.
pub(crate) fn parse_params<T: DeserializeOwned>(params: &Map<String, Value>) -> PipelineResult<T> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|e| PipelineError::Config(e.to_string()))
}
