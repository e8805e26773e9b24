//! ImageStage: decode, transform and re-encode image payloads.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::message::MessageWrapper;
use crate::pipeline::stage::{FieldKind, FieldSchema, Stage, StageContext, StageOutcome};
use crate::pipeline::stages::parse_params;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::Cursor;

pub static FIELDS: &[FieldSchema] = &[
    FieldSchema::required("operation", FieldKind::String).one_of(&[
        "grayscale",
        "resize",
        "thumbnail",
        "rotate90",
        "flip_horizontal",
    ]),
    FieldSchema::optional("width", FieldKind::Integer, None),
    FieldSchema::optional("height", FieldKind::Integer, None),
    FieldSchema::optional("format", FieldKind::String, None).one_of(&["png", "jpeg"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageOperation {
    Grayscale,
    /// Fit within `width` x `height`, keeping the aspect ratio.
    Resize,
    /// Like resize but faster and never upscales.
    Thumbnail,
    Rotate90,
    FlipHorizontal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Png,
    Jpeg,
}

impl OutputFormat {
    fn image_format(self) -> ImageFormat {
        match self {
            OutputFormat::Png => ImageFormat::Png,
            OutputFormat::Jpeg => ImageFormat::Jpeg,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageConfig {
    operation: ImageOperation,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    format: Option<OutputFormat>,
}

#[derive(Debug)]
pub struct ImageStage {
    operation: ImageOperation,
    width: u32,
    height: u32,
    format: Option<OutputFormat>,
}

impl ImageStage {
    pub fn new(operation: ImageOperation) -> Self {
        Self {
            operation,
            width: 0,
            height: 0,
            format: None,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn from_params(params: &Map<String, Value>) -> PipelineResult<Self> {
        let cfg: ImageConfig = parse_params(params)?;
        let mut stage = Self::new(cfg.operation);
        if matches!(cfg.operation, ImageOperation::Resize | ImageOperation::Thumbnail) {
            match (cfg.width, cfg.height) {
                (Some(w), Some(h)) if w > 0 && h > 0 => stage = stage.with_size(w, h),
                _ => {
                    return Err(PipelineError::Config(
                        "resize and thumbnail need positive width and height".to_string(),
                    ))
                }
            }
        }
        stage.format = cfg.format;
        Ok(stage)
    }

    fn apply(&self, img: DynamicImage) -> DynamicImage {
        match self.operation {
            ImageOperation::Grayscale => img.grayscale(),
            ImageOperation::Resize => img.resize(self.width, self.height, FilterType::Triangle),
            ImageOperation::Thumbnail => img.thumbnail(self.width, self.height),
            ImageOperation::Rotate90 => img.rotate90(),
            ImageOperation::FlipHorizontal => img.fliph(),
        }
    }
}

fn encode(img: DynamicImage, format: ImageFormat) -> PipelineResult<Vec<u8>> {
    // JPEG has no alpha channel.
    let img = if format == ImageFormat::Jpeg && img.color().has_alpha() {
        DynamicImage::ImageRgb8(img.to_rgb8())
    } else {
        img
    };
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format)
        .map_err(|e| PipelineError::Representation(format!("image encode failed: {e}")))?;
    Ok(out.into_inner())
}

impl Stage for ImageStage {
    fn type_name(&self) -> &'static str {
        "image"
    }

    fn process(
        &mut self,
        wrapper: &mut MessageWrapper,
        _ctx: &mut StageContext,
    ) -> PipelineResult<StageOutcome> {
        let bytes = wrapper.working.as_bytes()?;
        let source_format = image::guess_format(bytes).ok();
        let img = image::load_from_memory(bytes)
            .map_err(|e| PipelineError::Representation(format!("image decode failed: {e}")))?;

        let format = match (self.format, source_format) {
            (Some(f), _) => f.image_format(),
            (None, Some(ImageFormat::Jpeg)) => ImageFormat::Jpeg,
            (None, _) => ImageFormat::Png,
        };
        let encoded = encode(self.apply(img), format)?;
        wrapper.working = wrapper.working.with_raw(encoded);
        wrapper.accept();
        Ok(StageOutcome::Done)
    }
}
