//! SplitterStage: one-to-many generator.
//!
//! `bytes` mode cuts the raw payload into `chunk_size`-byte pieces; `array`
//! mode groups the elements of the array at `key` (the document root when
//! `key` is empty) into `chunk_size`-element documents. Every piece carries a
//! [`ChunkTag`] with a message id shared by the whole generation and a
//! sequence starting at 0. An empty input generates nothing.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::message::{generate_message_id, lookup_path, ChunkTag, Message, MessageWrapper};
use crate::pipeline::stage::{
    FieldKind, FieldSchema, Producer, Stage, StageContext, StageOutcome,
};
use crate::pipeline::stages::parse_params;
use serde::Deserialize;
use serde_json::{Map, Value};

pub static FIELDS: &[FieldSchema] = &[
    FieldSchema::required("chunk_size", FieldKind::Integer),
    FieldSchema::optional("mode", FieldKind::String, Some("bytes")).one_of(&["bytes", "array"]),
    FieldSchema::optional("key", FieldKind::String, None),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    #[default]
    Bytes,
    Array,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SplitterConfig {
    chunk_size: usize,
    #[serde(default)]
    mode: SplitMode,
    #[serde(default)]
    key: String,
}

#[derive(Debug)]
pub struct SplitterStage {
    chunk_size: usize,
    mode: SplitMode,
    key: String,
}

fn tag(message_id: &str, sequence: usize, total: usize) -> ChunkTag {
    ChunkTag {
        message_id: message_id.to_string(),
        sequence: u32::try_from(sequence).unwrap_or(u32::MAX),
        last: sequence + 1 == total,
    }
}

impl SplitterStage {
    pub fn new(chunk_size: usize, mode: SplitMode) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            mode,
            key: String::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn from_params(params: &Map<String, Value>) -> PipelineResult<Self> {
        let cfg: SplitterConfig = parse_params(params)?;
        if cfg.chunk_size == 0 {
            return Err(PipelineError::Config("chunk_size must be positive".to_string()));
        }
        Ok(Self::new(cfg.chunk_size, cfg.mode).with_key(cfg.key))
    }

    fn split_bytes(&self, message: &Message) -> PipelineResult<Producer> {
        let data = message.as_bytes()?.to_vec();
        let topic = message.topic().to_string();
        let size = self.chunk_size;
        let total = data.len().div_ceil(size);
        let id = generate_message_id();

        Ok(Producer::new((0..total).map(move |i| {
            let end = ((i + 1) * size).min(data.len());
            Message::raw(topic.clone(), data[i * size..end].to_vec()).with_chunk(tag(&id, i, total))
        })))
    }

    fn split_array(&self, message: &Message) -> PipelineResult<Producer> {
        let doc = message.as_document()?;
        let items = match lookup_path(doc, &self.key) {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                return Err(PipelineError::Representation(format!(
                    "'{}' is not an array",
                    self.key
                )))
            }
            None => {
                return Err(PipelineError::Representation(format!(
                    "'{}' not found",
                    self.key
                )))
            }
        };
        let topic = message.topic().to_string();
        let size = self.chunk_size;
        let total = items.len().div_ceil(size);
        let id = generate_message_id();

        Ok(Producer::new((0..total).map(move |i| {
            let end = ((i + 1) * size).min(items.len());
            Message::document(topic.clone(), Value::Array(items[i * size..end].to_vec()))
                .with_chunk(tag(&id, i, total))
        })))
    }
}

impl Stage for SplitterStage {
    fn type_name(&self) -> &'static str {
        "splitter"
    }

    fn process(
        &mut self,
        wrapper: &mut MessageWrapper,
        _ctx: &mut StageContext,
    ) -> PipelineResult<StageOutcome> {
        let producer = match self.mode {
            SplitMode::Bytes => self.split_bytes(&wrapper.working)?,
            SplitMode::Array => self.split_array(&wrapper.working)?,
        };
        Ok(StageOutcome::Generate(producer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::EventScheduler;
    use crate::pipeline::stages::test_support::ctx;
    use serde_json::json;

    fn drain(stage: &mut SplitterStage, msg: Message) -> Vec<Message> {
        let scheduler = EventScheduler::detached();
        let mut w = MessageWrapper::new(msg);
        match stage.process(&mut w, &mut ctx(&scheduler)).unwrap() {
            StageOutcome::Generate(mut p) => std::iter::from_fn(|| p.next_message()).collect(),
            _ => panic!("splitter must generate"),
        }
    }

    #[test]
    fn test_alphabet_in_fives() {
        let mut stage = SplitterStage::new(5, SplitMode::Bytes);
        let pieces = drain(&mut stage, Message::raw("t", b"ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_vec()));

        let sizes: Vec<usize> = pieces.iter().map(|m| m.as_bytes().unwrap().len()).collect();
        assert_eq!(sizes, vec![5, 5, 5, 5, 5, 1]);

        let id = &pieces[0].chunk().unwrap().message_id;
        for (i, piece) in pieces.iter().enumerate() {
            let tag = piece.chunk().unwrap();
            assert_eq!(&tag.message_id, id);
            assert_eq!(tag.sequence as usize, i);
            assert_eq!(tag.last, i == 5);
        }
        assert_eq!(pieces[5].as_bytes().unwrap(), b"Z");
    }

    #[test]
    fn test_generations_get_distinct_ids() {
        let mut stage = SplitterStage::new(2, SplitMode::Bytes);
        let a = drain(&mut stage, Message::raw("t", b"abcd".to_vec()));
        let b = drain(&mut stage, Message::raw("t", b"abcd".to_vec()));
        assert_ne!(a[0].chunk().unwrap().message_id, b[0].chunk().unwrap().message_id);
    }

    #[test]
    fn test_array_mode_groups_elements() {
        let mut stage = SplitterStage::new(2, SplitMode::Array).with_key("readings");
        let pieces = drain(
            &mut stage,
            Message::document("t", json!({"readings": [1, 2, 3, 4, 5]})),
        );
        let docs: Vec<Value> = pieces
            .iter()
            .map(|m| m.as_document().unwrap().clone())
            .collect();
        assert_eq!(docs, vec![json!([1, 2]), json!([3, 4]), json!([5])]);
    }

    #[test]
    fn test_array_mode_missing_key_is_an_error() {
        let scheduler = EventScheduler::detached();
        let mut stage = SplitterStage::new(2, SplitMode::Array).with_key("nope");
        let mut w = MessageWrapper::new(Message::document("t", json!({"x": 1})));
        assert!(stage.process(&mut w, &mut ctx(&scheduler)).is_err());
    }

    #[test]
    fn test_empty_payload_generates_nothing() {
        let mut stage = SplitterStage::new(4, SplitMode::Bytes);
        assert!(drain(&mut stage, Message::raw("t", Vec::new())).is_empty());
    }
}
