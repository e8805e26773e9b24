//! ScriptStage: per-message Rhai program.
//!
//! Payload mapping into the script: documents become maps/arrays, binary maps
//! become a map of blobs, UTF-8 raw payloads become strings and anything else
//! a blob. On the way back a string or blob becomes a raw payload, `()`
//! leaves the payload untouched and any other value becomes a document.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::message::{Message, MessageWrapper, Payload};
use crate::pipeline::stage::{FieldKind, FieldSchema, Stage, StageContext, StageOutcome};
use crate::pipeline::stages::parse_params;
use crate::scripting::{
    from_dynamic, to_dynamic, CompiledScript, ExecutionContext, ScriptEngine, ScriptInput,
};
use rhai::{Blob, Dynamic};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Instant;

pub static FIELDS: &[FieldSchema] = &[FieldSchema::required("script", FieldKind::String)];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScriptConfig {
    script: String,
}

fn script_error(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Script(e.to_string())
}

fn payload_to_dynamic(message: &Message) -> PipelineResult<Dynamic> {
    Ok(match message.payload() {
        Payload::Document(doc) => to_dynamic(doc).map_err(script_error)?,
        Payload::BinaryMap(map) => {
            let mut out = rhai::Map::new();
            for (name, bytes) in map {
                out.insert(name.as_str().into(), Dynamic::from_blob(bytes.clone()));
            }
            Dynamic::from_map(out)
        }
        Payload::Raw(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Dynamic::from(text.to_string()),
            Err(_) => Dynamic::from_blob(bytes.clone()),
        },
    })
}

fn dynamic_to_message(working: &Message, value: Dynamic) -> PipelineResult<Message> {
    if value.is_unit() {
        return Ok(working.clone());
    }
    if value.is_string() {
        let text = value.into_string().map_err(script_error)?;
        return Ok(working.with_raw(text.into_bytes()));
    }
    if value.is_blob() {
        let blob: Blob = value.cast();
        return Ok(working.with_raw(blob));
    }
    let doc = from_dynamic(&value).map_err(script_error)?;
    Ok(working.with_document(doc))
}

pub struct ScriptStage {
    engine: ScriptEngine,
    script: CompiledScript,
    started: Instant,
    last: Option<Instant>,
    count: i64,
}

impl ScriptStage {
    pub fn new(source: &str) -> PipelineResult<Self> {
        let engine = ScriptEngine::new();
        let script = engine.compile("stage", source).map_err(script_error)?;
        Ok(Self {
            engine,
            script,
            started: Instant::now(),
            last: None,
            count: 0,
        })
    }

    pub fn from_params(params: &Map<String, Value>) -> PipelineResult<Self> {
        let cfg: ScriptConfig = parse_params(params)?;
        Self::new(&cfg.script)
    }

    fn next_context(&mut self) -> ExecutionContext {
        let now = Instant::now();
        let dt = self
            .last
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        let ctx = ExecutionContext::new(now.duration_since(self.started).as_secs_f64(), dt, self.count);
        self.last = Some(now);
        self.count = self.count.saturating_add(1);
        ctx
    }
}

impl std::fmt::Debug for ScriptStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptStage")
            .field("script", &self.script.source())
            .field("count", &self.count)
            .finish()
    }
}

impl Stage for ScriptStage {
    fn type_name(&self) -> &'static str {
        "script"
    }

    fn process(
        &mut self,
        wrapper: &mut MessageWrapper,
        _ctx: &mut StageContext,
    ) -> PipelineResult<StageOutcome> {
        let input = ScriptInput {
            payload: payload_to_dynamic(&wrapper.working)?,
            topic: wrapper.working.topic().to_string(),
            metadata: to_dynamic(&wrapper.metadata).map_err(script_error)?,
        };
        let ctx = self.next_context();
        let out = self
            .engine
            .execute(&self.script, input, ctx)
            .map_err(script_error)?;

        let mut working = dynamic_to_message(&wrapper.working, out.payload)?;
        if out.topic != working.topic() {
            working = working.with_topic(out.topic);
        }
        if !out.metadata.is_unit() {
            let meta = from_dynamic(&out.metadata).map_err(script_error)?;
            if !meta.is_object() {
                return Err(PipelineError::Script("`metadata` must stay a map".to_string()));
            }
            wrapper.metadata = meta;
        }
        wrapper.working = working;
        wrapper.set_accepted(out.accept);
        Ok(StageOutcome::Done)
    }

    fn on_start(&mut self) {
        self.started = Instant::now();
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::EventScheduler;
    use crate::pipeline::stages::test_support::ctx;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn run(stage: &mut ScriptStage, msg: Message) -> MessageWrapper {
        let scheduler = EventScheduler::detached();
        let mut w = MessageWrapper::new(msg);
        stage.process(&mut w, &mut ctx(&scheduler)).unwrap();
        w
    }

    #[test]
    fn test_document_rewrite() {
        let mut stage = ScriptStage::new("payload.ok = payload.v > 1; payload.v > 0").unwrap();
        let w = run(&mut stage, Message::document("t", json!({"v": 2})));
        assert!(w.accepted);
        assert_eq!(w.working.as_document().unwrap(), &json!({"v": 2, "ok": true}));
    }

    #[test]
    fn test_text_payload_stays_raw() {
        let mut stage = ScriptStage::new(r#"payload = payload + "!"; topic = "out";"#).unwrap();
        let w = run(&mut stage, Message::raw("in", b"hi".to_vec()));
        assert_eq!(w.working.as_bytes().unwrap(), b"hi!");
        assert_eq!(w.working.topic(), "out");
    }

    #[test]
    fn test_binary_payload_is_a_blob() {
        let mut stage = ScriptStage::new("accept = payload.len() == 3;").unwrap();
        let w = run(&mut stage, Message::raw("t", vec![0xff, 0xfe, 0x00]));
        assert!(w.accepted);
        assert_eq!(w.working.as_bytes().unwrap(), &[0xff, 0xfe, 0x00]);
    }

    #[test]
    fn test_binary_map_fields() {
        let mut stage = ScriptStage::new(r#"payload = to_text(payload.name);"#).unwrap();
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), b"pump".to_vec());
        let w = run(&mut stage, Message::binary_map("t", map));
        assert_eq!(w.working.as_bytes().unwrap(), b"pump");
    }

    #[test]
    fn test_metadata_and_counter() {
        let mut stage = ScriptStage::new("metadata.n = count();").unwrap();
        run(&mut stage, Message::raw("t", b"a".to_vec()));
        let w = run(&mut stage, Message::raw("t", b"b".to_vec()));
        assert_eq!(w.metadata, json!({"n": 1}));
    }

    #[test]
    fn test_runtime_error_is_reported() {
        let scheduler = EventScheduler::detached();
        let mut stage = ScriptStage::new("payload.missing.deeper = 1;").unwrap();
        let mut w = MessageWrapper::new(Message::document("t", json!({})));
        let err = stage.process(&mut w, &mut ctx(&scheduler)).unwrap_err();
        assert!(matches!(err, PipelineError::Script(_)));
    }

    #[test]
    fn test_compile_error_at_construction() {
        assert!(ScriptStage::new("let = ;").is_err());
    }
}
