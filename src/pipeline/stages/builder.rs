//! BuilderStage: renders a document template.
//!
//! Every string in the template may reference the working document with
//! `${path}` or the wrapper metadata with `${meta.path}`. A string that is
//! exactly one placeholder is replaced by the referenced value with its type
//! intact; placeholders embedded in longer strings are rendered as text.
//! Unresolved placeholders become `null` (whole string) or `""` (embedded).

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::message::{lookup_path, merge_object, MessageWrapper};
use crate::pipeline::stage::{FieldKind, FieldSchema, Stage, StageContext, StageOutcome};
use crate::pipeline::stages::parse_params;
use serde::Deserialize;
use serde_json::{Map, Value};

pub static FIELDS: &[FieldSchema] = &[
    FieldSchema::required("template", FieldKind::Any),
    FieldSchema::optional("merge", FieldKind::Boolean, Some("false")),
    FieldSchema::optional("topic", FieldKind::String, None),
];

const META_PREFIX: &str = "meta.";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuilderConfig {
    template: Value,
    #[serde(default)]
    merge: bool,
    #[serde(default)]
    topic: Option<String>,
}

/// Sources placeholders are resolved against.
struct Scope<'a> {
    document: Option<&'a Value>,
    metadata: &'a Value,
}

impl Scope<'_> {
    fn resolve(&self, path: &str) -> Option<&Value> {
        match path.strip_prefix(META_PREFIX) {
            Some(rest) => lookup_path(self.metadata, rest),
            None if path == "meta" => Some(self.metadata),
            None => self.document.and_then(|doc| lookup_path(doc, path)),
        }
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitute placeholders in a single string.
fn render_string(template: &str, scope: &Scope) -> Value {
    let trimmed = template.trim();
    if let Some(inner) = trimmed.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        if !inner.contains("${") && !inner.contains('}') {
            return scope.resolve(inner.trim()).cloned().unwrap_or(Value::Null);
        }
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                if let Some(v) = scope.resolve(after[..end].trim()) {
                    out.push_str(&render_scalar(v));
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

fn render(template: &Value, scope: &Scope) -> Value {
    match template {
        Value::String(s) => render_string(s, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Template rendering stage.
#[derive(Debug)]
pub struct BuilderStage {
    template: Value,
    merge: bool,
    topic: Option<String>,
}

impl BuilderStage {
    pub fn new(template: Value) -> Self {
        Self {
            template,
            merge: false,
            topic: None,
        }
    }

    pub fn with_merge(mut self, merge: bool) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn from_params(params: &Map<String, Value>) -> PipelineResult<Self> {
        let cfg: BuilderConfig = parse_params(params)?;
        if cfg.merge && !cfg.template.is_object() {
            return Err(PipelineError::Config(
                "merge requires an object template".to_string(),
            ));
        }
        Ok(Self {
            template: cfg.template,
            merge: cfg.merge,
            topic: cfg.topic.filter(|t| !t.is_empty()),
        })
    }
}

impl Stage for BuilderStage {
    fn type_name(&self) -> &'static str {
        "builder"
    }

    fn process(
        &mut self,
        wrapper: &mut MessageWrapper,
        _ctx: &mut StageContext,
    ) -> PipelineResult<StageOutcome> {
        // Templates that only use constants or metadata work on any payload.
        let document = if self.merge {
            Some(wrapper.working.as_document()?)
        } else {
            wrapper.working.as_document().ok()
        };
        let scope = Scope {
            document,
            metadata: &wrapper.metadata,
        };

        let built = render(&self.template, &scope);
        let topic = self
            .topic
            .as_deref()
            .map(|t| render_scalar(&render_string(t, &scope)));

        let result = match (self.merge, built) {
            (true, Value::Object(extra)) => {
                let mut base = document.cloned().unwrap_or(Value::Null);
                merge_object(&mut base, &extra);
                base
            }
            (_, built) => built,
        };

        let mut working = wrapper.working.with_document(result);
        if let Some(topic) = topic {
            working = working.with_topic(topic);
        }
        wrapper.working = working;
        wrapper.accept();
        Ok(StageOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::EventScheduler;
    use crate::pipeline::message::Message;
    use crate::pipeline::stages::test_support::ctx;
    use serde_json::json;

    fn build(stage: &mut BuilderStage, wrapper: &mut MessageWrapper) {
        let scheduler = EventScheduler::detached();
        stage.process(wrapper, &mut ctx(&scheduler)).unwrap();
    }

    #[test]
    fn test_constant_template_replaces_payload() {
        let mut stage = BuilderStage::new(json!({"cooling": true}));
        let mut w = MessageWrapper::new(Message::document("t", json!({"temp": 35})));
        build(&mut stage, &mut w);
        assert_eq!(w.working.as_document().unwrap(), &json!({"cooling": true}));
    }

    #[test]
    fn test_placeholders_keep_types() {
        let mut stage = BuilderStage::new(json!({
            "value": "${temp}",
            "label": "sensor ${id} at ${temp}C",
            "site": "${meta.site}",
            "missing": "${nope}"
        }));
        let mut w = MessageWrapper::new(Message::raw("t", br#"{"temp": 21.5, "id": "s1"}"#.to_vec()));
        w.metadata = json!({"site": "north"});
        build(&mut stage, &mut w);
        assert_eq!(
            w.working.as_document().unwrap(),
            &json!({
                "value": 21.5,
                "label": "sensor s1 at 21.5C",
                "site": "north",
                "missing": null
            })
        );
    }

    #[test]
    fn test_merge_and_topic() {
        let mut stage = BuilderStage::new(json!({"status": "ok"}))
            .with_merge(true)
            .with_topic("devices/${id}/status");
        let mut w = MessageWrapper::new(Message::document("in", json!({"id": 4, "temp": 1})));
        build(&mut stage, &mut w);
        assert_eq!(
            w.working.as_document().unwrap(),
            &json!({"id": 4, "temp": 1, "status": "ok"})
        );
        assert_eq!(w.working.topic(), "devices/4/status");
    }

    #[test]
    fn test_non_document_input_without_merge() {
        let mut stage = BuilderStage::new(json!({"seen": "${meta.count}"}));
        let mut w = MessageWrapper::new(Message::raw("t", b"\x00\x01".to_vec()));
        w.metadata = json!({"count": 3});
        build(&mut stage, &mut w);
        assert_eq!(w.working.as_document().unwrap(), &json!({"seen": 3}));
    }

    #[test]
    fn test_unterminated_placeholder_is_literal() {
        let scope = Scope {
            document: None,
            metadata: &Value::Null,
        };
        assert_eq!(render_string("a ${b", &scope), json!("a ${b"));
    }

    #[test]
    fn test_merge_requires_object_template() {
        let mut params = Map::new();
        params.insert("template".into(), json!("text"));
        params.insert("merge".into(), json!(true));
        assert!(BuilderStage::from_params(&params).is_err());
    }
}
