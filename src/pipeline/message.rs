//! Messages and the in-flight wrapper that carries them through a chain.
//!
//! A [`Message`] is immutable and cheap to clone: the payload lives behind an
//! `Arc`. Each message has one native representation ([`MessageType`]) and
//! caches the alternate representation the first time a stage asks for it.
//! Converting raw bytes to a document can fail; that failure is surfaced as
//! [`PipelineError::Representation`] and never replaces the payload.

use crate::pipeline::error::{PipelineError, PipelineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Native representation of a message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Opaque bytes.
    #[default]
    Raw,
    /// Structured JSON document.
    Document,
    /// Named binary fields.
    BinaryMap,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Raw => write!(f, "raw"),
            MessageType::Document => write!(f, "document"),
            MessageType::BinaryMap => write!(f, "binary_map"),
        }
    }
}

/// Native payload storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw(Vec<u8>),
    Document(Value),
    BinaryMap(BTreeMap<String, Vec<u8>>),
}

/// Tag attached to every piece emitted by a generating stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTag {
    /// Identifier shared by all pieces of one generation.
    pub message_id: String,
    /// Position of this piece, starting at 0.
    pub sequence: u32,
    /// Whether this is the final piece.
    pub last: bool,
}

struct MessageInner {
    topic: String,
    payload: Payload,
    created: DateTime<Utc>,
    chunk: Option<ChunkTag>,
    raw_cache: OnceLock<Vec<u8>>,
    document_cache: OnceLock<Value>,
}

/// Immutable message envelope.
#[derive(Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

static GENERATED_IDS: AtomicU64 = AtomicU64::new(0);

/// Produce a process-unique identifier for a generated message family.
pub fn generate_message_id() -> String {
    let seq = GENERATED_IDS.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:04x}", Utc::now().timestamp_micros(), seq & 0xffff)
}

impl Message {
    fn build(topic: String, payload: Payload, chunk: Option<ChunkTag>) -> Self {
        Self {
            inner: Arc::new(MessageInner {
                topic,
                payload,
                created: Utc::now(),
                chunk,
                raw_cache: OnceLock::new(),
                document_cache: OnceLock::new(),
            }),
        }
    }

    /// Create a message from raw bytes.
    pub fn raw(topic: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::build(topic.into(), Payload::Raw(bytes.into()), None)
    }

    /// Create a message from a JSON document.
    pub fn document(topic: impl Into<String>, value: Value) -> Self {
        Self::build(topic.into(), Payload::Document(value), None)
    }

    /// Create a message from named binary fields.
    pub fn binary_map(topic: impl Into<String>, map: BTreeMap<String, Vec<u8>>) -> Self {
        Self::build(topic.into(), Payload::BinaryMap(map), None)
    }

    /// Copy of this message with a different topic.
    pub fn with_topic(&self, topic: impl Into<String>) -> Self {
        Self::build(topic.into(), self.inner.payload.clone(), self.inner.chunk.clone())
    }

    /// Copy of this message with a chunk tag.
    pub fn with_chunk(&self, chunk: ChunkTag) -> Self {
        Self::build(self.inner.topic.clone(), self.inner.payload.clone(), Some(chunk))
    }

    /// Copy of this message with a new document payload, keeping topic and tag.
    pub fn with_document(&self, value: Value) -> Self {
        Self::build(
            self.inner.topic.clone(),
            Payload::Document(value),
            self.inner.chunk.clone(),
        )
    }

    /// Copy of this message with a new raw payload, keeping topic and tag.
    pub fn with_raw(&self, bytes: impl Into<Vec<u8>>) -> Self {
        Self::build(
            self.inner.topic.clone(),
            Payload::Raw(bytes.into()),
            self.inner.chunk.clone(),
        )
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn kind(&self) -> MessageType {
        match self.inner.payload {
            Payload::Raw(_) => MessageType::Raw,
            Payload::Document(_) => MessageType::Document,
            Payload::BinaryMap(_) => MessageType::BinaryMap,
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.inner.payload
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.inner.created
    }

    pub fn chunk(&self) -> Option<&ChunkTag> {
        self.inner.chunk.as_ref()
    }

    /// Payload as bytes, serializing structured payloads on first use.
    pub fn as_bytes(&self) -> PipelineResult<&[u8]> {
        match &self.inner.payload {
            Payload::Raw(bytes) => Ok(bytes),
            Payload::Document(_) | Payload::BinaryMap(_) => {
                if let Some(bytes) = self.inner.raw_cache.get() {
                    return Ok(bytes);
                }
                let doc = self.as_document()?;
                let bytes = serde_json::to_vec(doc)
                    .map_err(|e| PipelineError::Representation(e.to_string()))?;
                Ok(self.inner.raw_cache.get_or_init(|| bytes))
            }
        }
    }

    /// Payload as a JSON document, parsing raw bytes on first use.
    pub fn as_document(&self) -> PipelineResult<&Value> {
        match &self.inner.payload {
            Payload::Document(value) => Ok(value),
            Payload::Raw(bytes) => {
                if let Some(value) = self.inner.document_cache.get() {
                    return Ok(value);
                }
                let value: Value = serde_json::from_slice(bytes).map_err(|e| {
                    PipelineError::Representation(format!("payload is not a JSON document: {e}"))
                })?;
                Ok(self.inner.document_cache.get_or_init(|| value))
            }
            Payload::BinaryMap(map) => Ok(self
                .inner
                .document_cache
                .get_or_init(|| binary_map_to_document(map))),
        }
    }

    /// Payload as text, if it is valid UTF-8.
    pub fn as_text(&self) -> PipelineResult<&str> {
        std::str::from_utf8(self.as_bytes()?)
            .map_err(|e| PipelineError::Representation(format!("payload is not UTF-8: {e}")))
    }

    /// Length of the raw representation in bytes.
    pub fn payload_len(&self) -> PipelineResult<usize> {
        self.as_bytes().map(|b| b.len())
    }

    /// Whether the message can be viewed as `kind` without losing data.
    pub fn ensure(&self, kind: MessageType) -> PipelineResult<()> {
        match kind {
            MessageType::Raw => self.as_bytes().map(|_| ()),
            MessageType::Document => self.as_document().map(|_| ()),
            MessageType::BinaryMap if self.kind() == MessageType::BinaryMap => Ok(()),
            MessageType::BinaryMap => Err(PipelineError::Representation(format!(
                "{} payload cannot be viewed as a binary map",
                self.kind()
            ))),
        }
    }
}

fn binary_map_to_document(map: &BTreeMap<String, Vec<u8>>) -> Value {
    let mut obj = Map::new();
    for (name, bytes) in map {
        let value = match std::str::from_utf8(bytes) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        };
        obj.insert(name.clone(), value);
    }
    Value::Object(obj)
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.inner.topic)
            .field("kind", &self.kind())
            .field("chunk", &self.inner.chunk)
            .finish()
    }
}

/// Look up a dotted path (`a.b.0.c`) inside a document.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Remove the value at a dotted path. Returns whether something was removed.
pub fn remove_path(value: &mut Value, path: &str) -> bool {
    let (parent_path, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };
    let parent = match parent_path {
        Some(p) => lookup_path_mut(value, p),
        None => Some(value),
    };
    match parent {
        Some(Value::Object(map)) => map.remove(leaf).is_some(),
        Some(Value::Array(items)) => match leaf.parse::<usize>() {
            Ok(i) if i < items.len() => {
                items.remove(i);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

fn lookup_path_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(map) => map.get_mut(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}

/// Shallow-merge `extra` into `target`, turning `target` into an object if needed.
pub fn merge_object(target: &mut Value, extra: &Map<String, Value>) {
    if extra.is_empty() {
        return;
    }
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (k, v) in extra {
            map.insert(k.clone(), v.clone());
        }
    }
}

/// In-flight envelope around a message as it moves through a chain.
#[derive(Debug, Clone)]
pub struct MessageWrapper {
    original: Message,
    /// Message as rewritten by the stages visited so far.
    pub working: Message,
    /// Accept/reject decision of the most recent stage.
    pub accepted: bool,
    /// Fan-out queues this message was published to.
    pub redirects: BTreeSet<String>,
    /// Free-form metadata merged in by stages.
    pub metadata: Value,
}

impl MessageWrapper {
    pub fn new(message: Message) -> Self {
        Self {
            original: message.clone(),
            working: message,
            accepted: true,
            redirects: BTreeSet::new(),
            metadata: Value::Object(Map::new()),
        }
    }

    /// The message as it entered the chain.
    pub fn original(&self) -> &Message {
        &self.original
    }

    pub fn accept(&mut self) {
        self.accepted = true;
    }

    pub fn reject(&mut self) {
        self.accepted = false;
    }

    pub fn set_accepted(&mut self, accepted: bool) {
        self.accepted = accepted;
    }

    /// Merge stage metadata into the wrapper.
    pub fn merge_metadata(&mut self, extra: &Map<String, Value>) {
        merge_object(&mut self.metadata, extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_to_document_is_cached() {
        let msg = Message::raw("t", br#"{"temp": 35}"#.to_vec());
        assert_eq!(msg.kind(), MessageType::Raw);
        let first = msg.as_document().unwrap() as *const Value;
        let second = msg.as_document().unwrap() as *const Value;
        assert_eq!(first, second);
        assert_eq!(msg.as_document().unwrap()["temp"], json!(35));
    }

    #[test]
    fn test_invalid_document_is_an_error() {
        let msg = Message::raw("t", b"not json".to_vec());
        assert!(matches!(
            msg.as_document(),
            Err(PipelineError::Representation(_))
        ));
        // Raw view is untouched.
        assert_eq!(msg.as_bytes().unwrap(), b"not json");
    }

    #[test]
    fn test_document_to_bytes() {
        let msg = Message::document("t", json!({"a": 1}));
        assert_eq!(msg.as_bytes().unwrap(), br#"{"a":1}"#);
        assert_eq!(msg.payload_len().unwrap(), 7);
    }

    #[test]
    fn test_binary_map_views() {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), b"pump".to_vec());
        map.insert("blob".to_string(), vec![0xff, 0x00]);
        let msg = Message::binary_map("t", map);
        let doc = msg.as_document().unwrap();
        assert_eq!(doc["name"], json!("pump"));
        assert_eq!(doc["blob"], json!([255, 0]));
        assert!(msg.ensure(MessageType::BinaryMap).is_ok());
        assert!(Message::raw("t", b"x".to_vec())
            .ensure(MessageType::BinaryMap)
            .is_err());
    }

    #[test]
    fn test_lookup_and_remove_path() {
        let mut doc = json!({"a": {"b": [10, {"c": true}]}, "x": 1});
        assert_eq!(lookup_path(&doc, "a.b.0"), Some(&json!(10)));
        assert_eq!(lookup_path(&doc, "a.b.1.c"), Some(&json!(true)));
        assert_eq!(lookup_path(&doc, "a.missing"), None);

        assert!(remove_path(&mut doc, "a.b.1.c"));
        assert!(remove_path(&mut doc, "x"));
        assert!(!remove_path(&mut doc, "nope.deeper"));
        assert_eq!(doc, json!({"a": {"b": [10, {}]}}));
    }

    #[test]
    fn test_wrapper_defaults() {
        let mut w = MessageWrapper::new(Message::raw("t", b"x".to_vec()));
        assert!(w.accepted);
        w.reject();
        assert!(!w.accepted);
        let mut extra = Map::new();
        extra.insert("source".into(), json!("plant-1"));
        w.merge_metadata(&extra);
        assert_eq!(w.metadata["source"], json!("plant-1"));
        assert_eq!(w.original().topic(), "t");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(generate_message_id(), generate_message_id());
    }
}
