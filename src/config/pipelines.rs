//! Persisted pipeline definitions.
//!
//! The document is a JSON object keyed by pipeline id. Key order is kept
//! across load and save so hand-edited files stay readable:
//!
//! ```json
//! {
//!   "cooler": {
//!     "connector_in":  { "type": "queue", "name": "sensors" },
//!     "connector_out": { "type": "log" },
//!     "stages": [
//!       { "type": "comparator", "key": "temp", "operator": ">", "value": 30,
//!         "goto_rejected": "cooler_off" },
//!       { "type": "builder", "template": { "cooler": "on" }, "goto": "out" },
//!       { "type": "builder", "name": "cooler_off", "template": { "cooler": "off" } }
//!     ]
//!   }
//! }
//! ```

use crate::error::{BridgeError, Result, ResultExt};
use crate::pipeline::stage::StageCommon;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::path::Path;

/// One stage entry of a pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage type discriminator.
    #[serde(rename = "type")]
    pub stage_type: String,

    #[serde(flatten)]
    pub common: StageCommon,

    /// Variant-specific parameters.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl StageConfig {
    pub fn new(stage_type: impl Into<String>) -> Self {
        Self {
            stage_type: stage_type.into(),
            common: StageCommon::default(),
            params: Map::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.common.name = Some(name.to_string());
        self
    }
}

/// Inbound or outbound connector entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(rename = "type")]
    pub connector_type: String,

    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ConnectorConfig {
    pub fn new(connector_type: impl Into<String>) -> Self {
        Self {
            connector_type: connector_type.into(),
            params: Map::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Full definition of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub connector_in: ConnectorConfig,
    pub connector_out: ConnectorConfig,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl PipelineConfig {
    pub fn new(connector_in: ConnectorConfig, connector_out: ConnectorConfig) -> Self {
        Self {
            connector_in,
            connector_out,
            stages: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }
}

/// Ordered collection of pipeline definitions keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelinesDocument {
    entries: Vec<(String, PipelineConfig)>,
}

impl PipelinesDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a definition, keeping the position of an existing id.
    pub fn insert(&mut self, id: impl Into<String>, config: PipelineConfig) {
        let id = id.into();
        match self.entries.iter_mut().find(|(k, _)| *k == id) {
            Some((_, existing)) => *existing = config,
            None => self.entries.push((id, config)),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<PipelineConfig> {
        let pos = self.entries.iter().position(|(k, _)| k == id)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn get(&self, id: &str) -> Option<&PipelineConfig> {
        self.entries.iter().find(|(k, _)| k == id).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PipelineConfig)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a document from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| BridgeError::Config(format!("Failed to parse pipelines: {}", e)))
    }

    /// Load a document from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content).with_context(|| format!("loading {}", path.display()))
    }

    /// Load a document, or an empty one when the file is missing or invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!("Ignoring pipelines file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save the document as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| BridgeError::Serialization(e.to_string()))?;
        std::fs::write(path, content)?;
        tracing::info!("Saved {} pipeline(s) to {}", self.len(), path.display());
        Ok(())
    }
}

impl Serialize for PipelinesDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (id, config) in &self.entries {
            map.serialize_entry(id, config)?;
        }
        map.end()
    }
}

struct DocumentVisitor;

impl<'de> Visitor<'de> for DocumentVisitor {
    type Value = PipelinesDocument;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("an object mapping pipeline ids to pipeline definitions")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
        let mut doc = PipelinesDocument::new();
        while let Some((id, config)) = access.next_entry::<String, PipelineConfig>()? {
            if doc.get(&id).is_some() {
                return Err(serde::de::Error::custom(format!("duplicate pipeline id '{id}'")));
            }
            doc.entries.push((id, config));
        }
        Ok(doc)
    }
}

impl<'de> Deserialize<'de> for PipelinesDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(DocumentVisitor)
    }
}
