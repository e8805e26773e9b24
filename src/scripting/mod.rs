//! Rhai Scripting Engine for Message Scripts
//!
//! The `script` stage runs a user-provided Rhai program once per message.
//! The program sees the message through scope variables and may rewrite
//! them; see [`engine`] for the exact contract.
//!
//! ## Helper Functions
//!
//! - `time()`, `dt()`, `count()` - stage timing and message counter
//! - `to_json(value)` / `parse_json(text)` - JSON text conversion
//! - `to_text(blob)` / `to_blob(text)` - byte payload conversion
//! - `deadband(value, center, width)`, `clamp`, `lerp`, `map_range`
//! - `now_ms()` - wall clock in Unix milliseconds
//!
//! ## Example Scripts
//!
//! Dropping readings below a threshold:
//! ```rhai
//! payload.temp >= 0.0
//! ```
//!
//! Tagging a message with its sequence number:
//! ```rhai
//! metadata.seq = count();
//! topic = "tagged/" + topic;
//! ```

mod engine;

pub use engine::{
    from_dynamic, to_dynamic, ExecutionContext, ScriptContext, ScriptEngine, ScriptInput,
    ScriptOutput, SharedScriptContext,
};

use crate::error::{BridgeError, Result};
use rhai::{Engine, AST};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A compiled script that can be executed repeatedly
#[derive(Clone)]
pub struct CompiledScript {
    ast: AST,
    source: String,
    name: String,
}

impl CompiledScript {
    /// Get the source code of this script
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Get the name of this script
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn ast(&self) -> &AST {
        &self.ast
    }
}

impl std::fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledScript")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish()
    }
}

/// Cache for compiled scripts, keyed by source
#[derive(Default)]
pub struct ScriptCache {
    cache: HashMap<String, CompiledScript>,
}

impl ScriptCache {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    /// Get a cached script or compile and cache it
    pub fn get_or_compile(&mut self, engine: &Engine, name: &str, source: &str) -> Result<CompiledScript> {
        if let Some(script) = self.cache.get(source) {
            return Ok(script.clone());
        }

        let ast = engine
            .compile(source)
            .map_err(|e| BridgeError::Script(format!("Compilation error: {}", e)))?;

        let script = CompiledScript {
            ast,
            source: source.to_string(),
            name: name.to_string(),
        };

        self.cache.insert(source.to_string(), script.clone());
        Ok(script)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// Thread-safe script cache wrapper
pub type SharedScriptCache = Arc<RwLock<ScriptCache>>;

/// Create a new shared script cache
pub fn create_shared_cache() -> SharedScriptCache {
    Arc::new(RwLock::new(ScriptCache::new()))
}

/// Ready-made scripts for common message handling
pub mod builtins {
    /// Accept everything unchanged
    pub const PASS: &str = "true";

    /// Accept documents that carry a non-empty `id`
    pub const REQUIRE_ID: &str = r#"
type_of(payload) == "map" && "id" in payload && payload.id != ""
"#;

    /// Record the arrival order in metadata
    pub const SEQUENCE_METADATA: &str = r#"
metadata.seq = count();
metadata.received_ms = now_ms();
"#;

    /// Wrap any payload into `{ topic, data }`
    pub const ENVELOPE: &str = r#"
payload = #{ topic: topic, data: payload };
"#;

    /// List of all built-in scripts with names
    pub fn all() -> Vec<(&'static str, &'static str)> {
        vec![
            ("Pass", PASS),
            ("Require id", REQUIRE_ID),
            ("Sequence metadata", SEQUENCE_METADATA),
            ("Envelope", ENVELOPE),
        ]
    }
}
