//! Rhai Script Engine Implementation
//!
//! Runs message scripts for the `script` stage.
//!
//! ## Scope
//!
//! - `payload` - document payloads as maps/arrays, text as a string, other bytes as a blob
//! - `topic` - message topic
//! - `metadata` - wrapper metadata map
//! - `accept` - decision, `true` on entry
//!
//! ## Context Functions
//!
//! - `time()` - seconds since the stage started
//! - `dt()` - seconds since the previous message (0 for the first)
//! - `count()` - messages seen by this stage before the current one

use crate::error::{BridgeError, Result, ResultExt};
use crate::scripting::{CompiledScript, ScriptCache, SharedScriptCache};
use rhai::{Blob, Dynamic, Engine, Scope};
use serde_json::Value;
use std::sync::{Arc, RwLock};

/// Timing data published to scripts through the context functions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionContext {
    /// Seconds since the owning stage started
    pub time_secs: f64,
    /// Seconds since the previous message
    pub dt_secs: f64,
    /// Messages processed before this one
    pub count: i64,
}

impl ExecutionContext {
    pub fn new(time_secs: f64, dt_secs: f64, count: i64) -> Self {
        Self {
            time_secs,
            dt_secs,
            count,
        }
    }
}

/// Shared script context read by registered functions
#[derive(Debug, Clone, Default)]
pub struct ScriptContext {
    context: ExecutionContext,
}

impl ScriptContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, ctx: ExecutionContext) {
        self.context = ctx;
    }

    pub fn current(&self) -> ExecutionContext {
        self.context
    }
}

/// Thread-safe shared script context
pub type SharedScriptContext = Arc<RwLock<ScriptContext>>;

/// Message as seen by a script.
#[derive(Debug, Clone)]
pub struct ScriptInput {
    pub payload: Dynamic,
    pub topic: String,
    pub metadata: Dynamic,
}

/// Scope values after a script ran.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub payload: Dynamic,
    pub topic: String,
    pub metadata: Dynamic,
    pub accept: bool,
}

/// Convert a JSON value into a script value.
pub fn to_dynamic(value: &Value) -> Result<Dynamic> {
    rhai::serde::to_dynamic(value).map_err(|e| BridgeError::Script(format!("Conversion error: {}", e)))
}

/// Convert a script value back into JSON.
pub fn from_dynamic(value: &Dynamic) -> Result<Value> {
    rhai::serde::from_dynamic(value).map_err(|e| BridgeError::Script(format!("Conversion error: {}", e)))
}

/// The script engine used by message scripts
pub struct ScriptEngine {
    engine: Engine,
    cache: SharedScriptCache,
    context: SharedScriptContext,
}

impl ScriptEngine {
    /// Create a new script engine with default configuration
    pub fn new() -> Self {
        Self::with_cache(Arc::new(RwLock::new(ScriptCache::new())))
    }

    /// Create a new script engine with a shared cache
    pub fn with_cache(cache: SharedScriptCache) -> Self {
        let context = Arc::new(RwLock::new(ScriptContext::new()));
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine, context.clone());

        Self {
            engine,
            cache,
            context,
        }
    }

    /// Configure the Rhai engine with helper functions and safety limits
    fn configure_engine(engine: &mut Engine, context: SharedScriptContext) {
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(100_000);
        engine.set_max_string_size(1_048_576);
        engine.set_max_array_size(10_000);
        engine.set_max_map_size(10_000);

        {
            let ctx = context.clone();
            engine.register_fn("time", move || -> f64 {
                ctx.read().map(|c| c.context.time_secs).unwrap_or(0.0)
            });
        }
        {
            let ctx = context.clone();
            engine.register_fn("dt", move || -> f64 {
                ctx.read().map(|c| c.context.dt_secs).unwrap_or(0.0)
            });
        }
        {
            let ctx = context;
            engine.register_fn("count", move || -> i64 {
                ctx.read().map(|c| c.context.count).unwrap_or(0)
            });
        }

        // JSON helpers
        engine.register_fn("to_json", |value: Dynamic| -> String {
            rhai::serde::from_dynamic::<Value>(&value)
                .map(|v| v.to_string())
                .unwrap_or_default()
        });
        engine.register_fn("parse_json", |text: &str| -> Dynamic {
            serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| rhai::serde::to_dynamic(v).ok())
                .unwrap_or(Dynamic::UNIT)
        });

        // Blob helpers
        engine.register_fn("to_text", |blob: Blob| -> String {
            String::from_utf8_lossy(&blob).into_owned()
        });
        engine.register_fn("to_blob", |text: &str| -> Blob { text.as_bytes().to_vec() });

        // Numeric helpers
        engine.register_fn("deadband", |value: f64, center: f64, width: f64| -> f64 {
            if (value - center).abs() < width / 2.0 {
                center
            } else {
                value
            }
        });
        engine.register_fn("clamp", |x: f64, min: f64, max: f64| x.clamp(min, max));
        engine.register_fn("lerp", |a: f64, b: f64, t: f64| a + (b - a) * t);
        engine.register_fn(
            "map_range",
            |x: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64| {
                (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
            },
        );
        engine.register_fn("now_ms", || chrono::Utc::now().timestamp_millis());
    }

    /// Compile a script and cache it
    pub fn compile(&self, name: &str, source: &str) -> Result<CompiledScript> {
        let mut cache = self
            .cache
            .write()
            .map_err(|e| BridgeError::Script(format!("Failed to acquire cache lock: {}", e)))?;
        cache.get_or_compile(&self.engine, name, source)
    }

    /// Run a compiled script against one message.
    ///
    /// A boolean result value overrides the `accept` variable.
    pub fn execute(
        &self,
        script: &CompiledScript,
        input: ScriptInput,
        ctx: ExecutionContext,
    ) -> Result<ScriptOutput> {
        {
            let mut context = self.context.write().map_err(|e| {
                BridgeError::Script(format!("Failed to acquire context lock: {}", e))
            })?;
            context.update(ctx);
        }

        let mut scope = Scope::new();
        scope.push("payload", input.payload);
        scope.push("topic", input.topic);
        scope.push("metadata", input.metadata);
        scope.push("accept", true);

        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, script.ast())
            .with_context(|| format!("Execution error in '{}'", script.name()))?;

        let accept = match result.as_bool() {
            Ok(decision) => decision,
            Err(_) => scope
                .get_value::<bool>("accept")
                .ok_or_else(|| BridgeError::Script("`accept` must stay a boolean".to_string()))?,
        };
        let topic = scope
            .get_value::<String>("topic")
            .ok_or_else(|| BridgeError::Script("`topic` must stay a string".to_string()))?;
        let payload = scope.get_value::<Dynamic>("payload").unwrap_or(Dynamic::UNIT);
        let metadata = scope.get_value::<Dynamic>("metadata").unwrap_or(Dynamic::UNIT);

        Ok(ScriptOutput {
            payload,
            topic,
            metadata,
            accept,
        })
    }

    /// Validate a script without executing it
    pub fn validate(&self, source: &str) -> Result<()> {
        self.engine
            .compile(source)
            .map(|_| ())
            .map_err(|e| BridgeError::Script(format!("Validation error: {}", e)))
    }

    /// Clear the script cache
    pub fn clear_cache(&self) -> Result<()> {
        let mut cache = self
            .cache
            .write()
            .map_err(|e| BridgeError::Script(format!("Failed to acquire cache lock: {}", e)))?;
        cache.clear();
        Ok(())
    }

    /// Get a reference to the shared cache
    pub fn cache(&self) -> &SharedScriptCache {
        &self.cache
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("cache_size", &self.cache.read().map(|c| c.len()).ok())
            .finish()
    }
}
