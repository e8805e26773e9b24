//! Registry of named pipelines.

use crate::config::{PipelineConfig, PipelinesDocument};
use crate::context::AppContext;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::runtime::{PipelineRuntime, PipelineState, PipelineStatus};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct PipelineRegistry {
    ctx: Arc<AppContext>,
    pipelines: BTreeMap<String, PipelineRuntime>,
    /// Registration order, used for bulk operations and snapshots.
    order: Vec<String>,
}

impl PipelineRegistry {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            pipelines: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Register a pipeline built from `config`.
    ///
    /// A configuration error does not fail the call: the pipeline is
    /// registered as `Malformed` and its `last_error` explains why.
    pub fn add(&mut self, id: &str, config: PipelineConfig) -> PipelineResult<PipelineState> {
        if self.pipelines.contains_key(id) {
            return Err(PipelineError::DuplicateId(id.to_string()));
        }
        let runtime = PipelineRuntime::from_config(id, &config, &self.ctx);
        let state = runtime.state();
        self.insert(runtime);
        tracing::info!("Registered pipeline '{}' ({})", id, state);
        Ok(state)
    }

    /// Register an already built runtime.
    pub fn add_runtime(&mut self, runtime: PipelineRuntime) -> PipelineResult<()> {
        if self.pipelines.contains_key(runtime.id()) {
            return Err(PipelineError::DuplicateId(runtime.id().to_string()));
        }
        self.insert(runtime);
        Ok(())
    }

    fn insert(&mut self, runtime: PipelineRuntime) {
        self.order.push(runtime.id().to_string());
        self.pipelines.insert(runtime.id().to_string(), runtime);
    }

    /// Stop, terminate and unregister a pipeline.
    pub fn remove(&mut self, id: &str) -> PipelineResult<()> {
        let mut runtime = self
            .pipelines
            .remove(id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        self.order.retain(|other| other != id);
        if let Err(e) = runtime.stop() {
            tracing::debug!("Pipeline '{}': stop before removal: {}", id, e);
        }
        runtime.terminate();
        tracing::info!("Removed pipeline '{}'", id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> PipelineResult<&PipelineRuntime> {
        self.pipelines
            .get(id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pipelines.contains_key(id)
    }

    /// Pipeline ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn start(&self, id: &str) -> PipelineResult<PipelineState> {
        self.get(id)?.start()
    }

    pub fn stop(&self, id: &str) -> PipelineResult<PipelineState> {
        self.get(id)?.stop()
    }

    pub fn restart(&self, id: &str) -> PipelineResult<PipelineState> {
        self.get(id)?.restart()
    }

    /// Terminate a pipeline but keep it registered.
    pub fn terminate(&mut self, id: &str) -> PipelineResult<PipelineState> {
        self.pipelines
            .get_mut(id)
            .map(PipelineRuntime::terminate)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    pub fn status(&self, id: &str) -> PipelineResult<PipelineStatus> {
        self.get(id).map(PipelineRuntime::status)
    }

    /// Status of every pipeline, in registration order.
    pub fn statuses(&self) -> Vec<PipelineStatus> {
        self.order
            .iter()
            .filter_map(|id| self.pipelines.get(id))
            .map(PipelineRuntime::status)
            .collect()
    }

    /// Start every pipeline that can run. Returns the ids that failed.
    pub fn start_all(&self) -> Vec<(String, PipelineError)> {
        let mut failures = Vec::new();
        for id in &self.order {
            let Some(runtime) = self.pipelines.get(id) else {
                continue;
            };
            if runtime.state().is_terminal() {
                continue;
            }
            if let Err(e) = runtime.start() {
                tracing::warn!("Pipeline '{}' did not start: {}", id, e);
                failures.push((id.clone(), e));
            }
        }
        failures
    }

    pub fn terminate_all(&mut self) {
        for id in self.order.iter().rev() {
            if let Some(runtime) = self.pipelines.get_mut(id) {
                runtime.terminate();
            }
        }
        tracing::info!("Terminated {} pipeline(s)", self.pipelines.len());
    }

    /// Replace a pipeline's configuration, restarting it if it was running.
    pub fn update(&mut self, id: &str, config: PipelineConfig) -> PipelineResult<PipelineState> {
        let was_running = self.get(id)?.state() == PipelineState::Running;
        let replacement = PipelineRuntime::from_config(id, &config, &self.ctx);
        if let Some(mut old) = self.pipelines.insert(id.to_string(), replacement) {
            old.terminate();
        }
        let runtime = self.get(id)?;
        if was_running && !runtime.state().is_terminal() {
            return runtime.start();
        }
        Ok(runtime.state())
    }

    /// Check a configuration without registering it. Returns the first error.
    pub fn validate(&self, config: &PipelineConfig) -> PipelineResult<()> {
        PipelineRuntime::validate(config, &self.ctx)
    }

    /// Register every pipeline of `document`. Duplicate ids are reported.
    pub fn load(&mut self, document: &PipelinesDocument) -> Vec<(String, PipelineError)> {
        let mut failures = Vec::new();
        for (id, config) in document.iter() {
            if let Err(e) = self.add(id, config.clone()) {
                failures.push((id.to_string(), e));
            }
        }
        failures
    }

    /// Configuration of every pipeline that was built from one.
    pub fn snapshot(&self) -> PipelinesDocument {
        let mut document = PipelinesDocument::new();
        for id in &self.order {
            if let Some(config) = self.pipelines.get(id).and_then(PipelineRuntime::config) {
                document.insert(id.clone(), config.clone());
            }
        }
        document
    }
}

impl Drop for PipelineRegistry {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

impl std::fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("pipelines", &self.order)
            .finish()
    }
}
