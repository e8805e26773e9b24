//! Shared application context.
//!
//! Everything that would otherwise be a process-wide singleton (the fan-out
//! directory, runtime sizing) is owned here and handed to pipelines and
//! connectors explicitly.

use crate::config::RuntimeSettings;
use crate::pipeline::fanout::FanoutRegistry;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct AppContext {
    pub fanout: Arc<FanoutRegistry>,
    pub settings: RuntimeSettings,
}

impl AppContext {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            fanout: Arc::new(FanoutRegistry::new()),
            settings,
        }
    }

    pub fn shared(settings: RuntimeSettings) -> Arc<Self> {
        Arc::new(Self::new(settings))
    }
}
