//! Stage chain: the per-message control-transfer algorithm.
//!
//! A chain is an ordered list of stages `S0..Sn-1` plus a virtual terminal
//! `"out"` at index `n`. Goto targets are resolved once at construction into
//! a [`RoutePlan`], so the hot loop only follows indices.
//!
//! For each stage visit the chain merges the stage metadata, checks the
//! expected representation, runs the stage, applies `not`, publishes to the
//! redirect queues and then branches:
//!
//! - accepted: `goto_passed`, else `goto`, else the next stage;
//! - rejected: `goto_rejected` (re-accepting the message there), else drop.
//!
//! A stage that returns [`StageOutcome::Generate`] hands the chain a
//! producer. The chain keeps it on its generation stack together with the
//! continuation index (`goto`, else the next stage) and drains it before
//! taking new input. Generated messages enter the chain at the continuation;
//! the message that triggered the generation is not forwarded.
//!
//! A stage that returns [`StageOutcome::Hold`] consumes the message: redirects
//! still fire, but neither branch is taken. The stage re-injects it later
//! through a timer event.

use crate::config::StageConfig;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::event::{EventScheduler, StageEvent};
use crate::pipeline::fanout::FanoutRegistry;
use crate::pipeline::message::{Message, MessageWrapper};
use crate::pipeline::stage::{ConfiguredStage, Producer, StageContext, StageOutcome, OUT_TARGET};
use crate::pipeline::stage_type::StageFactory;
use std::collections::HashMap;
use std::sync::Arc;

/// Default limit on stage visits per message.
pub const DEFAULT_MAX_HOPS: usize = 1024;

/// Resolved goto targets of one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Route {
    pub goto: Option<usize>,
    pub passed: Option<usize>,
    pub rejected: Option<usize>,
}

/// Pre-computed routing for a chain.
#[derive(Debug, Clone, Default)]
pub struct RoutePlan {
    pub routes: Vec<Route>,
    /// Goto names that matched no stage and were mapped to the terminal.
    pub unresolved: Vec<String>,
}

impl RoutePlan {
    /// Resolve every goto target of `stages`.
    pub fn compile(stages: &[ConfiguredStage]) -> PipelineResult<Self> {
        let terminal = stages.len();
        let mut labels: HashMap<&str, usize> = HashMap::new();
        for (index, slot) in stages.iter().enumerate() {
            if let Some(label) = slot.common.label() {
                if label == OUT_TARGET {
                    return Err(PipelineError::InvalidStage {
                        index,
                        message: format!("'{OUT_TARGET}' is reserved for the end of the chain"),
                    });
                }
                if labels.insert(label, index).is_some() {
                    return Err(PipelineError::InvalidStage {
                        index,
                        message: format!("duplicate stage name '{label}'"),
                    });
                }
            }
        }

        let mut unresolved = Vec::new();
        let mut lookup = |target: Option<&str>| -> Option<usize> {
            let target = target?;
            if target == OUT_TARGET {
                return Some(terminal);
            }
            Some(labels.get(target).copied().unwrap_or_else(|| {
                unresolved.push(target.to_string());
                terminal
            }))
        };

        let routes = stages
            .iter()
            .map(|slot| Route {
                goto: lookup(slot.common.goto()),
                passed: lookup(slot.common.goto_passed()),
                rejected: lookup(slot.common.goto_rejected()),
            })
            .collect();

        Ok(Self { routes, unresolved })
    }
}

/// Result of pushing one input (or one timer event) through the chain.
#[derive(Debug, Default)]
pub struct ChainOutput {
    /// Messages that reached the terminal accepted.
    pub delivered: Vec<MessageWrapper>,
    /// Messages rejected with nowhere to go.
    pub dropped: u64,
    /// Messages a stage kept back for a later timed release.
    pub held: u64,
    /// Per-message failures. Each one aborted a single message.
    pub errors: Vec<PipelineError>,
}

impl ChainOutput {
    fn absorb(&mut self, other: ChainOutput) {
        self.delivered.extend(other.delivered);
        self.dropped += other.dropped;
        self.held += other.held;
        self.errors.extend(other.errors);
    }
}

/// Live generation owned by the chain.
struct Generating {
    continuation: usize,
    producer: Producer,
}

/// How a single walk through the chain ended.
enum Walk {
    Delivered(MessageWrapper),
    Dropped,
    Generated,
    Held,
}

pub struct StageChain {
    pipeline_id: String,
    stages: Vec<ConfiguredStage>,
    plan: RoutePlan,
    fanout: Arc<FanoutRegistry>,
    scheduler: EventScheduler,
    max_hops: usize,
    generating: Vec<Generating>,
}

impl StageChain {
    /// Create a chain from already built stages.
    pub fn new(
        pipeline_id: impl Into<String>,
        stages: Vec<ConfiguredStage>,
        fanout: Arc<FanoutRegistry>,
    ) -> PipelineResult<Self> {
        let pipeline_id = pipeline_id.into();
        let plan = RoutePlan::compile(&stages)?;
        for name in &plan.unresolved {
            tracing::warn!(
                "Pipeline '{}': goto target '{}' matches no stage, treating it as '{}'",
                pipeline_id,
                name,
                OUT_TARGET
            );
        }
        Ok(Self {
            pipeline_id,
            stages,
            plan,
            fanout,
            scheduler: EventScheduler::detached(),
            max_hops: DEFAULT_MAX_HOPS,
            generating: Vec::new(),
        })
    }

    /// Build a chain from stage configuration.
    pub fn build(
        pipeline_id: impl Into<String>,
        configs: &[StageConfig],
        fanout: Arc<FanoutRegistry>,
    ) -> PipelineResult<Self> {
        let stages = StageFactory::new().create_all(configs)?;
        Self::new(pipeline_id, stages, fanout)
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops.max(1);
        self
    }

    /// Attach the scheduler of the run the chain is used in.
    pub fn set_scheduler(&mut self, scheduler: EventScheduler) {
        self.scheduler = scheduler;
    }

    pub fn scheduler(&self) -> &EventScheduler {
        &self.scheduler
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn plan(&self) -> &RoutePlan {
        &self.plan
    }

    /// Whether a generation is still pending.
    pub fn is_generating(&self) -> bool {
        !self.generating.is_empty()
    }

    /// Display names of all stages, in order.
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.display_name().to_string()).collect()
    }

    /// Notify stages that a run begins.
    pub fn start(&mut self) {
        for slot in &mut self.stages {
            slot.stage.on_start();
        }
    }

    /// Notify stages that the run ended and drop any pending generation.
    pub fn stop(&mut self) {
        if !self.generating.is_empty() {
            tracing::debug!(
                "Pipeline '{}': discarding {} pending generation(s)",
                self.pipeline_id,
                self.generating.len()
            );
            self.generating.clear();
        }
        for slot in &mut self.stages {
            slot.stage.on_stop();
        }
    }

    /// Run one inbound message through the chain.
    pub fn process(&mut self, message: Message) -> ChainOutput {
        let mut out = ChainOutput::default();
        self.drain_generations(&mut out);
        self.run_from(0, MessageWrapper::new(message), &mut out);
        self.drain_generations(&mut out);
        out
    }

    /// Deliver a timer event to the stage that scheduled it.
    pub fn handle_event(&mut self, event: StageEvent) -> ChainOutput {
        let mut out = ChainOutput::default();
        let i = event.stage_index;
        let Some(slot) = self.stages.get_mut(i) else {
            tracing::warn!(
                "Pipeline '{}': event for unknown stage {}",
                self.pipeline_id,
                i
            );
            return out;
        };

        let mut ctx = StageContext {
            pipeline_id: &self.pipeline_id,
            stage_index: i,
            scheduler: &self.scheduler,
        };
        match slot.stage.on_timer(event.token, &mut ctx) {
            Ok(Some(message)) => {
                let mut wrapper = MessageWrapper::new(message);
                wrapper.merge_metadata(&slot.common.metadata);
                let route = self.plan.routes[i];
                let next = route.passed.or(route.goto).unwrap_or(i + 1);
                self.run_from(next, wrapper, &mut out);
            }
            Ok(None) => {}
            Err(e) => {
                let err = PipelineError::stage(slot.display_name(), e.to_string());
                tracing::warn!("Pipeline '{}': {}", self.pipeline_id, err);
                out.errors.push(err);
            }
        }
        self.drain_generations(&mut out);
        out
    }

    /// Run several messages, collecting the combined output.
    pub fn process_batch(&mut self, messages: impl IntoIterator<Item = Message>) -> ChainOutput {
        let mut out = ChainOutput::default();
        for message in messages {
            out.absorb(self.process(message));
        }
        out
    }

    fn drain_generations(&mut self, out: &mut ChainOutput) {
        while let Some(top) = self.generating.last_mut() {
            match top.producer.next_message() {
                Some(message) => {
                    let continuation = top.continuation;
                    self.run_from(continuation, MessageWrapper::new(message), out);
                }
                None => {
                    self.generating.pop();
                }
            }
        }
    }

    fn run_from(&mut self, start: usize, wrapper: MessageWrapper, out: &mut ChainOutput) {
        match self.walk(start, wrapper) {
            Ok(Walk::Delivered(wrapper)) => out.delivered.push(wrapper),
            Ok(Walk::Dropped) => out.dropped += 1,
            Ok(Walk::Generated) => {}
            Ok(Walk::Held) => out.held += 1,
            Err(e) => {
                tracing::warn!("Pipeline '{}': message aborted: {}", self.pipeline_id, e);
                out.errors.push(e);
            }
        }
    }

    fn walk(&mut self, start: usize, mut wrapper: MessageWrapper) -> PipelineResult<Walk> {
        let terminal = self.stages.len();
        let mut i = start;
        let mut hops = 0usize;

        while i < terminal {
            hops += 1;
            if hops > self.max_hops {
                return Err(PipelineError::HopLimit(self.max_hops));
            }

            let slot = &mut self.stages[i];
            let route = self.plan.routes[i];
            wrapper.merge_metadata(&slot.common.metadata);

            if let Some(kind) = slot.common.expect.message_type() {
                wrapper
                    .working
                    .ensure(kind)
                    .map_err(|e| PipelineError::stage(slot.display_name(), e.to_string()))?;
            }

            let mut ctx = StageContext {
                pipeline_id: &self.pipeline_id,
                stage_index: i,
                scheduler: &self.scheduler,
            };
            let outcome = slot
                .stage
                .process(&mut wrapper, &mut ctx)
                .map_err(|e| PipelineError::stage(slot.display_name(), e.to_string()))?;

            let (producer, held) = match outcome {
                StageOutcome::Done => (None, false),
                StageOutcome::Generate(producer) => (Some(producer), false),
                StageOutcome::Hold => (None, true),
            };
            if producer.is_none() && !held && slot.common.negate {
                wrapper.accepted = !wrapper.accepted;
            }

            for name in &slot.common.redirect {
                wrapper.redirects.insert(name.clone());
                let report = self.fanout.redirect(&wrapper, name);
                tracing::trace!(
                    "Pipeline '{}': stage {} redirected to '{}' ({} delivered)",
                    self.pipeline_id,
                    i,
                    name,
                    report.delivered
                );
            }

            if held {
                return Ok(Walk::Held);
            }

            if let Some(producer) = producer {
                let continuation = route.goto.unwrap_or(i + 1);
                self.generating.push(Generating {
                    continuation,
                    producer,
                });
                return Ok(Walk::Generated);
            }

            i = if wrapper.accepted {
                route.passed.or(route.goto).unwrap_or(i + 1)
            } else {
                match route.rejected {
                    Some(target) => {
                        wrapper.accept();
                        target
                    }
                    None => return Ok(Walk::Dropped),
                }
            };
        }

        if wrapper.accepted {
            Ok(Walk::Delivered(wrapper))
        } else {
            Ok(Walk::Dropped)
        }
    }
}

impl std::fmt::Debug for StageChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageChain")
            .field("pipeline_id", &self.pipeline_id)
            .field("stages", &self.stage_names())
            .field("max_hops", &self.max_hops)
            .field("generating", &self.generating.len())
            .finish()
    }
}
