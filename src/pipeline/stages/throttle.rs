//! ThrottleStage: fixed-window rate limit.
//!
//! At most `rate` messages are accepted per `period_ms` window. Over the
//! limit the message is rejected (`drop`), or (`delay`) held as the latest
//! pending message and released by a timer event when the window reopens.
//! Only the most recent held message survives; earlier ones are replaced.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::message::{Message, MessageWrapper};
use crate::pipeline::stage::{FieldKind, FieldSchema, Stage, StageContext, StageOutcome};
use crate::pipeline::stages::parse_params;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

pub static FIELDS: &[FieldSchema] = &[
    FieldSchema::required("rate", FieldKind::Integer),
    FieldSchema::optional("period_ms", FieldKind::Integer, Some("1000")),
    FieldSchema::optional("mode", FieldKind::String, Some("drop")).one_of(&["drop", "delay"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleMode {
    #[default]
    Drop,
    Delay,
}

fn default_period() -> u64 {
    1000
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThrottleConfig {
    rate: u32,
    #[serde(default = "default_period")]
    period_ms: u64,
    #[serde(default)]
    mode: ThrottleMode,
}

#[derive(Debug)]
pub struct ThrottleStage {
    rate: u32,
    period: Duration,
    mode: ThrottleMode,
    window_start: Option<Instant>,
    count: u32,
    held: Option<Message>,
    timer_token: u64,
    timer_pending: bool,
}

impl ThrottleStage {
    pub fn new(rate: u32, period: Duration, mode: ThrottleMode) -> Self {
        Self {
            rate,
            period,
            mode,
            window_start: None,
            count: 0,
            held: None,
            timer_token: 0,
            timer_pending: false,
        }
    }

    pub fn from_params(params: &Map<String, Value>) -> PipelineResult<Self> {
        let cfg: ThrottleConfig = parse_params(params)?;
        if cfg.rate == 0 {
            return Err(PipelineError::Config("rate must be positive".to_string()));
        }
        if cfg.period_ms == 0 {
            return Err(PipelineError::Config("period_ms must be positive".to_string()));
        }
        Ok(Self::new(cfg.rate, Duration::from_millis(cfg.period_ms), cfg.mode))
    }

    /// Number of messages currently held back (0 or 1).
    pub fn held(&self) -> usize {
        usize::from(self.held.is_some())
    }

    fn roll_window(&mut self, now: Instant) {
        match self.window_start {
            Some(start) if now.duration_since(start) < self.period => {}
            _ => {
                self.window_start = Some(now);
                self.count = 0;
            }
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.window_start
            .map(|start| self.period.saturating_sub(now.duration_since(start)))
            .unwrap_or_default()
    }
}

impl Stage for ThrottleStage {
    fn type_name(&self) -> &'static str {
        "throttle"
    }

    fn process(
        &mut self,
        wrapper: &mut MessageWrapper,
        ctx: &mut StageContext,
    ) -> PipelineResult<StageOutcome> {
        let now = Instant::now();
        self.roll_window(now);

        if self.count < self.rate {
            self.count += 1;
            wrapper.accept();
            return Ok(StageOutcome::Done);
        }

        wrapper.reject();
        if self.mode == ThrottleMode::Drop {
            return Ok(StageOutcome::Done);
        }

        if self.held.replace(wrapper.working.clone()).is_some() {
            tracing::debug!("Pipeline '{}': throttle replaced its held message", ctx.pipeline_id);
        }
        if !self.timer_pending {
            self.timer_pending = true;
            self.timer_token = self.timer_token.wrapping_add(1);
            ctx.schedule(self.remaining(now), self.timer_token);
        }
        Ok(StageOutcome::Hold)
    }

    fn on_timer(&mut self, token: u64, _ctx: &mut StageContext) -> PipelineResult<Option<Message>> {
        if token != self.timer_token {
            return Ok(None);
        }
        self.timer_pending = false;
        let Some(held) = self.held.take() else {
            return Ok(None);
        };
        let now = Instant::now();
        self.roll_window(now);
        self.count = self.count.saturating_add(1);
        tracing::trace!("Throttle releasing held message on '{}'", held.topic());
        Ok(Some(held))
    }

    fn on_stop(&mut self) {
        self.held = None;
        self.timer_pending = false;
        self.window_start = None;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::EventScheduler;
    use crate::pipeline::stages::test_support::ctx;

    fn offer(stage: &mut ThrottleStage, scheduler: &EventScheduler, text: &str) -> bool {
        let mut w = MessageWrapper::new(Message::raw("t", text.as_bytes().to_vec()));
        let outcome = stage.process(&mut w, &mut ctx(scheduler)).unwrap();
        if !w.accepted && stage.mode == ThrottleMode::Delay {
            assert!(matches!(outcome, StageOutcome::Hold));
        }
        w.accepted
    }

    #[test]
    fn test_drop_mode_limits_per_window() {
        let scheduler = EventScheduler::detached();
        let mut stage = ThrottleStage::new(2, Duration::from_secs(60), ThrottleMode::Drop);
        assert!(offer(&mut stage, &scheduler, "a"));
        assert!(offer(&mut stage, &scheduler, "b"));
        assert!(!offer(&mut stage, &scheduler, "c"));
        assert_eq!(stage.held(), 0);
        assert!(scheduler.pending().is_empty());
    }

    #[test]
    fn test_window_reopens() {
        let scheduler = EventScheduler::detached();
        let mut stage = ThrottleStage::new(1, Duration::from_millis(20), ThrottleMode::Drop);
        assert!(offer(&mut stage, &scheduler, "a"));
        assert!(!offer(&mut stage, &scheduler, "b"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(offer(&mut stage, &scheduler, "c"));
    }

    #[test]
    fn test_delay_mode_releases_latest() {
        let scheduler = EventScheduler::detached();
        let mut stage = ThrottleStage::new(1, Duration::from_millis(20), ThrottleMode::Delay);
        assert!(offer(&mut stage, &scheduler, "a"));
        assert!(!offer(&mut stage, &scheduler, "b"));
        assert!(!offer(&mut stage, &scheduler, "c"));
        assert_eq!(stage.held(), 1);

        let event = scheduler
            .pending()
            .pop_timeout(Duration::from_secs(2))
            .expect("timer event");
        let released = stage
            .on_timer(event.token, &mut ctx(&scheduler))
            .unwrap()
            .expect("held message");
        assert_eq!(released.as_bytes().unwrap(), b"c");
        assert_eq!(stage.held(), 0);
        // Only one timer was scheduled for the burst.
        assert!(scheduler.pending().is_empty());
    }

    #[test]
    fn test_stale_token_ignored() {
        let scheduler = EventScheduler::detached();
        let mut stage = ThrottleStage::new(1, Duration::from_secs(60), ThrottleMode::Delay);
        assert!(stage.on_timer(42, &mut ctx(&scheduler)).unwrap().is_none());
    }

    #[test]
    fn test_zero_rate_rejected() {
        let mut params = Map::new();
        params.insert("rate".into(), Value::from(0));
        assert!(ThrottleStage::from_params(&params).is_err());
    }
}
