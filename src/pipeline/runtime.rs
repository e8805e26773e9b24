//! Pipeline runtime: worker threads and the control state machine.
//!
//! A running pipeline has three workers joined by bounded queues:
//!
//! ```text
//! inbound ─receive→ [raw] ─process (StageChain)→ [wrapped] ─send→ outbound
//! ```
//!
//! plus one long-lived control thread that owns the state machine. Control
//! requests travel over a bounded crossbeam channel and are answered over a
//! per-request reply channel, so every control call returns the resulting
//! state. Workers never change the state except to report a failure; the
//! control thread then tears the run down and leaves the pipeline `Failed`.
//!
//! Worker threads hand their connector (or the chain) back through their
//! join handle, so the next `start` reuses the same instances.

use crate::config::{PipelineConfig, RuntimeSettings};
use crate::connector::{
    Connector, ConnectorError, ConnectorFactory, ConnectorStats, Direction, StatsSnapshot,
    StopHandle,
};
use crate::context::AppContext;
use crate::pipeline::chain::{ChainOutput, StageChain};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::event::{EventScheduler, StageEvent};
use crate::pipeline::message::{Message, MessageWrapper};
use crate::pipeline::queue::{BoundedQueue, WakeSignal};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Stopped,
    Running,
    Stopping,
    Failed,
    /// Construction failed. Terminal; no thread was ever started.
    Malformed,
    Terminated,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Failed => "failed",
            PipelineState::Malformed => "malformed",
            PipelineState::Terminated => "terminated",
        }
    }

    /// Whether no control request can move the pipeline out of this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Malformed | PipelineState::Terminated)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a pipeline for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub id: String,
    pub state: PipelineState,
    pub last_error: Option<String>,
    /// Most recent per-message stage failure. Does not affect `state`.
    pub last_stage_error: Option<String>,
    pub inbound: StatsSnapshot,
    pub outbound: StatsSnapshot,
    /// Inbound messages run through the chain.
    pub processed: u64,
    /// Messages discarded by the chain or lost to a full queue.
    pub dropped: u64,
    pub stage_errors: u64,
}

struct StateCell {
    state: PipelineState,
    last_error: Option<String>,
    last_stage_error: Option<String>,
}

/// State shared between the handle, the control thread and the workers.
struct Shared {
    id: String,
    cell: Mutex<StateCell>,
    active: AtomicBool,
    inbound: ConnectorStats,
    outbound: ConnectorStats,
    processed: AtomicU64,
    dropped: AtomicU64,
    stage_errors: AtomicU64,
}

impl Shared {
    fn new(id: String, state: PipelineState, last_error: Option<String>) -> Self {
        Self {
            id,
            cell: Mutex::new(StateCell {
                state,
                last_error,
                last_stage_error: None,
            }),
            active: AtomicBool::new(false),
            inbound: ConnectorStats::new(),
            outbound: ConnectorStats::new(),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            stage_errors: AtomicU64::new(0),
        }
    }

    fn cell(&self) -> std::sync::MutexGuard<'_, StateCell> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> PipelineState {
        self.cell().state
    }

    fn set_state(&self, state: PipelineState) {
        self.cell().state = state;
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Record a failure. The first error of a run wins.
    fn fail(&self, message: String) {
        let mut cell = self.cell();
        if cell.state == PipelineState::Failed && cell.last_error.is_some() {
            return;
        }
        tracing::error!("Pipeline '{}' failed: {}", self.id, message);
        cell.state = PipelineState::Failed;
        cell.last_error = Some(message);
    }

    fn status(&self) -> PipelineStatus {
        let cell = self.cell();
        PipelineStatus {
            id: self.id.clone(),
            state: cell.state,
            last_error: cell.last_error.clone(),
            last_stage_error: cell.last_stage_error.clone(),
            inbound: self.inbound.snapshot(),
            outbound: self.outbound.snapshot(),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            stage_errors: self.stage_errors.load(Ordering::Relaxed),
        }
    }
}

type Reply = Sender<PipelineResult<PipelineState>>;

enum Command {
    Start(Reply),
    Stop(Reply),
    Restart(Reply),
    Terminate(Reply),
}

// ==================== Worker loops ====================

fn notify_failure(failures: &Sender<()>) {
    // A pending notification is enough.
    let _ = failures.try_send(());
}

/// Reports a worker panic to the control thread while the thread unwinds,
/// so the run is torn down without waiting for a join.
struct PanicGuard {
    worker: &'static str,
    shared: Arc<Shared>,
    failures: Sender<()>,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.shared.fail(format!("{} thread panicked", self.worker));
            notify_failure(&self.failures);
        }
    }
}

fn receive_loop(
    mut connector: Box<dyn Connector>,
    shared: Arc<Shared>,
    raw: Arc<BoundedQueue<Message>>,
    signal: Arc<WakeSignal>,
    failures: Sender<()>,
) -> Box<dyn Connector> {
    let _guard = PanicGuard {
        worker: "receive",
        shared: shared.clone(),
        failures: failures.clone(),
    };
    while shared.is_active() {
        match connector.receive() {
            Ok(message) => {
                shared.inbound.record();
                tracing::trace!("Pipeline '{}' received {:?}", shared.id, message);
                if let Err(e) = raw.push(message) {
                    shared.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Pipeline '{}': inbound message dropped: {}", shared.id, e);
                }
                signal.notify();
            }
            Err(ConnectorError::NoData) => {}
            Err(e) => {
                if shared.is_active() {
                    shared.fail(format!("inbound {} connector: {}", connector.type_name(), e));
                    notify_failure(&failures);
                }
                break;
            }
        }
    }
    connector
}

fn dispatch(shared: &Shared, outbound: &BoundedQueue<MessageWrapper>, output: ChainOutput) {
    shared.dropped.fetch_add(output.dropped, Ordering::Relaxed);
    if let Some(error) = output.errors.last() {
        shared
            .stage_errors
            .fetch_add(output.errors.len() as u64, Ordering::Relaxed);
        shared.cell().last_stage_error = Some(error.to_string());
    }
    for wrapper in output.delivered {
        if let Err(e) = outbound.push(wrapper) {
            shared.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Pipeline '{}': outbound message dropped: {}", shared.id, e);
        }
    }
}

fn process_loop(
    mut chain: StageChain,
    shared: Arc<Shared>,
    raw: Arc<BoundedQueue<Message>>,
    events: Arc<BoundedQueue<StageEvent>>,
    outbound: Arc<BoundedQueue<MessageWrapper>>,
    signal: Arc<WakeSignal>,
    failures: Sender<()>,
) -> StageChain {
    let _guard = PanicGuard {
        worker: "process",
        shared: shared.clone(),
        failures,
    };
    loop {
        signal.wait();
        if !shared.is_active() {
            break;
        }
        for event in events.drain() {
            dispatch(&shared, &outbound, chain.handle_event(event));
        }
        while let Some(message) = raw.try_pop() {
            let output = chain.process(message);
            shared.processed.fetch_add(1, Ordering::Relaxed);
            dispatch(&shared, &outbound, output);
            if !shared.is_active() {
                break;
            }
        }
    }
    chain
}

fn send_loop(
    mut connector: Box<dyn Connector>,
    shared: Arc<Shared>,
    outbound: Arc<BoundedQueue<MessageWrapper>>,
    failures: Sender<()>,
) -> Box<dyn Connector> {
    let _guard = PanicGuard {
        worker: "send",
        shared: shared.clone(),
        failures: failures.clone(),
    };
    while let Some(wrapper) = outbound.pop() {
        match connector.send(&wrapper) {
            Ok(()) => shared.outbound.record(),
            Err(e) => {
                if shared.is_active() {
                    shared.fail(format!("outbound {} connector: {}", connector.type_name(), e));
                    notify_failure(&failures);
                }
                break;
            }
        }
    }
    connector
}

fn spawn<T, F>(name: String, f: F) -> std::io::Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new().name(name).spawn(f)
}

// ==================== Control thread ====================

/// Handles and queues of one run.
struct Workers {
    inbound_stop: StopHandle,
    raw: Arc<BoundedQueue<Message>>,
    events: Arc<BoundedQueue<StageEvent>>,
    outbound: Arc<BoundedQueue<MessageWrapper>>,
    signal: Arc<WakeSignal>,
    receive: Option<JoinHandle<Box<dyn Connector>>>,
    process: Option<JoinHandle<StageChain>>,
    send: Option<JoinHandle<Box<dyn Connector>>>,
}

struct Controller {
    shared: Arc<Shared>,
    settings: RuntimeSettings,
    chain: Option<StageChain>,
    inbound: Option<Box<dyn Connector>>,
    outbound: Option<Box<dyn Connector>>,
    workers: Option<Workers>,
    failures: Sender<()>,
}

impl Controller {
    fn run(mut self, commands: Receiver<Command>, failures: Receiver<()>) {
        loop {
            select! {
                recv(commands) -> command => match command {
                    Ok(Command::Start(reply)) => {
                        let _ = reply.send(self.start());
                    }
                    Ok(Command::Stop(reply)) => {
                        let _ = reply.send(Ok(self.stop()));
                    }
                    Ok(Command::Restart(reply)) => {
                        self.stop();
                        let _ = reply.send(self.start());
                    }
                    Ok(Command::Terminate(reply)) => {
                        self.terminate();
                        let _ = reply.send(Ok(PipelineState::Terminated));
                        return;
                    }
                    Err(_) => {
                        self.terminate();
                        return;
                    }
                },
                recv(failures) -> _ => self.reap(),
            }
        }
    }

    fn id(&self) -> &str {
        &self.shared.id
    }

    /// Record a control-side failure and return it as an error.
    fn fail_now(&self, message: String) -> PipelineError {
        self.shared.fail(message.clone());
        PipelineError::Transport(message)
    }

    fn start(&mut self) -> PipelineResult<PipelineState> {
        match self.shared.state() {
            PipelineState::Running => return Ok(PipelineState::Running),
            PipelineState::Terminated | PipelineState::Malformed => {
                return Err(PipelineError::Terminated)
            }
            _ => {}
        }
        if self.workers.is_some() {
            self.teardown();
        }
        {
            let mut cell = self.shared.cell();
            cell.last_error = None;
            cell.last_stage_error = None;
        }

        let (mut chain, mut inbound, mut outbound) =
            match (self.chain.take(), self.inbound.take(), self.outbound.take()) {
                (Some(chain), Some(inbound), Some(outbound)) => (chain, inbound, outbound),
                (chain, inbound, outbound) => {
                    self.chain = chain;
                    self.inbound = inbound;
                    self.outbound = outbound;
                    return Err(self.fail_now("a worker thread lost its resources".to_string()));
                }
            };

        if let Err(e) = inbound.connect() {
            self.chain = Some(chain);
            self.inbound = Some(inbound);
            self.outbound = Some(outbound);
            return Err(self.fail_now(format!("inbound connect failed: {e}")));
        }
        if let Err(e) = outbound.connect() {
            inbound.disconnect();
            self.chain = Some(chain);
            self.inbound = Some(inbound);
            self.outbound = Some(outbound);
            return Err(self.fail_now(format!("outbound connect failed: {e}")));
        }

        let raw = Arc::new(BoundedQueue::new(self.settings.inbound_capacity));
        let events = Arc::new(BoundedQueue::new(self.settings.event_capacity));
        let outbound_queue = Arc::new(BoundedQueue::new(self.settings.outbound_capacity));
        let signal = Arc::new(WakeSignal::new());
        chain.set_scheduler(EventScheduler::new(events.clone(), signal.clone()));
        chain.start();

        let mut workers = Workers {
            inbound_stop: inbound.stopper(),
            raw: raw.clone(),
            events: events.clone(),
            outbound: outbound_queue.clone(),
            signal: signal.clone(),
            receive: None,
            process: None,
            send: None,
        };

        self.shared.active.store(true, Ordering::SeqCst);
        self.shared.set_state(PipelineState::Running);

        let id = self.id().to_string();
        let spawned = (|| -> std::io::Result<()> {
            workers.process = Some(spawn(format!("{id}-process"), {
                let (shared, raw, events, out, signal, failures) = (
                    self.shared.clone(),
                    raw.clone(),
                    events.clone(),
                    outbound_queue.clone(),
                    signal.clone(),
                    self.failures.clone(),
                );
                move || process_loop(chain, shared, raw, events, out, signal, failures)
            })?);
            workers.send = Some(spawn(format!("{id}-send"), {
                let (shared, out, failures) =
                    (self.shared.clone(), outbound_queue.clone(), self.failures.clone());
                move || send_loop(outbound, shared, out, failures)
            })?);
            workers.receive = Some(spawn(format!("{id}-receive"), {
                let (shared, raw, signal, failures) = (
                    self.shared.clone(),
                    raw.clone(),
                    signal.clone(),
                    self.failures.clone(),
                );
                move || receive_loop(inbound, shared, raw, signal, failures)
            })?);
            Ok(())
        })();

        self.workers = Some(workers);
        if let Err(e) = spawned {
            let err = self.fail_now(format!("failed to spawn worker thread: {e}"));
            self.teardown();
            return Err(err);
        }

        tracing::info!("Pipeline '{}' started", self.id());
        Ok(PipelineState::Running)
    }

    /// Run the shutdown sequence and collect the resources back.
    ///
    /// Leaves the state `Failed` if it was; otherwise ends `Stopped`.
    fn teardown(&mut self) {
        let Some(mut workers) = self.workers.take() else {
            return;
        };

        self.shared.active.store(false, Ordering::SeqCst);
        let failed = self.shared.state() == PipelineState::Failed;
        if !failed {
            self.shared.set_state(PipelineState::Stopping);
        }

        workers.inbound_stop.stop();
        workers.outbound.shutdown();
        if let Some(handle) = workers.receive.take() {
            self.inbound = self.join("receive", handle);
        }
        workers.signal.notify();
        if let Some(handle) = workers.process.take() {
            self.chain = self.join("process", handle);
        }
        if let Some(handle) = workers.send.take() {
            self.outbound = self.join("send", handle);
        }

        if let Some(inbound) = self.inbound.as_mut() {
            inbound.disconnect();
        }
        if let Some(outbound) = self.outbound.as_mut() {
            outbound.disconnect();
        }
        if let Some(chain) = self.chain.as_mut() {
            chain.stop();
        }

        workers.events.shutdown();
        workers.raw.shutdown();
        let leftover = workers.raw.drain().len() + workers.outbound.drain().len();
        if leftover > 0 {
            self.shared
                .dropped
                .fetch_add(leftover as u64, Ordering::Relaxed);
            tracing::debug!(
                "Pipeline '{}': dropped {} in-flight message(s) on shutdown",
                self.id(),
                leftover
            );
        }

        if self.shared.state() != PipelineState::Failed {
            self.shared.set_state(PipelineState::Stopped);
        }
    }

    fn join<T>(&self, worker: &str, handle: JoinHandle<T>) -> Option<T> {
        match handle.join() {
            Ok(value) => Some(value),
            Err(_) => {
                self.shared.fail(format!("{worker} thread panicked"));
                None
            }
        }
    }

    fn stop(&mut self) -> PipelineState {
        match self.shared.state() {
            PipelineState::Running | PipelineState::Failed => {
                self.teardown();
                if self.shared.state() == PipelineState::Failed {
                    self.shared.set_state(PipelineState::Stopped);
                }
                tracing::info!("Pipeline '{}' stopped", self.id());
            }
            _ => {}
        }
        self.shared.state()
    }

    /// Tear down after a worker reported a failure.
    fn reap(&mut self) {
        if self.workers.is_some() && self.shared.state() == PipelineState::Failed {
            tracing::debug!("Pipeline '{}': shutting down failed run", self.id());
            self.teardown();
        }
    }

    fn terminate(&mut self) {
        self.teardown();
        self.shared.set_state(PipelineState::Terminated);
        self.chain = None;
        self.inbound = None;
        self.outbound = None;
        tracing::info!("Pipeline '{}' terminated", self.id());
    }
}

// ==================== Handle ====================

/// Owning handle of one pipeline.
pub struct PipelineRuntime {
    shared: Arc<Shared>,
    commands: Option<Sender<Command>>,
    control: Option<JoinHandle<()>>,
    config: Option<PipelineConfig>,
}

impl PipelineRuntime {
    /// Build a runtime from ready-made parts. The pipeline starts `Stopped`.
    pub fn new(
        id: impl Into<String>,
        chain: StageChain,
        inbound: Box<dyn Connector>,
        outbound: Box<dyn Connector>,
        settings: RuntimeSettings,
    ) -> PipelineResult<Self> {
        let shared = Arc::new(Shared::new(id.into(), PipelineState::Stopped, None));
        let (command_tx, command_rx) = bounded(settings.control_capacity.max(1));
        let (failure_tx, failure_rx) = bounded(1);
        let controller = Controller {
            shared: shared.clone(),
            settings,
            chain: Some(chain),
            inbound: Some(inbound),
            outbound: Some(outbound),
            workers: None,
            failures: failure_tx,
        };
        let control = spawn(format!("{}-control", shared.id), move || {
            controller.run(command_rx, failure_rx)
        })?;
        Ok(Self {
            shared,
            commands: Some(command_tx),
            control: Some(control),
            config: None,
        })
    }

    /// Build a runtime from configuration.
    ///
    /// Never fails: a configuration error yields a `Malformed` runtime that
    /// keeps the error as `last_error`.
    pub fn from_config(id: impl Into<String>, config: &PipelineConfig, ctx: &AppContext) -> Self {
        let id = id.into();
        let runtime = Self::build(&id, config, ctx).unwrap_or_else(|e| {
            tracing::warn!("Pipeline '{}' is malformed: {}", id, e);
            Self::malformed(id.clone(), e.to_string())
        });
        runtime.with_config(config.clone())
    }

    fn build(id: &str, config: &PipelineConfig, ctx: &AppContext) -> PipelineResult<Self> {
        let chain = Self::build_chain(id, config, ctx)?;
        let factory = ConnectorFactory::new();
        let inbound = factory.create(&config.connector_in, Direction::Inbound, ctx)?;
        let outbound = factory.create(&config.connector_out, Direction::Outbound, ctx)?;
        Self::new(id, chain, inbound, outbound, ctx.settings.clone())
    }

    fn build_chain(id: &str, config: &PipelineConfig, ctx: &AppContext) -> PipelineResult<StageChain> {
        Ok(StageChain::build(id, &config.stages, ctx.fanout.clone())?
            .with_max_hops(ctx.settings.max_hops))
    }

    /// Check a configuration without starting anything.
    pub fn validate(config: &PipelineConfig, ctx: &AppContext) -> PipelineResult<()> {
        Self::build_chain("validate", config, ctx)?;
        let factory = ConnectorFactory::new();
        factory.create(&config.connector_in, Direction::Inbound, ctx)?;
        factory.create(&config.connector_out, Direction::Outbound, ctx)?;
        Ok(())
    }

    /// A runtime that never runs.
    pub fn malformed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared::new(
                id.into(),
                PipelineState::Malformed,
                Some(error.into()),
            )),
            commands: None,
            control: None,
            config: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Configuration the runtime was built from, if any.
    pub fn config(&self) -> Option<&PipelineConfig> {
        self.config.as_ref()
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.cell().last_error.clone()
    }

    pub fn last_stage_error(&self) -> Option<String> {
        self.shared.cell().last_stage_error.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        self.shared.status()
    }

    fn request(&self, make: fn(Reply) -> Command) -> PipelineResult<PipelineState> {
        let Some(commands) = &self.commands else {
            return match self.shared.state() {
                PipelineState::Malformed => Err(PipelineError::Malformed(
                    self.last_error().unwrap_or_default(),
                )),
                _ => Err(PipelineError::Terminated),
            };
        };
        let (reply_tx, reply_rx) = bounded(1);
        commands
            .send(make(reply_tx))
            .map_err(|_| PipelineError::Terminated)?;
        reply_rx.recv().map_err(|_| PipelineError::Terminated)?
    }

    pub fn start(&self) -> PipelineResult<PipelineState> {
        self.request(Command::Start)
    }

    /// Stop the pipeline. Stopping a malformed pipeline is a no-op.
    pub fn stop(&self) -> PipelineResult<PipelineState> {
        if self.commands.is_none() && self.state() == PipelineState::Malformed {
            return Ok(PipelineState::Malformed);
        }
        self.request(Command::Stop)
    }

    pub fn restart(&self) -> PipelineResult<PipelineState> {
        self.request(Command::Restart)
    }

    /// Release every resource. Idempotent.
    pub fn terminate(&mut self) -> PipelineState {
        if let Some(commands) = self.commands.take() {
            let (reply_tx, reply_rx) = bounded(1);
            if commands.send(Command::Terminate(reply_tx)).is_ok() {
                let _ = reply_rx.recv();
            }
        }
        if let Some(control) = self.control.take() {
            if control.join().is_err() {
                tracing::error!("Pipeline '{}': control thread panicked", self.id());
            }
        }
        self.shared.set_state(PipelineState::Terminated);
        PipelineState::Terminated
    }
}

impl Drop for PipelineRuntime {
    fn drop(&mut self) {
        if self.commands.is_some() {
            self.terminate();
        }
    }
}

impl std::fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectorConfig, StageConfig};
    use crate::connector::{ChannelConnector, MockConnector, NoopStopper};
    use crate::pipeline::fanout::FanoutRegistry;
    use std::time::Duration;

    fn settings() -> RuntimeSettings {
        RuntimeSettings::default()
    }

    fn chain(stages: &[StageConfig]) -> StageChain {
        StageChain::build("test", stages, Arc::new(FanoutRegistry::new())).unwrap()
    }

    fn wait_for(runtime: &PipelineRuntime, state: PipelineState) -> bool {
        for _ in 0..200 {
            if runtime.state() == state {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_start_process_stop() {
        let pair = ChannelConnector::pair(16);
        let runtime = PipelineRuntime::new(
            "p",
            chain(&[StageConfig::new("limiter").param("size", 3)]),
            Box::new(pair.inbound),
            Box::new(pair.outbound),
            settings(),
        )
        .unwrap();
        assert_eq!(runtime.state(), PipelineState::Stopped);
        assert_eq!(runtime.start().unwrap(), PipelineState::Running);

        pair.input.send(Message::raw("t", b"ok".to_vec())).unwrap();
        pair.input.send(Message::raw("t", b"too long".to_vec())).unwrap();
        pair.input.send(Message::raw("t", b"yes".to_vec())).unwrap();

        let first = pair.output.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = pair.output.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.working.as_bytes().unwrap(), b"ok");
        assert_eq!(second.working.as_bytes().unwrap(), b"yes");

        assert_eq!(runtime.stop().unwrap(), PipelineState::Stopped);
        let status = runtime.status();
        assert_eq!(status.inbound.count, 3);
        assert_eq!(status.outbound.count, 2);
        assert_eq!(status.processed, 3);
        assert_eq!(status.dropped, 1);
    }

    #[test]
    fn test_restart_reuses_connectors() {
        let pair = ChannelConnector::pair(16);
        let runtime = PipelineRuntime::new(
            "p",
            chain(&[]),
            Box::new(pair.inbound),
            Box::new(pair.outbound),
            settings(),
        )
        .unwrap();
        runtime.start().unwrap();
        assert_eq!(runtime.restart().unwrap(), PipelineState::Running);

        pair.input.send(Message::raw("t", b"after".to_vec())).unwrap();
        let out = pair.output.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(out.working.as_bytes().unwrap(), b"after");
        assert_eq!(runtime.start().unwrap(), PipelineState::Running);
    }

    #[test]
    fn test_inbound_failure_sets_failed() {
        let mut inbound = MockConnector::new();
        inbound.expect_type_name().return_const("mock");
        inbound.expect_connect().returning(|| Ok(()));
        inbound.expect_disconnect().return_const(());
        inbound
            .expect_stopper()
            .returning(|| Arc::new(NoopStopper) as StopHandle);
        inbound
            .expect_receive()
            .returning(|| Err(ConnectorError::Transport("socket reset".to_string())));

        let (outbound, _rx) = ChannelConnector::outbound(4);
        let runtime =
            PipelineRuntime::new("p", chain(&[]), Box::new(inbound), Box::new(outbound), settings())
                .unwrap();
        runtime.start().unwrap();
        assert!(wait_for(&runtime, PipelineState::Failed));
        assert!(runtime.last_error().unwrap().contains("socket reset"));

        assert_eq!(runtime.stop().unwrap(), PipelineState::Stopped);
        assert!(runtime.last_error().is_some());
    }

    #[test]
    fn test_stage_panic_fails_pipeline_promptly() {
        struct Exploding;
        impl crate::pipeline::stage::Stage for Exploding {
            fn type_name(&self) -> &'static str {
                "exploding"
            }
            fn process(
                &mut self,
                _wrapper: &mut MessageWrapper,
                _ctx: &mut crate::pipeline::stage::StageContext,
            ) -> PipelineResult<crate::pipeline::stage::StageOutcome> {
                panic!("stage bug")
            }
        }

        let stages = vec![crate::pipeline::stage::ConfiguredStage::new(
            Default::default(),
            Box::new(Exploding),
        )];
        let chain = StageChain::new("boom", stages, Arc::new(FanoutRegistry::new())).unwrap();
        let pair = ChannelConnector::pair(16);
        let runtime = PipelineRuntime::new(
            "boom",
            chain,
            Box::new(pair.inbound),
            Box::new(pair.outbound),
            settings(),
        )
        .unwrap();
        runtime.start().unwrap();
        pair.input.send(Message::raw("t", b"x".to_vec())).unwrap();

        // Reported without any control request joining the thread.
        assert!(wait_for(&runtime, PipelineState::Failed));
        assert!(runtime
            .last_error()
            .unwrap()
            .contains("process thread panicked"));
        assert_eq!(runtime.stop().unwrap(), PipelineState::Stopped);
    }

    #[test]
    fn test_connect_failure_sets_failed() {
        let mut inbound = MockConnector::new();
        inbound
            .expect_connect()
            .returning(|| Err(ConnectorError::Transport("refused".to_string())));
        let (outbound, _rx) = ChannelConnector::outbound(4);
        let runtime =
            PipelineRuntime::new("p", chain(&[]), Box::new(inbound), Box::new(outbound), settings())
                .unwrap();
        assert!(runtime.start().is_err());
        assert_eq!(runtime.state(), PipelineState::Failed);
        assert!(runtime.last_error().unwrap().contains("refused"));
    }

    #[test]
    fn test_malformed_runtime() {
        let ctx = AppContext::default();
        let config = PipelineConfig::new(ConnectorConfig::new("null"), ConnectorConfig::new("null"))
            .with_stage(StageConfig::new("teleport"));
        let mut runtime = PipelineRuntime::from_config("bad", &config, &ctx);
        assert_eq!(runtime.state(), PipelineState::Malformed);
        assert!(runtime.last_error().unwrap().contains("teleport"));
        assert!(matches!(runtime.start(), Err(PipelineError::Malformed(_))));
        assert_eq!(runtime.stop().unwrap(), PipelineState::Malformed);
        assert_eq!(runtime.terminate(), PipelineState::Terminated);
    }

    #[test]
    fn test_terminate_is_final() {
        let ctx = AppContext::default();
        let config = PipelineConfig::new(ConnectorConfig::new("null"), ConnectorConfig::new("null"));
        let mut runtime = PipelineRuntime::from_config("p", &config, &ctx);
        runtime.start().unwrap();
        assert_eq!(runtime.terminate(), PipelineState::Terminated);
        assert!(matches!(runtime.start(), Err(PipelineError::Terminated)));
        assert_eq!(runtime.terminate(), PipelineState::Terminated);
    }

    #[test]
    fn test_status_serializes() {
        let runtime = PipelineRuntime::malformed("x", "boom");
        let json = serde_json::to_value(runtime.status()).unwrap();
        assert_eq!(json["state"], "malformed");
        assert_eq!(json["last_error"], "boom");
        assert_eq!(json["inbound"]["count"], 0);
    }
}
