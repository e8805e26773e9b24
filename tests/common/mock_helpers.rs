//! Mock construction helpers

use crossbeam_channel::{Receiver, Sender};
use mockall::mock;
use msgbridge_rs::config::{RuntimeSettings, StageConfig};
use msgbridge_rs::connector::{
    ChannelConnector, Connector, ConnectorError, NoopStopper, StopHandle, StopLatch,
};
use msgbridge_rs::pipeline::{
    FanoutRegistry, Message, MessageWrapper, PipelineRuntime, StageChain,
};
use std::sync::Arc;

mock! {
    pub Transport {}

    impl Connector for Transport {
        fn type_name(&self) -> &'static str;
        fn connect(&mut self) -> Result<(), ConnectorError>;
        fn disconnect(&mut self);
        fn stopper(&self) -> StopHandle;
        fn receive(&mut self) -> Result<Message, ConnectorError>;
        fn send(&mut self, wrapper: &MessageWrapper) -> Result<(), ConnectorError>;
    }
}

/// A transport whose `receive` blocks until its stopper fires.
pub fn blocking_transport() -> MockTransport {
    let latch = StopLatch::new();
    let mut mock = MockTransport::new();
    mock.expect_type_name().return_const("blocking");
    let resetter = latch.clone();
    mock.expect_connect().returning(move || {
        resetter.reset();
        Ok(())
    });
    mock.expect_disconnect().return_const(());
    let waiter = latch.clone();
    mock.expect_receive().returning(move || {
        waiter.wait();
        Err(ConnectorError::Stopped)
    });
    mock.expect_stopper()
        .returning(move || latch.clone() as StopHandle);
    mock
}

/// A transport whose every `send` fails.
pub fn failing_sender(reason: &'static str) -> MockTransport {
    let mut mock = MockTransport::new();
    mock.expect_type_name().return_const("failing");
    mock.expect_connect().returning(|| Ok(()));
    mock.expect_disconnect().return_const(());
    mock.expect_stopper()
        .returning(|| Arc::new(NoopStopper) as StopHandle);
    mock.expect_send()
        .returning(move |_| Err(ConnectorError::Transport(reason.to_string())));
    mock
}

/// Runtime wired to in-memory channels.
pub struct ChannelPipeline {
    pub runtime: PipelineRuntime,
    pub input: Sender<Message>,
    pub output: Receiver<MessageWrapper>,
}

pub fn channel_pipeline(id: &str, stages: &[StageConfig]) -> ChannelPipeline {
    channel_pipeline_with(id, stages, Arc::new(FanoutRegistry::new()))
}

pub fn channel_pipeline_with(
    id: &str,
    stages: &[StageConfig],
    fanout: Arc<FanoutRegistry>,
) -> ChannelPipeline {
    let pair = ChannelConnector::pair(64);
    let chain = StageChain::build(id, stages, fanout).expect("valid stages");
    let runtime = PipelineRuntime::new(
        id,
        chain,
        Box::new(pair.inbound) as Box<dyn Connector>,
        Box::new(pair.outbound),
        RuntimeSettings::default(),
    )
    .expect("runtime spawns");
    ChannelPipeline {
        runtime,
        input: pair.input,
        output: pair.output,
    }
}
