//! Integration tests for the pipeline runtime lifecycle
//!
//! These tests validate:
//! - Start / stop / restart with real worker threads
//! - Shutdown while the inbound connector is blocked
//! - Connector failures moving a pipeline to `Failed`
//! - End-to-end chain scenarios through the runtime

mod common;

use common::builders::cooler_stages;
use common::mock_helpers::{blocking_transport, channel_pipeline, failing_sender};
use common::{assert_no_output, recv_output, test_timeout, wait_for_state};
use msgbridge_rs::config::{RuntimeSettings, StageConfig};
use msgbridge_rs::connector::{ChannelConnector, Connector};
use msgbridge_rs::pipeline::{
    FanoutRegistry, Message, PipelineError, PipelineRuntime, PipelineState, StageChain,
};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_stop_with_blocked_receive() {
    let (outbound, _rx) = ChannelConnector::outbound(4);
    let chain = StageChain::build("blocked", &[], Arc::new(FanoutRegistry::new())).unwrap();
    let runtime = PipelineRuntime::new(
        "blocked",
        chain,
        Box::new(blocking_transport()) as Box<dyn Connector>,
        Box::new(outbound),
        RuntimeSettings::default(),
    )
    .unwrap();
    runtime.start().unwrap();
    thread::sleep(Duration::from_millis(50));

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let stopper = thread::spawn(move || {
        let state = runtime.stop();
        let _ = done_tx.send(state);
        runtime
    });
    let state = done_rx
        .recv_timeout(test_timeout())
        .expect("stop did not complete");
    assert_eq!(state.unwrap(), PipelineState::Stopped);
    let runtime = stopper.join().unwrap();

    // The same connector instance serves the next run.
    assert_eq!(runtime.start().unwrap(), PipelineState::Running);
    assert_eq!(runtime.stop().unwrap(), PipelineState::Stopped);
}

#[test]
fn test_send_failure_marks_failed_until_restart() {
    let (inbound, input) = ChannelConnector::inbound(4);
    let chain = StageChain::build("flaky", &[], Arc::new(FanoutRegistry::new())).unwrap();
    let runtime = PipelineRuntime::new(
        "flaky",
        chain,
        Box::new(inbound),
        Box::new(failing_sender("broker gone")),
        RuntimeSettings::default(),
    )
    .unwrap();
    runtime.start().unwrap();
    input.send(Message::raw("t", b"x".to_vec())).unwrap();

    assert!(wait_for_state(&runtime, PipelineState::Failed));
    let status = runtime.status();
    assert!(status.last_error.unwrap().contains("broker gone"));
    assert_eq!(status.inbound.count, 1);
    assert_eq!(status.outbound.count, 0);

    // No automatic retry; a restart clears the error.
    assert_eq!(runtime.restart().unwrap(), PipelineState::Running);
    assert!(runtime.last_error().is_none());
}

#[test]
fn test_cooler_scenario() {
    let pipeline = channel_pipeline("cooler", &cooler_stages());
    pipeline.runtime.start().unwrap();

    pipeline
        .input
        .send(Message::document("sensors", json!({"temp": 35})))
        .unwrap();
    let hot = recv_output(&pipeline.output);
    assert_eq!(hot.working.as_document().unwrap(), &json!({"cooling": true}));

    pipeline
        .input
        .send(Message::document("sensors", json!({"temp": 20})))
        .unwrap();
    let cold = recv_output(&pipeline.output);
    assert_eq!(cold.working.as_document().unwrap(), &json!({"cooling": false}));
}

#[test]
fn test_splitter_pieces_reach_outbound_in_order() {
    let pipeline = channel_pipeline(
        "split",
        &[StageConfig::new("splitter").param("chunk_size", 5)],
    );
    pipeline.runtime.start().unwrap();
    pipeline
        .input
        .send(Message::raw("t", b"ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_vec()))
        .unwrap();

    let pieces: Vec<_> = (0..6).map(|_| recv_output(&pipeline.output)).collect();
    let sizes: Vec<usize> = pieces
        .iter()
        .map(|w| w.working.payload_len().unwrap())
        .collect();
    assert_eq!(sizes, vec![5, 5, 5, 5, 5, 1]);

    let id = &pieces[0].working.chunk().unwrap().message_id;
    for (i, piece) in pieces.iter().enumerate() {
        let tag = piece.working.chunk().unwrap();
        assert_eq!(&tag.message_id, id);
        assert_eq!(tag.sequence as usize, i);
    }
    assert_no_output(&pipeline.output);
}

#[test]
fn test_limiter_drop_is_counted() {
    let pipeline = channel_pipeline("limit", &[StageConfig::new("limiter").param("size", 10)]);
    pipeline.runtime.start().unwrap();
    pipeline.input.send(Message::raw("t", vec![b'a'; 11])).unwrap();
    pipeline.input.send(Message::raw("t", vec![b'b'; 10])).unwrap();

    let out = recv_output(&pipeline.output);
    assert_eq!(out.working.payload_len().unwrap(), 10);
    assert_no_output(&pipeline.output);
    assert_eq!(pipeline.runtime.status().dropped, 1);
}

#[test]
fn test_stage_error_does_not_change_state() {
    let pipeline = channel_pipeline(
        "errors",
        &[StageConfig::new("comparator")
            .param("key", "v")
            .param("value", 1)],
    );
    pipeline.runtime.start().unwrap();
    pipeline.input.send(Message::raw("t", b"not json".to_vec())).unwrap();
    pipeline
        .input
        .send(Message::document("t", json!({"v": 1})))
        .unwrap();

    recv_output(&pipeline.output);
    let status = pipeline.runtime.status();
    assert_eq!(status.state, PipelineState::Running);
    assert_eq!(status.stage_errors, 1);
    assert!(status.last_error.is_none());
    let stage_error = status.last_stage_error.expect("stage error recorded");
    assert!(stage_error.contains("comparator"), "{stage_error}");

    // A new run starts with a clean slot.
    pipeline.runtime.restart().unwrap();
    assert!(pipeline.runtime.last_stage_error().is_none());
}

#[test]
fn test_throttle_delay_releases_through_runtime() {
    let pipeline = channel_pipeline(
        "throttle",
        &[StageConfig::new("throttle")
            .param("rate", 1)
            .param("period_ms", 50)
            .param("mode", "delay")],
    );
    pipeline.runtime.start().unwrap();
    pipeline.input.send(Message::raw("t", b"first".to_vec())).unwrap();
    pipeline.input.send(Message::raw("t", b"held".to_vec())).unwrap();

    assert_eq!(recv_output(&pipeline.output).working.as_bytes().unwrap(), b"first");
    assert_eq!(recv_output(&pipeline.output).working.as_bytes().unwrap(), b"held");
}

#[test]
fn test_terminated_runtime_rejects_requests() {
    let mut pipeline = channel_pipeline("gone", &[]);
    pipeline.runtime.start().unwrap();
    assert_eq!(pipeline.runtime.terminate(), PipelineState::Terminated);
    assert!(matches!(
        pipeline.runtime.restart(),
        Err(PipelineError::Terminated)
    ));
}
