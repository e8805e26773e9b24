//! Integration tests for fan-out queues connecting pipelines

mod common;

use common::builders::{queue, redirecting, PipelineBuilder};
use common::mock_helpers::channel_pipeline_with;
use common::{recv_output, test_timeout};
use msgbridge_rs::config::{RuntimeSettings, StageConfig};
use msgbridge_rs::context::AppContext;
use msgbridge_rs::pipeline::{Message, MessageWrapper, PipelineRegistry, PipelineState};
use serde_json::json;
use std::sync::Arc;

#[test]
fn test_shared_queue_between_pipelines() {
    let ctx = AppContext::shared(RuntimeSettings::default());
    let mut registry = PipelineRegistry::new(ctx.clone());

    let producer = PipelineBuilder::new()
        .input(queue("a_in"))
        .stage(redirecting(StageConfig::new("noop"), &["shared"]))
        .build();
    let consumer = PipelineBuilder::new()
        .input(queue("shared"))
        .output(queue("b_out"))
        .build();
    registry.add("A", producer).unwrap();
    registry.add("B", consumer).unwrap();

    let observer = ctx
        .fanout
        .subscribe(&ctx.fanout.get_or_create("b_out"), 16)
        .unwrap();
    assert!(registry.start_all().is_empty());

    let input = Message::document("sensors", json!({"temp": 21.5}));
    ctx.fanout.redirect(&MessageWrapper::new(input), "a_in");

    let received = observer
        .buffer
        .pop_timeout(test_timeout())
        .expect("B forwarded nothing");
    assert_eq!(
        received.working.as_document().unwrap(),
        &json!({"temp": 21.5})
    );
    assert_eq!(registry.status("B").unwrap().inbound.count, 1);

    registry.terminate_all();
    assert!(registry
        .statuses()
        .iter()
        .all(|s| s.state == PipelineState::Terminated));
}

#[test]
fn test_redirect_fires_even_when_rejected() {
    let ctx = AppContext::shared(RuntimeSettings::default());
    let tap = ctx
        .fanout
        .subscribe(&ctx.fanout.get_or_create("audit"), 16)
        .unwrap();

    let pipeline = channel_pipeline_with(
        "gate",
        &[redirecting(
            StageConfig::new("limiter").param("size", 2),
            &["audit"],
        )],
        ctx.fanout.clone(),
    );
    pipeline.runtime.start().unwrap();
    pipeline.input.send(Message::raw("t", b"too big".to_vec())).unwrap();
    pipeline.input.send(Message::raw("t", b"ok".to_vec())).unwrap();

    assert_eq!(recv_output(&pipeline.output).working.as_bytes().unwrap(), b"ok");
    let audited: Vec<_> = (0..2)
        .map(|_| tap.buffer.pop_timeout(test_timeout()).unwrap())
        .collect();
    assert_eq!(audited[0].working.as_bytes().unwrap(), b"too big");
    assert_eq!(audited[1].working.as_bytes().unwrap(), b"ok");
    assert!(audited.iter().all(|w| w.redirects.contains("audit")));
}

#[test]
fn test_full_subscriber_does_not_block_others() {
    let ctx = AppContext::shared(RuntimeSettings::default());
    let handle = ctx.fanout.get_or_create("events");
    let slow = ctx.fanout.subscribe(&handle, 1).unwrap();
    let fast_a = ctx.fanout.subscribe(&handle, 8).unwrap();
    let fast_b = ctx.fanout.subscribe(&handle, 8).unwrap();

    let wrapper = MessageWrapper::new(Message::raw("t", b"1".to_vec()));
    ctx.fanout.publish(&handle, &wrapper);
    let report = ctx.fanout.publish(&handle, &wrapper);

    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(slow.buffer.len(), 1);
    assert_eq!(fast_a.buffer.len(), 2);
    assert_eq!(fast_b.buffer.len(), 2);
}

#[test]
fn test_late_subscriber_sees_only_new_messages() {
    let ctx = Arc::new(AppContext::default());
    let handle = ctx.fanout.get_or_create("late");
    ctx.fanout
        .publish(&handle, &MessageWrapper::new(Message::raw("t", b"old".to_vec())));

    let sub = ctx.fanout.subscribe(&handle, 4).unwrap();
    assert!(sub.buffer.is_empty());
    ctx.fanout
        .publish(&handle, &MessageWrapper::new(Message::raw("t", b"new".to_vec())));
    assert_eq!(sub.buffer.try_pop().unwrap().working.as_bytes().unwrap(), b"new");
}
