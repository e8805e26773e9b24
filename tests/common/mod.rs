//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use msgbridge_rs::pipeline::{MessageWrapper, PipelineRuntime, PipelineState};
use crossbeam_channel::Receiver;
use std::thread;
use std::time::Duration;

/// Upper bound for anything a test waits on
pub fn test_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Receive one output message or fail the test
pub fn recv_output(rx: &Receiver<MessageWrapper>) -> MessageWrapper {
    rx.recv_timeout(test_timeout())
        .expect("pipeline produced no output in time")
}

/// Assert that nothing arrives for a short while
pub fn assert_no_output(rx: &Receiver<MessageWrapper>) {
    assert!(
        rx.recv_timeout(Duration::from_millis(100)).is_err(),
        "unexpected pipeline output"
    );
}

/// Poll until the runtime reaches `state`
pub fn wait_for_state(runtime: &PipelineRuntime, state: PipelineState) -> bool {
    let deadline = std::time::Instant::now() + test_timeout();
    while std::time::Instant::now() < deadline {
        if runtime.state() == state {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
