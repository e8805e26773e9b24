//! In-process connector backed by crossbeam channels.
//!
//! Used when the host program feeds and drains a pipeline directly.

use super::{Connector, ConnectorError, NoopStopper, StopHandle, Stopper};
use crate::pipeline::message::{Message, MessageWrapper};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

/// Stop handle that closes the per-session stop channel.
struct ChannelStopper(Mutex<Option<Sender<()>>>);

impl Stopper for ChannelStopper {
    fn stop(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

enum Side {
    In(Receiver<Message>),
    Out(Sender<MessageWrapper>),
}

pub struct ChannelConnector {
    side: Side,
    stop_rx: Option<Receiver<()>>,
    stopper: Option<Arc<ChannelStopper>>,
}

/// Both connectors of a pipeline plus the host's ends of the channels.
pub struct ChannelPair {
    pub inbound: ChannelConnector,
    pub outbound: ChannelConnector,
    pub input: Sender<Message>,
    pub output: Receiver<MessageWrapper>,
}

fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    if capacity == 0 {
        unbounded()
    } else {
        bounded(capacity)
    }
}

impl ChannelConnector {
    fn with_side(side: Side) -> Self {
        Self {
            side,
            stop_rx: None,
            stopper: None,
        }
    }

    /// Inbound connector plus the sender that feeds it. `0` means unbounded.
    pub fn inbound(capacity: usize) -> (Self, Sender<Message>) {
        let (tx, rx) = channel(capacity);
        (Self::with_side(Side::In(rx)), tx)
    }

    /// Outbound connector plus the receiver that drains it.
    pub fn outbound(capacity: usize) -> (Self, Receiver<MessageWrapper>) {
        let (tx, rx) = channel(capacity);
        (Self::with_side(Side::Out(tx)), rx)
    }

    pub fn pair(capacity: usize) -> ChannelPair {
        let (inbound, input) = Self::inbound(capacity);
        let (outbound, output) = Self::outbound(capacity);
        ChannelPair {
            inbound,
            outbound,
            input,
            output,
        }
    }
}

impl Connector for ChannelConnector {
    fn type_name(&self) -> &'static str {
        "channel"
    }

    fn connect(&mut self) -> Result<(), ConnectorError> {
        let (tx, rx) = bounded(1);
        self.stop_rx = Some(rx);
        self.stopper = Some(Arc::new(ChannelStopper(Mutex::new(Some(tx)))));
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stop_rx = None;
        self.stopper = None;
    }

    fn stopper(&self) -> StopHandle {
        match &self.stopper {
            Some(stopper) => stopper.clone(),
            None => Arc::new(NoopStopper),
        }
    }

    fn receive(&mut self) -> Result<Message, ConnectorError> {
        let Side::In(input) = &self.side else {
            return Err(ConnectorError::Transport(
                "outbound channel cannot receive".to_string(),
            ));
        };
        let stop = self
            .stop_rx
            .as_ref()
            .ok_or_else(|| ConnectorError::Transport("channel not connected".to_string()))?;
        select! {
            recv(input) -> msg => msg.map_err(|_| {
                ConnectorError::Transport("input channel closed".to_string())
            }),
            recv(stop) -> _ => Err(ConnectorError::Stopped),
        }
    }

    fn send(&mut self, wrapper: &MessageWrapper) -> Result<(), ConnectorError> {
        match &self.side {
            Side::Out(output) => output
                .send(wrapper.clone())
                .map_err(|_| ConnectorError::Transport("output channel closed".to_string())),
            Side::In(_) => Err(ConnectorError::Transport(
                "inbound channel cannot send".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for ChannelConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = match self.side {
            Side::In(_) => "in",
            Side::Out(_) => "out",
        };
        f.debug_struct("ChannelConnector")
            .field("side", &side)
            .field("connected", &self.stop_rx.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_pair_round_trip() {
        let mut pair = ChannelConnector::pair(4);
        pair.inbound.connect().unwrap();
        pair.outbound.connect().unwrap();

        pair.input.send(Message::raw("t", b"a".to_vec())).unwrap();
        let msg = pair.inbound.receive().unwrap();
        pair.outbound.send(&MessageWrapper::new(msg)).unwrap();
        let out = pair.output.recv().unwrap();
        assert_eq!(out.working.as_bytes().unwrap(), b"a");
    }

    #[test]
    fn test_stop_unblocks_and_reconnect_resets() {
        let (mut conn, input) = ChannelConnector::inbound(4);
        conn.connect().unwrap();
        let stopper = conn.stopper();
        let reader = thread::spawn(move || {
            let result = conn.receive();
            (conn, result)
        });
        thread::sleep(Duration::from_millis(20));
        stopper.stop();
        let (mut conn, result) = reader.join().unwrap();
        assert!(matches!(result, Err(ConnectorError::Stopped)));

        conn.connect().unwrap();
        input.send(Message::raw("t", b"b".to_vec())).unwrap();
        assert_eq!(conn.receive().unwrap().as_bytes().unwrap(), b"b");
    }

    #[test]
    fn test_closed_input_is_transport_error() {
        let (mut conn, input) = ChannelConnector::inbound(1);
        conn.connect().unwrap();
        drop(input);
        assert!(matches!(conn.receive(), Err(ConnectorError::Transport(_))));
    }
}
