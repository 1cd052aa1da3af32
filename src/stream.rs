use crate::{flow::Credit, fragment::Reassembler, payload::Payload, types::*};
use futures::channel::mpsc;
use log::trace;
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

/// The interaction patterns a stream record can carry. Fire-and-forget
/// terminates on dispatch; it only occupies the registry while a fragmented
/// request is being reassembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub(crate) enum Interaction {
    #[display(fmt = "request_response")]
    RequestResponse,
    #[display(fmt = "request_stream")]
    RequestStream,
    #[display(fmt = "request_channel")]
    RequestChannel,
    #[display(fmt = "fire_and_forget")]
    FireAndForget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Requester,
    Responder,
}

/// Per-direction liveness, local = the payload direction we send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Where inbound payloads for this stream go.
pub(crate) enum Sink {
    /// request/response wants exactly one payload.
    Response(oneshot::Sender<Result<Payload, Error>>),
    /// stream/channel deliveries, closed by dropping the sender.
    Payloads(mpsc::UnboundedSender<Result<Payload, Error>>),
}

/// A task emitting this stream's outbound payloads, gated by request-N
/// permits. The request/response responder task carries no permits.
pub(crate) struct Pump {
    pub permits: Option<Arc<Semaphore>>,
    pub task: JoinHandle<()>,
}

impl Pump {
    pub fn abort(&self) {
        self.task.abort();
    }
}

pub(crate) struct Stream {
    pub id: StreamId,
    pub role: Role,
    pub interaction: Interaction,
    state: StreamState,
    /// Credit we granted to the peer; decremented per inbound PAYLOAD(NEXT).
    pub credit_granted: Credit,
    sink: Option<Sink>,
    pub pump: Option<Pump>,
    pub reassembly: Option<Reassembler>,
}

impl Stream {
    pub fn new(
        id: StreamId,
        role: Role,
        interaction: Interaction,
        state: StreamState,
        credit_granted: Credit,
        sink: Option<Sink>,
    ) -> Self {
        Self {
            id,
            role,
            interaction,
            state,
            credit_granted,
            sink,
            pump: None,
            reassembly: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Our payload-sending direction finished (we sent COMPLETE, ERROR or CANCEL).
    pub fn close_local(&mut self) {
        let next = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
        self.transition(next);
    }

    /// The peer's payload direction finished.
    pub fn close_remote(&mut self) {
        let next = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
        self.transition(next);
    }

    fn transition(&mut self, next: StreamState) {
        if next != self.state {
            trace!("stream {} {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        }
    }

    /// Hand one payload to the application side.
    pub fn deliver_next(&mut self, payload: Payload) {
        match self.sink.take() {
            Some(Sink::Response(tx)) => {
                // the caller may have lost interest; that is not an error here
                tx.send(Ok(payload)).ok();
            }
            Some(Sink::Payloads(tx)) => {
                tx.unbounded_send(Ok(payload)).ok();
                self.sink = Some(Sink::Payloads(tx));
            }
            None => trace!("stream {}: payload after sink closed", self.id),
        }
    }

    /// Signal orderly completion of the inbound direction.
    pub fn deliver_complete(&mut self) {
        match self.sink.take() {
            // completion without a value surfaces as an empty payload
            Some(Sink::Response(tx)) => {
                tx.send(Ok(Payload::default())).ok();
            }
            // dropping the sender ends the consumer's stream
            Some(Sink::Payloads(_)) | None => {}
        }
    }

    pub fn deliver_error(&mut self, error: Error) {
        match self.sink.take() {
            Some(Sink::Response(tx)) => {
                tx.send(Err(error)).ok();
            }
            Some(Sink::Payloads(tx)) => {
                tx.unbounded_send(Err(error)).ok();
            }
            None => {}
        }
    }

    /// Drop the delivery channel without a terminal signal (local cancel).
    pub fn drop_sink(&mut self) {
        self.sink = None;
    }

    /// REQUEST_N from the peer: release permits to the outbound pump.
    pub fn add_credit(&mut self, n: u32) {
        if let Some(pump) = &self.pump {
            if let Some(permits) = &pump.permits {
                permits.add_permits(n.min(MAX_U31) as usize);
            }
        }
    }

    /// Stop outbound work; in-flight frames already queued may still reach
    /// the peer.
    pub fn abort_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.abort_pump();
    }
}
