use crate::{
    flow::{Credit, Lease},
    fragment,
    fragment::Reassembler,
    frame::Frame,
    payload::Payload,
    registry::StreamRegistry,
    responder::Responder,
    stream::{Interaction, Pump, Role, Sink, Stream, StreamState},
    transport::Transport,
    types::*,
};
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use log::{debug, error, trace, warn};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

/// Delivery channel for a stream's inbound payloads.
pub(crate) type PayloadTx = futures::channel::mpsc::UnboundedSender<Result<Payload, Error>>;
pub(crate) type PayloadRx = futures::channel::mpsc::UnboundedReceiver<Result<Payload, Error>>;

/// Negotiated connection parameters; on the server these come from the
/// client's SETUP.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub side: Side,
    pub keepalive_interval: Duration,
    pub max_lifetime: Duration,
    pub lease_enabled: bool,
    pub fragment_size: usize,
    pub reassembly_max: usize,
}

impl Config {
    /// How long terminated stream ids keep swallowing late frames. The wire
    /// spec leaves this open; two keepalive periods outlive any frame that
    /// was in flight when the terminal frame crossed it.
    pub fn tombstone_horizon(&self) -> Duration {
        self.keepalive_interval * 2
    }
}

/// Everything the facade (and the internal pump tasks) ask of the loop.
pub(crate) enum Command {
    RequestResponse {
        id: StreamId,
        payload: Payload,
        reply: oneshot::Sender<Result<Payload, Error>>,
    },
    RequestStream {
        id: StreamId,
        payload: Payload,
        initial_n: u32,
        sink: PayloadTx,
    },
    RequestChannel {
        id: StreamId,
        payload: Payload,
        complete: bool,
        initial_n: u32,
        outbound: Option<BoxStream<'static, Result<Payload, Error>>>,
        sink: PayloadTx,
    },
    FireAndForget {
        id: StreamId,
        payload: Payload,
        done: oneshot::Sender<Result<(), Error>>,
    },
    MetadataPush {
        metadata: Bytes,
        done: oneshot::Sender<Result<(), Error>>,
    },
    RequestN {
        id: StreamId,
        n: u32,
    },
    Cancel {
        id: StreamId,
    },
    GrantLease {
        requests: u32,
        ttl: Duration,
    },
    Close,
    // pump tasks re-enter the loop with these; emission stays serialized here
    Emit {
        id: StreamId,
        payload: Payload,
    },
    Complete {
        id: StreamId,
    },
    Fail {
        id: StreamId,
        error: Error,
    },
    Respond {
        id: StreamId,
        result: Result<Payload, Error>,
    },
}

/// Per-connection state, owned by the `run` loop. All stream state mutation
/// and all frame emission happen on this one task.
pub(crate) struct Connection {
    config: Config,
    registry: StreamRegistry,
    responder: Arc<dyn Responder>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// Grant received from the peer: our permission to issue requests.
    lease_in: Option<Lease>,
    /// Grant we issued: gates the peer's inbound requests.
    lease_out: Option<Lease>,
    keepalive_deadline: Instant,
}

impl Connection {
    pub fn new(
        config: Config,
        responder: Arc<dyn Responder>,
        cmd_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let registry = StreamRegistry::new(config.side, config.tombstone_horizon());
        let keepalive_deadline = Instant::now() + config.max_lifetime;
        Self {
            config,
            registry,
            responder,
            cmd_tx,
            lease_in: None,
            lease_out: None,
            keepalive_deadline,
        }
    }

    pub async fn run(
        mut self,
        mut transport: Box<dyn Transport>,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut keepalive = interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.keepalive_deadline = Instant::now() + self.config.max_lifetime;

        let reason = loop {
            tokio::select! {
                received = transport.recv() => match received {
                    Ok(Some(bytes)) => match self.on_frame(&mut transport, bytes).await {
                        Ok(None) => {}
                        Ok(Some(reason)) => break reason,
                        Err(err) => break Error::Transport(err),
                    },
                    Ok(None) => break Error::ConnectionLost,
                    Err(err) => break Error::Transport(err),
                },
                command = cmd_rx.recv() => match command {
                    Some(command) => match self.on_command(&mut transport, command).await {
                        Ok(None) => {}
                        Ok(Some(reason)) => break reason,
                        Err(err) => break Error::Transport(err),
                    },
                    // the loop holds a sender for its pumps, so this is unreachable
                    None => break Error::ConnectionLost,
                },
                _ = keepalive.tick() => {
                    let beat = Frame::Keepalive {
                        respond: true,
                        last_received_position: 0,
                        data: Bytes::new(),
                    };
                    if let Err(err) = self.send(&mut transport, beat).await {
                        break Error::Transport(err);
                    }
                    self.registry.purge(Instant::now());
                }
                _ = sleep_until(self.keepalive_deadline) => {
                    let message = format!(
                        "no KEEPALIVE from peer within {:?}",
                        self.config.max_lifetime
                    );
                    error!("{}: {message}", self.config.side);
                    let frame = Frame::Error {
                        stream_id: 0,
                        code: ErrorCode::ConnectionError,
                        data: Bytes::from(message.clone().into_bytes()),
                    };
                    let _ = self.send(&mut transport, frame).await;
                    break Error::Connection {
                        code: ErrorCode::ConnectionError,
                        message,
                    };
                }
            }
        };

        self.shutdown(&mut transport, &reason).await;
    }

    /// Encode (fragmenting when configured) and hand frames to the transport.
    async fn send(&self, transport: &mut Box<dyn Transport>, frame: Frame) -> io::Result<()> {
        for frame in fragment::fragment(frame, self.config.fragment_size) {
            trace!(
                "{} send {:?} on stream {}",
                self.config.side,
                frame.frame_type(),
                frame.stream_id()
            );
            let mut buf = BytesMut::with_capacity(frame.encoded_len());
            frame.encode(&mut buf);
            transport.send(buf.freeze()).await?;
        }
        Ok(())
    }

    async fn on_frame(
        &mut self,
        transport: &mut Box<dyn Transport>,
        mut bytes: Bytes,
    ) -> Result<Option<Error>, io::Error> {
        let frame = match Frame::decode(&mut bytes) {
            Ok(frame) => frame,
            Err(err) if err.can_ignore() => {
                trace!("{} dropped ignorable frame: {err}", self.config.side);
                return Ok(None);
            }
            Err(err) => {
                let (frame, reason) = close_with(ErrorCode::ConnectionError, err.to_string());
                self.send(transport, frame).await?;
                return Ok(Some(reason));
            }
        };
        trace!(
            "{} recv {:?} on stream {}",
            self.config.side,
            frame.frame_type(),
            frame.stream_id()
        );

        match frame {
            Frame::Setup { .. } => {
                let (frame, reason) =
                    close_with(ErrorCode::ConnectionError, "SETUP after connection established");
                self.send(transport, frame).await?;
                Ok(Some(reason))
            }
            Frame::Resume | Frame::ResumeOk => {
                let (frame, reason) =
                    close_with(ErrorCode::RejectedResume, "resumption is not supported");
                self.send(transport, frame).await?;
                Ok(Some(reason))
            }
            Frame::Keepalive { respond, data, .. } => {
                self.keepalive_deadline = Instant::now() + self.config.max_lifetime;
                if respond {
                    let echo = Frame::Keepalive {
                        respond: false,
                        last_received_position: 0,
                        data,
                    };
                    self.send(transport, echo).await?;
                }
                Ok(None)
            }
            Frame::Lease {
                ttl_ms,
                number_of_requests,
                ..
            } => {
                if self.config.lease_enabled {
                    debug!(
                        "{} leased {number_of_requests} requests for {ttl_ms}ms",
                        self.config.side
                    );
                    self.lease_in = Some(Lease::new(
                        number_of_requests,
                        Duration::from_millis(u64::from(ttl_ms)),
                        Instant::now(),
                    ));
                } else {
                    warn!("{} received LEASE but leasing is disabled", self.config.side);
                }
                Ok(None)
            }
            Frame::Error {
                stream_id: 0,
                code,
                data,
            } => Ok(Some(Error::Connection {
                code,
                message: String::from_utf8_lossy(&data).into_owned(),
            })),
            Frame::MetadataPush { metadata } => {
                self.responder.metadata_push(metadata);
                Ok(None)
            }
            frame => self.on_stream_frame(transport, frame).await,
        }
    }

    async fn on_stream_frame(
        &mut self,
        transport: &mut Box<dyn Transport>,
        frame: Frame,
    ) -> Result<Option<Error>, io::Error> {
        let id = frame.stream_id();
        if self.registry.is_tombstoned(id) {
            trace!(
                "{} dropped late {:?} on terminated stream {id}",
                self.config.side,
                frame.frame_type()
            );
            return Ok(None);
        }

        // an open reassembly sequence claims every PAYLOAD on its stream
        if let Frame::Payload {
            follows,
            complete,
            payload,
            ..
        } = &frame
        {
            let pending = self
                .registry
                .get_mut(id)
                .map_or(false, |stream| stream.reassembly.is_some());
            if pending {
                return self
                    .on_fragment(transport, id, *follows, *complete, payload.clone())
                    .await;
            }
        }

        if frame.is_request() {
            return self.on_request(transport, frame).await;
        }

        match frame {
            Frame::Payload {
                follows: true,
                complete,
                next,
                payload,
                ..
            } => {
                // head of a fragmented payload on an established stream
                match self.registry.get_mut(id) {
                    None => self.unknown_stream(transport, id).await,
                    Some(stream) => {
                        let head = Frame::Payload {
                            stream_id: id,
                            follows: true,
                            complete,
                            next,
                            payload,
                        };
                        match Reassembler::new(head, self.config.reassembly_max) {
                            Ok(reassembler) => {
                                stream.reassembly = Some(reassembler);
                                Ok(None)
                            }
                            Err(err) => {
                                let (frame, reason) =
                                    close_with(ErrorCode::ConnectionError, err.to_string());
                                self.send(transport, frame).await?;
                                Ok(Some(reason))
                            }
                        }
                    }
                }
            }
            Frame::Payload {
                complete,
                next,
                payload,
                ..
            } => self.handle_payload(transport, id, next, complete, payload).await,
            Frame::RequestN { n, .. } => {
                match self.registry.get_mut(id) {
                    Some(stream) => stream.add_credit(n),
                    // late or stray REQUEST_N is dropped
                    None => trace!("{} REQUEST_N on unknown stream {id}", self.config.side),
                }
                Ok(None)
            }
            Frame::Cancel { .. } => {
                match self.registry.remove(id, Instant::now()) {
                    Some(mut stream) => {
                        debug!("{} stream {id} canceled by peer", self.config.side);
                        stream.abort_pump();
                        match stream.role {
                            Role::Requester => stream.deliver_error(Error::Canceled),
                            Role::Responder => stream.drop_sink(),
                        }
                    }
                    None => trace!("{} CANCEL on unknown stream {id}", self.config.side),
                }
                Ok(None)
            }
            Frame::Error { code, data, .. } => {
                match self.registry.remove(id, Instant::now()) {
                    Some(mut stream) => {
                        stream.abort_pump();
                        stream.deliver_error(Error::Stream {
                            code,
                            message: String::from_utf8_lossy(&data).into_owned(),
                        });
                    }
                    // never answer an ERROR with an ERROR
                    None => trace!("{} ERROR on unknown stream {id} dropped", self.config.side),
                }
                Ok(None)
            }
            other => {
                debug!(
                    "{} unexpected {:?} on stream {id}",
                    self.config.side,
                    other.frame_type()
                );
                Ok(None)
            }
        }
    }

    async fn on_fragment(
        &mut self,
        transport: &mut Box<dyn Transport>,
        id: StreamId,
        follows: bool,
        complete: bool,
        payload: Payload,
    ) -> Result<Option<Error>, io::Error> {
        let pushed = match self.registry.get_mut(id) {
            Some(stream) => match stream.reassembly.as_mut() {
                Some(reassembler) => reassembler.push(follows, complete, payload),
                None => return Ok(None),
            },
            None => return Ok(None),
        };
        match pushed {
            Ok(None) => Ok(None),
            Ok(Some(frame)) => {
                if let Some(stream) = self.registry.get_mut(id) {
                    stream.reassembly = None;
                }
                if frame.is_request() {
                    // the placeholder only existed to hold the fragments
                    self.registry.take(id);
                    self.dispatch_request(transport, frame).await
                } else if let Frame::Payload {
                    complete, next, payload, ..
                } = frame
                {
                    self.handle_payload(transport, id, next, complete, payload).await
                } else {
                    Ok(None)
                }
            }
            Err(err) => {
                let (frame, reason) = close_with(ErrorCode::ConnectionError, err.to_string());
                self.send(transport, frame).await?;
                Ok(Some(reason))
            }
        }
    }

    /// A request frame (possibly the head of a fragment sequence) arrived.
    async fn on_request(
        &mut self,
        transport: &mut Box<dyn Transport>,
        frame: Frame,
    ) -> Result<Option<Error>, io::Error> {
        let id = frame.stream_id();
        if self.registry.contains(id) {
            warn!("{} request reuses live stream id {id}", self.config.side);
            if let Some(mut stream) = self.registry.remove(id, Instant::now()) {
                stream.abort_pump();
                stream.deliver_error(Error::invalid("stream id reused by peer"));
            }
            let frame = Frame::Error {
                stream_id: id,
                code: ErrorCode::Invalid,
                data: Bytes::from_static(b"stream id already in use"),
            };
            self.send(transport, frame).await?;
            return Ok(None);
        }
        if !self.registry.peer_initiated(id) {
            let frame = Frame::Error {
                stream_id: id,
                code: ErrorCode::Invalid,
                data: Bytes::from_static(b"stream id parity belongs to this end"),
            };
            self.send(transport, frame).await?;
            return Ok(None);
        }

        let follows = matches!(
            frame,
            Frame::RequestResponse { follows: true, .. }
                | Frame::RequestFnf { follows: true, .. }
                | Frame::RequestStream { follows: true, .. }
                | Frame::RequestChannel { follows: true, .. }
        );
        if follows {
            let interaction = match frame {
                Frame::RequestResponse { .. } => Interaction::RequestResponse,
                Frame::RequestStream { .. } => Interaction::RequestStream,
                Frame::RequestChannel { .. } => Interaction::RequestChannel,
                _ => Interaction::FireAndForget,
            };
            let mut stream = Stream::new(
                id,
                Role::Responder,
                interaction,
                StreamState::Open,
                Credit::new(0),
                None,
            );
            match Reassembler::new(frame, self.config.reassembly_max) {
                Ok(reassembler) => {
                    stream.reassembly = Some(reassembler);
                    self.registry.insert(stream);
                    Ok(None)
                }
                Err(err) => {
                    let (frame, reason) = close_with(ErrorCode::ConnectionError, err.to_string());
                    self.send(transport, frame).await?;
                    Ok(Some(reason))
                }
            }
        } else {
            self.dispatch_request(transport, frame).await
        }
    }

    /// Hand a whole request to the responder, wiring up stream state and an
    /// outbound pump as the pattern requires.
    async fn dispatch_request(
        &mut self,
        transport: &mut Box<dyn Transport>,
        frame: Frame,
    ) -> Result<Option<Error>, io::Error> {
        let id = frame.stream_id();
        if self.config.lease_enabled {
            let now = Instant::now();
            let allowed = self
                .lease_out
                .as_mut()
                .map_or(false, |lease| lease.try_use(now));
            if !allowed {
                debug!("{} rejecting request {id}: lease exhausted", self.config.side);
                let frame = Frame::Error {
                    stream_id: id,
                    code: ErrorCode::Rejected,
                    data: Bytes::from_static(b"lease exhausted or expired"),
                };
                self.send(transport, frame).await?;
                return Ok(None);
            }
        }

        match frame {
            Frame::RequestFnf { payload, .. } => {
                tokio::spawn(self.responder.fire_and_forget(payload));
                Ok(None)
            }
            Frame::RequestResponse { payload, .. } => {
                let future = self.responder.request_response(payload);
                let cmd_tx = self.cmd_tx.clone();
                let task = tokio::spawn(async move {
                    let result = future.await;
                    let _ = cmd_tx.send(Command::Respond { id, result });
                });
                let mut stream = Stream::new(
                    id,
                    Role::Responder,
                    Interaction::RequestResponse,
                    StreamState::HalfClosedRemote,
                    Credit::new(0),
                    None,
                );
                stream.pump = Some(Pump {
                    permits: None,
                    task,
                });
                self.registry.insert(stream);
                Ok(None)
            }
            Frame::RequestStream {
                initial_request_n,
                payload,
                ..
            } => {
                let source = self.responder.request_stream(payload);
                let stream = self.spawn_pump(
                    id,
                    Interaction::RequestStream,
                    StreamState::HalfClosedRemote,
                    Credit::new(0),
                    initial_request_n,
                    source,
                    None,
                );
                self.registry.insert(stream);
                Ok(None)
            }
            Frame::RequestChannel {
                complete,
                initial_request_n,
                payload,
                ..
            } => {
                let (tx, rx) = futures::channel::mpsc::unbounded();
                // the request's payload is the requester's first element
                let _ = tx.unbounded_send(Ok(payload));
                let sink = if complete { None } else { Some(Sink::Payloads(tx)) };
                let source = self.responder.request_channel(rx.boxed());
                let state = if complete {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };
                let stream = self.spawn_pump(
                    id,
                    Interaction::RequestChannel,
                    state,
                    Credit::UNBOUNDED,
                    initial_request_n,
                    source,
                    sink,
                );
                self.registry.insert(stream);
                if !complete {
                    // demand for the requester's side is delegated to the
                    // handler's own consumption of the inbound stream
                    self.send(transport, Frame::RequestN { stream_id: id, n: MAX_U31 }).await?;
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_pump(
        &self,
        id: StreamId,
        interaction: Interaction,
        state: StreamState,
        credit_granted: Credit,
        initial_n: u32,
        source: BoxStream<'static, Result<Payload, Error>>,
        sink: Option<Sink>,
    ) -> Stream {
        let permits = Arc::new(Semaphore::new(initial_n.min(MAX_U31) as usize));
        let task = tokio::spawn(pump_payloads(id, source, permits.clone(), self.cmd_tx.clone()));
        let mut stream = Stream::new(id, Role::Responder, interaction, state, credit_granted, sink);
        stream.pump = Some(Pump {
            permits: Some(permits),
            task,
        });
        stream
    }

    /// A whole (reassembled, if fragmented) PAYLOAD for an established stream.
    async fn handle_payload(
        &mut self,
        transport: &mut Box<dyn Transport>,
        id: StreamId,
        next: bool,
        complete: bool,
        payload: Payload,
    ) -> Result<Option<Error>, io::Error> {
        let mut underflow = None;
        let mut finished = false;
        match self.registry.get_mut(id) {
            None => return self.unknown_stream(transport, id).await,
            Some(stream) => {
                if next {
                    if stream.credit_granted.try_take() {
                        stream.deliver_next(payload);
                    } else {
                        underflow = Some(format!("PAYLOAD on stream {id} exceeds granted credit"));
                    }
                }
                if underflow.is_none() {
                    // a request/response answer is terminal with or without C
                    let terminal = complete
                        || (next && stream.interaction == Interaction::RequestResponse);
                    if terminal {
                        stream.deliver_complete();
                        stream.close_remote();
                        finished = stream.is_closed();
                    }
                }
            }
        }

        if let Some(message) = underflow {
            warn!("{} {message}", self.config.side);
            if let Some(mut stream) = self.registry.remove(id, Instant::now()) {
                stream.abort_pump();
                stream.deliver_error(Error::invalid(message.clone()));
            }
            let frame = Frame::Error {
                stream_id: id,
                code: ErrorCode::Invalid,
                data: Bytes::from(message.into_bytes()),
            };
            self.send(transport, frame).await?;
            return Ok(None);
        }
        if finished {
            self.registry.remove(id, Instant::now());
        }
        Ok(None)
    }

    async fn unknown_stream(
        &mut self,
        transport: &mut Box<dyn Transport>,
        id: StreamId,
    ) -> Result<Option<Error>, io::Error> {
        debug!("{} frame on unknown stream {id}", self.config.side);
        let frame = Frame::Error {
            stream_id: id,
            code: ErrorCode::Invalid,
            data: Bytes::from_static(b"no such stream"),
        };
        self.send(transport, frame).await?;
        Ok(None)
    }

    /// Requester-side lease gate; rejects locally before anything is sent.
    fn take_lease(&mut self) -> Result<(), Error> {
        if !self.config.lease_enabled {
            return Ok(());
        }
        let now = Instant::now();
        let ok = match self.lease_in.as_mut() {
            Some(lease) => lease.try_use(now),
            None => false,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::rejected("no valid lease for this request"))
        }
    }

    async fn on_command(
        &mut self,
        transport: &mut Box<dyn Transport>,
        command: Command,
    ) -> Result<Option<Error>, io::Error> {
        match command {
            Command::RequestResponse { id, payload, reply } => {
                if let Err(err) = self.take_lease() {
                    reply.send(Err(err)).ok();
                    return Ok(None);
                }
                let stream = Stream::new(
                    id,
                    Role::Requester,
                    Interaction::RequestResponse,
                    StreamState::HalfClosedLocal,
                    Credit::new(1),
                    Some(Sink::Response(reply)),
                );
                self.registry.insert(stream);
                let frame = Frame::RequestResponse {
                    stream_id: id,
                    follows: false,
                    payload,
                };
                self.send(transport, frame).await?;
                Ok(None)
            }
            Command::RequestStream {
                id,
                payload,
                initial_n,
                sink,
            } => {
                if let Err(err) = self.take_lease() {
                    sink.unbounded_send(Err(err)).ok();
                    return Ok(None);
                }
                let initial_n = initial_n.clamp(1, MAX_U31);
                let stream = Stream::new(
                    id,
                    Role::Requester,
                    Interaction::RequestStream,
                    StreamState::HalfClosedLocal,
                    Credit::new(initial_n),
                    Some(Sink::Payloads(sink)),
                );
                self.registry.insert(stream);
                let frame = Frame::RequestStream {
                    stream_id: id,
                    follows: false,
                    initial_request_n: initial_n,
                    payload,
                };
                self.send(transport, frame).await?;
                Ok(None)
            }
            Command::RequestChannel {
                id,
                payload,
                complete,
                initial_n,
                outbound,
                sink,
            } => {
                if let Err(err) = self.take_lease() {
                    sink.unbounded_send(Err(err)).ok();
                    return Ok(None);
                }
                let initial_n = initial_n.clamp(1, MAX_U31);
                let state = if complete {
                    StreamState::HalfClosedLocal
                } else {
                    StreamState::Open
                };
                let mut stream = Stream::new(
                    id,
                    Role::Requester,
                    Interaction::RequestChannel,
                    state,
                    Credit::new(initial_n),
                    Some(Sink::Payloads(sink)),
                );
                if let Some(source) = outbound {
                    // the responder opens our credit with REQUEST_N
                    let permits = Arc::new(Semaphore::new(0));
                    let task = tokio::spawn(pump_payloads(
                        id,
                        source,
                        permits.clone(),
                        self.cmd_tx.clone(),
                    ));
                    stream.pump = Some(Pump {
                        permits: Some(permits),
                        task,
                    });
                }
                self.registry.insert(stream);
                let frame = Frame::RequestChannel {
                    stream_id: id,
                    follows: false,
                    complete,
                    initial_request_n: initial_n,
                    payload,
                };
                self.send(transport, frame).await?;
                Ok(None)
            }
            Command::FireAndForget { id, payload, done } => {
                if let Err(err) = self.take_lease() {
                    done.send(Err(err)).ok();
                    return Ok(None);
                }
                let frame = Frame::RequestFnf {
                    stream_id: id,
                    follows: false,
                    payload,
                };
                self.send(transport, frame).await?;
                done.send(Ok(())).ok();
                Ok(None)
            }
            Command::MetadataPush { metadata, done } => {
                self.send(transport, Frame::MetadataPush { metadata }).await?;
                done.send(Ok(())).ok();
                Ok(None)
            }
            Command::RequestN { id, n } => {
                // REQUEST_N of zero is not representable on the wire
                if n > 0 && self.registry.contains(id) {
                    if let Some(stream) = self.registry.get_mut(id) {
                        stream.credit_granted.add(n);
                        trace!(
                            "stream {id} granted {n}, {} outstanding",
                            stream.credit_granted.remaining()
                        );
                    }
                    self.send(transport, Frame::RequestN { stream_id: id, n }).await?;
                }
                Ok(None)
            }
            Command::Cancel { id } => {
                if let Some(mut stream) = self.registry.remove(id, Instant::now()) {
                    stream.abort_pump();
                    stream.drop_sink();
                    self.send(transport, Frame::Cancel { stream_id: id }).await?;
                }
                Ok(None)
            }
            Command::GrantLease { requests, ttl } => {
                self.lease_out = Some(Lease::new(requests, ttl, Instant::now()));
                let frame = Frame::Lease {
                    ttl_ms: u32::try_from(ttl.as_millis()).unwrap_or(MAX_U31) & MAX_U31,
                    number_of_requests: requests,
                    metadata: None,
                };
                self.send(transport, frame).await?;
                Ok(None)
            }
            Command::Close => {
                let message = "connection closed".to_owned();
                let frame = Frame::Error {
                    stream_id: 0,
                    code: ErrorCode::ConnectionClose,
                    data: Bytes::from_static(b"connection closed"),
                };
                self.send(transport, frame).await?;
                Ok(Some(Error::Connection {
                    code: ErrorCode::ConnectionClose,
                    message,
                }))
            }
            Command::Emit { id, payload } => {
                // the stream may have been canceled since the pump emitted
                if self.registry.contains(id) {
                    let frame = Frame::Payload {
                        stream_id: id,
                        follows: false,
                        complete: false,
                        next: true,
                        payload,
                    };
                    self.send(transport, frame).await?;
                }
                Ok(None)
            }
            Command::Complete { id } => {
                if self.registry.contains(id) {
                    let frame = Frame::Payload {
                        stream_id: id,
                        follows: false,
                        complete: true,
                        next: false,
                        payload: Payload::default(),
                    };
                    self.send(transport, frame).await?;
                    let mut finished = false;
                    if let Some(stream) = self.registry.get_mut(id) {
                        stream.close_local();
                        finished = stream.is_closed();
                    }
                    if finished {
                        self.registry.remove(id, Instant::now());
                    }
                }
                Ok(None)
            }
            Command::Fail { id, error } => {
                if let Some(mut stream) = self.registry.remove(id, Instant::now()) {
                    stream.abort_pump();
                    let code = error.stream_code();
                    let message = error_data(&error);
                    stream.deliver_error(error);
                    let frame = Frame::Error {
                        stream_id: id,
                        code,
                        data: Bytes::from(message.into_bytes()),
                    };
                    self.send(transport, frame).await?;
                }
                Ok(None)
            }
            Command::Respond { id, result } => {
                if let Some(stream) = self.registry.remove(id, Instant::now()) {
                    drop(stream);
                    let frame = match result {
                        Ok(payload) => Frame::Payload {
                            stream_id: id,
                            follows: false,
                            complete: true,
                            next: true,
                            payload,
                        },
                        Err(error) => Frame::Error {
                            stream_id: id,
                            code: error.stream_code(),
                            data: Bytes::from(error_data(&error).into_bytes()),
                        },
                    };
                    self.send(transport, frame).await?;
                } else {
                    trace!("{} response for canceled stream {id} dropped", self.config.side);
                }
                Ok(None)
            }
        }
    }

    async fn shutdown(&mut self, transport: &mut Box<dyn Transport>, reason: &Error) {
        debug!(
            "{} connection closing with {} open streams: {reason}",
            self.config.side,
            self.registry.len()
        );
        for mut stream in self.registry.drain() {
            stream.abort_pump();
            stream.deliver_error(terminal_error(reason));
        }
        let _ = transport.close().await;
    }
}

/// Drive one outbound payload source: one request-N permit per element, then
/// re-enter the loop through the command channel. Completion is not gated on
/// credit, so an exhausted source can always terminate the stream.
async fn pump_payloads(
    id: StreamId,
    mut source: BoxStream<'static, Result<Payload, Error>>,
    permits: Arc<Semaphore>,
    cmd_tx: mpsc::UnboundedSender<Command>,
) {
    loop {
        match source.next().await {
            None => {
                let _ = cmd_tx.send(Command::Complete { id });
                return;
            }
            Some(Ok(payload)) => {
                match permits.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => return,
                }
                if cmd_tx.send(Command::Emit { id, payload }).is_err() {
                    return;
                }
            }
            Some(Err(error)) => {
                let _ = cmd_tx.send(Command::Fail { id, error });
                return;
            }
        }
    }
}

fn close_with(code: ErrorCode, message: impl Into<String>) -> (Frame, Error) {
    let message = message.into();
    let frame = Frame::Error {
        stream_id: 0,
        code,
        data: Bytes::from(message.clone().into_bytes()),
    };
    (frame, Error::Connection { code, message })
}

/// The ERROR frame's data field carries the bare message, not the code.
fn error_data(error: &Error) -> String {
    match error {
        Error::Stream { message, .. } | Error::Connection { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// What outstanding streams observe when the connection dies.
fn terminal_error(reason: &Error) -> Error {
    match reason {
        Error::Connection { code, message } => Error::Connection {
            code: *code,
            message: message.clone(),
        },
        Error::ConnectionLost => Error::ConnectionLost,
        other => Error::Connection {
            code: ErrorCode::ConnectionError,
            message: other.to_string(),
        },
    }
}
