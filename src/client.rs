use crate::{
    connection::{Command, Config, Connection, PayloadRx},
    frame::Frame,
    payload::Payload,
    registry::StreamIds,
    responder::{RejectAll, Responder},
    transport::Transport,
    types::*,
};
use bytes::{Bytes, BytesMut};
use futures::channel::mpsc as payload_channel;
use futures::stream::{Stream, StreamExt};
use log::debug;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(60);
const DEFAULT_MIME: &str = "application/binary";
const DEFAULT_REASSEMBLY_MAX: usize = 16 * 1024 * 1024;
/// Fragments below this cannot fit a request header and one payload byte.
const MIN_FRAGMENT_SIZE: usize = 64;

pub struct Client;

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }
}

/// Configures and opens the client end of a connection.
pub struct ClientBuilder {
    keepalive_interval: Duration,
    max_lifetime: Duration,
    metadata_mime: String,
    data_mime: String,
    honor_lease: bool,
    fragment_size: usize,
    reassembly_max: usize,
    setup_payload: Option<Payload>,
    responder: Arc<dyn Responder>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            metadata_mime: DEFAULT_MIME.to_owned(),
            data_mime: DEFAULT_MIME.to_owned(),
            honor_lease: false,
            fragment_size: 0,
            reassembly_max: DEFAULT_REASSEMBLY_MAX,
            setup_payload: None,
            responder: Arc::new(RejectAll),
        }
    }
}

impl ClientBuilder {
    /// Cadence of outbound KEEPALIVE frames; also sent to the server, which
    /// adopts it for its own heartbeats.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// How long either side tolerates silence before declaring the peer dead.
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime.max(Duration::from_millis(1));
        self
    }

    pub fn metadata_mime(mut self, mime: impl Into<String>) -> Self {
        self.metadata_mime = mime.into();
        self
    }

    pub fn data_mime(mut self, mime: impl Into<String>) -> Self {
        self.data_mime = mime.into();
        self
    }

    /// Opt in to LEASE flow control: no request leaves this end until the
    /// server grants one.
    pub fn honor_lease(mut self, honor: bool) -> Self {
        self.honor_lease = honor;
        self
    }

    /// Split outbound frames so none exceeds `size` encoded bytes. 0 turns
    /// fragmentation off.
    pub fn fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = if size == 0 {
            0
        } else {
            size.max(MIN_FRAGMENT_SIZE)
        };
        self
    }

    /// Cap on a single stream's pending fragment buffer.
    pub fn reassembly_max(mut self, bytes: usize) -> Self {
        self.reassembly_max = bytes;
        self
    }

    pub fn setup_payload(mut self, payload: Payload) -> Self {
        self.setup_payload = Some(payload);
        self
    }

    /// Handler for requests the server issues on this connection.
    pub fn responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }

    /// Send SETUP and start the connection loop.
    pub async fn connect<T: Transport>(
        self,
        transport: T,
    ) -> Result<(Requester, ConnectionHandle), Error> {
        let mut transport: Box<dyn Transport> = Box::new(transport);
        let setup = Frame::Setup {
            version: Version::CURRENT,
            lease: self.honor_lease,
            keepalive_interval: clamp_millis(self.keepalive_interval),
            max_lifetime: clamp_millis(self.max_lifetime),
            resume_token: None,
            metadata_mime: Bytes::from(self.metadata_mime.into_bytes()),
            data_mime: Bytes::from(self.data_mime.into_bytes()),
            payload: self.setup_payload.unwrap_or_default(),
        };
        let mut buf = BytesMut::with_capacity(setup.encoded_len());
        setup.encode(&mut buf);
        transport.send(buf.freeze()).await?;
        debug!("client connected, setup sent");

        let config = Config {
            side: Side::Client,
            keepalive_interval: self.keepalive_interval,
            max_lifetime: self.max_lifetime,
            lease_enabled: self.honor_lease,
            fragment_size: self.fragment_size,
            reassembly_max: self.reassembly_max,
        };
        Ok(spawn_connection(config, self.responder, transport))
    }
}

pub struct Server;

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }
}

/// Configures the server end of a single accepted transport.
pub struct ServerBuilder {
    fragment_size: usize,
    reassembly_max: usize,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            fragment_size: 0,
            reassembly_max: DEFAULT_REASSEMBLY_MAX,
        }
    }
}

impl ServerBuilder {
    pub fn fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = if size == 0 {
            0
        } else {
            size.max(MIN_FRAGMENT_SIZE)
        };
        self
    }

    pub fn reassembly_max(mut self, bytes: usize) -> Self {
        self.reassembly_max = bytes;
        self
    }

    /// Read and validate the client's SETUP, then start the connection loop.
    ///
    /// The acceptor inspects the negotiated parameters and hands back the
    /// responder that will serve this connection; it also receives a
    /// [`Requester`], since the server may open streams of its own.
    pub async fn accept<T, F>(
        self,
        transport: T,
        acceptor: F,
    ) -> Result<(Requester, ConnectionHandle), Error>
    where
        T: Transport,
        F: FnOnce(&SetupInfo, Requester) -> Result<Arc<dyn Responder>, Error>,
    {
        let mut transport: Box<dyn Transport> = Box::new(transport);
        let bytes = transport
            .recv()
            .await?
            .ok_or(Error::ConnectionLost)?;
        let mut bytes = bytes;
        let frame = match Frame::decode(&mut bytes) {
            Ok(frame) => frame,
            Err(err) => {
                return Err(reject(
                    &mut transport,
                    ErrorCode::InvalidSetup,
                    err.to_string(),
                )
                .await);
            }
        };

        let (info, payload) = match frame {
            Frame::Setup {
                version,
                lease,
                keepalive_interval,
                max_lifetime,
                resume_token,
                metadata_mime,
                data_mime,
                payload,
            } => {
                if version.major != Version::CURRENT.major {
                    return Err(reject(
                        &mut transport,
                        ErrorCode::InvalidSetup,
                        format!("unsupported protocol version {version}"),
                    )
                    .await);
                }
                if resume_token.is_some() {
                    return Err(reject(
                        &mut transport,
                        ErrorCode::RejectedResume,
                        "resumption is not supported",
                    )
                    .await);
                }
                let metadata_mime = match ascii_mime(&metadata_mime) {
                    Some(mime) => mime,
                    None => {
                        return Err(reject(
                            &mut transport,
                            ErrorCode::UnsupportedSetup,
                            "metadata MIME type must be ASCII",
                        )
                        .await);
                    }
                };
                let data_mime = match ascii_mime(&data_mime) {
                    Some(mime) => mime,
                    None => {
                        return Err(reject(
                            &mut transport,
                            ErrorCode::UnsupportedSetup,
                            "data MIME type must be ASCII",
                        )
                        .await);
                    }
                };
                (
                    SetupInfo {
                        version,
                        keepalive_interval: Duration::from_millis(u64::from(keepalive_interval)),
                        max_lifetime: Duration::from_millis(u64::from(max_lifetime)),
                        metadata_mime,
                        data_mime,
                        lease,
                        payload: Payload::default(),
                    },
                    payload,
                )
            }
            Frame::Resume => {
                return Err(reject(
                    &mut transport,
                    ErrorCode::RejectedResume,
                    "resumption is not supported",
                )
                .await);
            }
            other => {
                return Err(reject(
                    &mut transport,
                    ErrorCode::InvalidSetup,
                    format!("expected SETUP, got {:?}", other.frame_type()),
                )
                .await);
            }
        };
        let info = SetupInfo { payload, ..info };
        debug!(
            "server accepted setup: keepalive {:?}, lifetime {:?}, lease {}",
            info.keepalive_interval, info.max_lifetime, info.lease
        );

        let config = Config {
            side: Side::Server,
            keepalive_interval: info.keepalive_interval,
            max_lifetime: info.max_lifetime,
            lease_enabled: info.lease,
            fragment_size: self.fragment_size,
            reassembly_max: self.reassembly_max,
        };
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let requester = Requester {
            cmd_tx: cmd_tx.clone(),
            ids: Arc::new(StreamIds::for_side(Side::Server)),
        };
        let responder = match acceptor(&info, requester.clone()) {
            Ok(responder) => responder,
            Err(err) => {
                let message = match &err {
                    Error::Stream { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                return Err(reject(&mut transport, ErrorCode::RejectedSetup, message).await);
            }
        };
        let connection = Connection::new(config, responder, cmd_tx.clone());
        let task = tokio::spawn(connection.run(transport, cmd_rx));
        Ok((requester, ConnectionHandle { cmd_tx, task }))
    }
}

/// The negotiated SETUP parameters, as shown to a server acceptor.
#[derive(Debug, Clone)]
pub struct SetupInfo {
    pub version: Version,
    pub keepalive_interval: Duration,
    pub max_lifetime: Duration,
    pub metadata_mime: String,
    pub data_mime: String,
    pub lease: bool,
    pub payload: Payload,
}

/// The requester half of the facade: issues interactions on the connection.
/// Cheap to clone; all clones feed the same connection loop.
#[derive(Clone)]
pub struct Requester {
    cmd_tx: mpsc::UnboundedSender<Command>,
    ids: Arc<StreamIds>,
}

impl std::fmt::Debug for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requester").finish_non_exhaustive()
    }
}

impl Requester {
    fn allocate(&self) -> Result<StreamId, Error> {
        self.ids.next().ok_or(Error::StreamIdsExhausted)
    }

    fn dispatch(&self, command: Command) -> Result<(), Error> {
        self.cmd_tx.send(command).map_err(|_| Error::ConnectionLost)
    }

    /// Exactly one payload back, or an error.
    pub async fn request_response(&self, payload: Payload) -> Result<Payload, Error> {
        let id = self.allocate()?;
        let (reply, response) = oneshot::channel();
        self.dispatch(Command::RequestResponse { id, payload, reply })?;
        response.await.map_err(|_| Error::ConnectionLost)?
    }

    /// A stream of payloads, opened with `initial_n` of credit. Grant more
    /// through [`PayloadStream::request_n`].
    pub fn request_stream(
        &self,
        payload: Payload,
        initial_n: u32,
    ) -> Result<PayloadStream, Error> {
        let id = self.allocate()?;
        let (sink, inbound) = payload_channel::unbounded();
        self.dispatch(Command::RequestStream {
            id,
            payload,
            initial_n,
            sink,
        })?;
        Ok(PayloadStream::new(id, inbound, self.cmd_tx.clone()))
    }

    /// Bidirectional stream. The first element of `outbound` rides in the
    /// REQUEST_CHANNEL frame itself; the rest flow as the responder grants
    /// credit. `initial_n` is the credit handed to the responder's direction.
    pub async fn request_channel<S>(
        &self,
        outbound: S,
        initial_n: u32,
    ) -> Result<PayloadStream, Error>
    where
        S: Stream<Item = Result<Payload, Error>> + Send + 'static,
    {
        let id = self.allocate()?;
        let mut outbound = outbound.boxed();
        let (payload, complete, rest) = match outbound.next().await {
            Some(Ok(payload)) => (payload, false, Some(outbound)),
            Some(Err(err)) => return Err(err),
            None => (Payload::default(), true, None),
        };
        let (sink, inbound) = payload_channel::unbounded();
        self.dispatch(Command::RequestChannel {
            id,
            payload,
            complete,
            initial_n,
            outbound: rest,
            sink,
        })?;
        Ok(PayloadStream::new(id, inbound, self.cmd_tx.clone()))
    }

    /// Resolves once the frame is handed to the transport; there is no
    /// remote acknowledgement.
    pub async fn fire_and_forget(&self, payload: Payload) -> Result<(), Error> {
        let id = self.allocate()?;
        let (done, dispatched) = oneshot::channel();
        self.dispatch(Command::FireAndForget { id, payload, done })?;
        dispatched.await.map_err(|_| Error::ConnectionLost)?
    }

    pub async fn metadata_push(&self, metadata: impl Into<Bytes>) -> Result<(), Error> {
        let (done, dispatched) = oneshot::channel();
        self.dispatch(Command::MetadataPush {
            metadata: metadata.into(),
            done,
        })?;
        dispatched.await.map_err(|_| Error::ConnectionLost)?
    }
}

/// Inbound payloads of a request_stream or request_channel.
///
/// Dropping it before the stream terminated sends CANCEL to the peer.
pub struct PayloadStream {
    id: StreamId,
    inbound: PayloadRx,
    cmd_tx: mpsc::UnboundedSender<Command>,
    terminated: bool,
}

impl PayloadStream {
    fn new(id: StreamId, inbound: PayloadRx, cmd_tx: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            id,
            inbound,
            cmd_tx,
            terminated: false,
        }
    }

    /// Grant the responder `n` more payloads.
    pub fn request_n(&self, n: u32) {
        let _ = self.cmd_tx.send(Command::RequestN { id: self.id, n });
    }

    pub fn cancel(&mut self) {
        if !self.terminated {
            self.terminated = true;
            let _ = self.cmd_tx.send(Command::Cancel { id: self.id });
        }
    }
}

impl Stream for PayloadStream {
    type Item = Result<Payload, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inbound).poll_next(cx);
        match &polled {
            Poll::Ready(None) | Poll::Ready(Some(Err(_))) => this.terminated = true,
            _ => {}
        }
        polled
    }
}

impl Drop for PayloadStream {
    fn drop(&mut self) {
        if !self.terminated {
            let _ = self.cmd_tx.send(Command::Cancel { id: self.id });
        }
    }
}

/// Owner's view of the connection lifecycle.
///
/// Dropping the handle leaves the connection serving the peer; it ends on
/// transport loss, keepalive timeout, or [`ConnectionHandle::close`].
pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Issue a lease: the peer may send `requests` requests within `ttl`.
    pub fn grant_lease(&self, requests: u32, ttl: Duration) -> Result<(), Error> {
        self.cmd_tx
            .send(Command::GrantLease { requests, ttl })
            .map_err(|_| Error::ConnectionLost)
    }

    /// Graceful shutdown: sends ERROR(CONNECTION_CLOSE) and tears down.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    /// Resolves when the connection loop has terminated.
    pub async fn closed(self) {
        let _ = self.task.await;
    }
}

fn spawn_connection(
    config: Config,
    responder: Arc<dyn Responder>,
    transport: Box<dyn Transport>,
) -> (Requester, ConnectionHandle) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let side = config.side;
    let connection = Connection::new(config, responder, cmd_tx.clone());
    let task = tokio::spawn(connection.run(transport, cmd_rx));
    let requester = Requester {
        cmd_tx: cmd_tx.clone(),
        ids: Arc::new(StreamIds::for_side(side)),
    };
    (requester, ConnectionHandle { cmd_tx, task })
}

async fn reject(
    transport: &mut Box<dyn Transport>,
    code: ErrorCode,
    message: impl Into<String>,
) -> Error {
    let message = message.into();
    let frame = Frame::Error {
        stream_id: 0,
        code,
        data: Bytes::from(message.clone().into_bytes()),
    };
    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    frame.encode(&mut buf);
    let _ = transport.send(buf.freeze()).await;
    let _ = transport.close().await;
    Error::Connection { code, message }
}

fn ascii_mime(raw: &Bytes) -> Option<String> {
    std::str::from_utf8(raw)
        .ok()
        .filter(|s| s.is_ascii())
        .map(str::to_owned)
}

fn clamp_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis())
        .unwrap_or(MAX_U31)
        .clamp(1, MAX_U31)
}
