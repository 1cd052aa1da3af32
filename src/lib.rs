#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation,
)]

mod client;
mod connection;
mod flags;
mod flow;
mod fragment;
mod frame;
mod payload;
mod registry;
mod responder;
mod stream;
mod transport;
mod types;

pub use bytes::Bytes;
pub use client::{
    Client, ClientBuilder, ConnectionHandle, PayloadStream, Requester, Server, ServerBuilder,
    SetupInfo,
};
pub use flags::Flags;
pub use frame::Frame;
pub use payload::{Payload, PayloadBuilder};
pub use responder::{RejectAll, Responder};
pub use transport::{connect_tcp, FramedTransport, Transport, MAX_FRAME_LEN};
pub use types::{
    Error, ErrorCode, FrameDecodeError, FrameType, Side, StreamId, Version, MAX_U31, MAX_U63,
};
pub use url::Url;
