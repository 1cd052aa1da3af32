use num_derive::{FromPrimitive, ToPrimitive};

/// Largest value a 31-bit unsigned field can carry.
pub const MAX_U31: u32 = u32::MAX >> 1;

/// Largest value a 63-bit unsigned field can carry.
pub const MAX_U63: u64 = u64::MAX >> 1;

pub type StreamId = u32;

/// Protocol version carried in SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "{}.{}", major, minor)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const CURRENT: Version = Version { major: 1, minor: 0 };
}

impl Default for Version {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Which end of the connection we are. The client initiates the SETUP and
/// owns odd stream ids; the server owns even ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Side {
    #[display(fmt = "client")]
    Client,
    #[display(fmt = "server")]
    Server,
}

/// https://rsocket.io/about/protocol/#frame-types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
#[non_exhaustive]
pub enum FrameType {
    Setup = 0x01,
    Lease = 0x02,
    Keepalive = 0x03,
    RequestResponse = 0x04,
    RequestFnf = 0x05,
    RequestStream = 0x06,
    RequestChannel = 0x07,
    RequestN = 0x08,
    Cancel = 0x09,
    Payload = 0x0A,
    Error = 0x0B,
    MetadataPush = 0x0C,
    Resume = 0x0D,
    ResumeOk = 0x0E,
    Ext = 0x3F,
}

/// https://rsocket.io/about/protocol/#error-codes
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    derive_more::Display,
)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorCode {
    /// The SETUP frame is invalid for the server.
    #[display(fmt = "INVALID_SETUP")]
    InvalidSetup = 0x0001,
    /// Some of the parameters specified by the client are unsupported by the server.
    #[display(fmt = "UNSUPPORTED_SETUP")]
    UnsupportedSetup = 0x0002,
    /// The server rejected the setup; the reason may be in the error data.
    #[display(fmt = "REJECTED_SETUP")]
    RejectedSetup = 0x0003,
    /// The server rejected the resume attempt.
    #[display(fmt = "REJECTED_RESUME")]
    RejectedResume = 0x0004,
    /// The connection is being terminated; outstanding streams may be dropped.
    #[display(fmt = "CONNECTION_ERROR")]
    ConnectionError = 0x0101,
    /// The connection is being terminated gracefully after draining.
    #[display(fmt = "CONNECTION_CLOSE")]
    ConnectionClose = 0x0102,
    /// Application layer error on a stream.
    #[display(fmt = "APPLICATION_ERROR")]
    ApplicationError = 0x0201,
    /// The responder refused the request without processing it.
    #[display(fmt = "REJECTED")]
    Rejected = 0x0202,
    /// The responder canceled the request; it may have started processing.
    #[display(fmt = "CANCELED")]
    Canceled = 0x0203,
    /// The request is invalid.
    #[display(fmt = "INVALID")]
    Invalid = 0x0204,
}

impl ErrorCode {
    /// Codes that are only legal on stream id 0.
    pub fn is_connection_code(self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidSetup
                | ErrorCode::UnsupportedSetup
                | ErrorCode::RejectedSetup
                | ErrorCode::RejectedResume
                | ErrorCode::ConnectionError
                | ErrorCode::ConnectionClose
        )
    }

    /// Codes that are only legal on a stream id greater than 0.
    pub fn is_stream_code(self) -> bool {
        !self.is_connection_code()
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("unknown frame type bits {bits:#06x}")]
    UnknownType { bits: u16, ignorable: bool },
    #[error("EXT frames are not supported")]
    UnsupportedExtension { ignorable: bool },
    #[error("frame is shorter than its layout requires")]
    Incomplete,
    #[error("reserved stream id bit is set")]
    ReservedBitSet,
    #[error("stream id must be {expected}, found {found}")]
    InvalidStreamId { expected: &'static str, found: u32 },
    #[error("PAYLOAD frame carries neither NEXT, COMPLETE nor FOLLOWS")]
    MissingPayloadFlags,
    #[error("REQUEST_N of zero")]
    ZeroRequestN,
    #[error("unknown error code: {0:#010x}")]
    UnknownErrorCode(u32),
}

impl FrameDecodeError {
    /// True when the peer marked the offending frame IGNORE, in which case
    /// it is dropped instead of failing the connection.
    pub fn can_ignore(&self) -> bool {
        matches!(
            self,
            FrameDecodeError::UnknownType { ignorable: true, .. }
                | FrameDecodeError::UnsupportedExtension { ignorable: true }
        )
    }
}

/// Error surfaced through the public API: request results, payload
/// streams, and connection termination all carry one of these.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame decode: {0}")]
    Decode(#[from] FrameDecodeError),
    /// The peer (or the local state machine) terminated a single stream.
    #[error("{code}: {message}")]
    Stream { code: ErrorCode, message: String },
    /// The connection itself was terminated with an ERROR on stream 0.
    #[error("connection {code}: {message}")]
    Connection { code: ErrorCode, message: String },
    #[error("canceled")]
    Canceled,
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    #[error("connection lost")]
    ConnectionLost,
    #[error("stream ids exhausted")]
    StreamIdsExhausted,
}

impl Error {
    pub fn rejected(message: impl Into<String>) -> Self {
        Error::Stream {
            code: ErrorCode::Rejected,
            message: message.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Error::Stream {
            code: ErrorCode::ApplicationError,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Error::Stream {
            code: ErrorCode::Invalid,
            message: message.into(),
        }
    }

    /// The wire code carried by this error, if it maps onto one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Stream { code, .. } | Error::Connection { code, .. } => Some(*code),
            Error::Canceled => Some(ErrorCode::Canceled),
            _ => None,
        }
    }

    /// Code to put on an outgoing stream-level ERROR frame for this error.
    pub(crate) fn stream_code(&self) -> ErrorCode {
        match self.code() {
            Some(code) if code.is_stream_code() => code,
            _ => ErrorCode::ApplicationError,
        }
    }
}
