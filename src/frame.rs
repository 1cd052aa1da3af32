use crate::{flags::Flags, payload::Payload, types::*};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::FromPrimitive;

/// One RSocket frame, minus the transport's length delimiting.
///
/// The codec is stateless: `decode` consumes exactly one whole frame (the
/// transport adapter owns frame boundaries) and `encode` appends one. All
/// multi-byte integers are big-endian per the wire spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Setup {
        version: Version,
        lease: bool,
        keepalive_interval: u32,
        max_lifetime: u32,
        resume_token: Option<Bytes>,
        metadata_mime: Bytes,
        data_mime: Bytes,
        payload: Payload,
    },
    Lease {
        ttl_ms: u32,
        number_of_requests: u32,
        metadata: Option<Bytes>,
    },
    Keepalive {
        respond: bool,
        last_received_position: u64,
        data: Bytes,
    },
    RequestResponse {
        stream_id: StreamId,
        follows: bool,
        payload: Payload,
    },
    RequestFnf {
        stream_id: StreamId,
        follows: bool,
        payload: Payload,
    },
    RequestStream {
        stream_id: StreamId,
        follows: bool,
        initial_request_n: u32,
        payload: Payload,
    },
    RequestChannel {
        stream_id: StreamId,
        follows: bool,
        complete: bool,
        initial_request_n: u32,
        payload: Payload,
    },
    RequestN {
        stream_id: StreamId,
        n: u32,
    },
    Cancel {
        stream_id: StreamId,
    },
    Payload {
        stream_id: StreamId,
        follows: bool,
        complete: bool,
        next: bool,
        payload: Payload,
    },
    Error {
        stream_id: StreamId,
        code: ErrorCode,
        data: Bytes,
    },
    MetadataPush {
        metadata: Bytes,
    },
    /// Resumption is not supported; the body is discarded on decode and the
    /// connection answers with REJECTED_RESUME.
    Resume,
    ResumeOk,
}

impl Frame {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::RequestResponse { stream_id, .. }
            | Frame::RequestFnf { stream_id, .. }
            | Frame::RequestStream { stream_id, .. }
            | Frame::RequestChannel { stream_id, .. }
            | Frame::RequestN { stream_id, .. }
            | Frame::Cancel { stream_id }
            | Frame::Payload { stream_id, .. }
            | Frame::Error { stream_id, .. } => *stream_id,
            _ => 0,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Setup { .. } => FrameType::Setup,
            Frame::Lease { .. } => FrameType::Lease,
            Frame::Keepalive { .. } => FrameType::Keepalive,
            Frame::RequestResponse { .. } => FrameType::RequestResponse,
            Frame::RequestFnf { .. } => FrameType::RequestFnf,
            Frame::RequestStream { .. } => FrameType::RequestStream,
            Frame::RequestChannel { .. } => FrameType::RequestChannel,
            Frame::RequestN { .. } => FrameType::RequestN,
            Frame::Cancel { .. } => FrameType::Cancel,
            Frame::Payload { .. } => FrameType::Payload,
            Frame::Error { .. } => FrameType::Error,
            Frame::MetadataPush { .. } => FrameType::MetadataPush,
            Frame::Resume => FrameType::Resume,
            Frame::ResumeOk => FrameType::ResumeOk,
        }
    }

    /// True for the four request types that open a new stream.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Frame::RequestResponse { .. }
                | Frame::RequestFnf { .. }
                | Frame::RequestStream { .. }
                | Frame::RequestChannel { .. }
        )
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        match self {
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
                let mut flags = payload_flags(payload);
                if *lease {
                    flags |= Flags::LEASE;
                }
                if resume_token.is_some() {
                    flags |= Flags::RESUME;
                }
                put_header(buf, 0, FrameType::Setup, flags);
                buf.put_u16(version.major);
                buf.put_u16(version.minor);
                buf.put_u32(keepalive_interval & MAX_U31);
                buf.put_u32(max_lifetime & MAX_U31);
                if let Some(token) = resume_token {
                    buf.put_u16(token.len() as u16);
                    buf.put_slice(token);
                }
                buf.put_u8(metadata_mime.len() as u8);
                buf.put_slice(metadata_mime);
                buf.put_u8(data_mime.len() as u8);
                buf.put_slice(data_mime);
                put_payload(buf, payload);
            }
            Frame::Lease {
                ttl_ms,
                number_of_requests,
                metadata,
            } => {
                let mut flags = Flags::empty();
                if metadata.is_some() {
                    flags |= Flags::METADATA;
                }
                put_header(buf, 0, FrameType::Lease, flags);
                buf.put_u32(ttl_ms & MAX_U31);
                buf.put_u32(number_of_requests & MAX_U31);
                // LEASE metadata has no length prefix; it runs to the end of the frame
                if let Some(metadata) = metadata {
                    buf.put_slice(metadata);
                }
            }
            Frame::Keepalive {
                respond,
                last_received_position,
                data,
            } => {
                let flags = if *respond { Flags::RESPOND } else { Flags::empty() };
                put_header(buf, 0, FrameType::Keepalive, flags);
                buf.put_u64(last_received_position & MAX_U63);
                buf.put_slice(data);
            }
            Frame::RequestResponse {
                stream_id,
                follows,
                payload,
            } => {
                let mut flags = payload_flags(payload);
                if *follows {
                    flags |= Flags::FOLLOWS;
                }
                put_header(buf, *stream_id, FrameType::RequestResponse, flags);
                put_payload(buf, payload);
            }
            Frame::RequestFnf {
                stream_id,
                follows,
                payload,
            } => {
                let mut flags = payload_flags(payload);
                if *follows {
                    flags |= Flags::FOLLOWS;
                }
                put_header(buf, *stream_id, FrameType::RequestFnf, flags);
                put_payload(buf, payload);
            }
            Frame::RequestStream {
                stream_id,
                follows,
                initial_request_n,
                payload,
            } => {
                let mut flags = payload_flags(payload);
                if *follows {
                    flags |= Flags::FOLLOWS;
                }
                put_header(buf, *stream_id, FrameType::RequestStream, flags);
                buf.put_u32(initial_request_n & MAX_U31);
                put_payload(buf, payload);
            }
            Frame::RequestChannel {
                stream_id,
                follows,
                complete,
                initial_request_n,
                payload,
            } => {
                let mut flags = payload_flags(payload);
                if *follows {
                    flags |= Flags::FOLLOWS;
                }
                if *complete {
                    flags |= Flags::COMPLETE;
                }
                put_header(buf, *stream_id, FrameType::RequestChannel, flags);
                buf.put_u32(initial_request_n & MAX_U31);
                put_payload(buf, payload);
            }
            Frame::RequestN { stream_id, n } => {
                put_header(buf, *stream_id, FrameType::RequestN, Flags::empty());
                buf.put_u32(n & MAX_U31);
            }
            Frame::Cancel { stream_id } => {
                put_header(buf, *stream_id, FrameType::Cancel, Flags::empty());
            }
            Frame::Payload {
                stream_id,
                follows,
                complete,
                next,
                payload,
            } => {
                let mut flags = payload_flags(payload);
                if *follows {
                    flags |= Flags::FOLLOWS;
                }
                if *complete {
                    flags |= Flags::COMPLETE;
                }
                if *next {
                    flags |= Flags::NEXT;
                }
                put_header(buf, *stream_id, FrameType::Payload, flags);
                put_payload(buf, payload);
            }
            Frame::Error {
                stream_id,
                code,
                data,
            } => {
                put_header(buf, *stream_id, FrameType::Error, Flags::empty());
                buf.put_u32(*code as u32);
                buf.put_slice(data);
            }
            Frame::MetadataPush { metadata } => {
                put_header(buf, 0, FrameType::MetadataPush, Flags::METADATA);
                // no length prefix; metadata runs to the end of the frame
                buf.put_slice(metadata);
            }
            // Never sent by this implementation; header only.
            Frame::Resume => put_header(buf, 0, FrameType::Resume, Flags::empty()),
            Frame::ResumeOk => put_header(buf, 0, FrameType::ResumeOk, Flags::empty()),
        }
    }

    /// Exact number of bytes `encode` will append.
    pub fn encoded_len(&self) -> usize {
        const HEADER: usize = 6;
        HEADER
            + match self {
                Frame::Setup {
                    resume_token,
                    metadata_mime,
                    data_mime,
                    payload,
                    ..
                } => {
                    4 + 4
                        + 4
                        + resume_token.as_ref().map_or(0, |t| 2 + t.len())
                        + 1
                        + metadata_mime.len()
                        + 1
                        + data_mime.len()
                        + payload_len(payload)
                }
                Frame::Lease { metadata, .. } => 8 + metadata.as_ref().map_or(0, Bytes::len),
                Frame::Keepalive { data, .. } => 8 + data.len(),
                Frame::RequestResponse { payload, .. } | Frame::RequestFnf { payload, .. } => {
                    payload_len(payload)
                }
                Frame::RequestStream { payload, .. } | Frame::RequestChannel { payload, .. } => {
                    4 + payload_len(payload)
                }
                Frame::RequestN { .. } => 4,
                Frame::Cancel { .. } => 0,
                Frame::Payload { payload, .. } => payload_len(payload),
                Frame::Error { data, .. } => 4 + data.len(),
                Frame::MetadataPush { metadata } => metadata.len(),
                Frame::Resume | Frame::ResumeOk => 0,
            }
    }

    /// Decode one whole frame. `buf` must hold exactly the frame's bytes.
    pub fn decode(buf: &mut Bytes) -> Result<Frame, FrameDecodeError> {
        let raw_id = take_u32(buf)?;
        if raw_id & !MAX_U31 != 0 {
            return Err(FrameDecodeError::ReservedBitSet);
        }
        let word = take_u16(buf)?;
        let flags = Flags::from_bits_truncate(word & Flags::MASK);
        let frame_type = FrameType::from_u8((word >> 10) as u8).ok_or(
            FrameDecodeError::UnknownType {
                bits: word,
                ignorable: flags.contains(Flags::IGNORE),
            },
        )?;
        check_stream_id(frame_type, raw_id)?;

        match frame_type {
            FrameType::Setup => {
                let version = Version {
                    major: take_u16(buf)?,
                    minor: take_u16(buf)?,
                };
                let keepalive_interval = take_u31(buf)?;
                let max_lifetime = take_u31(buf)?;
                let resume_token = if flags.contains(Flags::RESUME) {
                    let len = take_u16(buf)? as usize;
                    Some(take_bytes(buf, len)?)
                } else {
                    None
                };
                let metadata_mime_len = take_u8(buf)? as usize;
                let metadata_mime = take_bytes(buf, metadata_mime_len)?;
                let data_mime_len = take_u8(buf)? as usize;
                let data_mime = take_bytes(buf, data_mime_len)?;
                let payload = take_payload(buf, flags)?;
                Ok(Frame::Setup {
                    version,
                    lease: flags.contains(Flags::LEASE),
                    keepalive_interval,
                    max_lifetime,
                    resume_token,
                    metadata_mime,
                    data_mime,
                    payload,
                })
            }
            FrameType::Lease => {
                let ttl_ms = take_u31(buf)?;
                let number_of_requests = take_u31(buf)?;
                let metadata = if flags.contains(Flags::METADATA) {
                    Some(take_rest(buf))
                } else {
                    None
                };
                Ok(Frame::Lease {
                    ttl_ms,
                    number_of_requests,
                    metadata,
                })
            }
            FrameType::Keepalive => Ok(Frame::Keepalive {
                respond: flags.contains(Flags::RESPOND),
                last_received_position: take_u64(buf)? & MAX_U63,
                data: take_rest(buf),
            }),
            FrameType::RequestResponse => Ok(Frame::RequestResponse {
                stream_id: raw_id,
                follows: flags.contains(Flags::FOLLOWS),
                payload: take_payload(buf, flags)?,
            }),
            FrameType::RequestFnf => Ok(Frame::RequestFnf {
                stream_id: raw_id,
                follows: flags.contains(Flags::FOLLOWS),
                payload: take_payload(buf, flags)?,
            }),
            FrameType::RequestStream => {
                let initial_request_n = take_u31(buf)?;
                if initial_request_n == 0 {
                    return Err(FrameDecodeError::ZeroRequestN);
                }
                Ok(Frame::RequestStream {
                    stream_id: raw_id,
                    follows: flags.contains(Flags::FOLLOWS),
                    initial_request_n,
                    payload: take_payload(buf, flags)?,
                })
            }
            FrameType::RequestChannel => {
                let initial_request_n = take_u31(buf)?;
                if initial_request_n == 0 {
                    return Err(FrameDecodeError::ZeroRequestN);
                }
                Ok(Frame::RequestChannel {
                    stream_id: raw_id,
                    follows: flags.contains(Flags::FOLLOWS),
                    complete: flags.contains(Flags::COMPLETE),
                    initial_request_n,
                    payload: take_payload(buf, flags)?,
                })
            }
            FrameType::RequestN => {
                let n = take_u31(buf)?;
                if n == 0 {
                    return Err(FrameDecodeError::ZeroRequestN);
                }
                Ok(Frame::RequestN {
                    stream_id: raw_id,
                    n,
                })
            }
            FrameType::Cancel => Ok(Frame::Cancel { stream_id: raw_id }),
            FrameType::Payload => {
                let follows = flags.contains(Flags::FOLLOWS);
                let complete = flags.contains(Flags::COMPLETE);
                let next = flags.contains(Flags::NEXT);
                if !follows && !complete && !next {
                    return Err(FrameDecodeError::MissingPayloadFlags);
                }
                Ok(Frame::Payload {
                    stream_id: raw_id,
                    follows,
                    complete,
                    next,
                    payload: take_payload(buf, flags)?,
                })
            }
            FrameType::Error => {
                let raw_code = take_u32(buf)?;
                let code = ErrorCode::from_u32(raw_code)
                    .ok_or(FrameDecodeError::UnknownErrorCode(raw_code))?;
                check_error_stream_id(code, raw_id)?;
                Ok(Frame::Error {
                    stream_id: raw_id,
                    code,
                    data: take_rest(buf),
                })
            }
            FrameType::MetadataPush => Ok(Frame::MetadataPush {
                metadata: take_rest(buf),
            }),
            FrameType::Resume => {
                let _ = take_rest(buf);
                Ok(Frame::Resume)
            }
            FrameType::ResumeOk => {
                let _ = take_rest(buf);
                Ok(Frame::ResumeOk)
            }
            FrameType::Ext => Err(FrameDecodeError::UnsupportedExtension {
                ignorable: flags.contains(Flags::IGNORE),
            }),
        }
    }
}

fn put_header(buf: &mut BytesMut, stream_id: StreamId, frame_type: FrameType, flags: Flags) {
    buf.put_u32(stream_id & MAX_U31);
    buf.put_u16((u16::from(frame_type as u8) << 10) | (flags.bits() & Flags::MASK));
}

fn payload_flags(payload: &Payload) -> Flags {
    if payload.metadata().is_some() {
        Flags::METADATA
    } else {
        Flags::empty()
    }
}

fn put_payload(buf: &mut BytesMut, payload: &Payload) {
    if let Some(metadata) = payload.metadata() {
        buf.put_uint(metadata.len() as u64, 3);
        buf.put_slice(metadata);
    }
    buf.put_slice(payload.data());
}

/// Encoded size of a payload including the 24-bit metadata length when present.
fn payload_len(payload: &Payload) -> usize {
    payload.metadata().map_or(0, |m| 3 + m.len()) + payload.data().len()
}

fn check_stream_id(frame_type: FrameType, stream_id: StreamId) -> Result<(), FrameDecodeError> {
    match frame_type {
        FrameType::Setup
        | FrameType::Lease
        | FrameType::Keepalive
        | FrameType::MetadataPush
        | FrameType::Resume
        | FrameType::ResumeOk => {
            if stream_id != 0 {
                return Err(FrameDecodeError::InvalidStreamId {
                    expected: "0",
                    found: stream_id,
                });
            }
        }
        FrameType::RequestResponse
        | FrameType::RequestFnf
        | FrameType::RequestStream
        | FrameType::RequestChannel
        | FrameType::RequestN
        | FrameType::Cancel
        | FrameType::Payload => {
            if stream_id == 0 {
                return Err(FrameDecodeError::InvalidStreamId {
                    expected: "> 0",
                    found: stream_id,
                });
            }
        }
        // ERROR is validated against its code, EXT is rejected before this matters
        FrameType::Error | FrameType::Ext => {}
    }
    Ok(())
}

fn check_error_stream_id(code: ErrorCode, stream_id: StreamId) -> Result<(), FrameDecodeError> {
    if code.is_connection_code() && stream_id != 0 {
        return Err(FrameDecodeError::InvalidStreamId {
            expected: "0",
            found: stream_id,
        });
    }
    if code.is_stream_code() && stream_id == 0 {
        return Err(FrameDecodeError::InvalidStreamId {
            expected: "> 0",
            found: stream_id,
        });
    }
    Ok(())
}

fn take_u8(buf: &mut Bytes) -> Result<u8, FrameDecodeError> {
    if buf.remaining() < 1 {
        return Err(FrameDecodeError::Incomplete);
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut Bytes) -> Result<u16, FrameDecodeError> {
    if buf.remaining() < 2 {
        return Err(FrameDecodeError::Incomplete);
    }
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut Bytes) -> Result<u32, FrameDecodeError> {
    if buf.remaining() < 4 {
        return Err(FrameDecodeError::Incomplete);
    }
    Ok(buf.get_u32())
}

fn take_u31(buf: &mut Bytes) -> Result<u32, FrameDecodeError> {
    Ok(take_u32(buf)? & MAX_U31)
}

fn take_u64(buf: &mut Bytes) -> Result<u64, FrameDecodeError> {
    if buf.remaining() < 8 {
        return Err(FrameDecodeError::Incomplete);
    }
    Ok(buf.get_u64())
}

fn take_u24(buf: &mut Bytes) -> Result<u32, FrameDecodeError> {
    if buf.remaining() < 3 {
        return Err(FrameDecodeError::Incomplete);
    }
    Ok(buf.get_uint(3) as u32)
}

fn take_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes, FrameDecodeError> {
    if buf.remaining() < len {
        return Err(FrameDecodeError::Incomplete);
    }
    Ok(buf.split_to(len))
}

fn take_rest(buf: &mut Bytes) -> Bytes {
    buf.split_to(buf.len())
}

fn take_payload(buf: &mut Bytes, flags: Flags) -> Result<Payload, FrameDecodeError> {
    let metadata = if flags.contains(Flags::METADATA) {
        let len = take_u24(buf)? as usize;
        Some(take_bytes(buf, len)?)
    } else {
        None
    };
    Ok(Payload {
        metadata,
        data: take_rest(buf),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), frame.encoded_len(), "encoded_len of {frame:?}");
        let mut bytes = buf.freeze();
        let decoded = Frame::decode(&mut bytes).unwrap();
        assert!(bytes.is_empty(), "decode left {} bytes", bytes.len());
        decoded
    }

    fn sample_payload() -> Payload {
        Payload::builder()
            .set_metadata("meta")
            .set_data("data!")
            .build()
    }

    #[test]
    fn setup() {
        let frame = Frame::Setup {
            version: Version::CURRENT,
            lease: true,
            keepalive_interval: 30_000,
            max_lifetime: 90_000,
            resume_token: None,
            metadata_mime: Bytes::from_static(b"application/json"),
            data_mime: Bytes::from_static(b"application/json"),
            payload: sample_payload(),
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn setup_with_resume_token() {
        let frame = Frame::Setup {
            version: Version { major: 1, minor: 2 },
            lease: false,
            keepalive_interval: 500,
            max_lifetime: 2_000,
            resume_token: Some(Bytes::from_static(b"token")),
            metadata_mime: Bytes::from_static(b"application/binary"),
            data_mime: Bytes::from_static(b"application/binary"),
            payload: Payload::default(),
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn lease() {
        let frame = Frame::Lease {
            ttl_ms: 1_000,
            number_of_requests: 2,
            metadata: Some(Bytes::from_static(b"why")),
        };
        assert_eq!(round_trip(frame.clone()), frame);

        let bare = Frame::Lease {
            ttl_ms: 1_000,
            number_of_requests: 2,
            metadata: None,
        };
        assert_eq!(round_trip(bare.clone()), bare);
    }

    #[test]
    fn keepalive() {
        let frame = Frame::Keepalive {
            respond: true,
            last_received_position: 0,
            data: Bytes::from_static(b"beat"),
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn requests() {
        let frames = vec![
            Frame::RequestResponse {
                stream_id: 1,
                follows: false,
                payload: sample_payload(),
            },
            Frame::RequestFnf {
                stream_id: 3,
                follows: true,
                payload: Payload::new("fnf"),
            },
            Frame::RequestStream {
                stream_id: 5,
                follows: false,
                initial_request_n: 2,
                payload: sample_payload(),
            },
            Frame::RequestChannel {
                stream_id: 7,
                follows: false,
                complete: true,
                initial_request_n: 1,
                payload: Payload::new("first"),
            },
        ];
        for frame in frames {
            assert_eq!(round_trip(frame.clone()), frame);
        }
    }

    #[test]
    fn payload_flag_combinations() {
        for (next, complete, follows) in [
            (true, false, false),
            (true, true, false),
            (false, true, false),
            (true, false, true),
            (false, false, true),
        ] {
            let frame = Frame::Payload {
                stream_id: 1,
                follows,
                complete,
                next,
                payload: if next { sample_payload() } else { Payload::default() },
            };
            assert_eq!(round_trip(frame.clone()), frame);
        }
    }

    #[test]
    fn payload_without_flags_is_rejected() {
        let frame = Frame::Payload {
            stream_id: 1,
            follows: false,
            complete: false,
            next: false,
            payload: Payload::default(),
        };
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(
            Frame::decode(&mut buf.freeze()),
            Err(FrameDecodeError::MissingPayloadFlags)
        );
    }

    #[test]
    fn request_n_and_cancel() {
        let frame = Frame::RequestN { stream_id: 9, n: 3 };
        assert_eq!(round_trip(frame.clone()), frame);
        let frame = Frame::Cancel { stream_id: 9 };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn zero_request_n_is_rejected() {
        let mut buf = BytesMut::new();
        Frame::RequestN { stream_id: 1, n: 0 }.encode(&mut buf);
        assert_eq!(
            Frame::decode(&mut buf.freeze()),
            Err(FrameDecodeError::ZeroRequestN)
        );
    }

    #[test]
    fn error_frames() {
        let frame = Frame::Error {
            stream_id: 0,
            code: ErrorCode::ConnectionClose,
            data: Bytes::from_static(b"bye"),
        };
        assert_eq!(round_trip(frame.clone()), frame);

        let frame = Frame::Error {
            stream_id: 7,
            code: ErrorCode::ApplicationError,
            data: Bytes::from_static(b"oops"),
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn error_code_stream_id_mismatch() {
        let mut buf = BytesMut::new();
        // CONNECTION_ERROR belongs on stream 0; force it onto stream 1
        put_header(&mut buf, 1, FrameType::Error, Flags::empty());
        buf.put_u32(ErrorCode::ConnectionError as u32);
        assert!(matches!(
            Frame::decode(&mut buf.freeze()),
            Err(FrameDecodeError::InvalidStreamId { expected: "0", .. })
        ));
    }

    #[test]
    fn metadata_push() {
        let frame = Frame::MetadataPush {
            metadata: Bytes::from_static(b"routing"),
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn connection_frames_insist_on_stream_zero() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, 4, FrameType::Keepalive, Flags::RESPOND);
        buf.put_u64(0);
        assert!(matches!(
            Frame::decode(&mut buf.freeze()),
            Err(FrameDecodeError::InvalidStreamId { expected: "0", .. })
        ));
    }

    #[test]
    fn reserved_bit_must_be_zero() {
        let mut buf = BytesMut::new();
        buf.put_u32(0x8000_0001);
        buf.put_u16(u16::from(FrameType::Cancel as u8) << 10);
        assert_eq!(
            Frame::decode(&mut buf.freeze()),
            Err(FrameDecodeError::ReservedBitSet)
        );
    }

    #[test]
    fn unknown_type_reports_ignore_bit() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u16((0x1F << 10) | Flags::IGNORE.bits());
        match Frame::decode(&mut buf.freeze()) {
            Err(err @ FrameDecodeError::UnknownType { .. }) => assert!(err.can_ignore()),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn resume_body_is_discarded() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, 0, FrameType::Resume, Flags::empty());
        buf.put_slice(b"resume state we do not understand");
        assert_eq!(Frame::decode(&mut buf.freeze()), Ok(Frame::Resume));
    }

    #[test]
    fn empty_metadata_is_preserved() {
        let frame = Frame::Payload {
            stream_id: 1,
            follows: false,
            complete: false,
            next: true,
            payload: Payload::builder()
                .set_metadata(Bytes::new())
                .set_data("d")
                .build(),
        };
        let decoded = round_trip(frame.clone());
        assert_eq!(decoded, frame);
        if let Frame::Payload { payload, .. } = decoded {
            assert_eq!(payload.metadata().map(Bytes::len), Some(0));
        }
    }
}
