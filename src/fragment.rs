use crate::{frame::Frame, payload::Payload, types::StreamId};
use bytes::BytesMut;

const HEADER: usize = 6;

/// Split `frame` so no encoded fragment exceeds `mtu` bytes. `mtu` of 0
/// disables fragmentation. Only the request frames and PAYLOAD can carry
/// the FOLLOWS flag; every other frame passes through untouched.
///
/// Continuation fragments are PAYLOAD frames with NEXT set (a receiver in a
/// reassembly sequence ignores it); the logical COMPLETE flag travels on the
/// final fragment so the peer cannot terminate early.
pub(crate) fn fragment(frame: Frame, mtu: usize) -> Vec<Frame> {
    if mtu == 0 || frame.encoded_len() <= mtu {
        return vec![frame];
    }
    match frame {
        Frame::RequestResponse {
            stream_id, payload, ..
        } => {
            let parts = split_payload(payload, mtu - HEADER, mtu - HEADER);
            assemble(stream_id, parts, false, |payload, follows| {
                Frame::RequestResponse {
                    stream_id,
                    follows,
                    payload,
                }
            })
        }
        Frame::RequestFnf {
            stream_id, payload, ..
        } => {
            let parts = split_payload(payload, mtu - HEADER, mtu - HEADER);
            assemble(stream_id, parts, false, |payload, follows| Frame::RequestFnf {
                stream_id,
                follows,
                payload,
            })
        }
        Frame::RequestStream {
            stream_id,
            initial_request_n,
            payload,
            ..
        } => {
            let parts = split_payload(payload, mtu - HEADER - 4, mtu - HEADER);
            assemble(stream_id, parts, false, |payload, follows| {
                Frame::RequestStream {
                    stream_id,
                    follows,
                    initial_request_n,
                    payload,
                }
            })
        }
        Frame::RequestChannel {
            stream_id,
            complete,
            initial_request_n,
            payload,
            ..
        } => {
            let parts = split_payload(payload, mtu - HEADER - 4, mtu - HEADER);
            assemble(stream_id, parts, complete, |payload, follows| {
                Frame::RequestChannel {
                    stream_id,
                    follows,
                    complete: false,
                    initial_request_n,
                    payload,
                }
            })
        }
        Frame::Payload {
            stream_id,
            complete,
            next,
            payload,
            ..
        } => {
            let parts = split_payload(payload, mtu - HEADER, mtu - HEADER);
            assemble(stream_id, parts, complete, |payload, follows| Frame::Payload {
                stream_id,
                follows,
                complete: false,
                next,
                payload,
            })
        }
        other => vec![other],
    }
}

/// Cut a payload into slices that each fit their fragment's budget, metadata
/// exhausted before any data. A slice carrying metadata pays the 3-byte
/// length prefix out of its own budget.
fn split_payload(payload: Payload, head_capacity: usize, cont_capacity: usize) -> Vec<Payload> {
    let (metadata, data) = payload.split();
    let mut metadata_left = metadata;
    let mut data_left = data;
    let mut parts = Vec::new();
    let mut first = true;

    loop {
        let mut budget = if first { head_capacity } else { cont_capacity };
        first = false;

        let chunk_metadata = match metadata_left.as_mut() {
            Some(m) => {
                let take = m.len().min(budget.saturating_sub(3));
                budget = budget.saturating_sub(3 + take);
                let slice = m.split_to(take);
                if m.is_empty() {
                    metadata_left = None;
                }
                Some(slice)
            }
            None => None,
        };
        let take = data_left.len().min(budget);
        let chunk_data = data_left.split_to(take);

        let made_progress = chunk_metadata.as_ref().map_or(false, |m| !m.is_empty())
            || !chunk_data.is_empty()
            || parts.is_empty();
        parts.push(Payload {
            metadata: chunk_metadata,
            data: chunk_data,
        });

        if metadata_left.is_none() && data_left.is_empty() {
            return parts;
        }
        if !made_progress {
            // budget smaller than the metadata length prefix; ship the rest whole
            parts.push(Payload {
                metadata: metadata_left.take(),
                data: std::mem::take(&mut data_left),
            });
            return parts;
        }
    }
}

fn assemble(
    stream_id: StreamId,
    mut parts: Vec<Payload>,
    complete: bool,
    head: impl FnOnce(Payload, bool) -> Frame,
) -> Vec<Frame> {
    let count = parts.len();
    debug_assert!(count > 1);
    let mut frames = Vec::with_capacity(count);
    let mut iter = parts.drain(..);
    if let Some(first) = iter.next() {
        frames.push(head(first, count > 1));
    }
    for (i, part) in iter.enumerate() {
        let last = i == count - 2;
        frames.push(Frame::Payload {
            stream_id,
            follows: !last,
            complete: complete && last,
            next: true,
            payload: part,
        });
    }
    frames
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub(crate) enum ReassemblyError {
    #[error("reassembly buffer limit exceeded")]
    Overflow,
    #[error("metadata fragment arrived after data began")]
    MetadataAfterData,
}

/// Accumulates one stream's fragment sequence up to a byte limit.
///
/// Holds the head frame with its payload drained into the buffers; the final
/// fragment (FOLLOWS cleared) rebuilds the logical frame.
#[derive(Debug)]
pub(crate) struct Reassembler {
    head: Frame,
    metadata: BytesMut,
    data: BytesMut,
    has_metadata: bool,
    data_started: bool,
    limit: usize,
}

impl Reassembler {
    pub fn new(mut head: Frame, limit: usize) -> Result<Self, ReassemblyError> {
        let payload = match &mut head {
            Frame::RequestResponse { payload, .. }
            | Frame::RequestFnf { payload, .. }
            | Frame::RequestStream { payload, .. }
            | Frame::RequestChannel { payload, .. }
            | Frame::Payload { payload, .. } => std::mem::take(payload),
            _ => Payload::default(),
        };
        let mut this = Self {
            head,
            metadata: BytesMut::new(),
            data: BytesMut::new(),
            has_metadata: false,
            data_started: false,
            limit,
        };
        this.absorb(payload)?;
        Ok(this)
    }

    /// Feed a continuation fragment. Returns the reassembled logical frame
    /// once the final fragment (FOLLOWS cleared) arrives.
    pub fn push(
        &mut self,
        follows: bool,
        complete: bool,
        payload: Payload,
    ) -> Result<Option<Frame>, ReassemblyError> {
        self.absorb(payload)?;
        if follows {
            return Ok(None);
        }
        let assembled = Payload {
            metadata: self
                .has_metadata
                .then(|| std::mem::take(&mut self.metadata).freeze()),
            data: std::mem::take(&mut self.data).freeze(),
        };
        let mut frame = self.head.clone();
        match &mut frame {
            Frame::RequestResponse {
                follows, payload, ..
            }
            | Frame::RequestFnf {
                follows, payload, ..
            }
            | Frame::RequestStream {
                follows, payload, ..
            } => {
                *follows = false;
                *payload = assembled;
            }
            Frame::RequestChannel {
                follows,
                complete: head_complete,
                payload,
                ..
            }
            | Frame::Payload {
                follows,
                complete: head_complete,
                payload,
                ..
            } => {
                *follows = false;
                *head_complete |= complete;
                *payload = assembled;
            }
            _ => {}
        }
        Ok(Some(frame))
    }

    fn absorb(&mut self, payload: Payload) -> Result<(), ReassemblyError> {
        let (metadata, data) = payload.split();
        if let Some(metadata) = metadata {
            if self.data_started {
                return Err(ReassemblyError::MetadataAfterData);
            }
            self.has_metadata = true;
            self.metadata.extend_from_slice(&metadata);
        }
        if !data.is_empty() {
            self.data_started = true;
            self.data.extend_from_slice(&data);
        }
        if self.metadata.len() + self.data.len() > self.limit {
            return Err(ReassemblyError::Overflow);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};

    fn bytes_of(len: usize, seed: u8) -> Bytes {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect::<Vec<_>>().into()
    }

    fn reassemble(frames: Vec<Frame>, limit: usize) -> Frame {
        let mut iter = frames.into_iter();
        let head = iter.next().unwrap();
        let mut reassembler = Reassembler::new(head, limit).unwrap();
        let mut out = None;
        for frame in iter {
            let Frame::Payload {
                follows,
                complete,
                payload,
                ..
            } = frame
            else {
                panic!("continuation must be PAYLOAD");
            };
            out = reassembler.push(follows, complete, payload).unwrap();
        }
        out.expect("sequence did not terminate")
    }

    #[test]
    fn round_trips_across_mtus() {
        for mtu in [64, 100, 128, 1024] {
            let original = Frame::RequestStream {
                stream_id: 5,
                follows: false,
                initial_request_n: 10,
                payload: Payload {
                    metadata: Some(bytes_of(300, 7)),
                    data: bytes_of(1000, 42),
                },
            };
            let frames = fragment(original.clone(), mtu);
            assert!(frames.len() > 1, "mtu {mtu} produced one frame");
            for frame in &frames {
                assert!(frame.encoded_len() <= mtu, "mtu {mtu} exceeded");
            }
            assert_eq!(reassemble(frames, 1 << 20), original);
        }
    }

    #[test]
    fn complete_rides_on_final_fragment() {
        let original = Frame::Payload {
            stream_id: 3,
            follows: false,
            complete: true,
            next: true,
            payload: Payload {
                metadata: None,
                data: bytes_of(500, 1),
            },
        };
        let frames = fragment(original.clone(), 128);
        let last = frames.last().unwrap();
        assert!(matches!(
            last,
            Frame::Payload {
                follows: false,
                complete: true,
                ..
            }
        ));
        for frame in &frames[..frames.len() - 1] {
            match frame {
                Frame::Payload { follows, complete, .. } => {
                    assert!(follows);
                    assert!(!complete);
                }
                _ => panic!("unexpected head type"),
            }
        }
        assert_eq!(reassemble(frames, 1 << 20), original);
    }

    #[test]
    fn hundred_kib_at_sixteen_kib_mtu() {
        let original = Frame::RequestResponse {
            stream_id: 1,
            follows: false,
            payload: Payload {
                metadata: None,
                data: bytes_of(100 * 1024, 0),
            },
        };
        let frames = fragment(original.clone(), 16 * 1024);
        // head carries mtu-6 bytes, each continuation likewise
        assert_eq!(frames.len(), 7);
        assert!(matches!(frames[0], Frame::RequestResponse { follows: true, .. }));
        assert!(matches!(frames[6], Frame::Payload { follows: false, .. }));
        assert_eq!(reassemble(frames, 1 << 20), original);
    }

    #[test]
    fn metadata_is_exhausted_before_data() {
        let original = Frame::RequestFnf {
            stream_id: 9,
            follows: false,
            payload: Payload {
                metadata: Some(bytes_of(150, 3)),
                data: bytes_of(150, 9),
            },
        };
        let frames = fragment(original.clone(), 100);
        let mut seen_data = false;
        for frame in &frames {
            let payload = match frame {
                Frame::RequestFnf { payload, .. } | Frame::Payload { payload, .. } => payload,
                _ => panic!("unexpected frame"),
            };
            if payload.metadata().is_some() {
                assert!(!seen_data, "metadata after data began");
            }
            if !payload.data().is_empty() {
                seen_data = true;
            }
        }
        assert_eq!(reassemble(frames, 1 << 20), original);
    }

    #[test]
    fn small_frames_pass_through() {
        let frame = Frame::RequestN { stream_id: 1, n: 5 };
        assert_eq!(fragment(frame.clone(), 64), vec![frame]);
        let frame = Frame::RequestFnf {
            stream_id: 1,
            follows: false,
            payload: Payload::new("tiny"),
        };
        assert_eq!(fragment(frame.clone(), 1024), vec![frame]);
    }

    #[test]
    fn overflow_is_reported() {
        let head = Frame::RequestResponse {
            stream_id: 1,
            follows: true,
            payload: Payload {
                metadata: None,
                data: bytes_of(64, 0),
            },
        };
        let mut reassembler = Reassembler::new(head, 100).unwrap();
        assert_eq!(
            reassembler.push(true, false, Payload::new(bytes_of(64, 1))),
            Err(ReassemblyError::Overflow)
        );
    }

    #[test]
    fn metadata_after_data_is_rejected() {
        let head = Frame::RequestResponse {
            stream_id: 1,
            follows: true,
            payload: Payload::new(bytes_of(8, 0)),
        };
        let mut reassembler = Reassembler::new(head, 1 << 20).unwrap();
        let late_metadata = Payload {
            metadata: Some(bytes_of(4, 0)),
            data: Bytes::new(),
        };
        assert_eq!(
            reassembler.push(true, false, late_metadata),
            Err(ReassemblyError::MetadataAfterData)
        );
    }

    #[test]
    fn fragments_decode_as_wire_frames() {
        let original = Frame::Payload {
            stream_id: 2,
            follows: false,
            complete: true,
            next: true,
            payload: Payload {
                metadata: Some(bytes_of(40, 5)),
                data: bytes_of(200, 6),
            },
        };
        for frame in fragment(original, 64) {
            let mut buf = BytesMut::new();
            frame.encode(&mut buf);
            assert_eq!(Frame::decode(&mut buf.freeze()).unwrap(), frame);
        }
    }
}
