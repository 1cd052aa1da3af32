use crate::stream::Stream;
use crate::types::*;
use log::trace;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Allocator for locally initiated stream ids: odd for the client, even for
/// the server, stepping by two, never reused. Shared between the requester
/// facade and the connection loop.
pub(crate) struct StreamIds {
    next: AtomicU32,
}

impl StreamIds {
    pub fn for_side(side: Side) -> Self {
        Self {
            next: AtomicU32::new(match side {
                Side::Client => 1,
                Side::Server => 2,
            }),
        }
    }

    pub fn next(&self) -> Option<StreamId> {
        let id = self.next.fetch_add(2, Ordering::SeqCst);
        if id == 0 || id > MAX_U31 {
            return None;
        }
        Some(id)
    }
}

/// Maps live stream ids to their state and remembers recently terminated ids
/// so late frames from the peer are swallowed instead of being mistaken for
/// protocol violations.
pub(crate) struct StreamRegistry {
    streams: HashMap<StreamId, Stream>,
    tombstones: HashSet<StreamId>,
    expiry: VecDeque<(Instant, StreamId)>,
    horizon: Duration,
    peer_parity: u32,
}

impl StreamRegistry {
    /// `horizon` bounds how long a terminated id keeps swallowing frames.
    pub fn new(side: Side, horizon: Duration) -> Self {
        Self {
            streams: HashMap::new(),
            tombstones: HashSet::new(),
            expiry: VecDeque::new(),
            horizon,
            peer_parity: match side {
                Side::Client => 0,
                Side::Server => 1,
            },
        }
    }

    pub fn insert(&mut self, stream: Stream) {
        self.streams.insert(stream.id, stream);
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Remove a terminated stream and start its tombstone clock.
    pub fn remove(&mut self, id: StreamId, now: Instant) -> Option<Stream> {
        let stream = self.streams.remove(&id)?;
        trace!("stream {id} removed, tombstoned");
        self.tombstones.insert(id);
        self.expiry.push_back((now + self.horizon, id));
        Some(stream)
    }

    /// Remove without a tombstone; used when a reassembled request is about
    /// to re-enter the registry under the same id.
    pub fn take(&mut self, id: StreamId) -> Option<Stream> {
        self.streams.remove(&id)
    }

    pub fn is_tombstoned(&self, id: StreamId) -> bool {
        self.tombstones.contains(&id)
    }

    /// Forget tombstones past their horizon.
    pub fn purge(&mut self, now: Instant) {
        while let Some((deadline, id)) = self.expiry.front() {
            if *deadline > now {
                break;
            }
            self.tombstones.remove(id);
            self.expiry.pop_front();
        }
    }

    /// Whether `id` is on the parity the peer allocates from.
    pub fn peer_initiated(&self, id: StreamId) -> bool {
        id % 2 == self.peer_parity
    }

    pub fn drain(&mut self) -> Vec<Stream> {
        self.streams.drain().map(|(_, stream)| stream).collect()
    }
}
