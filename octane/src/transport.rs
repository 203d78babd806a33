//! Cross-rank exchange over in-process channels.
//!
//! The core only ever exchanges four things with a neighbouring rank:
//! packed tree topologies, per-step scalar vectors, multipole snapshots
//! and particle payloads, plus the step summaries the reducer combines.
//! This module carries them over channel pairs, so the whole multi-rank
//! protocol runs (and is tested) inside one process; an MPI-backed
//! implementation would swap in at this seam.

use crate::error::{Error, Result};
use crate::reduce::StepSummary;
use crossbeam_channel::{unbounded, Receiver, Sender};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// A rank identifier.
pub type Rank = i32;

/// Wrap-around bound for per-cell message tags.
pub const MAX_TAG: i32 = 32768;

/// The payload flavours a rank pair exchanges.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Message {
    /// A packed tree topology image.
    Cells(Vec<u8>),
    /// A packed per-step scalar vector.
    StepInfo(Vec<u8>),
    /// A packed multipole snapshot.
    Multipoles(Vec<u8>),
    /// Gas positions and velocities.
    Xv(Vec<u8>),
    /// Gas densities.
    Rho(Vec<u8>),
    /// Gas gradient data.
    Gradient(Vec<u8>),
    /// Gravity particle payloads.
    Grav(Vec<u8>),
    /// Per-cell end-time vectors.
    Ti(Vec<u8>),
    /// A step summary for the reducer.
    Summary(StepSummary),
}

/// A tagged message between two ranks.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Envelope {
    /// The sending cell's per-step tag, or `-1` for untagged traffic.
    pub tag: i32,
    /// The payload.
    pub message: Message,
}

struct Peer {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
}

/// One rank's view of the exchange fabric.
pub struct Transport {
    rank: Rank,
    peers: FxHashMap<Rank, Peer>,
}

impl Transport {
    /// A transport with no peers; single-rank runs reduce trivially.
    #[must_use]
    pub fn loopback(rank: Rank) -> Self {
        Self {
            rank,
            peers: FxHashMap::default(),
        }
    }

    /// A connected pair of transports for ranks `a` and `b`.
    #[must_use]
    pub fn local_pair(a: Rank, b: Rank) -> (Self, Self) {
        assert_ne!(a, b, "a rank cannot peer with itself");
        let (tx_ab, rx_ab) = unbounded();
        let (tx_ba, rx_ba) = unbounded();
        let mut ta = Self::loopback(a);
        ta.peers.insert(b, Peer { tx: tx_ab, rx: rx_ba });
        let mut tb = Self::loopback(b);
        tb.peers.insert(a, Peer { tx: tx_ba, rx: rx_ab });
        (ta, tb)
    }

    /// This rank's id.
    #[must_use]
    pub const fn rank(&self) -> Rank {
        self.rank
    }

    /// The peer ranks, in arbitrary order.
    pub fn peers(&self) -> impl Iterator<Item = Rank> + '_ {
        self.peers.keys().copied()
    }

    /// Sends `envelope` to `to`.
    pub fn send(&self, to: Rank, envelope: Envelope) -> Result<()> {
        let peer = self
            .peers
            .get(&to)
            .unwrap_or_else(|| panic!("send to unknown rank {to}"));
        peer.tx.send(envelope).map_err(|_| Error::Disconnected)
    }

    /// Receives the next envelope from `from`, blocking.
    pub fn recv(&self, from: Rank) -> Result<Envelope> {
        let peer = self
            .peers
            .get(&from)
            .unwrap_or_else(|| panic!("recv from unknown rank {from}"));
        peer.rx.recv().map_err(|_| Error::Disconnected)
    }

    /// Combines `local` with every peer's summary; all ranks end up with
    /// the same global summary. A transport failure is fatal upstream.
    pub fn allreduce(&self, local: StepSummary) -> Result<StepSummary> {
        for peer in self.peers.values() {
            peer.tx
                .send(Envelope {
                    tag: -1,
                    message: Message::Summary(local),
                })
                .map_err(|_| Error::Disconnected)?;
        }
        let mut global = local;
        for peer in self.peers.values() {
            match peer.rx.recv().map_err(|_| Error::Disconnected)? {
                Envelope {
                    message: Message::Summary(remote),
                    ..
                } => global.combine(&remote),
                other => panic!("expected a step summary during reduction, got {other:?}"),
            }
        }
        Ok(global)
    }
}

/// The process-wide monotonically wrapping tag counter, owned by the
/// engine context and threaded into every operation that needs one.
#[derive(Debug, Default)]
pub struct TagCounter {
    next: i32,
}

impl TagCounter {
    /// A counter starting at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Returns the next tag, wrapping at [`MAX_TAG`].
    pub fn next_tag(&mut self) -> i32 {
        let tag = self.next;
        self.next = (self.next + 1) % MAX_TAG;
        tag
    }
}
