//! Packet reassembly.
//!
//! Each node sends its accumulation as a fixed number of UDP fragments. This
//! module contains the state machine that collects the fragments of each
//! (sender, accumulation) pair and produces the complete node buffer when the
//! last fragment arrives.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Size of the fragment header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Packet geometry.
///
/// Gives the payload size of each fragment and the number of fragments that
/// form a node accumulation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PacketGeometry {
    /// Payload size in bytes, not including the header.
    pub payload_size: usize,
    /// Number of fragments per node accumulation.
    pub fragments: usize,
}

/// Fragment header.
///
/// All the fields are transmitted in big-endian format.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FragmentHeader {
    /// Index of the fragment within the accumulation.
    pub fragment: u32,
    /// Accumulation sequence number.
    pub sequence: u32,
}

/// Complete node buffer.
///
/// This is produced by the [`Reassembler`] when all the fragments of an
/// accumulation from a sender have been received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeBuffer {
    /// Sender of the fragments.
    pub sender: SocketAddr,
    /// Accumulation sequence number.
    pub sequence: u32,
    /// Time elapsed since the previous buffer completed by this sender.
    ///
    /// This is `None` for the first buffer of each sender.
    pub since_last: Option<Duration>,
    /// Concatenation of the fragment payloads in fragment order.
    pub data: Bytes,
}

/// Reason why a datagram was discarded.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Rejection {
    /// The datagram size is not the expected one.
    Size(usize),
    /// The fragment index is out of range.
    Fragment(u32),
}

/// Outcome of pushing a datagram into the [`Reassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    /// The datagram was stored and its accumulation is still incomplete.
    Pending,
    /// The datagram completed an accumulation.
    Complete(NodeBuffer),
    /// The datagram was discarded.
    Rejected(Rejection),
}

/// Fragment reassembler.
///
/// Keeps one buffer per (sender, sequence) pair. Buffers are allocated when
/// their first fragment arrives and removed as soon as they are complete.
/// Incomplete buffers older than the time-to-live are removed by
/// [`Reassembler::evict`].
#[derive(Debug)]
pub struct Reassembler {
    geometry: PacketGeometry,
    ttl: Duration,
    pending: HashMap<(SocketAddr, u32), Pending>,
    last_complete: HashMap<SocketAddr, Instant>,
}

#[derive(Debug)]
struct Pending {
    slots: Vec<Option<Bytes>>,
    filled: usize,
    created: Instant,
}

impl PacketGeometry {
    /// Returns the size in bytes of a complete datagram.
    pub fn datagram_size(&self) -> usize {
        HEADER_SIZE + self.payload_size
    }

    /// Returns the size in bytes of a node buffer.
    pub fn buffer_size(&self) -> usize {
        self.payload_size * self.fragments
    }
}

impl FragmentHeader {
    /// Parses the header at the beginning of a datagram.
    ///
    /// Returns `None` if the datagram is shorter than the header.
    pub fn parse(datagram: &[u8]) -> Option<FragmentHeader> {
        let fragment = datagram.get(0..4)?.try_into().ok()?;
        let sequence = datagram.get(4..8)?.try_into().ok()?;
        Some(FragmentHeader {
            fragment: u32::from_be_bytes(fragment),
            sequence: u32::from_be_bytes(sequence),
        })
    }

    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0; HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.fragment.to_be_bytes());
        bytes[4..].copy_from_slice(&self.sequence.to_be_bytes());
        bytes
    }
}

impl Reassembler {
    /// Creates a new reassembler.
    pub fn new(geometry: PacketGeometry, ttl: Duration) -> Reassembler {
        Reassembler {
            geometry,
            ttl,
            pending: HashMap::new(),
            last_complete: HashMap::new(),
        }
    }

    /// Returns the packet geometry.
    pub fn geometry(&self) -> PacketGeometry {
        self.geometry
    }

    /// Returns the number of incomplete buffers.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Processes a datagram received from `sender` at time `now`.
    ///
    /// Duplicate fragments overwrite the previous copy.
    pub fn push(&mut self, sender: SocketAddr, datagram: &[u8], now: Instant) -> Push {
        if datagram.len() != self.geometry.datagram_size() {
            return Push::Rejected(Rejection::Size(datagram.len()));
        }
        let Some(header) = FragmentHeader::parse(datagram) else {
            return Push::Rejected(Rejection::Size(datagram.len()));
        };
        let index = header.fragment as usize;
        if index >= self.geometry.fragments {
            return Push::Rejected(Rejection::Fragment(header.fragment));
        }

        let key = (sender, header.sequence);
        let fragments = self.geometry.fragments;
        let pending = self.pending.entry(key).or_insert_with(|| Pending {
            slots: vec![None; fragments],
            filled: 0,
            created: now,
        });
        let slot = &mut pending.slots[index];
        if slot.is_none() {
            pending.filled += 1;
        }
        *slot = Some(Bytes::copy_from_slice(&datagram[HEADER_SIZE..]));
        if pending.filled < fragments {
            return Push::Pending;
        }

        let Some(pending) = self.pending.remove(&key) else {
            return Push::Pending;
        };
        let mut data = BytesMut::with_capacity(self.geometry.buffer_size());
        for payload in pending.slots.into_iter().flatten() {
            data.extend_from_slice(&payload);
        }
        let since_last = self
            .last_complete
            .insert(sender, now)
            .map(|last| now.saturating_duration_since(last));
        Push::Complete(NodeBuffer {
            sender,
            sequence: header.sequence,
            since_last,
            data: data.freeze(),
        })
    }

    /// Removes the incomplete buffers created more than the time-to-live
    /// before `now`.
    ///
    /// Returns the number of buffers removed.
    pub fn evict(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        let ttl = self.ttl;
        self.pending.retain(|(sender, sequence), pending| {
            let keep = now.saturating_duration_since(pending.created) < ttl;
            if !keep {
                tracing::debug!(
                    %sender,
                    sequence,
                    received = pending.filled,
                    "evicting incomplete node buffer"
                );
            }
            keep
        });
        before - self.pending.len()
    }
}
