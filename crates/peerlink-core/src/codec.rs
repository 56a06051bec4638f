//! Payload codec for MTU-bounded links
//!
//! Outbound payloads are split into frames no larger than the link's unit,
//! each carrying a small fixed header. Inbound frames are accumulated per
//! peer and released only once the declared total has arrived in chunk order.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::CodecConfig;
use crate::types::PeerId;
use crate::{PeerlinkError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Encoded size of a [`FrameHeader`] (three little-endian u32s)
pub const HEADER_LEN: usize = 12;

// ----------------------------------------------------------------------------
// Frame Header
// ----------------------------------------------------------------------------

/// Header prefixed to every frame on a framed link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Per-peer message counter, wraps on overflow
    pub sequence_id: u32,
    /// Length of the complete message in bytes
    pub total_length: u32,
    /// Zero-based position of this frame within the message
    pub chunk_index: u32,
}

// ----------------------------------------------------------------------------
// Outbound Frame
// ----------------------------------------------------------------------------

/// One unit-bounded slice of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl OutboundFrame {
    /// Serialize header and payload into a single link-layer write
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = bincode::serialize(&self.header)?;
        debug_assert_eq!(bytes.len(), HEADER_LEN);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(PeerlinkError::malformed_frame(format!(
                "frame of {} bytes is shorter than the {HEADER_LEN}-byte header",
                bytes.len()
            )));
        }
        let header: FrameHeader = bincode::deserialize(&bytes[..HEADER_LEN])?;
        Ok(Self {
            header,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

/// Maximum payload carried by one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameUnit {
    /// The link has no unit limit; the whole message travels as one frame
    Unlimited,
    /// Payload bytes per frame, excluding the header
    Bounded(usize),
}

impl FrameUnit {
    /// Derive the payload unit from a link MTU, which must leave room for the header
    pub fn for_mtu(mtu: usize) -> Result<Self> {
        if mtu <= HEADER_LEN {
            return Err(PeerlinkError::config_error(format!(
                "mtu {mtu} leaves no room for payload after the {HEADER_LEN}-byte frame header"
            )));
        }
        Ok(FrameUnit::Bounded(mtu - HEADER_LEN))
    }
}

// ----------------------------------------------------------------------------
// Pending Chunk Buffer
// ----------------------------------------------------------------------------

/// In-progress inbound transfer for a single peer
#[derive(Debug)]
struct PendingChunkBuffer {
    sequence_id: u32,
    total_length: u32,
    next_index: u32,
    data: Vec<u8>,
}

impl PendingChunkBuffer {
    fn new(header: &FrameHeader) -> Self {
        Self {
            sequence_id: header.sequence_id,
            total_length: header.total_length,
            next_index: 0,
            data: Vec::with_capacity(header.total_length as usize),
        }
    }
}

// ----------------------------------------------------------------------------
// Payload Codec
// ----------------------------------------------------------------------------

/// Fragments outbound payloads and reassembles inbound frames, per peer
#[derive(Debug)]
pub struct PayloadCodec {
    config: CodecConfig,
    next_sequence: HashMap<PeerId, u32>,
    pending: HashMap<PeerId, PendingChunkBuffer>,
}

impl PayloadCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            next_sequence: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Split `bytes` into ordered frames for `peer`
    ///
    /// An empty payload still produces one (empty) frame so the receiver sees
    /// the message.
    pub fn fragment(
        &mut self,
        peer: PeerId,
        bytes: &[u8],
        unit: FrameUnit,
    ) -> Result<SmallVec<[OutboundFrame; 4]>> {
        if bytes.len() > self.config.max_message_size {
            return Err(PeerlinkError::PayloadTooLarge {
                size: bytes.len(),
                max: self.config.max_message_size,
            });
        }
        let unit = match unit {
            FrameUnit::Unlimited => bytes.len().max(1),
            FrameUnit::Bounded(0) => {
                return Err(PeerlinkError::config_error("frame unit must be at least 1"))
            }
            FrameUnit::Bounded(size) => size,
        };

        let counter = self.next_sequence.entry(peer).or_insert(0);
        let sequence_id = *counter;
        *counter = counter.wrapping_add(1);

        let total_length = bytes.len() as u32;
        let mut frames = SmallVec::new();
        if bytes.is_empty() {
            frames.push(OutboundFrame {
                header: FrameHeader {
                    sequence_id,
                    total_length,
                    chunk_index: 0,
                },
                payload: Vec::new(),
            });
            return Ok(frames);
        }

        for (index, chunk) in bytes.chunks(unit).enumerate() {
            frames.push(OutboundFrame {
                header: FrameHeader {
                    sequence_id,
                    total_length,
                    chunk_index: index as u32,
                },
                payload: chunk.to_vec(),
            });
        }
        debug!(%peer, sequence_id, frames = frames.len(), "fragmented payload");
        Ok(frames)
    }

    /// Feed one inbound frame; returns the message once it is complete
    ///
    /// Any ordering error discards the peer's buffer; the sender has to
    /// restart the message from chunk 0.
    pub fn reassemble(&mut self, peer: PeerId, frame: OutboundFrame) -> Result<Option<Vec<u8>>> {
        let header = frame.header;
        let declared = header.total_length as usize;
        if declared > self.config.max_message_size {
            self.pending.remove(&peer);
            return Err(PeerlinkError::PayloadTooLarge {
                size: declared,
                max: self.config.max_message_size,
            });
        }

        let restart = match self.pending.get(&peer) {
            Some(buffer) => buffer.sequence_id != header.sequence_id && header.chunk_index == 0,
            None => false,
        };
        if restart {
            debug!(%peer, sequence_id = header.sequence_id, "sender restarted, dropping stale buffer");
            self.pending.remove(&peer);
        }

        let buffer = match self.pending.entry(peer) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) if header.chunk_index == 0 => {
                entry.insert(PendingChunkBuffer::new(&header))
            }
            Entry::Vacant(_) => {
                return Err(PeerlinkError::FragmentOrderViolation {
                    peer,
                    expected: 0,
                    actual: header.chunk_index,
                })
            }
        };

        if buffer.sequence_id != header.sequence_id
            || buffer.next_index != header.chunk_index
            || buffer.total_length != header.total_length
        {
            let expected = buffer.next_index;
            self.pending.remove(&peer);
            warn!(%peer, expected, actual = header.chunk_index, "discarding out-of-order transfer");
            return Err(PeerlinkError::FragmentOrderViolation {
                peer,
                expected,
                actual: header.chunk_index,
            });
        }

        if buffer.data.len() + frame.payload.len() > declared {
            let expected = buffer.next_index;
            self.pending.remove(&peer);
            return Err(PeerlinkError::FragmentOrderViolation {
                peer,
                expected,
                actual: header.chunk_index,
            });
        }

        buffer.data.extend_from_slice(&frame.payload);
        buffer.next_index = buffer.next_index.wrapping_add(1);

        if buffer.data.len() == declared {
            Ok(self.pending.remove(&peer).map(|buffer| buffer.data))
        } else {
            Ok(None)
        }
    }

    /// Drop any partial transfer from `peer` (disconnect)
    pub fn discard_peer(&mut self, peer: PeerId) -> bool {
        self.next_sequence.remove(&peer);
        self.pending.remove(&peer).is_some()
    }

    pub fn has_pending(&self, peer: PeerId) -> bool {
        self.pending.contains_key(&peer)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.next_sequence.clear();
        self.pending.clear();
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
