//! Log event framing
//!
//! Events are opaque payloads framed with a self-describing header so that
//! replay can switch on the event kind without decoding the payload.
//!
//! Record format:
//! ```text
//! +--------+------+--------+--------+---------+--------+
//! | Magic  | Kind | Stamp  | Length | Payload | CRC32C |
//! | 4B     | 4B   | 8B     | 4B     | var     | 4B     |
//! +--------+------+--------+--------+---------+--------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use metafs_common::{Error, Result};

/// Event record magic number
const EVENT_MAGIC: u32 = 0x4D444556; // "MDEV"

/// Fixed header size (magic + kind + stamp + length)
const EVENT_HEADER_SIZE: usize = 20;

/// Kind discriminators reserved by the journal core. Everything else is
/// carried through as [`EventKind::Other`].
const KIND_SUBTREEMAP: u32 = 1;
const KIND_SUBTREEMAP_TEST: u32 = 2;
const KIND_IMPORTFINISH: u32 = 3;
const KIND_RESETJOURNAL: u32 = 4;
const KIND_OTHER_BASE: u32 = 0x100;

/// Event kind, the only part of an event the journal core interprets.
///
/// `SubtreeMap` and `ResetJournal` open a new segment on replay;
/// `SubtreeMapTest` deliberately does not, so debug maps can be interleaved
/// without perturbing segment boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Self-describing snapshot of authoritative subtree ownership
    SubtreeMap,
    /// Debug-only subtree map, never a segment boundary
    SubtreeMapTest,
    /// Completion of a subtree import from another rank
    ImportFinish,
    /// Journal reset marker
    ResetJournal,
    /// Any event the core does not interpret
    Other(u32),
}

impl EventKind {
    fn as_u32(self) -> u32 {
        match self {
            Self::SubtreeMap => KIND_SUBTREEMAP,
            Self::SubtreeMapTest => KIND_SUBTREEMAP_TEST,
            Self::ImportFinish => KIND_IMPORTFINISH,
            Self::ResetJournal => KIND_RESETJOURNAL,
            Self::Other(v) => KIND_OTHER_BASE.wrapping_add(v),
        }
    }

    fn from_u32(v: u32) -> Self {
        match v {
            KIND_SUBTREEMAP => Self::SubtreeMap,
            KIND_SUBTREEMAP_TEST => Self::SubtreeMapTest,
            KIND_IMPORTFINISH => Self::ImportFinish,
            KIND_RESETJOURNAL => Self::ResetJournal,
            v => Self::Other(v.wrapping_sub(KIND_OTHER_BASE)),
        }
    }
}

/// A single metadata mutation event.
///
/// The payload is opaque to the journal; its decoding belongs to the
/// metadata cache that replays it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub kind: EventKind,
    /// Submission time in microseconds since the epoch, stamped by the
    /// journal on submit
    pub stamp_micros: u64,
    pub payload: Bytes,
}

impl LogEvent {
    pub fn new(kind: EventKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            stamp_micros: 0,
            payload: payload.into(),
        }
    }

    /// Serialize the event with its framing header
    pub fn encode_with_header(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(EVENT_HEADER_SIZE + self.payload.len() + 4);
        buf.put_u32_le(EVENT_MAGIC);
        buf.put_u32_le(self.kind.as_u32());
        buf.put_u64_le(self.stamp_micros);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Parse an event from framed bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let corrupt = || Error::CorruptEvent {
            pos: 0,
            len: data.len(),
        };

        if data.len() < EVENT_HEADER_SIZE + 4 {
            return Err(corrupt());
        }

        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != EVENT_MAGIC {
            return Err(corrupt());
        }

        let kind = EventKind::from_u32(u32::from_le_bytes(data[4..8].try_into().unwrap()));
        let stamp_micros = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let payload_len = u32::from_le_bytes(data[16..20].try_into().unwrap()) as usize;

        let total_len = EVENT_HEADER_SIZE + payload_len + 4;
        if data.len() < total_len {
            return Err(corrupt());
        }

        let stored_crc = u32::from_le_bytes(
            data[EVENT_HEADER_SIZE + payload_len..total_len]
                .try_into()
                .unwrap(),
        );
        let computed_crc = crc32c::crc32c(&data[..EVENT_HEADER_SIZE + payload_len]);
        if computed_crc != stored_crc {
            return Err(corrupt());
        }

        Ok(Self {
            kind,
            stamp_micros,
            payload: Bytes::copy_from_slice(&data[EVENT_HEADER_SIZE..EVENT_HEADER_SIZE + payload_len]),
        })
    }
}
