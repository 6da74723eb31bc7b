//! Journal pointer
//!
//! A tiny two-slot object persisted outside the journal. `front` names the
//! live journal object; `back`, when set, names a reformat target that may
//! be incomplete. Recovery uses the pair to converge after a crash at any
//! point of the reformat protocol.
//!
//! Object format:
//! ```text
//! +--------+--------+--------+--------+
//! | Magic  | Front  | Back   | CRC32C |
//! | 4B     | 8B     | 8B     | 4B     |
//! +--------+--------+--------+--------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use metafs_common::{Error, InodeNo, Result};

/// Pointer object magic number
const POINTER_MAGIC: u32 = 0x4D444A50; // "MDJP"

/// Serialized pointer size
const POINTER_SIZE: usize = 24;

/// Two-slot atomic pointer naming the live journal object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalPointer {
    /// The live journal object, always set
    pub front: InodeNo,
    /// Reformat target, null in the clean state
    pub back: InodeNo,
}

impl JournalPointer {
    pub fn new(front: InodeNo) -> Self {
        Self {
            front,
            back: InodeNo::NULL,
        }
    }

    /// A pointer with no front journal is meaningless and must never be
    /// persisted.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.front.is_null()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(POINTER_SIZE);
        buf.put_u32_le(POINTER_MAGIC);
        buf.put_u64_le(self.front.0);
        buf.put_u64_le(self.back.0);
        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < POINTER_SIZE {
            return Err(Error::Pointer("pointer object too small".into()));
        }

        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != POINTER_MAGIC {
            return Err(Error::Pointer("bad pointer magic".into()));
        }

        let stored_crc = u32::from_le_bytes(data[20..24].try_into().unwrap());
        if crc32c::crc32c(&data[..20]) != stored_crc {
            return Err(Error::Pointer("pointer checksum mismatch".into()));
        }

        Ok(Self {
            front: InodeNo(u64::from_le_bytes(data[4..12].try_into().unwrap())),
            back: InodeNo(u64::from_le_bytes(data[12..20].try_into().unwrap())),
        })
    }
}

/// Synchronous persistence of the pointer object in the metadata pool.
///
/// Called from the recovery thread without the coarse mutex held; the
/// implementation owns whatever locking its client needs.
pub trait PointerStore: Send + Sync {
    /// Read the pointer. `Ok(None)` means the object does not exist yet.
    fn load(&self) -> Result<Option<JournalPointer>>;

    /// Persist the pointer. After a successful save, a restart observes
    /// the same pair.
    fn save(&self, pointer: &JournalPointer) -> Result<()>;
}
