//! Record Hashing
//!
//! SHA-256 digests over archived round records. The digest lets an operator
//! detect a record that was edited after it was written.

use sha2::{Sha256, Digest};

/// Hash output type (256 bits / 32 bytes)
pub type RecordHash = [u8; 32];

/// Incremental hasher for round records.
///
/// Order of updates is significant.
pub struct RecordHasher {
    hasher: Sha256,
}

impl RecordHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Hasher for archived rounds.
    pub fn for_round_record() -> Self {
        Self::new(b"CRASH_ROUND_RECORD_V1")
    }

    /// Update with a u8 value.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an i64 value (little-endian).
    #[inline]
    pub fn update_i64(&mut self, value: i64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an optional u32, tagging presence.
    #[inline]
    pub fn update_opt_u32(&mut self, value: Option<u32>) {
        match value {
            Some(v) => {
                self.update_u8(1);
                self.update_u32(v);
            }
            None => self.update_u8(0),
        }
    }

    /// Update with a UUID (16 bytes).
    #[inline]
    pub fn update_uuid(&mut self, uuid: &[u8; 16]) {
        self.hasher.update(uuid);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> RecordHash {
        self.hasher.finalize().into()
    }
}
