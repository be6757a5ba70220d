//! Change records carried between replicas.
//!
//! The payload is the encoded directory operation (add/modify/delete/moddn);
//! the replication core never looks inside it.

use crate::csn::{Csn, GroupId, ServerId};
use serde::{Deserialize, Serialize};

/// Acknowledgment level requested by the originating write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssuredMode {
    /// Fire and forget.
    #[default]
    None,
    /// At least one other server of the same group must acknowledge.
    SafeData,
    /// Every normal server of the topology must acknowledge.
    SafeRead,
}

impl AssuredMode {
    /// True if the originator waits for acknowledgments.
    pub fn is_assured(&self) -> bool {
        !matches!(self, AssuredMode::None)
    }

    fn discriminant(&self) -> u8 {
        match self {
            AssuredMode::None => 0,
            AssuredMode::SafeData => 1,
            AssuredMode::SafeRead => 2,
        }
    }
}

/// A single replicated change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Ordering key, issued by the originating server.
    pub csn: Csn,
    /// Replicated domain (base DN).
    pub domain: String,
    /// Encoded operation.
    pub payload: Vec<u8>,
    /// Requested acknowledgment level.
    pub assured_mode: AssuredMode,
    /// Group of the originating server.
    pub group_id: GroupId,
    /// CRC32 of (csn, domain, payload, assured_mode, group_id).
    pub crc32: u32,
}

impl ChangeRecord {
    /// Create a new record with the CRC computed automatically.
    pub fn new(
        csn: Csn,
        domain: impl Into<String>,
        payload: Vec<u8>,
        assured_mode: AssuredMode,
        group_id: GroupId,
    ) -> Self {
        let mut record = Self {
            csn,
            domain: domain.into(),
            payload,
            assured_mode,
            group_id,
            crc32: 0,
        };
        record.crc32 = record.compute_crc();
        record
    }

    /// Server that originated this change.
    pub fn origin(&self) -> ServerId {
        self.csn.server_id
    }

    /// Compute the CRC32 for this record (excluding the crc32 field itself).
    pub fn compute_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.csn.time_ms.to_le_bytes());
        hasher.update(&self.csn.server_id.to_le_bytes());
        hasher.update(&self.csn.seq.to_le_bytes());
        hasher.update(&(self.domain.len() as u32).to_le_bytes());
        hasher.update(self.domain.as_bytes());
        hasher.update(&self.payload);
        hasher.update(&[self.assured_mode.discriminant(), self.group_id]);
        hasher.finalize()
    }

    /// Validate the CRC32 of this record.
    pub fn validate_crc(&self) -> bool {
        self.crc32 == self.compute_crc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(payload: &[u8]) -> ChangeRecord {
        ChangeRecord::new(
            Csn::new(1000, 1, 0),
            "dc=example,dc=com",
            payload.to_vec(),
            AssuredMode::SafeData,
            1,
        )
    }

    #[test]
    fn test_crc_validates() {
        let rec = record(b"add cn=foo");
        assert!(rec.validate_crc());

        let mut bad = rec.clone();
        bad.crc32 = 0xDEADBEEF;
        assert!(!bad.validate_crc());
    }

    #[test]
    fn test_crc_covers_payload_and_mode() {
        let a = record(b"one");
        let b = record(b"two");
        assert_ne!(a.crc32, b.crc32);

        let mut c = a.clone();
        c.assured_mode = AssuredMode::SafeRead;
        assert!(!c.validate_crc());
    }

    #[test]
    fn test_bincode_preserves_record() {
        let rec = record(&[7u8; 4096]);
        let bytes = bincode::serialize(&rec).unwrap();
        let back: ChangeRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, rec);
        assert!(back.validate_crc());
    }

    #[test]
    fn test_origin_is_csn_server() {
        assert_eq!(record(b"x").origin(), 1);
        assert!(!AssuredMode::None.is_assured());
        assert!(AssuredMode::SafeRead.is_assured());
    }
}
