//! Wire format of the selective-disclosure bundle.
//!
//! The bundle is assembled in plaintext, serialized to JSON with the field
//! names below, then encrypted as a whole under the recipient's derived
//! key. Per-record plaintext is embedded directly; a recipient who can
//! open the outer envelope reads record data with no second decryption.

use serde::{Deserialize, Serialize};

use crate::records::RecordMeta;
use crate::types::{Address, RecordId, RequestId};

/// Current bundle format version.
pub const BUNDLE_VERSION: u32 = 1;

/// One disclosed record inside a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleRecord {
    pub record_id: RecordId,
    pub metadata: RecordMeta,
    /// Decrypted record payload.
    pub data: serde_json::Value,
}

/// Provenance of the approval that produced the bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    pub approval_id: RequestId,
    pub reason: String,
    pub requested_at: u64,
}

/// The complete bundle shared with one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedBundle {
    pub version: u32,
    pub patient: Address,
    pub doctor: Address,
    pub authorized_records: Vec<RecordId>,
    pub approved_at: u64,
    pub expires_at: u64,
    pub records: Vec<BundleRecord>,
    pub metadata: BundleMetadata,
}

impl SharedBundle {
    /// Locate a disclosed record by id.
    pub fn record(&self, record_id: &RecordId) -> Option<&BundleRecord> {
        self.records.iter().find(|r| r.record_id == *record_id)
    }

    /// Whether the bundle's validity window has passed.
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Cid;

    fn sample() -> SharedBundle {
        SharedBundle {
            version: BUNDLE_VERSION,
            patient: Address::new("0xp1"),
            doctor: Address::new("0xd2"),
            authorized_records: vec![RecordId::new("r1")],
            approved_at: 1_000,
            expires_at: 2_000,
            records: vec![BundleRecord {
                record_id: RecordId::new("r1"),
                metadata: RecordMeta {
                    cid: Cid::new("bafy1"),
                    timestamp: 900,
                    provider: Address::new("0xd1"),
                    version: 1,
                },
                data: serde_json::json!({"note": "ok"}),
            }],
            metadata: BundleMetadata {
                approval_id: RequestId::new("req-1"),
                reason: "checkup".into(),
                requested_at: 950,
            },
        }
    }

    #[test]
    fn test_wire_field_names() {
        let value = serde_json::to_value(sample()).unwrap();
        assert!(value.get("authorizedRecords").is_some());
        assert!(value.get("approvedAt").is_some());
        assert!(value.get("expiresAt").is_some());
        let record = &value["records"][0];
        assert!(record.get("recordId").is_some());
        assert!(record["metadata"].get("cid").is_some());
        assert!(record["metadata"].get("provider").is_some());
        assert!(value["metadata"].get("approvalId").is_some());
        assert!(value["metadata"].get("requestedAt").is_some());
    }

    #[test]
    fn test_record_lookup_and_expiry() {
        let bundle = sample();
        assert!(bundle.record(&RecordId::new("r1")).is_some());
        assert!(bundle.record(&RecordId::new("r2")).is_none());
        assert!(!bundle.is_expired(2_000));
        assert!(bundle.is_expired(2_001));
    }
}
