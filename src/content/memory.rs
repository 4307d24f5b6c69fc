//! In-memory content store.
//!
//! Blobs are addressed by CIDv1 (raw codec, SHA2-256) so ids are
//! wire-compatible with IPFS gateways, and integrity is re-verified on
//! every get.

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid as CidV1;
use dashmap::DashMap;
use multihash_codetable::{Code, MultihashDigest};
use std::str::FromStr;
use tracing::debug;

use super::ContentStore;
use crate::types::{Cid, MedichainError, Result};

/// Multicodec code for raw binary content.
const RAW_CODEC: u64 = 0x55;

/// Compute the CIDv1 for a blob (raw codec, SHA2-256).
pub fn compute_cid(data: &[u8]) -> Cid {
    let hash = Code::Sha2_256.digest(data);
    Cid::new(CidV1::new_v1(RAW_CODEC, hash).to_string())
}

/// DashMap-backed content store for tests, demos, and local operation.
pub struct MemoryContentStore {
    blobs: DashMap<String, Bytes>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
        }
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, data: Bytes) -> Result<Cid> {
        let cid = compute_cid(&data);
        debug!(cid = %cid, size = data.len(), "Stored blob");
        self.blobs.insert(cid.as_str().to_string(), data);
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Bytes> {
        let data = self
            .blobs
            .get(cid.as_str())
            .map(|entry| entry.clone())
            .ok_or_else(|| MedichainError::NotFound(format!("blob {cid}")))?;

        // Content addressing is only trustworthy if re-checked on read.
        if let Ok(parsed) = CidV1::from_str(cid.as_str()) {
            let digest = Code::Sha2_256.digest(&data);
            if parsed.hash().digest() != digest.digest() {
                return Err(MedichainError::Internal(format!(
                    "blob {cid} no longer matches its content id"
                )));
            }
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryContentStore::new();
        let data = Bytes::from_static(b"encrypted record payload");

        let cid = store.put(data.clone()).await.unwrap();
        let fetched = store.get(&cid).await.unwrap();
        assert_eq!(fetched, data);
    }

    #[test]
    fn test_cid_is_deterministic_and_content_bound() {
        let a = compute_cid(b"same bytes");
        let b = compute_cid(b"same bytes");
        let c = compute_cid(b"other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("baf"));
    }

    #[tokio::test]
    async fn test_get_missing_blob_is_not_found() {
        let store = MemoryContentStore::new();
        let missing = compute_cid(b"never stored");
        assert!(matches!(
            store.get(&missing).await,
            Err(MedichainError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupted_blob_is_rejected() {
        let store = MemoryContentStore::new();
        let cid = store.put(Bytes::from_static(b"original")).await.unwrap();

        store
            .blobs
            .insert(cid.as_str().to_string(), Bytes::from_static(b"tampered"));

        assert!(matches!(
            store.get(&cid).await,
            Err(MedichainError::Internal(_))
        ));
    }
}
