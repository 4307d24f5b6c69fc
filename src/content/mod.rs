//! Content-addressed blob storage adapters.
//!
//! The store holds opaque ciphertext blobs addressed by CID. It offers no
//! transactional guarantee, no guaranteed deletion, and eventual global
//! replication only; nothing private may ever reach it unencrypted.

mod gateway;
mod memory;

pub use gateway::{GatewayConfig, GatewayContentStore};
pub use memory::MemoryContentStore;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;

use crate::types::{Cid, Result};

/// put/get of opaque byte blobs by content id.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store a blob, returning its content id.
    async fn put(&self, data: Bytes) -> Result<Cid>;

    /// Fetch a blob by content id.
    async fn get(&self, cid: &Cid) -> Result<Bytes>;
}

/// Response shape from a content-store backend, resolved once at the
/// adapter boundary so the core never sniffs payload shapes itself.
///
/// Gateways and pinning services disagree on framing: some return the raw
/// blob, others wrap it as `{"content": "<base64>"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentStoreResponse {
    /// The body is the blob itself.
    Raw(Bytes),
    /// The body wrapped the blob in a JSON object.
    Wrapped { content: Bytes },
}

impl ContentStoreResponse {
    /// Classify a response body.
    pub fn resolve(body: Bytes) -> Self {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body) {
            if let Some(content) = value.get("content") {
                if let Some(s) = content.as_str() {
                    // Wrapped content is base64 when binary, else verbatim.
                    let bytes = BASE64
                        .decode(s)
                        .map(Bytes::from)
                        .unwrap_or_else(|_| Bytes::from(s.as_bytes().to_vec()));
                    return ContentStoreResponse::Wrapped { content: bytes };
                }
                return ContentStoreResponse::Wrapped {
                    content: Bytes::from(content.to_string()),
                };
            }
        }
        ContentStoreResponse::Raw(body)
    }

    /// The blob bytes, whatever the framing was.
    pub fn into_bytes(self) -> Bytes {
        match self {
            ContentStoreResponse::Raw(b) => b,
            ContentStoreResponse::Wrapped { content } => content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_raw_body() {
        let body = Bytes::from_static(b"ciphertext-blob");
        let resolved = ContentStoreResponse::resolve(body.clone());
        assert_eq!(resolved, ContentStoreResponse::Raw(body.clone()));
        assert_eq!(resolved.into_bytes(), body);
    }

    #[test]
    fn test_resolve_wrapped_plain_content() {
        // Not canonical base64, so the content passes through verbatim
        let body = Bytes::from_static(br#"{"content":"hello"}"#);
        let resolved = ContentStoreResponse::resolve(body);
        assert_eq!(resolved.into_bytes(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_resolve_wrapped_base64_content() {
        let encoded = BASE64.encode(b"binary blob");
        let body = Bytes::from(format!(r#"{{"content":"{encoded}"}}"#));
        let resolved = ContentStoreResponse::resolve(body);
        assert_eq!(resolved.into_bytes(), Bytes::from_static(b"binary blob"));
    }

    #[test]
    fn test_resolve_json_without_content_field_is_raw() {
        let body = Bytes::from_static(br#"{"records":[1,2,3]}"#);
        let resolved = ContentStoreResponse::resolve(body.clone());
        assert_eq!(resolved, ContentStoreResponse::Raw(body));
    }
}
