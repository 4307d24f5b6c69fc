//! HTTP gateway-backed content store.
//!
//! Writes go to a single pinning API endpoint; reads walk a fixed
//! priority-ordered list of public gateways, short-circuiting on the first
//! success and surfacing `ContentStoreUnavailable` only after every
//! gateway is exhausted. Each attempt has a bounded timeout.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, warn};

use super::{ContentStore, ContentStoreResponse};
use crate::types::{Cid, MedichainError, Result};

/// Configuration for the gateway-backed store.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Endpoint that accepts blob uploads (POST of the raw body).
    pub api_url: String,
    /// Gateway base URLs tried in order for reads.
    pub gateways: Vec<String>,
    /// Per-attempt timeout for both reads and writes.
    pub fetch_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:5001/api/v0/add".to_string(),
            gateways: vec![
                "https://ipfs.io/ipfs".to_string(),
                "https://cloudflare-ipfs.com/ipfs".to_string(),
                "https://gateway.pinata.cloud/ipfs".to_string(),
            ],
            fetch_timeout: Duration::from_secs(8),
        }
    }
}

/// Content store backed by an upload API plus read gateways.
pub struct GatewayContentStore {
    client: Client,
    config: GatewayConfig,
}

impl GatewayContentStore {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| MedichainError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Extract the content id from an upload response.
    ///
    /// Pinning services disagree on the response shape; all known variants
    /// are handled here, once, so callers only ever see a [`Cid`].
    fn parse_put_response(body: &str) -> Result<Cid> {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            for field in ["Hash", "IpfsHash", "cid"] {
                if let Some(hash) = value.get(field).and_then(|v| v.as_str()) {
                    return Ok(Cid::new(hash));
                }
            }
            return Err(MedichainError::ContentStoreUnavailable(format!(
                "upload response carries no content id: {body}"
            )));
        }

        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Err(MedichainError::ContentStoreUnavailable(
                "empty upload response".into(),
            ));
        }
        Ok(Cid::new(trimmed))
    }

    fn gateway_url(base: &str, cid: &Cid) -> String {
        format!("{}/{}", base.trim_end_matches('/'), cid)
    }
}

#[async_trait]
impl ContentStore for GatewayContentStore {
    async fn put(&self, data: Bytes) -> Result<Cid> {
        let response = self
            .client
            .post(&self.config.api_url)
            .body(data)
            .send()
            .await
            .map_err(|e| {
                MedichainError::ContentStoreUnavailable(format!(
                    "upload to {} failed: {e}",
                    self.config.api_url
                ))
            })?;

        if !response.status().is_success() {
            return Err(MedichainError::ContentStoreUnavailable(format!(
                "upload to {} returned HTTP {}",
                self.config.api_url,
                response.status()
            )));
        }

        let body = response.text().await.map_err(|e| {
            MedichainError::ContentStoreUnavailable(format!("failed to read upload response: {e}"))
        })?;

        let cid = Self::parse_put_response(&body)?;
        debug!(cid = %cid, "Published blob");
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Bytes> {
        for gateway in &self.config.gateways {
            let url = Self::gateway_url(gateway, cid);
            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => match response.bytes().await {
                    Ok(body) => {
                        debug!(cid = %cid, gateway = %gateway, size = body.len(), "Fetched blob");
                        return Ok(ContentStoreResponse::resolve(body).into_bytes());
                    }
                    Err(e) => {
                        warn!(cid = %cid, gateway = %gateway, error = %e, "Failed to read body, trying next gateway");
                    }
                },
                Ok(response) => {
                    warn!(cid = %cid, gateway = %gateway, status = %response.status(), "Gateway refused, trying next");
                }
                Err(e) => {
                    warn!(cid = %cid, gateway = %gateway, error = %e, "Gateway unreachable, trying next");
                }
            }
        }

        Err(MedichainError::ContentStoreUnavailable(format!(
            "all {} gateways exhausted for {cid}",
            self.config.gateways.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_put_response_shapes() {
        let cid = "bafkreigh2akiscaildc";

        let api = format!(r#"{{"Name":"blob","Hash":"{cid}","Size":"42"}}"#);
        assert_eq!(
            GatewayContentStore::parse_put_response(&api).unwrap(),
            Cid::new(cid)
        );

        let pinata = format!(r#"{{"IpfsHash":"{cid}","PinSize":42}}"#);
        assert_eq!(
            GatewayContentStore::parse_put_response(&pinata).unwrap(),
            Cid::new(cid)
        );

        let bare = format!("  {cid}\n");
        assert_eq!(
            GatewayContentStore::parse_put_response(&bare).unwrap(),
            Cid::new(cid)
        );
    }

    #[test]
    fn test_parse_put_response_rejects_empty() {
        assert!(GatewayContentStore::parse_put_response("").is_err());
        assert!(GatewayContentStore::parse_put_response(r#"{"ok":true}"#).is_err());
    }

    #[test]
    fn test_store_builds_with_defaults() {
        assert!(GatewayContentStore::new(GatewayConfig::default()).is_ok());
    }

    #[test]
    fn test_gateway_url_join() {
        let cid = Cid::new("bafyabc");
        assert_eq!(
            GatewayContentStore::gateway_url("https://ipfs.io/ipfs/", &cid),
            "https://ipfs.io/ipfs/bafyabc"
        );
        assert_eq!(
            GatewayContentStore::gateway_url("https://ipfs.io/ipfs", &cid),
            "https://ipfs.io/ipfs/bafyabc"
        );
    }
}
