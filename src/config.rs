//! Configuration for medichain clients.
//!
//! A plain struct with defaults and environment overrides; binaries layer
//! CLI flags on top.

use std::time::Duration;

use crate::content::GatewayConfig;
use crate::crypto::{KeyDeriver, MIN_KDF_ITERATIONS};
use crate::emergency::EmergencyCacheConfig;

/// Client-wide configuration.
#[derive(Debug, Clone)]
pub struct MedichainConfig {
    /// PBKDF2 iteration count for key derivation.
    pub kdf_iterations: u32,
    /// Content-store upload endpoint.
    pub api_url: String,
    /// Read gateways tried in priority order.
    pub gateways: Vec<String>,
    /// Per-attempt timeout for content-store I/O.
    pub fetch_timeout: Duration,
    /// TTL for the local emergency lookup cache.
    pub emergency_cache_ttl: Duration,
}

impl Default for MedichainConfig {
    fn default() -> Self {
        let gateway = GatewayConfig::default();
        Self {
            kdf_iterations: MIN_KDF_ITERATIONS,
            api_url: gateway.api_url,
            gateways: gateway.gateways,
            fetch_timeout: gateway.fetch_timeout,
            emergency_cache_ttl: EmergencyCacheConfig::default().ttl,
        }
    }
}

impl MedichainConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let kdf_iterations = std::env::var("MEDICHAIN_KDF_ITERATIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.kdf_iterations);

        let api_url =
            std::env::var("MEDICHAIN_API_URL").unwrap_or_else(|_| defaults.api_url.clone());

        let gateways = std::env::var("MEDICHAIN_GATEWAYS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|g| g.trim().to_string())
                    .filter(|g| !g.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| defaults.gateways.clone());

        let fetch_timeout = std::env::var("MEDICHAIN_FETCH_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.fetch_timeout);

        let emergency_cache_ttl = std::env::var("MEDICHAIN_CACHE_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.emergency_cache_ttl);

        Self {
            kdf_iterations,
            api_url,
            gateways,
            fetch_timeout,
            emergency_cache_ttl,
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(format!(
                "MEDICHAIN_KDF_ITERATIONS must be at least {MIN_KDF_ITERATIONS}"
            ));
        }
        if self.gateways.is_empty() {
            return Err("at least one content-store gateway is required".to_string());
        }
        if self.fetch_timeout.is_zero() {
            return Err("MEDICHAIN_FETCH_TIMEOUT_SECS must be positive".to_string());
        }
        Ok(())
    }

    /// The gateway adapter's view of this configuration.
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            api_url: self.api_url.clone(),
            gateways: self.gateways.clone(),
            fetch_timeout: self.fetch_timeout,
        }
    }

    /// Key deriver at the configured PBKDF2 cost.
    pub fn key_deriver(&self) -> KeyDeriver {
        KeyDeriver::new(self.kdf_iterations)
    }

    /// Emergency cache settings.
    pub fn emergency_cache_config(&self) -> EmergencyCacheConfig {
        EmergencyCacheConfig {
            ttl: self.emergency_cache_ttl,
            ..Default::default()
        }
    }
}
