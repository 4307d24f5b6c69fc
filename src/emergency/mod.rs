//! Emergency disclosure: a lower-assurance, bootstrap-friendly path to a
//! patient's medical summary.
//!
//! Two artifacts are produced from the same profile:
//!
//! - the **provider-path artifact**, encrypted under the patient's normal
//!   derived key and anchored on the ledger. Readable by anyone who knows
//!   the patient's address and fetches the cid, gated by the patient's
//!   `emergency_access_allowed` flag at display time;
//! - the **fast-path artifact**, encrypted under a key derived from the
//!   address plus a fixed public salt. It needs no ledger round trip when
//!   the cid travels inside a QR payload, and by the same token anyone
//!   holding the QR data can derive the key. Once distributed it is
//!   non-revocable, and it bypasses the allow flag by construction. This
//!   is commitment-style fast disclosure, not zero knowledge.

mod cache;
mod profile;

pub use cache::{EmergencyCache, EmergencyCacheConfig, EmergencyCacheStats};
pub use profile::{
    decode_qr, encode_qr, EmergencyContact, EmergencyProfile, QR_PREFIX,
};

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::access::AccessControlEngine;
use crate::content::ContentStore;
use crate::crypto::{decrypt_json, encrypt_json, KeyDeriver};
use crate::types::{Address, Cid, MedichainError, Result};

/// Publishes and resolves emergency artifacts.
pub struct EmergencyService {
    engine: Arc<AccessControlEngine>,
    content: Arc<dyn ContentStore>,
    keys: KeyDeriver,
    cache: EmergencyCache,
}

impl EmergencyService {
    pub fn new(
        engine: Arc<AccessControlEngine>,
        content: Arc<dyn ContentStore>,
        keys: KeyDeriver,
        cache: EmergencyCache,
    ) -> Self {
        Self {
            engine,
            content,
            keys,
            cache,
        }
    }

    /// Publish the provider-path artifact: encrypt the profile under the
    /// caller's own derived key, store it, and anchor the cid on the
    /// ledger. Patient-only by construction.
    pub async fn publish(&self, caller: &Address, profile: &EmergencyProfile) -> Result<Cid> {
        let key = self.keys.derive_key(caller.as_str());
        let envelope = encrypt_json(&serde_json::to_value(profile)?, &key)?;
        let cid = self.content.put(Bytes::from(envelope.into_bytes())).await?;
        self.engine.update_emergency_data(caller, cid.clone()).await?;
        self.cache.invalidate(caller);
        info!(patient = %caller, cid = %cid, "Emergency artifact published");
        Ok(cid)
    }

    /// Publish the fast-path artifact: encrypt the profile under the
    /// fixed-salt emergency key and store it. The cid is returned for
    /// out-of-band distribution (printed/QR) and is never written to the
    /// ledger.
    pub async fn publish_fast_path(
        &self,
        caller: &Address,
        profile: &EmergencyProfile,
    ) -> Result<Cid> {
        let key = self.keys.derive_emergency_key(caller);
        let envelope = encrypt_json(&serde_json::to_value(profile)?, &key)?;
        let cid = self.content.put(Bytes::from(envelope.into_bytes())).await?;
        info!(patient = %caller, cid = %cid, "Fast-path emergency artifact published");
        Ok(cid)
    }

    /// Resolve a patient's profile through the ledger-mediated provider
    /// path. Honors the patient's allow flag and serves repeated local
    /// lookups from the non-authoritative cache.
    pub async fn load(&self, patient: &Address) -> Result<EmergencyProfile> {
        if let Some(profile) = self.cache.get(patient) {
            debug!(patient = %patient, "Emergency profile served from cache");
            return Ok(profile);
        }

        if !self.engine.is_emergency_access_allowed(patient).await? {
            return Err(MedichainError::Unauthorized(format!(
                "patient {patient} has not enabled emergency access"
            )));
        }

        let cid = self
            .engine
            .emergency_data_cid(patient)
            .await?
            .ok_or_else(|| {
                MedichainError::NotFound(format!("no emergency data for patient {patient}"))
            })?;

        let profile = self.read_artifact(&cid, &self.keys.derive_key(patient.as_str())).await?;
        self.cache.insert(patient, profile.clone());
        Ok(profile)
    }

    /// Resolve a fast-path artifact from a cid carried out-of-band (e.g.
    /// scanned from a QR payload next to the patient address). Needs no
    /// ledger access and does not consult the allow flag; possession of
    /// the QR data is the whole credential.
    pub async fn load_fast_path(
        &self,
        patient: &Address,
        cid: &Cid,
    ) -> Result<EmergencyProfile> {
        self.read_artifact(cid, &self.keys.derive_emergency_key(patient))
            .await
    }

    /// Cache statistics for diagnostics.
    pub fn cache_stats(&self) -> EmergencyCacheStats {
        self.cache.stats()
    }

    async fn read_artifact(
        &self,
        cid: &Cid,
        key: &crate::crypto::SecretKey,
    ) -> Result<EmergencyProfile> {
        let blob = self.content.get(cid).await?;
        let envelope = String::from_utf8(blob.to_vec())
            .map_err(|_| MedichainError::Internal(format!("artifact {cid} is not UTF-8")))?;
        let value = decrypt_json(&envelope, key)?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::profile::sample_profile;
    use super::*;
    use crate::content::MemoryContentStore;
    use crate::ledger::MemoryLedger;

    struct Fixture {
        engine: Arc<AccessControlEngine>,
        service: EmergencyService,
        keys: KeyDeriver,
    }

    async fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryLedger::with_time(1_700_000_000));
        let content = Arc::new(MemoryContentStore::new());
        let engine = Arc::new(AccessControlEngine::new(ledger));
        let keys = KeyDeriver::default();
        let service = EmergencyService::new(
            engine.clone(),
            content,
            keys.clone(),
            EmergencyCache::with_defaults(),
        );
        Fixture {
            engine,
            service,
            keys,
        }
    }

    #[tokio::test]
    async fn test_provider_path_round_trip() {
        let f = fixture().await;
        let patient = Address::new("0xp1");
        f.engine.register_patient(&patient).await.unwrap();
        f.engine.set_emergency_access(&patient, true).await.unwrap();

        let profile = sample_profile("0xp1");
        f.service.publish(&patient, &profile).await.unwrap();

        let loaded = f.service.load(&patient).await.unwrap();
        assert_eq!(loaded, profile);

        // Second lookup is served locally
        f.service.load(&patient).await.unwrap();
        assert_eq!(f.service.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_allow_flag_gates_provider_path() {
        let f = fixture().await;
        let patient = Address::new("0xp1");
        f.engine.register_patient(&patient).await.unwrap();

        f.service
            .publish(&patient, &sample_profile("0xp1"))
            .await
            .unwrap();

        assert!(matches!(
            f.service.load(&patient).await,
            Err(MedichainError::Unauthorized(_))
        ));

        f.engine.set_emergency_access(&patient, true).await.unwrap();
        f.service.load(&patient).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_without_artifact_is_not_found() {
        let f = fixture().await;
        let patient = Address::new("0xp1");
        f.engine.register_patient(&patient).await.unwrap();
        f.engine.set_emergency_access(&patient, true).await.unwrap();

        assert!(matches!(
            f.service.load(&patient).await,
            Err(MedichainError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fast_path_ignores_allow_flag() {
        let f = fixture().await;
        let patient = Address::new("0xp1");
        f.engine.register_patient(&patient).await.unwrap();

        let profile = sample_profile("0xp1");
        let cid = f.service.publish_fast_path(&patient, &profile).await.unwrap();

        // Flag stays off; possession of address + cid suffices
        let loaded = f.service.load_fast_path(&patient, &cid).await.unwrap();
        assert_eq!(loaded, profile);
    }

    #[tokio::test]
    async fn test_fast_path_artifact_needs_the_emergency_key() {
        let f = fixture().await;
        let patient = Address::new("0xp1");
        f.engine.register_patient(&patient).await.unwrap();

        let cid = f
            .service
            .publish_fast_path(&patient, &sample_profile("0xp1"))
            .await
            .unwrap();

        // The patient's normal identity key does not open it
        let wrong = f.keys.derive_key(patient.as_str());
        assert!(matches!(
            f.service.read_artifact(&cid, &wrong).await,
            Err(MedichainError::Decryption(_))
        ));
    }
}
