//! Selective disclosure packager.
//!
//! Lets a patient hand a doctor plaintext access to an explicit, bounded
//! subset of records without surrendering the patient's own derived key,
//! which would expose every record including ones never authorized.
//!
//! On approval the packager decrypts each authorized record with the
//! patient's key (falling back to the uploading provider's key for records
//! written under older flows), assembles one bundle, re-encrypts the whole
//! bundle under the recipient's derived key, publishes it, and only then
//! performs the single ledger write. Per-record fetches are independent
//! and run in parallel; the flow is all-or-nothing, since a partial bundle
//! could silently omit a record the patient believed was shared.
//!
//! Approval produces only the read capability. It does not issue a write
//! grant for the recipient; those are independent capabilities.

mod bundle;

pub use bundle::{BundleMetadata, BundleRecord, SharedBundle, BUNDLE_VERSION};

use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use tracing::{debug, info};

use crate::access::{AccessControlEngine, DoctorAccess, RequestState};
use crate::content::ContentStore;
use crate::crypto::{decrypt_json, encrypt_json, KeyDeriver};
use crate::ledger::Ledger;
use crate::records::RecordStore;
use crate::types::{Address, Cid, MedichainError, RecordId, RequestId, Result};

/// Result of a completed approval.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    /// Content id of the published bundle.
    pub shared_cid: Cid,
    /// The capability recorded on the ledger.
    pub capability: DoctorAccess,
}

/// Assembles and publishes per-recipient disclosure bundles.
pub struct DisclosurePackager {
    ledger: Arc<dyn Ledger>,
    engine: Arc<AccessControlEngine>,
    records: Arc<RecordStore>,
    content: Arc<dyn ContentStore>,
    keys: KeyDeriver,
}

impl DisclosurePackager {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        engine: Arc<AccessControlEngine>,
        records: Arc<RecordStore>,
        content: Arc<dyn ContentStore>,
        keys: KeyDeriver,
    ) -> Self {
        Self {
            ledger,
            engine,
            records,
            content,
            keys,
        }
    }

    /// Approve a pending request by publishing a bundle of the approved
    /// records re-encrypted for the requesting doctor, then recording the
    /// capability on the ledger.
    ///
    /// `approved` may narrow the requested set. Any single record's fetch
    /// or decryption failure aborts the whole approval; nothing partial is
    /// committed.
    pub async fn approve_request(
        &self,
        caller: &Address,
        request_id: &RequestId,
        approved: &[RecordId],
    ) -> Result<ApprovalOutcome> {
        let request = self.engine.get_access_request(request_id).await?;
        if request.patient != *caller {
            return Err(MedichainError::Unauthorized(format!(
                "only patient {} may approve request {request_id}",
                request.patient
            )));
        }
        if request.state != RequestState::Pending {
            return Err(MedichainError::NotPending(request_id.to_string()));
        }
        for record_id in approved {
            if !request.requested_records.contains(record_id) {
                return Err(MedichainError::Unauthorized(format!(
                    "record {record_id} is not named in request {request_id}"
                )));
            }
        }

        let patient_key = self.keys.derive_key(caller.as_str());
        let disclosed = try_join_all(approved.iter().map(|record_id| {
            let patient_key = &patient_key;
            async move {
                let meta = self.records.get_record(caller, caller, record_id).await?;
                let envelope = self.records.fetch_envelope(&meta.cid).await?;
                let data = match decrypt_json(&envelope, patient_key) {
                    Ok(value) => value,
                    Err(MedichainError::Decryption(_)) => {
                        // Records written under older flows were encrypted
                        // with the uploading provider's key.
                        let provider_key = self.keys.derive_key(meta.provider.as_str());
                        decrypt_json(&envelope, &provider_key).map_err(|_| {
                            MedichainError::Decryption(format!(
                                "record {record_id}: neither patient nor provider key opens {}",
                                meta.cid
                            ))
                        })?
                    }
                    Err(e) => return Err(e),
                };
                debug!(record_id = %record_id, cid = %meta.cid, "Record decrypted for disclosure");
                Ok(BundleRecord {
                    record_id: record_id.clone(),
                    metadata: meta,
                    data,
                })
            }
        }))
        .await?;

        let now = self.ledger.now().await?;
        let bundle = SharedBundle {
            version: BUNDLE_VERSION,
            patient: caller.clone(),
            doctor: request.doctor.clone(),
            authorized_records: approved.to_vec(),
            approved_at: now,
            expires_at: now + request.requested_duration,
            records: disclosed,
            metadata: BundleMetadata {
                approval_id: request_id.clone(),
                reason: request.reason.clone(),
                requested_at: request.timestamp,
            },
        };

        let doctor_key = self.keys.derive_key(request.doctor.as_str());
        let envelope = encrypt_json(&serde_json::to_value(&bundle)?, &doctor_key)?;

        // The bundle must exist in the content store before the ledger
        // records its cid.
        let shared_cid = self.content.put(Bytes::from(envelope.into_bytes())).await?;
        let capability = self
            .engine
            .approve_access(caller, request_id, approved, shared_cid.clone())
            .await?;

        info!(
            request_id = %request_id,
            doctor = %request.doctor,
            patient = %caller,
            records = bundle.records.len(),
            shared_cid = %shared_cid,
            "Disclosure bundle published"
        );
        Ok(ApprovalOutcome {
            shared_cid,
            capability,
        })
    }

    /// Open the bundle shared with the calling doctor for a patient.
    ///
    /// Validates the ledger capability and the bundle's own expiry stamp
    /// before returning anything.
    pub async fn open_bundle(&self, caller: &Address, patient: &Address) -> Result<SharedBundle> {
        let access = self
            .engine
            .get_doctor_access(patient, caller)
            .await?
            .ok_or_else(|| {
                MedichainError::NotFound(format!("no shared bundle from {patient} for {caller}"))
            })?;

        let now = self.ledger.now().await?;
        if !access.is_live(now) {
            return Err(MedichainError::Unauthorized(format!(
                "access to records of {patient} expired at {}",
                access.expires_at
            )));
        }

        let blob = self.content.get(&access.shared_data_cid).await?;
        let envelope = String::from_utf8(blob.to_vec()).map_err(|_| {
            MedichainError::Internal(format!(
                "bundle blob {} is not UTF-8",
                access.shared_data_cid
            ))
        })?;

        let doctor_key = self.keys.derive_key(caller.as_str());
        let value = decrypt_json(&envelope, &doctor_key)?;
        let bundle: SharedBundle = serde_json::from_value(value)?;

        if bundle.is_expired(now) {
            return Err(MedichainError::Unauthorized(format!(
                "bundle from {patient} expired at {}",
                bundle.expires_at
            )));
        }

        debug!(patient = %patient, doctor = %caller, records = bundle.records.len(), "Bundle opened");
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryContentStore;
    use crate::crypto::SecretKey;
    use crate::ledger::MemoryLedger;

    fn addr(s: &str) -> Address {
        Address::new(s)
    }

    fn rec(s: &str) -> RecordId {
        RecordId::new(s)
    }

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        content: Arc<MemoryContentStore>,
        engine: Arc<AccessControlEngine>,
        records: Arc<RecordStore>,
        packager: DisclosurePackager,
        keys: KeyDeriver,
    }

    async fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryLedger::with_time(1_700_000_000));
        let content = Arc::new(MemoryContentStore::new());
        let engine = Arc::new(AccessControlEngine::new(ledger.clone()));
        let records = Arc::new(RecordStore::new(ledger.clone(), content.clone()));
        let keys = KeyDeriver::default();
        let packager = DisclosurePackager::new(
            ledger.clone(),
            engine.clone(),
            records.clone(),
            content.clone(),
            keys.clone(),
        );
        Fixture {
            ledger,
            content,
            engine,
            records,
            packager,
            keys,
        }
    }

    async fn seed_record(
        f: &Fixture,
        provider: &Address,
        patient: &Address,
        id: &RecordId,
        payload: serde_json::Value,
        key: &SecretKey,
    ) {
        let cid = f.records.put_payload(&payload, key).await.unwrap();
        f.records
            .add_record(provider, patient, id, cid, 100)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bundle_contains_exactly_the_approved_subset() {
        let f = fixture().await;
        let (p, provider, doctor) = (addr("0xp1"), addr("0xd1"), addr("0xd2"));
        f.engine.register_patient(&p).await.unwrap();
        f.engine.grant_access(&p, &provider).await.unwrap();

        let patient_key = f.keys.derive_key(p.as_str());
        for (id, note) in [("a", "blood panel"), ("b", "x-ray"), ("c", "private")] {
            seed_record(
                &f,
                &provider,
                &p,
                &rec(id),
                serde_json::json!({"note": note}),
                &patient_key,
            )
            .await;
        }

        let request_id = f
            .engine
            .request_access(&doctor, &p, vec![rec("a"), rec("b"), rec("c")], "review", 3600)
            .await
            .unwrap();

        let outcome = f
            .packager
            .approve_request(&p, &request_id, &[rec("a"), rec("b")])
            .await
            .unwrap();

        let bundle = f.packager.open_bundle(&doctor, &p).await.unwrap();
        assert_eq!(bundle.records.len(), 2);
        assert_eq!(bundle.authorized_records, vec![rec("a"), rec("b")]);
        assert!(bundle.record(&rec("a")).is_some());
        assert!(bundle.record(&rec("b")).is_some());
        assert!(bundle.record(&rec("c")).is_none());
        assert_eq!(bundle.record(&rec("a")).unwrap().data["note"], "blood panel");
        assert_eq!(outcome.capability.authorized_records, vec![rec("a"), rec("b")]);
    }

    #[tokio::test]
    async fn test_provider_key_fallback() {
        let f = fixture().await;
        let (p, provider, doctor) = (addr("0xp1"), addr("0xd1"), addr("0xd2"));
        f.engine.register_patient(&p).await.unwrap();
        f.engine.grant_access(&p, &provider).await.unwrap();

        // Older flow: the payload was encrypted under the provider's key
        let provider_key = f.keys.derive_key(provider.as_str());
        seed_record(
            &f,
            &provider,
            &p,
            &rec("legacy"),
            serde_json::json!({"note": "written by provider"}),
            &provider_key,
        )
        .await;

        let request_id = f
            .engine
            .request_access(&doctor, &p, vec![rec("legacy")], "review", 3600)
            .await
            .unwrap();
        f.packager
            .approve_request(&p, &request_id, &[rec("legacy")])
            .await
            .unwrap();

        let bundle = f.packager.open_bundle(&doctor, &p).await.unwrap();
        assert_eq!(
            bundle.record(&rec("legacy")).unwrap().data["note"],
            "written by provider"
        );
    }

    #[tokio::test]
    async fn test_missing_blob_aborts_whole_approval() {
        let f = fixture().await;
        let (p, provider, doctor) = (addr("0xp1"), addr("0xd1"), addr("0xd2"));
        f.engine.register_patient(&p).await.unwrap();
        f.engine.grant_access(&p, &provider).await.unwrap();

        let patient_key = f.keys.derive_key(p.as_str());
        seed_record(
            &f,
            &provider,
            &p,
            &rec("ok"),
            serde_json::json!({"note": "fine"}),
            &patient_key,
        )
        .await;
        // A record whose cid was never published
        f.records
            .add_record(&provider, &p, &rec("hole"), Cid::new("bafy-missing"), 100)
            .await
            .unwrap();

        let request_id = f
            .engine
            .request_access(&doctor, &p, vec![rec("ok"), rec("hole")], "review", 3600)
            .await
            .unwrap();

        let result = f
            .packager
            .approve_request(&p, &request_id, &[rec("ok"), rec("hole")])
            .await;
        assert!(result.is_err());

        // Nothing partial was committed
        let request = f.engine.get_access_request(&request_id).await.unwrap();
        assert_eq!(request.state, RequestState::Pending);
        assert!(f.engine.get_doctor_access(&p, &doctor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_approval_issues_no_write_grant() {
        let f = fixture().await;
        let (p, provider, doctor) = (addr("0xp1"), addr("0xd1"), addr("0xd2"));
        f.engine.register_patient(&p).await.unwrap();
        f.engine.grant_access(&p, &provider).await.unwrap();

        let patient_key = f.keys.derive_key(p.as_str());
        seed_record(
            &f,
            &provider,
            &p,
            &rec("r1"),
            serde_json::json!({"note": "x"}),
            &patient_key,
        )
        .await;

        let request_id = f
            .engine
            .request_access(&doctor, &p, vec![rec("r1")], "review", 3600)
            .await
            .unwrap();
        f.packager
            .approve_request(&p, &request_id, &[rec("r1")])
            .await
            .unwrap();

        // Read capability exists, write grant does not
        assert!(f.engine.has_doctor_access(&p, &doctor, &rec("r1")).await.unwrap());
        assert!(!f.engine.has_access(&p, &doctor).await.unwrap());
    }

    #[tokio::test]
    async fn test_other_identity_cannot_open_the_bundle() {
        let f = fixture().await;
        let (p, provider, doctor) = (addr("0xp1"), addr("0xd1"), addr("0xd2"));
        f.engine.register_patient(&p).await.unwrap();
        f.engine.grant_access(&p, &provider).await.unwrap();

        let patient_key = f.keys.derive_key(p.as_str());
        seed_record(
            &f,
            &provider,
            &p,
            &rec("r1"),
            serde_json::json!({"note": "sensitive"}),
            &patient_key,
        )
        .await;

        let request_id = f
            .engine
            .request_access(&doctor, &p, vec![rec("r1")], "review", 3600)
            .await
            .unwrap();
        let outcome = f
            .packager
            .approve_request(&p, &request_id, &[rec("r1")])
            .await
            .unwrap();

        // The envelope itself only opens under the recipient's key
        let blob = f.content.get(&outcome.shared_cid).await.unwrap();
        let envelope = String::from_utf8(blob.to_vec()).unwrap();
        let intruder_key = f.keys.derive_key("0xd9");
        assert!(matches!(
            decrypt_json(&envelope, &intruder_key),
            Err(MedichainError::Decryption(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_capability_refuses_to_open() {
        let f = fixture().await;
        let (p, provider, doctor) = (addr("0xp1"), addr("0xd1"), addr("0xd2"));
        f.engine.register_patient(&p).await.unwrap();
        f.engine.grant_access(&p, &provider).await.unwrap();

        let patient_key = f.keys.derive_key(p.as_str());
        seed_record(
            &f,
            &provider,
            &p,
            &rec("r1"),
            serde_json::json!({"note": "x"}),
            &patient_key,
        )
        .await;

        let request_id = f
            .engine
            .request_access(&doctor, &p, vec![rec("r1")], "review", 600)
            .await
            .unwrap();
        f.packager
            .approve_request(&p, &request_id, &[rec("r1")])
            .await
            .unwrap();

        f.packager.open_bundle(&doctor, &p).await.unwrap();

        f.ledger.advance(601);
        assert!(matches!(
            f.packager.open_bundle(&doctor, &p).await,
            Err(MedichainError::Unauthorized(_))
        ));
    }
}
