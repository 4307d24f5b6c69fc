//! Record store facade: versioned record metadata on the ledger, encrypted
//! payloads in the content store.
//!
//! Records are append-only. A record's plaintext never touches the ledger;
//! only the ciphertext's content id does. "Deletion" is not supported:
//! revoking a provider's grant blocks future writes, not past reads of
//! already-obtained ciphertexts.
//!
//! Readers must treat `(cid, version)` as one atomic unit. [`RecordMeta`]
//! is always produced from a single ledger read, so a caller holding one
//! can never observe a torn update.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::access::{grant_is_active, require_registered, DoctorAccess};
use crate::content::ContentStore;
use crate::crypto::{encrypt_json, SecretKey};
use crate::ledger::{decode_row, encode_row, Ledger, LedgerEvent, LedgerTxn, StateKey};
use crate::types::{Address, Cid, MedichainError, RecordId, Result};

/// Metadata of one record version, read atomically from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    /// Pointer to the ciphertext blob in the content store.
    pub cid: Cid,
    /// Caller-supplied creation time, replaced by ledger time on update.
    pub timestamp: u64,
    /// The party who wrote the current version.
    pub provider: Address,
    /// Starts at 1, incremented by exactly 1 per successful update.
    pub version: u64,
}

fn read_record_index(tx: &dyn LedgerTxn, patient: &Address) -> Result<Vec<RecordId>> {
    match tx.get(&StateKey::RecordIndex(patient.clone())) {
        Some(bytes) => decode_row(&bytes),
        None => Ok(Vec::new()),
    }
}

/// Composes the ledger and content store for record access.
pub struct RecordStore {
    ledger: Arc<dyn Ledger>,
    content: Arc<dyn ContentStore>,
}

impl RecordStore {
    pub fn new(ledger: Arc<dyn Ledger>, content: Arc<dyn ContentStore>) -> Self {
        Self { ledger, content }
    }

    /// Create a record. The caller must hold a write grant from the
    /// patient; the record id must be unused for this patient.
    pub async fn add_record(
        &self,
        caller: &Address,
        patient: &Address,
        record_id: &RecordId,
        cid: Cid,
        timestamp: u64,
    ) -> Result<()> {
        let mut tx = self.ledger.begin().await?;
        require_registered(tx.as_ref(), patient)?;
        if !grant_is_active(tx.as_ref(), patient, caller)? {
            return Err(MedichainError::Unauthorized(format!(
                "provider {caller} holds no write grant from {patient}"
            )));
        }

        let key = StateKey::Record(patient.clone(), record_id.clone());
        if tx.get(&key).is_some() {
            return Err(MedichainError::DuplicateRecord {
                patient: patient.to_string(),
                record_id: record_id.to_string(),
            });
        }

        let meta = RecordMeta {
            cid: cid.clone(),
            timestamp,
            provider: caller.clone(),
            version: 1,
        };
        tx.put(key, encode_row(&meta)?);

        let mut index = read_record_index(tx.as_ref(), patient)?;
        index.push(record_id.clone());
        tx.put(StateKey::RecordIndex(patient.clone()), encode_row(&index)?);

        tx.emit(LedgerEvent::RecordAdded {
            patient: patient.clone(),
            record_id: record_id.clone(),
            cid: cid.clone(),
            provider: caller.clone(),
        });
        tx.commit()?;

        info!(patient = %patient, record_id = %record_id, cid = %cid, provider = %caller, "Record added");
        Ok(())
    }

    /// Replace a record's content, bumping its version by exactly 1. The
    /// caller must currently hold a write grant; past authorship is not
    /// enough.
    pub async fn update_record(
        &self,
        caller: &Address,
        patient: &Address,
        record_id: &RecordId,
        new_cid: Cid,
    ) -> Result<()> {
        let mut tx = self.ledger.begin().await?;
        require_registered(tx.as_ref(), patient)?;
        if !grant_is_active(tx.as_ref(), patient, caller)? {
            return Err(MedichainError::Unauthorized(format!(
                "provider {caller} holds no write grant from {patient}"
            )));
        }

        let key = StateKey::Record(patient.clone(), record_id.clone());
        let bytes = tx.get(&key).ok_or_else(|| {
            MedichainError::NotFound(format!("record {record_id} for patient {patient}"))
        })?;
        let mut meta: RecordMeta = decode_row(&bytes)?;

        meta.version += 1;
        meta.cid = new_cid.clone();
        meta.timestamp = tx.now();
        meta.provider = caller.clone();
        let version = meta.version;
        tx.put(key, encode_row(&meta)?);

        tx.emit(LedgerEvent::RecordUpdated {
            patient: patient.clone(),
            record_id: record_id.clone(),
            cid: new_cid.clone(),
        });
        tx.commit()?;

        info!(patient = %patient, record_id = %record_id, cid = %new_cid, version, "Record updated");
        Ok(())
    }

    /// Read one record's metadata. Authorized for the patient, a provider
    /// holding a write grant, or a doctor whose live capability covers
    /// this specific record.
    pub async fn get_record(
        &self,
        caller: &Address,
        patient: &Address,
        record_id: &RecordId,
    ) -> Result<RecordMeta> {
        if !self.may_read(caller, patient, Some(record_id)).await? {
            return Err(MedichainError::Unauthorized(format!(
                "{caller} may not read record {record_id} of {patient}"
            )));
        }

        let bytes = self
            .ledger
            .get(&StateKey::Record(patient.clone(), record_id.clone()))
            .await?
            .ok_or_else(|| {
                MedichainError::NotFound(format!("record {record_id} for patient {patient}"))
            })?;
        decode_row(&bytes)
    }

    /// List a patient's record ids. Authorized for the patient, a write
    /// grant holder, or a doctor with any live record-level capability.
    pub async fn record_ids(&self, caller: &Address, patient: &Address) -> Result<Vec<RecordId>> {
        if !self.may_read(caller, patient, None).await? {
            return Err(MedichainError::Unauthorized(format!(
                "{caller} may not list records of {patient}"
            )));
        }

        match self
            .ledger
            .get(&StateKey::RecordIndex(patient.clone()))
            .await?
        {
            Some(bytes) => decode_row(&bytes),
            None => Ok(Vec::new()),
        }
    }

    /// Encrypt a JSON payload under `key` and publish it, returning the
    /// content id for `add_record`/`update_record`.
    pub async fn put_payload(&self, payload: &serde_json::Value, key: &SecretKey) -> Result<Cid> {
        let envelope = encrypt_json(payload, key)?;
        self.content.put(Bytes::from(envelope.into_bytes())).await
    }

    /// Fetch the base64 envelope stored under a record's cid. Decryption
    /// and key-fallback policy belong to the caller.
    pub async fn fetch_envelope(&self, cid: &Cid) -> Result<String> {
        let blob = self.content.get(cid).await?;
        String::from_utf8(blob.to_vec())
            .map_err(|_| MedichainError::Internal(format!("blob {cid} is not UTF-8")))
    }

    async fn may_read(
        &self,
        caller: &Address,
        patient: &Address,
        record_id: Option<&RecordId>,
    ) -> Result<bool> {
        if caller == patient {
            return Ok(true);
        }

        if let Some(bytes) = self
            .ledger
            .get(&StateKey::Grant(patient.clone(), caller.clone()))
            .await?
        {
            if decode_row::<crate::access::GrantRow>(&bytes)?.granted {
                return Ok(true);
            }
        }

        if let Some(bytes) = self
            .ledger
            .get(&StateKey::DoctorAccess(patient.clone(), caller.clone()))
            .await?
        {
            let access: DoctorAccess = decode_row(&bytes)?;
            let now = self.ledger.now().await?;
            if access.is_live(now) {
                return Ok(match record_id {
                    Some(id) => access.authorized_records.contains(id),
                    None => !access.authorized_records.is_empty(),
                });
            }
        }

        Ok(false)
    }
}
