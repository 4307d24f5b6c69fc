//! Access control engine: patient registration, write grants, and the
//! request → approve/deny → expire lifecycle for per-record read access.
//!
//! Two capabilities are deliberately independent:
//!
//! - a **write grant** `(patient, provider)` authorizes unlimited
//!   `add_record`/`update_record` calls until revoked, and by itself
//!   authorizes no reads;
//! - a **doctor access** capability, produced by approving an access
//!   request, authorizes reads of an explicit record subset until it
//!   expires or is revoked.
//!
//! Every mutating operation runs read-check-write inside one ledger
//! transaction; the ledger serializes transactions globally, so exactly
//! one terminal transition wins on any request and the loser observes
//! `NotPending` rather than a silent success.
//!
//! Expiry is lazy: a doctor-access row past `expires_at` fails the
//! authorization predicate at read time but stays in storage until
//! [`AccessControlEngine::cleanup_expired_access`] purges it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::ledger::{decode_row, encode_row, Ledger, LedgerEvent, LedgerTxn, StateKey};
use crate::types::{Address, Cid, MedichainError, RecordId, RequestId, Result};

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PatientRow {
    registered_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GrantRow {
    pub(crate) granted: bool,
    pub(crate) updated_at: u64,
}

/// Lifecycle state of an access request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Pending,
    Approved,
    Denied,
}

/// A third party's request to read a set of a patient's records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
    pub id: RequestId,
    pub doctor: Address,
    pub patient: Address,
    pub requested_records: Vec<RecordId>,
    pub reason: String,
    /// Requested validity window in seconds.
    pub requested_duration: u64,
    /// Ledger time at creation.
    pub timestamp: u64,
    pub state: RequestState,
}

/// The materialized read capability created by approving a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorAccess {
    /// Subset of the patient's record ids readable under this capability.
    /// Fixed at approval time; a new request is required to add records.
    pub authorized_records: Vec<RecordId>,
    /// Unix seconds after which the capability is invalid.
    pub expires_at: u64,
    /// Bundle published for the doctor by the disclosure packager. Stored
    /// as supplied; content integrity is the packager's responsibility.
    pub shared_data_cid: Cid,
    /// Ledger time of approval.
    pub granted_at: u64,
}

impl DoctorAccess {
    /// Whether the capability is still within its validity window.
    pub fn is_live(&self, now: u64) -> bool {
        now <= self.expires_at
    }
}

// =============================================================================
// Engine
// =============================================================================

/// The permission state machine over the ledger.
pub struct AccessControlEngine {
    ledger: Arc<dyn Ledger>,
}

impl AccessControlEngine {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register a patient address. Fails with `AlreadyRegistered` on a
    /// second call; nothing else auto-registers.
    pub async fn register_patient(&self, caller: &Address) -> Result<()> {
        let mut tx = self.ledger.begin().await?;
        let key = StateKey::Patient(caller.clone());
        if tx.get(&key).is_some() {
            return Err(MedichainError::AlreadyRegistered(caller.to_string()));
        }
        let row = PatientRow {
            registered_at: tx.now(),
        };
        tx.put(key, encode_row(&row)?);
        tx.commit()?;
        info!(patient = %caller, "Registered patient");
        Ok(())
    }

    pub async fn is_registered(&self, patient: &Address) -> Result<bool> {
        Ok(self
            .ledger
            .get(&StateKey::Patient(patient.clone()))
            .await?
            .is_some())
    }

    // -------------------------------------------------------------------------
    // Write grants
    // -------------------------------------------------------------------------

    /// Grant a provider write access to the caller's records. Idempotent;
    /// re-granting an existing edge is not an error.
    pub async fn grant_access(&self, caller: &Address, provider: &Address) -> Result<()> {
        let mut tx = self.ledger.begin().await?;
        require_registered(tx.as_ref(), caller)?;
        let row = GrantRow {
            granted: true,
            updated_at: tx.now(),
        };
        tx.put(
            StateKey::Grant(caller.clone(), provider.clone()),
            encode_row(&row)?,
        );
        tx.emit(LedgerEvent::AccessGranted {
            patient: caller.clone(),
            provider: provider.clone(),
        });
        tx.commit()?;
        info!(patient = %caller, provider = %provider, "Granted write access");
        Ok(())
    }

    /// Revoke a provider's write access. Revoking a never-granted edge is
    /// not an error. Does not retroactively invalidate already-issued
    /// doctor-access capabilities or already-fetched ciphertexts.
    pub async fn revoke_access(&self, caller: &Address, provider: &Address) -> Result<()> {
        let mut tx = self.ledger.begin().await?;
        require_registered(tx.as_ref(), caller)?;
        let row = GrantRow {
            granted: false,
            updated_at: tx.now(),
        };
        tx.put(
            StateKey::Grant(caller.clone(), provider.clone()),
            encode_row(&row)?,
        );
        tx.emit(LedgerEvent::AccessRevoked {
            patient: caller.clone(),
            provider: provider.clone(),
        });
        tx.commit()?;
        info!(patient = %caller, provider = %provider, "Revoked write access");
        Ok(())
    }

    /// Whether the provider currently holds a write grant for the patient.
    pub async fn has_access(&self, patient: &Address, provider: &Address) -> Result<bool> {
        let row = self
            .ledger
            .get(&StateKey::Grant(patient.clone(), provider.clone()))
            .await?;
        Ok(match row {
            Some(bytes) => decode_row::<GrantRow>(&bytes)?.granted,
            None => false,
        })
    }

    // -------------------------------------------------------------------------
    // Request lifecycle
    // -------------------------------------------------------------------------

    /// File a request to read specific records of a patient. No
    /// pre-existing write grant is required; this is the discovery path.
    pub async fn request_access(
        &self,
        caller: &Address,
        patient: &Address,
        record_ids: Vec<RecordId>,
        reason: &str,
        duration_secs: u64,
    ) -> Result<RequestId> {
        if duration_secs == 0 {
            return Err(MedichainError::InvalidDuration(duration_secs));
        }

        let mut tx = self.ledger.begin().await?;
        require_registered(tx.as_ref(), patient)?;

        let now = tx.now();
        let request_id = derive_request_id(caller, patient, now);
        let request = AccessRequest {
            id: request_id.clone(),
            doctor: caller.clone(),
            patient: patient.clone(),
            requested_records: record_ids,
            reason: reason.to_string(),
            requested_duration: duration_secs,
            timestamp: now,
            state: RequestState::Pending,
        };
        tx.put(
            StateKey::Request(request_id.clone()),
            encode_row(&request)?,
        );

        let mut pending = read_pending_index(tx.as_ref(), patient)?;
        pending.push(request_id.clone());
        tx.put(StateKey::PendingIndex(patient.clone()), encode_row(&pending)?);

        tx.emit(LedgerEvent::AccessRequested {
            request_id: request_id.clone(),
            doctor: caller.clone(),
            patient: patient.clone(),
        });
        tx.commit()?;

        info!(
            request_id = %request_id,
            doctor = %caller,
            patient = %patient,
            duration_secs,
            "Access requested"
        );
        Ok(request_id)
    }

    /// Approve a pending request, creating the doctor-access capability.
    ///
    /// Only the patient named in the request may approve, and only while
    /// the request is pending. `approved` may narrow the requested set but
    /// never widen it, and every approved id must be an existing record of
    /// the patient. The `shared_cid` is stored as supplied.
    pub async fn approve_access(
        &self,
        caller: &Address,
        request_id: &RequestId,
        approved: &[RecordId],
        shared_cid: Cid,
    ) -> Result<DoctorAccess> {
        let mut tx = self.ledger.begin().await?;
        let mut request = load_request(tx.as_ref(), request_id)?;

        if request.patient != *caller {
            return Err(MedichainError::Unauthorized(format!(
                "only patient {} may resolve request {request_id}",
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
            if tx
                .get(&StateKey::Record(request.patient.clone(), record_id.clone()))
                .is_none()
            {
                return Err(MedichainError::NotFound(format!(
                    "record {record_id} for patient {}",
                    request.patient
                )));
            }
        }

        let now = tx.now();
        let capability = DoctorAccess {
            authorized_records: approved.to_vec(),
            expires_at: now + request.requested_duration,
            shared_data_cid: shared_cid,
            granted_at: now,
        };
        tx.put(
            StateKey::DoctorAccess(request.patient.clone(), request.doctor.clone()),
            encode_row(&capability)?,
        );

        request.state = RequestState::Approved;
        tx.put(StateKey::Request(request_id.clone()), encode_row(&request)?);
        remove_from_pending_index(tx.as_mut(), &request.patient, request_id)?;

        tx.emit(LedgerEvent::AccessApproved {
            request_id: request_id.clone(),
            doctor: request.doctor.clone(),
            patient: request.patient.clone(),
        });
        tx.commit()?;

        info!(
            request_id = %request_id,
            doctor = %request.doctor,
            patient = %request.patient,
            records = capability.authorized_records.len(),
            expires_at = capability.expires_at,
            "Access approved"
        );
        Ok(capability)
    }

    /// Deny a pending request. Terminal; no capability is created.
    pub async fn deny_access(&self, caller: &Address, request_id: &RequestId) -> Result<()> {
        let mut tx = self.ledger.begin().await?;
        let mut request = load_request(tx.as_ref(), request_id)?;

        if request.patient != *caller {
            return Err(MedichainError::Unauthorized(format!(
                "only patient {} may resolve request {request_id}",
                request.patient
            )));
        }
        if request.state != RequestState::Pending {
            return Err(MedichainError::NotPending(request_id.to_string()));
        }

        request.state = RequestState::Denied;
        tx.put(StateKey::Request(request_id.clone()), encode_row(&request)?);
        remove_from_pending_index(tx.as_mut(), &request.patient, request_id)?;

        tx.emit(LedgerEvent::AccessDenied {
            request_id: request_id.clone(),
        });
        tx.commit()?;

        info!(request_id = %request_id, patient = %caller, "Access denied");
        Ok(())
    }

    pub async fn get_access_request(&self, request_id: &RequestId) -> Result<AccessRequest> {
        let bytes = self
            .ledger
            .get(&StateKey::Request(request_id.clone()))
            .await?
            .ok_or_else(|| MedichainError::NotFound(format!("request {request_id}")))?;
        decode_row(&bytes)
    }

    /// Request ids still pending for a patient.
    pub async fn get_pending_requests(&self, patient: &Address) -> Result<Vec<RequestId>> {
        let index = match self
            .ledger
            .get(&StateKey::PendingIndex(patient.clone()))
            .await?
        {
            Some(bytes) => decode_row::<Vec<RequestId>>(&bytes)?,
            None => return Ok(Vec::new()),
        };

        let mut pending = Vec::with_capacity(index.len());
        for id in index {
            if let Some(bytes) = self.ledger.get(&StateKey::Request(id.clone())).await? {
                if decode_row::<AccessRequest>(&bytes)?.state == RequestState::Pending {
                    pending.push(id);
                }
            }
        }
        Ok(pending)
    }

    // -------------------------------------------------------------------------
    // Doctor access
    // -------------------------------------------------------------------------

    /// The raw stored capability, if any, regardless of expiry.
    pub async fn get_doctor_access(
        &self,
        patient: &Address,
        doctor: &Address,
    ) -> Result<Option<DoctorAccess>> {
        match self
            .ledger
            .get(&StateKey::DoctorAccess(patient.clone(), doctor.clone()))
            .await?
        {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The authorization predicate for reads: true iff a live capability
    /// exists and the record is in its authorized set.
    pub async fn has_doctor_access(
        &self,
        patient: &Address,
        doctor: &Address,
        record_id: &RecordId,
    ) -> Result<bool> {
        let Some(access) = self.get_doctor_access(patient, doctor).await? else {
            return Ok(false);
        };
        let now = self.ledger.now().await?;
        Ok(access.is_live(now) && access.authorized_records.contains(record_id))
    }

    /// Hard-revoke the caller's outgoing capability for a doctor,
    /// regardless of `expires_at`. Idempotent.
    pub async fn revoke_doctor_access(&self, caller: &Address, doctor: &Address) -> Result<()> {
        let mut tx = self.ledger.begin().await?;
        tx.delete(&StateKey::DoctorAccess(caller.clone(), doctor.clone()));
        tx.commit()?;
        info!(patient = %caller, doctor = %doctor, "Doctor access revoked");
        Ok(())
    }

    /// Purge an expired capability to reclaim storage. Callable by anyone;
    /// a no-op unless the capability exists and is past expiry. Safe to
    /// call redundantly.
    pub async fn cleanup_expired_access(
        &self,
        patient: &Address,
        doctor: &Address,
    ) -> Result<bool> {
        let mut tx = self.ledger.begin().await?;
        let key = StateKey::DoctorAccess(patient.clone(), doctor.clone());
        let Some(bytes) = tx.get(&key) else {
            return Ok(false);
        };
        let access: DoctorAccess = decode_row(&bytes)?;
        if access.is_live(tx.now()) {
            return Ok(false);
        }
        tx.delete(&key);
        tx.commit()?;
        debug!(patient = %patient, doctor = %doctor, "Purged expired doctor access");
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Emergency gate
    // -------------------------------------------------------------------------

    /// Patient-controlled gate for the ledger-mediated emergency path.
    pub async fn set_emergency_access(&self, caller: &Address, allow: bool) -> Result<()> {
        let mut tx = self.ledger.begin().await?;
        require_registered(tx.as_ref(), caller)?;
        tx.put(
            StateKey::EmergencyAllowed(caller.clone()),
            encode_row(&allow)?,
        );
        tx.commit()?;
        info!(patient = %caller, allow, "Emergency access flag updated");
        Ok(())
    }

    pub async fn is_emergency_access_allowed(&self, patient: &Address) -> Result<bool> {
        match self
            .ledger
            .get(&StateKey::EmergencyAllowed(patient.clone()))
            .await?
        {
            Some(bytes) => decode_row(&bytes),
            None => Ok(false),
        }
    }

    /// Record the content id of the caller's provider-path emergency
    /// artifact.
    pub async fn update_emergency_data(&self, caller: &Address, cid: Cid) -> Result<()> {
        let mut tx = self.ledger.begin().await?;
        require_registered(tx.as_ref(), caller)?;
        tx.put(StateKey::EmergencyCid(caller.clone()), encode_row(&cid)?);
        tx.commit()?;
        info!(patient = %caller, cid = %cid, "Emergency data pointer updated");
        Ok(())
    }

    pub async fn emergency_data_cid(&self, patient: &Address) -> Result<Option<Cid>> {
        match self
            .ledger
            .get(&StateKey::EmergencyCid(patient.clone()))
            .await?
        {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Event-derived hints
    // -------------------------------------------------------------------------

    /// Rebuild "who currently holds a write grant" from the event log.
    ///
    /// Latest event per (patient, provider) pair wins, so re-delivered
    /// events are harmless. This is a UI hint only: event logs are a
    /// convenience, never a substitute for [`Self::has_access`] at the
    /// point of action.
    pub async fn write_grant_hints(&self, patient: &Address) -> Result<Vec<Address>> {
        let mut latest: BTreeMap<Address, bool> = BTreeMap::new();
        for event in self.ledger.events().await? {
            match event {
                LedgerEvent::AccessGranted {
                    patient: p,
                    provider,
                } if p == *patient => {
                    latest.insert(provider, true);
                }
                LedgerEvent::AccessRevoked {
                    patient: p,
                    provider,
                } if p == *patient => {
                    latest.insert(provider, false);
                }
                _ => {}
            }
        }
        Ok(latest
            .into_iter()
            .filter_map(|(provider, granted)| granted.then_some(provider))
            .collect())
    }
}

// =============================================================================
// Internal helpers
// =============================================================================

pub(crate) fn require_registered(tx: &dyn LedgerTxn, patient: &Address) -> Result<()> {
    if tx.get(&StateKey::Patient(patient.clone())).is_none() {
        return Err(MedichainError::NotFound(format!(
            "patient {patient} is not registered"
        )));
    }
    Ok(())
}

/// Whether the provider holds an active write grant, as seen inside an
/// open transaction.
pub(crate) fn grant_is_active(
    tx: &dyn LedgerTxn,
    patient: &Address,
    provider: &Address,
) -> Result<bool> {
    match tx.get(&StateKey::Grant(patient.clone(), provider.clone())) {
        Some(bytes) => Ok(decode_row::<GrantRow>(&bytes)?.granted),
        None => Ok(false),
    }
}

fn load_request(tx: &dyn LedgerTxn, request_id: &RequestId) -> Result<AccessRequest> {
    let bytes = tx
        .get(&StateKey::Request(request_id.clone()))
        .ok_or_else(|| MedichainError::NotFound(format!("request {request_id}")))?;
    decode_row(&bytes)
}

fn read_pending_index(tx: &dyn LedgerTxn, patient: &Address) -> Result<Vec<RequestId>> {
    match tx.get(&StateKey::PendingIndex(patient.clone())) {
        Some(bytes) => decode_row(&bytes),
        None => Ok(Vec::new()),
    }
}

fn remove_from_pending_index(
    tx: &mut dyn LedgerTxn,
    patient: &Address,
    request_id: &RequestId,
) -> Result<()> {
    let mut pending = read_pending_index(tx, patient)?;
    pending.retain(|id| id != request_id);
    tx.put(StateKey::PendingIndex(patient.clone()), encode_row(&pending)?);
    Ok(())
}

/// Derive a collision-resistant request id from requester, target, ledger
/// time, and a random nonce.
fn derive_request_id(doctor: &Address, patient: &Address, now: u64) -> RequestId {
    let nonce = Uuid::new_v4();
    let mut hasher = Sha256::new();
    hasher.update(doctor.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(patient.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(now.to_be_bytes());
    hasher.update(b"|");
    hasher.update(nonce.as_bytes());
    RequestId::new(hex::encode(hasher.finalize()))
}

// =============================================================================
// Tests
// =============================================================================
