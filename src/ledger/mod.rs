//! Ledger abstraction: append-only event log plus key-value state with
//! atomic, globally serialized transactions.
//!
//! The permission engine and record store implement their state machines on
//! top of this seam; a production binding would submit the same transitions
//! to an external chain, while [`MemoryLedger`] serves tests, demos, and
//! local operation.
//!
//! Mutations follow read-check-write inside a single transaction. The
//! ledger confirms one transaction at a time, so the first terminal
//! transition on any row wins and later writers observe the committed
//! state. A transaction dropped without commit discards all of its writes.

mod memory;

pub use memory::MemoryLedger;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::{Address, Cid, RecordId, RequestId, Result};

/// Serialize a state row for storage.
pub(crate) fn encode_row<T: Serialize>(row: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(row)?)
}

/// Deserialize a stored state row.
pub(crate) fn decode_row<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Typed keys for ledger state rows.
///
/// One variant per table; values are `serde_json` rows owned by the
/// component that writes them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// Patient registration row.
    Patient(Address),
    /// Write-grant edge (patient, provider).
    Grant(Address, Address),
    /// Record row (patient, record id).
    Record(Address, RecordId),
    /// Materialized list of a patient's record ids.
    RecordIndex(Address),
    /// Access request row.
    Request(RequestId),
    /// Materialized list of a patient's pending request ids.
    PendingIndex(Address),
    /// Read capability row (patient, doctor).
    DoctorAccess(Address, Address),
    /// Pointer to the patient's provider-path emergency artifact.
    EmergencyCid(Address),
    /// Patient-controlled emergency display gate.
    EmergencyAllowed(Address),
}

impl StateKey {
    /// Flat storage key, namespaced per table.
    pub fn storage_key(&self) -> String {
        match self {
            StateKey::Patient(p) => format!("patient:{p}"),
            StateKey::Grant(p, v) => format!("grant:{p}:{v}"),
            StateKey::Record(p, r) => format!("record:{p}:{r}"),
            StateKey::RecordIndex(p) => format!("record-index:{p}"),
            StateKey::Request(id) => format!("request:{id}"),
            StateKey::PendingIndex(p) => format!("pending-index:{p}"),
            StateKey::DoctorAccess(p, d) => format!("doctor-access:{p}:{d}"),
            StateKey::EmergencyCid(p) => format!("emergency-cid:{p}"),
            StateKey::EmergencyAllowed(p) => format!("emergency-allowed:{p}"),
        }
    }
}

/// Events appended by committed transactions, in confirmation order.
///
/// Readers rebuilding state from the log must de-duplicate re-delivered
/// events: always take the latest event per key, never assume monotonic
/// delivery across separate queries.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum LedgerEvent {
    AccessGranted {
        patient: Address,
        provider: Address,
    },
    AccessRevoked {
        patient: Address,
        provider: Address,
    },
    AccessRequested {
        request_id: RequestId,
        doctor: Address,
        patient: Address,
    },
    AccessApproved {
        request_id: RequestId,
        doctor: Address,
        patient: Address,
    },
    AccessDenied {
        request_id: RequestId,
    },
    RecordAdded {
        patient: Address,
        record_id: RecordId,
        cid: Cid,
        provider: Address,
    },
    RecordUpdated {
        patient: Address,
        record_id: RecordId,
        cid: Cid,
    },
}

/// An open transaction holding the ledger's global commit guard.
///
/// Reads observe committed state overlaid with this transaction's own
/// buffered writes. Nothing becomes visible to other readers until
/// [`LedgerTxn::commit`] returns; dropping the transaction discards it.
pub trait LedgerTxn: Send {
    /// Read a row, seeing this transaction's pending writes first.
    fn get(&self, key: &StateKey) -> Option<Vec<u8>>;

    /// Buffer a row write.
    fn put(&mut self, key: StateKey, value: Vec<u8>);

    /// Buffer a row deletion.
    fn delete(&mut self, key: &StateKey);

    /// Buffer an event for emission on commit.
    fn emit(&mut self, event: LedgerEvent);

    /// Ledger time (unix seconds) as of transaction start.
    fn now(&self) -> u64;

    /// Atomically apply all buffered writes and events.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// The ledger call surface the core depends on.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Begin an atomic transaction. Blocks until the global commit guard
    /// is available; the ledger serializes all state-mutating calls.
    async fn begin<'a>(&'a self) -> Result<Box<dyn LedgerTxn + 'a>>;

    /// Read a committed row.
    async fn get(&self, key: &StateKey) -> Result<Option<Vec<u8>>>;

    /// The full event log in confirmation order.
    async fn events(&self) -> Result<Vec<LedgerEvent>>;

    /// Current ledger time in unix seconds.
    async fn now(&self) -> Result<u64>;
}
