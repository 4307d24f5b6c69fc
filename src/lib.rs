//! MediChain - patient-controlled medical record access and sharing
//!
//! Record payloads live encrypted in a content-addressed store; only
//! content ids and permission state are anchored on the ledger. The crate
//! provides:
//!
//! - **Ledger / Content Store adapters**: thin async seams over the
//!   external ledger and blob store, with in-memory reference backends
//! - **Crypto**: identity-derived AES-256-GCM envelope encryption
//! - **Access engine**: write grants plus the request → approve/deny →
//!   expire lifecycle for per-record read capabilities
//! - **Record store**: versioned, append-only record metadata with
//!   encrypted payload glue
//! - **Disclosure packager**: re-encrypts an approved record subset for a
//!   single recipient without exposing the patient's master key
//! - **Emergency**: lower-assurance disclosure artifacts and the
//!   `MEDICHAIN:` QR payload codec

pub mod access;
pub mod config;
pub mod content;
pub mod crypto;
pub mod disclosure;
pub mod emergency;
pub mod ledger;
pub mod records;
pub mod types;

pub use access::{AccessControlEngine, AccessRequest, DoctorAccess, RequestState};
pub use config::MedichainConfig;
pub use content::{ContentStore, GatewayContentStore, MemoryContentStore};
pub use crypto::KeyDeriver;
pub use disclosure::{DisclosurePackager, SharedBundle};
pub use emergency::{EmergencyProfile, EmergencyService};
pub use ledger::{Ledger, MemoryLedger};
pub use records::{RecordMeta, RecordStore};
pub use types::{Address, Cid, MedichainError, RecordId, RequestId, Result};
