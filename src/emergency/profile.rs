//! Emergency profile wire format and QR payload codec.
//!
//! The QR payload is `"MEDICHAIN:" + base64(JSON)` with single- and
//! two-letter field keys to keep the code density printable. The same
//! short-key JSON is used inside both emergency artifacts.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::types::{Address, MedichainError, Result};

/// Scheme prefix of an emergency QR payload.
pub const QR_PREFIX: &str = "MEDICHAIN:";

/// A person to contact in an emergency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyContact {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "p")]
    pub phone: String,
    #[serde(rename = "r")]
    pub relation: String,
}

/// The medical summary disclosed through the emergency paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyProfile {
    #[serde(rename = "pa")]
    pub patient: Address,
    #[serde(rename = "bt")]
    pub blood_type: String,
    #[serde(rename = "al")]
    pub allergies: Vec<String>,
    #[serde(rename = "co")]
    pub conditions: Vec<String>,
    #[serde(rename = "me")]
    pub medications: Vec<String>,
    #[serde(rename = "ct")]
    pub contacts: Vec<EmergencyContact>,
    #[serde(rename = "od")]
    pub organ_donor: bool,
    #[serde(rename = "dr")]
    pub dnr_order: bool,
    #[serde(rename = "nt")]
    pub notes: String,
    /// RFC 3339 stamp of the last edit.
    #[serde(rename = "lu")]
    pub last_updated: String,
}

/// Encode a profile as a QR payload.
pub fn encode_qr(profile: &EmergencyProfile) -> Result<String> {
    let json = serde_json::to_vec(profile)?;
    Ok(format!("{QR_PREFIX}{}", BASE64.encode(json)))
}

/// Decode a QR payload back into a profile. Rejects payloads without the
/// scheme prefix rather than guessing at foreign QR content.
pub fn decode_qr(payload: &str) -> Result<EmergencyProfile> {
    let encoded = payload.trim().strip_prefix(QR_PREFIX).ok_or_else(|| {
        MedichainError::Internal(format!("QR payload does not start with {QR_PREFIX}"))
    })?;
    let json = BASE64
        .decode(encoded)
        .map_err(|e| MedichainError::Internal(format!("QR payload is not base64: {e}")))?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
pub(crate) fn sample_profile(patient: &str) -> EmergencyProfile {
    EmergencyProfile {
        patient: Address::new(patient),
        blood_type: "O-".into(),
        allergies: vec!["penicillin".into()],
        conditions: vec!["type 1 diabetes".into()],
        medications: vec!["insulin".into()],
        contacts: vec![EmergencyContact {
            name: "Dana Reyes".into(),
            phone: "+1-555-0100".into(),
            relation: "spouse".into(),
        }],
        organ_donor: true,
        dnr_order: false,
        notes: "insulin pump on left side".into(),
        last_updated: "2025-06-01T12:00:00Z".into(),
    }
}
