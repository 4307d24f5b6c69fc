//! Symmetric encryption for record payloads and shared bundles.
//!
//! # Algorithms
//!
//! - **Key Derivation**: PBKDF2-HMAC-SHA256 with a fixed application-wide
//!   salt, 256-bit output
//! - **Encryption**: AES-256-GCM (authenticated encryption)
//! - **Envelope**: base64( 12-byte IV ‖ ciphertext-and-tag ) of a UTF-8
//!   JSON string
//!
//! Key derivation is deterministic: the same identity string always yields
//! the same key. Any party who knows an account address can derive the key
//! associated with it; confidentiality rests on not knowing which
//! ciphertext targets which address, not on secrecy of the derivation.
//! Encryption is not deterministic: a fresh IV is drawn per call, so
//! repeated encryption of identical plaintext yields different envelopes.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::types::{Address, MedichainError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Fixed application-wide salt for identity key derivation.
pub const KDF_SALT: &[u8] = b"medichain-key-derivation-v1";

/// Public suffix appended to an address to derive its emergency fast-path
/// key. Deliberately a known constant: anyone holding a QR payload can
/// derive this key. Availability over confidentiality.
pub const EMERGENCY_KEY_SALT: &str = ":medichain-emergency-v1";

/// Minimum PBKDF2 iteration count.
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

/// IV length for AES-GCM (12 bytes).
pub const NONCE_LEN: usize = 12;

/// Derived key length (32 bytes, AES-256).
pub const KEY_LEN: usize = 32;

/// AES-GCM auth tag length (16 bytes).
pub const AUTH_TAG_LEN: usize = 16;

// =============================================================================
// Keys
// =============================================================================

/// A derived 256-bit encryption key. Zeroized on drop.
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Derives per-identity keys with a configurable PBKDF2 cost.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    iterations: u32,
}

impl KeyDeriver {
    /// Create a deriver with the given iteration count. Counts below the
    /// application minimum are raised to it.
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(MIN_KDF_ITERATIONS),
        }
    }

    /// Derive the key for an identity string.
    ///
    /// The identity is case-folded before derivation so differently-cased
    /// renderings of the same address agree on the key.
    pub fn derive_key(&self, identity: &str) -> SecretKey {
        let normalized = identity.trim().to_lowercase();
        let mut key = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(normalized.as_bytes(), KDF_SALT, self.iterations, &mut key);
        SecretKey(key)
    }

    /// Derive the emergency fast-path key for a patient address.
    ///
    /// Keyed by address plus a fixed public salt rather than a recipient
    /// identity, so it can be derived offline from a QR payload alone.
    pub fn derive_emergency_key(&self, patient: &Address) -> SecretKey {
        self.derive_key(&format!("{}{}", patient.as_str(), EMERGENCY_KEY_SALT))
    }
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self::new(MIN_KDF_ITERATIONS)
    }
}

// =============================================================================
// Envelope encryption
// =============================================================================

/// Encrypt a JSON payload into a base64 envelope.
///
/// A fresh random 12-byte IV is drawn per call and prepended to the
/// AES-GCM ciphertext before base64 encoding.
pub fn encrypt_json(payload: &serde_json::Value, key: &SecretKey) -> Result<String> {
    let plaintext = serde_json::to_vec(payload)?;

    let mut iv = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
        .map_err(|_| MedichainError::Internal("AES-GCM encryption failed".into()))?;

    let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    framed.extend_from_slice(&iv);
    framed.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(framed))
}

/// Decrypt a base64 envelope back into its JSON payload.
///
/// Payloads that are plain base64-encoded JSON (no AES framing) are
/// accepted as an unencrypted passthrough format for bootstrap content:
/// the raw base64-decode is tried as JSON before any AEAD work.
///
/// Fails with [`MedichainError::Decryption`] on auth-tag mismatch. Callers
/// must treat that as "wrong key", not "corrupted", and may retry with an
/// alternate candidate key before surfacing the error.
pub fn decrypt_json(envelope: &str, key: &SecretKey) -> Result<serde_json::Value> {
    let framed = BASE64
        .decode(envelope.trim())
        .map_err(|e| MedichainError::Decryption(format!("invalid base64 envelope: {e}")))?;

    // Unencrypted passthrough: base64-wrapped JSON with no AES framing.
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&framed) {
        return Ok(value);
    }

    if framed.len() < NONCE_LEN + AUTH_TAG_LEN {
        return Err(MedichainError::Decryption(format!(
            "envelope too short: {} bytes",
            framed.len()
        )));
    }

    let (iv, ciphertext) = framed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| MedichainError::Decryption("auth tag mismatch (wrong key?)".into()))?;

    serde_json::from_slice(&plaintext).map_err(MedichainError::from)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deriver() -> KeyDeriver {
        KeyDeriver::default()
    }

    #[test]
    fn test_derive_key_deterministic() {
        let d = deriver();
        let k1 = d.derive_key("0xAbC123");
        let k2 = d.derive_key("0xabc123");
        let k3 = d.derive_key("  0xABC123  ");

        // Case and whitespace folding: same identity, same key
        assert_eq!(k1.as_bytes(), k2.as_bytes());
        assert_eq!(k1.as_bytes(), k3.as_bytes());

        // Different identity, different key
        let other = d.derive_key("0xabc124");
        assert_ne!(k1.as_bytes(), other.as_bytes());
    }

    #[test]
    fn test_iteration_floor_enforced() {
        let d = KeyDeriver::new(1);
        let floor = KeyDeriver::new(MIN_KDF_ITERATIONS);
        assert_eq!(
            d.derive_key("0xaa").as_bytes(),
            floor.derive_key("0xaa").as_bytes()
        );
    }

    #[test]
    fn test_emergency_key_differs_from_identity_key() {
        let d = deriver();
        let patient = Address::new("0xpatient01");
        let identity = d.derive_key(patient.as_str());
        let emergency = d.derive_emergency_key(&patient);
        assert_ne!(identity.as_bytes(), emergency.as_bytes());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let d = deriver();
        let key = d.derive_key("0xpatient01");
        let payload = json!({
            "diagnosis": "hypertension",
            "vitals": {"bp": "140/90", "pulse": 72},
        });

        let envelope = encrypt_json(&payload, &key).unwrap();
        let decrypted = decrypt_json(&envelope, &key).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let d = deriver();
        let key = d.derive_key("0xpatient01");
        let payload = json!({"note": "identical plaintext"});

        let a = encrypt_json(&payload, &key).unwrap();
        let b = encrypt_json(&payload, &key).unwrap();

        // Required for unlinkability
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let d = deriver();
        let key = d.derive_key("0xpatient01");
        let wrong = d.derive_key("0xpatient02");
        let payload = json!({"secret": true});

        let envelope = encrypt_json(&payload, &key).unwrap();
        let result = decrypt_json(&envelope, &wrong);

        assert!(matches!(result, Err(MedichainError::Decryption(_))));
    }

    #[test]
    fn test_unencrypted_passthrough() {
        let d = deriver();
        let key = d.derive_key("0xanyone");
        let payload = json!({"bootstrap": "demo content"});

        // Plain base64-wrapped JSON, no AES framing
        let envelope = BASE64.encode(serde_json::to_vec(&payload).unwrap());
        let decrypted = decrypt_json(&envelope, &key).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn test_garbage_envelope_rejected() {
        let d = deriver();
        let key = d.derive_key("0xanyone");

        assert!(matches!(
            decrypt_json("not-base64!!!", &key),
            Err(MedichainError::Decryption(_))
        ));
        assert!(matches!(
            decrypt_json(&BASE64.encode(b"short"), &key),
            Err(MedichainError::Decryption(_))
        ));
    }
}
