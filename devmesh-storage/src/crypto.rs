//! Per-tenant field-level encryption for sensitive cache content.
//!
//! Each tenant gets its own AES-256-GCM data key, derived from a single
//! deployment-wide master secret via HKDF-SHA256 with the tenant id as the
//! `info` parameter. No tenant key is ever persisted; it is re-derived on
//! demand and zeroized once the cipher holding it is dropped.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use devmesh_core::model::{CachedSearchResult, TenantId};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

/// Substrings whose presence in a lowercased metadata key marks that entry's
/// value as sensitive. Matched by `contains`, not exact equality, so
/// `"user_api_key"` and `"apiKeyForService"` both match `"api_key"`/`"apikey"`.
pub const SENSITIVE_KEY_PATTERNS: &[&str] = &[
    "api_key",
    "apikey",
    "secret",
    "password",
    "passwd",
    "pwd",
    "access_token",
    "refresh_token",
    "token",
    "private_key",
    "credential",
    "authorization",
    "auth",
    "ssn",
    "credit_card",
    "cvv",
    "cvc",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEY_PATTERNS.iter().any(|p| lowered.contains(p))
}

/// Strips sensitive keys out of each result's metadata and bundles them into
/// a sidecar object keyed by the originating result id. Returns `None` if no
/// result carried anything sensitive, so callers can skip the encrypt step
/// entirely on the (common) plain-metadata path.
pub fn extract_sensitive_fields(results: &mut [CachedSearchResult]) -> Option<Map<String, Value>> {
    let mut sidecar = Map::new();
    for result in results.iter_mut() {
        let sensitive_keys: Vec<String> = result
            .metadata
            .keys()
            .filter(|k| is_sensitive_key(k))
            .cloned()
            .collect();
        if sensitive_keys.is_empty() {
            continue;
        }
        let mut extracted = Map::new();
        for key in sensitive_keys {
            if let Some(value) = result.metadata.remove(&key) {
                extracted.insert(key, value);
            }
        }
        sidecar.insert(result.id.clone(), Value::Object(extracted));
    }
    if sidecar.is_empty() {
        None
    } else {
        Some(sidecar)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("master secret must be at least {min} bytes, got {actual}")]
    WeakMasterSecret { min: usize, actual: usize },
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed: authentication error or corrupted ciphertext")]
    DecryptionFailed,
    #[error("ciphertext shorter than the {NONCE_SIZE}-byte nonce prefix")]
    Truncated,
}

impl devmesh_core::error::DevmeshError for CryptoError {
    fn error_code(&self) -> devmesh_core::error::ErrorCode {
        devmesh_core::error::ErrorCode::DecryptionFailed
    }
}

/// Derives per-tenant data keys from one master secret. Held for the
/// lifetime of the process; never touches persistent storage itself.
pub struct TenantKeyDeriver {
    master_secret: Vec<u8>,
}

impl TenantKeyDeriver {
    pub const MIN_SECRET_LEN: usize = 32;

    pub fn new(master_secret: Vec<u8>) -> Result<Self, CryptoError> {
        if master_secret.len() < Self::MIN_SECRET_LEN {
            return Err(CryptoError::WeakMasterSecret {
                min: Self::MIN_SECRET_LEN,
                actual: master_secret.len(),
            });
        }
        Ok(Self { master_secret })
    }

    pub fn derive(&self, tenant_id: TenantId) -> Result<TenantCipher, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(None, &self.master_secret);
        let mut key = [0u8; KEY_SIZE];
        let info = tenant_id.as_uuid();
        hkdf.expand(info.as_bytes(), &mut key)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::EncryptionFailed)?;
        key.zeroize();
        Ok(TenantCipher { cipher })
    }
}

impl Drop for TenantKeyDeriver {
    fn drop(&mut self) {
        self.master_secret.zeroize();
    }
}

/// AES-256-GCM cipher bound to one tenant's derived key. Ciphertext is
/// framed as `nonce (12 bytes) || ciphertext+tag`.
pub struct TenantCipher {
    cipher: Aes256Gcm,
}

impl TenantCipher {
    pub fn encrypt(&self, plaintext: &[u8], tenant_id: TenantId) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let aad = tenant_id.as_uuid();
        let payload = Payload {
            msg: plaintext,
            aad: aad.as_bytes(),
        };

        let ciphertext = self
            .cipher
            .encrypt(nonce, payload)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, framed: &[u8], tenant_id: TenantId) -> Result<Vec<u8>, CryptoError> {
        if framed.len() < NONCE_SIZE {
            return Err(CryptoError::Truncated);
        }
        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let aad = tenant_id.as_uuid();
        let payload = Payload {
            msg: ciphertext,
            aad: aad.as_bytes(),
        };

        self.cipher
            .decrypt(nonce, payload)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Encrypts a text field and returns it base64-encoded, for storing
    /// ciphertext in a `String`-typed struct field without a side channel.
    pub fn encrypt_field(&self, plaintext: &str, tenant_id: TenantId) -> Result<String, CryptoError> {
        let ciphertext = self.encrypt(plaintext.as_bytes(), tenant_id)?;
        Ok(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            ciphertext,
        ))
    }

    pub fn decrypt_field(&self, encoded: &str, tenant_id: TenantId) -> Result<String, CryptoError> {
        let framed = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let plaintext = self.decrypt(&framed, tenant_id)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }

    /// JSON-encodes `sidecar`, encrypts it, and base64-encodes the result for
    /// storage in a cache entry's `encrypted_data` metadata field.
    pub fn encrypt_sidecar(
        &self,
        sidecar: &Map<String, Value>,
        tenant_id: TenantId,
    ) -> Result<String, CryptoError> {
        let plaintext = serde_json::to_vec(sidecar).map_err(|_| CryptoError::EncryptionFailed)?;
        let ciphertext = self.encrypt(&plaintext, tenant_id)?;
        Ok(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            ciphertext,
        ))
    }

    /// Inverse of [`Self::encrypt_sidecar`]. Any failure — bad base64,
    /// authentication failure, malformed JSON — surfaces as
    /// [`CryptoError::DecryptionFailed`]; the spec treats sidecar decryption
    /// as all-or-nothing, never a partial or silently-empty result.
    pub fn decrypt_sidecar(
        &self,
        encoded: &str,
        tenant_id: TenantId,
    ) -> Result<Map<String, Value>, CryptoError> {
        let framed = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let plaintext = self.decrypt(&framed, tenant_id)?;
        serde_json::from_slice(&plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }
}
