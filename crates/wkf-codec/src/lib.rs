#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wkf-codec** – Versioned value serialization and per-run encryption
//! (§4.I).
//!
//! Two concerns live here, deliberately in one crate since every
//! [`wkf_types::SerializedData`] blob is the product of both: which wire
//! format encoded the bytes (binary `rmp-serde` from spec version 2 onward,
//! legacy JSON for spec version 1, grounded on `toka-store-core`'s
//! `rmp_serde::to_vec_named` usage for the binary path) and whether the
//! bytes are AES-256-GCM ciphertext. The `encr` marker that flags ciphertext
//! on the wire is defined here, not in [`RunCipher`] — the cipher only knows
//! how to turn bytes into bytes, the codec is what decides a blob is
//! "encrypted" and needs unwrapping before decode. [`run_cipher`] caches the
//! imported cipher per run so callers never pay the import cost more than
//! once per run.

use std::sync::{Arc, RwLock};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;

use wkf_types::{RunId, SerializedData, LEGACY_SPEC_VERSION};

/// Magic prefix marking a byte string as AES-256-GCM ciphertext, owned by
/// the serialization layer rather than [`RunCipher`] per §4.I.
pub const ENCRYPTED_MARKER: &[u8] = b"encr";

const NONCE_LEN: usize = 12;

/// Errors from encoding, decoding, or (de)crypting a value.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The binary or legacy-JSON payload could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serde(String),
    /// AES-GCM encryption or decryption failed (e.g. tampered auth tag).
    #[error("crypto operation failed: {0}")]
    Crypto(String),
    /// A blob marked `encrypted` lacked the expected `encr` prefix, or one
    /// marked plaintext carried it — the blob and its flag disagree.
    #[error("encrypted-marker mismatch: {0}")]
    MarkerMismatch(String),
}

/// Encode `value` as an unencrypted [`SerializedData`] blob under
/// `spec_version`.
pub fn encode<T: Serialize>(value: &T, spec_version: u32) -> Result<SerializedData, CodecError> {
    let bytes = encode_bytes(value, spec_version)?;
    Ok(SerializedData { spec_version, encrypted: false, bytes })
}

/// Decode an unencrypted [`SerializedData`] blob.
///
/// Callers holding a possibly-encrypted blob should use
/// [`decode_maybe_encrypted`] instead; this function errors if `data.encrypted`.
pub fn decode<T: DeserializeOwned>(data: &SerializedData) -> Result<T, CodecError> {
    if data.encrypted {
        return Err(CodecError::MarkerMismatch(
            "blob is encrypted; use decode_maybe_encrypted with a RunCipher".to_string(),
        ));
    }
    decode_bytes(&data.bytes, data.spec_version)
}

/// Encode `value`, then encrypt it under `cipher`, producing a blob with
/// `encrypted = true`.
pub fn encode_encrypted<T: Serialize>(
    value: &T,
    spec_version: u32,
    cipher: &RunCipher,
) -> Result<SerializedData, CodecError> {
    let plaintext = encode_bytes(value, spec_version)?;
    let wire = cipher.encrypt(&plaintext);
    Ok(SerializedData { spec_version, encrypted: true, bytes: wire })
}

/// Decode a [`SerializedData`] blob that may or may not be encrypted.
///
/// `cipher` must be `Some` if `data.encrypted`; its absence there is a
/// caller bug (a run with a per-run key should always have it available)
/// and is reported as a [`CodecError::Crypto`].
pub fn decode_maybe_encrypted<T: DeserializeOwned>(
    data: &SerializedData,
    cipher: Option<&RunCipher>,
) -> Result<T, CodecError> {
    if !data.encrypted {
        return decode_bytes(&data.bytes, data.spec_version);
    }
    let cipher = cipher.ok_or_else(|| {
        CodecError::Crypto("blob is encrypted but no per-run key was supplied".to_string())
    })?;
    let plaintext = cipher.decrypt(&data.bytes)?;
    decode_bytes(&plaintext, data.spec_version)
}

fn encode_bytes<T: Serialize>(value: &T, spec_version: u32) -> Result<Vec<u8>, CodecError> {
    if spec_version == LEGACY_SPEC_VERSION {
        serde_json::to_vec(value).map_err(|e| CodecError::Serde(e.to_string()))
    } else {
        rmp_serde::to_vec_named(value).map_err(|e| CodecError::Serde(e.to_string()))
    }
}

fn decode_bytes<T: DeserializeOwned>(bytes: &[u8], spec_version: u32) -> Result<T, CodecError> {
    if spec_version == LEGACY_SPEC_VERSION {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Serde(e.to_string()))
    } else {
        rmp_serde::from_slice(bytes).map_err(|e| CodecError::Serde(e.to_string()))
    }
}

/// Strip encryption from `data`, returning an equivalent unencrypted blob
/// whose bytes are still codec-encoded (not yet deserialized to a concrete
/// type). A no-op if `data` is already unencrypted.
///
/// Used by the step handler (§4.G "hydrate arguments") to peel off
/// transport encryption before handing a value to a registered step
/// function, which decodes it to its own type via [`decode`].
pub fn strip_encryption(
    data: &SerializedData,
    cipher: Option<&RunCipher>,
) -> Result<SerializedData, CodecError> {
    if !data.encrypted {
        return Ok(data.clone());
    }
    let cipher = cipher.ok_or_else(|| {
        CodecError::Crypto("blob is encrypted but no per-run key was supplied".to_string())
    })?;
    let plaintext = cipher.decrypt(&data.bytes)?;
    Ok(SerializedData { spec_version: data.spec_version, encrypted: false, bytes: plaintext })
}

/// Encrypt already-encoded `data` under `cipher` if present, otherwise pass
/// it through unchanged. The mirror of [`strip_encryption`] for values
/// flowing back out (a step's result, a run's output).
pub fn apply_encryption(data: SerializedData, cipher: Option<&RunCipher>) -> SerializedData {
    match cipher {
        Some(cipher) => {
            let wire = cipher.encrypt(&data.bytes);
            SerializedData { spec_version: data.spec_version, encrypted: true, bytes: wire }
        }
        None => data,
    }
}

/// A per-run AES-256-GCM cipher, imported once from a 32-byte key and reused
/// for every step/run value encrypted or decrypted during that run (§4.I:
/// "The `importKey` → `encrypt`/`decrypt` trio is called once per run to
/// avoid repeated key import cost").
pub struct RunCipher {
    cipher: Aes256Gcm,
}

impl RunCipher {
    /// Import a 32-byte key, ready for repeated `encrypt`/`decrypt` calls.
    pub fn new(key: [u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&key);
        Self { cipher: Aes256Gcm::new(key) }
    }

    /// Encrypt `plaintext`, returning `[marker][12-byte nonce][ciphertext + 16-byte tag]`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        // A freshly generated 96-bit nonce makes key reuse safe here; the
        // cipher is never reused across runs (one RunCipher per run key).
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .expect("AES-256-GCM encryption over a bounded in-memory buffer cannot fail");
        let mut wire = Vec::with_capacity(ENCRYPTED_MARKER.len() + NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(ENCRYPTED_MARKER);
        wire.extend_from_slice(&nonce_bytes);
        wire.extend_from_slice(&ciphertext);
        wire
    }

    /// Decrypt a blob produced by [`Self::encrypt`]. Errors on a missing
    /// marker, truncated nonce, or a failed auth-tag check (tampering).
    pub fn decrypt(&self, wire: &[u8]) -> Result<Vec<u8>, CodecError> {
        let rest = wire.strip_prefix(ENCRYPTED_MARKER).ok_or_else(|| {
            CodecError::MarkerMismatch("ciphertext missing encr marker".to_string())
        })?;
        if rest.len() < NONCE_LEN {
            return Err(CodecError::MarkerMismatch("ciphertext shorter than nonce".to_string()));
        }
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CodecError::Crypto("auth tag verification failed".to_string()))
    }
}

/// How many per-run [`RunCipher`]s the process-wide cache keeps resident at
/// once before evicting the least-recently-inserted entry.
const CIPHER_CACHE_CAPACITY: usize = 1024;

static CIPHER_CACHE: Lazy<RwLock<IndexMap<RunId, Arc<RunCipher>>>> =
    Lazy::new(|| RwLock::new(IndexMap::new()));

/// Returns the process-wide cached [`RunCipher`] for `run_id`, importing one
/// from `key` on first use (§4.I: "The `importKey` → `encrypt`/`decrypt`
/// trio is called once per run to avoid repeated key import cost").
///
/// Grounded on the `once_cell::sync::Lazy<RwLock<..>>` registry pattern
/// already used by `wkf-orchestrator::registry` and
/// `wkf-runtime::step_registry`; capped at [`CIPHER_CACHE_CAPACITY`]
/// entries, evicting the oldest insertion once full, since a long-lived
/// process would otherwise accumulate one entry per run forever.
pub fn run_cipher(run_id: &RunId, key: [u8; 32]) -> Arc<RunCipher> {
    if let Some(cipher) = CIPHER_CACHE.read().expect("cipher cache lock poisoned").get(run_id) {
        return cipher.clone();
    }
    let mut cache = CIPHER_CACHE.write().expect("cipher cache lock poisoned");
    if let Some(cipher) = cache.get(run_id) {
        return cipher.clone();
    }
    let cipher = Arc::new(RunCipher::new(key));
    if cache.len() >= CIPHER_CACHE_CAPACITY {
        cache.shift_remove_index(0);
    }
    cache.insert(run_id.clone(), cipher.clone());
    cipher
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        message: String,
        value: i32,
    }

    fn sample() -> Payload {
        Payload { message: "hello".to_string(), value: 42 }
    }

    #[test]
    fn binary_round_trip() {
        let data = encode(&sample(), 2).unwrap();
        assert!(!data.encrypted);
        let back: Payload = decode(&data).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn legacy_json_round_trip() {
        let data = encode(&sample(), LEGACY_SPEC_VERSION).unwrap();
        let back: Payload = decode(&data).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let cipher = RunCipher::new([3u8; 32]);
        let data = encode_encrypted(&sample(), 2, &cipher).unwrap();
        assert!(data.encrypted);
        let back: Payload = decode_maybe_encrypted(&data, Some(&cipher)).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn tampered_auth_tag_fails_to_decrypt() {
        let cipher = RunCipher::new([9u8; 32]);
        let mut data = encode_encrypted(&sample(), 2, &cipher).unwrap();
        let last = data.bytes.len() - 1;
        data.bytes[last] ^= 0xFF;
        let result: Result<Payload, _> = decode_maybe_encrypted(&data, Some(&cipher));
        assert!(result.is_err());
    }

    #[test]
    fn decrypting_without_cipher_errors() {
        let cipher = RunCipher::new([1u8; 32]);
        let data = encode_encrypted(&sample(), 2, &cipher).unwrap();
        let result: Result<Payload, _> = decode_maybe_encrypted(&data, None);
        assert!(matches!(result, Err(CodecError::Crypto(_))));
    }

    #[test]
    fn distinct_encryptions_use_distinct_nonces() {
        let cipher = RunCipher::new([5u8; 32]);
        let a = encode_encrypted(&sample(), 2, &cipher).unwrap();
        let b = encode_encrypted(&sample(), 2, &cipher).unwrap();
        assert_ne!(a.bytes, b.bytes);
    }

    #[test]
    fn run_cipher_is_cached_per_run() {
        let run_id = RunId::new("wrun_01HV0000000000000000000CACHE1").unwrap();
        let first = run_cipher(&run_id, [11u8; 32]);
        let second = run_cipher(&run_id, [0u8; 32]);
        assert!(Arc::ptr_eq(&first, &second), "second call must reuse the cached cipher, not re-import");

        let other_run = RunId::new("wrun_01HV0000000000000000000CACHE2").unwrap();
        let third = run_cipher(&other_run, [22u8; 32]);
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
