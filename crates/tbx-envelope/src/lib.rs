// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! tbx-envelope
#![deny(unsafe_code)]
#![warn(missing_docs)]

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tbx_core::{ENVELOPE_SCHEME, RouteAttrs};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Errors from sealing or opening an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The `v` field names a scheme this build does not speak.
    #[error("unsupported envelope scheme: {0}")]
    SchemeUnsupported(String),

    /// The key is not exactly 32 bytes.
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    KeyInvalid(usize),

    /// Authentication failed: wrong key, tampered ciphertext, or AAD mismatch.
    #[error("envelope authentication failed")]
    AuthFailed,

    /// A field was not valid base64 or had the wrong length.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The decrypted payload was not the expected JSON.
    #[error("envelope payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// The on-wire sealed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Scheme identifier, always [`ENVELOPE_SCHEME`].
    pub v: String,
    /// 12-byte nonce, base64.
    pub n: String,
    /// Ciphertext, base64.
    pub ct: String,
    /// 16-byte authentication tag, base64.
    pub tag: String,
}

/// Seal `plaintext` under `key`, binding it to `attrs` via the canonical AAD.
///
/// A fresh nonce is drawn from the OS RNG for every call.
pub fn encrypt(plaintext: &[u8], key: &[u8], attrs: &RouteAttrs) -> Result<Envelope, EnvelopeError> {
    let cipher = cipher_for(key)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let aad = attrs.canonical_aad();
    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| EnvelopeError::AuthFailed)?;

    // The aead crate appends the tag to the ciphertext; the wire form
    // carries them as separate fields.
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(Envelope {
        v: ENVELOPE_SCHEME.to_string(),
        n: B64.encode(nonce_bytes),
        ct: B64.encode(sealed),
        tag: B64.encode(tag),
    })
}

/// Open `envelope` under `key`, verifying the canonical AAD for `attrs`.
pub fn decrypt(
    envelope: &Envelope,
    key: &[u8],
    attrs: &RouteAttrs,
) -> Result<Vec<u8>, EnvelopeError> {
    if envelope.v != ENVELOPE_SCHEME {
        return Err(EnvelopeError::SchemeUnsupported(envelope.v.clone()));
    }
    let cipher = cipher_for(key)?;

    let nonce_bytes = decode_field("n", &envelope.n)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(EnvelopeError::Malformed(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce_bytes.len()
        )));
    }
    let mut sealed = decode_field("ct", &envelope.ct)?;
    let tag = decode_field("tag", &envelope.tag)?;
    if tag.len() != TAG_LEN {
        return Err(EnvelopeError::Malformed(format!(
            "tag must be {TAG_LEN} bytes, got {}",
            tag.len()
        )));
    }
    sealed.extend_from_slice(&tag);

    let aad = attrs.canonical_aad();
    cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &sealed,
                aad: &aad,
            },
        )
        .map_err(|_| EnvelopeError::AuthFailed)
}

/// Seal a JSON value.
pub fn seal_json(value: &Value, key: &[u8], attrs: &RouteAttrs) -> Result<Envelope, EnvelopeError> {
    let bytes = serde_json::to_vec(value)?;
    encrypt(&bytes, key, attrs)
}

/// Open an envelope and parse the plaintext as JSON.
pub fn open_json(
    envelope: &Envelope,
    key: &[u8],
    attrs: &RouteAttrs,
) -> Result<Value, EnvelopeError> {
    let bytes = decrypt(envelope, key, attrs)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Generate a fresh random 32-byte key, base64-encoded.
#[must_use]
pub fn generate_key_b64() -> String {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    B64.encode(key)
}

/// Decode a base64 key, enforcing the 32-byte length.
pub fn decode_key_b64(b64: &str) -> Result<[u8; KEY_LEN], EnvelopeError> {
    let bytes = B64
        .decode(b64.trim())
        .map_err(|e| EnvelopeError::Malformed(format!("key is not base64: {e}")))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| EnvelopeError::KeyInvalid(len))
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, EnvelopeError> {
    if key.len() != KEY_LEN {
        return Err(EnvelopeError::KeyInvalid(key.len()));
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| EnvelopeError::KeyInvalid(key.len()))
}

fn decode_field(name: &str, b64: &str) -> Result<Vec<u8>, EnvelopeError> {
    B64.decode(b64)
        .map_err(|e| EnvelopeError::Malformed(format!("field '{name}' is not base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbx_core::ChannelSide;

    fn test_key() -> [u8; 32] {
        [42u8; 32]
    }

    fn attrs(seq: u64) -> RouteAttrs {
        RouteAttrs {
            user_id: "u".into(),
            project_id: "p".into(),
            session_id: "s".into(),
            channel: ChannelSide::Req,
            kind: "tool".into(),
            seq,
        }
    }

    #[test]
    fn round_trip() {
        let key = test_key();
        let env = encrypt(b"hello world", &key, &attrs(7)).unwrap();
        assert_eq!(env.v, ENVELOPE_SCHEME);
        let back = decrypt(&env, &key, &attrs(7)).unwrap();
        assert_eq!(back, b"hello world");
    }

    #[test]
    fn round_trip_empty_plaintext() {
        let key = test_key();
        let env = encrypt(b"", &key, &attrs(0)).unwrap();
        assert_eq!(decrypt(&env, &key, &attrs(0)).unwrap(), b"");
    }

    #[test]
    fn wrong_key_fails_auth() {
        let env = encrypt(b"secret", &test_key(), &attrs(1)).unwrap();
        let err = decrypt(&env, &[0u8; 32], &attrs(1)).unwrap_err();
        assert!(matches!(err, EnvelopeError::AuthFailed));
    }

    #[test]
    fn seq_mismatch_fails_auth() {
        let env = encrypt(b"secret", &test_key(), &attrs(7)).unwrap();
        let err = decrypt(&env, &test_key(), &attrs(8)).unwrap_err();
        assert!(matches!(err, EnvelopeError::AuthFailed));
    }

    #[test]
    fn each_aad_field_is_binding() {
        let key = test_key();
        let base = attrs(7);
        let env = encrypt(b"payload", &key, &base).unwrap();

        let mut m = base.clone();
        m.user_id = "x".into();
        assert!(matches!(
            decrypt(&env, &key, &m),
            Err(EnvelopeError::AuthFailed)
        ));

        let mut m = base.clone();
        m.project_id = "x".into();
        assert!(matches!(
            decrypt(&env, &key, &m),
            Err(EnvelopeError::AuthFailed)
        ));

        let mut m = base.clone();
        m.session_id = "x".into();
        assert!(matches!(
            decrypt(&env, &key, &m),
            Err(EnvelopeError::AuthFailed)
        ));

        let m = base.reply();
        assert!(matches!(
            decrypt(&env, &key, &m),
            Err(EnvelopeError::AuthFailed)
        ));

        let mut m = base.clone();
        m.kind = "other".into();
        assert!(matches!(
            decrypt(&env, &key, &m),
            Err(EnvelopeError::AuthFailed)
        ));
    }

    #[test]
    fn scheme_mismatch_is_rejected_before_decrypt() {
        let key = test_key();
        let mut env = encrypt(b"x", &key, &attrs(1)).unwrap();
        env.v = "xchacha:v9".into();
        let err = decrypt(&env, &key, &attrs(1)).unwrap_err();
        assert!(matches!(err, EnvelopeError::SchemeUnsupported(s) if s == "xchacha:v9"));
    }

    #[test]
    fn short_key_is_rejected() {
        let err = encrypt(b"x", &[1u8; 16], &attrs(1)).unwrap_err();
        assert!(matches!(err, EnvelopeError::KeyInvalid(16)));
    }

    #[test]
    fn truncated_nonce_is_malformed() {
        let key = test_key();
        let mut env = encrypt(b"x", &key, &attrs(1)).unwrap();
        env.n = B64.encode([0u8; 5]);
        assert!(matches!(
            decrypt(&env, &key, &attrs(1)),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let key = test_key();
        let env = encrypt(b"attack at dawn", &key, &attrs(1)).unwrap();
        let mut ct = B64.decode(&env.ct).unwrap();
        ct[0] ^= 0xff;
        let tampered = Envelope {
            ct: B64.encode(ct),
            ..env
        };
        assert!(matches!(
            decrypt(&tampered, &key, &attrs(1)),
            Err(EnvelopeError::AuthFailed)
        ));
    }

    #[test]
    fn json_helpers_round_trip() {
        let key = test_key();
        let value = serde_json::json!({"id": "e1", "result": {"bytes": 5}});
        let env = seal_json(&value, &key, &attrs(3)).unwrap();
        assert_eq!(open_json(&env, &key, &attrs(3)).unwrap(), value);
    }

    #[test]
    fn generated_keys_decode_and_differ() {
        let k1 = generate_key_b64();
        let k2 = generate_key_b64();
        assert_ne!(k1, k2);
        assert_eq!(decode_key_b64(&k1).unwrap().len(), 32);
    }

    #[test]
    fn decode_key_rejects_wrong_length() {
        let short = B64.encode([0u8; 31]);
        assert!(matches!(
            decode_key_b64(&short),
            Err(EnvelopeError::KeyInvalid(31))
        ));
    }

    #[test]
    fn envelope_wire_shape() {
        let key = test_key();
        let env = encrypt(b"x", &key, &attrs(1)).unwrap();
        let v = serde_json::to_value(&env).unwrap();
        for field in ["v", "n", "ct", "tag"] {
            assert!(v.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(v["v"], ENVELOPE_SCHEME);
    }
}
