//! Opaque pagination cursor codec: signed (`HMAC-SHA256`) and encrypted
//! (`AES-256-GCM`) variants. No direct teacher analogue exists for
//! pagination itself, but `hmac`/`sha2` are already load-bearing in the
//! teacher's webhook signature validation; this module generalizes that
//! same signing primitive to cursor integrity, and adds `aes-gcm` as the
//! natural RustCrypto sibling for the encrypted mode.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;


pub const KEY_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// A page position, opaque to callers. Embedders define their own payload
/// shape and serialize it to bytes before encoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorPayload {
    pub offset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_id: Option<String>,
}

/// Encodes `payload` as `base64(payload).base64(HMAC-SHA256(payload))`.
pub fn sign(payload: &CursorPayload, key: &[u8; KEY_LEN]) -> String {
    let body = serde_json::to_vec(payload).expect("CursorPayload always serializes");
    let body_b64 = URL_SAFE_NO_PAD.encode(&body);

    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&body);
    let tag = mac.finalize().into_bytes();
    let tag_b64 = URL_SAFE_NO_PAD.encode(tag);

    format!("{body_b64}.{tag_b64}")
}

/// Decodes and verifies a cursor produced by [`sign`]. Any tamper or
/// truncation — malformed base64, missing separator, bad tag, or a tag
/// computed under a different key — yields `None`, never an error: an
/// invalid cursor is indistinguishable from "no cursor" to the caller.
pub fn verify(cursor: &str, key: &[u8; KEY_LEN]) -> Option<CursorPayload> {
    let (body_b64, tag_b64) = cursor.split_once('.')?;
    let body = URL_SAFE_NO_PAD.decode(body_b64).ok()?;
    let given_tag = URL_SAFE_NO_PAD.decode(tag_b64).ok()?;

    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(&body);
    mac.verify_slice(&given_tag).ok()?;

    serde_json::from_slice(&body).ok()
}

/// Encodes `payload` as `base64(iv).base64(AES-256-GCM(payload))`, hiding
/// the cursor's contents from the caller rather than merely authenticating
/// them.
pub fn encrypt(payload: &CursorPayload, key: &[u8; KEY_LEN]) -> String {
    let body = serde_json::to_vec(payload).expect("CursorPayload always serializes");
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher.encrypt(&nonce, body.as_ref()).expect("encryption over a bounded payload cannot fail");

    format!("{}.{}", URL_SAFE_NO_PAD.encode(nonce), URL_SAFE_NO_PAD.encode(ciphertext))
}

/// Decrypts a cursor produced by [`encrypt`]. Tamper or truncation yields
/// `None`, matching [`verify`]'s behavior.
pub fn decrypt(cursor: &str, key: &[u8; KEY_LEN]) -> Option<CursorPayload> {
    let (nonce_b64, ct_b64) = cursor.split_once('.')?;
    let nonce_bytes = URL_SAFE_NO_PAD.decode(nonce_b64).ok()?;
    let ciphertext = URL_SAFE_NO_PAD.decode(ct_b64).ok()?;

    if nonce_bytes.len() != 12 {
        return None;
    }
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plaintext = cipher.decrypt(nonce, ciphertext.as_ref()).ok()?;

    serde_json::from_slice(&plaintext).ok()
}
