//! Version-specific payload envelopes.
//!
//! Protocol 3.3 always encrypts and tags most bodies with a padded version
//! header; protocol 3.1 sends plaintext unless a command asks for encryption,
//! in which case the base64 ciphertext is signed with an MD5 digest.

use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use crate::protocol::{CommandType, Version};
use log::error;
use md5::{Digest, Md5};
use serde::Serialize;
use serde_json::Value;

/// Version tag (3 bytes) plus 12 bytes of zero padding.
const VERSION_HEADER_LEN: usize = 15;
const VERSION_HEADER_PAD: [u8; 12] = [0u8; 12];
const MD5_DIGEST_LEN: usize = 16;

/// The standard outbound command body. Field order matters on the wire and
/// matches what stock firmware expects.
#[derive(Serialize)]
pub struct CommandPayload<'a> {
    #[serde(rename = "gwId")]
    pub gw_id: &'a str,
    #[serde(rename = "devId")]
    pub dev_id: &'a str,
    pub t: u64,
    pub dps: &'a Value,
    pub uid: &'a str,
}

/// Wrap JSON payload bytes in the envelope for `version`.
///
/// An empty payload (heartbeats) produces an empty body in every version.
/// `encrypt` is only consulted for v3.1; v3.3 always encrypts.
pub fn encode_body(
    cipher: &TuyaCipher,
    local_key: &[u8; 16],
    version: Version,
    cmd: u32,
    plain: &[u8],
    encrypt: bool,
) -> Result<Vec<u8>> {
    if plain.is_empty() {
        return Ok(Vec::new());
    }

    match version {
        Version::V3_3 => {
            let ciphertext = cipher.encrypt(plain, false)?;
            if cmd == CommandType::DpQuery as u32 {
                Ok(ciphertext)
            } else {
                let mut body = Vec::with_capacity(VERSION_HEADER_LEN + ciphertext.len());
                body.extend_from_slice(version.as_bytes());
                body.extend_from_slice(&VERSION_HEADER_PAD);
                body.extend_from_slice(&ciphertext);
                Ok(body)
            }
        }
        Version::V3_1 => {
            if !encrypt {
                return Ok(plain.to_vec());
            }
            let b64 = cipher.encrypt(plain, true)?;

            let mut signed = Vec::with_capacity(b64.len() + 32);
            signed.extend_from_slice(b"data=");
            signed.extend_from_slice(&b64);
            signed.extend_from_slice(b"||lpv=");
            signed.extend_from_slice(version.as_bytes());
            signed.extend_from_slice(b"||");
            signed.extend_from_slice(local_key);
            let mut hasher = Md5::new();
            hasher.update(&signed);
            let digest = hasher.finalize();

            let mut body =
                Vec::with_capacity(version.as_bytes().len() + MD5_DIGEST_LEN + b64.len());
            body.extend_from_slice(version.as_bytes());
            body.extend_from_slice(&digest);
            body.extend_from_slice(&b64);
            Ok(body)
        }
    }
}

/// Strip the version envelope from an inbound body and parse the JSON inside.
///
/// An empty body and an unparseable JSON document both yield `Value::Null`;
/// the frame is still surfaced so callers can log and drop it. Decryption
/// failures propagate as errors.
pub fn decode_body(cipher: &TuyaCipher, version: Version, cmd: u32, body: &[u8]) -> Result<Value> {
    if body.is_empty() {
        return Ok(Value::Null);
    }

    let plain = match version {
        Version::V3_3 => {
            // Responses other than DP_QUERY carry the padded version tag.
            let ciphertext = if cmd == CommandType::DpQuery as u32 {
                body
            } else {
                if body.len() < VERSION_HEADER_LEN {
                    return Err(TuyaError::InvalidPayload);
                }
                &body[VERSION_HEADER_LEN..]
            };
            cipher.decrypt(ciphertext, false)?
        }
        Version::V3_1 => {
            let tag = version.as_bytes();
            if body.starts_with(tag) {
                // Version tag means the body is signed and encrypted.
                let skip = tag.len() + MD5_DIGEST_LEN;
                if body.len() < skip {
                    return Err(TuyaError::InvalidPayload);
                }
                cipher.decrypt(&body[skip..], true)?
            } else {
                body.to_vec()
            }
        }
    };

    match serde_json::from_slice(&plain) {
        Ok(value) => Ok(value),
        Err(e) => {
            error!(
                "Unable to decode JSON payload: {} ({})",
                e,
                String::from_utf8_lossy(&plain)
            );
            Ok(Value::Null)
        }
    }
}
