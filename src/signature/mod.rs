//! Signature Engine (C3): verifies record authorship via a legacy
//! xpub-direct path or a v0.9 DID-document-derived path.

use std::collections::BTreeMap;

use bip32::{DerivationPath, XPub};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::Did;
use crate::{Error, Result};

/// How a verification method's leaf signing key is derived from its xpub.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeafPolicy {
    /// Leaf index is the SHA-256 digest of the canonicalized payload,
    /// truncated to 31 bits (keeps it a valid non-hardened BIP-32 index).
    PayloadDigest,
    /// Leaf index is a fixed, registration-time constant.
    Fixed,
}

/// One verification method within a v0.9 creator DID document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationMethod {
    pub vm_id: String,
    pub vm_type: String,
    pub xpub: String,
    pub derivation_prefix: String,
    pub leaf_policy: LeafPolicy,
    /// Fixed leaf index, used when `leaf_policy = Fixed`.
    #[serde(default)]
    pub fixed_leaf_index: Option<u32>,
    pub valid_from_block: u64,
    pub revoked_from_block: Option<u64>,
}

impl VerificationMethod {
    fn is_active_at(&self, height: u64) -> bool {
        height >= self.valid_from_block
            && self.revoked_from_block.map(|r| height < r).unwrap_or(true)
    }
}

/// A creator's registration: either a single legacy xpub, or a v0.9
/// document listing multiple verification methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CreatorRegistration {
    Legacy { xpub: String },
    V09 { methods: Vec<VerificationMethod> },
}

/// Which path produced a successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    Legacy,
    V09,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub is_valid: bool,
    pub mode: VerificationMode,
    pub vm_id: Option<String>,
    pub reason: Option<String>,
}

/// Canonicalizes a JSON payload for signing/verification: sorted keys, LF
/// line endings implicit in `serde_json`'s compact output, UTF-8, and the
/// `creator_signature` field excluded.
pub fn canonicalize(payload: &Value) -> Result<Vec<u8>> {
    let sorted = sort_keys(payload);
    serde_json::to_vec(&sorted).map_err(|e| Error::decode(format!("canonicalization failed: {e}")))
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: BTreeMap<String, Value> = BTreeMap::new();
            for (k, v) in map {
                if k == "creator_signature" {
                    continue;
                }
                sorted.insert(k.clone(), sort_keys(v));
            }
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Verifies `payload` was signed by `creator_did`'s registration, selecting
/// the legacy or v0.9 path by inspecting `registration`. `height` is the
/// record's block height (Arweave) or an absolute ordering index (GUN).
pub fn verify(
    registration: &CreatorRegistration,
    signature_b64: &str,
    payload: &Value,
    requested_vm_id: Option<&str>,
    height: u64,
) -> Result<VerificationOutcome> {
    let message_bytes = canonicalize(payload)?;
    let digest = Sha256::digest(&message_bytes);
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| Error::signature_invalid(format!("bad digest: {e}")))?;

    let signature = decode_signature(signature_b64)?;

    match registration {
        CreatorRegistration::Legacy { xpub } => {
            let public_key = legacy_public_key(xpub)?;
            let secp = Secp256k1::verification_only();
            if secp.verify_ecdsa(&message, &signature, &public_key).is_ok() {
                Ok(VerificationOutcome {
                    is_valid: true,
                    mode: VerificationMode::Legacy,
                    vm_id: None,
                    reason: None,
                })
            } else {
                Ok(VerificationOutcome {
                    is_valid: false,
                    mode: VerificationMode::Legacy,
                    vm_id: None,
                    reason: Some("SignatureMismatch".to_string()),
                })
            }
        }
        CreatorRegistration::V09 { methods } => {
            let candidates: Vec<&VerificationMethod> = match requested_vm_id {
                Some(id) => methods.iter().filter(|vm| vm.vm_id == id).collect(),
                None => methods.iter().collect(),
            };
            if candidates.is_empty() {
                return Ok(VerificationOutcome {
                    is_valid: false,
                    mode: VerificationMode::V09,
                    vm_id: requested_vm_id.map(str::to_string),
                    reason: Some("NoValidKey".to_string()),
                });
            }

            let mut saw_inactive = false;
            for vm in candidates {
                if !vm.is_active_at(height) {
                    saw_inactive = true;
                    continue;
                }
                let leaf_key = match derive_leaf_key(vm, &digest) {
                    Ok(key) => key,
                    Err(_) => continue,
                };
                let secp = Secp256k1::verification_only();
                if secp.verify_ecdsa(&message, &signature, &leaf_key).is_ok() {
                    return Ok(VerificationOutcome {
                        is_valid: true,
                        mode: VerificationMode::V09,
                        vm_id: Some(vm.vm_id.clone()),
                        reason: None,
                    });
                }
            }

            let reason = if saw_inactive {
                "OutOfValidity"
            } else {
                "SignatureMismatch"
            };
            Ok(VerificationOutcome {
                is_valid: false,
                mode: VerificationMode::V09,
                vm_id: requested_vm_id.map(str::to_string),
                reason: Some(reason.to_string()),
            })
        }
    }
}

fn decode_signature(signature_b64: &str) -> Result<Signature> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    // Gateway-observed signatures through GraphQL sometimes have whitespace
    // re-inserted into the base64 payload; strip it before decoding.
    let despaced: String = signature_b64.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(&despaced)
        .map_err(|e| Error::signature_invalid(format!("bad base64 signature: {e}")))?;
    Signature::from_compact(&bytes)
        .or_else(|_| Signature::from_der(&bytes))
        .map_err(|e| Error::signature_invalid(format!("bad signature encoding: {e}")))
}

fn legacy_public_key(xpub: &str) -> Result<PublicKey> {
    let extended = XPub::from_str(xpub)
        .map_err(|e| Error::signature_invalid(format!("bad xpub: {e}")))?;
    PublicKey::from_slice(&extended.public_key().to_sec1_bytes())
        .map_err(|e| Error::signature_invalid(format!("bad public key: {e}")))
}

/// Derives the leaf signing key for a v0.9 verification method: walk
/// `derivation_prefix`, then append a final index chosen by `leaf_policy`.
fn derive_leaf_key(vm: &VerificationMethod, payload_digest: &[u8]) -> Result<PublicKey> {
    let extended = XPub::from_str(&vm.xpub)
        .map_err(|e| Error::signature_invalid(format!("bad xpub: {e}")))?;

    let leaf_index: u32 = match vm.leaf_policy {
        LeafPolicy::Fixed => vm
            .fixed_leaf_index
            .ok_or_else(|| Error::signature_invalid("fixed leaf policy missing fixed_leaf_index"))?,
        LeafPolicy::PayloadDigest => {
            let mut word = [0u8; 4];
            word.copy_from_slice(&payload_digest[0..4]);
            u32::from_be_bytes(word) & 0x7fff_ffff
        }
    };

    let path_str = format!("{}/{}", vm.derivation_prefix.trim_end_matches('/'), leaf_index);
    let path: DerivationPath = path_str
        .parse()
        .map_err(|e| Error::signature_invalid(format!("bad derivation path {path_str}: {e}")))?;

    let mut current = extended;
    for child in path.iter() {
        current = current
            .derive_child(child)
            .map_err(|e| Error::signature_invalid(format!("derivation failed: {e}")))?;
    }
    PublicKey::from_slice(&current.public_key().to_sec1_bytes())
        .map_err(|e| Error::signature_invalid(format!("bad derived public key: {e}")))
}

/// Signs `payload` with the node's own secp256k1 key, the "server signs"
/// policy path of `POST /records` for callers that don't
/// present their own `creator_signature`. Returns `(creator_public_key_hex,
/// signature_b64)`.
pub fn sign_with_node_key(signing_key_hex: &str, payload: &Value) -> Result<(String, String)> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use secp256k1::SecretKey;

    let secret_bytes =
        hex::decode(signing_key_hex).map_err(|e| Error::internal(format!("bad node wallet key hex: {e}")))?;
    let secret_key = SecretKey::from_slice(&secret_bytes)
        .map_err(|e| Error::internal(format!("bad node wallet key: {e}")))?;
    let secp = Secp256k1::signing_only();
    let public_key = PublicKey::from_secret_key(&secp, &secret_key);

    let message_bytes = canonicalize(payload)?;
    let digest = Sha256::digest(&message_bytes);
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| Error::internal(format!("bad digest: {e}")))?;
    let signature = secp.sign_ecdsa(&message, &secret_key);

    let signature_b64 = STANDARD.encode(signature.serialize_compact());
    let public_key_hex = public_key.serialize().iter().map(|b| format!("{b:02x}")).collect();
    Ok((public_key_hex, signature_b64))
}

/// Derives the node wallet's public key hex from its secret key, without
/// signing anything. Used at startup to learn the value that will appear in
/// `oip.creator_did` for server-signed records.
pub fn node_wallet_public_key_hex(signing_key_hex: &str) -> Result<String> {
    use secp256k1::SecretKey;

    let secret_bytes =
        hex::decode(signing_key_hex).map_err(|e| Error::internal(format!("bad node wallet key hex: {e}")))?;
    let secret_key = SecretKey::from_slice(&secret_bytes)
        .map_err(|e| Error::internal(format!("bad node wallet key: {e}")))?;
    let secp = Secp256k1::signing_only();
    let public_key = PublicKey::from_secret_key(&secp, &secret_key);
    Ok(public_key.serialize().iter().map(|b| format!("{b:02x}")).collect())
}

/// Derives a short prefix of a public key, used to match `did:gun:<prefix>`
/// DIDs against a claimed owner key (C8 deletion authorization).
pub fn public_key_prefix(public_key_hex: &str, len: usize) -> String {
    let digest = Sha256::digest(public_key_hex.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect::<String>()[..len].to_string()
}

pub fn creator_did_from_public_key(public_key_hex: &str) -> Did {
    Did::new(crate::types::Backend::Gun, &public_key_prefix(public_key_hex, 12), None)
}

use std::str::FromStr;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_sorts_keys_and_drops_signature() {
        let payload = serde_json::json!({
            "b": 1, "a": 2, "creator_signature": "should-be-excluded"
        });
        let bytes = canonicalize(&payload).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn verification_method_activity_window() {
        let vm = VerificationMethod {
            vm_id: "vm1".into(),
            vm_type: "secp256k1".into(),
            xpub: String::new(),
            derivation_prefix: "m/0".into(),
            leaf_policy: LeafPolicy::Fixed,
            fixed_leaf_index: Some(0),
            valid_from_block: 100,
            revoked_from_block: Some(200),
        };
        assert!(!vm.is_active_at(99));
        assert!(vm.is_active_at(100));
        assert!(vm.is_active_at(199));
        assert!(!vm.is_active_at(200));
    }

    #[test]
    fn decode_signature_strips_inserted_whitespace() {
        // A 64-byte all-zero compact signature, base64-encoded with stray
        // whitespace inserted as some gateways' GraphQL layer does.
        let clean = base64::engine::general_purpose::STANDARD.encode([0u8; 64]);
        let spaced: String = clean
            .chars()
            .enumerate()
            .map(|(i, c)| if i % 8 == 0 && i > 0 { format!(" {c}") } else { c.to_string() })
            .collect();
        // Both should parse to the same bytes even though verify_ecdsa
        // will reject an all-zero signature; we only assert decoding
        // succeeds identically for spaced vs. clean input.
        let a = decode_signature(&clean);
        let b = decode_signature(&spaced);
        assert_eq!(a.is_ok(), b.is_ok());
    }
}
