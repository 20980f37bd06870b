//! Ownership, Privacy & Encryption (C10): HD key derivation, per-record
//! GUN payload encryption, and the read/delete authorization rules.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bip39::{Language, Mnemonic};
use hmac::Hmac;
use jsonwebtoken::{decode, DecodingKey, Validation};
use pbkdf2::pbkdf2;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::{Error, Result};

const PBKDF2_ROUNDS: u32 = 100_000;
const AES_KEY_LEN: usize = 32;

/// Claims carried by the JWT a client presents to prove ownership of a
/// private GUN record: the owner's public key, signed by the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerClaims {
    pub sub: String,
    pub public_key: String,
    pub exp: usize,
}

/// Who is attempting to act (read or delete) on a record, as resolved from
/// a request's JWT (if any) and the request origin.
#[derive(Debug, Clone, Default)]
pub struct RequestPrincipal {
    pub public_key: Option<String>,
    pub email_domain: Option<String>,
}

/// The record-level access facts needed to decide read authorization
///: public Arweave records are open; private GUN records
/// require proof of ownership; org-scoped records require membership.
#[derive(Debug, Clone)]
pub enum AccessLevel {
    Public,
    Private { owner_public_key: String },
    Organization { owner_public_key: String, org_members: Vec<String> },
}

pub struct OwnershipEngine {
    jwt_secret: String,
    admin_base_domain: Option<String>,
    admin_public_api_base_url: Option<String>,
    /// Per-user GUN encryption salts, keyed by public key. In a full
    /// deployment this is read from the users index; kept as an injected
    /// map here so the engine has no direct storage dependency.
    gun_salts: std::collections::HashMap<String, Vec<u8>>,
}

impl OwnershipEngine {
    pub fn new(
        jwt_secret: String,
        admin_base_domain: Option<String>,
        admin_public_api_base_url: Option<String>,
    ) -> Self {
        Self {
            jwt_secret,
            admin_base_domain,
            admin_public_api_base_url,
            gun_salts: std::collections::HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::new("test-secret".to_string(), None, None)
    }

    pub fn register_gun_salt(&mut self, public_key: String, salt: Vec<u8>) {
        self.gun_salts.insert(public_key, salt);
    }

    /// Verifies a JWT and returns the owner's claimed public key.
    pub fn verify_owner_jwt(&self, token: &str) -> Result<OwnerClaims> {
        let key = DecodingKey::from_secret(self.jwt_secret.as_bytes());
        let data = decode::<OwnerClaims>(token, &key, &Validation::default())
            .map_err(|e| Error::unauthorized(format!("invalid JWT: {e}")))?;
        Ok(data.claims)
    }

    /// Authorization table for reads.
    pub fn can_read(&self, access: &AccessLevel, principal: &RequestPrincipal) -> bool {
        match access {
            AccessLevel::Public => true,
            AccessLevel::Private { owner_public_key } => {
                principal.public_key.as_deref() == Some(owner_public_key.as_str())
            }
            AccessLevel::Organization { owner_public_key, org_members } => {
                match &principal.public_key {
                    Some(key) => key == owner_public_key || org_members.iter().any(|m| m == key),
                    None => false,
                }
            }
        }
    }

    /// The admin-domain deletion override: granted when the deleter's
    /// registered email domain matches the node's configured base domain
    /// *and* the target was signed by the node's own wallet. A single gate,
    /// not extended transitively to other members of that domain.
    pub fn is_admin_override(&self, principal: &RequestPrincipal, target_signed_by_node_wallet: bool) -> bool {
        if !target_signed_by_node_wallet {
            return false;
        }
        let (Some(base_domain), Some(_public_api_base_url)) =
            (&self.admin_base_domain, &self.admin_public_api_base_url)
        else {
            return false;
        };
        principal.email_domain.as_deref() == Some(base_domain.as_str())
    }

    /// Derives the per-record AES-256-GCM key from `(user_public_key,
    /// gun_salt)` via PBKDF2.
    fn derive_record_key(&self, owner_public_key: &str) -> Result<[u8; AES_KEY_LEN]> {
        let salt = self
            .gun_salts
            .get(owner_public_key)
            .ok_or_else(|| Error::internal(format!("no GUN salt registered for {owner_public_key}")))?;
        let mut key = [0u8; AES_KEY_LEN];
        pbkdf2::<Hmac<Sha256>>(owner_public_key.as_bytes(), salt, PBKDF2_ROUNDS, &mut key)
            .map_err(|e| Error::internal(format!("PBKDF2 derivation failed: {e}")))?;
        Ok(key)
    }

    /// Encrypts a GUN payload before it is put into the peer graph,
    /// producing the `{encrypted, iv, authTag}` wire shape.
    pub fn encrypt_payload(&self, owner_public_key: &str, payload: &Value) -> Result<Value> {
        let key_bytes = self.derive_record_key(owner_public_key)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

        use rand::RngCore;
        let mut iv = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let plaintext = serde_json::to_vec(payload)?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|e| Error::internal(format!("AES-GCM encryption failed: {e}")))?;

        // AES-GCM appends the auth tag to the ciphertext; split it back out
        // to match the wire shape `{encrypted, iv, authTag}`.
        let tag_start = ciphertext.len() - 16;
        let (body, tag) = ciphertext.split_at(tag_start);

        Ok(serde_json::json!({
            "encrypted": STANDARD.encode(body),
            "iv": STANDARD.encode(iv),
            "authTag": STANDARD.encode(tag),
        }))
    }

    /// Inverse of `encrypt_payload`.
    pub fn decrypt_payload(&self, owner_public_key: &str, blob: &Value) -> Result<Value> {
        let key_bytes = self.derive_record_key(owner_public_key)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

        let iv = STANDARD
            .decode(blob["iv"].as_str().ok_or_else(|| Error::decode("missing iv"))?)
            .map_err(|e| Error::decode(format!("bad iv base64: {e}")))?;
        let body = STANDARD
            .decode(
                blob["encrypted"]
                    .as_str()
                    .ok_or_else(|| Error::decode("missing encrypted"))?,
            )
            .map_err(|e| Error::decode(format!("bad encrypted base64: {e}")))?;
        let tag = STANDARD
            .decode(blob["authTag"].as_str().ok_or_else(|| Error::decode("missing authTag"))?)
            .map_err(|e| Error::decode(format!("bad authTag base64: {e}")))?;

        let mut combined = body;
        combined.extend_from_slice(&tag);

        let nonce = Nonce::from_slice(&iv);
        let plaintext = cipher
            .decrypt(nonce, combined.as_ref())
            .map_err(|_| Error::signature_invalid("GUN payload decryption failed"))?;
        serde_json::from_slice(&plaintext).map_err(Error::Serialization)
    }
}

/// Generates a fresh mnemonic for HD key registration: each registered
/// user holds an HD key derived from a mnemonic via BIP-32.
pub fn generate_mnemonic() -> Result<String> {
    let mnemonic = Mnemonic::generate(Language::English, 12)
        .map_err(|e| Error::internal(format!("mnemonic generation failed: {e}")))?;
    Ok(mnemonic.to_string())
}

/// Derives the master extended private key from a mnemonic phrase and an
/// optional BIP-39 passphrase.
pub fn master_key_from_mnemonic(phrase: &str, passphrase: &str) -> Result<bip32::XPrv> {
    let mnemonic = Mnemonic::parse_in(Language::English, phrase)
        .map_err(|e| Error::decode(format!("bad mnemonic: {e}")))?;
    let seed = mnemonic.to_seed(passphrase);
    bip32::XPrv::new(seed).map_err(|e| Error::internal(format!("key derivation failed: {e}")))
}
