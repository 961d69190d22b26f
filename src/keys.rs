//! Node identity: ed25519 key material and v3 onion addressing.
//!
//! A key can be held in four interchangeable shapes: the 32-byte raw seed,
//! the raw public key, the 64-byte expanded form the onion daemon stores, and
//! the public key recovered from an onion address. Signing works from either
//! private shape and produces identical signatures.

use curve25519_dalek::edwards::EdwardsPoint;
use data_encoding::BASE32;
use ed25519_dalek::hazmat::{raw_sign, ExpandedSecretKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use sha3::Sha3_256;
use thiserror::Error;

/// Version byte of v3 onion addresses.
const ONION_VERSION: u8 = 0x03;
const ONION_CHECKSUM_PREFIX: &[u8] = b".onion checksum";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid onion id")]
    InvalidId,
    #[error("cannot sign with a public-only key")]
    PublicKeyOnly,
}

// ─── Onion address codec ──────────────────────────────────────────────────────

/// Encode a public key as a lowercase v3 onion address (without `.onion`).
///
/// `base32(pubkey || trunc(SHA3-256(".onion checksum" || pubkey || 0x03), 2) || 0x03)`
pub fn onion_from_pubkey(pubkey: &VerifyingKey) -> String {
    let checksum = onion_checksum(pubkey.as_bytes());

    let mut addr = Vec::with_capacity(35);
    addr.extend_from_slice(pubkey.as_bytes());
    addr.extend_from_slice(&checksum[..2]);
    addr.push(ONION_VERSION);
    BASE32.encode(&addr).to_lowercase()
}

/// Recover the public key from a v3 onion address, validating the embedded
/// checksum and version byte.
pub fn pubkey_from_onion(id: &str) -> Result<VerifyingKey, KeyError> {
    let raw = BASE32
        .decode(id.to_uppercase().as_bytes())
        .map_err(|_| KeyError::InvalidId)?;
    if raw.len() != 35 || raw[34] != ONION_VERSION {
        return Err(KeyError::InvalidId);
    }

    let pubkey_bytes: [u8; 32] = raw[..32].try_into().expect("slice is 32 bytes");
    let checksum = onion_checksum(&pubkey_bytes);
    if raw[32..34] != checksum[..2] {
        return Err(KeyError::InvalidId);
    }

    VerifyingKey::from_bytes(&pubkey_bytes).map_err(|_| KeyError::InvalidId)
}

fn onion_checksum(pubkey: &[u8; 32]) -> [u8; 32] {
    let mut input = Vec::with_capacity(ONION_CHECKSUM_PREFIX.len() + 33);
    input.extend_from_slice(ONION_CHECKSUM_PREFIX);
    input.extend_from_slice(pubkey);
    input.push(ONION_VERSION);
    Sha3_256::digest(&input).into()
}

/// Check a detached signature against a public key.
pub fn verify(pubkey: &VerifyingKey, data: &[u8], signature: &Signature) -> bool {
    pubkey.verify(data, signature).is_ok()
}

// ─── NodeKey ──────────────────────────────────────────────────────────────────

/// Ed25519 key material in one of its four shapes.
#[derive(Clone)]
pub enum NodeKey {
    /// 32-byte seed form.
    Private(SigningKey),
    /// Raw public key.
    Public(VerifyingKey),
    /// 64-byte expanded form, as stored by the onion daemon and under the
    /// `deviceKey` config key.
    OnionPrivate([u8; 64]),
    /// Public key recovered from an onion address.
    OnionPublic(VerifyingKey),
}

impl NodeKey {
    pub fn generate() -> Self {
        NodeKey::Private(SigningKey::generate(&mut OsRng))
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        NodeKey::Private(SigningKey::from_bytes(seed))
    }

    pub fn from_onion_private(bytes: &[u8; 64]) -> Self {
        NodeKey::OnionPrivate(*bytes)
    }

    pub fn from_public(pubkey: VerifyingKey) -> Self {
        NodeKey::Public(pubkey)
    }

    pub fn from_onion_id(id: &str) -> Result<Self, KeyError> {
        Ok(NodeKey::OnionPublic(pubkey_from_onion(id)?))
    }

    pub fn public_key(&self) -> VerifyingKey {
        match self {
            NodeKey::Private(sk) => sk.verifying_key(),
            NodeKey::Public(pk) | NodeKey::OnionPublic(pk) => *pk,
            NodeKey::OnionPrivate(bytes) => {
                let esk = ExpandedSecretKey::from_bytes(bytes);
                let point = EdwardsPoint::mul_base(&esk.scalar);
                VerifyingKey::from_bytes(&point.compress().to_bytes())
                    .expect("scalar basepoint multiple is a valid public key")
            }
        }
    }

    /// The node id: the lowercase v3 onion address of the public key.
    pub fn node_id(&self) -> String {
        onion_from_pubkey(&self.public_key())
    }

    pub fn sign(&self, data: &[u8]) -> Result<Signature, KeyError> {
        match self {
            NodeKey::Private(sk) => Ok(sk.sign(data)),
            NodeKey::OnionPrivate(bytes) => {
                let esk = ExpandedSecretKey::from_bytes(bytes);
                Ok(raw_sign::<Sha512>(&esk, data, &self.public_key()))
            }
            NodeKey::Public(_) | NodeKey::OnionPublic(_) => Err(KeyError::PublicKeyOnly),
        }
    }

    /// The 64-byte expanded secret, as handed to the onion daemon.
    pub fn onion_private_bytes(&self) -> Result<[u8; 64], KeyError> {
        match self {
            NodeKey::Private(sk) => Ok(expand_seed(&sk.to_bytes())),
            NodeKey::OnionPrivate(bytes) => Ok(*bytes),
            NodeKey::Public(_) | NodeKey::OnionPublic(_) => Err(KeyError::PublicKeyOnly),
        }
    }
}

/// SHA-512 expand + clamp a seed into the 64-byte onion secret key form.
fn expand_seed(seed: &[u8; 32]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha512::digest(seed));
    out[0] &= 248;
    out[31] &= 127;
    out[31] |= 64;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_deterministic() {
        let key = NodeKey::generate();
        assert_eq!(key.node_id(), key.node_id());
        assert_eq!(key.node_id().len(), 56);
        assert!(key.node_id().chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn onion_roundtrip() {
        let key = NodeKey::generate();
        let id = key.node_id();
        let recovered = pubkey_from_onion(&id).expect("valid id");
        assert_eq!(recovered, key.public_key());
    }

    #[test]
    fn onion_checksum_tamper_rejected() {
        let key = NodeKey::generate();
        let id = key.node_id();
        // Flip one character; either the checksum or the key bytes no longer match.
        let mut chars: Vec<char> = id.chars().collect();
        chars[10] = if chars[10] == 'a' { 'b' } else { 'a' };
        let tampered: String = chars.into_iter().collect();
        assert!(pubkey_from_onion(&tampered).is_err());
    }

    #[test]
    fn bad_version_byte_rejected() {
        let key = NodeKey::generate();
        let pubkey = key.public_key();
        let checksum = onion_checksum(pubkey.as_bytes());
        let mut addr = Vec::new();
        addr.extend_from_slice(pubkey.as_bytes());
        addr.extend_from_slice(&checksum[..2]);
        addr.push(0x04);
        let id = BASE32.encode(&addr).to_lowercase();
        assert!(pubkey_from_onion(&id).is_err());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let key = NodeKey::generate();
        let sig = key.sign(b"hello world").unwrap();
        assert!(verify(&key.public_key(), b"hello world", &sig));
        assert!(!verify(&key.public_key(), b"hello worle", &sig));
    }

    #[test]
    fn seed_and_expanded_forms_agree() {
        let key = NodeKey::generate();
        let expanded = NodeKey::from_onion_private(&key.onion_private_bytes().unwrap());

        assert_eq!(key.public_key(), expanded.public_key());
        assert_eq!(key.node_id(), expanded.node_id());

        let sig_a = key.sign(b"same message").unwrap();
        let sig_b = expanded.sign(b"same message").unwrap();
        assert_eq!(sig_a.to_bytes(), sig_b.to_bytes());
    }

    #[test]
    fn public_key_cannot_sign() {
        let key = NodeKey::generate();
        let public = NodeKey::from_public(key.public_key());
        assert!(matches!(public.sign(b"x"), Err(KeyError::PublicKeyOnly)));
        assert!(matches!(public.onion_private_bytes(), Err(KeyError::PublicKeyOnly)));
    }

    #[test]
    fn from_onion_id_matches_origin() {
        let key = NodeKey::generate();
        let peer = NodeKey::from_onion_id(&key.node_id()).unwrap();
        assert_eq!(peer.public_key(), key.public_key());

        let sig = key.sign(b"payload").unwrap();
        assert!(verify(&peer.public_key(), b"payload", &sig));
    }
}
