//! Cryptographic primitives: BLAKE2b-256 resource hashing, the BLAKE2b-seeded
//! manifest UUID, and Ed25519 manifest signing/verification.

use crate::errors::{FwupError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use blake2::Blake2bMac;
use blake2::digest::{Mac, consts::U32};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;
use std::io::{Read, Write};
use uuid::Uuid;
use zeroize::Zeroize;

type Blake2b256 = Blake2bMac<U32>;

const PRIVATE_KEY_MAGIC: &[u8; 4] = b"FWSK";

// The namespace identifier fwup mixes into the UUID hash so that two
// archives with byte-identical meta.conf content still derive the same
// UUID, but the UUID space doesn't collide with other UUID schemes.
const META_UUID_NAMESPACE: [u8; 16] = [
    0x20, 0x53, 0xdf, 0xfb, 0xd5, 0x1e, 0x43, 0x10, 0xb9, 0x3b, 0x95, 0x6d, 0xa8, 0x9f, 0x9f, 0x34,
];

/// BLAKE2b-256 hash of `data`, returned as lowercase hex - the format
/// stored in a `file-resource`'s `blake2b-256` field.
pub fn blake2b_256_hex(data: &[u8]) -> String {
    hex::encode(blake2b_256(data))
}

pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let mut mac = Blake2b256::new_from_slice(&[]).expect("blake2b accepts an empty key");
    mac.update(data);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

pub fn verify_blake2b_256(data: &[u8], expected_hex: &str) -> Result<()> {
    let actual = blake2b_256_hex(data);
    if actual != expected_hex.to_ascii_lowercase() {
        return Err(FwupError::Integrity(format!(
            "hash mismatch: expected {expected_hex}, got {actual}"
        )));
    }
    Ok(())
}

/// Derives the deterministic `meta-uuid` for a manifest: BLAKE2b-256 over
/// a fixed namespace plus the raw `meta.conf` bytes, with the version
/// nibble forced so the result reads as a UUID even though it isn't
/// actually built from the UUID v5 (SHA-1) algorithm.
pub fn derive_meta_uuid(meta_conf_bytes: &[u8]) -> Uuid {
    let mut mac = Blake2b256::new_from_slice(&[]).expect("blake2b accepts an empty key");
    mac.update(&META_UUID_NAMESPACE);
    mac.update(meta_conf_bytes);
    let digest = mac.finalize().into_bytes();
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&digest[..16]);
    hash[6] = (hash[6] & 0x0f) | 0x50;
    hash[8] = (hash[8] & 0x3f) | 0x80;
    Uuid::from_bytes(hash)
}

pub fn generate_signing_keypair() -> (SigningKey, VerifyingKey) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

pub fn sign(signing_key: &SigningKey, message: &[u8]) -> Signature {
    signing_key.sign(message)
}

/// Verifies `message` against `signature` using any one of the supplied
/// public keys; fwup accepts a manifest signed by any trusted key.
pub fn verify_any(public_keys: &[VerifyingKey], message: &[u8], signature: &Signature) -> bool {
    public_keys.iter().any(|key| key.verify(message, signature).is_ok())
}

/// Encrypts a signing private key at rest with a passphrase:
/// HKDF-SHA256(passphrase) -> AES-256-GCM key. This is a pragmatic
/// stretch, not a dedicated password-hashing KDF; it's adequate for
/// protecting a key file on local disk, not for resisting offline
/// brute-force of a weak passphrase.
pub fn save_encrypted_private_key<W: Write>(
    mut out: W,
    signing_key: &SigningKey,
    passphrase: &str,
) -> Result<()> {
    let mut salt = [0u8; 16];
    getrandom::getrandom(&mut salt).map_err(|e| FwupError::Validation(e.to_string()))?;
    let key = derive_key(passphrase, &salt);

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| FwupError::Validation(format!("aes key: {e}")))?;
    let mut nonce_bytes = [0u8; 12];
    getrandom::getrandom(&mut nonce_bytes).map_err(|e| FwupError::Validation(e.to_string()))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut plaintext = signing_key.to_bytes().to_vec();
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|e| FwupError::Validation(format!("encrypt: {e}")))?;
    plaintext.zeroize();

    out.write_all(PRIVATE_KEY_MAGIC)?;
    out.write_all(&salt)?;
    out.write_all(&nonce_bytes)?;
    out.write_all(&ciphertext)?;
    Ok(())
}

pub fn load_encrypted_private_key<R: Read>(mut input: R, passphrase: &str) -> Result<SigningKey> {
    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    if &magic != PRIVATE_KEY_MAGIC {
        return Err(FwupError::Validation("not a fwup signing key file".into()));
    }
    let mut salt = [0u8; 16];
    input.read_exact(&mut salt)?;
    let mut nonce_bytes = [0u8; 12];
    input.read_exact(&mut nonce_bytes)?;
    let mut ciphertext = Vec::new();
    input.read_to_end(&mut ciphertext)?;

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| FwupError::Validation(format!("aes key: {e}")))?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut plaintext = cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|_| FwupError::Signature("wrong passphrase or corrupt key file".into()))?;

    if plaintext.len() != 32 {
        return Err(FwupError::Validation("corrupt signing key file".into()));
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(SigningKey::from_bytes(&bytes))
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), passphrase.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(b"fwup:signing-key", &mut key).expect("32 bytes is a valid HKDF output length");
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_uuid_is_deterministic() {
        let a = derive_meta_uuid(b"meta-product = \"x\"\n");
        let b = derive_meta_uuid(b"meta-product = \"x\"\n");
        assert_eq!(a, b);
        let c = derive_meta_uuid(b"meta-product = \"y\"\n");
        assert_ne!(a, c);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let (sk, vk) = generate_signing_keypair();
        let sig = sign(&sk, b"hello");
        assert!(verify_any(&[vk], b"hello", &sig));
        assert!(!verify_any(&[vk], b"goodbye", &sig));
    }

    #[test]
    fn encrypted_key_roundtrips() {
        let (sk, _vk) = generate_signing_keypair();
        let mut buf = Vec::new();
        save_encrypted_private_key(&mut buf, &sk, "correct horse").unwrap();
        let loaded = load_encrypted_private_key(&buf[..], "correct horse").unwrap();
        assert_eq!(loaded.to_bytes(), sk.to_bytes());
        assert!(load_encrypted_private_key(&buf[..], "wrong password").is_err());
    }
}
