//! Cryptographic primitives behind the registry's algorithm URIs.

use crate::algorithm::{AlgorithmInfo, Primitive};
use crate::error::WssError;
use aes_gcm::aead::{Aead, KeyInit, Nonce};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

/// AES-GCM initialization vector length (xmlenc11).
pub const GCM_IV_LEN: usize = 12;

/// Incremental digest.
#[derive(Clone)]
pub enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(info: &AlgorithmInfo) -> Result<Self, WssError> {
        match info.primitive {
            Primitive::Sha256 => Ok(Self::Sha256(Sha256::new())),
            Primitive::Sha512 => Ok(Self::Sha512(Sha512::new())),
            _ => Err(WssError::UnsupportedAlgorithm(format!("{} is not a digest", info.uri))),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Constant-time comparison of two digest values.
pub fn digests_equal(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Compute a signature value. `key` is the MAC secret or the Ed25519 seed.
pub fn sign(info: &AlgorithmInfo, key: &[u8], data: &[u8]) -> Result<Vec<u8>, WssError> {
    match info.primitive {
        Primitive::HmacSha256 => mac::<Hmac<Sha256>>(key, data),
        Primitive::HmacSha512 => mac::<Hmac<Sha512>>(key, data),
        Primitive::Ed25519 => {
            let seed: [u8; 32] = key
                .try_into()
                .map_err(|_| WssError::KeyResolutionFailed("Ed25519 seed must be 32 bytes".to_string()))?;
            let signing_key = SigningKey::from_bytes(&seed);
            Ok(signing_key.sign(data).to_bytes().to_vec())
        }
        _ => Err(WssError::UnsupportedAlgorithm(format!("{} is not a signature algorithm", info.uri))),
    }
}

/// Verify a signature value. `key` is the MAC secret or the Ed25519 public key.
pub fn verify(info: &AlgorithmInfo, key: &[u8], data: &[u8], signature: &[u8]) -> Result<(), WssError> {
    match info.primitive {
        Primitive::HmacSha256 => verify_mac::<Hmac<Sha256>>(key, data, signature),
        Primitive::HmacSha512 => verify_mac::<Hmac<Sha512>>(key, data, signature),
        Primitive::Ed25519 => {
            let public: [u8; 32] = key
                .try_into()
                .map_err(|_| WssError::KeyResolutionFailed("Ed25519 public key must be 32 bytes".to_string()))?;
            let verifying_key = VerifyingKey::from_bytes(&public)
                .map_err(|e| WssError::KeyResolutionFailed(e.to_string()))?;
            let signature = Signature::from_slice(signature)
                .map_err(|e| WssError::SignatureVerificationFailed(e.to_string()))?;
            verifying_key
                .verify(data, &signature)
                .map_err(|_| WssError::SignatureVerificationFailed("signature value mismatch".to_string()))
        }
        _ => Err(WssError::UnsupportedAlgorithm(format!("{} is not a signature algorithm", info.uri))),
    }
}

fn mac<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, WssError> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|e| WssError::KeyResolutionFailed(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify_mac<M: Mac + KeyInit>(key: &[u8], data: &[u8], signature: &[u8]) -> Result<(), WssError> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|e| WssError::KeyResolutionFailed(e.to_string()))?;
    mac.update(data);
    mac.verify_slice(signature)
        .map_err(|_| WssError::SignatureVerificationFailed("signature value mismatch".to_string()))
}

/// Encrypt with a fresh random IV; returns `IV || ciphertext || tag`.
pub fn encrypt(info: &AlgorithmInfo, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, WssError> {
    check_key_length(info, key)?;
    match info.primitive {
        Primitive::Aes128Gcm => seal::<Aes128Gcm>(key, plaintext),
        Primitive::Aes256Gcm => seal::<Aes256Gcm>(key, plaintext),
        _ => Err(WssError::UnsupportedAlgorithm(format!("{} is not a cipher", info.uri))),
    }
}

/// Decrypt `IV || ciphertext || tag`.
pub fn decrypt(info: &AlgorithmInfo, key: &[u8], data: &[u8]) -> Result<Vec<u8>, WssError> {
    check_key_length(info, key)?;
    match info.primitive {
        Primitive::Aes128Gcm => open::<Aes128Gcm>(key, data),
        Primitive::Aes256Gcm => open::<Aes256Gcm>(key, data),
        _ => Err(WssError::UnsupportedAlgorithm(format!("{} is not a cipher", info.uri))),
    }
}

fn check_key_length(info: &AlgorithmInfo, key: &[u8]) -> Result<(), WssError> {
    match info.key_length {
        Some(len) if len != key.len() => Err(WssError::KeyResolutionFailed(format!(
            "{} requires a {}-byte key, got {}",
            info.uri,
            len,
            key.len()
        ))),
        _ => Ok(()),
    }
}

fn seal<C: Aead + KeyInit>(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, WssError> {
    let cipher = C::new_from_slice(key).map_err(|e| WssError::EncryptionFailed(e.to_string()))?;
    let mut iv = [0u8; GCM_IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let ciphertext = cipher
        .encrypt(Nonce::<C>::from_slice(&iv), plaintext)
        .map_err(|e| WssError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(GCM_IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open<C: Aead + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, WssError> {
    if data.len() <= GCM_IV_LEN {
        return Err(WssError::DecryptionFailed("cipher value too short".to_string()));
    }
    let cipher = C::new_from_slice(key).map_err(|e| WssError::DecryptionFailed(e.to_string()))?;
    let (iv, ciphertext) = data.split_at(GCM_IV_LEN);
    cipher
        .decrypt(Nonce::<C>::from_slice(iv), ciphertext)
        .map_err(|_| WssError::DecryptionFailed("authentication tag mismatch".to_string()))
}
