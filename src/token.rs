//! Security token contract and an in-memory token registry.

use crate::error::WssError;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Maximum length of a key-wrapping chain.
const MAX_WRAPPING_DEPTH: usize = 8;

/// Kind of key material a token carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Symmetric,
    Ed25519,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Symmetric => write!(f, "symmetric"),
            Self::Ed25519 => write!(f, "ed25519"),
        }
    }
}

/// Purpose a key is extracted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    Signature,
    SignatureVerification,
    Encryption,
    Decryption,
    KeyWrap,
}

/// Opaque handle to key material.
pub trait SecurityToken: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn token_type(&self) -> TokenType;

    /// Secret key bytes for `algorithm` and `usage`.
    fn secret_key(&self, algorithm: &str, usage: KeyUsage) -> Result<Zeroizing<Vec<u8>>, WssError>;

    /// Public key bytes for `algorithm` and `usage`.
    fn public_key(&self, algorithm: &str, usage: KeyUsage) -> Result<Vec<u8>, WssError>;

    /// DER certificates, leaf first. Empty for raw keys.
    fn certificates(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// Id of the token whose key protects this one, if any.
    fn key_wrapping_token(&self) -> Option<&str> {
        None
    }

    /// Validate the token's own trust.
    fn verify(&self) -> Result<(), WssError>;
}

/// Resolves token identifiers to tokens.
pub trait TokenRegistry: Send + Sync {
    fn resolve(&self, id: &str) -> Result<Arc<dyn SecurityToken>, WssError>;
}

/// Raw symmetric key.
pub struct SymmetricToken {
    id: String,
    key: Zeroizing<Vec<u8>>,
    wrapped_by: Option<String>,
    trusted: bool,
}

impl SymmetricToken {
    pub fn new(id: impl Into<String>, key: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            key: Zeroizing::new(key),
            wrapped_by: None,
            trusted: true,
        }
    }

    pub fn trusted(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }

    pub fn wrapped_by(mut self, token_id: impl Into<String>) -> Self {
        self.wrapped_by = Some(token_id.into());
        self
    }
}

impl fmt::Debug for SymmetricToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricToken")
            .field("id", &self.id)
            .field("key_len", &self.key.len())
            .field("wrapped_by", &self.wrapped_by)
            .field("trusted", &self.trusted)
            .finish()
    }
}

impl SecurityToken for SymmetricToken {
    fn id(&self) -> &str {
        &self.id
    }

    fn token_type(&self) -> TokenType {
        TokenType::Symmetric
    }

    fn secret_key(&self, _algorithm: &str, _usage: KeyUsage) -> Result<Zeroizing<Vec<u8>>, WssError> {
        Ok(self.key.clone())
    }

    fn public_key(&self, _algorithm: &str, _usage: KeyUsage) -> Result<Vec<u8>, WssError> {
        Err(WssError::KeyResolutionFailed(format!(
            "token '{}' is symmetric and has no public key",
            self.id
        )))
    }

    fn key_wrapping_token(&self) -> Option<&str> {
        self.wrapped_by.as_deref()
    }

    fn verify(&self) -> Result<(), WssError> {
        if self.trusted {
            Ok(())
        } else {
            Err(WssError::TrustValidationFailed(format!(
                "token '{}' is not trusted",
                self.id
            )))
        }
    }
}

/// Ed25519 key pair, or a bare public key for verification only.
pub struct Ed25519Token {
    id: String,
    seed: Option<Zeroizing<[u8; 32]>>,
    public: [u8; 32],
    trusted: bool,
}

impl Ed25519Token {
    pub fn from_seed(id: impl Into<String>, seed: [u8; 32]) -> Self {
        let public = SigningKey::from_bytes(&seed).verifying_key().to_bytes();
        Self {
            id: id.into(),
            seed: Some(Zeroizing::new(seed)),
            public,
            trusted: true,
        }
    }

    pub fn from_public(id: impl Into<String>, public: [u8; 32]) -> Self {
        Self {
            id: id.into(),
            seed: None,
            public,
            trusted: true,
        }
    }

    pub fn trusted(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }
}

impl fmt::Debug for Ed25519Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Token")
            .field("id", &self.id)
            .field("has_private", &self.seed.is_some())
            .field("trusted", &self.trusted)
            .finish()
    }
}

impl SecurityToken for Ed25519Token {
    fn id(&self) -> &str {
        &self.id
    }

    fn token_type(&self) -> TokenType {
        TokenType::Ed25519
    }

    fn secret_key(&self, _algorithm: &str, usage: KeyUsage) -> Result<Zeroizing<Vec<u8>>, WssError> {
        match (&self.seed, usage) {
            (Some(seed), KeyUsage::Signature) => Ok(Zeroizing::new(seed.to_vec())),
            (Some(_), other) => Err(WssError::KeyResolutionFailed(format!(
                "Ed25519 token '{}' cannot be used for {:?}",
                self.id, other
            ))),
            (None, _) => Err(WssError::KeyResolutionFailed(format!(
                "token '{}' has no private key",
                self.id
            ))),
        }
    }

    fn public_key(&self, _algorithm: &str, _usage: KeyUsage) -> Result<Vec<u8>, WssError> {
        Ok(self.public.to_vec())
    }

    fn verify(&self) -> Result<(), WssError> {
        if self.trusted {
            Ok(())
        } else {
            Err(WssError::TrustValidationFailed(format!(
                "token '{}' is not trusted",
                self.id
            )))
        }
    }
}

/// Token registry backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryTokenRegistry {
    tokens: HashMap<String, Arc<dyn SecurityToken>>,
}

impl InMemoryTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token. A token may only be wrapped by an already
    /// registered token, which keeps wrapping chains acyclic.
    pub fn insert(&mut self, token: Arc<dyn SecurityToken>) -> Result<(), WssError> {
        if let Some(wrapper) = token.key_wrapping_token() {
            if !self.tokens.contains_key(wrapper) {
                return Err(WssError::Config(format!(
                    "token '{}' is wrapped by unknown token '{}'",
                    token.id(),
                    wrapper
                )));
            }
        }
        if self.tokens.contains_key(token.id()) {
            return Err(WssError::Config(format!("duplicate token id '{}'", token.id())));
        }
        self.tokens.insert(token.id().to_string(), token);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenRegistry for InMemoryTokenRegistry {
    fn resolve(&self, id: &str) -> Result<Arc<dyn SecurityToken>, WssError> {
        self.tokens
            .get(id)
            .cloned()
            .ok_or_else(|| WssError::KeyResolutionFailed(format!("unknown token '{}'", id)))
    }
}

/// Follow the key-wrapping chain to its root token.
pub fn root_token(
    registry: &dyn TokenRegistry,
    token: Arc<dyn SecurityToken>,
) -> Result<Arc<dyn SecurityToken>, WssError> {
    let mut current = token;
    for _ in 0..MAX_WRAPPING_DEPTH {
        let next = match current.key_wrapping_token() {
            Some(wrapper) => registry.resolve(wrapper)?,
            None => return Ok(current),
        };
        current = next;
    }
    Err(WssError::KeyResolutionFailed(format!(
        "key wrapping chain of '{}' exceeds {} tokens",
        current.id(),
        MAX_WRAPPING_DEPTH
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> InMemoryTokenRegistry {
        let mut registry = InMemoryTokenRegistry::new();
        registry
            .insert(Arc::new(Ed25519Token::from_seed("signer", [3u8; 32])))
            .unwrap();
        registry
            .insert(Arc::new(SymmetricToken::new("session", vec![1u8; 32]).wrapped_by("signer")))
            .unwrap();
        registry
    }

    #[test]
    fn test_resolve() {
        let registry = registry();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("session").unwrap().token_type(), TokenType::Symmetric);
        assert!(matches!(
            registry.resolve("missing"),
            Err(WssError::KeyResolutionFailed(_))
        ));
    }

    #[test]
    fn test_wrapper_must_exist() {
        let mut registry = InMemoryTokenRegistry::new();
        let result = registry.insert(Arc::new(SymmetricToken::new("a", vec![0; 16]).wrapped_by("b")));
        assert!(matches!(result, Err(WssError::Config(_))));
    }

    #[test]
    fn test_root_token_follows_chain() {
        let registry = registry();
        let session = registry.resolve("session").unwrap();
        let root = root_token(&registry, session).unwrap();
        assert_eq!(root.id(), "signer");
        assert_eq!(root.token_type(), TokenType::Ed25519);
    }

    #[test]
    fn test_ed25519_key_usage() {
        let token = Ed25519Token::from_seed("k", [5u8; 32]);
        assert!(token.secret_key("", KeyUsage::Signature).is_ok());
        assert!(token.secret_key("", KeyUsage::Encryption).is_err());
        assert_eq!(token.public_key("", KeyUsage::SignatureVerification).unwrap().len(), 32);

        let public_only = Ed25519Token::from_public("p", token.public).trusted(false);
        assert!(public_only.secret_key("", KeyUsage::Signature).is_err());
        assert!(matches!(
            public_only.verify(),
            Err(WssError::TrustValidationFailed(_))
        ));
    }

    #[test]
    fn test_untrusted_symmetric_token() {
        assert!(SymmetricToken::new("k", vec![1; 32]).verify().is_ok());
        let token = SymmetricToken::new("k", vec![1; 32]).trusted(false);
        assert!(matches!(token.verify(), Err(WssError::TrustValidationFailed(_))));
    }
}
