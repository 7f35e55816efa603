//! `ds:KeyInfo` resolution.
//!
//! A KeyInfo carries one child of a small closed set; each kind is parsed
//! and resolved on its own.

use crate::algorithm::{AlgorithmInfo, AlgorithmKind, Primitive};
use crate::context::MessageContext;
use crate::crypto;
use crate::error::WssError;
use crate::event::StreamEvent;
use crate::ns::{self, attr, node, DSIG_NS, WSSE_NS, WST_NS, WST_NS_05_12, XENC_NS};
use crate::token::{KeyUsage, SecurityToken, TokenType};
use crate::xml::Element;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

/// Supported KeyInfo children.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyInfoChild {
    /// Session key wrapped with the key identified by `wrapping`
    EncryptedKey {
        algorithm: String,
        wrapping: Box<KeyInfoChild>,
        cipher_value: Vec<u8>,
    },
    /// Inline WS-Trust secret
    BinarySecret(Vec<u8>),
    /// Indirection to a token by id
    SecurityTokenReference { token_id: String },
    /// Direct token name
    KeyName(String),
}

impl KeyInfoChild {
    /// Parse the first supported child of a `ds:KeyInfo` element.
    pub fn parse(key_info: &Element) -> Result<Self, WssError> {
        for child in key_info.children() {
            if let Some(parsed) = Self::from_element(child) {
                return parsed;
            }
        }
        Err(WssError::KeyResolutionFailed(
            "KeyInfo has no supported child".to_string(),
        ))
    }

    fn from_element(el: &Element) -> Option<Result<Self, WssError>> {
        let name = el.name();
        if name.is(XENC_NS, node::ENCRYPTED_KEY) {
            Some(parse_encrypted_key(el))
        } else if name.local == node::BINARY_SECRET && (name.namespace == WST_NS || name.namespace == WST_NS_05_12) {
            Some(decode_base64(&el.text()).map(Self::BinarySecret))
        } else if name.is(WSSE_NS, node::SECURITY_TOKEN_REFERENCE) {
            Some(parse_str(el))
        } else if name.is(DSIG_NS, node::KEY_NAME) {
            Some(Ok(Self::KeyName(el.text().trim().to_string())))
        } else {
            None
        }
    }

    /// Resolve to usable key material.
    ///
    /// Resolution only locates the key; callers must still check
    /// [`ResolvedKey::verify_trust`] before using it.
    pub fn resolve(&self, ctx: &MessageContext) -> Result<ResolvedKey, WssError> {
        match self {
            Self::KeyName(name) => Ok(ResolvedKey::Token(ctx.resolve_token(name)?)),
            Self::SecurityTokenReference { token_id } => Ok(ResolvedKey::Token(ctx.resolve_token(token_id)?)),
            Self::BinarySecret(secret) => Ok(ResolvedKey::Inline(Zeroizing::new(secret.clone()))),
            Self::EncryptedKey {
                algorithm,
                wrapping,
                cipher_value,
            } => {
                let info = ctx.algorithms().lookup_kind(algorithm, AlgorithmKind::Encryption)?;
                // The key-encryption key must come from the registry
                let wrapping_token = match wrapping.resolve(ctx)? {
                    ResolvedKey::Token(token) => token,
                    _ => {
                        return Err(WssError::TrustValidationFailed(
                            "EncryptedKey must be wrapped by a registered token".to_string(),
                        ))
                    }
                };
                wrapping_token.verify()?;
                let kek = wrapping_token.secret_key(algorithm, KeyUsage::KeyWrap)?;
                let key = crypto::decrypt(info, &kek, cipher_value)
                    .map_err(|e| WssError::KeyResolutionFailed(format!("cannot unwrap key: {}", e)))?;
                debug!(wrapping_token = wrapping_token.id(), "Unwrapped encrypted key");
                Ok(ResolvedKey::Unwrapped {
                    key: Zeroizing::new(key),
                    wrapping_token,
                })
            }
        }
    }
}

fn parse_encrypted_key(el: &Element) -> Result<KeyInfoChild, WssError> {
    let algorithm = el
        .child(XENC_NS, node::ENCRYPTION_METHOD)
        .and_then(|m| m.attribute(&ns::unqualified(attr::ALGORITHM)))
        .ok_or_else(|| WssError::Structural("EncryptedKey without EncryptionMethod".to_string()))?
        .to_string();
    let key_info = el
        .child(DSIG_NS, node::KEY_INFO)
        .ok_or_else(|| WssError::KeyResolutionFailed("EncryptedKey without KeyInfo".to_string()))?;
    let wrapping = KeyInfoChild::parse(key_info)?;
    let cipher_value = el
        .child(XENC_NS, node::CIPHER_DATA)
        .and_then(|c| c.child(XENC_NS, node::CIPHER_VALUE))
        .ok_or_else(|| WssError::Structural("EncryptedKey without CipherValue".to_string()))?;
    Ok(KeyInfoChild::EncryptedKey {
        algorithm,
        wrapping: Box::new(wrapping),
        cipher_value: decode_base64(&cipher_value.text())?,
    })
}

fn parse_str(el: &Element) -> Result<KeyInfoChild, WssError> {
    let uri = el
        .child(WSSE_NS, node::REFERENCE)
        .and_then(|r| r.attribute(&ns::unqualified(attr::URI)))
        .ok_or_else(|| WssError::KeyResolutionFailed("SecurityTokenReference without Reference URI".to_string()))?;
    Ok(KeyInfoChild::SecurityTokenReference {
        token_id: uri.trim_start_matches('#').to_string(),
    })
}

/// Parse the KeyInfo subtree events directly.
pub fn parse_key_info(events: &[StreamEvent]) -> Result<KeyInfoChild, WssError> {
    KeyInfoChild::parse(&Element::from_events(events)?)
}

/// Key material obtained from a KeyInfo.
pub enum ResolvedKey {
    Token(Arc<dyn SecurityToken>),
    /// Session key recovered with a registry token
    Unwrapped {
        key: Zeroizing<Vec<u8>>,
        wrapping_token: Arc<dyn SecurityToken>,
    },
    /// Key carried in the message itself; never trusted
    Inline(Zeroizing<Vec<u8>>),
}

impl ResolvedKey {
    pub fn token_id(&self) -> &str {
        match self {
            Self::Token(t) => t.id(),
            Self::Unwrapped { wrapping_token, .. } => wrapping_token.id(),
            Self::Inline(_) => "binary-secret",
        }
    }

    pub fn token_type(&self) -> TokenType {
        match self {
            Self::Token(t) => t.token_type(),
            Self::Unwrapped { .. } | Self::Inline(_) => TokenType::Symmetric,
        }
    }

    /// Inline secrets are chosen by whoever wrote the message, so they
    /// never authenticate anything.
    pub fn verify_trust(&self) -> Result<(), WssError> {
        match self {
            Self::Token(t) => t.verify(),
            Self::Unwrapped { wrapping_token, .. } => wrapping_token.verify(),
            Self::Inline(_) => Err(WssError::TrustValidationFailed(
                "inline BinarySecret key material is not trusted".to_string(),
            )),
        }
    }

    pub fn secret_key(&self, algorithm: &str, usage: KeyUsage) -> Result<Zeroizing<Vec<u8>>, WssError> {
        match self {
            Self::Token(t) => t.secret_key(algorithm, usage),
            Self::Unwrapped { key, .. } | Self::Inline(key) => Ok(key.clone()),
        }
    }

    /// Key used to check a signature value: the public key for asymmetric
    /// algorithms, the shared secret otherwise.
    pub fn verification_key(&self, info: &AlgorithmInfo) -> Result<Zeroizing<Vec<u8>>, WssError> {
        match (self, info.primitive) {
            (Self::Token(t), Primitive::Ed25519) => Ok(Zeroizing::new(
                t.public_key(info.uri, KeyUsage::SignatureVerification)?,
            )),
            (_, Primitive::Ed25519) => Err(WssError::KeyResolutionFailed(
                "Ed25519 verification needs a public key token".to_string(),
            )),
            _ => self.secret_key(info.uri, KeyUsage::SignatureVerification),
        }
    }
}

/// How emitted KeyInfo elements identify their token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyIdentifier {
    #[default]
    SecurityTokenReference,
    KeyName,
}

impl KeyIdentifier {
    pub fn key_info(self, token_id: &str) -> Vec<StreamEvent> {
        match self {
            Self::SecurityTokenReference => str_key_info(token_id),
            Self::KeyName => key_name_key_info(token_id),
        }
    }
}

/// `ds:KeyInfo` events pointing at a token through a SecurityTokenReference.
pub fn str_key_info(token_id: &str) -> Vec<StreamEvent> {
    use crate::event::{empty_element, ElementStart};
    let mut events = vec![
        StreamEvent::start(ns::dsig(node::KEY_INFO)),
        StreamEvent::start(ns::wsse(node::SECURITY_TOKEN_REFERENCE)),
    ];
    events.extend(empty_element(
        ElementStart::new(ns::wsse(node::REFERENCE)).with_attribute(ns::unqualified(attr::URI), format!("#{}", token_id)),
    ));
    events.push(StreamEvent::end(ns::wsse(node::SECURITY_TOKEN_REFERENCE)));
    events.push(StreamEvent::end(ns::dsig(node::KEY_INFO)));
    events
}

/// `ds:KeyInfo` events naming a token directly.
pub fn key_name_key_info(token_id: &str) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::start(ns::dsig(node::KEY_INFO))];
    events.extend(crate::event::text_element(ns::dsig(node::KEY_NAME), token_id));
    events.push(StreamEvent::end(ns::dsig(node::KEY_INFO)));
    events
}

pub(crate) fn decode_base64(text: &str) -> Result<Vec<u8>, WssError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(compact)
        .map_err(|e| WssError::Structural(format!("invalid base64 value: {}", e)))
}
