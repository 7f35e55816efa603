//! Configuration types for the WS-Security engine.

use crate::algorithm::{self, AlgorithmKind, AlgorithmRegistry};
use crate::error::WssError;
use crate::event::QName;
use crate::keyinfo::KeyIdentifier;
use crate::policy::PolicyNode;
use crate::secure_part::{Modifier, SecurePart};
use crate::token::{Ed25519Token, InMemoryTokenRegistry, SecurityToken, SymmetricToken, TokenType};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Main configuration for the WS-Security engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WssConfig {
    /// Config version
    pub version: String,

    /// General settings
    pub settings: SettingsConfig,

    /// Timestamp creation and validation
    pub timestamp: TimestampConfig,

    /// XML Signature
    pub signature: SignatureConfig,

    /// XML Encryption
    pub encryption: EncryptionConfig,

    /// Key material
    pub tokens: Vec<TokenConfig>,

    /// Policy checked on inbound messages
    pub policy: Option<PolicyNode>,
}

impl Default for WssConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: SettingsConfig::default(),
            timestamp: TimestampConfig::default(),
            signature: SignatureConfig::default(),
            encryption: EncryptionConfig::default(),
            tokens: Vec::new(),
            policy: None,
        }
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Outbound actions in application order; inbound processing mirrors them
    pub actions: Vec<Action>,

    /// Maximum message size to process (bytes)
    pub max_message_size: usize,

    /// Action when the inbound policy is violated: "block" or "allow"
    pub fail_action: FailAction,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            actions: vec![Action::Timestamp, Action::Signature],
            max_message_size: 1_048_576, // 1MB
            fail_action: FailAction::Block,
        }
    }
}

/// Security action applied to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Timestamp,
    Signature,
    Encrypt,
}

/// Failure action when the policy is violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailAction {
    /// Reject the message
    #[default]
    Block,
    /// Accept the message (log only)
    Allow,
}

/// SOAP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoapVersion {
    /// SOAP 1.1 (namespace: http://schemas.xmlsoap.org/soap/envelope/)
    #[serde(rename = "1.1")]
    Soap11,
    /// SOAP 1.2 (namespace: http://www.w3.org/2003/05/soap-envelope)
    #[serde(rename = "1.2")]
    Soap12,
}

/// `wsu:Timestamp` configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampConfig {
    /// Lifetime written into outbound timestamps
    pub ttl_secs: i64,

    /// Maximum accepted age of inbound timestamps (replay window)
    pub max_age_secs: i64,

    /// Tolerated clock skew for timestamps created in the future
    pub future_skew_secs: i64,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,        // 5 minutes
            max_age_secs: 300,    // 5 minutes
            future_skew_secs: 60, // 1 minute
        }
    }
}

/// XML Signature configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Signing token id
    pub token_id: String,

    pub signature_algorithm: String,

    pub digest_algorithm: String,

    pub canonicalization_algorithm: String,

    /// Elements to sign
    pub parts: Vec<SecurePartConfig>,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            token_id: String::new(),
            signature_algorithm: algorithm::HMAC_SHA256.to_string(),
            digest_algorithm: algorithm::SHA256.to_string(),
            canonicalization_algorithm: algorithm::EXC_C14N.to_string(),
            parts: default_body_parts(Modifier::Element),
        }
    }
}

/// XML Encryption configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Encrypting token id
    pub token_id: String,

    pub algorithm: String,

    /// How EncryptedData KeyInfo names the token
    pub key_identifier: KeyIdentifier,

    /// Elements to encrypt
    pub parts: Vec<SecurePartConfig>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            token_id: String::new(),
            algorithm: algorithm::AES256_GCM.to_string(),
            key_identifier: KeyIdentifier::SecurityTokenReference,
            parts: default_body_parts(Modifier::Content),
        }
    }
}

/// SOAP 1.1 and 1.2 bodies.
fn default_body_parts(modifier: Modifier) -> Vec<SecurePartConfig> {
    [crate::ns::SOAP_11_NS, crate::ns::SOAP_12_NS]
        .iter()
        .map(|soap| SecurePartConfig {
            element: Some(format!("{{{}}}Body", soap)),
            modifier,
            ..SecurePartConfig::default()
        })
        .collect()
}

/// One protection target.
///
/// Exactly one of `element` (Clark notation), `id`, or `token_id` together
/// with `reference_id` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurePartConfig {
    pub element: Option<String>,
    pub id: Option<String>,
    /// Token element signed through an STR-Transform reference
    pub token_id: Option<String>,
    /// Id of the SecurityTokenReference for `token_id`
    pub reference_id: Option<String>,
    pub modifier: Modifier,
}

impl SecurePartConfig {
    pub fn to_part(&self) -> Result<SecurePart, WssError> {
        match (&self.element, &self.id, &self.token_id, &self.reference_id) {
            (Some(element), None, None, None) => Ok(SecurePart::element(QName::parse_clark(element)?, self.modifier)),
            (None, Some(id), None, None) => Ok(SecurePart::id(id.clone(), self.modifier)),
            (None, None, Some(token_id), Some(reference_id)) => {
                Ok(SecurePart::token_reference(token_id.clone(), reference_id.clone()))
            }
            _ => Err(WssError::Config(format!(
                "secure part must name exactly one of element, id, or token_id with reference_id: {:?}",
                self
            ))),
        }
    }
}

/// Key material for one token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub id: String,

    pub kind: TokenType,

    /// Base64 secret key (symmetric) or 32-byte seed (Ed25519)
    #[serde(default)]
    pub key: Option<String>,

    /// Base64 Ed25519 public key, for verification-only tokens
    #[serde(default)]
    pub public_key: Option<String>,

    /// Id of the token whose key wraps this one
    #[serde(default)]
    pub wrapped_by: Option<String>,

    /// Whether the token passes trust validation
    #[serde(default = "default_true")]
    pub trusted: bool,
}

fn default_true() -> bool {
    true
}

impl TokenConfig {
    pub fn to_token(&self) -> Result<Arc<dyn SecurityToken>, WssError> {
        match self.kind {
            TokenType::Symmetric => {
                let key = decode_key(&self.id, self.key.as_deref())?;
                let mut token = SymmetricToken::new(self.id.clone(), key).trusted(self.trusted);
                if let Some(wrapper) = &self.wrapped_by {
                    token = token.wrapped_by(wrapper.clone());
                }
                Ok(Arc::new(token))
            }
            TokenType::Ed25519 => {
                if self.wrapped_by.is_some() {
                    return Err(WssError::Config(format!(
                        "Ed25519 token '{}' cannot be wrapped",
                        self.id
                    )));
                }
                let token = match (&self.key, &self.public_key) {
                    (Some(seed), _) => Ed25519Token::from_seed(self.id.clone(), key_bytes(&self.id, seed)?),
                    (None, Some(public)) => Ed25519Token::from_public(self.id.clone(), key_bytes(&self.id, public)?),
                    (None, None) => {
                        return Err(WssError::Config(format!("token '{}' has no key", self.id)))
                    }
                };
                Ok(Arc::new(token.trusted(self.trusted)))
            }
        }
    }
}

fn decode_key(id: &str, key: Option<&str>) -> Result<Vec<u8>, WssError> {
    let key = key.ok_or_else(|| WssError::Config(format!("token '{}' has no key", id)))?;
    BASE64
        .decode(key.trim())
        .map_err(|e| WssError::Config(format!("token '{}' key is not valid base64: {}", id, e)))
}

fn key_bytes(id: &str, key: &str) -> Result<[u8; 32], WssError> {
    decode_key(id, Some(key))?
        .try_into()
        .map_err(|_| WssError::Config(format!("token '{}' key must be 32 bytes", id)))
}

impl WssConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, WssError> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| WssError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for problems that would only surface while
    /// processing a message.
    pub fn validate(&self) -> Result<(), WssError> {
        if self.version != "1" {
            return Err(WssError::Config(format!("unsupported config version '{}'", self.version)));
        }
        if self.settings.max_message_size == 0 {
            return Err(WssError::Config("max_message_size must be positive".to_string()));
        }
        let mut seen = HashSet::new();
        for action in &self.settings.actions {
            if !seen.insert(action) {
                return Err(WssError::Config(format!("action {:?} listed twice", action)));
            }
        }

        let registry = AlgorithmRegistry::global();
        if seen.contains(&Action::Signature) {
            require_token(&self.signature.token_id, "signature")?;
            registry.lookup_kind(&self.signature.signature_algorithm, AlgorithmKind::Signature)?;
            registry.lookup_kind(&self.signature.digest_algorithm, AlgorithmKind::Digest)?;
            registry.lookup_kind(&self.signature.canonicalization_algorithm, AlgorithmKind::Canonicalization)?;
            self.signature_parts()?;
        }
        if seen.contains(&Action::Encrypt) {
            require_token(&self.encryption.token_id, "encryption")?;
            registry.lookup_kind(&self.encryption.algorithm, AlgorithmKind::Encryption)?;
            self.encryption_parts()?;
        }
        self.token_registry()?;
        Ok(())
    }

    pub fn signature_parts(&self) -> Result<Vec<SecurePart>, WssError> {
        self.signature.parts.iter().map(SecurePartConfig::to_part).collect()
    }

    pub fn encryption_parts(&self) -> Result<Vec<SecurePart>, WssError> {
        self.encryption.parts.iter().map(SecurePartConfig::to_part).collect()
    }

    /// Build the token registry. Tokens may be listed in any order; wrapping
    /// tokens are registered before the tokens they wrap.
    pub fn token_registry(&self) -> Result<InMemoryTokenRegistry, WssError> {
        let mut registry = InMemoryTokenRegistry::new();
        let mut pending: Vec<&TokenConfig> = self.tokens.iter().collect();
        let mut registered: HashSet<&str> = HashSet::new();
        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::new();
            for token in pending {
                match &token.wrapped_by {
                    Some(wrapper) if !registered.contains(wrapper.as_str()) => waiting.push(token),
                    _ => {
                        registry.insert(token.to_token()?)?;
                        registered.insert(token.id.as_str());
                    }
                }
            }
            if waiting.len() == before {
                let ids: Vec<&str> = waiting.iter().map(|t| t.id.as_str()).collect();
                return Err(WssError::Config(format!(
                    "tokens {:?} are wrapped by unknown or cyclic tokens",
                    ids
                )));
            }
            pending = waiting;
        }
        Ok(registry)
    }
}

fn require_token(token_id: &str, section: &str) -> Result<(), WssError> {
    if token_id.is_empty() {
        return Err(WssError::Config(format!("{}.token_id is required", section)));
    }
    Ok(())
}
