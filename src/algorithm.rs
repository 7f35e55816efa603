//! Algorithm URI registry.
//!
//! Built once per process and read lock-free afterwards. Every processor
//! resolves wire URIs through [`AlgorithmRegistry::lookup`]; an unknown URI is
//! always [`WssError::UnsupportedAlgorithm`].

use crate::error::WssError;
use std::collections::HashMap;
use std::sync::OnceLock;

pub const SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";
pub const HMAC_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#hmac-sha256";
pub const HMAC_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#hmac-sha512";
pub const ED25519: &str = "http://www.w3.org/2021/04/xmldsig-more#eddsa-ed25519";
pub const AES128_GCM: &str = "http://www.w3.org/2009/xmlenc11#aes128-gcm";
pub const AES256_GCM: &str = "http://www.w3.org/2009/xmlenc11#aes256-gcm";
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const STR_TRANSFORM: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#STR-Transform";

/// What an algorithm URI may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmKind {
    Digest,
    Signature,
    Encryption,
    Canonicalization,
    Transform,
}

/// Native primitive behind an algorithm URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Sha256,
    Sha512,
    HmacSha256,
    HmacSha512,
    Ed25519,
    Aes128Gcm,
    Aes256Gcm,
    ExclusiveC14n,
    StrTransform,
}

/// Metadata for one algorithm URI.
#[derive(Debug, Clone)]
pub struct AlgorithmInfo {
    pub uri: &'static str,
    pub kind: AlgorithmKind,
    pub primitive: Primitive,
    /// Required key length in bytes, for ciphers
    pub key_length: Option<usize>,
}

/// Immutable table of supported algorithms.
#[derive(Debug)]
pub struct AlgorithmRegistry {
    by_uri: HashMap<&'static str, AlgorithmInfo>,
}

static REGISTRY: OnceLock<AlgorithmRegistry> = OnceLock::new();

impl AlgorithmRegistry {
    fn build() -> Self {
        let entries = [
            (SHA256, AlgorithmKind::Digest, Primitive::Sha256, None),
            (SHA512, AlgorithmKind::Digest, Primitive::Sha512, None),
            (HMAC_SHA256, AlgorithmKind::Signature, Primitive::HmacSha256, None),
            (HMAC_SHA512, AlgorithmKind::Signature, Primitive::HmacSha512, None),
            (ED25519, AlgorithmKind::Signature, Primitive::Ed25519, None),
            (AES128_GCM, AlgorithmKind::Encryption, Primitive::Aes128Gcm, Some(16)),
            (AES256_GCM, AlgorithmKind::Encryption, Primitive::Aes256Gcm, Some(32)),
            (EXC_C14N, AlgorithmKind::Canonicalization, Primitive::ExclusiveC14n, None),
            (STR_TRANSFORM, AlgorithmKind::Transform, Primitive::StrTransform, None),
        ];
        let by_uri = entries
            .into_iter()
            .map(|(uri, kind, primitive, key_length)| {
                (
                    uri,
                    AlgorithmInfo {
                        uri,
                        kind,
                        primitive,
                        key_length,
                    },
                )
            })
            .collect();
        Self { by_uri }
    }

    /// The process-wide registry, built on first access.
    pub fn global() -> &'static AlgorithmRegistry {
        REGISTRY.get_or_init(Self::build)
    }

    pub fn lookup(&self, uri: &str) -> Result<&AlgorithmInfo, WssError> {
        self.by_uri
            .get(uri)
            .ok_or_else(|| WssError::UnsupportedAlgorithm(uri.to_string()))
    }

    /// Look up a URI and require it to be of the given kind.
    pub fn lookup_kind(&self, uri: &str, kind: AlgorithmKind) -> Result<&AlgorithmInfo, WssError> {
        let info = self.lookup(uri)?;
        if info.kind != kind {
            return Err(WssError::UnsupportedAlgorithm(format!(
                "{} is not a {:?} algorithm",
                uri, kind
            )));
        }
        Ok(info)
    }
}
