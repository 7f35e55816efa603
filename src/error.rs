//! Error types for the WS-Security engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal errors raised while securing or verifying a message.
///
/// Every variant aborts the remaining chain dispatch for the message; output
/// produced before the error must not be treated as complete.
#[derive(Error, Debug)]
pub enum WssError {
    #[error("XML parsing error: {0}")]
    XmlParse(String),

    #[error("Structural error: {0}")]
    Structural(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Key resolution failed: {0}")]
    KeyResolutionFailed(String),

    #[error("Trust validation failed: {0}")]
    TrustValidationFailed(String),

    #[error("Signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Message expired: {0}")]
    MessageExpired(String),

    #[error("Processor ordering conflict: {0}")]
    OrderingConflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WssError {
    /// WS-Security fault code reported for this error.
    pub fn fault_code(&self) -> FaultCode {
        match self {
            Self::UnsupportedAlgorithm(_) => FaultCode::UnsupportedAlgorithm,
            Self::KeyResolutionFailed(_) => FaultCode::SecurityTokenUnavailable,
            Self::TrustValidationFailed(_) => FaultCode::InvalidSecurityToken,
            Self::SignatureVerificationFailed(_) | Self::DecryptionFailed(_) => FaultCode::FailedCheck,
            Self::MessageExpired(_) => FaultCode::MessageExpired,
            _ => FaultCode::InvalidSecurity,
        }
    }
}

impl From<quick_xml::Error> for WssError {
    fn from(e: quick_xml::Error) -> Self {
        Self::XmlParse(e.to_string())
    }
}

/// WS-Security SOAP fault codes (WSS 1.1, section 12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCode {
    /// An unsupported token was provided
    UnsupportedSecurityToken,
    /// An unsupported signature or encryption algorithm was used
    UnsupportedAlgorithm,
    /// An error was discovered processing the Security header
    InvalidSecurity,
    /// An invalid security token was provided
    InvalidSecurityToken,
    /// The security token could not be authenticated or authorized
    FailedAuthentication,
    /// The signature or decryption was invalid
    FailedCheck,
    /// Referenced security token could not be retrieved
    SecurityTokenUnavailable,
    /// The message has expired
    MessageExpired,
}

impl FaultCode {
    /// Qualified fault code as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedSecurityToken => "wsse:UnsupportedSecurityToken",
            Self::UnsupportedAlgorithm => "wsse:UnsupportedAlgorithm",
            Self::InvalidSecurity => "wsse:InvalidSecurity",
            Self::InvalidSecurityToken => "wsse:InvalidSecurityToken",
            Self::FailedAuthentication => "wsse:FailedAuthentication",
            Self::FailedCheck => "wsse:FailedCheck",
            Self::SecurityTokenUnavailable => "wsse:SecurityTokenUnavailable",
            Self::MessageExpired => "wsse:MessageExpired",
        }
    }
}

/// First unmet condition of one policy alternative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmetAlternative {
    /// Index of the alternative in the normalized policy
    pub alternative: usize,
    /// Human-readable description of the first unmet condition
    pub condition: String,
}

/// Verdict produced at stream end when no policy alternative is satisfied.
///
/// Never raised mid-stream: required elements may legitimately appear later
/// in the document.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("policy violated: {}", describe_unmet(.unmet))]
pub struct PolicyViolation {
    /// One entry per failing alternative, in alternative order
    pub unmet: Vec<UnmetAlternative>,
}

fn describe_unmet(unmet: &[UnmetAlternative]) -> String {
    unmet
        .iter()
        .map(|u| format!("alternative {}: {}", u.alternative, u.condition))
        .collect::<Vec<_>>()
        .join("; ")
}

/// SOAP Fault version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoapFaultVersion {
    Soap11,
    Soap12,
}

/// Generate a SOAP Fault response carrying a WS-Security fault code.
pub fn soap_fault_response(code: FaultCode, message: &str, soap_version: Option<SoapFaultVersion>) -> String {
    match soap_version.unwrap_or(SoapFaultVersion::Soap11) {
        SoapFaultVersion::Soap11 => soap_11_fault(code, message),
        SoapFaultVersion::Soap12 => soap_12_fault(code, message),
    }
}

fn soap_11_fault(code: FaultCode, message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <soap:Fault>
      <faultcode xmlns:wsse="{wsse}">{code}</faultcode>
      <faultstring>{message}</faultstring>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#,
        wsse = crate::ns::WSSE_NS,
        code = code.as_str(),
        message = xml_escape(message),
    )
}

fn soap_12_fault(code: FaultCode, message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Body>
    <soap:Fault>
      <soap:Code>
        <soap:Value>soap:Sender</soap:Value>
        <soap:Subcode>
          <soap:Value xmlns:wsse="{wsse}">{code}</soap:Value>
        </soap:Subcode>
      </soap:Code>
      <soap:Reason>
        <soap:Text xml:lang="en">{message}</soap:Text>
      </soap:Reason>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#,
        wsse = crate::ns::WSSE_NS,
        code = code.as_str(),
        message = xml_escape(message),
    )
}

fn xml_escape(s: &str) -> String {
    quick_xml::escape::escape(s).into_owned()
}
