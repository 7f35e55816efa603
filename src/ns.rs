//! Namespace URIs and element names of the XML Signature, XML Encryption and
//! WS-Security vocabularies.

use crate::event::QName;

/// SOAP 1.1 envelope namespace.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
/// SOAP 1.2 envelope namespace.
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
/// WS-Security 1.0 secext namespace.
pub const WSSE_NS: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
/// WS-Security 1.1 secext namespace.
pub const WSSE11_NS: &str = "http://docs.oasis-open.org/wss/oasis-wss-wssecurity-secext-1.1.xsd";
/// WS-Security utility namespace.
pub const WSU_NS: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
/// XML Digital Signature namespace.
pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
/// XML Encryption namespace.
pub const XENC_NS: &str = "http://www.w3.org/2001/04/xmlenc#";
/// WS-Trust February 2005 namespace.
pub const WST_NS: &str = "http://schemas.xmlsoap.org/ws/2005/02/trust";
/// WS-Trust 1.3 namespace.
pub const WST_NS_05_12: &str = "http://docs.oasis-open.org/ws-sx/ws-trust/200512";

/// XML Encryption `Type` for element encryption.
pub const XENC_TYPE_ELEMENT: &str = "http://www.w3.org/2001/04/xmlenc#Element";
/// XML Encryption `Type` for content encryption.
pub const XENC_TYPE_CONTENT: &str = "http://www.w3.org/2001/04/xmlenc#Content";

pub mod node {
    pub const ENVELOPE: &str = "Envelope";
    pub const HEADER: &str = "Header";
    pub const BODY: &str = "Body";

    pub const SECURITY: &str = "Security";
    pub const SECURITY_TOKEN_REFERENCE: &str = "SecurityTokenReference";
    pub const REFERENCE: &str = "Reference";
    pub const TRANSFORMATION_PARAMETERS: &str = "TransformationParameters";
    pub const ENCRYPTED_HEADER: &str = "EncryptedHeader";
    pub const TIMESTAMP: &str = "Timestamp";
    pub const CREATED: &str = "Created";
    pub const EXPIRES: &str = "Expires";

    pub const SIGNATURE: &str = "Signature";
    pub const SIGNED_INFO: &str = "SignedInfo";
    pub const CANONICALIZATION_METHOD: &str = "CanonicalizationMethod";
    pub const SIGNATURE_METHOD: &str = "SignatureMethod";
    pub const SIGNATURE_VALUE: &str = "SignatureValue";
    pub const TRANSFORMS: &str = "Transforms";
    pub const TRANSFORM: &str = "Transform";
    pub const DIGEST_METHOD: &str = "DigestMethod";
    pub const DIGEST_VALUE: &str = "DigestValue";
    pub const KEY_INFO: &str = "KeyInfo";
    pub const KEY_NAME: &str = "KeyName";

    pub const ENCRYPTED_DATA: &str = "EncryptedData";
    pub const ENCRYPTED_KEY: &str = "EncryptedKey";
    pub const ENCRYPTION_METHOD: &str = "EncryptionMethod";
    pub const CIPHER_DATA: &str = "CipherData";
    pub const CIPHER_VALUE: &str = "CipherValue";
    pub const REFERENCE_LIST: &str = "ReferenceList";
    pub const DATA_REFERENCE: &str = "DataReference";

    pub const BINARY_SECRET: &str = "BinarySecret";
}

pub mod attr {
    pub const ID: &str = "Id";
    pub const ID_UPPER: &str = "ID";
    pub const ASSERTION_ID: &str = "AssertionID";
    pub const ALGORITHM: &str = "Algorithm";
    pub const URI: &str = "URI";
    pub const TYPE: &str = "Type";
    pub const MUST_UNDERSTAND: &str = "mustUnderstand";
}

/// `ds:` qualified name.
pub fn dsig(local: &str) -> QName {
    QName::prefixed(DSIG_NS, local, "ds")
}

/// `xenc:` qualified name.
pub fn xenc(local: &str) -> QName {
    QName::prefixed(XENC_NS, local, "xenc")
}

/// `wsse:` qualified name.
pub fn wsse(local: &str) -> QName {
    QName::prefixed(WSSE_NS, local, "wsse")
}

/// `wsse11:` qualified name.
pub fn wsse11(local: &str) -> QName {
    QName::prefixed(WSSE11_NS, local, "wsse11")
}

/// `wsu:` qualified name.
pub fn wsu(local: &str) -> QName {
    QName::prefixed(WSU_NS, local, "wsu")
}

/// Unqualified attribute name.
pub fn unqualified(local: &str) -> QName {
    QName::new("", local)
}

/// Identifier attributes checked when matching secure parts, in priority order.
pub fn id_attributes() -> [QName; 4] {
    [
        wsu(attr::ID),
        unqualified(attr::ID),
        unqualified(attr::ID_UPPER),
        unqualified(attr::ASSERTION_ID),
    ]
}

/// Whether `namespace` is one of the SOAP envelope namespaces.
pub fn is_soap_ns(namespace: &str) -> bool {
    namespace == SOAP_11_NS || namespace == SOAP_12_NS
}
