//! Outbound XML Encryption.
//!
//! [`EncryptUnit`] recognizes targets the same way the signature side does and
//! installs an [`EncryptionCipherUnit`] that replaces the target with an
//! `xenc:EncryptedData`. Header children encrypted as a whole are wrapped in
//! `wsse11:EncryptedHeader`. [`EncryptEndingUnit`] lists every EncryptedData
//! in an `xenc:ReferenceList` inside the security header.

use super::HeaderTail;
use crate::algorithm::{AlgorithmInfo, AlgorithmKind};
use crate::chain::{ProcessingUnit, UnitContext, UnitId};
use crate::crypto;
use crate::error::WssError;
use crate::event::{empty_element, text_element, Attribute, ElementStart, QName, StreamEvent};
use crate::keyinfo::KeyIdentifier;
use crate::ns::{self, attr, node, XENC_TYPE_CONTENT, XENC_TYPE_ELEMENT};
use crate::secure_part::{find_match, DocumentTracker, EncryptionPartDef, Modifier, SecurePart};
use crate::security_event::SecurityEvent;
use crate::token::KeyUsage;
use crate::xml::write_events;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info};

/// Recognizes encryption targets.
pub struct EncryptUnit {
    parts: Vec<SecurePart>,
    algorithm: &'static AlgorithmInfo,
    token_id: String,
    key_identifier: KeyIdentifier,
    tracker: DocumentTracker,
    active_depth: Option<usize>,
}

impl EncryptUnit {
    pub fn new(
        parts: Vec<SecurePart>,
        algorithm: &'static AlgorithmInfo,
        token_id: impl Into<String>,
        key_identifier: KeyIdentifier,
    ) -> Result<Self, WssError> {
        if algorithm.kind != AlgorithmKind::Encryption {
            return Err(WssError::UnsupportedAlgorithm(algorithm.uri.to_string()));
        }
        Ok(Self {
            parts,
            algorithm,
            token_id: token_id.into(),
            key_identifier,
            tracker: DocumentTracker::new(),
            active_depth: None,
        })
    }
}

impl ProcessingUnit for EncryptUnit {
    fn id(&self) -> UnitId {
        UnitId::Encrypt
    }

    fn transform(&mut self, event: StreamEvent, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        match &event {
            StreamEvent::ElementStart(start) => {
                self.tracker.enter(start);
                if self.active_depth.is_some() || self.tracker.in_security_header() {
                    return Ok(vec![event]);
                }
                let modifier = match find_match(&self.parts, start) {
                    Some(part) => part.modifier,
                    None => return Ok(vec![event]),
                };

                let reference_id = ctx.message.generate_id("ED");
                let header_child = self.tracker.is_header_child() && modifier == Modifier::Element;
                debug!(reference_id = %reference_id, element = %start.name, ?modifier, "Encryption part matched");
                ctx.message.add_encryption_part(EncryptionPartDef {
                    reference_id: reference_id.clone(),
                    key_id: self.token_id.clone(),
                    modifier,
                    path: self.tracker.path().to_vec(),
                });
                ctx.insert_after_self(Box::new(EncryptionCipherUnit {
                    reference_id,
                    modifier,
                    header_child,
                    algorithm: self.algorithm,
                    token_id: self.token_id.clone(),
                    key_identifier: self.key_identifier,
                    path: self.tracker.path().to_vec(),
                    buffer: Vec::new(),
                    header_attributes: Vec::new(),
                    depth: 0,
                }));
                self.active_depth = Some(self.tracker.depth());
                if self.tracker.is_body() {
                    ctx.remove_self();
                }
            }
            StreamEvent::ElementEnd(_) => {
                if self.active_depth == Some(self.tracker.depth()) {
                    self.active_depth = None;
                }
                self.tracker.leave();
            }
            StreamEvent::Characters(_) => {}
        }
        Ok(vec![event])
    }
}

/// Replaces one matched subtree (or its content) with its ciphertext.
///
/// AES-GCM is single-shot, so the serialized plaintext of the one subtree is
/// held until its end element.
pub struct EncryptionCipherUnit {
    reference_id: String,
    modifier: Modifier,
    header_child: bool,
    algorithm: &'static AlgorithmInfo,
    token_id: String,
    key_identifier: KeyIdentifier,
    path: Vec<QName>,
    buffer: Vec<StreamEvent>,
    header_attributes: Vec<Attribute>,
    depth: usize,
}

impl EncryptionCipherUnit {
    fn encrypted_events(&self, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        let plaintext = write_events(&self.buffer);

        let token = ctx.message.resolve_token(&self.token_id)?;
        token.verify()?;
        let key = token.secret_key(self.algorithm.uri, KeyUsage::Encryption)?;
        let cipher = crypto::encrypt(self.algorithm, &key, plaintext.as_bytes())?;

        ctx.message
            .publish_token_used(token.id(), token.token_type(), KeyUsage::Encryption);
        ctx.message.publish(SecurityEvent::EncryptedElement {
            path: self.path.clone(),
            reference_id: self.reference_id.clone(),
            algorithm: self.algorithm.uri.to_string(),
            content_only: self.modifier == Modifier::Content,
            token_id: token.id().to_string(),
        });

        let mut out = Vec::new();
        let wrapper = ns::wsse11(node::ENCRYPTED_HEADER);
        if self.header_child {
            let mut start = ElementStart::new(wrapper.clone());
            start.attributes.extend(self.header_attributes.iter().cloned());
            out.push(StreamEvent::ElementStart(start));
        }

        let data_type = match self.modifier {
            Modifier::Element => XENC_TYPE_ELEMENT,
            Modifier::Content => XENC_TYPE_CONTENT,
        };
        out.push(StreamEvent::ElementStart(
            ElementStart::new(ns::xenc(node::ENCRYPTED_DATA))
                .with_attribute(ns::unqualified(attr::ID), self.reference_id.clone())
                .with_attribute(ns::unqualified(attr::TYPE), data_type),
        ));
        out.extend(empty_element(
            ElementStart::new(ns::xenc(node::ENCRYPTION_METHOD))
                .with_attribute(ns::unqualified(attr::ALGORITHM), self.algorithm.uri),
        ));
        out.extend(self.key_identifier.key_info(token.id()));
        out.push(StreamEvent::start(ns::xenc(node::CIPHER_DATA)));
        out.extend(text_element(ns::xenc(node::CIPHER_VALUE), BASE64.encode(cipher)));
        out.push(StreamEvent::end(ns::xenc(node::CIPHER_DATA)));
        out.push(StreamEvent::end(ns::xenc(node::ENCRYPTED_DATA)));
        if self.header_child {
            out.push(StreamEvent::end(wrapper));
        }

        debug!(
            reference_id = %self.reference_id,
            plaintext_len = plaintext.len(),
            header = self.header_child,
            "Encrypted element"
        );
        Ok(out)
    }
}

impl ProcessingUnit for EncryptionCipherUnit {
    fn id(&self) -> UnitId {
        UnitId::EncryptionCipher
    }

    fn transform(&mut self, event: StreamEvent, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        // First event is always the matched element's start
        if self.depth == 0 {
            self.depth = 1;
            return Ok(match (self.modifier, event) {
                (Modifier::Content, event) => vec![event],
                (Modifier::Element, StreamEvent::ElementStart(start)) => {
                    if self.header_child {
                        self.header_attributes = start
                            .attributes
                            .iter()
                            .filter(|a| ns::is_soap_ns(&a.name.namespace))
                            .cloned()
                            .collect();
                    }
                    self.buffer.push(StreamEvent::ElementStart(start));
                    Vec::new()
                }
                (Modifier::Element, other) => {
                    return Err(WssError::Structural(format!(
                        "encryption target did not start with an element: {:?}",
                        other
                    )))
                }
            });
        }

        match &event {
            StreamEvent::ElementStart(_) => self.depth += 1,
            StreamEvent::ElementEnd(_) => self.depth -= 1,
            StreamEvent::Characters(_) => {}
        }
        if self.depth > 0 {
            self.buffer.push(event);
            return Ok(Vec::new());
        }

        // End of the matched element
        let out = match self.modifier {
            Modifier::Element => {
                self.buffer.push(event);
                self.encrypted_events(ctx)?
            }
            Modifier::Content => {
                let mut out = self.encrypted_events(ctx)?;
                out.push(event);
                out
            }
        };
        self.buffer.clear();
        ctx.remove_self();
        Ok(out)
    }
}

/// Writes `xenc:ReferenceList` into the security header at stream end.
#[derive(Debug, Default)]
pub struct EncryptEndingUnit {
    tail: HeaderTail,
}

impl EncryptEndingUnit {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessingUnit for EncryptEndingUnit {
    fn id(&self) -> UnitId {
        UnitId::EncryptEnding
    }

    fn transform(&mut self, event: StreamEvent, _ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        Ok(self.tail.offer(event).into_iter().collect())
    }

    fn finalize(&mut self, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        if !self.tail.is_holding() {
            return Err(WssError::Structural("security header end not found".to_string()));
        }
        let parts = ctx.message.encryption_parts();
        if parts.is_empty() {
            return Err(WssError::Structural("no element matched an encryption part".to_string()));
        }

        let mut out = vec![StreamEvent::start(ns::xenc(node::REFERENCE_LIST))];
        for part in parts {
            out.extend(empty_element(
                ElementStart::new(ns::xenc(node::DATA_REFERENCE))
                    .with_attribute(ns::unqualified(attr::URI), format!("#{}", part.reference_id)),
            ));
        }
        out.push(StreamEvent::end(ns::xenc(node::REFERENCE_LIST)));
        info!(parts = parts.len(), "Message encrypted");
        out.extend(self.tail.release());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{AlgorithmRegistry, AES256_GCM};
    use crate::chain::{Placement, ProcessorChain};
    use crate::context::MessageContext;
    use crate::processor::header::SecurityHeaderUnit;
    use crate::token::{InMemoryTokenRegistry, SymmetricToken};
    use crate::xml::{read_events, write_events};
    use std::sync::Arc;

    const MESSAGE: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Header><h:Session xmlns:h="urn:h" soap:mustUnderstand="1" h:kind="x">secret-session</h:Session></soap:Header><soap:Body><m:Order xmlns:m="urn:m"><m:Card>4111</m:Card></m:Order></soap:Body></soap:Envelope>"#;

    fn encrypt(parts: Vec<SecurePart>) -> Result<String, WssError> {
        let mut registry = InMemoryTokenRegistry::new();
        registry.insert(Arc::new(SymmetricToken::new("enc-key", vec![3u8; 32])))?;
        let mut ctx = MessageContext::new(Arc::new(registry));
        let algorithm = AlgorithmRegistry::global().lookup(AES256_GCM)?;

        let mut chain = ProcessorChain::new();
        chain.insert(Box::new(SecurityHeaderUnit::new()), Placement::new())?;
        chain.insert(
            Box::new(EncryptUnit::new(parts, algorithm, "enc-key", KeyIdentifier::KeyName)?),
            Placement::new().after(UnitId::SecurityHeader),
        )?;
        chain.insert(Box::new(EncryptEndingUnit::new()), Placement::new().after(UnitId::Encrypt))?;
        let out = chain.process(read_events(MESSAGE)?.into_iter().map(Ok), &mut ctx)?;
        Ok(write_events(&out))
    }

    #[test]
    fn test_body_content_encrypted() {
        let out = encrypt(vec![SecurePart::element(
            QName::new(ns::SOAP_11_NS, "Body"),
            Modifier::Content,
        )])
        .unwrap();
        assert!(!out.contains("4111"));
        assert!(out.contains("<soap:Body><xenc:EncryptedData"));
        assert!(out.contains(XENC_TYPE_CONTENT));
        assert!(out.contains("<ds:KeyName>enc-key</ds:KeyName>"));
        assert!(out.contains("<xenc:ReferenceList>"));
    }

    #[test]
    fn test_header_child_wrapped_in_encrypted_header() {
        let out = encrypt(vec![SecurePart::element(
            QName::new("urn:h", "Session"),
            Modifier::Element,
        )])
        .unwrap();
        assert!(!out.contains("secret-session"));
        assert_eq!(out.matches("<wsse11:EncryptedHeader").count(), 1);
        assert_eq!(out.matches("<xenc:EncryptedData").count(), 1);
        let wrapper = &out[out.find("<wsse11:EncryptedHeader").unwrap()..];
        let wrapper_start = &wrapper[..wrapper.find('>').unwrap()];
        // SOAP attributes are copied, other attributes stay encrypted
        assert!(wrapper_start.contains("soap:mustUnderstand=\"1\""));
        assert!(!wrapper_start.contains("kind"));
        assert!(wrapper.find("</xenc:EncryptedData></wsse11:EncryptedHeader>").is_some());
    }

    #[test]
    fn test_nothing_matched_fails() {
        let result = encrypt(vec![SecurePart::id("missing", Modifier::Element)]);
        assert!(matches!(result, Err(WssError::Structural(_))));
    }

    #[test]
    fn test_wrong_algorithm_kind_rejected() {
        let digest = AlgorithmRegistry::global().lookup(crate::algorithm::SHA256).unwrap();
        let result = EncryptUnit::new(Vec::new(), digest, "k", KeyIdentifier::KeyName);
        assert!(matches!(result, Err(WssError::UnsupportedAlgorithm(_))));
    }
}
