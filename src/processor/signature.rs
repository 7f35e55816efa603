//! Outbound XML Signature.
//!
//! [`SignatureUnit`] recognizes protection targets and installs one
//! [`SignatureDigestUnit`] per target; [`SignatureEndingUnit`] writes the
//! `ds:Signature` into the security header once every digest is known.

use super::HeaderTail;
use crate::algorithm::{self, AlgorithmInfo, AlgorithmKind};
use crate::c14n::{self, ExclusiveCanonicalizer};
use crate::chain::{ProcessingUnit, UnitContext, UnitId};
use crate::crypto::{self, Hasher};
use crate::error::WssError;
use crate::event::{empty_element, text_element, ElementStart, StreamEvent};
use crate::keyinfo;
use crate::ns::{self, attr, node};
use crate::secure_part::{element_id, find_match, DocumentTracker, PartSelector, SecurePart, SignaturePartDef};
use crate::security_event::SecurityEvent;
use crate::token::KeyUsage;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info};

/// Recognizes signature targets.
pub struct SignatureUnit {
    parts: Vec<SecurePart>,
    digest_algorithm: &'static AlgorithmInfo,
    tracker: DocumentTracker,
    /// Depth of the element whose digest is running
    active_depth: Option<usize>,
}

impl SignatureUnit {
    pub fn new(parts: Vec<SecurePart>, digest_algorithm: &'static AlgorithmInfo) -> Self {
        Self {
            parts,
            digest_algorithm,
            tracker: DocumentTracker::new(),
            active_depth: None,
        }
    }

    fn start_part(
        &mut self,
        part: SecurePart,
        mut start: ElementStart,
        ctx: &mut UnitContext<'_>,
    ) -> Result<ElementStart, WssError> {
        let (reference_id, transforms, token_reference) = match &part.selector {
            PartSelector::TokenReference { token_id, reference_id } => {
                ctx.message.claim_id(reference_id)?;
                (
                    reference_id.clone(),
                    vec![algorithm::STR_TRANSFORM.to_string()],
                    Some(token_id.clone()),
                )
            }
            _ => {
                let id = match element_id(&start) {
                    Some(existing) => {
                        let existing = existing.to_string();
                        ctx.message.claim_id(&existing)?;
                        existing
                    }
                    None => {
                        let generated = ctx.message.generate_id("id");
                        start = start.with_attribute(ns::wsu(attr::ID), generated.clone());
                        generated
                    }
                };
                (id, vec![algorithm::EXC_C14N.to_string()], None)
            }
        };

        debug!(reference_id = %reference_id, element = %start.name, "Signature part matched");
        let index = ctx.message.add_signature_part(SignaturePartDef {
            reference_id,
            path: self.tracker.path().to_vec(),
            transforms,
            token_reference,
            digest_algorithm: self.digest_algorithm.uri.to_string(),
            digest_value: None,
        });
        ctx.insert_after_self(Box::new(SignatureDigestUnit::new(index, self.digest_algorithm)?));
        Ok(start)
    }
}

impl ProcessingUnit for SignatureUnit {
    fn id(&self) -> UnitId {
        UnitId::Signature
    }

    fn transform(&mut self, event: StreamEvent, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        match event {
            StreamEvent::ElementStart(start) => {
                self.tracker.enter(&start);
                if self.active_depth.is_some() {
                    return Ok(vec![StreamEvent::ElementStart(start)]);
                }
                let part = match find_match(&self.parts, &start) {
                    Some(part) => part.clone(),
                    None => return Ok(vec![StreamEvent::ElementStart(start)]),
                };
                let start = self.start_part(part, start, ctx)?;
                self.active_depth = Some(self.tracker.depth());
                if self.tracker.is_body() {
                    // Nothing after the body can add a fresh match
                    ctx.remove_self();
                }
                Ok(vec![StreamEvent::ElementStart(start)])
            }
            StreamEvent::ElementEnd(name) => {
                if self.active_depth == Some(self.tracker.depth()) {
                    self.active_depth = None;
                }
                self.tracker.leave();
                Ok(vec![StreamEvent::ElementEnd(name)])
            }
            other => Ok(vec![other]),
        }
    }
}

/// Canonicalizes and digests one protected subtree as it streams past.
pub struct SignatureDigestUnit {
    part: usize,
    hasher: Option<Hasher>,
    c14n: ExclusiveCanonicalizer,
    started: bool,
}

impl SignatureDigestUnit {
    pub fn new(part: usize, digest_algorithm: &AlgorithmInfo) -> Result<Self, WssError> {
        Ok(Self {
            part,
            hasher: Some(Hasher::new(digest_algorithm)?),
            c14n: ExclusiveCanonicalizer::new(),
            started: false,
        })
    }
}

impl ProcessingUnit for SignatureDigestUnit {
    fn id(&self) -> UnitId {
        UnitId::SignatureDigest
    }

    fn transform(&mut self, event: StreamEvent, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        self.c14n.feed(&event);
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&self.c14n.take_output());
        }
        if matches!(event, StreamEvent::ElementStart(_)) {
            self.started = true;
        }

        if self.started && self.c14n.depth() == 0 {
            if let Some(hasher) = self.hasher.take() {
                let digest = hasher.finalize();
                let part = ctx
                    .message
                    .signature_part_mut(self.part)
                    .ok_or_else(|| WssError::Structural("signature part record missing".to_string()))?;
                part.digest_value = Some(digest);
                let signed = SecurityEvent::SignedElement {
                    path: part.path.clone(),
                    reference_id: part.reference_id.clone(),
                    digest_algorithm: part.digest_algorithm.clone(),
                };
                ctx.message.publish(signed);
            }
            ctx.remove_self();
        }
        Ok(vec![event])
    }
}

/// Writes `ds:Signature` into the security header at stream end.
pub struct SignatureEndingUnit {
    token_id: String,
    signature_algorithm: &'static AlgorithmInfo,
    canonicalization: &'static AlgorithmInfo,
    tail: HeaderTail,
}

impl SignatureEndingUnit {
    pub fn new(
        token_id: impl Into<String>,
        signature_algorithm: &'static AlgorithmInfo,
        canonicalization: &'static AlgorithmInfo,
    ) -> Result<Self, WssError> {
        if signature_algorithm.kind != AlgorithmKind::Signature {
            return Err(WssError::UnsupportedAlgorithm(signature_algorithm.uri.to_string()));
        }
        if canonicalization.kind != AlgorithmKind::Canonicalization {
            return Err(WssError::UnsupportedAlgorithm(canonicalization.uri.to_string()));
        }
        Ok(Self {
            token_id: token_id.into(),
            signature_algorithm,
            canonicalization,
            tail: HeaderTail::default(),
        })
    }

    fn signed_info(&self, parts: &[SignaturePartDef]) -> Result<Vec<StreamEvent>, WssError> {
        let mut events = vec![StreamEvent::start(ns::dsig(node::SIGNED_INFO))];
        events.extend(algorithm_element(node::CANONICALIZATION_METHOD, self.canonicalization.uri));
        events.extend(algorithm_element(node::SIGNATURE_METHOD, self.signature_algorithm.uri));

        for part in parts {
            let digest = part.digest_value.as_ref().ok_or_else(|| {
                WssError::Structural(format!("element #{} was never closed", part.reference_id))
            })?;
            events.push(StreamEvent::ElementStart(
                ElementStart::new(ns::dsig(node::REFERENCE))
                    .with_attribute(ns::unqualified(attr::URI), format!("#{}", part.reference_id)),
            ));
            events.push(StreamEvent::start(ns::dsig(node::TRANSFORMS)));
            for transform in &part.transforms {
                events.extend(transform_element(transform, self.canonicalization.uri));
            }
            events.push(StreamEvent::end(ns::dsig(node::TRANSFORMS)));
            events.extend(algorithm_element(node::DIGEST_METHOD, &part.digest_algorithm));
            events.extend(text_element(ns::dsig(node::DIGEST_VALUE), BASE64.encode(digest)));
            events.push(StreamEvent::end(ns::dsig(node::REFERENCE)));
        }
        events.push(StreamEvent::end(ns::dsig(node::SIGNED_INFO)));
        Ok(events)
    }
}

fn algorithm_element(local: &str, uri: &str) -> [StreamEvent; 2] {
    empty_element(ElementStart::new(ns::dsig(local)).with_attribute(ns::unqualified(attr::ALGORITHM), uri))
}

/// `wsse:SecurityTokenReference` carrying the id an STR-Transform reference
/// points at.
fn token_reference(reference_id: &str, token_id: &str) -> Vec<StreamEvent> {
    let name = ns::wsse(node::SECURITY_TOKEN_REFERENCE);
    let mut events = vec![StreamEvent::ElementStart(
        ElementStart::new(name.clone()).with_attribute(ns::wsu(attr::ID), reference_id),
    )];
    events.extend(empty_element(
        ElementStart::new(ns::wsse(node::REFERENCE)).with_attribute(ns::unqualified(attr::URI), format!("#{}", token_id)),
    ));
    events.push(StreamEvent::end(name));
    events
}

fn transform_element(transform: &str, canonicalization: &str) -> Vec<StreamEvent> {
    let start = ElementStart::new(ns::dsig(node::TRANSFORM)).with_attribute(ns::unqualified(attr::ALGORITHM), transform);
    if transform != algorithm::STR_TRANSFORM {
        return empty_element(start).to_vec();
    }
    let mut events = vec![StreamEvent::ElementStart(start)];
    events.push(StreamEvent::start(ns::wsse(node::TRANSFORMATION_PARAMETERS)));
    events.extend(algorithm_element(node::CANONICALIZATION_METHOD, canonicalization));
    events.push(StreamEvent::end(ns::wsse(node::TRANSFORMATION_PARAMETERS)));
    events.push(StreamEvent::end(ns::dsig(node::TRANSFORM)));
    events
}

impl ProcessingUnit for SignatureEndingUnit {
    fn id(&self) -> UnitId {
        UnitId::SignatureEnding
    }

    fn transform(&mut self, event: StreamEvent, _ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        Ok(self.tail.offer(event).into_iter().collect())
    }

    fn finalize(&mut self, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        if !self.tail.is_holding() {
            return Err(WssError::Structural("security header end not found".to_string()));
        }
        let parts = ctx.message.signature_parts().to_vec();
        if parts.is_empty() {
            return Err(WssError::Structural("no element matched a signature part".to_string()));
        }

        let signed_info = self.signed_info(&parts)?;
        let canonical = c14n::canonicalize(&signed_info);

        let token = ctx.message.resolve_token(&self.token_id)?;
        token.verify()?;
        let key = token.secret_key(self.signature_algorithm.uri, KeyUsage::Signature)?;
        let value = BASE64.encode(crypto::sign(self.signature_algorithm, &key, &canonical)?);

        ctx.message
            .publish_token_used(token.id(), token.token_type(), KeyUsage::Signature);
        ctx.message.publish(SecurityEvent::SignatureValue {
            algorithm: self.signature_algorithm.uri.to_string(),
            value: value.clone(),
            token_id: token.id().to_string(),
        });

        let signature_id = ctx.message.generate_id("SIG");
        let mut out: Vec<StreamEvent> = parts
            .iter()
            .filter_map(|p| p.token_reference.as_deref().map(|token| token_reference(&p.reference_id, token)))
            .flatten()
            .collect();
        out.push(StreamEvent::ElementStart(
            ElementStart::new(ns::dsig(node::SIGNATURE)).with_attribute(ns::unqualified(attr::ID), signature_id.clone()),
        ));
        out.extend(signed_info);
        out.extend(text_element(ns::dsig(node::SIGNATURE_VALUE), value));
        out.extend(keyinfo::str_key_info(token.id()));
        out.push(StreamEvent::end(ns::dsig(node::SIGNATURE)));
        out.extend(self.tail.release());

        info!(signature_id = %signature_id, references = parts.len(), token = %self.token_id, "Message signed");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{AlgorithmRegistry, HMAC_SHA256};
    use crate::chain::{Placement, ProcessorChain};
    use crate::context::MessageContext;
    use crate::event::QName;
    use crate::processor::header::SecurityHeaderUnit;
    use crate::secure_part::Modifier;
    use crate::token::{InMemoryTokenRegistry, SymmetricToken};
    use crate::xml::{read_events, write_events};
    use std::sync::Arc;

    const MESSAGE: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Header><t:Token xmlns:t="urn:t" xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd" wsu:Id="tok-1">abc</t:Token></soap:Header><soap:Body><m:A xmlns:m="urn:m"><m:A>inner</m:A></m:A></soap:Body></soap:Envelope>"#;

    fn sign(xml: &str, parts: Vec<SecurePart>) -> Result<(String, Vec<SignaturePartDef>), WssError> {
        let mut registry = InMemoryTokenRegistry::new();
        registry.insert(Arc::new(SymmetricToken::new("mac", vec![7u8; 32])))?;
        let mut ctx = MessageContext::new(Arc::new(registry));
        let algorithms = AlgorithmRegistry::global();

        let mut chain = ProcessorChain::new();
        chain.insert(Box::new(SecurityHeaderUnit::new()), Placement::new())?;
        chain.insert(
            Box::new(SignatureUnit::new(parts, algorithms.lookup(algorithm::SHA256)?)),
            Placement::new().after(UnitId::SecurityHeader),
        )?;
        chain.insert(
            Box::new(SignatureEndingUnit::new(
                "mac",
                algorithms.lookup(HMAC_SHA256)?,
                algorithms.lookup(algorithm::EXC_C14N)?,
            )?),
            Placement::new().after(UnitId::Signature),
        )?;
        let out = chain.process(read_events(xml)?.into_iter().map(Ok), &mut ctx)?;
        Ok((write_events(&out), ctx.signature_parts().to_vec()))
    }

    fn body() -> SecurePart {
        SecurePart::element(QName::new(ns::SOAP_11_NS, "Body"), Modifier::Element)
    }

    #[test]
    fn test_body_signed_in_security_header() {
        let (out, parts) = sign(MESSAGE, vec![body()]).unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].digest_value.is_some());
        assert_eq!(parts[0].transforms, vec![algorithm::EXC_C14N.to_string()]);

        let id = &parts[0].reference_id;
        assert!(out.contains(&format!("wsu:Id=\"{}\"", id)));
        assert!(out.contains(&format!("URI=\"#{}\"", id)));
        assert_eq!(out.matches("<ds:Reference ").count(), 1);
        assert!(out.contains("</ds:Signature></wsse:Security>"));
        assert!(out.find("</wsse:Security>").unwrap() < out.find("<soap:Body").unwrap());
    }

    #[test]
    fn test_nested_match_signed_once() {
        let outer = SecurePart::element(QName::new("urn:m", "A"), Modifier::Element);
        let (_, parts) = sign(MESSAGE, vec![outer]).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].path.len(), 3);
        assert_eq!(parts[0].path[2], QName::new("urn:m", "A"));
    }

    #[test]
    fn test_existing_id_reused() {
        let xml = MESSAGE.replace(
            "<soap:Body>",
            r#"<soap:Body xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd" wsu:Id="body-1">"#,
        );
        let (out, parts) = sign(&xml, vec![body()]).unwrap();
        assert_eq!(parts[0].reference_id, "body-1");
        assert!(out.contains("URI=\"#body-1\""));
        assert_eq!(out.matches("wsu:Id=\"body-1\"").count(), 1);
    }

    #[test]
    fn test_token_reference_emits_str() {
        let (out, parts) = sign(MESSAGE, vec![SecurePart::token_reference("tok-1", "str-1")]).unwrap();
        assert_eq!(parts[0].reference_id, "str-1");
        assert_eq!(parts[0].token_reference.as_deref(), Some("tok-1"));
        assert!(out.contains(algorithm::STR_TRANSFORM));
        assert!(out.contains("URI=\"#str-1\""));

        let str_start = out.find("<wsse:SecurityTokenReference").unwrap();
        assert!(out[str_start..].contains("wsu:Id=\"str-1\""));
        assert!(out[str_start..].contains("URI=\"#tok-1\""));
        assert!(str_start < out.find("<ds:Signature").unwrap());
    }

    #[test]
    fn test_nothing_matched_fails() {
        let result = sign(MESSAGE, vec![SecurePart::id("nope", Modifier::Element)]);
        assert!(matches!(result, Err(WssError::Structural(_))));
    }

    #[test]
    fn test_wrong_algorithm_kind_rejected() {
        let algorithms = AlgorithmRegistry::global();
        let result = SignatureEndingUnit::new(
            "mac",
            algorithms.lookup(algorithm::SHA256).unwrap(),
            algorithms.lookup(algorithm::EXC_C14N).unwrap(),
        );
        assert!(matches!(result, Err(WssError::UnsupportedAlgorithm(_))));
    }
}
