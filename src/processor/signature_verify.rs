//! Inbound XML Signature verification.
//!
//! The security header is bounded, so [`SignatureVerifyUnit`] holds it until
//! its end, checks the signature value, installs one [`ReferenceDigestUnit`]
//! per reference and then releases the header downstream. Each reference
//! unit waits for its target element, digests it as it streams past and
//! compares the result.

use crate::algorithm::{self, AlgorithmInfo, AlgorithmKind};
use crate::c14n::{self, ExclusiveCanonicalizer};
use crate::chain::{ProcessingUnit, UnitContext, UnitId};
use crate::crypto::{self, Hasher};
use crate::error::WssError;
use crate::event::{QName, StreamEvent};
use crate::keyinfo::{decode_base64, KeyInfoChild};
use crate::ns::{self, attr, node, DSIG_NS, WSSE_NS};
use crate::secure_part::{element_id, DocumentTracker, SignaturePartDef};
use crate::security_event::SecurityEvent;
use crate::token::KeyUsage;
use crate::xml::Element;
use tracing::{debug, info, warn};

/// One `ds:Reference` taken from a verified `ds:SignedInfo`.
#[derive(Debug, Clone)]
pub struct SignedReference {
    /// Fragment id of the Reference URI
    pub reference_id: String,
    pub transforms: Vec<String>,
    pub digest_algorithm: &'static AlgorithmInfo,
    pub digest_value: Vec<u8>,
}

impl SignedReference {
    fn dereferences_token(&self) -> bool {
        self.transforms.iter().any(|t| t == algorithm::STR_TRANSFORM)
    }
}

/// Verifies the `ds:Signature` of the security header.
#[derive(Default)]
pub struct SignatureVerifyUnit {
    tracker: DocumentTracker,
    header: Option<Vec<StreamEvent>>,
    header_path: Vec<QName>,
    header_done: bool,
    references: Vec<String>,
    signature_found: bool,
}

impl SignatureVerifyUnit {
    pub fn new() -> Self {
        Self::default()
    }

    fn process_header(&mut self, events: &[StreamEvent], ctx: &mut UnitContext<'_>) -> Result<(), WssError> {
        let header = Element::from_events(events)?;
        let mut signatures = header.children_named(DSIG_NS, node::SIGNATURE);
        let signature = match signatures.next() {
            Some(signature) => signature,
            None => return Ok(()),
        };
        if signatures.next().is_some() {
            return Err(WssError::Structural(
                "security header carries more than one signature".to_string(),
            ));
        }
        self.signature_found = true;

        let references = verify_signature(signature, ctx)?;
        for reference in references {
            debug!(reference_id = %reference.reference_id, "Awaiting signed reference");
            self.references.push(reference.reference_id.clone());
            ctx.insert_after_self(Box::new(ReferenceDigestUnit::new(reference, self.header_path.clone())?));
        }
        Ok(())
    }
}

/// Check the signature value over `ds:SignedInfo` and return its references.
pub fn verify_signature(signature: &Element, ctx: &mut UnitContext<'_>) -> Result<Vec<SignedReference>, WssError> {
    let algorithms = ctx.message.algorithms();
    let algorithm_attr = ns::unqualified(attr::ALGORITHM);
    let signed_info = signature
        .child(DSIG_NS, node::SIGNED_INFO)
        .ok_or_else(|| WssError::Structural("ds:Signature without ds:SignedInfo".to_string()))?;

    let c14n_uri = signed_info
        .child(DSIG_NS, node::CANONICALIZATION_METHOD)
        .and_then(|m| m.attribute(&algorithm_attr))
        .ok_or_else(|| WssError::Structural("ds:SignedInfo without CanonicalizationMethod".to_string()))?;
    algorithms.lookup_kind(c14n_uri, AlgorithmKind::Canonicalization)?;
    let signature_uri = signed_info
        .child(DSIG_NS, node::SIGNATURE_METHOD)
        .and_then(|m| m.attribute(&algorithm_attr))
        .ok_or_else(|| WssError::Structural("ds:SignedInfo without SignatureMethod".to_string()))?;
    let signature_algorithm = algorithms.lookup_kind(signature_uri, AlgorithmKind::Signature)?;

    let value_text = signature
        .child(DSIG_NS, node::SIGNATURE_VALUE)
        .map(|v| v.text())
        .ok_or_else(|| WssError::Structural("ds:Signature without SignatureValue".to_string()))?;
    let value = decode_base64(&value_text)?;

    let key_info = signature
        .child(DSIG_NS, node::KEY_INFO)
        .ok_or_else(|| WssError::KeyResolutionFailed("ds:Signature without KeyInfo".to_string()))?;
    let key = KeyInfoChild::parse(key_info)?.resolve(ctx.message)?;
    key.verify_trust()?;
    let verification_key = key.verification_key(signature_algorithm)?;

    let mut signed_info_events = Vec::new();
    signed_info.to_events(&mut signed_info_events);
    let canonical = c14n::canonicalize(&signed_info_events);
    if let Err(e) = crypto::verify(signature_algorithm, &verification_key, &canonical, &value) {
        warn!(token = key.token_id(), "Signature value did not verify");
        return Err(e);
    }

    ctx.message
        .publish_token_used(key.token_id(), key.token_type(), KeyUsage::SignatureVerification);
    ctx.message.publish(SecurityEvent::SignatureValue {
        algorithm: signature_uri.to_string(),
        value: value_text.trim().to_string(),
        token_id: key.token_id().to_string(),
    });

    signed_info
        .children_named(DSIG_NS, node::REFERENCE)
        .map(|reference| parse_reference(reference, ctx))
        .collect()
}

fn parse_reference(reference: &Element, ctx: &UnitContext<'_>) -> Result<SignedReference, WssError> {
    let algorithms = ctx.message.algorithms();
    let algorithm_attr = ns::unqualified(attr::ALGORITHM);
    let uri = reference
        .attribute(&ns::unqualified(attr::URI))
        .ok_or_else(|| WssError::Structural("ds:Reference without URI".to_string()))?;
    let reference_id = uri
        .strip_prefix('#')
        .filter(|id| !id.is_empty())
        .ok_or_else(|| WssError::Structural(format!("unsupported reference URI '{}'", uri)))?;

    let mut transforms = Vec::new();
    if let Some(list) = reference.child(DSIG_NS, node::TRANSFORMS) {
        for transform in list.children_named(DSIG_NS, node::TRANSFORM) {
            let uri = transform
                .attribute(&algorithm_attr)
                .ok_or_else(|| WssError::Structural("ds:Transform without Algorithm".to_string()))?;
            let info = algorithms.lookup(uri)?;
            if !matches!(info.kind, AlgorithmKind::Canonicalization | AlgorithmKind::Transform) {
                return Err(WssError::UnsupportedAlgorithm(uri.to_string()));
            }
            transforms.push(uri.to_string());
        }
    }

    let digest_uri = reference
        .child(DSIG_NS, node::DIGEST_METHOD)
        .and_then(|m| m.attribute(&algorithm_attr))
        .ok_or_else(|| WssError::Structural("ds:Reference without DigestMethod".to_string()))?;
    let digest_value = reference
        .child(DSIG_NS, node::DIGEST_VALUE)
        .ok_or_else(|| WssError::Structural("ds:Reference without DigestValue".to_string()))?;

    Ok(SignedReference {
        reference_id: reference_id.to_string(),
        transforms,
        digest_algorithm: algorithms.lookup_kind(digest_uri, AlgorithmKind::Digest)?,
        digest_value: decode_base64(&digest_value.text())?,
    })
}

impl ProcessingUnit for SignatureVerifyUnit {
    fn id(&self) -> UnitId {
        UnitId::SignatureVerify
    }

    fn transform(&mut self, event: StreamEvent, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        match &event {
            StreamEvent::ElementStart(start) => {
                if let Some(id) = element_id(start) {
                    ctx.message.claim_id(id)?;
                }
                if !self.header_done && self.header.is_none() {
                    self.header_path = self.tracker.path().to_vec();
                }
                self.tracker.enter(start);
                if !self.header_done && self.header.is_none() && self.tracker.is_security_header() {
                    self.header = Some(Vec::new());
                }
            }
            StreamEvent::ElementEnd(_) => {
                if self.header.is_some() && self.tracker.is_security_header() {
                    self.tracker.leave();
                    let mut events = self.header.take().unwrap_or_default();
                    events.push(event);
                    self.header_done = true;
                    self.process_header(&events, ctx)?;
                    return Ok(events);
                }
                self.tracker.leave();
            }
            StreamEvent::Characters(_) => {}
        }

        match self.header.as_mut() {
            Some(held) => {
                held.push(event);
                Ok(Vec::new())
            }
            None => Ok(vec![event]),
        }
    }

    fn finalize(&mut self, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        if !self.signature_found {
            return Err(WssError::Structural("expected ds:Signature not found".to_string()));
        }
        for reference in &self.references {
            let verified = ctx
                .message
                .signature_parts()
                .iter()
                .any(|p| &p.reference_id == reference && p.digest_value.is_some());
            if !verified {
                return Err(WssError::SignatureVerificationFailed(format!(
                    "referenced element #{} not found",
                    reference
                )));
            }
        }
        info!(references = self.references.len(), "Signature verified");
        Ok(Vec::new())
    }
}

enum DigestState {
    /// Waiting for the element carrying the target id
    Waiting,
    /// Reading the security token reference to find the token element
    Dereferencing { events: Vec<StreamEvent>, depth: usize },
    Digesting {
        hasher: Hasher,
        c14n: ExclusiveCanonicalizer,
        path: Vec<QName>,
    },
}

/// Recomputes the digest of one referenced element.
pub struct ReferenceDigestUnit {
    reference: SignedReference,
    target: String,
    dereference: bool,
    token_reference: Option<String>,
    tracker: DocumentTracker,
    state: DigestState,
}

impl ReferenceDigestUnit {
    pub fn new(reference: SignedReference, base_path: Vec<QName>) -> Result<Self, WssError> {
        // Fail early on a digest we cannot compute
        Hasher::new(reference.digest_algorithm)?;
        Ok(Self {
            target: reference.reference_id.clone(),
            dereference: reference.dereferences_token(),
            token_reference: None,
            reference,
            tracker: DocumentTracker::with_path(base_path),
            state: DigestState::Waiting,
        })
    }

    fn finish(&mut self, digest: Vec<u8>, path: Vec<QName>, ctx: &mut UnitContext<'_>) -> Result<(), WssError> {
        if !crypto::digests_equal(&digest, &self.reference.digest_value) {
            return Err(WssError::SignatureVerificationFailed(format!(
                "digest mismatch for reference #{}",
                self.reference.reference_id
            )));
        }
        debug!(reference_id = %self.reference.reference_id, "Reference digest matched");
        ctx.message.publish(SecurityEvent::ReferenceMatched {
            reference_id: self.reference.reference_id.clone(),
        });
        ctx.message.publish(SecurityEvent::SignedElement {
            path: path.clone(),
            reference_id: self.reference.reference_id.clone(),
            digest_algorithm: self.reference.digest_algorithm.uri.to_string(),
        });
        ctx.message.add_signature_part(SignaturePartDef {
            reference_id: self.reference.reference_id.clone(),
            path,
            transforms: self.reference.transforms.clone(),
            token_reference: self.token_reference.clone(),
            digest_algorithm: self.reference.digest_algorithm.uri.to_string(),
            digest_value: Some(digest),
        });
        ctx.remove_self();
        Ok(())
    }
}

impl ProcessingUnit for ReferenceDigestUnit {
    fn id(&self) -> UnitId {
        UnitId::ReferenceDigest
    }

    fn transform(&mut self, event: StreamEvent, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        if let StreamEvent::ElementStart(start) = &event {
            self.tracker.enter(start);
            if matches!(self.state, DigestState::Waiting) && element_id(start) == Some(self.target.as_str()) {
                if self.dereference {
                    if !start.name.is(WSSE_NS, node::SECURITY_TOKEN_REFERENCE) {
                        return Err(WssError::SignatureVerificationFailed(format!(
                            "STR-Transform reference #{} does not point at a SecurityTokenReference",
                            self.target
                        )));
                    }
                    self.state = DigestState::Dereferencing {
                        events: Vec::new(),
                        depth: 0,
                    };
                } else {
                    self.state = DigestState::Digesting {
                        hasher: Hasher::new(self.reference.digest_algorithm)?,
                        c14n: ExclusiveCanonicalizer::new(),
                        path: self.tracker.path().to_vec(),
                    };
                }
            }
        }

        let mut completed = None;
        match &mut self.state {
            DigestState::Waiting => {}
            DigestState::Dereferencing { events, depth } => {
                match &event {
                    StreamEvent::ElementStart(_) => *depth += 1,
                    StreamEvent::ElementEnd(_) => *depth -= 1,
                    StreamEvent::Characters(_) => {}
                }
                events.push(event.clone());
                if *depth == 0 {
                    let str_element = Element::from_events(events)?;
                    let uri = str_element
                        .child(WSSE_NS, node::REFERENCE)
                        .and_then(|r| r.attribute(&ns::unqualified(attr::URI)))
                        .ok_or_else(|| {
                            WssError::SignatureVerificationFailed(
                                "SecurityTokenReference without Reference URI".to_string(),
                            )
                        })?;
                    debug!(reference_id = %self.reference.reference_id, token = uri, "Dereferenced security token reference");
                    self.target = uri.trim_start_matches('#').to_string();
                    self.token_reference = Some(self.target.clone());
                    self.dereference = false;
                    self.state = DigestState::Waiting;
                }
            }
            DigestState::Digesting { hasher, c14n, path } => {
                c14n.feed(&event);
                hasher.update(&c14n.take_output());
                if c14n.depth() == 0 {
                    completed = Some(path.clone());
                }
            }
        }

        if let Some(path) = completed {
            if let DigestState::Digesting { hasher, .. } = std::mem::replace(&mut self.state, DigestState::Waiting) {
                self.finish(hasher.finalize(), path, ctx)?;
            }
        }
        if matches!(event, StreamEvent::ElementEnd(_)) {
            self.tracker.leave();
        }
        Ok(vec![event])
    }
}
