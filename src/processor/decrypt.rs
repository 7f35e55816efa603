//! Inbound XML Decryption.
//!
//! `xenc:EncryptedData` (and `wsse11:EncryptedHeader`) subtrees are small and
//! bounded, so each is collected, its key resolved through its KeyInfo and the
//! recovered plaintext parsed back into events. Those events are fed through
//! the same logic again, so nested encrypted content is handled, and then
//! travel down the chain as if they had been in the source.

use crate::algorithm::AlgorithmKind;
use crate::chain::{ProcessingUnit, UnitContext, UnitId};
use crate::crypto;
use crate::error::WssError;
use crate::event::{QName, StreamEvent};
use crate::keyinfo::{decode_base64, KeyInfoChild};
use crate::ns::{self, attr, node, DSIG_NS, WSSE11_NS, XENC_NS, XENC_TYPE_CONTENT};
use crate::secure_part::DocumentTracker;
use crate::security_event::SecurityEvent;
use crate::token::KeyUsage;
use crate::xml::{parse_fragment, Element};
use std::collections::HashSet;
use tracing::{debug, info};

struct Capture {
    events: Vec<StreamEvent>,
    depth: usize,
}

#[derive(Default)]
pub struct DecryptUnit {
    tracker: DocumentTracker,
    scopes: Vec<Vec<(Option<String>, String)>>,
    capture: Option<Capture>,
    /// Ids listed in `xenc:ReferenceList`
    expected: Vec<String>,
    decrypted: HashSet<String>,
    found: usize,
}

impl DecryptUnit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace bindings in scope at the current position, innermost last
    /// and without duplicates.
    fn bindings(&self) -> Vec<(Option<String>, String)> {
        let mut bindings: Vec<(Option<String>, String)> = Vec::new();
        for (prefix, uri) in self.scopes.iter().flatten() {
            bindings.retain(|(p, _)| p != prefix);
            bindings.push((prefix.clone(), uri.clone()));
        }
        bindings
    }

    fn handle(&mut self, event: StreamEvent, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        if let Some(capture) = self.capture.as_mut() {
            match &event {
                StreamEvent::ElementStart(_) => capture.depth += 1,
                StreamEvent::ElementEnd(_) => capture.depth -= 1,
                StreamEvent::Characters(_) => {}
            }
            capture.events.push(event);
            if capture.depth > 0 {
                return Ok(Vec::new());
            }
            let events = self.capture.take().map(|c| c.events).unwrap_or_default();
            return self.decrypt(&events, ctx);
        }

        match &event {
            StreamEvent::ElementStart(start) => {
                if start.name.is(XENC_NS, node::ENCRYPTED_DATA) || start.name.is(WSSE11_NS, node::ENCRYPTED_HEADER) {
                    self.capture = Some(Capture {
                        events: vec![event],
                        depth: 1,
                    });
                    return Ok(Vec::new());
                }
                self.tracker.enter(start);
                self.scopes.push(
                    start
                        .namespaces
                        .iter()
                        .map(|d| (d.prefix.clone(), d.uri.clone()))
                        .collect(),
                );
                if start.name.is(XENC_NS, node::DATA_REFERENCE) && self.tracker.in_security_header() {
                    if let Some(uri) = start.attribute(&ns::unqualified(attr::URI)) {
                        self.expected.push(uri.trim_start_matches('#').to_string());
                    }
                }
            }
            StreamEvent::ElementEnd(_) => {
                self.tracker.leave();
                self.scopes.pop();
            }
            StreamEvent::Characters(_) => {}
        }
        Ok(vec![event])
    }

    fn decrypt(&mut self, events: &[StreamEvent], ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        let captured = Element::from_events(events)?;
        let encrypted_data = if captured.name().is(WSSE11_NS, node::ENCRYPTED_HEADER) {
            captured
                .child(XENC_NS, node::ENCRYPTED_DATA)
                .ok_or_else(|| WssError::Structural("EncryptedHeader without EncryptedData".to_string()))?
        } else {
            &captured
        };
        self.found += 1;

        let reference_id = encrypted_data
            .attribute(&ns::unqualified(attr::ID))
            .unwrap_or_default()
            .to_string();
        let content_only = encrypted_data.attribute(&ns::unqualified(attr::TYPE)) == Some(XENC_TYPE_CONTENT);
        let algorithm_uri = encrypted_data
            .child(XENC_NS, node::ENCRYPTION_METHOD)
            .and_then(|m| m.attribute(&ns::unqualified(attr::ALGORITHM)))
            .ok_or_else(|| WssError::Structural("EncryptedData without EncryptionMethod".to_string()))?;
        let algorithm = ctx
            .message
            .algorithms()
            .lookup_kind(algorithm_uri, AlgorithmKind::Encryption)?;

        let key_info = encrypted_data
            .child(DSIG_NS, node::KEY_INFO)
            .ok_or_else(|| WssError::KeyResolutionFailed("EncryptedData without KeyInfo".to_string()))?;
        let key = KeyInfoChild::parse(key_info)?.resolve(ctx.message)?;
        key.verify_trust()?;
        let secret = key.secret_key(algorithm.uri, KeyUsage::Decryption)?;

        let cipher_value = encrypted_data
            .child(XENC_NS, node::CIPHER_DATA)
            .and_then(|c| c.child(XENC_NS, node::CIPHER_VALUE))
            .ok_or_else(|| WssError::Structural("EncryptedData without CipherValue".to_string()))?;
        let plaintext = crypto::decrypt(algorithm, &secret, &decode_base64(&cipher_value.text())?)?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| WssError::DecryptionFailed("plaintext is not UTF-8".to_string()))?;
        let recovered = parse_fragment(&plaintext, &self.bindings())
            .map_err(|e| WssError::DecryptionFailed(format!("plaintext is not well-formed: {}", e)))?;

        let mut path: Vec<QName> = self.tracker.path().to_vec();
        if !content_only {
            if let Some(start) = recovered.iter().find_map(StreamEvent::as_start) {
                path.push(start.name.clone());
            }
        }
        debug!(reference_id = %reference_id, content_only, events = recovered.len(), "Decrypted element");
        ctx.message
            .publish_token_used(key.token_id(), key.token_type(), KeyUsage::Decryption);
        ctx.message.publish(SecurityEvent::EncryptedElement {
            path,
            reference_id: reference_id.clone(),
            algorithm: algorithm.uri.to_string(),
            content_only,
            token_id: key.token_id().to_string(),
        });
        if !reference_id.is_empty() {
            self.decrypted.insert(reference_id);
        }

        let mut out = Vec::with_capacity(recovered.len());
        for event in recovered {
            out.extend(self.handle(event, ctx)?);
        }
        Ok(out)
    }
}

impl ProcessingUnit for DecryptUnit {
    fn id(&self) -> UnitId {
        UnitId::Decrypt
    }

    fn transform(&mut self, event: StreamEvent, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        self.handle(event, ctx)
    }

    fn finalize(&mut self, _ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        if self.capture.is_some() {
            return Err(WssError::Structural("unterminated EncryptedData".to_string()));
        }
        if self.found == 0 {
            return Err(WssError::Structural("expected xenc:EncryptedData not found".to_string()));
        }
        if let Some(missing) = self.expected.iter().find(|id| !self.decrypted.contains(*id)) {
            return Err(WssError::DecryptionFailed(format!(
                "EncryptedData #{} listed in ReferenceList not found",
                missing
            )));
        }
        info!(decrypted = self.found, "Message decrypted");
        Ok(Vec::new())
    }
}
