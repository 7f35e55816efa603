//! Per-message processing context shared by all units of one chain.

use crate::algorithm::AlgorithmRegistry;
use crate::error::WssError;
use crate::secure_part::{EncryptionPartDef, SignaturePartDef};
use crate::security_event::{SecurityEvent, SecurityEventBus};
use crate::token::{root_token, KeyUsage, SecurityToken, TokenRegistry, TokenType};
use std::collections::HashSet;
use std::sync::Arc;

/// State owned by one message for the duration of its processing.
///
/// Never shared between messages: each message gets its own bus, id space
/// and part records.
pub struct MessageContext {
    bus: SecurityEventBus,
    tokens: Arc<dyn TokenRegistry>,
    algorithms: &'static AlgorithmRegistry,
    ids: HashSet<String>,
    signature_parts: Vec<SignaturePartDef>,
    encryption_parts: Vec<EncryptionPartDef>,
}

impl MessageContext {
    pub fn new(tokens: Arc<dyn TokenRegistry>) -> Self {
        Self {
            bus: SecurityEventBus::new(),
            tokens,
            algorithms: AlgorithmRegistry::global(),
            ids: HashSet::new(),
            signature_parts: Vec::new(),
            encryption_parts: Vec::new(),
        }
    }

    pub fn bus(&mut self) -> &mut SecurityEventBus {
        &mut self.bus
    }

    pub fn publish(&mut self, event: SecurityEvent) {
        self.bus.publish(event);
    }

    /// Publish a token-use observation carrying the type of the root of the
    /// token's key-wrapping chain.
    pub fn publish_token_used(&mut self, token_id: &str, token_type: TokenType, usage: KeyUsage) {
        let root_token_type = self
            .tokens
            .resolve(token_id)
            .and_then(|token| root_token(self.tokens.as_ref(), token))
            .map(|root| root.token_type())
            .unwrap_or(token_type);
        self.bus.publish(SecurityEvent::TokenUsed {
            token_id: token_id.to_string(),
            token_type,
            root_token_type,
            usage,
        });
    }

    pub fn algorithms(&self) -> &'static AlgorithmRegistry {
        self.algorithms
    }

    pub fn resolve_token(&self, id: &str) -> Result<Arc<dyn SecurityToken>, WssError> {
        self.tokens.resolve(id)
    }

    pub fn tokens(&self) -> &dyn TokenRegistry {
        self.tokens.as_ref()
    }

    /// Generate a fresh identifier and reserve it.
    pub fn generate_id(&mut self, prefix: &str) -> String {
        loop {
            let id = format!("{}-{}", prefix, uuid::Uuid::new_v4());
            if self.ids.insert(id.clone()) {
                return id;
            }
        }
    }

    /// Reserve an identifier found in the document.
    pub fn claim_id(&mut self, id: &str) -> Result<(), WssError> {
        if self.ids.insert(id.to_string()) {
            Ok(())
        } else {
            Err(WssError::Structural(format!("duplicate identifier '{}'", id)))
        }
    }

    /// Record a matched signature part. Returns its index.
    pub fn add_signature_part(&mut self, part: SignaturePartDef) -> usize {
        self.signature_parts.push(part);
        self.signature_parts.len() - 1
    }

    pub fn signature_part_mut(&mut self, index: usize) -> Option<&mut SignaturePartDef> {
        self.signature_parts.get_mut(index)
    }

    pub fn signature_parts(&self) -> &[SignaturePartDef] {
        &self.signature_parts
    }

    pub fn add_encryption_part(&mut self, part: EncryptionPartDef) {
        self.encryption_parts.push(part);
    }

    pub fn encryption_parts(&self) -> &[EncryptionPartDef] {
        &self.encryption_parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::InMemoryTokenRegistry;

    fn context() -> MessageContext {
        MessageContext::new(Arc::new(InMemoryTokenRegistry::new()))
    }

    #[test]
    fn test_generated_ids_are_unique_and_reserved() {
        let mut ctx = context();
        let a = ctx.generate_id("id");
        let b = ctx.generate_id("id");
        assert_ne!(a, b);
        assert!(a.starts_with("id-"));
        assert!(ctx.claim_id(&a).is_err());
    }

    #[test]
    fn test_claim_duplicate_id() {
        let mut ctx = context();
        ctx.claim_id("body-1").unwrap();
        assert!(matches!(ctx.claim_id("body-1"), Err(WssError::Structural(_))));
    }

    #[test]
    fn test_token_used_reports_root_type() {
        use crate::security_event::EventCollector;
        use crate::token::{Ed25519Token, SymmetricToken};
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut registry = InMemoryTokenRegistry::new();
        registry.insert(Arc::new(Ed25519Token::from_seed("root", [1u8; 32]))).unwrap();
        registry
            .insert(Arc::new(SymmetricToken::new("session", vec![0u8; 32]).wrapped_by("root")))
            .unwrap();
        let mut ctx = MessageContext::new(Arc::new(registry));
        let collector = Rc::new(RefCell::new(EventCollector::new()));
        ctx.bus().subscribe(collector.clone());

        ctx.publish_token_used("session", TokenType::Symmetric, KeyUsage::Encryption);
        ctx.publish_token_used("inline", TokenType::Symmetric, KeyUsage::Decryption);

        let events = collector.borrow().events().to_vec();
        assert!(matches!(
            &events[0],
            SecurityEvent::TokenUsed { root_token_type: TokenType::Ed25519, .. }
        ));
        assert!(matches!(
            &events[1],
            SecurityEvent::TokenUsed { root_token_type: TokenType::Symmetric, .. }
        ));
    }

    #[test]
    fn test_unknown_token() {
        let ctx = context();
        assert!(matches!(
            ctx.resolve_token("nope"),
            Err(WssError::KeyResolutionFailed(_))
        ));
    }
}
