//! Engine façade: builds the outbound and inbound chains from configuration
//! and runs one message through them.

use crate::algorithm::{AlgorithmKind, AlgorithmRegistry};
use crate::chain::{Placement, ProcessingUnit, ProcessorChain, UnitId};
use crate::config::{Action, FailAction, SoapVersion, WssConfig};
use crate::context::MessageContext;
use crate::error::{soap_fault_response, FaultCode, SoapFaultVersion, WssError};
use crate::event::StreamEvent;
use crate::policy::{PolicyEnforcer, PolicyVerdict};
use crate::processor::decrypt::DecryptUnit;
use crate::processor::encrypt::{EncryptEndingUnit, EncryptUnit};
use crate::processor::header::SecurityHeaderUnit;
use crate::processor::observer::ElementObserverUnit;
use crate::processor::signature::{SignatureEndingUnit, SignatureUnit};
use crate::processor::signature_verify::SignatureVerifyUnit;
use crate::processor::timestamp::{TimestampUnit, TimestampVerifyUnit};
use crate::secure_part::SecurePart;
use crate::security_event::{EventCollector, SecurityEvent};
use crate::token::TokenRegistry;
use crate::xml::{soap_version, write_events, EventReader};
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Output of the outbound chain.
#[derive(Debug, Clone, Serialize)]
pub struct SecuredMessage {
    pub xml: String,
    pub events: Vec<SecurityEvent>,
}

/// Output of the inbound chain.
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedMessage {
    pub xml: String,
    pub events: Vec<SecurityEvent>,
    /// `None` when no policy is configured
    pub verdict: Option<PolicyVerdict>,
    /// False when the policy was violated and the fail action is `block`
    pub accepted: bool,
}

/// Counters over the lifetime of one engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub secured: u64,
    pub verified: u64,
    pub rejected: u64,
}

/// Secures and verifies messages according to one configuration.
///
/// Shareable between threads; every message gets its own chain, context and
/// event bus.
pub struct WssEngine {
    config: WssConfig,
    tokens: Arc<dyn TokenRegistry>,
    signature_parts: Vec<SecurePart>,
    encryption_parts: Vec<SecurePart>,
    messages_secured: AtomicU64,
    messages_verified: AtomicU64,
    messages_rejected: AtomicU64,
}

impl WssEngine {
    /// Create an engine over an externally supplied token registry.
    pub fn new(config: WssConfig, tokens: Arc<dyn TokenRegistry>) -> Result<Self, WssError> {
        let signature_parts = config.signature_parts()?;
        let encryption_parts = config.encryption_parts()?;
        Ok(Self {
            config,
            tokens,
            signature_parts,
            encryption_parts,
            messages_secured: AtomicU64::new(0),
            messages_verified: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
        })
    }

    /// Create an engine whose tokens come from the configuration itself.
    pub fn from_config(config: WssConfig) -> Result<Self, WssError> {
        config.validate()?;
        let registry = config.token_registry()?;
        info!(tokens = registry.len(), actions = ?config.settings.actions, "WS-Security engine configured");
        Self::new(config, Arc::new(registry))
    }

    pub fn config(&self) -> &WssConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            secured: self.messages_secured.load(Ordering::Relaxed),
            verified: self.messages_verified.load(Ordering::Relaxed),
            rejected: self.messages_rejected.load(Ordering::Relaxed),
        }
    }

    /// Apply the configured actions to an outbound message.
    pub fn secure(&self, xml: &str) -> Result<SecuredMessage, WssError> {
        let result = self.check_size(xml).and_then(|_| {
            let mut chain = self.outbound_chain()?;
            let (output, events) = self.run(&mut chain, xml, None)?;
            Ok(SecuredMessage { xml: write_events(&output), events })
        });
        match result {
            Ok(message) => {
                self.messages_secured.fetch_add(1, Ordering::Relaxed);
                info!(events = message.events.len(), "Message secured");
                Ok(message)
            }
            Err(e) => {
                self.messages_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Securing message failed");
                Err(e)
            }
        }
    }

    /// Undo and check the configured actions on an inbound message, then
    /// evaluate the policy.
    pub fn verify(&self, xml: &str) -> Result<VerifiedMessage, WssError> {
        let enforcer = self
            .config
            .policy
            .as_ref()
            .map(|policy| Rc::new(RefCell::new(PolicyEnforcer::new(policy))));

        let result = self.check_size(xml).and_then(|_| {
            let mut chain = self.inbound_chain()?;
            self.run(&mut chain, xml, enforcer.clone())
        });
        let (output, events) = match result {
            Ok(done) => done,
            Err(e) => {
                self.messages_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Verifying message failed");
                return Err(e);
            }
        };

        let verdict = enforcer.map(|enforcer| enforcer.borrow().verdict());
        let accepted = match &verdict {
            Some(PolicyVerdict::Violated(violation)) => match self.config.settings.fail_action {
                FailAction::Block => false,
                FailAction::Allow => {
                    warn!(%violation, "Policy violated, message allowed by fail action");
                    true
                }
            },
            _ => true,
        };
        if accepted {
            self.messages_verified.fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_rejected.fetch_add(1, Ordering::Relaxed);
        }
        info!(accepted, events = events.len(), "Message verified");

        Ok(VerifiedMessage {
            xml: write_events(&output),
            events,
            verdict,
            accepted,
        })
    }

    fn check_size(&self, xml: &str) -> Result<(), WssError> {
        let limit = self.config.settings.max_message_size;
        if xml.len() > limit {
            return Err(WssError::Structural(format!(
                "message of {} bytes exceeds the {} byte limit",
                xml.len(),
                limit
            )));
        }
        Ok(())
    }

    fn run(
        &self,
        chain: &mut ProcessorChain,
        xml: &str,
        enforcer: Option<Rc<RefCell<PolicyEnforcer>>>,
    ) -> Result<(Vec<StreamEvent>, Vec<SecurityEvent>), WssError> {
        let mut ctx = MessageContext::new(self.tokens.clone());
        let collector = Rc::new(RefCell::new(EventCollector::new()));
        ctx.bus().subscribe(collector.clone());
        if let Some(enforcer) = enforcer {
            ctx.bus().subscribe(enforcer);
        }

        debug!(units = ?chain.unit_ids(), bytes = xml.len(), "Processing message");
        let output = chain.process(EventReader::new(xml)?, &mut ctx)?;
        let events = collector.borrow_mut().take();
        Ok((output, events))
    }

    /// Header unit, then each action's wrapping and ending units in
    /// configuration order.
    fn outbound_chain(&self) -> Result<ProcessorChain, WssError> {
        let registry = AlgorithmRegistry::global();
        let mut units: Vec<Box<dyn ProcessingUnit>> = vec![Box::new(SecurityHeaderUnit::new())];
        for action in &self.config.settings.actions {
            match action {
                Action::Timestamp => units.push(Box::new(TimestampUnit::new(self.config.timestamp.ttl_secs))),
                Action::Signature => {
                    let signature = &self.config.signature;
                    let digest = registry.lookup_kind(&signature.digest_algorithm, AlgorithmKind::Digest)?;
                    units.push(Box::new(SignatureUnit::new(self.signature_parts.clone(), digest)));
                    units.push(Box::new(SignatureEndingUnit::new(
                        signature.token_id.clone(),
                        registry.lookup(&signature.signature_algorithm)?,
                        registry.lookup(&signature.canonicalization_algorithm)?,
                    )?));
                }
                Action::Encrypt => {
                    let encryption = &self.config.encryption;
                    units.push(Box::new(EncryptUnit::new(
                        self.encryption_parts.clone(),
                        registry.lookup(&encryption.algorithm)?,
                        encryption.token_id.clone(),
                        encryption.key_identifier,
                    )?));
                    units.push(Box::new(EncryptEndingUnit::new()));
                }
            }
        }
        chain_of(units)
    }

    /// Mirror of the outbound chain: actions in reverse order, then the
    /// element observer.
    fn inbound_chain(&self) -> Result<ProcessorChain, WssError> {
        let mut units: Vec<Box<dyn ProcessingUnit>> = Vec::new();
        for action in self.config.settings.actions.iter().rev() {
            match action {
                Action::Encrypt => units.push(Box::new(DecryptUnit::new())),
                Action::Signature => units.push(Box::new(SignatureVerifyUnit::new())),
                Action::Timestamp => units.push(Box::new(TimestampVerifyUnit::new(
                    self.config.timestamp.max_age_secs,
                    self.config.timestamp.future_skew_secs,
                ))),
            }
        }
        units.push(Box::new(ElementObserverUnit::new()));
        chain_of(units)
    }
}

/// Chain holding `units` in the given order.
fn chain_of(units: Vec<Box<dyn ProcessingUnit>>) -> Result<ProcessorChain, WssError> {
    let mut chain = ProcessorChain::new();
    let mut previous: Option<UnitId> = None;
    for unit in units {
        let id = unit.id();
        let placement = match previous {
            Some(previous) => Placement::new().after(previous),
            None => Placement::new(),
        };
        chain.insert(unit, placement)?;
        previous = Some(id);
    }
    Ok(chain)
}

/// SOAP fault answering `request`, in the request's SOAP version.
pub fn fault_response(request: &str, code: FaultCode, message: &str) -> String {
    let version = EventReader::new(request).ok().and_then(|mut reader| {
        reader.find_map(|event| match event {
            Ok(StreamEvent::ElementStart(start)) => Some(soap_version(&start)),
            Ok(_) => None,
            Err(_) => Some(None),
        })
    });
    let fault_version = version.flatten().map(|v| match v {
        SoapVersion::Soap11 => SoapFaultVersion::Soap11,
        SoapVersion::Soap12 => SoapFaultVersion::Soap12,
    });
    soap_fault_response(code, message, fault_version)
}
