//! Security events and the per-message event bus.

use crate::event::QName;
use crate::token::{KeyUsage, TokenType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, warn};

/// Observation of a protection or structural fact made during processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecurityEvent {
    /// An element was seen at `path`
    RequiredElement { path: Vec<QName> },
    /// An element was covered by a signature reference
    SignedElement {
        path: Vec<QName>,
        reference_id: String,
        digest_algorithm: String,
    },
    /// An element (or its content) was encrypted or decrypted
    EncryptedElement {
        path: Vec<QName>,
        reference_id: String,
        algorithm: String,
        content_only: bool,
        token_id: String,
    },
    /// A signature value was computed or verified
    SignatureValue {
        algorithm: String,
        value: String,
        token_id: String,
    },
    /// An inbound reference digest matched
    ReferenceMatched { reference_id: String },
    /// A timestamp was emitted or accepted
    Timestamp {
        created: DateTime<Utc>,
        expires: Option<DateTime<Utc>>,
    },
    /// A token was used for a cryptographic operation
    TokenUsed {
        token_id: String,
        token_type: TokenType,
        /// Type of the token at the root of the key-wrapping chain
        root_token_type: TokenType,
        usage: KeyUsage,
    },
}

impl SecurityEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequiredElement { .. } => "required_element",
            Self::SignedElement { .. } => "signed_element",
            Self::EncryptedElement { .. } => "encrypted_element",
            Self::SignatureValue { .. } => "signature_value",
            Self::ReferenceMatched { .. } => "reference_matched",
            Self::Timestamp { .. } => "timestamp",
            Self::TokenUsed { .. } => "token_used",
        }
    }
}

/// Failure reported by a listener. Logged, never propagated.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct ListenerError(pub String);

pub trait SecurityEventListener {
    fn on_event(&mut self, event: &SecurityEvent) -> Result<(), ListenerError>;
}

/// Handle returned by [`SecurityEventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(usize);

/// Synchronous fan-out of security events to listeners, scoped to one message.
#[derive(Default)]
pub struct SecurityEventBus {
    listeners: Vec<(ListenerId, Rc<RefCell<dyn SecurityEventListener>>)>,
    next_id: usize,
    published: usize,
}

impl SecurityEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Rc<RefCell<dyn SecurityEventListener>>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Deliver `event` to every listener in subscription order.
    pub fn publish(&mut self, event: SecurityEvent) {
        self.published += 1;
        debug!(kind = event.kind(), listeners = self.listeners.len(), "Publishing security event");
        for (id, listener) in &self.listeners {
            let result = match listener.try_borrow_mut() {
                Ok(mut l) => l.on_event(&event),
                Err(_) => Err(ListenerError("listener is already borrowed".to_string())),
            };
            if let Err(e) = result {
                warn!(listener = id.0, kind = event.kind(), error = %e, "Security event listener failed");
            }
        }
    }

    /// Number of events published so far.
    pub fn published(&self) -> usize {
        self.published
    }
}

/// Listener that records every event it receives.
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Vec<SecurityEvent>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[SecurityEvent] {
        &self.events
    }

    pub fn take(&mut self) -> Vec<SecurityEvent> {
        std::mem::take(&mut self.events)
    }
}

impl SecurityEventListener for EventCollector {
    fn on_event(&mut self, event: &SecurityEvent) -> Result<(), ListenerError> {
        self.events.push(event.clone());
        Ok(())
    }
}
