//! Streaming WS-Security engine for Zentinel
//!
//! Applies XML Signature and XML Encryption to SOAP messages in a single pass
//! over an XML event stream, and verifies inbound messages against a declared
//! security policy as the stream is consumed.
//!
//! # Features
//!
//! - Ordered processor chain with explicit before/after placement constraints
//! - XML Signature (HMAC-SHA256/512, Ed25519) with streaming exclusive c14n
//! - XML Encryption (AES-GCM) of elements, element content and SOAP headers
//! - STR-Transform references and `wsse:SecurityTokenReference` key lookup
//! - `wsu:Timestamp` creation and validation
//! - Security event bus with policy enforcement over normalized alternatives
//! - SOAP Fault responses carrying WS-Security fault codes
//! - XXE (XML External Entity) prevention
//!
//! # Example
//!
//! ```ignore
//! use zentinel_wss::{WssConfig, WssEngine};
//!
//! let config = WssConfig::from_yaml(&yaml)?;
//! let engine = WssEngine::from_config(config)?;
//! let secured = engine.secure(&request)?;
//! let verified = engine.verify(&secured.xml)?;
//! ```

pub mod algorithm;
pub mod c14n;
pub mod chain;
pub mod config;
pub mod context;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod event;
pub mod keyinfo;
pub mod ns;
pub mod policy;
pub mod processor;
pub mod secure_part;
pub mod security_event;
pub mod token;
pub mod xml;

pub use config::WssConfig;
pub use engine::{fault_response, EngineStats, SecuredMessage, VerifiedMessage, WssEngine};
pub use error::{FaultCode, PolicyViolation, WssError};
pub use policy::{PolicyNode, PolicyVerdict};
pub use security_event::{SecurityEvent, SecurityEventListener};
pub use token::{InMemoryTokenRegistry, SecurityToken, TokenRegistry};
