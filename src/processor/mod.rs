//! Processing units of the outbound and inbound chains.
//!
//! Outbound: [`header::SecurityHeaderUnit`] creates the security header, the
//! wrapping units ([`timestamp::TimestampUnit`], [`signature::SignatureUnit`],
//! [`encrypt::EncryptUnit`]) recognize targets and install nested units, and
//! the ending units write their wrappers into the header at stream end.
//!
//! Inbound: [`decrypt::DecryptUnit`], [`signature_verify::SignatureVerifyUnit`]
//! and [`timestamp::TimestampVerifyUnit`] mirror the outbound actions;
//! [`observer::ElementObserverUnit`] reports every element it sees.

pub mod decrypt;
pub mod encrypt;
pub mod header;
pub mod observer;
pub mod signature;
pub mod signature_verify;
pub mod timestamp;

use crate::event::StreamEvent;
use crate::secure_part::DocumentTracker;

/// Events held back from the end of the `wsse:Security` header until
/// stream end, so ending units can append their wrapper into the header.
///
/// Everything after the header end is held in memory, which includes the
/// whole SOAP body; memory use grows with the body size.
#[derive(Debug, Default)]
pub(crate) struct HeaderTail {
    tracker: DocumentTracker,
    held: Option<Vec<StreamEvent>>,
}

impl HeaderTail {
    /// Returns the event if it passes through, `None` if it was held.
    pub(crate) fn offer(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        if let Some(held) = self.held.as_mut() {
            held.push(event);
            return None;
        }
        match &event {
            StreamEvent::ElementStart(start) => self.tracker.enter(start),
            StreamEvent::ElementEnd(_) => {
                if self.tracker.is_security_header() {
                    self.tracker.leave();
                    self.held = Some(vec![event]);
                    return None;
                }
                self.tracker.leave();
            }
            StreamEvent::Characters(_) => {}
        }
        Some(event)
    }

    /// Whether the security header end has been reached.
    pub(crate) fn is_holding(&self) -> bool {
        self.held.is_some()
    }

    pub(crate) fn release(&mut self) -> Vec<StreamEvent> {
        self.held.take().unwrap_or_default()
    }
}
