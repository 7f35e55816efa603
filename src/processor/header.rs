//! Creates the `wsse:Security` header on outbound messages.

use crate::chain::{ProcessingUnit, UnitContext, UnitId};
use crate::error::WssError;
use crate::event::{ElementStart, QName, StreamEvent};
use crate::ns::{self, attr, node};
use crate::secure_part::{is_soap_element, DocumentTracker};
use tracing::debug;

/// Inserts an empty `wsse:Security` element as the first child of the SOAP
/// header, creating the header before the body when the message has none.
#[derive(Debug, Default)]
pub struct SecurityHeaderUnit {
    tracker: DocumentTracker,
    envelope: Option<QName>,
    created: bool,
}

impl SecurityHeaderUnit {
    pub fn new() -> Self {
        Self::default()
    }

    fn security_events(&self) -> Vec<StreamEvent> {
        let start = match &self.envelope {
            Some(envelope) => ElementStart::new(ns::wsse(node::SECURITY)).with_attribute(
                soap_name(envelope, attr::MUST_UNDERSTAND),
                "1",
            ),
            None => ElementStart::new(ns::wsse(node::SECURITY)),
        };
        vec![
            StreamEvent::ElementStart(start),
            StreamEvent::end(ns::wsse(node::SECURITY)),
        ]
    }
}

fn soap_name(envelope: &QName, local: &str) -> QName {
    QName {
        namespace: envelope.namespace.clone(),
        local: local.to_string(),
        prefix: envelope.prefix.clone(),
    }
}

impl ProcessingUnit for SecurityHeaderUnit {
    fn id(&self) -> UnitId {
        UnitId::SecurityHeader
    }

    fn transform(&mut self, event: StreamEvent, _ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        let start = match &event {
            StreamEvent::ElementStart(start) => start,
            StreamEvent::ElementEnd(_) => {
                self.tracker.leave();
                return Ok(vec![event]);
            }
            StreamEvent::Characters(_) => return Ok(vec![event]),
        };
        self.tracker.enter(start);

        if self.tracker.is_security_header() {
            return Err(WssError::Structural(
                "message already carries a wsse:Security header".to_string(),
            ));
        }
        if self.tracker.depth() == 1 {
            if !is_soap_element(&start.name, node::ENVELOPE) {
                return Err(WssError::Structural(format!(
                    "root element {} is not a SOAP envelope",
                    start.name
                )));
            }
            self.envelope = Some(start.name.clone());
        }
        if self.created || self.tracker.depth() != 2 {
            return Ok(vec![event]);
        }

        if is_soap_element(&start.name, node::HEADER) {
            self.created = true;
            debug!("Adding wsse:Security to existing SOAP header");
            let mut out = vec![event];
            out.extend(self.security_events());
            return Ok(out);
        }
        if is_soap_element(&start.name, node::BODY) {
            self.created = true;
            debug!("Creating SOAP header for wsse:Security");
            let header = match &self.envelope {
                Some(envelope) => soap_name(envelope, node::HEADER),
                None => QName::new(start.name.namespace.clone(), node::HEADER),
            };
            let mut out = vec![StreamEvent::start(header.clone())];
            out.extend(self.security_events());
            out.push(StreamEvent::end(header));
            out.push(event);
            return Ok(out);
        }
        Ok(vec![event])
    }

    fn finalize(&mut self, _ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        if !self.created {
            return Err(WssError::Structural(
                "message has neither a SOAP header nor a body".to_string(),
            ));
        }
        Ok(Vec::new())
    }
}
