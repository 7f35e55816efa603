//! Reports every element of the inbound message as a required-element fact.

use crate::chain::{ProcessingUnit, UnitContext, UnitId};
use crate::error::WssError;
use crate::event::StreamEvent;
use crate::secure_part::DocumentTracker;
use crate::security_event::SecurityEvent;

/// Publishes a [`SecurityEvent::RequiredElement`] for each element start.
#[derive(Debug, Default)]
pub struct ElementObserverUnit {
    tracker: DocumentTracker,
}

impl ElementObserverUnit {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessingUnit for ElementObserverUnit {
    fn id(&self) -> UnitId {
        UnitId::ElementObserver
    }

    fn transform(&mut self, event: StreamEvent, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        match &event {
            StreamEvent::ElementStart(start) => {
                self.tracker.enter(start);
                ctx.message.publish(SecurityEvent::RequiredElement {
                    path: self.tracker.path().to_vec(),
                });
            }
            StreamEvent::ElementEnd(_) => self.tracker.leave(),
            StreamEvent::Characters(_) => {}
        }
        Ok(vec![event])
    }
}
