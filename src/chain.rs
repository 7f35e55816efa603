//! Ordered chain of processing units.
//!
//! Units live in an arena with stable slot indices; removal leaves a
//! tombstone so a dispatch in progress can keep walking the order safely.
//! A unit may insert new units or remove itself while it transforms; those
//! requests are applied as soon as its `transform` returns, before its output
//! travels further down the chain.

use crate::context::MessageContext;
use crate::error::WssError;
use crate::event::StreamEvent;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, trace};

/// Identity tag of a processing unit kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitId {
    SecurityHeader,
    Timestamp,
    Signature,
    SignatureDigest,
    SignatureEnding,
    Encrypt,
    EncryptionCipher,
    EncryptEnding,
    Decrypt,
    TimestampVerify,
    SignatureVerify,
    ReferenceDigest,
    ElementObserver,
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Ordering constraints fixed at insertion time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    /// Units this unit must precede
    pub before: HashSet<UnitId>,
    /// Units this unit must follow
    pub after: HashSet<UnitId>,
}

impl Placement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(mut self, id: UnitId) -> Self {
        self.before.insert(id);
        self
    }

    pub fn after(mut self, id: UnitId) -> Self {
        self.after.insert(id);
        self
    }
}

/// One transform stage.
pub trait ProcessingUnit {
    fn id(&self) -> UnitId;

    /// Replace `event` with zero or more events for the rest of the chain.
    fn transform(&mut self, event: StreamEvent, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError>;

    /// Called once at stream end, in chain order.
    fn finalize(&mut self, _ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        Ok(Vec::new())
    }
}

enum PendingPlacement {
    Explicit(Placement),
    AfterSelf,
}

/// Handle given to a unit while it runs.
pub struct UnitContext<'a> {
    pub message: &'a mut MessageContext,
    inserts: Vec<(Box<dyn ProcessingUnit>, PendingPlacement)>,
    remove_self: bool,
}

impl<'a> UnitContext<'a> {
    fn new(message: &'a mut MessageContext) -> Self {
        Self {
            message,
            inserts: Vec::new(),
            remove_self: false,
        }
    }

    /// Insert a unit with explicit constraints.
    pub fn insert(&mut self, unit: Box<dyn ProcessingUnit>, placement: Placement) {
        self.inserts.push((unit, PendingPlacement::Explicit(placement)));
    }

    /// Insert a unit directly downstream of the calling unit, so it receives
    /// the caller's output for the current event.
    pub fn insert_after_self(&mut self, unit: Box<dyn ProcessingUnit>) {
        self.inserts.push((unit, PendingPlacement::AfterSelf));
    }

    /// Remove the calling unit once its current output has been delivered.
    pub fn remove_self(&mut self) {
        self.remove_self = true;
    }
}

struct Slot {
    id: UnitId,
    placement: Placement,
    unit: Option<Box<dyn ProcessingUnit>>,
    removed: bool,
}

/// Arena-backed processor chain.
#[derive(Default)]
pub struct ProcessorChain {
    slots: Vec<Slot>,
    order: Vec<usize>,
}

impl ProcessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity tags of the live units, in chain order.
    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.order
            .iter()
            .filter(|&&slot| !self.slots[slot].removed)
            .map(|&slot| self.slots[slot].id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.unit_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Place `unit` at the latest position satisfying its own constraints and
    /// those of every live unit. The chain is left unchanged on conflict.
    pub fn insert(&mut self, unit: Box<dyn ProcessingUnit>, placement: Placement) -> Result<(), WssError> {
        let id = unit.id();
        let mut lo = 0;
        let mut hi = self.order.len();
        for (pos, &slot_idx) in self.order.iter().enumerate() {
            let slot = &self.slots[slot_idx];
            if slot.removed || slot.id == id {
                continue;
            }
            if placement.after.contains(&slot.id) || slot.placement.before.contains(&id) {
                lo = lo.max(pos + 1);
            }
            if placement.before.contains(&slot.id) || slot.placement.after.contains(&id) {
                hi = hi.min(pos);
            }
        }
        if lo > hi {
            return Err(WssError::OrderingConflict(format!(
                "cannot place {} (before {:?}, after {:?})",
                id, placement.before, placement.after
            )));
        }

        self.slots.push(Slot {
            id,
            placement,
            unit: Some(unit),
            removed: false,
        });
        self.order.insert(hi, self.slots.len() - 1);
        debug!(unit = %id, position = hi, "Inserted processing unit");
        Ok(())
    }

    /// Remove the first live unit with tag `id`.
    pub fn remove(&mut self, id: UnitId) -> bool {
        for &slot_idx in &self.order {
            let slot = &mut self.slots[slot_idx];
            if !slot.removed && slot.id == id {
                slot.removed = true;
                slot.unit = None;
                debug!(unit = %id, "Removed processing unit");
                return true;
            }
        }
        false
    }

    /// Send one source event through the whole chain.
    pub fn dispatch(&mut self, event: StreamEvent, message: &mut MessageContext) -> Result<Vec<StreamEvent>, WssError> {
        let mut output = Vec::new();
        self.deliver(0, event, message, &mut output)?;
        Ok(output)
    }

    /// Dispatch a whole event sequence, then finalize.
    pub fn process<I>(&mut self, events: I, message: &mut MessageContext) -> Result<Vec<StreamEvent>, WssError>
    where
        I: IntoIterator<Item = Result<StreamEvent, WssError>>,
    {
        let mut output = Vec::new();
        for event in events {
            self.deliver(0, event?, message, &mut output)?;
        }
        output.extend(self.finalize_all(message)?);
        Ok(output)
    }

    /// Finalize every live unit in chain order, including units inserted by
    /// earlier finalizers.
    pub fn finalize_all(&mut self, message: &mut MessageContext) -> Result<Vec<StreamEvent>, WssError> {
        let mut output = Vec::new();
        let mut pos = 0;
        while pos < self.order.len() {
            let slot_idx = self.order[pos];
            if self.slots[slot_idx].removed {
                pos += 1;
                continue;
            }
            let mut unit = self.take_unit(slot_idx)?;
            let mut ctx = UnitContext::new(message);
            let result = unit.finalize(&mut ctx);
            let (inserts, remove_self) = (std::mem::take(&mut ctx.inserts), ctx.remove_self);
            self.slots[slot_idx].unit = Some(unit);
            let events = result?;
            self.apply(slot_idx, inserts, remove_self)?;

            trace!(unit = %self.slots[slot_idx].id, emitted = events.len(), "Finalized processing unit");
            for event in events {
                let next = self.position_of(slot_idx) + 1;
                self.deliver(next, event, message, &mut output)?;
            }
            pos = self.position_of(slot_idx) + 1;
        }
        Ok(output)
    }

    fn deliver(
        &mut self,
        pos: usize,
        event: StreamEvent,
        message: &mut MessageContext,
        output: &mut Vec<StreamEvent>,
    ) -> Result<(), WssError> {
        let mut pos = pos;
        while pos < self.order.len() && self.slots[self.order[pos]].removed {
            pos += 1;
        }
        if pos >= self.order.len() {
            output.push(event);
            return Ok(());
        }

        let slot_idx = self.order[pos];
        let mut unit = self.take_unit(slot_idx)?;
        let mut ctx = UnitContext::new(message);
        let result = unit.transform(event, &mut ctx);
        let (inserts, remove_self) = (std::mem::take(&mut ctx.inserts), ctx.remove_self);
        self.slots[slot_idx].unit = Some(unit);
        let events = result?;
        self.apply(slot_idx, inserts, remove_self)?;

        for event in events {
            let next = self.position_of(slot_idx) + 1;
            self.deliver(next, event, message, output)?;
        }
        Ok(())
    }

    fn apply(
        &mut self,
        slot_idx: usize,
        inserts: Vec<(Box<dyn ProcessingUnit>, PendingPlacement)>,
        remove_self: bool,
    ) -> Result<(), WssError> {
        // New slots are appended, so truncating undoes a partial batch
        let slots_before = self.slots.len();
        for (unit, placement) in inserts {
            let placement = match placement {
                PendingPlacement::Explicit(p) => p,
                PendingPlacement::AfterSelf => self.after_slot(slot_idx, unit.id()),
            };
            if let Err(e) = self.insert(unit, placement) {
                self.order.retain(|&slot| slot < slots_before);
                self.slots.truncate(slots_before);
                return Err(e);
            }
        }
        if remove_self {
            let slot = &mut self.slots[slot_idx];
            slot.removed = true;
            slot.unit = None;
            debug!(unit = %slot.id, "Processing unit removed itself");
        }
        Ok(())
    }

    /// Constraints placing a unit of kind `id` immediately after `slot_idx`.
    fn after_slot(&self, slot_idx: usize, id: UnitId) -> Placement {
        let own = self.slots[slot_idx].id;
        let pos = self.position_of(slot_idx);
        let mut placement = Placement::new().after(own);
        for &later in &self.order[pos + 1..] {
            let slot = &self.slots[later];
            if !slot.removed && slot.id != id && slot.id != own {
                placement.before.insert(slot.id);
            }
        }
        placement
    }

    fn take_unit(&mut self, slot_idx: usize) -> Result<Box<dyn ProcessingUnit>, WssError> {
        self.slots[slot_idx].unit.take().ok_or_else(|| {
            WssError::OrderingConflict(format!(
                "unit {} received an event while already running",
                self.slots[slot_idx].id
            ))
        })
    }

    fn position_of(&self, slot_idx: usize) -> usize {
        self.order
            .iter()
            .position(|&s| s == slot_idx)
            .unwrap_or(self.order.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::QName;
    use crate::token::InMemoryTokenRegistry;
    use std::sync::Arc;

    fn message() -> MessageContext {
        MessageContext::new(Arc::new(InMemoryTokenRegistry::new()))
    }

    /// Appends its tag to every text event.
    struct Tagger {
        id: UnitId,
        tag: &'static str,
    }

    impl ProcessingUnit for Tagger {
        fn id(&self) -> UnitId {
            self.id
        }

        fn transform(&mut self, event: StreamEvent, _ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
            Ok(match event {
                StreamEvent::Characters(t) => vec![StreamEvent::text(format!("{}{}", t, self.tag))],
                other => vec![other],
            })
        }
    }

    /// Installs a tagger after itself on the first event, then removes itself.
    struct Installer;

    impl ProcessingUnit for Installer {
        fn id(&self) -> UnitId {
            UnitId::Signature
        }

        fn transform(&mut self, event: StreamEvent, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
            ctx.insert_after_self(Box::new(Tagger {
                id: UnitId::SignatureDigest,
                tag: "d",
            }));
            ctx.remove_self();
            Ok(vec![event])
        }
    }

    /// Queues two inserts on the first event; the second cannot be placed.
    struct ConflictingInstaller;

    impl ProcessingUnit for ConflictingInstaller {
        fn id(&self) -> UnitId {
            UnitId::Signature
        }

        fn transform(&mut self, event: StreamEvent, ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
            ctx.insert_after_self(Box::new(Tagger {
                id: UnitId::SignatureDigest,
                tag: "d",
            }));
            ctx.insert(
                Box::new(Tagger {
                    id: UnitId::EncryptionCipher,
                    tag: "c",
                }),
                Placement::new().after(UnitId::Encrypt).before(UnitId::Signature),
            );
            ctx.remove_self();
            Ok(vec![event])
        }
    }

    /// Emits one extra event at finalize.
    struct Finisher;

    impl ProcessingUnit for Finisher {
        fn id(&self) -> UnitId {
            UnitId::SignatureEnding
        }

        fn transform(&mut self, event: StreamEvent, _ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
            Ok(vec![event])
        }

        fn finalize(&mut self, _ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
            Ok(vec![StreamEvent::text("end")])
        }
    }

    fn tagger(id: UnitId, tag: &'static str) -> Box<dyn ProcessingUnit> {
        Box::new(Tagger { id, tag })
    }

    #[test]
    fn test_chain_order_and_dispatch() {
        let mut chain = ProcessorChain::new();
        chain.insert(tagger(UnitId::SecurityHeader, "a"), Placement::new()).unwrap();
        chain
            .insert(tagger(UnitId::Timestamp, "b"), Placement::new().after(UnitId::SecurityHeader))
            .unwrap();
        let out = chain.dispatch(StreamEvent::text("x"), &mut message()).unwrap();
        assert_eq!(out, vec![StreamEvent::text("xab")]);
    }

    #[test]
    fn test_before_constraint_places_earlier() {
        let mut chain = ProcessorChain::new();
        chain.insert(tagger(UnitId::SecurityHeader, "a"), Placement::new()).unwrap();
        chain.insert(tagger(UnitId::Timestamp, "b"), Placement::new()).unwrap();
        chain
            .insert(
                tagger(UnitId::Encrypt, "c"),
                Placement::new().after(UnitId::SecurityHeader).before(UnitId::Timestamp),
            )
            .unwrap();
        assert_eq!(
            chain.unit_ids(),
            vec![UnitId::SecurityHeader, UnitId::Encrypt, UnitId::Timestamp]
        );
    }

    #[test]
    fn test_existing_constraints_are_honored() {
        let mut chain = ProcessorChain::new();
        chain
            .insert(tagger(UnitId::SignatureEnding, "e"), Placement::new().after(UnitId::Signature))
            .unwrap();
        chain.insert(tagger(UnitId::Signature, "s"), Placement::new()).unwrap();
        assert_eq!(chain.unit_ids(), vec![UnitId::Signature, UnitId::SignatureEnding]);
    }

    #[test]
    fn test_conflict_leaves_chain_unchanged() {
        let mut chain = ProcessorChain::new();
        chain.insert(tagger(UnitId::SecurityHeader, "a"), Placement::new()).unwrap();
        chain.insert(tagger(UnitId::Timestamp, "b"), Placement::new()).unwrap();
        let before = chain.unit_ids();

        let result = chain.insert(
            tagger(UnitId::Encrypt, "c"),
            Placement::new().after(UnitId::Timestamp).before(UnitId::SecurityHeader),
        );
        assert!(matches!(result, Err(WssError::OrderingConflict(_))));
        assert_eq!(chain.unit_ids(), before);
    }

    #[test]
    fn test_conflicting_batch_leaves_chain_unchanged() {
        let mut chain = ProcessorChain::new();
        let mut msg = message();
        chain.insert(Box::new(ConflictingInstaller), Placement::new()).unwrap();
        chain.insert(tagger(UnitId::Encrypt, "e"), Placement::new()).unwrap();
        let before = chain.unit_ids();

        let result = chain.dispatch(StreamEvent::text("x"), &mut msg);
        assert!(matches!(result, Err(WssError::OrderingConflict(_))));
        // Neither the first insert nor the self-removal took effect
        assert_eq!(chain.unit_ids(), before);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_reentrant_insert_and_self_removal() {
        let mut chain = ProcessorChain::new();
        let mut msg = message();
        chain.insert(Box::new(Installer), Placement::new()).unwrap();
        chain.insert(tagger(UnitId::Encrypt, "e"), Placement::new()).unwrap();

        let out = chain.dispatch(StreamEvent::text("x"), &mut msg).unwrap();
        // The installed unit sits between the installer and the encrypt unit
        assert_eq!(out, vec![StreamEvent::text("xde")]);
        assert_eq!(chain.unit_ids(), vec![UnitId::SignatureDigest, UnitId::Encrypt]);

        let out = chain.dispatch(StreamEvent::text("y"), &mut msg).unwrap();
        assert_eq!(out, vec![StreamEvent::text("yde")]);
    }

    #[test]
    fn test_remove() {
        let mut chain = ProcessorChain::new();
        chain.insert(tagger(UnitId::SecurityHeader, "a"), Placement::new()).unwrap();
        assert!(chain.remove(UnitId::SecurityHeader));
        assert!(!chain.remove(UnitId::SecurityHeader));
        assert!(chain.is_empty());
        let out = chain.dispatch(StreamEvent::text("x"), &mut message()).unwrap();
        assert_eq!(out, vec![StreamEvent::text("x")]);
    }

    #[test]
    fn test_finalize_output_flows_downstream() {
        let mut chain = ProcessorChain::new();
        let mut msg = message();
        chain.insert(Box::new(Finisher), Placement::new()).unwrap();
        chain.insert(tagger(UnitId::EncryptEnding, "z"), Placement::new()).unwrap();
        let events = vec![Ok(StreamEvent::start(QName::new("", "a"))), Ok(StreamEvent::end(QName::new("", "a")))];
        let out = chain.process(events, &mut msg).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[2], StreamEvent::text("endz"));
    }
}
