//! Policy enforcement as a security event listener.

use super::{AssertionState, PolicyNode};
use crate::error::{PolicyViolation, UnmetAlternative};
use crate::security_event::{ListenerError, SecurityEvent, SecurityEventListener};
use serde::Serialize;
use tracing::{debug, info};

/// Outcome of evaluating a policy at stream end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PolicyVerdict {
    /// Index of the first satisfied alternative
    Satisfied { alternative: usize },
    Violated(PolicyViolation),
}

impl PolicyVerdict {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied { .. })
    }

    /// Turn a violation into an error.
    pub fn into_result(self) -> Result<usize, PolicyViolation> {
        match self {
            Self::Satisfied { alternative } => Ok(alternative),
            Self::Violated(violation) => Err(violation),
        }
    }
}

/// Evaluates every normalized alternative independently against the events
/// of one message.
pub struct PolicyEnforcer {
    alternatives: Vec<Vec<Box<dyn AssertionState>>>,
    events: usize,
}

impl PolicyEnforcer {
    pub fn new(policy: &PolicyNode) -> Self {
        let alternatives: Vec<Vec<Box<dyn AssertionState>>> = policy
            .normalize()
            .iter()
            .map(|alternative| alternative.iter().map(|a| a.state()).collect())
            .collect();
        debug!(alternatives = alternatives.len(), "Policy normalized");
        Self { alternatives, events: 0 }
    }

    pub fn alternatives(&self) -> usize {
        self.alternatives.len()
    }

    /// Verdict over the events seen so far. Call once the stream is exhausted.
    pub fn verdict(&self) -> PolicyVerdict {
        let satisfied = self
            .alternatives
            .iter()
            .position(|states| states.iter().all(|s| s.is_asserted()));
        if let Some(alternative) = satisfied {
            info!(alternative, events = self.events, "Policy satisfied");
            return PolicyVerdict::Satisfied { alternative };
        }

        let unmet = self
            .alternatives
            .iter()
            .enumerate()
            .map(|(alternative, states)| UnmetAlternative {
                alternative,
                condition: states
                    .iter()
                    .find_map(|s| s.first_unmet())
                    .unwrap_or_else(|| "no alternative".to_string()),
            })
            .collect();
        let violation = PolicyViolation { unmet };
        info!(%violation, "Policy violated");
        PolicyVerdict::Violated(violation)
    }
}

impl SecurityEventListener for PolicyEnforcer {
    fn on_event(&mut self, event: &SecurityEvent) -> Result<(), ListenerError> {
        self.events += 1;
        for states in &mut self.alternatives {
            for state in states.iter_mut() {
                if state.interested_in(event) {
                    state.assert_event(event);
                }
            }
        }
        Ok(())
    }
}
