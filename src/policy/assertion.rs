//! Per-assertion accumulators fed by security events.

use super::ElementPath;
use crate::event::QName;
use crate::security_event::SecurityEvent;
use crate::token::{KeyUsage, TokenType};

/// Leaf assertion of a normalized policy alternative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assertion {
    RequiredElements(Vec<ElementPath>),
    SignedElements(Vec<ElementPath>),
    EncryptedElements(Vec<ElementPath>),
    IncludeTimestamp,
    ProtectionToken(TokenType),
}

impl Assertion {
    /// Fresh, unsatisfied state for this assertion.
    pub fn state(&self) -> Box<dyn AssertionState> {
        match self {
            Self::RequiredElements(paths) => Box::new(PathState::new(PathKind::Required, paths)),
            Self::SignedElements(paths) => Box::new(PathState::new(PathKind::Signed, paths)),
            Self::EncryptedElements(paths) => Box::new(PathState::new(PathKind::Encrypted, paths)),
            Self::IncludeTimestamp => Box::new(TimestampState::default()),
            Self::ProtectionToken(token_type) => Box::new(ProtectionTokenState {
                token_type: *token_type,
                seen: false,
            }),
        }
    }
}

/// Tracks whether one assertion's conditions have been observed.
///
/// Conditions only ever move from unmet to met.
pub trait AssertionState {
    /// Whether `event` can affect this state.
    fn interested_in(&self, event: &SecurityEvent) -> bool;

    /// Record `event`. A non-matching event is never a violation by itself,
    /// so this always returns `true`; the verdict is taken at stream end.
    fn assert_event(&mut self, event: &SecurityEvent) -> bool;

    fn is_asserted(&self) -> bool;

    /// Description of the first unmet condition, in declaration order.
    fn first_unmet(&self) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathKind {
    Required,
    Signed,
    Encrypted,
}

impl PathKind {
    fn observed_path<'a>(&self, event: &'a SecurityEvent) -> Option<&'a [QName]> {
        match (self, event) {
            (Self::Required, SecurityEvent::RequiredElement { path }) => Some(path),
            (Self::Signed, SecurityEvent::SignedElement { path, .. }) => Some(path),
            (Self::Encrypted, SecurityEvent::EncryptedElement { path, .. }) => Some(path),
            _ => None,
        }
    }

    fn unmet(&self) -> &'static str {
        match self {
            Self::Required => "missing",
            Self::Signed => "not signed",
            Self::Encrypted => "not encrypted",
        }
    }
}

/// Map from expected element path to whether it has been observed.
#[derive(Debug)]
struct PathState {
    kind: PathKind,
    marks: Vec<(ElementPath, bool)>,
}

impl PathState {
    fn new(kind: PathKind, paths: &[ElementPath]) -> Self {
        Self {
            kind,
            marks: paths.iter().map(|p| (p.clone(), false)).collect(),
        }
    }
}

impl AssertionState for PathState {
    fn interested_in(&self, event: &SecurityEvent) -> bool {
        self.kind.observed_path(event).is_some()
    }

    fn assert_event(&mut self, event: &SecurityEvent) -> bool {
        if let Some(observed) = self.kind.observed_path(event) {
            // Keep going after a hit: the same event may satisfy several
            // expected paths
            for (expected, seen) in self.marks.iter_mut() {
                if expected.matches(observed) {
                    *seen = true;
                }
            }
        }
        true
    }

    fn is_asserted(&self) -> bool {
        self.marks.iter().all(|(_, seen)| *seen)
    }

    fn first_unmet(&self) -> Option<String> {
        self.marks
            .iter()
            .find(|(_, seen)| !seen)
            .map(|(path, _)| format!("{} {}", path, self.kind.unmet()))
    }
}

#[derive(Debug, Default)]
struct TimestampState {
    seen: bool,
}

impl AssertionState for TimestampState {
    fn interested_in(&self, event: &SecurityEvent) -> bool {
        matches!(event, SecurityEvent::Timestamp { .. })
    }

    fn assert_event(&mut self, event: &SecurityEvent) -> bool {
        if self.interested_in(event) {
            self.seen = true;
        }
        true
    }

    fn is_asserted(&self) -> bool {
        self.seen
    }

    fn first_unmet(&self) -> Option<String> {
        (!self.seen).then(|| "timestamp missing".to_string())
    }
}

#[derive(Debug)]
struct ProtectionTokenState {
    token_type: TokenType,
    seen: bool,
}

impl AssertionState for ProtectionTokenState {
    fn interested_in(&self, event: &SecurityEvent) -> bool {
        matches!(
            event,
            SecurityEvent::TokenUsed {
                usage: KeyUsage::Signature | KeyUsage::SignatureVerification,
                ..
            }
        )
    }

    fn assert_event(&mut self, event: &SecurityEvent) -> bool {
        if let SecurityEvent::TokenUsed {
            root_token_type,
            usage: KeyUsage::Signature | KeyUsage::SignatureVerification,
            ..
        } = event
        {
            if *root_token_type == self.token_type {
                self.seen = true;
            }
        }
        true
    }

    fn is_asserted(&self) -> bool {
        self.seen
    }

    fn first_unmet(&self) -> Option<String> {
        (!self.seen).then(|| format!("protection token of type {} not used", self.token_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn path(local: &str) -> Vec<QName> {
        vec![QName::new("urn:x", "Root"), QName::new("urn:x", local)]
    }

    fn expected(local: &str) -> ElementPath {
        ElementPath::new(path(local))
    }

    #[test]
    fn test_required_elements_all_must_be_seen() {
        let mut state = Assertion::RequiredElements(vec![expected("A"), expected("B")]).state();
        assert!(!state.is_asserted());
        assert!(state.assert_event(&SecurityEvent::RequiredElement { path: path("B") }));
        assert!(!state.is_asserted());
        assert_eq!(state.first_unmet().unwrap(), "/{urn:x}Root/{urn:x}A missing");
        state.assert_event(&SecurityEvent::RequiredElement { path: path("A") });
        assert!(state.is_asserted());
        assert!(state.first_unmet().is_none());
    }

    #[test]
    fn test_signed_elements_ignore_other_kinds() {
        let mut state = Assertion::SignedElements(vec![expected("A")]).state();
        let seen = SecurityEvent::RequiredElement { path: path("A") };
        assert!(!state.interested_in(&seen));
        state.assert_event(&seen);
        assert!(!state.is_asserted());
        assert_eq!(state.first_unmet().unwrap(), "/{urn:x}Root/{urn:x}A not signed");

        state.assert_event(&SecurityEvent::SignedElement {
            path: path("A"),
            reference_id: "id-1".to_string(),
            digest_algorithm: crate::algorithm::SHA256.to_string(),
        });
        assert!(state.is_asserted());
    }

    #[test]
    fn test_protection_token_uses_root_type() {
        let mut state = Assertion::ProtectionToken(TokenType::Ed25519).state();
        let used = |root_token_type, usage| SecurityEvent::TokenUsed {
            token_id: "t".to_string(),
            token_type: TokenType::Symmetric,
            root_token_type,
            usage,
        };
        state.assert_event(&used(TokenType::Ed25519, KeyUsage::Encryption));
        assert!(!state.is_asserted());
        state.assert_event(&used(TokenType::Symmetric, KeyUsage::SignatureVerification));
        assert!(!state.is_asserted());
        state.assert_event(&used(TokenType::Ed25519, KeyUsage::SignatureVerification));
        assert!(state.is_asserted());
    }

    #[test]
    fn test_timestamp() {
        let mut state = Assertion::IncludeTimestamp.state();
        assert_eq!(state.first_unmet().unwrap(), "timestamp missing");
        state.assert_event(&SecurityEvent::Timestamp {
            created: chrono::Utc::now(),
            expires: None,
        });
        assert!(state.is_asserted());
    }

    proptest! {
        #[test]
        fn prop_required_elements_monotonic(
            expected_names in proptest::collection::vec("[A-D]", 1..4),
            observed in proptest::collection::vec("[A-F]", 0..30),
        ) {
            let paths = expected_names.iter().map(|n| expected(n)).collect();
            let mut state = Assertion::RequiredElements(paths).state();
            let mut asserted = false;
            for name in &observed {
                let event = SecurityEvent::RequiredElement { path: path(name) };
                prop_assert!(state.assert_event(&event));
                if asserted {
                    prop_assert!(state.is_asserted());
                }
                asserted = state.is_asserted();
            }
            let all_seen = expected_names.iter().all(|n| observed.contains(n));
            prop_assert_eq!(state.is_asserted(), all_seen);
        }
    }
}
