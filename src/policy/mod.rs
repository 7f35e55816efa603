//! Security policy evaluation.
//!
//! A policy is a tree of `All`/`ExactlyOne` operators over assertions. It is
//! normalized into alternatives, each a flat list of assertions; an
//! alternative holds when every assertion state it owns is asserted once the
//! message has been fully processed.

pub mod assertion;
pub mod enforcer;

pub use assertion::{Assertion, AssertionState};
pub use enforcer::{PolicyEnforcer, PolicyVerdict};

use crate::error::WssError;
use crate::event::{path_to_string, QName};
use crate::ns;
use crate::token::TokenType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Absolute element path, written `/{ns}Envelope/{ns}Body/{ns}Order`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ElementPath(Vec<QName>);

impl ElementPath {
    pub fn new(path: Vec<QName>) -> Self {
        Self(path)
    }

    pub fn parse(s: &str) -> Result<Self, WssError> {
        let s = s.trim();
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| WssError::Config(format!("element path '{}' must start with '/'", s)))?;

        // Split on '/' outside of `{namespace}` braces
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut in_braces = false;
        for c in rest.chars() {
            match c {
                '{' => in_braces = true,
                '}' => in_braces = false,
                '/' if !in_braces => {
                    segments.push(std::mem::take(&mut current));
                    continue;
                }
                _ => {}
            }
            current.push(c);
        }
        segments.push(current);

        let names = segments
            .iter()
            .map(|segment| QName::parse_clark(segment))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(names))
    }

    pub fn names(&self) -> &[QName] {
        &self.0
    }

    /// Structural match against an observed path. Elements in either SOAP
    /// envelope namespace match each other.
    pub fn matches(&self, observed: &[QName]) -> bool {
        self.0.len() == observed.len()
            && self.0.iter().zip(observed).all(|(expected, seen)| {
                expected == seen
                    || (expected.local == seen.local
                        && ns::is_soap_ns(&expected.namespace)
                        && ns::is_soap_ns(&seen.namespace))
            })
    }
}

impl fmt::Display for ElementPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&path_to_string(&self.0))
    }
}

impl TryFrom<String> for ElementPath {
    type Error = WssError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ElementPath> for String {
    fn from(path: ElementPath) -> Self {
        path.to_string()
    }
}

/// Policy tree as supplied by configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyNode {
    /// Every child must hold
    All { of: Vec<PolicyNode> },
    /// One child must hold
    ExactlyOne { of: Vec<PolicyNode> },
    RequiredElements { paths: Vec<ElementPath> },
    SignedElements { paths: Vec<ElementPath> },
    EncryptedElements { paths: Vec<ElementPath> },
    IncludeTimestamp,
    /// The signature key must descend from a token of this type
    ProtectionToken { token_type: TokenType },
}

impl PolicyNode {
    /// Expand into independent alternatives.
    ///
    /// `All` yields the cartesian product of its children's alternatives,
    /// `ExactlyOne` their concatenation. An empty `All` is the single empty
    /// alternative (always satisfied); an empty `ExactlyOne` has none.
    pub fn normalize(&self) -> Vec<Vec<Assertion>> {
        match self {
            Self::All { of } => of.iter().fold(vec![Vec::new()], |acc, child| {
                let child_alternatives = child.normalize();
                let mut product = Vec::with_capacity(acc.len() * child_alternatives.len());
                for left in &acc {
                    for right in &child_alternatives {
                        let mut combined = left.clone();
                        combined.extend(right.iter().cloned());
                        product.push(combined);
                    }
                }
                product
            }),
            Self::ExactlyOne { of } => of.iter().flat_map(|child| child.normalize()).collect(),
            Self::RequiredElements { paths } => vec![vec![Assertion::RequiredElements(paths.clone())]],
            Self::SignedElements { paths } => vec![vec![Assertion::SignedElements(paths.clone())]],
            Self::EncryptedElements { paths } => vec![vec![Assertion::EncryptedElements(paths.clone())]],
            Self::IncludeTimestamp => vec![vec![Assertion::IncludeTimestamp]],
            Self::ProtectionToken { token_type } => vec![vec![Assertion::ProtectionToken(*token_type)]],
        }
    }
}
