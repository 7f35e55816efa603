//! Protection targets and the runtime records created when they match.

use crate::event::{ElementStart, QName, StreamEvent};
use crate::ns::{self, node};
use serde::{Deserialize, Serialize};

/// How a target is recognized in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartSelector {
    /// Element with this qualified name
    Element(QName),
    /// Element carrying this identifier value
    Id(String),
    /// Token element `token_id`, referenced through the security token
    /// reference `reference_id` with the STR transform
    TokenReference { token_id: String, reference_id: String },
}

/// Whether the element itself or only its content is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    #[default]
    Element,
    Content,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurePart {
    pub selector: PartSelector,
    pub modifier: Modifier,
}

impl SecurePart {
    pub fn element(name: QName, modifier: Modifier) -> Self {
        Self {
            selector: PartSelector::Element(name),
            modifier,
        }
    }

    pub fn id(id: impl Into<String>, modifier: Modifier) -> Self {
        Self {
            selector: PartSelector::Id(id.into()),
            modifier,
        }
    }

    pub fn token_reference(token_id: impl Into<String>, reference_id: impl Into<String>) -> Self {
        Self {
            selector: PartSelector::TokenReference {
                token_id: token_id.into(),
                reference_id: reference_id.into(),
            },
            modifier: Modifier::Element,
        }
    }

    fn matches_id(&self, value: &str) -> bool {
        match &self.selector {
            PartSelector::Id(id) => id == value,
            PartSelector::TokenReference { token_id, .. } => token_id == value,
            PartSelector::Element(_) => false,
        }
    }
}

/// Find the secure part an element start matches.
///
/// Qualified name first; then, only when the element has attributes, each
/// identifier attribute in priority order until one names a part.
pub fn find_match<'a>(parts: &'a [SecurePart], start: &ElementStart) -> Option<&'a SecurePart> {
    let by_name = parts
        .iter()
        .find(|p| matches!(&p.selector, PartSelector::Element(name) if *name == start.name));
    if by_name.is_some() {
        return by_name;
    }
    if start.attributes.is_empty() {
        return None;
    }
    for id_attr in ns::id_attributes() {
        if let Some(value) = start.attribute(&id_attr) {
            if let Some(part) = parts.iter().find(|p| p.matches_id(value)) {
                return Some(part);
            }
        }
    }
    None
}

/// First identifier attribute value present on an element, in priority order.
pub fn element_id(start: &ElementStart) -> Option<&str> {
    ns::id_attributes()
        .iter()
        .find_map(|name| start.attribute(name))
}

/// Runtime record of one matched signature part.
#[derive(Debug, Clone)]
pub struct SignaturePartDef {
    /// Fragment identifier echoed into the Reference URI
    pub reference_id: String,
    /// Path of the protected element
    pub path: Vec<QName>,
    /// Transform algorithm URIs in application order
    pub transforms: Vec<String>,
    /// Token element reached through the STR transform, if any
    pub token_reference: Option<String>,
    pub digest_algorithm: String,
    /// Set once the protected subtree has been fully digested
    pub digest_value: Option<Vec<u8>>,
}

/// Runtime record of one matched encryption part.
#[derive(Debug, Clone)]
pub struct EncryptionPartDef {
    /// Id of the emitted `xenc:EncryptedData`
    pub reference_id: String,
    /// Id of the encrypting token
    pub key_id: String,
    pub modifier: Modifier,
    pub path: Vec<QName>,
}

/// Tracks the element path one unit has observed.
#[derive(Debug, Default, Clone)]
pub struct DocumentTracker {
    path: Vec<QName>,
}

impl DocumentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker positioned inside the elements of `path`.
    pub fn with_path(path: Vec<QName>) -> Self {
        Self { path }
    }

    /// Update the path. Starts are pushed before, ends popped after, the
    /// caller inspects the tracker.
    pub fn enter(&mut self, start: &ElementStart) {
        self.path.push(start.name.clone());
    }

    pub fn leave(&mut self) {
        self.path.pop();
    }

    pub fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::ElementStart(start) => self.enter(start),
            StreamEvent::ElementEnd(_) => self.leave(),
            StreamEvent::Characters(_) => {}
        }
    }

    /// Nesting depth; the envelope is depth 1.
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    pub fn path(&self) -> &[QName] {
        &self.path
    }

    /// Whether the current element is a direct child of the SOAP header.
    pub fn is_header_child(&self) -> bool {
        self.depth() == 3 && is_soap_element(&self.path[1], node::HEADER)
    }

    /// Whether the current element is the SOAP body.
    pub fn is_body(&self) -> bool {
        self.depth() == 2 && is_soap_element(&self.path[1], node::BODY)
    }

    /// Whether the current element is the WS-Security header.
    pub fn is_security_header(&self) -> bool {
        self.is_header_child()
            && self
                .path
                .last()
                .map(|q| q.is(ns::WSSE_NS, node::SECURITY))
                .unwrap_or(false)
    }

    /// Whether the current position is inside the WS-Security header.
    pub fn in_security_header(&self) -> bool {
        self.depth() >= 3
            && is_soap_element(&self.path[1], node::HEADER)
            && self.path[2].is(ns::WSSE_NS, node::SECURITY)
    }
}

/// Whether `name` is `local` in either SOAP envelope namespace.
pub fn is_soap_element(name: &QName, local: &str) -> bool {
    ns::is_soap_ns(&name.namespace) && name.local == local
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(ns: &str, local: &str) -> ElementStart {
        ElementStart::new(QName::new(ns, local))
    }

    #[test]
    fn test_name_match_wins() {
        let parts = vec![
            SecurePart::id("b-1", Modifier::Element),
            SecurePart::element(QName::new("urn:x", "Item"), Modifier::Content),
        ];
        let el = start("urn:x", "Item").with_attribute(ns::wsu("Id"), "b-1");
        assert_eq!(find_match(&parts, &el).unwrap().modifier, Modifier::Content);
    }

    #[test]
    fn test_id_attribute_priority() {
        let parts = vec![
            SecurePart::id("plain", Modifier::Element),
            SecurePart::id("assertion", Modifier::Content),
        ];
        let el = start("urn:x", "Other")
            .with_attribute(ns::unqualified("AssertionID"), "assertion")
            .with_attribute(ns::unqualified("Id"), "plain");
        assert_eq!(find_match(&parts, &el).unwrap().modifier, Modifier::Element);

        // A higher-priority attribute naming no part does not stop the search
        let el = start("urn:x", "Other")
            .with_attribute(ns::wsu("Id"), "unknown")
            .with_attribute(ns::unqualified("AssertionID"), "assertion");
        assert_eq!(find_match(&parts, &el).unwrap().modifier, Modifier::Content);
    }

    #[test]
    fn test_no_attributes_no_id_match() {
        let parts = vec![SecurePart::id("x", Modifier::Element)];
        assert!(find_match(&parts, &start("urn:x", "Item")).is_none());
    }

    #[test]
    fn test_token_reference_matches_token_id() {
        let parts = vec![SecurePart::token_reference("tok-1", "str-1")];
        let el = start(ns::WSSE_NS, "BinarySecurityToken").with_attribute(ns::wsu("Id"), "tok-1");
        assert!(find_match(&parts, &el).is_some());
    }

    #[test]
    fn test_tracker_positions() {
        let mut tracker = DocumentTracker::new();
        tracker.enter(&start(ns::SOAP_11_NS, "Envelope"));
        tracker.enter(&start(ns::SOAP_11_NS, "Header"));
        tracker.enter(&start(ns::WSSE_NS, "Security"));
        assert!(tracker.is_header_child());
        assert!(tracker.is_security_header());
        tracker.enter(&start(ns::WSU_NS, "Timestamp"));
        assert!(tracker.in_security_header());
        tracker.leave();
        tracker.leave();
        tracker.leave();
        tracker.enter(&start(ns::SOAP_11_NS, "Body"));
        assert!(tracker.is_body());
        assert_eq!(tracker.depth(), 2);
    }
}
