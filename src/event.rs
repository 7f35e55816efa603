//! Typed XML stream events.

use crate::error::WssError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Namespace-qualified name.
///
/// Equality and hashing consider only the namespace URI and the local name;
/// the prefix is carried for serialization.
#[derive(Debug, Clone, Eq)]
pub struct QName {
    /// Namespace URI, empty for no namespace
    pub namespace: String,
    /// Local name
    pub local: String,
    /// Preferred prefix
    pub prefix: Option<String>,
}

impl QName {
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local: local.into(),
            prefix: None,
        }
    }

    pub fn prefixed(namespace: impl Into<String>, local: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local: local.into(),
            prefix: Some(prefix.into()),
        }
    }

    /// Parse Clark notation: `{namespace}local` or a bare `local`.
    pub fn parse_clark(s: &str) -> Result<Self, WssError> {
        match s.strip_prefix('{') {
            Some(rest) => {
                let (ns, local) = rest
                    .split_once('}')
                    .ok_or_else(|| WssError::Config(format!("unterminated namespace in '{}'", s)))?;
                if local.is_empty() {
                    return Err(WssError::Config(format!("missing local name in '{}'", s)));
                }
                Ok(Self::new(ns, local))
            }
            None if s.is_empty() => Err(WssError::Config("empty qualified name".to_string())),
            None => Ok(Self::new("", s)),
        }
    }

    /// Name as written in a document: `prefix:local` or `local`.
    pub fn qualified(&self) -> String {
        match self.prefix.as_deref() {
            Some(p) if !p.is_empty() => format!("{}:{}", p, self.local),
            _ => self.local.clone(),
        }
    }

    /// Whether this name has the given namespace and local name.
    pub fn is(&self, namespace: &str, local: &str) -> bool {
        self.namespace == namespace && self.local == local
    }
}

impl PartialEq for QName {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.local == other.local
    }
}

impl Hash for QName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.local.hash(state);
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.local)
        } else {
            write!(f, "{{{}}}{}", self.namespace, self.local)
        }
    }
}

impl Serialize for QName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for QName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        QName::parse_clark(&s).map_err(serde::de::Error::custom)
    }
}

/// Render an element path as `/{ns}a/{ns}b`.
pub fn path_to_string(path: &[QName]) -> String {
    path.iter().map(|q| format!("/{}", q)).collect()
}

/// Attribute of an element start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: QName,
    pub value: String,
}

impl Attribute {
    pub fn new(name: QName, value: impl Into<String>) -> Self {
        Self { name, value: value.into() }
    }
}

/// Namespace declaration carried on an element start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceDecl {
    /// `None` for the default namespace
    pub prefix: Option<String>,
    pub uri: String,
}

/// Start of an element with its ordered attributes and declared namespaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementStart {
    pub name: QName,
    pub attributes: Vec<Attribute>,
    pub namespaces: Vec<NamespaceDecl>,
}

impl ElementStart {
    pub fn new(name: QName) -> Self {
        Self {
            name,
            attributes: Vec::new(),
            namespaces: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: QName, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute::new(name, value));
        self
    }

    pub fn attribute(&self, name: &QName) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| &a.name == name)
            .map(|a| a.value.as_str())
    }
}

/// One XML stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    ElementStart(ElementStart),
    ElementEnd(QName),
    Characters(String),
}

impl StreamEvent {
    pub fn start(name: QName) -> Self {
        Self::ElementStart(ElementStart::new(name))
    }

    pub fn end(name: QName) -> Self {
        Self::ElementEnd(name)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Characters(text.into())
    }

    pub fn as_start(&self) -> Option<&ElementStart> {
        match self {
            Self::ElementStart(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this is the start of an element named `namespace`/`local`.
    pub fn is_start_of(&self, namespace: &str, local: &str) -> bool {
        matches!(self, Self::ElementStart(s) if s.name.is(namespace, local))
    }

    /// Whether this is the end of an element named `namespace`/`local`.
    pub fn is_end_of(&self, namespace: &str, local: &str) -> bool {
        matches!(self, Self::ElementEnd(n) if n.is(namespace, local))
    }
}

/// Start, text and end events of a leaf element.
pub fn text_element(name: QName, text: impl Into<String>) -> [StreamEvent; 3] {
    [
        StreamEvent::start(name.clone()),
        StreamEvent::text(text),
        StreamEvent::end(name),
    ]
}

/// Start and end events of an empty element with attributes.
pub fn empty_element(start: ElementStart) -> [StreamEvent; 2] {
    let name = start.name.clone();
    [StreamEvent::ElementStart(start), StreamEvent::end(name)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qname_equality_ignores_prefix() {
        let a = QName::prefixed("urn:a", "Item", "a");
        let b = QName::prefixed("urn:a", "Item", "other");
        assert_eq!(a, b);
        assert_ne!(a, QName::new("urn:b", "Item"));
    }

    #[test]
    fn test_parse_clark() {
        let q = QName::parse_clark("{http://example.org/ns}Item").unwrap();
        assert_eq!(q.namespace, "http://example.org/ns");
        assert_eq!(q.local, "Item");
        assert_eq!(QName::parse_clark("Local").unwrap(), QName::new("", "Local"));
        assert!(QName::parse_clark("{urn:x").is_err());
        assert!(QName::parse_clark("{urn:x}").is_err());
    }

    #[test]
    fn test_qualified_and_display() {
        let q = QName::prefixed("urn:a", "Item", "a");
        assert_eq!(q.qualified(), "a:Item");
        assert_eq!(q.to_string(), "{urn:a}Item");
        assert_eq!(path_to_string(&[q.clone(), QName::new("", "x")]), "/{urn:a}Item/x");
    }

    #[test]
    fn test_attribute_lookup() {
        let start = ElementStart::new(QName::new("urn:a", "Item"))
            .with_attribute(QName::new("", "Id"), "x1");
        assert_eq!(start.attribute(&QName::new("", "Id")), Some("x1"));
        assert_eq!(start.attribute(&QName::new("", "ID")), None);
    }
}
