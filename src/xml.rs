//! Streaming XML reading and writing.
//!
//! Uses quick-xml, which is safe against XXE by default (doesn't expand
//! entities). DOCTYPE and entity declarations are rejected outright.

use crate::config::SoapVersion;
use crate::error::WssError;
use crate::event::{Attribute, ElementStart, NamespaceDecl, QName, StreamEvent};
use crate::ns::{self, SOAP_11_NS, SOAP_12_NS};
use quick_xml::events::attributes::Attribute as XmlAttribute;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{PrefixDeclaration, ResolveResult};
use quick_xml::NsReader;

const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";
const FRAGMENT_ROOT: &str = "zwss-fragment";

/// Pull reader producing [`StreamEvent`]s in document order.
///
/// Namespaces are resolved as the stream is read; comments, processing
/// instructions and the XML declaration are not carried.
pub struct EventReader<'a> {
    reader: NsReader<&'a [u8]>,
    done: bool,
}

impl<'a> EventReader<'a> {
    /// Create a reader over a complete document.
    pub fn new(xml: &'a str) -> Result<Self, WssError> {
        check_xxe_patterns(xml)?;
        let mut reader = NsReader::from_str(xml);
        let config = reader.config_mut();
        config.trim_text(false);
        config.expand_empty_elements = true;
        Ok(Self { reader, done: false })
    }

    fn next_event(&mut self) -> Result<Option<StreamEvent>, WssError> {
        loop {
            let (resolved, event) = self.reader.read_resolved_event()?;
            let namespace = resolved_namespace(resolved)?;
            match event {
                Event::Start(e) => {
                    let start = self.element_start(&e, namespace)?;
                    return Ok(Some(StreamEvent::ElementStart(start)));
                }
                Event::End(e) => {
                    let name = e.name();
                    let local = utf8(name.local_name().as_ref())?;
                    let prefix = name.prefix().map(|p| utf8(p.as_ref())).transpose()?;
                    return Ok(Some(StreamEvent::ElementEnd(QName {
                        namespace,
                        local,
                        prefix,
                    })));
                }
                Event::Text(e) => {
                    let text = e.unescape()?;
                    if !text.is_empty() {
                        return Ok(Some(StreamEvent::Characters(text.into_owned())));
                    }
                }
                Event::CData(e) => {
                    let text = utf8(&e.into_inner())?;
                    return Ok(Some(StreamEvent::Characters(text)));
                }
                Event::DocType(_) => {
                    return Err(WssError::Structural(
                        "DOCTYPE declarations are not allowed".to_string(),
                    ));
                }
                Event::Eof => return Ok(None),
                _ => {}
            }
        }
    }

    fn element_start(&self, e: &BytesStart<'_>, namespace: String) -> Result<ElementStart, WssError> {
        let name = e.name();
        let mut start = ElementStart::new(QName {
            namespace,
            local: utf8(name.local_name().as_ref())?,
            prefix: name.prefix().map(|p| utf8(p.as_ref())).transpose()?,
        });

        for attr in e.attributes() {
            let attr: XmlAttribute<'_> = attr.map_err(|e| WssError::XmlParse(e.to_string()))?;
            let value = attr.unescape_value()?.into_owned();
            match attr.key.as_namespace_binding() {
                Some(PrefixDeclaration::Default) => {
                    start.namespaces.push(NamespaceDecl { prefix: None, uri: value });
                }
                Some(PrefixDeclaration::Named(prefix)) => {
                    start.namespaces.push(NamespaceDecl {
                        prefix: Some(utf8(prefix)?),
                        uri: value,
                    });
                }
                None => {
                    let (resolved, local) = self.reader.resolve_attribute(attr.key);
                    let namespace = resolved_namespace(resolved)?;
                    let prefix = attr.key.prefix().map(|p| utf8(p.as_ref())).transpose()?;
                    start.attributes.push(Attribute::new(
                        QName {
                            namespace,
                            local: utf8(local.as_ref())?,
                            prefix,
                        },
                        value,
                    ));
                }
            }
        }
        Ok(start)
    }
}

impl Iterator for EventReader<'_> {
    type Item = Result<StreamEvent, WssError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_event() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Read every event of a document.
pub fn read_events(xml: &str) -> Result<Vec<StreamEvent>, WssError> {
    EventReader::new(xml)?.collect()
}

/// Parse a decrypted fragment (element or mixed content) with the namespace
/// bindings in scope at the point where it is re-injected.
pub fn parse_fragment(
    fragment: &str,
    bindings: &[(Option<String>, String)],
) -> Result<Vec<StreamEvent>, WssError> {
    let mut wrapped = format!("<{}", FRAGMENT_ROOT);
    for (prefix, uri) in bindings {
        let uri = quick_xml::escape::escape(uri.as_str());
        match prefix {
            Some(p) => wrapped.push_str(&format!(" xmlns:{}=\"{}\"", p, uri)),
            None => wrapped.push_str(&format!(" xmlns=\"{}\"", uri)),
        }
    }
    wrapped.push('>');
    wrapped.push_str(fragment);
    wrapped.push_str(&format!("</{}>", FRAGMENT_ROOT));

    let mut events = read_events(&wrapped)?;
    if events.len() < 2 {
        return Err(WssError::XmlParse("empty fragment".to_string()));
    }
    events.pop();
    events.remove(0);
    Ok(events)
}

/// Serializes [`StreamEvent`]s back to text.
///
/// Declares any namespace a name uses that is not bound in scope, so events
/// injected by processors need not carry their own declarations.
#[derive(Debug, Default)]
pub struct EventWriter {
    out: String,
    scopes: Vec<Vec<(Option<String>, String)>>,
    pending_start: bool,
    generated: usize,
}

impl EventWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, prefix: Option<&str>) -> Option<&str> {
        if prefix == Some("xml") {
            return Some(XML_NS);
        }
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    fn close_pending(&mut self) {
        if self.pending_start {
            self.out.push('>');
            self.pending_start = false;
        }
    }

    pub fn write(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::ElementStart(start) => self.write_start(start),
            StreamEvent::ElementEnd(name) => {
                if self.pending_start {
                    self.out.push_str("/>");
                    self.pending_start = false;
                } else {
                    self.out.push_str("</");
                    self.out.push_str(&name.qualified());
                    self.out.push('>');
                }
                self.scopes.pop();
            }
            StreamEvent::Characters(text) => {
                self.close_pending();
                self.out.push_str(&quick_xml::escape::partial_escape(text.as_str()));
            }
        }
    }

    fn write_start(&mut self, start: &ElementStart) {
        self.close_pending();
        self.scopes.push(Vec::new());

        let mut decls: Vec<(Option<String>, String)> = Vec::new();
        for decl in &start.namespaces {
            decls.push((decl.prefix.clone(), decl.uri.clone()));
            self.bind(decl.prefix.clone(), decl.uri.clone());
        }

        let element_prefix = start.name.prefix.as_deref().filter(|p| !p.is_empty());
        if self.lookup(element_prefix).unwrap_or("") != start.name.namespace {
            let binding = (element_prefix.map(str::to_string), start.name.namespace.clone());
            self.bind(binding.0.clone(), binding.1.clone());
            decls.push(binding);
        }

        let mut attributes = Vec::with_capacity(start.attributes.len());
        for attr in &start.attributes {
            let qualified = if attr.name.namespace.is_empty() {
                attr.name.local.clone()
            } else {
                let prefix = match attr.name.prefix.as_deref().filter(|p| !p.is_empty()) {
                    Some(p) => p.to_string(),
                    None => {
                        self.generated += 1;
                        format!("ns{}", self.generated)
                    }
                };
                if self.lookup(Some(&prefix)) != Some(attr.name.namespace.as_str()) {
                    self.bind(Some(prefix.clone()), attr.name.namespace.clone());
                    decls.push((Some(prefix.clone()), attr.name.namespace.clone()));
                }
                format!("{}:{}", prefix, attr.name.local)
            };
            attributes.push((qualified, attr.value.as_str()));
        }

        self.out.push('<');
        self.out.push_str(&start.name.qualified());
        for (prefix, uri) in &decls {
            let uri = quick_xml::escape::escape(uri.as_str());
            match prefix {
                Some(p) => self.out.push_str(&format!(" xmlns:{}=\"{}\"", p, uri)),
                None => self.out.push_str(&format!(" xmlns=\"{}\"", uri)),
            }
        }
        for (name, value) in attributes {
            self.out.push_str(&format!(" {}=\"{}\"", name, quick_xml::escape::escape(value)));
        }
        self.pending_start = true;
    }

    fn bind(&mut self, prefix: Option<String>, uri: String) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push((prefix, uri));
        }
    }

    /// Consume the writer and return the serialized text.
    pub fn finish(mut self) -> String {
        self.close_pending();
        self.out
    }
}

/// Serialize a sequence of events.
pub fn write_events<'a>(events: impl IntoIterator<Item = &'a StreamEvent>) -> String {
    let mut writer = EventWriter::new();
    for event in events {
        writer.write(event);
    }
    writer.finish()
}

/// Small in-memory element, used only for bounded header structures such as
/// `ds:Signature`, `ds:KeyInfo` and `xenc:ReferenceList`.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub start: ElementStart,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    /// Build an element from the complete event sequence of one subtree.
    pub fn from_events(events: &[StreamEvent]) -> Result<Self, WssError> {
        let mut stack: Vec<Element> = Vec::new();
        let mut root = None;
        for event in events {
            match event {
                StreamEvent::ElementStart(start) => {
                    if root.is_some() {
                        return Err(WssError::Structural("content after subtree end".to_string()));
                    }
                    stack.push(Element {
                        start: start.clone(),
                        children: Vec::new(),
                    });
                }
                StreamEvent::ElementEnd(_) => {
                    let done = stack
                        .pop()
                        .ok_or_else(|| WssError::Structural("unbalanced subtree".to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(done)),
                        None => root = Some(done),
                    }
                }
                StreamEvent::Characters(text) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(text.clone()));
                    }
                }
            }
        }
        if !stack.is_empty() {
            return Err(WssError::Structural("unterminated subtree".to_string()));
        }
        root.ok_or_else(|| WssError::Structural("empty subtree".to_string()))
    }

    pub fn name(&self) -> &QName {
        &self.start.name
    }

    pub fn attribute(&self, name: &QName) -> Option<&str> {
        self.start.attribute(name)
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn children_named<'a>(&'a self, namespace: &'a str, local: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children().filter(move |e| e.name().is(namespace, local))
    }

    pub fn child(&self, namespace: &str, local: &str) -> Option<&Element> {
        self.children().find(|e| e.name().is(namespace, local))
    }

    /// Direct text content, concatenated.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Append this subtree's events to `out`.
    pub fn to_events(&self, out: &mut Vec<StreamEvent>) {
        out.push(StreamEvent::ElementStart(self.start.clone()));
        for child in &self.children {
            match child {
                Node::Element(e) => e.to_events(out),
                Node::Text(t) => out.push(StreamEvent::Characters(t.clone())),
            }
        }
        out.push(StreamEvent::ElementEnd(self.start.name.clone()));
    }
}

/// SOAP version announced by an envelope start element.
pub fn soap_version(start: &ElementStart) -> Option<SoapVersion> {
    if start.name.local != ns::node::ENVELOPE {
        return None;
    }
    match start.name.namespace.as_str() {
        SOAP_11_NS => Some(SoapVersion::Soap11),
        SOAP_12_NS => Some(SoapVersion::Soap12),
        _ => None,
    }
}

/// Check for XXE attack patterns.
fn check_xxe_patterns(xml: &str) -> Result<(), WssError> {
    let upper = xml.to_ascii_uppercase();
    if upper.contains("<!DOCTYPE") {
        return Err(WssError::Structural(
            "DOCTYPE declarations are not allowed".to_string(),
        ));
    }
    if upper.contains("<!ENTITY") {
        return Err(WssError::Structural(
            "Entity declarations are not allowed".to_string(),
        ));
    }
    Ok(())
}

fn resolved_namespace(resolved: ResolveResult<'_>) -> Result<String, WssError> {
    match resolved {
        ResolveResult::Bound(ns) => utf8(ns.as_ref()),
        ResolveResult::Unbound => Ok(String::new()),
        ResolveResult::Unknown(prefix) => Err(WssError::XmlParse(format!(
            "unbound namespace prefix '{}'",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

fn utf8(bytes: &[u8]) -> Result<String, WssError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| WssError::XmlParse(format!("Invalid UTF-8: {}", e)))
}
