//! Streaming Exclusive XML Canonicalization (without comments).
//!
//! Only namespaces visibly utilized by an element or its attributes are
//! rendered, on the outermost element that utilizes them. Output can be
//! drained incrementally so digests never hold the whole subtree.

use crate::event::{ElementStart, StreamEvent};

/// Incremental exclusive canonicalizer over a single subtree.
#[derive(Debug, Default)]
pub struct ExclusiveCanonicalizer {
    out: Vec<u8>,
    rendered: Vec<Vec<(Option<String>, String)>>,
}

impl ExclusiveCanonicalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current element nesting depth inside the canonicalized subtree.
    pub fn depth(&self) -> usize {
        self.rendered.len()
    }

    pub fn feed(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::ElementStart(start) => self.start(start),
            StreamEvent::ElementEnd(name) => {
                self.out.extend_from_slice(b"</");
                self.out.extend_from_slice(name.qualified().as_bytes());
                self.out.push(b'>');
                self.rendered.pop();
            }
            StreamEvent::Characters(text) => escape_text(text, &mut self.out),
        }
    }

    fn in_scope(&self, prefix: Option<&str>) -> Option<&str> {
        self.rendered
            .iter()
            .rev()
            .flat_map(|scope| scope.iter())
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    fn start(&mut self, start: &ElementStart) {
        let mut utilized: Vec<(Option<String>, String)> = Vec::new();
        let element_prefix = start.name.prefix.clone().filter(|p| !p.is_empty());
        utilized.push((element_prefix, start.name.namespace.clone()));
        for attr in &start.attributes {
            if attr.name.namespace.is_empty() {
                continue;
            }
            if let Some(prefix) = attr.name.prefix.clone().filter(|p| p != "xml") {
                utilized.push((Some(prefix), attr.name.namespace.clone()));
            }
        }

        let mut decls: Vec<(Option<String>, String)> = Vec::new();
        for (prefix, uri) in utilized {
            if decls.iter().any(|(p, _)| *p == prefix) {
                continue;
            }
            let current = self.in_scope(prefix.as_deref()).unwrap_or("");
            if current != uri {
                decls.push((prefix, uri));
            }
        }
        decls.sort_by(|a, b| a.0.cmp(&b.0));

        let mut attributes: Vec<_> = start.attributes.iter().collect();
        attributes.sort_by(|a, b| {
            (a.name.namespace.as_str(), a.name.local.as_str())
                .cmp(&(b.name.namespace.as_str(), b.name.local.as_str()))
        });

        self.out.push(b'<');
        self.out.extend_from_slice(start.name.qualified().as_bytes());
        for (prefix, uri) in &decls {
            match prefix {
                Some(p) => {
                    self.out.extend_from_slice(b" xmlns:");
                    self.out.extend_from_slice(p.as_bytes());
                }
                None => self.out.extend_from_slice(b" xmlns"),
            }
            self.out.extend_from_slice(b"=\"");
            escape_attribute(uri, &mut self.out);
            self.out.push(b'"');
        }
        for attr in attributes {
            self.out.push(b' ');
            self.out.extend_from_slice(attr.name.qualified().as_bytes());
            self.out.extend_from_slice(b"=\"");
            escape_attribute(&attr.value, &mut self.out);
            self.out.push(b'"');
        }
        self.out.push(b'>');
        self.rendered.push(decls);
    }

    /// Drain the bytes produced so far.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

/// Canonicalize a complete subtree.
pub fn canonicalize<'a>(events: impl IntoIterator<Item = &'a StreamEvent>) -> Vec<u8> {
    let mut c14n = ExclusiveCanonicalizer::new();
    for event in events {
        c14n.feed(event);
    }
    c14n.finish()
}

fn escape_text(text: &str, out: &mut Vec<u8>) {
    for c in text.chars() {
        match c {
            '&' => out.extend_from_slice(b"&amp;"),
            '<' => out.extend_from_slice(b"&lt;"),
            '>' => out.extend_from_slice(b"&gt;"),
            '\r' => out.extend_from_slice(b"&#xD;"),
            _ => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

fn escape_attribute(value: &str, out: &mut Vec<u8>) {
    for c in value.chars() {
        match c {
            '&' => out.extend_from_slice(b"&amp;"),
            '<' => out.extend_from_slice(b"&lt;"),
            '"' => out.extend_from_slice(b"&quot;"),
            '\t' => out.extend_from_slice(b"&#x9;"),
            '\n' => out.extend_from_slice(b"&#xA;"),
            '\r' => out.extend_from_slice(b"&#xD;"),
            _ => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}
