//! Canonical byte form.
//!
//! One deterministic serialization per tree: attributes sorted by key, text
//! trimmed at parse time, entities escaped, empty elements self-closed.
//! Signatures and comparisons always run over this form.

use super::{escape, escape_attr, Element, Node};

/// Serialize an element to its canonical bytes.
pub fn to_bytes(el: &Element) -> Vec<u8> {
    let mut out = String::new();
    write_element(el, &mut out);
    out.into_bytes()
}

/// Re-parse and re-serialize raw bytes into canonical form.
/// Idempotent: canonicalizing canonical bytes is a no-op.
pub fn canonicalize(raw: &[u8]) -> Option<Vec<u8>> {
    super::repair::parse(raw).map(|el| to_bytes(&el))
}

fn write_element(el: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&el.name);

    let mut attrs: Vec<&(String, String)> = el.attrs.iter().collect();
    attrs.sort_by(|a, b| a.0.cmp(&b.0));
    for (key, value) in attrs {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }

    if el.children.is_empty() {
        out.push_str("/>");
        return;
    }

    out.push('>');
    for node in &el.children {
        match node {
            Node::Element(child) => write_element(child, out),
            Node::Text(text) => out.push_str(&escape(text)),
        }
    }
    out.push_str("</");
    out.push_str(&el.name);
    out.push('>');
}
