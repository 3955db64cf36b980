//! Tolerant XML reader.
//!
//! Model output is dirty: chatter around payloads, unclosed tags, stray end
//! tags. The repair reader reconstructs as much of a tree as the bytes allow
//! instead of failing on the first irregularity:
//! - leading non-markup text is skipped
//! - a stray end tag that matches an open ancestor closes everything down
//!   to it; one that matches nothing is dropped
//! - elements still open at end of input are closed
//! - on a fatal tokenizer error, the tree parsed so far is kept

use quick_xml::events::Event;
use quick_xml::Reader;

use super::{Element, Node};

/// Parse the first top-level element from dirty input.
/// Returns `None` only when no element at all could be recovered.
pub fn parse(input: &[u8]) -> Option<Element> {
    parse_fragments(input).into_iter().next()
}

/// Parse all top-level elements from dirty input, in document order.
/// Top-level text runs (model chatter) are discarded.
pub fn parse_fragments(input: &[u8]) -> Vec<Element> {
    let text = String::from_utf8_lossy(input);
    // Skip anything before the first markup character.
    let text = match text.find('<') {
        Some(idx) => &text[idx..],
        None => return Vec::new(),
    };

    let mut reader = Reader::from_str(text);
    let config = reader.config_mut();
    config.trim_text(true);
    config.check_end_names = false;

    let mut roots: Vec<Element> = Vec::new();
    let mut stack: Vec<Element> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                stack.push(element_from_start(&start));
            }
            Ok(Event::Empty(start)) => {
                attach(&mut roots, &mut stack, element_from_start(&start));
            }
            Ok(Event::Text(t)) => {
                let content = t
                    .unescape()
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(t.as_ref()).into_owned());
                if let Some(open) = stack.last_mut() {
                    if !content.is_empty() {
                        open.children.push(Node::Text(content));
                    }
                }
                // top-level chatter is dropped
            }
            Ok(Event::CData(c)) => {
                let content = String::from_utf8_lossy(&c.into_inner()).into_owned();
                if let Some(open) = stack.last_mut() {
                    open.children.push(Node::Text(content));
                }
            }
            Ok(Event::End(end)) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                close_matching(&mut roots, &mut stack, &name);
            }
            Ok(Event::Eof) => break,
            // Declarations, comments, PIs, doctypes carry no payload content.
            Ok(_) => {}
            // Fatal tokenizer error: keep what we have.
            Err(_) => break,
        }
    }

    // Close anything left open at end of input.
    while let Some(done) = stack.pop() {
        attach(&mut roots, &mut stack, done);
    }

    roots
}

fn element_from_start(start: &quick_xml::events::BytesStart<'_>) -> Element {
    let mut el = Element::new(&String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes().with_checks(false).flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
        el.attrs.push((key, value));
    }
    el
}

/// Attach a completed element to its parent, or to the root list.
fn attach(roots: &mut Vec<Element>, stack: &mut [Element], done: Element) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(Node::Element(done));
    } else {
        roots.push(done);
    }
}

/// Close elements down to the named ancestor. A name matching nothing on the
/// stack is a stray end tag and is ignored.
fn close_matching(roots: &mut Vec<Element>, stack: &mut Vec<Element>, name: &str) {
    if !stack.iter().any(|e| e.name == name) {
        return;
    }
    loop {
        let done = match stack.pop() {
            Some(e) => e,
            None => return,
        };
        let matched = done.name == name;
        attach(roots, stack, done);
        if matched {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_document() {
        let el = parse(b"<add><a>40</a><b>2</b></add>").unwrap();
        assert_eq!(el.name, "add");
        assert_eq!(el.child_text("a").as_deref(), Some("40"));
    }

    #[test]
    fn leading_chatter_skipped() {
        let el = parse(b"Sure, here is the call:\n<add><a>1</a></add>").unwrap();
        assert_eq!(el.name, "add");
    }

    #[test]
    fn unclosed_tags_are_closed() {
        let el = parse(b"<add><a>40").unwrap();
        assert_eq!(el.name, "add");
        assert_eq!(el.child_text("a").as_deref(), Some("40"));
    }

    #[test]
    fn stray_end_tag_dropped() {
        let el = parse(b"<add></b><a>1</a></add>").unwrap();
        assert_eq!(el.name, "add");
        assert_eq!(el.child_text("a").as_deref(), Some("1"));
    }

    #[test]
    fn mismatched_end_closes_to_ancestor() {
        // </add> closes both <a> and <add>
        let el = parse(b"<add><a>1</add>").unwrap();
        assert_eq!(el.name, "add");
        assert_eq!(el.child_text("a").as_deref(), Some("1"));
    }

    #[test]
    fn multiple_fragments_in_order() {
        let frags = parse_fragments(b"<call1/><call2/><call3/>");
        let names: Vec<&str> = frags.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["call1", "call2", "call3"]);
    }

    #[test]
    fn no_markup_at_all() {
        assert!(parse(b"just words, no tags").is_none());
        assert!(parse(b"").is_none());
    }

    #[test]
    fn attributes_survive() {
        let el = parse(br#"<q sig="ab" xmlns="urn:x"/>"#).unwrap();
        assert_eq!(el.attr("sig"), Some("ab"));
        assert_eq!(el.namespace(), Some("urn:x"));
    }

    #[test]
    fn entities_unescaped() {
        let el = parse(b"<t>a &lt; b &amp; c</t>").unwrap();
        assert_eq!(el.text(), "a < b & c");
    }

    #[test]
    fn cdata_kept_verbatim() {
        let el = parse(b"<t><![CDATA[<raw>&stuff]]></t>").unwrap();
        assert_eq!(el.text(), "<raw>&stuff");
    }
}
