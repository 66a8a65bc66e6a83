//! Static HTML view of a document.

use std::fmt::Write;

use crate::document::Document;
use crate::node::{BlockKind, Element, Mark, Node, Text};

pub fn to_html(doc: &Document) -> String {
    let mut out = String::new();
    for node in &doc.children {
        write_node(&mut out, node);
    }
    out
}

fn tag(kind: BlockKind) -> &'static str {
    match kind {
        BlockKind::Paragraph => "p",
        BlockKind::HeadingOne => "h1",
        BlockKind::HeadingTwo => "h2",
        BlockKind::BlockQuote => "blockquote",
        BlockKind::NumberedList => "ol",
        BlockKind::BulletedList => "ul",
        BlockKind::ListItem => "li",
    }
}

fn write_node(out: &mut String, node: &Node) {
    match node {
        Node::Element(element) => write_element(out, element),
        Node::Text(text) => write_leaf(out, text),
    }
}

fn write_element(out: &mut String, element: &Element) {
    let tag = tag(element.kind);
    match element.align {
        Some(align) => {
            let _ = write!(out, "<{} style=\"text-align: {}\">", tag, align);
        }
        None => {
            let _ = write!(out, "<{}>", tag);
        }
    }
    for child in &element.children {
        write_node(out, child);
    }
    let _ = write!(out, "</{}>", tag);
}

/// Marks nest strong, code, em, u from the inside out.
fn write_leaf(out: &mut String, text: &Text) {
    let wrappers: Vec<&str> = [
        (Mark::Bold, "strong"),
        (Mark::Code, "code"),
        (Mark::Italic, "em"),
        (Mark::Underline, "u"),
    ]
    .into_iter()
    .filter(|(mark, _)| text.marks.has(*mark))
    .map(|(_, tag)| tag)
    .collect();

    out.push_str("<span>");
    for tag in wrappers.iter().rev() {
        let _ = write!(out, "<{}>", tag);
    }
    escape_into(out, &text.text);
    for tag in &wrappers {
        let _ = write!(out, "</{}>", tag);
    }
    out.push_str("</span>");
}

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
}
