//! Labeled tree type carried by every frame after the handshake.
//!
//! A node has a tag, an ordered attribute map with unique keys, and exactly
//! one kind of content: nothing, raw bytes, or child nodes.

use std::fmt;

use crate::types::Jid;

/// Attribute value as it appears on the wire.
///
/// Numeric values travel as decimal strings and binary values travel as raw
/// byte strings, so equality compares the canonical wire form: a value read
/// back from the wire equals the value that was written even when the
/// decoder picks a different variant.
#[derive(Debug, Clone)]
pub enum AttrValue {
    String(String),
    Numeric(i64),
    Binary(Vec<u8>),
    Jid(Jid),
}

impl AttrValue {
    /// Get as string if the value is textual.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as integer, parsing textual values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Numeric(n) => Some(*n),
            AttrValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Get as JID, parsing textual values.
    pub fn as_jid(&self) -> Option<Jid> {
        match self {
            AttrValue::Jid(jid) => Some(jid.clone()),
            AttrValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn canonical_bytes(&self) -> Option<std::borrow::Cow<'_, [u8]>> {
        match self {
            AttrValue::String(s) => Some(s.as_bytes().into()),
            AttrValue::Numeric(n) => Some(n.to_string().into_bytes().into()),
            AttrValue::Binary(b) => Some(b.as_slice().into()),
            AttrValue::Jid(jid) if jid.has_binary_form() => None,
            AttrValue::Jid(jid) => Some(jid.to_string().into_bytes().into()),
        }
    }
}

impl PartialEq for AttrValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AttrValue::Jid(a), AttrValue::Jid(b)) => a == b,
            // A JID without a token form travels as text and equals it.
            _ => match (self.canonical_bytes(), other.canonical_bytes()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl Eq for AttrValue {}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::String(s) => write!(f, "{s}"),
            AttrValue::Numeric(n) => write!(f, "{n}"),
            AttrValue::Binary(b) => write!(f, "0x{}", hex::encode(b)),
            AttrValue::Jid(jid) => write!(f, "{jid}"),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::Numeric(n)
    }
}

impl From<u64> for AttrValue {
    fn from(n: u64) -> Self {
        match i64::try_from(n) {
            Ok(n) => AttrValue::Numeric(n),
            Err(_) => AttrValue::String(n.to_string()),
        }
    }
}

impl From<Vec<u8>> for AttrValue {
    fn from(b: Vec<u8>) -> Self {
        AttrValue::Binary(b)
    }
}

impl From<Jid> for AttrValue {
    fn from(jid: Jid) -> Self {
        AttrValue::Jid(jid)
    }
}

/// Insertion-ordered attribute map with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attrs(Vec<(String, AttrValue)>);

impl Attrs {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert or replace; a replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<AttrValue>> FromIterator<(K, V)> for Attrs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attrs = Attrs::new();
        for (k, v) in iter {
            attrs.insert(k, v);
        }
        attrs
    }
}

/// Content of a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NodeContent {
    #[default]
    None,
    /// Binary data
    Bytes(Vec<u8>),
    /// Child nodes
    Children(Vec<Node>),
}

/// Node represents a binary XML element in the WhatsApp protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub content: NodeContent,
}

impl Node {
    /// Create a new node with the given tag
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: NodeContent::None,
        }
    }

    /// Add an attribute, returning the node.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(key, value);
        self
    }

    /// Replace the content with child nodes, returning the node.
    pub fn children(mut self, children: Vec<Node>) -> Self {
        self.content = NodeContent::Children(children);
        self
    }

    /// Replace the content with bytes, returning the node.
    pub fn bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.content = NodeContent::Bytes(bytes.into());
        self
    }

    pub fn get_attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    /// Textual attribute; binary values that are valid UTF-8 also qualify.
    pub fn get_attr_str(&self, key: &str) -> Option<&str> {
        match self.attrs.get(key)? {
            AttrValue::String(s) => Some(s),
            AttrValue::Binary(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn get_attr_i64(&self, key: &str) -> Option<i64> {
        self.attrs.get(key).and_then(AttrValue::as_i64)
    }

    pub fn get_attr_jid(&self, key: &str) -> Option<Jid> {
        self.attrs.get(key).and_then(AttrValue::as_jid)
    }

    /// Get children if content is children
    pub fn get_children(&self) -> &[Node] {
        match &self.content {
            NodeContent::Children(children) => children,
            _ => &[],
        }
    }

    /// Get children by tag
    pub fn get_children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.get_children().iter().filter(move |n| n.tag == tag)
    }

    /// Get first child with the given tag
    pub fn get_child_by_tag(&self, tag: &str) -> Option<&Node> {
        self.get_children().iter().find(|n| n.tag == tag)
    }

    /// Get an optional child by walking through nested tags
    pub fn get_optional_child_by_tag(&self, tags: &[&str]) -> Option<&Node> {
        let mut current = self;
        for tag in tags {
            current = current.get_child_by_tag(tag)?;
        }
        Some(current)
    }

    /// Get bytes content if present
    pub fn get_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

impl Node {
    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        write!(f, "{pad}<{}", self.tag)?;
        for (key, value) in self.attrs.iter() {
            write!(f, " {key}=\"{value}\"")?;
        }
        match &self.content {
            NodeContent::None => writeln!(f, "/>"),
            NodeContent::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) if !text.chars().any(char::is_control) => {
                    writeln!(f, ">{text}</{}>", self.tag)
                }
                _ => writeln!(f, "><!-- {} bytes: {} --></{}>", bytes.len(), hex::encode(bytes), self.tag),
            },
            NodeContent::Children(children) => {
                writeln!(f, ">")?;
                for child in children {
                    child.write_indented(f, depth + 1)?;
                }
                writeln!(f, "{pad}</{}>", self.tag)
            }
        }
    }
}
