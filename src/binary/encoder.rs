//! Binary encoder for the WhatsApp node format.

use super::decoder::MAX_DEPTH;
use super::node::{AttrValue, Node, NodeContent};
use super::token::{get_double_token_index, get_token_index};
use super::tags;
use crate::types::Jid;

/// Longest string that can be written in packed nibble/hex form.
pub const PACKED_MAX: usize = 127;

/// Why a node has no wire form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("list of {0} items exceeds the 16-bit size field")]
    ListTooLong(usize),
    #[error("binary of {0} bytes exceeds the 32-bit length field")]
    BinaryTooLong(usize),
    #[error("node nesting exceeds {MAX_DEPTH}")]
    TooDeep,
}

/// Binary encoder for WhatsApp nodes
pub struct Encoder {
    data: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Encode a node and return the binary data
    pub fn encode(node: &Node) -> Result<Vec<u8>, EncodeError> {
        let mut encoder = Self::new();
        encoder.write_node(node, 0)?;
        Ok(encoder.data)
    }

    fn write_byte(&mut self, b: u8) {
        self.data.push(b);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn write_list_start(&mut self, size: usize) -> Result<(), EncodeError> {
        if size == 0 {
            self.write_byte(tags::LIST_EMPTY);
        } else if let Ok(size) = u8::try_from(size) {
            self.write_byte(tags::LIST_8);
            self.write_byte(size);
        } else {
            let size = u16::try_from(size).map_err(|_| EncodeError::ListTooLong(size))?;
            self.write_byte(tags::LIST_16);
            self.write_bytes(&size.to_be_bytes());
        }
        Ok(())
    }

    /// Length-prefixed raw bytes, choosing the 8/20/32-bit form by size.
    fn write_binary(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        let len = bytes.len();
        if len < 256 {
            self.write_byte(tags::BINARY_8);
            self.write_byte(len as u8);
        } else if len < (1 << 20) {
            self.write_byte(tags::BINARY_20);
            self.write_byte(((len >> 16) & 0x0F) as u8);
            self.write_byte(((len >> 8) & 0xFF) as u8);
            self.write_byte((len & 0xFF) as u8);
        } else {
            let len = u32::try_from(len).map_err(|_| EncodeError::BinaryTooLong(len))?;
            self.write_byte(tags::BINARY_32);
            self.write_bytes(&len.to_be_bytes());
        }
        self.write_bytes(bytes);
        Ok(())
    }

    fn write_string(&mut self, s: &str) -> Result<(), EncodeError> {
        if let Some(index) = get_token_index(s) {
            self.write_byte(index);
        } else if let Some((dict, index)) = get_double_token_index(s) {
            self.write_byte(tags::DICTIONARY_0 + dict);
            self.write_byte(index);
        } else if is_nibble(s) {
            self.write_packed(s, tags::NIBBLE_8, pack_nibble);
        } else if is_hex(s) {
            self.write_packed(s, tags::HEX_8, pack_hex);
        } else {
            self.write_binary(s.as_bytes())?;
        }
        Ok(())
    }

    fn write_packed(&mut self, s: &str, tag: u8, pack: fn(u8) -> u8) {
        let bytes = s.as_bytes();
        let mut length = bytes.len().div_ceil(2) as u8;
        if bytes.len() % 2 == 1 {
            length |= 0x80;
        }
        self.write_byte(tag);
        self.write_byte(length);
        for pair in bytes.chunks(2) {
            let high = pack(pair[0]);
            let low = pair.get(1).map_or(0x0F, |&c| pack(c));
            self.write_byte((high << 4) | low);
        }
    }

    fn write_jid(&mut self, jid: &Jid) -> Result<(), EncodeError> {
        if !jid.has_binary_form() {
            // Agent/device with no AD form on this server; the text form
            // decodes as a string that compares equal to the JID.
            return self.write_string(&jid.to_string());
        }
        if jid.is_ad() {
            self.write_byte(tags::AD_JID);
            self.write_byte(jid.domain());
            self.write_byte(jid.device as u8);
            self.write_string(&jid.user)
        } else {
            self.write_byte(tags::JID_PAIR);
            if jid.user.is_empty() {
                self.write_byte(tags::LIST_EMPTY);
            } else {
                self.write_string(&jid.user)?;
            }
            self.write_string(&jid.server)
        }
    }

    fn write_attr_value(&mut self, value: &AttrValue) -> Result<(), EncodeError> {
        match value {
            AttrValue::String(s) => self.write_string(s),
            AttrValue::Numeric(n) => self.write_string(&n.to_string()),
            AttrValue::Binary(b) => self.write_binary(b),
            AttrValue::Jid(jid) => self.write_jid(jid),
        }
    }

    fn write_node(&mut self, node: &Node, depth: usize) -> Result<(), EncodeError> {
        if depth >= MAX_DEPTH {
            return Err(EncodeError::TooDeep);
        }
        let has_content = !matches!(node.content, NodeContent::None);
        let attr_items = node
            .attrs
            .len()
            .checked_mul(2)
            .ok_or(EncodeError::ListTooLong(usize::MAX))?;
        self.write_list_start(1 + attr_items + usize::from(has_content))?;
        self.write_string(&node.tag)?;

        for (key, value) in node.attrs.iter() {
            self.write_string(key)?;
            self.write_attr_value(value)?;
        }

        match &node.content {
            NodeContent::None => {}
            NodeContent::Bytes(bytes) => self.write_binary(bytes)?,
            NodeContent::Children(children) => {
                self.write_list_start(children.len())?;
                for child in children {
                    self.write_node(child, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

fn is_nibble(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= PACKED_MAX
        && s.bytes().all(|c| c.is_ascii_digit() || c == b'-' || c == b'.')
}

fn is_hex(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= PACKED_MAX
        && s.bytes().all(|c| c.is_ascii_digit() || (b'A'..=b'F').contains(&c))
}

fn pack_nibble(c: u8) -> u8 {
    match c {
        b'-' => 10,
        b'.' => 11,
        c => c - b'0',
    }
}

fn pack_hex(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        c => c - b'A' + 10,
    }
}

/// Encode a node to binary format
pub fn encode(node: &Node) -> Result<Vec<u8>, EncodeError> {
    Encoder::encode(node)
}
