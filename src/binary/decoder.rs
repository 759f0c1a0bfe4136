//! Binary decoder for WhatsApp protocol.
//!
//! Decodes WhatsApp's binary XML format into Node structures. Every read is
//! bounds-checked so arbitrary input produces an error, never a panic.

use super::node::{AttrValue, Attrs, Node, NodeContent};
use super::tags;
use super::token::{get_double_token, get_token};
use crate::types::Jid;

/// Nesting deeper than this is rejected.
pub const MAX_DEPTH: usize = 64;

/// Error type for decoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of data at offset {0}")]
    Truncated(usize),
    #[error("declared length {len} exceeds {remaining} remaining bytes")]
    LengthOverrun { len: usize, remaining: usize },
    #[error("unknown token index {0}")]
    BadToken(u8),
    #[error("unknown double token: dict={dict}, index={index}")]
    BadDoubleToken { dict: u8, index: u8 },
    #[error("invalid packed character {0:#x}")]
    BadPackedChar(u8),
    #[error("unexpected tag {tag:#x} while reading {context}")]
    UnexpectedTag { tag: u8, context: &'static str },
    #[error("node nesting exceeds {MAX_DEPTH}")]
    TooDeep,
    #[error("invalid list size {0}")]
    BadListSize(usize),
    #[error("{0} leftover bytes after decoding")]
    Leftover(usize),
    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// Either a decoded string or raw bytes that did not come from a token.
enum Value {
    Text(String),
    Raw(Vec<u8>),
    Jid(Jid),
}

/// Binary decoder for WhatsApp XML nodes
pub struct Decoder<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> Decoder<'a> {
    /// Create a new decoder
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }

    /// Decode the data into a node, rejecting trailing bytes.
    pub fn decode(data: &[u8]) -> Result<Node, DecodeError> {
        let mut decoder = Decoder::new(data);
        let node = decoder.read_node(0)?;
        if decoder.index != decoder.data.len() {
            return Err(DecodeError::Leftover(decoder.data.len() - decoder.index));
        }
        Ok(node)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.index
    }

    fn read_byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .data
            .get(self.index)
            .ok_or(DecodeError::Truncated(self.index))?;
        self.index += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::LengthOverrun {
                len: n,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.data[self.index..self.index + n];
        self.index += n;
        Ok(bytes)
    }

    fn read_int(&mut self, n: usize) -> Result<usize, DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::Truncated(self.data.len()));
        }
        let mut result = 0usize;
        for _ in 0..n {
            result = (result << 8) | self.read_byte()? as usize;
        }
        Ok(result)
    }

    fn read_int20(&mut self) -> Result<usize, DecodeError> {
        let b = self.read_int(3)?;
        Ok(b & 0x0F_FFFF)
    }

    fn read_list_size(&mut self, tag: u8) -> Result<usize, DecodeError> {
        match tag {
            tags::LIST_EMPTY => Ok(0),
            tags::LIST_8 => self.read_int(1),
            tags::LIST_16 => self.read_int(2),
            tag => Err(DecodeError::UnexpectedTag {
                tag,
                context: "list size",
            }),
        }
    }

    fn read_packed(&mut self, tag: u8) -> Result<String, DecodeError> {
        let start = self.read_byte()?;
        let count = (start & 0x7F) as usize;
        let packed = self.read_bytes(count)?;
        let mut out = String::with_capacity(count * 2);
        for &byte in packed {
            out.push(unpack(tag, byte >> 4)?);
            out.push(unpack(tag, byte & 0x0F)?);
        }
        if start & 0x80 != 0 {
            out.pop();
        }
        Ok(out)
    }

    fn read_value(&mut self, tag: u8) -> Result<Value, DecodeError> {
        match tag {
            tags::LIST_EMPTY => Ok(Value::Text(String::new())),
            tags::DICTIONARY_0..=tags::DICTIONARY_3 => {
                let dict = tag - tags::DICTIONARY_0;
                let index = self.read_byte()?;
                get_double_token(dict, index)
                    .map(|t| Value::Text(t.to_string()))
                    .ok_or(DecodeError::BadDoubleToken { dict, index })
            }
            tags::BINARY_8 => {
                let len = self.read_int(1)?;
                Ok(Value::Raw(self.read_bytes(len)?.to_vec()))
            }
            tags::BINARY_20 => {
                let len = self.read_int20()?;
                Ok(Value::Raw(self.read_bytes(len)?.to_vec()))
            }
            tags::BINARY_32 => {
                let len = self.read_int(4)?;
                Ok(Value::Raw(self.read_bytes(len)?.to_vec()))
            }
            tags::NIBBLE_8 | tags::HEX_8 => Ok(Value::Text(self.read_packed(tag)?)),
            tags::JID_PAIR => {
                let user_tag = self.read_byte()?;
                let user = self.read_text(user_tag)?;
                let server_tag = self.read_byte()?;
                let server = self.read_text(server_tag)?;
                Ok(Value::Jid(Jid::new(user, server)))
            }
            tags::AD_JID => {
                let domain = self.read_byte()?;
                let device = self.read_byte()?;
                let user_tag = self.read_byte()?;
                let user = self.read_text(user_tag)?;
                Ok(Value::Jid(Jid::new_ad(user, domain, device)))
            }
            tags::INTEROP_JID | tags::FB_JID | tags::LIST_8 | tags::LIST_16 => {
                Err(DecodeError::UnexpectedTag {
                    tag,
                    context: "value",
                })
            }
            index => get_token(index)
                .map(|t| Value::Text(t.to_string()))
                .ok_or(DecodeError::BadToken(index)),
        }
    }

    /// A value that must be textual: tags, attribute keys, JID parts.
    fn read_text(&mut self, tag: u8) -> Result<String, DecodeError> {
        match self.read_value(tag)? {
            Value::Text(s) => Ok(s),
            Value::Raw(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Value::Jid(jid) => Ok(jid.to_string()),
        }
    }

    fn read_attr_value(&mut self) -> Result<AttrValue, DecodeError> {
        let tag = self.read_byte()?;
        Ok(match self.read_value(tag)? {
            Value::Text(s) => AttrValue::String(s),
            Value::Raw(bytes) => match String::from_utf8(bytes) {
                Ok(s) => AttrValue::String(s),
                Err(e) => AttrValue::Binary(e.into_bytes()),
            },
            Value::Jid(jid) => AttrValue::Jid(jid),
        })
    }

    fn read_node(&mut self, depth: usize) -> Result<Node, DecodeError> {
        if depth >= MAX_DEPTH {
            return Err(DecodeError::TooDeep);
        }

        let list_tag = self.read_byte()?;
        let size = self.read_list_size(list_tag)?;
        if size == 0 {
            return Err(DecodeError::BadListSize(size));
        }

        let tag_byte = self.read_byte()?;
        let tag = self.read_text(tag_byte)?;

        let mut attrs = Attrs::new();
        for _ in 0..(size - 1) / 2 {
            let key_tag = self.read_byte()?;
            let key = self.read_text(key_tag)?;
            let value = self.read_attr_value()?;
            attrs.insert(key, value);
        }

        let content = if size % 2 == 1 {
            NodeContent::None
        } else {
            self.read_content(depth)?
        };

        Ok(Node { tag, attrs, content })
    }

    fn read_content(&mut self, depth: usize) -> Result<NodeContent, DecodeError> {
        let tag = self.read_byte()?;
        match tag {
            tags::LIST_EMPTY | tags::LIST_8 | tags::LIST_16 => {
                let count = self.read_list_size(tag)?;
                let mut children = Vec::with_capacity(count.min(self.remaining()));
                for _ in 0..count {
                    children.push(self.read_node(depth + 1)?);
                }
                Ok(NodeContent::Children(children))
            }
            _ => match self.read_value(tag)? {
                Value::Text(s) => Ok(NodeContent::Bytes(s.into_bytes())),
                Value::Raw(bytes) => Ok(NodeContent::Bytes(bytes)),
                Value::Jid(jid) => Ok(NodeContent::Bytes(jid.to_string().into_bytes())),
            },
        }
    }
}

fn unpack(tag: u8, value: u8) -> Result<char, DecodeError> {
    let c = match (tag, value) {
        (_, 0..=9) => (b'0' + value) as char,
        (tags::NIBBLE_8, 10) => '-',
        (tags::NIBBLE_8, 11) => '.',
        (tags::HEX_8, 10..=15) => (b'A' + value - 10) as char,
        (_, 15) => '\0',
        _ => return Err(DecodeError::BadPackedChar(value)),
    };
    Ok(c)
}

/// Decode binary data to a node
pub fn decode(data: &[u8]) -> Result<Node, DecodeError> {
    Decoder::decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::encode;
    use crate::types::{servers, LID_DOMAIN};

    #[test]
    fn test_roundtrip_simple() {
        let node = Node::new("message")
            .attr("id", "3EB0123ABC")
            .attr("type", "text")
            .attr("t", 1_700_000_000i64);
        let decoded = decode(&encode(&node).unwrap()).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.get_attr_i64("t"), Some(1_700_000_000));
    }

    #[test]
    fn test_roundtrip_nested() {
        let node = Node::new("iq")
            .attr("xmlns", "w:sync:app:state")
            .children(vec![Node::new("sync").children(vec![
                Node::new("collection").attr("name", "regular_high").attr("version", 5i64),
                Node::new("enc").bytes(vec![0xFF, 0x00, 0x10]),
            ])]);
        assert_eq!(decode(&encode(&node).unwrap()).unwrap(), node);
    }

    #[test]
    fn test_roundtrip_jids() {
        let plain: Jid = "123456@s.whatsapp.net".parse().unwrap();
        let device: Jid = "123456:12@s.whatsapp.net".parse().unwrap();
        let lid = Jid::new_ad("777", LID_DOMAIN, 3);
        let node = Node::new("receipt")
            .attr("from", plain.clone())
            .attr("participant", device.clone())
            .attr("recipient", lid.clone())
            .attr("to", Jid::new("", servers::DEFAULT_USER));
        let decoded = decode(&encode(&node).unwrap()).unwrap();
        assert_eq!(decoded.get_attr_jid("from"), Some(plain));
        assert_eq!(decoded.get_attr_jid("participant"), Some(device));
        assert_eq!(decoded.get_attr_jid("recipient"), Some(lid));
        assert_eq!(decoded, node);
    }

    #[test]
    fn test_empty_string_and_empty_children() {
        let node = Node::new("list").attr("hash", "").children(vec![]);
        assert_eq!(decode(&encode(&node).unwrap()).unwrap(), node);
    }

    #[test]
    fn test_binary_attr_stays_binary() {
        let node = Node::new("key").attr("v", vec![0xC3u8, 0x28]);
        let decoded = decode(&encode(&node).unwrap()).unwrap();
        assert!(matches!(decoded.get_attr("v"), Some(AttrValue::Binary(_))));
        assert_eq!(decoded, node);
    }

    #[test]
    fn test_packed_odd_length() {
        let node = Node::new("iq").attr("id", "1.2-3");
        assert_eq!(decode(&encode(&node).unwrap()).unwrap(), node);
    }

    #[test]
    fn test_length_overrun_is_error() {
        let data = [tags::LIST_8, 2, 29, tags::BINARY_8, 200, 1, 2, 3];
        assert!(matches!(
            decode(&data),
            Err(DecodeError::LengthOverrun { len: 200, .. })
        ));
    }

    #[test]
    fn test_bad_double_token_is_error() {
        let data = [tags::LIST_8, 1, tags::DICTIONARY_3, 9];
        assert_eq!(
            decode(&data),
            Err(DecodeError::BadDoubleToken { dict: 3, index: 9 })
        );
    }

    #[test]
    fn test_bad_single_token_is_error() {
        let data = [tags::LIST_8, 1, 240];
        assert!(decode(&data).is_err());
    }

    #[test]
    fn test_depth_limit() {
        // MAX_DEPTH wrappers around a leaf, each `<w>` with one child.
        let mut data = Vec::new();
        for _ in 0..MAX_DEPTH {
            data.extend_from_slice(&[tags::LIST_8, 2, tags::BINARY_8, 1, b'w', tags::LIST_8, 1]);
        }
        data.extend_from_slice(&[tags::LIST_8, 1, tags::BINARY_8, 1, b'l']);
        assert_eq!(decode(&data), Err(DecodeError::TooDeep));
        assert!(decode(&data[7..]).is_ok());
    }

    #[test]
    fn test_every_truncated_prefix_fails() {
        let node = Node::new("message")
            .attr("to", "123@s.whatsapp.net")
            .children(vec![Node::new("enc").attr("v", "2").bytes(vec![9; 40])]);
        let encoded = encode(&node).unwrap();
        for cut in 0..encoded.len() {
            assert!(decode(&encoded[..cut]).is_err(), "prefix of {cut} bytes decoded");
        }
    }
}
