//! Binary XML encoding and decoding for WhatsApp protocol.
//!
//! WhatsApp uses a custom binary XML format for efficient message encoding.
//! Frames carry a one-byte flags header in front of the encoded node; flag
//! bit 2 means the rest of the frame is zlib-compressed.

mod decoder;
mod encoder;
mod node;
mod token;

use std::io::Read;

use flate2::read::ZlibDecoder;

pub use decoder::{decode, DecodeError, Decoder, MAX_DEPTH};
pub use encoder::{encode, EncodeError, Encoder};
pub use node::*;
pub use token::{get_double_token, get_double_token_index, get_token, get_token_index, DICT_VERSION};

/// Marker bytes of the binary format.
pub mod tags {
    pub const LIST_EMPTY: u8 = 0;
    pub const STREAM_END: u8 = 2;
    pub const DICTIONARY_0: u8 = 236;
    pub const DICTIONARY_1: u8 = 237;
    pub const DICTIONARY_2: u8 = 238;
    pub const DICTIONARY_3: u8 = 239;
    pub const INTEROP_JID: u8 = 245;
    pub const FB_JID: u8 = 246;
    pub const AD_JID: u8 = 247;
    pub const LIST_8: u8 = 248;
    pub const LIST_16: u8 = 249;
    pub const JID_PAIR: u8 = 250;
    pub const HEX_8: u8 = 251;
    pub const BINARY_8: u8 = 252;
    pub const BINARY_20: u8 = 253;
    pub const BINARY_32: u8 = 254;
    pub const NIBBLE_8: u8 = 255;
}

const FLAG_COMPRESSED: u8 = 2;

/// Encode a node into a frame payload with an empty flags header.
pub fn marshal(node: &Node) -> Result<Vec<u8>, EncodeError> {
    let body = encode(node)?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(0);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a frame payload, inflating it first when the compressed flag is set.
pub fn unmarshal(data: &[u8]) -> Result<Node, DecodeError> {
    let (&flags, body) = data.split_first().ok_or(DecodeError::Truncated(0))?;
    if flags & FLAG_COMPRESSED != 0 {
        let mut inflated = Vec::new();
        ZlibDecoder::new(body)
            .read_to_end(&mut inflated)
            .map_err(|e| DecodeError::Decompress(e.to_string()))?;
        decode(&inflated)
    } else {
        decode(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Jid;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn test_marshal_roundtrip() {
        let node = Node::new("presence").attr("type", "available");
        let frame = marshal(&node).unwrap();
        assert_eq!(frame[0], 0);
        assert_eq!(unmarshal(&frame).unwrap(), node);
    }

    #[test]
    fn test_unmarshal_compressed() {
        let node = Node::new("ib").children(vec![Node::new("offline").attr("count", 3i64)]);
        let mut z = ZlibEncoder::new(Vec::new(), Compression::default());
        z.write_all(&encode(&node).unwrap()).unwrap();
        let mut frame = vec![FLAG_COMPRESSED];
        frame.extend(z.finish().unwrap());
        assert_eq!(unmarshal(&frame).unwrap(), node);
    }

    #[test]
    fn test_unmarshal_bad_zlib() {
        assert!(matches!(
            unmarshal(&[FLAG_COMPRESSED, 1, 2, 3]),
            Err(DecodeError::Decompress(_))
        ));
        assert!(unmarshal(&[]).is_err());
    }

    fn attr_value() -> impl Strategy<Value = AttrValue> {
        prop_oneof![
            "[a-z0-9_.:@ -]{0,40}".prop_map(AttrValue::String),
            "[0-9]{1,18}".prop_map(AttrValue::String),
            "[0-9A-F]{1,30}".prop_map(AttrValue::String),
            any::<i64>().prop_map(AttrValue::Numeric),
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(AttrValue::Binary),
            jid().prop_map(AttrValue::Jid),
        ]
    }

    fn jid() -> impl Strategy<Value = Jid> {
        let server = prop_oneof![
            Just("s.whatsapp.net"),
            Just("g.us"),
            Just("lid"),
            Just("hosted"),
            Just("hosted.lid"),
            Just("broadcast"),
        ];
        ("[0-9]{1,15}", any::<u8>(), prop_oneof![0u16..4, any::<u16>()], server).prop_map(
            |(user, agent, device, server)| Jid {
                user,
                agent,
                device,
                server: server.to_string(),
            },
        )
    }

    #[test]
    fn test_colliding_agent_keeps_its_server() {
        for agent in [crate::types::LID_DOMAIN, crate::types::HOSTED_DOMAIN, crate::types::HOSTED_LID_DOMAIN] {
            let jid = Jid {
                user: "123".into(),
                agent,
                device: 0,
                server: "s.whatsapp.net".into(),
            };
            let node = Node::new("receipt").attr("from", jid.clone());
            let decoded = decode(&encode(&node).unwrap()).unwrap();
            assert_eq!(decoded, node);
            assert_eq!(decoded.get_attr_jid("from"), Some(jid));
        }
    }

    #[test]
    fn test_device_on_group_server_survives_as_text() {
        let jid: Jid = "123-456:3@g.us".parse().unwrap();
        let node = Node::new("message").attr("participant", jid.clone());
        let decoded = decode(&encode(&node).unwrap()).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.get_attr_jid("participant"), Some(jid));
    }

    fn node_strategy() -> impl Strategy<Value = Node> {
        let leaf = (
            "[a-z_]{1,12}",
            proptest::collection::vec(("[a-z_]{1,10}", attr_value()), 0..4),
            proptest::option::of(proptest::collection::vec(any::<u8>(), 0..300)),
        )
            .prop_map(|(tag, attrs, bytes)| Node {
                tag,
                attrs: attrs.into_iter().collect(),
                content: bytes.map_or(NodeContent::None, NodeContent::Bytes),
            });
        leaf.prop_recursive(4, 32, 6, |inner| {
            (
                "[a-z_]{1,12}",
                proptest::collection::vec(("[a-z_]{1,10}", attr_value()), 0..3),
                proptest::collection::vec(inner, 0..6),
            )
                .prop_map(|(tag, attrs, children)| Node {
                    tag,
                    attrs: attrs.into_iter().collect(),
                    content: NodeContent::Children(children),
                })
        })
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(node in node_strategy()) {
            prop_assert_eq!(decode(&encode(&node).unwrap()).unwrap(), node);
        }

        #[test]
        fn prop_arbitrary_input_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = unmarshal(&data);
        }
    }
}
