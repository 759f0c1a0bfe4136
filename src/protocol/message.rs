//! Encrypted message nodes.
//!
//! Outbound plaintexts are padded, encrypted by the [`SessionManager`] and
//! wrapped in `enc` children of a `message` node. Inbound `message` nodes
//! are routed the other way: `pkmsg`/`msg` payloads through the pairwise
//! session with the sender, `skmsg` payloads through the sender's group key.
//! In a group message the pairwise payload carries the sender key
//! distribution that the `skmsg` next to it depends on.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use log::{debug, warn};
use rand::Rng;

use crate::binary::Node;
use crate::signal::{pad_message, unpad_message, Ciphertext, SessionError, SessionManager};
use crate::types::{DecryptedMessage, DeviceAddress, Event, EventHandlers, Jid};

/// Version attribute carried by every `enc` node.
pub const ENC_VERSION: &str = "2";

/// Errors raised while routing a message node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("malformed message node: {0}")]
    Malformed(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A message id in the format official clients use.
pub fn generate_message_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    format!("3EB0{}", hex::encode_upper(bytes))
}

/// One `enc` child of a message node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncPayload {
    Pairwise(Ciphertext),
    SenderKey(Vec<u8>),
}

impl EncPayload {
    pub fn to_node(&self) -> Node {
        let (enc_type, bytes) = match self {
            EncPayload::Pairwise(c) => (c.enc_type(), c.as_bytes()),
            EncPayload::SenderKey(bytes) => ("skmsg", bytes.as_slice()),
        };
        Node::new("enc")
            .attr("v", ENC_VERSION)
            .attr("type", enc_type)
            .bytes(bytes.to_vec())
    }

    pub fn from_node(node: &Node) -> Result<Self, MessageError> {
        if node.tag != "enc" {
            return Err(MessageError::Malformed(format!("expected enc, got {}", node.tag)));
        }
        let enc_type = node
            .get_attr_str("type")
            .ok_or_else(|| MessageError::Malformed("enc without type".into()))?;
        let bytes = node
            .get_bytes()
            .ok_or_else(|| MessageError::Malformed("enc without payload".into()))?
            .to_vec();
        if enc_type == "skmsg" {
            return Ok(EncPayload::SenderKey(bytes));
        }
        Ciphertext::from_enc(enc_type, bytes)
            .map(EncPayload::Pairwise)
            .ok_or_else(|| MessageError::Malformed(format!("unknown enc type {enc_type}")))
    }
}

/// Encrypts outbound messages and decrypts inbound ones.
pub struct MessageRouter {
    sessions: Arc<SessionManager>,
    handlers: EventHandlers,
}

impl MessageRouter {
    pub fn new(sessions: Arc<SessionManager>, handlers: EventHandlers) -> Self {
        Self { sessions, handlers }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// A `message` node for one device.
    pub async fn encrypt_direct(&self, to: &Jid, plaintext: &[u8]) -> Result<Node, MessageError> {
        let ciphertext = self
            .sessions
            .encrypt(&to.device_address(), &pad_message(plaintext))
            .await?;
        Ok(Node::new("message")
            .attr("id", generate_message_id())
            .attr("type", "text")
            .attr("to", to.clone())
            .children(vec![EncPayload::Pairwise(ciphertext).to_node()]))
    }

    /// A `message` node for a group. Members that lack the current sender
    /// key get it in a `participants` list.
    pub async fn encrypt_group(
        &self,
        group: &Jid,
        local: &DeviceAddress,
        members: &[Jid],
        plaintext: &[u8],
    ) -> Result<Node, MessageError> {
        let addresses: Vec<DeviceAddress> = members.iter().map(Jid::device_address).collect();
        let encryption = self
            .sessions
            .group_encrypt(&group.to_string(), local, &addresses, &pad_message(plaintext))
            .await?;

        let mut children = Vec::with_capacity(2);
        if !encryption.distributions.is_empty() {
            let participants = encryption
                .distributions
                .into_iter()
                .filter_map(|(address, ciphertext)| {
                    let jid = members.iter().find(|m| m.device_address() == address)?;
                    Some(
                        Node::new("to")
                            .attr("jid", jid.clone())
                            .children(vec![EncPayload::Pairwise(ciphertext).to_node()]),
                    )
                })
                .collect();
            children.push(Node::new("participants").children(participants));
        }
        children.push(EncPayload::SenderKey(encryption.ciphertext).to_node());
        Ok(Node::new("message")
            .attr("id", generate_message_id())
            .attr("type", "text")
            .attr("to", group.clone())
            .children(children))
    }

    /// Decrypt an inbound `message` node and dispatch the result. Returns
    /// `None` when the node carried only a sender key distribution.
    pub async fn handle_message(&self, node: &Node) -> Result<Option<DecryptedMessage>, MessageError> {
        if node.tag != "message" {
            return Err(MessageError::Malformed(format!("expected message, got {}", node.tag)));
        }
        let id = node
            .get_attr_str("id")
            .ok_or_else(|| MessageError::Malformed("message without id".into()))?
            .to_string();
        let chat = node
            .get_attr_jid("from")
            .ok_or_else(|| MessageError::Malformed("message without sender".into()))?;
        let sender_jid = if chat.is_group() {
            node.get_attr_jid("participant")
                .ok_or_else(|| MessageError::Malformed("group message without participant".into()))?
        } else {
            chat.clone()
        };
        let sender = sender_jid.device_address();
        let timestamp = node
            .get_attr_i64("t")
            .and_then(|t| Utc.timestamp_opt(t, 0).single())
            .unwrap_or_else(Utc::now);

        let mut body = None;
        for enc in node.get_children_by_tag("enc") {
            match EncPayload::from_node(enc)? {
                EncPayload::Pairwise(ciphertext) => {
                    let plaintext = self.sessions.decrypt(&sender, &ciphertext).await?;
                    if chat.is_group() {
                        // Distribution messages travel unpadded.
                        self.sessions
                            .process_sender_key_distribution(&chat.to_string(), &sender, &plaintext)
                            .await?;
                    } else {
                        body = Some(unpad_message(&plaintext)?.to_vec());
                    }
                }
                EncPayload::SenderKey(bytes) => {
                    if !chat.is_group() {
                        warn!("Ignoring skmsg outside a group from {sender}");
                        continue;
                    }
                    let padded = self.sessions.group_decrypt(&chat.to_string(), &sender, &bytes).await?;
                    body = Some(unpad_message(&padded)?.to_vec());
                }
            }
        }

        let Some(plaintext) = body else {
            debug!("Message {id} from {sender} carried no body");
            return Ok(None);
        };
        let message = DecryptedMessage {
            id,
            chat,
            sender,
            plaintext,
            timestamp,
        };
        self.handlers.dispatch(&Event::Message(message.clone()));
        Ok(Some(message))
    }
}

/// Rewrite an outbound node as the server would deliver it to `recipient`,
/// with `from` set to the sending device. Used by loopback tests.
pub fn deliver_as_server(outbound: &Node, from: &Jid, recipient: &Jid) -> Node {
    let to = outbound.get_attr_jid("to").unwrap_or_default();
    let mut delivered = Node::new("message")
        .attr("id", outbound.get_attr_str("id").unwrap_or_default())
        .attr("t", Utc::now().timestamp());
    let mut encs: Vec<Node> = Vec::new();
    if to.is_group() {
        delivered = delivered.attr("from", to).attr("participant", from.clone());
        if let Some(own) = outbound
            .get_child_by_tag("participants")
            .and_then(|p| p.get_children_by_tag("to").find(|t| t.get_attr_jid("jid").as_ref() == Some(recipient)))
        {
            encs.extend(own.get_children_by_tag("enc").cloned());
        }
    } else {
        delivered = delivered.attr("from", from.clone());
    }
    encs.extend(outbound.get_children_by_tag("enc").cloned());
    delivered.children(encs)
}
