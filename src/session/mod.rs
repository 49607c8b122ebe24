//! Session - message construction, signing, parsing, verification.
//!
//! A session scopes identifier uniqueness: it mints one session id at
//! construction and a fresh message id per message. Signing covers the four
//! JSON parts in order, over the exact bytes sent; verification recomputes
//! the HMAC and compares in constant time.

use std::collections::{HashSet, VecDeque};

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::channels::{Channel, ChannelSocket};
use crate::types::{Error, Result, SessionConfig};

pub mod message;
pub mod wire;

pub use message::{version_supported, Header, Message, Timestamp, PROTOCOL_VERSION};
pub use wire::{read_multipart, write_multipart, WireFrame, DELIMITER};

type HmacSha256 = Hmac<Sha256>;

/// The only keyed scheme this client speaks.
pub const SCHEME_HMAC_SHA256: &str = "hmac-sha256";

/// Message factory and signer for one connection.
#[derive(Debug, Clone)]
pub struct Session {
    session_id: String,
    username: String,
    key: Vec<u8>,
}

impl Session {
    /// Build a session for a key and scheme.
    ///
    /// An empty key (with an empty scheme) disables signing and
    /// verification entirely. This is insecure: anything that can reach
    /// the sockets can then forge traffic. It exists for same-host
    /// contexts that are already secured by other means.
    pub fn new(key: &str, scheme: &str, config: &SessionConfig) -> Result<Self> {
        match scheme {
            "" | SCHEME_HMAC_SHA256 => {}
            other => {
                return Err(Error::validation(format!(
                    "unsupported signature scheme {:?}",
                    other
                )))
            }
        }
        if !scheme.is_empty() && key.is_empty() {
            return Err(Error::validation("signature scheme set but key is empty"));
        }

        let username = config
            .username
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| "kernel".to_string());

        Ok(Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            username,
            key: key.as_bytes().to_vec(),
        })
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Build an outbound message with a fresh id and no parent.
    pub fn msg(&self, msg_type: impl Into<String>, content: Value) -> Message {
        Message {
            header: Header::new(msg_type, self.session_id.clone(), self.username.clone()),
            parent_header: None,
            metadata: Value::Object(Default::default()),
            content,
            buffers: Vec::new(),
        }
    }

    /// Build a reply carrying `parent` as its parent header.
    pub fn reply(&self, parent: &Header, msg_type: impl Into<String>, content: Value) -> Message {
        Message {
            parent_header: Some(parent.clone()),
            ..self.msg(msg_type, content)
        }
    }

    /// Hex HMAC over the four signed parts; empty when signing is off.
    pub fn sign(&self, parts: [&[u8]; 4]) -> String {
        if self.key.is_empty() {
            return String::new();
        }
        // Key length is unconstrained for HMAC; new_from_slice cannot fail.
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        for part in parts {
            mac.update(part);
        }
        hex::encode(mac.finalize().into_bytes())
    }

    /// Serialize a message into ordered wire parts, signed.
    pub fn serialize(&self, msg: &Message) -> Result<Vec<Vec<u8>>> {
        let [header, parent, metadata, content] = msg.serialize_parts()?;
        let signature = self.sign([&header, &parent, &metadata, &content]);
        let frame = WireFrame {
            identities: Vec::new(),
            signature,
            header,
            parent_header: parent,
            metadata,
            content,
            buffers: msg.buffers.clone(),
        };
        Ok(frame.assemble())
    }

    /// Parse and verify a received frame into a message.
    ///
    /// With a key set, a signature mismatch fails with `InvalidSignature`
    /// and the message must be dropped, never delivered. When `history` is
    /// supplied (shell receive path), a previously seen signature fails
    /// with `DuplicateSignature`; broadcast channels pass `None`.
    pub fn deserialize(
        &self,
        parts: Vec<Vec<u8>>,
        channel: Channel,
        history: Option<&mut DigestHistory>,
    ) -> Result<Message> {
        let frame = WireFrame::split(parts, channel)?;

        if !self.key.is_empty() {
            let expected = self.sign(frame.signable_parts());
            let matches: bool = expected
                .as_bytes()
                .ct_eq(frame.signature.as_bytes())
                .into();
            if !matches {
                return Err(Error::invalid_signature(
                    channel,
                    format!("hmac mismatch ({} byte signature)", frame.signature.len()),
                ));
            }
            if let Some(history) = history {
                if !history.observe(&frame.signature) {
                    return Err(Error::duplicate_signature(channel, frame.signature));
                }
            }
        }

        let header: Header = serde_json::from_slice(&frame.header)
            .map_err(|e| Error::malformed_frame(channel, format!("bad header: {}", e)))?;
        let parent_header = Message::parse_parent(&frame.parent_header)
            .map_err(|e| Error::malformed_frame(channel, format!("bad parent header: {}", e)))?;
        let metadata: Value = serde_json::from_slice(&frame.metadata)
            .map_err(|e| Error::malformed_frame(channel, format!("bad metadata: {}", e)))?;
        let content: Value = serde_json::from_slice(&frame.content)
            .map_err(|e| Error::malformed_frame(channel, format!("bad content: {}", e)))?;

        Ok(Message {
            header,
            parent_header,
            metadata,
            content,
            buffers: frame.buffers,
        })
    }

    /// Sign and send a message on a channel socket.
    pub async fn send(&self, socket: &mut ChannelSocket, msg: &Message) -> Result<()> {
        let parts = self.serialize(msg)?;
        socket.send(&parts).await
    }

    /// Receive, parse, and verify the next message from a socket.
    /// `None` means the peer closed cleanly.
    pub async fn recv(
        &self,
        socket: &mut ChannelSocket,
        history: Option<&mut DigestHistory>,
    ) -> Result<Option<Message>> {
        match socket.recv().await? {
            Some(parts) => Ok(Some(self.deserialize(parts, socket.channel(), history)?)),
            None => Ok(None),
        }
    }
}

/// Bounded FIFO of recently seen signatures.
///
/// Accessed from the shell receive task only; iopub is a broadcast channel
/// and is never deduplicated.
#[derive(Debug)]
pub struct DigestHistory {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DigestHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn with_config(config: &SessionConfig) -> Self {
        Self::new(config.digest_history_size)
    }

    /// Record a signature. Returns false when it was already present.
    /// Empty signatures (signing disabled) are never recorded.
    pub fn observe(&mut self, signature: &str) -> bool {
        if signature.is_empty() {
            return true;
        }
        if !self.seen.insert(signature.to_string()) {
            return false;
        }
        self.order.push_back(signature.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
