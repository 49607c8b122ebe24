//! Message model: header, parent linkage, opaque content, binary buffers.
//!
//! Content is deliberately an untyped JSON tree; the wire layer never
//! interprets it. Typed views over specific message types live at the
//! client boundary.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Protocol version stamped into outbound headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// True for any version this client can talk to (any 5.x).
pub fn version_supported(version: &str) -> bool {
    version == "5" || version.starts_with("5.")
}

/// A header timestamp.
///
/// Emitted as UTC ISO-8601 with microsecond precision and a trailing `Z`.
/// An inbound value that does not parse as ISO-8601 is carried through as
/// the raw string rather than failing the whole message.
#[derive(Debug, Clone, PartialEq)]
pub enum Timestamp {
    Parsed(DateTime<Utc>),
    Raw(String),
}

impl Timestamp {
    /// Current instant, truncated to microsecond resolution so the value
    /// round-trips exactly through its wire form.
    pub fn now() -> Self {
        let micros = Utc::now().timestamp_micros();
        match DateTime::from_timestamp_micros(micros) {
            Some(dt) => Self::Parsed(dt),
            None => Self::Raw(String::new()),
        }
    }

    /// Parse an incoming value, tolerating unparseable strings.
    pub fn parse(raw: &str) -> Self {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(dt) => Self::Parsed(dt.with_timezone(&Utc)),
            Err(_) => Self::Raw(raw.to_string()),
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Parsed(dt) => Some(*dt),
            Self::Raw(_) => None,
        }
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::Raw(String::new())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Parsed(dt) => {
                serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            Self::Raw(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Message header. Every reply and every broadcast produced while handling
/// a request carries the originating request's header as its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub date: Timestamp,
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
}

impl Header {
    pub fn new(
        msg_type: impl Into<String>,
        session: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            session: session.into(),
            username: username.into(),
            date: Timestamp::now(),
            msg_type: msg_type.into(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// A parsed protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    /// Empty for spontaneous messages; otherwise a previously emitted header.
    pub parent_header: Option<Header>,
    /// Arbitrary mapping; always a JSON object.
    pub metadata: Value,
    /// Opaque content tree; interpreted only at the client boundary.
    pub content: Value,
    /// Binary buffers, preserved bit-exact.
    pub buffers: Vec<Vec<u8>>,
}

impl Message {
    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    /// True when this message was produced while handling `request_id`.
    pub fn is_child_of(&self, request_id: &str) -> bool {
        self.parent_msg_id() == Some(request_id)
    }

    /// Serialize the four signed parts in signing order.
    pub fn serialize_parts(&self) -> serde_json::Result<[Vec<u8>; 4]> {
        let header = serde_json::to_vec(&self.header)?;
        let parent = match &self.parent_header {
            Some(h) => serde_json::to_vec(h)?,
            None => b"{}".to_vec(),
        };
        let metadata = serde_json::to_vec(&self.metadata)?;
        let content = serde_json::to_vec(&self.content)?;
        Ok([header, parent, metadata, content])
    }

    /// Parse a parent-header part: an empty object means "no parent".
    pub fn parse_parent(bytes: &[u8]) -> serde_json::Result<Option<Header>> {
        let value: Value = serde_json::from_slice(bytes)?;
        match &value {
            Value::Object(map) if map.is_empty() => Ok(None),
            _ => Ok(Some(serde_json::from_value(value)?)),
        }
    }
}
