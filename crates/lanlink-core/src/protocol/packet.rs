//! The JSON packet envelope exchanged over both UDP and TCP.
//!
//! Wire format (one packet per line):
//! ```text
//! {"id":1718000000000,"type":"identity","body":{"deviceId":"a1","deviceName":"Phone"}}\n
//! ```
//!
//! The envelope is deliberately schemaless: `body` is a free-form JSON object
//! and callers read fields through the typed accessors.  Only the identity
//! packet gets a dedicated struct (see [`crate::protocol::identity`]).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// `type` value of the identity packet.
pub const PACKET_TYPE_IDENTITY: &str = "identity";

/// Errors that can occur while encoding or decoding a packet.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The text is not a JSON object with the expected envelope fields.
    #[error("malformed packet: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The envelope parsed but its `type` is empty.
    #[error("packet has an empty type")]
    EmptyType,
}

/// One application packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkPacket {
    /// Creation time in milliseconds since the Unix epoch.
    #[serde(default)]
    id: i64,
    #[serde(rename = "type")]
    packet_type: String,
    #[serde(default)]
    body: Map<String, Value>,
}

impl NetworkPacket {
    /// Creates an empty packet of the given type stamped with the current time.
    pub fn new(packet_type: impl Into<String>) -> Self {
        Self {
            id: current_timestamp_ms(),
            packet_type: packet_type.into(),
            body: Map::new(),
        }
    }

    /// Decodes one packet from its text form (without the trailing `\n`).
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Malformed`] for anything that is not a JSON
    /// envelope, and [`PacketError::EmptyType`] when `type` is `""`.
    pub fn deserialize(text: &str) -> Result<Self, PacketError> {
        Self::from_slice(text.as_bytes())
    }

    /// Decodes one packet from raw line bytes.
    ///
    /// Invalid UTF-8 is reported as [`PacketError::Malformed`].
    ///
    /// # Errors
    ///
    /// Same as [`NetworkPacket::deserialize`].
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PacketError> {
        let packet: NetworkPacket = serde_json::from_slice(bytes)?;
        if packet.packet_type.is_empty() {
            return Err(PacketError::EmptyType);
        }
        Ok(packet)
    }

    /// Encodes the packet as compact JSON.
    ///
    /// Compact JSON escapes control characters inside strings, so the result
    /// never contains a raw `\n` and is safe to frame by newline.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Malformed`] if serialization fails.
    pub fn serialize(&self) -> Result<String, PacketError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Encodes the packet followed by the `\n` delimiter.
    ///
    /// # Errors
    ///
    /// Same as [`NetworkPacket::serialize`].
    pub fn to_line(&self) -> Result<String, PacketError> {
        let mut line = self.serialize()?;
        line.push('\n');
        Ok(line)
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn packet_type(&self) -> &str {
        &self.packet_type
    }

    /// Returns `true` if this is an identity packet.
    pub fn is_identity(&self) -> bool {
        self.packet_type == PACKET_TYPE_IDENTITY
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.body.get(key).and_then(Value::as_i64)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.body.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(Value::as_bool)
    }

    /// Reads an array of strings, skipping non-string elements.
    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        self.body.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
    }

    /// Sets a body field, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.body.insert(key.into(), value.into());
        self
    }

    /// Builder-style variant of [`NetworkPacket::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }
}

/// Returns the current time as milliseconds since the Unix epoch.
fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
