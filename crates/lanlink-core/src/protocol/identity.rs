//! Typed view of the identity packet.
//!
//! The identity packet is the only packet this workspace understands: it is
//! broadcast over UDP to announce a device and it must be the first line on
//! every TCP session.

use thiserror::Error;

use crate::protocol::packet::{NetworkPacket, PACKET_TYPE_IDENTITY};

/// Version of the link protocol advertised in `protocolVersion`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Errors produced when a packet cannot be read as an identity packet.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("expected an identity packet, got type {0:?}")]
    WrongType(String),
    #[error("identity packet is missing required field {0:?}")]
    MissingField(&'static str),
    #[error("identity packet field {field:?} is out of range: {value}")]
    OutOfRange { field: &'static str, value: u64 },
}

/// A device's announcement of itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPacket {
    /// Stable identifier of the device; links are deduplicated on this.
    pub device_id: String,
    /// Human-readable display name.
    pub device_name: String,
    pub device_type: Option<String>,
    pub protocol_version: Option<u32>,
    /// TCP port the device accepts links on, if it differs from the well-known port.
    pub tcp_port: Option<u16>,
    pub incoming_capabilities: Vec<String>,
    pub outgoing_capabilities: Vec<String>,
}

impl IdentityPacket {
    /// Creates an identity with only the required fields and the current protocol version.
    pub fn new(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type: None,
            protocol_version: Some(PROTOCOL_VERSION),
            tcp_port: None,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
        }
    }

    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = Some(port);
        self
    }

    /// Builds the wire packet for this identity.
    pub fn to_packet(&self) -> NetworkPacket {
        let mut packet = NetworkPacket::new(PACKET_TYPE_IDENTITY);
        packet
            .set("deviceId", self.device_id.as_str())
            .set("deviceName", self.device_name.as_str());
        if let Some(device_type) = &self.device_type {
            packet.set("deviceType", device_type.as_str());
        }
        if let Some(version) = self.protocol_version {
            packet.set("protocolVersion", version);
        }
        if let Some(port) = self.tcp_port {
            packet.set("tcpPort", port);
        }
        if !self.incoming_capabilities.is_empty() {
            packet.set("incomingCapabilities", self.incoming_capabilities.clone());
        }
        if !self.outgoing_capabilities.is_empty() {
            packet.set("outgoingCapabilities", self.outgoing_capabilities.clone());
        }
        packet
    }
}

impl TryFrom<&NetworkPacket> for IdentityPacket {
    type Error = IdentityError;

    fn try_from(packet: &NetworkPacket) -> Result<Self, Self::Error> {
        if !packet.is_identity() {
            return Err(IdentityError::WrongType(packet.packet_type().to_string()));
        }

        let device_id = packet
            .get_str("deviceId")
            .filter(|id| !id.is_empty())
            .ok_or(IdentityError::MissingField("deviceId"))?;
        let device_name = packet
            .get_str("deviceName")
            .ok_or(IdentityError::MissingField("deviceName"))?;

        let protocol_version = match packet.get_u64("protocolVersion") {
            Some(v) => Some(u32::try_from(v).map_err(|_| IdentityError::OutOfRange {
                field: "protocolVersion",
                value: v,
            })?),
            None => None,
        };
        let tcp_port = match packet.get_u64("tcpPort") {
            Some(v) => Some(u16::try_from(v).map_err(|_| IdentityError::OutOfRange {
                field: "tcpPort",
                value: v,
            })?),
            None => None,
        };

        Ok(Self {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            device_type: packet.get_str("deviceType").map(str::to_string),
            protocol_version,
            tcp_port,
            incoming_capabilities: packet
                .get_string_list("incomingCapabilities")
                .unwrap_or_default(),
            outgoing_capabilities: packet
                .get_string_list("outgoingCapabilities")
                .unwrap_or_default(),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_survives_packet_conversion() {
        // Arrange
        let mut identity = IdentityPacket::new("A", "Phone")
            .with_device_type("phone")
            .with_tcp_port(1716);
        identity.incoming_capabilities = vec!["ping".to_string()];

        // Act
        let packet = identity.to_packet();
        let text = packet.serialize().unwrap();
        let decoded = NetworkPacket::deserialize(&text).unwrap();
        let restored = IdentityPacket::try_from(&decoded).unwrap();

        // Assert
        assert_eq!(restored, identity);
    }

    #[test]
    fn test_to_packet_uses_identity_type() {
        let packet = IdentityPacket::new("A", "Phone").to_packet();
        assert!(packet.is_identity());
        assert_eq!(packet.get_u64("protocolVersion"), Some(PROTOCOL_VERSION as u64));
    }

    #[test]
    fn test_try_from_rejects_other_packet_types() {
        let packet = NetworkPacket::new("ping");
        assert_eq!(
            IdentityPacket::try_from(&packet),
            Err(IdentityError::WrongType("ping".to_string()))
        );
    }

    #[test]
    fn test_try_from_requires_device_id() {
        let packet = NetworkPacket::new(PACKET_TYPE_IDENTITY).with("deviceName", "Phone");
        assert_eq!(
            IdentityPacket::try_from(&packet),
            Err(IdentityError::MissingField("deviceId"))
        );
    }

    #[test]
    fn test_try_from_rejects_empty_device_id() {
        let packet = NetworkPacket::new(PACKET_TYPE_IDENTITY)
            .with("deviceId", "")
            .with("deviceName", "Phone");
        assert_eq!(
            IdentityPacket::try_from(&packet),
            Err(IdentityError::MissingField("deviceId"))
        );
    }

    #[test]
    fn test_try_from_requires_device_name() {
        let packet = NetworkPacket::new(PACKET_TYPE_IDENTITY).with("deviceId", "A");
        assert_eq!(
            IdentityPacket::try_from(&packet),
            Err(IdentityError::MissingField("deviceName"))
        );
    }

    #[test]
    fn test_try_from_accepts_empty_device_name() {
        let packet = NetworkPacket::new(PACKET_TYPE_IDENTITY)
            .with("deviceId", "A")
            .with("deviceName", "");

        let identity = IdentityPacket::try_from(&packet).unwrap();

        assert_eq!(identity.device_id, "A");
        assert_eq!(identity.device_name, "");
    }

    #[test]
    fn test_try_from_rejects_port_out_of_range() {
        let packet = NetworkPacket::new(PACKET_TYPE_IDENTITY)
            .with("deviceId", "A")
            .with("deviceName", "Phone")
            .with("tcpPort", 70_000);
        assert_eq!(
            IdentityPacket::try_from(&packet),
            Err(IdentityError::OutOfRange {
                field: "tcpPort",
                value: 70_000
            })
        );
    }

    #[test]
    fn test_optional_fields_default_when_absent() {
        let packet = NetworkPacket::new(PACKET_TYPE_IDENTITY)
            .with("deviceId", "A")
            .with("deviceName", "Phone");

        let identity = IdentityPacket::try_from(&packet).unwrap();

        assert_eq!(identity.device_type, None);
        assert_eq!(identity.protocol_version, None);
        assert_eq!(identity.tcp_port, None);
        assert!(identity.incoming_capabilities.is_empty());
    }
}
