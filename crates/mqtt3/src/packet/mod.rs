//! Control packet model: the type nibble, the fixed header, and the
//! decoded form of every inbound packet.

pub mod build;
pub mod parse;

use bytes::Bytes;

use crate::error::{MqttError, Result};
use crate::flags;
use crate::types::{ConnectRequest, ConnectReturnCode, PublishEvent, QoS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// Maps the high nibble of the first packet byte.
    pub fn try_from_byte(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Connect),
            2 => Ok(Self::ConnAck),
            3 => Ok(Self::Publish),
            4 => Ok(Self::PubAck),
            5 => Ok(Self::PubRec),
            6 => Ok(Self::PubRel),
            7 => Ok(Self::PubComp),
            8 => Ok(Self::Subscribe),
            9 => Ok(Self::SubAck),
            10 => Ok(Self::Unsubscribe),
            11 => Ok(Self::UnsubAck),
            12 => Ok(Self::PingReq),
            13 => Ok(Self::PingResp),
            14 => Ok(Self::Disconnect),
            other => Err(MqttError::InvalidPacketType(other)),
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// First byte of every control packet: type nibble plus flag nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
}

impl FixedHeader {
    /// Decodes and validates the flag nibble for the packet type.
    /// PUBLISH accepts dup/qos/retain but a QoS of 3 is a protocol
    /// error; SUBSCRIBE, UNSUBSCRIBE, and PUBREL require `0b0010`; every
    /// other type requires zero.
    pub fn parse(byte: u8) -> Result<Self> {
        let packet_type = PacketType::try_from_byte(byte >> 4)?;
        let header_flags = byte & 0x0F;
        match packet_type {
            PacketType::Publish => {
                if header_flags & flags::PUBLISH_QOS_MASK == flags::PUBLISH_QOS_MASK {
                    return Err(MqttError::Protocol("PUBLISH QoS bits set to 3"));
                }
            }
            PacketType::Subscribe | PacketType::Unsubscribe | PacketType::PubRel => {
                if header_flags != 0x02 {
                    return Err(MqttError::Protocol("reserved flag bits must be 0b0010"));
                }
            }
            _ => {
                if header_flags != 0 {
                    return Err(MqttError::Protocol("reserved flag bits must be zero"));
                }
            }
        }
        Ok(Self {
            packet_type,
            flags: header_flags,
        })
    }

    #[must_use]
    pub fn byte(self) -> u8 {
        (self.packet_type.as_u8() << 4) | self.flags
    }

    /// PUBLISH QoS level from the flag nibble.
    #[must_use]
    pub fn qos(self) -> QoS {
        match (self.flags & flags::PUBLISH_QOS_MASK) >> 1 {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }

    #[must_use]
    pub fn dup(self) -> bool {
        self.flags & flags::PUBLISH_DUP != 0
    }

    #[must_use]
    pub fn retain(self) -> bool {
        self.flags & flags::PUBLISH_RETAIN != 0
    }
}

/// A fully parsed inbound control packet.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(ConnectRequest),
    ConnAck {
        session_present: bool,
        return_code: ConnectReturnCode,
    },
    Publish(PublishEvent),
    PubAck {
        packet_id: u16,
    },
    PubRec {
        packet_id: u16,
    },
    PubRel {
        packet_id: u16,
    },
    PubComp {
        packet_id: u16,
    },
    Subscribe {
        packet_id: u16,
        entries: Vec<(String, QoS)>,
    },
    SubAck {
        packet_id: u16,
        return_codes: Vec<Option<QoS>>,
    },
    Unsubscribe {
        packet_id: u16,
        topics: Vec<String>,
    },
    UnsubAck {
        packet_id: u16,
    },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Parses the payload of one control packet.
    pub fn parse(header: &FixedHeader, body: Bytes) -> Result<Self> {
        parse::packet(header, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_round_trip() {
        for value in 1..=14u8 {
            let packet_type = PacketType::try_from_byte(value).unwrap();
            assert_eq!(packet_type.as_u8(), value);
        }
        assert!(PacketType::try_from_byte(0).is_err());
        assert!(PacketType::try_from_byte(15).is_err());
    }

    #[test]
    fn test_fixed_header_byte_round_trip() {
        let header = FixedHeader::parse(0x32).unwrap();
        assert_eq!(header.packet_type, PacketType::Publish);
        assert_eq!(header.qos(), QoS::AtLeastOnce);
        assert!(!header.dup());
        assert!(!header.retain());
        assert_eq!(header.byte(), 0x32);
    }

    #[test]
    fn test_publish_flag_accessors() {
        let header = FixedHeader::parse(0x3D).unwrap();
        assert_eq!(header.qos(), QoS::ExactlyOnce);
        assert!(header.dup());
        assert!(header.retain());
    }

    #[test]
    fn test_publish_qos_three_rejected() {
        assert!(matches!(
            FixedHeader::parse(0x36),
            Err(MqttError::Protocol(_))
        ));
    }

    #[test]
    fn test_reserved_flags_enforced() {
        // PUBREL, SUBSCRIBE, UNSUBSCRIBE carry 0b0010.
        assert!(FixedHeader::parse(0x62).is_ok());
        assert!(FixedHeader::parse(0x82).is_ok());
        assert!(FixedHeader::parse(0xA2).is_ok());
        assert!(FixedHeader::parse(0x60).is_err());
        assert!(FixedHeader::parse(0x80).is_err());

        // Everything else carries zero.
        assert!(FixedHeader::parse(0x40).is_ok());
        assert!(FixedHeader::parse(0x41).is_err());
        assert!(FixedHeader::parse(0xC0).is_ok());
        assert!(FixedHeader::parse(0xC1).is_err());
    }
}
