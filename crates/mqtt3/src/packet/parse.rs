//! Payload parsers, one per control packet type. Every length prefix is
//! bounds-checked against the bytes actually read; nothing here trusts
//! the remaining-length field beyond the buffer it produced.

use bytes::{Buf, Bytes};

use crate::constants::{PROTOCOL_LEVEL, PROTOCOL_NAME};
use crate::encoding::{decode_binary, decode_string};
use crate::error::{MqttError, Result};
use crate::flags;
use crate::packet::{FixedHeader, Packet, PacketType};
use crate::types::{ConnectRequest, ConnectReturnCode, PublishEvent, QoS, Will};

/// Parses the payload of one control packet.
pub fn packet(header: &FixedHeader, body: Bytes) -> Result<Packet> {
    match header.packet_type {
        PacketType::Connect => connect(body),
        PacketType::ConnAck => connack(&body),
        PacketType::Publish => publish(header, body),
        PacketType::PubAck => Ok(Packet::PubAck {
            packet_id: packet_id_only(&body, "PUBACK")?,
        }),
        PacketType::PubRec => Ok(Packet::PubRec {
            packet_id: packet_id_only(&body, "PUBREC")?,
        }),
        PacketType::PubRel => Ok(Packet::PubRel {
            packet_id: packet_id_only(&body, "PUBREL")?,
        }),
        PacketType::PubComp => Ok(Packet::PubComp {
            packet_id: packet_id_only(&body, "PUBCOMP")?,
        }),
        PacketType::Subscribe => subscribe(body),
        PacketType::SubAck => suback(body),
        PacketType::Unsubscribe => unsubscribe(body),
        PacketType::UnsubAck => Ok(Packet::UnsubAck {
            packet_id: packet_id_only(&body, "UNSUBACK")?,
        }),
        PacketType::PingReq => {
            expect_empty(&body, "PINGREQ")?;
            Ok(Packet::PingReq)
        }
        PacketType::PingResp => {
            expect_empty(&body, "PINGRESP")?;
            Ok(Packet::PingResp)
        }
        PacketType::Disconnect => {
            expect_empty(&body, "DISCONNECT")?;
            Ok(Packet::Disconnect)
        }
    }
}

fn expect_empty(body: &Bytes, name: &str) -> Result<()> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(MqttError::MalformedPacket(format!(
            "{name} remaining length must be 0"
        )))
    }
}

fn packet_id_only(body: &Bytes, name: &str) -> Result<u16> {
    if body.len() != 2 {
        return Err(MqttError::MalformedPacket(format!(
            "{name} remaining length must be 2"
        )));
    }
    Ok(u16::from_be_bytes([body[0], body[1]]))
}

fn connect(body: Bytes) -> Result<Packet> {
    let mut buf = body;
    if buf.remaining() < 10 {
        return Err(MqttError::Protocol("CONNECT variable header truncated"));
    }
    if buf.get_u16() as usize != PROTOCOL_NAME.len() {
        return Err(MqttError::Protocol("CONNECT protocol name mismatch"));
    }
    let mut name = [0u8; 4];
    buf.copy_to_slice(&mut name);
    if &name[..] != PROTOCOL_NAME {
        return Err(MqttError::Protocol("CONNECT protocol name mismatch"));
    }
    if buf.get_u8() != PROTOCOL_LEVEL {
        return Err(MqttError::Protocol("CONNECT protocol level mismatch"));
    }

    let connect_flags = buf.get_u8();
    let keep_alive = buf.get_u16();
    let client_id = decode_string(&mut buf)?;

    let will = if flags::has_will_flag(connect_flags) {
        let topic = decode_string(&mut buf)?;
        let message = decode_binary(&mut buf)?;
        Some(Will {
            topic,
            message,
            qos: QoS::try_from(flags::will_qos(connect_flags))?,
            retain: flags::has_will_retain(connect_flags),
        })
    } else {
        None
    };

    let user_name = if flags::has_user_name_flag(connect_flags) {
        Some(decode_string(&mut buf)?)
    } else {
        None
    };
    let password = if flags::has_password_flag(connect_flags) {
        Some(decode_binary(&mut buf)?)
    } else {
        None
    };

    Ok(Packet::Connect(ConnectRequest {
        client_id,
        user_name,
        password,
        will,
        clean_session: flags::has_clean_session(connect_flags),
        keep_alive,
    }))
}

fn connack(body: &Bytes) -> Result<Packet> {
    if body.len() != 2 {
        return Err(MqttError::MalformedPacket(
            "CONNACK remaining length must be 2".to_string(),
        ));
    }
    Ok(Packet::ConnAck {
        session_present: body[0] & 0x01 != 0,
        return_code: ConnectReturnCode::try_from(body[1])?,
    })
}

fn publish(header: &FixedHeader, body: Bytes) -> Result<Packet> {
    let mut buf = body;
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "PUBLISH missing topic name".to_string(),
        ));
    }
    let topic = decode_string(&mut buf)?;
    let qos = header.qos();
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "PUBLISH missing packet identifier".to_string(),
            ));
        }
        Some(buf.get_u16())
    };
    let payload = buf.copy_to_bytes(buf.remaining());
    Ok(Packet::Publish(PublishEvent {
        dup: header.dup(),
        qos,
        retain: header.retain(),
        packet_id,
        topic,
        payload,
    }))
}

fn subscribe(body: Bytes) -> Result<Packet> {
    let mut buf = body;
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "SUBSCRIBE missing packet identifier".to_string(),
        ));
    }
    let packet_id = buf.get_u16();
    let mut entries = Vec::new();
    while buf.has_remaining() {
        let topic = decode_string(&mut buf)?;
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE missing QoS for topic filter".to_string(),
            ));
        }
        let qos = QoS::try_from(buf.get_u8() & 0x03)?;
        entries.push((topic, qos));
    }
    Ok(Packet::Subscribe { packet_id, entries })
}

fn suback(body: Bytes) -> Result<Packet> {
    let mut buf = body;
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "SUBACK missing packet identifier".to_string(),
        ));
    }
    let packet_id = buf.get_u16();
    let mut return_codes = Vec::with_capacity(buf.remaining());
    while buf.has_remaining() {
        let byte = buf.get_u8();
        if byte & 0x80 != 0 {
            return_codes.push(None);
        } else {
            return_codes.push(Some(QoS::try_from(byte)?));
        }
    }
    Ok(Packet::SubAck {
        packet_id,
        return_codes,
    })
}

fn unsubscribe(body: Bytes) -> Result<Packet> {
    let mut buf = body;
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "UNSUBSCRIBE missing packet identifier".to_string(),
        ));
    }
    let packet_id = buf.get_u16();
    let mut topics = Vec::new();
    while buf.has_remaining() {
        topics.push(decode_string(&mut buf)?);
    }
    Ok(Packet::Unsubscribe { packet_id, topics })
}
