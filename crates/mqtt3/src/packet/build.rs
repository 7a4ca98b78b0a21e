//! Outbound packet builders. Every packet is assembled into one
//! contiguous buffer with five bytes of headroom so the fixed header and
//! remaining-length varint can be placed immediately before the payload,
//! yielding a single buffer per write and a fixed-header byte that can be
//! flipped in place when a stored publish is retransmitted with DUP.

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{MAX_STRING_LENGTH, PROTOCOL_LEVEL, PROTOCOL_NAME};
use crate::encoding::{encode_binary, encode_remaining_length, encode_string};
use crate::error::{MqttError, Result};
use crate::flags;
use crate::packet::PacketType;
use crate::types::{ConnectReturnCode, QoS, SubscribeReturnCode, Will};

/// Fixed-header byte plus up to four remaining-length bytes.
const HEADER_RESERVE: usize = 5;

pub(crate) struct SendBuffer {
    buf: BytesMut,
}

impl SendBuffer {
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.resize(HEADER_RESERVE, 0);
        Self { buf }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    pub fn put_string(&mut self, s: &str) -> Result<()> {
        encode_string(&mut self.buf, s)
    }

    pub fn put_binary(&mut self, data: &[u8]) {
        encode_binary(&mut self.buf, data);
    }

    /// Places the fixed header directly before the payload and returns
    /// the finalized wire bytes.
    pub fn finalize(mut self, packet_type: PacketType, header_flags: u8) -> Result<Bytes> {
        let payload_len = self.buf.len() - HEADER_RESERVE;
        let (varint, varint_len) = encode_remaining_length(payload_len)?;
        let start = HEADER_RESERVE - 1 - varint_len;
        self.buf[start] = (packet_type.as_u8() << 4) | header_flags;
        self.buf[start + 1..start + 1 + varint_len].copy_from_slice(&varint[..varint_len]);
        Ok(self.buf.freeze().slice(start..))
    }
}

pub fn connect(
    client_id: &str,
    clean_session: bool,
    keep_alive: u16,
    will: Option<&Will>,
    user_name: Option<&str>,
    password: Option<&[u8]>,
) -> Result<Bytes> {
    let mut sb = SendBuffer::new();
    sb.put_u16(PROTOCOL_NAME.len() as u16);
    sb.put_slice(PROTOCOL_NAME);
    sb.put_u8(PROTOCOL_LEVEL);

    let mut connect_flags = if clean_session {
        flags::CLEAN_SESSION
    } else {
        0
    };
    if let Some(will) = will {
        connect_flags |= flags::WILL_FLAG | ((will.qos as u8) << flags::WILL_QOS_SHIFT);
        if will.retain {
            connect_flags |= flags::WILL_RETAIN;
        }
    }
    if user_name.is_some() {
        connect_flags |= flags::USER_NAME_FLAG;
    }
    if password.is_some() {
        connect_flags |= flags::PASSWORD_FLAG;
    }
    sb.put_u8(connect_flags);
    sb.put_u16(keep_alive);

    sb.put_string(client_id)?;
    if let Some(will) = will {
        sb.put_string(&will.topic)?;
        if will.message.len() > MAX_STRING_LENGTH {
            return Err(MqttError::WillMessageTooLong(will.message.len()));
        }
        sb.put_binary(&will.message);
    }
    if let Some(name) = user_name {
        sb.put_string(name)?;
    }
    if let Some(password) = password {
        // Passwords are raw bytes: length-checked, never UTF-8-validated.
        if password.len() > MAX_STRING_LENGTH {
            return Err(MqttError::PasswordTooLong(password.len()));
        }
        sb.put_binary(password);
    }
    sb.finalize(PacketType::Connect, 0)
}

pub fn connack(session_present: bool, return_code: ConnectReturnCode) -> Result<Bytes> {
    let mut sb = SendBuffer::new();
    sb.put_u8(u8::from(session_present));
    sb.put_u8(return_code.as_u8());
    sb.finalize(PacketType::ConnAck, 0)
}

pub fn publish(
    topic: &str,
    qos: QoS,
    retain: bool,
    dup: bool,
    packet_id: u16,
    payload: &[u8],
) -> Result<Bytes> {
    let mut sb = SendBuffer::new();
    sb.put_string(topic)?;
    if qos != QoS::AtMostOnce {
        sb.put_u16(packet_id);
    }
    sb.put_slice(payload);
    sb.finalize(PacketType::Publish, flags::publish_flags(qos, retain, dup))
}

fn packet_id_only(packet_type: PacketType, header_flags: u8, packet_id: u16) -> Result<Bytes> {
    let mut sb = SendBuffer::new();
    sb.put_u16(packet_id);
    sb.finalize(packet_type, header_flags)
}

pub fn puback(packet_id: u16) -> Result<Bytes> {
    packet_id_only(PacketType::PubAck, 0, packet_id)
}

pub fn pubrec(packet_id: u16) -> Result<Bytes> {
    packet_id_only(PacketType::PubRec, 0, packet_id)
}

pub fn pubrel(packet_id: u16) -> Result<Bytes> {
    packet_id_only(PacketType::PubRel, 0x02, packet_id)
}

pub fn pubcomp(packet_id: u16) -> Result<Bytes> {
    packet_id_only(PacketType::PubComp, 0, packet_id)
}

pub fn subscribe(packet_id: u16, entries: &[(&str, QoS)]) -> Result<Bytes> {
    let mut sb = SendBuffer::new();
    sb.put_u16(packet_id);
    for (topic, qos) in entries {
        sb.put_string(topic)?;
        sb.put_u8(*qos as u8);
    }
    sb.finalize(PacketType::Subscribe, 0x02)
}

pub fn suback(packet_id: u16, return_codes: &[SubscribeReturnCode]) -> Result<Bytes> {
    let mut sb = SendBuffer::new();
    sb.put_u16(packet_id);
    for code in return_codes {
        sb.put_u8(code.as_byte());
    }
    sb.finalize(PacketType::SubAck, 0)
}

pub fn unsubscribe(packet_id: u16, topics: &[&str]) -> Result<Bytes> {
    let mut sb = SendBuffer::new();
    sb.put_u16(packet_id);
    for topic in topics {
        sb.put_string(topic)?;
    }
    sb.finalize(PacketType::Unsubscribe, 0x02)
}

pub fn unsuback(packet_id: u16) -> Result<Bytes> {
    packet_id_only(PacketType::UnsubAck, 0, packet_id)
}

pub fn pingreq() -> Result<Bytes> {
    SendBuffer::new().finalize(PacketType::PingReq, 0)
}

pub fn pingresp() -> Result<Bytes> {
    SendBuffer::new().finalize(PacketType::PingResp, 0)
}

pub fn disconnect() -> Result<Bytes> {
    SendBuffer::new().finalize(PacketType::Disconnect, 0)
}
