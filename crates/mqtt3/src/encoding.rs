//! Primitive wire encodings: the remaining-length varint, length-prefixed
//! UTF-8 strings, and length-prefixed binary fields.

use bytes::{Buf, BufMut};

use crate::constants::{MAX_REMAINING_LENGTH, MAX_STRING_LENGTH};
use crate::error::{MqttError, Result};

/// Encodes a remaining-length value into its 1-4 byte varint form.
///
/// Returns the encoded bytes and how many of them are significant.
pub fn encode_remaining_length(len: usize) -> Result<([u8; 4], usize)> {
    if len > MAX_REMAINING_LENGTH {
        return Err(MqttError::PacketTooLarge {
            size: len,
            max: MAX_REMAINING_LENGTH,
        });
    }
    let mut out = [0u8; 4];
    let mut value = len;
    let mut used = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out[used] = byte;
        used += 1;
        if value == 0 {
            break;
        }
    }
    Ok((out, used))
}

/// Incremental remaining-length decoder, fed one byte at a time as the
/// packet assembler pulls them off the stream.
#[derive(Debug, Default)]
pub struct RemainingLengthDecoder {
    value: u32,
    shift: u32,
}

impl RemainingLengthDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next byte. Returns the decoded value once the
    /// continuation bit clears, or an error when a fifth byte arrives.
    pub fn feed(&mut self, byte: u8) -> Result<Option<u32>> {
        if self.shift > 21 {
            return Err(MqttError::RemainingLengthExceeded);
        }
        self.value |= u32::from(byte & 0x7F) << self.shift;
        self.shift += 7;
        if byte & 0x80 == 0 {
            Ok(Some(self.value))
        } else {
            Ok(None)
        }
    }
}

/// One-shot remaining-length decode over a buffer.
pub fn decode_remaining_length<B: Buf>(buf: &mut B) -> Result<u32> {
    let mut decoder = RemainingLengthDecoder::new();
    loop {
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "truncated remaining length".to_string(),
            ));
        }
        if let Some(value) = decoder.feed(buf.get_u8())? {
            return Ok(value);
        }
    }
}

/// Checks the MQTT string rules: at most 65535 bytes, and U+0000 is
/// forbidden. Surrogate code points cannot occur in a Rust `str`.
pub fn validate_string(s: &str) -> Result<()> {
    if s.len() > MAX_STRING_LENGTH {
        return Err(MqttError::StringTooLong(s.len()));
    }
    if s.bytes().any(|b| b == 0) {
        return Err(MqttError::InvalidStringContents);
    }
    Ok(())
}

/// Writes a length-prefixed UTF-8 string after validating it.
pub fn encode_string<B: BufMut>(buf: &mut B, s: &str) -> Result<()> {
    validate_string(s)?;
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Reads a length-prefixed UTF-8 string, rejecting invalid UTF-8 (which
/// covers surrogate encodings) and embedded U+0000.
pub fn decode_string<B: Buf>(buf: &mut B) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "missing string length prefix".to_string(),
        ));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(
            "string length exceeds packet".to_string(),
        ));
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    let s = String::from_utf8(raw).map_err(|_| MqttError::InvalidStringContents)?;
    if s.bytes().any(|b| b == 0) {
        return Err(MqttError::InvalidStringContents);
    }
    Ok(s)
}

/// Writes a length-prefixed binary field. No content validation; the
/// caller is responsible for the length check with its own error kind.
pub fn encode_binary<B: BufMut>(buf: &mut B, data: &[u8]) {
    debug_assert!(data.len() <= MAX_STRING_LENGTH);
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

/// Reads a length-prefixed binary field.
pub fn decode_binary<B: Buf>(buf: &mut B) -> Result<Vec<u8>> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "missing binary length prefix".to_string(),
        ));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(
            "binary length exceeds packet".to_string(),
        ));
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(raw)
}
