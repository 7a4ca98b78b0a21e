/// Protocol name carried in the CONNECT variable header.
pub const PROTOCOL_NAME: &[u8] = b"MQTT";

/// Protocol level byte for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 0x04;

/// Largest value the remaining-length varint can encode (four bytes).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Largest length a two-byte-prefixed string or binary field can carry.
pub const MAX_STRING_LENGTH: usize = 65_535;
