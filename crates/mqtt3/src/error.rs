use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqttError>;

#[derive(Debug, Clone, Error)]
pub enum MqttError {
    #[error("remaining length exceeds four bytes")]
    RemainingLengthExceeded,

    #[error("string too long: {0} bytes exceeds maximum of 65535")]
    StringTooLong(usize),

    #[error("string contains forbidden code points or invalid UTF-8")]
    InvalidStringContents,

    #[error("will message too long: {0} bytes exceeds maximum of 65535")]
    WillMessageTooLong(usize),

    #[error("password too long: {0} bytes exceeds maximum of 65535")]
    PasswordTooLong(usize),

    #[error("packet identifiers exhausted")]
    PacketIdExhausted,

    #[error("short write: expected {expected} bytes, wrote {actual}")]
    WriteSizeMismatch { expected: usize, actual: usize },

    #[error("packet too large: size {size} exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("invalid connect return code: {0}")]
    InvalidReturnCode(u8),

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connection reset")]
    ConnectionReset,

    #[error("IO error: {0}")]
    Io(String),
}

impl MqttError {
    /// Whether the error represents the peer going away rather than a
    /// protocol or IO failure. Clean closes fire the close handler; all
    /// other session errors fire the error handler.
    #[must_use]
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::ConnectionReset)
    }
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof => MqttError::ConnectionClosed,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                MqttError::ConnectionReset
            }
            _ => MqttError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = MqttError::StringTooLong(70_000);
        assert_eq!(
            err.to_string(),
            "string too long: 70000 bytes exceeds maximum of 65535"
        );

        let err = MqttError::WriteSizeMismatch {
            expected: 10,
            actual: 4,
        };
        assert_eq!(err.to_string(), "short write: expected 10 bytes, wrote 4");
    }

    #[test]
    fn test_io_error_classification() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(
            MqttError::from(eof),
            MqttError::ConnectionClosed
        ));

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(MqttError::from(reset), MqttError::ConnectionReset));

        let pipe = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(MqttError::from(pipe), MqttError::ConnectionReset));

        let other = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(MqttError::from(other), MqttError::Io(_)));
    }

    #[test]
    fn test_clean_close() {
        assert!(MqttError::ConnectionClosed.is_clean_close());
        assert!(MqttError::ConnectionReset.is_clean_close());
        assert!(!MqttError::RemainingLengthExceeded.is_clean_close());
        assert!(!MqttError::Io("boom".to_string()).is_clean_close());
    }
}
