use bytes::Bytes;

use crate::error::MqttError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::InvalidQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

/// Message the broker publishes on the client's behalf after an
/// ungraceful disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl Will {
    #[must_use]
    pub fn new(topic: impl Into<String>, message: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            message: message.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// CONNACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::UnacceptableProtocolVersion),
            2 => Ok(Self::IdentifierRejected),
            3 => Ok(Self::ServerUnavailable),
            4 => Ok(Self::BadUserNameOrPassword),
            5 => Ok(Self::NotAuthorized),
            other => Err(MqttError::InvalidReturnCode(other)),
        }
    }
}

/// Per-topic result carried in an outbound SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Success(qos) => qos as u8,
            Self::Failure => 0x80,
        }
    }
}

/// Directive a packet handler returns to the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Keep reading packets.
    Continue,
    /// End the session cleanly after this packet.
    Stop,
}

/// When the endpoint answers PUBLISH/PUBREC/PUBREL on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoResponse {
    /// The user's handler is responsible for calling `puback`/`pubrec`/
    /// `pubrel`/`pubcomp` itself.
    Off,
    /// Respond synchronously before the next packet is read.
    #[default]
    Immediate,
    /// Respond through the write queue.
    Queued,
}

/// Decoded inbound PUBLISH handed to the publish handler.
#[derive(Debug, Clone)]
pub struct PublishEvent {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    /// Present iff `qos` is above [`QoS::AtMostOnce`].
    pub packet_id: Option<u16>,
    pub topic: String,
    pub payload: Bytes,
}

/// Decoded inbound CONNECT handed to the connect handler.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub client_id: String,
    pub user_name: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
    pub clean_session: bool,
    pub keep_alive: u16,
}
