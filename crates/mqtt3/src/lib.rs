#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod constants;
pub mod encoding;
pub mod endpoint;
pub mod error;
pub mod flags;
pub mod packet;
pub mod transport;
pub mod types;

mod session;
mod store;
mod write_queue;

pub use endpoint::Endpoint;
pub use error::{MqttError, Result};
pub use packet::{FixedHeader, Packet, PacketType};
pub use transport::Transport;
pub use types::{
    AutoResponse, ConnectRequest, ConnectReturnCode, Decision, PublishEvent, QoS,
    SubscribeReturnCode, Will,
};
pub use write_queue::WriteCallback;
