//! bg-protocol: Line-oriented control protocol for Baguette node agents
//!
//! Agents connect over SSH, open a shell channel and exchange newline
//! terminated text lines with the server. This crate defines the grammar of
//! those lines in both directions and the JSON payloads carried by
//! configuration pushes.

pub mod codec;
pub mod command;
pub mod error;
pub mod greeting;
pub mod message;
pub mod payload;
pub mod session;

pub use codec::{LineCodec, MAX_LINE_LENGTH};
pub use command::ServerCommand;
pub use error::ProtocolError;
pub use greeting::{Greeting, GREETING_PREFIX};
pub use message::{ClientMessage, Notification, NotifyLevel};
pub use payload::{
    decode_payload, encode_payload, BrokerConnectionConfig, ClientConfiguration,
    ConstantsPayload, Envelope, FunctionDefinition, GroupingConfiguration, PAYLOAD_VERSION,
};
pub use session::SessionId;
