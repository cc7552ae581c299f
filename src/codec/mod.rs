//! Diameter message codec.
//!
//! # Data Flow
//! ```text
//! framed bytes (net::framing)
//!     → message.rs (header + AVP decoding)
//!     → dictionary.rs (command grammar validation)
//!     → DiameterMessage handed to the peer layer
//!
//! builder.rs encodes requests/answers for the probe and the tests.
//! ```
//!
//! # Design Decisions
//! - Parsing never copies AVP payloads: every `Avp::data` is a slice of the
//!   frame's `Bytes`
//! - The dictionary only knows the base protocol commands; anything else
//!   validates trivially and is left to the layer that owns the application
//! - Consumers depend on the `MessageCodec` trait, never on the concrete codec

pub mod builder;
pub mod dictionary;
pub mod error;
pub mod message;

use bytes::Bytes;

pub use builder::MessageBuilder;
pub use dictionary::{AvpRule, BaseProtocolCodec, CommandGrammar, Dictionary};
pub use error::CodecError;
pub use message::{Avp, DiameterMessage, MessageHeader};

/// Length of the fixed Diameter header.
pub const HEADER_LEN: usize = 20;

/// The only Diameter version in use.
pub const DIAMETER_VERSION: u8 = 1;

/// Application id of the base protocol (CER, DWR, DPR, ...).
pub const BASE_APPLICATION_ID: u32 = 0;

/// Header command flags.
pub mod flags {
    pub const REQUEST: u8 = 0x80;
    pub const PROXIABLE: u8 = 0x40;
    pub const ERROR: u8 = 0x20;
    pub const RETRANSMIT: u8 = 0x10;
}

/// AVP header flags.
pub mod avp_flags {
    pub const VENDOR: u8 = 0x80;
    pub const MANDATORY: u8 = 0x40;
}

/// Base protocol command codes.
pub mod command {
    pub const CAPABILITIES_EXCHANGE: u32 = 257;
    pub const DEVICE_WATCHDOG: u32 = 280;
    pub const DISCONNECT_PEER: u32 = 282;
}

/// Base protocol AVP codes.
pub mod avp_code {
    pub const HOST_IP_ADDRESS: u32 = 257;
    pub const VENDOR_ID: u32 = 266;
    pub const RESULT_CODE: u32 = 268;
    pub const PRODUCT_NAME: u32 = 269;
    pub const DISCONNECT_CAUSE: u32 = 273;
    pub const ORIGIN_HOST: u32 = 264;
    pub const ORIGIN_REALM: u32 = 296;
}

/// Parser and grammar checker used by the acceptor for the first message of
/// every connection.
pub trait MessageCodec: Send + Sync {
    /// Decode one complete frame.
    fn parse(&self, raw: Bytes) -> Result<DiameterMessage, CodecError>;

    /// Check a decoded message against the command grammar.
    fn validate(&self, message: &DiameterMessage) -> Result<(), CodecError>;

    /// The routing-relevant header fields.
    fn header(&self, message: &DiameterMessage) -> MessageHeader {
        message.header
    }
}
