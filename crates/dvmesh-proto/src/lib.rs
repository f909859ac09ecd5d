//! # dvmesh Protocol
//!
//! Binary telegrams exchanged between applications and distributors, and
//! between distributors.
//!
//! ## Framing
//!
//! Every telegram is `[type code: u8][payload length: u16 BE][payload]`.
//! Decoding recomputes the payload length from the fields it read and
//! rejects any disagreement with the declared length.
//!
//! ## Fragmentation
//!
//! Records larger than the configured segment size are split into
//! fragments sharing one channel and data index; only fragment 0 carries
//! the record metadata. [`Assembler`] reunites them on the receiving side.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod fragment;
pub mod telegrams;
pub mod types;
pub mod wire;

pub use fragment::{
    error_code, Assembler, DataFragment, DataQualityWarning, FragmentError, FragmentHead,
    Fragmenter, Record, RecordMetadata, MAX_SEGMENT_SIZE,
};
pub use telegrams::{
    AuthenticationAnswer, AuthenticationRequest, AuthenticationTextAnswer,
    AuthenticationTextRequest, BestPathUpdate, ConnectionParameters, DataDirection,
    DistributorVersionAnswer, DistributorVersionRequest, FrameHeader, InterestOwner,
    InterestUpdate, KeepAlive, LinkClosure, ProtocolVersionAnswer, ProtocolVersionRequest,
    ReceiveSubscription, RequestSenderData, SendSubscription, Telegram, TelegramTime,
    TransmitterData, TriggerState, WirePayload,
};
pub use types::{PriorityClass, TelegramType};
pub use wire::{CodecError, DecodeError, FramingError, HEADER_LEN, MAX_PAYLOAD_LEN};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: i32 = 3;
