//! Signaling wire protocol for Quorum.
//!
//! Defines the closed set of messages exchanged between a client and the
//! room controller, and a length-prefixed JSON codec for carrying them
//! over any ordered byte stream.
//!
//! Every message is one variant of a tagged union, so state-machine
//! handlers on both sides get compiler-checked exhaustiveness when a
//! message kind is added.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod media;
pub mod message;

pub use codec::{CodecError, FrameCodec};
pub use media::{
    ConsumerParams, DtlsParameters, RouterCapabilities, RtpCapabilities, RtpParameters,
    TransportDirection, TransportParams,
};
pub use message::{
    ClientRequest, ErrorCode, Frame, ParticipantInfo, ProducerInfo, ResponseBody, RoomFeatures,
    RoomInfo, RoomRef, RoomSnapshot, ServerEvent, WaitingInfo,
};
