//! Shared types for Quorum components.
//!
//! This crate holds the identifier newtypes and small enums that the
//! signaling protocol, the room controller, and the client core all agree
//! on. Anything with behavior lives in the component crates; `common` is
//! deliberately dependency-light.

pub mod types;

pub use types::{
    ConsumerId, LeaveReason, MediaKind, ProducerId, Role, RoomId, RoomStatus, TransportId, UserId,
};
