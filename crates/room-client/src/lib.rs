//! Quorum client core.
//!
//! This crate is the client half of the session-coordination core: it
//! owns one participant's view of a room and keeps it converged with
//! the controller's authoritative state over a signaling channel.
//!
//! Components:
//!
//! - [`channel`] - request/response correlation and the ordered event
//!   stream over any byte stream
//! - [`session`] - the room session state machine
//!   (`Idle → Connecting → Authenticating → (WaitingForAdmission) →
//!   Joining → Active → Leaving → Idle`)
//! - [`media`] - the media transport orchestrator (device, one send +
//!   one receive transport, producers, consumers, and the FIFO
//!   pending-consume queue)
//! - [`registry`] - the read-mirror of the participant registry,
//!   mutated only by signaling events, observable by the UI layer
//!
//! The UI layer drives the session through [`session::RoomSessionHandle`]
//! intents and renders from the registry watch; it never mutates
//! registry state directly.

#![warn(clippy::pedantic)]

pub mod channel;
pub mod errors;
pub mod media;
pub mod registry;
pub mod session;

pub use channel::SignalingChannel;
pub use errors::SessionError;
pub use media::{MediaOrchestrator, MediaTrack, RemoteTrack};
pub use registry::{Registry, RegistryEntry, RegistryView};
pub use session::{RoomSession, RoomSessionHandle, SessionConfig, SessionState};
