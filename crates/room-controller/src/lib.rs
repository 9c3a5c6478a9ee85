//! Quorum Room Controller library.
//!
//! The room controller is a stateful signaling server responsible for:
//!
//! - Real-time room coordination and participant state management
//! - Waiting-room admission gated by host-role participants
//! - Media negotiation bookkeeping (transports, producers, consumers)
//!   against an external relay engine
//! - Broadcast synchronization so every client's registry mirror
//!   converges on the authoritative room state
//!
//! # Architecture
//!
//! The controller uses an actor model hierarchy:
//!
//! ```text
//! RoomCoordinatorActor (singleton per controller instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per active room)
//!         ├── owns the participant registry and waiting queue
//!         └── supervises N ConnectionActors
//!             └── ConnectionActor (one per signaling connection)
//! ```
//!
//! All mutations of per-room state are serialized through the room
//! actor's mailbox; broadcasts read a consistent snapshot of the
//! participant map. The relay engine is consumed through the narrow
//! [`relay::RelayEngine`] trait and never handles RTP here.
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation
//! - [`auth`] - Identity-collaborator seam (token verification)
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with wire error-code mapping
//! - [`relay`] - Relay engine trait and loopback stand-in
//! - [`server`] - Per-connection signaling loop

pub mod actors;
pub mod auth;
pub mod config;
pub mod errors;
pub mod relay;
pub mod server;
