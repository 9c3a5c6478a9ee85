//! Actor model implementation for the room controller.
//!
//! Hierarchy:
//!
//! ```text
//! RoomCoordinatorActor (singleton)
//! └── RoomActor (one per room; owns registry + waiting queue)
//!     └── ConnectionActor (one per signaling connection; owns writes)
//! ```
//!
//! Cancellation flows top-down through child `CancellationToken`s;
//! completion flows bottom-up through `JoinHandle` reaping.

mod connection;
mod coordinator;
mod metrics;
mod room;
mod waiting;

pub use connection::{spawn_connection, ConnectionActorHandle};
pub use coordinator::{CoordinatorStatus, RoomCoordinatorHandle};
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use room::{MediaCommand, Reply, RoomActor, RoomActorHandle, RoomStateView, RoomTimings};
pub use waiting::{WaitingEntry, WaitingRoom};
