//! `RoomCoordinatorActor` - singleton supervisor for room actors.
//!
//! The coordinator is the top-level actor in the controller hierarchy:
//!
//! - Singleton per controller instance
//! - Creates rooms on host action and resolves shareable codes
//! - Supervises N `RoomActor` instances (panic detection via
//!   `JoinHandle`, reaping of ended rooms)
//! - Owns the root `CancellationToken` for graceful shutdown
//!
//! # Graceful Shutdown
//!
//! On shutdown, the coordinator:
//! 1. Sets `accepting_new = false`
//! 2. Cancels the root `CancellationToken` (propagates to all children)
//! 3. Waits for rooms to drain with a bounded timeout

use crate::config::Config;
use crate::errors::RoomError;
use crate::relay::RelayEngine;

use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomTimings};

use common::{RoomId, RoomStatus, UserId};
use rand::distributions::Alphanumeric;
use rand::Rng;
use room_protocol::{RoomFeatures, RoomInfo, RoomRef};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the coordinator mailbox.
const COORDINATOR_CHANNEL_BUFFER: usize = 1000;

/// Length of generated room codes.
const ROOM_CODE_LENGTH: usize = 10;

/// Per-room shutdown drain timeout.
const ROOM_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages handled by the coordinator.
enum CoordinatorMessage {
    CreateRoom {
        owner: UserId,
        title: String,
        max_participants: u32,
        features: RoomFeatures,
        respond_to: oneshot::Sender<Result<RoomInfo, RoomError>>,
    },
    ResolveRoom {
        room: RoomRef,
        respond_to: oneshot::Sender<Result<RoomActorHandle, RoomError>>,
    },
    GetStatus {
        respond_to: oneshot::Sender<CoordinatorStatus>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Coordinator status snapshot.
#[derive(Debug, Clone)]
pub struct CoordinatorStatus {
    pub active_rooms: usize,
    pub accepting_new: bool,
}

/// Handle to the `RoomCoordinatorActor`.
#[derive(Clone)]
pub struct RoomCoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
    cancel_token: CancellationToken,
}

impl RoomCoordinatorHandle {
    /// Create a new coordinator and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(
        config: Config,
        relay: Arc<dyn RelayEngine>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(COORDINATOR_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomCoordinatorActor::new(
            config,
            relay,
            receiver,
            cancel_token.clone(),
            metrics,
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Create a new room owned by `owner`.
    pub async fn create_room(
        &self,
        owner: UserId,
        title: String,
        max_participants: u32,
        features: RoomFeatures,
    ) -> Result<RoomInfo, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::CreateRoom {
                owner,
                title,
                max_participants,
                features,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))?
    }

    /// Resolve a room reference (id or shareable code) to its actor.
    pub async fn resolve_room(&self, room: RoomRef) -> Result<RoomActorHandle, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::ResolveRoom {
                room,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get the current coordinator status.
    pub async fn get_status(&self) -> Result<CoordinatorStatus, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Initiate graceful shutdown; rooms drain in the background.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for connection actors.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    code: String,
    created_at: i64,
}

/// The `RoomCoordinatorActor` implementation.
struct RoomCoordinatorActor {
    config: Config,
    relay: Arc<dyn RelayEngine>,
    receiver: mpsc::Receiver<CoordinatorMessage>,
    cancel_token: CancellationToken,
    rooms: HashMap<RoomId, ManagedRoom>,
    codes: HashMap<String, RoomId>,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomCoordinatorActor {
    fn new(
        config: Config,
        relay: Arc<dyn RelayEngine>,
        receiver: mpsc::Receiver<CoordinatorMessage>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        Self {
            config,
            relay,
            receiver,
            cancel_token,
            rooms: HashMap::new(),
            codes: HashMap::new(),
            accepting_new: true,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Coordinator, "coordinator"),
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "rc.actor.coordinator")]
    async fn run(mut self) {
        info!(
            target: "rc.actor.coordinator",
            max_rooms = self.config.max_rooms,
            "RoomCoordinatorActor started"
        );

        loop {
            // Reap rooms whose actors have ended.
            self.check_room_health();

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rc.actor.coordinator",
                        "RoomCoordinatorActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "rc.actor.coordinator",
                                "RoomCoordinatorActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rc.actor.coordinator",
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomCoordinatorActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::CreateRoom {
                owner,
                title,
                max_participants,
                features,
                respond_to,
            } => {
                let result = self.handle_create_room(owner, title, max_participants, features);
                let _ = respond_to.send(result);
            }

            CoordinatorMessage::ResolveRoom { room, respond_to } => {
                let result = self.handle_resolve_room(&room);
                let _ = respond_to.send(result);
            }

            CoordinatorMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(CoordinatorStatus {
                    active_rooms: self.rooms.len(),
                    accepting_new: self.accepting_new,
                });
            }

            CoordinatorMessage::Shutdown { respond_to } => {
                self.accepting_new = false;
                self.cancel_token.cancel();
                let _ = respond_to.send(());
            }
        }
    }

    /// Create a new room actor.
    #[instrument(skip_all, fields(owner = %owner))]
    fn handle_create_room(
        &mut self,
        owner: UserId,
        title: String,
        max_participants: u32,
        features: RoomFeatures,
    ) -> Result<RoomInfo, RoomError> {
        if !self.accepting_new {
            return Err(RoomError::Draining);
        }
        if self.rooms.len() as u32 >= self.config.max_rooms {
            return Err(RoomError::CapacityExceeded(
                "Controller is at room capacity".to_string(),
            ));
        }

        let code = self.generate_code();
        let info = RoomInfo {
            id: RoomId::new(),
            code: code.clone(),
            title,
            status: RoomStatus::Created,
            owner,
            max_participants: max_participants.clamp(2, self.config.max_participants),
            features,
        };

        let timings = RoomTimings {
            disconnect_grace: self.config.disconnect_grace,
            empty_room_grace: self.config.empty_room_grace,
        };
        let (handle, task_handle) = RoomActor::spawn(
            info.clone(),
            Arc::clone(&self.relay),
            self.cancel_token.child_token(),
            timings,
            Arc::clone(&self.metrics),
        );

        self.codes.insert(code.clone(), info.id);
        self.rooms.insert(
            info.id,
            ManagedRoom {
                handle,
                task_handle,
                code,
                created_at: chrono::Utc::now().timestamp(),
            },
        );

        info!(
            target: "rc.actor.coordinator",
            room_id = %info.id,
            code = %info.code,
            active_rooms = self.rooms.len(),
            "Room created"
        );

        Ok(info)
    }

    /// Resolve a room reference to its actor handle.
    fn handle_resolve_room(&self, room: &RoomRef) -> Result<RoomActorHandle, RoomError> {
        let room_id = match room {
            RoomRef::Id(id) => *id,
            RoomRef::Code(code) => *self.codes.get(code).ok_or(RoomError::RoomNotFound)?,
        };
        self.rooms
            .get(&room_id)
            // A cancelled room is already gone even if not yet reaped.
            .filter(|managed| !managed.handle.is_cancelled())
            .map(|managed| managed.handle.clone())
            .ok_or(RoomError::RoomNotFound)
    }

    /// Generate a fresh shareable room code.
    fn generate_code(&self) -> String {
        loop {
            let code: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(ROOM_CODE_LENGTH)
                .map(|b| (b as char).to_ascii_uppercase())
                .collect();
            if !self.codes.contains_key(&code) {
                return code;
            }
        }
    }

    /// Reap rooms whose actor task has ended (room closed, emptied out,
    /// or panicked).
    fn check_room_health(&mut self) {
        let ended: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for room_id in ended {
            if let Some(managed) = self.rooms.remove(&room_id) {
                self.codes.remove(&managed.code);

                // is_finished() was true, so this is immediate.
                if let Err(join_error) =
                    futures_util::FutureExt::now_or_never(managed.task_handle)
                        .unwrap_or(Ok(()))
                {
                    if join_error.is_panic() {
                        error!(
                            target: "rc.actor.coordinator",
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                } else {
                    debug!(
                        target: "rc.actor.coordinator",
                        room_id = %room_id,
                        lifetime_s = chrono::Utc::now().timestamp() - managed.created_at,
                        "Room actor reaped"
                    );
                }
            }
        }
    }

    /// Perform graceful shutdown: cancellation has propagated to child
    /// tokens; wait for room tasks with a bounded timeout.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "rc.actor.coordinator",
            rooms = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for (room_id, managed) in self.rooms.drain() {
            self.codes.remove(&managed.code);
            match tokio::time::timeout(ROOM_DRAIN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "rc.actor.coordinator",
                        room_id = %room_id,
                        "Room completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "rc.actor.coordinator",
                        room_id = %room_id,
                        error = ?e,
                        "Room task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "rc.actor.coordinator",
                        room_id = %room_id,
                        "Room shutdown timed out"
                    );
                }
            }
        }

        info!(
            target: "rc.actor.coordinator",
            "Graceful shutdown complete"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::relay::LoopbackRelay;

    fn new_coordinator() -> RoomCoordinatorHandle {
        RoomCoordinatorHandle::new(
            Config::default(),
            Arc::new(LoopbackRelay::new()),
            ActorMetrics::new(),
        )
    }

    #[tokio::test]
    async fn test_create_and_resolve_by_id_and_code() {
        let coordinator = new_coordinator();

        let info = coordinator
            .create_room(UserId::new(), "Standup".to_string(), 10, RoomFeatures::default())
            .await
            .unwrap();
        assert_eq!(info.status, RoomStatus::Created);
        assert_eq!(info.code.len(), ROOM_CODE_LENGTH);

        let by_id = coordinator
            .resolve_room(RoomRef::Id(info.id))
            .await
            .unwrap();
        assert_eq!(by_id.room_id(), info.id);

        let by_code = coordinator
            .resolve_room(RoomRef::Code(info.code.clone()))
            .await
            .unwrap();
        assert_eq!(by_code.room_id(), info.id);

        coordinator.cancel();
    }

    #[tokio::test]
    async fn test_resolve_unknown_room_fails() {
        let coordinator = new_coordinator();

        let result = coordinator
            .resolve_room(RoomRef::Code("NO-SUCH-RM".to_string()))
            .await;
        assert!(matches!(result, Err(RoomError::RoomNotFound)));

        coordinator.cancel();
    }

    #[tokio::test]
    async fn test_room_capacity_limit() {
        let config = Config {
            max_rooms: 1,
            ..Config::default()
        };
        let coordinator = RoomCoordinatorHandle::new(
            config,
            Arc::new(LoopbackRelay::new()),
            ActorMetrics::new(),
        );

        coordinator
            .create_room(UserId::new(), "One".to_string(), 10, RoomFeatures::default())
            .await
            .unwrap();
        let result = coordinator
            .create_room(UserId::new(), "Two".to_string(), 10, RoomFeatures::default())
            .await;
        assert!(matches!(result, Err(RoomError::CapacityExceeded(_))));

        coordinator.cancel();
    }

    #[tokio::test]
    async fn test_max_participants_clamped() {
        let coordinator = new_coordinator();

        let info = coordinator
            .create_room(UserId::new(), "Big".to_string(), 100_000, RoomFeatures::default())
            .await
            .unwrap();
        assert_eq!(info.max_participants, Config::default().max_participants);

        coordinator.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let coordinator = new_coordinator();

        coordinator.shutdown().await.unwrap();
        assert!(coordinator.is_cancelled());
    }
}
