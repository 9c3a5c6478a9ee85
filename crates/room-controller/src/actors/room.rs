//! `RoomActor` - per-room actor that owns all room state.
//!
//! Each `RoomActor`:
//! - Owns the authoritative participant registry for one room
//! - Owns the waiting-room admission queue
//! - Tracks producer/consumer bindings against the relay engine
//! - Broadcasts state changes to every participant's connection
//!
//! Every mutation goes through the actor mailbox, so concurrent joins,
//! admits, and media requests never race on shared state. Replies to
//! room-scoped requests are delivered through the same connection
//! mailbox as broadcasts, which is what preserves server-emission order
//! per connection (a join snapshot can never arrive after an event that
//! assumes it).
//!
//! # Participant disconnect handling
//!
//! When a connection drops:
//! 1. The participant is marked disconnected (still visible to others)
//! 2. A grace period runs for reconnection
//! 3. If not reconnected: participant removed, media torn down,
//!    participant-left broadcast

use crate::errors::RoomError;
use crate::relay::RelayEngine;

use super::connection::ConnectionActorHandle;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::waiting::{WaitingEntry, WaitingRoom};

use common::{ConsumerId, LeaveReason, MediaKind, ProducerId, Role, RoomId, RoomStatus, TransportId, UserId};
use room_protocol::{
    ConsumerParams, DtlsParameters, ParticipantInfo, ProducerInfo, ResponseBody, RoomInfo,
    RoomSnapshot, RtpCapabilities, RtpParameters, ServerEvent, TransportDirection, WaitingInfo,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// How often disconnect and empty-room grace periods are checked.
const GRACE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Grace periods governing room lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct RoomTimings {
    /// How long a dropped participant may reconnect before removal.
    pub disconnect_grace: Duration,
    /// How long an empty room lingers before it ends.
    pub empty_room_grace: Duration,
}

impl Default for RoomTimings {
    fn default() -> Self {
        Self {
            disconnect_grace: Duration::from_secs(30),
            empty_room_grace: Duration::from_secs(60),
        }
    }
}

/// Reply path for a room-scoped request: the requester's connection and
/// the correlation id. Success and error replies travel through the
/// connection mailbox so they interleave correctly with broadcasts.
#[derive(Debug, Clone)]
pub struct Reply {
    connection: ConnectionActorHandle,
    request_id: u64,
}

impl Reply {
    #[must_use]
    pub fn new(connection: ConnectionActorHandle, request_id: u64) -> Self {
        Self {
            connection,
            request_id,
        }
    }

    /// The requester's connection.
    #[must_use]
    pub fn connection(&self) -> &ConnectionActorHandle {
        &self.connection
    }

    async fn ok(&self, response: ResponseBody) {
        let _ = self.connection.respond(self.request_id, response).await;
    }

    async fn err(&self, error: &RoomError) {
        let _ = self
            .connection
            .respond_error(self.request_id, error)
            .await;
    }

    async fn send(&self, result: Result<ResponseBody, RoomError>) {
        match result {
            Ok(response) => self.ok(response).await,
            Err(error) => self.err(&error).await,
        }
    }
}

/// Media negotiation commands, dispatched within the room actor.
#[derive(Debug)]
pub enum MediaCommand {
    RouterCapabilities,
    CreateTransport {
        direction: TransportDirection,
    },
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    CloseProducer {
        kind: MediaKind,
    },
    PauseProducer {
        kind: MediaKind,
    },
    ResumeProducer {
        kind: MediaKind,
    },
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    ResumeConsumer {
        consumer_id: ConsumerId,
    },
}

/// Messages handled by a `RoomActor`.
enum RoomMessage {
    Join {
        reply: Reply,
        user_id: UserId,
        display_name: String,
        role_claim: Option<Role>,
    },
    Leave {
        reply: Reply,
        user_id: UserId,
    },
    CloseRoom {
        reply: Reply,
        user_id: UserId,
    },
    Kick {
        reply: Reply,
        caller: UserId,
        target: UserId,
    },
    MuteAll {
        reply: Reply,
        caller: UserId,
    },
    ChangeRole {
        reply: Reply,
        caller: UserId,
        target: UserId,
        role: Role,
    },
    UpdateStatus {
        reply: Reply,
        user_id: UserId,
        hand_raised: bool,
        reaction: Option<String>,
    },
    Admit {
        reply: Reply,
        caller: UserId,
        target: UserId,
    },
    Reject {
        reply: Reply,
        caller: UserId,
        target: UserId,
        reason: String,
    },
    AdmitAll {
        reply: Reply,
        caller: UserId,
    },
    Media {
        reply: Reply,
        user_id: UserId,
        command: MediaCommand,
    },
    ConnectionDisconnected {
        user_id: UserId,
    },
    GetState {
        respond_to: oneshot::Sender<RoomStateView>,
    },
}

/// Introspection view of room state, for the coordinator and tests.
#[derive(Debug, Clone)]
pub struct RoomStateView {
    pub info: RoomInfo,
    pub participants: Vec<ParticipantInfo>,
    pub waiting: Vec<WaitingInfo>,
    pub consumer_count: usize,
    pub is_shutting_down: bool,
}

/// Handle to a `RoomActor`.
#[derive(Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: RoomId,
}

impl RoomActorHandle {
    /// Get the room ID.
    #[must_use]
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Request to join the room. The reply is `Joined` with a snapshot
    /// (auto-admit) or `Waiting`; waiting callers later receive an
    /// `Admitted` or `Rejected` event on their connection.
    pub async fn join(
        &self,
        reply: Reply,
        user_id: UserId,
        display_name: String,
        role_claim: Option<Role>,
    ) -> Result<(), RoomError> {
        self.send(RoomMessage::Join {
            reply,
            user_id,
            display_name,
            role_claim,
        })
        .await
    }

    /// Leave the room voluntarily.
    pub async fn leave(&self, reply: Reply, user_id: UserId) -> Result<(), RoomError> {
        self.send(RoomMessage::Leave { reply, user_id }).await
    }

    /// Close the room (host only).
    pub async fn close_room(&self, reply: Reply, user_id: UserId) -> Result<(), RoomError> {
        self.send(RoomMessage::CloseRoom { reply, user_id }).await
    }

    /// Remove a participant (moderators only).
    pub async fn kick(
        &self,
        reply: Reply,
        caller: UserId,
        target: UserId,
    ) -> Result<(), RoomError> {
        self.send(RoomMessage::Kick {
            reply,
            caller,
            target,
        })
        .await
    }

    /// Pause every non-moderator audio producer (moderators only).
    pub async fn mute_all(&self, reply: Reply, caller: UserId) -> Result<(), RoomError> {
        self.send(RoomMessage::MuteAll { reply, caller }).await
    }

    /// Change a participant's role (host only).
    pub async fn change_role(
        &self,
        reply: Reply,
        caller: UserId,
        target: UserId,
        role: Role,
    ) -> Result<(), RoomError> {
        self.send(RoomMessage::ChangeRole {
            reply,
            caller,
            target,
            role,
        })
        .await
    }

    /// Update hand-raise / reaction flags.
    pub async fn update_status(
        &self,
        reply: Reply,
        user_id: UserId,
        hand_raised: bool,
        reaction: Option<String>,
    ) -> Result<(), RoomError> {
        self.send(RoomMessage::UpdateStatus {
            reply,
            user_id,
            hand_raised,
            reaction,
        })
        .await
    }

    /// Admit one waiting user (moderators only).
    pub async fn admit(
        &self,
        reply: Reply,
        caller: UserId,
        target: UserId,
    ) -> Result<(), RoomError> {
        self.send(RoomMessage::Admit {
            reply,
            caller,
            target,
        })
        .await
    }

    /// Reject one waiting user with a reason (moderators only).
    pub async fn reject(
        &self,
        reply: Reply,
        caller: UserId,
        target: UserId,
        reason: String,
    ) -> Result<(), RoomError> {
        self.send(RoomMessage::Reject {
            reply,
            caller,
            target,
            reason,
        })
        .await
    }

    /// Admit the current queue snapshot (moderators only).
    pub async fn admit_all(&self, reply: Reply, caller: UserId) -> Result<(), RoomError> {
        self.send(RoomMessage::AdmitAll { reply, caller }).await
    }

    /// Dispatch a media negotiation command.
    pub async fn media(
        &self,
        reply: Reply,
        user_id: UserId,
        command: MediaCommand,
    ) -> Result<(), RoomError> {
        self.send(RoomMessage::Media {
            reply,
            user_id,
            command,
        })
        .await
    }

    /// Notify of a dropped connection (starts the grace period, or
    /// withdraws a waiting entry).
    pub async fn connection_disconnected(&self, user_id: UserId) -> Result<(), RoomError> {
        self.send(RoomMessage::ConnectionDisconnected { user_id })
            .await
    }

    /// Get current room state.
    pub async fn get_state(&self) -> Result<RoomStateView, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::GetState { respond_to: tx }).await?;
        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for connection actors scoped to this room.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    async fn send(&self, message: RoomMessage) -> Result<(), RoomError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))
    }
}

/// A participant's published producer.
#[derive(Debug, Clone, Copy)]
struct ProducerState {
    id: ProducerId,
    paused: bool,
}

/// Participant state within a room.
#[derive(Debug)]
struct Participant {
    user_id: UserId,
    display_name: String,
    role: Role,
    /// Current connection (None during the disconnect grace period).
    connection: Option<ConnectionActorHandle>,
    connected: bool,
    /// Timestamp when disconnected (for the grace period).
    disconnected_at: Option<Instant>,
    hand_raised: bool,
    reaction: Option<String>,
    send_transport: Option<TransportId>,
    recv_transport: Option<TransportId>,
    /// At most one producer per kind.
    producers: HashMap<MediaKind, ProducerState>,
}

impl Participant {
    fn new(user_id: UserId, display_name: String, role: Role, connection: ConnectionActorHandle) -> Self {
        Self {
            user_id,
            display_name,
            role,
            connection: Some(connection),
            connected: true,
            disconnected_at: None,
            hand_raised: false,
            reaction: None,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
        }
    }

    /// Mute flags mirror producer state: a participant reads as muted
    /// unless an unpaused producer of the kind exists.
    fn active(&self, kind: MediaKind) -> bool {
        self.producers.get(&kind).is_some_and(|p| !p.paused)
    }

    fn to_info(&self) -> ParticipantInfo {
        let mut producers: Vec<ProducerInfo> = self
            .producers
            .iter()
            .map(|(kind, p)| ProducerInfo {
                id: p.id,
                kind: *kind,
                paused: p.paused,
            })
            .collect();
        producers.sort_by_key(|p| p.id.0);

        ParticipantInfo {
            user_id: self.user_id,
            display_name: self.display_name.clone(),
            role: self.role,
            connected: self.connected,
            is_muted: !self.active(MediaKind::Audio),
            is_video_off: !self.active(MediaKind::Video),
            hand_raised: self.hand_raised,
            reaction: self.reaction.clone(),
            producers,
        }
    }
}

/// A server-side consumer binding.
#[derive(Debug, Clone, Copy)]
struct ConsumerRecord {
    owner: UserId,
    producer_id: ProducerId,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    info: RoomInfo,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    relay: Arc<dyn RelayEngine>,
    participants: HashMap<UserId, Participant>,
    waiting: WaitingRoom,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
    timings: RoomTimings,
    /// Set while no participant is present; drives the end-of-room timer.
    empty_since: Option<Instant>,
    is_shutting_down: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        info: RoomInfo,
        relay: Arc<dyn RelayEngine>,
        cancel_token: CancellationToken,
        timings: RoomTimings,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let room_id = info.id;

        let actor = Self {
            info,
            receiver,
            cancel_token: cancel_token.clone(),
            relay,
            participants: HashMap::new(),
            waiting: WaitingRoom::new(),
            consumers: HashMap::new(),
            timings,
            empty_since: Some(Instant::now()),
            is_shutting_down: false,
            metrics: Arc::clone(&metrics),
            mailbox: MailboxMonitor::new(ActorType::Room, room_id.to_string()),
        };

        metrics.room_created();
        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "rc.actor.room", fields(room_id = %self.info.id))]
    async fn run(mut self) {
        info!(
            target: "rc.actor.room",
            room_id = %self.info.id,
            code = %self.info.code,
            "RoomActor started"
        );

        let mut grace_check = tokio::time::interval(GRACE_CHECK_INTERVAL);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rc.actor.room",
                        room_id = %self.info.id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = grace_check.tick() => {
                    self.check_disconnect_timeouts().await;
                    if self.check_empty_room().await {
                        break;
                    }
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
                                target: "rc.actor.room",
                                room_id = %self.info.id,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.metrics.room_closed();
        info!(
            target: "rc.actor.room",
            room_id = %self.info.id,
            participants = self.participants.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                reply,
                user_id,
                display_name,
                role_claim,
            } => {
                let result = self
                    .handle_join(&reply, user_id, display_name, role_claim)
                    .await;
                reply.send(result).await;
            }

            RoomMessage::Leave { reply, user_id } => {
                let result = self.handle_leave(user_id).await;
                reply.send(result).await;
            }

            RoomMessage::CloseRoom { reply, user_id } => {
                let result = self.handle_close_room(user_id).await;
                reply.send(result).await;
            }

            RoomMessage::Kick {
                reply,
                caller,
                target,
            } => {
                let result = self.handle_kick(caller, target).await;
                reply.send(result).await;
            }

            RoomMessage::MuteAll { reply, caller } => {
                let result = self.handle_mute_all(caller).await;
                reply.send(result).await;
            }

            RoomMessage::ChangeRole {
                reply,
                caller,
                target,
                role,
            } => {
                let result = self.handle_change_role(caller, target, role).await;
                reply.send(result).await;
            }

            RoomMessage::UpdateStatus {
                reply,
                user_id,
                hand_raised,
                reaction,
            } => {
                let result = self.handle_update_status(user_id, hand_raised, reaction).await;
                reply.send(result).await;
            }

            RoomMessage::Admit {
                reply,
                caller,
                target,
            } => {
                let result = self.handle_admit(caller, target).await;
                reply.send(result).await;
            }

            RoomMessage::Reject {
                reply,
                caller,
                target,
                reason,
            } => {
                let result = self.handle_reject(caller, target, reason).await;
                reply.send(result).await;
            }

            RoomMessage::AdmitAll { reply, caller } => {
                let result = self.handle_admit_all(caller).await;
                reply.send(result).await;
            }

            RoomMessage::Media {
                reply,
                user_id,
                command,
            } => {
                let result = self.handle_media(user_id, command).await;
                reply.send(result).await;
            }

            RoomMessage::ConnectionDisconnected { user_id } => {
                self.handle_disconnect(user_id).await;
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state_view());
            }
        }
    }

    /// Handle a join request.
    ///
    /// Moderators (room owner, or an elevated role claim) bypass the
    /// waiting room; everyone else is queued unless the feature is off.
    #[instrument(skip_all, fields(room_id = %self.info.id))]
    async fn handle_join(
        &mut self,
        reply: &Reply,
        user_id: UserId,
        display_name: String,
        role_claim: Option<Role>,
    ) -> Result<ResponseBody, RoomError> {
        if self.is_shutting_down || self.info.status == RoomStatus::Ended {
            return Err(RoomError::Draining);
        }

        // Reconnection during the grace period resumes the existing
        // participant with fresh media state.
        if let Some(existing) = self.participants.get(&user_id) {
            if existing.connected {
                return Err(RoomError::Conflict("Already in the room".to_string()));
            }
            return self.resume_participant(user_id, reply.connection().clone()).await;
        }

        if self.participants.len() as u32 >= self.info.max_participants {
            return Err(RoomError::CapacityExceeded(
                "Room is at capacity".to_string(),
            ));
        }

        let role = if user_id == self.info.owner {
            Role::Host
        } else if role_claim == Some(Role::CoHost) {
            Role::CoHost
        } else {
            Role::Participant
        };

        if !role.is_moderator() && self.info.features.waiting_room {
            let entry = WaitingEntry {
                info: WaitingInfo {
                    user_id,
                    display_name,
                    joined_at: chrono::Utc::now(),
                },
                connection: reply.connection().clone(),
            };
            let queued = self.waiting.push(entry.clone());
            if queued {
                self.broadcast_moderators(ServerEvent::WaitingJoined {
                    room_id: self.info.id,
                    entry: entry.info,
                })
                .await;
                debug!(
                    target: "rc.actor.room",
                    queue_depth = self.waiting.len(),
                    "Join queued in waiting room"
                );
            }
            return Ok(ResponseBody::Waiting {
                room_id: self.info.id,
            });
        }

        let snapshot =
            self.insert_participant(user_id, display_name, role, reply.connection().clone())
                .await;

        info!(
            target: "rc.actor.room",
            total_participants = self.participants.len(),
            role = %role,
            "Participant joined"
        );

        Ok(ResponseBody::Joined { snapshot })
    }

    /// Re-attach a disconnected participant to a new connection.
    async fn resume_participant(
        &mut self,
        user_id: UserId,
        connection: ConnectionActorHandle,
    ) -> Result<ResponseBody, RoomError> {
        self.teardown_media(user_id, true).await;

        let participant = self
            .participants
            .get_mut(&user_id)
            .ok_or(RoomError::ParticipantNotFound)?;
        participant.connection = Some(connection);
        participant.connected = true;
        participant.disconnected_at = None;

        let update = participant.to_info();
        self.broadcast(
            ServerEvent::ParticipantUpdated {
                room_id: self.info.id,
                participant: update,
            },
            Some(user_id),
        )
        .await;

        info!(
            target: "rc.actor.room",
            participant = %user_id,
            "Participant reconnected within grace period"
        );

        Ok(ResponseBody::Joined {
            snapshot: self.snapshot_for(user_id)?,
        })
    }

    /// Insert a new participant and broadcast the join. Returns the
    /// snapshot for the new participant.
    async fn insert_participant(
        &mut self,
        user_id: UserId,
        display_name: String,
        role: Role,
        connection: ConnectionActorHandle,
    ) -> RoomSnapshot {
        let participant = Participant::new(user_id, display_name, role, connection);
        let joined_info = participant.to_info();
        self.participants.insert(user_id, participant);

        self.info.status = RoomStatus::Live;
        self.empty_since = None;
        self.metrics.increment_participants();

        self.broadcast(
            ServerEvent::ParticipantJoined {
                room_id: self.info.id,
                participant: joined_info,
            },
            Some(user_id),
        )
        .await;

        // The participant was just inserted, so the snapshot exists.
        self.snapshot_for(user_id).unwrap_or(RoomSnapshot {
            room: self.info.clone(),
            you: ParticipantInfo {
                user_id,
                display_name: String::new(),
                role,
                connected: true,
                is_muted: true,
                is_video_off: true,
                hand_raised: false,
                reaction: None,
                producers: Vec::new(),
            },
            participants: Vec::new(),
            waiting: Vec::new(),
        })
    }

    /// Handle an explicit leave.
    #[instrument(skip_all, fields(room_id = %self.info.id))]
    async fn handle_leave(&mut self, user_id: UserId) -> Result<ResponseBody, RoomError> {
        // A queued (not yet admitted) user leaving withdraws the attempt.
        if self.waiting.remove(user_id).is_some() {
            self.broadcast_moderators(ServerEvent::WaitingLeft {
                room_id: self.info.id,
                user_id,
            })
            .await;
            return Ok(ResponseBody::Ack);
        }

        self.remove_participant(user_id, LeaveReason::Voluntary)
            .await?;

        info!(
            target: "rc.actor.room",
            remaining_participants = self.participants.len(),
            "Participant left"
        );

        Ok(ResponseBody::Ack)
    }

    /// Handle a host closing the room.
    async fn handle_close_room(&mut self, user_id: UserId) -> Result<ResponseBody, RoomError> {
        let role = self.role_of(user_id)?;
        if !role.is_host() {
            return Err(RoomError::PermissionDenied(
                "Only the host can close the room".to_string(),
            ));
        }

        self.close_room("Closed by host").await;
        Ok(ResponseBody::Ack)
    }

    /// Handle a moderator kicking a participant.
    #[instrument(skip_all, fields(room_id = %self.info.id))]
    async fn handle_kick(
        &mut self,
        caller: UserId,
        target: UserId,
    ) -> Result<ResponseBody, RoomError> {
        self.require_moderator(caller)?;

        let target_participant = self
            .participants
            .get(&target)
            .ok_or(RoomError::ParticipantNotFound)?;
        if target_participant.role.is_host() {
            return Err(RoomError::PermissionDenied(
                "Cannot kick the host".to_string(),
            ));
        }

        // Tell the target before tearing its state down; the frame is
        // already in its connection mailbox when the connection closes.
        if let Some(connection) = &target_participant.connection {
            let _ = connection
                .send_event(ServerEvent::Kicked {
                    room_id: self.info.id,
                    reason: "Removed by a moderator".to_string(),
                })
                .await;
        }

        self.remove_participant(target, LeaveReason::Kicked).await?;

        info!(
            target: "rc.actor.room",
            target = %target,
            "Participant kicked"
        );

        Ok(ResponseBody::Ack)
    }

    /// Handle mute-all: pause every non-moderator audio producer.
    async fn handle_mute_all(&mut self, caller: UserId) -> Result<ResponseBody, RoomError> {
        self.require_moderator(caller)?;

        let mut paused: Vec<(UserId, ProducerId)> = Vec::new();
        for participant in self.participants.values_mut() {
            if participant.role.is_moderator() {
                continue;
            }
            if let Some(producer) = participant.producers.get_mut(&MediaKind::Audio) {
                if !producer.paused {
                    producer.paused = true;
                    paused.push((participant.user_id, producer.id));
                }
            }
        }

        for (owner, producer_id) in paused {
            if let Err(e) = self.relay.pause_producer(producer_id).await {
                warn!(
                    target: "rc.actor.room",
                    producer_id = %producer_id,
                    error = %e,
                    "Relay pause failed during mute-all"
                );
            }
            self.broadcast(
                ServerEvent::ProducerPaused {
                    room_id: self.info.id,
                    owner,
                    producer_id,
                    kind: MediaKind::Audio,
                },
                None,
            )
            .await;
        }

        Ok(ResponseBody::Ack)
    }

    /// Handle a role change (host only).
    ///
    /// A user still in the waiting queue is not a participant; promoting
    /// them does not admit them (admission stays an explicit decision).
    async fn handle_change_role(
        &mut self,
        caller: UserId,
        target: UserId,
        role: Role,
    ) -> Result<ResponseBody, RoomError> {
        let caller_role = self.role_of(caller)?;
        if !caller_role.is_host() {
            return Err(RoomError::PermissionDenied(
                "Only the host can change roles".to_string(),
            ));
        }
        if target == self.info.owner {
            return Err(RoomError::PermissionDenied(
                "Cannot change the host's role".to_string(),
            ));
        }

        let participant = self
            .participants
            .get_mut(&target)
            .ok_or(RoomError::ParticipantNotFound)?;
        participant.role = role;

        self.broadcast(
            ServerEvent::RoleChanged {
                room_id: self.info.id,
                user_id: target,
                role,
            },
            None,
        )
        .await;

        Ok(ResponseBody::Ack)
    }

    /// Handle a hand-raise / reaction update.
    async fn handle_update_status(
        &mut self,
        user_id: UserId,
        hand_raised: bool,
        reaction: Option<String>,
    ) -> Result<ResponseBody, RoomError> {
        let participant = self
            .participants
            .get_mut(&user_id)
            .ok_or(RoomError::ParticipantNotFound)?;
        participant.hand_raised = hand_raised;
        participant.reaction = reaction;
        let update = participant.to_info();

        self.broadcast(
            ServerEvent::ParticipantUpdated {
                room_id: self.info.id,
                participant: update,
            },
            Some(user_id),
        )
        .await;

        Ok(ResponseBody::Ack)
    }

    /// Handle admitting one waiting user.
    #[instrument(skip_all, fields(room_id = %self.info.id))]
    async fn handle_admit(
        &mut self,
        caller: UserId,
        target: UserId,
    ) -> Result<ResponseBody, RoomError> {
        self.require_moderator(caller)?;

        let entry = self
            .waiting
            .remove(target)
            .ok_or(RoomError::ParticipantNotFound)?;
        self.admit_entry(entry).await;

        Ok(ResponseBody::Ack)
    }

    /// Handle rejecting one waiting user.
    async fn handle_reject(
        &mut self,
        caller: UserId,
        target: UserId,
        reason: String,
    ) -> Result<ResponseBody, RoomError> {
        self.require_moderator(caller)?;

        let entry = self
            .waiting
            .remove(target)
            .ok_or(RoomError::ParticipantNotFound)?;

        let _ = entry
            .connection
            .send_event(ServerEvent::Rejected {
                room_id: self.info.id,
                message: reason,
            })
            .await;

        self.broadcast_moderators(ServerEvent::WaitingLeft {
            room_id: self.info.id,
            user_id: target,
        })
        .await;

        info!(
            target: "rc.actor.room",
            target = %target,
            "Waiting entry rejected"
        );

        Ok(ResponseBody::Ack)
    }

    /// Handle admitting the current queue snapshot. Entries arriving
    /// while this runs wait for a subsequent call.
    async fn handle_admit_all(&mut self, caller: UserId) -> Result<ResponseBody, RoomError> {
        self.require_moderator(caller)?;

        let snapshot = self.waiting.drain_snapshot();
        let admitted = snapshot.len();
        for entry in snapshot {
            self.admit_entry(entry).await;
        }

        info!(
            target: "rc.actor.room",
            admitted,
            "Admitted waiting-room snapshot"
        );

        Ok(ResponseBody::Ack)
    }

    /// Admit one dequeued entry: create the participant, notify the
    /// admitted client with the snapshot (keyed by resolved room id),
    /// and update everyone else.
    async fn admit_entry(&mut self, entry: WaitingEntry) {
        let user_id = entry.info.user_id;
        let connection = entry.connection.clone();

        let snapshot = self
            .insert_participant(
                user_id,
                entry.info.display_name.clone(),
                Role::Participant,
                entry.connection,
            )
            .await;

        let _ = connection
            .send_event(ServerEvent::Admitted {
                room_id: self.info.id,
                message: format!("Admitted to \"{}\"", self.info.title),
                snapshot,
            })
            .await;

        self.broadcast_moderators(ServerEvent::WaitingLeft {
            room_id: self.info.id,
            user_id,
        })
        .await;
    }

    /// Dispatch a media command for one participant.
    async fn handle_media(
        &mut self,
        user_id: UserId,
        command: MediaCommand,
    ) -> Result<ResponseBody, RoomError> {
        if !self.participants.contains_key(&user_id) {
            return Err(RoomError::ParticipantNotFound);
        }

        match command {
            MediaCommand::RouterCapabilities => {
                let capabilities = self
                    .relay
                    .router_capabilities(self.info.id)
                    .await
                    .map_err(RoomError::from)?;
                Ok(ResponseBody::RouterCapabilities { capabilities })
            }

            MediaCommand::CreateTransport { direction } => {
                self.handle_create_transport(user_id, direction).await
            }

            MediaCommand::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.verify_transport(user_id, transport_id)?;
                self.relay
                    .connect_transport(transport_id, dtls_parameters)
                    .await
                    .map_err(RoomError::from)?;
                Ok(ResponseBody::Ack)
            }

            MediaCommand::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                self.handle_produce(user_id, transport_id, kind, rtp_parameters)
                    .await
            }

            MediaCommand::CloseProducer { kind } => {
                // Safe on an already-closed producer.
                self.close_producer_of(user_id, kind).await;
                Ok(ResponseBody::Ack)
            }

            MediaCommand::PauseProducer { kind } => {
                self.set_producer_paused(user_id, kind, true).await
            }

            MediaCommand::ResumeProducer { kind } => {
                self.set_producer_paused(user_id, kind, false).await
            }

            MediaCommand::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                self.handle_consume(user_id, producer_id, rtp_capabilities)
                    .await
            }

            MediaCommand::ResumeConsumer { consumer_id } => {
                let record = self
                    .consumers
                    .get(&consumer_id)
                    .ok_or(RoomError::ConsumerNotFound)?;
                if record.owner != user_id {
                    return Err(RoomError::ConsumerNotFound);
                }
                self.relay
                    .resume_consumer(consumer_id)
                    .await
                    .map_err(RoomError::from)?;
                Ok(ResponseBody::Ack)
            }
        }
    }

    async fn handle_create_transport(
        &mut self,
        user_id: UserId,
        direction: TransportDirection,
    ) -> Result<ResponseBody, RoomError> {
        let params = self
            .relay
            .create_transport(self.info.id, direction)
            .await
            .map_err(RoomError::from)?;

        let participant = self
            .participants
            .get_mut(&user_id)
            .ok_or(RoomError::ParticipantNotFound)?;
        let slot = match direction {
            TransportDirection::Send => &mut participant.send_transport,
            TransportDirection::Recv => &mut participant.recv_transport,
        };
        // A re-created transport replaces the prior one (reconnects).
        let stale = slot.replace(params.id);
        if let Some(stale_id) = stale {
            let _ = self.relay.close_transport(stale_id).await;
        }

        debug!(
            target: "rc.actor.room",
            participant = %user_id,
            transport_id = %params.id,
            direction = direction.as_str(),
            "Transport created"
        );

        Ok(ResponseBody::TransportCreated { transport: params })
    }

    async fn handle_produce(
        &mut self,
        user_id: UserId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ResponseBody, RoomError> {
        if kind == MediaKind::Screen && !self.info.features.screen_share {
            return Err(RoomError::PermissionDenied(
                "Screen share is disabled in this room".to_string(),
            ));
        }

        {
            let participant = self
                .participants
                .get(&user_id)
                .ok_or(RoomError::ParticipantNotFound)?;
            if participant.send_transport != Some(transport_id) {
                return Err(RoomError::TransportNotFound);
            }
            if participant.producers.contains_key(&kind) && kind != MediaKind::Screen {
                return Err(RoomError::Conflict(format!(
                    "A {kind} producer already exists"
                )));
            }
        }

        // Screen share replaces any prior screen producer.
        if kind == MediaKind::Screen {
            self.close_producer_of(user_id, MediaKind::Screen).await;
        }

        let producer_id = self
            .relay
            .produce(transport_id, kind, rtp_parameters)
            .await
            .map_err(RoomError::from)?;

        if let Some(participant) = self.participants.get_mut(&user_id) {
            participant.producers.insert(
                kind,
                ProducerState {
                    id: producer_id,
                    paused: false,
                },
            );
        }

        // Producer events go to everyone, the owner included, so every
        // registry mirror (the owner's own too) tracks producer state.
        self.broadcast(
            ServerEvent::ProducerNew {
                room_id: self.info.id,
                owner: user_id,
                producer_id,
                kind,
            },
            None,
        )
        .await;

        debug!(
            target: "rc.actor.room",
            participant = %user_id,
            producer_id = %producer_id,
            kind = kind.as_str(),
            "Producer created"
        );

        Ok(ResponseBody::Produced { producer_id })
    }

    async fn handle_consume(
        &mut self,
        user_id: UserId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ResponseBody, RoomError> {
        let recv_transport = self
            .participants
            .get(&user_id)
            .ok_or(RoomError::ParticipantNotFound)?
            .recv_transport
            .ok_or(RoomError::TransportNotFound)?;

        let owner = self
            .participants
            .values()
            .find(|p| p.producers.values().any(|prod| prod.id == producer_id))
            .map(|p| p.user_id)
            .ok_or(RoomError::ProducerNotFound)?;
        if owner == user_id {
            return Err(RoomError::Conflict(
                "Cannot consume your own producer".to_string(),
            ));
        }

        let consumer: ConsumerParams = self
            .relay
            .consume(recv_transport, producer_id, rtp_capabilities)
            .await
            .map_err(RoomError::from)?;

        self.consumers.insert(
            consumer.id,
            ConsumerRecord {
                owner: user_id,
                producer_id,
            },
        );

        debug!(
            target: "rc.actor.room",
            participant = %user_id,
            consumer_id = %consumer.id,
            producer_id = %producer_id,
            "Consumer bound"
        );

        Ok(ResponseBody::Consumed { consumer })
    }

    /// Pause or resume a participant's producer, mirroring to the relay
    /// and broadcasting so mute indicators stay correct. No-op if the
    /// producer is already in the target state.
    async fn set_producer_paused(
        &mut self,
        user_id: UserId,
        kind: MediaKind,
        paused: bool,
    ) -> Result<ResponseBody, RoomError> {
        let participant = self
            .participants
            .get_mut(&user_id)
            .ok_or(RoomError::ParticipantNotFound)?;
        let producer = participant
            .producers
            .get_mut(&kind)
            .ok_or(RoomError::ProducerNotFound)?;

        if producer.paused == paused {
            return Ok(ResponseBody::Ack);
        }
        producer.paused = paused;
        let producer_id = producer.id;

        let relay_result = if paused {
            self.relay.pause_producer(producer_id).await
        } else {
            self.relay.resume_producer(producer_id).await
        };
        if let Err(e) = relay_result {
            warn!(
                target: "rc.actor.room",
                producer_id = %producer_id,
                error = %e,
                "Relay pause/resume failed"
            );
        }

        let event = if paused {
            ServerEvent::ProducerPaused {
                room_id: self.info.id,
                owner: user_id,
                producer_id,
                kind,
            }
        } else {
            ServerEvent::ProducerResumed {
                room_id: self.info.id,
                owner: user_id,
                producer_id,
                kind,
            }
        };
        self.broadcast(event, None).await;

        Ok(ResponseBody::Ack)
    }

    /// Close one producer of a participant, cascading server-side
    /// consumer records and broadcasting the closure. No-op if absent.
    async fn close_producer_of(&mut self, user_id: UserId, kind: MediaKind) {
        let producer = match self
            .participants
            .get_mut(&user_id)
            .and_then(|p| p.producers.remove(&kind))
        {
            Some(producer) => producer,
            None => return,
        };

        if let Err(e) = self.relay.close_producer(producer.id).await {
            debug!(
                target: "rc.actor.room",
                producer_id = %producer.id,
                error = %e,
                "Relay close_producer failed (already gone?)"
            );
        }

        // No consumer outlives its source producer.
        self.consumers.retain(|_, c| c.producer_id != producer.id);

        self.broadcast(
            ServerEvent::ProducerClosed {
                room_id: self.info.id,
                owner: user_id,
                producer_id: producer.id,
                kind,
            },
            None,
        )
        .await;
    }

    /// Handle a dropped connection: withdraw a waiting entry, or start
    /// the disconnect grace period for a participant.
    async fn handle_disconnect(&mut self, user_id: UserId) {
        if self.waiting.remove(user_id).is_some() {
            self.broadcast_moderators(ServerEvent::WaitingLeft {
                room_id: self.info.id,
                user_id,
            })
            .await;
            return;
        }

        let Some(participant) = self.participants.get_mut(&user_id) else {
            return;
        };
        participant.connected = false;
        participant.disconnected_at = Some(Instant::now());
        participant.connection = None;
        let update = participant.to_info();

        self.broadcast(
            ServerEvent::ParticipantUpdated {
                room_id: self.info.id,
                participant: update,
            },
            Some(user_id),
        )
        .await;

        info!(
            target: "rc.actor.room",
            room_id = %self.info.id,
            participant = %user_id,
            "Participant disconnected, grace period started"
        );
    }

    /// Remove a participant and tear down every resource they own.
    async fn remove_participant(
        &mut self,
        user_id: UserId,
        reason: LeaveReason,
    ) -> Result<(), RoomError> {
        if !self.participants.contains_key(&user_id) {
            return Err(RoomError::ParticipantNotFound);
        }

        self.teardown_media(user_id, false).await;
        self.participants.remove(&user_id);
        self.metrics.decrement_participants();

        self.broadcast(
            ServerEvent::ParticipantLeft {
                room_id: self.info.id,
                user_id,
                reason,
            },
            None,
        )
        .await;

        if self.participants.is_empty() {
            self.empty_since = Some(Instant::now());
        }

        Ok(())
    }

    /// Close a participant's producers, transports, and consumer
    /// records. With `broadcast_closures`, each producer closure is
    /// announced (used on resume, where no participant-left event will
    /// tell the other clients to drop their consumers).
    async fn teardown_media(&mut self, user_id: UserId, broadcast_closures: bool) {
        let Some(participant) = self.participants.get_mut(&user_id) else {
            return;
        };
        let producers: Vec<(MediaKind, ProducerState)> =
            participant.producers.drain().collect();
        let transports: Vec<TransportId> = participant
            .send_transport
            .take()
            .into_iter()
            .chain(participant.recv_transport.take())
            .collect();

        for (kind, producer) in producers {
            let _ = self.relay.close_producer(producer.id).await;
            self.consumers.retain(|_, c| c.producer_id != producer.id);
            if broadcast_closures {
                self.broadcast(
                    ServerEvent::ProducerClosed {
                        room_id: self.info.id,
                        owner: user_id,
                        producer_id: producer.id,
                        kind,
                    },
                    Some(user_id),
                )
                .await;
            }
        }

        for transport in transports {
            let _ = self.relay.close_transport(transport).await;
        }

        // Consumers the participant held on others' producers.
        self.consumers.retain(|_, c| c.owner != user_id);
    }

    /// End the room: notify everyone (including the waiting queue) and
    /// cancel the actor.
    async fn close_room(&mut self, reason: &str) {
        if self.info.status == RoomStatus::Ended {
            return;
        }

        info!(
            target: "rc.actor.room",
            room_id = %self.info.id,
            reason = %reason,
            participants = self.participants.len(),
            waiting = self.waiting.len(),
            "Closing room"
        );

        self.info.status = RoomStatus::Ended;
        self.is_shutting_down = true;

        let event = ServerEvent::RoomClosed {
            room_id: self.info.id,
            reason: reason.to_string(),
        };
        self.broadcast(event.clone(), None).await;
        for entry in self.waiting.drain_snapshot() {
            let _ = entry.connection.send_event(event.clone()).await;
        }

        let user_ids: Vec<UserId> = self.participants.keys().copied().collect();
        for user_id in user_ids {
            self.teardown_media(user_id, false).await;
        }
        self.participants.clear();

        self.cancel_token.cancel();
    }

    /// Check for disconnect grace periods that have expired.
    async fn check_disconnect_timeouts(&mut self) {
        let now = Instant::now();
        let timed_out: Vec<UserId> = self
            .participants
            .values()
            .filter(|p| {
                !p.connected
                    && p.disconnected_at
                        .is_some_and(|at| now.duration_since(at) >= self.timings.disconnect_grace)
            })
            .map(|p| p.user_id)
            .collect();

        for user_id in timed_out {
            info!(
                target: "rc.actor.room",
                room_id = %self.info.id,
                participant = %user_id,
                "Disconnect grace period expired, removing participant"
            );
            let _ = self
                .remove_participant(user_id, LeaveReason::ConnectionTimeout)
                .await;
        }
    }

    /// End the room once it has been empty past the grace period.
    /// Returns true when the actor should exit.
    async fn check_empty_room(&mut self) -> bool {
        let expired = self
            .empty_since
            .is_some_and(|since| since.elapsed() >= self.timings.empty_room_grace);
        if expired && self.participants.is_empty() {
            self.close_room("Room empty").await;
            return true;
        }
        false
    }

    fn role_of(&self, user_id: UserId) -> Result<Role, RoomError> {
        self.participants
            .get(&user_id)
            .map(|p| p.role)
            .ok_or(RoomError::ParticipantNotFound)
    }

    fn require_moderator(&self, user_id: UserId) -> Result<(), RoomError> {
        if self.role_of(user_id)?.is_moderator() {
            Ok(())
        } else {
            Err(RoomError::PermissionDenied(
                "Only moderators may do this".to_string(),
            ))
        }
    }

    fn verify_transport(&self, user_id: UserId, transport_id: TransportId) -> Result<(), RoomError> {
        let participant = self
            .participants
            .get(&user_id)
            .ok_or(RoomError::ParticipantNotFound)?;
        if participant.send_transport == Some(transport_id)
            || participant.recv_transport == Some(transport_id)
        {
            Ok(())
        } else {
            Err(RoomError::TransportNotFound)
        }
    }

    /// Snapshot for one participant: the room, their own entry, and
    /// every other participant with their producers. Moderators also
    /// see the waiting queue.
    fn snapshot_for(&self, user_id: UserId) -> Result<RoomSnapshot, RoomError> {
        let you = self
            .participants
            .get(&user_id)
            .map(Participant::to_info)
            .ok_or(RoomError::ParticipantNotFound)?;
        let participants: Vec<ParticipantInfo> = self
            .participants
            .values()
            .filter(|p| p.user_id != user_id)
            .map(Participant::to_info)
            .collect();
        let waiting = if you.role.is_moderator() {
            self.waiting.infos()
        } else {
            Vec::new()
        };

        Ok(RoomSnapshot {
            room: self.info.clone(),
            you,
            participants,
            waiting,
        })
    }

    fn state_view(&self) -> RoomStateView {
        RoomStateView {
            info: self.info.clone(),
            participants: self.participants.values().map(Participant::to_info).collect(),
            waiting: self.waiting.infos(),
            consumer_count: self.consumers.len(),
            is_shutting_down: self.is_shutting_down,
        }
    }

    /// Broadcast an event to all connected participants except `except`.
    async fn broadcast(&self, event: ServerEvent, except: Option<UserId>) {
        for participant in self.participants.values() {
            if Some(participant.user_id) == except {
                continue;
            }
            if let Some(connection) = &participant.connection {
                let _ = connection.send_event(event.clone()).await;
            }
        }
    }

    /// Broadcast an event to connected moderators only.
    async fn broadcast_moderators(&self, event: ServerEvent) {
        for participant in self.participants.values() {
            if !participant.role.is_moderator() {
                continue;
            }
            if let Some(connection) = &participant.connection {
                let _ = connection.send_event(event.clone()).await;
            }
        }
    }

    /// Perform graceful shutdown on cancellation.
    async fn graceful_shutdown(&mut self) {
        if self.info.status != RoomStatus::Ended {
            self.info.status = RoomStatus::Ended;
            self.is_shutting_down = true;

            let event = ServerEvent::RoomClosed {
                room_id: self.info.id,
                reason: "Server shutting down".to_string(),
            };
            self.broadcast(event.clone(), None).await;
            for entry in self.waiting.drain_snapshot() {
                let _ = entry.connection.send_event(event.clone()).await;
            }
        }

        info!(
            target: "rc.actor.room",
            room_id = %self.info.id,
            "Graceful shutdown complete"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::actors::spawn_connection;
    use crate::relay::LoopbackRelay;
    use futures_util::StreamExt;
    use room_protocol::{Frame, FrameCodec, RoomFeatures};
    use serde_json::json;
    use tokio_util::codec::FramedRead;

    struct TestClient {
        user_id: UserId,
        connection: ConnectionActorHandle,
        reader: FramedRead<tokio::io::DuplexStream, FrameCodec>,
    }

    impl TestClient {
        fn new(metrics: &Arc<ActorMetrics>) -> Self {
            let user_id = UserId::new();
            let (server_end, client_end) = tokio::io::duplex(256 * 1024);
            let (connection, _task) = spawn_connection(
                format!("conn-{user_id}"),
                server_end,
                CancellationToken::new(),
                Arc::clone(metrics),
            );
            Self {
                user_id,
                connection,
                reader: FramedRead::new(client_end, FrameCodec::new()),
            }
        }

        fn reply(&self, request_id: u64) -> Reply {
            Reply::new(self.connection.clone(), request_id)
        }

        async fn next_frame(&mut self) -> Frame {
            tokio::time::timeout(Duration::from_secs(2), self.reader.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("codec error")
        }

        async fn expect_response(&mut self, request_id: u64) -> ResponseBody {
            loop {
                match self.next_frame().await {
                    Frame::Response { id, response } if id == request_id => return response,
                    Frame::Error { id, code, message } if id == request_id => {
                        panic!("request {id} failed: {code:?} {message}")
                    }
                    _ => {}
                }
            }
        }

        async fn expect_error(&mut self, request_id: u64) -> room_protocol::ErrorCode {
            loop {
                match self.next_frame().await {
                    Frame::Error { id, code, .. } if id == request_id => return code,
                    Frame::Response { id, .. } if id == request_id => {
                        panic!("request {id} unexpectedly succeeded")
                    }
                    _ => {}
                }
            }
        }
    }

    fn spawn_room(owner: UserId) -> (RoomActorHandle, Arc<LoopbackRelay>, Arc<ActorMetrics>) {
        spawn_room_with(owner, RoomFeatures::default(), RoomTimings::default())
    }

    fn spawn_room_with(
        owner: UserId,
        features: RoomFeatures,
        timings: RoomTimings,
    ) -> (RoomActorHandle, Arc<LoopbackRelay>, Arc<ActorMetrics>) {
        let relay = Arc::new(LoopbackRelay::new());
        let metrics = ActorMetrics::new();
        let info = RoomInfo {
            id: RoomId::new(),
            code: "TEST-CODE-1".to_string(),
            title: "Standup".to_string(),
            status: RoomStatus::Created,
            owner,
            max_participants: 10,
            features,
        };
        let (handle, _task) = RoomActor::spawn(
            info,
            Arc::clone(&relay) as Arc<dyn RelayEngine>,
            CancellationToken::new(),
            timings,
            Arc::clone(&metrics),
        );
        (handle, relay, metrics)
    }

    async fn join_as_owner(handle: &RoomActorHandle, client: &mut TestClient) -> RoomSnapshot {
        handle
            .join(client.reply(1), client.user_id, "Host".to_string(), None)
            .await
            .unwrap();
        match client.expect_response(1).await {
            ResponseBody::Joined { snapshot } => snapshot,
            other => panic!("expected Joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_owner_join_bypasses_waiting_room() {
        let metrics_owner = ActorMetrics::new();
        let mut host = TestClient::new(&metrics_owner);
        let (handle, _relay, _metrics) = spawn_room(host.user_id);

        let snapshot = join_as_owner(&handle, &mut host).await;
        assert_eq!(snapshot.you.role, Role::Host);
        assert!(snapshot.participants.is_empty());

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.info.status, RoomStatus::Live);
        assert!(state.waiting.is_empty());

        handle.cancel();
    }

    #[tokio::test]
    async fn test_non_host_join_is_queued() {
        let metrics = ActorMetrics::new();
        let mut host = TestClient::new(&metrics);
        let mut guest = TestClient::new(&metrics);
        let (handle, _relay, _) = spawn_room(host.user_id);

        join_as_owner(&handle, &mut host).await;

        handle
            .join(guest.reply(1), guest.user_id, "Guest".to_string(), None)
            .await
            .unwrap();
        match guest.expect_response(1).await {
            ResponseBody::Waiting { room_id } => assert_eq!(room_id, handle.room_id()),
            other => panic!("expected Waiting, got {other:?}"),
        }

        // Host sees the queue entry.
        loop {
            if let Frame::Event {
                event: ServerEvent::WaitingJoined { entry, .. },
            } = host.next_frame().await
            {
                assert_eq!(entry.user_id, guest.user_id);
                break;
            }
        }

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.waiting.len(), 1);
        assert_eq!(state.participants.len(), 1);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_co_host_claim_bypasses_waiting_room() {
        let metrics = ActorMetrics::new();
        let mut host = TestClient::new(&metrics);
        let mut cohost = TestClient::new(&metrics);
        let (handle, _relay, _) = spawn_room(host.user_id);

        join_as_owner(&handle, &mut host).await;

        handle
            .join(
                cohost.reply(1),
                cohost.user_id,
                "Helper".to_string(),
                Some(Role::CoHost),
            )
            .await
            .unwrap();
        match cohost.expect_response(1).await {
            ResponseBody::Joined { snapshot } => assert_eq!(snapshot.you.role, Role::CoHost),
            other => panic!("expected Joined, got {other:?}"),
        }

        handle.cancel();
    }

    #[tokio::test]
    async fn test_admit_moves_guest_into_room() {
        let metrics = ActorMetrics::new();
        let mut host = TestClient::new(&metrics);
        let mut guest = TestClient::new(&metrics);
        let (handle, _relay, _) = spawn_room(host.user_id);

        join_as_owner(&handle, &mut host).await;
        handle
            .join(guest.reply(1), guest.user_id, "Guest".to_string(), None)
            .await
            .unwrap();
        guest.expect_response(1).await;

        handle
            .admit(host.reply(2), host.user_id, guest.user_id)
            .await
            .unwrap();
        host.expect_response(2).await;

        // Admitted event carries the snapshot keyed by room id.
        loop {
            if let Frame::Event {
                event: ServerEvent::Admitted { room_id, snapshot, .. },
            } = guest.next_frame().await
            {
                assert_eq!(room_id, handle.room_id());
                assert_eq!(snapshot.you.role, Role::Participant);
                assert_eq!(snapshot.participants.len(), 1);
                break;
            }
        }

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 2);
        assert!(state.waiting.is_empty());

        handle.cancel();
    }

    #[tokio::test]
    async fn test_admit_requires_moderator() {
        let metrics = ActorMetrics::new();
        let mut host = TestClient::new(&metrics);
        let mut guest_a = TestClient::new(&metrics);
        let mut guest_b = TestClient::new(&metrics);
        let (handle, _relay, _) = spawn_room(host.user_id);

        join_as_owner(&handle, &mut host).await;
        handle
            .join(guest_a.reply(1), guest_a.user_id, "A".to_string(), None)
            .await
            .unwrap();
        guest_a.expect_response(1).await;
        handle
            .admit(host.reply(2), host.user_id, guest_a.user_id)
            .await
            .unwrap();
        host.expect_response(2).await;

        handle
            .join(guest_b.reply(1), guest_b.user_id, "B".to_string(), None)
            .await
            .unwrap();
        guest_b.expect_response(1).await;

        // A plain participant cannot admit.
        handle
            .admit(guest_a.reply(5), guest_a.user_id, guest_b.user_id)
            .await
            .unwrap();
        assert_eq!(
            guest_a.expect_error(5).await,
            room_protocol::ErrorCode::Unauthorized
        );

        handle.cancel();
    }

    #[tokio::test]
    async fn test_reject_is_terminal_and_carries_reason() {
        let metrics = ActorMetrics::new();
        let mut host = TestClient::new(&metrics);
        let mut guest = TestClient::new(&metrics);
        let (handle, _relay, _) = spawn_room(host.user_id);

        join_as_owner(&handle, &mut host).await;
        handle
            .join(guest.reply(1), guest.user_id, "Guest".to_string(), None)
            .await
            .unwrap();
        guest.expect_response(1).await;

        handle
            .reject(
                host.reply(2),
                host.user_id,
                guest.user_id,
                "room full".to_string(),
            )
            .await
            .unwrap();
        host.expect_response(2).await;

        loop {
            if let Frame::Event {
                event: ServerEvent::Rejected { message, .. },
            } = guest.next_frame().await
            {
                assert_eq!(message, "room full");
                break;
            }
        }

        let state = handle.get_state().await.unwrap();
        assert!(state.waiting.is_empty());
        assert_eq!(state.participants.len(), 1);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_join_conflicts() {
        let metrics = ActorMetrics::new();
        let mut host = TestClient::new(&metrics);
        let (handle, _relay, _) = spawn_room(host.user_id);

        join_as_owner(&handle, &mut host).await;

        handle
            .join(host.reply(7), host.user_id, "Host".to_string(), None)
            .await
            .unwrap();
        assert_eq!(
            host.expect_error(7).await,
            room_protocol::ErrorCode::Conflict
        );

        handle.cancel();
    }

    #[tokio::test]
    async fn test_produce_then_pause_mirrors_mute_flag() {
        let metrics = ActorMetrics::new();
        let mut host = TestClient::new(&metrics);
        let (handle, _relay, _) = spawn_room(host.user_id);

        join_as_owner(&handle, &mut host).await;

        handle
            .media(
                host.reply(2),
                host.user_id,
                MediaCommand::CreateTransport {
                    direction: TransportDirection::Send,
                },
            )
            .await
            .unwrap();
        let transport_id = match host.expect_response(2).await {
            ResponseBody::TransportCreated { transport } => transport.id,
            other => panic!("expected TransportCreated, got {other:?}"),
        };

        handle
            .media(
                host.reply(3),
                host.user_id,
                MediaCommand::Produce {
                    transport_id,
                    kind: MediaKind::Audio,
                    rtp_parameters: RtpParameters(json!({})),
                },
            )
            .await
            .unwrap();
        host.expect_response(3).await;

        let state = handle.get_state().await.unwrap();
        let me = state.participants.first().unwrap();
        assert!(!me.is_muted);

        handle
            .media(
                host.reply(4),
                host.user_id,
                MediaCommand::PauseProducer {
                    kind: MediaKind::Audio,
                },
            )
            .await
            .unwrap();
        host.expect_response(4).await;

        let state = handle.get_state().await.unwrap();
        let me = state.participants.first().unwrap();
        assert!(me.is_muted);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_audio_producer_conflicts() {
        let metrics = ActorMetrics::new();
        let mut host = TestClient::new(&metrics);
        let (handle, _relay, _) = spawn_room(host.user_id);

        join_as_owner(&handle, &mut host).await;
        handle
            .media(
                host.reply(2),
                host.user_id,
                MediaCommand::CreateTransport {
                    direction: TransportDirection::Send,
                },
            )
            .await
            .unwrap();
        let transport_id = match host.expect_response(2).await {
            ResponseBody::TransportCreated { transport } => transport.id,
            other => panic!("expected TransportCreated, got {other:?}"),
        };

        for id in [3, 4] {
            handle
                .media(
                    host.reply(id),
                    host.user_id,
                    MediaCommand::Produce {
                        transport_id,
                        kind: MediaKind::Audio,
                        rtp_parameters: RtpParameters(json!({})),
                    },
                )
                .await
                .unwrap();
        }
        host.expect_response(3).await;
        assert_eq!(
            host.expect_error(4).await,
            room_protocol::ErrorCode::Conflict
        );

        handle.cancel();
    }

    #[tokio::test]
    async fn test_close_producer_cascades_consumer_records() {
        let metrics = ActorMetrics::new();
        let mut host = TestClient::new(&metrics);
        let mut cohost = TestClient::new(&metrics);
        let (handle, relay, _) = spawn_room(host.user_id);

        join_as_owner(&handle, &mut host).await;
        handle
            .join(
                cohost.reply(1),
                cohost.user_id,
                "Helper".to_string(),
                Some(Role::CoHost),
            )
            .await
            .unwrap();
        cohost.expect_response(1).await;

        // Host produces audio.
        handle
            .media(
                host.reply(2),
                host.user_id,
                MediaCommand::CreateTransport {
                    direction: TransportDirection::Send,
                },
            )
            .await
            .unwrap();
        let send_id = match host.expect_response(2).await {
            ResponseBody::TransportCreated { transport } => transport.id,
            other => panic!("expected TransportCreated, got {other:?}"),
        };
        handle
            .media(
                host.reply(3),
                host.user_id,
                MediaCommand::Produce {
                    transport_id: send_id,
                    kind: MediaKind::Audio,
                    rtp_parameters: RtpParameters(json!({})),
                },
            )
            .await
            .unwrap();
        let producer_id = match host.expect_response(3).await {
            ResponseBody::Produced { producer_id } => producer_id,
            other => panic!("expected Produced, got {other:?}"),
        };

        // Co-host consumes it.
        handle
            .media(
                cohost.reply(2),
                cohost.user_id,
                MediaCommand::CreateTransport {
                    direction: TransportDirection::Recv,
                },
            )
            .await
            .unwrap();
        cohost.expect_response(2).await;
        handle
            .media(
                cohost.reply(3),
                cohost.user_id,
                MediaCommand::Consume {
                    producer_id,
                    rtp_capabilities: RtpCapabilities { rtp: json!({}) },
                },
            )
            .await
            .unwrap();
        let consumer = match cohost.expect_response(3).await {
            ResponseBody::Consumed { consumer } => consumer,
            other => panic!("expected Consumed, got {other:?}"),
        };
        assert!(consumer.paused);
        assert_eq!(handle.get_state().await.unwrap().consumer_count, 1);

        // Closing the producer cascades.
        handle
            .media(
                host.reply(4),
                host.user_id,
                MediaCommand::CloseProducer {
                    kind: MediaKind::Audio,
                },
            )
            .await
            .unwrap();
        host.expect_response(4).await;

        assert_eq!(handle.get_state().await.unwrap().consumer_count, 0);
        assert!(!relay.has_consumer(consumer.id));

        // Closing again is safe.
        handle
            .media(
                host.reply(5),
                host.user_id,
                MediaCommand::CloseProducer {
                    kind: MediaKind::Audio,
                },
            )
            .await
            .unwrap();
        host.expect_response(5).await;

        handle.cancel();
    }

    /// Disconnect grace period: the participant is removed only after
    /// the grace period elapses without reconnection.
    #[tokio::test(start_paused = true)]
    async fn test_disconnect_grace_period_expires() {
        let metrics = ActorMetrics::new();
        let mut host = TestClient::new(&metrics);
        let mut cohost = TestClient::new(&metrics);
        let (handle, _relay, _) = spawn_room_with(
            host.user_id,
            RoomFeatures::default(),
            RoomTimings {
                disconnect_grace: Duration::from_secs(30),
                empty_room_grace: Duration::from_secs(600),
            },
        );

        join_as_owner(&handle, &mut host).await;
        handle
            .join(
                cohost.reply(1),
                cohost.user_id,
                "Helper".to_string(),
                Some(Role::CoHost),
            )
            .await
            .unwrap();
        cohost.expect_response(1).await;

        handle.connection_disconnected(cohost.user_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 2);
        let dropped = state
            .participants
            .iter()
            .find(|p| p.user_id == cohost.user_id)
            .unwrap();
        assert!(!dropped.connected);

        // Still present before the grace period elapses.
        tokio::time::advance(Duration::from_secs(29)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.get_state().await.unwrap().participants.len(), 2);

        // Removed after it does.
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.get_state().await.unwrap().participants.len(), 1);

        handle.cancel();
    }

    /// An empty room ends after the empty-room grace period.
    #[tokio::test(start_paused = true)]
    async fn test_empty_room_ends_after_grace() {
        let metrics = ActorMetrics::new();
        let mut host = TestClient::new(&metrics);
        let (handle, _relay, _) = spawn_room_with(
            host.user_id,
            RoomFeatures::default(),
            RoomTimings {
                disconnect_grace: Duration::from_secs(30),
                empty_room_grace: Duration::from_secs(60),
            },
        );

        join_as_owner(&handle, &mut host).await;
        handle.leave(host.reply(9), host.user_id).await.unwrap();
        host.expect_response(9).await;

        tokio::time::advance(Duration::from_secs(66)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.is_cancelled());
    }
}
