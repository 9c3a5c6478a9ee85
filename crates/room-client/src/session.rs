//! Room session state machine.
//!
//! One `RoomSession` is the full lifecycle of one client's
//! participation in one room:
//!
//! ```text
//! Idle → Connecting → Authenticating → (WaitingForAdmission) →
//! Joining → Active → Leaving → Idle
//! ```
//!
//! with `Kicked`/`Failed` terminal-per-attempt states returning to
//! `Idle` on the next join attempt.
//!
//! The session runs as a single task: UI intents arrive through the
//! handle's mailbox, server events through the channel's event stream,
//! and the task suspends only at explicit asynchronous boundaries. A
//! dropped event stream is the connection-loss signal; the state
//! machine (not the orchestrator) decides whether to retry, and an
//! automatic rejoin happens at most once per session.

use crate::channel::SignalingChannel;
use crate::errors::SessionError;
use crate::media::{MediaOrchestrator, MediaTrack, RemoteTrack};
use crate::registry::{Registry, RegistryView};

use common::{MediaKind, Role, RoomId, UserId};
use futures_util::future::BoxFuture;
use room_protocol::{
    ClientRequest, ResponseBody, RoomFeatures, RoomInfo, RoomRef, RoomSnapshot, ServerEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Buffer for UI intents awaiting the session task.
const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Object-safe byte stream the session connects over: TCP in
/// production, in-memory duplex pipes in tests.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> StreamIo for T {}

/// A boxed, connected stream.
pub type BoxedStream = Box<dyn StreamIo>;

/// Factory producing a fresh connection per attempt. Reconnection
/// always creates a new channel instance from a new stream.
pub type Connector =
    Arc<dyn Fn() -> BoxFuture<'static, std::io::Result<BoxedStream>> + Send + Sync>;

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Authenticating,
    WaitingForAdmission,
    Joining,
    Active,
    Leaving,
    /// Removed by a moderator. Terminal for this attempt.
    Kicked { reason: String },
    /// The attempt failed (rejection, timeout, connection loss).
    Failed { reason: String },
}

impl SessionState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Kicked { .. } | SessionState::Failed { .. }
        )
    }
}

/// Session configuration.
#[derive(Clone)]
pub struct SessionConfig {
    /// Session token from the identity collaborator.
    pub token: String,
    /// Display name for rooms joined by this session.
    pub display_name: String,
    /// Local tracks published on join (mic, camera).
    pub local_tracks: Vec<MediaTrack>,
    /// Per-request deadline on the signaling channel.
    pub request_timeout: Duration,
    /// How long to sit in the waiting room before giving up.
    pub admission_timeout: Duration,
    /// Persisted room id from a previous run; the session retries the
    /// join exactly once on startup and clears it on failure.
    pub auto_rejoin: Option<RoomId>,
}

impl SessionConfig {
    #[must_use]
    pub fn new(token: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            display_name: display_name.into(),
            local_tracks: Vec::new(),
            request_timeout: Duration::from_secs(10),
            admission_timeout: Duration::from_secs(120),
            auto_rejoin: None,
        }
    }
}

/// UI intents.
enum SessionCommand {
    CreateRoom {
        title: String,
        max_participants: u32,
        features: RoomFeatures,
        respond_to: oneshot::Sender<Result<RoomInfo, SessionError>>,
    },
    Join {
        room: RoomRef,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Leave {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    PublishTrack {
        track: MediaTrack,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    StopTrack {
        kind: MediaKind,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    SetTrackPaused {
        kind: MediaKind,
        paused: bool,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    ReplaceTrack {
        kind: MediaKind,
        track: MediaTrack,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    UpdateStatus {
        hand_raised: bool,
        reaction: Option<String>,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Admit {
        user_id: UserId,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Reject {
        user_id: UserId,
        reason: String,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    AdmitAll {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Kick {
        user_id: UserId,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    MuteAll {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    ChangeRole {
        user_id: UserId,
        role: Role,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    CloseRoom {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Shutdown,
}

/// Handle to a `RoomSession`: imperative intents plus the state and
/// registry subscriptions the UI renders from.
#[derive(Clone)]
pub struct RoomSessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionState>,
    registry_rx: watch::Receiver<RegistryView>,
}

impl RoomSessionHandle {
    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// Current registry view.
    #[must_use]
    pub fn registry(&self) -> RegistryView {
        self.registry_rx.borrow().clone()
    }

    /// Subscribe to registry changes.
    #[must_use]
    pub fn registry_watch(&self) -> watch::Receiver<RegistryView> {
        self.registry_rx.clone()
    }

    /// Wait until the session state satisfies `pred`.
    pub async fn wait_for_state(
        &mut self,
        mut pred: impl FnMut(&SessionState) -> bool,
    ) -> Result<SessionState, SessionError> {
        loop {
            {
                let current = self.state_rx.borrow();
                if pred(&current) {
                    return Ok(current.clone());
                }
            }
            self.state_rx
                .changed()
                .await
                .map_err(|_| SessionError::InvalidState("session task ended".to_string()))?;
        }
    }

    /// Create a room on the controller (does not join it).
    pub async fn create_room(
        &self,
        title: impl Into<String>,
        max_participants: u32,
        features: RoomFeatures,
    ) -> Result<RoomInfo, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::CreateRoom {
            title: title.into(),
            max_participants,
            features,
            respond_to: tx,
        })
        .await?;
        recv(rx).await
    }

    /// Join (or request admission to) a room.
    pub async fn join(&self, room: RoomRef) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Join {
            room,
            respond_to: tx,
        })
        .await?;
        recv(rx).await
    }

    /// Leave the current room.
    pub async fn leave(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Leave { respond_to: tx }).await?;
        recv(rx).await
    }

    /// Publish a local track (mic, camera, screen).
    pub async fn publish_track(&self, track: MediaTrack) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::PublishTrack {
            track,
            respond_to: tx,
        })
        .await?;
        recv(rx).await
    }

    /// Stop and close the producer of `kind` (e.g. end screen share).
    pub async fn stop_track(&self, kind: MediaKind) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::StopTrack {
            kind,
            respond_to: tx,
        })
        .await?;
        recv(rx).await
    }

    /// Toggle mic/camera by pausing the producer of `kind`.
    pub async fn set_track_paused(
        &self,
        kind: MediaKind,
        paused: bool,
    ) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::SetTrackPaused {
            kind,
            paused,
            respond_to: tx,
        })
        .await?;
        recv(rx).await
    }

    /// Swap the hardware track behind a producer (camera switch).
    pub async fn replace_track(
        &self,
        kind: MediaKind,
        track: MediaTrack,
    ) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::ReplaceTrack {
            kind,
            track,
            respond_to: tx,
        })
        .await?;
        recv(rx).await
    }

    /// Update hand-raise / reaction flags.
    pub async fn update_status(
        &self,
        hand_raised: bool,
        reaction: Option<String>,
    ) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::UpdateStatus {
            hand_raised,
            reaction,
            respond_to: tx,
        })
        .await?;
        recv(rx).await
    }

    /// Admit a waiting user (moderators).
    pub async fn admit(&self, user_id: UserId) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Admit {
            user_id,
            respond_to: tx,
        })
        .await?;
        recv(rx).await
    }

    /// Reject a waiting user with a reason (moderators).
    pub async fn reject(
        &self,
        user_id: UserId,
        reason: impl Into<String>,
    ) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Reject {
            user_id,
            reason: reason.into(),
            respond_to: tx,
        })
        .await?;
        recv(rx).await
    }

    /// Admit everyone currently waiting (moderators).
    pub async fn admit_all(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::AdmitAll { respond_to: tx })
            .await?;
        recv(rx).await
    }

    /// Remove a participant (moderators).
    pub async fn kick(&self, user_id: UserId) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Kick {
            user_id,
            respond_to: tx,
        })
        .await?;
        recv(rx).await
    }

    /// Mute every non-moderator participant (moderators).
    pub async fn mute_all(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::MuteAll { respond_to: tx })
            .await?;
        recv(rx).await
    }

    /// Change a participant's role (host).
    pub async fn change_role(&self, user_id: UserId, role: Role) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::ChangeRole {
            user_id,
            role,
            respond_to: tx,
        })
        .await?;
        recv(rx).await
    }

    /// Close the room for everyone (host).
    pub async fn close_room(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::CloseRoom { respond_to: tx })
            .await?;
        recv(rx).await
    }

    /// Stop the session task.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(SessionCommand::Shutdown).await;
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| SessionError::InvalidState("session task ended".to_string()))
    }
}

async fn recv<T>(rx: oneshot::Receiver<Result<T, SessionError>>) -> Result<T, SessionError> {
    rx.await
        .map_err(|_| SessionError::InvalidState("session task ended".to_string()))?
}

/// The `RoomSession` implementation.
pub struct RoomSession {
    config: SessionConfig,
    connector: Connector,
    commands: mpsc::Receiver<SessionCommand>,
    state_tx: watch::Sender<SessionState>,
    registry: Registry,
    channel: Option<Arc<SignalingChannel>>,
    events: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    media: Option<MediaOrchestrator>,
    user_id: Option<UserId>,
    room_id: Option<RoomId>,
    /// Room to auto-rejoin after a connection loss or restart. Cleared
    /// by voluntary leave and by a failed rejoin.
    persisted_room: Option<RoomId>,
    rejoin_attempted: bool,
    admission_deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RoomSession {
    /// Spawn a session task.
    ///
    /// Returns the handle and the task join handle.
    #[must_use]
    pub fn spawn(config: SessionConfig, connector: Connector) -> (RoomSessionHandle, JoinHandle<()>) {
        let (sender, commands) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (registry, registry_rx) = Registry::new();

        let session = Self {
            persisted_room: config.auto_rejoin,
            config,
            connector,
            commands,
            state_tx,
            registry,
            channel: None,
            events: None,
            media: None,
            user_id: None,
            room_id: None,
            rejoin_attempted: false,
            admission_deadline: None,
            cancel: CancellationToken::new(),
        };

        let task_handle = tokio::spawn(session.run());

        (
            RoomSessionHandle {
                sender,
                state_rx,
                registry_rx,
            },
            task_handle,
        )
    }

    /// Run the session loop.
    #[instrument(skip_all, name = "rc.client.session")]
    async fn run(mut self) {
        // Restart path: retry the persisted room exactly once.
        if let Some(room_id) = self.persisted_room {
            self.rejoin_attempted = true;
            info!(
                target: "rc.client.session",
                room_id = %room_id,
                "Auto-rejoining persisted room"
            );
            if let Err(e) = self.join_flow(RoomRef::Id(room_id)).await {
                self.fail(format!("auto-rejoin failed: {e}"));
            }
        }

        loop {
            let admission_deadline = self.admission_deadline;
            let admission_wait = async move {
                match admission_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.local_teardown();
                    break;
                }

                command = self.commands.recv() => {
                    match command {
                        Some(SessionCommand::Shutdown) | None => {
                            self.local_teardown();
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                    }
                }

                event = next_event(&mut self.events) => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => self.on_connection_lost().await,
                    }
                }

                () = admission_wait => {
                    warn!(
                        target: "rc.client.session",
                        "Admission request timed out"
                    );
                    self.fail("admission timed out".to_string());
                }
            }
        }

        debug!(target: "rc.client.session", "Session task stopped");
    }

    /// Handle one UI intent.
    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::CreateRoom {
                title,
                max_participants,
                features,
                respond_to,
            } => {
                let result = self.do_create_room(title, max_participants, features).await;
                let _ = respond_to.send(result);
            }

            SessionCommand::Join { room, respond_to } => {
                let state = self.state();
                let result = if state.is_terminal() {
                    self.join_flow(room).await.map_err(|e| {
                        self.fail(format!("join failed: {e}"));
                        e
                    })
                } else {
                    Err(SessionError::InvalidState(format!(
                        "cannot join from {state:?}"
                    )))
                };
                let _ = respond_to.send(result);
            }

            SessionCommand::Leave { respond_to } => {
                let result = self.do_leave().await;
                let _ = respond_to.send(result);
            }

            SessionCommand::PublishTrack { track, respond_to } => {
                let result = match self.media_mut() {
                    Ok(media) => media.produce_track(track).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            SessionCommand::StopTrack { kind, respond_to } => {
                let result = match self.media_mut() {
                    Ok(media) => media.close_producer(kind).await,
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            SessionCommand::SetTrackPaused {
                kind,
                paused,
                respond_to,
            } => {
                let result = match self.media_mut() {
                    Ok(media) => media.set_producer_paused(kind, paused).await,
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            SessionCommand::ReplaceTrack {
                kind,
                track,
                respond_to,
            } => {
                let result = match self.media_mut() {
                    Ok(media) => media.replace_producer_track(kind, track),
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            SessionCommand::UpdateStatus {
                hand_raised,
                reaction,
                respond_to,
            } => {
                let result = match self.room_request_params() {
                    Ok(room_id) => {
                        self.simple_request(ClientRequest::UpdateStatus {
                            room_id,
                            hand_raised,
                            reaction,
                        })
                        .await
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            SessionCommand::Admit {
                user_id,
                respond_to,
            } => {
                let result = match self.room_request_params() {
                    Ok(room_id) => {
                        self.simple_request(ClientRequest::Admit { room_id, user_id })
                            .await
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            SessionCommand::Reject {
                user_id,
                reason,
                respond_to,
            } => {
                let result = match self.room_request_params() {
                    Ok(room_id) => {
                        self.simple_request(ClientRequest::Reject {
                            room_id,
                            user_id,
                            reason,
                        })
                        .await
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            SessionCommand::AdmitAll { respond_to } => {
                let result = match self.room_request_params() {
                    Ok(room_id) => {
                        self.simple_request(ClientRequest::AdmitAll { room_id }).await
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            SessionCommand::Kick {
                user_id,
                respond_to,
            } => {
                let result = match self.room_request_params() {
                    Ok(room_id) => {
                        self.simple_request(ClientRequest::Kick { room_id, user_id })
                            .await
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            SessionCommand::MuteAll { respond_to } => {
                let result = match self.room_request_params() {
                    Ok(room_id) => {
                        self.simple_request(ClientRequest::MuteAll { room_id }).await
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            SessionCommand::ChangeRole {
                user_id,
                role,
                respond_to,
            } => {
                let result = match self.room_request_params() {
                    Ok(room_id) => {
                        self.simple_request(ClientRequest::ChangeRole {
                            room_id,
                            user_id,
                            role,
                        })
                        .await
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            SessionCommand::CloseRoom { respond_to } => {
                let result = match self.room_request_params() {
                    Ok(room_id) => {
                        let result = self
                            .simple_request(ClientRequest::CloseRoom { room_id })
                            .await;
                        // The room-closed broadcast also arrives as an
                        // event; tearing down now keeps the host's own
                        // state machine ahead of it.
                        if result.is_ok() {
                            self.set_state(SessionState::Leaving);
                            self.persisted_room = None;
                            self.local_teardown();
                            self.set_state(SessionState::Idle);
                        }
                        result
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            // Handled in the select loop.
            SessionCommand::Shutdown => {}
        }
    }

    /// Handle one server event.
    async fn handle_event(&mut self, event: ServerEvent) {
        // Events for a torn-down or different room session are stale;
        // drop them rather than applying their effects.
        let Some(room_id) = self.room_id else {
            debug!(target: "rc.client.session", "Event with no active room, dropped");
            return;
        };
        if event.room_id() != room_id {
            debug!(
                target: "rc.client.session",
                event_room = %event.room_id(),
                "Event for another room, dropped"
            );
            return;
        }

        match event {
            ServerEvent::Admitted { snapshot, message, .. } => {
                if self.state() != SessionState::WaitingForAdmission {
                    return;
                }
                info!(target: "rc.client.session", message = %message, "Admitted to room");
                self.admission_deadline = None;
                if let Err(e) = self.begin_joining(snapshot).await {
                    self.fail(format!("join after admission failed: {e}"));
                }
            }

            ServerEvent::Rejected { message, .. } => {
                info!(target: "rc.client.session", message = %message, "Admission rejected");
                self.persisted_room = None;
                self.local_teardown();
                self.set_state(SessionState::Failed { reason: message });
            }

            ServerEvent::Kicked { reason, .. } => {
                info!(target: "rc.client.session", reason = %reason, "Kicked from room");
                self.persisted_room = None;
                self.set_state(SessionState::Leaving);
                self.local_teardown();
                self.set_state(SessionState::Kicked { reason });
            }

            ServerEvent::RoomClosed { reason, .. } => {
                info!(target: "rc.client.session", reason = %reason, "Room closed");
                self.persisted_room = None;
                self.set_state(SessionState::Leaving);
                self.local_teardown();
                self.set_state(SessionState::Idle);
            }

            ServerEvent::ProducerNew {
                owner,
                producer_id,
                kind,
                ..
            } => {
                self.registry.apply(&ServerEvent::ProducerNew {
                    room_id,
                    owner,
                    producer_id,
                    kind,
                });
                // Our own producer echo only updates the mirror; there
                // is nothing to consume.
                if Some(owner) == self.user_id {
                    return;
                }
                let Some(media) = &mut self.media else { return };
                match media.consume_producer(producer_id, owner, kind).await {
                    Ok(attached) => self.attach_tracks(attached),
                    Err(e) if e == SessionError::StaleEvent => {}
                    Err(e) => {
                        warn!(
                            target: "rc.client.session",
                            error = %e,
                            "Consume after new producer failed"
                        );
                        if e.is_session_fatal() {
                            self.on_connection_lost().await;
                        }
                    }
                }
            }

            other => {
                let dropped = self.registry.apply(&other);
                if let Some(media) = &mut self.media {
                    for consumer_id in dropped {
                        media.close_consumer(consumer_id);
                    }
                }
            }
        }
    }

    /// Create a room over the (possibly fresh) channel.
    async fn do_create_room(
        &mut self,
        title: String,
        max_participants: u32,
        features: RoomFeatures,
    ) -> Result<RoomInfo, SessionError> {
        let return_to_idle = self.channel.is_none() && self.state() == SessionState::Idle;
        let channel = self.ensure_channel().await?;
        if return_to_idle {
            self.set_state(SessionState::Idle);
        }

        match channel
            .request(ClientRequest::CreateRoom {
                title,
                max_participants,
                features,
            })
            .await?
        {
            ResponseBody::RoomCreated { room } => Ok(room),
            other => Err(SessionError::Protocol(format!(
                "unexpected create_room reply: {other:?}"
            ))),
        }
    }

    /// The join sequence: connect, authenticate, request to join, then
    /// either proceed to `Joining` (auto-admit) or park in
    /// `WaitingForAdmission`.
    async fn join_flow(&mut self, room: RoomRef) -> Result<(), SessionError> {
        let channel = self.ensure_channel().await?;

        let response = channel
            .request(ClientRequest::JoinRoom {
                room,
                display_name: self.config.display_name.clone(),
            })
            .await?;

        match response {
            ResponseBody::Joined { snapshot } => self.begin_joining(snapshot).await,
            ResponseBody::Waiting { room_id } => {
                // Admission and rejection arrive keyed by this resolved
                // room id, not by whatever code we joined with.
                self.room_id = Some(room_id);
                self.admission_deadline =
                    Some(Instant::now() + self.config.admission_timeout);
                self.set_state(SessionState::WaitingForAdmission);
                Ok(())
            }
            other => Err(SessionError::Protocol(format!(
                "unexpected join reply: {other:?}"
            ))),
        }
    }

    /// The admitted path: seed the registry, negotiate media, produce
    /// local tracks, consume existing remote producers.
    async fn begin_joining(&mut self, snapshot: RoomSnapshot) -> Result<(), SessionError> {
        self.set_state(SessionState::Joining);
        let room_id = snapshot.room.id;
        self.room_id = Some(room_id);
        self.persisted_room = Some(room_id);

        let channel = self
            .channel
            .clone()
            .ok_or(SessionError::ConnectionLost)?;
        let _ = self.registry.seed(&snapshot);
        let mut media = MediaOrchestrator::new(Arc::clone(&channel), room_id);

        // Device load precedes both transports.
        let capabilities = match channel
            .request(ClientRequest::RouterCapabilities { room_id })
            .await?
        {
            ResponseBody::RouterCapabilities { capabilities } => capabilities,
            other => {
                return Err(SessionError::Protocol(format!(
                    "unexpected capabilities reply: {other:?}"
                )))
            }
        };
        media.load_device(capabilities);
        media.create_send_transport().await?;
        media.create_recv_transport().await?;

        // Local tracks: a failure here aborts only that track.
        for track in self.config.local_tracks.clone() {
            if let Err(e) = media.produce_track(track).await {
                if e.is_session_fatal() {
                    return Err(e);
                }
                warn!(
                    target: "rc.client.session",
                    error = %e,
                    "Producing a local track failed, continuing without it"
                );
            }
        }

        // Existing remote producers go through the same pending queue
        // as live notifications.
        for participant in &snapshot.participants {
            for producer in &participant.producers {
                let attached = media
                    .consume_producer(producer.id, participant.user_id, producer.kind)
                    .await?;
                for (owner, track) in attached {
                    if !self.registry.attach_track(owner, track.clone()) {
                        media.close_consumer(track.consumer_id);
                    }
                }
            }
        }

        self.media = Some(media);
        self.admission_deadline = None;
        self.set_state(SessionState::Active);
        info!(target: "rc.client.session", room_id = %room_id, "Session active");
        Ok(())
    }

    /// Voluntary leave: notify the server, then tear down locally.
    async fn do_leave(&mut self) -> Result<(), SessionError> {
        let state = self.state();
        if !matches!(
            state,
            SessionState::Active | SessionState::WaitingForAdmission | SessionState::Joining
        ) {
            return Err(SessionError::InvalidState(format!(
                "cannot leave from {state:?}"
            )));
        }

        self.set_state(SessionState::Leaving);
        if let (Some(channel), Some(room_id)) = (&self.channel, self.room_id) {
            let _ = channel
                .request(ClientRequest::LeaveRoom { room_id })
                .await;
        }
        self.persisted_room = None;
        self.local_teardown();
        self.set_state(SessionState::Idle);
        Ok(())
    }

    /// The event stream ended: the channel is gone. Retry the join at
    /// most once per session; otherwise fail the attempt.
    async fn on_connection_lost(&mut self) {
        self.events = None;

        let state = self.state();
        let mid_session = matches!(
            state,
            SessionState::Active
                | SessionState::Joining
                | SessionState::WaitingForAdmission
                | SessionState::Authenticating
        );
        if !mid_session {
            self.local_teardown();
            return;
        }

        warn!(target: "rc.client.session", state = ?state, "Connection lost");

        let retry = (!self.rejoin_attempted).then_some(self.persisted_room).flatten();
        self.local_teardown();

        match retry {
            Some(room_id) => {
                self.rejoin_attempted = true;
                info!(
                    target: "rc.client.session",
                    room_id = %room_id,
                    "Retrying join once after connection loss"
                );
                if let Err(e) = self.join_flow(RoomRef::Id(room_id)).await {
                    self.fail(format!("rejoin failed: {e}"));
                }
            }
            None => self.fail("connection lost".to_string()),
        }
    }

    /// Ensure a live, authenticated channel, creating a fresh instance
    /// if needed. Transport connection and authentication must BOTH
    /// hold before any room command goes out; the sequential awaits
    /// here are that conjunction.
    async fn ensure_channel(&mut self) -> Result<Arc<SignalingChannel>, SessionError> {
        if let Some(channel) = &self.channel {
            if !channel.is_closed() {
                return Ok(Arc::clone(channel));
            }
        }

        self.set_state(SessionState::Connecting);
        let stream = (self.connector)()
            .await
            .map_err(|e| SessionError::NegotiationFailed(format!("connect failed: {e}")))?;
        let (channel, events) = SignalingChannel::connect(stream, self.config.request_timeout);

        self.set_state(SessionState::Authenticating);
        let user_id = channel.authenticate(self.config.token.clone()).await?;
        self.user_id = Some(user_id);

        self.channel = Some(Arc::clone(&channel));
        self.events = Some(events);
        Ok(channel)
    }

    /// Release every local resource: media, registry mirror, channel.
    /// Safe to call repeatedly on any exit path.
    fn local_teardown(&mut self) {
        if let Some(media) = &mut self.media {
            media.cleanup();
        }
        self.media = None;
        let _ = self.registry.clear();
        if let Some(channel) = &self.channel {
            channel.close();
        }
        self.channel = None;
        self.events = None;
        self.room_id = None;
        self.admission_deadline = None;
    }

    fn fail(&mut self, reason: String) {
        // No retry loop: a failed attempt clears the persisted room.
        self.persisted_room = None;
        self.local_teardown();
        self.set_state(SessionState::Failed { reason });
    }

    fn attach_tracks(&mut self, attached: Vec<(UserId, RemoteTrack)>) {
        for (owner, track) in attached {
            let consumer_id = track.consumer_id;
            if !self.registry.attach_track(owner, track) {
                if let Some(media) = &mut self.media {
                    media.close_consumer(consumer_id);
                }
            }
        }
    }

    fn media_mut(&mut self) -> Result<&mut MediaOrchestrator, SessionError> {
        if self.state() != SessionState::Active {
            return Err(SessionError::InvalidState(
                "media intents require an active session".to_string(),
            ));
        }
        self.media
            .as_mut()
            .ok_or_else(|| SessionError::InvalidState("no media session".to_string()))
    }

    fn room_request_params(&self) -> Result<RoomId, SessionError> {
        if self.state() != SessionState::Active {
            return Err(SessionError::InvalidState(
                "room intents require an active session".to_string(),
            ));
        }
        self.room_id
            .ok_or_else(|| SessionError::InvalidState("no room".to_string()))
    }

    async fn simple_request(&self, request: ClientRequest) -> Result<(), SessionError> {
        let channel = self
            .channel
            .as_ref()
            .ok_or(SessionError::ConnectionLost)?;
        match channel.request(request).await? {
            ResponseBody::Ack => Ok(()),
            other => Err(SessionError::Protocol(format!(
                "unexpected reply: {other:?}"
            ))),
        }
    }

    fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, state: SessionState) {
        debug!(target: "rc.client.session", state = ?state, "Session state change");
        let _ = self.state_tx.send(state);
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<ServerEvent>>,
) -> Option<ServerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Convenience connector for plain TCP deployments.
#[must_use]
pub fn tcp_connector(address: String) -> Connector {
    Arc::new(move || {
        let address = address.clone();
        Box::pin(async move {
            let stream = tokio::net::TcpStream::connect(address).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    })
}
