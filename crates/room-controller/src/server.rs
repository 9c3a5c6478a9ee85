//! Per-connection signaling loop.
//!
//! Accepts any ordered byte stream (TCP in the binary, in-memory duplex
//! pipes in tests), splits it, hands the write half to a
//! [`ConnectionActor`], and reads frames in a loop:
//!
//! 1. The first accepted request must be `authenticate`; room-scoped
//!    requests before the handshake fail with `unauthenticated`.
//! 2. Room-scoped requests are dispatched to the room actor with a
//!    [`Reply`] so responses and broadcasts share one ordered mailbox.
//! 3. On EOF, error, or idle timeout the room is notified so the
//!    disconnect grace period (or waiting-room withdrawal) starts.
//!
//! [`ConnectionActor`]: crate::actors::spawn_connection

use crate::actors::{
    spawn_connection, ActorMetrics, ConnectionActorHandle, MediaCommand, Reply,
    RoomCoordinatorHandle,
};
use crate::auth::{AuthVerifier, Claims};
use crate::config::Config;
use crate::errors::RoomError;

use common::{RoomId, UserId};
use futures_util::StreamExt;
use room_protocol::{ClientRequest, Frame, FrameCodec, ResponseBody, RoomRef};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actors::RoomActorHandle;

/// Signaling server: wires connections to the actor hierarchy.
pub struct SignalingServer {
    coordinator: RoomCoordinatorHandle,
    verifier: Arc<dyn AuthVerifier>,
    metrics: Arc<ActorMetrics>,
    idle_timeout: Duration,
}

impl SignalingServer {
    #[must_use]
    pub fn new(
        coordinator: RoomCoordinatorHandle,
        verifier: Arc<dyn AuthVerifier>,
        metrics: Arc<ActorMetrics>,
        config: &Config,
    ) -> Self {
        Self {
            coordinator,
            verifier,
            metrics,
            idle_timeout: config.connection_idle_timeout,
        }
    }

    /// Accept loop over a TCP listener. Runs until the coordinator is
    /// cancelled.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) {
        let cancel = self.coordinator.child_token();
        info!(target: "rc.server", "Signaling server accepting connections");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(target: "rc.server", "Accept loop stopping");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(target: "rc.server", peer = %peer, "Connection accepted");
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.serve_connection(stream).await;
                            });
                        }
                        Err(e) => {
                            warn!(target: "rc.server", error = %e, "Accept failed");
                        }
                    }
                }
            }
        }
    }

    /// Serve one signaling connection to completion.
    pub async fn serve_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection_id = Uuid::new_v4().to_string();
        let (read_half, write_half) = tokio::io::split(stream);

        let (connection, _writer_task) = spawn_connection(
            connection_id.clone(),
            write_half,
            self.coordinator.child_token(),
            Arc::clone(&self.metrics),
        );
        let mut reader = FramedRead::new(read_half, FrameCodec::new());

        let mut session = ConnectionSession {
            server: self,
            connection: connection.clone(),
            connection_id,
            claims: None,
            current_room: None,
        };

        loop {
            let next = tokio::time::timeout(self.idle_timeout, reader.next()).await;
            match next {
                Ok(Some(Ok(Frame::Request { id, request }))) => {
                    session.handle_request(id, request).await;
                }
                Ok(Some(Ok(frame))) => {
                    // Clients only send requests; anything else is a
                    // protocol violation worth logging, not fatal.
                    warn!(
                        target: "rc.server",
                        connection_id = %session.connection_id,
                        frame = ?std::mem::discriminant(&frame),
                        "Unexpected frame from client"
                    );
                }
                Ok(Some(Err(e))) => {
                    debug!(
                        target: "rc.server",
                        connection_id = %session.connection_id,
                        error = %e,
                        "Frame decode failed, closing connection"
                    );
                    break;
                }
                Ok(None) => {
                    debug!(
                        target: "rc.server",
                        connection_id = %session.connection_id,
                        "Connection closed by peer"
                    );
                    break;
                }
                Err(_) => {
                    warn!(
                        target: "rc.server",
                        connection_id = %session.connection_id,
                        "Idle timeout, closing connection"
                    );
                    break;
                }
            }

            if connection.is_cancelled() {
                break;
            }
        }

        session.on_disconnect().await;
        connection.cancel();
    }
}

/// Per-connection dispatch state.
struct ConnectionSession<'a> {
    server: &'a SignalingServer,
    connection: ConnectionActorHandle,
    connection_id: String,
    claims: Option<Claims>,
    /// The room this connection has joined (or is waiting on).
    current_room: Option<(RoomId, RoomActorHandle)>,
}

impl ConnectionSession<'_> {
    /// Dispatch one request. Replies either directly (authentication,
    /// room creation, resolution failures) or through the room actor.
    async fn handle_request(&mut self, id: u64, request: ClientRequest) {
        debug!(
            target: "rc.server",
            connection_id = %self.connection_id,
            request_id = id,
            op = request.op_name(),
            "Request received"
        );

        if self.claims.is_none() && !request.allowed_unauthenticated() {
            let _ = self
                .connection
                .respond_error(id, &RoomError::Unauthenticated)
                .await;
            return;
        }

        if let Err(error) = self.dispatch(id, request).await {
            debug!(
                target: "rc.server",
                connection_id = %self.connection_id,
                request_id = id,
                code = error.error_code().code(),
                "Request failed"
            );
            let _ = self.connection.respond_error(id, &error).await;
        }
    }

    async fn dispatch(&mut self, id: u64, request: ClientRequest) -> Result<(), RoomError> {
        match request {
            ClientRequest::Authenticate { token } => {
                let claims = self
                    .server
                    .verifier
                    .verify(&token)
                    .await
                    .map_err(|e| RoomError::InvalidToken(e.to_string()))?;

                debug!(
                    target: "rc.server",
                    connection_id = %self.connection_id,
                    user_id = %claims.user_id,
                    "Connection authenticated"
                );

                let user_id = claims.user_id;
                self.claims = Some(claims);
                self.connection
                    .respond(id, ResponseBody::Authenticated { user_id })
                    .await
            }

            ClientRequest::CreateRoom {
                title,
                max_participants,
                features,
            } => {
                let room = self
                    .server
                    .coordinator
                    .create_room(self.user_id()?, title, max_participants, features)
                    .await?;
                self.connection
                    .respond(id, ResponseBody::RoomCreated { room })
                    .await
            }

            ClientRequest::JoinRoom { room, display_name } => {
                let handle = self.server.coordinator.resolve_room(room).await?;
                let user_id = self.user_id()?;
                let role_claim = self.claims.as_ref().and_then(|c| c.role_claim);

                handle
                    .join(self.reply(id), user_id, display_name, role_claim)
                    .await?;
                self.current_room = Some((handle.room_id(), handle));
                Ok(())
            }

            ClientRequest::LeaveRoom { room_id } => {
                let handle = self.room(room_id).await?;
                let result = handle.leave(self.reply(id), self.user_id()?).await;
                self.current_room = None;
                result
            }

            ClientRequest::CloseRoom { room_id } => {
                let handle = self.room(room_id).await?;
                handle.close_room(self.reply(id), self.user_id()?).await
            }

            ClientRequest::Kick { room_id, user_id } => {
                let handle = self.room(room_id).await?;
                handle.kick(self.reply(id), self.user_id()?, user_id).await
            }

            ClientRequest::MuteAll { room_id } => {
                let handle = self.room(room_id).await?;
                handle.mute_all(self.reply(id), self.user_id()?).await
            }

            ClientRequest::ChangeRole {
                room_id,
                user_id,
                role,
            } => {
                let handle = self.room(room_id).await?;
                handle
                    .change_role(self.reply(id), self.user_id()?, user_id, role)
                    .await
            }

            ClientRequest::UpdateStatus {
                room_id,
                hand_raised,
                reaction,
            } => {
                let handle = self.room(room_id).await?;
                handle
                    .update_status(self.reply(id), self.user_id()?, hand_raised, reaction)
                    .await
            }

            ClientRequest::Admit { room_id, user_id } => {
                let handle = self.room(room_id).await?;
                handle.admit(self.reply(id), self.user_id()?, user_id).await
            }

            ClientRequest::Reject {
                room_id,
                user_id,
                reason,
            } => {
                let handle = self.room(room_id).await?;
                handle
                    .reject(self.reply(id), self.user_id()?, user_id, reason)
                    .await
            }

            ClientRequest::AdmitAll { room_id } => {
                let handle = self.room(room_id).await?;
                handle.admit_all(self.reply(id), self.user_id()?).await
            }

            ClientRequest::RouterCapabilities { room_id } => {
                self.media(id, room_id, MediaCommand::RouterCapabilities)
                    .await
            }

            ClientRequest::CreateTransport { room_id, direction } => {
                self.media(id, room_id, MediaCommand::CreateTransport { direction })
                    .await
            }

            ClientRequest::ConnectTransport {
                room_id,
                transport_id,
                dtls_parameters,
            } => {
                self.media(
                    id,
                    room_id,
                    MediaCommand::ConnectTransport {
                        transport_id,
                        dtls_parameters,
                    },
                )
                .await
            }

            ClientRequest::Produce {
                room_id,
                transport_id,
                kind,
                rtp_parameters,
            } => {
                self.media(
                    id,
                    room_id,
                    MediaCommand::Produce {
                        transport_id,
                        kind,
                        rtp_parameters,
                    },
                )
                .await
            }

            ClientRequest::CloseProducer { room_id, kind } => {
                self.media(id, room_id, MediaCommand::CloseProducer { kind })
                    .await
            }

            ClientRequest::PauseProducer { room_id, kind } => {
                self.media(id, room_id, MediaCommand::PauseProducer { kind })
                    .await
            }

            ClientRequest::ResumeProducer { room_id, kind } => {
                self.media(id, room_id, MediaCommand::ResumeProducer { kind })
                    .await
            }

            ClientRequest::Consume {
                room_id,
                producer_id,
                rtp_capabilities,
            } => {
                self.media(
                    id,
                    room_id,
                    MediaCommand::Consume {
                        producer_id,
                        rtp_capabilities,
                    },
                )
                .await
            }

            ClientRequest::ResumeConsumer {
                room_id,
                consumer_id,
            } => {
                self.media(id, room_id, MediaCommand::ResumeConsumer { consumer_id })
                    .await
            }
        }
    }

    async fn media(
        &mut self,
        id: u64,
        room_id: RoomId,
        command: MediaCommand,
    ) -> Result<(), RoomError> {
        let handle = self.room(room_id).await?;
        handle.media(self.reply(id), self.user_id()?, command).await
    }

    fn reply(&self, request_id: u64) -> Reply {
        Reply::new(self.connection.clone(), request_id)
    }

    fn user_id(&self) -> Result<UserId, RoomError> {
        self.claims
            .as_ref()
            .map(|c| c.user_id)
            .ok_or(RoomError::Unauthenticated)
    }

    /// Resolve a room id, preferring the joined room's handle.
    async fn room(&self, room_id: RoomId) -> Result<RoomActorHandle, RoomError> {
        if let Some((current_id, handle)) = &self.current_room {
            if *current_id == room_id && !handle.is_cancelled() {
                return Ok(handle.clone());
            }
        }
        self.server.coordinator.resolve_room(RoomRef::Id(room_id)).await
    }

    /// Notify the joined room that this connection dropped.
    async fn on_disconnect(&mut self) {
        let Some((room_id, handle)) = self.current_room.take() else {
            return;
        };
        let Some(claims) = &self.claims else {
            return;
        };

        debug!(
            target: "rc.server",
            connection_id = %self.connection_id,
            room_id = %room_id,
            user_id = %claims.user_id,
            "Notifying room of dropped connection"
        );
        let _ = handle.connection_disconnected(claims.user_id).await;
    }
}
