//! `ConnectionActor` - per-signaling-connection actor.
//!
//! Each `ConnectionActor`:
//! - Owns the write half of exactly one signaling connection
//! - Delivers responses and events to the client in enqueue order, so
//!   a client observes server-emission order for its connection
//! - Is cancelled via a child token of its room (or the coordinator
//!   while the connection has not joined a room yet)
//!
//! The read half stays with the connection task in [`crate::server`];
//! only writes are funneled through this actor.

use crate::errors::RoomError;

use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use futures_util::SinkExt;
use room_protocol::{Frame, FrameCodec, ResponseBody, ServerEvent};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Messages handled by a `ConnectionActor`.
#[derive(Debug)]
enum ConnectionMessage {
    /// Write a frame to the client.
    Deliver { frame: Frame },
    /// Flush and stop writing.
    Close { reason: String },
}

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: String,
}

impl ConnectionActorHandle {
    /// Get the connection ID.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Deliver a raw frame to the client.
    pub async fn deliver(&self, frame: Frame) -> Result<(), RoomError> {
        self.sender
            .send(ConnectionMessage::Deliver { frame })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))
    }

    /// Push an unsolicited event to the client.
    pub async fn send_event(&self, event: ServerEvent) -> Result<(), RoomError> {
        self.deliver(Frame::Event { event }).await
    }

    /// Send the success reply for request `id`.
    pub async fn respond(&self, id: u64, response: ResponseBody) -> Result<(), RoomError> {
        self.deliver(Frame::Response { id, response }).await
    }

    /// Send the error reply for request `id`.
    pub async fn respond_error(&self, id: u64, error: &RoomError) -> Result<(), RoomError> {
        self.deliver(Frame::Error {
            id,
            code: error.error_code(),
            message: error.client_message(),
        })
        .await
    }

    /// Flush and close the connection.
    pub async fn close(&self, reason: String) -> Result<(), RoomError> {
        self.sender
            .send(ConnectionMessage::Close { reason })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
struct ConnectionActor<W: AsyncWrite + Unpin + Send + 'static> {
    connection_id: String,
    writer: FramedWrite<W, FrameCodec>,
    receiver: mpsc::Receiver<ConnectionMessage>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
    is_closing: bool,
}

impl<W: AsyncWrite + Unpin + Send + 'static> ConnectionActor<W> {
    /// Spawn a new connection actor owning `writer`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: String,
        writer: W,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);

        let actor = Self {
            connection_id: connection_id.clone(),
            writer: FramedWrite::new(writer, FrameCodec::new()),
            receiver,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Connection, &connection_id),
            is_closing: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "rc.actor.connection",
        fields(connection_id = %self.connection_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "rc.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );
        self.metrics.connection_created();

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "rc.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    self.graceful_close("cancelled").await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "rc.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.metrics.connection_closed();
        info!(
            target: "rc.actor.connection",
            connection_id = %self.connection_id,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Deliver { frame } => {
                self.handle_deliver(frame).await;
                false
            }

            ConnectionMessage::Close { reason } => {
                self.graceful_close(&reason).await;
                true
            }
        }
    }

    /// Write one frame to the client.
    async fn handle_deliver(&mut self, frame: Frame) {
        if self.is_closing {
            warn!(
                target: "rc.actor.connection",
                connection_id = %self.connection_id,
                "Attempted to deliver frame while closing"
            );
            return;
        }

        if let Err(e) = self.writer.send(frame).await {
            // The read side notices the broken stream independently;
            // here we just stop writing.
            debug!(
                target: "rc.actor.connection",
                connection_id = %self.connection_id,
                error = %e,
                "Frame write failed, closing writer"
            );
            self.is_closing = true;
        }
    }

    /// Flush pending frames and stop.
    async fn graceful_close(&mut self, reason: &str) {
        if self.is_closing {
            return;
        }
        self.is_closing = true;

        debug!(
            target: "rc.actor.connection",
            connection_id = %self.connection_id,
            reason = %reason,
            "Closing connection writer"
        );

        if let Err(e) = self.writer.flush().await {
            debug!(
                target: "rc.actor.connection",
                connection_id = %self.connection_id,
                error = %e,
                "Flush on close failed"
            );
        }
    }
}

/// Spawn a connection actor. Free function so callers do not need to
/// name the generic actor type.
pub fn spawn_connection<W: AsyncWrite + Unpin + Send + 'static>(
    connection_id: String,
    writer: W,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
) -> (ConnectionActorHandle, JoinHandle<()>) {
    ConnectionActor::spawn(connection_id, writer, cancel_token, metrics)
}
