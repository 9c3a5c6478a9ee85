//! Signaling channel: request/response correlation over a framed byte
//! stream, plus the ordered server event stream.
//!
//! One channel instance corresponds to one connection. Reconnection
//! creates a new instance; every request in flight on the old one fails
//! with [`SessionError::ConnectionLost`]. Room-scoped requests issued
//! before the authentication handshake completes fail with
//! [`SessionError::Unauthenticated`] without touching the wire (the
//! server enforces the same rule).

use crate::errors::SessionError;

use common::UserId;
use futures_util::{SinkExt, StreamExt};
use room_protocol::{ClientRequest, Frame, FrameCodec, ResponseBody};
use room_protocol::ServerEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Buffer for frames awaiting the writer task.
const WRITER_CHANNEL_BUFFER: usize = 64;

type PendingMap = HashMap<u64, oneshot::Sender<Result<ResponseBody, SessionError>>>;

/// One connection's signaling channel.
///
/// Cheap to share (`Arc`); the media orchestrator and the session state
/// machine issue requests concurrently through clones.
pub struct SignalingChannel {
    next_id: AtomicU64,
    writer_tx: mpsc::Sender<Frame>,
    pending: Arc<Mutex<PendingMap>>,
    authenticated: AtomicBool,
    closed: Arc<AtomicBool>,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl SignalingChannel {
    /// Take ownership of a connected stream and start the channel's
    /// reader/writer tasks.
    ///
    /// Returns the channel and the ordered server event stream. The
    /// event stream ends when the connection drops, which is the
    /// session's connection-loss signal.
    pub fn connect<S>(
        stream: S,
        request_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_tx, mut writer_rx) = mpsc::channel::<Frame>(WRITER_CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let channel = Arc::new(Self {
            next_id: AtomicU64::new(1),
            writer_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            authenticated: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            request_timeout,
            cancel: CancellationToken::new(),
        });

        // Writer task: frames out.
        let cancel = channel.cancel.clone();
        let mut writer = FramedWrite::new(write_half, FrameCodec::new());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    frame = writer_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = writer.send(frame).await {
                            debug!(target: "rc.client.channel", error = %e, "Frame write failed");
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        });

        // Reader task: responses resolve pending requests, events flow
        // to the session in arrival order.
        let cancel = channel.cancel.clone();
        let pending = Arc::clone(&channel.pending);
        let closed = Arc::clone(&channel.closed);
        let mut reader = FramedRead::new(read_half, FrameCodec::new());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    frame = reader.next() => {
                        match frame {
                            Some(Ok(Frame::Response { id, response })) => {
                                resolve(&pending, id, Ok(response));
                            }
                            Some(Ok(Frame::Error { id, code, message })) => {
                                resolve(&pending, id, Err(SessionError::from_wire(code, message)));
                            }
                            Some(Ok(Frame::Event { event })) => {
                                if events_tx.send(event).is_err() {
                                    // Session gone; keep draining so
                                    // pending requests still resolve.
                                    debug!(
                                        target: "rc.client.channel",
                                        "Event receiver dropped"
                                    );
                                }
                            }
                            Some(Ok(frame)) => {
                                warn!(
                                    target: "rc.client.channel",
                                    frame = ?std::mem::discriminant(&frame),
                                    "Unexpected frame from server"
                                );
                            }
                            Some(Err(e)) => {
                                debug!(target: "rc.client.channel", error = %e, "Frame decode failed");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }

            closed.store(true, Ordering::SeqCst);
            cancel.cancel();
            fail_all(&pending, &SessionError::ConnectionLost);
            // events_tx drops here: the session observes end-of-stream.
        });

        (channel, events_rx)
    }

    /// Issue one request and await its correlated reply.
    pub async fn request(&self, request: ClientRequest) -> Result<ResponseBody, SessionError> {
        if self.is_closed() {
            return Err(SessionError::ConnectionLost);
        }
        if !self.is_authenticated() && !request.allowed_unauthenticated() {
            return Err(SessionError::Unauthenticated);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if self
            .writer_tx
            .send(Frame::Request { id, request })
            .await
            .is_err()
        {
            lock(&self.pending).remove(&id);
            return Err(SessionError::ConnectionLost);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a reply: the channel closed.
            Ok(Err(_)) => Err(SessionError::ConnectionLost),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Run the authentication handshake. Until this succeeds, every
    /// room-scoped request is rejected locally.
    pub async fn authenticate(&self, token: String) -> Result<UserId, SessionError> {
        match self.request(ClientRequest::Authenticate { token }).await? {
            ResponseBody::Authenticated { user_id } => {
                self.authenticated.store(true, Ordering::SeqCst);
                Ok(user_id)
            }
            other => Err(SessionError::Protocol(format!(
                "unexpected authenticate reply: {other:?}"
            ))),
        }
    }

    /// Close the channel. In-flight requests fail with
    /// `ConnectionLost`. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        fail_all(&self.pending, &SessionError::ConnectionLost);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}

fn lock(pending: &Mutex<PendingMap>) -> std::sync::MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn resolve(
    pending: &Mutex<PendingMap>,
    id: u64,
    result: Result<ResponseBody, SessionError>,
) {
    if let Some(tx) = lock(pending).remove(&id) {
        let _ = tx.send(result);
    } else {
        debug!(
            target: "rc.client.channel",
            request_id = id,
            "Reply for unknown or timed-out request"
        );
    }
}

fn fail_all(pending: &Mutex<PendingMap>, error: &SessionError) {
    for (_, tx) in lock(pending).drain() {
        let _ = tx.send(Err(error.clone()));
    }
}
