//! Media transport orchestrator.
//!
//! Owns one client's media negotiation for one room session: the
//! device (loaded from router capabilities), one send and one receive
//! transport, producers for local tracks, and consumers on remote
//! producers.
//!
//! # The pending-consume queue
//!
//! A new-producer notification and device/transport readiness arrive on
//! independent event streams with no inherent ordering, so a consume
//! request can land before the device is loaded or the receive
//! transport exists. Such requests queue FIFO and drain once both
//! preconditions hold - no drop, no duplication. Each drained request
//! binds a server-side consumer, instantiates the local consumer,
//! hands the track back for registry attachment, and resumes the
//! consumer (consumers start server-paused).
//!
//! # Failure semantics
//!
//! A transport that enters a failed connection state is closed
//! immediately, never retried here - the session state machine decides
//! whether to restart. A failed consume logs and resolves to "no
//! consumer" so one bad remote track cannot abort a join sequence.
//! Results of operations issued before a `cleanup()` are discarded via
//! the session epoch captured before each suspension.

use crate::channel::SignalingChannel;
use crate::errors::SessionError;

use common::{ConsumerId, MediaKind, ProducerId, RoomId, TransportId, UserId};
use room_protocol::{
    ClientRequest, DtlsParameters, ResponseBody, RouterCapabilities, RtpCapabilities,
    RtpParameters, TransportDirection,
};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A local media track handle: what the UI captured from hardware (or,
/// for remote tracks, what gets attached to a tile). The core never
/// touches the media payload behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
}

impl MediaTrack {
    /// A locally captured track.
    #[must_use]
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
        }
    }

    /// A track received from a remote producer.
    #[must_use]
    pub fn remote(kind: MediaKind) -> Self {
        Self::new(kind, "remote")
    }
}

/// A consumed remote track, ready for registry attachment.
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub track: MediaTrack,
}

/// A producer for one of our local tracks.
#[derive(Debug, Clone)]
pub struct LocalProducer {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub paused: bool,
    pub track: MediaTrack,
}

/// Connection state of a client-side transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct ClientTransport {
    id: TransportId,
    state: TransportState,
}

/// The loaded device: router capabilities negotiated once per session.
#[derive(Debug, Clone)]
struct Device {
    rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Copy)]
struct PendingConsume {
    producer_id: ProducerId,
    owner: UserId,
    kind: MediaKind,
}

/// Per-session media orchestrator. Driven by the session task; all
/// methods take `&mut self`, so operations are naturally serialized.
pub struct MediaOrchestrator {
    channel: Arc<SignalingChannel>,
    room_id: RoomId,
    /// Session generation; bumped by `cleanup()`. Captured before each
    /// suspension and checked after, so late completions are discarded.
    epoch: u64,
    device: Option<Device>,
    send_transport: Option<ClientTransport>,
    recv_transport: Option<ClientTransport>,
    producers: HashMap<MediaKind, LocalProducer>,
    consumers: HashMap<ConsumerId, RemoteTrack>,
    pending_consumes: VecDeque<PendingConsume>,
}

impl MediaOrchestrator {
    #[must_use]
    pub fn new(channel: Arc<SignalingChannel>, room_id: RoomId) -> Self {
        Self {
            channel,
            room_id,
            epoch: 0,
            device: None,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            pending_consumes: VecDeque::new(),
        }
    }

    /// Load the device from router capabilities. Idempotent per
    /// session.
    pub fn load_device(&mut self, capabilities: RouterCapabilities) {
        if self.device.is_some() {
            return;
        }
        self.device = Some(Device {
            rtp_capabilities: RtpCapabilities {
                rtp: capabilities.rtp,
            },
        });
        debug!(target: "rc.client.media", room_id = %self.room_id, "Device loaded");
    }

    /// Whether consume preconditions hold: device loaded and receive
    /// transport created.
    #[must_use]
    pub fn is_ready_to_consume(&self) -> bool {
        self.device.is_some() && self.recv_transport.is_some()
    }

    /// Create and connect the send transport. Idempotent.
    pub async fn create_send_transport(&mut self) -> Result<(), SessionError> {
        if self.send_transport.is_some() {
            return Ok(());
        }
        let transport = self.create_transport(TransportDirection::Send).await?;
        self.send_transport = Some(transport);
        Ok(())
    }

    /// Create and connect the receive transport. Idempotent. Queued
    /// consume requests do not drain here; the caller drains once the
    /// device is also loaded.
    pub async fn create_recv_transport(&mut self) -> Result<(), SessionError> {
        if self.recv_transport.is_some() {
            return Ok(());
        }
        let transport = self.create_transport(TransportDirection::Recv).await?;
        self.recv_transport = Some(transport);
        Ok(())
    }

    async fn create_transport(
        &mut self,
        direction: TransportDirection,
    ) -> Result<ClientTransport, SessionError> {
        let epoch = self.epoch;
        let response = self
            .channel
            .request(ClientRequest::CreateTransport {
                room_id: self.room_id,
                direction,
            })
            .await?;
        self.check_epoch(epoch)?;

        let params = match response {
            ResponseBody::TransportCreated { transport } => transport,
            other => {
                return Err(SessionError::Protocol(format!(
                    "unexpected create_transport reply: {other:?}"
                )))
            }
        };

        // Forward our DTLS parameters; resolved on server acknowledgement.
        self.channel
            .request(ClientRequest::ConnectTransport {
                room_id: self.room_id,
                transport_id: params.id,
                dtls_parameters: local_dtls_parameters(),
            })
            .await?;
        self.check_epoch(epoch)?;

        debug!(
            target: "rc.client.media",
            transport_id = %params.id,
            direction = direction.as_str(),
            "Transport created and connected"
        );

        Ok(ClientTransport {
            id: params.id,
            state: TransportState::Connected,
        })
    }

    /// Publish a local track. Requires the send transport. Screen-kind
    /// replaces any prior producer of that kind.
    pub async fn produce_track(&mut self, track: MediaTrack) -> Result<ProducerId, SessionError> {
        let kind = track.kind;
        let transport_id = self
            .send_transport
            .as_ref()
            .ok_or_else(|| {
                SessionError::NegotiationFailed("send transport not created".to_string())
            })?
            .id;

        if kind == MediaKind::Screen {
            self.close_producer(MediaKind::Screen).await?;
        } else if self.producers.contains_key(&kind) {
            return Err(SessionError::NegotiationFailed(format!(
                "a {kind} producer already exists"
            )));
        }

        let epoch = self.epoch;
        let response = self
            .channel
            .request(ClientRequest::Produce {
                room_id: self.room_id,
                transport_id,
                kind,
                rtp_parameters: encoding_hints(kind),
            })
            .await?;
        self.check_epoch(epoch)?;

        let producer_id = match response {
            ResponseBody::Produced { producer_id } => producer_id,
            other => {
                return Err(SessionError::Protocol(format!(
                    "unexpected produce reply: {other:?}"
                )))
            }
        };

        self.producers.insert(
            kind,
            LocalProducer {
                id: producer_id,
                kind,
                paused: false,
                track,
            },
        );

        debug!(
            target: "rc.client.media",
            producer_id = %producer_id,
            kind = kind.as_str(),
            "Producing local track"
        );

        Ok(producer_id)
    }

    /// Request to consume a remote producer. If the device or receive
    /// transport is not ready yet, the request queues FIFO and the
    /// caller gets an empty result; otherwise the whole queue drains in
    /// arrival order and the newly attached tracks come back.
    pub async fn consume_producer(
        &mut self,
        producer_id: ProducerId,
        owner: UserId,
        kind: MediaKind,
    ) -> Result<Vec<(UserId, RemoteTrack)>, SessionError> {
        self.pending_consumes.push_back(PendingConsume {
            producer_id,
            owner,
            kind,
        });

        if self.is_ready_to_consume() {
            self.drain_pending_consumes().await
        } else {
            debug!(
                target: "rc.client.media",
                producer_id = %producer_id,
                queued = self.pending_consumes.len(),
                "Consume queued until device and receive transport are ready"
            );
            Ok(Vec::new())
        }
    }

    /// Drain the pending-consume queue, FIFO, while preconditions hold.
    /// Call after the device loads and the receive transport exists.
    pub async fn drain_pending_consumes(
        &mut self,
    ) -> Result<Vec<(UserId, RemoteTrack)>, SessionError> {
        let mut attached = Vec::new();
        while self.is_ready_to_consume() {
            let Some(request) = self.pending_consumes.pop_front() else {
                break;
            };
            match self.attempt_consume(request).await {
                Ok(Some(pair)) => attached.push(pair),
                // A per-track failure resolves to "no consumer" so the
                // rest of the queue still drains.
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(attached)
    }

    /// One consume round-trip: bind the server consumer, instantiate
    /// the local one, resume it.
    async fn attempt_consume(
        &mut self,
        request: PendingConsume,
    ) -> Result<Option<(UserId, RemoteTrack)>, SessionError> {
        let epoch = self.epoch;
        let rtp_capabilities = match &self.device {
            Some(device) => device.rtp_capabilities.clone(),
            None => return Ok(None),
        };

        let response = self
            .channel
            .request(ClientRequest::Consume {
                room_id: self.room_id,
                producer_id: request.producer_id,
                rtp_capabilities,
            })
            .await;
        self.check_epoch(epoch)?;

        let consumer = match response {
            Ok(ResponseBody::Consumed { consumer }) => consumer,
            Ok(other) => {
                warn!(
                    target: "rc.client.media",
                    producer_id = %request.producer_id,
                    reply = ?other,
                    "Unexpected consume reply, skipping track"
                );
                return Ok(None);
            }
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(e) => {
                warn!(
                    target: "rc.client.media",
                    producer_id = %request.producer_id,
                    error = %e,
                    "Consume failed, continuing without this track"
                );
                return Ok(None);
            }
        };

        let remote = RemoteTrack {
            consumer_id: consumer.id,
            producer_id: consumer.producer_id,
            kind: consumer.kind,
            track: MediaTrack::remote(consumer.kind),
        };
        self.consumers.insert(consumer.id, remote.clone());

        // Consumers start server-paused; resume now that the local
        // consumer exists.
        let resume = self
            .channel
            .request(ClientRequest::ResumeConsumer {
                room_id: self.room_id,
                consumer_id: consumer.id,
            })
            .await;
        self.check_epoch(epoch)?;
        match resume {
            Ok(_) => {}
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(e) => {
                warn!(
                    target: "rc.client.media",
                    consumer_id = %consumer.id,
                    error = %e,
                    "Consumer resume failed"
                );
            }
        }

        debug!(
            target: "rc.client.media",
            consumer_id = %consumer.id,
            producer_id = %request.producer_id,
            kind = request.kind.as_str(),
            "Consumer attached and resumed"
        );

        Ok(Some((request.owner, remote)))
    }

    /// Pause or resume our producer of `kind`, mirrored to the server
    /// so others' mute indicators stay correct. No-op if absent or
    /// already in the target state.
    pub async fn set_producer_paused(
        &mut self,
        kind: MediaKind,
        paused: bool,
    ) -> Result<(), SessionError> {
        let epoch = self.epoch;
        let Some(producer) = self.producers.get(&kind) else {
            return Ok(());
        };
        if producer.paused == paused {
            return Ok(());
        }

        let request = if paused {
            ClientRequest::PauseProducer {
                room_id: self.room_id,
                kind,
            }
        } else {
            ClientRequest::ResumeProducer {
                room_id: self.room_id,
                kind,
            }
        };
        self.channel.request(request).await?;
        self.check_epoch(epoch)?;

        if let Some(producer) = self.producers.get_mut(&kind) {
            producer.paused = paused;
        }
        Ok(())
    }

    /// Close our producer of `kind`. Safe on an already-closed
    /// producer.
    pub async fn close_producer(&mut self, kind: MediaKind) -> Result<(), SessionError> {
        if self.producers.remove(&kind).is_none() {
            return Ok(());
        }

        let epoch = self.epoch;
        match self
            .channel
            .request(ClientRequest::CloseProducer {
                room_id: self.room_id,
                kind,
            })
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(e) => {
                debug!(
                    target: "rc.client.media",
                    kind = kind.as_str(),
                    error = %e,
                    "Producer close reported an error (already gone?)"
                );
            }
        }
        self.check_epoch(epoch)?;
        Ok(())
    }

    /// Swap the hardware track behind a producer without renegotiating
    /// it.
    pub fn replace_producer_track(
        &mut self,
        kind: MediaKind,
        track: MediaTrack,
    ) -> Result<(), SessionError> {
        if track.kind != kind {
            return Err(SessionError::NegotiationFailed(format!(
                "track kind {} does not match producer kind {kind}",
                track.kind
            )));
        }
        let producer = self.producers.get_mut(&kind).ok_or_else(|| {
            SessionError::NegotiationFailed(format!("no {kind} producer to replace"))
        })?;
        producer.track = track;
        Ok(())
    }

    /// React to a transport entering a failed connection state: close
    /// it immediately. Returns true when the failure concerned one of
    /// our transports - the session decides whether to restart.
    pub fn on_transport_failed(&mut self, transport_id: TransportId) -> bool {
        let mut ours = false;
        if self.send_transport.is_some_and(|t| t.id == transport_id) {
            self.send_transport = None;
            self.producers.clear();
            ours = true;
        }
        if self.recv_transport.is_some_and(|t| t.id == transport_id) {
            self.recv_transport = None;
            self.consumers.clear();
            ours = true;
        }
        if ours {
            warn!(
                target: "rc.client.media",
                transport_id = %transport_id,
                "Transport failed, closed without retry"
            );
        }
        ours
    }

    /// Drop the local consumer for `consumer_id` (cascade from a
    /// producer closure or participant departure). Idempotent.
    pub fn close_consumer(&mut self, consumer_id: ConsumerId) {
        if self.consumers.remove(&consumer_id).is_some() {
            debug!(
                target: "rc.client.media",
                consumer_id = %consumer_id,
                "Consumer closed"
            );
        }
    }

    /// Release everything: producers, consumers, both transports, the
    /// device, and the pending queue. Bumps the session epoch so late
    /// completions are discarded. Idempotent and multi-call-safe.
    pub fn cleanup(&mut self) {
        self.epoch += 1;
        self.producers.clear();
        self.consumers.clear();
        self.pending_consumes.clear();
        self.send_transport = None;
        self.recv_transport = None;
        self.device = None;
        debug!(
            target: "rc.client.media",
            room_id = %self.room_id,
            epoch = self.epoch,
            "Media state cleaned up"
        );
    }

    /// Current session epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn producer(&self, kind: MediaKind) -> Option<&LocalProducer> {
        self.producers.get(&kind)
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    #[must_use]
    pub fn pending_consume_count(&self) -> usize {
        self.pending_consumes.len()
    }

    fn check_epoch(&self, captured: u64) -> Result<(), SessionError> {
        if captured == self.epoch {
            Ok(())
        } else {
            Err(SessionError::StaleEvent)
        }
    }
}

/// Our side of the DTLS handshake, forwarded verbatim by the server to
/// the relay engine.
fn local_dtls_parameters() -> DtlsParameters {
    DtlsParameters(json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": Uuid::new_v4() }],
    }))
}

/// Kind-specific encoding hints: layered bitrates for camera video, a
/// single detail-biased layer for screen share, DTX for audio.
fn encoding_hints(kind: MediaKind) -> RtpParameters {
    let params = match kind {
        MediaKind::Audio => json!({
            "codec": "opus",
            "dtx": true,
        }),
        MediaKind::Video => json!({
            "encodings": [
                { "rid": "q", "maxBitrate": 150_000, "scaleResolutionDownBy": 4 },
                { "rid": "h", "maxBitrate": 500_000, "scaleResolutionDownBy": 2 },
                { "rid": "f", "maxBitrate": 1_200_000 },
            ],
        }),
        MediaKind::Screen => json!({
            "encodings": [{ "maxBitrate": 2_500_000 }],
            "contentHint": "detail",
        }),
    };
    RtpParameters(params)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use room_protocol::{ConsumerParams, Frame, FrameCodec, TransportParams};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::codec::{FramedRead, FramedWrite};

    /// Scripted server end: answers media requests protocol-correctly
    /// and records the order of consume calls.
    fn spawn_auto_responder(
        far: tokio::io::DuplexStream,
    ) -> Arc<Mutex<Vec<ProducerId>>> {
        let consume_order = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&consume_order);

        tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(far);
            let mut reader = FramedRead::new(read_half, FrameCodec::new());
            let mut writer = FramedWrite::new(write_half, FrameCodec::new());

            while let Some(Ok(Frame::Request { id, request })) = reader.next().await {
                let response = match request {
                    ClientRequest::Authenticate { .. } => ResponseBody::Authenticated {
                        user_id: UserId::new(),
                    },
                    ClientRequest::CreateTransport { direction, .. } => {
                        ResponseBody::TransportCreated {
                            transport: TransportParams {
                                id: TransportId::new(),
                                direction,
                                ice: json!({}),
                                dtls: json!({}),
                            },
                        }
                    }
                    ClientRequest::ConnectTransport { .. } => ResponseBody::Ack,
                    ClientRequest::Produce { .. } => ResponseBody::Produced {
                        producer_id: ProducerId::new(),
                    },
                    ClientRequest::Consume { producer_id, .. } => {
                        log.lock().unwrap().push(producer_id);
                        ResponseBody::Consumed {
                            consumer: ConsumerParams {
                                id: ConsumerId::new(),
                                producer_id,
                                kind: MediaKind::Audio,
                                rtp_parameters: RtpParameters(json!({})),
                                paused: true,
                            },
                        }
                    }
                    _ => ResponseBody::Ack,
                };
                if writer.send(Frame::Response { id, response }).await.is_err() {
                    break;
                }
            }
        });

        consume_order
    }

    async fn ready_orchestrator() -> (MediaOrchestrator, Arc<Mutex<Vec<ProducerId>>>) {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let consume_order = spawn_auto_responder(far);
        let (channel, _events) = SignalingChannel::connect(near, Duration::from_secs(2));
        channel.authenticate("token".to_string()).await.unwrap();
        (
            MediaOrchestrator::new(channel, RoomId::new()),
            consume_order,
        )
    }

    #[tokio::test]
    async fn test_consumes_queue_until_both_preconditions_hold() {
        let (mut media, consume_order) = ready_orchestrator().await;

        let producers: Vec<ProducerId> = (0..3).map(|_| ProducerId::new()).collect();
        for producer_id in &producers {
            let attached = media
                .consume_producer(*producer_id, UserId::new(), MediaKind::Audio)
                .await
                .unwrap();
            assert!(attached.is_empty());
        }
        assert_eq!(media.pending_consume_count(), 3);
        assert!(consume_order.lock().unwrap().is_empty());

        // Receive transport alone is not enough; the device must load
        // too.
        media.create_recv_transport().await.unwrap();
        assert!(!media.is_ready_to_consume());
        assert_eq!(media.pending_consume_count(), 3);

        media.load_device(RouterCapabilities { rtp: json!({}) });
        let attached = media.drain_pending_consumes().await.unwrap();

        // Exactly N attempts, once each, in arrival order.
        assert_eq!(attached.len(), 3);
        assert_eq!(media.pending_consume_count(), 0);
        assert_eq!(*consume_order.lock().unwrap(), producers);
        assert_eq!(media.consumer_count(), 3);
    }

    #[tokio::test]
    async fn test_consume_with_ready_preconditions_is_immediate() {
        let (mut media, consume_order) = ready_orchestrator().await;
        media.load_device(RouterCapabilities { rtp: json!({}) });
        media.create_recv_transport().await.unwrap();

        let producer_id = ProducerId::new();
        let attached = media
            .consume_producer(producer_id, UserId::new(), MediaKind::Audio)
            .await
            .unwrap();

        assert_eq!(attached.len(), 1);
        assert_eq!(consume_order.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_device_is_idempotent() {
        let (mut media, _log) = ready_orchestrator().await;

        media.load_device(RouterCapabilities { rtp: json!({"v": 1}) });
        media.load_device(RouterCapabilities { rtp: json!({"v": 2}) });

        // First load wins.
        let loaded = &media.device.as_ref().unwrap().rtp_capabilities.rtp;
        assert_eq!(loaded.get("v"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_transport_creation_is_idempotent() {
        let (mut media, _log) = ready_orchestrator().await;

        media.create_send_transport().await.unwrap();
        let first = media.send_transport.unwrap().id;
        media.create_send_transport().await.unwrap();
        assert_eq!(media.send_transport.unwrap().id, first);
    }

    #[tokio::test]
    async fn test_produce_requires_send_transport() {
        let (mut media, _log) = ready_orchestrator().await;

        let result = media
            .produce_track(MediaTrack::new(MediaKind::Audio, "mic"))
            .await;
        assert!(matches!(result, Err(SessionError::NegotiationFailed(_))));
    }

    #[tokio::test]
    async fn test_screen_produce_replaces_prior() {
        let (mut media, _log) = ready_orchestrator().await;
        media.create_send_transport().await.unwrap();

        let first = media
            .produce_track(MediaTrack::new(MediaKind::Screen, "window-a"))
            .await
            .unwrap();
        let second = media
            .produce_track(MediaTrack::new(MediaKind::Screen, "window-b"))
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(media.producer(MediaKind::Screen).unwrap().id, second);
    }

    #[tokio::test]
    async fn test_pause_is_noop_when_already_paused() {
        let (mut media, _log) = ready_orchestrator().await;
        media.create_send_transport().await.unwrap();
        media
            .produce_track(MediaTrack::new(MediaKind::Audio, "mic"))
            .await
            .unwrap();

        media
            .set_producer_paused(MediaKind::Audio, true)
            .await
            .unwrap();
        assert!(media.producer(MediaKind::Audio).unwrap().paused);
        // Second pause is a no-op, not an error.
        media
            .set_producer_paused(MediaKind::Audio, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_producer_safe_when_absent() {
        let (mut media, _log) = ready_orchestrator().await;
        media.close_producer(MediaKind::Video).await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_track_checks_kind() {
        let (mut media, _log) = ready_orchestrator().await;
        media.create_send_transport().await.unwrap();
        media
            .produce_track(MediaTrack::new(MediaKind::Video, "cam-1"))
            .await
            .unwrap();

        let swapped = MediaTrack::new(MediaKind::Video, "cam-2");
        media
            .replace_producer_track(MediaKind::Video, swapped)
            .unwrap();

        assert!(media
            .replace_producer_track(MediaKind::Audio, MediaTrack::new(MediaKind::Video, "x"))
            .is_err());
        assert_eq!(media.producer(MediaKind::Video).unwrap().track.label, "cam-2");
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent_and_bumps_epoch() {
        let (mut media, _log) = ready_orchestrator().await;
        media.create_send_transport().await.unwrap();
        media.load_device(RouterCapabilities { rtp: json!({}) });
        media
            .produce_track(MediaTrack::new(MediaKind::Audio, "mic"))
            .await
            .unwrap();

        let epoch_before = media.epoch();
        media.cleanup();
        media.cleanup();

        assert_eq!(media.epoch(), epoch_before + 2);
        assert!(media.producer(MediaKind::Audio).is_none());
        assert_eq!(media.consumer_count(), 0);
        assert_eq!(media.pending_consume_count(), 0);
        assert!(!media.is_ready_to_consume());
    }

    #[tokio::test]
    async fn test_transport_failure_closes_without_retry() {
        let (mut media, _log) = ready_orchestrator().await;
        media.create_send_transport().await.unwrap();
        let transport_id = media.send_transport.unwrap().id;

        assert!(media.on_transport_failed(transport_id));
        assert!(media.send_transport.is_none());
        // Unknown transports are not ours.
        assert!(!media.on_transport_failed(TransportId::new()));
    }
}
