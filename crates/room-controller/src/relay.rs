//! Relay engine seam.
//!
//! The relay engine forwards media packets between participants; this
//! core only drives its control surface. [`RelayEngine`] is the narrow
//! interface the room actor consumes; [`LoopbackRelay`] is an in-process
//! stand-in that allocates ids and tracks bindings without forwarding
//! packets, used by the dev binary and the test harness.

use async_trait::async_trait;
use common::{ConsumerId, MediaKind, ProducerId, RoomId, TransportId};
use room_protocol::{
    ConsumerParams, DtlsParameters, RouterCapabilities, RtpCapabilities, RtpParameters,
    TransportDirection, TransportParams,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Error type for relay control operations.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Transport not found")]
    TransportNotFound,

    #[error("Producer not found")]
    ProducerNotFound,

    #[error("Consumer not found")]
    ConsumerNotFound,

    /// The engine refused the operation (codec mismatch, resource
    /// exhaustion).
    #[error("Relay rejected operation: {0}")]
    Rejected(String),
}

/// Control surface of the external relay engine. The core never touches
/// RTP packets; it only creates and wires the engine's objects.
#[async_trait]
pub trait RelayEngine: Send + Sync {
    /// Media capabilities of the room's router, fed to client devices.
    async fn router_capabilities(&self, room: RoomId) -> Result<RouterCapabilities, RelayError>;

    /// Allocate a server-side transport for one client.
    async fn create_transport(
        &self,
        room: RoomId,
        direction: TransportDirection,
    ) -> Result<TransportParams, RelayError>;

    /// Complete the DTLS handshake for a transport.
    async fn connect_transport(
        &self,
        transport: TransportId,
        dtls: DtlsParameters,
    ) -> Result<(), RelayError>;

    /// Bind a new producer to a send transport.
    async fn produce(
        &self,
        transport: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, RelayError>;

    /// Bind a consumer on `producer` to a receive transport. Consumers
    /// start paused.
    async fn consume(
        &self,
        transport: TransportId,
        producer: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerParams, RelayError>;

    async fn pause_producer(&self, producer: ProducerId) -> Result<(), RelayError>;

    async fn resume_producer(&self, producer: ProducerId) -> Result<(), RelayError>;

    /// Close a producer. The engine cascades closure to every consumer
    /// bound to it.
    async fn close_producer(&self, producer: ProducerId) -> Result<(), RelayError>;

    async fn resume_consumer(&self, consumer: ConsumerId) -> Result<(), RelayError>;

    /// Close a transport and everything bound to it.
    async fn close_transport(&self, transport: TransportId) -> Result<(), RelayError>;
}

#[derive(Debug)]
struct TransportRecord {
    room: RoomId,
    direction: TransportDirection,
    connected: bool,
}

#[derive(Debug)]
struct ProducerRecord {
    transport: TransportId,
    kind: MediaKind,
    paused: bool,
}

#[derive(Debug)]
struct ConsumerRecord {
    transport: TransportId,
    producer: ProducerId,
    paused: bool,
}

#[derive(Debug, Default)]
struct LoopbackState {
    transports: HashMap<TransportId, TransportRecord>,
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
    /// Producer ids in the order consume calls arrived, for tests that
    /// assert drain order and exactness.
    consume_log: Vec<ProducerId>,
}

/// In-process relay stand-in.
///
/// Allocates ids, tracks transport/producer/consumer bindings, and
/// cascades producer closure onto bound consumers; never moves media.
#[derive(Debug, Default)]
pub struct LoopbackRelay {
    state: Mutex<LoopbackState>,
}

impl LoopbackRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackState> {
        // A poisoned lock only means a panicking test thread; the state
        // itself stays coherent.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Producer ids consume calls were issued for, in arrival order.
    #[must_use]
    pub fn consume_log(&self) -> Vec<ProducerId> {
        self.lock().consume_log.clone()
    }

    /// Whether the engine still holds the given producer.
    #[must_use]
    pub fn has_producer(&self, producer: ProducerId) -> bool {
        self.lock().producers.contains_key(&producer)
    }

    /// Whether the engine still holds the given consumer.
    #[must_use]
    pub fn has_consumer(&self, consumer: ConsumerId) -> bool {
        self.lock().consumers.contains_key(&consumer)
    }
}

#[async_trait]
impl RelayEngine for LoopbackRelay {
    async fn router_capabilities(&self, room: RoomId) -> Result<RouterCapabilities, RelayError> {
        Ok(RouterCapabilities {
            rtp: json!({
                "codecs": ["opus", "vp8", "vp9"],
                "room": room,
            }),
        })
    }

    async fn create_transport(
        &self,
        room: RoomId,
        direction: TransportDirection,
    ) -> Result<TransportParams, RelayError> {
        let id = TransportId::new();
        self.lock().transports.insert(
            id,
            TransportRecord {
                room,
                direction,
                connected: false,
            },
        );

        debug!(
            target: "rc.relay",
            transport_id = %id,
            direction = direction.as_str(),
            "Loopback transport created"
        );

        Ok(TransportParams {
            id,
            direction,
            ice: json!({ "candidates": [], "lite": true }),
            dtls: json!({ "fingerprints": [] }),
        })
    }

    async fn connect_transport(
        &self,
        transport: TransportId,
        _dtls: DtlsParameters,
    ) -> Result<(), RelayError> {
        let mut state = self.lock();
        let record = state
            .transports
            .get_mut(&transport)
            .ok_or(RelayError::TransportNotFound)?;
        record.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport: TransportId,
        kind: MediaKind,
        _rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, RelayError> {
        let mut state = self.lock();
        let record = state
            .transports
            .get(&transport)
            .ok_or(RelayError::TransportNotFound)?;
        if record.direction != TransportDirection::Send {
            return Err(RelayError::Rejected(
                "produce requires a send transport".to_string(),
            ));
        }

        let id = ProducerId::new();
        state.producers.insert(
            id,
            ProducerRecord {
                transport,
                kind,
                paused: false,
            },
        );
        Ok(id)
    }

    async fn consume(
        &self,
        transport: TransportId,
        producer: ProducerId,
        _rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerParams, RelayError> {
        let mut state = self.lock();
        let transport_record = state
            .transports
            .get(&transport)
            .ok_or(RelayError::TransportNotFound)?;
        if transport_record.direction != TransportDirection::Recv {
            return Err(RelayError::Rejected(
                "consume requires a receive transport".to_string(),
            ));
        }
        let kind = state
            .producers
            .get(&producer)
            .ok_or(RelayError::ProducerNotFound)?
            .kind;

        let id = ConsumerId::new();
        state.consumers.insert(
            id,
            ConsumerRecord {
                transport,
                producer,
                paused: true,
            },
        );
        state.consume_log.push(producer);

        Ok(ConsumerParams {
            id,
            producer_id: producer,
            kind,
            rtp_parameters: RtpParameters(json!({ "mid": id })),
            paused: true,
        })
    }

    async fn pause_producer(&self, producer: ProducerId) -> Result<(), RelayError> {
        let mut state = self.lock();
        let record = state
            .producers
            .get_mut(&producer)
            .ok_or(RelayError::ProducerNotFound)?;
        record.paused = true;
        Ok(())
    }

    async fn resume_producer(&self, producer: ProducerId) -> Result<(), RelayError> {
        let mut state = self.lock();
        let record = state
            .producers
            .get_mut(&producer)
            .ok_or(RelayError::ProducerNotFound)?;
        record.paused = false;
        Ok(())
    }

    async fn close_producer(&self, producer: ProducerId) -> Result<(), RelayError> {
        let mut state = self.lock();
        if state.producers.remove(&producer).is_none() {
            return Err(RelayError::ProducerNotFound);
        }
        state.consumers.retain(|_, c| c.producer != producer);
        Ok(())
    }

    async fn resume_consumer(&self, consumer: ConsumerId) -> Result<(), RelayError> {
        let mut state = self.lock();
        let record = state
            .consumers
            .get_mut(&consumer)
            .ok_or(RelayError::ConsumerNotFound)?;
        record.paused = false;
        Ok(())
    }

    async fn close_transport(&self, transport: TransportId) -> Result<(), RelayError> {
        let mut state = self.lock();
        if state.transports.remove(&transport).is_none() {
            return Err(RelayError::TransportNotFound);
        }
        let orphaned: Vec<ProducerId> = state
            .producers
            .iter()
            .filter(|(_, p)| p.transport == transport)
            .map(|(id, _)| *id)
            .collect();
        for producer in &orphaned {
            state.producers.remove(producer);
            state.consumers.retain(|_, c| c.producer != *producer);
        }
        state.consumers.retain(|_, c| c.transport != transport);
        Ok(())
    }
}
