//! Media negotiation payloads.
//!
//! The session core relays these between clients and the relay engine
//! without interpreting them: codec lists, ICE/DTLS material, and RTP
//! parameter blobs are opaque `serde_json::Value`s owned by the relay
//! engine on one side and the client's media stack on the other.

use common::{ConsumerId, ProducerId, TransportId};
use serde::{Deserialize, Serialize};

/// Direction of a transport relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    /// Returns the direction as a string for log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

/// Router media capabilities, fetched once per room session and fed to
/// the client device before any transport is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterCapabilities {
    /// Opaque RTP capability description (codecs, header extensions).
    pub rtp: serde_json::Value,
}

/// Client device capabilities, sent with consume requests so the server
/// can check codec compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtpCapabilities {
    pub rtp: serde_json::Value,
}

/// DTLS handshake material forwarded during transport connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtlsParameters(pub serde_json::Value);

/// RTP send parameters forwarded with a produce request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtpParameters(pub serde_json::Value);

/// Parameters for a newly created server-side transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportParams {
    pub id: TransportId,
    pub direction: TransportDirection,
    /// Opaque ICE candidate/parameter description.
    pub ice: serde_json::Value,
    /// Opaque DTLS fingerprint description.
    pub dtls: serde_json::Value,
}

/// Parameters for a newly bound server-side consumer.
///
/// Consumers are created server-paused; the client resumes them after
/// attaching the local track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: common::MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}
