//! Signaling messages.
//!
//! Client→server calls are request/response pairs correlated by a
//! per-connection `id`; server→client pushes are fire-and-forget events.
//! Every room-scoped payload carries the target room id, so a client
//! holding sessions in several rooms can route without ambiguity.

use crate::media::{
    ConsumerParams, DtlsParameters, RouterCapabilities, RtpCapabilities, RtpParameters,
    TransportDirection, TransportParams,
};
use chrono::{DateTime, Utc};
use common::{ConsumerId, LeaveReason, MediaKind, ProducerId, Role, RoomId, RoomStatus, TransportId, UserId};
use serde::{Deserialize, Serialize};

/// Top-level wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client→server call. `id` correlates exactly one reply.
    Request { id: u64, request: ClientRequest },
    /// Server→client success reply.
    Response { id: u64, response: ResponseBody },
    /// Server→client error reply.
    Error {
        id: u64,
        code: ErrorCode,
        message: String,
    },
    /// Server→client unsolicited push.
    Event { event: ServerEvent },
}

/// Reference to a room: by resolved id, or by the shareable code printed
/// on an invite. The server always answers with the resolved id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoomRef {
    Id(RoomId),
    Code(String),
}

/// Feature flags chosen at room creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomFeatures {
    /// Gate non-moderator entry through the waiting room.
    pub waiting_room: bool,
    /// Allow screen-share producers.
    pub screen_share: bool,
}

impl Default for RoomFeatures {
    fn default() -> Self {
        Self {
            waiting_room: true,
            screen_share: true,
        }
    }
}

/// Room metadata as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: RoomId,
    pub code: String,
    pub title: String,
    pub status: RoomStatus,
    pub owner: UserId,
    pub max_participants: u32,
    pub features: RoomFeatures,
}

/// A participant's published producer as seen by other clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub paused: bool,
}

/// One participant's state within a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    /// False while the participant is in the disconnect grace period.
    pub connected: bool,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub hand_raised: bool,
    pub reaction: Option<String>,
    pub producers: Vec<ProducerInfo>,
}

/// Full room state delivered on join, admission, and resync. The client
/// registry is seeded by replacement from this snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room: RoomInfo,
    /// The receiving participant's own entry.
    pub you: ParticipantInfo,
    /// Every other current participant, with their producers.
    pub participants: Vec<ParticipantInfo>,
    /// Waiting-room queue in arrival order; populated for moderators
    /// only.
    pub waiting: Vec<WaitingInfo>,
}

/// One waiting-room queue entry, shown to moderators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingInfo {
    pub user_id: UserId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

/// Client→server requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Authentication handshake. Must complete before any room-scoped
    /// request; the token comes from the identity collaborator.
    Authenticate { token: String },

    // Room lifecycle
    CreateRoom {
        title: String,
        max_participants: u32,
        features: RoomFeatures,
    },
    JoinRoom {
        room: RoomRef,
        display_name: String,
    },
    LeaveRoom { room_id: RoomId },
    CloseRoom { room_id: RoomId },

    // Moderation
    Kick { room_id: RoomId, user_id: UserId },
    MuteAll { room_id: RoomId },
    ChangeRole {
        room_id: RoomId,
        user_id: UserId,
        role: Role,
    },
    UpdateStatus {
        room_id: RoomId,
        hand_raised: bool,
        reaction: Option<String>,
    },

    // Waiting room
    Admit { room_id: RoomId, user_id: UserId },
    Reject {
        room_id: RoomId,
        user_id: UserId,
        reason: String,
    },
    AdmitAll { room_id: RoomId },

    // Media negotiation
    RouterCapabilities { room_id: RoomId },
    CreateTransport {
        room_id: RoomId,
        direction: TransportDirection,
    },
    ConnectTransport {
        room_id: RoomId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        room_id: RoomId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    CloseProducer { room_id: RoomId, kind: MediaKind },
    PauseProducer { room_id: RoomId, kind: MediaKind },
    ResumeProducer { room_id: RoomId, kind: MediaKind },
    Consume {
        room_id: RoomId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    ResumeConsumer {
        room_id: RoomId,
        consumer_id: ConsumerId,
    },
}

impl ClientRequest {
    /// Whether this request may be issued before the authentication
    /// handshake completes.
    #[must_use]
    pub const fn allowed_unauthenticated(&self) -> bool {
        matches!(self, ClientRequest::Authenticate { .. })
    }

    /// Short operation name for log fields.
    #[must_use]
    pub const fn op_name(&self) -> &'static str {
        match self {
            ClientRequest::Authenticate { .. } => "authenticate",
            ClientRequest::CreateRoom { .. } => "create_room",
            ClientRequest::JoinRoom { .. } => "join_room",
            ClientRequest::LeaveRoom { .. } => "leave_room",
            ClientRequest::CloseRoom { .. } => "close_room",
            ClientRequest::Kick { .. } => "kick",
            ClientRequest::MuteAll { .. } => "mute_all",
            ClientRequest::ChangeRole { .. } => "change_role",
            ClientRequest::UpdateStatus { .. } => "update_status",
            ClientRequest::Admit { .. } => "admit",
            ClientRequest::Reject { .. } => "reject",
            ClientRequest::AdmitAll { .. } => "admit_all",
            ClientRequest::RouterCapabilities { .. } => "router_capabilities",
            ClientRequest::CreateTransport { .. } => "create_transport",
            ClientRequest::ConnectTransport { .. } => "connect_transport",
            ClientRequest::Produce { .. } => "produce",
            ClientRequest::CloseProducer { .. } => "close_producer",
            ClientRequest::PauseProducer { .. } => "pause_producer",
            ClientRequest::ResumeProducer { .. } => "resume_producer",
            ClientRequest::Consume { .. } => "consume",
            ClientRequest::ResumeConsumer { .. } => "resume_consumer",
        }
    }
}

/// Server→client success replies, one variant per request family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "body", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Generic acknowledgement for requests with no payload.
    Ack,
    Authenticated { user_id: UserId },
    RoomCreated { room: RoomInfo },
    /// Join accepted immediately (moderator auto-admit, or waiting room
    /// disabled).
    Joined { snapshot: RoomSnapshot },
    /// Join parked in the waiting room; admission or rejection arrives
    /// later as an event keyed by this resolved room id.
    Waiting { room_id: RoomId },
    RouterCapabilities { capabilities: RouterCapabilities },
    TransportCreated { transport: TransportParams },
    Produced { producer_id: ProducerId },
    Consumed { consumer: ConsumerParams },
}

/// Server→client pushes. Per-connection ordering is preserved; clients
/// converge by applying these as idempotent upserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    ParticipantJoined {
        room_id: RoomId,
        participant: ParticipantInfo,
    },
    ParticipantLeft {
        room_id: RoomId,
        user_id: UserId,
        reason: LeaveReason,
    },
    /// Connection state, hand-raise, or reaction change.
    ParticipantUpdated {
        room_id: RoomId,
        participant: ParticipantInfo,
    },
    RoleChanged {
        room_id: RoomId,
        user_id: UserId,
        role: Role,
    },

    ProducerNew {
        room_id: RoomId,
        owner: UserId,
        producer_id: ProducerId,
        kind: MediaKind,
    },
    ProducerClosed {
        room_id: RoomId,
        owner: UserId,
        producer_id: ProducerId,
        kind: MediaKind,
    },
    ProducerPaused {
        room_id: RoomId,
        owner: UserId,
        producer_id: ProducerId,
        kind: MediaKind,
    },
    ProducerResumed {
        room_id: RoomId,
        owner: UserId,
        producer_id: ProducerId,
        kind: MediaKind,
    },

    /// A non-moderator asked to join; delivered to moderators.
    WaitingJoined {
        room_id: RoomId,
        entry: WaitingInfo,
    },
    /// A queued entry withdrew (left or disconnected); delivered to
    /// moderators.
    WaitingLeft { room_id: RoomId, user_id: UserId },
    /// Admission granted; carries the snapshot so the admitted client
    /// seeds its registry without a second join round-trip.
    Admitted {
        room_id: RoomId,
        message: String,
        snapshot: RoomSnapshot,
    },
    /// Admission denied; terminal for this attempt.
    Rejected { room_id: RoomId, message: String },

    RoomClosed { room_id: RoomId, reason: String },
    /// The receiving participant was removed by a moderator.
    Kicked { room_id: RoomId, reason: String },
    /// Full-state resync; handled identically to initial seeding.
    Resync {
        room_id: RoomId,
        snapshot: RoomSnapshot,
    },
}

impl ServerEvent {
    /// The room this event targets.
    #[must_use]
    pub const fn room_id(&self) -> RoomId {
        match self {
            ServerEvent::ParticipantJoined { room_id, .. }
            | ServerEvent::ParticipantLeft { room_id, .. }
            | ServerEvent::ParticipantUpdated { room_id, .. }
            | ServerEvent::RoleChanged { room_id, .. }
            | ServerEvent::ProducerNew { room_id, .. }
            | ServerEvent::ProducerClosed { room_id, .. }
            | ServerEvent::ProducerPaused { room_id, .. }
            | ServerEvent::ProducerResumed { room_id, .. }
            | ServerEvent::WaitingJoined { room_id, .. }
            | ServerEvent::WaitingLeft { room_id, .. }
            | ServerEvent::Admitted { room_id, .. }
            | ServerEvent::Rejected { room_id, .. }
            | ServerEvent::RoomClosed { room_id, .. }
            | ServerEvent::Kicked { room_id, .. }
            | ServerEvent::Resync { room_id, .. } => *room_id,
        }
    }
}

/// Structured error codes carried on error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthenticated,
    Unauthorized,
    NotFound,
    Conflict,
    CapacityExceeded,
    NegotiationFailed,
    ShuttingDown,
    Internal,
}

impl ErrorCode {
    /// Numeric code for clients that log or switch on integers.
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            ErrorCode::Unauthenticated => 2,
            ErrorCode::Unauthorized => 3,
            ErrorCode::NotFound => 4,
            ErrorCode::Conflict => 5,
            ErrorCode::CapacityExceeded => 7,
            ErrorCode::NegotiationFailed => 8,
            ErrorCode::ShuttingDown => 9,
            ErrorCode::Internal => 6,
        }
    }
}
