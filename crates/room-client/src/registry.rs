//! Client-side registry mirror.
//!
//! The server is the sole authority for room state; this mirror is
//! seeded by replacement from join/admission snapshots and thereafter
//! mutated only by discrete signaling events, applied as idempotent
//! upserts. The UI layer observes it through a `watch` channel and
//! never mutates it.
//!
//! Applying the same event stream in server-emission order always
//! converges on the same view, regardless of processing delay.

use crate::media::RemoteTrack;

use common::{ConsumerId, MediaKind, UserId};
use room_protocol::{ParticipantInfo, RoomInfo, RoomSnapshot, ServerEvent, WaitingInfo};
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::debug;

/// One remote participant as the UI sees it: authoritative info plus
/// the locally attached media tracks.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub info: ParticipantInfo,
    /// Attached consumer tracks, by kind.
    pub tracks: HashMap<MediaKind, RemoteTrack>,
}

/// Cloned, read-only view published to the UI layer.
#[derive(Debug, Clone, Default)]
pub struct RegistryView {
    pub room: Option<RoomInfo>,
    /// Our own participant entry.
    pub you: Option<ParticipantInfo>,
    /// Every other participant, sorted by user id for stable rendering.
    pub participants: Vec<RegistryEntry>,
    /// Waiting-room queue (moderators only).
    pub waiting: Vec<WaitingInfo>,
}

/// The registry mirror.
pub struct Registry {
    room: Option<RoomInfo>,
    you: Option<ParticipantInfo>,
    participants: HashMap<UserId, RegistryEntry>,
    waiting: Vec<WaitingInfo>,
    watch_tx: watch::Sender<RegistryView>,
}

impl Registry {
    /// Create an empty registry and its UI subscription.
    #[must_use]
    pub fn new() -> (Self, watch::Receiver<RegistryView>) {
        let (watch_tx, watch_rx) = watch::channel(RegistryView::default());
        (
            Self {
                room: None,
                you: None,
                participants: HashMap::new(),
                waiting: Vec::new(),
                watch_tx,
            },
            watch_rx,
        )
    }

    /// Seed by replacement from a join/admission snapshot. Returns the
    /// consumer ids of any previously attached tracks, which the caller
    /// must close.
    pub fn seed(&mut self, snapshot: &RoomSnapshot) -> Vec<ConsumerId> {
        let dropped = self.collect_all_consumers();

        self.room = Some(snapshot.room.clone());
        self.you = Some(snapshot.you.clone());
        self.participants = snapshot
            .participants
            .iter()
            .map(|info| {
                (
                    info.user_id,
                    RegistryEntry {
                        info: info.clone(),
                        tracks: HashMap::new(),
                    },
                )
            })
            .collect();
        self.waiting = snapshot.waiting.clone();

        self.publish();
        dropped
    }

    /// Apply a full-state resync: known entries are updated in place
    /// preserving attached tracks, new entries created, removed entries
    /// torn down. Returns consumer ids that must be closed.
    pub fn resync(&mut self, snapshot: &RoomSnapshot) -> Vec<ConsumerId> {
        let mut dropped = Vec::new();

        self.room = Some(snapshot.room.clone());
        self.you = Some(snapshot.you.clone());
        self.waiting = snapshot.waiting.clone();

        let mut fresh: HashMap<UserId, RegistryEntry> = HashMap::new();
        for info in &snapshot.participants {
            let mut entry = self
                .participants
                .remove(&info.user_id)
                .unwrap_or_else(|| RegistryEntry {
                    info: info.clone(),
                    tracks: HashMap::new(),
                });
            entry.info = info.clone();
            // A track whose source producer vanished is dead.
            let (kept, gone) = split_tracks(entry.tracks, &entry.info);
            entry.tracks = kept;
            dropped.extend(gone);
            fresh.insert(info.user_id, entry);
        }

        // Whatever remains was removed server-side.
        for (_, entry) in self.participants.drain() {
            dropped.extend(entry.tracks.values().map(|t| t.consumer_id));
        }
        self.participants = fresh;

        self.publish();
        dropped
    }

    /// Apply one signaling event. Returns consumer ids the caller must
    /// close (cascades from departures and producer closures).
    ///
    /// Session-level events (admission, kick, room close) are no-ops
    /// here; the session state machine routes them.
    pub fn apply(&mut self, event: &ServerEvent) -> Vec<ConsumerId> {
        let dropped = match event {
            ServerEvent::ParticipantJoined { participant, .. } => {
                self.apply_joined(participant);
                Vec::new()
            }

            ServerEvent::ParticipantLeft { user_id, .. } => self.apply_left(*user_id),

            ServerEvent::ParticipantUpdated { participant, .. } => {
                self.apply_updated(participant)
            }

            ServerEvent::RoleChanged { user_id, role, .. } => {
                if self.you.as_ref().is_some_and(|you| you.user_id == *user_id) {
                    if let Some(you) = &mut self.you {
                        you.role = *role;
                    }
                } else if let Some(entry) = self.participants.get_mut(user_id) {
                    entry.info.role = *role;
                }
                Vec::new()
            }

            ServerEvent::ProducerNew {
                owner,
                producer_id,
                kind,
                ..
            } => {
                self.apply_producer_new(*owner, *producer_id, *kind);
                Vec::new()
            }

            ServerEvent::ProducerClosed {
                owner, producer_id, ..
            } => self.apply_producer_closed(*owner, *producer_id),

            ServerEvent::ProducerPaused {
                owner, producer_id, ..
            } => {
                self.apply_producer_paused(*owner, *producer_id, true);
                Vec::new()
            }

            ServerEvent::ProducerResumed {
                owner, producer_id, ..
            } => {
                self.apply_producer_paused(*owner, *producer_id, false);
                Vec::new()
            }

            ServerEvent::WaitingJoined { entry, .. } => {
                if !self.waiting.iter().any(|w| w.user_id == entry.user_id) {
                    self.waiting.push(entry.clone());
                }
                Vec::new()
            }

            ServerEvent::WaitingLeft { user_id, .. } => {
                self.waiting.retain(|w| w.user_id != *user_id);
                Vec::new()
            }

            ServerEvent::Resync { snapshot, .. } => return self.resync(snapshot),

            ServerEvent::Admitted { .. }
            | ServerEvent::Rejected { .. }
            | ServerEvent::Kicked { .. }
            | ServerEvent::RoomClosed { .. } => Vec::new(),
        };

        self.publish();
        dropped
    }

    /// Attach a consumed track to its owner's entry (branch by kind).
    /// Returns false if the owner is unknown, in which case the caller
    /// closes the orphaned consumer.
    pub fn attach_track(&mut self, owner: UserId, track: RemoteTrack) -> bool {
        let Some(entry) = self.participants.get_mut(&owner) else {
            debug!(
                target: "rc.client.registry",
                owner = %owner,
                "Track for unknown participant, dropping"
            );
            return false;
        };
        entry.tracks.insert(track.kind, track);
        self.publish();
        true
    }

    /// Wipe the mirror (leaving a room). Returns every attached
    /// consumer id for cleanup.
    pub fn clear(&mut self) -> Vec<ConsumerId> {
        let dropped = self.collect_all_consumers();
        self.room = None;
        self.you = None;
        self.participants.clear();
        self.waiting.clear();
        self.publish();
        dropped
    }

    /// Current view (what the watch last published).
    #[must_use]
    pub fn view(&self) -> RegistryView {
        let mut participants: Vec<RegistryEntry> =
            self.participants.values().cloned().collect();
        participants.sort_by_key(|e| e.info.user_id.0);
        RegistryView {
            room: self.room.clone(),
            you: self.you.clone(),
            participants,
            waiting: self.waiting.clone(),
        }
    }

    fn apply_joined(&mut self, participant: &ParticipantInfo) {
        if self
            .you
            .as_ref()
            .is_some_and(|you| you.user_id == participant.user_id)
        {
            return;
        }
        // Insert-if-absent: duplicates are ignored.
        self.participants
            .entry(participant.user_id)
            .or_insert_with(|| RegistryEntry {
                info: participant.clone(),
                tracks: HashMap::new(),
            });
    }

    fn apply_left(&mut self, user_id: UserId) -> Vec<ConsumerId> {
        match self.participants.remove(&user_id) {
            Some(entry) => entry.tracks.values().map(|t| t.consumer_id).collect(),
            None => Vec::new(),
        }
    }

    fn apply_updated(&mut self, participant: &ParticipantInfo) -> Vec<ConsumerId> {
        if self
            .you
            .as_ref()
            .is_some_and(|you| you.user_id == participant.user_id)
        {
            self.you = Some(participant.clone());
            return Vec::new();
        }
        let Some(entry) = self.participants.get_mut(&participant.user_id) else {
            // Update for an unknown participant: treat as an upsert.
            self.apply_joined(participant);
            return Vec::new();
        };
        entry.info = participant.clone();
        let (kept, gone) = split_tracks(std::mem::take(&mut entry.tracks), &entry.info);
        entry.tracks = kept;
        gone
    }

    fn apply_producer_new(&mut self, owner: UserId, producer_id: common::ProducerId, kind: MediaKind) {
        let info = match self.entry_info_mut(owner) {
            Some(info) => info,
            None => return,
        };
        if info.producers.iter().any(|p| p.id == producer_id) {
            return;
        }
        info.producers.push(room_protocol::ProducerInfo {
            id: producer_id,
            kind,
            paused: false,
        });
        recompute_flags(info);
    }

    fn apply_producer_closed(
        &mut self,
        owner: UserId,
        producer_id: common::ProducerId,
    ) -> Vec<ConsumerId> {
        if let Some(info) = self.entry_info_mut(owner) {
            info.producers.retain(|p| p.id != producer_id);
            recompute_flags(info);
        }

        // Detach the local track bound to that producer, if any.
        let Some(entry) = self.participants.get_mut(&owner) else {
            return Vec::new();
        };
        let kind = entry
            .tracks
            .iter()
            .find(|(_, t)| t.producer_id == producer_id)
            .map(|(kind, _)| *kind);
        match kind {
            Some(kind) => entry
                .tracks
                .remove(&kind)
                .map(|t| vec![t.consumer_id])
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn apply_producer_paused(
        &mut self,
        owner: UserId,
        producer_id: common::ProducerId,
        paused: bool,
    ) {
        let Some(info) = self.entry_info_mut(owner) else {
            return;
        };
        if let Some(producer) = info.producers.iter_mut().find(|p| p.id == producer_id) {
            producer.paused = paused;
        }
        // The mute flag is a mirror of producer state, not independent
        // truth.
        recompute_flags(info);
    }

    fn entry_info_mut(&mut self, user_id: UserId) -> Option<&mut ParticipantInfo> {
        if self.you.as_ref().is_some_and(|you| you.user_id == user_id) {
            return self.you.as_mut();
        }
        self.participants.get_mut(&user_id).map(|e| &mut e.info)
    }

    fn collect_all_consumers(&self) -> Vec<ConsumerId> {
        self.participants
            .values()
            .flat_map(|e| e.tracks.values().map(|t| t.consumer_id))
            .collect()
    }

    fn publish(&self) {
        let _ = self.watch_tx.send(self.view());
    }
}

/// Partition tracks into (still valid, orphaned) against the owner's
/// current producer list.
fn split_tracks(
    tracks: HashMap<MediaKind, RemoteTrack>,
    info: &ParticipantInfo,
) -> (HashMap<MediaKind, RemoteTrack>, Vec<ConsumerId>) {
    let mut kept = HashMap::new();
    let mut gone = Vec::new();
    for (kind, track) in tracks {
        if info.producers.iter().any(|p| p.id == track.producer_id) {
            kept.insert(kind, track);
        } else {
            gone.push(track.consumer_id);
        }
    }
    (kept, gone)
}

fn recompute_flags(info: &mut ParticipantInfo) {
    info.is_muted = !info
        .producers
        .iter()
        .any(|p| p.kind == MediaKind::Audio && !p.paused);
    info.is_video_off = !info
        .producers
        .iter()
        .any(|p| p.kind == MediaKind::Video && !p.paused);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::MediaTrack;
    use common::{ProducerId, Role, RoomId, RoomStatus};
    use room_protocol::{ProducerInfo, RoomFeatures};

    fn info(user_id: UserId) -> ParticipantInfo {
        ParticipantInfo {
            user_id,
            display_name: "someone".to_string(),
            role: Role::Participant,
            connected: true,
            is_muted: true,
            is_video_off: true,
            hand_raised: false,
            reaction: None,
            producers: Vec::new(),
        }
    }

    fn snapshot(you: ParticipantInfo, others: Vec<ParticipantInfo>) -> RoomSnapshot {
        RoomSnapshot {
            room: RoomInfo {
                id: RoomId::new(),
                code: "CODE123456".to_string(),
                title: "Room".to_string(),
                status: RoomStatus::Live,
                owner: you.user_id,
                max_participants: 10,
                features: RoomFeatures::default(),
            },
            you,
            participants: others,
            waiting: Vec::new(),
        }
    }

    fn track_for(producer_id: ProducerId, kind: MediaKind) -> RemoteTrack {
        RemoteTrack {
            consumer_id: ConsumerId::new(),
            producer_id,
            kind,
            track: MediaTrack::remote(kind),
        }
    }

    #[test]
    fn test_participant_joined_is_idempotent() {
        let (mut registry, _rx) = Registry::new();
        let me = info(UserId::new());
        let other = info(UserId::new());
        registry.seed(&snapshot(me, vec![]));

        let event = ServerEvent::ParticipantJoined {
            room_id: RoomId::new(),
            participant: other.clone(),
        };
        registry.apply(&event);
        registry.apply(&event);

        assert_eq!(registry.view().participants.len(), 1);
    }

    #[test]
    fn test_participant_left_cascades_tracks() {
        let (mut registry, _rx) = Registry::new();
        let me = info(UserId::new());
        let mut other = info(UserId::new());
        let producer_id = ProducerId::new();
        other.producers.push(ProducerInfo {
            id: producer_id,
            kind: MediaKind::Audio,
            paused: false,
        });
        registry.seed(&snapshot(me, vec![other.clone()]));

        let track = track_for(producer_id, MediaKind::Audio);
        let consumer_id = track.consumer_id;
        assert!(registry.attach_track(other.user_id, track));

        let dropped = registry.apply(&ServerEvent::ParticipantLeft {
            room_id: RoomId::new(),
            user_id: other.user_id,
            reason: common::LeaveReason::ConnectionTimeout,
        });

        assert_eq!(dropped, vec![consumer_id]);
        assert!(registry.view().participants.is_empty());
    }

    #[test]
    fn test_producer_pause_mirrors_mute_flag() {
        let (mut registry, _rx) = Registry::new();
        let me = info(UserId::new());
        let mut other = info(UserId::new());
        let producer_id = ProducerId::new();
        other.producers.push(ProducerInfo {
            id: producer_id,
            kind: MediaKind::Audio,
            paused: false,
        });
        other.is_muted = false;
        registry.seed(&snapshot(me, vec![other.clone()]));

        registry.apply(&ServerEvent::ProducerPaused {
            room_id: RoomId::new(),
            owner: other.user_id,
            producer_id,
            kind: MediaKind::Audio,
        });

        let view = registry.view();
        assert!(view.participants.first().unwrap().info.is_muted);

        registry.apply(&ServerEvent::ProducerResumed {
            room_id: RoomId::new(),
            owner: other.user_id,
            producer_id,
            kind: MediaKind::Audio,
        });
        assert!(!registry.view().participants.first().unwrap().info.is_muted);
    }

    #[test]
    fn test_producer_closed_cascades_consumer() {
        let (mut registry, _rx) = Registry::new();
        let me = info(UserId::new());
        let mut other = info(UserId::new());
        let producer_id = ProducerId::new();
        other.producers.push(ProducerInfo {
            id: producer_id,
            kind: MediaKind::Video,
            paused: false,
        });
        registry.seed(&snapshot(me, vec![other.clone()]));

        let track = track_for(producer_id, MediaKind::Video);
        let consumer_id = track.consumer_id;
        registry.attach_track(other.user_id, track);

        let dropped = registry.apply(&ServerEvent::ProducerClosed {
            room_id: RoomId::new(),
            owner: other.user_id,
            producer_id,
            kind: MediaKind::Video,
        });

        assert_eq!(dropped, vec![consumer_id]);
        let view = registry.view();
        let entry = view.participants.first().unwrap();
        assert!(entry.tracks.is_empty());
        assert!(entry.info.producers.is_empty());
    }

    #[test]
    fn test_resync_preserves_surviving_tracks() {
        let (mut registry, _rx) = Registry::new();
        let me = info(UserId::new());
        let mut keeps = info(UserId::new());
        let keep_producer = ProducerId::new();
        keeps.producers.push(ProducerInfo {
            id: keep_producer,
            kind: MediaKind::Audio,
            paused: false,
        });
        let goes = info(UserId::new());

        registry.seed(&snapshot(me.clone(), vec![keeps.clone(), goes.clone()]));
        let keep_track = track_for(keep_producer, MediaKind::Audio);
        let kept_consumer = keep_track.consumer_id;
        registry.attach_track(keeps.user_id, keep_track);

        // Resync without `goes`.
        let dropped = registry.apply(&ServerEvent::Resync {
            room_id: RoomId::new(),
            snapshot: snapshot(me, vec![keeps.clone()]),
        });

        assert!(dropped.is_empty());
        let view = registry.view();
        assert_eq!(view.participants.len(), 1);
        let entry = view.participants.first().unwrap();
        assert_eq!(
            entry.tracks.get(&MediaKind::Audio).unwrap().consumer_id,
            kept_consumer
        );
    }

    /// Replaying the same events in order yields the same final state.
    #[test]
    fn test_replay_determinism() {
        let me = info(UserId::new());
        let a = info(UserId::new());
        let b = info(UserId::new());
        let producer_id = ProducerId::new();
        let room_id = RoomId::new();

        let events = vec![
            ServerEvent::ParticipantJoined {
                room_id,
                participant: a.clone(),
            },
            ServerEvent::ParticipantJoined {
                room_id,
                participant: b.clone(),
            },
            ServerEvent::ProducerNew {
                room_id,
                owner: a.user_id,
                producer_id,
                kind: MediaKind::Audio,
            },
            ServerEvent::ProducerPaused {
                room_id,
                owner: a.user_id,
                producer_id,
                kind: MediaKind::Audio,
            },
            ServerEvent::ParticipantLeft {
                room_id,
                user_id: b.user_id,
                reason: common::LeaveReason::Voluntary,
            },
        ];

        let run = || {
            let (mut registry, _rx) = Registry::new();
            registry.seed(&snapshot(me.clone(), vec![]));
            for event in &events {
                registry.apply(event);
            }
            registry.view()
        };

        let first = run();
        let second = run();

        assert_eq!(first.participants.len(), second.participants.len());
        let p1 = first.participants.first().unwrap();
        let p2 = second.participants.first().unwrap();
        assert_eq!(p1.info.user_id, p2.info.user_id);
        assert_eq!(p1.info.is_muted, p2.info.is_muted);
        assert!(p1.info.is_muted);
    }

    #[test]
    fn test_clear_returns_all_consumers() {
        let (mut registry, _rx) = Registry::new();
        let me = info(UserId::new());
        let mut other = info(UserId::new());
        let producer_id = ProducerId::new();
        other.producers.push(ProducerInfo {
            id: producer_id,
            kind: MediaKind::Screen,
            paused: false,
        });
        registry.seed(&snapshot(me, vec![other.clone()]));
        let track = track_for(producer_id, MediaKind::Screen);
        let consumer_id = track.consumer_id;
        registry.attach_track(other.user_id, track);

        let dropped = registry.clear();
        assert_eq!(dropped, vec![consumer_id]);
        assert!(registry.view().room.is_none());
    }
}
