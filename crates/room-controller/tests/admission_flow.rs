//! Waiting-room admission flows, end to end: real client sessions
//! against a real controller over in-memory pipes.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use common::MediaKind;
use room_client::session::SessionState;
use room_client::MediaTrack;
use room_protocol::{RoomFeatures, RoomRef};
use room_test_utils::{eventually, TestHarness};
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(5);

/// Scenario: host X creates room R; participant Y joins and lands in
/// the waiting room; X admits Y; Y's session goes
/// `WaitingForAdmission → Joining → Active` and Y's registry contains
/// X and X's existing producers.
#[tokio::test]
async fn admit_flow_reaches_active_with_host_media() {
    let harness = TestHarness::new();

    let host = harness
        .spawn_session_with(
            "Ada",
            None,
            vec![MediaTrack::new(MediaKind::Audio, "mic")],
        )
        .await;
    let room = host
        .handle
        .create_room("Standup", 10, RoomFeatures::default())
        .await
        .unwrap();
    host.handle.join(RoomRef::Id(room.id)).await.unwrap();
    let mut host_handle = host.handle.clone();
    host_handle
        .wait_for_state(|s| *s == SessionState::Active)
        .await
        .unwrap();

    // Y requests to join by the shareable code and is queued.
    let guest = harness.spawn_session("Yuki").await;
    guest
        .handle
        .join(RoomRef::Code(room.code.clone()))
        .await
        .unwrap();
    assert_eq!(guest.handle.state(), SessionState::WaitingForAdmission);

    // The host's moderator view shows the queue entry.
    eventually(DEADLINE, "host never saw the waiting entry", || {
        let view = host.handle.registry();
        async move {
            view.waiting
                .iter()
                .any(|w| w.user_id == guest.user_id)
                .then_some(())
        }
    })
    .await;

    host.handle.admit(guest.user_id).await.unwrap();

    let mut guest_handle = guest.handle.clone();
    guest_handle
        .wait_for_state(|s| *s == SessionState::Active)
        .await
        .unwrap();

    // Y sees X, and X's audio producer ends up attached as a track.
    eventually(DEADLINE, "guest registry missing host media", || {
        let view = guest.handle.registry();
        async move {
            let entry = view
                .participants
                .iter()
                .find(|p| p.info.user_id == host.user_id)?;
            (!entry.info.producers.is_empty() && entry.tracks.contains_key(&MediaKind::Audio))
                .then_some(())
        }
    })
    .await;

    // And X now sees Y as a participant, with an empty queue.
    eventually(DEADLINE, "host registry missing guest", || {
        let view = host.handle.registry();
        async move {
            (view.waiting.is_empty()
                && view
                    .participants
                    .iter()
                    .any(|p| p.info.user_id == guest.user_id))
            .then_some(())
        }
    })
    .await;

    harness.shutdown().await;
}

/// Scenario: Z requests to join; the host rejects with "room full";
/// Z's session fails with that reason and Z appears in no registry.
#[tokio::test]
async fn reject_is_terminal_with_reason() {
    let harness = TestHarness::new();

    let host = harness.spawn_session("Ada").await;
    let room = host
        .handle
        .create_room("Standup", 10, RoomFeatures::default())
        .await
        .unwrap();
    host.handle.join(RoomRef::Id(room.id)).await.unwrap();

    let stranger = harness.spawn_session("Zed").await;
    stranger
        .handle
        .join(RoomRef::Id(room.id))
        .await
        .unwrap();

    eventually(DEADLINE, "host never saw the waiting entry", || {
        let view = host.handle.registry();
        async move { (!view.waiting.is_empty()).then_some(()) }
    })
    .await;

    host.handle
        .reject(stranger.user_id, "room full")
        .await
        .unwrap();

    let mut stranger_handle = stranger.handle.clone();
    let state = stranger_handle
        .wait_for_state(|s| matches!(s, SessionState::Failed { .. }))
        .await
        .unwrap();
    match state {
        SessionState::Failed { reason } => assert_eq!(reason, "room full"),
        other => panic!("unexpected state {other:?}"),
    }

    // Z never became a participant anywhere.
    let view = host.handle.registry();
    assert!(view
        .participants
        .iter()
        .all(|p| p.info.user_id != stranger.user_id));
    eventually(DEADLINE, "waiting entry not removed", || {
        let view = host.handle.registry();
        async move { view.waiting.is_empty().then_some(()) }
    })
    .await;

    harness.shutdown().await;
}

/// A host's own join is never queued; a co-host role claim also
/// bypasses the queue.
#[tokio::test]
async fn moderators_bypass_the_waiting_room() {
    let harness = TestHarness::new();

    let host = harness.spawn_session("Ada").await;
    let room = host
        .handle
        .create_room("Standup", 10, RoomFeatures::default())
        .await
        .unwrap();

    host.handle.join(RoomRef::Id(room.id)).await.unwrap();
    assert_eq!(host.handle.state(), SessionState::Active);

    let cohost = harness
        .spawn_session_with("Grace", Some(common::Role::CoHost), Vec::new())
        .await;
    cohost.handle.join(RoomRef::Id(room.id)).await.unwrap();
    assert_eq!(cohost.handle.state(), SessionState::Active);

    harness.shutdown().await;
}

/// `admit_all` admits exactly the entries present at call time;
/// late arrivals keep waiting.
#[tokio::test]
async fn admit_all_takes_a_snapshot() {
    let harness = TestHarness::new();

    let host = harness.spawn_session("Ada").await;
    let room = host
        .handle
        .create_room("Standup", 10, RoomFeatures::default())
        .await
        .unwrap();
    host.handle.join(RoomRef::Id(room.id)).await.unwrap();

    let first = harness.spawn_session("One").await;
    let second = harness.spawn_session("Two").await;
    first.handle.join(RoomRef::Id(room.id)).await.unwrap();
    second.handle.join(RoomRef::Id(room.id)).await.unwrap();

    eventually(DEADLINE, "queue never reached two entries", || {
        let view = host.handle.registry();
        async move { (view.waiting.len() == 2).then_some(()) }
    })
    .await;

    host.handle.admit_all().await.unwrap();

    for session in [&first, &second] {
        let mut handle = session.handle.clone();
        handle
            .wait_for_state(|s| *s == SessionState::Active)
            .await
            .unwrap();
    }

    // A later arrival requires a subsequent call.
    let third = harness.spawn_session("Three").await;
    third.handle.join(RoomRef::Id(room.id)).await.unwrap();
    assert_eq!(third.handle.state(), SessionState::WaitingForAdmission);

    harness.shutdown().await;
}

/// Waiting with no decision surfaces a recoverable failure instead of
/// hanging the state machine.
#[tokio::test]
async fn admission_timeout_is_recoverable() {
    let harness = TestHarness::new();

    let host = harness.spawn_session("Ada").await;
    let room = host
        .handle
        .create_room("Standup", 10, RoomFeatures::default())
        .await
        .unwrap();
    host.handle.join(RoomRef::Id(room.id)).await.unwrap();

    let (token, _user_id) = harness.verifier.register("Waiter", None);
    let mut config = room_client::session::SessionConfig::new(token, "Waiter");
    config.admission_timeout = Duration::from_millis(100);
    let guest = harness.spawn_session_from_config(config);

    guest.join(RoomRef::Id(room.id)).await.unwrap();

    let mut guest_handle = guest.clone();
    let state = tokio::time::timeout(
        DEADLINE,
        guest_handle.wait_for_state(|s| matches!(s, SessionState::Failed { .. })),
    )
    .await
    .expect("state machine hung on admission")
    .unwrap();
    match state {
        SessionState::Failed { reason } => assert!(reason.contains("timed out")),
        other => panic!("unexpected state {other:?}"),
    }

    harness.shutdown().await;
}
