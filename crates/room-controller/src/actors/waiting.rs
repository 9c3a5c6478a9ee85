//! Waiting-room admission queue.
//!
//! A FIFO queue owned by the room actor. Each entry is one (room, user)
//! admission attempt: `Requested` on push, and terminal once admitted,
//! rejected, or withdrawn by leave/disconnect. Hosts and co-hosts never
//! enter the queue (auto-admit happens in the room actor).

use super::connection::ConnectionActorHandle;
use common::UserId;
use room_protocol::WaitingInfo;

/// One queued admission attempt.
#[derive(Debug, Clone)]
pub struct WaitingEntry {
    pub info: WaitingInfo,
    /// Connection to notify on admit/reject/room-close.
    pub connection: ConnectionActorHandle,
}

/// FIFO admission queue for one room.
#[derive(Debug, Default)]
pub struct WaitingRoom {
    entries: Vec<WaitingEntry>,
}

impl WaitingRoom {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a new attempt. Returns `false` if the user already has a
    /// queued attempt (the existing position is kept).
    pub fn push(&mut self, entry: WaitingEntry) -> bool {
        if self.contains(entry.info.user_id) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Remove the attempt for `user_id`, preserving the order of the
    /// remaining entries.
    pub fn remove(&mut self, user_id: UserId) -> Option<WaitingEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.info.user_id == user_id)?;
        Some(self.entries.remove(index))
    }

    /// Take a snapshot of the current queue and clear it, in arrival
    /// order. Entries queued after this call require a subsequent call.
    pub fn drain_snapshot(&mut self) -> Vec<WaitingEntry> {
        std::mem::take(&mut self.entries)
    }

    #[must_use]
    pub fn contains(&self, user_id: UserId) -> bool {
        self.entries.iter().any(|e| e.info.user_id == user_id)
    }

    /// Queue contents for moderator views, in arrival order.
    #[must_use]
    pub fn infos(&self) -> Vec<WaitingInfo> {
        self.entries.iter().map(|e| e.info.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::metrics::ActorMetrics;
    use crate::actors::spawn_connection;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    fn entry(user_id: UserId) -> WaitingEntry {
        let (_server_end, client_end) = tokio::io::duplex(1024);
        let (connection, _task) = spawn_connection(
            format!("conn-{user_id}"),
            client_end,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        WaitingEntry {
            info: WaitingInfo {
                user_id,
                display_name: "someone".to_string(),
                joined_at: Utc::now(),
            },
            connection,
        }
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let mut queue = WaitingRoom::new();
        let users: Vec<UserId> = (0..3).map(|_| UserId::new()).collect();
        for user in &users {
            assert!(queue.push(entry(*user)));
        }

        let drained: Vec<UserId> = queue
            .drain_snapshot()
            .into_iter()
            .map(|e| e.info.user_id)
            .collect();
        assert_eq!(drained, users);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_push_ignored() {
        let mut queue = WaitingRoom::new();
        let user = UserId::new();

        assert!(queue.push(entry(user)));
        assert!(!queue.push(entry(user)));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_keeps_order_of_rest() {
        let mut queue = WaitingRoom::new();
        let first = UserId::new();
        let second = UserId::new();
        let third = UserId::new();
        queue.push(entry(first));
        queue.push(entry(second));
        queue.push(entry(third));

        assert!(queue.remove(second).is_some());
        assert!(queue.remove(second).is_none());

        let order: Vec<UserId> = queue.infos().iter().map(|i| i.user_id).collect();
        assert_eq!(order, vec![first, third]);
    }

    #[tokio::test]
    async fn test_snapshot_excludes_later_arrivals() {
        let mut queue = WaitingRoom::new();
        queue.push(entry(UserId::new()));

        let snapshot = queue.drain_snapshot();
        assert_eq!(snapshot.len(), 1);

        // Arrivals after the snapshot wait for the next call.
        queue.push(entry(UserId::new()));
        assert_eq!(queue.len(), 1);
    }
}
