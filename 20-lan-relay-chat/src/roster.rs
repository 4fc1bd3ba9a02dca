//! The server's table of logged-in participants.

use std::{collections::HashMap, net::SocketAddr};

use tokio::sync::Mutex;

use crate::packet::SessionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub address: SocketAddr,
    pub name: String,
    pub session: SessionId,
}

/// Participants keyed by their message-channel address.
///
/// The lock is only held for the duration of a single insert, remove, lookup
/// or copy. Fan-out works on [`Roster::snapshot`], so a login or logout that
/// lands mid-broadcast never disturbs the iteration.
#[derive(Default)]
pub struct Roster {
    entries: Mutex<HashMap<SocketAddr, RosterEntry>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the entry for `address`, returning the old one.
    pub async fn insert(
        &self,
        address: SocketAddr,
        name: String,
        session: SessionId,
    ) -> Option<RosterEntry> {
        let entry = RosterEntry {
            address,
            name,
            session,
        };
        self.entries.lock().await.insert(address, entry)
    }

    pub async fn remove(&self, address: SocketAddr) -> Option<RosterEntry> {
        self.entries.lock().await.remove(&address)
    }

    pub async fn find_by_address(&self, address: SocketAddr) -> Option<RosterEntry> {
        self.entries.lock().await.get(&address).cloned()
    }

    /// Copies the current entries so callers can iterate without the lock.
    pub async fn snapshot(&self) -> Vec<RosterEntry> {
        self.entries.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn insert_then_find_returns_name() {
        let roster = Roster::new();
        roster.insert(addr(1), "alice".into(), SessionId(1)).await;

        let entry = roster.find_by_address(addr(1)).await.expect("entry");
        assert_eq!(entry.name, "alice");
        assert_eq!(entry.session, SessionId(1));
        assert!(roster.find_by_address(addr(2)).await.is_none());
    }

    #[tokio::test]
    async fn insert_replaces_by_address() {
        let roster = Roster::new();
        roster.insert(addr(1), "alice".into(), SessionId(1)).await;
        let previous = roster.insert(addr(1), "alicia".into(), SessionId(1)).await;

        assert_eq!(previous.map(|entry| entry.name), Some("alice".into()));
        assert_eq!(roster.len().await, 1);
        assert_eq!(
            roster.find_by_address(addr(1)).await.map(|entry| entry.name),
            Some("alicia".into())
        );
    }

    #[tokio::test]
    async fn remove_is_a_noop_when_absent() {
        let roster = Roster::new();
        assert!(roster.remove(addr(9)).await.is_none());

        roster.insert(addr(1), "alice".into(), SessionId(1)).await;
        assert!(roster.remove(addr(1)).await.is_some());
        assert!(roster.is_empty().await);
    }

    #[tokio::test]
    async fn snapshot_is_stable_under_mutation() {
        let roster = Roster::new();
        roster.insert(addr(1), "alice".into(), SessionId(1)).await;
        roster.insert(addr(2), "bob".into(), SessionId(2)).await;

        let snapshot = roster.snapshot().await;
        roster.remove(addr(1)).await;
        roster.insert(addr(3), "carol".into(), SessionId(3)).await;

        let mut names: Vec<_> = snapshot.into_iter().map(|entry| entry.name).collect();
        names.sort();
        assert_eq!(names, vec!["alice".to_string(), "bob".to_string()]);
    }
}
