//! Agent and room registries.
//!
//! Both are owner-locked maps: mutation happens through the published
//! operations, readers always get copies. The agent registry is replaced
//! wholesale by each `agents` frame; the room registry tracks joined rooms
//! and the last server-reported listing.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::frame::AgentInfo;

/// Known agents on the network, keyed by address.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    inner: Arc<Mutex<HashMap<String, AgentInfo>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registry contents with a fresh listing.
    pub fn replace(&self, agents: Vec<AgentInfo>) {
        let mut map = self.lock();
        map.clear();
        for agent in agents {
            map.insert(agent.address.clone(), agent);
        }
    }

    /// Copy of one agent's record.
    pub fn get(&self, address: &str) -> Option<AgentInfo> {
        self.lock().get(address).cloned()
    }

    /// Copy of every known agent, sorted by address for stable output.
    pub fn snapshot(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self.lock().values().cloned().collect();
        agents.sort_by(|a, b| a.address.cmp(&b.address));
        agents
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AgentInfo>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct RoomsInner {
    joined: BTreeSet<String>,
    listing: Vec<String>,
}

/// Rooms this client participates in.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<Mutex<RoomsInner>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a confirmed subscription.
    pub fn join(&self, room: impl Into<String>) {
        self.lock().joined.insert(room.into());
    }

    /// Record a confirmed unsubscription.
    pub fn leave(&self, room: &str) {
        self.lock().joined.remove(room);
    }

    pub fn is_joined(&self, room: &str) -> bool {
        self.lock().joined.contains(room)
    }

    /// Copy of the joined-room set.
    pub fn joined(&self) -> Vec<String> {
        self.lock().joined.iter().cloned().collect()
    }

    /// Store the last server-reported room listing.
    pub fn set_listing(&self, rooms: Vec<String>) {
        self.lock().listing = rooms;
    }

    /// Copy of the last server-reported room listing.
    pub fn listing(&self) -> Vec<String> {
        self.lock().listing.clone()
    }

    /// Drop all membership state (used on intentional disconnect).
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.joined.clear();
        inner.listing.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RoomsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(address: &str) -> AgentInfo {
        AgentInfo {
            address: address.into(),
            name: None,
            capabilities: Vec::new(),
            status: None,
        }
    }

    #[test]
    fn replace_swaps_contents() {
        let registry = AgentRegistry::new();
        registry.replace(vec![agent("0xaaa"), agent("0xbbb")]);
        assert_eq!(registry.len(), 2);

        registry.replace(vec![agent("0xccc")]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("0xaaa").is_none());
        assert!(registry.get("0xccc").is_some());
    }

    #[test]
    fn snapshot_is_a_copy() {
        let registry = AgentRegistry::new();
        registry.replace(vec![agent("0xaaa")]);
        let mut snapshot = registry.snapshot();
        snapshot.clear();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn rooms_track_membership() {
        let rooms = RoomRegistry::new();
        rooms.join("lobby");
        rooms.join("research");
        rooms.leave("lobby");
        assert!(!rooms.is_joined("lobby"));
        assert!(rooms.is_joined("research"));
        assert_eq!(rooms.joined(), vec!["research".to_string()]);
    }

    #[test]
    fn clear_drops_everything() {
        let rooms = RoomRegistry::new();
        rooms.join("lobby");
        rooms.set_listing(vec!["lobby".into(), "dev".into()]);
        rooms.clear();
        assert!(rooms.joined().is_empty());
        assert!(rooms.listing().is_empty());
    }
}
