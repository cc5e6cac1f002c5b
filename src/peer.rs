//! Peer registry (component F).
//!
//! A single mutex-guarded table, in the same shape as the teacher's
//! `P2pNode` roster (`Arc<Mutex<HashMap<PeerId, AgentCard>>>`): mutations
//! are serialized through the mutex and observers always see a consistent
//! snapshot.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub type UserId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerStatus {
    Online,
    Away,
    Busy,
    Custom(String),
}

impl PeerStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "online" => PeerStatus::Online,
            "away" => PeerStatus::Away,
            "busy" => PeerStatus::Busy,
            other => PeerStatus::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PeerStatus::Online => "online",
            PeerStatus::Away => "away",
            PeerStatus::Busy => "busy",
            PeerStatus::Custom(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub user_id: UserId,
    pub display_name: String,
    pub status: PeerStatus,
    pub last_seen: Instant,
    /// Active iff seen within `stale_threshold` of the registry that owns it.
    pub active: bool,
    pub avatar: Option<Vec<u8>>,
}

/// Table of known peers, keyed by `UserId`. An IP change is a new peer
/// (invariant i) because the key is the full `name@ip` string.
#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<HashMap<UserId, Peer>>,
}

/// What happened to the registry as a result of observing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Added,
    Updated,
    Unchanged,
}

impl PeerRegistry {
    pub fn new() -> Self {
        PeerRegistry::default()
    }

    /// Record that an authentic frame arrived from `user_id` (spec §4.6:
    /// "last_seen is updated by any authentic frame ... not only PONG").
    /// Profile fields are only touched when `profile` is `Some`.
    pub fn touch(
        &self,
        user_id: &str,
        profile: Option<(&str, &str)>,
        now: Instant,
    ) -> Upsert {
        let mut guard = self.inner.lock().unwrap();
        match guard.get_mut(user_id) {
            Some(peer) => {
                peer.last_seen = peer.last_seen.max(now);
                peer.active = true;
                if let Some((name, status)) = profile {
                    let changed = peer.display_name != name || peer.status.as_str() != status;
                    peer.display_name = name.to_string();
                    peer.status = PeerStatus::parse(status);
                    if changed {
                        return Upsert::Updated;
                    }
                }
                Upsert::Unchanged
            }
            None => {
                let (display_name, status) = profile
                    .map(|(n, s)| (n.to_string(), PeerStatus::parse(s)))
                    .unwrap_or_else(|| (user_id.to_string(), PeerStatus::Online));
                guard.insert(
                    user_id.to_string(),
                    Peer {
                        user_id: user_id.to_string(),
                        display_name,
                        status,
                        last_seen: now,
                        active: true,
                        avatar: None,
                    },
                );
                Upsert::Added
            }
        }
    }

    pub fn get(&self, user_id: &str) -> Option<Peer> {
        self.inner.lock().unwrap().get(user_id).cloned()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(user_id)
    }

    pub fn all(&self) -> Vec<Peer> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    /// Mark peers stale given `stale_threshold`; returns the UserIds whose
    /// `active` flag flipped from true to false (for `peer_updated` events).
    pub fn sweep_stale(&self, stale_threshold: Duration, now: Instant) -> Vec<UserId> {
        let mut guard = self.inner.lock().unwrap();
        let mut newly_inactive = Vec::new();
        for peer in guard.values_mut() {
            let stale = now.duration_since(peer.last_seen) > stale_threshold;
            if stale && peer.active {
                peer.active = false;
                newly_inactive.push(peer.user_id.clone());
            }
        }
        newly_inactive
    }

    /// Evict peers idle past `evict_threshold`; returns the evicted UserIds.
    pub fn evict_idle(&self, evict_threshold: Duration, now: Instant) -> Vec<UserId> {
        let mut guard = self.inner.lock().unwrap();
        let to_evict: Vec<UserId> = guard
            .values()
            .filter(|p| now.duration_since(p.last_seen) > evict_threshold)
            .map(|p| p.user_id.clone())
            .collect();
        for id in &to_evict {
            guard.remove(id);
        }
        to_evict
    }

    /// Mark a peer inactive immediately (REVOKE handling) without removing
    /// it — the registry keeps the record for UI display purposes.
    pub fn mark_inactive(&self, user_id: &str) {
        if let Some(peer) = self.inner.lock().unwrap().get_mut(user_id) {
            peer.active = false;
        }
    }

    pub fn remove(&self, user_id: &str) -> Option<Peer> {
        self.inner.lock().unwrap().remove(user_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse `name@A.B.C.D` into its `(name, ip)` components.
pub fn split_user_id(user_id: &str) -> Option<(&str, &str)> {
    user_id.split_once('@')
}
