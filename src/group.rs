//! Group chat (component I).
//!
//! Groups are creator-authoritative (spec §4.8): only the creator may add
//! or remove members, and every other member mirrors updates it receives.
//! Modeled on the same `Mutex<HashMap<Id, T>>` registry shape as
//! [`crate::peer::PeerRegistry`].

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct GroupMessage {
    pub message_id: String,
    pub from: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub group_id: String,
    pub creator: String,
    pub name: String,
    pub members: HashSet<String>,
    pub messages: Vec<GroupMessage>,
    /// Timestamp of the last membership mutation accepted into this group,
    /// used to resolve last-writer-wins against a remote update.
    pub updated_at: DateTime<Utc>,
}

/// What a membership mirror attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorResult {
    Applied,
    StaleIgnored,
    NotCreator,
}

#[derive(Default)]
pub struct GroupRegistry {
    inner: Mutex<HashMap<String, Group>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        GroupRegistry::default()
    }

    /// Create a group locally; `group_id` embeds the creator so any peer
    /// can verify authority over membership updates without a side
    /// channel (DESIGN.md open question: group membership authority).
    pub fn create(&self, creator: &str, name: &str, initial_members: HashSet<String>, uuid: &str) -> Group {
        let group = Group {
            group_id: format!("{creator}:{uuid}"),
            creator: creator.to_string(),
            name: name.to_string(),
            members: initial_members,
            messages: Vec::new(),
            updated_at: Utc::now(),
        };
        self.inner.lock().unwrap().insert(group.group_id.clone(), group.clone());
        group
    }

    /// Install a group announced by its creator (we are an invited member).
    pub fn observe_created(&self, group: Group) {
        self.inner.lock().unwrap().entry(group.group_id.clone()).or_insert(group);
    }

    pub fn get(&self, group_id: &str) -> Option<Group> {
        self.inner.lock().unwrap().get(group_id).cloned()
    }

    pub fn all(&self) -> Vec<Group> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    /// Apply a membership update, authenticated by checking that
    /// `claimed_creator` matches the group's recorded creator (spec §4.8:
    /// only the creator's updates are authoritative) and that it is not
    /// stale relative to what we already hold (last-writer-wins by
    /// `updated_at`).
    pub fn mirror_update(
        &self,
        group_id: &str,
        claimed_creator: &str,
        new_members: HashSet<String>,
        updated_at: DateTime<Utc>,
    ) -> MirrorResult {
        let mut guard = self.inner.lock().unwrap();
        let Some(group) = guard.get_mut(group_id) else {
            return MirrorResult::NotCreator;
        };
        if group.creator != claimed_creator {
            return MirrorResult::NotCreator;
        }
        if updated_at <= group.updated_at {
            return MirrorResult::StaleIgnored;
        }
        group.members = new_members;
        group.updated_at = updated_at;
        MirrorResult::Applied
    }

    /// Record an inbound/outbound group message (dedupe is the router's job).
    pub fn record_message(&self, group_id: &str, message_id: &str, from: &str, text: &str) -> bool {
        let mut guard = self.inner.lock().unwrap();
        match guard.get_mut(group_id) {
            Some(group) => {
                group.messages.push(GroupMessage {
                    message_id: message_id.to_string(),
                    from: from.to_string(),
                    text: text.to_string(),
                    timestamp: Utc::now(),
                });
                true
            }
            None => false,
        }
    }

    /// Unicast fan-out targets: every member except `exclude` (the sender).
    pub fn fan_out_targets(&self, group_id: &str, exclude: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .get(group_id)
            .map(|g| g.members.iter().filter(|m| m.as_str() != exclude).cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn members(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn group_id_embeds_creator() {
        let reg = GroupRegistry::new();
        let g = reg.create("alice@1.1.1.1", "study group", members(&["alice@1.1.1.1", "bob@1.1.1.1"]), "uuid-1");
        assert_eq!(g.group_id, "alice@1.1.1.1:uuid-1");
    }

    #[test]
    fn non_creator_update_rejected() {
        let reg = GroupRegistry::new();
        let g = reg.create("alice@1.1.1.1", "study group", members(&["alice@1.1.1.1"]), "uuid-1");
        let result = reg.mirror_update(&g.group_id, "mallory@9.9.9.9", members(&["mallory@9.9.9.9"]), Utc::now());
        assert_eq!(result, MirrorResult::NotCreator);
    }

    #[test]
    fn stale_update_ignored() {
        let reg = GroupRegistry::new();
        let g = reg.create("alice@1.1.1.1", "study group", members(&["alice@1.1.1.1"]), "uuid-1");
        let earlier = g.updated_at - ChronoDuration::seconds(10);
        let result = reg.mirror_update(&g.group_id, "alice@1.1.1.1", members(&["alice@1.1.1.1", "bob@1.1.1.1"]), earlier);
        assert_eq!(result, MirrorResult::StaleIgnored);
        assert_eq!(reg.get(&g.group_id).unwrap().members.len(), 1);
    }

    #[test]
    fn newer_update_applied() {
        let reg = GroupRegistry::new();
        let g = reg.create("alice@1.1.1.1", "study group", members(&["alice@1.1.1.1"]), "uuid-1");
        let later = g.updated_at + ChronoDuration::seconds(10);
        let result = reg.mirror_update(&g.group_id, "alice@1.1.1.1", members(&["alice@1.1.1.1", "bob@1.1.1.1"]), later);
        assert_eq!(result, MirrorResult::Applied);
        assert_eq!(reg.get(&g.group_id).unwrap().members.len(), 2);
    }

    #[test]
    fn fan_out_excludes_sender() {
        let reg = GroupRegistry::new();
        let g = reg.create("alice@1.1.1.1", "study group", members(&["alice@1.1.1.1", "bob@1.1.1.1", "carl@1.1.1.1"]), "uuid-1");
        let targets = reg.fan_out_targets(&g.group_id, "bob@1.1.1.1");
        assert_eq!(targets.len(), 2);
        assert!(!targets.contains(&"bob@1.1.1.1".to_string()));
    }
}
