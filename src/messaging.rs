//! Messaging service (component H): direct chat, posts, likes.
//!
//! Delivery-state bookkeeping mirrors the teacher's `pending_outbound`
//! map in `crates/sven-p2p/src/node.rs` (one entry per outstanding
//! request, resolved when the matching reply/ack arrives) but tracks a
//! tri-state (`pending`/`acked`/`failed`) instead of a single oneshot
//! value, because the UI needs to observe the pending state too.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Acked,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone)]
pub struct ConversationEntry {
    pub message_id: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub delivery_state: DeliveryState,
}

#[derive(Debug, Default)]
pub struct Conversation {
    pub entries: Vec<ConversationEntry>,
}

#[derive(Debug, Clone)]
pub struct Post {
    pub post_id: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub likes: HashSet<String>,
}

/// Holds every per-peer conversation and the global post timeline.
#[derive(Default)]
pub struct MessagingState {
    conversations: Mutex<HashMap<String, Conversation>>,
    posts: Mutex<HashMap<String, Post>>,
}

impl MessagingState {
    pub fn new() -> Self {
        MessagingState::default()
    }

    pub fn record_outbound(&self, peer: &str, message_id: &str, text: &str) {
        let mut guard = self.conversations.lock().unwrap();
        guard.entry(peer.to_string()).or_default().entries.push(ConversationEntry {
            message_id: message_id.to_string(),
            direction: Direction::Outbound,
            timestamp: Utc::now(),
            text: text.to_string(),
            delivery_state: DeliveryState::Pending,
        });
    }

    pub fn record_inbound(&self, peer: &str, message_id: &str, text: &str) {
        let mut guard = self.conversations.lock().unwrap();
        guard.entry(peer.to_string()).or_default().entries.push(ConversationEntry {
            message_id: message_id.to_string(),
            direction: Direction::Inbound,
            timestamp: Utc::now(),
            text: text.to_string(),
            delivery_state: DeliveryState::Acked, // inbound messages need no delivery tracking
        });
    }

    /// Update the delivery state of a previously-recorded outbound entry.
    /// Returns `true` if a matching entry was found.
    pub fn set_delivery_state(&self, peer: &str, message_id: &str, state: DeliveryState) -> bool {
        let mut guard = self.conversations.lock().unwrap();
        if let Some(convo) = guard.get_mut(peer) {
            if let Some(entry) = convo
                .entries
                .iter_mut()
                .find(|e| e.message_id == message_id && e.direction == Direction::Outbound)
            {
                entry.delivery_state = state;
                return true;
            }
        }
        false
    }

    pub fn conversation_entries(&self, peer: &str) -> Vec<ConversationEntry> {
        self.conversations
            .lock()
            .unwrap()
            .get(peer)
            .map(|c| c.entries.clone())
            .unwrap_or_default()
    }

    /// Post or re-affirm a post on receipt (duplicates are suppressed by
    /// the router's dedupe cache before this is called, but this is also
    /// idempotent keyed by `post_id`).
    pub fn upsert_post(&self, post_id: &str, author: &str, text: &str) {
        let mut guard = self.posts.lock().unwrap();
        guard.entry(post_id.to_string()).or_insert_with(|| Post {
            post_id: post_id.to_string(),
            author: author.to_string(),
            timestamp: Utc::now(),
            text: text.to_string(),
            likes: HashSet::new(),
        });
    }

    /// Apply a like; set semantics mean out-of-order or duplicate likes
    /// are harmless. Returns `false` if the post isn't known locally yet.
    pub fn apply_like(&self, post_id: &str, liker: &str) -> bool {
        let mut guard = self.posts.lock().unwrap();
        match guard.get_mut(post_id) {
            Some(post) => {
                post.likes.insert(liker.to_string());
                true
            }
            None => false,
        }
    }

    pub fn get_post(&self, post_id: &str) -> Option<Post> {
        self.posts.lock().unwrap().get(post_id).cloned()
    }

    pub fn all_posts(&self) -> Vec<Post> {
        self.posts.lock().unwrap().values().cloned().collect()
    }
}

impl Clone for ConversationEntry {
    fn clone(&self) -> Self {
        ConversationEntry {
            message_id: self.message_id.clone(),
            direction: self.direction,
            timestamp: self.timestamp,
            text: self.text.clone(),
            delivery_state: self.delivery_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_starts_pending_then_acks() {
        let state = MessagingState::new();
        state.record_outbound("bob@1.1.1.1", "m1", "hello");
        let entries = state.conversation_entries("bob@1.1.1.1");
        assert_eq!(entries[0].delivery_state, DeliveryState::Pending);
        assert!(state.set_delivery_state("bob@1.1.1.1", "m1", DeliveryState::Acked));
        let entries = state.conversation_entries("bob@1.1.1.1");
        assert_eq!(entries[0].delivery_state, DeliveryState::Acked);
    }

    #[test]
    fn inbound_message_recorded_once() {
        let state = MessagingState::new();
        state.record_inbound("alice@1.1.1.1", "m1", "hi");
        assert_eq!(state.conversation_entries("alice@1.1.1.1").len(), 1);
    }

    #[test]
    fn like_before_post_known_is_rejected_gracefully() {
        let state = MessagingState::new();
        assert!(!state.apply_like("p1", "bob@1.1.1.1"));
    }

    #[test]
    fn likes_are_set_semantics_idempotent() {
        let state = MessagingState::new();
        state.upsert_post("p1", "alice@1.1.1.1", "hello world");
        state.apply_like("p1", "bob@1.1.1.1");
        state.apply_like("p1", "bob@1.1.1.1"); // duplicate like, out of order is fine too
        let post = state.get_post("p1").unwrap();
        assert_eq!(post.likes.len(), 1);
    }

    #[test]
    fn duplicate_post_upsert_keeps_first_text() {
        let state = MessagingState::new();
        state.upsert_post("p1", "alice@1.1.1.1", "first");
        state.upsert_post("p1", "alice@1.1.1.1", "replay-of-first");
        assert_eq!(state.get_post("p1").unwrap().text, "first");
    }
}
