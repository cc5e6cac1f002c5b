//! Presence service (component G) and peer-lifecycle helpers layered on
//! the peer registry (component F).
//!
//! Frame construction and inbound handling are kept as free functions
//! operating on [`crate::peer::PeerRegistry`]/[`crate::token::TokenAuthority`]
//! references rather than owning them, so [`crate::node`] can run the
//! `tokio::select!` timer wheel (spec §4.6's PROFILE/PING schedule and
//! startup burst) the same way `event_loop`'s `poll`/`relay_poll` intervals
//! work in `crates/sven-p2p/src/node.rs`.

use std::time::Instant;

use crate::codec::{Frame, FrameType};
use crate::peer::{PeerRegistry, PeerStatus, Upsert};
use crate::token::{Scope, TokenAuthority};
use crate::ui::UiEvent;

/// Local identity this node announces to the LAN.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub status: String,
}

pub fn build_profile_frame(identity: &Identity, tokens: &TokenAuthority, token_ttl_secs: i64) -> Frame {
    let token = tokens.mint(identity.user_id.clone(), Scope::Broadcast, token_ttl_secs);
    Frame::new(FrameType::Profile)
        .with_field("USER_ID", identity.user_id.clone())
        .with_field("DISPLAY_NAME", identity.display_name.clone())
        .with_field("STATUS", identity.status.clone())
        .with_field("TOKEN", token.encode())
}

pub fn build_ping_frame(identity: &Identity, tokens: &TokenAuthority, token_ttl_secs: i64) -> Frame {
    let token = tokens.mint(identity.user_id.clone(), Scope::Presence, token_ttl_secs);
    Frame::new(FrameType::Ping)
        .with_field("USER_ID", identity.user_id.clone())
        .with_field("TOKEN", token.encode())
}

pub fn build_pong_frame(identity: &Identity, to: &str, tokens: &TokenAuthority, token_ttl_secs: i64) -> Frame {
    let token = tokens.mint(identity.user_id.clone(), Scope::Presence, token_ttl_secs);
    Frame::new(FrameType::Pong)
        .with_field("USER_ID", identity.user_id.clone())
        .with_field("TO", to)
        .with_field("TOKEN", token.encode())
}

pub fn build_revoke_frame(identity: &Identity) -> Frame {
    Frame::new(FrameType::Revoke).with_field("USER_ID", identity.user_id.clone())
}

/// A PROFILE arrived: upsert the registry, emit `peer_added`/`peer_updated`
/// as appropriate. Returns `None` for an unchanged re-announcement.
pub fn handle_profile(frame: &Frame, registry: &PeerRegistry, now: Instant) -> Option<UiEvent> {
    let user_id = frame.get("USER_ID")?;
    let display_name = frame.get("DISPLAY_NAME").unwrap_or(user_id);
    let status = frame.get("STATUS").unwrap_or("online");
    match registry.touch(user_id, Some((display_name, status)), now) {
        Upsert::Added => Some(UiEvent::PeerAdded {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
        }),
        Upsert::Updated => Some(UiEvent::PeerUpdated {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            status: PeerStatus::parse(status),
        }),
        Upsert::Unchanged => None,
    }
}

/// A PING arrived: touch the registry (spec §4.6: any authentic frame
/// updates last_seen) and return the identity of who to PONG back to.
pub fn handle_ping<'a>(frame: &'a Frame, registry: &PeerRegistry, now: Instant) -> Option<&'a str> {
    let user_id = frame.get("USER_ID")?;
    registry.touch(user_id, None, now);
    Some(user_id)
}

/// A PONG arrived: just a liveness touch, no UI event needed.
pub fn handle_pong(frame: &Frame, registry: &PeerRegistry, now: Instant) {
    if let Some(user_id) = frame.get("USER_ID") {
        registry.touch(user_id, None, now);
    }
}

/// A REVOKE arrived: mark the peer inactive immediately and revoke its
/// token capability (spec §4.6, §8 scenario S6).
pub fn handle_revoke(frame: &Frame, registry: &PeerRegistry, tokens: &mut TokenAuthority) -> Option<UiEvent> {
    let user_id = frame.get("USER_ID")?;
    registry.mark_inactive(user_id);
    tokens.revoke(user_id);
    Some(UiEvent::PeerUpdated {
        user_id: user_id.to_string(),
        display_name: user_id.to_string(),
        status: PeerStatus::Custom("revoked".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity() -> Identity {
        Identity {
            user_id: "alice@192.168.1.10".to_string(),
            display_name: "Alice".to_string(),
            status: "online".to_string(),
        }
    }

    #[test]
    fn profile_frame_carries_required_headers() {
        let tokens = TokenAuthority::new();
        let frame = build_profile_frame(&identity(), &tokens, 3600);
        assert_eq!(frame.get("USER_ID"), Some("alice@192.168.1.10"));
        assert_eq!(frame.get("DISPLAY_NAME"), Some("Alice"));
        assert!(frame.get("TOKEN").is_some());
    }

    #[test]
    fn inbound_profile_adds_new_peer() {
        let registry = PeerRegistry::new();
        let frame = Frame::new(FrameType::Profile)
            .with_field("USER_ID", "bob@192.168.1.11")
            .with_field("DISPLAY_NAME", "Bob")
            .with_field("STATUS", "online");
        let event = handle_profile(&frame, &registry, Instant::now());
        assert!(matches!(event, Some(UiEvent::PeerAdded { .. })));
    }

    #[test]
    fn inbound_ping_touches_registry_and_names_replier() {
        let registry = PeerRegistry::new();
        let frame = Frame::new(FrameType::Ping).with_field("USER_ID", "bob@192.168.1.11");
        let reply_to = handle_ping(&frame, &registry, Instant::now());
        assert_eq!(reply_to, Some("bob@192.168.1.11"));
        assert!(registry.contains("bob@192.168.1.11"));
    }

    #[test]
    fn revoke_marks_inactive_and_adds_to_revocation_set() {
        let registry = PeerRegistry::new();
        let mut tokens = TokenAuthority::new();
        registry.touch("bob@192.168.1.11", Some(("Bob", "online")), Instant::now());
        let frame = Frame::new(FrameType::Revoke).with_field("USER_ID", "bob@192.168.1.11");
        handle_revoke(&frame, &registry, &mut tokens);
        assert!(!registry.get("bob@192.168.1.11").unwrap().active);
        assert!(tokens.is_revoked("bob@192.168.1.11"));
    }

    #[test]
    fn stale_then_evict_thresholds_are_independent() {
        let registry = PeerRegistry::new();
        let t0 = Instant::now();
        registry.touch("bob@192.168.1.11", None, t0);
        let stale_only = t0 + Duration::from_secs(120);
        assert_eq!(registry.sweep_stale(Duration::from_secs(60), stale_only), vec!["bob@192.168.1.11".to_string()]);
        assert!(registry.contains("bob@192.168.1.11")); // not yet evicted
        let past_evict = t0 + Duration::from_secs(400);
        assert_eq!(registry.evict_idle(Duration::from_secs(300), past_evict), vec!["bob@192.168.1.11".to_string()]);
        assert!(!registry.contains("bob@192.168.1.11"));
    }
}
