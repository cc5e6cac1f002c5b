//! Router/dispatcher (component E).
//!
//! The inbound pump (owned by [`crate::node`]) hands every received
//! datagram to [`route`], which performs codec decode, dedupe, and token
//! checks and returns a verdict — never the handler logic itself, so the
//! pump never blocks (spec §4.5: "Handlers must not block the pump").
//! Mirrors the decode-then-classify shape of `on_swarm_event` in
//! `crates/sven-p2p/src/node.rs`, minus the libp2p-specific event types.

use std::net::SocketAddr;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::codec::{Frame, FrameType};
use crate::dedupe::DedupeCache;
use crate::token::{CheckResult, TokenAuthority};

/// Why an inbound datagram was not forwarded to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    MalformedFrame(String),
    Duplicate,
    Unauthorized(CheckResult),
    UnknownType(String),
}

#[derive(Debug)]
pub enum RouteOutcome {
    Accepted(Frame),
    Dropped(DropReason),
}

/// PING/PONG carry no `MESSAGE_ID` and are idempotent by content (spec §3:
/// "everything except pure PING/PONG"), so they skip the dedupe check
/// entirely rather than needing a fingerprint manufactured for them.
fn needs_dedupe(frame_type: FrameType) -> bool {
    !matches!(frame_type, FrameType::Ping | FrameType::Pong)
}

/// Decode, dedupe, and authorize one inbound datagram.
///
/// `ACK` and `REVOKE` carry no token (spec §6.2) and are exempt from the
/// scope check; every other type whose `FrameType::required_scope` returns
/// `Some` must present a `TOKEN` header that checks out for that scope.
pub fn route(data: &[u8], source_addr: SocketAddr, dedupe: &DedupeCache, tokens: &TokenAuthority) -> RouteOutcome {
    let mut frame = match Frame::decode(data) {
        Ok(f) => f,
        Err(e) => return RouteOutcome::Dropped(DropReason::MalformedFrame(e.to_string())),
    };
    frame.source_addr = Some(source_addr);

    if needs_dedupe(frame.frame_type) {
        let sender = frame
            .get("FROM")
            .or_else(|| frame.get("USER_ID"))
            .unwrap_or("")
            .to_string();
        let message_id = frame.get("MESSAGE_ID").unwrap_or("").to_string();
        if !message_id.is_empty() && !dedupe.observe((sender, message_id)) {
            return RouteOutcome::Dropped(DropReason::Duplicate);
        }
    }

    if let Some(required_scope) = frame.frame_type.required_scope() {
        let raw_token = match frame.get("TOKEN") {
            Some(t) => t,
            None => return RouteOutcome::Dropped(DropReason::Unauthorized(CheckResult::Malformed)),
        };
        let now: DateTime<Utc> = DateTime::<Utc>::from(SystemTime::now());
        match tokens.check(raw_token, required_scope, now) {
            CheckResult::Ok => {}
            other => return RouteOutcome::Dropped(DropReason::Unauthorized(other)),
        }
    }

    RouteOutcome::Accepted(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Scope;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn malformed_datagram_dropped() {
        let dedupe = DedupeCache::new(16, Duration::from_secs(60));
        let tokens = TokenAuthority::new();
        let outcome = route(b"not a frame", addr(), &dedupe, &tokens);
        assert!(matches!(outcome, RouteOutcome::Dropped(DropReason::MalformedFrame(_))));
    }

    #[test]
    fn duplicate_message_id_dropped_second_time() {
        let dedupe = DedupeCache::new(16, Duration::from_secs(60));
        let tokens = TokenAuthority::new();
        let token = tokens.mint("alice@1.1.1.1", Scope::Broadcast, 3600);
        let raw = format!("TYPE: POST\r\nPOST_ID: p1\r\nFROM: alice@1.1.1.1\r\nMESSAGE_ID: m1\r\nTOKEN: {}\r\n\r\n", token.encode());
        let first = route(raw.as_bytes(), addr(), &dedupe, &tokens);
        assert!(matches!(first, RouteOutcome::Accepted(_)));
        let second = route(raw.as_bytes(), addr(), &dedupe, &tokens);
        assert!(matches!(second, RouteOutcome::Dropped(DropReason::Duplicate)));
    }

    #[test]
    fn missing_token_is_unauthorized() {
        let dedupe = DedupeCache::new(16, Duration::from_secs(60));
        let tokens = TokenAuthority::new();
        let raw = b"TYPE: POST\r\nPOST_ID: p1\r\nFROM: alice@1.1.1.1\r\nMESSAGE_ID: m1\r\n\r\n";
        let outcome = route(raw, addr(), &dedupe, &tokens);
        assert!(matches!(outcome, RouteOutcome::Dropped(DropReason::Unauthorized(_))));
    }

    #[test]
    fn scope_mismatch_is_unauthorized() {
        let dedupe = DedupeCache::new(16, Duration::from_secs(60));
        let tokens = TokenAuthority::new();
        let token = tokens.mint("alice@1.1.1.1", Scope::Chat, 3600);
        let raw = format!("TYPE: POST\r\nPOST_ID: p1\r\nFROM: alice@1.1.1.1\r\nMESSAGE_ID: m1\r\nTOKEN: {}\r\n\r\n", token.encode());
        let outcome = route(raw.as_bytes(), addr(), &dedupe, &tokens);
        assert!(matches!(
            outcome,
            RouteOutcome::Dropped(DropReason::Unauthorized(CheckResult::ScopeMismatch))
        ));
    }

    #[test]
    fn ack_frame_needs_no_token() {
        let dedupe = DedupeCache::new(16, Duration::from_secs(60));
        let tokens = TokenAuthority::new();
        let raw = b"TYPE: ACK\r\nMESSAGE_ID: m1\r\n\r\n";
        let outcome = route(raw, addr(), &dedupe, &tokens);
        assert!(matches!(outcome, RouteOutcome::Accepted(_)));
    }

    #[test]
    fn ping_skips_dedupe_even_without_message_id() {
        let dedupe = DedupeCache::new(16, Duration::from_secs(60));
        let tokens = TokenAuthority::new();
        let token = tokens.mint("alice@1.1.1.1", Scope::Presence, 3600);
        let raw = format!("TYPE: PING\r\nUSER_ID: alice@1.1.1.1\r\nTOKEN: {}\r\n\r\n", token.encode());
        let first = route(raw.as_bytes(), addr(), &dedupe, &tokens);
        let second = route(raw.as_bytes(), addr(), &dedupe, &tokens);
        assert!(matches!(first, RouteOutcome::Accepted(_)));
        assert!(matches!(second, RouteOutcome::Accepted(_)));
    }
}
