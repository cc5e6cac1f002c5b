//! Capability-token module (component C).
//!
//! Tokens are scope tags, not cryptographic credentials — spec §9 is
//! explicit that hardening them against a hostile network is out of
//! scope. `mint`/`parse` are pure; `TokenAuthority` adds the one piece of
//! state the protocol needs: a revocation set populated by `REVOKE`
//! frames.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::error::LsnpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Broadcast,
    Chat,
    Presence,
    File,
    Game,
}

impl Scope {
    fn as_str(self) -> &'static str {
        match self {
            Scope::Broadcast => "broadcast",
            Scope::Chat => "chat",
            Scope::Presence => "presence",
            Scope::File => "file",
            Scope::Game => "game",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "broadcast" => Scope::Broadcast,
            "chat" => Scope::Chat,
            "presence" => Scope::Presence,
            "file" => Scope::File,
            "game" => Scope::Game,
            _ => return None,
        })
    }
}

/// A minted capability tag: `user_id|expires_epoch|scope`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub user_id: String,
    pub expires_at: i64,
    pub scope: Scope,
}

impl Token {
    pub fn mint(user_id: impl Into<String>, scope: Scope, ttl_secs: i64, now: DateTime<Utc>) -> Self {
        Token {
            user_id: user_id.into(),
            expires_at: now.timestamp() + ttl_secs,
            scope,
        }
    }

    pub fn encode(&self) -> String {
        format!("{}|{}|{}", self.user_id, self.expires_at, self.scope.as_str())
    }

    pub fn parse(s: &str) -> Result<Token, LsnpError> {
        let mut parts = s.splitn(3, '|');
        let user_id = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LsnpError::Token("empty user_id".into()))?;
        let expires_at = parts
            .next()
            .ok_or_else(|| LsnpError::Token("missing expiry".into()))?
            .parse::<i64>()
            .map_err(|_| LsnpError::Token("expiry not a number".into()))?;
        let scope = parts
            .next()
            .ok_or_else(|| LsnpError::Token("missing scope".into()))?;
        let scope = Scope::from_str(scope).ok_or_else(|| LsnpError::Token(format!("unknown scope {scope}")))?;
        Ok(Token {
            user_id: user_id.to_string(),
            expires_at,
            scope,
        })
    }
}

/// Outcome of a scope check, per spec §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Ok,
    Expired,
    ScopeMismatch,
    Malformed,
    Revoked,
}

/// Stateless mint/parse plus the one piece of mutable state the token
/// model needs: who has been revoked.
#[derive(Debug, Default)]
pub struct TokenAuthority {
    revoked: HashSet<String>,
}

impl TokenAuthority {
    pub fn new() -> Self {
        TokenAuthority::default()
    }

    pub fn mint(&self, user_id: impl Into<String>, scope: Scope, ttl_secs: i64) -> Token {
        Token::mint(user_id, scope, ttl_secs, Utc::now())
    }

    /// Parse and validate `raw` against `required_scope` at time `now`.
    pub fn check(&self, raw: &str, required_scope: Scope, now: DateTime<Utc>) -> CheckResult {
        let token = match Token::parse(raw) {
            Ok(t) => t,
            Err(_) => return CheckResult::Malformed,
        };
        if self.revoked.contains(&token.user_id) {
            return CheckResult::Revoked;
        }
        if token.expires_at < now.timestamp() {
            return CheckResult::Expired;
        }
        if token.scope != required_scope {
            return CheckResult::ScopeMismatch;
        }
        CheckResult::Ok
    }

    /// Mark `user_id` as revoked — any future token it presents, however
    /// fresh, will check as `Revoked` until this authority is rebuilt.
    pub fn revoke(&mut self, user_id: impl Into<String>) {
        self.revoked.insert(user_id.into());
    }

    pub fn is_revoked(&self, user_id: &str) -> bool {
        self.revoked.contains(user_id)
    }
}
