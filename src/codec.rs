//! Wire codec for the LSNP line-oriented text frame (component A).
//!
//! A datagram carries exactly one frame: header lines of the form
//! `KEY: value`, terminated by an empty line, optionally followed by a raw
//! body whose length is given by a `SIZE` header. Keys are case-sensitive;
//! values may not contain a newline. Unknown fields are preserved verbatim
//! on decode so a future protocol revision can add headers without
//! breaking older peers.

use std::net::SocketAddr;

use crate::error::LsnpError;

/// A single datagram is capped at 64 KiB minus UDP/IP overhead.
pub const MAX_DATAGRAM_BYTES: usize = 65_000;

/// Default body size for a single file chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Every frame type defined in spec §6.2, in wire-string order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Profile,
    Ping,
    Pong,
    Post,
    Like,
    Chat,
    GroupChat,
    GroupUpdate,
    FileOffer,
    FileAccept,
    FileReject,
    FileData,
    FileComplete,
    FileCancel,
    GameInvite,
    GameInviteAck,
    GameMove,
    GameResult,
    GameResign,
    GameResync,
    Ack,
    Revoke,
}

impl FrameType {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Profile => "PROFILE",
            FrameType::Ping => "PING",
            FrameType::Pong => "PONG",
            FrameType::Post => "POST",
            FrameType::Like => "LIKE",
            FrameType::Chat => "CHAT",
            FrameType::GroupChat => "GROUP_CHAT",
            FrameType::GroupUpdate => "GROUP_UPDATE",
            FrameType::FileOffer => "FILE_OFFER",
            FrameType::FileAccept => "FILE_ACCEPT",
            FrameType::FileReject => "FILE_REJECT",
            FrameType::FileData => "FILE_DATA",
            FrameType::FileComplete => "FILE_COMPLETE",
            FrameType::FileCancel => "FILE_CANCEL",
            FrameType::GameInvite => "GAME_INVITE",
            FrameType::GameInviteAck => "GAME_INVITE_ACK",
            FrameType::GameMove => "GAME_MOVE",
            FrameType::GameResult => "GAME_RESULT",
            FrameType::GameResign => "GAME_RESIGN",
            FrameType::GameResync => "GAME_RESYNC",
            FrameType::Ack => "ACK",
            FrameType::Revoke => "REVOKE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "PROFILE" => FrameType::Profile,
            "PING" => FrameType::Ping,
            "PONG" => FrameType::Pong,
            "POST" => FrameType::Post,
            "LIKE" => FrameType::Like,
            "CHAT" => FrameType::Chat,
            "GROUP_CHAT" => FrameType::GroupChat,
            "GROUP_UPDATE" => FrameType::GroupUpdate,
            "FILE_OFFER" => FrameType::FileOffer,
            "FILE_ACCEPT" => FrameType::FileAccept,
            "FILE_REJECT" => FrameType::FileReject,
            "FILE_DATA" => FrameType::FileData,
            "FILE_COMPLETE" => FrameType::FileComplete,
            "FILE_CANCEL" => FrameType::FileCancel,
            "GAME_INVITE" => FrameType::GameInvite,
            "GAME_INVITE_ACK" => FrameType::GameInviteAck,
            "GAME_MOVE" => FrameType::GameMove,
            "GAME_RESULT" => FrameType::GameResult,
            "GAME_RESIGN" => FrameType::GameResign,
            "GAME_RESYNC" => FrameType::GameResync,
            "ACK" => FrameType::Ack,
            "REVOKE" => FrameType::Revoke,
            _ => return None,
        })
    }

    /// Whether this type is sent as a broadcast (vs. unicast).
    pub fn is_broadcast(self) -> bool {
        matches!(
            self,
            FrameType::Profile
                | FrameType::Ping
                | FrameType::Post
                | FrameType::Like
                | FrameType::GroupUpdate
                | FrameType::Revoke
        )
    }

    /// Whether this type requires the transport's ACK/retry discipline.
    pub fn requires_ack(self) -> bool {
        matches!(
            self,
            FrameType::Chat
                | FrameType::GroupChat
                | FrameType::FileOffer
                | FrameType::FileAccept
                | FrameType::FileReject
                | FrameType::FileData
                | FrameType::FileComplete
                | FrameType::FileCancel
                | FrameType::GameInvite
                | FrameType::GameInviteAck
                | FrameType::GameMove
                | FrameType::GameResult
                | FrameType::GameResign
                | FrameType::GameResync
        )
    }

    /// The token scope this type is gated behind, if any (`ACK`/`REVOKE`
    /// carry no token per spec §6.2).
    pub fn required_scope(self) -> Option<crate::token::Scope> {
        use crate::token::Scope;
        match self {
            FrameType::Profile | FrameType::Post | FrameType::Like | FrameType::GroupUpdate => {
                Some(Scope::Broadcast)
            }
            FrameType::Ping | FrameType::Pong => Some(Scope::Presence),
            FrameType::Chat | FrameType::GroupChat => Some(Scope::Chat),
            FrameType::FileOffer
            | FrameType::FileAccept
            | FrameType::FileReject
            | FrameType::FileData
            | FrameType::FileComplete
            | FrameType::FileCancel => Some(Scope::File),
            FrameType::GameInvite
            | FrameType::GameInviteAck
            | FrameType::GameMove
            | FrameType::GameResult
            | FrameType::GameResign
            | FrameType::GameResync => Some(Scope::Game),
            FrameType::Ack | FrameType::Revoke => None,
        }
    }
}

/// A parsed or to-be-encoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    /// Header fields in encode order. `TYPE` itself is not stored here —
    /// it's always emitted first and parsed separately.
    pub fields: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub source_addr: Option<SocketAddr>,
}

impl Frame {
    pub fn new(frame_type: FrameType) -> Self {
        Frame {
            frame_type,
            fields: Vec::new(),
            body: None,
            source_addr: None,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.fields.push(("SIZE".to_string(), body.len().to_string()));
        self.body = Some(body);
        self
    }

    /// First value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_required<'a>(&'a self, key: &str) -> Result<&'a str, LsnpError> {
        self.get(key)
            .ok_or_else(|| LsnpError::MalformedFrame(format!("missing header {key}")))
    }

    /// Encode as `TYPE: ...\nKEY: value\n...\n\n<body>`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"TYPE: ");
        out.extend_from_slice(self.frame_type.as_str().as_bytes());
        out.push(b'\n');
        for (k, v) in &self.fields {
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }

    /// Decode a raw datagram. Rejects frames missing `TYPE` or carrying an
    /// unrecognized `TYPE`, and frames whose declared `SIZE` doesn't match
    /// the body actually present.
    pub fn decode(data: &[u8]) -> Result<Frame, LsnpError> {
        if data.len() > MAX_DATAGRAM_BYTES {
            return Err(LsnpError::MalformedFrame("datagram exceeds size limit".into()));
        }
        let header_end = find_header_end(data)
            .ok_or_else(|| LsnpError::MalformedFrame("no header terminator".into()))?;
        let header_bytes = &data[..header_end.0];
        let body_start = header_end.1;

        let header_str = std::str::from_utf8(header_bytes)
            .map_err(|_| LsnpError::MalformedFrame("header not valid utf-8".into()))?;

        let mut fields = Vec::new();
        let mut frame_type = None;
        for line in header_str.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| LsnpError::MalformedFrame(format!("bad header line: {line}")))?;
            let key = key.trim();
            let value = value.trim();
            if key == "TYPE" {
                frame_type = Some(
                    FrameType::from_str(value)
                        .ok_or_else(|| LsnpError::UnknownType(value.to_string()))?,
                );
            } else {
                fields.push((key.to_string(), value.to_string()));
            }
        }

        let frame_type =
            frame_type.ok_or_else(|| LsnpError::MalformedFrame("missing TYPE header".into()))?;

        let body = if body_start < data.len() {
            let declared_size = fields
                .iter()
                .find(|(k, _)| k == "SIZE")
                .and_then(|(_, v)| v.parse::<usize>().ok());
            let raw = &data[body_start..];
            if let Some(size) = declared_size {
                if size != raw.len() {
                    return Err(LsnpError::MalformedFrame(
                        "SIZE header does not match body length".into(),
                    ));
                }
            }
            Some(raw.to_vec())
        } else {
            None
        };

        Ok(Frame {
            frame_type,
            fields,
            body,
            source_addr: None,
        })
    }
}

/// Returns `(header_len, body_start)` for the first blank line (`\n\n` or
/// `\r\n\r\n`), or `None` if the datagram has no header terminator.
fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < data.len() {
        if data[i] == b'\n' && data[i + 1] == b'\n' {
            return Some((i, i + 2));
        }
        if i + 3 < data.len() && &data[i..i + 4] == b"\r\n\r\n" {
            return Some((i, i + 4));
        }
        i += 1;
    }
    None
}
