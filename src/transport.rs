//! UDP transport (component D): socket setup, directed broadcast, and the
//! reliable-send retry queue.
//!
//! Socket construction follows `socket2::Socket::new` + `set_reuse_address`
//! then handing the std socket to `tokio::net::UdpSocket::from_std`, the
//! same sequence used in `examples/other_examples/ed49b3db_SeleniaProject-
//! Nyx__nyx-transport-src-lib.rs.rs`; `set_broadcast(true)` and periodic
//! broadcast sends follow `examples/other_examples/8b5ea679_mc095-
//! wichain__wichain-network-src-lib.rs.rs`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::{LsnpError, Result};

/// Bind a UDP socket on `port` across all interfaces, with `SO_REUSEADDR`
/// and `SO_BROADCAST` set so directed-broadcast PROFILE/PING frames can be
/// sent and a second local instance can coexist during development.
pub fn bind_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)
        .map_err(|e| LsnpError::Transport(format!("socket create failed: {e}")))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| LsnpError::Transport(format!("SO_REUSEADDR failed: {e}")))?;
    socket
        .set_broadcast(true)
        .map_err(|e| LsnpError::Transport(format!("SO_BROADCAST failed: {e}")))?;
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    socket
        .bind(&addr.into())
        .map_err(|e| LsnpError::Transport(format!("bind failed: {e}")))?;
    let std_sock: std::net::UdpSocket = socket.into();
    std_sock
        .set_nonblocking(true)
        .map_err(|e| LsnpError::Transport(format!("set_nonblocking failed: {e}")))?;
    UdpSocket::from_std(std_sock).map_err(|e| LsnpError::Transport(format!("tokio wrap failed: {e}")))
}

/// Compute the directed-broadcast address for `local_addr`/`netmask`, or
/// fall back to the limited broadcast address `255.255.255.255` when the
/// netmask can't be determined (DESIGN.md open question: subnet broadcast).
pub fn directed_broadcast_addr(local_addr: Ipv4Addr, netmask: Option<Ipv4Addr>) -> Ipv4Addr {
    match netmask {
        Some(mask) => {
            let ip_bits = u32::from(local_addr);
            let mask_bits = u32::from(mask);
            Ipv4Addr::from(ip_bits | !mask_bits)
        }
        None => Ipv4Addr::BROADCAST,
    }
}

/// An outbound frame awaiting acknowledgement, tracked by the retry queue.
struct PendingSend {
    dest: SocketAddr,
    payload: Vec<u8>,
    attempt: usize,
    next_deadline: Instant,
}

/// Key identifying one outstanding reliable send: a message can be sent to
/// several recipients under the same `message_id` (group fan-out, spec
/// §4.8), and each recipient's ACK must discharge only its own copy.
pub type PendingKey = (String, SocketAddr);

/// Reliable-send retry queue: tracks unacked unicast sends and resends them
/// on an exponential backoff schedule (spec §4.4/§5: 2s/4s/8s, 3 retries,
/// then give up and report delivery failure).
pub struct RetryQueue {
    pending: HashMap<PendingKey, PendingSend>,
    schedule: Vec<Duration>,
}

/// Outcome of a retry-queue tick for one pending send.
pub enum RetryOutcome {
    Resend { dest: SocketAddr, payload: Vec<u8> },
    GaveUp,
}

impl RetryQueue {
    pub fn new(schedule_secs: &[u64]) -> Self {
        RetryQueue {
            pending: HashMap::new(),
            schedule: schedule_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
        }
    }

    /// Register a reliable send awaiting an ACK from `dest`, keyed by
    /// `(message_id, dest)` so a fan-out under one shared `message_id` keeps
    /// a separate retry slot per recipient.
    pub fn track(&mut self, message_id: impl Into<String>, dest: SocketAddr, payload: Vec<u8>, now: Instant) {
        let first_delay = self.schedule.first().copied().unwrap_or(Duration::from_secs(2));
        self.pending.insert(
            (message_id.into(), dest),
            PendingSend {
                dest,
                payload,
                attempt: 0,
                next_deadline: now + first_delay,
            },
        );
    }

    /// An ACK arrived for `message_id` from `src`; stop tracking it. Returns
    /// `true` if it was actually pending (idempotent against duplicate ACKs).
    pub fn ack(&mut self, message_id: &str, src: SocketAddr) -> bool {
        self.pending.remove(&(message_id.to_string(), src)).is_some()
    }

    pub fn is_pending(&self, message_id: &str, dest: SocketAddr) -> bool {
        self.pending.contains_key(&(message_id.to_string(), dest))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Scan all pending sends for `now`, resending any whose deadline has
    /// passed and dropping any that exhausted their retry schedule. Returns
    /// `(key, outcome)` pairs so the caller can actually perform the socket
    /// I/O and fire delivery-failure events.
    pub fn tick(&mut self, now: Instant) -> Vec<(PendingKey, RetryOutcome)> {
        let mut results = Vec::new();
        let mut gave_up = Vec::new();

        for (key, pending) in self.pending.iter_mut() {
            if now < pending.next_deadline {
                continue;
            }
            if pending.attempt >= self.schedule.len() {
                gave_up.push(key.clone());
                continue;
            }
            let delay = self.schedule[pending.attempt];
            pending.attempt += 1;
            pending.next_deadline = now + delay;
            results.push((
                key.clone(),
                RetryOutcome::Resend {
                    dest: pending.dest,
                    payload: pending.payload.clone(),
                },
            ));
        }

        for key in gave_up {
            self.pending.remove(&key);
            results.push((key, RetryOutcome::GaveUp));
        }

        results
    }
}

/// Thin wrapper bundling the bound socket with the node's own broadcast
/// target, so callers don't have to recompute it on every send.
pub struct Transport {
    pub socket: Arc<UdpSocket>,
    pub broadcast_addr: SocketAddr,
}

impl Transport {
    pub fn new(socket: UdpSocket, broadcast_ip: Ipv4Addr, port: u16) -> Self {
        Transport {
            socket: Arc::new(socket),
            broadcast_addr: SocketAddr::new(IpAddr::V4(broadcast_ip), port),
        }
    }

    pub async fn send_broadcast(&self, payload: &[u8]) -> Result<()> {
        self.socket
            .send_to(payload, self.broadcast_addr)
            .await
            .map_err(|e| LsnpError::Transport(format!("broadcast send failed: {e}")))?;
        Ok(())
    }

    pub async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> Result<()> {
        self.socket
            .send_to(payload, dest)
            .await
            .map_err(|e| LsnpError::Transport(format!("send failed: {e}")))?;
        Ok(())
    }
}
