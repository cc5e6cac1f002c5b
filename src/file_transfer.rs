//! Chunked file transfer (component J).
//!
//! One state machine per `transfer_id`, each logically owned by a single
//! task/mailbox (spec §5, §9) so that concurrent transfers never starve
//! each other. Chunk/window bookkeeping here is modeled after the
//! piece-accounting idiom in BitTorrent-style peer state (see
//! `examples/other_examples/7c0947cf_ikatson-rqbit__crates-librqbit-src-
//! peer_state.rs.rs`): a bitset-like `chunks_acked` set plus an in-flight
//! window cap, rather than a queue the sender has to rebalance by hand.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Offered,
    Accepted,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct FileTransfer {
    pub transfer_id: String,
    pub peer: String,
    pub direction: Direction,
    pub filename: String,
    pub size: u64,
    pub chunk_size: usize,
    pub chunks_total: u32,
    pub chunks_acked: HashSet<u32>,
    pub state: TransferState,
    /// Chunk indices currently in flight (sent, awaiting ACK) — bounded by
    /// the configured window. Sender-side only; empty for a receiver.
    pub in_flight: HashSet<u32>,
    /// Receiver-side chunk assembly buffer, indexed by chunk index.
    pub received: std::collections::HashMap<u32, Vec<u8>>,
    /// Sender-side source bytes handed over at offer time (spec §1: the
    /// blob bytes themselves are in scope even though disk I/O is not).
    /// Empty for a receiver.
    pub data: Vec<u8>,
}

pub fn chunks_total_for(size: u64, chunk_size: usize) -> u32 {
    if size == 0 {
        return 0;
    }
    ((size + chunk_size as u64 - 1) / chunk_size as u64) as u32
}

impl FileTransfer {
    pub fn new_outgoing(transfer_id: impl Into<String>, peer: impl Into<String>, filename: impl Into<String>, data: Vec<u8>, chunk_size: usize) -> Self {
        let size = data.len() as u64;
        FileTransfer {
            transfer_id: transfer_id.into(),
            peer: peer.into(),
            direction: Direction::Outgoing,
            filename: filename.into(),
            size,
            chunk_size,
            chunks_total: chunks_total_for(size, chunk_size),
            chunks_acked: HashSet::new(),
            state: TransferState::Offered,
            in_flight: HashSet::new(),
            received: Default::default(),
            data,
        }
    }

    pub fn new_incoming(transfer_id: impl Into<String>, peer: impl Into<String>, filename: impl Into<String>, size: u64, chunk_size: usize, chunks_total: u32) -> Self {
        FileTransfer {
            transfer_id: transfer_id.into(),
            peer: peer.into(),
            direction: Direction::Incoming,
            filename: filename.into(),
            size,
            chunk_size,
            chunks_total,
            chunks_acked: HashSet::new(),
            state: TransferState::Offered,
            in_flight: HashSet::new(),
            received: Default::default(),
            data: Vec::new(),
        }
    }

    /// Sender: the source bytes for chunk `idx`, per the offered chunk size.
    pub fn chunk_bytes(&self, idx: u32) -> &[u8] {
        let start = idx as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.data.len());
        &self.data[start.min(self.data.len())..end]
    }

    pub fn accept(&mut self) {
        if self.state == TransferState::Offered {
            self.state = TransferState::Accepted;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.chunks_total > 0 && self.chunks_acked.len() as u32 == self.chunks_total
    }

    /// Sender: pick up to `window - in_flight.len()` chunk indices not yet
    /// acked or already in flight, mark them in flight, and return them to
    /// send. Keeps the window full as ACKs free up slots (spec §4.9 flow
    /// control).
    pub fn next_chunks_to_send(&mut self, window: usize) -> Vec<u32> {
        if self.in_flight.len() >= window {
            return Vec::new();
        }
        let slots = window - self.in_flight.len();
        let mut picked = Vec::new();
        for idx in 0..self.chunks_total {
            if picked.len() >= slots {
                break;
            }
            if !self.chunks_acked.contains(&idx) && !self.in_flight.contains(&idx) {
                self.in_flight.insert(idx);
                picked.push(idx);
            }
        }
        if !picked.is_empty() {
            self.state = TransferState::Transferring;
        }
        picked
    }

    /// Sender: record that `idx` was ACKed; returns true if this completed the transfer.
    pub fn on_chunk_acked(&mut self, idx: u32) -> bool {
        self.in_flight.remove(&idx);
        self.chunks_acked.insert(idx);
        if self.is_complete() {
            self.state = TransferState::Completed;
            true
        } else {
            false
        }
    }

    /// Receiver: assemble `data` at `idx`; dedupe (already-seen chunks are
    /// dropped by the router before this is called, but assembling is
    /// idempotent regardless — invariant v).
    pub fn on_chunk_received(&mut self, idx: u32, data: Vec<u8>) {
        self.state = TransferState::Transferring;
        self.received.insert(idx, data);
        self.chunks_acked.insert(idx);
    }

    /// Receiver: assemble the final byte-identical file once all chunks
    /// have arrived, in index order (spec §8 property 5).
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::with_capacity(self.size as usize);
        for idx in 0..self.chunks_total {
            out.extend_from_slice(self.received.get(&idx)?);
        }
        Some(out)
    }

    pub fn fail(&mut self) {
        self.state = TransferState::Failed;
    }

    pub fn cancel(&mut self) {
        self.state = TransferState::Cancelled;
    }
}

/// Fingerprint `message_id` for a file chunk ACK/dedupe purposes.
pub fn chunk_message_id(transfer_id: &str, chunk_index: u32) -> String {
    format!("{transfer_id}:{chunk_index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunks_total_for(3500, 1024), 4);
        assert_eq!(chunks_total_for(1024, 1024), 1);
        assert_eq!(chunks_total_for(0, 1024), 0);
    }

    #[test]
    fn window_limits_in_flight_chunks() {
        let mut t = FileTransfer::new_outgoing("t1", "bob@1.1.1.1", "f.bin", vec![0u8; 10_000], 1024);
        t.accept();
        let picked = t.next_chunks_to_send(3);
        assert_eq!(picked.len(), 3);
        assert_eq!(t.next_chunks_to_send(3).len(), 0); // window full
    }

    #[test]
    fn acking_frees_window_slot() {
        let mut t = FileTransfer::new_outgoing("t1", "bob@1.1.1.1", "f.bin", vec![0u8; 10_000], 1024);
        t.accept();
        let picked = t.next_chunks_to_send(2);
        t.on_chunk_acked(picked[0]);
        let next = t.next_chunks_to_send(2);
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn completes_when_all_chunks_acked() {
        let mut t = FileTransfer::new_outgoing("t1", "bob@1.1.1.1", "f.bin", vec![0u8; 3500], 1024);
        t.accept();
        let picked = t.next_chunks_to_send(8);
        assert_eq!(picked.len(), 4);
        for (i, idx) in picked.iter().enumerate() {
            let completed = t.on_chunk_acked(*idx);
            assert_eq!(completed, i == picked.len() - 1);
        }
        assert_eq!(t.state, TransferState::Completed);
    }

    #[test]
    fn receiver_assembles_byte_identical_file_out_of_order() {
        let data = b"hello world this is a test file payload!".to_vec();
        let chunk_size = 10;
        let total = chunks_total_for(data.len() as u64, chunk_size);
        let mut t = FileTransfer::new_incoming("t1", "alice@1.1.1.1", "f.bin", data.len() as u64, chunk_size, total);

        let chunks: Vec<(u32, Vec<u8>)> = data
            .chunks(chunk_size)
            .enumerate()
            .map(|(i, c)| (i as u32, c.to_vec()))
            .collect();
        // Feed out of order.
        for (idx, bytes) in chunks.iter().rev() {
            t.on_chunk_received(*idx, bytes.clone());
        }
        assert!(t.is_complete());
        assert_eq!(t.assemble().unwrap(), data);
    }

    #[test]
    fn duplicate_chunk_is_idempotent() {
        let mut t = FileTransfer::new_incoming("t1", "alice@1.1.1.1", "f.bin", 5, 5, 1);
        t.on_chunk_received(0, b"hello".to_vec());
        t.on_chunk_received(0, b"hello".to_vec());
        assert_eq!(t.assemble().unwrap(), b"hello".to_vec());
    }
}
