//! The LSNP node (engine): wires every component into one owning event
//! loop, mirroring `P2pNode`/`P2pHandle`/`NodeState` in
//! `crates/sven-p2p/src/node.rs` — a single task mutates all session
//! state; everything else talks to it through [`crate::ui::UiHandle`].

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant as TokioInstant, MissedTickBehavior};
use uuid::Uuid;

use crate::codec::{Frame, FrameType, MAX_DATAGRAM_BYTES};
use crate::config::LsnpConfig;
use crate::dedupe::DedupeCache;
use crate::error::Result;
use crate::file_transfer::{self, Direction as FileDirection, FileTransfer};
use crate::game::{Game, GameState, MoveRejection, Symbol};
use crate::group::GroupRegistry;
use crate::messaging::{DeliveryState, MessagingState};
use crate::peer::PeerRegistry;
use crate::presence::{self, Identity};
use crate::router::{self, DropReason, RouteOutcome};
use crate::token::{Scope, Token, TokenAuthority};
use crate::transport::{self, RetryOutcome, RetryQueue, Transport};
use crate::ui::{UiCommand, UiEvent, UiHandle};

/// What an outstanding reliable send means once it's ACKed, so the ACK
/// handler knows which service state to update (spec §6.2: the generic
/// `ACK` frame carries only `MESSAGE_ID`, so this context has to be kept
/// alongside the retry queue rather than recovered from the wire).
#[derive(Debug, Clone)]
enum PendingKind {
    Chat { peer: String },
    GroupChat { group_id: String },
    FileChunk { transfer_id: String, chunk_index: u32 },
    Generic,
}

pub struct LsnpNode {
    config: LsnpConfig,
    identity: Identity,
    cmd_tx: mpsc::Sender<UiCommand>,
    cmd_rx: mpsc::Receiver<UiCommand>,
    event_tx: broadcast::Sender<UiEvent>,
}

impl LsnpNode {
    pub fn new(config: LsnpConfig, identity: Identity) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let (event_tx, _) = broadcast::channel(512);
        LsnpNode { config, identity, cmd_tx, cmd_rx, event_tx }
    }

    pub fn handle(&self) -> UiHandle {
        UiHandle::new(self.cmd_tx.clone(), self.event_tx.clone())
    }

    /// Bind the socket, compute the directed-broadcast address, send the
    /// startup burst, then run the event loop until shutdown.
    pub async fn run(self) -> Result<()> {
        let socket = transport::bind_socket(self.config.port)?;
        // DESIGN.md open question: subnet broadcast. Without direct access to
        // interface enumeration here, fall back to the limited broadcast
        // address; a host embedding this crate may override via a future
        // `Transport::with_broadcast_addr` constructor once interface
        // discovery is wired in.
        let broadcast_ip = transport::directed_broadcast_addr(Ipv4Addr::UNSPECIFIED, None);
        let transport = Transport::new(socket, broadcast_ip, self.config.port);

        let dedupe = DedupeCache::new(self.config.dedupe_cap, Duration::from_secs(self.config.dedupe_ttl_secs));
        let retry = RetryQueue::new(&self.config.retry_schedule_secs);
        let state = NodeState {
            config: self.config,
            identity: self.identity,
            event_tx: self.event_tx,
            peers: PeerRegistry::new(),
            dedupe,
            tokens: TokenAuthority::new(),
            retry,
            pending_kinds: HashMap::new(),
            messaging: MessagingState::new(),
            groups: GroupRegistry::new(),
            transfers: HashMap::new(),
            games: HashMap::new(),
        };

        state.event_loop(transport, self.cmd_rx).await
    }
}

struct NodeState {
    config: LsnpConfig,
    identity: Identity,
    event_tx: broadcast::Sender<UiEvent>,
    peers: PeerRegistry,
    dedupe: DedupeCache,
    tokens: TokenAuthority,
    retry: RetryQueue,
    /// Keyed by `(message_id, dest)`: a group fan-out shares one
    /// `message_id` across recipients (spec §4.8), so each recipient needs
    /// its own retry/ack bookkeeping rather than one shared entry.
    pending_kinds: HashMap<(String, SocketAddr), PendingKind>,
    messaging: MessagingState,
    groups: GroupRegistry,
    transfers: HashMap<String, FileTransfer>,
    games: HashMap<String, Game>,
}

impl NodeState {
    fn emit(&self, event: UiEvent) {
        let _ = self.event_tx.send(event);
    }

    fn verbose(&self, message: impl Into<String>) {
        if self.config.verbose {
            self.emit(UiEvent::VerboseLog { message: message.into() });
        }
    }

    async fn event_loop(mut self, transport: Transport, mut cmd_rx: mpsc::Receiver<UiCommand>) -> Result<()> {
        let mut recv_buf = vec![0u8; MAX_DATAGRAM_BYTES];

        let profile_period = Duration::from_secs(self.config.profile_interval_secs);
        let mut profile_timer = interval_at(TokioInstant::now(), profile_period);
        profile_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let ping_period = Duration::from_secs(self.config.ping_interval_secs);
        let mut ping_timer = interval_at(TokioInstant::now(), ping_period);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let sweep_period = Duration::from_secs(5);
        let mut sweep_timer = interval_at(TokioInstant::now() + sweep_period, sweep_period);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let retry_period = Duration::from_secs(1);
        let mut retry_timer = interval_at(TokioInstant::now() + retry_period, retry_period);
        retry_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = transport.socket.recv_from(&mut recv_buf) => {
                    match result {
                        Ok((n, src)) => self.on_datagram(&transport, &recv_buf[..n], src).await,
                        Err(e) => tracing::warn!("recv error: {e}"),
                    }
                }
                _ = profile_timer.tick() => self.on_profile_tick(&transport).await,
                _ = ping_timer.tick() => self.on_ping_tick(&transport).await,
                _ = sweep_timer.tick() => self.on_sweep_tick(),
                _ = retry_timer.tick() => self.on_retry_tick(&transport).await,
                Some(cmd) = cmd_rx.recv() => {
                    if self.on_command(&transport, cmd).await {
                        break;
                    }
                }
            }
        }

        self.on_shutdown(&transport).await;
        Ok(())
    }

    // ── Inbound dispatch ──────────────────────────────────────────────

    async fn on_datagram(&mut self, transport: &Transport, data: &[u8], src: std::net::SocketAddr) {
        match router::route(data, src, &self.dedupe, &self.tokens) {
            RouteOutcome::Accepted(frame) => self.dispatch(transport, frame, src).await,
            RouteOutcome::Dropped(reason) => match reason {
                DropReason::Duplicate => {}
                other => self.verbose(format!("dropped frame from {src}: {other:?}")),
            },
        }
    }

    async fn dispatch(&mut self, transport: &Transport, frame: Frame, src: std::net::SocketAddr) {
        let now = Instant::now();
        match frame.frame_type {
            FrameType::Profile => {
                if let Some(event) = presence::handle_profile(&frame, &self.peers, now) {
                    self.emit(event);
                }
            }
            FrameType::Ping => {
                if let Some(user_id) = presence::handle_ping(&frame, &self.peers, now).map(str::to_string) {
                    let pong = presence::build_pong_frame(&self.identity, &user_id, &self.tokens, self.config.token_ttl_secs);
                    let _ = transport.send_to(&pong.encode(), src).await;
                }
            }
            FrameType::Pong => presence::handle_pong(&frame, &self.peers, now),
            FrameType::Post => {
                if let (Some(post_id), Some(author)) = (frame.get("POST_ID"), frame.get("FROM")) {
                    let text = frame.body.as_deref().map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default();
                    self.messaging.upsert_post(post_id, author, &text);
                    self.emit(UiEvent::PostReceived { post_id: post_id.to_string(), author: author.to_string(), text });
                }
            }
            FrameType::Like => {
                if let (Some(post_id), Some(liker)) = (frame.get("POST_ID"), frame.get("FROM")) {
                    if self.messaging.apply_like(post_id, liker) {
                        self.emit(UiEvent::LikeReceived { post_id: post_id.to_string(), liker: liker.to_string() });
                    }
                }
            }
            FrameType::Chat => {
                if let (Some(from), Some(message_id)) = (frame.get("FROM"), frame.get("MESSAGE_ID")) {
                    let text = frame.body.as_deref().map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default();
                    self.messaging.record_inbound(from, message_id, &text);
                    self.emit(UiEvent::DmReceived { peer: from.to_string(), text });
                    self.send_ack(transport, src, message_id).await;
                }
            }
            FrameType::GroupChat => {
                if let (Some(group_id), Some(from), Some(message_id)) =
                    (frame.get("GROUP_ID"), frame.get("FROM"), frame.get("MESSAGE_ID"))
                {
                    let text = frame.body.as_deref().map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default();
                    if self.groups.record_message(group_id, message_id, from, &text) {
                        self.emit(UiEvent::GroupMessageReceived { group_id: group_id.to_string(), from: from.to_string(), text });
                    }
                    self.send_ack(transport, src, message_id).await;
                }
            }
            FrameType::GroupUpdate => self.on_group_update(&frame),
            FrameType::FileOffer => self.on_file_offer(transport, &frame, src).await,
            FrameType::FileAccept => self.on_file_accept(transport, &frame, src).await,
            FrameType::FileReject => self.on_file_reject(transport, &frame, src).await,
            FrameType::FileData => self.on_file_data(transport, &frame, src).await,
            FrameType::FileComplete => self.on_file_complete(transport, &frame, src).await,
            FrameType::FileCancel => self.on_file_cancel(transport, &frame, src).await,
            FrameType::GameInvite => self.on_game_invite(transport, &frame, src).await,
            FrameType::GameInviteAck => self.on_game_invite_ack(transport, &frame, src).await,
            FrameType::GameMove => self.on_game_move(transport, &frame, src).await,
            FrameType::GameResult => self.verbose("received informational GAME_RESULT"),
            FrameType::GameResign => self.on_game_resign(transport, &frame, src).await,
            FrameType::GameResync => self.on_game_resync(transport, &frame, src).await,
            FrameType::Ack => self.on_ack(transport, &frame).await,
            FrameType::Revoke => {
                if let Some(event) = presence::handle_revoke(&frame, &self.peers, &mut self.tokens) {
                    self.emit(event);
                }
            }
        }
    }

    async fn send_ack(&self, transport: &Transport, dest: std::net::SocketAddr, message_id: &str) {
        let ack = Frame::new(FrameType::Ack).with_field("MESSAGE_ID", message_id);
        let _ = transport.send_to(&ack.encode(), dest).await;
    }

    async fn on_ack(&mut self, transport: &Transport, frame: &Frame) {
        let Some(message_id) = frame.get("MESSAGE_ID").map(str::to_string) else { return };
        let Some(src) = frame.source_addr else { return };
        if !self.retry.ack(&message_id, src) {
            return;
        }
        let Some(kind) = self.pending_kinds.remove(&(message_id.clone(), src)) else { return };
        match kind {
            PendingKind::Chat { peer } => {
                self.messaging.set_delivery_state(&peer, &message_id, DeliveryState::Acked);
                self.emit(UiEvent::DmDeliveryChanged { peer, message_id, state: DeliveryState::Acked });
            }
            PendingKind::GroupChat { group_id } => {
                self.verbose(format!("group message {message_id} acked by a member of {group_id}"));
            }
            PendingKind::FileChunk { transfer_id, chunk_index } => {
                self.on_chunk_acked(transport, transfer_id, src, chunk_index).await;
            }
            PendingKind::Generic => {}
        }
    }

    // ── Group handling ────────────────────────────────────────────────

    fn on_group_update(&mut self, frame: &Frame) {
        let (Some(group_id), Some(creator), Some(members_field), Some(updated_at_field)) = (
            frame.get("GROUP_ID"),
            frame.get("CREATOR"),
            frame.get("MEMBERS"),
            frame.get("UPDATED_AT"),
        ) else {
            return;
        };
        let members: std::collections::HashSet<String> =
            members_field.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect();
        let Ok(updated_at) = updated_at_field.parse::<i64>() else { return };
        let Some(updated_at) = chrono::DateTime::from_timestamp(updated_at, 0) else { return };
        let name = frame.get("NAME").unwrap_or(group_id);

        if self.groups.get(group_id).is_none() {
            // First time we're hearing of this group: install it verbatim
            // rather than trying to "mirror" a diff against nothing.
            self.groups.observe_created(crate::group::Group {
                group_id: group_id.to_string(),
                creator: creator.to_string(),
                name: name.to_string(),
                members,
                messages: Vec::new(),
                updated_at,
            });
            return;
        }
        self.groups.mirror_update(group_id, creator, members, updated_at);
    }

    // ── File transfer handling ────────────────────────────────────────

    async fn on_file_offer(&mut self, transport: &Transport, frame: &Frame, src: std::net::SocketAddr) {
        let (Some(transfer_id), Some(from), Some(filename), Some(size), Some(chunk_size), Some(chunk_count)) = (
            frame.get("TRANSFER_ID"),
            frame.get("FROM"),
            frame.get("FILENAME"),
            frame.get("SIZE").and_then(|s| s.parse::<u64>().ok()),
            frame.get("CHUNK_SIZE").and_then(|s| s.parse::<usize>().ok()),
            frame.get("CHUNK_COUNT").and_then(|s| s.parse::<u32>().ok()),
        ) else {
            return;
        };
        let transfer = FileTransfer::new_incoming(transfer_id, from, filename, size, chunk_size, chunk_count);
        self.transfers.insert(transfer_id.to_string(), transfer);
        self.emit(UiEvent::FileOffered { transfer_id: transfer_id.to_string(), peer: from.to_string(), filename: filename.to_string(), size });
        if let Some(message_id) = frame.get("MESSAGE_ID") {
            self.send_ack(transport, src, message_id).await;
        }
    }

    async fn on_file_accept(&mut self, transport: &Transport, frame: &Frame, src: std::net::SocketAddr) {
        let Some(transfer_id) = frame.get("TRANSFER_ID") else { return };
        if let Some(transfer) = self.transfers.get_mut(transfer_id) {
            transfer.accept();
        }
        if let Some(message_id) = frame.get("MESSAGE_ID") {
            self.send_ack(transport, src, message_id).await;
        }
        self.pump_file_chunks(transport, transfer_id, src).await;
    }

    async fn on_file_reject(&mut self, transport: &Transport, frame: &Frame, src: std::net::SocketAddr) {
        let Some(transfer_id) = frame.get("TRANSFER_ID") else { return };
        if let Some(transfer) = self.transfers.get_mut(transfer_id) {
            transfer.fail();
        }
        self.emit(UiEvent::FileFailed { transfer_id: transfer_id.to_string() });
        if let Some(message_id) = frame.get("MESSAGE_ID") {
            self.send_ack(transport, src, message_id).await;
        }
    }

    async fn on_file_data(&mut self, transport: &Transport, frame: &Frame, src: std::net::SocketAddr) {
        let (Some(transfer_id), Some(chunk_index)) = (frame.get("TRANSFER_ID"), frame.get("CHUNK_INDEX").and_then(|s| s.parse::<u32>().ok())) else {
            return;
        };
        if let Some(transfer) = self.transfers.get_mut(transfer_id) {
            let data = frame.body.clone().unwrap_or_default();
            transfer.on_chunk_received(chunk_index, data);
            let progress = UiEvent::FileProgress { transfer_id: transfer_id.to_string(), chunks_acked: transfer.chunks_acked.len() as u32, chunks_total: transfer.chunks_total };
            self.emit(progress);
        }
        if let Some(message_id) = frame.get("MESSAGE_ID") {
            self.send_ack(transport, src, message_id).await;
        }
    }

    async fn on_file_complete(&mut self, transport: &Transport, frame: &Frame, src: std::net::SocketAddr) {
        let Some(transfer_id) = frame.get("TRANSFER_ID") else { return };
        if let Some(transfer) = self.transfers.get(transfer_id) {
            if transfer.assemble().is_some() {
                self.emit(UiEvent::FileCompleted { transfer_id: transfer_id.to_string() });
            }
        }
        if let Some(message_id) = frame.get("MESSAGE_ID") {
            self.send_ack(transport, src, message_id).await;
        }
    }

    async fn on_file_cancel(&mut self, transport: &Transport, frame: &Frame, src: std::net::SocketAddr) {
        let Some(transfer_id) = frame.get("TRANSFER_ID") else { return };
        if let Some(transfer) = self.transfers.get_mut(transfer_id) {
            transfer.cancel();
        }
        self.emit(UiEvent::FileFailed { transfer_id: transfer_id.to_string() });
        if let Some(message_id) = frame.get("MESSAGE_ID") {
            self.send_ack(transport, src, message_id).await;
        }
    }

    /// Send as many chunks as the transfer's window allows, tracking each
    /// under the transport's retry discipline (spec §4.9 flow control).
    /// Called on FILE_ACCEPT and again every time a chunk ACK frees a window
    /// slot, so transfers wider than one window keep refilling instead of
    /// stalling after the first burst.
    async fn pump_file_chunks(&mut self, transport: &Transport, transfer_id: &str, dest: std::net::SocketAddr) {
        let window = self.config.file_window;
        let token_ttl = self.config.token_ttl_secs;
        let token = self.tokens.mint(self.identity.user_id.clone(), Scope::File, token_ttl);
        let Some(transfer) = self.transfers.get_mut(transfer_id) else { return };
        if transfer.direction != FileDirection::Outgoing {
            return;
        }
        let indices = transfer.next_chunks_to_send(window);
        for idx in indices {
            let chunk = transfer.chunk_bytes(idx).to_vec();
            let message_id = file_transfer::chunk_message_id(transfer_id, idx);
            let frame = Frame::new(FrameType::FileData)
                .with_field("TRANSFER_ID", transfer_id)
                .with_field("CHUNK_INDEX", idx.to_string())
                .with_field("MESSAGE_ID", message_id.clone())
                .with_field("TOKEN", token.encode())
                .with_body(chunk);
            let payload = frame.encode();
            let _ = transport.send_to(&payload, dest).await;
            self.retry.track(message_id.clone(), dest, payload, Instant::now());
            self.pending_kinds.insert((message_id, dest), PendingKind::FileChunk { transfer_id: transfer_id.to_string(), chunk_index: idx });
        }
    }

    async fn on_chunk_acked(&mut self, transport: &Transport, transfer_id: String, dest: std::net::SocketAddr, chunk_index: u32) {
        let Some(transfer) = self.transfers.get_mut(&transfer_id) else { return };
        let completed = transfer.on_chunk_acked(chunk_index);
        let progress = UiEvent::FileProgress { transfer_id: transfer_id.clone(), chunks_acked: transfer.chunks_acked.len() as u32, chunks_total: transfer.chunks_total };
        self.emit(progress);
        if completed {
            self.emit(UiEvent::FileCompleted { transfer_id: transfer_id.clone() });
            let message_id = self.new_message_id();
            let token_ttl = self.config.token_ttl_secs;
            let token = self.tokens.mint(self.identity.user_id.clone(), Scope::File, token_ttl);
            let complete = Frame::new(FrameType::FileComplete)
                .with_field("TRANSFER_ID", transfer_id)
                .with_field("MESSAGE_ID", message_id)
                .with_field("TOKEN", token.encode());
            let _ = transport.send_to(&complete.encode(), dest).await;
        } else {
            self.pump_file_chunks(transport, &transfer_id, dest).await;
        }
    }

    // ── Game handling ─────────────────────────────────────────────────

    async fn on_game_invite(&mut self, transport: &Transport, frame: &Frame, src: std::net::SocketAddr) {
        let (Some(game_id), Some(from)) = (frame.get("GAME_ID"), frame.get("FROM")) else { return };
        let symbol = frame.get("SYMBOL").and_then(Symbol::parse).unwrap_or(Symbol::X);
        // We were invited, so our symbol is the other one.
        let game = Game::new(game_id, from, symbol.other());
        self.games.insert(game_id.to_string(), game);
        self.emit(UiEvent::GameInvited { game_id: game_id.to_string(), peer: from.to_string() });
        if let Some(message_id) = frame.get("MESSAGE_ID") {
            self.send_ack(transport, src, message_id).await;
        }
    }

    async fn on_game_invite_ack(&mut self, transport: &Transport, frame: &Frame, src: std::net::SocketAddr) {
        let Some(game_id) = frame.get("GAME_ID") else { return };
        let accepted = frame.get("ACCEPT").map(|s| s == "true").unwrap_or(false);
        if let Some(game) = self.games.get_mut(game_id) {
            if accepted {
                game.activate();
                self.emit(UiEvent::GameStarted { game_id: game_id.to_string() });
            } else {
                game.cancel();
                self.emit(UiEvent::GameEnded { game_id: game_id.to_string(), result: GameState::Cancelled });
            }
        }
        if let Some(message_id) = frame.get("MESSAGE_ID") {
            self.send_ack(transport, src, message_id).await;
        }
    }

    async fn on_game_move(&mut self, transport: &Transport, frame: &Frame, src: std::net::SocketAddr) {
        let (Some(game_id), Some(position), Some(player), Some(move_no)) = (
            frame.get("GAME_ID"),
            frame.get("POSITION").and_then(|s| s.parse::<usize>().ok()),
            frame.get("PLAYER").and_then(Symbol::parse),
            frame.get("MOVE_NO").and_then(|s| s.parse::<u32>().ok()),
        ) else {
            return;
        };
        // Applying the move and reading back the game's resulting state must
        // finish — and drop the borrow of `self.games` — before any call
        // below that needs `&self` as a whole (`self.emit`, `self.verbose`,
        // `self.tokens.mint`), so the outcome is captured as an owned value
        // here rather than read off a still-live `&mut Game`.
        enum MoveOutcome {
            Applied(Option<GameState>),
            Rejected(MoveRejection),
        }

        let outcome = self.games.get_mut(game_id).map(|game| match game.apply_move(position, player, move_no) {
            Ok(()) => MoveOutcome::Applied(matches!(game.state, GameState::Won(_) | GameState::Drawn).then_some(game.state)),
            Err(rejection) => MoveOutcome::Rejected(rejection),
        });

        match outcome {
            Some(MoveOutcome::Applied(ended)) => {
                self.emit(UiEvent::GameMoveApplied { game_id: game_id.to_string(), position, player: player.as_str().to_string() });
                if let Some(result) = ended {
                    self.emit(UiEvent::GameEnded { game_id: game_id.to_string(), result });
                }
            }
            Some(MoveOutcome::Rejected(rejection)) => {
                self.verbose(format!("rejected move for {game_id}: {rejection:?}"));
                if rejection == MoveRejection::MoveNoMismatch {
                    let token = self.tokens.mint(self.identity.user_id.clone(), Scope::Game, self.config.token_ttl_secs);
                    let resync = self.games.get(game_id).map(|game| build_resync_frame(game_id, game, &token));
                    if let Some(resync) = resync {
                        let _ = transport.send_to(&resync.encode(), src).await;
                    }
                }
            }
            None => {}
        }
        if let Some(message_id) = frame.get("MESSAGE_ID") {
            self.send_ack(transport, src, message_id).await;
        }
    }

    async fn on_game_resign(&mut self, transport: &Transport, frame: &Frame, src: std::net::SocketAddr) {
        let Some(game_id) = frame.get("GAME_ID") else { return };
        if let Some(game) = self.games.get_mut(game_id) {
            game.cancel();
        }
        self.emit(UiEvent::GameEnded { game_id: game_id.to_string(), result: GameState::Cancelled });
        if let Some(message_id) = frame.get("MESSAGE_ID") {
            self.send_ack(transport, src, message_id).await;
        }
    }

    async fn on_game_resync(&mut self, transport: &Transport, frame: &Frame, src: std::net::SocketAddr) {
        let (Some(game_id), Some(move_no), Some(turn)) = (
            frame.get("GAME_ID"),
            frame.get("MOVE_NO").and_then(|s| s.parse::<u32>().ok()),
            frame.get("TURN").and_then(Symbol::parse),
        ) else {
            return;
        };
        let Some(board_field) = frame.get("BOARD") else { return };
        let Some(board) = parse_board(board_field) else { return };
        let is_x = frame.get("IS_X").map(|s| s == "true").unwrap_or(false);
        if let Some(game) = self.games.get_mut(game_id) {
            game.reconcile(move_no, board, turn, is_x);
        }
        if let Some(message_id) = frame.get("MESSAGE_ID") {
            self.send_ack(transport, src, message_id).await;
        }
    }

    // ── Timers ────────────────────────────────────────────────────────

    async fn on_profile_tick(&mut self, transport: &Transport) {
        let frame = presence::build_profile_frame(&self.identity, &self.tokens, self.config.token_ttl_secs);
        let _ = transport.send_broadcast(&frame.encode()).await;
    }

    async fn on_ping_tick(&mut self, transport: &Transport) {
        let frame = presence::build_ping_frame(&self.identity, &self.tokens, self.config.token_ttl_secs);
        let _ = transport.send_broadcast(&frame.encode()).await;
    }

    fn on_sweep_tick(&mut self) {
        let now = Instant::now();
        let stale = Duration::from_secs(self.config.stale_threshold_secs);
        let evict = Duration::from_secs(self.config.evict_threshold_secs);
        for user_id in self.peers.sweep_stale(stale, now) {
            self.emit(UiEvent::PeerUpdated {
                user_id: user_id.clone(),
                display_name: user_id,
                status: crate::peer::PeerStatus::Custom("inactive".to_string()),
            });
        }
        for user_id in self.peers.evict_idle(evict, now) {
            self.emit(UiEvent::PeerRemoved { user_id });
        }
        // Abandon games whose opponent has been inactive too long (spec §4.10).
        let abandon_threshold = stale * 2;
        for (game_id, game) in self.games.iter_mut() {
            if game.state != GameState::Active {
                continue;
            }
            let Some(peer) = self.peers.get(&game.opponent) else { continue };
            if now.duration_since(peer.last_seen) > abandon_threshold {
                game.abandon();
                let _ = self.event_tx.send(UiEvent::GameEnded { game_id: game_id.clone(), result: GameState::Abandoned });
            }
        }
    }

    async fn on_retry_tick(&mut self, transport: &Transport) {
        let outcomes = self.retry.tick(Instant::now());
        for (key, outcome) in outcomes {
            match outcome {
                RetryOutcome::Resend { dest, payload } => {
                    let _ = transport.send_to(&payload, dest).await;
                }
                RetryOutcome::GaveUp => {
                    if let Some(kind) = self.pending_kinds.remove(&key) {
                        self.on_delivery_failed(key.0, kind);
                    }
                }
            }
        }
    }

    fn on_delivery_failed(&mut self, message_id: String, kind: PendingKind) {
        match kind {
            PendingKind::Chat { peer } => {
                self.messaging.set_delivery_state(&peer, &message_id, DeliveryState::Failed);
                self.emit(UiEvent::DmDeliveryChanged { peer, message_id, state: DeliveryState::Failed });
            }
            PendingKind::GroupChat { group_id } => {
                self.verbose(format!("group message {message_id} to {group_id} exhausted retries"));
            }
            PendingKind::FileChunk { transfer_id, .. } => {
                if let Some(transfer) = self.transfers.get_mut(&transfer_id) {
                    transfer.fail();
                }
                self.emit(UiEvent::FileFailed { transfer_id });
            }
            PendingKind::Generic => {}
        }
    }

    // ── UI commands ───────────────────────────────────────────────────

    /// Returns `true` if the loop should stop (Shutdown command).
    async fn on_command(&mut self, transport: &Transport, cmd: UiCommand) -> bool {
        match cmd {
            UiCommand::SendChat { peer, text } => self.cmd_send_chat(transport, peer, text).await,
            UiCommand::Post { text } => self.cmd_post(transport, text).await,
            UiCommand::Like { post_id } => self.cmd_like(transport, post_id).await,
            UiCommand::CreateGroup { name, members } => self.cmd_create_group(transport, name, members).await,
            UiCommand::SendGroupChat { group_id, text } => self.cmd_send_group_chat(transport, group_id, text).await,
            UiCommand::OfferFile { peer, filename, data } => self.cmd_offer_file(transport, peer, filename, data).await,
            UiCommand::AcceptFile { transfer_id } => self.cmd_accept_file(transport, transfer_id).await,
            UiCommand::RejectFile { transfer_id } => self.cmd_reject_file(transport, transfer_id).await,
            UiCommand::InviteGame { peer } => self.cmd_invite_game(transport, peer).await,
            UiCommand::SubmitMove { game_id, position } => self.cmd_submit_move(transport, game_id, position).await,
            UiCommand::UpdateProfile { display_name, status } => {
                self.identity.display_name = display_name;
                self.identity.status = status;
                false
            }
            UiCommand::Shutdown => true,
        }
    }

    fn new_message_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    async fn send_reliable(&mut self, transport: &Transport, dest: std::net::SocketAddr, frame: Frame, message_id: String, kind: PendingKind) {
        let payload = frame.encode();
        let _ = transport.send_to(&payload, dest).await;
        self.retry.track(message_id.clone(), dest, payload, Instant::now());
        self.pending_kinds.insert((message_id, dest), kind);
    }

    async fn cmd_send_chat(&mut self, transport: &Transport, peer: String, text: String) -> bool {
        let Some(peer_info) = self.peers.get(&peer) else {
            self.verbose(format!("send_chat to unknown peer {peer}"));
            return false;
        };
        let Some((_, ip)) = crate::peer::split_user_id(&peer) else { return false };
        let Ok(dest) = format!("{ip}:{}", self.config.port).parse() else { return false };
        let _ = peer_info;
        let message_id = self.new_message_id();
        let token = self.tokens.mint(self.identity.user_id.clone(), Scope::Chat, self.config.token_ttl_secs);
        let frame = Frame::new(FrameType::Chat)
            .with_field("FROM", self.identity.user_id.clone())
            .with_field("TO", peer.clone())
            .with_field("MESSAGE_ID", message_id.clone())
            .with_field("TOKEN", token.encode())
            .with_body(text.clone().into_bytes());
        self.messaging.record_outbound(&peer, &message_id, &text);
        self.send_reliable(transport, dest, frame, message_id, PendingKind::Chat { peer }).await;
        false
    }

    async fn cmd_post(&mut self, transport: &Transport, text: String) -> bool {
        let post_id = self.new_message_id();
        let token = self.tokens.mint(self.identity.user_id.clone(), Scope::Broadcast, self.config.token_ttl_secs);
        let frame = Frame::new(FrameType::Post)
            .with_field("POST_ID", post_id.clone())
            .with_field("FROM", self.identity.user_id.clone())
            .with_field("TOKEN", token.encode())
            .with_body(text.clone().into_bytes());
        self.messaging.upsert_post(&post_id, &self.identity.user_id, &text);
        let _ = transport.send_broadcast(&frame.encode()).await;
        false
    }

    async fn cmd_like(&mut self, transport: &Transport, post_id: String) -> bool {
        let token = self.tokens.mint(self.identity.user_id.clone(), Scope::Broadcast, self.config.token_ttl_secs);
        let frame = Frame::new(FrameType::Like)
            .with_field("POST_ID", post_id.clone())
            .with_field("FROM", self.identity.user_id.clone())
            .with_field("TOKEN", token.encode());
        self.messaging.apply_like(&post_id, &self.identity.user_id);
        let _ = transport.send_broadcast(&frame.encode()).await;
        false
    }

    async fn cmd_create_group(&mut self, transport: &Transport, name: String, members: Vec<String>) -> bool {
        let uuid = self.new_message_id();
        let mut member_set: std::collections::HashSet<String> = members.into_iter().collect();
        member_set.insert(self.identity.user_id.clone());
        let group = self.groups.create(&self.identity.user_id, &name, member_set.clone(), &uuid);
        let token = self.tokens.mint(self.identity.user_id.clone(), Scope::Broadcast, self.config.token_ttl_secs);
        let frame = Frame::new(FrameType::GroupUpdate)
            .with_field("GROUP_ID", group.group_id)
            .with_field("CREATOR", self.identity.user_id.clone())
            .with_field("MEMBERS", member_set.into_iter().collect::<Vec<_>>().join(","))
            .with_field("NAME", name)
            .with_field("UPDATED_AT", chrono::Utc::now().timestamp().to_string())
            .with_field("TOKEN", token.encode());
        let _ = transport.send_broadcast(&frame.encode()).await;
        false
    }

    async fn cmd_send_group_chat(&mut self, transport: &Transport, group_id: String, text: String) -> bool {
        let targets = self.groups.fan_out_targets(&group_id, &self.identity.user_id);
        let message_id = self.new_message_id();
        self.groups.record_message(&group_id, &message_id, &self.identity.user_id, &text);
        let token = self.tokens.mint(self.identity.user_id.clone(), Scope::Chat, self.config.token_ttl_secs);
        for target in targets {
            let Some((_, ip)) = crate::peer::split_user_id(&target) else { continue };
            let Ok(dest) = format!("{ip}:{}", self.config.port).parse() else { continue };
            let frame = Frame::new(FrameType::GroupChat)
                .with_field("MESSAGE_ID", message_id.clone())
                .with_field("GROUP_ID", group_id.clone())
                .with_field("FROM", self.identity.user_id.clone())
                .with_field("TO", target)
                .with_field("TOKEN", token.encode())
                .with_body(text.clone().into_bytes());
            self.send_reliable(transport, dest, frame, message_id.clone(), PendingKind::GroupChat { group_id: group_id.clone() }).await;
        }
        false
    }

    async fn cmd_offer_file(&mut self, transport: &Transport, peer: String, filename: String, data: Vec<u8>) -> bool {
        let Some((_, ip)) = crate::peer::split_user_id(&peer) else { return false };
        let Ok(dest) = format!("{ip}:{}", self.config.port).parse() else { return false };
        let transfer_id = self.new_message_id();
        let chunk_size = self.config.file_chunk_size;
        let size = data.len() as u64;
        let chunk_count = file_transfer::chunks_total_for(size, chunk_size);
        let transfer = FileTransfer::new_outgoing(transfer_id.clone(), peer.clone(), filename.clone(), data, chunk_size);
        self.transfers.insert(transfer_id.clone(), transfer);
        let message_id = self.new_message_id();
        let token = self.tokens.mint(self.identity.user_id.clone(), Scope::File, self.config.token_ttl_secs);
        let frame = Frame::new(FrameType::FileOffer)
            .with_field("TRANSFER_ID", transfer_id.clone())
            .with_field("FROM", self.identity.user_id.clone())
            .with_field("TO", peer)
            .with_field("FILENAME", filename)
            .with_field("SIZE", size.to_string())
            .with_field("CHUNK_SIZE", chunk_size.to_string())
            .with_field("CHUNK_COUNT", chunk_count.to_string())
            .with_field("MESSAGE_ID", message_id.clone())
            .with_field("TOKEN", token.encode());
        self.send_reliable(transport, dest, frame, message_id, PendingKind::Generic).await;
        false
    }

    async fn cmd_accept_file(&mut self, transport: &Transport, transfer_id: String) -> bool {
        let Some(transfer) = self.transfers.get_mut(&transfer_id) else { return false };
        transfer.accept();
        let Some((_, ip)) = crate::peer::split_user_id(&transfer.peer) else { return false };
        let Ok(dest) = format!("{ip}:{}", self.config.port).parse() else { return false };
        let message_id = self.new_message_id();
        let token = self.tokens.mint(self.identity.user_id.clone(), Scope::File, self.config.token_ttl_secs);
        let frame = Frame::new(FrameType::FileAccept)
            .with_field("TRANSFER_ID", transfer_id.clone())
            .with_field("FROM", self.identity.user_id.clone())
            .with_field("MESSAGE_ID", message_id.clone())
            .with_field("TOKEN", token.encode());
        self.send_reliable(transport, dest, frame, message_id, PendingKind::Generic).await;
        false
    }

    async fn cmd_reject_file(&mut self, transport: &Transport, transfer_id: String) -> bool {
        let Some(transfer) = self.transfers.get_mut(&transfer_id) else { return false };
        transfer.fail();
        let Some((_, ip)) = crate::peer::split_user_id(&transfer.peer) else { return false };
        let Ok(dest) = format!("{ip}:{}", self.config.port).parse() else { return false };
        let message_id = self.new_message_id();
        let token = self.tokens.mint(self.identity.user_id.clone(), Scope::File, self.config.token_ttl_secs);
        let frame = Frame::new(FrameType::FileReject)
            .with_field("TRANSFER_ID", transfer_id.clone())
            .with_field("FROM", self.identity.user_id.clone())
            .with_field("MESSAGE_ID", message_id.clone())
            .with_field("TOKEN", token.encode());
        self.send_reliable(transport, dest, frame, message_id, PendingKind::Generic).await;
        false
    }

    async fn cmd_invite_game(&mut self, transport: &Transport, peer: String) -> bool {
        let Some((_, ip)) = crate::peer::split_user_id(&peer) else { return false };
        let Ok(dest) = format!("{ip}:{}", self.config.port).parse() else { return false };
        let game_id = self.new_message_id();
        let game = Game::new(game_id.clone(), peer.clone(), Symbol::X);
        self.games.insert(game_id.clone(), game);
        let message_id = self.new_message_id();
        let token = self.tokens.mint(self.identity.user_id.clone(), Scope::Game, self.config.token_ttl_secs);
        let frame = Frame::new(FrameType::GameInvite)
            .with_field("GAME_ID", game_id)
            .with_field("FROM", self.identity.user_id.clone())
            .with_field("TO", peer)
            .with_field("SYMBOL", Symbol::X.as_str())
            .with_field("MESSAGE_ID", message_id.clone())
            .with_field("TOKEN", token.encode());
        self.send_reliable(transport, dest, frame, message_id, PendingKind::Generic).await;
        false
    }

    async fn cmd_submit_move(&mut self, transport: &Transport, game_id: String, position: usize) -> bool {
        let Some(game) = self.games.get_mut(&game_id) else { return false };
        let player = game.symbol;
        let move_no = game.move_no + 1;
        if game.apply_move(position, player, move_no).is_err() {
            return false;
        }
        let opponent = game.opponent.clone();
        let result = game.state;
        let Some((_, ip)) = crate::peer::split_user_id(&opponent) else { return false };
        let Ok(dest) = format!("{ip}:{}", self.config.port).parse() else { return false };
        let message_id = self.new_message_id();
        let token = self.tokens.mint(self.identity.user_id.clone(), Scope::Game, self.config.token_ttl_secs);
        let frame = Frame::new(FrameType::GameMove)
            .with_field("GAME_ID", game_id.clone())
            .with_field("MOVE_NO", move_no.to_string())
            .with_field("POSITION", position.to_string())
            .with_field("PLAYER", player.as_str())
            .with_field("MESSAGE_ID", message_id.clone())
            .with_field("TOKEN", token.encode());
        self.send_reliable(transport, dest, frame, message_id, PendingKind::Generic).await;
        self.emit(UiEvent::GameMoveApplied { game_id: game_id.clone(), position, player: player.as_str().to_string() });
        if let GameState::Won(_) | GameState::Drawn = result {
            self.emit(UiEvent::GameEnded { game_id, result });
        }
        false
    }

    async fn on_shutdown(&mut self, transport: &Transport) {
        let revoke = presence::build_revoke_frame(&self.identity);
        let _ = transport.send_broadcast(&revoke.encode()).await;
    }
}

/// GAME_RESYNC is `game`-scoped (spec §6.2); the caller mints the token so
/// this stays a pure frame builder.
fn build_resync_frame(game_id: &str, game: &Game, token: &Token) -> Frame {
    Frame::new(FrameType::GameResync)
        .with_field("GAME_ID", game_id)
        .with_field("MOVE_NO", game.move_no.to_string())
        .with_field("TURN", game.turn.as_str())
        .with_field("IS_X", (game.symbol == Symbol::X).to_string())
        .with_field("BOARD", encode_board(&game.board))
        .with_field("TOKEN", token.encode())
}

fn encode_board(board: &[Option<Symbol>; 9]) -> String {
    board
        .iter()
        .map(|cell| match cell {
            Some(Symbol::X) => "X",
            Some(Symbol::O) => "O",
            None => "_",
        })
        .collect::<Vec<_>>()
        .join("")
}

fn parse_board(s: &str) -> Option<[Option<Symbol>; 9]> {
    if s.len() != 9 {
        return None;
    }
    let mut board = [None; 9];
    for (i, c) in s.chars().enumerate() {
        board[i] = match c {
            'X' => Some(Symbol::X),
            'O' => Some(Symbol::O),
            '_' => None,
            _ => return None,
        };
    }
    Some(board)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_encoding_roundtrips() {
        let mut board = [None; 9];
        board[0] = Some(Symbol::X);
        board[4] = Some(Symbol::O);
        let encoded = encode_board(&board);
        assert_eq!(encoded, "X___O____");
        assert_eq!(parse_board(&encoded).unwrap(), board);
    }

    #[test]
    fn parse_board_rejects_wrong_length() {
        assert!(parse_board("XXX").is_none());
    }
}
