//! UI adapter contract (component L).
//!
//! Command/event surface exposed to the out-of-scope terminal UI (spec
//! §6.4), modeled directly on `P2pCommand`/`P2pEvent`/`P2pHandle` in
//! `crates/sven-p2p/src/node.rs`: a cloneable handle wraps an `mpsc`
//! command sender and a `broadcast` event sender so any number of UI
//! surfaces can subscribe.

use tokio::sync::{broadcast, mpsc};

use crate::error::{LsnpError, Result};
use crate::file_transfer::TransferState;
use crate::game::GameState;
use crate::messaging::DeliveryState;
use crate::peer::PeerStatus;

/// Commands the UI issues to the running node.
#[derive(Debug, Clone)]
pub enum UiCommand {
    SendChat { peer: String, text: String },
    Post { text: String },
    Like { post_id: String },
    CreateGroup { name: String, members: Vec<String> },
    SendGroupChat { group_id: String, text: String },
    OfferFile { peer: String, filename: String, data: Vec<u8> },
    AcceptFile { transfer_id: String },
    RejectFile { transfer_id: String },
    InviteGame { peer: String },
    SubmitMove { game_id: String, position: usize },
    UpdateProfile { display_name: String, status: String },
    Shutdown,
}

/// Events the node pushes out to every UI subscriber.
#[derive(Debug, Clone)]
pub enum UiEvent {
    PeerAdded { user_id: String, display_name: String },
    PeerUpdated { user_id: String, display_name: String, status: PeerStatus },
    PeerRemoved { user_id: String },
    DmReceived { peer: String, text: String },
    DmDeliveryChanged { peer: String, message_id: String, state: DeliveryState },
    PostReceived { post_id: String, author: String, text: String },
    LikeReceived { post_id: String, liker: String },
    GroupMessageReceived { group_id: String, from: String, text: String },
    FileOffered { transfer_id: String, peer: String, filename: String, size: u64 },
    FileProgress { transfer_id: String, chunks_acked: u32, chunks_total: u32 },
    FileCompleted { transfer_id: String },
    FileFailed { transfer_id: String },
    GameInvited { game_id: String, peer: String },
    GameStarted { game_id: String },
    GameMoveApplied { game_id: String, position: usize, player: String },
    GameEnded { game_id: String, result: GameState },
    VerboseLog { message: String },
}

/// Also surfaces file-transfer/game terminal states directly, so a UI can
/// match on them without re-deriving from `TransferState`/`GameState`.
pub fn file_event_for_state(transfer_id: &str, state: TransferState) -> Option<UiEvent> {
    match state {
        TransferState::Completed => Some(UiEvent::FileCompleted { transfer_id: transfer_id.to_string() }),
        TransferState::Failed | TransferState::Cancelled => {
            Some(UiEvent::FileFailed { transfer_id: transfer_id.to_string() })
        }
        _ => None,
    }
}

/// Cheap-to-clone handle to the running node, given out to every UI surface.
#[derive(Clone)]
pub struct UiHandle {
    cmd_tx: mpsc::Sender<UiCommand>,
    event_tx: broadcast::Sender<UiEvent>,
}

impl UiHandle {
    pub fn new(cmd_tx: mpsc::Sender<UiCommand>, event_tx: broadcast::Sender<UiEvent>) -> Self {
        UiHandle { cmd_tx, event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.event_tx.subscribe()
    }

    pub async fn send(&self, command: UiCommand) -> Result<()> {
        self.cmd_tx.send(command).await.map_err(|_| LsnpError::Shutdown)
    }

    pub(crate) fn emit(&self, event: UiEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_sent_and_received() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let (event_tx, _) = broadcast::channel(8);
        let handle = UiHandle::new(cmd_tx, event_tx);
        handle.send(UiCommand::Post { text: "hi".into() }).await.unwrap();
        let received = cmd_rx.recv().await.unwrap();
        assert!(matches!(received, UiCommand::Post { .. }));
    }

    #[tokio::test]
    async fn event_broadcast_to_subscriber() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        let (event_tx, _) = broadcast::channel(8);
        let handle = UiHandle::new(cmd_tx, event_tx);
        let mut sub = handle.subscribe();
        handle.emit(UiEvent::PeerRemoved { user_id: "alice@1.1.1.1".into() });
        let event = sub.recv().await.unwrap();
        assert!(matches!(event, UiEvent::PeerRemoved { .. }));
    }
}
