//! Tic-tac-toe session protocol (component K).
//!
//! No teacher or pack file implements this game; the board/turn
//! bookkeeping is original to this crate, kept deliberately small and
//! `match`-driven in the same spirit as the teacher's command handling in
//! `crates/sven-p2p/src/node.rs`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    X,
    O,
}

impl Symbol {
    pub fn other(self) -> Symbol {
        match self {
            Symbol::X => Symbol::O,
            Symbol::O => Symbol::X,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Symbol::X => "X",
            Symbol::O => "O",
        }
    }

    pub fn parse(s: &str) -> Option<Symbol> {
        match s {
            "X" => Some(Symbol::X),
            "O" => Some(Symbol::O),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    Invited,
    Active,
    Won(Symbol),
    Drawn,
    Abandoned,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Game {
    pub game_id: String,
    pub opponent: String,
    /// This node's own symbol.
    pub symbol: Symbol,
    pub board: [Option<Symbol>; 9],
    pub turn: Symbol,
    pub state: GameState,
    pub move_no: u32,
}

/// Why a move was rejected (spec §4.10: out-of-range position, occupied
/// cell, wrong-turn symbol, or a `MOVE_NO` that doesn't continue the local
/// sequence — all trigger the RESYNC path rather than silently dropping).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveRejection {
    OutOfRange,
    CellOccupied,
    WrongTurn,
    MoveNoMismatch,
    GameNotActive,
}

const WIN_LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

impl Game {
    /// Inviter's view: `self.symbol` is whatever the invite carried
    /// (default X); X always moves first regardless of who the local
    /// player is.
    pub fn new(game_id: impl Into<String>, opponent: impl Into<String>, symbol: Symbol) -> Self {
        Game {
            game_id: game_id.into(),
            opponent: opponent.into(),
            symbol,
            board: [None; 9],
            turn: Symbol::X,
            state: GameState::Invited,
            move_no: 0,
        }
    }

    pub fn activate(&mut self) {
        if self.state == GameState::Invited {
            self.state = GameState::Active;
        }
    }

    pub fn cancel(&mut self) {
        self.state = GameState::Cancelled;
    }

    pub fn abandon(&mut self) {
        if self.state == GameState::Active {
            self.state = GameState::Abandoned;
        }
    }

    /// Validate and, if valid, apply a move. On success returns `Ok(())`
    /// and the board/turn/move_no are updated (invariant iv: a cell
    /// transitions empty -> {X,O} exactly once). On failure returns the
    /// rejection reason and leaves state untouched — caller sends RESYNC.
    pub fn apply_move(&mut self, position: usize, player: Symbol, move_no: u32) -> Result<(), MoveRejection> {
        if self.state != GameState::Active {
            return Err(MoveRejection::GameNotActive);
        }
        if position >= 9 {
            return Err(MoveRejection::OutOfRange);
        }
        if self.board[position].is_some() {
            return Err(MoveRejection::CellOccupied);
        }
        if player != self.turn {
            return Err(MoveRejection::WrongTurn);
        }
        if move_no != self.move_no + 1 {
            return Err(MoveRejection::MoveNoMismatch);
        }

        self.board[position] = Some(player);
        self.move_no = move_no;
        self.turn = player.other();

        match self.detect_result() {
            Some(GameState::Won(winner)) => self.state = GameState::Won(winner),
            Some(GameState::Drawn) => self.state = GameState::Drawn,
            _ => {}
        }
        Ok(())
    }

    /// Local, deterministic win/draw detection (spec §8 invariant 4: two
    /// peers with identical accepted-move sequences reach bit-identical
    /// results independently).
    pub fn detect_result(&self) -> Option<GameState> {
        for line in WIN_LINES {
            let [a, b, c] = line;
            if let (Some(x), Some(y), Some(z)) = (self.board[a], self.board[b], self.board[c]) {
                if x == y && y == z {
                    return Some(GameState::Won(x));
                }
            }
        }
        if self.board.iter().all(|c| c.is_some()) {
            return Some(GameState::Drawn);
        }
        None
    }

    /// Reconcile against a remote snapshot presented in a RESYNC frame, per
    /// the policy documented in DESIGN.md: higher `move_no` wins; on a tie
    /// the inviter's (X's) snapshot is authoritative.
    ///
    /// Returns `true` if this side adopted the remote snapshot.
    pub fn reconcile(&mut self, remote_move_no: u32, remote_board: [Option<Symbol>; 9], remote_turn: Symbol, remote_is_x: bool) -> bool {
        let adopt = remote_move_no > self.move_no
            || (remote_move_no == self.move_no && remote_is_x && self.symbol != Symbol::X);
        if adopt {
            self.move_no = remote_move_no;
            self.board = remote_board;
            self.turn = remote_turn;
            if let Some(result) = self.detect_result() {
                self.state = result;
            }
        }
        adopt
    }
}
