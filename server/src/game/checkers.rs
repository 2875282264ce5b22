//! American checkers on an 8x8 board. The creator plays red (`r`, crowned
//! `R`) from the bottom rows toward row 0; the opponent plays black (`b`,
//! `B`) toward row 7. Captures are mandatory and a capturing piece keeps
//! jumping until it runs out of captures or is crowned.

use serde::{Deserialize, Serialize};

use super::board::{Mark, MoveError, Outcome};

pub const CHECKERS_SIZE: usize = 8;

pub type CheckersBoard = [[Piece; CHECKERS_SIZE]; CHECKERS_SIZE];
pub type Square = [usize; 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Piece {
    #[default]
    #[serde(rename = "")]
    Empty,
    #[serde(rename = "r")]
    Red,
    #[serde(rename = "b")]
    Black,
    #[serde(rename = "R")]
    RedKing,
    #[serde(rename = "B")]
    BlackKing,
}

impl Piece {
    /// Red belongs to the creator (`X`), black to the opponent (`O`).
    pub fn owner(self) -> Mark {
        match self {
            Piece::Red | Piece::RedKing => Mark::X,
            Piece::Black | Piece::BlackKing => Mark::O,
            Piece::Empty => Mark::Empty,
        }
    }

    fn is_king(self) -> bool {
        matches!(self, Piece::RedKing | Piece::BlackKing)
    }

    fn crowned(self) -> Piece {
        match self {
            Piece::Red => Piece::RedKing,
            Piece::Black => Piece::BlackKing,
            other => other,
        }
    }

    fn directions(self) -> &'static [(isize, isize)] {
        match self {
            Piece::RedKing | Piece::BlackKing => &[(-1, -1), (-1, 1), (1, -1), (1, 1)],
            Piece::Red => &[(-1, -1), (-1, 1)],
            Piece::Black => &[(1, -1), (1, 1)],
            Piece::Empty => &[],
        }
    }
}

/// Persisted room state. `must_jump_from` pins the piece that is midway
/// through a multi-jump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckersState {
    pub board: CheckersBoard,
    #[serde(default)]
    pub must_jump_from: Option<Square>,
}

impl Default for CheckersState {
    fn default() -> Self {
        Self {
            board: initial_board(),
            must_jump_from: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CheckersMove {
    pub from: Square,
    pub to: Square,
}

/// Twelve pieces a side on the dark squares of the three home rows.
pub fn initial_board() -> CheckersBoard {
    let mut board = CheckersBoard::default();
    for (r, row) in board.iter_mut().enumerate() {
        for (c, cell) in row.iter_mut().enumerate() {
            if (r + c) % 2 == 0 {
                continue;
            }
            if r < 3 {
                *cell = Piece::Black;
            } else if r > 4 {
                *cell = Piece::Red;
            }
        }
    }
    board
}

fn step(from: Square, dr: isize, dc: isize, n: isize) -> Option<Square> {
    let r = from[0] as isize + dr * n;
    let c = from[1] as isize + dc * n;
    let range = 0..CHECKERS_SIZE as isize;
    (range.contains(&r) && range.contains(&c)).then_some([r as usize, c as usize])
}

fn at(board: &CheckersBoard, sq: Square) -> Piece {
    board[sq[0]][sq[1]]
}

/// Landing squares reachable by capturing from `from`.
pub fn jumps(board: &CheckersBoard, from: Square) -> Vec<Square> {
    let piece = at(board, from);
    let enemy = piece.owner().opponent();
    piece
        .directions()
        .iter()
        .filter_map(|&(dr, dc)| {
            let over = step(from, dr, dc, 1)?;
            let landing = step(from, dr, dc, 2)?;
            (at(board, over).owner() == enemy && at(board, landing) == Piece::Empty).then_some(landing)
        })
        .collect()
}

pub fn simple_moves(board: &CheckersBoard, from: Square) -> Vec<Square> {
    let piece = at(board, from);
    piece
        .directions()
        .iter()
        .filter_map(|&(dr, dc)| step(from, dr, dc, 1))
        .filter(|&to| at(board, to) == Piece::Empty)
        .collect()
}

fn squares_of(board: &CheckersBoard, side: Mark) -> impl Iterator<Item = Square> + '_ {
    (0..CHECKERS_SIZE)
        .flat_map(|r| (0..CHECKERS_SIZE).map(move |c| [r, c]))
        .filter(move |&sq| at(board, sq).owner() == side)
}

pub fn has_any_jump(board: &CheckersBoard, side: Mark) -> bool {
    squares_of(board, side).any(|sq| !jumps(board, sq).is_empty())
}

pub fn has_any_move(board: &CheckersBoard, side: Mark) -> bool {
    squares_of(board, side).any(|sq| !jumps(board, sq).is_empty() || !simple_moves(board, sq).is_empty())
}

/// Apply `side`'s move. Returns `true` when the same piece must keep jumping.
pub fn play(state: &mut CheckersState, side: Mark, mv: CheckersMove) -> Result<bool, MoveError> {
    let (from, to) = (mv.from, mv.to);
    if from.iter().chain(to.iter()).any(|&i| i >= CHECKERS_SIZE) {
        return Err(MoveError::OutOfBounds);
    }
    if state.must_jump_from.is_some_and(|pinned| pinned != from) {
        return Err(MoveError::MustContinueJump);
    }
    let piece = at(&state.board, from);
    if piece.owner() != side || side == Mark::Empty {
        return Err(MoveError::NotYourPiece);
    }

    let board = &mut state.board;
    if jumps(board, from).contains(&to) {
        let over = [(from[0] + to[0]) / 2, (from[1] + to[1]) / 2];
        board[from[0]][from[1]] = Piece::Empty;
        board[over[0]][over[1]] = Piece::Empty;
        let promoted = land(board, piece, to);
        // Crowning ends the turn even if the new king could jump again.
        let again = !promoted && !jumps(board, to).is_empty();
        state.must_jump_from = again.then_some(to);
        return Ok(again);
    }

    if state.must_jump_from.is_some() {
        return Err(MoveError::MustContinueJump);
    }
    if has_any_jump(board, side) {
        return Err(MoveError::MustCapture);
    }
    if !simple_moves(board, from).contains(&to) {
        return Err(MoveError::IllegalMove);
    }
    board[from[0]][from[1]] = Piece::Empty;
    land(board, piece, to);
    Ok(false)
}

/// Put `piece` on `to`, crowning it on the far row. Returns whether it was crowned.
fn land(board: &mut CheckersBoard, piece: Piece, to: Square) -> bool {
    let last_row = if piece.owner() == Mark::X { 0 } else { CHECKERS_SIZE - 1 };
    let promote = !piece.is_king() && to[0] == last_row;
    board[to[0]][to[1]] = if promote { piece.crowned() } else { piece };
    promote
}

/// Checked for the side about to move: no pieces or no legal move loses.
pub fn outcome(board: &CheckersBoard, to_move: Mark) -> Outcome {
    if has_any_move(board, to_move) {
        Outcome::InProgress
    } else {
        Outcome::Won(to_move.opponent())
    }
}
