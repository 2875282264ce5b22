//! Connect Four and Othello engines, plus the move errors every engine
//! shares. Boards serialize as nested arrays of `""`, `"X"`, `"O"`.

use serde::{Deserialize, Serialize};

pub const CONNECT4_ROWS: usize = 6;
pub const CONNECT4_COLS: usize = 7;
pub const OTHELLO_SIZE: usize = 8;

pub type ConnectFourBoard = [[Mark; CONNECT4_COLS]; CONNECT4_ROWS];
pub type OthelloBoard = [[Mark; OTHELLO_SIZE]; OTHELLO_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mark {
    #[default]
    #[serde(rename = "")]
    Empty,
    X,
    O,
}

impl Mark {
    pub fn opponent(self) -> Mark {
        match self {
            Mark::X => Mark::O,
            Mark::O => Mark::X,
            Mark::Empty => Mark::Empty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    InProgress,
    Won(Mark),
    Draw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MoveError {
    #[error("Invalid move location or column full")]
    ColumnUnavailable,
    #[error("Invalid move location")]
    OutOfBounds,
    #[error("Square is occupied")]
    Occupied,
    #[error("Move does not flip any discs")]
    NoFlips,
    #[error("Not your piece")]
    NotYourPiece,
    #[error("Must capture when a jump is available")]
    MustCapture,
    #[error("Must continue jump with the same piece")]
    MustContinueJump,
    #[error("Invalid move")]
    IllegalMove,
    #[error("Cannot fire during the setup phase")]
    SetupPhase,
    #[error("Shot out of bounds")]
    ShotOutOfBounds,
    #[error("Already shot that cell")]
    AlreadyShot,
}

/// Drop `mark` into `column`; it lands on the lowest empty row.
pub fn connect4_drop(board: &mut ConnectFourBoard, column: usize, mark: Mark) -> Result<usize, MoveError> {
    if column >= CONNECT4_COLS || board[0][column] != Mark::Empty {
        return Err(MoveError::ColumnUnavailable);
    }
    let row = (0..CONNECT4_ROWS)
        .rev()
        .find(|&r| board[r][column] == Mark::Empty)
        .ok_or(MoveError::ColumnUnavailable)?;
    board[row][column] = mark;
    Ok(row)
}

pub fn connect4_outcome(board: &ConnectFourBoard) -> Outcome {
    const DIRECTIONS: [(isize, isize); 4] = [(0, 1), (1, 0), (1, 1), (-1, 1)];

    for r in 0..CONNECT4_ROWS {
        for c in 0..CONNECT4_COLS {
            let mark = board[r][c];
            if mark == Mark::Empty {
                continue;
            }
            for (dr, dc) in DIRECTIONS {
                let four = (1..4).all(|step| {
                    let rr = r as isize + dr * step;
                    let cc = c as isize + dc * step;
                    (0..CONNECT4_ROWS as isize).contains(&rr)
                        && (0..CONNECT4_COLS as isize).contains(&cc)
                        && board[rr as usize][cc as usize] == mark
                });
                if four {
                    return Outcome::Won(mark);
                }
            }
        }
    }

    if board[0].iter().all(|&m| m != Mark::Empty) {
        Outcome::Draw
    } else {
        Outcome::InProgress
    }
}

const OTHELLO_DIRECTIONS: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

pub fn othello_initial() -> OthelloBoard {
    let mut board = OthelloBoard::default();
    board[3][3] = Mark::O;
    board[3][4] = Mark::X;
    board[4][3] = Mark::X;
    board[4][4] = Mark::O;
    board
}

fn in_bounds(r: isize, c: isize) -> bool {
    (0..OTHELLO_SIZE as isize).contains(&r) && (0..OTHELLO_SIZE as isize).contains(&c)
}

/// Squares flipped by placing `mark` at (`row`, `col`).
fn othello_flips(board: &OthelloBoard, row: usize, col: usize, mark: Mark) -> Vec<(usize, usize)> {
    let opponent = mark.opponent();
    let mut flips = Vec::new();
    for (dr, dc) in OTHELLO_DIRECTIONS {
        let mut run = Vec::new();
        let (mut r, mut c) = (row as isize + dr, col as isize + dc);
        while in_bounds(r, c) && board[r as usize][c as usize] == opponent {
            run.push((r as usize, c as usize));
            r += dr;
            c += dc;
        }
        if !run.is_empty() && in_bounds(r, c) && board[r as usize][c as usize] == mark {
            flips.extend(run);
        }
    }
    flips
}

pub fn othello_can_move(board: &OthelloBoard, row: usize, col: usize, mark: Mark) -> bool {
    row < OTHELLO_SIZE
        && col < OTHELLO_SIZE
        && board[row][col] == Mark::Empty
        && !othello_flips(board, row, col, mark).is_empty()
}

pub fn othello_has_move(board: &OthelloBoard, mark: Mark) -> bool {
    (0..OTHELLO_SIZE).any(|r| (0..OTHELLO_SIZE).any(|c| othello_can_move(board, r, c, mark)))
}

/// Place a disc and flip the bracketed runs. Returns the number flipped.
pub fn othello_play(board: &mut OthelloBoard, row: usize, col: usize, mark: Mark) -> Result<usize, MoveError> {
    if row >= OTHELLO_SIZE || col >= OTHELLO_SIZE {
        return Err(MoveError::OutOfBounds);
    }
    if board[row][col] != Mark::Empty {
        return Err(MoveError::Occupied);
    }
    let flips = othello_flips(board, row, col, mark);
    if flips.is_empty() {
        return Err(MoveError::NoFlips);
    }
    board[row][col] = mark;
    for &(r, c) in &flips {
        board[r][c] = mark;
    }
    Ok(flips.len())
}

/// Finished only when neither side can move; the larger disc count wins.
pub fn othello_outcome(board: &OthelloBoard) -> Outcome {
    if othello_has_move(board, Mark::X) || othello_has_move(board, Mark::O) {
        return Outcome::InProgress;
    }
    let count = |mark| board.iter().flatten().filter(|&&m| m == mark).count();
    let (x, o) = (count(Mark::X), count(Mark::O));
    match x.cmp(&o) {
        std::cmp::Ordering::Greater => Outcome::Won(Mark::X),
        std::cmp::Ordering::Less => Outcome::Won(Mark::O),
        std::cmp::Ordering::Equal => Outcome::Draw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discs_stack_from_the_bottom() {
        let mut board = ConnectFourBoard::default();
        assert_eq!(connect4_drop(&mut board, 3, Mark::X).unwrap(), 5);
        assert_eq!(connect4_drop(&mut board, 3, Mark::O).unwrap(), 4);
        assert_eq!(board[5][3], Mark::X);
        assert_eq!(board[4][3], Mark::O);
    }

    #[test]
    fn full_column_and_out_of_range_are_rejected() {
        let mut board = ConnectFourBoard::default();
        for i in 0..CONNECT4_ROWS {
            let mark = if i % 2 == 0 { Mark::X } else { Mark::O };
            connect4_drop(&mut board, 0, mark).unwrap();
        }
        assert_eq!(connect4_drop(&mut board, 0, Mark::X), Err(MoveError::ColumnUnavailable));
        assert_eq!(connect4_drop(&mut board, 7, Mark::X), Err(MoveError::ColumnUnavailable));
    }

    #[test]
    fn detects_lines_in_every_direction() {
        let mut horizontal = ConnectFourBoard::default();
        for c in 1..5 {
            horizontal[5][c] = Mark::X;
        }
        assert_eq!(connect4_outcome(&horizontal), Outcome::Won(Mark::X));

        let mut vertical = ConnectFourBoard::default();
        for r in 2..6 {
            vertical[r][6] = Mark::O;
        }
        assert_eq!(connect4_outcome(&vertical), Outcome::Won(Mark::O));

        let mut rising = ConnectFourBoard::default();
        for i in 0..4 {
            rising[5 - i][i] = Mark::X;
        }
        assert_eq!(connect4_outcome(&rising), Outcome::Won(Mark::X));

        let mut falling = ConnectFourBoard::default();
        for i in 0..4 {
            falling[i + 2][i + 3] = Mark::O;
        }
        assert_eq!(connect4_outcome(&falling), Outcome::Won(Mark::O));
    }

    #[test]
    fn full_top_row_without_line_is_draw() {
        let pattern = [Mark::X, Mark::X, Mark::O, Mark::O];
        let mut board = ConnectFourBoard::default();
        for r in 0..CONNECT4_ROWS {
            for c in 0..CONNECT4_COLS {
                let shift = if r == 3 { 2 } else { 0 };
                board[r][c] = pattern[(c + shift) % 4];
            }
        }
        assert_eq!(connect4_outcome(&board), Outcome::Draw);
    }

    #[test]
    fn board_serializes_as_string_grid() {
        let mut board = ConnectFourBoard::default();
        board[5][0] = Mark::X;
        let json = serde_json::to_value(board).unwrap();
        assert_eq!(json[5][0], "X");
        assert_eq!(json[0][0], "");
        let back: ConnectFourBoard = serde_json::from_value(json).unwrap();
        assert_eq!(back, board);
    }

    #[test]
    fn othello_opening_moves() {
        let board = othello_initial();
        assert!(othello_can_move(&board, 2, 3, Mark::X));
        assert!(!othello_can_move(&board, 0, 0, Mark::X));
        assert!(!othello_can_move(&board, 3, 3, Mark::X));

        let mut board = board;
        assert_eq!(othello_play(&mut board, 2, 3, Mark::X).unwrap(), 1);
        assert_eq!(board[3][3], Mark::X);
        assert_eq!(othello_play(&mut board, 0, 0, Mark::O), Err(MoveError::NoFlips));
        assert_eq!(othello_outcome(&board), Outcome::InProgress);
    }

    #[test]
    fn othello_flips_multiple_directions() {
        let mut board = OthelloBoard::default();
        board[0][0] = Mark::X;
        board[1][1] = Mark::O;
        board[0][2] = Mark::X;
        board[1][2] = Mark::O;
        assert_eq!(othello_play(&mut board, 2, 2, Mark::X).unwrap(), 2);
        assert_eq!(board[1][1], Mark::X);
        assert_eq!(board[1][2], Mark::X);
    }

    #[test]
    fn othello_ends_when_nobody_can_move() {
        let mut board = OthelloBoard::default();
        board[0][0] = Mark::X;
        board[0][1] = Mark::X;
        board[7][7] = Mark::O;
        assert_eq!(othello_outcome(&board), Outcome::Won(Mark::X));

        board[7][6] = Mark::O;
        assert_eq!(othello_outcome(&board), Outcome::Draw);
    }
}
