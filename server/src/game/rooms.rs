//! GameRoom state machine: Pending -> Active -> Finished, with Cancelled
//! reachable from Pending or Active.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::battleship::{BattleshipState, Phase, PlaceShips, Shot};
use super::board::{self, ConnectFourBoard, Mark, OthelloBoard, Outcome};
use super::checkers::{self, CheckersMove, CheckersState};
use super::ActionError;
use crate::repo::{GameRoom, GameStatus, GameType, UserId};

#[derive(Debug, Deserialize)]
struct ConnectFourMove {
    column: usize,
}

#[derive(Debug, Deserialize)]
struct OthelloMove {
    row: usize,
    column: usize,
}

/// Board JSON for a freshly created room.
pub fn initial_state(game_type: GameType) -> Value {
    match game_type {
        GameType::Connect4 => json!(ConnectFourBoard::default()),
        GameType::Othello => json!(board::othello_initial()),
        GameType::Checkers => json!(CheckersState::default()),
        GameType::Battleship => json!(BattleshipState::default()),
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, ActionError> {
    serde_json::from_value(payload.clone()).map_err(|_| ActionError::InvalidMoveFormat)
}

fn is_blank(state: &Value) -> bool {
    match state {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

impl GameRoom {
    /// Pending and untouched for longer than `max_idle`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_idle: chrono::Duration) -> bool {
        self.status == GameStatus::Pending && now - self.updated_at > max_idle
    }

    pub fn cancel(&mut self) {
        self.status = GameStatus::Cancelled;
        self.opponent_id = None;
        self.winner_id = None;
        self.next_turn_id = None;
    }

    /// Seat `user_id` as the opponent; the creator moves first.
    pub fn start(&mut self, user_id: UserId) -> Result<(), ActionError> {
        if self.status != GameStatus::Pending {
            return Err(ActionError::NotJoinable);
        }
        if self.creator_id == user_id {
            return Err(ActionError::CreatorCannotJoin);
        }
        self.opponent_id = Some(user_id);
        self.status = GameStatus::Active;
        self.next_turn_id = Some(self.creator_id);
        Ok(())
    }

    pub fn mark_for(&self, user_id: UserId) -> Mark {
        if self.opponent_id == Some(user_id) {
            Mark::O
        } else {
            Mark::X
        }
    }

    fn user_for(&self, mark: Mark) -> Option<UserId> {
        match mark {
            Mark::X => Some(self.creator_id),
            Mark::O => self.opponent_id,
            Mark::Empty => None,
        }
    }

    fn other_player(&self, user_id: UserId) -> Option<UserId> {
        if user_id == self.creator_id {
            self.opponent_id
        } else {
            Some(self.creator_id)
        }
    }

    /// Apply `user_id`'s move and advance the turn or finish the game.
    pub fn apply_move(&mut self, user_id: UserId, payload: &Value) -> Result<(), ActionError> {
        if self.status != GameStatus::Active || self.next_turn_id != Some(user_id) {
            return Err(ActionError::NotYourTurn);
        }
        let mark = self.mark_for(user_id);

        match self.game_type {
            GameType::Connect4 => {
                let mv: ConnectFourMove = decode(payload)?;
                let mut grid = self.connect4_board()?;
                board::connect4_drop(&mut grid, mv.column, mark)?;
                self.current_state = json!(grid);
                let outcome = board::connect4_outcome(&grid);
                let next = self.other_player(user_id);
                self.advance(user_id, outcome, next);
            }
            GameType::Othello => {
                let mv: OthelloMove = decode(payload)?;
                let mut grid = self.othello_board()?;
                board::othello_play(&mut grid, mv.row, mv.column, mark)?;
                self.current_state = json!(grid);
                let outcome = board::othello_outcome(&grid);
                // A player without a legal move passes.
                let next = if board::othello_has_move(&grid, mark.opponent()) {
                    self.other_player(user_id)
                } else {
                    Some(user_id)
                };
                self.advance(user_id, outcome, next);
            }
            GameType::Checkers => {
                let mv: CheckersMove = decode(payload)?;
                let mut state = self.checkers_state()?;
                let again = checkers::play(&mut state, mark, mv)?;
                self.current_state = json!(state);
                // A piece midway through a multi-jump keeps the turn.
                let (outcome, next) = if again {
                    (Outcome::InProgress, Some(user_id))
                } else {
                    (checkers::outcome(&state.board, mark.opponent()), self.other_player(user_id))
                };
                self.advance(user_id, outcome, next);
            }
            GameType::Battleship => {
                let shot: Shot = decode(payload)?;
                let mut state = self.battleship_state()?;
                state.fire(mark, shot)?;
                self.current_state = json!(state);
                let next = self.other_player(user_id);
                self.advance(user_id, state.outcome(), next);
            }
        }
        Ok(())
    }

    /// Record `user_id`'s fleet. The battle starts with the creator's shot
    /// once both fleets are down.
    pub fn place_ships(&mut self, user_id: UserId, payload: &Value) -> Result<(), ActionError> {
        if self.game_type != GameType::Battleship {
            return Err(ActionError::NotBattleship);
        }
        if !self.is_participant(user_id) {
            return Err(ActionError::NotParticipant);
        }
        if self.status != GameStatus::Active {
            return Err(ActionError::NotActive);
        }
        let PlaceShips { ships } = decode(payload)?;
        let mut state = self.battleship_state()?;
        if !state.place(self.mark_for(user_id), ships)? {
            return Err(ActionError::ShipsAlreadyPlaced);
        }
        if state.phase == Phase::Battle {
            self.next_turn_id = Some(self.creator_id);
        }
        self.current_state = json!(state);
        Ok(())
    }

    fn advance(&mut self, user_id: UserId, outcome: Outcome, next: Option<UserId>) {
        match outcome {
            Outcome::InProgress => self.next_turn_id = next.or(Some(user_id)),
            Outcome::Won(mark) => {
                self.status = GameStatus::Finished;
                self.winner_id = self.user_for(mark);
            }
            Outcome::Draw => {
                self.status = GameStatus::Finished;
                self.is_draw = true;
            }
        }
    }

    pub fn connect4_board(&self) -> Result<ConnectFourBoard, ActionError> {
        if is_blank(&self.current_state) {
            return Ok(ConnectFourBoard::default());
        }
        serde_json::from_value(self.current_state.clone()).map_err(|_| ActionError::CorruptState)
    }

    pub fn othello_board(&self) -> Result<OthelloBoard, ActionError> {
        if is_blank(&self.current_state) {
            return Ok(board::othello_initial());
        }
        serde_json::from_value(self.current_state.clone()).map_err(|_| ActionError::CorruptState)
    }

    pub fn checkers_state(&self) -> Result<CheckersState, ActionError> {
        if is_blank(&self.current_state) {
            return Ok(CheckersState::default());
        }
        serde_json::from_value(self.current_state.clone()).map_err(|_| ActionError::CorruptState)
    }

    pub fn battleship_state(&self) -> Result<BattleshipState, ActionError> {
        if is_blank(&self.current_state) {
            return Ok(BattleshipState::default());
        }
        serde_json::from_value(self.current_state.clone()).map_err(|_| ActionError::CorruptState)
    }

    /// Board as both players may see it. Battleship fleets stay hidden.
    pub fn public_state(&self) -> Value {
        match self.game_type {
            GameType::Battleship => match self.battleship_state() {
                Ok(state) => state.public_view(),
                Err(_) => Value::Null,
            },
            _ => self.current_state.clone(),
        }
    }

    /// The room as sent to clients, with `current_state` replaced by
    /// [`GameRoom::public_state`].
    pub fn redacted(mut self) -> Self {
        self.current_state = self.public_state();
        self
    }

    /// Payload of a `game_state` event.
    pub fn state_payload(&self) -> Value {
        json!({
            "board": self.public_state(),
            "status": self.status,
            "winner_id": self.winner_id,
            "next_turn": self.next_turn_id,
            "is_draw": self.is_draw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(game_type: GameType) -> GameRoom {
        let now = Utc::now();
        GameRoom {
            id: 1,
            game_type,
            status: GameStatus::Pending,
            creator_id: 10,
            opponent_id: None,
            winner_id: None,
            next_turn_id: None,
            is_draw: false,
            current_state: initial_state(game_type),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn join_activates_and_gives_creator_first_turn() {
        let mut room = room(GameType::Connect4);
        assert!(matches!(room.start(10), Err(ActionError::CreatorCannotJoin)));
        room.start(20).unwrap();
        assert_eq!(room.status, GameStatus::Active);
        assert_eq!(room.opponent_id, Some(20));
        assert_eq!(room.next_turn_id, Some(10));
        assert!(matches!(room.start(30), Err(ActionError::NotJoinable)));
    }

    #[test]
    fn moves_alternate_and_out_of_turn_is_rejected() {
        let mut room = room(GameType::Connect4);
        room.start(20).unwrap();

        assert!(matches!(
            room.apply_move(20, &json!({"column": 0})),
            Err(ActionError::NotYourTurn)
        ));
        room.apply_move(10, &json!({"column": 0})).unwrap();
        assert_eq!(room.next_turn_id, Some(20));
        assert!(matches!(
            room.apply_move(20, &json!({"col": 1})),
            Err(ActionError::InvalidMoveFormat)
        ));
        assert_eq!(room.next_turn_id, Some(20));
    }

    #[test]
    fn four_in_a_row_finishes_with_winner() {
        let mut room = room(GameType::Connect4);
        room.start(20).unwrap();
        for column in 0..3 {
            room.apply_move(10, &json!({ "column": column })).unwrap();
            room.apply_move(20, &json!({ "column": column })).unwrap();
        }
        room.apply_move(10, &json!({"column": 3})).unwrap();

        assert_eq!(room.status, GameStatus::Finished);
        assert_eq!(room.winner_id, Some(10));
        assert!(!room.is_draw);
        assert!(matches!(
            room.apply_move(20, &json!({"column": 4})),
            Err(ActionError::NotYourTurn)
        ));
    }

    #[test]
    fn othello_room_starts_with_centre_discs() {
        let room = room(GameType::Othello);
        let grid = room.othello_board().unwrap();
        assert_eq!(grid[3][3], Mark::O);
        assert_eq!(grid[4][4], Mark::O);
        assert_eq!(grid[3][4], Mark::X);
        assert_eq!(grid[4][3], Mark::X);
    }

    #[test]
    fn othello_illegal_move_keeps_turn() {
        let mut room = room(GameType::Othello);
        room.start(20).unwrap();
        assert!(matches!(
            room.apply_move(10, &json!({"row": 0, "column": 0})),
            Err(ActionError::InvalidMove(_))
        ));
        room.apply_move(10, &json!({"row": 2, "column": 3})).unwrap();
        assert_eq!(room.next_turn_id, Some(20));
    }

    #[test]
    fn checkers_multi_jump_keeps_the_turn() {
        let mut room = room(GameType::Checkers);
        room.start(20).unwrap();
        let mut state = CheckersState {
            board: Default::default(),
            must_jump_from: None,
        };
        state.board[6][1] = checkers::Piece::Red;
        state.board[5][2] = checkers::Piece::Black;
        state.board[3][4] = checkers::Piece::Black;
        state.board[0][1] = checkers::Piece::Black;
        room.current_state = json!(state);

        room.apply_move(10, &json!({"from": [6, 1], "to": [4, 3]})).unwrap();
        assert_eq!(room.next_turn_id, Some(10));
        assert_eq!(room.current_state["must_jump_from"], json!([4, 3]));

        room.apply_move(10, &json!({"from": [4, 3], "to": [2, 5]})).unwrap();
        assert_eq!(room.next_turn_id, Some(20));
        assert_eq!(room.status, GameStatus::Active);
        assert_eq!(room.current_state["board"][3][4], "");
    }

    #[test]
    fn checkers_capturing_the_last_piece_wins() {
        let mut room = room(GameType::Checkers);
        room.start(20).unwrap();
        let mut state = CheckersState {
            board: Default::default(),
            must_jump_from: None,
        };
        state.board[4][3] = checkers::Piece::Red;
        state.board[3][2] = checkers::Piece::Black;
        room.current_state = json!(state);

        assert!(matches!(
            room.apply_move(10, &json!({"from": [4, 3], "to": [3, 4]})),
            Err(ActionError::InvalidMove(board::MoveError::MustCapture))
        ));
        room.apply_move(10, &json!({"from": [4, 3], "to": [2, 1]})).unwrap();
        assert_eq!(room.status, GameStatus::Finished);
        assert_eq!(room.winner_id, Some(10));
    }

    #[test]
    fn checkers_rejects_the_opponents_piece() {
        let mut room = room(GameType::Checkers);
        room.start(20).unwrap();
        let err = room
            .apply_move(10, &json!({"from": [2, 1], "to": [3, 0]}))
            .unwrap_err();
        assert_eq!(err.to_string(), "Not your piece");
        assert_eq!(room.next_turn_id, Some(10));
    }

    #[test]
    fn battleship_setup_then_battle() {
        use crate::game::battleship::tests::fleet;

        let mut room = room(GameType::Battleship);
        assert!(matches!(
            room.place_ships(10, &json!({ "ships": fleet(0) })),
            Err(ActionError::NotActive)
        ));
        room.start(20).unwrap();

        room.place_ships(10, &json!({ "ships": fleet(0) })).unwrap();
        assert!(matches!(
            room.place_ships(10, &json!({ "ships": fleet(0) })),
            Err(ActionError::ShipsAlreadyPlaced)
        ));
        let err = room.apply_move(10, &json!({"row": 5, "col": 0})).unwrap_err();
        assert!(err.to_string().contains("setup phase"));

        let err = room
            .place_ships(20, &json!({ "ships": &fleet(5)[..3] }))
            .unwrap_err();
        assert!(err.to_string().contains("expected 5 ships"));
        room.place_ships(20, &json!({ "ships": fleet(5) })).unwrap();
        assert_eq!(room.battleship_state().unwrap().phase, Phase::Battle);
        assert_eq!(room.next_turn_id, Some(10));

        room.apply_move(10, &json!({"row": 5, "col": 0})).unwrap();
        assert_eq!(room.next_turn_id, Some(20));
        assert!(matches!(
            room.apply_move(20, &json!({"row": 10, "col": 0})),
            Err(ActionError::InvalidMove(board::MoveError::ShotOutOfBounds))
        ));

        let payload = room.state_payload();
        assert!(payload["board"].get("creator_ships").is_none());
        assert_eq!(payload["board"]["creator_hits"], json!([[5, 0]]));
        assert!(room.clone().redacted().current_state.get("opponent_ships").is_none());
    }

    #[test]
    fn ships_only_go_in_battleship_rooms() {
        let mut room = room(GameType::Connect4);
        room.start(20).unwrap();
        let err = room.place_ships(10, &json!({"ships": []})).unwrap_err();
        assert_eq!(err.to_string(), "Not a Battleship game");
    }

    #[test]
    fn staleness_only_applies_to_pending_rooms() {
        let mut room = room(GameType::Connect4);
        let later = room.updated_at + chrono::Duration::minutes(11);
        let idle = chrono::Duration::minutes(10);
        assert!(room.is_stale(later, idle));
        assert!(!room.is_stale(room.updated_at + chrono::Duration::minutes(9), idle));

        room.start(20).unwrap();
        assert!(!room.is_stale(later, idle));
    }

    #[test]
    fn cancel_clears_seats() {
        let mut room = room(GameType::Connect4);
        room.start(20).unwrap();
        room.cancel();
        assert_eq!(room.status, GameStatus::Cancelled);
        assert_eq!(room.opponent_id, None);
        assert_eq!(room.next_turn_id, None);
        assert_eq!(room.winner_id, None);
    }
}
