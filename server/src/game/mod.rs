//! Turn-based game rooms: engines, the room state machine and the hub that
//! fans room events out to connected players.

pub mod battleship;
pub mod board;
pub mod checkers;
pub mod handler;
pub mod hub;
pub mod rooms;

use serde::Deserialize;
use serde_json::Value;

pub use hub::GameHub;

use crate::repo::RepoError;
use battleship::FleetError;
use board::MoveError;

/// A game action that could not be applied. The message goes back to the
/// sender as an `error` envelope.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Game room not found")]
    RoomNotFound,
    #[error("Game already started or finished")]
    NotJoinable,
    #[error("You are the creator")]
    CreatorCannotJoin,
    #[error("Not your turn")]
    NotYourTurn,
    #[error("Not a participant in this game")]
    NotParticipant,
    #[error("Invalid move format")]
    InvalidMoveFormat,
    #[error("{0}")]
    InvalidMove(#[from] MoveError),
    #[error("Game is not active")]
    NotActive,
    #[error("Not a Battleship game")]
    NotBattleship,
    #[error("Ships already placed")]
    ShipsAlreadyPlaced,
    #[error("Invalid fleet: {0}")]
    InvalidFleet(#[from] FleetError),
    #[error("Game state is corrupt")]
    CorruptState,
    #[error("Failed to save game: {0}")]
    Persistence(RepoError),
}

impl From<RepoError> for ActionError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound { .. } => ActionError::RoomNotFound,
            other => ActionError::Persistence(other),
        }
    }
}

/// Inbound frames on a game socket. The room comes from the socket's query.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameCommand {
    JoinRoom,
    MakeMove {
        #[serde(default)]
        payload: Value,
    },
    PlaceShips {
        #[serde(default)]
        payload: Value,
    },
    LeaveRoom,
    Chat {
        #[serde(default)]
        payload: Value,
    },
    #[serde(other)]
    Unknown,
}
