//! Battleship on a 10x10 grid. Both players place a fleet during `setup`;
//! once both are ready the room enters `battle` and players alternate shots.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::board::{Mark, MoveError, Outcome};

pub const BATTLESHIP_SIZE: usize = 10;

pub type Cell = [usize; 2];

/// Ship names and lengths a fleet must contain exactly once each.
pub const FLEET: [(&str, usize); 5] = [
    ("Carrier", 5),
    ("Battleship", 4),
    ("Cruiser", 3),
    ("Submarine", 3),
    ("Destroyer", 2),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ship {
    pub name: String,
    pub size: usize,
    pub row: usize,
    pub col: usize,
    pub horizontal: bool,
}

impl Ship {
    pub fn cells(&self) -> impl Iterator<Item = Cell> + '_ {
        (0..self.size).map(move |i| {
            if self.horizontal {
                [self.row, self.col + i]
            } else {
                [self.row + i, self.col]
            }
        })
    }

    fn is_sunk(&self, shots: &[Cell]) -> bool {
        self.cells().all(|cell| shots.contains(&cell))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FleetError {
    #[error("expected {expected} ships, got {0}", expected = FLEET.len())]
    WrongCount(usize),
    #[error("unknown ship: {0}")]
    UnknownShip(String),
    #[error("duplicate ship: {0}")]
    Duplicate(String),
    #[error("{0} has wrong size")]
    WrongSize(String),
    #[error("{0} is out of bounds")]
    OutOfBounds(String),
    #[error("{0} overlaps another ship")]
    Overlap(String),
}

pub fn validate_fleet(ships: &[Ship]) -> Result<(), FleetError> {
    if ships.len() != FLEET.len() {
        return Err(FleetError::WrongCount(ships.len()));
    }
    let mut seen = HashSet::new();
    let mut occupied = HashSet::new();
    for ship in ships {
        let (_, size) = FLEET
            .iter()
            .find(|(name, _)| *name == ship.name)
            .ok_or_else(|| FleetError::UnknownShip(ship.name.clone()))?;
        if !seen.insert(ship.name.as_str()) {
            return Err(FleetError::Duplicate(ship.name.clone()));
        }
        if ship.size != *size {
            return Err(FleetError::WrongSize(ship.name.clone()));
        }
        let start = if ship.horizontal { ship.col } else { ship.row };
        if ship.row >= BATTLESHIP_SIZE || ship.col >= BATTLESHIP_SIZE || start + ship.size > BATTLESHIP_SIZE {
            return Err(FleetError::OutOfBounds(ship.name.clone()));
        }
        for cell in ship.cells() {
            if !occupied.insert(cell) {
                return Err(FleetError::Overlap(ship.name.clone()));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Setup,
    Battle,
}

/// Persisted room state. Shots are recorded under the player who fired them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BattleshipState {
    pub phase: Phase,
    pub creator_ready: bool,
    pub opponent_ready: bool,
    pub creator_ships: Vec<Ship>,
    pub opponent_ships: Vec<Ship>,
    pub creator_shots: Vec<Cell>,
    pub opponent_shots: Vec<Cell>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceShips {
    pub ships: Vec<Ship>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Shot {
    pub row: usize,
    pub col: usize,
}

impl BattleshipState {
    fn ready(&self, seat: Mark) -> bool {
        match seat {
            Mark::X => self.creator_ready,
            _ => self.opponent_ready,
        }
    }

    /// Returns `Ok(false)` when `seat` has already placed its fleet.
    pub fn place(&mut self, seat: Mark, ships: Vec<Ship>) -> Result<bool, FleetError> {
        if self.ready(seat) {
            return Ok(false);
        }
        validate_fleet(&ships)?;
        if seat == Mark::X {
            self.creator_ships = ships;
            self.creator_ready = true;
        } else {
            self.opponent_ships = ships;
            self.opponent_ready = true;
        }
        if self.creator_ready && self.opponent_ready {
            self.phase = Phase::Battle;
        }
        Ok(true)
    }

    pub fn fire(&mut self, seat: Mark, shot: Shot) -> Result<(), MoveError> {
        if self.phase != Phase::Battle {
            return Err(MoveError::SetupPhase);
        }
        if shot.row >= BATTLESHIP_SIZE || shot.col >= BATTLESHIP_SIZE {
            return Err(MoveError::ShotOutOfBounds);
        }
        let shots = if seat == Mark::X {
            &mut self.creator_shots
        } else {
            &mut self.opponent_shots
        };
        let cell = [shot.row, shot.col];
        if shots.contains(&cell) {
            return Err(MoveError::AlreadyShot);
        }
        shots.push(cell);
        Ok(())
    }

    /// A side wins once every cell of the other fleet has been hit. An empty
    /// fleet never counts as sunk.
    pub fn outcome(&self) -> Outcome {
        if self.phase != Phase::Battle {
            return Outcome::InProgress;
        }
        let sunk = |ships: &[Ship], shots: &[Cell]| !ships.is_empty() && ships.iter().all(|s| s.is_sunk(shots));
        if sunk(&self.opponent_ships, &self.creator_shots) {
            Outcome::Won(Mark::X)
        } else if sunk(&self.creator_ships, &self.opponent_shots) {
            Outcome::Won(Mark::O)
        } else {
            Outcome::InProgress
        }
    }

    /// What both players may see: fleets are withheld, shots are split into
    /// hits, and sunk ships are named.
    pub fn public_view(&self) -> Value {
        let hits = |ships: &[Ship], shots: &[Cell]| -> Vec<Cell> {
            shots
                .iter()
                .copied()
                .filter(|shot| ships.iter().any(|s| s.cells().any(|c| c == *shot)))
                .collect()
        };
        let sunk = |ships: &[Ship], shots: &[Cell]| -> Vec<String> {
            ships.iter().filter(|s| s.is_sunk(shots)).map(|s| s.name.clone()).collect()
        };
        json!({
            "phase": self.phase,
            "creator_ready": self.creator_ready,
            "opponent_ready": self.opponent_ready,
            "creator_shots": self.creator_shots,
            "opponent_shots": self.opponent_shots,
            "creator_hits": hits(&self.opponent_ships, &self.creator_shots),
            "opponent_hits": hits(&self.creator_ships, &self.opponent_shots),
            "creator_sunk": sunk(&self.opponent_ships, &self.creator_shots),
            "opponent_sunk": sunk(&self.creator_ships, &self.opponent_shots),
        })
    }
}
