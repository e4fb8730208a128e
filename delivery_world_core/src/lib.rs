use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

pub mod config;
pub mod environment;
pub mod evaluation;
pub mod map;
pub mod policy;
pub mod training;

/// Unique identifier for agents. Agents of a population are numbered `0..n`.
pub type AgentId = usize;

/// Represents a 2D coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub x: usize,
    pub y: usize,
}

impl Position {
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    /// Returns the manhattan distance between two positions.
    pub fn manhattan_distance(&self, other: &Position) -> usize {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }
}

/// Builds the random source for a component: reproducible when a seed is given.
pub fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}
