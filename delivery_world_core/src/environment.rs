use rand::{rngs::StdRng, seq::index};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::{AgentId, Position, config::RewardConfig, map::Grid};

/// Per-agent values keyed by agent id, iterated in ascending id order.
pub type AgentMap<T> = BTreeMap<AgentId, T>;

/// Errors raised by the grid world.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridWorldError {
    #[error("cannot place {agents} agents on {free_cells} free cells")]
    InsufficientCapacity { agents: usize, free_cells: usize },
    #[error("no action supplied for agent {0}")]
    MissingAction(AgentId),
    #[error("agent {0} is not part of the current population")]
    UnknownAgent(AgentId),
    #[error("placement {position:?} is outside the grid or already occupied")]
    InvalidPlacement { position: Position },
}

/// The four moves available to every agent.
///
/// The declaration order is the enumeration order used for neighbour
/// encoding and for the persisted action names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
    ];

    /// Unit offset of the move; `y` grows southwards.
    pub fn delta(self) -> (isize, isize) {
        match self {
            Direction::North => (0, -1),
            Direction::South => (0, 1),
            Direction::East => (1, 0),
            Direction::West => (-1, 0),
        }
    }

    /// Position of this direction in [`Direction::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Direction::North => "NORTH",
            Direction::South => "SOUTH",
            Direction::East => "EAST",
            Direction::West => "WEST",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown direction name `{0}`")]
pub struct UnknownDirection(pub String);

impl FromStr for Direction {
    type Err = UnknownDirection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Direction::ALL
            .into_iter()
            .find(|direction| direction.name() == s)
            .ok_or_else(|| UnknownDirection(s.to_string()))
    }
}

/// What an agent senses in one neighbouring cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Neighbor {
    OffGrid,
    Empty,
    Agent,
    CarryingAgent,
}

impl Neighbor {
    pub fn code(self) -> i8 {
        match self {
            Neighbor::OffGrid => -1,
            Neighbor::Empty => 0,
            Neighbor::Agent => 1,
            Neighbor::CarryingAgent => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(Neighbor::OffGrid),
            0 => Some(Neighbor::Empty),
            1 => Some(Neighbor::Agent),
            2 => Some(Neighbor::CarryingAgent),
            _ => None,
        }
    }
}

/// Local observation of one agent, used as the value-table key.
///
/// The textual form is `(x, y, carrying, dx, dy, n0, n1, n2, n3)` with
/// `carrying` as 0/1 and the neighbours as their codes in [`Direction::ALL`]
/// order. `(dx, dy)` points from the agent to its current target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub x: i32,
    pub y: i32,
    pub carrying: bool,
    pub dx: i32,
    pub dy: i32,
    pub neighbors: [Neighbor; 4],
}

const STATE_KEY_ARITY: usize = 9;

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {}, {}",
            self.x,
            self.y,
            u8::from(self.carrying),
            self.dx,
            self.dy
        )?;
        for neighbor in self.neighbors {
            write!(f, ", {}", neighbor.code())?;
        }
        f.write_str(")")
    }
}

/// Reasons a textual state key is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateKeyParseError {
    #[error("state key must be enclosed in parentheses")]
    Unbracketed,
    #[error("state key has {found} fields, expected 9")]
    Arity { found: usize },
    #[error("field {index} (`{text}`) is not an integer")]
    NotAnInteger { index: usize, text: String },
    #[error("field {index} = {value} is outside its domain")]
    OutOfDomain { index: usize, value: i64 },
}

impl FromStr for StateKey {
    type Err = StateKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .trim()
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or(StateKeyParseError::Unbracketed)?;

        let fields: Vec<&str> = inner.split(',').map(str::trim).collect();
        if fields.len() != STATE_KEY_ARITY {
            return Err(StateKeyParseError::Arity {
                found: fields.len(),
            });
        }

        let mut values = [0i64; STATE_KEY_ARITY];
        for (index, (text, slot)) in fields.iter().zip(values.iter_mut()).enumerate() {
            *slot = text
                .parse()
                .map_err(|_| StateKeyParseError::NotAnInteger {
                    index,
                    text: text.to_string(),
                })?;
        }

        let coordinate = |index: usize, min: i64| {
            let value = values[index];
            if value < min {
                return Err(StateKeyParseError::OutOfDomain { index, value });
            }
            i32::try_from(value).map_err(|_| StateKeyParseError::OutOfDomain { index, value })
        };

        let carrying = match values[2] {
            0 => false,
            1 => true,
            value => return Err(StateKeyParseError::OutOfDomain { index: 2, value }),
        };

        let mut neighbors = [Neighbor::Empty; 4];
        for (offset, neighbor) in neighbors.iter_mut().enumerate() {
            let index = 5 + offset;
            *neighbor = Neighbor::from_code(values[index]).ok_or(
                StateKeyParseError::OutOfDomain {
                    index,
                    value: values[index],
                },
            )?;
        }

        Ok(StateKey {
            x: coordinate(0, 0)?,
            y: coordinate(1, 0)?,
            carrying,
            dx: coordinate(3, i64::from(i32::MIN))?,
            dy: coordinate(4, i64::from(i32::MIN))?,
            neighbors,
        })
    }
}

/// Holds the state of an agent within the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub position: Position,
    pub carrying: bool,
}

/// Event counts for a single step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    pub deliveries: u32,
    pub wall_collisions: u32,
    /// Contention for a cell is resolved as a yield, so this stays 0.
    pub head_on_collisions: u32,
}

impl StepInfo {
    pub fn collisions(&self) -> u32 {
        self.wall_collisions + self.head_on_collisions
    }
}

impl std::ops::AddAssign for StepInfo {
    fn add_assign(&mut self, other: Self) {
        self.deliveries += other.deliveries;
        self.wall_collisions += other.wall_collisions;
        self.head_on_collisions += other.head_on_collisions;
    }
}

/// Everything a single call to [`GridWorld::step`] produces.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub states: AgentMap<StateKey>,
    pub rewards: AgentMap<f64>,
    pub info: StepInfo,
}

/// Deterministic multi-agent pickup-and-delivery world on a square grid.
///
/// Randomness is only used by [`GridWorld::reset`] to place agents.
#[derive(Debug)]
pub struct GridWorld {
    size: usize,
    pickup: Position,
    dropoff: Position,
    rewards: RewardConfig,
    agents: Vec<AgentState>,
    agent_locations: Grid<Option<AgentId>>,
    num_agents: usize,
    rng: StdRng,
}

impl GridWorld {
    /// Creates a world with `num_agents` agents already placed by [`GridWorld::reset`].
    pub fn new(
        size: usize,
        num_agents: usize,
        rewards: RewardConfig,
        rng: StdRng,
    ) -> Result<Self, GridWorldError> {
        let mut world = GridWorld {
            size,
            pickup: Position::new(0, 0),
            dropoff: Position::new(size.saturating_sub(1), size.saturating_sub(1)),
            rewards,
            agents: Vec::with_capacity(num_agents),
            agent_locations: Grid::new(size, size),
            num_agents,
            rng,
        };
        world.reset()?;
        Ok(world)
    }

    /// Scatters all agents over distinct free cells and clears their loads.
    pub fn reset(&mut self) -> Result<AgentMap<StateKey>, GridWorldError> {
        let free_cells: Vec<Position> = self
            .agent_locations
            .enumerate()
            .map(|(position, _)| position)
            .filter(|position| *position != self.pickup && *position != self.dropoff)
            .collect();

        if free_cells.len() < self.num_agents {
            return Err(GridWorldError::InsufficientCapacity {
                agents: self.num_agents,
                free_cells: free_cells.len(),
            });
        }

        self.agents = index::sample(&mut self.rng, free_cells.len(), self.num_agents)
            .into_iter()
            .enumerate()
            .map(|(id, cell)| AgentState {
                id,
                position: free_cells[cell],
                carrying: false,
            })
            .collect();
        self.rebuild_locations();
        Ok(self.states())
    }

    /// Replaces the population with agents at explicit positions.
    ///
    /// Agent `i` gets `placements[i]`. Any in-bounds cell may be used, as long
    /// as no two agents share one.
    pub fn place_agents(
        &mut self,
        placements: &[(Position, bool)],
    ) -> Result<AgentMap<StateKey>, GridWorldError> {
        let mut seen: Grid<bool> = Grid::new(self.size, self.size);
        for &(position, _) in placements {
            match seen.get(position) {
                Some(false) => seen[position] = true,
                _ => return Err(GridWorldError::InvalidPlacement { position }),
            }
        }

        self.num_agents = placements.len();
        self.agents = placements
            .iter()
            .enumerate()
            .map(|(id, &(position, carrying))| AgentState {
                id,
                position,
                carrying,
            })
            .collect();
        self.rebuild_locations();
        Ok(self.states())
    }

    fn rebuild_locations(&mut self) {
        self.agent_locations.fill(None);
        for agent in &self.agents {
            self.agent_locations[agent.position] = Some(agent.id);
        }
    }

    fn target_of(&self, carrying: bool) -> Position {
        if carrying { self.dropoff } else { self.pickup }
    }

    /// Encodes what agent `agent_id` currently observes.
    ///
    /// # Panics
    ///
    /// Panics if `agent_id` is not part of the population.
    pub fn state_for_agent(&self, agent_id: AgentId) -> StateKey {
        let agent = &self.agents[agent_id];
        let position = agent.position;
        let target = self.target_of(agent.carrying);

        let neighbors = Direction::ALL.map(|direction| {
            let (dx, dy) = direction.delta();
            match self.agent_locations.offset(position, dx, dy) {
                None => Neighbor::OffGrid,
                Some(cell) => match self.agent_locations[cell] {
                    Some(other) if self.agents[other].carrying => Neighbor::CarryingAgent,
                    Some(_) => Neighbor::Agent,
                    None => Neighbor::Empty,
                },
            }
        });

        StateKey {
            x: position.x as i32,
            y: position.y as i32,
            carrying: agent.carrying,
            dx: target.x as i32 - position.x as i32,
            dy: target.y as i32 - position.y as i32,
            neighbors,
        }
    }

    /// State keys of the whole population.
    pub fn states(&self) -> AgentMap<StateKey> {
        (0..self.num_agents)
            .map(|id| (id, self.state_for_agent(id)))
            .collect()
    }

    /// Advances every agent by one tick.
    ///
    /// `actions` must hold exactly one move per agent of the population.
    /// Carrying agents claim cells first, then the rest, each group in
    /// ascending id order. A move off the grid or into an already claimed cell
    /// leaves the agent in place.
    pub fn step(&mut self, actions: &AgentMap<Direction>) -> Result<StepOutcome, GridWorldError> {
        if let Some(&unknown) = actions.keys().find(|&&id| id >= self.num_agents) {
            return Err(GridWorldError::UnknownAgent(unknown));
        }
        if let Some(missing) = (0..self.num_agents).find(|id| !actions.contains_key(id)) {
            return Err(GridWorldError::MissingAction(missing));
        }

        let mut rewards: AgentMap<f64> = (0..self.num_agents)
            .map(|id| (id, self.rewards.step_penalty))
            .collect();
        let mut info = StepInfo::default();

        let mut order: Vec<AgentId> = (0..self.num_agents).collect();
        order.sort_by_key(|&id| !self.agents[id].carrying);

        let mut claimed: Grid<bool> = Grid::new(self.size, self.size);
        let mut moves: Vec<Option<Position>> = vec![None; self.num_agents];

        for id in order {
            let origin = self.agents[id].position;
            let (dx, dy) = actions[&id].delta();
            match claimed.offset(origin, dx, dy) {
                None => {
                    claimed[origin] = true;
                    info.wall_collisions += 1;
                    add_reward(&mut rewards, id, self.rewards.wall_collision);
                }
                Some(target) if claimed[target] => {
                    claimed[origin] = true;
                    add_reward(&mut rewards, id, self.rewards.yield_penalty);
                }
                Some(target) => {
                    claimed[target] = true;
                    moves[id] = Some(target);
                }
            }
        }

        // A mover may have claimed the cell of an agent that ended up staying.
        // Send it back; its own origin then becomes held, which can cascade.
        let mut held: Grid<bool> = Grid::new(self.size, self.size);
        for agent in &self.agents {
            if moves[agent.id].is_none() {
                held[agent.position] = true;
            }
        }
        while let Some(id) = (0..self.num_agents).find(|&id| moves[id].is_some_and(|t| held[t])) {
            moves[id] = None;
            held[self.agents[id].position] = true;
            add_reward(&mut rewards, id, self.rewards.yield_penalty);
        }

        for id in 0..self.num_agents {
            let agent = &mut self.agents[id];
            let origin = agent.position;
            let carrying = agent.carrying;
            let position = moves[id].unwrap_or(origin);
            agent.position = position;

            let target = if carrying { self.dropoff } else { self.pickup };
            if position.manhattan_distance(&target) < origin.manhattan_distance(&target) {
                add_reward(&mut rewards, id, self.rewards.progress);
            }

            if carrying && position == self.dropoff {
                agent.carrying = false;
                info.deliveries += 1;
                add_reward(&mut rewards, id, self.rewards.delivery);
            } else if !carrying && position == self.pickup {
                agent.carrying = true;
                add_reward(&mut rewards, id, self.rewards.pickup);
            }
        }
        self.rebuild_locations();

        Ok(StepOutcome {
            states: self.states(),
            rewards,
            info,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }
    pub fn num_agents(&self) -> usize {
        self.num_agents
    }
    pub fn pickup(&self) -> Position {
        self.pickup
    }
    pub fn dropoff(&self) -> Position {
        self.dropoff
    }
    pub fn agents(&self) -> &[AgentState] {
        &self.agents
    }
    pub fn agent(&self, agent_id: AgentId) -> Option<&AgentState> {
        self.agents.get(agent_id)
    }
    pub fn agent_locations(&self) -> &Grid<Option<AgentId>> {
        &self.agent_locations
    }
}

fn add_reward(rewards: &mut AgentMap<f64>, agent_id: AgentId, amount: f64) {
    if let Some(total) = rewards.get_mut(&agent_id) {
        *total += amount;
    }
}
