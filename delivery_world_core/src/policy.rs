use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

use rand::{Rng, rngs::StdRng, seq::IndexedRandom};

use crate::{
    config::PolicyConfig,
    environment::{Direction, StateKey},
};

/// On-disk shape of a policy: state text -> action name -> value.
type PolicyDocument = BTreeMap<String, BTreeMap<String, f64>>;

/// Errors raised while persisting or restoring a policy.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to access policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt policy state in {path}: {reason}")]
    CorruptPolicyState { path: PathBuf, reason: String },
    #[error("value of {action} in state {state} is not finite")]
    NonFiniteValue { state: StateKey, action: Direction },
    #[error("failed to encode policy: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Values recorded for the actions of one state.
///
/// An action that was never updated has no value here; reads through
/// [`ActionValues::value`] treat it as 0.0.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActionValues([Option<f64>; 4]);

impl ActionValues {
    /// Recorded value of `action`, if any.
    pub fn get(&self, action: Direction) -> Option<f64> {
        self.0[action.index()]
    }

    /// Value of `action`, 0.0 when unrecorded.
    pub fn value(&self, action: Direction) -> f64 {
        self.get(action).unwrap_or(0.0)
    }

    fn slot_mut(&mut self, action: Direction) -> &mut Option<f64> {
        &mut self.0[action.index()]
    }

    /// Iterates over the recorded `(action, value)` pairs.
    pub fn recorded(&self) -> impl Iterator<Item = (Direction, f64)> + '_ {
        Direction::ALL
            .into_iter()
            .filter_map(|action| self.get(action).map(|value| (action, value)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    /// Largest recorded value, `None` when nothing is recorded.
    pub fn max(&self) -> Option<f64> {
        self.recorded().map(|(_, value)| value).reduce(f64::max)
    }

    /// Every recorded action whose value equals the maximum.
    pub fn best_actions(&self) -> Vec<Direction> {
        match self.max() {
            Some(max) => self
                .recorded()
                .filter(|&(_, value)| value == max)
                .map(|(action, _)| action)
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Tabular action-value store shared by every agent of a run.
///
/// Lookups never insert: an unseen state or action reads as 0.0 through
/// [`QTable::value`], and as "nothing recorded" through [`QTable::max_value`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QTable {
    entries: HashMap<StateKey, ActionValues>,
}

impl QTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `(state, action)`, 0.0 when unseen.
    pub fn value(&self, state: &StateKey, action: Direction) -> f64 {
        self.entries
            .get(state)
            .map_or(0.0, |values| values.value(action))
    }

    /// Largest recorded value of `state`, `None` when nothing is recorded.
    pub fn max_value(&self, state: &StateKey) -> Option<f64> {
        self.entries.get(state).and_then(ActionValues::max)
    }

    pub fn action_values(&self, state: &StateKey) -> Option<&ActionValues> {
        self.entries.get(state)
    }

    /// Records `value` for `(state, action)`.
    pub fn set(&mut self, state: StateKey, action: Direction, value: f64) {
        *self.entries.entry(state).or_default().slot_mut(action) = Some(value);
    }

    fn entry(&mut self, state: StateKey) -> &mut ActionValues {
        self.entries.entry(state).or_default()
    }

    /// Number of known states, including states with no recorded action.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StateKey, &ActionValues)> {
        self.entries.iter()
    }

    fn to_document(&self) -> Result<PolicyDocument, PolicyError> {
        let mut document = PolicyDocument::new();
        for (state, values) in &self.entries {
            let mut actions = BTreeMap::new();
            for (action, value) in values.recorded() {
                if !value.is_finite() {
                    return Err(PolicyError::NonFiniteValue {
                        state: *state,
                        action,
                    });
                }
                actions.insert(action.name().to_string(), value);
            }
            document.insert(state.to_string(), actions);
        }
        Ok(document)
    }

    fn from_document(document: PolicyDocument) -> Result<Self, String> {
        let mut table = QTable::new();
        for (text, actions) in document {
            let state: StateKey = text
                .parse()
                .map_err(|err| format!("state key `{text}`: {err}"))?;
            if table.entries.contains_key(&state) {
                return Err(format!("state {state} appears more than once"));
            }

            let values = table.entry(state);
            for (name, value) in actions {
                let action: Direction = name
                    .parse()
                    .map_err(|err| format!("state {state}: {err}"))?;
                *values.slot_mut(action) = Some(value);
            }
        }
        Ok(table)
    }
}

/// One epsilon-greedy Q-learning policy used by every agent.
#[derive(Debug)]
pub struct SharedPolicy {
    alpha: f64,
    gamma: f64,
    epsilon: f64,
    epsilon_decay: f64,
    min_epsilon: f64,
    table: QTable,
    new_state_actions: u64,
    rng: StdRng,
}

impl SharedPolicy {
    pub fn new(config: &PolicyConfig, rng: StdRng) -> Self {
        Self {
            alpha: config.alpha,
            gamma: config.gamma,
            epsilon: config.epsilon,
            epsilon_decay: config.epsilon_decay,
            min_epsilon: config.min_epsilon,
            table: QTable::new(),
            new_state_actions: 0,
            rng,
        }
    }

    /// Creates a policy whose table is read from `path`.
    pub fn from_file(
        config: &PolicyConfig,
        rng: StdRng,
        path: impl AsRef<Path>,
    ) -> Result<Self, PolicyError> {
        let mut policy = Self::new(config, rng);
        policy.load(path)?;
        Ok(policy)
    }

    fn random_action(&mut self) -> Direction {
        Direction::ALL[self.rng.random_range(0..Direction::ALL.len())]
    }

    /// Epsilon-greedy choice; ties between best actions are broken uniformly.
    pub fn choose_action(&mut self, state: &StateKey) -> Direction {
        if self.rng.random::<f64>() < self.epsilon {
            return self.random_action();
        }

        let best = self
            .table
            .action_values(state)
            .map(ActionValues::best_actions)
            .unwrap_or_default();
        match best.choose(&mut self.rng) {
            Some(&action) => action,
            None => self.random_action(),
        }
    }

    /// One-step Q-learning update of `(state, action)`.
    pub fn update(
        &mut self,
        state: &StateKey,
        action: Direction,
        reward: f64,
        next_state: &StateKey,
    ) {
        let slot = self.table.entry(*state).slot_mut(action);
        if slot.is_none() {
            self.new_state_actions += 1;
        }
        // Recorded before the bootstrap so a self-transition sees the fresh 0.0.
        let current = *slot.get_or_insert(0.0);

        let max_next = self.table.max_value(next_state).unwrap_or(0.0);
        let target = reward + self.gamma * max_next;
        self.table
            .set(*state, action, current + self.alpha * (target - current));
    }

    /// Shrinks epsilon by the decay factor without going below the floor.
    pub fn decay_epsilon(&mut self) {
        if self.epsilon > self.min_epsilon {
            self.epsilon = (self.epsilon * self.epsilon_decay).max(self.min_epsilon);
        }
    }

    /// Disables exploration.
    pub fn freeze(&mut self) {
        self.epsilon = 0.0;
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn table(&self) -> &QTable {
        &self.table
    }

    /// Number of `(state, action)` pairs updated for the first time.
    pub fn new_state_actions(&self) -> u64 {
        self.new_state_actions
    }

    /// Writes the full table as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PolicyError> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(&self.table.to_document()?)?;
        fs::write(path, text).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Replaces the table with the one stored at `path`.
    ///
    /// On any error the current table is left untouched.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), PolicyError> {
        let path = path.as_ref();
        let corrupt = |reason: String| PolicyError::CorruptPolicyState {
            path: path.to_path_buf(),
            reason,
        };

        let text = fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let document: PolicyDocument =
            serde_json::from_str(&text).map_err(|err| corrupt(err.to_string()))?;
        self.table = QTable::from_document(document).map_err(corrupt)?;
        Ok(())
    }
}
