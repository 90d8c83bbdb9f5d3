use dilemma_types::{
    AgentId, AgentState, MetricsSnapshot, OccupancyCell, RunSnapshot, RunStatus, SimulationConfig,
    Team, MAX_SPEED, MIN_POPULATION,
};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

mod grid;
mod random;
mod registry;
mod turn;

#[cfg(test)]
mod tests;

pub use grid::{grid_side, Grid, Neighbor};
pub use random::{byte_for_draw, ByteSource, EntropyBytes, RandomSource, ScriptedBytes, REFILL_BATCH};
pub use registry::team_for;
pub use turn::{choose_play, payoff, PendingTurn};

/// Largest population whose grid side still fits a single-byte draw.
pub const MAX_POPULATION: u32 = 10_000;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SimError {
    #[error("invalid simulation config: {0}")]
    InvalidConfig(String),
    #[error("risk probability is locked once the run has started")]
    RiskLocked,
    #[error("run has already ended: {0:?}")]
    RunFinished(RunStatus),
    #[error("simulation invariant violated: {0}")]
    Invariant(String),
}

/// Owns one simulation run and advances it turn by turn.
pub struct TurnEngine {
    config: SimulationConfig,
    random: RandomSource,
    grid: Grid,
    agents: Vec<AgentState>,
    rosters: BTreeMap<Team, Vec<AgentId>>,
    turn: u64,
    alive: u32,
    any_cooperator_alive: bool,
    risk_engaged: bool,
    status: RunStatus,
    metrics: MetricsSnapshot,
}

impl TurnEngine {
    /// Builds a run, seeding randomness from `config.seed` or OS entropy.
    pub fn new(config: SimulationConfig) -> Result<Self, SimError> {
        let random = match config.seed {
            Some(seed) => RandomSource::from_seed(seed),
            None => RandomSource::from_entropy(),
        };
        Self::with_random_source(config, random)
    }

    pub fn with_random_source(
        config: SimulationConfig,
        random: RandomSource,
    ) -> Result<Self, SimError> {
        validate_config(&config)?;

        let mut engine = Self {
            grid: Grid::for_population(config.population),
            config,
            random,
            agents: Vec::new(),
            rosters: BTreeMap::new(),
            turn: 0,
            alive: 0,
            any_cooperator_alive: false,
            risk_engaged: false,
            status: RunStatus::Running,
            metrics: MetricsSnapshot::default(),
        };
        engine.start_run()?;
        Ok(engine)
    }

    /// Discards the current run and builds a fresh one, continuing the same
    /// random stream.
    pub fn restart(&mut self) -> Result<(), SimError> {
        self.start_run()
    }

    /// Like [`TurnEngine::restart`], optionally reseeding first.
    pub fn reset(&mut self, seed: Option<u64>) -> Result<(), SimError> {
        if let Some(seed) = seed {
            self.config.seed = Some(seed);
            self.random.reseed(Box::new(EntropyBytes::from_seed(seed)));
        }
        self.start_run()
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn alive_count(&self) -> u32 {
        self.alive
    }

    pub fn any_cooperator_alive(&self) -> bool {
        self.any_cooperator_alive
    }

    pub fn risk_engaged(&self) -> bool {
        self.risk_engaged
    }

    pub fn agents(&self) -> &[AgentState] {
        &self.agents
    }

    pub fn agent(&self, id: AgentId) -> Option<&AgentState> {
        self.agents.get(id.index())
    }

    pub fn roster(&self, team: Team) -> &[AgentId] {
        self.rosters.get(&team).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn metrics(&self) -> &MetricsSnapshot {
        &self.metrics
    }

    pub fn random(&self) -> &RandomSource {
        &self.random
    }

    /// Effective risk probability; unset counts as zero.
    pub fn risk_probability(&self) -> f64 {
        self.config.risk_probability.unwrap_or(0.0)
    }

    /// Accepted while unset or before the run's first turn completes.
    pub fn set_risk_probability(&mut self, probability: f64) -> Result<(), SimError> {
        validate_risk_probability(probability)?;
        if self.config.risk_probability.is_some() && self.turn > 0 {
            return Err(SimError::RiskLocked);
        }
        self.config.risk_probability = Some(probability);
        Ok(())
    }

    pub fn set_speed(&mut self, speed: u8) -> Result<(), SimError> {
        validate_speed(speed)?;
        self.config.speed = speed;
        Ok(())
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let occupancy = self
            .grid
            .occupied()
            .map(|(position, agent)| OccupancyCell {
                x: position.x,
                y: position.y,
                agent,
            })
            .collect();

        RunSnapshot {
            turn: self.turn,
            config: self.config.clone(),
            width: self.grid.width(),
            height: self.grid.height(),
            agents: self.agents.clone(),
            occupancy,
            status: self.status.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn export_trace_jsonl(&mut self, turns: u32) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(
            serde_json::to_string(&self.snapshot())
                .expect("serialize initial snapshot for trace export"),
        );

        for _ in 0..turns {
            if self.tick().is_err() {
                break;
            }
            lines.push(
                serde_json::to_string(&self.snapshot())
                    .expect("serialize turn snapshot for trace export"),
            );
        }
        lines
    }

    /// Checks grid occupancy and partner symmetry against the agent records.
    pub fn validate_state(&self) -> Result<(), SimError> {
        let mut alive = 0_u32;
        for agent in &self.agents {
            match (agent.is_alive(), agent.position) {
                (true, Some(position)) => {
                    alive += 1;
                    if self.grid.occupant(position) != Some(agent.id) {
                        return Err(SimError::Invariant(format!(
                            "agent {} is not on its recorded cell ({}, {})",
                            agent.id, position.x, position.y
                        )));
                    }
                }
                (true, None) => {
                    return Err(SimError::Invariant(format!(
                        "alive agent {} has no position",
                        agent.id
                    )));
                }
                (false, Some(_)) => {
                    return Err(SimError::Invariant(format!(
                        "dead agent {} still has a position",
                        agent.id
                    )));
                }
                (false, None) => {}
            }

            if let Some(partner) = agent.partner {
                let mirrored = self.agent(partner).and_then(|other| other.partner);
                if mirrored != Some(agent.id) {
                    return Err(SimError::Invariant(format!(
                        "agent {} is paired with {partner} but not vice versa",
                        agent.id
                    )));
                }
            }
        }

        if alive != self.alive || self.grid.occupied_count() != alive as usize {
            return Err(SimError::Invariant(format!(
                "alive count {} disagrees with agents ({alive}) or grid ({})",
                self.alive,
                self.grid.occupied_count()
            )));
        }
        Ok(())
    }

    fn debug_assert_consistent_state(&self) {
        if cfg!(debug_assertions) {
            let checked = self.validate_state();
            debug_assert!(checked.is_ok(), "inconsistent run state: {checked:?}");
        }
    }

    fn start_run(&mut self) -> Result<(), SimError> {
        self.grid = Grid::for_population(self.config.population);
        self.turn = 0;
        self.status = RunStatus::Running;
        self.risk_engaged = false;
        self.stoke();
        self.place_agents_randomly()?;
        self.alive = self.agents.len() as u32;
        self.any_cooperator_alive = self.cooperator_alive();
        self.metrics = MetricsSnapshot::default();
        self.refresh_metrics(0, 0);
        info!(
            population = self.config.population,
            width = self.grid.width(),
            "simulation run started"
        );
        Ok(())
    }

    fn cooperator_alive(&self) -> bool {
        self.agents
            .iter()
            .any(|agent| agent.is_alive() && agent.team.is_cooperator())
    }

    fn refresh_metrics(&mut self, engagements: u32, deaths: u32) {
        let mut alive_by_team = BTreeMap::new();
        for agent in self.agents.iter().filter(|agent| agent.is_alive()) {
            *alive_by_team.entry(agent.team).or_insert(0) += 1;
        }
        self.metrics = MetricsSnapshot {
            turns: self.turn,
            alive: self.alive,
            alive_by_team,
            any_cooperator_alive: self.any_cooperator_alive,
            risk_engaged: self.risk_engaged,
            engagements_last_turn: engagements,
            deaths_last_turn: deaths,
        };
    }
}

pub fn validate_config(config: &SimulationConfig) -> Result<(), SimError> {
    if config.population < MIN_POPULATION {
        return Err(SimError::InvalidConfig(format!(
            "population must be at least {MIN_POPULATION}"
        )));
    }
    if config.population > MAX_POPULATION {
        return Err(SimError::InvalidConfig(format!(
            "population must be at most {MAX_POPULATION}"
        )));
    }
    if let Some(probability) = config.risk_probability {
        validate_risk_probability(probability)?;
    }
    validate_speed(config.speed)
}

fn validate_risk_probability(probability: f64) -> Result<(), SimError> {
    if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
        return Err(SimError::InvalidConfig(
            "risk_probability must be within [0, 1]".to_owned(),
        ));
    }
    Ok(())
}

fn validate_speed(speed: u8) -> Result<(), SimError> {
    if speed > MAX_SPEED {
        return Err(SimError::InvalidConfig(format!(
            "speed must be within [0, {MAX_SPEED}]"
        )));
    }
    Ok(())
}
