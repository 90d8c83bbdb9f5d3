use dilemma_types::{Phase, RunSnapshot, RunStatus, SimulationConfig, TurnDelta};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    pub id: Uuid,
    pub config: SimulationConfig,
    pub running: bool,
}

/// Overrides applied on top of the server's configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CreateSessionRequest {
    pub population: Option<u32>,
    pub risk_probability: Option<f64>,
    pub speed: Option<u8>,
    pub seed: Option<u64>,
}

impl CreateSessionRequest {
    pub fn apply(&self, mut config: SimulationConfig) -> SimulationConfig {
        if let Some(population) = self.population {
            config.population = population;
        }
        if self.risk_probability.is_some() {
            config.risk_probability = self.risk_probability;
        }
        if let Some(speed) = self.speed {
            config.speed = speed;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateSessionResponse {
    pub metadata: SessionMetadata,
    pub snapshot: RunSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeedRequest {
    pub speed: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskRequest {
    pub risk_probability: f64,
}

/// What happened to a request for one more turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", content = "turns", rename_all = "snake_case")]
pub enum TurnRequest {
    /// Ran this many turns, counting a queued request picked up afterwards.
    Executed(u32),
    /// A turn was in flight; this request will run right after it.
    Queued,
    /// A turn was in flight and another was already queued.
    Dropped,
    /// The run has ended.
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResponse {
    pub request: TurnRequest,
    pub snapshot: RunSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    Run,
    Pause,
    Step,
    Restart,
    SetSpeed { speed: u8 },
    SetRisk { risk_probability: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum SimEvent {
    StateSnapshot(RunSnapshot),
    PhaseCompleted { turn: u64, phase: Phase },
    TurnDelta(TurnDelta),
    RunEnded { status: RunStatus },
    Error(ApiError),
}
