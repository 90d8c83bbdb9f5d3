use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Points every agent starts a run with.
pub const STARTING_POINTS: i32 = 10;
/// Any agent scoring above this ends the run with [`RunStatus::Overflow`].
pub const POINTS_CEILING: i32 = 127;
pub const MIN_POPULATION: u32 = 2;
pub const MAX_SPEED: u8 = 50;
const CADENCE_STEP_MS: u64 = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(pub u32);

impl AgentId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Team {
    TheDonald,
    Karen,
    Maga,
    Snowflake,
}

impl Team {
    pub const ALL: [Team; 4] = [Team::TheDonald, Team::Karen, Team::Maga, Team::Snowflake];

    /// Teams shared out across agents `1..N`, in id order.
    pub const ROSTER: [Team; 3] = [Team::Karen, Team::Maga, Team::Snowflake];

    /// Teams whose strategy can ever cooperate.
    pub fn is_cooperator(self) -> bool {
        matches!(self, Team::Maga | Team::Snowflake)
    }

    pub fn label(self) -> &'static str {
        match self {
            Team::TheDonald => "The Donald",
            Team::Karen => "Karen",
            Team::Maga => "MAGA",
            Team::Snowflake => "Snowflake",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Play {
    Cooperate,
    Defect,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    Left,
    Up,
    Down,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Left,
        Direction::Up,
        Direction::Down,
        Direction::Right,
    ];
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    pub x: u32,
    pub y: u32,
}

impl Position {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    pub id: AgentId,
    pub team: Team,
    /// `None` once the agent is dead.
    pub position: Option<Position>,
    pub points: i32,
    pub partner: Option<AgentId>,
    pub play: Option<Play>,
    /// Last observed play per opponent. Only snowflakes remember.
    pub memory: BTreeMap<AgentId, Play>,
    pub memory_completeness_percent: u8,
}

impl AgentState {
    pub fn new(id: AgentId, team: Team) -> Self {
        Self {
            id,
            team,
            position: None,
            points: STARTING_POINTS,
            partner: None,
            play: None,
            memory: BTreeMap::new(),
            memory_completeness_percent: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.points > 0
    }

    pub fn display_name(&self) -> String {
        match self.team {
            Team::TheDonald => Team::TheDonald.label().to_owned(),
            team => format!("{} {}", team.label(), self.id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Win { winner: AgentId },
    Extinction,
    Overflow { agent: AgentId },
    Aborted { reason: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn winner(&self) -> Option<AgentId> {
        match self {
            RunStatus::Win { winner } => Some(*winner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Move,
    Approach,
    ChoosePlay,
    UpdateMemory,
    Tally,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Move,
        Phase::Approach,
        Phase::ChoosePlay,
        Phase::UpdateMemory,
        Phase::Tally,
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEvent {
    RiskIntroduced,
    CooperatorsExtinct,
    Winner { agent: AgentId, name: String },
    NoWinners,
    Overflow { agent: AgentId },
    Aborted { reason: String },
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEvent::RiskIntroduced => f.write_str("engagement risk introduced"),
            LogEvent::CooperatorsExtinct => f.write_str("all cooperators have died"),
            LogEvent::Winner { name, .. } => write!(f, "{name} wins!"),
            LogEvent::NoWinners => f.write_str("there are no winners"),
            LogEvent::Overflow { agent } => write!(f, "overflow error: agent {agent}"),
            LogEvent::Aborted { reason } => write!(f, "simulation aborted: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentMove {
    pub id: AgentId,
    pub from: Position,
    pub to: Position,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pairing {
    pub initiator: AgentId,
    pub partner: AgentId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayChoice {
    pub id: AgentId,
    pub play: Play,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreChange {
    pub id: AgentId,
    pub delta: i32,
    pub points: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryUpdate {
    pub id: AgentId,
    pub opponent: AgentId,
    pub play: Play,
    pub completeness_percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub turns: u64,
    pub alive: u32,
    pub alive_by_team: BTreeMap<Team, u32>,
    pub any_cooperator_alive: bool,
    pub risk_engaged: bool,
    pub engagements_last_turn: u32,
    pub deaths_last_turn: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnDelta {
    pub turn: u64,
    pub moves: Vec<AgentMove>,
    pub pairings: Vec<Pairing>,
    pub plays: Vec<PlayChoice>,
    pub memory_updates: Vec<MemoryUpdate>,
    pub score_changes: Vec<ScoreChange>,
    pub deaths: Vec<AgentId>,
    pub logs: Vec<LogEvent>,
    pub status: RunStatus,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OccupancyCell {
    pub x: u32,
    pub y: u32,
    pub agent: AgentId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSnapshot {
    pub turn: u64,
    pub config: SimulationConfig,
    pub width: u32,
    pub height: u32,
    pub agents: Vec<AgentState>,
    pub occupancy: Vec<OccupancyCell>,
    pub status: RunStatus,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationConfig {
    pub population: u32,
    #[serde(default)]
    pub risk_probability: Option<f64>,
    #[serde(default = "default_speed")]
    pub speed: u8,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub phase_settle_ms: u64,
}

impl SimulationConfig {
    /// Idle time between automatic turns. `None` means turns run back to back.
    pub fn cadence_interval(&self) -> Option<Duration> {
        cadence_interval(self.speed)
    }

    pub fn phase_settle(&self) -> Duration {
        Duration::from_millis(self.phase_settle_ms)
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        default_simulation_config()
    }
}

pub fn cadence_interval(speed: u8) -> Option<Duration> {
    if speed >= MAX_SPEED {
        return None;
    }
    Some(Duration::from_millis(
        u64::from(MAX_SPEED - speed) * CADENCE_STEP_MS,
    ))
}

pub fn simulation_config_from_toml_str(raw: &str) -> Result<SimulationConfig, toml::de::Error> {
    toml::from_str(raw)
}

fn default_simulation_config() -> SimulationConfig {
    simulation_config_from_toml_str(include_str!("../default.toml"))
        .expect("default simulation config TOML must deserialize")
}

fn default_speed() -> u8 {
    25
}
