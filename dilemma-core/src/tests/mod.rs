pub(super) use super::*;
pub(super) use dilemma_types::{
    AgentId, LogEvent, Phase, Play, Position, RunStatus, SimulationConfig, Team, STARTING_POINTS,
};

mod grid_and_neighbors;
mod support;
