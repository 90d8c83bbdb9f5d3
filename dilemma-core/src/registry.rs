use crate::{SimError, TurnEngine};
use dilemma_types::{AgentId, AgentState, Position, Team, STARTING_POINTS};
use std::collections::BTreeMap;

/// Placement draws allowed per grid cell before giving up on a scripted
/// stream that never lands on an empty cell.
const PLACEMENT_DRAWS_PER_CELL: usize = 64;

/// Team of agent `id` in a population of `population`.
///
/// Agent 0 is always The Donald; the rest are split as evenly as possible,
/// in id order, across the roster teams.
pub fn team_for(id: AgentId, population: u32) -> Team {
    if id.0 == 0 || population < 2 {
        return Team::TheDonald;
    }
    let roster_len = Team::ROSTER.len() as u64;
    let slot = (u64::from(id.0 - 1) * roster_len) / u64::from(population - 1);
    Team::ROSTER[(slot as usize).min(Team::ROSTER.len() - 1)]
}

impl TurnEngine {
    /// Assigns every agent its team and rebuilds the per-team rosters.
    pub fn stoke(&mut self) {
        let population = self.config.population;
        self.agents.truncate(population as usize);
        for raw_id in self.agents.len() as u32..population {
            let id = AgentId(raw_id);
            self.agents.push(AgentState::new(id, team_for(id, population)));
        }

        let mut rosters: BTreeMap<Team, Vec<AgentId>> =
            Team::ALL.iter().map(|team| (*team, Vec::new())).collect();
        for agent in &mut self.agents {
            agent.team = team_for(agent.id, population);
            rosters.entry(agent.team).or_default().push(agent.id);
        }
        self.rosters = rosters;
    }

    /// Drops every agent on a random empty cell, in id order, with a clean
    /// record.
    pub(crate) fn place_agents_randomly(&mut self) -> Result<(), SimError> {
        self.grid.clear();
        let width = self.grid.width() as usize;
        let height = self.grid.height() as usize;
        let max_draws = width * height * PLACEMENT_DRAWS_PER_CELL;

        for idx in 0..self.agents.len() {
            let id = self.agents[idx].id;
            let mut draws = 0;
            let position = loop {
                if draws >= max_draws {
                    return Err(SimError::Invariant(format!(
                        "no empty cell found for agent {id} after {draws} draws"
                    )));
                }
                draws += 1;
                let x = self.random.below(width) as u32;
                let y = self.random.below(height) as u32;
                let candidate = Position::new(x, y);
                if self.grid.place(candidate, id) {
                    break candidate;
                }
            };

            let agent = &mut self.agents[idx];
            agent.position = Some(position);
            agent.points = STARTING_POINTS;
            agent.partner = None;
            agent.play = None;
            agent.memory.clear();
            agent.memory_completeness_percent = 0;
        }
        Ok(())
    }
}
