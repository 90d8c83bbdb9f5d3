use crate::grid::Neighbor;
use crate::{SimError, TurnEngine};
use dilemma_types::{
    AgentId, AgentMove, Direction, LogEvent, MemoryUpdate, Pairing, Phase, Play, PlayChoice,
    Position, RunStatus, ScoreChange, Team, TurnDelta, POINTS_CEILING,
};
use tracing::{debug, error, info};

/// Move draws are `0..MOVE_DRAW_RANGE`; the last value means stay put.
const MOVE_DRAW_RANGE: usize = 9;
const STAY_DRAW: usize = MOVE_DRAW_RANGE - 1;
const RISK_PENALTY: i32 = 1;

/// A turn in progress. Phases run strictly in [`Phase::ALL`] order.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    turn: u64,
    cursor: usize,
    moves: Vec<AgentMove>,
    pairings: Vec<Pairing>,
    plays: Vec<PlayChoice>,
    memory_updates: Vec<MemoryUpdate>,
    score_changes: Vec<ScoreChange>,
    deaths: Vec<AgentId>,
    logs: Vec<LogEvent>,
    overflow: Option<AgentId>,
    engagements: u32,
}

impl PendingTurn {
    fn new(turn: u64) -> Self {
        Self {
            turn,
            cursor: 0,
            moves: Vec::new(),
            pairings: Vec::new(),
            plays: Vec::new(),
            memory_updates: Vec::new(),
            score_changes: Vec::new(),
            deaths: Vec::new(),
            logs: Vec::new(),
            overflow: None,
            engagements: 0,
        }
    }

    /// 1-based number of the turn being played.
    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn next_phase(&self) -> Option<Phase> {
        Phase::ALL.get(self.cursor).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.cursor >= Phase::ALL.len()
    }
}

/// Play an agent of `team` makes against a partner of `partner_team`.
/// `remembered` is the partner's last play as recorded in the agent's memory.
pub fn choose_play(team: Team, partner_team: Team, remembered: Option<Play>) -> Play {
    match team {
        Team::TheDonald | Team::Karen => Play::Defect,
        Team::Maga => match partner_team {
            Team::Maga | Team::TheDonald => Play::Cooperate,
            Team::Karen | Team::Snowflake => Play::Defect,
        },
        Team::Snowflake => remembered.unwrap_or(Play::Cooperate),
    }
}

/// Points gained by the agent playing `own` against `other`.
pub fn payoff(own: Play, other: Play) -> i32 {
    match (own, other) {
        (Play::Cooperate, Play::Cooperate) => 1,
        (Play::Cooperate, Play::Defect) => -1,
        (Play::Defect, Play::Cooperate) => 2,
        (Play::Defect, Play::Defect) => 0,
    }
}

impl TurnEngine {
    /// Runs one whole turn without suspension points.
    pub fn tick(&mut self) -> Result<TurnDelta, SimError> {
        let mut pending = self.begin_turn()?;
        while self.advance_phase(&mut pending)?.is_some() {}
        Ok(self.finish_turn(pending))
    }

    /// Plays up to `count` turns, stopping early once the run ends.
    pub fn step_n(&mut self, count: u32) -> Vec<TurnDelta> {
        let mut deltas = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match self.tick() {
                Ok(delta) => {
                    let ended = delta.status.is_terminal();
                    deltas.push(delta);
                    if ended {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        deltas
    }

    /// Plays until the run reaches a terminal status or `max_turns` elapse.
    pub fn run_to_completion(&mut self, max_turns: u64) -> RunStatus {
        while !self.status.is_terminal() && self.turn < max_turns {
            if self.tick().is_err() {
                break;
            }
        }
        self.status.clone()
    }

    pub fn begin_turn(&mut self) -> Result<PendingTurn, SimError> {
        if self.status.is_terminal() {
            return Err(SimError::RunFinished(self.status.clone()));
        }
        Ok(PendingTurn::new(self.turn + 1))
    }

    /// Runs the next phase of `pending`. Returns `None` once every phase ran.
    ///
    /// A phase failing an invariant check aborts the run.
    pub fn advance_phase(&mut self, pending: &mut PendingTurn) -> Result<Option<Phase>, SimError> {
        let Some(phase) = pending.next_phase() else {
            return Ok(None);
        };
        if self.status.is_terminal() {
            return Err(SimError::RunFinished(self.status.clone()));
        }
        if pending.turn != self.turn + 1 {
            let err = SimError::Invariant(format!(
                "pending turn {} does not follow turn {}",
                pending.turn, self.turn
            ));
            self.abort(pending, &err);
            return Err(err);
        }

        let result = match phase {
            Phase::Move => self.move_phase(pending),
            Phase::Approach => self.approach_phase(pending),
            Phase::ChoosePlay => self.choose_play_phase(pending),
            Phase::UpdateMemory => self.update_memory_phase(pending),
            Phase::Tally => self.tally_phase(pending),
        };
        if let Err(err) = result {
            self.abort(pending, &err);
            return Err(err);
        }

        pending.cursor += 1;
        Ok(Some(phase))
    }

    /// Settles the run status and produces the turn's observation record.
    pub fn finish_turn(&mut self, mut pending: PendingTurn) -> TurnDelta {
        if !pending.is_complete() && !self.status.is_terminal() {
            let err = SimError::Invariant(format!(
                "turn {} finished after only {} phases",
                pending.turn, pending.cursor
            ));
            self.abort(&mut pending, &err);
        }

        if pending.is_complete() {
            self.turn = pending.turn;
            if !self.status.is_terminal() {
                self.settle_status(&mut pending);
            }
            self.debug_assert_consistent_state();
        }
        self.refresh_metrics(pending.engagements, pending.deaths.len() as u32);

        TurnDelta {
            turn: pending.turn,
            moves: pending.moves,
            pairings: pending.pairings,
            plays: pending.plays,
            memory_updates: pending.memory_updates,
            score_changes: pending.score_changes,
            deaths: pending.deaths,
            logs: pending.logs,
            status: self.status.clone(),
            metrics: self.metrics.clone(),
        }
    }

    fn move_phase(&mut self, pending: &mut PendingTurn) -> Result<(), SimError> {
        for idx in 0..self.agents.len() {
            let agent = &self.agents[idx];
            if !agent.is_alive() || agent.partner.is_some() {
                continue;
            }
            let id = agent.id;
            let from = self.position_of(idx)?;

            let mut remaining = Direction::ALL.to_vec();
            while !remaining.is_empty() {
                let draw = self.random.below(MOVE_DRAW_RANGE);
                if draw == STAY_DRAW {
                    break;
                }
                // Redraw past the last full multiple of the remaining count.
                if draw >= STAY_DRAW - STAY_DRAW % remaining.len() {
                    continue;
                }
                let direction = remaining.remove(draw % remaining.len());
                let Some(to) = self.grid.step(from, direction, self.alive) else {
                    continue;
                };
                if self.grid.occupant(to).is_some() {
                    continue;
                }
                self.relocate(idx, from, to)?;
                pending.moves.push(AgentMove { id, from, to });
                break;
            }
        }
        Ok(())
    }

    fn approach_phase(&mut self, pending: &mut PendingTurn) -> Result<(), SimError> {
        for idx in 0..self.agents.len() {
            let agent = &self.agents[idx];
            if !agent.is_alive() || agent.partner.is_some() {
                continue;
            }
            let id = agent.id;
            let position = self.position_of(idx)?;

            let mut remaining = Direction::ALL.to_vec();
            while !remaining.is_empty() {
                let direction = remaining.remove(self.random.below(remaining.len()));
                let Neighbor::Occupied(other) = self.grid.neighbor(position, direction, self.alive)
                else {
                    continue;
                };
                let Some(candidate) = self.agents.get(other.index()) else {
                    return Err(SimError::Invariant(format!(
                        "grid holds unknown agent {other}"
                    )));
                };
                if other == id || !candidate.is_alive() || candidate.partner.is_some() {
                    continue;
                }

                self.agents[idx].partner = Some(other);
                self.agents[other.index()].partner = Some(id);
                pending.pairings.push(Pairing {
                    initiator: id,
                    partner: other,
                });
                break;
            }
        }
        pending.engagements = pending.pairings.len() as u32;
        Ok(())
    }

    fn choose_play_phase(&mut self, pending: &mut PendingTurn) -> Result<(), SimError> {
        for idx in 0..self.agents.len() {
            self.agents[idx].play = None;
            if !self.agents[idx].is_alive() {
                continue;
            }
            let Some(partner) = self.partner_of(idx)? else {
                continue;
            };
            let agent = &self.agents[idx];
            let partner_team = self.agents[partner.index()].team;
            let remembered = agent.memory.get(&partner).copied();
            let play = choose_play(agent.team, partner_team, remembered);

            self.agents[idx].play = Some(play);
            pending.plays.push(PlayChoice {
                id: self.agents[idx].id,
                play,
            });
        }
        Ok(())
    }

    fn update_memory_phase(&mut self, pending: &mut PendingTurn) -> Result<(), SimError> {
        let opponents = self.alive.saturating_sub(1) as usize;
        let mut memory_incomplete = false;

        for idx in 0..self.agents.len() {
            if !self.agents[idx].is_alive() || self.agents[idx].team != Team::Snowflake {
                continue;
            }
            if let Some(partner) = self.partner_of(idx)? {
                let Some(observed) = self.agents[partner.index()].play else {
                    return Err(SimError::Invariant(format!(
                        "partner {partner} of agent {} has no play",
                        self.agents[idx].id
                    )));
                };
                let agent = &mut self.agents[idx];
                agent.memory.insert(partner, observed);
                agent.memory_completeness_percent =
                    memory_completeness_percent(agent.memory.len(), opponents);
                pending.memory_updates.push(MemoryUpdate {
                    id: agent.id,
                    opponent: partner,
                    play: observed,
                    completeness_percent: agent.memory_completeness_percent,
                });
            } else {
                let agent = &mut self.agents[idx];
                agent.memory_completeness_percent =
                    memory_completeness_percent(agent.memory.len(), opponents);
            }

            if self.agents[idx].memory.len() < opponents {
                memory_incomplete = true;
            }
        }

        if !memory_incomplete && !self.risk_engaged && self.risk_probability() > 0.0 {
            self.risk_engaged = true;
            info!(turn = pending.turn, "engagement risk introduced");
            pending.logs.push(LogEvent::RiskIntroduced);
        }
        Ok(())
    }

    fn tally_phase(&mut self, pending: &mut PendingTurn) -> Result<(), SimError> {
        let mut engaged = Vec::new();
        for idx in 0..self.agents.len() {
            if !self.agents[idx].is_alive() {
                continue;
            }
            if let Some(partner) = self.partner_of(idx)? {
                engaged.push((idx, partner));
            }
        }

        let risk = self.risk_probability();
        for (idx, partner) in engaged {
            let agent = &self.agents[idx];
            let id = agent.id;
            let (Some(own), Some(other)) = (agent.play, self.agents[partner.index()].play) else {
                return Err(SimError::Invariant(format!(
                    "engaged pair {id}/{partner} is missing a play"
                )));
            };

            let mut delta = payoff(own, other);
            let mut points = agent.points + delta;
            let exposed = !self.any_cooperator_alive || agent.team != Team::Karen;
            if self.risk_engaged && points > 0 && exposed && self.random.next() < risk {
                delta -= RISK_PENALTY;
                points -= RISK_PENALTY;
            }

            self.agents[idx].points = points;
            if delta != 0 {
                pending.score_changes.push(ScoreChange {
                    id,
                    delta,
                    points: points.max(0),
                });
            }
            if points > POINTS_CEILING && pending.overflow.is_none() {
                pending.overflow = Some(id);
            }
            if points <= 0 {
                self.kill(idx)?;
                pending.deaths.push(id);
            }
        }

        for agent in &mut self.agents {
            agent.partner = None;
            agent.play = None;
        }

        let cooperators_before = self.any_cooperator_alive;
        self.any_cooperator_alive = self.cooperator_alive();
        if cooperators_before && !self.any_cooperator_alive {
            info!(turn = pending.turn, "all cooperators have died");
            pending.logs.push(LogEvent::CooperatorsExtinct);
        }
        Ok(())
    }

    fn settle_status(&mut self, pending: &mut PendingTurn) {
        if let Some(agent) = pending.overflow {
            error!(turn = pending.turn, agent = agent.0, "points overflow");
            self.status = RunStatus::Overflow { agent };
            pending.logs.push(LogEvent::Overflow { agent });
            return;
        }

        match self.alive {
            0 => {
                info!(turn = pending.turn, "run ended with no survivors");
                self.status = RunStatus::Extinction;
                pending.logs.push(LogEvent::NoWinners);
            }
            1 => {
                let survivor = self
                    .agents
                    .iter()
                    .find(|agent| agent.is_alive())
                    .map(|agent| (agent.id, agent.display_name()));
                let Some((winner, name)) = survivor else {
                    let err = SimError::Invariant("one agent counted alive but none found".into());
                    self.abort(pending, &err);
                    return;
                };
                info!(turn = pending.turn, winner = winner.0, "{name} wins");
                self.status = RunStatus::Win { winner };
                pending.logs.push(LogEvent::Winner {
                    agent: winner,
                    name,
                });
            }
            _ => {}
        }
    }

    fn abort(&mut self, pending: &mut PendingTurn, err: &SimError) {
        let reason = err.to_string();
        error!(turn = pending.turn, %reason, "simulation aborted");
        self.status = RunStatus::Aborted {
            reason: reason.clone(),
        };
        pending.logs.push(LogEvent::Aborted { reason });
    }

    fn relocate(&mut self, idx: usize, from: Position, to: Position) -> Result<(), SimError> {
        let id = self.agents[idx].id;
        if !self.grid.vacate(from, id) || !self.grid.place(to, id) {
            return Err(SimError::Invariant(format!(
                "agent {id} cannot move from ({}, {}) to ({}, {})",
                from.x, from.y, to.x, to.y
            )));
        }
        self.agents[idx].position = Some(to);
        Ok(())
    }

    fn kill(&mut self, idx: usize) -> Result<(), SimError> {
        let id = self.agents[idx].id;
        let position = self.position_of(idx)?;
        if !self.grid.vacate(position, id) {
            return Err(SimError::Invariant(format!(
                "dying agent {id} is not on its cell"
            )));
        }
        let agent = &mut self.agents[idx];
        agent.points = 0;
        agent.position = None;
        self.alive = self.alive.saturating_sub(1);
        debug!(agent = id.0, "agent died");
        Ok(())
    }

    fn position_of(&self, idx: usize) -> Result<Position, SimError> {
        self.agents[idx].position.ok_or_else(|| {
            SimError::Invariant(format!(
                "alive agent {} has no position",
                self.agents[idx].id
            ))
        })
    }

    /// Partner of agent `idx`, checked for symmetry.
    fn partner_of(&self, idx: usize) -> Result<Option<AgentId>, SimError> {
        let agent = &self.agents[idx];
        let Some(partner) = agent.partner else {
            return Ok(None);
        };
        let mirrored = self.agents.get(partner.index()).and_then(|other| other.partner);
        if mirrored != Some(agent.id) {
            return Err(SimError::Invariant(format!(
                "agent {} is paired with {partner} but not vice versa",
                agent.id
            )));
        }
        Ok(Some(partner))
    }
}

fn memory_completeness_percent(remembered: usize, opponents: usize) -> u8 {
    if opponents == 0 {
        return 100;
    }
    let percent = (100.0 * remembered as f64 / opponents as f64).round();
    percent.min(100.0) as u8
}
