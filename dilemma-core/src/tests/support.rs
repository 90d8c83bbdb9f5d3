use super::*;

/// Byte that makes a move draw stay in place.
pub(super) const STAY: u8 = 255;
/// Approach draw (out of four fresh directions) that picks `Right`.
pub(super) const APPROACH_RIGHT: u8 = 192;

pub(super) fn test_config(population: u32) -> SimulationConfig {
    SimulationConfig {
        population,
        risk_probability: None,
        speed: 25,
        seed: Some(7),
        phase_settle_ms: 0,
    }
}

pub(super) fn seeded_engine(population: u32, seed: u64) -> TurnEngine {
    let mut config = test_config(population);
    config.seed = Some(seed);
    TurnEngine::new(config).expect("engine should initialize")
}

/// Puts agent `i` at `positions[i]` (or kills it when `None`), resets every
/// record and swaps in a scripted random stream.
pub(super) fn configure_run(
    engine: &mut TurnEngine,
    positions: &[Option<(u32, u32)>],
    script: Vec<u8>,
) {
    assert_eq!(positions.len(), engine.agents.len());
    engine.grid.clear();
    for (agent, slot) in engine.agents.iter_mut().zip(positions) {
        agent.partner = None;
        agent.play = None;
        agent.memory.clear();
        agent.memory_completeness_percent = 0;
        match slot {
            Some((x, y)) => {
                let position = Position::new(*x, *y);
                assert!(engine.grid.place(position, agent.id), "cell taken twice");
                agent.position = Some(position);
                agent.points = STARTING_POINTS;
            }
            None => {
                agent.position = None;
                agent.points = 0;
            }
        }
    }
    engine.alive = positions.iter().flatten().count() as u32;
    engine.any_cooperator_alive = engine.cooperator_alive();
    engine.risk_engaged = false;
    engine.status = RunStatus::Running;
    engine.refresh_metrics(0, 0);
    engine.random = RandomSource::scripted(script);
}

pub(super) fn set_points(engine: &mut TurnEngine, id: u32, points: i32) {
    engine.agents[id as usize].points = points;
}

pub(super) fn points(engine: &TurnEngine) -> Vec<i32> {
    engine.agents().iter().map(|agent| agent.points).collect()
}

pub(super) fn position(engine: &TurnEngine, id: u32) -> Option<Position> {
    engine.agent(AgentId(id)).and_then(|agent| agent.position)
}

pub(super) fn tick_once(engine: &mut TurnEngine) -> dilemma_types::TurnDelta {
    engine.tick().expect("turn should complete")
}
