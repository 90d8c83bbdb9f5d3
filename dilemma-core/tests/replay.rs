use dilemma_core::{RandomSource, TurnEngine};
use dilemma_types::{RunStatus, SimulationConfig};

fn config(seed: u64) -> SimulationConfig {
    SimulationConfig {
        population: 18,
        risk_probability: Some(0.25),
        speed: 50,
        seed: Some(seed),
        phase_settle_ms: 0,
    }
}

#[test]
fn replay_log_reproduces_a_seeded_run() {
    let mut original = TurnEngine::new(config(42)).expect("engine init");
    let status = original.run_to_completion(2_000);
    assert!(!matches!(status, RunStatus::Aborted { .. }));

    let bytes = original.random().replay_log().to_vec();
    let mut replayed = TurnEngine::with_random_source(config(42), RandomSource::scripted(bytes))
        .expect("replay engine init");
    replayed.run_to_completion(2_000);

    assert_eq!(replayed.snapshot(), original.snapshot());
    assert_eq!(replayed.random().replay_log(), original.random().replay_log());
}

#[test]
fn replay_covers_restarts_within_a_session() {
    let mut original = TurnEngine::new(config(7)).expect("engine init");
    original.step_n(25);
    original.restart().expect("restart");
    original.step_n(25);

    let bytes = original.random().replay_log().to_vec();
    let mut replayed = TurnEngine::with_random_source(config(7), RandomSource::scripted(bytes))
        .expect("replay engine init");
    replayed.step_n(25);
    replayed.restart().expect("restart");
    replayed.step_n(25);

    assert_eq!(replayed.snapshot(), original.snapshot());
}

#[test]
fn different_seeds_diverge() {
    let mut a = TurnEngine::new(config(1)).expect("engine init");
    let mut b = TurnEngine::new(config(2)).expect("engine init");
    a.step_n(10);
    b.step_n(10);
    assert_ne!(a.random().replay_log(), b.random().replay_log());
}
