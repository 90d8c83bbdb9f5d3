use dilemma_core::SimError;
use dilemma_server::protocol::{ClientCommand, SimEvent, TurnRequest};
use dilemma_server::Scheduler;
use dilemma_types::{Phase, RunStatus, SimulationConfig, STARTING_POINTS};
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

fn config(population: u32, speed: u8, phase_settle_ms: u64) -> SimulationConfig {
    SimulationConfig {
        population,
        risk_probability: None,
        speed,
        seed: Some(42),
        phase_settle_ms,
    }
}

fn scheduler(config: SimulationConfig) -> Scheduler {
    Scheduler::from_config(config).expect("scheduler init")
}

#[tokio::test]
async fn step_runs_phases_in_order_then_reports_the_turn() {
    let scheduler = scheduler(config(12, 25, 0));
    let mut events = scheduler.subscribe();

    let request = scheduler.step().await.expect("step");
    assert_eq!(request, TurnRequest::Executed(1));
    assert_eq!(scheduler.snapshot().await.turn, 1);

    let mut phases = Vec::new();
    loop {
        match events.try_recv() {
            Ok(SimEvent::PhaseCompleted { turn, phase }) => {
                assert_eq!(turn, 1);
                phases.push(phase);
            }
            Ok(SimEvent::TurnDelta(delta)) => {
                assert_eq!(delta.turn, 1);
                break;
            }
            Ok(other) => panic!("unexpected event {other:?}"),
            Err(TryRecvError::Empty) => panic!("turn delta was never sent"),
            Err(err) => panic!("event channel failed: {err}"),
        }
    }
    assert_eq!(phases, Phase::ALL.to_vec());
}

#[tokio::test]
async fn requests_during_a_turn_queue_once_and_drop_the_rest() {
    // Five 40 ms settles keep the first turn in flight for ~200 ms.
    let scheduler = scheduler(config(12, 25, 40));

    let first = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.step().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(scheduler.step().await.expect("queue"), TurnRequest::Queued);
    assert_eq!(scheduler.step().await.expect("drop"), TurnRequest::Dropped);

    let executed = first.await.expect("join").expect("first step");
    assert_eq!(executed, TurnRequest::Executed(2));
    assert_eq!(scheduler.snapshot().await.turn, 2);
}

#[tokio::test]
async fn pause_stops_the_cadence_at_a_turn_boundary() {
    let scheduler = scheduler(config(16, 50, 0));
    assert!(scheduler.run().await);
    assert!(!scheduler.run().await, "second run is a no-op");
    tokio::time::sleep(Duration::from_millis(30)).await;

    scheduler.pause().await;
    assert!(!scheduler.is_running().await);
    let paused_at = scheduler.snapshot().await.turn;
    assert!(paused_at > 0);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(scheduler.snapshot().await.turn, paused_at);
}

#[tokio::test]
async fn pause_discards_a_cadence_turn_queued_behind_a_manual_step() {
    // Speed 0 fires the cadence every second; each turn takes ~400 ms.
    let scheduler = scheduler(config(16, 0, 80));
    assert!(scheduler.run().await);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(scheduler.snapshot().await.turn, 1);

    let manual = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.step().await })
    };
    // The cadence wakes at ~1400 ms while the manual turn is in flight.
    tokio::time::sleep(Duration::from_millis(300)).await;
    scheduler.pause().await;

    let outcome = manual.await.expect("join").expect("manual step");
    assert_eq!(outcome, TurnRequest::Executed(1));
    assert!(!scheduler.is_running().await);
    assert_eq!(scheduler.snapshot().await.turn, 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.snapshot().await.turn, 2);
}

#[tokio::test]
async fn cadence_stops_by_itself_when_the_run_ends() {
    let mut cfg = config(2, 50, 0);
    cfg.risk_probability = Some(1.0);
    let scheduler = scheduler(cfg);
    let mut events = scheduler.subscribe();
    assert!(scheduler.run().await);

    let status = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(SimEvent::RunEnded { status }) => break status,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("run should end");

    assert!(status.is_terminal());
    assert!(!matches!(status, RunStatus::Aborted { .. }));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!scheduler.is_running().await);
    assert_eq!(scheduler.step().await.expect("step"), TurnRequest::Ignored);
    assert!(!scheduler.run().await);
}

#[tokio::test]
async fn restart_mid_run_waits_for_the_turn_and_resets_everything() {
    let scheduler = scheduler(config(16, 49, 5));
    let mut events = scheduler.subscribe();
    assert!(scheduler.run().await);
    tokio::time::sleep(Duration::from_millis(80)).await;

    let snapshot = scheduler.restart().await.expect("restart");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let reset_at = seen
        .iter()
        .position(|event| matches!(event, SimEvent::StateSnapshot(s) if s.turn == 0))
        .expect("restart publishes a fresh snapshot");
    let (before, after) = seen.split_at(reset_at);
    for event in before {
        if let SimEvent::PhaseCompleted { turn, .. } = event {
            assert!(
                before
                    .iter()
                    .any(|e| matches!(e, SimEvent::TurnDelta(delta) if delta.turn == *turn)),
                "turn {turn} was cut short by the restart"
            );
        }
    }
    assert!(before
        .iter()
        .any(|event| matches!(event, SimEvent::TurnDelta(_))));
    assert!(!after
        .iter()
        .any(|event| matches!(event, SimEvent::PhaseCompleted { .. })));

    assert!(!scheduler.is_running().await);
    assert_eq!(snapshot.turn, 0);
    assert_eq!(snapshot.status, RunStatus::Running);
    assert_eq!(snapshot.occupancy.len(), 16);
    assert!(snapshot
        .agents
        .iter()
        .all(|agent| agent.points == STARTING_POINTS));

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(scheduler.snapshot().await.turn, 0);
}

#[tokio::test]
async fn client_commands_apply_in_the_order_given() {
    let scheduler = scheduler(config(12, 25, 0));
    let mut events = scheduler.subscribe();

    for command in [
        ClientCommand::Step,
        ClientCommand::Restart,
        ClientCommand::SetSpeed { speed: 10 },
        ClientCommand::Step,
    ] {
        scheduler.apply(command).await.expect("command applies");
    }
    assert_eq!(scheduler.snapshot().await.turn, 1);
    assert_eq!(scheduler.config().await.speed, 10);

    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            SimEvent::TurnDelta(delta) => order.push(format!("turn {}", delta.turn)),
            SimEvent::StateSnapshot(snapshot) => {
                order.push(format!("snapshot {}", snapshot.turn))
            }
            _ => {}
        }
    }
    assert_eq!(order, vec!["turn 1", "snapshot 0", "turn 1"]);

    assert!(matches!(
        scheduler.apply(ClientCommand::SetSpeed { speed: 60 }).await,
        Err(SimError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn risk_and_speed_settings_are_validated() {
    let scheduler = scheduler(config(8, 25, 0));
    scheduler.set_risk_probability(0.3).await.expect("set risk");
    scheduler.step().await.expect("step");
    assert_eq!(
        scheduler.set_risk_probability(0.5).await,
        Err(SimError::RiskLocked)
    );

    assert!(matches!(
        scheduler.set_speed(51).await,
        Err(SimError::InvalidConfig(_))
    ));
    scheduler.set_speed(10).await.expect("set speed");
    assert_eq!(scheduler.config().await.speed, 10);
}
