use crate::protocol::{ApiError, ClientCommand, SimEvent, TurnRequest};
use dilemma_core::{SimError, TurnEngine};
use dilemma_types::{cadence_interval, RunSnapshot, SimulationConfig, TurnDelta};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Drives a [`TurnEngine`] from async code: manual steps, a cadence timer,
/// pause and restart.
///
/// At most one turn runs at a time. A turn requested while another is in
/// flight is remembered once and run right after; further requests are
/// dropped. Pause and restart only take effect between turns.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

struct Shared {
    engine: Mutex<TurnEngine>,
    gate: Mutex<TurnGate>,
    runtime: Mutex<RuntimeState>,
    wake: Notify,
    events: broadcast::Sender<SimEvent>,
}

#[derive(Default)]
struct TurnGate {
    in_flight: bool,
    pending: Option<Origin>,
}

/// Who asked for a turn. Pausing discards queued cadence turns only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Manual,
    Cadence,
}

struct RuntimeState {
    running: bool,
    speed: u8,
    generation: u64,
    runner: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(engine: TurnEngine) -> Self {
        let speed = engine.config().speed;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                engine: Mutex::new(engine),
                gate: Mutex::new(TurnGate::default()),
                runtime: Mutex::new(RuntimeState {
                    running: false,
                    speed,
                    generation: 0,
                    runner: None,
                }),
                wake: Notify::new(),
                events,
            }),
        }
    }

    pub fn from_config(config: SimulationConfig) -> Result<Self, SimError> {
        Ok(Self::new(TurnEngine::new(config)?))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SimEvent> {
        self.shared.events.subscribe()
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        self.shared.engine.lock().await.snapshot()
    }

    pub async fn config(&self) -> SimulationConfig {
        self.shared.engine.lock().await.config().clone()
    }

    pub async fn is_running(&self) -> bool {
        self.shared.runtime.lock().await.running
    }

    /// Requests exactly one turn, independent of the cadence.
    pub async fn step(&self) -> Result<TurnRequest, SimError> {
        request_turn(&self.shared, Origin::Manual).await
    }

    /// Starts automatic turns. Returns false if the cadence was already
    /// running or the run has ended.
    pub async fn run(&self) -> bool {
        if self.shared.engine.lock().await.status().is_terminal() {
            return false;
        }

        let mut runtime = self.shared.runtime.lock().await;
        if runtime.running {
            return false;
        }
        runtime.running = true;
        runtime.generation += 1;
        let generation = runtime.generation;
        info!(speed = runtime.speed, "cadence started");
        runtime.runner = Some(tokio::spawn(cadence_loop(
            self.shared.clone(),
            generation,
        )));
        true
    }

    /// Stops automatic turns once the turn in flight, if any, completes.
    pub async fn pause(&self) {
        let runner = {
            let mut runtime = self.shared.runtime.lock().await;
            if !runtime.running && runtime.runner.is_none() {
                return;
            }
            runtime.running = false;
            runtime.runner.take()
        };
        {
            let mut gate = self.shared.gate.lock().await;
            if gate.pending == Some(Origin::Cadence) {
                debug!("queued cadence turn discarded");
                gate.pending = None;
            }
        }
        self.shared.wake.notify_waiters();

        if let Some(handle) = runner {
            if let Err(err) = handle.await {
                warn!("cadence task ended abnormally: {err}");
            }
        }
        info!("cadence paused");
    }

    /// Stops the cadence, discards any queued turn, waits for the turn in
    /// flight and starts a fresh run with the current settings.
    pub async fn restart(&self) -> Result<RunSnapshot, SimError> {
        self.pause().await;
        self.shared.gate.lock().await.pending = None;

        let snapshot = {
            let mut engine = self.shared.engine.lock().await;
            engine.restart()?;
            engine.snapshot()
        };
        info!(population = snapshot.agents.len(), "run restarted");
        self.publish(SimEvent::StateSnapshot(snapshot.clone()));
        Ok(snapshot)
    }

    pub async fn set_speed(&self, speed: u8) -> Result<(), SimError> {
        self.shared.engine.lock().await.set_speed(speed)?;
        self.shared.runtime.lock().await.speed = speed;
        // Let a sleeping cadence pick up the new interval.
        self.shared.wake.notify_waiters();
        Ok(())
    }

    pub async fn set_risk_probability(&self, probability: f64) -> Result<(), SimError> {
        self.shared
            .engine
            .lock()
            .await
            .set_risk_probability(probability)
    }

    /// Applies a command received from a client.
    pub async fn apply(&self, command: ClientCommand) -> Result<(), SimError> {
        match command {
            ClientCommand::Run => {
                self.run().await;
            }
            ClientCommand::Pause => self.pause().await,
            ClientCommand::Step => {
                self.step().await?;
            }
            ClientCommand::Restart => {
                self.restart().await?;
            }
            ClientCommand::SetSpeed { speed } => self.set_speed(speed).await?,
            ClientCommand::SetRisk { risk_probability } => {
                self.set_risk_probability(risk_probability).await?
            }
        }
        Ok(())
    }

    /// Sends `event` to every subscriber, if any.
    pub fn publish(&self, event: SimEvent) {
        let _ = self.shared.events.send(event);
    }
}

async fn request_turn(shared: &Shared, origin: Origin) -> Result<TurnRequest, SimError> {
    {
        let mut gate = shared.gate.lock().await;
        if gate.in_flight {
            if gate.pending.is_some() {
                debug!(?origin, "turn request dropped");
                return Ok(TurnRequest::Dropped);
            }
            gate.pending = Some(origin);
            return Ok(TurnRequest::Queued);
        }
        gate.in_flight = true;
    }

    let mut executed = 0;
    loop {
        match execute_turn(shared).await {
            Ok(Some(delta)) => {
                executed += 1;
                let ended = delta.status.is_terminal();
                let mut gate = shared.gate.lock().await;
                let queued = match gate.pending.take() {
                    Some(Origin::Cadence) => shared.runtime.lock().await.running,
                    Some(Origin::Manual) => true,
                    None => false,
                };
                if queued && !ended {
                    continue;
                }
                gate.in_flight = false;
                break Ok(TurnRequest::Executed(executed));
            }
            Ok(None) => {
                let mut gate = shared.gate.lock().await;
                gate.pending = None;
                gate.in_flight = false;
                break Ok(if executed == 0 {
                    TurnRequest::Ignored
                } else {
                    TurnRequest::Executed(executed)
                });
            }
            Err(err) => {
                let mut gate = shared.gate.lock().await;
                gate.pending = None;
                gate.in_flight = false;
                break Err(err);
            }
        }
    }
}

/// Runs one turn phase by phase, settling between phases. `None` when the
/// run had already ended.
async fn execute_turn(shared: &Shared) -> Result<Option<TurnDelta>, SimError> {
    let mut engine = shared.engine.lock().await;
    let settle = engine.config().phase_settle();
    let mut pending = match engine.begin_turn() {
        Ok(pending) => pending,
        Err(SimError::RunFinished(_)) => return Ok(None),
        Err(err) => return Err(err),
    };

    loop {
        match engine.advance_phase(&mut pending) {
            Ok(Some(phase)) => {
                let _ = shared.events.send(SimEvent::PhaseCompleted {
                    turn: pending.turn(),
                    phase,
                });
                settle_phase(settle).await;
            }
            Ok(None) => break,
            Err(err) => {
                error!(turn = pending.turn(), "turn failed: {err}");
                let delta = engine.finish_turn(pending);
                let _ = shared.events.send(SimEvent::Error(ApiError {
                    code: "aborted".to_owned(),
                    message: err.to_string(),
                }));
                let _ = shared.events.send(SimEvent::TurnDelta(delta.clone()));
                let _ = shared.events.send(SimEvent::RunEnded {
                    status: delta.status,
                });
                return Err(err);
            }
        }
    }

    let delta = engine.finish_turn(pending);
    drop(engine);

    let _ = shared.events.send(SimEvent::TurnDelta(delta.clone()));
    if delta.status.is_terminal() {
        info!(turn = delta.turn, status = ?delta.status, "run ended");
        let _ = shared.events.send(SimEvent::RunEnded {
            status: delta.status.clone(),
        });
    }
    Ok(Some(delta))
}

async fn settle_phase(settle: Duration) {
    if settle.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(settle).await;
    }
}

async fn cadence_loop(shared: Arc<Shared>, generation: u64) {
    loop {
        // Registered before checking the flag so a pause between the check
        // and the wait is not missed.
        let notified = shared.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let speed = {
            let runtime = shared.runtime.lock().await;
            if !runtime.running || runtime.generation != generation {
                break;
            }
            runtime.speed
        };

        match request_turn(&shared, Origin::Cadence).await {
            Ok(TurnRequest::Ignored) => break,
            Ok(_) => {}
            Err(err) => {
                warn!("cadence stopped: {err}");
                break;
            }
        }
        if shared.engine.lock().await.status().is_terminal() {
            break;
        }

        match cadence_interval(speed) {
            Some(interval) => {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = &mut notified => {}
                }
            }
            None => tokio::task::yield_now().await,
        }
    }

    let mut runtime = shared.runtime.lock().await;
    if runtime.generation == generation {
        runtime.running = false;
        runtime.runner = None;
    }
    debug!(generation, "cadence loop exited");
}
