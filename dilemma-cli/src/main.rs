use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dilemma_core::{RandomSource, TurnEngine};
use dilemma_server::load_config;
use dilemma_types::{RunSnapshot, RunStatus, SimulationConfig, Team, TurnDelta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dilemma-cli")]
#[command(about = "Headless prisoner's dilemma grid simulation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play until the run ends or the turn cap is hit.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        population: Option<u32>,
        #[arg(long)]
        risk: Option<f64>,
        #[arg(long, default_value_t = 10_000)]
        max_turns: u64,
        #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Write the config and every consumed random byte for `replay`.
        #[arg(long)]
        record: Option<PathBuf>,
    },
    Step {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, default_value_t = 1)]
        turns: u32,
        #[arg(long, default_value_t = false)]
        print_state: bool,
    },
    Export {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, default_value_t = 50)]
        turns: u32,
        #[arg(long, value_enum, default_value_t = ExportFormat::Jsonl)]
        format: ExportFormat,
        #[arg(long)]
        out: PathBuf,
    },
    /// Re-run a recording made with `run --record` and check it ends the same way.
    Replay {
        #[arg(long)]
        input: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportFormat {
    Jsonl,
    Json,
}

#[derive(Debug, Serialize, Deserialize)]
struct Recording {
    config: SimulationConfig,
    turns: u64,
    status: RunStatus,
    bytes: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    final_turn: u64,
    status: RunStatus,
    winner: Option<String>,
    alive: u32,
    alive_by_team: BTreeMap<Team, u32>,
    risk_engaged: bool,
    log: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StepSummary {
    turns: u32,
    final_turn: u64,
    alive: u32,
    engagements_last_turn: u32,
    deaths_last_turn: u32,
}

#[derive(Debug, Serialize)]
struct ReplaySummary {
    recorded_status: RunStatus,
    replayed_status: RunStatus,
    matches: bool,
    summary: RunSummary,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "dilemma_cli=info,dilemma_core=warn".to_owned()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            seed,
            population,
            risk,
            max_turns,
            format,
            out,
            record,
        } => {
            let mut cfg = prepare_config(config, seed)?;
            if let Some(population) = population {
                cfg.population = population;
            }
            if risk.is_some() {
                cfg.risk_probability = risk;
            }
            run_command(cfg, max_turns, format, out, record)
        }
        Commands::Step {
            config,
            seed,
            turns,
            print_state,
        } => step_command(prepare_config(config, seed)?, turns, print_state),
        Commands::Export {
            config,
            seed,
            turns,
            format,
            out,
        } => export_command(prepare_config(config, seed)?, turns, format, out),
        Commands::Replay { input } => replay_command(input),
    }
}

fn run_command(
    cfg: SimulationConfig,
    max_turns: u64,
    format: OutputFormat,
    out: Option<PathBuf>,
    record: Option<PathBuf>,
) -> Result<()> {
    let mut engine = TurnEngine::new(cfg.clone())?;
    let deltas = play(&mut engine, max_turns);
    let summary = summarize(&engine.snapshot(), &deltas);

    if let Some(path) = record {
        let recording = Recording {
            config: cfg,
            turns: engine.turn(),
            status: engine.status().clone(),
            bytes: engine.random().replay_log().to_vec(),
        };
        let encoded = serde_json::to_vec(&recording)?;
        fs::write(&path, encoded)
            .with_context(|| format!("failed writing recording to {}", path.display()))?;
        info!(bytes = recording.bytes.len(), "recorded run to {}", path.display());
    }

    let text = match format {
        OutputFormat::Pretty => render_pretty(&summary),
        OutputFormat::Json => serde_json::to_string_pretty(&summary)?,
    };
    write_output(text, out)
}

fn step_command(cfg: SimulationConfig, turns: u32, print_state: bool) -> Result<()> {
    let mut engine = TurnEngine::new(cfg)?;
    let turns = turns.max(1);
    engine.step_n(turns);
    let snapshot = engine.snapshot();

    let summary = StepSummary {
        turns,
        final_turn: snapshot.turn,
        alive: snapshot.metrics.alive,
        engagements_last_turn: snapshot.metrics.engagements_last_turn,
        deaths_last_turn: snapshot.metrics.deaths_last_turn,
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if print_state {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(())
}

fn export_command(
    cfg: SimulationConfig,
    turns: u32,
    format: ExportFormat,
    out: PathBuf,
) -> Result<()> {
    let mut engine = TurnEngine::new(cfg)?;
    let lines = engine.export_trace_jsonl(turns);

    let payload = match format {
        ExportFormat::Jsonl => lines.join("\n"),
        ExportFormat::Json => {
            let snapshots: Vec<RunSnapshot> = lines
                .iter()
                .map(|line| serde_json::from_str::<RunSnapshot>(line))
                .collect::<std::result::Result<_, _>>()?;
            serde_json::to_string_pretty(&snapshots)?
        }
    };

    fs::write(&out, payload)
        .with_context(|| format!("failed writing export to {}", out.display()))?;
    println!("exported trace to {}", out.display());
    Ok(())
}

fn replay_command(input: PathBuf) -> Result<()> {
    let content = fs::read(&input)
        .with_context(|| format!("failed to read recording {}", input.display()))?;
    let recording: Recording = serde_json::from_slice(&content)
        .with_context(|| format!("{} is not a run recording", input.display()))?;
    if recording.bytes.is_empty() {
        bail!("recording {} holds no random bytes", input.display());
    }

    let random = RandomSource::scripted(recording.bytes);
    let mut engine = TurnEngine::with_random_source(recording.config, random)?;
    let deltas = play(&mut engine, recording.turns);
    let summary = summarize(&engine.snapshot(), &deltas);

    let report = ReplaySummary {
        matches: summary.status == recording.status && summary.final_turn == recording.turns,
        recorded_status: recording.status,
        replayed_status: summary.status.clone(),
        summary,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.matches {
        bail!("replay diverged from the recording");
    }
    Ok(())
}

fn play(engine: &mut TurnEngine, max_turns: u64) -> Vec<TurnDelta> {
    let mut deltas = Vec::new();
    while engine.turn() < max_turns {
        match engine.tick() {
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

fn summarize(snapshot: &RunSnapshot, deltas: &[TurnDelta]) -> RunSummary {
    let winner = snapshot
        .status
        .winner()
        .and_then(|id| snapshot.agents.get(id.index()))
        .map(|agent| agent.display_name());
    let log = deltas
        .iter()
        .flat_map(|delta| {
            delta
                .logs
                .iter()
                .map(move |event| format!("turn {}: {event}", delta.turn))
        })
        .collect();

    RunSummary {
        final_turn: snapshot.turn,
        status: snapshot.status.clone(),
        winner,
        alive: snapshot.metrics.alive,
        alive_by_team: snapshot.metrics.alive_by_team.clone(),
        risk_engaged: snapshot.metrics.risk_engaged,
        log,
    }
}

fn render_pretty(summary: &RunSummary) -> String {
    let mut lines: Vec<String> = summary.log.clone();
    let teams = summary
        .alive_by_team
        .iter()
        .map(|(team, count)| format!("{}={count}", team.label()))
        .collect::<Vec<_>>()
        .join(" ");
    lines.push(format!(
        "final_turn={} status={:?} alive={} [{teams}] risk_engaged={}",
        summary.final_turn, summary.status, summary.alive, summary.risk_engaged
    ));
    lines.join("\n")
}

fn prepare_config(path: Option<PathBuf>, seed: Option<u64>) -> Result<SimulationConfig> {
    let mut cfg = load_config(path.as_deref())?;
    if seed.is_some() {
        cfg.seed = seed;
    }
    Ok(cfg)
}

fn write_output(text: String, out: Option<PathBuf>) -> Result<()> {
    if let Some(path) = out {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed creating output directory {}", parent.display())
            })?;
        }
        fs::write(&path, text).with_context(|| format!("failed writing {}", path.display()))?;
        println!("wrote output to {}", path.display());
    } else {
        println!("{text}");
    }
    Ok(())
}
