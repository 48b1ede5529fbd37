use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use tasklane_core::models::{Failure, RunnerSnapshot};
use tasklane_core::orchestration::{BlockTask, InMemoryTaskSource, RunnerDelegate, TaskRunner};
use tasklane_core::promise::Promise;

/// Runs a plan of simulated tasks through the sequential task runner
#[derive(Parser, Debug)]
#[command(name = "tasklane")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    RUST_LOG=debug  Log filter (overridden by --log-level)")]
struct Cli {
    /// JSON plan file (runs a built-in demo plan if omitted)
    #[arg(short, long)]
    plan: Option<PathBuf>,

    /// Resume from the failed task once if a required task stops the run
    #[arg(long)]
    resume: bool,

    /// Log filter directive, e.g. `info` or `tasklane_core=debug`
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct Plan {
    steps: Vec<Step>,
}

#[derive(Clone, Debug, Deserialize)]
struct Step {
    id: String,
    #[serde(default)]
    delay_ms: u64,
    /// Number of attempts that fail before the step succeeds.
    #[serde(default)]
    failures: u32,
    #[serde(default = "default_required")]
    required: bool,
    /// Delay of a rescue that repairs the step; no rescue when absent.
    #[serde(default)]
    rescue_ms: Option<u64>,
}

fn default_required() -> bool {
    true
}

const DEMO_PLAN: &str = r#"{
  "steps": [
    { "id": "fetch-manifest", "delay_ms": 40 },
    { "id": "warm-cache", "delay_ms": 20, "failures": 1, "required": false },
    { "id": "apply-migrations", "delay_ms": 30, "failures": 1, "rescue_ms": 15 },
    { "id": "publish", "delay_ms": 10 }
  ]
}"#;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RunEvent {
    Start,
    Resume,
    TaskStarted { index: usize },
    TaskFinished { index: usize, error: Option<String> },
    RunStopped { index: usize, error: String },
    RunFinished { error: Option<String> },
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<RunEvent>>,
}

impl EventLog {
    fn push(&self, event: RunEvent) {
        tracing::debug!(?event, "runner event");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RunnerDelegate for EventLog {
    fn will_start(&self) {
        self.push(RunEvent::Start);
    }

    fn will_resume(&self) {
        self.push(RunEvent::Resume);
    }

    fn will_run_task(&self, index: usize) {
        self.push(RunEvent::TaskStarted { index });
    }

    fn task_finished(&self, index: usize, error: Option<&Failure>) {
        self.push(RunEvent::TaskFinished {
            index,
            error: error.map(ToString::to_string),
        });
    }

    fn run_stopped(&self, index: usize, error: &Failure) {
        self.push(RunEvent::RunStopped {
            index,
            error: error.to_string(),
        });
    }

    fn run_finished(&self, error: Option<&Failure>) {
        self.push(RunEvent::RunFinished {
            error: error.map(ToString::to_string),
        });
    }
}

#[derive(Debug, Serialize)]
struct Report {
    succeeded: bool,
    error: Option<String>,
    snapshot: RunnerSnapshot,
    events: Vec<RunEvent>,
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Debug, thiserror::Error)]
enum PlanError {
    #[error("failed to read plan {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid plan: {0}")]
    Json(#[from] serde_json::Error),
}

fn load_plan(path: Option<&PathBuf>) -> Result<Plan, PlanError> {
    let raw = match path {
        Some(path) => std::fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.clone(),
            source,
        })?,
        None => DEMO_PLAN.to_string(),
    };
    Ok(serde_json::from_str(&raw)?)
}

fn step_task(step: &Step) -> BlockTask {
    let attempts = Arc::new(AtomicU32::new(0));
    let delay = Duration::from_millis(step.delay_ms);
    let failures = step.failures;
    let id = step.id.clone();

    BlockTask::new(step.id.clone(), move || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        let id = id.clone();
        Promise::spawn(async move {
            tokio::time::sleep(delay).await;
            if attempt < failures {
                return Err(Failure::msg(format!("{id} failed on attempt {}", attempt + 1)));
            }
            Ok(())
        })
    })
}

fn build_source(plan: &Plan) -> InMemoryTaskSource {
    let mut source = InMemoryTaskSource::new();
    for step in &plan.steps {
        let task = step_task(step);
        source = if step.required {
            source.push(task)
        } else {
            source.push_optional(task)
        };

        if let Some(rescue_ms) = step.rescue_ms {
            let id = step.id.clone();
            source = source.rescued_by(move |index| {
                tracing::info!(index, task = %id, "repairing task");
                Promise::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(rescue_ms)).await;
                    Ok(())
                })
            });
        }
    }
    source
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let plan = match load_plan(cli.plan.as_ref()) {
        Ok(plan) => plan,
        Err(error) => {
            tracing::error!(%error, "cannot load plan");
            eprintln!("{error}");
            return ExitCode::from(2);
        }
    };

    let source = Arc::new(build_source(&plan));
    let log = Arc::new(EventLog::default());
    let runner = TaskRunner::new();
    runner.set_task_source(&source);
    runner.set_delegate(&log);

    let mut outcome = runner.start().wait().await;
    if outcome.is_err() && cli.resume {
        tracing::warn!(
            index = runner.current_task_index(),
            "run stopped, resuming from the failed task"
        );
        outcome = runner.resume().wait().await;
    }

    let report = Report {
        succeeded: outcome.is_ok(),
        error: outcome.as_ref().err().map(ToString::to_string),
        snapshot: runner.snapshot(),
        events: log.events(),
    };

    match serde_json::to_string_pretty(&report) {
        Ok(rendered) => println!("{rendered}"),
        Err(error) => {
            eprintln!("failed to render report: {error}");
            return ExitCode::FAILURE;
        }
    }

    if report.succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
