//! match-runner: headless driver for the matching engine.
//!
//! Usage:
//!   match-runner --db match.db --sweeps 10 --interval 60
//!   match-runner --db match.db --preview job-1234 --limit 5
//!   match-runner --db match.db --ipc-mode

use anyhow::Result;
use cleanmatch_core::{
    access::Actor,
    candidates::MatchCriteria,
    clock::SystemClock,
    config::MatchConfig,
    engine::MatchEngine,
    error::{MatchError, MatchResult},
    locks::LockRequest,
    scheduler::{SweepReport, SweepScheduler, Trigger},
    store::MatchStore,
    types::LockId,
};
use serde::Serialize;
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    Preview {
        job_id: String,
        #[serde(default = "default_limit")]
        limit: usize,
    },
    AutoAssign {
        job_id: String,
    },
    CreateLocks {
        actor: Actor,
        job_id: String,
        request: LockRequest,
    },
    ConfirmLocks {
        actor: Actor,
        job_id: String,
        #[serde(default)]
        lock_ids: Option<Vec<LockId>>,
    },
    ReleaseLocks {
        actor: Actor,
        job_id: String,
        #[serde(default)]
        lock_ids: Option<Vec<LockId>>,
    },
    ListLocks {
        job_id: String,
        #[serde(default)]
        include_released: bool,
    },
    Promote {
        job_id: String,
    },
    Sweep,
    Quit,
}

fn default_limit() -> usize {
    10
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let sweeps = parse_arg(&args, "--sweeps", 1u64);
    let interval = parse_arg(&args, "--interval", 0u64);
    let limit = parse_arg(&args, "--limit", default_limit());
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = flag_value(&args, "--db").unwrap_or(":memory:");
    let data_dir = flag_value(&args, "--data-dir").unwrap_or("./data");
    let preview = flag_value(&args, "--preview");

    let config = match MatchConfig::load(data_dir) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("runner: {e}; using built-in defaults");
            MatchConfig::default()
        }
    };
    let interval = if interval == 0 { config.scheduler.interval_secs } else { interval };

    if !ipc_mode {
        println!("match-runner");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        println!();
    }

    let store = if db == ":memory:" { MatchStore::in_memory()? } else { MatchStore::open(db)? };
    store.migrate()?;
    let engine = MatchEngine::new(store, config, Arc::new(SystemClock))?;

    if ipc_mode {
        return run_ipc_loop(&engine);
    }

    if let Some(job_id) = preview {
        let ranked = preview_job(&engine, job_id, limit)?;
        println!("{}", serde_json::to_string_pretty(&ranked)?);
        return Ok(());
    }

    let scheduler = SweepScheduler::standard(
        &engine.config().scheduler,
        Trigger::Interval(std::time::Duration::from_secs(interval)),
    );
    let mut totals: Vec<SweepReport> = Vec::new();
    if sweeps == 0 {
        // Runs until the process is killed.
        let never = AtomicBool::new(false);
        scheduler.run_until(&engine, &never);
    } else {
        for cycle in 0..sweeps {
            if cycle > 0 {
                std::thread::sleep(std::time::Duration::from_secs(interval));
            }
            accumulate(&mut totals, scheduler.run_once(&engine));
        }
    }
    print_summary(&engine, &totals, sweeps)?;
    Ok(())
}

fn preview_job(engine: &MatchEngine, job_id: &str, limit: usize) -> MatchResult<serde_json::Value> {
    let job = engine
        .store()
        .get_job(job_id)?
        .ok_or_else(|| MatchError::not_found("job", job_id))?;
    let criteria = MatchCriteria::for_job(&job);
    let ranked = engine.preview_scores(&criteria, limit)?;
    let team = engine.match_team(&criteria, job.required_members)?;
    Ok(serde_json::json!({ "job_id": job.id, "ranked": ranked, "team": team }))
}

fn run_ipc_loop(engine: &MatchEngine) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        if handle.read_line(&mut buffer)? == 0 {
            break; // EOF
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                writeln!(stdout, "{}", serde_json::json!({ "error": { "code": "BAD_COMMAND", "message": e.to_string() } }))?;
                stdout.flush()?;
                continue;
            }
        };
        if matches!(cmd, IpcCommand::Quit) {
            break;
        }

        let reply = match handle_command(engine, cmd) {
            Ok(value) => serde_json::json!({ "ok": value }),
            Err(e) => {
                log::info!("runner: command rejected: {e}");
                serde_json::json!({ "error": { "code": e.code(), "message": e.to_string() } })
            }
        };
        writeln!(stdout, "{reply}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn handle_command(engine: &MatchEngine, cmd: IpcCommand) -> MatchResult<serde_json::Value> {
    match cmd {
        IpcCommand::Preview { job_id, limit } => preview_job(engine, &job_id, limit),
        IpcCommand::AutoAssign { job_id } => to_value(engine.auto_assign(&job_id)?),
        IpcCommand::CreateLocks { actor, job_id, request } => {
            to_value(engine.create_locks(&actor, &job_id, &request)?)
        }
        IpcCommand::ConfirmLocks { actor, job_id, lock_ids } => {
            to_value(engine.confirm_locks(&actor, &job_id, lock_ids.as_deref())?)
        }
        IpcCommand::ReleaseLocks { actor, job_id, lock_ids } => {
            to_value(engine.release_locks(&actor, &job_id, lock_ids.as_deref())?)
        }
        IpcCommand::ListLocks { job_id, include_released } => {
            to_value(engine.list_locks(&job_id, include_released)?)
        }
        IpcCommand::Promote { job_id } => to_value(engine.promote_locks_at(&job_id, engine.now())?),
        IpcCommand::Sweep => {
            let scheduler = SweepScheduler::standard(&engine.config().scheduler, Trigger::Manual);
            to_value(scheduler.run_once(engine))
        }
        IpcCommand::Quit => Ok(serde_json::Value::Null),
    }
}

fn to_value<T: Serialize>(value: T) -> MatchResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn accumulate(totals: &mut Vec<SweepReport>, reports: Vec<SweepReport>) {
    for r in reports {
        match totals.iter_mut().find(|t| t.sweep == r.sweep) {
            Some(t) => {
                t.examined += r.examined;
                t.succeeded += r.succeeded;
                t.failed += r.failed;
            }
            None => totals.push(r),
        }
    }
}

fn print_summary(engine: &MatchEngine, totals: &[SweepReport], cycles: u64) -> Result<()> {
    println!("=== SWEEP SUMMARY ===");
    println!("  cycles:     {cycles}");
    for t in totals {
        println!(
            "  {:<10}  examined: {:>4} | ok: {:>4} | failed: {:>4}",
            t.sweep, t.examined, t.succeeded, t.failed
        );
    }
    println!();
    println!("=== EVENT LOG ===");
    for kind in ["job_matched", "locks_promoted", "locks_released", "fallback_requested", "job_escalated"] {
        println!("  {:<20} {}", kind, engine.store().count_events(kind)?);
    }
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
