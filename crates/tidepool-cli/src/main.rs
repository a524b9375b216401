//! `tidepool` – Tidepool Command Line Interface
//!
//! The binary that turns a machine into a contributing node.  It:
//!
//! 1. Checks for `~/.tidepool/config.toml`; runs a short **First-Run Wizard**
//!    when the file is absent.
//! 2. `run` (default): opens the SQLite store, probes the host, starts the
//!    [`BackgroundWorker`] and keeps it alive until **Ctrl-C**.
//! 3. `seed`: publishes a demo catalog with one operation per task type and
//!    allow-lists their hashes.
//! 4. `status`: prints recent heartbeats and contribution sessions.

mod config;
mod probe;

use colored::Colorize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use tidepool_kernel::EnvironmentProbe;
use tidepool_runtime::BackgroundWorker;
use tidepool_store::SqliteStore;
use tidepool_types::WorkerState;

use crate::config::Config;
use crate::probe::SysfsProbe;

fn main() {
    // Keep the guard alive so pending spans flush on exit.
    let _tracing = tidepool_runtime::init_tracing("tidepool");

    print_banner();

    let command = std::env::args().nth(1).unwrap_or_else(|| "run".to_string());
    if matches!(command.as_str(), "help" | "--help" | "-h") {
        print_usage();
        return;
    }

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            Config::default()
        }
    };

    let outcome = match command.as_str() {
        "run" => run(cfg),
        "seed" => seed(cfg),
        "status" => status(&cfg),
        other => Err(format!("unknown command `{other}`; try `tidepool help`")),
    };
    if let Err(e) = outcome {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn run(cfg: Config) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start async runtime: {e}"))?;
    runtime.block_on(run_agent(cfg))
}

async fn run_agent(cfg: Config) -> Result<(), String> {
    let store = Arc::new(open_store(&cfg)?);
    let probe = Arc::new(SysfsProbe::new());
    let gate = cfg.integrity_gate()?;

    if cfg.allowed_hashes.is_empty() && cfg.trusted_keys.is_empty() {
        println!(
            "  {}  No trusted hashes or keys configured; every task will be refused.",
            "!".yellow().bold()
        );
        println!("     Run `{}` to publish a demo catalog.", "tidepool seed".bold());
    }

    let worker = BackgroundWorker::new(store, probe, gate, cfg.agent_config(), &cfg.user_id);

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the worker …".yellow().bold());
        let _ = shutdown_tx.send(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    worker.start().await.map_err(|e| e.to_string())?;
    println!(
        "  {} Contributing as {} from {}",
        "✓".green().bold(),
        cfg.user_id.bold(),
        worker.device_id().cyan()
    );
    println!("  Press {} to stop.\n", "Ctrl-C".bold());
    info!(user_id = %cfg.user_id, device_id = %worker.device_id(), "agent started");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if worker.status() == WorkerState::Stopped {
                    println!("{}", "  Worker gave up after exhausting its restart budget.".red());
                    break;
                }
            }
        }
    }

    worker.stop().await;
    let health = worker.health_status();
    println!("  {} Worker stopped.", "✓".green());
    println!("    tasks processed : {}", health.tasks_processed);
    println!("    restarts        : {}", health.restart_attempts);
    println!("    uptime          : {}s", health.uptime_secs);
    Ok(())
}

fn seed(mut cfg: Config) -> Result<(), String> {
    let store = open_store(&cfg)?;
    let published = seed_catalog(&store, &mut cfg)?;
    config::save(&cfg)?;
    println!(
        "  {} Published {} operations; {} hash(es) allow-listed in {}",
        "✓".green().bold(),
        published.len(),
        cfg.allowed_hashes.len(),
        config::config_path().display().to_string().bold()
    );
    for (name, hash) in &published {
        println!("    • {:<18} {}", name.bold(), hash.dimmed());
    }
    Ok(())
}

fn status(cfg: &Config) -> Result<(), String> {
    let store = open_store(cfg)?;
    let device_id = SysfsProbe::new().device_id();
    let err = |e: tidepool_store::StoreError| e.to_string();

    println!("  User   : {}", cfg.user_id.bold());
    println!("  Device : {}", device_id.cyan());
    println!(
        "  Completed operations: {}",
        store.completed_operation_count(&cfg.user_id).map_err(err)?
    );

    println!("\n  {}", "Recent heartbeats".bold());
    let beats = store.heartbeats(&device_id).map_err(err)?;
    if beats.is_empty() {
        println!("    {}", "none".dimmed());
    }
    for hb in beats.iter().rev().take(5) {
        println!(
            "    {}  {:<10} tasks={} failures={}",
            hb.timestamp.to_rfc3339().dimmed(),
            hb.status.to_string(),
            hb.tasks_processed,
            hb.consecutive_failures
        );
    }

    println!("\n  {}", "Contribution sessions".bold());
    let sessions = store.contribution_records(&cfg.user_id).map_err(err)?;
    if sessions.is_empty() {
        println!("    {}", "none".dimmed());
    }
    for s in sessions.iter().rev().take(5) {
        println!(
            "    {}  ops={} cpu={:.1}% mem={:.1}% score={:.2}",
            s.started_at.dimmed(),
            s.operations_completed,
            s.avg_cpu_percent,
            s.avg_memory_percent,
            s.contribution_score
        );
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Demo catalog
// ─────────────────────────────────────────────────────────────────────────────

/// `(id, name, parameters, required_compute_power, unlock_threshold)`
fn demo_catalog() -> Vec<(&'static str, &'static str, Value, u32, u64)> {
    vec![
        (
            "demo-primes",
            "prime_search",
            json!({ "start": 1, "end": 50_000 }),
            2,
            0,
        ),
        (
            "demo-hashes",
            "hash_computation",
            json!({ "inputs": ["tidepool", "contribute", "compute"] }),
            1,
            0,
        ),
        (
            "demo-cipher",
            "crypto_analysis",
            json!({ "ciphertext": "Wkh vhfuhw phhwlqj lv dw wkh ROG PLOO rq Iulgdb" }),
            1,
            0,
        ),
        (
            "demo-matrix",
            "matrix_operations",
            json!({ "operation": "multiply", "a": [[1, 2], [3, 4]], "b": [[5, 6], [7, 8]] }),
            3,
            2,
        ),
    ]
}

/// SHA-256 over the operation name and its canonical parameter JSON.
fn catalog_hash(name: &str, parameters: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b":");
    hasher.update(parameters.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn seed_catalog(store: &SqliteStore, cfg: &mut Config) -> Result<Vec<(String, String)>, String> {
    let mut published = Vec::new();
    for (id, name, params, power, threshold) in demo_catalog() {
        let hash = catalog_hash(name, &params);
        store
            .publish_operation(id, name, &params, &hash, None, power, threshold)
            .map_err(|e| format!("Failed to publish {id}: {e}"))?;
        cfg.allow_hash(&hash);
        published.push((name.to_string(), hash));
    }
    Ok(published)
}

fn open_store(cfg: &Config) -> Result<SqliteStore, String> {
    if let Some(parent) = std::path::Path::new(&cfg.database_path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    SqliteStore::open(&cfg.database_path)
        .map_err(|e| format!("Failed to open database {}: {}", cfg.database_path, e))
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║      Tidepool First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up Tidepool.\n");

    let mut cfg = Config::default();

    cfg.user_id = prompt_line(
        &format!("  Contribute as user [{}]: ", cfg.user_id),
        &cfg.user_id,
    );

    let cpu = prompt_line(
        &format!("  Maximum CPU usage in percent [{}]: ", cfg.limits.max_cpu_percent),
        &cfg.limits.max_cpu_percent.to_string(),
    );
    if let Ok(v) = cpu.trim().parse::<f64>()
        && (0.0..=100.0).contains(&v)
    {
        cfg.limits.max_cpu_percent = v;
    }

    let charging = prompt_line("  Only contribute while charging? [y/N]: ", "n");
    cfg.limits.only_when_charging = charging.trim().eq_ignore_ascii_case("y");

    config::apply_env_overrides(&mut cfg);

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"  _____ _    _                         _ "#.bold().cyan());
    println!("{}", r#" |_   _(_)__| |___ _ __  ___  ___  ___| |"#.bold().cyan());
    println!("{}", r#"   | | | / _` / -_) '_ \/ _ \/ _ \/ _ \ |"#.bold().cyan());
    println!("{}", r#"   |_| |_\__,_\___| .__/\___/\___/\___/_|"#.bold().cyan());
    println!("{}", r#"                  |_|                    "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Tidepool".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Background compute contribution agent");
    println!();
}

fn print_usage() {
    println!("  Usage: tidepool [run|seed|status|help]\n");
    println!("    {}     contribute until Ctrl-C (default)", "run".bold());
    println!("    {}    publish the demo catalog and allow-list it", "seed".bold());
    println!("    {}  show recent heartbeats and sessions", "status".bold());
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_types::{ComputeTask, TaskType};

    #[test]
    fn demo_catalog_covers_every_task_type() {
        let types: Vec<TaskType> = demo_catalog()
            .iter()
            .map(|(_, name, ..)| TaskType::from_operation_name(name))
            .collect();
        for expected in [
            TaskType::PrimeSearch,
            TaskType::HashComputation,
            TaskType::CryptoAnalysis,
            TaskType::MatrixOperations,
        ] {
            assert!(types.contains(&expected), "missing {expected:?}");
        }
    }

    #[test]
    fn catalog_hash_depends_on_parameters() {
        let a = catalog_hash("prime_search", &json!({ "start": 1, "end": 10 }));
        let b = catalog_hash("prime_search", &json!({ "start": 1, "end": 11 }));
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn seeded_operations_pass_the_integrity_gate() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut cfg = Config::default();

        let published = seed_catalog(&store, &mut cfg).unwrap();
        assert_eq!(published.len(), 4);
        assert_eq!(cfg.allowed_hashes.len(), 4);

        // The matrix operation unlocks after two completions.
        let eligible = store.eligible_operations("someone").unwrap();
        assert_eq!(eligible.len(), 3);

        let gate = cfg.integrity_gate().unwrap();
        for op in &eligible {
            gate.verify(&ComputeTask::from_operation(op)).unwrap();
        }
    }

    #[test]
    fn reseeding_does_not_duplicate_allow_list() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut cfg = Config::default();
        seed_catalog(&store, &mut cfg).unwrap();
        seed_catalog(&store, &mut cfg).unwrap();
        assert_eq!(cfg.allowed_hashes.len(), 4);
    }
}
