//! Offline maintenance for persisted sessions.
//!
//! # Examples
//!
//! ```sh
//! # Would this usage overflow the window?
//! ration overflow --prompt 190000 --cache-read 5000 --context-limit 200000 \
//!   --model-output-limit 8000 --cap 8000
//!
//! # Summarize a session saved by JsonFilePersistence
//! ration inspect --dir ./sessions --session session-1
//!
//! # Preview, then apply, a pruning pass with a custom config
//! ration prune --dir ./sessions --session session-1 --config ration.toml --dry-run
//! ration prune --dir ./sessions --session session-1 --config ration.toml
//! ```

use clap::{Parser, Subcommand};
use ration_rs::agent::config::HarnessConfig;
use ration_rs::agent::persistence::JsonFilePersistence;
use ration_rs::agent::session::{MessageStore, Session};
use ration_rs::context::overflow::{TokenUsage, is_overflow, usable_context};
use ration_rs::context::prune::{PruneConfig, plan_prune};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Inspect and compact persisted sessions.
#[derive(Parser)]
#[command(name = "ration")]
struct Cli {
    /// Log at debug level (RUST_LOG overrides).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate the overflow policy for one usage sample.
    Overflow {
        #[arg(long, default_value_t = 0)]
        prompt: u64,
        #[arg(long, default_value_t = 0)]
        cache_read: u64,
        #[arg(long, default_value_t = 0)]
        output: u64,
        /// Model context window (0 = unknown, never overflows).
        #[arg(long)]
        context_limit: u64,
        #[arg(long)]
        model_output_limit: u64,
        /// Configured output token cap.
        #[arg(long, default_value_t = 32_000)]
        cap: u64,
    },
    /// Print a summary of a persisted session.
    Inspect {
        /// Session directory written by the JSON file backend.
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        session: String,
    },
    /// Run a pruning pass over a persisted session and save the result.
    Prune {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        session: String,
        /// TOML config; its `[compaction]` table supplies the thresholds.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Report what would be pruned without writing.
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = match cli.command {
        Command::Overflow {
            prompt,
            cache_read,
            output,
            context_limit,
            model_output_limit,
            cap,
        } => {
            run_overflow(
                TokenUsage::new(prompt, cache_read, output),
                context_limit,
                model_output_limit,
                cap,
            );
            Ok(())
        }
        Command::Inspect { dir, session } => run_inspect(dir, &session),
        Command::Prune {
            dir,
            session,
            config,
            dry_run,
        } => run_prune(dir, &session, config, dry_run),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_overflow(usage: TokenUsage, context_limit: u64, model_output_limit: u64, cap: u64) {
    let available = usable_context(context_limit, model_output_limit, cap);
    let overflow = is_overflow(
        usage.prompt_tokens,
        usage.cache_read_tokens,
        usage.output_tokens,
        context_limit,
        model_output_limit,
        cap,
    );
    println!("total: {}", usage.total());
    match available {
        Some(n) => println!("available: {n}"),
        None => println!("available: unknown (context limit 0)"),
    }
    println!("overflow: {overflow}");
}

fn load_session(dir: PathBuf, session_id: &str) -> Result<(Arc<JsonFilePersistence>, String), String> {
    let backend = JsonFilePersistence::new(dir).map_err(|e| e.to_string())?;
    let stored = backend
        .load(session_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| {
            format!(
                "no session '{session_id}' in {}",
                backend.dir().display()
            )
        })?;
    Ok((Arc::new(backend), stored.user_id))
}

fn print_summary(session: &Session) {
    let compacted = session.messages().iter().filter(|m| m.is_compacted()).count();
    println!("session:        {}", session.id());
    println!("user:           {}", session.user_id());
    println!("messages:       {}", session.len());
    println!("archived:       {}", session.archive().len());
    println!("turns:          {}", session.turn_count());
    println!("est. tokens:    {}", session.estimated_tokens());
    println!("pruned results: {compacted}");
    match session.latest_summary_index() {
        Some(i) => println!("summary at:     message {i}"),
        None => println!("summary at:     none"),
    }
}

fn run_inspect(dir: PathBuf, session_id: &str) -> Result<(), String> {
    let (backend, user_id) = load_session(dir, session_id)?;
    let store = MessageStore::new().with_persistence(backend);
    let handle = store.open(session_id, &user_id).map_err(|e| e.to_string())?;
    print_summary(&handle.snapshot());
    Ok(())
}

fn prune_config(path: Option<PathBuf>) -> Result<PruneConfig, String> {
    match path {
        Some(path) => {
            let config = HarnessConfig::from_file(&path).map_err(|e| e.to_string())?;
            Ok(config.compaction.prune_config())
        }
        None => Ok(PruneConfig::default()),
    }
}

fn run_prune(
    dir: PathBuf,
    session_id: &str,
    config: Option<PathBuf>,
    dry_run: bool,
) -> Result<(), String> {
    let config = prune_config(config)?;
    let (backend, user_id) = load_session(dir, session_id)?;
    let store = MessageStore::new().with_persistence(backend);
    let handle = store.open(session_id, &user_id).map_err(|e| e.to_string())?;

    if dry_run {
        let plan = handle.read(|s| plan_prune(s.messages(), s.current_turn(), &config));
        println!(
            "candidates: {} ({} tokens of {} scanned)",
            plan.indices.len(),
            plan.prunable_tokens,
            plan.scanned_tokens
        );
        if plan.worth_applying(&config) {
            println!("would prune: yes");
        } else {
            println!(
                "would prune: no (minimum {} tokens)",
                config.min_prune_tokens
            );
        }
        return Ok(());
    }

    let lease = handle.try_lease().map_err(|e| e.to_string())?;
    let outcome = lease.write(|s| s.prune(&config));
    drop(lease);
    let written = store.flush(&handle).map_err(|e| e.to_string())?;
    info!("Pruned session {session_id}: {written} message(s) written");
    println!(
        "pruned: {} result(s), {} tokens freed",
        outcome.pruned_count, outcome.freed_tokens
    );
    Ok(())
}
