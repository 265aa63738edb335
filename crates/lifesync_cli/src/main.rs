//! Command-line entry point for the sync engine.
//!
//! # Responsibility
//! - Wire `lifesync_core` to a SQLite file and environment configuration.
//! - Expose one-shot commands (status, sync, config, add) and a `watch`
//!   mode that syncs debounced edits and flushes on Ctrl-C.

use clap::{Parser, Subcommand};
use lifesync_core::{
    init_logging, open_db, share, system_clock, BackendRegistry, CloudflareConfig, Collection,
    ConflictChoice, Fields, GitHubConfig, LifecycleEvent, LocalStore, LoggingConfig,
    SettingsStore, SqliteStateRepository, SyncEvent, SyncOptions, SyncOrchestrator, SyncOutcome,
    SyncReport,
};
use log::info;
use serde_json::{json, Value};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

type CliResult<T> = Result<T, Box<dyn Error>>;

const DEFAULT_DB_FILE: &str = "lifesync.sqlite3";
const RECENT_RUNS_SHOWN: u32 = 5;

#[derive(Parser)]
#[command(name = "lifesync", version, about = "Offline-first sync for a personal dataset")]
struct Cli {
    /// SQLite file holding local state.
    #[arg(long, env = "LIFESYNC_DB_PATH")]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Checks that the core library is linked.
    Ping,
    /// Shows backend, watermark and recent sync runs.
    Status,
    /// Runs one sync round.
    Sync {
        /// How to settle a version conflict: local, remote or cancel.
        #[arg(long, value_parser = parse_choice)]
        on_conflict: Option<ConflictChoice>,
    },
    /// Reads `<collection> <json>` lines from stdin, syncs debounced, and
    /// flushes pending edits on Ctrl-C.
    Watch,
    /// Edits backend configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Adds one record and pushes it.
    Add {
        collection: String,
        /// JSON object with the record fields.
        fields: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    Github {
        token: String,
        owner: String,
        repo: String,
        branch: Option<String>,
        path: Option<String>,
    },
    Cloudflare {
        url: String,
        api_key: Option<String>,
    },
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Some(config) = LoggingConfig::from_env() {
        if let Err(err) = init_logging(&config) {
            eprintln!("warning: logging disabled: {err}");
        }
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    if let Command::Ping = cli.command {
        println!("lifesync_core ping={}", lifesync_core::ping());
        println!("lifesync_core version={}", lifesync_core::core_version());
        return Ok(());
    }

    let db_path = cli
        .db
        .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_DB_FILE));
    let orchestrator = open_orchestrator(&db_path)?;

    match cli.command {
        Command::Ping => {}
        Command::Status => print_status(&orchestrator)?,
        Command::Sync { on_conflict } => {
            let report = orchestrator.sync_now().await;
            print_report(&report);
            if report.outcome == SyncOutcome::Conflict {
                settle_conflict(&orchestrator, on_conflict).await?;
            }
        }
        Command::Watch => watch(&orchestrator).await?,
        Command::Config(command) => {
            let kind = match command {
                ConfigCommand::Github {
                    token,
                    owner,
                    repo,
                    branch,
                    path,
                } => {
                    let mut config = GitHubConfig::new(token, owner, repo);
                    if let Some(branch) = branch {
                        config.branch = branch;
                    }
                    if let Some(path) = path {
                        config.base_path = path;
                    }
                    orchestrator.save_github_config(&config)?
                }
                ConfigCommand::Cloudflare { url, api_key } => {
                    let mut config = CloudflareConfig::new(url);
                    config.api_key = api_key;
                    orchestrator.save_cloudflare_config(&config)?
                }
                ConfigCommand::Clear => orchestrator.clear_config()?,
            };
            println!("{}", json!({ "backend": kind.as_str() }));
        }
        Command::Add { collection, fields } => {
            let record = add_record(orchestrator.store(), &collection, &fields)?;
            orchestrator.mark_changed();
            println!("{}", serde_json::to_string(&record)?);
            if let Some(report) = orchestrator.flush().await {
                print_report(&report);
            }
        }
    }
    Ok(())
}

fn open_orchestrator(db_path: &Path) -> CliResult<SyncOrchestrator> {
    let conn = open_db(db_path)?;
    let repo = share(SqliteStateRepository::try_new(conn)?);
    let clock = system_clock();
    let store = Arc::new(LocalStore::open(repo.clone(), clock.clone())?);
    let orchestrator = SyncOrchestrator::new(
        store,
        SettingsStore::new(repo),
        BackendRegistry::new(),
        clock,
        SyncOptions::default(),
    );
    let kind = orchestrator.detect_backend()?;
    info!(
        "event=cli_start module=cli status=ok backend={kind} db={}",
        db_path.display()
    );
    Ok(orchestrator)
}

fn add_record(
    store: &LocalStore,
    collection: &str,
    raw_fields: &str,
) -> CliResult<lifesync_core::Record> {
    let collection = Collection::parse(collection)
        .ok_or_else(|| format!("unknown collection `{collection}`"))?;
    let fields: Fields = match serde_json::from_str(raw_fields)? {
        Value::Object(fields) => fields,
        _ => return Err("record fields must be a JSON object".into()),
    };
    Ok(store.add(collection, fields)?)
}

async fn settle_conflict(
    orchestrator: &SyncOrchestrator,
    choice: Option<ConflictChoice>,
) -> CliResult<()> {
    let Some(choice) = choice else {
        if let Some(conflict) = orchestrator.pending_conflict() {
            println!(
                "{}",
                json!({
                    "conflict": {
                        "localLastModified": conflict.local_last_modified,
                        "remoteLastModified": conflict.remote_last_modified,
                        "localRecords": conflict.local_snapshot.record_count(),
                        "remoteRecords": conflict.remote_snapshot.record_count(),
                    },
                    "hint": "rerun with --on-conflict local|remote|cancel",
                })
            );
        }
        return Ok(());
    };
    let resolution = orchestrator.resolve_conflict(choice).await?;
    println!("{}", json!({ "resolution": format!("{resolution:?}").to_lowercase() }));
    Ok(())
}

async fn watch(orchestrator: &SyncOrchestrator) -> CliResult<()> {
    let _subscriber = orchestrator.attach_store(orchestrator.store().subscribe());
    let mut events = orchestrator.subscribe();
    print_report(&orchestrator.sync_now().await);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    // The attached store subscriber schedules the sync.
                    if let Err(err) = handle_watch_line(orchestrator.store(), &line) {
                        eprintln!("error: {err}");
                    }
                }
                None => stdin_open = false,
            },
            event = events.recv() => {
                if let Ok(SyncEvent::Finished(report)) = event {
                    print_report(&report);
                }
            }
        }
    }

    if orchestrator.on_lifecycle(LifecycleEvent::BeforeUnload) {
        // The flush runs detached; wait for its report before exiting.
        while let Ok(event) = events.recv().await {
            if let SyncEvent::Finished(report) = event {
                print_report(&report);
                break;
            }
        }
    }
    Ok(())
}

fn handle_watch_line(store: &LocalStore, line: &str) -> CliResult<()> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }
    let (collection, fields) = line
        .split_once(char::is_whitespace)
        .ok_or("expected `<collection> <json>`")?;
    let record = add_record(store, collection, fields)?;
    println!("{}", json!({ "added": record.id, "collection": collection }));
    Ok(())
}

fn print_status(orchestrator: &SyncOrchestrator) -> CliResult<()> {
    let status = orchestrator.status();
    let store = orchestrator.store();
    let runs: Vec<Value> = orchestrator
        .recent_runs(RECENT_RUNS_SHOWN)?
        .into_iter()
        .map(|run| {
            json!({
                "backend": run.backend,
                "outcome": run.outcome,
                "message": run.message,
                "finishedAt": run.finished_at,
            })
        })
        .collect();
    let counts: serde_json::Map<String, Value> = Collection::ALL
        .into_iter()
        .map(|collection| {
            (
                collection.json_key().to_string(),
                json!(store.get(collection).len()),
            )
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "backend": status.backend.as_str(),
            "lastSynced": store.last_synced(),
            "activeRecords": counts,
            "recentRuns": runs,
        }))?
    );
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!("{}", json!({ "outcome": report.outcome, "message": report.message }));
}

fn parse_choice(value: &str) -> Result<ConflictChoice, String> {
    ConflictChoice::parse(value)
        .ok_or_else(|| format!("expected local, remote or cancel, got `{value}`"))
}
