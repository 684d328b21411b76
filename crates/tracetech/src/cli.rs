//! Command-line front end over [`SyncEngine`].
//!
//! The binary has no real remote backend wired in. In cloud mode it runs the
//! engine against a [`MemoryRemoteStore`] primed from the local snapshot
//! cache, so state carries over between invocations through `trace_state`.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracetech_config::{
    Actor, AppConfig, ConfigEntity, ConfigKind, Entity, FileStore, KeyValueStore, RemoteMode,
    TraceRecord,
};
use tracetech_sync::fallback::{seed_actors, PersistedSnapshot};
use tracetech_sync::memory::MemoryRemoteStore;
use tracetech_sync::reconcile::Watch;
use tracetech_sync::{RecordFilter, SyncEngine};
use tracing::debug;

const READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "tracetech")]
#[command(version, about = "Role-aware traceability records")]
pub struct Cli {
    /// Configuration file (defaults to TRACETECH_CONFIG or the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the configured data mode: cloud or local
    #[arg(long, global = true)]
    pub mode: Option<RemoteMode>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sign in and remember the session
    Login {
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Forget the stored session
    Logout,
    /// Show the signed-in actor
    Whoami,
    /// List the records visible to the signed-in actor
    Records(FilterArgs),
    /// Counts by status and category over the visible records
    Stats(FilterArgs),
    /// Data mode and channel health
    Status,
    /// Write the seed dataset into empty remote collections
    Seed,
}

#[derive(Args, Debug, Default, Clone)]
pub struct FilterArgs {
    #[arg(long)]
    pub category: Option<String>,
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long)]
    pub search: Option<String>,
}

impl FilterArgs {
    pub fn to_filter(&self) -> RecordFilter {
        RecordFilter {
            category: self.category.clone(),
            status: self.status.clone(),
            search: self.search.clone(),
        }
    }
}

/// In-memory remote store primed from the snapshot cache. Without a cache
/// only the seed actors are loaded, so `login` and `seed` work on first use.
fn demo_remote(local: &dyn KeyValueStore) -> Result<Arc<MemoryRemoteStore>> {
    let store = Arc::new(MemoryRemoteStore::new());
    match PersistedSnapshot::load(local).context("Failed to read the snapshot cache")? {
        Some(snapshot) => {
            debug!(records = snapshot.records.len(), "priming remote store from cache");
            store.preload(
                TraceRecord::COLLECTION,
                snapshot.records.iter().map(Entity::to_document),
            );
            store.preload(
                Actor::COLLECTION,
                snapshot.actors.iter().map(Entity::to_document),
            );
            store.preload(
                ConfigEntity::COLLECTION,
                snapshot.vocabulary.iter().map(Entity::to_document),
            );
        }
        None => store.preload(Actor::COLLECTION, seed_actors().iter().map(Entity::to_document)),
    }
    Ok(store)
}

/// Execute one command, writing user-facing output to `out`.
pub async fn run(cli: Cli, mut config: AppConfig, out: &mut dyn Write) -> Result<()> {
    if let Some(mode) = cli.mode {
        config.remote.mode = mode;
    }
    let local = Arc::new(FileStore::open(config.storage_dir()?)?);
    let remote = demo_remote(local.as_ref())?;

    let mut engine = SyncEngine::new(&config, remote, local);
    engine.start();
    tokio::time::timeout(READY_TIMEOUT, engine.wait_until_ready())
        .await
        .context("Timed out waiting for the remote store")?;

    match cli.command {
        Command::Login { username, password } => {
            let actor = engine.login(&username, &password).await?;
            writeln!(out, "Signed in as {} ({})", actor.display_name, actor.role)?;
        }
        Command::Logout => {
            engine.logout()?;
            writeln!(out, "Signed out")?;
        }
        Command::Whoami => match engine.current_actor() {
            Some(actor) => writeln!(
                out,
                "{} <{}> {}{}",
                actor.display_name,
                actor.username,
                actor.role,
                actor
                    .affiliation
                    .as_deref()
                    .map(|a| format!(", {}", a))
                    .unwrap_or_default()
            )?,
            None => writeln!(out, "Not signed in")?,
        },
        Command::Records(filter) => print_records(&engine, &filter.to_filter(), out)?,
        Command::Stats(filter) => print_stats(&engine, &filter.to_filter(), out)?,
        Command::Status => print_status(&engine, out)?,
        Command::Seed => {
            let report = engine.seed_remote().await?;
            writeln!(out, "{}", report.message)?;
            if report.success {
                writeln!(
                    out,
                    "{} records, {} actors written",
                    report.records_written, report.actors_written
                )?;
                let expected = report.records_written;
                tokio::time::timeout(
                    READY_TIMEOUT,
                    engine.pump_until(|e| e.state().records().len() >= expected),
                )
                .await
                .context("Timed out waiting for seeded records")?;
            }
        }
    }

    engine.persist_snapshot()?;
    Ok(())
}

fn print_records(engine: &SyncEngine, filter: &RecordFilter, out: &mut dyn Write) -> Result<()> {
    let projector = engine.projector();
    if projector.actor().is_none() {
        writeln!(out, "Not signed in")?;
        return Ok(());
    }
    let vocabulary = projector.vocabulary();
    let records = projector.records(filter);
    for item in &records {
        let record = item.record;
        writeln!(
            out,
            "{}{:<14} {} {:<24} {:<12} {}",
            if item.pending { "*" } else { " " },
            record.code,
            record.occurred_on,
            vocabulary.label(ConfigKind::Category, &record.category),
            vocabulary.label(ConfigKind::Status, &record.status),
            projector.assignee_name(record).unwrap_or("-"),
        )?;
    }
    writeln!(out, "{} record(s)", records.len())?;
    Ok(())
}

fn print_stats(engine: &SyncEngine, filter: &RecordFilter, out: &mut dyn Write) -> Result<()> {
    let stats = engine.stats(filter);
    writeln!(out, "Total: {}", stats.total)?;
    writeln!(out, "By status:")?;
    for (status, count) in &stats.by_status {
        writeln!(out, "  {:<24} {}", status, count)?;
    }
    writeln!(out, "By category:")?;
    for (category, count) in &stats.by_category {
        writeln!(out, "  {:<24} {}", category, count)?;
    }
    Ok(())
}

fn print_status(engine: &SyncEngine, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "Status: {}", engine.status())?;
    for watch in Watch::CORE {
        writeln!(out, "  {:<10} {:?}", watch.to_string(), engine.channel_status(&watch))?;
    }
    let quarantined = engine.state().quarantine().count();
    if quarantined > 0 {
        writeln!(out, "  {} document(s) quarantined", quarantined)?;
    }
    Ok(())
}
