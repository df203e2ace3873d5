use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stockroom::cache::DurableCache;
use stockroom::config::Config;
use stockroom::remote::{HttpRemoteStore, MemoryRemoteStore, RemoteStore};
use stockroom::sync::{
  EngineSettings, Record, RefreshOptions, ResyncScheduler, Scope, SyncEngine, WriteOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "stockroom")]
#[command(about = "Offline-first inventory sync for point-of-sale clients")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/stockroom/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Scope (warehouse) to work in
  #[arg(short, long)]
  scope: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show the inventory, refreshing from the server when the cache is stale
  List {
    /// Only show what is cached
    #[arg(long)]
    cached: bool,
  },
  /// Show unsynced records, open conflicts and recent pushes
  Status,
  /// Push records that only exist on this device
  Sync,
  /// Create a record from a JSON object of fields
  Add { id: String, fields: String },
  /// Delete records; only removed locally once the server confirms
  Delete {
    #[arg(required = true)]
    ids: Vec<String>,
  },
  /// Refresh and push in the background until Ctrl-C
  Watch,
  /// Offline create followed by a push, against an in-memory server
  Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = stockroom::logging::init(&config)?;

  let scope = Scope::new(
    args
      .scope
      .or_else(|| config.default_scope.clone())
      .unwrap_or_else(|| "default".to_string()),
  );
  let settings = EngineSettings::from_config(&config);

  if let Command::Demo = args.command {
    return demo(scope, settings).await;
  }

  let cache = Arc::new(DurableCache::open(&config.cache)?);
  let remote = Arc::new(HttpRemoteStore::new(&config.remote)?);
  let engine = Arc::new(SyncEngine::new(remote, cache, scope, settings));

  run(engine, args.command, &config).await
}

async fn run<R: RemoteStore + 'static>(engine: Arc<SyncEngine<R>>, command: Command, config: &Config) -> Result<()> {
  match command {
    Command::List { cached } => {
      if !cached {
        engine.refresh_products(RefreshOptions::default()).await?;
      }
      print_warnings(&engine);
      print_products(&engine);
    }
    Command::Status => print_status(&engine),
    Command::Sync => {
      let report = engine.sync_local_inventory_to_api().await;
      println!(
        "pushed {}/{} ({} failed)",
        report.synced, report.total, report.failed
      );
      for id in &report.synced_ids {
        println!("  {}", id);
      }
    }
    Command::Add { id, fields } => {
      let fields: Map<String, Value> =
        serde_json::from_str(&fields).map_err(|e| eyre!("Fields must be a JSON object: {}", e))?;
      let outcome = engine.add_product(Record::new(id, fields)).await;
      print_outcome(&outcome);
      print_warnings(&engine);
    }
    Command::Delete { ids } => {
      if let [id] = ids.as_slice() {
        engine.delete_product(id).await?;
        println!("deleted {}", id);
      } else {
        let report = engine.delete_products(&ids).await?;
        println!("deleted {}", report.deleted.join(", "));
        if !report.unconfirmed.is_empty() {
          println!("still on the server: {}", report.unconfirmed.join(", "));
        }
      }
    }
    Command::Watch => {
      let scheduler = ResyncScheduler::spawn(
        engine.clone(),
        Duration::from_secs(config.sync.poll_interval_secs),
        Duration::from_secs(config.sync.push_interval_secs),
      );
      scheduler.trigger();
      println!("watching {} (Ctrl-C to stop)", engine.scope());
      tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to wait for Ctrl-C: {}", e))?;
      scheduler.shutdown().await;
      print_status(&engine);
    }
    Command::Demo => {}
  }
  Ok(())
}

async fn demo(scope: Scope, settings: EngineSettings) -> Result<()> {
  let remote = Arc::new(MemoryRemoteStore::new());
  let engine = SyncEngine::new(
    remote.clone(),
    Arc::new(DurableCache::in_memory()),
    scope.clone(),
    settings,
  );

  println!("server offline, creating p1");
  remote.set_online(false);
  let record = Record::from_json("p1", serde_json::json!({ "name": "Red Shoe", "qty": 5 }));
  print_outcome(&engine.add_product(record).await);
  println!("unsynced: {}", engine.unsynced_count());

  println!("server back online, pushing");
  remote.set_online(true);
  let report = engine.sync_local_inventory_to_api().await;
  println!("{}", serde_json::to_string(&report)?);
  println!("unsynced: {}", engine.unsynced_count());
  println!("server has {} record(s) in {}", remote.len(&scope), scope);
  Ok(())
}

fn print_outcome(outcome: &WriteOutcome) {
  match outcome {
    WriteOutcome::SavedRemote(record) => println!("saved {}", record.id),
    WriteOutcome::SavedUnverified { record, reason } => {
      println!("{} saved but unconfirmed, refresh to confirm ({})", record.id, reason)
    }
    WriteOutcome::SavedLocalOnly { record, reason } => {
      println!("{} saved on this device only ({})", record.id, reason)
    }
    WriteOutcome::Conflict(case) => println!(
      "conflict #{} on {}: {:?}, server at {:?}",
      case.id, case.identity, case.kind, case.server_version
    ),
    WriteOutcome::Failed(err) => println!("failed: {}", err),
  }
}

fn print_products<R: RemoteStore>(engine: &SyncEngine<R>) {
  let products = engine.products();
  if products.is_empty() {
    println!("no records in {}", engine.scope());
    return;
  }
  for record in products {
    let version = record
      .version
      .map(|v| v.to_string())
      .unwrap_or_else(|| "-".into());
    let state = engine
      .sync_state(&record.id)
      .map(|s| format!("{:?}", s))
      .unwrap_or_else(|| "cached".into());
    println!(
      "{:<24} {:>6}  {:<10} {}",
      record.id,
      version,
      state,
      Value::Object(record.fields)
    );
  }
}

fn print_status<R: RemoteStore>(engine: &SyncEngine<R>) {
  println!("scope:       {}", engine.scope());
  println!("unsynced:    {}", engine.unsynced_count());
  for record in engine.products() {
    if engine.is_unsynced(&record.id) {
      println!("  {}", record.id);
    }
  }

  let conflicts = engine.pending_conflicts();
  println!("conflicts:   {}", conflicts.len());
  for case in conflicts {
    println!("  #{} {} ({:?})", case.id, case.identity, case.kind);
  }

  if engine.storage_persist_failed() {
    println!("warning: local storage is full, changes will not survive a restart");
  }

  let history = engine.sync_history();
  for entry in history.iter().rev().take(5) {
    println!(
      "push {} {}: {}/{} synced",
      entry.at.format("%Y-%m-%d %H:%M:%S"),
      entry.scope,
      entry.report.synced,
      entry.report.total
    );
  }
}

fn print_warnings<R: RemoteStore>(engine: &SyncEngine<R>) {
  for warning in engine.warnings() {
    eprintln!("warning: {}", warning);
  }
}
