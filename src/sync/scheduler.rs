//! Resync scheduler: refreshes and pushes without user action.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::engine::{RefreshOptions, SyncEngine};
use crate::remote::RemoteStore;

/// Why a resync ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
  ConnectivityRegained,
  VisibilityRegained,
  PollInterval,
  PushInterval,
  Explicit,
}

#[derive(Debug)]
enum Signal {
  Online(bool),
  Visible(bool),
  SyncNow,
  Shutdown,
}

/// Background task driving silent refreshes and local-only pushes.
///
/// Runs only while the client is both online and visible. Poll ticks refresh
/// the current scope; push ticks only push, and only when something is
/// waiting.
pub struct ResyncScheduler {
  tx: mpsc::UnboundedSender<Signal>,
  runs: watch::Receiver<u64>,
  handle: JoinHandle<()>,
}

impl ResyncScheduler {
  pub fn spawn<R: RemoteStore + 'static>(engine: Arc<SyncEngine<R>>, poll: Duration, push: Duration) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (runs_tx, runs) = watch::channel(0u64);

    let handle = tokio::spawn(async move {
      let mut online = true;
      let mut visible = true;

      let mut poll_tick = interval_at(Instant::now() + poll, poll);
      poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
      let mut push_tick = interval_at(Instant::now() + push, push);
      push_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        let trigger = tokio::select! {
          signal = rx.recv() => match signal {
            None | Some(Signal::Shutdown) => break,
            Some(Signal::Online(now)) => {
              let regained = now && !online;
              online = now;
              if !regained {
                continue;
              }
              Trigger::ConnectivityRegained
            }
            Some(Signal::Visible(now)) => {
              let regained = now && !visible;
              visible = now;
              if !regained {
                continue;
              }
              Trigger::VisibilityRegained
            }
            Some(Signal::SyncNow) => Trigger::Explicit,
          },
          _ = poll_tick.tick() => Trigger::PollInterval,
          _ = push_tick.tick() => Trigger::PushInterval,
        };

        if !(online && visible) {
          debug!(?trigger, online, visible, "resync skipped while inactive");
          continue;
        }
        resync(&engine, trigger).await;
        runs_tx.send_modify(|n| *n += 1);
      }
      debug!("resync scheduler stopped");
    });

    Self { tx, runs, handle }
  }

  pub fn set_online(&self, online: bool) {
    self.send(Signal::Online(online));
  }

  pub fn set_visible(&self, visible: bool) {
    self.send(Signal::Visible(visible));
  }

  /// Explicit user retry.
  pub fn trigger(&self) {
    self.send(Signal::SyncNow);
  }

  /// Completed resync runs, for observers that want to wait on one.
  pub fn runs(&self) -> watch::Receiver<u64> {
    self.runs.clone()
  }

  /// Stop the task and wait for the run in progress to finish.
  pub async fn shutdown(self) {
    self.send(Signal::Shutdown);
    if let Err(e) = self.handle.await {
      warn!(error = %e, "resync scheduler task failed");
    }
  }

  fn send(&self, signal: Signal) {
    if self.tx.send(signal).is_err() {
      debug!("resync scheduler already stopped");
    }
  }
}

async fn resync<R: RemoteStore>(engine: &SyncEngine<R>, trigger: Trigger) {
  engine.sweep_undo();

  if trigger != Trigger::PushInterval {
    if let Err(e) = engine.refresh_products(RefreshOptions::silent()).await {
      debug!(?trigger, error = %e, "silent refresh failed");
    }
  }

  if engine.unsynced_count() > 0 {
    let report = engine.sync_local_inventory_to_api().await;
    info!(?trigger, synced = report.synced, failed = report.failed, "background push");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::DurableCache;
  use crate::remote::MemoryRemoteStore;
  use crate::sync::{EngineSettings, Record, Scope};
  use serde_json::json;

  fn setup() -> (Arc<MemoryRemoteStore>, Arc<SyncEngine<MemoryRemoteStore>>) {
    let remote = Arc::new(MemoryRemoteStore::new());
    let engine = Arc::new(SyncEngine::new(
      remote.clone(),
      Arc::new(DurableCache::in_memory()),
      Scope::new("wh-1"),
      EngineSettings::default(),
    ));
    (remote, engine)
  }

  async fn wait_for_runs(runs: &mut watch::Receiver<u64>, at_least: u64) {
    runs.wait_for(|n| *n >= at_least).await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_connectivity_regained_pushes_local_only_records() {
    let (remote, engine) = setup();
    remote.set_online(false);
    engine
      .add_product(Record::from_json("p1", json!({"name": "Red Shoe"})))
      .await;
    assert_eq!(engine.unsynced_count(), 1);

    let scheduler = ResyncScheduler::spawn(engine.clone(), Duration::from_secs(120), Duration::from_secs(60));
    let mut runs = scheduler.runs();
    scheduler.set_online(false);
    remote.set_online(true);
    scheduler.set_online(true);

    wait_for_runs(&mut runs, 1).await;
    assert_eq!(engine.unsynced_count(), 0);
    assert!(remote.record(&Scope::new("wh-1"), "p1").is_some());
    scheduler.shutdown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_hidden_client_does_not_poll() {
    let (remote, engine) = setup();
    remote.insert(&Scope::new("wh-1"), Record::from_json("p1", json!({})).with_version(1));

    let scheduler = ResyncScheduler::spawn(engine.clone(), Duration::from_secs(10), Duration::from_secs(60));
    let runs = scheduler.runs();
    scheduler.set_visible(false);

    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(*runs.borrow(), 0);
    assert!(engine.products().is_empty());

    let mut runs = scheduler.runs();
    scheduler.set_visible(true);
    wait_for_runs(&mut runs, 1).await;
    assert_eq!(engine.products().len(), 1);
    scheduler.shutdown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_poll_interval_refreshes_silently() {
    let (remote, engine) = setup();
    remote.insert(&Scope::new("wh-1"), Record::from_json("p1", json!({})).with_version(1));

    let scheduler = ResyncScheduler::spawn(engine.clone(), Duration::from_secs(10), Duration::from_secs(60));
    let mut runs = scheduler.runs();
    wait_for_runs(&mut runs, 1).await;
    assert_eq!(engine.products().len(), 1);
    assert!(!engine.is_loading());
    scheduler.shutdown().await;
  }
}
