use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use stockroom::cache::{CacheResolver, CacheSource, DurableCache, MemoryStorage, Tier};
use stockroom::remote::{MemoryRemoteStore, RemoteStore};
use stockroom::sync::{
  idempotency_token, ConflictKind, EngineSettings, PushReport, Record, RefreshOptions,
  ResolutionChoice, Scope, SyncEngine, SyncState, WriteOutcome,
};
use stockroom::SyncError;

type Engine = SyncEngine<MemoryRemoteStore>;

fn wh1() -> Scope {
  Scope::new("wh-1")
}

fn engine_with(remote: &Arc<MemoryRemoteStore>, cache: Arc<DurableCache>, settings: EngineSettings) -> Engine {
  SyncEngine::new(remote.clone(), cache, wh1(), settings)
}

fn engine(remote: &Arc<MemoryRemoteStore>) -> Engine {
  engine_with(remote, Arc::new(DurableCache::in_memory()), EngineSettings::default())
}

fn red_shoe() -> Record {
  Record::from_json("p1", json!({ "name": "Red Shoe", "qty": 5 }))
}

#[tokio::test(start_paused = true)]
async fn scenario_a_offline_create_is_pushed_when_back_online() {
  let remote = Arc::new(MemoryRemoteStore::new());
  let engine = engine(&remote);

  remote.set_online(false);
  let outcome = engine.add_product(red_shoe()).await;
  assert!(matches!(outcome, WriteOutcome::SavedLocalOnly { .. }));
  assert!(engine.is_unsynced("p1"));
  assert_eq!(engine.unsynced_count(), 1);
  assert_eq!(engine.sync_state("p1"), Some(SyncState::LocalOnly));

  remote.set_online(true);
  let report = engine.sync_local_inventory_to_api().await;
  assert_eq!(
    report,
    PushReport {
      synced: 1,
      failed: 0,
      total: 1,
      synced_ids: vec!["p1".to_string()],
    }
  );
  assert_eq!(engine.unsynced_count(), 0);
  assert_eq!(engine.sync_state("p1"), Some(SyncState::Synced));
}

#[tokio::test(start_paused = true)]
async fn scenario_b_concurrent_edit_resolved_with_server_copy() {
  let remote = Arc::new(MemoryRemoteStore::new());
  remote.insert(&wh1(), Record::from_json("p2", json!({ "price": 10 })).with_version(1));

  let client_a = engine(&remote);
  let client_b = engine(&remote);
  client_a.refresh_products(RefreshOptions::forced()).await.unwrap();
  client_b.refresh_products(RefreshOptions::forced()).await.unwrap();

  let saved = client_a
    .update_product(Record::from_json("p2", json!({ "price": 12 })))
    .await;
  assert_eq!(saved.record().and_then(|r| r.version), Some(2));

  let outcome = client_b
    .update_product(Record::from_json("p2", json!({ "price": 15 })))
    .await;
  let WriteOutcome::Conflict(case) = outcome else {
    panic!("expected a conflict, got {:?}", outcome);
  };
  assert_eq!(case.kind, ConflictKind::ConcurrentEdit);
  assert_eq!(case.local.field("price"), Some(&json!(15)));
  assert_eq!(
    case.server.as_ref().and_then(|s| s.field("price")),
    Some(&json!(12))
  );
  assert_eq!(client_b.sync_state("p2"), Some(SyncState::Conflict));

  let kept = client_b
    .resolve_conflict(case.id, ResolutionChoice::KeepServer, None)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(kept.field("price"), Some(&json!(12)));
  assert_eq!(kept.version, Some(2));

  let local = client_b.products().into_iter().find(|r| r.id == "p2").unwrap();
  assert_eq!(local.field("price"), Some(&json!(12)));
  assert_eq!(local.version, Some(2));
  assert_eq!(client_b.sync_state("p2"), Some(SyncState::Synced));

  let audit = client_b.audit_log();
  assert_eq!(audit.len(), 1);
  assert_eq!(audit[0].identity, "p2");
  assert_eq!(audit[0].choice, ResolutionChoice::KeepServer);
  assert!(client_b.pending_conflicts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn scenario_c_timeout_serves_cached_inventory_with_warning() {
  let remote = Arc::new(MemoryRemoteStore::new());
  let cache = Arc::new(DurableCache::in_memory());
  let cached: Vec<Record> = (0..42)
    .map(|i| Record::from_json(format!("p{}", i), json!({ "qty": i })).with_version(1))
    .collect();
  assert!(cache.write(&wh1(), &cached).ok);

  let settings = EngineSettings {
    call_timeout: Duration::from_secs(1),
    ..EngineSettings::default()
  };
  let engine = engine_with(&remote, cache.clone(), settings);
  remote.set_latency(Duration::from_secs(5));

  let report = engine.refresh_products(RefreshOptions::forced()).await.unwrap();
  assert_eq!(report.source, CacheSource::Offline);
  assert_eq!(report.count, 42);
  assert!(report.warning.is_some());
  assert_eq!(engine.products().len(), 42);
  assert!(!engine.warnings().is_empty());
  assert!(engine.error().is_none());

  assert_eq!(CacheResolver::new(cache).resolve(&wh1()).records.len(), 42);
}

#[test]
fn scenario_d_quota_exhaustion_recovers_by_evicting_derived_keys() {
  let cache = DurableCache::new(
    Box::new(MemoryStorage::with_quota(4096)),
    None,
    stockroom::config::default_clearable_keys(),
  );
  assert!(cache.write_blob("sales_history", &vec![b'x'; 3000]).ok);

  let records: Vec<Record> = (0..20)
    .map(|i| Record::from_json(format!("sku-{}", i), json!({ "name": "Canvas Tote", "qty": i })))
    .collect();
  let outcome = cache.write(&wh1(), &records);

  assert!(outcome.ok);
  assert_eq!(outcome.tier, Tier::Primary);
  assert_eq!(outcome.evicted, vec!["sales_history".to_string()]);
  assert!(!cache.storage_persist_failed());
  assert_eq!(cache.read(&wh1()).len(), 20);
  assert!(cache.read_blob("sales_history").is_none());
}

#[tokio::test(start_paused = true)]
async fn scenario_e_undo_window() {
  let remote = Arc::new(MemoryRemoteStore::new());
  let engine = engine(&remote);

  assert!(engine.add_product(red_shoe()).await.is_saved_remote());
  tokio::time::advance(Duration::from_secs(5)).await;
  engine.undo_create("p1").await.unwrap();
  assert!(engine.products().is_empty());
  assert!(remote.record(&wh1(), "p1").is_none());

  let hat = Record::from_json("p2", json!({ "name": "Blue Hat" }));
  assert!(engine.add_product(hat).await.is_saved_remote());
  tokio::time::advance(Duration::from_secs(11)).await;
  assert_eq!(engine.sweep_undo(), vec!["p2".to_string()]);
  assert!(engine.pending_undo().is_empty());
  assert_eq!(
    engine.undo_create("p2").await,
    Err(SyncError::UndoExpired("p2".into()))
  );
  assert!(remote.record(&wh1(), "p2").is_some());
}

#[tokio::test]
async fn repeated_create_with_same_token_yields_one_record() {
  let remote = MemoryRemoteStore::new();
  let token = idempotency_token(&wh1(), "p1");

  remote.create(&wh1(), &red_shoe(), &token).await.unwrap();
  remote.create(&wh1(), &red_shoe(), &token).await.unwrap();

  assert_eq!(remote.create_calls(), 2);
  assert_eq!(remote.len(&wh1()), 1);
}

#[tokio::test(start_paused = true)]
async fn timed_out_update_restores_previous_value() {
  let remote = Arc::new(MemoryRemoteStore::new());
  remote.insert(&wh1(), red_shoe().with_version(1));
  let cache = Arc::new(DurableCache::in_memory());
  let settings = EngineSettings {
    call_timeout: Duration::from_secs(2),
    ..EngineSettings::default()
  };
  let engine = engine_with(&remote, cache.clone(), settings);
  engine.refresh_products(RefreshOptions::forced()).await.unwrap();
  let before = engine.products();

  remote.set_latency(Duration::from_secs(10));
  let outcome = engine
    .update_product(Record::from_json("p1", json!({ "name": "Red Shoe", "qty": 4 })))
    .await;

  assert!(matches!(outcome, WriteOutcome::Failed(SyncError::Timeout(_))));
  assert_eq!(engine.products(), before);
  assert_eq!(cache.read(&wh1()), before);
}

#[tokio::test(start_paused = true)]
async fn synced_only_after_matching_read_back() {
  let remote = Arc::new(MemoryRemoteStore::new());
  remote.set_ack_only(true);
  remote.set_fail_reads(true);
  let engine = engine(&remote);

  let outcome = engine.add_product(red_shoe()).await;
  assert!(matches!(outcome, WriteOutcome::SavedUnverified { .. }));
  assert_ne!(engine.sync_state("p1"), Some(SyncState::Synced));

  remote.set_fail_reads(false);
  assert!(engine.verify_product_saved("p1").await.unwrap());
  assert_eq!(engine.sync_state("p1"), Some(SyncState::Synced));
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_delete_keeps_record_locally() {
  let remote = Arc::new(MemoryRemoteStore::new());
  remote.insert(&wh1(), red_shoe().with_version(1));
  let engine = engine(&remote);
  engine.refresh_products(RefreshOptions::forced()).await.unwrap();

  remote.set_ignore_deletes(true);
  let result = engine.delete_product("p1").await;
  assert!(matches!(result, Err(SyncError::DeleteUnconfirmed { .. })));
  assert_eq!(engine.products().len(), 1);

  remote.set_ignore_deletes(false);
  engine.delete_product("p1").await.unwrap();
  assert!(engine.products().is_empty());
}

#[tokio::test(start_paused = true)]
async fn local_only_records_converge_without_duplicates() {
  let remote = Arc::new(MemoryRemoteStore::new());
  let engine = engine(&remote);

  remote.set_online(false);
  for i in 0..12 {
    let record = Record::from_json(format!("sku-{}", i), json!({ "qty": i }));
    assert!(matches!(
      engine.add_product(record).await,
      WriteOutcome::SavedLocalOnly { .. }
    ));
  }
  assert_eq!(engine.unsynced_count(), 12);

  remote.set_online(true);
  let mut rounds = 0;
  while engine.unsynced_count() > 0 {
    rounds += 1;
    assert!(rounds <= 3, "push did not converge");
    engine.sync_local_inventory_to_api().await;
  }

  assert_eq!(remote.len(&wh1()), 12);
  assert!(engine
    .products()
    .iter()
    .all(|r| engine.sync_state(&r.id) == Some(SyncState::Synced)));
}

#[tokio::test(start_paused = true)]
async fn every_resolution_is_audited_once() {
  let remote = Arc::new(MemoryRemoteStore::new());
  for id in ["p1", "p2"] {
    remote.insert(&wh1(), Record::from_json(id, json!({ "qty": 1 })).with_version(1));
  }
  let client_a = engine(&remote);
  let client_b = engine(&remote);
  client_a.refresh_products(RefreshOptions::forced()).await.unwrap();
  client_b.refresh_products(RefreshOptions::forced()).await.unwrap();

  for id in ["p1", "p2"] {
    client_a
      .update_product(Record::from_json(id, json!({ "qty": 2 })))
      .await;
    client_b
      .update_product(Record::from_json(id, json!({ "qty": 3 })))
      .await;
  }
  let cases = client_b.pending_conflicts();
  assert_eq!(cases.len(), 2);

  let choices = [ResolutionChoice::KeepLocal, ResolutionChoice::KeepServer];
  for (case, choice) in cases.iter().zip(choices) {
    client_b.resolve_conflict(case.id, choice, None).await.unwrap();
  }
  assert!(matches!(
    client_b.resolve_conflict(cases[0].id, ResolutionChoice::KeepServer, None).await,
    Err(SyncError::AlreadyResolved(_))
  ));

  let audit = client_b.audit_log();
  assert_eq!(audit.len(), 2);
  for (entry, choice) in audit.iter().zip(choices) {
    assert_eq!(entry.choice, choice);
  }
  assert_eq!(
    remote.record(&wh1(), &cases[0].identity).and_then(|r| r.field("qty").cloned()),
    Some(json!(3))
  );
}
