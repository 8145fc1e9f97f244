//! Integration tests for quota enforcement and projections over SQLite

use quota_rs::config::Config;
use quota_rs::event_store::EventStore;
use quota_rs::ledger::{EntityKey, EntityMetadata, UserId, WorldId};
use quota_rs::quota::OperationContext;
use quota_rs::services::QuotaServices;
use quota_rs::{QuotaError, Sizeable, Storable};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn setup_services() -> QuotaServices {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();

    let mut config = Config::default();
    config.quota.default_allocated_bytes = 1000;
    config.quota.allocations.insert("big".to_string(), 5000);

    QuotaServices::from_pool(pool, &config).await.unwrap()
}

fn character(id: &str, size: i64) -> EntityMetadata {
    EntityMetadata::new("worldA", EntityKey::new("character", id), size)
}

struct Lineage {
    id: String,
    world: String,
    name: String,
    traits: Vec<String>,
}

impl Sizeable for Lineage {
    fn size_in_bytes(&self) -> i64 {
        self.name.size_in_bytes() + self.traits.size_in_bytes()
    }
}

impl Storable for Lineage {
    fn entity_key(&self) -> EntityKey {
        EntityKey::new("lineage", self.id.as_str())
    }

    fn world_id(&self) -> WorldId {
        WorldId::new(self.world.as_str())
    }
}

#[tokio::test]
async fn test_overwrite_and_rejection() {
    let services = setup_services().await;
    let enforcer = &services.enforcer;

    let mut ctx = OperationContext::new("u1");
    enforcer.ensure_available(&mut ctx, &character("c1", 400)).await.unwrap();
    enforcer.update(&mut ctx, &character("c1", 400)).await.unwrap();

    let summary = services.projections.summary(&UserId::new("u1")).await.unwrap().unwrap();
    assert_eq!(summary.allocated_bytes, 1000);
    assert_eq!(summary.used_bytes, 400);
    assert_eq!(summary.available_bytes, 600);

    // Growing c1 to 1200 needs 800 more bytes
    let mut ctx = OperationContext::new("u1");
    let err = enforcer
        .ensure_available(&mut ctx, &character("c1", 1200))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QuotaError::QuotaExceeded {
            available_bytes: 600,
            required_bytes: 800,
            ..
        }
    ));

    // Shrinking overwrites the previous size
    enforcer.update(&mut ctx, &character("c1", 250)).await.unwrap();
    let summary = services.projections.summary(&UserId::new("u1")).await.unwrap().unwrap();
    assert_eq!(summary.used_bytes, 250);

    let details = services.projections.details(&UserId::new("u1")).await.unwrap();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].size, 250);
}

#[tokio::test]
async fn test_new_entity_over_remaining_budget() {
    let services = setup_services().await;
    let enforcer = &services.enforcer;
    let ctx = OperationContext::new("u1");

    enforcer
        .execute(&ctx, &character("c1", 300), || async { Ok::<_, QuotaError>(()) })
        .await
        .unwrap();
    enforcer
        .execute(&ctx, &character("c2", 500), || async { Ok::<_, QuotaError>(()) })
        .await
        .unwrap();

    let writes = AtomicU32::new(0);
    let err = enforcer
        .execute(&ctx, &character("c3", 300), || async {
            writes.fetch_add(1, Ordering::SeqCst);
            Ok::<_, QuotaError>(())
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        QuotaError::QuotaExceeded {
            available_bytes: 200,
            required_bytes: 300,
            ..
        }
    ));
    // The content write never ran
    assert_eq!(writes.load(Ordering::SeqCst), 0);

    let summary = services.projections.summary(&UserId::new("u1")).await.unwrap().unwrap();
    assert_eq!(summary.used_bytes, 800);
    assert_eq!(summary.available_bytes, 200);
}

#[tokio::test]
async fn test_write_filling_remaining_budget_exactly() {
    let services = setup_services().await;
    let enforcer = &services.enforcer;
    let ctx = OperationContext::new("u1");

    enforcer
        .execute(&ctx, &character("c1", 400), || async { Ok::<_, QuotaError>(()) })
        .await
        .unwrap();

    // One byte over the remaining 600 is refused
    let err = enforcer
        .execute(&ctx, &character("c2", 601), || async { Ok::<_, QuotaError>(()) })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QuotaError::QuotaExceeded {
            available_bytes: 600,
            required_bytes: 601,
            ..
        }
    ));

    enforcer
        .execute(&ctx, &character("c2", 600), || async { Ok::<_, QuotaError>(()) })
        .await
        .unwrap();

    let summary = services.projections.summary(&UserId::new("u1")).await.unwrap().unwrap();
    assert_eq!(summary.used_bytes, 1000);
    assert_eq!(summary.available_bytes, 0);

    // A full ledger still accepts rewrites that do not grow
    enforcer
        .execute(&ctx, &character("c2", 600), || async { Ok::<_, QuotaError>(()) })
        .await
        .unwrap();
    let err = enforcer
        .execute(&ctx, &character("c3", 1), || async { Ok::<_, QuotaError>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::QuotaExceeded { available_bytes: 0, .. }));
}

#[tokio::test]
async fn test_initialize_twice_keeps_allocation() {
    let services = setup_services().await;

    let first = services
        .enforcer
        .initialize(&mut OperationContext::new("big"))
        .await
        .unwrap();
    assert_eq!(first.allocated_bytes(), 5000);
    assert_eq!(first.version(), 1);

    let second = services
        .enforcer
        .initialize(&mut OperationContext::new("big"))
        .await
        .unwrap();
    assert_eq!(second.allocated_bytes(), 5000);
    assert_eq!(second.version(), 1);

    let summaries = services.projections.list_summaries().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].allocated_bytes, 5000);
}

#[tokio::test]
async fn test_concurrent_updates_one_commits() {
    let services = setup_services().await;
    let enforcer = &services.enforcer;

    enforcer
        .initialize(&mut OperationContext::new("u1"))
        .await
        .unwrap();

    // Both writers load the ledger at the same version
    let mut first = OperationContext::new("u1");
    let mut second = OperationContext::new("u1");
    enforcer.ensure_available(&mut first, &character("c1", 700)).await.unwrap();
    enforcer.ensure_available(&mut second, &character("c2", 700)).await.unwrap();

    let first_meta = character("c1", 700);
    let second_meta = character("c2", 700);
    let (a, b) = tokio::join!(
        enforcer.update(&mut first, &first_meta),
        enforcer.update(&mut second, &second_meta),
    );

    let outcomes = [a, b];
    let committed = outcomes.iter().filter(|r| r.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|r| matches!(r, Err(QuotaError::ConcurrencyConflict { .. })))
        .count();
    assert_eq!(committed, 1);
    assert_eq!(conflicts, 1);

    // Allocation was never overrun
    let ledger = enforcer.ledger(&UserId::new("u1")).await.unwrap();
    assert_eq!(ledger.used_bytes(), 700);
    assert_eq!(ledger.version(), 2);

    let summary = services.projections.summary(&UserId::new("u1")).await.unwrap().unwrap();
    assert_eq!(summary.used_bytes, 700);
}

#[tokio::test]
async fn test_concurrent_reservations_respect_allocation() {
    let services = setup_services().await;
    let enforcer = &services.enforcer;
    let ctx = OperationContext::new("u1");

    let first_meta = character("c1", 600);
    let second_meta = character("c2", 600);
    let (a, b) = tokio::join!(
        enforcer.reserve(&ctx, &first_meta),
        enforcer.reserve(&ctx, &second_meta),
    );

    // Whichever loses the race retries against the new state and no longer fits
    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(QuotaError::QuotaExceeded { .. }))));

    let ledger = enforcer.ledger(&UserId::new("u1")).await.unwrap();
    assert_eq!(ledger.used_bytes(), 600);
}

#[tokio::test]
async fn test_missed_projection_caught_up() {
    let services = setup_services().await;
    let user = UserId::new("u1");

    let mut ctx = OperationContext::new("u1");
    services
        .enforcer
        .update(&mut ctx, &character("c1", 100))
        .await
        .unwrap();

    // A commit that never reached the projections
    let mut ledger = services.enforcer.ledger(&user).await.unwrap();
    let meta = character("c1", 300);
    ledger.store(meta.key, meta.size, meta.world_id).unwrap();
    let recorded = services
        .store
        .append(&user, ledger.version(), ledger.pending())
        .await
        .unwrap();
    assert_eq!(recorded[0].version, 3);

    assert_eq!(services.projections.checkpoint(&user).await.unwrap(), 2);

    let applied = services.projections.catch_up(&user).await.unwrap();
    assert_eq!(applied, 1);
    assert_eq!(services.projections.checkpoint(&user).await.unwrap(), 3);

    let summary = services.projections.summary(&user).await.unwrap().unwrap();
    assert_eq!(summary.used_bytes, 300);

    // Nothing left to replay
    let report = services.projections.catch_up_all().await.unwrap();
    assert_eq!(report.streams, 1);
    assert_eq!(report.events_applied, 0);
    assert!(report.failures.is_empty());
}

#[tokio::test]
async fn test_cancelled_before_commit_persists_nothing() {
    let services = setup_services().await;

    let mut ctx = OperationContext::new("u1");
    services
        .enforcer
        .ensure_available(&mut ctx, &character("c1", 100))
        .await
        .unwrap();
    ctx.cancellation().cancel();

    let err = services
        .enforcer
        .update(&mut ctx, &character("c1", 100))
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::Cancelled));

    let ledger = services.enforcer.ledger(&UserId::new("u1")).await.unwrap();
    assert!(!ledger.is_initialized());
    assert!(services.projections.summary(&UserId::new("u1")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_storable_content_counts_against_quota() {
    let services = setup_services().await;
    let ctx = OperationContext::new("u1");

    let mut lineage = Lineage {
        id: "elves".to_string(),
        world: "worldB".to_string(),
        name: "Elves".to_string(),
        traits: vec!["darkvision".to_string(), "trance".to_string()],
    };
    services
        .enforcer
        .execute(&ctx, &lineage.metadata(), || async { Ok::<_, QuotaError>(()) })
        .await
        .unwrap();

    lineage.traits.push("keen senses".to_string());
    services
        .enforcer
        .execute(&ctx, &lineage.metadata(), || async { Ok::<_, QuotaError>(()) })
        .await
        .unwrap();

    let details = services
        .projections
        .details_for_world(&UserId::new("u1"), &WorldId::new("worldB"))
        .await
        .unwrap();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].entity_type, "lineage");
    assert_eq!(details[0].size, 5 + 10 + 6 + 11);

    let summary = services.projections.summary(&UserId::new("u1")).await.unwrap().unwrap();
    assert_eq!(summary.used_bytes, 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contended_file_database_never_overruns_allocation() {
    let dir = tempfile::tempdir().unwrap();

    // No busy timeout: a writer that loses the lock fails at once instead of waiting
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("quota.db"))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::ZERO);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .unwrap();

    let mut config = Config::default();
    config.quota.default_allocated_bytes = 1000;
    config.quota.max_retries = 8;
    let services = QuotaServices::from_pool(pool, &config).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..6 {
        let enforcer = Arc::clone(&services.enforcer);
        tasks.push(tokio::spawn(async move {
            let ctx = OperationContext::new("u1");
            enforcer.reserve(&ctx, &character(&format!("c{}", i), 300)).await
        }));
    }

    let mut reserved = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => reserved += 1,
            Err(QuotaError::QuotaExceeded { .. }) | Err(QuotaError::RetriesExhausted { .. }) => {}
            Err(err) => panic!("unexpected error under contention: {}", err),
        }
    }
    assert!(reserved >= 1);
    assert!(reserved <= 3);

    let user = UserId::new("u1");
    let ledger = services.enforcer.ledger(&user).await.unwrap();
    assert_eq!(ledger.allocated_bytes(), 1000);
    assert_eq!(ledger.used_bytes(), 300 * reserved);
    assert_eq!(ledger.entities().count() as i64, reserved);

    // Projection writes may have lost the same races; catch-up repairs them
    let report = services.projections.catch_up_all().await.unwrap();
    assert!(report.failures.is_empty());

    let summary = services.projections.summary(&user).await.unwrap().unwrap();
    assert_eq!(summary.used_bytes, ledger.used_bytes());
    assert_eq!(
        services.projections.checkpoint(&user).await.unwrap(),
        services.store.current_version(&user).await.unwrap()
    );
}
