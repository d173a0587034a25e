//! Engine fixtures.
//!
//! [`TestHarness`] bundles an engine, its in-memory store, the mock remote
//! and a recording event publisher, plus helpers for seeding a catalog.

use catsync_core::{
    field_map, ChangeId, Entity, EntityId, EntityStore, FieldMap, FieldValue, MemoryStore,
    SyncBatch,
};
use catsync_engine::{
    EngineConfig, MemoryPublisher, MockCatalog, PoolConfig, RateLimitConfig, RetryConfig,
    SchedulerConfig, StageRequest, SyncEngine,
};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Version seeded products start at.
pub const SEED_VERSION: u64 = 3;

/// Reviewer recorded by harness approvals.
pub const REVIEWER: &str = "reviewer@test";

/// Engine configuration with short timings for tests.
///
/// Retries back off for a millisecond, the rate budget never throttles a
/// test on its own, and the pool samples every 10ms.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_scheduler(SchedulerConfig::default().with_max_batch_size(50))
        .with_pool(
            PoolConfig::default()
                .with_workers(1, 4)
                .with_sample_interval(Duration::from_millis(10))
                .with_batch_timeout(Duration::from_secs(5))
                .with_max_batch_attempts(3),
        )
        .with_rate_limit(
            RateLimitConfig::new(1_000, 1_000.0)
                .with_default_backoff(Duration::from_millis(20))
                .with_recovery_successes(5),
        )
        .with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(10))
                .with_jitter(false),
        )
        .with_remote_timeout(Duration::from_secs(2))
}

/// Catalog fields of a product.
pub fn product_fields(sku: &str, price: f64) -> FieldMap {
    field_map([
        ("sku", FieldValue::from(sku)),
        ("title", FieldValue::from(format!("Product {sku}"))),
        ("price", FieldValue::Float(price)),
        ("inventory", FieldValue::Int(25)),
    ])
}

/// A single-field price candidate.
pub fn price(value: f64) -> FieldMap {
    field_map([("price", FieldValue::Float(value))])
}

/// Remote id given to a seeded product.
pub fn seeded_external_id(sku: &str) -> String {
    format!("gid://seed/Product/{sku}")
}

/// An engine over an in-memory store and a mock remote.
pub struct TestHarness {
    /// The engine.
    pub engine: SyncEngine<MockCatalog, MemoryStore>,
    /// The local catalog and staging store.
    pub store: Arc<MemoryStore>,
    /// The remote.
    pub remote: Arc<MockCatalog>,
    /// Every event the engine emitted.
    pub events: Arc<MemoryPublisher>,
}

impl TestHarness {
    /// Creates a harness with [`fast_config`].
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// Creates a harness with a custom configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_remote(config, MockCatalog::new())
    }

    /// Creates a harness around a preconfigured mock remote.
    pub fn with_remote(config: EngineConfig, remote: MockCatalog) -> Self {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(remote);
        let events = Arc::new(MemoryPublisher::new());
        let engine = SyncEngine::builder(config, Arc::clone(&remote), Arc::clone(&store))
            .publisher(events.clone())
            .build()
            .expect("test engine config must be valid");
        Self {
            engine,
            store,
            remote,
            events,
        }
    }

    /// Seeds a product that exists on both sides at [`SEED_VERSION`].
    pub fn seed_product(&self, sku: &str, price: f64) -> EntityId {
        let fields = product_fields(sku, price);
        let external_id = seeded_external_id(sku);
        self.remote.insert_record(external_id.clone(), fields.clone());
        let entity = Entity::new(EntityId::new(), fields)
            .with_external_id(external_id)
            .with_version(SEED_VERSION);
        let id = entity.id;
        self.store
            .insert_entity(entity)
            .expect("memory store insert cannot fail");
        id
    }

    /// Seeds `count` products named `SKU-0`, `SKU-1`, ...
    pub fn seed_products(&self, count: usize, price: f64) -> Vec<EntityId> {
        (0..count)
            .map(|n| self.seed_product(&format!("SKU-{n}"), price))
            .collect()
    }

    /// Seeds a local-only product that still has to be created remotely.
    pub fn seed_unsynced(&self, sku: &str, price: f64) -> EntityId {
        let entity = Entity::new(EntityId::new(), product_fields(sku, price));
        let id = entity.id;
        self.store
            .insert_entity(entity)
            .expect("memory store insert cannot fail");
        id
    }

    /// Edits an entity the way a producer would, bumping its version.
    pub fn edit_locally(&self, entity_id: EntityId, field: &str, value: FieldValue) -> Entity {
        let mut entity = self.entity(entity_id);
        let expected = entity.version;
        entity.fields.insert(field.to_string(), value);
        entity.version += 1;
        self.store
            .put_entity(entity.clone(), expected)
            .expect("producer edit must not race in tests");
        entity
    }

    /// Reads an entity.
    pub fn entity(&self, entity_id: EntityId) -> Entity {
        self.engine.entity(entity_id).expect("entity must exist")
    }

    /// Stages a candidate that is expected to produce a change.
    pub fn stage(&self, entity_id: EntityId, candidate: FieldMap) -> ChangeId {
        self.engine
            .stage(StageRequest::update(entity_id, candidate))
            .expect("stage must succeed")
            .expect("candidate must differ from the entity")
    }

    /// Stages and approves a candidate.
    pub fn stage_and_approve(&self, entity_id: EntityId, candidate: FieldMap) -> ChangeId {
        let change_id = self.stage(entity_id, candidate);
        self.engine
            .approve(change_id, REVIEWER)
            .expect("approval must succeed");
        change_id
    }

    /// Forms batches from every approval and runs them on the calling task.
    pub async fn sync_all(&self) -> Vec<SyncBatch> {
        self.engine.start_batch().expect("batch formation must succeed");
        self.engine.run_until_idle().await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a value as JSON to a temporary file.
pub fn temp_json<T: Serialize>(value: &T) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp file");
    serde_json::to_writer_pretty(&mut file, value).expect("serialize fixture");
    file.flush().expect("flush fixture");
    file
}
