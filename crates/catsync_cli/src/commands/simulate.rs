//! Simulate command implementation.
//!
//! Seeds an in-memory store and the mock catalog from a fixture, stages
//! every candidate edit, approves everything that is clean, runs the
//! batches on a started worker pool and reports the outcome.

use super::{read_json, CliError};
use catsync_core::{
    visible_fields, BatchStatus, Entity, EntityId, EntityStore, FieldMap, MemoryStore, Priority,
};
use catsync_engine::{
    BatchRecord, EngineConfig, MetricsSnapshot, MockCatalog, RollbackReport, StageRequest,
    SyncEngine,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Reviewer recorded on every approval the simulator makes.
pub const REVIEWER: &str = "catsync-cli";

/// Simulation inputs gathered from the command line.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Fixture path.
    pub fixture: PathBuf,
    /// Optional engine config path.
    pub config: Option<PathBuf>,
    /// Product keys whose remote mutations are rejected.
    pub reject: Vec<String>,
    /// Throttle every Nth remote mutation.
    pub throttle_every: Option<u64>,
    /// Roll finished batches back afterwards.
    pub rollback: bool,
}

/// Fixture file layout.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fixture {
    /// Products to seed.
    pub products: Vec<FixtureProduct>,
}

/// One seeded product and the edit to stage for it.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureProduct {
    /// Unique label used on the command line.
    pub key: String,
    /// Remote id. Products without one are created remotely.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Local version to seed.
    #[serde(default)]
    pub version: u64,
    /// Current fields.
    pub fields: FieldMap,
    /// Fields to stage. Omitted fields keep their value.
    #[serde(default)]
    pub candidate: Option<FieldMap>,
    /// Stage a delete instead.
    #[serde(default)]
    pub delete: bool,
    /// Route the update through the bulk endpoint.
    #[serde(default)]
    pub bulk: bool,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
}

impl Fixture {
    fn validate(&self) -> Result<(), CliError> {
        let mut keys = HashSet::new();
        for product in &self.products {
            if !keys.insert(product.key.as_str()) {
                return Err(CliError::Fixture(format!("duplicate key {}", product.key)));
            }
            if product.delete && product.candidate.is_some() {
                return Err(CliError::Fixture(format!(
                    "{} has both a candidate and delete",
                    product.key
                )));
            }
        }
        Ok(())
    }

    fn product(&self, key: &str) -> Option<&FixtureProduct> {
        self.products.iter().find(|p| p.key == key)
    }
}

/// Everything the simulation observed.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Products seeded.
    pub products: usize,
    /// Changes staged.
    pub staged: usize,
    /// Candidates identical to the seeded fields.
    pub unchanged: usize,
    /// Candidates the stager refused, as `key: reason`.
    pub stage_errors: Vec<String>,
    /// Changes approved.
    pub approved: usize,
    /// Changes left pending, as `change: reason`.
    pub approval_skips: Vec<String>,
    /// Finished batches in formation order.
    pub batches: Vec<BatchRecord>,
    /// Rollback reports, newest batch first.
    pub rollbacks: Vec<RollbackReport>,
    /// Engine metrics at the end of the run.
    pub metrics: MetricsSnapshot,
}

/// Runs the simulate command.
pub fn run(options: &Options, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(simulate(options))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(&report),
    }
    Ok(())
}

/// Runs one simulation and returns its report.
pub async fn simulate(options: &Options) -> Result<SimulationReport, CliError> {
    let fixture: Fixture = read_json(&options.fixture)?;
    fixture.validate()?;
    let config: EngineConfig = match &options.config {
        Some(path) => read_json(path)?,
        None => EngineConfig::default(),
    };

    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockCatalog::new());
    let seeded = seed(&fixture, &store, &remote)?;

    for key in &options.reject {
        let product = fixture
            .product(key)
            .ok_or_else(|| CliError::Fixture(format!("unknown product key {key}")))?;
        let external_id = product.external_id.as_deref().ok_or_else(|| {
            CliError::Fixture(format!("{key} has no remote record to reject"))
        })?;
        remote.reject_record(external_id, format!("{key} rejected by the simulated remote"));
    }
    if let Some(n) = options.throttle_every {
        remote.throttle_every(n);
    }

    let engine = SyncEngine::new(config, remote, store)?;

    let mut staged = 0;
    let mut unchanged = 0;
    let mut stage_errors = Vec::new();
    for (entity_id, product) in &seeded {
        let request = match (&product.candidate, product.delete) {
            (_, true) => StageRequest::delete(*entity_id),
            (Some(candidate), false) => StageRequest::update(*entity_id, candidate.clone()),
            (None, false) => continue,
        };
        let mut request = request.with_priority(product.priority);
        if product.bulk {
            request = request.via_bulk();
        }
        match engine.stage(request) {
            Ok(Some(_)) => staged += 1,
            Ok(None) => unchanged += 1,
            Err(err) => {
                warn!(key = %product.key, error = %err, "candidate not staged");
                stage_errors.push(format!("{}: {err}", product.key));
            }
        }
    }

    let detection = engine.detect_conflicts();
    let approval = engine.bulk_approve(|_| true, REVIEWER);
    info!(
        examined = detection.examined,
        conflicts = detection.conflicts.len(),
        approved = approval.approved.len(),
        "review finished"
    );

    engine.start()?;
    let batch_ids = engine.start_batch()?;
    let mut finished = Vec::with_capacity(batch_ids.len());
    for batch_id in batch_ids {
        finished.push(engine.wait_for_batch(batch_id).await?);
    }
    engine.shutdown().await;

    let mut rollbacks = Vec::new();
    if options.rollback {
        for batch in finished.iter().rev() {
            if matches!(batch.status, BatchStatus::Completed | BatchStatus::Failed) {
                rollbacks.push(engine.rollback(batch.id).await?);
            }
        }
    }

    Ok(SimulationReport {
        products: seeded.len(),
        staged,
        unchanged,
        stage_errors,
        approved: approval.approved.len(),
        approval_skips: approval
            .skipped
            .iter()
            .map(|(id, reason)| format!("{id}: {reason}"))
            .collect(),
        batches: finished.iter().map(BatchRecord::from_batch).collect(),
        rollbacks,
        metrics: engine.get_metrics(),
    })
}

fn seed<'a>(
    fixture: &'a Fixture,
    store: &MemoryStore,
    remote: &MockCatalog,
) -> Result<Vec<(EntityId, &'a FixtureProduct)>, CliError> {
    let mut seeded = Vec::with_capacity(fixture.products.len());
    for product in &fixture.products {
        let mut entity =
            Entity::new(EntityId::new(), product.fields.clone()).with_version(product.version);
        if let Some(external_id) = &product.external_id {
            remote.insert_record(external_id.clone(), visible_fields(&product.fields));
            entity = entity.with_external_id(external_id.clone());
        }
        let id = entity.id;
        store
            .insert_entity(entity)
            .map_err(|e| CliError::Fixture(format!("{}: {e}", product.key)))?;
        seeded.push((id, product));
    }
    Ok(seeded)
}

fn print_text_output(report: &SimulationReport) {
    println!("catsync simulation");
    println!("==================");
    println!();
    println!("Products:         {}", report.products);
    println!("Staged:           {}", report.staged);
    println!("Unchanged:        {}", report.unchanged);
    println!("Approved:         {}", report.approved);
    for error in &report.stage_errors {
        println!("  not staged: {error}");
    }
    for skip in &report.approval_skips {
        println!("  not approved: {skip}");
    }

    println!();
    println!("Batches:");
    for record in &report.batches {
        println!(
            "  {} {:>8} {:<6} {:?}: {} ok, {} failed, {} skipped, {} attempt(s), {:?}",
            record.batch_id,
            record.priority.as_str(),
            record.change_type.as_str(),
            record.status,
            record.stats.succeeded,
            record.stats.failed,
            record.stats.skipped,
            record.attempts,
            record.duration,
        );
    }

    if !report.rollbacks.is_empty() {
        println!();
        println!("Rollbacks:");
        for rollback in &report.rollbacks {
            let local = rollback.items.iter().filter(|i| i.reverted_locally).count();
            let remote = rollback.items.iter().filter(|i| i.reverted_remotely).count();
            println!(
                "  {} {:?}: {}/{} reverted locally, {}/{} remotely",
                rollback.batch_id,
                rollback.batch_status,
                local,
                rollback.items.len(),
                remote,
                rollback.items.len(),
            );
            for item in rollback.partial() {
                if let Some(reason) = &item.reason {
                    println!("    {}: {reason}", item.entity_id);
                }
            }
        }
    }

    let metrics = &report.metrics;
    println!();
    println!("Success rate:     {:.1}%", metrics.success_rate * 100.0);
    println!("Items:            {} ok, {} failed", metrics.items_succeeded, metrics.items_failed);
    println!("Throttle events:  {}", metrics.throttle_events);
    println!("Retries:          {}", metrics.retries);
    println!("Requeued batches: {}", metrics.batches_requeued);
}
