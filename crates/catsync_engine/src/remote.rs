//! Remote catalog collaborator.
//!
//! [`RemoteCatalog`] is the only surface the engine needs from the
//! platform API client. [`MockCatalog`] is an in-memory, scriptable
//! implementation for tests, demos and the CLI simulator.

use async_trait::async_trait;
use catsync_core::{FieldMap, FieldValue};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Result of one remote call.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Typed failure signals from the remote platform.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Rate budget exceeded (HTTP 429 equivalent).
    #[error("throttled by remote (retry after {retry_after:?})")]
    Throttled {
        /// Suggested wait, if the remote sent one.
        retry_after: Option<Duration>,
    },

    /// Network or 5xx style failure; the call may be retried.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The remote refused the mutation; retrying will not help.
    #[error("{0}")]
    Rejected(String),
}

/// Acknowledgement of a successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAck {
    /// Remote identifier of the record.
    pub external_id: String,
}

impl RemoteAck {
    /// Creates an acknowledgement.
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
        }
    }
}

/// One entry of a bulk update.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    /// Remote identifier of the record.
    pub external_id: String,
    /// Full visible field map to store.
    pub fields: FieldMap,
}

/// Published rate budget of a remote.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateBudget {
    /// Bucket capacity.
    pub burst_size: u32,
    /// Leak rate in calls per second.
    pub refill_per_sec: f64,
}

/// Remote catalog API client.
///
/// Mutations send the full visible field map of the record. Calls may
/// suspend; the engine wraps each one in a timeout.
#[async_trait]
pub trait RemoteCatalog: Send + Sync + 'static {
    /// Creates a record and returns its new id.
    async fn create(&self, fields: &FieldMap) -> RemoteResult<RemoteAck>;

    /// Replaces the fields of an existing record.
    async fn update(&self, external_id: &str, fields: &FieldMap) -> RemoteResult<RemoteAck>;

    /// Removes a record.
    async fn delete(&self, external_id: &str) -> RemoteResult<()>;

    /// Updates many records in one call.
    ///
    /// The outer error fails the whole call; inner errors are per item and
    /// line up with `items`.
    async fn bulk_update(&self, items: &[BulkItem]) -> RemoteResult<Vec<RemoteResult<RemoteAck>>>;

    /// Reads the current fields of a record, `None` if it does not exist.
    async fn fetch(&self, external_id: &str) -> RemoteResult<Option<FieldMap>>;

    /// The remote's published rate budget, if it advertises one.
    fn rate_budget(&self) -> Option<RateBudget> {
        None
    }
}

/// A call observed by [`MockCatalog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    /// `create`
    Create,
    /// `update`
    Update(String),
    /// `delete`
    Delete(String),
    /// `bulk_update` with the number of items.
    Bulk(usize),
    /// `fetch`
    Fetch(String),
}

#[derive(Debug, Default)]
struct Script {
    throttle_next: u32,
    throttle_retry_after: Option<Duration>,
    throttle_every: Option<u64>,
    transient_next: u32,
    panic_next: u32,
    reject_values: Vec<(String, FieldValue, String)>,
    reject_ids: HashMap<String, String>,
}

/// Scriptable in-memory remote.
#[derive(Debug, Default)]
pub struct MockCatalog {
    records: RwLock<BTreeMap<String, FieldMap>>,
    script: Mutex<Script>,
    log: Mutex<Vec<RemoteCall>>,
    next_id: AtomicU64,
    mutations: AtomicU64,
    throttled: AtomicU64,
    latency_ms: AtomicU64,
    budget: Option<RateBudget>,
}

impl MockCatalog {
    /// Creates an empty mock remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertises a rate budget.
    pub fn with_rate_budget(mut self, burst_size: u32, refill_per_sec: f64) -> Self {
        self.budget = Some(RateBudget {
            burst_size,
            refill_per_sec,
        });
        self
    }

    /// Seeds a record.
    pub fn insert_record(&self, external_id: impl Into<String>, fields: FieldMap) {
        self.records.write().insert(external_id.into(), fields);
    }

    /// Reads a record without going through the call log.
    pub fn record(&self, external_id: &str) -> Option<FieldMap> {
        self.records.read().get(external_id).cloned()
    }

    /// Number of stored records.
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    /// Edits a stored record out of band, as another client would.
    pub fn edit_record(&self, external_id: &str, field: &str, value: FieldValue) -> bool {
        match self.records.write().get_mut(external_id) {
            Some(fields) => {
                fields.insert(field.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Throttles the next `count` mutating calls.
    pub fn throttle_next(&self, count: u32, retry_after: Option<Duration>) {
        let mut script = self.script.lock();
        script.throttle_next = count;
        script.throttle_retry_after = retry_after;
    }

    /// Throttles every `n`th mutating call.
    pub fn throttle_every(&self, n: u64) {
        self.script.lock().throttle_every = (n > 0).then_some(n);
    }

    /// Fails the next `count` mutating calls transiently.
    pub fn fail_transiently(&self, count: u32) {
        self.script.lock().transient_next = count;
    }

    /// Panics inside the next `count` mutating calls.
    pub fn panic_next(&self, count: u32) {
        self.script.lock().panic_next = count;
    }

    /// Permanently rejects mutations whose fields contain `field = value`.
    pub fn reject_when(&self, field: &str, value: FieldValue, message: impl Into<String>) {
        self.script
            .lock()
            .reject_values
            .push((field.to_string(), value, message.into()));
    }

    /// Permanently rejects mutations of one record.
    pub fn reject_record(&self, external_id: &str, message: impl Into<String>) {
        self.script
            .lock()
            .reject_ids
            .insert(external_id.to_string(), message.into());
    }

    /// Delays every call.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Mutations that reached the store (bulk counts once).
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Throttle signals sent.
    pub fn throttle_count(&self) -> u64 {
        self.throttled.load(Ordering::SeqCst)
    }

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.log.lock().clone()
    }

    async fn enter(&self, call: RemoteCall) -> RemoteResult<()> {
        let mutating = !matches!(call, RemoteCall::Fetch(_));
        let seq = {
            let mut log = self.log.lock();
            log.push(call);
            log.iter()
                .filter(|c| !matches!(c, RemoteCall::Fetch(_)))
                .count() as u64
        };

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !mutating {
            return Ok(());
        }

        let mut script = self.script.lock();
        if script.panic_next > 0 {
            script.panic_next -= 1;
            drop(script);
            panic!("scripted remote panic");
        }
        let every = script.throttle_every.is_some_and(|n| seq % n == 0);
        if script.throttle_next > 0 || every {
            script.throttle_next = script.throttle_next.saturating_sub(1);
            self.throttled.fetch_add(1, Ordering::SeqCst);
            return Err(RemoteError::Throttled {
                retry_after: script.throttle_retry_after,
            });
        }
        if script.transient_next > 0 {
            script.transient_next -= 1;
            return Err(RemoteError::Transient("scripted transient failure".into()));
        }
        Ok(())
    }

    fn rejection(&self, external_id: Option<&str>, fields: &FieldMap) -> Option<String> {
        let script = self.script.lock();
        if let Some(message) = external_id.and_then(|id| script.reject_ids.get(id)) {
            return Some(message.clone());
        }
        script
            .reject_values
            .iter()
            .find(|(field, value, _)| fields.get(field) == Some(value))
            .map(|(_, _, message)| message.clone())
    }

    fn store_update(&self, external_id: &str, fields: &FieldMap) -> RemoteResult<RemoteAck> {
        if let Some(message) = self.rejection(Some(external_id), fields) {
            return Err(RemoteError::Rejected(message));
        }
        let mut records = self.records.write();
        match records.get_mut(external_id) {
            Some(stored) => {
                *stored = fields.clone();
                Ok(RemoteAck::new(external_id))
            }
            None => Err(RemoteError::Rejected(format!(
                "record {external_id} does not exist"
            ))),
        }
    }
}

#[async_trait]
impl RemoteCatalog for MockCatalog {
    async fn create(&self, fields: &FieldMap) -> RemoteResult<RemoteAck> {
        self.enter(RemoteCall::Create).await?;
        if let Some(message) = self.rejection(None, fields) {
            return Err(RemoteError::Rejected(message));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let external_id = format!("gid://mock/Product/{n}");
        self.records
            .write()
            .insert(external_id.clone(), fields.clone());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteAck::new(external_id))
    }

    async fn update(&self, external_id: &str, fields: &FieldMap) -> RemoteResult<RemoteAck> {
        self.enter(RemoteCall::Update(external_id.to_string()))
            .await?;
        let ack = self.store_update(external_id, fields)?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(ack)
    }

    async fn delete(&self, external_id: &str) -> RemoteResult<()> {
        self.enter(RemoteCall::Delete(external_id.to_string()))
            .await?;
        if let Some(message) = self.rejection(Some(external_id), &FieldMap::new()) {
            return Err(RemoteError::Rejected(message));
        }
        if self.records.write().remove(external_id).is_none() {
            return Err(RemoteError::Rejected(format!(
                "record {external_id} does not exist"
            )));
        }
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn bulk_update(&self, items: &[BulkItem]) -> RemoteResult<Vec<RemoteResult<RemoteAck>>> {
        self.enter(RemoteCall::Bulk(items.len())).await?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(items
            .iter()
            .map(|item| self.store_update(&item.external_id, &item.fields))
            .collect())
    }

    async fn fetch(&self, external_id: &str) -> RemoteResult<Option<FieldMap>> {
        self.enter(RemoteCall::Fetch(external_id.to_string()))
            .await?;
        Ok(self.record(external_id))
    }

    fn rate_budget(&self) -> Option<RateBudget> {
        self.budget
    }
}
