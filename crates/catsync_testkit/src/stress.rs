//! Contention helpers.
//!
//! These race many threads against one entity or one change so tests can
//! check that exactly one caller wins.

use crate::fixtures::{price, TestHarness, REVIEWER};
use catsync_core::{ChangeId, EntityId};
use catsync_engine::{StageRequest, SyncError};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of a race between threads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentionResult {
    /// Calls that succeeded.
    pub winners: usize,
    /// Calls refused with a conflict or a lost compare-and-set.
    pub losers: usize,
    /// Calls that failed any other way.
    pub errors: Vec<String>,
}

impl ContentionResult {
    fn record(&mut self, outcome: Result<bool, SyncError>) {
        match outcome {
            Ok(true) => self.winners += 1,
            Ok(false) => self.losers += 1,
            Err(err) => self.errors.push(err.to_string()),
        }
    }
}

fn race<F>(threads: usize, call: F) -> ContentionResult
where
    F: Fn(usize) -> Result<bool, SyncError> + Send + Sync + 'static,
{
    let call = Arc::new(call);
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|n| {
            let call = Arc::clone(&call);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                call(n)
            })
        })
        .collect();

    let mut result = ContentionResult::default();
    for handle in handles {
        result.record(handle.join().expect("racing thread panicked"));
    }
    result
}

fn lost(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::Core(catsync_core::CoreError::Conflict { .. })
            | SyncError::Core(catsync_core::CoreError::InvalidTransition { .. })
    )
}

/// Races `threads` stagers, each proposing a different price.
pub fn race_stage(harness: &TestHarness, entity_id: EntityId, threads: usize) -> ContentionResult {
    let engine = harness.engine.clone();
    race(threads, move |n| {
        let request = StageRequest::update(entity_id, price(100.0 + n as f64));
        match engine.stage(request) {
            Ok(staged) => Ok(staged.is_some()),
            Err(err) if lost(&err) => Ok(false),
            Err(err) => Err(err),
        }
    })
}

/// Races `threads` reviewers approving the same change.
pub fn race_approve(
    harness: &TestHarness,
    change_id: ChangeId,
    threads: usize,
) -> ContentionResult {
    let engine = harness.engine.clone();
    race(threads, move |n| {
        match engine.approve(change_id, &format!("{REVIEWER}-{n}")) {
            Ok(_) => Ok(true),
            Err(err) if lost(&err) => Ok(false),
            Err(err) => Err(err),
        }
    })
}

/// Throughput of a staging run.
#[derive(Debug, Clone)]
pub struct StagingRun {
    /// Changes staged.
    pub staged: usize,
    /// Wall time.
    pub duration: Duration,
}

impl StagingRun {
    /// Changes per second.
    pub fn per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.staged as f64 / secs
        } else {
            0.0
        }
    }
}

/// Seeds `count` products and stages and approves a price change for each.
pub fn stage_many(harness: &TestHarness, count: usize) -> StagingRun {
    let ids = harness.seed_products(count, 10.0);
    let start = Instant::now();
    for id in &ids {
        harness.stage_and_approve(*id, price(11.0));
    }
    StagingRun {
        staged: ids.len(),
        duration: start.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_stager_wins() {
        let harness = TestHarness::new();
        let mug = harness.seed_product("MUG", 10.0);
        let result = race_stage(&harness, mug, 8);
        assert_eq!(result.winners, 1);
        assert_eq!(result.losers, 7);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn one_reviewer_wins() {
        let harness = TestHarness::new();
        let mug = harness.seed_product("MUG", 10.0);
        let change = harness.stage(mug, price(12.0));
        let result = race_approve(&harness, change, 8);
        assert_eq!(result.winners, 1);
        assert_eq!(result.losers, 7);
    }

    #[test]
    fn staging_run_counts() {
        let harness = TestHarness::new();
        let run = stage_many(&harness, 20);
        assert_eq!(run.staged, 20);
        let depth = harness.engine.get_metrics().queue_depth_by_priority;
        assert_eq!(depth.values().sum::<usize>(), 20);
    }
}
