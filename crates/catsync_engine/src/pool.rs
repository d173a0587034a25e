//! Worker pool supervision.
//!
//! [`PoolSupervisor`] is the only owner of the pool's size. All of its
//! state lives in atomics: workers report in and out, the sampler asks for
//! a [`ScaleDecision`], and a scale-down is a retire request that the next
//! idle worker claims.

use crate::config::PoolConfig;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// One load reading, each value in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadSample {
    /// CPU utilisation.
    pub cpu_load: f64,
    /// Memory pressure.
    pub memory_pressure: f64,
}

/// Source of host load readings.
pub trait LoadProbe: Send + Sync + 'static {
    /// Takes a reading. Must not block.
    fn sample(&self) -> LoadSample;
}

/// A probe that always reports the same reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticLoad(pub LoadSample);

impl LoadProbe for StaticLoad {
    fn sample(&self) -> LoadSample {
        self.0
    }
}

/// A probe whose reading can be changed at runtime.
#[derive(Debug, Default)]
pub struct ManualLoad {
    cpu_bits: AtomicU64,
    memory_bits: AtomicU64,
}

impl ManualLoad {
    /// Creates a probe reporting zero load.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the CPU reading.
    pub fn set_cpu(&self, load: f64) {
        self.cpu_bits.store(load.to_bits(), Ordering::SeqCst);
    }

    /// Sets the memory reading.
    pub fn set_memory(&self, pressure: f64) {
        self.memory_bits.store(pressure.to_bits(), Ordering::SeqCst);
    }
}

impl LoadProbe for ManualLoad {
    fn sample(&self) -> LoadSample {
        LoadSample {
            cpu_load: f64::from_bits(self.cpu_bits.load(Ordering::SeqCst)),
            memory_pressure: f64::from_bits(self.memory_bits.load(Ordering::SeqCst)),
        }
    }
}

/// What the sampler should do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Start one more worker.
    Up,
    /// Retire one worker.
    Down,
    /// Leave the pool alone.
    Hold,
}

/// Worker accounting.
#[derive(Debug)]
pub struct PoolSupervisor {
    config: PoolConfig,
    active: AtomicUsize,
    retire_requests: AtomicUsize,
    next_worker_id: AtomicU64,
}

impl PoolSupervisor {
    /// Creates a supervisor with no running workers.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            active: AtomicUsize::new(0),
            retire_requests: AtomicUsize::new(0),
            next_worker_id: AtomicU64::new(1),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Workers currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Running workers minus those asked to retire.
    pub fn effective(&self) -> usize {
        self.active()
            .saturating_sub(self.retire_requests.load(Ordering::SeqCst))
    }

    /// Registers a starting worker and returns its id.
    pub fn worker_started(&self) -> u64 {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.next_worker_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers a worker that stopped on its own (shutdown).
    pub fn worker_stopped(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Decides how to resize the pool.
    pub fn decide(&self, ready_batches: usize, sample: LoadSample) -> ScaleDecision {
        let workers = self.effective();
        if sample.memory_pressure > self.config.memory_ceiling && workers > self.config.min_workers
        {
            return ScaleDecision::Down;
        }
        if workers < self.config.min_workers {
            return ScaleDecision::Up;
        }
        let backlog = workers * self.config.scale_up_queue_per_worker.max(1);
        if ready_batches > backlog
            && sample.cpu_load < self.config.load_threshold
            && workers < self.config.max_workers
        {
            return ScaleDecision::Up;
        }
        ScaleDecision::Hold
    }

    /// Asks one worker to retire. Refused at the lower bound.
    pub fn request_retire(&self) -> bool {
        loop {
            let requests = self.retire_requests.load(Ordering::SeqCst);
            if self.active().saturating_sub(requests) <= self.config.min_workers {
                return false;
            }
            if self
                .retire_requests
                .compare_exchange(requests, requests + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Claims a pending retire request. The caller must exit if this
    /// returns true; it has already been counted out.
    pub fn try_retire(&self) -> bool {
        loop {
            let requests = self.retire_requests.load(Ordering::SeqCst);
            if requests == 0 {
                return false;
            }
            if self
                .retire_requests
                .compare_exchange(requests, requests - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.active.fetch_sub(1, Ordering::SeqCst);
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn supervisor(min: usize, max: usize) -> PoolSupervisor {
        PoolSupervisor::new(PoolConfig::default().with_workers(min, max))
    }

    fn load(cpu: f64, memory: f64) -> LoadSample {
        LoadSample {
            cpu_load: cpu,
            memory_pressure: memory,
        }
    }

    #[test]
    fn scales_up_on_backlog_when_cpu_allows() {
        let pool = supervisor(1, 3);
        pool.worker_started();

        assert_eq!(pool.decide(2, load(0.1, 0.1)), ScaleDecision::Hold);
        assert_eq!(pool.decide(3, load(0.1, 0.1)), ScaleDecision::Up);
        assert_eq!(pool.decide(3, load(0.95, 0.1)), ScaleDecision::Hold);

        pool.worker_started();
        pool.worker_started();
        assert_eq!(pool.decide(100, load(0.1, 0.1)), ScaleDecision::Hold);
    }

    #[test]
    fn scales_down_under_memory_pressure_to_the_floor() {
        let pool = supervisor(1, 4);
        pool.worker_started();
        pool.worker_started();

        assert_eq!(pool.decide(0, load(0.1, 0.9)), ScaleDecision::Down);
        assert!(pool.request_retire());
        assert_eq!(pool.effective(), 1);
        assert_eq!(pool.decide(0, load(0.1, 0.9)), ScaleDecision::Hold);
        assert!(!pool.request_retire());

        assert!(pool.try_retire());
        assert!(!pool.try_retire());
        assert_eq!(pool.active(), 1);
    }

    #[test]
    fn below_floor_scales_up() {
        let pool = supervisor(2, 4);
        assert_eq!(pool.decide(0, LoadSample::default()), ScaleDecision::Up);
    }

    #[test]
    fn retire_claims_are_exclusive() {
        let pool = Arc::new(supervisor(1, 16));
        for _ in 0..9 {
            pool.worker_started();
        }
        for _ in 0..4 {
            assert!(pool.request_retire());
        }

        let handles: Vec<_> = (0..9)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.try_retire())
            })
            .collect();
        let retired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| *r)
            .count();
        assert_eq!(retired, 4);
        assert_eq!(pool.active(), 5);
    }

    #[test]
    fn manual_probe_reports_latest_values() {
        let probe = ManualLoad::new();
        probe.set_cpu(0.5);
        probe.set_memory(0.75);
        assert_eq!(probe.sample(), load(0.5, 0.75));
    }
}
