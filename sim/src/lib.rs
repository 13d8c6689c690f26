//! Simulated host collaborators for TokenSmart end-to-end tests.
//!
//! Each fake implements exactly one `tokensmart-hal` trait and nothing
//! else, mirroring how a real host would wire up distinct subsystems
//! (perf-counter driver, load tracker, clock, cpufreq backend) behind the
//! same interfaces. Deterministic and `std`-based: this crate is test
//! tooling, never linked into the governor itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use tokensmart_hal::{CounterError, FrequencyActuator, LoadSampler, MonotonicClock, PerfCounterSource};

/// A manually-advanced monotonic clock.
#[derive(Debug, Default)]
pub struct SimClock(AtomicU64);

impl SimClock {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Advance the clock by `ns` nanoseconds.
    pub fn advance(&self, ns: u64) {
        self.0.fetch_add(ns, Ordering::Relaxed);
    }
}

impl MonotonicClock for SimClock {
    fn now_ns(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-CPU retired-instruction counters, driven by the test rather than a
/// real PMU. `set_instructions` is cumulative, matching the free-running
/// counter contract in `tokensmart-hal`.
#[derive(Debug, Default)]
pub struct SimCounters {
    instructions: Mutex<HashMap<u32, u64>>,
    attached: Mutex<HashMap<u32, bool>>,
    /// CPUs configured to fail every read, exercising the degrade-to-zero
    /// path (spec §7).
    pub fail_cpus: Mutex<std::collections::HashSet<u32>>,
}

impl SimCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_instructions(&self, cpu: u32, value: u64) {
        self.instructions.lock().unwrap().insert(cpu, value);
    }

    pub fn add_instructions(&self, cpu: u32, delta: u64) {
        let mut map = self.instructions.lock().unwrap();
        *map.entry(cpu).or_insert(0) += delta;
    }
}

impl PerfCounterSource for SimCounters {
    fn init(&self, cpu: u32) -> Result<(), CounterError> {
        self.attached.lock().unwrap().insert(cpu, true);
        self.instructions.lock().unwrap().entry(cpu).or_insert(0);
        Ok(())
    }

    fn enable(&self, _cpu: u32) -> Result<(), CounterError> {
        Ok(())
    }

    fn read(&self, cpu: u32) -> Result<u64, CounterError> {
        if self.fail_cpus.lock().unwrap().contains(&cpu) {
            return Err(CounterError::NotAttached(cpu));
        }
        self.instructions
            .lock()
            .unwrap()
            .get(&cpu)
            .copied()
            .ok_or(CounterError::NotAttached(cpu))
    }

    fn release(&self, cpus: &[u32]) {
        let mut attached = self.attached.lock().unwrap();
        for cpu in cpus {
            attached.remove(cpu);
        }
    }
}

/// Per-CPU load, `[0, 100]`, set directly by the test.
#[derive(Debug, Default)]
pub struct SimLoad(Mutex<HashMap<u32, u8>>);

impl SimLoad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_load(&self, cpu: u32, load: u8) {
        self.0.lock().unwrap().insert(cpu, load);
    }
}

impl LoadSampler for SimLoad {
    fn load(&self, cpu: u32) -> u8 {
        self.0.lock().unwrap().get(&cpu).copied().unwrap_or(0)
    }
}

/// Records the most recent actuation per CPU.
#[derive(Debug, Default)]
pub struct SimActuator(Mutex<HashMap<u32, u32>>);

impl SimActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn freq_of(&self, cpu: u32) -> Option<u32> {
        self.0.lock().unwrap().get(&cpu).copied()
    }
}

impl FrequencyActuator for SimActuator {
    fn actuate(&self, cpu: u32, freq_khz: u32) {
        self.0.lock().unwrap().insert(cpu, freq_khz);
    }
}

/// A tiny deterministic LCG, used instead of an external RNG crate to keep
/// property tests reproducible without a new dependency.
pub struct DeterministicSequence(AtomicU32);

impl DeterministicSequence {
    pub fn new(seed: u32) -> Self {
        Self(AtomicU32::new(seed | 1))
    }

    /// Next pseudo-random value in `[0, bound)`.
    pub fn next(&self, bound: u32) -> u32 {
        let mut x = self.0.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0.store(x, Ordering::Relaxed);
        x % bound.max(1)
    }
}
