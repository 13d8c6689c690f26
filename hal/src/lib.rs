//! # TokenSmart Host Collaborator Interfaces
//!
//! TokenSmart never talks to hardware directly. Everything the governor
//! needs from the surrounding kernel — retired-instruction counts, a
//! monotonic clock, per-policy load samples, and a way to actually change
//! a frequency domain's operating point — is named here as a trait. The
//! host implements these; `tokensmart-core` and `tokensmart-governor` only
//! ever see the trait objects.
//!
//! ## Why traits and not a concrete struct
//!
//! The decision core (`tokensmart-core`) must be testable without a real
//! CPU, a real `rdmsr`, or a real tick dispatcher. Every collaborator named
//! in the governor's out-of-scope list gets its own trait so a test harness
//! (`tokensmart-sim`) can supply a deterministic fake for each.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Once;

/// Error returned by a perf-counter attach/read failure.
///
/// Per the governor's error-handling policy this is never fatal: a failed
/// read degrades to "no update" for that CPU, which in turn makes the
/// frequency-sensitivity heuristic treat the workload as insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterError {
    /// The host failed to attach a counter to this CPU.
    InitFailed(u32),
    /// A read was attempted on a CPU with no attached counter.
    NotAttached(u32),
}

/// Per-CPU retired-instruction counter, as exposed by the host's
/// performance-monitoring-unit driver.
///
/// One instance is shared by every CPU the host schedules TokenSmart on;
/// implementations are expected to be cheap to call from the tick path and
/// must not block.
pub trait PerfCounterSource: Send + Sync {
    /// Attach a counter to `cpu`. Idempotent.
    fn init(&self, cpu: u32) -> Result<(), CounterError>;

    /// Enable counting on `cpu`. Must be called after `init`.
    fn enable(&self, cpu: u32) -> Result<(), CounterError>;

    /// Read the current retired-instruction count for `cpu`.
    ///
    /// The value is a free-running counter; callers compute deltas.
    fn read(&self, cpu: u32) -> Result<u64, CounterError>;

    /// Release counters for every CPU in `cpus`, e.g. on module unload.
    fn release(&self, cpus: &[u32]);
}

/// Monotonic nanosecond time source (an `mftb`-equivalent).
///
/// Must never go backwards. TokenSmart only ever computes deltas between
/// two readings, never an absolute wall-clock value.
pub trait MonotonicClock: Send + Sync {
    /// Current time in nanoseconds since an arbitrary epoch.
    fn now_ns(&self) -> u64;
}

/// Per-policy CPU load, `[0, 100]`, as sampled by the host's load tracker.
///
/// "Policy" mirrors the host governor framework's unit (it may be finer
/// than a frequency domain; `tokensmart-core`'s load view aggregates every
/// policy within an FD with `max_of`).
pub trait LoadSampler: Send + Sync {
    /// Latest load sample for `cpu`'s policy, in `[0, 100]`.
    fn load(&self, cpu: u32) -> u8;
}

/// The single host call that actually changes a frequency domain's
/// operating point.
pub trait FrequencyActuator: Send + Sync {
    /// Request that the FD containing `cpu` run at `freq_khz`.
    ///
    /// The host is free to round to the nearest supported P-state; this is
    /// a request, not a guarantee of the exact value taking effect.
    fn actuate(&self, cpu: u32, freq_khz: u32);
}

/// One-shot startup barrier.
///
/// Per spec: CPU 0 performs all one-time construction (topology, per-FD
/// state, `fair_tokens`) and then releases the barrier; every other CPU's
/// first tick waits on it. Modelled as a `spin::Once` guarding the payload
/// plus an `AtomicBool` so a non-building CPU can busy-poll-free check
/// readiness without touching the `Once` machinery on the hot path.
pub struct StartupBarrier<T> {
    ready: AtomicBool,
    payload: Once<T>,
}

impl<T> StartupBarrier<T> {
    /// Create an unreleased barrier.
    pub const fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            payload: Once::new(),
        }
    }

    /// CPU 0 calls this exactly once: build the payload and release the
    /// barrier. Subsequent calls are no-ops and return the first result.
    pub fn build(&self, f: impl FnOnce() -> T) -> &T {
        let value = self.payload.call_once(f);
        self.ready.store(true, Ordering::Release);
        value
    }

    /// Non-blocking readiness check for the hot path.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Spin until the barrier is released, then return the payload.
    ///
    /// Only ever called from a tick context before the first transaction;
    /// never called from the CPU that calls `build`.
    pub fn wait(&self) -> &T {
        while !self.is_ready() {
            core::hint::spin_loop();
        }
        self.payload
            .get()
            .expect("barrier marked ready before payload was stored")
    }
}

impl<T> Default for StartupBarrier<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    #[test]
    fn barrier_builds_once() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let barrier: StartupBarrier<u32> = StartupBarrier::new();
        assert!(!barrier.is_ready());

        let v1 = *barrier.build(|| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            42
        });
        let v2 = *barrier.build(|| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            99
        });

        assert_eq!(v1, 42);
        assert_eq!(v2, 42);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert!(barrier.is_ready());
        assert_eq!(*barrier.wait(), 42);
    }
}
