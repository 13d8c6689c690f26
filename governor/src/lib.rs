//! # TokenSmart Tick Orchestration & Host Governor Contract (C6)
//!
//! Wires the pure-logic `tokensmart-core` decision core to the host
//! collaborator traits in `tokensmart-hal` and the topology built by
//! `tokensmart-topology`. This crate owns the five-callback host governor
//! contract (spec §6): `alloc`, `free`, `init`, `exit`, `start`, and
//! `gov_dbs_update` (the tick itself, named [`TokenSmartGovernor::tick`]
//! here since "gov_dbs_update" is the host framework's vocabulary, not
//! ours).
//!
//! The tick runs four ordered phases per spec §4.4, admission through ring
//! advance, with no suspension point and two short, uncontended critical
//! sections (the per-FD state mutex and the pool's internal admin mutex).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;

use spin::Mutex;

use tokensmart_core::{FdState, Tunables, TokenPool};
use tokensmart_hal::{FrequencyActuator, LoadSampler, MonotonicClock, PerfCounterSource, StartupBarrier};
pub use tokensmart_topology::TopologyError;
use tokensmart_topology::{HostPolicy, Topology, TopologyPolicy};

/// Next-invocation delay returned by every tick, per spec §6.
const TICK_DELAY_US: u32 = 8_000;

/// Initial undistributed pool, per spec §6 `init`.
const INITIAL_POOL: u32 = 500;

/// Per-policy scratch allocated by the host's `alloc()` callback.
#[derive(Debug, Default)]
pub struct PolicyState {
    cpus: Vec<u32>,
    counter_attached: bool,
}

/// Global, built-once governor state released through the startup barrier.
struct GovernorState {
    topology: Topology,
    tunables: Tunables,
    pool: TokenPool,
    fds: Vec<Mutex<FdState>>,
}

/// Map a token count to an absolute frequency in the FD's `[min_f, max_f]`
/// range (spec §3: `min_f + my_tokens*(max_f-min_f)/100`).
fn freq_for(min_khz: u32, max_khz: u32, tokens: u32) -> u32 {
    min_khz + tokens * (max_khz - min_khz) / 100
}

/// The TokenSmart governor: ties one set of host collaborators to one
/// built topology for the lifetime of the module.
pub struct TokenSmartGovernor<'a> {
    perf: &'a dyn PerfCounterSource,
    clock: &'a dyn MonotonicClock,
    load: &'a dyn LoadSampler,
    actuator: &'a dyn FrequencyActuator,
    min_freq_khz: u32,
    max_freq_khz: u32,
    state: StartupBarrier<GovernorState>,
}

impl<'a> TokenSmartGovernor<'a> {
    /// Construct an unstarted governor. `init()`/`start()` must run before
    /// any CPU's first tick.
    pub fn new(
        perf: &'a dyn PerfCounterSource,
        clock: &'a dyn MonotonicClock,
        load: &'a dyn LoadSampler,
        actuator: &'a dyn FrequencyActuator,
        min_freq_khz: u32,
        max_freq_khz: u32,
    ) -> Self {
        Self {
            perf,
            clock,
            load,
            actuator,
            min_freq_khz,
            max_freq_khz,
            state: StartupBarrier::new(),
        }
    }

    /// Host `alloc()`: scratch for one policy, empty until `start` attaches
    /// its CPUs.
    pub fn alloc(&self) -> PolicyState {
        PolicyState::default()
    }

    /// Host `free(PolicyState)`: release any attached perf counters.
    pub fn free(&self, state: PolicyState) {
        if state.counter_attached {
            self.perf.release(&state.cpus);
        }
    }

    /// Host `init(DbsData)`: no global construction happens here — `pool`
    /// starts at [`INITIAL_POOL`] and the barrier starts unreleased, both
    /// implicit in [`TokenSmartGovernor::new`]. Kept as an explicit,
    /// fallible entry point to match the host contract's five callbacks.
    pub fn init(&self) -> Result<(), TopologyError> {
        Ok(())
    }

    /// Host `exit(DbsData)`: nothing to release explicitly; topology and
    /// per-FD state are dropped with the governor itself.
    pub fn exit(&self) {}

    /// Host `start(Policy)`, CPU-0 half: enumerate `host_policies` into a
    /// topology via `topology_policy`, derive `fair_tokens`, and release
    /// the startup barrier. Every other CPU's first tick blocks on this.
    ///
    /// Idempotent: a second call observes the barrier already released and
    /// returns `Ok(())` without rebuilding anything.
    pub fn start(
        &self,
        host_policies: &[HostPolicy],
        topology_policy: &dyn TopologyPolicy,
    ) -> Result<(), TopologyError> {
        if self.state.is_ready() {
            return Ok(());
        }
        let topology = topology_policy.build(host_policies)?;
        let tunables = Tunables::default_scenario();
        let nr_active_fds = topology.nr_active_fds();
        let pool = TokenPool::new(INITIAL_POOL, nr_active_fds);
        let drop_threshold = tunables.drop_threshold;
        let fds = (0..topology.nr_fds())
            .map(|_| Mutex::new(FdState::new(topology.cpus_per_fd(), drop_threshold)))
            .collect();
        self.state.build(|| GovernorState {
            topology,
            tunables,
            pool,
            fds,
        });
        Ok(())
    }

    /// `start(Policy)`, per-policy half: attach and enable a perf counter
    /// for every CPU in this policy. Failures are logged and degrade to
    /// "no MIPS update" for that CPU (spec §7) rather than failing `start`.
    pub fn attach_counters(&self, policy_state: &mut PolicyState, cpus: &[u32]) {
        policy_state.cpus = cpus.to_vec();
        let mut all_ok = true;
        for &cpu in cpus {
            if self.perf.init(cpu).is_err() || self.perf.enable(cpu).is_err() {
                log::warn!("tokensmart: perf counter unavailable for cpu {cpu}");
                all_ok = false;
            }
        }
        policy_state.counter_attached = all_ok;
    }

    fn state(&self) -> &GovernorState {
        self.state.wait()
    }

    /// The shared token pool, for the admin surface and test harnesses.
    /// Panics (via the barrier spin-wait) if called before `start`.
    pub fn pool(&self) -> &TokenPool {
        &self.state().pool
    }

    /// The mutable tunables, for the admin surface's `mips_threshold`
    /// attribute.
    pub fn tunables(&self) -> &Tunables {
        &self.state().tunables
    }

    /// The built topology, for diagnostics and test harnesses.
    pub fn topology(&self) -> &Topology {
        &self.state().topology
    }

    /// Snapshot of `my_tokens` for one FD, for test harnesses and
    /// diagnostics. Takes the per-FD lock briefly.
    pub fn fd_tokens(&self, fd: u32) -> u32 {
        self.state().fds[fd as usize].lock().my_tokens
    }

    /// Host `gov_dbs_update(Policy)`: the tick. Runs on `cpu`; returns the
    /// next desired invocation delay in microseconds.
    ///
    /// Phases, in order (spec §4.4): admission (exceptional/non-representative
    /// short-circuit, IPS Meter refresh, the MIPS-not-updated gate, the turn
    /// check), heuristics and transaction (delegated to
    /// [`FdState::transact`]), and ring advance plus actuation.
    pub fn tick(&self, cpu: u32) -> u32 {
        let state = self.state();
        let topo = &state.topology;

        // Phase A.1
        if topo.exceptional(cpu) {
            self.actuator.actuate(cpu, self.max_freq_khz);
            return TICK_DELAY_US;
        }

        let representative = topo.first_cpu_of(cpu);
        // Phase A.2
        if cpu != representative {
            self.actuator.actuate(cpu, self.min_freq_khz);
            return TICK_DELAY_US;
        }

        let fd = topo.fd_of(cpu);
        let mut fd_state = state.fds[fd as usize].lock();
        let now_ns = self.clock.now_ns();

        // Phase A.3: refresh the IPS Meter for every CPU of this FD. `tid`
        // is derived per iteration, never hoisted, per spec §9(i).
        let mut any_updated = false;
        for (tid, &member_cpu) in topo.cpus_of_fd(fd).iter().enumerate() {
            if let Ok(instructions) = self.perf.read(member_cpu) {
                if fd_state.observe_cpu(tid, instructions, now_ns, &state.tunables) {
                    any_updated = true;
                }
            }
            fd_state.set_load(tid, self.load.load(member_cpu));
        }
        fd_state.recompute_policy_mips();
        let aggregated_load = fd_state.aggregate_load();

        // Phase A.4: do not actuate speculatively ahead of a fresh reading.
        if !any_updated && u32::from(aggregated_load) >= fd_state.my_tokens {
            return TICK_DELAY_US;
        }

        // Phase A.5: not our slot this tick.
        if state.pool.turn() != fd {
            return TICK_DELAY_US;
        }

        // Phases B + C.
        fd_state.transact(aggregated_load, &state.pool, &state.tunables);

        // Phase D.
        state.pool.set_turn(topo.next_in_ring(fd));
        let freq = freq_for(self.min_freq_khz, self.max_freq_khz, fd_state.my_tokens);
        self.actuator.actuate(cpu, freq);

        TICK_DELAY_US
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use tokensmart_hal::CounterError;
    use tokensmart_topology::GenericTopology;

    struct FixedClock(AtomicU64);
    impl MonotonicClock for FixedClock {
        fn now_ns(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    struct ZeroCounters;
    impl PerfCounterSource for ZeroCounters {
        fn init(&self, _cpu: u32) -> Result<(), CounterError> {
            Ok(())
        }
        fn enable(&self, _cpu: u32) -> Result<(), CounterError> {
            Ok(())
        }
        fn read(&self, _cpu: u32) -> Result<u64, CounterError> {
            Ok(0)
        }
        fn release(&self, _cpus: &[u32]) {}
    }

    struct ZeroLoad;
    impl LoadSampler for ZeroLoad {
        fn load(&self, _cpu: u32) -> u8 {
            0
        }
    }

    #[derive(Default)]
    struct LastActuation {
        cpu: AtomicU32,
        freq: AtomicU32,
    }
    impl FrequencyActuator for LastActuation {
        fn actuate(&self, cpu: u32, freq_khz: u32) {
            self.cpu.store(cpu, Ordering::Relaxed);
            self.freq.store(freq_khz, Ordering::Relaxed);
        }
    }

    fn policies_12x4() -> Vec<HostPolicy> {
        (0..12).map(|i| HostPolicy::range(i * 4, 4)).collect()
    }

    #[test]
    fn idle_system_settles_every_representative_at_min_freq() {
        let perf = ZeroCounters;
        let clock = FixedClock(AtomicU64::new(0));
        let load = ZeroLoad;
        let actuator = LastActuation::default();
        let gov = TokenSmartGovernor::new(&perf, &clock, &load, &actuator, 2_166_000, 3_800_000);

        gov.start(&policies_12x4(), &GenericTopology).unwrap();

        // First tick never updates MIPS (no prior sample) so Phase A.4 gates
        // it; feed one lap of ticks spaced past the MIPS_PERIOD gate.
        for lap in 0..2 {
            clock.0.store((lap + 1) * 200_000_000, Ordering::Relaxed);
            for fd in 0..12u32 {
                gov.tick(fd * 4);
            }
        }

        assert_eq!(actuator.freq.load(Ordering::Relaxed), 2_166_000);
    }

    #[test]
    fn non_representative_cpu_parks_at_min_freq() {
        let perf = ZeroCounters;
        let clock = FixedClock(AtomicU64::new(0));
        let load = ZeroLoad;
        let actuator = LastActuation::default();
        let gov = TokenSmartGovernor::new(&perf, &clock, &load, &actuator, 2_166_000, 3_800_000);
        gov.start(&policies_12x4(), &GenericTopology).unwrap();

        gov.tick(1); // cpu 1 of fd 0, not the representative (cpu 0)
        assert_eq!(actuator.freq.load(Ordering::Relaxed), 2_166_000);
        assert_eq!(actuator.cpu.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn start_is_idempotent() {
        let perf = ZeroCounters;
        let clock = FixedClock(AtomicU64::new(0));
        let load = ZeroLoad;
        let actuator = LastActuation::default();
        let gov = TokenSmartGovernor::new(&perf, &clock, &load, &actuator, 2_166_000, 3_800_000);
        gov.start(&policies_12x4(), &GenericTopology).unwrap();
        gov.start(&policies_12x4(), &GenericTopology).unwrap();
        assert_eq!(gov.state().topology.nr_fds(), 12);
    }
}
