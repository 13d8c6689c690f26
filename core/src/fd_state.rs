//! Per-FD State and FD Controller (C4).
//!
//! [`FdState`] is the data-model entity from spec §3, lifetime module-load
//! to module-unload. [`FdState::transact`] runs Phases B and C of the tick
//! described in spec §4.4: the frequency-sensitivity heuristic, collapse
//! detection, and the donate/accept transaction against the shared
//! [`TokenPool`]. Phase A (admission: exceptional check, representative
//! check, the MIPS-gate early return, the turn check) and Phase D (ring
//! advance, actuation) live in `tokensmart-governor`'s tick handler, since
//! they need topology and the host actuator — this struct only needs
//! integers and the pool.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::Tunables;
use crate::ips_meter::CpuIpsState;
use crate::token_pool::{Mode, TokenPool};

bitflags! {
    /// Transient per-FD flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdFlags: u8 {
        /// Set when the previous tick accepted tokens and the next
        /// transaction must confirm the workload actually sped up.
        const TAKING_TOKEN  = 0b0000_0001;
        /// Set when this FD is the one that pushed the pool into FAIR
        /// mode and has not yet been satisfied.
        const SET_FAIR_MODE = 0b0000_0010;
    }
}

/// Diagnostic counters, additive to the core protocol (spec §10.7),
/// exposed read-only through the admin surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct FdStats {
    /// Phase C donate-branch transactions.
    pub donates: u64,
    /// Phase C accept-branch transactions that actually received tokens.
    pub accepts: u64,
    /// Ring visits where the pool was empty on an accept attempt.
    pub starvation_ticks: u64,
    /// Times this FD pushed the pool into FAIR mode.
    pub fair_mode_entries: u64,
    /// Times the frequency-sensitivity test forced a donation.
    pub regret_rollbacks: u64,
    /// Times collapse detection forced a full relinquish.
    pub collapses: u64,
    /// Times the FAIR-mode cap clawed back tokens on this FD's turn.
    pub fairness_caps: u64,
}

/// Per-FD state, one instance per frequency domain, for the lifetime of
/// the module.
pub struct FdState {
    /// Tokens currently held, in `[0, 100]`.
    pub my_tokens: u32,
    /// Tokens acquired on the most recent accept; zero after a donate.
    pub last_ramp_up: u32,
    /// Consecutive ring visits where tokens were wanted but the pool was
    /// empty.
    pub starvation: u32,
    /// Down-counter; reaching zero forces a full token release.
    pub drop_threshold: u32,
    /// MIPS captured the tick an accept happened.
    pub mips_when_boosted: u32,
    /// Previous tick's `policy_mips`, for collapse detection.
    pub last_policy_mips: u32,
    /// This tick's aggregated MIPS across the FD's CPUs.
    pub policy_mips: u32,
    flags: FdFlags,
    per_cpu: Vec<CpuIpsState>,
    load: Vec<u8>,
    stats: FdStats,
}

impl FdState {
    /// A freshly reset FD, sized for `cpus_per_fd` CPUs.
    pub fn new(cpus_per_fd: usize, drop_threshold: u32) -> Self {
        Self {
            my_tokens: 0,
            last_ramp_up: 0,
            starvation: 0,
            drop_threshold,
            mips_when_boosted: 0,
            last_policy_mips: 0,
            policy_mips: 0,
            flags: FdFlags::empty(),
            per_cpu: alloc::vec![CpuIpsState::new(); cpus_per_fd],
            load: alloc::vec![0u8; cpus_per_fd],
            stats: FdStats::default(),
        }
    }

    /// Diagnostic counters for this FD.
    pub fn stats(&self) -> FdStats {
        self.stats
    }

    /// Whether the previous accept is still on probation.
    pub fn taking_token(&self) -> bool {
        self.flags.contains(FdFlags::TAKING_TOKEN)
    }

    /// Whether this FD triggered FAIR mode and is still waiting to be
    /// satisfied.
    pub fn set_fair_mode(&self) -> bool {
        self.flags.contains(FdFlags::SET_FAIR_MODE)
    }

    /// Feed one CPU's retired-instruction delta into this FD's IPS Meter.
    ///
    /// `tid` must be this CPU's position within the FD (spec §9(i): the
    /// corrected per-iteration derivation, not a `tid` hoisted out of a
    /// loop). Returns whether the EWMA actually updated.
    pub fn observe_cpu(
        &mut self,
        tid: usize,
        instructions: u64,
        now_ns: u64,
        tunables: &Tunables,
    ) -> bool {
        self.per_cpu[tid].sample(instructions, now_ns, tunables)
    }

    /// Record a load sample for the policy at position `tid` within the FD.
    pub fn set_load(&mut self, tid: usize, load: u8) {
        self.load[tid] = load;
    }

    /// Aggregate this FD's per-policy load samples (C3).
    pub fn aggregate_load(&self) -> u8 {
        crate::load_view::aggregate(&self.load)
    }

    /// Recompute `policy_mips` as the max EWMA across this FD's CPUs (C2).
    pub fn recompute_policy_mips(&mut self) -> u32 {
        self.policy_mips = self.per_cpu.iter().map(|c| c.cpu_mips).max().unwrap_or(0);
        self.policy_mips
    }

    /// Phases B and C of the tick: frequency-sensitivity test, collapse
    /// detection, and the donate/accept transaction against `pool`.
    ///
    /// `aggregated_load` seeds `required_tokens` (spec §4.4, preamble).
    pub fn transact(&mut self, aggregated_load: u8, pool: &TokenPool, tunables: &Tunables) {
        let mut required_tokens = u32::from(aggregated_load);

        // Phase B.6: frequency-sensitivity test.
        if self.flags.contains(FdFlags::TAKING_TOKEN) {
            let expected_mips = self.mips_when_boosted
                + tunables.ipc_threshold() * self.last_ramp_up * 95 / 100;
            if self.policy_mips <= expected_mips {
                required_tokens = self.my_tokens.saturating_sub(1);
                self.stats.regret_rollbacks += 1;
            }
            self.flags.remove(FdFlags::TAKING_TOKEN);
        }

        // Phase B.7: collapse detection. `mips_drop_margin_pct` is >100 so
        // this only trips on a genuine drop, not a flat reading; see
        // DESIGN.md's collapse-margin note.
        if self.policy_mips * tunables.mips_drop_margin_pct / 100 < self.last_policy_mips {
            self.drop_threshold = self.drop_threshold.saturating_sub(1);
            if self.drop_threshold == 0 {
                required_tokens = 0;
                self.stats.collapses += 1;
            }
        } else {
            self.drop_threshold = tunables.drop_threshold;
        }
        // Phase B.8.
        self.last_policy_mips = self.policy_mips;

        // Phase C.
        if required_tokens <= self.my_tokens {
            self.donate(required_tokens, pool);
        } else {
            self.accept(required_tokens, pool, tunables);
        }

        // Phase C step 11: fairness cap, applies after either branch.
        if pool.mode() == Mode::Fair && self.my_tokens > pool.fair_tokens() {
            let give_back = self.my_tokens - pool.fair_tokens();
            pool.donate(give_back);
            self.my_tokens -= give_back;
            self.stats.fairness_caps += 1;
        }
    }

    fn donate(&mut self, required_tokens: u32, pool: &TokenPool) {
        let surplus = self.my_tokens - required_tokens;
        pool.donate(surplus);
        self.my_tokens = required_tokens;
        self.last_ramp_up = 0;
        self.flags.remove(FdFlags::TAKING_TOKEN);
        self.stats.donates += 1;
    }

    fn accept(&mut self, required_tokens: u32, pool: &TokenPool, tunables: &Tunables) {
        let doubled = if self.last_ramp_up == 0 {
            1
        } else {
            self.last_ramp_up.saturating_mul(2)
        };
        let need = doubled
            .min(tunables.ramp_up_limit)
            .min(required_tokens - self.my_tokens);

        if pool.pool() == 0 {
            // Spec §4.4 step 10: on an empty pool, jump straight to the
            // fairness step (step 11) — the FAIR-mode exit check below is
            // part of the "otherwise" bullet and must not run here.
            self.starvation += 1;
            self.stats.starvation_ticks += 1;
            if self.starvation >= tunables.starvation_threshold && pool.mode() == Mode::Greedy {
                pool.enter_fair_mode();
                self.flags.insert(FdFlags::SET_FAIR_MODE);
                self.stats.fair_mode_entries += 1;
            }
        } else {
            let taken = pool.take_up_to(need);
            self.my_tokens += taken;
            // If the pool ran dry mid-need, the shortfall is folded back
            // into `last_ramp_up` so the next accept's doubling resumes
            // from the FD's true intent, not from the smaller amount it
            // actually received (spec §4.4 step 10).
            let shortfall = need - taken;
            self.last_ramp_up = taken + shortfall;
            self.flags.insert(FdFlags::TAKING_TOKEN);
            self.mips_when_boosted = self.policy_mips;
            self.starvation = 0;
            self.stats.accepts += 1;

            if self.flags.contains(FdFlags::SET_FAIR_MODE)
                && (self.my_tokens >= pool.fair_tokens() || self.my_tokens >= required_tokens)
            {
                pool.exit_fair_mode();
                self.flags.remove(FdFlags::SET_FAIR_MODE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunables() -> Tunables {
        Tunables::default_scenario()
    }

    #[test]
    fn idle_fd_donates_down_to_zero_and_pool_is_untouched() {
        let pool = TokenPool::new(500, 12);
        let mut fd = FdState::new(4, 5);
        fd.transact(0, &pool, &tunables());
        assert_eq!(fd.my_tokens, 0);
        assert_eq!(pool.pool(), 500);
    }

    #[test]
    fn elastic_hot_fd_ramps_up_by_doubling() {
        // spec §8 scenario S2.
        let pool = TokenPool::new(500, 12);
        let mut fd = FdState::new(4, 5);
        let t = tunables();

        let expected_ramp = [1u32, 2, 4, 8, 16, 32];
        let expected_tokens = [1u32, 3, 7, 15, 31, 63];
        let mut mips = 20_000u32;

        for i in 0..6 {
            fd.policy_mips = mips;
            fd.transact(100, &pool, &t);
            assert_eq!(fd.last_ramp_up, expected_ramp[i], "ramp step {i}");
            assert_eq!(fd.my_tokens, expected_tokens[i], "tokens step {i}");
            mips += 20_000; // growing MIPS => workload is frequency-sensitive
        }
        assert_eq!(pool.pool(), 500 - 63);
    }

    #[test]
    fn insensitive_hot_fd_regrets_and_oscillates() {
        // spec §8 scenario S3: load=100 but MIPS flat => regret rollback.
        let pool = TokenPool::new(500, 12);
        let mut fd = FdState::new(4, 5);
        let t = tunables();
        let flat_mips = 5_000u32;

        fd.policy_mips = flat_mips;
        fd.transact(100, &pool, &t);
        assert_eq!(fd.my_tokens, 1);

        for _ in 0..8 {
            fd.policy_mips = flat_mips;
            fd.transact(100, &pool, &t);
            assert!(fd.my_tokens == 0 || fd.my_tokens == 1);
        }
        assert!(pool.pool() >= 499);
    }

    #[test]
    fn collapse_forces_full_relinquish_after_drop_threshold_laps() {
        // spec §8 scenario S5. `mips_drop_margin_pct` is 110, so each lap's
        // reading must drop by more than ~9% relative to the *previous*
        // reading to keep tripping the collapse check — a one-time step
        // down that then holds flat would only fire once (the comparison
        // is lap-over-lap, not against a fixed baseline), so this drives a
        // genuinely declining sequence: 100_000 -> 80_000 -> ... -> 32_768,
        // each a 20% drop from the one before.
        let pool = TokenPool::new(500, 12);
        let mut fd = FdState::new(4, 5);
        let t = tunables();
        fd.my_tokens = 40;
        fd.last_policy_mips = 100_000;

        let mut mips = 100_000u32;
        for i in 0..5 {
            mips = mips * 4 / 5; // 20% drop every lap
            fd.policy_mips = mips;
            fd.transact(40, &pool, &t);
            if i < 4 {
                assert_eq!(fd.my_tokens, 40, "should not relinquish before 5th lap");
            }
        }
        assert_eq!(fd.my_tokens, 0);
        assert_eq!(pool.pool(), 500 + 40);
    }

    #[test]
    fn starvation_enters_fair_mode_after_threshold_laps() {
        let pool = TokenPool::new(0, 12); // empty pool from the start
        let mut fd = FdState::new(4, 5);
        let t = tunables();
        fd.policy_mips = 10_000;

        for _ in 0..31 {
            fd.transact(100, &pool, &t);
            assert_eq!(pool.mode(), Mode::Greedy);
        }
        fd.transact(100, &pool, &t);
        assert_eq!(pool.mode(), Mode::Fair);
        assert!(fd.set_fair_mode());
    }

    #[test]
    fn set_fair_mode_clears_when_a_later_accept_satisfies_required_tokens() {
        // Drives the real P4 mechanism end to end against `FdState::accept`:
        // a starved FD sets `SET_FAIR_MODE`, then once the pool has
        // something to give and a later accept fully satisfies
        // `required_tokens`, the flag clears and the pool returns to
        // GREEDY — without ever calling `TokenPool::exit_fair_mode`
        // directly.
        let pool = TokenPool::new(0, 12); // starts empty to force starvation
        let mut fd = FdState::new(4, 5);
        let t = tunables();
        fd.policy_mips = 10_000;

        for _ in 0..32 {
            fd.transact(100, &pool, &t);
        }
        assert_eq!(pool.mode(), Mode::Fair);
        assert!(fd.set_fair_mode());

        // A donor FD (not modelled here) returns a few tokens to the pool.
        pool.donate(10);

        // A small request that the now-nonempty pool can satisfy in full.
        fd.transact(1, &pool, &t);

        assert!(!fd.set_fair_mode());
        assert_eq!(pool.mode(), Mode::Greedy);
    }

    #[test]
    fn starvation_branch_never_exits_fair_mode_even_if_already_at_fair_tokens() {
        // Regression for spec §4.4 step 10's "jump to fairness step": the
        // exit check belongs to the non-empty-pool branch only. An FD that
        // is starving this tick (pool==0) must not exit FAIR mode just
        // because `my_tokens` happens to already be >= `fair_tokens` from
        // before it started starving.
        let pool = TokenPool::new(500, 12); // fair_tokens = 166
        pool.enter_fair_mode();
        let mut fd = FdState::new(4, 5);
        fd.flags.insert(FdFlags::SET_FAIR_MODE);
        fd.my_tokens = 200; // already above fair_tokens
        fd.policy_mips = 10_000;

        // Drain the pool so this tick's accept hits the starvation branch.
        pool.take_up_to(pool.pool());

        fd.transact(250, &pool, &tunables());

        assert!(fd.set_fair_mode(), "starvation branch must not clear the flag");
        assert_eq!(pool.mode(), Mode::Fair, "starvation branch must not exit FAIR mode");
    }

    #[test]
    fn fairness_cap_claws_back_excess_above_fair_tokens() {
        let pool = TokenPool::new(500, 12);
        pool.enter_fair_mode();
        let mut fd = FdState::new(4, 5);
        fd.my_tokens = 200; // well above fair_tokens (166)
        fd.policy_mips = 10_000;
        fd.transact(200, &pool, &tunables());
        assert_eq!(fd.my_tokens, pool.fair_tokens());
    }
}
