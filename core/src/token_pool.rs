//! Shared Token Pool (C5).
//!
//! `pool`, `turn`, and `mode` are process-wide: writable only by the FD
//! holding `turn` (fast path, lock-free) and by the admin surface (rare,
//! behind [`TokenPool::admin_adjust`]'s lock). Every other FD reads them
//! lock-free. This mirrors the teacher framework's split between
//! `AtomicU32`-backed hot state (`KernelState`) and mutex-guarded
//! structured state (`KernelOrchestrator`'s `BootConfiguration`).

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

/// Pool mode. GREEDY lets an FD take as many tokens as it needs (bounded
/// by ramp-up); FAIR caps each FD at `fair_tokens` to recover a starved FD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No cap beyond the ramp-up schedule.
    Greedy,
    /// Every FD capped at `fair_tokens`.
    Fair,
}

impl Mode {
    fn to_raw(self) -> u32 {
        match self {
            Mode::Greedy => 0,
            Mode::Fair => 1,
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Mode::Fair,
            _ => Mode::Greedy,
        }
    }
}

/// Aggregate transaction counters, exposed read-only through the admin
/// surface's `central_pool_stats` attribute (spec §10.7 supplement).
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Admin-surface writes that added to the pool.
    pub admin_injections: u64,
    /// Admin-surface writes that toggled the debug flag.
    pub debug_toggles: u64,
}

/// The shared, process-wide token budget and ring cursor.
pub struct TokenPool {
    pool: AtomicU32,
    turn: AtomicU32,
    mode: AtomicU32,
    fair_tokens: AtomicU32,
    tokens_in_system: AtomicU32,
    debug: AtomicBool,
    admin_lock: Mutex<PoolStats>,
}

impl TokenPool {
    /// Build a pool with `initial_pool` undistributed tokens and `turn`
    /// starting at FD 0. `fair_tokens` is derived once here and never
    /// recomputed, per spec §4.4's explicit non-recompute rule.
    pub fn new(initial_pool: u32, nr_active_fds: usize) -> Self {
        let fair_tokens = if nr_active_fds == 0 {
            0
        } else {
            initial_pool / (nr_active_fds as u32 / 4).max(1)
        };
        Self {
            pool: AtomicU32::new(initial_pool),
            turn: AtomicU32::new(0),
            mode: AtomicU32::new(Mode::Greedy.to_raw()),
            fair_tokens: AtomicU32::new(fair_tokens),
            tokens_in_system: AtomicU32::new(initial_pool),
            debug: AtomicBool::new(false),
            admin_lock: Mutex::new(PoolStats::default()),
        }
    }

    /// Undistributed tokens, lock-free read.
    pub fn pool(&self) -> u32 {
        self.pool.load(Ordering::Acquire)
    }

    /// FD currently authorised to transact.
    pub fn turn(&self) -> u32 {
        self.turn.load(Ordering::Acquire)
    }

    /// Advance the cursor. Called only by the FD that just transacted.
    pub fn set_turn(&self, fd: u32) {
        self.turn.store(fd, Ordering::Release);
    }

    /// Current pool mode.
    pub fn mode(&self) -> Mode {
        Mode::from_raw(self.mode.load(Ordering::Acquire))
    }

    fn set_mode(&self, mode: Mode) {
        self.mode.store(mode.to_raw(), Ordering::Release);
    }

    /// Per-FD cap while `mode() == Mode::Fair`. Fixed at construction.
    pub fn fair_tokens(&self) -> u32 {
        self.fair_tokens.load(Ordering::Acquire)
    }

    /// Total tokens in the system (pool + every FD's `my_tokens`),
    /// invariant except for admin injection/withdrawal (spec §3 P1/P2).
    pub fn tokens_in_system(&self) -> u32 {
        self.tokens_in_system.load(Ordering::Acquire)
    }

    /// Whether the debug toggle (`central_pool` write of `0`) is set.
    pub fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Return `amount` tokens to the pool (donate branch of Phase C).
    pub fn donate(&self, amount: u32) {
        if amount > 0 {
            self.pool.fetch_add(amount, Ordering::AcqRel);
        }
    }

    /// Take up to `need` tokens from the pool, returning however much was
    /// actually available (spec §4.4 step 10: "take all remaining pool; do
    /// not block").
    pub fn take_up_to(&self, need: u32) -> u32 {
        if need == 0 {
            return 0;
        }
        let mut current = self.pool.load(Ordering::Acquire);
        loop {
            let take = need.min(current);
            if take == 0 {
                return 0;
            }
            match self.pool.compare_exchange_weak(
                current,
                current - take,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return take,
                Err(observed) => current = observed,
            }
        }
    }

    /// Enter FAIR mode. Idempotent.
    pub fn enter_fair_mode(&self) {
        self.set_mode(Mode::Fair);
    }

    /// Return to GREEDY mode. Idempotent.
    pub fn exit_fair_mode(&self) {
        self.set_mode(Mode::Greedy);
    }

    /// `central_pool` admin write: `n == 0` toggles debug, else `n` is
    /// added to both `pool` and `tokens_in_system` under the admin lock.
    /// `fair_tokens` is deliberately NOT recomputed (spec §4.4, §9(iii)).
    pub fn admin_adjust(&self, n: i64) {
        let mut stats = self.admin_lock.lock();
        if n == 0 {
            let new_value = !self.debug.load(Ordering::Relaxed);
            self.debug.store(new_value, Ordering::Relaxed);
            stats.debug_toggles += 1;
            return;
        }
        if n > 0 {
            let delta = n as u32;
            self.pool.fetch_add(delta, Ordering::AcqRel);
            self.tokens_in_system.fetch_add(delta, Ordering::AcqRel);
        } else {
            let delta = (-n) as u32;
            self.pool.fetch_sub(delta.min(self.pool()), Ordering::AcqRel);
            self.tokens_in_system
                .fetch_sub(delta.min(self.tokens_in_system()), Ordering::AcqRel);
        }
        stats.admin_injections += 1;
    }

    /// Snapshot of admin-surface-visible counters.
    pub fn admin_stats(&self) -> PoolStats {
        *self.admin_lock.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fair_tokens_derived_from_initial_pool_and_active_fds() {
        // spec §8 scenario S4: pool=500, nr_fds=12 => fair_tokens = 500/(12/4) = 166.
        let pool = TokenPool::new(500, 12);
        assert_eq!(pool.fair_tokens(), 166);
    }

    #[test]
    fn take_up_to_never_exceeds_available_pool() {
        let pool = TokenPool::new(5, 4);
        assert_eq!(pool.take_up_to(10), 5);
        assert_eq!(pool.pool(), 0);
        assert_eq!(pool.take_up_to(1), 0);
    }

    #[test]
    fn donate_and_take_conserve_pool() {
        let pool = TokenPool::new(100, 4);
        let taken = pool.take_up_to(30);
        assert_eq!(taken, 30);
        pool.donate(10);
        assert_eq!(pool.pool(), 80);
    }

    #[test]
    fn admin_adjust_zero_toggles_debug_without_touching_pool() {
        let pool = TokenPool::new(500, 12);
        assert!(!pool.debug());
        pool.admin_adjust(0);
        assert!(pool.debug());
        assert_eq!(pool.pool(), 500);
        pool.admin_adjust(0);
        assert!(!pool.debug());
    }

    #[test]
    fn admin_adjust_does_not_recompute_fair_tokens() {
        let pool = TokenPool::new(500, 12);
        let before = pool.fair_tokens();
        pool.admin_adjust(1000);
        assert_eq!(pool.pool(), 1500);
        assert_eq!(pool.tokens_in_system(), 1500);
        assert_eq!(pool.fair_tokens(), before);
    }

    #[test]
    fn ring_turn_advances_and_reads_lock_free() {
        let pool = TokenPool::new(500, 12);
        assert_eq!(pool.turn(), 0);
        pool.set_turn(5);
        assert_eq!(pool.turn(), 5);
    }
}
