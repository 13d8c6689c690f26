//! # TokenSmart Admin Surface (C7)
//!
//! Exposes the handful of runtime-tunable knobs the host bolts onto its
//! sysfs-style attribute tree: `central_pool` (read the pool/turn/nr_fds
//! triple, or write a signed adjustment / debug toggle), `mips_threshold`
//! (read/write `IPC_threshold`), and the read-only `central_pool_stats`
//! supplement (spec §10.7) exposing the transaction counters that are
//! otherwise invisible from outside the module.
//!
//! This crate only ever formats and parses ASCII text, the same contract
//! the host's attribute-file framework uses for every other tunable — it
//! never touches `core::sync::atomic` directly, that's `TokenPool`'s job.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::format;
use alloc::string::String;

use tokensmart_core::{Tunables, TokenPool};

/// Failure parsing or validating an admin-surface write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminError {
    /// The written text was not a valid integer.
    ParseError,
    /// The value parsed but fell outside the attribute's accepted range.
    OutOfRange,
}

/// `central_pool` read: `"<pool> <turn> <nr_fds>"`.
pub fn read_central_pool(pool: &TokenPool, nr_fds: u32) -> String {
    format!("{} {} {}\n", pool.pool(), pool.turn(), nr_fds)
}

/// `central_pool` write: a signed decimal integer.
///
/// `0` toggles the module's debug flag; any other value is added to (or, if
/// negative, subtracted from) both the pool and `tokens_in_system`, per
/// spec §6's admin contract. `fair_tokens` is deliberately left untouched —
/// see `TokenPool::admin_adjust`.
pub fn write_central_pool(pool: &TokenPool, text: &str) -> Result<(), AdminError> {
    let n: i64 = text.trim().parse().map_err(|_| AdminError::ParseError)?;
    if n.unsigned_abs() > u64::from(u32::MAX) {
        return Err(AdminError::OutOfRange);
    }
    pool.admin_adjust(n);
    Ok(())
}

/// `mips_threshold` read: the current `IPC_threshold` as decimal text.
pub fn read_mips_threshold(tunables: &Tunables) -> String {
    format!("{}\n", tunables.ipc_threshold())
}

/// `mips_threshold` write: an unsigned decimal integer.
pub fn write_mips_threshold(tunables: &Tunables, text: &str) -> Result<(), AdminError> {
    let n: u32 = text.trim().parse().map_err(|_| AdminError::ParseError)?;
    tunables.set_ipc_threshold(n);
    Ok(())
}

/// `central_pool_stats` read: the admin-visible transaction counters
/// (spec §10.7 supplement, grounded in `examples/original_source`'s
/// per-attribute debug counters).
pub fn read_central_pool_stats(pool: &TokenPool) -> String {
    let stats = pool.admin_stats();
    format!(
        "admin_injections {}\ndebug_toggles {}\ntokens_in_system {}\n",
        stats.admin_injections,
        stats.debug_toggles,
        pool.tokens_in_system(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn central_pool_read_reports_pool_turn_and_fds() {
        let pool = TokenPool::new(500, 12);
        pool.set_turn(3);
        assert_eq!(read_central_pool(&pool, 12), "500 3 12\n");
    }

    #[test]
    fn central_pool_write_adjusts_pool() {
        let pool = TokenPool::new(500, 12);
        write_central_pool(&pool, "100").unwrap();
        assert_eq!(pool.pool(), 600);
        write_central_pool(&pool, "-50").unwrap();
        assert_eq!(pool.pool(), 550);
    }

    #[test]
    fn central_pool_write_zero_toggles_debug() {
        let pool = TokenPool::new(500, 12);
        write_central_pool(&pool, "0").unwrap();
        assert!(pool.debug());
        assert_eq!(pool.pool(), 500);
    }

    #[test]
    fn central_pool_write_rejects_garbage() {
        let pool = TokenPool::new(500, 12);
        assert_eq!(write_central_pool(&pool, "banana"), Err(AdminError::ParseError));
    }

    #[test]
    fn mips_threshold_round_trips() {
        let tunables = Tunables::default_scenario();
        write_mips_threshold(&tunables, "9000").unwrap();
        assert_eq!(read_mips_threshold(&tunables), "9000\n");
    }

    #[test]
    fn central_pool_stats_reflects_admin_activity() {
        let pool = TokenPool::new(500, 12);
        write_central_pool(&pool, "100").unwrap();
        write_central_pool(&pool, "0").unwrap();
        let report = read_central_pool_stats(&pool);
        assert!(report.contains("admin_injections 1"));
        assert!(report.contains("debug_toggles 1"));
        assert!(report.contains("tokens_in_system 600"));
    }
}
