//! # TokenSmart Token Economy (C2-C5)
//!
//! This crate is the part of TokenSmart that never touches hardware: given
//! retired-instruction deltas, load samples and ring-turn bookkeeping
//! supplied by the tick handler (`tokensmart-governor`), it decides how
//! many tokens each frequency domain should hold. It knows nothing about
//! `PerfCounterSource`, actuators, or topology — that keeps the decision
//! core unit-testable with plain integers, no simulated host required.
//!
//! ## Modules
//!
//! - [`config`]: tunable constants (C7 admin surface mutates two of them)
//! - [`ips_meter`]: per-CPU EWMA of instructions-per-ms (C2)
//! - [`load_view`]: per-FD load aggregation (C3)
//! - [`token_pool`]: the shared token budget and ring cursor (C5)
//! - [`fd_state`]: per-FD state and the Phase B/C decision logic (C4)

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod fd_state;
pub mod ips_meter;
pub mod load_view;
pub mod token_pool;

pub use config::Tunables;
pub use fd_state::{FdState, FdStats};
pub use ips_meter::CpuIpsState;
pub use token_pool::{Mode, TokenPool};
