//! # Frequency-Domain Topology (C1)
//!
//! Maps hardware threads to frequency domains (FDs) and defines the ring
//! order the token economy travels. Built once at startup from the host's
//! frequency-policy list and never mutated afterwards; `tokensmart-core`
//! only ever reads a built [`Topology`] through its lookup methods.
//!
//! Architecture-specific behaviour (which CPUs are exceptional, how the
//! ring advances) is a [`TopologyPolicy`] selected at construction time —
//! a runtime registry rather than a cargo feature, so [`GenericTopology`]
//! and [`Power9Topology`] can both be exercised from the same test binary.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;

/// One CPU group as enumerated by the host's frequency-policy framework.
///
/// In the generic policy each `HostPolicy` *is* a frequency domain. A host
/// whose policy granularity is finer than an FD groups several
/// `HostPolicy`s under one FD before calling [`TopologyPolicy::build`];
/// that grouping is the host's responsibility, not this crate's.
#[derive(Debug, Clone)]
pub struct HostPolicy {
    /// CPUs belonging to this policy, in host enumeration order.
    pub cpus: Vec<u32>,
}

impl HostPolicy {
    /// Convenience constructor for a contiguous CPU range.
    pub fn range(first_cpu: u32, count: u32) -> Self {
        Self {
            cpus: (first_cpu..first_cpu + count).collect(),
        }
    }
}

/// Failure building a [`Topology`] from the host's policy list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyError {
    /// The host reported no frequency policies at all.
    Empty,
    /// A CPU was assigned an FD id outside `[0, nr_fds)`.
    InconsistentFd,
}

/// A built, immutable topology: CPU→FD mapping, ring order, exceptional
/// set, and per-FD representative CPU.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    nr_cpus: usize,
    nr_fds: usize,
    cpus_per_fd: usize,
    cpu_to_fd: Vec<u32>,
    first_cpu_of_fd: Vec<u32>,
    fd_cpus: Vec<Vec<u32>>,
    ring_next: Vec<u32>,
    exceptional_fd: Vec<bool>,
}

impl Topology {
    /// Total number of CPUs known at build time.
    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// Total number of frequency domains, exceptional ones included.
    pub fn nr_fds(&self) -> usize {
        self.nr_fds
    }

    /// CPUs per FD (uniform within a socket per spec §3).
    pub fn cpus_per_fd(&self) -> usize {
        self.cpus_per_fd
    }

    /// The FD containing `cpu`.
    pub fn fd_of(&self, cpu: u32) -> u32 {
        self.cpu_to_fd[cpu as usize]
    }

    /// The representative CPU for the FD containing `cpu`. Only the
    /// representative runs the full tick logic (spec §4.4 Phase A step 2).
    pub fn first_cpu_of(&self, cpu: u32) -> u32 {
        self.first_cpu_of_fd[self.fd_of(cpu) as usize]
    }

    /// Every CPU belonging to `fd`, in the order supplied at build time.
    pub fn cpus_of_fd(&self, fd: u32) -> &[u32] {
        &self.fd_cpus[fd as usize]
    }

    /// True if `cpu` is pinned to `max_freq` and excluded from the ring.
    pub fn exceptional(&self, cpu: u32) -> bool {
        self.exceptional_fd[self.fd_of(cpu) as usize]
    }

    /// True if the FD itself (by id) is excluded from the ring.
    pub fn fd_exceptional(&self, fd: u32) -> bool {
        self.exceptional_fd[fd as usize]
    }

    /// Next FD in ring order after `fd`. Only meaningful for non-exceptional
    /// FDs; the ring forms one Hamiltonian cycle over them.
    pub fn next_in_ring(&self, fd: u32) -> u32 {
        self.ring_next[fd as usize]
    }

    /// Iterate the ids of every non-exceptional FD, ascending.
    pub fn active_fds(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.nr_fds as u32).filter(move |&fd| !self.fd_exceptional(fd))
    }

    /// Number of non-exceptional FDs (the ring's length).
    pub fn nr_active_fds(&self) -> usize {
        self.active_fds().count()
    }
}

/// Architecture-specific capability set for building a [`Topology`].
///
/// Implementations are selected at construction time (e.g. by the host's
/// `start()` callback choosing `GenericTopology` or `Power9Topology` based
/// on a compile-time cfg or a runtime probe); both conform to the same
/// interface so `tokensmart-core` never branches on architecture.
pub trait TopologyPolicy {
    /// Enumerate FDs from `host_policies`, assign ids in enumeration
    /// order, and construct the ring. Fails on an empty policy list.
    fn build(&self, host_policies: &[HostPolicy]) -> Result<Topology, TopologyError>;
}

/// The generic policy: one ring of size `nr_fds`, `next_in_ring(i) = (i+1)
/// mod nr_fds`, no CPU is exceptional.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericTopology;

impl TopologyPolicy for GenericTopology {
    fn build(&self, host_policies: &[HostPolicy]) -> Result<Topology, TopologyError> {
        if host_policies.is_empty() {
            return Err(TopologyError::Empty);
        }

        let nr_fds = host_policies.len();
        let cpus_per_fd = host_policies[0].cpus.len();
        let nr_cpus = host_policies.iter().map(|p| p.cpus.len()).sum();

        let mut cpu_to_fd = alloc::vec![0u32; nr_cpus];
        let mut first_cpu_of_fd = Vec::with_capacity(nr_fds);
        let mut fd_cpus = Vec::with_capacity(nr_fds);
        for (fd, policy) in host_policies.iter().enumerate() {
            first_cpu_of_fd.push(*policy.cpus.first().ok_or(TopologyError::Empty)?);
            for &cpu in &policy.cpus {
                let idx = cpu as usize;
                if idx >= nr_cpus {
                    return Err(TopologyError::InconsistentFd);
                }
                cpu_to_fd[idx] = fd as u32;
            }
            fd_cpus.push(policy.cpus.clone());
        }

        let ring_next: Vec<u32> = (0..nr_fds).map(|i| ((i + 1) % nr_fds) as u32).collect();
        let exceptional_fd = alloc::vec![false; nr_fds];

        Ok(Topology {
            nr_cpus,
            nr_fds,
            cpus_per_fd,
            cpu_to_fd,
            first_cpu_of_fd,
            fd_cpus,
            ring_next,
            exceptional_fd,
        })
    }
}

/// The POWER9 variant observed in `examples/original_source`.
///
/// CPUs `>= 88` are exceptional (pinned secondary-socket threads). Ring
/// advance jumps from the FD whose representative CPU is 64 straight to
/// the FD whose representative is 72 (the quad-boundary FD at CPU 68 is
/// folded into the exceptional set, not silently dropped from the ring —
/// see `DESIGN.md` for why), and any FD at or past representative CPU 72
/// wraps back to FD 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct Power9Topology;

impl Power9Topology {
    const EXCEPTIONAL_FROM_CPU: u32 = 88;
    const JUMP_FROM_CPU: u32 = 64;
    const JUMP_TO_CPU: u32 = 72;
}

impl TopologyPolicy for Power9Topology {
    fn build(&self, host_policies: &[HostPolicy]) -> Result<Topology, TopologyError> {
        let generic = GenericTopology.build(host_policies)?;
        let Topology {
            nr_cpus,
            nr_fds,
            cpus_per_fd,
            cpu_to_fd,
            first_cpu_of_fd,
            fd_cpus,
            mut ring_next,
            mut exceptional_fd,
        } = generic;

        for fd in 0..nr_fds {
            let rep = first_cpu_of_fd[fd];
            if rep >= Self::EXCEPTIONAL_FROM_CPU {
                exceptional_fd[fd] = true;
                continue;
            }
            if rep == Self::JUMP_FROM_CPU {
                if let Some(target_fd) = first_cpu_of_fd
                    .iter()
                    .position(|&c| c == Self::JUMP_TO_CPU)
                {
                    ring_next[fd] = target_fd as u32;
                }
            } else if rep > Self::JUMP_FROM_CPU && rep < Self::JUMP_TO_CPU {
                // Quad-boundary FD the jump steps over: excluded from the
                // ring like any other pinned FD, per spec §9 note (ii) —
                // a silently-skipped-but-not-exceptional FD would violate
                // the ring-liveness invariant in spec §3.
                exceptional_fd[fd] = true;
            } else if rep >= Self::JUMP_TO_CPU {
                ring_next[fd] = 0;
            }
        }

        Ok(Topology {
            nr_cpus,
            nr_fds,
            cpus_per_fd,
            cpu_to_fd,
            first_cpu_of_fd,
            fd_cpus,
            ring_next,
            exceptional_fd,
        })
    }
}
