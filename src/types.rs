// SfcSim: Discrete-Event Simulator for SFC Traffic Scheduling written in Rust
// Copyright (C) 2022-2023 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Module containing all type definitions

use petgraph::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub(crate) type IndexType = u32;

/// SFF Identification (and index into the topology graph)
pub type SffId = NodeIndex<IndexType>;

/// Virtual time in microseconds. The simulator only ever deals in integer
/// microseconds; floating-point times would break determinism.
pub type SimTime = u64;

/// One second, expressed in [`SimTime`] units.
pub const MICROS_PER_SEC: u64 = 1_000_000;

/// A service function type. SF types are dense integers `0..num_sf_types`.
pub type SfType = usize;

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(
            PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy, Serialize, Deserialize,
        )]
        pub struct $name(pub(crate) usize);

        impl $name {
            /// Raw index into the owning arena.
            pub fn index(&self) -> usize {
                self.0
            }
        }

        impl From<usize> for $name {
            fn from(x: usize) -> Self {
                Self(x)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}

arena_id!(
    /// Identifier of a service function instance.
    SfiId,
    "SFI"
);
arena_id!(
    /// Identifier of a server hosting SFIs.
    ServerId,
    "Server"
);
arena_id!(
    /// Identifier of a flow.
    FlowId,
    "Flow"
);
arena_id!(
    /// A packet class: an index into the global class table. Classes are
    /// allocated contiguously per registered SFC, such that the class of a
    /// packet is its flow's base class plus its position in the chain.
    ClassId,
    "Class"
);

impl ClassId {
    /// The class of the next chain position (backpressure neighbor).
    pub fn next(&self) -> ClassId {
        ClassId(self.0 + 1)
    }
}

impl std::ops::Add<usize> for ClassId {
    type Output = ClassId;

    fn add(self, rhs: usize) -> ClassId {
        ClassId(self.0 + rhs)
    }
}

/// A single stop on a packet's path: either an SFF (routing/scheduling hop)
/// or an SFI (processing hop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hop {
    /// Forwarding stop at an SFF.
    Sff(SffId),
    /// Processing stop at an SFI.
    Sfi(SfiId),
}

impl std::fmt::Display for Hop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Hop::Sff(id) => write!(f, "SFF{}", id.index()),
            Hop::Sfi(id) => write!(f, "{}", id),
        }
    }
}

/// Terminal state of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinalState {
    /// The packet traversed its entire chain and reached the desired egress
    /// within its deadline.
    Done,
    /// The packet exceeded its QoS deadline and was dropped.
    Timeout,
    /// A scheduler was unable to schedule the packet.
    RejectSchedule,
}

impl FinalState {
    /// Stable string used in statistics output.
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalState::Done => "done",
            FinalState::Timeout => "timeout",
            FinalState::RejectSchedule => "rejectSchedule",
        }
    }
}

impl std::fmt::Display for FinalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU sharing policy of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CpuPolicy {
    /// Every SFI holds an equal, fixed share of the server.
    Static,
    /// Shares are rebalanced periodically, proportional to queue lengths.
    Dynamic,
    /// At most one SFI processes at any time and holds the full capacity.
    OneAtATime,
}

impl std::str::FromStr for CpuPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(CpuPolicy::Static),
            "dynamic" => Ok(CpuPolicy::Dynamic),
            "one-at-a-time" => Ok(CpuPolicy::OneAtATime),
            _ => Err(ConfigError::UnknownCpuPolicy(s.to_string())),
        }
    }
}

impl std::fmt::Display for CpuPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CpuPolicy::Static => "static",
            CpuPolicy::Dynamic => "dynamic",
            CpuPolicy::OneAtATime => "one-at-a-time",
        })
    }
}

/// Setup / configuration error. All of these are fatal before the
/// simulation starts.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    /// The scheduler name in the configuration is not known.
    #[error("unknown scheduler: {0:?}")]
    UnknownScheduler(String),
    /// The CPU policy name in the configuration is not known.
    #[error("unknown cpu policy: {0:?}")]
    UnknownCpuPolicy(String),
    /// An SFI was created before the SF type table was initialized.
    #[error("the SF type table must be initialized before creating SFIs")]
    SfTypesNotInitialized,
    /// The SF type is outside the initialized table, or its rate is unset.
    #[error("SF type {0} is unknown or has no processing rate")]
    UnknownSfType(SfType),
    /// A link refers to a latency distribution that was never created.
    #[error("unknown latency distribution id: {0}")]
    UnknownLatencyDistribution(usize),
    /// An SFF was created after the topology matrices were sized.
    #[error(
        "cannot create an SFF after initializing the topology; \
         create all SFFs first, then set up the connections"
    )]
    TopologyFrozen,
    /// A link was created with a source or destination that does not exist.
    #[error("link endpoint SFF{} does not exist", .0.index())]
    UnknownSff(SffId),
    /// Self-links are not allowed.
    #[error("cannot create a link from SFF{} to itself", .0.index())]
    SelfLink(SffId),
    /// A static-policy server hosts more SFIs than it has capacity.
    #[error("server {server} hosts {sfis} SFIs but only has capacity {capacity}")]
    ServerOversubscribed {
        /// The offending server.
        server: ServerId,
        /// Number of SFIs hosted.
        sfis: usize,
        /// Processing capacity of the server.
        capacity: u64,
    },
    /// A single SFF may only see one SFI per (server, SF type) pair.
    #[error("SFF{} already sees an SFI of type {sf} on server {server}", .sff.index())]
    DuplicateSfiOnServer {
        /// The SFF at which the SFI was registered.
        sff: SffId,
        /// The server hosting both instances.
        server: ServerId,
        /// The duplicated SF type.
        sf: SfType,
    },
    /// The SFI is so fast that its processing time rounds down to zero.
    #[error("processing time of SF type {sf} on a server with capacity {capacity} is below 1µs")]
    ProcessingTimeTooSmall {
        /// The SF type.
        sf: SfType,
        /// The server capacity.
        capacity: u64,
    },
    /// A new (chain, egress) combination was registered after the start.
    #[error("cannot register a new SFC/egress combination after starting the simulation")]
    SfcRegisteredAfterStart,
    /// ACP thresholds must satisfy `low < high`.
    #[error("invalid admission thresholds: low ({low}) must be below high ({high})")]
    InvalidThresholds {
        /// Lower threshold.
        low: f64,
        /// Upper threshold.
        high: f64,
    },
    /// MPP: the batch size may not exceed the underway budget.
    #[error("batch_scheduling ({batch}) exceeds allow_underway_per_server ({allow})")]
    BatchExceedsUnderway {
        /// Configured batch size.
        batch: u32,
        /// Configured underway budget.
        allow: u32,
    },
    /// MPP: at least one packet must be allowed underway.
    #[error("at least 1 packet must be allowed underway per server")]
    UnderwayTooSmall,
    /// MPP only supports incremental scheduling.
    #[error("the MPP scheduler only supports incremental scheduling")]
    MppRequiresIncremental,
    /// MPP instances must agree on the batch size.
    #[error("all MPP schedulers must use the same batch size ({0} != {1})")]
    MppBatchMismatch(u32, u32),
    /// Per-site configuration vectors must have one entry per site.
    #[error("configuration key {0:?} must have one entry per site")]
    PerSiteLengthMismatch(&'static str),
    /// The SFI spread could not place all requested instances.
    #[error("cannot find an available server for the remaining {0} SFIs")]
    SfiSpreadFailed(usize),
    /// A workload was registered twice.
    #[error("a workload generator is already registered")]
    WorkloadAlreadyRegistered,
}

/// Routing error: the topology cannot carry a requested packet. Both cases
/// indicate a broken setup and abort the run.
#[derive(Error, Debug, PartialEq)]
pub enum RoutingError {
    /// There is no path between the two SFFs.
    #[error("graph is not connected: no path from SFF{} to SFF{}", .0.index(), .1.index())]
    Disconnected(SffId, SffId),
    /// A packet is larger than the capacity of the link it must traverse.
    #[error(
        "cannot route a packet of size {size} from SFF{} to SFF{}: link capacity is {capacity}",
        .from.index(), .dest.index()
    )]
    InsufficientLinkCapacity {
        /// Source of the link.
        from: SffId,
        /// Destination of the link.
        dest: SffId,
        /// Bandwidth cap of the link.
        capacity: u64,
        /// Size of the packet.
        size: u64,
    },
}

/// A scheduler failed to schedule a packet. Recoverable at the SFF level
/// (the packet is rejected) unless the simulator runs in strict mode.
#[derive(Error, Debug, PartialEq)]
#[error("failed to find a path for {0}")]
pub struct SchedulingFailure(pub String);

/// Top-level simulator error.
#[derive(Error, Debug)]
pub enum SimError {
    /// Invalid setup or configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The topology cannot route a requested packet.
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),
    /// A scheduling failure escalated in strict mode.
    #[error("scheduling error: {0}")]
    Scheduling(#[from] SchedulingFailure),
    /// An internal invariant was violated. This is always a bug.
    #[error("internal inconsistency: {0}")]
    Inconsistency(String),
    /// Error while writing statistics.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Error while parsing the configuration file.
    #[error("cannot parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_policy_names_roundtrip() {
        for p in [CpuPolicy::Static, CpuPolicy::Dynamic, CpuPolicy::OneAtATime] {
            assert_eq!(p.to_string().parse::<CpuPolicy>().unwrap(), p);
        }
        assert!("one_at_a_time".parse::<CpuPolicy>().is_err());
    }

    #[test]
    fn class_arithmetic() {
        let c = ClassId::from(3);
        assert_eq!(c + 2, ClassId::from(5));
        assert_eq!(c.next(), ClassId::from(4));
    }
}
