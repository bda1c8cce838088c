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

#![deny(missing_docs, missing_debug_implementations)]

//! # SfcSim
//!
//! A discrete-event simulator for Service Function Chain (SFC) traffic
//! scheduling.
//!
//! A workload of packet flows is injected into a network of Service
//! Function Forwarders (SFFs) interconnected by latency- and
//! bandwidth-limited links; each SFF hosts Service Function Instances
//! (SFIs) running on shared servers. Each packet carries an ordered chain
//! of service function (SF) types it must traverse, a QoS deadline, and a
//! desired egress SFF. A scheduler at each SFF decides, per arriving
//! packet (or per batch), which SFI(s) and inter-SFF path(s) the packet
//! takes. The simulator advances virtual time by processing events in
//! nondecreasing time order and records outcomes (success, reject,
//! timeout) together with a per-packet timing decomposition.
//!
//! ## Main concepts
//!
//! The [`simulator::Simulator`] owns everything: the
//! [`topology::Topology`] (a petgraph link graph plus the precomputed
//! all-pairs shortest-latency paths), the arenas of
//! [`model::Sff`]s/[`model::Sfi`]s/[`model::Server`]s/[`model::Flow`]s, a
//! seeded RNG, and the [`event::EventQueue`]. Entities reference each
//! other by integer ids. All operational logic is implemented as
//! `Simulator` methods, so that every event executes atomically and runs
//! are bit-for-bit deterministic given the same seed and configuration.
//!
//! Scheduling strategies implement the [`scheduler::Scheduler`] trait:
//! greedy shortest-deadline-first
//! ([`scheduler::GreedyShortestDeadlineFirstScheduler`]), load-unaware
//! weighted round-robin
//! ([`scheduler::LoadUnawareRoundRobinScheduler`]), the MPP max-weight
//! scheduler ([`scheduler::MppScheduler`]), and a rejecting control
//! strategy ([`scheduler::RejectScheduler`]). Non-oracle schedulers carry
//! an admission control and forwarding policy ([`scheduler::Acp`]) that
//! opportunistically off-loads packets to remote SFFs based on
//! [`rate_estimator`] estimates.
//!
//! The [`workload::SyntheticWorkload`] generates flows with two-state
//! Markov inter-arrivals and Poisson packet arrivals, and is pulled lazily
//! by the event engine whenever the horizon nears exhaustion.
//!
//! ## Example
//!
//! ```
//! use sfcsim::prelude::*;
//!
//! fn main() -> Result<(), SimError> {
//!     let mut sim = Simulator::new(42);
//!
//!     // one SFF with a greedy scheduler, no links
//!     let scheduler = GreedyShortestDeadlineFirstScheduler::new(true, true, 0.1, 1.0)?;
//!     let sff = sim.add_sff(Box::new(scheduler))?;
//!     sim.topo.set_latency_distribution(0, vec![10]);
//!     sim.topo.freeze();
//!
//!     // one SF type, one server, one SFI
//!     sim.init_sf_types(1, 0);
//!     sim.set_sf_processing_rate(0, 100)?;
//!     let server = sim.add_server(10, CpuPolicy::OneAtATime);
//!     sim.add_sfi(server, 0, sff)?;
//!
//!     // a flow of three packets
//!     let flow = sim.add_flow(vec![0], 1_000_000, sff, sff, 0)?;
//!     for time in [100, 200, 300] {
//!         sim.inject_packet(flow, time, 1);
//!     }
//!
//!     let stats = sim.run(RunOptions::default())?;
//!     assert_eq!(sim.counters.success, 3);
//!     assert!(stats.success_rate == 1.0);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod event;
pub mod model;
pub mod prelude;
pub mod rate_estimator;
pub mod scheduler;
pub mod simulator;
pub mod stats;
pub mod topology;
pub mod types;
pub mod workload;

#[cfg(test)]
mod test;
