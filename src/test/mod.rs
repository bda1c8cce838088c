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

use std::cell::RefCell;
use std::rc::Rc;

use crate::prelude::*;
use crate::types::Hop;

mod test_invariants;
mod test_mpp;
mod test_scenarios;
mod test_workload;

/// A single SFF hosting `num_sfis` SFIs of SF type 0, each on its own
/// server. The single latency distribution 0 is constant zero.
fn single_sff(
    scheduler: Box<dyn Scheduler>,
    num_sfis: usize,
    capacity: u64,
    rate: u64,
    policy: CpuPolicy,
) -> (Simulator, SffId, Vec<SfiId>) {
    let mut sim = Simulator::new(0);
    let sff = sim.add_sff(scheduler).unwrap();
    sim.topo.set_latency_distribution(0, vec![0]);
    sim.topo.freeze();
    sim.init_sf_types(1, 0);
    sim.set_sf_processing_rate(0, rate).unwrap();
    let sfis = (0..num_sfis)
        .map(|_| {
            let server = sim.add_server(capacity, policy);
            sim.add_sfi(server, 0, sff).unwrap()
        })
        .collect();
    (sim, sff, sfis)
}

/// Record, per terminal packet, the SFIs it visited (in order) and its
/// final state. Enables packet tracing.
fn record_outcomes(
    sim: &mut Simulator,
) -> Rc<RefCell<Vec<(FlowId, Vec<SfiId>, FinalState)>>> {
    sim.trace_packet_path = true;
    let log = Rc::new(RefCell::new(vec![]));
    let writer = log.clone();
    sim.on_packet_teardown(Box::new(move |_, packet, state| {
        let sfis = packet
            .visited_hops
            .iter()
            .filter_map(|hop| match hop {
                Hop::Sfi(sfi) => Some(*sfi),
                Hop::Sff(_) => None,
            })
            .collect();
        writer.borrow_mut().push((packet.flow, sfis, state));
    }));
    log
}

/// Dispatch counts per SFI, extracted from a [`record_outcomes`] log.
fn sfi_visit_counts(
    log: &[(FlowId, Vec<SfiId>, FinalState)],
    num_sfis: usize,
) -> Vec<usize> {
    let mut counts = vec![0; num_sfis];
    for (_, sfis, _) in log {
        for sfi in sfis {
            counts[sfi.index()] += 1;
        }
    }
    counts
}
