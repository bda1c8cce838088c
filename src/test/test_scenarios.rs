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

//! End-to-end scenarios with hand-crafted topologies.

use super::{record_outcomes, sfi_visit_counts, single_sff};
use crate::prelude::*;
use crate::types::Hop;

/// Two identical SFIs behind one SFF, greedy local-incremental: every
/// packet is delivered and the load spreads over both instances.
#[test]
fn greedy_local_spreads_over_two_sfis() {
    let scheduler = GreedyShortestDeadlineFirstScheduler::new(true, false, 0.1, 1.0).unwrap();
    let (mut sim, sff, _sfis) =
        single_sff(Box::new(scheduler), 2, 100, 15, CpuPolicy::OneAtATime);
    let log = record_outcomes(&mut sim);

    let flow = sim.add_flow(vec![0], 1_000_000_000, sff, sff, 0).unwrap();
    for i in 0..10 {
        sim.inject_packet(flow, i * 300, 1);
    }

    sim.run(RunOptions::default()).unwrap();
    assert_eq!(sim.counters.success, 10);
    assert_eq!(sim.counters.reject_schedule, 0);
    assert_eq!(sim.counters.timeout, 0);

    let log = log.borrow();
    assert!(log.iter().all(|(_, _, state)| *state == FinalState::Done));
    let counts = sfi_visit_counts(&log, 2);
    assert_eq!(counts.iter().sum::<usize>(), 10);
    assert!(
        counts.iter().all(|c| *c >= 3),
        "dispatches do not alternate: {counts:?}"
    );
}

/// Greedy oracle non-incremental over two SFFs: the packet bounces to the
/// remote SFI and back, paying the link latency twice.
#[test]
fn greedy_oracle_schedules_remote_sfi() {
    let mut sim = Simulator::new(0);
    let sched = |oracle| GreedyShortestDeadlineFirstScheduler::new(false, oracle, 0.1, 1.0);
    let sff0 = sim.add_sff(Box::new(sched(true).unwrap())).unwrap();
    let sff1 = sim.add_sff(Box::new(sched(true).unwrap())).unwrap();
    sim.topo.set_latency_distribution(0, vec![1000]);
    sim.topo.set_latency_distribution(1, vec![0]);
    sim.topo.add_link(sff0, sff1, 1000, 0, true).unwrap();
    sim.topo.consider_link_capacity = true;

    sim.init_sf_types(1, 1);
    sim.set_sf_processing_rate(0, 15).unwrap();
    let server = sim.add_server(100, CpuPolicy::OneAtATime);
    let sfi = sim.add_sfi(server, 0, sff0).unwrap();

    let log = record_outcomes(&mut sim);
    let flow = sim.add_flow(vec![0], 10_000_000, sff1, sff1, 0).unwrap();
    for i in 0..5 {
        sim.inject_packet(flow, i * 5_000, 1);
    }

    let delays = std::rc::Rc::new(std::cell::RefCell::new(vec![]));
    let d = delays.clone();
    sim.on_packet_teardown(Box::new(move |_, packet, _| {
        d.borrow_mut().push(packet.timers.network);
    }));

    sim.run(RunOptions::default()).unwrap();
    assert_eq!(sim.counters.success, 5);

    // every packet visits exactly the one remote SFI
    for (_, sfis, state) in log.borrow().iter() {
        assert_eq!(state, &FinalState::Done);
        assert_eq!(sfis, &vec![sfi]);
    }
    // both link traversals cost 1000µs each
    for network in delays.borrow().iter() {
        assert_eq!(*network, 2_000);
    }
}

/// The full hop sequence of the remote detour:
/// ingress SFF, remote SFF, SFI, remote SFF, egress SFF.
#[test]
fn greedy_oracle_remote_path_hops() {
    let mut sim = Simulator::new(0);
    let sched = GreedyShortestDeadlineFirstScheduler::new(false, true, 0.1, 1.0).unwrap();
    let sff0 = sim.add_sff(Box::new(sched)).unwrap();
    let sched = GreedyShortestDeadlineFirstScheduler::new(false, true, 0.1, 1.0).unwrap();
    let sff1 = sim.add_sff(Box::new(sched)).unwrap();
    sim.topo.set_latency_distribution(0, vec![1000]);
    sim.topo.set_latency_distribution(1, vec![0]);
    sim.topo.add_link(sff0, sff1, 1000, 0, true).unwrap();

    sim.init_sf_types(1, 1);
    sim.set_sf_processing_rate(0, 15).unwrap();
    let server = sim.add_server(100, CpuPolicy::OneAtATime);
    let sfi = sim.add_sfi(server, 0, sff0).unwrap();

    sim.trace_packet_path = true;
    let hops = std::rc::Rc::new(std::cell::RefCell::new(vec![]));
    let h = hops.clone();
    sim.on_packet_teardown(Box::new(move |_, packet, _| {
        h.borrow_mut().push(packet.visited_hops.clone());
    }));

    let flow = sim.add_flow(vec![0], 10_000_000, sff1, sff1, 0).unwrap();
    sim.inject_packet(flow, 0, 1);
    sim.run(RunOptions::default()).unwrap();

    // the ingress SFF appears twice: once from the ingress, once when the
    // scheduler hands the packet back with its path
    assert_eq!(
        hops.borrow()[0],
        vec![
            Hop::Sff(sff1),
            Hop::Sff(sff1),
            Hop::Sff(sff0),
            Hop::Sfi(sfi),
            Hop::Sff(sff0),
            Hop::Sff(sff1),
        ]
    );
}

/// The reject scheduler rejects everything, with zero delay.
#[test]
fn reject_scheduler_rejects_all() {
    let mut sim = Simulator::new(0);
    let mut sffs = vec![];
    for _ in 0..3 {
        sffs.push(sim.add_sff(Box::new(RejectScheduler::default())).unwrap());
    }
    sim.topo.set_latency_distribution(0, vec![100]);
    for i in 0..3 {
        for j in (i + 1)..3 {
            sim.topo.add_link(sffs[i], sffs[j], 1000, 0, true).unwrap();
        }
    }
    sim.init_sf_types(1, 0);
    sim.set_sf_processing_rate(0, 15).unwrap();

    let flow = sim.add_flow(vec![0], 1_000_000, sffs[1], sffs[0], 0).unwrap();
    for i in 0..100 {
        sim.inject_packet(flow, i * 100, 1);
    }

    sim.run(RunOptions::default()).unwrap();
    assert_eq!(sim.counters.reject_schedule, 100);
    assert_eq!(sim.counters.success, 0);
    assert_eq!(sim.counters.timeout, 0);
    // rejection happens at the arrival instant
    assert_eq!(sim.counters.sum_delay, 0);
}

/// The round-robin scheduler spreads a stationary arrival process evenly
/// over identical SFIs (deviation O(√N)).
#[test]
fn round_robin_balances_identical_sfis() {
    let scheduler = LoadUnawareRoundRobinScheduler::new(true, true).unwrap();
    let (mut sim, sff, _) = single_sff(Box::new(scheduler), 4, 100, 500, CpuPolicy::OneAtATime);
    let log = record_outcomes(&mut sim);

    let n = 2_000u64;
    let flow = sim.add_flow(vec![0], 1_000_000_000, sff, sff, 0).unwrap();
    for i in 0..n {
        sim.inject_packet(flow, i * 1_000, 1);
    }

    sim.run(RunOptions::default()).unwrap();
    assert_eq!(sim.counters.success, n);

    let counts = sfi_visit_counts(&log.borrow(), 4);
    let expected = n as f64 / 4.0;
    let tolerance = 5.0 * (n as f64 * 0.25 * 0.75).sqrt();
    for count in counts {
        assert!(
            (count as f64 - expected).abs() < tolerance,
            "count {count} deviates from {expected} by more than {tolerance}"
        );
    }
}

/// A packet whose deadline cannot be met is dropped as timeout, not as an
/// error.
#[test]
fn tight_deadline_drops_as_timeout() {
    let scheduler = GreedyShortestDeadlineFirstScheduler::new(true, false, 0.1, 1.0).unwrap();
    let (mut sim, sff, _) = single_sff(Box::new(scheduler), 1, 100, 15, CpuPolicy::OneAtATime);
    // processing takes 666µs, the deadline allows 10µs
    let flow = sim.add_flow(vec![0], 10, sff, sff, 0).unwrap();
    sim.inject_packet(flow, 0, 1);
    sim.run(RunOptions::default()).unwrap();
    assert_eq!(sim.counters.timeout, 1);
    assert_eq!(sim.counters.success, 0);
    assert_eq!(sim.classes.drops_of(ClassId::from(0)), 1);
}
