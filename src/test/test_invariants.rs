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

//! Cross-cutting invariants: timing decomposition, packet conservation,
//! CPU share policies, and determinism.

use std::cell::RefCell;
use std::rc::Rc;

use super::single_sff;
use crate::config::{build, SimConfig};
use crate::prelude::*;

/// A small two-site scenario with a local greedy scheduler.
fn small_config() -> SimConfig {
    SimConfig {
        seed: 3,
        sites: 2,
        number_of_total_sfis: 8,
        number_of_servers_per_site: vec![2, 2],
        number_of_sff_per_site: vec![1, 1],
        scheduler: "greedy".to_string(),
        scheduler_incremental: true,
        scheduler_oracle: false,
        workload: WorkloadConfig {
            workload_start_new_flows_till: 300_000,
            workload_packets_per_flow: 20,
            ..WorkloadConfig::default()
        },
        ..SimConfig::default()
    }
}

/// For every packet reaching a terminal state, the end-to-end delay equals
/// the sum of the five timing buckets.
#[test]
fn delay_decomposes_into_timer_buckets() {
    let mut sim = build(&small_config(), false).unwrap();
    let checked = Rc::new(RefCell::new(0u64));
    let counter = checked.clone();
    sim.on_packet_teardown(Box::new(move |time, packet, _| {
        assert_eq!(
            packet.delay(time),
            packet.timers.total(),
            "packet {} has an inconsistent timing decomposition",
            packet.id
        );
        *counter.borrow_mut() += 1;
    }));
    sim.run(RunOptions::default()).unwrap();
    assert!(*checked.borrow() > 100, "the scenario produced no packets");
}

/// Every created packet ends up in exactly one terminal bucket.
#[test]
fn packet_conservation() {
    let mut sim = build(&small_config(), false).unwrap();
    sim.run(RunOptions::default()).unwrap();
    let c = sim.counters;
    assert!(c.total > 0);
    assert_eq!(c.in_system, 0);
    assert_eq!(c.total, c.success + c.reject_schedule + c.timeout);
}

/// Stopping at the workload end sweeps all remaining packets into their
/// terminal buckets, preserving conservation.
#[test]
fn packet_conservation_with_early_stop() {
    let mut sim = build(&small_config(), false).unwrap();
    sim.run(RunOptions {
        stop_when_workload_over: true,
        ..RunOptions::default()
    })
    .unwrap();
    let c = sim.counters;
    assert_eq!(c.in_system, 0);
    assert_eq!(c.total, c.success + c.reject_schedule + c.timeout);
}

/// Two runs with the same seed and configuration produce identical
/// outcomes; materializing the workload up front instead of pulling it
/// lazily does not change anything either.
#[test]
fn runs_are_deterministic() {
    let run = |fetch_all| {
        let mut sim = build(&small_config(), fetch_all).unwrap();
        sim.run(RunOptions::default()).unwrap();
        (
            sim.counters.total,
            sim.counters.success,
            sim.counters.reject_schedule,
            sim.counters.timeout,
            sim.counters.sum_delay,
            sim.counters.put_on_wire,
        )
    };
    let lazy_a = run(false);
    let lazy_b = run(false);
    let eager = run(true);
    assert_eq!(lazy_a, lazy_b);
    assert_eq!(lazy_a, eager);
}

/// Under one-at-a-time, at most one SFI per server is busy at any time,
/// and the busy one holds the full capacity.
#[test]
fn one_at_a_time_exclusive_shares() {
    let scheduler = GreedyShortestDeadlineFirstScheduler::new(true, false, 0.1, 1.0).unwrap();
    let mut sim = Simulator::new(0);
    let sff = sim.add_sff(Box::new(scheduler)).unwrap();
    sim.topo.set_latency_distribution(0, vec![0]);
    sim.topo.freeze();
    sim.init_sf_types(2, 0);
    sim.set_sf_processing_rate(0, 15).unwrap();
    sim.set_sf_processing_rate(1, 15).unwrap();
    // both SFIs share one server
    let server = sim.add_server(100, CpuPolicy::OneAtATime);
    sim.add_sfi(server, 0, sff).unwrap();
    sim.add_sfi(server, 1, sff).unwrap();

    sim.activate_statistics_polling(100);
    sim.on_poll(Box::new(move |sim| {
        let srv = sim.server(server);
        let busy: Vec<_> = srv
            .sfis
            .iter()
            .filter(|sfi| !sim.sfi(**sfi).free)
            .collect();
        assert!(busy.len() <= 1);
        if let Some(sfi) = busy.first() {
            assert_eq!(srv.available_shares, 0);
            assert_eq!(sim.sfi(**sfi).cpu_shares, srv.processing_cap);
        }
    }));

    let flow_a = sim.add_flow(vec![0], 1_000_000_000, sff, sff, 0).unwrap();
    let flow_b = sim.add_flow(vec![1], 1_000_000_000, sff, sff, 0).unwrap();
    for i in 0..50 {
        sim.inject_packet(flow_a, i * 200, 1);
        sim.inject_packet(flow_b, i * 200 + 100, 1);
    }
    sim.run(RunOptions::default()).unwrap();
    assert_eq!(sim.counters.success, 100);
}

/// Under the static policy, all SFIs hold equal weights and the implied
/// shares never exceed the capacity.
#[test]
fn static_policy_splits_equally() {
    let scheduler = GreedyShortestDeadlineFirstScheduler::new(true, false, 0.1, 1.0).unwrap();
    let mut sim = Simulator::new(0);
    let sff = sim.add_sff(Box::new(scheduler)).unwrap();
    sim.topo.set_latency_distribution(0, vec![0]);
    sim.topo.freeze();
    sim.init_sf_types(3, 0);
    for sf in 0..3 {
        sim.set_sf_processing_rate(sf, 100).unwrap();
    }
    let server = sim.add_server(10, CpuPolicy::Static);
    let sfis: Vec<_> = (0..3).map(|sf| sim.add_sfi(server, sf, sff).unwrap()).collect();

    // granularity 10_000, 3 SFIs: weight 3333 each, 3 shares each
    let shares: Vec<u64> = sfis.iter().map(|sfi| sim.sfi(*sfi).cpu_shares).collect();
    assert_eq!(shares, vec![3, 3, 3]);
    assert_eq!(sim.server(server).available_shares, 1);
}

/// Over-subscribing a static server is a configuration error.
#[test]
fn static_policy_rejects_oversubscription() {
    let scheduler = GreedyShortestDeadlineFirstScheduler::new(true, false, 0.1, 1.0).unwrap();
    let mut sim = Simulator::new(0);
    let sff = sim.add_sff(Box::new(scheduler)).unwrap();
    sim.topo.set_latency_distribution(0, vec![0]);
    sim.topo.freeze();
    sim.init_sf_types(3, 0);
    for sf in 0..3 {
        sim.set_sf_processing_rate(sf, 100).unwrap();
    }
    let server = sim.add_server(2, CpuPolicy::Static);
    sim.add_sfi(server, 0, sff).unwrap();
    sim.add_sfi(server, 1, sff).unwrap();
    assert!(matches!(
        sim.add_sfi(server, 2, sff),
        Err(ConfigError::ServerOversubscribed { .. })
    ));
}

/// Dynamic weights rebalance proportionally to queue lengths, and every
/// SFI always keeps at least one share.
#[test]
fn dynamic_policy_rebalances() {
    let scheduler = GreedyShortestDeadlineFirstScheduler::new(true, false, 0.1, 1.0).unwrap();
    let mut sim = Simulator::new(0);
    let sff = sim.add_sff(Box::new(scheduler)).unwrap();
    sim.topo.set_latency_distribution(0, vec![0]);
    sim.topo.freeze();
    sim.init_sf_types(2, 0);
    sim.set_sf_processing_rate(0, 100).unwrap();
    sim.set_sf_processing_rate(1, 100).unwrap();
    let server = sim.add_server(10, CpuPolicy::Dynamic);
    let sfi_a = sim.add_sfi(server, 0, sff).unwrap();
    let sfi_b = sim.add_sfi(server, 1, sff).unwrap();

    // empty queues: the capacity splits evenly
    assert_eq!(sim.sfi(sfi_a).cpu_shares, 5);
    assert_eq!(sim.sfi(sfi_b).cpu_shares, 5);
    assert!(sim.sfi(sfi_a).cpu_shares >= 1 && sim.sfi(sfi_b).cpu_shares >= 1);
}

/// The statistics recorders capture every packet and the polled gauges.
#[test]
fn statistics_recorders_capture_the_run() {
    use crate::stats::{
        record_packet_statistics, record_polling_statistics, Cell, MemoryKvSink, MemoryRowSink,
        PollingFlags,
    };

    let mut sim = build(&small_config(), false).unwrap();
    let rows = Rc::new(RefCell::new(MemoryRowSink::default()));
    record_packet_statistics(&mut sim, rows.clone());
    let gauges = Rc::new(RefCell::new(MemoryKvSink::default()));
    record_polling_statistics(
        &mut sim,
        PollingFlags {
            overview: true,
            sff: true,
            ..PollingFlags::default()
        },
        gauges.clone(),
    );

    sim.run(RunOptions::default()).unwrap();

    assert_eq!(rows.borrow().rows.len() as u64, sim.counters.total);
    for row in rows.borrow().rows.iter() {
        // delay equals the sum of the five time buckets
        let (Cell::Time(delay), Cell::Time(p), Cell::Time(n)) = (&row[4], &row[5], &row[6]) else {
            panic!("unexpected cell types");
        };
        let (Cell::Time(qp), Cell::Time(qn), Cell::Time(qs)) = (&row[7], &row[8], &row[9]) else {
            panic!("unexpected cell types");
        };
        assert_eq!(*delay, p + n + qp + qn + qs);
    }
    assert!(gauges
        .borrow()
        .entries
        .iter()
        .any(|(_, key, _)| key == "overview.packet_in_system"));
}

/// Creating a flow with a new SFC after the simulation started is an
/// error.
#[test]
fn no_new_sfc_after_start() {
    let scheduler = GreedyShortestDeadlineFirstScheduler::new(true, false, 0.1, 1.0).unwrap();
    let (mut sim, sff, _) = single_sff(Box::new(scheduler), 1, 100, 15, CpuPolicy::OneAtATime);
    let flow = sim.add_flow(vec![0], 1_000_000, sff, sff, 0).unwrap();
    sim.inject_packet(flow, 0, 1);
    sim.run(RunOptions::default()).unwrap();

    // the same SFC is fine, a new combination is not
    assert!(sim.add_flow(vec![0], 1_000_000, sff, sff, 0).is_ok());
    assert!(matches!(
        sim.add_flow(vec![0, 0], 1_000_000, sff, sff, 0),
        Err(ConfigError::SfcRegisteredAfterStart)
    ));
}
