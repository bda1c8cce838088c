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

//! Tests of the MPP max-weight scheduler.

use super::record_outcomes;
use crate::prelude::*;

/// One SFF, one server hosting an SFI of SF 0 and one of SF 1, MPP with
/// batch 1 and one packet underway.
fn mpp_sim(options: MppOptions) -> (Simulator, SffId) {
    let mut sim = Simulator::new(0);
    let scheduler = MppScheduler::new(&mut sim, options).unwrap();
    let sff = sim.add_sff(Box::new(scheduler)).unwrap();
    sim.topo.set_latency_distribution(0, vec![0]);
    sim.topo.freeze();
    sim.init_sf_types(2, 0);
    sim.set_sf_processing_rate(0, 15).unwrap();
    sim.set_sf_processing_rate(1, 15).unwrap();
    let server = sim.add_server(100, CpuPolicy::OneAtATime);
    sim.add_sfi(server, 0, sff).unwrap();
    sim.add_sfi(server, 1, sff).unwrap();
    (sim, sff)
}

/// Invalid batching configurations are rejected.
#[test]
fn mpp_configuration_validated() {
    let mut sim = Simulator::new(0);
    assert!(matches!(
        MppScheduler::new(
            &mut sim,
            MppOptions {
                allow_underway_per_server: 0,
                ..MppOptions::default()
            }
        ),
        Err(ConfigError::UnderwayTooSmall)
    ));
    assert!(matches!(
        MppScheduler::new(
            &mut sim,
            MppOptions {
                allow_underway_per_server: 1,
                batch_scheduling: 2,
                ..MppOptions::default()
            }
        ),
        Err(ConfigError::BatchExceedsUnderway { .. })
    ));
}

/// With equal queue lengths, the class with the smaller deadline wins (its
/// deadline weight α is larger).
#[test]
fn mpp_smaller_deadline_wins() {
    let (mut sim, sff) = mpp_sim(MppOptions::default());
    let log = record_outcomes(&mut sim);

    // two classes served by the same SF-0 instance, deadlines 10s and 1s
    let flow_slow = sim.add_flow(vec![0, 1], 10_000_000, sff, sff, 0).unwrap();
    let flow_fast = sim.add_flow(vec![0], 1_000_000, sff, sff, 0).unwrap();

    // the first packet occupies the server, the next two queue up
    sim.inject_packet(flow_fast, 0, 1);
    sim.inject_packet(flow_slow, 50, 1);
    sim.inject_packet(flow_fast, 60, 1);

    sim.run(RunOptions::default()).unwrap();
    assert_eq!(sim.counters.success, 3);

    // completion order: the occupant, then the fast class, then the slow
    let order: Vec<FlowId> = log.borrow().iter().map(|(flow, _, _)| *flow).collect();
    assert_eq!(order, vec![flow_fast, flow_fast, flow_slow]);
}

/// A scheduling pass dispatches up to `batch` packets along the winning
/// activity, then re-evaluates the eligible servers.
#[test]
fn mpp_batch_dispatch() {
    let (mut sim, sff) = mpp_sim(MppOptions {
        allow_underway_per_server: 2,
        batch_scheduling: 2,
        ..MppOptions::default()
    });

    let flow = sim.add_flow(vec![0], 1_000_000_000, sff, sff, 0).unwrap();
    // one occupant, then four packets that arrive while the server is busy
    sim.inject_packet(flow, 0, 1);
    for i in 0..4 {
        sim.inject_packet(flow, 10 + i, 1);
    }

    let stats = sim.run(RunOptions::default()).unwrap();
    assert_eq!(sim.counters.success, 5);
    // one decision for the occupant, then two batches of two
    assert_eq!(stats.total_scheduling_attempts, 3);
}

/// The underway accounting returns to zero once everything is processed.
#[test]
fn mpp_underway_accounting_drains() {
    let (mut sim, sff) = mpp_sim(MppOptions::default());
    let flow = sim.add_flow(vec![0, 1], 10_000_000, sff, sff, 0).unwrap();
    for i in 0..5 {
        sim.inject_packet(flow, i * 100, 1);
    }
    sim.run(RunOptions::default()).unwrap();
    assert_eq!(sim.counters.success, 5);
    assert!(sim.mpp.underway.iter().all(|u| *u == 0));
}

/// With the arrival rate below the service rate, queues stay bounded over
/// a long run.
#[test]
fn mpp_stable_under_light_load() {
    let (mut sim, sff) = mpp_sim(MppOptions::default());

    // service time is 666µs, packets arrive every 1000µs
    let flow = sim.add_flow(vec![0], 1_000_000_000, sff, sff, 0).unwrap();
    let n = 200u64;
    for i in 0..n {
        sim.inject_packet(flow, i * 1_000, 1);
    }

    let max_queued = std::rc::Rc::new(std::cell::RefCell::new(0usize));
    let tracker = max_queued.clone();
    sim.activate_statistics_polling(500);
    sim.on_poll(Box::new(move |sim| {
        let queued = sim.sff(sff).num_queued_packets();
        let mut max = tracker.borrow_mut();
        *max = (*max).max(queued);
    }));

    sim.run(RunOptions::default()).unwrap();
    assert_eq!(sim.counters.success, n);
    assert!(
        *max_queued.borrow() < 20,
        "queues grew to {} under light load",
        max_queued.borrow()
    );
}

/// Stepping processes one relevant event at a time and eventually drains
/// the simulation.
#[test]
fn mpp_interactive_stepping() {
    let (mut sim, sff) = mpp_sim(MppOptions::default());
    let flow = sim.add_flow(vec![0], 1_000_000, sff, sff, 0).unwrap();
    sim.inject_packet(flow, 0, 1);

    let mut steps = 0;
    while sim.run_one_step().unwrap() {
        steps += 1;
        assert!(steps < 1_000, "stepping does not terminate");
    }
    assert!(steps > 0);
    assert_eq!(sim.counters.success, 1);
}

/// MPP only supports the one-at-a-time CPU policy.
#[test]
fn mpp_capability_predicates() {
    let (sim, sff) = mpp_sim(MppOptions::default());
    sim.scheduler(sff, |s| {
        assert!(s.requires_queues_per_class());
        assert!(!s.is_always_able_to_build_full_path());
        assert!(s.supports_cpu_policy(CpuPolicy::OneAtATime));
        assert!(!s.supports_cpu_policy(CpuPolicy::Dynamic));
        assert!(!s.supports_cpu_policy(CpuPolicy::Static));
        assert!(!s.applies_round_robin());
    });
}
