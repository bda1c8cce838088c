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

//! Tests of the synthetic workload generator.

use crate::prelude::*;
use crate::workload::IngressSpec;

/// A bare simulator with one SFF and the SF table matching the default
/// traffic classes.
fn workload_host() -> (Simulator, SffId) {
    let scheduler = RejectScheduler::default();
    let mut sim = Simulator::new(7);
    let sff = sim.add_sff(Box::new(scheduler)).unwrap();
    sim.topo.set_latency_distribution(0, vec![0]);
    sim.topo.freeze();
    sim.init_sf_types(2, 0);
    sim.set_sf_processing_rate(0, 78).unwrap();
    sim.set_sf_processing_rate(1, 50).unwrap();
    (sim, sff)
}

/// The mean flow inter-arrival time matches the two-state Markov process:
/// `λ·(arrival_l·P(L) + arrival_h·P(H))` with the stationary distribution
/// `P(L) = (1−s_h)/(2−s_l−s_h)`.
#[test]
fn flow_inter_arrival_matches_markov_stationary_distribution() {
    let config = WorkloadConfig {
        workload_probability_factor: 1.0,
        workload_probability_stay_in_l: 0.8,
        workload_probability_stay_in_h: 0.4,
        workload_flow_arrival_l: 120,
        workload_flow_arrival_h: 15,
        workload_lambda: 60,
        workload_start_new_flows_till: 20_000_000,
        ..WorkloadConfig::default()
    };
    let (mut sim, _) = workload_host();
    let mut workload = SyntheticWorkload::new(11, config);
    workload.prepare(&mut sim).unwrap();

    // stationary distribution of the two-state chain
    let p_l = (1.0 - 0.4) / (2.0 - 0.8 - 0.4);
    let p_h = 1.0 - p_l;
    let expected_mean = 60.0 * (120.0 * p_l + 15.0 * p_h);
    let expected_flows = 20_000_000.0 / expected_mean;

    let flows = sim.num_flows() as f64;
    assert!(
        (flows - expected_flows).abs() < 0.2 * expected_flows,
        "created {flows} flows, expected about {expected_flows}"
    );
}

/// The generator produces the same ingress stream regardless of how it is
/// pulled.
#[test]
fn pull_pattern_does_not_change_the_stream() {
    let config = WorkloadConfig {
        workload_start_new_flows_till: 500_000,
        workload_packets_per_flow: 10,
        ..WorkloadConfig::default()
    };

    let collect = |chunk_hint: usize| -> Vec<(u64, usize)> {
        let (mut sim, _) = workload_host();
        let mut workload = SyntheticWorkload::new(5, config.clone());
        workload.prepare(&mut sim).unwrap();
        let mut specs: Vec<IngressSpec> = vec![];
        loop {
            // pull in bursts; the generator state must not care
            let mut pulled = 0;
            while pulled < chunk_hint {
                match workload.next_packet(&mut sim) {
                    Some(spec) => specs.push(spec),
                    None => return specs.iter().map(|s| (s.time, s.flow.index())).collect(),
                }
                pulled += 1;
            }
        }
    };

    assert_eq!(collect(1), collect(1000));
}

/// Packets of a flow never predate their flow, and every flow respects
/// the configured horizon.
#[test]
fn packets_follow_their_flows() {
    let config = WorkloadConfig {
        workload_start_new_flows_till: 500_000,
        workload_packets_per_flow: 5,
        ..WorkloadConfig::default()
    };
    let (mut sim, _) = workload_host();
    let mut workload = SyntheticWorkload::new(5, config);
    workload.prepare(&mut sim).unwrap();
    let mut count = 0;
    while let Some(spec) = workload.next_packet(&mut sim) {
        let flow = sim.flow(spec.flow);
        assert!(spec.time >= flow.start_time);
        assert!(flow.start_time < 500_000 + 60 * 120 * 10);
        count += 1;
    }
    assert!(count > 0);
}

/// An end-to-end run driven entirely by the synthetic workload.
#[test]
fn synthetic_workload_end_to_end() {
    let config = SimConfig {
        seed: 9,
        scheduler: "greedy".to_string(),
        scheduler_oracle: false,
        scheduler_incremental: true,
        workload: WorkloadConfig {
            workload_start_new_flows_till: 200_000,
            workload_packets_per_flow: 10,
            ..WorkloadConfig::default()
        },
        ..SimConfig::default()
    };
    let mut sim = build(&config, false).unwrap();
    sim.run(RunOptions::default()).unwrap();
    assert!(sim.counters.total > 0);
    assert!(sim.counters.success > 0);
    assert_eq!(
        sim.counters.total,
        sim.counters.success + sim.counters.reject_schedule + sim.counters.timeout
    );
}
