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

//! The synthetic workload generator.
//!
//! Flow arrivals follow a two-state Markov process (low/high arrival
//! intensity); packet arrivals within a flow are Poisson-distributed
//! offsets from the flow start. The generator is a *lazy, resumable*
//! iterator: the simulator pulls the next slice of ingress packets
//! whenever the event horizon comes close to exhaustion. It owns its RNG,
//! so the produced stream is independent of when (and how often) it is
//! pulled.

use std::collections::{BTreeMap, VecDeque};

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};

use crate::simulator::Simulator;
use crate::types::{FlowId, SfType, SffId, SimError, SimTime, MICROS_PER_SEC};

/// One packet to inject, produced by a [`Workload`].
#[derive(Debug, Clone, Copy)]
pub struct IngressSpec {
    /// Ingress time of the packet.
    pub time: SimTime,
    /// The flow the packet belongs to.
    pub flow: FlowId,
    /// Size of the packet in link-bandwidth units.
    pub transmission_size: u64,
}

/// A pull-based workload: the simulator asks for packets one by one.
pub trait Workload: std::fmt::Debug {
    /// The time until which new flows are started.
    fn expected_end_time(&self) -> SimTime;

    /// Produce the next packet, or `None` when the workload is exhausted.
    fn next_packet(&mut self, sim: &mut Simulator) -> Option<IngressSpec>;
}

/// Configuration of the [`SyntheticWorkload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// New flows are started until this time (µs).
    pub workload_start_new_flows_till: SimTime,
    /// Probability to stay in the low-intensity state.
    pub workload_probability_stay_in_l: f64,
    /// Probability to stay in the high-intensity state.
    pub workload_probability_stay_in_h: f64,
    /// Factor applied to both stay probabilities.
    pub workload_probability_factor: f64,
    /// Expected flow inter-arrival in the low state (scaled by lambda).
    pub workload_flow_arrival_l: u64,
    /// Expected flow inter-arrival in the high state (scaled by lambda).
    pub workload_flow_arrival_h: u64,
    /// Scaling factor for both flow inter-arrival times.
    pub workload_lambda: u64,
    /// Expected packet arrival offset within a flow (µs).
    pub workload_packet_inter_arrival_expected_time: u64,
    /// Expected number of packets per flow.
    pub workload_packets_per_flow: u64,
    /// Number of SF types in the simulation.
    pub number_of_sf_types: usize,
    /// Processing rate per SF type (packets per second per share).
    pub sf_processing_rate: Vec<u64>,
    /// The SFC traffic classes.
    #[serde(rename = "tClasses")]
    pub t_classes: Vec<Vec<SfType>>,
    /// The per-class deadline is the chain's pure processing time scaled by
    /// this factor.
    pub workload_deadline_scaling: f64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            workload_start_new_flows_till: 10 * MICROS_PER_SEC,
            workload_probability_stay_in_l: 0.8,
            workload_probability_stay_in_h: 0.4,
            workload_probability_factor: 0.8,
            workload_flow_arrival_l: 120,
            workload_flow_arrival_h: 15,
            workload_lambda: 60,
            workload_packet_inter_arrival_expected_time: 800,
            workload_packets_per_flow: 150,
            number_of_sf_types: 2,
            // normalized to servers with a capacity of 80
            sf_processing_rate: vec![1_000_000 / 160 / 80, 1_000_000 / 250 / 80],
            t_classes: vec![vec![0, 1], vec![0], vec![1]],
            workload_deadline_scaling: 10.0,
        }
    }
}

impl WorkloadConfig {
    /// The pure processing delay of each traffic class: the sum of
    /// `1s / rate` over its chain.
    pub fn deadline_per_packet(&self) -> Vec<SimTime> {
        self.t_classes
            .iter()
            .map(|chain| {
                chain
                    .iter()
                    .map(|sf| MICROS_PER_SEC / self.sf_processing_rate[*sf])
                    .sum()
            })
            .collect()
    }

    /// The effective per-class deadlines (scaled).
    pub fn effective_deadlines(&self) -> Vec<SimTime> {
        self.deadline_per_packet()
            .iter()
            .map(|d| (self.workload_deadline_scaling * *d as f64) as SimTime)
            .collect()
    }

    /// The burstiness of the two-state Markov flow arrival process:
    /// `1/p_stay_h + 1/p_stay_l` (with the factor applied).
    pub fn burstiness(&self) -> f64 {
        let stay_l = self.workload_probability_stay_in_l * self.workload_probability_factor;
        let stay_h = self.workload_probability_stay_in_h * self.workload_probability_factor;
        1.0 / stay_h + 1.0 / stay_l
    }
}

/// Per-SF demand of a workload (see
/// [`SyntheticWorkload::demand_report`]).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SfDemand {
    /// Total number of packets to process.
    pub packets: f64,
    /// Packets per second.
    pub packets_per_second: f64,
    /// Required processing capacity (shares) to keep up.
    pub required_capacity: f64,
}

/// The synthetic two-state Markov workload generator.
#[derive(Debug)]
pub struct SyntheticWorkload {
    config: WorkloadConfig,
    rng: StdRng,
    flows: VecDeque<FlowId>,
    flow_sizes: Vec<u64>,
    current: Option<(FlowId, u64)>,
    prepared: bool,
}

impl SyntheticWorkload {
    /// Create a generator with its own RNG seed.
    pub fn new(seed: u64, config: WorkloadConfig) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            flows: VecDeque::new(),
            flow_sizes: Vec::new(),
            current: None,
            prepared: false,
        }
    }

    /// The workload configuration.
    pub fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    fn poisson(&mut self, mean: f64) -> u64 {
        if mean <= 0.0 {
            return 0;
        }
        Poisson::new(mean).expect("positive mean").sample(&mut self.rng) as u64
    }

    /// Create all flows of the workload (this registers their packet
    /// classes). Must be called before the simulation starts; packets are
    /// then produced lazily.
    pub fn prepare(&mut self, sim: &mut Simulator) -> Result<(), SimError> {
        assert!(!self.prepared, "the workload is already prepared");
        self.prepared = true;

        let deadlines = self.config.effective_deadlines();
        debug!("effective deadlines: {deadlines:?}");
        info!("workload has a burstiness of {}", self.config.burstiness());

        let stay_l = self.config.workload_probability_stay_in_l
            * self.config.workload_probability_factor;
        let stay_h = self.config.workload_probability_stay_in_h
            * self.config.workload_probability_factor;
        let arrival_l = (self.config.workload_lambda * self.config.workload_flow_arrival_l) as f64;
        let arrival_h = (self.config.workload_lambda * self.config.workload_flow_arrival_h) as f64;
        let start_new_flows_till = self.config.workload_start_new_flows_till;

        let num_sffs = sim.num_sffs();
        let mut high_state = false;
        let mut flows: Vec<FlowId> = vec![];
        let mut total_hops = 0usize;

        for ingress in (0..num_sffs).map(SffId::new) {
            let mut flow_start_time: SimTime = 0;
            while flow_start_time < start_new_flows_till {
                // switch the state of the flow arrival intensity?
                if high_state {
                    if self.rng.gen::<f64>() > stay_h {
                        high_state = false;
                    }
                } else if self.rng.gen::<f64>() > stay_l {
                    high_state = true;
                }
                let mean = if high_state { arrival_h } else { arrival_l };
                flow_start_time += self.poisson(mean);

                let egress = SffId::new(self.rng.gen_range(0..num_sffs));
                let class_index = self.rng.gen_range(0..self.config.t_classes.len());
                let chain = self.config.t_classes[class_index].clone();
                total_hops += chain.len();

                let flow = sim.add_flow(
                    chain,
                    deadlines[class_index],
                    egress,
                    ingress,
                    flow_start_time,
                )?;
                flows.push(flow);
            }
        }

        flows.sort_by_key(|f| sim.flow(*f).start_time);
        info!(
            "created {} flows with {total_hops} hops in total, \
             i.e., a scheduler has to take at least that many decisions",
            flows.len()
        );

        self.flow_sizes = (0..flows.len())
            .map(|_| self.poisson(self.config.workload_packets_per_flow as f64))
            .collect();
        self.flows = flows.into();
        Ok(())
    }

    /// Per-SF-type demand of the prepared workload. Only meaningful before
    /// packets were pulled.
    pub fn demand_report(&self, sim: &Simulator) -> BTreeMap<SfType, SfDemand> {
        let mut report: BTreeMap<SfType, SfDemand> = (0..self.config.number_of_sf_types)
            .map(|sf| (sf, SfDemand::default()))
            .collect();
        let flow_size = self.config.workload_packets_per_flow as f64;
        for flow in &self.flows {
            for sf in &sim.flow(*flow).sf_type_chain {
                report.get_mut(sf).expect("sf types validated").packets += flow_size;
            }
        }
        let expected_secs = self.expected_end_time() as f64 / MICROS_PER_SEC as f64;
        for (sf, demand) in report.iter_mut() {
            demand.packets_per_second = demand.packets / expected_secs;
            demand.required_capacity =
                demand.packets_per_second / self.config.sf_processing_rate[*sf] as f64;
        }
        report
    }
}

impl Workload for SyntheticWorkload {
    fn expected_end_time(&self) -> SimTime {
        self.config.workload_start_new_flows_till
    }

    fn next_packet(&mut self, sim: &mut Simulator) -> Option<IngressSpec> {
        assert!(self.prepared, "prepare() must run before the simulation");
        loop {
            if let Some((flow, remaining)) = self.current.as_mut() {
                if *remaining > 0 {
                    *remaining -= 1;
                    let flow = *flow;
                    let start = sim.flow(flow).start_time;
                    let offset =
                        self.poisson(self.config.workload_packet_inter_arrival_expected_time as f64);
                    return Some(IngressSpec {
                        time: start + offset,
                        flow,
                        transmission_size: 1,
                    });
                }
                self.current = None;
            }
            let flow = self.flows.pop_front()?;
            let size = self.flow_sizes.pop().unwrap_or(0);
            self.current = Some((flow, size));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burstiness_of_default_markov_process() {
        let config = WorkloadConfig {
            workload_probability_factor: 1.0,
            ..WorkloadConfig::default()
        };
        // 1/0.4 + 1/0.8
        assert!((config.burstiness() - 3.75).abs() < 1e-9);
    }

    #[test]
    fn deadlines_follow_processing_rates() {
        let config = WorkloadConfig::default();
        let deadlines = config.deadline_per_packet();
        assert_eq!(deadlines.len(), 3);
        // chain [0, 1] is the sum of the two single chains
        assert_eq!(deadlines[0], deadlines[1] + deadlines[2]);
        let effective = config.effective_deadlines();
        assert_eq!(effective[1], deadlines[1] * 10);
    }
}
