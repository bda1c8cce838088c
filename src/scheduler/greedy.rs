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

//! The greedy shortest-deadline-first scheduler.

use log::debug;

use super::{Scheduler, SchedulerCore};
use crate::simulator::Simulator;
use crate::types::{ClassId, ConfigError, Hop, SchedulingFailure, SffId, SfiId, SimError};

/// Greedy scheduler: for every remaining SF of the packet's chain (or only
/// the next one, when incremental), pick the SFI with the smallest expected
/// completion delay — queueing plus processing plus the connection latency
/// towards the SFI's SFF.
///
/// In oracle mode the candidate set spans all SFFs; otherwise only the
/// local SFF is considered and the ACP forwards packets the local SFIs
/// cannot (or should not) serve.
#[derive(Debug)]
pub struct GreedyShortestDeadlineFirstScheduler {
    core: SchedulerCore,
}

impl GreedyShortestDeadlineFirstScheduler {
    /// Create a new greedy scheduler. Non-oracle instances activate the
    /// ACP with the given admission thresholds.
    pub fn new(
        incremental: bool,
        oracle: bool,
        admission_control_threshold_low: f64,
        admission_control_threshold_high: f64,
    ) -> Result<Self, ConfigError> {
        let acp = (!oracle)
            .then_some((admission_control_threshold_low, admission_control_threshold_high));
        Ok(Self {
            core: SchedulerCore::new(incremental, oracle, acp)?,
        })
    }
}

impl Scheduler for GreedyShortestDeadlineFirstScheduler {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SchedulerCore {
        &mut self.core
    }

    fn is_always_able_to_build_full_path(&self) -> bool {
        self.core.oracle && !self.core.incremental
    }

    fn apply_scheduling_logic(
        &mut self,
        sim: &mut Simulator,
        class: ClassId,
    ) -> Result<(), SimError> {
        let my_sff = self.core.my_sff;
        let mut packet = sim.sffs[my_sff.index()]
            .queues
            .pop_newest(class)
            .expect("the arriving packet is at the back of its queue");
        let delta = packet.take_delta(sim.time());
        packet.timers.queue_scheduling += delta;

        self.core.mark_time_scheduling_starts();
        debug!("greedy scheduler of SFF{} handles packet {}", my_sff.index(), packet.id);

        // the packet starts its (remaining) path at this SFF
        let mut p_at_sff = my_sff;
        let mut scheduled_path: Vec<Hop> = vec![];
        let mut incremental_path = false;

        while !packet.to_be_visited.is_empty() && !incremental_path {
            let next_sf = packet.to_be_visited.pop_front().unwrap();

            let sffs_to_check: Vec<SffId> = if self.core.oracle {
                (0..sim.num_sffs()).map(SffId::new).collect()
            } else {
                vec![p_at_sff]
            };

            // all candidate SFIs with their expected completion delay
            let mut candidates: Vec<(f64, SffId, SfiId)> = vec![];
            let mut best_delay = f64::INFINITY;
            for sff_to_ask in sffs_to_check {
                let connection_delay = if p_at_sff == sff_to_ask {
                    0.0
                } else {
                    sim.topo.multi_hop_latency(p_at_sff, sff_to_ask)?
                };
                // an SFF further away than the best candidate cannot win
                if !candidates.is_empty() && best_delay <= connection_delay {
                    continue;
                }
                let sfis = match sim.sffs[sff_to_ask.index()].sfis_per_type.get(&next_sf) {
                    Some(sfis) => sfis.clone(),
                    None => continue,
                };
                for sfi in sfis {
                    let mut delay = (sim.sfi_expected_waiting_time(sfi)
                        + sim.sfi_expected_processing_time(sfi))
                        as f64;
                    if p_at_sff != sff_to_ask {
                        delay += connection_delay;
                    }
                    best_delay = best_delay.min(delay);
                    candidates.push((delay, sff_to_ask, sfi));
                }
            }

            if candidates.is_empty() {
                if !self.core.oracle {
                    return Err(SimError::Inconsistency(format!(
                        "SFF{} has no SFI of type {next_sf}, \
                         but the ACP should have forwarded this packet",
                        my_sff.index()
                    )));
                }
                packet.real_scheduling += self.core.take_scheduling_time();
                let sfc = sim.flow(packet.flow).sf_type_chain.clone();
                sim.packet_reject(packet);
                return Err(SchedulingFailure(format!("{sfc:?}")).into());
            }

            // the minimum; among equals, prefer staying where the packet is
            let mut best = candidates[0];
            for candidate in &candidates {
                if candidate.0 <= best.0 && (candidate.0 != best.0 || candidate.1 == p_at_sff) {
                    best = *candidate;
                }
            }
            let (_, target_sff, target_sfi) = best;
            debug!("found an SFI at SFF{}", target_sff.index());

            if p_at_sff != target_sff {
                // when the previous stop is an SFI, the packet first has to
                // bounce back to that SFI's SFF
                if matches!(scheduled_path.last(), Some(Hop::Sfi(_))) {
                    scheduled_path.push(Hop::Sff(p_at_sff));
                }
                for hop in sim.topo.full_path_ids(p_at_sff, target_sff)? {
                    scheduled_path.push(Hop::Sff(hop));
                }
                p_at_sff = target_sff;
            }
            scheduled_path.push(Hop::Sfi(target_sfi));

            if self.core.incremental {
                // stop scheduling here and return to the SFF for the rest
                incremental_path = true;
                scheduled_path.push(Hop::Sff(target_sff));
            }
        }

        if !incremental_path {
            // finally, add the path to the desired egress
            let egress = sim.flow(packet.flow).desired_egress;
            if p_at_sff != egress {
                scheduled_path.push(Hop::Sff(p_at_sff));
                for hop in sim.topo.full_path_ids(p_at_sff, egress)? {
                    scheduled_path.push(Hop::Sff(hop));
                }
            } else {
                scheduled_path.push(Hop::Sff(egress));
            }
        }

        packet.full_path.extend(scheduled_path);
        self.core.scheduling_attempts += 1;
        packet.real_scheduling += self.core.take_scheduling_time();
        sim.sff_handle_from_scheduler(my_sff, packet)
    }
}
