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

//! The load-unaware weighted round-robin scheduler.

use log::debug;

use super::{Scheduler, SchedulerCore};
use crate::simulator::Simulator;
use crate::types::{ClassId, ConfigError, Hop, SchedulingFailure, SimError};

/// Load-unaware scheduler: for every required SF type, sample a target SFI
/// proportionally to the static processing rates of all SFIs of that type
/// (including the own SFF's). Over many packets this spreads the load in a
/// weighted round-robin fashion, ignoring current queue lengths.
#[derive(Debug)]
pub struct LoadUnawareRoundRobinScheduler {
    core: SchedulerCore,
}

impl LoadUnawareRoundRobinScheduler {
    /// Create a new round-robin scheduler.
    pub fn new(incremental: bool, oracle: bool) -> Result<Self, ConfigError> {
        Ok(Self {
            core: SchedulerCore::new(incremental, oracle, None)?,
        })
    }
}

impl Scheduler for LoadUnawareRoundRobinScheduler {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SchedulerCore {
        &mut self.core
    }

    fn applies_round_robin(&self) -> bool {
        true
    }

    fn is_always_able_to_build_full_path(&self) -> bool {
        !self.core.incremental
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

        let mut p_at_sff = my_sff;
        let mut scheduled_path: Vec<Hop> = vec![];

        while !packet.to_be_visited.is_empty() {
            let next_sf = packet.to_be_visited.pop_front().unwrap();

            if self.core.sfi_rates.is_none() {
                self.core.update_sfi_rates(sim, true);
            }
            let table = self.core.sfi_rates.as_ref().expect("just initialized");
            if !table.has_entries(next_sf) {
                packet.real_scheduling += self.core.take_scheduling_time();
                debug!("no SFI of type {next_sf} known, rejecting packet {}", packet.id);
                let id = packet.id;
                sim.packet_reject(packet);
                return Err(SchedulingFailure(format!("packet {id}")).into());
            }

            let target_sfi = table.sample(next_sf, &mut sim.rng);
            let target_sff = sim.sfis[target_sfi.index()].sff;

            if p_at_sff != target_sff {
                // the packet may sit at an SFI; it then first bounces back
                // to that SFI's SFF before moving on
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
                scheduled_path.push(Hop::Sff(target_sff));
                break;
            }
        }

        if !self.core.incremental {
            // complete the path down to the desired egress
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
