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

//! The MPP max-weight scheduler.
//!
//! Scheduling decisions are *activities*: triples of (source SFF, packet
//! class, target SFI). Every activity has a static rate in the `R` matrix,
//! derived from the SFI's processing time, the connection latency from the
//! source SFF, and a deadline weighting `α = max_deadline² / deadline²`.
//! Per pass, the scheduler computes for every eligible server the activity
//! with the maximum *p-value* — the activity rate times the source queue
//! length, with backpressure from the queue of the next chain class — and
//! dispatches a batch of packets along the globally best activity.
//!
//! Dispatched packets count against their target server's *underway*
//! budget; the budget is released when the SFI finishes (or the packet is
//! dropped mid-flight), which in turn triggers the schedulers of all SFFs
//! that reach the server.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace};
use rand::seq::SliceRandom;

use super::{Scheduler, SchedulerCore};
use crate::event::Event;
use crate::model::{DropAction, Packet};
use crate::simulator::Simulator;
use crate::types::{
    ClassId, ConfigError, CpuPolicy, Hop, ServerId, SfType, SffId, SfiId, SimError,
};

/// Options for the [`MppScheduler`].
#[derive(Debug, Clone)]
pub struct MppOptions {
    /// Whether the scheduler sees all SFFs and servers, or only its own.
    pub oracle: bool,
    /// How many packets may be underway towards one server at a time.
    pub allow_underway_per_server: u32,
    /// How many packets one scheduling decision dispatches at most.
    pub batch_scheduling: u32,
    /// Weight classes by their deadline (`α = max_deadline² / deadline²`).
    pub consider_alpha_by_using_timeouts: bool,
    /// Do not consider an SFI again while a packet is on the wire to it.
    pub block_sfi_while_packet_on_wire: bool,
    /// ACP lower admission threshold (non-oracle mode only).
    pub admission_control_threshold_low: f64,
    /// ACP upper admission threshold (non-oracle mode only).
    pub admission_control_threshold_high: f64,
}

impl Default for MppOptions {
    fn default() -> Self {
        Self {
            oracle: true,
            allow_underway_per_server: 1,
            batch_scheduling: 1,
            consider_alpha_by_using_timeouts: true,
            block_sfi_while_packet_on_wire: false,
            admission_control_threshold_low: 0.1,
            admission_control_threshold_high: 1.3,
        }
    }
}

/// State shared by all MPP scheduler instances, owned by the simulator: the
/// activity rate matrix, the per-server underway accounting, and the
/// per-SFF free-server counters.
#[derive(Debug, Default)]
pub(crate) struct MppState {
    pub(crate) batch: Option<u32>,
    pub(crate) allow_underway: u32,
    pub(crate) block_sfi_while_on_wire: bool,
    map_server_to_classes: Option<BTreeMap<ServerId, Vec<ClassId>>>,
    r_matrix: Option<Vec<f64>>,
    pub(crate) underway: Vec<u32>,
    free_server_count: BTreeMap<SffId, i64>,
    blocked_sfis: BTreeSet<SfiId>,
}

impl MppState {
    fn free_count(&self, sff: SffId) -> i64 {
        // -1 means "never triggered": the first trigger always runs
        self.free_server_count.get(&sff).copied().unwrap_or(-1)
    }
}

/// The MPP max-weight scheduler. Requires per-class queues and the
/// `one-at-a-time` CPU policy (the `R` matrix is static).
#[derive(Debug)]
pub struct MppScheduler {
    core: SchedulerCore,
    consider_alpha_by_using_timeouts: bool,
    accessible_sf: Option<BTreeSet<SfType>>,
}

impl MppScheduler {
    /// Create a new MPP scheduler. All instances of one simulation share
    /// the underway accounting and must agree on the batch size.
    pub fn new(sim: &mut Simulator, options: MppOptions) -> Result<Self, ConfigError> {
        if options.allow_underway_per_server < 1 {
            return Err(ConfigError::UnderwayTooSmall);
        }
        if options.allow_underway_per_server < options.batch_scheduling {
            return Err(ConfigError::BatchExceedsUnderway {
                batch: options.batch_scheduling,
                allow: options.allow_underway_per_server,
            });
        }
        match sim.mpp.batch {
            None => sim.mpp.batch = Some(options.batch_scheduling),
            Some(batch) if batch != options.batch_scheduling => {
                return Err(ConfigError::MppBatchMismatch(batch, options.batch_scheduling))
            }
            Some(_) => {}
        }
        sim.mpp.allow_underway = options.allow_underway_per_server;
        sim.mpp.block_sfi_while_on_wire = options.block_sfi_while_packet_on_wire;

        let acp = (!options.oracle).then_some((
            options.admission_control_threshold_low,
            options.admission_control_threshold_high,
        ));
        Ok(Self {
            // incremental is the only mode this scheduler knows
            core: SchedulerCore::new(true, options.oracle, acp)?,
            consider_alpha_by_using_timeouts: options.consider_alpha_by_using_timeouts,
            accessible_sf: None,
        })
    }

    /// The encoded activity id for (target SFI, class, source SFF).
    fn activity_for(sim: &Simulator, sfi: SfiId, class: ClassId, source_sff: SffId) -> usize {
        let n_sff = sim.num_sffs();
        let n_class = sim.classes.num_classes();
        n_sff * n_class * sfi.index() + n_sff * class.index() + source_sff.index()
    }

    /// Decode an activity id into (target SFI, class, source SFF).
    fn activity_properties(sim: &Simulator, activity: usize) -> (SfiId, ClassId, SffId) {
        let n_sff = sim.num_sffs();
        let n_class = sim.classes.num_classes();
        let per_sfi = n_sff * n_class;
        let sfi = activity / per_sfi;
        let remainder = activity - per_sfi * sfi;
        let class = remainder / n_sff;
        let sff = remainder - class * n_sff;
        (SfiId::from(sfi), ClassId::from(class), SffId::new(sff))
    }

    /// Build the map from servers to the classes any of their SFIs can
    /// serve, and size the underway accounting.
    fn cache_map_server_to_classes(sim: &mut Simulator) -> Result<(), SimError> {
        debug!("MppScheduler creates the server->classes map");
        let mut map = BTreeMap::new();
        for server in 0..sim.num_servers() {
            let server = ServerId::from(server);
            let sf_types: BTreeSet<SfType> = sim.servers[server.index()]
                .sfis
                .iter()
                .map(|sfi| sim.sfis[sfi.index()].sf_type)
                .collect();
            let affected: Vec<ClassId> = (0..sim.classes.num_classes())
                .map(ClassId::from)
                .filter(|c| sf_types.contains(&sim.classes.sf_of(*c).0))
                .collect();
            map.insert(server, affected);
        }

        // every class must be reachable through some server
        let reachable: BTreeSet<ClassId> = map.values().flatten().copied().collect();
        for class in (0..sim.classes.num_classes()).map(ClassId::from) {
            if !reachable.contains(&class) {
                let missing_sf = sim.classes.sf_of(class).0;
                if (0..sim.num_sfis()).any(|sfi| sim.sfis[sfi].sf_type == missing_sf) {
                    return Err(SimError::Inconsistency(format!(
                        "class {class} is unreachable although an SFI of type {missing_sf} exists"
                    )));
                }
            }
        }

        sim.mpp.underway = vec![0; sim.num_servers()];
        sim.mpp.map_server_to_classes = Some(map);
        Ok(())
    }

    /// Build the static activity rate matrix.
    fn cache_r_matrix(sim: &mut Simulator, consider_alpha: bool) -> Result<(), SimError> {
        debug!("MppScheduler creates the r matrix");
        let n_sff = sim.num_sffs();
        let n_class = sim.classes.num_classes();
        let total_activities = sim.num_sfis() * n_class * n_sff;
        let mut r_matrix = vec![0.0; total_activities];

        let max_deadline = sim
            .classes
            .max_deadline
            .expect("flows exist before the first scheduling pass");
        let alpha_numerator = (max_deadline as f64).powi(2);

        for sff in (0..n_sff).map(SffId::new) {
            for class in (0..n_class).map(ClassId::from) {
                let alpha = if consider_alpha {
                    alpha_numerator / (sim.classes.deadline_of(class) as f64).powi(2)
                } else {
                    1.0
                };
                assert!(alpha >= 1.0);

                let (sf, _) = sim.classes.sf_of(class);
                for sfi in (0..sim.num_sfis()).map(SfiId::from) {
                    let server = sim.sfis[sfi.index()].server;
                    if sim.servers[server.index()].cpu_policy != CpuPolicy::OneAtATime {
                        return Err(SimError::Inconsistency(format!(
                            "MPP considers R as static and only supports one-at-a-time, \
                             but {server} uses {}",
                            sim.servers[server.index()].cpu_policy
                        )));
                    }
                    if sim.sfis[sfi.index()].sf_type != sf {
                        continue;
                    }
                    let mut delay = sim.sfi_expected_processing_time(sfi) as f64;
                    let sfi_sff = sim.sfis[sfi.index()].sff;
                    if sfi_sff != sff {
                        delay += sim.topo.multi_hop_latency(sff, sfi_sff)?;
                    }
                    let activity = Self::activity_for(sim, sfi, class, sff);
                    r_matrix[activity] = alpha * 1_000_000.0 / delay;
                    assert!(r_matrix[activity] > 0.0);
                }
            }
        }
        sim.mpp.r_matrix = Some(r_matrix);
        Ok(())
    }

    /// The p-value of an activity: its rate times the source queue length
    /// minus the target server's underway packets, with backpressure from
    /// the next chain class at the target SFF.
    fn p_value_for(sim: &Simulator, activity: usize) -> f64 {
        let (sfi, class, source_sff) = Self::activity_properties(sim, activity);
        let target_sff = sim.sfis[sfi.index()].sff;
        let server = sim.sfis[sfi.index()].server;
        let (sf, end_of_sfc) = sim.classes.sf_of(class);
        debug_assert_eq!(sf, sim.sfis[sfi.index()].sf_type);

        let r = sim.mpp.r_matrix.as_ref().expect("r matrix is cached")[activity];
        let queue_len = sim.sffs[source_sff.index()].queues.per_class()[&class].len() as f64;
        let underway = sim.mpp.underway[server.index()] as f64;
        let mut p_value = r * (queue_len - underway);

        // backpressure from the queue of the subsequent class
        if !end_of_sfc {
            if let Some(next_queue) = sim.sffs[target_sff.index()]
                .queues
                .per_class()
                .get(&class.next())
            {
                p_value -= r * next_queue.len() as f64;
            }
        }
        p_value
    }

    /// The best activity: maximum p-value, ties broken towards the older
    /// head-of-queue packet, then towards the larger activity id.
    fn select_best_activity(sim: &Simulator, p_values: &[(usize, f64)]) -> Option<usize> {
        let mut best: Option<(f64, usize, u64)> = None;
        for (activity, p_value) in p_values.iter().copied() {
            let (_, class, source_sff) = Self::activity_properties(sim, activity);
            let queued_since = sim.sffs[source_sff.index()].queues.per_class()[&class]
                .front()
                .expect("only non-empty queues produce activities")
                .time_marker
                .expect("queued packets carry a time marker");
            let better = match best {
                None => true,
                Some((best_p, best_activity, best_time)) => {
                    best_p < p_value
                        || (best_p == p_value
                            && (best_time > queued_since
                                || (best_time == queued_since && best_activity < activity)))
                }
            };
            if better {
                best = Some((p_value, activity, queued_since));
            }
        }
        best.map(|(_, activity, _)| activity)
    }
}

impl Scheduler for MppScheduler {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SchedulerCore {
        &mut self.core
    }

    fn requires_queues_per_class(&self) -> bool {
        true
    }

    fn is_always_able_to_build_full_path(&self) -> bool {
        false
    }

    fn supports_cpu_policy(&self, policy: CpuPolicy) -> bool {
        policy == CpuPolicy::OneAtATime
    }

    fn apply_scheduling_logic(
        &mut self,
        sim: &mut Simulator,
        class: ClassId,
    ) -> Result<(), SimError> {
        let my_sff = self.core.my_sff;
        // which SF types can this scheduler reach at all?
        if self.accessible_sf.is_none() {
            let accessible = if self.core.oracle {
                (0..sim.num_sfis()).map(|sfi| sim.sfis[sfi].sf_type).collect()
            } else {
                sim.sffs[my_sff.index()]
                    .service_rate_per_sf
                    .iter()
                    .filter(|(_, rate)| **rate > 0.0)
                    .map(|(sf, _)| *sf)
                    .collect()
            };
            self.accessible_sf = Some(accessible);
        }

        let expected_sf = sim.sffs[my_sff.index()]
            .queues
            .peek_newest(class)
            .expect("the arriving packet is at the back of its queue")
            .to_be_visited[0];
        if !self.accessible_sf.as_ref().unwrap().contains(&expected_sf) {
            let mut packet = sim.sffs[my_sff.index()]
                .queues
                .pop_newest(class)
                .expect("the arriving packet is at the back of its queue");
            let delta = packet.take_delta(sim.time());
            packet.timers.queue_scheduling += delta;
            sim.packet_reject(packet);
            return Ok(());
        }
        self.trigger_scheduling_logic(sim).map(|_| ())
    }

    fn trigger_scheduling_logic(&mut self, sim: &mut Simulator) -> Result<bool, SimError> {
        let my_sff = self.core.my_sff;

        if sim.mpp.map_server_to_classes.is_none() {
            Self::cache_map_server_to_classes(sim)?;
        }
        if sim.mpp.r_matrix.is_none() {
            Self::cache_r_matrix(sim, self.consider_alpha_by_using_timeouts)?;
        }
        if sim.mpp.free_count(my_sff) == 0 {
            return Ok(false);
        }
        trace!("MPP scheduler of SFF{} starts a pass", my_sff.index());

        let batch = sim.mpp.batch.expect("configured in the constructor");
        let allow = sim.mpp.allow_underway;

        let mut successfully_scheduled: u64 = 0;
        // candidate servers to process a packet: all in oracle mode, the
        // own SFF's otherwise
        let mut servers_to_process: Vec<ServerId> = if self.core.oracle {
            sim.mpp
                .map_server_to_classes
                .as_ref()
                .unwrap()
                .keys()
                .copied()
                .collect()
        } else {
            sim.sffs[my_sff.index()].servers.iter().copied().collect()
        };
        // source SFFs whose queues may hold packets to take
        let mut sources: Vec<SffId> = if self.core.oracle {
            (0..sim.num_sffs()).map(SffId::new).collect()
        } else {
            vec![my_sff]
        };
        let mut drained_sources: Vec<SffId> = vec![];

        loop {
            servers_to_process
                .retain(|s| sim.mpp.underway[s.index()] + batch <= allow);
            sim.mpp
                .free_server_count
                .insert(my_sff, servers_to_process.len() as i64);
            if servers_to_process.is_empty() {
                break;
            }

            self.core.mark_time_scheduling_starts();
            let mut best_per_server: Vec<(ServerId, f64, usize)> = vec![];
            for server in servers_to_process.iter().copied() {
                let affected_classes = sim.mpp.map_server_to_classes.as_ref().unwrap()[&server].clone();
                let mut p_values: Vec<(usize, f64)> = vec![];

                // sources found fully drained in the previous round are
                // not scanned again
                sources.retain(|s| !drained_sources.contains(s));
                drained_sources.clear();

                for source_sff in sources.clone() {
                    let mut source_has_nothing = true;
                    let classes: Vec<ClassId> = sim.sffs[source_sff.index()]
                        .queues
                        .per_class()
                        .keys()
                        .copied()
                        .collect();
                    for class in classes {
                        // drop head-of-queue packets that timed out while
                        // waiting
                        loop {
                            let stale = sim.sffs[source_sff.index()].queues.per_class()[&class]
                                .front()
                                .map_or(false, |p| {
                                    sim.flows[p.flow.index()].qos_max_delay < p.delay(sim.time())
                                });
                            if !stale {
                                break;
                            }
                            let mut packet = sim.sffs[source_sff.index()]
                                .queues
                                .per_class_mut()
                                .get_mut(&class)
                                .unwrap()
                                .pop_front()
                                .unwrap();
                            let delta = packet.take_delta(sim.time());
                            packet.timers.queue_scheduling += delta;
                            sim.drop_timed_out(packet, None)?;
                        }

                        if sim.sffs[source_sff.index()].queues.per_class()[&class].is_empty() {
                            continue;
                        }
                        source_has_nothing = false;
                        if !affected_classes.contains(&class) {
                            continue;
                        }

                        let (sf, _) = sim.classes.sf_of(class);
                        for sfi in sim.servers[server.index()].sfis.clone() {
                            let s = &sim.sfis[sfi.index()];
                            if s.sf_type != sf {
                                continue;
                            }
                            if !self.core.oracle && s.sff != source_sff {
                                continue;
                            }
                            if sim.mpp.block_sfi_while_on_wire
                                && sim.mpp.blocked_sfis.contains(&sfi)
                            {
                                continue;
                            }
                            let activity = Self::activity_for(sim, sfi, class, source_sff);
                            let p_value = Self::p_value_for(sim, activity);
                            trace!("possible activity {activity} with p-value {p_value}");
                            p_values.push((activity, p_value));
                        }
                    }
                    if source_has_nothing {
                        drained_sources.push(source_sff);
                    }
                }

                if let Some(best) = Self::select_best_activity(sim, &p_values) {
                    let p = p_values.iter().find(|(a, _)| *a == best).unwrap().1;
                    best_per_server.push((server, p, best));
                }
            }

            let Some((server, _, activity)) = best_per_server
                .iter()
                .copied()
                .reduce(|best, cand| if cand.1 > best.1 { cand } else { best })
            else {
                self.core.reset_timer();
                break;
            };

            let (target_sfi, from_queue, from_sff) = Self::activity_properties(sim, activity);
            let target_sff = sim.sfis[target_sfi.index()].sff;
            assert_eq!(sim.sfis[target_sfi.index()].server, server);
            assert!(sim.mpp.underway[server.index()] < allow);

            if sim.mpp.block_sfi_while_on_wire {
                sim.mpp.blocked_sfis.insert(target_sfi);
            }

            let mut scheduled_path: Vec<Hop> = vec![];
            if target_sff != from_sff {
                assert!(self.core.oracle);
                for hop in sim.topo.full_path_ids(from_sff, target_sff)? {
                    scheduled_path.push(Hop::Sff(hop));
                }
            }
            scheduled_path.push(Hop::Sfi(target_sfi));
            scheduled_path.push(Hop::Sff(target_sff));

            let mut packet_count = batch.min(allow - sim.mpp.underway[server.index()]);
            let scheduling_time = self.core.take_scheduling_time();
            self.core.scheduling_attempts += 1;

            while packet_count > 0
                && !sim.sffs[from_sff.index()].queues.per_class()[&from_queue].is_empty()
            {
                let mut packet = sim.sffs[from_sff.index()]
                    .queues
                    .per_class_mut()
                    .get_mut(&from_queue)
                    .unwrap()
                    .pop_front()
                    .unwrap();
                packet.real_scheduling += scheduling_time;
                let delta = packet.take_delta(sim.time());
                packet.timers.queue_scheduling += delta;

                let time_left =
                    sim.flows[packet.flow.index()].qos_max_delay as f64 - packet.delay(sim.time()) as f64;
                let min_time = sim.topo.multi_hop_latency(my_sff, target_sff)?
                    + sim.topo.multi_hop_latency(
                        target_sff,
                        sim.flows[packet.flow.index()].desired_egress,
                    )?;
                if time_left < min_time {
                    debug!("drop packet {}: remaining time below path latency", packet.id);
                    sim.drop_timed_out(packet, None)?;
                    continue;
                }

                packet_count -= 1;
                packet.on_drop = Some(DropAction::MppRelease);
                sim.mpp.underway[server.index()] += 1;
                packet.mpp_locking = true;

                let expected_sf = packet.to_be_visited.pop_front().unwrap();
                if expected_sf != sim.sfis[target_sfi.index()].sf_type {
                    return Err(SimError::Inconsistency(format!(
                        "activity {activity} would send a packet of sf {expected_sf} to {target_sfi}"
                    )));
                }
                packet.full_path.extend(scheduled_path.iter().copied());
                debug!(
                    "dispatch packet {} from SFF{} queue {from_queue} to {target_sfi} on {server}",
                    packet.id,
                    from_sff.index()
                );
                successfully_scheduled += 1;
                sim.sff_handle_from_scheduler(from_sff, packet)?;
            }
        }

        Ok(successfully_scheduled > 0)
    }

    fn notify_sfi_finished(&mut self, sim: &mut Simulator, sfi: SfiId, packet: &mut Packet) {
        notify_finished(sim, sfi, packet);
    }
}

/// Release the underway accounting of a finished (or dropped) packet and,
/// when batching capacity is available again, trigger the schedulers of all
/// SFFs that reach the server.
pub(crate) fn notify_finished(sim: &mut Simulator, sfi: SfiId, packet: &mut Packet) {
    let server = sim.sfis[sfi.index()].server;
    trace!("{sfi} finished packet {}, releasing {server}", packet.id);

    if packet.mpp_locking {
        sim.mpp.underway[server.index()] -= 1;
        packet.mpp_locking = false;
    }

    // one-at-a-time and nothing underway: the server has to be free
    if sim.mpp.underway[server.index()] == 0 {
        debug_assert!(sim.server_is_free(server));
    }

    if sim.mpp.block_sfi_while_on_wire {
        debug_assert!(sim.sfis[sfi.index()].free);
        sim.mpp.blocked_sfis.remove(&sfi);
    }

    let batch = sim.mpp.batch.unwrap_or(1);
    if sim.mpp.underway[server.index()] + batch <= sim.mpp.allow_underway {
        // scheduling must happen after the packet's control flow finished,
        // so enqueue zero-delay events instead of triggering inline
        let mut to_inform: Vec<SffId> = sim.servers[server.index()].sff_ids.iter().copied().collect();
        to_inform.shuffle(&mut sim.rng);
        for sff in to_inform {
            *sim.mpp.free_server_count.entry(sff).or_insert(-1) += 1;
            sim.schedule_in(0, Event::DoScheduling(sff));
        }
    }
}

/// A packet carrying the MPP locking flag was dropped mid-flight: release
/// the underway budget of the SFI it was heading to.
pub(crate) fn release_dropped_packet(sim: &mut Simulator, sfi: SfiId, packet: &mut Packet) {
    notify_finished(sim, sfi, packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FlowId;

    /// One SFF, one one-at-a-time server hosting an SFI of SF 0 and SF 1,
    /// and two flows: `[0, 1]` (classes 0 and 1) and `[0]` (class 2), all
    /// with the same deadline.
    fn setup() -> (Simulator, SffId, FlowId, FlowId) {
        let mut sim = Simulator::new(0);
        let scheduler = MppScheduler::new(&mut sim, MppOptions::default()).unwrap();
        let sff = sim.add_sff(Box::new(scheduler)).unwrap();
        sim.topo.set_latency_distribution(0, vec![0]);
        sim.topo.freeze();
        sim.init_sf_types(2, 0);
        sim.set_sf_processing_rate(0, 15).unwrap();
        sim.set_sf_processing_rate(1, 15).unwrap();
        let server = sim.add_server(100, CpuPolicy::OneAtATime);
        sim.add_sfi(server, 0, sff).unwrap();
        sim.add_sfi(server, 1, sff).unwrap();
        let chained = sim.add_flow(vec![0, 1], 1_000_000, sff, sff, 0).unwrap();
        let plain = sim.add_flow(vec![0], 1_000_000, sff, sff, 0).unwrap();
        MppScheduler::cache_map_server_to_classes(&mut sim).unwrap();
        MppScheduler::cache_r_matrix(&mut sim, true).unwrap();
        (sim, sff, chained, plain)
    }

    /// Queue `n` packets of a flow under the given class, marking their
    /// queue time at `time`.
    fn fill_queue(sim: &mut Simulator, sff: SffId, flow: FlowId, class: ClassId, n: usize, time: u64) {
        for _ in 0..n {
            let mut packet = sim.make_packet(flow, 0, 1);
            packet.sfc_position = class.index() - sim.flow(flow).sfc_class.index();
            packet.mark_time(time);
            sim.sffs[sff.index()]
                .queues
                .per_class_mut()
                .get_mut(&class)
                .unwrap()
                .push_back(packet);
        }
    }

    #[test]
    fn activity_encoding_roundtrip() {
        let (sim, sff, ..) = setup();
        for sfi in 0..sim.num_sfis() {
            for class in 0..sim.classes.num_classes() {
                let activity =
                    MppScheduler::activity_for(&sim, SfiId::from(sfi), ClassId::from(class), sff);
                assert_eq!(
                    MppScheduler::activity_properties(&sim, activity),
                    (SfiId::from(sfi), ClassId::from(class), sff)
                );
            }
        }
    }

    #[test]
    fn p_value_applies_backpressure() {
        let (mut sim, sff, chained, plain) = setup();
        // two packets waiting in class 0, three in the downstream class 1,
        // two in the chain-less class 2
        fill_queue(&mut sim, sff, chained, ClassId::from(0), 2, 10);
        fill_queue(&mut sim, sff, chained, ClassId::from(1), 3, 20);
        fill_queue(&mut sim, sff, plain, ClassId::from(2), 2, 30);

        let sf0_sfi = SfiId::from(0);
        let a_chained = MppScheduler::activity_for(&sim, sf0_sfi, ClassId::from(0), sff);
        let a_plain = MppScheduler::activity_for(&sim, sf0_sfi, ClassId::from(2), sff);
        let r = sim.mpp.r_matrix.as_ref().unwrap()[a_chained];
        assert!(r > 0.0);

        // the downstream congestion pushes the chained class below zero
        assert_eq!(MppScheduler::p_value_for(&sim, a_chained), r * 2.0 - r * 3.0);
        // the end-of-chain class sees no backpressure
        assert_eq!(MppScheduler::p_value_for(&sim, a_plain), r * 2.0);
    }

    #[test]
    fn best_activity_tie_breaks_by_queue_age_then_id() {
        let (mut sim, sff, chained, plain) = setup();
        // equal p-values (same rate, same queue length, no backpressure):
        // class 2 queued earlier than class 1's downstream-free sibling
        fill_queue(&mut sim, sff, plain, ClassId::from(2), 1, 5);
        fill_queue(&mut sim, sff, chained, ClassId::from(1), 1, 50);

        let sf0_sfi = SfiId::from(0);
        let sf1_sfi = SfiId::from(1);
        let a_old = MppScheduler::activity_for(&sim, sf0_sfi, ClassId::from(2), sff);
        let a_new = MppScheduler::activity_for(&sim, sf1_sfi, ClassId::from(1), sff);
        let p = MppScheduler::p_value_for(&sim, a_old);
        assert_eq!(p, MppScheduler::p_value_for(&sim, a_new));

        // the older head-of-queue wins
        assert_eq!(
            MppScheduler::select_best_activity(&sim, &[(a_new, p), (a_old, p)]),
            Some(a_old)
        );
        // with equal ages, the larger activity id wins
        let (bigger, smaller) = if a_new > a_old { (a_new, a_old) } else { (a_old, a_new) };
        sim.sffs[sff.index()]
            .queues
            .per_class_mut()
            .get_mut(&ClassId::from(1))
            .unwrap()
            .front_mut()
            .unwrap()
            .time_marker = Some(5);
        assert_eq!(
            MppScheduler::select_best_activity(&sim, &[(smaller, p), (bigger, p)]),
            Some(bigger)
        );
    }
}
