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

//! The scheduler framework.
//!
//! A [`Scheduler`] is bound to exactly one SFF and decides, per arriving
//! packet (or per batch), which SFI(s) and inter-SFF path(s) the packet
//! takes. The [`SchedulerCore`] carries everything all schedulers share:
//! the oracle/incremental flags, the optional admission control and
//! forwarding policy ([`Acp`]), per-SF rate estimators, and the static
//! cumulative-weight tables over SFF and SFI service rates used for
//! weighted sampling.

mod greedy;
pub mod mpp;
mod round_robin;

pub use greedy::GreedyShortestDeadlineFirstScheduler;
pub use mpp::{MppOptions, MppScheduler};
pub use round_robin::LoadUnawareRoundRobinScheduler;

use std::collections::HashMap;
use std::time::Instant;

use log::debug;
use rand::Rng;

use crate::model::Packet;
use crate::rate_estimator::{Ewma, RateEstimator};
use crate::simulator::Simulator;
use crate::types::{
    ClassId, ConfigError, CpuPolicy, Hop, SfType, SffId, SfiId, SimError, SchedulingFailure,
};

/// A scheduling strategy, bound to one SFF.
pub trait Scheduler: std::fmt::Debug {
    /// Shared scheduler state.
    fn core(&self) -> &SchedulerCore;

    /// Shared scheduler state, mutably.
    fn core_mut(&mut self) -> &mut SchedulerCore;

    /// Bind this scheduler to its SFF. Called once by
    /// [`Simulator::add_sff`].
    fn assign_sff(&mut self, sff: SffId) {
        self.core_mut().my_sff = sff;
    }

    /// Whether the SFF must keep one queue per packet class instead of a
    /// single queue.
    fn requires_queues_per_class(&self) -> bool {
        false
    }

    /// A packet arrived and sits at the back of the given queue. The
    /// default pipeline consults the ACP, informs the rate estimator, and
    /// hands over to [`Scheduler::apply_scheduling_logic`].
    fn handle_packet_arrival(&mut self, sim: &mut Simulator, class: ClassId) -> Result<(), SimError> {
        let my_sff = self.core().my_sff;
        let next_sf = match sim.sffs[my_sff.index()].queues.peek_newest(class) {
            Some(p) => {
                assert!(
                    p.full_path.len() <= p.path_position,
                    "packet {} was given to the scheduler with path steps left",
                    p.id
                );
                p.to_be_visited[0]
            }
            None => {
                return Err(SimError::Inconsistency(format!(
                    "scheduler of SFF{} was notified without a packet in queue {class}",
                    my_sff.index()
                )))
            }
        };

        if self.core().acp.is_some() {
            match self.core_mut().acp_decide(sim, next_sf)? {
                AcpDecision::KeepLocal => {}
                AcpDecision::Forward(path) => {
                    let mut packet = sim.sffs[my_sff.index()]
                        .queues
                        .pop_newest(class)
                        .expect("the arriving packet is at the back of its queue");
                    let delta = packet.take_delta(sim.time());
                    packet.timers.queue_scheduling += delta;

                    let Some(path) = path else {
                        // nobody else can process this packet either
                        let sfc = sim.flow(packet.flow).sf_type_chain.clone();
                        sim.packet_reject(packet);
                        return Err(SchedulingFailure(format!(
                            "no SFI found for sf type {next_sf} of chain {sfc:?}"
                        ))
                        .into());
                    };
                    if packet.seen_by_scheduler > sim.drop_after_scheduling_attempts {
                        return sim.drop_timed_out(packet, None);
                    }
                    packet.full_path.extend(path);
                    return sim.sff_handle_from_scheduler(my_sff, packet);
                }
            }
        }

        self.core_mut().inform_rate_estimator(sim, next_sf);
        self.apply_scheduling_logic(sim, class)
    }

    /// The scheduler-specific per-packet logic. The packet in question is
    /// at the back of the given queue.
    fn apply_scheduling_logic(&mut self, sim: &mut Simulator, class: ClassId)
        -> Result<(), SimError>;

    /// Run a scheduling pass independent of a single packet arrival (used
    /// by batching schedulers). Returns whether anything was scheduled.
    fn trigger_scheduling_logic(&mut self, sim: &mut Simulator) -> Result<bool, SimError> {
        let _ = sim;
        Ok(false)
    }

    /// An SFI of this scheduler's SFF finished processing a packet.
    fn notify_sfi_finished(&mut self, sim: &mut Simulator, sfi: SfiId, packet: &mut Packet) {
        let _ = (sim, sfi, packet);
    }

    /// Whether this scheduler spreads load in a round-robin fashion.
    fn applies_round_robin(&self) -> bool {
        false
    }

    /// Whether this scheduler can always build a complete path up front.
    fn is_always_able_to_build_full_path(&self) -> bool {
        true
    }

    /// Whether this scheduler can operate under the given CPU policy.
    fn supports_cpu_policy(&self, policy: CpuPolicy) -> bool {
        let _ = policy;
        true
    }
}

/// Outcome of the ACP consultation.
#[derive(Debug)]
pub(crate) enum AcpDecision {
    /// Schedule the packet locally.
    KeepLocal,
    /// Forward the packet. `Some(path)` holds the hops towards the chosen
    /// remote SFF; `None` means no remote SFF can serve the packet either.
    Forward(Option<Vec<Hop>>),
}

/// Admission Control & forwarding Policy: opportunistically off-load
/// packets to remote SFFs based on the estimated load of the local SFIs.
#[derive(Debug, Clone)]
pub struct Acp {
    /// Below this load, packets stay local.
    pub threshold_low: f64,
    /// At or above this load, packets are always forwarded.
    pub threshold_high: f64,
    /// Number of packets forwarded to a neighbor.
    pub detour: u64,
    /// Number of packets kept local.
    pub non_detour: u64,
}

impl Acp {
    /// Create an ACP with the given thresholds.
    pub fn new(threshold_low: f64, threshold_high: f64) -> Result<Self, ConfigError> {
        if threshold_low >= threshold_high {
            return Err(ConfigError::InvalidThresholds {
                low: threshold_low,
                high: threshold_high,
            });
        }
        Ok(Self {
            threshold_low,
            threshold_high,
            detour: 0,
            non_detour: 0,
        })
    }

    /// The probabilistic forwarding decision for a given load estimate.
    /// Between the thresholds, the forwarding probability ramps linearly
    /// from 0 to 1.
    pub fn decide(&self, load: f64, rng: &mut impl Rng) -> bool {
        if load > self.threshold_low && load < self.threshold_high {
            let to_test = (load - self.threshold_low) / (self.threshold_high - self.threshold_low);
            rng.gen::<f64>() <= to_test
        } else {
            load >= self.threshold_high
        }
    }
}

/// Cumulative-weight table over ids, one entry per SF type. Sampling an id
/// proportionally to its rate is a uniform draw over the total weight plus
/// a binary search.
#[derive(Debug, Clone, Default)]
pub(crate) struct RateTable<T> {
    ids: Vec<Vec<T>>,
    cum_weights: Vec<Vec<f64>>,
}

impl<T: Copy> RateTable<T> {
    /// The ids (sorted) and cumulative weights for an SF type.
    fn entries(&self, sf: SfType) -> (&[T], &[f64]) {
        (&self.ids[sf], &self.cum_weights[sf])
    }

    /// Whether any id serves the given SF type.
    fn has_entries(&self, sf: SfType) -> bool {
        sf < self.ids.len() && !self.ids[sf].is_empty()
    }

    /// Sample an id proportionally to its weight.
    fn sample(&self, sf: SfType, rng: &mut impl Rng) -> T {
        let (ids, cum) = self.entries(sf);
        ids[sample_cum_weights(cum, rng)]
    }
}

/// Draw an index from a cumulative-weight array.
pub(crate) fn sample_cum_weights(cum_weights: &[f64], rng: &mut impl Rng) -> usize {
    let total = *cum_weights.last().expect("non-empty cumulative weights");
    let r = rng.gen::<f64>() * total;
    cum_weights
        .partition_point(|&w| w <= r)
        .min(cum_weights.len() - 1)
}

/// State shared by all scheduler implementations.
#[derive(Debug)]
pub struct SchedulerCore {
    /// The SFF this scheduler is bound to.
    pub my_sff: SffId,
    /// Schedule only the next chain hop instead of the full remainder.
    pub incremental: bool,
    /// Whether the scheduler sees all SFFs or only its own.
    pub oracle: bool,
    /// The admission control policy, if active.
    pub acp: Option<Acp>,
    /// Number of scheduling decisions taken.
    pub scheduling_attempts: u64,
    /// Static rates the *other* SFFs offer per SF type (see
    /// [`SchedulerCore::update_sff_rates`]).
    pub(crate) sff_rates: Option<RateTable<SffId>>,
    /// Expected rates of the individual SFIs per SF type.
    pub(crate) sfi_rates: Option<RateTable<SfiId>>,
    estimators: HashMap<SfType, usize>,
    scheduling_timer: Option<Instant>,
}

impl SchedulerCore {
    /// Create the shared scheduler state. `acp` activates admission
    /// control with the given `(low, high)` thresholds.
    pub fn new(
        incremental: bool,
        oracle: bool,
        acp: Option<(f64, f64)>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            my_sff: SffId::end(),
            incremental,
            oracle,
            acp: acp.map(|(low, high)| Acp::new(low, high)).transpose()?,
            scheduling_attempts: 0,
            sff_rates: None,
            sfi_rates: None,
            estimators: HashMap::new(),
            scheduling_timer: None,
        })
    }

    /// Start the wall-clock scheduling timer.
    pub(crate) fn mark_time_scheduling_starts(&mut self) {
        assert!(self.scheduling_timer.is_none());
        self.scheduling_timer = Some(Instant::now());
    }

    /// Stop the timer and return the elapsed wall-clock seconds.
    pub(crate) fn take_scheduling_time(&mut self) -> f64 {
        self.scheduling_timer
            .take()
            .expect("scheduling timer is running")
            .elapsed()
            .as_secs_f64()
    }

    /// Abandon the running timer.
    pub(crate) fn reset_timer(&mut self) {
        assert!(self.scheduling_timer.take().is_some());
    }

    /// Build the cumulative-weight table of the static service rate every
    /// SFF (except this one, unless `include_own_sff`) offers per SF type.
    /// The static rate is the upper limit the SFF is capable of serving,
    /// with all its SFIs at full server power.
    pub(crate) fn update_sff_rates(&mut self, sim: &Simulator, include_own_sff: bool) {
        let mut ids = vec![];
        let mut cum_weights = vec![];
        // sorted by id, so that the sampling is deterministic
        let sffs: Vec<SffId> = (0..sim.num_sffs())
            .map(SffId::new)
            .filter(|sff| *sff != self.my_sff || include_own_sff)
            .collect();
        for sf in 0..sim.num_sf_types() {
            let with_sf: Vec<SffId> = sffs
                .iter()
                .copied()
                .filter(|sff| sim.sffs[sff.index()].service_rate_per_sf.contains_key(&sf))
                .collect();
            let mut acc = 0.0;
            cum_weights.push(
                with_sf
                    .iter()
                    .map(|sff| {
                        acc += sim.sffs[sff.index()].service_rate_per_sf[&sf];
                        acc
                    })
                    .collect(),
            );
            ids.push(with_sf);
        }
        self.sff_rates = Some(RateTable { ids, cum_weights });
    }

    /// Build the cumulative-weight table of the expected processing rate of
    /// every SFI (excluding the own SFF's, unless `include_own_sff`).
    pub(crate) fn update_sfi_rates(&mut self, sim: &Simulator, include_own_sff: bool) {
        let mut ids = vec![];
        let mut cum_weights = vec![];
        let sfis: Vec<SfiId> = (0..sim.num_sfis())
            .map(SfiId::from)
            .filter(|sfi| sim.sfis[sfi.index()].sff != self.my_sff || include_own_sff)
            .collect();
        for sf in 0..sim.num_sf_types() {
            let with_sf: Vec<SfiId> = sfis
                .iter()
                .copied()
                .filter(|sfi| sim.sfis[sfi.index()].sf_type == sf)
                .collect();
            let mut acc = 0.0;
            cum_weights.push(
                with_sf
                    .iter()
                    .map(|sfi| {
                        acc += sim.sfi_expected_processing_rate(*sfi);
                        acc
                    })
                    .collect(),
            );
            ids.push(with_sf);
        }
        self.sfi_rates = Some(RateTable { ids, cum_weights });
    }

    /// Count a packet arrival for the per-SF rate estimator, creating the
    /// estimator on first use.
    pub(crate) fn inform_rate_estimator(&mut self, sim: &mut Simulator, sf: SfType) {
        let id = match self.estimators.get(&sf) {
            Some(id) => *id,
            None => {
                let id = sim.add_rate_estimator(RateEstimator::Ewma(Ewma::default()));
                self.estimators.insert(sf, id);
                id
            }
        };
        sim.rate_estimator_mut(id).packet_arrival();
    }

    /// The estimated packet arrival rate for an SF type (0 if no packet of
    /// that type arrived yet).
    pub fn arrival_rate_estimate(&self, sim: &Simulator, sf: SfType) -> f64 {
        self.estimators
            .get(&sf)
            .map(|id| sim.rate_estimator(*id).estimated_rate())
            .unwrap_or(0.0)
    }

    /// The load of the local SFIs serving `sf`: estimated arrival rate over
    /// static service rate.
    pub fn load_of_sfis_of_sf(&self, sim: &Simulator, sf: SfType) -> f64 {
        self.arrival_rate_estimate(sim, sf) / sim.sffs[self.my_sff.index()].service_rate_per_sf[&sf]
    }

    /// Consult the ACP for the packet whose next SF is `next_sf`.
    pub(crate) fn acp_decide(
        &mut self,
        sim: &mut Simulator,
        next_sf: SfType,
    ) -> Result<AcpDecision, SimError> {
        if self.sff_rates.is_none() {
            self.update_sff_rates(sim, false);
        }

        let my_sff = self.my_sff;
        let has_local_sfi = sim.sffs[my_sff.index()]
            .sfis_per_type
            .get(&next_sf)
            .map_or(false, |sfis| !sfis.is_empty());

        let mut forward = !has_local_sfi;

        let has_remote = self
            .sff_rates
            .as_ref()
            .expect("just initialized")
            .has_entries(next_sf);
        if !forward && has_remote {
            let arrival_rate = self.arrival_rate_estimate(sim, next_sf);
            let service_rate = sim.sffs[my_sff.index()].service_rate_per_sf[&next_sf];
            assert!(service_rate > 0.0);
            let load = arrival_rate / service_rate;
            forward = self
                .acp
                .as_ref()
                .expect("acp_decide requires an active ACP")
                .decide(load, &mut sim.rng);
        }

        if !forward {
            if let Some(acp) = self.acp.as_mut() {
                acp.non_detour += 1;
            }
            return Ok(AcpDecision::KeepLocal);
        }
        if !has_remote {
            // nobody else hosts an SFI of this type; the caller rejects
            return Ok(AcpDecision::Forward(None));
        }

        let target = self
            .sff_rates
            .as_ref()
            .expect("just initialized")
            .sample(next_sf, &mut sim.rng);
        let path: Vec<Hop> = sim
            .topo
            .full_path_ids(my_sff, target)?
            .into_iter()
            .map(Hop::Sff)
            .collect();
        if let Some(acp) = self.acp.as_mut() {
            acp.detour += 1;
        }
        debug!("ACP of SFF{} forwards a packet of sf {next_sf} to SFF{}", my_sff.index(), target.index());
        Ok(AcpDecision::Forward(Some(path)))
    }
}

/// A scheduler that rejects every packet. Used as a control strategy.
#[derive(Debug)]
pub struct RejectScheduler {
    core: SchedulerCore,
}

impl RejectScheduler {
    /// Create a new reject scheduler.
    pub fn new(incremental: bool, oracle: bool) -> Self {
        Self {
            core: SchedulerCore::new(incremental, oracle, None)
                .expect("no thresholds to validate"),
        }
    }
}

impl Default for RejectScheduler {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl Scheduler for RejectScheduler {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SchedulerCore {
        &mut self.core
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
        self.core.scheduling_attempts += 1;
        sim.packet_reject(packet);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn cum_weight_sampling_is_proportional() {
        let cum = vec![1.0, 3.0, 6.0];
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = [0usize; 3];
        for _ in 0..60_000 {
            counts[sample_cum_weights(&cum, &mut rng)] += 1;
        }
        // expected proportions 1/6, 2/6, 3/6
        assert!((counts[0] as f64 / 60_000.0 - 1.0 / 6.0).abs() < 0.02);
        assert!((counts[1] as f64 / 60_000.0 - 2.0 / 6.0).abs() < 0.02);
        assert!((counts[2] as f64 / 60_000.0 - 3.0 / 6.0).abs() < 0.02);
    }

    #[test]
    fn acp_thresholds_validated() {
        assert!(Acp::new(1.0, 0.5).is_err());
        assert!(Acp::new(0.5, 1.0).is_ok());
    }

    #[test]
    fn acp_forwarding_probability_ramps_linearly() {
        let acp = Acp::new(0.5, 1.5).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        assert!(!acp.decide(0.2, &mut rng));
        assert!(acp.decide(2.0, &mut rng));

        let load = 0.75; // expected forward probability: 0.25
        let n = 40_000;
        let forwarded = (0..n).filter(|_| acp.decide(load, &mut rng)).count();
        let fraction = forwarded as f64 / n as f64;
        assert!((fraction - 0.25).abs() < 0.02, "fraction was {fraction}");
    }
}
