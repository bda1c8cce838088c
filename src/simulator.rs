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

//! The simulator: owner of all entities, the event queue, and the main
//! loop.
//!
//! The simulator advances virtual time by processing events in
//! nondecreasing time order. All entities (SFFs, SFIs, servers, flows) live
//! in arenas on the simulator and reference each other by id; every
//! operation executes atomically between two event pops. A single seeded
//! RNG drives all randomized decisions, which makes runs with the same seed
//! and configuration bit-for-bit deterministic.

use std::collections::BTreeSet;
use std::time::Instant;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::event::queue::{SLICE_LENGTH, SLICE_TIME};
use crate::event::{Event, EventQueue, TimedEvent};
use crate::model::{ClassRegistry, Flow, Packet, Server, Sff, SffQueues, Sfi, PacketSource};
use crate::rate_estimator::RateEstimator;
use crate::scheduler::mpp::MppState;
use crate::scheduler::Scheduler;
use crate::topology::Topology;
use crate::types::{FinalState, Hop, SimError, SimTime};
use crate::workload::Workload;

/// Hook fired when a packet reaches a terminal state.
pub type TeardownHook = Box<dyn FnMut(SimTime, &Packet, FinalState)>;
/// Hook fired when a packet enters the network.
pub type IngressHook = Box<dyn FnMut(SimTime, &Flow, &Packet)>;
/// Hook fired by the periodic statistics polling event.
pub type PollHook = Box<dyn FnMut(&Simulator)>;

/// Packet outcome counters of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PacketCounters {
    /// Packets created in total.
    pub total: u64,
    /// Packets that entered the network.
    pub ingress: u64,
    /// Packets currently somewhere in the system.
    pub in_system: u64,
    /// Packets delivered within their deadline.
    pub success: u64,
    /// Packets rejected by a scheduler.
    pub reject_schedule: u64,
    /// Packets dropped because they exceeded their deadline.
    pub timeout: u64,
    /// Packets still in the system without timeout when the workload ended
    /// (counted successful, but excluded from the delay averages).
    pub after_workload_end_no_timeout: u64,
    /// Sum of the end-to-end delays of all terminal packets.
    pub sum_delay: u64,
    /// Sum of `delay / deadline` over all delivered packets.
    pub qos_ratio_sum: f64,
    /// Number of transmissions put on a wire.
    pub put_on_wire: u64,
}

/// Aggregate statistics of a finished run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimpleStatistics {
    /// Total scheduling decisions taken across all schedulers.
    pub total_scheduling_attempts: u64,
    /// Fraction of packets delivered successfully.
    pub success_rate: f64,
    /// Fraction of packets rejected by a scheduler.
    pub reject_rate: f64,
    /// `1 − mean(delay/deadline)` over the delivered packets.
    pub service_quality: f64,
    /// Total µs during which servers sat idle.
    pub server_idle_time: SimTime,
    /// Idle time as a percentage of the simulated time, averaged over all
    /// servers.
    pub server_idle_time_ratio: f64,
}

/// Options of a simulation run.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunOptions {
    /// Stop once the current time exceeds this bound (µs).
    pub max_sim_time: Option<SimTime>,
    /// Stop as soon as the workload is exhausted, sweeping all packets
    /// still in the system into their terminal states.
    pub stop_when_workload_over: bool,
    /// Periodically log a progress line.
    pub progress: bool,
}

/// The simulator. See the [module documentation](self).
pub struct Simulator {
    pub(crate) time: SimTime,
    pub(crate) queue: EventQueue,
    pub(crate) rng: StdRng,
    /// The SFF link topology.
    pub topo: Topology,
    pub(crate) sffs: Vec<Sff>,
    pub(crate) schedulers: Vec<Option<Box<dyn Scheduler>>>,
    pub(crate) sfis: Vec<Sfi>,
    pub(crate) servers: Vec<Server>,
    pub(crate) flows: Vec<Flow>,
    /// The global packet class registry.
    pub classes: ClassRegistry,
    pub(crate) sf_rates: Option<Vec<u64>>,
    pub(crate) estimators: Vec<RateEstimator>,
    pub(crate) estimator_periods: BTreeSet<SimTime>,
    pub(crate) mpp: MppState,
    /// The packet outcome counters.
    pub counters: PacketCounters,
    pub(crate) next_packet_id: u64,
    workload: Option<Box<dyn Workload>>,
    workload_done: bool,
    pub(crate) workload_end_time: SimTime,
    pub(crate) last_packet_ingress_time: SimTime,
    pub(crate) last_relevant_time: SimTime,
    running: bool,
    ignore_schedule_attempts: bool,
    /// Escalate scheduling failures instead of rejecting the packet.
    pub strict_scheduling: bool,
    /// Record every hop a packet visits (`Packet::visited_hops`).
    pub trace_packet_path: bool,
    /// Granularity of the server CPU share weights.
    pub cpu_share_granularity: u64,
    /// Interval of the dynamic CPU policy weight rebalance (µs).
    pub dynamic_cpu_interval: SimTime,
    /// Drop a packet once a scheduler has seen it this many times.
    pub drop_after_scheduling_attempts: u32,
    pub(crate) teardown_hooks: Vec<TeardownHook>,
    ingress_hooks: Vec<IngressHook>,
    poll_hooks: Vec<PollHook>,
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("time", &self.time)
            .field("events", &self.queue.len())
            .field("sffs", &self.sffs.len())
            .field("sfis", &self.sfis.len())
            .field("servers", &self.servers.len())
            .field("flows", &self.flows.len())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl Simulator {
    /// Create a simulator with the given RNG seed.
    pub fn new(seed: u64) -> Self {
        Self {
            time: 0,
            queue: EventQueue::new(),
            rng: StdRng::seed_from_u64(seed),
            topo: Topology::new(),
            sffs: vec![],
            schedulers: vec![],
            sfis: vec![],
            servers: vec![],
            flows: vec![],
            classes: ClassRegistry::default(),
            sf_rates: None,
            estimators: vec![],
            estimator_periods: BTreeSet::new(),
            mpp: MppState::default(),
            counters: PacketCounters::default(),
            next_packet_id: 0,
            workload: None,
            workload_done: false,
            workload_end_time: 0,
            last_packet_ingress_time: 0,
            last_relevant_time: 0,
            running: false,
            ignore_schedule_attempts: false,
            strict_scheduling: false,
            trace_packet_path: false,
            cpu_share_granularity: 10_000,
            dynamic_cpu_interval: 1_000_000,
            drop_after_scheduling_attempts: 50,
            teardown_hooks: vec![],
            ingress_hooks: vec![],
            poll_hooks: vec![],
        }
    }

    /// The current virtual time in µs.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Whether [`Simulator::run`] was called.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The pending event count (all / relevant).
    pub fn event_queue_len(&self) -> (usize, usize) {
        (self.queue.len(), self.queue.relevant_len())
    }

    /// Schedule an event at an absolute time. Once the simulation is over,
    /// scheduling attempts are silently dropped.
    pub fn schedule_event_at(&mut self, time: SimTime, event: Event) {
        if self.ignore_schedule_attempts {
            return;
        }
        self.queue.push(time, event);
    }

    /// Schedule an event `delay` µs from now.
    pub fn schedule_in(&mut self, delay: SimTime, event: Event) {
        self.schedule_event_at(self.time + delay, event)
    }

    /// Schedule a network transmission and count it.
    pub(crate) fn schedule_network_delay(
        &mut self,
        delay: SimTime,
        packet: Packet,
        source: Hop,
        dest: Hop,
    ) {
        self.counters.put_on_wire += 1;
        self.schedule_in(delay, Event::NetworkDelay { packet, source, dest });
    }

    /// Run a closure with the scheduler of an SFF temporarily taken out of
    /// its slot, so that it can freely mutate the simulator.
    pub(crate) fn with_scheduler<R>(
        &mut self,
        sff: crate::types::SffId,
        f: impl FnOnce(&mut Box<dyn Scheduler>, &mut Simulator) -> R,
    ) -> R {
        let mut scheduler = self.schedulers[sff.index()]
            .take()
            .expect("schedulers are not reentrant");
        let result = f(&mut scheduler, self);
        self.schedulers[sff.index()] = Some(scheduler);
        result
    }

    /// Run a closure with read access to the scheduler of an SFF.
    pub fn scheduler<R>(&self, sff: crate::types::SffId, f: impl FnOnce(&dyn Scheduler) -> R) -> R {
        f(self.schedulers[sff.index()]
            .as_deref()
            .expect("scheduler is in its slot"))
    }

    /// Register a hook fired for every packet reaching a terminal state.
    pub fn on_packet_teardown(&mut self, hook: TeardownHook) {
        self.teardown_hooks.push(hook);
    }

    /// Register a hook fired for every packet entering the network.
    pub fn on_packet_ingress(&mut self, hook: IngressHook) {
        self.ingress_hooks.push(hook);
    }

    /// Register a hook fired by the periodic statistics polling event; the
    /// polling must be activated with
    /// [`Simulator::activate_statistics_polling`].
    pub fn on_poll(&mut self, hook: PollHook) {
        self.poll_hooks.push(hook);
    }

    /// Schedule the periodic statistics polling event.
    pub fn activate_statistics_polling(&mut self, interval: SimTime) {
        self.schedule_in(interval, Event::StatisticsPoll { interval });
    }

    /// Register the workload generator and pull the first slice of ingress
    /// events (all of them with `fetch_all`).
    pub fn register_workload(
        &mut self,
        workload: Box<dyn Workload>,
        fetch_all: bool,
    ) -> Result<(), SimError> {
        if self.workload.is_some() {
            return Err(crate::types::ConfigError::WorkloadAlreadyRegistered.into());
        }
        self.workload_end_time = workload.expected_end_time();
        self.workload = Some(workload);
        let slice = if fetch_all { usize::MAX } else { SLICE_LENGTH };
        debug!("ask the workload generator for a slice of up to {slice} packets");
        self.pull_workload(slice, 0);
        self.workload_end_time = self
            .workload_end_time
            .max(self.queue.last_relevant_time().unwrap_or(0));
        Ok(())
    }

    /// Pull at least `min_events` ingress events from the workload, and
    /// keep pulling until the relevant horizon advanced by `min_future` µs.
    fn pull_workload(&mut self, min_events: usize, min_future: SimTime) {
        let Some(mut workload) = self.workload.take() else {
            return;
        };
        if !self.workload_done {
            let time_before = self.queue.last_relevant_time().unwrap_or(0);
            let mut added: usize = 0;
            loop {
                if added >= min_events
                    && self.queue.last_relevant_time().unwrap_or(0) >= time_before + min_future
                {
                    break;
                }
                match workload.next_packet(self) {
                    Some(spec) => {
                        let packet =
                            self.make_packet(spec.flow, spec.time, spec.transmission_size);
                        self.queue.push(spec.time, Event::Ingress(packet));
                        added += 1;
                    }
                    None => {
                        debug!("the workload generator is exhausted");
                        self.workload_done = true;
                        break;
                    }
                }
            }
            self.workload_end_time = self
                .workload_end_time
                .max(self.queue.last_relevant_time().unwrap_or(0));
        }
        self.workload = Some(workload);
    }

    /// Pop the next event; replenish the workload when the horizon nears
    /// exhaustion.
    fn pop_next_event(&mut self) -> Option<TimedEvent> {
        let event = self.queue.pop()?;
        if !self.workload_done && self.workload.is_some() && self.queue.near_horizon() {
            debug!("loading the next workload slice @{}µs", self.time);
            self.pull_workload(SLICE_LENGTH, SLICE_TIME);
        }
        Some(event)
    }

    /// Process events until one *relevant* event was handled (bookkeeping
    /// events on the way are executed, but do not count as a step).
    /// Returns `false` once no relevant event is left. Useful for
    /// interactive stepping; [`Simulator::run`] is the normal entry point.
    pub fn run_one_step(&mut self) -> Result<bool, SimError> {
        self.running = true;
        // without the guard, self-rescheduling bookkeeping events would
        // keep this loop alive forever
        while self.queue.relevant_len() > 0 {
            let Some(event) = self.pop_next_event() else {
                break;
            };
            self.time = event.time;
            let relevant = !event.event.ignore_when_finished();
            if relevant {
                self.last_relevant_time = self.time;
            }
            self.process_event(event.event)?;
            if relevant {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Run the simulation.
    pub fn run(&mut self, options: RunOptions) -> Result<SimpleStatistics, SimError> {
        assert!(!self.running, "a simulator can only run once");
        self.running = true;
        if self.workload.is_none() {
            self.workload_done = true;
        }
        if self.workload_end_time == 0 {
            self.workload_end_time = self.queue.peek_last_time().unwrap_or(0);
        }
        self.queue.log_snapshot();
        info!(
            "start simulation with {} events, workload ends @{}µs, max sim time {:?}",
            self.queue.len(),
            self.workload_end_time,
            options.max_sim_time
        );

        let wall_start = Instant::now();
        let mut ticks: u64 = 0;
        let mut still_during_workload = true;

        while self.queue.relevant_len() > 0
            && options.max_sim_time.map_or(true, |max| self.time <= max)
        {
            ticks += 1;
            if options.progress && ticks % 4096 == 0 {
                self.log_progress(ticks, wall_start);
            }

            let Some(event) = self.pop_next_event() else {
                break;
            };

            if options.stop_when_workload_over
                && still_during_workload
                && event.time > self.workload_end_time
            {
                // put the event back; the sweep below accounts for it
                self.queue.push(event.time, event.event);
                self.ignore_schedule_attempts = true;
                self.sweep_remaining_packets();
                still_during_workload = false;
                info!("workload is over @{}µs, stop simulation", self.time);
                break;
            }

            self.time = event.time;
            if !event.event.ignore_when_finished() {
                self.last_relevant_time = self.time;
            }
            self.process_event(event.event)?;

            if self.queue.relevant_len() == 0 {
                info!("simulation done @{}µs: no relevant events left", self.time);
                break;
            }
        }

        self.ignore_schedule_attempts = true;
        if self.queue.relevant_len() > 0 && still_during_workload {
            info!(
                "simulation stops @{}µs: reached the maximum simulation time",
                self.time
            );
        }

        // bookkeeping events (statistics flushes etc.) may still be pending
        if self.queue.len() > 0 && self.queue.relevant_len() == 0 {
            debug!("process all pending bookkeeping events");
            while let Some(event) = self.queue.pop() {
                self.process_event(event.event)?;
            }
        }

        let wall = wall_start.elapsed().as_secs_f64();
        info!(
            "simulation done: {ticks} ticks, ~{:.0} ticks/s, {:.2}x speedup \
             ({:.2}s simulated in {wall:.2}s)",
            ticks as f64 / wall,
            self.last_relevant_time as f64 / 1e6 / wall,
            self.last_relevant_time as f64 / 1e6,
        );
        Ok(self.simple_statistics())
    }

    /// Process a single event.
    fn process_event(&mut self, event: Event) -> Result<(), SimError> {
        match event {
            Event::Ingress(packet) => {
                self.last_packet_ingress_time = self.time;
                self.counters.in_system += 1;
                self.counters.ingress += 1;

                let mut hooks = std::mem::take(&mut self.ingress_hooks);
                for hook in hooks.iter_mut() {
                    hook(self.time, &self.flows[packet.flow.index()], &packet);
                }
                debug_assert!(self.ingress_hooks.is_empty());
                self.ingress_hooks = hooks;

                let sff = self.flows[packet.flow.index()].ingress_sff;
                self.sff_receive(sff, packet, PacketSource::Ingress)
            }
            Event::NetworkDelay {
                mut packet,
                source,
                dest,
            } => {
                if let (Hop::Sff(s), Hop::Sff(d)) = (source, dest) {
                    if self.topo.consider_link_capacity {
                        self.sff_free_bw_resources(s, d, packet.transmission_size);
                    }
                }
                let delta = packet.take_delta(self.time);
                packet.timers.network += delta;
                match (source, dest) {
                    (Hop::Sff(s), Hop::Sff(d)) => {
                        self.sff_receive(d, packet, PacketSource::Sff(s))
                    }
                    (Hop::Sfi(s), Hop::Sff(d)) => {
                        self.sff_receive(d, packet, PacketSource::Sfi(s))
                    }
                    (_, Hop::Sfi(d)) => self.sfi_enqueue_packet(d, packet),
                }
            }
            Event::SfiProcess { mut packet, sfi } => {
                let delta = packet.take_delta(self.time);
                packet.timers.processing += delta;
                self.sfi_finished_processing(sfi, packet)
            }
            Event::DoScheduling(sff) => self
                .with_scheduler(sff, |scheduler, sim| scheduler.trigger_scheduling_logic(sim))
                .map(|_| ()),
            Event::CpuShareRefresh { server, interval } => {
                self.process_cpu_share_refresh(server, interval);
                Ok(())
            }
            Event::RateEstimatorTick { period } => {
                self.process_rate_estimator_tick(period);
                Ok(())
            }
            Event::StatisticsPoll { interval } => {
                self.process_statistics_poll(interval);
                Ok(())
            }
        }
    }

    /// Handler of [`Event::StatisticsPoll`].
    fn process_statistics_poll(&mut self, interval: SimTime) {
        self.schedule_in(interval, Event::StatisticsPoll { interval });
        let mut hooks = std::mem::take(&mut self.poll_hooks);
        for hook in hooks.iter_mut() {
            hook(self);
        }
        debug_assert!(self.poll_hooks.is_empty());
        self.poll_hooks = hooks;
    }

    /// Collect every packet still held anywhere (scheduler queues, SFI
    /// queues, outbound link queues, in-flight events), settle its active
    /// time bucket, and move it to its terminal state.
    fn sweep_remaining_packets(&mut self) {
        let mut held: Vec<Packet> = vec![];

        for sff in self.sffs.iter_mut() {
            match &mut sff.queues {
                SffQueues::Single(q) => held.extend(std::mem::take(q)),
                SffQueues::PerClass(qs) => {
                    for q in qs.values_mut() {
                        held.extend(std::mem::take(q));
                    }
                }
            }
        }
        let now = self.time;
        for p in held.iter_mut() {
            let delta = p.take_delta(now);
            p.timers.queue_scheduling += delta;
        }

        let mut out_queued: Vec<Packet> = vec![];
        for sff in self.sffs.iter_mut() {
            for q in sff.out_queue.values_mut() {
                out_queued.extend(std::mem::take(q));
            }
        }
        for p in out_queued.iter_mut() {
            let delta = p.take_delta(now);
            p.timers.queue_network += delta;
        }
        held.extend(out_queued);

        let mut sfi_queued: Vec<Packet> = vec![];
        for sfi in self.sfis.iter_mut() {
            sfi_queued.extend(std::mem::take(&mut sfi.queue));
        }
        for p in sfi_queued.iter_mut() {
            let delta = p.take_delta(now);
            p.timers.queue_processing += delta;
        }
        held.extend(sfi_queued);

        for event in self.queue.drain_all() {
            held.extend(event.event.settle_held_packet(now));
        }

        debug!("sweeping {} packets still in the system", held.len());
        for packet in held {
            self.handle_stop_simulation(packet);
        }
    }

    /// Aggregate statistics of the (finished) run.
    pub fn simple_statistics(&self) -> SimpleStatistics {
        let delivered =
            self.counters.success - self.counters.after_workload_end_no_timeout;
        let mut idle_time: SimTime = 0;
        for server in &self.servers {
            idle_time += server.stats_idle_time;
            if self.server_is_free(server.id) {
                idle_time += self.time - server.stats_last_time_idle;
            }
        }
        let idle_ratio = if self.time == 0 || self.servers.is_empty() {
            0.0
        } else {
            100.0 * (idle_time as f64 / self.servers.len() as f64) / self.time as f64
        };
        SimpleStatistics {
            total_scheduling_attempts: self
                .schedulers
                .iter()
                .map(|s| s.as_ref().expect("scheduler is in its slot").core().scheduling_attempts)
                .sum(),
            success_rate: self.counters.success as f64 / self.counters.total.max(1) as f64,
            reject_rate: self.counters.reject_schedule as f64 / self.counters.total.max(1) as f64,
            service_quality: if delivered == 0 {
                0.0
            } else {
                1.0 - self.counters.qos_ratio_sum / delivered as f64
            },
            server_idle_time: idle_time,
            server_idle_time_ratio: idle_ratio,
        }
    }

    /// One-line progress summary, logged every few thousand ticks.
    fn log_progress(&self, ticks: u64, wall_start: Instant) {
        let progress = if self.time <= self.workload_end_time && self.workload_end_time > 0 {
            format!("{}%", 100 * self.time / self.workload_end_time)
        } else {
            "workload finished".to_string()
        };
        let elapsed = wall_start.elapsed().as_secs_f64() + 0.1;
        info!(
            "[{progress}] @{}µs ({:.0} t/s) delivered {}/{} \
             (timeout:{} reject:{} in-system:{})",
            self.time,
            ticks as f64 / elapsed,
            self.counters.success,
            self.counters.total,
            self.counters.timeout,
            self.counters.reject_schedule,
            self.counters.in_system,
        );
    }
}
