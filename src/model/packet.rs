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

//! Packets, their timing decomposition, and their terminal transitions.

use std::collections::VecDeque;

use log::debug;

use crate::simulator::Simulator;
use crate::types::{ClassId, FinalState, FlowId, Hop, SfType, SimError, SimTime};

/// Cumulative per-packet time buckets, all in µs of virtual time.
///
/// At any point in a packet's life exactly one bucket is "active" (the
/// packet's time marker is set); the sum of all buckets plus the active
/// delta equals the packet's time in the system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketTimers {
    /// Time spent being processed by SFIs.
    pub processing: SimTime,
    /// Time spent on the wire.
    pub network: SimTime,
    /// Time spent waiting in SFI queues.
    pub queue_processing: SimTime,
    /// Time spent waiting for link bandwidth.
    pub queue_network: SimTime,
    /// Time spent waiting in scheduler queues.
    pub queue_scheduling: SimTime,
}

impl PacketTimers {
    /// Sum of all buckets. For a packet in a terminal state this equals its
    /// end-to-end delay.
    pub fn total(&self) -> SimTime {
        self.processing
            + self.network
            + self.queue_processing
            + self.queue_network
            + self.queue_scheduling
    }
}

/// Action to perform when a packet is dropped mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DropAction {
    /// Release the MPP underway accounting of the SFI the packet was
    /// heading to.
    MppRelease,
}

/// A packet travelling through the network.
#[derive(Debug)]
pub struct Packet {
    /// Unique, dense packet id.
    pub id: u64,
    /// The flow this packet belongs to.
    pub flow: FlowId,
    /// Time at which the packet entered the network.
    pub time_ingress: SimTime,
    /// Whether all SFs of the chain have processed this packet.
    pub processing_done: bool,
    /// Position with respect to the SFC: `1` means the next SFI to visit is
    /// of the type of the second chain element.
    pub sfc_position: usize,
    /// Position within [`Packet::full_path`]: everything before it has been
    /// consumed.
    pub path_position: usize,
    /// The full path. Incremental schedulers extend this piece by piece.
    pub full_path: Vec<Hop>,
    /// The SF types that still need to be visited.
    pub to_be_visited: VecDeque<SfType>,
    /// Size of the packet, in link-bandwidth units.
    pub transmission_size: u64,
    /// How many times a scheduler has seen this packet.
    pub seen_by_scheduler: u32,
    /// The cumulative timing decomposition.
    pub timers: PacketTimers,
    /// Wall-clock seconds spent in scheduler logic for this packet.
    pub real_scheduling: f64,
    pub(crate) time_marker: Option<SimTime>,
    /// MPP: the packet currently counts against a server's underway budget.
    pub(crate) mpp_locking: bool,
    pub(crate) on_drop: Option<DropAction>,
    /// Every hop the packet visited. Only recorded when the simulator's
    /// packet tracing is enabled.
    pub visited_hops: Vec<Hop>,
}

impl Packet {
    /// Start the active time bucket at `now`.
    ///
    /// # Panics
    /// Panics if a bucket is already active.
    pub(crate) fn mark_time(&mut self, now: SimTime) {
        assert!(
            self.time_marker.is_none(),
            "packet {} already has an active time marker",
            self.id
        );
        self.time_marker = Some(now);
    }

    /// Close the active time bucket and return its length.
    ///
    /// # Panics
    /// Panics if no bucket is active.
    pub(crate) fn take_delta(&mut self, now: SimTime) -> SimTime {
        let marker = self
            .time_marker
            .take()
            .unwrap_or_else(|| panic!("packet {} has no active time marker", self.id));
        now - marker
    }

    /// Time this packet has spent in the system as of `now`.
    pub fn delay(&self, now: SimTime) -> SimTime {
        now - self.time_ingress
    }
}

impl Simulator {
    /// Create a packet of the given flow. The packet still needs to be
    /// wrapped into an ingress event.
    pub(crate) fn make_packet(
        &mut self,
        flow: FlowId,
        time_ingress: SimTime,
        transmission_size: u64,
    ) -> Packet {
        let f = &self.flows[flow.index()];
        assert!(time_ingress >= f.start_time);
        self.next_packet_id += 1;
        self.counters.total += 1;
        Packet {
            id: self.next_packet_id,
            flow,
            time_ingress,
            processing_done: false,
            sfc_position: 0,
            path_position: 0,
            full_path: vec![],
            to_be_visited: f.sf_type_chain.iter().copied().collect(),
            transmission_size,
            seen_by_scheduler: 0,
            timers: PacketTimers::default(),
            real_scheduling: 0.0,
            time_marker: None,
            mpp_locking: false,
            on_drop: None,
            visited_hops: vec![],
        }
    }

    /// Create a packet and schedule its ingress event. Workload generators
    /// feed the simulation through the lazy pull instead; this is the
    /// entry point for hand-crafted scenarios.
    pub fn inject_packet(&mut self, flow: FlowId, time_ingress: SimTime, transmission_size: u64) {
        let packet = self.make_packet(flow, time_ingress, transmission_size);
        self.schedule_event_at(time_ingress, crate::event::Event::Ingress(packet));
    }

    /// The class under which this packet is currently queued.
    pub fn packet_class(&self, packet: &Packet) -> ClassId {
        self.flows[packet.flow.index()].sfc_class + packet.sfc_position
    }

    /// The SF type this packet visits next, and whether that is the last
    /// stop of its SFC.
    pub fn packet_sf_and_eoc(&self, packet: &Packet) -> (SfType, bool) {
        self.classes.sf_of(self.packet_class(packet))
    }

    /// The packet reached its egress with the whole chain processed.
    pub(crate) fn packet_done(&mut self, packet: Packet) {
        let delay = packet.delay(self.time);
        let deadline = self.flows[packet.flow.index()].qos_max_delay;
        self.counters.success += 1;
        self.counters.qos_ratio_sum += delay as f64 / deadline as f64;
        self.tear_down(packet, FinalState::Done);
    }

    /// A scheduler rejected the packet.
    pub(crate) fn packet_reject(&mut self, packet: Packet) {
        self.counters.reject_schedule += 1;
        self.tear_down(packet, FinalState::RejectSchedule);
    }

    /// Drop a packet that exceeded its deadline. `caller` is the component
    /// at which the timeout was detected; it is needed to release MPP
    /// underway accounting for packets dropped mid-flight.
    pub(crate) fn drop_timed_out(
        &mut self,
        packet: Packet,
        caller: Option<Hop>,
    ) -> Result<(), SimError> {
        self.drop_timed_out_inner(packet, caller, false)
    }

    /// Like [`Simulator::drop_timed_out`], but for the end-of-workload
    /// sweep: drop actions are not executed anymore.
    pub(crate) fn drop_timed_out_end_of_sim(&mut self, packet: Packet) {
        self.drop_timed_out_inner(packet, None, true)
            .expect("no drop action runs at the end of the simulation")
    }

    fn drop_timed_out_inner(
        &mut self,
        mut packet: Packet,
        caller: Option<Hop>,
        end_of_sim: bool,
    ) -> Result<(), SimError> {
        self.counters.timeout += 1;

        // When the timeout happens while forwarding to the egress, the
        // class pointer is already past the last chain entry.
        let class = if packet.processing_done {
            ClassId(self.packet_class(&packet).index() - 1)
        } else {
            self.packet_class(&packet)
        };
        self.classes.drops_per_class[class.index()] += 1;

        if let Some(action) = packet.on_drop.take() {
            if !end_of_sim {
                match action {
                    DropAction::MppRelease => {
                        let sfi = self.dropped_packet_target_sfi(&packet, caller)?;
                        crate::scheduler::mpp::release_dropped_packet(self, sfi, &mut packet);
                    }
                }
            }
        }
        self.tear_down(packet, FinalState::Timeout);
        Ok(())
    }

    /// The SFI a dropped packet was heading to: the caller itself if the
    /// drop happened at an SFI, otherwise the next SFI on the remaining
    /// path.
    fn dropped_packet_target_sfi(
        &self,
        packet: &Packet,
        caller: Option<Hop>,
    ) -> Result<crate::types::SfiId, SimError> {
        match caller {
            Some(Hop::Sfi(sfi)) => Ok(sfi),
            Some(Hop::Sff(_)) => packet.full_path[packet.path_position..]
                .iter()
                .find_map(|hop| match hop {
                    Hop::Sfi(sfi) => Some(*sfi),
                    Hop::Sff(_) => None,
                })
                .ok_or_else(|| {
                    SimError::Inconsistency(format!(
                        "packet {} was dropped with a pending drop action, \
                         but there is no SFI left on its path",
                        packet.id
                    ))
                }),
            None => Err(SimError::Inconsistency(format!(
                "packet {} was dropped with a pending drop action, \
                 but the dropping component is unknown",
                packet.id
            ))),
        }
    }

    /// Record the terminal state and fire the teardown hooks exactly once.
    fn tear_down(&mut self, packet: Packet, state: FinalState) {
        let delay = packet.delay(self.time);
        debug!("packet {} reaches terminal state {state} after {delay}µs", packet.id);
        self.counters.in_system -= 1;
        self.counters.sum_delay += delay;

        let mut hooks = std::mem::take(&mut self.teardown_hooks);
        for hook in hooks.iter_mut() {
            hook(self.time, &packet, state);
        }
        // a teardown hook must not register further teardown hooks
        debug_assert!(self.teardown_hooks.is_empty());
        self.teardown_hooks = hooks;
    }

    /// Classify a packet that is still in the system when the simulation
    /// stops: count it as a timeout if it already exceeded its deadline,
    /// and as (unaccounted) successfully delivered otherwise.
    pub(crate) fn handle_stop_simulation(&mut self, packet: Packet) {
        let deadline = self.flows[packet.flow.index()].qos_max_delay;
        if packet.delay(self.time) >= deadline {
            self.drop_timed_out_end_of_sim(packet);
        } else {
            self.counters.in_system -= 1;
            self.counters.success += 1;
            self.counters.after_workload_end_no_timeout += 1;
        }
    }
}
