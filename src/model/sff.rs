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

//! Service function forwarders: the receive path, scheduler queues, and
//! bandwidth-gated outbound links.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::{debug, trace};

use crate::model::Packet;
use crate::scheduler::Scheduler;
use crate::simulator::Simulator;
use crate::types::{
    ClassId, ConfigError, Hop, RoutingError, SfType, SffId, SfiId, SimError,
};

/// Where a packet at an SFF came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketSource {
    /// The packet just entered the network.
    Ingress,
    /// The packet arrived over a link from another SFF.
    Sff(SffId),
    /// The packet returned from an SFI.
    Sfi(SfiId),
    /// The local scheduler handed the packet back with a fresh path.
    Scheduler,
}

impl std::fmt::Display for PacketSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketSource::Ingress => f.write_str("ingress"),
            PacketSource::Sff(id) => write!(f, "SFF{}", id.index()),
            PacketSource::Sfi(id) => write!(f, "{id}"),
            PacketSource::Scheduler => f.write_str("scheduler"),
        }
    }
}

/// The scheduler queue(s) of an SFF. Which variant is used depends on
/// [`Scheduler::requires_queues_per_class`].
#[derive(Debug)]
pub enum SffQueues {
    /// One queue for all packets.
    Single(VecDeque<Packet>),
    /// One queue per packet class.
    PerClass(BTreeMap<ClassId, VecDeque<Packet>>),
}

impl SffQueues {
    /// Total number of queued packets.
    pub fn len(&self) -> usize {
        match self {
            SffQueues::Single(q) => q.len(),
            SffQueues::PerClass(qs) => qs.values().map(VecDeque::len).sum(),
        }
    }

    /// `true` if no packet is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The per-class queue map.
    ///
    /// # Panics
    /// Panics if this SFF uses a single queue.
    pub fn per_class(&self) -> &BTreeMap<ClassId, VecDeque<Packet>> {
        match self {
            SffQueues::PerClass(qs) => qs,
            SffQueues::Single(_) => panic!("this SFF uses a single queue"),
        }
    }

    /// The per-class queue map, mutably.
    ///
    /// # Panics
    /// Panics if this SFF uses a single queue.
    pub fn per_class_mut(&mut self) -> &mut BTreeMap<ClassId, VecDeque<Packet>> {
        match self {
            SffQueues::PerClass(qs) => qs,
            SffQueues::Single(_) => panic!("this SFF uses a single queue"),
        }
    }

    /// Pop the most recently enqueued packet (of the given class, for
    /// per-class queues). Schedulers use this to take back the packet whose
    /// arrival they are currently handling.
    pub(crate) fn pop_newest(&mut self, class: ClassId) -> Option<Packet> {
        match self {
            SffQueues::Single(q) => q.pop_back(),
            SffQueues::PerClass(qs) => qs.get_mut(&class)?.pop_back(),
        }
    }

    /// Peek at the most recently enqueued packet (of the given class).
    pub(crate) fn peek_newest(&self, class: ClassId) -> Option<&Packet> {
        match self {
            SffQueues::Single(q) => q.back(),
            SffQueues::PerClass(qs) => qs.get(&class)?.back(),
        }
    }

    fn peek_newest_mut(&mut self, class: ClassId) -> Option<&mut Packet> {
        match self {
            SffQueues::Single(q) => q.back_mut(),
            SffQueues::PerClass(qs) => qs.get_mut(&class)?.back_mut(),
        }
    }
}

/// A service function forwarder.
#[derive(Debug)]
pub struct Sff {
    /// Identifier (and topology node) of this SFF.
    pub id: SffId,
    /// The SFIs scheduled by this SFF, grouped by SF type.
    pub sfis_per_type: BTreeMap<SfType, Vec<SfiId>>,
    /// All servers hosting SFIs of this SFF.
    pub servers: BTreeSet<crate::types::ServerId>,
    /// Static service rate this SFF can offer per SF type (the sum of the
    /// full-capacity rates of its SFIs).
    pub service_rate_per_sf: BTreeMap<SfType, f64>,
    /// The scheduler queue(s).
    pub queues: SffQueues,
    /// Outbound packets waiting for link bandwidth, per destination.
    pub(crate) out_queue: BTreeMap<SffId, VecDeque<Packet>>,
}

impl Sff {
    /// Number of packets waiting in the scheduler queue(s).
    pub fn num_queued_packets(&self) -> usize {
        self.queues.len()
    }

    /// Number of packets waiting for outbound link bandwidth.
    pub fn num_out_queued_packets(&self) -> usize {
        self.out_queue.values().map(VecDeque::len).sum()
    }
}

impl Simulator {
    /// Create an SFF with its scheduler. SFFs must all be created before
    /// the first link exists.
    pub fn add_sff(&mut self, mut scheduler: Box<dyn Scheduler>) -> Result<SffId, ConfigError> {
        let id = self.topo.add_sff_node()?;
        let queues = if scheduler.requires_queues_per_class() {
            let mut qs = BTreeMap::new();
            // classes registered so far get their queue right away
            for c in 0..self.classes.num_classes() {
                qs.insert(ClassId(c), VecDeque::new());
            }
            SffQueues::PerClass(qs)
        } else {
            SffQueues::Single(VecDeque::new())
        };
        scheduler.assign_sff(id);
        self.sffs.push(Sff {
            id,
            sfis_per_type: BTreeMap::new(),
            servers: BTreeSet::new(),
            service_rate_per_sf: BTreeMap::new(),
            queues,
            out_queue: BTreeMap::new(),
        });
        self.schedulers.push(Some(scheduler));
        Ok(id)
    }

    /// Get an SFF by id.
    pub fn sff(&self, id: SffId) -> &Sff {
        &self.sffs[id.index()]
    }

    /// Number of SFFs.
    pub fn num_sffs(&self) -> usize {
        self.sffs.len()
    }

    /// Register a freshly created SFI at its responsible SFF.
    pub(crate) fn register_sfi_at_sff(&mut self, sff: SffId, sfi: SfiId) -> Result<(), ConfigError> {
        let (sf_type, server) = {
            let s = &self.sfis[sfi.index()];
            (s.sf_type, s.server)
        };
        // an SFF may only see one SFI per (server, SF type) pair
        let existing = self.sffs[sff.index()].sfis_per_type.entry(sf_type).or_default();
        if existing.iter().any(|other| self.sfis[other.index()].server == server) {
            return Err(ConfigError::DuplicateSfiOnServer { sff, server, sf: sf_type });
        }
        existing.push(sfi);
        self.sffs[sff.index()].servers.insert(server);

        let rate = self.sfi_static_rate(sfi);
        *self.sffs[sff.index()]
            .service_rate_per_sf
            .entry(sf_type)
            .or_insert(0.0) += rate;
        Ok(())
    }

    /// The receive path: every packet arriving at an SFF goes through this.
    pub(crate) fn sff_receive(
        &mut self,
        sff: SffId,
        mut packet: Packet,
        source: PacketSource,
    ) -> Result<(), SimError> {
        if self.trace_packet_path {
            packet.visited_hops.push(Hop::Sff(sff));
        }
        trace!(
            "SFF{} receives packet {} from {source}, path position {}/{}",
            sff.index(),
            packet.id,
            packet.path_position,
            packet.full_path.len()
        );

        // deadline check on every arrival
        if self.flows[packet.flow.index()].qos_max_delay < packet.delay(self.time) {
            debug!("drop packet {} at SFF{}: deadline exceeded", packet.id, sff.index());
            return self.drop_timed_out(packet, Some(Hop::Sff(sff)));
        }

        if packet.processing_done {
            let egress = self.flows[packet.flow.index()].desired_egress;
            // append the way to the egress once the scheduled path is used up
            if packet.to_be_visited.is_empty()
                && packet.full_path.len() == packet.path_position
                && sff != egress
            {
                for hop in self.topo.full_path_ids(sff, egress)? {
                    packet.full_path.push(Hop::Sff(hop));
                }
            }

            if packet.full_path.len() == packet.path_position {
                debug!("packet {} reached its egress", packet.id);
                assert_eq!(sff, egress);
                assert!(packet.to_be_visited.is_empty());
                self.packet_done(packet);
                return Ok(());
            }
            return self.sff_route_next_hop(sff, packet);
        }

        if packet.full_path.len() > packet.path_position {
            return self.sff_route_next_hop(sff, packet);
        }

        // nothing left on the path, processing not done: the scheduler must
        // decide how to continue
        if source == PacketSource::Scheduler {
            return Err(SimError::Inconsistency(format!(
                "the scheduler of SFF{} returned packet {} without a path",
                sff.index(),
                packet.id
            )));
        }
        let class = self.packet_class(&packet);
        self.sff_put_packet_in_queue(sff, packet);
        self.sff_inform_scheduler(sff, class)
    }

    /// A scheduler hands back a packet with a freshly appended path.
    pub(crate) fn sff_handle_from_scheduler(
        &mut self,
        sff: SffId,
        packet: Packet,
    ) -> Result<(), SimError> {
        self.sff_receive(sff, packet, PacketSource::Scheduler)
    }

    /// Enqueue a packet for the scheduler and start its queue-scheduling
    /// time bucket.
    fn sff_put_packet_in_queue(&mut self, sff: SffId, mut packet: Packet) {
        packet.mark_time(self.time);
        match &mut self.sffs[sff.index()].queues {
            SffQueues::Single(q) => q.push_back(packet),
            SffQueues::PerClass(qs) => {
                let class = self.flows[packet.flow.index()].sfc_class + packet.sfc_position;
                qs.entry(class).or_default().push_back(packet);
            }
        }
    }

    /// Notify the scheduler about the packet at the back of the given
    /// queue. Scheduling failures are swallowed (the packet was rejected)
    /// unless the simulator runs in strict mode.
    fn sff_inform_scheduler(&mut self, sff: SffId, class: ClassId) -> Result<(), SimError> {
        if let Some(p) = self.sffs[sff.index()].queues.peek_newest_mut(class) {
            p.seen_by_scheduler += 1;
        }
        let result = self.with_scheduler(sff, |sched, sim| sched.handle_packet_arrival(sim, class));
        match result {
            Err(SimError::Scheduling(failure)) if !self.strict_scheduling => {
                debug!("scheduler of SFF{} was unsuccessful: {failure}", sff.index());
                Ok(())
            }
            other => other,
        }
    }

    /// Consume the next hop of the packet's path and route accordingly.
    pub(crate) fn sff_route_next_hop(
        &mut self,
        sff: SffId,
        mut packet: Packet,
    ) -> Result<(), SimError> {
        let next_hop = packet.full_path[packet.path_position];
        packet.path_position += 1;
        match next_hop {
            Hop::Sff(dest) => self.sff_route_to_sff(sff, packet, dest),
            Hop::Sfi(dest) => {
                self.sff_route_to_sfi(sff, packet, dest);
                Ok(())
            }
        }
    }

    /// Route a packet onto the link towards another SFF, respecting the
    /// link's bandwidth if link capacities are enforced.
    fn sff_route_to_sff(
        &mut self,
        sff: SffId,
        mut packet: Packet,
        dest: SffId,
    ) -> Result<(), SimError> {
        debug!("route packet {} from SFF{} to SFF{}", packet.id, sff.index(), dest.index());
        packet.mark_time(self.time);

        let (cap, remaining) = self
            .topo
            .link(sff, dest)
            .map(|l| (l.bw_cap, l.bw_remaining))
            .unwrap_or((0, 0));
        if cap < packet.transmission_size {
            return Err(RoutingError::InsufficientLinkCapacity {
                from: sff,
                dest,
                capacity: cap,
                size: packet.transmission_size,
            }
            .into());
        }

        if self.topo.consider_link_capacity {
            let queue_empty = self.sffs[sff.index()]
                .out_queue
                .entry(dest)
                .or_default()
                .is_empty();
            if queue_empty && packet.transmission_size <= remaining {
                self.sff_put_packet_on_wire(sff, packet, dest);
            } else {
                self.sffs[sff.index()]
                    .out_queue
                    .get_mut(&dest)
                    .unwrap()
                    .push_back(packet);
            }
        } else {
            self.sff_put_packet_on_wire(sff, packet, dest);
        }
        Ok(())
    }

    /// Put a packet on the wire towards `dest`, deducting link bandwidth.
    /// Callers must have checked the capacity; use
    /// [`Simulator::sff_route_to_sff`] instead.
    pub(crate) fn sff_put_packet_on_wire(&mut self, sff: SffId, mut packet: Packet, dest: SffId) {
        let delta = packet.take_delta(self.time);
        packet.timers.queue_network += delta;
        packet.mark_time(self.time);

        let delay = self.topo.sample_link_latency(sff, dest);
        if self.topo.consider_link_capacity {
            self.topo.link_mut(sff, dest).unwrap().bw_remaining -= packet.transmission_size;
        }
        self.schedule_network_delay(delay, packet, Hop::Sff(sff), Hop::Sff(dest));
    }

    /// Release the bandwidth a packet held on the link `sff -> dest`, and
    /// put the next waiting packet on the wire if it fits.
    pub(crate) fn sff_free_bw_resources(&mut self, sff: SffId, dest: SffId, size: u64) {
        assert!(self.topo.consider_link_capacity);
        self.topo.link_mut(sff, dest).unwrap().bw_remaining += size;

        let remaining = self.topo.link(sff, dest).unwrap().bw_remaining;
        let fits = self.sffs[sff.index()]
            .out_queue
            .get(&dest)
            .and_then(|q| q.front())
            .map_or(false, |next| next.transmission_size <= remaining);
        if fits {
            let next = self.sffs[sff.index()]
                .out_queue
                .get_mut(&dest)
                .unwrap()
                .pop_front()
                .unwrap();
            self.sff_put_packet_on_wire(sff, next, dest);
        }
    }

    /// Route a packet to an SFI of this SFF.
    fn sff_route_to_sfi(&mut self, sff: SffId, mut packet: Packet, dest: SfiId) {
        debug!("route packet {} from SFF{} to {dest}", packet.id, sff.index());
        packet.mark_time(self.time);
        let delay = self.topo.sample_sfi_latency();
        self.schedule_network_delay(delay, packet, Hop::Sff(sff), Hop::Sfi(dest));
    }

    /// An SFI of this SFF finished a packet: let the scheduler update its
    /// bookkeeping.
    pub(crate) fn sff_notify_sfi_finished(
        &mut self,
        sff: SffId,
        sfi: SfiId,
        packet: &mut Packet,
    ) -> Result<(), SimError> {
        self.with_scheduler(sff, |sched, sim| {
            sched.notify_sfi_finished(sim, sfi, packet);
            Ok(())
        })
    }
}
