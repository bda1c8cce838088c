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

//! Service function instances: per-instance FIFO queues, CPU shares, and
//! the processing pipeline.

use std::collections::VecDeque;

use log::debug;

use crate::event::Event;
use crate::model::Packet;
use crate::simulator::Simulator;
use crate::types::{
    ConfigError, CpuPolicy, Hop, ServerId, SfType, SffId, SfiId, SimError, SimTime, MICROS_PER_SEC,
};

/// A runnable instance of a service function on a server.
#[derive(Debug)]
pub struct Sfi {
    /// Identifier of this SFI.
    pub id: SfiId,
    /// The SF type this instance runs.
    pub sf_type: SfType,
    /// The hosting server.
    pub server: ServerId,
    /// The SFF responsible for scheduling onto this instance.
    pub sff: SffId,
    /// Packets waiting to be processed.
    pub queue: VecDeque<Packet>,
    /// `false` while a packet is being processed.
    pub free: bool,
    /// A share refresh was requested while busy and is performed once the
    /// current packet is done.
    pub(crate) refresh_shares: bool,
    /// CPU shares currently held.
    pub cpu_shares: u64,
    /// Weight assigned by the server, in `[0, granularity]`.
    pub(crate) weight: u64,
    /// Cached time to process one packet with the current shares.
    pub(crate) cached_time_to_process: SimTime,
}

impl Simulator {
    /// Initialize the SF type table: `num_sf_types` types and the latency
    /// distribution used for all SFF↔SFI transmissions.
    pub fn init_sf_types(&mut self, num_sf_types: usize, latency_dist: usize) {
        assert!(
            self.sf_rates.is_none(),
            "the SF type table may only be initialized once"
        );
        self.sf_rates = Some(vec![0; num_sf_types]);
        self.topo.sfi_latency_dist = latency_dist;
    }

    /// Set the processing rate of an SF type, in packets per second per CPU
    /// share. An SFI holding `s` shares with an empty queue finishes a
    /// packet after `1_000_000 / (rate * s)` µs.
    pub fn set_sf_processing_rate(&mut self, sf_type: SfType, rate: u64) -> Result<(), ConfigError> {
        let table = self
            .sf_rates
            .as_mut()
            .ok_or(ConfigError::SfTypesNotInitialized)?;
        if sf_type >= table.len() {
            return Err(ConfigError::UnknownSfType(sf_type));
        }
        table[sf_type] = rate;
        // refresh the cached processing time of every existing instance
        for sfi in 0..self.sfis.len() {
            if self.sfis[sfi].sf_type == sf_type {
                self.sfi_refresh_processing_speed(SfiId(sfi));
            }
        }
        Ok(())
    }

    /// The processing rate of an SF type.
    pub(crate) fn sf_rate(&self, sf_type: SfType) -> u64 {
        self.sf_rates.as_ref().expect("SF table initialized")[sf_type]
    }

    /// Number of known SF types.
    pub fn num_sf_types(&self) -> usize {
        self.sf_rates.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Get an SFI by id.
    pub fn sfi(&self, id: SfiId) -> &Sfi {
        &self.sfis[id.index()]
    }

    /// Number of SFIs.
    pub fn num_sfis(&self) -> usize {
        self.sfis.len()
    }

    /// Allocate the SFI entity itself (called by [`Simulator::add_sfi`]).
    pub(crate) fn create_sfi(
        &mut self,
        server: ServerId,
        sf_type: SfType,
        sff: SffId,
    ) -> Result<SfiId, ConfigError> {
        let table = self
            .sf_rates
            .as_ref()
            .ok_or(ConfigError::SfTypesNotInitialized)?;
        if sf_type >= table.len() || table[sf_type] == 0 {
            return Err(ConfigError::UnknownSfType(sf_type));
        }
        let cap = self.servers[server.index()].processing_cap;
        if MICROS_PER_SEC / (cap * table[sf_type]) == 0 {
            return Err(ConfigError::ProcessingTimeTooSmall { sf: sf_type, capacity: cap });
        }

        let id = SfiId(self.sfis.len());
        self.sfis.push(Sfi {
            id,
            sf_type,
            server,
            sff,
            queue: VecDeque::new(),
            free: true,
            refresh_shares: false,
            cpu_shares: 0,
            weight: 0,
            cached_time_to_process: 1,
        });
        Ok(id)
    }

    /// Expected waiting time before a newly arriving packet would start
    /// processing. This can be far off, depending on the CPU policy.
    pub(crate) fn sfi_expected_waiting_time(&self, sfi: SfiId) -> SimTime {
        let s = &self.sfis[sfi.index()];
        s.queue.len() as SimTime * self.sfi_expected_processing_time(sfi)
    }

    /// Expected time to process one packet. Under `one-at-a-time` this is
    /// the full-capacity time; otherwise it is the cached per-share time.
    pub(crate) fn sfi_expected_processing_time(&self, sfi: SfiId) -> SimTime {
        let s = &self.sfis[sfi.index()];
        let srv = &self.servers[s.server.index()];
        if srv.cpu_policy == CpuPolicy::OneAtATime {
            MICROS_PER_SEC / (srv.processing_cap * self.sf_rate(s.sf_type))
        } else {
            s.cached_time_to_process
        }
    }

    /// Expected processing rate in packets per second.
    pub(crate) fn sfi_expected_processing_rate(&self, sfi: SfiId) -> f64 {
        let s = &self.sfis[sfi.index()];
        let srv = &self.servers[s.server.index()];
        if srv.cpu_policy == CpuPolicy::OneAtATime {
            (srv.processing_cap * self.sf_rate(s.sf_type)) as f64
        } else {
            MICROS_PER_SEC as f64 / s.cached_time_to_process as f64
        }
    }

    /// The rate this SFI would sustain with the full server capacity. This
    /// is the static upper bound used for the schedulers' precomputed rate
    /// tables.
    pub(crate) fn sfi_static_rate(&self, sfi: SfiId) -> f64 {
        let s = &self.sfis[sfi.index()];
        (self.servers[s.server.index()].processing_cap * self.sf_rate(s.sf_type)) as f64
    }

    /// Return all shares to the server. Only valid while idle.
    pub(crate) fn sfi_free_all_server_shares(&mut self, sfi: SfiId) {
        let s = &mut self.sfis[sfi.index()];
        assert!(s.free);
        let shares = s.cpu_shares;
        s.cpu_shares = 0;
        self.servers[s.server.index()].available_shares += shares;
    }

    /// Adjust the held shares towards the target implied by the weight.
    /// While busy, the refresh is deferred until processing finishes so
    /// that shares in use are never freed.
    pub(crate) fn sfi_refresh_server_shares(&mut self, sfi: SfiId) {
        if !self.sfis[sfi.index()].free {
            self.sfis[sfi.index()].refresh_shares = true;
            return;
        }
        self.sfis[sfi.index()].refresh_shares = false;

        let granularity = self.cpu_share_granularity;
        let server = self.sfis[sfi.index()].server;
        let policy = self.servers[server.index()].cpu_policy;
        let shares_target =
            self.servers[server.index()].processing_cap * self.sfis[sfi.index()].weight
                / granularity;
        if policy != CpuPolicy::OneAtATime {
            assert!(shares_target > 0, "{sfi} would starve with 0 shares");
        }

        let held = self.sfis[sfi.index()].cpu_shares;
        if held > shares_target {
            self.servers[server.index()].available_shares += held - shares_target;
            self.sfis[sfi.index()].cpu_shares = shares_target;
        } else {
            let needed = shares_target - held;
            let available = self.servers[server.index()].available_shares;
            if available >= needed {
                self.servers[server.index()].available_shares -= needed;
                self.sfis[sfi.index()].cpu_shares = shares_target;
            } else {
                // take what is there; retry once the next refresh comes
                self.sfis[sfi.index()].cpu_shares += available;
                self.servers[server.index()].available_shares = 0;
                debug!("{sfi} is missing shares, holds only {}", held + available);
                self.sfis[sfi.index()].refresh_shares = true;
            }
        }
        self.sfi_refresh_processing_speed(sfi);
    }

    /// Update the cached per-packet processing time from the held shares.
    pub(crate) fn sfi_refresh_processing_speed(&mut self, sfi: SfiId) {
        let s = &self.sfis[sfi.index()];
        let rate = self.sf_rate(s.sf_type);
        assert!(rate > 0, "SF type {} has no processing rate", s.sf_type);

        let policy = self.servers[s.server.index()].cpu_policy;
        if policy == CpuPolicy::OneAtATime {
            if s.cpu_shares == 0 {
                return;
            }
        } else {
            assert!(s.cpu_shares > 0);
        }
        self.sfis[sfi.index()].cached_time_to_process =
            MICROS_PER_SEC / (rate * self.sfis[sfi.index()].cpu_shares);
    }

    /// A packet arrives at the SFI. Start processing if the instance is
    /// idle and the server grants processing; queue otherwise.
    pub(crate) fn sfi_enqueue_packet(&mut self, sfi: SfiId, mut packet: Packet) -> Result<(), SimError> {
        if self.trace_packet_path {
            packet.visited_hops.push(Hop::Sfi(sfi));
        }
        packet.mark_time(self.time);

        let server = self.sfis[sfi.index()].server;
        if self.sfis[sfi.index()].free {
            if self.server_ask_for_processing(server, sfi) {
                self.sfis[sfi.index()].free = false;
                self.sfi_internal_schedule(sfi, packet)?;
            } else {
                self.sfis[sfi.index()].queue.push_back(packet);
            }
        } else {
            self.sfis[sfi.index()].queue.push_back(packet);
        }
        Ok(())
    }

    /// The SFI is granted processing and must start on its queue head.
    pub(crate) fn sfi_notify_for_processing(&mut self, sfi: SfiId) {
        assert!(self.sfis[sfi.index()].free);
        assert!(!self.sfis[sfi.index()].queue.is_empty());
        let server = self.sfis[sfi.index()].server;
        assert!(self.server_ask_for_processing(server, sfi));
        self.sfis[sfi.index()].free = false;
        let packet = self.sfis[sfi.index()].queue.pop_front().unwrap();
        self.sfi_internal_schedule(sfi, packet)
            .expect("dropping a queued packet cannot fail");
    }

    /// Start processing a packet: drop every packet that would time out
    /// before finishing, then schedule the processing-done event.
    pub(crate) fn sfi_internal_schedule(
        &mut self,
        sfi: SfiId,
        mut packet: Packet,
    ) -> Result<(), SimError> {
        assert!(!self.sfis[sfi.index()].free);
        let server = self.sfis[sfi.index()].server;
        let policy = self.servers[server.index()].cpu_policy;

        loop {
            let deadline = self.flows[packet.flow.index()].qos_max_delay;
            let finish_delay =
                packet.delay(self.time) + self.sfis[sfi.index()].cached_time_to_process;
            if deadline >= finish_delay {
                break;
            }
            debug!("drop packet {} at {sfi}: would finish past its deadline", packet.id);
            let delta = packet.take_delta(self.time);
            packet.timers.queue_processing += delta;
            // the drop may release MPP accounting, which asserts that the
            // server is free
            self.sfis[sfi.index()].free = true;
            self.drop_timed_out(packet, Some(Hop::Sfi(sfi)))?;

            let may_continue = !self.sfis[sfi.index()].queue.is_empty()
                && self.sfis[sfi.index()].free
                && (policy != CpuPolicy::OneAtATime || self.server_ask_for_processing(server, sfi));
            if may_continue {
                self.sfis[sfi.index()].free = false;
                packet = self.sfis[sfi.index()].queue.pop_front().unwrap();
            } else {
                self.sfis[sfi.index()].free = true;
                if policy == CpuPolicy::OneAtATime {
                    self.server_sfi_finished(server);
                }
                return Ok(());
            }
        }

        packet.on_drop = None;
        let delta = packet.take_delta(self.time);
        packet.timers.queue_processing += delta;
        packet.mark_time(self.time);
        let processing_time = self.sfis[sfi.index()].cached_time_to_process;
        debug!(
            "start processing packet {} at {sfi} for {processing_time}µs",
            packet.id
        );
        self.schedule_in(processing_time, Event::SfiProcess { packet, sfi });
        Ok(())
    }

    /// A packet finished processing: advance its chain and path state and
    /// send it towards its next hop.
    pub(crate) fn sfi_finished_processing(
        &mut self,
        sfi: SfiId,
        mut packet: Packet,
    ) -> Result<(), SimError> {
        // perform a share refresh that was deferred while busy
        if self.sfis[sfi.index()].refresh_shares {
            self.sfis[sfi.index()].free = true;
            self.sfi_refresh_server_shares(sfi);
            self.sfis[sfi.index()].free = false;
        }

        let server = self.sfis[sfi.index()].server;
        if self.servers[server.index()].cpu_policy == CpuPolicy::OneAtATime {
            self.sfis[sfi.index()].free = true;
            self.server_sfi_finished(server);
        } else if let Some(next) = self.sfis[sfi.index()].queue.pop_front() {
            self.sfi_internal_schedule(sfi, next)?;
        } else {
            self.sfis[sfi.index()].free = true;
        }

        let sff = self.sfis[sfi.index()].sff;
        self.sff_notify_sfi_finished(sff, sfi, &mut packet)?;

        let next_hop = packet.full_path[packet.path_position];
        packet.path_position += 1;

        // is this the last stop of the sfc?
        if self.packet_sf_and_eoc(&packet).1 {
            packet.processing_done = true;
        }
        packet.sfc_position += 1;

        packet.mark_time(self.time);
        let delay = self.topo.sample_sfi_latency();
        match next_hop {
            Hop::Sff(dest) => {
                // the packet always returns to the SFF this SFI belongs to
                assert_eq!(self.sfis[sfi.index()].sff, dest);
                self.schedule_network_delay(delay, packet, Hop::Sfi(sfi), Hop::Sff(dest));
            }
            Hop::Sfi(dest) => {
                // direct SFI-to-SFI handover is only valid within one SFF
                assert_eq!(self.sfis[sfi.index()].sff, self.sfis[dest.index()].sff);
                self.schedule_network_delay(delay, packet, Hop::Sfi(sfi), Hop::Sfi(dest));
            }
        }
        Ok(())
    }
}
