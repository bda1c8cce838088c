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

//! Servers and their CPU share policies.
//!
//! A server owns a set of SFIs and a fixed processing capacity. How that
//! capacity is distributed depends on the [`CpuPolicy`]: `static` splits it
//! equally once, `dynamic` rebalances periodically proportional to queue
//! lengths, and `one-at-a-time` grants the full capacity to a single SFI at
//! a time.

use std::collections::BTreeSet;

use log::{debug, warn};
use rand::seq::SliceRandom;

use crate::event::Event;
use crate::simulator::Simulator;
use crate::types::{ConfigError, CpuPolicy, ServerId, SfType, SffId, SfiId, SimTime};

/// A server hosting SFIs.
#[derive(Debug)]
pub struct Server {
    /// Identifier of this server.
    pub id: ServerId,
    /// Total processing capacity (shares).
    pub processing_cap: u64,
    /// How the capacity is split across the hosted SFIs.
    pub cpu_policy: CpuPolicy,
    /// The SFIs hosted on this server.
    pub sfis: Vec<SfiId>,
    /// All SFFs that schedule onto this server.
    pub sff_ids: BTreeSet<SffId>,
    /// Shares that are currently not held by any SFI.
    pub available_shares: u64,
    /// Accumulated µs during which all hosted SFIs were idle.
    pub stats_idle_time: SimTime,
    /// Start of the current idle interval.
    pub stats_last_time_idle: SimTime,
}

impl Simulator {
    /// Create a new server. For the dynamic policy, the periodic weight
    /// rebalance event is scheduled immediately.
    pub fn add_server(&mut self, processing_cap: u64, cpu_policy: CpuPolicy) -> ServerId {
        let id = ServerId(self.servers.len());
        self.servers.push(Server {
            id,
            processing_cap,
            cpu_policy,
            sfis: Vec::new(),
            sff_ids: BTreeSet::new(),
            available_shares: processing_cap,
            stats_idle_time: 0,
            stats_last_time_idle: 0,
        });
        if cpu_policy == CpuPolicy::Dynamic {
            let interval = self.dynamic_cpu_interval;
            self.schedule_in(interval, Event::CpuShareRefresh { server: id, interval });
        }
        id
    }

    /// Get a server by id.
    pub fn server(&self, id: ServerId) -> &Server {
        &self.servers[id.index()]
    }

    /// Number of servers.
    pub fn num_servers(&self) -> usize {
        self.servers.len()
    }

    /// Create a new SFI of the given type on a server, scheduled by the
    /// given SFF. For the static policy this re-splits the server's shares
    /// equally.
    pub fn add_sfi(
        &mut self,
        server: ServerId,
        sf_type: SfType,
        sff: SffId,
    ) -> Result<SfiId, ConfigError> {
        let sfi = self.create_sfi(server, sf_type, sff)?;

        let srv = &mut self.servers[server.index()];
        srv.sff_ids.insert(sff);
        srv.sfis.push(sfi);
        let num_sfis = srv.sfis.len();
        if srv.cpu_policy == CpuPolicy::Static && num_sfis as u64 > srv.processing_cap {
            return Err(ConfigError::ServerOversubscribed {
                server,
                sfis: num_sfis,
                capacity: srv.processing_cap,
            });
        }

        self.register_sfi_at_sff(sff, sfi)?;

        match self.servers[server.index()].cpu_policy {
            CpuPolicy::Static => {
                let eq = self.cpu_share_granularity / num_sfis as u64;
                assert!(eq > 0, "share granularity too small for {num_sfis} SFIs");
                debug!("{server} splits its shares statically, each weight is {eq}");
                // no SFI is processing during setup, so all shares can be
                // returned and re-taken under the new equal weights
                for id in self.servers[server.index()].sfis.clone() {
                    self.sfis[id.index()].weight = eq;
                    self.sfi_free_all_server_shares(id);
                }
                self.server_notify_recalculate(server);
            }
            CpuPolicy::Dynamic => self.server_update_dynamic_weights(server),
            CpuPolicy::OneAtATime => {}
        }
        Ok(sfi)
    }

    /// `true` iff every SFI hosted on the server is idle.
    pub fn server_is_free(&self, server: ServerId) -> bool {
        self.servers[server.index()]
            .sfis
            .iter()
            .all(|sfi| self.sfis[sfi.index()].free)
    }

    /// Ask whether `asking_sfi` may start processing. Always granted except
    /// under `one-at-a-time`, where it is granted only if the whole server
    /// is free; the grant moves all weight to the asking SFI.
    pub(crate) fn server_ask_for_processing(&mut self, server: ServerId, asking_sfi: SfiId) -> bool {
        let is_free = self.server_is_free(server);
        debug!("{server} asked for a processing token by {asking_sfi}: free={is_free}");

        if is_free {
            let now = self.time;
            let srv = &mut self.servers[server.index()];
            srv.stats_idle_time += now - srv.stats_last_time_idle;
            srv.stats_last_time_idle = now;
        }

        if self.servers[server.index()].cpu_policy != CpuPolicy::OneAtATime {
            return true;
        }
        if !is_free {
            return false;
        }

        let granularity = self.cpu_share_granularity;
        let sfis = self.servers[server.index()].sfis.clone();
        for id in &sfis {
            self.sfis[id.index()].weight = if *id == asking_sfi { granularity } else { 0 };
        }
        for id in &sfis {
            self.sfi_refresh_server_shares(*id);
        }
        // refresh the asking SFI once more: it may have been refreshed
        // before another SFI freed its shares
        self.sfi_refresh_server_shares(asking_sfi);
        true
    }

    /// An SFI on this server finished processing. Under `one-at-a-time`,
    /// wake up a random SFI with a non-empty queue.
    pub(crate) fn server_sfi_finished(&mut self, server: ServerId) {
        self.servers[server.index()].stats_last_time_idle = self.time;

        if self.servers[server.index()].cpu_policy == CpuPolicy::OneAtATime
            && self.server_is_free(server)
        {
            // shuffle instead of scanning by id, to avoid starving SF types
            let mut shuffled = self.servers[server.index()].sfis.clone();
            shuffled.shuffle(&mut self.rng);
            for sfi in shuffled {
                if !self.sfis[sfi.index()].queue.is_empty() {
                    self.sfi_notify_for_processing(sfi);
                    return;
                }
            }
        }
    }

    /// Let every SFI on the server re-take shares according to its weight.
    pub(crate) fn server_notify_recalculate(&mut self, server: ServerId) {
        for sfi in self.servers[server.index()].sfis.clone() {
            self.sfi_refresh_server_shares(sfi);
        }
    }

    /// Rebalance the weights of a dynamic-policy server proportionally to
    /// `queue_length + 1`, guaranteeing at least one share per SFI.
    pub(crate) fn server_update_dynamic_weights(&mut self, server: ServerId) {
        let sfis = self.servers[server.index()].sfis.clone();
        if sfis.is_empty() {
            warn!("{server} has no SFIs");
            return;
        }
        let granularity = self.cpu_share_granularity;
        let cap = self.servers[server.index()].processing_cap;

        let total_queue_length: u64 = sfis
            .iter()
            .map(|sfi| self.sfis[sfi.index()].queue.len() as u64)
            .sum();
        let denominator = total_queue_length + sfis.len() as u64;
        let weight_for_one_share = granularity / cap + 1;
        let weights_free_to_assign =
            granularity.saturating_sub(weight_for_one_share * sfis.len() as u64);

        let mut weight_remainder = granularity;
        for sfi in &sfis {
            let numerator = self.sfis[sfi.index()].queue.len() as u64 + 1;
            let weight = weight_for_one_share + weights_free_to_assign * numerator / denominator;
            self.sfis[sfi.index()].weight = weight;
            weight_remainder = weight_remainder.saturating_sub(weight);
        }
        while weight_remainder > 0 {
            for sfi in &sfis {
                if weight_remainder == 0 {
                    break;
                }
                self.sfis[sfi.index()].weight += 1;
                weight_remainder -= 1;
            }
        }

        self.server_notify_recalculate(server);
    }

    /// Handler of the periodic [`Event::CpuShareRefresh`].
    pub(crate) fn process_cpu_share_refresh(&mut self, server: ServerId, interval: SimTime) {
        self.schedule_in(interval, Event::CpuShareRefresh { server, interval });
        self.server_update_dynamic_weights(server);
    }
}
