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

//! Module for defining events

pub(crate) mod queue;
pub use queue::EventQueue;

use crate::{
    model::Packet,
    types::{Hop, ServerId, SffId, SfiId, SimTime},
};

/// Event to handle. Variants that hold a packet are the packet's owner while
/// the packet is "in flight" between two components.
#[derive(Debug)]
pub enum Event {
    /// A packet enters the network at its flow's ingress SFF.
    Ingress(Packet),
    /// A packet traverses a link (SFF↔SFF, SFF→SFI, or SFI→SFF/SFI). The
    /// hops identify where bandwidth must be released and where the packet
    /// is delivered.
    NetworkDelay {
        /// The packet on the wire.
        packet: Packet,
        /// Where the packet was sent from.
        source: Hop,
        /// Where the packet is delivered.
        dest: Hop,
    },
    /// An SFI finishes processing a packet.
    SfiProcess {
        /// The packet being processed.
        packet: Packet,
        /// The processing SFI.
        sfi: SfiId,
    },
    /// Trigger the scheduling logic of the given SFF's scheduler.
    DoScheduling(SffId),
    /// Periodic rebalance of a dynamic-policy server's CPU weights.
    CpuShareRefresh {
        /// The server to rebalance.
        server: ServerId,
        /// Rescheduling interval in µs.
        interval: SimTime,
    },
    /// Periodic update of all rate estimators with the given period.
    RateEstimatorTick {
        /// The estimator period in µs.
        period: SimTime,
    },
    /// Periodic statistics polling.
    StatisticsPoll {
        /// The polling interval in µs.
        interval: SimTime,
    },
}

impl Event {
    /// Events that only exist for bookkeeping (share refresh, estimator and
    /// polling ticks) do not keep the simulation alive: the main loop stops
    /// once only such events remain.
    pub fn ignore_when_finished(&self) -> bool {
        matches!(
            self,
            Event::CpuShareRefresh { .. }
                | Event::RateEstimatorTick { .. }
                | Event::StatisticsPoll { .. }
        )
    }

    /// Extract the held packet, settling its active time bucket at `now`.
    /// Used when the simulation stops early and in-flight packets must be
    /// accounted for.
    pub(crate) fn settle_held_packet(self, now: SimTime) -> Option<Packet> {
        match self {
            Event::Ingress(packet) => Some(packet),
            Event::NetworkDelay { mut packet, .. } => {
                let delta = packet.take_delta(now);
                packet.timers.network += delta;
                Some(packet)
            }
            Event::SfiProcess { mut packet, .. } => {
                let delta = packet.take_delta(now);
                packet.timers.processing += delta;
                Some(packet)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Ingress(p) => write!(f, "Ingress(packet {})", p.id),
            Event::NetworkDelay {
                packet,
                source,
                dest,
            } => write!(f, "NetworkDelay(packet {}, {source} -> {dest})", packet.id),
            Event::SfiProcess { packet, sfi } => {
                write!(f, "SfiProcess(packet {}, {sfi})", packet.id)
            }
            Event::DoScheduling(sff) => write!(f, "DoScheduling(SFF{})", sff.index()),
            Event::CpuShareRefresh { server, .. } => write!(f, "CpuShareRefresh({server})"),
            Event::RateEstimatorTick { period } => write!(f, "RateEstimatorTick({period}µs)"),
            Event::StatisticsPoll { interval } => write!(f, "StatisticsPoll({interval}µs)"),
        }
    }
}

/// An event together with its scheduled time and the insertion sequence
/// number that breaks ties among equal times (FIFO).
#[derive(Debug)]
pub struct TimedEvent {
    /// Absolute virtual time at which the event fires.
    pub time: SimTime,
    pub(crate) seq: u64,
    /// The event itself.
    pub event: Event,
}

impl PartialEq for TimedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for TimedEvent {}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.time, self.seq).cmp(&(other.time, other.seq))
    }
}
