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

//! Flows and the global packet-class registry.

use std::collections::HashMap;

use itertools::Itertools;
use log::debug;

use crate::model::SffQueues;
use crate::simulator::Simulator;
use crate::types::{ClassId, ConfigError, FlowId, SfType, SffId, SimTime};

/// A flow: a sequence of packets that share an SFC, a deadline, an ingress,
/// and a desired egress.
#[derive(Debug, Clone)]
pub struct Flow {
    /// Identifier of this flow.
    pub id: FlowId,
    /// The ordered chain of SF types every packet must traverse.
    pub sf_type_chain: Vec<SfType>,
    /// Maximum end-to-end delay before packets of this flow are dropped.
    pub qos_max_delay: SimTime,
    /// The SFF at which packets of this flow must leave the network.
    pub desired_egress: SffId,
    /// The SFF at which packets of this flow enter the network.
    pub ingress_sff: SffId,
    /// Time at which the flow starts.
    pub start_time: SimTime,
    /// Base packet class of this flow's SFC. A packet at chain position `i`
    /// is queued under class `sfc_class + i`.
    pub sfc_class: ClassId,
}

/// The global registry of packet classes.
///
/// Each registered SFC (optionally per egress, see
/// [`ClassRegistry::individual_class_per_egress`]) reserves a contiguous
/// range of classes, one per chain position. A class maps to the SF type
/// served at that position, whether the position is the last of the chain,
/// the deadline of the SFC, and (optionally) the egress. The registry is
/// append-only and frozen once the simulation starts.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: HashMap<String, ClassId>,
    class_to_sf: Vec<(SfType, bool)>,
    class_to_deadline: Vec<SimTime>,
    class_to_egress: Vec<Option<SffId>>,
    /// Per-class counter of timed-out packets.
    pub(crate) drops_per_class: Vec<u64>,
    /// Largest deadline of any registered SFC.
    pub(crate) max_deadline: Option<SimTime>,
    /// If set, the same SFC with different egresses maps to different
    /// classes.
    pub individual_class_per_egress: bool,
}

impl ClassRegistry {
    /// The identifier string under which an SFC (and possibly its egress)
    /// is registered.
    pub fn identifier(&self, chain: &[SfType], egress: SffId) -> String {
        let chain = chain.iter().map(|c| c.to_string()).join("-");
        if self.individual_class_per_egress {
            format!("{}:{}", chain, egress.index())
        } else {
            chain
        }
    }

    /// Number of allocated classes (the next free class).
    pub fn num_classes(&self) -> usize {
        self.class_to_sf.len()
    }

    /// The base class of a registered SFC identifier.
    pub fn base_class(&self, identifier: &str) -> Option<ClassId> {
        self.classes.get(identifier).copied()
    }

    /// The SF type of a class, and whether it is the last of its SFC.
    pub fn sf_of(&self, class: ClassId) -> (SfType, bool) {
        self.class_to_sf[class.index()]
    }

    /// The deadline of the SFC a class belongs to.
    pub fn deadline_of(&self, class: ClassId) -> SimTime {
        self.class_to_deadline[class.index()]
    }

    /// The egress of a class, if classes are per-egress.
    pub fn egress_of(&self, class: ClassId) -> Option<SffId> {
        self.class_to_egress[class.index()]
    }

    /// Number of packets of this class dropped due to their deadline.
    pub fn drops_of(&self, class: ClassId) -> u64 {
        self.drops_per_class[class.index()]
    }
}

impl Simulator {
    /// Create a new flow. If the (chain, egress) combination is new, its
    /// packet classes are registered; this is only allowed before the
    /// simulation starts.
    pub fn add_flow(
        &mut self,
        sf_type_chain: Vec<SfType>,
        qos_max_delay: SimTime,
        desired_egress: SffId,
        ingress_sff: SffId,
        start_time: SimTime,
    ) -> Result<FlowId, ConfigError> {
        assert!(!sf_type_chain.is_empty(), "a flow needs a non-empty chain");

        if self
            .classes
            .max_deadline
            .map_or(true, |d| d < qos_max_delay)
        {
            self.classes.max_deadline = Some(qos_max_delay);
        }

        let identifier = self.classes.identifier(&sf_type_chain, desired_egress);
        let sfc_class = match self.classes.base_class(&identifier) {
            Some(c) => c,
            None => self.register_sfc(&identifier, &sf_type_chain, qos_max_delay, desired_egress)?,
        };

        let id = FlowId(self.flows.len());
        self.flows.push(Flow {
            id,
            sf_type_chain,
            qos_max_delay,
            desired_egress,
            ingress_sff,
            start_time,
            sfc_class,
        });
        Ok(id)
    }

    /// Allocate the contiguous class range of a new SFC and create the
    /// per-class queues at every SFF whose scheduler requires them.
    fn register_sfc(
        &mut self,
        identifier: &str,
        chain: &[SfType],
        qos_max_delay: SimTime,
        egress: SffId,
    ) -> Result<ClassId, ConfigError> {
        if self.is_running() {
            return Err(ConfigError::SfcRegisteredAfterStart);
        }

        let base = ClassId(self.classes.num_classes());
        self.classes.classes.insert(identifier.to_string(), base);
        debug!("register sfc identifier {identifier} for packet class {base:?}");

        let per_egress = self.classes.individual_class_per_egress;
        for (i, sf) in chain.iter().enumerate() {
            let class = base + i;
            self.classes.class_to_sf.push((*sf, i + 1 == chain.len()));
            self.classes.class_to_deadline.push(qos_max_delay);
            self.classes
                .class_to_egress
                .push(per_egress.then_some(egress));
            self.classes.drops_per_class.push(0);

            for sff in self.sffs.iter_mut() {
                if let SffQueues::PerClass(queues) = &mut sff.queues {
                    queues.entry(class).or_default();
                }
            }
        }
        Ok(base)
    }

    /// Get a flow by id.
    pub fn flow(&self, id: FlowId) -> &Flow {
        &self.flows[id.index()]
    }

    /// Number of flows created so far.
    pub fn num_flows(&self) -> usize {
        self.flows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_with_and_without_egress() {
        let mut reg = ClassRegistry::default();
        assert_eq!(reg.identifier(&[0, 1, 2], SffId::new(4)), "0-1-2");
        reg.individual_class_per_egress = true;
        assert_eq!(reg.identifier(&[0, 1, 2], SffId::new(4)), "0-1-2:4");
    }
}
