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

//! SFF topology: the directed link graph, latency distributions, and the
//! precomputed all-pairs shortest-latency paths.
//!
//! All SFFs must be created before the first link exists; afterwards the
//! topology is frozen and matrices are sized. Multi-hop lookups lazily
//! trigger a Floyd–Warshall pass over the *expected* link latencies (the
//! mean of 500 samples per distribution). A pair with an end-to-end
//! bandwidth of zero has no path; looking it up is a [`RoutingError`].

use std::collections::BTreeMap;

use log::{debug, info};
use petgraph::prelude::*;

use crate::types::{ConfigError, IndexType, RoutingError, SffId, SimTime};

/// Number of samples drawn per distribution to estimate its mean latency.
const EXPECTED_LATENCY_SAMPLES: usize = 500;

/// A finite integer sequence, sampled cyclically.
#[derive(Debug, Clone)]
pub struct LatencyDistribution {
    values: Vec<SimTime>,
    pos: usize,
}

impl LatencyDistribution {
    /// Create a distribution from a non-empty value sequence.
    pub fn new(values: Vec<SimTime>) -> Self {
        assert!(!values.is_empty(), "latency distribution must be non-empty");
        Self { values, pos: 0 }
    }

    /// Draw the next sample (cyclic iteration).
    pub fn sample(&mut self) -> SimTime {
        let v = self.values[self.pos];
        self.pos = (self.pos + 1) % self.values.len();
        v
    }

    /// Mean of the next [`EXPECTED_LATENCY_SAMPLES`] samples. This consumes
    /// samples from the cycle, like every other draw.
    fn expected(&mut self) -> f64 {
        let sum: SimTime = (0..EXPECTED_LATENCY_SAMPLES).map(|_| self.sample()).sum();
        sum as f64 / EXPECTED_LATENCY_SAMPLES as f64
    }
}

/// A directed link between two SFFs.
#[derive(Debug, Clone)]
pub(crate) struct Link {
    /// Bandwidth cap. A cap of zero means "no link".
    pub bw_cap: u64,
    /// Bandwidth currently available. Decremented when a packet is put on
    /// the wire and restored when its network delay completes.
    pub bw_remaining: u64,
    /// Id of the latency distribution sampled per transmission.
    pub latency_dist: usize,
}

/// Precomputed all-pairs shortest-latency data.
#[derive(Debug, Clone)]
struct Apsp {
    latency: Vec<Vec<f64>>,
    bw: Vec<Vec<u64>>,
    next_hop: Vec<Vec<IndexType>>,
}

/// The SFF link topology.
#[derive(Debug, Default)]
pub struct Topology {
    pub(crate) graph: DiGraph<(), Link, IndexType>,
    dists: BTreeMap<usize, LatencyDistribution>,
    /// Latency distribution used for every SFF↔SFI transmission.
    pub(crate) sfi_latency_dist: usize,
    /// Whether links enforce their bandwidth caps (per-destination FIFOs).
    pub consider_link_capacity: bool,
    frozen: bool,
    apsp: Option<Apsp>,
}

impl Topology {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of SFF nodes.
    pub fn num_sffs(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the node set is frozen (matrices are sized).
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Add an SFF node. Fails once the topology is frozen.
    pub(crate) fn add_sff_node(&mut self) -> Result<SffId, ConfigError> {
        if self.frozen {
            return Err(ConfigError::TopologyFrozen);
        }
        Ok(self.graph.add_node(()))
    }

    /// Freeze the node set. Called implicitly by the first
    /// [`Topology::add_link`], or explicitly for single-SFF setups that
    /// have no links at all.
    pub fn freeze(&mut self) {
        if !self.frozen {
            self.frozen = true;
            debug!("topology frozen with {} SFFs", self.num_sffs());
        }
    }

    /// Create (or replace) the latency distribution with the given id.
    pub fn set_latency_distribution(&mut self, id: usize, values: Vec<SimTime>) {
        self.dists.insert(id, LatencyDistribution::new(values));
    }

    /// Create a link between two SFFs with a bandwidth cap and a latency
    /// distribution. With `bidirectional`, the reverse link is created with
    /// the same parameters.
    pub fn add_link(
        &mut self,
        source: SffId,
        dest: SffId,
        bw_cap: u64,
        latency_dist: usize,
        bidirectional: bool,
    ) -> Result<(), ConfigError> {
        self.freeze();
        for id in [source, dest] {
            if self.graph.node_weight(id).is_none() {
                return Err(ConfigError::UnknownSff(id));
            }
        }
        if source == dest {
            return Err(ConfigError::SelfLink(source));
        }
        if !self.dists.contains_key(&latency_dist) {
            return Err(ConfigError::UnknownLatencyDistribution(latency_dist));
        }
        self.graph.add_edge(
            source,
            dest,
            Link {
                bw_cap,
                bw_remaining: bw_cap,
                latency_dist,
            },
        );
        if bidirectional {
            self.graph.add_edge(
                dest,
                source,
                Link {
                    bw_cap,
                    bw_remaining: bw_cap,
                    latency_dist,
                },
            );
        }
        Ok(())
    }

    /// Draw a sample from the given latency distribution.
    ///
    /// # Panics
    /// Panics if the distribution does not exist. Link creation validates
    /// distribution ids, so this only fires on an unvalidated id.
    pub fn sample_distribution(&mut self, dist: usize) -> SimTime {
        self.dists
            .get_mut(&dist)
            .unwrap_or_else(|| panic!("unknown latency distribution id: {dist}"))
            .sample()
    }

    /// Draw a latency sample for the direct link `source -> dest`.
    pub(crate) fn sample_link_latency(&mut self, source: SffId, dest: SffId) -> SimTime {
        let dist = self
            .link(source, dest)
            .map(|l| l.latency_dist)
            .expect("sampling latency of a non-existing link");
        self.sample_distribution(dist)
    }

    /// Draw a latency sample for an SFF↔SFI transmission.
    pub(crate) fn sample_sfi_latency(&mut self) -> SimTime {
        self.sample_distribution(self.sfi_latency_dist)
    }

    /// Get the direct link `source -> dest`, if it exists.
    pub(crate) fn link(&self, source: SffId, dest: SffId) -> Option<&Link> {
        self.graph
            .find_edge(source, dest)
            .map(|e| &self.graph[e])
            .filter(|l| l.bw_cap > 0)
    }

    /// Get the direct link `source -> dest` mutably, if it exists.
    pub(crate) fn link_mut(&mut self, source: SffId, dest: SffId) -> Option<&mut Link> {
        let e = self.graph.find_edge(source, dest)?;
        Some(&mut self.graph[e]).filter(|l| l.bw_cap > 0)
    }

    /// `true` if a direct link with nonzero capacity exists.
    pub fn connection_exists(&self, source: SffId, dest: SffId) -> bool {
        self.link(source, dest).is_some()
    }

    /// Expected multi-hop latency from `source` to `dest` (0 if equal).
    pub fn multi_hop_latency(&mut self, source: SffId, dest: SffId) -> Result<f64, RoutingError> {
        if source == dest {
            return Ok(0.0);
        }
        let apsp = self.apsp();
        let (s, d) = (source.index(), dest.index());
        if apsp.bw[s][d] == 0 {
            return Err(RoutingError::Disconnected(source, dest));
        }
        Ok(apsp.latency[s][d])
    }

    /// Minimum bandwidth along the shortest-latency path.
    pub fn multi_hop_bw(&mut self, source: SffId, dest: SffId) -> Result<u64, RoutingError> {
        let apsp = self.apsp();
        let (s, d) = (source.index(), dest.index());
        if apsp.bw[s][d] == 0 {
            return Err(RoutingError::Disconnected(source, dest));
        }
        Ok(apsp.bw[s][d])
    }

    /// First hop on the shortest-latency path from `source` to `dest`.
    pub fn next_hop(&mut self, source: SffId, dest: SffId) -> Result<SffId, RoutingError> {
        let apsp = self.apsp();
        let (s, d) = (source.index(), dest.index());
        if apsp.bw[s][d] == 0 {
            return Err(RoutingError::Disconnected(source, dest));
        }
        Ok(SffId::new(apsp.next_hop[s][d] as usize))
    }

    /// All SFFs on the shortest-latency path from `source` to `dest`,
    /// including `dest` but excluding `source`. Empty if they are equal.
    pub fn full_path_ids(
        &mut self,
        source: SffId,
        dest: SffId,
    ) -> Result<Vec<SffId>, RoutingError> {
        if source == dest {
            return Ok(vec![]);
        }
        let mut path = vec![];
        let mut hop = self.next_hop(source, dest)?;
        path.push(hop);
        while hop != dest {
            hop = self.next_hop(hop, dest)?;
            path.push(hop);
        }
        Ok(path)
    }

    /// Compute (or fetch) the all-pairs shortest-latency data.
    fn apsp(&mut self) -> &Apsp {
        if self.apsp.is_none() {
            self.init_end_to_end_paths();
        }
        self.apsp.as_ref().unwrap()
    }

    /// Floyd–Warshall over the expected link latencies. A path is only
    /// relaxed through `via` if both partial paths carry bandwidth; the
    /// end-to-end bandwidth is the bottleneck of the two.
    fn init_end_to_end_paths(&mut self) {
        self.freeze();
        let n = self.num_sffs();
        info!("computing end-to-end paths for {n} SFFs");

        let expected: BTreeMap<usize, f64> = self
            .dists
            .iter_mut()
            .map(|(id, dist)| (*id, dist.expected()))
            .collect();

        let mut latency = vec![vec![0.0; n]; n];
        let mut bw = vec![vec![0u64; n]; n];
        let mut next_hop = vec![vec![0 as IndexType; n]; n];

        for e in self.graph.edge_indices() {
            let (s, d) = self.graph.edge_endpoints(e).unwrap();
            let link = &self.graph[e];
            if link.bw_cap > 0 {
                bw[s.index()][d.index()] = link.bw_cap;
                latency[s.index()][d.index()] = expected[&link.latency_dist];
                next_hop[s.index()][d.index()] = d.index() as IndexType;
            }
        }

        for via in 0..n {
            for s in 0..n {
                for d in 0..n {
                    if s == d || s == via || d == via {
                        continue;
                    }
                    if bw[s][via] > 0 && bw[via][d] > 0 {
                        let new_latency = latency[s][via] + latency[via][d];
                        if bw[s][d] == 0 || new_latency < latency[s][d] {
                            latency[s][d] = new_latency;
                            next_hop[s][d] = next_hop[s][via];
                            bw[s][d] = bw[s][via].min(bw[via][d]);
                        }
                    }
                }
            }
        }

        self.apsp = Some(Apsp {
            latency,
            bw,
            next_hop,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sff(i: usize) -> SffId {
        SffId::new(i)
    }

    fn line_topology() -> Topology {
        // 0 -- 1 -- 2, plus a slow direct link 0 -- 2
        let mut topo = Topology::new();
        for _ in 0..3 {
            topo.add_sff_node().unwrap();
        }
        topo.set_latency_distribution(0, vec![10]);
        topo.set_latency_distribution(1, vec![100]);
        topo.add_link(sff(0), sff(1), 1000, 0, true).unwrap();
        topo.add_link(sff(1), sff(2), 500, 0, true).unwrap();
        topo.add_link(sff(0), sff(2), 800, 1, true).unwrap();
        topo
    }

    #[test]
    fn distribution_cycles() {
        let mut d = LatencyDistribution::new(vec![1, 2, 3]);
        let samples: Vec<_> = (0..7).map(|_| d.sample()).collect();
        assert_eq!(samples, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn shortest_path_via_middle() {
        let mut topo = line_topology();
        // 10 + 10 via SFF1 beats the direct 100.
        assert_eq!(topo.multi_hop_latency(sff(0), sff(2)).unwrap(), 20.0);
        assert_eq!(topo.multi_hop_bw(sff(0), sff(2)).unwrap(), 500);
        assert_eq!(topo.next_hop(sff(0), sff(2)).unwrap(), sff(1));
        assert_eq!(
            topo.full_path_ids(sff(0), sff(2)).unwrap(),
            vec![sff(1), sff(2)]
        );
        assert_eq!(topo.multi_hop_latency(sff(1), sff(1)).unwrap(), 0.0);
    }

    #[test]
    fn disconnected_pair_fails() {
        let mut topo = Topology::new();
        for _ in 0..2 {
            topo.add_sff_node().unwrap();
        }
        topo.set_latency_distribution(0, vec![1]);
        topo.freeze();
        assert_eq!(
            topo.multi_hop_latency(sff(0), sff(1)),
            Err(RoutingError::Disconnected(sff(0), sff(1)))
        );
    }

    #[test]
    fn frozen_topology_rejects_new_sff() {
        let mut topo = line_topology();
        assert_eq!(topo.add_sff_node(), Err(ConfigError::TopologyFrozen));
    }

    #[test]
    fn link_requires_known_distribution() {
        let mut topo = Topology::new();
        let a = topo.add_sff_node().unwrap();
        let b = topo.add_sff_node().unwrap();
        assert_eq!(
            topo.add_link(a, b, 10, 7, false),
            Err(ConfigError::UnknownLatencyDistribution(7))
        );
    }

    #[test]
    fn apsp_triangle_inequality() {
        let mut topo = line_topology();
        let n = topo.num_sffs();
        for s in 0..n {
            for d in 0..n {
                if s == d {
                    continue;
                }
                let direct = match topo.multi_hop_latency(sff(s), sff(d)) {
                    Ok(l) => l,
                    Err(_) => continue,
                };
                for via in 0..n {
                    if via == s || via == d {
                        continue;
                    }
                    if let (Ok(a), Ok(b)) = (
                        topo.multi_hop_latency(sff(s), sff(via)),
                        topo.multi_hop_latency(sff(via), sff(d)),
                    ) {
                        assert!(direct <= a + b);
                    }
                }
            }
        }
    }
}
