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

//! Configuration loading and scenario construction.
//!
//! A [`SimConfig`] describes a multi-site scenario: sites of SFFs in a full
//! mesh (cheap links within a site, expensive links between sites), servers
//! with slightly randomized capacities, SFIs spread randomly across the
//! sites, and a synthetic workload. [`build`] turns the configuration into
//! a ready-to-run [`Simulator`].

use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};

use crate::scheduler::{
    GreedyShortestDeadlineFirstScheduler, LoadUnawareRoundRobinScheduler, MppOptions,
    MppScheduler, RejectScheduler, Scheduler,
};
use crate::simulator::Simulator;
use crate::types::{ConfigError, CpuPolicy, ServerId, SffId, SimError, SimTime};
use crate::workload::{SyntheticWorkload, WorkloadConfig};

/// Latency distribution id for links within a site (and SFF↔SFI).
pub const INTRA_SITE_LATENCY_ID: usize = 0;
/// Latency distribution id for links between sites.
pub const INTER_SITE_LATENCY_ID: usize = 1;

/// Bandwidth cap of every link in generated scenarios.
const LINK_BW_CAP: u64 = 100_000;
/// Number of samples a generated latency distribution holds.
const LATENCY_SAMPLES: usize = 5_000;

/// A complete simulation scenario configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Seed of all random generators.
    pub seed: u64,
    /// Expected latency between two sites (µs).
    pub latency_between_sites: u64,
    /// Expected latency within a site (µs).
    pub latency_within_sites: u64,
    /// Number of sites.
    pub sites: usize,
    /// Nominal server capacity (randomized to 80–120% per server).
    pub server_capacity: u64,
    /// Total number of SFIs spread across all sites.
    pub number_of_total_sfis: usize,
    /// Number of servers per site.
    pub number_of_servers_per_site: Vec<usize>,
    /// Number of SFFs per site.
    pub number_of_sff_per_site: Vec<usize>,
    /// Scheduler name: `greedy`, `static`, `reject`, or `mpp`.
    pub scheduler: String,
    /// Incremental scheduling (only the next chain hop at a time).
    pub scheduler_incremental: bool,
    /// Oracle scheduling (global view over all SFFs).
    pub scheduler_oracle: bool,
    /// CPU policy name: `one-at-a-time`, `dynamic`, or `static`.
    pub cpu_policy: String,
    /// Use separate packet classes per egress.
    pub individual_class_per_egress: bool,
    /// ACP lower admission threshold.
    pub admission_threshold_low: f64,
    /// ACP upper admission threshold.
    pub admission_threshold_high: f64,
    /// Statistics polling interval (µs), if any.
    pub statistics_polling: Option<SimTime>,
    /// The workload block.
    #[serde(flatten)]
    pub workload: WorkloadConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            latency_between_sites: 3_000,
            latency_within_sites: 700,
            sites: 1,
            server_capacity: 100,
            number_of_total_sfis: 14,
            number_of_servers_per_site: vec![8],
            number_of_sff_per_site: vec![1],
            scheduler: "greedy".to_string(),
            scheduler_incremental: true,
            scheduler_oracle: false,
            cpu_policy: "one-at-a-time".to_string(),
            individual_class_per_egress: false,
            admission_threshold_low: 0.1,
            admission_threshold_high: 1.0,
            statistics_polling: Some(50_000),
            workload: WorkloadConfig::default(),
        }
    }
}

impl SimConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(s: &str) -> Result<Self, SimError> {
        Ok(serde_json::from_str(s)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.number_of_servers_per_site.len() != self.sites {
            return Err(ConfigError::PerSiteLengthMismatch("number_of_servers_per_site"));
        }
        if self.number_of_sff_per_site.len() != self.sites {
            return Err(ConfigError::PerSiteLengthMismatch("number_of_sff_per_site"));
        }
        if self.workload.sf_processing_rate.len() != self.workload.number_of_sf_types {
            return Err(ConfigError::PerSiteLengthMismatch("sf_processing_rate"));
        }
        Ok(())
    }
}

/// Build a scheduler instance by its configured name.
fn make_scheduler(sim: &mut Simulator, config: &SimConfig) -> Result<Box<dyn Scheduler>, SimError> {
    Ok(match config.scheduler.as_str() {
        "greedy" => Box::new(GreedyShortestDeadlineFirstScheduler::new(
            config.scheduler_incremental,
            config.scheduler_oracle,
            config.admission_threshold_low,
            config.admission_threshold_high,
        )?),
        "static" => Box::new(LoadUnawareRoundRobinScheduler::new(
            config.scheduler_incremental,
            config.scheduler_oracle,
        )?),
        "reject" => Box::new(RejectScheduler::new(
            config.scheduler_incremental,
            config.scheduler_oracle,
        )),
        "mpp" => Box::new(MppScheduler::new(
            sim,
            MppOptions {
                oracle: config.scheduler_oracle,
                admission_control_threshold_low: config.admission_threshold_low,
                admission_control_threshold_high: config.admission_threshold_high,
                ..MppOptions::default()
            },
        )?),
        other => return Err(ConfigError::UnknownScheduler(other.to_string()).into()),
    })
}

/// Build the full scenario described by the configuration. With
/// `fetch_all_workload`, the entire workload is materialized up front
/// instead of being pulled lazily.
pub fn build(config: &SimConfig, fetch_all_workload: bool) -> Result<Simulator, SimError> {
    config.validate()?;
    let cpu_policy: CpuPolicy = config.cpu_policy.parse()?;
    let mut sim = Simulator::new(config.seed);
    sim.classes.individual_class_per_egress = config.individual_class_per_egress;

    // SFFs per site
    let mut sff_of_site: Vec<Vec<SffId>> = vec![];
    for site in 0..config.sites {
        let mut sffs = vec![];
        for _ in 0..config.number_of_sff_per_site[site] {
            let scheduler = make_scheduler(&mut sim, config)?;
            sffs.push(sim.add_sff(scheduler)?);
        }
        sff_of_site.push(sffs);
    }

    // links enforce their bandwidth caps
    sim.topo.consider_link_capacity = true;

    // latency distributions for intra- and inter-site links
    let mut setup_rng = StdRng::seed_from_u64(config.seed);
    sim.topo.set_latency_distribution(
        INTRA_SITE_LATENCY_ID,
        poisson_samples(&mut setup_rng, config.latency_within_sites),
    );
    sim.topo.set_latency_distribution(
        INTER_SITE_LATENCY_ID,
        poisson_samples(&mut setup_rng, config.latency_between_sites),
    );

    // full mesh within each site
    for sffs in &sff_of_site {
        for (i, sff) in sffs.iter().enumerate() {
            for other in &sffs[i + 1..] {
                sim.topo
                    .add_link(*sff, *other, LINK_BW_CAP, INTRA_SITE_LATENCY_ID, true)?;
            }
        }
    }
    // full mesh of sites
    for (site, sffs) in sff_of_site.iter().enumerate() {
        for sff in sffs {
            for (other_site, other_sffs) in sff_of_site.iter().enumerate() {
                if site == other_site {
                    continue;
                }
                for other in other_sffs {
                    sim.topo
                        .add_link(*sff, *other, LINK_BW_CAP, INTER_SITE_LATENCY_ID, true)?;
                }
            }
        }
    }
    // a single site with one SFF has no links at all
    sim.topo.freeze();

    sim.init_sf_types(config.workload.number_of_sf_types, INTRA_SITE_LATENCY_ID);
    for (sf, rate) in config.workload.sf_processing_rate.iter().enumerate() {
        sim.set_sf_processing_rate(sf, *rate)?;
    }

    // servers with slightly randomized capacity
    let mut rand = StdRng::seed_from_u64(config.seed);
    let mut server_of_site: Vec<Vec<ServerId>> = vec![];
    for site in 0..config.sites {
        let mut servers = vec![];
        for _ in 0..config.number_of_servers_per_site[site] {
            let capacity =
                (config.server_capacity as f64 * (rand.gen_range(80..=120) as f64 / 100.0)).round();
            servers.push(sim.add_server(capacity as u64, cpu_policy));
        }
        server_of_site.push(servers);
    }

    // spread the SFIs among all sites and servers with a simple random
    // placement, one SF type at most once per server
    let mut sfis_to_allocate = config.number_of_total_sfis;
    let mut sf_types: Vec<usize> = (0..config.workload.number_of_sf_types).collect();
    let mut shuffled_sites: Vec<usize> = (0..config.sites).collect();
    while sfis_to_allocate > 0 {
        let mut failed_allocation = true;
        shuffled_sites.shuffle(&mut rand);
        for site in &shuffled_sites {
            for server in server_of_site[*site].clone() {
                sf_types.shuffle(&mut rand);
                if sfis_to_allocate == 0 {
                    break;
                }
                let present: Vec<usize> = sim.server(server)
                    .sfis
                    .iter()
                    .map(|sfi| sim.sfi(*sfi).sf_type)
                    .collect();
                if let Some(sf) = sf_types.iter().find(|sf| !present.contains(*sf)) {
                    // stick to an already connected SFF, if there is one
                    let connect_sff = sim
                        .server(server)
                        .sff_ids
                        .iter()
                        .copied()
                        .collect::<Vec<_>>()
                        .choose(&mut rand)
                        .copied()
                        .unwrap_or(sff_of_site[*site][0]);
                    sim.add_sfi(server, *sf, connect_sff)?;
                    sfis_to_allocate -= 1;
                    failed_allocation = false;
                }
            }
        }
        if failed_allocation {
            return Err(ConfigError::SfiSpreadFailed(sfis_to_allocate).into());
        }
    }
    debug!("SFI spread done");

    // the workload generator with its own random stream
    let mut workload = SyntheticWorkload::new(rand.gen(), config.workload.clone());
    workload.prepare(&mut sim)?;
    for (sf, demand) in workload.demand_report(&sim) {
        info!(
            "workload demand for sf {sf}: {:.1} packets total, {:.1}/s, {:.1} capacity required",
            demand.packets, demand.packets_per_second, demand.required_capacity
        );
    }
    sim.register_workload(Box::new(workload), fetch_all_workload)?;

    if let Some(interval) = config.statistics_polling {
        sim.activate_statistics_polling(interval);
    }
    Ok(sim)
}

/// Draw a cyclic latency value sequence from a Poisson distribution (or
/// the constant 0 sequence for a zero mean).
fn poisson_samples(rng: &mut StdRng, expected: u64) -> Vec<SimTime> {
    if expected == 0 {
        return vec![0];
    }
    let dist = Poisson::new(expected as f64).expect("positive mean");
    (0..LATENCY_SAMPLES).map(|_| dist.sample(rng) as SimTime).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        let config = SimConfig {
            workload: WorkloadConfig {
                workload_start_new_flows_till: 100_000,
                ..WorkloadConfig::default()
            },
            ..SimConfig::default()
        };
        let sim = build(&config, false).unwrap();
        assert_eq!(sim.num_sffs(), 1);
        assert_eq!(sim.num_servers(), 8);
        assert_eq!(sim.num_sfis(), 14);
        assert!(sim.num_flows() > 0);
    }

    #[test]
    fn invalid_scheduler_name() {
        let config = SimConfig {
            scheduler: "optimal".to_string(),
            ..SimConfig::default()
        };
        assert!(matches!(
            build(&config, false),
            Err(SimError::Config(ConfigError::UnknownScheduler(_)))
        ));
    }

    #[test]
    fn per_site_vectors_validated() {
        let config = SimConfig {
            sites: 2,
            ..SimConfig::default()
        };
        assert!(build(&config, false).is_err());
    }

    #[test]
    fn config_json_roundtrip() {
        let config = SimConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed = SimConfig::from_json(&json).unwrap();
        assert_eq!(parsed.seed, config.seed);
        assert_eq!(parsed.workload.t_classes, config.workload.t_classes);
    }
}
