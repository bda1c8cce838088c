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

//! Command-line driver of the simulator.

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use clap::Parser;
use log::info;

use sfcsim::config::{self, SimConfig};
use sfcsim::simulator::RunOptions;
use sfcsim::stats::{
    record_delay_cdf, record_packet_statistics, record_polling_statistics,
    record_workload_statistics, CdfSink, CsvCdfWriter, CsvKvWriter, CsvRowWriter, KvSink,
    PollingFlags, RowSink,
    PACKET_STATISTICS_COLUMNS, WORKLOAD_STATISTICS_COLUMNS,
};
use sfcsim::types::SimTime;

/// Run an SFC traffic scheduling simulation.
#[derive(Debug, Parser)]
#[clap(version)]
struct Cli {
    /// Configuration file (json). Without it, the built-in default
    /// scenario is used.
    config: Option<String>,
    /// Stop the simulation at this virtual time (µs).
    #[clap(long, short = 't')]
    max_time: Option<SimTime>,
    /// Stop the simulation as soon as the workload is exhausted.
    #[clap(long)]
    stop_when_workload_over: bool,
    /// Print a progress line while simulating.
    #[clap(long, short = 'p')]
    progress: bool,
    /// Build the scenario and validate the configuration, but do not run.
    #[clap(long)]
    dry_run: bool,
    /// Materialize the whole workload up front instead of loading it
    /// lazily.
    #[clap(long)]
    no_workload_reloading: bool,
    /// Record every hop every packet visits (slow).
    #[clap(long)]
    trace_packets: bool,
    /// Abort the run when a scheduler fails to schedule a packet.
    #[clap(long)]
    strict: bool,
    /// Prefix of the statistics files. Statistics are only written if set.
    #[clap(long, short = 's')]
    statistics: Option<String>,
    /// Write one row per terminal packet.
    #[clap(long)]
    statistics_packets: bool,
    /// Write one row per ingress packet (the effective workload).
    #[clap(long)]
    statistics_workload: bool,
    /// Write the delay/deadline CDF with this many buckets.
    #[clap(long)]
    statistics_cdf_buckets: Option<usize>,
    /// Poll per-SFF gauges.
    #[clap(long)]
    statistics_polling_sff: bool,
    /// Poll per-SFI gauges.
    #[clap(long)]
    statistics_polling_sfi: bool,
    /// Poll per-server gauges.
    #[clap(long)]
    statistics_polling_server: bool,
    /// Poll the overview counters.
    #[clap(long)]
    statistics_polling_overview: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init_timed();
    let args = Cli::parse();

    let config = match &args.config {
        Some(path) => SimConfig::from_json(&fs::read_to_string(path)?)?,
        None => SimConfig::default(),
    };
    info!("run with configuration: {}", serde_json::to_string_pretty(&config)?);

    let mut sim = config::build(&config, args.no_workload_reloading)?;
    sim.strict_scheduling = args.strict;
    sim.trace_packet_path = args.trace_packets;

    // wire the statistics sinks
    let mut flush: Vec<Box<dyn FnMut() -> std::io::Result<()>>> = vec![];
    if let Some(prefix) = &args.statistics {
        if args.statistics_packets {
            let sink = Rc::new(RefCell::new(CsvRowWriter::create(
                format!("{prefix}_packets.csv"),
                PACKET_STATISTICS_COLUMNS,
            )?));
            record_packet_statistics(&mut sim, sink.clone());
            flush.push(Box::new(move || sink.borrow_mut().flush()));
        }
        if args.statistics_workload {
            let sink = Rc::new(RefCell::new(CsvRowWriter::create(
                format!("{prefix}_workload.csv"),
                WORKLOAD_STATISTICS_COLUMNS,
            )?));
            record_workload_statistics(&mut sim, sink.clone());
            flush.push(Box::new(move || sink.borrow_mut().flush()));
        }
        if let Some(buckets) = args.statistics_cdf_buckets {
            let sink = Rc::new(RefCell::new(CsvCdfWriter::create(
                format!("{prefix}_cdf.csv"),
                buckets,
            )?));
            record_delay_cdf(&mut sim, sink.clone());
            flush.push(Box::new(move || sink.borrow_mut().flush()));
        }
        let flags = PollingFlags {
            sff: args.statistics_polling_sff,
            sfi: args.statistics_polling_sfi,
            server: args.statistics_polling_server,
            overview: args.statistics_polling_overview,
        };
        if config.statistics_polling.is_some() {
            let sink = Rc::new(RefCell::new(CsvKvWriter::create(format!(
                "{prefix}_polling.csv"
            ))?));
            record_polling_statistics(&mut sim, flags, sink.clone());
            flush.push(Box::new(move || sink.borrow_mut().flush()));
        }
    }

    if args.dry_run {
        info!("dry run: the configuration is valid, exit");
        return Ok(());
    }

    let stats = sim.run(RunOptions {
        max_sim_time: args.max_time,
        stop_when_workload_over: args.stop_when_workload_over,
        progress: args.progress,
    })?;

    for f in flush.iter_mut() {
        f()?;
    }

    info!(
        "packets: {} total, {} delivered, {} rejected, {} timed out",
        sim.counters.total,
        sim.counters.success,
        sim.counters.reject_schedule,
        sim.counters.timeout
    );
    info!(
        "success rate {:.4}, reject rate {:.4}, service quality {:.4}, \
         {} scheduling attempts, server idle ratio {:.2}%",
        stats.success_rate,
        stats.reject_rate,
        stats.service_quality,
        stats.total_scheduling_attempts,
        stats.server_idle_time_ratio
    );
    Ok(())
}
