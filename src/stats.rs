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

//! Statistics sinks and recorders.
//!
//! The core only knows three sink traits: a row sink with typed cells, a
//! key-value sink, and a CDF sink bucketing normalized data points. The
//! concrete CSV-backed implementations here buffer their entries and flush
//! once a threshold is reached. Recorder functions wire the sinks into the
//! simulator hooks (packet teardown, ingress, periodic polling).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::rc::Rc;

use crate::simulator::Simulator;
use crate::types::SimTime;

/// Number of buffered entries after which the CSV writers flush.
const FLUSH_ENTRIES: usize = 10_000;

/// A single typed cell of a statistics row.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    /// An integer value.
    Int(i64),
    /// An unsigned value.
    UInt(u64),
    /// A floating point value.
    Float(f64),
    /// A string value.
    Str(String),
    /// A virtual time value in µs.
    Time(SimTime),
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cell::Int(v) => write!(f, "{v}"),
            Cell::UInt(v) => write!(f, "{v}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Str(v) => f.write_str(v),
            Cell::Time(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Str(v.to_string())
    }
}

impl From<u64> for Cell {
    fn from(v: u64) -> Self {
        Cell::UInt(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Float(v)
    }
}

/// Sink for rows of typed cells.
pub trait RowSink {
    /// Append one row.
    fn append_row(&mut self, cells: &[Cell]);
    /// Flush buffered rows to the backing store.
    fn flush(&mut self) -> io::Result<()>;
}

/// Sink for `(time, key, value)` entries.
pub trait KvSink {
    /// Append one entry.
    fn append(&mut self, time: SimTime, key: &str, value: f64);
    /// Flush buffered entries to the backing store.
    fn flush(&mut self) -> io::Result<()>;
}

/// Sink bucketing normalized data points in `[0, 1]` into a fixed number
/// of buckets per (key, group).
pub trait CdfSink {
    /// Add one data point.
    fn add_data_point(&mut self, key: &str, group: &str, value: f64);
    /// Flush the bucket counts to the backing store.
    fn flush(&mut self) -> io::Result<()>;
}

/// CSV-backed [`RowSink`].
pub struct CsvRowWriter {
    writer: csv::Writer<std::fs::File>,
    buffered: usize,
}

impl std::fmt::Debug for CsvRowWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvRowWriter").field("buffered", &self.buffered).finish()
    }
}

impl CsvRowWriter {
    /// Create a writer with the given column headers.
    pub fn create(path: impl AsRef<Path>, columns: &[&str]) -> io::Result<Self> {
        let mut writer = csv::Writer::from_path(path.as_ref()).map_err(csv_to_io)?;
        writer.write_record(columns).map_err(csv_to_io)?;
        Ok(Self { writer, buffered: 0 })
    }
}

impl RowSink for CsvRowWriter {
    fn append_row(&mut self, cells: &[Cell]) {
        let record: Vec<String> = cells.iter().map(Cell::to_string).collect();
        if let Err(e) = self.writer.write_record(&record) {
            log::error!("failed to write a statistics row: {e}");
        }
        self.buffered += 1;
        if self.buffered > FLUSH_ENTRIES {
            let _ = self.flush();
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.buffered = 0;
        self.writer.flush()
    }
}

/// CSV-backed [`KvSink`] with columns `time,key,value`.
#[derive(Debug)]
pub struct CsvKvWriter {
    inner: CsvRowWriter,
}

impl CsvKvWriter {
    /// Create the writer.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            inner: CsvRowWriter::create(path, &["time", "key", "value"])?,
        })
    }
}

impl KvSink for CsvKvWriter {
    fn append(&mut self, time: SimTime, key: &str, value: f64) {
        self.inner
            .append_row(&[Cell::Time(time), key.into(), value.into()]);
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// CSV-backed [`CdfSink`]: one row per (key, group, bucket) at flush time.
#[derive(Debug)]
pub struct CsvCdfWriter {
    inner: CsvRowWriter,
    buckets: usize,
    holder: BTreeMap<(String, String), Vec<u64>>,
}

impl CsvCdfWriter {
    /// Create a writer bucketing into `buckets` buckets.
    pub fn create(path: impl AsRef<Path>, buckets: usize) -> io::Result<Self> {
        assert!(buckets > 0);
        Ok(Self {
            inner: CsvRowWriter::create(path, &["key", "group", "bucket", "count"])?,
            buckets,
            holder: BTreeMap::new(),
        })
    }
}

impl CdfSink for CsvCdfWriter {
    fn add_data_point(&mut self, key: &str, group: &str, value: f64) {
        debug_assert!((0.0..=1.0).contains(&value), "cdf values are normalized");
        let bucket = ((value * self.buckets as f64) as usize).min(self.buckets - 1);
        self.holder
            .entry((key.to_string(), group.to_string()))
            .or_insert_with(|| vec![0; self.buckets])[bucket] += 1;
    }

    fn flush(&mut self) -> io::Result<()> {
        for ((key, group), counts) in &self.holder {
            for (bucket, count) in counts.iter().enumerate() {
                self.inner.append_row(&[
                    key.as_str().into(),
                    group.as_str().into(),
                    Cell::UInt(bucket as u64),
                    Cell::UInt(*count),
                ]);
            }
        }
        self.inner.flush()
    }
}

fn csv_to_io(e: csv::Error) -> io::Error {
    match e.into_kind() {
        csv::ErrorKind::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, format!("{other:?}")),
    }
}

/// Record one row per terminal packet: id, final state, delay, and the
/// full timing decomposition.
pub fn record_packet_statistics(sim: &mut Simulator, sink: Rc<RefCell<dyn RowSink>>) {
    sim.on_packet_teardown(Box::new(move |time, packet, state| {
        sink.borrow_mut().append_row(&[
            Cell::UInt(packet.id),
            Cell::Time(packet.time_ingress),
            Cell::Time(time),
            state.as_str().into(),
            Cell::Time(packet.delay(time)),
            Cell::Time(packet.timers.processing),
            Cell::Time(packet.timers.network),
            Cell::Time(packet.timers.queue_processing),
            Cell::Time(packet.timers.queue_network),
            Cell::Time(packet.timers.queue_scheduling),
            Cell::Float(packet.real_scheduling),
            Cell::UInt(packet.seen_by_scheduler as u64),
        ]);
    }));
}

/// Column headers matching [`record_packet_statistics`].
pub const PACKET_STATISTICS_COLUMNS: &[&str] = &[
    "id",
    "time_ingress",
    "time_done",
    "final_state",
    "delay",
    "time_processing",
    "time_network",
    "time_queue_processing",
    "time_queue_network",
    "time_queue_scheduling",
    "real_scheduling",
    "seen_by_scheduler",
];

/// Record one row per ingress packet: the workload as it enters the
/// network.
pub fn record_workload_statistics(sim: &mut Simulator, sink: Rc<RefCell<dyn RowSink>>) {
    sim.on_packet_ingress(Box::new(move |time, flow, packet| {
        let chain = flow
            .sf_type_chain
            .iter()
            .map(|sf| sf.to_string())
            .collect::<Vec<_>>()
            .join("-");
        sink.borrow_mut().append_row(&[
            Cell::Time(time),
            Cell::UInt(flow.id.index() as u64),
            chain.as_str().into(),
            Cell::UInt(flow.ingress_sff.index() as u64),
            Cell::UInt(flow.desired_egress.index() as u64),
            Cell::Time(flow.qos_max_delay),
            Cell::UInt(packet.id),
        ]);
    }));
}

/// Column headers matching [`record_workload_statistics`].
pub const WORKLOAD_STATISTICS_COLUMNS: &[&str] = &[
    "time",
    "flow",
    "sfc",
    "ingress",
    "egress",
    "qos_max_delay",
    "packet",
];

/// Record the delay-over-deadline CDF of every delivered packet.
pub fn record_delay_cdf(sim: &mut Simulator, sink: Rc<RefCell<dyn CdfSink>>) {
    let deadlines: Vec<SimTime> = (0..sim.num_flows())
        .map(|f| sim.flow(f.into()).qos_max_delay)
        .collect();
    sim.on_packet_teardown(Box::new(move |time, packet, state| {
        let deadline = deadlines[packet.flow.index()];
        let normalized = (packet.delay(time) as f64 / deadline as f64).min(1.0);
        sink.borrow_mut()
            .add_data_point("delay_over_deadline", state.as_str(), normalized);
    }));
}

/// Which gauges the periodic polling samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollingFlags {
    /// Per-SFF queue lengths.
    pub sff: bool,
    /// Per-SFI queue length, busy state, and CPU shares.
    pub sfi: bool,
    /// Per-server free state.
    pub server: bool,
    /// Global overview counters.
    pub overview: bool,
}

/// Sample per-subsystem gauges into a [`KvSink`] at every polling tick.
/// The polling interval itself is configured with
/// [`Simulator::activate_statistics_polling`].
pub fn record_polling_statistics(
    sim: &mut Simulator,
    flags: PollingFlags,
    sink: Rc<RefCell<dyn KvSink>>,
) {
    sim.on_poll(Box::new(move |sim| {
        let mut sink = sink.borrow_mut();
        let now = sim.time();
        sink.append(now, "simulator.queue", sim.event_queue_len().0 as f64);

        if flags.overview {
            let c = sim.counters;
            sink.append(now, "overview.packet_in_system", c.in_system as f64);
            sink.append(now, "overview.packet_total_count", c.total as f64);
            sink.append(now, "overview.packet_rejected", c.reject_schedule as f64);
            sink.append(now, "overview.packet_timeout", c.timeout as f64);
            sink.append(now, "overview.packet_successful", c.success as f64);
            sink.append(now, "overview.packet_total_delay", c.sum_delay as f64);
        }
        if flags.sff {
            for sff in 0..sim.num_sffs() {
                let sff = crate::types::SffId::new(sff);
                sink.append(
                    now,
                    &format!("sff.{}.queue", sff.index()),
                    sim.sff(sff).num_queued_packets() as f64,
                );
                sink.append(
                    now,
                    &format!("sff.{}.network_queue", sff.index()),
                    sim.sff(sff).num_out_queued_packets() as f64,
                );
            }
        }
        if flags.sfi {
            for sfi in 0..sim.num_sfis() {
                let s = sim.sfi(sfi.into());
                sink.append(now, &format!("sfi.{sfi}.queue"), s.queue.len() as f64);
                sink.append(now, &format!("sfi.{sfi}.busy"), (!s.free) as u64 as f64);
                sink.append(now, &format!("sfi.{sfi}.cpu_shares"), s.cpu_shares as f64);
            }
        }
        if flags.server {
            for server in 0..sim.num_servers() {
                sink.append(
                    now,
                    &format!("server.{server}.is_free"),
                    sim.server_is_free(server.into()) as u64 as f64,
                );
            }
        }
    }));
}

/// In-memory [`KvSink`], mostly useful for tests and for inspecting the
/// polled gauges after a run.
#[derive(Debug, Default)]
pub struct MemoryKvSink {
    /// All recorded entries.
    pub entries: Vec<(SimTime, String, f64)>,
}

impl KvSink for MemoryKvSink {
    fn append(&mut self, time: SimTime, key: &str, value: f64) {
        self.entries.push((time, key.to_string(), value));
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// In-memory [`RowSink`].
#[derive(Debug, Default)]
pub struct MemoryRowSink {
    /// All recorded rows.
    pub rows: Vec<Vec<Cell>>,
}

impl RowSink for MemoryRowSink {
    fn append_row(&mut self, cells: &[Cell]) {
        self.rows.push(cells.to_vec());
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdf_bucketing() {
        let dir = std::env::temp_dir().join("sfcsim_cdf_test.csv");
        let mut w = CsvCdfWriter::create(&dir, 10).unwrap();
        w.add_data_point("k", "g", 0.0);
        w.add_data_point("k", "g", 0.05);
        w.add_data_point("k", "g", 0.95);
        w.add_data_point("k", "g", 1.0);
        assert_eq!(w.holder[&("k".to_string(), "g".to_string())][0], 2);
        assert_eq!(w.holder[&("k".to_string(), "g".to_string())][9], 2);
        w.flush().unwrap();
        std::fs::remove_file(dir).ok();
    }
}
