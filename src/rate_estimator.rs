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

//! Rate estimators over packet arrivals.
//!
//! Estimators are owned by the simulator and updated by a self-rescheduling
//! tick event, one per distinct period. Two variants exist: a bucketed
//! exponentially weighted moving average ([`Ewma`]) and the discounting
//! rate estimator ([`Dre`]) from the CONGA technical report
//! (<https://people.csail.mit.edu/alizadeh/papers/conga-techreport.pdf>).

use crate::event::Event;
use crate::simulator::Simulator;
use crate::types::{SimTime, MICROS_PER_SEC};

/// A rate estimator variant.
#[derive(Debug, Clone)]
pub enum RateEstimator {
    /// Bucketed exponentially weighted moving average.
    Ewma(Ewma),
    /// Discounting rate estimator.
    Dre(Dre),
}

impl RateEstimator {
    /// The update period in µs.
    pub fn period(&self) -> SimTime {
        match self {
            RateEstimator::Ewma(e) => e.period,
            RateEstimator::Dre(e) => e.period,
        }
    }

    /// Count one packet arrival.
    pub fn packet_arrival(&mut self) {
        match self {
            RateEstimator::Ewma(e) => e.packet_arrival(),
            RateEstimator::Dre(e) => e.packet_arrival(),
        }
    }

    /// The current rate estimate in packets per second.
    pub fn estimated_rate(&self) -> f64 {
        match self {
            RateEstimator::Ewma(e) => e.estimated_rate(),
            RateEstimator::Dre(e) => e.estimated_rate(),
        }
    }

    /// Advance the estimator by one period.
    pub(crate) fn update(&mut self) {
        match self {
            RateEstimator::Ewma(e) => e.update(),
            RateEstimator::Dre(e) => e.update(),
        }
    }
}

/// EWMA over circular buckets of per-period arrival counts. The rate at
/// any time cascades `v <- v*(1-α) + α*bucket` over all buckets, oldest
/// last, normalized by the period.
#[derive(Debug, Clone)]
pub struct Ewma {
    period: SimTime,
    alpha: f64,
    expected_size: usize,
    buckets: Vec<u64>,
    pos_current_bucket: usize,
    value: u64,
}

impl Default for Ewma {
    fn default() -> Self {
        Self::new(0.06, 5_000, 20)
    }
}

impl Ewma {
    /// Create an EWMA estimator with smoothing factor `alpha`, an update
    /// period in µs, and the number of buckets kept.
    pub fn new(alpha: f64, period: SimTime, buckets: usize) -> Self {
        assert!(period > 0);
        assert!(0.0 < alpha && alpha < 1.0);
        assert!(0 < buckets && buckets < 100_000);
        Self {
            period,
            alpha,
            expected_size: buckets,
            buckets: vec![0],
            pos_current_bucket: 0,
            value: 0,
        }
    }

    fn packet_arrival(&mut self) {
        self.value += 1;
    }

    fn estimated_rate(&self) -> f64 {
        let mut v = self.buckets[self.pos_current_bucket] as f64;
        let length = self.buckets.len();
        let mut next_pos = (self.pos_current_bucket + 1) % length;
        while next_pos != self.pos_current_bucket {
            v = v * (1.0 - self.alpha) + self.alpha * self.buckets[next_pos] as f64;
            next_pos = (next_pos + 1) % length;
        }
        v / (self.period as f64 / MICROS_PER_SEC as f64)
    }

    fn update(&mut self) {
        if self.buckets.len() < self.expected_size {
            self.buckets.push(self.value);
            self.pos_current_bucket = self.buckets.len() - 1;
        } else {
            self.pos_current_bucket = (self.pos_current_bucket + 1) % self.buckets.len();
            self.buckets[self.pos_current_bucket] = self.value;
        }
        self.value = 0;
    }
}

/// Discounting rate estimator: a single scalar incremented per arrival and
/// discounted by `(1-α)` per period. The scalar is proportional to the
/// traffic rate: for rate `R`, `v ≈ R·τ` with `τ = (1s/period)/α`.
#[derive(Debug, Clone)]
pub struct Dre {
    period: SimTime,
    alpha: f64,
    value: f64,
    tau: f64,
}

impl Default for Dre {
    fn default() -> Self {
        Self::new(0.125, 500_000)
    }
}

impl Dre {
    /// Create a DRE with discount factor `alpha` and a period in µs.
    pub fn new(alpha: f64, period: SimTime) -> Self {
        assert!(period > 0);
        assert!(0.0 < alpha && alpha < 1.0);
        Self {
            period,
            alpha,
            value: 0.0,
            tau: (MICROS_PER_SEC as f64 / period as f64) / alpha,
        }
    }

    fn packet_arrival(&mut self) {
        self.value += 1.0;
    }

    fn update(&mut self) {
        self.value *= 1.0 - self.alpha;
    }

    /// The raw (discounted) counter value.
    pub fn dre(&self) -> f64 {
        self.value
    }

    fn estimated_rate(&self) -> f64 {
        self.value / self.tau
    }

    /// The congestion metric: the rate estimate normalized by a capacity.
    pub fn congestion_metric(&self, capacity: f64) -> f64 {
        self.value / (self.tau * capacity)
    }

    /// The time constant τ.
    pub fn tau(&self) -> f64 {
        self.tau
    }
}

impl Simulator {
    /// Register an estimator. The periodic update event for its period is
    /// created on first use.
    pub fn add_rate_estimator(&mut self, estimator: RateEstimator) -> usize {
        let period = estimator.period();
        if self.estimator_periods.insert(period) {
            self.schedule_in(period, Event::RateEstimatorTick { period });
        }
        self.estimators.push(estimator);
        self.estimators.len() - 1
    }

    /// Get an estimator by its id.
    pub fn rate_estimator(&self, id: usize) -> &RateEstimator {
        &self.estimators[id]
    }

    /// Get an estimator by its id, mutably.
    pub fn rate_estimator_mut(&mut self, id: usize) -> &mut RateEstimator {
        &mut self.estimators[id]
    }

    /// Handler of [`Event::RateEstimatorTick`]: update every estimator of
    /// the period and reschedule.
    pub(crate) fn process_rate_estimator_tick(&mut self, period: SimTime) {
        for estimator in self.estimators.iter_mut() {
            if estimator.period() == period {
                estimator.update();
            }
        }
        self.schedule_in(period, Event::RateEstimatorTick { period });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_converges_to_constant_rate() {
        let mut e = Ewma::new(0.06, 5_000, 20);
        // 10 packets per 5ms period = 2000 packets/s
        for _ in 0..40 {
            for _ in 0..10 {
                e.packet_arrival();
            }
            e.update();
        }
        let rate = e.estimated_rate();
        assert!((rate - 2_000.0).abs() < 250.0, "rate was {rate}");
    }

    #[test]
    fn dre_steady_state() {
        let mut d = Dre::new(0.125, 500_000);
        // r arrivals per period settle at v* = r / alpha
        let r = 10.0;
        for _ in 0..200 {
            d.update();
            for _ in 0..10 {
                d.packet_arrival();
            }
        }
        assert!((d.dre() - r / 0.125).abs() < 1.0, "dre was {}", d.dre());
        assert!((d.estimated_rate() - d.dre() / d.tau()).abs() < f64::EPSILON);
    }
}
