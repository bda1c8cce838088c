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

//! Module containing the definition of the event queue.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::debug;

use super::{Event, TimedEvent};
use crate::types::SimTime;

/// The number of packets the simulator asks the workload generator for in
/// one slice.
pub(crate) const SLICE_LENGTH: usize = 800_000;
/// How far (in µs) the relevant horizon must advance per replenishment.
pub(crate) const SLICE_TIME: SimTime = 800_000;
/// When the relevant horizon is this close (in µs) to the last popped time,
/// the workload generator is asked for the next slice.
pub(crate) const REPLENISH_WINDOW: SimTime = 500_000;

/// Time-ordered event queue.
///
/// Events pop in nondecreasing time order; events with equal times pop in
/// insertion order, which makes runs bit-for-bit deterministic. The queue
/// additionally tracks how many *relevant* events (those that keep the
/// simulation alive, see [`Event::ignore_when_finished`]) are pending, and
/// the latest time of any relevant event — the horizon used for lazy
/// workload replenishment.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<TimedEvent>>,
    seq: u64,
    relevant: usize,
    last_popped: Option<SimTime>,
    last_relevant_time: Option<SimTime>,
    max_time: Option<SimTime>,
}

impl EventQueue {
    /// Create a new, empty event queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an event at an absolute time.
    pub fn push(&mut self, time: SimTime, event: Event) {
        if !event.ignore_when_finished() {
            self.relevant += 1;
            if self.last_relevant_time.map_or(true, |t| t < time) {
                self.last_relevant_time = Some(time);
            }
        }
        if self.max_time.map_or(true, |t| t < time) {
            self.max_time = Some(time);
        }
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(TimedEvent { time, seq, event }));
    }

    /// Pop the next event.
    ///
    /// # Panics
    /// Panics if the popped time is smaller than a previously popped time.
    /// This cannot happen unless an event was scheduled in the past.
    pub fn pop(&mut self) -> Option<TimedEvent> {
        let Reverse(item) = self.heap.pop()?;
        if !item.event.ignore_when_finished() {
            self.relevant -= 1;
        }
        if let Some(last) = self.last_popped {
            assert!(
                item.time >= last,
                "event at time {} popped after time {}",
                item.time,
                last
            );
        }
        self.last_popped = Some(item.time);
        Some(item)
    }

    /// Peek at the time of the next event.
    pub fn peek_time(&self) -> Option<SimTime> {
        self.heap.peek().map(|Reverse(e)| e.time)
    }

    /// The largest time of any event ever enqueued.
    pub fn peek_last_time(&self) -> Option<SimTime> {
        self.max_time
    }

    /// The largest time of any *relevant* event ever enqueued.
    pub fn last_relevant_time(&self) -> Option<SimTime> {
        self.last_relevant_time
    }

    /// The time of the most recently popped event.
    pub fn last_popped_time(&self) -> Option<SimTime> {
        self.last_popped
    }

    /// Get the number of enqueued events.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Return `true` if no event is enqueued.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Get the number of enqueued events that keep the simulation alive.
    pub fn relevant_len(&self) -> usize {
        self.relevant
    }

    /// `true` if the relevant horizon is close enough to the last popped
    /// time that the workload should be asked for the next slice.
    pub(crate) fn near_horizon(&self) -> bool {
        match (self.last_relevant_time, self.last_popped) {
            (Some(horizon), Some(popped)) => horizon < popped + REPLENISH_WINDOW,
            _ => false,
        }
    }

    /// Drain every remaining event, in no particular order. Only used by the
    /// end-of-workload sweep, which re-sorts by settling packet timers.
    pub(crate) fn drain_all(&mut self) -> Vec<TimedEvent> {
        self.relevant = 0;
        self.heap.drain().map(|Reverse(e)| e).collect()
    }

    /// Log a short snapshot of the pending events.
    pub fn log_snapshot(&self) {
        debug!(
            "event queue: {} pending ({} relevant), next @{:?}µs, horizon @{:?}µs",
            self.len(),
            self.relevant_len(),
            self.peek_time(),
            self.last_relevant_time,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SffId;

    fn ev(sff: usize) -> Event {
        Event::DoScheduling(SffId::new(sff))
    }

    #[test]
    fn pops_in_time_order() {
        let mut q = EventQueue::new();
        q.push(30, ev(0));
        q.push(10, ev(1));
        q.push(20, ev(2));
        let times: Vec<_> = std::iter::from_fn(|| q.pop()).map(|e| e.time).collect();
        assert_eq!(times, vec![10, 20, 30]);
    }

    #[test]
    fn equal_times_pop_fifo() {
        let mut q = EventQueue::new();
        for i in 0..10 {
            q.push(42, ev(i));
        }
        let order: Vec<_> = std::iter::from_fn(|| q.pop())
            .map(|e| match e.event {
                Event::DoScheduling(sff) => sff.index(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn relevant_counting() {
        let mut q = EventQueue::new();
        q.push(5, ev(0));
        q.push(7, Event::RateEstimatorTick { period: 100 });
        assert_eq!(q.len(), 2);
        assert_eq!(q.relevant_len(), 1);
        assert_eq!(q.last_relevant_time(), Some(5));
        q.pop().unwrap();
        assert_eq!(q.relevant_len(), 0);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn near_horizon_window() {
        let mut q = EventQueue::new();
        q.push(0, ev(0));
        q.push(REPLENISH_WINDOW + 1, ev(1));
        q.pop().unwrap();
        assert!(!q.near_horizon());
        q.pop().unwrap();
        assert!(q.near_horizon());
    }
}
