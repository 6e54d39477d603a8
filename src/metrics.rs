// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Counters shared by many connections.
//!
//! A `MetricsSink` is handed to every engine at construction. The engine only
//! ever adds to it, so a single sink can aggregate statistics of all
//! connections without any lock on the ack path.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use strum::EnumCount;
use strum::IntoEnumIterator;
use strum_macros::EnumCount;
use strum_macros::EnumIter;
use strum_macros::IntoStaticStr;

/// Observable events of the loss recovery engine.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, EnumIter, EnumCount, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Counter {
    /// A record was split in two.
    SegmentsSplit,

    /// Two adjacent SACKed records were coalesced.
    SegmentsMerged,

    /// A split was refused because the record limit was reached.
    SplitsRefused,

    /// A SACK block outside the send window or otherwise malformed.
    MalformedSackBlocks,

    /// A SACK block skipped because it was already fully recorded.
    SackBlocksFiltered,

    /// A D-SACK block was received.
    DsackBlocks,

    /// An action whose target had vanished was dropped.
    StaleActions,

    /// A timer firing carrying an old generation was discarded.
    StaleTimers,

    /// An RTT sample was discarded as implausible.
    TimingAnomalies,

    /// A bounded counter was frozen at its maximum.
    CounterSaturations,

    /// Reordering was inferred from SACK information.
    ReorderEvents,

    /// A fast recovery episode started.
    RecoveryEpisodes,

    /// A tail loss probe was sent.
    TlpProbes,

    /// The retransmission timer fired.
    RtoFired,

    /// An RTO was detected as spurious and undone.
    SpuriousRto,

    /// A Probe-RTT phase started.
    ProbeRttEntered,

    /// The hardware pacer rejected a rate and a lower one was used.
    HwRateFallbacks,

    /// Bytes retransmitted.
    RetransmittedBytes,

    /// The transmit primitive reported an error.
    TransmitFailures,

    /// The scoreboard tiling invariant was broken.
    StructuralViolations,
}

/// A sink receiving counter increments from the engines.
pub trait MetricsSink: Send + Sync {
    /// Add `n` to the given counter.
    fn add(&self, counter: Counter, n: u64);

    /// Read the current value of a counter, if the sink keeps values.
    fn get(&self, _counter: Counter) -> Option<u64> {
        None
    }
}

impl fmt::Debug for dyn MetricsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "metrics sink.")
    }
}

/// A sink dropping everything.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn add(&self, _counter: Counter, _n: u64) {}
}

/// A sink aggregating counters of many connections.
///
/// Values saturate instead of wrapping.
#[derive(Debug)]
pub struct AggregateMetrics {
    values: [AtomicU64; Counter::COUNT],
}

impl AggregateMetrics {
    pub fn new() -> Self {
        Self {
            values: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Return a copy of all counters with their names.
    pub fn dump(&self) -> Vec<(&'static str, u64)> {
        Counter::iter()
            .map(|c| (c.into(), self.values[c as usize].load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for AggregateMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for AggregateMetrics {
    fn add(&self, counter: Counter, n: u64) {
        let slot = &self.values[counter as usize];
        let _ = slot.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_add(n))
        });
    }

    fn get(&self, counter: Counter) -> Option<u64> {
        Some(self.values[counter as usize].load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn aggregate_add() {
        let m = AggregateMetrics::new();
        m.add(Counter::TlpProbes, 1);
        m.add(Counter::TlpProbes, 2);
        assert_eq!(m.get(Counter::TlpProbes), Some(3));
        assert_eq!(m.get(Counter::RtoFired), Some(0));
    }

    #[test]
    fn aggregate_saturates() {
        let m = AggregateMetrics::new();
        m.add(Counter::RetransmittedBytes, u64::MAX - 1);
        m.add(Counter::RetransmittedBytes, 10);
        assert_eq!(m.get(Counter::RetransmittedBytes), Some(u64::MAX));
    }

    #[test]
    fn aggregate_shared() {
        let m = Arc::new(AggregateMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.add(Counter::SegmentsSplit, 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.get(Counter::SegmentsSplit), Some(4000));
    }

    #[test]
    fn counter_names() {
        let dump = AggregateMetrics::new().dump();
        assert_eq!(dump.len(), Counter::COUNT);
        assert_eq!(dump[0].0, "segments_split");
        assert!(dump.iter().any(|(name, _)| *name == "spurious_rto"));
        assert_eq!(NoopMetrics.get(Counter::RtoFired), None);
    }
}
