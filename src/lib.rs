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

//! A per-connection TCP loss recovery and pacing engine built around RACK
//! (RFC 8985).
//!
//! ## Features
//!
//! * **Scoreboard**: an arena of sent records keyed by sequence range, with a
//!   send-time ordered index used by time based loss detection.
//! * **SACK processing**: cumulative and selective acknowledgements, D-SACK,
//!   reordering detection and receive window collapse.
//! * **Estimation**: smoothed and minimum RTT, goodput samples and Probe-RTT.
//! * **Pacing**: a phase dependent pacing rate with an optional hardware rate
//!   table and a token-bucket pacer.
//! * **Retransmission**: RACK loss marking, Proportional Rate Reduction
//!   (RFC 6937), Tail Loss Probe and RTO with go-back-N and spurious RTO undo.
//!
//! The engine performs no I/O. Every event returns an [`ActionSet`] that the
//! caller executes, directly or through [`Rack::dispatch`] with its own
//! [`Transmitter`] and [`TimerScheduler`].
//!
//! ## Get started
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! use tcp_rack::metrics::NoopMetrics;
//! use tcp_rack::AckEvent;
//! use tcp_rack::Rack;
//! use tcp_rack::RackConfig;
//!
//! # fn main() -> tcp_rack::Result<()> {
//! let now = Instant::now();
//! let mut rack = Rack::new(RackConfig::default(), Arc::new(NoopMetrics), 0, now)?;
//! let _timer = rack.on_packet_sent(0..1460, Default::default(), now)?;
//! let _actions = rack.on_ack(&AckEvent::new(1460), now)?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

/// The RECOMMENDED value of the timer granularity is 1 millisecond.
/// See RFC 9002 Section 6.1
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// When no previous RTT is available, the initial RTT SHOULD be set to 333
/// milliseconds. This results in an initial RTO of 1 second.
pub const INITIAL_RTT: Duration = Duration::from_millis(333);

/// Default maximum segment size.
pub const DEFAULT_MSS: u64 = 1460;

/// The RECOMMENDED initial RTO is 1 second.
/// See RFC 6298 Section 2.1
const INITIAL_RTO: Duration = Duration::from_secs(1);

/// The minimum RTO. Linux uses 200 milliseconds.
const MIN_RTO: Duration = Duration::from_millis(200);

/// The upper limit of the RTO, including exponential backoff.
/// See RFC 6298 Section 2.5
const MAX_RTO: Duration = Duration::from_secs(60);

/// The lower bound of the tail loss probe timeout.
const TLP_MIN: Duration = Duration::from_millis(10);

/// The worst case delayed ack timer of the receiver.
/// See RFC 8985 Section 7.2
const DELAYED_ACK_TIME: Duration = Duration::from_millis(200);

/// Duplicate acknowledgements indicating a loss.
/// See RFC 5681 Section 3.2
const DUPACK_THRESH: u32 = 3;

/// The reordering window is a quarter of the min RTT per multiplier step.
const REORDER_SHIFT: u32 = 2;

/// Reordering evidence is forgotten after this long without reordering.
const REORDER_FADE: Duration = Duration::from_secs(60);

/// The length of the min RTT filter window.
const MIN_RTT_WINDOW: Duration = Duration::from_secs(10);

/// Enter Probe-RTT when the min RTT has not been refreshed for this long.
const PROBE_RTT_INTERVAL: Duration = Duration::from_secs(10);

/// The minimum duration of Probe-RTT.
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);

/// The congestion window floor during Probe-RTT in segments.
const PROBE_RTT_FLOOR_SEGMENTS: u64 = 4;

/// Minimum delivered segments of a goodput sample.
const GOODPUT_MIN_SEGMENTS: u64 = 6;

/// Weight of the smoothed goodput filter is 1/GOODPUT_RTT_DECAY.
const GOODPUT_RTT_DECAY: u32 = 8;

/// The scoreboard refuses to grow beyond this many records.
const MAX_SEGMENTS: usize = 4096;

/// Ranges remembered by the SACK filter.
const SACK_FILTER_RANGES: usize = 16;

/// Result type for loss recovery operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Configurations about loss recovery, pacing and congestion control of a
/// connection.
#[derive(Debug, Clone)]
pub struct RackConfig {
    /// The maximum segment size.
    pub mss: u64,

    /// The initial rtt, used before real rtt is estimated.
    pub initial_rtt: Duration,

    /// The RTO used before real rtt is estimated.
    pub initial_rto: Duration,

    /// Lower limit of the RTO.
    pub min_rto: Duration,

    /// Upper limit of the RTO.
    pub max_rto: Duration,

    /// Enable tail loss probes.
    pub tlp_enabled: bool,

    /// Lower limit of the tail loss probe timeout.
    pub tlp_min: Duration,

    /// Extra time allowed for a delayed ack when a single segment is
    /// outstanding.
    pub delayed_ack_time: Duration,

    /// Duplicate acknowledgements above a record that mark it lost.
    pub dupack_thresh: u32,

    /// The reordering window is `(min_rtt >> reorder_shift) * multiplier`.
    pub reorder_shift: u32,

    /// Time after which a widened reordering window shrinks back.
    pub reorder_fade: Duration,

    /// The length of the min RTT filter window.
    pub min_rtt_window: Duration,

    /// Time without a new min RTT after which Probe-RTT is entered.
    pub probe_rtt_interval: Duration,

    /// The minimum duration of Probe-RTT.
    pub probe_rtt_duration: Duration,

    /// The congestion window during Probe-RTT in segments.
    pub probe_rtt_floor_segments: u64,

    /// Segments a goodput sample must cover.
    pub goodput_min_segments: u64,

    /// Decay of the smoothed goodput filter.
    pub goodput_rtt_decay: u32,

    /// Pacing rate in percent of the estimated bandwidth in slow start.
    pub pacing_ss_percent: u64,

    /// Pacing rate in percent of the estimated bandwidth in congestion
    /// avoidance.
    pub pacing_ca_percent: u64,

    /// Pacing rate in percent of the estimated bandwidth in recovery.
    pub pacing_recovery_percent: u64,

    /// Pacing rate in percent of the estimated bandwidth in Probe-RTT.
    pub pacing_probe_rtt_percent: u64,

    /// Use a fixed pacing rate in bytes per second.
    pub fixed_pacing_rate: Option<u64>,

    /// Upper limit of the pacing rate in bytes per second.
    pub max_pacing_rate: u64,

    /// Clock granularity used by the pacer.
    pub pacing_granularity: Duration,

    /// Upper limit of the records on the scoreboard.
    pub max_segments: usize,

    /// Ranges remembered by the SACK filter.
    pub sack_filter_ranges: usize,

    /// The initial congestion window in segments.
    /// See RFC 6928
    pub initial_congestion_window: u64,

    /// The minimal congestion window in segments.
    pub min_congestion_window: u64,

    /// The congestion control algorithm.
    pub congestion_control_algorithm: CongestionControlAlgorithm,
}

impl Default for RackConfig {
    fn default() -> RackConfig {
        RackConfig {
            mss: DEFAULT_MSS,
            initial_rtt: INITIAL_RTT,
            initial_rto: INITIAL_RTO,
            min_rto: MIN_RTO,
            max_rto: MAX_RTO,
            tlp_enabled: true,
            tlp_min: TLP_MIN,
            delayed_ack_time: DELAYED_ACK_TIME,
            dupack_thresh: DUPACK_THRESH,
            reorder_shift: REORDER_SHIFT,
            reorder_fade: REORDER_FADE,
            min_rtt_window: MIN_RTT_WINDOW,
            probe_rtt_interval: PROBE_RTT_INTERVAL,
            probe_rtt_duration: PROBE_RTT_DURATION,
            probe_rtt_floor_segments: PROBE_RTT_FLOOR_SEGMENTS,
            goodput_min_segments: GOODPUT_MIN_SEGMENTS,
            goodput_rtt_decay: GOODPUT_RTT_DECAY,
            pacing_ss_percent: 200,
            pacing_ca_percent: 100,
            pacing_recovery_percent: 90,
            pacing_probe_rtt_percent: 60,
            fixed_pacing_rate: None,
            max_pacing_rate: u64::MAX,
            pacing_granularity: TIMER_GRANULARITY,
            max_segments: MAX_SEGMENTS,
            sack_filter_ranges: SACK_FILTER_RANGES,
            initial_congestion_window: 10_u64,
            min_congestion_window: 2_u64,
            congestion_control_algorithm: CongestionControlAlgorithm::Fixed,
        }
    }
}

impl RackConfig {
    /// Check that the configuration is consistent.
    pub fn validate(&self) -> Result<()> {
        if self.mss == 0 {
            return Err(Error::InvalidConfig("mss is zero".into()));
        }
        if self.min_rto > self.max_rto {
            return Err(Error::InvalidConfig("min_rto above max_rto".into()));
        }
        if self.max_segments < 2 {
            return Err(Error::InvalidConfig("max_segments below 2".into()));
        }
        if [
            self.pacing_ss_percent,
            self.pacing_ca_percent,
            self.pacing_recovery_percent,
            self.pacing_probe_rtt_percent,
        ]
        .contains(&0)
        {
            return Err(Error::InvalidConfig("zero pacing percent".into()));
        }
        if self.probe_rtt_duration >= self.probe_rtt_interval {
            return Err(Error::InvalidConfig(
                "probe_rtt_duration not below probe_rtt_interval".into(),
            ));
        }
        if self.goodput_rtt_decay == 0 {
            return Err(Error::InvalidConfig("goodput_rtt_decay is zero".into()));
        }
        if self.reorder_shift > 16 {
            return Err(Error::InvalidConfig("reorder_shift above 16".into()));
        }
        if self.fixed_pacing_rate == Some(0) {
            return Err(Error::InvalidConfig("fixed pacing rate is zero".into()));
        }
        Ok(())
    }
}

/// Expand a 32-bit wire sequence number into the 64-bit sequence space.
///
/// The result is the value closest to `expected`, usually `snd_una`.
pub fn unwrap_seq(wire: u32, expected: u64) -> u64 {
    let win: u64 = 1 << 32;
    let hwin = win / 2;
    let mask = win - 1;

    let candidate = (expected & !mask) | wire as u64;
    if candidate.saturating_add(hwin) <= expected && candidate < u64::MAX - win {
        return candidate + win;
    }
    if candidate > expected.saturating_add(hwin) && candidate >= win {
        return candidate - win;
    }
    candidate
}


pub use crate::congestion_control::CongestionControl;
pub use crate::congestion_control::CongestionControlAlgorithm;
pub use crate::congestion_control::HardwarePacing;
pub use crate::congestion_control::Phase;
pub use crate::error::Error;
pub use crate::metrics::AggregateMetrics;
pub use crate::metrics::Counter;
pub use crate::metrics::MetricsSink;
pub use crate::metrics::NoopMetrics;
pub use crate::rack::AckEvent;
pub use crate::rack::Action;
pub use crate::rack::ActionSet;
pub use crate::rack::EngineStats;
pub use crate::rack::GoodputSample;
pub use crate::rack::Rack;
pub use crate::rack::SchedulerState;
pub use crate::rack::SendKind;
pub use crate::rack::Snapshot;
pub use crate::rack::Timer;
pub use crate::rack::TimerScheduler;
pub use crate::rack::Transmitter;
pub use crate::scoreboard::Scoreboard;
pub use crate::scoreboard::SegmentFlags;

#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;

#[path = "scoreboard/scoreboard.rs"]
pub mod scoreboard;

#[path = "rack/rack.rs"]
mod rack;

pub mod error;
pub mod metrics;
mod ranges;
