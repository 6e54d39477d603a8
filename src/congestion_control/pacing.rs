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

use core::str::FromStr;
use std::fmt;
use std::time::Duration;
use std::time::Instant;

use log::*;
use serde::Serialize;
use strum::EnumCount;
use strum_macros::EnumCount;
use strum_macros::EnumIter;
use strum_macros::IntoStaticStr;

use crate::metrics::Counter;
use crate::metrics::MetricsSink;
use crate::Error;
use crate::RackConfig;
use crate::Result;

/// The lower bound of burst segment number.
///
/// A lower bound is necessary to enable GSO and to avoid extremely small capacity.
const MIN_BURST_SEGMENT_NUM: u64 = 10;

/// The upper bound of burst segment number.
///
/// Used to restrict capacity. An extremely large capacity is meaningless.
const MAX_BURST_SEGMENT_NUM: u64 = 128;

/// Congestion phase of a connection, selecting the pacing multiplier.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, EnumCount, EnumIter, IntoStaticStr, Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    SlowStart,
    CongestionAvoidance,
    Recovery,
    ProbeRtt,
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(phase: &str) -> Result<Phase> {
        if phase.eq_ignore_ascii_case("slow_start") || phase.eq_ignore_ascii_case("ss") {
            Ok(Phase::SlowStart)
        } else if phase.eq_ignore_ascii_case("congestion_avoidance")
            || phase.eq_ignore_ascii_case("ca")
        {
            Ok(Phase::CongestionAvoidance)
        } else if phase.eq_ignore_ascii_case("recovery") {
            Ok(Phase::Recovery)
        } else if phase.eq_ignore_ascii_case("probe_rtt") {
            Ok(Phase::ProbeRtt)
        } else {
            Err(Error::InvalidConfig(format!("unknown phase {}", phase)))
        }
    }
}

/// Capability of a hardware pacing offload.
pub trait HardwarePacing {
    /// The highest rate the hardware can pace at, in bytes per second.
    fn max_rate(&self) -> u64;

    /// The highest supported rate not above `rate`, if any.
    fn supported_rate(&self, rate: u64) -> Option<u64>;
}

impl fmt::Debug for dyn HardwarePacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hardware pacing max_rate={}", self.max_rate())
    }
}

/// A hardware pacer supporting a discrete set of rates.
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    /// Supported rates in ascending order.
    rates: Vec<u64>,
}

impl RateTable {
    pub fn new(mut rates: Vec<u64>) -> Self {
        rates.retain(|r| *r > 0);
        rates.sort_unstable();
        rates.dedup();
        RateTable { rates }
    }
}

impl HardwarePacing for RateTable {
    fn max_rate(&self) -> u64 {
        self.rates.last().copied().unwrap_or(0)
    }

    fn supported_rate(&self, rate: u64) -> Option<u64> {
        match self.rates.binary_search(&rate) {
            Ok(i) => Some(self.rates[i]),
            Err(0) => None,
            Err(i) => Some(self.rates[i - 1]),
        }
    }
}

/// A simple token-bucket pacer
///
/// See RFC 9002 Section 7.7
#[derive(Debug)]
pub struct Pacer {
    /// Bucket capacity (bytes). Bytes that could burst during a pacing granularity
    capacity: u64,

    /// available tokens, bytes
    tokens: u64,

    /// last congestion window, bytes
    last_cwnd: u64,

    /// last refill time
    last_refill: Instant,

    /// Pacing granularity
    granularity: Duration,

    /// Maximum segment size.
    mss: u64,
}

impl Pacer {
    pub fn new(granularity: Duration, srtt: Duration, cwnd: u64, mss: u64, now: Instant) -> Self {
        let mut pacer = Pacer {
            capacity: 0,
            tokens: 0,
            last_cwnd: cwnd,
            last_refill: now,
            granularity,
            mss,
        };
        pacer.update_capacity(cwnd, srtt);
        pacer.tokens = pacer.capacity;
        pacer
    }

    /// Bucket capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Consume tokens after a burst is actually sent.
    pub fn on_sent(&mut self, bytes_sent: u64) {
        self.tokens = self.tokens.saturating_sub(bytes_sent)
    }

    /// Return the time a burst of `bytes` may be sent at `rate`, or None if
    /// it may be sent immediately.
    pub fn schedule(
        &mut self,
        bytes: u64,
        rate: u64,
        srtt: Duration,
        cwnd: u64,
        now: Instant,
    ) -> Option<Instant> {
        if srtt.is_zero() || cwnd == 0 || rate == 0 {
            return None;
        }

        if cwnd != self.last_cwnd {
            self.update_capacity(cwnd, srtt);
            self.tokens = self.capacity.min(self.tokens);
            self.last_cwnd = cwnd;
        }

        if self.tokens >= bytes {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = self
            .tokens
            .saturating_add((rate as u128 * elapsed.as_nanos() / 1_000_000_000) as u64)
            .min(self.capacity);
        self.last_refill = now;

        if bytes <= self.tokens {
            return None;
        }

        let wait = bytes.saturating_sub(self.tokens) as u128 * 1_000_000_000 / rate as u128;
        Some(self.last_refill + Duration::from_nanos(wait as u64))
    }

    fn update_capacity(&mut self, cwnd: u64, srtt: Duration) {
        let capacity =
            (cwnd as u128 * self.granularity.as_nanos() / srtt.as_nanos().max(1_000_000)) as u64;
        self.capacity = capacity.clamp(
            MIN_BURST_SEGMENT_NUM * self.mss,
            MAX_BURST_SEGMENT_NUM * self.mss,
        )
    }
}

/// Maps measured bandwidth and congestion phase to an output rate.
pub struct PacingController {
    /// Percent of the measured bandwidth used in each phase.
    multipliers: [u64; Phase::COUNT],

    /// Fixed rate overriding the computed one.
    fixed_rate: Option<u64>,

    /// Absolute cap in bytes per second.
    max_rate: u64,

    /// Hardware pacing capability, if any.
    hardware: Option<Box<dyn HardwarePacing>>,

    /// Whether hardware pacing is engaged.
    hw_engaged: bool,

    /// The rate used for the next scheduled send.
    rate: u64,

    /// Token bucket.
    pacer: Pacer,

    /// Trace id.
    trace_id: String,
}

impl PacingController {
    pub fn new(conf: &RackConfig, now: Instant) -> Self {
        let cwnd = conf.initial_congestion_window.saturating_mul(conf.mss);
        PacingController {
            multipliers: [
                conf.pacing_ss_percent,
                conf.pacing_ca_percent,
                conf.pacing_recovery_percent,
                conf.pacing_probe_rtt_percent,
            ],
            fixed_rate: conf.fixed_pacing_rate,
            max_rate: conf.max_pacing_rate,
            hardware: None,
            hw_engaged: false,
            rate: 0,
            pacer: Pacer::new(conf.pacing_granularity, conf.initial_rtt, cwnd, conf.mss, now),
            trace_id: String::new(),
        }
    }

    /// Set trace id.
    pub fn set_trace_id(&mut self, trace_id: &str) {
        self.trace_id = trace_id.to_string();
    }

    /// Engage a hardware pacer.
    pub fn set_hardware(&mut self, hardware: Box<dyn HardwarePacing>) {
        self.hw_engaged = hardware.max_rate() > 0;
        self.hardware = Some(hardware);
    }

    /// Whether the hardware pacer is engaged.
    pub fn hardware_engaged(&self) -> bool {
        self.hw_engaged
    }

    /// Override the computed rate, or go back to computing it.
    pub fn set_fixed_rate(&mut self, rate: Option<u64>) {
        self.fixed_rate = rate.filter(|r| *r > 0);
    }

    /// Percent of the measured bandwidth used in `phase`.
    pub fn multiplier(&self, phase: Phase) -> u64 {
        self.multipliers[phase as usize]
    }

    /// Current pacing rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Recompute the pacing rate from the measured bandwidth.
    pub fn update(&mut self, phase: Phase, bandwidth: u64, metrics: &dyn MetricsSink) -> u64 {
        let wanted = match self.fixed_rate {
            Some(rate) => rate,
            None => (bandwidth as u128 * self.multiplier(phase) as u128 / 100) as u64,
        };
        let mut rate = wanted.min(self.max_rate);

        if self.hw_engaged {
            if let Some(hw) = &self.hardware {
                let request = rate.min(hw.max_rate());
                match hw.supported_rate(request) {
                    Some(supported) => {
                        if supported != request {
                            metrics.add(Counter::HwRateFallbacks, 1);
                            trace!(
                                "{} hardware rate {} replaced by {}",
                                self.trace_id,
                                request,
                                supported
                            );
                        }
                        rate = supported;
                    }
                    None => {
                        warn!(
                            "{} hardware pacing rejected rate {}, disengaged",
                            self.trace_id, request
                        );
                        metrics.add(Counter::HwRateFallbacks, 1);
                        self.hw_engaged = false;
                    }
                }
            }
        }

        if rate != self.rate {
            trace!(
                "{} PACING phase={:?} bw={} rate={}",
                self.trace_id,
                phase,
                bandwidth,
                rate
            );
        }
        self.rate = rate;
        rate
    }

    /// Return the time a burst of `bytes` may be sent, None if immediately.
    pub fn schedule(
        &mut self,
        bytes: u64,
        srtt: Duration,
        cwnd: u64,
        now: Instant,
    ) -> Option<Instant> {
        self.pacer.schedule(bytes, self.rate, srtt, cwnd, now)
    }

    /// Consume tokens for sent bytes.
    pub fn on_sent(&mut self, bytes: u64) {
        self.pacer.on_sent(bytes);
    }
}

impl fmt::Debug for PacingController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rate={}", self.rate)?;
        write!(f, " fixed={:?}", self.fixed_rate)?;
        write!(f, " hw={}", self.hw_engaged)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AggregateMetrics;

    const GRANULARITY: Duration = Duration::from_millis(1);

    #[test]
    fn phase_name() {
        let cases = [
            ("slow_start", Ok(Phase::SlowStart)),
            ("SS", Ok(Phase::SlowStart)),
            ("congestion_avoidance", Ok(Phase::CongestionAvoidance)),
            ("ca", Ok(Phase::CongestionAvoidance)),
            ("Recovery", Ok(Phase::Recovery)),
            ("probe_rtt", Ok(Phase::ProbeRtt)),
            ("probe", Err(Error::InvalidConfig("unknown phase probe".into()))),
        ];

        for (name, phase) in cases {
            assert_eq!(Phase::from_str(name), phase);
        }
        let name: &'static str = Phase::ProbeRtt.into();
        assert_eq!(name, "probe_rtt");
    }

    #[test]
    fn rate_table() {
        let t = RateTable::new(vec![3000, 1000, 0, 2000, 2000]);
        assert_eq!(t.max_rate(), 3000);
        assert_eq!(t.supported_rate(2000), Some(2000));
        assert_eq!(t.supported_rate(2500), Some(2000));
        assert_eq!(t.supported_rate(10000), Some(3000));
        assert_eq!(t.supported_rate(999), None);
        assert_eq!(RateTable::default().max_rate(), 0);
    }

    #[test]
    fn pacer_new() {
        let srtt = Duration::from_millis(1);
        let mss: u64 = 1500;
        let now = Instant::now();

        let cwnd: u64 = 20 * mss;
        let p = Pacer::new(GRANULARITY, srtt, cwnd, mss, now);
        assert_eq!(p.capacity, p.tokens);
        assert_eq!(p.capacity(), cwnd);

        let p = Pacer::new(GRANULARITY, srtt, mss, mss, now);
        assert_eq!(p.capacity(), MIN_BURST_SEGMENT_NUM * mss);

        let p = Pacer::new(GRANULARITY, srtt, 200 * mss, mss, now);
        assert_eq!(p.capacity(), MAX_BURST_SEGMENT_NUM * mss);
    }

    #[test]
    fn pacer_schedule_and_send() {
        let srtt = Duration::from_millis(1);
        let mss: u64 = 1000;
        let cwnd: u64 = 10 * mss;
        let now = Instant::now();
        let rate: u64 = 1_000_000;

        // Abnormal input
        let mut p = Pacer::new(GRANULARITY, srtt, cwnd, mss, now);
        assert_eq!(p.schedule(mss, rate, Duration::ZERO, cwnd, now), None);
        assert_eq!(p.schedule(mss, rate, srtt, 0, now), None);
        assert_eq!(p.schedule(mss, 0, srtt, cwnd, now), None);

        // Drain the bucket
        let mut p = Pacer::new(GRANULARITY, srtt, cwnd, mss, now);
        for _ in 0..10 {
            assert_eq!(p.schedule(mss, rate, srtt, cwnd, now), None);
            p.on_sent(mss);
        }
        assert_eq!(p.tokens, 0);

        // Tokens ran out, further schedule leads to delay
        let wait = p.schedule(mss, rate, srtt, cwnd, now).unwrap();
        assert_eq!(wait.duration_since(now), Duration::from_millis(1));

        // Refilled
        assert_eq!(
            p.schedule(mss, rate, srtt, cwnd, now + Duration::from_millis(1)),
            None
        );
        p.on_sent(mss);
        assert_eq!(p.tokens, 0);
    }

    #[test]
    fn controller_phase_multiplier() {
        let conf = RackConfig::default();
        let metrics = AggregateMetrics::new();
        let mut pc = PacingController::new(&conf, Instant::now());

        assert_eq!(pc.update(Phase::SlowStart, 1_000_000, &metrics), 2_000_000);
        assert_eq!(pc.update(Phase::CongestionAvoidance, 1_000_000, &metrics), 1_000_000);
        assert_eq!(pc.update(Phase::Recovery, 1_000_000, &metrics), 900_000);
        assert_eq!(pc.update(Phase::ProbeRtt, 1_000_000, &metrics), 600_000);
        assert_eq!(pc.rate(), 600_000);
    }

    #[test]
    fn controller_fixed_rate_and_cap() {
        let conf = RackConfig {
            max_pacing_rate: 5_000_000,
            ..RackConfig::default()
        };
        let metrics = AggregateMetrics::new();
        let mut pc = PacingController::new(&conf, Instant::now());

        assert_eq!(pc.update(Phase::SlowStart, 10_000_000, &metrics), 5_000_000);

        pc.set_fixed_rate(Some(1_234));
        assert_eq!(pc.update(Phase::SlowStart, 10_000_000, &metrics), 1_234);

        pc.set_fixed_rate(Some(50_000_000));
        assert_eq!(pc.update(Phase::SlowStart, 1, &metrics), 5_000_000);

        pc.set_fixed_rate(None);
        assert_eq!(pc.update(Phase::CongestionAvoidance, 1_000, &metrics), 1_000);
    }

    #[test]
    fn controller_hardware() {
        let conf = RackConfig::default();
        let metrics = AggregateMetrics::new();
        let mut pc = PacingController::new(&conf, Instant::now());
        pc.set_hardware(Box::new(RateTable::new(vec![
            1_000_000, 2_000_000, 4_000_000,
        ])));
        assert!(pc.hardware_engaged());

        // Exact rate.
        assert_eq!(pc.update(Phase::CongestionAvoidance, 2_000_000, &metrics), 2_000_000);
        assert_eq!(metrics.get(Counter::HwRateFallbacks), Some(0));

        // Next supported rate below the request, never above.
        assert_eq!(pc.update(Phase::CongestionAvoidance, 3_000_000, &metrics), 2_000_000);
        assert_eq!(metrics.get(Counter::HwRateFallbacks), Some(1));

        // Hardware cap.
        assert_eq!(pc.update(Phase::SlowStart, 9_000_000, &metrics), 4_000_000);

        // Below every supported rate, hardware pacing is disengaged.
        assert_eq!(pc.update(Phase::CongestionAvoidance, 500_000, &metrics), 500_000);
        assert!(!pc.hardware_engaged());
        assert_eq!(metrics.get(Counter::HwRateFallbacks), Some(2));
    }

    #[test]
    fn controller_schedule() {
        let conf = RackConfig::default();
        let metrics = AggregateMetrics::new();
        let now = Instant::now();
        let mut pc = PacingController::new(&conf, now);
        let srtt = Duration::from_millis(100);
        let cwnd = 10 * conf.mss;

        // No rate computed yet.
        assert_eq!(pc.schedule(conf.mss, srtt, cwnd, now), None);

        pc.update(Phase::CongestionAvoidance, 1_000_000, &metrics);
        let burst = MIN_BURST_SEGMENT_NUM * conf.mss;
        assert_eq!(pc.schedule(burst, srtt, cwnd, now), None);
        pc.on_sent(burst);
        assert!(pc.schedule(conf.mss, srtt, cwnd, now).is_some());
    }
}
