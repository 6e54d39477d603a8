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

use std::cmp;
use std::time::Duration;
use std::time::Instant;

use super::minmax::FilterKind;
use super::minmax::WindowedFilter;
use crate::Error;
use crate::RackConfig;
use crate::Result;
use crate::TIMER_GRANULARITY;

/// RTT samples above this value are treated as timing anomalies.
pub const MAX_PLAUSIBLE_RTT: Duration = Duration::from_secs(120);

/// RTT estimation for a connection
/// See RFC 6298
pub struct RttEstimator {
    /// The most recent RTT sample.
    latest_rtt: Duration,

    /// The smoothed RTT, an exponentially weighted moving average of samples.
    smoothed_rtt: Option<Duration>,

    /// The RTT variance estimates the variation in the RTT samples using a
    /// mean variation
    rttvar: Duration,

    /// Lowest RTT in the sliding window.
    min_filter: WindowedFilter,

    /// Highest RTT in the sliding window.
    max_filter: WindowedFilter,

    /// The time the windowed minimum was last lowered or refreshed.
    min_rtt_stamp: Instant,

    /// Number of accepted samples, saturating.
    samples: u32,

    /// Origin of the filter clock.
    epoch: Instant,

    /// Initial RTT used before the first sample.
    initial_rtt: Duration,

    /// RTO used before the first sample.
    initial_rto: Duration,

    /// Lower bound of the RTO.
    min_rto: Duration,

    /// Upper bound of the RTO.
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(conf: &RackConfig, now: Instant) -> Self {
        let window = conf.min_rtt_window.as_micros() as u64;
        Self {
            latest_rtt: conf.initial_rtt,
            smoothed_rtt: None,
            rttvar: conf.initial_rtt / 2,
            min_filter: WindowedFilter::new(FilterKind::Min, window),
            max_filter: WindowedFilter::new(FilterKind::Max, window),
            min_rtt_stamp: now,
            samples: 0,
            epoch: now,
            initial_rtt: conf.initial_rtt,
            initial_rto: conf.initial_rto,
            min_rto: conf.min_rto,
            max_rto: conf.max_rto,
        }
    }

    /// Whether at least one valid sample was taken.
    pub fn has_sample(&self) -> bool {
        self.smoothed_rtt.is_some()
    }

    /// Return the current best RTT estimation.
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt.unwrap_or(self.latest_rtt)
    }

    /// Return the latest rtt sample
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    /// Return the variation in the RTT samples using a mean variation.
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Lowest RTT of the window, the initial RTT before any sample.
    pub fn min_rtt(&self) -> Duration {
        self.min_filter
            .get()
            .map(Duration::from_micros)
            .unwrap_or(self.initial_rtt)
    }

    /// Highest RTT of the window, the initial RTT before any sample.
    pub fn max_rtt(&self) -> Duration {
        self.max_filter
            .get()
            .map(Duration::from_micros)
            .unwrap_or(self.initial_rtt)
    }

    /// The time the windowed minimum was last lowered or refreshed.
    pub fn min_rtt_stamp(&self) -> Instant {
        self.min_rtt_stamp
    }

    /// Restart the Probe-RTT cadence, after a probe measured the path.
    pub fn refresh_min_rtt_stamp(&mut self, now: Instant) {
        self.min_rtt_stamp = now;
    }

    /// Number of accepted samples.
    pub fn sample_count(&self) -> u32 {
        self.samples
    }

    /// Retransmission timeout before backoff.
    pub fn rto(&self) -> Duration {
        let rto = match self.smoothed_rtt {
            Some(srtt) => srtt + cmp::max(4 * self.rttvar, TIMER_GRANULARITY),
            None => self.initial_rto,
        };
        rto.clamp(self.min_rto, self.max_rto)
    }

    /// Retransmission timeout after `backoff` consecutive expirations.
    pub fn rto_with_backoff(&self, backoff: u32) -> Duration {
        let factor = 1u32.checked_shl(backoff.min(16)).unwrap_or(u32::MAX);
        self.rto()
            .checked_mul(factor)
            .unwrap_or(self.max_rto)
            .min(self.max_rto)
    }

    /// Update estimator with the given RTT sample.
    ///
    /// Zero or implausibly large samples are discarded.
    pub fn update(&mut self, rtt: Duration, now: Instant) -> Result<()> {
        if rtt.is_zero() || rtt > MAX_PLAUSIBLE_RTT {
            return Err(Error::TimingAnomaly);
        }

        self.latest_rtt = rtt;
        self.samples = self.samples.saturating_add(1);

        let time = now.saturating_duration_since(self.epoch).as_micros() as u64;
        let value = (rtt.as_micros() as u64).max(1);
        if self.min_filter.update(time, value) {
            self.min_rtt_stamp = now;
        }
        self.max_filter.update(time, value);

        match self.smoothed_rtt {
            Some(srtt) => {
                let var_sample = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (3 * self.rttvar + var_sample) / 4;
                self.smoothed_rtt = Some((7 * srtt + rtt) / 8);
            }
            None => {
                self.smoothed_rtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
        }
        Ok(())
    }
}
