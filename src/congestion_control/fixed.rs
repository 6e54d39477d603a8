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

#![allow(unused_variables)]

use std::time::Instant;

use super::CongestionControl;
use super::CongestionSignal;
use super::CongestionStats;

/// FixedWindow is a simple congestion controller with a static congestion
/// window. The slow start threshold is halved on fast recovery and the
/// window collapses to one segment on a retransmission timeout.
/// It is intended to be used for testing and experiments.
#[derive(Debug)]
pub struct FixedWindow {
    /// Congestion window in bytes.
    cwnd: u64,

    /// Slow start threshold in bytes.
    ssthresh: u64,

    /// Minimal congestion window in bytes.
    min_cwnd: u64,

    /// Maximum segment size.
    mss: u64,

    /// Congestion statistics.
    stats: CongestionStats,
}

impl FixedWindow {
    pub fn new(initial_cwnd: u64, min_cwnd: u64, mss: u64) -> Self {
        Self {
            cwnd: initial_cwnd,
            ssthresh: u64::MAX,
            min_cwnd,
            mss,
            stats: Default::default(),
        }
    }
}

impl CongestionControl for FixedWindow {
    fn name(&self) -> &str {
        "FIXED"
    }

    fn congestion_window(&self) -> u64 {
        self.cwnd
    }

    fn set_congestion_window(&mut self, cwnd: u64) {
        self.cwnd = cwnd.max(self.mss);
    }

    fn slow_start_threshold(&self) -> u64 {
        self.ssthresh
    }

    fn set_slow_start_threshold(&mut self, ssthresh: u64) {
        self.ssthresh = ssthresh;
    }

    fn on_ack(&mut self, delivered: u64, now: Instant) {
        self.stats.bytes_acked_in_total = self.stats.bytes_acked_in_total.saturating_add(delivered);
    }

    fn on_congestion_signal(&mut self, signal: CongestionSignal, pipe: u64, now: Instant) {
        match signal {
            CongestionSignal::FastRecovery => {
                self.ssthresh = (self.cwnd / 2).max(self.min_cwnd);
                self.stats.fast_recoveries = self.stats.fast_recoveries.saturating_add(1);
            }
            CongestionSignal::RecoveryExit => {
                self.cwnd = self.ssthresh.max(self.min_cwnd);
            }
            CongestionSignal::RetransmissionTimeout => {
                self.ssthresh = (pipe / 2).max(self.min_cwnd);
                self.cwnd = self.mss;
                self.stats.timeouts = self.stats.timeouts.saturating_add(1);
            }
        }
    }

    fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    fn minimal_window(&self) -> u64 {
        self.min_cwnd
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_init() {
        let f = FixedWindow::new(1460 * 10, 1460 * 2, 1460);
        assert_eq!(f.name(), "FIXED");
        assert_eq!(f.congestion_window(), 1460 * 10);
        assert_eq!(f.slow_start_threshold(), u64::MAX);
        assert_eq!(f.minimal_window(), 1460 * 2);
        assert_eq!(f.in_slow_start(), true);
        assert_eq!(f.stats().bytes_acked_in_total, 0);
    }

    #[test]
    fn fixed_signals() {
        let mut f = FixedWindow::new(1460 * 10, 1460 * 2, 1460);
        let now = Instant::now();

        f.on_ack(1460, now);
        assert_eq!(f.stats().bytes_acked_in_total, 1460);
        assert_eq!(f.congestion_window(), 1460 * 10);

        f.on_congestion_signal(CongestionSignal::FastRecovery, 1460 * 10, now);
        assert_eq!(f.slow_start_threshold(), 1460 * 5);
        assert_eq!(f.congestion_window(), 1460 * 10);

        f.on_congestion_signal(CongestionSignal::RecoveryExit, 1460 * 5, now);
        assert_eq!(f.congestion_window(), 1460 * 5);
        assert_eq!(f.in_slow_start(), false);

        f.on_congestion_signal(CongestionSignal::RetransmissionTimeout, 1460 * 2, now);
        assert_eq!(f.slow_start_threshold(), 1460 * 2);
        assert_eq!(f.congestion_window(), 1460);
        assert_eq!(f.stats().timeouts, 1);
        assert_eq!(f.stats().fast_recoveries, 1);

        f.set_congestion_window(0);
        assert_eq!(f.congestion_window(), 1460);
    }
}
