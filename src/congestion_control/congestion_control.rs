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

use core::str::FromStr;
use std::fmt;
use std::time::Instant;

use crate::Error;
use crate::RackConfig;
use crate::Result;
pub use fixed::FixedWindow;
pub use pacing::HardwarePacing;
pub use pacing::Pacer;
pub use pacing::PacingController;
pub use pacing::Phase;
pub use pacing::RateTable;

/// Available congestion window laws shipped with the crate.
///
/// The loss recovery engine does not depend on a particular law, any
/// implementation of `CongestionControl` can be plugged in.
#[repr(C)]
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub enum CongestionControlAlgorithm {
    /// A static congestion window that is only reduced on congestion
    /// signals. It is intended to be used for testing and experiments.
    #[default]
    Fixed,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<CongestionControlAlgorithm> {
        if algor.eq_ignore_ascii_case("fixed") {
            Ok(CongestionControlAlgorithm::Fixed)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// A congestion signal raised by the loss recovery engine.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum CongestionSignal {
    /// Fast recovery started. The law is expected to set the slow start
    /// threshold the recovery converges to.
    FastRecovery,

    /// Fast recovery completed.
    RecoveryExit,

    /// The retransmission timer expired.
    RetransmissionTimeout,
}

/// Congestion control statistics.
#[derive(Debug, Default, Clone)]
pub struct CongestionStats {
    /// Total bytes delivered.
    pub bytes_acked_in_total: u64,

    /// Number of fast recovery episodes.
    pub fast_recoveries: u64,

    /// Number of retransmission timeouts.
    pub timeouts: u64,
}

/// Congestion window and slow start threshold owned by a congestion
/// control law.
pub trait CongestionControl {
    /// Name of congestion control algorithm.
    fn name(&self) -> &str;

    /// Current congestion window.
    fn congestion_window(&self) -> u64;

    /// Overwrite the congestion window.
    fn set_congestion_window(&mut self, cwnd: u64);

    /// Current slow start threshold.
    fn slow_start_threshold(&self) -> u64;

    /// Overwrite the slow start threshold.
    fn set_slow_start_threshold(&mut self, ssthresh: u64);

    /// Callback for newly delivered bytes outside of recovery.
    fn on_ack(&mut self, delivered: u64, now: Instant) {}

    /// Congestion event.
    fn on_congestion_signal(&mut self, signal: CongestionSignal, pipe: u64, now: Instant);

    /// Check if in slow start.
    fn in_slow_start(&self) -> bool {
        self.congestion_window() < self.slow_start_threshold()
    }

    /// Minimal congestion window.
    fn minimal_window(&self) -> u64;

    /// Congestion stats.
    fn stats(&self) -> &CongestionStats;
}

impl fmt::Debug for dyn CongestionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "congestion controller.")
    }
}

/// Build a congestion controller.
pub fn build_congestion_controller(conf: &RackConfig) -> Box<dyn CongestionControl> {
    let min_cwnd = conf.min_congestion_window.saturating_mul(conf.mss);
    let initial_cwnd = conf.initial_congestion_window.saturating_mul(conf.mss);

    match conf.congestion_control_algorithm {
        CongestionControlAlgorithm::Fixed => {
            Box::new(FixedWindow::new(initial_cwnd, min_cwnd, conf.mss))
        }
    }
}


mod fixed;
mod pacing;
