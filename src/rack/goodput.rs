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

//! Periodic goodput measurement.
//!
//! A measurement window opens at the current delivered count and closes once
//! `min_bytes` more have been delivered without the sender being application
//! limited. Each closed window yields `delivered / elapsed` in bytes per
//! second, kept in a small ring.

use std::time::Duration;
use std::time::Instant;

use crate::congestion_control::Phase;

/// Number of past window results kept.
pub const GOODPUT_RING_LEN: usize = 8;

/// A closed measurement window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoodputSample {
    /// Goodput in bytes per second.
    pub bandwidth: u64,

    /// Phase the window was opened in.
    pub phase: Phase,

    /// Whether the measurement count is frozen at its maximum.
    pub saturated: bool,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    /// Delivered count when the window opened.
    start_delivered: u64,

    /// When the window opened.
    start_time: Instant,

    /// Phase the window was opened in.
    phase: Phase,
}

/// Goodput estimator.
#[derive(Debug)]
pub struct GoodputEstimator {
    /// Past window results in bytes per second.
    ring: [u64; GOODPUT_RING_LEN],

    /// Next slot of the ring.
    next: usize,

    /// Number of closed windows, frozen at `u8::MAX`.
    measurements: u8,

    /// The open window.
    window: Option<Window>,

    /// Bytes a window has to cover.
    min_bytes: u64,

    /// Smoothed RTT over closed windows.
    gp_srtt: Option<Duration>,

    /// Weight of the history in the smoothed RTT blend.
    decay: u32,
}

impl GoodputEstimator {
    pub fn new(min_bytes: u64, decay: u32) -> Self {
        GoodputEstimator {
            ring: [0; GOODPUT_RING_LEN],
            next: 0,
            measurements: 0,
            window: None,
            min_bytes: min_bytes.max(1),
            gp_srtt: None,
            decay: decay.max(1),
        }
    }

    /// Feed the connection's total delivered bytes.
    ///
    /// Returns the closed window, if this delivery closed one.
    pub fn on_delivered(
        &mut self,
        delivered: u64,
        app_limited: bool,
        srtt: Duration,
        phase: Phase,
        now: Instant,
    ) -> Option<GoodputSample> {
        let window = match self.window {
            Some(w) if !app_limited => w,
            _ => {
                // Application limited deliveries do not measure the path.
                self.open(delivered, phase, now);
                return None;
            }
        };

        let bytes = delivered.saturating_sub(window.start_delivered);
        let elapsed = now.saturating_duration_since(window.start_time);
        if bytes < self.min_bytes || elapsed.is_zero() {
            return None;
        }

        let bandwidth = (bytes as u128 * 1_000_000_000 / elapsed.as_nanos()) as u64;
        self.ring[self.next] = bandwidth;
        self.next = (self.next + 1) % GOODPUT_RING_LEN;

        let saturated = self.measurements == u8::MAX;
        if !saturated {
            self.measurements += 1;
        }

        self.gp_srtt = Some(match self.gp_srtt {
            Some(gp) => (gp * (self.decay - 1) + srtt) / self.decay,
            None => srtt,
        });

        self.open(delivered, phase, now);
        Some(GoodputSample {
            bandwidth,
            phase: window.phase,
            saturated,
        })
    }

    fn open(&mut self, delivered: u64, phase: Phase, now: Instant) {
        self.window = Some(Window {
            start_delivered: delivered,
            start_time: now,
            phase,
        });
    }

    /// Highest goodput of the ring, None before the first measurement.
    pub fn bandwidth(&self) -> Option<u64> {
        let filled = (self.measurements as usize).min(GOODPUT_RING_LEN);
        if filled == 0 {
            return None;
        }
        self.ring.iter().take(filled).max().copied()
    }

    /// Number of closed windows.
    pub fn measurements(&self) -> u8 {
        self.measurements
    }

    /// RTT blended over closed windows.
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.gp_srtt
    }
}
