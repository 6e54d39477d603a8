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

use std::time::Duration;
use std::time::Instant;

use crate::congestion_control::Phase;

/// Transition of the Probe-RTT state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeRttEvent {
    /// Nothing changed.
    None,

    /// Probe-RTT started.
    Enter,

    /// Probe-RTT completed, going back to the given phase.
    Exit(Phase),
}

#[derive(Debug, Clone, Copy)]
struct Probing {
    /// The phase to restore on exit.
    prior_phase: Phase,

    /// The time the floor was reached, plus the probe duration.
    done_stamp: Option<Instant>,
}

/// Periodically drains the pipe to a small floor so that the windowed
/// minimum RTT is refreshed with an uncongested sample.
///
/// See BBR Section 4.3.4.
#[derive(Debug)]
pub struct ProbeRtt {
    /// Time without a new minimum before probing.
    interval: Duration,

    /// Time to hold the floor.
    duration: Duration,

    /// Outstanding data cap while probing, in bytes.
    floor: u64,

    /// The active probe, if any.
    probing: Option<Probing>,
}

impl ProbeRtt {
    pub fn new(interval: Duration, duration: Duration, floor: u64) -> Self {
        ProbeRtt {
            interval,
            duration,
            floor,
            probing: None,
        }
    }

    /// Whether a probe is active.
    pub fn active(&self) -> bool {
        self.probing.is_some()
    }

    /// Outstanding data cap while probing.
    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// Advance the state after an ack.
    pub fn check(
        &mut self,
        min_rtt_stamp: Instant,
        phase: Phase,
        pipe: u64,
        now: Instant,
    ) -> ProbeRttEvent {
        if self.probing.is_none() {
            if now.saturating_duration_since(min_rtt_stamp) > self.interval {
                self.probing = Some(Probing {
                    prior_phase: phase,
                    done_stamp: None,
                });
                return ProbeRttEvent::Enter;
            }
            return ProbeRttEvent::None;
        }

        let floor = self.floor;
        let duration = self.duration;
        let probing = match self.probing.as_mut() {
            Some(p) => p,
            None => return ProbeRttEvent::None,
        };

        match probing.done_stamp {
            None => {
                if pipe <= floor {
                    probing.done_stamp = Some(now + duration);
                }
                ProbeRttEvent::None
            }
            Some(done) if now >= done => {
                let prior = probing.prior_phase;
                self.probing = None;
                ProbeRttEvent::Exit(prior)
            }
            Some(_) => ProbeRttEvent::None,
        }
    }

    /// Abandon the probe, e.g. on a retransmission timeout.
    pub fn cancel(&mut self) {
        self.probing = None;
    }
}
