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

//! Recovery accounting and Proportional Rate Reduction.
//!
//! See RFC 6937.

use log::*;

/// Byte accounting of the scoreboard and of the current recovery episode.
#[derive(Debug, Default, Clone)]
pub struct RecoveryState {
    /// Bytes of `[snd_una, snd_max)` known to be SACKed.
    pub sacked_bytes: u64,

    /// Bytes retransmitted and neither cumulatively acked nor SACKed since.
    pub holes_rxt_bytes: u64,

    /// Bytes delivered to the receiver since recovery started.
    pub prr_delivered: u64,

    /// Bytes sent since recovery started.
    pub prr_out: u64,

    /// Flight size at the start of recovery.
    pub recover_fs: u64,

    /// `snd_max` at the start of recovery.
    pub recovery_point: u64,

    /// Bytes delivered by the latest ack.
    pub last_delivered: u64,

    /// Whether a recovery episode is in progress.
    in_recovery: bool,
}

impl RecoveryState {
    /// Estimated bytes in flight.
    ///
    /// The outstanding bytes, less what is known to be received, plus what
    /// was sent again to fill holes.
    pub fn pipe(&self, snd_una: u64, snd_max: u64) -> u64 {
        (snd_max - snd_una)
            .saturating_sub(self.sacked_bytes)
            .saturating_add(self.holes_rxt_bytes)
    }

    /// Whether a recovery episode is in progress.
    pub fn in_recovery(&self) -> bool {
        self.in_recovery
    }

    /// Start a recovery episode.
    pub fn enter(&mut self, flightsize: u64, snd_max: u64) {
        self.in_recovery = true;
        self.prr_delivered = 0;
        self.prr_out = 0;
        self.recover_fs = flightsize;
        self.recovery_point = snd_max;
        self.last_delivered = 0;
    }

    /// Leave the recovery episode.
    pub fn exit(&mut self) {
        self.in_recovery = false;
        self.prr_delivered = 0;
        self.prr_out = 0;
        self.recover_fs = 0;
    }

    /// Account bytes newly delivered by an ack.
    pub fn on_delivered(&mut self, delivered: u64) {
        self.last_delivered = delivered;
        if self.in_recovery {
            self.prr_delivered = self.prr_delivered.saturating_add(delivered);
        }
    }

    /// Account bytes sent.
    pub fn on_sent(&mut self, bytes: u64) {
        if self.in_recovery {
            self.prr_out = self.prr_out.saturating_add(bytes);
        }
    }

    /// Bytes PRR allows to be sent now.
    ///
    /// Proportional while the pipe is above `ssthresh`, then slow start
    /// reduction bound with one extra segment per ack. Never negative.
    pub fn sndcnt(&self, pipe: u64, ssthresh: u64, mss: u64) -> u64 {
        if !self.in_recovery {
            return 0;
        }

        let sndcnt = if pipe > ssthresh {
            if self.recover_fs == 0 {
                return 0;
            }
            let fs = self.recover_fs as u128;
            let target = ((self.prr_delivered as u128 * ssthresh as u128 + fs - 1) / fs)
                .min(u64::MAX as u128) as u64;
            target.saturating_sub(self.prr_out)
        } else {
            let limit = self
                .prr_delivered
                .saturating_sub(self.prr_out)
                .max(self.last_delivered)
                .saturating_add(mss);
            ssthresh.saturating_sub(pipe).min(limit)
        };

        trace!(
            "prr pipe={} ssthresh={} delivered={} out={} sndcnt={}",
            pipe,
            ssthresh,
            self.prr_delivered,
            self.prr_out,
            sndcnt
        );
        sndcnt
    }
}
