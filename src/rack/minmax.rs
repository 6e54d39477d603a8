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

/*
 * Copyright 2017, Google Inc.
 *
 * Use of this source code is governed by the following BSD-style license:
 *
 * Redistribution and use in source and binary forms, with or without
 * modification, are permitted provided that the following conditions are
 * met:
 *
 *    * Redistributions of source code must retain the above copyright
 * notice, this list of conditions and the following disclaimer.
 *    * Redistributions in binary form must reproduce the above
 * copyright notice, this list of conditions and the following disclaimer
 * in the documentation and/or other materials provided with the
 * distribution.
 *
 *    * Neither the name of Google Inc. nor the names of its
 * contributors may be used to endorse or promote products derived from
 * this software without specific prior written permission.
 *
 * THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
 * "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
 * LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
 * A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
 * OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
 * SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
 * LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
 * DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
 * THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
 * (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
 * OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
 */

//! A windowed min/max estimator, which is based on an algorithm by Kathleen Nichols.
//! Refer to <https://groups.google.com/g/bbr-dev/c/3RTgkzi5ZD8>.
//!
//! The filter keeps the best, 2nd best and 3rd best samples of a window,
//! with the measurement time of the n'th best >= the n-1'th best. A new
//! best sample makes all earlier ones worthless, so the filter restarts on
//! it. Times are microseconds on a clock owned by the caller.

/// Which extreme the filter tracks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FilterKind {
    Min,
    Max,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
struct Sample {
    time: u64,
    value: u64,
}

/// Windowed minimum or maximum over a time span.
#[derive(Debug)]
pub struct WindowedFilter {
    kind: FilterKind,

    /// Width of the window.
    window: u64,

    /// The best, second best, third best samples.
    samples: [Sample; 3],

    /// Whether at least one sample was seen.
    valid: bool,
}

impl WindowedFilter {
    pub fn new(kind: FilterKind, window: u64) -> Self {
        Self {
            kind,
            window,
            samples: [Sample::default(); 3],
            valid: false,
        }
    }

    /// Whether `a` is at least as good as `b`.
    fn better(&self, a: u64, b: u64) -> bool {
        match self.kind {
            FilterKind::Min => a <= b,
            FilterKind::Max => a >= b,
        }
    }

    fn reset(&mut self, sample: Sample) {
        self.samples.fill(sample);
        self.valid = true;
    }

    /// Feed a measurement taken at `time`.
    ///
    /// Returns true if it became the new best value.
    pub fn update(&mut self, time: u64, value: u64) -> bool {
        // Time must not go backwards.
        if self.valid && time < self.samples[2].time {
            return false;
        }

        let sample = Sample { time, value };
        if !self.valid
            || self.better(value, self.samples[0].value)
            || time.saturating_sub(self.samples[2].time) > self.window
        {
            self.reset(sample);
            return true;
        }

        if self.better(value, self.samples[1].value) {
            self.samples[2] = sample;
            self.samples[1] = sample;
        } else if self.better(value, self.samples[2].value) {
            self.samples[2] = sample;
        }

        // Age out choices that left the window.
        let dt = time.saturating_sub(self.samples[0].time);
        if dt > self.window {
            self.samples[0] = self.samples[1];
            self.samples[1] = self.samples[2];
            self.samples[2] = sample;
            if time.saturating_sub(self.samples[0].time) > self.window {
                self.samples[0] = self.samples[1];
                self.samples[1] = self.samples[2];
                self.samples[2] = sample;
            }
        } else if self.samples[1] == self.samples[0] && dt > self.window / 4 {
            self.samples[2] = sample;
            self.samples[1] = sample;
        } else if self.samples[2] == self.samples[1] && dt > self.window / 2 {
            self.samples[2] = sample;
        }
        false
    }

    /// The best value of the window, None before the first sample.
    pub fn get(&self) -> Option<u64> {
        if self.valid {
            Some(self.samples[0].value)
        } else {
            None
        }
    }

    /// Time of the best value.
    pub fn best_time(&self) -> Option<u64> {
        if self.valid {
            Some(self.samples[0].time)
        } else {
            None
        }
    }

    /// Forget all samples.
    pub fn clear(&mut self) {
        self.valid = false;
        self.samples = [Sample::default(); 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_min() {
        let mut f = WindowedFilter::new(FilterKind::Min, 100);
        assert_eq!(f.get(), None);

        assert!(f.update(0, 50));
        assert!(!f.update(10, 60));
        assert_eq!(f.get(), Some(50));
        assert!(f.update(20, 40));
        assert_eq!(f.get(), Some(40));
        assert_eq!(f.best_time(), Some(20));

        // Older samples stay until the window passes.
        assert!(!f.update(50, 70));
        assert!(!f.update(90, 80));
        assert_eq!(f.get(), Some(40));

        // The best sample leaves the window, a later choice takes over.
        f.update(130, 90);
        assert_eq!(f.get(), Some(70));
        f.update(300, 95);
        assert_eq!(f.get(), Some(95));
    }

    #[test]
    fn filter_max() {
        let mut f = WindowedFilter::new(FilterKind::Max, 100);
        assert!(f.update(0, 50));
        assert!(!f.update(10, 40));
        assert_eq!(f.get(), Some(50));
        assert!(f.update(20, 60));
        assert_eq!(f.get(), Some(60));

        // Time going backwards is ignored.
        assert!(!f.update(5, 1000));
        assert_eq!(f.get(), Some(60));

        f.clear();
        assert_eq!(f.get(), None);
    }
}
