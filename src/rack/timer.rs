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

use std::time::Instant;

use serde::Serialize;
use strum::EnumCount;
use strum_macros::EnumCount;
use strum_macros::EnumIter;

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, EnumIter, EnumCount, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Timer {
    /// When to retransmit the lowest unacked data.
    Rto,

    /// When to send a tail loss probe.
    Tlp,
}

#[derive(Debug, Copy, Clone)]
struct Armed {
    expire: Instant,
    generation: u64,
}

/// Expiration and generation of each `Timer`.
///
/// Every arm or cancel bumps the generation of the connection, so a firing
/// armed before the latest state transition is recognised as stale.
#[derive(Debug, Copy, Clone, Default)]
pub struct TimerTable {
    armed: [Option<Armed>; Timer::COUNT],
    generation: u64,
}

impl TimerTable {
    /// Arm the given timer and return its generation.
    pub fn set(&mut self, timer: Timer, time: Instant) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.armed[timer as usize] = Some(Armed {
            expire: time,
            generation: self.generation,
        });
        self.generation
    }

    /// Get expiration time for the given timer
    pub fn get(&self, timer: Timer) -> Option<Instant> {
        self.armed[timer as usize].map(|a| a.expire)
    }

    /// Cancel the given timer
    pub fn stop(&mut self, timer: Timer) {
        if self.armed[timer as usize].take().is_some() {
            self.generation = self.generation.wrapping_add(1);
        }
    }

    /// Cancel all timers
    pub fn stop_all(&mut self) {
        for t in self.armed.iter_mut() {
            *t = None;
        }
        self.generation = self.generation.wrapping_add(1);
    }

    /// Whether a firing of `timer` carrying `generation` is the armed one.
    pub fn is_current(&self, timer: Timer, generation: u64) -> bool {
        self.armed[timer as usize].map_or(false, |a| a.generation == generation)
    }

    /// Get the minimum expiration time of all timers
    pub fn next_timeout(&self) -> Option<Instant> {
        self.armed.iter().filter_map(|a| a.map(|a| a.expire)).min()
    }

    /// Latest generation handed out.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timer_operation() {
        let mut timers = TimerTable::default();
        assert_eq!(timers.next_timeout(), None);

        let now = Instant::now();
        let tlp_time = now + Duration::from_millis(20);
        let rto_time = now + Duration::from_millis(200);
        let g1 = timers.set(Timer::Tlp, tlp_time);
        let g2 = timers.set(Timer::Rto, rto_time);
        assert!(g2 > g1);

        assert_eq!(timers.get(Timer::Tlp), Some(tlp_time));
        assert_eq!(timers.get(Timer::Rto), Some(rto_time));
        assert_eq!(timers.next_timeout(), Some(tlp_time));

        timers.stop(Timer::Tlp);
        assert_eq!(timers.get(Timer::Tlp), None);
        assert_eq!(timers.next_timeout(), Some(rto_time));

        timers.stop_all();
        assert_eq!(timers.next_timeout(), None);
    }

    #[test]
    fn timer_generation() {
        let mut timers = TimerTable::default();
        let now = Instant::now();

        let g1 = timers.set(Timer::Rto, now);
        assert!(timers.is_current(Timer::Rto, g1));
        assert!(!timers.is_current(Timer::Tlp, g1));

        // Re-arming makes the old firing stale.
        let g2 = timers.set(Timer::Rto, now + Duration::from_millis(10));
        assert!(!timers.is_current(Timer::Rto, g1));
        assert!(timers.is_current(Timer::Rto, g2));

        // So does cancelling.
        timers.stop(Timer::Rto);
        assert!(!timers.is_current(Timer::Rto, g2));
        assert!(timers.generation() > g2);
    }
}
