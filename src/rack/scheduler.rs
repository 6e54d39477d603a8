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

use std::ops::Range;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use smallvec::SmallVec;
use strum_macros::IntoStaticStr;

use crate::scoreboard::Scoreboard;
use crate::scoreboard::SegmentFlags;

use super::timer::Timer;
use super::timer::TimerTable;

/// Loss recovery state of the connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SchedulerState {
    /// No loss suspected.
    #[default]
    Open,

    /// Repairing losses under Proportional Rate Reduction.
    Recovering,

    /// A tail loss probe is outstanding.
    TlpPending,

    /// The retransmission timer fired and the flight is resent.
    RtoPending,
}

/// Why a range is to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendKind {
    /// Retransmission of data presumed lost.
    Retransmit,

    /// Tail loss probe retransmitting the highest unacked data.
    TailProbe,

    /// Tail loss probe carrying new data.
    NewDataProbe,
}

/// An action for the sender to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send the range, spanning the given number of segments.
    Send {
        range: Range<u64>,
        segments: u32,
        kind: SendKind,
    },

    /// Arm the retransmission timer.
    ArmRto { duration: Duration, generation: u64 },

    /// Arm the tail loss probe timer.
    ArmTlp { duration: Duration, generation: u64 },

    /// Cancel any armed timer.
    CancelTimer,
}

/// Actions produced by one engine call, in the order to carry them out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActionSet {
    actions: SmallVec<[Action; 4]>,
}

impl ActionSet {
    pub fn new() -> Self {
        ActionSet::default()
    }

    pub fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn extend(&mut self, other: ActionSet) {
        self.actions.extend(other.actions);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Action> {
        self.actions.iter()
    }

    /// Ranges to send, with their kind.
    pub fn sends(&self) -> impl Iterator<Item = (&Range<u64>, SendKind)> + '_ {
        self.actions.iter().filter_map(|a| match a {
            Action::Send { range, kind, .. } => Some((range, *kind)),
            _ => None,
        })
    }

    /// Total bytes to send.
    pub fn send_bytes(&self) -> u64 {
        self.sends().map(|(r, _)| r.end - r.start).sum()
    }

    /// The last timer action, if any.
    pub fn timer(&self) -> Option<&Action> {
        self.actions.iter().rev().find(|a| !matches!(a, Action::Send { .. }))
    }
}

impl IntoIterator for ActionSet {
    type Item = Action;
    type IntoIter = smallvec::IntoIter<[Action; 4]>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.into_iter()
    }
}

impl<'a> IntoIterator for &'a ActionSet {
    type Item = &'a Action;
    type IntoIter = std::slice::Iter<'a, Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.iter()
    }
}

/// Number of segments of `len` bytes.
pub(crate) fn segments(len: u64, mss: u64) -> u32 {
    let mss = mss.max(1);
    ((len + mss - 1) / mss).min(u32::MAX as u64) as u32
}

/// Position of the go-back-N retransmission after a timeout.
///
/// Keys are recycled by the slab, the start sequence tells whether the
/// record is still the one pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub key: usize,
    pub start: u64,
}

/// Retransmission scheduling state.
#[derive(Debug, Default)]
pub struct Scheduler {
    /// Current state.
    pub state: SchedulerState,

    /// Consecutive retransmission timeouts.
    pub backoff: u32,

    /// `snd_max` when the retransmission timer fired.
    pub rto_point: u64,

    /// When the retransmission timer fired.
    pub rto_fired_at: Option<Instant>,

    /// Congestion window and slow start threshold before the first timeout
    /// of a series, restored if the timeout proves spurious.
    pub undo: Option<(u64, u64)>,

    /// End of the outstanding tail loss probe.
    pub tlp_end: Option<u64>,

    /// Next record to resend after a timeout.
    pub(crate) cursor: Option<Cursor>,

    /// Armed timers.
    pub timers: TimerTable,
}

impl Scheduler {
    /// Arm `timer` after `duration` and return the action telling the
    /// sender. The other timer is cancelled.
    pub fn arm(&mut self, timer: Timer, duration: Duration, now: Instant) -> Action {
        let other = match timer {
            Timer::Rto => Timer::Tlp,
            Timer::Tlp => Timer::Rto,
        };
        self.timers.stop(other);
        let generation = self.timers.set(timer, now + duration);
        match timer {
            Timer::Rto => Action::ArmRto {
                duration,
                generation,
            },
            Timer::Tlp => Action::ArmTlp {
                duration,
                generation,
            },
        }
    }

    /// Cancel all timers, returning the action if any was armed.
    pub fn cancel(&mut self) -> Option<Action> {
        if self.timers.next_timeout().is_none() {
            return None;
        }
        self.timers.stop_all();
        Some(Action::CancelTimer)
    }

    /// Sequence to resume the go-back-N retransmission from.
    pub(crate) fn resume_point(&self, board: &Scoreboard) -> u64 {
        match self.cursor {
            Some(c) => match board.get(c.key) {
                Some(seg) if seg.start == c.start => c.start,
                _ => board.snd_una().max(c.start),
            },
            None => board.snd_una(),
        }
    }
}

/// The tail loss probe: the last MSS of the highest unacked record.
pub(crate) fn tail_probe(board: &Scoreboard, mss: u64) -> Option<Range<u64>> {
    let (_, seg) = board.iter().rev().find(|(_, s)| !s.is_acked())?;
    Some(seg.end.saturating_sub(mss).max(seg.start)..seg.end)
}

/// The lowest unacked record.
pub(crate) fn lowest_unacked(board: &Scoreboard) -> Option<usize> {
    board.iter().find(|(_, s)| !s.is_acked()).map(|(k, _)| k)
}

/// Schedule retransmission of `lost`, in sequence order, within `budget`
/// bytes. Returns the bytes scheduled.
pub(crate) fn plan_retransmissions(
    board: &Scoreboard,
    lost: &[usize],
    budget: u64,
    mss: u64,
    actions: &mut ActionSet,
) -> u64 {
    let mut ranges: SmallVec<[Range<u64>; 8]> = lost
        .iter()
        .filter_map(|&k| board.get(k))
        .filter(|s| !s.is_acked())
        .map(|s| s.range())
        .collect();
    ranges.sort_by_key(|r| r.start);

    let mut left = budget;
    for range in ranges {
        if left == 0 {
            break;
        }
        let len = (range.end - range.start).min(left);
        let range = range.start..range.start + len;
        actions.push(Action::Send {
            segments: segments(len, mss),
            range,
            kind: SendKind::Retransmit,
        });
        left -= len;
    }
    budget - left
}

/// Records to resend after a timeout: unacked records below `rto_point`
/// not sent again since the timer fired, from `from` on.
pub(crate) fn go_back_n(
    board: &Scoreboard,
    from: u64,
    rto_point: u64,
    fired_at: Instant,
) -> Vec<usize> {
    board
        .keys_overlapping(from..rto_point)
        .into_iter()
        .filter(|&k| match board.get(k) {
            Some(s) => {
                !s.is_acked()
                    && !s.flags.contains(SegmentFlags::RwndCollapsed)
                    && s.last_sent() < fired_at
            }
            None => false,
        })
        .collect()
}
