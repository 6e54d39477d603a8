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

use std::fmt;
use std::ops::Range;
use std::time::Instant;

use enumflags2::bitflags;
use enumflags2::BitFlags;

/// Number of transmission timestamps remembered per record.
pub const MAX_SEND_TIMES: usize = 3;

/// Various flags of a transmitted byte range.
#[bitflags]
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentFlags {
    /// Covered by the cumulative ack.
    Acked = 1 << 0,

    /// Covered by a SACK block.
    Sacked = 1 << 1,

    /// Retransmitted after the retransmission timer fired.
    ToRext = 1 << 2,

    /// A SACK block above the range arrived while it was still unacked.
    WasSackpass = 1 << 3,

    /// The range carries the FIN.
    HasFin = 1 << 4,

    /// The range carries the SYN.
    HasSyn = 1 << 5,

    /// The range was last sent as a tail loss probe.
    Tlp = 1 << 6,

    /// The range was sent while the connection was application limited.
    AppLimited = 1 << 7,

    /// The range lies beyond a collapsed receive window.
    RwndCollapsed = 1 << 8,

    /// A D-SACK reported the range as received twice.
    SentWithDsack = 1 << 9,

    /// The range was sent more often than `MAX_SEND_TIMES`.
    Overmax = 1 << 10,
}

/// Flags that describe the state of the data rather than one transmission.
pub(crate) fn ack_flags() -> BitFlags<SegmentFlags> {
    SegmentFlags::Acked | SegmentFlags::Sacked
}

/// Metadata about one transmitted byte range.
#[derive(Clone)]
pub struct Segment {
    /// First sequence number of the range.
    pub start: u64,

    /// One past the last sequence number of the range.
    pub end: u64,

    /// Number of retransmissions of the range.
    pub rexmit_count: u32,

    /// Total bytes retransmitted for the range.
    pub rexmit_bytes: u64,

    /// The times of the most recent transmissions, oldest first.
    sent_times: [Option<Instant>; MAX_SEND_TIMES],

    /// The time the range was acknowledged, cumulatively or selectively.
    pub ack_arrival: Option<Instant>,

    /// Number of acks that newly SACKed data above the range.
    pub dupacks: u32,

    /// Flags of the range.
    pub flags: BitFlags<SegmentFlags>,

    /// Application-limited marker of the connection when the range was sent,
    /// zero if the connection was not application limited.
    pub app_limited_seq: u64,

    /// Whether the range is counted in the retransmitted-holes bytes.
    pub(crate) holes_rxt: bool,

    /// More recently sent neighbour in the time-ordered view.
    pub(crate) tnewer: Option<usize>,

    /// Less recently sent neighbour in the time-ordered view.
    pub(crate) tolder: Option<usize>,

    /// Whether the record is linked into the time-ordered view.
    pub(crate) in_tmap: bool,
}

impl Segment {
    pub(crate) fn new(
        range: Range<u64>,
        flags: BitFlags<SegmentFlags>,
        now: Instant,
        app_limited_seq: u64,
    ) -> Self {
        let mut sent_times = [None; MAX_SEND_TIMES];
        sent_times[0] = Some(now);
        Segment {
            start: range.start,
            end: range.end,
            rexmit_count: 0,
            rexmit_bytes: 0,
            sent_times,
            ack_arrival: None,
            dupacks: 0,
            flags,
            app_limited_seq,
            holes_rxt: false,
            tnewer: None,
            tolder: None,
            in_tmap: false,
        }
    }

    /// Length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Check whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Return the byte range.
    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }

    /// Check whether `seq` lies in the range.
    pub fn contains(&self, seq: u64) -> bool {
        self.start <= seq && seq < self.end
    }

    /// Whether the range is known to be received, cumulatively or selectively.
    pub fn is_acked(&self) -> bool {
        self.flags.intersects(ack_flags())
    }

    /// Whether the range is SACKed.
    pub fn is_sacked(&self) -> bool {
        self.flags.contains(SegmentFlags::Sacked)
    }

    /// Number of transmissions, the original one included.
    pub fn send_count(&self) -> u32 {
        self.rexmit_count.saturating_add(1)
    }

    /// Time of the most recent transmission.
    pub fn last_sent(&self) -> Instant {
        let idx = (self.rexmit_count as usize).min(MAX_SEND_TIMES - 1);
        // The first slot is always filled on creation.
        self.sent_times[idx]
            .or(self.sent_times[0])
            .unwrap_or_else(Instant::now)
    }

    /// Time of the original transmission, if still remembered.
    pub fn first_sent(&self) -> Option<Instant> {
        if self.flags.contains(SegmentFlags::Overmax) {
            return None;
        }
        self.sent_times[0]
    }

    /// Iterate the remembered transmission times.
    pub fn sent_times(&self) -> impl Iterator<Item = Instant> + '_ {
        self.sent_times.iter().filter_map(|t| *t)
    }

    /// Check whether one of the remembered transmissions happened at `t`.
    pub fn was_sent_at(&self, t: Instant) -> bool {
        self.sent_times().any(|s| s == t)
    }

    /// Record a retransmission of the whole range.
    pub(crate) fn record_retransmission(&mut self, now: Instant) {
        self.rexmit_count = self.rexmit_count.saturating_add(1);
        self.rexmit_bytes = self.rexmit_bytes.saturating_add(self.len());
        let idx = self.rexmit_count as usize;
        if idx >= MAX_SEND_TIMES {
            self.flags.insert(SegmentFlags::Overmax);
            self.sent_times[MAX_SEND_TIMES - 1] = Some(now);
        } else {
            self.sent_times[idx] = Some(now);
        }
    }

    /// Restamp the latest transmission time, used when a burst is extended.
    pub(crate) fn restamp(&mut self, now: Instant) {
        let idx = (self.rexmit_count as usize).min(MAX_SEND_TIMES - 1);
        self.sent_times[idx] = Some(now);
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg={}..{}", self.start, self.end)?;
        write!(f, " rexmit={}", self.rexmit_count)?;
        write!(f, " dupacks={}", self.dupacks)?;
        write!(f, " flags={:?}", self.flags)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn segment_basic() {
        let now = Instant::now();
        let seg = Segment::new(100..300, BitFlags::empty(), now, 0);
        assert_eq!(seg.len(), 200);
        assert!(seg.contains(100));
        assert!(seg.contains(299));
        assert!(!seg.contains(300));
        assert!(!seg.is_acked());
        assert_eq!(seg.send_count(), 1);
        assert_eq!(seg.last_sent(), now);
        assert_eq!(seg.first_sent(), Some(now));
    }

    #[test]
    fn segment_retransmissions() {
        let now = Instant::now();
        let mut seg = Segment::new(0..100, BitFlags::empty(), now, 0);

        let t1 = now + Duration::from_millis(10);
        seg.record_retransmission(t1);
        assert_eq!(seg.rexmit_count, 1);
        assert_eq!(seg.rexmit_bytes, 100);
        assert_eq!(seg.last_sent(), t1);
        assert!(seg.was_sent_at(now));
        assert!(seg.was_sent_at(t1));

        let t2 = now + Duration::from_millis(20);
        seg.record_retransmission(t2);
        assert_eq!(seg.last_sent(), t2);
        assert!(!seg.flags.contains(SegmentFlags::Overmax));

        // The last slot is reused once the array is full.
        let t3 = now + Duration::from_millis(30);
        seg.record_retransmission(t3);
        assert!(seg.flags.contains(SegmentFlags::Overmax));
        assert_eq!(seg.last_sent(), t3);
        assert!(!seg.was_sent_at(t2));
        assert_eq!(seg.first_sent(), None);
        assert_eq!(seg.rexmit_bytes, 300);
    }
}
