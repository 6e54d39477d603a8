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

//! The set of transmitted byte ranges of a connection.
//!
//! Records live in a slab arena and are referenced by their stable slab key.
//! Two indices are kept over the same records:
//!
//! * `by_seq` maps the first sequence number of every record to its key. The
//!   records always tile `[snd_una, snd_max)` without gaps or overlaps.
//! * the time-ordered view is a doubly linked list threaded through the
//!   records, most recently sent first. Only records that may still need a
//!   retransmission are linked into it.
//!
//! Vacant slab entries form the free list; a record freed by `trim_head` or
//! `merge` is recycled by the next `insert_on_send` or `split`.

use std::collections::BTreeMap;
use std::ops::Range;
use std::time::Instant;

use enumflags2::BitFlags;
use log::*;
use slab::Slab;

use crate::Error;
use crate::Result;

pub use segment::Segment;
pub use segment::SegmentFlags;
pub use segment::MAX_SEND_TIMES;

/// The scoreboard of a connection.
pub struct Scoreboard {
    /// Arena of records. Vacant entries are the free list.
    segs: Slab<Segment>,

    /// Records indexed by their first sequence number.
    by_seq: BTreeMap<u64, usize>,

    /// Most recently sent record of the time-ordered view.
    thead: Option<usize>,

    /// Least recently sent record of the time-ordered view.
    ttail: Option<usize>,

    /// Number of records linked into the time-ordered view.
    tmap_len: usize,

    /// Lowest unacknowledged sequence number.
    snd_una: u64,

    /// One past the highest sequence number sent.
    snd_max: u64,

    /// Upper limit of records.
    max_segments: usize,

    /// Trace id.
    trace_id: String,
}

impl Scoreboard {
    /// Create an empty scoreboard whose left edge is `snd_una`.
    pub fn new(snd_una: u64, max_segments: usize) -> Self {
        Scoreboard {
            segs: Slab::with_capacity(64.min(max_segments)),
            by_seq: BTreeMap::new(),
            thead: None,
            ttail: None,
            tmap_len: 0,
            snd_una,
            snd_max: snd_una,
            max_segments: max_segments.max(2),
            trace_id: String::new(),
        }
    }

    /// Set trace id.
    pub fn set_trace_id(&mut self, trace_id: &str) {
        self.trace_id = trace_id.to_string();
    }

    /// Lowest unacknowledged sequence number.
    pub fn snd_una(&self) -> u64 {
        self.snd_una
    }

    /// One past the highest sequence number sent.
    pub fn snd_max(&self) -> u64 {
        self.snd_max
    }

    /// Bytes between `snd_una` and `snd_max`.
    pub fn outstanding(&self) -> u64 {
        self.snd_max - self.snd_una
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    /// Whether no bytes are outstanding.
    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    /// Number of records linked into the time-ordered view.
    pub fn tmap_len(&self) -> usize {
        self.tmap_len
    }

    /// Number of records the arena holds without growing, vacated slots
    /// included.
    pub fn spare_capacity(&self) -> usize {
        self.segs.capacity() - self.segs.len()
    }

    /// Upper limit of records.
    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    /// Return the record with the given key.
    pub fn get(&self, key: usize) -> Option<&Segment> {
        self.segs.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: usize) -> Option<&mut Segment> {
        self.segs.get_mut(key)
    }

    /// Key of the lowest record.
    pub fn first(&self) -> Option<usize> {
        self.by_seq.values().next().copied()
    }

    /// Key of the highest record.
    pub fn last(&self) -> Option<usize> {
        self.by_seq.values().next_back().copied()
    }

    /// Iterate all records in sequence order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (usize, &Segment)> + '_ {
        self.by_seq.values().map(move |&k| (k, &self.segs[k]))
    }

    /// Keys of the records overlapping `range`, in sequence order.
    pub fn keys_overlapping(&self, range: Range<u64>) -> Vec<usize> {
        let mut keys = Vec::new();
        if range.is_empty() {
            return keys;
        }
        if let Some(k) = self.lookup(range.start) {
            keys.push(k);
        }
        for (_, &k) in self.by_seq.range(range.start.saturating_add(1)..range.end) {
            keys.push(k);
        }
        keys
    }

    /// Return the key of the record whose range contains `seq`.
    pub fn lookup(&self, seq: u64) -> Option<usize> {
        let (_, &key) = self.by_seq.range(..=seq).next_back()?;
        if self.segs[key].contains(seq) {
            Some(key)
        } else {
            None
        }
    }

    /// Record a transmission of new data.
    ///
    /// New data always extends the right edge. The highest record is
    /// extended instead of creating a new one when it was sent in the same
    /// burst with the same flags and was never retransmitted.
    pub fn insert_on_send(
        &mut self,
        range: Range<u64>,
        flags: BitFlags<SegmentFlags>,
        now: Instant,
        app_limited_seq: u64,
    ) -> Result<usize> {
        if range.is_empty() {
            return Err(Error::MalformedInput(format!("empty send {:?}", range)));
        }
        if range.start != self.snd_max {
            warn!(
                "{} send {:?} does not start at snd_max {}",
                self.trace_id, range, self.snd_max
            );
            return Err(Error::StructuralViolation(format!(
                "send {:?} does not extend snd_max {}",
                range, self.snd_max
            )));
        }

        if let Some(key) = self.last() {
            let last = &mut self.segs[key];
            if last.end == range.start
                && last.rexmit_count == 0
                && last.flags == flags
                && !flags.contains(SegmentFlags::HasFin)
                && last.last_sent() == now
                && last.in_tmap
            {
                last.end = range.end;
                last.restamp(now);
                self.snd_max = range.end;
                trace!("now={:?} {} EXTEND {:?}", now, self.trace_id, last);
                return Ok(key);
            }
        }

        let seg = Segment::new(range.clone(), flags, now, app_limited_seq);
        let key = self.segs.insert(seg);
        self.by_seq.insert(range.start, key);
        self.tmap_push_newest(key);
        self.snd_max = range.end;
        trace!(
            "now={:?} {} INSERT {:?}",
            now,
            self.trace_id,
            self.segs[key]
        );
        Ok(key)
    }

    /// Split the record at `at`, returning the key of the upper half.
    ///
    /// The lower half keeps the aggregate retransmission metadata. Both
    /// halves keep the transmission times and the flags, except that SYN
    /// stays on the lower half and FIN moves to the upper one.
    pub fn split(&mut self, key: usize, at: u64) -> Result<usize> {
        let seg = self
            .segs
            .get(key)
            .ok_or(Error::StructuralViolation(format!("split of freed record {}", key)))?;
        if at <= seg.start || at >= seg.end {
            return Err(Error::StructuralViolation(format!(
                "split of {:?} at {}",
                seg, at
            )));
        }
        // Refuse before touching anything so that the tiling is never broken.
        if self.segs.len() >= self.max_segments {
            debug!(
                "{} split of {:?} refused, {} records",
                self.trace_id,
                seg,
                self.segs.len()
            );
            return Err(Error::ResourceExhausted);
        }

        let mut upper = seg.clone();
        upper.start = at;
        upper.rexmit_bytes = 0;
        upper.flags.remove(SegmentFlags::HasSyn);
        upper.tnewer = None;
        upper.tolder = None;
        upper.in_tmap = false;

        let lower = &mut self.segs[key];
        lower.end = at;
        lower.flags.remove(SegmentFlags::HasFin);
        let linked = lower.in_tmap;

        let upper_key = self.segs.insert(upper);
        self.by_seq.insert(at, upper_key);
        if linked {
            self.tmap_insert_newer_than(key, upper_key);
        }

        trace!(
            "{} SPLIT {:?} | {:?}",
            self.trace_id,
            self.segs[key],
            self.segs[upper_key]
        );
        Ok(upper_key)
    }

    /// Coalesce two adjacent acknowledged records into the lower one.
    ///
    /// Returns `Error::Done` when either record still needs delivery.
    pub fn merge(&mut self, left: usize, right: usize) -> Result<()> {
        let (l, r) = match (self.segs.get(left), self.segs.get(right)) {
            (Some(l), Some(r)) => (l, r),
            _ => {
                return Err(Error::StructuralViolation(format!(
                    "merge of freed records {} {}",
                    left, right
                )))
            }
        };
        if l.end != r.start {
            return Err(Error::StructuralViolation(format!(
                "merge of non adjacent {:?} {:?}",
                l, r
            )));
        }
        if !l.is_acked() || !r.is_acked() || l.holes_rxt || r.holes_rxt {
            return Err(Error::Done);
        }

        let right_seg = self.remove_record(right);
        let l = &mut self.segs[left];
        l.end = right_seg.end;
        l.rexmit_bytes = l.rexmit_bytes.saturating_add(right_seg.rexmit_bytes);
        l.dupacks = l.dupacks.max(right_seg.dupacks);
        l.flags |= right_seg.flags;
        if right_seg.ack_arrival > l.ack_arrival {
            l.ack_arrival = right_seg.ack_arrival;
        }
        trace!("{} MERGE {:?}", self.trace_id, self.segs[left]);
        Ok(())
    }

    /// Remove or shrink the records below `new_una`, returning the number of
    /// bytes released.
    pub fn trim_head(&mut self, new_una: u64) -> Result<u64> {
        if new_una <= self.snd_una {
            return Ok(0);
        }
        if new_una > self.snd_max {
            return Err(Error::MalformedInput(format!(
                "ack {} beyond snd_max {}",
                new_una, self.snd_max
            )));
        }

        while let Some((&start, &key)) = self.by_seq.iter().next() {
            if start >= new_una {
                break;
            }
            let end = self.segs[key].end;
            if end <= new_una {
                self.remove_record(key);
                continue;
            }

            // Straddling record, re-key it at the new left edge.
            self.by_seq.remove(&start);
            self.segs[key].start = new_una;
            self.by_seq.insert(new_una, key);
            break;
        }

        let freed = new_una - self.snd_una;
        self.snd_una = new_una;
        Ok(freed)
    }

    /// Unlink a record from both indices and return it to the free list.
    fn remove_record(&mut self, key: usize) -> Segment {
        if self.segs[key].in_tmap {
            self.tmap_remove(key);
        }
        let start = self.segs[key].start;
        self.by_seq.remove(&start);
        self.segs.remove(key)
    }

    /// Link a record as the most recently sent one.
    pub(crate) fn tmap_push_newest(&mut self, key: usize) {
        if self.segs[key].in_tmap {
            self.tmap_remove(key);
        }
        let old_head = self.thead;
        {
            let seg = &mut self.segs[key];
            seg.tnewer = None;
            seg.tolder = old_head;
            seg.in_tmap = true;
        }
        match old_head {
            Some(h) => self.segs[h].tnewer = Some(key),
            None => self.ttail = Some(key),
        }
        self.thead = Some(key);
        self.tmap_len += 1;
    }

    /// Link `key` right after `anchor` in sending order.
    fn tmap_insert_newer_than(&mut self, anchor: usize, key: usize) {
        let newer = self.segs[anchor].tnewer;
        {
            let seg = &mut self.segs[key];
            seg.tolder = Some(anchor);
            seg.tnewer = newer;
            seg.in_tmap = true;
        }
        match newer {
            Some(n) => self.segs[n].tolder = Some(key),
            None => self.thead = Some(key),
        }
        self.segs[anchor].tnewer = Some(key);
        self.tmap_len += 1;
    }

    /// Unlink a record from the time-ordered view.
    pub(crate) fn tmap_remove(&mut self, key: usize) {
        let (newer, older) = {
            let seg = &mut self.segs[key];
            if !seg.in_tmap {
                return;
            }
            seg.in_tmap = false;
            (seg.tnewer.take(), seg.tolder.take())
        };
        match newer {
            Some(n) => self.segs[n].tolder = older,
            None => self.thead = older,
        }
        match older {
            Some(o) => self.segs[o].tnewer = newer,
            None => self.ttail = newer,
        }
        self.tmap_len -= 1;
    }

    /// Keys of the time-ordered view, least recently sent first.
    pub fn tmap_oldest_first(&self) -> TmapIter<'_> {
        TmapIter {
            board: self,
            next: self.ttail,
            remaining: self.tmap_len,
        }
    }

    /// Key of the most recently sent record still linked.
    pub fn tmap_newest(&self) -> Option<usize> {
        self.thead
    }

    /// Verify the structural invariants of the scoreboard.
    pub fn check_invariants(&self) -> Result<()> {
        if self.by_seq.len() != self.segs.len() {
            return Err(Error::StructuralViolation(format!(
                "{} indexed records but {} live records",
                self.by_seq.len(),
                self.segs.len()
            )));
        }

        let mut expect = self.snd_una;
        let mut linked = 0;
        for (&start, &key) in self.by_seq.iter() {
            let seg = self.segs.get(key).ok_or_else(|| {
                Error::StructuralViolation(format!("index points to freed record {}", key))
            })?;
            if seg.start != start || start != expect || seg.is_empty() {
                return Err(Error::StructuralViolation(format!(
                    "expected record at {} found {:?}",
                    expect, seg
                )));
            }
            if seg.in_tmap {
                linked += 1;
            }
            expect = seg.end;
        }
        if expect != self.snd_max {
            return Err(Error::StructuralViolation(format!(
                "records end at {} but snd_max is {}",
                expect, self.snd_max
            )));
        }

        let mut walked = 0;
        let mut prev = None;
        let mut cur = self.ttail;
        while let Some(key) = cur {
            let seg = &self.segs[key];
            if !seg.in_tmap || seg.tolder != prev || walked > self.segs.len() {
                return Err(Error::StructuralViolation(format!(
                    "time-ordered view broken at {:?}",
                    seg
                )));
            }
            walked += 1;
            prev = cur;
            cur = seg.tnewer;
        }
        if walked != linked || walked != self.tmap_len || prev != self.thead {
            return Err(Error::StructuralViolation(format!(
                "time-ordered view has {} records, {} flagged, {} counted",
                walked, linked, self.tmap_len
            )));
        }
        Ok(())
    }
}

/// Iterator over the time-ordered view, least recently sent first.
pub struct TmapIter<'a> {
    board: &'a Scoreboard,
    next: Option<usize>,
    remaining: usize,
}

impl<'a> Iterator for TmapIter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let key = self.next?;
        self.next = self.board.segs[key].tnewer;
        self.remaining -= 1;
        Some(key)
    }
}


mod segment;
