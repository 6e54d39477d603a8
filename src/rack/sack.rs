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

//! Processing of cumulative acks, SACK and D-SACK blocks, and the RACK
//! time-based loss detection they feed.
//!
//! See RFC 2018, RFC 2883 and RFC 8985.

use std::ops::Range;
use std::time::Duration;
use std::time::Instant;

use enumflags2::BitFlags;
use log::*;
use smallvec::SmallVec;

use crate::ranges::RangeSet;
use crate::scoreboard::Scoreboard;
use crate::scoreboard::Segment;
use crate::scoreboard::SegmentFlags;
use crate::Error;
use crate::Result;

use super::prr::RecoveryState;

/// Upper bound of the D-SACK reordering window multiplier.
const MAX_REO_WND_MULT: u32 = 16;

/// An inbound acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckEvent {
    /// Cumulative ack, the receiver's next expected sequence number.
    pub cum_ack: u64,

    /// SACK blocks.
    pub sack_blocks: SmallVec<[Range<u64>; 4]>,

    /// D-SACK block reporting data received twice.
    pub dsack: Option<Range<u64>>,

    /// Receive window advertised with the ack, in bytes.
    pub rwnd: u64,

    /// Send time of the segment that triggered the ack, from the timestamp
    /// echo option.
    pub ts_echo: Option<Instant>,
}

impl AckEvent {
    pub fn new(cum_ack: u64) -> Self {
        AckEvent {
            cum_ack,
            sack_blocks: SmallVec::new(),
            dsack: None,
            rwnd: u64::MAX,
            ts_echo: None,
        }
    }

    /// Build an ack from SACK blocks as carried on the wire.
    ///
    /// The first block is a D-SACK if it lies below the cumulative ack or
    /// inside the second block, see RFC 2883 Section 4.
    pub fn from_wire(cum_ack: u64, blocks: &[Range<u64>], rwnd: u64) -> Self {
        let mut ev = AckEvent::new(cum_ack).with_window(rwnd);
        let mut blocks = blocks.iter();
        if let Some(first) = blocks.next() {
            let inside_second = second_covers(blocks.as_slice(), first);
            if first.end <= cum_ack || inside_second {
                ev.dsack = Some(first.clone());
            } else {
                ev.sack_blocks.push(first.clone());
            }
        }
        ev.sack_blocks.extend(blocks.cloned());
        ev
    }

    pub fn with_sack(mut self, block: Range<u64>) -> Self {
        self.sack_blocks.push(block);
        self
    }

    pub fn with_dsack(mut self, block: Range<u64>) -> Self {
        self.dsack = Some(block);
        self
    }

    pub fn with_window(mut self, rwnd: u64) -> Self {
        self.rwnd = rwnd;
        self
    }

    pub fn with_ts_echo(mut self, ts: Instant) -> Self {
        self.ts_echo = Some(ts);
        self
    }
}

fn second_covers(rest: &[Range<u64>], first: &Range<u64>) -> bool {
    match rest.first() {
        Some(second) => second.start <= first.start && first.end <= second.end,
        None => false,
    }
}

/// A record newly delivered by an ack.
#[derive(Debug, Clone, Copy)]
pub struct Delivered {
    /// Latest transmission time of the record.
    pub last_sent: Instant,

    /// End of the record.
    pub end: u64,

    /// Number of retransmissions of the record.
    pub rexmit_count: u32,

    /// Flags of the record before delivery.
    pub flags: BitFlags<SegmentFlags>,
}

impl Delivered {
    fn from_segment(seg: &Segment) -> Self {
        Delivered {
            last_sent: seg.last_sent(),
            end: seg.end,
            rexmit_count: seg.rexmit_count,
            flags: seg.flags,
        }
    }
}

/// What an ack changed.
#[derive(Debug, Default, Clone)]
pub struct AckOutcome {
    /// Whether `snd_una` advanced.
    pub advanced: bool,

    /// Bytes newly covered by the cumulative ack that were not SACKed.
    pub cum_acked: u64,

    /// Bytes newly SACKed.
    pub newly_sacked: u64,

    /// RTT sample from the most recently sent usable record.
    pub rtt_sample: Option<Duration>,

    /// The most recently sent record among the newly delivered ones.
    pub newest: Option<Delivered>,

    /// Whether a delivered record was sent while application limited.
    pub app_limited: bool,

    /// Whether a tail loss probe was delivered.
    pub probe_acked: bool,

    /// Whether data passed by a SACK arrived without retransmission.
    pub reordering: bool,

    /// Whether a D-SACK block was processed.
    pub dsack: bool,

    /// Retransmitted bytes reported as received twice.
    pub spurious_bytes: u64,

    /// Blocks ignored as malformed.
    pub malformed: u32,

    /// Blocks skipped as already recorded.
    pub filtered: u32,

    /// Blocks ignored because the record limit was reached.
    pub refused: u32,

    /// Records split.
    pub splits: u32,

    /// Records merged.
    pub merged: u32,

    /// Records newly flagged beyond a collapsed receive window.
    pub collapsed: u32,

    /// Whether the ack repeated the cumulative ack without SACK information
    /// or a window update while data was outstanding.
    pub duplicate: bool,

    /// Send time the RTT sample was taken from.
    rtt_sent: Option<Instant>,
}

impl AckOutcome {
    /// Bytes newly delivered to the receiver.
    pub fn delivered(&self) -> u64 {
        self.cum_acked + self.newly_sacked
    }

    fn on_delivered(&mut self, d: Delivered, ts_echo: Option<Instant>, sent_at_echo: bool, now: Instant) {
        if d.flags.contains(SegmentFlags::Tlp) {
            self.probe_acked = true;
        }
        if d.flags.contains(SegmentFlags::AppLimited) {
            self.app_limited = true;
        }
        if d.flags.contains(SegmentFlags::WasSackpass) && d.rexmit_count == 0 {
            self.reordering = true;
        }

        // Karn's algorithm, unless the timestamp echo disambiguates.
        let sent = if d.rexmit_count == 0 {
            Some(d.last_sent)
        } else if sent_at_echo {
            ts_echo
        } else {
            None
        };
        if let Some(sent) = sent {
            if self.rtt_sent.map_or(true, |s| sent >= s) {
                self.rtt_sent = Some(sent);
                self.rtt_sample = Some(now.saturating_duration_since(sent));
            }
        }

        match self.newest {
            Some(n) if n.last_sent > d.last_sent => (),
            Some(n) if n.last_sent == d.last_sent && n.end >= d.end => (),
            _ => self.newest = Some(d),
        }
    }
}

/// RACK state: the most recently sent delivered record and the reordering
/// window.
#[derive(Debug, Clone)]
pub struct RackState {
    /// Latest transmission time of the most recently sent delivered record.
    pub xmit_ts: Option<Instant>,

    /// End of that record.
    pub end_seq: u64,

    /// RTT of that record.
    pub rtt: Duration,

    /// When reordering was last observed.
    pub reo_seen: Option<Instant>,

    /// Multiplier of the reordering window, bumped by D-SACKs.
    pub reo_wnd_mult: u32,

    /// `snd_max` when the multiplier was last bumped.
    dsack_round: Option<u64>,
}

impl Default for RackState {
    fn default() -> Self {
        RackState {
            xmit_ts: None,
            end_seq: 0,
            rtt: Duration::ZERO,
            reo_seen: None,
            reo_wnd_mult: 1,
            dsack_round: None,
        }
    }
}

impl RackState {
    /// Advance to a newly delivered record.
    ///
    /// A retransmitted record only counts if the ack cannot be for an
    /// earlier transmission of it.
    pub fn update(&mut self, d: &Delivered, ts_echo: Option<Instant>, min_rtt: Duration, now: Instant) {
        let rtt = now.saturating_duration_since(d.last_sent);
        if d.rexmit_count > 0 {
            if matches!(ts_echo, Some(ts) if ts < d.last_sent) {
                return;
            }
            if rtt < min_rtt {
                return;
            }
        }

        let newer = match self.xmit_ts {
            None => true,
            Some(x) => d.last_sent > x || (d.last_sent == x && d.end > self.end_seq),
        };
        if newer {
            self.xmit_ts = Some(d.last_sent);
            self.end_seq = d.end;
            self.rtt = rtt;
        }
    }

    /// Note reordering evidence.
    pub fn on_reordering(&mut self, now: Instant) {
        self.reo_seen = Some(now);
    }

    /// Widen the window on a D-SACK, at most once per round trip.
    pub fn on_dsack(&mut self, snd_una: u64, snd_max: u64, now: Instant) {
        let new_round = match self.dsack_round {
            Some(round) => snd_una > round,
            None => true,
        };
        if new_round {
            self.reo_wnd_mult = (self.reo_wnd_mult + 1).min(MAX_REO_WND_MULT);
            self.dsack_round = Some(snd_max);
        }
        self.reo_seen = Some(now);
    }

    /// Forget reordering evidence older than `fade`.
    pub fn fade(&mut self, fade: Duration, now: Instant) {
        if let Some(seen) = self.reo_seen {
            if now.saturating_duration_since(seen) > fade {
                self.reo_seen = None;
                self.reo_wnd_mult = 1;
                self.dsack_round = None;
            }
        }
    }

    /// Reordering window: `min_rtt >> shift`, scaled by the D-SACK
    /// multiplier and bounded by the smoothed RTT.
    pub fn reo_wnd(&self, min_rtt: Duration, srtt: Duration, shift: u32) -> Duration {
        let base = min_rtt / (1u32 << shift.min(16));
        (base * self.reo_wnd_mult).min(srtt)
    }

    /// Records considered lost, least recently sent first.
    ///
    /// A record is lost when a record sent after it was delivered and it
    /// stayed unacked for longer than the RACK RTT plus the reordering
    /// window, or when enough acks SACKed data above it.
    pub fn detect_lost(
        &self,
        board: &Scoreboard,
        reo_wnd: Duration,
        dupack_thresh: u32,
        now: Instant,
    ) -> Vec<usize> {
        let mut lost = Vec::new();
        for key in board.tmap_oldest_first() {
            let seg = match board.get(key) {
                Some(seg) => seg,
                None => continue,
            };
            if seg.is_acked() || seg.flags.contains(SegmentFlags::RwndCollapsed) {
                continue;
            }

            // A hole already sent again is only lost once a later send is
            // delivered ahead of it.
            let by_dupacks = !seg.holes_rxt && seg.dupacks >= dupack_thresh;

            let last = seg.last_sent();
            let by_time = match self.xmit_ts {
                Some(x) if last < x || (last == x && seg.end <= self.end_seq) => {
                    now >= last + self.rtt + reo_wnd
                }
                _ => false,
            };
            if by_time || by_dupacks {
                lost.push(key);
            }
        }
        lost
    }
}

/// Applies acks to the scoreboard.
#[derive(Debug)]
pub struct SackProcessor {
    /// Ranges above `snd_una` already recorded as SACKed.
    filter: RangeSet,

    /// Highest SACKed sequence number.
    fack: u64,

    /// Whether records are flagged beyond a collapsed window.
    rwnd_collapsed: bool,

    /// Receive window of the previous ack.
    rwnd: u64,

    /// Trace id.
    trace_id: String,
}

impl SackProcessor {
    pub fn new(snd_una: u64, filter_capacity: usize) -> Self {
        SackProcessor {
            filter: RangeSet::new(filter_capacity.max(1)),
            fack: snd_una,
            rwnd_collapsed: false,
            rwnd: u64::MAX,
            trace_id: String::new(),
        }
    }

    /// Set trace id.
    pub fn set_trace_id(&mut self, trace_id: &str) {
        self.trace_id = trace_id.to_string();
    }

    /// Highest SACKed sequence number.
    pub fn fack(&self) -> u64 {
        self.fack
    }

    /// Apply an ack to the scoreboard.
    ///
    /// Malformed blocks are ignored and counted in the outcome. The whole
    /// ack is rejected if the cumulative ack lies beyond `snd_max`.
    pub fn process(
        &mut self,
        board: &mut Scoreboard,
        rec: &mut RecoveryState,
        rack: &mut RackState,
        ev: &AckEvent,
        min_rtt: Duration,
        now: Instant,
    ) -> Result<AckOutcome> {
        let mut out = AckOutcome::default();

        if ev.cum_ack > board.snd_max() {
            return Err(Error::MalformedInput(format!(
                "cumulative ack {} beyond snd_max {}",
                ev.cum_ack,
                board.snd_max()
            )));
        }

        if ev.cum_ack > board.snd_una() {
            self.advance(board, rec, rack, ev, min_rtt, now, &mut out)?;
        }

        out.duplicate = !out.advanced
            && ev.cum_ack == board.snd_una()
            && ev.sack_blocks.is_empty()
            && ev.dsack.is_none()
            && ev.rwnd == self.rwnd
            && board.outstanding() > 0;
        self.rwnd = ev.rwnd;

        self.check_window(board, ev.rwnd, &mut out);

        let mut blocks = ev.sack_blocks.clone();
        blocks.sort_by_key(|b| b.start);
        for block in blocks {
            if block.start >= block.end || block.end > board.snd_max() || block.end <= board.snd_una()
            {
                debug!(
                    "{} malformed sack block {:?} snd_una={} snd_max={}",
                    self.trace_id,
                    block,
                    board.snd_una(),
                    board.snd_max()
                );
                out.malformed += 1;
                continue;
            }

            let block = block.start.max(board.snd_una())..block.end;
            if self.filter.covers(&block) {
                out.filtered += 1;
                continue;
            }

            match self.mark_block(board, rec, rack, ev, &block, min_rtt, now, &mut out) {
                Ok(()) => self.filter.insert(block),
                Err(Error::ResourceExhausted) => {
                    debug!(
                        "{} sack block {:?} refused, {} records",
                        self.trace_id,
                        block,
                        board.len()
                    );
                    out.refused += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if out.newly_sacked > 0 {
            self.count_dupacks(board);
        } else if out.duplicate {
            self.count_duplicate_cum_ack(board);
        }

        if let Some(dsack) = &ev.dsack {
            self.apply_dsack(board, rack, dsack, now, &mut out);
        }

        Ok(out)
    }

    /// Advance `snd_una` to the cumulative ack.
    #[allow(clippy::too_many_arguments)]
    fn advance(
        &mut self,
        board: &mut Scoreboard,
        rec: &mut RecoveryState,
        rack: &mut RackState,
        ev: &AckEvent,
        min_rtt: Duration,
        now: Instant,
        out: &mut AckOutcome,
    ) -> Result<()> {
        let new_una = ev.cum_ack;
        for key in board.keys_overlapping(board.snd_una()..new_una) {
            let seg = board.get(key).ok_or_else(|| {
                Error::StructuralViolation(format!("indexed record {} vanished", key))
            })?;
            let covered = seg.end.min(new_una) - seg.start;

            if seg.holes_rxt {
                rec.holes_rxt_bytes = rec.holes_rxt_bytes.saturating_sub(covered);
            }
            if seg.is_sacked() {
                rec.sacked_bytes = rec.sacked_bytes.saturating_sub(covered);
                continue;
            }

            out.cum_acked += covered;
            let d = Delivered::from_segment(seg);
            let sent_at_echo = ev.ts_echo.map_or(false, |ts| seg.was_sent_at(ts));
            rack.update(&d, ev.ts_echo, min_rtt, now);
            out.on_delivered(d, ev.ts_echo, sent_at_echo, now);
        }

        board.trim_head(new_una)?;
        self.filter.remove_until(new_una);
        self.fack = self.fack.max(new_una);
        out.advanced = true;
        Ok(())
    }

    /// Flag records beyond the receive window so they are not marked lost
    /// while the window is collapsed.
    fn check_window(&mut self, board: &mut Scoreboard, rwnd: u64, out: &mut AckOutcome) {
        let edge = board.snd_una().saturating_add(rwnd);
        if edge < board.snd_max() {
            for key in board.keys_overlapping(edge..board.snd_max()) {
                if let Some(seg) = board.get_mut(key) {
                    if seg.start >= edge && !seg.flags.contains(SegmentFlags::RwndCollapsed) {
                        seg.flags.insert(SegmentFlags::RwndCollapsed);
                        out.collapsed += 1;
                    }
                }
            }
            if !self.rwnd_collapsed {
                debug!(
                    "{} receive window collapsed at {} snd_max={}",
                    self.trace_id,
                    edge,
                    board.snd_max()
                );
            }
            self.rwnd_collapsed = true;
        } else if self.rwnd_collapsed {
            let keys: Vec<usize> = board.iter().map(|(k, _)| k).collect();
            for key in keys {
                if let Some(seg) = board.get_mut(key) {
                    seg.flags.remove(SegmentFlags::RwndCollapsed);
                }
            }
            self.rwnd_collapsed = false;
        }
    }

    /// Mark the records covered by `block` as SACKed, splitting the records
    /// straddling its edges.
    ///
    /// The splits needed are checked against the record limit before any
    /// mutation, a refused block leaves the scoreboard untouched.
    #[allow(clippy::too_many_arguments)]
    fn mark_block(
        &mut self,
        board: &mut Scoreboard,
        rec: &mut RecoveryState,
        rack: &mut RackState,
        ev: &AckEvent,
        block: &Range<u64>,
        min_rtt: Duration,
        now: Instant,
        out: &mut AckOutcome,
    ) -> Result<()> {
        let keys = board.keys_overlapping(block.clone());

        let straddles = |key: &usize, at: u64| {
            board
                .get(*key)
                .map_or(false, |s| !s.is_acked() && s.start < at && at < s.end)
        };
        let needed = keys.first().map_or(0, |k| straddles(k, block.start) as usize)
            + keys.last().map_or(0, |k| straddles(k, block.end) as usize);
        if needed > 0 && board.len() + needed > board.max_segments() {
            return Err(Error::ResourceExhausted);
        }

        for key in keys {
            let (start, end, acked) = match board.get(key) {
                Some(seg) => (seg.start, seg.end, seg.is_acked()),
                None => continue,
            };
            if acked {
                continue;
            }

            let mut key = key;
            if start < block.start {
                key = board.split(key, block.start)?;
                out.splits += 1;
            }
            if end > block.end {
                board.split(key, block.end)?;
                out.splits += 1;
            }

            let seg = board.get_mut(key).ok_or_else(|| {
                Error::StructuralViolation(format!("split record {} vanished", key))
            })?;
            let d = Delivered::from_segment(seg);
            let sent_at_echo = ev.ts_echo.map_or(false, |ts| seg.was_sent_at(ts));
            let len = seg.len();

            seg.flags.insert(SegmentFlags::Sacked);
            seg.ack_arrival = Some(now);
            if seg.holes_rxt {
                seg.holes_rxt = false;
                rec.holes_rxt_bytes = rec.holes_rxt_bytes.saturating_sub(len);
            }
            rec.sacked_bytes += len;
            out.newly_sacked += len;
            self.fack = self.fack.max(seg.end);
            trace!("now={:?} {} SACKED {:?}", now, self.trace_id, seg);

            board.tmap_remove(key);
            rack.update(&d, ev.ts_echo, min_rtt, now);
            out.on_delivered(d, ev.ts_echo, sent_at_echo, now);
        }

        out.merged += self.merge_around(board, block)?;
        Ok(())
    }

    /// Coalesce SACKed records around `block`.
    fn merge_around(&self, board: &mut Scoreboard, block: &Range<u64>) -> Result<u32> {
        let range = block.start.saturating_sub(1)..block.end.saturating_add(1);
        let keys = board.keys_overlapping(range);
        let mut merged = 0;
        let mut iter = keys.into_iter();
        let mut left = match iter.next() {
            Some(k) => k,
            None => return Ok(0),
        };
        for right in iter {
            match board.merge(left, right) {
                Ok(()) => merged += 1,
                Err(Error::Done) => left = right,
                Err(e) => return Err(e),
            }
        }
        Ok(merged)
    }

    /// Count one more duplicate ack on every unacked record below the
    /// highest SACKed sequence that was not sent again.
    fn count_dupacks(&self, board: &mut Scoreboard) {
        let keys = board.keys_overlapping(board.snd_una()..self.fack);
        for key in keys {
            if let Some(seg) = board.get_mut(key) {
                if !seg.is_acked() && !seg.holes_rxt && seg.start < self.fack {
                    seg.dupacks = seg.dupacks.saturating_add(1);
                    seg.flags.insert(SegmentFlags::WasSackpass);
                }
            }
        }
    }

    /// Count a duplicate cumulative ack on the record at `snd_una`.
    fn count_duplicate_cum_ack(&self, board: &mut Scoreboard) {
        let head = board.first();
        if let Some(seg) = head.and_then(|k| board.get_mut(k)) {
            if !seg.is_acked() && !seg.holes_rxt {
                seg.dupacks = seg.dupacks.saturating_add(1);
                trace!("{} dupack {} on {:?}", self.trace_id, seg.dupacks, seg.range());
            }
        }
    }

    fn apply_dsack(
        &self,
        board: &mut Scoreboard,
        rack: &mut RackState,
        dsack: &Range<u64>,
        now: Instant,
        out: &mut AckOutcome,
    ) {
        if dsack.start >= dsack.end || dsack.end > board.snd_max() {
            debug!("{} malformed dsack block {:?}", self.trace_id, dsack);
            out.malformed += 1;
            return;
        }

        out.dsack = true;
        let snd_una = board.snd_una();

        // Data below snd_una was delivered before, the duplicate can only
        // come from a retransmission.
        if dsack.start < snd_una {
            out.spurious_bytes += dsack.end.min(snd_una) - dsack.start;
        }
        if dsack.end > snd_una {
            for key in board.keys_overlapping(dsack.start.max(snd_una)..dsack.end) {
                if let Some(seg) = board.get_mut(key) {
                    seg.flags.insert(SegmentFlags::SentWithDsack);
                    if seg.rexmit_count > 0 {
                        let overlap =
                            seg.end.min(dsack.end) - seg.start.max(dsack.start);
                        out.spurious_bytes += overlap;
                    }
                }
            }
        }

        rack.on_dsack(snd_una, board.snd_max(), now);
        debug!(
            "{} DSACK {:?} spurious={} reo_wnd_mult={}",
            self.trace_id, dsack, out.spurious_bytes, rack.reo_wnd_mult
        );
    }
}
