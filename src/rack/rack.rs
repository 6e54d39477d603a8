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

//! The per-connection loss recovery engine.
//!
//! The engine does no I/O and reads no clock. The sender reports every
//! transmission with `on_packet_sent`, every ack with `on_ack` and every
//! timer firing with `on_timeout`, always passing the current time. Each
//! call returns the `Action`s the sender has to carry out, either directly
//! or through `dispatch`.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use enumflags2::BitFlags;
use log::*;
use serde::Serialize;

use crate::congestion_control::build_congestion_controller;
use crate::congestion_control::CongestionControl;
use crate::congestion_control::CongestionSignal;
use crate::congestion_control::HardwarePacing;
use crate::congestion_control::PacingController;
use crate::congestion_control::Phase;
use crate::metrics::Counter;
use crate::metrics::MetricsSink;
use crate::scoreboard::Scoreboard;
use crate::scoreboard::SegmentFlags;
use crate::Error;
use crate::RackConfig;
use crate::Result;

pub use goodput::GoodputSample;
pub use sack::AckEvent;
pub use scheduler::Action;
pub use scheduler::ActionSet;
pub use scheduler::SchedulerState;
pub use scheduler::SendKind;
pub use timer::Timer;

use goodput::GoodputEstimator;
use probe_rtt::ProbeRtt;
use probe_rtt::ProbeRttEvent;
use prr::RecoveryState;
use rtt::RttEstimator;
use sack::AckOutcome;
use sack::RackState;
use sack::SackProcessor;
use scheduler::Cursor;
use scheduler::Scheduler;

/// The primitive putting a range on the wire.
pub trait Transmitter {
    /// Send `range` and return the number of bytes actually sent from its
    /// start.
    fn transmit(&mut self, range: Range<u64>, flags: BitFlags<SegmentFlags>) -> Result<u64>;
}

/// The primitive arming the connection's timer.
pub trait TimerScheduler {
    /// Arm `timer` to fire after `duration`. The firing must be reported
    /// with the given generation.
    fn arm_timer(&mut self, timer: Timer, duration: Duration, generation: u64);

    /// Cancel any armed timer.
    fn cancel_timer(&mut self);
}

/// Per-connection statistics.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EngineStats {
    /// Number of acks processed.
    pub acks: u64,

    /// Bytes sent, including retransmissions.
    pub sent_bytes: u64,

    /// Bytes retransmitted.
    pub retransmitted_bytes: u64,

    /// Bytes delivered, cumulatively acked or SACKed.
    pub delivered_bytes: u64,

    /// Bytes newly SACKed.
    pub sacked_bytes: u64,

    /// Retransmitted bytes reported as received twice.
    pub spurious_retransmitted_bytes: u64,

    /// Fast recovery episodes.
    pub recovery_episodes: u64,

    /// Tail loss probes sent.
    pub tlp_probes: u64,

    /// Retransmission timeouts.
    pub rto_count: u64,

    /// Retransmission timeouts undone as spurious.
    pub spurious_rto: u64,

    /// Reordering events.
    pub reorder_events: u64,

    /// D-SACK blocks received.
    pub dsack_blocks: u64,

    /// Malformed SACK blocks ignored.
    pub malformed_sack_blocks: u64,

    /// Splits refused at the record limit.
    pub splits_refused: u64,

    /// Actions dropped because their target vanished.
    pub stale_actions: u64,

    /// Timer firings discarded as stale.
    pub stale_timers: u64,

    /// Probe-RTT phases.
    pub probe_rtt_count: u64,

    /// Closed goodput windows.
    pub goodput_samples: u64,
}

/// Observable state of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub snd_una: u64,
    pub snd_max: u64,
    pub sacked_bytes: u64,
    pub holes_retransmitted_bytes: u64,
    pub pipe: u64,
    pub min_rtt: Duration,
    pub smoothed_rtt: Duration,
    pub phase: Phase,
    pub state: SchedulerState,
    pub pacing_rate: u64,
    pub congestion_window: u64,
    pub slow_start_threshold: u64,
    pub segments: usize,
    pub rto_backoff: u32,
    pub aborted: bool,
}

/// RACK loss recovery and pacing engine of one connection.
pub struct Rack {
    /// Configuration.
    conf: RackConfig,

    /// Outstanding data.
    board: Scoreboard,

    /// Ack processing.
    sack: SackProcessor,

    /// Byte accounting and PRR.
    rec: RecoveryState,

    /// RACK time-based loss detection.
    rack: RackState,

    /// RTT estimation.
    rtt: RttEstimator,

    /// Goodput estimation.
    goodput: GoodputEstimator,

    /// Probe-RTT.
    probe_rtt: ProbeRtt,

    /// Pacing.
    pacing: PacingController,

    /// Congestion control law.
    cc: Box<dyn CongestionControl>,

    /// Retransmission scheduling and timers.
    sched: Scheduler,

    /// Latest receive window.
    rwnd: u64,

    /// Total bytes delivered.
    delivered: u64,

    /// Whether the goodput measurement count saturation was reported.
    goodput_saturated: bool,

    /// Statistics.
    stats: EngineStats,

    /// Shared counters.
    metrics: Arc<dyn MetricsSink>,

    /// Whether a structural violation stopped the engine.
    aborted: bool,

    /// Trace id.
    trace_id: String,
}

impl Rack {
    /// Create an engine using the congestion control law of the
    /// configuration. `snd_una` is the first sequence number to be sent.
    pub fn new(
        conf: RackConfig,
        metrics: Arc<dyn MetricsSink>,
        snd_una: u64,
        now: Instant,
    ) -> Result<Self> {
        let cc = build_congestion_controller(&conf);
        Rack::with_congestion_control(conf, cc, metrics, snd_una, now)
    }

    /// Create an engine with the given congestion control law.
    pub fn with_congestion_control(
        conf: RackConfig,
        cc: Box<dyn CongestionControl>,
        metrics: Arc<dyn MetricsSink>,
        snd_una: u64,
        now: Instant,
    ) -> Result<Self> {
        conf.validate()?;

        let min_bytes = conf.goodput_min_segments.saturating_mul(conf.mss);
        let floor = conf.probe_rtt_floor_segments.saturating_mul(conf.mss);
        Ok(Rack {
            board: Scoreboard::new(snd_una, conf.max_segments),
            sack: SackProcessor::new(snd_una, conf.sack_filter_ranges),
            rec: RecoveryState::default(),
            rack: RackState::default(),
            rtt: RttEstimator::new(&conf, now),
            goodput: GoodputEstimator::new(min_bytes, conf.goodput_rtt_decay),
            probe_rtt: ProbeRtt::new(conf.probe_rtt_interval, conf.probe_rtt_duration, floor),
            pacing: PacingController::new(&conf, now),
            cc,
            sched: Scheduler::default(),
            rwnd: u64::MAX,
            delivered: 0,
            goodput_saturated: false,
            stats: EngineStats::default(),
            metrics,
            aborted: false,
            trace_id: String::new(),
            conf,
        })
    }

    /// Set trace id.
    pub fn set_trace_id(&mut self, trace_id: &str) {
        self.trace_id = trace_id.to_string();
        self.board.set_trace_id(trace_id);
        self.sack.set_trace_id(trace_id);
        self.pacing.set_trace_id(trace_id);
    }

    /// Engage a hardware pacer.
    pub fn set_hardware_pacing(&mut self, hardware: Box<dyn HardwarePacing>) {
        self.pacing.set_hardware(hardware);
    }

    /// Pace at a fixed rate, or go back to the measured rate with None.
    pub fn set_fixed_pacing_rate(&mut self, rate: Option<u64>) {
        self.pacing.set_fixed_rate(rate);
    }

    /// Outstanding data.
    pub fn scoreboard(&self) -> &Scoreboard {
        &self.board
    }

    /// Loss recovery state.
    pub fn state(&self) -> SchedulerState {
        self.sched.state
    }

    /// Current congestion phase.
    pub fn phase(&self) -> Phase {
        match self.sched.state {
            SchedulerState::Recovering | SchedulerState::RtoPending => Phase::Recovery,
            _ if self.probe_rtt.active() => Phase::ProbeRtt,
            _ if self.cc.in_slow_start() => Phase::SlowStart,
            _ => Phase::CongestionAvoidance,
        }
    }

    /// Estimated bytes in flight.
    ///
    /// After a retransmission timeout everything sent before it is presumed
    /// lost, only what was sent since counts.
    pub fn pipe(&self) -> u64 {
        let snd_una = self.board.snd_una();
        let snd_max = self.board.snd_max();
        match self.sched.state {
            SchedulerState::RtoPending => self
                .rec
                .holes_rxt_bytes
                .saturating_add(snd_max.saturating_sub(self.sched.rto_point.max(snd_una))),
            _ => self.rec.pipe(snd_una, snd_max),
        }
    }

    /// Congestion window in bytes.
    pub fn congestion_window(&self) -> u64 {
        self.cc.congestion_window()
    }

    /// Slow start threshold in bytes.
    pub fn slow_start_threshold(&self) -> u64 {
        self.cc.slow_start_threshold()
    }

    /// Smoothed RTT.
    pub fn smoothed_rtt(&self) -> Duration {
        self.rtt.smoothed_rtt()
    }

    /// Windowed minimum RTT.
    pub fn min_rtt(&self) -> Duration {
        self.rtt.min_rtt()
    }

    /// Consecutive retransmission timeouts.
    pub fn rto_backoff(&self) -> u32 {
        self.sched.backoff
    }

    /// Retransmission timeout for the current backoff.
    pub fn rto(&self) -> Duration {
        self.rtt.rto_with_backoff(self.sched.backoff)
    }

    /// Earliest armed timer expiration.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.sched.timers.next_timeout()
    }

    /// Whether the engine stopped after a structural violation.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Statistics.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Current pacing rate in bytes per second.
    pub fn pacing_rate(&self) -> u64 {
        self.pacing.rate()
    }

    /// Highest goodput measured recently, in bytes per second.
    pub fn goodput(&self) -> Option<u64> {
        self.goodput.bandwidth()
    }

    /// Observable state of the engine.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            snd_una: self.board.snd_una(),
            snd_max: self.board.snd_max(),
            sacked_bytes: self.rec.sacked_bytes,
            holes_retransmitted_bytes: self.rec.holes_rxt_bytes,
            pipe: self.pipe(),
            min_rtt: self.rtt.min_rtt(),
            smoothed_rtt: self.rtt.smoothed_rtt(),
            phase: self.phase(),
            state: self.sched.state,
            pacing_rate: self.pacing.rate(),
            congestion_window: self.cc.congestion_window(),
            slow_start_threshold: self.cc.slow_start_threshold(),
            segments: self.board.len(),
            rto_backoff: self.sched.backoff,
            aborted: self.aborted,
        }
    }

    /// Bytes of new data or retransmission the sender may put in flight now.
    pub fn send_quota(&self) -> u64 {
        if self.aborted {
            return 0;
        }

        let pipe = self.pipe();
        let mut quota = match self.sched.state {
            SchedulerState::Recovering => {
                self.rec
                    .sndcnt(pipe, self.cc.slow_start_threshold(), self.conf.mss)
            }
            _ => self.cc.congestion_window().saturating_sub(pipe),
        };
        if self.probe_rtt.active() {
            quota = quota.min(self.probe_rtt.floor().saturating_sub(pipe));
        }

        let wnd_edge = self.board.snd_una().saturating_add(self.rwnd);
        quota.min(wnd_edge.saturating_sub(self.board.snd_max()))
    }

    /// Time a burst of `bytes` may be sent by the pacer, None if now.
    pub fn next_send_time(&mut self, bytes: u64, now: Instant) -> Option<Instant> {
        let srtt = self.rtt.smoothed_rtt();
        let cwnd = self.cc.congestion_window();
        self.pacing.schedule(bytes, srtt, cwnd, now)
    }

    /// Verify the scoreboard and its byte accounting.
    pub fn check_invariants(&self) -> Result<()> {
        self.board.check_invariants()?;

        let (sacked, holes) = self.board.iter().fold((0, 0), |(s, h), (_, seg)| {
            (
                s + if seg.is_sacked() { seg.len() } else { 0 },
                h + if seg.holes_rxt { seg.len() } else { 0 },
            )
        });
        if sacked != self.rec.sacked_bytes || sacked > self.board.outstanding() {
            return Err(Error::StructuralViolation(format!(
                "sacked bytes {} but records hold {} of {}",
                self.rec.sacked_bytes,
                sacked,
                self.board.outstanding()
            )));
        }
        if holes != self.rec.holes_rxt_bytes {
            return Err(Error::StructuralViolation(format!(
                "retransmitted hole bytes {} but records hold {}",
                self.rec.holes_rxt_bytes, holes
            )));
        }
        Ok(())
    }

    /// Record a transmission of `range`.
    ///
    /// The part below `snd_max` is a retransmission, the rest is new data
    /// and must start exactly at `snd_max`.
    pub fn on_packet_sent(
        &mut self,
        range: Range<u64>,
        flags: BitFlags<SegmentFlags>,
        now: Instant,
    ) -> Result<ActionSet> {
        self.guard()?;
        let r = self.process_sent(range, flags, now);
        self.finish(r)
    }

    /// Process an ack.
    pub fn on_ack(&mut self, ev: &AckEvent, now: Instant) -> Result<ActionSet> {
        self.guard()?;
        let r = self.process_ack(ev, now);
        self.finish(r)
    }

    /// Process the firing of a timer armed with `generation`.
    ///
    /// `app_has_data` tells whether new data is available for a tail loss
    /// probe.
    pub fn on_timeout(
        &mut self,
        timer: Timer,
        generation: u64,
        app_has_data: bool,
        now: Instant,
    ) -> Result<ActionSet> {
        self.guard()?;

        if !self.sched.timers.is_current(timer, generation) {
            trace!(
                "{} stale {:?} timer generation {} current {}",
                self.trace_id,
                timer,
                generation,
                self.sched.timers.generation()
            );
            self.stats.stale_timers += 1;
            self.metrics.add(Counter::StaleTimers, 1);
            return Ok(ActionSet::new());
        }
        self.sched.timers.stop(timer);

        let r = match timer {
            Timer::Tlp => self.on_tlp_timeout(app_has_data, now),
            Timer::Rto => self.on_rto_timeout(now),
        };
        self.finish(r)
    }

    /// Carry out `actions` through the given primitives.
    ///
    /// Sends whose data was acked meanwhile are dropped. Returns the number
    /// of bytes sent.
    pub fn dispatch(
        &mut self,
        actions: &ActionSet,
        tx: &mut dyn Transmitter,
        timers: &mut dyn TimerScheduler,
        now: Instant,
    ) -> Result<u64> {
        self.guard()?;
        let r = self.dispatch_actions(actions, tx, timers, now);
        self.finish(r)
    }

    fn dispatch_actions(
        &mut self,
        actions: &ActionSet,
        tx: &mut dyn Transmitter,
        timers: &mut dyn TimerScheduler,
        now: Instant,
    ) -> Result<u64> {
        let mut total = 0;
        for action in actions {
            let (range, kind) = match action {
                Action::Send { range, kind, .. } => (range, *kind),
                _ => {
                    self.apply_timer(action, timers);
                    continue;
                }
            };

            if kind != SendKind::NewDataProbe && !self.has_unacked(range) {
                self.note_stale(range);
                continue;
            }
            let flags = match kind {
                SendKind::Retransmit => BitFlags::empty(),
                SendKind::TailProbe | SendKind::NewDataProbe => BitFlags::from(SegmentFlags::Tlp),
            };

            let sent = match tx.transmit(range.clone(), flags) {
                Ok(sent) => sent.min(range.end - range.start),
                Err(Error::TransmitFailed(e)) => return Err(Error::TransmitFailed(e)),
                Err(e) => return Err(Error::TransmitFailed(format!("{:?}", e))),
            };
            if sent == 0 {
                continue;
            }

            let follow = self.process_sent(range.start..range.start + sent, flags, now)?;
            for a in &follow {
                self.apply_timer(a, timers);
            }
            total += sent;
        }
        Ok(total)
    }

    /// Hand a timer action to the sender, unless a later one replaced it.
    fn apply_timer(&self, action: &Action, timers: &mut dyn TimerScheduler) {
        match action {
            Action::ArmRto {
                duration,
                generation,
            } if self.sched.timers.is_current(Timer::Rto, *generation) => {
                timers.arm_timer(Timer::Rto, *duration, *generation)
            }
            Action::ArmTlp {
                duration,
                generation,
            } if self.sched.timers.is_current(Timer::Tlp, *generation) => {
                timers.arm_timer(Timer::Tlp, *duration, *generation)
            }
            Action::CancelTimer if self.sched.timers.next_timeout().is_none() => {
                timers.cancel_timer()
            }
            _ => (),
        }
    }

    fn guard(&self) -> Result<()> {
        if self.aborted {
            return Err(Error::EngineAborted);
        }
        Ok(())
    }

    /// Count the error and stop the engine on a structural violation.
    fn finish<T>(&mut self, r: Result<T>) -> Result<T> {
        if let Err(e) = &r {
            if let Some(counter) = e.counter() {
                self.metrics.add(counter, 1);
            }
            if let Error::MalformedInput(_) = e {
                self.stats.malformed_sack_blocks += 1;
            }
            if e.is_fatal() {
                error!("{} engine aborted: {:?}", self.trace_id, e);
                self.aborted = true;
                self.sched.timers.stop_all();
            }
        }
        r
    }

    fn note_stale(&mut self, range: &Range<u64>) {
        trace!(
            "{} stale action {:?} snd_una={}",
            self.trace_id,
            range,
            self.board.snd_una()
        );
        self.stats.stale_actions += 1;
        self.metrics.add(Counter::StaleActions, 1);
    }

    fn count(&self, counter: Counter, n: u64) {
        if n > 0 {
            self.metrics.add(counter, n);
        }
    }

    fn has_unacked(&self, range: &Range<u64>) -> bool {
        let range = range.start.max(self.board.snd_una())..range.end;
        self.board
            .keys_overlapping(range)
            .into_iter()
            .any(|k| self.board.get(k).map_or(false, |s| !s.is_acked()))
    }

    fn check_debug_invariants(&self) -> Result<()> {
        if cfg!(debug_assertions) {
            self.check_invariants()?;
        }
        Ok(())
    }

    fn process_sent(
        &mut self,
        range: Range<u64>,
        flags: BitFlags<SegmentFlags>,
        now: Instant,
    ) -> Result<ActionSet> {
        if range.start >= range.end {
            return Err(Error::MalformedInput(format!("empty send {:?}", range)));
        }

        let snd_max = self.board.snd_max();
        let mut sent = 0;
        if range.start < snd_max {
            sent += self.on_retransmitted(range.start..range.end.min(snd_max), flags, now)?;
        }
        if range.end > snd_max {
            let new = range.start.max(snd_max)..range.end;
            let app_limited_seq = if flags.contains(SegmentFlags::AppLimited) {
                new.end
            } else {
                0
            };
            self.board
                .insert_on_send(new.clone(), flags, now, app_limited_seq)?;
            if self.sched.state == SchedulerState::TlpPending && flags.contains(SegmentFlags::Tlp)
            {
                self.sched.tlp_end = Some(new.end);
            }
            sent += new.end - new.start;
        }

        let mut actions = ActionSet::new();
        if sent > 0 {
            self.rec.on_sent(sent);
            self.pacing.on_sent(sent);
            self.stats.sent_bytes = self.stats.sent_bytes.saturating_add(sent);

            let tlp = self.sched.state == SchedulerState::Open && self.conf.tlp_enabled;
            if tlp || self.sched.timers.get(Timer::Rto).is_none() {
                actions.push(self.rearm(now));
            }
        }

        self.check_debug_invariants()?;
        Ok(actions)
    }

    /// Account a retransmission of `range`, returning the bytes counted.
    fn on_retransmitted(
        &mut self,
        range: Range<u64>,
        flags: BitFlags<SegmentFlags>,
        now: Instant,
    ) -> Result<u64> {
        let range = range.start.max(self.board.snd_una())..range.end;
        if range.is_empty() {
            self.note_stale(&range);
            return Ok(0);
        }

        let keys = self.board.keys_overlapping(range.clone());
        let straddles = |board: &Scoreboard, key: Option<&usize>, at: u64| {
            key.and_then(|k| board.get(*k))
                .map_or(0, |s| (!s.is_acked() && s.start < at && at < s.end) as usize)
        };
        let needed = straddles(&self.board, keys.first(), range.start)
            + straddles(&self.board, keys.last(), range.end);
        let can_split = self.board.len() + needed <= self.board.max_segments();
        if !can_split {
            debug!(
                "{} retransmission {:?} accounted on whole records, {} records",
                self.trace_id,
                range,
                self.board.len()
            );
            self.stats.splits_refused += 1;
            self.metrics.add(Counter::SplitsRefused, 1);
        }

        let in_rto = self.sched.state == SchedulerState::RtoPending;
        let mut total = 0;
        for key in keys {
            let (start, end, acked) = match self.board.get(key) {
                Some(seg) => (seg.start, seg.end, seg.is_acked()),
                None => continue,
            };
            if acked {
                continue;
            }

            let mut key = key;
            if can_split {
                if start < range.start {
                    key = self.board.split(key, range.start)?;
                    self.metrics.add(Counter::SegmentsSplit, 1);
                }
                if end > range.end {
                    self.board.split(key, range.end)?;
                    self.metrics.add(Counter::SegmentsSplit, 1);
                }
            }

            let seg = self.board.get_mut(key).ok_or_else(|| {
                Error::StructuralViolation(format!("retransmitted record {} vanished", key))
            })?;
            seg.record_retransmission(now);
            seg.dupacks = 0;
            if flags.contains(SegmentFlags::Tlp) {
                seg.flags.insert(SegmentFlags::Tlp);
            } else {
                seg.flags.remove(SegmentFlags::Tlp);
            }
            if in_rto {
                seg.flags.insert(SegmentFlags::ToRext);
            }
            let len = seg.len();
            if !seg.holes_rxt {
                seg.holes_rxt = true;
                self.rec.holes_rxt_bytes += len;
            }
            trace!("now={:?} {} REXMIT {:?}", now, self.trace_id, seg);

            self.board.tmap_push_newest(key);
            total += len;
        }

        if total == 0 {
            self.note_stale(&range);
        } else {
            self.stats.retransmitted_bytes = self.stats.retransmitted_bytes.saturating_add(total);
            self.metrics.add(Counter::RetransmittedBytes, total);
        }
        Ok(total)
    }

    fn process_ack(&mut self, ev: &AckEvent, now: Instant) -> Result<ActionSet> {
        let prior_state = self.sched.state;
        let min_rtt = if self.rtt.has_sample() {
            self.rtt.min_rtt()
        } else {
            Duration::ZERO
        };

        let out = self.sack.process(
            &mut self.board,
            &mut self.rec,
            &mut self.rack,
            ev,
            min_rtt,
            now,
        )?;
        self.rwnd = ev.rwnd;
        self.stats.acks += 1;
        self.note_outcome(&out);

        let delivered = out.delivered();
        self.delivered = self.delivered.saturating_add(delivered);

        if let Some(sample) = out.rtt_sample {
            match self.rtt.update(sample, now) {
                Ok(()) if self.sched.state != SchedulerState::RtoPending => self.sched.backoff = 0,
                Ok(()) => (),
                Err(e) => {
                    debug!("{} rtt sample {:?} discarded", self.trace_id, sample);
                    if let Some(counter) = e.counter() {
                        self.metrics.add(counter, 1);
                    }
                }
            }
        }

        if out.reordering {
            self.rack.on_reordering(now);
            self.stats.reorder_events += 1;
            self.metrics.add(Counter::ReorderEvents, 1);
        }
        self.rack.fade(self.conf.reorder_fade, now);

        if self.sched.state == SchedulerState::RtoPending && out.advanced {
            self.on_ack_after_rto(ev, &out, now);
        }

        if self.sched.state == SchedulerState::TlpPending {
            let probe_covered = self
                .sched
                .tlp_end
                .map_or(false, |end| self.board.snd_una() >= end);
            if out.probe_acked || probe_covered {
                debug!("{} TLP acked snd_una={}", self.trace_id, self.board.snd_una());
                self.sched.state = SchedulerState::Open;
                self.sched.tlp_end = None;
            }
        }

        if self.sched.state == SchedulerState::Recovering
            && self.board.snd_una() >= self.rec.recovery_point
        {
            self.exit_recovery(now);
        }

        let lost = match self.sched.state {
            SchedulerState::RtoPending => Vec::new(),
            _ => {
                let reo_wnd = self.rack.reo_wnd(
                    self.rtt.min_rtt(),
                    self.rtt.smoothed_rtt(),
                    self.conf.reorder_shift,
                );
                self.rack
                    .detect_lost(&self.board, reo_wnd, self.conf.dupack_thresh, now)
            }
        };
        if !lost.is_empty()
            && matches!(
                self.sched.state,
                SchedulerState::Open | SchedulerState::TlpPending
            )
        {
            self.enter_recovery(now);
        }
        // A duplicate ack stands for one segment leaving the network.
        let prr_delivered = if out.duplicate && delivered == 0 {
            self.conf.mss.min(self.board.outstanding())
        } else {
            delivered
        };
        self.rec.on_delivered(prr_delivered);
        if delivered > 0 && self.sched.state == SchedulerState::Open {
            self.cc.on_ack(delivered, now);
        }

        let mut actions = ActionSet::new();
        match self.sched.state {
            SchedulerState::Recovering => {
                let budget = self.rec.sndcnt(
                    self.pipe(),
                    self.cc.slow_start_threshold(),
                    self.conf.mss,
                );
                scheduler::plan_retransmissions(
                    &self.board,
                    &lost,
                    budget,
                    self.conf.mss,
                    &mut actions,
                );
            }
            SchedulerState::RtoPending => self.plan_go_back_n(&mut actions),
            _ => (),
        }

        self.check_probe_rtt(now);
        self.update_goodput(delivered, out.app_limited, now);
        self.update_pacing_rate();

        if self.board.outstanding() == 0 {
            if let Some(cancel) = self.sched.cancel() {
                actions.push(cancel);
            }
        } else if delivered > 0
            || self.sched.state != prior_state
            || self.sched.timers.next_timeout().is_none()
        {
            actions.push(self.rearm(now));
        }

        trace!(
            "now={:?} {} ACK cum={} delivered={} pipe={} state={:?} actions={}",
            now,
            self.trace_id,
            ev.cum_ack,
            delivered,
            self.pipe(),
            self.sched.state,
            actions.len()
        );
        self.check_debug_invariants()?;
        Ok(actions)
    }

    fn note_outcome(&mut self, out: &AckOutcome) {
        self.stats.delivered_bytes = self.stats.delivered_bytes.saturating_add(out.delivered());
        self.stats.sacked_bytes = self.stats.sacked_bytes.saturating_add(out.newly_sacked);
        self.stats.malformed_sack_blocks += out.malformed as u64;
        self.stats.splits_refused += out.refused as u64;
        self.stats.spurious_retransmitted_bytes = self
            .stats
            .spurious_retransmitted_bytes
            .saturating_add(out.spurious_bytes);

        self.count(Counter::MalformedSackBlocks, out.malformed as u64);
        self.count(Counter::SackBlocksFiltered, out.filtered as u64);
        self.count(Counter::SplitsRefused, out.refused as u64);
        self.count(Counter::SegmentsSplit, out.splits as u64);
        self.count(Counter::SegmentsMerged, out.merged as u64);
        if out.dsack {
            self.stats.dsack_blocks += 1;
            self.metrics.add(Counter::DsackBlocks, 1);
        }
    }

    fn enter_recovery(&mut self, now: Instant) {
        let pipe = self.pipe();
        self.cc
            .on_congestion_signal(CongestionSignal::FastRecovery, pipe, now);
        self.rec
            .enter(self.board.outstanding(), self.board.snd_max());
        self.clear_holes_rxt();
        self.sched.state = SchedulerState::Recovering;
        self.sched.tlp_end = None;

        self.stats.recovery_episodes += 1;
        self.metrics.add(Counter::RecoveryEpisodes, 1);
        debug!(
            "{} RECOVERY enter snd_una={} recovery_point={} pipe={} ssthresh={}",
            self.trace_id,
            self.board.snd_una(),
            self.rec.recovery_point,
            pipe,
            self.cc.slow_start_threshold()
        );
    }

    /// Forget which holes were sent again, a new episode counts afresh.
    fn clear_holes_rxt(&mut self) {
        let keys: Vec<usize> = self.board.iter().map(|(k, _)| k).collect();
        for key in keys {
            if let Some(seg) = self.board.get_mut(key) {
                seg.holes_rxt = false;
            }
        }
        self.rec.holes_rxt_bytes = 0;
    }

    fn exit_recovery(&mut self, now: Instant) {
        let pipe = self.pipe();
        self.cc
            .on_congestion_signal(CongestionSignal::RecoveryExit, pipe, now);
        self.rec.exit();
        self.sched.state = SchedulerState::Open;
        debug!(
            "{} RECOVERY exit snd_una={} cwnd={}",
            self.trace_id,
            self.board.snd_una(),
            self.cc.congestion_window()
        );
    }

    /// Handle the first acks advancing `snd_una` after a timeout.
    fn on_ack_after_rto(&mut self, ev: &AckEvent, out: &AckOutcome, now: Instant) {
        if self.sched.undo.is_some() {
            if self.rto_was_spurious(ev, out, now) {
                self.undo_rto();
                return;
            }
            self.sched.undo = None;
        }

        if self.board.snd_una() >= self.sched.rto_point {
            debug!(
                "{} RTO recovered snd_una={}",
                self.trace_id,
                self.board.snd_una()
            );
            self.leave_rto();
        }
    }

    /// Whether the ack was triggered by data sent before the timeout.
    fn rto_was_spurious(&self, ev: &AckEvent, out: &AckOutcome, now: Instant) -> bool {
        let fired = match self.sched.rto_fired_at {
            Some(t) => t,
            None => return false,
        };
        if let Some(ts) = ev.ts_echo {
            return ts < fired;
        }
        match out.newest {
            Some(d) if d.rexmit_count > 0 && d.last_sent >= fired => {
                now.saturating_duration_since(d.last_sent) < self.rtt.min_rtt() / 2
            }
            _ => false,
        }
    }

    fn undo_rto(&mut self) {
        if let Some((cwnd, ssthresh)) = self.sched.undo.take() {
            self.cc.set_slow_start_threshold(ssthresh);
            self.cc.set_congestion_window(cwnd);
        }
        self.leave_rto();

        self.stats.spurious_rto += 1;
        self.metrics.add(Counter::SpuriousRto, 1);
        debug!(
            "{} spurious RTO undone cwnd={} ssthresh={}",
            self.trace_id,
            self.cc.congestion_window(),
            self.cc.slow_start_threshold()
        );
    }

    fn leave_rto(&mut self) {
        self.sched.state = SchedulerState::Open;
        self.sched.backoff = 0;
        self.sched.rto_fired_at = None;
        self.sched.cursor = None;
        self.sched.undo = None;

        let keys: Vec<usize> = self.board.iter().map(|(k, _)| k).collect();
        for key in keys {
            if let Some(seg) = self.board.get_mut(key) {
                seg.flags.remove(SegmentFlags::ToRext);
            }
        }
    }

    /// Resend the flight sent before the timeout, within the window.
    fn plan_go_back_n(&mut self, actions: &mut ActionSet) {
        let fired = match self.sched.rto_fired_at {
            Some(t) => t,
            None => return,
        };
        let from = self.sched.resume_point(&self.board);
        let keys = scheduler::go_back_n(&self.board, from, self.sched.rto_point, fired);
        self.sched.cursor = keys.first().and_then(|&k| {
            self.board.get(k).map(|s| Cursor {
                key: k,
                start: s.start,
            })
        });

        let budget = self
            .cc
            .congestion_window()
            .saturating_sub(self.pipe());
        scheduler::plan_retransmissions(&self.board, &keys, budget, self.conf.mss, actions);
    }

    fn on_tlp_timeout(&mut self, app_has_data: bool, now: Instant) -> Result<ActionSet> {
        let mut actions = ActionSet::new();
        if self.board.outstanding() == 0 {
            return Ok(actions);
        }

        let mss = self.conf.mss;
        let snd_max = self.board.snd_max();
        let wnd_edge = self.board.snd_una().saturating_add(self.rwnd);
        let probe = if app_has_data && snd_max + mss <= wnd_edge {
            Some((snd_max..snd_max + mss, SendKind::NewDataProbe))
        } else {
            scheduler::tail_probe(&self.board, mss).map(|r| (r, SendKind::TailProbe))
        };

        if let Some((range, kind)) = probe {
            debug!(
                "{} TLP {:?} {:?} pipe={}",
                self.trace_id,
                kind,
                range,
                self.pipe()
            );
            self.sched.state = SchedulerState::TlpPending;
            self.sched.tlp_end = Some(range.end);
            self.stats.tlp_probes += 1;
            self.metrics.add(Counter::TlpProbes, 1);
            actions.push(Action::Send {
                segments: scheduler::segments(range.end - range.start, mss),
                range,
                kind,
            });
        }

        let rto = self.rtt.rto_with_backoff(self.sched.backoff);
        actions.push(self.sched.arm(Timer::Rto, rto, now));
        Ok(actions)
    }

    fn on_rto_timeout(&mut self, now: Instant) -> Result<ActionSet> {
        let mut actions = ActionSet::new();
        if self.board.outstanding() == 0 {
            return Ok(actions);
        }

        if self.sched.state != SchedulerState::RtoPending {
            self.sched.undo = Some((
                self.cc.congestion_window(),
                self.cc.slow_start_threshold(),
            ));
        }
        let pipe = self.pipe();
        self.sched.backoff = self.sched.backoff.saturating_add(1);
        self.cc
            .on_congestion_signal(CongestionSignal::RetransmissionTimeout, pipe, now);
        if self.rec.in_recovery() {
            self.rec.exit();
        }
        self.probe_rtt.cancel();

        // Everything outstanding is presumed lost.
        self.clear_holes_rxt();
        let keys: Vec<usize> = self.board.iter().map(|(k, _)| k).collect();
        for key in keys {
            if let Some(seg) = self.board.get_mut(key) {
                if !seg.is_acked() {
                    seg.flags.insert(SegmentFlags::ToRext);
                }
            }
        }

        self.sched.state = SchedulerState::RtoPending;
        self.sched.rto_point = self.board.snd_max();
        self.sched.rto_fired_at = Some(now);
        self.sched.tlp_end = None;
        self.sched.cursor = None;

        self.stats.rto_count += 1;
        self.metrics.add(Counter::RtoFired, 1);
        debug!(
            "{} RTO fired backoff={} snd_una={} snd_max={} cwnd={}",
            self.trace_id,
            self.sched.backoff,
            self.board.snd_una(),
            self.board.snd_max(),
            self.cc.congestion_window()
        );

        if let Some(key) = scheduler::lowest_unacked(&self.board) {
            if let Some(seg) = self.board.get(key) {
                self.sched.cursor = Some(Cursor {
                    key,
                    start: seg.start,
                });
            }
            let budget = self.cc.congestion_window().max(self.conf.mss);
            scheduler::plan_retransmissions(&self.board, &[key], budget, self.conf.mss, &mut actions);
        }

        let rto = self.rtt.rto_with_backoff(self.sched.backoff);
        actions.push(self.sched.arm(Timer::Rto, rto, now));
        Ok(actions)
    }

    /// Arm the timer the current state calls for.
    fn rearm(&mut self, now: Instant) -> Action {
        if self.sched.state == SchedulerState::Open && self.conf.tlp_enabled {
            let pto = self.pto();
            self.sched.arm(Timer::Tlp, pto, now)
        } else {
            let rto = self.rtt.rto_with_backoff(self.sched.backoff);
            self.sched.arm(Timer::Rto, rto, now)
        }
    }

    /// Probe timeout, see RFC 8985 Section 7.2.
    fn pto(&self) -> Duration {
        let mut pto = (self.rtt.smoothed_rtt() * 2).max(self.conf.tlp_min);
        if self.board.outstanding() <= self.conf.mss {
            pto += self.conf.delayed_ack_time;
        }
        pto.min(self.rtt.rto_with_backoff(self.sched.backoff))
    }

    fn check_probe_rtt(&mut self, now: Instant) {
        if self.sched.state != SchedulerState::Open && !self.probe_rtt.active() {
            return;
        }

        let phase = self.phase();
        let pipe = self.pipe();
        match self
            .probe_rtt
            .check(self.rtt.min_rtt_stamp(), phase, pipe, now)
        {
            ProbeRttEvent::Enter => {
                self.stats.probe_rtt_count += 1;
                self.metrics.add(Counter::ProbeRttEntered, 1);
                debug!(
                    "{} PROBE_RTT enter min_rtt={:?} pipe={}",
                    self.trace_id,
                    self.rtt.min_rtt(),
                    pipe
                );
            }
            ProbeRttEvent::Exit(prior) => {
                self.rtt.refresh_min_rtt_stamp(now);
                debug!(
                    "{} PROBE_RTT exit to {:?} min_rtt={:?}",
                    self.trace_id,
                    prior,
                    self.rtt.min_rtt()
                );
            }
            ProbeRttEvent::None => (),
        }
    }

    fn update_goodput(&mut self, delivered: u64, app_limited: bool, now: Instant) {
        if delivered == 0 {
            return;
        }

        let phase = self.phase();
        let srtt = self.rtt.smoothed_rtt();
        if let Some(sample) =
            self.goodput
                .on_delivered(self.delivered, app_limited, srtt, phase, now)
        {
            self.stats.goodput_samples += 1;
            trace!(
                "{} GOODPUT {} B/s phase={:?}",
                self.trace_id,
                sample.bandwidth,
                sample.phase
            );
            if sample.saturated && !self.goodput_saturated {
                self.goodput_saturated = true;
                self.metrics.add(Counter::CounterSaturations, 1);
            }
        }
    }

    fn update_pacing_rate(&mut self) {
        let bandwidth = self.goodput.bandwidth().unwrap_or_else(|| {
            let srtt = self.rtt.smoothed_rtt().as_nanos().max(1);
            (self.cc.congestion_window() as u128 * 1_000_000_000 / srtt) as u64
        });
        let phase = self.phase();
        self.pacing
            .update(phase, bandwidth, self.metrics.as_ref());
    }
}

impl std::fmt::Debug for Rack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "snd_una={}", self.board.snd_una())?;
        write!(f, " snd_max={}", self.board.snd_max())?;
        write!(f, " pipe={}", self.pipe())?;
        write!(f, " state={:?}", self.sched.state)?;
        write!(f, " cwnd={}", self.cc.congestion_window())?;
        write!(f, " pacing={:?}", self.pacing)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AggregateMetrics;

    const MSS: u64 = 1000;

    fn conf() -> RackConfig {
        RackConfig {
            mss: MSS,
            ..RackConfig::default()
        }
    }

    fn engine(conf: RackConfig, now: Instant) -> (Rack, Arc<AggregateMetrics>) {
        let metrics = Arc::new(AggregateMetrics::new());
        let mut rack = Rack::new(conf, metrics.clone(), 0, now).unwrap();
        rack.set_trace_id("test");
        (rack, metrics)
    }

    /// Send `n` segments one millisecond apart, from `snd_max`.
    fn send(rack: &mut Rack, n: u64, now: Instant) -> Instant {
        let mut t = now;
        for _ in 0..n {
            let start = rack.scoreboard().snd_max();
            rack.on_packet_sent(start..start + MSS, BitFlags::empty(), t)
                .unwrap();
            t += Duration::from_millis(1);
        }
        t
    }

    fn timer_generation(actions: &ActionSet) -> (Timer, u64) {
        match actions.timer() {
            Some(Action::ArmRto { generation, .. }) => (Timer::Rto, *generation),
            Some(Action::ArmTlp { generation, .. }) => (Timer::Tlp, *generation),
            other => panic!("no timer armed: {:?}", other),
        }
    }

    #[derive(Default)]
    struct Wire {
        sent: Vec<(Range<u64>, BitFlags<SegmentFlags>)>,
        fail: bool,
    }

    impl Transmitter for Wire {
        fn transmit(&mut self, range: Range<u64>, flags: BitFlags<SegmentFlags>) -> Result<u64> {
            if self.fail {
                return Err(Error::TransmitFailed("link down".into()));
            }
            let len = range.end - range.start;
            self.sent.push((range, flags));
            Ok(len)
        }
    }

    #[derive(Default)]
    struct Clock {
        armed: Option<(Timer, Duration, u64)>,
    }

    impl TimerScheduler for Clock {
        fn arm_timer(&mut self, timer: Timer, duration: Duration, generation: u64) {
            self.armed = Some((timer, duration, generation));
        }

        fn cancel_timer(&mut self) {
            self.armed = None;
        }
    }

    #[test]
    fn invalid_config() {
        let metrics = Arc::new(AggregateMetrics::new());
        let conf = RackConfig {
            mss: 0,
            ..RackConfig::default()
        };
        assert!(matches!(
            Rack::new(conf, metrics, 0, Instant::now()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn send_arms_tlp() {
        let now = Instant::now();
        let (mut rack, _) = engine(conf(), now);
        let actions = rack
            .on_packet_sent(0..MSS, BitFlags::empty(), now)
            .unwrap();

        // One segment outstanding, the delayed ack time is added.
        let expected = (rack.smoothed_rtt() * 2 + rack.conf.delayed_ack_time).min(rack.rto());
        assert_eq!(
            actions.timer(),
            Some(&Action::ArmTlp {
                duration: expected,
                generation: rack.sched.timers.generation(),
            })
        );
        assert_eq!(rack.pipe(), MSS);
        assert_eq!(rack.state(), SchedulerState::Open);
        assert_eq!(rack.phase(), Phase::SlowStart);
    }

    #[test]
    fn send_out_of_order_aborts() {
        let now = Instant::now();
        let (mut rack, metrics) = engine(conf(), now);
        send(&mut rack, 2, now);

        let err = rack.on_packet_sent(5000..6000, BitFlags::empty(), now);
        assert!(matches!(err, Err(Error::StructuralViolation(_))));
        assert!(rack.is_aborted());
        assert_eq!(metrics.get(Counter::StructuralViolations), Some(1));
        assert_eq!(
            rack.on_ack(&AckEvent::new(1000), now),
            Err(Error::EngineAborted)
        );
        assert_eq!(rack.send_quota(), 0);
    }

    #[test]
    fn ack_in_order() {
        let now = Instant::now();
        let (mut rack, _) = engine(conf(), now);
        let t = send(&mut rack, 4, now);

        let t = t + Duration::from_millis(50);
        let actions = rack.on_ack(&AckEvent::new(2 * MSS), t).unwrap();
        assert!(matches!(actions.timer(), Some(Action::ArmTlp { .. })));
        assert_eq!(rack.scoreboard().snd_una(), 2 * MSS);
        assert_eq!(rack.pipe(), 2 * MSS);
        assert!(rack.rtt.has_sample());
        assert_eq!(rack.stats().delivered_bytes, 2 * MSS);

        let actions = rack.on_ack(&AckEvent::new(4 * MSS), t).unwrap();
        assert_eq!(actions.timer(), Some(&Action::CancelTimer));
        assert_eq!(rack.next_timeout(), None);
        assert_eq!(rack.send_quota(), rack.congestion_window());
    }

    #[test]
    fn dupacks_enter_recovery() {
        let now = Instant::now();
        let (mut rack, metrics) = engine(conf(), now);
        let t = send(&mut rack, 5, now) + Duration::from_millis(100);

        rack.on_ack(&AckEvent::new(0).with_sack(1000..2000), t).unwrap();
        rack.on_ack(&AckEvent::new(0).with_sack(1000..3000), t).unwrap();
        assert_eq!(rack.state(), SchedulerState::Open);

        let actions = rack
            .on_ack(&AckEvent::new(0).with_sack(1000..4000), t)
            .unwrap();
        assert_eq!(rack.state(), SchedulerState::Recovering);
        assert_eq!(rack.phase(), Phase::Recovery);
        assert_eq!(metrics.get(Counter::RecoveryEpisodes), Some(1));

        let sends: Vec<_> = actions.sends().map(|(r, k)| (r.clone(), k)).collect();
        assert_eq!(sends, vec![(0..1000, SendKind::Retransmit)]);
        assert!(matches!(actions.timer(), Some(Action::ArmRto { .. })));

        // The retransmission fills the hole in the pipe.
        let pipe = rack.pipe();
        rack.on_packet_sent(0..1000, BitFlags::empty(), t).unwrap();
        assert_eq!(rack.pipe(), pipe + MSS);
        assert_eq!(rack.rec.prr_out, MSS);

        rack.on_ack(&AckEvent::new(5000), t + Duration::from_millis(100))
            .unwrap();
        assert_eq!(rack.state(), SchedulerState::Open);
        assert_eq!(rack.congestion_window(), rack.slow_start_threshold());
        assert_eq!(rack.pipe(), 0);
    }

    #[test]
    fn hole_retransmitted_once_per_round() {
        let now = Instant::now();
        let (mut rack, _) = engine(conf(), now);
        let mut t = send(&mut rack, 20, now) + Duration::from_millis(100);

        let mut wire = Wire::default();
        let mut clock = Clock::default();
        for k in 2..20 {
            let actions = rack
                .on_ack(&AckEvent::new(0).with_sack(MSS..k * MSS), t)
                .unwrap();
            rack.dispatch(&actions, &mut wire, &mut clock, t).unwrap();
            t += Duration::from_micros(100);
        }
        assert_eq!(rack.state(), SchedulerState::Recovering);

        let sent: Vec<Range<u64>> = wire.sent.iter().map(|(r, _)| r.clone()).collect();
        assert!(!sent.is_empty());
        for (i, a) in sent.iter().enumerate() {
            assert!(a.end <= MSS);
            for b in &sent[i + 1..] {
                assert!(a.end <= b.start || b.end <= a.start, "{:?} sent twice", a);
            }
        }
        assert!(rack.stats().retransmitted_bytes <= MSS);
    }

    #[test]
    fn recovery_clears_retransmitted_holes() {
        let now = Instant::now();
        let (mut rack, _) = engine(conf(), now);
        let mut actions = ActionSet::new();
        for i in 0..5 {
            actions = rack
                .on_packet_sent(i * MSS..(i + 1) * MSS, BitFlags::empty(), now)
                .unwrap();
        }
        let (timer, generation) = timer_generation(&actions);
        assert_eq!(timer, Timer::Tlp);

        let t = now + Duration::from_secs(1);
        let actions = rack.on_timeout(Timer::Tlp, generation, false, t).unwrap();
        let mut wire = Wire::default();
        let mut clock = Clock::default();
        rack.dispatch(&actions, &mut wire, &mut clock, t).unwrap();
        assert_eq!(wire.sent.len(), 1);
        assert_eq!(rack.snapshot().holes_retransmitted_bytes, MSS);

        let t = t + Duration::from_millis(10);
        for end in 2..=4 {
            rack.on_ack(&AckEvent::new(0).with_sack(MSS..end * MSS), t)
                .unwrap();
        }
        assert_eq!(rack.state(), SchedulerState::Recovering);
        assert_eq!(rack.snapshot().holes_retransmitted_bytes, 0);
        assert_eq!(rack.pipe(), 2 * MSS);
        rack.check_invariants().unwrap();
    }

    #[test]
    fn tlp_probes_tail() {
        let now = Instant::now();
        let (mut rack, metrics) = engine(conf(), now);
        let actions = rack
            .on_packet_sent(0..MSS, BitFlags::empty(), now)
            .unwrap();
        let (timer, generation) = timer_generation(&actions);
        assert_eq!(timer, Timer::Tlp);

        let t = now + Duration::from_secs(1);
        let actions = rack.on_timeout(Timer::Tlp, generation, false, t).unwrap();
        let sends: Vec<_> = actions.sends().map(|(r, k)| (r.clone(), k)).collect();
        assert_eq!(sends, vec![(0..MSS, SendKind::TailProbe)]);
        assert!(matches!(actions.timer(), Some(Action::ArmRto { .. })));
        assert_eq!(rack.state(), SchedulerState::TlpPending);
        assert_eq!(metrics.get(Counter::TlpProbes), Some(1));

        let mut wire = Wire::default();
        let mut clock = Clock::default();
        let sent = rack.dispatch(&actions, &mut wire, &mut clock, t).unwrap();
        assert_eq!(sent, MSS);
        assert_eq!(wire.sent, vec![(0..MSS, BitFlags::from(SegmentFlags::Tlp))]);
        assert!(matches!(clock.armed, Some((Timer::Rto, _, _))));

        let actions = rack
            .on_ack(&AckEvent::new(MSS), t + Duration::from_millis(50))
            .unwrap();
        assert_eq!(rack.state(), SchedulerState::Open);
        assert_eq!(actions.timer(), Some(&Action::CancelTimer));
    }

    #[test]
    fn tlp_new_data() {
        let now = Instant::now();
        let (mut rack, _) = engine(conf(), now);
        let actions = rack
            .on_packet_sent(0..MSS, BitFlags::empty(), now)
            .unwrap();
        let (_, generation) = timer_generation(&actions);

        let t = now + Duration::from_secs(1);
        let actions = rack.on_timeout(Timer::Tlp, generation, true, t).unwrap();
        let sends: Vec<_> = actions.sends().map(|(r, k)| (r.clone(), k)).collect();
        assert_eq!(sends, vec![(MSS..2 * MSS, SendKind::NewDataProbe)]);

        let mut wire = Wire::default();
        let mut clock = Clock::default();
        rack.dispatch(&actions, &mut wire, &mut clock, t).unwrap();
        assert_eq!(rack.scoreboard().snd_max(), 2 * MSS);

        // The probe is delivered, revealing the head as lost.
        let actions = rack
            .on_ack(&AckEvent::new(0).with_sack(MSS..2 * MSS), t)
            .unwrap();
        assert_eq!(rack.sched.tlp_end, None);
        assert_eq!(rack.state(), SchedulerState::Recovering);
        let sends: Vec<_> = actions.sends().map(|(r, k)| (r.clone(), k)).collect();
        assert_eq!(sends, vec![(0..MSS, SendKind::Retransmit)]);
    }

    #[test]
    fn stale_timer() {
        let now = Instant::now();
        let (mut rack, metrics) = engine(conf(), now);
        let actions = rack
            .on_packet_sent(0..MSS, BitFlags::empty(), now)
            .unwrap();
        let (_, generation) = timer_generation(&actions);

        // A new send re-arms the probe timer.
        rack.on_packet_sent(MSS..2 * MSS, BitFlags::empty(), now + Duration::from_millis(5))
            .unwrap();
        let actions = rack
            .on_timeout(Timer::Tlp, generation, false, now + Duration::from_secs(1))
            .unwrap();
        assert!(actions.is_empty());
        assert_eq!(rack.state(), SchedulerState::Open);
        assert_eq!(rack.stats().stale_timers, 1);
        assert_eq!(metrics.get(Counter::StaleTimers), Some(1));
    }

    #[test]
    fn rto_backoff_and_go_back_n() {
        let now = Instant::now();
        let conf = RackConfig {
            tlp_enabled: false,
            ..conf()
        };
        let (mut rack, metrics) = engine(conf, now);
        let mut actions = ActionSet::new();
        let mut t = now;
        for i in 0..3 {
            actions = rack
                .on_packet_sent(i * MSS..(i + 1) * MSS, BitFlags::empty(), t)
                .unwrap();
            t += Duration::from_millis(1);
        }
        assert!(actions.is_empty());
        let first = rack.rto();

        let (timer, generation) = (Timer::Rto, rack.sched.timers.generation());
        let t = now + first;
        let actions = rack.on_timeout(timer, generation, false, t).unwrap();
        assert_eq!(rack.state(), SchedulerState::RtoPending);
        assert_eq!(rack.rto_backoff(), 1);
        assert_eq!(rack.congestion_window(), MSS);
        let sends: Vec<_> = actions.sends().map(|(r, _)| r.clone()).collect();
        assert_eq!(sends, vec![0..MSS]);
        let second = match actions.timer() {
            Some(Action::ArmRto { duration, .. }) => *duration,
            other => panic!("unexpected {:?}", other),
        };
        assert!(second >= first);

        rack.on_packet_sent(0..MSS, BitFlags::empty(), t).unwrap();

        // No ack, the timer fires again with a longer backoff.
        let (_, generation) = timer_generation(&actions);
        let t = t + second;
        let actions = rack.on_timeout(Timer::Rto, generation, false, t).unwrap();
        let third = match actions.timer() {
            Some(Action::ArmRto { duration, .. }) => *duration,
            other => panic!("unexpected {:?}", other),
        };
        assert!(third >= second);
        assert_eq!(metrics.get(Counter::RtoFired), Some(2));
        rack.on_packet_sent(0..MSS, BitFlags::empty(), t).unwrap();

        // The retransmission is acked, the rest of the flight follows.
        let t = t + Duration::from_millis(400);
        let actions = rack.on_ack(&AckEvent::new(MSS), t).unwrap();
        assert_eq!(rack.state(), SchedulerState::RtoPending);
        let sends: Vec<_> = actions.sends().map(|(r, _)| r.clone()).collect();
        assert_eq!(sends, vec![MSS..2 * MSS]);

        rack.on_packet_sent(MSS..2 * MSS, BitFlags::empty(), t).unwrap();
        rack.on_packet_sent(2 * MSS..3 * MSS, BitFlags::empty(), t)
            .unwrap();
        rack.on_ack(&AckEvent::new(3 * MSS), t + Duration::from_millis(400))
            .unwrap();
        assert_eq!(rack.state(), SchedulerState::Open);
        assert_eq!(rack.rto_backoff(), 0);
        assert_eq!(rack.stats().spurious_rto, 0);
    }

    #[test]
    fn spurious_rto_undone() {
        let now = Instant::now();
        let conf = RackConfig {
            tlp_enabled: false,
            ..conf()
        };
        let (mut rack, metrics) = engine(conf, now);
        send(&mut rack, 4, now);
        let cwnd = rack.congestion_window();
        let ssthresh = rack.slow_start_threshold();

        let generation = rack.sched.timers.generation();
        let t = now + rack.rto();
        let actions = rack.on_timeout(Timer::Rto, generation, false, t).unwrap();
        assert_eq!(rack.congestion_window(), MSS);

        let mut wire = Wire::default();
        let mut clock = Clock::default();
        rack.dispatch(&actions, &mut wire, &mut clock, t).unwrap();

        // The ack echoes the original transmission.
        let ev = AckEvent::new(2 * MSS).with_ts_echo(now);
        rack.on_ack(&ev, t + Duration::from_millis(10)).unwrap();
        assert_eq!(rack.state(), SchedulerState::Open);
        assert_eq!(rack.congestion_window(), cwnd);
        assert_eq!(rack.slow_start_threshold(), ssthresh);
        assert_eq!(rack.rto_backoff(), 0);
        assert_eq!(metrics.get(Counter::SpuriousRto), Some(1));
        rack.check_invariants().unwrap();
    }

    #[test]
    fn dispatch_drops_stale_send() {
        let now = Instant::now();
        let (mut rack, metrics) = engine(conf(), now);
        send(&mut rack, 2, now);

        let mut actions = ActionSet::new();
        actions.push(Action::Send {
            range: 0..MSS,
            segments: 1,
            kind: SendKind::Retransmit,
        });
        rack.on_ack(&AckEvent::new(MSS), now + Duration::from_millis(50))
            .unwrap();

        let mut wire = Wire::default();
        let mut clock = Clock::default();
        let sent = rack.dispatch(&actions, &mut wire, &mut clock, now).unwrap();
        assert_eq!(sent, 0);
        assert!(wire.sent.is_empty());
        assert_eq!(metrics.get(Counter::StaleActions), Some(1));
    }

    #[test]
    fn dispatch_transmit_failure() {
        let now = Instant::now();
        let (mut rack, metrics) = engine(conf(), now);
        send(&mut rack, 2, now);

        let mut actions = ActionSet::new();
        actions.push(Action::Send {
            range: 0..MSS,
            segments: 1,
            kind: SendKind::Retransmit,
        });
        let mut wire = Wire {
            fail: true,
            ..Wire::default()
        };
        let mut clock = Clock::default();
        let err = rack.dispatch(&actions, &mut wire, &mut clock, now);
        assert!(matches!(err, Err(Error::TransmitFailed(_))));
        assert!(!rack.is_aborted());
        assert_eq!(metrics.get(Counter::TransmitFailures), Some(1));
    }

    #[test]
    fn send_quota_bounds() {
        let now = Instant::now();
        let (mut rack, _) = engine(conf(), now);
        let cwnd = rack.congestion_window();
        assert_eq!(rack.send_quota(), cwnd);

        send(&mut rack, 4, now);
        assert_eq!(rack.send_quota(), cwnd - 4 * MSS);

        // The receive window caps the quota.
        rack.on_ack(&AckEvent::new(0).with_window(5 * MSS), now)
            .unwrap();
        assert_eq!(rack.send_quota(), MSS);
    }

    #[test]
    fn pacing_rate_follows_phase() {
        let now = Instant::now();
        let (mut rack, _) = engine(conf(), now);
        let t = send(&mut rack, 4, now) + Duration::from_millis(100);
        rack.on_ack(&AckEvent::new(4 * MSS), t).unwrap();

        // No goodput yet, cwnd over srtt at the slow start multiplier.
        let srtt = rack.smoothed_rtt().as_nanos();
        let bw = (rack.congestion_window() as u128 * 1_000_000_000 / srtt) as u64;
        assert_eq!(rack.pacing_rate(), bw * 2);

        rack.set_fixed_pacing_rate(Some(12_500));
        rack.update_pacing_rate();
        assert_eq!(rack.pacing_rate(), 12_500);
        assert_eq!(rack.snapshot().pacing_rate, 12_500);
    }

    #[test]
    fn snapshot_serialize() {
        let now = Instant::now();
        let (mut rack, _) = engine(conf(), now);
        send(&mut rack, 2, now);
        let snapshot = rack.snapshot();
        assert_eq!(snapshot.snd_max, 2 * MSS);
        assert_eq!(snapshot.pipe, 2 * MSS);
        assert_eq!(snapshot.segments, 2);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"state\":\"open\""));
        assert!(json.contains("\"phase\":\"slow_start\""));
    }
}

mod goodput;
mod minmax;
mod probe_rtt;
mod prr;
mod rtt;
mod sack;
mod scheduler;
mod timer;
