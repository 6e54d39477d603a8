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

//! A discrete event simulation of one sender driving the engine over a
//! lossy, reordering bottleneck link.

use std::ops::Range;
use std::time::Duration;
use std::time::Instant;

use enumflags2::BitFlags;
use log::*;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use tcp_rack::AckEvent;
use tcp_rack::ActionSet;
use tcp_rack::Rack;
use tcp_rack::SegmentFlags;
use tcp_rack::Snapshot;
use tcp_rack::Timer;
use tcp_rack::TimerScheduler;
use tcp_rack::Transmitter;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Properties of the simulated path.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Round trip propagation delay.
    pub rtt: Duration,

    /// Bottleneck rate in bytes per second.
    pub rate: u64,

    /// Probability of a data segment being dropped.
    pub loss: f64,

    /// Probability of a data segment being delayed past its successors.
    pub reorder: f64,

    /// Extra delay of a reordered segment.
    pub reorder_delay: Duration,

    /// Bytes the bottleneck can queue before dropping.
    pub queue_limit: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            rtt: Duration::from_millis(50),
            rate: 1_250_000,
            loss: 0.01,
            reorder: 0.0,
            reorder_delay: Duration::from_millis(5),
            queue_limit: 256 * 1024,
        }
    }
}

/// A data segment on its way to the receiver.
#[derive(Debug, Clone)]
struct Packet {
    arrival: Instant,
    range: Range<u64>,
    sent: Instant,
}

/// The forward path: a rate limited queue followed by propagation delay.
pub struct Link {
    conf: LinkConfig,
    rng: StdRng,
    now: Instant,
    busy_until: Instant,
    packets: Vec<Packet>,
    dropped: u64,
}

impl Link {
    pub fn new(conf: LinkConfig, seed: u64, now: Instant) -> Self {
        Link {
            conf,
            rng: StdRng::seed_from_u64(seed),
            now,
            busy_until: now,
            packets: Vec::new(),
            dropped: 0,
        }
    }

    /// Bytes dropped by the link.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn queued(&self) -> u64 {
        let wait = self.busy_until.saturating_duration_since(self.now);
        (self.conf.rate as u128 * wait.as_nanos() / 1_000_000_000) as u64
    }

    fn put(&mut self, range: Range<u64>) {
        let len = range.end - range.start;
        if self.rng.gen_bool(self.conf.loss) || self.queued() + len > self.conf.queue_limit {
            trace!("link drop {:?}", range);
            self.dropped += len;
            return;
        }

        let serialization = Duration::from_nanos(
            (len as u128 * 1_000_000_000 / self.conf.rate.max(1) as u128) as u64,
        );
        self.busy_until = self.busy_until.max(self.now) + serialization;
        let mut arrival = self.busy_until + self.conf.rtt / 2;
        if self.rng.gen_bool(self.conf.reorder) {
            arrival += self.conf.reorder_delay;
        }
        self.packets.push(Packet {
            arrival,
            range,
            sent: self.now,
        });
    }

    fn next_arrival(&self) -> Option<Instant> {
        self.packets.iter().map(|p| p.arrival).min()
    }

    fn take_arrived(&mut self) -> Vec<Packet> {
        let now = self.now;
        let (mut arrived, pending): (Vec<Packet>, Vec<Packet>) =
            self.packets.drain(..).partition(|p| p.arrival <= now);
        self.packets = pending;
        arrived.sort_by_key(|p| p.arrival);
        arrived
    }
}

impl Transmitter for Link {
    fn transmit(
        &mut self,
        range: Range<u64>,
        _flags: BitFlags<SegmentFlags>,
    ) -> tcp_rack::Result<u64> {
        let len = range.end - range.start;
        self.put(range);
        Ok(len)
    }
}

/// The receiving end, generating SACK and D-SACK feedback.
#[derive(Debug, Default)]
pub struct Receiver {
    /// Received ranges above the cumulative ack, most recent first.
    blocks: Vec<Range<u64>>,

    /// Next expected sequence number.
    cum_ack: u64,
}

impl Receiver {
    pub fn new(isn: u64) -> Self {
        Receiver {
            blocks: Vec::new(),
            cum_ack: isn,
        }
    }

    /// Accept a segment and build the ack it triggers.
    fn on_segment(&mut self, range: Range<u64>, sent: Instant) -> AckEvent {
        let duplicate = range.end <= self.cum_ack
            || self
                .blocks
                .iter()
                .any(|b| b.start <= range.start && range.end <= b.end);

        if !duplicate {
            let mut merged = range.clone();
            self.blocks.retain(|b| {
                if b.start <= merged.end && merged.start <= b.end {
                    merged = merged.start.min(b.start)..merged.end.max(b.end);
                    false
                } else {
                    true
                }
            });
            self.blocks.insert(0, merged);

            if let Some(i) = self.blocks.iter().position(|b| b.start <= self.cum_ack) {
                let head = self.blocks.remove(i);
                self.cum_ack = self.cum_ack.max(head.end);
            }
        }

        let mut wire: Vec<Range<u64>> = Vec::with_capacity(4);
        if duplicate {
            wire.push(range);
        }
        wire.extend(self.blocks.iter().take(3).cloned());
        AckEvent::from_wire(self.cum_ack, &wire, u64::MAX).with_ts_echo(sent)
    }
}

/// Timer of the simulated sender.
#[derive(Debug, Default)]
pub struct Clock {
    now: Option<Instant>,
    armed: Option<(Timer, Instant, u64)>,
}

impl TimerScheduler for Clock {
    fn arm_timer(&mut self, timer: Timer, duration: Duration, generation: u64) {
        if let Some(now) = self.now {
            self.armed = Some((timer, now + duration, generation));
        }
    }

    fn cancel_timer(&mut self) {
        self.armed = None;
    }
}

/// Outcome of a simulation run.
#[derive(Debug)]
pub struct Report {
    pub elapsed: Duration,
    pub delivered: u64,
    pub dropped: u64,
    pub snapshot: Snapshot,
}

/// One bulk transfer through the engine.
pub struct Simulator {
    rack: Rack,
    link: Link,
    receiver: Receiver,
    clock: Clock,
    acks: Vec<(Instant, AckEvent)>,
    ack_delay: Duration,
    start: Instant,
    now: Instant,
    mss: u64,
}

impl Simulator {
    pub fn new(rack: Rack, link: LinkConfig, mss: u64, seed: u64, start: Instant) -> Self {
        let ack_delay = link.rtt / 2;
        let isn = rack.scoreboard().snd_una();
        Simulator {
            rack,
            link: Link::new(link, seed, start),
            receiver: Receiver::new(isn),
            clock: Clock::default(),
            acks: Vec::new(),
            ack_delay,
            start,
            now: start,
            mss,
        }
    }

    /// Transfer `bytes` or stop at `deadline`, whichever comes first.
    pub fn run(&mut self, bytes: u64, deadline: Duration) -> Result<Report> {
        let isn = self.rack.scoreboard().snd_una();
        let end = isn + bytes;
        let deadline = self.start + deadline;

        while self.now < deadline && self.rack.scoreboard().snd_una() < end {
            let next_send = self.send_new_data(end)?;

            let next = [
                next_send,
                self.link.next_arrival(),
                self.acks.iter().map(|(t, _)| *t).min(),
                self.clock.armed.map(|(_, t, _)| t),
            ]
            .into_iter()
            .flatten()
            .min();
            let next = match next {
                Some(t) => t.max(self.now + Duration::from_micros(1)),
                None => {
                    warn!("simulation stalled at {:?}", self.rack);
                    break;
                }
            };
            self.advance(next);

            for p in self.link.take_arrived() {
                let ev = self.receiver.on_segment(p.range, p.sent);
                self.acks.push((self.now + self.ack_delay, ev));
            }
            self.process_acks(end)?;
            self.process_timer(end)?;
        }

        Ok(Report {
            elapsed: self.now.saturating_duration_since(self.start),
            delivered: self.rack.scoreboard().snd_una() - isn,
            dropped: self.link.dropped(),
            snapshot: self.rack.snapshot(),
        })
    }

    /// The engine under test.
    pub fn rack(&self) -> &Rack {
        &self.rack
    }

    fn advance(&mut self, t: Instant) {
        self.now = t;
        self.link.now = t;
        self.clock.now = Some(t);
    }

    /// Send new data while the window allows, returning when the pacer lets
    /// the next segment go.
    fn send_new_data(&mut self, end: u64) -> Result<Option<Instant>> {
        self.clock.now = Some(self.now);
        loop {
            let seq = self.rack.scoreboard().snd_max();
            let len = self.mss.min(end.saturating_sub(seq));
            if len == 0 || self.rack.send_quota() < len {
                return Ok(None);
            }
            if let Some(t) = self.rack.next_send_time(len, self.now) {
                return Ok(Some(t));
            }

            let flags = if seq + len == end {
                BitFlags::from(SegmentFlags::AppLimited)
            } else {
                BitFlags::empty()
            };
            let actions = self.rack.on_packet_sent(seq..seq + len, flags, self.now)?;
            self.link.put(seq..seq + len);
            self.dispatch(&actions)?;
        }
    }

    fn process_acks(&mut self, end: u64) -> Result<()> {
        let now = self.now;
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.acks.drain(..).partition(|(t, _)| *t <= now);
        self.acks = pending;
        due.sort_by_key(|(t, _)| *t);

        for (_, ev) in due {
            let actions = self.rack.on_ack(&ev, now)?;
            self.dispatch(&actions)?;
            if self.rack.scoreboard().snd_una() >= end {
                break;
            }
        }
        Ok(())
    }

    fn process_timer(&mut self, end: u64) -> Result<()> {
        let (timer, expire, generation) = match self.clock.armed {
            Some(armed) => armed,
            None => return Ok(()),
        };
        if expire > self.now {
            return Ok(());
        }

        self.clock.armed = None;
        let app_has_data = self.rack.scoreboard().snd_max() < end;
        let actions = self
            .rack
            .on_timeout(timer, generation, app_has_data, self.now)?;
        self.dispatch(&actions)
    }

    fn dispatch(&mut self, actions: &ActionSet) -> Result<()> {
        self.rack
            .dispatch(actions, &mut self.link, &mut self.clock, self.now)?;
        Ok(())
    }
}
