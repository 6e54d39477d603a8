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

//! Properties checked over randomized send, ack and timer sequences on a
//! lossy, reordering link.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use enumflags2::BitFlags;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use tcp_rack::congestion_control::RateTable;
use tcp_rack::AckEvent;
use tcp_rack::AggregateMetrics;
use tcp_rack::Rack;
use tcp_rack::RackConfig;
use tcp_rack::Result;
use tcp_rack::SegmentFlags;
use tcp_rack::Timer;
use tcp_rack::TimerScheduler;
use tcp_rack::Transmitter;

const MSS: u64 = 1000;
const MAX_PACING_RATE: u64 = 200_000;

/// Segments on their way to the receiver.
struct Link {
    rng: StdRng,
    loss: f64,
    now: Instant,
    in_flight: Vec<(Instant, Range<u64>)>,
}

impl Link {
    fn put(&mut self, range: Range<u64>) {
        if self.rng.gen_bool(self.loss) {
            return;
        }
        let delay = Duration::from_millis(self.rng.gen_range(20..60));
        self.in_flight.push((self.now + delay, range));
    }

    /// Take a random segment that has arrived.
    fn take(&mut self) -> Option<Range<u64>> {
        let arrived: Vec<usize> = (0..self.in_flight.len())
            .filter(|&i| self.in_flight[i].0 <= self.now)
            .collect();
        if arrived.is_empty() {
            return None;
        }
        let i = arrived[self.rng.gen_range(0..arrived.len())];
        Some(self.in_flight.swap_remove(i).1)
    }
}

impl Transmitter for Link {
    fn transmit(&mut self, range: Range<u64>, _flags: BitFlags<SegmentFlags>) -> Result<u64> {
        let len = range.end - range.start;
        self.put(range);
        Ok(len)
    }
}

#[derive(Default)]
struct Clock {
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

/// Received byte ranges, sorted and disjoint.
#[derive(Default)]
struct Receiver {
    ranges: Vec<Range<u64>>,
}

impl Receiver {
    fn insert(&mut self, r: Range<u64>) {
        self.ranges.push(r);
        self.ranges.sort_by_key(|r| r.start);
        let mut merged: Vec<Range<u64>> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
    }

    fn ack(&self) -> AckEvent {
        let cum_ack = match self.ranges.first() {
            Some(r) if r.start == 0 => r.end,
            _ => 0,
        };
        let mut ev = AckEvent::new(cum_ack);
        for r in self.ranges.iter().filter(|r| r.start > cum_ack).rev().take(3) {
            ev = ev.with_sack(r.clone());
        }
        ev
    }
}

fn records(rack: &Rack) -> Vec<(Range<u64>, bool)> {
    rack.scoreboard()
        .iter()
        .map(|(_, s)| (s.range(), s.is_sacked()))
        .collect()
}

fn check(rack: &Rack) -> Result<()> {
    rack.check_invariants()?;

    let snapshot = rack.snapshot();
    assert!(snapshot.sacked_bytes <= snapshot.snd_max - snapshot.snd_una);
    assert!(snapshot.pacing_rate <= MAX_PACING_RATE);

    // The records tile [snd_una, snd_max).
    let mut next = snapshot.snd_una;
    for (range, _) in records(rack) {
        assert_eq!(range.start, next);
        assert!(range.end > range.start);
        next = range.end;
    }
    assert_eq!(next, snapshot.snd_max);
    Ok(())
}

fn run(seed: u64, steps: usize, hardware: bool) -> Result<Rack> {
    let start = Instant::now();
    let conf = RackConfig {
        mss: MSS,
        max_pacing_rate: MAX_PACING_RATE,
        max_segments: 64,
        ..RackConfig::default()
    };
    let mut rack = Rack::new(conf, Arc::new(AggregateMetrics::new()), 0, start)?;
    rack.set_trace_id(&format!("seed-{}", seed));
    if hardware {
        rack.set_hardware_pacing(Box::new(RateTable::new(vec![1, 20_000, 80_000])));
    }

    let mut link = Link {
        rng: StdRng::seed_from_u64(seed),
        loss: 0.1,
        now: start,
        in_flight: Vec::new(),
    };
    let mut clock = Clock::default();
    let mut receiver = Receiver::default();
    let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);

    for _ in 0..steps {
        link.now += Duration::from_millis(rng.gen_range(1..5));
        let now = link.now;
        clock.now = Some(now);

        match rng.gen_range(0..10) {
            0..=3 if rack.send_quota() >= MSS => {
                let seq = rack.scoreboard().snd_max();
                let actions = rack.on_packet_sent(seq..seq + MSS, BitFlags::empty(), now)?;
                link.put(seq..seq + MSS);
                rack.dispatch(&actions, &mut link, &mut clock, now)?;
            }
            0..=7 => {
                if let Some(range) = link.take() {
                    receiver.insert(range);
                    let ev = receiver.ack();
                    let actions = rack.on_ack(&ev, now)?;

                    // A replayed ack changes nothing.
                    if rng.gen_bool(0.2) {
                        let before = records(&rack);
                        let sacked = rack.snapshot().sacked_bytes;
                        rack.on_ack(&ev, now)?;
                        assert_eq!(records(&rack), before);
                        assert_eq!(rack.snapshot().sacked_bytes, sacked);
                    }
                    rack.dispatch(&actions, &mut link, &mut clock, now)?;
                }
            }
            _ => {
                if let Some((timer, expire, generation)) = clock.armed {
                    if expire <= now || link.in_flight.is_empty() {
                        link.now = now.max(expire);
                        clock.now = Some(link.now);
                        clock.armed = None;
                        let app_has_data = rng.gen_bool(0.5);
                        let actions = rack.on_timeout(timer, generation, app_has_data, link.now)?;
                        let at = link.now;
                        rack.dispatch(&actions, &mut link, &mut clock, at)?;
                    }
                }
            }
        }

        check(&rack)?;
        assert!(!rack.is_aborted());
    }
    Ok(rack)
}

#[test]
fn randomized_lossy_link() -> Result<()> {
    for seed in 0..8 {
        let rack = run(seed, 2000, false)?;
        assert!(rack.stats().delivered_bytes > 0);
    }
    Ok(())
}

#[test]
fn hardware_pacing_cap() -> Result<()> {
    for seed in 100..104 {
        let rack = run(seed, 1000, true)?;
        assert!(rack.pacing_rate() <= 80_000);
    }
    Ok(())
}

#[test]
fn repeated_sack_block() -> Result<()> {
    let now = Instant::now();
    let conf = RackConfig {
        mss: MSS,
        max_pacing_rate: MAX_PACING_RATE,
        ..RackConfig::default()
    };
    let mut rack = Rack::new(conf, Arc::new(AggregateMetrics::new()), 0, now)?;
    for i in 0..6 {
        rack.on_packet_sent(i * MSS..(i + 1) * MSS, BitFlags::empty(), now)?;
    }

    let ev = AckEvent::new(MSS).with_sack(2500..4200);
    rack.on_ack(&ev, now)?;
    let once = records(&rack);
    let sacked = rack.snapshot().sacked_bytes;
    assert_eq!(sacked, 1700);

    rack.on_ack(&ev, now)?;
    assert_eq!(records(&rack), once);
    assert_eq!(rack.snapshot().sacked_bytes, sacked);
    check(&rack)
}

#[test]
fn prr_quota_in_recovery() -> Result<()> {
    let now = Instant::now();
    let conf = RackConfig {
        mss: MSS,
        max_pacing_rate: MAX_PACING_RATE,
        ..RackConfig::default()
    };
    let mut rack = Rack::new(conf, Arc::new(AggregateMetrics::new()), 0, now)?;
    for i in 0..10 {
        rack.on_packet_sent(i * MSS..(i + 1) * MSS, BitFlags::empty(), now)?;
    }

    // Every ack SACKs one more segment above the lost head.
    let mut t = now + Duration::from_millis(80);
    for i in 2..=10 {
        rack.on_ack(&AckEvent::new(0).with_sack(MSS..i * MSS), t)?;
        let quota = rack.send_quota();
        assert!(quota <= rack.congestion_window().max(rack.slow_start_threshold()));
        t += Duration::from_millis(1);
    }
    check(&rack)
}
