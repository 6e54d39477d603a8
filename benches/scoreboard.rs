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

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use criterion::criterion_group;
use criterion::criterion_main;
use criterion::BatchSize;
use criterion::Criterion;
use enumflags2::BitFlags;

use tcp_rack::AckEvent;
use tcp_rack::NoopMetrics;
use tcp_rack::Rack;
use tcp_rack::RackConfig;
use tcp_rack::Scoreboard;

const MSS: u64 = 1460;
const RANGE: u64 = 2_000;

fn filled_board(now: Instant) -> Scoreboard {
    let mut board = Scoreboard::new(0, RANGE as usize * 4);
    for i in 0..RANGE {
        let t = now + Duration::from_micros(i);
        board
            .insert_on_send(i * MSS..(i + 1) * MSS, BitFlags::empty(), t, 0)
            .unwrap();
    }
    board
}

fn filled_engine(now: Instant) -> Rack {
    let conf = RackConfig {
        max_segments: RANGE as usize * 4,
        ..RackConfig::default()
    };
    let mut rack = Rack::new(conf, Arc::new(NoopMetrics), 0, now).unwrap();
    for i in 0..RANGE {
        let t = now + Duration::from_micros(i);
        rack.on_packet_sent(i * MSS..(i + 1) * MSS, BitFlags::empty(), t)
            .unwrap();
    }
    rack
}

pub fn scoreboard_lookup_benchmark(c: &mut Criterion) {
    let board = filled_board(Instant::now());
    let mut seq = 0;
    c.bench_function("scoreboard lookup", |b| {
        b.iter(|| {
            seq = (seq + 7919 * MSS / 3) % (RANGE * MSS);
            board.lookup(seq)
        })
    });
}

pub fn scoreboard_trim_benchmark(c: &mut Criterion) {
    let now = Instant::now();
    c.bench_function("scoreboard trim head", |b| {
        b.iter_batched(
            || filled_board(now),
            |mut board| board.trim_head(RANGE * MSS / 2).unwrap(),
            BatchSize::SmallInput,
        )
    });
}

pub fn sack_scattered_benchmark(c: &mut Criterion) {
    let now = Instant::now();
    let t = now + Duration::from_millis(50);
    c.bench_function("sack scattered blocks", |b| {
        b.iter_batched(
            || filled_engine(now),
            |mut rack| {
                // Every other segment is SACKed, three blocks per ack.
                let mut i = 1;
                while i + 4 < RANGE {
                    let ev = AckEvent::new(0)
                        .with_sack(i * MSS..(i + 1) * MSS)
                        .with_sack((i + 2) * MSS..(i + 3) * MSS)
                        .with_sack((i + 4) * MSS..(i + 5) * MSS);
                    rack.on_ack(&ev, t).unwrap();
                    i += 6;
                }
                rack
            },
            BatchSize::SmallInput,
        )
    });
}

pub fn cumulative_ack_benchmark(c: &mut Criterion) {
    let now = Instant::now();
    let t = now + Duration::from_millis(50);
    c.bench_function("cumulative ack", |b| {
        b.iter_batched(
            || filled_engine(now),
            |mut rack| {
                for i in 1..=RANGE / 2 {
                    rack.on_ack(&AckEvent::new(i * 2 * MSS), t).unwrap();
                }
                rack
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    scoreboard_lookup_benchmark,
    scoreboard_trim_benchmark,
    sack_scattered_benchmark,
    cumulative_ack_benchmark,
);
criterion_main!(benches);
