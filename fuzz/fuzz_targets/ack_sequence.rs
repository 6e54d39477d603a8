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

#![no_main]

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use enumflags2::BitFlags;
use libfuzzer_sys::fuzz_target;

use tcp_rack::AckEvent;
use tcp_rack::NoopMetrics;
use tcp_rack::Rack;
use tcp_rack::RackConfig;
use tcp_rack::Timer;

const MSS: u64 = 100;

fn u16_at(data: &[u8], i: usize) -> u64 {
    u16::from_le_bytes([data[i], data[i + 1]]) as u64
}

// Each 7-byte chunk is an opcode followed by three 16-bit operands.
fuzz_target!(|data: &[u8]| {
    let start = Instant::now();
    let conf = RackConfig {
        mss: MSS,
        max_segments: 32,
        ..RackConfig::default()
    };
    let mut rack = Rack::new(conf, Arc::new(NoopMetrics), 0, start).unwrap();
    let mut now = start;
    let mut timer: Option<(Timer, u64)> = None;

    for chunk in data.chunks_exact(7) {
        now += Duration::from_millis(chunk[0] as u64 & 0x0f);
        let (a, b, c) = (u16_at(chunk, 1), u16_at(chunk, 3), u16_at(chunk, 5));
        let snd_una = rack.scoreboard().snd_una();
        let snd_max = rack.scoreboard().snd_max();

        let actions = match chunk[0] >> 4 {
            0..=5 => {
                let len = a % (4 * MSS) + 1;
                rack.on_packet_sent(snd_max..snd_max + len, BitFlags::empty(), now)
            }
            6 if snd_max > snd_una => {
                let from = snd_una + a % (snd_max - snd_una);
                rack.on_packet_sent(from..from + b % MSS + 1, BitFlags::empty(), now)
            }
            7..=13 => {
                // Blocks may be malformed on purpose.
                let cum_ack = snd_una + a % (snd_max - snd_una + 1);
                let ev = AckEvent::new(cum_ack)
                    .with_sack(cum_ack + b % 1000..cum_ack + b % 1000 + c % 500)
                    .with_sack(snd_una + c % 2000..snd_una + c % 2000 + b % 300);
                rack.on_ack(&ev, now)
            }
            _ => match timer.take() {
                Some((t, generation)) => rack.on_timeout(t, generation, a & 1 == 1, now),
                None => continue,
            },
        };

        let actions = match actions {
            Ok(actions) => actions,
            Err(_) => continue,
        };
        match actions.timer() {
            Some(tcp_rack::Action::ArmRto { generation, .. }) => {
                timer = Some((Timer::Rto, *generation))
            }
            Some(tcp_rack::Action::ArmTlp { generation, .. }) => {
                timer = Some((Timer::Tlp, *generation))
            }
            Some(tcp_rack::Action::CancelTimer) => timer = None,
            _ => (),
        }

        assert!(!rack.is_aborted());
        rack.check_invariants().unwrap();
    }
});
