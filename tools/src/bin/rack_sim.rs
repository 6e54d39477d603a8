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

use clap::error::ErrorKind;
use clap::CommandFactory;
use clap::Parser;
use log::*;

use tcp_rack::AggregateMetrics;
use tcp_rack::CongestionControlAlgorithm;
use tcp_rack::Rack;
use tcp_rack::RackConfig;
use tcp_rack_tools::LinkConfig;
use tcp_rack_tools::Result;
use tcp_rack_tools::Simulator;

#[derive(Parser, Debug, Clone)]
#[clap(name = "rack_sim")]
pub struct SimOpt {
    /// Bytes to transfer.
    #[clap(short, long, default_value = "10000000", value_name = "NUM")]
    pub bytes: u64,

    /// Simulated time limit in seconds.
    #[clap(short, long, default_value = "60", value_name = "TIME")]
    pub duration: u64,

    /// Round trip propagation delay in milliseconds.
    #[clap(long, default_value = "50", value_name = "TIME")]
    pub rtt: u64,

    /// Bottleneck rate in kbit/s.
    #[clap(long, default_value = "10000", value_name = "NUM")]
    pub rate: u64,

    /// Loss probability of data segments.
    #[clap(long, default_value = "0.01", value_name = "NUM")]
    pub loss: f64,

    /// Reordering probability of data segments.
    #[clap(long, default_value = "0", value_name = "NUM")]
    pub reorder: f64,

    /// Extra delay of reordered segments in milliseconds.
    #[clap(long, default_value = "5", value_name = "TIME")]
    pub reorder_delay: u64,

    /// Bottleneck queue limit in bytes.
    #[clap(long, default_value = "262144", value_name = "NUM")]
    pub queue_limit: u64,

    /// Maximum segment size.
    #[clap(long, default_value = "1460", value_name = "NUM")]
    pub mss: u64,

    /// Congestion control algorithm.
    #[clap(long, default_value = "FIXED")]
    pub congestion_control_algor: CongestionControlAlgorithm,

    /// Initial congestion window in segments.
    #[clap(long, default_value = "10", value_name = "NUM")]
    pub initial_congestion_window: u64,

    /// Disable tail loss probes.
    #[clap(long)]
    pub disable_tlp: bool,

    /// Fixed pacing rate in bytes per second.
    #[clap(long, value_name = "NUM")]
    pub pacing_rate: Option<u64>,

    /// Seed of the link randomness.
    #[clap(long, default_value = "1", value_name = "NUM")]
    pub seed: u64,

    /// Log level, support OFF/ERROR/WARN/INFO/DEBUG/TRACE.
    #[clap(long, default_value = "INFO", value_name = "STR")]
    pub log_level: log::LevelFilter,
}

fn parse_option() -> std::result::Result<SimOpt, clap::error::Error> {
    let option = SimOpt::parse();

    if !(0.0..1.0).contains(&option.loss) || !(0.0..=1.0).contains(&option.reorder) {
        return Err(SimOpt::command().error(
            ErrorKind::InvalidValue,
            "Loss must be in [0, 1) and reordering in [0, 1]",
        ));
    }
    if option.rate == 0 {
        return Err(SimOpt::command().error(ErrorKind::InvalidValue, "Rate must be positive"));
    }

    Ok(option)
}

fn main() -> Result<()> {
    let option = match parse_option() {
        Ok(option) => option,
        Err(e) => e.exit(),
    };

    env_logger::builder()
        .filter_level(option.log_level)
        .format_timestamp_millis()
        .init();

    let conf = RackConfig {
        mss: option.mss,
        tlp_enabled: !option.disable_tlp,
        fixed_pacing_rate: option.pacing_rate,
        initial_congestion_window: option.initial_congestion_window,
        congestion_control_algorithm: option.congestion_control_algor,
        ..RackConfig::default()
    };
    let link = LinkConfig {
        rtt: Duration::from_millis(option.rtt),
        rate: option.rate * 1000 / 8,
        loss: option.loss,
        reorder: option.reorder,
        reorder_delay: Duration::from_millis(option.reorder_delay),
        queue_limit: option.queue_limit,
    };

    let start = Instant::now();
    let metrics = Arc::new(AggregateMetrics::new());
    let mut rack = Rack::new(conf, metrics.clone(), 0, start)?;
    rack.set_trace_id("sim");

    let mut sim = Simulator::new(rack, link, option.mss, option.seed, start);
    let report = sim.run(option.bytes, Duration::from_secs(option.duration))?;

    let secs = report.elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        "delivered {} bytes in {:.3}s, goodput {:.1} kbit/s, link dropped {} bytes",
        report.delivered,
        secs,
        report.delivered as f64 * 8.0 / 1000.0 / secs,
        report.dropped
    );

    println!("{}", serde_json::to_string_pretty(&report.snapshot)?);
    println!("{}", serde_json::to_string_pretty(sim.rack().stats())?);
    for (name, value) in metrics.dump() {
        if value > 0 {
            println!("{} {}", name, value);
        }
    }

    Ok(())
}
