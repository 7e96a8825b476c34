use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use tsnbench::config::{BenchConfig, LoggingConfig};
use tsnbench::probes::{
    IcmpProber, LatencyStats, Pinger, SockperfClient, SockperfLatency, SockperfProber, SockperfThroughput,
};
use tsnbench::probes::sockperf::LatencyMode;
use tsnbench::storage::ResultsDir;
use tsnbench::suite::{self, LatencyEntry, SockperfEntry, SuiteReport, ThroughputEntry};
use tsnbench::system::process::{shutdown_channel, Runner};
use tsnbench::throughput::iperf::{check_server, Iperf3Client, UdpLossProbe};
use tsnbench::throughput::report::{
    format_back_to_back, format_frame_loss, format_rate, format_search, format_trial,
};
use tsnbench::throughput::{back_to_back, frame_loss, search, Rate};

/// How long a Ctrl-C waits for the running tool to be stopped.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(
    name = "tsnbench",
    about = "RFC 2544 network benchmarking over iperf3 and ping",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $TSNBENCH_CONFIG, then /etc/tsnbench/tsnbench.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Target host running `iperf3 -s`
    #[arg(long, global = true)]
    target: Option<String>,

    /// Path to the iperf3 binary
    #[arg(long, global = true)]
    iperf3_path: Option<String>,

    /// Path to the sockperf binary
    #[arg(long, global = true)]
    sockperf_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LatencyTool {
    /// ICMP echo RTT via ping
    Ping,
    /// Ping-pong and under-load latency via sockperf
    Sockperf,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the target answers ICMP echo and runs an iperf3 server
    /// (and a sockperf server when sockperf is enabled)
    Check,

    /// Find the zero-loss throughput for one frame size
    Throughput {
        /// Frame size in bytes
        #[arg(long, default_value = "1518")]
        frame_size: u32,

        /// Lowest rate searched (Mbps)
        #[arg(long)]
        floor_mbps: Option<f64>,

        /// Highest rate searched (Mbps)
        #[arg(long)]
        ceiling_mbps: Option<f64>,

        /// Loss threshold in percent
        #[arg(long)]
        loss_threshold_pct: Option<f64>,

        /// Relative tolerance of the final interval
        #[arg(long)]
        tolerance: Option<f64>,

        /// Maximum bisection steps
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Seconds per probe
        #[arg(long)]
        trial_secs: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Measure frame loss across offered loads
    FrameLoss {
        /// Frame size in bytes
        #[arg(long, default_value = "1518")]
        frame_size: u32,

        /// Offered loads as percentages of line rate, comma separated
        #[arg(long, value_delimiter = ',')]
        loads: Vec<f64>,

        /// Trials per load
        #[arg(long)]
        trials: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Measure back-to-back burst capacity
    BackToBack {
        /// Frame size in bytes
        #[arg(long, default_value = "1518")]
        frame_size: u32,

        /// Burst rate (Mbps, default: line rate)
        #[arg(long)]
        burst_mbps: Option<f64>,

        /// Number of bursts
        #[arg(long)]
        trials: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Measure latency per frame size (ping) or message size (sockperf)
    Latency {
        /// Measurement tool
        #[arg(long, value_enum, default_value = "ping")]
        tool: LatencyTool,

        /// Frame size in bytes for ping, message size for sockperf
        /// (repeatable, default: all configured sizes)
        #[arg(long)]
        frame_size: Vec<u32>,

        /// Echo requests per frame size
        #[arg(long)]
        count: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Run the full RFC 2544 suite and save results
    Suite {
        /// Parent directory for the timestamped results directory
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Frame sizes, comma separated (default: all RFC 2544 sizes)
        #[arg(long, value_delimiter = ',')]
        frame_sizes: Vec<u32>,

        /// Also run the sockperf latency and throughput tests
        #[arg(long)]
        sockperf: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = BenchConfig::resolve(cli.config.as_deref())?;
    if let Some(target) = cli.target {
        config.target.host = target;
    }
    if let Some(path) = cli.iperf3_path {
        config.iperf3.path = path;
    }
    if let Some(path) = cli.sockperf_path {
        config.sockperf.path = path;
    }

    init_tracing(&config.logging);

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let runner = Runner::current(shutdown_rx)?;
    let command = cli.command;
    let mut work = tokio::task::spawn_blocking(move || execute(command, config, runner));

    tokio::select! {
        joined = &mut work => joined.context("benchmark task panicked")?,
        Ok(()) = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, stopping the running tool");
            let _ = shutdown_tx.send(true);
            if tokio::time::timeout(SHUTDOWN_WAIT, work).await.is_err() {
                tracing::warn!("benchmark did not stop within {}s", SHUTDOWN_WAIT.as_secs());
            }
            std::process::exit(130);
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn execute(command: Commands, mut config: BenchConfig, runner: Runner) -> Result<()> {
    match command {
        Commands::Check => {
            let pinger = Pinger::new(&config.target.host, runner.clone())?;
            let report = pinger.check_connectivity()?;
            if report.reachable {
                let rtt = report
                    .avg_rtt_ms
                    .map(|ms| format!(", avg RTT {:.3} ms", ms))
                    .unwrap_or_default();
                println!(
                    "{} is reachable ({}/{} replies{})",
                    report.target, report.received, report.transmitted, rtt
                );
            } else {
                anyhow::bail!("{} is not reachable", report.target);
            }

            let client = Iperf3Client::new(&config.iperf3, &config.target.host, runner.clone())?;
            let server = check_server(&client)?;
            match (&server.trial, &server.error) {
                (Some(trial), _) => println!("iperf3 server is answering: {}", format_trial(trial)),
                (None, error) => anyhow::bail!(
                    "no iperf3 server answering on {}: {}",
                    config.target.host,
                    error.as_deref().unwrap_or("unknown error")
                ),
            }

            if config.sockperf.enabled {
                let sockperf = SockperfClient::new(&config.sockperf, &config.target.host, runner)?;
                if !sockperf.check_server()? {
                    anyhow::bail!(
                        "no sockperf server answering on {}:{}",
                        config.target.host,
                        config.sockperf.port
                    );
                }
                println!("sockperf server is answering on port {}", config.sockperf.port);
            }
        }
        Commands::Throughput {
            frame_size,
            floor_mbps,
            ceiling_mbps,
            loss_threshold_pct,
            tolerance,
            max_iterations,
            trial_secs,
            json,
        } => {
            let s = &mut config.search;
            if let Some(v) = floor_mbps {
                s.floor_mbps = v;
            }
            if let Some(v) = ceiling_mbps {
                s.ceiling_mbps = v;
            }
            if let Some(v) = loss_threshold_pct {
                s.loss_threshold_pct = v;
            }
            if let Some(v) = tolerance {
                s.tolerance = v;
            }
            if let Some(v) = max_iterations {
                s.max_iterations = v;
            }
            if let Some(v) = trial_secs {
                s.trial_secs = v;
            }

            let params = config.search.to_params();
            params.validate()?;
            let client = Iperf3Client::new(&config.iperf3, &config.target.host, runner)?;
            tracing::info!(host = %config.target.host, frame_size, "running zero-loss throughput search");

            let mut probe = UdpLossProbe::new(&client, frame_size, config.search.trial_secs);
            let outcome = search::search(&params, &mut probe)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("\n=== Zero-Loss Throughput ===");
                println!("{:>4} | {:>12} | {:>10} | Result", "#", "Rate", "Loss %");
                println!("{:-<4}-|-{:-<12}-|-{:-<10}-|-{:-<9}", "", "", "", "");
                for (n, rec) in outcome.trail.iter().enumerate() {
                    println!(
                        "{:>4} | {:>12} | {:>10.4} | {}",
                        n + 1,
                        format_rate(rec.rate),
                        rec.loss.percent(),
                        if rec.sustained { "sustained" } else { "lossy" }
                    );
                }
                println!("\n{}\n", format_search(frame_size, &outcome));
            }
        }
        Commands::FrameLoss {
            frame_size,
            loads,
            trials,
            json,
        } => {
            if !loads.is_empty() {
                config.frame_loss.loads_pct = loads;
            }
            if let Some(t) = trials {
                config.frame_loss.trials = t;
            }
            config.frame_loss.validate()?;
            let client = Iperf3Client::new(&config.iperf3, &config.target.host, runner)?;
            let flr = frame_loss::run(&client, frame_size, config.target.line_rate_mbps, &config.frame_loss)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&flr)?);
            } else {
                println!();
                for trial in flr.loads.iter().flat_map(|p| &p.trials) {
                    println!("  {}", format_trial(trial));
                }
                println!("\n{}", format_frame_loss(&flr));
            }
        }
        Commands::BackToBack {
            frame_size,
            burst_mbps,
            trials,
            json,
        } => {
            if let Some(t) = trials {
                config.back_to_back.trials = t;
            }
            let burst = Rate::from_mbps(
                burst_mbps
                    .or(config.back_to_back.burst_mbps)
                    .unwrap_or(config.target.line_rate_mbps),
            );
            let client = Iperf3Client::new(&config.iperf3, &config.target.host, runner)?;
            let b2b = back_to_back::run(&client, frame_size, burst, &config.back_to_back)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&b2b)?);
            } else {
                println!("\n{}\n", format_back_to_back(&b2b));
            }
        }
        Commands::Latency {
            tool: LatencyTool::Sockperf,
            frame_size,
            json,
            ..
        } => {
            let sizes = if frame_size.is_empty() {
                config.sockperf.msg_sizes.clone()
            } else {
                frame_size
            };
            let client = SockperfClient::new(&config.sockperf, &config.target.host, runner)?;
            let mut results = Vec::with_capacity(sizes.len() + config.sockperf.load_mps.len());
            for size in sizes {
                results.push(client.ping_pong(size)?);
            }
            for &mps in &config.sockperf.load_mps {
                results.push(client.under_load(mps, config.sockperf.load_msg_size)?);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_sockperf_table(&results);
            }
        }
        Commands::Latency {
            tool: LatencyTool::Ping,
            frame_size,
            count,
            json,
        } => {
            if let Some(c) = count {
                config.latency.count = c;
            }
            let sizes = if frame_size.is_empty() {
                config.suite.frame_sizes.clone()
            } else {
                frame_size
            };
            let pinger = Pinger::new(&config.target.host, runner)?;
            let mut results = Vec::with_capacity(sizes.len());
            for size in sizes {
                results.push(pinger.latency(size, &config.latency)?);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_latency_table(&results);
            }
        }
        Commands::Suite {
            output_dir,
            frame_sizes,
            sockperf,
        } => {
            if let Some(dir) = output_dir {
                config.suite.output_dir = dir;
            }
            if !frame_sizes.is_empty() {
                config.suite.frame_sizes = frame_sizes;
            }
            config.sockperf.enabled |= sockperf;
            let dir = ResultsDir::create(&config.suite.output_dir, chrono::Utc::now())?;
            let pinger = Pinger::new(&config.target.host, runner.clone())?;
            let client = Iperf3Client::new(&config.iperf3, &config.target.host, runner.clone())?;
            let sockperf = if config.sockperf.enabled {
                Some(SockperfClient::new(&config.sockperf, &config.target.host, runner)?)
            } else {
                None
            };
            let report = suite::run(
                &config,
                &pinger,
                &client,
                sockperf.as_ref().map(|c| c as &dyn SockperfProber),
                &dir,
            )?;
            print_suite_summary(&report);
            println!("Results saved to {}", dir.path().display());
            if !report.connectivity.reachable {
                anyhow::bail!("{} is not reachable", report.connectivity.target);
            }
        }
    }

    Ok(())
}

fn print_latency_table(results: &[LatencyStats]) {
    println!("\n=== ICMP Latency (ms) ===");
    println!(
        "{:>6} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8} | Loss %",
        "Frame", "Min", "Mean", "Median", "P99", "Max", "Jitter"
    );
    println!("{:-<6}-|-{:-<8}-|-{:-<8}-|-{:-<8}-|-{:-<8}-|-{:-<8}-|-{:-<8}-|-{:-<6}", "", "", "", "", "", "", "", "");
    for r in results {
        println!(
            "{:>6} | {:>8.3} | {:>8.3} | {:>8.3} | {:>8.3} | {:>8.3} | {:>8.3} | {:.2}",
            r.frame_size,
            r.rtt_ms.min,
            r.rtt_ms.mean,
            r.rtt_ms.median,
            r.rtt_ms.p99,
            r.rtt_ms.max,
            r.jitter_ms,
            r.loss_percent
        );
    }
    println!();
}

fn print_sockperf_table(results: &[SockperfLatency]) {
    println!("\n=== sockperf Latency (usec) ===");
    println!(
        "{:>12} | {:>6} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8} | Dropped",
        "Mode", "Size", "Min", "Mean", "Median", "P99", "Max"
    );
    println!("{:-<12}-|-{:-<6}-|-{:-<8}-|-{:-<8}-|-{:-<8}-|-{:-<8}-|-{:-<8}-|-{:-<7}", "", "", "", "", "", "", "", "");
    for r in results {
        let mode = match r.mode {
            LatencyMode::PingPong => "ping-pong".to_string(),
            LatencyMode::UnderLoad { mps } => format!("{} mps", mps),
        };
        let l = &r.latency_usec;
        println!(
            "{:>12} | {:>6} | {:>8.3} | {:>8.3} | {:>8.3} | {:>8.3} | {:>8.3} | {}",
            mode, r.msg_size, l.min, l.mean, l.median, l.p99, l.max, r.dropped
        );
    }
    println!();
}

fn format_sockperf_throughput(t: &SockperfThroughput) -> String {
    let rate = t.mps.map(|m| format!("{} mps", m)).unwrap_or_else(|| "unlimited".to_string());
    format!(
        "{:?} {} B @ {}: {:.0} msg/s, {}",
        t.transport,
        t.msg_size,
        rate,
        t.msg_rate,
        format_rate(Rate::from_mbps(t.mbps))
    )
}

fn print_suite_summary(report: &SuiteReport) {
    println!("\n=== RFC 2544 Summary: {} ===", report.test_info.target);
    if !report.connectivity.reachable {
        println!("Target unreachable, no tests were run.\n");
        return;
    }

    if let Some(server) = report.iperf3_server.as_ref().filter(|s| !s.available) {
        println!(
            "\niperf3 server not answering ({}), throughput tests skipped.",
            server.error.as_deref().unwrap_or("unknown error")
        );
    }

    println!("\nThroughput:");
    for (size, entry) in &report.throughput {
        match entry {
            ThroughputEntry::Found(outcome) => println!(" - {}", format_search(*size, outcome)),
            ThroughputEntry::Failed {
                error,
                last_good_mbps,
                ..
            } => println!(
                " - {} B: FAILED ({}), last sustained {}",
                size,
                error,
                format_rate(Rate::from_mbps(*last_good_mbps))
            ),
        }
    }

    println!("\nLatency:");
    for (size, entry) in &report.latency {
        match entry {
            LatencyEntry::Measured(s) => println!(
                " - {} B: mean {:.3} ms, p99 {:.3} ms, jitter {:.3} ms",
                size, s.rtt_ms.mean, s.rtt_ms.p99, s.jitter_ms
            ),
            LatencyEntry::Failed { error } => println!(" - {} B: FAILED ({})", size, error),
        }
    }

    println!();
    for flr in report.frame_loss.values() {
        println!("{}", format_frame_loss(flr));
    }

    println!("Back-to-back:");
    for b2b in report.back_to_back.values() {
        println!(" - {}", format_back_to_back(b2b));
    }

    if let Some(sp) = &report.sockperf {
        println!("\nsockperf:");
        if !sp.server_available {
            println!(" - server not answering, skipped");
        }
        let latencies = sp.ping_pong.iter().map(|(size, e)| (format!("{} B ping-pong", size), e));
        let loaded = sp.under_load.iter().map(|(mps, e)| (format!("{} mps under load", mps), e));
        for (label, entry) in latencies.chain(loaded) {
            match entry {
                SockperfEntry::Measured(l) => println!(
                    " - {}: mean {:.3} usec, p99 {:.3} usec",
                    label, l.latency_usec.mean, l.latency_usec.p99
                ),
                SockperfEntry::Failed { error } => println!(" - {}: FAILED ({})", label, error),
            }
        }
        for (label, entry) in &sp.throughput {
            match entry {
                SockperfEntry::Measured(t) => println!(" - {}", format_sockperf_throughput(t)),
                SockperfEntry::Failed { error } => println!(" - {}: FAILED ({})", label, error),
            }
        }
    }

    if let Some((size, rate)) = report.best_throughput() {
        println!("\nBest throughput: {} at {} B frames", format_rate(rate), size);
    }
    if let Some((size, ms)) = report.lowest_latency() {
        println!("Lowest latency:  {:.3} ms at {} B frames", ms, size);
    }
    println!();
}
