//! sockperf client -- ping-pong latency, latency under load and throughput
//! against a `sockperf sr` server.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::analysis::stats::Summary;
use crate::config::SockperfConfig;
use crate::system::process::{ExecError, Runner};
use crate::throughput::{validate_target, ProbeError};

#[derive(Debug, Error)]
pub enum SockperfError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    InvalidTarget(#[from] ProbeError),

    #[error("no sockperf server at {target}:{port} (connection refused)")]
    ConnectionRefused { target: String, port: u16 },

    #[error("sockperf exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    #[error("malformed sockperf output: {0}")]
    Malformed(String),
}

impl SockperfError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, SockperfError::Exec(ExecError::Cancelled { .. }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Tcp,
    Udp,
}

/// Which latency run produced a [`SockperfLatency`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LatencyMode {
    PingPong,
    UnderLoad { mps: u32 },
}

/// Statistics scraped from a `sockperf pp` / `sockperf ul` run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyOutput {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub observations: usize,
    pub avg_usec: Option<f64>,
    pub std_dev_usec: Option<f64>,
    pub min_usec: Option<f64>,
    pub max_usec: Option<f64>,
    /// `(percent, usec)` as printed by sockperf.
    pub percentiles: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SockperfLatency {
    #[serde(flatten)]
    pub mode: LatencyMode,
    pub msg_size: u32,
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    /// One-way latency (half the round trip), microseconds.
    pub latency_usec: Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SockperfThroughput {
    pub transport: Transport,
    /// Requested message rate; unlimited when `None`.
    pub mps: Option<u32>,
    pub msg_size: u32,
    pub messages_sent: u64,
    pub msg_rate: f64,
    pub mbps: f64,
}

/// Value following `key=` (spaces after `=` allowed), up to the next
/// separator.
fn value_after(line: &str, key: &str) -> Option<f64> {
    let pos = line.find(key)?;
    let rest = line[pos + key.len()..].trim_start();
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Trailing number after the last `=`.
fn value_after_eq(line: &str) -> Option<f64> {
    line.rsplit('=').next()?.trim().parse().ok()
}

pub fn parse_latency_output(output: &str) -> LatencyOutput {
    let mut parsed = LatencyOutput::default();
    let mut have_valid_duration = false;

    for line in output.lines() {
        if line.contains("[Valid Duration]") || (line.contains("[Total Run]") && !have_valid_duration) {
            have_valid_duration |= line.contains("[Valid Duration]");
            if let Some(v) = value_after(line, "SentMessages=") {
                parsed.sent = v as u64;
            }
            if let Some(v) = value_after(line, "ReceivedMessages=") {
                parsed.received = v as u64;
            }
        } else if line.contains("avg-lat") {
            // ====> avg-latency=30.792 (std-dev=3.111, mean-ad=1.766, ...)
            parsed.avg_usec = line.find("avg-lat").and_then(|pos| {
                let rest = &line[pos..];
                rest.find('=').and_then(|eq| value_after(&rest[eq..], "="))
            });
            parsed.std_dev_usec = value_after(line, "std-dev=");
        } else if line.contains("dropped messages") {
            parsed.dropped = value_after(line, "dropped messages =").unwrap_or(0.0) as u64;
        } else if let Some(pos) = line.find("Total ") {
            if line.contains("observations") {
                let count = line[pos + 6..].split_whitespace().next();
                parsed.observations = count.and_then(|n| n.parse().ok()).unwrap_or(0);
            }
        } else if line.contains("<MAX> observation") {
            parsed.max_usec = value_after_eq(line);
        } else if line.contains("<MIN> observation") {
            parsed.min_usec = value_after_eq(line);
        } else if line.contains("percentile") {
            // ---> percentile 99.900 =   45.391
            let pct = value_after(line, "percentile");
            if let (Some(pct), Some(v)) = (pct, value_after_eq(line)) {
                parsed.percentiles.push((pct, v));
            }
        }
    }

    parsed
}

/// `(messages sent, msg/sec, Mbps)` from `sockperf tp` output.
pub fn parse_throughput_output(output: &str) -> Option<(u64, f64, f64)> {
    let mut sent = None;
    let mut rate = None;
    let mut mbps = None;
    for line in output.lines() {
        if line.contains("Total of") && line.contains("messages sent") {
            sent = value_after(line, "Total of").map(|v| v as u64);
        } else if line.contains("Message Rate is") {
            rate = value_after(line, "Message Rate is");
        } else if line.contains("BandWidth is") {
            // BandWidth is 1192.515 MBps (9540.118 Mbps)
            mbps = line.find('(').and_then(|pos| value_after(&line[pos..], "("));
        }
    }
    Some((sent?, rate?, mbps?))
}

impl LatencyOutput {
    fn into_latency(self, mode: LatencyMode, msg_size: u32) -> Result<SockperfLatency, SockperfError> {
        let missing = |what: &str| SockperfError::Malformed(format!("no {} in latency report", what));
        let avg = self.avg_usec.ok_or_else(|| missing("avg-latency"))?;
        let min = self.min_usec.ok_or_else(|| missing("<MIN> observation"))?;
        let max = self.max_usec.ok_or_else(|| missing("<MAX> observation"))?;
        let count = if self.observations > 0 {
            self.observations
        } else {
            self.received as usize
        };
        let latency_usec = Summary::from_reported(
            count,
            min,
            max,
            avg,
            self.std_dev_usec.unwrap_or(0.0),
            &self.percentiles,
        )
        .ok_or_else(|| missing("observations"))?;

        Ok(SockperfLatency {
            mode,
            msg_size,
            sent: self.sent,
            received: self.received,
            dropped: self.dropped,
            latency_usec,
        })
    }
}

/// Latency and throughput measurement through sockperf.
pub trait SockperfProber {
    /// Short ping-pong run; `Ok(false)` when no server answers.
    fn check_server(&self) -> Result<bool, SockperfError>;
    fn ping_pong(&self, msg_size: u32) -> Result<SockperfLatency, SockperfError>;
    fn under_load(&self, mps: u32, msg_size: u32) -> Result<SockperfLatency, SockperfError>;
    fn throughput(&self, transport: Transport, mps: Option<u32>, msg_size: u32)
        -> Result<SockperfThroughput, SockperfError>;
}

/// `sockperf` wrapper bound to one server.
#[derive(Debug, Clone)]
pub struct SockperfClient {
    runner: Runner,
    path: String,
    target: String,
    port: u16,
    duration_secs: u32,
    grace: Duration,
}

impl SockperfClient {
    pub fn new(config: &SockperfConfig, target: &str, runner: Runner) -> Result<Self, SockperfError> {
        validate_target(target)?;
        Ok(Self {
            runner,
            path: config.path.clone(),
            target: target.to_string(),
            port: config.port,
            duration_secs: config.duration_secs,
            grace: Duration::from_secs(config.grace_secs),
        })
    }

    pub fn args(&self, mode: &str, duration_secs: u32, msg_size: u32) -> Vec<String> {
        vec![
            mode.to_string(),
            "-i".to_string(),
            self.target.clone(),
            "-p".to_string(),
            self.port.to_string(),
            "-t".to_string(),
            duration_secs.to_string(),
            format!("--msg-size={}", msg_size),
        ]
    }

    fn run(&self, args: Vec<String>, duration_secs: u32) -> Result<String, SockperfError> {
        let deadline = Duration::from_secs(duration_secs as u64) + self.grace;
        let output = self.runner.run(&self.path, &args, deadline)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);

        if stdout.to_lowercase().contains("connection refused") || stderr.to_lowercase().contains("connection refused")
        {
            return Err(SockperfError::ConnectionRefused {
                target: self.target.clone(),
                port: self.port,
            });
        }
        if !output.status.success() {
            return Err(SockperfError::Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

impl SockperfProber for SockperfClient {
    fn check_server(&self) -> Result<bool, SockperfError> {
        match self.run(self.args("pp", 1, 64), 1) {
            Ok(_) => Ok(true),
            Err(e) if e.is_interrupted() => Err(e),
            Err(e) => {
                warn!(host = %self.target, port = self.port, error = %e, "sockperf server check failed");
                Ok(false)
            }
        }
    }

    fn ping_pong(&self, msg_size: u32) -> Result<SockperfLatency, SockperfError> {
        info!(host = %self.target, msg_size, "sockperf ping-pong");
        let stdout = self.run(self.args("pp", self.duration_secs, msg_size), self.duration_secs)?;
        parse_latency_output(&stdout).into_latency(LatencyMode::PingPong, msg_size)
    }

    fn under_load(&self, mps: u32, msg_size: u32) -> Result<SockperfLatency, SockperfError> {
        info!(host = %self.target, mps, msg_size, "sockperf latency under load");
        let mut args = self.args("ul", self.duration_secs, msg_size);
        args.push(format!("--mps={}", mps));
        let stdout = self.run(args, self.duration_secs)?;
        parse_latency_output(&stdout).into_latency(LatencyMode::UnderLoad { mps }, msg_size)
    }

    fn throughput(
        &self,
        transport: Transport,
        mps: Option<u32>,
        msg_size: u32,
    ) -> Result<SockperfThroughput, SockperfError> {
        info!(host = %self.target, ?transport, ?mps, msg_size, "sockperf throughput");
        let mut args = self.args("tp", self.duration_secs, msg_size);
        if transport == Transport::Tcp {
            args.push("--tcp".to_string());
        }
        if let Some(mps) = mps {
            args.push(format!("--mps={}", mps));
        }
        let stdout = self.run(args, self.duration_secs)?;
        let (messages_sent, msg_rate, mbps) = parse_throughput_output(&stdout)
            .ok_or_else(|| SockperfError::Malformed("no throughput summary".into()))?;
        Ok(SockperfThroughput {
            transport,
            mps,
            msg_size,
            messages_sent,
            msg_rate,
            mbps,
        })
    }
}
