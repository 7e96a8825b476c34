use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::analysis::stats::{self, Summary};
use crate::config::LatencyConfig;
use crate::system::process::{ExecError, Runner};
use crate::throughput::{validate_target, ProbeError};

/// ICMP echo header; subtracted from the frame size to get `ping -s`.
const ICMP_HEADER_BYTES: u32 = 8;

#[derive(Debug, Error)]
pub enum IcmpError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    InvalidTarget(#[from] ProbeError),

    #[error("ping exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    #[error("no echo replies from {target} ({transmitted} requests sent)")]
    NoReplies { target: String, transmitted: u32 },
}

impl IcmpError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, IcmpError::Exec(ExecError::Cancelled { .. }))
    }
}

/// Counters and RTT samples scraped from `ping` output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingOutput {
    pub transmitted: u32,
    pub received: u32,
    pub loss_percent: Option<f64>,
    pub rtts_ms: Vec<f64>,
    /// Average from the trailing `rtt min/avg/max/mdev` line.
    pub summary_avg_ms: Option<f64>,
}

pub fn parse_ping_output(output: &str) -> PingOutput {
    let mut parsed = PingOutput::default();

    for line in output.lines() {
        if let Some(rtt) = extract_reply_rtt(line) {
            parsed.rtts_ms.push(rtt);
        } else if line.contains("packets transmitted") {
            // 10 packets transmitted, 9 received, +1 errors, 10% packet loss, time 9012ms
            for part in line.split(',') {
                let part = part.trim();
                let leading = part.split_whitespace().next();
                if part.ends_with("packets transmitted") {
                    parsed.transmitted = leading.and_then(|n| n.parse().ok()).unwrap_or(0);
                } else if part.ends_with("received") {
                    parsed.received = leading.and_then(|n| n.parse().ok()).unwrap_or(0);
                } else if part.ends_with("packet loss") {
                    parsed.loss_percent = leading
                        .map(|n| n.trim_end_matches('%'))
                        .and_then(|n| n.parse().ok());
                }
            }
        } else if let Some(pos) = line.find(" = ") {
            // rtt min/avg/max/mdev = 0.041/0.052/0.101/0.009 ms
            if line[..pos].contains("rtt") || line[..pos].contains("round-trip") {
                let parts: Vec<&str> = line[pos + 3..].split('/').collect();
                if parts.len() >= 2 {
                    parsed.summary_avg_ms = parts[1].trim().parse().ok();
                }
            }
        }
    }

    parsed
}

/// RTT from a reply line: `64 bytes from 10.0.0.2: icmp_seq=1 ttl=64 time=0.045 ms`.
fn extract_reply_rtt(line: &str) -> Option<f64> {
    let pos = line.find("time=")?;
    let rest = &line[pos + 5..];
    let end = rest.find(|c: char| c.is_whitespace()).unwrap_or(rest.len());
    rest[..end].parse::<f64>().ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub target: String,
    pub reachable: bool,
    pub transmitted: u32,
    pub received: u32,
    pub avg_rtt_ms: Option<f64>,
}

/// Round-trip latency for one frame size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub frame_size: u32,
    pub transmitted: u32,
    pub received: u32,
    pub loss_percent: f64,
    pub rtt_ms: Summary,
    /// Standard deviation of the RTT samples.
    pub jitter_ms: f64,
}

/// Reachability and latency measurement against one target.
pub trait IcmpProber {
    fn check_connectivity(&self) -> Result<ConnectivityReport, IcmpError>;
    fn latency(&self, frame_size: u32, config: &LatencyConfig) -> Result<LatencyStats, IcmpError>;
}

/// `ping` wrapper bound to one target.
#[derive(Debug, Clone)]
pub struct Pinger {
    runner: Runner,
    target: String,
}

impl Pinger {
    pub fn new(target: &str, runner: Runner) -> Result<Self, IcmpError> {
        validate_target(target)?;
        Ok(Self {
            runner,
            target: target.to_string(),
        })
    }

    pub fn latency_args(&self, frame_size: u32, config: &LatencyConfig) -> Vec<String> {
        vec![
            "-c".to_string(),
            config.count.to_string(),
            "-s".to_string(),
            frame_size.saturating_sub(ICMP_HEADER_BYTES).to_string(),
            "-i".to_string(),
            config.interval_secs.to_string(),
            "-W".to_string(),
            config.reply_timeout_secs.to_string(),
            self.target.clone(),
        ]
    }
}

impl IcmpProber for Pinger {
    /// Three echo requests, two-second reply wait.
    fn check_connectivity(&self) -> Result<ConnectivityReport, IcmpError> {
        let args = vec![
            "-c".to_string(),
            "3".to_string(),
            "-W".to_string(),
            "2".to_string(),
            self.target.clone(),
        ];
        let output = self.runner.run("ping", &args, Duration::from_secs(15))?;
        let parsed = parse_ping_output(&String::from_utf8_lossy(&output.stdout));
        let reachable = output.status.success();

        if reachable {
            info!(host = %self.target, received = parsed.received, "target reachable");
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(host = %self.target, stderr = %stderr.trim(), "target unreachable");
        }

        Ok(ConnectivityReport {
            target: self.target.clone(),
            reachable,
            transmitted: parsed.transmitted,
            received: parsed.received,
            avg_rtt_ms: parsed.summary_avg_ms.or_else(|| stats::mean(&parsed.rtts_ms)),
        })
    }

    /// Send `config.count` echo requests sized to `frame_size` and summarize
    /// the round-trip times.
    fn latency(&self, frame_size: u32, config: &LatencyConfig) -> Result<LatencyStats, IcmpError> {
        let args = self.latency_args(frame_size, config);
        let deadline = Duration::from_secs_f64(
            config.count as f64 * config.interval_secs.max(0.0) + config.reply_timeout_secs as f64 + 5.0,
        );
        info!(host = %self.target, frame_size, count = config.count, "measuring ICMP latency");

        let output = self.runner.run("ping", &args, deadline)?;
        if output.status.code() == Some(2) {
            return Err(IcmpError::Failed {
                code: 2,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let parsed = parse_ping_output(&String::from_utf8_lossy(&output.stdout));
        let rtt_ms = Summary::from_samples(&parsed.rtts_ms).ok_or_else(|| IcmpError::NoReplies {
            target: self.target.clone(),
            transmitted: parsed.transmitted,
        })?;

        let loss_percent = parsed.loss_percent.unwrap_or_else(|| {
            if parsed.transmitted == 0 {
                0.0
            } else {
                100.0 * (parsed.transmitted.saturating_sub(parsed.received)) as f64 / parsed.transmitted as f64
            }
        });

        info!(
            frame_size,
            avg_ms = rtt_ms.mean,
            p99_ms = rtt_ms.p99,
            jitter_ms = rtt_ms.std_dev,
            "latency measured"
        );

        Ok(LatencyStats {
            frame_size,
            transmitted: parsed.transmitted,
            received: parsed.received,
            loss_percent,
            jitter_ms: rtt_ms.std_dev,
            rtt_ms,
        })
    }
}
