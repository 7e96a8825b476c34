//! iperf3 process wrapper -- spawn UDP trials, parse JSON output, enforce
//! deadlines.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{validate_target, LossFraction, LossProbe, ProbeError, Rate, UdpGenerator};
use crate::config::Iperf3Config;
use crate::system::process::{ExecError, Runner};

/// Parsed iperf3 JSON result (subset of fields we care about).
#[derive(Debug, Deserialize)]
pub struct Iperf3Result {
    #[serde(default)]
    pub start: Option<Iperf3Start>,
    #[serde(default)]
    pub end: Option<Iperf3End>,
    /// Present when iperf3 aborted (`-J` still emits a document).
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3Start {
    /// Missing when iperf3 failed before the test began.
    #[serde(default)]
    pub test_start: Option<Iperf3TestStart>,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3TestStart {
    pub protocol: String,
    pub num_streams: u32,
    #[serde(default)]
    pub blksize: u64,
    pub duration: f64,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3End {
    #[serde(default)]
    pub sum: Option<Iperf3Sum>,
    #[serde(default)]
    pub sum_sent: Option<Iperf3Sum>,
    #[serde(default)]
    pub sum_received: Option<Iperf3Sum>,
}

impl Iperf3End {
    /// UDP totals carrying packet counters. Older iperf3 reports them in
    /// `sum`; newer releases also split them into `sum_received`.
    pub fn udp_totals(&self) -> Option<&Iperf3Sum> {
        [&self.sum, &self.sum_received, &self.sum_sent]
            .into_iter()
            .flatten()
            .find(|s| s.packets.is_some())
    }
}

#[derive(Debug, Deserialize)]
pub struct Iperf3Sum {
    pub bits_per_second: f64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub seconds: Option<f64>,
    #[serde(default)]
    pub jitter_ms: Option<f64>,
    #[serde(default)]
    pub lost_percent: Option<f64>,
    #[serde(default)]
    pub lost_packets: Option<u64>,
    #[serde(default)]
    pub packets: Option<u64>,
}

/// Parse an iperf3 JSON output string into a structured result.
pub fn parse_output(json_str: &str) -> Result<Iperf3Result, ProbeError> {
    serde_json::from_str(json_str).map_err(|e| ProbeError::Malformed(e.to_string()))
}

/// One fixed-rate UDP trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UdpTrial {
    pub rate: Rate,
    /// UDP payload length handed to `-l`.
    pub frame_size: u32,
    pub duration_secs: u32,
}

/// Outcome of a UDP trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpTrialResult {
    pub frame_size: u32,
    pub target_mbps: f64,
    pub achieved_mbps: f64,
    pub packets: u64,
    pub lost_packets: u64,
    pub loss: LossFraction,
    pub jitter_ms: Option<f64>,
    pub duration_secs: f64,
}

impl UdpTrialResult {
    pub fn received_packets(&self) -> u64 {
        self.packets.saturating_sub(self.lost_packets)
    }
}

/// Reduce a parsed iperf3 document to the trial result.
pub fn trial_result(parsed: &Iperf3Result, trial: &UdpTrial) -> Result<UdpTrialResult, ProbeError> {
    if let Some(err) = &parsed.error {
        return Err(ProbeError::Reported(err.clone()));
    }
    let end = parsed
        .end
        .as_ref()
        .ok_or_else(|| ProbeError::Malformed("missing \"end\" section".into()))?;
    let sum = end
        .udp_totals()
        .ok_or_else(|| ProbeError::Malformed("no UDP packet counters in \"end\"".into()))?;

    let packets = sum.packets.unwrap_or(0);
    let lost_packets = sum.lost_packets.unwrap_or(0);
    let loss = LossFraction::from_counts(packets, lost_packets).ok_or(ProbeError::NoTraffic)?;

    Ok(UdpTrialResult {
        frame_size: trial.frame_size,
        target_mbps: trial.rate.mbps(),
        achieved_mbps: sum.bits_per_second / 1_000_000.0,
        packets,
        lost_packets,
        loss,
        jitter_ms: sum.jitter_ms,
        duration_secs: sum.seconds.unwrap_or(trial.duration_secs as f64),
    })
}

/// iperf3 client bound to one server.
#[derive(Debug, Clone)]
pub struct Iperf3Client {
    runner: Runner,
    path: String,
    target: String,
    port: Option<u16>,
    cpu_affinity: Option<String>,
    grace: Duration,
}

impl Iperf3Client {
    pub fn new(config: &Iperf3Config, target: &str, runner: Runner) -> Result<Self, ProbeError> {
        validate_target(target)?;
        Ok(Self {
            runner,
            path: config.path.clone(),
            target: target.to_string(),
            port: config.port,
            cpu_affinity: config.cpu_affinity.clone(),
            grace: Duration::from_secs(config.grace_secs),
        })
    }

    /// Program and arguments for a trial. When CPU pinning is configured the
    /// generator runs under `taskset`.
    pub fn command_line(&self, trial: &UdpTrial) -> (String, Vec<String>) {
        let mut args = vec![
            "-c".to_string(),
            self.target.clone(),
            "-u".to_string(),
            "-b".to_string(),
            format!("{:.0}", trial.rate.bps()),
            "-l".to_string(),
            trial.frame_size.to_string(),
            "-t".to_string(),
            trial.duration_secs.to_string(),
            "-J".to_string(),
        ];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }

        match &self.cpu_affinity {
            Some(cpus) => {
                let mut wrapped = vec!["-c".to_string(), cpus.clone(), self.path.clone()];
                wrapped.extend(args);
                ("taskset".to_string(), wrapped)
            }
            None => (self.path.clone(), args),
        }
    }
}

impl UdpGenerator for Iperf3Client {
    /// Run one UDP trial, blocking until iperf3 exits or the deadline passes.
    fn run_udp(&self, trial: &UdpTrial) -> Result<UdpTrialResult, ProbeError> {
        if trial.rate.bps().round() < 1.0 {
            return Err(ProbeError::ZeroRate {
                bps: trial.rate.bps(),
            });
        }
        let (program, args) = self.command_line(trial);
        let deadline = Duration::from_secs(trial.duration_secs as u64) + self.grace;

        let output = self
            .runner
            .run(&program, &args, deadline)
            .map_err(|e| match e {
                ExecError::NotFound { .. } if self.cpu_affinity.is_none() => ProbeError::Iperf3NotFound {
                    path: self.path.clone(),
                },
                ExecError::NotFound { program } => ProbeError::Spawn {
                    program,
                    source: std::io::ErrorKind::NotFound.into(),
                },
                ExecError::Spawn { program, source } | ExecError::Wait { program, source } => {
                    ProbeError::Spawn { program, source }
                }
                ExecError::Timeout { after, .. } => ProbeError::Timeout {
                    secs: after.as_secs(),
                },
                ExecError::Cancelled { .. } => ProbeError::Interrupted,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            // iperf3 -J reports its own failures as JSON on stdout.
            if let Ok(Iperf3Result { error: Some(err), .. }) = parse_output(&stdout) {
                return Err(ProbeError::Reported(err));
            }
            return Err(ProbeError::Iperf3Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let parsed = parse_output(&stdout)?;
        let result = trial_result(&parsed, trial)?;
        info!(
            host = %self.target,
            frame_size = trial.frame_size,
            target_mbps = result.target_mbps,
            achieved_mbps = result.achieved_mbps,
            packets = result.packets,
            lost = result.lost_packets,
            loss_pct = result.loss.percent(),
            "udp trial complete"
        );
        Ok(result)
    }
}

/// [`LossProbe`] over UDP trials of a fixed frame size and duration.
pub struct UdpLossProbe<'a, G: ?Sized> {
    generator: &'a G,
    frame_size: u32,
    duration_secs: u32,
}

impl<'a, G: UdpGenerator + ?Sized> UdpLossProbe<'a, G> {
    pub fn new(generator: &'a G, frame_size: u32, duration_secs: u32) -> Self {
        Self {
            generator,
            frame_size,
            duration_secs,
        }
    }
}

impl<G: UdpGenerator + ?Sized> LossProbe for UdpLossProbe<'_, G> {
    fn measure(&mut self, rate: Rate) -> Result<LossFraction, ProbeError> {
        let trial = UdpTrial {
            rate,
            frame_size: self.frame_size,
            duration_secs: self.duration_secs,
        };
        self.generator.run_udp(&trial).map(|r| r.loss).map_err(|e| {
            warn!(rate_mbps = rate.mbps(), error = %e, "probe failed");
            e
        })
    }
}

/// Outcome of the short trial that confirms an iperf3 server is answering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCheck {
    pub available: bool,
    pub trial: Option<UdpTrialResult>,
    pub error: Option<String>,
}

/// One-second, 1 Mbps UDP trial against the server. Any failure other than
/// an interrupted run is reported as an unavailable server.
pub fn check_server<G: UdpGenerator + ?Sized>(generator: &G) -> Result<ServerCheck, ProbeError> {
    let trial = UdpTrial {
        rate: Rate::from_mbps(1.0),
        frame_size: 512,
        duration_secs: 1,
    };
    match generator.run_udp(&trial) {
        Ok(result) => {
            info!(achieved_mbps = result.achieved_mbps, "iperf3 server is answering");
            Ok(ServerCheck {
                available: true,
                trial: Some(result),
                error: None,
            })
        }
        Err(e) if e.is_interrupted() => Err(e),
        Err(e) => {
            warn!(error = %e, "iperf3 server check failed");
            Ok(ServerCheck {
                available: false,
                trial: None,
                error: Some(e.to_string()),
            })
        }
    }
}
