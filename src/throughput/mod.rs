//! Throughput testing engine: zero-loss search, iperf3 UDP trials, frame loss
//! and back-to-back sweeps.

pub mod back_to_back;
pub mod frame_loss;
pub mod iperf;
pub mod report;
pub mod search;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use iperf::{UdpTrial, UdpTrialResult};

/// Offered load in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rate(f64);

impl Rate {
    pub fn from_bps(bps: f64) -> Self {
        Self(bps)
    }

    pub fn from_mbps(mbps: f64) -> Self {
        Self(mbps * 1_000_000.0)
    }

    pub fn bps(self) -> f64 {
        self.0
    }

    pub fn mbps(self) -> f64 {
        self.0 / 1_000_000.0
    }

    /// Midpoint between two rates.
    pub fn midpoint(self, other: Rate) -> Rate {
        Rate((self.0 + other.0) / 2.0)
    }
}

impl std::fmt::Display for Rate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&report::format_rate(*self))
    }
}

/// Fraction of packets lost during one trial, in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LossFraction(f64);

impl LossFraction {
    pub const ZERO: LossFraction = LossFraction(0.0);

    /// Clamps into `[0, 1]`; NaN becomes total loss.
    pub fn new(fraction: f64) -> Self {
        if fraction.is_nan() {
            return Self(1.0);
        }
        Self(fraction.clamp(0.0, 1.0))
    }

    /// Loss computed from packet counters. `None` when nothing was sent.
    pub fn from_counts(sent: u64, lost: u64) -> Option<Self> {
        if sent == 0 {
            return None;
        }
        Some(Self::new(lost as f64 / sent as f64))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn percent(self) -> f64 {
        self.0 * 100.0
    }
}

/// Why a traffic generator could not produce a loss figure.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("iperf3 not found at {path}")]
    Iperf3NotFound { path: String },

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("iperf3 process exited with code {code}: {stderr}")]
    Iperf3Failed { code: i32, stderr: String },

    #[error("iperf3 reported an error: {0}")]
    Reported(String),

    #[error("generator did not finish within {secs}s")]
    Timeout { secs: u64 },

    #[error("malformed generator output: {0}")]
    Malformed(String),

    #[error("generator sent no packets")]
    NoTraffic,

    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: &'static str },

    #[error("rate {bps} bps rounds to zero; iperf3 would treat it as unlimited")]
    ZeroRate { bps: f64 },

    #[error("run interrupted")]
    Interrupted,
}

impl ProbeError {
    /// The run is being shut down; callers stop instead of moving on to the
    /// next trial.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ProbeError::Interrupted)
    }
}

/// The `measure(rate) -> loss` capability the zero-loss search runs against.
///
/// Implementations block for the whole probe duration and return once the
/// generator has reported.
pub trait LossProbe {
    fn measure(&mut self, rate: Rate) -> Result<LossFraction, ProbeError>;
}

impl<F> LossProbe for F
where
    F: FnMut(Rate) -> Result<LossFraction, ProbeError>,
{
    fn measure(&mut self, rate: Rate) -> Result<LossFraction, ProbeError> {
        self(rate)
    }
}

/// Anything that can run a fixed-rate UDP trial and count what got lost.
pub trait UdpGenerator {
    fn run_udp(&self, trial: &UdpTrial) -> Result<UdpTrialResult, ProbeError>;
}

/// Reject targets that could be interpreted as command-line flags or that
/// carry shell metacharacters.
pub fn validate_target(target: &str) -> Result<(), ProbeError> {
    let invalid = |reason| ProbeError::InvalidTarget {
        target: target.to_string(),
        reason,
    };
    if target.is_empty() {
        return Err(invalid("target cannot be empty"));
    }
    if target.starts_with('-') {
        return Err(invalid("target cannot start with a hyphen"));
    }
    // Alphanumeric, dot, hyphen, colon (IPv6)
    if target
        .chars()
        .any(|c| !c.is_alphanumeric() && c != '.' && c != '-' && c != ':')
    {
        return Err(invalid("target contains invalid characters"));
    }
    Ok(())
}
