//! TOML configuration for tsnbench.
//!
//! Every section has defaults matching the reference test bed (a 1 GbE
//! client/server pair), so an empty file or no file at all is valid. The
//! file path comes from `--config`, then `TSNBENCH_CONFIG`, then
//! `/etc/tsnbench/tsnbench.toml`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::throughput::search::SearchParams;
use crate::throughput::Rate;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "TSNBENCH_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/tsnbench/tsnbench.toml";

/// RFC 2544 standard Ethernet frame sizes (bytes).
pub const RFC2544_FRAME_SIZES: [u32; 7] = [64, 128, 256, 512, 1024, 1280, 1518];

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub iperf3: Iperf3Config,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub frame_loss: FrameLossConfig,
    #[serde(default)]
    pub back_to_back: BackToBackConfig,
    #[serde(default)]
    pub latency: LatencyConfig,
    #[serde(default)]
    pub sockperf: SockperfConfig,
    #[serde(default)]
    pub suite: SuiteConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BenchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// An explicitly requested file must load; otherwise fall back through
    /// the environment variable, the system path and the defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "TSNBENCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// The device under test / far end of the link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Address of the host running `iperf3 -s`.
    pub host: String,
    /// Local egress interface, recorded with the results.
    pub interface: String,
    /// Nominal line rate; offered loads are percentages of it.
    pub line_rate_mbps: f64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.3".to_string(),
            interface: "enp2s0".to_string(),
            line_rate_mbps: 1000.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Iperf3
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Iperf3Config {
    /// Path (or bare command name resolved via `$PATH`) to the iperf3 binary.
    pub path: String,
    /// Server port; iperf3's own default (5201) when unset.
    pub port: Option<u16>,
    /// CPU list for `taskset -c`, e.g. `"2,3"`. Unpinned when unset.
    pub cpu_affinity: Option<String>,
    /// Extra seconds past the trial duration before the client is killed.
    pub grace_secs: u64,
}

impl Default for Iperf3Config {
    fn default() -> Self {
        Self {
            path: "iperf3".to_string(),
            port: None,
            cpu_affinity: None,
            grace_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Throughput search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub floor_mbps: f64,
    pub ceiling_mbps: f64,
    /// Acceptable loss in percent (0.001 = 0.001 %).
    pub loss_threshold_pct: f64,
    /// Relative interval width at which the search stops.
    pub tolerance: f64,
    pub max_iterations: u32,
    /// Duration of every probe in one search.
    pub trial_secs: u32,
    pub probe_ceiling_first: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            floor_mbps: 1.0,
            ceiling_mbps: 1000.0,
            loss_threshold_pct: 0.001,
            tolerance: 0.01,
            max_iterations: 20,
            trial_secs: 10,
            probe_ceiling_first: true,
        }
    }
}

impl SearchConfig {
    pub fn to_params(&self) -> SearchParams {
        SearchParams {
            floor: Rate::from_mbps(self.floor_mbps),
            ceiling: Rate::from_mbps(self.ceiling_mbps),
            loss_threshold: self.loss_threshold_pct / 100.0,
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
            probe_ceiling_first: self.probe_ceiling_first,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame loss / back-to-back
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameLossConfig {
    /// Offered loads as percentages of the line rate.
    pub loads_pct: Vec<f64>,
    pub trials: u32,
    pub trial_secs: u32,
    /// Pause between consecutive trials.
    pub pause_ms: u64,
}

impl Default for FrameLossConfig {
    fn default() -> Self {
        Self {
            loads_pct: vec![50.0, 75.0, 90.0, 95.0, 98.0, 100.0],
            trials: 3,
            trial_secs: 2,
            pause_ms: 1000,
        }
    }
}

impl FrameLossConfig {
    /// Every load must be a positive, finite percentage; a zero rate makes
    /// iperf3 send unthrottled.
    pub fn validate(&self) -> Result<()> {
        if self.loads_pct.is_empty() {
            bail!("frame loss needs at least one offered load");
        }
        if let Some(bad) = self.loads_pct.iter().find(|l| !l.is_finite() || **l <= 0.0) {
            bail!("offered load must be a positive percentage, got {}", bad);
        }
        if self.trials == 0 {
            bail!("frame loss needs at least one trial per load");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackToBackConfig {
    /// Burst rate; the line rate when unset.
    pub burst_mbps: Option<f64>,
    pub trials: u32,
    pub trial_secs: u32,
    pub pause_ms: u64,
}

impl Default for BackToBackConfig {
    fn default() -> Self {
        Self {
            burst_mbps: None,
            trials: 3,
            trial_secs: 2,
            pause_ms: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Latency
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Echo requests per frame size.
    pub count: u32,
    /// Seconds between requests (`ping -i`).
    pub interval_secs: f64,
    /// Per-reply wait (`ping -W`).
    pub reply_timeout_secs: u32,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            count: 1000,
            interval_secs: 0.01,
            reply_timeout_secs: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// sockperf
// ---------------------------------------------------------------------------

/// sockperf client settings. The target must run `sockperf sr` on `port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SockperfConfig {
    /// Run the sockperf phase as part of the suite.
    pub enabled: bool,
    pub path: String,
    pub port: u16,
    /// Seconds per sockperf run (`-t`).
    pub duration_secs: u32,
    /// Ping-pong message sizes (bytes).
    pub msg_sizes: Vec<u32>,
    /// Message rates for the latency-under-load runs (`ul --mps`).
    pub load_mps: Vec<u32>,
    pub load_msg_size: u32,
    /// Message rates for the UDP throughput runs (`tp --udp --mps`).
    pub udp_mps: Vec<u32>,
    pub udp_msg_size: u32,
    /// Extra seconds past `duration_secs` before the client is killed.
    pub grace_secs: u64,
}

impl Default for SockperfConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "sockperf".to_string(),
            port: 11111,
            duration_secs: 10,
            msg_sizes: vec![64, 256, 512, 1024, 1472],
            load_mps: vec![50_000, 100_000, 150_000],
            load_msg_size: 1024,
            udp_mps: vec![10_000, 50_000, 100_000],
            udp_msg_size: 1472,
            grace_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Suite
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    pub frame_sizes: Vec<u32>,
    /// Parent of the timestamped results directory.
    pub output_dir: PathBuf,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            frame_sizes: RFC2544_FRAME_SIZES.to_vec(),
            output_dir: PathBuf::from("."),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable logs.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
