//! RFC 2544 frame loss rate: loss at a sweep of offered loads.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::iperf::{UdpTrial, UdpTrialResult};
use super::{ProbeError, Rate, UdpGenerator};
use crate::config::FrameLossConfig;

/// Trials at one offered load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPoint {
    pub offered_load_pct: f64,
    pub target_mbps: f64,
    pub trials: Vec<UdpTrialResult>,
    pub failed_trials: u32,
    pub avg_loss_pct: Option<f64>,
    pub min_loss_pct: Option<f64>,
    pub max_loss_pct: Option<f64>,
}

impl LoadPoint {
    fn summarize(offered_load_pct: f64, target_mbps: f64, trials: Vec<UdpTrialResult>, failed_trials: u32) -> Self {
        let losses: Vec<f64> = trials.iter().map(|t| t.loss.percent()).collect();
        Self {
            offered_load_pct,
            target_mbps,
            failed_trials,
            avg_loss_pct: crate::analysis::stats::mean(&losses),
            min_loss_pct: losses.iter().copied().reduce(f64::min),
            max_loss_pct: losses.iter().copied().reduce(f64::max),
            trials,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameLossReport {
    pub frame_size: u32,
    pub line_rate_mbps: f64,
    pub loads: Vec<LoadPoint>,
}

/// Sweep the configured offered loads for one frame size.
///
/// A failed trial is logged and counted but does not stop the sweep; only an
/// interrupted run does.
pub fn run<G: UdpGenerator + ?Sized>(
    generator: &G,
    frame_size: u32,
    line_rate_mbps: f64,
    config: &FrameLossConfig,
) -> Result<FrameLossReport, ProbeError> {
    let pause = Duration::from_millis(config.pause_ms);
    let mut loads = Vec::with_capacity(config.loads_pct.len());

    for &load_pct in &config.loads_pct {
        let target_mbps = line_rate_mbps * load_pct / 100.0;
        info!(frame_size, load_pct, target_mbps, "frame loss: testing offered load");

        let trial = UdpTrial {
            rate: Rate::from_mbps(target_mbps),
            frame_size,
            duration_secs: config.trial_secs,
        };
        let mut results = Vec::with_capacity(config.trials as usize);
        let mut failed = 0;
        for n in 0..config.trials {
            if n > 0 && !pause.is_zero() {
                std::thread::sleep(pause);
            }
            match generator.run_udp(&trial) {
                Ok(r) => results.push(r),
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    warn!(frame_size, load_pct, trial = n + 1, error = %e, "frame loss trial failed");
                    failed += 1;
                }
            }
        }

        let point = LoadPoint::summarize(load_pct, target_mbps, results, failed);
        if let Some(avg) = point.avg_loss_pct {
            info!(frame_size, load_pct, avg_loss_pct = avg, "frame loss: load complete");
        }
        loads.push(point);
    }

    Ok(FrameLossReport {
        frame_size,
        line_rate_mbps,
        loads,
    })
}
