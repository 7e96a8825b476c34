//! RFC 2544 back-to-back frames: how many frames a short line-rate burst
//! gets through.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::iperf::UdpTrial;
use super::{ProbeError, Rate, UdpGenerator};
use crate::analysis::stats;
use crate::config::BackToBackConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurstTrial {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_lost: u64,
    pub loss_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackToBackReport {
    pub frame_size: u32,
    pub burst_mbps: f64,
    pub trials: Vec<BurstTrial>,
    pub failed_trials: u32,
    /// Smallest received count across trials.
    pub max_burst_frames: Option<u64>,
    pub avg_burst_frames: Option<f64>,
    pub std_dev_burst_frames: f64,
    pub worst_loss_pct: Option<f64>,
}

pub fn run<G: UdpGenerator + ?Sized>(
    generator: &G,
    frame_size: u32,
    burst_rate: Rate,
    config: &BackToBackConfig,
) -> Result<BackToBackReport, ProbeError> {
    let pause = Duration::from_millis(config.pause_ms);
    let trial = UdpTrial {
        rate: burst_rate,
        frame_size,
        duration_secs: config.trial_secs,
    };
    info!(frame_size, burst_mbps = burst_rate.mbps(), trials = config.trials, "back-to-back: starting");

    let mut trials = Vec::with_capacity(config.trials as usize);
    let mut failed_trials = 0;
    for n in 0..config.trials {
        if n > 0 && !pause.is_zero() {
            std::thread::sleep(pause);
        }
        match generator.run_udp(&trial) {
            Ok(r) => {
                let burst = BurstTrial {
                    frames_sent: r.packets,
                    frames_received: r.received_packets(),
                    frames_lost: r.lost_packets,
                    loss_pct: r.loss.percent(),
                };
                info!(
                    frame_size,
                    trial = n + 1,
                    sent = burst.frames_sent,
                    received = burst.frames_received,
                    lost = burst.frames_lost,
                    "back-to-back trial"
                );
                trials.push(burst);
            }
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => {
                warn!(frame_size, trial = n + 1, error = %e, "back-to-back trial failed");
                failed_trials += 1;
            }
        }
    }

    let received: Vec<f64> = trials.iter().map(|t| t.frames_received as f64).collect();
    Ok(BackToBackReport {
        frame_size,
        burst_mbps: burst_rate.mbps(),
        failed_trials,
        max_burst_frames: trials.iter().map(|t| t.frames_received).min(),
        avg_burst_frames: stats::mean(&received),
        std_dev_burst_frames: stats::std_dev(&received),
        worst_loss_pct: trials.iter().map(|t| t.loss_pct).reduce(f64::max),
        trials,
    })
}
