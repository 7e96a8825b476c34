//! Throughput result formatting for the console.

use super::back_to_back::BackToBackReport;
use super::frame_loss::FrameLossReport;
use super::iperf::UdpTrialResult;
use super::search::{SearchOutcome, Termination};
use super::Rate;

/// Human-readable rate: Gbps from 1000 Mbps upward, Mbps below.
pub fn format_rate(rate: Rate) -> String {
    let mbps = rate.mbps();
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

/// One-line summary of a UDP trial.
pub fn format_trial(result: &UdpTrialResult) -> String {
    let mut summary = format!(
        "{} B @ {}: achieved {}, {} packets, {} lost ({:.3}%)",
        result.frame_size,
        format_rate(Rate::from_mbps(result.target_mbps)),
        format_rate(Rate::from_mbps(result.achieved_mbps)),
        result.packets,
        result.lost_packets,
        result.loss.percent(),
    );
    if let Some(jitter) = result.jitter_ms {
        summary.push_str(&format!(", jitter: {:.3}ms", jitter));
    }
    summary
}

pub fn format_search(frame_size: u32, outcome: &SearchOutcome) -> String {
    let how = match outcome.termination {
        Termination::CeilingSustained => "ceiling loss-free".to_string(),
        Termination::Tolerance => format!("converged in {} iterations", outcome.iterations),
        Termination::IterationCap => format!(
            "iteration cap ({}) reached, interval {:.2}% wide",
            outcome.iterations,
            outcome.relative_width() * 100.0
        ),
    };
    format!(
        "{} B: zero-loss throughput {} ({}, {} probe{})",
        frame_size,
        format_rate(outcome.rate),
        how,
        outcome.trail.len(),
        if outcome.trail.len() == 1 { "" } else { "s" },
    )
}

/// Table of loss per offered load.
pub fn format_frame_loss(report: &FrameLossReport) -> String {
    let mut out = format!(
        "Frame loss, {} B frames (line rate {}):\n",
        report.frame_size,
        format_rate(Rate::from_mbps(report.line_rate_mbps))
    );
    out.push_str(&format!(
        "{:>8} | {:>12} | {:>10} | {:>10} | {:>10} | Failed\n",
        "Load %", "Target", "Avg loss %", "Min loss %", "Max loss %"
    ));
    out.push_str(&format!("{:-<8}-|-{:-<12}-|-{:-<10}-|-{:-<10}-|-{:-<10}-|-{:-<6}\n", "", "", "", "", "", ""));
    for p in &report.loads {
        let cell = |v: Option<f64>| v.map(|v| format!("{:.3}", v)).unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:>8.1} | {:>12} | {:>10} | {:>10} | {:>10} | {}\n",
            p.offered_load_pct,
            format_rate(Rate::from_mbps(p.target_mbps)),
            cell(p.avg_loss_pct),
            cell(p.min_loss_pct),
            cell(p.max_loss_pct),
            p.failed_trials,
        ));
    }
    out
}

pub fn format_back_to_back(report: &BackToBackReport) -> String {
    match report.max_burst_frames {
        Some(frames) => format!(
            "{} B: max burst {} frames at {} (avg {:.1}, std dev {:.1}, worst loss {:.3}%, {} failed)",
            report.frame_size,
            frames,
            format_rate(Rate::from_mbps(report.burst_mbps)),
            report.avg_burst_frames.unwrap_or(0.0),
            report.std_dev_burst_frames,
            report.worst_loss_pct.unwrap_or(0.0),
            report.failed_trials,
        ),
        None => format!(
            "{} B: no successful back-to-back trials ({} failed)",
            report.frame_size, report.failed_trials
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throughput::frame_loss::LoadPoint;
    use crate::throughput::search::ProbeRecord;
    use crate::throughput::LossFraction;

    fn trial(target_mbps: f64, achieved_mbps: f64, jitter_ms: Option<f64>) -> UdpTrialResult {
        UdpTrialResult {
            frame_size: 1518,
            target_mbps,
            achieved_mbps,
            packets: 10_000,
            lost_packets: 1,
            loss: LossFraction::from_counts(10_000, 1).unwrap(),
            jitter_ms,
            duration_secs: 10.0,
        }
    }

    #[test]
    fn test_format_rate_gbps_and_mbps() {
        assert_eq!(format_rate(Rate::from_mbps(9412.0)), "9.41 Gbps");
        assert_eq!(format_rate(Rate::from_mbps(245.3)), "245.3 Mbps");
        assert_eq!(format_rate(Rate::from_mbps(1000.0)), "1.00 Gbps");
    }

    #[test]
    fn test_format_trial() {
        let s = format_trial(&trial(500.0, 499.9, Some(0.05)));
        assert!(s.contains("1518 B @ 500.0 Mbps"));
        assert!(s.contains("1 lost (0.010%)"));
        assert!(s.contains("jitter: 0.050ms"));

        let s = format_trial(&trial(2500.0, 2400.0, None));
        assert!(s.contains("2.50 Gbps"));
        assert!(!s.contains("jitter"));
    }

    #[test]
    fn test_format_search() {
        let rec = ProbeRecord {
            rate: Rate::from_mbps(1000.0),
            loss: LossFraction::ZERO,
            sustained: true,
            low: Rate::from_mbps(1000.0),
            high: Rate::from_mbps(1000.0),
        };
        let outcome = SearchOutcome {
            rate: Rate::from_mbps(1000.0),
            low: Rate::from_mbps(1000.0),
            high: Rate::from_mbps(1000.0),
            iterations: 0,
            termination: Termination::CeilingSustained,
            trail: vec![rec],
        };
        let s = format_search(64, &outcome);
        assert_eq!(s, "64 B: zero-loss throughput 1.00 Gbps (ceiling loss-free, 1 probe)");
    }

    #[test]
    fn test_format_frame_loss_marks_missing_cells() {
        let report = FrameLossReport {
            frame_size: 64,
            line_rate_mbps: 1000.0,
            loads: vec![LoadPoint {
                offered_load_pct: 50.0,
                target_mbps: 500.0,
                trials: vec![],
                failed_trials: 3,
                avg_loss_pct: None,
                min_loss_pct: None,
                max_loss_pct: None,
            }],
        };
        let table = format_frame_loss(&report);
        assert!(table.starts_with("Frame loss, 64 B frames (line rate 1.00 Gbps):"));
        assert!(table.lines().nth(3).unwrap().contains("- |"));
        assert!(table.trim_end().ends_with('3'));
    }
}
