//! Full RFC 2544 run: connectivity and an iperf3 server check, then
//! throughput, latency, frame loss and back-to-back for every configured
//! frame size, and optionally the sockperf runs.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{BenchConfig, SearchConfig, SockperfConfig};
use crate::probes::sockperf::{SockperfError, SockperfLatency, SockperfProber, SockperfThroughput, Transport};
use crate::probes::{ConnectivityReport, IcmpProber, LatencyStats};
use crate::storage::{self, ResultsDir};
use crate::throughput::back_to_back::{self, BackToBackReport};
use crate::throughput::frame_loss::{self, FrameLossReport};
use crate::throughput::iperf::{check_server, ServerCheck, UdpLossProbe};
use crate::throughput::search::{self, SearchError, SearchOutcome};
use crate::throughput::{Rate, UdpGenerator};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestInfo {
    pub run_id: Uuid,
    pub target: String,
    pub interface: String,
    pub line_rate_mbps: f64,
    pub frame_sizes: Vec<u32>,
    pub load_percentages: Vec<f64>,
    pub search: SearchConfig,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ThroughputEntry {
    Found(SearchOutcome),
    Failed {
        error: String,
        failed_rate_mbps: f64,
        last_good_mbps: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LatencyEntry {
    Measured(LatencyStats),
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SockperfEntry<T> {
    Measured(T),
    Failed { error: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SockperfReport {
    pub server_available: bool,
    /// Keyed by message size.
    pub ping_pong: BTreeMap<u32, SockperfEntry<SockperfLatency>>,
    /// Keyed by message rate.
    pub under_load: BTreeMap<u32, SockperfEntry<SockperfLatency>>,
    /// `tcp`, then `udp_<mps>` per configured rate.
    pub throughput: BTreeMap<String, SockperfEntry<SockperfThroughput>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub test_info: TestInfo,
    pub connectivity: ConnectivityReport,
    /// `None` when the target was unreachable and no check was made.
    pub iperf3_server: Option<ServerCheck>,
    pub throughput: BTreeMap<u32, ThroughputEntry>,
    pub latency: BTreeMap<u32, LatencyEntry>,
    pub frame_loss: BTreeMap<u32, FrameLossReport>,
    pub back_to_back: BTreeMap<u32, BackToBackReport>,
    pub sockperf: Option<SockperfReport>,
}

impl SuiteReport {
    /// Frame size with the highest zero-loss rate.
    pub fn best_throughput(&self) -> Option<(u32, Rate)> {
        self.throughput
            .iter()
            .filter_map(|(size, entry)| match entry {
                ThroughputEntry::Found(o) => Some((*size, o.rate)),
                ThroughputEntry::Failed { .. } => None,
            })
            .max_by(|a, b| a.1.bps().total_cmp(&b.1.bps()))
    }

    /// Frame size with the lowest mean RTT.
    pub fn lowest_latency(&self) -> Option<(u32, f64)> {
        self.latency
            .iter()
            .filter_map(|(size, entry)| match entry {
                LatencyEntry::Measured(s) => Some((*size, s.rtt_ms.mean)),
                LatencyEntry::Failed { .. } => None,
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

fn sockperf_entry<T>(run: &str, result: Result<T, SockperfError>) -> Result<SockperfEntry<T>> {
    match result {
        Ok(v) => Ok(SockperfEntry::Measured(v)),
        Err(e) if e.is_interrupted() => Err(e.into()),
        Err(e) => {
            warn!(run, error = %e, "sockperf run failed");
            Ok(SockperfEntry::Failed { error: e.to_string() })
        }
    }
}

fn run_sockperf(
    client: &dyn SockperfProber,
    config: &SockperfConfig,
    report: &mut SuiteReport,
    dir: &ResultsDir,
) -> Result<()> {
    let mut sp = SockperfReport {
        server_available: client.check_server()?,
        ..SockperfReport::default()
    };
    if !sp.server_available {
        warn!("no sockperf server answering, skipping sockperf runs");
        dir.write_json(storage::SOCKPERF_FILE, &sp)?;
        report.sockperf = Some(sp);
        return Ok(());
    }

    for &msg_size in &config.msg_sizes {
        let entry = sockperf_entry("ping-pong", client.ping_pong(msg_size))?;
        sp.ping_pong.insert(msg_size, entry);
        dir.write_json(storage::SOCKPERF_FILE, &sp)?;
    }
    for &mps in &config.load_mps {
        let entry = sockperf_entry("under-load", client.under_load(mps, config.load_msg_size))?;
        sp.under_load.insert(mps, entry);
        dir.write_json(storage::SOCKPERF_FILE, &sp)?;
    }

    let entry = sockperf_entry("tcp throughput", client.throughput(Transport::Tcp, None, config.udp_msg_size))?;
    sp.throughput.insert("tcp".to_string(), entry);
    for &mps in &config.udp_mps {
        let result = client.throughput(Transport::Udp, Some(mps), config.udp_msg_size);
        sp.throughput.insert(format!("udp_{}", mps), sockperf_entry("udp throughput", result)?);
        dir.write_json(storage::SOCKPERF_FILE, &sp)?;
    }
    dir.write_json(storage::SOCKPERF_FILE, &sp)?;

    report.sockperf = Some(sp);
    Ok(())
}

/// Run the suite, persisting each phase into `dir` as soon as it completes.
///
/// Per-frame-size failures are recorded in the report. Configuration
/// errors, a failing `ping` invocation, result I/O and an interrupted run
/// abort it. Without a responding iperf3 server the iperf3 phases are
/// skipped; latency and sockperf still run.
pub fn run<P, G>(
    config: &BenchConfig,
    pinger: &P,
    generator: &G,
    sockperf: Option<&dyn SockperfProber>,
    dir: &ResultsDir,
) -> Result<SuiteReport>
where
    P: IcmpProber + ?Sized,
    G: UdpGenerator + ?Sized,
{
    let params = config.search.to_params();
    params.validate()?;
    config.frame_loss.validate()?;

    let frame_sizes = &config.suite.frame_sizes;
    let line_rate = config.target.line_rate_mbps;
    info!(
        host = %config.target.host,
        results = %dir.path().display(),
        ?frame_sizes,
        "starting RFC 2544 suite"
    );

    let connectivity = pinger.check_connectivity()?;
    let mut report = SuiteReport {
        test_info: TestInfo {
            run_id: Uuid::new_v4(),
            target: config.target.host.clone(),
            interface: config.target.interface.clone(),
            line_rate_mbps: line_rate,
            frame_sizes: frame_sizes.clone(),
            load_percentages: config.frame_loss.loads_pct.clone(),
            search: config.search.clone(),
            started_at: Utc::now(),
            finished_at: None,
        },
        connectivity,
        iperf3_server: None,
        throughput: BTreeMap::new(),
        latency: BTreeMap::new(),
        frame_loss: BTreeMap::new(),
        back_to_back: BTreeMap::new(),
        sockperf: None,
    };

    if !report.connectivity.reachable {
        warn!(host = %config.target.host, "target unreachable, skipping all tests");
        report.test_info.finished_at = Some(Utc::now());
        dir.write_json(storage::RESULTS_FILE, &report)?;
        return Ok(report);
    }

    let server = check_server(generator)?;
    let iperf3_up = server.available;
    report.iperf3_server = Some(server);
    if !iperf3_up {
        warn!(host = %config.target.host, "no iperf3 server answering, skipping throughput, frame loss and back-to-back");
    }

    info!("[1/5] throughput");
    for &frame_size in frame_sizes.iter().filter(|_| iperf3_up) {
        let mut probe = UdpLossProbe::new(generator, frame_size, config.search.trial_secs);
        let entry = match search::search(&params, &mut probe) {
            Ok(outcome) => ThroughputEntry::Found(outcome),
            Err(SearchError::ProbeFailure {
                rate,
                last_good,
                source,
            }) if !source.is_interrupted() => {
                error!(frame_size, rate_mbps = rate.mbps(), error = %source, "throughput search aborted");
                ThroughputEntry::Failed {
                    error: source.to_string(),
                    failed_rate_mbps: rate.mbps(),
                    last_good_mbps: last_good.mbps(),
                }
            }
            Err(e) => return Err(e.into()),
        };
        report.throughput.insert(frame_size, entry);
        dir.write_json(storage::THROUGHPUT_FILE, &report.throughput)?;
    }

    info!("[2/5] latency");
    for &frame_size in frame_sizes {
        let entry = match pinger.latency(frame_size, &config.latency) {
            Ok(stats) => LatencyEntry::Measured(stats),
            Err(e) if e.is_interrupted() => return Err(e.into()),
            Err(e) => {
                warn!(frame_size, error = %e, "latency test failed");
                LatencyEntry::Failed { error: e.to_string() }
            }
        };
        report.latency.insert(frame_size, entry);
        dir.write_json(storage::LATENCY_FILE, &report.latency)?;
    }

    info!("[3/5] frame loss");
    for &frame_size in frame_sizes.iter().filter(|_| iperf3_up) {
        let flr = frame_loss::run(generator, frame_size, line_rate, &config.frame_loss)?;
        report.frame_loss.insert(frame_size, flr);
        dir.write_json(storage::FRAME_LOSS_FILE, &report.frame_loss)?;
    }

    info!("[4/5] back-to-back");
    let burst_rate = Rate::from_mbps(config.back_to_back.burst_mbps.unwrap_or(line_rate));
    for &frame_size in frame_sizes.iter().filter(|_| iperf3_up) {
        let b2b = back_to_back::run(generator, frame_size, burst_rate, &config.back_to_back)?;
        report.back_to_back.insert(frame_size, b2b);
        dir.write_json(storage::BACK_TO_BACK_FILE, &report.back_to_back)?;
    }

    if let Some(client) = sockperf {
        info!("[5/5] sockperf");
        run_sockperf(client, &config.sockperf, &mut report, dir)?;
    }

    report.test_info.finished_at = Some(Utc::now());
    dir.write_json(storage::RESULTS_FILE, &report)?;
    info!(results = %dir.path().display(), "suite completed");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::stats::Summary;
    use crate::config::LatencyConfig;
    use crate::probes::sockperf::LatencyMode;
    use crate::probes::IcmpError;
    use crate::throughput::iperf::{UdpTrial, UdpTrialResult};
    use crate::throughput::{LossFraction, ProbeError};
    use std::cell::Cell;

    struct FakePinger {
        reachable: bool,
    }

    impl IcmpProber for FakePinger {
        fn check_connectivity(&self) -> Result<ConnectivityReport, IcmpError> {
            Ok(ConnectivityReport {
                target: "192.168.1.3".into(),
                reachable: self.reachable,
                transmitted: 3,
                received: if self.reachable { 3 } else { 0 },
                avg_rtt_ms: None,
            })
        }

        fn latency(&self, frame_size: u32, _config: &LatencyConfig) -> Result<LatencyStats, IcmpError> {
            if frame_size == 1518 {
                return Err(IcmpError::NoReplies {
                    target: "192.168.1.3".into(),
                    transmitted: 10,
                });
            }
            let base = frame_size as f64 / 1000.0;
            let rtt_ms = Summary::from_samples(&[base, base + 0.1, base + 0.2]).unwrap();
            Ok(LatencyStats {
                frame_size,
                transmitted: 3,
                received: 3,
                loss_percent: 0.0,
                jitter_ms: rtt_ms.std_dev,
                rtt_ms,
            })
        }
    }

    /// Loss-free up to a per-frame-size knee; frame size 128 cannot reach
    /// the server at all.
    struct FakeLink {
        calls: Cell<u32>,
    }

    impl UdpGenerator for FakeLink {
        fn run_udp(&self, trial: &UdpTrial) -> Result<UdpTrialResult, ProbeError> {
            self.calls.set(self.calls.get() + 1);
            if trial.frame_size == 128 {
                return Err(ProbeError::Reported("unable to connect to server".into()));
            }
            let knee = if trial.frame_size == 64 { 400.0 } else { 950.0 };
            let lost = if trial.rate.mbps() <= knee { 0 } else { 100 };
            Ok(UdpTrialResult {
                frame_size: trial.frame_size,
                target_mbps: trial.rate.mbps(),
                achieved_mbps: trial.rate.mbps(),
                packets: 10_000,
                lost_packets: lost,
                loss: LossFraction::from_counts(10_000, lost).unwrap(),
                jitter_ms: Some(0.01),
                duration_secs: trial.duration_secs as f64,
            })
        }
    }

    fn clean_trial(trial: &UdpTrial) -> UdpTrialResult {
        UdpTrialResult {
            frame_size: trial.frame_size,
            target_mbps: trial.rate.mbps(),
            achieved_mbps: trial.rate.mbps(),
            packets: 100,
            lost_packets: 0,
            loss: LossFraction::from_counts(100, 0).unwrap(),
            jitter_ms: None,
            duration_secs: trial.duration_secs as f64,
        }
    }

    /// No iperf3 server listening.
    struct NoServer {
        calls: Cell<u32>,
    }

    impl UdpGenerator for NoServer {
        fn run_udp(&self, _trial: &UdpTrial) -> Result<UdpTrialResult, ProbeError> {
            self.calls.set(self.calls.get() + 1);
            Err(ProbeError::Reported(
                "unable to connect to server: Connection refused".into(),
            ))
        }
    }

    /// Answers the one-second server check, then behaves as if Ctrl-C was
    /// pressed.
    struct InterruptedAfterCheck;

    impl UdpGenerator for InterruptedAfterCheck {
        fn run_udp(&self, trial: &UdpTrial) -> Result<UdpTrialResult, ProbeError> {
            if trial.duration_secs == 1 {
                Ok(clean_trial(trial))
            } else {
                Err(ProbeError::Interrupted)
            }
        }
    }

    struct FakeSockperf {
        up: bool,
        runs: Cell<u32>,
    }

    impl FakeSockperf {
        fn latency(&self, mode: LatencyMode, msg_size: u32) -> Result<SockperfLatency, SockperfError> {
            self.runs.set(self.runs.get() + 1);
            if msg_size == 1472 {
                return Err(SockperfError::Malformed("no avg-latency in latency report".into()));
            }
            Ok(SockperfLatency {
                mode,
                msg_size,
                sent: 1000,
                received: 1000,
                dropped: 0,
                latency_usec: Summary::from_samples(&[10.0, 11.0, 12.0]).unwrap(),
            })
        }
    }

    impl SockperfProber for FakeSockperf {
        fn check_server(&self) -> Result<bool, SockperfError> {
            Ok(self.up)
        }

        fn ping_pong(&self, msg_size: u32) -> Result<SockperfLatency, SockperfError> {
            self.latency(LatencyMode::PingPong, msg_size)
        }

        fn under_load(&self, mps: u32, msg_size: u32) -> Result<SockperfLatency, SockperfError> {
            self.latency(LatencyMode::UnderLoad { mps }, msg_size)
        }

        fn throughput(
            &self,
            transport: Transport,
            mps: Option<u32>,
            msg_size: u32,
        ) -> Result<SockperfThroughput, SockperfError> {
            self.runs.set(self.runs.get() + 1);
            Ok(SockperfThroughput {
                transport,
                mps,
                msg_size,
                messages_sent: 1000,
                msg_rate: mps.unwrap_or(80_000) as f64,
                mbps: 900.0,
            })
        }
    }

    fn config(frame_sizes: &[u32]) -> BenchConfig {
        let mut cfg = BenchConfig::default();
        cfg.suite.frame_sizes = frame_sizes.to_vec();
        cfg.frame_loss.pause_ms = 0;
        cfg.frame_loss.trials = 1;
        cfg.frame_loss.loads_pct = vec![50.0, 100.0];
        cfg.back_to_back.pause_ms = 0;
        cfg.back_to_back.trials = 2;
        cfg
    }

    #[test]
    fn test_full_run_persists_every_phase() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ResultsDir::create_named(&tmp.path().join("run")).unwrap();
        let link = FakeLink { calls: Cell::new(0) };

        let report = run(&config(&[64, 128, 1518]), &FakePinger { reachable: true }, &link, None, &dir).unwrap();

        match &report.throughput[&64] {
            ThroughputEntry::Found(o) => assert!(o.rate.mbps() <= 400.0 && o.rate.mbps() >= 396.0),
            other => panic!("unexpected {:?}", other),
        }
        match &report.throughput[&128] {
            ThroughputEntry::Failed { last_good_mbps, failed_rate_mbps, .. } => {
                assert_eq!(*last_good_mbps, 1.0);
                assert_eq!(*failed_rate_mbps, 1000.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(report.latency[&1518], LatencyEntry::Failed { .. }));
        assert_eq!(report.frame_loss[&128].loads[0].failed_trials, 1);
        assert_eq!(report.back_to_back[&1518].trials.len(), 2);
        assert!(report.test_info.finished_at.is_some());
        let server = report.iperf3_server.as_ref().unwrap();
        assert!(server.available);
        assert_eq!(server.trial.as_ref().unwrap().lost_packets, 0);
        assert!(report.sockperf.is_none());

        let (best_size, best_rate) = report.best_throughput().unwrap();
        assert_eq!(best_size, 1518);
        assert!(best_rate.mbps() > 900.0);
        assert_eq!(report.lowest_latency().unwrap().0, 64);

        for file in [
            storage::THROUGHPUT_FILE,
            storage::LATENCY_FILE,
            storage::FRAME_LOSS_FILE,
            storage::BACK_TO_BACK_FILE,
            storage::RESULTS_FILE,
        ] {
            assert!(dir.path().join(file).is_file(), "{} missing", file);
        }

        let results: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(storage::RESULTS_FILE)).unwrap())
                .unwrap();
        assert_eq!(results["throughput"]["128"]["status"], "failed");
        assert_eq!(results["throughput"]["64"]["status"], "found");
        assert_eq!(results["latency"]["64"]["status"], "measured");
        assert_eq!(results["iperf3_server"]["available"], true);
    }

    #[test]
    fn test_missing_iperf3_server_skips_iperf3_phases() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ResultsDir::create_named(&tmp.path().join("run")).unwrap();
        let link = NoServer { calls: Cell::new(0) };

        let report = run(&config(&[64, 512]), &FakePinger { reachable: true }, &link, None, &dir).unwrap();

        assert_eq!(link.calls.get(), 1);
        let server = report.iperf3_server.as_ref().unwrap();
        assert!(!server.available);
        assert!(server.error.as_deref().unwrap().contains("Connection refused"));
        assert!(report.throughput.is_empty());
        assert!(report.frame_loss.is_empty());
        assert!(report.back_to_back.is_empty());
        assert_eq!(report.latency.len(), 2);
        assert!(!dir.path().join(storage::THROUGHPUT_FILE).exists());
        assert!(dir.path().join(storage::LATENCY_FILE).is_file());
        assert!(dir.path().join(storage::RESULTS_FILE).is_file());
    }

    #[test]
    fn test_interruption_aborts_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ResultsDir::create_named(&tmp.path().join("run")).unwrap();

        let err = run(
            &config(&[64, 512]),
            &FakePinger { reachable: true },
            &InterruptedAfterCheck,
            None,
            &dir,
        )
        .unwrap_err();

        assert!(format!("{:#}", err).contains("interrupted"));
        assert!(!dir.path().join(storage::THROUGHPUT_FILE).exists());
        assert!(!dir.path().join(storage::LATENCY_FILE).exists());
        assert!(!dir.path().join(storage::RESULTS_FILE).exists());
    }

    #[test]
    fn test_sockperf_phase_records_each_run() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ResultsDir::create_named(&tmp.path().join("run")).unwrap();
        let link = FakeLink { calls: Cell::new(0) };
        let sockperf = FakeSockperf {
            up: true,
            runs: Cell::new(0),
        };
        let mut cfg = config(&[64]);
        cfg.sockperf.msg_sizes = vec![64, 1472];
        cfg.sockperf.load_mps = vec![50_000];
        cfg.sockperf.udp_mps = vec![10_000, 50_000];

        let report = run(&cfg, &FakePinger { reachable: true }, &link, Some(&sockperf), &dir).unwrap();

        // 2 ping-pong + 1 under load + tcp + 2 udp
        assert_eq!(sockperf.runs.get(), 6);
        let sp = report.sockperf.as_ref().unwrap();
        assert!(sp.server_available);
        assert!(matches!(sp.ping_pong[&64], SockperfEntry::Measured(_)));
        assert!(matches!(sp.ping_pong[&1472], SockperfEntry::Failed { .. }));
        assert!(matches!(sp.under_load[&50_000], SockperfEntry::Measured(_)));
        let keys: Vec<&str> = sp.throughput.keys().map(String::as_str).collect();
        assert_eq!(keys, ["tcp", "udp_10000", "udp_50000"]);

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(storage::SOCKPERF_FILE)).unwrap())
                .unwrap();
        assert_eq!(saved["ping_pong"]["1472"]["status"], "failed");
        assert_eq!(saved["under_load"]["50000"]["mode"], "under_load");
        assert_eq!(saved["throughput"]["udp_10000"]["mps"], 10_000);
    }

    #[test]
    fn test_sockperf_server_down_is_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ResultsDir::create_named(&tmp.path().join("run")).unwrap();
        let link = FakeLink { calls: Cell::new(0) };
        let sockperf = FakeSockperf {
            up: false,
            runs: Cell::new(0),
        };

        let report = run(&config(&[64]), &FakePinger { reachable: true }, &link, Some(&sockperf), &dir).unwrap();

        assert_eq!(sockperf.runs.get(), 0);
        assert!(!report.sockperf.as_ref().unwrap().server_available);
        assert!(dir.path().join(storage::SOCKPERF_FILE).is_file());
    }

    #[test]
    fn test_unreachable_target_skips_tests() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ResultsDir::create_named(&tmp.path().join("run")).unwrap();
        let link = FakeLink { calls: Cell::new(0) };

        let report = run(&config(&[64]), &FakePinger { reachable: false }, &link, None, &dir).unwrap();

        assert!(!report.connectivity.reachable);
        assert!(report.throughput.is_empty());
        assert_eq!(link.calls.get(), 0);
        assert!(dir.path().join(storage::RESULTS_FILE).is_file());
        assert!(!dir.path().join(storage::THROUGHPUT_FILE).exists());
    }

    #[test]
    fn test_invalid_search_config_fails_before_any_probe() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ResultsDir::create_named(&tmp.path().join("run")).unwrap();
        let link = FakeLink { calls: Cell::new(0) };
        let mut cfg = config(&[64]);
        cfg.search.floor_mbps = 2000.0;

        assert!(run(&cfg, &FakePinger { reachable: true }, &link, None, &dir).is_err());
        assert_eq!(link.calls.get(), 0);
    }
}
