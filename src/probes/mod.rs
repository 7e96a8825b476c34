//! Latency probes: ICMP reachability and RTT via the system `ping`, and
//! application-level latency via `sockperf`.

pub mod icmp;
pub mod sockperf;

pub use icmp::{ConnectivityReport, IcmpError, IcmpProber, LatencyStats, Pinger};
pub use sockperf::{SockperfClient, SockperfError, SockperfLatency, SockperfProber, SockperfThroughput, Transport};
