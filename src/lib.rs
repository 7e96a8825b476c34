//! tsnbench -- RFC 2544 benchmarking for iperf3 client/server test beds.
//!
//! This crate provides the zero-loss throughput search, the iperf3, ping and
//! sockperf adapters it is driven through, frame loss and back-to-back
//! sweeps, and the suite runner that persists results.

pub mod analysis;
pub mod config;
pub mod probes;
pub mod storage;
pub mod suite;
pub mod system;
pub mod throughput;
