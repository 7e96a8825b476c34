//! Statistical reduction of raw samples (RTTs, per-trial loss, burst sizes).

pub mod stats;
