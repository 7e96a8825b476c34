//! Host-side helpers shared by the probe adapters.

pub mod process;
