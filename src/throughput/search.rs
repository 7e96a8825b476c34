//! RFC 2544 zero-loss throughput search.
//!
//! Bisects the offered load between a floor and a ceiling until the interval
//! is narrower than the relative tolerance (authoritative) or the iteration
//! cap is reached (safety bound). Probes run strictly one at a time.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::{LossFraction, LossProbe, ProbeError, Rate};

/// Inputs of one search run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub floor: Rate,
    pub ceiling: Rate,
    /// Loss fraction (not percent) a rate must stay strictly below.
    pub loss_threshold: f64,
    /// Stop once `(high - low) / high` is at or below this.
    pub tolerance: f64,
    pub max_iterations: u32,
    /// Probe the ceiling before bisecting and return it when it is already
    /// loss-free.
    pub probe_ceiling_first: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            floor: Rate::from_mbps(1.0),
            ceiling: Rate::from_mbps(1000.0),
            loss_threshold: 0.00001,
            tolerance: 0.01,
            max_iterations: 20,
            probe_ceiling_first: true,
        }
    }
}

impl SearchParams {
    pub fn validate(&self) -> Result<(), SearchError> {
        let floor = self.floor.bps();
        let ceiling = self.ceiling.bps();
        if !floor.is_finite() || !ceiling.is_finite() {
            return Err(SearchError::InvalidConfiguration(
                "rates must be finite".into(),
            ));
        }
        if floor <= 0.0 || ceiling <= 0.0 {
            return Err(SearchError::InvalidConfiguration(
                "rates must be positive".into(),
            ));
        }
        if floor >= ceiling {
            return Err(SearchError::InvalidConfiguration(format!(
                "floor {} must be below ceiling {}",
                self.floor, self.ceiling
            )));
        }
        if !(self.loss_threshold > 0.0 && self.loss_threshold < 1.0) {
            return Err(SearchError::InvalidConfiguration(format!(
                "loss threshold {} outside (0, 1)",
                self.loss_threshold
            )));
        }
        if !(self.tolerance > 0.0 && self.tolerance < 1.0) {
            return Err(SearchError::InvalidConfiguration(format!(
                "tolerance {} outside (0, 1)",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(SearchError::InvalidConfiguration(
                "max iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid search configuration: {0}")]
    InvalidConfiguration(String),

    #[error("probe at {rate} failed (last sustained rate {last_good})")]
    ProbeFailure {
        rate: Rate,
        last_good: Rate,
        #[source]
        source: ProbeError,
    },
}

/// Why the search stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The ceiling itself was below the loss threshold.
    CeilingSustained,
    /// The interval narrowed to within the relative tolerance.
    Tolerance,
    /// `max_iterations` bisection steps ran without reaching the tolerance.
    IterationCap,
}

/// One dispatched probe and the interval after it was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub rate: Rate,
    pub loss: LossFraction,
    pub sustained: bool,
    pub low: Rate,
    pub high: Rate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    /// Best confirmed rate: the final `low`.
    pub rate: Rate,
    pub low: Rate,
    pub high: Rate,
    /// Bisection steps taken (the initial ceiling probe is not counted).
    pub iterations: u32,
    pub termination: Termination,
    pub trail: Vec<ProbeRecord>,
}

impl SearchOutcome {
    /// Relative width of the final interval.
    pub fn relative_width(&self) -> f64 {
        (self.high.bps() - self.low.bps()) / self.high.bps()
    }
}

/// Find the highest rate whose measured loss stays below the threshold.
pub fn search<P>(params: &SearchParams, probe: &mut P) -> Result<SearchOutcome, SearchError>
where
    P: LossProbe + ?Sized,
{
    params.validate()?;

    let mut low = params.floor;
    let mut high = params.ceiling;
    let mut trail = Vec::new();

    info!(
        floor_mbps = params.floor.mbps(),
        ceiling_mbps = params.ceiling.mbps(),
        loss_threshold = params.loss_threshold,
        tolerance = params.tolerance,
        max_iterations = params.max_iterations,
        "starting zero-loss search"
    );

    if params.probe_ceiling_first {
        let loss = probe
            .measure(high)
            .map_err(|source| SearchError::ProbeFailure {
                rate: high,
                last_good: low,
                source,
            })?;
        let sustained = loss.value() < params.loss_threshold;
        debug!(rate_mbps = high.mbps(), loss_pct = loss.percent(), sustained, "ceiling probe");
        if sustained {
            low = high;
        }
        trail.push(ProbeRecord {
            rate: high,
            loss,
            sustained,
            low,
            high,
        });
        if sustained {
            info!(rate_mbps = high.mbps(), "ceiling is loss-free");
            return Ok(SearchOutcome {
                rate: high,
                low,
                high,
                iterations: 0,
                termination: Termination::CeilingSustained,
                trail,
            });
        }
    }

    let mut iterations = 0;
    let termination = loop {
        if (high.bps() - low.bps()) / high.bps() <= params.tolerance {
            break Termination::Tolerance;
        }
        if iterations >= params.max_iterations {
            break Termination::IterationCap;
        }
        iterations += 1;

        let mid = low.midpoint(high);
        let loss = probe
            .measure(mid)
            .map_err(|source| SearchError::ProbeFailure {
                rate: mid,
                last_good: low,
                source,
            })?;
        let sustained = loss.value() < params.loss_threshold;
        if sustained {
            low = mid;
        } else {
            high = mid;
        }
        debug!(
            iteration = iterations,
            rate_mbps = mid.mbps(),
            loss_pct = loss.percent(),
            sustained,
            low_mbps = low.mbps(),
            high_mbps = high.mbps(),
            "bisection step"
        );
        trail.push(ProbeRecord {
            rate: mid,
            loss,
            sustained,
            low,
            high,
        });
    };

    info!(
        rate_mbps = low.mbps(),
        iterations,
        ?termination,
        "zero-loss search finished"
    );

    Ok(SearchOutcome {
        rate: low,
        low,
        high,
        iterations,
        termination,
        trail,
    })
}
