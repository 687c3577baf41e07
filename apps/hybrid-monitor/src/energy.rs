//! Windowed energy accounting over stored samples.
//!
//! Energy per source is the trapezoidal integral of `V * I` between consecutive samples.
//! Gap policy: a pair of consecutive samples contributes to a source only when both samples
//! carry that source's power. A pair with a missing side is skipped for that source alone and
//! counted in `skipped_pairs`; nothing is interpolated across the gap.

use crate::store::TelemetryStore;
use crate::telemetry::TelemetrySample;
use anyhow::Result;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Solar,
    Wind,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Solar, Source::Wind];

    fn power_w(self, sample: &TelemetrySample) -> Option<f64> {
        match self {
            Source::Solar => sample.solar_power_w(),
            Source::Wind => sample.wind_power_w(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SourceEnergy {
    pub energy_wh: f64,
    /// Percentage of the window total; 0 when the total is 0.
    pub share_pct: f64,
    pub integrated_pairs: usize,
    pub skipped_pairs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnergyWindow {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub samples: usize,
    pub solar: SourceEnergy,
    pub wind: SourceEnergy,
    pub total_wh: f64,
}

impl EnergyWindow {
    pub fn source(&self, source: Source) -> &SourceEnergy {
        match source {
            Source::Solar => &self.solar,
            Source::Wind => &self.wind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrationError {
    #[error("samples not ascending at index {index}: {timestamp} follows {previous}")]
    NotAscending {
        index: usize,
        timestamp: i64,
        previous: i64,
    },
}

/// Integrates an ascending sample sequence. Equal timestamps form a zero-width interval.
pub fn integrate(samples: &[TelemetrySample]) -> Result<EnergyWindow, IntegrationError> {
    for (index, pair) in samples.windows(2).enumerate() {
        if pair[1].timestamp < pair[0].timestamp {
            return Err(IntegrationError::NotAscending {
                index: index + 1,
                timestamp: pair[1].timestamp,
                previous: pair[0].timestamp,
            });
        }
    }

    let mut solar = source_energy(Source::Solar, samples);
    let mut wind = source_energy(Source::Wind, samples);
    let total_wh = solar.energy_wh + wind.energy_wh;
    if total_wh > 0.0 {
        solar.share_pct = 100.0 * solar.energy_wh / total_wh;
        wind.share_pct = 100.0 * wind.energy_wh / total_wh;
    }

    Ok(EnergyWindow {
        start: samples.first().map(|s| s.timestamp),
        end: samples.last().map(|s| s.timestamp),
        samples: samples.len(),
        solar,
        wind,
        total_wh,
    })
}

fn source_energy(source: Source, samples: &[TelemetrySample]) -> SourceEnergy {
    let mut out = SourceEnergy::default();
    for pair in samples.windows(2) {
        let (Some(p0), Some(p1)) = (source.power_w(&pair[0]), source.power_w(&pair[1])) else {
            out.skipped_pairs += 1;
            continue;
        };
        let dt_hours = (pair[1].timestamp - pair[0].timestamp) as f64 / 3600.0;
        out.energy_wh += (p0 + p1) / 2.0 * dt_hours;
        out.integrated_pairs += 1;
    }
    out
}

/// Reads `[start, end]` from the store and integrates it.
pub fn energy_window(store: &TelemetryStore, start: i64, end: i64) -> Result<EnergyWindow> {
    let samples = store.range(start, end)?;
    let mut window = integrate(&samples)?;
    window.start = Some(start);
    window.end = Some(end);
    Ok(window)
}
