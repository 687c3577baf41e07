//! Physics models for the quantities the station has no transducer for.
//!
//! Battery state is a running integral of net power (Coulomb counting in watt-hours). The
//! turbine is treated as `P = k * v^3`, inverted to recover wind speed.

use crate::telemetry::RawFrame;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    pub capacity_wh: f64,
    pub v_min: f64,
    pub v_max: f64,
    /// Assumed constant house load.
    pub load_w: f64,
    /// Fraction of capacity assumed on a cold start.
    pub initial_soc_fraction: f64,
    /// Turbine coefficient in W·s³/m³.
    pub turbine_k: f64,
    /// Steps longer than this are treated as a clock discontinuity.
    pub max_step_seconds: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            capacity_wh: 84.0,
            v_min: 7.0,
            v_max: 8.4,
            load_w: 5.0,
            initial_soc_fraction: 0.5,
            turbine_k: 0.02,
            max_step_seconds: 15.0 * 60.0,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.capacity_wh.is_finite() && self.capacity_wh > 0.0) {
            anyhow::bail!("battery capacity must be positive, got {}", self.capacity_wh);
        }
        if !(self.v_min.is_finite() && self.v_max.is_finite() && self.v_max >= self.v_min) {
            anyhow::bail!(
                "battery voltage bounds invalid: min {} max {}",
                self.v_min,
                self.v_max
            );
        }
        if !self.load_w.is_finite() {
            anyhow::bail!("load must be finite");
        }
        if !(0.0..=1.0).contains(&self.initial_soc_fraction) {
            anyhow::bail!(
                "initial SOC fraction must be within [0, 1], got {}",
                self.initial_soc_fraction
            );
        }
        if !(self.turbine_k.is_finite() && self.turbine_k > 0.0) {
            anyhow::bail!("turbine constant must be positive, got {}", self.turbine_k);
        }
        if !(self.max_step_seconds.is_finite() && self.max_step_seconds > 0.0) {
            anyhow::bail!("max step must be positive, got {}", self.max_step_seconds);
        }
        Ok(())
    }
}

/// Snapshot-able estimator state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    pub e_wh: f64,
    /// Capture time of the last accepted sample.
    pub last_ts: Option<DateTime<Utc>>,
}

/// A step whose energy update was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum EstimatorStale {
    #[error("non-positive step of {dt_seconds:.3}s")]
    NonPositiveStep { dt_seconds: f64 },
    #[error("step of {dt_seconds:.0}s exceeds {max_seconds:.0}s")]
    GapTooLarge { dt_seconds: f64, max_seconds: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub v_bat: f64,
    pub soc: f64,
    pub wind_speed: f64,
    pub e_wh: f64,
    pub stale: Option<EstimatorStale>,
}

/// Single-owner battery and wind estimator. Updates must be applied in capture order.
#[derive(Debug, Clone)]
pub struct Estimator {
    cfg: EstimatorConfig,
    state: Option<BatteryState>,
}

impl Estimator {
    pub fn new(cfg: EstimatorConfig) -> Self {
        Self { cfg, state: None }
    }

    /// Resumes from a snapshot. The stored energy is clamped to the configured capacity.
    pub fn restore(cfg: EstimatorConfig, state: BatteryState) -> Self {
        let e_wh = if state.e_wh.is_finite() {
            state.e_wh.clamp(0.0, cfg.capacity_wh)
        } else {
            cfg.initial_soc_fraction * cfg.capacity_wh
        };
        Self {
            cfg,
            state: Some(BatteryState {
                e_wh,
                last_ts: state.last_ts,
            }),
        }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.cfg
    }

    pub fn state(&self) -> Option<BatteryState> {
        self.state
    }

    pub fn net_power_w(&self, frame: &RawFrame) -> f64 {
        let generation = frame.solar_power_w() + frame.wind_power_w().unwrap_or(0.0).max(0.0);
        generation - self.cfg.load_w
    }

    pub fn update(&mut self, frame: &RawFrame, captured_at: DateTime<Utc>) -> Estimate {
        let net_w = self.net_power_w(frame);
        let mut stale = None;

        let e_wh = match self.state {
            None => self.cfg.initial_soc_fraction * self.cfg.capacity_wh,
            Some(BatteryState { e_wh, last_ts: None }) => e_wh,
            Some(BatteryState {
                e_wh,
                last_ts: Some(last_ts),
            }) => {
                let dt_seconds = (captured_at - last_ts).num_milliseconds() as f64 / 1000.0;
                if dt_seconds <= 0.0 {
                    stale = Some(EstimatorStale::NonPositiveStep { dt_seconds });
                    e_wh
                } else if dt_seconds > self.cfg.max_step_seconds {
                    stale = Some(EstimatorStale::GapTooLarge {
                        dt_seconds,
                        max_seconds: self.cfg.max_step_seconds,
                    });
                    e_wh
                } else {
                    let dt_hours = dt_seconds / 3600.0;
                    clamp_energy(e_wh, e_wh + net_w * dt_hours, self.cfg.capacity_wh)
                }
            }
        };

        // A non-positive step keeps the newer anchor so a backwards clock cannot rewind it.
        let last_ts = match (stale, self.state.and_then(|s| s.last_ts)) {
            (Some(EstimatorStale::NonPositiveStep { .. }), Some(prev)) => prev.max(captured_at),
            _ => captured_at,
        };
        self.state = Some(BatteryState {
            e_wh,
            last_ts: Some(last_ts),
        });

        let soc = soc_percent(e_wh, self.cfg.capacity_wh);
        Estimate {
            v_bat: battery_voltage(soc, self.cfg.v_min, self.cfg.v_max),
            soc,
            wind_speed: wind_speed(frame.wind_power_w().unwrap_or(0.0), self.cfg.turbine_k),
            e_wh,
            stale,
        }
    }
}

fn clamp_energy(previous: f64, next: f64, capacity_wh: f64) -> f64 {
    if !next.is_finite() {
        return previous;
    }
    next.clamp(0.0, capacity_wh)
}

pub fn soc_percent(e_wh: f64, capacity_wh: f64) -> f64 {
    (100.0 * e_wh / capacity_wh).clamp(0.0, 100.0)
}

/// Linear open-circuit model; nondecreasing in `soc`.
pub fn battery_voltage(soc: f64, v_min: f64, v_max: f64) -> f64 {
    v_min + (v_max - v_min) * soc.clamp(0.0, 100.0) / 100.0
}

pub fn wind_speed(power_w: f64, turbine_k: f64) -> f64 {
    if power_w > 0.0 && turbine_k > 0.0 {
        (power_w / turbine_k).cbrt()
    } else {
        0.0
    }
}

pub fn save_snapshot(path: &Path, state: &BatteryState) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(state)?).context("write battery state tmp")?;
    fs::rename(&tmp, path).context("rename battery state")?;
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<Option<BatteryState>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read battery state {}", path.display()))?;
    let state: BatteryState = serde_json::from_str(&raw)
        .with_context(|| format!("parse battery state {}", path.display()))?;
    Ok(Some(state))
}
