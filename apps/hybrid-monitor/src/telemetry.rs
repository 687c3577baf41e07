use serde::{Deserialize, Serialize};

/// Directly measured fields for one sampling cycle, in SI units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    pub v_pv: f64,
    pub i_pv: f64,
    /// `None` while the wind power monitor is degraded.
    pub v_wind: Option<f64>,
    pub i_wind: Option<f64>,
    pub lux: f64,
    pub fan_pwm: f64,
}

impl RawFrame {
    pub fn solar_power_w(&self) -> f64 {
        self.v_pv * self.i_pv
    }

    pub fn wind_power_w(&self) -> Option<f64> {
        match (self.v_wind, self.i_wind) {
            (Some(v), Some(i)) => Some(v * i),
            _ => None,
        }
    }
}

/// One stored row. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Assigned by the store; `None` until persisted.
    #[serde(default)]
    pub id: Option<i64>,
    /// Unix seconds.
    pub timestamp: i64,
    pub v_pv: f64,
    pub i_pv: f64,
    pub v_wind: Option<f64>,
    pub i_wind: Option<f64>,
    pub v_bat: f64,
    pub soc: f64,
    pub wind_speed: f64,
    pub lux: f64,
    pub fan_pwm: f64,
    /// Set when the battery estimate was held because of a clock discontinuity.
    #[serde(default)]
    pub estimate_stale: bool,
}

impl TelemetrySample {
    pub fn solar_power_w(&self) -> Option<f64> {
        finite_product(Some(self.v_pv), Some(self.i_pv))
    }

    pub fn wind_power_w(&self) -> Option<f64> {
        finite_product(self.v_wind, self.i_wind)
    }
}

fn finite_product(v: Option<f64>, i: Option<f64>) -> Option<f64> {
    let p = v? * i?;
    p.is_finite().then_some(p)
}
