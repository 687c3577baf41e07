//! Transducer transfer functions.

use super::calibration::CalibrationState;
use serde::{Deserialize, Serialize};

/// Resistive divider in front of an ADC pin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageDivider {
    /// Input volts per pin volt.
    pub ratio: f64,
}

impl VoltageDivider {
    /// 30k/7.5k module, 25 V full scale at 5 V.
    pub const DIV_5: Self = Self { ratio: 5.0 };

    pub fn input_volts(&self, pin_volts: f64) -> f64 {
        (pin_volts * self.ratio).max(0.0)
    }

    pub fn pin_volts(&self, input_volts: f64) -> f64 {
        input_volts / self.ratio
    }
}

/// Hall-effect current sensor centred on its zero offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HallCurrentSensor {
    pub volts_per_amp: f64,
    /// Output at zero current before calibration.
    pub nominal_zero_v: f64,
}

impl HallCurrentSensor {
    /// ±5 A part, 185 mV/A around mid-rail.
    pub const ACS712_5A: Self = Self {
        volts_per_amp: 0.185,
        nominal_zero_v: 2.5,
    };

    /// Current in amps, clamped at zero: the source cannot sink current.
    pub fn amps(&self, pin_volts: f64, cal: &CalibrationState) -> f64 {
        ((pin_volts - cal.zero_offset_v) / self.volts_per_amp).max(0.0)
    }

    pub fn pin_volts(&self, amps: f64, zero_v: f64) -> f64 {
        zero_v + amps * self.volts_per_amp
    }
}

/// Cooling fan duty in percent, proportional to the wind bus voltage.
pub fn fan_duty(v_wind: f64, wind_v_max: f64) -> f64 {
    if wind_v_max.is_nan() || wind_v_max <= 0.0 || !v_wind.is_finite() {
        return 0.0;
    }
    (v_wind / wind_v_max * 100.0).clamp(0.0, 100.0)
}
