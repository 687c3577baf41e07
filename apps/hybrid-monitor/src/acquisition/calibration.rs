use super::averaging::{average_volts, AdcScale};
use super::AnalogInput;
use crate::error::SensorFault;
use serde::Serialize;

/// Zero-current offset of a Hall-effect current sensor.
///
/// Measured once at startup with no load attached and held for the life of the process.
/// Thermal drift after startup is not tracked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationState {
    pub zero_offset_v: f64,
    pub samples: usize,
}

pub fn calibrate_zero_offset(
    input: &mut dyn AnalogInput,
    samples: usize,
    scale: AdcScale,
) -> Result<CalibrationState, SensorFault> {
    let zero_offset_v = average_volts(input, samples, scale)?;
    tracing::info!(
        channel = input.name(),
        zero_offset_v,
        samples,
        "current sensor zero offset calibrated"
    );
    Ok(CalibrationState {
        zero_offset_v,
        samples: samples.max(1),
    })
}
