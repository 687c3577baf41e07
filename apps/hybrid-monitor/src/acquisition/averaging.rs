use super::AnalogInput;
use crate::error::SensorFault;

/// Linear ADC transfer function: counts to volts at the pin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcScale {
    pub vref: f64,
    pub full_scale: u16,
}

impl AdcScale {
    /// 10-bit converter referenced to 5 V.
    pub const TEN_BIT_5V: Self = Self {
        vref: 5.0,
        full_scale: 1023,
    };

    pub fn volts(&self, counts: f64) -> f64 {
        counts * self.vref / f64::from(self.full_scale)
    }

    pub fn counts(&self, volts: f64) -> f64 {
        volts * f64::from(self.full_scale) / self.vref
    }
}

/// Mean of `samples` consecutive raw reads, in counts.
///
/// Reads are summed as integers so the result depends only on the read sequence. A single
/// failed read fails the whole average.
pub fn average_counts(input: &mut dyn AnalogInput, samples: usize) -> Result<f64, SensorFault> {
    let samples = samples.max(1);
    let mut sum: u64 = 0;
    for _ in 0..samples {
        sum += u64::from(input.read_raw()?);
    }
    Ok(sum as f64 / samples as f64)
}

pub fn average_volts(
    input: &mut dyn AnalogInput,
    samples: usize,
    scale: AdcScale,
) -> Result<f64, SensorFault> {
    Ok(scale.volts(average_counts(input, samples)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::testing::ScriptedAdc;

    #[test]
    fn averages_exactly_over_the_scripted_window() {
        let mut adc = ScriptedAdc::new("pv_v", [500, 501, 503, 500, 9, 9, 9, 9]);
        assert_eq!(average_counts(&mut adc, 4).unwrap(), 501.0);
        assert_eq!(average_counts(&mut adc, 4).unwrap(), 9.0);
    }

    #[test]
    fn same_script_gives_same_result() {
        let script = [12, 400, 7, 1023, 0, 512];
        let a = average_volts(&mut ScriptedAdc::new("x", script), 6, AdcScale::TEN_BIT_5V);
        let b = average_volts(&mut ScriptedAdc::new("x", script), 6, AdcScale::TEN_BIT_5V);
        assert_eq!(a, b);
    }

    #[test]
    fn failed_read_fails_the_average() {
        let mut adc = ScriptedAdc::new("pv_i", [1, 2]);
        assert!(matches!(
            average_counts(&mut adc, 3),
            Err(SensorFault::NotResponding("pv_i"))
        ));
    }

    #[test]
    fn scale_round_trips_full_range() {
        let scale = AdcScale::TEN_BIT_5V;
        assert_eq!(scale.volts(1023.0), 5.0);
        assert!((scale.counts(scale.volts(511.0)) - 511.0).abs() < 1e-9);
    }
}
