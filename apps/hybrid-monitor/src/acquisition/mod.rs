//! Station-side sampling: transducer reads, filtering, calibration and frame emission.

pub mod averaging;
pub mod calibration;
pub mod sensors;
pub mod simulated;

use crate::error::{SensorFault, SensorInitFault};
use crate::telemetry::RawFrame;
use averaging::{average_volts, AdcScale};
use calibration::{calibrate_zero_offset, CalibrationState};
use sensors::{fan_duty, HallCurrentSensor, VoltageDivider};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// A single-ended ADC channel.
pub trait AnalogInput: Send {
    fn name(&self) -> &'static str;

    fn init(&mut self) -> Result<(), SensorFault> {
        Ok(())
    }

    fn read_raw(&mut self) -> Result<u16, SensorFault>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerReading {
    pub bus_voltage_v: f64,
    pub current_a: f64,
}

/// Precision bus monitor that averages in hardware.
pub trait PowerMonitor: Send {
    fn name(&self) -> &'static str;

    /// Brings the device up with `averaging` conversions per reported reading.
    fn init(&mut self, averaging: u16) -> Result<(), SensorFault>;

    fn read(&mut self) -> Result<PowerReading, SensorFault>;
}

pub trait LightSensor: Send {
    fn name(&self) -> &'static str;

    fn init(&mut self) -> Result<(), SensorFault>;

    fn read_lux(&mut self) -> Result<f64, SensorFault>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionConfig {
    pub sample_period: Duration,
    /// Software samples averaged per analog read.
    pub adc_samples: usize,
    pub calibration_samples: usize,
    /// Conversions averaged inside the wind power monitor.
    pub wind_hw_averaging: u16,
    /// Wind bus voltage mapped to 100 % fan duty.
    pub wind_v_max: f64,
    pub adc: AdcScale,
    pub solar_divider: VoltageDivider,
    pub solar_current: HallCurrentSensor,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_period: Duration::from_secs(1),
            adc_samples: 16,
            calibration_samples: 500,
            wind_hw_averaging: 128,
            wind_v_max: 20.0,
            adc: AdcScale::TEN_BIT_5V,
            solar_divider: VoltageDivider::DIV_5,
            solar_current: HallCurrentSensor::ACS712_5A,
        }
    }
}

/// Required solar inputs. The station cannot produce a frame without them.
pub struct SolarInputs {
    pub voltage: Box<dyn AnalogInput>,
    pub current: Box<dyn AnalogInput>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFault {
    pub channel: &'static str,
    pub fault: SensorFault,
}

pub struct AcquisitionUnit {
    cfg: AcquisitionConfig,
    solar: SolarInputs,
    wind: Option<Box<dyn PowerMonitor>>,
    light: Option<Box<dyn LightSensor>>,
    calibration: CalibrationState,
    last_lux: f64,
    degraded: Vec<ChannelFault>,
}

impl AcquisitionUnit {
    /// Initialises every channel and calibrates the solar current sensor.
    ///
    /// The wind monitor and light sensor are optional: if either fails to come up the unit runs
    /// without it and reports the fault through [`AcquisitionUnit::degraded`].
    pub fn start(
        cfg: AcquisitionConfig,
        mut solar: SolarInputs,
        wind: Option<Box<dyn PowerMonitor>>,
        light: Option<Box<dyn LightSensor>>,
    ) -> Result<Self, SensorInitFault> {
        for input in [&mut solar.voltage, &mut solar.current] {
            input.init().map_err(|source| {
                let fault = SensorInitFault {
                    channel: input.name(),
                    source,
                };
                tracing::error!(error = %fault, "acquisition halted");
                fault
            })?;
        }
        let calibration =
            calibrate_zero_offset(solar.current.as_mut(), cfg.calibration_samples, cfg.adc)
                .map_err(|source| SensorInitFault {
                    channel: solar.current.name(),
                    source,
                })?;

        let mut degraded = Vec::new();
        let wind = match wind {
            Some(mut monitor) => match monitor.init(cfg.wind_hw_averaging) {
                Ok(()) => Some(monitor),
                Err(fault) => {
                    tracing::warn!(channel = monitor.name(), error = %fault, "wind monitor degraded");
                    degraded.push(ChannelFault {
                        channel: monitor.name(),
                        fault,
                    });
                    None
                }
            },
            None => {
                degraded.push(ChannelFault {
                    channel: "wind",
                    fault: SensorFault::NotResponding("wind"),
                });
                None
            }
        };
        let light = match light {
            Some(mut sensor) => match sensor.init() {
                Ok(()) => Some(sensor),
                Err(fault) => {
                    tracing::warn!(channel = sensor.name(), error = %fault, "light sensor degraded");
                    degraded.push(ChannelFault {
                        channel: sensor.name(),
                        fault,
                    });
                    None
                }
            },
            None => {
                degraded.push(ChannelFault {
                    channel: "light",
                    fault: SensorFault::NotResponding("light"),
                });
                None
            }
        };

        Ok(Self {
            cfg,
            solar,
            wind,
            light,
            calibration,
            last_lux: 0.0,
            degraded,
        })
    }

    pub fn calibration(&self) -> CalibrationState {
        self.calibration
    }

    pub fn degraded(&self) -> &[ChannelFault] {
        &self.degraded
    }

    /// Reads every channel once. Only a solar read failure fails the cycle.
    pub fn sample_cycle(&mut self) -> Result<RawFrame, SensorFault> {
        let cfg = self.cfg;
        let v_pin = average_volts(self.solar.voltage.as_mut(), cfg.adc_samples, cfg.adc)?;
        let i_pin = average_volts(self.solar.current.as_mut(), cfg.adc_samples, cfg.adc)?;
        let v_pv = cfg.solar_divider.input_volts(v_pin);
        let i_pv = cfg.solar_current.amps(i_pin, &self.calibration);

        let (v_wind, i_wind) = match self.wind.as_mut() {
            Some(monitor) => match monitor.read() {
                Ok(reading) => (
                    Some(reading.bus_voltage_v.max(0.0)),
                    Some(reading.current_a.max(0.0)),
                ),
                Err(fault) => {
                    tracing::debug!(error = %fault, "wind read failed; omitting wind fields");
                    (None, None)
                }
            },
            None => (None, None),
        };

        if let Some(sensor) = self.light.as_mut() {
            match sensor.read_lux() {
                Ok(lux) if lux.is_finite() && lux >= 0.0 => self.last_lux = lux,
                Ok(lux) => tracing::debug!(lux, "discarding invalid light reading"),
                Err(fault) => tracing::debug!(error = %fault, "light read failed; keeping last value"),
            }
        }

        Ok(RawFrame {
            v_pv,
            i_pv,
            v_wind,
            i_wind,
            lux: self.last_lux,
            fan_pwm: fan_duty(v_wind.unwrap_or(0.0), cfg.wind_v_max),
        })
    }

    /// Samples at the configured period until cancelled or `emit` returns `false`.
    pub fn run(mut self, cancel: CancellationToken, mut emit: impl FnMut(&RawFrame) -> bool) {
        let period = self.cfg.sample_period;
        while !cancel.is_cancelled() {
            let started = Instant::now();
            match self.sample_cycle() {
                Ok(frame) => {
                    if !emit(&frame) {
                        break;
                    }
                }
                Err(fault) => tracing::warn!(error = %fault, "sample cycle failed"),
            }
            let deadline = started + period;
            while !cancel.is_cancelled() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Replays raw counts, then reports the channel as not responding.
    pub struct ScriptedAdc {
        name: &'static str,
        counts: VecDeque<u16>,
        pub fail_init: bool,
    }

    impl ScriptedAdc {
        pub fn new(name: &'static str, counts: impl IntoIterator<Item = u16>) -> Self {
            Self {
                name,
                counts: counts.into_iter().collect(),
                fail_init: false,
            }
        }

        pub fn constant(name: &'static str, count: u16, len: usize) -> Self {
            Self::new(name, std::iter::repeat(count).take(len))
        }
    }

    impl AnalogInput for ScriptedAdc {
        fn name(&self) -> &'static str {
            self.name
        }

        fn init(&mut self) -> Result<(), SensorFault> {
            if self.fail_init {
                return Err(SensorFault::NotResponding(self.name));
            }
            Ok(())
        }

        fn read_raw(&mut self) -> Result<u16, SensorFault> {
            self.counts
                .pop_front()
                .ok_or(SensorFault::NotResponding(self.name))
        }
    }

    pub struct FixedMonitor {
        pub reading: Result<PowerReading, SensorFault>,
        pub init_result: Result<(), SensorFault>,
        pub averaging: Option<u16>,
    }

    impl PowerMonitor for FixedMonitor {
        fn name(&self) -> &'static str {
            "wind_monitor"
        }

        fn init(&mut self, averaging: u16) -> Result<(), SensorFault> {
            self.averaging = Some(averaging);
            self.init_result.clone()
        }

        fn read(&mut self) -> Result<PowerReading, SensorFault> {
            self.reading.clone()
        }
    }

    pub struct ScriptedLight {
        pub readings: VecDeque<Result<f64, SensorFault>>,
    }

    impl LightSensor for ScriptedLight {
        fn name(&self) -> &'static str {
            "light"
        }

        fn init(&mut self) -> Result<(), SensorFault> {
            Ok(())
        }

        fn read_lux(&mut self) -> Result<f64, SensorFault> {
            self.readings
                .pop_front()
                .unwrap_or(Err(SensorFault::NotResponding("light")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn cfg() -> AcquisitionConfig {
        AcquisitionConfig {
            adc_samples: 4,
            calibration_samples: 10,
            ..AcquisitionConfig::default()
        }
    }

    // Hall sensor output at zero current, 10-bit counts at 5 V.
    const ZERO_COUNTS: u16 = 512;

    fn solar(cycles: usize, v_counts: u16, i_counts: u16) -> SolarInputs {
        let mut current = vec![ZERO_COUNTS; 10];
        current.extend(std::iter::repeat(i_counts).take(4 * cycles));
        SolarInputs {
            voltage: Box::new(ScriptedAdc::constant("pv_v", v_counts, 4 * cycles)),
            current: Box::new(ScriptedAdc::new("pv_i", current)),
        }
    }

    fn monitor(bus_voltage_v: f64, current_a: f64) -> Box<dyn PowerMonitor> {
        Box::new(FixedMonitor {
            reading: Ok(PowerReading {
                bus_voltage_v,
                current_a,
            }),
            init_result: Ok(()),
            averaging: None,
        })
    }

    #[test]
    fn produces_calibrated_frame() {
        let light = ScriptedLight {
            readings: [Ok(45_000.0)].into_iter().collect(),
        };
        let mut unit = AcquisitionUnit::start(
            cfg(),
            solar(1, 757, 550),
            Some(monitor(12.0, 0.5)),
            Some(Box::new(light)),
        )
        .unwrap();
        assert!(unit.degraded().is_empty());

        let frame = unit.sample_cycle().unwrap();
        let scale = AdcScale::TEN_BIT_5V;
        assert!((frame.v_pv - scale.volts(757.0) * 5.0).abs() < 1e-9);
        let expected_i = (scale.volts(550.0) - scale.volts(512.0)) / 0.185;
        assert!((frame.i_pv - expected_i).abs() < 1e-9);
        assert_eq!(frame.v_wind, Some(12.0));
        assert!((frame.fan_pwm - 60.0).abs() < 1e-9);
        assert_eq!(frame.lux, 45_000.0);
    }

    #[test]
    fn missing_required_solar_channel_is_fatal() {
        let mut voltage = ScriptedAdc::constant("pv_v", 0, 4);
        voltage.fail_init = true;
        let inputs = SolarInputs {
            voltage: Box::new(voltage),
            current: Box::new(ScriptedAdc::constant("pv_i", ZERO_COUNTS, 20)),
        };
        let err = AcquisitionUnit::start(cfg(), inputs, None, None).err().unwrap();
        assert_eq!(err.channel, "pv_v");
    }

    #[test]
    fn failed_wind_init_degrades_and_keeps_sampling() {
        let wind = FixedMonitor {
            reading: Ok(PowerReading {
                bus_voltage_v: 1.0,
                current_a: 1.0,
            }),
            init_result: Err(SensorFault::NotResponding("wind_monitor")),
            averaging: None,
        };
        let mut unit =
            AcquisitionUnit::start(cfg(), solar(2, 700, 512), Some(Box::new(wind)), None).unwrap();
        let channels: Vec<_> = unit.degraded().iter().map(|f| f.channel).collect();
        assert_eq!(channels, vec!["wind_monitor", "light"]);

        let frame = unit.sample_cycle().unwrap();
        assert_eq!(frame.v_wind, None);
        assert_eq!(frame.i_wind, None);
        assert_eq!(frame.fan_pwm, 0.0);
        assert_eq!(frame.i_pv, 0.0);
        assert!(unit.sample_cycle().is_ok());
    }

    #[test]
    fn light_errors_keep_previous_value() {
        let light = ScriptedLight {
            readings: [
                Ok(1200.0),
                Err(SensorFault::InvalidReading {
                    channel: "light",
                    detail: "saturated".to_string(),
                }),
                Ok(-4.0),
                Ok(1300.0),
            ]
            .into_iter()
            .collect(),
        };
        let mut unit = AcquisitionUnit::start(
            cfg(),
            solar(4, 700, 512),
            Some(monitor(5.0, 0.1)),
            Some(Box::new(light)),
        )
        .unwrap();
        let lux: Vec<f64> = (0..4).map(|_| unit.sample_cycle().unwrap().lux).collect();
        assert_eq!(lux, vec![1200.0, 1200.0, 1200.0, 1300.0]);
    }

    #[test]
    fn run_stops_when_emit_declines() {
        let cfg = AcquisitionConfig {
            sample_period: Duration::from_millis(1),
            ..cfg()
        };
        let unit =
            AcquisitionUnit::start(cfg, solar(3, 700, 512), Some(monitor(2.0, 0.1)), None).unwrap();
        let mut frames = Vec::new();
        unit.run(CancellationToken::new(), |frame| {
            frames.push(*frame);
            frames.len() < 3
        });
        assert_eq!(frames.len(), 3);
    }
}
