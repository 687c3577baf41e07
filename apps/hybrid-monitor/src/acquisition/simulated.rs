//! Synthetic station used in place of hardware.
//!
//! Solar output follows a sine over 06:00-18:00 with light noise at night. Wind is a smoothed
//! random walk; the turbine only delivers current above a 2 m/s cut-in. All drivers share one
//! seeded environment so a given seed reproduces the same sequence.

use super::{
    AcquisitionConfig, AcquisitionUnit, AnalogInput, LightSensor, PowerMonitor, PowerReading,
    SolarInputs,
};
use crate::error::{SensorFault, SensorInitFault};
use chrono::Timelike;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};

const PV_V_MAX: f64 = 18.0;
const PV_I_MAX: f64 = 1.5;
const LUX_MAX: f64 = 100_000.0;
const WIND_SPEED_MAX: f64 = 10.0;
const WIND_V_MAX: f64 = 20.0;
const WIND_CUT_IN: f64 = 2.0;
/// Offset of the simulated Hall sensor from its nominal mid-rail output.
const CURRENT_SENSOR_BIAS_V: f64 = 0.012;

struct Environment {
    rng: StdRng,
    wind_speed: f64,
    fixed_hour: Option<f64>,
    load_connected: bool,
    light_error_rate: f64,
}

impl Environment {
    fn hour(&self) -> f64 {
        match self.fixed_hour {
            Some(hour) => hour,
            None => {
                let now = chrono::Local::now();
                f64::from(now.hour()) + f64::from(now.minute()) / 60.0
            }
        }
    }

    fn solar_factor(&mut self) -> f64 {
        let hour = self.hour().rem_euclid(24.0);
        if (6.0..=18.0).contains(&hour) {
            ((hour - 6.0) * PI / 12.0).sin()
        } else {
            0.05 * self.rng.gen::<f64>()
        }
    }

    fn step_wind(&mut self) -> f64 {
        let target = self.rng.gen_range(0.0..WIND_SPEED_MAX);
        self.wind_speed = (0.7 * self.wind_speed + 0.3 * target).clamp(0.0, WIND_SPEED_MAX);
        self.wind_speed
    }

    /// Pin volts to counts with ±1 count of dither.
    fn to_counts(&mut self, cfg: &AcquisitionConfig, pin_volts: f64) -> u16 {
        let dither = self.rng.gen_range(-1.0..=1.0);
        let counts = (cfg.adc.counts(pin_volts) + dither).round();
        counts.clamp(0.0, f64::from(cfg.adc.full_scale)) as u16
    }
}

#[derive(Clone)]
pub struct SimulatedStation {
    env: Arc<Mutex<Environment>>,
    cfg: AcquisitionConfig,
}

impl SimulatedStation {
    pub fn new(seed: u64, cfg: AcquisitionConfig) -> Self {
        let env = Environment {
            rng: StdRng::seed_from_u64(seed),
            wind_speed: 0.0,
            fixed_hour: None,
            load_connected: false,
            light_error_rate: 0.02,
        };
        Self {
            env: Arc::new(Mutex::new(env)),
            cfg,
        }
    }

    /// Pins the simulated time of day instead of following the local clock.
    pub fn with_fixed_hour(self, hour: f64) -> Self {
        if let Ok(mut env) = self.env.lock() {
            env.fixed_hour = Some(hour);
        }
        self
    }

    pub fn with_light_error_rate(self, rate: f64) -> Self {
        if let Ok(mut env) = self.env.lock() {
            env.light_error_rate = rate.clamp(0.0, 1.0);
        }
        self
    }

    /// Calibrates with the load disconnected, then connects it.
    pub fn start(&self) -> Result<AcquisitionUnit, SensorInitFault> {
        self.set_load(false);
        let unit = AcquisitionUnit::start(
            self.cfg,
            SolarInputs {
                voltage: Box::new(SimChannel {
                    station: self.clone(),
                    kind: ChannelKind::SolarVoltage,
                }),
                current: Box::new(SimChannel {
                    station: self.clone(),
                    kind: ChannelKind::SolarCurrent,
                }),
            },
            Some(Box::new(SimWindMonitor {
                station: self.clone(),
            })),
            Some(Box::new(SimLight {
                station: self.clone(),
            })),
        )?;
        self.set_load(true);
        Ok(unit)
    }

    fn set_load(&self, connected: bool) {
        if let Ok(mut env) = self.env.lock() {
            env.load_connected = connected;
        }
    }

    fn with_env<T>(
        &self,
        channel: &'static str,
        f: impl FnOnce(&mut Environment, &AcquisitionConfig) -> T,
    ) -> Result<T, SensorFault> {
        let mut env = self
            .env
            .lock()
            .map_err(|_| SensorFault::NotResponding(channel))?;
        Ok(f(&mut env, &self.cfg))
    }
}

#[derive(Clone, Copy)]
enum ChannelKind {
    SolarVoltage,
    SolarCurrent,
}

struct SimChannel {
    station: SimulatedStation,
    kind: ChannelKind,
}

impl AnalogInput for SimChannel {
    fn name(&self) -> &'static str {
        match self.kind {
            ChannelKind::SolarVoltage => "pv_voltage",
            ChannelKind::SolarCurrent => "pv_current",
        }
    }

    fn read_raw(&mut self) -> Result<u16, SensorFault> {
        let kind = self.kind;
        self.station.with_env(self.name(), |env, cfg| {
            let factor = env.solar_factor();
            match kind {
                ChannelKind::SolarVoltage => {
                    let noise = env.rng.gen_range(-0.5..=0.5);
                    let v = (3.0 + 15.0 * factor + noise).clamp(0.0, PV_V_MAX);
                    env.to_counts(cfg, cfg.solar_divider.pin_volts(v))
                }
                ChannelKind::SolarCurrent => {
                    let amps = if env.load_connected {
                        let jitter = 0.8 + 0.4 * env.rng.gen::<f64>();
                        (PV_I_MAX * factor * jitter).clamp(0.0, PV_I_MAX)
                    } else {
                        0.0
                    };
                    let zero_v = cfg.solar_current.nominal_zero_v + CURRENT_SENSOR_BIAS_V;
                    env.to_counts(cfg, cfg.solar_current.pin_volts(amps, zero_v))
                }
            }
        })
    }
}

struct SimWindMonitor {
    station: SimulatedStation,
}

impl PowerMonitor for SimWindMonitor {
    fn name(&self) -> &'static str {
        "wind_monitor"
    }

    fn init(&mut self, averaging: u16) -> Result<(), SensorFault> {
        tracing::debug!(averaging, "simulated wind monitor up");
        Ok(())
    }

    fn read(&mut self) -> Result<PowerReading, SensorFault> {
        self.station.with_env(self.name(), |env, _| {
            let speed = env.step_wind();
            let bus_voltage_v =
                (2.0 * speed * (0.8 + 0.4 * env.rng.gen::<f64>())).clamp(0.0, WIND_V_MAX);
            let current_a = if speed > WIND_CUT_IN {
                (speed / WIND_SPEED_MAX * (0.7 + 0.6 * env.rng.gen::<f64>())).clamp(0.0, 1.0)
            } else {
                0.0
            };
            PowerReading {
                bus_voltage_v,
                current_a,
            }
        })
    }
}

struct SimLight {
    station: SimulatedStation,
}

impl LightSensor for SimLight {
    fn name(&self) -> &'static str {
        "light"
    }

    fn init(&mut self) -> Result<(), SensorFault> {
        Ok(())
    }

    fn read_lux(&mut self) -> Result<f64, SensorFault> {
        let outcome = self.station.with_env(self.name(), |env, _| {
            if env.rng.gen::<f64>() < env.light_error_rate {
                return None;
            }
            let factor = env.solar_factor();
            Some((LUX_MAX * factor * (0.9 + 0.2 * env.rng.gen::<f64>())).clamp(0.0, LUX_MAX))
        })?;
        outcome.ok_or_else(|| SensorFault::InvalidReading {
            channel: "light",
            detail: "sensor returned error code".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AcquisitionConfig {
        AcquisitionConfig {
            calibration_samples: 200,
            ..AcquisitionConfig::default()
        }
    }

    #[test]
    fn calibration_absorbs_sensor_bias() {
        let unit = SimulatedStation::new(7, cfg()).start().unwrap();
        let expected = cfg().solar_current.nominal_zero_v + CURRENT_SENSOR_BIAS_V;
        assert!((unit.calibration().zero_offset_v - expected).abs() < 0.01);
        assert!(unit.degraded().is_empty());
    }

    #[test]
    fn night_frames_are_near_zero_and_noon_frames_are_bright() {
        let mut night = SimulatedStation::new(1, cfg())
            .with_fixed_hour(2.0)
            .with_light_error_rate(0.0)
            .start()
            .unwrap();
        let frame = night.sample_cycle().unwrap();
        assert!(frame.i_pv < 0.1, "i_pv {}", frame.i_pv);
        assert!(frame.lux <= 0.05 * LUX_MAX * 1.1);

        let mut noon = SimulatedStation::new(1, cfg())
            .with_fixed_hour(12.0)
            .with_light_error_rate(0.0)
            .start()
            .unwrap();
        let frame = noon.sample_cycle().unwrap();
        assert!(frame.v_pv > 15.0, "v_pv {}", frame.v_pv);
        assert!(frame.i_pv > 1.0, "i_pv {}", frame.i_pv);
        assert!(frame.lux > 80_000.0);
    }

    #[test]
    fn same_seed_reproduces_the_sequence() {
        let run = |seed| {
            let mut unit = SimulatedStation::new(seed, cfg())
                .with_fixed_hour(10.0)
                .start()
                .unwrap();
            (0..20)
                .map(|_| unit.sample_cycle().unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(43));
    }

    #[test]
    fn frames_respect_physical_bounds() {
        let mut unit = SimulatedStation::new(9, cfg())
            .with_fixed_hour(14.0)
            .start()
            .unwrap();
        for _ in 0..200 {
            let frame = unit.sample_cycle().unwrap();
            assert!((0.0..=PV_V_MAX + 0.1).contains(&frame.v_pv));
            assert!(frame.i_pv >= 0.0);
            let v_wind = frame.v_wind.unwrap();
            assert!((0.0..=WIND_V_MAX).contains(&v_wind));
            assert!((0.0..=100.0).contains(&frame.fan_pwm));
            if frame.i_wind == Some(0.0) {
                continue;
            }
            assert!(frame.i_wind.unwrap() <= 1.0);
        }
    }
}
