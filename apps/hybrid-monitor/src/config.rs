use crate::acquisition::AcquisitionConfig;
use crate::estimator::EstimatorConfig;
use crate::ingest::IngestConfig;
use crate::pipeline::ReaderConfig;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub serial_port: Option<String>,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub reconnect_max: Duration,
    pub probe_timeout: Duration,

    pub db_path: PathBuf,
    pub state_path: PathBuf,
    pub buffer_capacity: usize,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub snapshot_every: u64,

    pub estimator: EstimatorConfig,
    pub acquisition: AcquisitionConfig,

    pub status_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup: &lookup };

        let serial_port = env.optional("HYBRID_SERIAL_PORT");
        let baud_rate = u32::try_from(env.u64("HYBRID_BAUD_RATE", Some(115_200))?)
            .context("invalid HYBRID_BAUD_RATE")?;
        let read_timeout = Duration::from_millis(env.u64("HYBRID_READ_TIMEOUT_MS", Some(1000))?);
        let reconnect_max =
            Duration::from_millis(env.u64("HYBRID_RECONNECT_MAX_MS", Some(30_000))?);
        let probe_timeout = Duration::from_millis(env.u64("HYBRID_PROBE_TIMEOUT_MS", Some(3000))?);

        let db_path = PathBuf::from(env.string("HYBRID_DB_PATH", Some("hybrid_system.db"))?);
        let state_path =
            PathBuf::from(env.string("HYBRID_STATE_PATH", Some("battery_state.json"))?);
        let buffer_capacity = env.u64("HYBRID_BUFFER_CAPACITY", Some(3600))? as usize;
        if buffer_capacity == 0 {
            return Err(anyhow!("HYBRID_BUFFER_CAPACITY must be at least 1"));
        }
        let retry_initial = Duration::from_millis(env.u64("HYBRID_RETRY_INITIAL_MS", Some(500))?);
        let retry_max = Duration::from_millis(env.u64("HYBRID_RETRY_MAX_MS", Some(30_000))?);
        let snapshot_every = env.u64("HYBRID_SNAPSHOT_EVERY", Some(60))?;

        let defaults = EstimatorConfig::default();
        let estimator = EstimatorConfig {
            capacity_wh: env.f64("HYBRID_BATTERY_CAPACITY_WH", defaults.capacity_wh)?,
            v_min: env.f64("HYBRID_BATTERY_V_MIN", defaults.v_min)?,
            v_max: env.f64("HYBRID_BATTERY_V_MAX", defaults.v_max)?,
            load_w: env.f64("HYBRID_LOAD_W", defaults.load_w)?,
            initial_soc_fraction: env.f64(
                "HYBRID_INITIAL_SOC_FRACTION",
                defaults.initial_soc_fraction,
            )?,
            turbine_k: env.f64("HYBRID_TURBINE_K", defaults.turbine_k)?,
            max_step_seconds: env.f64("HYBRID_MAX_STEP_SECONDS", defaults.max_step_seconds)?,
        };
        estimator.validate().context("invalid battery/turbine parameters")?;

        let acquisition_defaults = AcquisitionConfig::default();
        let acquisition = AcquisitionConfig {
            sample_period: Duration::from_millis(env.u64("HYBRID_SAMPLE_PERIOD_MS", Some(1000))?),
            adc_samples: env.u64("HYBRID_ADC_SAMPLES", Some(16))? as usize,
            calibration_samples: env.u64("HYBRID_CALIBRATION_SAMPLES", Some(500))? as usize,
            wind_v_max: env.f64("HYBRID_WIND_V_MAX", acquisition_defaults.wind_v_max)?,
            ..acquisition_defaults
        };

        let status_interval =
            Duration::from_secs(env.u64("HYBRID_STATUS_INTERVAL_SECONDS", Some(60))?.max(1));

        Ok(Self {
            serial_port,
            baud_rate,
            read_timeout,
            reconnect_max,
            probe_timeout,
            db_path,
            state_path,
            buffer_capacity,
            retry_initial,
            retry_max,
            snapshot_every,
            estimator,
            acquisition,
            status_interval,
        })
    }

    pub fn ingest(&self) -> IngestConfig {
        IngestConfig {
            buffer_capacity: self.buffer_capacity,
            retry_initial: self.retry_initial,
            retry_max: self.retry_max,
        }
    }

    pub fn reader(&self) -> ReaderConfig {
        ReaderConfig {
            read_timeout: self.read_timeout,
            reconnect_initial: Duration::from_millis(500).min(self.reconnect_max),
            reconnect_max: self.reconnect_max,
        }
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string())
    }

    fn string(&self, key: &str, default: Option<&str>) -> Result<String> {
        match self.raw(key) {
            Some(value) => Ok(value),
            None => default
                .map(str::to_string)
                .ok_or_else(|| anyhow!("missing env var {key}")),
        }
    }

    fn u64(&self, key: &str, default: Option<u64>) -> Result<u64> {
        match self.raw(key) {
            Some(value) => value.parse::<u64>().with_context(|| format!("invalid {key}")),
            None => default.ok_or_else(|| anyhow!("missing env var {key}")),
        }
    }

    fn f64(&self, key: &str, default: f64) -> Result<f64> {
        match self.raw(key) {
            Some(value) => {
                let parsed = value.parse::<f64>().with_context(|| format!("invalid {key}"))?;
                if !parsed.is_finite() {
                    return Err(anyhow!("invalid {key}: must be finite"));
                }
                Ok(parsed)
            }
            None => Ok(default),
        }
    }

    fn optional(&self, key: &str) -> Option<String> {
        self.raw(key).filter(|v| !v.is_empty())
    }
}
