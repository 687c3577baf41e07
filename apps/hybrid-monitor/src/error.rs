use thiserror::Error;

/// Link-level faults. Never fatal: the reader backs off and reconnects.
#[derive(Debug, Error)]
pub enum TransportFault {
    #[error("serial device disconnected: {0}")]
    Disconnected(String),
    #[error("no serial device available: {0}")]
    Unavailable(String),
    #[error("serial i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a frame was dropped before reaching the estimator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("field {field} out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Storage could not be written; the samples stay buffered for retry.
    #[error("storage unavailable ({buffered} samples buffered): {reason}")]
    Unavailable { reason: String, buffered: usize },
    #[error("sample at {timestamp} precedes last accepted timestamp {last}")]
    OutOfOrder { timestamp: i64, last: i64 },
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        PersistenceError::Unavailable {
            reason: err.to_string(),
            buffered: 0,
        }
    }
}

/// A single failed transducer read.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorFault {
    #[error("{0} not responding")]
    NotResponding(&'static str),
    #[error("{channel} returned an invalid reading: {detail}")]
    InvalidReading {
        channel: &'static str,
        detail: String,
    },
}

/// Raised when a sensor the station cannot operate without fails to come up.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("required sensor {channel} failed to initialize: {source}")]
pub struct SensorInitFault {
    pub channel: &'static str,
    pub source: SensorFault,
}
