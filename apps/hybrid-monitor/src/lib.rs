pub mod acquisition;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod energy;
pub mod error;
pub mod estimator;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod store;
pub mod telemetry;
pub mod transport;
