use chrono::DateTime;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "hybrid-monitor",
    version,
    about = "Solar/wind/battery telemetry pipeline"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest frames from the station's serial link.
    Run(RunArgs),
    /// Run the acquisition unit over simulated transducers and ingest its frames.
    Simulate(SimulateArgs),
    /// Print the most recent stored sample.
    Latest,
    History(HistoryArgs),
    Aggregate(WindowArgs),
    /// Integrate generated energy per source over a window.
    Energy(WindowArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Serial device; probes /dev/ttyACM* and /dev/ttyUSB* when omitted.
    #[arg(long)]
    pub port: Option<String>,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(long, default_value_t = 1)]
    pub seed: u64,
    /// Splits each encoded frame into chunks of this many bytes.
    #[arg(long, default_value_t = 24, value_parser = clap::value_parser!(u64).range(1..))]
    pub chunk_bytes: u64,
    /// Pins the simulated hour of day (0-24) instead of following the local clock.
    #[arg(long)]
    pub hour: Option<f64>,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[arg(long, value_parser = parse_timestamp)]
    pub start: Option<i64>,
    #[arg(long, value_parser = parse_timestamp)]
    pub end: Option<i64>,
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct WindowArgs {
    #[arg(long, value_parser = parse_timestamp)]
    pub start: i64,
    #[arg(long, value_parser = parse_timestamp)]
    pub end: i64,
}

/// Accepts Unix seconds or an RFC 3339 timestamp.
pub fn parse_timestamp(raw: &str) -> Result<i64, String> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Ok(secs);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp())
        .map_err(|err| format!("expected unix seconds or RFC 3339 ({err})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_accept_unix_seconds_and_rfc3339() {
        assert_eq!(parse_timestamp("1700000000"), Ok(1_700_000_000));
        assert_eq!(parse_timestamp("2023-11-14T22:13:20Z"), Ok(1_700_000_000));
        assert_eq!(parse_timestamp("2023-11-14T23:13:20+01:00"), Ok(1_700_000_000));
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn window_commands_require_both_bounds() {
        assert!(Cli::try_parse_from(["hybrid-monitor", "energy", "--start", "0"]).is_err());
        let cli =
            Cli::try_parse_from(["hybrid-monitor", "aggregate", "--start", "0", "--end", "60"])
                .unwrap();
        match cli.command {
            Commands::Aggregate(args) => assert_eq!((args.start, args.end), (0, 60)),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn simulate_rejects_zero_chunk_size() {
        assert!(Cli::try_parse_from(["hybrid-monitor", "simulate", "--chunk-bytes", "0"]).is_err());
        let cli = Cli::try_parse_from(["hybrid-monitor", "simulate"]).unwrap();
        match cli.command {
            Commands::Simulate(args) => assert_eq!(args.chunk_bytes, 24),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
