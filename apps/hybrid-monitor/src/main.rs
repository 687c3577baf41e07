use anyhow::{anyhow, Context, Result};
use clap::Parser;
use hybrid_monitor::acquisition::simulated::SimulatedStation;
use hybrid_monitor::cli::{Cli, Commands, HistoryArgs, RunArgs, SimulateArgs, WindowArgs};
use hybrid_monitor::config::Config;
use hybrid_monitor::energy::energy_window;
use hybrid_monitor::estimator::{load_snapshot, Estimator};
use hybrid_monitor::frame::encode_frame;
use hybrid_monitor::ingest::Ingestor;
use hybrid_monitor::pipeline::{spawn_reader, Pipeline, PipelineStats};
use hybrid_monitor::store::{ReopeningStore, TelemetryStore};
use hybrid_monitor::transport::{detect_port, ChannelTransport, FrameTransport, SerialTransport};
use serde::Serialize;
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEV_DIR: &str = "/dev";

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hybrid_monitor=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing()?;

    match cli.command {
        Commands::Run(args) => run_live(config, args).await,
        Commands::Simulate(args) => run_simulated(config, args).await,
        Commands::Latest => print_json(&open_for_queries(&config)?.latest()?),
        Commands::History(HistoryArgs { start, end, limit }) => {
            print_json(&open_for_queries(&config)?.history(start, end, limit)?)
        }
        Commands::Aggregate(WindowArgs { start, end }) => {
            print_json(&open_for_queries(&config)?.aggregate(start, end)?)
        }
        Commands::Energy(WindowArgs { start, end }) => {
            print_json(&energy_window(&open_for_queries(&config)?, start, end)?)
        }
    }
}

async fn run_live(config: Config, args: RunArgs) -> Result<()> {
    let port = args.port.or_else(|| config.serial_port.clone());
    let baud_rate = config.baud_rate;
    let probe_timeout = config.probe_timeout;
    let transport = tokio::task::spawn_blocking(move || match port {
        Some(path) => SerialTransport::open(&path, baud_rate),
        None => detect_port(Path::new(DEV_DIR), baud_rate, probe_timeout),
    })
    .await
    .context("serial open task failed")?
    .context("no serial link to the station")?;

    supervise(transport, &config).await
}

async fn run_simulated(config: Config, args: SimulateArgs) -> Result<()> {
    let mut station = SimulatedStation::new(args.seed, config.acquisition);
    if let Some(hour) = args.hour {
        station = station.with_fixed_hour(hour);
    }
    let unit = station.start().context("simulated station failed to start")?;
    let calibration = unit.calibration();
    tracing::info!(
        seed = args.seed,
        zero_offset_v = calibration.zero_offset_v,
        degraded = unit.degraded().len(),
        "simulated station calibrated"
    );

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let chunk_bytes = usize::try_from(args.chunk_bytes).unwrap_or(usize::MAX);
    let cancel = CancellationToken::new();
    let producer_cancel = cancel.clone();
    let producer = std::thread::Builder::new()
        .name("acquisition".to_string())
        .spawn(move || {
            unit.run(producer_cancel, |frame| {
                let wire = encode_frame(frame);
                wire.as_bytes()
                    .chunks(chunk_bytes)
                    .all(|chunk| tx.send(chunk.to_vec()).is_ok())
            });
        })
        .context("failed to spawn acquisition thread")?;

    let result = supervise_with(
        ChannelTransport::new(rx, format!("simulator(seed={})", args.seed)),
        &config,
        cancel.clone(),
    )
    .await;
    cancel.cancel();
    join_thread(producer, "acquisition").await?;
    result
}

async fn supervise<T: FrameTransport + 'static>(transport: T, config: &Config) -> Result<()> {
    supervise_with(transport, config, CancellationToken::new()).await
}

/// Runs the reader thread until the source closes or Ctrl-C, logging status meanwhile.
async fn supervise_with<T: FrameTransport + 'static>(
    transport: T,
    config: &Config,
    cancel: CancellationToken,
) -> Result<()> {
    let (pipeline, stats) = build_pipeline(config)?;
    let reader = spawn_reader(transport, pipeline, config.reader(), cancel.clone())?;
    let ticker = spawn_status_ticker(stats, config.status_interval, cancel.clone());

    let mut joined = tokio::task::spawn_blocking(move || reader.join());
    let outcome = tokio::select! {
        res = &mut joined => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            cancel.cancel();
            joined.await
        }
    };
    cancel.cancel();
    ticker.await.ok();

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(anyhow!("serial-reader thread panicked")),
        Err(err) => Err(err).context("join serial-reader thread"),
    }
}

fn build_pipeline(config: &Config) -> Result<(Pipeline<ReopeningStore>, Arc<PipelineStats>)> {
    let estimator = match load_snapshot(&config.state_path) {
        Ok(Some(state)) => {
            tracing::info!(
                e_wh = state.e_wh,
                last_ts = ?state.last_ts,
                "restored battery state"
            );
            Estimator::restore(config.estimator, state)
        }
        Ok(None) => Estimator::new(config.estimator),
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "ignoring unreadable battery state");
            Estimator::new(config.estimator)
        }
    };

    let mut sink = ReopeningStore::new(&config.db_path);
    if let Err(err) = sink.connect() {
        tracing::warn!(
            error = %err,
            db = %config.db_path.display(),
            "store unavailable at startup; buffering until it opens"
        );
    }

    let stats = Arc::new(PipelineStats::new());
    let ingestor = Ingestor::new(sink, config.ingest(), stats.ingest.clone());
    let pipeline = Pipeline::new(estimator, ingestor, stats.clone())
        .with_snapshots(&config.state_path, config.snapshot_every);
    Ok((pipeline, stats))
}

fn spawn_status_ticker(
    stats: Arc<PipelineStats>,
    every: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => stats.log_status(),
            }
        }
    })
}

async fn join_thread(handle: JoinHandle<()>, name: &'static str) -> Result<()> {
    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(anyhow!("{name} thread panicked")),
        Err(err) => Err(err).with_context(|| format!("join {name} thread")),
    }
}

fn open_for_queries(config: &Config) -> Result<TelemetryStore> {
    TelemetryStore::open_read_only(&config.db_path)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
