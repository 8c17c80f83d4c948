use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aya::maps::{Array, HashMap as AyaHashMap, Map, MapData};
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::{watch, Mutex};

use planscout_common::protocol::NUM_DROP_REASONS;
use planscout_common::{TaskOffsets, NUM_OUS};

use scoutd::attach::AttachController;
use scoutd::config::Config;
use scoutd::consumer::run_consumer;
use scoutd::lifecycle::{children_of, run_lifecycle};
use scoutd::metrics::Metrics;
use scoutd::schema::OuSchema;
use scoutd::sink::CsvSink;
use scoutd::{codegen, offsets, schema};

#[derive(Parser, Debug)]
#[command(name = "scoutd")]
#[command(about = "Query-execution telemetry collector coordinator")]
struct Args {
    /// Postmaster process id to attach to
    #[arg(long)]
    pid: Option<u32>,
    /// Path to config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Output directory for the per-OU record files
    #[arg(long)]
    outdir: Option<PathBuf>,
    /// OU catalog header overriding the shipped one
    #[arg(long, value_name = "PATH")]
    schema: Option<PathBuf>,
    /// Write the generated collector source to PATH and exit
    #[arg(long, value_name = "PATH")]
    emit_collector: Option<PathBuf>,
}

const EXIT_ATTACH_FAILURE: i32 = 1;
const EXIT_SCHEMA_FAILURE: i32 = 2;
const EXIT_SINK_FAILURE: i32 = 3;

fn load_schemas(args: &Args, config: &Config) -> Result<Vec<OuSchema>> {
    let override_path = args
        .schema
        .as_ref()
        .or(config.collector.schema_path.as_ref());
    match override_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read catalog header {}", path.display()))?;
            schema::parse_catalog(&text)
        }
        None => schema::parse_catalog(schema::default_catalog()),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load(args.config.as_deref());

    let schemas = match load_schemas(&args, &config) {
        Ok(schemas) => schemas,
        Err(err) => {
            error!("[scoutd] schema extraction failed: {err:#}");
            process::exit(EXIT_SCHEMA_FAILURE);
        }
    };

    if let Some(path) = &args.emit_collector {
        let source = codegen::generate(&schemas);
        if let Err(err) = std::fs::write(path, source) {
            error!("[scoutd] write generated collector source: {err}");
            process::exit(EXIT_SCHEMA_FAILURE);
        }
        info!("[scoutd] wrote collector source for {} OUs to {}", schemas.len(), path.display());
        return;
    }

    let Some(postmaster) = args.pid else {
        error!("[scoutd] --pid <postmaster> is required to attach");
        process::exit(EXIT_ATTACH_FAILURE);
    };

    // Output sinks first: a collector we cannot drain should never be
    // attached.
    let outdir = args.outdir.unwrap_or_else(|| config.output.outdir.clone());
    let mut sinks = Vec::with_capacity(schemas.len());
    for schema in &schemas {
        match CsvSink::create(&outdir, schema) {
            Ok(sink) => sinks.push(Box::new(sink) as Box<dyn scoutd::sink::Sink>),
            Err(err) => {
                error!("[scoutd] output sink for {}: {err:#}", schema.name);
                process::exit(EXIT_SINK_FAILURE);
            }
        }
    }

    let task_offsets = offsets::derive_task_offsets().unwrap_or_else(|err| {
        warn!("[scoutd] BTF offset discovery failed, byte counters read zero: {err:#}");
        TaskOffsets::zeroed()
    });

    let metrics = Arc::new(Metrics::new());

    match run(
        postmaster,
        &config,
        schemas,
        sinks,
        task_offsets,
        Arc::clone(&metrics),
    )
    .await
    {
        Ok(()) => {
            info!(
                "[scoutd] clean shutdown: {} records, {} kernel drops",
                metrics.records_total(),
                metrics.kernel_drops_total()
            );
        }
        Err(err) => {
            error!("[scoutd] attach failed: {err:#}");
            process::exit(EXIT_ATTACH_FAILURE);
        }
    }
}

async fn run(
    postmaster: u32,
    config: &Config,
    schemas: Vec<OuSchema>,
    sinks: Vec<Box<dyn scoutd::sink::Sink>>,
    task_offsets: TaskOffsets,
    metrics: Arc<Metrics>,
) -> Result<()> {
    let mut controller = AttachController::load(config, schemas.clone(), task_offsets)?;

    // Hand the per-OU rings, the lifecycle ring, and the bookkeeping maps
    // to their consumers before the controller goes behind a lock.
    let mut rings = Vec::with_capacity(schemas.len());
    for schema in &schemas {
        rings.push(controller.take_ring(&schema.ring_map_name())?);
    }
    let lifecycle_ring = controller.take_ring("POSTMASTER_LIFECYCLE")?;
    let drops: Array<MapData, u64> = controller
        .take_map("COLLECTOR_DROPS")
        .context("map COLLECTOR_DROPS not found")?
        .try_into()
        .map_err(|err| anyhow::anyhow!("COLLECTOR_DROPS: {err}"))?;
    let socket_fds: Option<AyaHashMap<MapData, u32, i32>> = controller
        .take_map("CLIENT_SOCKET_FDS")
        .and_then(|map: Map| map.try_into().ok());

    controller.attach_postmaster(postmaster)?;
    for pid in children_of(postmaster) {
        if let Err(err) = controller.attach_backend(pid) {
            warn!("[scoutd] attach to existing backend {pid}: {err:#}");
        }
    }
    metrics.set_backends_attached(controller.attached_count());

    let controller = Arc::new(Mutex::new(controller));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut consumers = Vec::with_capacity(schemas.len());
    for ((ring, schema), sink) in rings.into_iter().zip(schemas.iter().cloned()).zip(sinks) {
        consumers.push(tokio::spawn(run_consumer(
            ring,
            schema,
            sink,
            Arc::clone(&metrics),
            shutdown_rx.clone(),
        )));
    }

    let lifecycle_task = tokio::spawn(lifecycle_loop(
        lifecycle_ring,
        Arc::clone(&controller),
        socket_fds,
        Arc::clone(&metrics),
        shutdown_rx.clone(),
    ));

    // Periodic drop-counter rollup, the only place kernel-side losses
    // become visible.
    {
        let metrics = Arc::clone(&metrics);
        let interval = Duration::from_secs(config.collector.metrics_log_secs.max(1));
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                for ou in 0..NUM_OUS as u32 {
                    for reason in 0..NUM_DROP_REASONS as u32 {
                        let idx = ou * NUM_DROP_REASONS as u32 + reason;
                        if let Ok(value) = drops.get(&idx, 0) {
                            metrics.set_kernel_drop(ou, reason, value);
                        }
                    }
                }
                info!(
                    "[scoutd] metrics: records={} kernel_drops={} decode_failures={} backends={}",
                    metrics.records_total(),
                    metrics.kernel_drops_total(),
                    metrics.decode_failures(),
                    metrics.backends_attached()
                );
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("[scoutd] shutting down: closing sinks, detaching probes");
    let _ = shutdown_tx.send(true);

    for consumer in consumers {
        match consumer.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("[scoutd] consumer exit: {err:#}"),
            Err(err) => warn!("[scoutd] consumer join: {err}"),
        }
    }
    let _ = lifecycle_task.await;

    controller.lock().await.detach_all();
    Ok(())
}

async fn lifecycle_loop(
    ring: aya::maps::RingBuf<MapData>,
    controller: Arc<Mutex<AttachController>>,
    socket_fds: Option<AyaHashMap<MapData, u32, i32>>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(err) = run_lifecycle(ring, controller, socket_fds, metrics, shutdown).await {
        warn!("[scoutd] lifecycle consumer exit: {err:#}");
    }
}
