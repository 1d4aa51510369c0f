use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use watt_aggregator::{Aggregator, AggregatorConfig, AggregatorStats, Intake};
use watt_core::{Resource, WattEvent};

#[derive(Parser, Debug)]
#[command(name = "wattctl", version, about = "Aggregate kube resources and consul endpoints into snapshots")]
struct Cli {
    /// Pretty-print snapshots instead of one JSON document per line
    #[arg(long = "pretty", global = true, action = ArgAction::SetTrue)]
    pretty: bool,

    /// Kinds that must sync before the first snapshot (lowercase, e.g. "configmap")
    #[arg(long = "require", global = true, env = "WATT_REQUIRE", value_delimiter = ',')]
    require: Vec<String>,

    /// Capacity of each aggregator intake queue
    #[arg(long = "queue-cap", global = true, env = "WATT_QUEUE_CAP", default_value_t = 64)]
    queue_cap: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch kube kinds, read consul endpoint events as JSON lines on stdin, print snapshots
    Run {
        /// GVK key to watch, e.g. "v1/ConfigMap" (repeatable)
        #[arg(long = "watch", required = true)]
        watch: Vec<String>,
        /// Kubernetes namespace (default: all)
        #[arg(long = "ns", env = "WATT_NS")]
        namespace: Option<String>,
    },
    /// Feed a JSON-lines event file through the aggregator and print snapshots
    Replay {
        /// Path to the event file
        file: std::path::PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("WATT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("WATT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid WATT_METRICS_ADDR; expected host:port");
        }
    }
}

/// Forward JSON-lines `WattEvent`s into the aggregator. Malformed lines are skipped.
/// With `progress`, each event is processed before the next line is sent, so the
/// file order holds across both intakes.
async fn pump_lines<R: AsyncBufRead + Unpin>(
    reader: R,
    intake: Intake,
    source: &str,
    mut progress: Option<watch::Receiver<AggregatorStats>>,
) -> Result<u64> {
    let mut lines = reader.lines();
    let mut sent = 0u64;
    while let Some(line) = lines.next_line().await.with_context(|| format!("reading {}", source))? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let ev: WattEvent = match serde_json::from_str(line) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, source, "skipping malformed event line");
                continue;
            }
        };
        let ok = match ev {
            WattEvent::Kubernetes(k) => intake.kubernetes.send(k).await.is_ok(),
            WattEvent::Consul(c) => intake.consul.send(c).await.is_ok(),
        };
        if !ok {
            warn!(source, "aggregator intake closed");
            break;
        }
        sent += 1;
        if let Some(rx) = progress.as_mut() {
            if rx.wait_for(|s| s.kubernetes_events + s.consul_events >= sent).await.is_err() {
                warn!(source, "aggregator exited mid-feed");
                break;
            }
        }
    }
    debug!(source, sent, "event feed exhausted");
    Ok(sent)
}

fn spawn_printers(
    pretty: bool,
    mut snapshots: mpsc::Receiver<String>,
    mut watches: mpsc::Receiver<Vec<Resource>>,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let snaps = tokio::spawn(async move {
        while let Some(s) = snapshots.recv().await {
            if pretty {
                match serde_json::from_str::<serde_json::Value>(&s).and_then(|v| serde_json::to_string_pretty(&v)) {
                    Ok(p) => println!("{}", p),
                    Err(_) => println!("{}", s),
                }
            } else {
                println!("{}", s);
            }
        }
    });
    let watch = tokio::spawn(async move {
        while let Some(list) = watches.recv().await {
            let names: Vec<String> = list.iter().map(Resource::key).collect();
            info!(resolvers = ?names, "watch list updated");
        }
    });
    (snaps, watch)
}

/// Replay a JSON-lines feed in file order; returns once the aggregator has exited.
async fn replay<R: AsyncBufRead + Unpin>(
    reader: R,
    config: AggregatorConfig,
    snapshots: mpsc::Sender<String>,
    watches: mpsc::Sender<Vec<Resource>>,
    source: &str,
) -> Result<u64> {
    let (agg, intake) = Aggregator::new(config, snapshots, watches);
    let running = agg.start();
    let sent = pump_lines(reader, intake, source, Some(running.stats())).await?;
    // intake dropped: the loop drains what is queued and exits
    running.wait().await?;
    Ok(sent)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let (snap_tx, snap_rx) = mpsc::channel::<String>(cli.queue_cap.max(1));
    let (watch_tx, watch_rx) = mpsc::channel::<Vec<Resource>>(cli.queue_cap.max(1));
    let (p_snaps, p_watch) = spawn_printers(cli.pretty, snap_rx, watch_rx);

    match cli.command {
        Commands::Run { watch, namespace } => {
            let require = if cli.require.is_empty() {
                // every watched kind has to sync before the first snapshot
                watch
                    .iter()
                    .map(|k| watt_kubehub::parse_gvk_key(k).map(|g| watt_kubehub::kind_label(&g)))
                    .collect::<Result<Vec<_>>>()?
            } else {
                cli.require.clone()
            };
            info!(watch = ?watch, require = ?require, ns = ?namespace, "run invoked");
            let config = AggregatorConfig {
                intake_capacity: cli.queue_cap,
                ..AggregatorConfig::with_required_kinds(require)
            };
            let (agg, intake) = Aggregator::new(config, snap_tx, watch_tx);
            let running = agg.start();

            let mut watchers = Vec::new();
            for gvk in watch {
                let ns = namespace.clone();
                let tx = intake.kubernetes.clone();
                watchers.push(tokio::spawn(async move {
                    if let Err(e) = watt_kubehub::start_watcher(&gvk, ns.as_deref(), tx).await {
                        error!(gvk = %gvk, error = ?e, "watcher failed");
                    }
                }));
            }
            let feed = tokio::spawn(async move {
                if let Err(e) = pump_lines(BufReader::new(tokio::io::stdin()), intake, "stdin", None).await {
                    error!(error = ?e, "stdin feed failed");
                }
            });

            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received; stopping aggregator");
            feed.abort();
            for w in watchers {
                w.abort();
            }
            running.stop().await?;
        }
        Commands::Replay { file } => {
            info!(file = %file.display(), require = ?cli.require, "replay invoked");
            let config = AggregatorConfig {
                intake_capacity: cli.queue_cap,
                ..AggregatorConfig::with_required_kinds(cli.require.clone())
            };
            let f = tokio::fs::File::open(&file).await.with_context(|| format!("opening {}", file.display()))?;
            let sent = replay(BufReader::new(f), config, snap_tx, watch_tx, &file.display().to_string()).await?;
            info!(events = sent, "replay finished");
        }
    }

    let _ = p_snaps.await;
    let _ = p_watch.await;
    Ok(())
}
