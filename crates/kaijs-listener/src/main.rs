//! Listener binary (§4.1): subscribes to the broker and durably spools every
//! envelope it receives. Two tasks talk over a bounded channel — a
//! supervisor that polls the broker and a spool writer that owns the file
//! queue — so a slow disk never blocks the broker's ack window.

#![deny(unsafe_code)]

use clap::Parser;
use kaijs_broker::{broker_for, BrokerClient, BrokerMessage};
use kaijs_config::Config;
use kaijs_model::SpoolMessage;
use kaijs_spool::Spool;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CHANNEL_CAPACITY: usize = 256;
const POLL_IDLE: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "kaijs-listener", version, about = "CI broker listener")]
struct Args {
    /// Override `KAIJS_SPOOL_DIR`.
    #[arg(long)]
    spool_dir: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mut config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("invalid configuration, falling back to defaults: {e}");
        Config::default()
    });
    if let Some(dir) = args.spool_dir {
        config.spool_dir = dir;
    }

    init_tracing(&config);

    let spool = match Spool::open_with_scan_batch(&config.spool_dir, config.spool_scan_batch) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(target: "kaijs::listener", error = %e, "failed to open spool");
            std::process::exit(1);
        }
    };

    let broker = broker_for(config.broker_kind, &config.broker_url, &config.broker_client_name);
    run(broker, spool, &config).await;
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Liveness counters shared between the supervisor and spool-writer tasks,
/// snapshotted once a minute per §4.10.
#[derive(Default)]
struct Liveness {
    received: AtomicU64,
    spooled: AtomicU64,
    ack_failures: AtomicU64,
}

async fn run(broker: Box<dyn BrokerClient>, spool: Spool, config: &Config) {
    let broker: Arc<dyn BrokerClient> = Arc::from(broker);
    let (tx, rx) = mpsc::channel::<BrokerMessage>(CHANNEL_CAPACITY);
    let stop = Arc::new(AtomicBool::new(false));
    let liveness = Arc::new(Liveness::default());

    let supervisor = tokio::spawn(supervise(
        Arc::clone(&broker),
        tx,
        Arc::clone(&stop),
        Arc::clone(&liveness),
    ));
    let writer = tokio::spawn(write_spool(
        rx,
        spool,
        Arc::clone(&broker),
        Arc::clone(&liveness),
    ));
    let status = tokio::spawn(status_loop(
        Arc::clone(&liveness),
        Arc::clone(&stop),
        Duration::from_secs(config.listener_status_interval_secs.max(1)),
    ));

    wait_for_shutdown_signal().await;
    info!(target: "kaijs::listener", "shutdown signal received, stopping listener");
    stop.store(true, Ordering::SeqCst);

    let _ = supervisor.await;
    let _ = writer.await;
    let _ = status.await;
    let _ = broker.close().await;
    info!(target: "kaijs::listener", "listener stopped, no in-flight envelope committed");
}

async fn supervise(
    broker: Arc<dyn BrokerClient>,
    tx: mpsc::Sender<BrokerMessage>,
    stop: Arc<AtomicBool>,
    liveness: Arc<Liveness>,
) {
    while !stop.load(Ordering::SeqCst) {
        match broker.receive().await {
            Ok(Some(msg)) => {
                liveness.received.fetch_add(1, Ordering::Relaxed);
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Ok(None) => tokio::time::sleep(POLL_IDLE).await,
            Err(e) => {
                warn!(target: "kaijs::listener", error = %e, "broker receive failed");
                if kaijs_error::disposition(e.code) == kaijs_error::Disposition::FatalExit(1) {
                    stop.store(true, Ordering::SeqCst);
                    break;
                }
                tokio::time::sleep(POLL_IDLE).await;
            }
        }
    }
}

async fn write_spool(
    mut rx: mpsc::Receiver<BrokerMessage>,
    spool: Spool,
    broker: Arc<dyn BrokerClient>,
    liveness: Arc<Liveness>,
) {
    while let Some(msg) = rx.recv().await {
        let envelope = SpoolMessage {
            spool_id: SpoolMessage::make_spool_id(msg.provider_ts, &msg.msg_id),
            broker_msg_id: msg.msg_id.clone(),
            broker_topic: SpoolMessage::normalize_topic(&msg.topic),
            provider_name: "kaijs-listener".into(),
            provider_ts: msg.provider_ts,
            header_ts: msg.header_ts,
            body: msg.body.clone(),
            broker_extra: msg.extra.clone(),
        };

        match spool.push(&envelope) {
            Ok(()) => {
                liveness.spooled.fetch_add(1, Ordering::Relaxed);
                if broker.ack(&msg).await.is_err() {
                    liveness.ack_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                tracing::error!(target: "kaijs::listener", error = %e, "failed to spool envelope, nacking for redelivery");
                let _ = broker.nack(&msg).await;
            }
        }
    }
}

async fn status_loop(liveness: Arc<Liveness>, stop: Arc<AtomicBool>, interval: Duration) {
    let started_at = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = wait_until_stopped(&stop) => break,
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }
        info!(
            target: "kaijs::listener",
            uptime_secs = started_at.elapsed().as_secs(),
            messages_received = liveness.received.load(Ordering::Relaxed),
            messages_spooled = liveness.spooled.load(Ordering::Relaxed),
            ack_failures = liveness.ack_failures.load(Ordering::Relaxed),
            "listener liveness snapshot"
        );
    }
}

async fn wait_until_stopped(stop: &Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigabrt = signal(SignalKind::hangup()).expect("install SIGABRT-equivalent handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
        _ = sigabrt.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
