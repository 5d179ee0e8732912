mod command;

use std::sync::Arc;
use std::time::Duration;

use sluice_core::alert::{signal_channel, AlertSink, ErrorPatternLayer, LogNotifier};
use sluice_core::schedule::{ScheduleRule, Scheduler};
use sluice_core::worker::{NlpStage, ScraperStage, StorageResultStore, WorkerPool};
use sluice_core::{
    Clock, LeaseQueue, Metrics, PipelineConfig, Queue, RocksDbStorage, StageEnv, Storage,
    SystemClock,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use command::{CommandAnalyzer, CommandIngestor, StageCommand};

/// How often expired dead letters are purged and queue depths reported.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match PipelineConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let (signals, signal_rx) = signal_channel(config.alerting.signal_capacity);
    sluice_core::telemetry::init_tracing_with_alerts(ErrorPatternLayer::new(
        config.alerting.patterns.clone(),
        signals.clone(),
    ));

    let stage_env = match StageEnv::from_env() {
        Ok(env) => env,
        Err(e) => {
            error!(error = %e, error_code = "missing_configuration", "refusing to start");
            std::process::exit(1);
        }
    };

    info!(data_dir = %config.storage.data_dir.display(), "opening storage");
    let storage: Arc<dyn Storage> = Arc::new(RocksDbStorage::open(&config.storage.data_dir)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Metrics::new();

    let open = |queue_config| -> Result<Arc<LeaseQueue>, Box<dyn std::error::Error>> {
        Ok(Arc::new(
            LeaseQueue::open(queue_config, Arc::clone(&storage), Arc::clone(&clock))?
                .with_metrics(metrics.clone())
                .with_signals(signals.clone()),
        ))
    };
    let scraper_queue = open(config.scraper_queue_config())?;
    let nlp_queue = open(config.nlp_queue_config())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if config.schedule.enabled {
        let rule = ScheduleRule::new(
            &config.schedule.name,
            &config.schedule.cron,
            scraper_queue.name(),
            config.schedule.payload.as_bytes(),
        )?;
        let scheduler = Scheduler::new()
            .with_target(Arc::clone(&scraper_queue))
            .with_rule(rule)?
            .with_skip_if_older_than(Duration::from_millis(config.schedule.skip_if_older_than_ms))
            .with_metrics(metrics.clone())
            .with_signals(signals.clone());
        tasks.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));
    } else {
        warn!("schedule disabled, triggers must be enqueued externally");
    }

    let workers = &config.workers;
    let scraper_stage = ScraperStage::new(
        CommandIngestor::new(StageCommand::new(&workers.scraper_command, stage_env.clone())?),
        Arc::clone(&nlp_queue),
    );
    tasks.extend(
        WorkerPool::new(Arc::clone(&scraper_queue), scraper_stage, workers.worker_config())
            .with_concurrency(workers.scraper_concurrency)
            .with_metrics(metrics.clone())
            .with_signals(signals.clone())
            .spawn(shutdown_rx.clone()),
    );

    let nlp_stage = NlpStage::new(
        CommandAnalyzer::new(StageCommand::new(&workers.nlp_command, stage_env)?),
        Arc::clone(&nlp_queue),
        StorageResultStore::new(Arc::clone(&storage)),
    )
    .with_follow_up_delay(Duration::from_millis(workers.follow_up_delay_ms));
    tasks.extend(
        WorkerPool::new(Arc::clone(&nlp_queue), nlp_stage, workers.worker_config())
            .with_concurrency(workers.nlp_concurrency)
            .with_metrics(metrics.clone())
            .with_signals(signals.clone())
            .spawn(shutdown_rx.clone()),
    );

    let sink = AlertSink::new(signal_rx, Box::new(LogNotifier), Arc::clone(&clock))
        .with_rules(config.alerting.rules())
        .with_metrics(metrics.clone());
    tasks.push(tokio::spawn(sink.run(
        Duration::from_millis(config.alerting.tick_interval_ms),
        shutdown_rx.clone(),
    )));

    tasks.push(tokio::spawn(housekeeping(
        vec![Arc::clone(&scraper_queue), Arc::clone(&nlp_queue)],
        shutdown_rx,
    )));

    info!(
        scraper_queue = scraper_queue.name(),
        nlp_queue = nlp_queue.name(),
        tasks = tasks.len(),
        "pipeline running"
    );

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "task failed during shutdown");
        }
    }
    storage.flush()?;
    info!("pipeline stopped");
    Ok(())
}

/// Purge dead letters past retention and refresh depth gauges.
async fn housekeeping(queues: Vec<Arc<LeaseQueue>>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for queue in &queues {
                    housekeep(queue);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn housekeep(queue: &LeaseQueue) {
    match queue.purge_expired_dead_letters() {
        Ok(0) => {}
        Ok(purged) => info!(queue = queue.name(), purged, "expired dead letters purged"),
        Err(e) => warn!(queue = queue.name(), error = %e, "dead-letter purge failed"),
    }
    match queue.stats() {
        Ok(stats) => info!(
            queue = queue.name(),
            visible = stats.visible,
            in_flight = stats.in_flight,
            delayed = stats.delayed,
            dead_letters = stats.dead_letters,
            "queue stats"
        ),
        Err(e) => warn!(queue = queue.name(), error = %e, "queue stats unavailable"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;

    info!("received shutdown signal");
}
