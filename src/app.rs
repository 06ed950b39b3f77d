//! app.rs — top-level supervisor.
//!
//! Owns the process-wide components (store, authority ledger, correlation
//! index, budget) and wires the task graph with bounded channels:
//!
//! listener → pipeline → extractor → correlation ↔ authority → sender
//!
//! Shutdown is cooperative: the pipeline flushes its in-flight batch, the
//! correlation and sender tasks drain their channels, the store closes
//! last.

use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::gauge;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{self, ApiState};
use crate::authority::{
    run_authority_task, AuthorityConfig, AuthorityLedger, AuthoritySnapshot, AuthorityUpdate,
};
use crate::budget::BudgetLedger;
use crate::config::Config;
use crate::correlate::{ClusterAction, CorrelationConfig, CorrelationEngine};
use crate::extract::{ExtractProvider, Extractor};
use crate::models::{Event, RawMessage, SourceAuthority};
use crate::pipeline::{run_pipeline, IntakeEvent, Pipeline, PipelineConfig};
use crate::sender::{run_sender, Emission, OutputSink, Sender, SenderConfig};
use crate::sources;
use crate::status::Counters;
use crate::store::Store;

const INTAKE_CAPACITY: usize = 1_024;
const EVENTS_CAPACITY: usize = 256;
const AUTHORITY_CAPACITY: usize = 128;
const EMISSIONS_CAPACITY: usize = 64;

/// Handle the external chat-network listener feeds messages through.
#[derive(Clone)]
pub struct IntakeHandle {
    tx: mpsc::Sender<IntakeEvent>,
}

impl IntakeHandle {
    pub fn channel() -> (Self, mpsc::Receiver<IntakeEvent>) {
        let (tx, rx) = mpsc::channel(INTAKE_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn message(&self, raw: RawMessage) -> Result<()> {
        self.tx
            .send(IntakeEvent::Message(raw))
            .await
            .context("pipeline gone")
    }

    pub async fn auth_revoked(&self) -> Result<()> {
        self.tx
            .send(IntakeEvent::AuthRevoked)
            .await
            .context("pipeline gone")
    }

    pub async fn auth_restored(&self) -> Result<()> {
        self.tx
            .send(IntakeEvent::AuthRestored)
            .await
            .context("pipeline gone")
    }
}

/// Alert-network boilerplate that is noise for trend purposes.
fn default_blocklist() -> Vec<String> {
    ["צבע אדום", "גרם", "היכנסו למרחב המוגן", "חדירת כלי טיס עוין"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Channel-signature suffixes commonly appended by the monitored channels.
fn default_trailer_patterns() -> Vec<String> {
    ["[عاجل]", "[حصري]", "[מבזק]"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Build and run the whole engine until `cancel` fires or a task fails
/// fatally. The provider and sink are the two external collaborators.
pub async fn run(
    cfg: Config,
    provider: Arc<dyn ExtractProvider>,
    sink: Arc<dyn OutputSink>,
    intake_rx: mpsc::Receiver<IntakeEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let started_at = crate::now_unix();
    let counters = Arc::new(Counters::new());
    let prometheus = api::init_metrics();

    let store = Store::open(&cfg.db_path).await.context("opening store")?;
    let stale = store.open_cluster_ids().await?;
    if !stale.is_empty() {
        warn!(count = stale.len(), "open clusters from a previous run kept for audit");
    }

    // Seed the authority ledger: persisted rows plus the configured lists
    let mut seed = store.load_authorities().await?;
    let arab = load_list_or_empty(&cfg.arab_sources_file);
    let smart = load_list_or_empty(&cfg.smart_sources_file);
    info!(arab = arab.len(), smart = smart.len(), "source channels loaded");
    for ch in arab.iter().chain(smart.iter()) {
        if !seed.contains_key(ch) {
            let initial = SourceAuthority::initial(started_at);
            store.update_authority(ch, &initial).await?;
            seed.insert(ch.clone(), initial);
        }
    }
    let ledger = AuthorityLedger::with_seed(
        AuthorityConfig {
            high_threshold: cfg.authority_high_threshold,
            ..AuthorityConfig::default()
        },
        seed,
    );
    let (snapshot_tx, snapshot_rx) = watch::channel(ledger.snapshot());

    let (authority_tx, authority_updates) = mpsc::channel::<AuthorityUpdate>(AUTHORITY_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel::<Event>(EVENTS_CAPACITY);
    let (emissions_tx, emissions_rx) = mpsc::channel::<Emission>(EMISSIONS_CAPACITY);

    let pipeline = Pipeline::new(
        PipelineConfig {
            batch_size: cfg.batch_size,
            max_batch_age_secs: cfg.max_batch_age_secs,
            blocklist: default_blocklist(),
            trailer_patterns: default_trailer_patterns(),
            ..PipelineConfig::default()
        },
        store.clone(),
        Arc::clone(&counters),
    );
    let extractor = Extractor::new(
        provider,
        BudgetLedger::new(cfg.llm_rpm_limit, cfg.llm_budget_hourly),
    );
    let engine = CorrelationEngine::new(CorrelationConfig {
        min_sources: cfg.min_sources,
        authority_high_threshold: cfg.authority_high_threshold,
        ..CorrelationConfig::default()
    });
    let sender = Sender::new(
        SenderConfig {
            min_interval_secs: cfg.summary_min_interval_secs,
        },
        sink,
        snapshot_rx.clone(),
        Arc::clone(&counters),
    );

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    tasks.spawn(run_pipeline(
        pipeline,
        extractor,
        intake_rx,
        events_tx,
        cancel.clone(),
    ));
    tasks.spawn(run_correlation(
        engine,
        store.clone(),
        events_rx,
        authority_tx,
        emissions_tx,
        snapshot_rx.clone(),
        Arc::clone(&counters),
        cancel.clone(),
    ));
    tasks.spawn(run_authority_task(
        ledger,
        store.clone(),
        authority_updates,
        snapshot_tx,
        cancel.clone(),
    ));
    tasks.spawn(run_sender(sender, emissions_rx, cancel.clone()));

    // Control surface
    let listener = tokio::net::TcpListener::bind(&cfg.control_addr)
        .await
        .with_context(|| format!("binding control address {}", cfg.control_addr))?;
    info!(addr = %cfg.control_addr, "control surface up");
    let router = api::create_router(ApiState {
        counters: Arc::clone(&counters),
        authority_rx: snapshot_rx,
        started_at,
        prometheus,
    });
    let api_cancel = cancel.clone();
    tasks.spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { api_cancel.cancelled().await })
            .await
            .context("control server")
    });

    info!(
        batch = cfg.batch_size,
        max_age = cfg.max_batch_age_secs,
        summary_gap = cfg.summary_min_interval_secs,
        min_sources = cfg.min_sources,
        "engine online"
    );

    // First fatal task failure takes the process down; otherwise wait for
    // the external cancel.
    let mut failure: Option<anyhow::Error> = None;
    tokio::select! {
        _ = cancel.cancelled() => {}
        Some(res) = tasks.join_next() => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "task failed, shutting down");
                    failure = Some(e);
                }
                Err(e) => {
                    error!(error = %e, "task panicked, shutting down");
                    failure = Some(e.into());
                }
            }
        }
    }

    cancel.cancel();
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "task error during shutdown");
                failure.get_or_insert(e);
            }
            Err(e) => {
                error!(error = %e, "task panic during shutdown");
                failure.get_or_insert(e.into());
            }
        }
    }

    // Store closes last
    store.close().await;
    info!("shutdown complete");
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn load_list_or_empty(path: &std::path::Path) -> Vec<String> {
    match sources::load_channel_list(path) {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "channel list missing, starting empty");
            Vec::new()
        }
    }
}

/// Correlation task: pure match step per event, then dispatch of the
/// resulting side effects. Keeps draining after cancel until the pipeline
/// closes the event channel, so flushed batches still correlate.
#[allow(clippy::too_many_arguments)]
async fn run_correlation(
    mut engine: CorrelationEngine,
    store: Store,
    mut events_rx: mpsc::Receiver<Event>,
    authority_tx: mpsc::Sender<AuthorityUpdate>,
    emissions_tx: mpsc::Sender<Emission>,
    authority_rx: watch::Receiver<AuthoritySnapshot>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut sweep_tick = tokio::time::interval(std::time::Duration::from_secs(5));
    sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut draining = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled(), if !draining => {
                draining = true;
            }
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                let now = crate::now_unix();
                let snapshot = authority_rx.borrow().clone();
                let actions = engine.ingest(event, &snapshot, now);
                dispatch(actions, &store, &authority_tx, &emissions_tx, &counters).await?;
                gauge!("open_clusters").set(engine.open_count() as f64);
            }
            _ = sweep_tick.tick() => {
                let now = crate::now_unix();
                let snapshot = authority_rx.borrow().clone();
                let actions = engine.sweep(&snapshot, now);
                dispatch(actions, &store, &authority_tx, &emissions_tx, &counters).await?;
                gauge!("open_clusters").set(engine.open_count() as f64);
            }
        }
    }
    info!(target: "correlate", "correlation task stopped");
    Ok(())
}

async fn dispatch(
    actions: Vec<ClusterAction>,
    store: &Store,
    authority_tx: &mpsc::Sender<AuthorityUpdate>,
    emissions_tx: &mpsc::Sender<Emission>,
    counters: &Counters,
) -> Result<()> {
    for action in actions {
        match action {
            ClusterAction::Persist { cluster, new_event } => {
                store.put_cluster_update(&cluster, new_event.as_ref()).await?;
            }
            ClusterAction::Emit(report) => {
                let _ = emissions_tx.send(Emission::Report(report)).await;
            }
            ClusterAction::Retract {
                cluster_id,
                kind,
                location,
                reason,
            } => {
                let _ = emissions_tx
                    .send(Emission::Retraction {
                        cluster_id,
                        kind,
                        location,
                        reason,
                    })
                    .await;
            }
            ClusterAction::Authority(update) => {
                let _ = authority_tx.send(update).await;
            }
            ClusterAction::Discard {
                cluster_id,
                event_ids,
            } => {
                Counters::bump(&counters.clusters_discarded);
                let now = crate::now_unix();
                store.mark_cluster_discarded(&cluster_id, now).await?;
                info!(
                    target: "correlate",
                    cluster = %cluster_id,
                    events = event_ids.len(),
                    "single-source cluster released for audit"
                );
            }
        }
    }
    Ok(())
}
