//! api.rs — control surface for the companion bot.
//!
//! `/status` and `/stats` back the bot's commands of the same name;
//! `/metrics` exposes the Prometheus registry. Session renewal (`/login`)
//! lives in the companion bot, not here.

use std::sync::Arc;

use axum::{extract::Extension, routing::get, Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::authority::{score_label, AuthoritySnapshot};
use crate::status::{AuthorityRow, Counters, StatsReport, StatusReport};

#[derive(Clone)]
pub struct ApiState {
    pub counters: Arc<Counters>,
    pub authority_rx: watch::Receiver<AuthoritySnapshot>,
    pub started_at: u64,
    pub prometheus: PrometheusHandle,
}

/// Install the Prometheus recorder once per process.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus: install recorder")
}

pub fn create_router(state: ApiState) -> Router<()> {
    let prometheus = state.prometheus.clone();
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(status))
        .route("/stats", get(stats))
        .route(
            "/metrics",
            get(move || {
                let h = prometheus.clone();
                async move { h.render() }
            }),
        )
        .layer(CorsLayer::very_permissive())
        .layer(Extension(Arc::new(state)))
}

async fn status(Extension(state): Extension<Arc<ApiState>>) -> Json<StatusReport> {
    let now = crate::now_unix();
    Json(state.counters.report(now, state.started_at))
}

async fn stats(Extension(state): Extension<Arc<ApiState>>) -> Json<StatsReport> {
    let now = crate::now_unix();
    let snapshot = state.authority_rx.borrow().clone();
    let mut rows: Vec<AuthorityRow> = snapshot
        .iter()
        .map(|(source_id, &score)| AuthorityRow {
            source_id: source_id.clone(),
            score,
            label: score_label(score),
        })
        .collect();
    rows.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    rows.truncate(10);
    Json(StatsReport {
        authority_top: rows,
        emissions_last_hour: state.counters.emissions_last_hour(now),
    })
}
