//! status.rs — process counters for the control surface.
//!
//! Atomics for the hot-path increments, a small rolling window for the
//! last-hour emission count. Shared as `Arc<Counters>` across tasks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use metrics::{counter, describe_counter, describe_gauge};
use once_cell::sync::OnceCell;
use serde::Serialize;

/// One-time metrics registration so series show up on /metrics.
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingress_messages_total", "Messages handed in by the listener.");
        describe_counter!("ingress_dropped_total", "Oldest messages dropped on queue overflow.");
        describe_counter!("dedup_skipped_total", "Messages rejected as duplicates.");
        describe_counter!("llm_calls_total", "LLM completion calls charged to the budget.");
        describe_counter!("extract_schema_failures_total", "Batches failing schema after repair.");
        describe_counter!("clusters_emitted_total", "Clusters emitted to the output channel.");
        describe_counter!("retractions_total", "Retraction messages emitted.");
        describe_gauge!("open_clusters", "Open clusters in the correlation pool.");
    });
}

#[derive(Debug, Default)]
pub struct Counters {
    pub messages_in: AtomicU64,
    pub dropped_ingress: AtomicU64,
    pub dropped_empty: AtomicU64,
    pub dropped_blocked: AtomicU64,
    pub dup_skipped: AtomicU64,
    pub batches_extracted: AtomicU64,
    pub extract_failures: AtomicU64,
    pub events_extracted: AtomicU64,
    pub clusters_emitted: AtomicU64,
    pub clusters_discarded: AtomicU64,
    pub retractions: AtomicU64,
    pub send_failures: AtomicU64,
    /// Set while ingestion is paused after an authorization loss.
    pub recovery: AtomicBool,
    emissions: Mutex<VecDeque<u64>>,
}

impl Counters {
    pub fn new() -> Self {
        ensure_metrics_described();
        Self::default()
    }

    pub fn bump(field: &AtomicU64) {
        field.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(field: &AtomicU64, n: u64) {
        field.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_emission(&self, now: u64) {
        counter!("clusters_emitted_total").increment(1);
        let mut w = self.emissions.lock().expect("emissions mutex poisoned");
        w.push_back(now);
        while let Some(&t) = w.front() {
            if now.saturating_sub(t) >= 3_600 {
                w.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn emissions_last_hour(&self, now: u64) -> usize {
        let w = self.emissions.lock().expect("emissions mutex poisoned");
        w.iter().filter(|&&t| now.saturating_sub(t) < 3_600).count()
    }

    pub fn report(&self, now: u64, started_at: u64) -> StatusReport {
        StatusReport {
            alive: true,
            recovery: self.recovery.load(Ordering::Relaxed),
            uptime_secs: now.saturating_sub(started_at),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            dropped_ingress: self.dropped_ingress.load(Ordering::Relaxed),
            dropped_empty: self.dropped_empty.load(Ordering::Relaxed),
            dropped_blocked: self.dropped_blocked.load(Ordering::Relaxed),
            dup_skipped: self.dup_skipped.load(Ordering::Relaxed),
            batches_extracted: self.batches_extracted.load(Ordering::Relaxed),
            extract_failures: self.extract_failures.load(Ordering::Relaxed),
            events_extracted: self.events_extracted.load(Ordering::Relaxed),
            clusters_emitted: self.clusters_emitted.load(Ordering::Relaxed),
            clusters_discarded: self.clusters_discarded.load(Ordering::Relaxed),
            retractions: self.retractions.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            emissions_last_hour: self.emissions_last_hour(now),
        }
    }
}

/// `/status` payload for the companion bot.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub alive: bool,
    pub recovery: bool,
    pub uptime_secs: u64,
    pub messages_in: u64,
    pub dropped_ingress: u64,
    pub dropped_empty: u64,
    pub dropped_blocked: u64,
    pub dup_skipped: u64,
    pub batches_extracted: u64,
    pub extract_failures: u64,
    pub events_extracted: u64,
    pub clusters_emitted: u64,
    pub clusters_discarded: u64,
    pub retractions: u64,
    pub send_failures: u64,
    pub emissions_last_hour: usize,
}

/// `/stats` payload: authority leaderboard plus emission volume.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub authority_top: Vec<AuthorityRow>,
    pub emissions_last_hour: usize,
}

#[derive(Debug, Serialize)]
pub struct AuthorityRow {
    pub source_id: String,
    pub score: f64,
    pub label: &'static str,
}
