//! sender.rs — output gating and formatting.
//!
//! One message per emitted cluster, rendered to the fixed wire schema with
//! a credibility badge. Emissions respect a minimum interval and queue
//! oldest-first; retractions bypass the gate. The chat-network client is an
//! external collaborator behind `OutputSink`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use metrics::counter;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::authority::AuthoritySnapshot;
use crate::correlate::EmissionReport;
use crate::extract::backoff_with_jitter;
use crate::models::EventKind;
use crate::status::Counters;

const SEND_TIMEOUT: Duration = Duration::from_secs(15);
const SEND_RETRIES: u32 = 5;
const DRAIN_CAP: Duration = Duration::from_secs(30);
const SENT_CACHE_CAP: usize = 800;
const SUMMARY_MAX_CHARS: usize = 280;

#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn send_message(&self, text: &str) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Default wiring when no chat-network client is attached: log only.
pub struct LogSink;

#[async_trait]
impl OutputSink for LogSink {
    async fn send_message(&self, text: &str) -> Result<()> {
        info!(target: "sender", "[out]\n{text}");
        Ok(())
    }
    fn name(&self) -> &'static str {
        "log"
    }
}

/// Captures everything for assertions.
#[derive(Default)]
pub struct MemorySink {
    pub sent: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn send_message(&self, text: &str) -> Result<()> {
        self.sent
            .lock()
            .expect("memory sink mutex poisoned")
            .push(text.to_string());
        Ok(())
    }
    fn name(&self) -> &'static str {
        "memory"
    }
}

/// What the correlation task hands over for output.
#[derive(Debug, Clone)]
pub enum Emission {
    Report(EmissionReport),
    Retraction {
        cluster_id: String,
        kind: EventKind,
        location: Option<String>,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct SenderConfig {
    pub min_interval_secs: u64,
}

pub struct Sender {
    cfg: SenderConfig,
    sink: Arc<dyn OutputSink>,
    authority_rx: watch::Receiver<AuthoritySnapshot>,
    counters: Arc<Counters>,
    queue: VecDeque<EmissionReport>,
    last_emit: Option<u64>,
    sent_cache: VecDeque<String>,
}

impl Sender {
    pub fn new(
        cfg: SenderConfig,
        sink: Arc<dyn OutputSink>,
        authority_rx: watch::Receiver<AuthoritySnapshot>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            cfg,
            sink,
            authority_rx,
            counters,
            queue: VecDeque::new(),
            last_emit: None,
            sent_cache: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, report: EmissionReport) {
        self.queue.push_back(report);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn gate_open(&self, now: u64) -> bool {
        match self.last_emit {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.cfg.min_interval_secs,
        }
    }

    /// Emit the oldest queued report if the gate allows. Returns whether a
    /// message went out.
    pub async fn try_emit(&mut self, now: u64) -> Result<bool> {
        if self.queue.is_empty() || !self.gate_open(now) {
            return Ok(false);
        }
        let report = self.queue.pop_front().expect("checked non-empty");
        let snapshot = self.authority_rx.borrow().clone();
        let text = format_report(&report, &snapshot);
        if self.already_sent(&text) {
            debug!(target: "sender", cluster = %report.cluster_id, "duplicate output suppressed");
            return Ok(false);
        }
        self.deliver(&text).await?;
        self.last_emit = Some(now);
        Counters::bump(&self.counters.clusters_emitted);
        self.counters.record_emission(now);
        info!(
            target: "sender",
            cluster = %report.cluster_id,
            sources = report.sources.len(),
            "summary sent"
        );
        Ok(true)
    }

    /// Retractions bypass the rate gate.
    pub async fn retract(
        &mut self,
        cluster_id: &str,
        kind: EventKind,
        location: Option<&str>,
        reason: &str,
    ) -> Result<()> {
        let text = format_retraction(cluster_id, kind, location, reason);
        if self.already_sent(&text) {
            return Ok(());
        }
        self.deliver(&text).await?;
        Counters::bump(&self.counters.retractions);
        counter!("retractions_total").increment(1);
        info!(target: "sender", cluster = %cluster_id, "retraction sent");
        Ok(())
    }

    async fn deliver(&mut self, text: &str) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            let res = tokio::time::timeout(SEND_TIMEOUT, self.sink.send_message(text)).await;
            match res {
                Ok(Ok(())) => {
                    self.remember_sent(text);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    attempt += 1;
                    if attempt >= SEND_RETRIES {
                        Counters::bump(&self.counters.send_failures);
                        error!(target: "sender", error = %e, "send failed, giving up");
                        return Err(e).context("output send");
                    }
                    warn!(target: "sender", error = %e, attempt, "send failed, retrying");
                }
                Err(_) => {
                    attempt += 1;
                    if attempt >= SEND_RETRIES {
                        Counters::bump(&self.counters.send_failures);
                        anyhow::bail!("output send timed out after {SEND_TIMEOUT:?}");
                    }
                    warn!(target: "sender", attempt, "send timed out, retrying");
                }
            }
            tokio::time::sleep(backoff_with_jitter(
                Duration::from_secs(2),
                Duration::from_secs(60),
                attempt,
            ))
            .await;
        }
    }

    fn already_sent(&self, text: &str) -> bool {
        let h = text_digest(text);
        self.sent_cache.contains(&h)
    }

    fn remember_sent(&mut self, text: &str) {
        self.sent_cache.push_back(text_digest(text));
        while self.sent_cache.len() > SENT_CACHE_CAP {
            self.sent_cache.pop_front();
        }
    }
}

fn text_digest(text: &str) -> String {
    let d = Sha256::digest(text.as_bytes());
    d[..8].iter().map(|b| format!("{b:02x}")).collect()
}

// ------------------------------------------------------------
// Formatting (wire contract)
// ------------------------------------------------------------

pub fn credibility_badge(avg_score: f64, n_sources: usize) -> &'static str {
    if avg_score >= 70.0 && n_sources >= 3 {
        "🟢"
    } else if avg_score < 40.0 {
        "🔴"
    } else {
        "🟡"
    }
}

pub fn kind_label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Strike => "Strike",
        EventKind::Movement => "Movement",
        EventKind::Casualty => "Casualties",
        EventKind::Claim => "Claim",
        EventKind::Statement => "Statement",
        EventKind::Other => "Incident",
    }
}

pub fn format_report(report: &EmissionReport, authority: &AuthoritySnapshot) -> String {
    let scores: Vec<f64> = report
        .sources
        .iter()
        .map(|s| authority.get(s).copied().unwrap_or(50.0))
        .collect();
    let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg = if scores.is_empty() {
        50.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    };

    let badge = credibility_badge(avg, report.sources.len());
    let location = report.location.as_deref().unwrap_or("unspecified location");
    let summary: String = report.summary.chars().take(SUMMARY_MAX_CHARS).collect();
    let sources = report.sources.join(", ");
    let first_seen = iso8601(report.first_seen);

    let mut out = format!(
        "{badge} {label} — {location}\n{summary}\nSources ({count}): {sources}\n",
        label = kind_label(report.kind),
        count = report.sources.len(),
    );
    if report.cross_class {
        out.push_str("Confirmed across both monitored channel groups\n");
    }
    out.push_str(&format!(
        "Authority: {min:.0}–{max:.0} (avg {avg:.1})\nFirst seen: {first_seen}",
    ));
    out
}

pub fn format_retraction(
    cluster_id: &str,
    kind: EventKind,
    location: Option<&str>,
    reason: &str,
) -> String {
    let location = location.unwrap_or("unspecified location");
    let reason: String = reason.chars().take(SUMMARY_MAX_CHARS).collect();
    format!(
        "🔄 Retraction: {label} — {location}\n{reason}\nref:{cluster_id}",
        label = kind_label(kind),
    )
}

fn iso8601(unix: u64) -> String {
    DateTime::from_timestamp(unix as i64, 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| unix.to_string())
}

// ------------------------------------------------------------
// Task
// ------------------------------------------------------------

pub async fn run_sender(
    mut sender: Sender,
    mut emissions: mpsc::Receiver<Emission>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Accept stragglers until upstream closes the channel, then
                // empty the queue; the gate no longer applies. Bounded.
                let drain = async {
                    loop {
                        match emissions.recv().await {
                            Some(Emission::Report(report)) => sender.enqueue(report),
                            Some(Emission::Retraction { cluster_id, kind, location, reason }) => {
                                if let Err(e) = sender
                                    .retract(&cluster_id, kind, location.as_deref(), &reason)
                                    .await
                                {
                                    warn!(target: "sender", error = %e, "drain retraction failed");
                                }
                            }
                            None => break,
                        }
                    }
                    while let Some(report) = sender.queue.pop_front() {
                        let snapshot = sender.authority_rx.borrow().clone();
                        let text = format_report(&report, &snapshot);
                        if let Err(e) = sender.deliver(&text).await {
                            warn!(target: "sender", error = %e, "drain send failed");
                        }
                    }
                };
                if tokio::time::timeout(DRAIN_CAP, drain).await.is_err() {
                    warn!(target: "sender", left = sender.queue.len(), "drain cap hit");
                }
                break;
            }
            emission = emissions.recv() => {
                match emission {
                    Some(Emission::Report(report)) => sender.enqueue(report),
                    Some(Emission::Retraction { cluster_id, kind, location, reason }) => {
                        if let Err(e) = sender
                            .retract(&cluster_id, kind, location.as_deref(), &reason)
                            .await
                        {
                            error!(target: "sender", error = %e, "retraction failed");
                        }
                    }
                    None => break,
                }
            }
            _ = tick.tick() => {}
        }

        let now = crate::now_unix();
        if let Err(e) = sender.try_emit(now).await {
            error!(target: "sender", error = %e, "emission failed");
        }
    }

    info!(target: "sender", "sender task stopped");
    Ok(())
}
