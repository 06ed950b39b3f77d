//! pipeline.rs — admission, batching and extraction scheduling.
//!
//! Single entry point for every listener message. Admission order: empty
//! drop → blocklist drop → store dedup → bounded per-class pending queue
//! (overflow drops the oldest; fresh context dominates). Batches close on
//! size or age and flow to the extractor strictly one at a time, so the
//! correlation index sees events in arrival order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::extract::{backoff_with_jitter, ExtractError, Extractor};
use crate::models::{Event, NormalizedMessage, RawMessage, SourceClass};
use crate::normalize::Normalizer;
use crate::status::Counters;
use crate::store::{PutOutcome, Store, StoreError};

const RELEASE_BASE: Duration = Duration::from_secs(30);
const RELEASE_CAP: Duration = Duration::from_secs(30 * 60);
const FLUSH_CAP: Duration = Duration::from_secs(60);

/// Events delivered by the external listener.
#[derive(Debug)]
pub enum IntakeEvent {
    Message(RawMessage),
    /// Session authorization lost; ingestion pauses, draining continues.
    AuthRevoked,
    /// Companion bot renewed the session.
    AuthRestored,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub max_batch_age_secs: u64,
    pub queue_cap: usize,
    pub dedup_window_secs: u64,
    /// Alert-boilerplate phrases dropped at admission, lowercase.
    pub blocklist: Vec<String>,
    pub trailer_patterns: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 24,
            max_batch_age_secs: 300,
            queue_cap: 512,
            dedup_window_secs: 6 * 3_600,
            blocklist: Vec::new(),
            trailer_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Queued,
    DroppedEmpty,
    DroppedBlocked,
    Duplicate,
}

/// A batch handed to the extractor; `attempts` drives the release backoff.
#[derive(Debug)]
pub struct Batch {
    pub msgs: Vec<NormalizedMessage>,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct Pipeline {
    cfg: PipelineConfig,
    normalizer: Normalizer,
    store: Store,
    arab: VecDeque<NormalizedMessage>,
    smart: VecDeque<NormalizedMessage>,
    /// Budget-deferred and released batches, strict FIFO.
    deferred: VecDeque<Batch>,
    /// Failed batches waiting out their backoff.
    delayed: Vec<(u64, Batch)>,
    /// Set while the budget window is exhausted.
    hold_until: Option<u64>,
    counters: Arc<Counters>,
}

impl Pipeline {
    pub fn new(cfg: PipelineConfig, store: Store, counters: Arc<Counters>) -> Self {
        let normalizer = Normalizer::new(&cfg.trailer_patterns);
        Self {
            cfg,
            normalizer,
            store,
            arab: VecDeque::new(),
            smart: VecDeque::new(),
            deferred: VecDeque::new(),
            delayed: Vec::new(),
            hold_until: None,
            counters,
        }
    }

    pub async fn admit(&mut self, raw: RawMessage, now: u64) -> Result<AdmitOutcome, StoreError> {
        Counters::bump(&self.counters.messages_in);
        counter!("ingress_messages_total").increment(1);

        let msg = self.normalizer.normalize(raw);
        if msg.empty {
            Counters::bump(&self.counters.dropped_empty);
            return Ok(AdmitOutcome::DroppedEmpty);
        }
        if self.is_blocked(&msg.text_norm) {
            Counters::bump(&self.counters.dropped_blocked);
            debug!(target: "pipeline", source = %msg.raw.source_id, "blocklisted");
            return Ok(AdmitOutcome::DroppedBlocked);
        }
        if self
            .store
            .put_message(&msg, self.cfg.dedup_window_secs, now)
            .await?
            == PutOutcome::Dup
        {
            Counters::bump(&self.counters.dup_skipped);
            counter!("dedup_skipped_total").increment(1);
            debug!(target: "pipeline", source = %msg.raw.source_id, "dedup skip");
            return Ok(AdmitOutcome::Duplicate);
        }

        let cap = self.cfg.queue_cap;
        let class = msg.raw.source_class;
        let queue = self.queue_mut(class);
        queue.push_back(msg);
        let mut dropped = 0u64;
        while queue.len() > cap {
            queue.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            Counters::add(&self.counters.dropped_ingress, dropped);
            counter!("ingress_dropped_total").increment(dropped);
            warn!(
                target: "pipeline",
                class = class.as_str(),
                dropped,
                "pending queue overflow, oldest dropped"
            );
        }
        Ok(AdmitOutcome::Queued)
    }

    /// Next batch to extract, or None when nothing is due. Deferred batches
    /// come first (strict FIFO); fresh batches close on size or age.
    pub fn next_batch(&mut self, now: u64) -> Option<Batch> {
        // Backoffs that ran out re-enter the ready queue
        let mut due: Vec<usize> = self
            .delayed
            .iter()
            .enumerate()
            .filter(|(_, (at, _))| *at <= now)
            .map(|(i, _)| i)
            .collect();
        due.sort_unstable_by(|a, b| b.cmp(a));
        for i in due {
            let (_, batch) = self.delayed.remove(i);
            self.deferred.push_back(batch);
        }

        if let Some(hold) = self.hold_until {
            if now < hold {
                return None;
            }
            self.hold_until = None;
        }

        if let Some(batch) = self.deferred.pop_front() {
            return Some(batch);
        }
        self.form_batch(now, false).map(|msgs| Batch { msgs, attempts: 0 })
    }

    /// Budget deferral: back to the front, nothing skipped, hold the line
    /// until the window frees.
    pub fn requeue_deferred(&mut self, batch: Batch, retry_at: u64) {
        self.deferred.push_front(batch);
        self.hold_until = Some(retry_at);
    }

    /// `extract_failed`: release with exponential backoff (base 30 s,
    /// cap 30 min, ±20 % jitter).
    pub fn release_failed(&mut self, mut batch: Batch, now: u64) {
        batch.attempts += 1;
        let delay = backoff_with_jitter(RELEASE_BASE, RELEASE_CAP, batch.attempts - 1);
        let release_at = now + delay.as_secs();
        info!(
            target: "pipeline",
            msgs = batch.msgs.len(),
            attempts = batch.attempts,
            delay_secs = delay.as_secs(),
            "batch released after extraction failure"
        );
        self.delayed.push((release_at, batch));
    }

    pub fn pending_len(&self) -> usize {
        self.arab.len()
            + self.smart.len()
            + self.deferred.iter().map(|b| b.msgs.len()).sum::<usize>()
            + self.delayed.iter().map(|(_, b)| b.msgs.len()).sum::<usize>()
    }

    fn queue_mut(&mut self, class: SourceClass) -> &mut VecDeque<NormalizedMessage> {
        match class {
            SourceClass::Arab => &mut self.arab,
            SourceClass::Smart => &mut self.smart,
        }
    }

    fn is_blocked(&self, text_norm: &str) -> bool {
        self.cfg.blocklist.iter().any(|b| text_norm.contains(b.as_str()))
    }

    /// Pick the class whose head is oldest among those with a fired trigger
    /// (`force` ignores triggers, for the shutdown flush).
    fn form_batch(&mut self, now: u64, force: bool) -> Option<Vec<NormalizedMessage>> {
        let batch_size = self.cfg.batch_size;
        let max_age = self.cfg.max_batch_age_secs;

        let ready = |q: &VecDeque<NormalizedMessage>| -> bool {
            if q.is_empty() {
                return false;
            }
            force
                || q.len() >= batch_size
                || q.front()
                    .map(|m| now.saturating_sub(m.raw.arrived_at) > max_age)
                    .unwrap_or(false)
        };

        let arab_ready = ready(&self.arab);
        let smart_ready = ready(&self.smart);
        let class = match (arab_ready, smart_ready) {
            (false, false) => return None,
            (true, false) => SourceClass::Arab,
            (false, true) => SourceClass::Smart,
            (true, true) => {
                let a = self.arab.front().map(|m| m.raw.arrived_at).unwrap_or(u64::MAX);
                let s = self.smart.front().map(|m| m.raw.arrived_at).unwrap_or(u64::MAX);
                if a <= s {
                    SourceClass::Arab
                } else {
                    SourceClass::Smart
                }
            }
        };

        let queue = self.queue_mut(class);
        let n = queue.len().min(batch_size);
        Some(queue.drain(..n).collect())
    }
}

/// Pipeline task: the single caller of the extractor.
pub async fn run_pipeline(
    mut pipeline: Pipeline,
    mut extractor: Extractor,
    mut intake: mpsc::Receiver<IntakeEvent>,
    events_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let counters = Arc::clone(&pipeline.counters);
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if tokio::time::timeout(FLUSH_CAP, flush(&mut pipeline, &mut extractor, &events_tx))
                    .await
                    .is_err()
                {
                    warn!(target: "pipeline", pending = pipeline.pending_len(), "flush cap hit, pending dropped");
                }
                break;
            }
            ev = intake.recv() => {
                match ev {
                    Some(IntakeEvent::Message(raw)) => {
                        if counters.recovery.load(std::sync::atomic::Ordering::Relaxed) {
                            debug!(target: "pipeline", "recovery mode, message ignored");
                        } else {
                            let now = crate::now_unix();
                            pipeline.admit(raw, now).await?;
                        }
                    }
                    Some(IntakeEvent::AuthRevoked) => {
                        counters.recovery.store(true, std::sync::atomic::Ordering::Relaxed);
                        warn!(target: "pipeline", "authorization revoked, ingestion paused, draining continues");
                    }
                    Some(IntakeEvent::AuthRestored) => {
                        counters.recovery.store(false, std::sync::atomic::Ordering::Relaxed);
                        info!(target: "pipeline", "authorization restored, ingestion resumed");
                    }
                    None => break,
                }
            }
            _ = tick.tick() => {}
        }

        drive_extraction(&mut pipeline, &mut extractor, &events_tx).await;
    }

    info!(target: "pipeline", "pipeline task stopped");
    Ok(())
}

/// Extract every due batch, serialized; stops on budget hold.
async fn drive_extraction(
    pipeline: &mut Pipeline,
    extractor: &mut Extractor,
    events_tx: &mpsc::Sender<Event>,
) {
    loop {
        let now = crate::now_unix();
        let Some(batch) = pipeline.next_batch(now) else {
            return;
        };
        match extractor.extract(&batch.msgs).await {
            Ok(events) => {
                Counters::bump(&pipeline.counters.batches_extracted);
                Counters::add(&pipeline.counters.events_extracted, events.len() as u64);
                debug!(target: "pipeline", batch = batch.msgs.len(), events = events.len(), "batch extracted");
                for ev in events {
                    if events_tx.send(ev).await.is_err() {
                        return;
                    }
                }
            }
            Err(ExtractError::BudgetExhausted { retry_at }) => {
                debug!(target: "pipeline", retry_at, "budget exhausted, batch deferred");
                pipeline.requeue_deferred(batch, retry_at);
                return;
            }
            Err(err) => {
                Counters::bump(&pipeline.counters.extract_failures);
                warn!(target: "pipeline", %err, "extraction failed");
                pipeline.release_failed(batch, now);
            }
        }
    }
}

/// Shutdown flush: push whatever is pending through one last time.
async fn flush(
    pipeline: &mut Pipeline,
    extractor: &mut Extractor,
    events_tx: &mpsc::Sender<Event>,
) {
    loop {
        let now = crate::now_unix();
        let batch = match pipeline.next_batch(now) {
            Some(b) => b,
            None => match pipeline.form_batch(now, true) {
                Some(msgs) => Batch { msgs, attempts: 0 },
                None => break,
            },
        };
        match extractor.extract(&batch.msgs).await {
            Ok(events) => {
                for ev in events {
                    if events_tx.send(ev).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(target: "pipeline", %err, "flush extraction failed, batch dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(source: &str, class: SourceClass, id: i64, text: &str, at: u64) -> RawMessage {
        RawMessage {
            source_id: source.into(),
            source_class: class,
            message_id: id,
            arrived_at: at,
            text: text.into(),
            reply_to: None,
            media_refs: Vec::new(),
        }
    }

    async fn pipeline(cfg: PipelineConfig) -> Pipeline {
        let store = Store::open_in_memory().await.unwrap();
        Pipeline::new(cfg, store, Arc::new(Counters::new()))
    }

    #[tokio::test]
    async fn empty_blocked_and_dup_are_dropped() {
        let cfg = PipelineConfig {
            blocklist: vec!["red alert".into()],
            ..Default::default()
        };
        let mut p = pipeline(cfg).await;
        let now = 1_000;

        assert_eq!(
            p.admit(raw("a", SourceClass::Arab, 1, "   ", now), now).await.unwrap(),
            AdmitOutcome::DroppedEmpty
        );
        assert_eq!(
            p.admit(raw("a", SourceClass::Arab, 2, "Red Alert in the north", now), now)
                .await
                .unwrap(),
            AdmitOutcome::DroppedBlocked
        );
        assert_eq!(
            p.admit(raw("a", SourceClass::Arab, 3, "strike reported", now), now)
                .await
                .unwrap(),
            AdmitOutcome::Queued
        );
        assert_eq!(
            p.admit(raw("a", SourceClass::Arab, 4, "strike reported!!", now + 10), now + 10)
                .await
                .unwrap(),
            AdmitOutcome::Duplicate
        );
        assert_eq!(p.pending_len(), 1);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_keeps_newest() {
        let cfg = PipelineConfig {
            queue_cap: 512,
            ..Default::default()
        };
        let mut p = pipeline(cfg).await;
        for i in 0..1_000 {
            let r = raw("a", SourceClass::Arab, i, &format!("message number {i}"), 1_000);
            p.admit(r, 1_000).await.unwrap();
        }
        assert_eq!(p.arab.len(), 512);
        assert_eq!(
            p.counters.dropped_ingress.load(std::sync::atomic::Ordering::Relaxed),
            488
        );
        // Newest preserved at the back
        assert_eq!(p.arab.back().unwrap().raw.message_id, 999);
        assert_eq!(p.arab.front().unwrap().raw.message_id, 488);
    }

    #[tokio::test]
    async fn batch_closes_on_size_then_on_age() {
        let cfg = PipelineConfig {
            batch_size: 3,
            max_batch_age_secs: 300,
            ..Default::default()
        };
        let mut p = pipeline(cfg).await;
        let t = 1_000;
        for i in 0..4 {
            p.admit(raw("a", SourceClass::Arab, i, &format!("report {i}"), t), t)
                .await
                .unwrap();
        }
        // Size trigger: 3 of 4
        let b = p.next_batch(t).expect("size trigger");
        assert_eq!(b.msgs.len(), 3);
        // Remaining one is too fresh
        assert!(p.next_batch(t + 10).is_none());
        // Age trigger fires past max age
        let b2 = p.next_batch(t + 301).expect("age trigger");
        assert_eq!(b2.msgs.len(), 1);
    }

    #[tokio::test]
    async fn source_order_is_preserved_within_class() {
        let mut p = pipeline(PipelineConfig {
            batch_size: 4,
            ..Default::default()
        })
        .await;
        let t = 1_000;
        for i in 0..4 {
            p.admit(raw("a", SourceClass::Arab, i, &format!("msg {i}"), t + i as u64), t + i as u64)
                .await
                .unwrap();
        }
        let b = p.next_batch(t + 10).unwrap();
        let ids: Vec<i64> = b.msgs.iter().map(|m| m.raw.message_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn deferred_batches_are_strict_fifo() {
        let mut p = pipeline(PipelineConfig::default()).await;
        // Batches tagged by `attempts` for identification
        p.deferred.push_back(Batch { msgs: Vec::new(), attempts: 1 });
        p.deferred.push_back(Batch { msgs: Vec::new(), attempts: 2 });
        // A budget deferral puts the in-flight batch back at the front
        p.requeue_deferred(Batch { msgs: Vec::new(), attempts: 0 }, 2_000);

        // Held until the window frees
        assert!(p.next_batch(1_999).is_none());
        assert_eq!(p.next_batch(2_000).unwrap().attempts, 0);
        assert_eq!(p.next_batch(2_000).unwrap().attempts, 1);
        assert_eq!(p.next_batch(2_000).unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn released_batch_waits_out_backoff() {
        let mut p = pipeline(PipelineConfig::default()).await;
        let t = 10_000;
        p.release_failed(
            Batch {
                msgs: Vec::new(),
                attempts: 0,
            },
            t,
        );
        // Base 30 s with ±20% jitter: not due at 23 s
        assert!(p.next_batch(t + 23).is_none());
        // Due at the jitter ceiling
        assert!(p.next_batch(t + 37).is_some());
    }

    #[tokio::test]
    async fn oldest_class_head_goes_first() {
        let mut p = pipeline(PipelineConfig {
            batch_size: 2,
            ..Default::default()
        })
        .await;
        p.admit(raw("s", SourceClass::Smart, 1, "smart one", 90), 90).await.unwrap();
        p.admit(raw("s", SourceClass::Smart, 2, "smart two", 95), 95).await.unwrap();
        p.admit(raw("a", SourceClass::Arab, 1, "arab one", 100), 100).await.unwrap();
        p.admit(raw("a", SourceClass::Arab, 2, "arab two", 105), 105).await.unwrap();
        let b = p.next_batch(200).unwrap();
        assert_eq!(b.msgs[0].raw.source_class, SourceClass::Smart);
    }
}
