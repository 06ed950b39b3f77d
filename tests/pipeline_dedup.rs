// tests/pipeline_dedup.rs
// Replayed or near-duplicate messages must never reach the extractor.

use std::sync::Arc;

use trend_monitor::models::{RawMessage, SourceClass};
use trend_monitor::pipeline::{AdmitOutcome, Pipeline, PipelineConfig};
use trend_monitor::status::Counters;
use trend_monitor::store::Store;

fn raw(source: &str, id: i64, text: &str, at: u64) -> RawMessage {
    RawMessage {
        source_id: source.into(),
        source_class: SourceClass::Arab,
        message_id: id,
        arrived_at: at,
        text: text.into(),
        reply_to: None,
        media_refs: Vec::new(),
    }
}

#[tokio::test]
async fn equivalent_texts_ten_seconds_apart_store_once() {
    let store = Store::open_in_memory().await.unwrap();
    let mut p = Pipeline::new(
        PipelineConfig::default(),
        store,
        Arc::new(Counters::new()),
    );
    let t = 1_700_000_000;

    // Diacritics and trailing punctuation differ; the normalized hash does not
    let first = p.admit(raw("gazawire", 1, "انفجار في غزة اليوم", t), t).await.unwrap();
    let second = p
        .admit(raw("gazawire", 2, "انفجارٌ في غزّة اليوم!!", t + 10), t + 10)
        .await
        .unwrap();

    assert_eq!(first, AdmitOutcome::Queued);
    assert_eq!(second, AdmitOutcome::Duplicate);
    assert_eq!(p.pending_len(), 1);
}

#[tokio::test]
async fn replaying_the_same_message_id_is_idempotent() {
    let store = Store::open_in_memory().await.unwrap();
    let counters = Arc::new(Counters::new());
    let mut p = Pipeline::new(PipelineConfig::default(), store, Arc::clone(&counters));
    let t = 1_700_000_000;

    let m = raw("gazawire", 5, "قصف مدفعي شمال القطاع", t);
    assert_eq!(p.admit(m.clone(), t).await.unwrap(), AdmitOutcome::Queued);
    assert_eq!(p.admit(m, t + 1).await.unwrap(), AdmitOutcome::Duplicate);

    // Exactly one message pending, one duplicate counted
    assert_eq!(p.pending_len(), 1);
    assert_eq!(
        counters.dup_skipped.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}
