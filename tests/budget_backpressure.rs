// tests/budget_backpressure.rs
// The extractor never calls out without admission; deferred batches are
// processed strictly first-in-first-out once capacity frees.

use std::sync::Arc;

use trend_monitor::budget::BudgetLedger;
use trend_monitor::extract::{ExtractError, Extractor, MockProvider};
use trend_monitor::models::{RawMessage, SourceClass};
use trend_monitor::normalize::Normalizer;
use trend_monitor::pipeline::{Batch, Pipeline, PipelineConfig};
use trend_monitor::status::Counters;
use trend_monitor::store::Store;

fn msg(source: &str, id: i64, text: &str) -> trend_monitor::models::NormalizedMessage {
    Normalizer::default().normalize(RawMessage {
        source_id: source.into(),
        source_class: SourceClass::Arab,
        message_id: id,
        arrived_at: 1_700_000_000,
        text: text.into(),
        reply_to: None,
        media_refs: Vec::new(),
    })
}

fn record(ix: usize) -> String {
    format!(
        r#"[{{"kind":"other","location":null,"entities":[],"time_hint":null,
        "summary":"minor incident {ix}","confidence_self":0.4,"source_msg_indices":[0]}}]"#
    )
}

#[tokio::test]
async fn exhausted_minute_window_defers_then_strict_fifo() {
    // One call per minute: the second batch in the same minute must defer
    let provider = Arc::new(MockProvider::default());
    provider.push_ok(&record(1));
    provider.push_ok(&record(2));
    provider.push_ok(&record(3));
    let mut extractor = Extractor::new(provider, BudgetLedger::new(1, 100));

    let store = Store::open_in_memory().await.unwrap();
    let mut pipeline = Pipeline::new(
        PipelineConfig::default(),
        store,
        Arc::new(Counters::new()),
    );

    let first = Batch {
        msgs: vec![msg("a", 1, "incident one")],
        attempts: 0,
    };
    let second = Batch {
        msgs: vec![msg("a", 2, "incident two")],
        attempts: 0,
    };
    let third = Batch {
        msgs: vec![msg("a", 3, "incident three")],
        attempts: 0,
    };

    assert!(extractor.extract(&first.msgs).await.is_ok());

    // Budget window still holds the first call
    let err = extractor.extract(&second.msgs).await.unwrap_err();
    let ExtractError::BudgetExhausted { retry_at } = err else {
        panic!("expected deferral, got {err}");
    };

    // No batch skipped: deferral goes back to the front of the line
    pipeline.requeue_deferred(second, retry_at);
    pipeline.release_failed(third, retry_at);

    assert!(pipeline.next_batch(retry_at - 1).is_none(), "held until window frees");
    let next = pipeline.next_batch(retry_at + 3_600).expect("window freed");
    assert_eq!(next.msgs[0].raw.message_id, 2, "deferred batch goes first");
    let after = pipeline.next_batch(retry_at + 3_600).expect("released batch follows");
    assert_eq!(after.msgs[0].raw.message_id, 3);
}

#[tokio::test]
async fn deferral_consumes_no_provider_call() {
    let provider = Arc::new(MockProvider::default());
    provider.push_ok(&record(1));
    // rpm = 1: the first extract charges the only slot
    let mut extractor = Extractor::new(Arc::clone(&provider) as Arc<_>, BudgetLedger::new(1, 100));

    let batch = vec![msg("a", 1, "incident")];
    assert!(extractor.extract(&batch).await.is_ok());
    // Script is now empty; a second call would error as ProviderUnavailable.
    // Deferral must win before the provider is ever touched.
    let err = extractor.extract(&batch).await.unwrap_err();
    assert!(matches!(err, ExtractError::BudgetExhausted { .. }));
}
