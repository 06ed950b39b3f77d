// tests/correlation_flow.rs
// End-to-end through the in-process stages: normalize → extract (mock) →
// correlate → persist → send. No network, in-memory store.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use trend_monitor::authority::AuthoritySnapshot;
use trend_monitor::budget::BudgetLedger;
use trend_monitor::correlate::{ClusterAction, CorrelationConfig, CorrelationEngine};
use trend_monitor::extract::{Extractor, MockProvider};
use trend_monitor::models::{RawMessage, SourceClass};
use trend_monitor::normalize::Normalizer;
use trend_monitor::sender::{MemorySink, Sender, SenderConfig};
use trend_monitor::status::Counters;
use trend_monitor::store::Store;

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

fn snapshot(pairs: &[(&str, f64)]) -> AuthoritySnapshot {
    Arc::new(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect::<HashMap<_, _>>(),
    )
}

#[tokio::test]
async fn two_sources_one_cluster_one_yellow_summary() {
    let t = 1_700_000_000;
    let norm = Normalizer::default();
    let batch: Vec<_> = [
        raw("alpha", SourceClass::Arab, 1, "strike, Khan Younis, 14:05", t),
        raw("beta", SourceClass::Smart, 7, "israeli strike Khan Yunis ~14:00", t + 150),
    ]
    .into_iter()
    .map(|r| norm.normalize(r))
    .collect();

    // The model recognizes both messages as one occurrence
    let record = r#"[{"kind":"strike","location":"Khan Younis",
        "entities":["israeli forces"],"time_hint":"14:05",
        "summary":"Israeli strike reported in Khan Younis",
        "confidence_self":0.82,"source_msg_indices":[0,1]}]"#;
    let provider = Arc::new(MockProvider::scripted([Ok(record.to_string())]));
    let mut extractor = Extractor::new(provider, BudgetLedger::new(10, 100));
    let events = extractor.extract(&batch).await.unwrap();
    assert_eq!(events.len(), 2, "one event per contributing source");

    // Correlate in extractor-return order
    let store = Store::open_in_memory().await.unwrap();
    let mut engine = CorrelationEngine::new(CorrelationConfig::default());
    let snap = snapshot(&[("alpha", 50.0), ("beta", 50.0)]);
    let mut report = None;
    for (i, ev) in events.into_iter().enumerate() {
        let now = t + 150 * i as u64;
        for action in engine.ingest(ev, &snap, now) {
            match action {
                ClusterAction::Persist { cluster, new_event } => {
                    store.put_cluster_update(&cluster, new_event.as_ref()).await.unwrap();
                }
                ClusterAction::Emit(r) => report = Some(r),
                _ => {}
            }
        }
    }
    let report = report.expect("cluster emitted at two sources");
    assert_eq!(report.sources.len(), 2);
    assert_eq!(engine.open_count(), 0);
    assert_eq!(store.get_events_since(0).await.unwrap().len(), 2);

    // Two default-score sources: yellow badge
    let sink = Arc::new(MemorySink::default());
    let (_snap_tx, snap_rx) = watch::channel(snap);
    let mut sender = Sender::new(
        SenderConfig { min_interval_secs: 300 },
        Arc::clone(&sink) as Arc<_>,
        snap_rx,
        Arc::new(Counters::new()),
    );
    sender.enqueue(report);
    assert!(sender.try_emit(t + 400).await.unwrap());

    let sent = sink.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let lines: Vec<&str> = sent[0].lines().collect();
    assert!(lines[0].starts_with("🟡 Strike — Khan Younis"));
    assert_eq!(lines[2], "Sources (2): alpha, beta");
    assert_eq!(lines[3], "Confirmed across both monitored channel groups");
    assert_eq!(lines[4], "Authority: 50–50 (avg 50.0)");
}

#[tokio::test]
async fn high_authority_source_fast_tracks_alone() {
    let t = 1_700_000_000;
    let norm = Normalizer::default();
    let batch = vec![norm.normalize(raw(
        "trusted",
        SourceClass::Arab,
        3,
        "strike on the outskirts of Rafah",
        t,
    ))];

    let record = r#"[{"kind":"strike","location":"Rafah","entities":["idf"],
        "time_hint":null,"summary":"Strike reported near Rafah",
        "confidence_self":0.7,"source_msg_indices":[0]}]"#;
    let provider = Arc::new(MockProvider::scripted([Ok(record.to_string())]));
    let mut extractor = Extractor::new(provider, BudgetLedger::new(10, 100));
    let events = extractor.extract(&batch).await.unwrap();

    let mut engine = CorrelationEngine::new(CorrelationConfig::default());
    let snap = snapshot(&[("trusted", 80.0)]);
    for ev in events {
        let actions = engine.ingest(ev, &snap, t);
        assert!(actions
            .iter()
            .all(|a| !matches!(a, ClusterAction::Emit(_))));
    }

    // No corroboration, no contradiction, hold elapses: emitted solo
    let actions = engine.sweep(&snap, t + 61);
    let report = actions
        .iter()
        .find_map(|a| match a {
            ClusterAction::Emit(r) => Some(r.clone()),
            _ => None,
        })
        .expect("fast-track emission");
    assert_eq!(report.sources, vec!["trusted".to_string()]);

    // Single source, even a strong one, stays yellow
    let sink = Arc::new(MemorySink::default());
    let (_snap_tx, snap_rx) = watch::channel(snapshot(&[("trusted", 80.0)]));
    let mut sender = Sender::new(
        SenderConfig { min_interval_secs: 300 },
        Arc::clone(&sink) as Arc<_>,
        snap_rx,
        Arc::new(Counters::new()),
    );
    sender.enqueue(report);
    assert!(sender.try_emit(t + 100).await.unwrap());
    let sent = sink.sent.lock().unwrap();
    assert!(sent[0].starts_with("🟡 Strike — Rafah"));
    assert!(sent[0].contains("Sources (1): trusted"));
}
