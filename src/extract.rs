//! extract.rs — LLM gateway: budget-gated structured event extraction.
//!
//! The provider abstraction keeps the remote call swappable (production
//! Gemini vs. deterministic mock in tests). Admission goes through the
//! BudgetLedger: no call is ever made without a successful charge.
//! Non-conforming output gets exactly one repair attempt; transient
//! provider failures retry with jittered exponential backoff, bounded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use once_cell::sync::OnceCell;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::budget::BudgetLedger;
use crate::models::{Event, EventKind, MessageRef, NormalizedMessage};

pub const LLM_CALL_TIMEOUT: Duration = Duration::from_secs(45);
const TRANSIENT_RETRIES: u32 = 5;
const RETRY_BASE: Duration = Duration::from_secs(2);
const RETRY_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ExtractError {
    /// Deferral, not a failure: retry the batch once a window frees.
    #[error("LLM budget exhausted, retry at {retry_at}")]
    BudgetExhausted { retry_at: u64 },
    #[error("LLM provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("LLM output did not match the schema: {0}")]
    SchemaInvalid(String),
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),
}

impl ExtractError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExtractError::ProviderUnavailable(_) | ExtractError::Timeout(_)
        )
    }
}

/// Low-level provider: performs one remote completion call.
#[async_trait]
pub trait ExtractProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ExtractError>;
    fn name(&self) -> &'static str;
}

// ------------------------------------------------------------
// Gemini provider
// ------------------------------------------------------------

pub struct GeminiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: &str, model: &str) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("trend-monitor/0.1")
            .connect_timeout(Duration::from_secs(5))
            .timeout(LLM_CALL_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }

}

#[async_trait]
impl ExtractProvider for GeminiProvider {
    async fn complete(&self, prompt: &str) -> Result<String, ExtractError> {
        #[derive(Deserialize)]
        struct Resp {
            candidates: Vec<Candidate>,
        }
        #[derive(Deserialize)]
        struct Candidate {
            content: Content,
        }
        #[derive(Deserialize)]
        struct Content {
            parts: Vec<Part>,
        }
        #[derive(Deserialize)]
        struct Part {
            text: String,
        }

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": 0.2, "maxOutputTokens": 1024 },
        });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExtractError::Timeout(LLM_CALL_TIMEOUT)
                } else {
                    ExtractError::ProviderUnavailable(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(ExtractError::ProviderUnavailable(format!(
                "status {}",
                resp.status()
            )));
        }

        let parsed: Resp = resp
            .json()
            .await
            .map_err(|e| ExtractError::ProviderUnavailable(format!("bad envelope: {e}")))?;
        let text = parsed
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.trim().to_string())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(ExtractError::ProviderUnavailable("empty candidate".into()));
        }
        Ok(text)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

/// Scripted provider for tests: pops pre-loaded responses in order.
#[derive(Default)]
pub struct MockProvider {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<String, String>>>,
}

impl MockProvider {
    pub fn scripted<I: IntoIterator<Item = Result<String, String>>>(items: I) -> Self {
        Self {
            responses: std::sync::Mutex::new(items.into_iter().collect()),
        }
    }

    pub fn push_ok(&self, body: &str) {
        self.responses
            .lock()
            .expect("mock mutex poisoned")
            .push_back(Ok(body.to_string()));
    }
}

#[async_trait]
impl ExtractProvider for MockProvider {
    async fn complete(&self, _prompt: &str) -> Result<String, ExtractError> {
        match self
            .responses
            .lock()
            .expect("mock mutex poisoned")
            .pop_front()
        {
            Some(Ok(body)) => Ok(body),
            Some(Err(e)) => Err(ExtractError::ProviderUnavailable(e)),
            None => Err(ExtractError::ProviderUnavailable("script exhausted".into())),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

// ------------------------------------------------------------
// Prompt & wire schema
// ------------------------------------------------------------

const EXTRACT_PROMPT: &str = "\
You are an intelligence analyst. The numbered messages below come from chat \
channels and may be in Arabic, Hebrew, or English. Identify the concrete \
events they report. Normalize place names to their most common form. \
Messages describing the same occurrence belong in ONE record listing all \
their indices. Return ONLY a JSON array (no markdown fences, no prose) of:
{
  \"kind\": \"strike|movement|casualty|claim|statement|other\",
  \"location\": \"place name or null\",
  \"entities\": [\"named actors, groups, forces\"],
  \"time_hint\": \"HH:MM or null\",
  \"summary\": \"one short neutral sentence\",
  \"confidence_self\": 0.0,
  \"source_msg_indices\": [0]
}
Messages with no reportable event yield no record. Messages:
";

const REPAIR_PROMPT: &str = "\
Your previous reply was not a valid JSON array of the required records. \
Reply again with ONLY the JSON array, nothing else. The schema is: \
[{\"kind\", \"location\", \"entities\", \"time_hint\", \"summary\", \
\"confidence_self\", \"source_msg_indices\"}]. Original task follows.
";

#[derive(Debug, Deserialize)]
struct WireEvent {
    kind: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    time_hint: Option<String>,
    summary: String,
    confidence_self: f32,
    source_msg_indices: Vec<usize>,
}

// ------------------------------------------------------------
// Extractor
// ------------------------------------------------------------

pub struct Extractor {
    provider: Arc<dyn ExtractProvider>,
    budget: BudgetLedger,
}

impl Extractor {
    pub fn new(provider: Arc<dyn ExtractProvider>, budget: BudgetLedger) -> Self {
        Self { provider, budget }
    }

    /// Calls charged in the current rolling hour, for `/status`.
    pub fn used_hourly(&mut self, now: u64) -> usize {
        self.budget.used_hourly(now)
    }

    /// Extract structured events from one batch. Order-preserving: the
    /// returned events carry `message_refs` in batch input order, and the
    /// list follows the provider's record order.
    pub async fn extract(
        &mut self,
        batch: &[NormalizedMessage],
    ) -> Result<Vec<Event>, ExtractError> {
        let prompt = build_prompt(batch);
        let raw = self.call_with_retries(&prompt).await?;

        match parse_events(&raw, batch) {
            Ok(events) => Ok(events),
            Err(first_err) => {
                warn!(target: "extract", error = %first_err, "schema-invalid output, repairing");
                let repair = format!("{REPAIR_PROMPT}\n{prompt}");
                let raw2 = self.call_with_retries(&repair).await?;
                parse_events(&raw2, batch).map_err(|e| {
                    counter!("extract_schema_failures_total").increment(1);
                    e
                })
            }
        }
    }

    async fn call_with_retries(&mut self, prompt: &str) -> Result<String, ExtractError> {
        let mut attempt = 0u32;
        loop {
            let now = crate::now_unix();
            self.budget
                .charge(now)
                .map_err(|d| ExtractError::BudgetExhausted {
                    retry_at: d.retry_at,
                })?;
            counter!("llm_calls_total").increment(1);

            let res = tokio::time::timeout(LLM_CALL_TIMEOUT, self.provider.complete(prompt)).await;
            let err = match res {
                Ok(Ok(text)) => {
                    debug!(target: "extract", provider = self.provider.name(), len = text.len(), "completion ok");
                    return Ok(text);
                }
                Ok(Err(e)) if e.is_transient() => e,
                Ok(Err(e)) => return Err(e),
                Err(_) => ExtractError::Timeout(LLM_CALL_TIMEOUT),
            };

            attempt += 1;
            if attempt >= TRANSIENT_RETRIES {
                return Err(err);
            }
            let delay = backoff_with_jitter(RETRY_BASE, RETRY_CAP, attempt);
            info!(target: "extract", %err, attempt, ?delay, "transient provider failure, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Exponential backoff with ±20% jitter.
pub fn backoff_with_jitter(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16)).min(cap);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64(exp.as_secs_f64() * jitter)
}

fn build_prompt(batch: &[NormalizedMessage]) -> String {
    let mut p = String::with_capacity(1024);
    p.push_str(EXTRACT_PROMPT);
    for (i, m) in batch.iter().enumerate() {
        let clipped: String = m.text_norm.chars().take(1_500).collect();
        p.push_str(&format!("[{i}] {clipped}\n"));
    }
    p
}

/// Tolerate markdown fences or stray prose: take the outermost array.
fn extract_json_array(raw: &str) -> Option<&str> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    (start < end).then(|| &raw[start..=end])
}

fn parse_events(raw: &str, batch: &[NormalizedMessage]) -> Result<Vec<Event>, ExtractError> {
    let json = extract_json_array(raw)
        .ok_or_else(|| ExtractError::SchemaInvalid("no JSON array found".into()))?;
    let wire: Vec<WireEvent> = serde_json::from_str(json)
        .map_err(|e| ExtractError::SchemaInvalid(format!("parse: {e}")))?;

    let mut events = Vec::new();
    for (i, w) in wire.iter().enumerate() {
        let kind = EventKind::parse(&w.kind)
            .ok_or_else(|| ExtractError::SchemaInvalid(format!("record {i}: kind '{}'", w.kind)))?;
        if !(0.0..=1.0).contains(&w.confidence_self) {
            return Err(ExtractError::SchemaInvalid(format!(
                "record {i}: confidence {}",
                w.confidence_self
            )));
        }
        if w.source_msg_indices.is_empty() {
            return Err(ExtractError::SchemaInvalid(format!(
                "record {i}: empty source_msg_indices"
            )));
        }
        if let Some(&bad) = w.source_msg_indices.iter().find(|&&ix| ix >= batch.len()) {
            return Err(ExtractError::SchemaInvalid(format!(
                "record {i}: index {bad} out of range"
            )));
        }
        if w.summary.trim().is_empty() {
            return Err(ExtractError::SchemaInvalid(format!("record {i}: empty summary")));
        }

        // One Event per contributing source: a record merging messages from
        // several channels becomes one event per channel, so cluster source
        // sets keep counting corroboration correctly.
        let mut by_source: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for &ix in &w.source_msg_indices {
            by_source
                .entry(batch[ix].raw.source_id.as_str())
                .or_default()
                .push(ix);
        }
        for (_, indices) in by_source {
            let first = &batch[indices[0]];
            let entities: BTreeSet<String> = w
                .entities
                .iter()
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect();
            events.push(Event {
                event_id: uuid::Uuid::new_v4().to_string(),
                source_id: first.raw.source_id.clone(),
                source_class: first.raw.source_class,
                message_refs: indices
                    .iter()
                    .map(|&ix| MessageRef {
                        source_id: batch[ix].raw.source_id.clone(),
                        message_id: batch[ix].raw.message_id,
                    })
                    .collect(),
                kind,
                location: w.location.as_ref().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()),
                coordinates: None,
                entities,
                time_hint: w
                    .time_hint
                    .as_deref()
                    .and_then(|t| parse_time_hint(t, first.raw.arrived_at)),
                summary: w.summary.trim().to_string(),
                confidence_self: w.confidence_self,
                ingested_at: first.raw.arrived_at,
            });
        }
    }
    Ok(events)
}

/// Accepts a bare unix timestamp or `HH:MM` placed on the ingestion day.
fn parse_time_hint(hint: &str, ingested_at: u64) -> Option<u64> {
    let hint = hint.trim();
    if let Ok(unix) = hint.parse::<u64>() {
        return Some(unix);
    }
    static RE_HM: OnceCell<Regex> = OnceCell::new();
    let re = RE_HM.get_or_init(|| Regex::new(r"^(\d{1,2}):(\d{2})$").unwrap());
    let caps = re.captures(hint)?;
    let h: u64 = caps[1].parse().ok()?;
    let m: u64 = caps[2].parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    let day_start = ingested_at - (ingested_at % 86_400);
    Some(day_start + h * 3_600 + m * 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawMessage, SourceClass};
    use crate::normalize::Normalizer;

    fn msg(source: &str, id: i64, text: &str) -> NormalizedMessage {
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

    fn record(indices: &str) -> String {
        format!(
            r#"[{{"kind":"strike","location":"Khan Younis","entities":["idf"],
                 "time_hint":"14:05","summary":"Strike reported in Khan Younis",
                 "confidence_self":0.8,"source_msg_indices":{indices}}}]"#
        )
    }

    #[tokio::test]
    async fn happy_path_parses_one_event() {
        let batch = vec![msg("alpha", 1, "strike in khan younis")];
        let provider = Arc::new(MockProvider::scripted([Ok(record("[0]"))]));
        let mut ex = Extractor::new(provider, BudgetLedger::new(10, 100));
        let events = ex.extract(&batch).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Strike);
        assert_eq!(events[0].source_id, "alpha");
        assert_eq!(events[0].message_refs.len(), 1);
        assert!(events[0].time_hint.is_some());
    }

    #[tokio::test]
    async fn merged_record_splits_per_source() {
        let batch = vec![
            msg("alpha", 1, "strike in khan younis"),
            msg("beta", 9, "israeli strike khan yunis"),
        ];
        let provider = Arc::new(MockProvider::scripted([Ok(record("[0,1]"))]));
        let mut ex = Extractor::new(provider, BudgetLedger::new(10, 100));
        let events = ex.extract(&batch).await.unwrap();
        assert_eq!(events.len(), 2);
        let sources: Vec<&str> = events.iter().map(|e| e.source_id.as_str()).collect();
        assert_eq!(sources, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn fenced_json_is_tolerated() {
        let batch = vec![msg("alpha", 1, "text")];
        let fenced = format!("```json\n{}\n```", record("[0]"));
        let provider = Arc::new(MockProvider::scripted([Ok(fenced)]));
        let mut ex = Extractor::new(provider, BudgetLedger::new(10, 100));
        assert_eq!(ex.extract(&batch).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn schema_invalid_gets_one_repair_then_fails() {
        let batch = vec![msg("alpha", 1, "text")];
        let provider = Arc::new(MockProvider::scripted([
            Ok("not json at all".to_string()),
            Ok("still not json".to_string()),
        ]));
        let mut ex = Extractor::new(provider, BudgetLedger::new(10, 100));
        let err = ex.extract(&batch).await.unwrap_err();
        assert!(matches!(err, ExtractError::SchemaInvalid(_)));
    }

    #[tokio::test]
    async fn repair_success_recovers_batch() {
        let batch = vec![msg("alpha", 1, "text")];
        let provider = Arc::new(MockProvider::scripted([
            Ok("garbage".to_string()),
            Ok(record("[0]")),
        ]));
        let mut ex = Extractor::new(provider, BudgetLedger::new(10, 100));
        assert_eq!(ex.extract(&batch).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_defers_without_calling() {
        let batch = vec![msg("alpha", 1, "text")];
        // rpm 0: first charge already defers, the mock must never be hit
        let provider = Arc::new(MockProvider::scripted([]));
        let mut ex = Extractor::new(provider, BudgetLedger::new(0, 100));
        let err = ex.extract(&batch).await.unwrap_err();
        assert!(matches!(err, ExtractError::BudgetExhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_bounded() {
        let batch = vec![msg("alpha", 1, "text")];
        let provider = Arc::new(MockProvider::scripted(
            (0..6).map(|i| Err(format!("down {i}"))),
        ));
        let mut ex = Extractor::new(provider, BudgetLedger::new(100, 1_000));
        let err = ex.extract(&batch).await.unwrap_err();
        assert!(matches!(err, ExtractError::ProviderUnavailable(_)));
    }

    #[test]
    fn bad_kind_and_out_of_range_index_are_schema_errors() {
        let batch = vec![msg("alpha", 1, "text")];
        let bad_kind = r#"[{"kind":"rocketry","summary":"x","confidence_self":0.5,"source_msg_indices":[0]}]"#;
        assert!(matches!(
            parse_events(bad_kind, &batch),
            Err(ExtractError::SchemaInvalid(_))
        ));
        let bad_ix = r#"[{"kind":"strike","summary":"x","confidence_self":0.5,"source_msg_indices":[4]}]"#;
        assert!(matches!(
            parse_events(bad_ix, &batch),
            Err(ExtractError::SchemaInvalid(_))
        ));
    }

    #[test]
    fn time_hint_parses_clock_and_unix() {
        assert_eq!(parse_time_hint("863", 0), Some(863));
        let noon = parse_time_hint("12:30", 1_700_000_000).unwrap();
        assert_eq!(noon % 86_400, 12 * 3_600 + 30 * 60);
        assert_eq!(parse_time_hint("25:99", 0), None);
    }
}
