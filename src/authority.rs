//! authority.rs — per-source credibility ledger.
//!
//! Scores live in [0, 100] and start at 50. Corroboration on an emitted
//! cluster lifts every contributing source; a superseded cluster costs its
//! members; idle sources drift back toward 50. The ledger has a single
//! writer (the authority task); everyone else reads immutable snapshots
//! published through a `watch` channel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::models::SourceAuthority;
use crate::store::Store;

pub const SCORE_FLOOR: f64 = 0.0;
pub const SCORE_CEIL: f64 = 100.0;
pub const SCORE_BASELINE: f64 = 50.0;

/// Immutable score snapshot readable by any task without locking.
pub type AuthoritySnapshot = Arc<HashMap<String, f64>>;

/// Updates sent by the correlation task; applied by the single writer.
#[derive(Debug, Clone)]
pub enum AuthorityUpdate {
    /// Cluster went Open → Emitted with these member sources.
    Corroborated { sources: Vec<String>, at: u64 },
    /// Cluster was superseded; members pay the contradiction penalty.
    Contradicted { sources: Vec<String>, at: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct AuthorityConfig {
    /// Corroboration gain coefficient (α).
    pub alpha: f64,
    /// Supersession penalty coefficient (β).
    pub beta: f64,
    /// Daily decay toward baseline for idle sources (γ).
    pub gamma_per_day: f64,
    pub high_threshold: f64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            alpha: 3.0,
            beta: 2.0,
            gamma_per_day: 0.5,
            high_threshold: 75.0,
        }
    }
}

#[derive(Debug)]
pub struct AuthorityLedger {
    cfg: AuthorityConfig,
    scores: HashMap<String, SourceAuthority>,
}

impl AuthorityLedger {
    pub fn new(cfg: AuthorityConfig) -> Self {
        Self {
            cfg,
            scores: HashMap::new(),
        }
    }

    pub fn with_seed(cfg: AuthorityConfig, seed: HashMap<String, SourceAuthority>) -> Self {
        Self { cfg, scores: seed }
    }

    pub fn score(&self, source_id: &str) -> f64 {
        self.scores
            .get(source_id)
            .map(|a| a.score)
            .unwrap_or(SCORE_BASELINE)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceAuthority> {
        self.scores.get(source_id)
    }

    /// Ensure a row exists for a source seen for the first time.
    pub fn ensure(&mut self, source_id: &str, now: u64) {
        self.scores
            .entry(source_id.to_string())
            .or_insert_with(|| SourceAuthority::initial(now));
    }

    /// Open→Emitted: each of the |S| member sources gains α·(|S|−1)/|S|.
    /// Returns the touched sources for persistence.
    pub fn on_corroborated(&mut self, sources: &[String], now: u64) -> Vec<String> {
        let n = sources.len() as f64;
        if n == 0.0 {
            return Vec::new();
        }
        let delta = self.cfg.alpha * (n - 1.0) / n;
        for s in sources {
            self.ensure(s, now);
            let a = self.scores.get_mut(s).expect("just ensured");
            a.score = clip(a.score + delta);
            a.corroborations += 1;
            a.last_update = now;
        }
        debug!(target: "authority", n = sources.len(), delta, "corroboration boost");
        sources.to_vec()
    }

    /// Supersession: members lose β·score/50.
    pub fn on_contradicted(&mut self, sources: &[String], now: u64) -> Vec<String> {
        for s in sources {
            self.ensure(s, now);
            let a = self.scores.get_mut(s).expect("just ensured");
            a.score = clip(a.score - self.cfg.beta * a.score / 50.0);
            a.contradictions += 1;
            a.last_update = now;
        }
        debug!(target: "authority", n = sources.len(), "contradiction penalty");
        sources.to_vec()
    }

    /// Drift idle sources toward the baseline, pro-rated for the elapsed
    /// fraction of a day since their last update. Returns changed sources.
    pub fn decay_idle(&mut self, now: u64) -> Vec<String> {
        let mut changed = Vec::new();
        for (id, a) in self.scores.iter_mut() {
            let idle_secs = now.saturating_sub(a.last_update);
            if idle_secs == 0 {
                continue;
            }
            let step = self.cfg.gamma_per_day * (idle_secs as f64 / 86_400.0);
            let diff = a.score - SCORE_BASELINE;
            if diff.abs() < 1e-9 || step <= 0.0 {
                continue;
            }
            let moved = diff.signum() * step.min(diff.abs());
            a.score = clip(a.score - moved);
            a.last_update = now;
            changed.push(id.clone());
        }
        changed
    }

    pub fn is_high(&self, score: f64) -> bool {
        score >= self.cfg.high_threshold
    }

    pub fn snapshot(&self) -> AuthoritySnapshot {
        Arc::new(
            self.scores
                .iter()
                .map(|(k, v)| (k.clone(), v.score))
                .collect(),
        )
    }

    /// Top-N sources by score, for the control surface.
    pub fn top(&self, n: usize) -> Vec<(String, f64)> {
        let mut rows: Vec<(String, f64)> = self
            .scores
            .iter()
            .map(|(k, v)| (k.clone(), v.score))
            .collect();
        rows.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        rows.truncate(n);
        rows
    }
}

fn clip(v: f64) -> f64 {
    v.clamp(SCORE_FLOOR, SCORE_CEIL)
}

/// Human label used by the sender context line and `/stats`.
pub fn score_label(score: f64) -> &'static str {
    if score >= 75.0 {
        "high"
    } else if score >= 55.0 {
        "medium"
    } else {
        "low"
    }
}

/// Single-writer task: applies updates from correlation, persists touched
/// rows, publishes a fresh snapshot after every mutation.
pub async fn run_authority_task(
    mut ledger: AuthorityLedger,
    store: Store,
    mut updates: mpsc::Receiver<AuthorityUpdate>,
    snapshot_tx: watch::Sender<AuthoritySnapshot>,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let mut decay_tick = tokio::time::interval(std::time::Duration::from_secs(15 * 60));
    decay_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            update = updates.recv() => {
                let Some(update) = update else { break };
                let touched = match update {
                    AuthorityUpdate::Corroborated { sources, at } => {
                        ledger.on_corroborated(&sources, at)
                    }
                    AuthorityUpdate::Contradicted { sources, at } => {
                        ledger.on_contradicted(&sources, at)
                    }
                };
                persist_touched(&ledger, &store, &touched).await?;
                let _ = snapshot_tx.send(ledger.snapshot());
            }
            _ = decay_tick.tick() => {
                let now = crate::now_unix();
                let changed = ledger.decay_idle(now);
                if !changed.is_empty() {
                    persist_touched(&ledger, &store, &changed).await?;
                    let _ = snapshot_tx.send(ledger.snapshot());
                    debug!(target: "authority", n = changed.len(), "decay applied");
                }
                store.cleanup_old(86_400).await?;
            }
        }
    }
    info!(target: "authority", "authority task stopped");
    Ok(())
}

async fn persist_touched(
    ledger: &AuthorityLedger,
    store: &Store,
    touched: &[String],
) -> anyhow::Result<()> {
    for id in touched {
        if let Some(a) = ledger.get(id) {
            store.update_authority(id, a).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> AuthorityLedger {
        AuthorityLedger::new(AuthorityConfig::default())
    }

    #[test]
    fn corroboration_gain_scales_with_source_count() {
        let mut l = ledger();
        let two = vec!["a".to_string(), "b".to_string()];
        l.on_corroborated(&two, 100);
        // α·(2−1)/2 = 1.5
        assert!((l.score("a") - 51.5).abs() < 1e-9);

        let three = vec!["c".to_string(), "d".to_string(), "e".to_string()];
        l.on_corroborated(&three, 100);
        // α·(3−1)/3 = 2.0
        assert!((l.score("c") - 52.0).abs() < 1e-9);
    }

    #[test]
    fn single_source_cluster_gains_nothing() {
        let mut l = ledger();
        l.on_corroborated(&["solo".to_string()], 100);
        assert!((l.score("solo") - 50.0).abs() < 1e-9);
    }

    #[test]
    fn contradiction_penalty_is_score_proportional() {
        let mut l = ledger();
        l.ensure("a", 0);
        l.on_contradicted(&["a".to_string()], 100);
        // 50 − 2·50/50 = 48
        assert!((l.score("a") - 48.0).abs() < 1e-9);
    }

    #[test]
    fn scores_stay_clipped() {
        let mut l = ledger();
        let s = vec!["x".to_string(), "y".to_string()];
        for _ in 0..200 {
            l.on_corroborated(&s, 1);
        }
        assert!(l.score("x") <= 100.0);
        for _ in 0..200 {
            l.on_contradicted(&s, 2);
        }
        assert!(l.score("x") >= 0.0);
    }

    #[test]
    fn decay_moves_idle_scores_toward_baseline() {
        let mut l = ledger();
        let s = vec!["a".to_string(), "b".to_string()];
        l.on_corroborated(&s, 0);
        let boosted = l.score("a");
        assert!(boosted > 50.0);

        // Two full idle days: decay 2·γ = 1.0, but never past baseline
        let changed = l.decay_idle(2 * 86_400);
        assert_eq!(changed.len(), 2);
        let decayed = l.score("a");
        assert!(decayed < boosted);
        assert!(decayed >= 50.0);

        // A long idle stretch converges exactly to 50
        l.decay_idle(400 * 86_400);
        assert!((l.score("a") - 50.0).abs() < 1e-9);
    }

    #[test]
    fn labels_follow_thresholds() {
        assert_eq!(score_label(80.0), "high");
        assert_eq!(score_label(60.0), "medium");
        assert_eq!(score_label(40.0), "low");
    }

    #[test]
    fn top_orders_by_score() {
        let mut l = ledger();
        l.ensure("low", 0);
        l.on_corroborated(&["a".to_string(), "b".to_string(), "c".to_string()], 1);
        let top = l.top(2);
        assert_eq!(top.len(), 2);
        assert!(top[0].1 >= top[1].1);
    }
}
