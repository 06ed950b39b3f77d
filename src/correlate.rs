//! correlate.rs — cross-source event correlation.
//!
//! Events are clustered into trends through a coarse in-memory index keyed
//! by `(kind, location_token, time_bucket)` plus a similarity fallback for
//! spelling-variant locations. The match step is pure and never suspends,
//! so the index stays coherent with event arrival order.

use std::collections::HashMap;

use strsim::jaro_winkler;
use tracing::{debug, info};

use crate::authority::{AuthoritySnapshot, AuthorityUpdate};
use crate::models::{ClusterState, Event, EventKind, TrendCluster};

#[derive(Debug, Clone, Copy)]
pub struct CorrelationConfig {
    pub min_sources: usize,
    pub authority_high_threshold: f64,
    pub fast_track_hold_secs: u64,
    pub cluster_idle_ttl_secs: u64,
    pub retraction_lookback_secs: u64,
    pub bucket_secs: u64,
    pub bucket_slack: u64,
    pub loc_similarity: f64,
    pub loc_similarity_strong: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            min_sources: 2,
            authority_high_threshold: 75.0,
            fast_track_hold_secs: 60,
            cluster_idle_ttl_secs: 600,
            retraction_lookback_secs: 600,
            bucket_secs: 900,
            bucket_slack: 2,
            loc_similarity: 0.88,
            loc_similarity_strong: 0.95,
        }
    }
}

/// What the sender needs to render one emitted cluster.
#[derive(Debug, Clone)]
pub struct EmissionReport {
    pub cluster_id: String,
    pub kind: EventKind,
    pub location: Option<String>,
    pub summary: String,
    pub sources: Vec<String>,
    /// Both editorial classes contributed.
    pub cross_class: bool,
    pub first_seen: u64,
}

/// Side effects the correlation task must dispatch after a pure match step.
#[derive(Debug, Clone)]
pub enum ClusterAction {
    Emit(EmissionReport),
    /// Retract an already-emitted cluster; bypasses the sender rate gate.
    Retract {
        cluster_id: String,
        kind: EventKind,
        location: Option<String>,
        reason: String,
    },
    Authority(AuthorityUpdate),
    /// Durable write: cluster upsert plus optionally the event that joined.
    Persist {
        cluster: TrendCluster,
        new_event: Option<Event>,
    },
    /// Idle single-source cluster dropped; members kept for audit only.
    Discard {
        cluster_id: String,
        event_ids: Vec<String>,
    },
}

/// Denial phrasing that marks a report as contradicting an earlier one.
const DENIAL_MARKERS: &[&str] = &[
    // English
    "no strike",
    "did not occur",
    "false alarm",
    "denies",
    "denied",
    "retraction",
    "incorrect report",
    // Arabic
    "لا صحة",
    "نفى",
    "تنفي",
    "ينفي",
    "تكذيب",
    "شائعة",
    "لم يحدث",
    // Hebrew
    "אזעקת שווא",
    "הכחשה",
    "מכחיש",
    "לא אירע",
    "דיווח שגוי",
];

pub fn is_denial(summary: &str) -> bool {
    let low = summary.to_lowercase();
    DENIAL_MARKERS.iter().any(|m| low.contains(m))
}

type IndexKey = (EventKind, String, u64);

#[derive(Debug)]
pub struct CorrelationEngine {
    cfg: CorrelationConfig,
    open: HashMap<String, TrendCluster>,
    /// Coarse signature index; ids are pruned lazily on lookup.
    index: HashMap<IndexKey, Vec<String>>,
    /// Emitted clusters kept for the retraction lookback window.
    recent_emitted: HashMap<String, TrendCluster>,
}

impl CorrelationEngine {
    pub fn new(cfg: CorrelationConfig) -> Self {
        Self {
            cfg,
            open: HashMap::new(),
            index: HashMap::new(),
            recent_emitted: HashMap::new(),
        }
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Feed one extracted event through the match rule. Pure in-memory; the
    /// returned actions carry every required side effect.
    pub fn ingest(
        &mut self,
        ev: Event,
        authority: &AuthoritySnapshot,
        now: u64,
    ) -> Vec<ClusterAction> {
        if is_denial(&ev.summary) {
            if let Some(actions) = self.handle_denial(&ev, now) {
                return actions;
            }
        }

        let mut actions = Vec::new();
        match self.best_match(&ev, authority) {
            Some(cluster_id) => {
                self.index_member(&cluster_id, &ev);
                let cluster = self.open.get_mut(&cluster_id).expect("matched open cluster");
                cluster.absorb(ev.clone(), now);
                cluster.authority_sum = authority_sum(cluster, authority);
                debug!(
                    target: "correlate",
                    cluster = %cluster_id,
                    sources = cluster.sources.len(),
                    "corroboration"
                );
                actions.push(ClusterAction::Persist {
                    cluster: cluster.clone(),
                    new_event: Some(ev),
                });
                if cluster.state == ClusterState::Open && cluster.sources.len() >= self.cfg.min_sources
                {
                    actions.extend(self.emit(&cluster_id, now));
                }
            }
            None => {
                let mut cluster = TrendCluster::new(ev.clone(), now);
                let cluster_id = cluster.cluster_id.clone();
                self.index_member(&cluster_id, &ev);
                cluster.authority_sum = authority_sum(&cluster, authority);
                actions.push(ClusterAction::Persist {
                    cluster: cluster.clone(),
                    new_event: Some(ev),
                });
                self.open.insert(cluster_id.clone(), cluster);
                debug!(target: "correlate", cluster = %cluster_id, "opened");
            }
        }
        actions
    }

    /// Periodic pass: fast-track holds, idle closing, lookback pruning.
    pub fn sweep(&mut self, authority: &AuthoritySnapshot, now: u64) -> Vec<ClusterAction> {
        let mut actions = Vec::new();

        let mut to_emit = Vec::new();
        let mut to_discard = Vec::new();
        for (id, cluster) in &self.open {
            let multi_source = cluster.sources.len() >= self.cfg.min_sources;
            let fast_track = self.fast_track_ready(cluster, authority, now);
            if fast_track {
                to_emit.push(id.clone());
                continue;
            }
            if now.saturating_sub(cluster.last_updated) >= self.cfg.cluster_idle_ttl_secs {
                if multi_source {
                    to_emit.push(id.clone());
                } else {
                    to_discard.push(id.clone());
                }
            }
        }

        for id in to_emit {
            actions.extend(self.emit(&id, now));
        }
        for id in to_discard {
            if let Some(cluster) = self.open.remove(&id) {
                info!(
                    target: "correlate",
                    cluster = %id,
                    members = cluster.members.len(),
                    "idle cluster discarded"
                );
                actions.push(ClusterAction::Discard {
                    cluster_id: id,
                    event_ids: cluster.members.iter().map(|m| m.event_id.clone()).collect(),
                });
            }
        }

        self.recent_emitted.retain(|_, c| {
            now.saturating_sub(c.last_updated) < self.cfg.retraction_lookback_secs
        });

        actions
    }

    // ---- matching -------------------------------------------------------

    fn best_match(&mut self, ev: &Event, authority: &AuthoritySnapshot) -> Option<String> {
        let mut candidates = self.candidates_for(ev);
        candidates.retain(|id| {
            self.open
                .get(id)
                .map(|c| self.matches(ev, c))
                .unwrap_or(false)
        });
        candidates.sort();
        candidates.dedup();
        candidates
            .into_iter()
            .map(|id| {
                let c = &self.open[&id];
                (id, authority_sum(c, authority), c.first_seen)
            })
            .max_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // highest authority first; on ties the earliest cluster wins
                    .then(b.2.cmp(&a.2))
            })
            .map(|(id, _, _)| id)
    }

    /// Index probe across kind variants and ±slack buckets, plus a
    /// similarity fallback scan for spelling-variant locations.
    fn candidates_for(&mut self, ev: &Event) -> Vec<String> {
        let mut out = Vec::new();
        let bucket = ev.time_bucket(self.cfg.bucket_secs);
        let slack = self.cfg.bucket_slack;

        if let Some(token) = ev.location_token() {
            let mut kinds = vec![ev.kind];
            if ev.kind.is_soft() {
                kinds.extend([
                    EventKind::Strike,
                    EventKind::Movement,
                    EventKind::Casualty,
                    EventKind::Other,
                ]);
            } else {
                kinds.extend([EventKind::Claim, EventKind::Statement]);
            }
            for kind in kinds {
                for b in bucket.saturating_sub(slack)..=bucket + slack {
                    let key = (kind, token.clone(), b);
                    if let Some(ids) = self.index.get_mut(&key) {
                        ids.retain(|id| self.open.contains_key(id));
                        out.extend(ids.iter().cloned());
                    }
                }
            }
        }

        // Fallback: location strings that differ in their first token can
        // still pass the Jaro-Winkler test, so scan the open pool too.
        if let Some(loc) = ev.location.as_deref() {
            let loc = loc.to_lowercase();
            for (id, cluster) in &self.open {
                if out.contains(id) {
                    continue;
                }
                let close = cluster.members.iter().any(|m| {
                    m.location
                        .as_deref()
                        .map(|l| jaro_winkler(&loc, &l.to_lowercase()) >= self.cfg.loc_similarity)
                        .unwrap_or(false)
                });
                if close {
                    out.push(id.clone());
                }
            }
        }
        out
    }

    /// Full match rule; all four conditions must hold.
    fn matches(&self, ev: &Event, cluster: &TrendCluster) -> bool {
        // 1) kind equality, or a claim/statement paired with a specific kind
        let kind_ok = cluster
            .members
            .iter()
            .any(|m| kinds_pair(ev.kind, m.kind));
        if !kind_ok {
            return false;
        }

        // 2) location token equality or full-string similarity
        let ev_token = ev.location_token();
        let ev_loc = ev.location.as_deref().map(str::to_lowercase);
        let mut loc_ok = false;
        let mut loc_strong = false;
        for m in &cluster.members {
            if let (Some(a), Some(b)) = (&ev_token, m.location_token()) {
                if *a == b {
                    loc_ok = true;
                }
            }
            if let (Some(a), Some(b)) = (&ev_loc, m.location.as_deref()) {
                let sim = jaro_winkler(a, &b.to_lowercase());
                if sim >= self.cfg.loc_similarity {
                    loc_ok = true;
                }
                if sim >= self.cfg.loc_similarity_strong {
                    loc_strong = true;
                }
            }
        }
        if !loc_ok {
            return false;
        }

        // 3) time bucket within ±slack of any member
        let bucket = ev.time_bucket(self.cfg.bucket_secs);
        let slack = self.cfg.bucket_slack;
        let time_ok = cluster.members.iter().any(|m| {
            let mb = m.time_bucket(self.cfg.bucket_secs);
            mb.abs_diff(bucket) <= slack
        });
        if !time_ok {
            return false;
        }

        // 4) entity overlap, or near-identical location strings
        let entity_ok = cluster
            .members
            .iter()
            .any(|m| m.entities.intersection(&ev.entities).next().is_some());
        entity_ok || loc_strong
    }

    fn index_member(&mut self, cluster_id: &str, ev: &Event) {
        if let Some(token) = ev.location_token() {
            let key = (ev.kind, token, ev.time_bucket(self.cfg.bucket_secs));
            self.index
                .entry(key)
                .or_default()
                .push(cluster_id.to_string());
        }
    }

    // ---- transitions ----------------------------------------------------

    fn emit(&mut self, cluster_id: &str, now: u64) -> Vec<ClusterAction> {
        let Some(mut cluster) = self.open.remove(cluster_id) else {
            return Vec::new();
        };
        cluster.state = ClusterState::Emitted;
        cluster.last_updated = now;

        let report = EmissionReport {
            cluster_id: cluster.cluster_id.clone(),
            kind: cluster.representative_kind(),
            location: cluster.representative_location().map(str::to_string),
            summary: cluster.representative_summary().to_string(),
            sources: cluster.sources.iter().cloned().collect(),
            cross_class: cluster.source_classes.len() > 1,
            first_seen: cluster.first_seen,
        };
        info!(
            target: "correlate",
            cluster = %cluster.cluster_id,
            sources = cluster.sources.len(),
            kind = report.kind.as_str(),
            "cluster emitted"
        );

        let mut actions = vec![ClusterAction::Emit(report)];
        if cluster.sources.len() >= self.cfg.min_sources {
            actions.push(ClusterAction::Authority(AuthorityUpdate::Corroborated {
                sources: cluster.sources.iter().cloned().collect(),
                at: now,
            }));
        }
        actions.push(ClusterAction::Persist {
            cluster: cluster.clone(),
            new_event: None,
        });
        self.recent_emitted.insert(cluster.cluster_id.clone(), cluster);
        actions
    }

    fn fast_track_ready(
        &self,
        cluster: &TrendCluster,
        authority: &AuthoritySnapshot,
        now: u64,
    ) -> bool {
        if cluster.state != ClusterState::Open {
            return false;
        }
        if now.saturating_sub(cluster.first_seen) < self.cfg.fast_track_hold_secs {
            return false;
        }
        cluster.sources.iter().any(|s| {
            authority.get(s).copied().unwrap_or(50.0) >= self.cfg.authority_high_threshold
        })
    }

    /// A denial supersedes the matching open or recently-emitted cluster.
    /// Returns None when nothing matches and the denial should be treated
    /// as an ordinary report.
    fn handle_denial(&mut self, ev: &Event, now: u64) -> Option<Vec<ClusterAction>> {
        let target = self
            .find_denial_target(ev, &self.open)
            .map(|id| (id, false))
            .or_else(|| self.find_denial_target(ev, &self.recent_emitted).map(|id| (id, true)))?;

        let (cluster_id, was_emitted) = target;
        let mut cluster = if was_emitted {
            self.recent_emitted.remove(&cluster_id)?
        } else {
            self.open.remove(&cluster_id)?
        };
        cluster.state = ClusterState::Superseded;
        cluster.last_updated = now;
        info!(
            target: "correlate",
            cluster = %cluster_id,
            was_emitted,
            source = %ev.source_id,
            "cluster superseded by denial"
        );

        let mut actions = Vec::new();
        if was_emitted {
            actions.push(ClusterAction::Retract {
                cluster_id: cluster_id.clone(),
                kind: cluster.representative_kind(),
                location: cluster.representative_location().map(str::to_string),
                reason: ev.summary.clone(),
            });
        }
        actions.push(ClusterAction::Authority(AuthorityUpdate::Contradicted {
            sources: cluster.sources.iter().cloned().collect(),
            at: now,
        }));
        actions.push(ClusterAction::Persist {
            cluster,
            new_event: Some(ev.clone()),
        });
        Some(actions)
    }

    fn find_denial_target(
        &self,
        ev: &Event,
        pool: &HashMap<String, TrendCluster>,
    ) -> Option<String> {
        let ev_token = ev.location_token();
        pool.iter()
            .filter(|(_, c)| {
                let kind_ok = c.members.iter().any(|m| kinds_pair(ev.kind, m.kind));
                if !kind_ok {
                    return false;
                }
                let loc_ok = match &ev_token {
                    Some(t) => c.members.iter().any(|m| m.location_token().as_deref() == Some(t)),
                    None => false,
                };
                // Same place, or the reporting source retracting its own claim
                loc_ok || c.sources.contains(&ev.source_id)
            })
            .max_by_key(|(_, c)| c.last_updated)
            .map(|(id, _)| id.clone())
    }
}

fn kinds_pair(a: EventKind, b: EventKind) -> bool {
    a == b || (a.is_soft() && !b.is_soft()) || (b.is_soft() && !a.is_soft())
}

fn authority_sum(cluster: &TrendCluster, authority: &AuthoritySnapshot) -> f64 {
    cluster
        .sources
        .iter()
        .map(|s| authority.get(s).copied().unwrap_or(50.0))
        .sum()
}
