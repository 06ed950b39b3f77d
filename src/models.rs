//! models.rs — shared record types flowing between pipeline stages.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Editorial class of an origin channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceClass {
    Arab,
    Smart,
}

impl SourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceClass::Arab => "arab",
            SourceClass::Smart => "smart",
        }
    }
}

/// A message as delivered by the chat-network listener. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    /// Stable identifier of the origin channel (username, lowercase).
    pub source_id: String,
    pub source_class: SourceClass,
    /// Unique within `source_id`.
    pub message_id: i64,
    /// Monotonic ingestion timestamp (unix seconds).
    pub arrived_at: u64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<i64>,
    /// Opaque media references; never downloaded by the core.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_refs: Vec<String>,
}

/// Best-effort script guess for a normalized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LangGuess {
    Ar,
    He,
    En,
    Und,
}

/// Canonical form of a message plus its content fingerprint.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub raw: RawMessage,
    pub text_norm: String,
    /// First 160 bits of SHA-256 over `text_norm`, lowercase hex.
    pub hash: String,
    pub lang_guess: LangGuess,
    /// True when normalization left nothing; the pipeline drops these.
    pub empty: bool,
}

/// Enumerated event categories the extractor may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Strike,
    Movement,
    Casualty,
    Claim,
    Statement,
    Other,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Strike => "strike",
            EventKind::Movement => "movement",
            EventKind::Casualty => "casualty",
            EventKind::Claim => "claim",
            EventKind::Statement => "statement",
            EventKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strike" => Some(EventKind::Strike),
            "movement" => Some(EventKind::Movement),
            "casualty" => Some(EventKind::Casualty),
            "claim" => Some(EventKind::Claim),
            "statement" => Some(EventKind::Statement),
            "other" => Some(EventKind::Other),
            _ => None,
        }
    }

    /// Claims and statements may corroborate a more specific report.
    pub fn is_soft(&self) -> bool {
        matches!(self, EventKind::Claim | EventKind::Statement)
    }
}

/// Reference back to a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub source_id: String,
    pub message_id: i64,
}

/// Structured record extracted from one or more messages of a single source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub source_id: String,
    pub source_class: SourceClass,
    /// At least one.
    pub message_refs: Vec<MessageRef>,
    pub kind: EventKind,
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<(f64, f64)>,
    pub entities: BTreeSet<String>,
    /// Reported time if the text named one, unix seconds.
    pub time_hint: Option<u64>,
    pub summary: String,
    /// Extractor's self-reported confidence in [0, 1].
    pub confidence_self: f32,
    pub ingested_at: u64,
}

impl Event {
    /// First location token, lowercased, administrative suffixes stripped.
    /// Used as the coarse correlation key.
    pub fn location_token(&self) -> Option<String> {
        self.location.as_deref().and_then(location_token)
    }

    /// 15-minute correlation bucket from the reported time, falling back to
    /// ingestion time.
    pub fn time_bucket(&self, bucket_secs: u64) -> u64 {
        self.time_hint.unwrap_or(self.ingested_at) / bucket_secs
    }
}

const ADMIN_SUFFIXES: &[&str] = &[
    "governorate",
    "district",
    "province",
    "region",
    "city",
    "camp",
    "محافظة",
    "قضاء",
    "מחוז",
];

/// First placename token of a free-form location string.
pub fn location_token(location: &str) -> Option<String> {
    let head = location.split(',').next().unwrap_or(location);
    head.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| c.is_ascii_punctuation())
                .to_lowercase()
        })
        .find(|w| !w.is_empty() && !ADMIN_SUFFIXES.contains(&w.as_str()))
}

/// Lifecycle of a correlated cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Open,
    Emitted,
    Superseded,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Open => "open",
            ClusterState::Emitted => "emitted",
            ClusterState::Superseded => "superseded",
        }
    }
}

/// A group of events believed to describe one real-world occurrence.
#[derive(Debug, Clone)]
pub struct TrendCluster {
    pub cluster_id: String,
    pub members: Vec<Event>,
    pub sources: BTreeSet<String>,
    pub source_classes: BTreeSet<SourceClass>,
    pub first_seen: u64,
    pub last_updated: u64,
    pub state: ClusterState,
    /// Cached sum of member-source authority at last update.
    pub authority_sum: f64,
}

impl TrendCluster {
    pub fn new(first: Event, now: u64) -> Self {
        let mut sources = BTreeSet::new();
        sources.insert(first.source_id.clone());
        let mut source_classes = BTreeSet::new();
        source_classes.insert(first.source_class);
        Self {
            cluster_id: uuid::Uuid::new_v4().to_string(),
            members: vec![first],
            sources,
            source_classes,
            first_seen: now,
            last_updated: now,
            state: ClusterState::Open,
            authority_sum: 0.0,
        }
    }

    pub fn absorb(&mut self, ev: Event, now: u64) {
        self.sources.insert(ev.source_id.clone());
        self.source_classes.insert(ev.source_class);
        self.members.push(ev);
        self.last_updated = now;
    }

    /// Longest member summary; merged clusters keep the most informative text.
    pub fn representative_summary(&self) -> &str {
        self.members
            .iter()
            .map(|m| m.summary.as_str())
            .max_by_key(|s| s.chars().count())
            .unwrap_or("")
    }

    pub fn representative_location(&self) -> Option<&str> {
        self.members.iter().find_map(|m| m.location.as_deref())
    }

    /// Dominant specific kind, preferring non-soft members.
    pub fn representative_kind(&self) -> EventKind {
        self.members
            .iter()
            .map(|m| m.kind)
            .find(|k| !k.is_soft())
            .unwrap_or_else(|| self.members[0].kind)
    }
}

/// Per-source credibility state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceAuthority {
    pub score: f64,
    pub corroborations: u32,
    pub contradictions: u32,
    pub last_update: u64,
}

impl SourceAuthority {
    pub fn initial(now: u64) -> Self {
        Self {
            score: 50.0,
            corroborations: 0,
            contradictions: 0,
            last_update: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_token_strips_admin_suffix() {
        assert_eq!(location_token("Gaza Governorate"), Some("gaza".into()));
        assert_eq!(location_token("Khan Younis, Gaza"), Some("khan".into()));
        assert_eq!(location_token("  "), None);
    }

    #[test]
    fn kind_parse_round_trips() {
        for k in [
            EventKind::Strike,
            EventKind::Movement,
            EventKind::Casualty,
            EventKind::Claim,
            EventKind::Statement,
            EventKind::Other,
        ] {
            assert_eq!(EventKind::parse(k.as_str()), Some(k));
        }
        assert_eq!(EventKind::parse("rocket"), None);
    }

    #[test]
    fn cluster_tracks_sources_and_classes() {
        let mk = |src: &str, class: SourceClass| Event {
            event_id: "e".into(),
            source_id: src.into(),
            source_class: class,
            message_refs: vec![MessageRef {
                source_id: src.into(),
                message_id: 1,
            }],
            kind: EventKind::Strike,
            location: Some("Gaza".into()),
            coordinates: None,
            entities: BTreeSet::new(),
            time_hint: None,
            summary: "s".into(),
            confidence_self: 0.5,
            ingested_at: 100,
        };
        let mut c = TrendCluster::new(mk("a", SourceClass::Arab), 100);
        c.absorb(mk("b", SourceClass::Smart), 110);
        c.absorb(mk("a", SourceClass::Arab), 120);
        assert_eq!(c.members.len(), 3);
        assert_eq!(c.sources.len(), 2);
        assert!(c.sources.len() <= c.members.len());
        assert_eq!(c.source_classes.len(), 2);
        assert_eq!(c.last_updated, 120);
    }
}
