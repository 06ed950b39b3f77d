//! normalize.rs — canonical text form and content fingerprints.
//!
//! Deterministic: identical input bytes produce identical output, and the
//! transform is idempotent (normalizing an already-normalized text is a
//! no-op). Two messages that differ only in diacritics, whitespace, or a
//! channel signature trailer collapse to the same `hash`.

use once_cell::sync::OnceCell;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::models::{LangGuess, NormalizedMessage, RawMessage};

/// Normalizer with a configured list of channel-signature trailers to strip.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    trailers: Vec<String>,
}

impl Normalizer {
    pub fn new(trailer_patterns: &[String]) -> Self {
        Self {
            trailers: trailer_patterns.to_vec(),
        }
    }

    pub fn normalize(&self, raw: RawMessage) -> NormalizedMessage {
        let text_norm = self.normalize_text(&raw.text);
        let hash = content_hash(&text_norm);
        let lang_guess = guess_lang(&text_norm);
        let empty = text_norm.is_empty();
        NormalizedMessage {
            raw,
            text_norm,
            hash,
            lang_guess,
            empty,
        }
    }

    /// Normalization steps, in order: strip bidi control marks, strip RTL
    /// combining diacritics, collapse whitespace, strip signature trailers,
    /// lowercase Latin.
    pub fn normalize_text(&self, s: &str) -> String {
        // 1) Bidirectional control marks
        static RE_BIDI: OnceCell<Regex> = OnceCell::new();
        let re_bidi = RE_BIDI.get_or_init(|| {
            Regex::new(r"[\u{200E}\u{200F}\u{202A}-\u{202E}\u{2066}-\u{2069}\u{061C}]").unwrap()
        });
        let mut out = re_bidi.replace_all(s, "").to_string();

        // 2) Arabic tashkeel + Hebrew niqqud/te'amim
        static RE_DIACRITICS: OnceCell<Regex> = OnceCell::new();
        let re_dia = RE_DIACRITICS.get_or_init(|| {
            Regex::new(r"[\u{0610}-\u{061A}\u{064B}-\u{065F}\u{0670}\u{0591}-\u{05C7}]").unwrap()
        });
        out = re_dia.replace_all(&out, "").to_string();

        // 3) Collapse whitespace
        static RE_WS: OnceCell<Regex> = OnceCell::new();
        let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());
        out = re_ws.replace_all(&out, " ").trim().to_string();

        // 4) Channel signature trailers (literal bracketed suffixes)
        loop {
            let before = out.len();
            for t in &self.trailers {
                if let Some(stripped) = out.strip_suffix(t.as_str()) {
                    out = stripped.trim_end().to_string();
                }
            }
            if out.len() == before {
                break;
            }
        }

        // 5) Trailing sentence punctuation (Arabic forms included)
        while let Some(last) = out.chars().last() {
            if matches!(last, '!' | '?' | '.' | ',' | '؟' | '،') {
                out.pop();
            } else {
                break;
            }
        }
        out = out.trim_end().to_string();

        // 6) Lowercase Latin letters only; RTL scripts are case-free
        out.chars()
            .map(|c| {
                if c.is_ascii_uppercase() {
                    c.to_ascii_lowercase()
                } else {
                    c
                }
            })
            .collect()
    }
}

/// First 160 bits of SHA-256 over the normalized text, lowercase hex.
pub fn content_hash(text_norm: &str) -> String {
    let digest = Sha256::digest(text_norm.as_bytes());
    let mut out = String::with_capacity(40);
    for b in &digest[..20] {
        use std::fmt::Write as _;
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Dominant-script guess. Counts letters per script; ties go to the first
/// script reached, absence of letters yields `Und`.
pub fn guess_lang(text: &str) -> LangGuess {
    let mut ar = 0usize;
    let mut he = 0usize;
    let mut la = 0usize;
    for c in text.chars() {
        match c {
            '\u{0600}'..='\u{06FF}' | '\u{0750}'..='\u{077F}' => ar += 1,
            '\u{0590}'..='\u{05FF}' => he += 1,
            c if c.is_ascii_alphabetic() => la += 1,
            _ => {}
        }
    }
    let max = ar.max(he).max(la);
    if max == 0 {
        LangGuess::Und
    } else if ar == max {
        LangGuess::Ar
    } else if he == max {
        LangGuess::He
    } else {
        LangGuess::En
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceClass;

    fn raw(text: &str) -> RawMessage {
        RawMessage {
            source_id: "chan".into(),
            source_class: SourceClass::Arab,
            message_id: 1,
            arrived_at: 0,
            text: text.into(),
            reply_to: None,
            media_refs: Vec::new(),
        }
    }

    #[test]
    fn diacritics_and_whitespace_collapse_to_same_hash() {
        let n = Normalizer::default();
        let a = n.normalize(raw("انفجار في غزة اليوم"));
        let b = n.normalize(raw("انفجارٌ  في غزّة اليوم!!"));
        // Tashkeel, doubled spaces and trailing punctuation differ
        assert_eq!(a.text_norm, b.text_norm);
        assert_eq!(a.hash, b.hash);
        assert!(!a.empty);
    }

    #[test]
    fn latin_is_lowercased_rtl_untouched() {
        let n = Normalizer::default();
        assert_eq!(n.normalize_text("Strike In Khan Younis"), "strike in khan younis");
        assert_eq!(n.normalize_text("غارة"), "غارة");
    }

    #[test]
    fn trailer_is_stripped_repeatedly() {
        let n = Normalizer::new(&["[via NewsWire]".to_string()]);
        assert_eq!(
            n.normalize_text("explosion reported [via NewsWire] [via NewsWire]"),
            "explosion reported"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let n = Normalizer::new(&["[via NewsWire]".to_string()]);
        let once = n.normalize_text("  Breaking:  غارَة  on   Rafah [via NewsWire]");
        assert_eq!(n.normalize_text(&once), once);
    }

    #[test]
    fn empty_text_flags_and_hashes_empty_string() {
        let n = Normalizer::default();
        let m = n.normalize(raw("   \u{200F}  "));
        assert!(m.empty);
        assert_eq!(m.hash, content_hash(""));
        assert_eq!(m.hash.len(), 40);
    }

    #[test]
    fn lang_guess_by_dominant_script() {
        assert_eq!(guess_lang("غارة على رفح"), LangGuess::Ar);
        assert_eq!(guess_lang("פיצוץ בעזה"), LangGuess::He);
        assert_eq!(guess_lang("strike reported"), LangGuess::En);
        assert_eq!(guess_lang("123 !!"), LangGuess::Und);
    }
}
