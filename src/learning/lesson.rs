//! Lesson artifacts: extracted candidates and approved lesson cards.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::run::episode::now_timestamp;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9_]+").unwrap());

/// Words too common to act as retrieval triggers.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "with", "this", "that", "from", "into", "before", "after",
    "against", "produce", "produced",
];

/// Lowercase and collapse runs of whitespace; the canonical form behind
/// content hashing.
pub fn normalize_content(content: &str) -> String {
    WHITESPACE
        .replace_all(content.trim(), " ")
        .to_lowercase()
}

/// Stable hex SHA-256 of the normalized content text.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(normalize_content(content).as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Tokenize text for trigger matching: lowercase words of three or more
/// characters, minus stopwords.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    WORD.find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .filter(|w| w.len() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// A lesson extracted from one or more failure episodes, awaiting an
/// operator decision. Content is immutable once created; evidence may grow
/// when re-extraction lands on the same content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateLesson {
    pub content: String,
    pub content_hash: String,
    pub trigger_keywords: BTreeSet<String>,
    /// Episode ids backing this lesson.
    pub evidence_refs: BTreeSet<String>,
    /// Share of the source run's failures attributed to this mode.
    pub failure_proportion: f64,
    pub created_at: String,
}

impl CandidateLesson {
    pub fn new(
        content: String,
        trigger_keywords: BTreeSet<String>,
        evidence_refs: BTreeSet<String>,
        failure_proportion: f64,
    ) -> Self {
        let content_hash = content_hash(&content);
        Self {
            content,
            content_hash,
            trigger_keywords,
            evidence_refs,
            failure_proportion,
            created_at: now_timestamp(),
        }
    }

    /// Merge a re-extraction of the same hash: union of evidence, strongest
    /// observed proportion.
    pub fn merge(&mut self, evidence_refs: &BTreeSet<String>, failure_proportion: f64) {
        self.evidence_refs
            .extend(evidence_refs.iter().cloned());
        if failure_proportion > self.failure_proportion {
            self.failure_proportion = failure_proportion;
        }
    }
}

/// Confidence caps evidence growth so a single run cannot alone produce a
/// high-confidence lesson.
pub fn confidence(evidence_count: usize, failure_proportion: f64) -> f64 {
    (evidence_count as f64 / 10.0).min(1.0) * failure_proportion
}

/// A candidate promoted by operator approval. Never deleted; archiving is
/// the reversible retirement path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonCard {
    pub content: String,
    pub content_hash: String,
    pub trigger_keywords: BTreeSet<String>,
    pub evidence_refs: BTreeSet<String>,
    pub failure_proportion: f64,
    pub confidence: f64,
    pub application_count: u64,
    pub success_rate_when_applied: f64,
    pub approved_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_at: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

impl LessonCard {
    pub fn from_candidate(candidate: CandidateLesson) -> Self {
        let confidence = confidence(candidate.evidence_refs.len(), candidate.failure_proportion);
        Self {
            content: candidate.content,
            content_hash: candidate.content_hash,
            trigger_keywords: candidate.trigger_keywords,
            evidence_refs: candidate.evidence_refs,
            failure_proportion: candidate.failure_proportion,
            confidence,
            application_count: 0,
            success_rate_when_applied: 0.0,
            approved_at: now_timestamp(),
            last_applied_at: None,
            archived: false,
        }
    }

    /// Recompute confidence after evidence changed.
    pub fn recompute_confidence(&mut self) {
        self.confidence = confidence(self.evidence_refs.len(), self.failure_proportion);
    }

    /// Record that this lesson was applied, and whether the episode it was
    /// applied to passed. Keeps an incremental success-rate mean.
    pub fn record_application(&mut self, success: bool) {
        let successes = self.success_rate_when_applied * self.application_count as f64
            + if success { 1.0 } else { 0.0 };
        self.application_count += 1;
        self.success_rate_when_applied = successes / self.application_count as f64;
        self.last_applied_at = Some(now_timestamp());
    }
}
