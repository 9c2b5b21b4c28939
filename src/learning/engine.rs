//! Lesson extraction, deduplication, lifecycle, and retrieval.
//!
//! Extraction groups a run's failing episodes by failure mode and emits a
//! candidate only when the mode represents more than a configured share of
//! that run's failures, so noise never becomes a lesson. Candidates
//! deduplicate by content hash; promotion to an approved card is a one-way
//! operator action. Unused approved lessons are archived, never deleted.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::schema::LearningConfig;
use crate::learning::lesson::{
    content_hash, tokenize, CandidateLesson, LessonCard,
};
use crate::learning::store::LessonStore;
use crate::run::episode::FailureMode;
use crate::run::state::Run;
use crate::stats::taxonomy::classify_failure;

/// Summary counters for the lesson stores.
#[derive(Debug, Clone)]
pub struct LessonStats {
    pub n_candidates: usize,
    pub n_approved: usize,
    pub n_archived: usize,
    pub total_applications: u64,
    pub mean_confidence: f64,
}

/// Owns the candidate and approved lesson collections, indexed by content
/// hash for O(1) dedup lookup.
pub struct LearningEngine {
    store: LessonStore,
    config: LearningConfig,
    candidates: HashMap<String, CandidateLesson>,
    approved: HashMap<String, LessonCard>,
}

/// Deterministic lesson text for a failure mode on a benchmark. Per-run
/// figures stay out of the text so the same pattern observed in different
/// runs hashes identically.
fn lesson_content(benchmark: &str, mode: FailureMode) -> String {
    match mode {
        FailureMode::WrongAnswer => format!(
            "On benchmark {}, failures are dominated by incorrect final answers. \
             Re-check the produced answer against the expected format and state it \
             exactly before finishing.",
            benchmark
        ),
        FailureMode::Timeout => format!(
            "On benchmark {}, responses regularly miss the deadline. Prefer shorter \
             reasoning and emit the answer as soon as the result is known.",
            benchmark
        ),
        FailureMode::Crash => format!(
            "On benchmark {}, model calls fail outright. Verify provider health and \
             fallback chains before relying on this configuration.",
            benchmark
        ),
        FailureMode::CostLimit => format!(
            "On benchmark {}, runs hit the cost ceiling. Trim prompt size or cap \
             retries to stay inside the budget.",
            benchmark
        ),
    }
}

fn trigger_keywords(benchmark: &str, mode: FailureMode, content: &str) -> BTreeSet<String> {
    let mut keywords = tokenize(content);
    keywords.insert(mode.to_string());
    keywords.insert(benchmark.to_lowercase());
    keywords
}

impl LearningEngine {
    /// Open the engine over a lesson store, loading both collections.
    pub fn new(store: LessonStore, config: LearningConfig) -> Self {
        let candidates = store
            .load_candidates()
            .into_iter()
            .map(|c| (c.content_hash.clone(), c))
            .collect();
        let approved = store
            .load_approved()
            .into_iter()
            .map(|c| (c.content_hash.clone(), c))
            .collect();
        Self {
            store,
            config,
            candidates,
            approved,
        }
    }

    /// Extract lesson candidates from a run's failures. Returns the
    /// candidates created or merged by this extraction.
    pub fn extract(&mut self, run: &Run) -> Result<Vec<CandidateLesson>> {
        let failing: Vec<_> = run.episodes.iter().filter(|e| !e.outcome.passed).collect();
        if failing.is_empty() {
            return Ok(Vec::new());
        }
        let total_failures = failing.len();

        let mut by_mode: BTreeMap<FailureMode, Vec<&crate::run::episode::Episode>> =
            BTreeMap::new();
        for ep in failing {
            let mode = ep.outcome.failure_mode.unwrap_or_else(|| classify_failure(ep));
            by_mode.entry(mode).or_default().push(ep);
        }

        let mut touched = Vec::new();
        let mut approved_touched = false;
        for (mode, episodes) in by_mode {
            let proportion = episodes.len() as f64 / total_failures as f64;
            if proportion <= self.config.min_failure_proportion {
                debug!(
                    "skipping {} lesson for run {}: {:.0}% of failures is below threshold",
                    mode,
                    run.id,
                    proportion * 100.0
                );
                continue;
            }

            let content = lesson_content(&run.benchmark, mode);
            let hash = content_hash(&content);
            let evidence: BTreeSet<String> =
                episodes.iter().map(|e| e.id.clone()).collect();

            if let Some(card) = self.approved.get_mut(&hash) {
                // Already promoted: grow its evidence instead of re-candidating.
                card.evidence_refs.extend(evidence.iter().cloned());
                if proportion > card.failure_proportion {
                    card.failure_proportion = proportion;
                }
                card.recompute_confidence();
                approved_touched = true;
                continue;
            }

            let candidate = match self.candidates.get_mut(&hash) {
                Some(existing) => {
                    existing.merge(&evidence, proportion);
                    existing.clone()
                }
                None => {
                    let keywords = trigger_keywords(&run.benchmark, mode, &content);
                    let fresh = CandidateLesson::new(content, keywords, evidence, proportion);
                    self.candidates.insert(hash.clone(), fresh.clone());
                    fresh
                }
            };
            touched.push(candidate);
        }

        if !touched.is_empty() {
            self.persist_candidates()?;
            info!(
                "run {}: {} lesson candidates extracted or merged",
                run.id,
                touched.len()
            );
        }
        if approved_touched {
            self.persist_approved()?;
        }
        Ok(touched)
    }

    /// Promote a candidate to an approved lesson card. One-way.
    pub fn approve(&mut self, hash: &str) -> Result<LessonCard> {
        let candidate = match self.candidates.remove(hash) {
            Some(c) => c,
            None => bail!("no candidate lesson with hash {}", hash),
        };
        let card = LessonCard::from_candidate(candidate);
        self.approved.insert(card.content_hash.clone(), card.clone());
        self.persist_candidates()?;
        self.persist_approved()?;
        info!("lesson {} approved", hash);
        Ok(card)
    }

    /// Discard a candidate. One-way.
    pub fn reject(&mut self, hash: &str) -> Result<()> {
        if self.candidates.remove(hash).is_none() {
            bail!("no candidate lesson with hash {}", hash);
        }
        self.persist_candidates()?;
        info!("lesson {} rejected", hash);
        Ok(())
    }

    /// Retrieve approved, non-archived lessons whose trigger keywords match
    /// tokens in the context. Ordered by match count, then confidence, then
    /// most recent application.
    pub fn retrieve(&self, context: &str) -> Vec<LessonCard> {
        let tokens = tokenize(context);
        let mut hits: Vec<(usize, &LessonCard)> = self
            .approved
            .values()
            .filter(|card| !card.archived)
            .filter_map(|card| {
                let matches = card
                    .trigger_keywords
                    .iter()
                    .filter(|k| tokens.contains(*k))
                    .count();
                if matches > 0 {
                    Some((matches, card))
                } else {
                    None
                }
            })
            .collect();

        hits.sort_by(|(ma, a), (mb, b)| {
            mb.cmp(ma)
                .then_with(|| {
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| b.last_applied_at.cmp(&a.last_applied_at))
        });

        hits.into_iter()
            .take(self.config.max_retrieved)
            .map(|(_, card)| card.clone())
            .collect()
    }

    /// Record that an approved lesson was applied, with the outcome of the
    /// episode it was applied to.
    pub fn record_application(&mut self, hash: &str, success: bool) -> Result<()> {
        let card = match self.approved.get_mut(hash) {
            Some(c) => c,
            None => bail!("no approved lesson with hash {}", hash),
        };
        card.record_application(success);
        self.persist_approved()
    }

    /// Archive approved lessons not applied within the configured idle
    /// window (falling back to approval time for never-applied cards).
    /// Reversible via [`Self::unarchive`]. Returns how many were archived.
    pub fn archive_stale(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - chrono::Duration::days(self.config.max_idle_days);
        let mut archived = 0usize;
        for card in self.approved.values_mut() {
            if card.archived {
                continue;
            }
            let reference = card.last_applied_at.as_deref().unwrap_or(&card.approved_at);
            let stale = DateTime::parse_from_rfc3339(reference)
                .map(|t| t.with_timezone(&Utc) < cutoff)
                .unwrap_or(false);
            if stale {
                card.archived = true;
                archived += 1;
            }
        }
        if archived > 0 {
            info!("archived {} stale lessons", archived);
            self.persist_approved()?;
        }
        Ok(archived)
    }

    /// Reverse an archive decision.
    pub fn unarchive(&mut self, hash: &str) -> Result<()> {
        let card = match self.approved.get_mut(hash) {
            Some(c) => c,
            None => bail!("no approved lesson with hash {}", hash),
        };
        card.archived = false;
        self.persist_approved()
    }

    pub fn candidates(&self) -> Vec<&CandidateLesson> {
        let mut all: Vec<_> = self.candidates.values().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn approved(&self) -> Vec<&LessonCard> {
        let mut all: Vec<_> = self.approved.values().collect();
        all.sort_by(|a, b| a.approved_at.cmp(&b.approved_at));
        all
    }

    pub fn stats(&self) -> LessonStats {
        let n_archived = self.approved.values().filter(|c| c.archived).count();
        let total_applications = self.approved.values().map(|c| c.application_count).sum();
        let mean_confidence = if self.approved.is_empty() {
            0.0
        } else {
            self.approved.values().map(|c| c.confidence).sum::<f64>()
                / self.approved.len() as f64
        };
        LessonStats {
            n_candidates: self.candidates.len(),
            n_approved: self.approved.len(),
            n_archived,
            total_applications,
            mean_confidence,
        }
    }

    fn persist_candidates(&self) -> Result<()> {
        let mut all: Vec<_> = self.candidates.values().cloned().collect();
        all.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
        self.store.save_candidates(&all)?;
        Ok(())
    }

    fn persist_approved(&self) -> Result<()> {
        let mut all: Vec<_> = self.approved.values().cloned().collect();
        all.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
        self.store.save_approved(&all)?;
        Ok(())
    }
}
