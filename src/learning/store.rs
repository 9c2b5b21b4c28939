//! Durable lesson collections.
//!
//! Two JSONL files under the lessons directory: `candidates.jsonl` and
//! `approved.jsonl`, each keyed by content hash. Approval moves an entry
//! from one file to the other. Rewrites go through a temp file + rename,
//! serialized by a lock file so concurrent processes don't interleave.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::errors::StoreError;
use crate::learning::lesson::{CandidateLesson, LessonCard};

pub struct LessonStore {
    candidates_path: PathBuf,
    approved_path: PathBuf,
    lock_path: PathBuf,
}

impl LessonStore {
    /// Create a store rooted at `{dir}/lessons/`.
    pub fn new(dir: &Path) -> Self {
        let lessons_dir = dir.join("lessons");
        Self {
            candidates_path: lessons_dir.join("candidates.jsonl"),
            approved_path: lessons_dir.join("approved.jsonl"),
            lock_path: lessons_dir.join("lessons.lock"),
        }
    }

    pub fn load_candidates(&self) -> Vec<CandidateLesson> {
        self.load_jsonl(&self.candidates_path)
    }

    pub fn load_approved(&self) -> Vec<LessonCard> {
        self.load_jsonl(&self.approved_path)
    }

    pub fn save_candidates(&self, lessons: &[CandidateLesson]) -> Result<(), StoreError> {
        let _guard = self.acquire_lock();
        self.save_jsonl(&self.candidates_path, lessons)
    }

    pub fn save_approved(&self, cards: &[LessonCard]) -> Result<(), StoreError> {
        let _guard = self.acquire_lock();
        self.save_jsonl(&self.approved_path, cards)
    }

    // ---------------------------------------------------------------
    // Private helpers
    // ---------------------------------------------------------------

    fn load_jsonl<T: DeserializeOwned>(&self, path: &Path) -> Vec<T> {
        let data = match fs::read_to_string(path) {
            Ok(d) => d,
            Err(_) => return Vec::new(),
        };
        let mut out = Vec::new();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(line) {
                Ok(item) => out.push(item),
                Err(e) => warn!("skipping unparsable lesson line in {}: {}", path.display(), e),
            }
        }
        out
    }

    fn save_jsonl<T: Serialize>(&self, path: &Path, items: &[T]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let tmp_path = path.with_extension("jsonl.tmp");
        let mut f = fs::File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
        for item in items {
            let line = serde_json::to_string(item)?;
            writeln!(f, "{}", line).map_err(|e| StoreError::io(&tmp_path, e))?;
        }
        f.sync_all().map_err(|e| StoreError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, path).map_err(|e| StoreError::io(path, e))?;
        Ok(())
    }

    fn acquire_lock(&self) -> Option<LessonLockGuard> {
        if let Some(parent) = self.lock_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        const MAX_ATTEMPTS: u32 = 50;
        const RETRY_DELAY_MS: u64 = 20;
        for _ in 0..MAX_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(_) => {
                    return Some(LessonLockGuard {
                        lock_path: self.lock_path.clone(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                }
                Err(_) => return None,
            }
        }
        warn!("proceeding without lesson store lock at {}", self.lock_path.display());
        None
    }
}

struct LessonLockGuard {
    lock_path: PathBuf,
}

impl Drop for LessonLockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn candidate(content: &str) -> CandidateLesson {
        CandidateLesson::new(
            content.into(),
            BTreeSet::new(),
            ["r1/s1".to_string()].into_iter().collect(),
            0.5,
        )
    }

    #[test]
    fn test_empty_store_loads_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = LessonStore::new(tmp.path());
        assert!(store.load_candidates().is_empty());
        assert!(store.load_approved().is_empty());
    }

    #[test]
    fn test_candidates_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = LessonStore::new(tmp.path());
        store
            .save_candidates(&[candidate("lesson one"), candidate("lesson two")])
            .unwrap();

        let loaded = store.load_candidates();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].content, "lesson one");
    }

    #[test]
    fn test_approved_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = LessonStore::new(tmp.path());
        let card = LessonCard::from_candidate(candidate("approved lesson"));
        store.save_approved(&[card]).unwrap();

        let loaded = store.load_approved();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].archived);
    }

    #[test]
    fn test_save_replaces_not_appends() {
        let tmp = TempDir::new().unwrap();
        let store = LessonStore::new(tmp.path());
        store.save_candidates(&[candidate("a"), candidate("b")]).unwrap();
        store.save_candidates(&[candidate("a")]).unwrap();
        assert_eq!(store.load_candidates().len(), 1);
    }

    #[test]
    fn test_lock_file_released_after_save() {
        let tmp = TempDir::new().unwrap();
        let store = LessonStore::new(tmp.path());
        store.save_candidates(&[candidate("a")]).unwrap();
        assert!(!tmp.path().join("lessons").join("lessons.lock").exists());
    }

    #[test]
    fn test_corrupt_line_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = LessonStore::new(tmp.path());
        store.save_candidates(&[candidate("good")]).unwrap();

        let path = tmp.path().join("lessons").join("candidates.jsonl");
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{ not json").unwrap();

        assert_eq!(store.load_candidates().len(), 1);
    }
}
