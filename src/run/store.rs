//! Durable run records.
//!
//! Each run owns a directory under the store root holding `state.json` (the
//! run metadata, rewritten via temp-file + rename so a crash mid-write never
//! leaves a partial state file) and `episodes.jsonl` (append-only episode
//! log; appends never read prior entries). Reloading merges both so a run
//! can be inspected after a process restart.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::errors::StoreError;
use crate::run::episode::Episode;
use crate::run::state::Run;

#[derive(Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    fn state_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("state.json")
    }

    fn episodes_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("episodes.jsonl")
    }

    /// Persist run metadata atomically (write-then-rename).
    pub fn save_state(&self, run: &Run) -> Result<(), StoreError> {
        let dir = self.run_dir(&run.id);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let path = self.state_path(&run.id);
        let tmp_path = path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(run)?;
        let mut f = fs::File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
        f.write_all(json.as_bytes())
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        f.sync_all().map_err(|e| StoreError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &path).map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    /// Append one episode line to the run's log.
    pub fn append_episode(&self, run_id: &str, episode: &Episode) -> Result<(), StoreError> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let path = self.episodes_path(run_id);
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        let line = serde_json::to_string(episode)?;
        writeln!(f, "{}", line).map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    /// Ingestion-collaborator entry point: bulk-append already-parsed
    /// episodes extracted elsewhere.
    pub fn import_episodes(&self, run_id: &str, episodes: &[Episode]) -> Result<(), StoreError> {
        for ep in episodes {
            self.append_episode(run_id, ep)?;
        }
        Ok(())
    }

    /// Reload a run: state file plus its episode log, episodes ordered by
    /// sample index. Unparsable episode lines are skipped with a warning.
    pub fn load_run(&self, run_id: &str) -> Result<Run, StoreError> {
        let path = self.state_path(run_id);
        if !path.exists() {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        let contents = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        let mut run: Run = serde_json::from_str(&contents)?;
        run.episodes = self.load_episodes(run_id)?;
        Ok(run)
    }

    /// Load just the episode log for a run.
    pub fn load_episodes(&self, run_id: &str) -> Result<Vec<Episode>, StoreError> {
        let path = self.episodes_path(run_id);
        let mut episodes: Vec<Episode> = Vec::new();
        if !path.exists() {
            return Ok(episodes);
        }
        let data = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Episode>(line) {
                Ok(ep) => episodes.push(ep),
                Err(e) => warn!("skipping unparsable episode line in {}: {}", run_id, e),
            }
        }
        episodes.sort_by_key(|e| e.sample_index);
        Ok(episodes)
    }

    /// Persist a run's analysis report beside its state (write-then-rename).
    pub fn save_report(
        &self,
        run_id: &str,
        report: &crate::stats::RunReport,
    ) -> Result<(), StoreError> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let path = dir.join("report.json");
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(report)?;
        fs::write(&tmp_path, json).map_err(|e| StoreError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &path).map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    /// Load a previously saved analysis report, if one exists.
    pub fn load_report(&self, run_id: &str) -> Result<Option<crate::stats::RunReport>, StoreError> {
        let path = self.run_dir(run_id).join("report.json");
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// List run ids present in the store, newest last (ids sort by timestamp).
    pub fn list_runs(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if entry.path().join("state.json").exists() {
                    if let Some(name) = entry.file_name().to_str() {
                        ids.push(name.to_string());
                    }
                }
            }
        }
        ids.sort();
        ids
    }
}
