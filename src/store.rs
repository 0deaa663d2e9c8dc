use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::analysis::{AnalysisId, AnalysisResult};
use crate::error::{Error, Stage};

#[derive(Debug, Clone)]
pub enum AnalysisStatus {
    Pending,
    Running { frames: u64 },
    Completed(Arc<AnalysisResult>),
    Failed { stage: Stage, message: String },
}

impl AnalysisStatus {
    #[inline]
    pub fn is_finished(&self) -> bool {
        matches!(self, AnalysisStatus::Completed(_) | AnalysisStatus::Failed { .. })
    }

    pub fn result(&self) -> Option<&Arc<AnalysisResult>> {
        match self {
            AnalysisStatus::Completed(r) => Some(r),
            _ => None,
        }
    }
}

/// Registry of analyses keyed by id, with optional JSON persistence of
/// completed results.
#[derive(Clone)]
pub struct AnalysisStore {
    entries: Arc<Mutex<HashMap<AnalysisId, watch::Sender<AnalysisStatus>>>>,
    dir: Option<PathBuf>,
}

impl AnalysisStore {
    pub fn in_memory() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            dir: None,
        }
    }

    pub fn persistent<P: AsRef<Path>>(dir: P) -> Result<Self, Error> {
        std::fs::create_dir_all(dir.as_ref())?;

        Ok(Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            dir: Some(dir.as_ref().to_path_buf()),
        })
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<AnalysisId, watch::Sender<AnalysisStatus>>) -> R) -> R {
        let mut guard = match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        f(&mut guard)
    }

    pub fn register(&self, id: AnalysisId) {
        self.with_entries(|entries| {
            entries
                .entry(id)
                .or_insert_with(|| watch::channel(AnalysisStatus::Pending).0);
        });
    }

    fn set(&self, id: AnalysisId, status: AnalysisStatus) {
        self.with_entries(|entries| match entries.get(&id) {
            Some(tx) => {
                tx.send_replace(status);
            }
            None => {
                entries.insert(id, watch::channel(status).0);
            }
        });
    }

    pub fn set_running(&self, id: AnalysisId, frames: u64) {
        self.set(id, AnalysisStatus::Running { frames });
    }

    pub fn fail(&self, id: AnalysisId, stage: Stage, message: String) {
        warn!(analysis_id = %id, %stage, %message, "analysis failed");
        self.set(id, AnalysisStatus::Failed { stage, message });
    }

    /// Stores a finished result, writing it to disk first when persistence is on.
    pub fn complete(&self, result: AnalysisResult) -> Result<Arc<AnalysisResult>, Error> {
        if let Some(path) = self.path_of(result.analysis_id) {
            let encoded = serde_json::to_vec_pretty(&result)?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, encoded)?;
            std::fs::rename(&tmp, &path)?;
            debug!(analysis_id = %result.analysis_id, path = %path.display(), "analysis persisted");
        }

        let id = result.analysis_id;
        let result = Arc::new(result);
        self.set(id, AnalysisStatus::Completed(result.clone()));
        info!(analysis_id = %id, "analysis completed");

        Ok(result)
    }

    fn path_of(&self, id: AnalysisId) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.json", id)))
    }

    fn load(&self, id: AnalysisId) -> Option<Arc<AnalysisResult>> {
        let path = self.path_of(id)?;
        if !path.exists() {
            return None;
        }

        let parsed = std::fs::read(&path)
            .map_err(Error::from)
            .and_then(|bytes| serde_json::from_slice::<AnalysisResult>(&bytes).map_err(Error::from));

        match parsed {
            Ok(result) => {
                let result = Arc::new(result);
                self.set(id, AnalysisStatus::Completed(result.clone()));
                debug!(analysis_id = %id, "analysis reloaded from disk");
                Some(result)
            }
            Err(err) => {
                warn!(analysis_id = %id, %err, "persisted analysis is unreadable");
                None
            }
        }
    }

    /// Current status; completed results on disk are reloaded lazily.
    pub fn status(&self, id: AnalysisId) -> Option<AnalysisStatus> {
        let current = self.with_entries(|entries| entries.get(&id).map(|tx| tx.borrow().clone()));

        match current {
            Some(status) => Some(status),
            None => self.load(id).map(AnalysisStatus::Completed),
        }
    }

    pub fn subscribe(&self, id: AnalysisId) -> Option<watch::Receiver<AnalysisStatus>> {
        if self.status(id).is_none() {
            return None;
        }

        self.with_entries(|entries| entries.get(&id).map(|tx| tx.subscribe()))
    }

    /// Resolves once the analysis is completed or failed.
    pub async fn wait_finished(&self, id: AnalysisId) -> Option<AnalysisStatus> {
        let mut rx = self.subscribe(id)?;

        loop {
            {
                let status = rx.borrow_and_update();
                if status.is_finished() {
                    return Some(status.clone());
                }
            }

            if rx.changed().await.is_err() {
                return Some(rx.borrow().clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{QualityFlags, VideoInfo};
    use crate::metrics::MatchMetrics;
    use crate::team::TeamAssignment;

    fn result(id: AnalysisId) -> AnalysisResult {
        AnalysisResult {
            analysis_id: id,
            video: VideoInfo {
                frames: 10,
                fps: 25.0,
                duration_secs: 0.4,
                width: 64,
                height: 48,
            },
            metrics: MatchMetrics::default(),
            teams: TeamAssignment::default(),
            tracks: Vec::new(),
            quality: QualityFlags::default(),
        }
    }

    #[test]
    fn unknown_id_has_no_status() {
        let store = AnalysisStore::in_memory();
        assert!(store.status(AnalysisId::new()).is_none());
    }

    #[test]
    fn lifecycle_is_observable() {
        let store = AnalysisStore::in_memory();
        let id = AnalysisId::new();
        store.register(id);
        assert!(matches!(store.status(id), Some(AnalysisStatus::Pending)));

        store.set_running(id, 4);
        assert!(matches!(store.status(id), Some(AnalysisStatus::Running { frames: 4 })));

        store.complete(result(id)).unwrap();
        assert!(store.status(id).unwrap().result().is_some());
    }

    #[test]
    fn completed_results_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let id = AnalysisId::new();

        AnalysisStore::persistent(dir.path()).unwrap().complete(result(id)).unwrap();
        assert!(dir.path().join(format!("{}.json", id)).exists());

        let reopened = AnalysisStore::persistent(dir.path()).unwrap();
        let status = reopened.status(id).unwrap();
        assert_eq!(status.result().unwrap().video.frames, 10);
    }

    #[tokio::test]
    async fn waiting_resolves_on_failure() {
        let store = AnalysisStore::in_memory();
        let id = AnalysisId::new();
        store.register(id);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_finished(id).await })
        };

        store.set_running(id, 1);
        store.fail(id, Stage::Detection, "model crashed".into());

        let status = waiter.await.unwrap().unwrap();
        assert!(matches!(status, AnalysisStatus::Failed { stage: Stage::Detection, .. }));
    }
}
