//! Durable GlobalModel snapshots
//!
//! Layout under the checkpoint directory:
//!
//! ```text
//! global_model.json        latest aggregated model
//! junctions/<id>.json      latest local weights per junction (optional)
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::CheckpointError;
use crate::rl::{PolicyConfig, WeightBlob};
use crate::sim::JunctionId;

const GLOBAL_FILE: &str = "global_model.json";
const JUNCTION_DIR: &str = "junctions";

/// Weight snapshot plus the round that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalModel {
    /// Number of aggregated rounds behind these weights
    pub round: u64,
    pub policy: PolicyConfig,
    pub weights: WeightBlob,
    /// RFC 3339
    pub saved_at: String,
}

impl GlobalModel {
    pub fn new(round: u64, policy: PolicyConfig, weights: WeightBlob) -> Self {
        Self {
            round,
            policy,
            weights,
            saved_at: now_rfc3339(),
        }
    }

    /// Successor model at `round + 1`
    pub fn next(&self, weights: WeightBlob) -> Self {
        Self::new(self.round + 1, self.policy.clone(), weights)
    }

    /// Both the declared network shape and the tensors match `policy`/`reference`
    pub fn check_compatible(
        &self,
        policy: &PolicyConfig,
        reference: &WeightBlob,
    ) -> Result<(), CheckpointError> {
        if !self.policy.same_shape(policy) {
            return Err(CheckpointError::ShapeMismatch(format!(
                "checkpoint network is {}→{:?}→{}, configured {}→{:?}→{}",
                self.policy.obs_size,
                self.policy.hidden_sizes,
                self.policy.num_actions,
                policy.obs_size,
                policy.hidden_sizes,
                policy.num_actions
            )));
        }
        self.weights
            .check_shape(reference)
            .map_err(|e| CheckpointError::ShapeMismatch(e.to_string()))
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Reads and writes model snapshots in one directory
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn global_path(&self) -> PathBuf {
        self.dir.join(GLOBAL_FILE)
    }

    pub fn junction_path(&self, junction: &JunctionId) -> PathBuf {
        self.dir
            .join(JUNCTION_DIR)
            .join(format!("{}.json", junction.as_str()))
    }

    pub fn save_global(&self, model: &GlobalModel) -> Result<(), CheckpointError> {
        let path = self.global_path();
        save_json(&path, model)?;
        tracing::info!("Saved global model round {} to {}", model.round, path.display());
        Ok(())
    }

    pub fn load_global(&self) -> Result<Option<GlobalModel>, CheckpointError> {
        load_json(&self.global_path())
    }

    /// Continue from the stored model when `resume` is set and one exists,
    /// otherwise start at round 0 from `fresh`
    pub fn resume_or_init(
        &self,
        policy: PolicyConfig,
        fresh: WeightBlob,
        resume: bool,
    ) -> Result<GlobalModel, CheckpointError> {
        if resume && let Some(model) = self.load_global()? {
            model.check_compatible(&policy, &fresh)?;
            tracing::info!(
                "Resuming from round {} ({}, saved {})",
                model.round,
                self.global_path().display(),
                model.saved_at
            );
            return Ok(model);
        }
        Ok(GlobalModel::new(0, policy, fresh))
    }

    pub fn save_junction(
        &self,
        junction: &JunctionId,
        model: &GlobalModel,
    ) -> Result<(), CheckpointError> {
        let path = self.junction_path(junction);
        save_json(&path, model)?;
        tracing::debug!("Saved junction {} weights to {}", junction, path.display());
        Ok(())
    }

    pub fn load_junction(&self, junction: &JunctionId) -> Result<Option<GlobalModel>, CheckpointError> {
        load_json(&self.junction_path(junction))
    }
}

fn save_json(path: &Path, model: &GlobalModel) -> Result<(), CheckpointError> {
    let bytes = serde_json::to_vec(model).map_err(|e| CheckpointError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    write_with_retry(path, &bytes, write_atomic)
}

fn load_json(path: &Path) -> Result<Option<GlobalModel>, CheckpointError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let model: GlobalModel =
        serde_json::from_str(&text).map_err(|e| CheckpointError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    model
        .weights
        .validate()
        .map_err(|e| CheckpointError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(Some(model))
}

/// One retry; the second failure is returned
fn write_with_retry<F>(path: &Path, bytes: &[u8], mut write: F) -> Result<(), CheckpointError>
where
    F: FnMut(&Path, &[u8]) -> io::Result<()>,
{
    if let Err(first) = write(path, bytes) {
        tracing::warn!("Checkpoint write to {} failed, retrying: {}", path.display(), first);
        write(path, bytes).map_err(|source| CheckpointError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Write to a sibling temp file, then rename over the target
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::ParamTensor;

    fn model(round: u64) -> GlobalModel {
        GlobalModel::new(
            round,
            PolicyConfig::new(3, 2).with_hidden_sizes(vec![4]),
            WeightBlob::new(vec![ParamTensor::new(vec![2], vec![0.5, -1.5])]),
        )
    }

    #[test]
    fn test_save_then_load_global() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("ckpt"));
        assert!(store.load_global().unwrap().is_none());

        store.save_global(&model(7)).unwrap();
        let loaded = store.load_global().unwrap().unwrap();
        assert_eq!(loaded.round, 7);
        assert_eq!(loaded.weights, model(7).weights);
        assert!(!loaded.saved_at.is_empty());
        assert!(!dir.path().join("ckpt/global_model.json.tmp").exists());
    }

    #[test]
    fn test_overwrite_keeps_latest_round() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save_global(&model(1)).unwrap();
        store.save_global(&model(2)).unwrap();
        assert_eq!(store.load_global().unwrap().unwrap().round, 2);
    }

    #[test]
    fn test_junction_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let junction = JunctionId::from("J7");
        store.save_junction(&junction, &model(3)).unwrap();
        assert!(dir.path().join("junctions/J7.json").exists());
        assert_eq!(store.load_junction(&junction).unwrap().unwrap().round, 3);
        assert!(store.load_junction(&JunctionId::from("J8")).unwrap().is_none());
    }

    #[test]
    fn test_malformed_checkpoint_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        fs::write(store.global_path(), "{ not json").unwrap();
        assert!(matches!(
            store.load_global(),
            Err(CheckpointError::Malformed { .. })
        ));
    }

    #[test]
    fn test_single_failure_is_retried() {
        let mut calls = 0;
        let result = write_with_retry(Path::new("x.json"), b"{}", |_, _| {
            calls += 1;
            if calls == 1 {
                Err(io::Error::other("disk hiccup"))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_second_failure_is_fatal() {
        let mut calls = 0;
        let result = write_with_retry(Path::new("x.json"), b"{}", |_, _| {
            calls += 1;
            Err(io::Error::other("disk full"))
        });
        assert_eq!(calls, 2);
        assert!(matches!(result, Err(CheckpointError::Write { .. })));
    }

    #[test]
    fn test_resume_picks_up_saved_round() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let saved = model(4);
        let fresh = WeightBlob::new(vec![ParamTensor::new(vec![2], vec![0.0, 0.0])]);

        let started = store
            .resume_or_init(saved.policy.clone(), fresh.clone(), true)
            .unwrap();
        assert_eq!(started.round, 0);

        store.save_global(&saved).unwrap();
        let resumed = store
            .resume_or_init(saved.policy.clone(), fresh.clone(), true)
            .unwrap();
        assert_eq!(resumed.round, 4);
        assert_eq!(resumed.weights, saved.weights);

        let restarted = store.resume_or_init(saved.policy.clone(), fresh, false).unwrap();
        assert_eq!(restarted.round, 0);
    }

    #[test]
    fn test_incompatible_checkpoint_detected() {
        let saved = model(1);
        let other = PolicyConfig::new(5, 2).with_hidden_sizes(vec![4]);
        assert!(matches!(
            saved.check_compatible(&other, &saved.weights),
            Err(CheckpointError::ShapeMismatch(_))
        ));
        assert!(saved.check_compatible(&saved.policy, &saved.weights).is_ok());
    }
}
