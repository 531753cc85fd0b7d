use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dub_core::hashing::sha256_file;

pub const CHECKPOINT_FILE: &str = ".checkpoint.json";
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRecord {
    pub path: String,
    pub sha256: String,
    pub size: u64,
    pub mtime: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StageEntry {
    pub done: bool,
    #[serde(default)]
    pub done_at: f64,
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactRecord>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// Per-job record of completed stages and their verified artifacts. Owned
/// value tree; the file lives at `{work_dir}/.checkpoint.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub job_id: String,
    #[serde(default)]
    pub last_stage: String,
    #[serde(default)]
    pub updated_at: f64,
    #[serde(default)]
    pub stages: BTreeMap<String, StageEntry>,
}

impl Checkpoint {
    pub fn new(job_id: &str) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            job_id: job_id.to_string(),
            last_stage: String::new(),
            updated_at: 0.0,
            stages: BTreeMap::new(),
        }
    }
}

pub fn checkpoint_path(work_dir: &Path) -> PathBuf {
    work_dir.join(CHECKPOINT_FILE)
}

/// Load a checkpoint, tolerating absence and damage: any unreadable file is
/// treated as "no checkpoint" so the job simply re-runs from the start.
pub fn read_checkpoint(path: &Path, job_id: &str) -> Option<Checkpoint> {
    if !path.exists() {
        return None;
    }
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "checkpoint read failed");
            return None;
        }
    };
    let ckpt: Checkpoint = match serde_json::from_str(&raw) {
        Ok(ckpt) => ckpt,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "checkpoint parse failed");
            return None;
        }
    };
    // Tolerate a missing job id in older files, but flag a mismatch.
    if !ckpt.job_id.is_empty() && ckpt.job_id != job_id {
        tracing::warn!(
            expected = job_id,
            found = %ckpt.job_id,
            "checkpoint job id mismatch"
        );
    }
    Some(ckpt)
}

fn artifacts_valid(artifacts: &BTreeMap<String, ArtifactRecord>) -> bool {
    if artifacts.is_empty() {
        return false;
    }
    for record in artifacts.values() {
        let path = Path::new(&record.path);
        if !path.is_file() {
            return false;
        }
        if !record.sha256.is_empty() {
            match sha256_file(path) {
                Ok(actual) if actual == record.sha256 => {}
                _ => return false,
            }
        }
    }
    true
}

/// A stage counts as done only when marked done AND every recorded artifact
/// still exists with a matching hash; anything less re-runs the stage.
pub fn stage_is_done(ckpt: Option<&Checkpoint>, stage: &str) -> bool {
    let Some(ckpt) = ckpt else {
        return false;
    };
    let Some(entry) = ckpt.stages.get(stage) else {
        return false;
    };
    entry.done && artifacts_valid(&entry.artifacts)
}

fn artifact_record(path: &Path) -> Result<ArtifactRecord> {
    let meta = fs::metadata(path)
        .with_context(|| format!("stat artifact {}", path.display()))?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(ArtifactRecord {
        path: path.to_string_lossy().into_owned(),
        sha256: sha256_file(path)?,
        size: meta.len(),
        mtime,
    })
}

fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Record a completed stage with hashed artifacts and atomically replace the
/// checkpoint file (write temp + rename).
pub fn advance_stage(
    path: &Path,
    job_id: &str,
    stage: &str,
    artifacts: &[(&str, PathBuf)],
    meta: serde_json::Value,
) -> Result<Checkpoint> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create checkpoint dir {}", parent.display()))?;
    }

    let mut ckpt = read_checkpoint(path, job_id).unwrap_or_else(|| Checkpoint::new(job_id));
    ckpt.job_id = job_id.to_string();
    ckpt.last_stage = stage.to_string();
    ckpt.updated_at = now_epoch();

    let mut records = BTreeMap::new();
    for (key, artifact_path) in artifacts {
        if !artifact_path.exists() {
            continue;
        }
        records.insert((*key).to_string(), artifact_record(artifact_path)?);
    }
    ckpt.stages.insert(
        stage.to_string(),
        StageEntry {
            done: true,
            done_at: now_epoch(),
            artifacts: records,
            meta,
        },
    );

    let tmp = path.with_extension("tmp");
    let body = serde_json::to_string_pretty(&ckpt).context("serialize checkpoint")?;
    fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(ckpt)
}
