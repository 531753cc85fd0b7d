use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::dub_core::auth::{AuthService, RateLimiter};
use crate::dub_core::paths::Layout;
use crate::dub_core::settings::AppSettings;
use crate::dub_core::store::JobStore;
use crate::dub_core::storage_ledger;

/// What one retention sweep actually removed; logged and returned for tests.
#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    pub stale_uploads_deleted: u64,
    pub job_artifacts_deleted: u64,
    pub logs_deleted: u64,
    pub workdirs_pruned: u64,
}

fn age_of(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Best-effort zero overwrite before unlink, so a reclaimed upload does not
/// linger readable in unallocated blocks on simple filesystems.
fn scrub_and_remove(path: &Path) {
    if let Ok(meta) = fs::metadata(path) {
        if meta.is_file() {
            if let Ok(mut file) = OpenOptions::new().write(true).open(path) {
                let len = meta.len();
                let chunk = vec![0u8; 64 * 1024];
                let mut written = 0u64;
                let _ = file.seek(SeekFrom::Start(0));
                while written < len {
                    let n = chunk.len().min((len - written) as usize);
                    if file.write_all(&chunk[..n]).is_err() {
                        break;
                    }
                    written += n as u64;
                }
                let _ = file.sync_data();
            }
        }
    }
    let _ = fs::remove_file(path);
}

/// Delete a job's artifact tree, refusing anything that is not strictly
/// under the output root.
fn remove_tree_under_root(path: &Path, root: &Path) -> bool {
    let Ok(canonical_root) = root.canonicalize() else {
        return false;
    };
    let Ok(canonical) = path.canonicalize() else {
        return false;
    };
    if !canonical.starts_with(&canonical_root) || canonical == canonical_root {
        tracing::warn!(path = %path.display(), "refusing to delete path outside output root");
        return false;
    }
    fs::remove_dir_all(&canonical).is_ok()
}

/// One retention pass: stale incomplete uploads, expired job artifacts,
/// old logs, stale workdirs, then a ledger reconciliation and a prune of
/// fully-refilled rate-limit buckets.
pub fn sweep(
    settings: &AppSettings,
    layout: &Layout,
    store: &Arc<JobStore>,
    limiter: &RateLimiter,
) -> SweepReport {
    let mut report = SweepReport::default();
    let retention = &settings.retention;

    // Incomplete uploads past their TTL.
    let upload_ttl = Duration::from_secs(retention.upload_ttl_hours * 3600);
    if let Ok(uploads) = store.list_uploads() {
        for upload in uploads {
            if upload.completed {
                continue;
            }
            let age = chrono::Utc::now() - upload.updated_at;
            if age.to_std().map(|age| age > upload_ttl).unwrap_or(false) {
                scrub_and_remove(Path::new(&upload.part_path));
                let _ = store.delete_upload(&upload.id);
                report.stale_uploads_deleted += 1;
            }
        }
    }

    // Artifacts of long-idle jobs, unless pinned.
    let artifact_ttl = chrono::Duration::days(retention.job_artifact_days as i64);
    if let Ok(jobs) = store.list_all_jobs() {
        for job in jobs {
            if job.pinned() || job.work_dir.is_empty() {
                continue;
            }
            if chrono::Utc::now() - job.updated_at <= artifact_ttl {
                continue;
            }
            let work_dir = Path::new(&job.work_dir).to_path_buf();
            let output_dir = work_dir.parent().unwrap_or(&work_dir);
            if output_dir.exists() && remove_tree_under_root(output_dir, &layout.output_root) {
                report.job_artifacts_deleted += 1;
            }
        }
    }

    // Aged logs in the shared log root.
    let log_ttl = Duration::from_secs(retention.log_days * 86_400);
    if let Ok(entries) = fs::read_dir(&layout.log_root) {
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if age_of(&path).map(|age| age > log_ttl).unwrap_or(false)
                && fs::remove_file(&path).is_ok()
            {
                report.logs_deleted += 1;
            }
        }
    }

    // Stale work directories: Output/*/work older than the ceiling.
    let work_ttl = Duration::from_secs(retention.work_stale_max_hours * 3600);
    if let Ok(entries) = fs::read_dir(&layout.output_root) {
        for entry in entries.filter_map(Result::ok) {
            let work = entry.path().join("work");
            if !work.is_dir() {
                continue;
            }
            if age_of(&work).map(|age| age > work_ttl).unwrap_or(false)
                && remove_tree_under_root(&work, &layout.output_root)
            {
                report.workdirs_pruned += 1;
            }
        }
    }

    if let Err(err) = storage_ledger::reconcile(layout, store) {
        tracing::warn!(error = %err, "storage reconciliation failed");
    }
    limiter.prune();

    tracing::info!(
        stale_uploads = report.stale_uploads_deleted,
        artifacts = report.job_artifacts_deleted,
        logs = report.logs_deleted,
        workdirs = report.workdirs_pruned,
        "retention sweep finished"
    );
    report
}

/// Periodic sweeper thread; interval comes from settings.
pub fn spawn_sweeper(
    settings: Arc<AppSettings>,
    layout: Layout,
    store: Arc<JobStore>,
    auth: Arc<AuthService>,
) {
    let interval = Duration::from_secs(settings.retention.sweep_interval_s.max(60));
    let result = std::thread::Builder::new()
        .name("dubforge-retention".to_string())
        .spawn(move || loop {
            std::thread::sleep(interval);
            sweep(&settings, &layout, &store, &auth.limiter);
        });
    if let Err(err) = result {
        tracing::warn!(error = %err, "failed to spawn retention sweeper");
    }
}
