use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Result};

/// Reduce a series title to a stable directory-safe slug.
pub fn slugify(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_dash = true;
    for ch in title.chars() {
        let lowered = ch.to_ascii_lowercase();
        if lowered.is_ascii_alphanumeric() {
            out.push(lowered);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Validate a client-supplied filename: single path component, no hidden
/// files, no traversal.
pub fn validate_upload_filename(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("filename must not be empty");
    }
    if name.starts_with('.') {
        bail!("filename must not start with '.'");
    }
    if name.contains("..") {
        bail!("filename must not contain '..'");
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        bail!("filename must not contain path separators");
    }
    Ok(())
}

/// Join a client-supplied relative path under `root`, rejecting absolute
/// paths, `..` traversal, and (for existing files) symlink escapes.
///
/// The returned path may not exist yet; callers that serve existing files
/// should canonicalize afterwards via [`verify_resolved_under_root`].
pub fn resolve_under_root(root: &Path, rel: &str) -> Result<PathBuf> {
    if rel.contains('\0') {
        bail!("path contains NUL");
    }
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        bail!("absolute paths are not allowed");
    }
    let mut resolved = root.to_path_buf();
    for component in rel_path.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => bail!("path escapes the serving root"),
        }
    }
    Ok(resolved)
}

/// Canonicalize an existing path and require it to stay under `root`. This is
/// the symlink-escape check: a link pointing outside the root canonicalizes
/// outside it and is rejected.
pub fn verify_resolved_under_root(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let canonical_root = root
        .canonicalize()
        .map_err(|err| anyhow::anyhow!("serving root unavailable: {err}"))?;
    let canonical = candidate
        .canonicalize()
        .map_err(|err| anyhow::anyhow!("path unavailable: {err}"))?;
    if !canonical.starts_with(&canonical_root) {
        bail!("path escapes the serving root");
    }
    Ok(canonical)
}

/// Extract the owning job id from an artifact path containing a `job-<id>`
/// segment, e.g. `Library/show/season-01/episode-02/job-abc123/master.mkv`.
pub fn job_id_from_path(path: &Path) -> Option<String> {
    for component in path.components() {
        if let Component::Normal(part) = component {
            let part = part.to_string_lossy();
            if let Some(id) = part.strip_prefix("job-") {
                if !id.is_empty() {
                    return Some(id.to_string());
                }
            }
        }
    }
    None
}

/// Directory layout under the output/input roots. One instance is built at
/// startup and shared; every on-disk location flows through here so the
/// retention sweeps and the gateway agree on structure.
#[derive(Debug, Clone)]
pub struct Layout {
    pub output_root: PathBuf,
    pub input_root: PathBuf,
    pub log_root: PathBuf,
    pub state_dir: PathBuf,
}

impl Layout {
    pub fn new(output_root: PathBuf, input_root: PathBuf, log_root: PathBuf, state_dir: PathBuf) -> Self {
        Self {
            output_root,
            input_root,
            log_root,
            state_dir,
        }
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.input_root.join("uploads")
    }

    /// Per-job output directory, keyed by the source file stem.
    pub fn job_output_dir(&self, stem: &str) -> PathBuf {
        self.output_root.join(stem)
    }

    pub fn job_work_dir(&self, stem: &str) -> PathBuf {
        self.job_output_dir(stem).join("work")
    }

    pub fn job_logs_dir(&self, stem: &str) -> PathBuf {
        self.job_output_dir(stem).join("logs")
    }

    /// Stable per-job audit location independent of the stem naming.
    pub fn job_audit_path(&self, job_id: &str) -> PathBuf {
        self.output_root
            .join("jobs")
            .join(job_id)
            .join("logs")
            .join("audit.jsonl")
    }

    pub fn library_episode_dir(
        &self,
        series_slug: &str,
        season_number: u32,
        episode_number: u32,
        job_id: &str,
    ) -> PathBuf {
        self.output_root
            .join("Library")
            .join(series_slug)
            .join(format!("season-{season_number:02}"))
            .join(format!("episode-{episode_number:02}"))
            .join(format!("job-{job_id}"))
    }
}
