use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::dub_core::domain::Job;
use crate::dub_core::paths::Layout;

pub const MANIFEST_VERSION: u32 = 1;

/// Library manifest. This module is the only producer; players and backup
/// tooling treat the manifest as the source of truth for an episode
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub job_id: String,
    pub created_at: String,
    pub status: String,
    pub mode: String,
    pub series_title: String,
    pub series_slug: String,
    pub season_number: u32,
    pub episode_number: u32,
    pub owner_user_id: String,
    pub visibility: String,
    pub paths: BTreeMap<String, String>,
    pub urls: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Published artifact locations for one episode.
#[derive(Debug, Clone)]
pub struct PublishedEpisode {
    pub dir: PathBuf,
    pub master: PathBuf,
    pub mobile: Option<PathBuf>,
    pub manifest: PathBuf,
}

fn copy_artifact(src: &Path, dst: &Path) -> Result<()> {
    // Hard links keep the library cheap when it shares a filesystem with the
    // job output; fall back to a copy across devices.
    if fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst)
        .map(|_| ())
        .with_context(|| format!("copy {} -> {}", src.display(), dst.display()))
}

fn file_url(layout: &Layout, path: &Path) -> Option<String> {
    path.strip_prefix(&layout.output_root)
        .ok()
        .map(|rel| format!("/files/{}", rel.to_string_lossy().replace('\\', "/")))
}

/// Publish a finished job into the library tree and write its manifest.
/// Requires a non-empty series slug and an existing master output.
pub fn publish_job(layout: &Layout, job: &Job) -> Result<PublishedEpisode> {
    if job.series_slug.is_empty() {
        bail!("job {} has no series slug", job.id);
    }
    let master_src = job
        .output_mkv
        .as_deref()
        .map(PathBuf::from)
        .filter(|p| p.exists())
        .with_context(|| format!("job {} has no master output to publish", job.id))?;

    let dir = layout.library_episode_dir(
        &job.series_slug,
        job.season_number,
        job.episode_number,
        &job.id,
    );
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    fs::create_dir_all(dir.join("logs")).context("create library logs dir")?;
    fs::create_dir_all(dir.join("qa")).context("create library qa dir")?;

    let master = dir.join("master.mkv");
    copy_artifact(&master_src, &master)?;

    let mobile_src = master_src.parent().map(|p| p.join("mobile.mp4"));
    let mobile = match mobile_src {
        Some(src) if src.exists() => {
            let dst = dir.join("mobile.mp4");
            copy_artifact(&src, &dst)?;
            Some(dst)
        }
        _ => None,
    };

    let mut paths = BTreeMap::new();
    paths.insert("master".to_string(), master.to_string_lossy().into_owned());
    if let Some(mobile) = &mobile {
        paths.insert("mobile".to_string(), mobile.to_string_lossy().into_owned());
    }

    let mut urls = BTreeMap::new();
    if let Some(url) = file_url(layout, &master) {
        urls.insert("master".to_string(), url);
    }
    if let Some(url) = mobile.as_deref().and_then(|p| file_url(layout, p)) {
        urls.insert("mobile".to_string(), url);
    }

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        job_id: job.id.clone(),
        created_at: Utc::now().to_rfc3339(),
        status: job.state.as_str().to_string(),
        mode: job.mode.as_str().to_string(),
        series_title: job.series_title.clone(),
        series_slug: job.series_slug.clone(),
        season_number: job.season_number,
        episode_number: job.episode_number,
        owner_user_id: job.owner_id.clone(),
        visibility: job.visibility.as_str().to_string(),
        paths,
        urls,
        extra: None,
    };

    let manifest_path = dir.join("manifest.json");
    let tmp = manifest_path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, &manifest_path).context("rename manifest into place")?;

    Ok(PublishedEpisode {
        dir,
        master,
        mobile,
        manifest: manifest_path,
    })
}

/// The URL map the `/api/jobs/{id}/files` endpoint serves: every known
/// output that currently exists, as `/files/…` URLs.
pub fn job_file_urls(layout: &Layout, job: &Job) -> BTreeMap<String, String> {
    let mut urls = BTreeMap::new();
    let mut add = |key: &str, path: Option<PathBuf>| {
        if let Some(path) = path.filter(|p| p.exists()) {
            if let Some(url) = file_url(layout, &path) {
                urls.insert(key.to_string(), url);
            }
        }
    };

    add("master", job.output_mkv.as_deref().map(PathBuf::from));
    add("subs", job.output_srt.as_deref().map(PathBuf::from));
    if let Some(output_dir) = job
        .output_mkv
        .as_deref()
        .map(Path::new)
        .and_then(Path::parent)
    {
        add("mobile", Some(output_dir.join("mobile.mp4")));
        add("audio", Some(output_dir.join("tts.wav")));
        add("dialogue", Some(output_dir.join("stems").join("dialogue.wav")));
        add("background", Some(output_dir.join("stems").join("background.wav")));
        add("hls", Some(output_dir.join("hls").join("index.m3u8")));
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dub_core::domain::{JobState, Visibility};

    fn layout(dir: &Path) -> Layout {
        Layout::new(
            dir.join("Output"),
            dir.join("Input"),
            dir.join("logs"),
            dir.join("Output").join("_state"),
        )
    }

    fn published_job(dir: &Path) -> Job {
        let output_dir = dir.join("Output").join("episode-01");
        fs::create_dir_all(&output_dir).unwrap();
        fs::write(output_dir.join("dub.mkv"), b"mkv-bytes").unwrap();
        fs::write(output_dir.join("mobile.mp4"), b"mp4-bytes").unwrap();

        let mut job = crate::dub_core::store::test_support::job("j1", "u1");
        job.state = JobState::Done;
        job.series_title = "Show A".to_string();
        job.series_slug = "show-a".to_string();
        job.season_number = 1;
        job.episode_number = 2;
        job.visibility = Visibility::Shared;
        job.output_mkv = Some(output_dir.join("dub.mkv").to_string_lossy().into_owned());
        job
    }

    #[test]
    fn publish_writes_manifest_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let job = published_job(dir.path());

        let published = publish_job(&layout, &job).unwrap();
        assert!(published.master.exists());
        assert!(published.mobile.as_deref().unwrap().exists());
        assert!(published
            .dir
            .ends_with("Library/show-a/season-01/episode-02/job-j1"));

        let manifest: Manifest =
            serde_json::from_str(&fs::read_to_string(&published.manifest).unwrap()).unwrap();
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert_eq!(manifest.job_id, "j1");
        assert_eq!(manifest.owner_user_id, "u1");
        assert_eq!(manifest.visibility, "shared");
        assert!(manifest.paths.contains_key("master"));
        assert!(manifest.urls["master"].starts_with("/files/Library/show-a/"));
    }

    #[test]
    fn publish_requires_slug_and_master() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());

        let mut no_slug = published_job(dir.path());
        no_slug.series_slug = String::new();
        assert!(publish_job(&layout, &no_slug).is_err());

        let mut no_master = published_job(dir.path());
        no_master.output_mkv = Some(dir.path().join("missing.mkv").to_string_lossy().into_owned());
        assert!(publish_job(&layout, &no_master).is_err());
    }

    #[test]
    fn file_urls_only_list_existing_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let job = published_job(dir.path());

        let urls = job_file_urls(&layout, &job);
        assert_eq!(urls["master"], "/files/episode-01/dub.mkv");
        assert_eq!(urls["mobile"], "/files/episode-01/mobile.mp4");
        assert!(!urls.contains_key("hls"));
        assert!(!urls.contains_key("subs"));
    }
}
