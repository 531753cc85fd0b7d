use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};

use crate::dub_core::domain::{
    DevicePref, Job, JobMode, JobState, LibraryEntry, QaReview, ReviewStatus, Upload, ViewRecord,
    Visibility, VoiceProfile,
};

use super::{Db, StoreError, StoreResult};

/// List filter for the jobs surface. Visibility is enforced here so no
/// handler can forget it: `viewer_id = None` means an admin caller.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub q: Option<String>,
    pub mode: Option<JobMode>,
    pub series_slug: Option<String>,
    pub viewer_id: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LibrarySeries {
    pub series_slug: String,
    pub series_title: String,
    pub episode_count: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LibraryEpisode {
    pub job_id: String,
    pub season_number: u32,
    pub episode_number: u32,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

/// One accounted object in the storage ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub object_id: String,
    pub user_id: String,
    pub bytes: u64,
}

/// Typed operations over `jobs.db`: jobs, uploads, library index, views,
/// QA reviews, voice profiles, storage ledger.
pub struct JobStore {
    db: Arc<Db>,
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn job_from_row(row: &Row<'_>) -> Result<Job, rusqlite::Error> {
    let state_raw: String = row.get("state")?;
    let mode_raw: String = row.get("mode")?;
    let device_raw: String = row.get("device")?;
    let visibility_raw: String = row.get("visibility")?;
    let runtime_raw: String = row.get("runtime")?;
    let created_raw: String = row.get("created_at")?;
    let updated_raw: String = row.get("updated_at")?;
    Ok(Job {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        video_path: row.get("video_path")?,
        duration_s: row.get("duration_s")?,
        mode: JobMode::parse(&mode_raw).unwrap_or(JobMode::Medium),
        device: DevicePref::parse(&device_raw).unwrap_or(DevicePref::Auto),
        src_lang: row.get("src_lang")?,
        tgt_lang: row.get("tgt_lang")?,
        created_at: parse_ts(&created_raw),
        updated_at: parse_ts(&updated_raw),
        state: JobState::parse(&state_raw).unwrap_or(JobState::Failed),
        progress: row.get("progress")?,
        message: row.get("message")?,
        output_mkv: row.get("output_mkv")?,
        output_srt: row.get("output_srt")?,
        work_dir: row.get("work_dir")?,
        log_path: row.get("log_path")?,
        error: row.get("error")?,
        series_title: row.get("series_title")?,
        series_slug: row.get("series_slug")?,
        season_number: row.get::<_, i64>("season_number")? as u32,
        episode_number: row.get::<_, i64>("episode_number")? as u32,
        visibility: Visibility::parse(&visibility_raw).unwrap_or(Visibility::Private),
        runtime: serde_json::from_str(&runtime_raw).unwrap_or_default(),
    })
}

fn upload_from_row(row: &Row<'_>) -> Result<Upload, rusqlite::Error> {
    let received_raw: String = row.get("received")?;
    let created_raw: String = row.get("created_at")?;
    let updated_raw: String = row.get("updated_at")?;
    let received: BTreeMap<u32, u64> = serde_json::from_str(&received_raw).unwrap_or_default();
    Ok(Upload {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        filename: row.get("filename")?,
        total_bytes: row.get::<_, i64>("total_bytes")? as u64,
        chunk_bytes: row.get::<_, i64>("chunk_bytes")? as u64,
        received,
        received_bytes: row.get::<_, i64>("received_bytes")? as u64,
        completed: row.get::<_, i64>("completed")? != 0,
        part_path: row.get("part_path")?,
        final_path: row.get("final_path")?,
        created_at: parse_ts(&created_raw),
        updated_at: parse_ts(&updated_raw),
    })
}

/// Keep the library index row in lockstep with the job: present iff the job
/// carries a non-empty series slug.
fn sync_library_index(tx: &Transaction<'_>, job: &Job) -> Result<(), rusqlite::Error> {
    if job.series_slug.is_empty() {
        tx.execute("DELETE FROM library_index WHERE job_id = ?1", params![job.id])?;
        return Ok(());
    }
    tx.execute(
        "INSERT INTO library_index
         (job_id, owner_user_id, series_title, series_slug, season_number, episode_number,
          visibility, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(job_id) DO UPDATE SET
            owner_user_id = excluded.owner_user_id,
            series_title = excluded.series_title,
            series_slug = excluded.series_slug,
            season_number = excluded.season_number,
            episode_number = excluded.episode_number,
            visibility = excluded.visibility",
        params![
            job.id,
            job.owner_id,
            job.series_title,
            job.series_slug,
            job.season_number as i64,
            job.episode_number as i64,
            job.visibility.as_str(),
            job.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn write_job(tx: &Transaction<'_>, job: &Job) -> Result<(), rusqlite::Error> {
    let runtime = serde_json::to_string(&job.runtime).unwrap_or_else(|_| "{}".to_string());
    tx.execute(
        "INSERT INTO jobs
         (id, owner_id, video_path, duration_s, mode, device, src_lang, tgt_lang,
          created_at, updated_at, state, progress, message, output_mkv, output_srt,
          work_dir, log_path, error, series_title, series_slug, season_number,
          episode_number, visibility, runtime)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                 ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
         ON CONFLICT(id) DO UPDATE SET
            video_path = excluded.video_path,
            duration_s = excluded.duration_s,
            mode = excluded.mode,
            device = excluded.device,
            src_lang = excluded.src_lang,
            tgt_lang = excluded.tgt_lang,
            updated_at = excluded.updated_at,
            state = excluded.state,
            progress = excluded.progress,
            message = excluded.message,
            output_mkv = excluded.output_mkv,
            output_srt = excluded.output_srt,
            work_dir = excluded.work_dir,
            log_path = excluded.log_path,
            error = excluded.error,
            series_title = excluded.series_title,
            series_slug = excluded.series_slug,
            season_number = excluded.season_number,
            episode_number = excluded.episode_number,
            visibility = excluded.visibility,
            runtime = excluded.runtime",
        params![
            job.id,
            job.owner_id,
            job.video_path,
            job.duration_s,
            job.mode.as_str(),
            job.device.as_str(),
            job.src_lang,
            job.tgt_lang,
            job.created_at.to_rfc3339(),
            job.updated_at.to_rfc3339(),
            job.state.as_str(),
            job.progress,
            job.message,
            job.output_mkv,
            job.output_srt,
            job.work_dir,
            job.log_path,
            job.error,
            job.series_title,
            job.series_slug,
            job.season_number as i64,
            job.episode_number as i64,
            job.visibility.as_str(),
            runtime,
        ],
    )?;
    sync_library_index(tx, job)
}

impl JobStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Arc::new(Db::open(path)?);
        let store = Self { db };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    video_path TEXT NOT NULL,
                    duration_s REAL NOT NULL DEFAULT 0,
                    mode TEXT NOT NULL,
                    device TEXT NOT NULL,
                    src_lang TEXT NOT NULL,
                    tgt_lang TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    state TEXT NOT NULL,
                    progress REAL NOT NULL DEFAULT 0,
                    message TEXT NOT NULL DEFAULT '',
                    output_mkv TEXT,
                    output_srt TEXT,
                    work_dir TEXT NOT NULL DEFAULT '',
                    log_path TEXT NOT NULL DEFAULT '',
                    error TEXT,
                    series_title TEXT NOT NULL DEFAULT '',
                    series_slug TEXT NOT NULL DEFAULT '',
                    season_number INTEGER NOT NULL DEFAULT 0,
                    episode_number INTEGER NOT NULL DEFAULT 0,
                    visibility TEXT NOT NULL DEFAULT 'private',
                    runtime TEXT NOT NULL DEFAULT '{}'
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
                CREATE TABLE IF NOT EXISTS uploads (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    filename TEXT NOT NULL,
                    total_bytes INTEGER NOT NULL,
                    chunk_bytes INTEGER NOT NULL,
                    received TEXT NOT NULL DEFAULT '{}',
                    received_bytes INTEGER NOT NULL DEFAULT 0,
                    completed INTEGER NOT NULL DEFAULT 0,
                    part_path TEXT NOT NULL,
                    final_path TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS library_index (
                    job_id TEXT PRIMARY KEY,
                    owner_user_id TEXT NOT NULL,
                    series_title TEXT NOT NULL,
                    series_slug TEXT NOT NULL,
                    season_number INTEGER NOT NULL,
                    episode_number INTEGER NOT NULL,
                    visibility TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_library_slug ON library_index(series_slug);
                CREATE TABLE IF NOT EXISTS views (
                    user_id TEXT NOT NULL,
                    series_slug TEXT NOT NULL,
                    season_number INTEGER NOT NULL,
                    episode_number INTEGER NOT NULL,
                    job_id TEXT NOT NULL,
                    last_opened_at TEXT NOT NULL,
                    PRIMARY KEY (user_id, series_slug, season_number, episode_number)
                );
                CREATE TABLE IF NOT EXISTS qa_reviews (
                    job_id TEXT NOT NULL,
                    segment_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    note TEXT,
                    updated_by TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (job_id, segment_id)
                );
                CREATE TABLE IF NOT EXISTS voice_profiles (
                    id TEXT PRIMARY KEY,
                    series_slug TEXT NOT NULL,
                    character_name TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    ref_audio_path TEXT NOT NULL,
                    created_by TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE (series_slug, character_name, version)
                );
                CREATE TABLE IF NOT EXISTS storage_objects (
                    object_id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    bytes INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_storage_user ON storage_objects(user_id);
                "#,
            )?;
            Ok(())
        })
    }

    // ---- jobs --------------------------------------------------------------

    pub fn put_job(&self, job: &Job) -> StoreResult<()> {
        self.db.with_tx(|tx| write_job(tx, job))
    }

    pub fn get_job(&self, id: &str) -> StoreResult<Option<Job>> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], job_from_row)
                .optional()
        })
    }

    /// Read-modify-write under the writer lock. The mutator sees the current
    /// row; `owner_id` and `created_at` are pinned, `updated_at` is bumped.
    pub fn update_job(&self, id: &str, mutate: impl FnOnce(&mut Job)) -> StoreResult<Job> {
        self.db.with_tx(|tx| {
            let mut job = tx
                .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], job_from_row)
                .optional()?
                .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            let owner = job.owner_id.clone();
            let created = job.created_at;
            mutate(&mut job);
            job.owner_id = owner;
            job.created_at = created;
            job.updated_at = Utc::now();
            write_job(tx, &job)?;
            Ok(job)
        })
        .map_err(|err| match err {
            StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows) => StoreError::NotFound,
            other => other,
        })
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        self.db.with_conn(|conn| {
            let mut sql = String::from("SELECT * FROM jobs WHERE 1=1");
            let mut args: Vec<String> = Vec::new();
            if let Some(state) = filter.state {
                sql.push_str(" AND state = ?");
                args.push(state.as_str().to_string());
            }
            if let Some(mode) = filter.mode {
                sql.push_str(" AND mode = ?");
                args.push(mode.as_str().to_string());
            }
            if let Some(slug) = &filter.series_slug {
                sql.push_str(" AND series_slug = ?");
                args.push(slug.clone());
            }
            if let Some(q) = &filter.q {
                sql.push_str(" AND (video_path LIKE ? OR series_title LIKE ? OR message LIKE ?)");
                let pattern = format!("%{q}%");
                args.push(pattern.clone());
                args.push(pattern.clone());
                args.push(pattern);
            }
            if let Some(viewer) = &filter.viewer_id {
                sql.push_str(" AND (owner_id = ? OR visibility = 'shared')");
                args.push(viewer.clone());
            }
            // Limit and offset are trusted integers, not user strings.
            sql.push_str(&format!(
                " ORDER BY created_at DESC LIMIT {} OFFSET {}",
                limit, filter.offset
            ));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), job_from_row)?;
            rows.collect()
        })
    }

    /// Recovery scan: every job regardless of state or visibility.
    pub fn list_all_jobs(&self) -> StoreResult<Vec<Job>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at")?;
            let rows = stmt.query_map([], job_from_row)?;
            rows.collect()
        })
    }

    pub fn delete_job(&self, id: &str) -> StoreResult<()> {
        self.db.with_tx(|tx| {
            tx.execute("DELETE FROM library_index WHERE job_id = ?1", params![id])?;
            tx.execute("DELETE FROM qa_reviews WHERE job_id = ?1", params![id])?;
            tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    pub fn count_jobs_for_user_in_states(
        &self,
        owner_id: &str,
        states: &[JobState],
    ) -> StoreResult<u64> {
        let names: Vec<String> = states.iter().map(|s| format!("'{}'", s.as_str())).collect();
        let sql = format!(
            "SELECT COUNT(*) FROM jobs WHERE owner_id = ?1 AND state IN ({})",
            names.join(",")
        );
        self.db.with_conn(|conn| {
            conn.query_row(&sql, params![owner_id], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        })
    }

    pub fn count_jobs_created_since(&self, owner_id: &str, since: DateTime<Utc>) -> StoreResult<u64> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE owner_id = ?1 AND created_at >= ?2",
                params![owner_id, since.to_rfc3339()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
        })
    }

    // ---- uploads -----------------------------------------------------------

    pub fn put_upload(&self, upload: &Upload) -> StoreResult<()> {
        let received =
            serde_json::to_string(&upload.received).unwrap_or_else(|_| "{}".to_string());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO uploads
                 (id, owner_id, filename, total_bytes, chunk_bytes, received, received_bytes,
                  completed, part_path, final_path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                    received = excluded.received,
                    received_bytes = excluded.received_bytes,
                    completed = excluded.completed,
                    part_path = excluded.part_path,
                    final_path = excluded.final_path,
                    updated_at = excluded.updated_at",
                params![
                    upload.id,
                    upload.owner_id,
                    upload.filename,
                    upload.total_bytes as i64,
                    upload.chunk_bytes as i64,
                    received,
                    upload.received_bytes as i64,
                    upload.completed as i64,
                    upload.part_path,
                    upload.final_path,
                    upload.created_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_upload(&self, id: &str) -> StoreResult<Option<Upload>> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT * FROM uploads WHERE id = ?1", params![id], upload_from_row)
                .optional()
        })
    }

    pub fn list_uploads(&self) -> StoreResult<Vec<Upload>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM uploads ORDER BY created_at")?;
            let rows = stmt.query_map([], upload_from_row)?;
            rows.collect()
        })
    }

    pub fn delete_upload(&self, id: &str) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM uploads WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    // ---- library -----------------------------------------------------------

    fn visibility_clause(viewer_id: &Option<String>) -> (&'static str, Vec<String>) {
        match viewer_id {
            None => ("1=1", Vec::new()),
            Some(viewer) => (
                "(owner_user_id = ? OR visibility = 'shared')",
                vec![viewer.clone()],
            ),
        }
    }

    pub fn list_series(&self, viewer_id: Option<String>) -> StoreResult<Vec<LibrarySeries>> {
        let (clause, args) = Self::visibility_clause(&viewer_id);
        let sql = format!(
            "SELECT series_slug, MAX(series_title) AS series_title, COUNT(*) AS n
             FROM library_index WHERE {clause}
             GROUP BY series_slug ORDER BY series_slug"
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok(LibrarySeries {
                    series_slug: row.get(0)?,
                    series_title: row.get(1)?,
                    episode_count: row.get::<_, i64>(2)? as u32,
                })
            })?;
            rows.collect()
        })
    }

    /// Whether any episode of the series is visible to the viewer at all;
    /// used to distinguish 403 from an empty season list.
    pub fn series_visible(&self, slug: &str, viewer_id: Option<String>) -> StoreResult<bool> {
        let (clause, mut args) = Self::visibility_clause(&viewer_id);
        args.insert(0, slug.to_string());
        let sql =
            format!("SELECT COUNT(*) FROM library_index WHERE series_slug = ? AND {clause}");
        self.db.with_conn(|conn| {
            conn.query_row(&sql, rusqlite::params_from_iter(args.iter()), |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n > 0)
        })
    }

    pub fn series_exists(&self, slug: &str) -> StoreResult<bool> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM library_index WHERE series_slug = ?1",
                params![slug],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)
        })
    }

    pub fn list_seasons(&self, slug: &str, viewer_id: Option<String>) -> StoreResult<Vec<u32>> {
        let (clause, mut args) = Self::visibility_clause(&viewer_id);
        args.insert(0, slug.to_string());
        let sql = format!(
            "SELECT DISTINCT season_number FROM library_index
             WHERE series_slug = ? AND {clause} ORDER BY season_number"
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
                row.get::<_, i64>(0).map(|n| n as u32)
            })?;
            rows.collect()
        })
    }

    pub fn list_episodes(
        &self,
        slug: &str,
        season: u32,
        viewer_id: Option<String>,
    ) -> StoreResult<Vec<LibraryEpisode>> {
        let (clause, mut args) = Self::visibility_clause(&viewer_id);
        args.insert(0, slug.to_string());
        args.insert(1, season.to_string());
        let sql = format!(
            "SELECT job_id, season_number, episode_number, visibility, created_at
             FROM library_index
             WHERE series_slug = ? AND season_number = ? AND {clause}
             ORDER BY episode_number"
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
                let visibility_raw: String = row.get(3)?;
                let created_raw: String = row.get(4)?;
                Ok(LibraryEpisode {
                    job_id: row.get(0)?,
                    season_number: row.get::<_, i64>(1)? as u32,
                    episode_number: row.get::<_, i64>(2)? as u32,
                    visibility: Visibility::parse(&visibility_raw).unwrap_or(Visibility::Private),
                    created_at: parse_ts(&created_raw),
                })
            })?;
            rows.collect()
        })
    }

    pub fn search_library(
        &self,
        q: &str,
        viewer_id: Option<String>,
        limit: u32,
    ) -> StoreResult<Vec<LibraryEntry>> {
        let (clause, mut args) = Self::visibility_clause(&viewer_id);
        let pattern = format!("%{q}%");
        args.insert(0, pattern.clone());
        args.insert(1, pattern);
        let sql = format!(
            "SELECT * FROM library_index
             WHERE (series_title LIKE ? OR series_slug LIKE ?) AND {clause}
             ORDER BY created_at DESC LIMIT {}",
            limit.max(1)
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
                let visibility_raw: String = row.get("visibility")?;
                let created_raw: String = row.get("created_at")?;
                Ok(LibraryEntry {
                    job_id: row.get("job_id")?,
                    owner_user_id: row.get("owner_user_id")?,
                    series_title: row.get("series_title")?,
                    series_slug: row.get("series_slug")?,
                    season_number: row.get::<_, i64>("season_number")? as u32,
                    episode_number: row.get::<_, i64>("episode_number")? as u32,
                    visibility: Visibility::parse(&visibility_raw).unwrap_or(Visibility::Private),
                    created_at: parse_ts(&created_raw),
                })
            })?;
            rows.collect()
        })
    }

    // ---- continue watching -------------------------------------------------

    pub fn record_view(&self, view: &ViewRecord) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO views
                 (user_id, series_slug, season_number, episode_number, job_id, last_opened_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id, series_slug, season_number, episode_number)
                 DO UPDATE SET job_id = excluded.job_id,
                               last_opened_at = excluded.last_opened_at",
                params![
                    view.user_id,
                    view.series_slug,
                    view.season_number as i64,
                    view.episode_number as i64,
                    view.job_id,
                    view.last_opened_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn continue_watching(&self, user_id: &str, limit: u32) -> StoreResult<Vec<ViewRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, series_slug, season_number, episode_number, job_id,
                        last_opened_at
                 FROM views WHERE user_id = ?1
                 ORDER BY last_opened_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user_id, limit.max(1) as i64], |row| {
                let opened_raw: String = row.get(5)?;
                Ok(ViewRecord {
                    user_id: row.get(0)?,
                    series_slug: row.get(1)?,
                    season_number: row.get::<_, i64>(2)? as u32,
                    episode_number: row.get::<_, i64>(3)? as u32,
                    job_id: row.get(4)?,
                    last_opened_at: parse_ts(&opened_raw),
                })
            })?;
            rows.collect()
        })
    }

    // ---- QA reviews --------------------------------------------------------

    pub fn upsert_qa_review(&self, review: &QaReview) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO qa_reviews (job_id, segment_id, status, note, updated_by, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(job_id, segment_id) DO UPDATE SET
                    status = excluded.status,
                    note = excluded.note,
                    updated_by = excluded.updated_by,
                    updated_at = excluded.updated_at",
                params![
                    review.job_id,
                    review.segment_id,
                    review.status.as_str(),
                    review.note,
                    review.updated_by,
                    review.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_qa_reviews(&self, job_id: &str) -> StoreResult<Vec<QaReview>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT job_id, segment_id, status, note, updated_by, updated_at
                 FROM qa_reviews WHERE job_id = ?1 ORDER BY segment_id",
            )?;
            let rows = stmt.query_map(params![job_id], |row| {
                let status_raw: String = row.get(2)?;
                let updated_raw: String = row.get(5)?;
                Ok(QaReview {
                    job_id: row.get(0)?,
                    segment_id: row.get(1)?,
                    status: ReviewStatus::parse(&status_raw).unwrap_or(ReviewStatus::Pending),
                    note: row.get(3)?,
                    updated_by: row.get(4)?,
                    updated_at: parse_ts(&updated_raw),
                })
            })?;
            rows.collect()
        })
    }

    // ---- voice profiles ----------------------------------------------------

    /// Append a new version for the character; versions never mutate.
    pub fn append_voice_profile(
        &self,
        series_slug: &str,
        character_name: &str,
        ref_audio_path: &str,
        created_by: &str,
    ) -> StoreResult<VoiceProfile> {
        self.db.with_tx(|tx| {
            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM voice_profiles
                 WHERE series_slug = ?1 AND character_name = ?2",
                params![series_slug, character_name],
                |row| row.get(0),
            )?;
            let profile = VoiceProfile {
                id: uuid::Uuid::new_v4().to_string(),
                series_slug: series_slug.to_string(),
                character_name: character_name.to_string(),
                version: next as u32,
                ref_audio_path: ref_audio_path.to_string(),
                created_by: created_by.to_string(),
                created_at: Utc::now(),
            };
            tx.execute(
                "INSERT INTO voice_profiles
                 (id, series_slug, character_name, version, ref_audio_path, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    profile.id,
                    profile.series_slug,
                    profile.character_name,
                    profile.version as i64,
                    profile.ref_audio_path,
                    profile.created_by,
                    profile.created_at.to_rfc3339(),
                ],
            )?;
            Ok(profile)
        })
    }

    pub fn list_voice_profiles(&self, series_slug: &str) -> StoreResult<Vec<VoiceProfile>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, series_slug, character_name, version, ref_audio_path, created_by,
                        created_at
                 FROM voice_profiles WHERE series_slug = ?1
                 ORDER BY character_name, version",
            )?;
            let rows = stmt.query_map(params![series_slug], |row| {
                let created_raw: String = row.get(6)?;
                Ok(VoiceProfile {
                    id: row.get(0)?,
                    series_slug: row.get(1)?,
                    character_name: row.get(2)?,
                    version: row.get::<_, i64>(3)? as u32,
                    ref_audio_path: row.get(4)?,
                    created_by: row.get(5)?,
                    created_at: parse_ts(&created_raw),
                })
            })?;
            rows.collect()
        })
    }

    // ---- storage ledger ----------------------------------------------------

    /// Atomic reconciliation: the new entry set replaces the old one in a
    /// single transaction so readers never observe a half-applied ledger.
    pub fn replace_storage_accounting(&self, entries: &[StorageEntry]) -> StoreResult<()> {
        self.db.with_tx(|tx| {
            tx.execute("DELETE FROM storage_objects", [])?;
            for entry in entries {
                tx.execute(
                    "INSERT INTO storage_objects (object_id, user_id, bytes) VALUES (?1, ?2, ?3)",
                    params![entry.object_id, entry.user_id, entry.bytes as i64],
                )?;
            }
            Ok(())
        })
    }

    pub fn storage_bytes_for_user(&self, user_id: &str) -> StoreResult<u64> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(bytes), 0) FROM storage_objects WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n.max(0) as u64)
        })
    }
}
