use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Operator,
    Editor,
    Admin,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "viewer" => Some(Role::Viewer),
            "operator" => Some(Role::Operator),
            "editor" => Some(Role::Editor),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Editor => "editor",
            Role::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    /// Present once the user has enrolled a TOTP authenticator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totp_secret: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Single-use rotating refresh token row. Rotation links records through
/// `replaced_by`; presenting a revoked token that has a successor is replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub jti: String,
    pub user_id: String,
    /// sha256 of the full presented token, hex-encoded.
    pub token_hash: String,
    pub expires_at: i64,
    pub created_at: i64,
    pub revoked: bool,
    pub replaced_by: Option<String>,
    pub device_id: Option<String>,
    pub last_ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    /// First 10 characters after the `dp_` marker; the lookup key.
    pub prefix: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub scopes: Vec<String>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRecord {
    pub token_hash: String,
    pub created_by: String,
    pub expires_at: i64,
    pub used_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
    Canceled,
    Paused,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Canceled)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "QUEUED" => Some(JobState::Queued),
            "RUNNING" => Some(JobState::Running),
            "DONE" => Some(JobState::Done),
            "FAILED" => Some(JobState::Failed),
            "CANCELED" => Some(JobState::Canceled),
            "PAUSED" => Some(JobState::Paused),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
            JobState::Canceled => "CANCELED",
            JobState::Paused => "PAUSED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    Low,
    Medium,
    High,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Low => "low",
            JobMode::Medium => "medium",
            JobMode::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low" => Some(JobMode::Low),
            "medium" => Some(JobMode::Medium),
            "high" => Some(JobMode::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePref {
    Auto,
    Cpu,
    Cuda,
}

impl DevicePref {
    pub fn as_str(&self) -> &'static str {
        match self {
            DevicePref::Auto => "auto",
            DevicePref::Cpu => "cpu",
            DevicePref::Cuda => "cuda",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "auto" => Some(DevicePref::Auto),
            "cpu" => Some(DevicePref::Cpu),
            "cuda" => Some(DevicePref::Cuda),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Shared,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Shared => "shared",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "private" => Some(Visibility::Private),
            "shared" => Some(Visibility::Shared),
            _ => None,
        }
    }
}

/// A user-submitted dubbing task.
///
/// `runtime` is a free-form map for per-run metadata (degraded reasons, pin
/// flags, resume hints) that must survive restarts without schema churn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub owner_id: String,
    pub video_path: String,
    pub duration_s: f64,
    pub mode: JobMode,
    pub device: DevicePref,
    pub src_lang: String,
    pub tgt_lang: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: JobState,
    /// Overall progress in [0, 1]; monotonically non-decreasing within a run.
    pub progress: f64,
    pub message: String,
    pub output_mkv: Option<String>,
    pub output_srt: Option<String>,
    pub work_dir: String,
    pub log_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub series_title: String,
    pub series_slug: String,
    pub season_number: u32,
    pub episode_number: u32,
    pub visibility: Visibility,
    #[serde(default)]
    pub runtime: BTreeMap<String, serde_json::Value>,
}

impl Job {
    pub fn degraded_reasons(&self) -> Vec<String> {
        self.runtime
            .get("degraded_reasons")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pinned(&self) -> bool {
        self.runtime
            .get("pinned")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Resumable upload bookkeeping. `received` maps chunk index to the byte
/// count stored for that chunk; `part_path` accumulates appends until
/// completion atomically renames it to `final_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub id: String,
    pub owner_id: String,
    pub filename: String,
    pub total_bytes: u64,
    pub chunk_bytes: u64,
    pub received: BTreeMap<u32, u64>,
    pub received_bytes: u64,
    pub completed: bool,
    pub part_path: String,
    pub final_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Upload {
    pub fn total_chunks(&self) -> u32 {
        if self.total_bytes == 0 || self.chunk_bytes == 0 {
            return 0;
        }
        self.total_bytes.div_ceil(self.chunk_bytes) as u32
    }

    pub fn next_expected_chunk(&self) -> u32 {
        self.received.keys().next_back().map(|i| i + 1).unwrap_or(0)
    }
}

/// Library index row, materialized from jobs with a non-empty series slug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub job_id: String,
    pub owner_user_id: String,
    pub series_title: String,
    pub series_slug: String,
    pub season_number: u32,
    pub episode_number: u32,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ReviewStatus::Pending),
            "approved" => Some(ReviewStatus::Approved),
            "rejected" => Some(ReviewStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaReview {
    pub job_id: String,
    pub segment_id: String,
    pub status: ReviewStatus,
    pub note: Option<String>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

/// Persistent voiceprint belonging to a series. Versions are append-only so
/// older dubs keep resolving the exact voice they were mixed with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub id: String,
    pub series_slug: String,
    pub character_name: String,
    pub version: u32,
    pub ref_audio_path: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Continue-watching row, bumped on every job open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewRecord {
    pub user_id: String,
    pub series_slug: String,
    pub season_number: u32,
    pub episode_number: u32,
    pub job_id: String,
    pub last_opened_at: DateTime<Utc>,
}

/// Resource class the scheduler counts a running job against, derived from
/// mode and resolved device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Transcribe,
    Tts,
    Gpu,
}

/// Queue entry owned by the admission scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: String,
    pub owner_id: String,
    pub mode: JobMode,
    pub device: DevicePref,
    /// Base priority in [0, 1000]; higher runs first, FIFO within a tie.
    pub priority: u32,
    pub created_at: DateTime<Utc>,
}

pub fn clamp_priority(priority: u32) -> u32 {
    priority.min(1000)
}
