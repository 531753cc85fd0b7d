use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default per-stage watchdog deadlines, in seconds.
pub const DEFAULT_WATCHDOG_AUDIO_S: u64 = 10 * 60;
pub const DEFAULT_WATCHDOG_DIARIZE_S: u64 = 20 * 60;
pub const DEFAULT_WATCHDOG_WHISPER_S: u64 = 45 * 60;
pub const DEFAULT_WATCHDOG_TRANSLATE_S: u64 = 10 * 60;
pub const DEFAULT_WATCHDOG_TTS_S: u64 = 30 * 60;
pub const DEFAULT_WATCHDOG_MIX_S: u64 = 20 * 60;
pub const DEFAULT_WATCHDOG_MUX_S: u64 = 20 * 60;
pub const DEFAULT_WATCHDOG_EXPORT_S: u64 = 20 * 60;

/// Default upload chunk size (8 MiB) and upload ceiling (2 GiB).
pub const DEFAULT_UPLOAD_CHUNK_BYTES: u64 = 8 * 1024 * 1024;
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Interval between supervisor polls of a running stage child, in
/// milliseconds. Cancellation and deadline checks happen at this cadence, so
/// it must stay at or below 250 ms.
pub const CHILD_POLL_INTERVAL_MS: u64 = 250;

/// Grace period between SIGTERM and SIGKILL when stopping a stage child.
pub const CHILD_KILL_GRACE_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    Auto,
    Local,
    Redis,
}

impl QueueMode {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "redis" => QueueMode::Redis,
            "local" => QueueMode::Local,
            _ => QueueMode::Auto,
        }
    }
}

/// Per-stage watchdog deadlines. Zero disables the deadline for that stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogSettings {
    pub audio_s: u64,
    pub diarize_s: u64,
    pub whisper_s: u64,
    pub translate_s: u64,
    pub tts_s: u64,
    pub mix_s: u64,
    pub mux_s: u64,
    pub export_s: u64,
    /// Optional address-space cap for stage children (MiB, Unix only).
    pub child_max_mem_mb: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            audio_s: DEFAULT_WATCHDOG_AUDIO_S,
            diarize_s: DEFAULT_WATCHDOG_DIARIZE_S,
            whisper_s: DEFAULT_WATCHDOG_WHISPER_S,
            translate_s: DEFAULT_WATCHDOG_TRANSLATE_S,
            tts_s: DEFAULT_WATCHDOG_TTS_S,
            mix_s: DEFAULT_WATCHDOG_MIX_S,
            mux_s: DEFAULT_WATCHDOG_MUX_S,
            export_s: DEFAULT_WATCHDOG_EXPORT_S,
            child_max_mem_mb: 0,
        }
    }
}

/// Scheduler concurrency ceilings. All limits are per-process; cluster-wide
/// caps are the distributed queue adapter's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencySettings {
    pub max_global: usize,
    pub max_per_user: usize,
    pub max_transcribe: usize,
    pub max_tts: usize,
    pub max_gpu: usize,
    /// Priority bonus accrued per full minute a job has waited in the queue.
    /// Zero leaves aging off; any positive value keeps admission monotonic in
    /// wait time.
    pub aging_bonus_per_minute: u32,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            max_global: 2,
            max_per_user: 2,
            max_transcribe: 1,
            max_tts: 1,
            max_gpu: 1,
            aging_bonus_per_minute: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    pub upload_ttl_hours: u64,
    pub job_artifact_days: u64,
    pub log_days: u64,
    pub work_stale_max_hours: u64,
    /// Sweep interval in seconds.
    pub sweep_interval_s: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            upload_ttl_hours: 48,
            job_artifact_days: 30,
            log_days: 14,
            work_stale_max_hours: 72,
            sweep_interval_s: 6 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    pub queue_prefix: String,
    pub lock_ttl_ms: u64,
    pub lock_refresh_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            queue_prefix: "dubforge".to_string(),
            lock_ttl_ms: 30_000,
            lock_refresh_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtfySettings {
    pub enabled: bool,
    pub base_url: String,
    pub topic: String,
}

impl Default for NtfySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://ntfy.sh".to_string(),
            topic: String::new(),
        }
    }
}

/// External tool locations. Every stage shells out through these so tests can
/// substitute mock binaries, mirroring how operators point the service at a
/// pinned ffmpeg build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    /// Empty means "not installed": the asr stage degrades to an empty
    /// transcript instead of failing the job.
    pub whisper_bin: String,
    pub vosk_bin: String,
    pub diarize_bin: String,
    pub translate_bin: String,
    pub tts_bin: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            whisper_bin: String::new(),
            vosk_bin: String::new(),
            diarize_bin: String::new(),
            translate_bin: String::new(),
            tts_bin: String::new(),
        }
    }
}

/// Global user quota defaults; per-user overrides live in the auth store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSettings {
    pub max_upload_bytes: u64,
    pub jobs_per_day: u64,
    pub max_concurrent_jobs: u64,
    pub max_storage_bytes: u64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            jobs_per_day: 24,
            max_concurrent_jobs: 2,
            max_storage_bytes: 50 * 1024 * 1024 * 1024,
        }
    }
}

/// Effective service configuration, resolved once at startup from the
/// environment and passed explicitly to every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    pub app_root: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub state_dir: PathBuf,

    pub bind_addr: String,

    pub jwt_secret: String,
    pub session_secret: String,
    pub csrf_secret: String,
    pub cookie_secure: bool,
    pub access_token_minutes: u64,
    pub refresh_token_days: u64,

    pub admin_username: String,
    pub admin_password: String,

    pub upload_chunk_bytes: u64,
    pub quotas: QuotaSettings,
    pub min_free_gb: u64,

    pub concurrency: ConcurrencySettings,
    pub watchdog: WatchdogSettings,
    pub retention: RetentionSettings,

    pub queue_mode: QueueMode,
    pub redis: RedisSettings,

    pub ntfy: NtfySettings,
    pub tools: ToolSettings,

    pub allow_egress: bool,
    pub allow_hf_egress: bool,
    pub offline_mode: bool,

    /// GPU saturation thresholds for the `auto` device fallback.
    pub gpu_util_max: f64,
    pub gpu_mem_max_ratio: f64,

    /// Rate-limit knob for chunk uploads (requests per second per upload).
    pub chunk_rate_per_s: u32,
}

impl Default for AppSettings {
    fn default() -> Self {
        let root = PathBuf::from(".");
        Self {
            input_dir: root.join("Input"),
            output_dir: root.join("Output"),
            log_dir: root.join("logs"),
            state_dir: root.join("Output").join("_state"),
            app_root: root,
            bind_addr: "127.0.0.1:8787".to_string(),
            jwt_secret: "dev-jwt-secret".to_string(),
            session_secret: "dev-session-secret".to_string(),
            csrf_secret: "dev-csrf-secret".to_string(),
            cookie_secure: false,
            access_token_minutes: 15,
            refresh_token_days: 14,
            admin_username: String::new(),
            admin_password: String::new(),
            upload_chunk_bytes: DEFAULT_UPLOAD_CHUNK_BYTES,
            quotas: QuotaSettings::default(),
            min_free_gb: 2,
            concurrency: ConcurrencySettings::default(),
            watchdog: WatchdogSettings::default(),
            retention: RetentionSettings::default(),
            queue_mode: QueueMode::Auto,
            redis: RedisSettings::default(),
            ntfy: NtfySettings::default(),
            tools: ToolSettings::default(),
            allow_egress: false,
            allow_hf_egress: false,
            offline_mode: false,
            gpu_util_max: 0.95,
            gpu_mem_max_ratio: 0.92,
            chunk_rate_per_s: 3,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().trim(),
        "1" | "true" | "TRUE" | "yes" | "on"
    )
}

impl AppSettings {
    /// Resolve settings from the environment. Unset variables fall back to
    /// development defaults; directory paths derive from `APP_ROOT` unless
    /// overridden individually.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let app_root = PathBuf::from(env_string("APP_ROOT", "."));
        let input_dir = env::var("INPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| app_root.join("Input"));
        let output_dir = env::var("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| app_root.join("Output"));
        let log_dir = env::var("LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| app_root.join("logs"));
        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| output_dir.join("_state"));

        Self {
            app_root,
            input_dir,
            output_dir,
            log_dir,
            state_dir,
            bind_addr: env_string("BIND_ADDR", &defaults.bind_addr),
            jwt_secret: env_string("JWT_SECRET", &defaults.jwt_secret),
            session_secret: env_string("SESSION_SECRET", &defaults.session_secret),
            csrf_secret: env_string("CSRF_SECRET", &defaults.csrf_secret),
            cookie_secure: env_flag("COOKIE_SECURE"),
            access_token_minutes: env_u64("ACCESS_TOKEN_MINUTES", defaults.access_token_minutes),
            refresh_token_days: env_u64("REFRESH_TOKEN_DAYS", defaults.refresh_token_days),
            admin_username: env_string("ADMIN_USERNAME", ""),
            admin_password: env_string("ADMIN_PASSWORD", ""),
            upload_chunk_bytes: env_u64("UPLOAD_CHUNK_BYTES", defaults.upload_chunk_bytes),
            quotas: QuotaSettings {
                max_upload_bytes: env_u64("MAX_UPLOAD_BYTES", defaults.quotas.max_upload_bytes),
                jobs_per_day: env_u64("JOBS_PER_DAY", defaults.quotas.jobs_per_day),
                max_concurrent_jobs: env_u64(
                    "MAX_CONCURRENT_JOBS",
                    defaults.quotas.max_concurrent_jobs,
                ),
                max_storage_bytes: env_u64("MAX_STORAGE_BYTES", defaults.quotas.max_storage_bytes),
            },
            min_free_gb: env_u64("MIN_FREE_GB", defaults.min_free_gb),
            concurrency: ConcurrencySettings {
                max_global: env_usize("MAX_CONCURRENCY_GLOBAL", defaults.concurrency.max_global)
                    .max(1),
                max_per_user: env_usize(
                    "MAX_CONCURRENCY_PER_USER",
                    defaults.concurrency.max_per_user,
                )
                .max(1),
                max_transcribe: env_usize(
                    "MAX_CONCURRENCY_TRANSCRIBE",
                    defaults.concurrency.max_transcribe,
                )
                .max(1),
                max_tts: env_usize("MAX_CONCURRENCY_TTS", defaults.concurrency.max_tts).max(1),
                max_gpu: env_usize("MAX_CONCURRENCY_GPU", defaults.concurrency.max_gpu).max(1),
                aging_bonus_per_minute: env_u64("SCHEDULER_AGING_BONUS_PER_MINUTE", 0) as u32,
            },
            watchdog: WatchdogSettings {
                audio_s: env_u64("WATCHDOG_AUDIO_S", DEFAULT_WATCHDOG_AUDIO_S),
                diarize_s: env_u64("WATCHDOG_DIARIZE_S", DEFAULT_WATCHDOG_DIARIZE_S),
                whisper_s: env_u64("WATCHDOG_WHISPER_S", DEFAULT_WATCHDOG_WHISPER_S),
                translate_s: env_u64("WATCHDOG_TRANSLATE_S", DEFAULT_WATCHDOG_TRANSLATE_S),
                tts_s: env_u64("WATCHDOG_TTS_S", DEFAULT_WATCHDOG_TTS_S),
                mix_s: env_u64("WATCHDOG_MIX_S", DEFAULT_WATCHDOG_MIX_S),
                mux_s: env_u64("WATCHDOG_MUX_S", DEFAULT_WATCHDOG_MUX_S),
                export_s: env_u64("WATCHDOG_EXPORT_S", DEFAULT_WATCHDOG_EXPORT_S),
                child_max_mem_mb: env_u64("WATCHDOG_CHILD_MAX_MEM_MB", 0),
            },
            retention: RetentionSettings {
                upload_ttl_hours: env_u64(
                    "RETENTION_UPLOAD_TTL_HOURS",
                    defaults.retention.upload_ttl_hours,
                ),
                job_artifact_days: env_u64(
                    "RETENTION_JOB_ARTIFACT_DAYS",
                    defaults.retention.job_artifact_days,
                ),
                log_days: env_u64("RETENTION_LOG_DAYS", defaults.retention.log_days),
                work_stale_max_hours: env_u64(
                    "WORK_STALE_MAX_HOURS",
                    defaults.retention.work_stale_max_hours,
                ),
                sweep_interval_s: env_u64(
                    "RETENTION_SWEEP_INTERVAL_S",
                    defaults.retention.sweep_interval_s,
                ),
            },
            queue_mode: QueueMode::parse(&env_string("QUEUE_MODE", "auto")),
            redis: RedisSettings {
                url: env_string("REDIS_URL", ""),
                queue_prefix: env_string("REDIS_QUEUE_PREFIX", &defaults.redis.queue_prefix),
                lock_ttl_ms: env_u64("REDIS_LOCK_TTL_MS", defaults.redis.lock_ttl_ms),
                lock_refresh_ms: env_u64("REDIS_LOCK_REFRESH_MS", defaults.redis.lock_refresh_ms),
            },
            ntfy: NtfySettings {
                enabled: env_flag("NTFY_ENABLED"),
                base_url: env_string("NTFY_BASE_URL", &defaults.ntfy.base_url),
                topic: env_string("NTFY_TOPIC", ""),
            },
            tools: ToolSettings {
                ffmpeg_bin: env_string("FFMPEG_BIN", "ffmpeg"),
                ffprobe_bin: env_string("FFPROBE_BIN", "ffprobe"),
                whisper_bin: env_string("WHISPER_BIN", ""),
                vosk_bin: env_string("VOSK_BIN", ""),
                diarize_bin: env_string("DIARIZE_BIN", ""),
                translate_bin: env_string("TRANSLATE_BIN", ""),
                tts_bin: env_string("TTS_BIN", ""),
            },
            allow_egress: env_flag("ALLOW_EGRESS"),
            allow_hf_egress: env_flag("ALLOW_HF_EGRESS"),
            offline_mode: env_flag("OFFLINE_MODE"),
            gpu_util_max: env_f64("GPU_UTIL_MAX", defaults.gpu_util_max),
            gpu_mem_max_ratio: env_f64("GPU_MEM_MAX_RATIO", defaults.gpu_mem_max_ratio),
            chunk_rate_per_s: env_u64("UPLOAD_CHUNK_RATE_PER_S", 3) as u32,
        }
    }

    /// Lock TTL must exceed the refresh interval by at least 2x, otherwise a
    /// healthy claimant can lose its own lock between heartbeats.
    pub fn effective_redis_lock_ttl_ms(&self) -> u64 {
        self.redis.lock_ttl_ms.max(self.redis.lock_refresh_ms.saturating_mul(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_mode_parses_known_values_case_insensitively() {
        assert_eq!(QueueMode::parse("REDIS"), QueueMode::Redis);
        assert_eq!(QueueMode::parse("local"), QueueMode::Local);
        assert_eq!(QueueMode::parse("anything-else"), QueueMode::Auto);
    }

    #[test]
    fn redis_lock_ttl_is_clamped_to_twice_the_refresh_interval() {
        let mut settings = AppSettings::default();
        settings.redis.lock_ttl_ms = 1_000;
        settings.redis.lock_refresh_ms = 10_000;
        assert_eq!(settings.effective_redis_lock_ttl_ms(), 20_000);

        settings.redis.lock_ttl_ms = 60_000;
        assert_eq!(settings.effective_redis_lock_ttl_ms(), 60_000);
    }

    #[test]
    fn defaults_keep_concurrency_limits_positive() {
        let c = ConcurrencySettings::default();
        assert!(c.max_global >= 1);
        assert!(c.max_per_user >= 1);
        assert!(c.max_gpu >= 1);
    }
}
