use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use redis::Commands;
use serde::Serialize;

use crate::dub_core::settings::AppSettings;
use crate::sync_ext::MutexExt;

/// Which backend admissions currently flow through. `Fallback` is a broad
/// "remote unhealthy" signal: any remote command failure flips to it, and a
/// successful ping flips back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendMode {
    Redis,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatus {
    pub mode: QueueBackendMode,
    pub last_error: Option<String>,
}

struct AdapterState {
    mode: QueueBackendMode,
    last_error: Option<String>,
    consecutive_failures: u32,
}

/// Cluster-wide queue adapter over Redis: priority-ordered submissions,
/// heartbeated per-job locks, per-user active caps, and cancel fan-out.
///
/// Every operation is best-effort: a remote failure records the error, flips
/// to fallback mode, and lets the in-process scheduler carry on alone.
pub struct RedisQueueAdapter {
    client: redis::Client,
    prefix: String,
    instance_id: String,
    lock_ttl_ms: u64,
    lock_refresh_ms: u64,
    per_user_cap: u64,
    state: Mutex<AdapterState>,
}

/// Sorted-set score: lower pops first. Higher priority jobs get a more
/// negative base, submission time breaks ties FIFO.
fn queue_score(priority: u32, submitted_at_ms: u64) -> f64 {
    -(f64::from(priority.min(1000))) * 1e13 + submitted_at_ms as f64
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl RedisQueueAdapter {
    /// Build an adapter when settings ask for one; `None` means local-only.
    pub fn from_settings(settings: &AppSettings) -> Option<Self> {
        use crate::dub_core::settings::QueueMode;
        match settings.queue_mode {
            QueueMode::Local => return None,
            QueueMode::Auto if settings.redis.url.is_empty() => return None,
            _ => {}
        }
        if settings.redis.url.is_empty() {
            tracing::warn!("QUEUE_MODE=redis but REDIS_URL is empty; staying local");
            return None;
        }
        let client = match redis::Client::open(settings.redis.url.as_str()) {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(error = %err, "invalid REDIS_URL; staying local");
                return None;
            }
        };
        Some(Self {
            client,
            prefix: settings.redis.queue_prefix.clone(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            lock_ttl_ms: settings.effective_redis_lock_ttl_ms(),
            lock_refresh_ms: settings.redis.lock_refresh_ms,
            per_user_cap: settings.quotas.max_concurrent_jobs,
            state: Mutex::new(AdapterState {
                mode: QueueBackendMode::Fallback,
                last_error: None,
                consecutive_failures: 0,
            }),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn lock_key(&self, job_id: &str) -> String {
        self.key(&format!("lock:{job_id}"))
    }

    fn cancel_key(&self, job_id: &str) -> String {
        self.key(&format!("cancel:{job_id}"))
    }

    fn user_active_key(&self, user_id: &str) -> String {
        self.key(&format!("active:{user_id}"))
    }

    fn record_failure(&self, err: &redis::RedisError) {
        let mut state = self.state.lock_unpoisoned();
        state.consecutive_failures += 1;
        state.last_error = Some(err.to_string());
        if state.mode != QueueBackendMode::Fallback {
            tracing::warn!(error = %err, "redis queue unavailable; falling back to local scheduling");
            state.mode = QueueBackendMode::Fallback;
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock_unpoisoned();
        state.consecutive_failures = 0;
        if state.mode != QueueBackendMode::Redis {
            tracing::info!("redis queue reachable; resuming distributed mode");
            state.mode = QueueBackendMode::Redis;
        }
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Option<T> {
        let mut conn = match self
            .client
            .get_connection_with_timeout(Duration::from_secs(2))
        {
            Ok(conn) => conn,
            Err(err) => {
                self.record_failure(&err);
                return None;
            }
        };
        match op(&mut conn) {
            Ok(value) => {
                self.record_success();
                Some(value)
            }
            Err(err) => {
                self.record_failure(&err);
                None
            }
        }
    }

    /// Ping with bounded retry, exponential backoff and jitter. Used at
    /// startup and by the mode probe.
    pub fn probe(&self) -> bool {
        let mut delay = Duration::from_millis(100);
        for _ in 0..3 {
            if self
                .with_conn(|conn| redis::cmd("PING").query::<String>(conn))
                .is_some()
            {
                return true;
            }
            let jitter = rand::thread_rng().gen_range(0..50);
            std::thread::sleep(delay + Duration::from_millis(jitter));
            delay = delay.saturating_mul(2);
        }
        false
    }

    pub fn status(&self) -> AdapterStatus {
        let state = self.state.lock_unpoisoned();
        AdapterStatus {
            mode: state.mode,
            last_error: state.last_error.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock_unpoisoned().mode == QueueBackendMode::Redis
    }

    pub fn lock_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.lock_refresh_ms.max(250))
    }

    /// Enqueue into the cluster-wide priority structure.
    pub fn submit_job(
        &self,
        job_id: &str,
        user_id: &str,
        priority: u32,
        meta: &serde_json::Value,
    ) -> bool {
        let queue_key = self.key("queue");
        let meta_key = self.key(&format!("meta:{job_id}"));
        let score = queue_score(priority, now_ms());
        let payload = serde_json::json!({
            "user_id": user_id,
            "priority": priority,
            "meta": meta,
        })
        .to_string();
        self.with_conn(|conn| {
            conn.set::<_, _, ()>(&meta_key, payload)?;
            conn.zadd::<_, _, _, ()>(&queue_key, job_id, score)
        })
        .is_some()
    }

    /// Mutual exclusion + per-user cap, taken immediately before a run.
    /// `false` means another instance holds the job or the user is at their
    /// cluster-wide cap; the caller re-queues for a later attempt.
    pub fn before_job_run(&self, job_id: &str, user_id: &str) -> bool {
        let lock_key = self.lock_key(job_id);
        let user_key = self.user_active_key(user_id);
        let ttl = self.lock_ttl_ms;
        let instance = self.instance_id.clone();
        let cap = self.per_user_cap;

        let Some(acquired) = self.with_conn(move |conn| {
            let acquired: bool = redis::cmd("SET")
                .arg(&lock_key)
                .arg(&instance)
                .arg("NX")
                .arg("PX")
                .arg(ttl)
                .query::<Option<String>>(conn)?
                .is_some();
            if !acquired {
                return Ok(false);
            }
            if cap > 0 {
                let active: i64 = conn.incr(&user_key, 1)?;
                if active as u64 > cap {
                    conn.decr::<_, _, i64>(&user_key, 1)?;
                    conn.del::<_, ()>(&lock_key)?;
                    return Ok(false);
                }
            }
            Ok(true)
        }) else {
            // Remote unreachable: fall back to local-only gating.
            return true;
        };
        acquired
    }

    /// Refresh this instance's lock; called from the worker heartbeat.
    pub fn heartbeat(&self, job_id: &str) {
        let lock_key = self.lock_key(job_id);
        let ttl = self.lock_ttl_ms;
        let instance = self.instance_id.clone();
        self.with_conn(move |conn| {
            let holder: Option<String> = conn.get(&lock_key)?;
            if holder.as_deref() == Some(instance.as_str()) {
                conn.pexpire::<_, ()>(&lock_key, ttl as i64)?;
            }
            Ok(())
        });
    }

    /// Release the lock, decrement the user's active count, drop queue meta.
    pub fn after_job_run(&self, job_id: &str, user_id: &str, final_state: &str, ok: bool) {
        let lock_key = self.lock_key(job_id);
        let user_key = self.user_active_key(user_id);
        let meta_key = self.key(&format!("meta:{job_id}"));
        let queue_key = self.key("queue");
        let job = job_id.to_string();
        self.with_conn(move |conn| {
            conn.del::<_, ()>(&lock_key)?;
            conn.del::<_, ()>(&meta_key)?;
            conn.zrem::<_, _, ()>(&queue_key, &job)?;
            let active: i64 = conn.decr(&user_key, 1)?;
            if active < 0 {
                conn.set::<_, _, ()>(&user_key, 0)?;
            }
            Ok(())
        });
        tracing::debug!(job_id, final_state, ok, "distributed finalize");
    }

    /// Cross-instance cancel flag; runners observe it within one
    /// cancel-check interval.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let cancel_key = self.cancel_key(job_id);
        let ttl_ms = 24 * 3600 * 1000i64;
        self.with_conn(move |conn| {
            conn.set::<_, _, ()>(&cancel_key, 1)?;
            conn.pexpire::<_, ()>(&cancel_key, ttl_ms)
        })
        .is_some()
    }

    pub fn is_cancel_requested(&self, job_id: &str) -> bool {
        let cancel_key = self.cancel_key(job_id);
        self.with_conn(move |conn| conn.exists::<_, bool>(&cancel_key))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dub_core::settings::QueueMode;

    #[test]
    fn score_orders_by_priority_then_fifo() {
        let high_early = queue_score(100, 1_000);
        let high_late = queue_score(100, 2_000);
        let low_early = queue_score(10, 500);
        assert!(high_early < high_late, "FIFO within equal priority");
        assert!(high_late < low_early, "higher priority pops first");
        assert!(queue_score(2000, 0) == queue_score(1000, 0), "priority clamps at 1000");
    }

    #[test]
    fn adapter_is_none_without_configuration() {
        let mut settings = AppSettings::default();
        settings.queue_mode = QueueMode::Auto;
        settings.redis.url = String::new();
        assert!(RedisQueueAdapter::from_settings(&settings).is_none());

        settings.queue_mode = QueueMode::Local;
        settings.redis.url = "redis://127.0.0.1:6379".to_string();
        assert!(RedisQueueAdapter::from_settings(&settings).is_none());
    }

    #[test]
    fn unreachable_remote_reports_fallback_mode() {
        let mut settings = AppSettings::default();
        settings.queue_mode = QueueMode::Redis;
        // Reserved TEST-NET address: connection refused/timeout quickly.
        settings.redis.url = "redis://192.0.2.1:1/".to_string();
        let adapter = RedisQueueAdapter::from_settings(&settings).unwrap();

        assert!(!adapter.is_active());
        let _ = adapter.submit_job("j1", "u1", 50, &serde_json::json!({}));
        let status = adapter.status();
        assert_eq!(status.mode, QueueBackendMode::Fallback);

        // Mutual exclusion degrades open: local gating still applies.
        assert!(adapter.before_job_run("j1", "u1"));
        assert!(!adapter.is_cancel_requested("j1"));
    }

    #[test]
    fn key_naming_is_prefixed_per_deployment() {
        let mut settings = AppSettings::default();
        settings.queue_mode = QueueMode::Redis;
        settings.redis.url = "redis://127.0.0.1:6379".to_string();
        settings.redis.queue_prefix = "dubforge-test".to_string();
        let adapter = RedisQueueAdapter::from_settings(&settings).unwrap();
        assert_eq!(adapter.lock_key("j1"), "dubforge-test:lock:j1");
        assert_eq!(adapter.cancel_key("j1"), "dubforge-test:cancel:j1");
        assert_eq!(adapter.user_active_key("u1"), "dubforge-test:active:u1");
    }
}
