use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

use crate::dub_core::paths::Layout;
use crate::dub_core::redact::scrub_meta;
use crate::sync_ext::MutexExt;

/// Append-only audit trail: newline-JSON records in a daily-rotated file, an
/// `audit.jsonl` mirror, and a per-job copy under `Output/jobs/<id>/logs/`.
/// Records never carry content payloads or full filenames; meta is scrubbed
/// before it reaches any sink.
pub struct Audit {
    layout: Layout,
    // Appends are serialized so records within one process stay ordered.
    write_lock: Mutex<()>,
}

#[derive(Debug, Serialize)]
struct AuditRecord<'a> {
    ts: String,
    event: &'a str,
    outcome: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta_safe: Option<serde_json::Value>,
}

/// Builder-style event context so call sites stay one expression.
#[derive(Debug, Default, Clone)]
pub struct EventCtx {
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub resource_id: Option<String>,
    pub job_id: Option<String>,
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
}

impl EventCtx {
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn job(mut self, job_id: impl Into<String>) -> Self {
        let id = job_id.into();
        self.resource_id.get_or_insert_with(|| id.clone());
        self.job_id = Some(id);
        self
    }

    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = meta {
            self.meta = Some(map);
        }
        self
    }
}

impl Audit {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            write_lock: Mutex::new(()),
        }
    }

    fn daily_path(&self) -> PathBuf {
        self.layout
            .log_root
            .join(format!("audit-{}.log", Utc::now().format("%Y%m%d")))
    }

    fn mirror_path(&self) -> PathBuf {
        self.layout.log_root.join("audit.jsonl")
    }

    fn append(path: &PathBuf, line: &str) {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{line}");
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "audit append failed");
            }
        }
    }

    /// Emit one audit event. Failures are logged and swallowed; auditing must
    /// never take a request down with it.
    pub fn event(&self, event: &str, outcome: &str, ctx: EventCtx) {
        let record = AuditRecord {
            ts: Utc::now().to_rfc3339(),
            event,
            outcome,
            request_id: ctx.request_id.as_deref(),
            user_id: ctx.user_id.as_deref(),
            resource_id: ctx.resource_id.as_deref(),
            meta_safe: ctx.meta.as_ref().map(scrub_meta),
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(error = %err, "audit record serialization failed");
                return;
            }
        };

        let job_path = ctx
            .job_id
            .as_deref()
            .or(ctx.resource_id.as_deref())
            .filter(|id| !id.is_empty())
            .map(|id| self.layout.job_audit_path(id));

        let _guard = self.write_lock.lock_unpoisoned();
        Self::append(&self.daily_path(), &line);
        Self::append(&self.mirror_path(), &line);
        if let Some(path) = job_path {
            Self::append(&path, &line);
        }
    }
}
