use std::sync::Arc;
use std::time::Duration;

use crate::dub_core::audit::{Audit, EventCtx};
use crate::dub_core::domain::Job;
use crate::dub_core::net_policy::EgressPolicy;
use crate::dub_core::settings::NtfySettings;

/// Job lifecycle events worth a push notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    Done,
    Failed,
    NeedsAttention,
}

impl NotifyEvent {
    fn title(&self) -> &'static str {
        match self {
            NotifyEvent::Done => "Dub finished",
            NotifyEvent::Failed => "Dub failed",
            NotifyEvent::NeedsAttention => "Dub needs attention",
        }
    }

    fn priority(&self) -> &'static str {
        match self {
            NotifyEvent::Done => "default",
            NotifyEvent::Failed => "high",
            NotifyEvent::NeedsAttention => "high",
        }
    }
}

/// ntfy webhook notifier. Delivery is best-effort: failures are logged and
/// audited, never surfaced to the pipeline. All dials go through the egress
/// policy gate.
pub struct Notifier {
    settings: NtfySettings,
    policy: EgressPolicy,
    audit: Arc<Audit>,
    client: Option<reqwest::blocking::Client>,
}

impl Notifier {
    pub fn new(settings: NtfySettings, policy: EgressPolicy, audit: Arc<Audit>) -> Self {
        let client = settings
            .enabled
            .then(|| {
                reqwest::blocking::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                    .ok()
            })
            .flatten();
        Self {
            settings,
            policy,
            audit,
            client,
        }
    }

    fn topic_url(&self) -> Option<String> {
        if self.settings.topic.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.topic
        ))
    }

    /// Fire one notification for a job event. Called from worker threads.
    pub fn notify(&self, event: NotifyEvent, job: &Job) {
        if !self.settings.enabled {
            return;
        }
        let Some(url) = self.topic_url() else {
            return;
        };
        if !self.policy.allow_url(&url) {
            tracing::debug!(job_id = %job.id, "ntfy suppressed by egress policy");
            return;
        }
        let Some(client) = &self.client else {
            return;
        };

        let body = match event {
            NotifyEvent::Done => format!("Job {} finished", job.id),
            NotifyEvent::Failed => format!(
                "Job {} failed: {}",
                job.id,
                job.error.as_deref().unwrap_or("unknown error")
            ),
            NotifyEvent::NeedsAttention => format!(
                "Job {} finished degraded: {}",
                job.id,
                job.degraded_reasons().join(", ")
            ),
        };

        let outcome = match client
            .post(&url)
            .header("Title", event.title())
            .header("Priority", event.priority())
            .body(body)
            .send()
        {
            Ok(response) if response.status().is_success() => "success",
            Ok(response) => {
                tracing::warn!(job_id = %job.id, status = %response.status(), "ntfy rejected");
                "failure"
            }
            Err(err) => {
                tracing::warn!(job_id = %job.id, error = %err, "ntfy delivery failed");
                "failure"
            }
        };
        self.audit.event(
            "notify.ntfy",
            outcome,
            EventCtx::default()
                .job(job.id.clone())
                .meta(serde_json::json!({ "kind": event.title() })),
        );
    }
}
