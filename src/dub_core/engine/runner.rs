use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};

use crate::dub_core::checkpoint::{self, checkpoint_path};
use crate::dub_core::domain::{Job, JobState};
use crate::dub_core::job_logs::JobLogger;
use crate::dub_core::library;
use crate::dub_core::notify::NotifyEvent;
use crate::dub_core::stages::{plan_stages, StageRequest};
use crate::dub_core::watchdog::{run_stage_with_watchdog, StageError};
use crate::sync_ext::MutexExt;

use super::scheduler::AdmittedJob;
use super::state::Inner;

/// Per-stage watchdog deadline lookup.
fn stage_timeout_s(inner: &Inner, stage: &str) -> u64 {
    let watchdog = &inner.settings.watchdog;
    match stage {
        "extracting" => watchdog.audio_s,
        "diarize" => watchdog.diarize_s,
        "asr" => watchdog.whisper_s,
        "translation" => watchdog.translate_s,
        "tts" => watchdog.tts_s,
        "mixing" => watchdog.mix_s,
        "mux" => watchdog.mux_s,
        "export" => watchdog.export_s,
        _ => 0,
    }
}

fn cancel_requested(inner: &Inner, job_id: &str) -> bool {
    let in_memory = {
        let state = inner.state.lock_unpoisoned();
        state.cancel_requests.contains(job_id)
    };
    if in_memory {
        return true;
    }
    match &inner.adapter {
        Some(adapter) if adapter.is_active() => adapter.is_cancel_requested(job_id),
        _ => false,
    }
}

/// Derive (and persist) the job's on-disk locations on first run.
fn ensure_job_paths(inner: &Inner, job: &mut Job) -> Result<()> {
    if !job.work_dir.is_empty() {
        return Ok(());
    }
    let stem = Path::new(&job.video_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| job.id.clone());
    let work_dir = inner.layout.job_work_dir(&stem);
    let log_path = inner.layout.job_logs_dir(&stem).join("pipeline.log");
    let updated = inner.store.update_job(&job.id, |row| {
        row.work_dir = work_dir.to_string_lossy().into_owned();
        row.log_path = log_path.to_string_lossy().into_owned();
    })?;
    *job = updated;
    Ok(())
}

/// Progress is monotonic within a run: never write a smaller value than the
/// one already recorded.
fn update_progress(inner: &Inner, job_id: &str, progress: f64, message: &str) {
    let result = inner.store.update_job(job_id, |job| {
        if progress > job.progress {
            job.progress = progress.clamp(0.0, 1.0);
        }
        job.message = message.to_string();
    });
    if let Err(err) = result {
        tracing::warn!(job_id, error = %err, "failed to update job progress");
    }
}

fn finish(
    inner: &Inner,
    job_id: &str,
    state: JobState,
    message: &str,
    error: Option<String>,
) -> Result<Job> {
    inner
        .metrics
        .jobs_finished_total
        .with_label_values(&[state.as_str()])
        .inc();
    let job = inner.store.update_job(job_id, |job| {
        job.state = state;
        job.message = message.to_string();
        job.error = error.clone();
        if state == JobState::Done {
            job.progress = 1.0;
        }
    })?;
    let outcome = if state == JobState::Done {
        "success"
    } else {
        "failure"
    };
    inner.audit.event(
        "job.finished",
        outcome,
        crate::dub_core::audit::EventCtx::default()
            .job(job_id.to_string())
            .meta(serde_json::json!({
                "state": state.as_str(),
                "reason": error,
            })),
    );
    Ok(job)
}

/// Drive one admitted job through its stage plan.
///
/// Already-done stages (per verified checkpoint) are skipped; each remaining
/// stage runs in an isolated child under its watchdog deadline. Returns the
/// job's final state; an `Err` is an infrastructure failure the worker
/// converts to FAILED.
pub(crate) fn run_job(inner: &Inner, admitted: &AdmittedJob) -> Result<JobState> {
    let job_id = &admitted.job.job_id;
    let Some(mut job) = inner.store.get_job(job_id)? else {
        tracing::warn!(job_id, "admitted job vanished from the store");
        return Ok(JobState::Failed);
    };
    if job.state == JobState::Canceled {
        return Ok(JobState::Canceled);
    }

    ensure_job_paths(inner, &mut job)?;
    let work_dir = PathBuf::from(&job.work_dir);
    let output_dir = work_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| work_dir.clone());
    let logger = JobLogger::new(&inner.layout.job_logs_dir(
        &output_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.id.clone()),
    ));

    inner.store.update_job(job_id, |row| {
        row.state = JobState::Running;
        row.message = "Starting".to_string();
        // Progress is monotonic within a run, not across retries.
        row.progress = 0.0;
        row.error = None;
    })?;
    logger.log("runner", &format!("job {job_id} starting on {} device", admitted.resolved_device.as_str()));

    let imported_srt = job
        .runtime
        .get("imported_srt")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let plan = plan_stages(imported_srt.as_deref());
    let ckpt_path = checkpoint_path(&work_dir);

    let mut degraded: BTreeSet<String> = job.degraded_reasons().into_iter().collect();
    let total = plan.len() as f64;

    for (index, &stage) in plan.iter().enumerate() {
        if cancel_requested(inner, job_id) {
            logger.log(stage, "cancel observed before stage start");
            finish(inner, job_id, JobState::Canceled, "Canceled", None)?;
            return Ok(JobState::Canceled);
        }

        let ckpt = checkpoint::read_checkpoint(&ckpt_path, job_id);
        if checkpoint::stage_is_done(ckpt.as_ref(), stage) {
            logger.log(stage, "already complete; skipping");
            update_progress(
                inner,
                job_id,
                (index as f64 + 1.0) / total,
                &format!("Skipped {stage} (checkpoint)"),
            );
            continue;
        }

        update_progress(
            inner,
            job_id,
            index as f64 / total,
            &format!("Running {stage}"),
        );
        logger.log(stage, "stage starting");

        let request = StageRequest {
            job_id: job_id.clone(),
            stage: stage.to_string(),
            video_path: job.video_path.clone(),
            work_dir: job.work_dir.clone(),
            src_lang: job.src_lang.clone(),
            tgt_lang: job.tgt_lang.clone(),
            tools: inner.settings.tools.clone(),
            child_max_mem_mb: inner.settings.watchdog.child_max_mem_mb,
            imported_srt: imported_srt.clone(),
        };
        let timeout_s = stage_timeout_s(inner, stage);
        let started = Instant::now();
        let mut result = run_stage_with_watchdog(&request, timeout_s, &|| {
            cancel_requested(inner, job_id)
        });
        // One retry, only for stages that declared themselves idempotent.
        // Timeouts and cancellations are final.
        if matches!(result, Err(StageError::Failure { .. }))
            && crate::dub_core::stages::stage_is_idempotent(stage)
        {
            logger.log(stage, "stage failed; retrying once");
            result = run_stage_with_watchdog(&request, timeout_s, &|| {
                cancel_requested(inner, job_id)
            });
        }
        inner
            .metrics
            .observe_stage_seconds(stage, started.elapsed().as_secs_f64());

        let output = match result {
            Ok(output) => output,
            Err(StageError::Canceled { .. }) => {
                logger.log(stage, "stage canceled");
                finish(inner, job_id, JobState::Canceled, "Canceled", None)?;
                return Ok(JobState::Canceled);
            }
            Err(err @ StageError::PhaseTimeout { .. }) => {
                logger.log(stage, &format!("{err}"));
                inner.metrics.job_errors_total.with_label_values(&[stage]).inc();
                inner.metrics.pipeline_job_failed_total.inc();
                finish(inner, job_id, JobState::Failed, "Failed", Some(err.to_string()))?;
                notify_final(inner, job_id, NotifyEvent::Failed);
                return Ok(JobState::Failed);
            }
            Err(StageError::Failure { reason, .. }) => {
                logger.log(stage, &format!("stage failed: {reason}"));
                inner.metrics.job_errors_total.with_label_values(&[stage]).inc();
                inner.metrics.pipeline_job_failed_total.inc();
                finish(
                    inner,
                    job_id,
                    JobState::Failed,
                    "Failed",
                    Some(format!("stage {stage} failed: {reason}")),
                )?;
                notify_final(inner, job_id, NotifyEvent::Failed);
                return Ok(JobState::Failed);
            }
        };

        let artifacts: Vec<(&str, PathBuf)> = output
            .artifacts
            .iter()
            .map(|(key, path)| (key.as_str(), PathBuf::from(path)))
            .collect();
        checkpoint::advance_stage(&ckpt_path, job_id, stage, &artifacts, output.meta.clone())
            .with_context(|| format!("checkpoint advance after {stage}"))?;

        for reason in &output.degraded_reasons {
            logger.log(stage, &format!("degraded: {reason}"));
            degraded.insert(reason.clone());
        }

        let dub = output.artifacts.get("dub").cloned();
        let transcript = output
            .artifacts
            .get("translated")
            .or_else(|| output.artifacts.get("transcript"))
            .cloned();
        inner.store.update_job(job_id, |row| {
            if let Some(dub) = &dub {
                row.output_mkv = Some(dub.clone());
            }
            if let Some(transcript) = &transcript {
                row.output_srt = Some(transcript.clone());
            }
            if !degraded.is_empty() {
                row.runtime.insert(
                    "degraded_reasons".to_string(),
                    serde_json::json!(degraded.iter().collect::<Vec<_>>()),
                );
            }
        })?;

        update_progress(
            inner,
            job_id,
            (index as f64 + 1.0) / total,
            &format!("Finished {stage}"),
        );
        logger.log(stage, "stage complete");
    }

    let job = finish(inner, job_id, JobState::Done, "Completed", None)?;

    if !job.series_slug.is_empty() {
        match library::publish_job(&inner.layout, &job) {
            Ok(published) => logger.log(
                "export",
                &format!("published to library at {}", published.dir.display()),
            ),
            Err(err) => logger.log("export", &format!("library publish failed: {err:#}")),
        }
    }

    if degraded.is_empty() {
        notify_final(inner, job_id, NotifyEvent::Done);
    } else {
        inner.metrics.pipeline_job_degraded_total.inc();
        notify_final(inner, job_id, NotifyEvent::NeedsAttention);
    }
    logger.log("runner", "job complete");
    Ok(JobState::Done)
}

fn notify_final(inner: &Inner, job_id: &str, event: NotifyEvent) {
    match inner.store.get_job(job_id) {
        Ok(Some(job)) => inner.notifier.notify(event, &job),
        _ => tracing::debug!(job_id, "job missing at notification time"),
    }
}
