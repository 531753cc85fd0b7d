//! Pipeline end-to-end driver and mock external tool in one binary.
//!
//! Runs in three modes, dispatched from `main`:
//! - `__stage-worker`: the engine re-execs the current binary for stage
//!   isolation; this forwards to the real stage-worker entry point.
//! - `MOCK_STAGE_TOOL` set: behave as a mocked ffmpeg/whisper invocation.
//!   Optionally sleep or fail, then create the output file named by the last
//!   argument.
//! - otherwise: drive full pipeline scenarios against a real engine with the
//!   tool paths pointed back at this binary.
//!
//! Exit code 0 on success, 2 on failure.

use std::path::Path;
use std::time::{Duration, Instant};

use dubforge::api::AppState;
use dubforge::dub_core::checkpoint;
use dubforge::dub_core::domain::{DevicePref, Job, JobMode, JobState, Visibility};
use dubforge::dub_core::settings::AppSettings;
use dubforge::dub_core::watchdog::{stage_worker_main, STAGE_WORKER_ARG};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some(STAGE_WORKER_ARG) {
        std::process::exit(stage_worker_main());
    }
    if std::env::var_os("MOCK_STAGE_TOOL").is_some() {
        std::process::exit(tool_main(&args[1..]));
    }
    driver_main();
}

// ---- mock tool mode ---------------------------------------------------------

fn sleep_from_env(key: &str) {
    if let Some(ms) = std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok()) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Identify which tool we are standing in for by argument shape, honor the
/// per-tool sleep/exit knobs, then create the output file (last argument).
fn tool_main(args: &[String]) -> i32 {
    let is_whisper = args.iter().any(|a| a == "--output-format");
    let is_translate = args.iter().any(|a| a == "--from");
    let is_tts = args.iter().any(|a| a == "--subtitles");

    if is_whisper {
        sleep_from_env("MOCK_WHISPER_SLEEP_MS");
    } else if is_translate {
        sleep_from_env("MOCK_TRANSLATE_SLEEP_MS");
    } else if is_tts {
        sleep_from_env("MOCK_TTS_SLEEP_MS");
    } else {
        sleep_from_env("MOCK_FFMPEG_SLEEP_MS");
    }

    if let Some(code) = std::env::var("MOCK_TOOL_EXIT_CODE")
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
    {
        if code != 0 {
            eprintln!("mock tool: forced failure");
            return code;
        }
    }

    if let Some(out) = args.last() {
        let path = Path::new(out);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if std::fs::write(path, b"mock-tool-output").is_err() {
            return 2;
        }
    }
    0
}

// ---- driver mode ------------------------------------------------------------

fn fail(msg: &str) -> ! {
    eprintln!("FAIL: {msg}");
    std::process::exit(2);
}

fn check(cond: bool, msg: &str) {
    if !cond {
        fail(msg);
    }
}

fn test_settings(dir: &Path) -> AppSettings {
    let exe = std::env::current_exe()
        .unwrap_or_else(|_| fail("cannot resolve own binary"))
        .to_string_lossy()
        .into_owned();
    let mut settings = AppSettings::default();
    settings.app_root = dir.to_path_buf();
    settings.input_dir = dir.join("Input");
    settings.output_dir = dir.join("Output");
    settings.log_dir = dir.join("logs");
    settings.state_dir = dir.join("Output").join("_state");
    settings.min_free_gb = 0;
    settings.quotas.max_concurrent_jobs = 0;
    settings.concurrency.max_global = 1;
    settings.tools.ffmpeg_bin = exe.clone();
    settings.tools.ffprobe_bin = exe;
    settings
}

fn seed_job(state: &AppState, id: &str, video_path: &Path) -> Job {
    let job = Job {
        id: id.to_string(),
        owner_id: "u1".to_string(),
        video_path: video_path.to_string_lossy().into_owned(),
        duration_s: 60.0,
        mode: JobMode::Medium,
        device: DevicePref::Cpu,
        src_lang: "ja".to_string(),
        tgt_lang: "en".to_string(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        state: JobState::Queued,
        progress: 0.0,
        message: "Queued".to_string(),
        output_mkv: None,
        output_srt: None,
        work_dir: String::new(),
        log_path: String::new(),
        error: None,
        series_title: String::new(),
        series_slug: String::new(),
        season_number: 0,
        episode_number: 0,
        visibility: Visibility::Private,
        runtime: Default::default(),
    };
    state.jobs.put_job(&job).unwrap_or_else(|err| fail(&format!("seed job: {err}")));
    job
}

fn wait_for_state(state: &AppState, id: &str, timeout: Duration) -> Job {
    let deadline = Instant::now() + timeout;
    loop {
        let job = state
            .jobs
            .get_job(id)
            .ok()
            .flatten()
            .unwrap_or_else(|| fail("job vanished"));
        if job.state.is_terminal() {
            return job;
        }
        if Instant::now() >= deadline {
            fail(&format!(
                "timed out waiting for job {id}; state={} message={}",
                job.state.as_str(),
                job.message
            ));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn scenario_full_pipeline_with_resume() {
    eprintln!("scenario: full pipeline, degraded providers, checkpoint resume");
    let dir = tempfile::tempdir().unwrap_or_else(|_| fail("tempdir"));
    let settings = test_settings(dir.path());
    let state = dubforge::bootstrap(settings).unwrap_or_else(|err| fail(&format!("bootstrap: {err:#}")));

    std::fs::create_dir_all(dir.path().join("Input")).ok();
    let video = dir.path().join("Input").join("episode-01.mkv");
    std::fs::write(&video, b"fake-video-bytes").unwrap_or_else(|_| fail("write input"));

    let job = seed_job(&state, "job-e2e-1", &video);
    state.engine.submit_job(&job, 50);

    let done = wait_for_state(&state, &job.id, Duration::from_secs(60));
    check(done.state == JobState::Done, &format!(
        "expected DONE, got {} ({:?})",
        done.state.as_str(),
        done.error
    ));
    check((done.progress - 1.0).abs() < 1e-9, "progress must reach 1.0");

    let degraded = done.degraded_reasons();
    for reason in [
        "diarization_unavailable",
        "whisper_unavailable",
        "translation_unavailable",
        "tts_unavailable",
    ] {
        check(
            degraded.iter().any(|r| r == reason),
            &format!("missing degraded reason {reason}: {degraded:?}"),
        );
    }

    let output_dir = dir.path().join("Output").join("episode-01");
    let master = output_dir.join("dub.mkv");
    check(master.exists(), "dub.mkv missing");
    check(output_dir.join("mobile.mp4").exists(), "mobile.mp4 missing");

    let ckpt = checkpoint::read_checkpoint(
        &checkpoint::checkpoint_path(&output_dir.join("work")),
        &job.id,
    )
    .unwrap_or_else(|| fail("checkpoint missing"));
    for stage in ["extracting", "asr", "tts", "mux", "export"] {
        check(
            checkpoint::stage_is_done(Some(&ckpt), stage),
            &format!("stage {stage} not recorded done"),
        );
    }

    // Resume: re-queue the same job; every stage verifies against the
    // checkpoint and is skipped, so the master artifact is not rewritten.
    let master_mtime = std::fs::metadata(&master).unwrap().modified().unwrap();
    std::thread::sleep(Duration::from_millis(1_100));
    let requeued = state
        .jobs
        .update_job(&job.id, |row| {
            row.state = JobState::Queued;
            row.message = "Requeued".to_string();
        })
        .unwrap_or_else(|err| fail(&format!("requeue: {err}")));
    state.engine.submit_job(&requeued, 50);

    let done_again = wait_for_state(&state, &job.id, Duration::from_secs(30));
    check(done_again.state == JobState::Done, "resume run must finish DONE");
    let master_mtime_after = std::fs::metadata(&master).unwrap().modified().unwrap();
    check(
        master_mtime == master_mtime_after,
        "completed stages must be skipped on resume, not re-run",
    );
    eprintln!("ok: full pipeline");
}

fn scenario_stage_timeout() {
    eprintln!("scenario: whisper watchdog timeout");
    let dir = tempfile::tempdir().unwrap_or_else(|_| fail("tempdir"));
    let mut settings = test_settings(dir.path());
    let exe = settings.tools.ffmpeg_bin.clone();
    settings.tools.whisper_bin = exe;
    settings.watchdog.whisper_s = 1;
    std::env::set_var("MOCK_WHISPER_SLEEP_MS", "5000");

    let state = dubforge::bootstrap(settings).unwrap_or_else(|err| fail(&format!("bootstrap: {err:#}")));
    std::fs::create_dir_all(dir.path().join("Input")).ok();
    let video = dir.path().join("Input").join("episode-02.mkv");
    std::fs::write(&video, b"fake-video-bytes").unwrap_or_else(|_| fail("write input"));

    let job = seed_job(&state, "job-e2e-timeout", &video);
    let started = Instant::now();
    state.engine.submit_job(&job, 50);

    let finished = wait_for_state(&state, &job.id, Duration::from_secs(30));
    check(
        finished.state == JobState::Failed,
        &format!("expected FAILED, got {}", finished.state.as_str()),
    );
    let error = finished.error.unwrap_or_default();
    check(
        error.contains("timeout"),
        &format!("error must mention timeout, got: {error}"),
    );
    // Deadline 1 s + SIGTERM grace 2 s + dispatch slack: the child must die
    // well before the mock's 5 s sleep would have finished on its own.
    check(
        started.elapsed() < Duration::from_secs(25),
        "watchdog did not kill the stage promptly",
    );
    std::env::remove_var("MOCK_WHISPER_SLEEP_MS");
    eprintln!("ok: stage timeout");
}

fn scenario_cancel_mid_run() {
    eprintln!("scenario: cooperative cancel mid-stage");
    let dir = tempfile::tempdir().unwrap_or_else(|_| fail("tempdir"));
    let mut settings = test_settings(dir.path());
    let exe = settings.tools.ffmpeg_bin.clone();
    settings.tools.whisper_bin = exe;
    settings.watchdog.whisper_s = 60;
    std::env::set_var("MOCK_WHISPER_SLEEP_MS", "20000");

    let state = dubforge::bootstrap(settings).unwrap_or_else(|err| fail(&format!("bootstrap: {err:#}")));
    std::fs::create_dir_all(dir.path().join("Input")).ok();
    let video = dir.path().join("Input").join("episode-03.mkv");
    std::fs::write(&video, b"fake-video-bytes").unwrap_or_else(|_| fail("write input"));

    let job = seed_job(&state, "job-e2e-cancel", &video);
    state.engine.submit_job(&job, 50);

    // Let the run reach the slow asr stage, then cancel.
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let current = state.jobs.get_job(&job.id).ok().flatten().unwrap();
        if current.state == JobState::Running && current.message.contains("asr") {
            break;
        }
        if Instant::now() >= deadline {
            fail("job never reached the asr stage");
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    let cancel_at = Instant::now();
    check(state.engine.cancel_job(&job.id), "first cancel should report a change");

    let finished = wait_for_state(&state, &job.id, Duration::from_secs(10));
    check(
        finished.state == JobState::Canceled,
        &format!("expected CANCELED, got {}", finished.state.as_str()),
    );
    check(
        cancel_at.elapsed() < Duration::from_secs(8),
        "cancel must take effect within the poll interval plus kill grace",
    );

    // Second cancel is a no-op.
    check(!state.engine.cancel_job(&job.id), "second cancel must be a no-op");
    std::env::remove_var("MOCK_WHISPER_SLEEP_MS");
    eprintln!("ok: cancel mid-run");
}

fn driver_main() {
    // Children (stage workers and tool invocations) inherit this and switch
    // into mock-tool mode; the __stage-worker argv check runs first, so the
    // stage workers themselves are unaffected.
    std::env::set_var("MOCK_STAGE_TOOL", "1");

    scenario_full_pipeline_with_resume();
    scenario_stage_timeout();
    scenario_cancel_mid_run();
    eprintln!("all pipeline scenarios passed");
}
