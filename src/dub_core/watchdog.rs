use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::dub_core::settings::{CHILD_KILL_GRACE_MS, CHILD_POLL_INTERVAL_MS};
use crate::dub_core::stages::{StageOutput, StageRequest};

/// Hidden argv marker that switches the binary into stage-worker mode.
pub const STAGE_WORKER_ARG: &str = "__stage-worker";

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("stage '{stage}' exceeded timeout ({timeout_s}s) and was killed")]
    PhaseTimeout { stage: String, timeout_s: u64 },
    #[error("stage '{stage}' canceled")]
    Canceled { stage: String },
    #[error("stage '{stage}' failed: {reason}")]
    Failure { stage: String, reason: String },
}

/// Result frame a stage child writes to its stdout: a 4-byte big-endian
/// length followed by JSON. Keeping the channel length-prefixed means a
/// partial write (killed child) is detectable instead of parsed as garbage.
#[derive(Debug, Serialize, Deserialize)]
pub struct StageFrame {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<StageOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_trace: Option<String>,
}

pub fn write_frame(writer: &mut impl Write, frame: &StageFrame) -> std::io::Result<()> {
    let body = serde_json::to_vec(frame)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()
}

pub fn read_frame(reader: &mut impl Read) -> std::io::Result<StageFrame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > 64 * 1024 * 1024 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "stage frame too large",
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    serde_json::from_slice(&body)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    // SIGTERM first so the stage can flush partial artifacts; SIGKILL follows
    // after the grace window.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    let _ = child.kill();
}

/// Escalating stop: SIGTERM, wait the grace period, then SIGKILL.
fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    send_sigterm(child);
    #[cfg(not(unix))]
    send_sigterm(child);

    let grace_deadline = Instant::now() + Duration::from_millis(CHILD_KILL_GRACE_MS);
    while Instant::now() < grace_deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(_) => break,
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Run one stage in an isolated child process.
///
/// The supervisor polls at most every 250 ms for (a) the per-stage deadline
/// and (b) cooperative cancellation, and distinguishes `PhaseTimeout` from
/// `Canceled` so the job lands in the right terminal state. A timeout of
/// zero disables the deadline.
pub fn run_stage_with_watchdog(
    request: &StageRequest,
    timeout_s: u64,
    cancel_check: &dyn Fn() -> bool,
) -> Result<StageOutput, StageError> {
    let stage = request.stage.clone();
    let failure = |reason: String| StageError::Failure {
        stage: stage.clone(),
        reason,
    };

    let exe = std::env::current_exe().map_err(|err| failure(format!("resolve own binary: {err}")))?;
    let mut child = Command::new(exe)
        .arg(STAGE_WORKER_ARG)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|err| failure(format!("spawn stage child: {err}")))?;

    let request_body = serde_json::to_vec(request)
        .map_err(|err| failure(format!("serialize stage request: {err}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(err) = stdin.write_all(&request_body) {
            terminate_child(&mut child);
            return Err(failure(format!("write stage request: {err}")));
        }
        // Dropping stdin closes the pipe; the child reads to EOF.
    }

    // Drain stdout on a pump thread so a large frame can never deadlock the
    // pipe while the supervisor is sleeping between polls.
    let stdout = child.stdout.take();
    let pump = std::thread::Builder::new()
        .name(format!("stage-pump-{stage}"))
        .spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut stdout) = stdout {
                let _ = stdout.read_to_end(&mut buf);
            }
            buf
        })
        .map_err(|err| failure(format!("spawn stdout pump: {err}")))?;

    let deadline = (timeout_s > 0).then(|| Instant::now() + Duration::from_secs(timeout_s));
    let poll = Duration::from_millis(CHILD_POLL_INTERVAL_MS.min(250));

    loop {
        match child.try_wait() {
            Ok(Some(_status)) => break,
            Ok(None) => {}
            Err(err) => {
                terminate_child(&mut child);
                let _ = pump.join();
                return Err(failure(format!("wait on stage child: {err}")));
            }
        }

        if cancel_check() {
            terminate_child(&mut child);
            let _ = pump.join();
            return Err(StageError::Canceled {
                stage: stage.clone(),
            });
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                terminate_child(&mut child);
                let _ = pump.join();
                return Err(StageError::PhaseTimeout {
                    stage: stage.clone(),
                    timeout_s,
                });
            }
        }
        std::thread::sleep(poll);
    }

    let status = child
        .wait()
        .map_err(|err| failure(format!("collect stage child: {err}")))?;
    let output = pump.join().unwrap_or_default();

    let mut cursor = std::io::Cursor::new(output);
    let frame = match read_frame(&mut cursor) {
        Ok(frame) => frame,
        Err(_) if !status.success() => {
            return Err(failure(format!(
                "stage child exited with {status} without a result frame"
            )));
        }
        Err(err) => return Err(failure(format!("malformed stage result frame: {err}"))),
    };

    if frame.ok {
        frame
            .value
            .ok_or_else(|| failure("stage reported ok without a value".to_string()))
    } else {
        Err(failure(
            frame
                .error_trace
                .unwrap_or_else(|| "stage failed without a trace".to_string()),
        ))
    }
}

/// Entry point for stage-worker mode, called from `main` when argv carries
/// [`STAGE_WORKER_ARG`]. Reads the request from stdin, applies the optional
/// address-space cap, runs the stage in-process, and writes the result frame.
/// The exit code is 0 whenever a frame was written, 2 on hard failure.
pub fn stage_worker_main() -> i32 {
    let mut raw = Vec::new();
    if std::io::stdin().read_to_end(&mut raw).is_err() {
        return 2;
    }
    let request: StageRequest = match serde_json::from_slice(&raw) {
        Ok(request) => request,
        Err(_) => return 2,
    };

    apply_memory_cap(request.child_max_mem_mb);

    let frame = match crate::dub_core::stages::run_stage(&request) {
        Ok(value) => StageFrame {
            ok: true,
            value: Some(value),
            error_trace: None,
        },
        Err(err) => StageFrame {
            ok: false,
            value: None,
            error_trace: Some(format!("{err:#}")),
        },
    };

    let mut stdout = std::io::stdout().lock();
    if write_frame(&mut stdout, &frame).is_err() {
        return 2;
    }
    0
}

#[cfg(unix)]
fn apply_memory_cap(max_mem_mb: u64) {
    if max_mem_mb == 0 {
        return;
    }
    let limit = max_mem_mb.saturating_mul(1024 * 1024);
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    // Best effort; a stage without the cap is still supervised by the
    // deadline, so a failure here is not fatal.
    unsafe {
        libc::setrlimit(libc::RLIMIT_AS, &rlim);
    }
}

#[cfg(not(unix))]
fn apply_memory_cap(_max_mem_mb: u64) {}
