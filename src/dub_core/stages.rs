use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::dub_core::settings::ToolSettings;

/// Canonical stage order for a dubbing run.
pub const STAGE_ORDER: &[&str] = &[
    "extracting",
    "diarize",
    "asr",
    "translation",
    "tts",
    "mixing",
    "mux",
    "export",
];

/// Everything a stage child needs to run one stage, serialized over the
/// supervisor/child pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRequest {
    pub job_id: String,
    pub stage: String,
    pub video_path: String,
    pub work_dir: String,
    pub src_lang: String,
    pub tgt_lang: String,
    pub tools: ToolSettings,
    pub child_max_mem_mb: u64,
    /// User-supplied target-language subtitles; when present the runner skips
    /// asr and translation entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_srt: Option<String>,
}

impl StageRequest {
    fn work_dir(&self) -> PathBuf {
        PathBuf::from(&self.work_dir)
    }

    /// Artifacts land next to the work dir, in the job's output directory.
    fn output_dir(&self) -> PathBuf {
        let work = self.work_dir();
        work.parent().map(Path::to_path_buf).unwrap_or(work)
    }
}

/// What a stage hands back: artifact key -> path (recorded into the
/// checkpoint with hashes), plus any degraded-mode reasons.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOutput {
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default)]
    pub degraded_reasons: Vec<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl StageOutput {
    fn with_artifact(mut self, key: &str, path: &Path) -> Self {
        self.artifacts
            .insert(key.to_string(), path.to_string_lossy().into_owned());
        self
    }

    fn degraded(mut self, reason: &str) -> Self {
        self.degraded_reasons.push(reason.to_string());
        self
    }
}

/// Capability surface for a speech-to-text backend, selected at runtime from
/// whatever is installed.
pub trait SpeechToText {
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;
    fn transcribe(&self, audio: &Path, language: &str, out_srt: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum AsrProvider {
    WhisperCli { bin: String },
    VoskCli { bin: String },
}

impl SpeechToText for AsrProvider {
    fn name(&self) -> &'static str {
        match self {
            AsrProvider::WhisperCli { .. } => "whisper",
            AsrProvider::VoskCli { .. } => "vosk",
        }
    }

    fn is_available(&self) -> bool {
        match self {
            AsrProvider::WhisperCli { bin } | AsrProvider::VoskCli { bin } => !bin.is_empty(),
        }
    }

    fn transcribe(&self, audio: &Path, language: &str, out_srt: &Path) -> Result<()> {
        match self {
            AsrProvider::WhisperCli { bin } => run_tool(
                bin,
                &[
                    audio.to_string_lossy().as_ref(),
                    "--language",
                    language,
                    "--output-format",
                    "srt",
                    "--output",
                    out_srt.to_string_lossy().as_ref(),
                ],
            ),
            AsrProvider::VoskCli { bin } => run_tool(
                bin,
                &[
                    "--input",
                    audio.to_string_lossy().as_ref(),
                    "--lang",
                    language,
                    "--srt",
                    out_srt.to_string_lossy().as_ref(),
                ],
            ),
        }
    }
}

/// Pick the first available ASR backend; None puts the asr stage in degraded
/// mode rather than failing the job.
pub fn select_asr_provider(tools: &ToolSettings) -> Option<AsrProvider> {
    let candidates = [
        AsrProvider::WhisperCli {
            bin: tools.whisper_bin.clone(),
        },
        AsrProvider::VoskCli {
            bin: tools.vosk_bin.clone(),
        },
    ];
    candidates.into_iter().find(SpeechToText::is_available)
}

fn run_tool(bin: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(bin)
        .args(args)
        .output()
        .with_context(|| format!("spawn {bin}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{bin} exited with {}: {}",
            output.status,
            stderr.trim().chars().take(500).collect::<String>()
        );
    }
    Ok(())
}

fn ensure_dirs(request: &StageRequest) -> Result<()> {
    fs::create_dir_all(request.work_dir()).context("create work dir")?;
    fs::create_dir_all(request.output_dir()).context("create output dir")?;
    Ok(())
}

// ---- stage bodies (run inside the stage child) ------------------------------

fn stage_extracting(request: &StageRequest) -> Result<StageOutput> {
    let audio = request.output_dir().join("audio.wav");
    run_tool(
        &request.tools.ffmpeg_bin,
        &[
            "-y",
            "-i",
            &request.video_path,
            "-vn",
            "-ac",
            "1",
            "-ar",
            "16000",
            audio.to_string_lossy().as_ref(),
        ],
    )?;
    if !audio.exists() {
        bail!("audio extraction produced no output");
    }
    Ok(StageOutput::default().with_artifact("audio", &audio))
}

fn stage_diarize(request: &StageRequest) -> Result<StageOutput> {
    let audio = request.output_dir().join("audio.wav");
    let out = request.work_dir().join("diarization.json");
    if request.tools.diarize_bin.is_empty() {
        fs::write(&out, serde_json::json!({ "segments": [] }).to_string())
            .context("write empty diarization")?;
        return Ok(StageOutput::default()
            .with_artifact("diarization", &out)
            .degraded("diarization_unavailable"));
    }
    run_tool(
        &request.tools.diarize_bin,
        &[
            audio.to_string_lossy().as_ref(),
            out.to_string_lossy().as_ref(),
        ],
    )?;
    Ok(StageOutput::default().with_artifact("diarization", &out))
}

fn stage_asr(request: &StageRequest) -> Result<StageOutput> {
    let audio = request.output_dir().join("audio.wav");
    let srt = request.output_dir().join("transcript.srt");
    match select_asr_provider(&request.tools) {
        Some(provider) => {
            provider.transcribe(&audio, &request.src_lang, &srt)?;
            if !srt.exists() {
                bail!("{} wrote no transcript", provider.name());
            }
            let output = StageOutput::default().with_artifact("transcript", &srt);
            Ok(StageOutput {
                meta: serde_json::json!({ "provider": provider.name() }),
                ..output
            })
        }
        None => {
            // No recognizer installed: ship an empty transcript and flag the
            // job as needing attention instead of failing it.
            fs::write(&srt, "").context("write empty transcript")?;
            Ok(StageOutput::default()
                .with_artifact("transcript", &srt)
                .degraded("whisper_unavailable"))
        }
    }
}

fn stage_translation(request: &StageRequest) -> Result<StageOutput> {
    let source = request.output_dir().join("transcript.srt");
    let out = request
        .output_dir()
        .join(format!("transcript.{}.srt", request.tgt_lang));
    if request.tools.translate_bin.is_empty() {
        // Pass-through keeps timing so downstream stages stay runnable.
        fs::copy(&source, &out).context("copy transcript for pass-through translation")?;
        return Ok(StageOutput::default()
            .with_artifact("translated", &out)
            .degraded("translation_unavailable"));
    }
    run_tool(
        &request.tools.translate_bin,
        &[
            "--from",
            &request.src_lang,
            "--to",
            &request.tgt_lang,
            source.to_string_lossy().as_ref(),
            out.to_string_lossy().as_ref(),
        ],
    )?;
    Ok(StageOutput::default().with_artifact("translated", &out))
}

/// Minimal valid PCM16 mono WAV with one second of silence, used when no TTS
/// backend is installed so the mix/mux stages still produce a playable file.
fn write_silent_wav(path: &Path) -> Result<()> {
    const SAMPLE_RATE: u32 = 16_000;
    let data_len: u32 = SAMPLE_RATE * 2;
    let mut buf = Vec::with_capacity(44 + data_len as usize);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVEfmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    buf.extend_from_slice(&(SAMPLE_RATE * 2).to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.resize(44 + data_len as usize, 0);
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

fn stage_tts(request: &StageRequest) -> Result<StageOutput> {
    let srt = request
        .output_dir()
        .join(format!("transcript.{}.srt", request.tgt_lang));
    let srt = if srt.exists() {
        srt
    } else {
        // Imported-subtitle jobs skip translation; the import lands here.
        request.output_dir().join("transcript.srt")
    };
    let out = request.output_dir().join("tts.wav");
    if request.tools.tts_bin.is_empty() {
        write_silent_wav(&out)?;
        return Ok(StageOutput::default()
            .with_artifact("tts", &out)
            .degraded("tts_unavailable"));
    }
    run_tool(
        &request.tools.tts_bin,
        &[
            "--subtitles",
            srt.to_string_lossy().as_ref(),
            "--lang",
            &request.tgt_lang,
            out.to_string_lossy().as_ref(),
        ],
    )?;
    Ok(StageOutput::default().with_artifact("tts", &out))
}

fn stage_mixing(request: &StageRequest) -> Result<StageOutput> {
    let stems = request.output_dir().join("stems");
    fs::create_dir_all(&stems).context("create stems dir")?;
    let dialogue = stems.join("dialogue.wav");
    let background = stems.join("background.wav");
    let mixed = request.work_dir().join("mixed.wav");
    let tts = request.output_dir().join("tts.wav");
    let audio = request.output_dir().join("audio.wav");

    // Dialogue stem is the synthesized track; background falls out of the
    // original mix. Proper source separation is a pluggable stage upstream.
    fs::copy(&tts, &dialogue).context("stage dialogue stem")?;
    fs::copy(&audio, &background).context("stage background stem")?;
    run_tool(
        &request.tools.ffmpeg_bin,
        &[
            "-y",
            "-i",
            dialogue.to_string_lossy().as_ref(),
            "-i",
            background.to_string_lossy().as_ref(),
            "-filter_complex",
            "amix=inputs=2:duration=longest",
            mixed.to_string_lossy().as_ref(),
        ],
    )?;
    Ok(StageOutput::default()
        .with_artifact("dialogue", &dialogue)
        .with_artifact("background", &background)
        .with_artifact("mixed", &mixed))
}

fn stage_mux(request: &StageRequest) -> Result<StageOutput> {
    let mixed = request.work_dir().join("mixed.wav");
    let out = request.output_dir().join("dub.mkv");
    run_tool(
        &request.tools.ffmpeg_bin,
        &[
            "-y",
            "-i",
            &request.video_path,
            "-i",
            mixed.to_string_lossy().as_ref(),
            "-map",
            "0:v:0",
            "-map",
            "1:a:0",
            "-c:v",
            "copy",
            out.to_string_lossy().as_ref(),
        ],
    )?;
    Ok(StageOutput::default().with_artifact("dub", &out))
}

fn stage_export(request: &StageRequest) -> Result<StageOutput> {
    let dub = request.output_dir().join("dub.mkv");
    let mobile = request.output_dir().join("mobile.mp4");
    run_tool(
        &request.tools.ffmpeg_bin,
        &[
            "-y",
            "-i",
            dub.to_string_lossy().as_ref(),
            "-vf",
            "scale=-2:720",
            "-movflags",
            "+faststart",
            mobile.to_string_lossy().as_ref(),
        ],
    )?;
    Ok(StageOutput::default()
        .with_artifact("dub", &dub)
        .with_artifact("mobile", &mobile))
}

/// Stage dispatch, executed inside the isolated child process.
pub fn run_stage(request: &StageRequest) -> Result<StageOutput> {
    ensure_dirs(request)?;
    match request.stage.as_str() {
        "extracting" => stage_extracting(request),
        "diarize" => stage_diarize(request),
        "asr" => stage_asr(request),
        "translation" => stage_translation(request),
        "tts" => stage_tts(request),
        "mixing" => stage_mixing(request),
        "mux" => stage_mux(request),
        "export" => stage_export(request),
        other => bail!("unknown stage '{other}'"),
    }
}

/// Whether a stage may be retried once after a failure. Only stages that are
/// pure functions of their inputs (ffmpeg invocations overwriting their
/// output) qualify; model-backed stages are not safely re-runnable blind.
pub fn stage_is_idempotent(stage: &str) -> bool {
    matches!(stage, "extracting" | "mixing" | "mux" | "export")
}

/// Stages to run for a given job: imported target subtitles make asr and
/// translation redundant, the import stands in for their artifacts.
pub fn plan_stages(imported_srt: Option<&str>) -> Vec<&'static str> {
    STAGE_ORDER
        .iter()
        .copied()
        .filter(|stage| {
            if imported_srt.is_some() {
                *stage != "asr" && *stage != "translation"
            } else {
                true
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path, stage: &str) -> StageRequest {
        StageRequest {
            job_id: "j1".to_string(),
            stage: stage.to_string(),
            video_path: dir.join("episode.mkv").to_string_lossy().into_owned(),
            work_dir: dir.join("work").to_string_lossy().into_owned(),
            src_lang: "ja".to_string(),
            tgt_lang: "en".to_string(),
            tools: ToolSettings {
                ffmpeg_bin: String::new(),
                ffprobe_bin: String::new(),
                whisper_bin: String::new(),
                vosk_bin: String::new(),
                diarize_bin: String::new(),
                translate_bin: String::new(),
                tts_bin: String::new(),
            },
            child_max_mem_mb: 0,
            imported_srt: None,
        }
    }

    #[test]
    fn plan_skips_asr_and_translation_for_imported_subtitles() {
        let full = plan_stages(None);
        assert_eq!(full.len(), STAGE_ORDER.len());

        let skipped = plan_stages(Some("/in/episode.en.srt"));
        assert!(!skipped.contains(&"asr"));
        assert!(!skipped.contains(&"translation"));
        assert_eq!(skipped.first(), Some(&"extracting"));
        assert_eq!(skipped.last(), Some(&"export"));
    }

    #[test]
    fn asr_degrades_to_empty_transcript_without_a_provider() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "asr");
        ensure_dirs(&req).unwrap();
        std::fs::write(req.output_dir().join("audio.wav"), b"").unwrap();

        let output = stage_asr(&req).unwrap();
        assert_eq!(output.degraded_reasons, vec!["whisper_unavailable"]);
        let srt = PathBuf::from(&output.artifacts["transcript"]);
        assert!(srt.exists());
        assert_eq!(std::fs::read_to_string(srt).unwrap(), "");
    }

    #[test]
    fn translation_pass_through_preserves_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "translation");
        ensure_dirs(&req).unwrap();
        std::fs::write(
            req.output_dir().join("transcript.srt"),
            "1\n00:00:00,000 --> 00:00:01,000\nhello\n",
        )
        .unwrap();

        let output = stage_translation(&req).unwrap();
        assert_eq!(output.degraded_reasons, vec!["translation_unavailable"]);
        let translated = PathBuf::from(&output.artifacts["translated"]);
        assert!(translated.file_name().unwrap().to_string_lossy().contains(".en."));
        assert!(std::fs::read_to_string(translated).unwrap().contains("hello"));
    }

    #[test]
    fn tts_fallback_writes_a_playable_wav_header() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "tts");
        ensure_dirs(&req).unwrap();
        std::fs::write(req.output_dir().join("transcript.srt"), "").unwrap();

        let output = stage_tts(&req).unwrap();
        assert_eq!(output.degraded_reasons, vec!["tts_unavailable"]);
        let wav = std::fs::read(&output.artifacts["tts"]).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert!(wav.len() > 44);
    }

    #[test]
    fn only_pure_ffmpeg_stages_are_retryable() {
        assert!(stage_is_idempotent("extracting"));
        assert!(stage_is_idempotent("mux"));
        assert!(!stage_is_idempotent("asr"));
        assert!(!stage_is_idempotent("tts"));
    }

    #[test]
    fn provider_registry_prefers_installed_backends() {
        let mut tools = request(Path::new("/tmp"), "asr").tools;
        assert!(select_asr_provider(&tools).is_none());
        tools.whisper_bin = "/opt/whisper/bin/whisper".to_string();
        let provider = select_asr_provider(&tools).unwrap();
        assert_eq!(provider.name(), "whisper");
        assert!(provider.is_available());
    }
}
