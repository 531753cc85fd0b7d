use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Latency buckets sized for pipeline stages: sub-second probes up to the
/// hour-long worst case.
pub const PIPELINE_BUCKETS: &[f64] = &[
    0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0, 1200.0, 1800.0,
    3600.0,
];

pub struct Metrics {
    registry: Registry,
    pub jobs_queued_total: IntCounter,
    pub jobs_finished_total: IntCounterVec,
    pub job_errors_total: IntCounterVec,
    pub pipeline_job_total: IntCounter,
    pub pipeline_job_failed_total: IntCounter,
    pub pipeline_job_degraded_total: IntCounter,
    pub pipeline_transcribe_seconds: Histogram,
    pub pipeline_tts_seconds: Histogram,
    pub pipeline_mux_seconds: Histogram,
}

fn pipeline_histogram(registry: &Registry, name: &str, help: &str) -> Histogram {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(name, help).buckets(PIPELINE_BUCKETS.to_vec()),
    )
    .expect("valid histogram opts");
    registry
        .register(Box::new(histogram.clone()))
        .expect("histogram registers once");
    histogram
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let jobs_queued_total =
            IntCounter::new("jobs_queued_total", "Jobs accepted into the queue")
                .expect("valid counter");
        registry
            .register(Box::new(jobs_queued_total.clone()))
            .expect("counter registers once");

        let jobs_finished_total = IntCounterVec::new(
            Opts::new("jobs_finished_total", "Jobs finished by final state"),
            &["state"],
        )
        .expect("valid counter vec");
        registry
            .register(Box::new(jobs_finished_total.clone()))
            .expect("counter registers once");

        let job_errors_total = IntCounterVec::new(
            Opts::new("job_errors_total", "Job stage errors"),
            &["stage"],
        )
        .expect("valid counter vec");
        registry
            .register(Box::new(job_errors_total.clone()))
            .expect("counter registers once");

        let pipeline_job_total =
            IntCounter::new("pipeline_job_total", "Pipeline jobs created").expect("valid counter");
        registry
            .register(Box::new(pipeline_job_total.clone()))
            .expect("counter registers once");

        let pipeline_job_failed_total =
            IntCounter::new("pipeline_job_failed_total", "Pipeline jobs failed")
                .expect("valid counter");
        registry
            .register(Box::new(pipeline_job_failed_total.clone()))
            .expect("counter registers once");

        let pipeline_job_degraded_total = IntCounter::new(
            "pipeline_job_degraded_total",
            "Pipeline jobs finished with degraded stages",
        )
        .expect("valid counter");
        registry
            .register(Box::new(pipeline_job_degraded_total.clone()))
            .expect("counter registers once");

        let pipeline_transcribe_seconds = pipeline_histogram(
            &registry,
            "pipeline_transcribe_seconds",
            "Transcribe stage latency (seconds)",
        );
        let pipeline_tts_seconds = pipeline_histogram(
            &registry,
            "pipeline_tts_seconds",
            "TTS stage latency (seconds)",
        );
        let pipeline_mux_seconds = pipeline_histogram(
            &registry,
            "pipeline_mux_seconds",
            "Mux/mix stage latency (seconds)",
        );

        Self {
            registry,
            jobs_queued_total,
            jobs_finished_total,
            job_errors_total,
            pipeline_job_total,
            pipeline_job_failed_total,
            pipeline_job_degraded_total,
            pipeline_transcribe_seconds,
            pipeline_tts_seconds,
            pipeline_mux_seconds,
        }
    }

    /// Record a stage duration into the matching histogram, if any.
    pub fn observe_stage_seconds(&self, stage: &str, seconds: f64) {
        match stage {
            "asr" => self.pipeline_transcribe_seconds.observe(seconds),
            "tts" => self.pipeline_tts_seconds.observe(seconds),
            "mixing" | "mux" => self.pipeline_mux_seconds.observe(seconds),
            _ => {}
        }
    }

    /// Prometheus text exposition of every registered collector.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
