//! dubforge: a multi-tenant media dubbing orchestrator.
//!
//! The library exposes the orchestration core (`dub_core`), the HTTP surface
//! (`api`), and a composition root that wires them together. The `dubforged`
//! binary is a thin wrapper around [`bootstrap`] plus the hidden
//! stage-worker entry point.

pub mod api;
pub mod dub_core;
pub(crate) mod sync_ext;
pub mod system_metrics;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::api::AppState;
use crate::dub_core::audit::Audit;
use crate::dub_core::auth::AuthService;
use crate::dub_core::engine::{Engine, EngineDeps};
use crate::dub_core::metrics::Metrics;
use crate::dub_core::net_policy::EgressPolicy;
use crate::dub_core::notify::Notifier;
use crate::dub_core::paths::Layout;
use crate::dub_core::quotas::QuotaService;
use crate::dub_core::redis_queue::RedisQueueAdapter;
use crate::dub_core::settings::AppSettings;
use crate::dub_core::store::{AuthStore, JobStore};
use crate::dub_core::uploads::UploadService;

/// Build every shared service from settings and wire them together. This is
/// the only place the object graph is assembled; everything downstream takes
/// its dependencies explicitly.
pub fn bootstrap(settings: AppSettings) -> Result<Arc<AppState>> {
    let settings = Arc::new(settings);
    let layout = Layout::new(
        settings.output_dir.clone(),
        settings.input_dir.clone(),
        settings.log_dir.clone(),
        settings.state_dir.clone(),
    );
    std::fs::create_dir_all(&layout.output_root).context("create output root")?;
    std::fs::create_dir_all(&layout.input_root).context("create input root")?;
    std::fs::create_dir_all(&layout.log_root).context("create log root")?;

    let auth_store = Arc::new(
        AuthStore::open(&settings.state_dir.join("auth.db")).context("open auth store")?,
    );
    let job_store =
        Arc::new(JobStore::open(&settings.state_dir.join("jobs.db")).context("open job store")?);

    let metrics = Arc::new(Metrics::new());
    let audit = Arc::new(Audit::new(layout.clone()));
    let policy = EgressPolicy::from_settings(&settings);
    let notifier = Arc::new(Notifier::new(
        settings.ntfy.clone(),
        policy,
        audit.clone(),
    ));

    let auth = Arc::new(AuthService::new(auth_store.clone(), settings.clone()));
    if let Err(err) = auth.bootstrap_admin() {
        tracing::warn!(error = %err, "admin bootstrap failed");
    }

    let quotas = Arc::new(QuotaService::new(
        settings.clone(),
        auth_store,
        job_store.clone(),
    ));
    let uploads = Arc::new(UploadService::new(
        settings.clone(),
        layout.clone(),
        job_store.clone(),
        quotas.clone(),
    ));

    let adapter = RedisQueueAdapter::from_settings(&settings).map(Arc::new);
    if let Some(adapter) = &adapter {
        if adapter.probe() {
            tracing::info!("distributed queue backend reachable");
        } else {
            tracing::warn!("distributed queue backend unreachable; starting in fallback mode");
        }
    }

    let engine = Engine::start(EngineDeps {
        settings: settings.clone(),
        layout: layout.clone(),
        store: job_store.clone(),
        quotas: quotas.clone(),
        metrics: metrics.clone(),
        audit: audit.clone(),
        notifier,
        adapter,
    });

    crate::dub_core::retention::spawn_sweeper(
        settings.clone(),
        layout.clone(),
        job_store.clone(),
        auth.clone(),
    );

    Ok(Arc::new(AppState {
        settings,
        layout,
        auth,
        jobs: job_store,
        engine,
        uploads,
        quotas,
        metrics,
        audit,
    }))
}
