//! HTTP surface: axum router over the orchestration core.

mod error;
mod extract;
mod range;
mod routes_admin;
mod routes_auth;
mod routes_files;
mod routes_jobs;
mod routes_library;
mod routes_uploads;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dub_core::audit::Audit;
use crate::dub_core::auth::AuthService;
use crate::dub_core::engine::Engine;
use crate::dub_core::metrics::Metrics;
use crate::dub_core::paths::Layout;
use crate::dub_core::quotas::QuotaService;
use crate::dub_core::settings::AppSettings;
use crate::dub_core::store::JobStore;
use crate::dub_core::uploads::UploadService;

pub use error::ApiError;

/// Shared state for every handler; built once in the composition root.
pub struct AppState {
    pub settings: Arc<AppSettings>,
    pub layout: Layout,
    pub auth: Arc<AuthService>,
    pub jobs: Arc<JobStore>,
    pub engine: Engine,
    pub uploads: Arc<UploadService>,
    pub quotas: Arc<QuotaService>,
    pub metrics: Arc<Metrics>,
    pub audit: Arc<Audit>,
}

/// Build a Set-Cookie header value with the service's cookie policy.
pub(crate) fn build_cookie(
    state: &AppState,
    name: &str,
    value: &str,
    http_only: bool,
    max_age_s: i64,
) -> String {
    let mut cookie = format!("{name}={value}; Path=/; SameSite=Lax; Max-Age={max_age_s}");
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if state.settings.cookie_secure {
        cookie.push_str("; Secure");
    }
    cookie
}

async fn metrics_handler(
    state: axum::extract::State<Arc<AppState>>,
) -> ([(axum::http::HeaderName, &'static str); 1], String) {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        state.metrics.render(),
    )
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Auth
        .route("/api/auth/login", post(routes_auth::login))
        .route("/api/auth/refresh", post(routes_auth::refresh))
        .route("/api/auth/logout", post(routes_auth::logout))
        .route("/api/invites", post(routes_auth::create_invite))
        .route("/api/invites/redeem", post(routes_auth::redeem_invite))
        .route(
            "/api/keys",
            post(routes_auth::create_api_key).get(routes_auth::list_api_keys),
        )
        // Uploads
        .route("/api/uploads/init", post(routes_uploads::init))
        .route("/api/uploads/{id}/chunk", post(routes_uploads::chunk))
        .route("/api/uploads/{id}/complete", post(routes_uploads::complete))
        .route("/api/uploads/{id}/status", get(routes_uploads::status))
        // Jobs
        .route("/api/jobs", post(routes_jobs::create).get(routes_jobs::list))
        .route(
            "/api/jobs/{id}",
            get(routes_jobs::detail).delete(routes_jobs::remove),
        )
        .route("/api/jobs/{id}/cancel", post(routes_jobs::cancel))
        .route("/api/jobs/{id}/pause", post(routes_jobs::pause))
        .route("/api/jobs/{id}/resume", post(routes_jobs::resume))
        .route("/api/jobs/{id}/visibility", post(routes_jobs::visibility))
        .route("/api/jobs/{id}/files", get(routes_jobs::files))
        .route("/api/jobs/{id}/logs/tail", get(routes_jobs::logs_tail))
        .route("/api/jobs/{id}/logs/stream", get(routes_jobs::logs_stream))
        .route(
            "/api/jobs/{id}/qa",
            get(routes_jobs::qa_list).post(routes_jobs::qa_update),
        )
        // Library
        .route("/api/library/search", get(routes_library::search))
        .route("/api/library/recent", get(routes_library::recent))
        .route("/api/library/continue", get(routes_library::continue_watching))
        .route("/api/library/series", get(routes_library::series))
        .route(
            "/api/library/{series}/seasons",
            get(routes_library::seasons),
        )
        .route(
            "/api/library/{series}/{season}/episodes",
            get(routes_library::episodes),
        )
        .route(
            "/api/library/{series}/voices",
            get(routes_library::voices).post(routes_library::add_voice),
        )
        // Files
        .route("/files/{*path}", get(routes_files::serve))
        // Admin
        .route("/api/admin/queue", get(routes_admin::queue))
        .route("/api/admin/status", get(routes_admin::status))
        .route("/api/admin/jobs/{id}/priority", post(routes_admin::priority))
        .route("/api/admin/jobs/{id}/cancel", post(routes_admin::cancel))
        .route(
            "/api/admin/jobs/{id}/visibility",
            post(routes_admin::visibility),
        )
        // Observability
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until shutdown; binds the configured address.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = state.settings.bind_addr.clone();
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}
