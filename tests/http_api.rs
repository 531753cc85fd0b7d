use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use dubforge::api::{build_router, AppState};
use dubforge::dub_core::settings::AppSettings;

struct TestServer {
    router: Router,
    state: Arc<AppState>,
    _dir: tempfile::TempDir,
}

struct Session {
    cookies: String,
    csrf: String,
    access_token: String,
}

fn test_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = AppSettings::default();
    settings.app_root = dir.path().to_path_buf();
    settings.input_dir = dir.path().join("Input");
    settings.output_dir = dir.path().join("Output");
    settings.log_dir = dir.path().join("logs");
    settings.state_dir = dir.path().join("Output").join("_state");
    settings.admin_username = "root".to_string();
    settings.admin_password = "root-password".to_string();
    settings.upload_chunk_bytes = 4;
    settings.min_free_gb = 0;
    settings.quotas.max_upload_bytes = 1024 * 1024;
    // High enough that test chunk sequences never throttle.
    settings.chunk_rate_per_s = 1000;

    let state = dubforge::bootstrap(settings).unwrap();
    TestServer {
        router: build_router(state.clone()),
        state,
        _dir: dir,
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

fn extract_cookies(response: &axum::response::Response) -> String {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .collect::<Vec<_>>()
        .join("; ")
}

async fn login(server: &TestServer, username: &str, password: &str) -> Session {
    let response = server
        .router
        .clone()
        .oneshot(
            Request::post("/api/auth/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({ "username": username, "password": password }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK, "login should succeed");
    let cookies = extract_cookies(&response);
    let body = body_json(response).await;
    Session {
        cookies,
        csrf: body["csrf_token"].as_str().unwrap().to_string(),
        access_token: body["access_token"].as_str().unwrap().to_string(),
    }
}

fn authed_post(session: &Session, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::COOKIE, &session.cookies)
        .header("x-csrf-token", &session.csrf)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed_get(session: &Session, uri: &str) -> Request<Body> {
    Request::get(uri)
        .header(header::COOKIE, &session.cookies)
        .body(Body::empty())
        .unwrap()
}

/// Invite a fresh operator and return their session.
async fn invite_user(server: &TestServer, admin: &Session, username: &str) -> Session {
    let response = server
        .router
        .clone()
        .oneshot(authed_post(admin, "/api/invites", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let invite = body_json(response).await;
    let token = invite["invite_token"].as_str().unwrap();

    let response = server
        .router
        .clone()
        .oneshot(
            Request::post("/api/invites/redeem")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "token": token,
                        "username": username,
                        "password": "operator-password",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    login(server, username, "operator-password").await
}

#[tokio::test]
async fn unauthenticated_requests_get_401() {
    let server = test_server();
    let response = server
        .router
        .clone()
        .oneshot(Request::get("/api/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn csrf_is_required_for_cookie_authenticated_mutations() {
    let server = test_server();
    let session = login(&server, "root", "root-password").await;

    // Missing CSRF header on a cookie-authenticated POST: 403.
    let response = server
        .router
        .clone()
        .oneshot(
            Request::post("/api/uploads/init")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::COOKIE, &session.cookies)
                .body(Body::from(
                    serde_json::json!({ "filename": "a.mkv", "total_bytes": 8 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["reason"], "csrf");

    // Bearer-token requests bypass the cookie CSRF dance.
    let response = server
        .router
        .clone()
        .oneshot(
            Request::post("/api/uploads/init")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, format!("Bearer {}", session.access_token))
                .body(Body::from(
                    serde_json::json!({ "filename": "a.mkv", "total_bytes": 8 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn chunked_upload_flow_with_hash_mismatch() {
    let server = test_server();
    let session = login(&server, "root", "root-password").await;

    let response = server
        .router
        .clone()
        .oneshot(authed_post(
            &session,
            "/api/uploads/init",
            serde_json::json!({ "filename": "episode.mkv", "total_bytes": 8 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let init = body_json(response).await;
    let upload_id = init["upload_id"].as_str().unwrap().to_string();
    assert_eq!(init["chunk_bytes"], 4);
    assert_eq!(init["total_chunks"], 2);

    let chunk_req = |index: u64, offset: u64, data: &'static [u8], sha: String| {
        Request::post(format!(
            "/api/uploads/{upload_id}/chunk?index={index}&offset={offset}"
        ))
        .header(header::COOKIE, &session.cookies)
        .header("x-csrf-token", &session.csrf)
        .header("x-chunk-sha256", sha)
        .body(Body::from(data))
        .unwrap()
    };

    let response = server
        .router
        .clone()
        .oneshot(chunk_req(0, 0, b"aaaa", sha256_hex(b"aaaa")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Wrong hash on chunk 1: 409, nothing appended.
    let response = server
        .router
        .clone()
        .oneshot(chunk_req(1, 4, b"bbbb", sha256_hex(b"wrong")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = server
        .router
        .clone()
        .oneshot(authed_get(&session, &format!("/api/uploads/{upload_id}/status")))
        .await
        .unwrap();
    let status = body_json(response).await;
    assert_eq!(status["bytes_received"], 4);
    assert_eq!(status["next_expected_chunk"], 1);

    // Correct retry, then complete.
    let response = server
        .router
        .clone()
        .oneshot(chunk_req(1, 4, b"bbbb", sha256_hex(b"bbbb")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = server
        .router
        .clone()
        .oneshot(authed_post(
            &session,
            &format!("/api/uploads/{upload_id}/complete"),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let done = body_json(response).await;
    let video_path = done["video_path"].as_str().unwrap();
    assert_eq!(std::fs::read(video_path).unwrap(), b"aaaabbbb");
}

#[tokio::test]
async fn refresh_rotation_replay_revokes_all_sessions() {
    let server = test_server();
    let session = login(&server, "root", "root-password").await;
    let refresh_cookie = session
        .cookies
        .split("; ")
        .find(|cookie| cookie.starts_with("refresh="))
        .unwrap()
        .trim_start_matches("refresh=")
        .to_string();

    let refresh_with = |token: String| {
        Request::post("/api/auth/refresh")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({ "refresh_token": token }).to_string(),
            ))
            .unwrap()
    };

    // R1 -> R2.
    let response = server
        .router
        .clone()
        .oneshot(refresh_with(refresh_cookie.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = extract_cookies(&response);
    let r2 = rotated
        .split("; ")
        .find(|cookie| cookie.starts_with("refresh="))
        .unwrap()
        .trim_start_matches("refresh=")
        .to_string();
    assert_ne!(r2, refresh_cookie);

    // Replaying R1: 401 and the whole family dies.
    let response = server
        .router
        .clone()
        .oneshot(refresh_with(refresh_cookie))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = server.router.clone().oneshot(refresh_with(r2)).await.unwrap();
    assert_eq!(
        response.status(),
        StatusCode::UNAUTHORIZED,
        "replay must revoke the rotated sibling too"
    );
}

/// Seed a DONE job whose artifact lives under the output root.
fn seed_library_job(
    state: &AppState,
    id: &str,
    owner_id: &str,
    slug: &str,
    shared: bool,
) -> std::path::PathBuf {
    use dubforge::dub_core::domain::{
        DevicePref, Job, JobMode, JobState, Visibility,
    };

    let output_dir = state.layout.output_root.join(format!("ep-{id}"));
    std::fs::create_dir_all(output_dir.join("work")).unwrap();
    let artifact = output_dir.join("dub.mkv");
    std::fs::write(&artifact, (0u16..256).map(|b| b as u8).collect::<Vec<u8>>()).unwrap();

    let job = Job {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        video_path: format!("/in/{id}.mkv"),
        duration_s: 600.0,
        mode: JobMode::Medium,
        device: DevicePref::Cpu,
        src_lang: "ja".to_string(),
        tgt_lang: "en".to_string(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        state: JobState::Done,
        progress: 1.0,
        message: "Completed".to_string(),
        output_mkv: Some(artifact.to_string_lossy().into_owned()),
        output_srt: None,
        work_dir: output_dir.join("work").to_string_lossy().into_owned(),
        log_path: String::new(),
        error: None,
        series_title: "Show A".to_string(),
        series_slug: slug.to_string(),
        season_number: 1,
        episode_number: 1,
        visibility: if shared {
            Visibility::Shared
        } else {
            Visibility::Private
        },
        runtime: Default::default(),
    };
    state.jobs.put_job(&job).unwrap();
    artifact
}

#[tokio::test]
async fn range_streaming_serves_partial_and_full_bodies() {
    let server = test_server();
    let admin = login(&server, "root", "root-password").await;
    seed_library_job(&server.state, "j1", "someone-else", "show-a", true);

    let uri = "/files/ep-j1/dub.mkv";
    let ranged = Request::get(uri)
        .header(header::COOKIE, &admin.cookies)
        .header(header::RANGE, "bytes=0-99")
        .body(Body::empty())
        .unwrap();
    let response = server.router.clone().oneshot(ranged).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE].to_str().unwrap(),
        "bytes 0-99/256"
    );
    assert_eq!(
        response.headers()[header::CONTENT_LENGTH].to_str().unwrap(),
        "100"
    );
    assert_eq!(
        response.headers()[header::ACCEPT_RANGES].to_str().unwrap(),
        "bytes"
    );
    assert_eq!(body_bytes(response).await.len(), 100);

    // Suffix range.
    let response = server
        .router
        .clone()
        .oneshot(
            Request::get(uri)
                .header(header::COOKIE, &admin.cookies)
                .header(header::RANGE, "bytes=-50")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE].to_str().unwrap(),
        "bytes 206-255/256"
    );

    // No Range header: 200 with the full body.
    let response = server
        .router
        .clone()
        .oneshot(authed_get(&admin, uri))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await.len(), 256);

    // Unsatisfiable.
    let response = server
        .router
        .clone()
        .oneshot(
            Request::get(uri)
                .header(header::COOKIE, &admin.cookies)
                .header(header::RANGE, "bytes=999-")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    // Path traversal is refused outright.
    let response = server
        .router
        .clone()
        .oneshot(authed_get(&admin, "/files/..%2F..%2Fetc%2Fpasswd"))
        .await
        .unwrap();
    assert_ne!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn visibility_gates_library_and_file_access() {
    let server = test_server();
    let admin = login(&server, "root", "root-password").await;
    let user_b = invite_user(&server, &admin, "bob").await;

    // user_a == admin here would bypass checks, so own the job as a third id.
    seed_library_job(&server.state, "j1", "user-a", "show-a", false);

    // Private: user B gets 403 on the season listing and the file.
    let response = server
        .router
        .clone()
        .oneshot(authed_get(&user_b, "/api/library/show-a/seasons"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = server
        .router
        .clone()
        .oneshot(authed_get(&user_b, "/files/ep-j1/dub.mkv"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Admin toggles the job shared; user B can now browse and stream.
    let response = server
        .router
        .clone()
        .oneshot(authed_post(
            &admin,
            "/api/jobs/j1/visibility",
            serde_json::json!({ "visibility": "shared" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = server
        .router
        .clone()
        .oneshot(authed_get(&user_b, "/api/library/show-a/seasons"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["seasons"], serde_json::json!([1]));

    let response = server
        .router
        .clone()
        .oneshot(authed_get(&user_b, "/files/ep-j1/dub.mkv"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Back to private: 403 again, same as never-shared.
    let response = server
        .router
        .clone()
        .oneshot(authed_post(
            &admin,
            "/api/jobs/j1/visibility",
            serde_json::json!({ "visibility": "private" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = server
        .router
        .clone()
        .oneshot(authed_get(&user_b, "/api/library/show-a/seasons"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn job_create_requires_a_completed_owned_upload() {
    let server = test_server();
    let session = login(&server, "root", "root-password").await;

    let response = server
        .router
        .clone()
        .oneshot(authed_post(
            &session,
            "/api/uploads/init",
            serde_json::json!({ "filename": "show.mkv", "total_bytes": 4 }),
        ))
        .await
        .unwrap();
    let upload_id = body_json(response).await["upload_id"]
        .as_str()
        .unwrap()
        .to_string();

    let job_body = serde_json::json!({
        "upload_id": upload_id,
        "src_lang": "ja",
        "tgt_lang": "en",
        "mode": "low",
        "series_title": "Show B",
        "season_number": 1,
        "episode_number": 3,
    });

    // Incomplete upload: 409.
    let response = server
        .router
        .clone()
        .oneshot(authed_post(&session, "/api/jobs", job_body.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let chunk = Request::post(format!("/api/uploads/{upload_id}/chunk?index=0&offset=0"))
        .header(header::COOKIE, &session.cookies)
        .header("x-csrf-token", &session.csrf)
        .header("x-chunk-sha256", sha256_hex(b"mkv!"))
        .body(Body::from(&b"mkv!"[..]))
        .unwrap();
    assert_eq!(
        server.router.clone().oneshot(chunk).await.unwrap().status(),
        StatusCode::OK
    );
    let response = server
        .router
        .clone()
        .oneshot(authed_post(
            &session,
            &format!("/api/uploads/{upload_id}/complete"),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = server
        .router
        .clone()
        .oneshot(authed_post(&session, "/api/jobs", job_body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let job_id = created["job_id"].as_str().unwrap().to_string();
    assert_eq!(created["state"], "QUEUED");

    // Detail is visible to the owner and carries the derived series slug.
    let response = server
        .router
        .clone()
        .oneshot(authed_get(&session, &format!("/api/jobs/{job_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let detail = body_json(response).await;
    assert_eq!(detail["series_slug"], "show-b");
    assert!(detail["files"].is_object());
    assert!(detail["progress"].is_number());
}

#[tokio::test]
async fn admin_queue_requires_the_admin_role() {
    let server = test_server();
    let admin = login(&server, "root", "root-password").await;
    let operator = invite_user(&server, &admin, "carol").await;

    let response = server
        .router
        .clone()
        .oneshot(authed_get(&operator, "/api/admin/queue"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = server
        .router
        .clone()
        .oneshot(authed_get(&admin, "/api/admin/queue"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["scheduler"]["max_global"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn metrics_endpoint_exposes_pipeline_series() {
    let server = test_server();
    let response = server
        .router
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("jobs_queued_total"));
    assert!(body.contains("pipeline_transcribe_seconds_bucket"));
}

#[tokio::test]
async fn api_key_round_trip_authenticates_with_scopes() {
    let server = test_server();
    let session = login(&server, "root", "root-password").await;

    let response = server
        .router
        .clone()
        .oneshot(authed_post(
            &session,
            "/api/keys",
            serde_json::json!({ "scopes": ["read:job", "submit:job"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let api_key = created["api_key"].as_str().unwrap().to_string();
    assert!(api_key.starts_with("dp_"));

    // X-Api-Key works without any cookies or CSRF.
    let response = server
        .router
        .clone()
        .oneshot(
            Request::get("/api/jobs")
                .header("x-api-key", &api_key)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // And as Authorization: Bearer dp_…
    let response = server
        .router
        .clone()
        .oneshot(
            Request::post("/api/uploads/init")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, format!("Bearer {api_key}"))
                .body(Body::from(
                    serde_json::json!({ "filename": "b.mkv", "total_bytes": 8 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // A bogus key with the right shape is rejected.
    let response = server
        .router
        .clone()
        .oneshot(
            Request::get("/api/jobs")
                .header("x-api-key", "dp_0123456789_forgedsecret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
