//! End-to-end tests over the real router: browser session, device-login
//! exchange, token refresh, cluster registration, and agent heartbeats, all
//! against a temp-file SQLite database.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use migration::MigratorTrait;
use sea_orm::{Database, DatabaseConnection};
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tower::util::ServiceExt;
use trellis::settings::Settings;
use trellis::web::{router, AppState};

struct TestApp {
    router: Router,
    _temp_file: NamedTempFile,
}

impl TestApp {
    async fn spawn() -> Self {
        Self::spawn_with(|settings| {
            settings.auth.jwt_secret = Some("integration-test-secret".to_string());
        })
        .await
    }

    async fn spawn_with(configure: impl FnOnce(&mut Settings)) -> Self {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        let db: DatabaseConnection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");
        migration::Migrator::up(&db, None)
            .await
            .expect("Failed to run migrations");

        let mut settings = Settings::default();
        settings.server.allow_public_registration = true;
        configure(&mut settings);

        Self {
            router: router(AppState::new(settings, db)),
            _temp_file: temp_file,
        }
    }

    async fn request(&self, req: Request<Body>) -> (StatusCode, Value, Response<()>) {
        let response = self
            .router
            .clone()
            .oneshot(req)
            .await
            .expect("Request failed");
        let (parts, body) = response.into_parts();
        let bytes = body.collect().await.expect("Failed to read body").to_bytes();
        let json: Value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (parts.status, json, Response::from_parts(parts, ()))
    }

    async fn post_json(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::post(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, json, _) = self.request(req).await;
        (status, json)
    }

    async fn post_json_with_cookie(
        &self,
        path: &str,
        cookie: &str,
        body: Value,
    ) -> (StatusCode, Value) {
        let req = Request::post(path)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::COOKIE, cookie)
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, json, _) = self.request(req).await;
        (status, json)
    }

    async fn post_json_with_bearer(
        &self,
        path: &str,
        token: &str,
        body: Value,
    ) -> (StatusCode, Value) {
        let req = Request::post(path)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, json, _) = self.request(req).await;
        (status, json)
    }

    async fn get_with_bearer(&self, path: &str, token: &str) -> (StatusCode, Value) {
        let req = Request::get(path)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let (status, json, _) = self.request(req).await;
        (status, json)
    }

    /// Register a user and log in; returns the session cookie pair.
    async fn login(&self, email: &str) -> String {
        let (status, _) = self
            .post_json(
                "/api/auth/signup",
                json!({"email": email, "password": "hunter2hunter2"}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let req = Request::post("/api/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"email": email, "password": "hunter2hunter2"}).to_string(),
            ))
            .unwrap();
        let (status, _, response) = self.request(req).await;
        assert_eq!(status, StatusCode::OK);

        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .expect("No session cookie set")
            .to_str()
            .expect("Bad cookie header");
        set_cookie
            .split(';')
            .next()
            .expect("Empty cookie header")
            .to_string()
    }

    /// Approve a device code from the browser session and exchange it from
    /// the CLI side; returns the exchange response body.
    async fn approve_and_exchange(&self, cookie: &str, device_code: &str) -> Value {
        let (status, body) = self
            .post_json_with_cookie(
                "/api/auth/cli/generate",
                cookie,
                json!({"device_code": device_code}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));

        let (status, body) = self
            .post_json("/api/auth/cli/exchange", json!({"device_code": device_code}))
            .await;
        assert_eq!(status, StatusCode::OK);
        body
    }
}

// ============================================================================
// Device-login flow
// ============================================================================

#[tokio::test]
async fn test_exchange_before_approval_is_pending() {
    let app = TestApp::spawn().await;

    let (status, body) = app
        .post_json("/api/auth/cli/exchange", json!({"device_code": "cli-code-1"}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("Authentication pending or not found"));
}

#[tokio::test]
async fn test_generate_requires_session() {
    let app = TestApp::spawn().await;

    let (status, body) = app
        .post_json("/api/auth/cli/generate", json!({"device_code": "cli-code-1"}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("Unauthorized"));
}

#[tokio::test]
async fn test_generate_missing_device_code() {
    let app = TestApp::spawn().await;
    let cookie = app.login("dev@example.com").await;

    let (status, body) = app
        .post_json_with_cookie("/api/auth/cli/generate", &cookie, json!({}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("Missing device_code"));
}

#[tokio::test]
async fn test_exchange_missing_device_code() {
    let app = TestApp::spawn().await;

    let (status, body) = app.post_json("/api/auth/cli/exchange", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("Missing device_code"));
}

#[tokio::test]
async fn test_device_login_exchange_happy_path() {
    let app = TestApp::spawn().await;
    let cookie = app.login("dev@example.com").await;

    let body = app.approve_and_exchange(&cookie, "cli-code-1").await;
    assert!(body["access_token"].as_str().is_some_and(|t| !t.is_empty()));
    assert!(body["refresh_token"].as_str().is_some_and(|t| !t.is_empty()));
    assert_eq!(body["user_email"], json!("dev@example.com"));
    // No provider linked, so no passthrough token
    assert!(body.get("provider_token").is_none());
}

#[tokio::test]
async fn test_exchange_is_single_use() {
    let app = TestApp::spawn().await;
    let cookie = app.login("dev@example.com").await;

    app.approve_and_exchange(&cookie, "cli-code-1").await;

    let (status, body) = app
        .post_json("/api/auth/cli/exchange", json!({"device_code": "cli-code-1"}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("Authentication pending or not found"));
}

#[tokio::test]
async fn test_access_token_authorizes_cli_endpoints() {
    let app = TestApp::spawn().await;
    let cookie = app.login("dev@example.com").await;

    let body = app.approve_and_exchange(&cookie, "cli-code-1").await;
    let access_token = body["access_token"].as_str().unwrap();

    let (status, body) = app.get_with_bearer("/api/cli/clusters", access_token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["clusters"], json!([]));
}

// ============================================================================
// Refresh flow
// ============================================================================

#[tokio::test]
async fn test_refresh_missing_token() {
    let app = TestApp::spawn().await;

    let (status, body) = app.post_json("/api/auth/cli/refresh", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("Missing refresh_token"));
}

#[tokio::test]
async fn test_refresh_mints_new_access_token() {
    let app = TestApp::spawn().await;
    let cookie = app.login("dev@example.com").await;

    let body = app.approve_and_exchange(&cookie, "cli-code-1").await;
    let refresh_token = body["refresh_token"].as_str().unwrap();

    let (status, body) = app
        .post_json("/api/auth/cli/refresh", json!({"refresh_token": refresh_token}))
        .await;
    assert_eq!(status, StatusCode::OK);

    // The minted access token works against a bearer endpoint
    let access_token = body["access_token"].as_str().unwrap();
    let (status, _) = app.get_with_bearer("/api/cli/clusters", access_token).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_refresh_rejects_access_token() {
    let app = TestApp::spawn().await;
    let cookie = app.login("dev@example.com").await;

    let body = app.approve_and_exchange(&cookie, "cli-code-1").await;
    let access_token = body["access_token"].as_str().unwrap();

    let (status, body) = app
        .post_json("/api/auth/cli/refresh", json!({"refresh_token": access_token}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("Invalid token type"));
}

#[tokio::test]
async fn test_refresh_rejects_garbage_token() {
    let app = TestApp::spawn().await;

    let (status, body) = app
        .post_json("/api/auth/cli/refresh", json!({"refresh_token": "not-a-jwt"}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("Invalid refresh token"));
}

#[tokio::test]
async fn test_refresh_token_rejected_as_bearer() {
    let app = TestApp::spawn().await;
    let cookie = app.login("dev@example.com").await;

    let body = app.approve_and_exchange(&cookie, "cli-code-1").await;
    let refresh_token = body["refresh_token"].as_str().unwrap();

    let (status, body) = app.get_with_bearer("/api/cli/clusters", refresh_token).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("Unauthorized: Invalid token type"));
}

// ============================================================================
// Provider token passthrough
// ============================================================================

#[tokio::test]
async fn test_provider_token_passthrough() {
    let app = TestApp::spawn().await;
    let cookie = app.login("dev@example.com").await;

    let (status, body) = app
        .post_json_with_cookie(
            "/api/account/providers",
            &cookie,
            json!({"provider": "github", "access_token": "gho_abc123"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));

    let (status, _) = app
        .post_json_with_cookie(
            "/api/auth/cli/generate",
            &cookie,
            json!({"device_code": "cli-code-1", "provider": "github"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .post_json("/api/auth/cli/exchange", json!({"device_code": "cli-code-1"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider_token"], json!("gho_abc123"));
}

#[tokio::test]
async fn test_unsupported_provider_rejected() {
    let app = TestApp::spawn().await;
    let cookie = app.login("dev@example.com").await;

    let (status, body) = app
        .post_json_with_cookie(
            "/api/account/providers",
            &cookie,
            json!({"provider": "sourcehut", "access_token": "tok"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("Unsupported provider"));

    let (status, body) = app
        .post_json_with_cookie(
            "/api/auth/cli/generate",
            &cookie,
            json!({"device_code": "cli-code-1", "provider": "sourcehut"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("Unsupported provider"));
}

// ============================================================================
// Cluster registration & heartbeat
// ============================================================================

async fn cli_access_token(app: &TestApp) -> String {
    let cookie = app.login("dev@example.com").await;
    let body = app.approve_and_exchange(&cookie, "cli-code-1").await;
    body["access_token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_register_cluster_requires_name() {
    let app = TestApp::spawn().await;
    let token = cli_access_token(&app).await;

    let (status, body) = app
        .post_json_with_bearer("/api/cli/clusters", &token, json!({}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("Cluster name is required"));
}

#[tokio::test]
async fn test_register_cluster_returns_credentials_once() {
    let app = TestApp::spawn().await;
    let token = cli_access_token(&app).await;

    let (status, body) = app
        .post_json_with_bearer(
            "/api/cli/clusters",
            &token,
            json!({"name": "prod", "region": "eu-west-1", "vpc_id": "vpc-0abc"}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let cluster_id = body["cluster_id"].as_str().expect("No cluster_id");
    assert!(uuid::Uuid::parse_str(cluster_id).is_ok());

    let agent_token = body["agent_token"].as_str().expect("No agent_token");
    assert_eq!(agent_token.len(), 64);
    assert!(agent_token.chars().all(|c| c.is_ascii_hexdigit()));

    // The raw token (and its hash) never appear in any read operation
    let (status, body) = app.get_with_bearer("/api/cli/clusters", &token).await;
    assert_eq!(status, StatusCode::OK);
    let clusters = body["clusters"].as_array().expect("No clusters array");
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0]["id"], json!(cluster_id));
    assert_eq!(clusters[0]["name"], json!("prod"));
    assert_eq!(clusters[0]["status"], json!("PENDING"));
    assert_eq!(clusters[0]["metadata"]["region"], json!("eu-west-1"));
    assert!(clusters[0].get("agent_token").is_none());
    assert!(clusters[0].get("agent_token_hash").is_none());
    let listed = serde_json::to_string(&body).unwrap();
    assert!(!listed.contains(agent_token));
}

#[tokio::test]
async fn test_clusters_scoped_to_owner() {
    let app = TestApp::spawn().await;

    let cookie = app.login("alice@example.com").await;
    let body = app.approve_and_exchange(&cookie, "alice-code").await;
    let alice_token = body["access_token"].as_str().unwrap().to_string();

    let cookie = app.login("bob@example.com").await;
    let body = app.approve_and_exchange(&cookie, "bob-code").await;
    let bob_token = body["access_token"].as_str().unwrap().to_string();

    let (status, _) = app
        .post_json_with_bearer("/api/cli/clusters", &alice_token, json!({"name": "alice-prod"}))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, body) = app.get_with_bearer("/api/cli/clusters", &bob_token).await;
    assert_eq!(body["clusters"], json!([]));

    let (_, body) = app.get_with_bearer("/api/cli/clusters", &alice_token).await;
    assert_eq!(body["clusters"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cluster_endpoints_require_bearer() {
    let app = TestApp::spawn().await;

    let req = Request::get("/api/cli/clusters").body(Body::empty()).unwrap();
    let (status, body, _) = app.request(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("Unauthorized: Missing token"));

    let (status, body) = app.get_with_bearer("/api/cli/clusters", "garbage").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("Unauthorized: Invalid token"));
}

#[tokio::test]
async fn test_heartbeat_marks_cluster_online() {
    let app = TestApp::spawn().await;
    let token = cli_access_token(&app).await;

    let (_, body) = app
        .post_json_with_bearer("/api/cli/clusters", &token, json!({"name": "prod"}))
        .await;
    let cluster_id = body["cluster_id"].as_str().unwrap().to_string();
    let agent_token = body["agent_token"].as_str().unwrap().to_string();

    let req = Request::post("/api/agent/heartbeat")
        .header("X-Cluster-ID", cluster_id.as_str())
        .header("X-Agent-Token", agent_token.as_str())
        .body(Body::empty())
        .unwrap();
    let (status, body, _) = app.request(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));

    let (_, body) = app.get_with_bearer("/api/cli/clusters", &token).await;
    let cluster = &body["clusters"][0];
    assert_eq!(cluster["status"], json!("ONLINE"));
    let beat = cluster["last_heartbeat"].as_i64().expect("No last_heartbeat");
    assert!((chrono::Utc::now().timestamp() - beat).abs() < 5);
}

#[tokio::test]
async fn test_heartbeat_missing_headers() {
    let app = TestApp::spawn().await;

    let req = Request::post("/api/agent/heartbeat").body(Body::empty()).unwrap();
    let (status, body, _) = app.request(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("Missing X-Cluster-ID or X-Agent-Token"));
}

#[tokio::test]
async fn test_heartbeat_rejections_are_indistinguishable() {
    let app = TestApp::spawn().await;
    let token = cli_access_token(&app).await;

    let (_, body) = app
        .post_json_with_bearer("/api/cli/clusters", &token, json!({"name": "prod"}))
        .await;
    let cluster_id = body["cluster_id"].as_str().unwrap().to_string();

    // Wrong token for a real cluster
    let req = Request::post("/api/agent/heartbeat")
        .header("X-Cluster-ID", cluster_id.as_str())
        .header("X-Agent-Token", "0".repeat(64))
        .body(Body::empty())
        .unwrap();
    let (status, wrong_token_body, _) = app.request(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Real-looking token for a nonexistent cluster
    let req = Request::post("/api/agent/heartbeat")
        .header("X-Cluster-ID", "00000000-0000-0000-0000-000000000000")
        .header("X-Agent-Token", "0".repeat(64))
        .body(Body::empty())
        .unwrap();
    let (status, missing_cluster_body, _) = app.request(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Same error shape either way: no enumeration signal
    assert_eq!(wrong_token_body, missing_cluster_body);
    assert_eq!(
        wrong_token_body["error"],
        json!("Invalid cluster ID or agent token")
    );

    // And the failed attempts left the cluster untouched
    let (_, body) = app.get_with_bearer("/api/cli/clusters", &token).await;
    assert_eq!(body["clusters"][0]["status"], json!("PENDING"));
}

// ============================================================================
// Configuration errors
// ============================================================================

#[tokio::test]
async fn test_missing_signing_secret_is_a_500() {
    let app = TestApp::spawn_with(|settings| {
        settings.auth.jwt_secret = None;
    })
    .await;
    let cookie = app.login("dev@example.com").await;

    let (status, _) = app
        .post_json_with_cookie(
            "/api/auth/cli/generate",
            &cookie,
            json!({"device_code": "cli-code-1"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .post_json("/api/auth/cli/exchange", json!({"device_code": "cli-code-1"}))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], json!("Internal server configuration error"));

    let (status, body) = app
        .post_json("/api/auth/cli/refresh", json!({"refresh_token": "anything"}))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], json!("Internal server configuration error"));
}

#[tokio::test]
async fn test_signup_disabled_by_default() {
    let app = TestApp::spawn_with(|settings| {
        settings.server.allow_public_registration = false;
        settings.auth.jwt_secret = Some("integration-test-secret".to_string());
    })
    .await;

    let (status, _) = app
        .post_json(
            "/api/auth/signup",
            json!({"email": "dev@example.com", "password": "hunter2hunter2"}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
