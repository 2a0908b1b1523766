//! HTTP surface for the platform configurator backend: browser session
//! endpoints, the CLI device-login broker, and the cluster credential /
//! liveness service. Handlers are stateless; every failure is converted to
//! an HTTP status plus an `{error: string}` body right here, and internal
//! detail never crosses the wire on auth-sensitive paths.
use crate::provider::GitProvider;
use crate::session::SessionCookie;
use crate::settings::Settings;
use crate::storage;
use crate::tokens::{CliClaims, CliTokenSigner, TokenType, TokenVerifyError};
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub signer: Option<Arc<CliTokenSigner>>,
}

impl AppState {
    pub fn new(settings: Settings, db: DatabaseConnection) -> Self {
        let signer = CliTokenSigner::from_settings(&settings.auth).map(Arc::new);
        Self {
            settings: Arc::new(settings),
            db,
            signer,
        }
    }
}

// Security headers middleware
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    // X-Frame-Options: Prevent clickjacking
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );

    // X-Content-Type-Options: Prevent MIME sniffing
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );

    // Content-Security-Policy: API-only surface, lock everything down
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );

    // Referrer-Policy: Control referrer information
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    response
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/cli/generate", post(cli_generate))
        .route("/api/auth/cli/exchange", post(cli_exchange))
        .route("/api/auth/cli/refresh", post(cli_refresh))
        .route("/api/account/providers", post(link_provider))
        .route(
            "/api/cli/clusters",
            post(register_cluster).get(list_clusters),
        )
        .route("/api/agent/heartbeat", post(agent_heartbeat));

    // Conditionally add public registration route
    if state.settings.server.allow_public_registration {
        tracing::info!("Public user registration is ENABLED");
        router = router.route("/api/auth/signup", post(signup));
    } else {
        tracing::info!("Public user registration is DISABLED - provision accounts directly");
    }

    router
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

pub async fn serve(settings: Settings, db: DatabaseConnection) -> miette::Result<()> {
    // NOTE: Rate limiting should be implemented at the reverse proxy level
    // (nginx, traefik, etc.) for production deployments. Suggested limits:
    // - Exchange endpoint: 30 req/min per IP (the CLI polls it)
    // - Login endpoint: 5 attempts/min per IP
    let state = AppState::new(settings, db);

    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let app = router(state);

    tracing::info!(%addr, "API listening");
    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    axum::serve(listener, app).await.into_diagnostic()?;
    Ok(())
}

/// Resolve the browser session for session-authenticated endpoints.
async fn require_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<storage::Session, Response> {
    let cookie = match SessionCookie::from_headers(headers) {
        Some(c) => c,
        None => {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Unauthorized"})),
            )
                .into_response())
        }
    };

    match storage::get_session(&state.db, &cookie.session_id).await {
        Ok(Some(session)) => Ok(session),
        Ok(None) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Unauthorized"})),
        )
            .into_response()),
        Err(e) => {
            tracing::error!("Session lookup failed: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal Server Error"})),
            )
                .into_response())
        }
    }
}

/// Verify the bearer access token on CLI-facing endpoints and return its
/// claims. All verification failures come back as ready-made 401 responses;
/// a missing signing secret is the one 500.
async fn require_cli_user(state: &AppState, headers: &HeaderMap) -> Result<CliClaims, Response> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    let token = match token {
        Some(t) => t,
        None => {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Unauthorized: Missing token"})),
            )
                .into_response())
        }
    };

    let signer = match &state.signer {
        Some(s) => s,
        None => {
            tracing::error!("CLI JWT secret is not configured");
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal server configuration error"})),
            )
                .into_response());
        }
    };

    match signer.verify(token, TokenType::Access) {
        Ok(claims) => Ok(claims),
        Err(TokenVerifyError::WrongType) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Unauthorized: Invalid token type"})),
        )
            .into_response()),
        Err(TokenVerifyError::Invalid(detail)) => {
            tracing::debug!("Rejected CLI token: {}", detail);
            Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Unauthorized: Invalid token"})),
            )
                .into_response())
        }
    }
}

// Browser session endpoints

#[derive(Debug, Deserialize)]
struct SignupRequest {
    email: Option<String>,
    password: Option<String>,
}

async fn signup(State(state): State<AppState>, Json(req): Json<SignupRequest>) -> Response {
    let (email, password) = match (req.email, req.password) {
        (Some(e), Some(p)) if !e.is_empty() && !p.is_empty() => (e, p),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Missing email or password"})),
            )
                .into_response()
        }
    };

    match storage::create_user(&state.db, &email, &password).await {
        Ok(_) => (StatusCode::CREATED, Json(json!({"success": true}))).into_response(),
        Err(e) => {
            tracing::warn!("Failed to create user: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Failed to create user"})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: Option<String>,
    password: Option<String>,
}

async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Response {
    let (email, password) = match (req.email, req.password) {
        (Some(e), Some(p)) => (e, p),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Missing email or password"})),
            )
                .into_response()
        }
    };

    let subject = match storage::verify_user_password(&state.db, &email, &password).await {
        Ok(Some(sub)) => sub,
        Ok(None) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Invalid email or password"})),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("Login failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal Server Error"})),
            )
                .into_response();
        }
    };

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(String::from);

    let session = match storage::create_session(&state.db, &subject, 3600, user_agent, None).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to create session: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal Server Error"})),
            )
                .into_response();
        }
    };

    let cookie = SessionCookie::new(session.session_id);
    Response::builder()
        .status(StatusCode::OK)
        .header(
            axum::http::header::SET_COOKIE,
            cookie.to_cookie_header(&state.settings),
        )
        .header(axum::http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"success":true}"#))
        .unwrap()
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(cookie) = SessionCookie::from_headers(&headers) {
        let _ = storage::delete_session(&state.db, &cookie.session_id).await;
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(
            axum::http::header::SET_COOKIE,
            SessionCookie::delete_cookie_header(),
        )
        .header(axum::http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"success":true}"#))
        .unwrap()
}

#[derive(Debug, Deserialize)]
struct LinkProviderRequest {
    provider: Option<String>,
    access_token: Option<String>,
}

async fn link_provider(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LinkProviderRequest>,
) -> Response {
    let session = match require_session(&state, &headers).await {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    let (provider, access_token) = match (req.provider, req.access_token) {
        (Some(p), Some(t)) if !t.is_empty() => (p, t),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Missing provider or access_token"})),
            )
                .into_response()
        }
    };

    let provider: GitProvider = match provider.parse() {
        Ok(p) => p,
        Err(()) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Unsupported provider"})),
            )
                .into_response()
        }
    };

    match storage::upsert_provider_token(&state.db, &session.subject, provider, &access_token).await
    {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(e) => {
            tracing::error!("Failed to link provider token: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal Server Error"})),
            )
                .into_response()
        }
    }
}

// CLI device-login broker

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    device_code: Option<String>,
    provider: Option<String>,
}

/// POST /api/auth/cli/generate - approve a device login from the browser
/// session. Idempotent: re-approval overwrites the owner.
async fn cli_generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GenerateRequest>,
) -> Response {
    let session = match require_session(&state, &headers).await {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    let device_code = match req.device_code {
        Some(c) if !c.is_empty() => c,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Missing device_code"})),
            )
                .into_response()
        }
    };

    // Snapshot the linked provider token so the CLI can pick it up on
    // exchange. An unknown provider string is a client error, not a silent
    // skip.
    let verification_code = match req.provider.as_deref() {
        Some(p) => {
            let provider: GitProvider = match p.parse() {
                Ok(p) => p,
                Err(()) => {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"error": "Unsupported provider"})),
                    )
                        .into_response()
                }
            };
            match storage::get_provider_token(&state.db, &session.subject, provider).await {
                Ok(token) => token,
                Err(e) => {
                    tracing::error!("Error saving CLI login attempt: {}", e);
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"error": "Failed to save login attempt"})),
                    )
                        .into_response();
                }
            }
        }
        None => None,
    };

    if let Err(e) = storage::upsert_device_login(
        &state.db,
        &device_code,
        Some(session.subject.clone()),
        verification_code,
    )
    .await
    {
        tracing::error!("Error saving CLI login attempt: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Failed to save login attempt"})),
        )
            .into_response();
    }

    Json(json!({"success": true})).into_response()
}

#[derive(Debug, Deserialize)]
struct ExchangeRequest {
    device_code: Option<String>,
}

#[derive(Debug, Serialize)]
struct ExchangeResponse {
    access_token: String,
    refresh_token: String,
    user_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider_token: Option<String>,
}

/// POST /api/auth/cli/exchange - trade an approved device code for tokens.
/// Unauthenticated; a 404 means "not approved yet, keep polling". The row is
/// deleted before minting so a concurrent exchange can never issue twice.
async fn cli_exchange(
    State(state): State<AppState>,
    Json(req): Json<ExchangeRequest>,
) -> Response {
    let device_code = match req.device_code {
        Some(c) if !c.is_empty() => c,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Missing device_code"})),
            )
                .into_response()
        }
    };

    let login = match storage::consume_device_login(&state.db, &device_code).await {
        Ok(Some(l)) => l,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Authentication pending or not found"})),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("Device login lookup failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal Server Error"})),
            )
                .into_response();
        }
    };

    let signer = match &state.signer {
        Some(s) => s.clone(),
        None => {
            tracing::error!(
                "CLI_JWT_SECRET is not set; device login {} was consumed without issuing tokens",
                device_code
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal server configuration error"})),
            )
                .into_response();
        }
    };

    let profile_id = match login.profile_id {
        Some(p) => p,
        None => {
            // consume_device_login only yields approved rows
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Authentication pending or not found"})),
            )
                .into_response();
        }
    };

    // The approval is already consumed past this point: any failure below is
    // a hard error and the CLI has to start a fresh login.
    let email = match storage::get_user_by_subject(&state.db, &profile_id).await {
        Ok(user) => user.map(|u| u.email),
        Err(e) => {
            tracing::error!(
                "Device login {} consumed but user lookup failed: {}",
                device_code,
                e
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal Server Error"})),
            )
                .into_response();
        }
    };

    let minted = signer
        .mint_access_token(&profile_id, email.as_deref())
        .and_then(|access| {
            let refresh = signer.mint_refresh_token(&profile_id, email.as_deref())?;
            Ok((access, refresh))
        });

    let (access_token, refresh_token) = match minted {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(
                "Device login {} consumed but token minting failed: {}",
                device_code,
                e
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal Server Error"})),
            )
                .into_response();
        }
    };

    Json(ExchangeResponse {
        access_token,
        refresh_token,
        user_email: email,
        provider_token: login.verification_code,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: Option<String>,
}

/// POST /api/auth/cli/refresh - mint a fresh access token from a valid
/// refresh token.
async fn cli_refresh(State(state): State<AppState>, Json(req): Json<RefreshRequest>) -> Response {
    let refresh_token = match req.refresh_token {
        Some(t) if !t.is_empty() => t,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Missing refresh_token"})),
            )
                .into_response()
        }
    };

    let signer = match &state.signer {
        Some(s) => s.clone(),
        None => {
            tracing::error!("CLI_JWT_SECRET is not set");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal server configuration error"})),
            )
                .into_response();
        }
    };

    let claims = match signer.verify(&refresh_token, TokenType::Refresh) {
        Ok(c) => c,
        Err(TokenVerifyError::WrongType) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Invalid token type"})),
            )
                .into_response()
        }
        Err(TokenVerifyError::Invalid(detail)) => {
            tracing::debug!("Rejected refresh token: {}", detail);
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Invalid refresh token"})),
            )
                .into_response();
        }
    };

    match signer.mint_access_token(&claims.subject, claims.email.as_deref()) {
        Ok(access_token) => Json(json!({"access_token": access_token})).into_response(),
        Err(e) => {
            tracing::error!("Failed to mint access token: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal Server Error"})),
            )
                .into_response()
        }
    }
}

// Cluster credential & liveness service

#[derive(Debug, Deserialize)]
struct RegisterClusterRequest {
    name: Option<String>,
    vpc_id: Option<String>,
    vpc_cidr: Option<String>,
    region: Option<String>,
}

#[derive(Debug, Serialize)]
struct RegisterClusterResponse {
    cluster_id: String,
    agent_token: String,
}

/// Cluster fields exposed to owners. The agent token hash never leaves the
/// store.
#[derive(Debug, Serialize)]
struct ClusterSummary {
    id: String,
    name: String,
    status: storage::ClusterStatus,
    metadata: Option<serde_json::Value>,
    last_heartbeat: Option<i64>,
    created_at: i64,
}

impl From<storage::Cluster> for ClusterSummary {
    fn from(c: storage::Cluster) -> Self {
        ClusterSummary {
            id: c.id,
            name: c.name,
            status: c.status,
            metadata: c.metadata,
            last_heartbeat: c.last_heartbeat,
            created_at: c.created_at,
        }
    }
}

/// POST /api/cli/clusters - register a cluster for the authenticated CLI
/// user. The raw agent token is in this response and nowhere else, ever.
async fn register_cluster(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterClusterRequest>,
) -> Response {
    let claims = match require_cli_user(&state, &headers).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let name = match req.name {
        Some(n) if !n.is_empty() => n,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Cluster name is required"})),
            )
                .into_response()
        }
    };

    let metadata = json!({
        "vpc_id": req.vpc_id,
        "vpc_cidr": req.vpc_cidr,
        "region": req.region,
        "registered_at": chrono::Utc::now().timestamp(),
    });

    match storage::create_cluster(&state.db, &claims.subject, &name, metadata).await {
        Ok((cluster, agent_token)) => (
            StatusCode::CREATED,
            Json(RegisterClusterResponse {
                cluster_id: cluster.id,
                agent_token,
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Database error registering cluster: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to create cluster record"})),
            )
                .into_response()
        }
    }
}

/// GET /api/cli/clusters - list the caller's clusters, newest first.
async fn list_clusters(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let claims = match require_cli_user(&state, &headers).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    match storage::list_clusters(&state.db, &claims.subject).await {
        Ok(clusters) => {
            let clusters: Vec<ClusterSummary> =
                clusters.into_iter().map(ClusterSummary::from).collect();
            Json(json!({"clusters": clusters})).into_response()
        }
        Err(e) => {
            tracing::error!("Database error fetching clusters: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to fetch clusters"})),
            )
                .into_response()
        }
    }
}

/// POST /api/agent/heartbeat - agent liveness proof. Auth is the per-cluster
/// bearer secret in X-Agent-Token, compared against the stored hash. A bad
/// token and an unknown cluster id produce the same response.
async fn agent_heartbeat(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let cluster_id = headers
        .get("x-cluster-id")
        .and_then(|h| h.to_str().ok())
        .filter(|v| !v.is_empty());
    let agent_token = headers
        .get("x-agent-token")
        .and_then(|h| h.to_str().ok())
        .filter(|v| !v.is_empty());

    let (cluster_id, agent_token) = match (cluster_id, agent_token) {
        (Some(id), Some(token)) => (id, token),
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Missing X-Cluster-ID or X-Agent-Token"})),
            )
                .into_response()
        }
    };

    let cluster = match storage::get_cluster(&state.db, cluster_id).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Heartbeat error: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal Server Error"})),
            )
                .into_response();
        }
    };

    let authorized = cluster
        .as_ref()
        .map(|c| storage::agent_token_matches(agent_token, &c.agent_token_hash))
        .unwrap_or(false);
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid cluster ID or agent token"})),
        )
            .into_response();
    }

    if let Err(e) = storage::record_heartbeat(&state.db, cluster_id).await {
        tracing::error!("Heartbeat update error: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Failed to update heartbeat"})),
        )
            .into_response();
    }

    Json(json!({"success": true})).into_response()
}
