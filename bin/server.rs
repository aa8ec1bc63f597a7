// Statement Ledger - Web Server
// REST API with Axum: session login, CSV upload, transaction queries

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use statement_ledger::{
    init_logging, AppConfig, Credentials, DecimalStyle, IngestService, LedgerError, RejectedRow,
    Transaction, TransactionFilter, UploadBatch,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    service: Arc<IngestService>,
    cookie_name: Arc<str>,
    ttl_secs: u64,
    secure_cookie: bool,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn failure(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct UploadResponse {
    upload_id: String,
    accepted: usize,
    duplicates: usize,
    rejected: Vec<RejectedRow>,
    dialect: String,
}

/// Transaction as served (amount in minor units plus a display string)
#[derive(Serialize)]
struct TransactionResponse {
    id: String,
    date: NaiveDate,
    description: String,
    amount: i64,
    amount_display: String,
    direction: statement_ledger::Direction,
    raw_balance: Option<i64>,
    source_upload_id: String,
    source_line: usize,
}

impl From<Transaction> for TransactionResponse {
    fn from(tx: Transaction) -> Self {
        Self {
            amount_display: tx.amount_display(),
            direction: tx.direction(),
            id: tx.id,
            date: tx.date,
            description: tx.description,
            amount: tx.amount,
            raw_balance: tx.raw_balance,
            source_upload_id: tx.source_upload_id,
            source_line: tx.source_line,
        }
    }
}

/// Query string for GET /api/transactions. Amounts are decimal strings.
#[derive(Debug, Default, Deserialize)]
struct TransactionQuery {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    min_amount: Option<String>,
    max_amount: Option<String>,
    upload_id: Option<String>,
    limit: Option<usize>,
}

impl TransactionQuery {
    fn into_filter(self) -> Result<TransactionFilter, ApiError> {
        let amount = |raw: Option<String>, name: &str| -> Result<Option<i64>, ApiError> {
            match raw {
                None => Ok(None),
                Some(v) => DecimalStyle::Dot
                    .parse_minor(&v)
                    .map(Some)
                    .ok_or_else(|| ApiError::BadRequest(format!("{} is not an amount: {}", name, v))),
            }
        };

        Ok(TransactionFilter {
            min_amount: amount(self.min_amount, "min_amount")?,
            max_amount: amount(self.max_amount, "max_amount")?,
            from: self.from,
            to: self.to,
            upload_id: self.upload_id,
            limit: self.limit,
        })
    }
}

// ============================================================================
// Errors
// ============================================================================

enum ApiError {
    Ledger(LedgerError),
    BadRequest(String),
    Internal(String),
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Ledger(err)
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("worker task failed: {}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => {
                error!(%msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            ApiError::Ledger(err) => {
                let status = if err.is_auth() {
                    StatusCode::UNAUTHORIZED
                } else if err.is_format() {
                    StatusCode::UNPROCESSABLE_ENTITY
                } else if err.is_retryable() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    match &err {
                        LedgerError::UserExists(_) => StatusCode::CONFLICT,
                        _ => StatusCode::INTERNAL_SERVER_ERROR,
                    }
                };
                if status.is_server_error() {
                    error!(error = %err, "request failed");
                } else {
                    warn!(error = %err, "request rejected");
                }
                (status, err.to_string())
            }
        };

        (status, Json(ApiResponse::<()>::failure(message))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ============================================================================
// Session token plumbing
// ============================================================================

/// Bearer header wins over the cookie
fn session_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.to_string())
        .filter(|v| !v.is_empty())
}

fn require_token(headers: &HeaderMap, state: &AppState) -> Result<String, ApiError> {
    session_token(headers, &state.cookie_name).ok_or(ApiError::Ledger(LedgerError::SessionInvalid))
}

fn session_cookie(name: &str, token: &str, max_age: u64, secure: bool) -> String {
    let mut cookie = format!("{}={}; HttpOnly; Path=/; SameSite=Lax; Max-Age={}", name, token, max_age);
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /health and /api/health - Liveness, no auth
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/login - Exchange credentials for a session
async fn login(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> Result<Response, ApiError> {
    let service = state.service.clone();
    let session = tokio::task::spawn_blocking(move || service.login(&credentials)).await??;

    let cookie = session_cookie(&state.cookie_name, &session.token, state.ttl_secs, state.secure_cookie);
    let body = LoginResponse {
        token: session.token,
        expires_at: session.expires_at,
    };

    Ok(([(header::SET_COOKIE, cookie)], Json(ApiResponse::ok(body))).into_response())
}

/// POST /api/logout - Always succeeds
async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(token) = session_token(&headers, &state.cookie_name) {
        state.service.logout(&token);
    }

    let cookie = session_cookie(&state.cookie_name, "", 0, state.secure_cookie);
    ([(header::SET_COOKIE, cookie)], Json(ApiResponse::ok("logged out")))
}

/// POST /api/upload - multipart `file` plus optional `bank` hint
async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<UploadResponse> {
    let token = require_token(&headers, &state)?;

    let mut file: Option<(String, Vec<u8>)> = None;
    let mut bank: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("multipart: {}", e)))?
    {
        match field.name() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload.csv").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("file field: {}", e)))?;
                file = Some((filename, bytes.to_vec()));
            }
            Some("bank") => {
                let hint = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("bank field: {}", e)))?;
                bank = Some(hint.trim().to_string()).filter(|h| !h.is_empty());
            }
            _ => {}
        }
    }

    let (filename, bytes) =
        file.ok_or_else(|| ApiError::BadRequest("missing multipart field 'file'".to_string()))?;

    let service = state.service.clone();
    let summary = tokio::task::spawn_blocking(move || {
        service.upload(&token, &filename, &bytes, bank.as_deref())
    })
    .await??;

    Ok(Json(ApiResponse::ok(UploadResponse {
        upload_id: summary.upload_id,
        accepted: summary.accepted,
        duplicates: summary.duplicates,
        rejected: summary.rejected,
        dialect: summary.dialect,
    })))
}

/// GET /api/transactions - Filtered, date-ordered transactions
async fn get_transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TransactionQuery>,
) -> ApiResult<Vec<TransactionResponse>> {
    let token = require_token(&headers, &state)?;
    let filter = query.into_filter()?;

    let service = state.service.clone();
    let transactions =
        tokio::task::spawn_blocking(move || service.list_transactions(&token, &filter)).await??;

    Ok(Json(ApiResponse::ok(
        transactions.into_iter().map(TransactionResponse::from).collect(),
    )))
}

/// GET /api/uploads - Upload history, newest first
async fn get_uploads(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Vec<UploadBatch>> {
    let token = require_token(&headers, &state)?;

    let service = state.service.clone();
    let batches = tokio::task::spawn_blocking(move || service.list_uploads(&token)).await??;

    Ok(Json(ApiResponse::ok(batches)))
}

// ============================================================================
// Main Server
// ============================================================================

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}

fn router(state: AppState, config: &AppConfig) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/upload", post(upload))
        .route("/transactions", get(get_transactions))
        .route("/uploads", get(get_uploads))
        .with_state(state);

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&config.server.cors_origins))
                .layer(DefaultBodyLimit::max(config.server.max_upload_bytes)),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = AppConfig::load().context("load configuration")?;
    let service = IngestService::from_config(&config)
        .with_context(|| format!("open database {}", config.store.db_path.display()))?;
    let service = Arc::new(service);
    info!(db = %config.store.db_path.display(), "database opened");

    // Housekeeping: drop expired sessions once a minute
    let janitor = service.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            let removed = janitor.authenticator().purge_expired();
            if removed > 0 {
                info!(removed, "expired sessions purged");
            }
        }
    });

    let state = AppState {
        service,
        cookie_name: Arc::from(config.session.cookie_name.as_str()),
        ttl_secs: config.session.ttl_secs,
        secure_cookie: config.session.secure_cookie,
    };
    let app = router(state, &config);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("bind {}", config.server.bind))?;

    info!(bind = %config.server.bind, "🚀 ledger server running");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use statement_ledger::auth::token_prefix;
    use statement_ledger::SqliteStore;
    use tower::Service;

    fn test_state(config: &AppConfig) -> AppState {
        let store = SqliteStore::open_in_memory().unwrap();
        AppState {
            service: Arc::new(IngestService::new(Arc::new(store), config)),
            cookie_name: Arc::from(config.session.cookie_name.as_str()),
            ttl_secs: config.session.ttl_secs,
            secure_cookie: config.session.secure_cookie,
        }
    }

    #[tokio::test]
    async fn test_health_at_root_and_under_api() {
        let config = AppConfig::default();
        let mut app = router(test_state(&config), &config);

        for path in ["/health", "/api/health"] {
            let request = Request::builder().uri(path).body(Body::empty()).unwrap();
            let response = app.call(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{}", path);
        }
    }

    #[test]
    fn test_secure_cookie_attribute() {
        let plain = session_cookie("ledger_session", "abc", 60, false);
        assert!(plain.contains("HttpOnly"));
        assert!(!plain.contains("Secure"));

        let secure = session_cookie("ledger_session", "abc", 60, true);
        assert!(secure.ends_with("; Secure"));
    }

    #[test]
    fn test_bearer_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(header::COOKIE, HeaderValue::from_static("ledger_session=xyz"));
        assert_eq!(session_token(&headers, "ledger_session"), Some("abc".to_string()));
    }

    #[test]
    fn test_cookie_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; ledger_session=xyz"));
        assert_eq!(session_token(&headers, "ledger_session"), Some("xyz".to_string()));
        assert_eq!(session_token(&headers, "other"), None);
        assert_eq!(token_prefix("0123456789abcdef"), "01234567");
    }

    #[test]
    fn test_query_amounts_are_decimal() {
        let query = TransactionQuery {
            min_amount: Some("-25.00".to_string()),
            ..Default::default()
        };
        assert_eq!(query.into_filter().ok().and_then(|f| f.min_amount), Some(-2500));

        let bad = TransactionQuery {
            max_amount: Some("lots".to_string()),
            ..Default::default()
        };
        assert!(bad.into_filter().is_err());
    }
}
