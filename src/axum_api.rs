use crate::config::AuthConfig;
use crate::errors::AuthError;
use crate::rate_limit::{client_address, Decision, PathGuard, RateLimiter};
use crate::session::{Completion, PendingFlow, RESET_REQUESTED_MESSAGE};
use crate::token::TokenService;
use axum::{
    extract::{ConnectInfo, Json, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_cookies::{cookie::time::Duration, cookie::SameSite, Cookie, CookieManagerLayer, Cookies};
use tracing::error;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub flow: Arc<PendingFlow>,
    pub tokens: Arc<TokenService>,
    pub config: AuthConfig,
}

#[derive(Deserialize)]
pub struct VerifyOtpRequest {
    pub code: String,
}

#[derive(Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
    pub new_password: String,
}

#[derive(Serialize)]
pub struct VerifyOtpResponse {
    pub status: &'static str,
    pub message: &'static str,
}

fn with_retry_after(mut response: Response, secs: u64) -> Response {
    if let Ok(val) = HeaderValue::from_str(&secs.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, val);
    }
    response
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message, details, retry_after) = match &self {
            AuthError::RedisError(_)
            | AuthError::StorageError(_)
            | AuthError::SerializationError(_)
            | AuthError::ConfigError(_) => {
                error!("Request failed: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                    serde_json::Value::Null,
                    None,
                )
            }
            AuthError::DeliveryError(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Failed to send OTP. Please request a new one.",
                serde_json::json!({ "resend": true }),
                None,
            ),
            AuthError::TokenError(_) => (
                StatusCode::UNAUTHORIZED,
                "Invalid token",
                serde_json::Value::Null,
                None,
            ),
            AuthError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many OTP requests. Please try again later.",
                serde_json::json!({ "retry_after": retry_after_secs }),
                Some(*retry_after_secs),
            ),
            AuthError::Cooldown { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Please wait before requesting a new OTP.",
                serde_json::json!({ "retry_after": retry_after_secs }),
                Some(*retry_after_secs),
            ),
            AuthError::NotFound => (
                StatusCode::NOT_FOUND,
                "No active OTP found. Please request a new one.",
                serde_json::Value::Null,
                None,
            ),
            AuthError::Expired => (
                StatusCode::BAD_REQUEST,
                "OTP has expired. Please request a new one.",
                serde_json::Value::Null,
                None,
            ),
            AuthError::Mismatch { remaining } => (
                StatusCode::BAD_REQUEST,
                "Invalid OTP.",
                serde_json::json!({ "remaining_attempts": remaining }),
                None,
            ),
            AuthError::Locked { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many incorrect attempts. Please try again later.",
                serde_json::json!({ "retry_after": retry_after_secs }),
                Some(*retry_after_secs),
            ),
            AuthError::Forbidden => (
                StatusCode::FORBIDDEN,
                "Too many requests. Please try again later.",
                serde_json::Value::Null,
                None,
            ),
        };

        let body = Json(serde_json::json!({
            "error": message,
            "details": details,
        }));

        let response = (status, body).into_response();
        match retry_after {
            Some(secs) => with_retry_after(response, secs),
            None => response,
        }
    }
}

/// Returns the client's session id, starting a session if it has none.
fn session_id(cookies: &Cookies, config: &AuthConfig) -> String {
    if let Some(cookie) = cookies.get(&config.session_cookie_name) {
        return cookie.value().to_string();
    }

    let id = Uuid::new_v4().to_string();
    let cookie = Cookie::build((config.session_cookie_name.clone(), id.clone()))
        .http_only(true)
        .secure(config.auth_cookie_secure)
        .same_site(SameSite::Lax)
        .path("/")
        .build();
    cookies.add(cookie);
    id
}

pub fn set_auth_cookie(cookies: &Cookies, token: &str, config: &AuthConfig) {
    let same_site = match config.auth_cookie_same_site.as_str() {
        "Strict" => SameSite::Strict,
        "None" => SameSite::None,
        _ => SameSite::Lax,
    };

    let mut cookie = Cookie::build((config.auth_cookie_name.clone(), token.to_string()))
        .http_only(true)
        .secure(config.auth_cookie_secure)
        .same_site(same_site)
        .path(config.auth_cookie_path.clone())
        .max_age(Duration::minutes(config.session_token_expire_minutes));

    if let Some(domain) = &config.auth_cookie_domain {
        cookie = cookie.domain(domain.clone());
    }

    cookies.add(cookie.build());
}

pub async fn verify_otp(
    State(state): State<AppState>,
    cookies: Cookies,
    Json(payload): Json<VerifyOtpRequest>,
) -> Result<Json<VerifyOtpResponse>, AuthError> {
    let session = session_id(&cookies, &state.config);

    match state.flow.complete(&session, &payload.code).await? {
        Completion::Authenticated { principal_id } => {
            let token = state.tokens.create_session_token(&principal_id)?;
            set_auth_cookie(&cookies, &token, &state.config);
            Ok(Json(VerifyOtpResponse {
                status: "authenticated",
                message: "Email verified.",
            }))
        }
        Completion::PasswordChangeAllowed { .. } => Ok(Json(VerifyOtpResponse {
            status: "password_change_allowed",
            message: "OTP verified. Please set your new password.",
        })),
    }
}

pub async fn resend_otp(
    State(state): State<AppState>,
    cookies: Cookies,
) -> Result<Json<serde_json::Value>, AuthError> {
    let session = session_id(&cookies, &state.config);
    state.flow.resend(&session).await?;
    Ok(Json(
        serde_json::json!({ "message": "OTP sent successfully to your email." }),
    ))
}

pub async fn cancel(
    State(state): State<AppState>,
    cookies: Cookies,
) -> Result<Json<serde_json::Value>, AuthError> {
    if let Some(cookie) = cookies.get(&state.config.session_cookie_name) {
        state.flow.cancel(cookie.value()).await?;
        cookies.remove(
            Cookie::build((state.config.session_cookie_name.clone(), ""))
                .path("/")
                .build(),
        );
    }
    Ok(Json(serde_json::json!({ "message": "Verification cancelled." })))
}

pub async fn forgot_password(
    State(state): State<AppState>,
    cookies: Cookies,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<Json<serde_json::Value>, AuthError> {
    let session = session_id(&cookies, &state.config);
    state
        .flow
        .begin_password_reset(&session, payload.email.trim())
        .await?;
    Ok(Json(serde_json::json!({ "message": RESET_REQUESTED_MESSAGE })))
}

pub async fn reset_password(
    State(state): State<AppState>,
    cookies: Cookies,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<serde_json::Value>, AuthError> {
    let session = session_id(&cookies, &state.config);
    state
        .flow
        .change_password(&session, &payload.new_password)
        .await?;
    Ok(Json(
        serde_json::json!({ "message": "Password changed successfully. Please log in." }),
    ))
}

pub fn auth_router(flow: Arc<PendingFlow>, tokens: Arc<TokenService>) -> Router {
    let config = flow.otp().config.clone();
    let state = AppState {
        flow,
        tokens,
        config,
    };
    Router::new()
        .route("/otp/verify", post(verify_otp))
        .route("/otp/resend", post(resend_otp))
        .route("/otp/cancel", post(cancel))
        .route("/password/forgot", post(forgot_password))
        .route("/password/reset", post(reset_password))
        .layer(CookieManagerLayer::new())
        .with_state(state)
}

#[derive(Clone)]
pub struct LimiterState {
    pub limiter: Arc<RateLimiter>,
    pub guard: PathGuard,
}

fn throttled_response(retry_after_secs: u64) -> Response {
    with_retry_after(
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({ "error": "Rate limit exceeded. Please slow down." })),
        )
            .into_response(),
        retry_after_secs,
    )
}

fn locked_response(retry_after_secs: u64) -> Response {
    with_retry_after(AuthError::Forbidden.into_response(), retry_after_secs)
}

/// Applies the limiter to guarded paths. Served requests are recorded after
/// the handler runs.
pub async fn rate_limit_guard(
    State(state): State<LimiterState>,
    req: Request,
    next: Next,
) -> Response {
    if !state.guard.is_guarded(req.uri().path()) {
        return next.run(req).await;
    }

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());
    let forwarded_for = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok());
    let Some(addr) = client_address(forwarded_for, peer) else {
        return next.run(req).await;
    };

    match state.limiter.check(&addr).await {
        Decision::Allow { .. } => {
            let response = next.run(req).await;
            state.limiter.record(&addr).await;
            response
        }
        Decision::Throttle { retry_after_secs } => {
            state.limiter.record_violation(&addr).await;
            // the violation may have tipped the address into lockout
            match state.limiter.check(&addr).await {
                Decision::Locked { retry_after_secs } => locked_response(retry_after_secs),
                _ => throttled_response(retry_after_secs),
            }
        }
        Decision::Locked { retry_after_secs } => locked_response(retry_after_secs),
    }
}

/// Wraps `router` so every guarded path goes through the limiter.
pub fn with_rate_limit(router: Router, limiter: Arc<RateLimiter>) -> Router {
    let guard = PathGuard::from_config(limiter.config());
    router.layer(middleware::from_fn_with_state(
        LimiterState { limiter, guard },
        rate_limit_guard,
    ))
}
