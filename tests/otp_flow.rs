use axum::{
    body::Body,
    http::{header, Request, Response, StatusCode},
    Router,
};
use chrono::Duration;
use otp_guard::{session::RESET_REQUESTED_MESSAGE, Principal};
use serde_json::{json, Value};
use tower::util::ServiceExt; // for oneshot

mod common;
use common::spawn_app;

const EMAIL: &str = "alice@example.com";

async fn post(router: &Router, uri: &str, session: Option<&str>, body: Value) -> Response<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(session) = session {
        request = request.header(header::COOKIE, format!("otp_session={}", session));
    }

    router
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap()
}

async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn set_cookie(response: &Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| {
            value
                .split(';')
                .next()
                .and_then(|pair| pair.strip_prefix(&format!("{}=", name)))
                .map(str::to_string)
        })
}

#[tokio::test]
async fn test_signup_verification_signs_in() {
    let app = spawn_app();
    app.directory.insert(Principal::new("42", EMAIL));
    app.flow
        .begin_signup("sess-1", &app.directory.get("42").unwrap())
        .await
        .unwrap();

    let sent = app.emails.sent_emails.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, EMAIL);
    assert_eq!(sent[0].1, "Verify Your Email - LeQ");
    let code = app.emails.last_code(EMAIL).unwrap();

    let response = post(&app.router, "/otp/verify", Some("sess-1"), json!({ "code": code })).await;
    assert_eq!(response.status(), StatusCode::OK);

    let token = set_cookie(&response, "auth_token").expect("auth cookie set");
    assert_eq!(app.tokens.verify_session_token(&token).unwrap().sub, "42");
    assert_eq!(json_body(response).await["status"], "authenticated");
    assert!(app.directory.get("42").unwrap().active);

    // the session was consumed along with the code
    let replay = post(&app.router, "/otp/verify", Some("sess-1"), json!({ "code": code })).await;
    assert_eq!(replay.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_wrong_codes_count_down_then_lock() {
    let app = spawn_app();
    app.directory.insert(Principal::new("42", EMAIL));
    app.flow
        .begin_signup("sess-1", &app.directory.get("42").unwrap())
        .await
        .unwrap();
    let code = app.emails.last_code(EMAIL).unwrap();
    let wrong = if code == "000000" { "111111" } else { "000000" };

    for remaining in [3, 2, 1, 0] {
        let response = post(&app.router, "/otp/verify", Some("sess-1"), json!({ "code": wrong })).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["details"]["remaining_attempts"], remaining);
    }

    let response = post(&app.router, "/otp/verify", Some("sess-1"), json!({ "code": wrong })).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "900");

    // the right code does not help while locked
    let response = post(&app.router, "/otp/verify", Some("sess-1"), json!({ "code": code })).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(!app.directory.get("42").unwrap().active);
}

#[tokio::test]
async fn test_expired_code_is_rejected() {
    let app = spawn_app();
    app.directory.insert(Principal::new("42", EMAIL));
    app.flow
        .begin_signup("sess-1", &app.directory.get("42").unwrap())
        .await
        .unwrap();
    let code = app.emails.last_code(EMAIL).unwrap();

    app.clock.advance(Duration::seconds(300));

    let response = post(&app.router, "/otp/verify", Some("sess-1"), json!({ "code": code })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(response).await["error"],
        "OTP has expired. Please request a new one."
    );
}

#[tokio::test]
async fn test_resend_respects_cooldown() {
    let app = spawn_app();
    app.directory.insert(Principal::new("42", EMAIL));
    app.flow
        .begin_signup("sess-1", &app.directory.get("42").unwrap())
        .await
        .unwrap();
    let first = app.emails.last_code(EMAIL).unwrap();

    let response = post(&app.router, "/otp/resend", Some("sess-1"), json!({})).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "60");

    app.clock.advance(Duration::seconds(60));
    let response = post(&app.router, "/otp/resend", Some("sess-1"), json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.emails.sent_emails.lock().unwrap().len(), 2);

    let second = app.emails.last_code(EMAIL).unwrap();
    if first != second {
        // the superseded code no longer verifies
        let response =
            post(&app.router, "/otp/verify", Some("sess-1"), json!({ "code": first })).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    let response = post(&app.router, "/otp/verify", Some("sess-1"), json!({ "code": second })).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_cancel_drops_pending_verification() {
    let app = spawn_app();
    app.directory.insert(Principal::new("42", EMAIL));
    app.flow
        .begin_signup("sess-1", &app.directory.get("42").unwrap())
        .await
        .unwrap();
    let code = app.emails.last_code(EMAIL).unwrap();

    let response = post(&app.router, "/otp/cancel", Some("sess-1"), json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = post(&app.router, "/otp/verify", Some("sess-1"), json!({ "code": code })).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_forgot_password_does_not_reveal_accounts() {
    let app = spawn_app();
    app.directory.insert(Principal::new("42", EMAIL));

    let unknown = post(
        &app.router,
        "/password/forgot",
        None,
        json!({ "email": "nobody@example.com" }),
    )
    .await;
    assert_eq!(unknown.status(), StatusCode::OK);
    assert_eq!(json_body(unknown).await["message"], RESET_REQUESTED_MESSAGE);
    assert!(app.emails.sent_emails.lock().unwrap().is_empty());

    let known = post(&app.router, "/password/forgot", None, json!({ "email": EMAIL })).await;
    assert_eq!(known.status(), StatusCode::OK);
    let session = set_cookie(&known, "otp_session").expect("session cookie set");
    assert_eq!(json_body(known).await["message"], RESET_REQUESTED_MESSAGE);

    // a second request inside the cooldown looks the same
    let again = post(&app.router, "/password/forgot", Some(&session), json!({ "email": EMAIL })).await;
    assert_eq!(again.status(), StatusCode::OK);

    let sent = app.emails.sent_emails.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "Password Reset Code - LeQ");
}

#[tokio::test]
async fn test_password_reset_flow() {
    let app = spawn_app();
    let mut principal = Principal::new("42", EMAIL);
    principal.active = true;
    app.directory.insert(principal);

    let response = post(&app.router, "/password/forgot", None, json!({ "email": EMAIL })).await;
    let session = set_cookie(&response, "otp_session").unwrap();
    let code = app.emails.last_code(EMAIL).unwrap();

    // no password change before the code is verified
    let early = post(
        &app.router,
        "/password/reset",
        Some(&session),
        json!({ "new_password": "hunter2" }),
    )
    .await;
    assert_eq!(early.status(), StatusCode::NOT_FOUND);

    let response = post(&app.router, "/otp/verify", Some(&session), json!({ "code": code })).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookie(&response, "auth_token").is_none());
    assert_eq!(json_body(response).await["status"], "password_change_allowed");

    let response = post(
        &app.router,
        "/password/reset",
        Some(&session),
        json!({ "new_password": "correct horse" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        app.directory.passwords.lock().unwrap().get("42").map(String::as_str),
        Some("correct horse")
    );

    // one change per verification
    let response = post(
        &app.router,
        "/password/reset",
        Some(&session),
        json!({ "new_password": "again" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
