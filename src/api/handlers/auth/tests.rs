//! Auth module tests, driven through the full router.

use super::{AuthConfig, AuthState, WindowRateLimiter};
use crate::api::{app, handlers::Storage};
use crate::session::{
    AccessClaims, Role,
    service::test_support::{TEST_SECRET, memory_service, seed_account},
    token::sign_hs256,
};
use anyhow::{Context, Result};
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::ConnectInfo,
    http::{
        HeaderMap, Method, Request, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER, WWW_AUTHENTICATE},
    },
};
use serde_json::{Value, json};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tower::ServiceExt;
use uuid::Uuid;

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

fn test_app() -> Result<(Router, Arc<AuthState>)> {
    test_app_with(
        AuthConfig::new("https://tesis.example".to_string())
            .with_token_issuer("tesis-test".to_string()),
    )
}

fn test_app_with(config: AuthConfig) -> Result<(Router, Arc<AuthState>)> {
    let state = Arc::new(AuthState::new(
        config,
        memory_service()?,
        Arc::new(WindowRateLimiter::new()),
    ));
    let router = app(state.clone(), Storage::default())?;
    Ok((router, state))
}

/// Build a request arriving from the socket peer `client_ip`.
fn request(
    method: Method,
    uri: &str,
    token: Option<&str>,
    client_ip: &str,
    body: Option<Value>,
) -> Result<Request<Body>> {
    let peer = SocketAddr::new(client_ip.parse::<IpAddr>()?, 40_000);
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .extension(ConnectInfo(peer));
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    let body = match body {
        Some(value) => {
            builder = builder.header(CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&value)?)
        }
        None => Body::empty(),
    };
    Ok(builder.body(body)?)
}

async fn send(app: &Router, request: Request<Body>) -> Result<Reply> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).context("response body is not json")?
    };
    Ok(Reply {
        status,
        headers,
        body,
    })
}

async fn login(app: &Router, identifier: &str, password: &str) -> Result<Reply> {
    send(
        app,
        request(
            Method::POST,
            "/v1/auth/login",
            None,
            "10.0.0.1",
            Some(json!({ "identifier": identifier, "password": password })),
        )?,
    )
    .await
}

fn token_field(reply: &Reply, field: &str) -> Result<String> {
    reply.body[field]
        .as_str()
        .map(str::to_string)
        .with_context(|| format!("missing {field} in {}", reply.body))
}

async fn get_session(app: &Router, token: &str) -> Result<Reply> {
    send(
        app,
        request(Method::GET, "/v1/auth/session", Some(token), "10.0.0.1", None)?,
    )
    .await
}

#[tokio::test]
async fn login_and_session_roundtrip() -> Result<()> {
    let (app, state) = test_app()?;
    let id = seed_account(state.service(), "ana", "password-1", Role::Advisor).await?;

    let reply = login(&app, "ana@uni.edu", "password-1").await?;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["token_type"], "Bearer");
    assert_eq!(reply.body["expires_in"], 900);
    let access = token_field(&reply, "access_token")?;

    let reply = get_session(&app, &access).await?;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["subject"], id.to_string());
    assert_eq!(reply.body["role"], "advisor");
    assert_eq!(reply.body["password_change_required"], false);
    Ok(())
}

#[tokio::test]
async fn sixth_failed_login_is_throttled() -> Result<()> {
    let (app, state) = test_app()?;
    seed_account(state.service(), "ana", "password-1", Role::Student).await?;

    for _ in 0..5 {
        let reply = login(&app, "ana", "wrong-password").await?;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
        assert_eq!(reply.body["error"], "invalid_credentials");
    }

    // Even the correct password is refused until the window elapses.
    let reply = login(&app, "ana", "password-1").await?;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(reply.body["error"], "rate_limited");
    let retry_after: u64 = reply
        .headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .context("missing Retry-After")?;
    assert!(retry_after > 0 && retry_after <= 15 * 60);
    assert_eq!(reply.body["retry_after"], retry_after);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_failed_logins_never_exceed_the_ceiling() -> Result<()> {
    let (app, state) = test_app()?;
    seed_account(state.service(), "ana", "password-1", Role::Student).await?;

    let attempts = (0..20).map(|_| {
        let app = app.clone();
        tokio::spawn(async move { login(&app, "ana", "wrong-password").await })
    });
    let mut rejected = 0;
    let mut throttled = 0;
    for task in attempts.collect::<Vec<_>>() {
        match task.await??.status {
            StatusCode::UNAUTHORIZED => rejected += 1,
            StatusCode::TOO_MANY_REQUESTS => throttled += 1,
            other => anyhow::bail!("unexpected status {other}"),
        }
    }
    assert_eq!(rejected, 5);
    assert_eq!(throttled, 15);
    Ok(())
}

#[tokio::test]
async fn rotating_forwarded_for_does_not_reset_the_login_window() -> Result<()> {
    let (app, state) = test_app()?;
    seed_account(state.service(), "ana", "password-1", Role::Student).await?;

    for n in 1..=6 {
        let mut attempt = request(
            Method::POST,
            "/v1/auth/login",
            None,
            "10.0.0.1",
            Some(json!({ "identifier": "ana", "password": "wrong-password" })),
        )?;
        attempt
            .headers_mut()
            .insert("x-forwarded-for", format!("1.1.1.{n}").parse()?);
        let reply = send(&app, attempt).await?;
        let expected = if n < 6 {
            StatusCode::UNAUTHORIZED
        } else {
            StatusCode::TOO_MANY_REQUESTS
        };
        assert_eq!(reply.status, expected, "attempt {n}");
    }
    Ok(())
}

#[tokio::test]
async fn forwarded_for_keys_the_throttle_when_trusted() -> Result<()> {
    let (app, state) = test_app_with(
        AuthConfig::new("https://tesis.example".to_string())
            .with_token_issuer("tesis-test".to_string())
            .with_trust_proxy_headers(true),
    )?;
    seed_account(state.service(), "ana", "password-1", Role::Student).await?;

    let attempt = |forwarded: &'static str, password: &'static str| -> Result<Request<Body>> {
        let mut request = request(
            Method::POST,
            "/v1/auth/login",
            None,
            "10.0.0.254",
            Some(json!({ "identifier": "ana", "password": password })),
        )?;
        request
            .headers_mut()
            .insert("x-forwarded-for", forwarded.parse()?);
        Ok(request)
    };

    for _ in 0..5 {
        let reply = send(&app, attempt("1.1.1.1", "wrong-password")?).await?;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    }
    let reply = send(&app, attempt("1.1.1.1", "password-1")?).await?;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);

    // Same proxy peer, different original client.
    let reply = send(&app, attempt("2.2.2.2", "password-1")?).await?;
    assert_eq!(reply.status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn successful_logins_do_not_consume_the_login_budget() -> Result<()> {
    let (app, state) = test_app()?;
    seed_account(state.service(), "ana", "password-1", Role::Student).await?;
    for _ in 0..8 {
        let reply = login(&app, "ana", "password-1").await?;
        assert_eq!(reply.status, StatusCode::OK);
    }
    Ok(())
}

#[tokio::test]
async fn fourth_registration_in_an_hour_is_throttled() -> Result<()> {
    let (app, _state) = test_app()?;
    for n in 0..3 {
        let reply = send(
            &app,
            request(
                Method::POST,
                "/v1/auth/register",
                None,
                "10.0.0.9",
                Some(json!({
                    "email": format!("student{n}@uni.edu"),
                    "username": format!("student{n}"),
                    "password": "long-enough-pass",
                })),
            )?,
        )
        .await?;
        assert_eq!(reply.status, StatusCode::CREATED);
        assert!(Uuid::parse_str(&token_field(&reply, "id")?).is_ok());
    }

    let reply = send(
        &app,
        request(
            Method::POST,
            "/v1/auth/register",
            None,
            "10.0.0.9",
            Some(json!({
                "email": "late@uni.edu",
                "username": "late",
                "password": "long-enough-pass",
            })),
        )?,
    )
    .await?;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(reply.headers.contains_key(RETRY_AFTER));
    Ok(())
}

#[tokio::test]
async fn duplicate_registration_conflicts() -> Result<()> {
    let (app, state) = test_app()?;
    seed_account(state.service(), "ana", "password-1", Role::Student).await?;
    let reply = send(
        &app,
        request(
            Method::POST,
            "/v1/auth/register",
            None,
            "10.0.0.2",
            Some(json!({
                "email": "ana@uni.edu",
                "username": "someone-else",
                "password": "long-enough-pass",
            })),
        )?,
    )
    .await?;
    assert_eq!(reply.status, StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test]
async fn missing_and_expired_tokens_are_distinguished() -> Result<()> {
    let (app, _state) = test_app()?;

    let reply = send(
        &app,
        request(Method::GET, "/v1/auth/session", None, "10.0.0.1", None)?,
    )
    .await?;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.body["error"], "invalid_token");
    assert!(reply.headers.contains_key(WWW_AUTHENTICATE));

    let now = chrono::Utc::now().timestamp();
    let expired = sign_hs256(
        TEST_SECRET.as_bytes(),
        &AccessClaims {
            iss: "tesis-test".to_string(),
            sub: Uuid::new_v4(),
            role: Role::Student,
            iat: now - 1000,
            exp: now - 100,
            jti: Uuid::new_v4(),
            pcr: false,
        },
    )?;
    let reply = get_session(&app, &expired).await?;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.body["error"], "token_expired");

    let reply = get_session(&app, "garbage.token.value").await?;
    assert_eq!(reply.body["error"], "invalid_token");
    Ok(())
}

#[tokio::test]
async fn logout_revokes_the_presented_token() -> Result<()> {
    let (app, state) = test_app()?;
    seed_account(state.service(), "ana", "password-1", Role::Student).await?;
    let reply = login(&app, "ana", "password-1").await?;
    let access = token_field(&reply, "access_token")?;
    let refresh = token_field(&reply, "refresh_token")?;

    let reply = send(
        &app,
        request(
            Method::POST,
            "/v1/auth/logout",
            Some(&access),
            "10.0.0.1",
            Some(json!({ "refresh_token": refresh })),
        )?,
    )
    .await?;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);

    let reply = get_session(&app, &access).await?;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.body["error"], "invalid_token");

    let reply = send(
        &app,
        request(
            Method::POST,
            "/v1/auth/refresh",
            None,
            "10.0.0.1",
            Some(json!({ "refresh_token": refresh })),
        )?,
    )
    .await?;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn refresh_rotates_and_rejects_reuse() -> Result<()> {
    let (app, state) = test_app()?;
    seed_account(state.service(), "ana", "password-1", Role::Student).await?;
    let reply = login(&app, "ana", "password-1").await?;
    let first_refresh = token_field(&reply, "refresh_token")?;

    let refresh = |token: String| {
        request(
            Method::POST,
            "/v1/auth/refresh",
            None,
            "10.0.0.1",
            Some(json!({ "refresh_token": token })),
        )
    };

    let reply = send(&app, refresh(first_refresh.clone())?).await?;
    assert_eq!(reply.status, StatusCode::OK);
    let rotated_access = token_field(&reply, "access_token")?;
    assert_ne!(token_field(&reply, "refresh_token")?, first_refresh);

    let reply = send(&app, refresh(first_refresh)?).await?;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.body["error"], "invalid_token");

    // Reuse burned the whole family.
    let reply = get_session(&app, &rotated_access).await?;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn admin_reset_forces_password_change() -> Result<()> {
    let (app, state) = test_app()?;
    seed_account(state.service(), "root", "admin-password", Role::Admin).await?;
    let student = seed_account(state.service(), "ana", "password-1", Role::Student).await?;

    let admin_access = token_field(&login(&app, "root", "admin-password").await?, "access_token")?;
    let student_access = token_field(&login(&app, "ana", "password-1").await?, "access_token")?;

    let reset = |id: Uuid, token: &str| {
        request(
            Method::POST,
            &format!("/v1/admin/accounts/{id}/password-reset"),
            Some(token),
            "10.0.0.1",
            Some(json!({ "temporary_password": "temporary-123" })),
        )
    };

    let reply = send(&app, reset(student, &student_access)?).await?;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.body["error"], "forbidden");

    let reply = send(&app, reset(Uuid::new_v4(), &admin_access)?).await?;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);

    let reply = send(&app, reset(student, &admin_access)?).await?;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);

    // Existing student sessions are gone.
    let reply = get_session(&app, &student_access).await?;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    let reply = login(&app, "ana", "temporary-123").await?;
    assert_eq!(reply.body["password_change_required"], true);
    let forced_access = token_field(&reply, "access_token")?;

    let reply = get_session(&app, &forced_access).await?;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.body["error"], "password_change_required");

    let reply = send(
        &app,
        request(
            Method::POST,
            "/v1/auth/password",
            Some(&forced_access),
            "10.0.0.1",
            Some(json!({
                "current_password": "temporary-123",
                "new_password": "my-own-password",
            })),
        )?,
    )
    .await?;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);

    let reply = get_session(&app, &forced_access).await?;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    let reply = login(&app, "ana", "my-own-password").await?;
    assert_eq!(reply.body["password_change_required"], false);
    let access = token_field(&reply, "access_token")?;
    let reply = get_session(&app, &access).await?;
    assert_eq!(reply.status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn wrong_current_password_is_a_bad_request() -> Result<()> {
    let (app, state) = test_app()?;
    seed_account(state.service(), "ana", "password-1", Role::Student).await?;
    let access = token_field(&login(&app, "ana", "password-1").await?, "access_token")?;

    let reply = send(
        &app,
        request(
            Method::POST,
            "/v1/auth/password",
            Some(&access),
            "10.0.0.1",
            Some(json!({
                "current_password": "nope-nope",
                "new_password": "another-password",
            })),
        )?,
    )
    .await?;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    // The session survives a typo.
    assert_eq!(get_session(&app, &access).await?.status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn missing_payload_is_rejected() -> Result<()> {
    let (app, _state) = test_app()?;
    let reply = send(
        &app,
        request(Method::POST, "/v1/auth/login", None, "10.0.0.1", None)?,
    )
    .await?;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["error"], "invalid_request");
    Ok(())
}

#[tokio::test]
async fn health_and_openapi_are_served() -> Result<()> {
    let (app, _state) = test_app()?;
    let reply = send(&app, request(Method::GET, "/health", None, "10.0.0.1", None)?).await?;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.headers.contains_key("x-request-id"));

    let reply = send(
        &app,
        request(Method::GET, "/openapi.json", None, "10.0.0.1", None)?,
    )
    .await?;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.body["paths"]["/v1/auth/login"].is_object());
    Ok(())
}
