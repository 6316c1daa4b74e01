//! HTTP surface checks: auth enforcement, ownership, status taxonomy, and
//! the health/metrics endpoints, driven through the router with oneshot
//! requests.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use tower::ServiceExt;

use civitas::api;
use civitas::api::middleware::Claims;
use civitas::app::App;
use civitas::config::ServiceConfig;
use civitas::kv::{KeyValueStore, MemoryKv};
use civitas::models::citizen::{Citizen, Email, Principal};
use civitas::notifier::{CodeNotifier, RecordingNotifier};
use civitas::store::{Collection, DocumentBackend, MemoryBackend, StoredDocument};

const SECRET: &str = "test-secret-key-32-characters!!";

struct TestApp {
    app: App,
    backend: Arc<MemoryBackend>,
}

fn build() -> TestApp {
    let mut config = ServiceConfig::default();
    config.auth.jwt_secret = SECRET.to_string();
    config.queue.workers_per_kind = 1;

    let kv = Arc::new(MemoryKv::new());
    let backend = Arc::new(MemoryBackend::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let app = App::assemble(
        config,
        kv as Arc<dyn KeyValueStore>,
        backend.clone() as Arc<dyn DocumentBackend>,
        notifier as Arc<dyn CodeNotifier>,
    );
    TestApp { app, backend }
}

fn token(cpf: &str, roles: Vec<&str>) -> String {
    let claims = Claims {
        sub: Some("user".to_string()),
        cpf: Some(cpf.to_string()),
        roles: roles.into_iter().map(String::from).collect(),
        exp: (Utc::now() + chrono::Duration::hours(1)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn seed_citizen(backend: &MemoryBackend, cpf: &str, email: &str) {
    let mut citizen = Citizen::new(cpf);
    citizen.email = Principal {
        principal: Some(Email {
            valor: email.to_string(),
            updated_at: Some(Utc::now()),
        }),
        alternativo: vec![],
    };
    backend.seed(
        Collection::Citizens,
        cpf,
        StoredDocument::new(0, serde_json::to_value(&citizen).unwrap()),
    );
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_needs_no_token() {
    let t = build();
    let router = api::router(t.app.context.clone());

    let response = router
        .oneshot(Request::get("/v1/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_missing_token_is_401() {
    let t = build();
    let router = api::router(t.app.context.clone());

    let response = router
        .oneshot(
            Request::get("/v1/citizen/12345678901")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_wrong_owner_is_403_admin_allowed() {
    let t = build();
    seed_citizen(&t.backend, "12345678901", "a@b");
    let router = api::router(t.app.context.clone());

    let response = router
        .clone()
        .oneshot(
            Request::get("/v1/citizen/12345678901")
                .header(header::AUTHORIZATION, format!("Bearer {}", token("999", vec![])))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = router
        .oneshot(
            Request::get("/v1/citizen/12345678901")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", token("999", vec!["admin"])),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_put_email_then_get_reflects_write() {
    let t = build();
    seed_citizen(&t.backend, "12345678901", "old@x.com");
    let router = api::router(t.app.context.clone());
    let bearer = format!("Bearer {}", token("12345678901", vec![]));

    let response = router
        .clone()
        .oneshot(
            Request::put("/v1/citizen/12345678901/email")
                .header(header::AUTHORIZATION, &bearer)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"valor": "new@x.com"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["version"], 1);

    let response = router
        .oneshot(
            Request::get("/v1/citizen/12345678901")
                .header(header::AUTHORIZATION, &bearer)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["email"]["valor"], "new@x.com");
    assert_eq!(body["email"]["source"], "self_declared");
}

#[tokio::test]
async fn test_invalid_email_is_400() {
    let t = build();
    let router = api::router(t.app.context.clone());

    let response = router
        .oneshot(
            Request::put("/v1/citizen/12345678901/email")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", token("12345678901", vec![])),
                )
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"valor": "not-an-email"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_cpf_is_404() {
    let t = build();
    let router = api::router(t.app.context.clone());

    let response = router
        .oneshot(
            Request::get("/v1/citizen/00000000000")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", token("00000000000", vec![])),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_degraded_read_is_503_when_uncached() {
    let t = build();
    let ctx = t.app.context.clone();
    t.backend.set_unavailable(true);
    for _ in 0..ctx.config.monitor.failure_threshold {
        ctx.monitor.poll_once().await;
    }

    let router = api::router(ctx.clone());
    let response = router
        .oneshot(
            Request::get("/v1/citizen/33333333333")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", token("33333333333", vec![])),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_phone_issue_over_http() {
    let t = build();
    let router = api::router(t.app.context.clone());
    let bearer = format!("Bearer {}", token("11111111111", vec![]));

    let response = router
        .oneshot(
            Request::put("/v1/citizen/11111111111/phone")
                .header(header::AUTHORIZATION, &bearer)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"ddi": "55", "ddd": "21", "valor": "999887766"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "issued");
}

#[tokio::test]
async fn test_admin_endpoints_require_admin_role() {
    let t = build();
    let router = api::router(t.app.context.clone());

    let response = router
        .clone()
        .oneshot(
            Request::get("/v1/phone/5521999887766/cpf")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", token("12345678901", vec![])),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = router
        .oneshot(
            Request::get("/v1/admin/queue/dead/overlay_upsert")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", token("1", vec!["admin"])),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_exposition() {
    let t = build();
    t.app.context.monitor.poll_once().await;
    let router = api::router(t.app.context.clone());

    let response = router
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("civitas_degraded_mode 0"));
    assert!(text.contains("civitas_queue_depth"));
}
