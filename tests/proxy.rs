//! Subdomain proxy integration tests.

mod common;

use axum::body::Body;
use axum::extract::Request as AxumRequest;
use axum::http::header;
use axum::http::Request;
use axum::http::StatusCode;
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use tower::ServiceExt;
use uuid::Uuid;

use common::*;
use sandcastle::lifecycle::StopReason;

/// Starts a tiny echo backend on an ephemeral loopback port.
///
/// Responds to any route with `echo:<method>:<path>:<body>`.
async fn spawn_backend() -> u16 {
    let router = Router::new().fallback(|req: AxumRequest| async move {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let body = req
            .into_body()
            .collect()
            .await
            .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
            .unwrap_or_default();
        format!("echo:{method}:{path}:{body}")
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind backend");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    port
}

/// A request addressed to a sandbox subdomain.
fn subdomain_request(subdomain: Uuid, path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header(header::HOST, format!("{subdomain}.{BASE_DOMAIN}"))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn non_subdomain_hosts_pass_through_to_the_app() {
    let app = test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .header(header::HOST, format!("api.{BASE_DOMAIN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn unknown_subdomains_get_a_structured_404() {
    let app = test_app().await;
    let subdomain = Uuid::new_v4();

    let response = app
        .router
        .clone()
        .oneshot(subdomain_request(subdomain, "/hello"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Container not found or not running");
    assert_eq!(body["subdomain"], subdomain.to_string());
}

#[tokio::test]
async fn proxied_requests_reach_the_sandbox_and_touch_activity() {
    let app = test_app().await;
    let exercise = app.seed_exercise("Echo Lab").await;
    let backend_port = spawn_backend().await;

    let subdomain = Uuid::new_v4();
    app.db
        .insert_container(
            "proxy-target",
            exercise.id,
            "user-1",
            subdomain,
            &backend_port.to_string(),
        )
        .await
        .unwrap();

    let start = Utc::now();

    let response = app
        .router
        .clone()
        .oneshot(subdomain_request(subdomain, "/hello?x=1"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"echo:GET:/hello:");

    // The activity tracker observed the request.
    let touched = app
        .activity
        .last_activity(subdomain)
        .expect("activity entry should exist");
    assert!(touched >= start);

    // A second request resets the idle window.
    let between = Utc::now();
    let response = app
        .router
        .clone()
        .oneshot(subdomain_request(subdomain, "/again"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(app.activity.last_activity(subdomain).unwrap() >= between);
}

#[tokio::test]
async fn request_bodies_are_forwarded() {
    let app = test_app().await;
    let exercise = app.seed_exercise("Echo Lab").await;
    let backend_port = spawn_backend().await;

    let subdomain = Uuid::new_v4();
    app.db
        .insert_container(
            "proxy-target",
            exercise.id,
            "user-1",
            subdomain,
            &backend_port.to_string(),
        )
        .await
        .unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/submit")
        .header(header::HOST, format!("{subdomain}.{BASE_DOMAIN}"))
        .body(Body::from("payload-bytes"))
        .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"echo:POST:/submit:payload-bytes");
}

#[tokio::test]
async fn stopped_sandboxes_become_unroutable() {
    let app = test_app().await;
    let exercise = app.seed_exercise("Echo Lab").await;
    let backend_port = spawn_backend().await;

    let subdomain = Uuid::new_v4();
    app.db
        .insert_container(
            "proxy-target",
            exercise.id,
            "user-1",
            subdomain,
            &backend_port.to_string(),
        )
        .await
        .unwrap();

    // Routable while running.
    let response = app
        .router
        .clone()
        .oneshot(subdomain_request(subdomain, "/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    app.stop("proxy-target", StopReason::User, None).await.unwrap();

    // 404 once the record leaves `running`.
    let response = app
        .router
        .clone()
        .oneshot(subdomain_request(subdomain, "/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn dead_backends_yield_a_502() {
    let app = test_app().await;
    let exercise = app.seed_exercise("Echo Lab").await;

    // A port with nothing listening.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);

    let subdomain = Uuid::new_v4();
    app.db
        .insert_container(
            "proxy-target",
            exercise.id,
            "user-1",
            subdomain,
            &dead_port.to_string(),
        )
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(subdomain_request(subdomain, "/"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Proxy error");
}
