// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! REST API tests driving the router in-process.

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::TestContext;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use voltrun_engine::server;

async fn app() -> (TestContext, Router) {
    let ctx = TestContext::new().await;
    let router = server::router(ctx.coordinator.clone());
    (ctx, router)
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create(router: &Router, body: Value) -> String {
    let (status, function) = send(router, "POST", "/functions", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "{function}");
    function["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let (_ctx, router) = app().await;

    let (status, body) = send(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], true);
    assert!(body["pool"].is_array());
}

#[tokio::test]
async fn test_function_crud() {
    let (_ctx, router) = app().await;

    let id = create(
        &router,
        json!({"name": "hello", "runtime": "nodejs20", "code": "echo"}),
    )
    .await;

    let (status, function) = send(&router, "GET", &format!("/functions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(function["name"], "hello");
    assert_eq!(function["memory_mb"], 128);
    assert_eq!(function["entry_point"], "index.handler");

    let (status, functions) = send(&router, "GET", "/functions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(functions.as_array().unwrap().len(), 1);

    // Partial update keeps untouched fields.
    let (status, updated) = send(
        &router,
        "PUT",
        &format!("/functions/{id}"),
        Some(json!({"timeout_sec": 60})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["timeout_sec"], 60);
    assert_eq!(updated["name"], "hello");

    let (status, error) = send(
        &router,
        "PUT",
        &format!("/functions/{id}"),
        Some(json!({"memory_mb": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["kind"], "ValidationError");

    let (status, _) = send(&router, "DELETE", &format!("/functions/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, error) = send(&router, "GET", &format!("/functions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["kind"], "NotFound");

    let (status, _) = send(&router, "DELETE", &format!("/functions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_function_validation() {
    let (_ctx, router) = app().await;

    let (status, error) = send(
        &router,
        "POST",
        "/functions",
        Some(json!({"name": "x", "runtime": "ruby33", "code": "puts 1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["kind"], "ValidationError");
    assert!(error["error"].as_str().unwrap().contains("ruby33"));

    let (status, error) = send(&router, "POST", "/functions", Some(json!({"name": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["kind"], "ValidationError");
}

#[tokio::test]
async fn test_execute_returns_finalized_execution() {
    let (_ctx, router) = app().await;
    let id = create(
        &router,
        json!({"name": "echo", "runtime": "python311", "code": "log hi\necho"}),
    )
    .await;

    let (status, execution) = send(
        &router,
        "POST",
        &format!("/functions/{id}/execute"),
        Some(json!({"input": {"name": "world"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["status"], "success");
    assert_eq!(execution["output"], json!({"name": "world"}));
    assert_eq!(execution["logs"], "hi\n");

    // No body runs with an empty object.
    let (status, execution) =
        send(&router, "POST", &format!("/functions/{id}/execute"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["output"], json!({}));

    let execution_id = execution["id"].as_str().unwrap();
    let (status, stored) =
        send(&router, "GET", &format!("/executions/{execution_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored, execution);

    let (status, logs) = send(
        &router,
        "GET",
        &format!("/executions/{execution_id}/logs"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        logs,
        json!({"execution_id": execution_id, "logs": "hi\n", "status": "success"})
    );
}

#[tokio::test]
async fn test_failed_execution_is_still_200() {
    let (_ctx, router) = app().await;
    let id = create(
        &router,
        json!({"name": "bad", "runtime": "nodejs20", "code": "throw nope"}),
    )
    .await;

    let (status, execution) =
        send(&router, "POST", &format!("/functions/{id}/execute"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["status"], "failed");
    assert_eq!(execution["error"]["kind"], "ExecutionCrashed");
}

#[tokio::test]
async fn test_execute_errors() {
    let (_ctx, router) = app().await;

    let (status, error) = send(&router, "POST", "/functions/missing/execute", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["kind"], "NotFound");

    let id = create(
        &router,
        json!({"name": "off", "runtime": "go121", "code": "return 1", "status": "disabled"}),
    )
    .await;
    let (status, error) =
        send(&router, "POST", &format!("/functions/{id}/execute"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["kind"], "ValidationError");

    // Rejected invocations leave no execution behind.
    let (_, list) = send(&router, "GET", "/executions", None).await;
    assert_eq!(list["total"], 0);

    let (status, _) = send(&router, "GET", "/executions/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, "GET", "/executions/nope/logs", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_executions_filters() {
    let (_ctx, router) = app().await;
    let ok = create(
        &router,
        json!({"name": "ok", "runtime": "nodejs20", "code": "return 1"}),
    )
    .await;
    let bad = create(
        &router,
        json!({"name": "bad", "runtime": "nodejs20", "code": "exit 2"}),
    )
    .await;

    for _ in 0..3 {
        send(&router, "POST", &format!("/functions/{ok}/execute"), None).await;
    }
    send(&router, "POST", &format!("/functions/{bad}/execute"), None).await;

    let (status, list) = send(&router, "GET", "/executions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 4);

    let (_, list) = send(&router, "GET", &format!("/executions?function_id={ok}"), None).await;
    assert_eq!(list["total"], 3);

    let (_, list) = send(&router, "GET", "/executions?status=failed", None).await;
    assert_eq!(list["total"], 1);
    assert_eq!(list["executions"][0]["function_id"], bad.as_str());

    let (_, list) = send(&router, "GET", "/executions?limit=2&offset=1", None).await;
    assert_eq!(list["executions"].as_array().unwrap().len(), 2);
    assert_eq!(list["limit"], 2);
    assert_eq!(list["offset"], 1);

    let (status, error) = send(&router, "GET", "/executions?status=sleeping", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["kind"], "ValidationError");
}
