mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{completed_callback, get, post, submit_body, test_app};

#[tokio::test]
async fn test_health_check() {
    let app = test_app(true).await;
    let (status, body) = app.call(get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "subtitle-dispatch");
}

#[tokio::test]
async fn test_submit_requires_owner() {
    let app = test_app(true).await;
    let (status, body) = app
        .call(post("/api/subtitle/jobs", None, submit_body("job-1", 5)))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "MISSING_OWNER");
}

#[tokio::test]
async fn test_submit_and_complete_through_callbacks() {
    let app = test_app(true).await;
    let (status, body) = app
        .call(post("/api/subtitle/jobs", Some("alice"), submit_body("job-1", 25)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["sessionId"], "job-1");
    assert_eq!(body["data"]["totalLines"], 25);
    assert_eq!(body["data"]["batchCount"], 2);

    let sent = app.wait_for_sent("job-1", 2).await;

    // 处理中查询不会报错
    let (status, body) = app
        .call(get("/api/subtitle/jobs/job-1/results", Some("alice")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["results"].as_array().unwrap().len(), 0);

    // 倒序回调
    for request in sent.iter().rev() {
        let (status, body) = app
            .call(post("/api/subtitle/callback", None, completed_callback(request)))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["taskStatus"], "Completed");
    }

    let (status, body) = app
        .call(get("/api/subtitle/jobs/job-1/status", Some("alice")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "Completed");
    assert_eq!(body["data"]["progress"], 100.0);
    assert_eq!(body["data"]["taskStats"]["Completed"], 2);

    let (_, body) = app
        .call(get("/api/subtitle/jobs/job-1/results", Some("alice")))
        .await;
    let results = body["data"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 25);
    let indices: Vec<u64> = results.iter().map(|r| r["index"].as_u64().unwrap()).collect();
    assert_eq!(indices, (1..=25).collect::<Vec<u64>>());
    assert_eq!(results[0]["translated"], "译:line 1");
}

#[tokio::test]
async fn test_job_views_are_owner_scoped() {
    let app = test_app(true).await;
    app.call(post("/api/subtitle/jobs", Some("alice"), submit_body("job-1", 5)))
        .await;

    let (status, body) = app
        .call(get("/api/subtitle/jobs/job-1/status", Some("bob")))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "FORBIDDEN");

    let (status, body) = app
        .call(get("/api/subtitle/jobs/missing/results", Some("alice")))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "JOB_NOT_FOUND");
}

#[tokio::test]
async fn test_submission_errors_are_distinguished() {
    let app = test_app(true).await;
    let (status, body) = app
        .call(post("/api/subtitle/jobs", Some("alice"), submit_body("job-1", 0)))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_INPUT");

    app.call(post("/api/subtitle/jobs", Some("alice"), submit_body("job-2", 3)))
        .await;
    let (status, body) = app
        .call(post("/api/subtitle/jobs", Some("alice"), submit_body("job-2", 3)))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "DUPLICATE_SESSION");

    let idle = test_app(false).await;
    let (status, body) = idle
        .call(post("/api/subtitle/jobs", Some("alice"), submit_body("job-3", 3)))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "NO_CAPACITY");
}

#[tokio::test]
async fn test_cancel_outcomes_map_to_status_codes() {
    let app = test_app(true).await;
    app.call(post("/api/subtitle/jobs", Some("alice"), submit_body("job-1", 5)))
        .await;

    let (status, body) = app
        .call(post("/api/subtitle/jobs/job-1/cancel", Some("bob"), json!({})))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "FORBIDDEN");

    let (status, body) = app
        .call(post("/api/subtitle/jobs/job-1/cancel", Some("alice"), json!({})))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["success"], true);

    let (status, body) = app
        .call(post("/api/subtitle/jobs/job-1/cancel", Some("alice"), json!({})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "ALREADY_FAILED");

    let (status, body) = app
        .call(post("/api/subtitle/jobs/missing/cancel", Some("alice"), json!({})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "JOB_NOT_FOUND");
}

#[tokio::test]
async fn test_cancel_completed_job_has_its_own_code() {
    let app = test_app(true).await;
    app.call(post("/api/subtitle/jobs", Some("alice"), submit_body("job-1", 5)))
        .await;
    let sent = app.wait_for_sent("job-1", 1).await;
    let (status, body) = app
        .call(post("/api/subtitle/callback", None, completed_callback(&sent[0])))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = app
        .call(post("/api/subtitle/jobs/job-1/cancel", Some("alice"), json!({})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "ALREADY_COMPLETED");
    assert_eq!(body["error"]["status"], 409);
}

#[tokio::test]
async fn test_cancel_all_only_touches_own_jobs() {
    let app = test_app(true).await;
    for id in ["a-1", "a-2"] {
        app.call(post("/api/subtitle/jobs", Some("alice"), submit_body(id, 3)))
            .await;
    }
    app.call(post("/api/subtitle/jobs", Some("bob"), submit_body("b-1", 3)))
        .await;

    let (status, body) = app
        .call(post("/api/subtitle/jobs/cancel-all", Some("alice"), json!({})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cancelled"], 2);

    let (_, body) = app
        .call(get("/api/subtitle/jobs/b-1/status", Some("bob")))
        .await;
    assert_ne!(body["data"]["status"], "Failed");
}

#[tokio::test]
async fn test_malformed_callback_rejected() {
    let app = test_app(true).await;
    let (status, body) = app
        .call(post(
            "/api/subtitle/callback",
            None,
            json!({"sessionId": "no-delimiter", "status": "completed"}),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_CALLBACK");
}

#[tokio::test]
async fn test_direct_translation_returns_results() {
    let app = test_app(false).await;
    let (status, body) = app
        .call(post("/api/subtitle/translate", Some("alice"), submit_body("direct-1", 4)))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "Completed");
    assert_eq!(body["data"]["completedLines"], 4);
    assert_eq!(body["data"]["results"][3]["translated"], "译:line 4");
}

#[tokio::test]
async fn test_resource_views() {
    let app = test_app(true).await;
    let (status, body) = app
        .call(get("/api/subtitle/resources/cooldowns", None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));

    let (status, body) = app
        .call(get("/api/subtitle/resources/keys/k1", None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["maskedKey"], "AIzaSy-k****6789");
    assert_eq!(body["data"]["enabled"], true);
    assert_eq!(body["data"]["slots"]["active"], 0);

    let (status, body) = app
        .call(get("/api/subtitle/resources/keys/nope", None))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "RESOURCE_NOT_FOUND");
}

#[tokio::test]
async fn test_metrics_disabled_without_recorder() {
    let app = test_app(true).await;
    let (status, body) = app.call(get("/metrics", None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "METRICS_DISABLED");
}
