mod common;

use axum::body::Body;
use axum::http::Request;

use cdo_core::fakes::FAKE_REF;
use cdo_server::webhook::sign;

use common::{eventually, harness, send};

fn delivery(event: &str, body: &str, signature: Option<String>) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri("/hook/")
        .header("X-GitHub-Event", event)
        .header("Content-Type", "application/json");
    if let Some(signature) = signature {
        request = request.header("X-Hub-Signature-256", signature);
    }
    request.body(Body::from(body.to_string())).unwrap()
}

fn signed(event: &str, body: &str) -> Request<Body> {
    delivery(event, body, Some(sign("secret", body.as_bytes())))
}

fn push(branch: &str, message: &str) -> String {
    serde_json::json!({
        "ref": format!("refs/heads/{branch}"),
        "after": FAKE_REF,
        "head_commit": { "message": message },
    })
    .to_string()
}

#[tokio::test]
async fn ping_is_answered() {
    let h = harness();
    let request = Request::get("/ping").body(Body::empty()).unwrap();
    assert_eq!(send(&h.app, request).await, (200, "pong".to_string()));
    assert_eq!(send(&h.app, signed("ping", "{}")).await, (200, "pong".to_string()));
}

#[tokio::test]
async fn unsigned_delivery_is_rejected() {
    let h = harness();
    let body = push("feature", "add page");
    let (status, _) = send(&h.app, delivery("push", &body, None)).await;
    assert_eq!(status, 401);
    let forged = delivery("push", &body, Some(sign("wrong", body.as_bytes())));
    let (status, _) = send(&h.app, forged).await;
    assert_eq!(status, 401);
    assert!(h.compute.description("i-0001").is_none());
}

#[tokio::test]
async fn malformed_delivery_is_a_bad_request() {
    let h = harness();
    let (status, _) = send(&h.app, signed("push", "{\"ref\":")).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn push_deploys_in_the_background() {
    let h = harness();
    let (status, body) = send(&h.app, signed("push", &push("feature", "add page"))).await;
    assert_eq!((status, body.as_str()), (200, "okay"));

    let compute = h.compute.clone();
    eventually(|| {
        compute
            .description("i-0001")
            .is_some_and(|d| d.tags.get("Status").map(String::as_str) == Some("done"))
    })
    .await;
    let records = h.dns.records();
    assert!(records
        .iter()
        .any(|r| r.name.trim_end_matches('.') == "branch-feature.shop.example.com"));
}

#[tokio::test]
async fn skip_marker_is_ignored() {
    let h = harness();
    let body = push("feature", "fix docs\n\nDEPLOY: SKIP");
    let (status, text) = send(&h.app, signed("push", &body)).await;
    assert_eq!((status, text.as_str()), (200, "ignored"));

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(h.compute.description("i-0001").is_none());
}

#[tokio::test]
async fn closed_pull_request_is_cleaned_up() {
    let h = harness();
    common::insert_done(&h.compute, "i-pr", "pull-7");
    let body = serde_json::json!({
        "action": "closed",
        "number": 7,
        "pull_request": { "head": { "sha": FAKE_REF } },
    })
    .to_string();
    let (status, text) = send(&h.app, signed("pull_request", &body)).await;
    assert_eq!((status, text.as_str()), (200, "okay"));

    let compute = h.compute.clone();
    eventually(|| compute.terminated() == vec!["i-pr".to_string()]).await;
}
