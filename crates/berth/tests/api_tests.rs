//! Service API tests against the router, without a socket.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::{test_app, test_runtime};

async fn send(app: axum::Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().uri(uri).method(method);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };
    let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

fn json_of(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn test_ping() {
    let rt = test_runtime().await;
    let (status, body) = send(test_app(&rt), Method::GET, "/v1/_ping", None).await;

    assert_eq!(status, StatusCode::OK);
    let json = json_of(&body);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_list_images() {
    let rt = test_runtime().await;
    let (status, body) = send(test_app(&rt), Method::GET, "/v1/images/json", None).await;

    assert_eq!(status, StatusCode::OK);
    let images = json_of(&body);
    let ids: Vec<&str> = images
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&rt.alpine.as_str()));
    assert!(ids.contains(&rt.busybox.as_str()));
}

#[tokio::test]
async fn test_list_images_rejects_malformed_filters() {
    let rt = test_runtime().await;
    let (status, body) = send(
        test_app(&rt),
        Method::GET,
        "/v1/images/json?filters=not-json",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_of(&body)["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_exists_reports_false_for_missing() {
    let rt = test_runtime().await;
    let (status, body) = send(
        test_app(&rt),
        Method::GET,
        "/v1/images/nothere/exists",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_of(&body)["value"], false);
}

#[tokio::test]
async fn test_delete_returns_untagged_then_deleted() {
    let rt = test_runtime().await;
    let (status, body) = send(test_app(&rt), Method::DELETE, "/v1/images/busybox", None).await;

    assert_eq!(status, StatusCode::OK);
    let entries = json_of(&body);
    assert_eq!(
        entries,
        json!([{ "Untagged": "busybox:latest" }, { "Deleted": rt.busybox }])
    );
}

#[tokio::test]
async fn test_delete_missing_is_not_found() {
    let rt = test_runtime().await;
    let (status, body) = send(test_app(&rt), Method::DELETE, "/v1/images/ghost", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let json = json_of(&body);
    assert_eq!(json["code"], "NOT_FOUND");
    assert!(json["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn test_history_is_newest_first() {
    let rt = test_runtime().await;
    let (status, body) = send(
        test_app(&rt),
        Method::GET,
        "/v1/images/alpine/history",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let layers = json_of(&body)["layers"].as_array().unwrap().clone();
    assert_eq!(layers.len(), 2);
    assert_eq!(layers[0]["created_by"], "RUN echo welcome");
    assert_eq!(layers[1]["created_by"], "ADD rootfs");
}

#[tokio::test]
async fn test_export_streams_tar() {
    let rt = test_runtime().await;
    let app = test_app(&rt);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/images/alpine/export?format=oci-archive&tags=mirror%2Falpine%3A1")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/x-tar"
    );
    let bytes = axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap();

    let mut archive = tar::Archive::new(&bytes[..]);
    let mut index = None;
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy() == "index.json" {
            let mut raw = String::new();
            std::io::Read::read_to_string(&mut entry, &mut raw).unwrap();
            index = Some(raw);
        }
    }
    let index: Value = serde_json::from_str(&index.expect("index.json missing")).unwrap();
    let refs: Vec<&str> = index["manifests"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["annotations"]["org.opencontainers.image.ref.name"].as_str().unwrap())
        .collect();
    assert!(refs.contains(&"alpine:latest"));
    assert!(refs.contains(&"mirror/alpine:1"));
}

#[tokio::test]
async fn test_export_rejects_compressed_archive() {
    let rt = test_runtime().await;
    let (status, body) = send(
        test_app(&rt),
        Method::GET,
        "/v1/images/alpine/export?format=docker-archive&compress=true",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        json_of(&body)["error"]
            .as_str()
            .unwrap()
            .contains("--compress")
    );
}

#[tokio::test]
async fn test_container_lifecycle() {
    let rt = test_runtime().await;

    let (status, body) = send(
        test_app(&rt),
        Method::POST,
        "/v1/containers/create",
        Some(json!({ "name": "web", "image": "alpine" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let created = json_of(&body);
    assert_eq!(created["image"], rt.alpine.as_str());
    assert_eq!(created["state"], "created");

    let (status, _) = send(test_app(&rt), Method::POST, "/v1/containers/web/start", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(test_app(&rt), Method::DELETE, "/v1/containers/web", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json_of(&body)["code"], "CONFLICT");

    let (status, _) = send(
        test_app(&rt),
        Method::DELETE,
        "/v1/containers/web?force=true",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_maintenance_routes_not_exposed() {
    let rt = test_runtime().await;
    for uri in ["/v1/system/migrate", "/v1/system/renumber", "/v1/system/service"] {
        let (status, _) = send(test_app(&rt), Method::POST, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn test_system_df() {
    let rt = test_runtime().await;
    let (status, body) = send(test_app(&rt), Method::GET, "/v1/system/df", None).await;

    assert_eq!(status, StatusCode::OK);
    let report = json_of(&body);
    assert_eq!(report["images"].as_array().unwrap().len(), 2);
    assert_eq!(report["images_size"], report["reclaimable_size"]);
}
