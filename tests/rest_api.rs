//! Routing behavior of the HTTP surface, exercised without a listener.

use std::sync::Arc;

use hyper::{Body, Method, Request, StatusCode};

use qsl_api_types::TapeLibraryConfig;
use qualstar_library::server::rest::handle_request;
use qualstar_library::tape::lock::LocalLocker;
use qualstar_library::tape::ltfs::LinuxLtfs;
use qualstar_library::tape::repository::NullRepository;
use qualstar_library::tape::Library;
use qualstar_library::tools::command::ScriptedCommandRunner;

fn test_library() -> Arc<Library> {
    Library::new(
        TapeLibraryConfig::default(),
        Arc::new(ScriptedCommandRunner::new()),
        Arc::new(LocalLocker::new()),
        Arc::new(NullRepository),
        Box::new(LinuxLtfs),
    )
}

fn request(method: Method, path: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

async fn body_string(response: hyper::Response<Body>) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_help_catalogue() {
    let library = test_library();
    let response = handle_request(library, request(Method::GET, "/library/help")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value =
        serde_json::from_str(&body_string(response).await).unwrap();
    let routes = body.as_array().unwrap();
    assert!(routes
        .iter()
        .any(|route| route["path"] == "/library/load/{drive}/{tape}"));
}

#[tokio::test]
async fn test_post_routes_reject_other_methods() {
    for path in [
        "/library/load/1/000063L7",
        "/library/unload/1",
        "/library/mount/1",
        "/library/unmount/1",
        "/library/format/1",
        "/library/ltfsck/1",
        "/library/transfer/000063L7/2",
        "/library/release",
    ] {
        let response = handle_request(test_library(), request(Method::GET, path)).await;
        assert_eq!(
            response.status(),
            StatusCode::METHOD_NOT_ALLOWED,
            "expected 405 for GET {}",
            path
        );
        let body = body_string(response).await;
        assert!(body.contains("Invalid request"), "unexpected body {}", body);
    }
}

#[tokio::test]
async fn test_malformed_paths() {
    // missing tape argument
    let response =
        handle_request(test_library(), request(Method::POST, "/library/load/1")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(response)
        .await
        .contains("/library/load/{drive}/{tape}"));

    // drive number is not a number
    let response =
        handle_request(test_library(), request(Method::POST, "/library/unload/one")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // volume tags must be 8 characters
    let response = handle_request(
        test_library(),
        request(Method::POST, "/library/load/1/short"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // unknown route
    let response = handle_request(test_library(), request(Method::GET, "/library/nope")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = handle_request(test_library(), request(Method::GET, "/somewhere")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_operation_returns_null() {
    let response = handle_request(
        test_library(),
        request(Method::GET, "/library/operation/11111111-2222-3333-4444-555555555555"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "null");
}

#[tokio::test]
async fn test_snapshots_answer_without_hardware() {
    // the status refresh fails (no changer resolved) but snapshot
    // endpoints still answer with the current model
    let response = handle_request(test_library(), request(Method::GET, "/library/data")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value =
        serde_json::from_str(&body_string(response).await).unwrap();
    assert!(body["drives"].as_array().unwrap().is_empty());
    assert!(body["slots"].as_array().unwrap().is_empty());
}
