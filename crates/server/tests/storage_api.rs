use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use axum::body::Body;
use axum::http::{request, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use md5::{Digest, Md5};
use mss_security::{hash_password, Account, Authenticator, TokenAuthority, TOKEN_TTL};
use mss_server::{build_router, AppState, Scheme, StatusOverride};
use mss_storage::{Metadata, StorageLayout};
use tempfile::TempDir;
use tower::ServiceExt;

const USER: &str = "test:tester";
const PASSWORD: &str = "testing";
const SECRET: &[u8] = b"integration-test-secret";
const OBJECT_BODY: &str = r#"{"data":"axafkdsfksfs","name":"Mr tester"}"#;

fn password_hash() -> &'static str {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| hash_password(PASSWORD).unwrap())
}

fn meta(pairs: &[(&str, &str)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

struct Harness {
    root: TempDir,
    app: Router,
    token: String,
}

impl Harness {
    fn new() -> Self {
        Self::with_override(None)
    }

    fn with_override(status_override: Option<StatusOverride>) -> Self {
        let root = TempDir::new().unwrap();
        let account = Account {
            username: USER.to_string(),
            password_hash: password_hash().to_string(),
        };
        let state = Arc::new(AppState {
            authenticator: Authenticator::new(account, SECRET),
            layout: StorageLayout::new(root.path()),
            scheme: Scheme::Http,
        });
        let token = TokenAuthority::new(SECRET).issue().unwrap();

        Self {
            app: build_router(state, status_override),
            root,
            token,
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }

    fn metadata(&self, relative: &str) -> Metadata {
        mss_storage::load(&self.path(relative)).unwrap()
    }

    fn storage(&self, method: &str, target: &str) -> request::Builder {
        Request::builder()
            .method(method)
            .uri(format!("/v1.0/abc/{target}"))
            .header("X-Auth-Token", self.token.as_str())
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn with_meta(
        &self,
        method: &str,
        target: &str,
        prefix: &str,
        metadata: &[(&str, &str)],
    ) -> StatusCode {
        let mut builder = self.storage(method, target);
        for (key, value) in metadata {
            builder = builder.header(format!("{prefix}{key}"), *value);
        }
        self.send(builder.body(Body::empty()).unwrap()).await.status()
    }

    async fn create_container(&self, metadata: &[(&str, &str)]) -> StatusCode {
        self.with_meta("PUT", "test", "X-Container-Meta-", metadata).await
    }

    async fn post_to_container(&self, metadata: &[(&str, &str)]) -> StatusCode {
        self.with_meta("POST", "test", "X-Container-Meta-", metadata).await
    }

    async fn post_to_object(&self, name: &str, metadata: &[(&str, &str)]) -> StatusCode {
        self.with_meta("POST", &format!("test/{name}"), "X-Object-Meta-", metadata)
            .await
    }

    async fn create_object(&self) -> StatusCode {
        let request = self
            .storage("PUT", "test/test.txt")
            .header("X-Object-Meta-Test", "testObjectData")
            .body(Body::from(OBJECT_BODY))
            .unwrap();
        self.send(request).await.status()
    }
}

async fn body_string(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn unsupported_method_is_bad_request() {
    let harness = Harness::new();
    let request = harness
        .storage("DELETE", "test")
        .body(Body::empty())
        .unwrap();

    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_string(response).await, "Bad Request\n");
}

#[tokio::test]
async fn reads_are_limited_to_capabilities() {
    let harness = Harness::new();

    let get = |target: &str| harness.storage("GET", target).body(Body::empty()).unwrap();

    let response = harness.send(get("System/Capabilities.json")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    fs::create_dir(harness.path("System")).unwrap();
    let capabilities = br#"{"version":1}"#;
    fs::write(harness.path("System/Capabilities.json"), capabilities).unwrap();

    let response = harness.send(get("System/Capabilities.json")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(response.headers()["accept-ranges"], "bytes");
    assert_eq!(
        response.headers()["etag"],
        hex::encode(Md5::digest(capabilities)).as_str()
    );
    assert_eq!(body_string(response).await, r#"{"version":1}"#);

    fs::write(harness.path("System/other.json"), b"{}").unwrap();
    for target in ["System/other.json", "System", "a/b/c"] {
        let response = harness.send(get(target)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "target {target}");
    }
}

#[tokio::test]
async fn storage_requires_a_valid_token() {
    let harness = Harness::new();

    let request = Request::builder()
        .method("PUT")
        .uri("/v1.0/abc/test")
        .body(Body::empty())
        .unwrap();
    assert_eq!(harness.send(request).await.status(), StatusCode::UNAUTHORIZED);

    let expired = TokenAuthority::new(SECRET)
        .issue_at(SystemTime::now() - TOKEN_TTL - Duration::from_secs(5))
        .unwrap();
    let foreign = TokenAuthority::new(b"someone else").issue().unwrap();
    for token in [expired.as_str(), foreign.as_str(), "garbage", ""] {
        let request = Request::builder()
            .method("PUT")
            .uri("/v1.0/abc/test")
            .header("X-Auth-Token", token)
            .body(Body::empty())
            .unwrap();
        assert_eq!(harness.send(request).await.status(), StatusCode::UNAUTHORIZED);
    }
    assert!(!harness.path("test").exists());
}

#[tokio::test]
async fn token_is_checked_before_the_target() {
    let harness = Harness::new();
    let request = Request::builder()
        .method("PUT")
        .uri("/v1.0/abc/a/b/c")
        .body(Body::empty())
        .unwrap();
    assert_eq!(harness.send(request).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn authentication_without_credentials() {
    let harness = Harness::new();
    let request = Request::builder()
        .uri("/auth/v1.0")
        .body(Body::empty())
        .unwrap();
    assert_eq!(harness.send(request).await.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/auth/v1.0")
        .header("X-Auth-User", USER)
        .body(Body::empty())
        .unwrap();
    assert_eq!(harness.send(request).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn authentication_with_wrong_credentials() {
    let harness = Harness::new();
    for (user, key) in [("test", PASSWORD), (USER, "test"), ("", "")] {
        let request = Request::builder()
            .uri("/auth/v1.0")
            .header("X-Auth-User", user)
            .header("X-Auth-Key", key)
            .body(Body::empty())
            .unwrap();
        let response = harness.send(request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get("x-auth-token").is_none());
    }
}

#[tokio::test]
async fn authentication_with_correct_credentials() {
    let harness = Harness::new();
    let request = Request::builder()
        .uri("/auth/v1.0")
        .header("Host", "storage.example:8080")
        .header("X-Auth-User", USER)
        .header("X-Auth-Key", PASSWORD)
        .body(Body::empty())
        .unwrap();

    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["x-storage-url"],
        "http://storage.example:8080/v1.0/abc"
    );

    let token = response.headers()["x-auth-token"].to_str().unwrap().to_string();
    let request = Request::builder()
        .method("PUT")
        .uri("/v1.0/abc/test")
        .header("X-Auth-Token", token)
        .body(Body::empty())
        .unwrap();
    assert_eq!(harness.send(request).await.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn authentication_endpoint_only_accepts_get() {
    let harness = Harness::new();
    let request = Request::builder()
        .method("POST")
        .uri("/auth/v1.0")
        .header("X-Auth-User", USER)
        .header("X-Auth-Key", PASSWORD)
        .body(Body::empty())
        .unwrap();
    assert_eq!(harness.send(request).await.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_container() {
    let harness = Harness::new();
    let metadata = [("Test-Container", "test")];

    assert_eq!(harness.create_container(&metadata).await, StatusCode::CREATED);
    assert!(harness.path("test").is_dir());
    assert_eq!(harness.metadata("test/test.metadata.json"), meta(&metadata));
}

#[tokio::test]
async fn create_duplicate_container_merges_metadata() {
    let harness = Harness::new();

    assert_eq!(
        harness.create_container(&[("Test-Container", "test")]).await,
        StatusCode::CREATED
    );
    assert_eq!(
        harness
            .create_container(&[("Test-Update-Container", "updateTest")])
            .await,
        StatusCode::ACCEPTED
    );
    assert_eq!(
        harness.metadata("test/test.metadata.json"),
        meta(&[
            ("Test-Container", "test"),
            ("Test-Update-Container", "updateTest")
        ])
    );
}

#[tokio::test]
async fn empty_value_deletes_container_field() {
    let harness = Harness::new();

    harness
        .create_container(&[("Test-Container", "test"), ("Test-Delete-Me", "deleteme")])
        .await;
    assert_eq!(
        harness
            .create_container(&[("Test-Update-Container", "updateTest"), ("Test-Delete-Me", "")])
            .await,
        StatusCode::ACCEPTED
    );
    assert_eq!(
        harness.metadata("test/test.metadata.json"),
        meta(&[
            ("Test-Container", "test"),
            ("Test-Update-Container", "updateTest")
        ])
    );
}

#[tokio::test]
async fn corrupt_container_metadata_is_backed_up() {
    for method in ["PUT", "POST"] {
        let harness = Harness::new();
        let corrupt = b"corrupted json object";
        fs::create_dir(harness.path("test")).unwrap();
        fs::write(harness.path("test/test.metadata.json"), corrupt).unwrap();

        let metadata = [("Test-Container2", "meta3"), ("Test-Container3", "meta4")];
        let status = harness
            .with_meta(method, "test", "X-Container-Meta-", &metadata)
            .await;
        let expected = if method == "PUT" {
            StatusCode::ACCEPTED
        } else {
            StatusCode::NO_CONTENT
        };
        assert_eq!(status, expected, "{method}");

        assert_eq!(harness.metadata("test/test.metadata.json"), meta(&metadata));
        assert_eq!(
            fs::read(harness.path("test/test.metadata.json.bak")).unwrap(),
            corrupt
        );
    }
}

#[tokio::test]
async fn post_to_object_replaces_metadata() {
    let harness = Harness::new();
    harness.create_container(&[("Test-Container", "test")]).await;
    assert_eq!(harness.create_object().await, StatusCode::CREATED);

    let first = [("Test", "meta1"), ("Test2", "meta2"), ("Test3", "meta3")];
    assert_eq!(
        harness.post_to_object("test.txt", &first).await,
        StatusCode::ACCEPTED
    );
    assert_eq!(
        harness.metadata("test/test.test.txt.metadata.json"),
        meta(&first)
    );

    let second = [("Test4", "meta4"), ("Test5", "meta5")];
    assert_eq!(
        harness.post_to_object("test.txt", &second).await,
        StatusCode::ACCEPTED
    );
    assert_eq!(
        harness.metadata("test/test.test.txt.metadata.json"),
        meta(&second)
    );
}

#[tokio::test]
async fn post_to_missing_container() {
    let harness = Harness::new();
    assert_eq!(
        harness.post_to_container(&[("test", "meta1")]).await,
        StatusCode::NOT_FOUND
    );
    assert!(!harness.path("test").exists());
}

#[tokio::test]
async fn post_to_container_merges_metadata() {
    let harness = Harness::new();
    harness
        .create_container(&[("Test-Container", "test"), ("Test-Container2", "test2")])
        .await;

    assert_eq!(
        harness
            .post_to_container(&[("Test-Container2", "meta3"), ("Test-Container3", "meta4")])
            .await,
        StatusCode::NO_CONTENT
    );
    assert_eq!(
        harness.metadata("test/test.metadata.json"),
        meta(&[
            ("Test-Container", "test"),
            ("Test-Container2", "meta3"),
            ("Test-Container3", "meta4")
        ])
    );
}

#[tokio::test]
async fn put_object_to_missing_container() {
    let harness = Harness::new();
    assert_eq!(harness.create_object().await, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn post_to_missing_object() {
    let harness = Harness::new();
    harness.create_container(&[("Test-Container", "test")]).await;

    assert_eq!(
        harness.post_to_object("hello.txt", &[("test", "meta1")]).await,
        StatusCode::NOT_FOUND
    );
    assert!(!harness.path("test/test.hello.txt.metadata.json").exists());
}

#[tokio::test]
async fn create_object_stores_body_and_metadata() {
    let harness = Harness::new();
    harness.create_container(&[("Test-Container", "test")]).await;

    assert_eq!(harness.create_object().await, StatusCode::CREATED);
    assert_eq!(
        fs::read_to_string(harness.path("test/test.txt")).unwrap(),
        OBJECT_BODY
    );
    assert_eq!(
        harness.metadata("test/test.test.txt.metadata.json"),
        meta(&[("Test", "testObjectData")])
    );
}

#[tokio::test]
async fn overwriting_object_replaces_content_and_metadata() {
    let harness = Harness::new();
    harness.create_container(&[]).await;
    harness.create_object().await;

    let request = harness
        .storage("PUT", "test/test.txt")
        .header("X-Object-Meta-Other", "x")
        .body(Body::from("short"))
        .unwrap();
    assert_eq!(harness.send(request).await.status(), StatusCode::CREATED);
    assert_eq!(
        fs::read_to_string(harness.path("test/test.txt")).unwrap(),
        "short"
    );
    assert_eq!(
        harness.metadata("test/test.test.txt.metadata.json"),
        meta(&[("Other", "x")])
    );
}

#[tokio::test]
async fn colons_in_names_are_replaced() {
    let harness = Harness::new();
    let recording = "1234_AABBCCDD1234_20190101_09:09:09";

    let status = harness
        .with_meta("PUT", recording, "X-Container-Meta-", &[("Status", "Transferring")])
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(harness.path("1234_AABBCCDD1234_20190101_09_09_09").is_dir());
}

#[tokio::test]
async fn complete_status_creates_marker() {
    let harness = Harness::new();
    let recording = "1234_AABBCCDD1234_20190101_090909";
    harness
        .with_meta("PUT", recording, "X-Container-Meta-", &[("Status", "Transferring")])
        .await;
    assert!(!harness.path(&format!("{recording}/complete")).exists());

    let status = harness
        .with_meta("POST", recording, "X-Object-Meta-", &[("Status", "Complete")])
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let marker = harness.path(&format!("{recording}/complete"));
    assert!(marker.is_file());
    assert_eq!(fs::metadata(marker).unwrap().len(), 0);
}

#[tokio::test]
async fn head_returns_stored_metadata() {
    let harness = Harness::new();
    harness.create_container(&[("Test-Container", "test")]).await;
    harness.create_object().await;

    let head = |target: &str| harness.storage("HEAD", target).body(Body::empty()).unwrap();

    let response = harness.send(head("test/test.txt")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-object-meta-test"], "testObjectData");

    let response = harness.send(head("test")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-container-meta-test-container"], "test");
}

#[tokio::test]
async fn metadata_values_are_decoded_and_escaped() {
    let harness = Harness::new();
    harness
        .create_container(&[("Title", "Hello%20World"), ("Raw", "100%")])
        .await;
    assert_eq!(
        harness.metadata("test/test.metadata.json"),
        meta(&[("Raw", "100%"), ("Title", "Hello World")])
    );

    let request = harness.storage("HEAD", "test").body(Body::empty()).unwrap();
    let response = harness.send(request).await;
    assert_eq!(response.headers()["x-container-meta-title"], "Hello%20World");
    assert_eq!(response.headers()["x-container-meta-raw"], "100%25");
}

#[tokio::test]
async fn head_of_missing_metadata() {
    let harness = Harness::new();
    for target in ["test/test.txt", "test"] {
        let request = harness.storage("HEAD", target).body(Body::empty()).unwrap();
        assert_eq!(
            harness.send(request).await.status(),
            StatusCode::NOT_FOUND,
            "target {target}"
        );
    }

    fs::create_dir(harness.path("test")).unwrap();
    fs::write(harness.path("test/test.metadata.json"), b"{broken").unwrap();
    let request = harness.storage("HEAD", "test").body(Body::empty()).unwrap();
    assert_eq!(harness.send(request).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deep_or_empty_targets_are_rejected() {
    let harness = Harness::new();
    for target in ["a/b/c", "a/../b"] {
        let request = harness.storage("PUT", target).body(Body::empty()).unwrap();
        assert_eq!(
            harness.send(request).await.status(),
            StatusCode::BAD_REQUEST,
            "target {target:?}"
        );
    }

    let request = Request::builder()
        .method("POST")
        .uri("/v1.0/abc")
        .header("X-Auth-Token", harness.token.as_str())
        .body(Body::empty())
        .unwrap();
    assert_eq!(harness.send(request).await.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_override_forces_responses() {
    let status_override = StatusOverride::parse("/v1.0/abc/test:507,/auth:503").unwrap();
    let harness = Harness::with_override(Some(status_override));

    let response = harness
        .send(harness.storage("PUT", "test").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
    assert_eq!(body_string(response).await, "Insufficient Storage\n");
    assert!(!harness.path("test").exists());

    let request = Request::builder()
        .uri("/auth/v1.0")
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        harness.send(request).await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );

    let response = harness
        .send(harness.storage("PUT", "other").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn container_post_requires_prior_put() {
    let harness = Harness::new();
    let metadata = [("Test-Container", "test")];

    assert_eq!(
        harness.post_to_container(&metadata).await,
        StatusCode::NOT_FOUND
    );
    assert_eq!(harness.create_container(&[]).await, StatusCode::CREATED);
    assert_eq!(
        harness.post_to_container(&metadata).await,
        StatusCode::NO_CONTENT
    );
    assert_eq!(harness.metadata("test/test.metadata.json"), meta(&metadata));
    assert!(!harness.path("test/complete").exists());
}

#[tokio::test]
async fn trailing_slash_endpoint_checks_the_token() {
    let harness = Harness::new();
    let request = Request::builder()
        .method("PUT")
        .uri("/v1.0/abc/")
        .body(Body::empty())
        .unwrap();
    assert_eq!(harness.send(request).await.status(), StatusCode::UNAUTHORIZED);

    for method in ["PUT", "POST", "HEAD"] {
        let request = harness.storage(method, "").body(Body::empty()).unwrap();
        assert_eq!(
            harness.send(request).await.status(),
            StatusCode::BAD_REQUEST,
            "method {method}"
        );
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn full_disk_is_insufficient_storage() {
    use std::os::unix::fs::symlink;

    let full = std::path::Path::new("/dev/full");
    if !full.exists() {
        return;
    }
    let harness = Harness::new();
    assert_eq!(harness.create_container(&[]).await, StatusCode::CREATED);

    symlink(full, harness.path("test/test.txt")).unwrap();
    let response = harness
        .send(
            harness
                .storage("PUT", "test/test.txt")
                .body(Body::from(OBJECT_BODY))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
    assert_eq!(body_string(response).await, "Insufficient Storage\n");

    fs::remove_file(harness.path("test/test.txt")).unwrap();
    symlink(full, harness.path("test/test.test.txt.metadata.json")).unwrap();
    assert_eq!(
        harness.create_object().await,
        StatusCode::INSUFFICIENT_STORAGE
    );
    assert_eq!(fs::read_to_string(harness.path("test/test.txt")).unwrap(), OBJECT_BODY);
}
