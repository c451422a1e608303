use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures::StreamExt;
use md5::{Digest, Md5};
use mss_security::Authenticator;
use mss_storage::{
    metadata, sanitize, Metadata, MetadataError, Resource, StorageLayout, CAPABILITIES_TARGET,
};
use percent_encoding::percent_decode_str;
use tokio::io::AsyncWriteExt;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::ApiError;
use crate::headers::{
    emit_metadata, header_str, parse_metadata, CONTAINER_META_PREFIX, OBJECT_META_PREFIX,
    X_AUTH_KEY, X_AUTH_TOKEN, X_AUTH_USER, X_STORAGE_URL,
};
use crate::middleware::{log_request, override_status, StatusOverride};

pub const AUTH_ENDPOINT: &str = "/auth/v1.0";
pub const STORAGE_ENDPOINT: &str = "/v1.0/abc";

const STATUS_KEY: &str = "Status";
const STATUS_COMPLETE: &str = "Complete";

/// URL scheme the listeners are serving, used to build the storage URL
/// handed out on login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

pub struct AppState {
    pub authenticator: Authenticator,
    pub layout: StorageLayout,
    pub scheme: Scheme,
}

pub type SharedState = Arc<AppState>;

/// Builds the service shared by every listener. Request logging wraps the
/// status override so forced responses are logged too.
pub fn build_router(state: SharedState, status_override: Option<StatusOverride>) -> Router {
    let router = Router::new()
        .route(AUTH_ENDPOINT, any(handle_auth))
        .route(STORAGE_ENDPOINT, any(handle_storage))
        .route(&format!("{STORAGE_ENDPOINT}/"), any(handle_storage))
        .route(&format!("{STORAGE_ENDPOINT}/*target"), any(handle_storage))
        .fallback(handle_unknown)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let router = match status_override {
        Some(status_override) => {
            info!("Debug status override active: {:?}", status_override);
            router.layer(from_fn_with_state(Arc::new(status_override), override_status))
        }
        None => router,
    };
    router.layer(from_fn(log_request))
}

async fn handle_unknown() -> ApiError {
    ApiError::NotFound
}

async fn handle_auth(
    State(state): State<SharedState>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if method != Method::GET {
        warn!("Unsupported method {} on auth endpoint", method);
        return Err(ApiError::BadRequest);
    }

    let (Some(user), Some(key)) = (
        header_str(&headers, X_AUTH_USER),
        header_str(&headers, X_AUTH_KEY),
    ) else {
        error!("Call to auth without credentials");
        return Err(ApiError::Unauthorized);
    };

    let token = state.authenticator.authenticate(user, key).map_err(|err| {
        error!("Failed to authenticate {}: {}", user, err);
        ApiError::Unauthorized
    })?;

    let host = header_str(&headers, header::HOST.as_str()).unwrap_or_default();
    let storage_url = format!("{}://{}{}", state.scheme.as_str(), host, STORAGE_ENDPOINT);

    let mut response = StatusCode::OK.into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(X_AUTH_TOKEN, header_value(&token)?);
    response_headers.insert(X_STORAGE_URL, header_value(&storage_url)?);

    info!("User {} authenticated", user);
    Ok(response)
}

async fn handle_storage(
    State(state): State<SharedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    if let Err(err) = state
        .authenticator
        .verify_token(header_str(&headers, X_AUTH_TOKEN))
    {
        error!("Rejected {} {}: {}", method, uri.path(), err);
        return Err(ApiError::Unauthorized);
    }

    let target = request_target(&uri)?;
    if method == Method::GET {
        return handle_get(&state, &target).await;
    }

    let resource = state.layout.resolve(&target).map_err(|err| {
        warn!("Bad target {:?}: {}", target, err);
        ApiError::BadRequest
    })?;

    match method {
        Method::HEAD => handle_get_metadata(&state, &resource).await,
        Method::PUT => handle_creation(&state, &resource, &headers, body).await,
        Method::POST => handle_post_metadata(&state, &resource, &headers).await,
        _ => {
            warn!("Unsupported method {} on {}", method, target);
            Err(ApiError::BadRequest)
        }
    }
}

/// Percent-decoded target below the storage endpoint; empty for the
/// endpoint itself.
fn request_target(uri: &Uri) -> Result<String, ApiError> {
    let raw = uri
        .path()
        .strip_prefix(STORAGE_ENDPOINT)
        .map(|rest| rest.strip_prefix('/').unwrap_or(rest))
        .ok_or(ApiError::BadRequest)?;

    percent_decode_str(raw)
        .decode_utf8()
        .map(|target| target.into_owned())
        .map_err(|err| {
            warn!("Failed to decode target {:?}: {}", raw, err);
            ApiError::BadRequest
        })
}

/// Runs filesystem work that has no async counterpart off the runtime
/// threads.
async fn run_blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|err| {
        error!("Blocking storage task failed: {}", err);
        ApiError::Internal
    })
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|err| {
        error!("Cannot send {:?} as a header: {}", value, err);
        ApiError::Internal
    })
}

async fn handle_get(state: &AppState, target: &str) -> Result<Response, ApiError> {
    if sanitize(target) != CAPABILITIES_TARGET {
        error!("Refused read of {:?}", target);
        return Err(ApiError::Forbidden);
    }

    let path = state.layout.capabilities_path();
    let data = tokio::fs::read(&path).await.map_err(|err| {
        error!("Failed to read {}: {}", path.display(), err);
        if err.kind() == io::ErrorKind::NotFound {
            ApiError::NotFound
        } else {
            ApiError::Internal
        }
    })?;
    let etag = hex::encode(Md5::digest(&data));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ETAG, etag)
        .body(Body::from(data))
        .map_err(|err| {
            error!("Failed to build capabilities response: {}", err);
            ApiError::Internal
        })
}

async fn handle_get_metadata(state: &AppState, resource: &Resource) -> Result<Response, ApiError> {
    let path = state.layout.metadata_path(resource);
    let loaded = run_blocking(move || metadata::load(&path)).await?;
    let metadata = loaded.map_err(|err| {
        error!("Failed to read metadata for {:?}: {}", resource, err);
        match err {
            MetadataError::NotFound(_) | MetadataError::Parse { .. } => ApiError::NotFound,
            _ => ApiError::Internal,
        }
    })?;

    let prefix = if resource.is_container() {
        CONTAINER_META_PREFIX
    } else {
        OBJECT_META_PREFIX
    };
    let mut response = StatusCode::OK.into_response();
    emit_metadata(response.headers_mut(), prefix, &metadata);
    Ok(response)
}

async fn handle_creation(
    state: &AppState,
    resource: &Resource,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let created = match resource {
        Resource::Container { .. } => create_container(state, resource).await?,
        Resource::Object { .. } => {
            write_object(state, resource, body).await?;
            true
        }
    };

    let incoming = parse_metadata(headers);
    store_metadata(state, resource, incoming).await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::ACCEPTED
    };
    Ok(status.into_response())
}

/// Creates the container directory, returning false when it already exists.
async fn create_container(state: &AppState, resource: &Resource) -> Result<bool, ApiError> {
    let dir = state.layout.path_of(resource);
    match tokio::fs::create_dir(&dir).await {
        Ok(()) => {
            info!("Created container {}", dir.display());
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => {
            error!("Failed to create container {}: {}", dir.display(), err);
            Err(ApiError::from_io(&err))
        }
    }
}

/// Streams the request body into the object file, replacing any previous
/// content.
async fn write_object(state: &AppState, resource: &Resource, body: Body) -> Result<(), ApiError> {
    let path = state.layout.path_of(resource);
    let mut file = tokio::fs::File::create(&path).await.map_err(|err| {
        error!("Failed to create {}: {}", path.display(), err);
        ApiError::from_io(&err)
    })?;

    let write_failed = |err: io::Error| {
        error!("Failed to write {}: {}", path.display(), err);
        write_error(&err)
    };

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| {
            error!("Failed to receive body for {}: {}", path.display(), err);
            ApiError::Internal
        })?;
        file.write_all(&chunk).await.map_err(write_failed)?;
    }
    file.flush().await.map_err(write_failed)?;

    info!("Created: {}", path.display());
    Ok(())
}

/// An object file that already exists cannot go missing mid-write, so only
/// running out of space is reported as such.
fn write_error(err: &io::Error) -> ApiError {
    match ApiError::from_io(err) {
        ApiError::InsufficientStorage => ApiError::InsufficientStorage,
        _ => ApiError::Internal,
    }
}

/// Containers accumulate metadata across writes; objects keep only the last
/// set they were given.
async fn store_metadata(
    state: &AppState,
    resource: &Resource,
    incoming: Metadata,
) -> Result<Metadata, ApiError> {
    let path = state.layout.metadata_path(resource);
    let is_container = resource.is_container();
    let result = run_blocking(move || {
        if is_container {
            metadata::upsert(&path, &incoming)
        } else {
            metadata::replace(&path, &incoming).map(|()| incoming)
        }
    })
    .await?;

    result.map_err(|err| {
        error!("Failed to store metadata for {:?}: {}", resource, err);
        ApiError::from_metadata(&err)
    })
}

async fn handle_post_metadata(
    state: &AppState,
    resource: &Resource,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let incoming = parse_metadata(headers);

    match resource {
        Resource::Container { .. } => {
            let merged = store_metadata(state, resource, incoming).await?;
            if merged.get(STATUS_KEY).map(String::as_str) == Some(STATUS_COMPLETE) {
                mark_complete(state, resource).await;
            }
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Resource::Object { .. } => {
            let object = state.layout.path_of(resource);
            let is_file = tokio::fs::metadata(&object)
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false);
            if !is_file {
                error!("Metadata update for missing object {}", object.display());
                return Err(ApiError::NotFound);
            }
            store_metadata(state, resource, incoming).await?;
            Ok(StatusCode::ACCEPTED.into_response())
        }
    }
}

/// Drops the empty `complete` marker into the container. Failing to do so
/// does not fail the request.
async fn mark_complete(state: &AppState, resource: &Resource) {
    let marker = state.layout.complete_marker_path(resource);
    match tokio::fs::File::create(&marker).await {
        Ok(_) => info!("Container {} marked complete", resource.container()),
        Err(err) => error!("Failed to create {}: {}", marker.display(), err),
    }
}
