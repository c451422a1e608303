//! Request logging and the debug status override.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, warn};

use crate::error::status_text;

/// Forced response statuses used to exercise client error handling.
///
/// The raw form is either a single status code applied to every request, or
/// a comma separated list of `prefix:status` pairs matched against the
/// request path and query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOverride {
    Global(StatusCode),
    Prefixed(Vec<(String, StatusCode)>),
}

impl StatusOverride {
    /// Parses the raw setting. Returns `None` when nothing usable is left,
    /// in which case requests are handled normally.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if !raw.contains(',') {
            if let Some(status) = parse_status(raw) {
                return Some(StatusOverride::Global(status));
            }
        }

        let mut prefixes = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            let entry = part
                .split_once(':')
                .filter(|(_, status)| !status.contains(':'))
                .and_then(|(prefix, status)| Some((prefix.to_string(), parse_status(status)?)));
            match entry {
                Some(entry) => prefixes.push(entry),
                None => warn!("Ignoring invalid status override entry {:?}", part),
            }
        }

        if prefixes.is_empty() {
            None
        } else {
            Some(StatusOverride::Prefixed(prefixes))
        }
    }

    /// Status forced for `url`; the longest matching prefix wins.
    pub fn resolve(&self, url: &str) -> Option<StatusCode> {
        match self {
            StatusOverride::Global(status) => Some(*status),
            StatusOverride::Prefixed(prefixes) => prefixes
                .iter()
                .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, status)| *status),
        }
    }
}

fn parse_status(raw: &str) -> Option<StatusCode> {
    raw.trim()
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
}

pub async fn override_status(
    State(status_override): State<Arc<StatusOverride>>,
    request: Request,
    next: Next,
) -> Response {
    let url = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| request.uri().path());

    match status_override.resolve(url) {
        Some(status) => {
            warn!("Forcing status {} for {}", status.as_u16(), url);
            status_text(status)
        }
        None => next.run(request).await,
    }
}

/// Logs one line per request once the response status is known.
pub async fn log_request(request: Request, next: Next) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    let method = request.method().clone();
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let uri = request.uri().to_string();

    let response = next.run(request).await;
    info!(
        "{} {} {}{} : Status {}",
        remote,
        method,
        host,
        uri,
        response.status().as_u16()
    );
    response
}
