//! HTTP front end of the media storage service.
//!
//! Clients log in on `/auth/v1.0` and then create containers and objects,
//! attach metadata to them and read metadata back below `/v1.0/abc`.

pub mod error;
pub mod headers;
pub mod middleware;
pub mod runtime;
pub mod server;

pub use error::ApiError;
pub use middleware::StatusOverride;
pub use runtime::{serve, spawn_listeners, tls_files, ListenerConfig};
pub use server::{build_router, AppState, Scheme, SharedState, AUTH_ENDPOINT, STORAGE_ENDPOINT};
