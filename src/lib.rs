//! # Tesis (session and credential lifecycle)
//!
//! `tesis` issues and rotates the credentials of the thesis management
//! platform: short-lived HS256 access tokens, opaque rotating refresh tokens and
//! a revocation registry that lets logout and password changes take effect
//! before a token expires.
//!
//! ## Server
//!
//! The [`api`] module serves login, registration, refresh, logout, password
//! change, session introspection and the administrative reset under `/v1`.
//! Abuse throttling is applied per client address and the forced password
//! change gate is enforced on every protected endpoint.
//!
//! ## Client
//!
//! The [`client`] module holds what a frontend needs to consume the service: a
//! persisted session store, a synchronous navigation guard and a refresh
//! coordinator that performs exactly one refresh for any number of concurrent
//! requests that hit an expired token.

pub mod api;
pub mod cli;
pub mod client;
pub mod session;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
