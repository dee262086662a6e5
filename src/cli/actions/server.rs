use crate::{
    api::{
        self,
        handlers::{
            Storage,
            auth::{AuthConfig, AuthState, WindowRateLimiter},
        },
    },
    cli::telemetry,
    session::{
        MemoryAccountStore, MemoryRefreshTokenStore, MemoryRevocationRegistry, SessionService,
        postgres::{PgAccountStore, PgRefreshTokenStore, PgRevocationRegistry},
    },
};
use anyhow::Result;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub token_secret: SecretString,
    pub token_issuer: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub frontend_base_url: String,
    pub sweep_interval_seconds: u64,
    pub trust_proxy_headers: bool,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable, the token secret is invalid, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let auth_config = AuthConfig::new(args.frontend_base_url)
        .with_token_issuer(args.token_issuer)
        .with_access_ttl_seconds(args.access_ttl_seconds)
        .with_refresh_ttl_seconds(args.refresh_ttl_seconds)
        .with_sweep_interval_seconds(args.sweep_interval_seconds)
        .with_trust_proxy_headers(args.trust_proxy_headers);
    let issuer = auth_config.token_issuer_with(args.token_secret)?;

    let (service, storage) = if let Some(dsn) = &args.dsn {
        let pool = api::connect(dsn).await?;
        info!("using PostgreSQL session storage");
        let service = SessionService::new(
            issuer,
            Arc::new(PgAccountStore::new(pool.clone())),
            Arc::new(PgRefreshTokenStore::new(pool.clone())),
            Arc::new(PgRevocationRegistry::new(pool.clone())),
        );
        (service, Storage(Some(pool)))
    } else {
        warn!("no DSN configured, session state is kept in memory");
        let service = SessionService::new(
            issuer,
            Arc::new(MemoryAccountStore::new()),
            Arc::new(MemoryRefreshTokenStore::new()),
            Arc::new(MemoryRevocationRegistry::new()),
        );
        (service, Storage::default())
    };

    let auth_state = Arc::new(AuthState::new(
        auth_config,
        service,
        Arc::new(WindowRateLimiter::new()),
    ));

    let result = api::new(args.port, auth_state, storage).await;

    telemetry::shutdown_tracer();

    result
}
