//! Rate limiting primitives for auth flows.
//!
//! Counters are fixed windows keyed by client address and action. They live in
//! process memory only and are lost on restart.

use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tracing::warn;

use super::{ClientAddr, state::AuthState, utils::extract_client_ip};
use crate::session::AuthError;

const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    /// Any `/v1` request.
    General,
    /// Login attempts; only failures keep their slot.
    Login,
    Register,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub ceiling: u32,
    /// When false a successful attempt hands its slot back through
    /// [`RateLimiter::release`].
    pub counts_successes: bool,
}

impl RateLimitAction {
    #[must_use]
    pub const fn default_policy(self) -> RateLimitPolicy {
        match self {
            Self::General => RateLimitPolicy {
                window: Duration::from_secs(15 * 60),
                ceiling: 1000,
                counts_successes: true,
            },
            Self::Login => RateLimitPolicy {
                window: Duration::from_secs(15 * 60),
                ceiling: 5,
                counts_successes: false,
            },
            Self::Register => RateLimitPolicy {
                window: Duration::from_secs(60 * 60),
                ceiling: 3,
                counts_successes: true,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after_seconds: u64 },
}

pub trait RateLimiter: Send + Sync {
    /// Admit or reject an attempt. An admitted attempt reserves a slot in the
    /// same critical section as the check; rejected attempts never count.
    fn check_ip(&self, ip: Option<&str>, action: RateLimitAction) -> RateLimitDecision;
    /// Return the slot of an admitted attempt that turned out not to count.
    /// No-op for actions that count successes.
    fn release(&self, ip: Option<&str>, action: RateLimitAction);
    /// Drop windows that have fully elapsed. Returns how many were removed.
    fn prune(&self) -> usize;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check_ip(&self, _ip: Option<&str>, _action: RateLimitAction) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }

    fn release(&self, _ip: Option<&str>, _action: RateLimitAction) {}

    fn prune(&self) -> usize {
        0
    }
}

#[derive(Clone, Copy, Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window limiter keyed by `(client, action)`.
#[derive(Debug)]
pub struct WindowRateLimiter {
    general: RateLimitPolicy,
    login: RateLimitPolicy,
    register: RateLimitPolicy,
    windows: Mutex<HashMap<(String, RateLimitAction), Window>>,
}

impl Default for WindowRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            general: RateLimitAction::General.default_policy(),
            login: RateLimitAction::Login.default_policy(),
            register: RateLimitAction::Register.default_policy(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, action: RateLimitAction, policy: RateLimitPolicy) -> Self {
        match action {
            RateLimitAction::General => self.general = policy,
            RateLimitAction::Login => self.login = policy,
            RateLimitAction::Register => self.register = policy,
        }
        self
    }

    #[must_use]
    pub const fn policy(&self, action: RateLimitAction) -> RateLimitPolicy {
        match action {
            RateLimitAction::General => self.general,
            RateLimitAction::Login => self.login,
            RateLimitAction::Register => self.register,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, RateLimitAction), Window>> {
        // A panic while holding the lock leaves counters usable; keep serving.
        self.windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn key(ip: Option<&str>, action: RateLimitAction) -> (String, RateLimitAction) {
        (ip.unwrap_or(UNKNOWN_CLIENT).to_string(), action)
    }

    fn current<'a>(
        windows: &'a mut HashMap<(String, RateLimitAction), Window>,
        ip: Option<&str>,
        action: RateLimitAction,
        policy: RateLimitPolicy,
        now: Instant,
    ) -> &'a mut Window {
        let window = windows.entry(Self::key(ip, action)).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.saturating_duration_since(window.started) >= policy.window {
            *window = Window {
                started: now,
                count: 0,
            };
        }
        window
    }

    pub fn check_ip_at(
        &self,
        ip: Option<&str>,
        action: RateLimitAction,
        now: Instant,
    ) -> RateLimitDecision {
        let policy = self.policy(action);
        let mut windows = self.lock();
        let window = Self::current(&mut windows, ip, action, policy, now);
        if window.count >= policy.ceiling {
            let remaining = (window.started + policy.window).saturating_duration_since(now);
            let seconds = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            return RateLimitDecision::Limited {
                retry_after_seconds: seconds.max(1),
            };
        }
        window.count += 1;
        RateLimitDecision::Allowed
    }

    pub fn release_at(&self, ip: Option<&str>, action: RateLimitAction, now: Instant) {
        let policy = self.policy(action);
        if policy.counts_successes {
            return;
        }
        let mut windows = self.lock();
        // A reservation from an elapsed window has nothing left to return.
        if let Some(window) = windows.get_mut(&Self::key(ip, action))
            && now.saturating_duration_since(window.started) < policy.window
        {
            window.count = window.count.saturating_sub(1);
        }
    }

    pub fn prune_at(&self, now: Instant) -> usize {
        let mut windows = self.lock();
        let before = windows.len();
        let (general, login, register) = (self.general, self.login, self.register);
        windows.retain(|(_, action), window| {
            let policy = match action {
                RateLimitAction::General => general,
                RateLimitAction::Login => login,
                RateLimitAction::Register => register,
            };
            now.saturating_duration_since(window.started) < policy.window
        });
        before - windows.len()
    }
}

impl RateLimiter for WindowRateLimiter {
    fn check_ip(&self, ip: Option<&str>, action: RateLimitAction) -> RateLimitDecision {
        self.check_ip_at(ip, action, Instant::now())
    }

    fn release(&self, ip: Option<&str>, action: RateLimitAction) {
        self.release_at(ip, action, Instant::now());
    }

    fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }
}

/// Map a limiter decision onto the handler error type.
pub(super) fn enforce(
    limiter: &dyn RateLimiter,
    ip: Option<&str>,
    action: RateLimitAction,
) -> Result<(), AuthError> {
    match limiter.check_ip(ip, action) {
        RateLimitDecision::Allowed => Ok(()),
        RateLimitDecision::Limited {
            retry_after_seconds,
        } => {
            warn!(client = ip.unwrap_or(UNKNOWN_CLIENT), ?action, "rate limited");
            Err(AuthError::Throttled {
                retry_after_seconds,
            })
        }
    }
}

/// Client address used as the throttle key. Proxy headers are consulted only
/// when `trust_proxy_headers` is set; otherwise the socket peer is used.
pub(crate) fn client_key(request: &Request, trust_proxy_headers: bool) -> Option<String> {
    let forwarded = if trust_proxy_headers {
        extract_client_ip(request.headers())
    } else {
        None
    };
    forwarded.or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    })
}

/// Middleware applying the general API ceiling to `/v1` requests.
/// Also records the resolved client address for the handlers.
pub async fn general_rate_limit(mut request: Request, next: Next) -> Response {
    let state = request.extensions().get::<Arc<AuthState>>().cloned();
    let trust_proxy_headers = state
        .as_ref()
        .is_some_and(|state| state.config().trust_proxy_headers());
    let client = client_key(&request, trust_proxy_headers);
    if request.uri().path().starts_with("/v1/")
        && let Some(state) = state
        && let Err(err) = enforce(
            state.rate_limiter(),
            client.as_deref(),
            RateLimitAction::General,
        )
    {
        return err.into_response();
    }
    request.extensions_mut().insert(ClientAddr(client));
    next.run(request).await
}
