//! Navigation guard.
//!
//! A purely local decision taken before every protected navigation. It peeks at
//! the cached access token without verifying it and never talks to the server.

use chrono::Utc;
use tracing::{debug, warn};

use super::store::SessionStore;
use crate::session::token::decode_unverified;

pub const LOGIN_ROUTE: &str = "/login";
pub const CHANGE_PASSWORD_ROUTE: &str = "/change-password";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    Allow,
    RedirectToLogin,
    RedirectToPasswordChange,
}

impl Navigation {
    #[must_use]
    pub const fn route(self) -> Option<&'static str> {
        match self {
            Self::Allow => None,
            Self::RedirectToLogin => Some(LOGIN_ROUTE),
            Self::RedirectToPasswordChange => Some(CHANGE_PASSWORD_ROUTE),
        }
    }
}

#[must_use]
pub fn check(store: &dyn SessionStore, destination: &str) -> Navigation {
    check_at(store, destination, Utc::now().timestamp())
}

/// Decide whether `destination` may be shown at `now` (unix seconds).
///
/// A missing, undecodable or expired access token purges the store.
#[must_use]
pub fn check_at(store: &dyn SessionStore, destination: &str, now: i64) -> Navigation {
    let session = match store.load() {
        Ok(Some(session)) => session,
        Ok(None) => return Navigation::RedirectToLogin,
        Err(err) => {
            warn!("failed to load session: {err}");
            purge(store);
            return Navigation::RedirectToLogin;
        }
    };

    let claims = match decode_unverified(&session.access_token) {
        Ok(claims) => claims,
        Err(err) => {
            debug!("stored access token is unreadable: {err}");
            purge(store);
            return Navigation::RedirectToLogin;
        }
    };

    if claims.is_expired_at(now) {
        purge(store);
        return Navigation::RedirectToLogin;
    }

    if (claims.pcr || session.profile.password_change_required)
        && destination != CHANGE_PASSWORD_ROUTE
    {
        return Navigation::RedirectToPasswordChange;
    }

    Navigation::Allow
}

fn purge(store: &dyn SessionStore) {
    if let Err(err) = store.clear() {
        warn!("failed to purge session: {err}");
    }
}
