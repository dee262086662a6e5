use thiserror::Error;

use super::guard::{CHANGE_PASSWORD_ROUTE, LOGIN_ROUTE};

/// Outcome of a client call that did not produce a usable response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// No session, or the session was invalidated and purged.
    #[error("not authenticated")]
    Unauthenticated,
    /// The access token was still rejected as expired after one refresh.
    #[error("access token expired")]
    Expired,
    #[error("password change required")]
    PasswordChangeRequired,
    #[error("too many requests, retry after {retry_after_seconds}s")]
    Throttled { retry_after_seconds: u64 },
    /// The coordinator was closed while the request waited for a refresh.
    #[error("request cancelled")]
    Cancelled,
    /// The server refused the request, e.g. a wrong current password.
    #[error("request rejected with status {status}")]
    Rejected { status: u16, error: Option<String> },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("session store error: {0}")]
    Store(String),
}

impl SessionError {
    /// Route the host should navigate to, if any.
    #[must_use]
    pub const fn redirect(&self) -> Option<&'static str> {
        match self {
            Self::Unauthenticated => Some(LOGIN_ROUTE),
            Self::PasswordChangeRequired => Some(CHANGE_PASSWORD_ROUTE),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_session_ending_errors_redirect() {
        assert_eq!(SessionError::Unauthenticated.redirect(), Some("/login"));
        assert_eq!(
            SessionError::PasswordChangeRequired.redirect(),
            Some("/change-password")
        );
        assert_eq!(SessionError::Expired.redirect(), None);
        assert_eq!(
            SessionError::Throttled {
                retry_after_seconds: 3
            }
            .redirect(),
            None
        );
        assert_eq!(SessionError::Cancelled.redirect(), None);
        assert_eq!(
            SessionError::Rejected {
                status: 400,
                error: Some("invalid_request".to_string())
            }
            .redirect(),
            None
        );
    }
}
