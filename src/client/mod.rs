//! Client side of the session lifecycle.
//!
//! - [`store`]: persisted tokens and profile, saved and cleared as a unit.
//! - [`guard`]: synchronous pre-navigation check with forced-change redirects.
//! - [`coordinator`]: attaches the bearer token and performs single-flight refresh.
//! - [`transport`]: HTTP access and response classification.
//!
//! Decoding on this side is unverified and only drives redirects; the server
//! always checks signatures and revocation.

pub mod coordinator;
pub mod errors;
pub mod guard;
pub mod store;
pub mod transport;

pub use coordinator::RefreshCoordinator;
pub use errors::SessionError;
pub use guard::{CHANGE_PASSWORD_ROUTE, LOGIN_ROUTE, Navigation};
pub use store::{FileSessionStore, MemorySessionStore, SessionProfile, SessionStore, StoredSession};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, PASSWORD_PATH, Signal, Transport};

#[cfg(test)]
pub(crate) mod test_support {
    use super::store::{SessionProfile, StoredSession};
    use crate::session::{AccessClaims, Role, TokenError, token::sign_hs256};
    use uuid::Uuid;

    const CLIENT_TEST_SECRET: &[u8] = b"client-side-tests-never-verify-this";

    pub(crate) fn access_token(subject: Uuid, exp: i64, pcr: bool) -> Result<String, TokenError> {
        sign_hs256(
            CLIENT_TEST_SECRET,
            &AccessClaims {
                iss: "tesis-test".to_string(),
                sub: subject,
                role: Role::Student,
                iat: 0,
                exp,
                jti: Uuid::new_v4(),
                pcr,
            },
        )
    }

    pub(crate) fn stored_session(exp: i64, pcr: bool) -> Result<StoredSession, TokenError> {
        let subject = Uuid::new_v4();
        Ok(StoredSession {
            access_token: access_token(subject, exp, pcr)?,
            refresh_token: "stored-refresh".to_string(),
            profile: SessionProfile {
                subject,
                role: Role::Student,
                password_change_required: pcr,
                expires_at: exp,
            },
        })
    }
}
