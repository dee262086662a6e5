//! Server-side session core.
//!
//! Access tokens are short-lived HS256 JWTs. Refresh tokens are opaque, stored
//! hashed, and rotate on every use. Logout, password changes and admin resets
//! go through the revocation registry so already-issued access tokens stop
//! working immediately instead of at expiry.

pub mod credentials;
pub mod error;
pub mod issuer;
pub mod postgres;
pub mod refresh;
pub mod revocation;
pub mod role;
pub mod service;
pub mod token;

pub use credentials::{
    Account, AccountStore, CredentialValidator, Identity, MemoryAccountStore, NewAccount,
};
pub use error::AuthError;
pub use issuer::{IssuedTokens, TokenIssuer};
pub use refresh::{MemoryRefreshTokenStore, RefreshTokenStore};
pub use revocation::{MemoryRevocationRegistry, RevocationRegistry};
pub use role::{Capability, Role};
pub use service::{PruneReport, Registration, SessionService, SessionView};
pub use token::{AccessClaims, TokenError};
