//! Typed roles and the single capability check used by every call site.
//!
//! Roles travel inside access tokens as snake_case strings. Legacy numeric
//! identifiers are only understood at the storage boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

/// Actor role within the thesis platform.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Advisor,
    Coordinator,
    Admin,
}

/// Actions gated by role.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Capability {
    SubmitProposals,
    ReviewProposals,
    ManageCalendar,
    ResetCredentials,
}

impl Role {
    /// Whether this role is allowed to perform `capability`.
    #[must_use]
    pub const fn can(self, capability: Capability) -> bool {
        match capability {
            Capability::SubmitProposals => matches!(self, Self::Student),
            Capability::ReviewProposals => {
                matches!(self, Self::Advisor | Self::Coordinator | Self::Admin)
            }
            Capability::ManageCalendar => matches!(self, Self::Coordinator | Self::Admin),
            Capability::ResetCredentials => matches!(self, Self::Admin),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Advisor => "advisor",
            Self::Coordinator => "coordinator",
            Self::Admin => "admin",
        }
    }

    /// Parse the persisted role column. Accepts the textual form and the
    /// numeric ids still present in older rows.
    pub(crate) fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value.trim() {
            "1" => Ok(Self::Admin),
            "2" => Ok(Self::Student),
            "3" => Ok(Self::Advisor),
            "4" => Ok(Self::Coordinator),
            other => other.parse().map_err(|_| {
                sqlx::Error::Decode(Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid accounts.role value: {value}"),
                )))
            }),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "student" => Ok(Self::Student),
            "advisor" => Ok(Self::Advisor),
            "coordinator" => Ok(Self::Coordinator),
            "admin" => Ok(Self::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}
