use serde::{Deserialize, Serialize};

/// The authenticated caller, as resolved against the upstream forge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub login: String,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// The configured organisation the membership check ran against.
    pub org: String,
    /// Team slugs within `org`, in the order the forge returned them.
    pub teams: Vec<String>,
}

/// Closed set of reasons a credential can be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    NotMember,
    ClassicPat,
    RateLimited,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Label used for the `result` dimension of the validation counter.
    pub fn result_label(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::NotMember | Self::ClassicPat => "forbidden",
            Self::RateLimited => "rate_limited",
            Self::Cancelled => "cancelled",
            Self::Internal => "error",
        }
    }
}

/// A cached validation decision.  Exactly one variant per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Authorized(Identity),
    Denied(ErrorKind),
}

/// Error returned by [`crate::auth::validator::Validator::validate`].
///
/// Every upstream failure is translated into one of these variants; the
/// wrapped detail of [`ValidationError::Internal`] is for logs only and must
/// not be forwarded to untrusted callers.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("unauthorized: invalid or revoked token")]
    Unauthorized,
    #[error("forbidden: user is not a member of the organization")]
    NotMember,
    #[error("forbidden: classic PATs are not allowed, use a fine-grained PAT")]
    ClassicPat,
    #[error("rate limited: upstream API rate limit exceeded")]
    RateLimited,
    #[error("validation cancelled before the upstream call completed")]
    Cancelled,
    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::NotMember => ErrorKind::NotMember,
            Self::ClassicPat => ErrorKind::ClassicPat,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<ErrorKind> for ValidationError {
    /// Rebuild an error from a cached denial.
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Unauthorized => Self::Unauthorized,
            ErrorKind::NotMember => Self::NotMember,
            ErrorKind::ClassicPat => Self::ClassicPat,
            ErrorKind::RateLimited => Self::RateLimited,
            ErrorKind::Cancelled => Self::Cancelled,
            ErrorKind::Internal => Self::Internal(anyhow::anyhow!("cached internal error")),
        }
    }
}
