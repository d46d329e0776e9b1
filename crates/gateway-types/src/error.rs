use thiserror::Error;

/// The full gateway error taxonomy. Each variant carries its own HTTP status
/// mapping via [`GatewayError::http_status`] and a stable machine-readable
/// code via [`GatewayError::code`].
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid key")]
    InvalidKey,

    #[error("key inactive")]
    KeyInactive,

    #[error("key expired")]
    KeyExpired,

    #[error("ip restricted")]
    IpRestricted,

    #[error("forbidden")]
    Forbidden,

    #[error("listing not found")]
    ListingNotFound,

    #[error("bundle session not found")]
    BundleSessionNotFound,

    #[error("not found")]
    NotFound,

    #[error("payment required")]
    PaymentRequired,

    #[error("payment invalid: {0}")]
    PaymentInvalid(String),

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bundle session expired")]
    BundleSessionExpired,

    #[error("bundle session closed")]
    BundleSessionClosed,

    #[error("bundle step mismatch")]
    BundleStepMismatch,

    #[error("invalid bundle context")]
    InvalidBundleContext,

    #[error("rate limited")]
    RateLimited,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("bad gateway")]
    BadGateway,

    #[error("listing unavailable")]
    ListingUnavailable,

    #[error("bundle settlement unavailable")]
    BundleSettlementUnavailable,

    #[error("gateway timeout")]
    GatewayTimeout,
}

impl GatewayError {
    /// Stable machine-readable error code, as echoed in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidKey => "INVALID_KEY",
            Self::KeyInactive => "KEY_INACTIVE",
            Self::KeyExpired => "KEY_EXPIRED",
            Self::IpRestricted => "IP_RESTRICTED",
            Self::Forbidden => "FORBIDDEN",
            Self::ListingNotFound => "LISTING_NOT_FOUND",
            Self::BundleSessionNotFound => "BUNDLE_SESSION_NOT_FOUND",
            Self::NotFound => "NOT_FOUND",
            Self::PaymentRequired => "PAYMENT_REQUIRED",
            Self::PaymentInvalid(_) => "PAYMENT_INVALID",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::Conflict(_) => "CONFLICT",
            Self::BundleSessionExpired => "BUNDLE_SESSION_EXPIRED",
            Self::BundleSessionClosed => "BUNDLE_SESSION_CLOSED",
            Self::BundleStepMismatch => "BUNDLE_STEP_MISMATCH",
            Self::InvalidBundleContext => "INVALID_BUNDLE_CONTEXT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::BadGateway => "BAD_GATEWAY",
            Self::ListingUnavailable => "LISTING_UNAVAILABLE",
            Self::BundleSettlementUnavailable => "BUNDLE_SETTLEMENT_UNAVAILABLE",
            Self::GatewayTimeout => "GATEWAY_TIMEOUT",
        }
    }

    /// The numeric HTTP status this error maps to, per the table.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::Unauthorized => 401,
            Self::InvalidKey => 401,
            Self::KeyInactive | Self::KeyExpired | Self::IpRestricted | Self::Forbidden => 403,
            Self::ListingNotFound | Self::BundleSessionNotFound | Self::NotFound => 404,
            Self::PaymentRequired | Self::PaymentInvalid(_) | Self::InsufficientFunds => 402,
            Self::Conflict(_)
            | Self::BundleSessionExpired
            | Self::BundleSessionClosed
            | Self::BundleStepMismatch => 409,
            Self::InvalidBundleContext => 400,
            Self::RateLimited => 429,
            Self::Internal(_) => 500,
            Self::BadGateway => 502,
            Self::ListingUnavailable | Self::BundleSettlementUnavailable => 503,
            Self::GatewayTimeout => 504,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(GatewayError::InvalidKey.http_status(), 401);
        assert_eq!(GatewayError::KeyExpired.http_status(), 403);
        assert_eq!(GatewayError::RateLimited.http_status(), 429);
        assert_eq!(GatewayError::GatewayTimeout.http_status(), 504);
        assert_eq!(GatewayError::InsufficientFunds.http_status(), 402);
    }
}
