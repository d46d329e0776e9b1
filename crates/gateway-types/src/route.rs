use crate::decimal::Usdc;
use crate::ids::ListingId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a listing route.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    Active,
    Paused,
    Suspended,
    Other,
}

impl RouteState {
    /// Routes whose lifecycle is ACTIVE or PAUSED are admitted to the
    /// resolver's cache; SUSPENDED/Other are served (if looked up directly)
    /// but never cached.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, RouteState::Active | RouteState::Paused)
    }

    /// Only ACTIVE routes may serve traffic under pay-per-call or bundle
    /// registration.
    pub fn is_active(&self) -> bool {
        matches!(self, RouteState::Active)
    }
}

/// A listing's upstream route, read-only at request time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: ListingId,
    pub slug: String,
    pub upstream_base_url: String,
    pub capacity_requests_per_minute: u32,
    pub current_price: Usdc,
    pub floor_price: Usdc,
    pub provider_payout_address: String,
    pub state: RouteState,
    pub sandbox: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cacheability_matches_lifecycle() {
        assert!(RouteState::Active.is_cacheable());
        assert!(RouteState::Paused.is_cacheable());
        assert!(!RouteState::Suspended.is_cacheable());
        assert!(!RouteState::Other.is_cacheable());
    }
}
