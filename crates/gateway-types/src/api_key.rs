use crate::ids::{ApiKeyId, BuyerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an API key record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyState {
    Active,
    Inactive,
    Revoked,
}

/// An API-key record. The full secret is never
/// stored; only its SHA-256 hash and an 8-character lookup prefix are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: ApiKeyId,
    pub owner_user_id: BuyerId,
    pub prefix: String,
    pub secret_hash: String,
    pub state: ApiKeyState,
    pub rate_limit_rpm: u32,
    #[serde(default)]
    pub ip_allow_list: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub wallet_address: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    /// Empty allow-list means "any IP".
    pub fn ip_allowed(&self, ip: &str) -> bool {
        self.ip_allow_list.is_empty() || self.ip_allow_list.iter().any(|allowed| allowed == ip)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample() -> ApiKeyRecord {
        ApiKeyRecord {
            id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            prefix: "nxs_test".to_string(),
            secret_hash: "deadbeef".to_string(),
            state: ApiKeyState::Active,
            rate_limit_rpm: 60,
            ip_allow_list: vec![],
            expires_at: None,
            wallet_address: "0xabc".to_string(),
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn empty_allow_list_permits_any_ip() {
        let key = sample();
        assert!(key.ip_allowed("1.2.3.4"));
    }

    #[test]
    fn non_empty_allow_list_restricts() {
        let mut key = sample();
        key.ip_allow_list = vec!["1.2.3.4".to_string()];
        assert!(key.ip_allowed("1.2.3.4"));
        assert!(!key.ip_allowed("9.9.9.9"));
    }

    #[test]
    fn expiry_exactly_now_is_expired() {
        let mut key = sample();
        let now = Utc::now();
        key.expires_at = Some(now);
        assert!(key.is_expired(now));
    }
}
