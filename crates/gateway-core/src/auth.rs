//! API-key authentication. Header extraction, prefix+hash lookup,
//! and the key's activation/expiry/IP checks. The `last_used_at` touch is
//! fire-and-forget: its failure is logged but never turned into a request error.

use chrono::Utc;
use gateway_types::{ApiKeyState, GatewayError, GatewayResult, RequestContext};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::jobs::JobQueue;
use crate::store::PersistenceStore;

const MIN_SECRET_LENGTH: usize = 12;
const PREFIX_LENGTH: usize = 8;

/// A minimal view over inbound request metadata the authenticator needs.
/// `gateway-service` builds this from the framework's header map and
/// connection info before calling [`Authenticator::authenticate`].
pub struct InboundRequest<'a> {
    pub bearer_header: Option<&'a str>,
    pub nexusx_key_header: Option<&'a str>,
    pub api_key_query_param: Option<&'a str>,
    pub forwarded_for_header: Option<&'a str>,
    pub peer_addr: &'a str,
}

impl<'a> InboundRequest<'a> {
    /// Key extraction order: `Authorization: Bearer`, then
    /// `X-NexusX-Key`, then the `api_key` query parameter.
    fn presented_secret(&self) -> Option<&'a str> {
        self.bearer_header
            .and_then(|v| v.strip_prefix("Bearer "))
            .or(self.nexusx_key_header)
            .or(self.api_key_query_param)
    }

    /// First entry of `X-Forwarded-For`, else the transport peer address.
    fn client_ip(&self) -> &'a str {
        self.forwarded_for_header
            .and_then(|v| v.split(',').next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(self.peer_addr)
    }
}

pub struct Authenticator {
    store: Arc<dyn PersistenceStore>,
    jobs: Arc<JobQueue>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn PersistenceStore>, jobs: Arc<JobQueue>) -> Self {
        Self { store, jobs }
    }

    pub async fn authenticate(&self, request: &InboundRequest<'_>) -> GatewayResult<RequestContext> {
        let secret = request.presented_secret().ok_or(GatewayError::Unauthorized)?;
        if secret.len() < MIN_SECRET_LENGTH {
            return Err(GatewayError::InvalidKey);
        }
        if secret.len() < PREFIX_LENGTH {
            return Err(GatewayError::InvalidKey);
        }
        let prefix = &secret[..PREFIX_LENGTH];

        let record = self
            .store
            .lookup_api_key(prefix)
            .await
            .map_err(|_| GatewayError::Internal("key store lookup failed".to_string()))?
            .ok_or(GatewayError::InvalidKey)?;

        if !constant_time_eq(&sha256_hex(secret), &record.secret_hash) {
            return Err(GatewayError::InvalidKey);
        }
        if record.state != ApiKeyState::Active {
            return Err(GatewayError::KeyInactive);
        }
        let now = Utc::now();
        if record.is_expired(now) {
            return Err(GatewayError::KeyExpired);
        }
        let ip = request.client_ip();
        if !record.ip_allowed(ip) {
            return Err(GatewayError::IpRestricted);
        }

        let key_id = record.id;
        self.jobs.spawn("touch_api_key", {
            let store = Arc::clone(&self.store);
            async move {
                if let Err(err) = store.touch_api_key(key_id, Utc::now()).await {
                    warn!(%err, key_id = %key_id, "failed to update api key last_used_at");
                }
            }
        });

        Ok(RequestContext {
            buyer_id: record.owner_user_id,
            buyer_wallet_address: record.wallet_address,
            api_key_id: Some(record.id),
            rate_limit_rpm: record.rate_limit_rpm,
            request_id: Uuid::new_v4(),
            received_at: now,
            auth_mode: gateway_types::AuthMode::ApiKey,
            deferred_payment: None,
            settled_payment: None,
        })
    }
}

fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time string comparison to avoid leaking hash-match progress
/// through response timing.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use gateway_types::ApiKeyRecord;

    fn seeded_key(prefix: &str, secret: &str) -> (Arc<InMemoryStore>, ApiKeyRecord) {
        let store = Arc::new(InMemoryStore::new());
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            prefix: prefix.to_string(),
            secret_hash: sha256_hex(secret),
            state: ApiKeyState::Active,
            rate_limit_rpm: 600,
            ip_allow_list: vec![],
            expires_at: None,
            wallet_address: "0xbuyer".to_string(),
            last_used_at: None,
            created_at: Utc::now(),
        };
        store.seed_api_key(record.clone());
        (store, record)
    }

    #[tokio::test]
    async fn admits_valid_bearer_key() {
        let secret = "nxs_live_abcdef1234567890";
        let (store, record) = seeded_key(&secret[..PREFIX_LENGTH], secret);
        let auth = Authenticator::new(store, Arc::new(JobQueue::new(8)));
        let header = format!("Bearer {secret}");
        let request = InboundRequest {
            bearer_header: Some(&header),
            nexusx_key_header: None,
            api_key_query_param: None,
            forwarded_for_header: None,
            peer_addr: "10.0.0.1",
        };
        let ctx = auth.authenticate(&request).await.unwrap();
        assert_eq!(ctx.buyer_id, record.owner_user_id);
        assert_eq!(ctx.api_key_id, Some(record.id));
    }

    #[tokio::test]
    async fn rejects_short_secrets() {
        let store = Arc::new(InMemoryStore::new());
        let auth = Authenticator::new(store, Arc::new(JobQueue::new(8)));
        let request = InboundRequest {
            bearer_header: Some("Bearer short"),
            nexusx_key_header: None,
            api_key_query_param: None,
            forwarded_for_header: None,
            peer_addr: "10.0.0.1",
        };
        let err = auth.authenticate(&request).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidKey));
    }

    #[tokio::test]
    async fn rejects_unknown_prefix() {
        let store = Arc::new(InMemoryStore::new());
        let auth = Authenticator::new(store, Arc::new(JobQueue::new(8)));
        let request = InboundRequest {
            bearer_header: Some("Bearer nxs_live_zzzzzzzzzzzzzzzz"),
            nexusx_key_header: None,
            api_key_query_param: None,
            forwarded_for_header: None,
            peer_addr: "10.0.0.1",
        };
        let err = auth.authenticate(&request).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidKey));
    }

    #[tokio::test]
    async fn enforces_ip_allow_list() {
        let secret = "nxs_live_abcdef1234567890";
        let (store, record) = seeded_key(&secret[..PREFIX_LENGTH], secret);
        let mut restricted = record.clone();
        restricted.ip_allow_list = vec!["203.0.113.5".to_string()];
        store.seed_api_key(restricted);

        let auth = Authenticator::new(store, Arc::new(JobQueue::new(8)));
        let header = format!("Bearer {secret}");
        let request = InboundRequest {
            bearer_header: Some(&header),
            nexusx_key_header: None,
            api_key_query_param: None,
            forwarded_for_header: Some("198.51.100.9, 203.0.113.5"),
            peer_addr: "10.0.0.1",
        };
        let err = auth.authenticate(&request).await.unwrap_err();
        assert!(matches!(err, GatewayError::IpRestricted));
    }

    #[tokio::test]
    async fn falls_back_through_extraction_order() {
        let secret = "nxs_live_abcdef1234567890";
        let (store, record) = seeded_key(&secret[..PREFIX_LENGTH], secret);
        let auth = Authenticator::new(store, Arc::new(JobQueue::new(8)));
        let request = InboundRequest {
            bearer_header: None,
            nexusx_key_header: None,
            api_key_query_param: Some(secret),
            forwarded_for_header: None,
            peer_addr: "10.0.0.1",
        };
        let ctx = auth.authenticate(&request).await.unwrap();
        assert_eq!(ctx.api_key_id, Some(record.id));
    }
}
