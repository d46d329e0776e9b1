use crate::ids::{ApiKeyId, BuyerId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a request was authenticated/gated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    ApiKey,
    PayPerCall,
}

/// A deferred x402 payment: verified but not yet settled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredPayment {
    pub payer_address: String,
    pub payload_b64: String,
    pub requirements_json: serde_json::Value,
}

/// A settled x402 payment, recorded once `/settle` succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettledPayment {
    pub tx_hash: String,
    pub payer_address: String,
}

/// Per-request context threaded through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub buyer_id: BuyerId,
    pub buyer_wallet_address: String,
    pub api_key_id: Option<ApiKeyId>,
    pub rate_limit_rpm: u32,
    pub request_id: RequestId,
    pub received_at: DateTime<Utc>,
    pub auth_mode: AuthMode,
    pub deferred_payment: Option<DeferredPayment>,
    pub settled_payment: Option<SettledPayment>,
}
