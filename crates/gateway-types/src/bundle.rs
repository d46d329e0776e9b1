use crate::decimal::Usdc;
use crate::ids::{ApiKeyId, BundleSessionId, BuyerId, ListingId, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bundle execution session lifecycle state, a directed graph:
/// `REGISTERED -> IN_PROGRESS -> FINALIZED`, with `EXPIRED`/`CANCELLED` as
/// alternate terminal states reachable from the two non-terminal states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BundleSessionStatus {
    Registered,
    InProgress,
    Finalized,
    Expired,
    Failed,
    Cancelled,
}

impl BundleSessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BundleSessionStatus::Finalized
                | BundleSessionStatus::Expired
                | BundleSessionStatus::Failed
                | BundleSessionStatus::Cancelled
        )
    }
}

/// A bundle execution session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleExecutionSession {
    pub id: BundleSessionId,
    pub buyer_id: BuyerId,
    pub api_key_id: ApiKeyId,
    pub bundle_slug: String,
    pub tool_slugs: Vec<String>,
    pub status: BundleSessionStatus,
    pub registered_gross_price: Usdc,
    pub target_bundle_price: Usdc,
    pub executed_gross_price: Usdc,
    pub billed_price: Usdc,
    pub discount: Usdc,
    pub platform_fee: Usdc,
    pub provider_pool: Usdc,
    pub platform_fee_rate: Usdc,
    pub expires_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl BundleExecutionSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// The tool slug registered at a given step index, if any.
    pub fn slug_at(&self, step_index: u32) -> Option<&str> {
        self.tool_slugs
            .get(step_index as usize)
            .map(|s| s.as_str())
    }
}

/// A single per-step allocation produced by finalize's largest-remainder
/// apportionment, before it is written back as settlement
/// rows and transaction updates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepAllocation {
    pub transaction_id: TransactionId,
    pub listing_id: ListingId,
    pub quoted_price: Usdc,
    pub weight: Usdc,
    pub allocated_price: Usdc,
    pub allocated_fee: Usdc,
    pub allocated_provider_amount: Usdc,
}

/// A bundle provider settlement row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleProviderSettlementRow {
    pub bundle_session_id: BundleSessionId,
    pub transaction_id: TransactionId,
    pub listing_id: ListingId,
    pub list_price: Usdc,
    pub weight: Usdc,
    pub allocated_price: Usdc,
    pub platform_fee: Usdc,
    pub provider_amount: Usdc,
}

/// The result of a `finalize` call: either a freshly computed settlement or
/// the replayed result of a prior, already-finalized call, byte-identical
/// on every replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSessionFinalizeResult {
    pub session_id: BundleSessionId,
    pub status: BundleSessionStatus,
    pub executed_gross_price: Usdc,
    pub billed_price: Usdc,
    pub discount: Usdc,
    pub platform_fee: Usdc,
    pub provider_pool: Usdc,
    pub allocations: Vec<BundleProviderSettlementRow>,
    pub finalized_at: DateTime<Utc>,
}

/// Input to `BundleEngine::register`.
#[derive(Debug, Clone, Deserialize)]
pub struct BundleRegisterRequest {
    pub buyer_id: BuyerId,
    pub api_key_id: ApiKeyId,
    pub bundle_slug: String,
    pub tool_slugs: Vec<String>,
    pub target_bundle_price: Usdc,
    pub platform_fee_rate: Usdc,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
