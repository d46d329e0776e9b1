use crate::decimal::Usdc;
use crate::ids::{BundleSessionId, BuyerId, ListingId, RequestId, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transaction status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
    Refunded,
    Disputed,
}

/// Billing mode for a transaction record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    Individual,
    BundleStep,
}

/// A {price, platform_fee, provider_amount} triple, always satisfying
/// `price = platform_fee + provider_amount` on the 6-decimal grid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct FeeSplitAmounts {
    pub price: Usdc,
    pub platform_fee: Usdc,
    pub provider_amount: Usdc,
}

/// A persisted transaction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub request_id: RequestId,
    pub listing_id: ListingId,
    pub buyer_id: BuyerId,
    pub status: TransactionStatus,
    pub billing_mode: BillingMode,
    pub bundle_session_id: Option<BundleSessionId>,
    pub bundle_step_index: Option<u32>,
    pub settled_via_bundle: bool,
    pub realized: FeeSplitAmounts,
    pub fee_rate_applied: Usdc,
    pub quoted: Option<FeeSplitAmounts>,
    pub response_time_ms: u64,
    pub http_status: u16,
    pub bytes_transferred: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// The quoted price, falling back to the realized price when no quote
    /// exists, as used by the bundle finalizer's `executed_gross` sum.
    pub fn quoted_or_realized_price(&self) -> Usdc {
        self.quoted
            .map(|q| q.price)
            .unwrap_or(self.realized.price)
    }
}
