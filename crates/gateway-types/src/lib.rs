//! Core types and data structures for the NexusX API-monetization gateway.
//!
//! This crate holds the request-path data model: listing routes, API keys,
//! the per-request context, transaction/bundle records, reliability samples,
//! and demand signals. It has no I/O of its own — `gateway-core` owns the
//! behavior that reads and writes these types.

pub mod api_key;
pub mod bundle;
pub mod decimal;
pub mod demand;
pub mod error;
pub mod ids;
pub mod reliability;
pub mod request_context;
pub mod route;
pub mod transaction;

pub use api_key::{ApiKeyRecord, ApiKeyState};
pub use bundle::{
    BundleExecutionSession, BundleProviderSettlementRow, BundleRegisterRequest,
    BundleSessionFinalizeResult, BundleSessionStatus, StepAllocation,
};
pub use decimal::{clamp, fee_split, format6, round4, round6, round8, to_atomic_units_string, Usdc};
pub use demand::{DemandSignal, DemandSignalType};
pub use error::{GatewayError, GatewayResult};
pub use ids::{ApiKeyId, BundleSessionId, BuyerId, ListingId, RequestId, TransactionId};
pub use reliability::{ReliabilityRecordPoint, ReliabilityScore, MAX_RELIABILITY_ENTRIES};
pub use request_context::{AuthMode, DeferredPayment, RequestContext, SettledPayment};
pub use route::{Route, RouteState};
pub use transaction::{BillingMode, FeeSplitAmounts, TransactionRecord, TransactionStatus};
