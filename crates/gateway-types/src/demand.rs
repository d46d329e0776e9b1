use crate::ids::{BuyerId, ListingId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Typed demand-signal event kinds forwarded to the external pricing/auction
/// engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DemandSignalType {
    ApiCall,
    View,
    RateLimited,
    SandboxTest,
}

impl DemandSignalType {
    /// The fixed weight associated with each signal type.
    pub fn default_weight(&self) -> f64 {
        match self {
            DemandSignalType::ApiCall => 1.0,
            DemandSignalType::View => 0.2,
            DemandSignalType::RateLimited => 1.5,
            DemandSignalType::SandboxTest => 0.5,
        }
    }
}

/// A demand-signal event: `emit({listingId, buyerId, type, weight, metadata})`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandSignal {
    pub listing_id: ListingId,
    pub buyer_id: BuyerId,
    pub signal_type: DemandSignalType,
    pub weight: f64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
