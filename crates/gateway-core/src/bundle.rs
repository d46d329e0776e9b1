//! The bundle execution session lifecycle and its atomic finalization
//! algorithm. The pure discount/allocation math lives here so it can
//! be unit-tested independent of any store; [`InMemoryStore`][crate::store::InMemoryStore]
//! calls straight into it from inside its own critical section.

use chrono::{DateTime, Utc};
use gateway_types::{
    BundleExecutionSession, BundleRegisterRequest, BundleSessionId, BundleSessionStatus, BuyerId,
    GatewayError, GatewayResult, Route, StepAllocation, TransactionRecord, Usdc,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

use crate::resolver::RouteResolver;
use crate::store::{FinalizeOutcome, PersistenceStore};

/// `clamp((registered_gross - target) / registered_gross, 0, 0.95)`, the
/// discount fraction of step 6. Zero when `registered_gross` is zero
/// (nothing to discount against).
pub fn compute_discount_fraction(registered_gross: Usdc, target: Usdc) -> Decimal {
    if registered_gross.is_zero() {
        return Decimal::ZERO;
    }
    gateway_types::clamp(
        (registered_gross - target) / registered_gross,
        Decimal::ZERO,
        dec!(0.95),
    )
}

/// Largest-remainder allocation across the selected step transactions.
/// The final step absorbs whatever remains of
/// `billed`/`platform_fee`/`provider_pool` after
/// the earlier steps round independently, so the sums are exact on the
/// 6-decimal grid regardless of how rounding fell for the other steps.
pub fn allocate_steps(
    selected: &[TransactionRecord],
    billed: Usdc,
    platform_fee: Usdc,
    provider_pool: Usdc,
    executed_gross: Usdc,
) -> Vec<StepAllocation> {
    let n = selected.len();
    if n == 0 {
        return Vec::new();
    }

    let mut remaining_price = billed;
    let mut remaining_fee = platform_fee;
    let mut remaining_prov = provider_pool;
    let mut allocations = Vec::with_capacity(n);

    for (i, tx) in selected.iter().enumerate() {
        let quoted = tx.quoted_or_realized_price();
        let weight = if executed_gross.is_zero() {
            Decimal::ONE / Decimal::from(n as u64)
        } else {
            quoted / executed_gross
        };

        let (alloc_price, alloc_fee, alloc_prov) = if i < n - 1 {
            let price = gateway_types::round6(billed * weight);
            let fee = gateway_types::round6(platform_fee * weight);
            let prov = gateway_types::round6(provider_pool * weight);
            remaining_price -= price;
            remaining_fee -= fee;
            remaining_prov -= prov;
            (price, fee, prov)
        } else {
            (remaining_price, remaining_fee, remaining_prov)
        };

        allocations.push(StepAllocation {
            transaction_id: tx.id,
            listing_id: tx.listing_id,
            quoted_price: quoted,
            weight: gateway_types::round8(weight),
            allocated_price: alloc_price,
            allocated_fee: alloc_fee,
            allocated_provider_amount: alloc_prov,
        });
    }

    allocations
}

/// Bundle-session lifecycle operations: registration, per-request
/// step admission, and finalization. Finalization itself is delegated to the
/// [`PersistenceStore`], which is responsible for the serializable-
/// transaction semantics the read-modify-write sequence needs.
pub struct BundleEngine {
    resolver: Arc<RouteResolver>,
    store: Arc<dyn PersistenceStore>,
}

impl BundleEngine {
    pub fn new(resolver: Arc<RouteResolver>, store: Arc<dyn PersistenceStore>) -> Self {
        Self { resolver, store }
    }

    /// register.
    pub async fn register(
        &self,
        request: BundleRegisterRequest,
        now: DateTime<Utc>,
    ) -> GatewayResult<BundleExecutionSession> {
        if request.tool_slugs.is_empty() {
            return Err(GatewayError::InvalidInput(
                "bundle must declare at least one step".to_string(),
            ));
        }
        if request.target_bundle_price <= Decimal::ZERO {
            return Err(GatewayError::InvalidInput(
                "target_bundle_price must be greater than zero".to_string(),
            ));
        }

        let mut routes: Vec<Route> = Vec::with_capacity(request.tool_slugs.len());
        for slug in &request.tool_slugs {
            let route = self
                .resolver
                .resolve_by_slug(slug)
                .await?
                .ok_or(GatewayError::InvalidInput(format!(
                    "unknown listing slug: {slug}"
                )))?;
            if !route.state.is_active() {
                return Err(GatewayError::InvalidInput(format!(
                    "listing not active: {slug}"
                )));
            }
            routes.push(route);
        }

        let registered_gross = gateway_types::round6(routes.iter().map(|r| r.current_price).sum());
        if request.target_bundle_price > registered_gross {
            return Err(GatewayError::InvalidInput(
                "target_bundle_price must not exceed the registered gross price".to_string(),
            ));
        }

        let fee_rate = gateway_types::clamp(request.platform_fee_rate, Decimal::ZERO, Decimal::ONE);
        let expires_at = request
            .expires_at
            .unwrap_or_else(|| now + chrono::Duration::minutes(30));

        let session = BundleExecutionSession {
            id: Uuid::new_v4(),
            buyer_id: request.buyer_id,
            api_key_id: request.api_key_id,
            bundle_slug: request.bundle_slug,
            tool_slugs: request.tool_slugs,
            status: BundleSessionStatus::Registered,
            registered_gross_price: registered_gross,
            target_bundle_price: request.target_bundle_price,
            executed_gross_price: Decimal::ZERO,
            billed_price: Decimal::ZERO,
            discount: Decimal::ZERO,
            platform_fee: Decimal::ZERO,
            provider_pool: Decimal::ZERO,
            platform_fee_rate: fee_rate,
            expires_at,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
            finalized_at: None,
        };

        self.store.register_bundle_session(session.clone()).await?;
        Ok(session)
    }

    pub async fn get(&self, id: BundleSessionId) -> GatewayResult<Option<BundleExecutionSession>> {
        self.store.lookup_bundle_session(id).await
    }

    /// step admission. Validates that a request carrying bundle
    /// headers is allowed to proceed as the claimed step; does not mutate
    /// the session (status transitions are reserved for `finalize`).
    pub fn admit_step<'a>(
        session: &'a BundleExecutionSession,
        buyer_id: BuyerId,
        step_index: u32,
        listing_slug: &str,
        now: DateTime<Utc>,
    ) -> GatewayResult<&'a str> {
        if session.buyer_id != buyer_id {
            return Err(GatewayError::Forbidden);
        }
        if !matches!(
            session.status,
            BundleSessionStatus::Registered | BundleSessionStatus::InProgress
        ) {
            return Err(GatewayError::BundleSessionClosed);
        }
        if session.is_expired(now) {
            return Err(GatewayError::BundleSessionExpired);
        }
        let expected = session
            .slug_at(step_index)
            .ok_or(GatewayError::BundleStepMismatch)?;
        if expected != listing_slug {
            return Err(GatewayError::BundleStepMismatch);
        }
        Ok(expected)
    }

    /// finalize.
    pub async fn finalize(
        &self,
        session_id: BundleSessionId,
        buyer_id: BuyerId,
        now: DateTime<Utc>,
    ) -> GatewayResult<FinalizeOutcome> {
        self.store.finalize_bundle_session(session_id, buyer_id, now).await
    }
}

/// Context threaded from the proxy stage into [`crate::billing::Biller`] when
/// a request carries bundle-session headers.
#[derive(Debug, Clone, Copy)]
pub struct BundleStepHint {
    pub session_id: BundleSessionId,
    pub step_index: u32,
}

impl BundleStepHint {
    pub fn new(session_id: BundleSessionId, step_index: u32) -> Self {
        Self { session_id, step_index }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_types::{BillingMode, FeeSplitAmounts, TransactionStatus};
    use uuid::Uuid;

    fn tx(step_index: u32, quoted: Usdc) -> TransactionRecord {
        TransactionRecord {
            id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            listing_id: Uuid::new_v4(),
            buyer_id: Uuid::new_v4(),
            status: TransactionStatus::Pending,
            billing_mode: BillingMode::BundleStep,
            bundle_session_id: Some(Uuid::new_v4()),
            bundle_step_index: Some(step_index),
            settled_via_bundle: false,
            realized: FeeSplitAmounts::default(),
            fee_rate_applied: dec!(0.15),
            quoted: Some(FeeSplitAmounts {
                price: quoted,
                platform_fee: Decimal::ZERO,
                provider_amount: Decimal::ZERO,
            }),
            response_time_ms: 10,
            http_status: 200,
            bytes_transferred: 128,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn discount_zero_when_target_equals_registered() {
        let d = compute_discount_fraction(dec!(0.010), dec!(0.010));
        assert_eq!(d, Decimal::ZERO);
    }

    #[test]
    fn discount_matches_worked_example() {
        let d = compute_discount_fraction(dec!(0.010), dec!(0.008));
        assert_eq!(d, dec!(0.2));
    }

    #[test]
    fn discount_clamped_to_95_percent() {
        let d = compute_discount_fraction(dec!(1.0), dec!(0.0001));
        assert_eq!(d, dec!(0.95));
    }

    #[test]
    fn allocation_sums_exactly_with_two_steps() {
        let steps = vec![tx(0, dec!(0.006)), tx(1, dec!(0.004))];
        let billed = dec!(0.008);
        let platform_fee = dec!(0.0012);
        let provider_pool = dec!(0.0068);
        let allocations = allocate_steps(&steps, billed, platform_fee, provider_pool, dec!(0.010));

        assert_eq!(allocations.len(), 2);
        assert_eq!(allocations[0].allocated_price, dec!(0.0048));
        assert_eq!(allocations[1].allocated_price, dec!(0.0032));

        let sum_price: Decimal = allocations.iter().map(|a| a.allocated_price).sum();
        let sum_fee: Decimal = allocations.iter().map(|a| a.allocated_fee).sum();
        let sum_prov: Decimal = allocations.iter().map(|a| a.allocated_provider_amount).sum();
        assert_eq!(sum_price, billed);
        assert_eq!(sum_fee, platform_fee);
        assert_eq!(sum_prov, provider_pool);
    }

    #[test]
    fn zero_quoted_prices_split_uniformly() {
        let steps = vec![tx(0, Decimal::ZERO), tx(1, Decimal::ZERO), tx(2, Decimal::ZERO)];
        let allocations = allocate_steps(&steps, dec!(0.009), dec!(0.00135), dec!(0.00765), Decimal::ZERO);
        assert_eq!(allocations.len(), 3);
        for alloc in &allocations[..2] {
            assert_eq!(alloc.weight, gateway_types::round8(Decimal::ONE / dec!(3)));
        }
        let sum_price: Decimal = allocations.iter().map(|a| a.allocated_price).sum();
        assert_eq!(sum_price, dec!(0.009));
    }
}
