//! Per-call billing. Computes the fee split, persists the resulting
//! transaction record through the fire-and-forget job queue, and emits the
//! matching demand signal.

use chrono::Utc;
use gateway_types::{
    BillingMode, FeeSplitAmounts, GatewayResult, RequestContext, Route, TransactionRecord,
    TransactionStatus,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::bundle::BundleStepHint;
use crate::demand::{emit_async, DemandSignalSink};
use crate::jobs::JobQueue;
use crate::proxy::ProxyResult;
use crate::store::PersistenceStore;

pub struct Biller {
    store: Arc<dyn PersistenceStore>,
    jobs: Arc<JobQueue>,
    demand_sink: Arc<dyn DemandSignalSink>,
}

impl Biller {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        jobs: Arc<JobQueue>,
        demand_sink: Arc<dyn DemandSignalSink>,
    ) -> Self {
        Self {
            store,
            jobs,
            demand_sink,
        }
    }

    /// `processCall`. Returns the record synchronously (the caller
    /// needs it for response headers); persistence itself is fire-and-forget.
    pub fn process_call(
        &self,
        ctx: &RequestContext,
        route: &Route,
        proxy_result: &ProxyResult,
        bundle_hint: Option<BundleStepHint>,
        fee_rate: Decimal,
    ) -> GatewayResult<TransactionRecord> {
        let now = Utc::now();
        let billable = is_billable(proxy_result.status) && !route.sandbox;

        if route.sandbox {
            self.emit_signal(route.id, ctx.buyer_id, gateway_types::DemandSignalType::SandboxTest);
            return Ok(zero_value_record(ctx, route, proxy_result, bundle_hint, now, TransactionStatus::Confirmed));
        }
        if !billable {
            return Ok(zero_value_record(ctx, route, proxy_result, bundle_hint, now, TransactionStatus::Failed));
        }

        let (platform_fee, provider_amount) = gateway_types::fee_split(route.current_price, fee_rate);
        let split = FeeSplitAmounts {
            price: route.current_price,
            platform_fee,
            provider_amount,
        };

        let record = match bundle_hint {
            Some(hint) => TransactionRecord {
                id: Uuid::new_v4(),
                request_id: ctx.request_id,
                listing_id: route.id,
                buyer_id: ctx.buyer_id,
                status: TransactionStatus::Pending,
                billing_mode: BillingMode::BundleStep,
                bundle_session_id: Some(hint.session_id),
                bundle_step_index: Some(hint.step_index),
                settled_via_bundle: false,
                realized: FeeSplitAmounts::default(),
                fee_rate_applied: fee_rate,
                quoted: Some(split),
                response_time_ms: proxy_result.latency_ms,
                http_status: proxy_result.status,
                bytes_transferred: proxy_result.bytes_transferred,
                created_at: now,
                updated_at: now,
            },
            None => TransactionRecord {
                id: Uuid::new_v4(),
                request_id: ctx.request_id,
                listing_id: route.id,
                buyer_id: ctx.buyer_id,
                status: TransactionStatus::Confirmed,
                billing_mode: BillingMode::Individual,
                bundle_session_id: None,
                bundle_step_index: None,
                settled_via_bundle: false,
                realized: split,
                fee_rate_applied: fee_rate,
                quoted: None,
                response_time_ms: proxy_result.latency_ms,
                http_status: proxy_result.status,
                bytes_transferred: proxy_result.bytes_transferred,
                created_at: now,
                updated_at: now,
            },
        };

        self.persist_async(record.clone());
        self.emit_signal(route.id, ctx.buyer_id, gateway_types::DemandSignalType::ApiCall);
        Ok(record)
    }

    fn persist_async(&self, record: TransactionRecord) {
        let store = Arc::clone(&self.store);
        self.jobs.spawn("persist_transaction", async move {
            if let Err(err) = store.persist_transaction(record).await {
                warn!(%err, "failed to persist transaction record");
            }
        });
    }

    fn emit_signal(
        &self,
        listing_id: gateway_types::ListingId,
        buyer_id: gateway_types::BuyerId,
        signal_type: gateway_types::DemandSignalType,
    ) {
        emit_async(
            &self.jobs,
            Arc::clone(&self.demand_sink),
            gateway_types::DemandSignal {
                listing_id,
                buyer_id,
                signal_type,
                weight: signal_type.default_weight(),
                metadata: Default::default(),
            },
        );
    }
}

/// `isBillable = (status < 500 or >= 600) AND !route.isSandbox`;
/// sandbox is checked separately by the caller.
fn is_billable(status: u16) -> bool {
    status < 500 || status >= 600
}

fn zero_value_record(
    ctx: &RequestContext,
    route: &Route,
    proxy_result: &ProxyResult,
    bundle_hint: Option<BundleStepHint>,
    now: chrono::DateTime<Utc>,
    status: TransactionStatus,
) -> TransactionRecord {
    TransactionRecord {
        id: Uuid::new_v4(),
        request_id: ctx.request_id,
        listing_id: route.id,
        buyer_id: ctx.buyer_id,
        status,
        billing_mode: if bundle_hint.is_some() {
            BillingMode::BundleStep
        } else {
            BillingMode::Individual
        },
        bundle_session_id: bundle_hint.map(|h| h.session_id),
        bundle_step_index: bundle_hint.map(|h| h.step_index),
        settled_via_bundle: false,
        realized: FeeSplitAmounts::default(),
        fee_rate_applied: Decimal::ZERO,
        quoted: None,
        response_time_ms: proxy_result.latency_ms,
        http_status: proxy_result.status,
        bytes_transferred: proxy_result.bytes_transferred,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use gateway_types::RouteState;
    use reqwest::header::HeaderMap;
    use rust_decimal_macros::dec;

    fn ctx() -> RequestContext {
        RequestContext {
            buyer_id: Uuid::new_v4(),
            buyer_wallet_address: "0xbuyer".to_string(),
            api_key_id: Some(Uuid::new_v4()),
            rate_limit_rpm: 600,
            request_id: Uuid::new_v4(),
            received_at: Utc::now(),
            auth_mode: gateway_types::AuthMode::ApiKey,
            deferred_payment: None,
            settled_payment: None,
        }
    }

    fn route(sandbox: bool) -> Route {
        Route {
            id: Uuid::new_v4(),
            slug: "weather".to_string(),
            upstream_base_url: "https://upstream.example.com".to_string(),
            capacity_requests_per_minute: 600,
            current_price: dec!(0.01),
            floor_price: dec!(0.001),
            provider_payout_address: "0xprovider".to_string(),
            state: RouteState::Active,
            sandbox,
            created_at: Utc::now(),
        }
    }

    fn proxy_result(status: u16) -> ProxyResult {
        ProxyResult {
            status,
            headers: HeaderMap::new(),
            body: vec![],
            latency_ms: 42,
            bytes_transferred: 128,
        }
    }

    fn biller() -> Biller {
        Biller::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(JobQueue::new(8)),
            Arc::new(crate::demand::LoggingDemandSignalSink),
        )
    }

    #[test]
    fn individual_call_confirms_with_fee_split() {
        let biller = biller();
        let record = biller
            .process_call(&ctx(), &route(false), &proxy_result(200), None, dec!(0.12))
            .unwrap();
        assert_eq!(record.status, TransactionStatus::Confirmed);
        assert_eq!(record.billing_mode, BillingMode::Individual);
        assert_eq!(record.realized.price, dec!(0.01));
        assert_eq!(record.realized.platform_fee + record.realized.provider_amount, dec!(0.01));
    }

    #[test]
    fn sandbox_call_is_zero_value() {
        let biller = biller();
        let record = biller
            .process_call(&ctx(), &route(true), &proxy_result(200), None, dec!(0.12))
            .unwrap();
        assert_eq!(record.realized.price, Decimal::ZERO);
    }

    #[test]
    fn server_error_is_not_billable() {
        let biller = biller();
        let record = biller
            .process_call(&ctx(), &route(false), &proxy_result(502), None, dec!(0.12))
            .unwrap();
        assert_eq!(record.status, TransactionStatus::Failed);
        assert_eq!(record.realized.price, Decimal::ZERO);
    }

    #[test]
    fn client_error_is_billable() {
        let biller = biller();
        let record = biller
            .process_call(&ctx(), &route(false), &proxy_result(404), None, dec!(0.12))
            .unwrap();
        assert_eq!(record.status, TransactionStatus::Confirmed);
        assert_eq!(record.realized.price, dec!(0.01));
    }

    #[test]
    fn bundle_step_records_a_quote_not_a_confirmation() {
        let biller = biller();
        let hint = BundleStepHint::new(Uuid::new_v4(), 0);
        let record = biller
            .process_call(&ctx(), &route(false), &proxy_result(200), Some(hint), dec!(0.15))
            .unwrap();
        assert_eq!(record.status, TransactionStatus::Pending);
        assert_eq!(record.billing_mode, BillingMode::BundleStep);
        assert_eq!(record.realized.price, Decimal::ZERO);
        assert_eq!(record.quoted.unwrap().price, dec!(0.01));
    }
}
