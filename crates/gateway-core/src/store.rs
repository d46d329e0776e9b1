//! The abstract persistence collaborator the core invokes ("Persistence
//! collaborator"). The gateway itself is not a database (Non-goals); this
//! module defines the trait boundary every request-path component programs
//! against, plus a dependency-free [`InMemoryStore`] reference
//! implementation used by the HTTP service when no external store is wired
//! up and exercised directly by this workspace's test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_types::{
    ApiKeyId, ApiKeyRecord, BundleExecutionSession, BundleProviderSettlementRow,
    BundleSessionFinalizeResult, BundleSessionId, BundleSessionStatus, BuyerId, GatewayError,
    GatewayResult, ListingId, ReliabilityRecordPoint, Route, TransactionId, TransactionRecord,
    TransactionStatus, Usdc, MAX_RELIABILITY_ENTRIES,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::bundle::{allocate_steps, compute_discount_fraction};

/// Outcome of [`PersistenceStore::finalize_bundle_session`]: either a freshly
/// computed settlement or the replay of a prior, already-finalized call.
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub result: BundleSessionFinalizeResult,
    pub already_finalized: bool,
}

/// The persistence operations the request-path core invokes. Every
/// method is individually atomic; [`finalize_bundle_session`] additionally
/// needs serializable-transaction semantics across its whole read-modify-write
/// sequence — the concrete guarantee is the implementing store's
/// responsibility, with this trait only naming the requirement.
///
/// [`finalize_bundle_session`]: PersistenceStore::finalize_bundle_session
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn lookup_api_key(&self, prefix: &str) -> GatewayResult<Option<ApiKeyRecord>>;
    async fn touch_api_key(&self, id: ApiKeyId, at: DateTime<Utc>) -> GatewayResult<()>;

    async fn lookup_listing_by_slug(&self, slug: &str) -> GatewayResult<Option<Route>>;
    async fn lookup_listing_by_id(&self, id: ListingId) -> GatewayResult<Option<Route>>;

    async fn persist_transaction(&self, record: TransactionRecord) -> GatewayResult<()>;
    async fn get_transaction(&self, id: TransactionId) -> GatewayResult<Option<TransactionRecord>>;

    async fn register_bundle_session(&self, session: BundleExecutionSession) -> GatewayResult<()>;
    async fn lookup_bundle_session(
        &self,
        id: BundleSessionId,
    ) -> GatewayResult<Option<BundleExecutionSession>>;

    /// Runs the whole algorithm — claim, step selection, discount,
    /// largest-remainder allocation, wallet debit, and the settlement/
    /// transaction writes — as a single serializable unit.
    async fn finalize_bundle_session(
        &self,
        session_id: BundleSessionId,
        buyer_id: BuyerId,
        now: DateTime<Utc>,
    ) -> GatewayResult<FinalizeOutcome>;

    /// Atomic compare-and-swap debit: succeeds only if `balance >= amount`.
    async fn debit_wallet(&self, buyer_id: BuyerId, amount: Usdc) -> GatewayResult<bool>;
    async fn credit_wallet(&self, buyer_id: BuyerId, amount: Usdc) -> GatewayResult<()>;

    async fn record_reliability_point(
        &self,
        slug: &str,
        point: ReliabilityRecordPoint,
    ) -> GatewayResult<()>;
    async fn list_reliability_points(&self, slug: &str) -> GatewayResult<Vec<ReliabilityRecordPoint>>;
}

#[derive(Debug, Clone)]
struct StoredBundle {
    session: BundleExecutionSession,
    settlement_rows: Vec<BundleProviderSettlementRow>,
    finalize_result: Option<BundleSessionFinalizeResult>,
}

#[derive(Default)]
struct StoreInner {
    api_keys_by_prefix: HashMap<String, ApiKeyRecord>,
    routes_by_slug: HashMap<String, Route>,
    transactions: HashMap<TransactionId, TransactionRecord>,
    bundles: HashMap<BundleSessionId, StoredBundle>,
    wallets: HashMap<BuyerId, Usdc>,
    reliability: HashMap<String, VecDeque<ReliabilityRecordPoint>>,
}

/// Dependency-free reference store. Every mutation is guarded by a single
/// [`Mutex`], giving the bundle finalizer one joint critical section across
/// sessions, step transactions, and wallet balances. This is explicitly a
/// test/dev collaborator, not a production-grade persistent store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an API key record for tests/standalone running.
    pub fn seed_api_key(&self, record: ApiKeyRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.api_keys_by_prefix.insert(record.prefix.clone(), record);
    }

    /// Seed a listing route for tests/standalone running.
    pub fn seed_route(&self, route: Route) {
        let mut inner = self.inner.lock().unwrap();
        inner.routes_by_slug.insert(route.slug.clone(), route);
    }

    /// Seed a buyer's wallet balance for tests/standalone running.
    pub fn seed_wallet(&self, buyer_id: BuyerId, balance: Usdc) {
        let mut inner = self.inner.lock().unwrap();
        inner.wallets.insert(buyer_id, balance);
    }

    pub fn wallet_balance(&self, buyer_id: BuyerId) -> Usdc {
        let inner = self.inner.lock().unwrap();
        inner.wallets.get(&buyer_id).copied().unwrap_or_default()
    }

    pub fn transactions_for_session(&self, session_id: BundleSessionId) -> Vec<TransactionRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .transactions
            .values()
            .filter(|t| t.bundle_session_id == Some(session_id))
            .cloned()
            .collect()
    }

    pub fn settlement_rows(&self, session_id: BundleSessionId) -> Vec<BundleProviderSettlementRow> {
        let inner = self.inner.lock().unwrap();
        inner
            .bundles
            .get(&session_id)
            .map(|b| b.settlement_rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn lookup_api_key(&self, prefix: &str) -> GatewayResult<Option<ApiKeyRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.api_keys_by_prefix.get(prefix).cloned())
    }

    async fn touch_api_key(&self, id: ApiKeyId, at: DateTime<Utc>) -> GatewayResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner
            .api_keys_by_prefix
            .values_mut()
            .find(|record| record.id == id)
        {
            record.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn lookup_listing_by_slug(&self, slug: &str) -> GatewayResult<Option<Route>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.routes_by_slug.get(slug).cloned())
    }

    async fn lookup_listing_by_id(&self, id: ListingId) -> GatewayResult<Option<Route>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.routes_by_slug.values().find(|r| r.id == id).cloned())
    }

    async fn persist_transaction(&self, record: TransactionRecord) -> GatewayResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.transactions.insert(record.id, record);
        Ok(())
    }

    async fn get_transaction(&self, id: TransactionId) -> GatewayResult<Option<TransactionRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.transactions.get(&id).cloned())
    }

    async fn register_bundle_session(&self, session: BundleExecutionSession) -> GatewayResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.bundles.insert(
            session.id,
            StoredBundle {
                session,
                settlement_rows: Vec::new(),
                finalize_result: None,
            },
        );
        Ok(())
    }

    async fn lookup_bundle_session(
        &self,
        id: BundleSessionId,
    ) -> GatewayResult<Option<BundleExecutionSession>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.bundles.get(&id).map(|b| b.session.clone()))
    }

    async fn finalize_bundle_session(
        &self,
        session_id: BundleSessionId,
        buyer_id: BuyerId,
        now: DateTime<Utc>,
    ) -> GatewayResult<FinalizeOutcome> {
        let mut inner = self.inner.lock().unwrap();

        let stored = inner
            .bundles
            .get(&session_id)
            .ok_or(GatewayError::BundleSessionNotFound)?;
        if stored.session.buyer_id != buyer_id {
            return Err(GatewayError::Forbidden);
        }
        if stored.session.status == BundleSessionStatus::Finalized {
            let result = stored
                .finalize_result
                .clone()
                .ok_or_else(|| GatewayError::Internal("finalized session missing result".into()))?;
            return Ok(FinalizeOutcome {
                result,
                already_finalized: true,
            });
        }
        if stored.session.is_expired(now) {
            let bundle = inner.bundles.get_mut(&session_id).unwrap();
            bundle.session.status = BundleSessionStatus::Expired;
            bundle.session.updated_at = now;
            return Err(GatewayError::Conflict("bundle session expired".to_string()));
        }
        if !matches!(
            stored.session.status,
            BundleSessionStatus::Registered | BundleSessionStatus::InProgress
        ) {
            return Err(GatewayError::Conflict(
                "bundle session is not in a claimable state".to_string(),
            ));
        }

        // Claim: REGISTERED -> IN_PROGRESS. A session already IN_PROGRESS and
        // owned by this buyer (verified above) is a safe retry of a prior
        // attempt that failed downstream (e.g. insufficient funds) — see
        // DESIGN.md for why this single-process store treats that as
        // re-claimable rather than CONFLICT.
        {
            let bundle = inner.bundles.get_mut(&session_id).unwrap();
            bundle.session.status = BundleSessionStatus::InProgress;
            bundle.session.updated_at = now;
        }

        let fee_rate = stored.session.platform_fee_rate;
        let registered_gross = stored.session.registered_gross_price;
        let target = stored.session.target_bundle_price;
        let tool_slugs = stored.session.tool_slugs.clone();

        // Step 4: select step transactions, newest wins per duplicate index.
        let mut by_index: HashMap<u32, Vec<TransactionRecord>> = HashMap::new();
        let mut to_fail: Vec<TransactionId> = Vec::new();
        for tx in inner.transactions.values().filter(|t| {
            t.bundle_session_id == Some(session_id)
                && matches!(t.status, TransactionStatus::Pending | TransactionStatus::Confirmed)
        }) {
            match tx.bundle_step_index {
                Some(idx) => by_index.entry(idx).or_default().push(tx.clone()),
                None => to_fail.push(tx.id),
            }
        }

        let mut selected: Vec<TransactionRecord> = Vec::new();
        for (_, mut group) in by_index {
            group.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let mut iter = group.into_iter();
            if let Some(keep) = iter.next() {
                selected.push(keep);
            }
            to_fail.extend(iter.map(|t| t.id));
        }
        selected.sort_by_key(|t| t.bundle_step_index.unwrap_or(u32::MAX));

        // Step 5-7: executed gross, discount, billed/fee/pool.
        let executed_gross = gateway_types::round6(
            selected
                .iter()
                .map(|t| t.quoted_or_realized_price())
                .sum(),
        );
        let discount_fraction = compute_discount_fraction(registered_gross, target);
        let billed = gateway_types::round6(executed_gross * (rust_decimal::Decimal::ONE - discount_fraction));
        let (platform_fee, provider_pool) = gateway_types::fee_split(billed, fee_rate);
        let discount = gateway_types::round6(executed_gross - billed);

        // Step 8: debit wallet. Failure leaves the session IN_PROGRESS and
        // every step transaction PENDING, matching the documented scenario.
        if billed > rust_decimal::Decimal::ZERO {
            let balance = inner.wallets.entry(buyer_id).or_default();
            if *balance < billed {
                return Err(GatewayError::InsufficientFunds);
            }
            *balance -= billed;
        }

        // Step 9: largest-remainder allocation.
        let allocations = allocate_steps(&selected, billed, platform_fee, provider_pool, executed_gross);

        let settlement_rows: Vec<BundleProviderSettlementRow> = allocations
            .iter()
            .zip(selected.iter())
            .map(|(alloc, tx)| BundleProviderSettlementRow {
                bundle_session_id: session_id,
                transaction_id: tx.id,
                listing_id: tx.listing_id,
                list_price: alloc.quoted_price,
                weight: alloc.weight,
                allocated_price: alloc.allocated_price,
                platform_fee: alloc.allocated_fee,
                provider_amount: alloc.allocated_provider_amount,
            })
            .collect();

        // Step 10-11: update transaction records.
        for (alloc, tx) in allocations.iter().zip(selected.iter()) {
            if let Some(record) = inner.transactions.get_mut(&tx.id) {
                record.status = TransactionStatus::Confirmed;
                record.settled_via_bundle = true;
                record.realized = gateway_types::FeeSplitAmounts {
                    price: alloc.allocated_price,
                    platform_fee: alloc.allocated_fee,
                    provider_amount: alloc.allocated_provider_amount,
                };
                record.fee_rate_applied = fee_rate;
                record.updated_at = now;
            }
        }
        for id in &to_fail {
            if let Some(record) = inner.transactions.get_mut(id) {
                record.status = TransactionStatus::Failed;
                record.updated_at = now;
            }
        }

        // Step 12-13: settlement rows + session.
        let finalized_at = now;
        let bundle = inner.bundles.get_mut(&session_id).unwrap();
        bundle.settlement_rows = settlement_rows.clone();
        bundle.session.status = BundleSessionStatus::Finalized;
        bundle.session.executed_gross_price = executed_gross;
        bundle.session.billed_price = billed;
        bundle.session.discount = discount;
        bundle.session.platform_fee = platform_fee;
        bundle.session.provider_pool = provider_pool;
        bundle.session.finalized_at = Some(finalized_at);
        bundle.session.updated_at = finalized_at;

        let result = BundleSessionFinalizeResult {
            session_id,
            status: BundleSessionStatus::Finalized,
            executed_gross_price: executed_gross,
            billed_price: billed,
            discount,
            platform_fee,
            provider_pool,
            allocations: settlement_rows,
            finalized_at,
        };
        bundle.finalize_result = Some(result.clone());

        // `tool_slugs` is only read for parity with a real store's audit log
        // of what was registered; nothing here mutates it.
        let _ = tool_slugs;

        Ok(FinalizeOutcome {
            result,
            already_finalized: false,
        })
    }

    async fn debit_wallet(&self, buyer_id: BuyerId, amount: Usdc) -> GatewayResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let balance = inner.wallets.entry(buyer_id).or_default();
        if *balance < amount {
            return Ok(false);
        }
        *balance -= amount;
        Ok(true)
    }

    async fn credit_wallet(&self, buyer_id: BuyerId, amount: Usdc) -> GatewayResult<()> {
        let mut inner = self.inner.lock().unwrap();
        *inner.wallets.entry(buyer_id).or_default() += amount;
        Ok(())
    }

    async fn record_reliability_point(
        &self,
        slug: &str,
        point: ReliabilityRecordPoint,
    ) -> GatewayResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let entries = inner.reliability.entry(slug.to_string()).or_default();
        entries.push_back(point);
        while entries.len() > MAX_RELIABILITY_ENTRIES {
            entries.pop_front();
        }
        Ok(())
    }

    async fn list_reliability_points(&self, slug: &str) -> GatewayResult<Vec<ReliabilityRecordPoint>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .reliability
            .get(slug)
            .map(|entries| entries.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_types::{ApiKeyState, RouteState};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn sample_route(slug: &str, price: Usdc) -> Route {
        Route {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            upstream_base_url: "https://upstream.example.com".to_string(),
            capacity_requests_per_minute: 600,
            current_price: price,
            floor_price: dec!(0.0001),
            provider_payout_address: "0xprovider".to_string(),
            state: RouteState::Active,
            sandbox: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn lookup_api_key_roundtrips() {
        let store = InMemoryStore::new();
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            prefix: "nxs_test".to_string(),
            secret_hash: "hash".to_string(),
            state: ApiKeyState::Active,
            rate_limit_rpm: 60,
            ip_allow_list: vec![],
            expires_at: None,
            wallet_address: "0xabc".to_string(),
            last_used_at: None,
            created_at: Utc::now(),
        };
        store.seed_api_key(record.clone());

        let found = store.lookup_api_key("nxs_test").await.unwrap().unwrap();
        assert_eq!(found.id, record.id);
        assert!(store.lookup_api_key("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finalize_is_idempotent_on_replay() {
        let store = InMemoryStore::new();
        let buyer = Uuid::new_v4();
        store.seed_wallet(buyer, dec!(10));

        let route_a = sample_route("a", dec!(0.006));
        let route_b = sample_route("b", dec!(0.004));

        let session = BundleExecutionSession {
            id: Uuid::new_v4(),
            buyer_id: buyer,
            api_key_id: Uuid::new_v4(),
            bundle_slug: "b".to_string(),
            tool_slugs: vec!["a".to_string(), "b".to_string()],
            status: BundleSessionStatus::Registered,
            registered_gross_price: dec!(0.010),
            target_bundle_price: dec!(0.008),
            executed_gross_price: dec!(0),
            billed_price: dec!(0),
            discount: dec!(0),
            platform_fee: dec!(0),
            provider_pool: dec!(0),
            platform_fee_rate: dec!(0.15),
            expires_at: Utc::now() + chrono::Duration::minutes(30),
            metadata: HashMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            finalized_at: None,
        };
        store.register_bundle_session(session.clone()).await.unwrap();

        for (i, (route, quoted)) in [(&route_a, dec!(0.006)), (&route_b, dec!(0.004))]
            .into_iter()
            .enumerate()
        {
            let tx = TransactionRecord {
                id: Uuid::new_v4(),
                request_id: Uuid::new_v4(),
                listing_id: route.id,
                buyer_id: buyer,
                status: TransactionStatus::Pending,
                billing_mode: gateway_types::BillingMode::BundleStep,
                bundle_session_id: Some(session.id),
                bundle_step_index: Some(i as u32),
                settled_via_bundle: false,
                realized: Default::default(),
                fee_rate_applied: dec!(0.15),
                quoted: Some(gateway_types::FeeSplitAmounts {
                    price: quoted,
                    platform_fee: dec!(0),
                    provider_amount: dec!(0),
                }),
                response_time_ms: 10,
                http_status: 200,
                bytes_transferred: 100,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            store.persist_transaction(tx).await.unwrap();
        }

        let now = Utc::now();
        let first = store
            .finalize_bundle_session(session.id, buyer, now)
            .await
            .unwrap();
        assert!(!first.already_finalized);
        assert_eq!(first.result.billed_price, dec!(0.008));

        let second = store
            .finalize_bundle_session(session.id, buyer, now)
            .await
            .unwrap();
        assert!(second.already_finalized);
        assert_eq!(
            serde_json::to_string(&first.result).unwrap(),
            serde_json::to_string(&second.result).unwrap()
        );
    }
}
