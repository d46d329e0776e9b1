//! Request-path runtime and bundle-settlement engine for the NexusX gateway.
//!
//! [`GatewayCore`] wires every component together from a loaded
//! [`gateway_config::GatewayConfig`] in dependency order and hands out
//! `Arc`-shared handles to the HTTP/CLI front ends. [`pipeline::Pipeline`]
//! owns the actual auth/rate-limit/resolve/proxy/bill orchestration so
//! `gateway-service`'s handlers stay thin framework adapters.

pub mod auth;
pub mod billing;
pub mod bundle;
pub mod demand;
pub mod jobs;
pub mod payment;
pub mod pipeline;
pub mod proxy;
pub mod rate_limit;
pub mod reliability;
pub mod resolver;
pub mod store;

pub use auth::{Authenticator, InboundRequest};
pub use billing::Biller;
pub use bundle::{BundleEngine, BundleStepHint};
pub use demand::{emit_async, DemandSignalSink, LoggingDemandSignalSink};
pub use jobs::JobQueue;
pub use payment::{
    ChallengeOutcome, FacilitatorClient, PaymentChallenger, PaymentChallengerConfig,
    PaymentRequirement,
};
pub use pipeline::{InboundCall, Pipeline, PipelineResponse};
pub use proxy::{ProxyEngine, ProxyResult};
pub use rate_limit::{retry_after_seconds, RateLimitDecision, RateLimiter};
pub use reliability::ReliabilityAggregator;
pub use resolver::{CacheStats, RouteResolver};
pub use store::{FinalizeOutcome, InMemoryStore, PersistenceStore};

use chrono::{DateTime, Utc};
use gateway_config::GatewayConfig;
use std::sync::Arc;
use tracing::info;

/// Every request-path collaborator, constructed once at service startup and
/// shared (via `Arc<GatewayCore>`) across every inbound connection.
pub struct GatewayCore {
    pub config: GatewayConfig,
    pub store: Arc<dyn PersistenceStore>,
    pub demand_sink: Arc<dyn DemandSignalSink>,
    pub jobs: Arc<JobQueue>,
    pub authenticator: Authenticator,
    pub payment_challenger: Option<PaymentChallenger>,
    pub rate_limiter: Arc<RateLimiter>,
    pub resolver: Arc<RouteResolver>,
    pub proxy: ProxyEngine,
    pub biller: Biller,
    pub bundle_engine: BundleEngine,
    pub reliability: Arc<ReliabilityAggregator>,
    started_at: DateTime<Utc>,
}

impl GatewayCore {
    /// Builds every collaborator in dependency order: job queue first (every
    /// other component schedules fire-and-forget work onto it), then the
    /// store-backed components, then the facilitator-backed payment
    /// challenger only when x402 is enabled.
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn PersistenceStore>,
        demand_sink: Arc<dyn DemandSignalSink>,
    ) -> anyhow::Result<Self> {
        let jobs = Arc::new(JobQueue::new(config.performance.persistence_queue_capacity));
        let authenticator = Authenticator::new(Arc::clone(&store), Arc::clone(&jobs));
        let rate_limiter = RateLimiter::new();
        let resolver = RouteResolver::new(Arc::clone(&store), config.upstream.route_cache_ttl_ms);
        let proxy = ProxyEngine::new(
            config.upstream.timeout_ms,
            config.upstream.max_response_body_bytes,
        )?;
        let biller = Biller::new(Arc::clone(&store), Arc::clone(&jobs), Arc::clone(&demand_sink));
        let bundle_engine = BundleEngine::new(Arc::clone(&resolver), Arc::clone(&store));
        let reliability = Arc::new(ReliabilityAggregator::new());

        let payment_challenger = if config.x402.enabled {
            let facilitator = Arc::new(FacilitatorClient::new(
                config.x402.facilitator_url.clone(),
                config.x402.facilitator_request_timeout_ms,
            )?);
            let payment_config = PaymentChallengerConfig {
                network: config.x402.network.clone(),
                platform_address: config.x402.platform_address.clone(),
                usdc_asset_addresses: config.x402.usdc_asset_addresses.clone(),
                max_timeout_seconds: config.x402.max_timeout_seconds,
                platform_fee_rate: config.billing.platform_fee_rate,
            };
            Some(PaymentChallenger::new(
                facilitator,
                payment_config,
                Arc::clone(&jobs),
                Arc::clone(&demand_sink),
            ))
        } else {
            None
        };

        Ok(Self {
            config,
            store,
            demand_sink,
            jobs,
            authenticator,
            payment_challenger,
            rate_limiter,
            resolver,
            proxy,
            biller,
            bundle_engine,
            reliability,
            started_at: Utc::now(),
        })
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }

    /// graceful shutdown. The route-cache sweeper and rate-limiter cleaner
    /// are aborted by `Drop` when `self.resolver`/`self.rate_limiter` are
    /// dropped; this method only needs to drain the fire-and-forget queue so
    /// persistence/demand-signal writes already in flight are not torn.
    pub async fn shutdown(&self) {
        info!("shutting down gateway core");
        self.jobs.shutdown().await;
    }
}
