//! The "Pipeline/Server" component: `Ingress -> Auth -> RateLimit ->
//! Resolver -> Proxy -> Biller -> Response`, generalized to also cover the
//! x402 pay-per-call challenge and bundle-step admission. `gateway-service`
//! builds an [`InboundCall`] from the framework's request/connection info
//! and hands it to [`Pipeline::handle_call`]; everything this module returns
//! is plain `http`-crate types the service can drop straight into a response
//! builder.

use chrono::Utc;
use gateway_types::{
    BillingMode, BuyerId, DemandSignal, DemandSignalType, GatewayError, ListingId,
    ReliabilityRecordPoint, RequestContext, Route, TransactionRecord,
};
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::auth::InboundRequest;
use crate::bundle::{BundleEngine, BundleStepHint};
use crate::demand::emit_async;
use crate::payment::{ChallengeOutcome, PaymentRequirement};
use crate::proxy::insert_header;
use crate::GatewayCore;

const HEADER_BUNDLE_SESSION_ID: &str = "x-nexusx-bundle-session-id";
const HEADER_BUNDLE_STEP_INDEX: &str = "x-nexusx-bundle-step-index";
const HEADER_SANDBOX: &str = "x-nexusx-sandbox";
const HEADER_PAYMENT: &str = "x-payment";
const HEADER_FORWARDED_FOR: &str = "x-forwarded-for";
const HEADER_AUTHORIZATION: &str = "authorization";
const HEADER_NEXUSX_KEY: &str = "x-nexusx-key";

/// A call to the proxied `/v1/:listingSlug/*` surface, already stripped of
/// framework types so this module stays independent of `axum`.
pub struct InboundCall<'a> {
    pub listing_slug: &'a str,
    pub sub_path: &'a str,
    pub query: Option<&'a str>,
    pub method: Method,
    pub headers: &'a HeaderMap,
    pub body: Vec<u8>,
    pub peer_addr: &'a str,
    /// The fully-qualified URL the caller reached, used as the x402 payment
    /// requirement's `resource` field.
    pub resource_url: &'a str,
}

pub struct PipelineResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl PipelineResponse {
    fn from_error(err: GatewayError, request_id: Uuid) -> Self {
        let body = serde_json::json!({
            "error": {
                "code": err.code(),
                "message": err.to_string(),
            },
            "requestId": request_id,
        })
        .to_string()
        .into_bytes();
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "content-type", "application/json");
        insert_header(&mut headers, "x-nexusx-request-id", &request_id.to_string());
        Self {
            status: err.http_status(),
            headers,
            body,
        }
    }

    /// "Pay-per-call 402 response body": the bare requirement object,
    /// `WWW-Authenticate`-free — the facilitator/client library parses the
    /// JSON body directly.
    fn payment_required(requirement: &PaymentRequirement, request_id: Uuid) -> Self {
        let body = serde_json::to_vec(requirement).unwrap_or_default();
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "content-type", "application/json");
        insert_header(&mut headers, "x-nexusx-request-id", &request_id.to_string());
        Self {
            status: 402,
            headers,
            body,
        }
    }
}

/// Wraps a [`GatewayCore`] reference for the duration of a single request.
/// Cheap to construct; `gateway-service` builds one per inbound call from
/// its shared `Arc<GatewayCore>`.
pub struct Pipeline<'a> {
    core: &'a GatewayCore,
}

impl<'a> Pipeline<'a> {
    pub fn new(core: &'a GatewayCore) -> Self {
        Self { core }
    }

    pub async fn handle_call(&self, call: InboundCall<'_>) -> PipelineResponse {
        let fallback_request_id = Uuid::new_v4();
        let bundle_headers = parse_bundle_headers(call.headers);

        // : pay-per-call and bundle execution don't compose.
        if bundle_headers.is_some() && self.core.config.x402.enabled {
            return PipelineResponse::from_error(
                GatewayError::InvalidBundleContext,
                fallback_request_id,
            );
        }

        let route = match self.core.resolver.resolve_by_slug(call.listing_slug).await {
            Ok(Some(route)) => route,
            Ok(None) => {
                return PipelineResponse::from_error(
                    GatewayError::ListingNotFound,
                    fallback_request_id,
                )
            }
            Err(err) => return PipelineResponse::from_error(err, fallback_request_id),
        };

        let sandbox_override = self.core.config.billing.sandbox_enabled
            && header_str(call.headers, HEADER_SANDBOX)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);
        let effective_route = if sandbox_override && !route.sandbox {
            let mut r = route.clone();
            r.sandbox = true;
            r
        } else {
            route.clone()
        };

        let (mut ctx, requirement) = match self
            .admit(&call, &effective_route, sandbox_override)
            .await
        {
            Ok(admitted) => admitted,
            Err(Admission::Error(err)) => {
                return PipelineResponse::from_error(err, fallback_request_id)
            }
            Err(Admission::PaymentRequired(requirement)) => {
                return PipelineResponse::payment_required(&requirement, fallback_request_id)
            }
        };

        let bundle_hint = match bundle_headers {
            Some((session_id, step_index)) => {
                match self
                    .admit_bundle_step(session_id, step_index, &ctx, call.listing_slug)
                    .await
                {
                    Ok(()) => Some(BundleStepHint::new(session_id, step_index)),
                    Err(err) => return PipelineResponse::from_error(err, ctx.request_id),
                }
            }
            None => None,
        };

        let rate_limit_key = rate_limit_key(&ctx);
        let now = Utc::now();
        let decision = self
            .core
            .rate_limiter
            .check(&rate_limit_key, ctx.rate_limit_rpm, now);
        if !decision.allowed {
            self.emit_rate_limited(route.id, ctx.buyer_id, call.listing_slug);
            let mut response = PipelineResponse::from_error(GatewayError::RateLimited, ctx.request_id);
            insert_rate_limit_headers(&mut response.headers, &decision);
            insert_header(
                &mut response.headers,
                "retry-after",
                &crate::rate_limit::retry_after_seconds(decision.reset_ms).to_string(),
            );
            return response;
        }

        let proxy_result = self
            .core
            .proxy
            .forward(
                &effective_route.upstream_base_url,
                call.sub_path,
                call.query,
                call.method,
                call.headers,
                call.body,
                ctx.request_id,
            )
            .await;

        let fee_rate = if bundle_hint.is_some() {
            self.core.config.bundle.platform_fee_rate
        } else {
            self.core.config.billing.platform_fee_rate
        };
        let billing_record = match self.core.biller.process_call(
            &ctx,
            &effective_route,
            &proxy_result,
            bundle_hint,
            fee_rate,
        ) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(%err, "billing failed for an otherwise-admitted call");
                None
            }
        };

        if let Some(challenger) = &self.core.payment_challenger {
            if let Some(deferred) = ctx.deferred_payment.take() {
                let settle_requirement = requirement
                    .clone()
                    .or_else(|| serde_json::from_value(deferred.requirements_json.clone()).ok());
                if let Some(settle_requirement) = settle_requirement {
                    if let Some(settled) = challenger
                        .settle_if_eligible(&deferred, &settle_requirement, proxy_result.status)
                        .await
                    {
                        ctx.settled_payment = Some(settled);
                    } else {
                        ctx.deferred_payment = Some(deferred);
                    }
                } else {
                    ctx.deferred_payment = Some(deferred);
                }
            }
        }

        self.record_reliability(&route.slug, &proxy_result);

        let mut headers = proxy_result.headers;
        insert_rate_limit_headers(&mut headers, &decision);
        insert_header(&mut headers, "x-nexusx-listing", &route.slug);
        if effective_route.sandbox {
            insert_header(&mut headers, "x-nexusx-sandbox", "true");
        }
        if self.core.config.x402.enabled {
            insert_header(&mut headers, "x-nexusx-payment", "x402");
        }
        if let Some(record) = &billing_record {
            insert_billing_headers(&mut headers, record);
        }
        if let Some(settled) = &ctx.settled_payment {
            insert_header(&mut headers, "x-nexusx-txhash", &settled.tx_hash);
        }

        PipelineResponse {
            status: proxy_result.status,
            headers,
            body: proxy_result.body,
        }
    }

    /// Runs either the API-key authenticator or the x402 payment challenge,
    /// whichever `config.x402.enabled` selects, and returns the admitted
    /// [`RequestContext`] plus (in x402 mode) the [`PaymentRequirement`] used
    /// for the challenge, carried forward so settlement can reuse it exactly.
    async fn admit(
        &self,
        call: &InboundCall<'_>,
        route: &Route,
        sandbox_override: bool,
    ) -> Result<(RequestContext, Option<PaymentRequirement>), Admission> {
        if self.core.config.x402.enabled {
            let challenger = self
                .core
                .payment_challenger
                .as_ref()
                .expect("x402.enabled implies payment_challenger is Some");
            let payment_header = header_str(call.headers, HEADER_PAYMENT);
            let outcome = challenger
                .challenge_or_admit(route, call.resource_url, payment_header, String::new(), sandbox_override)
                .await
                .map_err(Admission::Error)?;
            match outcome {
                ChallengeOutcome::Admit(ctx) => {
                    let requirement = ctx
                        .deferred_payment
                        .as_ref()
                        .and_then(|d| serde_json::from_value(d.requirements_json.clone()).ok());
                    Ok((ctx, requirement))
                }
                ChallengeOutcome::Emit402(requirement) => Err(Admission::PaymentRequired(requirement)),
                ChallengeOutcome::Reject(err) => Err(Admission::Error(err)),
            }
        } else {
            let inbound = InboundRequest {
                bearer_header: header_str(call.headers, HEADER_AUTHORIZATION),
                nexusx_key_header: header_str(call.headers, HEADER_NEXUSX_KEY),
                api_key_query_param: query_param(call.query, "api_key"),
                forwarded_for_header: header_str(call.headers, HEADER_FORWARDED_FOR),
                peer_addr: call.peer_addr,
            };
            let ctx = self
                .core
                .authenticator
                .authenticate(&inbound)
                .await
                .map_err(Admission::Error)?;
            Ok((ctx, None))
        }
    }

    /// step admission against a session looked up fresh from the
    /// store (the resolver's TTL cache only ever holds listing routes).
    async fn admit_bundle_step(
        &self,
        session_id: Uuid,
        step_index: u32,
        ctx: &RequestContext,
        listing_slug: &str,
    ) -> Result<(), GatewayError> {
        let session = self
            .core
            .store
            .lookup_bundle_session(session_id)
            .await
            .map_err(|_| GatewayError::Internal("bundle session lookup failed".to_string()))?
            .ok_or(GatewayError::BundleSessionNotFound)?;
        BundleEngine::admit_step(&session, ctx.buyer_id, step_index, listing_slug, Utc::now())?;
        Ok(())
    }

    fn emit_rate_limited(&self, listing_id: ListingId, buyer_id: BuyerId, listing_slug: &str) {
        let mut metadata = HashMap::new();
        metadata.insert("listing_slug".to_string(), listing_slug.to_string());
        emit_async(
            &self.core.jobs,
            Arc::clone(&self.core.demand_sink),
            DemandSignal {
                listing_id,
                buyer_id,
                signal_type: DemandSignalType::RateLimited,
                weight: DemandSignalType::RateLimited.default_weight(),
                metadata,
            },
        );
    }

    /// `record`: updates the in-process aggregator synchronously (it's
    /// the hot path every `/pricing`/`/reliability` poll reads) and schedules
    /// a durable write to the external store through the job queue, the same
    /// split the resolver/rate-limiter already draw between a fast in-process
    /// cache and an authoritative external collaborator.
    fn record_reliability(&self, slug: &str, proxy_result: &crate::proxy::ProxyResult) {
        let point = ReliabilityRecordPoint {
            latency_ms: proxy_result.latency_ms,
            status_code: proxy_result.status,
            timestamp: Utc::now(),
        };
        self.core.reliability.record(slug, point);

        let store = Arc::clone(&self.core.store);
        let slug = slug.to_string();
        self.core.jobs.spawn("record_reliability_point", async move {
            if let Err(err) = store.record_reliability_point(&slug, point).await {
                warn!(%err, slug, "failed to persist reliability point");
            }
        });
    }
}

enum Admission {
    Error(GatewayError),
    PaymentRequired(PaymentRequirement),
}

/// "Response headers set on every proxied response": the billing-mode
/// header plus its price/fee siblings. Bundle-step calls haven't settled yet
/// — the realized price/fee headers are zeroed and the quoted price (plus
/// the session/step correlators) is surfaced instead.
fn insert_billing_headers(headers: &mut HeaderMap, record: &TransactionRecord) {
    match record.billing_mode {
        BillingMode::Individual => {
            insert_header(headers, "x-nexusx-billing-mode", "individual");
            insert_header(headers, "x-nexusx-price-usdc", &gateway_types::format6(record.realized.price));
            insert_header(headers, "x-nexusx-fee-usdc", &gateway_types::format6(record.realized.platform_fee));
        }
        BillingMode::BundleStep => {
            insert_header(headers, "x-nexusx-billing-mode", "bundle_step");
            insert_header(headers, "x-nexusx-price-usdc", &gateway_types::format6(rust_decimal::Decimal::ZERO));
            insert_header(headers, "x-nexusx-fee-usdc", &gateway_types::format6(rust_decimal::Decimal::ZERO));
            if let Some(quoted) = &record.quoted {
                insert_header(
                    headers,
                    "x-nexusx-bundle-quoted-price-usdc",
                    &gateway_types::format6(quoted.price),
                );
            }
            if let Some(session_id) = record.bundle_session_id {
                insert_header(headers, "x-nexusx-bundle-session-id", &session_id.to_string());
            }
            if let Some(step_index) = record.bundle_step_index {
                insert_header(headers, "x-nexusx-bundle-step-index", &step_index.to_string());
            }
        }
    }
}

fn rate_limit_key(ctx: &RequestContext) -> String {
    match ctx.api_key_id {
        Some(id) => id.to_string(),
        None => format!("buyer:{}", ctx.buyer_id),
    }
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, decision: &crate::rate_limit::RateLimitDecision) {
    insert_header(headers, "x-ratelimit-limit", &decision.limit.to_string());
    insert_header(headers, "x-ratelimit-remaining", &decision.remaining.to_string());
    insert_header(
        headers,
        "x-ratelimit-reset",
        &crate::rate_limit::retry_after_seconds(decision.reset_ms).to_string(),
    );
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parses the `X-NexusX-Bundle-Session-Id`/`X-NexusX-Bundle-Step-Index`
/// header pair; either malformed or only one present is treated as absent
/// (the caller then proceeds as an ordinary, non-bundle call).
fn parse_bundle_headers(headers: &HeaderMap) -> Option<(Uuid, u32)> {
    let session_id = header_str(headers, HEADER_BUNDLE_SESSION_ID).and_then(|v| Uuid::parse_str(v).ok())?;
    let step_index = header_str(headers, HEADER_BUNDLE_STEP_INDEX).and_then(|v| v.parse::<u32>().ok())?;
    Some((session_id, step_index))
}

fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    let query = query?;
    query.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let k = parts.next()?;
        let v = parts.next().unwrap_or("");
        (k == key).then_some(v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_finds_matching_key() {
        let query = Some("foo=bar&api_key=nxs_abc123");
        assert_eq!(query_param(query, "api_key"), Some("nxs_abc123"));
        assert_eq!(query_param(query, "missing"), None);
        assert_eq!(query_param(None, "api_key"), None);
    }

    #[test]
    fn bundle_headers_require_both_parts() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_BUNDLE_SESSION_ID, "not-a-uuid".parse().unwrap());
        assert!(parse_bundle_headers(&headers).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(
            HEADER_BUNDLE_SESSION_ID,
            Uuid::new_v4().to_string().parse().unwrap(),
        );
        headers.insert(HEADER_BUNDLE_STEP_INDEX, "2".parse().unwrap());
        assert_eq!(
            parse_bundle_headers(&headers).map(|(_, idx)| idx),
            Some(2)
        );
    }
}
