//! x402 pay-per-call payment flow. Verification happens before the
//! proxy dispatch; settlement is attempted only once the upstream has
//! responded with a non-5xx status — the "pay-on-success" contract.

use base64::Engine;
use gateway_types::{
    DeferredPayment, GatewayError, GatewayResult, RequestContext, Route, SettledPayment,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::demand::{emit_async, DemandSignalSink};
use crate::jobs::JobQueue;

/// "Pay-per-call 402 response body" requirement object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequirement {
    pub scheme: String,
    pub network: String,
    #[serde(rename = "maxAmountRequired")]
    pub max_amount_required: String,
    pub resource: String,
    #[serde(rename = "payTo")]
    pub pay_to: String,
    pub asset: String,
    #[serde(rename = "maxTimeoutSeconds")]
    pub max_timeout_seconds: u64,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Outcome of `challenge_or_admit`.
pub enum ChallengeOutcome {
    Admit(RequestContext),
    Emit402(PaymentRequirement),
    Reject(GatewayError),
}

#[derive(Debug, Serialize)]
struct FacilitatorRequest<'a> {
    #[serde(rename = "paymentPayload")]
    payment_payload: &'a serde_json::Value,
    #[serde(rename = "paymentRequirements")]
    payment_requirements: &'a PaymentRequirement,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FacilitatorResponse {
    #[serde(default, alias = "success")]
    is_valid: Option<bool>,
    #[serde(default, alias = "payerAddress")]
    payer: Option<String>,
    #[serde(default, alias = "transaction")]
    tx_hash: Option<String>,
    #[serde(default, alias = "errorReason")]
    invalid_reason: Option<String>,
}

impl FacilitatorResponse {
    fn accepted(&self) -> bool {
        self.is_valid.unwrap_or(false)
    }
}

pub struct FacilitatorClient {
    client: Client,
    base_url: String,
}

impl FacilitatorClient {
    pub fn new(base_url: String, timeout_ms: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self { client, base_url })
    }

    async fn verify(
        &self,
        payload: &serde_json::Value,
        requirement: &PaymentRequirement,
    ) -> anyhow::Result<FacilitatorResponse> {
        self.post("/verify", payload, requirement).await
    }

    async fn settle(
        &self,
        payload: &serde_json::Value,
        requirement: &PaymentRequirement,
    ) -> anyhow::Result<FacilitatorResponse> {
        self.post("/settle", payload, requirement).await
    }

    async fn post(
        &self,
        path: &str,
        payload: &serde_json::Value,
        requirement: &PaymentRequirement,
    ) -> anyhow::Result<FacilitatorResponse> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .post(&url)
            .json(&FacilitatorRequest {
                payment_payload: payload,
                payment_requirements: requirement,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("facilitator {path} returned {}", response.status());
        }
        Ok(response.json().await?)
    }
}

pub struct PaymentChallengerConfig {
    pub network: String,
    pub platform_address: String,
    pub usdc_asset_addresses: HashMap<String, String>,
    pub max_timeout_seconds: u64,
    pub platform_fee_rate: gateway_types::Usdc,
}

pub struct PaymentChallenger {
    facilitator: Arc<FacilitatorClient>,
    config: PaymentChallengerConfig,
    jobs: Arc<JobQueue>,
    demand_sink: Arc<dyn DemandSignalSink>,
}

impl PaymentChallenger {
    pub fn new(
        facilitator: Arc<FacilitatorClient>,
        config: PaymentChallengerConfig,
        jobs: Arc<JobQueue>,
        demand_sink: Arc<dyn DemandSignalSink>,
    ) -> Self {
        Self {
            facilitator,
            config,
            jobs,
            demand_sink,
        }
    }

    /// `challengeOrAdmit`. `sandbox_bypass` mirrors the `X-NexusX-Sandbox`
    /// header; `payment_header` is the decoded (still-encoded) `X-Payment` value.
    pub async fn challenge_or_admit(
        &self,
        route: &Route,
        resource_url: &str,
        payment_header: Option<&str>,
        buyer_wallet_address: String,
        sandbox_bypass: bool,
    ) -> GatewayResult<ChallengeOutcome> {
        if sandbox_bypass {
            return Ok(ChallengeOutcome::Admit(synthetic_sandbox_context(
                buyer_wallet_address,
            )));
        }
        if !route.state.is_active() {
            return Ok(ChallengeOutcome::Reject(GatewayError::ListingUnavailable));
        }

        let Some(encoded) = payment_header else {
            let requirement = self.build_requirement(route, resource_url);
            self.emit_view_signal(route.id, &requirement);
            return Ok(ChallengeOutcome::Emit402(requirement));
        };

        let requirement = self.build_requirement(route, resource_url);
        let payload = match decode_payment_payload(encoded) {
            Ok(payload) => payload,
            Err(_) => return Ok(ChallengeOutcome::Emit402(requirement)),
        };

        let verified = match self.facilitator.verify(&payload, &requirement).await {
            Ok(response) if response.accepted() => response,
            Ok(_) | Err(_) => return Ok(ChallengeOutcome::Emit402(requirement)),
        };

        let context = RequestContext {
            buyer_id: Uuid::new_v4(),
            buyer_wallet_address: verified.payer.clone().unwrap_or(buyer_wallet_address),
            api_key_id: None,
            rate_limit_rpm: gateway_config::GatewayConfig::default().rate_limit.default_requests_per_minute,
            request_id: Uuid::new_v4(),
            received_at: chrono::Utc::now(),
            auth_mode: gateway_types::AuthMode::PayPerCall,
            deferred_payment: Some(DeferredPayment {
                payer_address: verified.payer.unwrap_or_default(),
                payload_b64: encoded.to_string(),
                requirements_json: serde_json::to_value(&requirement).unwrap_or_default(),
            }),
            settled_payment: None,
        };

        self.emit_api_call_signal(route.id, context.buyer_id);
        Ok(ChallengeOutcome::Admit(context))
    }

    /// Attempted after the proxy stage, only when `upstream_status < 500`
    /// (the pay-on-success contract). Failure is logged, never retroactive.
    pub async fn settle_if_eligible(
        &self,
        deferred: &DeferredPayment,
        requirement: &PaymentRequirement,
        upstream_status: u16,
    ) -> Option<SettledPayment> {
        if upstream_status >= 500 {
            return None;
        }
        let payload: serde_json::Value = match serde_json::from_str(
            &String::from_utf8(
                base64::engine::general_purpose::STANDARD
                    .decode(&deferred.payload_b64)
                    .ok()?,
            )
            .ok()?,
        ) {
            Ok(payload) => payload,
            Err(_) => return None,
        };

        match self.facilitator.settle(&payload, requirement).await {
            Ok(response) if response.accepted() => Some(SettledPayment {
                tx_hash: response.tx_hash.unwrap_or_default(),
                payer_address: response.payer.unwrap_or_else(|| deferred.payer_address.clone()),
            }),
            Ok(response) => {
                warn!(
                    reason = ?response.invalid_reason,
                    "facilitator settlement rejected, buyer retains funds"
                );
                None
            }
            Err(err) => {
                warn!(%err, "facilitator settlement call failed, buyer retains funds");
                None
            }
        }
    }

    fn build_requirement(&self, route: &Route, resource_url: &str) -> PaymentRequirement {
        let atomic_units = gateway_types::to_atomic_units_string(route.current_price);
        let asset = self
            .config
            .usdc_asset_addresses
            .get(&self.config.network)
            .cloned()
            .unwrap_or_default();
        PaymentRequirement {
            scheme: "exact".to_string(),
            network: self.config.network.clone(),
            max_amount_required: atomic_units,
            resource: resource_url.to_string(),
            pay_to: self.config.platform_address.clone(),
            asset,
            max_timeout_seconds: self.config.max_timeout_seconds,
            extra: HashMap::new(),
        }
    }

    fn emit_view_signal(&self, listing_id: gateway_types::ListingId, _requirement: &PaymentRequirement) {
        emit_async(
            &self.jobs,
            Arc::clone(&self.demand_sink),
            gateway_types::DemandSignal {
                listing_id,
                buyer_id: Uuid::nil(),
                signal_type: gateway_types::DemandSignalType::View,
                weight: gateway_types::DemandSignalType::View.default_weight(),
                metadata: HashMap::new(),
            },
        );
    }

    fn emit_api_call_signal(&self, listing_id: gateway_types::ListingId, buyer_id: gateway_types::BuyerId) {
        emit_async(
            &self.jobs,
            Arc::clone(&self.demand_sink),
            gateway_types::DemandSignal {
                listing_id,
                buyer_id,
                signal_type: gateway_types::DemandSignalType::ApiCall,
                weight: gateway_types::DemandSignalType::ApiCall.default_weight(),
                metadata: HashMap::new(),
            },
        );
    }
}

fn synthetic_sandbox_context(buyer_wallet_address: String) -> RequestContext {
    RequestContext {
        buyer_id: Uuid::nil(),
        buyer_wallet_address,
        api_key_id: None,
        rate_limit_rpm: gateway_config::RateLimitConfig::default().default_requests_per_minute,
        request_id: Uuid::new_v4(),
        received_at: chrono::Utc::now(),
        auth_mode: gateway_types::AuthMode::PayPerCall,
        deferred_payment: None,
        settled_payment: None,
    }
}

fn decode_payment_payload(encoded: &str) -> anyhow::Result<serde_json::Value> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_types::RouteState;
    use rust_decimal_macros::dec;

    fn route() -> Route {
        Route {
            id: Uuid::new_v4(),
            slug: "weather".to_string(),
            upstream_base_url: "https://upstream.example.com".to_string(),
            capacity_requests_per_minute: 600,
            current_price: dec!(0.01),
            floor_price: dec!(0.001),
            provider_payout_address: "0xprovider".to_string(),
            state: RouteState::Active,
            sandbox: false,
            created_at: chrono::Utc::now(),
        }
    }

    fn challenger() -> PaymentChallenger {
        let facilitator = Arc::new(FacilitatorClient::new("https://facilitator.example.com".to_string(), 10_000).unwrap());
        let mut usdc_asset_addresses = HashMap::new();
        usdc_asset_addresses.insert("base".to_string(), "0xusdc".to_string());
        let config = PaymentChallengerConfig {
            network: "base".to_string(),
            platform_address: "0xplatform".to_string(),
            usdc_asset_addresses,
            max_timeout_seconds: 30,
            platform_fee_rate: dec!(0.12),
        };
        PaymentChallenger::new(
            facilitator,
            config,
            Arc::new(JobQueue::new(8)),
            Arc::new(crate::demand::LoggingDemandSignalSink),
        )
    }

    #[tokio::test]
    async fn sandbox_bypass_admits_synthetic_context() {
        let challenger = challenger();
        let route = route();
        let outcome = challenger
            .challenge_or_admit(&route, "https://gw/v1/weather/today", None, "0xbuyer".to_string(), true)
            .await
            .unwrap();
        assert!(matches!(outcome, ChallengeOutcome::Admit(_)));
    }

    #[tokio::test]
    async fn missing_payment_header_emits_402_with_atomic_units() {
        let challenger = challenger();
        let route = route();
        let outcome = challenger
            .challenge_or_admit(&route, "https://gw/v1/weather/today", None, "0xbuyer".to_string(), false)
            .await
            .unwrap();
        match outcome {
            ChallengeOutcome::Emit402(requirement) => {
                assert_eq!(requirement.max_amount_required, "10000");
                assert_eq!(requirement.pay_to, "0xplatform");
                assert_eq!(requirement.asset, "0xusdc");
            }
            _ => panic!("expected Emit402"),
        }
    }

    #[tokio::test]
    async fn unparseable_payment_header_falls_back_to_402() {
        let challenger = challenger();
        let route = route();
        let outcome = challenger
            .challenge_or_admit(
                &route,
                "https://gw/v1/weather/today",
                Some("not-base64!!"),
                "0xbuyer".to_string(),
                false,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, ChallengeOutcome::Emit402(_)));
    }

    #[tokio::test]
    async fn suspended_listing_is_rejected() {
        let challenger = challenger();
        let mut route = route();
        route.state = RouteState::Suspended;
        let outcome = challenger
            .challenge_or_admit(&route, "https://gw/v1/weather/today", None, "0xbuyer".to_string(), false)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ChallengeOutcome::Reject(GatewayError::ListingUnavailable)
        ));
    }
}
