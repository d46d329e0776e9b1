//! Demand-signal emission. Every signal is
//! submitted through the fire-and-forget [`JobQueue`] so emission never adds
//! latency to the request that triggered it.

use async_trait::async_trait;
use gateway_types::DemandSignal;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::jobs::JobQueue;

/// The external auction/pricing engine's ingestion endpoint, abstracted the
/// same way [`crate::store::PersistenceStore`] abstracts the data store.
#[async_trait]
pub trait DemandSignalSink: Send + Sync {
    async fn emit(&self, signal: DemandSignal) -> anyhow::Result<()>;
}

/// Reference sink used by tests and standalone deployments lacking a real
/// auction engine: logs the signal at debug level and returns immediately.
pub struct LoggingDemandSignalSink;

#[async_trait]
impl DemandSignalSink for LoggingDemandSignalSink {
    async fn emit(&self, signal: DemandSignal) -> anyhow::Result<()> {
        debug!(
            listing_id = %signal.listing_id,
            buyer_id = %signal.buyer_id,
            signal_type = ?signal.signal_type,
            weight = signal.weight,
            "demand signal"
        );
        Ok(())
    }
}

/// Schedules `signal` onto the job queue for non-blocking delivery to `sink`.
pub fn emit_async(jobs: &JobQueue, sink: Arc<dyn DemandSignalSink>, signal: DemandSignal) {
    jobs.spawn("demand_signal", async move {
        if let Err(err) = sink.emit(signal).await {
            warn!(%err, "failed to emit demand signal");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_types::DemandSignalType;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[tokio::test]
    async fn logging_sink_accepts_every_signal_type() {
        let sink = LoggingDemandSignalSink;
        for signal_type in [
            DemandSignalType::ApiCall,
            DemandSignalType::View,
            DemandSignalType::RateLimited,
            DemandSignalType::SandboxTest,
        ] {
            let signal = DemandSignal {
                listing_id: Uuid::new_v4(),
                buyer_id: Uuid::new_v4(),
                signal_type,
                weight: signal_type.default_weight(),
                metadata: HashMap::new(),
            };
            sink.emit(signal).await.unwrap();
        }
    }

    #[tokio::test]
    async fn emit_async_does_not_block_caller() {
        let jobs = Arc::new(JobQueue::new(4));
        let sink: Arc<dyn DemandSignalSink> = Arc::new(LoggingDemandSignalSink);
        let signal = DemandSignal {
            listing_id: Uuid::new_v4(),
            buyer_id: Uuid::new_v4(),
            signal_type: DemandSignalType::ApiCall,
            weight: 1.0,
            metadata: HashMap::new(),
        };
        emit_async(&jobs, sink, signal);
        jobs.shutdown().await;
    }
}
