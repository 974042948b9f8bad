//! Throughput planning
//!
//! Turns a messages-per-second target into the batch size and inter-batch
//! delay the dispatcher runs with. Long texts cost several SMSC submissions
//! worth of license capacity, one per 70-character UCS-2 segment.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Characters per UCS-2 segment
pub const UCS2_SEGMENT_CHARS: usize = 70;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThroughputError {
    #[error("No spare capacity: peak usage {peak} msg/s of {ceiling} msg/s licensed")]
    NoCapacity { peak: u32, ceiling: u32 },

    #[error("Throughput must be greater than zero")]
    ZeroTps,

    #[error("Batch size must be greater than zero")]
    ZeroBatch,
}

/// Pacing the dispatcher runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    /// Messages per second the plan was derived from
    pub tps: u32,
    pub parts: u32,
}

/// Number of segments `text` occupies, at least one.
pub fn message_parts(text: &str) -> u32 {
    // The SMSC counts UTF-16 code units.
    let units = text.encode_utf16().count();
    units.div_ceil(UCS2_SEGMENT_CHARS).max(1) as u32
}

/// Delay between batches so that `batch_size` messages of `parts`
/// segments each stay within `tps` segments per second.
pub fn plan(tps: u32, parts: u32, batch_size: usize) -> Result<BatchPlan, ThroughputError> {
    if tps == 0 {
        return Err(ThroughputError::ZeroTps);
    }
    if batch_size == 0 {
        return Err(ThroughputError::ZeroBatch);
    }
    let parts = parts.max(1);
    let segments = batch_size as u64 * parts as u64 * 1000;
    let delay_ms = segments.div_ceil(tps as u64);

    Ok(BatchPlan {
        batch_size,
        inter_batch_delay: Duration::from_millis(delay_ms),
        tps,
        parts,
    })
}

/// Source of the current peak usage of the licensed throughput.
#[async_trait]
pub trait PeakUsageSource: Send + Sync {
    async fn peak_tps(&self) -> anyhow::Result<u32>;
}

/// A fixed peak usage, for deployments without a usage store.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticPeakUsage(pub u32);

#[async_trait]
impl PeakUsageSource for StaticPeakUsage {
    async fn peak_tps(&self) -> anyhow::Result<u32> {
        Ok(self.0)
    }
}

/// Spare capacity: `ceiling - peak`.
///
/// A failed lookup falls back to the full ceiling.
pub async fn auto_tps(source: &dyn PeakUsageSource, ceiling: u32) -> Result<u32, ThroughputError> {
    let peak = match source.peak_tps().await {
        Ok(peak) => peak,
        Err(e) => {
            warn!(error = %e, ceiling, "Peak usage lookup failed, using license ceiling");
            return if ceiling == 0 {
                Err(ThroughputError::NoCapacity { peak: 0, ceiling })
            } else {
                Ok(ceiling)
            };
        }
    };

    let available = ceiling.saturating_sub(peak);
    if available == 0 {
        return Err(ThroughputError::NoCapacity { peak, ceiling });
    }
    info!(peak, ceiling, available, "Derived throughput from peak usage");
    Ok(available)
}

/// Resolve a requested tps; zero means derive it from peak usage.
///
/// Explicit requests above the ceiling are clamped to it.
pub async fn resolve_tps(requested: u32, source: &dyn PeakUsageSource, ceiling: u32) -> Result<u32, ThroughputError> {
    if requested == 0 {
        return auto_tps(source, ceiling).await;
    }
    if ceiling > 0 && requested > ceiling {
        warn!(requested, ceiling, "Requested throughput exceeds license ceiling, clamping");
        return Ok(ceiling);
    }
    Ok(requested)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingPeakUsage;

    #[async_trait]
    impl PeakUsageSource for FailingPeakUsage {
        async fn peak_tps(&self) -> anyhow::Result<u32> {
            anyhow::bail!("usage store unreachable")
        }
    }

    #[test]
    fn test_message_parts() {
        assert_eq!(message_parts(""), 1);
        assert_eq!(message_parts("hello"), 1);
        assert_eq!(message_parts(&"a".repeat(70)), 1);
        assert_eq!(message_parts(&"a".repeat(71)), 2);
        assert_eq!(message_parts(&"ب".repeat(140)), 2);
    }

    #[test]
    fn test_plan_delay() {
        // 14 single-part messages at 140 msg/s -> one batch per 100 ms
        let single = plan(140, 1, 14).unwrap();
        assert_eq!(single.inter_batch_delay, Duration::from_millis(100));

        // two parts halve the effective rate
        let two_parts = plan(140, 2, 14).unwrap();
        assert_eq!(two_parts.inter_batch_delay, Duration::from_millis(200));

        // rounds up
        let odd = plan(3, 1, 1).unwrap();
        assert_eq!(odd.inter_batch_delay, Duration::from_millis(334));
    }

    #[test]
    fn test_plan_rejects_zero_inputs() {
        assert_eq!(plan(0, 1, 14), Err(ThroughputError::ZeroTps));
        assert_eq!(plan(100, 1, 0), Err(ThroughputError::ZeroBatch));
    }

    #[tokio::test]
    async fn test_auto_tps() {
        assert_eq!(auto_tps(&StaticPeakUsage(1200), 5000).await, Ok(3800));
        assert_eq!(
            auto_tps(&StaticPeakUsage(5000), 5000).await,
            Err(ThroughputError::NoCapacity { peak: 5000, ceiling: 5000 })
        );
        assert!(auto_tps(&StaticPeakUsage(6000), 5000).await.is_err());
    }

    #[tokio::test]
    async fn test_auto_tps_falls_back_to_ceiling() {
        assert_eq!(auto_tps(&FailingPeakUsage, 5000).await, Ok(5000));
    }

    #[tokio::test]
    async fn test_resolve_tps() {
        let usage = StaticPeakUsage(1000);
        assert_eq!(resolve_tps(0, &usage, 5000).await, Ok(4000));
        assert_eq!(resolve_tps(200, &usage, 5000).await, Ok(200));
        assert_eq!(resolve_tps(9000, &usage, 5000).await, Ok(5000));
    }
}
