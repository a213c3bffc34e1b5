//! Failure taxonomy for the tier generation pipeline.
//!
//! Most per-source failures are swallowed at the call site after logging: a
//! persistence or remote miss simply falls through to the next source. The
//! only failure a generation job surfaces to callers is
//! [`TierSourceError::SourceUnavailable`].

use thiserror::Error;

use crate::types::Tier;

/// Why a single tier could not be produced from a given source.
///
/// Cloneable because job results are distributed through shared futures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TierSourceError {
    /// No source at all (persistence, remote, in-memory raster) could produce
    /// the priority tier. Terminal for the job.
    #[error("no source available to rasterize asset {hash}")]
    SourceUnavailable { hash: String },

    /// The remote store answered non-2xx, timed out, or returned an
    /// undecodable body. Recoverable: fall through to the next source.
    #[error("remote store miss for tier {tier}: {reason}")]
    RemoteMiss { tier: Tier, reason: String },

    /// The durable tier store failed to answer. Recoverable.
    #[error("persistence tier unavailable: {reason}")]
    PersistenceUnavailable { reason: String },

    /// Local rasterization itself failed (corrupt or truncated source
    /// buffer). Terminal for the tier, recoverable for the job.
    #[error("tier {tier} rasterization failed: {reason}")]
    RasterizeFailed { tier: Tier, reason: String },

    /// The requested tier exceeds the source's native resolution. Not a
    /// failure of the pipeline: the caller should use the largest available
    /// tier or the original instead of upscaling.
    #[error("tier {tier} exceeds native dimension {native}")]
    Oversize { tier: Tier, native: u32 },

    /// The spawned generation task was torn down by the runtime.
    #[error("generation task for asset {hash} aborted")]
    JobAborted { hash: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_tier() {
        let oversize = TierSourceError::Oversize { tier: 2048, native: 2000 };
        assert_eq!(oversize.to_string(), "tier 2048 exceeds native dimension 2000");

        let miss = TierSourceError::RemoteMiss { tier: 256, reason: "timeout".into() };
        assert!(miss.to_string().contains("256"));
    }
}
