use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk_store::ChunkStore;
use crate::error::UploadResult;
use crate::merge::MergeEngine;
use crate::registry::SessionRegistry;
use crate::service::UploadService;

/// What one collection pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    /// Idle sessions whose metadata and chunks were reclaimed.
    pub expired: usize,
    /// Chunk namespaces that had no session record.
    pub orphans: usize,
    /// Completion receipts older than the TTL.
    pub receipts: usize,
}

/// Background task that reclaims abandoned sessions.
///
/// Runs on an interval until `shutdown` fires. Errors are logged and the next
/// tick tries again.
pub async fn run_gc_loop(service: Arc<UploadService>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; skip it so startup is not a sweep.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("GC loop stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        match service.collect_garbage().await {
            Ok(report) => {
                if report.expired > 0 || report.orphans > 0 {
                    info!(
                        "GC: reclaimed {} idle sessions, {} orphaned chunk namespaces",
                        report.expired, report.orphans
                    );
                }
            }
            Err(e) => {
                warn!("GC error: {}", e);
            }
        }
    }
}

pub struct GarbageCollector {
    registry: Arc<SessionRegistry>,
    store: Arc<ChunkStore>,
    merges: Arc<MergeEngine>,
    ttl: Duration,
}

impl GarbageCollector {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<ChunkStore>,
        merges: Arc<MergeEngine>,
        ttl: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            merges,
            ttl,
        }
    }

    /// One pass as of `now`: sessions idle since before `now - ttl` that are
    /// not locked go, then receipts older than the TTL, then chunk namespaces
    /// nobody owns.
    pub async fn collect_at(&self, now: DateTime<Utc>) -> UploadResult<GcReport> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = now
            .checked_sub_signed(ttl)
            .map(|t| t.timestamp_millis())
            .unwrap_or(i64::MIN);
        let mut report = GcReport::default();

        for id in self.registry.idle_sessions(cutoff)? {
            // Re-checked under the writer lock: activity since the scan wins.
            if !self.registry.delete_if_idle(&id, cutoff)? {
                debug!("GC: session {} became active, skipping", id);
                continue;
            }
            if let Err(e) = self.store.purge(&id).await {
                warn!("GC: session {} deleted but chunks remain: {}", id, e);
            }
            info!("GC: session {} expired", id);
            report.expired += 1;
        }

        report.receipts = self.registry.prune_receipts(cutoff)?;

        // Namespaces first: a session created after this listing cannot be
        // mistaken for an orphan.
        let namespaces = match self.store.namespaces().await {
            Ok(ns) => ns,
            Err(e) => {
                warn!("GC: cannot list chunk namespaces: {}", e);
                return Ok(report);
            }
        };
        let known = self.registry.session_ids()?;
        for id in namespaces.difference(&known) {
            if self.merges.is_running(id) {
                continue;
            }
            match self.store.purge(id).await {
                Ok(()) => {
                    debug!("GC: removed orphaned chunks of {}", id);
                    report.orphans += 1;
                }
                Err(e) => warn!("GC: failed to remove orphaned chunks of {}: {}", id, e),
            }
        }

        Ok(report)
    }
}
