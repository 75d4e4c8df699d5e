//! Consolidation for the categorized store
//!
//! A run walks a snapshot of the store through five phases:
//! - Analyzing: score every entry, pick promotion and archive candidates
//! - Extracting: let an optional [`Extractor`] attach summaries
//! - Transferring: copy candidates into the archive
//! - Promoting: move candidates up to the highest category they qualify for
//! - Expiring: delete never-read entries past their category's retention
//!
//! Cancellation is checked between phases. Per-entry failures are reported
//! and do not stop the run; storage I/O failures abort the remaining phases.

mod report;

pub use report::{
    ConsolidationPhase, ConsolidationReport, FailedEntry, PhaseReport, PhaseStats, PhaseStatus,
};

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ArborError, Result};
use crate::memory::score::ScoreEngine;
use crate::memory::types::{Category, Entry, EntryPatch};
use crate::storage::archive::{Archive, ArchiveHandle};
use crate::storage::categorized::CategorizedStore;

/// Produces a summary for an entry during the Extracting phase
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Return `None` to leave the entry's summary untouched
    async fn extract(&self, entry: &Entry) -> Result<Option<String>>;
}

/// Runtime settings for the consolidator
#[derive(Debug, Clone)]
pub struct ConsolidatorConfig {
    /// Snapshots at least this large are scored on the blocking pool (default: 512)
    pub parallel_threshold: usize,
    /// Entries per scoring task (default: 256)
    pub chunk_size: usize,
    /// Pause before the single transfer retry (default: 50ms)
    pub transfer_retry_backoff: StdDuration,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: 512,
            chunk_size: 256,
            transfer_retry_backoff: StdDuration::from_millis(50),
        }
    }
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    /// Phase after which to stop, 0 for none
    stop_after: AtomicU8,
}

/// Shared flag for stopping a run at the next phase boundary
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop before the next phase starts
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    /// Let the run finish `phase`, then stop
    pub fn cancel_after(&self, phase: ConsolidationPhase) {
        self.state.stop_after.store(phase.as_u8(), Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    fn stops_before(&self, phase: ConsolidationPhase) -> bool {
        let stop_after = self.state.stop_after.load(Ordering::SeqCst);
        self.is_cancelled() || (stop_after != 0 && phase.as_u8() > stop_after)
    }
}

#[derive(Debug, Clone)]
struct PromotionCandidate {
    id: Uuid,
    from: Category,
    to: Category,
    created_at: DateTime<Utc>,
}

/// Working state shared by the phases of one run
struct RunContext {
    now: DateTime<Utc>,
    promotions: Vec<PromotionCandidate>,
    archive_candidates: Vec<Uuid>,
    /// Transfers that failed twice this run
    deferred: HashSet<Uuid>,
    promoted: HashSet<Uuid>,
}

impl RunContext {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            promotions: Vec::new(),
            archive_candidates: Vec::new(),
            deferred: HashSet::new(),
            promoted: HashSet::new(),
        }
    }

    fn is_promotion_candidate(&self, id: Uuid) -> bool {
        self.promotions.iter().any(|c| c.id == id)
    }
}

fn is_fatal(error: &ArborError) -> bool {
    matches!(error, ArborError::StorageIo(_) | ArborError::Io(_))
}

/// Runs consolidation passes over the store and archive
pub struct Consolidator {
    store: Arc<CategorizedStore>,
    archive: Arc<Archive>,
    scorer: ScoreEngine,
    config: ConsolidatorConfig,
    extractor: Option<Arc<dyn Extractor>>,
    state: AtomicU8,
    running: Mutex<()>,
    last_report: Mutex<Option<ConsolidationReport>>,
}

impl Consolidator {
    pub fn new(store: Arc<CategorizedStore>, archive: Arc<Archive>, config: ConsolidatorConfig) -> Self {
        let scorer = *store.scorer();
        Self {
            store,
            archive,
            scorer,
            config,
            extractor: None,
            state: AtomicU8::new(ConsolidationPhase::Idle.as_u8()),
            running: Mutex::new(()),
            last_report: Mutex::new(None),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Phase of the run in progress, `Idle` between runs
    pub fn state(&self) -> ConsolidationPhase {
        ConsolidationPhase::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, phase: ConsolidationPhase) {
        self.state.store(phase.as_u8(), Ordering::SeqCst);
    }

    pub async fn last_report(&self) -> Option<ConsolidationReport> {
        self.last_report.lock().await.clone()
    }

    /// Run one full pass
    pub async fn run(&self) -> Result<ConsolidationReport> {
        self.run_with(&CancelHandle::new()).await
    }

    /// Run one pass, checking `cancel` between phases.
    ///
    /// Fails with [`ArborError::ConsolidationInProgress`] if another run is
    /// still going.
    pub async fn run_with(&self, cancel: &CancelHandle) -> Result<ConsolidationReport> {
        let Ok(_running) = self.running.try_lock() else {
            return Err(ArborError::ConsolidationInProgress);
        };

        let started_at = Utc::now();
        let mut ctx = RunContext::new(started_at);
        let mut report = ConsolidationReport::new(started_at);
        info!("Starting consolidation over {} stored entries", self.store.len());

        for phase in ConsolidationPhase::PIPELINE {
            if cancel.stops_before(phase) {
                info!("Consolidation cancelled before {}", phase);
                report.cancelled = true;
                break;
            }

            self.set_state(phase);
            let outcome = match phase {
                ConsolidationPhase::Analyzing => self.analyze(&mut ctx, &mut report).await,
                ConsolidationPhase::Extracting => self.extract(&mut ctx, &mut report).await,
                ConsolidationPhase::Transferring => self.transfer(&mut ctx, &mut report).await,
                ConsolidationPhase::Promoting => self.promote(&mut ctx, &mut report).await,
                ConsolidationPhase::Expiring => self.expire(&mut ctx, &mut report).await,
                ConsolidationPhase::Idle => Ok(None),
            };

            match outcome {
                Ok(Some(stats)) => report.record(phase, PhaseStatus::Completed, stats),
                Ok(None) => report.record(phase, PhaseStatus::Skipped, PhaseStats::default()),
                Err(e) => {
                    warn!("Consolidation aborted during {}: {}", phase, e);
                    report.record(phase, PhaseStatus::Aborted, PhaseStats::default());
                    report.aborted = Some(format!("{phase}: {e}"));
                    break;
                }
            }
        }

        self.set_state(ConsolidationPhase::Idle);
        report.finish(Utc::now());

        info!(
            "Consolidation finished: scored={}, archived={}, promoted={}, expired={}, failures={}",
            report.scored,
            report.archived,
            report.total_promoted(),
            report.expired,
            report.failures.len()
        );

        *self.last_report.lock().await = Some(report.clone());
        Ok(report)
    }

    async fn analyze(
        &self,
        ctx: &mut RunContext,
        report: &mut ConsolidationReport,
    ) -> Result<Option<PhaseStats>> {
        let snapshot = self.store.snapshot().await;
        let now = ctx.now;
        let total = snapshot.len();

        let scored: Vec<(Entry, f64)> = if total >= self.config.parallel_threshold {
            let scorer = self.scorer;
            let chunk_size = self.config.chunk_size.max(1);
            let mut entries = snapshot.into_iter();
            let mut tasks = Vec::new();
            loop {
                let chunk: Vec<Entry> = entries.by_ref().take(chunk_size).collect();
                if chunk.is_empty() {
                    break;
                }
                tasks.push(tokio::task::spawn_blocking(move || {
                    chunk
                        .into_iter()
                        .map(|entry| {
                            let score = scorer.score(&entry, now);
                            (entry, score)
                        })
                        .collect::<Vec<_>>()
                }));
            }
            debug!("Scoring {} entries in {} tasks", total, tasks.len());
            futures::future::try_join_all(tasks)
                .await
                .map_err(|e| ArborError::General(format!("scoring task failed: {e}")))?
                .into_iter()
                .flatten()
                .collect()
        } else {
            snapshot
                .into_iter()
                .map(|entry| {
                    let score = self.scorer.score(&entry, now);
                    (entry, score)
                })
                .collect()
        };

        let mut archive_candidates = Vec::new();
        for (entry, score) in &scored {
            if let Some(target) = self.scorer.promotion_target(entry.category, *score) {
                debug!(
                    "Entry {} scored {:.3}, promoting {} -> {}",
                    entry.id, score, entry.category, target
                );
                ctx.promotions.push(PromotionCandidate {
                    id: entry.id,
                    from: entry.category,
                    to: target,
                    created_at: entry.created_at,
                });
            }
            if entry.needs_archiving() {
                archive_candidates.push((entry.created_at, entry.id));
            }
        }

        // Free space in the upper categories before filling them from below
        ctx.promotions.sort_by(|a, b| {
            b.from
                .cmp(&a.from)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        archive_candidates.sort();
        ctx.archive_candidates = archive_candidates.into_iter().map(|(_, id)| id).collect();

        report.scored = total;
        Ok(Some(PhaseStats {
            processed: total,
            succeeded: total,
            failed: 0,
        }))
    }

    async fn extract(
        &self,
        ctx: &mut RunContext,
        report: &mut ConsolidationReport,
    ) -> Result<Option<PhaseStats>> {
        let Some(extractor) = &self.extractor else {
            return Ok(None);
        };

        let mut seen = HashSet::new();
        let candidates: Vec<Uuid> = ctx
            .archive_candidates
            .iter()
            .copied()
            .chain(ctx.promotions.iter().map(|c| c.id))
            .filter(|id| seen.insert(*id))
            .collect();

        let mut stats = PhaseStats::default();
        for id in candidates {
            let Some(entry) = self.store.peek(id).await else {
                continue;
            };
            match extractor.extract(&entry).await {
                Ok(Some(summary)) => match self.store.mutate(id, EntryPatch::summary(summary)).await {
                    Ok(_) => stats.success(),
                    Err(e) if is_fatal(&e) => return Err(e),
                    Err(e) => {
                        stats.failure();
                        report.fail(id, ConsolidationPhase::Extracting, e.to_string());
                    }
                },
                Ok(None) => stats.success(),
                Err(e) => {
                    warn!("Extractor failed for entry {}: {}", id, e);
                    stats.failure();
                    report.fail(id, ConsolidationPhase::Extracting, e.to_string());
                }
            }
        }

        Ok(Some(stats))
    }

    async fn archive_with_retry(&self, entry: &Entry) -> Result<ArchiveHandle> {
        match self.archive.archive(entry).await {
            Ok(handle) => Ok(handle),
            Err(first) => {
                warn!(
                    "Archiving entry {} failed ({}), retrying once",
                    entry.id, first
                );
                tokio::time::sleep(self.config.transfer_retry_backoff).await;
                self.archive.archive(entry).await
            }
        }
    }

    async fn transfer(
        &self,
        ctx: &mut RunContext,
        report: &mut ConsolidationReport,
    ) -> Result<Option<PhaseStats>> {
        let mut stats = PhaseStats::default();

        for &id in &ctx.archive_candidates {
            let Some(entry) = self.store.peek(id).await else {
                continue;
            };
            if !entry.needs_archiving() {
                continue;
            }

            match self.archive_with_retry(&entry).await {
                Ok(handle) => match self.store.mutate(id, EntryPatch::archived(handle.version)).await {
                    Ok(_) => {
                        stats.success();
                        report.archived += 1;
                    }
                    Err(e) if is_fatal(&e) => return Err(e),
                    Err(e) => {
                        stats.failure();
                        report.fail(id, ConsolidationPhase::Transferring, e.to_string());
                    }
                },
                Err(e) => {
                    warn!("Deferring archive of entry {} to the next run: {}", id, e);
                    ctx.deferred.insert(id);
                    stats.failure();
                    report.fail(id, ConsolidationPhase::Transferring, e.to_string());
                }
            }
        }

        Ok(Some(stats))
    }

    async fn promote(
        &self,
        ctx: &mut RunContext,
        report: &mut ConsolidationReport,
    ) -> Result<Option<PhaseStats>> {
        let mut stats = PhaseStats::default();

        for candidate in &ctx.promotions {
            match self.store.promote(candidate.id, candidate.to).await {
                Ok(Some(outcome)) => {
                    stats.success();
                    *report.promoted.entry(outcome.to).or_default() += 1;
                    report.evicted.extend(outcome.evicted);
                    ctx.promoted.insert(candidate.id);
                }
                // Deleted or evicted since the snapshot
                Ok(None) => {}
                // Already at or above the target
                Err(ArborError::InvalidPromotion(_)) => {}
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(
                        "Could not promote entry {} from {} to {}: {}",
                        candidate.id, candidate.from, candidate.to, e
                    );
                    stats.failure();
                    report.fail(candidate.id, ConsolidationPhase::Promoting, e.to_string());
                }
            }
        }

        Ok(Some(stats))
    }

    async fn expire(
        &self,
        ctx: &mut RunContext,
        report: &mut ConsolidationReport,
    ) -> Result<Option<PhaseStats>> {
        let mut stats = PhaseStats::default();

        for category in Category::ALL {
            let Some(retention) = self.store.retention(category) else {
                continue;
            };

            let mut entries = self.store.entries_in(category).await;
            entries.sort_by_key(|e| (e.created_at, e.id));

            for entry in entries {
                let expired = entry.age(ctx.now) > retention && entry.access_count == 0;
                if !expired
                    || ctx.promoted.contains(&entry.id)
                    || ctx.is_promotion_candidate(entry.id)
                    || ctx.deferred.contains(&entry.id)
                    || entry.needs_archiving()
                {
                    continue;
                }

                match self.store.delete(entry.id).await {
                    Ok(Some(_)) => {
                        debug!("Expired entry {} from {}", entry.id, category);
                        stats.success();
                        report.expired += 1;
                    }
                    Ok(None) => {}
                    Err(e) if is_fatal(&e) => return Err(e),
                    Err(e) => {
                        stats.failure();
                        report.fail(entry.id, ConsolidationPhase::Expiring, e.to_string());
                    }
                }
            }
        }

        Ok(Some(stats))
    }
}
