//! Phase and report types for consolidation runs

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::memory::types::Category;

/// Where a consolidation run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationPhase {
    Idle,
    Analyzing,
    Extracting,
    Transferring,
    Promoting,
    Expiring,
}

impl ConsolidationPhase {
    /// The phases of one run, in execution order
    pub const PIPELINE: [ConsolidationPhase; 5] = [
        ConsolidationPhase::Analyzing,
        ConsolidationPhase::Extracting,
        ConsolidationPhase::Transferring,
        ConsolidationPhase::Promoting,
        ConsolidationPhase::Expiring,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConsolidationPhase::Idle => "idle",
            ConsolidationPhase::Analyzing => "analyzing",
            ConsolidationPhase::Extracting => "extracting",
            ConsolidationPhase::Transferring => "transferring",
            ConsolidationPhase::Promoting => "promoting",
            ConsolidationPhase::Expiring => "expiring",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ConsolidationPhase::Idle => 0,
            ConsolidationPhase::Analyzing => 1,
            ConsolidationPhase::Extracting => 2,
            ConsolidationPhase::Transferring => 3,
            ConsolidationPhase::Promoting => 4,
            ConsolidationPhase::Expiring => 5,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ConsolidationPhase::Analyzing,
            2 => ConsolidationPhase::Extracting,
            3 => ConsolidationPhase::Transferring,
            4 => ConsolidationPhase::Promoting,
            5 => ConsolidationPhase::Expiring,
            _ => ConsolidationPhase::Idle,
        }
    }
}

impl fmt::Display for ConsolidationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseStats {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl PhaseStats {
    pub(crate) fn success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub(crate) fn failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }
}

/// How a phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Completed,
    /// Not run: cancelled, aborted earlier, or nothing to run it with
    Skipped,
    /// Hit a fatal error
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub phase: ConsolidationPhase,
    pub status: PhaseStatus,
    pub stats: PhaseStats,
}

/// An entry that could not be processed in some phase
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedEntry {
    pub id: Uuid,
    pub phase: ConsolidationPhase,
    pub reason: String,
}

/// Outcome of one consolidation run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One row per pipeline phase, in order
    pub phases: Vec<PhaseReport>,
    pub cancelled: bool,
    /// Error that stopped the run early, if any
    pub aborted: Option<String>,
    /// Entries scored during analysis
    pub scored: usize,
    /// Entries copied into the archive
    pub archived: usize,
    /// Promotions, keyed by target category
    pub promoted: BTreeMap<Category, usize>,
    /// Entries deleted after their retention window
    pub expired: usize,
    /// Entries evicted from full categories during promotion
    pub evicted: Vec<Uuid>,
    pub failures: Vec<FailedEntry>,
}

impl ConsolidationReport {
    pub(crate) fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            phases: Vec::new(),
            cancelled: false,
            aborted: None,
            scored: 0,
            archived: 0,
            promoted: BTreeMap::new(),
            expired: 0,
            evicted: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, phase: ConsolidationPhase, status: PhaseStatus, stats: PhaseStats) {
        self.phases.push(PhaseReport { phase, status, stats });
    }

    pub(crate) fn fail(&mut self, id: Uuid, phase: ConsolidationPhase, reason: impl Into<String>) {
        self.failures.push(FailedEntry {
            id,
            phase,
            reason: reason.into(),
        });
    }

    /// Mark every phase without a row as skipped and stamp the finish time
    pub(crate) fn finish(&mut self, finished_at: DateTime<Utc>) {
        for phase in ConsolidationPhase::PIPELINE {
            if !self.phases.iter().any(|p| p.phase == phase) {
                self.record(phase, PhaseStatus::Skipped, PhaseStats::default());
            }
        }
        self.phases.sort_by_key(|p| p.phase);
        self.finished_at = finished_at;
    }

    pub fn phase(&self, phase: ConsolidationPhase) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn completed_phases(&self) -> Vec<ConsolidationPhase> {
        self.phases_with(PhaseStatus::Completed)
    }

    pub fn skipped_phases(&self) -> Vec<ConsolidationPhase> {
        self.phases_with(PhaseStatus::Skipped)
    }

    fn phases_with(&self, status: PhaseStatus) -> Vec<ConsolidationPhase> {
        self.phases
            .iter()
            .filter(|p| p.status == status)
            .map(|p| p.phase)
            .collect()
    }

    pub fn total_promoted(&self) -> usize {
        self.promoted.values().sum()
    }

    /// True when the run changed nothing
    pub fn is_quiet(&self) -> bool {
        self.archived == 0
            && self.promoted.is_empty()
            && self.expired == 0
            && self.evicted.is_empty()
            && self.failures.is_empty()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_roundtrip_through_u8() {
        for phase in ConsolidationPhase::PIPELINE {
            assert_eq!(ConsolidationPhase::from_u8(phase.as_u8()), phase);
        }
        assert_eq!(ConsolidationPhase::from_u8(0), ConsolidationPhase::Idle);
    }

    #[test]
    fn test_finish_fills_skipped_phases_in_order() {
        let now = Utc::now();
        let mut report = ConsolidationReport::new(now);
        report.record(
            ConsolidationPhase::Analyzing,
            PhaseStatus::Completed,
            PhaseStats::default(),
        );
        report.finish(now);

        assert_eq!(report.phases.len(), 5);
        assert_eq!(
            report.completed_phases(),
            vec![ConsolidationPhase::Analyzing]
        );
        assert_eq!(report.skipped_phases().len(), 4);
        assert_eq!(
            report.phases.iter().map(|p| p.phase).collect::<Vec<_>>(),
            ConsolidationPhase::PIPELINE.to_vec()
        );
        assert!(report.is_quiet());
    }

    #[test]
    fn test_failures_break_quiet() {
        let mut report = ConsolidationReport::new(Utc::now());
        report.fail(Uuid::new_v4(), ConsolidationPhase::Transferring, "disk full");
        assert!(!report.is_quiet());
    }
}
