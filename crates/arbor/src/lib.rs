//! Arbor - tiered memory engine
//!
//! Entries land in a bounded hot buffer, move into a categorized store
//! (seed, leaf, branch, root) and are copied into an encrypted archive.
//! A consolidation pass scores every stored entry, archives it and promotes
//! it to the highest category its score qualifies for.

pub mod config;
pub mod consolidation;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod memory;
pub mod storage;

pub use config::Config;
pub use consolidation::{CancelHandle, ConsolidationPhase, ConsolidationReport, Consolidator, Extractor};
pub use crypto::{KdfParams, MasterSecret};
pub use engine::{
    CategoryStatus, EngineOptions, MemoryEngine, PhiStatus, RetrieveQuery, RetrievedEntry,
    StoreRequest,
};
pub use error::{ArborError, Result};
pub use memory::{Category, Entry, EntryPatch, ScoreEngine, Tier};
