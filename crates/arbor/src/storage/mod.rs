//! The three storage tiers and their shared file helpers

pub mod archive;
pub mod buffer;
pub mod categorized;
pub mod disk;

pub use archive::{Archive, ArchiveHandle, ArchiveOptions};
pub use buffer::{Buffer, BufferPolicy, PutOutcome};
pub use categorized::{
    CategorizedStore, CategoryPolicy, EntryPredicate, PromoteOutcome, StoreOptions, StoreOutcome,
    StoreQuery,
};
