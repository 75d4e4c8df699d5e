pub mod config;
pub mod consolidate;
pub mod delete;
pub mod flush;
pub mod get;
pub mod search;
pub mod status;
pub mod store;

pub use config::ConfigCommand;
pub use consolidate::ConsolidateCommand;
pub use delete::DeleteCommand;
pub use flush::FlushCommand;
pub use get::GetCommand;
pub use search::SearchCommand;
pub use status::StatusCommand;
pub use store::StoreCommand;
