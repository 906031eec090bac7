pub mod checkpoint;
pub mod cleaner;
pub mod coordinator;
pub mod error_log;
pub mod fetcher;
pub mod schemes;
pub mod writer;
