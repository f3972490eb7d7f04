pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod fixity;
pub mod identity;
pub mod indexer;
pub mod merge;
pub mod output;
pub mod reconcile;
pub mod record;
pub mod storage;
pub mod store;
