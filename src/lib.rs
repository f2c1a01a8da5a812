pub mod api;
pub mod classify;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod extract;
pub mod llm;
pub mod migration;
pub mod persistence;
pub mod pipeline;
pub mod sync;
pub mod test_utils;
pub mod types;
pub mod warehouse;
