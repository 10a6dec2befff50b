pub mod analyzers;
pub mod attributes;
pub mod config;
pub mod coverage;
pub mod error;
pub mod ingest;
pub mod output;
pub mod period;
