pub mod config;
pub mod error;
pub mod measurement;
pub mod mqtt;
pub mod pipeline;
pub mod stats;
pub mod storage;
pub mod topology;
