pub mod cli;
pub mod confidence;
pub mod config;
pub mod db;
pub mod drift;
pub mod error;
pub mod indexer;
pub mod logging;
pub mod model;
pub mod retry;
pub mod sampler;
pub mod util;
