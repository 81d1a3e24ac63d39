pub mod cache;
pub mod channel;
pub mod clock;
pub mod config;
pub mod db;
pub mod errors;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod publisher;
pub mod rest;
pub mod store;
pub mod validate;
pub mod worker;

pub use errors::{Error, Result};
