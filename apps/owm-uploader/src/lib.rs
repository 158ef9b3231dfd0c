pub mod config;
pub mod error;
pub mod http;
pub mod mapping;
pub mod protocol;
pub mod queue;
pub mod rain;
pub mod record;
pub mod service;
pub mod units;
pub mod worker;
