pub mod config;
pub mod domain;
pub mod error;
pub mod forecast;
pub mod messaging;
pub mod pipeline;
pub mod scheduler;
pub mod storage;
