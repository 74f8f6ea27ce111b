pub mod config;
pub mod error;
pub mod redis;
pub mod types;
