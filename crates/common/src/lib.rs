//! Shared configuration, connection setup, error and domain types for Courier.

pub mod config;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod types;
