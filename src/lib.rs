//! Turnstile - In-Memory Sliding Window Rate Limiting
//!
//! This crate caps how many requests a single client may make within a
//! trailing time window. Per-client state lives in a sharded in-memory
//! registry, idle clients are evicted in the background, and an axum
//! middleware applies the limiter to HTTP services.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
