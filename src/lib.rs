//! Turnstile - HTTP request admission gate
//!
//! This crate decides, per request, whether to forward it to the application
//! or reject it with a rate limit error. Quotas are tracked per identity (a
//! trusted API key or the client IP) in a shared Redis store, so several gate
//! instances enforce one limit together.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
