//! Application layer containing the billing session orchestration.
//!
//! `BillingSession` owns the connection lifecycle to the Billing Service and
//! routes asynchronous results back into its purchase cache. Shared state
//! lives behind an `Arc` so spawned operations can complete after the caller
//! has moved on.

pub mod config;
pub mod session;
