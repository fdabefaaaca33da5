//! Durable metadata: friends, sessions, audit log, rate-limit counters.

pub mod db;
pub mod models;

pub use db::{DbHandle, Store};
pub use models::{AuditEntry, Direction, Friend, Permission, RateLimitDecision, Session};
