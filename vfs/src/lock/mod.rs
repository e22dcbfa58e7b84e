//! File locking.
//!
//! [`service`] is the host-side primitive: named locks with shared or
//! exclusive scope, a non-blocking try-acquire, and release on guard drop.
//! Its scope is the group of connections sharing one [`service::LockService`]
//! instance (one browsing context group, in host terms).
//!
//! [`manager`] implements the engine's 5-state escalation protocol
//! (NONE → SHARED → RESERVED → PENDING → EXCLUSIVE) on top of it.

pub mod manager;
pub mod service;

pub use manager::{LockLevel, LockManager};
pub use service::{LockGrant, LockMode, LockRequest, LockService};
