//! Pipeline stages for one conversion request.
//!
//! Each submodule is one stage with one job, driven in order by
//! [`crate::orchestrator::FallbackOrchestrator`].
//!
//! ## Data Flow
//!
//! ```text
//! security ──▶ router ──▶ backup ──▶ ┌─ executor ──▶ validate ─┐ ──▶ commit
//! (gate)       (chain)    (snapshot) └──────── next method ◀───┘     or restore
//! ```
//!
//! 1. [`security`]: size, extension and content-signature checks on input
//! 2. [`router`]: ordered candidate methods for the format pair
//! 3. [`backup`]: snapshot of an existing destination
//! 4. [`executor`]: one method, one scratch directory, one time bound
//! 5. [`validate`]: decide whether the artifact is real
//!
//! [`signature`] is shared by the gate and the validator.

pub mod backup;
pub mod executor;
pub mod router;
pub mod security;
pub mod signature;
pub mod validate;
