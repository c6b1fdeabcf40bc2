//! Session orchestration modules.
//!
//! Covers admission, resource start/stop, idle eviction, orphan
//! reclamation, workspace cleanup, and background scheduling.

pub mod cleanup;
pub mod launcher;
pub mod lifecycle;
pub mod pool;
pub mod reclaimer;
pub mod scheduler;
pub mod sweeper;
pub mod workspace_locks;
