//! Domain model module declarations.

pub mod cloud_task;
pub mod session;
pub mod workspace;
