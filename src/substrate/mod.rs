//! Resource primitives: cloud tasks, local processes, and ports.

pub mod cloud;
pub mod ports;
pub mod process;
