//! Protocol implementations.

pub mod cmsis_dap;
pub mod daplink;

// Re-export common types
pub use cmsis_dap::{CmsisDap, DapCommand};
