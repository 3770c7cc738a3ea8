//! Library crate for net-scan-rs exposing reusable modules.
pub mod probe;
pub mod report;
pub mod scanner;
pub mod services;
pub mod types;
