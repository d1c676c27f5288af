//! PEERWAGER — peer-to-peer draw wagering engine
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod clock;
pub mod config;
pub mod engine;
pub mod storage;
pub mod transfer;
pub mod types;
