//! Backup and restore agent for a containerised platform deployment
//!
//! The pipelines in [`core`] dump the application data and both databases
//! into one session archive, ship it to S3-compatible storage and bring it
//! back again. [`utils`] holds configuration and path helpers.

pub mod core;
pub mod utils;
