//! Command handlers

pub mod config;
pub mod conflicts;
pub mod queue;
pub mod record;
pub mod status;
pub mod sync;
