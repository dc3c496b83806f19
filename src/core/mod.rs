//! Core types: errors, configuration, clocks and day keys.

pub mod clock;
pub mod config;
pub mod errors;
