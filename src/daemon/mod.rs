//! Service runtime: the composition root, the periodic check loop, and
//! signal handling.

#[cfg(feature = "daemon")]
pub mod loop_main;
pub mod service;
#[cfg(feature = "daemon")]
pub mod signals;
