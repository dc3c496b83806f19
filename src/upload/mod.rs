//! Upload path: endpoint resolution, HTTP transport, delivery with retry, and
//! the scheduler that decides when a batch is cut.

pub mod scheduler;
pub mod target;
pub mod transport;
pub mod worker;
