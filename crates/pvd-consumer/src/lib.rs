//! Host-side half of the Display Handler protocol: the per-display
//! backend aggregate and the `Consumer` listening object.

pub mod backend;
pub mod consumer;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::DisplayBackend;
pub use consumer::{Consumer, ConnectionId};
