//! Guest-side half of the Display Handler protocol: the per-display
//! channel aggregate and the `Provider` handshake object.

pub mod aggregate;
pub mod provider;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use aggregate::{DisplayAggregate, CURSOR_IMAGE_BYTES, CURSOR_MAX_DIM, CURSOR_STRIDE};
pub use provider::{DisplayGeometry, Provider, DEFAULT_PAGE_SIZE};
pub use state::DisplayState;
