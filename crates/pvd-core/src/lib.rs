//! The partial-read receiver and the small shared utilities both
//! aggregate kinds build on: the fatal-handler slot and the named
//! handler-registration slot.

pub mod config;
pub mod fatal;
pub mod handlers;
pub mod receiver;

#[cfg(feature = "serde")]
pub use config::{load, save};
pub use config::RingSizes;
pub use fatal::{FatalCause, FatalHandler, FatalSlot};
pub use handlers::HandlerSlot;
pub use receiver::{PartialReadReceiver, PumpOutcome};
