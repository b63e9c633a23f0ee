//! In-process mock transport and scenario harness for the paravirtualized
//! display handler protocol, used by [`main`] and by this crate's
//! integration tests to drive a [`pvd_provider::Provider`] and a
//! [`pvd_consumer::Consumer`] against each other without a real
//! inter-VM communication backend.

pub mod scenario;
pub mod transport;

pub use scenario::{Harness, CONTROL_PORT, REMOTE_DOMAIN};
pub use transport::MockTransport;
