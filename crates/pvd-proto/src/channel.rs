//! The inter-VM communication transport contract, as Rust traits.
//!
//! These traits describe the shape of an external collaborator — a real
//! inter-VM communication transport is assumed to exist and to honor this
//! contract; this crate only describes it so the protocol core can be
//! written once against an interface rather than hard-coded to one
//! transport implementation.

use std::sync::Arc;

use crate::error::{Error, Result};

/// A shared-memory region jointly owned by both endpoints of a channel,
/// valid from accept/connect until disconnect.
///
/// Modeled as a locked byte buffer rather than a raw pointer: the provider
/// writes pixel data into it, the consumer only ever reads it, and
/// nothing in this library synchronizes those writes against reads —
/// that is left to the application's own
/// `SET_DISPLAY`/`UPDATE_CURSOR`/`invalidate_region` publications.
pub type MemoryView = Arc<std::sync::Mutex<Vec<u8>>>;

/// Callback invoked when a channel has readable data buffered.
pub type DataCallback = Arc<dyn Fn() + Send + Sync>;
/// Callback invoked when a channel's remote end disconnects.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;
/// Callback invoked by a listening server when it accepts a new connection.
pub type AcceptCallback = Arc<dyn Fn(Arc<dyn Channel>) + Send + Sync>;

/// A single IVC byte-stream connection, with an optional shared-memory view.
///
/// `recv` either fills `buf` completely and returns `Ok(())`, or — if fewer
/// bytes than `buf.len()` are currently buffered — consumes nothing and
/// returns `Err(Error::TryAgain)` and consumes nothing, leaving the caller
/// free to retry once more bytes have arrived. `send` is atomic: it either
/// writes the whole buffer or fails without a partial write.
pub trait Channel: Send + Sync {
    /// Attempt to fill `buf` completely from the receive buffer.
    fn recv(&self, buf: &mut [u8]) -> Result<()>;

    /// Bytes currently buffered and available to [`Channel::recv`].
    fn available_data(&self) -> Result<usize>;

    /// Bytes of free space currently available to [`Channel::send`].
    fn available_space(&self) -> Result<usize>;

    /// Write `buf` to the channel atomically.
    fn send(&self, buf: &[u8]) -> Result<()>;

    /// Notify the remote end that new data is available. The protocol
    /// calls this twice per logical send — callers of `send` are
    /// responsible for that, not this trait method itself.
    fn notify_remote(&self);

    /// The channel's shared-memory view, if this channel carries one
    /// (framebuffer and cursor-image channels only).
    fn memory(&self) -> Option<MemoryView> {
        None
    }

    /// Register the data-available and disconnect callbacks.
    fn register_event_callbacks(&self, on_data: DataCallback, on_disconnect: DisconnectCallback);

    /// Enable delivery of the registered callbacks.
    fn enable_events(&self);

    /// Disable delivery of the registered callbacks (but do not clear them).
    fn disable_events(&self);

    /// Re-establish this channel against a new remote domain/port, keeping
    /// its identity.
    fn reconnect(&self, remote_domain: u16, port: u32) -> Result<()>;

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;

    /// Tear the channel down. Idempotent.
    fn disconnect(&self);
}

/// A listening server bound to one `(remote_domain, port)` tuple, handed
/// incoming connections to its accept callback.
///
/// May be shared across several display backends for the same tuple;
/// `Arc<dyn ListeningServer>` is the handle type for exactly that reason.
pub trait ListeningServer: Send + Sync {
    /// The port this server is bound to.
    fn port(&self) -> u32;

    /// The remote domain this server accepts connections from.
    fn remote_domain(&self) -> u16;

    /// Tear the server down. Idempotent.
    fn shutdown(&self);
}

/// The IVC transport itself: the factory for channels and listening servers.
pub trait Transport: Send + Sync {
    /// Open an outgoing connection to `remote_domain:port`.
    fn connect(
        &self,
        remote_domain: u16,
        port: u32,
        ring_pages: u32,
        conn_id: Option<u64>,
    ) -> Result<Arc<dyn Channel>>;

    /// Start (or return an existing) listening server for `remote_domain:port`.
    ///
    /// Implementations should perform this reuse lookup themselves if two
    /// callers race for the same tuple; [`Transport::find_listening_server`]
    /// is exposed so the consumer-side backend can check first and avoid
    /// creating a duplicate.
    fn listen(
        &self,
        port: u32,
        remote_domain: u16,
        on_accept: AcceptCallback,
    ) -> Result<Arc<dyn ListeningServer>>;

    /// Look up an already-running listening server for this tuple, if any.
    fn find_listening_server(
        &self,
        remote_domain: u16,
        port: u32,
    ) -> Option<Arc<dyn ListeningServer>>;
}

/// Returns [`Error::TryAgain`] mapped from a too-short receive, used by
/// mock/test transports implementing [`Channel::recv`].
#[must_use]
pub fn short_read_error() -> Error {
    Error::TryAgain
}
