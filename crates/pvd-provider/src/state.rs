//! Per-display provider-side lifecycle.

/// Where one host display key stands in the provider's view of the world.
///
/// ```text
///              advertise_displays
/// Unadvertised ────────────────▶ Advertised
///                                    │  ADD_DISPLAY received
///                                    ▼
///                                 Creating ──create_display──▶ Connected
///                                                     │                │
///                                          fatal error│                │ destroy
///                                                     ▼                ▼
///                                                   Dead ◀──── TearingDown
/// ```
///
/// `REMOVE_DISPLAY` from the consumer and a local [`crate::Provider::destroy_display`]
/// both drive a `Connected` display through `TearingDown` to `Dead`.
/// `reconnect` is a `Connected` → `Connected` self-transition and does not
/// appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    /// Known only from a `HOST_DISPLAY_LIST` entry; not yet advertised.
    Unadvertised,
    /// Included in the provider's last `ADVERTISED_DISPLAY_LIST`.
    Advertised,
    /// An `ADD_DISPLAY` request is being processed; channels are opening.
    Creating,
    /// All channels are open and the aggregate is live.
    Connected,
    /// `destroy_display` has been called; channels are being torn down.
    TearingDown,
    /// Torn down, either by a completed teardown or a fatal error.
    Dead,
}
