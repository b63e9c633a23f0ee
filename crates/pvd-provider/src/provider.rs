//! The provider-side top-level object: one outgoing control channel,
//! the handler registry the driver populates, and the bookkeeping
//! that turns `ADD_DISPLAY`/`REMOVE_DISPLAY` traffic into [`DisplayAggregate`]
//! lifecycles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use pvd_core::{FatalCause, FatalHandler, FatalSlot, HandlerSlot, PartialReadReceiver, RingSizes};
use pvd_proto::types::{
    capability, AddDisplayRequest, DisplayInfo, DisplayKey, DisplayList, DriverCapabilities,
    PacketType, TextMode,
};
use pvd_proto::{Channel, Error, Result, Transport};

use crate::aggregate::{send_packet, DisplayAggregate};
use crate::state::DisplayState;

/// Default IVC page size assumed when the embedder hasn't said otherwise.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Geometry and optional initial pixel data the driver supplies in response
/// to an `add_display` handler invocation.
#[derive(Debug, Clone)]
pub struct DisplayGeometry {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Framebuffer stride in bytes.
    pub stride: u32,
    /// Bytes to seed the framebuffer with before the first `SET_DISPLAY`.
    pub initial_contents: Option<Vec<u8>>,
}

type HostDisplayChangeHandler = dyn Fn(&[DisplayInfo]) + Send + Sync;
type AddDisplayHandler = dyn Fn(u32) -> Option<DisplayGeometry> + Send + Sync;
type RemoveDisplayHandler = dyn Fn(u32) + Send + Sync;

#[derive(Default)]
struct Handlers {
    host_display_change: HandlerSlot<HostDisplayChangeHandler>,
    add_display: HandlerSlot<AddDisplayHandler>,
    remove_display: HandlerSlot<RemoveDisplayHandler>,
}

struct DisplayEntry {
    info: DisplayInfo,
    state: DisplayState,
    aggregate: Option<Arc<DisplayAggregate>>,
}

/// The provider's outgoing control connection, handler registry, and the
/// per-display bookkeeping driven by it.
pub struct Provider {
    control: Arc<dyn Channel>,
    transport: Arc<dyn Transport>,
    receiver: PartialReadReceiver,
    rx_domain: u16,
    conn_id: Option<u64>,
    ring_sizes: RingSizes,
    page_size: u32,
    capabilities: Mutex<u32>,
    handlers: Handlers,
    fatal: FatalSlot,
    displays: Mutex<HashMap<u32, DisplayEntry>>,
    self_weak: Weak<Provider>,
}

impl Provider {
    /// Connect the control channel to `rx_domain:control_port` and wire its
    /// receive callbacks.
    pub fn new(
        transport: Arc<dyn Transport>,
        rx_domain: u16,
        control_port: u32,
        conn_id: Option<u64>,
        ring_sizes: RingSizes,
    ) -> Result<Arc<Self>> {
        Self::with_page_size(transport, rx_domain, control_port, conn_id, ring_sizes, DEFAULT_PAGE_SIZE)
    }

    /// Like [`Provider::new`], but with an explicit IVC page size instead
    /// of [`DEFAULT_PAGE_SIZE`]; used to size the framebuffer and cursor
    /// channels' ring buffers.
    pub fn with_page_size(
        transport: Arc<dyn Transport>,
        rx_domain: u16,
        control_port: u32,
        conn_id: Option<u64>,
        ring_sizes: RingSizes,
        page_size: u32,
    ) -> Result<Arc<Self>> {
        let control = transport.connect(rx_domain, control_port, ring_sizes.control_pages, conn_id)?;

        let provider = Arc::new_cyclic(|weak: &Weak<Provider>| {
            let on_data_weak = weak.clone();
            let on_disconnect_weak = weak.clone();
            control.register_event_callbacks(
                Arc::new(move || {
                    if let Some(provider) = on_data_weak.upgrade() {
                        provider.pump();
                    }
                }),
                Arc::new(move || {
                    if let Some(provider) = on_disconnect_weak.upgrade() {
                        provider.fatal.fire(FatalCause::Disconnected { channel: "control" });
                    }
                }),
            );

            Provider {
                control,
                transport,
                receiver: PartialReadReceiver::new(),
                rx_domain,
                conn_id,
                ring_sizes,
                page_size,
                capabilities: Mutex::new(0),
                handlers: Handlers::default(),
                fatal: FatalSlot::new(),
                displays: Mutex::new(HashMap::new()),
                self_weak: weak.clone(),
            }
        });
        provider.control.enable_events();
        Ok(provider)
    }

    fn lock_displays(&self) -> std::sync::MutexGuard<'_, HashMap<u32, DisplayEntry>> {
        self.displays.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("provider display table mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn set_capability(&self, bit: u32) {
        let mut caps = self.capabilities.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("provider capability mutex was poisoned, recovering");
            poisoned.into_inner()
        });
        *caps |= bit;
    }

    fn capabilities(&self) -> u32 {
        *self.capabilities.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("provider capability mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Register the host-resize handler. Sets [`capability::RESIZE`].
    pub fn on_host_display_change(&self, handler: Arc<HostDisplayChangeHandler>) {
        self.handlers.host_display_change.register(handler);
        self.set_capability(capability::RESIZE);
    }

    /// Register the add-display handler. Sets [`capability::HOTPLUG`].
    pub fn on_add_display(&self, handler: Arc<AddDisplayHandler>) {
        self.handlers.add_display.register(handler);
        self.set_capability(capability::HOTPLUG);
    }

    /// Register the remove-display handler. Sets [`capability::HOTPLUG`].
    pub fn on_remove_display(&self, handler: Arc<RemoveDisplayHandler>) {
        self.handlers.remove_display.register(handler);
        self.set_capability(capability::HOTPLUG);
    }

    /// Register the provider-level fatal handler, for failures of the
    /// control channel itself (as opposed to a single display's aggregate).
    pub fn on_fatal(&self, handler: FatalHandler) {
        self.fatal.register(handler);
    }

    /// Send `DRIVER_CAPABILITIES` with the bits set by handler registration
    /// so far.
    pub fn advertise_capabilities(&self, max_displays: u32, version: u32) -> Result<()> {
        let payload = DriverCapabilities {
            max_displays,
            version,
            capabilities: self.capabilities(),
            reserved: 0,
        }
        .encode();
        send_packet(
            self.control.as_ref(),
            PacketType::DriverCapabilities as u32,
            &payload,
        )
    }

    /// Send `ADVERTISED_DISPLAY_LIST`, recording each entry as
    /// [`DisplayState::Advertised`] if it wasn't already further along.
    pub fn advertise_displays(&self, displays: &[DisplayInfo]) -> Result<()> {
        {
            let mut table = self.lock_displays();
            for d in displays {
                let entry = table.entry(d.key).or_insert_with(|| DisplayEntry {
                    info: *d,
                    state: DisplayState::Unadvertised,
                    aggregate: None,
                });
                entry.info = *d;
                if entry.state == DisplayState::Unadvertised {
                    entry.state = DisplayState::Advertised;
                }
            }
        }
        let payload = DisplayList {
            displays: displays.to_vec(),
        }
        .encode();
        send_packet(
            self.control.as_ref(),
            PacketType::AdvertisedDisplayList as u32,
            &payload,
        )
    }

    /// Send `TEXT_MODE` from provider to consumer.
    pub fn publish_text_mode(&self, force: bool) -> Result<()> {
        let payload = TextMode { force }.encode();
        send_packet(self.control.as_ref(), PacketType::TextMode as u32, &payload)
    }

    /// The display's current lifecycle state, if known.
    #[must_use]
    pub fn display_state(&self, key: u32) -> Option<DisplayState> {
        self.lock_displays().get(&key).map(|e| e.state)
    }

    /// The display's aggregate, once [`Provider::create_display`] has run,
    /// for driving ongoing per-display operations (`invalidate_region`,
    /// `move_cursor`, `blank_display`, ...) that have no control-channel
    /// counterpart and so aren't reachable through `Provider` itself
    /// (symmetric to [`pvd_consumer::Consumer::backend`] on the other side).
    #[must_use]
    pub fn aggregate(&self, key: u32) -> Option<Arc<DisplayAggregate>> {
        self.lock_displays().get(&key).and_then(|e| e.aggregate.clone())
    }

    fn pump(&self) {
        self.receiver.on_data_available(
            self.control.as_ref(),
            |header, payload| self.dispatch(header.pkt_type, payload),
            |cause| {
                self.fatal.fire(cause);
            },
        );
    }

    fn dispatch(&self, pkt_type: u32, payload: Vec<u8>) {
        match PacketType::try_from(pkt_type) {
            Ok(PacketType::HostDisplayList) => self.handle_host_display_list(&payload),
            Ok(PacketType::AddDisplay) => self.handle_add_display(&payload),
            Ok(PacketType::RemoveDisplay) => self.handle_remove_display(&payload),
            Ok(other) => {
                tracing::debug!(?other, "ignoring packet type not handled by the provider");
            }
            Err(e) => tracing::warn!(error = %e, "ignoring unrecognized control packet"),
        }
    }

    fn handle_host_display_list(&self, payload: &[u8]) {
        let list = match DisplayList::decode(payload) {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(error = %e, "malformed HOST_DISPLAY_LIST, ignoring");
                return;
            }
        };
        {
            let mut table = self.lock_displays();
            for d in &list.displays {
                table
                    .entry(d.key)
                    .or_insert_with(|| DisplayEntry {
                        info: *d,
                        state: DisplayState::Unadvertised,
                        aggregate: None,
                    })
                    .info = *d;
            }
        }
        if let Some(handler) = self.handlers.host_display_change.get() {
            handler(&list.displays);
        }
    }

    fn handle_add_display(&self, payload: &[u8]) {
        let request = match AddDisplayRequest::decode(payload) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "malformed ADD_DISPLAY, ignoring");
                return;
            }
        };
        if let Err(e) = self.create_display(&request) {
            tracing::warn!(key = request.key, error = %e, "failed to create display");
        }
    }

    fn handle_remove_display(&self, payload: &[u8]) {
        let key = match DisplayKey::decode(payload) {
            Ok(k) => k.key,
            Err(e) => {
                tracing::warn!(error = %e, "malformed REMOVE_DISPLAY, ignoring");
                return;
            }
        };
        if let Err(e) = self.destroy_display(key) {
            tracing::warn!(key, error = %e, "failed to destroy display on REMOVE_DISPLAY");
        }
        if let Some(handler) = self.handlers.remove_display.get() {
            handler(key);
        }
    }

    /// Create the four channels for `request.key` and assemble its
    /// aggregate.
    ///
    /// Asks the registered `add_display` handler for geometry; if no
    /// handler is registered or it declines (`None`), the request is
    /// logged and otherwise ignored, leaving the display `Advertised`.
    pub fn create_display(&self, request: &AddDisplayRequest) -> Result<()> {
        if !request.has_required_ports() {
            return Err(Error::InvalidArgument(
                "ADD_DISPLAY missing required event_port/framebuffer_port".into(),
            ));
        }

        let Some(geometry) = self
            .handlers
            .add_display
            .get()
            .and_then(|handler| handler(request.key))
        else {
            tracing::info!(key = request.key, "driver declined ADD_DISPLAY");
            return Ok(());
        };

        {
            let mut table = self.lock_displays();
            let entry = table.entry(request.key).or_insert_with(|| DisplayEntry {
                info: DisplayInfo {
                    key: request.key,
                    x: 0,
                    y: 0,
                    w: geometry.width,
                    h: geometry.height,
                },
                state: DisplayState::Advertised,
                aggregate: None,
            });
            entry.state = DisplayState::Creating;
        }

        let framebuffer_pages =
            RingSizes::framebuffer_pages(geometry.stride, geometry.height, self.page_size);
        let framebuffer = self.transport.connect(
            self.rx_domain,
            request.framebuffer_port,
            framebuffer_pages,
            self.conn_id,
        )?;
        let event = self.transport.connect(
            self.rx_domain,
            request.event_port,
            self.ring_sizes.event_pages,
            self.conn_id,
        )?;

        let dirty_rect = if request.dirty_rectangles_port != 0 {
            match self.transport.connect(
                self.rx_domain,
                request.dirty_rectangles_port,
                self.ring_sizes.dirty_rect_pages,
                self.conn_id,
            ) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(key = request.key, error = %e, "dirty-rect channel failed to open, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        let cursor = if request.cursor_bitmap_port != 0 {
            match self.transport.connect(
                self.rx_domain,
                request.cursor_bitmap_port,
                RingSizes::cursor_pages(self.page_size),
                self.conn_id,
            ) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(key = request.key, error = %e, "cursor channel failed to open, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        let aggregate = DisplayAggregate::new(
            request.key,
            event,
            framebuffer,
            dirty_rect,
            cursor,
            geometry.width,
            geometry.height,
            geometry.stride,
        )?;

        if let Some(contents) = &geometry.initial_contents {
            aggregate.write_framebuffer(contents)?;
        }

        let weak = self.self_weak.clone();
        let key = request.key;
        aggregate.on_fatal(Arc::new(move |cause| {
            if let Some(provider) = weak.upgrade() {
                provider.mark_display_dead(key, cause);
            }
        }));

        // SET_DISPLAY goes out on the event channel right after the
        // channels connect.
        aggregate.change_resolution(geometry.width, geometry.height, geometry.stride)?;

        {
            let mut table = self.lock_displays();
            let entry = table.entry(request.key).or_insert_with(|| DisplayEntry {
                info: DisplayInfo {
                    key: request.key,
                    x: 0,
                    y: 0,
                    w: geometry.width,
                    h: geometry.height,
                },
                state: DisplayState::Creating,
                aggregate: None,
            });
            entry.aggregate = Some(aggregate);
            entry.state = DisplayState::Connected;
        }
        tracing::info!(key = request.key, "display connected");
        Ok(())
    }

    fn mark_display_dead(&self, key: u32, cause: FatalCause) {
        let mut table = self.lock_displays();
        if let Some(entry) = table.get_mut(&key) {
            entry.state = DisplayState::Dead;
            entry.aggregate = None;
        }
        drop(table);
        tracing::warn!(key, %cause, "display aggregate failed fatally");
    }

    /// Send `DISPLAY_NO_LONGER_AVAILABLE` and tear the display's aggregate
    /// down.
    pub fn destroy_display(&self, key: u32) -> Result<()> {
        let aggregate = {
            let mut table = self.lock_displays();
            let Some(entry) = table.get_mut(&key) else {
                return Err(Error::InvalidArgument(format!("unknown display {key}")));
            };
            entry.state = DisplayState::TearingDown;
            entry.aggregate.clone()
        };

        let payload = DisplayKey { key }.encode();
        send_packet(
            self.control.as_ref(),
            PacketType::DisplayNoLongerAvailable as u32,
            &payload,
        )?;

        if let Some(aggregate) = aggregate {
            aggregate.destroy();
        }

        let mut table = self.lock_displays();
        if let Some(entry) = table.get_mut(&key) {
            entry.state = DisplayState::Dead;
            entry.aggregate = None;
        }
        drop(table);
        tracing::info!(key, "display destroyed");
        Ok(())
    }
}
