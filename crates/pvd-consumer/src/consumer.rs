//! The consumer-side top-level object: a listening control server,
//! the handler registry the host application populates, and the
//! bookkeeping that turns accepted control
//! connections and `ADVERTISED_DISPLAY_LIST`/`DISPLAY_NO_LONGER_AVAILABLE`
//! traffic into [`DisplayBackend`] lifecycles.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use pvd_core::{FatalCause, FatalSlot, HandlerSlot, PartialReadReceiver};
use pvd_proto::channel::AcceptCallback;
use pvd_proto::types::{AddDisplayRequest, DisplayInfo, DisplayKey, DisplayList, DriverCapabilities, PacketType, TextMode};
use pvd_proto::{Channel, Error, ListeningServer, Result, Transport};

use crate::backend::DisplayBackend;

/// Opaque handle to one accepted control connection, handed to every
/// per-connection handler callback so a multi-peer consumer can tell
/// its connections apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

type NewControlConnectionHandler = dyn Fn(ConnectionId) + Send + Sync;
type DriverCapabilitiesHandler = dyn Fn(ConnectionId, DriverCapabilities) + Send + Sync;
type AdvertisedListHandler = dyn Fn(ConnectionId, &[DisplayInfo]) -> Vec<AddDisplayRequest> + Send + Sync;
type DisplayNoLongerAvailableHandler = dyn Fn(ConnectionId, u32) + Send + Sync;
type TextModeHandler = dyn Fn(ConnectionId, bool) + Send + Sync;

#[derive(Default)]
struct Handlers {
    new_control_connection: HandlerSlot<NewControlConnectionHandler>,
    driver_capabilities: HandlerSlot<DriverCapabilitiesHandler>,
    advertised_list: HandlerSlot<AdvertisedListHandler>,
    display_no_longer_available: HandlerSlot<DisplayNoLongerAvailableHandler>,
    text_mode: HandlerSlot<TextModeHandler>,
}

struct ControlConnection {
    channel: Arc<dyn Channel>,
    remote_domain: u16,
    receiver: PartialReadReceiver,
    fatal: FatalSlot,
}

/// Which of the four per-display channels an accepted connection on a
/// shared listening server belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelKind {
    Event,
    Framebuffer,
    DirtyRect,
    Cursor,
}

struct PendingAccept {
    kind: ChannelKind,
    backend: Weak<DisplayBackend>,
}

fn send_packet(channel: &dyn Channel, pkt_type: u32, payload: &[u8]) -> Result<()> {
    let bytes = pvd_proto::wire::encode(pkt_type, payload)?;
    let free = channel.available_space()?;
    if free < bytes.len() {
        return Err(Error::NoSpace);
    }
    if !channel.is_open() {
        return Err(Error::Closed);
    }
    channel.send(&bytes)?;
    // Two notifications per logical send, preserved bitwise.
    channel.notify_remote();
    channel.notify_remote();
    Ok(())
}

/// The consumer's listening control server, handler registry, and the
/// per-display backend bookkeeping driven by it.
pub struct Consumer {
    transport: Arc<dyn Transport>,
    control_server: Arc<dyn ListeningServer>,
    pending_control: Mutex<HashMap<u64, Arc<dyn Channel>>>,
    connections: Mutex<HashMap<u64, Arc<ControlConnection>>>,
    backends: Mutex<HashMap<u32, Arc<DisplayBackend>>>,
    accept_routers: Mutex<HashMap<(u16, u32), VecDeque<PendingAccept>>>,
    next_id: AtomicU64,
    handlers: Handlers,
    self_weak: Weak<Consumer>,
}

impl Consumer {
    /// Start listening on `control_port` for connections from
    /// `remote_domain`.
    pub fn new(transport: Arc<dyn Transport>, control_port: u32, remote_domain: u16) -> Result<Arc<Self>> {
        // `listen` needs the accept callback up front, before this `Consumer`
        // exists to be weakly referenced. `router` bridges the gap: the
        // callback upgrades through it, and the `Arc::new_cyclic` closure
        // below fills it in with the real weak handle before construction
        // finishes (and before any accept can possibly fire).
        let router: Arc<Mutex<Weak<Consumer>>> = Arc::new(Mutex::new(Weak::new()));
        let accept_router = router.clone();
        let control_server = transport.listen(
            control_port,
            remote_domain,
            Arc::new(move |channel: Arc<dyn Channel>| {
                let consumer = accept_router
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .upgrade();
                if let Some(consumer) = consumer {
                    consumer.accept_control_connection(channel);
                }
            }),
        )?;

        let consumer = Arc::new_cyclic(|weak: &Weak<Consumer>| {
            *router.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = weak.clone();
            Consumer {
                transport,
                control_server,
                pending_control: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                backends: Mutex::new(HashMap::new()),
                accept_routers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                handlers: Handlers::default(),
                self_weak: weak.clone(),
            }
        });
        Ok(consumer)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<dyn Channel>>> {
        self.pending_control.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("consumer pending-control mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<ControlConnection>>> {
        self.connections.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("consumer connections mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lock_backends(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Arc<DisplayBackend>>> {
        self.backends.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("consumer backends mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn accept_control_connection(self: &Arc<Self>, channel: Arc<dyn Channel>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock_pending().insert(id, channel);
        if let Some(handler) = self.handlers.new_control_connection.get() {
            handler(ConnectionId(id));
        } else {
            tracing::warn!(id, "accepted control connection but no new_control_connection handler is registered");
        }
    }

    /// Register the handler invoked when a control connection is
    /// accepted but not yet receiving; the owner must call
    /// [`Consumer::finish_control_connection`] from within or after it.
    pub fn on_new_control_connection(&self, handler: Arc<NewControlConnectionHandler>) {
        self.handlers.new_control_connection.register(handler);
    }

    /// Register the `DRIVER_CAPABILITIES` handler.
    pub fn on_driver_capabilities(&self, handler: Arc<DriverCapabilitiesHandler>) {
        self.handlers.driver_capabilities.register(handler);
    }

    /// Register the `ADVERTISED_DISPLAY_LIST` handler; its return value
    /// is the set of `ADD_DISPLAY` requests the consumer will send back.
    pub fn on_advertised_list(&self, handler: Arc<AdvertisedListHandler>) {
        self.handlers.advertised_list.register(handler);
    }

    /// Register the `DISPLAY_NO_LONGER_AVAILABLE` handler.
    pub fn on_display_no_longer_available(&self, handler: Arc<DisplayNoLongerAvailableHandler>) {
        self.handlers.display_no_longer_available.register(handler);
    }

    /// Register the `TEXT_MODE` handler.
    pub fn on_text_mode(&self, handler: Arc<TextModeHandler>) {
        self.handlers.text_mode.register(handler);
    }

    /// Install receive callbacks on a pending control connection and
    /// begin dispatching its packets.
    pub fn finish_control_connection(self: &Arc<Self>, id: ConnectionId, remote_domain: u16) -> Result<()> {
        let channel = self
            .lock_pending()
            .remove(&id.0)
            .ok_or_else(|| Error::InvalidArgument(format!("no pending control connection {}", id.0)))?;

        let conn = Arc::new(ControlConnection {
            channel: channel.clone(),
            remote_domain,
            receiver: PartialReadReceiver::new(),
            fatal: FatalSlot::new(),
        });
        self.lock_connections().insert(id.0, conn);

        let weak = self.self_weak.clone();
        let on_data_weak = weak.clone();
        let on_disconnect_weak = weak;
        channel.register_event_callbacks(
            Arc::new(move || {
                if let Some(consumer) = on_data_weak.upgrade() {
                    consumer.pump_control_connection(id);
                }
            }),
            Arc::new(move || {
                if let Some(consumer) = on_disconnect_weak.upgrade() {
                    consumer.fire_control_fatal(id, FatalCause::Disconnected { channel: "control" });
                }
            }),
        );
        channel.enable_events();
        Ok(())
    }

    /// Register the one fatal handler for a specific control connection.
    pub fn on_control_fatal(&self, id: ConnectionId, handler: pvd_core::FatalHandler) -> Result<()> {
        let conn = self
            .lock_connections()
            .get(&id.0)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown control connection {}", id.0)))?;
        conn.fatal.register(handler);
        Ok(())
    }

    fn fire_control_fatal(&self, id: ConnectionId, cause: FatalCause) {
        if let Some(conn) = self.lock_connections().get(&id.0).cloned() {
            conn.fatal.fire(cause);
        }
    }

    fn pump_control_connection(&self, id: ConnectionId) {
        let conn = match self.lock_connections().get(&id.0).cloned() {
            Some(c) => c,
            None => return,
        };
        conn.receiver.on_data_available(
            conn.channel.as_ref(),
            |header, payload| self.dispatch_control(id, &conn, header.pkt_type, &payload),
            |cause| conn.fatal.fire(cause),
        );
    }

    fn dispatch_control(&self, id: ConnectionId, conn: &ControlConnection, pkt_type: u32, payload: &[u8]) {
        match PacketType::try_from(pkt_type) {
            Ok(PacketType::DriverCapabilities) => match DriverCapabilities::decode(payload) {
                Ok(caps) => {
                    if let Some(h) = self.handlers.driver_capabilities.get() {
                        h(id, caps);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "malformed DRIVER_CAPABILITIES, ignoring"),
            },
            Ok(PacketType::AdvertisedDisplayList) => match DisplayList::decode(payload) {
                Ok(list) => self.handle_advertised_list(id, conn, &list.displays),
                Err(e) => tracing::warn!(error = %e, "malformed ADVERTISED_DISPLAY_LIST, ignoring"),
            },
            Ok(PacketType::DisplayNoLongerAvailable) => match DisplayKey::decode(payload) {
                Ok(k) => self.handle_display_no_longer_available(id, k.key),
                Err(e) => tracing::warn!(error = %e, "malformed DISPLAY_NO_LONGER_AVAILABLE, ignoring"),
            },
            Ok(PacketType::TextMode) => match TextMode::decode(payload) {
                Ok(msg) => {
                    if let Some(h) = self.handlers.text_mode.get() {
                        h(id, msg.force);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "malformed TEXT_MODE, ignoring"),
            },
            Ok(other) => {
                tracing::debug!(?other, "ignoring packet type not valid on the control channel's consumer side");
            }
            Err(e) => tracing::warn!(error = %e, "ignoring unrecognized control packet"),
        }
    }

    /// Send `HOST_DISPLAY_LIST` on `id`'s control channel: the
    /// host's advertisement of its physical display list to the
    /// provider.
    pub fn publish_host_display_list(&self, id: ConnectionId, displays: &[DisplayInfo]) -> Result<()> {
        let conn = self
            .lock_connections()
            .get(&id.0)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown control connection {}", id.0)))?;
        let payload = DisplayList {
            displays: displays.to_vec(),
        }
        .encode();
        send_packet(conn.channel.as_ref(), PacketType::HostDisplayList as u32, &payload)
    }

    fn handle_advertised_list(&self, id: ConnectionId, conn: &ControlConnection, displays: &[DisplayInfo]) {
        let Some(handler) = self.handlers.advertised_list.get() else {
            tracing::warn!("received ADVERTISED_DISPLAY_LIST but no advertised_list handler is registered");
            return;
        };
        let requests = handler(id, displays);
        for request in requests {
            if let Err(e) = self.create_backend(id, conn, &request) {
                tracing::warn!(key = request.key, error = %e, "failed to create display backend");
            }
        }
    }

    /// Start (or reuse) listening servers for `request`'s ports, store
    /// the resulting backend, and send `ADD_DISPLAY`.
    fn create_backend(&self, id: ConnectionId, conn: &ControlConnection, request: &AddDisplayRequest) -> Result<()> {
        if !request.has_required_ports() {
            return Err(Error::InvalidArgument(
                "refusing to create a backend without event_port/framebuffer_port".into(),
            ));
        }
        let domain = conn.remote_domain;

        let event_server = self.acquire_server(domain, request.event_port)?;
        let framebuffer_server = self.acquire_server(domain, request.framebuffer_port)?;
        let dirty_server = if request.dirty_rectangles_port != 0 {
            self.acquire_server(domain, request.dirty_rectangles_port)
                .map_err(|e| tracing::warn!(key = request.key, error = %e, "dirty-rectangle server unavailable, continuing without it"))
                .ok()
        } else {
            None
        };
        let cursor_server = if request.cursor_bitmap_port != 0 {
            self.acquire_server(domain, request.cursor_bitmap_port)
                .map_err(|e| tracing::warn!(key = request.key, error = %e, "cursor server unavailable, continuing without it"))
                .ok()
        } else {
            None
        };

        let backend = DisplayBackend::new(request.key, event_server, framebuffer_server, dirty_server.clone(), cursor_server.clone());

        self.queue_accept(domain, request.event_port, ChannelKind::Event, &backend);
        self.queue_accept(domain, request.framebuffer_port, ChannelKind::Framebuffer, &backend);
        if dirty_server.is_some() {
            self.queue_accept(domain, request.dirty_rectangles_port, ChannelKind::DirtyRect, &backend);
        }
        if cursor_server.is_some() {
            self.queue_accept(domain, request.cursor_bitmap_port, ChannelKind::Cursor, &backend);
        }

        let weak = self.self_weak.clone();
        let key = request.key;
        backend.on_fatal(Arc::new(move |cause| {
            if let Some(consumer) = weak.upgrade() {
                consumer.mark_backend_dead(key, cause);
            }
        }));

        self.lock_backends().insert(request.key, backend);

        let payload = request.encode();
        send_packet(conn.channel.as_ref(), PacketType::AddDisplay as u32, &payload)?;
        tracing::info!(id = ?id, key = request.key, "display backend created, ADD_DISPLAY sent");
        Ok(())
    }

    /// Return the existing listening server for `(remote_domain, port)`,
    /// or start one: before starting a server on a `(domid, port)` tuple,
    /// check whether the transport already has a listening server on it.
    fn acquire_server(&self, remote_domain: u16, port: u32) -> Result<Arc<dyn ListeningServer>> {
        if let Some(server) = self.transport.find_listening_server(remote_domain, port) {
            return Ok(server);
        }
        let weak = self.self_weak.clone();
        let tuple = (remote_domain, port);
        let server = self.transport.listen(
            port,
            remote_domain,
            Arc::new(move |channel: Arc<dyn Channel>| {
                if let Some(consumer) = weak.upgrade() {
                    consumer.route_accept(tuple, channel);
                }
            }),
        )?;
        Ok(server)
    }

    fn queue_accept(&self, remote_domain: u16, port: u32, kind: ChannelKind, backend: &Arc<DisplayBackend>) {
        self.accept_routers
            .lock()
            .unwrap_or_else(|poisoned| {
                tracing::warn!("consumer accept-router mutex was poisoned, recovering");
                poisoned.into_inner()
            })
            .entry((remote_domain, port))
            .or_default()
            .push_back(PendingAccept {
                kind,
                backend: Arc::downgrade(backend),
            });
    }

    fn route_accept(&self, tuple: (u16, u32), channel: Arc<dyn Channel>) {
        let pending = {
            let mut routers = self.accept_routers.lock().unwrap_or_else(|poisoned| {
                tracing::warn!("consumer accept-router mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            routers.get_mut(&tuple).and_then(VecDeque::pop_front)
        };
        let Some(pending) = pending else {
            tracing::warn!(?tuple, "accepted connection with no backend waiting for it, dropping");
            channel.disconnect();
            return;
        };
        let Some(backend) = pending.backend.upgrade() else {
            tracing::warn!(?tuple, "backend waiting for this accept no longer exists, dropping");
            channel.disconnect();
            return;
        };
        match pending.kind {
            ChannelKind::Event => backend.finish_event_connection(channel),
            ChannelKind::Framebuffer => {
                if let Err(e) = backend.finish_framebuffer_connection(channel) {
                    tracing::error!(key = backend.key(), error = %e, "framebuffer connection failed fatally");
                }
            }
            ChannelKind::DirtyRect => backend.finish_dirty_rect_connection(channel),
            ChannelKind::Cursor => {
                if let Err(e) = backend.finish_cursor_connection(channel) {
                    tracing::warn!(key = backend.key(), error = %e, "cursor connection failed, continuing without it");
                }
            }
        }
    }

    fn mark_backend_dead(&self, key: u32, cause: FatalCause) {
        let backend = self.lock_backends().remove(&key);
        if let Some(backend) = backend {
            backend.destroy();
        }
        tracing::warn!(key, %cause, "display backend failed fatally");
    }

    fn handle_display_no_longer_available(&self, id: ConnectionId, key: u32) {
        if let Some(backend) = self.lock_backends().remove(&key) {
            backend.destroy();
        }
        if let Some(handler) = self.handlers.display_no_longer_available.get() {
            handler(id, key);
        }
    }

    /// Send `REMOVE_DISPLAY` on `id`'s control channel, requesting the
    /// provider tear the display down. The backend itself is torn down
    /// once the provider's matching `DISPLAY_NO_LONGER_AVAILABLE` arrives.
    pub fn request_remove_display(&self, id: ConnectionId, key: u32) -> Result<()> {
        let conn = self
            .lock_connections()
            .get(&id.0)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown control connection {}", id.0)))?;
        let payload = DisplayKey { key }.encode();
        send_packet(conn.channel.as_ref(), PacketType::RemoveDisplay as u32, &payload)
    }

    /// The backend for `key`, if one is currently live.
    #[must_use]
    pub fn backend(&self, key: u32) -> Option<Arc<DisplayBackend>> {
        self.lock_backends().get(&key).cloned()
    }

    /// Shut down the control listening server and every live backend.
    pub fn shutdown(&self) {
        self.control_server.shutdown();
        let backends: Vec<_> = self.lock_backends().drain().map(|(_, b)| b).collect();
        for backend in backends {
            backend.destroy();
        }
    }
}
