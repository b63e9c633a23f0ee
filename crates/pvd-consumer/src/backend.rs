//! The consumer-side display backend: the four listening servers and
//! accepted channels backing one host display, symmetric to
//! [`pvd_provider::DisplayAggregate`] but passive — it accepts rather
//! than originates connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pvd_core::{FatalCause, FatalHandler, FatalSlot, HandlerSlot, PartialReadReceiver};
use pvd_proto::channel::MemoryView;
use pvd_proto::types::{BlankDisplay, DirtyRect, MoveCursor, PacketType, SetDisplay, UpdateCursor};
use pvd_proto::wire::DIRTY_RECT_SIZE;
use pvd_proto::{Channel, Error, ListeningServer, Result};

type SetDisplayHandler = dyn Fn(SetDisplay) + Send + Sync;
type BlankDisplayHandler = dyn Fn(BlankDisplay) + Send + Sync;
type UpdateCursorHandler = dyn Fn(UpdateCursor) + Send + Sync;
type MoveCursorHandler = dyn Fn(MoveCursor) + Send + Sync;
type DirtyRectHandler = dyn Fn(&[DirtyRect]) + Send + Sync;

#[derive(Default)]
struct BackendHandlers {
    set_display: HandlerSlot<SetDisplayHandler>,
    blank_display: HandlerSlot<BlankDisplayHandler>,
    update_cursor: HandlerSlot<UpdateCursorHandler>,
    move_cursor: HandlerSlot<MoveCursorHandler>,
    dirty_rectangles: HandlerSlot<DirtyRectHandler>,
}

struct Servers {
    event: Arc<dyn ListeningServer>,
    framebuffer: Arc<dyn ListeningServer>,
    dirty_rect: Option<Arc<dyn ListeningServer>>,
    cursor: Option<Arc<dyn ListeningServer>>,
}

#[derive(Default)]
struct Connections {
    event: Option<Arc<dyn Channel>>,
    framebuffer: Option<Arc<dyn Channel>>,
    framebuffer_memory: Option<MemoryView>,
    dirty_rect: Option<Arc<dyn Channel>>,
    cursor: Option<Arc<dyn Channel>>,
    cursor_memory: Option<MemoryView>,
}

/// One host display's listening servers and accepted connections, as
/// seen from the consumer.
///
/// Two locks: the `connections` mutex guards the accepted connections and
/// handler table, [`FatalSlot`]'s own lock guards only the fatal handler
/// and is never nested inside the general lock, so it stays acquirable
/// while the general lock is held.
pub struct DisplayBackend {
    key: u32,
    servers: Servers,
    connections: Mutex<Connections>,
    receiver: PartialReadReceiver,
    handlers: BackendHandlers,
    fatal: FatalSlot,
    disconnected: AtomicBool,
}

impl DisplayBackend {
    /// Assemble a backend from already-listening servers. Used by
    /// [`crate::consumer::Consumer::create_backend`], which is
    /// responsible for the listening-server-reuse lookup.
    #[must_use]
    pub fn new(
        key: u32,
        event: Arc<dyn ListeningServer>,
        framebuffer: Arc<dyn ListeningServer>,
        dirty_rect: Option<Arc<dyn ListeningServer>>,
        cursor: Option<Arc<dyn ListeningServer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            servers: Servers {
                event,
                framebuffer,
                dirty_rect,
                cursor,
            },
            connections: Mutex::new(Connections::default()),
            receiver: PartialReadReceiver::new(),
            handlers: BackendHandlers::default(),
            fatal: FatalSlot::new(),
            disconnected: AtomicBool::new(false),
        })
    }

    /// The host display key this backend serves.
    #[must_use]
    pub fn key(&self) -> u32 {
        self.key
    }

    /// Whether [`DisplayBackend::disconnect_display`] has already run.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connections> {
        self.connections.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("display backend mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Register the one fatal handler for this backend.
    pub fn on_fatal(&self, handler: FatalHandler) {
        self.fatal.register(handler);
    }

    /// Register the `SET_DISPLAY` handler.
    pub fn on_set_display(&self, handler: Arc<SetDisplayHandler>) {
        self.handlers.set_display.register(handler);
    }

    /// Register the `BLANK_DISPLAY` handler.
    pub fn on_blank_display(&self, handler: Arc<BlankDisplayHandler>) {
        self.handlers.blank_display.register(handler);
    }

    /// Register the `UPDATE_CURSOR` handler.
    pub fn on_update_cursor(&self, handler: Arc<UpdateCursorHandler>) {
        self.handlers.update_cursor.register(handler);
    }

    /// Register the `MOVE_CURSOR` handler.
    pub fn on_move_cursor(&self, handler: Arc<MoveCursorHandler>) {
        self.handlers.move_cursor.register(handler);
    }

    /// Register the dirty-rectangle batch handler; invoked once per
    /// receive callback with every record drained from the ring.
    pub fn on_dirty_rectangles(&self, handler: Arc<DirtyRectHandler>) {
        self.handlers.dirty_rectangles.register(handler);
    }

    /// Attach the accepted event channel: wires its receive callbacks
    /// into this backend's partial-read pump and enables events.
    pub fn finish_event_connection(self: &Arc<Self>, channel: Arc<dyn Channel>) {
        let weak = Arc::downgrade(self);
        let on_data_weak = weak.clone();
        let on_disconnect_weak = weak;
        channel.register_event_callbacks(
            Arc::new(move || {
                if let Some(backend) = on_data_weak.upgrade() {
                    backend.pump_event_channel();
                }
            }),
            Arc::new(move || {
                if let Some(backend) = on_disconnect_weak.upgrade() {
                    backend.fire_fatal(FatalCause::Disconnected { channel: "event" });
                }
            }),
        );
        channel.enable_events();
        self.conn().event = Some(channel);
    }

    /// Attach the accepted framebuffer channel and fetch its shared-memory
    /// view. Fails fatally if the transport cannot hand back a view, since
    /// a framebuffer channel with no shared-memory region is unusable.
    pub fn finish_framebuffer_connection(self: &Arc<Self>, channel: Arc<dyn Channel>) -> Result<()> {
        let memory = channel.memory().ok_or_else(|| {
            Error::Transport("framebuffer connection has no shared memory view".into())
        })?;
        let weak = Arc::downgrade(self);
        channel.register_event_callbacks(
            Arc::new(|| {}),
            Arc::new(move || {
                if let Some(backend) = weak.upgrade() {
                    backend.fire_fatal(FatalCause::Disconnected { channel: "framebuffer" });
                }
            }),
        );
        channel.enable_events();
        let mut conn = self.conn();
        conn.framebuffer = Some(channel);
        conn.framebuffer_memory = Some(memory);
        Ok(())
    }

    /// Attach the accepted dirty-rectangle channel. Optional; its
    /// disconnect is wired to this backend's fatal path, though an
    /// implementer may later relax that to a soft fallback.
    pub fn finish_dirty_rect_connection(self: &Arc<Self>, channel: Arc<dyn Channel>) {
        let weak = Arc::downgrade(self);
        let on_data_weak = weak.clone();
        let on_disconnect_weak = weak;
        channel.register_event_callbacks(
            Arc::new(move || {
                if let Some(backend) = on_data_weak.upgrade() {
                    backend.pump_dirty_rect_channel();
                }
            }),
            Arc::new(move || {
                if let Some(backend) = on_disconnect_weak.upgrade() {
                    backend.fire_fatal(FatalCause::Disconnected { channel: "dirty_rect" });
                }
            }),
        );
        channel.enable_events();
        self.conn().dirty_rect = Some(channel);
    }

    /// Attach the accepted cursor-image channel and fetch its
    /// shared-memory view.
    pub fn finish_cursor_connection(self: &Arc<Self>, channel: Arc<dyn Channel>) -> Result<()> {
        let memory = channel
            .memory()
            .ok_or_else(|| Error::Transport("cursor connection has no shared memory view".into()))?;
        let weak = Arc::downgrade(self);
        channel.register_event_callbacks(
            Arc::new(|| {}),
            Arc::new(move || {
                if let Some(backend) = weak.upgrade() {
                    backend.fire_fatal(FatalCause::Disconnected { channel: "cursor" });
                }
            }),
        );
        channel.enable_events();
        let mut conn = self.conn();
        conn.cursor = Some(channel);
        conn.cursor_memory = Some(memory);
        Ok(())
    }

    /// The framebuffer's shared-memory view, once [`finish_framebuffer_connection`]
    /// has run.
    ///
    /// [`finish_framebuffer_connection`]: DisplayBackend::finish_framebuffer_connection
    #[must_use]
    pub fn framebuffer_memory(&self) -> Option<MemoryView> {
        self.conn().framebuffer_memory.clone()
    }

    /// The cursor image's shared-memory view, if the cursor channel was
    /// attached.
    #[must_use]
    pub fn cursor_memory(&self) -> Option<MemoryView> {
        self.conn().cursor_memory.clone()
    }

    fn fire_fatal(&self, cause: FatalCause) {
        self.fatal.fire(cause);
    }

    fn pump_event_channel(&self) {
        if self.is_disconnected() {
            return;
        }
        let channel = match self.conn().event.clone() {
            Some(c) => c,
            None => return,
        };
        self.receiver.on_data_available(
            channel.as_ref(),
            |header, payload| self.dispatch_event(header.pkt_type, &payload),
            |cause| self.fire_fatal(cause),
        );
    }

    fn dispatch_event(&self, pkt_type: u32, payload: &[u8]) {
        match PacketType::try_from(pkt_type) {
            Ok(PacketType::SetDisplay) => match SetDisplay::decode(payload) {
                Ok(msg) => {
                    if let Some(h) = self.handlers.set_display.get() {
                        h(msg);
                    }
                }
                Err(e) => tracing::warn!(key = self.key, error = %e, "malformed SET_DISPLAY, ignoring"),
            },
            Ok(PacketType::UpdateCursor) => match UpdateCursor::decode(payload) {
                Ok(msg) => {
                    if let Some(h) = self.handlers.update_cursor.get() {
                        h(msg);
                    }
                }
                Err(e) => tracing::warn!(key = self.key, error = %e, "malformed UPDATE_CURSOR, ignoring"),
            },
            Ok(PacketType::MoveCursor) => match MoveCursor::decode(payload) {
                Ok(msg) => {
                    if let Some(h) = self.handlers.move_cursor.get() {
                        h(msg);
                    }
                }
                Err(e) => tracing::warn!(key = self.key, error = %e, "malformed MOVE_CURSOR, ignoring"),
            },
            Ok(PacketType::BlankDisplay) => match BlankDisplay::decode(payload) {
                Ok(msg) => {
                    if let Some(h) = self.handlers.blank_display.get() {
                        h(msg);
                    }
                }
                Err(e) => tracing::warn!(key = self.key, error = %e, "malformed BLANK_DISPLAY, ignoring"),
            },
            Ok(other) => {
                tracing::debug!(key = self.key, ?other, "ignoring packet type not valid on event channel");
            }
            Err(e) => tracing::warn!(key = self.key, error = %e, "ignoring unrecognized event packet"),
        }
    }

    /// Drain every complete 16-byte record currently buffered on the
    /// dirty-rectangle channel and dispatch them as one batch. The channel
    /// carries raw records with no header or footer, so a corrupted record
    /// is undetectable by design and this does not go through
    /// [`PartialReadReceiver`].
    fn pump_dirty_rect_channel(&self) {
        if self.is_disconnected() {
            return;
        }
        let channel = match self.conn().dirty_rect.clone() {
            Some(c) => c,
            None => return,
        };

        let mut records = Vec::new();
        loop {
            let available = match channel.available_data() {
                Ok(n) => n,
                Err(e) => {
                    self.fire_fatal(FatalCause::Transport(format!("getAvailableData failed: {e}")));
                    return;
                }
            };
            if available < DIRTY_RECT_SIZE {
                break;
            }
            let mut buf = [0u8; DIRTY_RECT_SIZE];
            match channel.recv(&mut buf) {
                Ok(()) => match DirtyRect::decode(&buf) {
                    Ok(rect) => records.push(rect),
                    Err(e) => {
                        tracing::warn!(key = self.key, error = %e, "malformed dirty-rect record, skipping");
                    }
                },
                Err(_) => break,
            }
        }

        if !records.is_empty() {
            if let Some(h) = self.handlers.dirty_rectangles.get() {
                h(&records);
            }
        }
    }

    /// Disable events, clear handler slots, and disconnect every
    /// attached channel, then mark this backend disconnected so any
    /// in-flight callback observes the flag and returns immediately.
    pub fn disconnect_display(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handlers.set_display.clear();
        self.handlers.blank_display.clear();
        self.handlers.update_cursor.clear();
        self.handlers.move_cursor.clear();
        self.handlers.dirty_rectangles.clear();

        let conn = self.conn();
        if let Some(c) = &conn.event {
            c.disable_events();
            c.disconnect();
        }
        if let Some(c) = &conn.framebuffer {
            c.disable_events();
            c.disconnect();
        }
        if let Some(c) = &conn.dirty_rect {
            c.disable_events();
            c.disconnect();
        }
        if let Some(c) = &conn.cursor {
            c.disable_events();
            c.disconnect();
        }
        tracing::info!(key = self.key, "display backend disconnected");
    }

    /// Tear the listening servers down too, beyond what
    /// [`DisplayBackend::disconnect_display`] does.
    ///
    /// Does not shut down servers shared with another backend on the
    /// same `(domid, port)` tuple unless this is the only owner; callers
    /// that share servers (via [`crate::consumer::Consumer::create_backend`]'s
    /// reuse path) are expected to track that themselves — this method
    /// shuts down whatever [`ListeningServer`] handles it holds, and
    /// `shutdown` is documented as idempotent.
    pub fn destroy(&self) {
        self.disconnect_display();
        self.servers.event.shutdown();
        self.servers.framebuffer.shutdown();
        if let Some(s) = &self.servers.dirty_rect {
            s.shutdown();
        }
        if let Some(s) = &self.servers.cursor {
            s.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockChannel, MockServer};

    fn make_backend() -> Arc<DisplayBackend> {
        DisplayBackend::new(
            1,
            Arc::new(MockServer::new(100)),
            Arc::new(MockServer::new(101)),
            Some(Arc::new(MockServer::new(102))),
            Some(Arc::new(MockServer::new(103))),
        )
    }

    #[test]
    fn finish_framebuffer_without_memory_is_fatal_site() {
        let backend = make_backend();
        let channel = Arc::new(MockChannel::new()); // no memory
        assert!(matches!(
            backend.finish_framebuffer_connection(channel),
            Err(Error::Transport(_))
        ));
    }

    #[test]
    fn dirty_rect_drains_all_pending_records_in_one_pump() {
        let backend = make_backend();
        let channel = Arc::new(MockChannel::new());
        backend.finish_dirty_rect_connection(channel.clone());

        let rects: Vec<DirtyRect> = (0..5)
            .map(|i| DirtyRect {
                x: i,
                y: i,
                w: 10,
                h: 10,
            })
            .collect();
        for r in &rects {
            channel.push_incoming(&r.encode());
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        backend.on_dirty_rectangles(Arc::new(move |batch: &[DirtyRect]| {
            seen2.lock().unwrap().extend_from_slice(batch);
        }));

        backend.pump_dirty_rect_channel();
        assert_eq!(*seen.lock().unwrap(), rects);
    }

    #[test]
    fn disconnect_display_clears_handlers_and_closes_channels() {
        let backend = make_backend();
        let event = Arc::new(MockChannel::new());
        backend.finish_event_connection(event.clone());
        backend.on_set_display(Arc::new(|_msg| {}));

        backend.disconnect_display();
        assert!(backend.is_disconnected());
        assert!(!event.is_open());
        assert!(!backend.handlers.set_display.is_set());
    }

    #[test]
    fn disconnected_backend_ignores_further_event_pumps() {
        let backend = make_backend();
        let event = Arc::new(MockChannel::new());
        backend.finish_event_connection(event.clone());
        event.push_incoming(&pvd_proto::wire::encode(101, &[0; 12]).unwrap());

        backend.disconnect_display();
        let dispatched = Arc::new(Mutex::new(false));
        let dispatched2 = dispatched.clone();
        backend.on_set_display(Arc::new(move |_msg| {
            *dispatched2.lock().unwrap() = true;
        }));
        backend.pump_event_channel();
        assert!(!*dispatched.lock().unwrap());
    }

    #[test]
    fn destroy_is_idempotent() {
        let backend = make_backend();
        backend.destroy();
        backend.destroy();
        assert!(backend.is_disconnected());
    }
}
