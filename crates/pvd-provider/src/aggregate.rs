//! The provider-side display aggregate: the four IVC connections backing
//! one host display, plus the framebuffer/cursor state published over
//! them.

use std::any::Any;
use std::sync::{Arc, Mutex};

use pvd_core::{FatalCause, FatalHandler, FatalSlot};
use pvd_proto::channel::MemoryView;
use pvd_proto::types::{BlankDisplay, BlankReason, DirtyRect, MoveCursor, SetDisplay, UpdateCursor};
use pvd_proto::wire::{encode, DIRTY_RECT_SIZE};
use pvd_proto::{Channel, Error, Result};

/// Maximum cursor image dimension in either axis.
pub const CURSOR_MAX_DIM: u32 = 64;
/// Fixed row stride of the cursor-image shared-memory region.
pub const CURSOR_STRIDE: usize = 256;
/// Total size of the cursor-image shared-memory region.
pub const CURSOR_IMAGE_BYTES: usize = CURSOR_STRIDE * CURSOR_MAX_DIM as usize;

pub(crate) fn send_packet(channel: &dyn Channel, pkt_type: u32, payload: &[u8]) -> Result<()> {
    let bytes = encode(pkt_type, payload)?;
    let free = channel.available_space()?;
    if free < bytes.len() {
        return Err(Error::NoSpace);
    }
    if !channel.is_open() {
        return Err(Error::Closed);
    }
    channel.send(&bytes)?;
    // The transport's interrupt-coalescing behavior requires two
    // notifications per logical send; one would be semantically enough
    // but this is kept bitwise, not "optimized" away.
    channel.notify_remote();
    channel.notify_remote();
    Ok(())
}

struct AggregateState {
    key: u32,
    event: Arc<dyn Channel>,
    framebuffer: Arc<dyn Channel>,
    framebuffer_memory: MemoryView,
    dirty_rect: Option<Arc<dyn Channel>>,
    cursor: Option<Arc<dyn Channel>>,
    cursor_memory: Option<MemoryView>,
    width: u32,
    height: u32,
    stride: u32,
    cursor_hotspot_x: u32,
    cursor_hotspot_y: u32,
    cursor_visible: bool,
    driver_data: Option<Box<dyn Any + Send + Sync>>,
}

/// One host display's channel bundle, as seen from the provider.
///
/// Holds its state behind a single primary mutex: every operation here
/// takes that lock for the duration of its work, and
/// releases it before firing the fatal handler (the fatal slot has its
/// own lock, so clearing it never needs the primary one).
pub struct DisplayAggregate {
    state: Mutex<AggregateState>,
    fatal: FatalSlot,
}

impl DisplayAggregate {
    /// Assemble an aggregate from already-open channels. Used by
    /// [`crate::provider::Provider::create_display`], which is
    /// responsible for opening the channels in the required order.
    #[must_use]
    pub fn new(
        key: u32,
        event: Arc<dyn Channel>,
        framebuffer: Arc<dyn Channel>,
        dirty_rect: Option<Arc<dyn Channel>>,
        cursor: Option<Arc<dyn Channel>>,
        width: u32,
        height: u32,
        stride: u32,
    ) -> Result<Arc<Self>> {
        let framebuffer_memory = framebuffer
            .memory()
            .ok_or_else(|| Error::Transport("framebuffer channel has no shared memory view".into()))?;
        let cursor_memory = cursor.as_ref().and_then(|c| c.memory());

        Ok(Arc::new(Self {
            state: Mutex::new(AggregateState {
                key,
                event,
                framebuffer,
                framebuffer_memory,
                dirty_rect,
                cursor,
                cursor_memory,
                width,
                height,
                stride,
                cursor_hotspot_x: 0,
                cursor_hotspot_y: 0,
                cursor_visible: true,
                driver_data: None,
            }),
            fatal: FatalSlot::new(),
        }))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AggregateState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("display aggregate mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// The host display key this aggregate backs.
    #[must_use]
    pub fn key(&self) -> u32 {
        self.lock().key
    }

    /// Current `(width, height, stride)`.
    #[must_use]
    pub fn resolution(&self) -> (u32, u32, u32) {
        let state = self.lock();
        (state.width, state.height, state.stride)
    }

    /// Register the one fatal handler for this aggregate.
    pub fn on_fatal(&self, handler: FatalHandler) {
        self.fatal.register(handler);
    }

    fn fire_fatal(&self, cause: FatalCause) {
        self.fatal.fire(cause);
    }

    /// Store caller-opaque driver data alongside the aggregate.
    pub fn set_driver_data(&self, data: Box<dyn Any + Send + Sync>) {
        self.lock().driver_data = Some(data);
    }

    /// Run `f` with the stored driver data downcast to `T`, or `None` if
    /// no driver data is set or it has a different concrete type.
    pub fn with_driver_data<T: 'static, R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let state = self.lock();
        f(state.driver_data.as_ref().and_then(|d| d.downcast_ref::<T>()))
    }

    /// Re-establish the framebuffer and event channels against a new
    /// request, optionally the dirty-rect and cursor channels too.
    ///
    /// Requires the new request to carry non-zero `framebuffer_port` and
    /// `event_port`. Optional-channel reconnect failures are logged and
    /// swallowed, not propagated.
    pub fn reconnect(
        &self,
        remote_domain: u16,
        framebuffer_port: u32,
        event_port: u32,
        dirty_rectangles_port: u32,
        cursor_bitmap_port: u32,
    ) -> Result<()> {
        if framebuffer_port == 0 || event_port == 0 {
            return Err(Error::InvalidArgument(
                "reconnect requires non-zero framebuffer_port and event_port".into(),
            ));
        }

        let state = self.lock();
        state.framebuffer.reconnect(remote_domain, framebuffer_port)?;
        state.event.reconnect(remote_domain, event_port)?;

        if dirty_rectangles_port != 0 {
            if let Some(dirty) = &state.dirty_rect {
                if let Err(e) = dirty.reconnect(remote_domain, dirty_rectangles_port) {
                    tracing::warn!(key = state.key, error = %e, "dirty-rect reconnect failed, continuing without it");
                }
            }
        }
        if cursor_bitmap_port != 0 {
            if let Some(cursor) = &state.cursor {
                if let Err(e) = cursor.reconnect(remote_domain, cursor_bitmap_port) {
                    tracing::warn!(key = state.key, error = %e, "cursor reconnect failed, continuing without it");
                }
            }
        }
        tracing::info!(key = state.key, "display reconnected");
        Ok(())
    }

    /// Update `(width, height, stride)` and publish `SET_DISPLAY`.
    /// Idempotent: two identical calls publish two identical packets and
    /// leave the same state.
    pub fn change_resolution(&self, width: u32, height: u32, stride: u32) -> Result<()> {
        let mut state = self.lock();
        state.width = width;
        state.height = height;
        state.stride = stride;
        let payload = SetDisplay {
            width,
            height,
            stride,
        }
        .encode();
        send_packet(state.event.as_ref(), pvd_proto::types::PacketType::SetDisplay as u32, &payload)
    }

    /// Publish a dirty rectangle, replacing it with a full-screen refresh
    /// if the ring is nearly full.
    pub fn invalidate_region(&self, x: u32, y: u32, w: u32, h: u32) -> Result<()> {
        let state = self.lock();
        let dirty = state
            .dirty_rect
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("no dirty-rectangle channel".into()))?;

        let free = dirty.available_space()?;
        if free < DIRTY_RECT_SIZE {
            return Err(Error::TryAgain);
        }

        let record = if free < 2 * DIRTY_RECT_SIZE {
            tracing::debug!(
                key = state.key,
                "dirty-rect ring nearly full, replacing with full-screen refresh"
            );
            DirtyRect::full_screen(state.width, state.height)
        } else {
            DirtyRect { x, y, w, h }
        };

        if !dirty.is_open() {
            return Err(Error::Closed);
        }
        dirty.send(&record.encode())?;
        dirty.notify_remote();
        dirty.notify_remote();
        Ok(())
    }

    /// Whether this display has a cursor-image channel.
    #[must_use]
    pub fn supports_cursor(&self) -> bool {
        self.lock().cursor_memory.is_some()
    }

    /// Set the cursor hotspot and publish `UPDATE_CURSOR`. Bounds: `xh, yh <= 64`.
    pub fn set_cursor_hotspot(&self, xh: u32, yh: u32) -> Result<()> {
        if xh > CURSOR_MAX_DIM || yh > CURSOR_MAX_DIM {
            return Err(Error::InvalidArgument(format!(
                "cursor hotspot ({xh}, {yh}) exceeds {CURSOR_MAX_DIM}"
            )));
        }
        let mut state = self.lock();
        if state.cursor.is_none() {
            return Err(Error::InvalidArgument("no cursor channel".into()));
        }
        state.cursor_hotspot_x = xh;
        state.cursor_hotspot_y = yh;
        self.publish_update_cursor(&state)
    }

    /// Set cursor visibility and publish `UPDATE_CURSOR`.
    pub fn set_cursor_visibility(&self, visible: bool) -> Result<()> {
        let mut state = self.lock();
        if state.cursor.is_none() {
            return Err(Error::InvalidArgument("no cursor channel".into()));
        }
        state.cursor_visible = visible;
        self.publish_update_cursor(&state)
    }

    fn publish_update_cursor(&self, state: &AggregateState) -> Result<()> {
        let payload = UpdateCursor {
            hotspot_x: state.cursor_hotspot_x,
            hotspot_y: state.cursor_hotspot_y,
            visible: state.cursor_visible,
        }
        .encode();
        send_packet(
            state.event.as_ref(),
            pvd_proto::types::PacketType::UpdateCursor as u32,
            &payload,
        )
    }

    /// Publish `MOVE_CURSOR`.
    pub fn move_cursor(&self, x: u32, y: u32) -> Result<()> {
        let state = self.lock();
        let payload = MoveCursor { x, y }.encode();
        send_packet(
            state.event.as_ref(),
            pvd_proto::types::PacketType::MoveCursor as u32,
            &payload,
        )
    }

    /// Row-copy a `src_w x src_h` ARGB image into the fixed 64x64,
    /// 256-byte-stride cursor region, zero-filling the remainder of each
    /// row and any missing trailing rows. Publishes `UPDATE_CURSOR` on
    /// completion.
    pub fn load_cursor_image(&self, image: &[u8], src_w: u32, src_h: u32) -> Result<()> {
        if src_w > CURSOR_MAX_DIM || src_h > CURSOR_MAX_DIM {
            return Err(Error::InvalidArgument(format!(
                "cursor image {src_w}x{src_h} exceeds {CURSOR_MAX_DIM}x{CURSOR_MAX_DIM}"
            )));
        }
        let row_bytes = 4 * src_w as usize;
        let expected_len = row_bytes * src_h as usize;
        if image.len() < expected_len {
            return Err(Error::InvalidArgument(format!(
                "cursor image buffer is {} bytes, need at least {expected_len}",
                image.len()
            )));
        }

        let state = self.lock();
        let memory = state
            .cursor_memory
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("no cursor channel".into()))?;

        {
            let mut dest = memory.lock().unwrap_or_else(|poisoned| {
                tracing::warn!("cursor memory mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            if dest.len() < CURSOR_IMAGE_BYTES {
                dest.resize(CURSOR_IMAGE_BYTES, 0);
            }

            for row in 0..CURSOR_MAX_DIM as usize {
                let dest_row = &mut dest[row * CURSOR_STRIDE..(row + 1) * CURSOR_STRIDE];
                dest_row.fill(0);
                if row < src_h as usize {
                    let src_row = &image[row * row_bytes..(row + 1) * row_bytes];
                    dest_row[..row_bytes].copy_from_slice(src_row);
                }
            }
        }

        self.publish_update_cursor(&state)
    }

    /// Publish `BLANK_DISPLAY` with the reason selected by the
    /// `{dpms, blank}` table.
    pub fn blank_display(&self, dpms: bool, blank: bool) -> Result<()> {
        let state = self.lock();
        let payload = BlankDisplay {
            reason: BlankReason::from_flags(dpms, blank),
        }
        .encode();
        send_packet(
            state.event.as_ref(),
            pvd_proto::types::PacketType::BlankDisplay as u32,
            &payload,
        )
    }

    /// Copy `contents` into the framebuffer's shared-memory region,
    /// starting at offset 0 (used by `create_display`'s `initial_contents`).
    pub fn write_framebuffer(&self, contents: &[u8]) -> Result<()> {
        let state = self.lock();
        let mut dest = state.framebuffer_memory.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("framebuffer memory mutex was poisoned, recovering");
            poisoned.into_inner()
        });
        if dest.len() < contents.len() {
            dest.resize(contents.len(), 0);
        }
        dest[..contents.len()].copy_from_slice(contents);
        Ok(())
    }

    /// Disconnect all four channels this aggregate owns. Idempotent since
    /// [`Channel::disconnect`] is.
    pub fn destroy(&self) {
        let state = self.lock();
        state.event.disconnect();
        state.framebuffer.disconnect();
        if let Some(dirty) = &state.dirty_rect {
            dirty.disconnect();
        }
        if let Some(cursor) = &state.cursor {
            cursor.disconnect();
        }
        tracing::info!(key = state.key, "display aggregate destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockChannel;

    struct Harness {
        agg: Arc<DisplayAggregate>,
        event: Arc<MockChannel>,
        framebuffer: Arc<MockChannel>,
        dirty: Arc<MockChannel>,
        cursor: Arc<MockChannel>,
    }

    fn make_aggregate() -> Harness {
        let event = Arc::new(MockChannel::new());
        let framebuffer = Arc::new(MockChannel::with_memory(4096));
        let dirty = Arc::new(MockChannel::new());
        let cursor = Arc::new(MockChannel::with_memory(CURSOR_IMAGE_BYTES));
        let agg = DisplayAggregate::new(
            1,
            event.clone(),
            framebuffer.clone(),
            Some(dirty.clone()),
            Some(cursor.clone()),
            1920,
            1080,
            7680,
        )
        .unwrap();
        Harness {
            agg,
            event,
            framebuffer,
            dirty,
            cursor,
        }
    }

    #[test]
    fn change_resolution_is_idempotent_on_the_wire() {
        let h = make_aggregate();
        h.agg.change_resolution(800, 600, 3200).unwrap();
        h.agg.change_resolution(800, 600, 3200).unwrap();
        assert_eq!(h.agg.resolution(), (800, 600, 3200));
        let sent = h.event.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
        assert_eq!(h.event.notify_count(), 4); // two notifies per send
    }

    #[test]
    fn cursor_image_smaller_than_max_zero_fills_remainder() {
        let h = make_aggregate();
        let src_w = 32u32;
        let src_h = 16u32;
        let image = vec![0xABu8; (4 * src_w * src_h) as usize];
        h.agg.load_cursor_image(&image, src_w, src_h).unwrap();

        let memory = h.cursor.memory().unwrap();
        let buf = memory.lock().unwrap();
        for row in 0..16usize {
            let row_bytes = &buf[row * CURSOR_STRIDE..row * CURSOR_STRIDE + 128];
            assert!(row_bytes.iter().all(|&b| b == 0xAB));
            let tail = &buf[row * CURSOR_STRIDE + 128..(row + 1) * CURSOR_STRIDE];
            assert!(tail.iter().all(|&b| b == 0));
        }
        for row in 16..64usize {
            let full_row = &buf[row * CURSOR_STRIDE..(row + 1) * CURSOR_STRIDE];
            assert!(full_row.iter().all(|&b| b == 0));
        }
        assert_eq!(h.event.sent_frames().len(), 1);
    }

    #[test]
    fn cursor_bounds_rejected() {
        let h = make_aggregate();
        let image = vec![0u8; 4 * 65 * 65];
        assert!(matches!(
            h.agg.load_cursor_image(&image, 65, 10),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn dirty_rect_overflow_replaces_with_full_screen() {
        let h = make_aggregate();
        h.dirty.set_available_space(20); // < 32 bytes: two records' worth
        h.agg.invalidate_region(10, 10, 100, 100).unwrap();
        let sent = h.dirty.sent_frames();
        let rect = DirtyRect::decode(sent.last().unwrap()).unwrap();
        assert_eq!(rect, DirtyRect::full_screen(1920, 1080));
    }

    #[test]
    fn dirty_rect_with_room_keeps_original_rectangle() {
        let h = make_aggregate();
        h.agg.invalidate_region(10, 10, 100, 100).unwrap();
        let sent = h.dirty.sent_frames();
        let rect = DirtyRect::decode(sent.last().unwrap()).unwrap();
        assert_eq!(
            rect,
            DirtyRect {
                x: 10,
                y: 10,
                w: 100,
                h: 100
            }
        );
    }

    #[test]
    fn dirty_rect_with_no_space_returns_try_again() {
        let h = make_aggregate();
        h.dirty.set_available_space(4);
        assert!(matches!(
            h.agg.invalidate_region(0, 0, 10, 10),
            Err(Error::TryAgain)
        ));
    }

    #[test]
    fn destroy_disconnects_all_four_channels() {
        let h = make_aggregate();
        h.agg.destroy();
        assert!(!h.event.is_open());
        assert!(!h.framebuffer.is_open());
        assert!(!h.dirty.is_open());
        assert!(!h.cursor.is_open());
    }
}
