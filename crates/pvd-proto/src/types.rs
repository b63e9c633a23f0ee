//! Packet type constants and the typed message payloads carried by each one.
//!
//! Every payload struct is fixed-layout and little-endian. Each
//! provides `encode`/`decode` so callers never hand-roll byte offsets.

use crate::error::ProtocolError;

/// Packet type numbers, partitioned into the control (0-99) and event
/// (100-199) ranges.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    /// Provider -> consumer: advertises driver capabilities.
    DriverCapabilities = 1,
    /// Consumer -> provider: the host's physical display list.
    HostDisplayList = 2,
    /// Provider -> consumer: the displays the provider intends to use.
    AdvertisedDisplayList = 3,
    /// Consumer -> provider: request to create a display's channels.
    AddDisplay = 4,
    /// Consumer -> provider: request to tear a display down.
    RemoveDisplay = 5,
    /// Provider -> consumer: a display has been torn down locally.
    DisplayNoLongerAvailable = 6,
    /// Provider -> consumer: toggle legacy text-mode handling.
    TextMode = 7,
    /// Provider -> consumer (event channel): resolution/stride changed.
    SetDisplay = 101,
    /// Provider -> consumer (event channel): cursor hotspot/visibility changed.
    UpdateCursor = 102,
    /// Provider -> consumer (event channel): cursor position changed.
    MoveCursor = 103,
    /// Provider -> consumer (event channel): blank/DPMS state changed.
    BlankDisplay = 104,
}

impl PacketType {
    /// True if this type belongs to the control range (0-99).
    #[must_use]
    pub fn is_control(self) -> bool {
        (self as u32) < 100
    }

    /// True if this type belongs to the event range (100-199).
    #[must_use]
    pub fn is_event(self) -> bool {
        (100..200).contains(&(self as u32))
    }
}

impl TryFrom<u32> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::DriverCapabilities,
            2 => Self::HostDisplayList,
            3 => Self::AdvertisedDisplayList,
            4 => Self::AddDisplay,
            5 => Self::RemoveDisplay,
            6 => Self::DisplayNoLongerAvailable,
            7 => Self::TextMode,
            101 => Self::SetDisplay,
            102 => Self::UpdateCursor,
            103 => Self::MoveCursor,
            104 => Self::BlankDisplay,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// Capability bits reported in [`DriverCapabilities::capabilities`].
///
/// Set when the driver registers the corresponding handler with the
/// `Provider`: each registration also flips a capability bit that is
/// then reported in future `DRIVER_CAPABILITIES` messages.
pub mod capability {
    /// The driver handles host display resolution changes.
    pub const RESIZE: u32 = 0x1;
    /// The driver handles consumer-initiated add/remove of displays.
    pub const HOTPLUG: u32 = 0x2;
}

/// Reason code for a [`BlankDisplay`] event, selected by the `{dpms, blank}`
/// 2x2 table below.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlankReason {
    /// DPMS-driven sleep.
    Sleep = 0,
    /// DPMS-driven wake.
    Wake = 1,
    /// Non-DPMS blank fill enabled.
    FillEnable = 2,
    /// Non-DPMS blank fill disabled.
    FillDisable = 3,
}

impl BlankReason {
    /// Select the reason from the `{dpms, blank}` table.
    #[must_use]
    pub fn from_flags(dpms: bool, blank: bool) -> Self {
        match (dpms, blank) {
            (true, false) => Self::Wake,
            (true, true) => Self::Sleep,
            (false, true) => Self::FillEnable,
            (false, false) => Self::FillDisable,
        }
    }
}

impl TryFrom<u32> for BlankReason {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Sleep,
            1 => Self::Wake,
            2 => Self::FillEnable,
            3 => Self::FillDisable,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

fn require_len(buf: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if buf.len() != expected {
        return Err(ProtocolError::Oversize {
            length: buf.len() as u32,
        });
    }
    Ok(())
}

macro_rules! u32_field {
    ($buf:expr, $off:expr) => {
        u32::from_le_bytes([$buf[$off], $buf[$off + 1], $buf[$off + 2], $buf[$off + 3]])
    };
}

/// A single host physical display's identity and geometry.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayInfo {
    /// Uniquely identifies this host physical display for the connection's lifetime.
    pub key: u32,
    /// X origin.
    pub x: u32,
    /// Y origin.
    pub y: u32,
    /// Width in pixels.
    pub w: u32,
    /// Height in pixels.
    pub h: u32,
}

impl DisplayInfo {
    /// Encoded size in bytes.
    pub const SIZE: usize = 20;

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.key.to_le_bytes());
        out.extend_from_slice(&self.x.to_le_bytes());
        out.extend_from_slice(&self.y.to_le_bytes());
        out.extend_from_slice(&self.w.to_le_bytes());
        out.extend_from_slice(&self.h.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        Self {
            key: u32_field!(buf, 0),
            x: u32_field!(buf, 4),
            y: u32_field!(buf, 8),
            w: u32_field!(buf, 12),
            h: u32_field!(buf, 16),
        }
    }
}

/// `DRIVER_CAPABILITIES` payload (16 bytes).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Maximum number of simultaneous displays this driver supports.
    pub max_displays: u32,
    /// Protocol version implemented by this driver.
    pub version: u32,
    /// Bitwise OR of [`capability`] flags for handlers the driver registered.
    pub capabilities: u32,
    /// Reserved, always zero on the wire.
    pub reserved: u32,
}

impl DriverCapabilities {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.max_displays.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.capabilities.to_le_bytes());
        out.extend_from_slice(&self.reserved.to_le_bytes());
        out
    }

    /// Parse from wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        require_len(buf, Self::SIZE)?;
        Ok(Self {
            max_displays: u32_field!(buf, 0),
            version: u32_field!(buf, 4),
            capabilities: u32_field!(buf, 8),
            reserved: u32_field!(buf, 12),
        })
    }
}

/// A list of [`DisplayInfo`] entries, used by both `HOST_DISPLAY_LIST` and
/// `ADVERTISED_DISPLAY_LIST` (same wire shape: a `u32` count followed by
/// that many 20-byte entries).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplayList {
    /// The displays in this list.
    pub displays: Vec<DisplayInfo>,
}

impl DisplayList {
    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.displays.len() * DisplayInfo::SIZE);
        out.extend_from_slice(&(self.displays.len() as u32).to_le_bytes());
        for d in &self.displays {
            d.encode_into(&mut out);
        }
        out
    }

    /// Parse from wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < 4 {
            return Err(ProtocolError::Oversize {
                length: buf.len() as u32,
            });
        }
        let count = u32_field!(buf, 0) as usize;
        let expected = 4 + count * DisplayInfo::SIZE;
        require_len(buf, expected)?;

        let mut displays = Vec::with_capacity(count);
        for i in 0..count {
            let off = 4 + i * DisplayInfo::SIZE;
            displays.push(DisplayInfo::decode_from(&buf[off..off + DisplayInfo::SIZE]));
        }
        Ok(Self { displays })
    }
}

/// `ADD_DISPLAY` payload (20 bytes): requests that the provider open the
/// four channels for display `key` on the given ports. A port value of
/// zero means "do not open this (optional) channel".
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddDisplayRequest {
    /// The host display this request refers to.
    pub key: u32,
    /// Port for the per-display event channel (required, non-zero).
    pub event_port: u32,
    /// Port for the per-display framebuffer channel (required, non-zero).
    pub framebuffer_port: u32,
    /// Port for the optional dirty-rectangle channel (zero = absent).
    pub dirty_rectangles_port: u32,
    /// Port for the optional cursor-image channel (zero = absent).
    pub cursor_bitmap_port: u32,
}

impl AddDisplayRequest {
    /// Encoded size in bytes.
    pub const SIZE: usize = 20;

    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.key.to_le_bytes());
        out.extend_from_slice(&self.event_port.to_le_bytes());
        out.extend_from_slice(&self.framebuffer_port.to_le_bytes());
        out.extend_from_slice(&self.dirty_rectangles_port.to_le_bytes());
        out.extend_from_slice(&self.cursor_bitmap_port.to_le_bytes());
        out
    }

    /// Parse from wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        require_len(buf, Self::SIZE)?;
        Ok(Self {
            key: u32_field!(buf, 0),
            event_port: u32_field!(buf, 4),
            framebuffer_port: u32_field!(buf, 8),
            dirty_rectangles_port: u32_field!(buf, 12),
            cursor_bitmap_port: u32_field!(buf, 16),
        })
    }

    /// Whether both channels required for `create_display` are requested:
    /// an add-display request only proceeds once `framebuffer_port` and
    /// `event_port` are both non-zero.
    #[must_use]
    pub fn has_required_ports(&self) -> bool {
        self.event_port != 0 && self.framebuffer_port != 0
    }
}

/// A payload carrying only a display `key`: shared shape for `REMOVE_DISPLAY`
/// and `DISPLAY_NO_LONGER_AVAILABLE` (4 bytes).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayKey {
    /// The display this message refers to.
    pub key: u32,
}

impl DisplayKey {
    /// Encoded size in bytes.
    pub const SIZE: usize = 4;

    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.key.to_le_bytes().to_vec()
    }

    /// Parse from wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        require_len(buf, Self::SIZE)?;
        Ok(Self {
            key: u32_field!(buf, 0),
        })
    }
}

/// `TEXT_MODE` payload (4 bytes).
///
/// A single `bool force` flag, widened to a `u32` to keep fixed-layout
/// alignment with the rest of the protocol.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextMode {
    /// Whether text mode is being forced on.
    pub force: bool,
}

impl TextMode {
    /// Encoded size in bytes.
    pub const SIZE: usize = 4;

    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        u32::from(self.force).to_le_bytes().to_vec()
    }

    /// Parse from wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        require_len(buf, Self::SIZE)?;
        Ok(Self {
            force: u32_field!(buf, 0) != 0,
        })
    }
}

/// `SET_DISPLAY` payload (12 bytes): resolution and stride change.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetDisplay {
    /// New width in pixels.
    pub width: u32,
    /// New height in pixels.
    pub height: u32,
    /// New framebuffer stride in bytes.
    pub stride: u32,
}

impl SetDisplay {
    /// Encoded size in bytes.
    pub const SIZE: usize = 12;

    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.stride.to_le_bytes());
        out
    }

    /// Parse from wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        require_len(buf, Self::SIZE)?;
        Ok(Self {
            width: u32_field!(buf, 0),
            height: u32_field!(buf, 4),
            stride: u32_field!(buf, 8),
        })
    }
}

/// `UPDATE_CURSOR` payload (12 bytes): hotspot and visibility.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCursor {
    /// Cursor hotspot X, `0..=64`.
    pub hotspot_x: u32,
    /// Cursor hotspot Y, `0..=64`.
    pub hotspot_y: u32,
    /// Whether the cursor is currently visible.
    pub visible: bool,
}

impl UpdateCursor {
    /// Encoded size in bytes.
    pub const SIZE: usize = 12;

    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.hotspot_x.to_le_bytes());
        out.extend_from_slice(&self.hotspot_y.to_le_bytes());
        out.extend_from_slice(&u32::from(self.visible).to_le_bytes());
        out
    }

    /// Parse from wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        require_len(buf, Self::SIZE)?;
        Ok(Self {
            hotspot_x: u32_field!(buf, 0),
            hotspot_y: u32_field!(buf, 4),
            visible: u32_field!(buf, 8) != 0,
        })
    }
}

/// `MOVE_CURSOR` payload (8 bytes): new cursor position.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveCursor {
    /// New cursor X position.
    pub x: u32,
    /// New cursor Y position.
    pub y: u32,
}

impl MoveCursor {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.x.to_le_bytes());
        out.extend_from_slice(&self.y.to_le_bytes());
        out
    }

    /// Parse from wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        require_len(buf, Self::SIZE)?;
        Ok(Self {
            x: u32_field!(buf, 0),
            y: u32_field!(buf, 4),
        })
    }
}

/// `BLANK_DISPLAY` payload (4 bytes).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlankDisplay {
    /// Why the display is being blanked or unblanked.
    pub reason: BlankReason,
}

impl BlankDisplay {
    /// Encoded size in bytes.
    pub const SIZE: usize = 4;

    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        (self.reason as u32).to_le_bytes().to_vec()
    }

    /// Parse from wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        require_len(buf, Self::SIZE)?;
        Ok(Self {
            reason: BlankReason::try_from(u32_field!(buf, 0))?,
        })
    }
}

/// A raw dirty-rectangle record (16 bytes, no header or footer — this is
/// the one packet kind carried unframed on its own channel).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRect {
    /// X origin of the changed region.
    pub x: u32,
    /// Y origin of the changed region.
    pub y: u32,
    /// Width of the changed region.
    pub w: u32,
    /// Height of the changed region.
    pub h: u32,
}

impl DirtyRect {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// A rectangle covering the whole display, used when the dirty-rect
    /// ring is near overflow.
    #[must_use]
    pub fn full_screen(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            w: width,
            h: height,
        }
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..8].copy_from_slice(&self.y.to_le_bytes());
        out[8..12].copy_from_slice(&self.w.to_le_bytes());
        out[12..16].copy_from_slice(&self.h.to_le_bytes());
        out
    }

    /// Parse from wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        require_len(buf, Self::SIZE)?;
        Ok(Self {
            x: u32_field!(buf, 0),
            y: u32_field!(buf, 4),
            w: u32_field!(buf, 8),
            h: u32_field!(buf, 12),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_ranges() {
        assert!(PacketType::DriverCapabilities.is_control());
        assert!(!PacketType::DriverCapabilities.is_event());
        assert!(PacketType::SetDisplay.is_event());
        assert!(!PacketType::SetDisplay.is_control());
    }

    #[test]
    fn unknown_type_rejected() {
        assert_eq!(
            PacketType::try_from(42),
            Err(ProtocolError::UnknownType(42))
        );
    }

    #[test]
    fn driver_capabilities_round_trip() {
        let caps = DriverCapabilities {
            max_displays: 4,
            version: 0x0000_0001,
            capabilities: capability::RESIZE | capability::HOTPLUG,
            reserved: 0,
        };
        let bytes = caps.encode();
        assert_eq!(bytes.len(), DriverCapabilities::SIZE);
        assert_eq!(DriverCapabilities::decode(&bytes).unwrap(), caps);
    }

    #[test]
    fn add_display_round_trip_and_required_ports() {
        let req = AddDisplayRequest {
            key: 1,
            event_port: 1100,
            framebuffer_port: 1101,
            dirty_rectangles_port: 1102,
            cursor_bitmap_port: 1103,
        };
        assert!(req.has_required_ports());
        let bytes = req.encode();
        assert_eq!(AddDisplayRequest::decode(&bytes).unwrap(), req);

        let missing = AddDisplayRequest {
            event_port: 0,
            ..req
        };
        assert!(!missing.has_required_ports());
    }

    #[test]
    fn display_list_round_trip() {
        let list = DisplayList {
            displays: vec![
                DisplayInfo {
                    key: 1,
                    x: 0,
                    y: 0,
                    w: 1920,
                    h: 1080,
                },
                DisplayInfo {
                    key: 2,
                    x: 1920,
                    y: 0,
                    w: 1280,
                    h: 720,
                },
            ],
        };
        let bytes = list.encode();
        assert_eq!(DisplayList::decode(&bytes).unwrap(), list);
    }

    #[test]
    fn empty_display_list_round_trips() {
        let list = DisplayList::default();
        let bytes = list.encode();
        assert_eq!(DisplayList::decode(&bytes).unwrap(), list);
    }

    #[test]
    fn set_display_move_cursor_update_cursor_blank_round_trip() {
        let sd = SetDisplay {
            width: 1920,
            height: 1080,
            stride: 1920 * 4,
        };
        assert_eq!(SetDisplay::decode(&sd.encode()).unwrap(), sd);

        let mc = MoveCursor { x: 10, y: 20 };
        assert_eq!(MoveCursor::decode(&mc.encode()).unwrap(), mc);

        let uc = UpdateCursor {
            hotspot_x: 3,
            hotspot_y: 4,
            visible: true,
        };
        assert_eq!(UpdateCursor::decode(&uc.encode()).unwrap(), uc);

        let bd = BlankDisplay {
            reason: BlankReason::from_flags(true, true),
        };
        assert_eq!(bd.reason, BlankReason::Sleep);
        assert_eq!(BlankDisplay::decode(&bd.encode()).unwrap(), bd);
    }

    #[test]
    fn blank_reason_table() {
        assert_eq!(BlankReason::from_flags(true, true), BlankReason::Sleep);
        assert_eq!(BlankReason::from_flags(true, false), BlankReason::Wake);
        assert_eq!(
            BlankReason::from_flags(false, true),
            BlankReason::FillEnable
        );
        assert_eq!(
            BlankReason::from_flags(false, false),
            BlankReason::FillDisable
        );
    }

    #[test]
    fn dirty_rect_round_trip() {
        let r = DirtyRect {
            x: 10,
            y: 10,
            w: 100,
            h: 100,
        };
        assert_eq!(DirtyRect::decode(&r.encode()).unwrap(), r);
        assert_eq!(DirtyRect::full_screen(1920, 1080).w, 1920);
    }
}
