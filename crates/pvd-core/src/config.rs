//! Ring-size configuration: how many pages each channel's IVC ring buffer
//! is allocated with.
//!
//! The protocol itself persists no state, but an embedder needs to tune
//! ring pressure without touching code, so this is TOML-deserialized with
//! `#[serde(default)]` plus a hand-written `Default` impl.

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSizes {
    /// Pages for the control channel ring. Default: 1.
    pub control_pages: u32,
    /// Pages for the per-display event channel ring. Default: 4.
    pub event_pages: u32,
    /// Pages for the per-display dirty-rectangle channel ring. Default: 32.
    pub dirty_rect_pages: u32,
}

impl Default for RingSizes {
    fn default() -> Self {
        Self {
            control_pages: 1,
            event_pages: 4,
            dirty_rect_pages: 32,
        }
    }
}

/// Size in bytes of a fixed 64x64 ARGB cursor image (256-byte stride).
pub const CURSOR_IMAGE_BYTES: u32 = 16384;

impl RingSizes {
    /// Pages needed for a framebuffer channel of `stride * height` bytes,
    /// rounded up, plus one page of transport metadata.
    #[must_use]
    pub fn framebuffer_pages(stride: u32, height: u32, page_size: u32) -> u32 {
        ceil_div(stride.saturating_mul(height), page_size) + 1
    }

    /// Pages needed for the fixed-size cursor-image channel.
    #[must_use]
    pub fn cursor_pages(page_size: u32) -> u32 {
        ceil_div(CURSOR_IMAGE_BYTES, page_size) + 1
    }
}

fn ceil_div(numerator: u32, denominator: u32) -> u32 {
    numerator.div_ceil(denominator)
}

/// Load ring sizes from a TOML file, falling back to [`RingSizes::default`]
/// if the file does not exist.
///
/// # Errors
/// Returns [`pvd_proto::Error::Transport`] if the file exists but cannot
/// be read, or cannot be parsed as the expected TOML shape.
#[cfg(feature = "serde")]
pub fn load(path: &std::path::Path) -> pvd_proto::Result<RingSizes> {
    use pvd_proto::Error;

    if !path.exists() {
        return Ok(RingSizes::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Transport(format!("failed to read ring-size config {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| Error::Transport(format!("failed to parse ring-size config {}: {e}", path.display())))
}

/// Save ring sizes to a TOML file, creating parent directories as needed.
///
/// # Errors
/// Returns [`pvd_proto::Error::Transport`] if the parent directory
/// cannot be created or the file cannot be written.
#[cfg(feature = "serde")]
pub fn save(sizes: &RingSizes, path: &std::path::Path) -> pvd_proto::Result<()> {
    use pvd_proto::Error;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Transport(format!("failed to create config dir {}: {e}", parent.display())))?;
    }

    let contents = toml::to_string_pretty(sizes)
        .map_err(|e| Error::Transport(format!("failed to serialize ring-size config: {e}")))?;

    std::fs::write(path, contents)
        .map_err(|e| Error::Transport(format!("failed to write ring-size config {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let sizes = RingSizes::default();
        assert_eq!(sizes.control_pages, 1);
        assert_eq!(sizes.event_pages, 4);
        assert_eq!(sizes.dirty_rect_pages, 32);
    }

    #[test]
    fn framebuffer_pages_rounds_up_and_adds_metadata_page() {
        let page_size = 4096;
        // 1920x1080 BGRA: stride 7680, height 1080 -> 8294400 bytes.
        let pages = RingSizes::framebuffer_pages(1920 * 4, 1080, page_size);
        let expected = (1920 * 4 * 1080u32).div_ceil(page_size) + 1;
        assert_eq!(pages, expected);
    }

    #[test]
    fn cursor_pages_matches_reference() {
        assert_eq!(RingSizes::cursor_pages(4096), 16384u32.div_ceil(4096) + 1);
        // A page size that doesn't divide evenly still rounds up.
        assert_eq!(RingSizes::cursor_pages(4000), 16384u32.div_ceil(4000) + 1);
    }
}

#[cfg(all(test, feature = "serde"))]
mod file_tests {
    use super::*;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("pvd-core-test-{name}-{:?}.toml", std::thread::current().id()))
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let path = scratch_path("missing");
        let _ = std::fs::remove_file(&path);
        assert_eq!(load(&path).unwrap(), RingSizes::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = scratch_path("roundtrip");
        let sizes = RingSizes {
            control_pages: 2,
            event_pages: 8,
            dirty_rect_pages: 64,
        };
        save(&sizes, &path).unwrap();
        assert_eq!(load(&path).unwrap(), sizes);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn load_malformed_file_is_a_transport_error() {
        let path = scratch_path("malformed");
        std::fs::write(&path, "not valid toml {{{").unwrap();
        assert!(matches!(load(&path), Err(pvd_proto::Error::Transport(_))));
        std::fs::remove_file(&path).unwrap();
    }
}
