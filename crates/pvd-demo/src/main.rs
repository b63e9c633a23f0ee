//! Runs the display handler handshake against the in-process mock
//! transport and logs each step, as a smoke test an engineer can run by
//! hand without any real inter-VM communication backend or guest.
//!
//! The protocol core has no async runtime — it's multi-threaded with
//! blocking mutexes — so this one is plain synchronous `fn main`.

use anyhow::Context;
use pvd_demo::Harness;
use pvd_proto::types::DisplayInfo;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let harness = Harness::start().context("failed to start provider/consumer harness")?;

    let caps = harness
        .run_capability_handshake()
        .context("capability handshake failed")?;
    tracing::info!(
        max_displays = caps.max_displays,
        version = caps.version,
        "capability handshake complete"
    );

    let display = DisplayInfo {
        key: 1,
        x: 0,
        y: 0,
        w: 1920,
        h: 1080,
    };
    let backend = harness
        .run_add_display(display)
        .context("host display list -> add display sequence failed")?;
    tracing::info!(
        key = backend.key(),
        framebuffer = backend.framebuffer_memory().is_some(),
        cursor = backend.cursor_memory().is_some(),
        "display connected"
    );

    harness
        .run_teardown(display.key)
        .context("graceful teardown failed")?;
    tracing::info!(key = display.key, "display torn down");

    Ok(())
}
