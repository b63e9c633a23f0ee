//! Wires one [`Provider`] and one [`Consumer`] together over
//! [`MockTransport`] and drives the startup sequence end to end:
//! capability handshake, host display list → add → four-channel
//! connect, and graceful teardown.

use std::sync::{Arc, Mutex};

use pvd_consumer::{Consumer, ConnectionId, DisplayBackend};
use pvd_core::RingSizes;
use pvd_proto::types::{AddDisplayRequest, DisplayInfo, DriverCapabilities};
use pvd_proto::Result;
use pvd_provider::{DisplayGeometry, Provider};

use crate::transport::MockTransport;

/// The domain id the mock transport uses for both ends; a real
/// deployment would have the guest's actual domid here instead.
pub const REMOTE_DOMAIN: u16 = 7;
/// The well-known control port both sides agree on out of band.
pub const CONTROL_PORT: u32 = 5900;

/// A provider and consumer wired together over an in-process transport,
/// plus the bits of state a driver needs to keep around between scenario
/// steps (the capability values last observed, the control connection
/// id the provider was accepted on).
pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub consumer: Arc<Consumer>,
    pub provider: Arc<Provider>,
    connection_id: Arc<Mutex<Option<ConnectionId>>>,
    observed_capabilities: Arc<Mutex<Option<DriverCapabilities>>>,
}

impl Harness {
    /// Start the consumer listening, then connect the provider to it.
    /// Every `ADD_DISPLAY` this harness's `on_advertised_list` handler
    /// originates requests all four channels on fixed, distinct ports.
    pub fn start() -> Result<Self> {
        let transport = MockTransport::new();

        let consumer = Consumer::new(transport.clone(), CONTROL_PORT, REMOTE_DOMAIN)?;
        let connection_id: Arc<Mutex<Option<ConnectionId>>> = Arc::new(Mutex::new(None));
        let observed_capabilities: Arc<Mutex<Option<DriverCapabilities>>> = Arc::new(Mutex::new(None));

        let consumer_for_new_conn = consumer.clone();
        let connection_id_for_new_conn = connection_id.clone();
        consumer.on_new_control_connection(Arc::new(move |id| {
            *connection_id_for_new_conn.lock().unwrap() = Some(id);
            if let Err(e) = consumer_for_new_conn.finish_control_connection(id, REMOTE_DOMAIN) {
                tracing::error!(error = %e, "failed to finish control connection");
            }
        }));

        let observed_capabilities_for_handler = observed_capabilities.clone();
        consumer.on_driver_capabilities(Arc::new(move |_id, caps| {
            tracing::info!(?caps, "driver capabilities received");
            *observed_capabilities_for_handler.lock().unwrap() = Some(caps);
        }));

        consumer.on_advertised_list(Arc::new(|_id, displays: &[DisplayInfo]| {
            displays
                .iter()
                .map(|d| AddDisplayRequest {
                    key: d.key,
                    event_port: 6000 + d.key * 10,
                    framebuffer_port: 6001 + d.key * 10,
                    dirty_rectangles_port: 6002 + d.key * 10,
                    cursor_bitmap_port: 6003 + d.key * 10,
                })
                .collect()
        }));

        consumer.on_display_no_longer_available(Arc::new(|_id, key| {
            tracing::info!(key, "provider reported display no longer available");
        }));

        let provider = Provider::new(transport.clone(), REMOTE_DOMAIN, CONTROL_PORT, None, RingSizes::default())?;

        provider.on_host_display_change(Arc::new(|displays: &[DisplayInfo]| {
            tracing::info!(?displays, "host display list changed");
        }));
        provider.on_add_display(Arc::new(|_key: u32| {
            Some(DisplayGeometry {
                width: 1920,
                height: 1080,
                stride: 1920 * 4,
                initial_contents: None,
            })
        }));
        provider.on_remove_display(Arc::new(|key: u32| {
            tracing::info!(key, "host requested display removal");
        }));

        Ok(Self {
            transport,
            consumer,
            provider,
            connection_id,
            observed_capabilities,
        })
    }

    /// The control connection the provider was accepted on, once
    /// [`Harness::start`] has run (it always has, by the time `start`
    /// returns, since the mock transport's `notify_remote` is
    /// synchronous).
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id.lock().unwrap().expect("provider connects during Harness::start")
    }

    /// Scenario 1: capability handshake. Returns the capabilities the
    /// consumer's handler observed.
    pub fn run_capability_handshake(&self) -> Result<DriverCapabilities> {
        self.provider.advertise_capabilities(4, 1)?;
        Ok(self
            .observed_capabilities
            .lock()
            .unwrap()
            .expect("handshake dispatches synchronously"))
    }

    /// Scenario 2: host display list → advertise → add → four-channel
    /// connect, all the way to the display's backend existing and its
    /// framebuffer memory being reachable.
    pub fn run_add_display(&self, display: DisplayInfo) -> Result<Arc<DisplayBackend>> {
        let id = self.connection_id();
        self.consumer.publish_host_display_list(id, &[display])?;
        self.provider.advertise_displays(&[display])?;
        Ok(self
            .consumer
            .backend(display.key)
            .expect("create_backend runs synchronously inside advertise_displays"))
    }

    /// Scenario 6: graceful teardown. Issues `DISPLAY_NO_LONGER_AVAILABLE`
    /// and disconnects all four of the display's channels.
    pub fn run_teardown(&self, key: u32) -> Result<()> {
        self.provider.destroy_display(key)
    }
}
