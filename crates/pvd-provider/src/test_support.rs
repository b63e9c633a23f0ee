//! An in-memory [`Channel`] double used only by this crate's unit tests.
//!
//! Mirrors the shape of `pvd-demo`'s end-to-end mock transport but stays
//! local to `pvd-provider` so its unit tests don't need a path dependency
//! on the demo binary.

use std::sync::{Arc, Mutex};

use pvd_proto::channel::{DataCallback, DisconnectCallback, MemoryView};
use pvd_proto::{Channel, Error, Result};

struct MockState {
    open: bool,
    sent: Vec<Vec<u8>>,
    notify_count: usize,
    available_space: usize,
    memory: Option<MemoryView>,
}

/// A `Channel` that records every `send` call and reports a
/// caller-controlled amount of free send space, instead of talking to a
/// real transport.
pub struct MockChannel {
    state: Mutex<MockState>,
}

impl MockChannel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                open: true,
                sent: Vec::new(),
                notify_count: 0,
                available_space: 4096,
                memory: None,
            }),
        }
    }

    #[must_use]
    pub fn with_memory(size: usize) -> Self {
        let mut channel = Self::new();
        channel.state.get_mut().unwrap().memory = Some(Arc::new(Mutex::new(vec![0u8; size])));
        channel
    }

    pub fn set_available_space(&self, n: usize) {
        self.state.lock().unwrap().available_space = n;
    }

    #[must_use]
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    #[must_use]
    pub fn notify_count(&self) -> usize {
        self.state.lock().unwrap().notify_count
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for MockChannel {
    fn recv(&self, _buf: &mut [u8]) -> Result<()> {
        Err(Error::TryAgain)
    }

    fn available_data(&self) -> Result<usize> {
        Ok(0)
    }

    fn available_space(&self) -> Result<usize> {
        Ok(self.state.lock().unwrap().available_space)
    }

    fn send(&self, buf: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(Error::Closed);
        }
        state.sent.push(buf.to_vec());
        Ok(())
    }

    fn notify_remote(&self) {
        self.state.lock().unwrap().notify_count += 1;
    }

    fn memory(&self) -> Option<MemoryView> {
        self.state.lock().unwrap().memory.clone()
    }

    fn register_event_callbacks(&self, _on_data: DataCallback, _on_disconnect: DisconnectCallback) {}

    fn enable_events(&self) {}
    fn disable_events(&self) {}

    fn reconnect(&self, _remote_domain: u16, _port: u32) -> Result<()> {
        self.state.lock().unwrap().open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn disconnect(&self) {
        self.state.lock().unwrap().open = false;
    }
}
