//! In-memory [`Channel`]/[`ListeningServer`] doubles used only by this
//! crate's unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use pvd_proto::channel::{DataCallback, DisconnectCallback, MemoryView};
use pvd_proto::{Channel, Error, ListeningServer, Result};

struct MockState {
    open: bool,
    incoming: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
    notify_count: usize,
    available_space: usize,
    memory: Option<MemoryView>,
}

/// A `Channel` whose `recv` serves bytes pushed in by the test via
/// [`MockChannel::push_incoming`], mirroring a real IVC ring buffer
/// closely enough to exercise both the partial-read receiver and the
/// raw dirty-rectangle drain loop.
pub struct MockChannel {
    state: Mutex<MockState>,
}

impl MockChannel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                open: true,
                incoming: VecDeque::new(),
                sent: Vec::new(),
                notify_count: 0,
                available_space: 4096,
                memory: None,
            }),
        }
    }

    #[must_use]
    pub fn with_memory(size: usize) -> Self {
        let channel = Self::new();
        channel.state.lock().unwrap().memory = Some(Arc::new(Mutex::new(vec![0u8; size])));
        channel
    }

    pub fn push_incoming(&self, bytes: &[u8]) {
        self.state.lock().unwrap().incoming.extend(bytes.iter().copied());
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
    fn recv(&self, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.incoming.len() < buf.len() {
            return Err(Error::TryAgain);
        }
        for slot in buf.iter_mut() {
            *slot = state.incoming.pop_front().expect("checked above");
        }
        Ok(())
    }

    fn available_data(&self) -> Result<usize> {
        Ok(self.state.lock().unwrap().incoming.len())
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

/// A [`ListeningServer`] double bound to a fixed port, remote domain 0.
pub struct MockServer {
    port: u32,
    down: Mutex<bool>,
}

impl MockServer {
    #[must_use]
    pub fn new(port: u32) -> Self {
        Self {
            port,
            down: Mutex::new(false),
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.down.lock().unwrap()
    }
}

impl ListeningServer for MockServer {
    fn port(&self) -> u32 {
        self.port
    }

    fn remote_domain(&self) -> u16 {
        0
    }

    fn shutdown(&self) {
        *self.down.lock().unwrap() = true;
    }
}
