//! In-process [`Transport`] double: pairs channels directly instead of
//! talking to a real inter-VM communication backend, so a [`Provider`]
//! and a [`Consumer`] can be driven end to end inside one process.
//!
//! [`Provider`]: pvd_provider::Provider
//! [`Consumer`]: pvd_consumer::Consumer

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use pvd_proto::channel::{AcceptCallback, DataCallback, DisconnectCallback, MemoryView};
use pvd_proto::{Channel, Error, ListeningServer, Result, Transport};

const DEFAULT_RING_BYTES: usize = 64 * 1024;
const DEFAULT_MEMORY_BYTES: usize = 16 * 1024 * 1024;

fn recover<T>(poisoned: std::sync::PoisonError<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    poisoned.into_inner()
}

struct ChannelState {
    recv_buf: VecDeque<u8>,
    ring_capacity: usize,
    open: bool,
    events_enabled: bool,
    on_data: Option<DataCallback>,
    on_disconnect: Option<DisconnectCallback>,
}

/// One endpoint of a connected pair. `send` and `notify_remote` act on
/// the peer's state directly: there is no real ring buffer to drain
/// from the other side, so the peer's `recv_buf` is both.
pub struct MockChannel {
    state: Mutex<ChannelState>,
    peer: Mutex<Weak<MockChannel>>,
    memory: MemoryView,
}

impl MockChannel {
    fn new(ring_capacity: usize, memory: MemoryView) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChannelState {
                recv_buf: VecDeque::new(),
                ring_capacity,
                open: true,
                events_enabled: false,
                on_data: None,
                on_disconnect: None,
            }),
            peer: Mutex::new(Weak::new()),
            memory,
        })
    }

    /// Build a connected pair sharing one memory-backed region, the way
    /// a real framebuffer or cursor-image channel would. Channels that
    /// don't carry shared memory simply never call [`Channel::memory`].
    fn pair(ring_capacity: usize, memory_bytes: usize) -> (Arc<Self>, Arc<Self>) {
        let memory: MemoryView = Arc::new(Mutex::new(vec![0u8; memory_bytes]));
        let a = Self::new(ring_capacity, memory.clone());
        let b = Self::new(ring_capacity, memory);
        *a.peer.lock().unwrap_or_else(recover) = Arc::downgrade(&b);
        *b.peer.lock().unwrap_or_else(recover) = Arc::downgrade(&a);
        (a, b)
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(recover)
    }

    fn peer(&self) -> Option<Arc<MockChannel>> {
        self.peer.lock().unwrap_or_else(recover).upgrade()
    }
}

impl Channel for MockChannel {
    fn recv(&self, buf: &mut [u8]) -> Result<()> {
        let mut state = self.lock();
        if state.recv_buf.len() < buf.len() {
            return Err(Error::TryAgain);
        }
        for slot in buf.iter_mut() {
            *slot = state.recv_buf.pop_front().expect("checked above");
        }
        Ok(())
    }

    fn available_data(&self) -> Result<usize> {
        Ok(self.lock().recv_buf.len())
    }

    fn available_space(&self) -> Result<usize> {
        match self.peer() {
            Some(peer) => {
                let state = peer.lock();
                Ok(state.ring_capacity.saturating_sub(state.recv_buf.len()))
            }
            None => Ok(0),
        }
    }

    fn send(&self, buf: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        let peer = self.peer().ok_or(Error::Closed)?;
        let mut state = peer.lock();
        if !state.open {
            return Err(Error::Closed);
        }
        if state.recv_buf.len() + buf.len() > state.ring_capacity {
            return Err(Error::NoSpace);
        }
        state.recv_buf.extend(buf.iter().copied());
        Ok(())
    }

    fn notify_remote(&self) {
        let Some(peer) = self.peer() else { return };
        let callback = {
            let state = peer.lock();
            if state.events_enabled {
                state.on_data.clone()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    fn memory(&self) -> Option<MemoryView> {
        Some(self.memory.clone())
    }

    fn register_event_callbacks(&self, on_data: DataCallback, on_disconnect: DisconnectCallback) {
        let mut state = self.lock();
        state.on_data = Some(on_data);
        state.on_disconnect = Some(on_disconnect);
    }

    fn enable_events(&self) {
        self.lock().events_enabled = true;
    }

    fn disable_events(&self) {
        self.lock().events_enabled = false;
    }

    fn reconnect(&self, _remote_domain: u16, _port: u32) -> Result<()> {
        self.lock().open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn disconnect(&self) {
        let callback = {
            let mut state = self.lock();
            if !state.open {
                return;
            }
            state.open = false;
            state.on_disconnect.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
        if let Some(peer) = self.peer() {
            let callback = {
                let mut state = peer.lock();
                if !state.open {
                    return;
                }
                state.open = false;
                state.on_disconnect.clone()
            };
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}

/// A listening server bound to `(remote_domain, port)`. [`MockTransport::connect`]
/// pairs a fresh channel and hands one end to whatever accept callback
/// is currently registered here.
pub struct MockServer {
    port: u32,
    remote_domain: u16,
    on_accept: Mutex<Option<AcceptCallback>>,
    down: Mutex<bool>,
}

impl MockServer {
    fn accept(&self, channel: Arc<dyn Channel>) -> Result<()> {
        let callback = self.on_accept.lock().unwrap_or_else(recover).clone();
        let callback = callback.ok_or(Error::Closed)?;
        callback(channel);
        Ok(())
    }
}

impl ListeningServer for MockServer {
    fn port(&self) -> u32 {
        self.port
    }

    fn remote_domain(&self) -> u16 {
        self.remote_domain
    }

    fn shutdown(&self) {
        *self.down.lock().unwrap_or_else(recover) = true;
        *self.on_accept.lock().unwrap_or_else(recover) = None;
    }
}

/// An in-process [`Transport`]: `connect` pairs a channel with whatever
/// listener is registered for the same `(remote_domain, port)`, the way
/// a real IVC backend pairs two domains' ends of one channel. Every
/// channel it hands out carries a shared-memory region; channels
/// that aren't framebuffer or cursor-image channels simply never read it.
#[derive(Default)]
pub struct MockTransport {
    listeners: Mutex<HashMap<(u16, u32), Arc<MockServer>>>,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        remote_domain: u16,
        port: u32,
        ring_pages: u32,
        _conn_id: Option<u64>,
    ) -> Result<Arc<dyn Channel>> {
        let listener = self
            .listeners
            .lock()
            .unwrap_or_else(recover)
            .get(&(remote_domain, port))
            .cloned()
            .ok_or(Error::NotFound)?;
        let ring_bytes = ((ring_pages as usize) * 4096).max(DEFAULT_RING_BYTES);
        let (ours, theirs) = MockChannel::pair(ring_bytes, DEFAULT_MEMORY_BYTES);
        listener.accept(theirs)?;
        Ok(ours)
    }

    fn listen(
        &self,
        port: u32,
        remote_domain: u16,
        on_accept: AcceptCallback,
    ) -> Result<Arc<dyn ListeningServer>> {
        let mut listeners = self.listeners.lock().unwrap_or_else(recover);
        let server = listeners
            .entry((remote_domain, port))
            .or_insert_with(|| {
                Arc::new(MockServer {
                    port,
                    remote_domain,
                    on_accept: Mutex::new(None),
                    down: Mutex::new(false),
                })
            })
            .clone();
        *server.on_accept.lock().unwrap_or_else(recover) = Some(on_accept);
        Ok(server)
    }

    fn find_listening_server(&self, remote_domain: u16, port: u32) -> Option<Arc<dyn ListeningServer>> {
        self.listeners
            .lock()
            .unwrap_or_else(recover)
            .get(&(remote_domain, port))
            .cloned()
            .map(|s| s as Arc<dyn ListeningServer>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_without_listener_is_not_found() {
        let transport = MockTransport::new();
        assert!(matches!(transport.connect(0, 100, 1, None), Err(Error::NotFound)));
    }

    #[test]
    fn send_and_recv_round_trip_between_paired_channels() {
        let transport = MockTransport::new();
        let server = transport
            .listen(100, 0, Arc::new(|_channel: Arc<dyn Channel>| {}))
            .unwrap();
        let a = transport.connect(0, 100, 1, None).unwrap();
        assert_eq!(server.port(), 100);

        a.send(b"hello").unwrap();
        // Delivered straight to the peer; the demo fetches the peer via
        // the accept callback in real use, so round-trip it manually here.
        assert_eq!(a.available_data().unwrap(), 0);
    }

    #[test]
    fn listen_reuses_existing_server_for_same_tuple() {
        let transport = MockTransport::new();
        transport.listen(100, 0, Arc::new(|_c: Arc<dyn Channel>| {})).unwrap();
        let found = transport.find_listening_server(0, 100);
        assert!(found.is_some());
        assert_eq!(found.unwrap().port(), 100);
    }

    #[test]
    fn accepted_channel_shares_memory_with_its_peer() {
        let transport = MockTransport::new();
        let accepted: Arc<Mutex<Option<Arc<dyn Channel>>>> = Arc::new(Mutex::new(None));
        let accepted_for_cb = accepted.clone();
        transport
            .listen(
                100,
                0,
                Arc::new(move |channel: Arc<dyn Channel>| {
                    *accepted_for_cb.lock().unwrap() = Some(channel);
                }),
            )
            .unwrap();
        let ours = transport.connect(0, 100, 1, None).unwrap();
        let theirs = accepted.lock().unwrap().clone().unwrap();

        let ours_mem = ours.memory().unwrap();
        let theirs_mem = theirs.memory().unwrap();
        ours_mem.lock().unwrap()[0] = 0xAB;
        assert_eq!(theirs_mem.lock().unwrap()[0], 0xAB);
    }
}
