//! The partial-read state machine: one instance per control-or-event
//! receive channel, driven by the transport's "data available" callback.

use std::sync::Mutex;

use pvd_proto::wire::{checksum, PacketFooter, PacketHeader, FOOTER_SIZE, HEADER_SIZE};
use pvd_proto::{Channel, Error};

use crate::fatal::FatalCause;

/// Outcome of a single [`PartialReadReceiver::on_data_available`] pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// One or more packets were dispatched before the channel ran dry.
    Dispatched {
        /// How many complete packets were handed to `on_packet`.
        count: usize,
    },
    /// Nothing new: either no bytes were available, or the header slot
    /// is waiting on more payload bytes than are currently buffered.
    Idle,
    /// A fatal condition was raised; the caller's `on_fatal` already ran.
    Fatal,
}

/// Per-channel receive state: a single header slot, valid iff it holds
/// `Some`. An empty slot means no packet receive is currently in
/// progress; this is modeled as `None` rather than a zero-length
/// sentinel header.
#[derive(Default)]
pub struct PartialReadReceiver {
    current_header: Mutex<Option<PacketHeader>>,
}

impl PartialReadReceiver {
    /// A receiver with no packet in progress.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current_header: Mutex::new(None),
        }
    }

    /// Whether a header has been read and is awaiting its payload.
    #[must_use]
    pub fn has_pending_header(&self) -> bool {
        self.lock().is_some()
    }

    /// Drive one "data available" callback to completion.
    ///
    /// Loops reading complete packets until a step would block (not
    /// enough bytes buffered yet) or a fatal condition is hit. `on_packet`
    /// is called once per complete, CRC-valid packet, *while this
    /// receiver's internal lock is held*, so concurrent callbacks for the
    /// same channel serialize and packets are dispatched in arrival order.
    ///
    /// `on_fatal` is called, and this method returns, the first time a
    /// bad magic, bad CRC, or transport query failure is observed. It is
    /// called *after* the lock is released, so no lock is held across a
    /// callback invocation into caller-supplied handler code.
    pub fn on_data_available<C, OnPacket, OnFatal>(
        &self,
        channel: &C,
        mut on_packet: OnPacket,
        on_fatal: OnFatal,
    ) -> PumpOutcome
    where
        C: Channel + ?Sized,
        OnPacket: FnMut(PacketHeader, Vec<u8>),
        OnFatal: FnOnce(FatalCause),
    {
        let mut dispatched = 0usize;
        let mut fatal_cause = None;

        {
            let mut slot = self.lock();
            loop {
                if slot.is_none() {
                    let mut header_buf = [0u8; HEADER_SIZE];
                    match channel.recv(&mut header_buf) {
                        Ok(()) => {
                            let header = PacketHeader::from_bytes(&header_buf);
                            if let Err(e) = header.validate() {
                                fatal_cause = Some(FatalCause::Protocol(e));
                                break;
                            }
                            *slot = Some(header);
                            // Loop again: the payload may already be buffered.
                        }
                        Err(_) => break, // short read: wait for next callback
                    }
                } else {
                    let header = slot.expect("checked above");
                    let available = match channel.available_data() {
                        Ok(n) => n,
                        Err(e) => {
                            fatal_cause = Some(FatalCause::Transport(format!(
                                "getAvailableData failed: {e}"
                            )));
                            break;
                        }
                    };
                    let needed = header.length as usize + FOOTER_SIZE;
                    if available < needed {
                        break; // wait for more bytes
                    }

                    let mut buf = Vec::new();
                    if buf.try_reserve_exact(needed).is_err() {
                        // Allocation failure here is non-fatal.
                        // The slot stays populated; the transport still
                        // has the bytes buffered, so the next callback
                        // retries this same packet.
                        tracing::warn!(
                            needed,
                            "payload allocation failed, retrying on next callback"
                        );
                        break;
                    }
                    buf.resize(needed, 0);

                    match channel.recv(&mut buf) {
                        Ok(()) => {
                            let length = header.length as usize;
                            let payload = buf[..length].to_vec();
                            let footer = PacketFooter::from_bytes(&buf[length..]);
                            let header_bytes = header.to_bytes();
                            let expected = checksum(&[&header_bytes, &payload]);

                            *slot = None;

                            if footer.crc != expected {
                                fatal_cause = Some(FatalCause::Protocol(
                                    pvd_proto::ProtocolError::BadChecksum,
                                ));
                                break;
                            }

                            on_packet(header, payload);
                            dispatched += 1;
                            // Loop again: another full packet may already
                            // be buffered behind this one.
                        }
                        Err(_) => break, // footer/payload not fully there yet
                    }
                }
            }
        } // lock released here, before on_fatal runs

        if let Some(cause) = fatal_cause {
            on_fatal(cause);
            return PumpOutcome::Fatal;
        }

        if dispatched > 0 {
            PumpOutcome::Dispatched { count: dispatched }
        } else {
            PumpOutcome::Idle
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PacketHeader>> {
        self.current_header.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("partial-read receiver mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvd_proto::wire::encode;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// A fake channel whose `recv` hands back bytes from a queue of
    /// pre-scheduled chunks, one chunk per call, simulating arbitrary
    /// partitioning of the underlying byte stream across callbacks.
    struct FakeChannel {
        chunks: RefCell<VecDeque<Vec<u8>>>,
        buffered: RefCell<Vec<u8>>,
        fail_available: bool,
    }

    impl FakeChannel {
        fn new(stream: &[u8], chunk_size: usize) -> Self {
            let mut chunks = VecDeque::new();
            for chunk in stream.chunks(chunk_size) {
                chunks.push_back(chunk.to_vec());
            }
            Self {
                chunks: RefCell::new(chunks),
                buffered: RefCell::new(Vec::new()),
                fail_available: false,
            }
        }
    }

    impl Channel for FakeChannel {
        fn recv(&self, buf: &mut [u8]) -> pvd_proto::Result<()> {
            // Pull chunks into the buffer until we have enough, or run dry.
            while self.buffered.borrow().len() < buf.len() {
                match self.chunks.borrow_mut().pop_front() {
                    Some(chunk) => self.buffered.borrow_mut().extend_from_slice(&chunk),
                    None => return Err(Error::TryAgain),
                }
            }
            let mut buffered = self.buffered.borrow_mut();
            buf.copy_from_slice(&buffered[..buf.len()]);
            buffered.drain(..buf.len());
            Ok(())
        }

        fn available_data(&self) -> pvd_proto::Result<usize> {
            if self.fail_available {
                return Err(Error::Transport("boom".into()));
            }
            let buffered_len = self.buffered.borrow().len();
            let queued_len: usize = self.chunks.borrow().iter().map(Vec::len).sum();
            Ok(buffered_len + queued_len)
        }

        fn available_space(&self) -> pvd_proto::Result<usize> {
            Ok(4096)
        }

        fn send(&self, _buf: &[u8]) -> pvd_proto::Result<()> {
            Ok(())
        }

        fn notify_remote(&self) {}

        fn register_event_callbacks(
            &self,
            _on_data: pvd_proto::channel::DataCallback,
            _on_disconnect: pvd_proto::channel::DisconnectCallback,
        ) {
        }

        fn enable_events(&self) {}
        fn disable_events(&self) {}

        fn reconnect(&self, _remote_domain: u16, _port: u32) -> pvd_proto::Result<()> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }

        fn disconnect(&self) {}
    }

    #[test]
    fn single_byte_chunks_yield_one_dispatch() {
        let bytes = encode(101, b"hello").unwrap();
        let channel = FakeChannel::new(&bytes, 1);
        let receiver = PartialReadReceiver::new();

        let mut dispatches = Vec::new();
        loop {
            let outcome = receiver.on_data_available(
                &channel,
                |header, payload| dispatches.push((header.pkt_type, payload)),
                |cause| panic!("unexpected fatal: {cause:?}"),
            );
            if outcome == PumpOutcome::Idle {
                break;
            }
        }

        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].0, 101);
        assert_eq!(dispatches[0].1, b"hello");
    }

    #[test]
    fn arbitrary_chunking_yields_exactly_one_dispatch_per_packet() {
        for chunk_size in [1usize, 2, 3, 5, 7, 64, 4096] {
            let mut stream = encode(101, b"first").unwrap();
            stream.extend(encode(102, b"second!!").unwrap());
            let channel = FakeChannel::new(&stream, chunk_size);
            let receiver = PartialReadReceiver::new();

            let mut dispatches = Vec::new();
            loop {
                let outcome = receiver.on_data_available(
                    &channel,
                    |header, payload| dispatches.push((header.pkt_type, payload)),
                    |cause| panic!("unexpected fatal: {cause:?}"),
                );
                if outcome == PumpOutcome::Idle {
                    break;
                }
            }

            assert_eq!(dispatches.len(), 2, "chunk_size={chunk_size}");
            assert_eq!(dispatches[0].1, b"first");
            assert_eq!(dispatches[1].1, b"second!!");
        }
    }

    #[test]
    fn partial_header_never_advances_state() {
        let bytes = encode(103, &[1, 2, 3, 4]).unwrap();
        // Hand back only the first byte of the header, forever.
        let channel = FakeChannel::new(&bytes[..1], 1);
        let receiver = PartialReadReceiver::new();

        let outcome = receiver.on_data_available(
            &channel,
            |_h, _p| panic!("must not dispatch on a short header"),
            |cause| panic!("unexpected fatal: {cause:?}"),
        );
        assert_eq!(outcome, PumpOutcome::Idle);
        assert!(!receiver.has_pending_header());
    }

    #[test]
    fn bad_magic_triggers_fatal_exactly_once() {
        let mut bytes = encode(101, &[0, 1, 2, 3]).unwrap();
        bytes[0] ^= 0xFF;
        let channel = FakeChannel::new(&bytes, 4096);
        let receiver = PartialReadReceiver::new();

        let mut fatal_count = 0;
        let outcome = receiver.on_data_available(
            &channel,
            |_h, _p| panic!("must not dispatch past a bad magic"),
            |cause| {
                fatal_count += 1;
                assert!(matches!(
                    cause,
                    FatalCause::Protocol(pvd_proto::ProtocolError::BadMagic)
                ));
            },
        );
        assert_eq!(outcome, PumpOutcome::Fatal);
        assert_eq!(fatal_count, 1);
    }

    #[test]
    fn crc_flip_triggers_fatal_and_no_dispatch() {
        let mut bytes = encode(101, &[9, 9, 9, 9]).unwrap();
        let payload_offset = HEADER_SIZE;
        bytes[payload_offset] ^= 0x01;
        let channel = FakeChannel::new(&bytes, 4096);
        let receiver = PartialReadReceiver::new();

        let mut fatal_count = 0;
        let outcome = receiver.on_data_available(
            &channel,
            |_h, _p| panic!("must not dispatch a CRC-corrupt packet"),
            |cause| {
                fatal_count += 1;
                assert!(matches!(
                    cause,
                    FatalCause::Protocol(pvd_proto::ProtocolError::BadChecksum)
                ));
            },
        );
        assert_eq!(outcome, PumpOutcome::Fatal);
        assert_eq!(fatal_count, 1);
    }

    #[test]
    fn available_data_failure_is_fatal() {
        let bytes = encode(101, &[1, 2]).unwrap();
        let mut channel = FakeChannel::new(&bytes, 4096);
        channel.fail_available = true;
        let receiver = PartialReadReceiver::new();

        // First pump reads the header successfully, then tries to check
        // available bytes for the payload and observes the failure.
        let mut fatal_count = 0;
        let outcome = receiver.on_data_available(
            &channel,
            |_h, _p| panic!("must not dispatch"),
            |cause| {
                fatal_count += 1;
                assert!(matches!(cause, FatalCause::Transport(_)));
            },
        );
        assert_eq!(outcome, PumpOutcome::Fatal);
        assert_eq!(fatal_count, 1);
    }
}
