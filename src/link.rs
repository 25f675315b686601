// Emulated CDC link. The byte transport sits behind the `CdcLink` trait:
// the TCP implementation serves host tooling over a local socket, and the
// in-memory loopback implementation lets tests drive the pump directly.
// One client at a time; the link thread plays the "USB IRQ" role: it is
// the sole producer of the RX ring and the sole consumer of the TX ring.
// With no client attached the TX ring is drained and dropped so the
// control loop never backs up.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::fabric::event::{LinkEnds, RxChunk, RX_CHUNK_BYTES};
use crate::fabric::state::SharedState;

/// Outcome of one transport read.
pub enum LinkRead {
    Data(usize),
    Idle,
    Closed,
}

/// Byte-level CDC transport contract: non-blocking-ish chunk read,
/// chunked write, explicit flush.
pub trait CdcLink: Send {
    fn read_chunk(&mut self, buf: &mut [u8]) -> LinkRead;
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), String>;
    fn flush(&mut self) -> Result<(), String>;
}

/// One pump pass: move inbound bytes into the RX ring, drain the TX ring
/// to the transport. Returns false when the transport is gone.
pub fn service_link(link: &mut dyn CdcLink, ends: &LinkEnds) -> bool {
    let mut buf = [0u8; RX_CHUNK_BYTES];
    match link.read_chunk(&mut buf) {
        LinkRead::Closed => return false,
        LinkRead::Idle => {}
        LinkRead::Data(n) => {
            // Full RX ring drops the chunk; the drop counter records it.
            let _ = ends.usb_rx_tx.post(RxChunk::from_slice(&buf[..n]));
        }
    }

    let mut wrote = false;
    let mut flush = false;
    while let Some(msg) = ends.usb_tx_rx.get() {
        if link.write_all(msg.as_slice()).is_err() {
            return false;
        }
        wrote = true;
        flush |= msg.flush;
    }
    if wrote && flush && link.flush().is_err() {
        return false;
    }
    true
}

// ─────────────────────────────────────────────────────────────────────────────
//  TCP transport
// ─────────────────────────────────────────────────────────────────────────────

pub struct TcpCdc {
    stream: TcpStream,
}

impl TcpCdc {
    fn new(stream: TcpStream) -> Result<Self, String> {
        stream
            .set_read_timeout(Some(Duration::from_millis(1)))
            .map_err(|e| format!("set_read_timeout: {e}"))?;
        let _ = stream.set_nodelay(true);
        Ok(Self { stream })
    }
}

impl CdcLink for TcpCdc {
    fn read_chunk(&mut self, buf: &mut [u8]) -> LinkRead {
        match self.stream.read(buf) {
            Ok(0) => LinkRead::Closed,
            Ok(n) => LinkRead::Data(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                LinkRead::Idle
            }
            Err(e) => {
                log::warn!("link read failed: {e}");
                LinkRead::Closed
            }
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), String> {
        self.stream.write_all(bytes).map_err(|e| format!("{e}"))
    }

    fn flush(&mut self) -> Result<(), String> {
        self.stream.flush().map_err(|e| format!("{e}"))
    }
}

/// Bind the listener and spawn the link thread. Returns the bound port
/// (useful when asked for port 0).
pub fn spawn_tcp_link(
    port: u16,
    ends: LinkEnds,
    state: Arc<SharedState>,
) -> Result<u16, String> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .map_err(|e| format!("cannot bind 127.0.0.1:{port}: {e}"))?;
    let actual = listener
        .local_addr()
        .map_err(|e| format!("local_addr: {e}"))?
        .port();
    listener
        .set_nonblocking(true)
        .map_err(|e| format!("set_nonblocking: {e}"))?;

    thread::Builder::new()
        .name("cdc-link".into())
        .spawn(move || {
            log::info!("link listening on 127.0.0.1:{actual}");
            while !state.shutdown.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        log::info!("link client connected: {addr}");
                        match TcpCdc::new(stream) {
                            Ok(mut link) => {
                                while !state.shutdown.load(Ordering::Relaxed)
                                    && service_link(&mut link, &ends)
                                {}
                            }
                            Err(e) => log::warn!("link client setup failed: {e}"),
                        }
                        log::info!("link client disconnected");
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        // No client: drop pending TX so the ring never
                        // backs up into the control loop.
                        ends.usb_tx_rx.drain();
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        log::error!("link accept failed: {e}");
                        thread::sleep(Duration::from_millis(200));
                    }
                }
            }
            log::info!("link thread exiting");
        })
        .map_err(|e| format!("spawn link thread: {e}"))?;

    Ok(actual)
}

// ─────────────────────────────────────────────────────────────────────────────
//  Loopback transport (tests)
// ─────────────────────────────────────────────────────────────────────────────

struct LoopbackShared {
    inbound: Mutex<VecDeque<u8>>,
    outbound: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

/// Link half handed to the pump.
pub struct LoopbackLink {
    shared: Arc<LoopbackShared>,
}

/// Host half: inject bytes, collect output, hang up.
pub struct LoopbackHost {
    shared: Arc<LoopbackShared>,
}

pub fn loopback() -> (LoopbackLink, LoopbackHost) {
    let shared = Arc::new(LoopbackShared {
        inbound: Mutex::new(VecDeque::new()),
        outbound: Mutex::new(Vec::new()),
        closed: AtomicBool::new(false),
    });
    (
        LoopbackLink {
            shared: shared.clone(),
        },
        LoopbackHost { shared },
    )
}

impl LoopbackHost {
    pub fn send(&self, bytes: &[u8]) {
        self.shared.inbound.lock().unwrap().extend(bytes);
    }

    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.outbound.lock().unwrap())
    }

    pub fn hang_up(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

impl CdcLink for LoopbackLink {
    fn read_chunk(&mut self, buf: &mut [u8]) -> LinkRead {
        if self.shared.closed.load(Ordering::Acquire) {
            return LinkRead::Closed;
        }
        let mut inbound = self.shared.inbound.lock().unwrap();
        if inbound.is_empty() {
            return LinkRead::Idle;
        }
        let mut n = 0;
        while n < buf.len() {
            match inbound.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        LinkRead::Data(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), String> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err("closed".into());
        }
        self.shared.outbound.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::event::{self, TxMsg};

    #[test]
    fn pump_moves_bytes_both_ways() {
        let (_audio, control, link_ends, _action_tx) = event::build();
        let (mut link, host) = loopback();

        host.send(b"^^v\n");
        assert!(service_link(&mut link, &link_ends));
        let chunk = control.usb_rx_rx.get().expect("rx chunk queued");
        assert_eq!(chunk.as_slice(), b"^^v\n");

        control
            .usb_tx_tx
            .post(TxMsg::from_slice(b"^^version('corvid-1.0')\n\r", true));
        assert!(service_link(&mut link, &link_ends));
        assert_eq!(host.take_output(), b"^^version('corvid-1.0')\n\r");
    }

    #[test]
    fn long_input_arrives_in_ring_chunks() {
        let (_audio, control, link_ends, _action_tx) = event::build();
        let (mut link, host) = loopback();

        let payload: Vec<u8> = (0..200u8).collect();
        host.send(&payload);
        while control.usb_rx_rx.depth() < 4 {
            assert!(service_link(&mut link, &link_ends));
        }
        let mut got = Vec::new();
        while let Some(chunk) = control.usb_rx_rx.get() {
            got.extend_from_slice(chunk.as_slice());
        }
        assert_eq!(got, payload);
    }

    #[test]
    fn hang_up_stops_the_pump() {
        let (_audio, _control, link_ends, _action_tx) = event::build();
        let (mut link, host) = loopback();
        assert!(service_link(&mut link, &link_ends));
        host.hang_up();
        assert!(!service_link(&mut link, &link_ends));
    }
}
