//! In-process paired transport.
//!
//! Two [`MemoryTransport`] halves share a pair of byte queues, giving a
//! deterministic, loss-free stand-in for a TCP stream. Sessions under test
//! exchange real wire bytes through it without touching the OS.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::network::tcp::PeerTransport;

#[derive(Debug, Default)]
struct Pipe {
    data: VecDeque<u8>,
    closed: bool,
}

/// One half of an in-process byte stream pair.
#[derive(Debug)]
pub struct MemoryTransport {
    incoming: Arc<Mutex<Pipe>>,
    outgoing: Arc<Mutex<Pipe>>,
}

impl MemoryTransport {
    /// Creates two connected halves. Bytes sent on one side arrive in
    /// order on the other.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let ab = Arc::new(Mutex::new(Pipe::default()));
        let ba = Arc::new(Mutex::new(Pipe::default()));
        (
            Self {
                incoming: Arc::clone(&ba),
                outgoing: Arc::clone(&ab),
            },
            Self {
                incoming: ab,
                outgoing: ba,
            },
        )
    }

    /// Bytes queued towards this half that it has not read yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.incoming.lock().data.len()
    }
}

impl PeerTransport for MemoryTransport {
    fn try_send(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        let mut pipe = self.outgoing.lock();
        if pipe.closed {
            return Err(std::io::Error::new(
                ErrorKind::BrokenPipe,
                "peer transport closed",
            ));
        }
        pipe.data.extend(bytes);
        Ok(bytes.len())
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut pipe = self.incoming.lock();
        if pipe.data.is_empty() {
            if pipe.closed {
                return Ok(0);
            }
            return Err(std::io::Error::new(ErrorKind::WouldBlock, "no data"));
        }
        let n = buf.len().min(pipe.data.len());
        for slot in buf.iter_mut().take(n) {
            *slot = pipe.data.pop_front().unwrap_or(0);
        }
        Ok(n)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.incoming.lock().closed = true;
        self.outgoing.lock().closed = true;
    }
}
