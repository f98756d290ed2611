//! Per-connection send and receive buffering.
//!
//! Sockets are non-blocking, so writes may land partially and reads may
//! stop mid-command. The send buffer queues whatever the socket would not
//! take; the receive buffer accumulates bytes until a full command is
//! available, which lets the parser simply retry from the last command
//! boundary after a short read.

use std::io::ErrorKind;

use crate::network::tcp::PeerTransport;

/// Outcome of a buffered flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Every queued byte reached the socket.
    Drained,
    /// The socket would block; bytes remain queued.
    Pending,
}

/// Queues outbound bytes in front of a non-blocking socket.
#[derive(Debug, Default)]
pub struct SendBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl SendBuffer {
    /// Creates a buffer that refuses to queue more than `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
        }
    }

    /// Grows the capacity, keeping queued bytes. Used when serialization
    /// initialisation learns the real state size.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = self.capacity.max(capacity);
    }

    /// Queues `bytes` for transmission. A peer that stops draining its
    /// socket eventually overflows the budget and is hung up, rather than
    /// growing the queue without bound.
    pub fn queue(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if self.data.len() + bytes.len() > self.capacity {
            return Err(std::io::Error::new(
                ErrorKind::OutOfMemory,
                "send buffer overflow",
            ));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Pushes queued bytes into the socket until it blocks or the queue
    /// drains.
    pub fn flush(&mut self, transport: &mut dyn PeerTransport) -> std::io::Result<FlushState> {
        let mut written = 0;
        while written < self.data.len() {
            match transport.try_send(&self.data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.data.drain(..written);
        if self.data.is_empty() {
            Ok(FlushState::Drained)
        } else {
            Ok(FlushState::Pending)
        }
    }

    /// Bytes currently queued.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.data.len()
    }

    /// Drops everything. Used on hangup.
    pub fn clear(&mut self) {
        self.data = Vec::new();
    }
}

/// Accumulates inbound bytes until whole commands are available.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl RecvBuffer {
    /// Creates a buffer bounded at `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
        }
    }

    /// Grows the capacity, keeping buffered bytes.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = self.capacity.max(capacity);
    }

    /// Pulls whatever the socket has, up to the capacity budget. Returns
    /// the number of new bytes, or an EOF error when the peer closed the
    /// stream.
    pub fn fill(&mut self, transport: &mut dyn PeerTransport) -> std::io::Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; 4096];
        while self.data.len() < self.capacity {
            let room = (self.capacity - self.data.len()).min(chunk.len());
            match transport.try_recv(&mut chunk[..room]) {
                Ok(0) => {
                    if total > 0 {
                        break;
                    }
                    return Err(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "peer closed the stream",
                    ));
                }
                Ok(n) => {
                    self.data.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// The bytes accumulated so far, starting at the last command
    /// boundary.
    #[must_use]
    pub fn available(&self) -> &[u8] {
        &self.data
    }

    /// Commits `n` bytes as consumed; the next parse starts after them.
    pub fn consume(&mut self, n: usize) {
        self.data.drain(..n);
    }

    /// Drops everything. Used on hangup.
    pub fn clear(&mut self) {
        self.data = Vec::new();
    }
}
