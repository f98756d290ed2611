//! Per-peer connection state.

use crate::network::buffer::{RecvBuffer, SendBuffer};
use crate::network::tcp::PeerTransport;
use crate::network::wire::{self, Message};
use crate::PlayerSlot;

/// Lifecycle of one peer connection.
///
/// A connection walks the handshake left to right and then stays at
/// `Connected` or one of its two overlays:
///
/// ```text
/// None -> Init -> PreNick -> PrePassword -> PreSync -> Connected
///                                                        |- Spectating
///                                                        `- Playing
/// ```
///
/// `Spectating` and `Playing` are bookkeeping tags on top of an
/// established connection, not handshake states; any of the three accepts
/// the full command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ConnectionMode {
    /// No connection.
    None,
    /// Waiting for the greeting exchange.
    Init,
    /// Greeted; waiting for the nickname.
    PreNick,
    /// Named; waiting for the password check.
    PrePassword,
    /// Authenticated; waiting for frame synchronisation.
    PreSync,
    /// Fully established.
    Connected,
    /// Established, watching without contributing input.
    Spectating,
    /// Established and occupying a player slot.
    Playing,
}

impl ConnectionMode {
    /// Whether the handshake has completed.
    #[inline]
    pub(crate) fn is_established(self) -> bool {
        self >= Self::Connected
    }
}

/// One peer: its transport, buffered I/O and protocol bookkeeping.
pub(crate) struct Connection {
    pub transport: Box<dyn PeerTransport>,
    pub active: bool,
    pub mode: ConnectionMode,
    /// The player slot this peer occupies while `mode` is `Playing`.
    pub player: Option<PlayerSlot>,
    pub paused: bool,
    pub nick: String,
    /// The frame whose input batch this peer last received, so a
    /// handshake completing mid-frame does not double-send the batch.
    pub input_sent_for: Option<crate::Frame>,
    pub send: SendBuffer,
    pub recv: RecvBuffer,
}

impl Connection {
    pub(crate) fn new(transport: Box<dyn PeerTransport>, mode: ConnectionMode, buffer_size: usize) -> Self {
        Self {
            transport,
            active: true,
            mode,
            player: None,
            paused: false,
            nick: String::new(),
            input_sent_for: None,
            send: SendBuffer::new(buffer_size),
            recv: RecvBuffer::new(buffer_size),
        }
    }

    /// Queues one message for this peer.
    pub(crate) fn queue(&mut self, msg: &Message) -> std::io::Result<()> {
        let mut bytes = Vec::with_capacity(64);
        wire::encode_into(msg, &mut bytes);
        self.send.queue(&bytes)
    }

    /// Pushes queued bytes into the socket.
    pub(crate) fn flush(&mut self) -> std::io::Result<()> {
        self.send.flush(self.transport.as_mut()).map(|_| ())
    }

    /// Closes the connection and releases its buffers. The session-level
    /// bookkeeping (membership, broadcasts) lives with the session.
    pub(crate) fn deactivate(&mut self) {
        self.active = false;
        self.mode = ConnectionMode::None;
        self.paused = false;
        self.send.clear();
        self.recv.clear();
    }
}
