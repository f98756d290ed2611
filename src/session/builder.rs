//! Session construction.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::{Connection, ConnectionMode};
use crate::error::{FatalReason, NetplayError};
use crate::frame_ring::FrameRing;
use crate::network::compression::{default_backend, CompressionBackend};
use crate::network::tcp::{self, PeerTransport, TcpPeer};
use crate::network::wire::{self, Message};
use crate::session::session::{NetplaySession, INITIAL_PACKET_BUFFER};
use crate::{
    Frame, NetplayResult, PlayerSet, PlayerSlot, Quirks, DEFAULT_DIRECTIONAL_MASK,
};

/// Builds a [`NetplaySession`], host or client.
///
/// ```no_run
/// use rollplay::SessionBuilder;
///
/// // Host on the default port:
/// let host = SessionBuilder::new()
///     .nick("host")
///     .delay_frames(4)
///     .start_host(55435)?;
///
/// // Or dial a host:
/// let client = SessionBuilder::new()
///     .nick("guest")
///     .start_client("example.org", 55435)?;
/// # Ok::<(), rollplay::NetplayError>(())
/// ```
pub struct SessionBuilder {
    nick: String,
    password: Option<String>,
    delay_frames: u32,
    check_frames: u32,
    directional_mask: u32,
    quirks: Quirks,
    nat_traversal: bool,
    retry_ms: u64,
    max_retries: u32,
    autosave_lock: Option<Arc<Mutex<()>>>,
    spectate: bool,
    compression: Option<Box<dyn CompressionBackend>>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// A builder with the stock configuration: four delay frames, a
    /// checksum every 60 frames, half-second retries.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nick: "anonymous".to_owned(),
            password: None,
            delay_frames: 4,
            check_frames: 60,
            directional_mask: DEFAULT_DIRECTIONAL_MASK,
            quirks: Quirks::NONE,
            nat_traversal: false,
            retry_ms: 500,
            max_retries: 16,
            autosave_lock: None,
            spectate: false,
            compression: None,
        }
    }

    /// The local display name, at most 32 bytes on the wire.
    #[must_use]
    pub fn nick(mut self, nick: impl Into<String>) -> Self {
        self.nick = nick.into();
        self
    }

    /// Shared secret peers must present during the handshake.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// The delay budget in frames; the ring holds `2 * delay_frames + 1`
    /// slots. Must be at least 1.
    #[must_use]
    pub fn delay_frames(mut self, frames: u32) -> Self {
        self.delay_frames = frames;
        self
    }

    /// How often state checksums are broadcast, in frames. 0 disables the
    /// exchange.
    #[must_use]
    pub fn check_frames(mut self, frames: u32) -> Self {
        self.check_frames = frames;
        self
    }

    /// The digital-word bits treated as directional during resimulation.
    #[must_use]
    pub fn directional_mask(mut self, mask: u32) -> Self {
        self.directional_mask = mask;
        self
    }

    /// Known emulator-core quirks to start the session with.
    #[must_use]
    pub fn quirks(mut self, quirks: Quirks) -> Self {
        self.quirks = quirks;
        self
    }

    /// Host only: note that the frontend wants NAT punch-through.
    /// Traversal itself is the frontend's collaborator; the session only
    /// records the wish.
    #[must_use]
    pub fn nat_traversal(mut self, enabled: bool) -> Self {
        self.nat_traversal = enabled;
        self
    }

    /// How long one blocked input wait lasts, in milliseconds.
    #[must_use]
    pub fn retry_ms(mut self, ms: u64) -> Self {
        self.retry_ms = ms;
        self
    }

    /// How many consecutive unfruitful waits are tolerated before the
    /// session reports a stall.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// A mutex held for the duration of every emulator-core `run_frame`,
    /// typically the frontend's autosave interlock.
    #[must_use]
    pub fn autosave_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.autosave_lock = Some(lock);
        self
    }

    /// Client only: connect as a spectator instead of requesting a player
    /// slot.
    #[must_use]
    pub fn spectate(mut self, spectate: bool) -> Self {
        self.spectate = spectate;
        self
    }

    /// Replaces the savestate compression backend.
    #[must_use]
    pub fn compression(mut self, backend: Box<dyn CompressionBackend>) -> Self {
        self.compression = Some(backend);
        self
    }

    // ==========
    // Start-ups
    // ==========

    /// Binds `port` and starts hosting. The host occupies player slot 0.
    pub fn start_host(self, port: u16) -> NetplayResult<NetplaySession> {
        if self.nat_traversal {
            tracing::debug!("NAT traversal requested; expecting the frontend to arrange it");
        }
        let listener = tcp::bind_listener(port)
            .map_err(|e| NetplayError::transport("binding the listen socket", e))?;
        let mut session = self.build(true)?;
        session.listener = Some(listener);
        Ok(session)
    }

    /// Starts hosting without a listen socket; peers are attached with
    /// [`NetplaySession::attach_peer`].
    pub fn start_host_unbound(self) -> NetplayResult<NetplaySession> {
        self.build(true)
    }

    /// Dials `server:port` and starts the handshake.
    pub fn start_client(self, server: &str, port: u16) -> NetplayResult<NetplaySession> {
        let peer = TcpPeer::connect(server, port)
            .map_err(|e| NetplayError::transport("dialing the host", e))?;
        self.start_client_with_transport(Box::new(peer))
    }

    /// Dials a pre-resolved address, bypassing DNS.
    pub fn start_client_direct(self, addr: SocketAddr) -> NetplayResult<NetplaySession> {
        let peer = TcpPeer::connect_direct(addr)
            .map_err(|e| NetplayError::transport("dialing the host", e))?;
        self.start_client_with_transport(Box::new(peer))
    }

    /// Starts a client over an already-established transport.
    pub fn start_client_with_transport(
        self,
        transport: Box<dyn PeerTransport>,
    ) -> NetplayResult<NetplaySession> {
        let mut session = self.build(false)?;
        let mut conn = Connection::new(transport, ConnectionMode::Init, INITIAL_PACKET_BUFFER);
        // Open with the greeting; everything else is reply-driven.
        let hello = Message::Hello {
            magic: wire::HELLO_MAGIC,
            version: wire::PROTOCOL_VERSION,
        };
        conn.queue(&hello)
            .and_then(|()| conn.flush())
            .map_err(|e| NetplayError::transport("sending the greeting", e))?;
        session.connections.push(conn);
        Ok(session)
    }

    fn build(self, is_server: bool) -> NetplayResult<NetplaySession> {
        if self.nick.len() > wire::NICK_LEN {
            return Err(NetplayError::Fatal {
                reason: FatalReason::NickTooLong {
                    len: self.nick.len(),
                },
            });
        }
        if let Some(pw) = &self.password {
            if pw.len() > wire::NICK_LEN {
                return Err(NetplayError::Fatal {
                    reason: FatalReason::PasswordTooLong { len: pw.len() },
                });
            }
        }
        let ring = FrameRing::new(self.delay_frames)?;

        Ok(NetplaySession {
            is_server,
            nick: self.nick,
            password: self.password,
            self_mode: if is_server {
                ConnectionMode::Playing
            } else {
                ConnectionMode::None
            },
            self_player: is_server.then(|| PlayerSlot::new(0)),
            connected_players: PlayerSet::EMPTY,
            flip: false,
            flip_frame: Frame::ZERO,
            quirks: self.quirks,
            check_frames: self.check_frames,
            directional_mask: self.directional_mask,
            retry_ms: self.retry_ms,
            max_retries: self.max_retries,
            timeout_count: 0,
            ring,
            connections: Vec::new(),
            listener: None,
            state_size: 0,
            zbuffer: Vec::new(),
            compression: self.compression.unwrap_or_else(default_backend),
            force_rewind: false,
            force_send_savestate: false,
            savestate_request_outstanding: false,
            local_paused: false,
            remote_paused: false,
            is_replay: false,
            autosave_lock: self.autosave_lock,
            events: std::collections::VecDeque::new(),
            auto_play: !self.spectate,
        })
    }
}
