//! The netplay session: membership, input exchange and frame advance.

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::net::TcpListener;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ConnectionMode};
use crate::error::NetplayError;
use crate::frame_ring::FrameRing;
use crate::input;
use crate::network::compression::CompressionBackend;
use crate::network::tcp::PeerTransport;
use crate::network::wire::{self, Message, INPUT_BIT_SERVER, MODE_BIT_PLAYING};
use crate::{
    EmulatorCore, Frame, InputWords, NetplayEvent, NetplayResult, PlayerSet, PlayerSlot, Quirks,
    MAX_PLAYERS, WORDS_PER_FRAME, WORDS_PER_INPUT,
};

/// Send and receive budget per connection before serialization is
/// initialised; grown once the real state size is known.
pub(super) const INITIAL_PACKET_BUFFER: usize = 16 * 1024;

/// An active netplay session, host or client.
///
/// The session is single-threaded and cooperative: the frontend calls
/// [`poll`](NetplaySession::poll) and
/// [`advance_frame`](NetplaySession::advance_frame) from its main loop and
/// drains [`events`](NetplaySession::events) for user-visible
/// notifications. All sockets are non-blocking; the only waiting the
/// session ever does is the bounded input retry inside `advance_frame`.
impl std::fmt::Debug for NetplaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetplaySession")
            .field("is_server", &self.is_server)
            .field("nick", &self.nick)
            .field("self_mode", &self.self_mode)
            .field("self_player", &self.self_player)
            .finish_non_exhaustive()
    }
}

pub struct NetplaySession {
    pub(super) is_server: bool,
    pub(super) nick: String,
    pub(super) password: Option<String>,
    /// The local participant's mode: `None` before the handshake (client),
    /// then `Spectating` or `Playing`.
    pub(super) self_mode: ConnectionMode,
    pub(super) self_player: Option<PlayerSlot>,
    /// Remote playing peers whose input this session reads.
    pub(super) connected_players: PlayerSet,
    pub(super) flip: bool,
    pub(super) flip_frame: Frame,
    pub(super) quirks: Quirks,
    pub(super) check_frames: u32,
    pub(super) directional_mask: u32,
    pub(super) retry_ms: u64,
    pub(super) max_retries: u32,
    pub(super) timeout_count: u32,
    pub(super) ring: FrameRing,
    pub(super) connections: Vec<Connection>,
    pub(super) listener: Option<TcpListener>,
    pub(super) state_size: usize,
    pub(super) zbuffer: Vec<u8>,
    pub(super) compression: Box<dyn CompressionBackend>,
    pub(super) force_rewind: bool,
    pub(super) force_send_savestate: bool,
    pub(super) savestate_request_outstanding: bool,
    pub(super) local_paused: bool,
    pub(super) remote_paused: bool,
    pub(super) is_replay: bool,
    pub(super) autosave_lock: Option<Arc<Mutex<()>>>,
    pub(super) events: VecDeque<NetplayEvent>,
    /// Client only: request a player slot as soon as the handshake lands.
    pub(super) auto_play: bool,
}

impl NetplaySession {
    // ==================
    // Public frame cycle
    // ==================

    /// Services the network: accepts a pending connection (host), drains
    /// inbound commands as far as buffered data allows and advances the
    /// per-peer read heads. Never blocks.
    pub fn poll(&mut self, core: &mut dyn EmulatorCore) -> NetplayResult<()> {
        self.accept_pending();
        self.poll_net(core, false)
    }

    /// Advances the local simulation by one frame.
    ///
    /// Drains inbound commands (blocking up to the retry budget when the
    /// ring cannot take another frame), emits the local input sample,
    /// snapshots and runs the core, then performs the frame-boundary
    /// bookkeeping: catching the rollback boundary up, rolling back and
    /// replaying on misprediction, and exchanging checksums.
    ///
    /// While any participant is paused the call services the network and
    /// returns without advancing.
    pub fn advance_frame(
        &mut self,
        core: &mut dyn EmulatorCore,
        local_input: InputWords,
    ) -> NetplayResult<()> {
        self.accept_pending();
        if self.local_paused || self.remote_paused {
            return self.poll_net(core, false);
        }
        if !self.is_server
            && self.self_mode == ConnectionMode::None
            && self.connections.iter().any(|c| c.active)
        {
            // Handshake still in flight; we have no frame counter to
            // advance yet.
            return self.poll_net(core, false);
        }
        self.ensure_serialization(core);

        // A savestate load or membership change may have forced a rewind
        // since the last frame ran; settle it before this frame's
        // snapshot can overwrite the state it needs.
        if self.force_rewind {
            self.post_frame(core)?;
        }

        let frame = self.ring.self_cur.frame;
        let ptr = self.ring.self_cur.ptr;
        if !self.ring.claim(ptr, frame, self.connected_players) {
            return Err(NetplayError::Stall {
                frame,
                retries: self.timeout_count,
            });
        }
        {
            // A frame interrupted by a pause or stall keeps its original
            // sample; the batch for it may already be on the wire.
            let slot = self.ring.slot_mut(ptr);
            if !slot.have_local {
                slot.self_state = local_input;
                slot.have_local = true;
            }
        }

        // Snapshot the frame's starting state, and push a deferred
        // savestate out before this frame's input can overtake it.
        self.serialize_into_slot(core, ptr);
        self.maybe_send_savestate();

        // The local batch goes out before any blocking wait; a peer in
        // the same position needs it to make progress.
        self.send_cur_input_all();

        // Lockstep when rollback is unavailable: every input must be in
        // hand before the frame may run.
        let lockstep = self.state_size == 0 && self.has_remote_input_sources();
        let block = lockstep
            || self.ring.self_cur.frame.since(self.ring.other.frame) >= self.ring.delay_frames();
        self.poll_net(core, block)?;
        if self.local_paused || self.remote_paused {
            return Ok(());
        }

        input::simulate_input(
            &mut self.ring,
            ptr,
            false,
            self.connected_players,
            self.directional_mask,
        );
        let mut inputs = input::resolve_inputs(&self.ring, ptr, self.connected_players, self.playing_as());
        input::apply_flip(&mut inputs, self.flipped_at(frame));
        self.run_core(core, &inputs);
        self.ring.advance_self();

        self.post_frame(core)
    }

    /// Drains queued user-visible notifications.
    pub fn events(&mut self) -> Drain<'_, NetplayEvent> {
        self.events.drain(..)
    }

    // ===================
    // Public session info
    // ===================

    /// Whether this session is the authoritative host.
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.is_server
    }

    /// The frame the local simulation is about to produce.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.ring.self_cur.frame
    }

    /// The oldest frame whose inputs are fully known. Nothing at or
    /// before this frame will ever be re-run.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.ring.other.frame
    }

    /// The oldest frame the host has authoritatively acknowledged.
    /// Meaningful on clients only.
    #[must_use]
    pub fn server_frame(&self) -> Frame {
        self.ring.server.frame
    }

    /// The next frame expected from `player`.
    #[must_use]
    pub fn read_frame(&self, player: PlayerSlot) -> Frame {
        self.ring.read[player.as_usize()].frame
    }

    /// The local participant's player slot, when playing.
    #[must_use]
    pub fn local_player(&self) -> Option<PlayerSlot> {
        if self.self_mode == ConnectionMode::Playing {
            self.self_player
        } else {
            None
        }
    }

    /// The remote playing peers this session currently reads input from.
    #[must_use]
    pub fn connected_players(&self) -> PlayerSet {
        self.connected_players
    }

    /// Whether the port mapping is toggled at the current frame.
    #[must_use]
    pub fn flipped(&self) -> bool {
        let frame = if self.is_replay {
            self.ring.replay.frame
        } else {
            self.ring.self_cur.frame
        };
        self.flipped_at(frame)
    }

    /// Whether any remote participant is paused.
    #[must_use]
    pub fn remote_paused(&self) -> bool {
        self.remote_paused
    }

    /// Whether the local participant is paused.
    #[must_use]
    pub fn local_paused(&self) -> bool {
        self.local_paused
    }

    /// The serialized state size, or 0 while unknown.
    #[must_use]
    pub fn state_size(&self) -> usize {
        self.state_size
    }

    /// The session's quirk set, including quirks acquired by degradation.
    #[must_use]
    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    /// Number of live peer connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.connections.iter().filter(|c| c.active).count()
    }

    // ================
    // Public requests
    // ================

    /// Host only: toggles the port mapping starting at the next frame and
    /// tells every peer.
    pub fn flip_players(&mut self) {
        if !self.is_server {
            return;
        }
        let flip_frame = self.ring.self_cur.frame + 1;
        self.flip = !self.flip;
        self.flip_frame = flip_frame;
        self.broadcast(&Message::FlipPlayers { frame: flip_frame }, None);
        self.events.push_back(NetplayEvent::UsersFlipped { frame: flip_frame });
        debug!(frame = %flip_frame, "port mapping flip scheduled");
    }

    /// Pauses or resumes the local participant and tells every peer.
    pub fn set_pause(&mut self, paused: bool) {
        if self.local_paused == paused {
            return;
        }
        self.local_paused = paused;
        let msg = if paused { Message::Pause } else { Message::Resume };
        self.broadcast(&msg, None);
    }

    /// Client only: asks the host for a player slot.
    pub fn request_play(&mut self) {
        if self.is_server || self.self_mode == ConnectionMode::Playing {
            return;
        }
        self.queue_and_flush(0, &Message::Play);
    }

    /// Client only: leaves the playing set.
    pub fn request_spectate(&mut self) {
        if self.is_server || self.self_mode != ConnectionMode::Playing {
            return;
        }
        // The host's confirmation requires us to already consider
        // ourselves a spectator.
        self.self_mode = ConnectionMode::Spectating;
        self.queue_and_flush(0, &Message::Spectate);
    }

    /// Orderly teardown: tells every peer goodbye and hangs all
    /// connections up.
    pub fn disconnect(&mut self) {
        self.broadcast(&Message::Disconnect, None);
        for idx in 0..self.connections.len() {
            self.hangup(idx);
        }
        self.listener = None;
    }

    /// Adopts an established transport as a new peer connection. The host
    /// listener uses this internally; tests and custom transports may call
    /// it directly.
    pub fn attach_peer(&mut self, transport: Box<dyn PeerTransport>) {
        let conn = Connection::new(transport, ConnectionMode::Init, self.packet_buffer_size());
        // Reuse a dead connection entry when one exists.
        if let Some(idx) = self.connections.iter().position(|c| !c.active) {
            self.connections[idx] = conn;
        } else {
            self.connections.push(conn);
        }
    }

    // ====================
    // Internal: membership
    // ====================

    pub(super) fn accept_pending(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        match listener.accept() {
            Ok((stream, addr)) => match crate::network::tcp::TcpPeer::from_stream(stream) {
                Ok(peer) => {
                    debug!(%addr, "incoming netplay connection");
                    self.attach_peer(Box::new(peer));
                }
                Err(e) => warn!(%addr, "could not adopt incoming connection: {e}"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("listener accept failed: {e}"),
        }
    }

    /// Disconnects one connection and repairs session membership.
    pub(super) fn hangup(&mut self, idx: usize) {
        if !self.connections[idx].active {
            return;
        }
        warn!("netplay has disconnected, will continue without connection");
        self.events.push_back(NetplayEvent::Disconnected);

        let was_playing = self.connections[idx].mode == ConnectionMode::Playing;
        let player = self.connections[idx].player;
        self.connections[idx].deactivate();

        if !self.is_server {
            self.self_mode = ConnectionMode::None;
            self.connected_players = PlayerSet::EMPTY;
        } else if was_playing {
            if let Some(p) = player {
                self.connected_players.remove(p);
                let frame = self.ring.read[p.as_usize()].frame;
                self.broadcast(
                    &Message::Mode {
                        frame,
                        tag: p.as_usize() as u32,
                    },
                    Some(idx),
                );
                self.events.push_back(NetplayEvent::PlayerLeft(p));
            }
        }
    }

    // ==================
    // Internal: sending
    // ==================

    /// Queues a message on one connection and flushes. Returns whether
    /// the connection survived.
    pub(super) fn queue_and_flush(&mut self, idx: usize, msg: &Message) -> bool {
        let conn = &mut self.connections[idx];
        if !conn.active {
            return false;
        }
        let sent = conn.queue(msg).and_then(|()| conn.flush());
        if let Err(e) = sent {
            warn!("send to peer failed: {e}");
            self.hangup(idx);
            return false;
        }
        true
    }

    /// Sends a message to every established connection, optionally
    /// excluding one (typically the peer a command came from).
    pub(super) fn broadcast(&mut self, msg: &Message, except: Option<usize>) {
        for idx in 0..self.connections.len() {
            if Some(idx) == except {
                continue;
            }
            if self.connections[idx].active && self.connections[idx].mode.is_established() {
                self.queue_and_flush(idx, msg);
            }
        }
    }

    /// Forwards authoritative input to every established peer that does
    /// not own it, optionally excluding its source connection.
    pub(super) fn send_input_frame(
        &mut self,
        frame: Frame,
        player: PlayerSlot,
        tag: u32,
        state: InputWords,
        except: Option<usize>,
    ) {
        let msg = Message::Input {
            frame,
            player_tag: tag,
            state,
        };
        for idx in 0..self.connections.len() {
            if Some(idx) == except {
                continue;
            }
            let conn = &self.connections[idx];
            if !conn.active || !conn.mode.is_established() {
                continue;
            }
            if conn.mode == ConnectionMode::Playing && conn.player == Some(player) {
                continue;
            }
            self.queue_and_flush(idx, &msg);
        }
    }

    /// Emits the current frame's input batch to one established peer:
    /// the other players' authoritative samples (host), a NOINPUT stand-in
    /// when the host itself contributes nothing, and the local sample.
    pub(super) fn send_cur_input(&mut self, idx: usize) -> bool {
        let frame = self.ring.self_cur.frame;
        let ptr = self.ring.self_cur.ptr;

        // Nothing to say before the frame's slot is claimed and, when we
        // contribute input, sampled; the pending advance emits the batch
        // then. A handshake completing mid-frame emits it immediately
        // instead, and the latch keeps the regular emission from
        // repeating it (NOINPUT tolerates no duplicates).
        if !self.ring.ready(ptr, frame) {
            return true;
        }
        if self.self_mode == ConnectionMode::Playing && !self.ring.slot(ptr).have_local {
            return true;
        }
        if self.connections[idx].input_sent_for == Some(frame) {
            return true;
        }
        self.connections[idx].input_sent_for = Some(frame);

        if self.is_server {
            for player in self.connected_players.iter() {
                let conn = &self.connections[idx];
                if conn.mode == ConnectionMode::Playing && conn.player == Some(player) {
                    continue;
                }
                if self.ring.slot(ptr).have_real[player.as_usize()] {
                    let state = self.ring.slot(ptr).real_input[player.as_usize()];
                    let msg = Message::Input {
                        frame,
                        player_tag: player.as_usize() as u32,
                        state,
                    };
                    if !self.queue_and_flush(idx, &msg) {
                        return false;
                    }
                }
            }
            if self.self_mode != ConnectionMode::Playing
                && !self.queue_and_flush(idx, &Message::NoInput { frame })
            {
                return false;
            }
        }

        if self.self_mode == ConnectionMode::Playing {
            if let Some(me) = self.self_player {
                let mut tag = me.as_usize() as u32;
                if self.is_server {
                    tag |= INPUT_BIT_SERVER;
                }
                let state = self.ring.slot(ptr).self_state;
                let msg = Message::Input {
                    frame,
                    player_tag: tag,
                    state,
                };
                if !self.queue_and_flush(idx, &msg) {
                    return false;
                }
            }
        }
        true
    }

    pub(super) fn send_cur_input_all(&mut self) {
        for idx in 0..self.connections.len() {
            if self.connections[idx].active && self.connections[idx].mode.is_established() {
                self.send_cur_input(idx);
            }
        }
    }

    // ==========================
    // Internal: state and quirks
    // ==========================

    pub(super) fn playing_as(&self) -> Option<PlayerSlot> {
        if self.self_mode == ConnectionMode::Playing {
            self.self_player
        } else {
            None
        }
    }

    pub(super) fn flipped_at(&self, frame: Frame) -> bool {
        input::flip_active(self.flip, self.flip_frame, frame)
    }

    /// Whether any remote source must deliver input before a frame is
    /// fully known.
    pub(super) fn has_remote_input_sources(&self) -> bool {
        !self.connected_players.is_empty()
            || (!self.is_server && self.connections.iter().any(|c| c.active))
    }

    pub(super) fn packet_buffer_size(&self) -> usize {
        // Room for one savestate plus a delay budget's worth of framed
        // input commands.
        let per_frame = WORDS_PER_FRAME * 4 + wire::HEADER_LEN;
        self.zbuffer.len()
            + (self.ring.delay_frames() as usize + 1) * per_frame * MAX_PLAYERS
            + INITIAL_PACKET_BUFFER
    }

    /// The largest payload a peer may legitimately send.
    pub(super) fn max_payload(&self) -> usize {
        if self.state_size == 0 {
            // Serialization not initialised yet; a joining peer's
            // savestate must still fit somewhere.
            4 << 20
        } else {
            self.zbuffer.len() + 8
        }
    }

    pub(super) fn run_core(&mut self, core: &mut dyn EmulatorCore, inputs: &[InputWords; MAX_PLAYERS]) {
        let guard = self.autosave_lock.as_ref().map(|m| m.lock());
        core.run_frame(inputs);
        drop(guard);
    }

    pub(super) fn serialize_into_slot(&mut self, core: &mut dyn EmulatorCore, ptr: usize) {
        if self.state_size == 0 {
            return;
        }
        let slot = self.ring.slot_mut(ptr);
        if slot.state.len() != self.state_size {
            slot.state = vec![0; self.state_size];
        }
        if !core.serialize(&mut slot.state) {
            warn!(frame = %slot.frame, "core refused to serialize; rollback past this frame is lost");
        }
    }

    /// Initialises serialization unless a quirk defers or forbids it.
    pub(super) fn ensure_serialization(&mut self, core: &mut dyn EmulatorCore) {
        if self.state_size != 0 || self.quirks.contains(Quirks::NO_SAVESTATES) {
            return;
        }
        if self.quirks.contains(Quirks::INITIALIZATION) {
            // Probe opportunistically; the core may have become ready.
            self.try_init_serialization(core);
        } else if !self.init_serialization(core) {
            warn!("core exposes no serialized state; session degraded to lockstep");
            self.quirks.insert(Quirks::NO_SAVESTATES);
        }
    }

    /// Learns the state size and sizes every state-dependent buffer.
    pub(super) fn init_serialization(&mut self, core: &mut dyn EmulatorCore) -> bool {
        if self.state_size != 0 {
            return true;
        }
        let size = core.serialize_size();
        if size == 0 {
            return false;
        }
        self.state_size = size;
        for ptr in 0..self.ring.size() {
            self.ring.slot_mut(ptr).state = vec![0; size];
        }
        // Twice the state plus a floor: a codec may expand small or
        // incompressible states past their own size.
        self.zbuffer = vec![0; (size * 2).max(4096)];
        let budget = self.packet_buffer_size();
        for conn in &mut self.connections {
            conn.send.set_capacity(budget);
            conn.recv.set_capacity(budget);
        }
        debug!(state_size = size, "serialization initialised");
        true
    }

    /// One initialisation attempt for a core with the delayed-start quirk.
    pub(super) fn try_init_serialization(&mut self, core: &mut dyn EmulatorCore) -> bool {
        if self.state_size != 0 {
            return true;
        }
        if !self.init_serialization(core) {
            return false;
        }
        let ptr = self.ring.self_cur.ptr;
        let mut probe = std::mem::take(&mut self.ring.slot_mut(ptr).state);
        let ok = core.serialize(&mut probe);
        self.ring.slot_mut(ptr).state = probe;
        if !ok {
            // The size was a lie; forget it so the next attempt is real.
            self.state_size = 0;
            self.zbuffer = Vec::new();
            return false;
        }
        self.quirks.remove(Quirks::INITIALIZATION);
        true
    }

    /// Runs the core for up to 60 frames to elicit a serializable state.
    /// Failure permanently degrades the session to lockstep.
    pub(super) fn wait_and_init_serialization(&mut self, core: &mut dyn EmulatorCore) -> bool {
        if self.state_size != 0 {
            return true;
        }
        for _ in 0..60 {
            if self.try_init_serialization(core) {
                return true;
            }
            let idle = [[0u32; WORDS_PER_INPUT]; MAX_PLAYERS];
            self.run_core(core, &idle);
        }
        warn!("core never became serializable; session degraded to lockstep");
        self.quirks.insert(Quirks::NO_SAVESTATES);
        false
    }

    /// Recomputes the earliest frame any connected source still owes.
    pub(super) fn update_unread(&mut self) {
        if self.is_server && self.connected_players.is_empty() {
            self.ring.unread = self.ring.self_cur;
            return;
        }
        let mut best: Option<crate::frame_ring::Cursor> = None;
        for p in self.connected_players.iter() {
            let cur = self.ring.read[p.as_usize()];
            if best.map_or(true, |b| cur.frame < b.frame) {
                best = Some(cur);
            }
        }
        if !self.is_server {
            let server = self.ring.server;
            if best.map_or(true, |b| server.frame < b.frame) {
                best = Some(server);
            }
        }
        self.ring.unread = best.unwrap_or(self.ring.self_cur);
    }

    /// Sends a deferred savestate. The current slot was serialized just
    /// before this call, so the snapshot matches the frame about to run;
    /// read cursors snap forward because nothing older matters any more.
    pub(super) fn maybe_send_savestate(&mut self) {
        if !self.force_send_savestate {
            return;
        }
        self.force_send_savestate = false;
        if self.state_size == 0 || self.quirks.contains(Quirks::NO_TRANSMISSION) {
            return;
        }
        let frame = self.ring.self_cur.frame;
        let ptr = self.ring.self_cur.ptr;

        let state = std::mem::take(&mut self.ring.slot_mut(ptr).state);
        let mut zbytes = Vec::new();
        let compressed = self.compression.compress(&state, &mut zbytes);
        self.ring.slot_mut(ptr).state = state;
        if let Err(e) = compressed {
            warn!("savestate compression failed: {e}");
            return;
        }

        trace!(%frame, bytes = zbytes.len(), "sending savestate");
        let msg = Message::LoadSavestate {
            frame,
            inflated_len: self.state_size as u32,
            zbytes,
        };
        self.broadcast(&msg, None);

        // Ignore any intermediate data from the other side.
        self.ring.other = self.ring.self_cur;
        for p in self.connected_players.iter() {
            self.ring.read[p.as_usize()] = self.ring.self_cur;
        }
    }

    /// Sends a savestate of the current frame to one just-connected peer
    /// so it starts from our state rather than power-on.
    pub(super) fn offer_savestate(&mut self, idx: usize, core: &mut dyn EmulatorCore) {
        if self.state_size == 0
            || self.quirks.contains(Quirks::NO_TRANSMISSION)
            || self.self_mode != ConnectionMode::Playing
        {
            return;
        }
        let frame = self.ring.self_cur.frame;
        let ptr = self.ring.self_cur.ptr;
        if !self.ring.claim(ptr, frame, self.connected_players) {
            return;
        }
        self.serialize_into_slot(core, ptr);

        let state = std::mem::take(&mut self.ring.slot_mut(ptr).state);
        let mut zbytes = Vec::new();
        let compressed = self.compression.compress(&state, &mut zbytes);
        self.ring.slot_mut(ptr).state = state;
        if compressed.is_err() {
            return;
        }
        let msg = Message::LoadSavestate {
            frame,
            inflated_len: self.state_size as u32,
            zbytes,
        };
        self.queue_and_flush(idx, &msg);
    }

    /// Builds the MODE tag for a player slot.
    pub(super) fn mode_tag(player: PlayerSlot, playing: bool, you: bool) -> u32 {
        let mut tag = player.as_usize() as u32;
        if playing {
            tag |= MODE_BIT_PLAYING;
        }
        if you {
            tag |= wire::MODE_BIT_YOU;
        }
        tag
    }
}
