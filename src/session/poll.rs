//! Inbound command dispatch.
//!
//! Each command is an independent handler; a handler either succeeds or
//! reports how its connection must die. Post-handler bookkeeping (buffer
//! consumption, timeout reset) is centralised in the drain loop, and short
//! reads never reach a handler at all: the parser only surfaces complete
//! commands and the receive buffer holds partial ones until the next tick.

use std::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::connection::ConnectionMode;
use crate::error::{NetplayError, ProtocolViolation};
use crate::frame_ring::Cursor;
use crate::network::tcp::{self, PeerTransport};
use crate::network::wire::{
    self, Message, INPUT_BIT_SERVER, MODE_BIT_PLAYING, MODE_BIT_YOU, MODE_PLAYER_MASK,
};
use crate::session::session::NetplaySession;
use crate::{
    EmulatorCore, Frame, InputWords, NetplayEvent, NetplayResult, PlayerSlot, Quirks, MAX_PLAYERS,
};

/// How a connection must be terminated after a failed handler.
pub(super) enum CmdError {
    /// Protocol violation: answer NAK, then hang up.
    Nak(ProtocolViolation),
    /// Hang up without an answer (peer NAK'd us, said goodbye, or EOF'd).
    Hangup,
}

impl NetplaySession {
    /// Drains inbound commands, advancing the per-peer read heads as far
    /// as buffered data permits.
    ///
    /// With `block`, keeps reading until the current frame's inputs have
    /// all arrived, waiting up to the retry budget between attempts; an
    /// exhausted budget with no peer paused is a [`NetplayError::Stall`].
    pub(super) fn poll_net(
        &mut self,
        core: &mut dyn EmulatorCore,
        block: bool,
    ) -> NetplayResult<()> {
        if self.connections.iter().all(|c| !c.active) {
            return Ok(());
        }
        loop {
            let mut had_input = false;
            self.timeout_count += 1;

            // Make sure the ring can actually house the next expected
            // frames before reading more.
            if !self.ring_can_take_more() {
                break;
            }

            for idx in 0..self.connections.len() {
                if self.connections[idx].active {
                    had_input |= self.drain_connection(idx, core);
                }
            }

            if block {
                self.update_unread();
                // Blocked for input, and this frame's inputs are all here.
                if self.ring.unread.frame > self.ring.self_cur.frame {
                    break;
                }
                // A pause landed mid-wait; the caller re-checks and idles.
                if self.remote_paused || self.local_paused {
                    break;
                }
                if !had_input {
                    self.wait_for_data();
                    debug!(
                        frame = %self.ring.self_cur.frame,
                        count = self.timeout_count,
                        of = self.max_retries,
                        "network is stalling"
                    );
                    if self.timeout_count >= self.max_retries && !self.remote_paused {
                        return Err(NetplayError::Stall {
                            frame: self.ring.self_cur.frame,
                            retries: self.timeout_count,
                        });
                    }
                }
            }

            if self.connections.iter().all(|c| !c.active) {
                break;
            }
            if !had_input && !block {
                break;
            }
        }
        Ok(())
    }

    /// Whether the slots for the next expected frames can be claimed.
    /// While they cannot, inbound bytes stay buffered (and, with the
    /// receive budget exhausted, in the peer's socket), which is the
    /// session's flow control against a source running further ahead
    /// than the ring can hold.
    fn ring_can_take_more(&mut self) -> bool {
        self.update_unread();
        let unread = self.ring.unread;
        if !self.ring.claim(unread.ptr, unread.frame, self.connected_players) {
            return false;
        }
        if !self.is_server {
            let server = self.ring.server;
            if !self.ring.claim(server.ptr, server.frame, self.connected_players) {
                return false;
            }
        }
        true
    }

    fn wait_for_data(&self) {
        let transports: SmallVec<[&dyn PeerTransport; 8]> = self
            .connections
            .iter()
            .filter(|c| c.active)
            .map(|c| c.transport.as_ref())
            .collect();
        if let Err(e) = tcp::wait_readable(&transports, Duration::from_millis(self.retry_ms)) {
            warn!("readiness poll failed: {e}");
        }
    }

    /// Reads and dispatches every complete command one connection has
    /// buffered. Returns whether any command was consumed.
    fn drain_connection(&mut self, idx: usize, core: &mut dyn EmulatorCore) -> bool {
        let mut had_input = false;
        'filling: loop {
            let fresh = {
                let conn = &mut self.connections[idx];
                match conn.recv.fill(conn.transport.as_mut()) {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("receive failed: {e}");
                        self.hangup(idx);
                        break 'filling;
                    }
                }
            };

            loop {
                if !self.ring_can_take_more() {
                    break 'filling;
                }
                let parsed = wire::parse(self.connections[idx].recv.available(), self.max_payload());
                match parsed {
                    Ok(Some((msg, used))) => {
                        self.connections[idx].recv.consume(used);
                        self.timeout_count = 0;
                        had_input = true;
                        trace!(cmd = msg.code(), "netplay command");
                        if let Err(err) = self.dispatch(idx, msg, core) {
                            self.fail_connection(idx, err);
                            break 'filling;
                        }
                        if !self.connections[idx].active {
                            // The handler hung us up (orderly DISCONNECT).
                            break 'filling;
                        }
                    }
                    Ok(None) => break,
                    Err(violation) => {
                        self.fail_connection(idx, CmdError::Nak(violation));
                        break 'filling;
                    }
                }
            }

            if fresh == 0 {
                break;
            }
        }
        had_input
    }

    pub(super) fn fail_connection(&mut self, idx: usize, err: CmdError) {
        match err {
            CmdError::Nak(violation) => {
                warn!(%violation, "refusing peer");
                // Best effort; the connection dies either way.
                let conn = &mut self.connections[idx];
                let _ = conn.queue(&Message::Nak).and_then(|()| conn.flush());
                self.hangup(idx);
            }
            CmdError::Hangup => self.hangup(idx),
        }
    }

    fn dispatch(
        &mut self,
        idx: usize,
        msg: Message,
        core: &mut dyn EmulatorCore,
    ) -> Result<(), CmdError> {
        if !self.connections[idx].mode.is_established() {
            return self.handshake_message(idx, msg, core);
        }
        match msg {
            Message::Ack => Ok(()),
            Message::Nak => Err(CmdError::Hangup),
            Message::Input {
                frame,
                player_tag,
                state,
            } => self.on_input(idx, frame, player_tag, state),
            Message::NoInput { frame } => self.on_noinput(frame),
            Message::FlipPlayers { frame } => self.on_flip_players(frame),
            Message::Spectate => self.on_spectate(idx),
            Message::Play => self.on_play(idx),
            Message::Mode { frame, tag } => self.on_mode(frame, tag),
            Message::Disconnect => {
                self.hangup(idx);
                Ok(())
            }
            Message::Crc { frame, crc } => self.on_crc(frame, crc),
            Message::RequestSavestate => self.on_request_savestate(),
            Message::LoadSavestate {
                frame,
                inflated_len,
                zbytes,
            } => self.on_load_savestate(idx, frame, inflated_len, &zbytes, core),
            Message::Pause => self.on_pause(idx),
            Message::Resume => self.on_resume(idx),
            // Handshake traffic after the handshake is over.
            Message::Hello { .. }
            | Message::Nick { .. }
            | Message::Password { .. }
            | Message::Sync { .. } => Err(CmdError::Nak(ProtocolViolation::WrongDirection {
                cmd: msg.code(),
            })),
        }
    }

    // ====================
    // Individual handlers
    // ====================

    fn on_input(
        &mut self,
        idx: usize,
        frame: Frame,
        player_tag: u32,
        state: InputWords,
    ) -> Result<(), CmdError> {
        let player = if self.is_server {
            // Ignore the claimed slot; a client speaks only for itself,
            // and a non-playing connection speaks for nobody.
            if self.connections[idx].mode != ConnectionMode::Playing {
                return Err(CmdError::Nak(ProtocolViolation::InputWithoutSlot));
            }
            self.connections[idx]
                .player
                .ok_or(CmdError::Nak(ProtocolViolation::InputWithoutSlot))?
        } else {
            let raw = player_tag & !INPUT_BIT_SERVER;
            if raw as usize >= MAX_PLAYERS {
                return Err(CmdError::Nak(ProtocolViolation::BadPlayer { player: raw }));
            }
            PlayerSlot::new(raw as usize)
        };
        if !self.connected_players.contains(player) {
            return Err(CmdError::Nak(ProtocolViolation::BadPlayer {
                player: player.as_usize() as u32,
            }));
        }

        let read = self.ring.read[player.as_usize()];
        if frame < read.frame {
            // Already had this; ignore the retransmission.
            trace!(%frame, %player, "duplicate input dropped");
            return Ok(());
        }
        if frame > read.frame {
            return Err(CmdError::Nak(ProtocolViolation::OutOfOrderInput {
                player,
                expected: read.frame,
                actual: frame,
            }));
        }

        if !self.ring.claim(read.ptr, frame, self.connected_players) {
            return Err(CmdError::Nak(ProtocolViolation::SlotUnavailable { frame }));
        }
        {
            let slot = self.ring.slot_mut(read.ptr);
            slot.real_input[player.as_usize()] = state;
            slot.have_real[player.as_usize()] = true;
        }
        self.ring.read[player.as_usize()] = self.ring.next(read);

        if self.is_server {
            // Authority amplification: past data fans out to everyone
            // else right away.
            if frame <= self.ring.self_cur.frame {
                self.send_input_frame(frame, player, player.as_usize() as u32, state, Some(idx));
            }
        } else if player_tag & INPUT_BIT_SERVER != 0 {
            self.ring.server = self.ring.read[player.as_usize()];
        }
        Ok(())
    }

    fn on_noinput(&mut self, frame: Frame) -> Result<(), CmdError> {
        if self.is_server {
            return Err(CmdError::Nak(ProtocolViolation::WrongDirection {
                cmd: Message::NoInput { frame }.code(),
            }));
        }
        if frame != self.ring.server.frame {
            return Err(CmdError::Nak(ProtocolViolation::FrameMismatch {
                cmd: Message::NoInput { frame }.code(),
                expected: self.ring.server.frame,
                actual: frame,
            }));
        }
        self.ring.server = self.ring.next(self.ring.server);
        Ok(())
    }

    fn on_flip_players(&mut self, flip_frame: Frame) -> Result<(), CmdError> {
        if self.is_server {
            return Err(CmdError::Nak(ProtocolViolation::WrongDirection {
                cmd: Message::FlipPlayers { frame: flip_frame }.code(),
            }));
        }
        if flip_frame < self.ring.server.frame {
            self.events.push_back(NetplayEvent::FlipInThePast);
            return Err(CmdError::Nak(ProtocolViolation::FrameMismatch {
                cmd: Message::FlipPlayers { frame: flip_frame }.code(),
                expected: self.ring.server.frame,
                actual: flip_frame,
            }));
        }
        self.flip = !self.flip;
        self.flip_frame = flip_frame;
        // Force a rewind so the flip materialises even where prediction
        // happened to match.
        if flip_frame < self.ring.self_cur.frame {
            self.force_rewind = true;
        }
        self.events.push_back(NetplayEvent::UsersFlipped { frame: flip_frame });
        Ok(())
    }

    fn on_spectate(&mut self, idx: usize) -> Result<(), CmdError> {
        if !self.is_server {
            return Err(CmdError::Nak(ProtocolViolation::WrongDirection {
                cmd: Message::Spectate.code(),
            }));
        }
        let player = self.connections[idx].player;
        let mut end_frame = Frame::ZERO;
        if self.connections[idx].mode == ConnectionMode::Playing {
            if let Some(p) = player {
                // The frame we have not received is their end frame.
                end_frame = self.ring.read[p.as_usize()].frame;
                self.connections[idx].mode = ConnectionMode::Spectating;
                self.connected_players.remove(p);
                self.broadcast(
                    &Message::Mode {
                        frame: end_frame,
                        tag: Self::mode_tag(p, false, false),
                    },
                    Some(idx),
                );
                self.events.push_back(NetplayEvent::PlayerLeft(p));
            }
        }
        // Tell the requester either way, even if they were confused.
        let p = player.unwrap_or(PlayerSlot::new(0));
        self.queue_and_flush(
            idx,
            &Message::Mode {
                frame: end_frame,
                tag: Self::mode_tag(p, false, true),
            },
        );
        Ok(())
    }

    fn on_play(&mut self, idx: usize) -> Result<(), CmdError> {
        if !self.is_server {
            return Err(CmdError::Nak(ProtocolViolation::WrongDirection {
                cmd: Message::Play.code(),
            }));
        }
        let frame = self.ring.self_cur.frame + 1;

        if self.connections[idx].mode == ConnectionMode::Playing {
            // Already playing; acknowledge the slot they hold.
            if let Some(p) = self.connections[idx].player {
                self.queue_and_flush(
                    idx,
                    &Message::Mode {
                        frame,
                        tag: Self::mode_tag(p, true, true),
                    },
                );
            }
            return Ok(());
        }

        // Lowest slot that is neither ours nor taken.
        let mut chosen = None;
        for s in 0..MAX_PLAYERS {
            let slot = PlayerSlot::new(s);
            if self.self_mode == ConnectionMode::Playing && self.self_player == Some(slot) {
                continue;
            }
            if self.connected_players.contains(slot) {
                continue;
            }
            chosen = Some(slot);
            break;
        }
        let Some(player) = chosen else {
            return Err(CmdError::Nak(ProtocolViolation::NoFreeSlot));
        };

        self.connections[idx].mode = ConnectionMode::Playing;
        self.connections[idx].player = Some(player);
        self.connected_players.insert(player);
        self.broadcast(
            &Message::Mode {
                frame,
                tag: Self::mode_tag(player, true, false),
            },
            Some(idx),
        );
        self.events.push_back(NetplayEvent::PlayerJoined(player));
        self.queue_and_flush(
            idx,
            &Message::Mode {
                frame,
                tag: Self::mode_tag(player, true, true),
            },
        );
        // And expect their data from the frame after the current one.
        self.ring.read[player.as_usize()] = self.ring.next(self.ring.self_cur);
        Ok(())
    }

    fn on_mode(&mut self, frame: Frame, tag: u32) -> Result<(), CmdError> {
        if self.is_server {
            return Err(CmdError::Nak(ProtocolViolation::WrongDirection {
                cmd: Message::Mode { frame, tag }.code(),
            }));
        }
        let raw = tag & MODE_PLAYER_MASK;
        if raw as usize >= MAX_PLAYERS {
            return Err(CmdError::Nak(ProtocolViolation::BadPlayer { player: raw }));
        }
        let player = PlayerSlot::new(raw as usize);
        let you = tag & MODE_BIT_YOU != 0;
        let playing = tag & MODE_BIT_PLAYING != 0;

        // Every field is validated before any session state changes.
        match (you, playing) {
            (true, true) => {
                if frame != self.ring.server.frame {
                    return Err(CmdError::Nak(ProtocolViolation::FrameMismatch {
                        cmd: Message::Mode { frame, tag }.code(),
                        expected: self.ring.server.frame,
                        actual: frame,
                    }));
                }
                if self.self_mode == ConnectionMode::Playing {
                    return Err(CmdError::Nak(ProtocolViolation::IllegalModeTransition));
                }
                self.self_mode = ConnectionMode::Playing;
                self.self_player = Some(player);
                // Changing past input requires a replay.
                if frame < self.ring.self_cur.frame {
                    self.force_rewind = true;
                }
                if frame <= self.ring.self_cur.frame {
                    self.backfill_own_input(player);
                } else {
                    self.zero_fill_until(player, frame);
                }
                self.events.push_back(NetplayEvent::YouJoined(player));
            }
            (true, false) => {
                // No longer playing, but we should already know this.
                if self.self_mode != ConnectionMode::Spectating {
                    return Err(CmdError::Nak(ProtocolViolation::IllegalModeTransition));
                }
                self.events.push_back(NetplayEvent::YouLeft);
            }
            (false, true) => {
                if frame != self.ring.server.frame {
                    return Err(CmdError::Nak(ProtocolViolation::FrameMismatch {
                        cmd: Message::Mode { frame, tag }.code(),
                        expected: self.ring.server.frame,
                        actual: frame,
                    }));
                }
                self.connected_players.insert(player);
                self.ring.read[player.as_usize()] = self.ring.server;
                if frame < self.ring.self_cur.frame {
                    self.force_rewind = true;
                }
                self.events.push_back(NetplayEvent::PlayerJoined(player));
            }
            (false, false) => {
                self.connected_players.remove(player);
                self.events.push_back(NetplayEvent::PlayerLeft(player));
            }
        }
        Ok(())
    }

    /// We were granted a slot effective at or before the current frame:
    /// our already-sampled inputs become authoritative and the host needs
    /// them.
    fn backfill_own_input(&mut self, player: PlayerSlot) {
        let mut cur = self.ring.server;
        loop {
            if !self.ring.ready(cur.ptr, cur.frame) || cur.frame > self.ring.self_cur.frame {
                break;
            }
            let sample = self.ring.slot(cur.ptr).self_state;
            {
                let slot = self.ring.slot_mut(cur.ptr);
                slot.real_input[player.as_usize()] = sample;
                slot.have_real[player.as_usize()] = true;
            }
            self.queue_and_flush(
                0,
                &Message::Input {
                    frame: cur.frame,
                    player_tag: player.as_usize() as u32,
                    state: sample,
                },
            );
            if cur.frame == self.ring.self_cur.frame {
                break;
            }
            cur = self.ring.next(cur);
        }
    }

    /// We were granted a slot effective in the future: the frames in
    /// between must neither capture nor transmit input.
    fn zero_fill_until(&mut self, player: PlayerSlot, frame: Frame) {
        let mut cur = self.ring.self_cur;
        while self.ring.ready(cur.ptr, cur.frame) && cur.frame < frame {
            let slot = self.ring.slot_mut(cur.ptr);
            slot.self_state = [0; crate::WORDS_PER_INPUT];
            slot.real_input[player.as_usize()] = [0; crate::WORDS_PER_INPUT];
            slot.have_local = true;
            cur = self.ring.next(cur);
        }
    }

    fn on_crc(&mut self, frame: Frame, crc: u32) -> Result<(), CmdError> {
        let Some(ptr) = self.ring.find_frame(frame) else {
            // Already recycled; nothing to compare against.
            return Ok(());
        };
        if frame <= self.ring.other.frame {
            // Fully known; check directly.
            if self.state_size == 0 {
                return Ok(());
            }
            let local = crate::checksum::crc32(&self.ring.slot(ptr).state);
            if local != crc {
                self.handle_desync(frame);
            }
        } else {
            // Not caught up yet; stash for the boundary crossing.
            self.ring.slot_mut(ptr).remote_crc = Some(crc);
        }
        Ok(())
    }

    pub(super) fn handle_desync(&mut self, frame: Frame) {
        warn!(%frame, "checksum mismatch");
        self.events.push_back(NetplayEvent::DesyncDetected { frame });
        if self.is_server {
            // The authoritative state repairs everyone.
            self.force_send_savestate = true;
        } else {
            self.request_savestate();
        }
    }

    /// Client: asks the host for a full state, at most one outstanding
    /// request at a time.
    pub(super) fn request_savestate(&mut self) {
        if self.is_server || self.savestate_request_outstanding {
            return;
        }
        if self.connections.is_empty() || !self.connections[0].active {
            return;
        }
        self.savestate_request_outstanding = true;
        self.queue_and_flush(0, &Message::RequestSavestate);
    }

    fn on_request_savestate(&mut self) -> Result<(), CmdError> {
        if !self.is_server {
            return Err(CmdError::Nak(ProtocolViolation::WrongDirection {
                cmd: Message::RequestSavestate.code(),
            }));
        }
        // Deferred to the next frame boundary so the state cannot
        // overtake input already queued for the pending frame.
        self.force_send_savestate = true;
        Ok(())
    }

    fn on_load_savestate(
        &mut self,
        idx: usize,
        frame: Frame,
        inflated_len: u32,
        zbytes: &[u8],
        core: &mut dyn EmulatorCore,
    ) -> Result<(), CmdError> {
        // A quirky core may not have revealed its state size yet; make
        // it. A freshly joined peer may simply not have asked its core
        // yet, which the ordinary lazy path covers.
        if self.quirks.contains(Quirks::INITIALIZATION) {
            self.wait_and_init_serialization(core);
        } else if self.state_size == 0 {
            self.ensure_serialization(core);
        }
        // Only players may load states.
        if self.connections[idx].mode != ConnectionMode::Playing {
            return Err(CmdError::Nak(ProtocolViolation::IllegalModeTransition));
        }
        let sender = self.connections[idx]
            .player
            .ok_or(CmdError::Nak(ProtocolViolation::IllegalModeTransition))?;
        let read = self.ring.read[sender.as_usize()];
        if frame != read.frame {
            return Err(CmdError::Nak(ProtocolViolation::FrameMismatch {
                cmd: wire::CMD_LOAD_SAVESTATE,
                expected: read.frame,
                actual: frame,
            }));
        }
        if inflated_len as usize != self.state_size {
            return Err(CmdError::Nak(ProtocolViolation::StateSizeMismatch {
                expected: self.state_size,
                actual: inflated_len as usize,
            }));
        }
        if zbytes.len() > self.zbuffer.len() {
            return Err(CmdError::Nak(ProtocolViolation::PayloadSize {
                cmd: wire::CMD_LOAD_SAVESTATE,
                actual: zbytes.len() + 8,
            }));
        }

        // Decompress straight into the target slot's state storage.
        let mut state = std::mem::take(&mut self.ring.slot_mut(read.ptr).state);
        if state.len() != self.state_size {
            state = vec![0; self.state_size];
        }
        let decompressed = self.compression.decompress(zbytes, &mut state);
        self.ring.slot_mut(read.ptr).state = state;
        if let Err(e) = decompressed {
            warn!("savestate rejected: {e}");
            return Err(CmdError::Nak(ProtocolViolation::CorruptSavestate));
        }

        // Skip ahead if it is past where we are. The next advance must
        // land exactly on the loaded frame, so `self` parks one short.
        if frame > self.ring.self_cur.frame {
            self.ring.self_cur = Cursor {
                ptr: self.ring.prev_ptr(read.ptr),
                frame: frame.saturating_prev(),
            };
        }
        // Don't expect earlier data from the other clients.
        for p in self.connected_players.iter() {
            if self.ring.read[p.as_usize()].frame < frame {
                self.ring.read[p.as_usize()] = read;
            }
        }
        self.force_rewind = true;
        self.savestate_request_outstanding = false;
        self.ring.other = read;
        debug!(%frame, "savestate accepted; rewinding onto it");
        Ok(())
    }

    fn on_pause(&mut self, idx: usize) -> Result<(), CmdError> {
        self.connections[idx].paused = true;
        self.remote_paused = true;
        let nick = self.connections[idx].nick.clone();
        self.events.push_back(NetplayEvent::PeerPaused { nick });
        self.broadcast(&Message::Pause, Some(idx));
        Ok(())
    }

    fn on_resume(&mut self, idx: usize) -> Result<(), CmdError> {
        self.connections[idx].paused = false;
        self.remote_paused = self.connections.iter().any(|c| c.active && c.paused);
        if !self.remote_paused {
            self.events.push_back(NetplayEvent::PeerResumed);
            if !self.local_paused {
                self.broadcast(&Message::Resume, Some(idx));
            }
        }
        Ok(())
    }
}
