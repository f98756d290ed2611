//! Connection handshake.
//!
//! Greeting, naming, authentication and frame synchronisation, in that
//! order. The host walks an incoming connection through
//! `Init -> PreNick -> PrePassword` and finishes it with a SYNC (plus a
//! savestate when it has one); the client mirrors the phases and adopts
//! the host's frame counter. Commands are carried in the ordinary framing,
//! so short reads are already handled before any of this runs.

use tracing::debug;

use crate::connection::ConnectionMode;
use crate::error::ProtocolViolation;
use crate::network::wire::{self, Message};
use crate::session::poll::CmdError;
use crate::session::session::NetplaySession;
use crate::{EmulatorCore, NetplayEvent, PlayerSet, PlayerSlot, MAX_PLAYERS};

impl NetplaySession {
    /// Dispatches a command for a connection that has not completed its
    /// handshake.
    pub(super) fn handshake_message(
        &mut self,
        idx: usize,
        msg: Message,
        core: &mut dyn EmulatorCore,
    ) -> Result<(), CmdError> {
        // A refusal or goodbye mid-handshake is a plain hangup.
        if matches!(msg, Message::Nak | Message::Disconnect) {
            return Err(CmdError::Hangup);
        }
        if self.is_server {
            self.handshake_host(idx, msg, core)
        } else {
            self.handshake_client(idx, msg)
        }
    }

    fn handshake_host(
        &mut self,
        idx: usize,
        msg: Message,
        core: &mut dyn EmulatorCore,
    ) -> Result<(), CmdError> {
        let mode = self.connections[idx].mode;
        match (mode, msg) {
            (ConnectionMode::Init, Message::Hello { magic, version }) => {
                check_greeting(magic, version)?;
                self.queue_and_flush(
                    idx,
                    &Message::Hello {
                        magic: wire::HELLO_MAGIC,
                        version: wire::PROTOCOL_VERSION,
                    },
                );
                self.connections[idx].mode = ConnectionMode::PreNick;
                Ok(())
            }
            (ConnectionMode::PreNick, Message::Nick { nick }) => {
                self.connections[idx].nick = wire::field_to_string(&nick);
                let own = wire::pad_field(&self.nick);
                self.queue_and_flush(idx, &Message::Nick { nick: own });
                self.connections[idx].mode = ConnectionMode::PrePassword;
                Ok(())
            }
            (ConnectionMode::PrePassword, Message::Password { secret }) => {
                let expected = wire::pad_field(self.password.as_deref().unwrap_or(""));
                if secret != expected {
                    return Err(CmdError::Nak(ProtocolViolation::BadPassword));
                }
                self.connections[idx].mode = ConnectionMode::PreSync;
                self.complete_host_handshake(idx, core);
                Ok(())
            }
            (_, other) => Err(CmdError::Nak(ProtocolViolation::WrongDirection {
                cmd: other.code(),
            })),
        }
    }

    /// Authenticated: synchronise the peer onto our frame counter, hand it
    /// our state when we can, and emit the current input batch.
    fn complete_host_handshake(&mut self, idx: usize, core: &mut dyn EmulatorCore) {
        self.ensure_serialization(core);
        let host_player = match self.playing_as() {
            Some(p) => p.as_usize() as u32,
            None => u32::MAX,
        };
        let sync = Message::Sync {
            frame: self.ring.self_cur.frame,
            connected: self.connected_players.bits(),
            flip_frame: self.flip_frame,
            flip: self.flip,
            host_player,
        };
        if !self.queue_and_flush(idx, &sync) {
            return;
        }
        self.connections[idx].mode = ConnectionMode::Connected;
        self.offer_savestate(idx, core);
        self.send_cur_input(idx);

        let nick = self.connections[idx].nick.clone();
        debug!(%nick, "peer connected");
        self.events.push_back(NetplayEvent::PeerConnected { nick });
    }

    fn handshake_client(&mut self, idx: usize, msg: Message) -> Result<(), CmdError> {
        let mode = self.connections[idx].mode;
        match (mode, msg) {
            (ConnectionMode::Init, Message::Hello { magic, version }) => {
                check_greeting(magic, version)?;
                let own = wire::pad_field(&self.nick);
                self.queue_and_flush(idx, &Message::Nick { nick: own });
                self.connections[idx].mode = ConnectionMode::PreNick;
                Ok(())
            }
            (ConnectionMode::PreNick, Message::Nick { nick }) => {
                self.connections[idx].nick = wire::field_to_string(&nick);
                self.connections[idx].mode = ConnectionMode::PrePassword;
                let secret = wire::pad_field(self.password.as_deref().unwrap_or(""));
                self.queue_and_flush(idx, &Message::Password { secret });
                self.connections[idx].mode = ConnectionMode::PreSync;
                Ok(())
            }
            (
                ConnectionMode::PreSync,
                Message::Sync {
                    frame,
                    connected,
                    flip_frame,
                    flip,
                    host_player,
                },
            ) => {
                if host_player != u32::MAX && host_player as usize >= MAX_PLAYERS {
                    return Err(CmdError::Nak(ProtocolViolation::BadPlayer {
                        player: host_player,
                    }));
                }
                // Adopt the host's view wholesale.
                self.ring.reset_all(frame);
                self.connected_players = PlayerSet::from_bits(connected);
                self.flip_frame = flip_frame;
                self.flip = flip;
                self.self_mode = ConnectionMode::Spectating;
                if host_player != u32::MAX {
                    let host_slot = PlayerSlot::new(host_player as usize);
                    self.connections[idx].mode = ConnectionMode::Playing;
                    self.connections[idx].player = Some(host_slot);
                    self.connected_players.insert(host_slot);
                    self.ring.read[host_slot.as_usize()] = self.ring.server;
                } else {
                    self.connections[idx].mode = ConnectionMode::Connected;
                }

                let nick = self.connections[idx].nick.clone();
                debug!(%nick, %frame, "connected to host");
                self.events.push_back(NetplayEvent::PeerConnected { nick });

                self.send_cur_input(idx);
                if self.auto_play {
                    self.request_play();
                }
                Ok(())
            }
            (_, other) => Err(CmdError::Nak(ProtocolViolation::WrongDirection {
                cmd: other.code(),
            })),
        }
    }
}

fn check_greeting(magic: u32, version: u32) -> Result<(), CmdError> {
    if magic != wire::HELLO_MAGIC || version != wire::PROTOCOL_VERSION {
        return Err(CmdError::Nak(ProtocolViolation::BadGreeting { magic, version }));
    }
    Ok(())
}
