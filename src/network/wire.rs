//! Command framing and payload codec.
//!
//! Every on-wire message is `[cmd: u32 BE][len: u32 BE][payload: len bytes]`
//! and every multi-byte integer inside a payload is big-endian. The length
//! must match the command's declared payload size; anything else is a
//! protocol violation the receiver answers with NAK before hanging up.

use crate::error::ProtocolViolation;
use crate::{Frame, InputWords, WORDS_PER_FRAME, WORDS_PER_INPUT};

/// Bytes of the `[cmd][len]` frame header.
pub const HEADER_LEN: usize = 8;

/// Fixed width of the nickname and password wire fields.
pub const NICK_LEN: usize = 32;

/// Greeting magic, `"RPLY"`.
pub const HELLO_MAGIC: u32 = 0x5250_4C59;

/// Protocol revision carried in the greeting.
pub const PROTOCOL_VERSION: u32 = 1;

/// High bit of the INPUT player tag: the sample comes from the host and is
/// authoritative for the `server` cursor on the client receive path.
pub const INPUT_BIT_SERVER: u32 = 0x8000_0000;

/// MODE tag bit: the notification targets the recipient.
pub const MODE_BIT_YOU: u32 = 0x4000_0000;

/// MODE tag bit: the player is joining; absent means leaving.
pub const MODE_BIT_PLAYING: u32 = 0x2000_0000;

/// Mask of the player slot inside a MODE tag.
pub const MODE_PLAYER_MASK: u32 = 0x0000_FFFF;

pub(crate) const CMD_ACK: u32 = 0;
pub(crate) const CMD_NAK: u32 = 1;
pub(crate) const CMD_INPUT: u32 = 2;
pub(crate) const CMD_NOINPUT: u32 = 3;
pub(crate) const CMD_FLIP_PLAYERS: u32 = 4;
pub(crate) const CMD_SPECTATE: u32 = 5;
pub(crate) const CMD_PLAY: u32 = 6;
pub(crate) const CMD_MODE: u32 = 7;
pub(crate) const CMD_DISCONNECT: u32 = 8;
pub(crate) const CMD_CRC: u32 = 9;
pub(crate) const CMD_REQUEST_SAVESTATE: u32 = 10;
pub(crate) const CMD_LOAD_SAVESTATE: u32 = 11;
pub(crate) const CMD_PAUSE: u32 = 12;
pub(crate) const CMD_RESUME: u32 = 13;
pub(crate) const CMD_HELLO: u32 = 16;
pub(crate) const CMD_NICK: u32 = 17;
pub(crate) const CMD_PASSWORD: u32 = 18;
pub(crate) const CMD_SYNC: u32 = 19;

/// A parsed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Informational; ignored on receipt.
    Ack,
    /// The sender refuses; the receiver must disconnect.
    Nak,
    /// Authoritative input for one (frame, player) pair.
    Input {
        /// The frame the sample belongs to.
        frame: Frame,
        /// Player slot in the low bits, [`INPUT_BIT_SERVER`] in the top.
        player_tag: u32,
        /// The input sample.
        state: InputWords,
    },
    /// The host had nothing to contribute for `frame`.
    NoInput {
        /// The acknowledged frame.
        frame: Frame,
    },
    /// Toggle the port mapping starting at `frame`.
    FlipPlayers {
        /// First frame with the toggled mapping.
        frame: Frame,
    },
    /// Request to leave the playing set.
    Spectate,
    /// Request a player slot.
    Play,
    /// Slot assignment or membership notification.
    Mode {
        /// The frame the change takes effect at.
        frame: Frame,
        /// Player slot plus [`MODE_BIT_YOU`] / [`MODE_BIT_PLAYING`].
        tag: u32,
    },
    /// Orderly close; the receiver hangs up.
    Disconnect,
    /// The sender's checksum for `frame`.
    Crc {
        /// The checksummed frame.
        frame: Frame,
        /// The CRC-32 of the serialized state at that frame.
        crc: u32,
    },
    /// Ask the host for a full state to resync.
    RequestSavestate,
    /// A compressed snapshot to apply at `frame`.
    LoadSavestate {
        /// The frame the snapshot belongs to.
        frame: Frame,
        /// Size of the snapshot once decompressed.
        inflated_len: u32,
        /// The compressed snapshot bytes.
        zbytes: Vec<u8>,
    },
    /// The sender paused; the recipient stalls advancing.
    Pause,
    /// The sender resumed.
    Resume,
    /// Handshake greeting.
    Hello {
        /// Must equal [`HELLO_MAGIC`].
        magic: u32,
        /// Must equal [`PROTOCOL_VERSION`].
        version: u32,
    },
    /// Handshake nickname exchange.
    Nick {
        /// NUL-padded UTF-8 display name.
        nick: [u8; NICK_LEN],
    },
    /// Handshake shared secret. All zeroes when none is configured.
    Password {
        /// NUL-padded secret.
        secret: [u8; NICK_LEN],
    },
    /// Handshake frame synchronisation, host to client.
    Sync {
        /// The host's current frame; the client adopts it for every cursor.
        frame: Frame,
        /// Bitmask of currently playing remote slots.
        connected: u32,
        /// The currently scheduled flip frame (0 when none).
        flip_frame: Frame,
        /// The recorded flip toggle accompanying `flip_frame`.
        flip: bool,
        /// The host's own slot, `u32::MAX` when the host spectates.
        host_player: u32,
    },
}

impl Message {
    /// The wire command code for this message.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::Ack => CMD_ACK,
            Self::Nak => CMD_NAK,
            Self::Input { .. } => CMD_INPUT,
            Self::NoInput { .. } => CMD_NOINPUT,
            Self::FlipPlayers { .. } => CMD_FLIP_PLAYERS,
            Self::Spectate => CMD_SPECTATE,
            Self::Play => CMD_PLAY,
            Self::Mode { .. } => CMD_MODE,
            Self::Disconnect => CMD_DISCONNECT,
            Self::Crc { .. } => CMD_CRC,
            Self::RequestSavestate => CMD_REQUEST_SAVESTATE,
            Self::LoadSavestate { .. } => CMD_LOAD_SAVESTATE,
            Self::Pause => CMD_PAUSE,
            Self::Resume => CMD_RESUME,
            Self::Hello { .. } => CMD_HELLO,
            Self::Nick { .. } => CMD_NICK,
            Self::Password { .. } => CMD_PASSWORD,
            Self::Sync { .. } => CMD_SYNC,
        }
    }
}

#[inline]
fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

#[inline]
fn get_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Appends the framed encoding of `msg` to `out`.
pub fn encode_into(msg: &Message, out: &mut Vec<u8>) {
    put_u32(out, msg.code());
    let len_at = out.len();
    put_u32(out, 0);
    match msg {
        Message::Ack
        | Message::Nak
        | Message::Spectate
        | Message::Play
        | Message::Disconnect
        | Message::RequestSavestate
        | Message::Pause
        | Message::Resume => {}
        Message::Input {
            frame,
            player_tag,
            state,
        } => {
            put_u32(out, frame.as_u32());
            put_u32(out, *player_tag);
            for word in state {
                put_u32(out, *word);
            }
        }
        Message::NoInput { frame } | Message::FlipPlayers { frame } => {
            put_u32(out, frame.as_u32());
        }
        Message::Mode { frame, tag } => {
            put_u32(out, frame.as_u32());
            put_u32(out, *tag);
        }
        Message::Crc { frame, crc } => {
            put_u32(out, frame.as_u32());
            put_u32(out, *crc);
        }
        Message::LoadSavestate {
            frame,
            inflated_len,
            zbytes,
        } => {
            put_u32(out, frame.as_u32());
            put_u32(out, *inflated_len);
            out.extend_from_slice(zbytes);
        }
        Message::Hello { magic, version } => {
            put_u32(out, *magic);
            put_u32(out, *version);
        }
        Message::Nick { nick } => out.extend_from_slice(nick),
        Message::Password { secret } => out.extend_from_slice(secret),
        Message::Sync {
            frame,
            connected,
            flip_frame,
            flip,
            host_player,
        } => {
            put_u32(out, frame.as_u32());
            put_u32(out, *connected);
            put_u32(out, flip_frame.as_u32());
            put_u32(out, u32::from(*flip));
            put_u32(out, *host_player);
        }
    }
    let payload_len = (out.len() - len_at - 4) as u32;
    out[len_at..len_at + 4].copy_from_slice(&payload_len.to_be_bytes());
}

/// Encodes `msg` into a fresh buffer.
#[must_use]
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + 16);
    encode_into(msg, &mut out);
    out
}

fn fixed(cmd: u32, payload: &[u8], expected: usize) -> Result<(), ProtocolViolation> {
    if payload.len() == expected {
        Ok(())
    } else {
        Err(ProtocolViolation::PayloadSize {
            cmd,
            actual: payload.len(),
        })
    }
}

fn decode_body(cmd: u32, payload: &[u8]) -> Result<Message, ProtocolViolation> {
    match cmd {
        CMD_ACK => fixed(cmd, payload, 0).map(|()| Message::Ack),
        CMD_NAK => fixed(cmd, payload, 0).map(|()| Message::Nak),
        CMD_SPECTATE => fixed(cmd, payload, 0).map(|()| Message::Spectate),
        CMD_PLAY => fixed(cmd, payload, 0).map(|()| Message::Play),
        CMD_DISCONNECT => fixed(cmd, payload, 0).map(|()| Message::Disconnect),
        CMD_REQUEST_SAVESTATE => fixed(cmd, payload, 0).map(|()| Message::RequestSavestate),
        CMD_PAUSE => fixed(cmd, payload, 0).map(|()| Message::Pause),
        CMD_RESUME => fixed(cmd, payload, 0).map(|()| Message::Resume),
        CMD_INPUT => {
            fixed(cmd, payload, WORDS_PER_FRAME * 4)?;
            let mut state = [0u32; WORDS_PER_INPUT];
            for (i, word) in state.iter_mut().enumerate() {
                *word = get_u32(payload, 8 + i * 4);
            }
            Ok(Message::Input {
                frame: Frame::new(get_u32(payload, 0)),
                player_tag: get_u32(payload, 4),
                state,
            })
        }
        CMD_NOINPUT => {
            fixed(cmd, payload, 4)?;
            Ok(Message::NoInput {
                frame: Frame::new(get_u32(payload, 0)),
            })
        }
        CMD_FLIP_PLAYERS => {
            fixed(cmd, payload, 4)?;
            Ok(Message::FlipPlayers {
                frame: Frame::new(get_u32(payload, 0)),
            })
        }
        CMD_MODE => {
            fixed(cmd, payload, 8)?;
            Ok(Message::Mode {
                frame: Frame::new(get_u32(payload, 0)),
                tag: get_u32(payload, 4),
            })
        }
        CMD_CRC => {
            fixed(cmd, payload, 8)?;
            Ok(Message::Crc {
                frame: Frame::new(get_u32(payload, 0)),
                crc: get_u32(payload, 4),
            })
        }
        CMD_LOAD_SAVESTATE => {
            if payload.len() < 8 {
                return Err(ProtocolViolation::PayloadSize {
                    cmd,
                    actual: payload.len(),
                });
            }
            Ok(Message::LoadSavestate {
                frame: Frame::new(get_u32(payload, 0)),
                inflated_len: get_u32(payload, 4),
                zbytes: payload[8..].to_vec(),
            })
        }
        CMD_HELLO => {
            fixed(cmd, payload, 8)?;
            Ok(Message::Hello {
                magic: get_u32(payload, 0),
                version: get_u32(payload, 4),
            })
        }
        CMD_NICK => {
            fixed(cmd, payload, NICK_LEN)?;
            let mut nick = [0u8; NICK_LEN];
            nick.copy_from_slice(payload);
            Ok(Message::Nick { nick })
        }
        CMD_PASSWORD => {
            fixed(cmd, payload, NICK_LEN)?;
            let mut secret = [0u8; NICK_LEN];
            secret.copy_from_slice(payload);
            Ok(Message::Password { secret })
        }
        CMD_SYNC => {
            fixed(cmd, payload, 20)?;
            Ok(Message::Sync {
                frame: Frame::new(get_u32(payload, 0)),
                connected: get_u32(payload, 4),
                flip_frame: Frame::new(get_u32(payload, 8)),
                flip: get_u32(payload, 12) != 0,
                host_player: get_u32(payload, 16),
            })
        }
        other => Err(ProtocolViolation::UnknownCommand { cmd: other }),
    }
}

/// Attempts to parse one complete message from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a full command
/// (short read); the caller keeps the bytes and retries after the next
/// receive. On success returns the message and the number of bytes it
/// occupied. A payload longer than `max_payload` is a violation even
/// before its bytes arrive, so oversized frames are refused early instead
/// of buffered forever.
pub fn parse(buf: &[u8], max_payload: usize) -> Result<Option<(Message, usize)>, ProtocolViolation> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let cmd = get_u32(buf, 0);
    let len = get_u32(buf, 4) as usize;
    if len > max_payload {
        return Err(ProtocolViolation::PayloadSize { cmd, actual: len });
    }
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }
    let msg = decode_body(cmd, &buf[HEADER_LEN..HEADER_LEN + len])?;
    Ok(Some((msg, HEADER_LEN + len)))
}

/// Pads a display name or password into its fixed wire field.
#[must_use]
pub fn pad_field(s: &str) -> [u8; NICK_LEN] {
    let mut out = [0u8; NICK_LEN];
    let bytes = s.as_bytes();
    let n = bytes.len().min(NICK_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Recovers a string from a NUL-padded wire field.
#[must_use]
pub fn field_to_string(field: &[u8; NICK_LEN]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(NICK_LEN);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1 << 20;

    fn roundtrip(msg: Message) {
        let bytes = encode(&msg);
        let (parsed, consumed) = parse(&bytes, MAX).expect("parse").expect("complete");
        assert_eq!(parsed, msg);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn roundtrip_every_command() {
        roundtrip(Message::Ack);
        roundtrip(Message::Nak);
        roundtrip(Message::Input {
            frame: Frame::new(11),
            player_tag: INPUT_BIT_SERVER,
            state: [0x100, 0, 0],
        });
        roundtrip(Message::NoInput {
            frame: Frame::new(7),
        });
        roundtrip(Message::FlipPlayers {
            frame: Frame::new(100),
        });
        roundtrip(Message::Spectate);
        roundtrip(Message::Play);
        roundtrip(Message::Mode {
            frame: Frame::new(201),
            tag: MODE_BIT_YOU | MODE_BIT_PLAYING | 2,
        });
        roundtrip(Message::Disconnect);
        roundtrip(Message::Crc {
            frame: Frame::new(50),
            crc: 0xDEAD_BEEF,
        });
        roundtrip(Message::RequestSavestate);
        roundtrip(Message::LoadSavestate {
            frame: Frame::new(51),
            inflated_len: 64,
            zbytes: vec![1, 2, 3, 4],
        });
        roundtrip(Message::Pause);
        roundtrip(Message::Resume);
        roundtrip(Message::Hello {
            magic: HELLO_MAGIC,
            version: PROTOCOL_VERSION,
        });
        roundtrip(Message::Nick {
            nick: pad_field("player-one"),
        });
        roundtrip(Message::Password {
            secret: pad_field("hunter2"),
        });
        roundtrip(Message::Sync {
            frame: Frame::new(200),
            connected: 0b10,
            flip_frame: Frame::ZERO,
            flip: false,
            host_player: 0,
        });
    }

    #[test]
    fn input_payload_is_five_words() {
        let bytes = encode(&Message::Input {
            frame: Frame::new(1),
            player_tag: 0,
            state: [0; 3],
        });
        assert_eq!(bytes.len(), HEADER_LEN + 20);
        assert_eq!(&bytes[0..4], &CMD_INPUT.to_be_bytes());
        assert_eq!(&bytes[4..8], &20u32.to_be_bytes());
    }

    #[test]
    fn short_reads_return_none() {
        let bytes = encode(&Message::Crc {
            frame: Frame::new(5),
            crc: 9,
        });
        for cut in 0..bytes.len() {
            assert_eq!(parse(&bytes[..cut], MAX).expect("parse"), None);
        }
    }

    #[test]
    fn unknown_command_is_a_violation() {
        let mut bytes = Vec::new();
        put_u32(&mut bytes, 0xBEEF);
        put_u32(&mut bytes, 0);
        assert!(matches!(
            parse(&bytes, MAX),
            Err(ProtocolViolation::UnknownCommand { cmd: 0xBEEF })
        ));
    }

    #[test]
    fn wrong_payload_size_is_a_violation() {
        let mut bytes = Vec::new();
        put_u32(&mut bytes, CMD_NOINPUT);
        put_u32(&mut bytes, 8);
        bytes.extend_from_slice(&[0; 8]);
        assert!(matches!(
            parse(&bytes, MAX),
            Err(ProtocolViolation::PayloadSize { cmd: CMD_NOINPUT, actual: 8 })
        ));
    }

    #[test]
    fn oversized_payload_refused_before_arrival() {
        let mut bytes = Vec::new();
        put_u32(&mut bytes, CMD_LOAD_SAVESTATE);
        put_u32(&mut bytes, 1 << 30);
        assert!(matches!(
            parse(&bytes, 4096),
            Err(ProtocolViolation::PayloadSize { .. })
        ));
    }

    #[test]
    fn field_padding_roundtrip() {
        let field = pad_field("nickname");
        assert_eq!(field_to_string(&field), "nickname");
        assert_eq!(field_to_string(&pad_field("")), "");
        // Overlong names are truncated at the field width.
        let long = "x".repeat(50);
        assert_eq!(field_to_string(&pad_field(&long)).len(), NICK_LEN);
    }
}
