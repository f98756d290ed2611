use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, PlayerSlot};

/// Why an incoming command was refused.
///
/// Structured data instead of formatted strings keeps construction cheap on
/// the receive path; the message is only rendered when somebody displays
/// the error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolViolation {
    /// A command code outside the known set.
    UnknownCommand {
        /// The raw command code.
        cmd: u32,
    },
    /// The advertised payload length does not match the command.
    PayloadSize {
        /// The raw command code.
        cmd: u32,
        /// The length carried on the wire.
        actual: usize,
    },
    /// INPUT arrived for a frame later than the next expected one.
    OutOfOrderInput {
        /// The player the input claims to be for.
        player: PlayerSlot,
        /// The next frame the session would accept.
        expected: Frame,
        /// The frame the input carried.
        actual: Frame,
    },
    /// INPUT from a connection that holds no player slot.
    InputWithoutSlot,
    /// The ring slot for an expected frame could not be recycled.
    SlotUnavailable {
        /// The frame that had nowhere to go.
        frame: Frame,
    },
    /// A frame field disagreed with the session cursor it must match.
    FrameMismatch {
        /// The raw command code.
        cmd: u32,
        /// The frame the session expected.
        expected: Frame,
        /// The frame carried on the wire.
        actual: Frame,
    },
    /// A mode notification that is not legal in the current state.
    IllegalModeTransition,
    /// A player slot outside the valid range, or not currently connected.
    BadPlayer {
        /// The raw slot value.
        player: u32,
    },
    /// A command sent in a direction the protocol does not allow.
    WrongDirection {
        /// The raw command code.
        cmd: u32,
    },
    /// A savestate whose inflated size does not match the known state size.
    StateSizeMismatch {
        /// The size the session serializes to.
        expected: usize,
        /// The size claimed on the wire.
        actual: usize,
    },
    /// The peer refused to grant a player slot.
    NoFreeSlot,
    /// A savestate that would not decompress to the promised bytes.
    CorruptSavestate,
    /// Handshake greeting carried an unknown magic or version.
    BadGreeting {
        /// The magic received.
        magic: u32,
        /// The version received.
        version: u32,
    },
    /// The password did not match.
    BadPassword,
    /// The peer answered with NAK; the connection must be dropped.
    PeerRefused,
}

impl Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCommand { cmd } => write!(f, "unknown netplay command 0x{cmd:08x}"),
            Self::PayloadSize { cmd, actual } => {
                write!(f, "command 0x{cmd:08x} carried an unexpected payload size {actual}")
            }
            Self::OutOfOrderInput {
                player,
                expected,
                actual,
            } => write!(
                f,
                "out-of-order input for {player} (expected frame {expected}, got {actual})"
            ),
            Self::InputWithoutSlot => write!(f, "input from a connection that is not playing"),
            Self::SlotUnavailable { frame } => {
                write!(f, "no ring slot available for frame {frame}")
            }
            Self::FrameMismatch {
                cmd,
                expected,
                actual,
            } => write!(
                f,
                "command 0x{cmd:08x} frame {actual} disagrees with expected frame {expected}"
            ),
            Self::IllegalModeTransition => write!(f, "illegal mode transition"),
            Self::BadPlayer { player } => write!(f, "invalid player slot {player}"),
            Self::WrongDirection { cmd } => {
                write!(f, "command 0x{cmd:08x} is not valid from this peer")
            }
            Self::StateSizeMismatch { expected, actual } => write!(
                f,
                "savestate inflated size {actual} does not match state size {expected}"
            ),
            Self::NoFreeSlot => write!(f, "no free player slot"),
            Self::CorruptSavestate => write!(f, "savestate did not decompress to the promised size"),
            Self::BadGreeting { magic, version } => write!(
                f,
                "unrecognised greeting (magic 0x{magic:08x}, version {version})"
            ),
            Self::BadPassword => write!(f, "password mismatch"),
            Self::PeerRefused => write!(f, "peer refused the connection (NAK)"),
        }
    }
}

/// Why serialization never became available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StateInitReason {
    /// The core never revealed a serialized state size.
    SizeUnknown,
    /// The core reported a size but refused to serialize into it.
    SerializeFailed,
}

impl Display for StateInitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeUnknown => write!(f, "core never revealed its serialized state size"),
            Self::SerializeFailed => write!(f, "core refused to serialize its state"),
        }
    }
}

/// Unrecoverable construction or configuration failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FatalReason {
    /// A delay budget of zero would size the ring at a single slot.
    ZeroDelayFrames,
    /// A nickname longer than the fixed wire field.
    NickTooLong {
        /// Length in bytes of the offending nickname.
        len: usize,
    },
    /// A password longer than the fixed wire field.
    PasswordTooLong {
        /// Length in bytes of the offending password.
        len: usize,
    },
}

impl Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroDelayFrames => write!(f, "delay_frames must be at least 1"),
            Self::NickTooLong { len } => {
                write!(f, "nickname of {len} bytes exceeds the wire field")
            }
            Self::PasswordTooLong { len } => {
                write!(f, "password of {len} bytes exceeds the wire field")
            }
        }
    }
}

/// All errors this library can return.
///
/// Transport and protocol failures on a single connection are handled
/// internally by hanging that connection up; they reach the caller only
/// when the session cannot continue at all.
#[derive(Debug)]
#[non_exhaustive]
pub enum NetplayError {
    /// A socket failed or reached EOF where more data was required.
    Transport {
        /// What the session was doing when the socket failed.
        context: &'static str,
        /// The underlying I/O error.
        source: std::io::Error,
    },
    /// A peer broke the protocol.
    Protocol {
        /// The specific violation.
        violation: ProtocolViolation,
    },
    /// The emulator core never became serializable. The session is
    /// degraded to lockstep.
    StateInit {
        /// Why initialization failed.
        reason: StateInitReason,
    },
    /// Every retry waiting on remote input expired with no peer paused.
    /// The frontend should tear the session down.
    Stall {
        /// The frame the session is stuck at.
        frame: Frame,
        /// How many waits expired.
        retries: u32,
    },
    /// The session cannot exist as configured.
    Fatal {
        /// The configuration failure.
        reason: FatalReason,
    },
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport { context, source } => {
                write!(f, "transport failure while {context}: {source}")
            }
            Self::Protocol { violation } => write!(f, "protocol violation: {violation}"),
            Self::StateInit { reason } => write!(f, "state initialization failed: {reason}"),
            Self::Stall { frame, retries } => write!(
                f,
                "network is stalling at frame {frame} after {retries} retries"
            ),
            Self::Fatal { reason } => write!(f, "fatal: {reason}"),
        }
    }
}

impl Error for NetplayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl NetplayError {
    pub(crate) fn transport(context: &'static str, source: std::io::Error) -> Self {
        Self::Transport { context, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_display() {
        let v = ProtocolViolation::OutOfOrderInput {
            player: PlayerSlot::new(1),
            expected: Frame::new(30),
            actual: Frame::new(32),
        };
        let msg = v.to_string();
        assert!(msg.contains("player 2"));
        assert!(msg.contains("30"));
        assert!(msg.contains("32"));
    }

    #[test]
    fn error_display_and_source() {
        let err = NetplayError::transport(
            "flushing send buffer",
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"),
        );
        assert!(err.to_string().contains("flushing send buffer"));
        assert!(err.source().is_some());

        let stall = NetplayError::Stall {
            frame: Frame::new(120),
            retries: 16,
        };
        assert!(stall.to_string().contains("120"));
        assert!(stall.source().is_none());
    }

    #[test]
    fn fatal_display() {
        let err = NetplayError::Fatal {
            reason: FatalReason::ZeroDelayFrames,
        };
        assert!(err.to_string().contains("delay_frames"));
    }
}
