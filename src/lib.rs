//! # rollplay
//!
//! Rollplay is a rollback netcode core for deterministic emulator-style
//! simulations, speaking an ordered big-endian command protocol over TCP.
//! Two or more participants co-operatively advance a deterministic
//! simulation by exchanging per-frame input samples. The local simulation
//! runs speculatively using predicted remote input and transparently
//! rewinds and re-runs frames whenever real remote input turns out to
//! differ from the prediction. A designated host authoritatively arbitrates
//! player slot assignment, state resynchronisation and peer membership.
//!
//! The crate deliberately owns only the hard parts: the frame ring and its
//! cursor invariants, the wire protocol and its command state machine, the
//! connection lifecycle, CRC-based desync detection with savestate-driven
//! recovery, and pause/resume plus slot (re)assignment semantics. The
//! emulator core itself, NAT traversal and the compression codec stay
//! behind narrow traits ([`EmulatorCore`], [`CompressionBackend`]).
//!
//! ## Quick start
//!
//! ```no_run
//! use rollplay::{SessionBuilder, EmulatorCore, InputWords, MAX_PLAYERS};
//!
//! # struct MyCore;
//! # impl EmulatorCore for MyCore {
//! #     fn serialize_size(&mut self) -> usize { 8 }
//! #     fn serialize(&mut self, buf: &mut [u8]) -> bool { buf.fill(0); true }
//! #     fn unserialize(&mut self, _buf: &[u8]) -> bool { true }
//! #     fn run_frame(&mut self, _inputs: &[InputWords; MAX_PLAYERS]) {}
//! # }
//! let mut core = MyCore;
//! let mut session = SessionBuilder::new()
//!     .nick("player-one")
//!     .delay_frames(4)
//!     .check_frames(60)
//!     .start_host(55435)?;
//!
//! loop {
//!     session.poll(&mut core)?;
//!     let local_input: InputWords = [0; 3]; // sampled by the frontend
//!     session.advance_frame(&mut core, local_input)?;
//!     for event in session.events() {
//!         println!("{event}");
//!     }
//! #   break;
//! }
//! # Ok::<(), rollplay::NetplayError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

use serde::{Deserialize, Serialize};

pub use error::{FatalReason, NetplayError, ProtocolViolation, StateInitReason};
pub use session::builder::SessionBuilder;
pub use session::NetplaySession;

pub mod checksum;
pub(crate) mod connection;
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_ring;
#[doc(hidden)]
pub mod input;
#[doc(hidden)]
pub mod network {
    //! Wire protocol, transports and buffering.
    pub mod buffer;
    pub mod compression;
    pub mod memory;
    pub mod tcp;
    pub mod wire;
}
#[doc(hidden)]
pub mod session {
    //! Session orchestration: builder, command dispatch, rollback control.
    pub mod builder;
    mod handshake;
    mod poll;
    #[allow(clippy::module_inception)]
    mod session;
    mod sync;
    pub use session::NetplaySession;
}

pub use network::compression::CompressionBackend;
pub use network::memory::MemoryTransport;
pub use network::tcp::{PeerTransport, TcpPeer};

/// A specialized `Result` type for rollplay operations.
///
/// Named `NetplayResult` rather than `Result` so glob imports do not shadow
/// `std::result::Result`.
pub type NetplayResult<T, E = NetplayError> = std::result::Result<T, E>;

// #############
// # CONSTANTS #
// #############

/// Maximum number of player slots a session can arbitrate.
pub const MAX_PLAYERS: usize = 16;

/// Number of 32-bit words in one input sample: one digital word followed by
/// two analog words.
pub const WORDS_PER_INPUT: usize = 3;

/// Words in an INPUT payload: frame, player tag, then the input sample.
pub(crate) const WORDS_PER_FRAME: usize = 2 + WORDS_PER_INPUT;

/// One player's input sample for a single frame.
pub type InputWords = [u32; WORDS_PER_INPUT];

/// Default mask of the directional bits inside the digital input word.
/// Bits 4 through 7 carry up, down, left and right.
pub const DEFAULT_DIRECTIONAL_MASK: u32 = 0x0000_00F0;

/// A logical frame counter.
///
/// Frames are monotonically increasing 32-bit counters, independent of the
/// ring slot that currently holds them. Frame 0 is the first simulated
/// frame.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Frame(u32);

impl Frame {
    /// The first frame of a session.
    pub const ZERO: Self = Self(0);

    /// Creates a new `Frame` from a raw counter value.
    #[inline]
    #[must_use]
    pub const fn new(frame: u32) -> Self {
        Self(frame)
    }

    /// Returns the underlying counter value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the next frame, or `None` on counter overflow.
    #[inline]
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(f) => Some(Self(f)),
            None => None,
        }
    }

    /// Returns the previous frame, saturating at frame 0.
    #[inline]
    #[must_use]
    pub const fn saturating_prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Distance from `earlier` to `self`, saturating at 0 when `earlier`
    /// is actually later.
    #[inline]
    #[must_use]
    pub const fn since(self, earlier: Self) -> u32 {
        self.0.saturating_sub(earlier.0)
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u32> for Frame {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl std::ops::AddAssign<u32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl From<u32> for Frame {
    #[inline]
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Frame> for u32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<u32> for Frame {
    #[inline]
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<u32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// Identity of an input producer.
///
/// The host typically occupies slot 0; additional peers are assigned
/// slots `1..` as they request to play. Always less than [`MAX_PLAYERS`].
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PlayerSlot(usize);

impl PlayerSlot {
    /// Creates a new slot identity. Does not validate against a session;
    /// use [`PlayerSlot::is_valid`] for that.
    #[inline]
    #[must_use]
    pub const fn new(slot: usize) -> Self {
        Self(slot)
    }

    /// Returns the underlying slot index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Whether the slot index is within [`MAX_PLAYERS`].
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 < MAX_PLAYERS
    }
}

impl std::fmt::Display for PlayerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "player {}", self.0 + 1)
    }
}

/// A set of player slots, stored as a bitmask.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayerSet(u32);

impl PlayerSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Builds a set from a raw bitmask, as carried on the wire.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns the raw bitmask.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether no slot is present.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether `slot` is present.
    #[inline]
    #[must_use]
    pub const fn contains(self, slot: PlayerSlot) -> bool {
        self.0 & (1 << slot.0) != 0
    }

    /// Adds `slot` to the set.
    #[inline]
    pub fn insert(&mut self, slot: PlayerSlot) {
        self.0 |= 1 << slot.0;
    }

    /// Removes `slot` from the set.
    #[inline]
    pub fn remove(&mut self, slot: PlayerSlot) {
        self.0 &= !(1 << slot.0);
    }

    /// Iterates over the slots present, in ascending order.
    pub fn iter(self) -> impl Iterator<Item = PlayerSlot> {
        (0..MAX_PLAYERS)
            .map(PlayerSlot::new)
            .filter(move |s| self.contains(*s))
    }
}

/// Known non-ideal emulator-core properties recorded for a session.
///
/// Quirks downgrade behaviour rather than failing construction: a core
/// without savestates simply runs in lockstep, and a core with delayed
/// serialization is probed lazily.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Quirks(u8);

impl Quirks {
    /// No quirks.
    pub const NONE: Self = Self(0);
    /// The core cannot produce savestates at all. No rollback; the session
    /// advances in lockstep.
    pub const NO_SAVESTATES: Self = Self(1);
    /// State transmission is unavailable; desynced peers cannot be
    /// resynchronised.
    pub const NO_TRANSMISSION: Self = Self(1 << 1);
    /// The core does not know its serialized size until it has run for a
    /// while. Serialization is initialised lazily.
    pub const INITIALIZATION: Self = Self(1 << 2);

    /// Whether every quirk in `other` is present in `self`.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Adds the quirks in `other`.
    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Removes the quirks in `other`.
    #[inline]
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Quirks {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

// ##########
// # TRAITS #
// ##########

/// The deterministic simulation a session drives.
///
/// The contract is strict determinism: given an identical starting state
/// and identical input sequences, every peer's core must produce identical
/// state. Rollplay verifies this with periodic CRC exchange and repairs
/// divergence with savestate transfer, but it cannot mask a core that is
/// itself non-deterministic.
pub trait EmulatorCore {
    /// Size in bytes of a serialized state snapshot, or 0 when the core
    /// does not know yet (see [`Quirks::INITIALIZATION`]).
    fn serialize_size(&mut self) -> usize;

    /// Writes a snapshot of the current state into `buf`. Returns `false`
    /// when the core cannot serialize right now.
    fn serialize(&mut self, buf: &mut [u8]) -> bool;

    /// Restores a snapshot previously produced by
    /// [`serialize`](EmulatorCore::serialize). Returns `false` on failure.
    fn unserialize(&mut self, buf: &[u8]) -> bool;

    /// Runs exactly one frame. `inputs` holds the resolved input sample
    /// for every port, already remapped for a pending player flip.
    fn run_frame(&mut self, inputs: &[InputWords; MAX_PLAYERS]);
}

// ##########
// # EVENTS #
// ##########

/// Notifications surfaced to the embedding frontend.
///
/// Events queue up inside the session and are drained with
/// [`NetplaySession::events`]. Their `Display` impls produce the strings a
/// frontend would show verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NetplayEvent {
    /// A peer completed the handshake.
    PeerConnected {
        /// The peer's display name.
        nick: String,
    },
    /// A connection was hung up. The session continues with the
    /// surviving peers.
    Disconnected,
    /// A remote participant was assigned a player slot.
    PlayerJoined(PlayerSlot),
    /// A remote participant left the playing set.
    PlayerLeft(PlayerSlot),
    /// The local participant was assigned a player slot.
    YouJoined(PlayerSlot),
    /// The local participant left the playing set.
    YouLeft,
    /// Port mapping will toggle at the given frame.
    UsersFlipped {
        /// First frame with the toggled mapping.
        frame: Frame,
    },
    /// The host asked for a flip at a frame that is already
    /// authoritatively complete. The request was refused.
    FlipInThePast,
    /// A remote participant paused the session.
    PeerPaused {
        /// The peer's display name.
        nick: String,
    },
    /// All remote participants resumed.
    PeerResumed,
    /// A checksum exchange disagreed; recovery has been initiated.
    DesyncDetected {
        /// The frame whose checksums disagreed.
        frame: Frame,
    },
}

impl std::fmt::Display for NetplayEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerConnected { nick } => write!(f, "Got connection from: \"{nick}\""),
            Self::Disconnected => {
                write!(f, "Netplay has disconnected. Will continue without connection.")
            }
            Self::PlayerJoined(p) => write!(f, "Player {} has joined", p.as_usize() + 1),
            Self::PlayerLeft(p) => write!(f, "Player {} has left", p.as_usize() + 1),
            Self::YouJoined(p) => {
                write!(f, "You have joined as player {}", p.as_usize() + 1)
            }
            Self::YouLeft => write!(f, "You have left the game"),
            Self::UsersFlipped { frame } => write!(f, "Netplay users are flipped (frame {frame})"),
            Self::FlipInThePast => {
                write!(f, "Host asked us to flip users in the past. Not possible.")
            }
            Self::PeerPaused { nick } => write!(f, "{nick} has paused"),
            Self::PeerResumed => write!(f, "Netplay has resumed"),
            Self::DesyncDetected { frame } => {
                write!(f, "Network desync detected at frame {frame}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_arithmetic() {
        let f = Frame::new(10);
        assert_eq!(f + 1, Frame::new(11));
        assert_eq!(f.since(Frame::new(4)), 6);
        assert_eq!(Frame::new(4).since(f), 0);
        assert_eq!(Frame::new(u32::MAX).checked_next(), None);
        assert_eq!(Frame::ZERO.saturating_prev(), Frame::ZERO);
    }

    #[test]
    fn player_set_insert_remove() {
        let mut set = PlayerSet::EMPTY;
        assert!(set.is_empty());
        set.insert(PlayerSlot::new(0));
        set.insert(PlayerSlot::new(3));
        assert!(set.contains(PlayerSlot::new(0)));
        assert!(set.contains(PlayerSlot::new(3)));
        assert!(!set.contains(PlayerSlot::new(1)));
        assert_eq!(set.iter().count(), 2);
        set.remove(PlayerSlot::new(0));
        assert!(!set.contains(PlayerSlot::new(0)));
        assert_eq!(set.bits(), 0b1000);
    }

    #[test]
    fn quirks_contains() {
        let mut q = Quirks::NONE;
        assert!(!q.contains(Quirks::NO_SAVESTATES));
        q.insert(Quirks::NO_SAVESTATES | Quirks::INITIALIZATION);
        assert!(q.contains(Quirks::NO_SAVESTATES));
        assert!(q.contains(Quirks::INITIALIZATION));
        q.remove(Quirks::INITIALIZATION);
        assert!(!q.contains(Quirks::INITIALIZATION));
    }

    #[test]
    fn event_display_strings() {
        assert_eq!(
            NetplayEvent::PlayerJoined(PlayerSlot::new(1)).to_string(),
            "Player 2 has joined"
        );
        assert_eq!(
            NetplayEvent::YouJoined(PlayerSlot::new(0)).to_string(),
            "You have joined as player 1"
        );
        assert!(NetplayEvent::Disconnected.to_string().contains("disconnected"));
    }
}
