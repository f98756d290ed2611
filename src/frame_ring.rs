//! The rollback ring buffer.
//!
//! A session keeps `2 * delay_frames + 1` slots: the local simulation sits
//! in the middle, the fully-known boundary (`other`) may trail by up to
//! `delay_frames`, and remote read heads may run ahead by the same amount.
//! Frame numbers are monotonically increasing counters independent of slot
//! indices; a cursor carries both and the pair always moves together.

use crate::error::{FatalReason, NetplayError};
use crate::{Frame, InputWords, PlayerSet, MAX_PLAYERS, WORDS_PER_INPUT};

/// A position in the ring: slot index plus the logical frame it points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    /// Slot index, always `frame % ring size`.
    pub ptr: usize,
    /// The logical frame this cursor points at.
    pub frame: Frame,
}

/// One logical frame's worth of inputs and, lazily, serialized state.
#[derive(Debug, Clone)]
pub struct FrameSlot {
    /// Whether the slot holds meaningful data for `frame`.
    pub used: bool,
    /// The logical frame occupying the slot when `used`.
    pub frame: Frame,
    /// The local input sample.
    pub self_state: InputWords,
    /// Authoritative input per player slot.
    pub real_input: [InputWords; MAX_PLAYERS],
    /// Predicted input per player slot.
    pub simulated_input: [InputWords; MAX_PLAYERS],
    /// Local input has been sampled for this frame.
    pub have_local: bool,
    /// Authoritative input has arrived for this player.
    pub have_real: [bool; MAX_PLAYERS],
    /// Serialized simulation snapshot. Storage is allocated once and
    /// reused across recycles; empty until serialization is initialised.
    pub state: Vec<u8>,
    /// A checksum claim received for this frame, held until the frame is
    /// fully known and can be verified.
    pub remote_crc: Option<u32>,
}

impl FrameSlot {
    fn new() -> Self {
        Self {
            used: false,
            frame: Frame::ZERO,
            self_state: [0; WORDS_PER_INPUT],
            real_input: [[0; WORDS_PER_INPUT]; MAX_PLAYERS],
            simulated_input: [[0; WORDS_PER_INPUT]; MAX_PLAYERS],
            have_local: false,
            have_real: [false; MAX_PLAYERS],
            state: Vec::new(),
            remote_crc: None,
        }
    }
}

/// Fixed-size circular buffer of [`FrameSlot`]s plus the session cursors.
#[derive(Debug)]
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    delay_frames: u32,
    /// The frame being (or about to be) simulated locally.
    pub self_cur: Cursor,
    /// Oldest frame whose inputs are fully known; the rollback boundary.
    pub other: Cursor,
    /// Earliest frame some connected peer has not yet delivered input for.
    pub unread: Cursor,
    /// Oldest frame authoritatively acknowledged by the host. Meaningful
    /// on non-host peers only.
    pub server: Cursor,
    /// Next expected frame from each player slot.
    pub read: [Cursor; MAX_PLAYERS],
    /// Scratch cursor used while re-running frames.
    pub replay: Cursor,
}

impl FrameRing {
    /// Creates a ring sized `2 * delay_frames + 1` with every cursor at
    /// frame 0.
    pub fn new(delay_frames: u32) -> Result<Self, NetplayError> {
        if delay_frames == 0 {
            return Err(NetplayError::Fatal {
                reason: FatalReason::ZeroDelayFrames,
            });
        }
        let size = delay_frames as usize * 2 + 1;
        let origin = Cursor {
            ptr: 0,
            frame: Frame::ZERO,
        };
        Ok(Self {
            slots: (0..size).map(|_| FrameSlot::new()).collect(),
            delay_frames,
            self_cur: origin,
            other: origin,
            unread: origin,
            server: origin,
            read: [origin; MAX_PLAYERS],
            replay: origin,
        })
    }

    /// Number of slots in the ring.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// The session-wide delay budget.
    #[inline]
    #[must_use]
    pub fn delay_frames(&self) -> u32 {
        self.delay_frames
    }

    /// The slot index following `ptr`.
    #[inline]
    #[must_use]
    pub fn next_ptr(&self, ptr: usize) -> usize {
        (ptr + 1) % self.slots.len()
    }

    /// The slot index preceding `ptr`.
    #[inline]
    #[must_use]
    pub fn prev_ptr(&self, ptr: usize) -> usize {
        (ptr + self.slots.len() - 1) % self.slots.len()
    }

    /// The cursor one frame after `cur`.
    #[inline]
    #[must_use]
    pub fn next(&self, cur: Cursor) -> Cursor {
        Cursor {
            ptr: self.next_ptr(cur.ptr),
            frame: cur.frame + 1,
        }
    }

    /// The cursor positioned at an arbitrary frame.
    #[inline]
    #[must_use]
    pub fn cursor_at(&self, frame: Frame) -> Cursor {
        Cursor {
            ptr: frame.as_u32() as usize % self.slots.len(),
            frame,
        }
    }

    /// Moves every cursor to `frame`. Used when a joining peer adopts the
    /// host's frame counter.
    pub fn reset_all(&mut self, frame: Frame) {
        let cur = self.cursor_at(frame);
        self.self_cur = cur;
        self.other = cur;
        self.unread = cur;
        self.server = cur;
        self.read = [cur; MAX_PLAYERS];
        self.replay = cur;
    }

    /// Borrows the slot at `ptr`.
    #[inline]
    #[must_use]
    pub fn slot(&self, ptr: usize) -> &FrameSlot {
        &self.slots[ptr]
    }

    /// Mutably borrows the slot at `ptr`.
    #[inline]
    pub fn slot_mut(&mut self, ptr: usize) -> &mut FrameSlot {
        &mut self.slots[ptr]
    }

    /// Whether the slot at `ptr` currently holds frame `frame`.
    #[inline]
    #[must_use]
    pub fn ready(&self, ptr: usize, frame: Frame) -> bool {
        let slot = &self.slots[ptr];
        slot.used && slot.frame == frame
    }

    /// Zeroes and refreshes the slot at `ptr` so it may take `frame`.
    ///
    /// Idempotent per frame. Clears the local sample, every authoritative
    /// flag, and the predictions of currently connected players; preserves
    /// the `state` storage so savestate allocations are reused.
    pub fn prepare(&mut self, ptr: usize, frame: Frame, connected: PlayerSet) {
        if self.ready(ptr, frame) {
            return;
        }
        let slot = &mut self.slots[ptr];
        slot.frame = frame;
        slot.self_state = [0; WORDS_PER_INPUT];
        slot.have_local = false;
        slot.have_real = [false; MAX_PLAYERS];
        slot.real_input = [[0; WORDS_PER_INPUT]; MAX_PLAYERS];
        slot.remote_crc = None;
        for p in connected.iter() {
            slot.simulated_input[p.as_usize()] = [0; WORDS_PER_INPUT];
        }
    }

    /// Marks the slot at `ptr` as holding frame `frame`. The slot must
    /// have been prepared (or already hold a valid snapshot) for `frame`.
    pub fn mark_used(&mut self, ptr: usize, frame: Frame) {
        let slot = &mut self.slots[ptr];
        slot.used = true;
        slot.frame = frame;
    }

    /// Claims the slot at `ptr` for frame `frame`, recycling stale
    /// contents.
    ///
    /// Returns `false` when the slot still holds a frame the rollback
    /// boundary has not consumed; overwriting it would lose data that may
    /// yet be replayed.
    pub fn claim(&mut self, ptr: usize, frame: Frame, connected: PlayerSet) -> bool {
        if self.ready(ptr, frame) {
            return true;
        }
        let slot = &self.slots[ptr];
        if slot.used && self.other.frame <= slot.frame {
            return false;
        }
        self.prepare(ptr, frame, connected);
        self.mark_used(ptr, frame);
        true
    }

    /// Moves the local cursor forward by one frame.
    pub fn advance_self(&mut self) {
        self.self_cur = self.next(self.self_cur);
    }

    /// Moves the rollback boundary forward by one frame.
    pub fn advance_other(&mut self) {
        self.other = self.next(self.other);
    }

    /// Repositions the local cursor at `frame`. The caller must replay
    /// forward afterwards. Returns `false` when `frame` precedes the
    /// rollback boundary, which would point at recycled data.
    pub fn rewind_to(&mut self, frame: Frame) -> bool {
        if frame < self.other.frame {
            return false;
        }
        self.self_cur = self.cursor_at(frame);
        true
    }

    /// Finds the slot currently holding `frame`, scanning backwards from
    /// the local cursor the way the checksum handler expects.
    #[must_use]
    pub fn find_frame(&self, frame: Frame) -> Option<usize> {
        let mut ptr = self.self_cur.ptr;
        loop {
            let slot = &self.slots[ptr];
            if slot.used && slot.frame == frame {
                return Some(ptr);
            }
            ptr = self.prev_ptr(ptr);
            if ptr == self.self_cur.ptr {
                return None;
            }
        }
    }

    /// Validates the cursor and slot invariants. Test support.
    pub fn check_invariants(&self, connected: PlayerSet) -> Result<(), String> {
        if self.other.frame > self.unread.frame {
            return Err(format!(
                "other frame {} ahead of unread frame {}",
                self.other.frame, self.unread.frame
            ));
        }
        if self.unread.frame > self.self_cur.frame + 1 {
            return Err(format!(
                "unread frame {} ahead of self frame {} + 1",
                self.unread.frame, self.self_cur.frame
            ));
        }
        if self.self_cur.frame.since(self.other.frame) > self.delay_frames {
            return Err(format!(
                "self frame {} more than {} frames ahead of other frame {}",
                self.self_cur.frame, self.delay_frames, self.other.frame
            ));
        }
        for p in connected.iter() {
            let read = self.read[p.as_usize()];
            if read.frame < self.other.frame {
                return Err(format!(
                    "read frame {} for {} behind other frame {}",
                    read.frame, p, self.other.frame
                ));
            }
            if read.frame.since(self.self_cur.frame) > self.delay_frames {
                return Err(format!(
                    "read frame {} for {} more than {} frames ahead of self frame {}",
                    read.frame, p, self.delay_frames, self.self_cur.frame
                ));
            }
        }
        // Used slots must be contiguous in frame order starting at `other`.
        let mut cur = self.other;
        while self.ready(cur.ptr, cur.frame) {
            cur = self.next(cur);
            if cur.ptr == self.other.ptr {
                break;
            }
        }
        let mut probe = cur;
        loop {
            if probe.ptr == self.other.ptr {
                break;
            }
            let slot = &self.slots[probe.ptr];
            if slot.used && slot.frame >= self.other.frame && slot.frame == probe.frame {
                return Err(format!(
                    "slot for frame {} used beyond the contiguous range ending at {}",
                    probe.frame, cur.frame
                ));
            }
            probe = self.next(probe);
        }
        for p in connected.iter() {
            let read = self.read[p.as_usize()];
            if read.ptr != read.frame.as_u32() as usize % self.size() {
                return Err(format!("read cursor for {} lost ptr/frame pairing", p));
            }
        }
        Ok(())
    }
}
