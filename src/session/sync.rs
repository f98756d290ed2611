//! Frame-boundary synchronisation: boundary advance, rollback replay and
//! checksum exchange.

use tracing::{debug, warn};

use crate::input;
use crate::network::wire::Message;
use crate::session::session::NetplaySession;
use crate::{checksum, EmulatorCore, NetplayResult, Quirks};

impl NetplaySession {
    /// The bookkeeping pass after each simulated frame.
    ///
    /// Recomputes the earliest owed frame, advances the rollback boundary
    /// over frames whose predictions held (validating stashed checksum
    /// claims on the way), and rewinds and re-runs everything since the
    /// boundary when a prediction broke or a rewind was forced.
    pub(super) fn post_frame(&mut self, core: &mut dyn EmulatorCore) -> NetplayResult<()> {
        self.update_unread();

        if !self.force_rewind {
            // Skip ahead over correctly predicted frames; they will never
            // need re-running.
            while self.ring.other.frame < self.ring.unread.frame
                && self.ring.other.frame < self.ring.self_cur.frame
            {
                let ptr = self.ring.other.ptr;
                if self.prediction_mismatch(ptr) {
                    break;
                }
                self.cross_boundary(ptr);
                self.ring.advance_other();
            }
        }

        let target = self.ring.unread.frame.min(self.ring.self_cur.frame);
        if self.force_rewind || self.ring.other.frame < target {
            self.replay(core);
        }
        Ok(())
    }

    /// Whether any player's authoritative input for the slot disagrees
    /// with what was simulated in its place.
    fn prediction_mismatch(&self, ptr: usize) -> bool {
        let slot = self.ring.slot(ptr);
        self.connected_players.iter().any(|p| {
            let p = p.as_usize();
            slot.have_real[p] && slot.real_input[p] != slot.simulated_input[p]
        })
    }

    /// A frame is leaving the speculative window: broadcast its checksum
    /// on the configured cadence and settle any stashed remote claim.
    fn cross_boundary(&mut self, ptr: usize) {
        if self.state_size == 0 {
            return;
        }
        let frame = self.ring.slot(ptr).frame;
        let local = checksum::crc32(&self.ring.slot(ptr).state);

        if self.check_frames > 0 && frame.as_u32() % self.check_frames == 0 {
            self.broadcast(&Message::Crc { frame, crc: local }, None);
        }

        if let Some(remote) = self.ring.slot_mut(ptr).remote_crc.take() {
            if remote != local {
                self.handle_desync(frame);
            }
        }
    }

    /// Rewinds to the boundary, re-runs every frame up to the current one
    /// with authoritative input where it has arrived, and moves the
    /// boundary to the earliest still-owed frame.
    fn replay(&mut self, core: &mut dyn EmulatorCore) {
        let target = self.ring.unread.frame.min(self.ring.self_cur.frame);

        if self.state_size == 0 {
            // No savestates, no rollback: the session blocks for input
            // before running a frame, so everything behind the earliest
            // owed frame already ran with authoritative input.
            while self.ring.other.frame < target {
                self.ring.advance_other();
            }
            self.force_rewind = false;
            return;
        }

        if self.quirks.contains(Quirks::INITIALIZATION) {
            self.wait_and_init_serialization(core);
        }

        debug!(
            from = %self.ring.other.frame,
            to = %self.ring.self_cur.frame,
            "rolling back"
        );
        self.is_replay = true;
        self.ring.replay = self.ring.other;

        // Restore the last fully known state.
        let restored = {
            let state = &self.ring.slot(self.ring.other.ptr).state;
            core.unserialize(state)
        };
        if !restored {
            warn!(frame = %self.ring.other.frame, "core refused to restore the boundary state");
        }

        while self.ring.replay.frame < self.ring.self_cur.frame {
            let ptr = self.ring.replay.ptr;
            let frame = self.ring.replay.frame;
            self.serialize_into_slot(core, ptr);
            input::simulate_input(
                &mut self.ring,
                ptr,
                true,
                self.connected_players,
                self.directional_mask,
            );
            let mut inputs =
                input::resolve_inputs(&self.ring, ptr, self.connected_players, self.playing_as());
            input::apply_flip(&mut inputs, self.flipped_at(frame));
            self.run_core(core, &inputs);
            self.ring.replay = self.ring.next(self.ring.replay);
        }
        self.is_replay = false;

        // The boundary catches up, settling checksum claims on the way. A
        // jump-ahead savestate may have parked it past the target; it
        // simply comes back to the earliest owed frame.
        while self.ring.other.frame < target {
            let ptr = self.ring.other.ptr;
            self.cross_boundary(ptr);
            self.ring.advance_other();
        }
        if self.ring.other.frame > target {
            self.ring.other = self.ring.cursor_at(target);
        }
        self.force_rewind = false;
    }
}
