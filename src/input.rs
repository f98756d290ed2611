//! Input resolution and prediction.
//!
//! Every live frame must present an input sample for every player slot.
//! Authoritative input wins where it has arrived; everywhere else a
//! prediction stands in. Predictions assume a player keeps doing whatever
//! they did in the last sample the session actually received.

use crate::frame_ring::FrameRing;
use crate::{Frame, InputWords, PlayerSet, PlayerSlot, MAX_PLAYERS, WORDS_PER_INPUT};

/// Fills in predictions for every connected player that has no
/// authoritative input in the slot at `sim_ptr`.
///
/// On first-time simulation the whole last received sample is copied. On
/// resimulation (`resim`), only the directional bits of the digital word
/// are refreshed from the received sample; previously simulated button
/// bits stay as they were. Directional holds compound correctly across
/// rollback wavefronts since their effect is tied to duration, but
/// edge-triggered buttons would appear to retrigger on every wavefront.
pub fn simulate_input(
    ring: &mut FrameRing,
    sim_ptr: usize,
    resim: bool,
    connected: PlayerSet,
    directional_mask: u32,
) {
    for player in connected.iter() {
        let p = player.as_usize();
        if ring.slot(sim_ptr).have_real[p] {
            continue;
        }
        let prev = ring.prev_ptr(ring.read[p].ptr);
        let last_real = ring.slot(prev).real_input[p];

        if resim {
            let sim = &mut ring.slot_mut(sim_ptr).simulated_input[p];
            sim[0] = (last_real[0] & directional_mask) | (sim[0] & !directional_mask);
        } else {
            ring.slot_mut(sim_ptr).simulated_input[p] = last_real;
        }
    }
}

/// Resolves the input sample for every port in the slot at `ptr`.
///
/// Connected players present authoritative input where it has arrived and
/// their prediction otherwise. The local participant's own sample comes
/// from the slot's `self_state`.
#[must_use]
pub fn resolve_inputs(
    ring: &FrameRing,
    ptr: usize,
    connected: PlayerSet,
    local: Option<PlayerSlot>,
) -> [InputWords; MAX_PLAYERS] {
    let slot = ring.slot(ptr);
    let mut out = [[0u32; WORDS_PER_INPUT]; MAX_PLAYERS];
    for player in connected.iter() {
        let p = player.as_usize();
        out[p] = if slot.have_real[p] {
            slot.real_input[p]
        } else {
            slot.simulated_input[p]
        };
    }
    if let Some(me) = local {
        out[me.as_usize()] = slot.self_state;
    }
    out
}

/// Swaps ports 0 and 1 when the session flip is active for `frame`.
pub fn apply_flip(inputs: &mut [InputWords; MAX_PLAYERS], flipped: bool) {
    if flipped {
        inputs.swap(0, 1);
    }
}

/// Whether the port mapping is toggled at `frame`.
///
/// A `flip_frame` of 0 means no flip was ever requested. Before
/// `flip_frame` the stored toggle is inverted, so a request scheduled in
/// the future takes effect exactly at its frame.
#[must_use]
pub fn flip_active(flip: bool, flip_frame: Frame, frame: Frame) -> bool {
    if flip_frame == Frame::ZERO {
        return false;
    }
    flip ^ (frame < flip_frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_DIRECTIONAL_MASK;

    fn ring_with_player(p: usize) -> (FrameRing, PlayerSet) {
        let ring = FrameRing::new(4).expect("ring");
        let mut connected = PlayerSet::EMPTY;
        connected.insert(PlayerSlot::new(p));
        (ring, connected)
    }

    #[test]
    fn first_time_simulation_repeats_last_real_input() {
        let (mut ring, connected) = ring_with_player(1);
        // Last received sample sits just before the read head.
        ring.read[1] = ring.cursor_at(Frame::new(3));
        let prev = ring.prev_ptr(ring.read[1].ptr);
        ring.slot_mut(prev).real_input[1] = [0x1F0, 44, 55];

        simulate_input(&mut ring, 3, false, connected, DEFAULT_DIRECTIONAL_MASK);
        assert_eq!(ring.slot(3).simulated_input[1], [0x1F0, 44, 55]);
    }

    #[test]
    fn resimulation_refreshes_directions_and_preserves_buttons() {
        let (mut ring, connected) = ring_with_player(1);
        ring.read[1] = ring.cursor_at(Frame::new(3));
        let prev = ring.prev_ptr(ring.read[1].ptr);
        // New real sample holds RIGHT (bit 7) and button A (bit 8).
        ring.slot_mut(prev).real_input[1] = [0x180, 9, 9];
        // The earlier simulation predicted UP (bit 4) and button B (bit 0).
        ring.slot_mut(3).simulated_input[1] = [0x011, 7, 7];

        simulate_input(&mut ring, 3, true, connected, DEFAULT_DIRECTIONAL_MASK);
        let sim = ring.slot(3).simulated_input[1];
        // Directions now come from the real sample, buttons stay simulated.
        assert_eq!(sim[0], 0x080 | 0x001);
        // Analog words are untouched by resimulation.
        assert_eq!(sim[1], 7);
        assert_eq!(sim[2], 7);
    }

    #[test]
    fn real_input_shortcircuits_simulation() {
        let (mut ring, connected) = ring_with_player(1);
        ring.slot_mut(2).have_real[1] = true;
        ring.slot_mut(2).real_input[1] = [5, 5, 5];
        ring.slot_mut(2).simulated_input[1] = [9, 9, 9];
        simulate_input(&mut ring, 2, false, connected, DEFAULT_DIRECTIONAL_MASK);
        assert_eq!(ring.slot(2).simulated_input[1], [9, 9, 9]);

        let resolved = resolve_inputs(&ring, 2, connected, None);
        assert_eq!(resolved[1], [5, 5, 5]);
    }

    #[test]
    fn resolve_uses_local_sample_for_own_port() {
        let (mut ring, connected) = ring_with_player(1);
        ring.slot_mut(0).self_state = [3, 2, 1];
        let resolved = resolve_inputs(&ring, 0, connected, Some(PlayerSlot::new(0)));
        assert_eq!(resolved[0], [3, 2, 1]);
    }

    #[test]
    fn flip_timing() {
        // No flip was ever requested.
        assert!(!flip_active(false, Frame::ZERO, Frame::new(50)));
        // Flip scheduled for frame 100, toggle already applied.
        assert!(!flip_active(true, Frame::new(100), Frame::new(99)));
        assert!(flip_active(true, Frame::new(100), Frame::new(100)));
        assert!(flip_active(true, Frame::new(100), Frame::new(150)));
        // A second flip at 200 restores the original mapping there.
        assert!(flip_active(false, Frame::new(200), Frame::new(150)));
        assert!(!flip_active(false, Frame::new(200), Frame::new(200)));
    }

    #[test]
    fn apply_flip_swaps_first_two_ports() {
        let mut inputs = [[0u32; WORDS_PER_INPUT]; MAX_PLAYERS];
        inputs[0] = [1, 0, 0];
        inputs[1] = [2, 0, 0];
        apply_flip(&mut inputs, true);
        assert_eq!(inputs[0], [2, 0, 0]);
        assert_eq!(inputs[1], [1, 0, 0]);
        apply_flip(&mut inputs, false);
        assert_eq!(inputs[0], [2, 0, 0]);
    }
}
