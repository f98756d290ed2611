//! End-to-end session scenarios over in-process transports.

mod common;

use common::{connected_pair, step_pair, ScriptedHost, StubCore};
use rollplay::network::wire::{Message, INPUT_BIT_SERVER};
use rollplay::{
    MemoryTransport, NetplayError, NetplayEvent, NetplaySession, PlayerSlot, SessionBuilder,
};

const ZERO: [u32; 3] = [0, 0, 0];
const BUTTON_A: u32 = 0x100;

/// Brings host and client core to the same frame so their states are
/// comparable, then returns both (frame, trace) pairs.
fn aligned_states(
    host: &mut NetplaySession,
    client: &mut NetplaySession,
    host_core: &mut StubCore,
    client_core: &mut StubCore,
) -> ((u32, u64), (u32, u64)) {
    for _ in 0..32 {
        if client_core.frame < host_core.frame {
            client.advance_frame(client_core, ZERO).expect("client catch-up");
        } else if host_core.frame < client_core.frame {
            host.advance_frame(host_core, ZERO).expect("host catch-up");
        } else {
            break;
        }
    }
    host.poll(host_core).expect("host poll");
    client.poll(client_core).expect("client poll");
    assert_eq!(host_core.frame, client_core.frame, "cores never aligned");
    (host_core.state(), client_core.state())
}

// =====================================================================
// Two-peer handshake (S1)
// =====================================================================

#[test]
fn handshake_assigns_the_first_free_slot() {
    let (mut host, mut client, mut host_core, mut client_core) = connected_pair(4, 60);

    assert!(host.is_host());
    assert_eq!(client.local_player(), Some(PlayerSlot::new(1)));
    assert!(host.connected_players().contains(PlayerSlot::new(1)));
    assert_eq!(host.local_player(), Some(PlayerSlot::new(0)));

    let client_events: Vec<_> = client.events().collect();
    assert!(client_events
        .iter()
        .any(|e| matches!(e, NetplayEvent::PeerConnected { nick } if nick == "host")));
    assert!(client_events
        .iter()
        .any(|e| *e == NetplayEvent::YouJoined(PlayerSlot::new(1))));

    let host_events: Vec<_> = host.events().collect();
    assert!(host_events
        .iter()
        .any(|e| matches!(e, NetplayEvent::PeerConnected { nick } if nick == "guest")));
    assert!(host_events
        .iter()
        .any(|e| *e == NetplayEvent::PlayerJoined(PlayerSlot::new(1))));

    // The pair keeps running cleanly.
    for _ in 0..8 {
        step_pair(&mut host, &mut client, &mut host_core, &mut client_core, ZERO, ZERO);
    }
    let (h, c) = aligned_states(&mut host, &mut client, &mut host_core, &mut client_core);
    assert_eq!(h, c);
}

// =====================================================================
// Rollback correctness (S2)
// =====================================================================

#[test]
fn rollback_corrects_a_mispredicted_button_press() {
    let (mut host, mut client, mut host_core, mut client_core) = connected_pair(4, 1);

    // Reach the frame where the host will press a button. The client
    // steps first each frame, so it always predicts the host's sample
    // and corrects on the next delivery.
    while host.current_frame() < 11 {
        step_pair(&mut host, &mut client, &mut host_core, &mut client_core, ZERO, ZERO);
    }
    step_pair(
        &mut host,
        &mut client,
        &mut host_core,
        &mut client_core,
        [BUTTON_A, 0, 0],
        ZERO,
    );
    for _ in 0..12 {
        step_pair(&mut host, &mut client, &mut host_core, &mut client_core, ZERO, ZERO);
    }

    let (h, c) = aligned_states(&mut host, &mut client, &mut host_core, &mut client_core);
    assert_eq!(h, c, "client never converged onto the host's timeline");

    // Checksums were exchanged every frame; none may have disagreed.
    assert!(!host.events().any(|e| matches!(e, NetplayEvent::DesyncDetected { .. })));
    assert!(!client.events().any(|e| matches!(e, NetplayEvent::DesyncDetected { .. })));
    assert!(client.confirmed_frame() > 11);
}

// =====================================================================
// Flip players (S3)
// =====================================================================

fn spectating_client(transport: MemoryTransport) -> (NetplaySession, StubCore) {
    let client = SessionBuilder::new()
        .nick("watcher")
        .spectate(true)
        .retry_ms(1)
        .max_retries(4)
        .start_client_with_transport(Box::new(transport))
        .expect("client session");
    (client, StubCore::new())
}

fn host_input(frame: u32, word: u32) -> Message {
    Message::Input {
        frame: frame.into(),
        player_tag: INPUT_BIT_SERVER,
        state: [word, 0, 0],
    }
}

fn plain_sync() -> Message {
    Message::Sync {
        frame: rollplay::Frame::ZERO,
        connected: 0,
        flip_frame: rollplay::Frame::ZERO,
        flip: false,
        host_player: 0,
    }
}

#[test]
fn flip_materialises_exactly_at_its_frame() {
    let (ours, theirs) = MemoryTransport::pair();
    let (mut client, mut core) = spectating_client(ours);
    let mut script = ScriptedHost::new(theirs);
    script.serve_handshake(&mut client, &mut core, plain_sync());

    for f in 0..98u32 {
        script.send(&host_input(f, 0));
        client.advance_frame(&mut core, ZERO).expect("advance");
    }
    assert_eq!(client.current_frame(), rollplay::Frame::new(98));

    script.send(&Message::FlipPlayers { frame: 100u32.into() });
    client.poll(&mut core).expect("poll");
    assert!(client.events().any(|e| matches!(e, NetplayEvent::UsersFlipped { frame } if frame == 100u32)));

    assert!(!client.flipped(), "flip must not apply before its frame");
    script.send(&host_input(98, 0));
    client.advance_frame(&mut core, ZERO).expect("advance");
    assert_eq!(client.current_frame(), rollplay::Frame::new(99));
    assert!(!client.flipped(), "frame 99 still uses the old mapping");

    script.send(&host_input(99, 0));
    client.advance_frame(&mut core, ZERO).expect("advance");
    assert_eq!(client.current_frame(), rollplay::Frame::new(100));
    assert!(client.flipped(), "frame 100 uses the flipped mapping");
}

#[test]
fn flip_in_the_past_is_refused() {
    let (ours, theirs) = MemoryTransport::pair();
    let (mut client, mut core) = spectating_client(ours);
    let mut script = ScriptedHost::new(theirs);
    script.serve_handshake(&mut client, &mut core, plain_sync());

    for f in 0..6u32 {
        script.send(&host_input(f, 0));
        client.advance_frame(&mut core, ZERO).expect("advance");
    }
    // The host has acknowledged up to frame 6; frame 2 is history.
    script.send(&Message::FlipPlayers { frame: 2u32.into() });
    client.poll(&mut core).expect("poll");

    let events: Vec<_> = client.events().collect();
    assert!(events.contains(&NetplayEvent::FlipInThePast));
    assert!(events.contains(&NetplayEvent::Disconnected));
    assert_eq!(client.active_connections(), 0);
    assert!(script.recv_all().contains(&Message::Nak));
}

// =====================================================================
// Late join (S4)
// =====================================================================

#[test]
fn late_joiner_gets_the_next_slot_and_the_host_state() {
    let (mut host, mut first, mut host_core, mut first_core) = connected_pair(4, 60);

    while host.current_frame() < 200 {
        step_pair(&mut host, &mut first, &mut host_core, &mut first_core, ZERO, ZERO);
    }

    let (ours, theirs) = MemoryTransport::pair();
    host.attach_peer(Box::new(theirs));
    let mut late = SessionBuilder::new()
        .nick("latecomer")
        .delay_frames(4)
        .start_client_with_transport(Box::new(ours))
        .expect("late client");
    let mut late_core = StubCore::new();

    for _ in 0..64 {
        late.poll(&mut late_core).expect("late poll");
        step_pair(&mut host, &mut first, &mut host_core, &mut first_core, ZERO, ZERO);
        if late.local_player().is_some() {
            break;
        }
    }
    assert_eq!(late.local_player(), Some(PlayerSlot::new(2)));
    assert!(host.connected_players().contains(PlayerSlot::new(2)));
    assert!(late
        .events()
        .any(|e| matches!(e, NetplayEvent::YouJoined(p) if p == PlayerSlot::new(2))));

    // The joiner adopted the host's frame counter and state, and its
    // input is now expected by the host.
    assert!(late.current_frame() >= rollplay::Frame::new(200));
    for _ in 0..8 {
        late.advance_frame(&mut late_core, ZERO).expect("late advance");
        step_pair(&mut host, &mut first, &mut host_core, &mut first_core, ZERO, ZERO);
    }
    assert!(host.read_frame(PlayerSlot::new(2)) > rollplay::Frame::new(200));

    let (h, l) = aligned_states(&mut host, &mut late, &mut host_core, &mut late_core);
    assert_eq!(h, l, "late joiner never converged onto the host state");
}

// =====================================================================
// Desync recovery (S5)
// =====================================================================

#[test]
fn desync_is_detected_and_repaired_with_a_savestate() {
    let (mut host, mut client, mut host_core, mut client_core) = connected_pair(4, 1);

    while host.current_frame() < 30 {
        step_pair(&mut host, &mut client, &mut host_core, &mut client_core, ZERO, ZERO);
    }

    // The client's simulation silently diverges.
    client_core.trace ^= 0xDEAD_BEEF;

    let mut detected = false;
    for _ in 0..32 {
        step_pair(&mut host, &mut client, &mut host_core, &mut client_core, ZERO, ZERO);
        if client
            .events()
            .any(|e| matches!(e, NetplayEvent::DesyncDetected { .. }))
        {
            detected = true;
            break;
        }
    }
    assert!(detected, "checksum exchange never noticed the divergence");

    // Recovery: the host ships a savestate, the client snaps onto it.
    for _ in 0..24 {
        step_pair(&mut host, &mut client, &mut host_core, &mut client_core, ZERO, ZERO);
    }
    let (h, c) = aligned_states(&mut host, &mut client, &mut host_core, &mut client_core);
    assert_eq!(h, c, "client never recovered the host's state");
}

// =====================================================================
// Duplicate INPUT (S6)
// =====================================================================

#[test]
fn duplicate_input_is_dropped_without_a_nak() {
    let (ours, theirs) = MemoryTransport::pair();
    let (mut client, mut core) = spectating_client(ours);
    let mut script = ScriptedHost::new(theirs);
    script.serve_handshake(&mut client, &mut core, plain_sync());

    for f in 0..=30u32 {
        script.send(&host_input(f, f));
        client.advance_frame(&mut core, ZERO).expect("advance");
    }
    assert_eq!(client.read_frame(PlayerSlot::new(0)), rollplay::Frame::new(31));

    // The same frame lands twice more; both copies are silently ignored.
    script.send(&host_input(30, 30));
    script.send(&host_input(30, 30));
    client.poll(&mut core).expect("poll");
    client.poll(&mut core).expect("poll");

    assert_eq!(client.read_frame(PlayerSlot::new(0)), rollplay::Frame::new(31));
    assert_eq!(client.active_connections(), 1);
    let answers = script.recv_all();
    assert!(!answers.contains(&Message::Nak), "duplicate must not be refused");
}

// =====================================================================
// Stall and pause
// =====================================================================

#[test]
fn silent_host_eventually_stalls_the_client() {
    let (ours, theirs) = MemoryTransport::pair();
    let (mut client, mut core) = spectating_client(ours);
    let mut script = ScriptedHost::new(theirs);
    script.serve_handshake(&mut client, &mut core, plain_sync());

    for f in 0..3u32 {
        script.send(&host_input(f, 0));
        client.advance_frame(&mut core, ZERO).expect("advance");
    }

    // The host goes silent; prediction carries the client until the
    // delay budget is spent, then the retry budget runs out.
    let mut stalled = None;
    for _ in 0..16 {
        match client.advance_frame(&mut core, ZERO) {
            Ok(()) => {}
            Err(e) => {
                stalled = Some(e);
                break;
            }
        }
    }
    match stalled {
        Some(NetplayError::Stall { retries, .. }) => assert!(retries >= 4),
        other => panic!("expected a stall, got {other:?}"),
    }
}

#[test]
fn pause_holds_the_frame_and_resume_releases_it() {
    let (ours, theirs) = MemoryTransport::pair();
    let (mut client, mut core) = spectating_client(ours);
    let mut script = ScriptedHost::new(theirs);
    script.serve_handshake(&mut client, &mut core, plain_sync());

    script.send(&host_input(0, 0));
    client.advance_frame(&mut core, ZERO).expect("advance");
    assert_eq!(client.current_frame(), rollplay::Frame::new(1));

    script.send(&Message::Pause);
    client.poll(&mut core).expect("poll");
    assert!(client.remote_paused());
    assert!(client
        .events()
        .any(|e| matches!(e, NetplayEvent::PeerPaused { .. })));

    client.advance_frame(&mut core, ZERO).expect("paused advance");
    assert_eq!(client.current_frame(), rollplay::Frame::new(1), "paused session must not advance");

    script.send(&Message::Resume);
    client.poll(&mut core).expect("poll");
    assert!(!client.remote_paused());
    assert!(client.events().any(|e| e == NetplayEvent::PeerResumed));

    script.send(&host_input(1, 0));
    client.advance_frame(&mut core, ZERO).expect("advance");
    assert_eq!(client.current_frame(), rollplay::Frame::new(2));
}
