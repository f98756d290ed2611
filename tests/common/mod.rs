//! Shared test fixtures: a deterministic stub core and a scripted host
//! that speaks raw wire bytes over an in-process transport.

#![allow(dead_code)] // each test binary uses its own subset of the fixtures

use rollplay::network::wire::{self, Message};
use rollplay::{
    EmulatorCore, InputWords, MemoryTransport, NetplaySession, PeerTransport, SessionBuilder,
    MAX_PLAYERS,
};

/// A tiny deterministic simulation. The state is a frame counter plus a
/// running hash of every input sample ever applied, so any divergence in
/// input history shows up in the serialized state and its checksum.
pub struct StubCore {
    pub frame: u32,
    pub trace: u64,
}

impl StubCore {
    pub fn new() -> Self {
        Self { frame: 0, trace: 0xcbf2_9ce4_8422_2325 }
    }

    pub fn state(&self) -> (u32, u64) {
        (self.frame, self.trace)
    }
}

impl EmulatorCore for StubCore {
    fn serialize_size(&mut self) -> usize {
        12
    }

    fn serialize(&mut self, buf: &mut [u8]) -> bool {
        if buf.len() != 12 {
            return false;
        }
        buf[..4].copy_from_slice(&self.frame.to_be_bytes());
        buf[4..].copy_from_slice(&self.trace.to_be_bytes());
        true
    }

    fn unserialize(&mut self, buf: &[u8]) -> bool {
        if buf.len() != 12 {
            return false;
        }
        self.frame = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        self.trace = u64::from_be_bytes([
            buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
        ]);
        true
    }

    fn run_frame(&mut self, inputs: &[InputWords; MAX_PLAYERS]) {
        for (port, words) in inputs.iter().enumerate() {
            for &word in words {
                self.trace ^= (port as u64) << 32 | u64::from(word);
                self.trace = self.trace.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        self.frame = self.frame.wrapping_add(1);
        self.trace ^= u64::from(self.frame);
    }
}

/// Builds a connected host/client pair over an in-process transport and
/// drives both, one frame at a time, until the client holds a player
/// slot. The client steps first, so once playing it always has its input
/// on the wire before the host needs it.
pub fn connected_pair(
    delay_frames: u32,
    check_frames: u32,
) -> (NetplaySession, NetplaySession, StubCore, StubCore) {
    let mut host = SessionBuilder::new()
        .nick("host")
        .delay_frames(delay_frames)
        .check_frames(check_frames)
        .retry_ms(2)
        .start_host_unbound()
        .expect("host session");
    let (a, b) = MemoryTransport::pair();
    host.attach_peer(Box::new(a));
    let mut client = SessionBuilder::new()
        .nick("guest")
        .delay_frames(delay_frames)
        .check_frames(check_frames)
        .retry_ms(2)
        .start_client_with_transport(Box::new(b))
        .expect("client session");

    let mut host_core = StubCore::new();
    let mut client_core = StubCore::new();
    for _ in 0..64 {
        step_pair(
            &mut host,
            &mut client,
            &mut host_core,
            &mut client_core,
            [0; 3],
            [0; 3],
        );
        if client.local_player().is_some() && !host.connected_players().is_empty() {
            return (host, client, host_core, client_core);
        }
    }
    panic!("the pair never finished connecting");
}

/// Advances the client first (so it predicts ahead of the wire) and then
/// the host, one frame each.
pub fn step_pair(
    host: &mut NetplaySession,
    client: &mut NetplaySession,
    host_core: &mut StubCore,
    client_core: &mut StubCore,
    host_input: InputWords,
    client_input: InputWords,
) {
    client
        .advance_frame(client_core, client_input)
        .expect("client advance");
    host.advance_frame(host_core, host_input).expect("host advance");
}

/// A hand-driven host end: raw wire bytes over a [`MemoryTransport`],
/// with no session logic behind it.
pub struct ScriptedHost {
    transport: MemoryTransport,
    inbound: Vec<u8>,
}

impl ScriptedHost {
    pub fn new(transport: MemoryTransport) -> Self {
        Self {
            transport,
            inbound: Vec::new(),
        }
    }

    pub fn send(&mut self, msg: &Message) {
        let bytes = wire::encode(msg);
        let mut at = 0;
        while at < bytes.len() {
            at += self.transport.try_send(&bytes[at..]).expect("scripted send");
        }
    }

    /// Everything the client has sent since the last call.
    pub fn recv_all(&mut self) -> Vec<Message> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.transport.try_recv(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("scripted recv failed: {e}"),
            }
        }
        let mut out = Vec::new();
        while let Some((msg, used)) = wire::parse(&self.inbound, 1 << 20).expect("scripted parse") {
            self.inbound.drain(..used);
            out.push(msg);
        }
        out
    }

    /// Serves the handshake from the host side until the client is
    /// established. `sync` is the SYNC message to finish with.
    pub fn serve_handshake(
        &mut self,
        client: &mut NetplaySession,
        core: &mut StubCore,
        sync: Message,
    ) {
        let mut sync_sent = false;
        for _ in 0..32 {
            client.poll(core).expect("client poll");
            if sync_sent {
                // The SYNC has been delivered and processed by now.
                return;
            }
            for msg in self.recv_all() {
                match msg {
                    Message::Hello { .. } => self.send(&Message::Hello {
                        magic: wire::HELLO_MAGIC,
                        version: wire::PROTOCOL_VERSION,
                    }),
                    Message::Nick { .. } => self.send(&Message::Nick {
                        nick: wire::pad_field("scripted"),
                    }),
                    Message::Password { .. } => {
                        self.send(&sync);
                        sync_sent = true;
                    }
                    Message::Play | Message::Input { .. } => {}
                    other => panic!("unexpected handshake traffic: {other:?}"),
                }
            }
        }
        panic!("scripted handshake never completed");
    }
}
