//! The handshake over a real TCP loopback connection.

mod common;

use std::time::Duration;

use common::StubCore;
use rollplay::{NetplayEvent, PlayerSlot, SessionBuilder};

const ZERO: [u32; 3] = [0, 0, 0];

#[test]
fn tcp_handshake_on_the_stock_port() {
    let mut host = SessionBuilder::new()
        .nick("host")
        .retry_ms(2)
        .start_host(55435)
        .expect("host session");
    let mut client = SessionBuilder::new()
        .nick("guest")
        .retry_ms(2)
        .start_client("127.0.0.1", 55435)
        .expect("client session");

    let mut host_core = StubCore::new();
    let mut client_core = StubCore::new();
    for _ in 0..256 {
        client.advance_frame(&mut client_core, ZERO).expect("client advance");
        host.advance_frame(&mut host_core, ZERO).expect("host advance");
        if client.local_player().is_some() && !host.connected_players().is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(client.local_player(), Some(PlayerSlot::new(1)));
    assert!(host.connected_players().contains(PlayerSlot::new(1)));
    assert!(client
        .events()
        .any(|e| e == NetplayEvent::YouJoined(PlayerSlot::new(1))));

    // Orderly teardown reaches the client as a hangup.
    host.disconnect();
    for _ in 0..64 {
        client.poll(&mut client_core).expect("client poll");
        if client.active_connections() == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(client.active_connections(), 0);
    assert!(client.events().any(|e| e == NetplayEvent::Disconnected));
}
