//! End-to-end tests over real loopback sockets: one server process-side,
//! real `Client` endpoints, frames on the wire.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use postroom::{
    Client, Connection, Frame, OwnedMessage, Server, ServerContext, ServerHandler, TsQueue,
};

const DEADLINE: Duration = Duration::from_secs(5);

fn start_server<H: ServerHandler>(handler: H) -> (Server<H>, SocketAddr) {
    let mut server = Server::new(SocketAddr::from(([127, 0, 0, 1], 0)), handler);
    server.start().expect("start server");
    let addr = server.local_addr().expect("bound address");
    (server, addr)
}

fn connect_client(addr: SocketAddr) -> Client {
    let mut client = Client::new();
    assert!(client.connect("127.0.0.1", addr.port()), "connect to {addr}");
    client
}

/// Drive the dispatch loop until `done` reports success.
fn pump_until<H: ServerHandler>(server: &Server<H>, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    loop {
        server.update(Some(64), false);
        if done() {
            return;
        }
        assert!(Instant::now() < deadline, "timed out driving the server");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Block until the client-side inbound queue yields a frame.
fn recv_frame(incoming: &Arc<TsQueue<OwnedMessage>>) -> Frame {
    let deadline = Instant::now() + DEADLINE;
    while incoming.is_empty() {
        assert!(Instant::now() < deadline, "timed out waiting for a frame");
        std::thread::sleep(Duration::from_millis(10));
    }
    incoming.pop_front().message
}

/// Records every message hook invocation on a channel.
struct Recorder {
    events: mpsc::Sender<(u32, Frame)>,
}

impl ServerHandler for Recorder {
    fn on_message(&mut self, _ctx: &ServerContext<'_>, client: &Arc<Connection>, message: Frame) {
        let _ = self.events.send((client.id(), message));
    }
}

#[test]
fn frames_reach_the_message_hook_in_order() {
    let (tx, rx) = mpsc::channel();
    let (server, addr) = start_server(Recorder { events: tx });
    let client = connect_client(addr);

    for i in 0..20u32 {
        let mut frame = Frame::new(7);
        frame.set_sender_name("alice");
        frame.set_payload(&i.to_string());
        client.send(frame);
    }

    let mut received = Vec::new();
    pump_until(&server, || {
        received.extend(rx.try_iter());
        received.len() >= 20
    });

    assert_eq!(received.len(), 20);
    let first_id = received[0].0;
    assert!(first_id >= 10000, "identities start at the seed");
    for (i, (id, frame)) in received.iter().enumerate() {
        assert_eq!(*id, first_id, "one client, one identity");
        assert_eq!(frame.kind, 7);
        assert_eq!(frame.sender_name(), "alice");
        assert_eq!(frame.payload(), i.to_string());
        assert!(frame.timestamp_ms > 0);
    }
}

#[test]
fn connect_hook_sends_reach_the_client() {
    struct Greeter;

    impl ServerHandler for Greeter {
        fn on_client_connect(&mut self, client: &Arc<Connection>) -> bool {
            let mut frame = Frame::new(1);
            frame.set_sender_name("server");
            frame.set_payload("welcome");
            client.send(frame);
            true
        }
    }

    let (_server, addr) = start_server(Greeter);
    let client = connect_client(addr);

    let frame = recv_frame(&client.incoming());
    assert_eq!(frame.kind, 1);
    assert_eq!(frame.payload(), "welcome");
}

#[test]
fn hook_replies_reach_the_sender() {
    struct Echo;

    impl ServerHandler for Echo {
        fn on_message(
            &mut self,
            ctx: &ServerContext<'_>,
            client: &Arc<Connection>,
            message: Frame,
        ) {
            ctx.message_client(client, &message);
        }
    }

    let (server, addr) = start_server(Echo);
    let client = connect_client(addr);

    let mut frame = Frame::new(3);
    frame.set_payload("marco");
    client.send(frame);

    let incoming = client.incoming();
    pump_until(&server, || !incoming.is_empty());
    assert_eq!(recv_frame(&incoming).payload(), "marco");
}

#[test]
fn denied_connection_is_closed_and_never_registered() {
    struct Bouncer;

    impl ServerHandler for Bouncer {
        fn on_client_connect(&mut self, _client: &Arc<Connection>) -> bool {
            false
        }
    }

    let (server, addr) = start_server(Bouncer);
    let client = connect_client(addr);

    // The socket was accepted and then closed; the client notices on its
    // next read.
    let deadline = Instant::now() + DEADLINE;
    while client.is_connected() {
        assert!(Instant::now() < deadline, "client never saw the close");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.client_count(), 0);
}

#[test]
fn client_notices_when_the_server_stops() {
    let (tx, rx) = mpsc::channel();
    let (mut server, addr) = start_server(Recorder { events: tx });
    let client = connect_client(addr);

    let mut frame = Frame::new(2);
    frame.set_payload("present");
    client.send(frame);
    pump_until(&server, || rx.try_iter().count() > 0);

    server.stop();
    server.stop();

    let deadline = Instant::now() + DEADLINE;
    while client.is_connected() {
        assert!(Instant::now() < deadline, "client never saw the shutdown");
        std::thread::sleep(Duration::from_millis(10));
    }
}
