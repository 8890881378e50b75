//! Chat example: the sample protocol built on the framework.
//!
//! Run as two (or more) separate processes:
//!
//! ```bash
//! # Terminal 1 - start the server
//! cargo run --example chat -- server 9030
//!
//! # Terminal 2..N - run clients
//! cargo run --example chat -- client 127.0.0.1 9030
//! ```
//!
//! Client commands: plain text is passed to everyone else, `/ping`
//! measures round-trip time, `/all` pokes every other user, `/quit`
//! leaves.

use std::io::{BufRead, Write as _};
use std::net::SocketAddr;
use std::sync::Arc;

use postroom::{message, Client, Connection, Frame, Server, ServerContext, ServerHandler};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Message kinds
// ============================================================================

/// Kind tags of the chat protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum ChatKind {
    JoinServer = 0,
    ServerAccept,
    ServerDeny,
    ServerPing,
    MessageAll,
    ServerMessage,
    PassString,
}

impl ChatKind {
    fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => Self::JoinServer,
            1 => Self::ServerAccept,
            2 => Self::ServerDeny,
            3 => Self::ServerPing,
            4 => Self::MessageAll,
            5 => Self::ServerMessage,
            6 => Self::PassString,
            _ => return None,
        })
    }
}

fn frame(kind: ChatKind, sender: &str) -> Frame {
    let mut frame = Frame::new(kind as u32);
    frame.set_sender_name(sender);
    frame
}

// ============================================================================
// Server
// ============================================================================

struct ChatServer;

impl ServerHandler for ChatServer {
    fn on_client_connect(&mut self, client: &Arc<Connection>) -> bool {
        // Greet before registration; the frame flushes once the write
        // loop starts.
        client.send(frame(ChatKind::ServerAccept, "server"));
        true
    }

    fn on_client_disconnect(&mut self, _ctx: &ServerContext<'_>, client: &Arc<Connection>) {
        println!("Removing client [{}]", client.id());
    }

    fn on_message(&mut self, ctx: &ServerContext<'_>, client: &Arc<Connection>, message: Frame) {
        match ChatKind::from_tag(message.kind) {
            Some(ChatKind::JoinServer) => {
                println!("[{}] joined the server", message.sender_name());
            }
            Some(ChatKind::ServerPing) => {
                println!("[{}]: ping", message.sender_name());
                // Bounce it back unchanged so the client can compute RTT.
                ctx.message_client(client, &message);
            }
            Some(ChatKind::MessageAll) => {
                println!("[{}]: poke everyone", message.sender_name());
                let mut out = frame(ChatKind::ServerMessage, message.sender_name());
                out.set_payload("*poke*");
                ctx.message_all(&out, Some(client));
            }
            Some(ChatKind::PassString) => {
                println!("[{}]: {}", message.sender_name(), message.payload());
                let mut out = frame(ChatKind::ServerMessage, message.sender_name());
                out.set_payload(message.payload());
                out.timestamp_ms = message.timestamp_ms;
                ctx.message_all(&out, Some(client));
            }
            Some(ChatKind::ServerAccept) | Some(ChatKind::ServerDeny) | Some(ChatKind::ServerMessage) => {
                // Server-to-client kinds; a client should never send these.
            }
            None => {
                println!("unknown message kind {} from [{}]", message.kind, client.id());
            }
        }
    }
}

fn run_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new(SocketAddr::from(([0, 0, 0, 0], port)), ChatServer);
    server.start()?;
    println!("Chat server listening on port {port}");

    loop {
        server.update(None, true);
    }
}

// ============================================================================
// Client
// ============================================================================

fn run_client(host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::new();
    if !client.connect(host, port) {
        return Err(format!("could not connect to {host}:{port}").into());
    }

    print!("Input your name: ");
    std::io::stdout().flush()?;
    let stdin = std::io::stdin();
    let mut name = String::new();
    stdin.lock().read_line(&mut name)?;
    let name = name.trim().to_string();

    client.send(frame(ChatKind::JoinServer, &name));

    // Printer thread: drain the inbound queue and render.
    let incoming = client.incoming();
    std::thread::spawn(move || loop {
        incoming.wait_for_item();
        let owned = incoming.pop_front();
        let msg = owned.message;
        match ChatKind::from_tag(msg.kind) {
            Some(ChatKind::ServerAccept) => println!("Server accepted the connection"),
            Some(ChatKind::ServerDeny) => println!("Server denied the connection"),
            Some(ChatKind::ServerPing) => {
                let rtt = message::now_ms().saturating_sub(msg.timestamp_ms);
                println!("Ping: {rtt}ms");
            }
            Some(ChatKind::ServerMessage) => {
                println!("[{}]: {}", msg.sender_name(), msg.payload());
            }
            _ => {}
        }
    });

    for line in stdin.lock().lines() {
        let line = line?;
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if !client.is_connected() {
            println!("Connection to the server was lost");
            break;
        }
        match text {
            "/quit" => break,
            "/ping" => client.send(frame(ChatKind::ServerPing, &name)),
            "/all" => client.send(frame(ChatKind::MessageAll, &name)),
            _ => {
                let mut msg = frame(ChatKind::PassString, &name);
                msg.set_payload(text);
                client.send(msg);
            }
        }
    }

    client.disconnect();
    Ok(())
}

// ============================================================================
// Entry point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("server") => {
            let port = args.get(2).and_then(|p| p.parse().ok()).unwrap_or(9030);
            run_server(port)
        }
        Some("client") => {
            let host = args.get(2).cloned().unwrap_or_else(|| "127.0.0.1".to_string());
            let port = args.get(3).and_then(|p| p.parse().ok()).unwrap_or(9030);
            run_client(&host, port)
        }
        _ => {
            eprintln!("usage: chat server [port] | chat client [host] [port]");
            std::process::exit(1);
        }
    }
}
