// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::wire::IrcMessage;

type OutboxTx = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct Registry {
    /// nick -> outbound line sender for that connection.
    nicks: HashMap<String, OutboxTx>,
    /// channel -> set of member nicks.
    channels: HashMap<String, HashSet<String>>,
}

/// The in-process bus server (§4.1). One server per orchestrator session;
/// every agent process and the orchestrator itself connect to it as a
/// `BusClient`.
pub struct BusServer {
    listener: TcpListener,
    port: u16,
    registry: Arc<Mutex<Registry>>,
}

impl BusServer {
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let bound_port = listener.local_addr()?.port();
        Ok(Self { listener, port: bound_port, registry: Arc::new(Mutex::new(Registry::default())) })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept connections until the process is torn down. Each connection
    /// gets its own task; a handler panic or I/O error only drops that
    /// connection (§7 "a handler callback on C1 never lets an exception
    /// escape").
    pub async fn run(self) {
        info!(port = self.port, "bus server listening");
        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => {
                    debug!(%addr, "bus server accepted connection");
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, registry).await {
                            debug!(%addr, error = %e, "bus connection closed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "bus server accept failed");
                }
            }
        }
    }
}

async fn handle_connection(socket: TcpStream, registry: Arc<Mutex<Registry>>) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut nick: Option<String> = None;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break; // EOF
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }

        let Some(msg) = IrcMessage::parse(trimmed) else {
            continue; // malformed frames are ignored, §4.1
        };

        match msg {
            IrcMessage::Nick { nick: n } => {
                let mut reg = registry.lock().await;
                reg.nicks.insert(n.clone(), tx.clone());
                nick = Some(n);
            }
            IrcMessage::User { .. } => {}
            IrcMessage::Join { channel } => {
                if let Some(n) = &nick {
                    let mut reg = registry.lock().await;
                    reg.channels.entry(channel).or_default().insert(n.clone());
                }
            }
            IrcMessage::Part { channel } => {
                if let Some(n) = &nick {
                    let mut reg = registry.lock().await;
                    if let Some(members) = reg.channels.get_mut(&channel) {
                        members.remove(n);
                    }
                }
            }
            IrcMessage::Ping { token } => {
                let _ = tx.send(IrcMessage::Pong { token }.to_wire());
            }
            IrcMessage::Pong { .. } => {}
            IrcMessage::Privmsg { target, payload, .. } => {
                if let Some(sender_nick) = &nick {
                    relay_privmsg(&registry, sender_nick, &target, &payload).await;
                }
            }
            IrcMessage::Quit { .. } => break,
        }
    }

    if let Some(n) = nick {
        let mut reg = registry.lock().await;
        reg.nicks.remove(&n);
        for members in reg.channels.values_mut() {
            members.remove(&n);
        }
    }
    Ok(())
}

/// Fan a PRIVMSG out to every member of `target` if it's a channel, or to a
/// single nick otherwise. Delivery to each subscriber happens in the order
/// the server accepted the message (§4.1 ordering guarantee).
async fn relay_privmsg(registry: &Arc<Mutex<Registry>>, sender: &str, target: &str, payload: &str) {
    let wire = IrcMessage::Privmsg {
        sender: Some(sender.to_string()),
        target: target.to_string(),
        payload: payload.to_string(),
    };
    let line = format!(":{sender}!agent@swarm {}", wire_tail(&wire));

    let reg = registry.lock().await;
    if let Some(channel) = target.strip_prefix('#') {
        let channel_name = format!("#{channel}");
        if let Some(members) = reg.channels.get(&channel_name) {
            for member in members {
                if let Some(out) = reg.nicks.get(member) {
                    let _ = out.send(line.clone());
                }
            }
        }
    } else if let Some(out) = reg.nicks.get(target) {
        let _ = out.send(line);
    }
}

fn wire_tail(msg: &IrcMessage) -> String {
    // msg.to_wire() already renders "PRIVMSG target :payload\r\n"; we just
    // need that tail appended after our own ":nick!..." prefix.
    msg.to_wire()
}
