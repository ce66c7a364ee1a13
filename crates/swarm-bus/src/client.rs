// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::wire::IrcMessage;

type OutboxTx = mpsc::UnboundedSender<String>;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("failed to connect to bus at {addr}: {source}")]
    Connect { addr: String, #[source] source: std::io::Error },
    #[error("bus connection closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),
}

/// An event surfaced to a `BusClient` caller from the receive loop. Only
/// `Privmsg` carries application payload; the rest are plumbing.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Privmsg { channel: String, sender: Option<String>, payload: String },
    Joined { channel: String },
    Disconnected,
}

/// A connected handle to the bus (§4.1). Every agent process and the
/// orchestrator hold exactly one of these. A failure on the *first* connect
/// is fatal to orchestrator init; failures on subsequent `send_message`
/// calls are logged and otherwise swallowed so one bad socket doesn't bring
/// down a worker mid-task.
pub struct BusClient {
    nick: String,
    outbox: OutboxTx,
    events: mpsc::UnboundedReceiver<BusEvent>,
}

impl BusClient {
    /// Connect to the bus on `port`, register `nick`, and start the receive
    /// loop. Returns `Err` only if the TCP connect itself fails; once
    /// connected, handshake writes are best-effort like any other send.
    ///
    /// The write half is owned by a dedicated task draining an outbox
    /// channel (mirroring `BusServer::handle_connection`'s per-connection
    /// writer), so the receive loop can hold a sender clone and answer an
    /// incoming `PING` with a `PONG` without contending with callers of
    /// `join_channel`/`send_message` for the socket.
    pub async fn connect(port: u16, nick: &str) -> Result<Self, BusError> {
        let addr = format!("127.0.0.1:{port}");
        let stream = TcpStream::connect(&addr).await.map_err(|source| BusError::Connect { addr, source })?;
        let (read_half, mut write_half) = tokio::io::split(stream);

        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = outbox_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let _ = outbox.send(IrcMessage::Nick { nick: nick.to_string() }.to_wire());
        let _ = outbox.send(IrcMessage::User { nick: nick.to_string() }.to_wire());

        let (tx, rx) = mpsc::unbounded_channel();
        let nick_owned = nick.to_string();
        let pong_outbox = outbox.clone();
        tokio::spawn(async move {
            receive_loop(read_half, tx, pong_outbox, nick_owned).await;
        });

        Ok(Self { nick: nick.to_string(), outbox, events: rx })
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub async fn join_channel(&mut self, channel: &str) -> Result<(), BusError> {
        self.write_frame(IrcMessage::Join { channel: channel.to_string() }).await
    }

    pub async fn leave_channel(&mut self, channel: &str) -> Result<(), BusError> {
        self.write_frame(IrcMessage::Part { channel: channel.to_string() }).await
    }

    /// Send `payload` to `target` (a `#channel` or a bare nick). Embedded
    /// newlines are escaped on the wire and restored by the receiver.
    pub async fn send_message(&mut self, target: &str, payload: &str) -> Result<(), BusError> {
        self.write_frame(IrcMessage::Privmsg {
            sender: None,
            target: target.to_string(),
            payload: payload.to_string(),
        })
        .await
    }

    async fn write_frame(&mut self, msg: IrcMessage) -> Result<(), BusError> {
        self.outbox.send(msg.to_wire()).map_err(|_| {
            warn!(nick = %self.nick, "bus send failed, connection closed");
            BusError::Send(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "bus writer task gone"))
        })
    }

    /// Await the next event from the bus. Returns `None` once the
    /// connection has closed and will never produce another event.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.events.recv().await
    }
}

async fn receive_loop(
    read_half: tokio::io::ReadHalf<TcpStream>,
    tx: mpsc::UnboundedSender<BusEvent>,
    outbox: OutboxTx,
    nick: String,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%nick, error = %e, "bus read failed");
                break;
            }
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }
        let Some(msg) = IrcMessage::parse(trimmed) else { continue };
        match msg {
            IrcMessage::Privmsg { sender, target, payload } => {
                let _ = tx.send(BusEvent::Privmsg { channel: target, sender, payload });
            }
            IrcMessage::Ping { token } => {
                let _ = outbox.send(IrcMessage::Pong { token }.to_wire());
            }
            _ => {}
        }
    }
    let _ = tx.send(BusEvent::Disconnected);
}
