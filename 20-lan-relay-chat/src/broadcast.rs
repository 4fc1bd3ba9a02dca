use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::future::join_all;
use tokio::{net::UdpSocket, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    packet::{Packet, PacketKind, SessionId},
    relay::RelayRegistry,
    roster::Roster,
};

/// Largest UDP payload, so no datagram is ever truncated on receive.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Body the server relays for a chat message.
pub fn chat_line(sender: &str, text: &str) -> String {
    format!("{sender}: {text}")
}

pub fn online_announcement(name: &str) -> String {
    format!("--- {name} is online ---")
}

pub fn offline_announcement(name: &str) -> String {
    format!("--- {name} is offline ---")
}

/// Outcome of dispatching one inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Rewritten packet for every roster member except the originator.
    pub broadcast: Packet,
    /// Packet sent back to the originator only.
    pub reply: Option<Packet>,
}

pub struct BroadcastEngine {
    socket: UdpSocket,
    roster: Arc<Roster>,
    relays: Arc<RelayRegistry>,
    next_session: AtomicU64,
}

impl BroadcastEngine {
    pub fn new(socket: UdpSocket, roster: Arc<Roster>, relays: Arc<RelayRegistry>) -> Self {
        Self {
            socket,
            roster,
            relays,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives datagrams until `shutdown` fires. Receive, decode and send
    /// failures are logged and never end the loop.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    info!("message channel stopped");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                    Err(error) => warn!(?error, "failed to receive datagram"),
                }
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(error) => {
                warn!(%from, %error, "dropping malformed datagram");
                return;
            }
        };

        let Some(dispatch) = self.dispatch(packet, from).await else {
            return;
        };

        if let Some(reply) = &dispatch.reply {
            self.send_reply(reply, from).await;
        }
        self.fan_out(&dispatch.broadcast, from).await;
    }

    /// Applies one packet to the roster and rewrites its body for fan-out.
    pub async fn dispatch(&self, mut packet: Packet, from: SocketAddr) -> Option<Dispatch> {
        let mut reply = None;

        match packet.kind {
            PacketKind::Message => {
                packet.body = chat_line(&packet.sender, &packet.body);
            }
            PacketKind::Login => {
                let session = match self.roster.find_by_address(from).await {
                    Some(existing) => existing.session,
                    None => self.next_session(),
                };
                self.roster
                    .insert(from, packet.sender.clone(), session)
                    .await;
                info!(%from, name = %packet.sender, %session, "client logged in");

                reply = Some(Packet::welcome(packet.sender.clone(), session));
                packet.body = online_announcement(&packet.sender);
            }
            PacketKind::Logout => {
                if let Some(entry) = self.roster.remove(from).await {
                    let closed = self.relays.close_session(entry.session).await;
                    info!(%from, name = %entry.name, session = %entry.session, closed, "client logged out");
                }
                packet.body = offline_announcement(&packet.sender);
            }
            PacketKind::Welcome | PacketKind::Null => {
                warn!(%from, kind = ?packet.kind, "ignoring server-only packet from client");
                return None;
            }
        }

        info!("{}", packet.body);
        Some(Dispatch {
            broadcast: packet,
            reply,
        })
    }

    fn next_session(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    async fn send_reply(&self, reply: &Packet, to: SocketAddr) {
        if reply.encoded_len() > MAX_DATAGRAM_LEN {
            warn!(%to, bytes = reply.encoded_len(), "reply exceeds the datagram limit, dropping");
            return;
        }
        let result = match reply.encode() {
            Ok(data) => self.socket.send_to(&data, to).await.map(drop),
            Err(error) => {
                warn!(%to, %error, "failed to encode reply");
                return;
            }
        };
        if let Err(error) = result {
            warn!(%to, ?error, "failed to send reply");
        }
    }

    /// Sends `packet` to every roster member except `origin`. Each send is
    /// independent; one failing recipient does not affect the rest.
    async fn fan_out(&self, packet: &Packet, origin: SocketAddr) {
        if packet.encoded_len() > MAX_DATAGRAM_LEN {
            warn!(%origin, bytes = packet.encoded_len(), "broadcast exceeds the datagram limit, dropping");
            return;
        }
        let data = match packet.encode() {
            Ok(data) => data,
            Err(error) => {
                warn!(%error, "failed to encode broadcast");
                return;
            }
        };

        let recipients: Vec<_> = self
            .roster
            .snapshot()
            .await
            .into_iter()
            .filter(|entry| entry.address != origin)
            .collect();

        let sends = recipients
            .iter()
            .map(|entry| self.socket.send_to(&data, entry.address));
        let results = join_all(sends).await;

        for (entry, result) in recipients.iter().zip(results) {
            if let Err(error) = result {
                warn!(to = %entry.address, name = %entry.name, ?error, "failed to deliver packet");
            }
        }
        debug!(recipients = recipients.len(), "broadcast sent");
    }
}
