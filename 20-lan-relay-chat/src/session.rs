//! Client side of both channels.
//!
//! [`Session::login`] sends the Login packet, connects the file channel and
//! spawns one receive task per channel. Both tasks push into a single ordered
//! [`SessionEvent`] queue that the caller consumes; user actions go through
//! the `send_*` methods and [`Session::logout`].

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use anyhow::{Context, Result, ensure};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{
        TcpStream, UdpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc, watch},
    task::JoinSet,
};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::{
    DEFAULT_FILE_PORT, DEFAULT_MESSAGE_PORT,
    broadcast::{MAX_DATAGRAM_LEN, chat_line, offline_announcement},
    frame::{DEFAULT_MAX_FRAME_LEN, FileFrame, FileType, file_codec},
    packet::{Packet, PacketKind, SessionId},
};

const EVENT_QUEUE_CAPACITY: usize = 256;

type FileWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;
type FileReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    pub message_server: SocketAddr,
    pub file_server: SocketAddr,
    pub max_frame_len: usize,
}

impl SessionConfig {
    /// Targets the default ports on `server`.
    pub fn new(name: impl Into<String>, server: IpAddr) -> Self {
        Self {
            name: name.into(),
            message_server: SocketAddr::new(server, DEFAULT_MESSAGE_PORT),
            file_server: SocketAddr::new(server, DEFAULT_FILE_PORT),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Online,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The server acknowledged the login and issued a session id.
    Welcome(SessionId),
    /// Someone came online or went offline.
    Announcement(String),
    /// A chat line, already prefixed with its author.
    ChatLine(String),
    FileReceived { file_type: FileType, contents: Bytes },
    /// The server closed the file channel.
    FileChannelClosed,
}

pub struct Session {
    name: String,
    socket: Arc<UdpSocket>,
    files: Arc<Mutex<FileWriter>>,
    state: watch::Sender<SessionState>,
    tasks: JoinSet<()>,
}

impl Session {
    /// Logs in and opens both channels.
    ///
    /// The session is considered online as soon as the Login packet is sent;
    /// the server's Welcome arrives later as [`SessionEvent::Welcome`].
    pub async fn login(config: SessionConfig) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        ensure!(
            name_fits(&config.name),
            "name is {} bytes, too long to announce in one datagram",
            config.name.len()
        );
        let (state, _) = watch::channel(SessionState::Connecting);

        let socket = UdpSocket::bind(local_bind_addr(config.message_server))
            .await
            .context("failed to bind message socket")?;
        socket
            .connect(config.message_server)
            .await
            .with_context(|| format!("failed to reach {}", config.message_server))?;

        let login = Packet::login(config.name.clone()).encode()?;
        socket.send(&login).await.context("failed to send login")?;
        state.send_replace(SessionState::Online);
        info!(server = %config.message_server, name = %config.name, "login sent");

        let stream = match TcpStream::connect(config.file_server).await {
            Ok(stream) => stream,
            Err(error) => {
                withdraw_login(&socket, &config.name).await;
                return Err(anyhow::Error::new(error)
                    .context(format!("failed to connect to {}", config.file_server)));
            }
        };
        let (reader, writer) = stream.into_split();
        let files = Arc::new(Mutex::new(FramedWrite::new(
            writer,
            file_codec(config.max_frame_len),
        )));
        let frames = FramedRead::new(reader, file_codec(config.max_frame_len));

        let socket = Arc::new(socket);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let mut tasks = JoinSet::new();
        tasks.spawn(receive_packets(
            Arc::clone(&socket),
            Arc::clone(&files),
            events_tx.clone(),
        ));
        tasks.spawn(receive_files(frames, events_tx));

        let session = Self {
            name: config.name,
            socket,
            files,
            state,
            tasks,
        };
        Ok((session, events_rx))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Sends one chat line. Fails without sending if the line the server
    /// relays would not fit in a single datagram.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<()> {
        self.ensure_online()?;
        let text = text.into();
        let limit = max_message_len(&self.name);
        ensure!(
            text.len() <= limit,
            "message is {} bytes, at most {limit} fit in one datagram",
            text.len()
        );
        let packet = Packet::message(self.name.clone(), text).encode()?;
        self.socket
            .send(&packet)
            .await
            .context("failed to send message")?;
        Ok(())
    }

    /// Sends one whole file as a single relay frame.
    pub async fn send_file(&self, file_type: FileType, contents: impl Into<Bytes>) -> Result<()> {
        self.ensure_online()?;
        let frame = FileFrame::file(file_type, contents).encode();
        self.files
            .lock()
            .await
            .send(frame)
            .await
            .context("failed to send file")?;
        Ok(())
    }

    /// Sends Logout and closes both channels. Calling it again is a no-op.
    pub async fn logout(&mut self) -> Result<()> {
        if self.state() == SessionState::Disconnected {
            return Ok(());
        }
        self.state.send_replace(SessionState::Disconnecting);

        let sent = match Packet::logout(self.name.clone()).encode() {
            Ok(packet) => self
                .socket
                .send(&packet)
                .await
                .map(drop)
                .context("failed to send logout"),
            Err(error) => Err(error.into()),
        };

        if let Err(error) = SinkExt::<Bytes>::close(&mut *self.files.lock().await).await {
            debug!(?error, "failed to close file channel cleanly");
        }
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}

        self.state.send_replace(SessionState::Disconnected);
        info!(name = %self.name, "logged out");
        sent
    }

    fn ensure_online(&self) -> Result<()> {
        ensure!(
            self.state() == SessionState::Online,
            "session is not online"
        );
        Ok(())
    }
}

/// Longest chat text `name` can send once the server prefixes the sender.
pub fn max_message_len(name: &str) -> usize {
    let overhead = Packet::message(name, chat_line(name, "")).encoded_len();
    MAX_DATAGRAM_LEN.saturating_sub(overhead)
}

fn name_fits(name: &str) -> bool {
    Packet::logout(name).encoded_len() + offline_announcement(name).len() <= MAX_DATAGRAM_LEN
}

// Undoes a Login the server may already have announced.
async fn withdraw_login(socket: &UdpSocket, name: &str) {
    let sent = match Packet::logout(name).encode() {
        Ok(packet) => socket.send(&packet).await.map(drop),
        Err(error) => {
            warn!(%error, "failed to encode logout");
            return;
        }
    };
    if let Err(error) = sent {
        warn!(?error, "failed to withdraw login");
    }
}

fn local_bind_addr(server: SocketAddr) -> SocketAddr {
    let ip: IpAddr = match server.ip() {
        IpAddr::V4(ip) if ip.is_loopback() => Ipv4Addr::LOCALHOST.into(),
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(ip) if ip.is_loopback() => Ipv6Addr::LOCALHOST.into(),
        IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    SocketAddr::new(ip, 0)
}

async fn receive_packets(
    socket: Arc<UdpSocket>,
    files: Arc<Mutex<FileWriter>>,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    loop {
        let len = match socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(error) => {
                warn!(?error, "failed to receive datagram");
                continue;
            }
        };

        let packet = match Packet::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(error) => {
                warn!(%error, "dropping malformed datagram");
                continue;
            }
        };

        let event = match packet.kind {
            PacketKind::Welcome => match packet.session_id() {
                Some(session) => {
                    attach_file_channel(&files, session).await;
                    SessionEvent::Welcome(session)
                }
                None => {
                    warn!(body = %packet.body, "welcome without a session id");
                    continue;
                }
            },
            PacketKind::Message => SessionEvent::ChatLine(packet.body),
            PacketKind::Login | PacketKind::Logout => SessionEvent::Announcement(packet.body),
            PacketKind::Null => continue,
        };

        if events.send(event).await.is_err() {
            break;
        }
    }
}

async fn attach_file_channel(files: &Mutex<FileWriter>, session: SessionId) {
    let frame = FileFrame::Attach(session).encode();
    if let Err(error) = files.lock().await.send(frame).await {
        warn!(?error, %session, "failed to attach file channel");
    }
}

async fn receive_files(mut frames: FileReader, events: mpsc::Sender<SessionEvent>) {
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame.freeze(),
            Err(error) => {
                warn!(?error, "file channel framing error");
                break;
            }
        };

        match FileFrame::decode(frame) {
            Ok(FileFrame::File {
                file_type,
                contents,
            }) => {
                let event = SessionEvent::FileReceived {
                    file_type,
                    contents,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Ok(FileFrame::Attach(_)) => debug!("ignoring attach frame from server"),
            Err(error) => warn!(%error, "dropping malformed file frame"),
        }
    }

    let _ = events.send(SessionEvent::FileChannelClosed).await;
}
