use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, mpsc, watch},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{
    frame::{FileFrame, file_codec},
    packet::SessionId,
};

pub type ConnectionId = u64;

// Frames queued per recipient before further relays to it are dropped.
const OUTBOX_CAPACITY: usize = 64;

struct RelayConnection {
    peer: SocketAddr,
    session: Option<SessionId>,
    outbox: mpsc::Sender<Bytes>,
    closer: CancellationToken,
}

/// Every open file-channel connection, keyed by a per-accept id.
pub struct RelayRegistry {
    connections: Mutex<HashMap<ConnectionId, RelayConnection>>,
    next_id: AtomicU64,
    open: watch::Sender<usize>,
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayRegistry {
    pub fn new() -> Self {
        let (open, _) = watch::channel(0);
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            open,
        }
    }

    async fn register(
        &self,
        peer: SocketAddr,
        outbox: mpsc::Sender<Bytes>,
        closer: CancellationToken,
    ) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.connections.lock().await;
        connections.insert(
            id,
            RelayConnection {
                peer,
                session: None,
                outbox,
                closer,
            },
        );
        self.open.send_replace(connections.len());
        id
    }

    async fn deregister(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.lock().await;
        let removed = connections.remove(&id).is_some();
        self.open.send_replace(connections.len());
        removed
    }

    async fn attach(&self, id: ConnectionId, session: SessionId) -> bool {
        match self.connections.lock().await.get_mut(&id) {
            Some(connection) => {
                connection.session = Some(session);
                true
            }
            None => false,
        }
    }

    async fn outboxes_except(&self, origin: ConnectionId) -> Vec<(ConnectionId, mpsc::Sender<Bytes>)> {
        self.connections
            .lock()
            .await
            .iter()
            .filter(|(id, _)| **id != origin)
            .map(|(id, connection)| (*id, connection.outbox.clone()))
            .collect()
    }

    /// Asks every connection attached to `session` to close. Returns how many
    /// were signalled; each one deregisters itself once its task winds down.
    pub async fn close_session(&self, session: SessionId) -> usize {
        let connections = self.connections.lock().await;
        let mut closed = 0;
        for connection in connections.values() {
            if connection.session == Some(session) {
                debug!(peer = %connection.peer, %session, "closing file connection for session");
                connection.closer.cancel();
                closed += 1;
            }
        }
        closed
    }

    pub async fn close_all(&self) {
        for connection in self.connections.lock().await.values() {
            connection.closer.cancel();
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Sessions that currently have an attached file connection.
    pub async fn attached_sessions(&self) -> Vec<SessionId> {
        self.connections
            .lock()
            .await
            .values()
            .filter_map(|connection| connection.session)
            .collect()
    }

    /// Resolves once no connection is registered.
    pub async fn wait_drained(&self) {
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|count| *count == 0).await;
    }
}

/// Accepts file-channel connections and relays every file frame to all
/// other connected peers.
pub struct RelayEngine {
    listener: TcpListener,
    registry: Arc<RelayRegistry>,
    max_frame_len: usize,
}

impl RelayEngine {
    pub fn new(listener: TcpListener, registry: Arc<RelayRegistry>, max_frame_len: usize) -> Self {
        Self {
            listener,
            registry,
            max_frame_len,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop until `shutdown` fires. Connections that are
    /// already open keep running; the server drains them separately.
    pub async fn run(self, shutdown: CancellationToken) {
        let RelayEngine {
            listener,
            registry,
            max_frame_len,
        } = self;

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    info!("file channel stopped accepting");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, max_frame_len).await;
                }
            }
        }
    }
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<RelayRegistry>,
    max_frame_len: usize,
) {
    match result {
        Ok((stream, peer)) => {
            let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
            let closer = CancellationToken::new();
            let id = registry.register(peer, outbox_tx, closer.clone()).await;
            info!(%peer, connection = id, "file connection opened");

            let connection = Connection {
                id,
                peer,
                closer,
                registry: Arc::clone(registry),
            };
            tokio::spawn(handle_connection(stream, connection, outbox_rx, max_frame_len));
        }
        Err(err) => warn!(error = ?err, "failed to accept file connection"),
    }
}

// A registered connection as seen by its own tasks.
struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    closer: CancellationToken,
    registry: Arc<RelayRegistry>,
}

async fn handle_connection(
    stream: TcpStream,
    connection: Connection,
    outbox: mpsc::Receiver<Bytes>,
    max_frame_len: usize,
) {
    let Connection {
        id,
        peer,
        closer,
        registry,
    } = connection;
    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, file_codec(max_frame_len));
    let sink = FramedWrite::new(writer, file_codec(max_frame_len));

    let writer = tokio::spawn(write_frames(sink, outbox, closer.clone(), peer));
    read_frames(&mut frames, &registry, id, peer, &closer).await;

    registry.deregister(id).await;
    closer.cancel();
    let _ = writer.await;
    info!(%peer, connection = id, "file connection closed");
}

async fn read_frames(
    frames: &mut FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    registry: &RelayRegistry,
    id: ConnectionId,
    peer: SocketAddr,
    closer: &CancellationToken,
) {
    loop {
        select! {
            _ = closer.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(frame)) => handle_frame(registry, id, peer, frame.freeze()).await,
                Some(Err(error)) => {
                    warn!(%peer, ?error, "file channel framing error");
                    break;
                }
                None => break,
            }
        }
    }
}

async fn handle_frame(registry: &RelayRegistry, id: ConnectionId, peer: SocketAddr, frame: Bytes) {
    match FileFrame::decode(frame.clone()) {
        Ok(FileFrame::Attach(session)) => {
            if registry.attach(id, session).await {
                debug!(%peer, %session, "file connection attached to session");
            }
        }
        Ok(FileFrame::File {
            file_type,
            contents,
        }) => {
            let recipients = registry.outboxes_except(id).await;
            info!(
                %peer,
                file_type = file_type.extension(),
                bytes = contents.len(),
                recipients = recipients.len(),
                "relaying file"
            );
            relay(frame, recipients);
        }
        Err(error) => warn!(%peer, %error, "dropping malformed file frame"),
    }
}

fn relay(frame: Bytes, recipients: Vec<(ConnectionId, mpsc::Sender<Bytes>)>) {
    for (recipient, outbox) in recipients {
        if let Err(error) = outbox.try_send(frame.clone()) {
            warn!(connection = recipient, %error, "dropping relayed file for peer");
        }
    }
}

async fn write_frames(
    mut sink: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    mut outbox: mpsc::Receiver<Bytes>,
    closer: CancellationToken,
    peer: SocketAddr,
) {
    loop {
        select! {
            _ = closer.cancelled() => break,
            next = outbox.recv() => match next {
                Some(frame) => {
                    if let Err(error) = sink.send(frame).await {
                        debug!(%peer, ?error, "failed to deliver relayed file");
                        closer.cancel();
                        break;
                    }
                }
                None => break,
            }
        }
    }

    if let Err(error) = SinkExt::<Bytes>::close(&mut sink).await {
        debug!(%peer, ?error, "failed to shut down file connection cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DEFAULT_MAX_FRAME_LEN;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn relay_skips_the_origin() {
        let registry = RelayRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let (tx_c, mut rx_c) = mpsc::channel(4);
        let a = registry.register(peer(1), tx_a, CancellationToken::new()).await;
        registry.register(peer(2), tx_b, CancellationToken::new()).await;
        registry.register(peer(3), tx_c, CancellationToken::new()).await;

        let frame = Bytes::from_static(b"\x01{}");
        relay(frame.clone(), registry.outboxes_except(a).await);

        assert_eq!(rx_b.try_recv().expect("b receives"), frame);
        assert_eq!(rx_c.try_recv().expect("c receives"), frame);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_outbox_does_not_block_other_peers() {
        let registry = RelayRegistry::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(4);
        registry.register(peer(1), slow_tx, CancellationToken::new()).await;
        registry.register(peer(2), fast_tx, CancellationToken::new()).await;

        for _ in 0..3 {
            relay(Bytes::from_static(b"\x00<a/>"), registry.outboxes_except(0).await);
        }

        let mut delivered = 0;
        while fast_rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 3);
    }

    #[tokio::test]
    async fn close_session_signals_only_attached_connections() {
        let registry = RelayRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let attached = CancellationToken::new();
        let other = CancellationToken::new();
        let id = registry.register(peer(1), tx.clone(), attached.clone()).await;
        registry.register(peer(2), tx, other.clone()).await;

        assert!(registry.attach(id, SessionId(5)).await);
        assert_eq!(registry.attached_sessions().await, vec![SessionId(5)]);
        assert_eq!(registry.close_session(SessionId(5)).await, 1);
        assert!(attached.is_cancelled());
        assert!(!other.is_cancelled());
        assert_eq!(registry.close_session(SessionId(6)).await, 0);
    }

    #[tokio::test]
    async fn accepted_connection_is_registered_before_its_task_runs() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let _client = TcpStream::connect(addr).await.expect("connect");
        let accepted = listener.accept().await;

        let registry = Arc::new(RelayRegistry::new());
        handle_accept_result(accepted, &registry, DEFAULT_MAX_FRAME_LEN).await;
        assert_eq!(registry.len().await, 1);

        registry.close_all().await;
        tokio::time::timeout(std::time::Duration::from_secs(1), registry.wait_drained())
            .await
            .expect("connection should deregister after close");
    }

    #[tokio::test]
    async fn wait_drained_resolves_after_last_deregister() {
        let registry = Arc::new(RelayRegistry::new());
        let (tx, _rx) = mpsc::channel(1);
        let id = registry.register(peer(1), tx, CancellationToken::new()).await;

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_drained().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        assert!(registry.deregister(id).await);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("drain wait should finish")
            .expect("drain task");
        assert!(registry.is_empty().await);
    }
}
