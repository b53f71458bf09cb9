//! Per-peer transport: one reader task, one writer task
//!
//! A peer is an ordered reliable byte stream (TCP or local IPC). The reader
//! reassembles length-prefixed frames and forwards them to the connection's
//! dispatch context; the writer drains an outbound queue. FIFO within the
//! stream is the only ordering guarantee the middleware assumes.

use crate::wire::{read_frame, Frame};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Outbound queue depth at which a slow peer is logged.
const QUEUE_HIGH_WATER_BYTES: usize = 4 * 1024 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected byte stream, TCP or local IPC.
#[derive(Debug)]
pub enum PeerStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Local(UnixStream),
}

impl PeerStream {
    /// Remote host as observed by us, for TCP streams.
    pub fn remote_host(&self) -> Option<String> {
        match self {
            PeerStream::Tcp(s) => s.peer_addr().ok().map(|a| a.ip().to_string()),
            #[cfg(unix)]
            PeerStream::Local(_) => None,
        }
    }

    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            PeerStream::Tcp(s) => {
                let (r, w) = s.into_split();
                (Box::new(r), Box::new(w))
            }
            #[cfg(unix)]
            PeerStream::Local(s) => {
                let (r, w) = s.into_split();
                (Box::new(r), Box::new(w))
            }
        }
    }
}

/// Commands accepted by a peer's writer task.
pub enum PeerCmd {
    /// Pre-serialized frame, including the length prefix.
    Frame(Vec<u8>),
    /// Fires once every frame queued before it has been written out.
    Barrier(oneshot::Sender<()>),
    Close,
}

/// Work items for the connection's dispatch context.
pub enum DispatchCmd {
    Inbound { peer: String, frame: Frame },
    PeerClosed { peer: String },
    Deferred(Box<dyn FnOnce() + Send>),
    Shutdown,
}

/// Sender half of a peer's outbound queue plus its accounting.
#[derive(Clone)]
pub struct PeerSender {
    tx: mpsc::UnboundedSender<PeerCmd>,
    queued_bytes: Arc<AtomicUsize>,
}

impl PeerSender {
    pub fn send_frame(&self, bytes: Vec<u8>) -> bool {
        let len = bytes.len();
        let queued = self.queued_bytes.fetch_add(len, Ordering::Relaxed) + len;
        if queued > QUEUE_HIGH_WATER_BYTES {
            warn!("peer outbound queue at {} bytes", queued);
        }
        self.tx.send(PeerCmd::Frame(bytes)).is_ok()
    }

    pub fn barrier(&self) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(PeerCmd::Barrier(tx)).is_ok() {
            Some(rx)
        } else {
            None
        }
    }

    pub fn close(&self) {
        let _ = self.tx.send(PeerCmd::Close);
    }
}

/// Spawn reader and writer tasks for a handshaken stream.
///
/// `peer_key` identifies the peer in dispatch commands. `aggregate` is
/// consulted per write burst, so flipping it later (aggregation Auto) takes
/// effect immediately.
pub fn spawn_peer_tasks(
    stream: PeerStream,
    peer_key: String,
    dispatch_tx: mpsc::UnboundedSender<DispatchCmd>,
    aggregate: Arc<AtomicBool>,
) -> PeerSender {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let queued_bytes = Arc::new(AtomicUsize::new(0));

    tokio::spawn(reader_loop(reader, peer_key.clone(), dispatch_tx.clone()));
    tokio::spawn(writer_loop(writer, rx, peer_key, dispatch_tx, aggregate, queued_bytes.clone()));

    PeerSender { tx, queued_bytes }
}

async fn reader_loop(
    mut reader: BoxedReader,
    peer_key: String,
    dispatch_tx: mpsc::UnboundedSender<DispatchCmd>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                trace!(peer = %peer_key, kind = ?frame.kind(), "frame received");
                if dispatch_tx.send(DispatchCmd::Inbound { peer: peer_key.clone(), frame }).is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!(peer = %peer_key, "peer closed the stream");
                break;
            }
            Err(e) => {
                debug!(peer = %peer_key, error = %e, "peer read failed");
                break;
            }
        }
    }
    let _ = dispatch_tx.send(DispatchCmd::PeerClosed { peer: peer_key });
}

async fn writer_loop(
    mut writer: BoxedWriter,
    mut rx: mpsc::UnboundedReceiver<PeerCmd>,
    peer_key: String,
    dispatch_tx: mpsc::UnboundedSender<DispatchCmd>,
    aggregate: Arc<AtomicBool>,
    queued_bytes: Arc<AtomicUsize>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            PeerCmd::Frame(bytes) => {
                let mut buf = bytes;
                let mut deferred: Vec<PeerCmd> = Vec::new();
                if aggregate.load(Ordering::Relaxed) {
                    // Coalesce adjacent frames into a single send until the
                    // queue drains or a flush boundary shows up.
                    while let Ok(next) = rx.try_recv() {
                        match next {
                            PeerCmd::Frame(more) => buf.extend_from_slice(&more),
                            other => {
                                deferred.push(other);
                                break;
                            }
                        }
                    }
                }
                let written = buf.len();
                if let Err(e) = writer.write_all(&buf).await {
                    debug!(peer = %peer_key, error = %e, "peer write failed");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    debug!(peer = %peer_key, error = %e, "peer flush failed");
                    break;
                }
                queued_bytes.fetch_sub(written, Ordering::Relaxed);
                let mut stop = false;
                for cmd in deferred {
                    match cmd {
                        PeerCmd::Barrier(tx) => {
                            let _ = tx.send(());
                        }
                        PeerCmd::Close => stop = true,
                        PeerCmd::Frame(_) => unreachable!("frames are coalesced above"),
                    }
                }
                if stop {
                    return;
                }
            }
            PeerCmd::Barrier(tx) => {
                let _ = tx.send(());
            }
            PeerCmd::Close => return,
        }
    }
    let _ = dispatch_tx.send(DispatchCmd::PeerClosed { peer: peer_key });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::EndpointAddress;
    use crate::wire::message::{NextSimTask, RoutedFrame, RoutedMessage};
    use crate::wire::to_wire;
    use tokio::net::TcpListener;

    fn sample_frame() -> Frame {
        Frame::Routed(RoutedFrame {
            from: EndpointAddress { participant_id: 1, service_id: 1 },
            link: "default".into(),
            msg: RoutedMessage::NextSimTask(NextSimTask { time_point_ns: 0, duration_ns: 1 }),
        })
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn frames_flow_between_peer_tasks() {
        let (a, b) = tcp_pair().await;
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let off = Arc::new(AtomicBool::new(false));

        let sender_a = spawn_peer_tasks(PeerStream::Tcp(a), "B".into(), tx_a, off.clone());
        let _sender_b = spawn_peer_tasks(PeerStream::Tcp(b), "A".into(), tx_b, off);

        assert!(sender_a.send_frame(to_wire(&sample_frame())));

        match rx_b.recv().await.unwrap() {
            DispatchCmd::Inbound { peer, frame } => {
                assert_eq!(peer, "A");
                assert_eq!(frame, sample_frame());
            }
            _ => panic!("expected inbound frame"),
        }
    }

    #[tokio::test]
    async fn barrier_fires_after_queued_frames() {
        let (a, b) = tcp_pair().await;
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let on = Arc::new(AtomicBool::new(true));

        let sender_a = spawn_peer_tasks(PeerStream::Tcp(a), "B".into(), tx_a, on.clone());
        let _sender_b = spawn_peer_tasks(PeerStream::Tcp(b), "A".into(), tx_b, on);

        for _ in 0..10 {
            sender_a.send_frame(to_wire(&sample_frame()));
        }
        let barrier = sender_a.barrier().unwrap();
        barrier.await.unwrap();

        let mut seen = 0;
        while seen < 10 {
            match rx_b.recv().await.unwrap() {
                DispatchCmd::Inbound { .. } => seen += 1,
                DispatchCmd::PeerClosed { .. } => panic!("peer closed early"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn peer_close_reaches_dispatch() {
        let (a, b) = tcp_pair().await;
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let off = Arc::new(AtomicBool::new(false));

        let _sender_a = spawn_peer_tasks(PeerStream::Tcp(a), "B".into(), tx_a, off.clone());
        let sender_b = spawn_peer_tasks(PeerStream::Tcp(b), "A".into(), tx_b, off);
        sender_b.close();

        loop {
            if let DispatchCmd::PeerClosed { peer } = rx_a.recv().await.unwrap() {
                assert_eq!(peer, "B");
                break;
            }
        }
    }
}
