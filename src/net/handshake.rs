//! Rendezvous handshake and acceptor plumbing
//!
//! The announcement exchange runs on the raw stream, before the peer is
//! handed to the connection layer: the initiator writes its
//! `ParticipantAnnouncement`, the responder answers with either
//! `KnownParticipants` (registry) or `ParticipantAnnouncementReply` (peer),
//! and only then do reader/writer tasks start.

use super::peer::PeerStream;
use super::uri::AcceptorUri;
use crate::error::{SilKitError, SilKitResult};
use crate::wire::message::{Frame, ParticipantAnnouncement, ProtocolVersion, PROTOCOL_VERSION};
use crate::wire::{read_frame, write_frame};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Upper bound for a whole announcement exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Both sides must agree on the major version; minors are additive.
pub fn version_compatible(remote: ProtocolVersion) -> bool {
    remote.major == PROTOCOL_VERSION.major
}

/// Deterministic local-IPC socket path for a registry URI, so participants
/// can find the domain socket knowing only the URI.
pub fn local_socket_path(registry_uri: &str) -> PathBuf {
    let mut hasher = SipHasher13::new_with_keys(0x6c6f_6361_6c2d_6970, 0x6373_6f63_6b65_7400);
    hasher.write(registry_uri.to_ascii_lowercase().as_bytes());
    std::env::temp_dir().join(format!("simbus-{:016x}.sock", hasher.finish()))
}

/// Connect to one acceptor URI with the given timeout.
pub async fn connect_uri(uri: &AcceptorUri, connect_timeout: Duration) -> SilKitResult<PeerStream> {
    match uri {
        AcceptorUri::Tcp { host, port } => {
            let addr = format!("{}:{}", host, port);
            let stream = timeout(connect_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| SilKitError::transport(format!("connect to {} timed out", addr)))?
                .map_err(|e| SilKitError::transport(format!("connect to {} failed: {}", addr, e)))?;
            stream.set_nodelay(true).ok();
            Ok(PeerStream::Tcp(stream))
        }
        #[cfg(unix)]
        AcceptorUri::Local { path } => {
            let stream = timeout(connect_timeout, UnixStream::connect(path))
                .await
                .map_err(|_| SilKitError::transport(format!("connect to {} timed out", path)))?
                .map_err(|e| SilKitError::transport(format!("connect to {} failed: {}", path, e)))?;
            Ok(PeerStream::Local(stream))
        }
        #[cfg(not(unix))]
        AcceptorUri::Local { path } => {
            Err(SilKitError::transport(format!("local ipc not supported on this platform: {}", path)))
        }
    }
}

/// Walk the advertised acceptor URIs in order; first success wins. Local-IPC
/// URIs are preferred by construction (they come first in advertised lists).
pub async fn connect_first_reachable(
    uris: &[String],
    connect_timeout: Duration,
) -> SilKitResult<PeerStream> {
    let mut attempts = Vec::new();
    for raw in uris {
        let uri = match AcceptorUri::parse(raw) {
            Ok(uri) => uri,
            Err(e) => {
                attempts.push(format!("{}: {}", raw, e));
                continue;
            }
        };
        match connect_uri(&uri, connect_timeout).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(uri = %raw, error = %e, "acceptor not reachable, trying next");
                attempts.push(format!("{}: {}", raw, e));
            }
        }
    }
    Err(SilKitError::transport(format!(
        "no advertised acceptor was reachable: [{}]",
        attempts.join("; ")
    )))
}

/// Send our announcement and read the responder's single reply frame.
pub async fn announce<S>(
    stream: &mut S,
    announcement: &ParticipantAnnouncement,
) -> SilKitResult<Frame>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &Frame::Announcement(announcement.clone()))
        .await
        .map_err(|e| SilKitError::transport(format!("announcement write failed: {}", e)))?;
    let reply = timeout(HANDSHAKE_TIMEOUT, read_frame(stream))
        .await
        .map_err(|_| SilKitError::transport("handshake reply timed out"))?
        .map_err(|e| SilKitError::transport(format!("handshake read failed: {}", e)))?
        .ok_or_else(|| SilKitError::transport("peer closed during handshake"))?;
    Ok(reply)
}

/// Read the initiator's announcement on an accepted stream.
pub async fn read_announcement<S>(stream: &mut S) -> SilKitResult<ParticipantAnnouncement>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = timeout(HANDSHAKE_TIMEOUT, read_frame(stream))
        .await
        .map_err(|_| SilKitError::transport("announcement timed out"))?
        .map_err(|e| SilKitError::Protocol(format!("malformed handshake frame: {}", e)))?
        .ok_or_else(|| SilKitError::transport("peer closed before announcing"))?;
    match frame {
        Frame::Announcement(a) => Ok(a),
        other => Err(SilKitError::Protocol(format!(
            "expected announcement, got {:?}",
            other.kind()
        ))),
    }
}

/// Listeners a participant or registry accepts peers on.
pub struct Acceptors {
    pub tcp: Option<TcpListener>,
    #[cfg(unix)]
    pub local: Option<(UnixListener, PathBuf)>,
    /// URIs other peers can be told to reach us at, local IPC first.
    pub acceptor_uris: Vec<String>,
}

impl Acceptors {
    /// Bind a TCP listener on `host:port` (port 0 resolves to an ephemeral
    /// one) and, when enabled, a Unix domain socket at `local_path`.
    pub async fn bind(
        host: &str,
        port: u16,
        enable_domain_sockets: bool,
        local_path: Option<PathBuf>,
    ) -> SilKitResult<Self> {
        let tcp = TcpListener::bind((host, port))
            .await
            .map_err(|e| SilKitError::transport(format!("cannot listen on {}:{}: {}", host, port, e)))?;
        let tcp_port = tcp
            .local_addr()
            .map_err(|e| SilKitError::transport(format!("cannot resolve listen address: {}", e)))?
            .port();

        let mut acceptor_uris = Vec::new();

        #[cfg(unix)]
        let local = if enable_domain_sockets {
            let path = local_path
                .unwrap_or_else(|| local_socket_path(&format!("silkit://{}:{}", host, tcp_port)));
            // A stale socket file from a dead process blocks the bind.
            if path.exists() {
                std::fs::remove_file(&path).ok();
            }
            match UnixListener::bind(&path) {
                Ok(listener) => {
                    acceptor_uris.push(format!("local://{}", path.display()));
                    Some((listener, path))
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "local ipc acceptor unavailable");
                    None
                }
            }
        } else {
            None
        };
        #[cfg(not(unix))]
        let _ = (enable_domain_sockets, local_path);

        acceptor_uris.push(format!("silkit://{}:{}", advertised_host(host), tcp_port));

        Ok(Self {
            tcp: Some(tcp),
            #[cfg(unix)]
            local,
            acceptor_uris,
        })
    }

    pub fn tcp_port(&self) -> Option<u16> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok()).map(|a| a.port())
    }
}

fn advertised_host(bind_host: &str) -> &str {
    // Binding on the wildcard address is common; advertise loopback and let
    // the registry rewrite it to the observed address for remote peers.
    if bind_host == "0.0.0.0" || bind_host == "::" {
        "127.0.0.1"
    } else {
        bind_host
    }
}

/// Run accept loops for every bound acceptor, invoking `on_stream` per
/// incoming connection. The handler is responsible for the handshake and for
/// spawning any long-running work.
pub fn spawn_accept_loops<F>(acceptors: Acceptors, on_stream: F)
where
    F: Fn(PeerStream) + Send + Sync + Clone + 'static,
{
    if let Some(tcp) = acceptors.tcp {
        let handler = on_stream.clone();
        tokio::spawn(async move {
            loop {
                match tcp.accept().await {
                    Ok((stream, _)) => {
                        stream.set_nodelay(true).ok();
                        handler(PeerStream::Tcp(stream));
                    }
                    Err(e) => {
                        debug!(error = %e, "tcp accept failed");
                    }
                }
            }
        });
    }
    #[cfg(unix)]
    if let Some((local, _path)) = acceptors.local {
        tokio::spawn(async move {
            loop {
                match local.accept().await {
                    Ok((stream, _)) => on_stream(PeerStream::Local(stream)),
                    Err(e) => {
                        debug!(error = %e, "local accept failed");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::participant_id_of;
    use crate::wire::message::{PeerInfo, RegistryMsgHeader};

    fn announcement(name: &str) -> ParticipantAnnouncement {
        ParticipantAnnouncement {
            header: RegistryMsgHeader::new(PROTOCOL_VERSION),
            peer_info: PeerInfo {
                participant_name: name.to_string(),
                participant_id: participant_id_of(name),
                acceptor_uris: vec![],
                capabilities: vec![],
            },
            simulation_name: "default".to_string(),
        }
    }

    #[test]
    fn local_socket_path_is_deterministic() {
        let a = local_socket_path("silkit://localhost:8500");
        let b = local_socket_path("silkit://LOCALHOST:8500");
        assert_eq!(a, b);
        assert_ne!(a, local_socket_path("silkit://localhost:8501"));
    }

    #[tokio::test]
    async fn announcement_exchange_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let ann = read_announcement(&mut stream).await.unwrap();
            assert_eq!(ann.peer_info.participant_name, "P1");
            ann
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut client, &Frame::Announcement(announcement("P1"))).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_first_reachable_skips_dead_uris() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let uris = vec![
            // A port nothing listens on; the reserved port 1 fails fast.
            "silkit://127.0.0.1:1".to_string(),
            format!("silkit://127.0.0.1:{}", port),
        ];
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let stream = connect_first_reachable(&uris, Duration::from_millis(2000)).await.unwrap();
        assert!(matches!(stream, PeerStream::Tcp(_)));
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn all_unreachable_is_a_transport_error() {
        let uris = vec!["silkit://127.0.0.1:1".to_string()];
        let err = connect_first_reachable(&uris, Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(err, SilKitError::Transport(_)));
    }
}
