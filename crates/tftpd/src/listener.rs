//! Accept loop (§4.6): binds one UDP socket per configured listen address,
//! receives opening RRQ/WRQ datagrams, and spawns a session per request on
//! a fresh ephemeral port so concurrent transfers never share a socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::address;
use crate::audit::AuditLogger;
use crate::datasource::{self, DataSource};
use crate::error::{Result, TftpError};
use crate::options::{RequestType, TftpOptions};
use crate::packet::{MAX_PACKET_SIZE, Packet};
use crate::session::{Direction, Session};
use crate::settings::SharedSettings;

/// RFC 1350's shortest legal RRQ/WRQ: 2-byte opcode, a one-character
/// filename, its terminator, the shortest mode string ("mail" is
/// rejected, "netascii"/"octet" are both longer, so this is a
/// conservative floor rather than an exact minimum) and its terminator.
const MIN_REQUEST_LEN: usize = 9;

/// Binds every configured listen address and runs each accept loop until
/// `shutdown` fires. Returns once all listeners have stopped.
pub async fn serve(
    settings: SharedSettings,
    listen_addrs: &[String],
    shutdown: CancellationToken,
) -> Result<()> {
    let mut listeners = Vec::new();
    for addr in listen_addrs {
        listeners.push(Listener::bind(addr, settings.clone(), shutdown.clone()).await?);
    }

    AuditLogger::server_started(
        &listeners
            .iter()
            .map(|l| address::render_endpoint(&l.addr))
            .collect::<Vec<_>>(),
        &settings.root_dir.display().to_string(),
    );

    let mut tasks = Vec::new();
    for listener in listeners {
        tasks.push(tokio::spawn(listener.run()));
    }
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

pub struct Listener {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    settings: SharedSettings,
    shutdown: CancellationToken,
}

/// Receive-buffer size applied to the well-known listen socket and every
/// spawned session socket: firmware images sent with a wide RFC 7440
/// window can have several blksize-sized packets in flight before the
/// kernel buffer drains, so the stock default (often 208 KiB) is raised.
const SOCKET_RECV_BUFFER: usize = 1 << 20;

/// Binds `addr` with an enlarged receive buffer via `socket2`, then hands
/// the socket to tokio. A failure to raise the buffer size is logged and
/// not fatal — the socket still works at the OS default.
pub(crate) fn bind_udp_with_buffers(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_RECV_BUFFER) {
        tracing::debug!(addr = %addr, error = %e, "could not raise UDP receive buffer size");
    }
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

impl Listener {
    pub async fn bind(
        addr_str: &str,
        settings: SharedSettings,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let addr = address::parse_endpoint(addr_str)?;
        let bind_result = bind_udp_with_buffers(addr).and_then(UdpSocket::from_std);
        match bind_result {
            Ok(socket) => {
                AuditLogger::listener_bound(&address::render_endpoint(&addr));
                Ok(Self {
                    socket: Arc::new(socket),
                    addr,
                    settings,
                    shutdown,
                })
            }
            Err(e) => {
                AuditLogger::listener_bind_failed(&address::render_endpoint(&addr), &e.to_string());
                Err(e.into())
            }
        }
    }

    /// Runs the accept loop: one spawned session task per opening
    /// RRQ/WRQ, with finished tasks reaped opportunistically on the next
    /// datagram rather than via a dedicated background sweep.
    pub async fn run(self) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut sessions: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => {
                    sessions.retain(|h| !h.is_finished());
                    match received {
                        Ok((n, peer)) => self.accept(&buf[..n], peer, &mut sessions),
                        Err(e) => {
                            tracing::warn!(listener = %self.addr, error = %e, "listener recv_from failed");
                        }
                    }
                }
            }
        }

        for handle in sessions {
            handle.abort();
        }
    }

    fn accept(&self, datagram: &[u8], peer: SocketAddr, sessions: &mut Vec<JoinHandle<()>>) {
        if datagram.len() < MIN_REQUEST_LEN {
            tracing::debug!(peer = %peer, len = datagram.len(), "datagram too short to be a request, ignoring");
            return;
        }

        let request = match Packet::decode(datagram) {
            Ok(p @ (Packet::Rrq { .. } | Packet::Wrq { .. })) => p,
            Ok(_) => {
                tracing::debug!(peer = %peer, "opening datagram was not RRQ/WRQ, ignoring");
                return;
            }
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "malformed opening datagram, ignoring");
                return;
            }
        };

        let settings = self.settings.clone();
        sessions.push(tokio::spawn(async move {
            if let Err(e) = handle_request(request, peer, settings).await {
                tracing::warn!(peer = %peer, error = %e, "session ended with error");
            }
        }));
    }
}

async fn handle_request(request: Packet, peer: SocketAddr, settings: SharedSettings) -> Result<()> {
    let (request_type, filename, mode, raw_options) = match request {
        Packet::Rrq {
            filename,
            mode,
            options,
        } => (RequestType::Read, filename, mode, options),
        Packet::Wrq {
            filename,
            mode,
            options,
        } => (RequestType::Write, filename, mode, options),
        _ => unreachable!("accept() only forwards RRQ/WRQ"),
    };

    let bind_addr: SocketAddr = if peer.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::from_std(bind_udp_with_buffers(bind_addr)?)?;
    let mut session = Session::new_locked(
        socket,
        peer,
        Duration::from_secs(settings.default_timeout_secs),
        settings.retransmit_cap,
    );

    let had_options = !raw_options.is_empty();
    let mut options = TftpOptions::new(request_type, filename.clone(), mode);
    options.negotiate(&raw_options);
    let accepted = options.accepted_options();
    let oack = if had_options && !accepted.is_empty() {
        Some(accepted)
    } else {
        None
    };
    let options_json = serde_json::to_value(
        accepted
            .iter()
            .cloned()
            .collect::<std::collections::HashMap<_, _>>(),
    )
    .unwrap_or(serde_json::Value::Null);

    let start = Instant::now();

    let data = match request_type {
        RequestType::Read => {
            AuditLogger::read_request(peer, &filename, options.mode.as_str(), options_json);
            match datasource::open_read(&settings, &filename, peer) {
                Ok(d) => d,
                Err(e) => {
                    AuditLogger::read_denied(peer, &filename, &e.to_string());
                    session.send_error_best_effort(&e).await;
                    return Err(e);
                }
            }
        }
        RequestType::Write => {
            if !settings.write_allowed(&filename) {
                let e = TftpError::AccessViolation(
                    "filename not permitted by write policy".to_string(),
                );
                AuditLogger::write_denied(peer, &filename, &e.to_string());
                session.send_error_best_effort(&e).await;
                return Err(e);
            }
            AuditLogger::write_request(peer, &filename, options.mode.as_str(), options_json);
            match datasource::open_write(&settings, &filename) {
                Ok(d) => d,
                Err(e) => {
                    AuditLogger::write_denied(peer, &filename, &e.to_string());
                    session.send_error_best_effort(&e).await;
                    return Err(e);
                }
            }
        }
    };

    let direction = match request_type {
        RequestType::Read => Direction::Send,
        RequestType::Write => Direction::Receive,
    };

    run_transfer(
        &mut session,
        direction,
        data,
        &options,
        oack,
        peer,
        &filename,
        start,
        settings.retransmit_cap,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_transfer(
    session: &mut Session,
    direction: Direction,
    mut data: DataSource,
    options: &TftpOptions,
    oack: Option<Vec<(String, String)>>,
    peer: SocketAddr,
    filename: &str,
    start: Instant,
    retransmit_cap: u32,
) -> Result<()> {
    AuditLogger::transfer_started(
        peer,
        filename,
        options.mode.as_str(),
        options.blksize.value as usize,
        options.windowsize.value,
    );

    let result = match direction {
        Direction::Send => {
            session
                .run_send(&mut data, options.blksize.value, options.windowsize.value, oack)
                .await
        }
        Direction::Receive => {
            session
                .run_receive(&mut data, options.blksize.value, options.windowsize.value, oack)
                .await
        }
    };

    match result {
        Ok(stats) => {
            if let Err(e) = data.close() {
                AuditLogger::transfer_failed(peer, filename, &e.to_string(), stats.blocks);
                session.send_error_best_effort(&e).await;
                return Err(e);
            }
            AuditLogger::transfer_completed(
                peer,
                filename,
                stats.bytes,
                stats.blocks,
                start.elapsed().as_millis() as u64,
            );
            Ok(())
        }
        Err(e) => {
            if matches!(e, TftpError::RetransmitExceeded) {
                AuditLogger::retransmit_exceeded(peer, filename, retransmit_cap);
            }
            data.cancel();
            session.send_error_best_effort(&e).await;
            AuditLogger::transfer_failed(peer, filename, &e.to_string(), 0);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, TftpConfig, WriteConfig};
    use crate::settings::Settings;
    use std::fs;

    fn temp_settings(name: &str) -> SharedSettings {
        let mut dir = std::env::temp_dir();
        dir.push(format!("tftpd_listener_test_{}_{}", name, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let config = TftpConfig {
            server: ServerConfig {
                listen: vec!["127.0.0.1:0".to_string()],
                root_dir: dir,
                search_dirs: Vec::new(),
                retransmit_cap: 3,
                default_timeout_secs: 1,
            },
            write: WriteConfig::default(),
            logging: Default::default(),
        };
        Settings::from_config(&config)
    }

    async fn spawn_listener(settings: SharedSettings) -> (SocketAddr, CancellationToken) {
        let shutdown = CancellationToken::new();
        let listener = Listener::bind("127.0.0.1:0", settings, shutdown.clone())
            .await
            .unwrap();
        let addr = listener.addr;
        tokio::spawn(listener.run());
        (addr, shutdown)
    }

    #[tokio::test]
    async fn serves_a_read_request_end_to_end() {
        let settings = temp_settings("rrq");
        fs::write(settings.root_dir.join("f.bin"), b"hello world").unwrap();
        let (server_addr, shutdown) = spawn_listener(settings).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(
                &Packet::Rrq {
                    filename: "f.bin".to_string(),
                    mode: crate::packet::TransferMode::Octet,
                    options: vec![],
                }
                .encode(),
                server_addr,
            )
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let (n, session_addr) = client.recv_from(&mut buf).await.unwrap();
        match Packet::decode(&buf[..n]).unwrap() {
            Packet::Data { block, payload } => {
                assert_eq!(block, 1);
                assert_eq!(&payload[..], b"hello world");
            }
            other => panic!("expected DATA, got {other:?}"),
        }

        client
            .send_to(&Packet::Ack { block: 1 }.encode(), session_addr)
            .await
            .unwrap();

        shutdown.cancel();
    }

    #[tokio::test]
    async fn serves_a_write_request_end_to_end() {
        let settings = temp_settings("wrq");
        let root = settings.root_dir.clone();
        let (server_addr, shutdown) = spawn_listener(settings).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(
                &Packet::Wrq {
                    filename: "up.bin".to_string(),
                    mode: crate::packet::TransferMode::Octet,
                    options: vec![],
                }
                .encode(),
                server_addr,
            )
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let (n, session_addr) = client.recv_from(&mut buf).await.unwrap();
        match Packet::decode(&buf[..n]).unwrap() {
            Packet::Ack { block } => assert_eq!(block, 0),
            other => panic!("expected ACK 0, got {other:?}"),
        }

        client
            .send_to(
                &Packet::Data {
                    block: 1,
                    payload: bytes::Bytes::from_static(b"uploaded"),
                }
                .encode(),
                session_addr,
            )
            .await
            .unwrap();

        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        match Packet::decode(&buf[..n]).unwrap() {
            Packet::Ack { block } => assert_eq!(block, 1),
            other => panic!("expected ACK 1, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fs::read(root.join("up.bin")).unwrap(), b"uploaded");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn denies_write_outside_allowed_patterns() {
        let settings_arc = {
            let mut dir = std::env::temp_dir();
            dir.push(format!("tftpd_listener_test_deny_{}", uuid::Uuid::new_v4()));
            fs::create_dir_all(&dir).unwrap();
            let config = TftpConfig {
                server: ServerConfig {
                    listen: vec!["127.0.0.1:0".to_string()],
                    root_dir: dir,
                    search_dirs: Vec::new(),
                    retransmit_cap: 3,
                    default_timeout_secs: 1,
                },
                write: WriteConfig {
                    allowed_patterns: vec!["*.bin".to_string()],
                    ..Default::default()
                },
                logging: Default::default(),
            };
            Settings::from_config(&config)
        };
        let (server_addr, shutdown) = spawn_listener(settings_arc).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(
                &Packet::Wrq {
                    filename: "script.sh".to_string(),
                    mode: crate::packet::TransferMode::Octet,
                    options: vec![],
                }
                .encode(),
                server_addr,
            )
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        match Packet::decode(&buf[..n]).unwrap() {
            Packet::Error { code, .. } => {
                assert_eq!(code, crate::packet::ErrorCode::AccessViolation)
            }
            other => panic!("expected ERROR, got {other:?}"),
        }

        shutdown.cancel();
    }
}
