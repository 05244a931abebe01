//! Client role (§4.7): issues RRQ/WRQ against a server and drives the
//! same session engine the server uses, with sender/receiver roles
//! mirrored — `get` is a receiver (server sends DATA), `put` is a sender
//! (server is the one that ACKs/OACKs before DATA flows).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::datasource::Transferable;
use crate::error::{Result, TftpError};
use crate::packet::{ErrorCode, Packet, TransferMode};
use crate::session::{Session, TransferStats};

/// Options the client offers in its opening request; absent fields are
/// left at the server's defaults (§3 "Options record").
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub blksize: Option<u16>,
    pub timeout: Option<u16>,
    pub request_tsize: bool,
    pub windowsize: Option<u16>,
}

impl RequestOptions {
    fn as_pairs(&self, tsize_value: Option<u64>) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(b) = self.blksize {
            out.push(("blksize".to_string(), b.to_string()));
        }
        if let Some(t) = self.timeout {
            out.push(("timeout".to_string(), t.to_string()));
        }
        if self.request_tsize {
            out.push(("tsize".to_string(), tsize_value.unwrap_or(0).to_string()));
        }
        if let Some(w) = self.windowsize {
            out.push(("windowsize".to_string(), w.to_string()));
        }
        out
    }
}

/// Plain local file standing in for the server's resolved [`DataSource`]
/// on the client side: no content-addressed lookup, no ownership
/// tagging, just a handle the transfer engine can seek/read/write.
pub struct LocalFile {
    file: File,
}

impl Transferable for LocalFile {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        loop {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if total == buf.len() {
                break;
            }
        }
        Ok(total)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }
}

/// Downloads `remote_filename` from `server` into `local_path`, creating
/// a fresh ephemeral socket for the transfer per §4.7.
pub async fn get(
    server: SocketAddr,
    remote_filename: &str,
    local_path: &Path,
    options: &RequestOptions,
    timeout: Duration,
    retransmit_cap: u32,
) -> Result<TransferStats> {
    let bind_addr: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = tokio::net::UdpSocket::from_std(crate::listener::bind_udp_with_buffers(bind_addr)?)?;
    let mut session = Session::new_unlocked(socket, server, timeout, retransmit_cap);

    let request = Packet::Rrq {
        filename: remote_filename.to_string(),
        mode: TransferMode::Octet,
        options: options.as_pairs(None),
    };

    // Opening handshake: resend the RRQ itself on timeout, since nothing
    // has been accepted onto the wire yet for the session engine to retry.
    let mut attempts: u32 = 0;
    session.send_packet(&request).await?;
    let first = loop {
        match session.recv_packet().await? {
            Some(pkt) => break pkt,
            None => {
                attempts += 1;
                if attempts > retransmit_cap {
                    return Err(TftpError::RetransmitExceeded);
                }
                session.send_packet(&request).await?;
            }
        }
    };

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(local_path)?;
    let mut local = LocalFile { file };

    let blksize = options.blksize.unwrap_or(crate::options::DEFAULT_BLKSIZE);
    let windowsize = options.windowsize.unwrap_or(crate::options::DEFAULT_WINDOWSIZE);

    match first {
        Packet::Oack { .. } => {
            // §session.rs's run_receive ACKs block 0 itself on seeing an
            // OACK, then continues waiting for DATA — feed it back in by
            // re-delivering through the same receive loop is unnecessary:
            // just let run_receive pick up from here, it handles OACK.
            run_receive_from(&mut session, &mut local, blksize, windowsize, Some(first)).await
        }
        Packet::Data { .. } => run_receive_from(&mut session, &mut local, blksize, windowsize, Some(first)).await,
        Packet::Error { code, message } => Err(error_for(code, message)),
        other => Err(TftpError::MalformedPacket(format!(
            "unexpected reply to RRQ: {other:?}"
        ))),
    }
}

/// Uploads `local_path` to `remote_filename` on `server`.
pub async fn put(
    server: SocketAddr,
    local_path: &Path,
    remote_filename: &str,
    options: &RequestOptions,
    timeout: Duration,
    retransmit_cap: u32,
) -> Result<TransferStats> {
    let bind_addr: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = tokio::net::UdpSocket::from_std(crate::listener::bind_udp_with_buffers(bind_addr)?)?;
    let mut session = Session::new_unlocked(socket, server, timeout, retransmit_cap);

    let file = File::open(local_path)?;
    let tsize = file.metadata().ok().map(|m| m.len());
    let mut local = LocalFile { file };

    let request = Packet::Wrq {
        filename: remote_filename.to_string(),
        mode: TransferMode::Octet,
        options: options.as_pairs(tsize),
    };

    let mut attempts: u32 = 0;
    session.send_packet(&request).await?;
    loop {
        match session.recv_packet().await? {
            Some(Packet::Ack { block: 0 }) => break,
            Some(Packet::Oack { .. }) => break,
            Some(Packet::Error { code, message }) => return Err(error_for(code, message)),
            Some(_) => continue,
            None => {
                attempts += 1;
                if attempts > retransmit_cap {
                    return Err(TftpError::RetransmitExceeded);
                }
                session.send_packet(&request).await?;
            }
        }
    }

    let blksize = options.blksize.unwrap_or(crate::options::DEFAULT_BLKSIZE);
    let windowsize = options.windowsize.unwrap_or(crate::options::DEFAULT_WINDOWSIZE);
    session.run_send(&mut local, blksize, windowsize, None).await
}

/// Drains `primed` (the first reply to the RRQ, already received) through
/// the ordinary receive loop before handing control to `run_receive`.
async fn run_receive_from(
    session: &mut Session,
    data: &mut LocalFile,
    blksize: u16,
    windowsize: u16,
    primed: Option<Packet>,
) -> Result<TransferStats> {
    match primed {
        Some(Packet::Oack { .. }) => {
            session.send_packet(&Packet::Ack { block: 0 }).await?;
            session.run_receive(data, blksize, windowsize, None).await
        }
        Some(Packet::Data { block, payload }) => {
            if block != 1 {
                return Err(TftpError::OutOfWindow);
            }
            let is_short = payload.len() < blksize as usize;
            data.write(0, &payload)?;
            session.send_packet(&Packet::Ack { block: 1 }).await?;
            if is_short {
                return Ok(TransferStats {
                    bytes: payload.len() as u64,
                    blocks: 1,
                });
            }
            // Carry the already-consumed block/byte count into the shared
            // loop rather than restarting it at `last_acked = 0`, which
            // would make the next wire block (2) look like a forward gap
            // past a single-block window and abort with OutOfWindow.
            session
                .run_receive_resuming(data, blksize, windowsize, None, 1, payload.len() as u64)
                .await
        }
        _ => unreachable!("caller only primes with Oack or Data"),
    }
}

fn error_for(code: ErrorCode, message: String) -> TftpError {
    match code {
        ErrorCode::FileNotFound => TftpError::NotFound,
        ErrorCode::FileAlreadyExists => TftpError::AlreadyExists,
        ErrorCode::AccessViolation => TftpError::AccessViolation(message),
        _ => TftpError::Tftp(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::UdpSocket;

    async fn fake_server_serving(payload: &'static [u8]) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let _ = Packet::decode(&buf[..n]).unwrap();
            socket
                .send_to(
                    &Packet::Data {
                        block: 1,
                        payload: Bytes::from_static(payload),
                    }
                    .encode(),
                    peer,
                )
                .await
                .unwrap();
            let (_n, _peer) = socket.recv_from(&mut buf).await.unwrap();
        });
        addr
    }

    /// Two-block fake server: block 1 is a full `blksize` payload (so the
    /// client's one-block short-circuit in `run_receive_from` does not
    /// apply), block 2 is the short terminating block.
    async fn fake_server_serving_two_blocks(first: Vec<u8>, second: &'static [u8]) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let _ = Packet::decode(&buf[..n]).unwrap();
            socket
                .send_to(
                    &Packet::Data {
                        block: 1,
                        payload: Bytes::from(first),
                    }
                    .encode(),
                    peer,
                )
                .await
                .unwrap();
            let (n, _peer) = socket.recv_from(&mut buf).await.unwrap();
            let _ = Packet::decode(&buf[..n]).unwrap();
            socket
                .send_to(
                    &Packet::Data {
                        block: 2,
                        payload: Bytes::from_static(second),
                    }
                    .encode(),
                    peer,
                )
                .await
                .unwrap();
            let (_n, _peer) = socket.recv_from(&mut buf).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn get_writes_file_spanning_two_blocks() {
        let first = vec![b'a'; crate::options::DEFAULT_BLKSIZE as usize];
        let server = fake_server_serving_two_blocks(first.clone(), b"tail").await;
        let mut path = std::env::temp_dir();
        path.push(format!("tftpd_client_get_multi_{}", uuid::Uuid::new_v4()));

        let stats = get(
            server,
            "whatever",
            &path,
            &RequestOptions::default(),
            Duration::from_millis(500),
            3,
        )
        .await
        .unwrap();

        let mut expected = first;
        expected.extend_from_slice(b"tail");
        assert_eq!(stats.bytes, expected.len() as u64);
        assert_eq!(stats.blocks, 2);
        assert_eq!(std::fs::read(&path).unwrap(), expected);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn get_writes_single_block_file() {
        let server = fake_server_serving(b"hello").await;
        let mut path = std::env::temp_dir();
        path.push(format!("tftpd_client_get_{}", uuid::Uuid::new_v4()));

        let stats = get(
            server,
            "whatever",
            &path,
            &RequestOptions::default(),
            Duration::from_millis(500),
            3,
        )
        .await
        .unwrap();

        assert_eq!(stats.bytes, 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn request_options_only_emits_set_fields() {
        let opts = RequestOptions {
            blksize: Some(1024),
            ..Default::default()
        };
        let pairs = opts.as_pairs(None);
        assert_eq!(pairs, vec![("blksize".to_string(), "1024".to_string())]);
    }

    #[test]
    fn tsize_probe_defaults_to_zero_without_known_size() {
        let opts = RequestOptions {
            request_tsize: true,
            ..Default::default()
        };
        assert_eq!(opts.as_pairs(None), vec![("tsize".to_string(), "0".to_string())]);
    }
}
