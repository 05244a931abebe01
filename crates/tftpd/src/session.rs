//! Session engine (§4.5): drives one request end-to-end over a private
//! UDP socket. Shared between the server (which received RRQ/WRQ off the
//! wire) and the client (which issues its own RRQ/WRQ) — §4.7 reuses
//! this engine with roles mirrored.
//!
//! `Direction::Send` covers a server answering RRQ and a client doing
//! `put`; `Direction::Receive` covers a server answering WRQ and a
//! client doing `get`. This resolves an ambiguity in how the FSM's R/W
//! edges map onto who-sends-what: the behavior implemented here is the
//! one consistent with RFC 1350 and with this spec's own worked
//! end-to-end scenarios (server transmits for RRQ, receives for WRQ).

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::datasource::Transferable;
use crate::error::{Result, TftpError};
use crate::packet::{MAX_PACKET_SIZE, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransferStats {
    pub bytes: u64,
    pub blocks: u64,
}

pub struct Session {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    send_target: SocketAddr,
    timeout: Duration,
    retransmit_cap: u32,
}

impl Session {
    /// Server-side constructor: the peer is already known from the
    /// opening RRQ/WRQ datagram the listener observed, so the TID is
    /// locked immediately.
    pub fn new_locked(
        socket: UdpSocket,
        peer: SocketAddr,
        timeout: Duration,
        retransmit_cap: u32,
    ) -> Self {
        Self {
            socket,
            peer: Some(peer),
            send_target: peer,
            timeout,
            retransmit_cap,
        }
    }

    /// Client-side constructor: we know where to send the opening
    /// request, but the reply may come from a different ephemeral port
    /// (the TID change TFTP mandates); the peer locks on first receipt.
    pub fn new_unlocked(
        socket: UdpSocket,
        initial_target: SocketAddr,
        timeout: Duration,
        retransmit_cap: u32,
    ) -> Self {
        Self {
            socket,
            peer: None,
            send_target: initial_target,
            timeout,
            retransmit_cap,
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub async fn send_packet(&self, pkt: &Packet) -> Result<()> {
        let buf = pkt.encode();
        self.socket.send_to(&buf, self.send_target).await?;
        Ok(())
    }

    /// Waits up to `self.timeout` for one datagram from the locked peer.
    /// Before the peer is locked, the first datagram from anywhere locks
    /// it (§4.5 "First-packet source capture"); after that, datagrams
    /// from any other endpoint are logged and dropped without consuming
    /// the deadline (they do not reset the timeout either — this matches
    /// "packets from the wrong endpoint mid-session" being swallowed,
    /// not treated as activity). Returns `Ok(None)` on timeout.
    pub async fn recv_packet(&mut self) -> Result<Option<Packet>> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let received = match tokio::time::timeout(remaining, self.socket.recv_from(&mut buf)).await
            {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => return Ok(None),
            };
            let (n, src) = received;
            match self.peer {
                None => {
                    self.peer = Some(src);
                    self.send_target = src;
                }
                Some(locked) if locked == src => {}
                Some(locked) => {
                    crate::audit::AuditLogger::intrusion_attempt(locked, src);
                    continue;
                }
            }
            return Ok(Some(Packet::decode(&buf[..n])?));
        }
    }

    /// Drives the sending side of a transfer (§4.5 data_tx/ack_rx).
    /// `oack_options`, when present, means this session must send an
    /// OACK before any DATA and wait for the peer's ACK of block 0
    /// first (server answering RRQ with accepted options); when absent,
    /// the first DATA window is sent immediately (no-options RRQ, or a
    /// client `put` that already consumed its own OACK-equivalent
    /// handshake before calling in).
    pub async fn run_send(
        &mut self,
        data: &mut dyn Transferable,
        blksize: u16,
        windowsize: u16,
        oack_options: Option<Vec<(String, String)>>,
    ) -> Result<TransferStats> {
        let mut block: u64 = 0;
        let mut offset: u64 = 0;
        let mut bytes_sent: u64 = 0;
        let mut retransmits: u32 = 0;
        let mut oack_pending = oack_options.is_some();

        if let Some(options) = &oack_options {
            self.send_packet(&Packet::Oack {
                options: options.clone(),
            })
            .await?;
        }

        loop {
            let window_start = block;
            let mut window: Vec<(u64, Bytes)> = Vec::new();
            let mut hit_last = false;

            if !oack_pending {
                for i in 1..=windowsize as u64 {
                    let this_block = window_start + i;
                    let mut buf = vec![0u8; blksize as usize];
                    let n = data.read(offset, &mut buf)?;
                    buf.truncate(n);
                    offset += n as u64;
                    bytes_sent += n as u64;
                    let is_short = n < blksize as usize;
                    window.push((this_block, Bytes::from(buf)));
                    if is_short {
                        hit_last = true;
                        break;
                    }
                }
                for (b, payload) in &window {
                    self.send_packet(&Packet::Data {
                        block: (*b & 0xFFFF) as u16,
                        payload: payload.clone(),
                    })
                    .await?;
                }
            }

            let highest = window.last().map(|(b, _)| *b).unwrap_or(window_start);

            loop {
                match self.recv_packet().await? {
                    None => {
                        retransmits += 1;
                        if retransmits > self.retransmit_cap {
                            return Err(TftpError::RetransmitExceeded);
                        }
                        if oack_pending {
                            self.send_packet(&Packet::Oack {
                                options: oack_options.clone().unwrap_or_default(),
                            })
                            .await?;
                        } else {
                            for (b, payload) in &window {
                                self.send_packet(&Packet::Data {
                                    block: (*b & 0xFFFF) as u16,
                                    payload: payload.clone(),
                                })
                                .await?;
                            }
                        }
                        continue;
                    }
                    Some(Packet::Oack { .. }) if oack_pending => continue,
                    Some(Packet::Ack { block: wire }) => {
                        if oack_pending {
                            let full = reconstruct_block(0, wire);
                            if full != 0 {
                                return Err(TftpError::OutOfWindow);
                            }
                            oack_pending = false;
                            retransmits = 0;
                            break;
                        }
                        let full = reconstruct_block(highest, wire);
                        if full < window_start || full > highest {
                            return Err(TftpError::OutOfWindow);
                        }
                        retransmits = 0;
                        block = full;
                        if full == highest {
                            break;
                        }
                    }
                    Some(Packet::Error { message, .. }) => {
                        return Err(TftpError::Tftp(format!(
                            "peer aborted transfer: {message}"
                        )));
                    }
                    Some(_) => continue,
                }
            }

            if hit_last {
                break;
            }
        }

        Ok(TransferStats {
            bytes: bytes_sent,
            blocks: block,
        })
    }

    /// Drives the receiving side of a transfer (§4.5 data_rx/ack_tx).
    /// `oack_options` mirrors `run_send`'s parameter: present when this
    /// session must announce accepted options before the peer starts
    /// sending DATA (server answering WRQ with accepted options).
    pub async fn run_receive(
        &mut self,
        data: &mut dyn Transferable,
        blksize: u16,
        windowsize: u16,
        oack_options: Option<Vec<(String, String)>>,
    ) -> Result<TransferStats> {
        self.run_receive_resuming(data, blksize, windowsize, oack_options, 0, 0)
            .await
    }

    /// Like [`run_receive`], but resumes from a block/byte count the
    /// caller already consumed itself (§4.7: a client `get` that accepts
    /// the server's bare first DATA block, with no OACK, before handing
    /// off to the shared receive loop). Carrying that state in instead of
    /// restarting `last_acked` at 0 keeps the loop's sequential-block
    /// check consistent with what has actually arrived on the wire.
    pub async fn run_receive_resuming(
        &mut self,
        data: &mut dyn Transferable,
        blksize: u16,
        windowsize: u16,
        oack_options: Option<Vec<(String, String)>>,
        initial_last_acked: u64,
        initial_bytes_received: u64,
    ) -> Result<TransferStats> {
        let mut last_acked: u64 = initial_last_acked;
        let mut since_ack: u16 = 0;
        let mut offset: u64 = initial_bytes_received;
        let mut bytes_received: u64 = initial_bytes_received;
        let mut retransmits: u32 = 0;

        if let Some(options) = &oack_options {
            self.send_packet(&Packet::Oack {
                options: options.clone(),
            })
            .await?;
        }

        loop {
            match self.recv_packet().await? {
                None => {
                    retransmits += 1;
                    if retransmits > self.retransmit_cap {
                        return Err(TftpError::RetransmitExceeded);
                    }
                    if last_acked == 0 && oack_options.is_some() {
                        self.send_packet(&Packet::Oack {
                            options: oack_options.clone().unwrap_or_default(),
                        })
                        .await?;
                    } else {
                        self.send_packet(&Packet::Ack {
                            block: (last_acked & 0xFFFF) as u16,
                        })
                        .await?;
                    }
                    continue;
                }
                Some(Packet::Oack { .. }) => {
                    // Only a client receiving (RRQ "get") ever sees this: the
                    // server never gets an OACK back from a WRQ peer. RFC 2347
                    // requires the client to ACK block 0 before DATA flows.
                    self.send_packet(&Packet::Ack {
                        block: (last_acked & 0xFFFF) as u16,
                    })
                    .await?;
                    continue;
                }
                Some(Packet::Data { block: wire, payload }) => {
                    let full = reconstruct_block(last_acked + 1, wire);
                    if full <= last_acked {
                        // Duplicate of an already-acked block: re-ack the
                        // current position and take no further action.
                        self.send_packet(&Packet::Ack {
                            block: (last_acked & 0xFFFF) as u16,
                        })
                        .await?;
                        continue;
                    }
                    if full != last_acked + 1 {
                        // A block was skipped: windowing only changes how
                        // often we ACK, never how sequential DATA must
                        // arrive, so any forward gap is a protocol error,
                        // not a bigger window to tolerate.
                        return Err(TftpError::OutOfWindow);
                    }
                    let is_short = payload.len() < blksize as usize;
                    data.write(offset, &payload)?;
                    offset += payload.len() as u64;
                    bytes_received += payload.len() as u64;
                    last_acked = full;
                    since_ack += 1;
                    retransmits = 0;
                    if since_ack == windowsize || is_short {
                        self.send_packet(&Packet::Ack {
                            block: (last_acked & 0xFFFF) as u16,
                        })
                        .await?;
                        since_ack = 0;
                    }
                    if is_short {
                        break;
                    }
                }
                Some(Packet::Error { message, .. }) => {
                    return Err(TftpError::Tftp(format!(
                        "peer aborted transfer: {message}"
                    )));
                }
                Some(_) => continue,
            }
        }

        Ok(TransferStats {
            bytes: bytes_received,
            blocks: last_acked,
        })
    }

    /// Best-effort send of a synthesized ERROR packet from the sticky
    /// error slot (§4.5 "error_and_stop"); never fails the caller.
    pub async fn send_error_best_effort(&self, error: &TftpError) {
        let code = error.wire_code();
        let message = error.to_string();
        let _ = self
            .send_packet(&Packet::Error { code, message })
            .await;
    }
}

/// Reconstructs the full 64-bit block counter from a 16-bit wire value,
/// choosing the candidate nearest `reference` in the cyclic u16 window
/// (§4.5 "Block numbering").
pub fn reconstruct_block(reference: u64, wire: u16) -> u64 {
    let wire = wire as i128;
    let reference_i = reference as i128;
    let base = reference_i - reference_i.rem_euclid(65536);
    let candidates = [base - 65536 + wire, base + wire, base + 65536 + wire];
    let best = candidates
        .into_iter()
        .filter(|&c| c >= 0)
        .min_by_key(|&c| (c - reference_i).abs())
        .unwrap_or(wire);
    best as u64
}
