// Copyright (c) 2024, The QuicVeil Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! # Core Connection Manager
//!
//! This module provides the central `QuicVeilConnection` struct, which
//! orchestrates the crypto, FEC, stealth, and path MTU discovery modules to
//! manage a full QUIC connection lifecycle. MTU probes and responses travel
//! as sealed QUIC DATAGRAM control frames; the `ProbeLink` adapter bridges
//! the MTU manager's outbound calls onto the transport queue.

use quiche::h3::NameValue;

use crate::crypto::{CipherSuiteSelector, CryptoManager, NONCE_LEN};
use crate::error::ConnectionError;
use crate::fec::{FecConfig, Shard, XorFec, SHARD_HEADER_LEN};
use crate::mtu::{ConnectionAdapter, MtuConfig, MtuDirection, MtuStatus, PathMtuManager};
use crate::optimize::MemoryPool;
use crate::stealth::{StealthConfig, StealthManager};
use crate::telemetry;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Approximate QUIC short-header, DATAGRAM-frame, and AEAD overhead between
/// a control frame's plaintext and the UDP datagram that carries it. Probe
/// plaintexts are padded so the datagram lands near the probed size.
const PROBE_WIRE_OVERHEAD: usize = 96;

/// Control frames exchanged by the two MTU managers. Opaque to the manager
/// itself; the ids and sizes are all it sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum MtuFrame {
    /// A padded probe. `requested` marks probes the receiver solicited for
    /// its own incoming-path discovery; their arrival is the acknowledgment.
    Probe { id: u32, size: u16, requested: bool },
    /// Asks the peer to emit `Probe { id, size, requested: true }` back.
    ProbeRequest { id: u32, size: u16 },
    /// Response to an unsolicited probe.
    Ack { id: u32, success: bool },
}

/// Bridges the MTU manager's outbound calls onto the connection. Frames are
/// queued without blocking and drained by the connection's send path, so the
/// manager's lock is never re-entered.
pub struct ProbeLink {
    next_probe_id: AtomicU32,
    queue: Mutex<VecDeque<MtuFrame>>,
    published_mtu: AtomicU16,
}

impl ProbeLink {
    fn new(initial_mtu: u16) -> Self {
        Self {
            next_probe_id: AtomicU32::new(1),
            queue: Mutex::new(VecDeque::new()),
            published_mtu: AtomicU16::new(initial_mtu),
        }
    }

    fn drain(&self) -> Vec<MtuFrame> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    /// The last outgoing MTU the manager published.
    pub fn published_mtu(&self) -> u16 {
        self.published_mtu.load(Ordering::SeqCst)
    }
}

impl ConnectionAdapter for ProbeLink {
    fn send_probe(&self, size: u16, direction: MtuDirection) -> u32 {
        let id = self.next_probe_id.fetch_add(1, Ordering::SeqCst);
        let frame = match direction {
            MtuDirection::Outgoing => MtuFrame::Probe {
                id,
                size,
                requested: false,
            },
            MtuDirection::Incoming => MtuFrame::ProbeRequest { id, size },
        };
        self.queue.lock().unwrap().push_back(frame);
        id
    }

    fn send_probe_response(&self, probe_id: u32, success: bool) {
        self.queue
            .lock()
            .unwrap()
            .push_back(MtuFrame::Ack {
                id: probe_id,
                success,
            });
    }

    fn set_mtu_size(&self, size: u16) {
        self.published_mtu.store(size, Ordering::SeqCst);
    }
}

/// Derives labeled key material from a shared secret.
fn derive_key(label: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(secret);
    hasher.finalize().to_vec()
}

/// Seals control frames with the session AEAD. The key is derived from the
/// initial connection ID so both endpoints agree without extra signaling.
struct FrameSealer {
    selector: CipherSuiteSelector,
    crypto: Arc<CryptoManager>,
    key: Vec<u8>,
}

impl FrameSealer {
    const FRAME_AD: &'static [u8] = b"quicveil-mtu-frame";

    fn new(secret: &[u8], crypto: Arc<CryptoManager>) -> Self {
        Self {
            selector: CipherSuiteSelector::new(),
            crypto,
            key: derive_key(Self::FRAME_AD, secret),
        }
    }

    /// Serializes and seals a frame. Probe frames are padded so the carrying
    /// datagram approaches the probed size on the wire.
    fn seal(&self, frame: &MtuFrame) -> Result<Vec<u8>, ConnectionError> {
        let mut plain =
            bincode::serialize(frame).map_err(|e| ConnectionError::Frame(e.to_string()))?;
        if let MtuFrame::Probe { size, .. } = frame {
            let target = (*size as usize).saturating_sub(PROBE_WIRE_OVERHEAD);
            if plain.len() < target {
                plain.resize(target, 0);
            }
        }
        let nonce = self.crypto.generate_nonce();
        let sealed = self
            .selector
            .encrypt(&self.key, &nonce, Self::FRAME_AD, &plain)
            .map_err(ConnectionError::Crypto)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn open(&self, raw: &[u8]) -> Result<MtuFrame, ConnectionError> {
        if raw.len() < NONCE_LEN {
            return Err(ConnectionError::Frame("control datagram too short".into()));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = self
            .selector
            .decrypt(&self.key, nonce, Self::FRAME_AD, sealed)
            .map_err(ConnectionError::Crypto)?;
        bincode::deserialize(&plain).map_err(|e| ConnectionError::Frame(e.to_string()))
    }
}

/// Tracks performance and reliability metrics for a connection.
#[derive(Default, Debug, Clone)]
pub struct ConnectionStats {
    pub rtt: f32,
    pub loss_rate: f32,
    pub packets_sent: u64,
    pub packets_lost: u64,
}

/// Represents a single QuicVeil connection and manages its state.
pub struct QuicVeilConnection {
    pub conn: quiche::Connection,
    pub peer_addr: SocketAddr,
    local_addr: SocketAddr,
    host_header: String,

    // Core modules
    fec: XorFec,
    stealth_manager: Arc<StealthManager>,
    mtu_manager: Arc<PathMtuManager>,
    probe_link: Arc<ProbeLink>,
    frame_sealer: FrameSealer,
    crypto_manager: Arc<CryptoManager>,
    mem_pool: Arc<MemoryPool>,

    // State
    mtu_ceiling: u16,
    stats: ConnectionStats,
    outgoing_shards: VecDeque<Shard>,
    h3_conn: Option<quiche::h3::Connection>,
    last_telemetry: Instant,
}

impl QuicVeilConnection {
    /// Creates a new client connection.
    pub fn new_client(
        server_name: &str,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        mut config: quiche::Config,
        stealth_config: StealthConfig,
        fec_config: FecConfig,
        mtu_config: MtuConfig,
    ) -> Result<Self, ConnectionError> {
        config.enable_dgram(true, 128, 128);
        // quiche may emit packets up to the probing ceiling; the validated
        // MTU caps regular packets in `send`.
        config.set_max_send_udp_payload_size(mtu_config.max_mtu as usize);

        let crypto_manager = Arc::new(CryptoManager::new());
        let stealth_manager = Arc::new(StealthManager::new(stealth_config, crypto_manager.clone()));

        let scid = quiche::ConnectionId::from_ref(&[0; quiche::MAX_CONN_ID_LEN]);
        let (sni, host_header) = stealth_manager.get_connection_headers(server_name);

        let conn = quiche::connect(Some(&sni), &scid, local_addr, remote_addr, &mut config)?;

        Self::new(
            conn,
            &scid,
            local_addr,
            remote_addr,
            host_header,
            stealth_manager,
            crypto_manager,
            fec_config,
            mtu_config,
        )
    }

    /// Creates a new server-side connection for an accepted client.
    pub fn new_server(
        scid: &quiche::ConnectionId,
        odcid: Option<&quiche::ConnectionId>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        mut config: quiche::Config,
        stealth_config: StealthConfig,
        fec_config: FecConfig,
        mtu_config: MtuConfig,
    ) -> Result<Self, ConnectionError> {
        config.enable_dgram(true, 128, 128);
        config.set_max_send_udp_payload_size(mtu_config.max_mtu as usize);

        let crypto_manager = Arc::new(CryptoManager::new());
        let stealth_manager = Arc::new(StealthManager::new(stealth_config, crypto_manager.clone()));

        let conn = quiche::accept(scid, odcid, local_addr, remote_addr, &mut config)?;

        Self::new(
            conn,
            scid,
            local_addr,
            remote_addr,
            String::new(),
            stealth_manager,
            crypto_manager,
            fec_config,
            mtu_config,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        conn: quiche::Connection,
        cid: &quiche::ConnectionId,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        host_header: String,
        stealth_manager: Arc<StealthManager>,
        crypto_manager: Arc<CryptoManager>,
        fec_config: FecConfig,
        mtu_config: MtuConfig,
    ) -> Result<Self, ConnectionError> {
        let probe_link = Arc::new(ProbeLink::new(mtu_config.min_mtu));
        let mtu_ceiling = mtu_config.max_mtu;
        let adapter: Arc<dyn ConnectionAdapter> = probe_link.clone();
        let mtu_manager = Arc::new(PathMtuManager::new(mtu_config, adapter)?);
        let frame_sealer = FrameSealer::new(cid.as_ref(), crypto_manager.clone());
        stealth_manager.set_obfuscation_key(derive_key(b"quicveil-xor-key", cid.as_ref()));

        Ok(Self {
            conn,
            peer_addr,
            local_addr,
            host_header,
            fec: XorFec::new(fec_config),
            stealth_manager,
            mtu_manager,
            probe_link,
            frame_sealer,
            crypto_manager,
            mem_pool: Arc::new(MemoryPool::new(1024, 4096)),
            mtu_ceiling,
            stats: ConnectionStats::default(),
            outgoing_shards: VecDeque::new(),
            h3_conn: None,
            last_telemetry: Instant::now(),
        })
    }

    /// Re-keys the control-frame sealer and the XOR layer from a shared
    /// secret both endpoints know, typically the client's source CID.
    pub fn set_control_secret(&mut self, secret: &[u8]) {
        self.frame_sealer = FrameSealer::new(secret, self.crypto_manager.clone());
        self.stealth_manager
            .set_obfuscation_key(derive_key(b"quicveil-xor-key", secret));
    }

    /// Kicks off path MTU discovery. Call once the handshake completes; the
    /// incoming direction follows automatically when bidirectional discovery
    /// is enabled.
    pub fn start_mtu_discovery(&mut self) {
        self.mtu_manager.start();
        self.flush_mtu_frames();
    }

    /// The path MTU manager, e.g. for status queries or an explicit restart
    /// after migration.
    pub fn mtu_manager(&self) -> Arc<PathMtuManager> {
        self.mtu_manager.clone()
    }

    /// The outgoing MTU currently published to this connection.
    pub fn active_mtu(&self) -> u16 {
        self.probe_link.published_mtu()
    }

    /// Processes an incoming raw UDP payload: FEC decode, deobfuscation,
    /// QUIC ingestion, and control datagram dispatch.
    pub fn recv(&mut self, data: &[u8]) -> Result<usize, ConnectionError> {
        telemetry!(telemetry::BYTES_RECEIVED.inc_by(data.len() as u64));

        let shard = Shard::from_wire(data).map_err(ConnectionError::Fec)?;
        let payloads = self.fec.on_receive(shard);

        for mut payload in payloads {
            self.stealth_manager.process_incoming_packet(&mut payload);

            let recv_info = quiche::RecvInfo {
                from: self.peer_addr,
                to: self.local_addr,
            };
            if let Err(e) = self.conn.recv(&mut payload, recv_info) {
                // Keep processing other recovered packets.
                error!("quiche::recv failed after FEC decode: {}", e);
            }
        }

        self.process_control_datagrams();
        self.flush_mtu_frames();

        Ok(data.len())
    }

    /// Prepares the next outgoing UDP payload: buffered FEC shards first,
    /// then a fresh QUIC packet wrapped in obfuscation and FEC.
    pub fn send(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        if let Some(shard) = self.outgoing_shards.pop_front() {
            return self.write_shard(shard, buf);
        }

        // Cap the QUIC packet to the validated outgoing MTU, leaving room
        // for the shard framing. Packets carrying queued probe datagrams may
        // ride at the probing ceiling: a probe must exceed the active MTU.
        let mtu = if self.conn.dgram_send_queue_len() > 0 {
            self.mtu_ceiling as usize
        } else {
            self.probe_link.published_mtu() as usize
        };
        let mut block = self.mem_pool.alloc();
        let cap = mtu.saturating_sub(SHARD_HEADER_LEN).min(block.len());

        let write = match self.conn.send(&mut block[..cap]) {
            Ok((write, _send_info)) => write,
            Err(quiche::Error::Done) => {
                self.mem_pool.free(block);
                return Ok(0);
            }
            Err(e) => {
                self.mem_pool.free(block);
                return Err(e.into());
            }
        };

        let mut payload = block[..write].to_vec();
        self.mem_pool.free(block);
        if write == 0 {
            return Ok(0);
        }

        self.stealth_manager.process_outgoing_packet(&mut payload);
        self.fec.on_send(&payload, &mut self.outgoing_shards);

        match self.outgoing_shards.pop_front() {
            Some(shard) => self.write_shard(shard, buf),
            None => Ok(0),
        }
    }

    fn write_shard(&mut self, shard: Shard, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        let wire = shard.to_wire();
        if wire.len() > buf.len() {
            return Err(ConnectionError::Fec("send buffer too small".into()));
        }
        buf[..wire.len()].copy_from_slice(&wire);
        telemetry!(telemetry::BYTES_SENT.inc_by(wire.len() as u64));
        Ok(wire.len())
    }

    /// Drains control frames queued by the MTU manager into QUIC DATAGRAMs.
    /// A frame that cannot be sent is dropped; the manager's timeout sweep
    /// classifies the lost probe as failed.
    fn flush_mtu_frames(&mut self) {
        for frame in self.probe_link.drain() {
            match self.frame_sealer.seal(&frame) {
                Ok(bytes) => {
                    if let Err(e) = self.conn.dgram_send(&bytes) {
                        debug!("MTU control frame not sent: {}", e);
                    }
                }
                Err(e) => error!("Failed to seal MTU control frame: {}", e),
            }
        }
    }

    /// Dispatches received control datagrams to the MTU manager.
    fn process_control_datagrams(&mut self) {
        let mut buf = [0u8; 65535];
        loop {
            let len = match self.conn.dgram_recv(&mut buf) {
                Ok(len) => len,
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    debug!("dgram_recv failed: {}", e);
                    break;
                }
            };
            match self.frame_sealer.open(&buf[..len]) {
                Ok(MtuFrame::Probe {
                    id,
                    size,
                    requested,
                }) => {
                    if requested {
                        // The echo we solicited for incoming discovery; its
                        // arrival proves the size fits the incoming path.
                        self.mtu_manager.on_probe_response(id, true, true);
                    } else {
                        self.mtu_manager.on_incoming_probe(id, size);
                    }
                }
                Ok(MtuFrame::ProbeRequest { id, size }) => {
                    debug!("Peer requested an echo probe of {} bytes", size);
                    let echo = MtuFrame::Probe {
                        id,
                        size,
                        requested: true,
                    };
                    match self.frame_sealer.seal(&echo) {
                        Ok(bytes) => {
                            if let Err(e) = self.conn.dgram_send(&bytes) {
                                debug!("Echo probe not sent: {}", e);
                            }
                        }
                        Err(e) => error!("Failed to seal echo probe: {}", e),
                    }
                }
                Ok(MtuFrame::Ack { id, success }) => {
                    self.mtu_manager.on_probe_response(id, success, false);
                }
                Err(e) => debug!("Undecodable control datagram: {}", e),
            }
        }
    }

    /// Returns the Host header that should be used for HTTP requests when
    /// domain fronting is active.
    pub fn host_header(&self) -> &str {
        &self.host_header
    }

    /// Returns the stealth manager for dynamic profile updates.
    pub fn stealth_manager(&self) -> Arc<StealthManager> {
        self.stealth_manager.clone()
    }

    /// Latest connection statistics snapshot.
    pub fn stats(&self) -> ConnectionStats {
        self.stats.clone()
    }

    /// Triggers connection migration to a new peer address. The MTU search
    /// restarts once quiche validates the new path.
    pub fn migrate_connection(&mut self, new_peer: SocketAddr) -> Result<u64, quiche::Error> {
        self.conn.migrate(self.local_addr, new_peer)
    }

    /// Initializes the HTTP/3 connection if it hasn't been created yet.
    pub fn init_http3(&mut self) -> Result<(), quiche::h3::Error> {
        if self.h3_conn.is_none() {
            let mut h3_cfg = quiche::h3::Config::new()?;
            h3_cfg.set_qpack_max_table_capacity(64 * 1024);
            h3_cfg.set_qpack_blocked_streams(16);

            let h3 = quiche::h3::Connection::with_transport(&mut self.conn, &h3_cfg)?;
            self.h3_conn = Some(h3);
        }
        Ok(())
    }

    /// Sends a masqueraded HTTP/3 GET request using the stealth manager.
    pub fn send_http3_request(&mut self, path: &str) -> Result<(), ConnectionError> {
        self.init_http3()?;
        let host = self.host_header.clone();
        let headers = self
            .stealth_manager
            .get_http3_header_list(&host, path)
            .unwrap_or_else(|| {
                vec![
                    quiche::h3::Header::new(b":method", b"GET"),
                    quiche::h3::Header::new(b":scheme", b"https"),
                    quiche::h3::Header::new(b":authority", host.as_bytes()),
                    quiche::h3::Header::new(b":path", path.as_bytes()),
                ]
            });

        if let Some(ref mut h3) = self.h3_conn {
            h3.send_request(&mut self.conn, &headers, true)?;
            info!("HTTP/3 request sent for {}{}", host, path);
        }
        Ok(())
    }

    /// Polls HTTP/3 events and logs received data.
    pub fn poll_http3(&mut self) -> Result<(), ConnectionError> {
        if let Some(ref mut h3) = self.h3_conn {
            loop {
                match h3.poll(&mut self.conn) {
                    Ok((_stream_id, quiche::h3::Event::Headers { list, .. })) => {
                        for h in list {
                            debug!(
                                "{}: {}",
                                String::from_utf8_lossy(h.name()),
                                String::from_utf8_lossy(h.value())
                            );
                        }
                    }
                    Ok((stream_id, quiche::h3::Event::Data)) => {
                        let mut buf = [0; 4096];
                        while let Ok(read) = h3.recv_body(&mut self.conn, stream_id, &mut buf) {
                            debug!("Received {} bytes on stream {}", read, stream_id);
                        }
                    }
                    Ok((_id, quiche::h3::Event::Finished)) => {}
                    Ok((_id, _event)) => {}
                    Err(quiche::h3::Error::Done) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Update internal state: statistics, FEC redundancy, adaptive MTU, and
    /// probe timeouts. The enclosing event loop calls this once per tick.
    pub fn update_state(&mut self) {
        let stats = self.conn.stats();
        self.stats.packets_sent = stats.sent as u64;
        self.stats.packets_lost = stats.lost as u64;
        if stats.sent > 0 {
            self.stats.loss_rate = stats.lost as f32 / stats.sent as f32;
        }
        let rtt_ms = self
            .conn
            .path_stats()
            .next()
            .map(|p| p.rtt.as_millis() as u32)
            .unwrap_or(0);
        self.stats.rtt = rtt_ms as f32;

        // Feed the adaptive layers.
        self.fec.report_loss(stats.lost, stats.sent);
        self.mtu_manager.adapt(self.stats.loss_rate, rtt_ms);
        self.mtu_manager.process_timeouts();
        self.flush_mtu_frames();

        if self.last_telemetry.elapsed() >= Duration::from_secs(1) {
            telemetry!(telemetry::update_memory_usage());
            self.last_telemetry = Instant::now();
        }

        // Handle path events for connection migration.
        while let Some(event) = self.conn.path_event_next() {
            match event {
                quiche::PathEvent::New(local, peer) => {
                    info!("New path detected: {local}->{peer}");
                }
                quiche::PathEvent::Validated(local, peer) => {
                    info!("Path validated: {local}->{peer}");
                    self.peer_addr = peer;
                    self.local_addr = local;
                    // A new path has a new MTU; re-run discovery on it.
                    if self.mtu_manager.status(MtuDirection::Outgoing) != MtuStatus::Searching {
                        self.mtu_manager.restart(MtuDirection::Outgoing);
                        self.flush_mtu_frames();
                    }
                }
                quiche::PathEvent::FailedValidation(local, peer) => {
                    warn!("Path validation failed: {local}->{peer}");
                }
                quiche::PathEvent::Closed(local, peer) => {
                    info!("Path closed: {local}->{peer}");
                }
                quiche::PathEvent::ReusedSourceConnectionId(seq, old, new) => {
                    info!("CID {seq} reused from {old:?} to {new:?}");
                }
                quiche::PathEvent::PeerMigrated(local, peer) => {
                    info!("Peer migrated: {local}->{peer}");
                    self.peer_addr = peer;
                    self.local_addr = local;
                }
            }
        }
    }

    /// Stops the MTU manager; no probe callbacks fire afterwards.
    pub fn shutdown(&mut self) {
        self.mtu_manager.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer() -> FrameSealer {
        FrameSealer::new(&[7u8; 16], Arc::new(CryptoManager::new()))
    }

    #[test]
    fn control_frame_seal_roundtrip() {
        let s = sealer();
        let frame = MtuFrame::Ack {
            id: 42,
            success: true,
        };
        let wire = s.seal(&frame).unwrap();
        assert_eq!(s.open(&wire).unwrap(), frame);
    }

    #[test]
    fn probe_frames_are_padded_to_size() {
        let s = sealer();
        let frame = MtuFrame::Probe {
            id: 1,
            size: 1400,
            requested: false,
        };
        let wire = s.seal(&frame).unwrap();
        assert!(wire.len() >= 1400 - PROBE_WIRE_OVERHEAD);
        assert_eq!(s.open(&wire).unwrap(), frame);
    }

    #[test]
    fn mismatched_keys_reject_frames() {
        let a = sealer();
        let b = FrameSealer::new(&[9u8; 16], Arc::new(CryptoManager::new()));
        let wire = a
            .seal(&MtuFrame::Ack {
                id: 1,
                success: false,
            })
            .unwrap();
        assert!(b.open(&wire).is_err());
    }

    #[test]
    fn probe_link_allocates_unique_ids() {
        let link = ProbeLink::new(1200);
        let a = link.send_probe(1250, MtuDirection::Outgoing);
        let b = link.send_probe(1300, MtuDirection::Incoming);
        assert_ne!(a, b);
        let frames = link.drain();
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            frames[0],
            MtuFrame::Probe {
                requested: false,
                ..
            }
        ));
        assert!(matches!(frames[1], MtuFrame::ProbeRequest { .. }));
        assert!(link.drain().is_empty());
    }

    #[test]
    fn probe_link_latches_published_mtu() {
        let link = ProbeLink::new(1200);
        assert_eq!(link.published_mtu(), 1200);
        link.set_mtu_size(1452);
        assert_eq!(link.published_mtu(), 1452);
    }
}
