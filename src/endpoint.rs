// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use log::*;
use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;

use crate::connection::Download;
use crate::connection::Session;
use crate::packet;
use crate::packet::PacketHeader;
use crate::packet::PacketType;
use crate::ChunkHash;
use crate::ChunkStore;
use crate::Config;
use crate::CongestionState;
use crate::Error;
use crate::PacketSendHandler;
use crate::Result;
use crate::TransportHandler;
use crate::HASH_LEN;
use crate::HEADER_LEN;
use crate::MAX_DATAGRAM_SIZE;

/// Most digests carried by one WHOHAS/IHAVE packet.
const MAX_HASHES_PER_PACKET: usize = (MAX_DATAGRAM_SIZE - HEADER_LEN) / HASH_LEN;

/// Endpoint is the transport driver of a peer.
///
/// It owns the chunk store and every transfer session, dispatches incoming
/// datagrams, and runs the retransmission timeout sweep. The endpoint does
/// no I/O: the application reads datagrams from its socket and feeds them to
/// `recv()`, calls `on_timeout()` once per tick, and receives outgoing
/// datagrams through the `PacketSendHandler`.
pub struct Endpoint {
    /// Configurations.
    config: Config,

    /// Chunks held by this peer.
    store: ChunkStore,

    /// Sending sessions, one per requesting peer.
    uploads: FxHashMap<SocketAddr, Session>,

    /// Receiving sessions, one per serving peer.
    downloads: FxHashMap<SocketAddr, Download>,

    /// Chunks of the current download request that are still missing, in
    /// request order.
    wanted: Vec<ChunkHash>,

    /// Wanted chunks with a GET outstanding.
    requested: FxHashSet<ChunkHash>,

    /// Chunks each peer announced with IHAVE.
    holders: FxHashMap<SocketAddr, FxHashSet<ChunkHash>>,

    /// Transfer completion callbacks.
    handler: Box<dyn TransportHandler>,

    /// Packet sending callbacks.
    sender: Rc<dyn PacketSendHandler>,

    /// Unique trace id for debug logging.
    trace_id: String,
}

impl Endpoint {
    /// Create an endpoint serving the chunks of `store`.
    pub fn new(
        config: Config,
        store: ChunkStore,
        handler: Box<dyn TransportHandler>,
        sender: Rc<dyn PacketSendHandler>,
    ) -> Self {
        let trace_id = format!("PEER-{}", config.identity);
        Endpoint {
            config,
            store,
            uploads: FxHashMap::default(),
            downloads: FxHashMap::default(),
            wanted: Vec::new(),
            requested: FxHashSet::default(),
            holders: FxHashMap::default(),
            handler,
            sender,
            trace_id,
        }
    }

    /// Start downloading the given chunks.
    ///
    /// Chunks already held are skipped. WHOHAS for the rest is flooded to
    /// every other known peer. If nothing is missing, the download completes
    /// right away. Transfers of an earlier request keep running until they
    /// complete, so their uploaders get every ack.
    pub fn download(&mut self, hashes: &[ChunkHash]) -> Result<()> {
        self.wanted.clear();
        self.holders.clear();
        self.requested = self
            .downloads
            .values()
            .filter(|d| !d.is_verified())
            .map(|d| *d.hash())
            .collect();

        for hash in hashes {
            if !self.store.contains(hash) && !self.wanted.contains(hash) {
                self.wanted.push(*hash);
            }
        }
        info!(
            "{} download {} chunks, {} missing",
            self.trace_id,
            hashes.len(),
            self.wanted.len()
        );

        if self.wanted.is_empty() {
            self.handler.on_download_complete();
            return Ok(());
        }

        let peers: Vec<SocketAddr> = self
            .config
            .peers
            .iter()
            .filter(|(id, _)| *id != self.config.identity)
            .map(|(_, addr)| *addr)
            .collect();
        if peers.is_empty() {
            return Err(Error::InvalidConfig("no peer to ask".into()));
        }

        let mut pkts = Vec::new();
        for batch in self.wanted.chunks(MAX_HASHES_PER_PACKET) {
            let payload = packet::encode_hashes(batch);
            for peer in &peers {
                pkts.push((self.build(PacketType::WhoHas, 0, 0, &payload)?, *peer));
            }
        }
        self.send(&pkts);
        Ok(())
    }

    /// Process a datagram received from `src`.
    ///
    /// Malformed datagrams are dropped and the parse error is returned.
    pub fn recv(&mut self, buf: &[u8], src: SocketAddr, now: Instant) -> Result<()> {
        let (hdr, payload) = match packet::parse(buf) {
            Ok(v) => v,
            Err(e) => {
                debug!("{} drop malformed packet from {}: {:?}", self.trace_id, src, e);
                return Err(e);
            }
        };
        trace!(
            "{} recv {} from {} seq {} ack {} len {}",
            self.trace_id,
            hdr.pkt_type,
            src,
            hdr.seq,
            hdr.ack,
            payload.len()
        );

        let ret = match hdr.pkt_type {
            PacketType::WhoHas => self.on_whohas(src, payload),
            PacketType::IHave => self.on_ihave(src, payload),
            PacketType::Get => self.on_get(src, payload, now),
            PacketType::Data => self.on_data(src, &hdr, payload),
            PacketType::Ack => self.on_ack(src, hdr.ack, now),
            PacketType::Denied => self.on_denied(src),
        };
        match &ret {
            Err(e) if e.is_malformed() => debug!(
                "{} drop malformed {} from {}: {:?}",
                self.trace_id, hdr.pkt_type, src, e
            ),
            Err(e) => trace!(
                "{} ignore {} from {}: {:?}",
                self.trace_id, hdr.pkt_type, src, e
            ),
            Ok(_) => (),
        }
        ret
    }

    /// Run the retransmission timeout sweep.
    ///
    /// Every session whose timer has been running longer than its timeout
    /// goes back to the timed segment and doubles its timeout. Sessions
    /// beyond the consecutive timeout limit are evicted.
    pub fn on_timeout(&mut self, now: Instant) {
        let mut aborted = Vec::new();
        for (peer, session) in self.uploads.iter_mut() {
            if !session.is_timer_expired(now) {
                continue;
            }

            if let Some(max) = self.config.max_consecutive_timeouts {
                if session.consecutive_timeouts() >= max {
                    aborted.push(*peer);
                    continue;
                }
            }

            session.on_timeout(now, self.sender.as_ref());
            session.backoff();
        }

        for peer in aborted {
            if let Some(session) = self.uploads.remove(&peer) {
                warn!(
                    "{} abort sending chunk {} after {} timeouts",
                    session.trace_id(),
                    session.chunk().hash(),
                    session.consecutive_timeouts()
                );
                self.handler.on_upload_aborted(peer, session.chunk().hash());
            }
        }
    }

    fn on_whohas(&mut self, src: SocketAddr, payload: &[u8]) -> Result<()> {
        let hashes = packet::decode_hashes(payload)?;

        if self.uploads.len() >= self.config.max_concurrent_sends {
            debug!(
                "{} deny {}, {} uploads in progress",
                self.trace_id,
                src,
                self.uploads.len()
            );
            let pkt = self.build(PacketType::Denied, 0, 0, &[])?;
            self.send(&[(pkt, src)]);
            return Ok(());
        }

        let held: Vec<ChunkHash> = hashes
            .into_iter()
            .filter(|h| self.store.contains(h))
            .collect();
        if held.is_empty() {
            return Ok(());
        }

        let mut pkts = Vec::new();
        for batch in held.chunks(MAX_HASHES_PER_PACKET) {
            let payload = packet::encode_hashes(batch);
            pkts.push((self.build(PacketType::IHave, 0, 0, &payload)?, src));
        }
        self.send(&pkts);
        Ok(())
    }

    fn on_ihave(&mut self, src: SocketAddr, payload: &[u8]) -> Result<()> {
        let hashes = packet::decode_hashes(payload)?;
        self.holders.entry(src).or_default().extend(hashes);
        self.request_from(src)?;
        Ok(())
    }

    fn on_get(&mut self, src: SocketAddr, payload: &[u8], now: Instant) -> Result<()> {
        let hashes = packet::decode_hashes(payload)?;
        if hashes.len() != 1 {
            return Err(Error::InvalidPacket);
        }
        let hash = hashes[0];

        let chunk = match self.store.get(&hash) {
            Some(chunk) => chunk.clone(),
            None => {
                debug!("{} deny {}, chunk {} not held", self.trace_id, src, hash);
                let pkt = self.build(PacketType::Denied, 0, 0, &[])?;
                self.send(&[(pkt, src)]);
                return Err(Error::UnknownChunk(hash.to_string()));
            }
        };

        let mut session = Session::new(src, chunk, &self.config);
        session.start(now, self.sender.as_ref())?;
        if let Some(old) = self.uploads.insert(src, session) {
            debug!(
                "{} replace session of chunk {}",
                old.trace_id(),
                old.chunk().hash()
            );
        }
        Ok(())
    }

    fn on_data(&mut self, src: SocketAddr, hdr: &PacketHeader, payload: &[u8]) -> Result<()> {
        let download = match self.downloads.get_mut(&src) {
            Some(d) => d,
            None => return Err(Error::InvalidState(format!("no download from {}", src))),
        };

        let ack = download.on_data(hdr.seq, payload);
        let complete = download.is_complete() && !download.is_verified();
        let pkt = self.build(PacketType::Ack, 0, ack, &[])?;
        self.send(&[(pkt, src)]);

        if complete {
            self.on_download_finished(src)?;
        }
        Ok(())
    }

    fn on_download_finished(&mut self, src: SocketAddr) -> Result<()> {
        let download = match self.downloads.get_mut(&src) {
            Some(d) => d,
            None => return Ok(()),
        };
        let hash = *download.hash();
        self.requested.remove(&hash);

        match download.verify() {
            Ok(chunk) => {
                info!("{} got chunk {} from {}", self.trace_id, hash, src);
                let was_wanted = self.wanted.contains(&hash);
                self.wanted.retain(|h| *h != hash);
                self.handler.on_download_finished(src, &chunk);
                self.store.insert(chunk);

                if was_wanted && self.wanted.is_empty() {
                    info!("{} download complete", self.trace_id);
                    self.handler.on_download_complete();
                    return Ok(());
                }
            }
            Err(e) => {
                warn!(
                    "{} drop chunk {} from {}: {:?}",
                    self.trace_id, hash, src, e
                );
                self.downloads.remove(&src);
            }
        }

        self.request_next()
    }

    fn on_ack(&mut self, src: SocketAddr, ack: u32, now: Instant) -> Result<()> {
        let session = match self.uploads.get_mut(&src) {
            Some(s) => s,
            None => return Err(Error::InvalidState(format!("no upload to {}", src))),
        };

        if session.transit(ack, now, self.sender.as_ref())? == CongestionState::Finished {
            if let Some(session) = self.uploads.remove(&src) {
                self.handler
                    .on_upload_finished(src, session.chunk().hash());
            }
        }
        Ok(())
    }

    fn on_denied(&mut self, src: SocketAddr) -> Result<()> {
        if let Some(download) = self.downloads.get(&src) {
            if download.is_verified() {
                return Ok(());
            }
            debug!(
                "{} {} denied chunk {}",
                self.trace_id,
                src,
                download.hash()
            );
            self.requested.remove(download.hash());
            self.downloads.remove(&src);
        }

        // Let another holder serve the released chunk.
        for peer in self.holder_peers() {
            if peer != src {
                self.request_from(peer)?;
            }
        }
        Ok(())
    }

    /// Request a wanted chunk from every known holder that is idle.
    fn request_next(&mut self) -> Result<()> {
        for peer in self.holder_peers() {
            self.request_from(peer)?;
        }
        Ok(())
    }

    /// Send GET to `peer` for the first wanted chunk it holds that is not
    /// requested yet, unless a download from `peer` is in progress.
    fn request_from(&mut self, peer: SocketAddr) -> Result<()> {
        if self.is_downloading_from(&peer) {
            return Ok(());
        }
        let held = match self.holders.get(&peer) {
            Some(held) => held,
            None => return Ok(()),
        };
        let hash = match self
            .wanted
            .iter()
            .find(|h| held.contains(*h) && !self.requested.contains(*h))
        {
            Some(h) => *h,
            None => return Ok(()),
        };

        debug!("{} request chunk {} from {}", self.trace_id, hash, peer);
        let pkt = self.build(PacketType::Get, 0, 0, hash.as_bytes())?;
        self.send(&[(pkt, peer)]);

        self.requested.insert(hash);
        self.downloads.insert(peer, Download::new(peer, hash));
        Ok(())
    }

    fn holder_peers(&self) -> Vec<SocketAddr> {
        let mut peers: Vec<SocketAddr> = self.holders.keys().copied().collect();
        peers.sort();
        peers
    }

    fn is_downloading_from(&self, peer: &SocketAddr) -> bool {
        self.downloads
            .get(peer)
            .map_or(false, |d| !d.is_verified())
    }

    fn build(&self, pkt_type: PacketType, seq: u32, ack: u32, payload: &[u8]) -> Result<Vec<u8>> {
        packet::encode(pkt_type, self.config.source_id, seq, ack, payload)
    }

    fn send(&self, pkts: &[(Vec<u8>, SocketAddr)]) {
        if let Err(e) = self.sender.on_packets_send(pkts) {
            warn!("{} send {} packets failed: {:?}", self.trace_id, pkts.len(), e);
        }
    }

    /// Return the chunk store.
    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Return the sending session to `peer`.
    pub fn upload(&self, peer: &SocketAddr) -> Option<&Session> {
        self.uploads.get(peer)
    }

    /// Return the number of sending sessions.
    pub fn upload_count(&self) -> usize {
        self.uploads.len()
    }

    /// Return the receiving session from `peer`.
    pub fn download_from(&self, peer: &SocketAddr) -> Option<&Download> {
        self.downloads.get(peer)
    }

    /// Return the chunks of the current request that are still missing.
    pub fn wanted(&self) -> &[ChunkHash] {
        &self.wanted
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }
}
