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

//! Chunkswarm moves content-addressed chunks between peers over UDP.
//!
//! Peers locate chunks with a small flooding protocol (WHOHAS/IHAVE/GET) and
//! then transfer the chunk payload with a TCP Reno style reliable transport
//! (DATA/ACK): slow start, congestion avoidance, fast retransmit and fast
//! recovery over a cumulative-acknowledgment Go-Back-N window, with
//! Jacobson/Karn RTT estimation and exponential timeout backoff.
//!
//! ## Components
//!
//! * [`Chunk`]: a chunk viewed as a sequence of 1024-byte segments.
//! * [`connection::rtt::RttEstimator`]: the adaptive retransmission timeout.
//! * [`connection::Session`]: the sending side of one chunk transfer, driven
//!   by the Reno state machine.
//! * [`Endpoint`]: the transport driver. It owns every session, dispatches
//!   datagrams, sweeps timers once per tick and answers discovery messages.
//!
//! The library performs no I/O by itself. Outgoing datagrams are handed to a
//! [`PacketSendHandler`] and transfer outcomes are reported to a
//! [`TransportHandler`]. See `tools/src/bin/peer.rs` for an event loop built
//! on mio.

#![allow(dead_code)]

use std::cmp;
use std::net::SocketAddr;
use std::time::Duration;

/// Protocol identifier carried in every packet header.
pub const MAGIC: u16 = 52305;

/// Default identity tag carried in the source-id header field.
pub const DEFAULT_SOURCE_ID: u8 = 29;

/// The length of the fixed packet header in bytes.
pub const HEADER_LEN: usize = 16;

/// The length of a chunk digest in bytes.
pub const HASH_LEN: usize = 20;

/// The maximum payload of a DATA packet, i.e. the segment size.
pub const SEGMENT_SIZE: usize = 1024;

/// The size of a chunk in bytes.
pub const CHUNK_DATA_SIZE: usize = 512 * 1024;

/// The largest datagram a peer is expected to receive.
pub const MAX_DATAGRAM_SIZE: usize = 1400;

/// Poll interval of the driver's timeout sweep.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// The RTT assumed before any sample is taken.
const INITIAL_RTT: Duration = Duration::from_secs(1);

/// The initial slow start threshold in segments.
const DEFAULT_SSTHRESH: u64 = 64;

/// The smallest slow start threshold in segments.
const MIN_SSTHRESH: u64 = 2;

/// Default number of peers a node serves at the same time.
const DEFAULT_MAX_CONCURRENT_SENDS: usize = 16;

/// A specialized [`Result`] type for chunkswarm operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// Configurations about a chunkswarm endpoint.
#[derive(Clone, Debug)]
pub struct Config {
    /// Identity of this peer in the peer map.
    identity: u32,

    /// Value of the source-id header field.
    source_id: u8,

    /// All known peers, including this one.
    peers: Vec<(u32, SocketAddr)>,

    /// Maximum number of peers served at the same time.
    max_concurrent_sends: usize,

    /// Fixed retransmission timeout. `None` estimates it from RTT samples.
    timeout: Option<Duration>,

    /// Slow start threshold of a new session in segments.
    initial_ssthresh: u64,

    /// Evict a session after this many back-to-back timeouts.
    max_consecutive_timeouts: Option<u32>,
}

impl Config {
    /// Create default configuration.
    ///
    /// The configuration may be customized by calling related set methods.
    ///
    /// ## Examples:
    ///
    /// ```
    /// let mut conf = chunkswarm::Config::new();
    /// conf.set_identity(1);
    /// conf.set_timeout(0);
    /// conf.set_max_concurrent_sends(4);
    /// ```
    pub fn new() -> Self {
        Self {
            identity: 0,
            source_id: DEFAULT_SOURCE_ID,
            peers: Vec::new(),
            max_concurrent_sends: DEFAULT_MAX_CONCURRENT_SENDS,
            timeout: None,
            initial_ssthresh: DEFAULT_SSTHRESH,
            max_consecutive_timeouts: None,
        }
    }

    /// Set the identity of this peer. WHOHAS is never flooded to the peer
    /// entry carrying the same identity.
    pub fn set_identity(&mut self, v: u32) {
        self.identity = v;
    }

    /// Set the source-id field of outgoing packet headers.
    pub fn set_source_id(&mut self, v: u8) {
        self.source_id = v;
    }

    /// Set the peer map as `(identity, address)` pairs.
    pub fn set_peers(&mut self, v: Vec<(u32, SocketAddr)>) {
        self.peers = v;
    }

    /// Set the maximum number of peers served at the same time. Further
    /// requests are answered with DENIED. The value is at least 1.
    pub fn set_max_concurrent_sends(&mut self, v: usize) {
        self.max_concurrent_sends = cmp::max(v, 1);
    }

    /// Set the retransmission timeout in milliseconds. Zero estimates the
    /// timeout from RTT samples, any other value is used as is.
    pub fn set_timeout(&mut self, v: u64) {
        self.timeout = match v {
            0 => None,
            v => Some(Duration::from_millis(v)),
        };
    }

    /// Set the slow start threshold of new sessions in segments.
    pub fn set_initial_ssthresh(&mut self, v: u64) {
        self.initial_ssthresh = cmp::max(v, MIN_SSTHRESH);
    }

    /// Set how many consecutive timeouts a session survives before it is
    /// evicted. `None` keeps retrying forever.
    pub fn set_max_consecutive_timeouts(&mut self, v: Option<u32>) {
        self.max_consecutive_timeouts = v;
    }

    /// Return the identity of this peer.
    pub fn identity(&self) -> u32 {
        self.identity
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// The TransportHandler lists the callbacks used by the endpoint to
/// communicate with the user application code.
pub trait TransportHandler {
    /// Called when a chunk has been fully acknowledged by a peer.
    fn on_upload_finished(&mut self, peer: SocketAddr, hash: &ChunkHash);

    /// Called when a peer stopped acknowledging and its session was evicted.
    fn on_upload_aborted(&mut self, peer: SocketAddr, hash: &ChunkHash);

    /// Called when a chunk has been received and verified.
    fn on_download_finished(&mut self, peer: SocketAddr, chunk: &Chunk);

    /// Called when every chunk of the last download request is held.
    fn on_download_complete(&mut self);
}

/// The PacketSendHandler lists the callbacks used by the endpoint to
/// send packet out.
pub trait PacketSendHandler {
    /// Called when the endpoint is sending packets out.
    ///
    /// On success, `on_packets_send()` returns the number of packets sent.
    /// Packets that were not sent are left to the retransmission machinery.
    fn on_packets_send(&self, pkts: &[(Vec<u8>, SocketAddr)]) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[ctor::ctor]
    fn init() {
        env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .format_timestamp_millis()
            .is_test(true)
            .init();
    }

    #[test]
    fn timeout() {
        let mut config = Config::new();
        assert_eq!(config.timeout, None);

        config.set_timeout(250);
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));

        config.set_timeout(0);
        assert_eq!(config.timeout, None);
    }

    #[test]
    fn initial_ssthresh() {
        let mut config = Config::new();
        assert_eq!(config.initial_ssthresh, DEFAULT_SSTHRESH);

        config.set_initial_ssthresh(0);
        assert_eq!(config.initial_ssthresh, MIN_SSTHRESH);

        config.set_initial_ssthresh(32);
        assert_eq!(config.initial_ssthresh, 32);
    }

    #[test]
    fn max_concurrent_sends() {
        let mut config = Config::default();
        assert_eq!(config.max_concurrent_sends, DEFAULT_MAX_CONCURRENT_SENDS);

        config.set_max_concurrent_sends(0);
        assert_eq!(config.max_concurrent_sends, 1);
    }

    #[test]
    fn chunk_geometry() {
        assert_eq!(CHUNK_DATA_SIZE / SEGMENT_SIZE, 512);
        assert!(HEADER_LEN + SEGMENT_SIZE <= MAX_DATAGRAM_SIZE);
    }
}

pub use crate::chunk::Chunk;
pub use crate::chunk::ChunkHash;
pub use crate::chunk::ChunkStore;
pub use crate::congestion_control::CongestionState;
pub use crate::connection::Session;
pub use crate::endpoint::Endpoint;
pub use crate::error::Error;
pub use crate::packet::PacketHeader;
pub use crate::packet::PacketType;

#[path = "connection/connection.rs"]
pub mod connection;

#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;

pub mod chunk;
mod codec;
pub mod endpoint;
pub mod error;
pub mod packet;
