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

use bytes::BytesMut;
use log::*;

use crate::Chunk;
use crate::ChunkHash;
use crate::Result;
use crate::CHUNK_DATA_SIZE;
use crate::SEGMENT_SIZE;

/// The receiving side of a chunk transfer from one peer.
///
/// Only the next expected segment is accepted. Every DATA packet is answered
/// with the cumulative ack, so a gap makes the sender see duplicate acks.
pub struct Download {
    /// The serving peer.
    peer: SocketAddr,

    /// The requested chunk.
    hash: ChunkHash,

    /// Data received in order.
    data: BytesMut,

    /// The cumulative ack.
    last_seq: u32,

    /// Number of segments of a chunk.
    segment_count: u32,

    /// Whether the data has been handed out by `verify()`.
    verified: bool,
}

impl Download {
    pub fn new(peer: SocketAddr, hash: ChunkHash) -> Self {
        Download {
            peer,
            hash,
            data: BytesMut::with_capacity(CHUNK_DATA_SIZE),
            last_seq: 0,
            segment_count: (CHUNK_DATA_SIZE / SEGMENT_SIZE) as u32,
            verified: false,
        }
    }

    /// Process a DATA packet and return the ack to send back.
    pub fn on_data(&mut self, seq: u32, payload: &[u8]) -> u32 {
        if self.is_complete()
            || seq != self.last_seq + 1
            || payload.len() > SEGMENT_SIZE
            || self.data.len() + payload.len() > CHUNK_DATA_SIZE
        {
            trace!(
                "{} discard segment {}, expect {}",
                self.peer,
                seq,
                self.last_seq + 1
            );
            return self.last_seq;
        }

        self.data.extend_from_slice(payload);
        self.last_seq = seq;
        self.last_seq
    }

    /// Return whether every segment has been received.
    pub fn is_complete(&self) -> bool {
        self.last_seq == self.segment_count
    }

    /// Check the received data against the requested digest and hand out the
    /// chunk. The download keeps answering retransmitted DATA afterwards.
    pub fn verify(&mut self) -> Result<Chunk> {
        self.verified = true;
        let data = std::mem::take(&mut self.data).freeze();
        Chunk::with_hash(self.hash, data)
    }

    /// Return whether `verify()` has been called.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn hash(&self) -> &ChunkHash {
        &self.hash
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Return the cumulative ack.
    pub fn last_seq(&self) -> u32 {
        self.last_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::tests::test_chunk;
    use crate::Error;

    fn peer_addr() -> SocketAddr {
        "127.0.0.1:4002".parse().unwrap()
    }

    #[test]
    fn download_in_order() -> Result<()> {
        let chunk = test_chunk(9);
        let mut d = Download::new(peer_addr(), *chunk.hash());

        for seq in 1..=chunk.segment_count() {
            assert!(!d.is_complete());
            assert_eq!(d.on_data(seq, &chunk.segment(seq)?), seq);
        }
        assert!(d.is_complete());
        assert!(!d.is_verified());

        let received = d.verify()?;
        assert_eq!(received.hash(), chunk.hash());
        assert_eq!(received.data(), chunk.data());
        assert!(d.is_verified());

        // Retransmissions after completion are acked with the last segment.
        assert_eq!(d.on_data(512, &chunk.segment(512)?), 512);
        Ok(())
    }

    #[test]
    fn download_out_of_order() -> Result<()> {
        let chunk = test_chunk(10);
        let mut d = Download::new(peer_addr(), *chunk.hash());

        // A gap is answered with the cumulative ack.
        assert_eq!(d.on_data(2, &chunk.segment(2)?), 0);
        assert_eq!(d.on_data(1, &chunk.segment(1)?), 1);
        assert_eq!(d.on_data(3, &chunk.segment(3)?), 1);
        assert_eq!(d.on_data(1, &chunk.segment(1)?), 1);
        assert_eq!(d.on_data(2, &chunk.segment(2)?), 2);

        // Oversized segments are discarded.
        assert_eq!(d.on_data(3, &[0; SEGMENT_SIZE + 1]), 2);
        assert_eq!(d.last_seq(), 2);
        Ok(())
    }

    #[test]
    fn download_digest_mismatch() -> Result<()> {
        let chunk = test_chunk(11);
        let mut d = Download::new(peer_addr(), ChunkHash::default());
        for seq in 1..=chunk.segment_count() {
            d.on_data(seq, &chunk.segment(seq)?);
        }
        assert!(d.is_complete());
        assert!(matches!(d.verify(), Err(Error::InvalidChunk(_))));
        Ok(())
    }
}
