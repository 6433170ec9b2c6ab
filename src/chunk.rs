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

//! Content-addressed chunks and their segment layout.

use std::fmt;
use std::fs;
use std::io::Write;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;

use bytes::Bytes;
use log::*;
use ring::digest;
use rustc_hash::FxHashMap;

use crate::Error;
use crate::Result;
use crate::CHUNK_DATA_SIZE;
use crate::HASH_LEN;
use crate::SEGMENT_SIZE;

/// SHA-1 digest identifying a chunk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChunkHash([u8; HASH_LEN]);

impl ChunkHash {
    pub fn new(digest: [u8; HASH_LEN]) -> Self {
        ChunkHash(digest)
    }

    /// Compute the digest of the given chunk data.
    pub fn digest(data: &[u8]) -> Self {
        let d = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, data);
        let mut hash = [0_u8; HASH_LEN];
        hash.copy_from_slice(d.as_ref());
        ChunkHash(hash)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for ChunkHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<ChunkHash> {
        let v = hex::decode(s.trim())?;
        if v.len() != HASH_LEN {
            return Err(Error::InvalidConfig(format!("bad digest length {}", v.len())));
        }

        let mut hash = [0_u8; HASH_LEN];
        hash.copy_from_slice(&v);
        Ok(ChunkHash(hash))
    }
}

/// An immutable chunk viewed as a sequence of segments.
///
/// Segments are addressed by 1-based sequence numbers. Every segment is
/// `SEGMENT_SIZE` bytes long except possibly the last one.
#[derive(Clone)]
pub struct Chunk {
    hash: ChunkHash,
    data: Bytes,
}

impl Chunk {
    /// Create a chunk and compute its digest.
    pub fn new(data: Bytes) -> Self {
        Chunk {
            hash: ChunkHash::digest(&data),
            data,
        }
    }

    /// Create a chunk whose data must match the given digest.
    pub fn with_hash(hash: ChunkHash, data: Bytes) -> Result<Self> {
        let chunk = Chunk::new(data);
        if chunk.hash != hash {
            return Err(Error::InvalidChunk(format!(
                "expect {} but got {}",
                hash, chunk.hash
            )));
        }
        Ok(chunk)
    }

    pub fn hash(&self) -> &ChunkHash {
        &self.hash
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Return the number of segments, i.e. the largest valid sequence number.
    pub fn segment_count(&self) -> u32 {
        ((self.data.len() + SEGMENT_SIZE - 1) / SEGMENT_SIZE) as u32
    }

    /// Return the byte range of segment `seq`.
    pub fn segment_range(&self, seq: u32) -> Result<Range<usize>> {
        if seq == 0 || seq > self.segment_count() {
            return Err(Error::InvalidSegment(seq));
        }

        let start = (seq as usize - 1) * SEGMENT_SIZE;
        let end = std::cmp::min(seq as usize * SEGMENT_SIZE, self.data.len());
        Ok(start..end)
    }

    /// Return the payload of segment `seq`.
    pub fn segment(&self, seq: u32) -> Result<Bytes> {
        let range = self.segment_range(seq)?;
        Ok(self.data.slice(range))
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Chunk({}, {} bytes)", self.hash, self.data.len())
    }
}

/// Chunks held by this peer.
///
/// A fragment file is a sequence of records, each made of a 20-byte digest
/// followed by `CHUNK_DATA_SIZE` bytes of chunk data.
#[derive(Default)]
pub struct ChunkStore {
    chunks: FxHashMap<ChunkHash, Chunk>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every chunk of a fragment file, verifying the digests.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let buf = Bytes::from(fs::read(path.as_ref())?);
        let record_len = HASH_LEN + CHUNK_DATA_SIZE;
        if buf.len() % record_len != 0 {
            return Err(Error::InvalidChunk(format!(
                "fragment size {} is not a multiple of {}",
                buf.len(),
                record_len
            )));
        }

        let mut store = ChunkStore::new();
        for start in (0..buf.len()).step_by(record_len) {
            let mut hash = [0_u8; HASH_LEN];
            hash.copy_from_slice(&buf[start..start + HASH_LEN]);
            let data = buf.slice(start + HASH_LEN..start + record_len);
            store.insert(Chunk::with_hash(ChunkHash::new(hash), data)?);
        }

        debug!(
            "loaded {} chunks from {}",
            store.len(),
            path.as_ref().display()
        );
        Ok(store)
    }

    /// Write every chunk to a fragment file, ordered by digest.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut hashes: Vec<&ChunkHash> = self.chunks.keys().collect();
        hashes.sort();

        let mut file = fs::File::create(path.as_ref())?;
        for hash in hashes {
            let chunk = &self.chunks[hash];
            file.write_all(hash.as_bytes())?;
            file.write_all(chunk.data())?;
        }
        file.flush()?;
        Ok(())
    }

    /// Add a chunk, replacing any chunk with the same digest.
    pub fn insert(&mut self, chunk: Chunk) {
        self.chunks.insert(*chunk.hash(), chunk);
    }

    pub fn get(&self, hash: &ChunkHash) -> Option<&Chunk> {
        self.chunks.get(hash)
    }

    pub fn contains(&self, hash: &ChunkHash) -> bool {
        self.chunks.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Return the digests of all held chunks.
    pub fn hashes(&self) -> impl Iterator<Item = &ChunkHash> {
        self.chunks.keys()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a full-size chunk filled with a pattern derived from `seed`.
    pub(crate) fn test_chunk(seed: u8) -> Chunk {
        let data: Vec<u8> = (0..CHUNK_DATA_SIZE)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();
        Chunk::new(Bytes::from(data))
    }

    #[test]
    fn chunk_hash_digest() -> Result<()> {
        // SHA-1("abc")
        let hash = ChunkHash::digest(b"abc");
        assert_eq!(
            format!("{}", hash),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            ChunkHash::from_str("a9993e364706816aba3e25717850c26c9cd0d89d")?,
            hash
        );
        assert!(ChunkHash::from_str("a9993e").is_err());
        assert!(ChunkHash::from_str("not hex").is_err());
        Ok(())
    }

    #[test]
    fn chunk_segments() -> Result<()> {
        let chunk = test_chunk(1);
        assert_eq!(chunk.len(), CHUNK_DATA_SIZE);
        assert_eq!(chunk.segment_count(), 512);

        assert_eq!(chunk.segment_range(1)?, 0..1024);
        assert_eq!(chunk.segment_range(512)?, 511 * 1024..512 * 1024);
        assert_eq!(chunk.segment(2)?, chunk.data().slice(1024..2048));
        assert_eq!(chunk.segment(0), Err(Error::InvalidSegment(0)));
        assert_eq!(chunk.segment(513), Err(Error::InvalidSegment(513)));
        Ok(())
    }

    #[test]
    fn chunk_short_last_segment() -> Result<()> {
        let chunk = Chunk::new(Bytes::from(vec![7_u8; 2500]));
        assert_eq!(chunk.segment_count(), 3);
        assert_eq!(chunk.segment(3)?.len(), 452);

        let empty = Chunk::new(Bytes::new());
        assert!(empty.is_empty());
        assert_eq!(empty.segment_count(), 0);
        assert!(empty.segment(1).is_err());
        Ok(())
    }

    #[test]
    fn chunk_with_hash() {
        let chunk = test_chunk(2);
        let data = chunk.data().clone();
        assert!(Chunk::with_hash(*chunk.hash(), data.clone()).is_ok());
        assert!(matches!(
            Chunk::with_hash(ChunkHash::default(), data),
            Err(Error::InvalidChunk(_))
        ));
    }

    #[test]
    fn store_save_and_load() -> Result<()> {
        let mut store = ChunkStore::new();
        let (a, b) = (test_chunk(3), test_chunk(4));
        store.insert(a.clone());
        store.insert(b.clone());
        assert_eq!(store.len(), 2);
        assert!(store.contains(a.hash()));

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.fragment");
        store.save(&path)?;
        assert_eq!(
            fs::metadata(&path)?.len() as usize,
            2 * (HASH_LEN + CHUNK_DATA_SIZE)
        );

        let loaded = ChunkStore::load(&path)?;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(b.hash()).map(|c| c.data()), Some(b.data()));
        Ok(())
    }

    #[test]
    fn store_load_corrupted() -> Result<()> {
        let dir = tempfile::tempdir()?;

        // Truncated record.
        let path = dir.path().join("short.fragment");
        fs::write(&path, [0_u8; 100])?;
        assert!(matches!(
            ChunkStore::load(&path),
            Err(Error::InvalidChunk(_))
        ));

        // Digest mismatch.
        let chunk = test_chunk(5);
        let path = dir.path().join("bad.fragment");
        let mut buf = vec![0_u8; HASH_LEN];
        buf.extend_from_slice(chunk.data());
        fs::write(&path, buf)?;
        assert!(matches!(
            ChunkStore::load(&path),
            Err(Error::InvalidChunk(_))
        ));

        // Missing file.
        assert!(matches!(
            ChunkStore::load(dir.path().join("missing")),
            Err(Error::IoError(_))
        ));
        Ok(())
    }
}
